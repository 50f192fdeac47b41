// AES-128-CBC segment decryption.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use bytes::Bytes;

use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length of an AES-128 key and of a CBC IV, in bytes.
pub const AES_BLOCK_LEN: usize = 16;

/// Decrypt one AES-128-CBC encrypted segment with PKCS#7 padding.
pub fn decrypt_aes128(
    data: &[u8],
    key: &[u8; AES_BLOCK_LEN],
    iv: &[u8; AES_BLOCK_LEN],
) -> Result<Bytes, DownloadError> {
    let plain = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|e| DownloadError::decryption(format!("AES-128 decryption failed: {e}")))?;
    Ok(Bytes::from(plain))
}

/// Parse a playlist IV attribute (`0x...` hex) into raw bytes.
pub fn parse_iv(iv_hex: &str) -> Result<[u8; AES_BLOCK_LEN], DownloadError> {
    let trimmed = iv_hex
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv = [0u8; AES_BLOCK_LEN];
    hex::decode_to_slice(trimmed, &mut iv)
        .map_err(|e| DownloadError::decryption(format!("failed to parse IV '{iv_hex}': {e}")))?;
    Ok(iv)
}

/// The HLS default IV: the segment's media sequence number, big-endian,
/// zero-padded to 16 bytes. Used when the playlist carries no IV attribute.
pub fn sequence_iv(media_sequence: u64) -> [u8; AES_BLOCK_LEN] {
    let mut iv = [0u8; AES_BLOCK_LEN];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}
