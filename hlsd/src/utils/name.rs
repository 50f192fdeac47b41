//! Output file-name derivation.

/// Fallback when nothing usable can be derived from the playlist URL.
const DEFAULT_FILE_NAME: &str = "main.ts";

/// Derive the output file name from the last path segment of the playlist
/// URL: `.m3u8` becomes `.ts`, anything else gets `.ts` appended.
pub fn file_name_from_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_query = trimmed
        .split_once('?')
        .map(|(head, _)| head)
        .unwrap_or(trimmed);
    let without_fragment = without_query
        .split_once('#')
        .map(|(head, _)| head)
        .unwrap_or(without_query);

    let Some((_, last)) = without_fragment.rsplit_once('/') else {
        return DEFAULT_FILE_NAME.to_string();
    };
    if last.is_empty() {
        return DEFAULT_FILE_NAME.to_string();
    }

    if last.contains(".m3u8") {
        last.replacen(".m3u8", ".ts", 1)
    } else {
        format!("{last}.ts")
    }
}

/// Split into stem and extension (`"show.ts"` → `("show", Some("ts"))`).
pub fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    }
}

/// Replace the extension, or append one when there is none.
pub fn with_extension(file_name: &str, ext: &str) -> String {
    let (stem, _) = split_extension(file_name);
    format!("{stem}.{ext}")
}

/// Normalize a user-supplied file name: missing or mismatched extensions
/// are replaced with the one the task will actually produce.
pub fn normalize_custom_name(custom: &str, convert_to_mp4: bool) -> String {
    let desired = if convert_to_mp4 { "mp4" } else { "ts" };
    let lowered = custom.to_lowercase();
    let (_, ext) = split_extension(custom);
    if ext.is_none() || !lowered.ends_with(&format!(".{desired}")) {
        with_extension(custom, desired)
    } else {
        custom.to_string()
    }
}
