//! Folder enumeration and creation for the browse endpoints.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

/// How deep the folder tree is scanned.
const SCAN_DEPTH: usize = 5;

/// Longest accepted folder name after sanitization.
const MAX_FOLDER_NAME_LEN: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct FolderInfo {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FolderInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderList {
    pub root_path: String,
    pub folders: Vec<FolderInfo>,
}

/// Enumerate subfolders of `target`, recursively up to five levels. Hidden
/// directories are skipped and siblings are sorted by name.
pub fn folder_list(target: &Path) -> Result<FolderList> {
    let root = absolute(target)?;
    if !root.is_dir() {
        return Err(Error::validation(format!(
            "directory does not exist: {}",
            root.display()
        )));
    }

    Ok(FolderList {
        root_path: root.display().to_string(),
        folders: scan(&root, SCAN_DEPTH),
    })
}

fn scan(dir: &Path, depth: usize) -> Vec<FolderInfo> {
    if depth == 0 {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        // Unreadable directories simply do not appear in the listing.
        return Vec::new();
    };

    let mut folders = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        folders.push(FolderInfo {
            name,
            path: path.display().to_string(),
            children: scan(&path, depth - 1),
        });
    }
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    folders
}

/// Strip characters that are invalid in folder names on any platform,
/// collapse runs of replacements, and bound the length.
pub fn sanitize_folder_name(name: &str) -> String {
    const INVALID: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

    let mut cleaned = String::with_capacity(name.len());
    let mut last_was_replacement = false;
    for c in name.trim().chars() {
        if c.is_control() || INVALID.contains(&c) {
            if !last_was_replacement {
                cleaned.push('_');
                last_was_replacement = true;
            }
        } else {
            cleaned.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = cleaned.trim_matches(|c| c == '_' || c == '.');
    trimmed.chars().take(MAX_FOLDER_NAME_LEN).collect()
}

/// Verify `path` exists, is a directory, and is writable (probed with a
/// throwaway file).
pub fn validate_path(path: &Path) -> Result<()> {
    let abs = absolute(path)?;
    let meta = std::fs::metadata(&abs)
        .map_err(|_| Error::validation(format!("path does not exist: {}", abs.display())))?;
    if !meta.is_dir() {
        return Err(Error::validation(format!(
            "path is not a directory: {}",
            abs.display()
        )));
    }

    let probe = abs.join(".write_probe");
    std::fs::write(&probe, b"probe")
        .map_err(|_| Error::validation(format!("directory is not writable: {}", abs.display())))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Create `name` (sanitized) under `parent`. The parent must already exist
/// and the target must not.
pub fn create_folder(parent: &Path, name: &str) -> Result<PathBuf> {
    let cleaned = sanitize_folder_name(name);
    if cleaned.is_empty() {
        return Err(Error::validation("folder name is invalid"));
    }
    if !parent.is_dir() {
        return Err(Error::validation(format!(
            "parent directory does not exist: {}",
            parent.display()
        )));
    }

    let target = parent.join(&cleaned);
    if target.exists() {
        return Err(Error::validation(format!("folder already exists: {cleaned}")));
    }
    std::fs::create_dir_all(&target)?;
    Ok(target)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}
