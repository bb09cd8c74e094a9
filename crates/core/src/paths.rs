//! Wire path validation and local name sanitization
//!
//! Every path arriving from a peer is checked here before it touches a
//! filesystem or the index. Paths are folder-relative, forward-slash
//! separated, and must not escape the folder root.

use thiserror::Error;

/// Rejection reasons for a wire path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute path")]
    Absolute,
    #[error("path contains a parent traversal")]
    ParentTraversal,
    #[error("path contains a NUL byte")]
    Nul,
    #[error("path contains a backslash")]
    Backslash,
    #[error("path contains an empty or dot component")]
    BadComponent,
}

/// Validate a folder-relative wire path.
///
/// # Errors
/// Returns the specific violation; callers treat any violation as a
/// protocol error from the sending peer.
pub fn check_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    if name.starts_with('/') {
        return Err(PathError::Absolute);
    }
    if name.contains('\0') {
        return Err(PathError::Nul);
    }
    if name.contains('\\') {
        return Err(PathError::Backslash);
    }
    for component in name.split('/') {
        match component {
            ".." => return Err(PathError::ParentTraversal),
            "" | "." => return Err(PathError::BadComponent),
            _ => {}
        }
    }
    Ok(())
}

/// Case-fold a name for comparison on case-insensitive filesystems.
#[must_use]
pub fn fold_case(name: &str) -> String {
    name.to_lowercase()
}

/// Windows-reserved base names, disallowed regardless of extension.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turn an arbitrary remote label into a name safe to create locally.
///
/// Replaces characters that are invalid on common filesystems, trims
/// trailing dots and spaces, and empties out Windows reserved names. The
/// result may be empty; callers fall back to another identifier then.
#[must_use]
pub fn sanitize_name(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for ch in label.chars() {
        match ch {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => out.push(' '),
            c if (c as u32) < 0x20 => out.push(' '),
            c => out.push(c),
        }
    }
    let trimmed = out.trim().trim_end_matches(['.', ' ']).to_string();

    let base = trimmed.split('.').next().unwrap_or("");
    if RESERVED_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(base))
    {
        return String::new();
    }
    trimmed
}
