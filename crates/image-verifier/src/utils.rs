use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("cannot resolve path: {0}")]
    CannotResolve(#[from] std::io::Error),
    #[error("path {path:?} escapes base directory {base:?}")]
    OutsideBaseDirectory { base: PathBuf, path: PathBuf },
}

/// Joins `elements` onto `base_dir` and resolves symlinks, refusing paths
/// that end up outside of `base_dir`. Every file that is opened based on
/// user controlled configuration goes through here first.
pub fn safe_file_name<P: AsRef<Path>>(base_dir: P, elements: &[&str]) -> Result<PathBuf, PathError> {
    let mut path = base_dir.as_ref().to_path_buf();
    for element in elements {
        path.push(element);
    }

    let base = base_dir.as_ref().canonicalize()?;
    let resolved = path.canonicalize()?;

    if !resolved.starts_with(&base) {
        return Err(PathError::OutsideBaseDirectory {
            base,
            path: resolved,
        });
    }

    Ok(resolved)
}

/// Longest common prefix of two strings.
pub fn longest_common_prefix(a: &str, b: &str) -> String {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

/// JSON-encodes a string and strips the surrounding quotes, so the result
/// can be embedded into hand-built JSON documents without breaking them.
pub fn json_escape(value: &str) -> String {
    let encoded = serde_json::to_string(value).unwrap_or_default();
    encoded
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&encoded)
        .to_string()
}
