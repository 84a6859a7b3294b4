use std::path::{Component, Path};

use crate::TransferError;

/// Validates a peer-supplied file name before it is joined to a local
/// directory.
///
/// The name must be exactly one normal path component. Rejects:
/// - Empty names and `.`/`..`
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Anything containing a directory separator
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_filename(filename: &str) -> Result<(), TransferError> {
    if filename.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    let path = Path::new(filename);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {filename}"
        )));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == path.as_os_str() => Ok(()),
        (Some(Component::ParentDir), _) | (_, Some(Component::ParentDir)) => Err(
            TransferError::InvalidPath(format!("parent directory traversal not allowed: {filename}")),
        ),
        (Some(Component::Prefix(_)), _) => Err(TransferError::InvalidPath(format!(
            "path prefix not allowed: {filename}"
        ))),
        _ => Err(TransferError::InvalidPath(format!(
            "file name must not contain directories: {filename}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(validate_filename("").is_err());
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("../passwd").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_filename("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_nested_path() {
        assert!(validate_filename("sub/file.txt").is_err());
    }

    #[test]
    fn rejects_current_dir() {
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("./file.txt").is_err());
    }

    #[test]
    fn rejects_trailing_separator() {
        assert!(validate_filename("file.txt/").is_err());
    }

    #[test]
    fn accepts_simple_names() {
        assert!(validate_filename("image.png").is_ok());
        assert!(validate_filename("image.png (1)").is_ok());
        assert!(validate_filename(".hidden").is_ok());
    }
}
