//! Input validation: make sure the user-supplied path is a readable PDF.
//!
//! We check the `%PDF` magic bytes before anything else touches the file so
//! callers get a meaningful error rather than a pdfium or service failure
//! several steps later.

use crate::error::EpubError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate a local PDF path: exists, readable, starts with `%PDF`.
pub fn resolve_input(path: &Path) -> Result<PathBuf, EpubError> {
    let path = path.to_path_buf();

    if !path.is_file() {
        return Err(EpubError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            match f.read_exact(&mut magic) {
                Ok(()) if &magic == b"%PDF" => {}
                Ok(()) => return Err(EpubError::NotAPdf { path, magic }),
                Err(_) => {
                    return Err(EpubError::NotAPdf {
                        path,
                        magic: [0; 4],
                    })
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(EpubError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(EpubError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}

/// Read the whole PDF for backends that upload the document itself.
pub async fn read_pdf(path: &Path) -> Result<Vec<u8>, EpubError> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => EpubError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => EpubError::FileNotFound {
            path: path.to_path_buf(),
        },
    })
}

/// File stem used for titles, debug files and the sources directory.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "book".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_not_found() {
        let err = resolve_input(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, EpubError::FileNotFound { .. }));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"PK\x03\x04not a pdf").unwrap();
        match resolve_input(f.path()).unwrap_err() {
            EpubError::NotAPdf { magic, .. } => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn short_file_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"%P").unwrap();
        assert!(matches!(
            resolve_input(f.path()).unwrap_err(),
            EpubError::NotAPdf { .. }
        ));
    }

    #[test]
    fn pdf_magic_accepted() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"%PDF-1.7\n").unwrap();
        assert_eq!(resolve_input(f.path()).unwrap(), f.path());
    }

    #[test]
    fn directory_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_input(dir.path()).unwrap_err(),
            EpubError::FileNotFound { .. }
        ));
    }

    #[test]
    fn stems() {
        assert_eq!(file_stem(Path::new("/a/My Book.pdf")), "My Book");
        assert_eq!(file_stem(Path::new("/")), "book");
    }
}
