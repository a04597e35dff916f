//! Error types for the pdf2epub library.
//!
//! Failures fall into two groups:
//!
//! * [`EpubError`] is **fatal**: the run cannot produce a book (bad input file,
//!   outline request failed permanently, packaging failed). Returned as
//!   `Err(EpubError)` from the top-level `convert*` functions.
//!
//! * Component-local errors: [`StructuringError`] for one service request,
//!   [`ExtractionError`] for one image region and [`SectionError`] for one
//!   section. These degrade the book (an image or section is skipped or
//!   replaced) and are logged and counted, not propagated.
//!
//! [`PackagingError`] is always fatal and always names the output path.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2epub library.
#[derive(Debug, Error)]
pub enum EpubError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The explicit cover image is missing or cannot be decoded.
    #[error("Invalid cover image '{path}': {reason}")]
    InvalidCoverImage { path: PathBuf, reason: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Structuring errors ────────────────────────────────────────────────
    /// No structuring backend could be configured (missing API key etc.).
    #[error("Structuring service '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The outline request failed; nothing can be built without it.
    #[error("Outline request failed: {0}")]
    Structuring(#[from] StructuringError),

    /// A section failed and the run was configured to abort on the first one.
    #[error("Section {order} ('{title}') failed: {source}")]
    SectionFailed {
        order: usize,
        title: String,
        #[source]
        source: StructuringError,
    },

    /// Every section failed; the book would contain only placeholders.
    #[error("All {total} sections failed.\nFirst error: {first_error}")]
    AllSectionsFailed { total: usize, first_error: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// The archive could not be written.
    #[error(transparent)]
    Packaging(#[from] PackagingError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium from https://github.com/bblanchon/pdfium-binaries and either\n\
  • place libpdfium next to the executable or in the working directory, or\n\
  • set PDFIUM_LIB_PATH=/path/to/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a structuring request failed, which decides what the client does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StructuringErrorKind {
    /// Timeouts, 5xx, connection resets, rate limiting: retried with backoff.
    Transient,
    /// Authentication, bad request, quota exhaustion: never retried.
    Permanent,
    /// The response could not be parsed into the expected shape, even after repair.
    Malformed,
}

impl fmt::Display for StructuringErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
            Self::Malformed => f.write_str("malformed"),
        }
    }
}

/// A failed request to the structuring service.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{kind} error: {message}")]
pub struct StructuringError {
    pub kind: StructuringErrorKind,
    pub message: String,
}

impl StructuringError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StructuringErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StructuringErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: StructuringErrorKind::Malformed,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == StructuringErrorKind::Permanent
    }
}

/// A single image region could not be turned into an image file.
///
/// The owning section continues without the image.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    /// The region points at a page the document does not have.
    #[error("page index {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// The normalised box is outside `[0, 1]` or has no area.
    #[error("region ({x0:.3}, {y0:.3}, {x1:.3}, {y1:.3}) is out of bounds")]
    OutOfBounds { x0: f64, y0: f64, x1: f64, y1: f64 },

    /// The page could not be rasterised.
    #[error("page {page} could not be rendered: {detail}")]
    Render { page: usize, detail: String },

    /// The cropped image could not be encoded.
    #[error("image encoding failed: {0}")]
    Encode(String),
}

/// Writing the archive failed. No partial file is left at `path`.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build archive '{path}': {detail}")]
    Zip { path: PathBuf, detail: String },
}

/// A non-fatal error for a single section.
///
/// Stored in [`crate::output::SectionReport`] when a section is replaced by a
/// placeholder.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum SectionError {
    /// The content request failed after retries.
    #[error("Section {order}: content request failed: {source}")]
    ContentFailed {
        order: usize,
        #[source]
        source: StructuringError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structuring_error_display_names_kind() {
        let e = StructuringError::transient("HTTP 503");
        assert_eq!(e.to_string(), "transient error: HTTP 503");
        assert!(!e.is_permanent());
        assert!(StructuringError::permanent("HTTP 401").is_permanent());
    }

    #[test]
    fn outline_failure_wraps_structuring_error() {
        let e: EpubError = StructuringError::malformed("missing 'sections'").into();
        let msg = e.to_string();
        assert!(msg.contains("Outline request failed"), "got: {msg}");
        assert!(msg.contains("missing 'sections'"), "got: {msg}");
    }

    #[test]
    fn all_sections_failed_display() {
        let e = EpubError::AllSectionsFailed {
            total: 7,
            first_error: "permanent error: HTTP 403".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("All 7 sections"), "got: {msg}");
        assert!(msg.contains("HTTP 403"));
    }

    #[test]
    fn packaging_error_names_path() {
        let e = PackagingError::Io {
            path: PathBuf::from("/out/book.epub"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(e.to_string().contains("/out/book.epub"));
    }

    #[test]
    fn extraction_out_of_bounds_display() {
        let e = ExtractionError::OutOfBounds {
            x0: 0.1,
            y0: 0.2,
            x1: 1.5,
            y1: 0.9,
        };
        assert!(e.to_string().contains("1.500"));
    }
}
