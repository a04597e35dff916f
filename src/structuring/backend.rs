//! The structuring service as a capability.
//!
//! A backend knows how to send one logical request and hand back raw text,
//! either in one piece ([`StructuringBackend::complete`]) or as a stream of
//! chunks ([`StructuringBackend::stream`]). Retry, fallback and response
//! validation live in [`super::StructuringClient`], so every backend gets
//! them for free.

use crate::error::StructuringError;
use crate::prompts;
use crate::structuring::types::SectionRef;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of text chunks from a streaming request.
pub type ChunkStream = BoxStream<'static, Result<String, StructuringError>>;

/// One logical request to the structuring service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuringRequest {
    /// Enumerate the document's sections.
    Outline,
    /// Bibliographic metadata for the whole document.
    Metadata,
    /// Content and image regions for one section.
    Section(SectionRef),
}

impl StructuringRequest {
    /// Per-request instruction text sent alongside the document.
    pub fn instruction(&self) -> String {
        match self {
            Self::Outline => prompts::outline_instruction(),
            Self::Metadata => prompts::metadata_instruction().to_string(),
            Self::Section(s) => {
                prompts::section_instruction(s.order, &s.kind, &s.title, s.numbering.as_deref())
            }
        }
    }

    /// Short name used in logs and debug file names.
    pub fn debug_name(&self) -> String {
        match self {
            Self::Outline => "sections".to_string(),
            Self::Metadata => "metadata".to_string(),
            Self::Section(s) => format!("sec{:02}", s.order),
        }
    }
}

/// A way of talking to the structuring service.
///
/// Implementations must be cheap to share across concurrent section
/// requests (`Send + Sync`, typically behind an `Arc`).
#[async_trait]
pub trait StructuringBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Whether [`Self::stream`] is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Send the request and wait for the full response text.
    async fn complete(&self, request: &StructuringRequest) -> Result<String, StructuringError>;

    /// Send the request in streaming mode.
    ///
    /// Only called when [`Self::supports_streaming`] returns `true`.
    async fn stream(&self, request: &StructuringRequest) -> Result<ChunkStream, StructuringError> {
        Err(StructuringError::permanent(format!(
            "backend '{}' does not support streaming ({})",
            self.name(),
            request.debug_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_names() {
        assert_eq!(StructuringRequest::Outline.debug_name(), "sections");
        assert_eq!(StructuringRequest::Metadata.debug_name(), "metadata");
        let s = SectionRef::new(7, "Seven");
        assert_eq!(StructuringRequest::Section(s).debug_name(), "sec07");
    }

    #[test]
    fn section_instruction_carries_context() {
        let s = SectionRef::new(3, "Methods").with_numbering("2");
        let text = StructuringRequest::Section(s).instruction();
        assert!(text.contains("index=3"));
        assert!(text.contains("title=\"Methods\""));
    }
}
