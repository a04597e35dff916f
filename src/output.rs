//! Result types returned by a conversion run.

use crate::error::SectionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bibliographic metadata written into the package descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub isbn: Option<String>,
    /// ISO 639-1 code; `None` is written as `en`.
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub subjects: Vec<String>,
}

impl DocumentMetadata {
    /// Metadata with only a title.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Fill empty fields from `other` without overwriting anything already set.
    pub fn merge_missing(&mut self, other: &DocumentMetadata) {
        if self.title.trim().is_empty() {
            self.title = other.title.clone();
        }
        if self.authors.is_empty() {
            self.authors = other.authors.clone();
        }
        self.isbn = self.isbn.take().or_else(|| other.isbn.clone());
        self.language = self.language.take().or_else(|| other.language.clone());
        self.publisher = self.publisher.take().or_else(|| other.publisher.clone());
        self.date = self.date.take().or_else(|| other.date.clone());
        self.description = self.description.take().or_else(|| other.description.clone());
        if self.subjects.is_empty() {
            self.subjects = other.subjects.clone();
        }
    }
}

/// Which cover, if any, the book ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoverKind {
    #[default]
    None,
    Manual,
    Auto,
}

impl fmt::Display for CoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Manual => f.write_str("manual"),
            Self::Auto => f.write_str("auto (first page)"),
        }
    }
}

/// Outcome for one outline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionReport {
    /// 1-based position in the outline.
    pub order: usize,
    pub title: String,
    /// Content document name inside the package, e.g. `chapter-1.xhtml`.
    pub filename: String,
    pub images_packaged: usize,
    /// Regions classified as decorative.
    pub images_rejected: usize,
    /// Regions that could not be extracted.
    pub images_failed: usize,
    pub duration_ms: u64,
    /// Set when the section was replaced by a placeholder.
    pub error: Option<SectionError>,
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_sections: usize,
    pub converted_sections: usize,
    pub failed_sections: usize,
    pub images_packaged: usize,
    pub images_rejected: usize,
    pub images_failed: usize,
    pub cover: CoverKind,
    pub total_duration_ms: u64,
    /// Wall-clock time spent waiting on the structuring service.
    pub structuring_duration_ms: u64,
    pub sections: Vec<SectionReport>,
}

impl ConversionStats {
    /// Fold per-section reports into the totals.
    pub fn tally(&mut self) {
        self.total_sections = self.sections.len();
        self.failed_sections = self.sections.iter().filter(|s| s.error.is_some()).count();
        self.converted_sections = self.total_sections - self.failed_sections;
        self.images_packaged = self.sections.iter().map(|s| s.images_packaged).sum();
        self.images_rejected = self.sections.iter().map(|s| s.images_rejected).sum();
        self.images_failed = self.sections.iter().map(|s| s.images_failed).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StructuringError;

    fn report(order: usize, packaged: usize, failed: bool) -> SectionReport {
        SectionReport {
            order,
            title: format!("S{order}"),
            filename: format!("s{order}.xhtml"),
            images_packaged: packaged,
            images_rejected: 1,
            images_failed: 0,
            duration_ms: 10,
            error: failed.then(|| SectionError::ContentFailed {
                order,
                source: StructuringError::transient("timeout"),
            }),
        }
    }

    #[test]
    fn tally_counts_sections_and_images() {
        let mut stats = ConversionStats {
            sections: vec![report(1, 2, false), report(2, 0, true), report(3, 1, false)],
            ..Default::default()
        };
        stats.tally();
        assert_eq!(stats.total_sections, 3);
        assert_eq!(stats.converted_sections, 2);
        assert_eq!(stats.failed_sections, 1);
        assert_eq!(stats.images_packaged, 3);
        assert_eq!(stats.images_rejected, 3);
    }

    #[test]
    fn merge_missing_keeps_existing_values() {
        let mut m = DocumentMetadata {
            title: "Service Title".into(),
            ..Default::default()
        };
        let pdf = DocumentMetadata {
            title: "PDF Title".into(),
            authors: vec!["A. Writer".into()],
            ..Default::default()
        };
        m.merge_missing(&pdf);
        assert_eq!(m.title, "Service Title");
        assert_eq!(m.authors, vec!["A. Writer".to_string()]);
    }
}
