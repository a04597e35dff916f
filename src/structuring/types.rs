//! Validated shapes returned by the structuring service.

use serde::{Deserialize, Serialize};

/// One outline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRef {
    /// 1-based, strictly increasing across the outline.
    pub order: usize,
    /// Logical kind: `chapter`, `preface`, `appendix`, ... Defaults to `section`.
    pub kind: String,
    pub title: String,
    /// Printed label such as `"2"` or `"IV"`, kept verbatim.
    pub numbering: Option<String>,
}

impl SectionRef {
    pub fn new(order: usize, title: impl Into<String>) -> Self {
        Self {
            order,
            kind: "section".to_string(),
            title: title.into(),
            numbering: None,
        }
    }

    pub fn with_numbering(mut self, numbering: impl Into<String>) -> Self {
        self.numbering = Some(numbering.into());
        self
    }

    /// Title as shown in headings and navigation: `"{numbering} {title}"`.
    ///
    /// The prefix is skipped when the title already starts with it as a
    /// whole token (`"1 Intro"`, `"1. Intro"`), not as part of one
    /// (`"12 Angry Men"`).
    pub fn display_title(&self) -> String {
        match self.numbering.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() && !starts_with_numbering(&self.title, n) => {
                format!("{} {}", n, self.title.trim())
            }
            _ => self.title.trim().to_string(),
        }
    }
}

/// Whether `text` opens with `numbering` followed by whitespace, `.`, `:`
/// or the end of the text.
pub(crate) fn starts_with_numbering(text: &str, numbering: &str) -> bool {
    match text.trim_start().strip_prefix(numbering) {
        Some(rest) => rest
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '.' || c == ':'),
        None => false,
    }
}

/// Ordered list of sections for the whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    pub sections: Vec<SectionRef>,
}

impl Outline {
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Single-section outline used when the service returned no sections.
    pub fn single(title: impl Into<String>) -> Self {
        Self {
            sections: vec![SectionRef::new(1, title)],
        }
    }
}

/// Rectangle in page-relative coordinates, `(x0, y0)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl NormalizedBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Convert a `[ymin, xmin, ymax, xmax]` box.
    ///
    /// Values on the 0–1000 scale are divided by 1000; a box whose values
    /// all lie within `[0, 1]` is taken as already normalised.
    pub fn from_box_2d(b: [f64; 4]) -> Self {
        let [ymin, xmin, ymax, xmax] = b;
        let scale = if b.iter().all(|v| (0.0..=1.0).contains(v)) {
            1.0
        } else {
            1000.0
        };
        Self::new(xmin / scale, ymin / scale, xmax / scale, ymax / scale)
    }

    /// All coordinates in `[0, 1]` and a non-empty area.
    pub fn is_valid(&self) -> bool {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        in_unit(self.x0)
            && in_unit(self.y0)
            && in_unit(self.x1)
            && in_unit(self.y1)
            && self.x0 < self.x1
            && self.y0 < self.y1
    }
}

/// Candidate figure reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegion {
    pub bbox: NormalizedBox,
    /// 0-based page index.
    pub page_index: usize,
    pub label: Option<String>,
    /// The `src` the service used for this image in the section markup.
    pub filename_hint: Option<String>,
}

/// Body markup plus figure candidates for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionContent {
    pub markup: String,
    pub image_regions: Vec<ImageRegion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_title_prefixes_numbering() {
        let s = SectionRef::new(2, "Getting Started").with_numbering("1");
        assert_eq!(s.display_title(), "1 Getting Started");
    }

    #[test]
    fn display_title_does_not_duplicate_numbering() {
        let s = SectionRef::new(2, "1 Getting Started").with_numbering("1");
        assert_eq!(s.display_title(), "1 Getting Started");
        assert_eq!(SectionRef::new(1, " Preface ").display_title(), "Preface");
    }

    #[test]
    fn numbering_prefix_must_be_a_whole_token() {
        let s = SectionRef::new(1, "12 Angry Men").with_numbering("1");
        assert_eq!(s.display_title(), "1 12 Angry Men");
        let s = SectionRef::new(3, "10 Years On").with_numbering("1");
        assert_eq!(s.display_title(), "1 10 Years On");
        let s = SectionRef::new(1, "1. Intro").with_numbering("1");
        assert_eq!(s.display_title(), "1. Intro");
        let s = SectionRef::new(4, "IV: Storms").with_numbering("IV");
        assert_eq!(s.display_title(), "IV: Storms");
        let s = SectionRef::new(5, "2").with_numbering("2");
        assert_eq!(s.display_title(), "2");
    }

    #[test]
    fn box_2d_thousand_scale() {
        let b = NormalizedBox::from_box_2d([100.0, 200.0, 500.0, 800.0]);
        assert_eq!(b, NormalizedBox::new(0.2, 0.1, 0.8, 0.5));
        assert!(b.is_valid());
    }

    #[test]
    fn box_2d_unit_scale_is_kept() {
        let b = NormalizedBox::from_box_2d([0.1, 0.2, 0.5, 0.8]);
        assert_eq!(b, NormalizedBox::new(0.2, 0.1, 0.8, 0.5));
    }

    #[test]
    fn invalid_boxes() {
        assert!(!NormalizedBox::new(0.5, 0.1, 0.4, 0.9).is_valid());
        assert!(!NormalizedBox::new(0.1, 0.1, 1.2, 0.9).is_valid());
        assert!(!NormalizedBox::new(0.1, 0.1, 0.1, 0.9).is_valid());
        assert!(!NormalizedBox::new(f64::NAN, 0.1, 0.5, 0.9).is_valid());
    }
}
