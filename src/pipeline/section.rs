//! Section assembly: turn one structured section into a content document.
//!
//! The assembler owns the book-wide filename allocator, so sections must be
//! assembled one at a time in outline order. Everything it does is
//! deterministic: the same section content and extraction outcomes always
//! give the same document.

use crate::epub::templates::escape_xml;
use crate::pipeline::extract::{ExtractedImage, RegionOutcome};
use crate::pipeline::postprocess::normalize_markup;
use crate::pipeline::wrap::{wrap_markup, WRAP_WIDTH};
use crate::structuring::types::{starts_with_numbering, ImageRegion, SectionContent, SectionRef};
use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};
use std::collections::HashSet;
use tracing::debug;

/// Base names that the package uses for its own documents.
const RESERVED_NAMES: &[&str] = &["cover", "nav", "toc", "content", "styles"];

/// One content document, ready for the book assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Manifest id, e.g. `sec03`.
    pub id: String,
    /// File name relative to the content root, e.g. `chapter-1.xhtml`.
    pub filename: String,
    pub numbering: Option<String>,
    /// Title as shown in navigation, numbering included.
    pub title: String,
    /// Wrapped body markup.
    pub body: String,
    /// Image paths referenced by `body`, in document order.
    pub image_refs: Vec<String>,
}

/// A document plus the images it references.
#[derive(Debug, Clone)]
pub struct AssembledSection {
    pub document: Document,
    pub images: Vec<ExtractedImage>,
    pub images_rejected: usize,
    pub images_failed: usize,
}

/// Lower-case ASCII alphanumerics with every other run collapsed to one `-`.
///
/// Returns an empty string when nothing usable is left.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Hands out unique `.xhtml` file names for the whole book.
///
/// The first use of a base name gets it bare; repeats get `-01`, `-02`, ….
#[derive(Debug, Clone)]
pub struct FilenameAllocator {
    used: HashSet<String>,
}

impl Default for FilenameAllocator {
    fn default() -> Self {
        Self {
            used: RESERVED_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FilenameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// File name for a section, from its title, else its kind, else `section`.
    pub fn allocate(&mut self, title: &str, kind: &str) -> String {
        let base = [slugify(title), slugify(kind)]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| "section".to_string());

        if self.used.insert(base.clone()) {
            return format!("{base}.xhtml");
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}-{n:02}");
            if self.used.insert(candidate.clone()) {
                return format!("{candidate}.xhtml");
            }
            n += 1;
        }
    }
}

static RE_LEADING_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*(?:<(?:section|div|header|article)\b[^>]*>\s*)*<h[1-6]\b[^>]*>").unwrap()
});
static RE_HEADING_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</h[1-6]\s*>").unwrap());
static RE_ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_IMG_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b((?:[^>"']|"[^"]*"|'[^']*')*?)\s*/?>"#).unwrap());
static RE_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(\ssrc\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).unwrap());
static RE_EMPTY_ALT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\salt\s*=\s*(?:""|'')"#).unwrap());

/// Builds content documents section by section.
#[derive(Debug, Clone)]
pub struct SectionAssembler {
    filenames: FilenameAllocator,
    wrap_width: usize,
}

impl Default for SectionAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self {
            filenames: FilenameAllocator::new(),
            wrap_width: WRAP_WIDTH,
        }
    }

    pub fn with_wrap_width(mut self, width: usize) -> Self {
        self.wrap_width = width;
        self
    }

    /// Assemble one section.
    ///
    /// `outcomes` is parallel to `content.image_regions`. Each `<img>` in the
    /// body claims one region: the one whose filename hint matches its `src`,
    /// else the next unclaimed region in declaration order. Tags whose region
    /// was not extracted are removed, and extracted images nobody references
    /// are dropped.
    pub fn assemble(
        &mut self,
        section: &SectionRef,
        content: &SectionContent,
        outcomes: &[RegionOutcome],
    ) -> AssembledSection {
        let filename = self.filenames.allocate(&section.title, &section.kind);
        let title = section.display_title();

        let body = primary_heading(normalize_markup(&content.markup), section, &title);

        let mut slots = ImageSlots::new(&content.image_regions, outcomes);
        let body = RE_IMG_TAG
            .replace_all(&body, |caps: &Captures<'_>| slots.rewrite(caps))
            .to_string();

        let images_rejected = outcomes
            .iter()
            .filter(|o| matches!(o, RegionOutcome::Decorative(_)))
            .count();
        let images_failed = outcomes
            .iter()
            .filter(|o| matches!(o, RegionOutcome::Failed(_)))
            .count();
        let unreferenced = outcomes.iter().filter(|o| o.image().is_some()).count() - slots.images.len();
        if unreferenced > 0 {
            debug!(
                "Section {}: dropping {} unreferenced image(s)",
                section.order, unreferenced
            );
        }

        AssembledSection {
            document: Document {
                id: section_id(section.order),
                filename,
                numbering: section.numbering.clone(),
                title,
                body: wrap_markup(body.trim(), self.wrap_width),
                image_refs: slots.images.iter().map(|i| i.href.clone()).collect(),
            },
            images: slots.images,
            images_rejected,
            images_failed,
        }
    }

    /// Stand-in document for a section whose content could not be fetched.
    pub fn placeholder(&mut self, section: &SectionRef) -> Document {
        let filename = self.filenames.allocate(&section.title, &section.kind);
        let title = section.display_title();
        let body = format!(
            "{}\n<p class=\"conversion-error\">This section could not be converted.</p>",
            heading(&title)
        );
        Document {
            id: section_id(section.order),
            filename,
            numbering: section.numbering.clone(),
            title,
            body: wrap_markup(&body, self.wrap_width),
            image_refs: Vec::new(),
        }
    }
}

/// Manifest id for the section at 1-based `order`.
pub fn section_id(order: usize) -> String {
    format!("sec{order:02}")
}

/// Make sure the body opens with a heading that carries the numbering.
///
/// A leading `<h1>`–`<h6>` is kept; if it lacks the section's numbering,
/// the numbering is written into it. Otherwise an `<h1>` is injected.
fn primary_heading(body: String, section: &SectionRef, title: &str) -> String {
    let Some(open) = RE_LEADING_HEADING.find(&body) else {
        debug!("Section {}: injecting heading", section.order);
        return format!("{}\n{}", heading(title), body);
    };
    let Some(numbering) = section.numbering.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
        return body;
    };
    let numbering = escape_xml(numbering);
    let rest = &body[open.end()..];
    let inner = RE_HEADING_CLOSE.find(rest).map_or(rest, |close| &rest[..close.start()]);
    if starts_with_numbering(&RE_ANY_TAG.replace_all(inner, ""), &numbering) {
        return body;
    }
    debug!("Section {}: adding numbering to heading", section.order);
    format!("{}{} {}", &body[..open.end()], numbering, rest.trim_start())
}

fn heading(title: &str) -> String {
    format!("<h1>{}</h1>", escape_xml(title))
}

/// Matches `<img>` tags in the body to declared regions.
struct ImageSlots<'a> {
    regions: &'a [ImageRegion],
    outcomes: &'a [RegionOutcome],
    claimed: Vec<bool>,
    images: Vec<ExtractedImage>,
}

impl<'a> ImageSlots<'a> {
    fn new(regions: &'a [ImageRegion], outcomes: &'a [RegionOutcome]) -> Self {
        Self {
            regions,
            outcomes,
            claimed: vec![false; outcomes.len()],
            images: Vec::new(),
        }
    }

    fn claim(&mut self, src: &str) -> Option<usize> {
        let by_hint = (0..self.claimed.len()).find(|&i| {
            !self.claimed[i]
                && self
                    .regions
                    .get(i)
                    .and_then(|r| r.filename_hint.as_deref())
                    .is_some_and(|hint| same_file(hint, src))
        });
        let slot = by_hint.or_else(|| (0..self.claimed.len()).find(|&i| !self.claimed[i]))?;
        self.claimed[slot] = true;
        Some(slot)
    }

    fn rewrite(&mut self, caps: &Captures<'_>) -> String {
        let attrs = &caps[1];
        let src = RE_SRC
            .captures(attrs)
            .and_then(|c| c.get(2).or_else(|| c.get(3)))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let Some(slot) = self.claim(&src) else {
            debug!("Dropping <img src=\"{}\"> with no matching region", src);
            return String::new();
        };
        let Some(image) = self.outcomes.get(slot).and_then(RegionOutcome::image) else {
            return String::new();
        };

        let mut attrs = if RE_SRC.is_match(attrs) {
            RE_SRC
                .replace(attrs, |c: &Captures<'_>| format!("{}\"{}\"", &c[1], image.href))
                .to_string()
        } else {
            format!(" src=\"{}\"{}", image.href, attrs)
        };
        if let Some(label) = image.source_region.label.as_deref().filter(|l| !l.trim().is_empty()) {
            let alt = format!(" alt=\"{}\"", escape_xml(label.trim()));
            attrs = RE_EMPTY_ALT.replace(&attrs, NoExpand(&alt)).to_string();
        }
        self.images.push(image.clone());
        format!("<img{attrs}/>")
    }
}

fn same_file(hint: &str, src: &str) -> bool {
    let base = |s: &str| s.rsplit('/').next().unwrap_or(s).to_string();
    !hint.is_empty() && !src.is_empty() && (hint == src || base(hint) == base(src))
}
