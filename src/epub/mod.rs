//! Book assembly: documents, images and cover in, finished package tree out.
//!
//! [`BookBuilder`] collects the assembled sections in outline order and
//! [`BookBuilder::build`] turns them into an immutable [`BookManifest`]:
//! manifest items, spine, table of contents and the bytes of every file
//! that goes into the archive. Nothing here touches the network or the
//! filesystem except [`resolve_cover`] reading a user-supplied cover.
//!
//! ## Cover states
//!
//! ```text
//! cover image given? ──yes──▶ Manual
//!        │ no
//! auto cover on? ──yes──▶ Auto (render page 1; on failure ▶ None)
//!        │ no
//!        ▼
//!      None
//! ```
//!
//! Only `Manual` and `Auto` add the cover image, `cover.xhtml` at spine
//! position 0, the `<meta name="cover">` entry and the guide reference.

pub mod package;
pub mod templates;

use crate::error::EpubError;
use crate::output::{CoverKind, DocumentMetadata};
use crate::pipeline::encode::encode_jpeg;
use crate::pipeline::extract::ExtractedImage;
use crate::pipeline::render::PageSource;
use crate::pipeline::section::Document;
use image::ImageFormat;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

pub const MEDIA_XHTML: &str = "application/xhtml+xml";
pub const MEDIA_NCX: &str = "application/x-dtbncx+xml";
pub const MEDIA_CSS: &str = "text/css";
pub const MEDIA_PNG: &str = "image/png";
pub const MEDIA_JPEG: &str = "image/jpeg";

/// Directory inside the archive that holds the package content.
pub const CONTENT_ROOT: &str = "OEBPS";

/// One `<item>` in the package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    /// Relative to the content root.
    pub href: String,
    pub media_type: &'static str,
}

impl ManifestItem {
    pub fn new(id: impl Into<String>, href: impl Into<String>, media_type: &'static str) -> Self {
        Self {
            id: id.into(),
            href: href.into(),
            media_type,
        }
    }
}

/// One table-of-contents entry. `title` carries the numbering prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub title: String,
    pub href: String,
}

/// A file inside the archive. `path` is relative to the archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// The resolved cover image.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverImage {
    pub kind: CoverKind,
    /// Relative to the content root: `images/cover.jpg` or `images/cover.png`.
    pub href: String,
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Decide which cover the book gets.
///
/// A manual cover that cannot be read or decoded is fatal. A failed auto
/// cover only costs the cover.
pub fn resolve_cover(
    manual: Option<&Path>,
    auto_cover: bool,
    pages: &dyn PageSource,
) -> Result<Option<CoverImage>, EpubError> {
    if let Some(path) = manual {
        return load_manual_cover(path).map(Some);
    }
    if !auto_cover {
        return Ok(None);
    }
    let rendered = pages
        .render_page(0)
        .map_err(|e| e.to_string())
        .and_then(|page| encode_jpeg(&page).map_err(|e| e.to_string()));
    match rendered {
        Ok(bytes) => {
            info!("Cover rendered from page 1 ({} bytes)", bytes.len());
            Ok(Some(CoverImage {
                kind: CoverKind::Auto,
                href: "images/cover.jpg".to_string(),
                media_type: MEDIA_JPEG,
                bytes,
            }))
        }
        Err(e) => {
            warn!("Could not render page 1 as cover, continuing without: {}", e);
            Ok(None)
        }
    }
}

/// Read and validate a user-supplied cover. PNG and JPEG are kept as-is.
pub fn load_manual_cover(path: &Path) -> Result<CoverImage, EpubError> {
    let invalid = |reason: String| EpubError::InvalidCoverImage {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| invalid(e.to_string()))?;
    let (href, media_type) = match image::guess_format(&bytes) {
        Ok(ImageFormat::Png) => ("images/cover.png", MEDIA_PNG),
        Ok(ImageFormat::Jpeg) => ("images/cover.jpg", MEDIA_JPEG),
        Ok(other) => return Err(invalid(format!("unsupported format {:?}, use PNG or JPEG", other))),
        Err(e) => return Err(invalid(e.to_string())),
    };
    image::load_from_memory(&bytes).map_err(|e| invalid(e.to_string()))?;
    info!("Using cover image {}", path.display());
    Ok(CoverImage {
        kind: CoverKind::Manual,
        href: href.to_string(),
        media_type,
        bytes,
    })
}

/// The finished package, read-only.
#[derive(Debug, Clone)]
pub struct BookManifest {
    pub metadata: DocumentMetadata,
    /// `urn:isbn:…` or `urn:uuid:…`.
    pub identifier: String,
    pub items: Vec<ManifestItem>,
    /// Manifest ids in reading order.
    pub spine: Vec<String>,
    pub toc: Vec<TocEntry>,
    pub cover: CoverKind,
    /// Every archive entry except `mimetype`, in archive order.
    pub files: Vec<PackageFile>,
}

impl BookManifest {
    pub fn file(&self, path: &str) -> Option<&PackageFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Section documents in the spine. The cover page is not counted.
    pub fn document_count(&self) -> usize {
        self.spine.iter().filter(|id| id.as_str() != "cover").count()
    }
}

/// Collects documents in outline order, then builds the manifest once.
#[derive(Debug, Clone, Default)]
pub struct BookBuilder {
    metadata: DocumentMetadata,
    cover: Option<CoverImage>,
    sections: Vec<(Document, Vec<ExtractedImage>)>,
}

impl BookBuilder {
    pub fn new(metadata: DocumentMetadata) -> Self {
        Self {
            metadata,
            ..Default::default()
        }
    }

    pub fn cover(mut self, cover: Option<CoverImage>) -> Self {
        self.cover = cover;
        self
    }

    /// Append the next section. Call in outline order.
    pub fn add_document(&mut self, document: Document, images: Vec<ExtractedImage>) {
        self.sections.push((document, images));
    }

    pub fn build(self) -> BookManifest {
        let mut metadata = self.metadata;
        if metadata.title.trim().is_empty() {
            metadata.title = "Untitled".to_string();
        }

        // 1. Shared stylesheet and navigation.
        let mut items = vec![
            ManifestItem::new("ncx", "toc.ncx", MEDIA_NCX),
            ManifestItem::new("nav", "nav.xhtml", MEDIA_XHTML),
            ManifestItem::new("css", "styles.css", MEDIA_CSS),
        ];
        let mut spine = Vec::with_capacity(self.sections.len() + 1);

        // 2. Manifest entries, cover first.
        if let Some(cover) = &self.cover {
            items.push(ManifestItem::new("cover-image", cover.href.clone(), cover.media_type));
            items.push(ManifestItem::new("cover", "cover.xhtml", MEDIA_XHTML));
        }
        for (doc, _) in &self.sections {
            items.push(ManifestItem::new(doc.id.clone(), doc.filename.clone(), MEDIA_XHTML));
        }
        for (_, images) in &self.sections {
            for img in images {
                items.push(ManifestItem::new(img.manifest_id(), img.href.clone(), MEDIA_PNG));
            }
        }

        // 3. Table of contents in outline order.
        let toc: Vec<TocEntry> = self
            .sections
            .iter()
            .map(|(doc, _)| TocEntry {
                title: doc.title.clone(),
                href: doc.filename.clone(),
            })
            .collect();

        // 4. Spine: cover always at position 0.
        if self.cover.is_some() {
            spine.push("cover".to_string());
        }
        spine.extend(self.sections.iter().map(|(doc, _)| doc.id.clone()));

        let identifier = book_identifier(&metadata, self.sections.iter().map(|(d, _)| d));
        let cover_image_id = self.cover.as_ref().map(|_| "cover-image");

        let content = |name: &str| format!("{CONTENT_ROOT}/{name}");
        let mut files = vec![
            PackageFile {
                path: "META-INF/container.xml".to_string(),
                data: templates::CONTAINER_XML.as_bytes().to_vec(),
            },
            PackageFile {
                path: content("content.opf"),
                data: templates::content_opf(&metadata, &identifier, &items, &spine, cover_image_id)
                    .into_bytes(),
            },
            PackageFile {
                path: content("toc.ncx"),
                data: templates::toc_ncx(&identifier, &metadata.title, &toc).into_bytes(),
            },
            PackageFile {
                path: content("nav.xhtml"),
                data: templates::nav_xhtml(&metadata, &toc).into_bytes(),
            },
            PackageFile {
                path: content("styles.css"),
                data: templates::STYLESHEET.as_bytes().to_vec(),
            },
        ];
        if let Some(cover) = &self.cover {
            files.push(PackageFile {
                path: content("cover.xhtml"),
                data: templates::cover_xhtml(&cover.href, &metadata).into_bytes(),
            });
            files.push(PackageFile {
                path: content(&cover.href),
                data: cover.bytes.clone(),
            });
        }
        for (doc, _) in &self.sections {
            files.push(PackageFile {
                path: content(&doc.filename),
                data: templates::content_xhtml(doc, &metadata).into_bytes(),
            });
        }
        for (_, images) in &self.sections {
            for img in images {
                files.push(PackageFile {
                    path: content(&img.href),
                    data: img.bytes.clone(),
                });
            }
        }

        BookManifest {
            metadata,
            identifier,
            items,
            spine,
            toc,
            cover: self.cover.map(|c| c.kind).unwrap_or_default(),
            files,
        }
    }
}

/// `urn:isbn:` when the metadata has a plausible ISBN, else a UUID v5 over
/// the title and section file names so rebuilding the same book gives the
/// same identifier.
pub fn book_identifier<'a>(
    metadata: &DocumentMetadata,
    documents: impl Iterator<Item = &'a Document>,
) -> String {
    if let Some(isbn) = metadata.isbn.as_deref().map(normalize_isbn) {
        if isbn.len() == 10 || isbn.len() == 13 {
            return format!("urn:isbn:{isbn}");
        }
    }
    let mut name = metadata.title.clone();
    for doc in documents {
        name.push('\n');
        name.push_str(&doc.filename);
    }
    format!("urn:uuid:{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
}

fn normalize_isbn(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
