//! Page rasterisation: the page-rendering capability behind figure crops,
//! the auto cover and vision-provider uploads.
//!
//! ## Why a trait?
//!
//! Everything downstream (image extraction, cover rendering) only needs
//! "give me page N as pixels". [`PageSource`] captures exactly that, so the
//! pipeline can run against pdfium in production and against in-memory
//! images in tests, without the pdfium shared library.
//!
//! ## Why rebind per call?
//!
//! A bound `Pdfium` is not `Send`. Sections extract their figures on the
//! blocking pool, so [`PdfiumPages`] keeps only the path and settings and
//! binds pdfium inside each blocking call.

use crate::error::{EpubError, ExtractionError};
use crate::output::DocumentMetadata;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Something that can rasterise pages of the source document.
///
/// Methods are blocking; async callers go through `spawn_blocking`.
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    /// Render the given 0-based pages, in the order requested.
    fn render_pages(&self, indices: &[usize]) -> Result<Vec<(usize, DynamicImage)>, ExtractionError>;

    /// Render one page.
    fn render_page(&self, index: usize) -> Result<DynamicImage, ExtractionError> {
        self.render_pages(&[index])?
            .into_iter()
            .next()
            .map(|(_, img)| img)
            .ok_or(ExtractionError::PageOutOfRange {
                page: index,
                total: self.page_count(),
            })
    }
}

/// Document-level facts read from the PDF itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfInfo {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

impl PdfInfo {
    /// Info-dictionary values as book metadata, for when the service has none.
    pub fn to_metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            title: self.title.clone().unwrap_or_default(),
            authors: self.author.iter().cloned().collect(),
            description: self.subject.clone(),
            ..Default::default()
        }
    }
}

/// Bind to a pdfium shared library.
///
/// Lookup order: `PDFIUM_LIB_PATH` (file or directory), the working
/// directory, then the system library path.
pub fn bind_pdfium() -> Result<Pdfium, EpubError> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(p) => {
            let p = PathBuf::from(p);
            let lib = if p.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&p)
            } else {
                p
            };
            Pdfium::bind_to_library(&lib)
        }
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| EpubError::PdfiumBindingFailed(e.to_string()))?;
    Ok(Pdfium::new(bindings))
}

/// pdfium-backed [`PageSource`] for one PDF file.
///
/// Holds only the path and render settings. Each call binds pdfium and
/// reloads the document on the calling (blocking) thread, since a bound
/// `Pdfium` cannot move between threads.
#[derive(Debug, Clone)]
pub struct PdfiumPages {
    path: PathBuf,
    password: Option<String>,
    dpi: u32,
    max_pixels: u32,
    info: PdfInfo,
}

impl PdfiumPages {
    /// Open the document once to validate it and read its info.
    pub fn open(
        path: &Path,
        password: Option<&str>,
        dpi: u32,
        max_pixels: u32,
    ) -> Result<Self, EpubError> {
        let info = read_info_blocking(path, password)?;
        info!("PDF loaded: {} pages", info.page_count);
        Ok(Self {
            path: path.to_path_buf(),
            password: password.map(str::to_string),
            dpi,
            max_pixels,
            info,
        })
    }

    pub fn info(&self) -> &PdfInfo {
        &self.info
    }
}

impl PageSource for PdfiumPages {
    fn page_count(&self) -> usize {
        self.info.page_count
    }

    fn render_pages(&self, indices: &[usize]) -> Result<Vec<(usize, DynamicImage)>, ExtractionError> {
        let total = self.info.page_count;
        if let Some(&bad) = indices.iter().find(|&&i| i >= total) {
            return Err(ExtractionError::PageOutOfRange { page: bad, total });
        }
        render_pages_blocking(
            &self.path,
            self.password.as_deref(),
            self.dpi,
            self.max_pixels,
            indices,
        )
    }
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    pdf_path: &Path,
    password: Option<&str>,
    dpi: u32,
    max_pixels: u32,
    page_indices: &[usize],
) -> Result<Vec<(usize, DynamicImage)>, ExtractionError> {
    let first = page_indices.first().copied().unwrap_or(0);
    let render_err = |page: usize, detail: String| ExtractionError::Render { page, detail };

    let pdfium = bind_pdfium().map_err(|e| render_err(first, e.to_string()))?;
    let document =
        load_document(&pdfium, pdf_path, password).map_err(|e| render_err(first, e.to_string()))?;
    let pages = document.pages();

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(page_indices.len());
    for &idx in page_indices {
        let page = pages
            .get(idx as u16)
            .map_err(|e| render_err(idx, format!("{:?}", e)))?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| render_err(idx, format!("{:?}", e)))?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push((idx, image));
    }
    Ok(results)
}

/// Blocking implementation of document info extraction.
fn read_info_blocking(pdf_path: &Path, password: Option<&str>) -> Result<PdfInfo, EpubError> {
    let pdfium = bind_pdfium()?;
    let document = load_document(&pdfium, pdf_path, password)?;
    Ok(read_info(&document))
}

fn load_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, EpubError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                EpubError::WrongPassword {
                    path: path.to_path_buf(),
                }
            } else {
                EpubError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            }
        } else {
            EpubError::CorruptPdf {
                path: path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn read_info(document: &PdfDocument<'_>) -> PdfInfo {
    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };
    PdfInfo {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    }
}

/// Pre-rendered pages held in memory.
///
/// Useful when pages come from somewhere other than pdfium, and for tests.
pub struct StaticPages {
    pages: Vec<DynamicImage>,
}

impl StaticPages {
    pub fn new(pages: Vec<DynamicImage>) -> Self {
        Self { pages }
    }
}

impl PageSource for StaticPages {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn render_pages(&self, indices: &[usize]) -> Result<Vec<(usize, DynamicImage)>, ExtractionError> {
        indices
            .iter()
            .map(|&i| {
                self.pages
                    .get(i)
                    .map(|img| (i, img.clone()))
                    .ok_or(ExtractionError::PageOutOfRange {
                        page: i,
                        total: self.pages.len(),
                    })
            })
            .collect()
    }
}
