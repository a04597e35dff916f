//! Conversion entry points: PDF in, EPUB out.
//!
//! ## Run shape
//!
//! ```text
//! outline ─▶ metadata ─▶ sections (concurrent: fetch ▶ extract images)
//!                                   │
//!                                   ▼  sorted into outline order
//!                        assemble documents ─▶ build manifest ─▶ package
//! ```
//!
//! The outline request is a barrier: nothing else is requested until it
//! has succeeded, and its failure is fatal. Section requests then run up to
//! `config.concurrency` at a time and each section extracts its figures as
//! soon as its own content arrives. Assembly and packaging are sequential
//! because file names, spine and table of contents depend on every section.

use crate::config::{ConversionConfig, SectionFailurePolicy};
use crate::epub::{self, package, BookBuilder, BookManifest};
use crate::error::{EpubError, ExtractionError, SectionError, StructuringError};
use crate::output::{ConversionStats, DocumentMetadata, SectionReport};
use crate::pipeline::encode::encode_page;
use crate::pipeline::extract::{ImageExtractor, RegionOutcome};
use crate::pipeline::input;
use crate::pipeline::render::{PageSource, PdfiumPages};
use crate::pipeline::section::SectionAssembler;
use crate::structuring::provider::{create_vision_provider, provider_from_env};
use crate::structuring::{
    DebugSink, GeminiBackend, Outline, ProviderBackend, RetryPolicy, SectionContent, SectionRef,
    StructuringBackend, StructuringClient,
};
use edgequake_llm::{ImageData, LLMProvider};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Model used with a named edgequake-llm provider when none is configured.
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4.1-mini";

/// Convert `input` (a local PDF) into an EPUB at `output`.
///
/// # Returns
/// `Ok(ConversionStats)` when a book was written, even if some sections were
/// replaced by placeholders (check `stats.failed_sections`).
///
/// # Errors
/// Returns `Err(EpubError)` only for fatal errors:
/// - input missing, unreadable or not a PDF; invalid cover image
/// - no structuring service configured
/// - the outline request failed
/// - every section failed, or one failed under [`SectionFailurePolicy::Abort`]
/// - the archive could not be written (nothing is left at `output`)
pub async fn convert(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionStats, EpubError> {
    let total_start = Instant::now();
    let output = output.as_ref().to_path_buf();

    // ── Step 1: Validate inputs ──────────────────────────────────────────
    let pdf_path = input::resolve_input(input.as_ref())?;
    info!("Starting conversion: {} → {}", pdf_path.display(), output.display());
    if let Some(ref cover) = config.cover_image {
        epub::load_manual_cover(cover)?;
    }

    // ── Step 2: Open the document ────────────────────────────────────────
    let pages = {
        let path = pdf_path.clone();
        let password = config.password.clone();
        let (dpi, max_px) = (config.dpi, config.max_rendered_pixels);
        tokio::task::spawn_blocking(move || PdfiumPages::open(&path, password.as_deref(), dpi, max_px))
            .await
            .map_err(|e| EpubError::Internal(format!("pdfium task panicked: {e}")))??
    };
    let mut defaults = pages.info().to_metadata();
    defaults.merge_missing(&DocumentMetadata::titled(input::file_stem(&pdf_path)));
    let pages: Arc<dyn PageSource> = Arc::new(pages);

    // ── Step 3: Structuring backend ──────────────────────────────────────
    let backend = resolve_backend(config, &pdf_path, &pages).await?;
    info!("Structuring backend: {}", backend.name());
    let mut client = StructuringClient::new(backend, RetryPolicy::from_config(config));
    if config.debug {
        client = client.with_debug(DebugSink::new(output_dir(&output), input::file_stem(&output)));
    }

    // ── Step 4: Build the book ───────────────────────────────────────────
    let (manifest, mut stats) = build_book(&client, pages, config, defaults).await?;

    // ── Step 5: Package ──────────────────────────────────────────────────
    let keep_sources = config.keep_sources.then(|| sources_dir(&output));
    let out = output.clone();
    tokio::task::spawn_blocking(move || -> Result<(), EpubError> {
        package::write(&manifest, &out)?;
        if let Some(dir) = keep_sources {
            package::write_sources(&manifest, &dir)?;
            info!("Package sources written to {}", dir.display());
        }
        Ok(())
    })
    .await
    .map_err(|e| EpubError::Internal(format!("packaging task panicked: {e}")))??;

    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
    info!(
        "Conversion complete: {}/{} sections, {} images, {}ms total",
        stats.converted_sections, stats.total_sections, stats.images_packaged, stats.total_duration_ms
    );
    Ok(stats)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionStats, EpubError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| EpubError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input, output, config))
}

/// One section's fetch, tagged with its outline entry.
struct SectionFetch {
    section: SectionRef,
    result: Result<(SectionContent, Vec<RegionOutcome>), StructuringError>,
    duration_ms: u64,
}

/// Request everything from the service and assemble the package in memory.
///
/// `defaults` fills whatever the metadata request leaves empty. Nothing is
/// written to disk except debug artifacts when the client has a sink.
pub async fn build_book(
    client: &StructuringClient,
    pages: Arc<dyn PageSource>,
    config: &ConversionConfig,
    defaults: DocumentMetadata,
) -> Result<(BookManifest, ConversionStats), EpubError> {
    let structuring_start = Instant::now();

    // ── Outline (barrier) ────────────────────────────────────────────────
    let outline = client.fetch_outline().await?;
    let metadata = resolve_metadata(client, config, &defaults).await;
    let outline = if outline.is_empty() {
        warn!("Service returned no sections; using a single section");
        Outline::single(metadata.title.clone())
    } else {
        outline
    };
    let total = outline.len();

    // ── Cover ────────────────────────────────────────────────────────────
    let cover = {
        let pages = Arc::clone(&pages);
        let manual = config.cover_image.clone();
        let auto = config.auto_cover;
        tokio::task::spawn_blocking(move || epub::resolve_cover(manual.as_deref(), auto, pages.as_ref()))
            .await
            .map_err(|e| EpubError::Internal(format!("cover task panicked: {e}")))??
    };

    // ── Sections ─────────────────────────────────────────────────────────
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(total);
    }
    let mut fetched = Vec::with_capacity(total);
    {
        let mut in_flight = stream::iter(outline.sections.iter().cloned().map(|section| {
            fetch_section(client, Arc::clone(&pages), config, section, total)
        }))
        .buffer_unordered(config.concurrency.max(1));

        while let Some(fetch) = in_flight.next().await {
            if let (Err(e), SectionFailurePolicy::Abort) = (&fetch.result, config.section_failure) {
                return Err(EpubError::SectionFailed {
                    order: fetch.section.order,
                    title: fetch.section.title.clone(),
                    source: e.clone(),
                });
            }
            fetched.push(fetch);
        }
    }
    fetched.sort_by_key(|f| f.section.order);
    let structuring_duration_ms = structuring_start.elapsed().as_millis() as u64;

    // ── Assembly (sequential, outline order) ─────────────────────────────
    let mut assembler = SectionAssembler::new();
    let mut builder = BookBuilder::new(metadata).cover(cover);
    let mut reports = Vec::with_capacity(total);
    for fetch in fetched {
        let report = match fetch.result {
            Ok((content, outcomes)) => {
                let assembled = assembler.assemble(&fetch.section, &content, &outcomes);
                let report = SectionReport {
                    order: fetch.section.order,
                    title: assembled.document.title.clone(),
                    filename: assembled.document.filename.clone(),
                    images_packaged: assembled.images.len(),
                    images_rejected: assembled.images_rejected,
                    images_failed: assembled.images_failed,
                    duration_ms: fetch.duration_ms,
                    error: None,
                };
                builder.add_document(assembled.document, assembled.images);
                report
            }
            Err(e) => {
                warn!(
                    "Section {} ('{}') replaced by a placeholder: {}",
                    fetch.section.order, fetch.section.title, e
                );
                let document = assembler.placeholder(&fetch.section);
                let report = SectionReport {
                    order: fetch.section.order,
                    title: document.title.clone(),
                    filename: document.filename.clone(),
                    images_packaged: 0,
                    images_rejected: 0,
                    images_failed: 0,
                    duration_ms: fetch.duration_ms,
                    error: Some(SectionError::ContentFailed {
                        order: fetch.section.order,
                        source: e,
                    }),
                };
                builder.add_document(document, Vec::new());
                report
            }
        };
        reports.push(report);
    }

    let mut stats = ConversionStats {
        sections: reports,
        structuring_duration_ms,
        ..Default::default()
    };
    stats.tally();

    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_complete(stats.total_sections, stats.converted_sections);
    }
    if stats.total_sections > 0 && stats.converted_sections == 0 {
        let first_error = stats
            .sections
            .iter()
            .find_map(|s| s.error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        return Err(EpubError::AllSectionsFailed {
            total: stats.total_sections,
            first_error,
        });
    }

    let manifest = builder.build();
    stats.cover = manifest.cover;
    Ok((manifest, stats))
}

/// Fetch one section's content, then crop its figures.
async fn fetch_section(
    client: &StructuringClient,
    pages: Arc<dyn PageSource>,
    config: &ConversionConfig,
    section: SectionRef,
    total: usize,
) -> SectionFetch {
    let started = Instant::now();
    if let Some(ref cb) = config.progress_callback {
        cb.on_section_start(section.order, total, &section.title);
    }

    let result = match client.fetch_section_content(&section).await {
        Ok(content) => {
            let outcomes = extract_images(pages, section.order, &content).await;
            Ok((content, outcomes))
        }
        Err(e) => Err(e),
    };

    if let Some(ref cb) = config.progress_callback {
        match &result {
            Ok(_) => cb.on_section_complete(section.order, total, &section.title),
            Err(e) => cb.on_section_error(section.order, total, &e.to_string()),
        }
    }
    if let Err(ref e) = result {
        warn!("Section {} failed: {}", section.order, e);
    }

    SectionFetch {
        section,
        result,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn extract_images(
    pages: Arc<dyn PageSource>,
    order: usize,
    content: &SectionContent,
) -> Vec<RegionOutcome> {
    if content.image_regions.is_empty() {
        return Vec::new();
    }
    let regions = content.image_regions.clone();
    let task = tokio::task::spawn_blocking(move || {
        ImageExtractor::default().extract_section(pages.as_ref(), order, &regions)
    });
    match task.await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            warn!("Section {}: image extraction task failed: {}", order, e);
            content
                .image_regions
                .iter()
                .map(|r| {
                    RegionOutcome::Failed(ExtractionError::Render {
                        page: r.page_index,
                        detail: e.to_string(),
                    })
                })
                .collect()
        }
    }
}

/// Service metadata with gaps filled from `defaults`. Never fails.
async fn resolve_metadata(
    client: &StructuringClient,
    config: &ConversionConfig,
    defaults: &DocumentMetadata,
) -> DocumentMetadata {
    let mut metadata = if config.fetch_metadata {
        match client.fetch_metadata().await {
            Ok(m) => m,
            Err(e) => {
                warn!("Metadata request failed, continuing without: {}", e);
                DocumentMetadata::default()
            }
        }
    } else {
        DocumentMetadata::default()
    };
    metadata.merge_missing(defaults);
    debug!("Book title: {}", metadata.title);
    metadata
}

/// Pick the structuring backend, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model`.
/// 3. **Gemini API key** (`config.api_key`): the native backend, which
///    uploads the PDF itself and streams responses.
/// 4. **Auto-detection** from the environment via edgequake-llm.
///
/// Options 1, 2 and 4 send rendered pages instead of the PDF.
async fn resolve_backend(
    config: &ConversionConfig,
    pdf_path: &Path,
    pages: &Arc<dyn PageSource>,
) -> Result<Arc<dyn StructuringBackend>, EpubError> {
    let provider: Arc<dyn LLMProvider> = if let Some(ref provider) = config.provider {
        Arc::clone(provider)
    } else if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_PROVIDER_MODEL);
        create_vision_provider(name, model)?
    } else if let Some(ref key) = config.api_key {
        let pdf = input::read_pdf(pdf_path).await?;
        return Ok(Arc::new(GeminiBackend::new(config, key, &pdf)?));
    } else {
        provider_from_env()?
    };

    let images = vision_pages(Arc::clone(pages)).await?;
    Ok(Arc::new(ProviderBackend::new(provider, images, config)))
}

/// Render and encode every page for a vision provider.
async fn vision_pages(pages: Arc<dyn PageSource>) -> Result<Vec<ImageData>, EpubError> {
    tokio::task::spawn_blocking(move || {
        let indices: Vec<usize> = (0..pages.page_count()).collect();
        let rendered = pages
            .render_pages(&indices)
            .map_err(|e| EpubError::RasterisationFailed {
                page: match e {
                    ExtractionError::Render { page, .. } | ExtractionError::PageOutOfRange { page, .. } => page + 1,
                    _ => 0,
                },
                detail: e.to_string(),
            })?;
        rendered
            .iter()
            .map(|(idx, img)| {
                encode_page(img).map_err(|e| EpubError::RasterisationFailed {
                    page: idx + 1,
                    detail: format!("Image encoding failed: {}", e),
                })
            })
            .collect()
    })
    .await
    .map_err(|e| EpubError::Internal(format!("render task panicked: {e}")))?
}

fn output_dir(output: &Path) -> PathBuf {
    match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// `<dir>/<output-stem>_epub_src`
pub fn sources_dir(output: &Path) -> PathBuf {
    output_dir(output).join(format!("{}_epub_src", input::file_stem(output)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::render::StaticPages;
    use crate::structuring::testing::{fast_policy, ScriptedBackend};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pages() -> Arc<dyn PageSource> {
        Arc::new(StaticPages::new(vec![DynamicImage::ImageRgb8(RgbImage::from_pixel(
            50,
            50,
            Rgb([200, 200, 200]),
        ))]))
    }

    fn config(policy: SectionFailurePolicy) -> ConversionConfig {
        ConversionConfig::builder()
            .concurrency(1)
            .auto_cover(false)
            .fetch_metadata(false)
            .section_failure(policy)
            .build()
            .unwrap()
    }

    fn backend(outline: &str, sections: &[Result<&str, StructuringError>]) -> Arc<ScriptedBackend> {
        let backend = ScriptedBackend::default();
        backend.push_complete(Ok(outline.to_string()));
        for s in sections {
            backend.push_complete(s.clone().map(str::to_string));
        }
        Arc::new(backend)
    }

    const OUTLINE: &str = r#"{"sections":[{"title":"Intro"},{"title":"Body"}]}"#;

    #[test]
    fn sources_dir_sits_next_to_output() {
        assert_eq!(
            sources_dir(Path::new("/out/My Book.epub")),
            PathBuf::from("/out/My Book_epub_src")
        );
        assert_eq!(sources_dir(Path::new("b.epub")), PathBuf::from("./b_epub_src"));
    }

    #[tokio::test]
    async fn failed_section_becomes_placeholder() {
        let b = backend(
            OUTLINE,
            &[
                Ok(r#"{"xhtml":"<p>hello</p>","images":[]}"#),
                Err(StructuringError::permanent("HTTP 403")),
            ],
        );
        let client = StructuringClient::new(b, fast_policy(0));
        let (manifest, stats) = build_book(
            &client,
            pages(),
            &config(SectionFailurePolicy::Placeholder),
            DocumentMetadata::titled("Stem"),
        )
        .await
        .unwrap();
        assert_eq!(stats.total_sections, 2);
        assert_eq!(stats.failed_sections, 1);
        assert_eq!(manifest.spine, vec!["sec01", "sec02"]);
        let body = manifest.file("OEBPS/body.xhtml").unwrap();
        assert!(String::from_utf8_lossy(&body.data).contains("could not be converted"));
        assert_eq!(manifest.metadata.title, "Stem");
    }

    #[tokio::test]
    async fn abort_policy_fails_the_run() {
        let b = backend(
            OUTLINE,
            &[
                Ok(r#"{"xhtml":"<p>hello</p>","images":[]}"#),
                Err(StructuringError::permanent("HTTP 403")),
            ],
        );
        let client = StructuringClient::new(b, fast_policy(0));
        let err = build_book(&client, pages(), &config(SectionFailurePolicy::Abort), DocumentMetadata::titled("S"))
            .await
            .unwrap_err();
        assert!(matches!(err, EpubError::SectionFailed { order: 2, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn all_sections_failing_is_fatal() {
        let b = backend(
            OUTLINE,
            &[
                Err(StructuringError::permanent("HTTP 401")),
                Err(StructuringError::permanent("HTTP 401")),
            ],
        );
        let client = StructuringClient::new(b, fast_policy(0));
        let err = build_book(
            &client,
            pages(),
            &config(SectionFailurePolicy::Placeholder),
            DocumentMetadata::titled("S"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EpubError::AllSectionsFailed { total: 2, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn outline_failure_is_fatal() {
        let b = ScriptedBackend::default();
        b.push_complete(Err(StructuringError::permanent("HTTP 401")));
        let client = StructuringClient::new(Arc::new(b), fast_policy(0));
        let err = build_book(
            &client,
            pages(),
            &config(SectionFailurePolicy::Placeholder),
            DocumentMetadata::titled("S"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EpubError::Structuring(_)));
    }

    #[tokio::test]
    async fn empty_outline_uses_book_title() {
        let b = backend(r#"{"sections":[]}"#, &[Ok(r#"{"xhtml":"<p>x</p>"}"#)]);
        let client = StructuringClient::new(b, fast_policy(0));
        let (manifest, _) = build_book(
            &client,
            pages(),
            &config(SectionFailurePolicy::Placeholder),
            DocumentMetadata::titled("Field Guide"),
        )
        .await
        .unwrap();
        assert_eq!(manifest.toc.len(), 1);
        assert_eq!(manifest.toc[0].title, "Field Guide");
        assert_eq!(manifest.toc[0].href, "field-guide.xhtml");
    }

    #[tokio::test]
    async fn progress_events_are_reported() {
        struct Counter {
            started: AtomicUsize,
            done: AtomicUsize,
            errors: AtomicUsize,
        }
        impl crate::progress::ConversionProgressCallback for Counter {
            fn on_section_start(&self, _: usize, _: usize, _: &str) {
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn on_section_complete(&self, _: usize, _: usize, _: &str) {
                self.done.fetch_add(1, Ordering::SeqCst);
            }
            fn on_section_error(&self, _: usize, _: usize, _: &str) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter {
            started: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let cfg = ConversionConfig::builder()
            .auto_cover(false)
            .fetch_metadata(false)
            .progress_callback(counter.clone())
            .build()
            .unwrap();
        let b = backend(
            OUTLINE,
            &[
                Ok(r#"{"xhtml":"<p>a</p>"}"#),
                Err(StructuringError::permanent("HTTP 403")),
            ],
        );
        let client = StructuringClient::new(b, fast_policy(0));
        // Concurrency 4: both sections are in flight, responses are served in request order.
        build_book(&client, pages(), &cfg, DocumentMetadata::titled("S")).await.unwrap();
        assert_eq!(counter.started.load(Ordering::SeqCst), 2);
        assert_eq!(counter.done.load(Ordering::SeqCst), 1);
        assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
    }
}
