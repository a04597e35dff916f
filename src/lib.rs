//! # pdf2epub
//!
//! Convert PDF documents into EPUB books using an LLM structuring service.
//!
//! ## Why this crate?
//!
//! Text extracted from a PDF has lost its structure: chapters, headings,
//! footnotes and figures are flattened into positioned glyphs. Here a
//! multimodal model reads the document and answers three kinds of question
//! (what are the sections, what is the markup of section N, what is the
//! book's metadata). This crate turns those answers into a valid, reflowable
//! EPUB with figures cropped out of the rendered pages.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      validate path, PDF magic bytes
//!  ├─ 2. Render     open via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Outline    one request, fatal on failure
//!  ├─ 4. Sections   concurrent requests; figures cropped as each arrives
//!  ├─ 5. Assemble   normalise markup, headings, image refs, 150-col wrap
//!  └─ 6. Package    OPF + NCX + nav + documents → zip, written atomically
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2epub::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .api_key(std::env::var("GEMINI_API_KEY")?)
//!         .build()?;
//!     let stats = convert("report.pdf", "report.epub", &config).await?;
//!     eprintln!("{}/{} sections", stats.converted_sections, stats.total_sections);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2epub` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf2epub = { version = "0.3", default-features = false }
//! ```
//!
//! ## Choosing a Backend
//!
//! With a Gemini API key the PDF itself is sent inline and responses are
//! streamed. Any other edgequake-llm provider receives rendered page images
//! instead, which costs more tokens but needs no PDF support from the model.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod epub;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod structuring;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder, SectionFailurePolicy};
pub use convert::{build_book, convert, convert_sync};
pub use epub::BookManifest;
pub use error::{EpubError, ExtractionError, PackagingError, SectionError, StructuringError};
pub use output::{ConversionStats, CoverKind, DocumentMetadata, SectionReport};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use structuring::{StructuringBackend, StructuringClient};
