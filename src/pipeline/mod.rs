//! Pipeline stages that turn one PDF plus structured sections into
//! content documents.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and none of them talks to the structuring service.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ extract ──▶ section
//! (path)    (pdfium)   (crop +      (normalize, heading,
//!                       geometry)    images, wrap)
//! ```
//!
//! 1. [`input`]: validate the user-supplied path
//! 2. [`render`]: rasterise pages; blocking, callers use `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`]: PNG/JPEG encoding, base64 page attachments for vision
//!    providers
//! 4. [`geometry`]: decide whether a region is a figure or decoration
//! 5. [`extract`]: crop figures out of rendered pages
//! 6. [`postprocess`]: deterministic markup cleanup to fix model quirks
//! 7. [`wrap`]: 150-column soft wrap outside `<pre>`
//! 8. [`section`]: build one content document per outline entry

pub mod encode;
pub mod extract;
pub mod geometry;
pub mod input;
pub mod postprocess;
pub mod render;
pub mod section;
pub mod wrap;
