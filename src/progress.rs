//! Progress-callback trait for per-section conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline fetches and assembles each section. The CLI uses
//! it to drive an `indicatif` bar.
//!
//! # Example
//!
//! ```rust
//! use pdf2epub::{ConversionProgressCallback, ConversionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_section_complete(&self, order: usize, total: usize, title: &str) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{order}/{total} {title}");
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the conversion pipeline as it processes each section.
///
/// Section fetches run concurrently, so `on_section_start`,
/// `on_section_complete` and `on_section_error` may be called from
/// different tasks at the same time. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once, after the outline is known and before any section request.
    fn on_conversion_start(&self, total_sections: usize) {
        let _ = total_sections;
    }

    /// Called just before a section's content request is sent.
    ///
    /// `order` is 1-based.
    fn on_section_start(&self, order: usize, total_sections: usize, title: &str) {
        let _ = (order, total_sections, title);
    }

    /// Called when a section's content and images are ready.
    fn on_section_complete(&self, order: usize, total_sections: usize, title: &str) {
        let _ = (order, total_sections, title);
    }

    /// Called when a section failed after all retries.
    fn on_section_error(&self, order: usize, total_sections: usize, error: &str) {
        let _ = (order, total_sections, error);
    }

    /// Called once after every section has been attempted.
    fn on_conversion_complete(&self, total_sections: usize, success_count: usize) {
        let _ = (total_sections, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        completes: AtomicUsize,
        errors: Mutex<Vec<(usize, String)>>,
    }

    impl ConversionProgressCallback for Recorder {
        fn on_section_complete(&self, _order: usize, _total: usize, _title: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_section_error(&self, order: usize, _total: usize, error: &str) {
            self.errors.lock().unwrap().push((order, error.to_string()));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_conversion_start(3);
        cb.on_section_start(1, 3, "Intro");
        cb.on_section_complete(1, 3, "Intro");
        cb.on_section_error(2, 3, "timeout");
        cb.on_conversion_complete(3, 2);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Arc::new(Recorder::default());
        let cb: ProgressCallback = rec.clone();
        cb.on_section_complete(1, 2, "One");
        cb.on_section_error(2, 2, "permanent error: HTTP 401");
        assert_eq!(rec.completes.load(Ordering::SeqCst), 1);
        assert_eq!(rec.errors.lock().unwrap()[0].0, 2);
    }
}
