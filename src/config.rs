//! Configuration for a PDF-to-EPUB run.
//!
//! Every knob lives in [`ConversionConfig`], built once through
//! [`ConversionConfigBuilder`] and passed by reference into the pipeline.
//! The pipeline never mutates it, so one config can drive several runs
//! (or several concurrent runs targeting different output paths).

use crate::error::EpubError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default model for the native Gemini backend.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";

/// Default base URL for the Gemini REST API.
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for a PDF-to-EPUB conversion.
///
/// # Example
/// ```rust
/// use pdf2epub::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .concurrency(2)
///     .api_key("test-key")
///     .auto_cover(false)
///     .build()
///     .unwrap();
/// assert!(!config.auto_cover);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Rendering DPI for page images (cover, figure crops, vision uploads).
    /// Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Cap on the longest rendered page side in pixels. Default: 2000.
    ///
    /// Normalised image regions are resolved against this rendering, so a
    /// higher cap gives sharper figures at the cost of memory.
    pub max_rendered_pixels: u32,

    /// Section-content requests in flight at once. Default: 4.
    pub concurrency: usize,

    /// Model identifier. For Gemini defaults to [`DEFAULT_GEMINI_MODEL`];
    /// for other providers `None` means the provider default.
    pub model: Option<String>,

    /// edgequake-llm provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over everything else.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// API key for the native Gemini backend.
    pub api_key: Option<String>,

    /// Base URL for the native Gemini backend. Default: [`DEFAULT_GEMINI_BASE_URL`].
    pub api_base_url: String,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Output token ceiling per request. Default: 32768.
    ///
    /// Section bodies for long chapters are large; a low limit truncates the
    /// JSON mid-string and every attempt comes back malformed.
    pub max_tokens: usize,

    /// Retries after the first attempt of a request. Default: 3.
    pub max_retries: u32,

    /// Base backoff delay in milliseconds, doubled per retry. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single backoff delay. Default: 30000.
    pub max_backoff_ms: u64,

    /// Uniform random jitter added to each delay. Default: 250.
    pub retry_jitter_ms: u64,

    /// Whole-request timeout in seconds. Default: 300.
    pub api_timeout_secs: u64,

    /// Abort a stream when no chunk arrives for this long. Default: 120.
    pub stream_idle_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Explicit cover image (PNG or JPEG). Wins over the auto cover.
    pub cover_image: Option<PathBuf>,

    /// Render the first page as the cover when no explicit cover is given. Default: true.
    pub auto_cover: bool,

    /// Also write the unpacked package tree next to the output. Default: false.
    pub keep_sources: bool,

    /// Write raw service responses next to the output. Default: false.
    pub debug: bool,

    /// Ask the service for book metadata (title, authors, ...). Default: true.
    pub fetch_metadata: bool,

    /// What to do when a section's content cannot be fetched. Default: Placeholder.
    pub section_failure: SectionFailurePolicy,

    /// Optional per-section progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 2000,
            concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            api_key: None,
            api_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            temperature: 0.1,
            max_tokens: 32768,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            retry_jitter_ms: 250,
            api_timeout_secs: 300,
            stream_idle_timeout_secs: 120,
            password: None,
            system_prompt: None,
            cover_image: None,
            auto_cover: true,
            keep_sources: false,
            debug: false,
            fetch_metadata: true,
            section_failure: SectionFailurePolicy::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("cover_image", &self.cover_image)
            .field("auto_cover", &self.auto_cover)
            .field("keep_sources", &self.keep_sources)
            .field("debug", &self.debug)
            .field("fetch_metadata", &self.fetch_metadata)
            .field("section_failure", &self.section_failure)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn retry_jitter_ms(mut self, ms: u64) -> Self {
        self.config.retry_jitter_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn stream_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stream_idle_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn cover_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cover_image = Some(path.into());
        self
    }

    pub fn auto_cover(mut self, v: bool) -> Self {
        self.config.auto_cover = v;
        self
    }

    pub fn keep_sources(mut self, v: bool) -> Self {
        self.config.keep_sources = v;
        self
    }

    pub fn debug(mut self, v: bool) -> Self {
        self.config.debug = v;
        self
    }

    pub fn fetch_metadata(mut self, v: bool) -> Self {
        self.config.fetch_metadata = v;
        self
    }

    pub fn section_failure(mut self, policy: SectionFailurePolicy) -> Self {
        self.config.section_failure = policy;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, EpubError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(EpubError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(EpubError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.max_tokens == 0 {
            return Err(EpubError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 || c.stream_idle_timeout_secs == 0 {
            return Err(EpubError::InvalidConfig(
                "Timeouts must be at least one second".into(),
            ));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(EpubError::InvalidConfig(format!(
                "max_backoff_ms ({}) is below retry_backoff_ms ({})",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Run-level reaction to a section whose content fetch failed after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SectionFailurePolicy {
    /// Substitute a placeholder document and keep going. (default)
    ///
    /// The run still fails if every section failed.
    #[default]
    Placeholder,
    /// Abort the whole run on the first failed section.
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = ConversionConfig::builder().build().unwrap();
        assert_eq!(c.dpi, 150);
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.max_retries, 3);
        assert!(c.auto_cover);
        assert!(c.fetch_metadata);
        assert_eq!(c.section_failure, SectionFailurePolicy::Placeholder);
    }

    #[test]
    fn dpi_out_of_range_rejected() {
        let err = ConversionConfig::builder().dpi(600).build().unwrap_err();
        assert!(err.to_string().contains("DPI"), "got: {err}");
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(ConversionConfig::builder().concurrency(0).build().is_err());
    }

    #[test]
    fn backoff_cap_below_base_rejected() {
        let err = ConversionConfig::builder()
            .retry_backoff_ms(5000)
            .max_backoff_ms(100)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_backoff_ms"));
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let c = ConversionConfig::builder()
            .api_key("sk-very-secret")
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-very-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
