//! Resilient client for the external structuring service.
//!
//! ## Request protocol
//!
//! Every logical request (outline, metadata, one section) goes through
//! [`StructuringClient::request`]:
//!
//! 1. If the backend streams, one streaming attempt is made. Chunks go into a
//!    [`StreamAccumulator`]; a dropped connection, an idle gap longer than
//!    `stream_idle_timeout_secs`, or a stream that ends inside incomplete JSON
//!    leaves it `Aborted`, and the client falls back immediately.
//! 2. Non-streaming attempts follow, up to `1 + max_retries` of them. Before
//!    retry *n* the client sleeps `min(base · 2^(n-1), cap)` plus jitter.
//! 3. Each response is parsed with JSON repair; a malformed response is
//!    retried like a transient failure.
//!
//! Permanent errors (auth, bad request) end the request at once, streaming or
//! not. Sleeps are per request, so a backing-off section never delays its
//! siblings.

pub mod accumulator;
pub mod backend;
pub mod gemini;
pub mod json;
pub mod provider;
pub mod types;

pub use accumulator::{StreamAccumulator, StreamState};
pub use backend::{ChunkStream, StructuringBackend, StructuringRequest};
pub use gemini::GeminiBackend;
pub use provider::ProviderBackend;
pub use types::{ImageRegion, NormalizedBox, Outline, SectionContent, SectionRef};

use crate::config::ConversionConfig;
use crate::error::StructuringError;
use crate::output::DocumentMetadata;
use futures::StreamExt;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Retry and timeout knobs, read once from [`ConversionConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
            request_timeout: Duration::from_secs(config.api_timeout_secs),
            idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
        }
    }

    /// Delay before retry `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before retry `retry` with uniform jitter added.
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(extra)
    }
}

/// Writes raw responses next to the output when `--debug` is on.
#[derive(Debug, Clone)]
pub struct DebugSink {
    dir: PathBuf,
    stem: String,
}

impl DebugSink {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// `<dir>/<stem>_<name>_raw.json`
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_{}_raw.json", self.stem, name))
    }

    /// Best effort: a failed write is logged, never fatal.
    pub async fn write(&self, name: &str, text: &str) {
        let path = self.path_for(name);
        match tokio::fs::write(&path, text).await {
            Ok(()) => debug!("Wrote {}", path.display()),
            Err(e) => warn!("Could not write debug file {}: {}", path.display(), e),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Issues outline, metadata and section requests with fallback and retries.
pub struct StructuringClient {
    backend: Arc<dyn StructuringBackend>,
    policy: RetryPolicy,
    debug: Option<DebugSink>,
}

impl StructuringClient {
    pub fn new(backend: Arc<dyn StructuringBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            debug: None,
        }
    }

    pub fn with_debug(mut self, sink: DebugSink) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Enumerate the document's sections. May return an empty outline.
    pub async fn fetch_outline(&self) -> Result<Outline, StructuringError> {
        let outline = self
            .request(&StructuringRequest::Outline, json::parse_outline)
            .await?;
        info!("Outline has {} sections", outline.len());
        Ok(outline)
    }

    /// Fetch body markup and image regions for one section.
    pub async fn fetch_section_content(
        &self,
        section: &SectionRef,
    ) -> Result<SectionContent, StructuringError> {
        self.request(
            &StructuringRequest::Section(section.clone()),
            json::parse_section,
        )
        .await
    }

    /// Fetch bibliographic metadata.
    pub async fn fetch_metadata(&self) -> Result<DocumentMetadata, StructuringError> {
        self.request(&StructuringRequest::Metadata, json::parse_metadata)
            .await
    }

    /// Run one logical request through the streaming/fallback/retry protocol.
    pub async fn request<T, F>(
        &self,
        request: &StructuringRequest,
        parse: F,
    ) -> Result<T, StructuringError>
    where
        F: Fn(&str) -> Result<T, StructuringError>,
    {
        let name = request.debug_name();
        let mut last_err: Option<StructuringError> = None;

        if self.backend.supports_streaming() {
            match self.stream_once(request).await {
                Ok(text) => {
                    self.dump(&name, &text).await;
                    match parse(&text) {
                        Ok(value) => return Ok(value),
                        Err(e) => {
                            warn!("{}: streamed response unusable ({}), falling back", name, e);
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    warn!("{}: streaming failed ({}), retrying without streaming", name, e);
                    last_err = Some(e);
                }
            }
        }

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = self.policy.delay(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    name,
                    attempt,
                    self.policy.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            let text = match timeout(self.policy.request_timeout, self.backend.complete(request))
                .await
            {
                Ok(Ok(text)) => text,
                Ok(Err(e)) if e.is_permanent() => {
                    warn!("{}: permanent failure: {}", name, e);
                    return Err(e);
                }
                Ok(Err(e)) => {
                    warn!("{}: attempt {} failed: {}", name, attempt + 1, e);
                    last_err = Some(e);
                    continue;
                }
                Err(_) => {
                    let e = StructuringError::transient(format!(
                        "request timed out after {}s",
                        self.policy.request_timeout.as_secs()
                    ));
                    warn!("{}: attempt {} failed: {}", name, attempt + 1, e);
                    last_err = Some(e);
                    continue;
                }
            };

            self.dump(&name, &text).await;
            match parse(&text) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{}: attempt {} returned {}", name, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StructuringError::transient("no attempt was made")))
    }

    /// One streaming attempt. `Ok` only when the accumulator completed.
    async fn stream_once(&self, request: &StructuringRequest) -> Result<String, StructuringError> {
        let mut acc = StreamAccumulator::new();
        let outcome = timeout(self.policy.request_timeout, self.drain(request, &mut acc)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => acc.abort(format!(
                "request timed out after {}s",
                self.policy.request_timeout.as_secs()
            )),
        }
        acc.finish()
    }

    /// Pull chunks into `acc` until the stream ends, stalls or fails.
    ///
    /// Only permanent errors are returned; everything else aborts `acc`.
    async fn drain(
        &self,
        request: &StructuringRequest,
        acc: &mut StreamAccumulator,
    ) -> Result<(), StructuringError> {
        let mut chunks = match self.backend.stream(request).await {
            Ok(s) => s,
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                acc.abort(format!("stream could not start: {}", e.message));
                return Ok(());
            }
        };
        loop {
            match timeout(self.policy.idle_timeout, chunks.next()).await {
                Err(_) => {
                    acc.abort(format!(
                        "no data for {}s",
                        self.policy.idle_timeout.as_secs()
                    ));
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(Ok(chunk))) => acc.push(&chunk),
                Ok(Some(Err(e))) if e.is_permanent() => return Err(e),
                Ok(Some(Err(e))) => {
                    acc.abort(e.message);
                    return Ok(());
                }
            }
        }
    }

    async fn dump(&self, name: &str, text: &str) {
        if let Some(sink) = &self.debug {
            sink.write(name, text).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend shared by unit tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted streaming outcome.
    pub enum StreamScript {
        /// Fail before the first chunk.
        Refuse(StructuringError),
        /// Yield these items, then end.
        Chunks(Vec<Result<String, StructuringError>>),
    }

    #[derive(Default)]
    pub struct ScriptedBackend {
        pub streams: Mutex<VecDeque<StreamScript>>,
        pub completions: Mutex<VecDeque<Result<String, StructuringError>>>,
        pub stream_calls: Mutex<usize>,
        pub complete_calls: Mutex<usize>,
        pub streaming: bool,
    }

    impl ScriptedBackend {
        pub fn streaming() -> Self {
            Self {
                streaming: true,
                ..Default::default()
            }
        }

        pub fn push_stream(&self, script: StreamScript) {
            self.streams.lock().unwrap().push_back(script);
        }

        pub fn push_complete(&self, result: Result<String, StructuringError>) {
            self.completions.lock().unwrap().push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl StructuringBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_streaming(&self) -> bool {
            self.streaming
        }

        async fn complete(&self, _r: &StructuringRequest) -> Result<String, StructuringError> {
            *self.complete_calls.lock().unwrap() += 1;
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(StructuringError::permanent("script exhausted")))
        }

        async fn stream(&self, _r: &StructuringRequest) -> Result<ChunkStream, StructuringError> {
            *self.stream_calls.lock().unwrap() += 1;
            match self.streams.lock().unwrap().pop_front() {
                Some(StreamScript::Refuse(e)) => Err(e),
                Some(StreamScript::Chunks(items)) => Ok(futures::stream::iter(items).boxed()),
                None => Err(StructuringError::permanent("script exhausted")),
            }
        }
    }

    pub fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::StructuringErrorKind;

    const SECTION_JSON: &str =
        r#"{"xhtml": "<h1>2 Results</h1><p>Done.</p>", "images": [{"box_2d": [100, 100, 600, 900], "page_index": 4}]}"#;

    fn section() -> SectionRef {
        SectionRef::new(2, "Results").with_numbering("2")
    }

    fn client(backend: Arc<ScriptedBackend>, retries: u32) -> StructuringClient {
        StructuringClient::new(backend, fast_policy(retries))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(5000),
            jitter: Duration::ZERO,
            ..fast_policy(5)
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(4), Duration::from_millis(5000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
            ..fast_policy(1)
        };
        for _ in 0..50 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn transient_stream_failure_then_fallback_matches_direct_success() {
        let direct = Arc::new(ScriptedBackend::streaming());
        direct.push_stream(StreamScript::Chunks(vec![
            Ok(SECTION_JSON[..20].to_string()),
            Ok(SECTION_JSON[20..].to_string()),
        ]));
        let expected = client(direct, 3).fetch_section_content(&section()).await.unwrap();

        let flaky = Arc::new(ScriptedBackend::streaming());
        flaky.push_stream(StreamScript::Refuse(StructuringError::transient("HTTP 504")));
        flaky.push_complete(Ok(SECTION_JSON.to_string()));
        let got = client(flaky.clone(), 3)
            .fetch_section_content(&section())
            .await
            .unwrap();

        assert_eq!(got, expected);
        assert_eq!(got.image_regions.len(), 1);
        assert_eq!(*flaky.complete_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn stream_dropped_mid_json_falls_back() {
        let backend = Arc::new(ScriptedBackend::streaming());
        backend.push_stream(StreamScript::Chunks(vec![
            Ok("{\"xhtml\": \"<p>par".into()),
            Err(StructuringError::transient("connection reset")),
        ]));
        backend.push_complete(Ok(SECTION_JSON.into()));
        let got = client(backend.clone(), 0)
            .fetch_section_content(&section())
            .await
            .unwrap();
        assert!(got.markup.contains("Results"));
        assert_eq!(*backend.stream_calls.lock().unwrap(), 1);
        assert_eq!(*backend.complete_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn incomplete_stream_without_error_falls_back() {
        let backend = Arc::new(ScriptedBackend::streaming());
        backend.push_stream(StreamScript::Chunks(vec![Ok("{\"sections\": [".into())]));
        backend.push_complete(Ok(r#"{"sections": [{"title": "A"}]}"#.into()));
        let outline = client(backend, 0).fetch_outline().await.unwrap();
        assert_eq!(outline.len(), 1);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::streaming());
        backend.push_stream(StreamScript::Refuse(StructuringError::permanent("HTTP 401")));
        backend.push_complete(Ok(SECTION_JSON.into()));
        let err = client(backend.clone(), 3)
            .fetch_section_content(&section())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(*backend.complete_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_error_during_retries_stops_loop() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_complete(Err(StructuringError::transient("HTTP 503")));
        backend.push_complete(Err(StructuringError::permanent("HTTP 403")));
        backend.push_complete(Ok(SECTION_JSON.into()));
        let err = client(backend.clone(), 5)
            .fetch_section_content(&section())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(*backend.complete_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_response_is_retried() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_complete(Ok("Sorry, I cannot produce JSON.".into()));
        backend.push_complete(Ok(format!("```json\n{SECTION_JSON}\n```")));
        let got = client(backend.clone(), 2)
            .fetch_section_content(&section())
            .await
            .unwrap();
        assert_eq!(got.image_regions[0].page_index, 4);
        assert_eq!(*backend.complete_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = Arc::new(ScriptedBackend::default());
        for _ in 0..10 {
            backend.push_complete(Err(StructuringError::transient("HTTP 500")));
        }
        let err = client(backend.clone(), 2).fetch_outline().await.unwrap_err();
        assert_eq!(err.kind, StructuringErrorKind::Transient);
        assert_eq!(*backend.complete_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn final_malformed_error_is_reported() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_complete(Ok("{}".into()));
        let err = client(backend, 0).fetch_outline().await.unwrap_err();
        assert_eq!(err.kind, StructuringErrorKind::Malformed);
    }

    #[tokio::test]
    async fn debug_sink_receives_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_complete(Ok(SECTION_JSON.into()));
        let c = client(backend, 0).with_debug(DebugSink::new(dir.path(), "book"));
        c.fetch_section_content(&section()).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("book_sec02_raw.json")).unwrap();
        assert_eq!(written, SECTION_JSON);
    }
}
