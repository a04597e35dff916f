//! Native Gemini backend over the REST API.
//!
//! The whole PDF travels inline with every request (base64, `application/pdf`),
//! so the model sees text, layout and figures exactly as printed. JSON output
//! is requested through `responseMimeType`.
//!
//! Streaming uses `:streamGenerateContent?alt=sse`; every SSE `data:` payload
//! is a partial `GenerateContentResponse` whose text parts are forwarded as
//! chunks.

use crate::config::{ConversionConfig, DEFAULT_GEMINI_MODEL};
use crate::error::{EpubError, StructuringError};
use crate::prompts::DEFAULT_SYSTEM_PROMPT;
use crate::structuring::backend::{ChunkStream, StructuringBackend, StructuringRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Gemini `generateContent` backend.
pub struct GeminiBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    pdf_base64: Arc<str>,
}

impl GeminiBackend {
    /// Build a backend for one document.
    pub fn new(config: &ConversionConfig, api_key: &str, pdf: &[u8]) -> Result<Self, EpubError> {
        if api_key.trim().is_empty() {
            return Err(EpubError::ProviderNotConfigured {
                provider: "gemini".into(),
                hint: "Set GEMINI_API_KEY or pass --api-key.".into(),
            });
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EpubError::ProviderNotConfigured {
                provider: "gemini".into(),
                hint: format!("HTTP client: {e}"),
            })?;
        let model = config
            .model
            .as_deref()
            .unwrap_or(DEFAULT_GEMINI_MODEL)
            .trim_start_matches("models/")
            .to_string();

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            model,
            api_key: api_key.trim().to_string(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            pdf_base64: STANDARD.encode(pdf).into(),
        })
    }

    fn endpoint(&self, streaming: bool) -> String {
        if streaming {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, self.model
            )
        } else {
            format!("{}/models/{}:generateContent", self.base_url, self.model)
        }
    }

    fn body<'a>(&'a self, instruction: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part::Text {
                    text: &self.system_prompt,
                }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![
                    Part::Text { text: instruction },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: "application/pdf",
                            data: &self.pdf_base64,
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        }
    }

    async fn send(
        &self,
        request: &StructuringRequest,
        streaming: bool,
    ) -> Result<reqwest::Response, StructuringError> {
        let instruction = request.instruction();
        debug!(
            "gemini: {} {} (stream={})",
            self.model,
            request.debug_name(),
            streaming
        );
        let response = self
            .http
            .post(self.endpoint(streaming))
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(&instruction))
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl StructuringBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, request: &StructuringRequest) -> Result<String, StructuringError> {
        let response = self.send(request, false).await?;
        let parsed: GenerateResponse = response.json().await.map_err(map_reqwest)?;
        parsed.check_blocked()?;
        let text = parsed.text();
        if text.trim().is_empty() {
            return Err(StructuringError::transient(format!(
                "empty response (finish reason: {})",
                parsed.finish_reason().unwrap_or("unknown")
            )));
        }
        Ok(text)
    }

    async fn stream(&self, request: &StructuringRequest) -> Result<ChunkStream, StructuringError> {
        let response = self.send(request, true).await?;
        let state = SseState {
            bytes: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        };
        let chunks = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.done {
                    return None;
                }
                match st.bytes.next().await {
                    Some(Ok(bytes)) => {
                        for payload in st.decoder.feed(&bytes) {
                            st.pending.extend(parse_event(&payload));
                        }
                    }
                    Some(Err(e)) => {
                        st.pending.push_back(Err(map_reqwest(e)));
                        st.done = true;
                    }
                    None => {
                        if let Some(payload) = st.decoder.finish() {
                            st.pending.extend(parse_event(&payload));
                        }
                        st.done = true;
                    }
                }
            }
        });
        Ok(chunks.boxed())
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, StructuringError>>,
    done: bool,
}

/// Turn one SSE payload into a text chunk. Events without text yield nothing.
fn parse_event(payload: &str) -> Option<Result<String, StructuringError>> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            return Some(Err(StructuringError::transient(format!(
                "undecodable stream event: {e}"
            ))))
        }
    };
    if let Some(err) = value.get("error") {
        let code = err.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16;
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Some(Err(classify_status(status, &err.to_string())));
    }
    let parsed: GenerateResponse = match serde_json::from_value(value) {
        Ok(p) => p,
        Err(e) => {
            return Some(Err(StructuringError::transient(format!(
                "unexpected stream event: {e}"
            ))))
        }
    };
    if let Err(e) = parsed.check_blocked() {
        return Some(Err(e));
    }
    let text = parsed.text();
    (!text.is_empty()).then_some(Ok(text))
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes are buffered until a blank line closes an event; the `data:` lines
/// of that event are joined and returned. Carriage returns are dropped so
/// `\r\n` framing works too.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the payloads of every event completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(payload) = data_payload(&block) {
                events.push(payload);
            }
        }
        events
    }

    /// Flush an event left without a terminating blank line.
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buf);
        data_payload(&block)
    }
}

fn data_payload(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Map a non-success HTTP status to an error kind.
///
/// 408, 429 and 5xx are worth retrying; every other 4xx (bad key, bad
/// request, permission) will fail the same way again.
pub fn classify_status(status: StatusCode, body: &str) -> StructuringError {
    let snippet: String = body.chars().take(300).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet.trim());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        StructuringError::transient(message)
    } else {
        StructuringError::permanent(message)
    }
}

fn map_reqwest(e: reqwest::Error) -> StructuringError {
    if e.is_builder() {
        StructuringError::permanent(format!("invalid request: {e}"))
    } else if e.is_timeout() {
        StructuringError::transient(format!("request timed out: {e}"))
    } else {
        StructuringError::transient(e.to_string())
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
    max_output_tokens: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text parts of the first candidate.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.candidates.first()?.finish_reason.as_deref()
    }

    /// A blocked prompt fails identically on every retry.
    fn check_blocked(&self) -> Result<(), StructuringError> {
        match self.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_deref()) {
            Some(reason) => Err(StructuringError::permanent(format!(
                "prompt blocked by the service: {reason}"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StructuringErrorKind;

    #[test]
    fn sse_decoder_splits_events_across_chunks() {
        let mut dec = SseDecoder::default();
        assert!(dec.feed(b"data: {\"a\"").is_empty());
        let events = dec.feed(b":1}\r\n\r\ndata: {\"b\":2}\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn sse_decoder_flushes_unterminated_event() {
        let mut dec = SseDecoder::default();
        assert!(dec.feed(b": keep-alive\n\ndata: tail").is_empty());
        assert_eq!(dec.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn status_classification() {
        let kind = |code: u16| classify_status(StatusCode::from_u16(code).unwrap(), "x").kind;
        assert_eq!(kind(503), StructuringErrorKind::Transient);
        assert_eq!(kind(504), StructuringErrorKind::Transient);
        assert_eq!(kind(429), StructuringErrorKind::Transient);
        assert_eq!(kind(408), StructuringErrorKind::Transient);
        assert_eq!(kind(401), StructuringErrorKind::Permanent);
        assert_eq!(kind(403), StructuringErrorKind::Permanent);
        assert_eq!(kind(400), StructuringErrorKind::Permanent);
    }

    #[test]
    fn event_text_is_concatenated() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\""},{"text":":1}"}]}}]}"#;
        assert_eq!(parse_event(payload).unwrap().unwrap(), "{\"a\":1}");
    }

    #[test]
    fn event_without_text_is_skipped() {
        let payload = r#"{"candidates":[{"finishReason":"STOP"}]}"#;
        assert!(parse_event(payload).is_none());
        assert!(parse_event("[DONE]").is_none());
    }

    #[test]
    fn error_event_is_classified() {
        let payload = r#"{"error":{"code":503,"message":"overloaded"}}"#;
        let err = parse_event(payload).unwrap().unwrap_err();
        assert_eq!(err.kind, StructuringErrorKind::Transient);
        let payload = r#"{"error":{"code":403,"message":"denied"}}"#;
        assert!(parse_event(payload).unwrap().unwrap_err().is_permanent());
    }

    #[test]
    fn blocked_prompt_is_permanent() {
        let payload = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert!(parse_event(payload).unwrap().unwrap_err().is_permanent());
    }

    #[test]
    fn request_body_shape() {
        let config = ConversionConfig::builder().build().unwrap();
        let backend = GeminiBackend::new(&config, "key", b"%PDF-1.7").unwrap();
        let body = serde_json::to_value(backend.body("Do it")).unwrap();
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Do it");
        assert_eq!(
            body["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            "application/pdf"
        );
        assert_eq!(
            body["contents"][0]["parts"][1]["inlineData"]["data"],
            STANDARD.encode(b"%PDF-1.7")
        );
        assert!(body["systemInstruction"]["role"].is_null());
        assert!(backend.endpoint(true).ends_with(":streamGenerateContent?alt=sse"));
        assert!(backend.endpoint(false).contains("/models/gemini-2.5-pro:generateContent"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let config = ConversionConfig::default();
        assert!(GeminiBackend::new(&config, "  ", b"%PDF").is_err());
    }
}
