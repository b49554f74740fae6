//! Upstream Adapters (C4): provider-specific request shaping and streaming
//! SSE parsing into a unified usage tuple (spec §4.4).
//!
//! Heavily grounded on `api/proxy.rs`'s `chat_completions` handler: the
//! gzip-transparency check, sensitive-header stripping, in-stream error
//! peeking, and provider-specific rate-limit header parsing all generalize
//! patterns that file implements inline for a single OpenAI-compatible
//! branch. Here they are factored into a registry of adapters implementing
//! one shared `{Name, Platform, SupportedTypes, Send, SendStream}` contract
//! (spec §9 "Adapter polymorphism"), matching the static-registration,
//! lock-free-lookup design `provider_health.rs`'s `ModelChainStore` uses for
//! account resolution.

pub mod claude;
pub mod claude_ccr;
pub mod gemini;
pub mod openai_responses;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::accounts::{Account, Platform};
use crate::error::GatewayError;

/// Heterogeneous message content (spec §9): represented as a tagged variant
/// rather than an untyped JSON value, so converters operate on real cases.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "source", skip_serializing_if = "Option::is_none")]
    pub image_source: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

/// Unified request envelope (spec §4.4). `raw_body` carries the client's
/// original bytes so transparent forwarding is preferred whenever shapes
/// match; adapters only perform field-level remapping when adapting across
/// formats.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Option<Vec<Message>>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub stop: Option<Vec<String>>,
    pub system: Option<MessageContent>,
    pub tools: Option<serde_json::Value>,
    pub raw_body: Bytes,
    pub headers: Vec<(String, String)>,
    pub path: String,
}

#[derive(Debug, Clone, Default)]
pub struct SendResult {
    pub id: String,
    pub model: String,
    pub content: String,
    pub stop_reason: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub headers: HashMap<String, String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub headers: HashMap<String, String>,
}

/// Headers stripped from the client's request before forwarding upstream
/// (spec §4.4 invariant 6).
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "host",
    "content-length",
    "connection",
    "proxy-authorization",
    "accept-encoding",
];

pub fn sanitize_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .cloned()
        .collect()
}

/// Authentication header selection priority: sessionKey → accessToken →
/// apiKey (spec §4.4 invariant 5). Returns `(header_name, header_value,
/// extra_beta_header)`; the beta header is only set for Claude OAuth.
pub fn select_auth_header(account: &Account, anthropic_beta_header: bool) -> (String, String, Option<(String, String)>) {
    let creds = &account.credentials;
    if let Some(session_key) = &creds.session_key {
        return (
            "authorization".to_string(),
            format!("Bearer {session_key}"),
            None,
        );
    }
    if let Some(access_token) = &creds.access_token {
        let beta = anthropic_beta_header.then(|| {
            ("anthropic-beta".to_string(), "oauth-2025-04-20".to_string())
        });
        return ("authorization".to_string(), format!("Bearer {access_token}"), beta);
    }
    let api_key = creds.api_key.clone().unwrap_or_default();
    match account.platform {
        Platform::Claude => ("x-api-key".to_string(), api_key, None),
        _ => ("authorization".to_string(), format!("Bearer {api_key}"), None),
    }
}

/// Appends the oauth beta value to an existing `anthropic-beta` header
/// instead of clobbering it (spec §4.4 invariant 5).
pub fn merge_anthropic_beta(existing: Option<&str>, value: &str) -> String {
    match existing {
        Some(existing) if !existing.is_empty() => format!("{existing},{value}"),
        _ => value.to_string(),
    }
}

/// Detects gzip either via `Content-Encoding: gzip` or magic bytes `0x1f
/// 0x8b` at the start of the body (spec §4.4 invariant 4), and returns a
/// byte stream that is always plain SSE text regardless of which applied.
pub async fn decompress_if_gzip(
    content_encoding: Option<&str>,
    mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin + Send + 'static,
) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin + Send + 'static {
    let declared_gzip = content_encoding
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let first_chunk = byte_stream.next().await;
    let magic_gzip = first_chunk
        .as_ref()
        .and_then(|c| c.as_ref().ok())
        .map(|b| b.len() >= 2 && b[0] == 0x1f && b[1] == 0x8b)
        .unwrap_or(false);

    let rechained = futures::stream::iter(first_chunk.into_iter()).chain(byte_stream);

    if declared_gzip || magic_gzip {
        gzip_decode_stream(rechained)
    } else {
        Box::pin(rechained.map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))))
    }
}

type BoxedByteStream = std::pin::Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Bridges an async byte stream through a synchronous `flate2` gzip decoder
/// on a blocking task, since there is no async gzip reader in this crate's
/// dependency stack. The decoder runs incrementally chunk-by-chunk rather
/// than buffering the whole body, preserving the "streaming without
/// buffering" design note (spec §9).
fn gzip_decode_stream(
    mut raw: impl Stream<Item = reqwest::Result<Bytes>> + Unpin + Send + 'static,
) -> BoxedByteStream {
    let (raw_tx, raw_rx) = mpsc::channel::<Bytes>(8);
    let (out_tx, out_rx) = mpsc::channel::<std::io::Result<Bytes>>(8);

    tokio::spawn(async move {
        while let Some(chunk) = raw.next().await {
            match chunk {
                Ok(bytes) => {
                    if raw_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream body stream error during gzip decode");
                    break;
                }
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        struct ChannelReader {
            rx: mpsc::Receiver<Bytes>,
            leftover: Bytes,
        }
        impl Read for ChannelReader {
            fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
                if self.leftover.is_empty() {
                    match self.rx.blocking_recv() {
                        Some(chunk) => self.leftover = chunk,
                        None => return Ok(0),
                    }
                }
                let n = out.len().min(self.leftover.len());
                out[..n].copy_from_slice(&self.leftover[..n]);
                self.leftover = self.leftover.slice(n..);
                Ok(n)
            }
        }

        let reader = ChannelReader {
            rx: raw_rx,
            leftover: Bytes::new(),
        };
        let mut decoder = MultiGzDecoder::new(reader);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx
                        .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = out_tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    Box::pin(tokio_stream_from_receiver(out_rx))
}

fn tokio_stream_from_receiver<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
) -> impl Stream<Item = T> + Send {
    async_stream_like(move || async move { rx.recv().await })
}

/// A minimal `futures::stream::unfold` wrapper — used instead of pulling in
/// `async-stream` for a single call site.
fn async_stream_like<F, Fut, T>(mut next: F) -> impl Stream<Item = T> + Send
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Option<T>> + Send,
    T: Send + 'static,
{
    futures::stream::unfold((), move |_| {
        let fut = next();
        async move { fut.await.map(|item| (item, ())) }
    })
}

/// Maximum SSE line length accepted by the scanner (spec §4.4 invariant 3:
/// "buffer floor 64 KB, cap ≥ 1 MB").
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Scans upstream SSE bytes line-by-line, forwarding each line byte-faithful
/// (including the blank-line event terminator) to `sink`, and invoking
/// `on_data` for every `data:` payload so callers can extract usage as a
/// side effect (spec §4.4 invariants 1–2). Stops at `data: [DONE]`.
///
/// `rewrite` lets an adapter replace a `data:` payload before it is written
/// — e.g. Gemini converting its native chunk shape into an OpenAI-compatible
/// one when the client hit an OpenAI-shaped endpoint (spec §4.4 invariant
/// 2). Returning `None` forwards the line unchanged; adapters that never
/// need this pass `|_| None`.
pub async fn scan_sse<S, W, F, R>(
    mut byte_stream: S,
    sink: &mut W,
    mut on_data: F,
    mut rewrite: R,
) -> Result<(), GatewayError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
    F: FnMut(&str),
    R: FnMut(&str) -> Option<String>,
{
    let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024);

    loop {
        // Find a complete line in what we've already buffered.
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line_bytes = buf.drain(..=pos).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line_bytes);
            let trimmed = line.trim_end_matches(['\r', '\n']);

            if let Some(payload) = trimmed.strip_prefix("data:") {
                let payload = payload.trim();
                on_data(payload);

                match rewrite(payload) {
                    Some(rewritten) => {
                        let terminator = &line[trimmed.len()..];
                        sink.write_all(format!("data: {rewritten}{terminator}").as_bytes())
                            .await
                            .map_err(|e| GatewayError::Internal(e.into()))?;
                    }
                    None => {
                        sink.write_all(&line_bytes)
                            .await
                            .map_err(|e| GatewayError::Internal(e.into()))?;
                    }
                }

                if payload == "[DONE]" {
                    sink.flush().await.ok();
                    return Ok(());
                }
                continue;
            }

            sink.write_all(&line_bytes)
                .await
                .map_err(|e| GatewayError::Internal(e.into()))?;
            continue;
        }

        if buf.len() >= MAX_SSE_LINE_BYTES {
            return Err(GatewayError::UpstreamError(
                "SSE line exceeded maximum accepted length".to_string(),
            ));
        }

        match byte_stream.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(GatewayError::UpstreamError(e.to_string())),
            None => {
                if !buf.is_empty() {
                    sink.write_all(&buf)
                        .await
                        .map_err(|e| GatewayError::Internal(e.into()))?;
                }
                sink.flush().await.ok();
                return Ok(());
            }
        }
    }
}

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn platform(&self) -> Platform;
    fn supported_types(&self) -> &'static [&'static str];

    async fn send_stream(
        &self,
        client: &reqwest::Client,
        account: &Account,
        req: &UpstreamRequest,
        sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<StreamResult, GatewayError>;

    /// Aggregates the stream variant (spec §4.4 "Adapters may implement this
    /// by aggregating the stream variant").
    async fn send(
        &self,
        client: &reqwest::Client,
        account: &Account,
        req: &UpstreamRequest,
    ) -> Result<SendResult, GatewayError> {
        let mut buf: Vec<u8> = Vec::new();
        let stream_result = self.send_stream(client, account, req, &mut buf).await?;
        Ok(SendResult {
            id: String::new(),
            model: req.model.clone(),
            content: String::from_utf8_lossy(&buf).to_string(),
            stop_reason: None,
            input_tokens: stream_result.input_tokens,
            output_tokens: stream_result.output_tokens,
            headers: stream_result.headers,
            error: None,
        })
    }
}

/// Static registry by account type, lock-free after construction (spec §9
/// "Adapter polymorphism").
pub struct AdapterRegistry {
    by_type: HashMap<&'static str, Arc<dyn UpstreamAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Arc<Self> {
        let mut by_type: HashMap<&'static str, Arc<dyn UpstreamAdapter>> = HashMap::new();
        let claude: Arc<dyn UpstreamAdapter> = Arc::new(claude::ClaudeAdapter);
        let claude_ccr: Arc<dyn UpstreamAdapter> = Arc::new(claude_ccr::ClaudeCcrAdapter);
        let openai: Arc<dyn UpstreamAdapter> = Arc::new(openai_responses::OpenAiResponsesAdapter);
        let gemini: Arc<dyn UpstreamAdapter> = Arc::new(gemini::GeminiAdapter);

        for t in claude.supported_types() {
            by_type.insert(t, claude.clone());
        }
        for t in claude_ccr.supported_types() {
            by_type.insert(t, claude_ccr.clone());
        }
        for t in openai.supported_types() {
            by_type.insert(t, openai.clone());
        }
        for t in gemini.supported_types() {
            by_type.insert(t, gemini.clone());
        }

        Arc::new(Self { by_type })
    }

    pub fn get(&self, account_type: &str) -> Option<Arc<dyn UpstreamAdapter>> {
        self.by_type.get(account_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_headers_strips_sensitive_set() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer x".to_string()),
            ("X-Api-Key".to_string(), "k".to_string()),
            ("X-Custom".to_string(), "v".to_string()),
        ];
        let cleaned = sanitize_headers(&headers);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].0, "X-Custom");
    }

    #[test]
    fn merge_anthropic_beta_appends_to_existing() {
        assert_eq!(
            merge_anthropic_beta(Some("foo-bar"), "oauth-2025-04-20"),
            "foo-bar,oauth-2025-04-20"
        );
        assert_eq!(merge_anthropic_beta(None, "oauth-2025-04-20"), "oauth-2025-04-20");
    }

    #[tokio::test]
    async fn scan_sse_forwards_lines_and_stops_at_done() {
        let chunks = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"message_start\"}\n\ndata: [DONE]\n\n",
            )),
        ];
        let stream = futures::stream::iter(chunks);
        let mut sink: Vec<u8> = Vec::new();
        let mut seen = Vec::new();
        scan_sse(stream, &mut sink, |payload| seen.push(payload.to_string()), |_| None)
            .await
            .unwrap();
        assert_eq!(seen, vec!["{\"type\":\"message_start\"}".to_string(), "[DONE]".to_string()]);
        assert!(String::from_utf8_lossy(&sink).contains("message_start"));
    }

    #[tokio::test]
    async fn scan_sse_rejects_lines_over_the_cap() {
        let oversized = vec![b'a'; MAX_SSE_LINE_BYTES + 10];
        let stream = futures::stream::iter(vec![Ok(Bytes::from(oversized))]);
        let mut sink: Vec<u8> = Vec::new();
        let result = scan_sse(stream, &mut sink, |_| {}, |_| None).await;
        assert!(result.is_err());
    }

    fn registry_has_all_expected_types(registry: &AdapterRegistry) -> bool {
        ["claude-official", "claude-console", "claude-ccr", "openai-responses", "gemini"]
            .iter()
            .all(|t| registry.get(t).is_some())
    }

    #[test]
    fn registry_registers_every_adapter_type() {
        let registry = AdapterRegistry::new();
        assert!(registry_has_all_expected_types(&registry));
    }
}
