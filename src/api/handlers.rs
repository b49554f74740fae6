//! Client-facing HTTP handlers (spec §6): the four upstream-shaped proxy
//! endpoints. Each parses just enough of the client's JSON body to build the
//! unified envelope, then hands off to the [`crate::dispatcher::Dispatcher`]
//! with the body's raw bytes carried along for transparent forwarding.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::adapters::UpstreamRequest;
use crate::dispatcher::DispatchRequest;
use crate::error::GatewayError;

use super::routes::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Result<String, GatewayError> {
    let value = header_str(headers, "authorization").ok_or(GatewayError::AuthFailed)?;
    value
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
        .ok_or(GatewayError::AuthFailed)
}

/// `Session_id` is matched case-insensitively; axum's `HeaderMap` already
/// normalizes header names, so a direct lookup suffices (spec §6).
fn session_id(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "session_id").map(|s| s.to_string())
}

fn client_id(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-client-id").map(|s| s.to_string())
}

/// Coarse `Accept-Language` parsing: only the language subtag of the first
/// offered locale matters since the default tables are only `en`/`zh` (spec
/// §7). Anything else, or a missing header, falls back to `en`.
fn locale_from_headers(headers: &HeaderMap) -> String {
    header_str(headers, "accept-language")
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| s.starts_with("zh"))
        .map(|_| "zh".to_string())
        .unwrap_or_else(|| "en".to_string())
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// Parses just the fields the dispatcher and adapters need out of an
/// upstream-shaped JSON body, while keeping `raw_body` intact for
/// transparent forwarding (spec §4.4: "transparent forwarding ... preferred
/// when shapes match").
fn build_upstream_request(body: &Bytes, headers: &HeaderMap, path: String) -> Result<UpstreamRequest, GatewayError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::BadRequest("missing model".to_string()))?;

    let messages = value.get("messages").and_then(|v| serde_json::from_value(v.clone()).ok());
    let max_tokens = value
        .get("max_tokens")
        .or_else(|| value.get("max_output_tokens"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    let temperature = value.get("temperature").and_then(|v| v.as_f64()).map(|v| v as f32);
    let top_p = value.get("top_p").and_then(|v| v.as_f64()).map(|v| v as f32);
    let stream = value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let stop = value
        .get("stop")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|s| s.as_str().map(|s| s.to_string())).collect());
    let system = value.get("system").and_then(|v| serde_json::from_value(v.clone()).ok());
    let tools = value.get("tools").cloned();

    Ok(UpstreamRequest {
        model,
        messages,
        max_tokens,
        temperature,
        top_p,
        stream,
        stop,
        system,
        tools,
        raw_body: body.clone(),
        headers: forwarded_headers(headers),
        path,
    })
}

/// Gemini clients send Gemini's own `contents`/`generationConfig` shape, not
/// the Claude-Messages shape `build_upstream_request` parses — so it is
/// converted into the unified envelope here instead (the mirror image of
/// `adapters::gemini::to_gemini_body`, which converts back on the way out).
fn build_gemini_upstream_request(
    body: &Bytes,
    headers: &HeaderMap,
    path: String,
    model: String,
    stream: bool,
) -> Result<UpstreamRequest, GatewayError> {
    use crate::adapters::{Message, MessageContent};

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    fn parts_text(parts: &serde_json::Value) -> String {
        parts
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")
    }

    let messages = value.get("contents").and_then(|v| v.as_array()).map(|contents| {
        contents
            .iter()
            .map(|c| {
                let role = c.get("role").and_then(|r| r.as_str()).unwrap_or("user").to_string();
                let text = c.get("parts").map(parts_text).unwrap_or_default();
                Message { role, content: MessageContent::Text(text) }
            })
            .collect::<Vec<_>>()
    });

    let system = value
        .get("systemInstruction")
        .and_then(|v| v.get("parts"))
        .map(|parts| Message { role: "system".to_string(), content: MessageContent::Text(parts_text(parts)) });

    let generation_config = value.get("generationConfig");
    let max_tokens = generation_config.and_then(|g| g.get("maxOutputTokens")).and_then(|v| v.as_u64()).map(|v| v as u32);
    let temperature = generation_config.and_then(|g| g.get("temperature")).and_then(|v| v.as_f64()).map(|v| v as f32);
    let top_p = generation_config.and_then(|g| g.get("topP")).and_then(|v| v.as_f64()).map(|v| v as f32);
    let stop = generation_config.and_then(|g| g.get("stopSequences")).and_then(|v| v.as_array()).map(|arr| {
        arr.iter().filter_map(|s| s.as_str().map(|s| s.to_string())).collect()
    });

    Ok(UpstreamRequest {
        model,
        messages,
        max_tokens,
        temperature,
        top_p,
        stream,
        stop,
        system,
        tools: None,
        raw_body: body.clone(),
        headers: forwarded_headers(headers),
        path,
    })
}

type PendingSend = std::pin::Pin<Box<dyn Future<Output = Result<(), tokio::sync::mpsc::error::SendError<Bytes>>> + Send>>;

/// Bridges the dispatcher's `AsyncWrite` sink onto an axum streaming `Body`
/// by forwarding every write as a channel item. A write in flight when the
/// channel is full is kept pinned across polls rather than re-issued, since
/// dropping and recreating the send future would silently lose that chunk.
struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<Bytes>,
    pending: Option<(PendingSend, usize)>,
}

impl AsyncWrite for ChannelSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.pending.is_none() {
            let chunk = Bytes::copy_from_slice(buf);
            let len = chunk.len();
            let tx = this.tx.clone();
            this.pending = Some((Box::pin(async move { tx.send(chunk).await }), len));
        }

        let (fut, len) = this.pending.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            std::task::Poll::Ready(Ok(())) => {
                let len = *len;
                this.pending = None;
                std::task::Poll::Ready(Ok(len))
            }
            std::task::Poll::Ready(Err(_)) => {
                this.pending = None;
                std::task::Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client disconnected")))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

use std::future::Future;

async fn dispatch_and_stream(state: &AppState, headers: HeaderMap, upstream: UpstreamRequest) -> Response {
    let locale = locale_from_headers(&headers);
    let token = match bearer_token(&headers) {
        Ok(t) => t,
        Err(e) => return e.into_response_for_locale(&locale, &state.config).await,
    };

    let request = DispatchRequest {
        bearer_token: token,
        session_id: session_id(&headers),
        client_id: client_id(&headers),
        request_ip: None,
        upstream,
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    let dispatcher = state.dispatcher.clone();
    let guard = state.track_request();

    let handle = tokio::spawn(async move {
        let _guard = guard;
        let mut sink = ChannelSink { tx, pending: None };
        dispatcher.dispatch(request, &mut sink).await
    });

    // Drain the first chunk (or the dispatch error) before committing to a
    // 200 response, so auth/authorize/no-account failures still surface the
    // right status code instead of a truncated 200 stream.
    let first = rx.recv().await;

    let body_stream = async_stream_from_receiver(rx, first.clone());

    match first {
        Some(_) => {
            let mut response = Response::new(Body::from_stream(body_stream));
            response.headers_mut().insert("content-type", "text/event-stream".parse().unwrap());
            tokio::spawn(async move {
                if let Ok(Err(err)) = handle.await {
                    tracing::warn!(error = %err, "dispatch ended with an error after streaming began");
                }
            });
            response
        }
        None => match handle.await {
            Ok(Ok(_)) => Response::new(Body::empty()),
            Ok(Err(err)) => err.into_response_for_locale(&locale, &state.config).await,
            Err(_) => {
                GatewayError::Internal(anyhow::anyhow!("dispatch task panicked"))
                    .into_response_for_locale(&locale, &state.config)
                    .await
            }
        },
    }
}

fn async_stream_from_receiver(
    mut rx: tokio::sync::mpsc::Receiver<Bytes>,
    first: Option<Bytes>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold((first, true), move |(pending, is_first)| {
        let rx = &mut rx;
        async move {
            if is_first {
                if let Some(chunk) = pending {
                    return Some((Ok(chunk), (None, false)));
                }
            }
            rx.recv().await.map(|chunk| (Ok(chunk), (None, false)))
        }
    })
}

pub async fn post_messages(State(state): State<std::sync::Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    match build_upstream_request(&body, &headers, "/v1/messages".to_string()) {
        Ok(upstream) => dispatch_and_stream(&state, headers, upstream).await,
        Err(e) => e.into_response_for_locale(&locale_from_headers(&headers), &state.config).await,
    }
}

pub async fn post_responses(State(state): State<std::sync::Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    match build_upstream_request(&body, &headers, "/v1/responses".to_string()) {
        Ok(upstream) => dispatch_and_stream(&state, headers, upstream).await,
        Err(e) => e.into_response_for_locale(&locale_from_headers(&headers), &state.config).await,
    }
}

pub async fn post_chat_completions(State(state): State<std::sync::Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    match build_upstream_request(&body, &headers, "/v1/chat/completions".to_string()) {
        Ok(upstream) => dispatch_and_stream(&state, headers, upstream).await,
        Err(e) => e.into_response_for_locale(&locale_from_headers(&headers), &state.config).await,
    }
}

/// Gemini's wire format puts the action in the same path segment as the
/// model, e.g. `gemini-2.5-pro:streamGenerateContent` — axum's `:param`
/// matcher captures the whole segment, so it is split back apart here. The
/// body itself is Gemini's native `contents` shape, not Claude's `messages`
/// shape, so it goes through [`build_gemini_upstream_request`] instead.
pub async fn gemini_generate(
    State(state): State<std::sync::Arc<AppState>>,
    Path(model_and_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = model_and_action.split(':').next().unwrap_or(&model_and_action).to_string();
    let stream = model_and_action.ends_with("streamGenerateContent");
    let path = format!("/v1beta/models/{model_and_action}");
    match build_gemini_upstream_request(&body, &headers, path, model, stream) {
        Ok(upstream) => dispatch_and_stream(&state, headers, upstream).await,
        Err(e) => e.into_response_for_locale(&locale_from_headers(&headers), &state.config).await,
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(serde_json::json!({ "status": "ok" })))
}
