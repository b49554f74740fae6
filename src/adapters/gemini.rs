//! Gemini adapter (spec §4.4, `POST /v1beta/models/{model}:generateContent`
//! and `:streamGenerateContent`).
//!
//! Gemini's wire shape (`contents`/`generationConfig`) differs enough from
//! the Claude/OpenAI message arrays that transparent byte forwarding does
//! not apply here: the unified envelope is converted into Gemini's request
//! shape on the way out (spec §9 "Gemini requires shape conversion, unlike
//! the other two families which forward raw bytes"). The response direction
//! also converts: a Gemini account reached through an OpenAI-compatible
//! endpoint (`/v1/chat/completions`, `/v1/responses`) has each streamed
//! chunk rewritten into an OpenAI `chat.completion.chunk` before it reaches
//! the client (spec §4.4 invariant 2); a client hitting the native
//! `/v1beta/models/...` endpoint gets Gemini's own chunk shape untouched.

use async_trait::async_trait;
use serde_json::json;

use crate::accounts::{Account, Platform};
use crate::error::GatewayError;

use super::claude::{classify_reqwest_error, classify_status};
use super::{decompress_if_gzip, scan_sse, Message, MessageContent, StreamResult, UpstreamAdapter, UpstreamRequest};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiAdapter;

impl GeminiAdapter {
    fn target_url(account: &Account, model: &str, stream: bool) -> String {
        let base = account.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        format!(
            "{}/v1beta/models/{}:{}?alt=sse",
            base.trim_end_matches('/'),
            model,
            method
        )
    }

    fn content_text(content: &MessageContent) -> String {
        match content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.text.clone())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    fn role_for(role: &str) -> &'static str {
        if role == "assistant" {
            "model"
        } else {
            "user"
        }
    }

    fn to_gemini_body(req: &UpstreamRequest) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = req
            .messages
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|m: &Message| {
                json!({
                    "role": Self::role_for(&m.role),
                    "parts": [{ "text": Self::content_text(&m.content) }],
                })
            })
            .collect();

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = req.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = req.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = req.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        if let Some(stop) = &req.stop {
            generation_config.insert("stopSequences".to_string(), json!(stop));
        }

        let mut body = serde_json::Map::new();
        body.insert("contents".to_string(), json!(contents));
        if !generation_config.is_empty() {
            body.insert("generationConfig".to_string(), serde_json::Value::Object(generation_config));
        }
        if let Some(system) = &req.system {
            body.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": Self::content_text(system) }] }),
            );
        }

        serde_json::Value::Object(body)
    }

    /// Each streamed chunk carries its own `usageMetadata`; the last one
    /// observed wins since Gemini reports cumulative counts per chunk (spec
    /// §4.4 invariant 2, Gemini family).
    fn extract_usage(payload: &str, acc: &mut StreamResult) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return;
        };
        let Some(usage) = value.get("usageMetadata") else {
            return;
        };
        if let Some(n) = usage.get("promptTokenCount").and_then(|v| v.as_i64()) {
            acc.input_tokens = n;
        }
        if let Some(n) = usage.get("candidatesTokenCount").and_then(|v| v.as_i64()) {
            acc.output_tokens = n;
        }
        if let Some(n) = usage.get("cachedContentTokenCount").and_then(|v| v.as_i64()) {
            acc.cache_read_input_tokens = n;
        }
    }

    /// True when the client reached this Gemini account through one of the
    /// OpenAI-compatible endpoints rather than the native Gemini one, so the
    /// streamed chunk shape needs converting before it reaches them (spec
    /// §4.4 invariant 2: "the adapter converts the chunk into an
    /// OpenAI-shaped chunk before forwarding if the target protocol is
    /// OpenAI-compatible").
    fn wants_openai_shape(path: &str) -> bool {
        path.starts_with("/v1/chat/completions") || path.starts_with("/v1/responses")
    }

    /// Converts one native Gemini `data:` payload into an OpenAI
    /// `chat.completion.chunk` payload. Returns `None` for a payload with no
    /// candidate text (e.g. one carrying only `usageMetadata`), leaving the
    /// caller to forward nothing for that line.
    fn to_openai_chunk(payload: &str, stream_id: &str, model: &str) -> Option<String> {
        if payload == "[DONE]" {
            return Some(payload.to_string());
        }
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let candidate = value.get("candidates").and_then(|c| c.as_array()).and_then(|a| a.first())?;
        let text = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .map(Self::parts_text)
            .unwrap_or_default();
        let finish_reason = candidate
            .get("finishReason")
            .and_then(|v| v.as_str())
            .map(|r| if r == "STOP" { "stop" } else { "length" });

        let chunk = json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": text },
                "finish_reason": finish_reason,
            }],
        });
        Some(chunk.to_string())
    }

    fn parts_text(parts: &serde_json::Value) -> String {
        parts
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl UpstreamAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn platform(&self) -> Platform {
        Platform::Gemini
    }

    fn supported_types(&self) -> &'static [&'static str] {
        &["gemini"]
    }

    async fn send_stream(
        &self,
        client: &reqwest::Client,
        account: &Account,
        req: &UpstreamRequest,
        sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<StreamResult, GatewayError> {
        let url = Self::target_url(account, &req.model, req.stream);
        let api_key = account
            .credentials
            .api_key
            .clone()
            .or_else(|| account.credentials.access_token.clone())
            .unwrap_or_default();

        let body = Self::to_gemini_body(req);
        let mut builder = client.post(&url).header("x-goog-api-key", api_key).json(&body);
        for (name, value) in super::sanitize_headers(&req.headers) {
            if name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        let content_encoding = response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let decoded = decompress_if_gzip(content_encoding.as_deref(), response.bytes_stream()).await;
        let mut result = StreamResult::default();

        let convert_to_openai = Self::wants_openai_shape(&req.path);
        let stream_id = uuid::Uuid::new_v4().to_string();
        scan_sse(
            decoded,
            sink,
            |payload| Self::extract_usage(payload, &mut result),
            |payload| {
                if convert_to_openai {
                    Self::to_openai_chunk(payload, &stream_id, &req.model)
                } else {
                    None
                }
            },
        )
        .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Block;

    #[test]
    fn converts_unified_messages_into_gemini_contents() {
        let req = UpstreamRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: Some(vec![
                Message { role: "user".to_string(), content: MessageContent::Text("hi".to_string()) },
                Message { role: "assistant".to_string(), content: MessageContent::Text("hello".to_string()) },
            ]),
            max_tokens: Some(256),
            temperature: Some(0.7),
            top_p: None,
            stream: false,
            stop: None,
            system: None,
            tools: None,
            raw_body: bytes::Bytes::new(),
            headers: Vec::new(),
            path: "/v1beta/models/gemini-1.5-pro:generateContent".to_string(),
        };
        let body = GeminiAdapter::to_gemini_body(&req);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn content_text_joins_block_text_segments() {
        let content = MessageContent::Blocks(vec![
            Block { block_type: "text".to_string(), text: Some("a".to_string()), image_source: None },
            Block { block_type: "text".to_string(), text: Some("b".to_string()), image_source: None },
        ]);
        assert_eq!(GeminiAdapter::content_text(&content), "ab");
    }

    #[test]
    fn extracts_usage_metadata_keeping_last_observed() {
        let mut acc = StreamResult::default();
        GeminiAdapter::extract_usage(r#"{"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":1}}"#, &mut acc);
        GeminiAdapter::extract_usage(r#"{"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":9}}"#, &mut acc);
        assert_eq!(acc.output_tokens, 9);
    }

    #[test]
    fn native_gemini_endpoint_does_not_request_openai_conversion() {
        assert!(!GeminiAdapter::wants_openai_shape("/v1beta/models/gemini-1.5-pro:streamGenerateContent"));
    }

    #[test]
    fn openai_compatible_endpoints_request_conversion() {
        assert!(GeminiAdapter::wants_openai_shape("/v1/chat/completions"));
        assert!(GeminiAdapter::wants_openai_shape("/v1/responses"));
    }

    #[test]
    fn converts_a_candidate_chunk_into_an_openai_chat_completion_chunk() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"hello"}],"role":"model"},"finishReason":null}]}"#;
        let converted = GeminiAdapter::to_openai_chunk(payload, "stream-1", "gemini-1.5-pro").unwrap();
        let value: serde_json::Value = serde_json::from_str(&converted).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["model"], "gemini-1.5-pro");
        assert_eq!(value["choices"][0]["delta"]["content"], "hello");
    }

    #[test]
    fn done_marker_passes_through_the_converter_unchanged() {
        let converted = GeminiAdapter::to_openai_chunk("[DONE]", "stream-1", "gemini-1.5-pro").unwrap();
        assert_eq!(converted, "[DONE]");
    }

    #[test]
    fn usage_only_payload_converts_to_nothing() {
        let payload = r#"{"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":1}}"#;
        assert!(GeminiAdapter::to_openai_chunk(payload, "stream-1", "gemini-1.5-pro").is_none());
    }
}
