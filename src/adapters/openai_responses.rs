//! OpenAI Responses API adapter (spec §4.4, `POST /v1/responses` family).
//!
//! The Responses API's streaming usage event carries a flat `usage` object
//! with `input_tokens`/`output_tokens`/`total_tokens` on the terminal
//! `response.completed` event, unlike Claude's split `message_start` +
//! `message_delta` pair.

use async_trait::async_trait;

use crate::accounts::{Account, Platform};
use crate::error::GatewayError;

use super::claude::{classify_reqwest_error, classify_status};
use super::{decompress_if_gzip, scan_sse, select_auth_header, StreamResult, UpstreamAdapter, UpstreamRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiResponsesAdapter;

impl OpenAiResponsesAdapter {
    fn target_url(account: &Account) -> String {
        let base = account.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/responses", base.trim_end_matches('/'))
    }

    /// `response.completed` carries the final usage object; earlier events
    /// (`response.created`, `response.output_text.delta`, ...) carry none
    /// (spec §4.4 invariant 2, OpenAI family).
    fn extract_usage(payload: &str, acc: &mut StreamResult) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return;
        };
        let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if event_type != "response.completed" {
            return;
        }
        let Some(usage) = value.get("response").and_then(|r| r.get("usage")) else {
            return;
        };
        if let Some(n) = usage.get("input_tokens").and_then(|v| v.as_i64()) {
            acc.input_tokens = n;
        }
        if let Some(n) = usage.get("output_tokens").and_then(|v| v.as_i64()) {
            acc.output_tokens = n;
        }
        if let Some(n) = usage
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_i64())
        {
            acc.cache_read_input_tokens = n;
        }
    }

    /// Extracts the rate-limit headers OpenAI-compatible relays expose
    /// (`x-codex-*`, per spec §4.4 invariant 2 "x-codex-* headers").
    fn extract_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> std::collections::HashMap<String, String> {
        let mut out = std::collections::HashMap::new();
        for (name, value) in headers.iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if lower.starts_with("x-codex-") || lower.starts_with("x-ratelimit-") {
                if let Ok(v) = value.to_str() {
                    out.insert(lower, v.to_string());
                }
            }
        }
        out
    }
}

#[async_trait]
impl UpstreamAdapter for OpenAiResponsesAdapter {
    fn name(&self) -> &'static str {
        "openai-responses"
    }

    fn platform(&self) -> Platform {
        Platform::OpenAi
    }

    fn supported_types(&self) -> &'static [&'static str] {
        &["openai-responses"]
    }

    async fn send_stream(
        &self,
        client: &reqwest::Client,
        account: &Account,
        req: &UpstreamRequest,
        sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<StreamResult, GatewayError> {
        let url = Self::target_url(account);
        let (auth_name, auth_value, _beta) = select_auth_header(account, false);

        let mut builder = client.post(&url).header(&auth_name, &auth_value);
        if let Some(org) = &account.credentials.organization_id {
            builder = builder.header("openai-organization", org);
        }
        for (name, value) in super::sanitize_headers(&req.headers) {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(req.raw_body.clone())
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        let content_encoding = response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let rate_limit_headers = Self::extract_rate_limit_headers(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let decoded = decompress_if_gzip(content_encoding.as_deref(), response.bytes_stream()).await;
        let mut result = StreamResult::default();
        scan_sse(decoded, sink, |payload| Self::extract_usage(payload, &mut result), |_| None).await?;
        result.headers = rate_limit_headers;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_only_from_response_completed() {
        let mut acc = StreamResult::default();
        OpenAiResponsesAdapter::extract_usage(r#"{"type":"response.created"}"#, &mut acc);
        assert_eq!(acc.input_tokens, 0);
        OpenAiResponsesAdapter::extract_usage(
            r#"{"type":"response.completed","response":{"usage":{"input_tokens":7,"output_tokens":9,"input_tokens_details":{"cached_tokens":2}}}}"#,
            &mut acc,
        );
        assert_eq!(acc.input_tokens, 7);
        assert_eq!(acc.output_tokens, 9);
        assert_eq!(acc.cache_read_input_tokens, 2);
    }

    #[test]
    fn rate_limit_headers_filters_to_codex_and_ratelimit_prefixes() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-codex-remaining", "10".parse().unwrap());
        headers.insert("x-unrelated", "ignored".parse().unwrap());
        let extracted = OpenAiResponsesAdapter::extract_rate_limit_headers(&headers);
        assert!(extracted.contains_key("x-codex-remaining"));
        assert!(!extracted.contains_key("x-unrelated"));
    }
}
