//! Claude (Messages API) adapter — official and console account types
//! (spec §4.4, §9 "claude-console uses a session key, not OAuth").

use async_trait::async_trait;

use crate::accounts::{Account, Platform};
use crate::error::GatewayError;

use super::{decompress_if_gzip, merge_anthropic_beta, scan_sse, select_auth_header, StreamResult, UpstreamAdapter, UpstreamRequest};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct ClaudeAdapter;

impl ClaudeAdapter {
    fn target_url(account: &Account, path: &str) -> String {
        let base = account.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    /// Extracts input/output/cache token counts from a Messages API SSE
    /// payload. `message_start` carries the full `usage` block with input
    /// and cache fields; `message_delta` carries the final `output_tokens`
    /// (spec §4.4 invariant 2, Claude family).
    pub(super) fn extract_usage(payload: &str, acc: &mut StreamResult) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return;
        };
        let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let usage = match event_type {
            "message_start" => value.get("message").and_then(|m| m.get("usage")),
            "message_delta" => value.get("usage"),
            _ => None,
        };
        let Some(usage) = usage else { return };
        if let Some(n) = usage.get("input_tokens").and_then(|v| v.as_i64()) {
            acc.input_tokens = n;
        }
        if let Some(n) = usage.get("output_tokens").and_then(|v| v.as_i64()) {
            acc.output_tokens = n;
        }
        if let Some(n) = usage.get("cache_creation_input_tokens").and_then(|v| v.as_i64()) {
            acc.cache_creation_input_tokens = n;
        }
        if let Some(n) = usage.get("cache_read_input_tokens").and_then(|v| v.as_i64()) {
            acc.cache_read_input_tokens = n;
        }
    }
}

#[async_trait]
impl UpstreamAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn platform(&self) -> Platform {
        Platform::Claude
    }

    fn supported_types(&self) -> &'static [&'static str] {
        &["claude-official", "claude-console"]
    }

    async fn send_stream(
        &self,
        client: &reqwest::Client,
        account: &Account,
        req: &UpstreamRequest,
        sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<StreamResult, GatewayError> {
        let url = Self::target_url(account, "/v1/messages");
        let (auth_name, auth_value, beta) = select_auth_header(account, true);

        let mut builder = client.post(&url).header(&auth_name, &auth_value).header("anthropic-version", "2023-06-01");
        if let Some((name, value)) = beta {
            let existing = req.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(&name)).map(|(_, v)| v.as_str());
            builder = builder.header(name, merge_anthropic_beta(existing, &value));
        }
        for (name, value) in super::sanitize_headers(&req.headers) {
            if name.eq_ignore_ascii_case("anthropic-beta") {
                continue;
            }
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

        let rate_limit_headers = extract_rate_limit_headers(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let byte_stream = response.bytes_stream();
        let decoded = decompress_if_gzip(content_encoding.as_deref(), byte_stream).await;

        let mut result = StreamResult::default();
        scan_sse(decoded, sink, |payload| Self::extract_usage(payload, &mut result), |_| None).await?;
        result.headers = rate_limit_headers;
        Ok(result)
    }
}

/// `anthropic-ratelimit-unified-*` headers surfaced for the scheduler/
/// reconciler (spec §4.4 invariant 2).
pub(super) fn extract_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> std::collections::HashMap<String, String> {
    let wanted = [
        "anthropic-ratelimit-unified-5h-status",
        "anthropic-ratelimit-unified-reset",
        "anthropic-ratelimit-requests-remaining",
        "retry-after",
    ];
    let mut out = std::collections::HashMap::new();
    for name in wanted {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            out.insert(name.to_string(), v.to_string());
        }
    }
    out
}

pub(super) fn classify_reqwest_error(e: &reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout
    } else {
        GatewayError::UpstreamError(e.to_string())
    }
}

pub(super) fn classify_status(status: u16, body: &str) -> GatewayError {
    match status {
        401 => GatewayError::UpstreamAuthFailed,
        403 => GatewayError::UpstreamForbidden,
        429 => GatewayError::UpstreamRateLimit,
        408 | 504 => GatewayError::UpstreamTimeout,
        529 => GatewayError::UpstreamError(format!("upstream overloaded (status {status}): {body}")),
        _ => GatewayError::UpstreamError(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_from_message_start_and_delta() {
        let mut acc = StreamResult::default();
        ClaudeAdapter::extract_usage(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"cache_creation_input_tokens":3,"cache_read_input_tokens":1}}}"#,
            &mut acc,
        );
        assert_eq!(acc.input_tokens, 12);
        assert_eq!(acc.cache_creation_input_tokens, 3);
        ClaudeAdapter::extract_usage(r#"{"type":"message_delta","usage":{"output_tokens":42}}"#, &mut acc);
        assert_eq!(acc.output_tokens, 42);
        assert_eq!(acc.input_tokens, 12, "earlier dimensions are preserved");
    }

    #[test]
    fn ignores_unrelated_event_types() {
        let mut acc = StreamResult::default();
        ClaudeAdapter::extract_usage(r#"{"type":"content_block_delta","delta":{"text":"hi"}}"#, &mut acc);
        assert_eq!(acc.input_tokens, 0);
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(classify_status(429, ""), GatewayError::UpstreamRateLimit));
        assert!(matches!(classify_status(401, ""), GatewayError::UpstreamAuthFailed));
        assert!(matches!(classify_status(403, ""), GatewayError::UpstreamForbidden));
    }
}
