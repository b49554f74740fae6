//! Claude-via-CCR adapter: same Messages API wire shape as [`super::claude`]
//! but routed through a Claude Code Router relay account type, which forwards
//! to one of several backing providers chosen by the relay itself. The wire
//! format and usage extraction are identical to direct Claude; only the
//! default base URL and the absence of OAuth-beta injection differ (spec §3
//! "account_type" enumerates `claude-ccr` distinctly from `claude-official`
//! because its accounts never hold an access/refresh token pair).

use async_trait::async_trait;

use crate::accounts::{Account, Platform};
use crate::error::GatewayError;

use super::claude::{classify_reqwest_error, classify_status, extract_rate_limit_headers};
use super::{decompress_if_gzip, scan_sse, select_auth_header, StreamResult, UpstreamAdapter, UpstreamRequest};

pub struct ClaudeCcrAdapter;

impl ClaudeCcrAdapter {
    fn target_url(account: &Account) -> String {
        let base = account.base_url.as_deref().unwrap_or("http://127.0.0.1:3456");
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl UpstreamAdapter for ClaudeCcrAdapter {
    fn name(&self) -> &'static str {
        "claude-ccr"
    }

    fn platform(&self) -> Platform {
        Platform::Claude
    }

    fn supported_types(&self) -> &'static [&'static str] {
        &["claude-ccr"]
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

        let mut builder = client.post(&url).header(&auth_name, &auth_value).header("anthropic-version", "2023-06-01");
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
        let rate_limit_headers = extract_rate_limit_headers(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let decoded = decompress_if_gzip(content_encoding.as_deref(), response.bytes_stream()).await;
        let mut result = StreamResult::default();
        scan_sse(decoded, sink, |payload| super::claude::ClaudeAdapter::extract_usage(payload, &mut result), |_| None).await?;
        result.headers = rate_limit_headers;
        Ok(result)
    }
}
