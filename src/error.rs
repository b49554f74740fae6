//! Unified error taxonomy for the dispatch pipeline (spec §7).
//!
//! Every error a client can observe is one of these kinds. Adapter-level
//! transport failures are classified into the relevant `Upstream*` variant
//! before they reach a handler; nothing unclassified crosses the HTTP
//! boundary.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("api key disabled")]
    KeyDisabled,
    #[error("api key expired")]
    KeyExpired,
    #[error("api key invalid")]
    KeyInvalid,
    #[error("client not allowed")]
    ClientNotAllowed,
    #[error("platform forbidden")]
    PlatformForbidden,
    #[error("model forbidden")]
    ModelForbidden,
    #[error("package expired")]
    PackageExpired,
    #[error("quota exceeded")]
    QuotaExceeded(QuotaKind),
    #[error("user concurrency limit reached")]
    UserConcurrencyLimit,
    #[error("account concurrency limit reached")]
    AccountConcurrencyLimit,
    #[error("rate limited")]
    RateLimit,
    #[error("upstream rate limit")]
    UpstreamRateLimit,
    #[error("upstream auth failed")]
    UpstreamAuthFailed,
    #[error("upstream forbidden")]
    UpstreamForbidden,
    #[error("upstream timeout")]
    UpstreamTimeout,
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("token refresh failed")]
    TokenRefreshFailed,
    #[error("all accounts failed")]
    AllAccountsFailed,
    #[error("unsupported model")]
    UnsupportedModel,
    #[error("no available account")]
    NoAvailableAccount,
    #[error("maintenance mode")]
    MaintenanceMode,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Stable taxonomy name, used for the admin-editable message table and
    /// for structured logging (never exposed verbatim unless no override
    /// exists for the locale).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::AuthFailed => "auth_failed",
            Self::KeyDisabled => "key_disabled",
            Self::KeyExpired => "key_expired",
            Self::KeyInvalid => "key_invalid",
            Self::ClientNotAllowed => "client_not_allowed",
            Self::PlatformForbidden => "platform_forbidden",
            Self::ModelForbidden => "model_forbidden",
            Self::PackageExpired => "package_expired",
            Self::QuotaExceeded(QuotaKind::Daily) => "daily_limit",
            Self::QuotaExceeded(QuotaKind::Weekly) => "weekly_quota",
            Self::QuotaExceeded(QuotaKind::Monthly) => "monthly_quota",
            Self::UserConcurrencyLimit => "user_concurrency_limit",
            Self::AccountConcurrencyLimit => "account_concurrency_limit",
            Self::RateLimit => "rate_limit",
            Self::UpstreamRateLimit => "upstream_rate_limit",
            Self::UpstreamAuthFailed => "upstream_auth_failed",
            Self::UpstreamForbidden => "upstream_forbidden",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamError(_) => "upstream_error",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::AllAccountsFailed => "all_accounts_failed",
            Self::UnsupportedModel => "unsupported_model",
            Self::NoAvailableAccount => "no_available_account",
            Self::MaintenanceMode => "maintenance_mode",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthFailed | Self::KeyInvalid => StatusCode::UNAUTHORIZED,
            Self::KeyDisabled | Self::KeyExpired => StatusCode::FORBIDDEN,
            Self::ClientNotAllowed | Self::PlatformForbidden | Self::ModelForbidden => {
                StatusCode::FORBIDDEN
            }
            Self::PackageExpired => StatusCode::FORBIDDEN,
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UserConcurrencyLimit | Self::AccountConcurrencyLimit => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::RateLimit | Self::UpstreamRateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamAuthFailed => StatusCode::BAD_GATEWAY,
            Self::UpstreamForbidden => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::TokenRefreshFailed => StatusCode::BAD_GATEWAY,
            Self::AllAccountsFailed | Self::NoAvailableAccount => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnsupportedModel => StatusCode::BAD_REQUEST,
            Self::MaintenanceMode => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Default English {kind → message} table. Selected by
/// [`into_response_for_locale`](GatewayError::into_response_for_locale)
/// when the caller's locale isn't Chinese and no `ConfigStore` override
/// exists for the pair.
fn default_messages_en() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("bad_request", "The request could not be parsed."),
            ("auth_failed", "Authentication failed."),
            ("key_disabled", "This API key has been disabled."),
            ("key_expired", "This API key has expired."),
            ("key_invalid", "This API key is not recognized."),
            ("client_not_allowed", "This client is not permitted to use this key."),
            ("platform_forbidden", "This key is not allowed to use the requested platform."),
            ("model_forbidden", "This key is not allowed to use the requested model."),
            ("package_expired", "The bound package has expired."),
            ("daily_limit", "Daily usage limit exceeded."),
            ("weekly_quota", "Weekly quota exceeded."),
            ("monthly_quota", "Monthly quota exceeded."),
            ("user_concurrency_limit", "Too many concurrent requests for this user."),
            ("account_concurrency_limit", "Too many concurrent requests for this account."),
            ("rate_limit", "Rate limit exceeded, please slow down."),
            ("upstream_rate_limit", "Upstream provider rate limit reached."),
            ("upstream_auth_failed", "Upstream provider rejected our credentials."),
            ("upstream_forbidden", "Upstream provider forbade this request."),
            ("upstream_timeout", "Upstream provider timed out."),
            ("upstream_error", "Upstream provider returned an error."),
            ("token_refresh_failed", "Failed to refresh upstream credentials."),
            ("all_accounts_failed", "All eligible accounts failed for this request."),
            ("unsupported_model", "The requested model is not supported."),
            ("no_available_account", "No account is currently available for this request."),
            ("maintenance_mode", "The service is in maintenance mode."),
            ("internal_error", "An internal error occurred."),
        ])
    })
}

/// Default Chinese {kind → message} table, selected when the caller's
/// locale starts with `zh`.
fn default_messages_zh() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("bad_request", "请求格式有误。"),
            ("auth_failed", "身份验证失败。"),
            ("key_disabled", "该 API 密钥已被禁用。"),
            ("key_expired", "该 API 密钥已过期。"),
            ("key_invalid", "无法识别该 API 密钥。"),
            ("client_not_allowed", "该客户端无权使用此密钥。"),
            ("platform_forbidden", "该密钥无权访问所请求的平台。"),
            ("model_forbidden", "该密钥无权访问所请求的模型。"),
            ("package_expired", "绑定的套餐已过期。"),
            ("daily_limit", "已超出每日使用限额。"),
            ("weekly_quota", "已超出每周配额。"),
            ("monthly_quota", "已超出每月配额。"),
            ("user_concurrency_limit", "该用户并发请求过多。"),
            ("account_concurrency_limit", "该账号并发请求过多。"),
            ("rate_limit", "请求过于频繁，请稍后再试。"),
            ("upstream_rate_limit", "上游服务商限流。"),
            ("upstream_auth_failed", "上游服务商拒绝了凭据。"),
            ("upstream_forbidden", "上游服务商拒绝了此请求。"),
            ("upstream_timeout", "上游服务商响应超时。"),
            ("upstream_error", "上游服务商返回错误。"),
            ("token_refresh_failed", "刷新上游凭据失败。"),
            ("all_accounts_failed", "所有可用账号均处理失败。"),
            ("unsupported_model", "不支持所请求的模型。"),
            ("no_available_account", "当前没有可用账号。"),
            ("maintenance_mode", "服务正在维护中。"),
            ("internal_error", "发生内部错误。"),
        ])
    })
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl GatewayError {
    /// Renders the error body for a locale, preferring an admin override
    /// from `ConfigStore` (key `message:<locale>:<kind>`) over the baked-in
    /// English/Chinese tables (spec §7, §6: "admin-editable message table
    /// ... keyed by kind + locale ... overridable via the config store").
    pub async fn into_response_for_locale(
        self,
        locale: &str,
        config: &crate::config::ConfigStore,
    ) -> axum::response::Response {
        let status = self.status();
        let kind = self.kind();

        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, kind, "internal error");
        } else {
            tracing::warn!(error = %self, kind, "request rejected");
        }

        let message = match config.get_message_override(locale, kind).await {
            Some(custom) => custom,
            None => default_table_for(locale)
                .get(kind)
                .copied()
                .unwrap_or("An error occurred.")
                .to_string(),
        };

        (status, Json(ErrorBody {
            error: ErrorDetail { kind, message },
        }))
            .into_response()
    }
}

fn default_table_for(locale: &str) -> &'static HashMap<&'static str, &'static str> {
    if locale.eq_ignore_ascii_case("zh") || locale.to_ascii_lowercase().starts_with("zh-") {
        default_messages_zh()
    } else {
        default_messages_en()
    }
}

/// English-only fallback `IntoResponse` for contexts with no request locale
/// or `ConfigStore` at hand (e.g. a bare `?`-propagated error outside the
/// handler layer). Handlers that have both should call
/// [`GatewayError::into_response_for_locale`] instead.
impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let kind = self.kind();

        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, kind, "internal error");
        } else {
            tracing::warn!(error = %self, kind, "request rejected");
        }

        let message = default_messages_en()
            .get(kind)
            .copied()
            .unwrap_or("An error occurred.")
            .to_string();

        (status, Json(ErrorBody {
            error: ErrorDetail { kind, message },
        }))
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_kind_maps_to_429() {
        let err = GatewayError::RateLimit;
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.kind(), "rate_limit");
    }

    #[test]
    fn quota_kinds_are_distinguished() {
        assert_eq!(GatewayError::QuotaExceeded(QuotaKind::Daily).kind(), "daily_limit");
        assert_eq!(GatewayError::QuotaExceeded(QuotaKind::Weekly).kind(), "weekly_quota");
        assert_eq!(GatewayError::QuotaExceeded(QuotaKind::Monthly).kind(), "monthly_quota");
    }

    #[tokio::test]
    async fn locale_selects_the_right_default_table() {
        let config = crate::config::ConfigStore::new();
        let en = GatewayError::KeyInvalid.into_response_for_locale("en", &config).await;
        assert_eq!(en.status(), StatusCode::UNAUTHORIZED);

        let zh = GatewayError::KeyInvalid.into_response_for_locale("zh-CN", &config).await;
        assert_eq!(zh.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn config_override_wins_over_the_default_table() {
        let config = crate::config::ConfigStore::new();
        config.set_message_override("en", "key_invalid", "nope, not that key").await;
        let response = GatewayError::KeyInvalid.into_response_for_locale("en", &config).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn every_kind_has_an_english_message() {
        let kinds = [
            "bad_request", "auth_failed", "key_disabled", "key_expired", "key_invalid",
            "client_not_allowed", "platform_forbidden", "model_forbidden", "package_expired",
            "daily_limit", "weekly_quota", "monthly_quota", "user_concurrency_limit", "account_concurrency_limit",
            "rate_limit", "upstream_rate_limit", "upstream_auth_failed", "upstream_forbidden",
            "upstream_timeout", "upstream_error", "token_refresh_failed", "all_accounts_failed",
            "unsupported_model", "no_available_account", "maintenance_mode", "internal_error",
        ];
        for kind in kinds {
            assert!(default_messages_en().contains_key(kind), "missing message for {kind}");
            assert!(default_messages_zh().contains_key(kind), "missing zh message for {kind}");
        }
    }
}
