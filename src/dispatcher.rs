//! Dispatcher (C6): the end-to-end request lifecycle (spec §4.6).
//!
//! Ties every other component together the way `api/routes.rs`'s
//! `AppState` wires its stores together, but expressed as one stateful
//! service rather than a handler-local bag of `State` extractors, so the
//! nine-step lifecycle (authenticate → authorize → acquire → pick → invoke
//! → account → release) lives in one auditable place instead of being
//! spread across HTTP handlers.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::accounts::{Account, Platform, SharedAccountStore};
use crate::adapters::{AdapterRegistry, StreamResult, UpstreamRequest};
use crate::api::keys::{ApiKey, SharedApiKeyStore};
use crate::cache::{ConcurrencyCounters, UnavailabilityMarks};
use crate::config::SharedConfigStore;
use crate::error::{GatewayError, QuotaKind};
use crate::packages::SharedPackageStore;
use crate::pricing::SharedPricingTable;
use crate::scheduler::Scheduler;
use crate::usage::{SharedUsageAccumulator, UsageDelta, UsageRecord};
use crate::users::SharedUserStore;

pub struct Dispatcher {
    accounts: SharedAccountStore,
    users: SharedUserStore,
    api_keys: SharedApiKeyStore,
    packages: SharedPackageStore,
    usage: SharedUsageAccumulator,
    pricing: SharedPricingTable,
    scheduler: Arc<Scheduler>,
    adapters: Arc<AdapterRegistry>,
    concurrency: Arc<ConcurrencyCounters>,
    marks: Arc<UnavailabilityMarks>,
    config: SharedConfigStore,
    http: reqwest::Client,
}

/// What the client supplied for one inbound call, independent of HTTP
/// framework types so the dispatcher stays testable without axum.
pub struct DispatchRequest {
    pub bearer_token: String,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    pub request_ip: Option<String>,
    pub upstream: UpstreamRequest,
}

pub struct DispatchOutcome {
    pub account_id: Uuid,
    pub stream_result: StreamResult,
    pub cost_micro_units: i64,
}

/// Counts bytes written so the Dispatcher can tell whether it is safe to
/// retry a `rate_limited`/`overloaded` failure on a different account (spec
/// §4.6 step 8: "idempotence tracked by whether any bytes were already
/// written to the client sink").
struct CountingSink<'a> {
    inner: &'a mut (dyn AsyncWrite + Unpin + Send),
    written: Arc<AtomicU64>,
}

impl<'a> AsyncWrite for CountingSink<'a> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let std::task::Poll::Ready(Ok(n)) = &poll {
            this.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: SharedAccountStore,
        users: SharedUserStore,
        api_keys: SharedApiKeyStore,
        packages: SharedPackageStore,
        usage: SharedUsageAccumulator,
        pricing: SharedPricingTable,
        scheduler: Arc<Scheduler>,
        adapters: Arc<AdapterRegistry>,
        concurrency: Arc<ConcurrencyCounters>,
        marks: Arc<UnavailabilityMarks>,
        config: SharedConfigStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            users,
            api_keys,
            packages,
            usage,
            pricing,
            scheduler,
            adapters,
            concurrency,
            marks,
            config,
            http: reqwest::Client::new(),
        })
    }

    /// Step 1. Hashes and looks up the bearer token, rejecting keys that are
    /// missing, disabled, or expired.
    async fn authenticate(&self, token: &str) -> Result<ApiKey, GatewayError> {
        let key = self.api_keys.verify(token).await.ok_or(GatewayError::KeyInvalid)?;
        if key.status == crate::api::keys::ApiKeyStatus::Disabled {
            return Err(GatewayError::KeyDisabled);
        }
        if !key.is_usable(chrono::Utc::now()) {
            return Err(GatewayError::KeyExpired);
        }
        Ok(key)
    }

    /// Step 2. Platform/model/client allow-lists, per-key req/min rate
    /// limit, per-key daily/monthly cost caps, and the bound user-package's
    /// daily/weekly/monthly windows and quota balance (spec §4.6 step 2).
    async fn authorize(&self, key: &ApiKey, platform: &str, model: &str, client_id: Option<&str>) -> Result<(), GatewayError> {
        if !key.allows_platform(platform) {
            return Err(GatewayError::PlatformForbidden);
        }
        if !key.allows_model(model) {
            return Err(GatewayError::ModelForbidden);
        }
        if !key.allows_client(client_id) {
            return Err(GatewayError::ClientNotAllowed);
        }
        if let Some(limit) = key.rate_limit_per_minute {
            let rate_key = format!("apikey-rate:{}", key.id);
            let (granted, _) = self.concurrency.acquire(&rate_key, limit as usize, Duration::from_secs(60)).await;
            if !granted {
                return Err(GatewayError::RateLimit);
            }
        }
        if let Some(daily_cap) = key.daily_cap_micro_units {
            let today = chrono::Utc::now().date_naive();
            let daily = self.usage.apikey_daily(key.id, today).await;
            if daily.cost >= daily_cap {
                return Err(GatewayError::QuotaExceeded(QuotaKind::Daily));
            }
        }
        if let Some(monthly_cap) = key.monthly_cap_micro_units {
            let total = self.usage.apikey_total(key.id).await;
            if total.cost >= monthly_cap {
                return Err(GatewayError::QuotaExceeded(QuotaKind::Monthly));
            }
        }
        if let Some(package_id) = key.package_id {
            self.authorize_package(package_id).await?;
        }
        Ok(())
    }

    /// Checked only when the key is bound to a package. A missing or expired
    /// package, or one whose balance is already exhausted, is reported as
    /// `package_expired`; a window still open but over its cap is reported
    /// as the matching `quota_exceeded` kind instead, since the package
    /// itself remains valid (spec §4.6 step 2, §3 "optional bound
    /// user-package").
    async fn authorize_package(&self, package_id: Uuid) -> Result<(), GatewayError> {
        let package = self.packages.get(package_id).await.ok_or(GatewayError::PackageExpired)?;
        let now = chrono::Utc::now();
        if package.expires_at.map(|exp| now >= exp).unwrap_or(false) {
            return Err(GatewayError::PackageExpired);
        }
        if package.balance_micro_units.map(|b| b <= 0).unwrap_or(false) {
            return Err(GatewayError::PackageExpired);
        }

        let today = now.date_naive();
        if let Some(cap) = package.daily_cap_micro_units {
            if self.usage.package_daily(package_id, today).await.cost >= cap {
                return Err(GatewayError::QuotaExceeded(QuotaKind::Daily));
            }
        }
        if let Some(cap) = package.weekly_cap_micro_units {
            if self.usage.package_weekly(package_id, today).await.cost >= cap {
                return Err(GatewayError::QuotaExceeded(QuotaKind::Weekly));
            }
        }
        if let Some(cap) = package.monthly_cap_micro_units {
            if self.usage.package_monthly(package_id, today).await.cost >= cap {
                return Err(GatewayError::QuotaExceeded(QuotaKind::Monthly));
            }
        }
        Ok(())
    }

    /// Runs the full lifecycle, writing SSE bytes to `sink` as they arrive.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<DispatchOutcome, GatewayError> {
        let key = self.authenticate(&request.bearer_token).await?;
        let platform = Platform::from_model(&request.upstream.model).ok_or(GatewayError::UnsupportedModel)?;
        self.authorize(&key, platform.as_str(), &request.upstream.model, request.client_id.as_deref())
            .await?;

        let user = self.users.get_or_default(&key.user_id).await;
        let user_slot_key = format!("user:{}", user.id);
        let slot_ttl = Duration::from_secs(self.config.get_u64("request_slot_ttl_secs", 180).await);

        let (granted, _) = self
            .concurrency
            .acquire(&user_slot_key, user.max_concurrency.max(1), slot_ttl)
            .await;
        if !granted {
            return Err(GatewayError::UserConcurrencyLimit);
        }

        let result = self.dispatch_with_user_slot(&request, &key, &user.id, user.price_rate, platform, sink, slot_ttl).await;

        self.concurrency.release(&user_slot_key).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_with_user_slot(
        &self,
        request: &DispatchRequest,
        key: &ApiKey,
        user_id: &str,
        price_rate: f64,
        platform: Platform,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        slot_ttl: Duration,
    ) -> Result<DispatchOutcome, GatewayError> {
        let max_attempts = self.config.get_u64("max_account_retry_attempts", 3).await.max(1);
        let account_limit = self.config.get_u64("account_concurrency_limit", 10).await as usize;
        let unavailable_ttl = Duration::from_secs(self.config.get_u64("account_unavailable_ttl_secs", 5).await);

        let mut excluded: Vec<Uuid> = Vec::new();
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..max_attempts {
            let account = self
                .scheduler
                .select_account_with_session(
                    request.session_id.as_deref(),
                    user_id,
                    key.id,
                    &request.upstream.model,
                )
                .await;

            let account = match account.filter(|a| !excluded.contains(&a.id)) {
                Some(a) => a,
                None => return Err(last_err.unwrap_or(GatewayError::NoAvailableAccount)),
            };

            let account_slot_key = format!("account:{}", account.id);
            let (granted, _) = self.concurrency.acquire(&account_slot_key, account_limit.max(1), slot_ttl).await;
            if !granted {
                self.marks.mark(account.id, "at concurrency ceiling", unavailable_ttl).await;
                excluded.push(account.id);
                last_err = Some(GatewayError::AccountConcurrencyLimit);
                continue;
            }

            let written = Arc::new(AtomicU64::new(0));
            let outcome = self
                .invoke_adapter(request, &account, platform, price_rate, key.id, key.package_id, user_id, sink, written.clone())
                .await;

            self.concurrency.release(&account_slot_key).await;

            match outcome {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let status = classify_for_scheduler(&err);
                    let _ = self
                        .scheduler
                        .mark_account_error(account.id, &account.account_type, &err.to_string(), status, None)
                        .await;

                    let message_lower = err.to_string().to_ascii_lowercase();
                    let retryable_kind = matches!(err, GatewayError::UpstreamRateLimit) || message_lower.contains("overloaded");
                    let retryable = retryable_kind && written.load(Ordering::Relaxed) == 0;
                    if retryable && attempt + 1 < max_attempts {
                        excluded.push(account.id);
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::NoAvailableAccount))
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_adapter(
        &self,
        request: &DispatchRequest,
        account: &Account,
        platform: Platform,
        price_rate: f64,
        api_key_id: Uuid,
        package_id: Option<Uuid>,
        user_id: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        written: Arc<AtomicU64>,
    ) -> Result<DispatchOutcome, GatewayError> {
        let adapter = self
            .adapters
            .get(&account.account_type)
            .ok_or(GatewayError::UnsupportedModel)?;

        let mut counting = CountingSink { inner: sink, written: written.clone() };
        let stream_result = adapter.send_stream(&self.http, account, &request.upstream, &mut counting).await?;
        counting.flush().await.ok();

        let delta = UsageDelta {
            input_tokens: stream_result.input_tokens,
            output_tokens: stream_result.output_tokens,
            cache_creation_input_tokens: stream_result.cache_creation_input_tokens,
            cache_read_input_tokens: stream_result.cache_read_input_tokens,
        };
        let cost = self.pricing.cost_for(&request.upstream.model, &delta, price_rate);

        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            api_key_id,
            model: request.upstream.model.clone(),
            platform: platform.as_str().to_string(),
            request_ip: request.request_ip.clone(),
            input_tokens: delta.input_tokens,
            output_tokens: delta.output_tokens,
            cache_creation_input_tokens: delta.cache_creation_input_tokens,
            cache_read_input_tokens: delta.cache_read_input_tokens,
            total_tokens: delta.total(),
            total_cost: cost,
            request_time: chrono::Utc::now(),
        };

        self.usage
            .record_request(record, Some(account.id))
            .await
            .map_err(GatewayError::Internal)?;
        self.usage.increment_account_cost(account.id, cost).await;
        if let Some(package_id) = package_id {
            self.usage.increment_package_cost(package_id, cost).await;
            self.packages
                .debit_balance(package_id, cost)
                .await
                .map_err(GatewayError::Internal)?;
        }
        self.accounts
            .increment_request_count(account.id)
            .await
            .map_err(GatewayError::Internal)?;
        // A success resets the overload backoff (spec §9 Open Question 1) so
        // a transient overload doesn't permanently widen future cooldowns.
        self.accounts
            .clear_consecutive_errors(account.id)
            .await
            .map_err(GatewayError::Internal)?;

        Ok(DispatchOutcome {
            account_id: account.id,
            stream_result,
            cost_micro_units: cost,
        })
    }
}

/// Best-effort status code recovery for [`Scheduler::mark_account_error`],
/// which uses both message substrings and an explicit status to classify.
fn classify_for_scheduler(err: &GatewayError) -> Option<u16> {
    match err {
        GatewayError::UpstreamRateLimit => Some(429),
        GatewayError::UpstreamAuthFailed => Some(401),
        GatewayError::UpstreamForbidden => Some(403),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::cache::{SessionStore, UnavailabilityMarks};
    use crate::config::ConfigStore;
    use crate::pricing::PricingTable;
    use crate::usage::UsageAccumulator;
    use crate::users::UserStore;

    async fn test_dispatcher() -> Arc<Dispatcher> {
        let accounts = AccountStore::new(":memory:").await.unwrap();
        let users = UserStore::new(":memory:").await.unwrap();
        let api_keys = crate::api::keys::ApiKeyStore::new(":memory:").await.unwrap();
        let packages = crate::packages::PackageStore::new(":memory:").await.unwrap();
        let usage = UsageAccumulator::new();
        let pricing = PricingTable::with_defaults();
        let sessions = SessionStore::new(Duration::from_secs(1800));
        let marks = UnavailabilityMarks::new();
        let scheduler = Scheduler::new(accounts.clone(), sessions, marks.clone());
        let adapters = AdapterRegistry::new();
        let concurrency = ConcurrencyCounters::new();
        let config = ConfigStore::new();

        Dispatcher::new(accounts, users, api_keys, packages, usage, pricing, scheduler, adapters, concurrency, marks, config)
    }

    #[tokio::test]
    async fn unknown_bearer_token_is_rejected() {
        let dispatcher = test_dispatcher().await;
        let err = dispatcher.authenticate("sk-doesnotexist").await.unwrap_err();
        assert!(matches!(err, GatewayError::KeyInvalid));
    }

    #[tokio::test]
    async fn no_available_account_is_reported_when_pool_is_empty() {
        let dispatcher = test_dispatcher().await;
        let issued = dispatcher
            .api_keys
            .issue("u1", "k", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();

        let req = DispatchRequest {
            bearer_token: issued.plaintext,
            session_id: None,
            client_id: None,
            request_ip: None,
            upstream: UpstreamRequest {
                model: "claude-sonnet".to_string(),
                messages: None,
                max_tokens: None,
                temperature: None,
                top_p: None,
                stream: true,
                stop: None,
                system: None,
                tools: None,
                raw_body: bytes::Bytes::new(),
                headers: Vec::new(),
                path: "/v1/messages".to_string(),
            },
        };
        let mut sink: Vec<u8> = Vec::new();
        let err = dispatcher.dispatch(req, &mut sink).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccount));
    }

    #[tokio::test]
    async fn disallowed_platform_is_rejected_before_any_account_is_touched() {
        let dispatcher = test_dispatcher().await;
        let issued = dispatcher
            .api_keys
            .issue("u1", "k", None, vec!["openai".to_string()], vec![], vec![], None, None, None)
            .await
            .unwrap();
        let err = dispatcher
            .authorize(&issued.record, "claude", "claude-sonnet", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PlatformForbidden));
    }

    #[tokio::test]
    async fn key_bound_to_a_nonexistent_package_is_rejected_as_expired() {
        let dispatcher = test_dispatcher().await;
        let mut issued = dispatcher
            .api_keys
            .issue("u1", "k", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();
        let package_id = Uuid::new_v4();
        dispatcher.api_keys.bind_package(issued.record.id, Some(package_id)).await.unwrap();
        issued.record.package_id = Some(package_id);

        let err = dispatcher
            .authorize(&issued.record, "claude", "claude-sonnet", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PackageExpired));
    }

    #[tokio::test]
    async fn package_with_exhausted_balance_is_rejected_as_expired() {
        let dispatcher = test_dispatcher().await;
        let mut issued = dispatcher
            .api_keys
            .issue("u1", "k", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();
        let package_id = Uuid::new_v4();
        dispatcher
            .packages
            .upsert(crate::packages::Package {
                id: package_id,
                expires_at: None,
                daily_cap_micro_units: None,
                weekly_cap_micro_units: None,
                monthly_cap_micro_units: None,
                balance_micro_units: Some(0),
            })
            .await
            .unwrap();
        issued.record.package_id = Some(package_id);

        let err = dispatcher
            .authorize(&issued.record, "claude", "claude-sonnet", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PackageExpired));
    }

    #[tokio::test]
    async fn package_over_its_daily_cap_reports_a_quota_error_not_expired() {
        let dispatcher = test_dispatcher().await;
        let mut issued = dispatcher
            .api_keys
            .issue("u1", "k", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();
        let package_id = Uuid::new_v4();
        dispatcher
            .packages
            .upsert(crate::packages::Package {
                id: package_id,
                expires_at: None,
                daily_cap_micro_units: Some(100),
                weekly_cap_micro_units: None,
                monthly_cap_micro_units: None,
                balance_micro_units: None,
            })
            .await
            .unwrap();
        dispatcher.usage.increment_package_cost(package_id, 150).await;
        issued.record.package_id = Some(package_id);

        let err = dispatcher
            .authorize(&issued.record, "claude", "claude-sonnet", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExceeded(QuotaKind::Daily)));
    }

    #[tokio::test]
    async fn rate_limit_per_minute_rejects_the_request_once_exceeded() {
        let dispatcher = test_dispatcher().await;
        let issued = dispatcher
            .api_keys
            .issue("u1", "k", None, vec![], vec![], vec![], Some(1), None, None)
            .await
            .unwrap();
        dispatcher.authorize(&issued.record, "claude", "claude-sonnet", None).await.unwrap();
        let err = dispatcher
            .authorize(&issued.record, "claude", "claude-sonnet", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimit));
    }
}
