//! Usage Accumulator (C3): atomic token/cost counters per
//! {user, api-key, account, day, month}, plus a bounded usage-record ring
//! (spec §3 "Usage Counters"/"Usage Record", §4.3).
//!
//! Hot-vs-cold duality (spec §9): this module is the hot, in-process
//! implementation behind a single interface; the [`crate::reconciler`]
//! periodically flushes per-account cost totals and per-day rollups into the
//! durable store. Grounded on the dual in-memory/Redis design of
//! `jack-milton/Rust-LLM-Inference-Gateway`'s `limits.rs`, adapted from rate
//! windows to additive usage counters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub total_tokens: i64,
    /// Integer micro-units (spec §3: "Money is stored as integers scaled by 10^6").
    pub cost: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl UsageDelta {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub api_key_id: Uuid,
    pub model: String,
    pub platform: String,
    pub request_ip: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub total_tokens: i64,
    pub total_cost: i64,
    pub request_time: DateTime<Utc>,
}

const MAX_RECORDS_PER_LIST: usize = 1000;
const DAILY_RETENTION_DAYS: i64 = 90;
const MONTHLY_RETENTION_DAYS: i64 = 365;

fn apply_delta(counters: &mut Counters, delta: &UsageDelta, cost: i64) {
    counters.input_tokens += delta.input_tokens;
    counters.output_tokens += delta.output_tokens;
    counters.cache_creation_input_tokens += delta.cache_creation_input_tokens;
    counters.cache_read_input_tokens += delta.cache_read_input_tokens;
    counters.total_tokens += delta.total();
    counters.cost += cost;
}

fn push_bounded(list: &mut Vec<UsageRecord>, record: UsageRecord) {
    list.push(record);
    if list.len() > MAX_RECORDS_PER_LIST {
        list.remove(0);
    }
}

struct State {
    user_total: HashMap<String, Counters>,
    user_daily: HashMap<(String, NaiveDate), Counters>,
    user_monthly: HashMap<(String, u32), Counters>,
    apikey_total: HashMap<Uuid, Counters>,
    apikey_daily: HashMap<(Uuid, NaiveDate), Counters>,
    account_total: HashMap<Uuid, Counters>,
    account_daily: HashMap<(Uuid, NaiveDate), Counters>,
    package_daily: HashMap<(Uuid, NaiveDate), Counters>,
    package_weekly: HashMap<(Uuid, u32), Counters>,
    package_monthly: HashMap<(Uuid, u32), Counters>,
    records_global: Vec<UsageRecord>,
    records_by_user: HashMap<String, Vec<UsageRecord>>,
    records_by_apikey: HashMap<Uuid, Vec<UsageRecord>>,
}

impl State {
    fn new() -> Self {
        Self {
            user_total: HashMap::new(),
            user_daily: HashMap::new(),
            user_monthly: HashMap::new(),
            apikey_total: HashMap::new(),
            apikey_daily: HashMap::new(),
            account_total: HashMap::new(),
            account_daily: HashMap::new(),
            package_daily: HashMap::new(),
            package_weekly: HashMap::new(),
            package_monthly: HashMap::new(),
            records_global: Vec::new(),
            records_by_user: HashMap::new(),
            records_by_apikey: HashMap::new(),
        }
    }
}

fn month_key(date: NaiveDate) -> u32 {
    date.year_ce().1 * 100 + date.month()
}

/// ISO week key (`year * 100 + week`) so a user-package's weekly window
/// resets on the ISO week boundary rather than a rolling 7-day lookback
/// (spec §4.6 step 2: "auto-reset per calendar period").
fn week_key(date: NaiveDate) -> u32 {
    let iso = date.iso_week();
    iso.year() as u32 * 100 + iso.week()
}

use chrono::Datelike;

pub struct UsageAccumulator {
    state: tokio::sync::Mutex<State>,
}

pub type SharedUsageAccumulator = Arc<UsageAccumulator>;

impl UsageAccumulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: tokio::sync::Mutex::new(State::new()),
        })
    }

    /// Atomic across every affected counter (spec §4.3): total, daily,
    /// monthly, per-key variants, per-account total + daily all update
    /// under one critical section.
    pub async fn increment(
        &self,
        user_id: &str,
        api_key_id: Uuid,
        account_id: Option<Uuid>,
        delta: UsageDelta,
        cost: i64,
    ) {
        let now = Utc::now();
        let today = now.date_naive();
        let mut state = self.state.lock().await;

        apply_delta(state.user_total.entry(user_id.to_string()).or_default(), &delta, cost);
        apply_delta(
            state.user_daily.entry((user_id.to_string(), today)).or_default(),
            &delta,
            cost,
        );
        apply_delta(
            state.user_monthly.entry((user_id.to_string(), month_key(today))).or_default(),
            &delta,
            cost,
        );
        apply_delta(state.apikey_total.entry(api_key_id).or_default(), &delta, cost);
        apply_delta(state.apikey_daily.entry((api_key_id, today)).or_default(), &delta, cost);

        if let Some(account_id) = account_id {
            apply_delta(state.account_total.entry(account_id).or_default(), &delta, cost);
            apply_delta(
                state.account_daily.entry((account_id, today)).or_default(),
                &delta,
                cost,
            );
        }
    }

    async fn push_record(&self, record: UsageRecord) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        push_bounded(&mut state.records_global, record.clone());
        push_bounded(
            state.records_by_user.entry(record.user_id.clone()).or_default(),
            record.clone(),
        );
        push_bounded(
            state.records_by_apikey.entry(record.api_key_id).or_default(),
            record,
        );
        Ok(())
    }

    async fn increment_for_record(&self, record: &UsageRecord, account_id: Option<Uuid>) -> anyhow::Result<()> {
        let delta = UsageDelta {
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            cache_creation_input_tokens: record.cache_creation_input_tokens,
            cache_read_input_tokens: record.cache_read_input_tokens,
        };
        self.increment(&record.user_id, record.api_key_id, account_id, delta, record.total_cost)
            .await;
        Ok(())
    }

    /// Performs the counter increment and the record push concurrently and
    /// returns the first error (spec §4.3 `RecordRequest`).
    pub async fn record_request(
        &self,
        mut record: UsageRecord,
        account_id: Option<Uuid>,
    ) -> anyhow::Result<()> {
        record.total_tokens = record.input_tokens + record.output_tokens;
        let (counters_result, record_result) = tokio::join!(
            self.increment_for_record(&record, account_id),
            self.push_record(record.clone()),
        );
        counters_result?;
        record_result?;
        Ok(())
    }

    /// Mirrors cost onto the account dimension for later reconciliation
    /// (spec §4.3).
    pub async fn increment_account_cost(&self, account_id: Uuid, cost: i64) {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock().await;
        state.account_total.entry(account_id).or_default().cost += cost;
        state.account_daily.entry((account_id, today)).or_default().cost += cost;
    }

    /// Mirrors cost onto the bound package's daily/weekly/monthly windows
    /// (spec §4.6 step 2), so the next `authorize` call sees this request
    /// reflected in the window `Dispatcher::authorize` checks against.
    pub async fn increment_package_cost(&self, package_id: Uuid, cost: i64) {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock().await;
        state.package_daily.entry((package_id, today)).or_default().cost += cost;
        state.package_weekly.entry((package_id, week_key(today))).or_default().cost += cost;
        state.package_monthly.entry((package_id, month_key(today))).or_default().cost += cost;
    }

    pub async fn package_daily(&self, package_id: Uuid, date: NaiveDate) -> Counters {
        self.state
            .lock()
            .await
            .package_daily
            .get(&(package_id, date))
            .copied()
            .unwrap_or_default()
    }

    pub async fn package_weekly(&self, package_id: Uuid, date: NaiveDate) -> Counters {
        self.state
            .lock()
            .await
            .package_weekly
            .get(&(package_id, week_key(date)))
            .copied()
            .unwrap_or_default()
    }

    pub async fn package_monthly(&self, package_id: Uuid, date: NaiveDate) -> Counters {
        self.state
            .lock()
            .await
            .package_monthly
            .get(&(package_id, month_key(date)))
            .copied()
            .unwrap_or_default()
    }

    pub async fn user_daily(&self, user_id: &str, date: NaiveDate) -> Counters {
        self.state
            .lock()
            .await
            .user_daily
            .get(&(user_id.to_string(), date))
            .copied()
            .unwrap_or_default()
    }

    pub async fn user_total(&self, user_id: &str) -> Counters {
        self.state.lock().await.user_total.get(user_id).copied().unwrap_or_default()
    }

    pub async fn apikey_daily(&self, api_key_id: Uuid, date: NaiveDate) -> Counters {
        self.state
            .lock()
            .await
            .apikey_daily
            .get(&(api_key_id, date))
            .copied()
            .unwrap_or_default()
    }

    pub async fn apikey_total(&self, api_key_id: Uuid) -> Counters {
        self.state.lock().await.apikey_total.get(&api_key_id).copied().unwrap_or_default()
    }

    pub async fn account_total(&self, account_id: Uuid) -> Counters {
        self.state
            .lock()
            .await
            .account_total
            .get(&account_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn records_for_user(&self, user_id: &str) -> Vec<UsageRecord> {
        self.state
            .lock()
            .await
            .records_by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Clones the full hot ring for the reconciler to mirror into the
    /// durable store. Nothing is drained, so the same record can be
    /// snapshotted again on the next flush cycle; the reconciler's insert is
    /// keyed by record id so a repeat snapshot does not duplicate rows
    /// (reads prefer hot; cold is a periodic mirror — spec §9).
    pub async fn snapshot_records(&self) -> Vec<UsageRecord> {
        self.state.lock().await.records_global.clone()
    }

    /// Drops daily/monthly counters past their retention window (90d / 365d
    /// respectively — spec §3).
    pub async fn sweep_expired(&self) {
        let cutoff_daily = Utc::now().date_naive() - chrono::Duration::days(DAILY_RETENTION_DAYS);
        let cutoff_month = month_key(Utc::now().date_naive() - chrono::Duration::days(MONTHLY_RETENTION_DAYS));
        let cutoff_week = week_key(Utc::now().date_naive() - chrono::Duration::days(DAILY_RETENTION_DAYS));
        let mut state = self.state.lock().await;
        state.user_daily.retain(|(_, date), _| *date >= cutoff_daily);
        state.apikey_daily.retain(|(_, date), _| *date >= cutoff_daily);
        state.account_daily.retain(|(_, date), _| *date >= cutoff_daily);
        state.package_daily.retain(|(_, date), _| *date >= cutoff_daily);
        state.package_weekly.retain(|(_, week), _| *week >= cutoff_week);
        state.user_monthly.retain(|(_, month), _| *month >= cutoff_month);
        state.package_monthly.retain(|(_, month), _| *month >= cutoff_month);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(user_id: &str, api_key_id: Uuid, input: i64, output: i64, cost: i64) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            api_key_id,
            model: "claude-sonnet".to_string(),
            platform: "claude".to_string(),
            request_ip: None,
            input_tokens: input,
            output_tokens: output,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            total_tokens: input + output,
            total_cost: cost,
            request_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_request_updates_counters_and_record_list() {
        let acc = UsageAccumulator::new();
        let api_key_id = Uuid::new_v4();
        let record = sample_record("u1", api_key_id, 100, 50, 42);
        acc.record_request(record, None).await.unwrap();

        let total = acc.user_total("u1").await;
        assert_eq!(total.input_tokens, 100);
        assert_eq!(total.output_tokens, 50);
        assert_eq!(total.total_tokens, 150);
        assert_eq!(total.cost, 42);

        let records = acc.records_for_user("u1").await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn daily_cost_sum_matches_sum_of_request_deltas() {
        let acc = UsageAccumulator::new();
        let api_key_id = Uuid::new_v4();
        let mut expected_total_cost = 0i64;
        for i in 0..5 {
            let record = sample_record("u1", api_key_id, 10, 5, 100 + i);
            expected_total_cost += 100 + i;
            acc.record_request(record, None).await.unwrap();
        }
        let today = Utc::now().date_naive();
        let daily = acc.user_daily("u1", today).await;
        assert_eq!(daily.cost, expected_total_cost);
    }

    #[tokio::test]
    async fn record_list_is_bounded_to_1000() {
        let acc = UsageAccumulator::new();
        let api_key_id = Uuid::new_v4();
        for _ in 0..1005 {
            acc.record_request(sample_record("u1", api_key_id, 1, 1, 1), None)
                .await
                .unwrap();
        }
        assert_eq!(acc.records_for_user("u1").await.len(), MAX_RECORDS_PER_LIST);
    }

    #[tokio::test]
    async fn account_cost_mirrors_independently_of_user_dimension() {
        let acc = UsageAccumulator::new();
        let account_id = Uuid::new_v4();
        acc.increment_account_cost(account_id, 500).await;
        acc.increment_account_cost(account_id, 250).await;
        assert_eq!(acc.account_total(account_id).await.cost, 750);
    }

    #[tokio::test]
    async fn package_cost_accumulates_across_all_three_windows() {
        let acc = UsageAccumulator::new();
        let package_id = Uuid::new_v4();
        acc.increment_package_cost(package_id, 100).await;
        acc.increment_package_cost(package_id, 50).await;
        let today = Utc::now().date_naive();
        assert_eq!(acc.package_daily(package_id, today).await.cost, 150);
        assert_eq!(acc.package_weekly(package_id, today).await.cost, 150);
        assert_eq!(acc.package_monthly(package_id, today).await.cost, 150);
    }
}
