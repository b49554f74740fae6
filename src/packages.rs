//! Package store (spec §3 "optional bound user-package", §4.6 step 2:
//! "enforce user-package daily/weekly/monthly windows ... and quota
//! balances").
//!
//! Mirrors [`crate::users::UserStore`]'s sqlite-plus-in-memory-cache shape.
//! Standardizing a billing-plan model (tiers, pricing, upgrade flows) is out
//! of scope here — this only holds what [`crate::dispatcher::Dispatcher`]
//! needs to enforce a package's windows and remaining balance.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Package {
    pub id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub daily_cap_micro_units: Option<i64>,
    pub weekly_cap_micro_units: Option<i64>,
    pub monthly_cap_micro_units: Option<i64>,
    /// Remaining prepaid balance; `None` means unmetered (spec §3 "quota
    /// balances").
    pub balance_micro_units: Option<i64>,
}

pub type SharedPackageStore = Arc<PackageStore>;

pub struct PackageStore {
    conn: StdMutex<Connection>,
    cache: RwLock<Vec<Package>>,
}

impl PackageStore {
    pub async fn new(database_path: &str) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS packages (
                id TEXT PRIMARY KEY,
                expires_at TEXT,
                daily_cap_micro_units INTEGER,
                weekly_cap_micro_units INTEGER,
                monthly_cap_micro_units INTEGER,
                balance_micro_units INTEGER
            )",
        )?;
        let store = Arc::new(Self {
            conn: StdMutex::new(conn),
            cache: RwLock::new(Vec::new()),
        });
        store.refresh().await?;
        Ok(store)
    }

    fn row_to_package(row: &rusqlite::Row) -> rusqlite::Result<Package> {
        let id: String = row.get("id")?;
        let expires_at: Option<String> = row.get("expires_at")?;
        Ok(Package {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            daily_cap_micro_units: row.get("daily_cap_micro_units")?,
            weekly_cap_micro_units: row.get("weekly_cap_micro_units")?,
            monthly_cap_micro_units: row.get("monthly_cap_micro_units")?,
            balance_micro_units: row.get("balance_micro_units")?,
        })
    }

    pub async fn refresh(&self) -> anyhow::Result<()> {
        let packages = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT * FROM packages")?;
            let rows = stmt.query_map([], Self::row_to_package)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        *self.cache.write().await = packages;
        Ok(())
    }

    pub async fn upsert(&self, package: Package) -> anyhow::Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO packages (
                    id, expires_at, daily_cap_micro_units, weekly_cap_micro_units,
                    monthly_cap_micro_units, balance_micro_units
                ) VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    package.id.to_string(),
                    package.expires_at.map(|d| d.to_rfc3339()),
                    package.daily_cap_micro_units,
                    package.weekly_cap_micro_units,
                    package.monthly_cap_micro_units,
                    package.balance_micro_units,
                ],
            )?;
        }
        self.refresh().await
    }

    pub async fn get(&self, id: Uuid) -> Option<Package> {
        self.cache.read().await.iter().find(|p| p.id == id).cloned()
    }

    /// Debits `amount` from the package's prepaid balance, clamping at zero
    /// rather than going negative (a request already in flight when the
    /// balance crosses zero still completes; the next `authorize` call sees
    /// the exhausted balance).
    pub async fn debit_balance(&self, id: Uuid, amount: i64) -> anyhow::Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE packages SET balance_micro_units = MAX(0, balance_micro_units - ?2)
                 WHERE id = ?1 AND balance_micro_units IS NOT NULL",
                params![id.to_string(), amount],
            )?;
        }
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: Uuid) -> Package {
        Package {
            id,
            expires_at: None,
            daily_cap_micro_units: None,
            weekly_cap_micro_units: None,
            monthly_cap_micro_units: None,
            balance_micro_units: Some(1_000_000),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = PackageStore::new(":memory:").await.unwrap();
        let id = Uuid::new_v4();
        store.upsert(sample(id)).await.unwrap();
        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.balance_micro_units, Some(1_000_000));
    }

    #[tokio::test]
    async fn debit_balance_clamps_at_zero() {
        let store = PackageStore::new(":memory:").await.unwrap();
        let id = Uuid::new_v4();
        store.upsert(sample(id)).await.unwrap();
        store.debit_balance(id, 900_000).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().balance_micro_units, Some(100_000));
        store.debit_balance(id, 900_000).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().balance_micro_units, Some(0));
    }

    #[tokio::test]
    async fn unmetered_balance_is_left_alone() {
        let store = PackageStore::new(":memory:").await.unwrap();
        let id = Uuid::new_v4();
        store
            .upsert(Package { balance_micro_units: None, ..sample(id) })
            .await
            .unwrap();
        store.debit_balance(id, 500).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().balance_micro_units, None);
    }
}
