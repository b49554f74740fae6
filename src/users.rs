//! User store (spec §3 "User"): tenant owners that API keys belong to.
//!
//! Mirrors [`crate::accounts::AccountStore`]'s sqlite-plus-in-memory-cache
//! shape, minus the status-transition machinery accounts need — users only
//! carry billing/concurrency settings that the Dispatcher reads on every
//! request.

use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{params, Connection};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
    /// Billing multiplier; `0` means free (spec §3 invariant `priceRate ≥ 0`).
    pub price_rate: f64,
    pub max_concurrency: usize,
}

pub type SharedUserStore = Arc<UserStore>;

pub struct UserStore {
    conn: StdMutex<Connection>,
    cache: RwLock<Vec<User>>,
}

impl UserStore {
    pub async fn new(database_path: &str) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                price_rate REAL NOT NULL DEFAULT 1.0,
                max_concurrency INTEGER NOT NULL DEFAULT 5
            )",
        )?;
        let store = Arc::new(Self {
            conn: StdMutex::new(conn),
            cache: RwLock::new(Vec::new()),
        });
        store.refresh().await?;
        Ok(store)
    }

    pub async fn refresh(&self) -> anyhow::Result<()> {
        let users = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id, username, role, price_rate, max_concurrency FROM users")?;
            let rows = stmt.query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    role: row.get(2)?,
                    price_rate: row.get(3)?,
                    max_concurrency: row.get::<_, i64>(4)? as usize,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        *self.cache.write().await = users;
        Ok(())
    }

    pub async fn insert(&self, user: User) -> anyhow::Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO users (id, username, role, price_rate, max_concurrency)
                 VALUES (?1,?2,?3,?4,?5)",
                params![user.id, user.username, user.role, user.price_rate, user.max_concurrency as i64],
            )?;
        }
        self.refresh().await
    }

    pub async fn get(&self, id: &str) -> Option<User> {
        self.cache.read().await.iter().find(|u| u.id == id).cloned()
    }

    /// Returns a permissive default for a user id with no stored record, so a
    /// freshly issued API key works before an admin has provisioned a full
    /// user profile.
    pub async fn get_or_default(&self, id: &str) -> User {
        self.get(id).await.unwrap_or_else(|| User {
            id: id.to_string(),
            username: id.to_string(),
            role: "member".to_string(),
            price_rate: 1.0,
            max_concurrency: 5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_user_gets_permissive_default() {
        let store = UserStore::new(":memory:").await.unwrap();
        let user = store.get_or_default("ghost").await;
        assert_eq!(user.max_concurrency, 5);
        assert_eq!(user.price_rate, 1.0);
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = UserStore::new(":memory:").await.unwrap();
        store
            .insert(User {
                id: "u1".to_string(),
                username: "alice".to_string(),
                role: "admin".to_string(),
                price_rate: 0.0,
                max_concurrency: 10,
            })
            .await
            .unwrap();
        let fetched = store.get("u1").await.unwrap();
        assert_eq!(fetched.max_concurrency, 10);
        assert_eq!(fetched.price_rate, 0.0);
    }
}
