//! SQLite-backed stores

use crate::models::{Decision, UserAuthState};
use crate::store::{Registration, ReplayStore, StoreError, UserStateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Create the schema if missing. Call once at startup.
///
/// # Errors
///
/// `StoreError::Database` on DDL failure.
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sso_replay (
             session_index TEXT PRIMARY KEY,
             seen TEXT NOT NULL
         )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_auth_state (
             user_id TEXT PRIMARY KEY,
             external_username TEXT,
             pending_auth_request_id TEXT,
             authorized TEXT NOT NULL,
             external_user_hash TEXT,
             sso_session_index TEXT
         )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub struct SqliteReplayStore {
    pool: SqlitePool,
}

impl SqliteReplayStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReplayStore for SqliteReplayStore {
    async fn check_and_register(
        &self,
        session_index: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        // Single statement so concurrent registrations of one index
        // serialize inside SQLite; exactly one caller inserts the row
        let result = sqlx::query(
            "INSERT INTO sso_replay (session_index, seen) VALUES (?1, ?2)
             ON CONFLICT(session_index) DO NOTHING",
        )
        .bind(session_index)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            Ok(Registration::First)
        } else {
            Ok(Registration::Replayed)
        }
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sso_replay WHERE seen < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub struct SqliteUserStateStore {
    pool: SqlitePool,
}

impl SqliteUserStateStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const STATE_COLUMNS: &str = "user_id, external_username, pending_auth_request_id, \
                             authorized, external_user_hash, sso_session_index";

fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> Result<(String, UserAuthState), StoreError> {
    let authorized: String = row.try_get("authorized")?;
    Ok((
        row.try_get("user_id")?,
        UserAuthState {
            external_username: row.try_get("external_username")?,
            pending_auth_request_id: row.try_get("pending_auth_request_id")?,
            authorized: decision_from_column(&authorized),
            external_user_hash: row.try_get("external_user_hash")?,
            sso_session_index: row.try_get("sso_session_index")?,
        },
    ))
}

fn decision_to_column(decision: Decision) -> &'static str {
    match decision {
        Decision::Pending => "pending",
        Decision::Authorized => "authorized",
        Decision::Denied => "denied",
    }
}

fn decision_from_column(value: &str) -> Decision {
    match value {
        "authorized" => Decision::Authorized,
        "denied" => Decision::Denied,
        _ => Decision::Pending,
    }
}

#[async_trait]
impl UserStateStore for SqliteUserStateStore {
    async fn load(&self, user_id: &str) -> Result<Option<UserAuthState>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM user_auth_state WHERE user_id = ?1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_state(&r).map(|(_, state)| state))
            .transpose()
    }

    async fn save(&self, user_id: &str, state: &UserAuthState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_auth_state
                 (user_id, external_username, pending_auth_request_id,
                  authorized, external_user_hash, sso_session_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                 external_username = excluded.external_username,
                 pending_auth_request_id = excluded.pending_auth_request_id,
                 authorized = excluded.authorized,
                 external_user_hash = excluded.external_user_hash,
                 sso_session_index = excluded.sso_session_index",
        )
        .bind(user_id)
        .bind(&state.external_username)
        .bind(&state.pending_auth_request_id)
        .bind(decision_to_column(state.authorized))
        .bind(&state.external_user_hash)
        .bind(&state.sso_session_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_pending_auth_request(
        &self,
        auth_request_id: &str,
    ) -> Result<Option<(String, UserAuthState)>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM user_auth_state WHERE pending_auth_request_id = ?1"
        ))
        .bind(auth_request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_state(&r)).transpose()
    }

    async fn find_by_user_hash(
        &self,
        user_hash: &str,
    ) -> Result<Option<(String, UserAuthState)>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM user_auth_state WHERE external_user_hash = ?1"
        ))
        .bind(user_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_state(&r)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn session_index_registers_exactly_once() {
        let store = SqliteReplayStore::new(test_pool().await);
        let now = Utc::now();
        assert_eq!(
            store.check_and_register("idx-1", now).await.unwrap(),
            Registration::First
        );
        assert_eq!(
            store.check_and_register("idx-1", now).await.unwrap(),
            Registration::Replayed
        );
        assert_eq!(
            store.check_and_register("idx-2", now).await.unwrap(),
            Registration::First
        );
    }

    #[tokio::test]
    async fn eviction_boundary_is_strict() {
        let store = SqliteReplayStore::new(test_pool().await);
        let now = Utc::now();
        store
            .check_and_register("old", now - Duration::seconds(3601))
            .await
            .unwrap();
        store
            .check_and_register("fresh", now - Duration::seconds(3599))
            .await
            .unwrap();

        let evicted = store
            .evict_older_than(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(evicted, 1);

        // the fresh index is still registered, so it still replays
        assert_eq!(
            store.check_and_register("fresh", now).await.unwrap(),
            Registration::Replayed
        );
        // the old one was forgotten
        assert_eq!(
            store.check_and_register("old", now).await.unwrap(),
            Registration::First
        );
    }

    #[tokio::test]
    async fn user_state_round_trips() {
        let store = SqliteUserStateStore::new(test_pool().await);
        let state = UserAuthState {
            external_username: Some("push-id-7".to_string()),
            pending_auth_request_id: Some("req-1".to_string()),
            authorized: Decision::Authorized,
            external_user_hash: Some("hash-1".to_string()),
            sso_session_index: None,
        };
        store.save("42", &state).await.unwrap();
        assert_eq!(store.load("42").await.unwrap(), Some(state.clone()));
        assert_eq!(store.load("43").await.unwrap(), None);

        let (user, found) = store
            .find_by_pending_auth_request("req-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user, "42");
        assert_eq!(found, state);

        let (user, _) = store.find_by_user_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(user, "42");
    }

    #[tokio::test]
    async fn save_overwrites_previous_state() {
        let store = SqliteUserStateStore::new(test_pool().await);
        let mut state = UserAuthState::default();
        store.save("42", &state).await.unwrap();

        state.authorized = Decision::Denied;
        state.external_user_hash = Some("hash-2".to_string());
        store.save("42", &state).await.unwrap();

        let loaded = store.load("42").await.unwrap().unwrap();
        assert_eq!(loaded.authorized, Decision::Denied);
        assert_eq!(loaded.external_user_hash.as_deref(), Some("hash-2"));
    }
}
