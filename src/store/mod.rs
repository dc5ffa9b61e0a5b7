//! Persistence: replay protection and per-user auth state
//!
//! Both stores are traits so handlers and the reconciler stay storage
//! agnostic; production runs on SQLite, tests on the in-memory variants.

pub mod memory;
pub mod sqlite;

use crate::models::UserAuthState;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{error, info};
use std::sync::Arc;
use thiserror::Error;

pub use memory::{InMemoryReplayStore, InMemoryUserStateStore};
pub use sqlite::{SqliteReplayStore, SqliteUserStateStore};

/// Replay records older than this are swept.
pub const REPLAY_RETENTION: Duration = Duration::hours(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// Whether a session index had been seen before this registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    First,
    Replayed,
}

/// Atomic single-use registry for SSO session indexes.
///
/// `check_and_register` must be a single atomic operation at the storage
/// layer: two concurrent logins presenting the same index must observe
/// one `First` and one `Replayed`, never two `First`s.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Register `session_index` as seen at `now`.
    ///
    /// # Errors
    ///
    /// `StoreError::Database` on storage failure; a replayed index is a
    /// normal `Ok(Registration::Replayed)`, not an error.
    async fn check_and_register(
        &self,
        session_index: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError>;

    /// Delete records seen strictly before `cutoff`; returns the count.
    ///
    /// # Errors
    ///
    /// `StoreError::Database` on storage failure.
    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Keyed storage for [`UserAuthState`], with the secondary lookups the
/// callback paths need.
#[async_trait]
pub trait UserStateStore: Send + Sync {
    /// # Errors
    ///
    /// `StoreError::Database` on storage failure.
    async fn load(&self, user_id: &str) -> Result<Option<UserAuthState>, StoreError>;

    /// # Errors
    ///
    /// `StoreError::Database` on storage failure.
    async fn save(&self, user_id: &str, state: &UserAuthState) -> Result<(), StoreError>;

    /// Locate the user whose login is waiting on `auth_request_id`.
    ///
    /// # Errors
    ///
    /// `StoreError::Database` on storage failure.
    async fn find_by_pending_auth_request(
        &self,
        auth_request_id: &str,
    ) -> Result<Option<(String, UserAuthState)>, StoreError>;

    /// Locate the user recorded under an engine user hash.
    ///
    /// # Errors
    ///
    /// `StoreError::Database` on storage failure.
    async fn find_by_user_hash(
        &self,
        user_hash: &str,
    ) -> Result<Option<(String, UserAuthState)>, StoreError>;
}

/// Hourly sweep of aged replay records. Runs until the process exits;
/// safe to run concurrently with validation because eviction and
/// registration touch disjoint rows.
pub async fn run_replay_sweep(store: Arc<dyn ReplayStore>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick fires immediately; clears leftovers from previous runs
    loop {
        interval.tick().await;
        let cutoff = Utc::now() - REPLAY_RETENTION;
        match store.evict_older_than(cutoff).await {
            Ok(0) => {}
            Ok(count) => info!("replay sweep evicted {count} records"),
            Err(err) => error!("replay sweep failed: {err}"),
        }
    }
}
