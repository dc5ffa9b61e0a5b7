//! In-memory store implementations for tests and single-process setups

use crate::models::UserAuthState;
use crate::store::{Registration, ReplayStore, StoreError, UserStateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryReplayStore {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryReplayStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayStore for InMemoryReplayStore {
    async fn check_and_register(
        &self,
        session_index: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let mut seen = self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if seen.contains_key(session_index) {
            Ok(Registration::Replayed)
        } else {
            seen.insert(session_index.to_string(), now);
            Ok(Registration::First)
        }
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut seen = self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = seen.len();
        seen.retain(|_, at| *at >= cutoff);
        Ok((before - seen.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryUserStateStore {
    states: Mutex<HashMap<String, UserAuthState>>,
}

impl InMemoryUserStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStateStore for InMemoryUserStateStore {
    async fn load(&self, user_id: &str) -> Result<Option<UserAuthState>, StoreError> {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(states.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, state: &UserAuthState) -> Result<(), StoreError> {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.insert(user_id.to_string(), state.clone());
        Ok(())
    }

    async fn find_by_pending_auth_request(
        &self,
        auth_request_id: &str,
    ) -> Result<Option<(String, UserAuthState)>, StoreError> {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(states
            .iter()
            .find(|(_, s)| s.pending_auth_request_id.as_deref() == Some(auth_request_id))
            .map(|(id, s)| (id.clone(), s.clone())))
    }

    async fn find_by_user_hash(
        &self,
        user_hash: &str,
    ) -> Result<Option<(String, UserAuthState)>, StoreError> {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(states
            .iter()
            .find(|(_, s)| s.external_user_hash.as_deref() == Some(user_hash))
            .map(|(id, s)| (id.clone(), s.clone())))
    }
}
