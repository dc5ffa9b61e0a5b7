//! Poll driver for pending auth requests
//!
//! One second between rounds, a hard ceiling on total wait, and
//! cancellation by dropping the returned future. Handlers tie the wait to
//! the HTTP request lifecycle, so a disconnected client stops the polling.

use crate::api::ApiError;
use crate::auth::service::{AuthProtocolService, PollStatus};
use crate::models::AuthResponse;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AwaitError {
    /// The ceiling elapsed with the request still unanswered
    #[error("no decision within the polling ceiling")]
    Timeout,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Drive `poll` every second until it yields a terminal decision, an
/// error, or `ceiling` elapses.
///
/// # Errors
///
/// `AwaitError::Timeout` at the ceiling; `AwaitError::Api` for any
/// terminal engine failure (including request expiry).
pub async fn drive_poll<F, Fut>(mut poll: F, ceiling: Duration) -> Result<AuthResponse, AwaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus, ApiError>>,
{
    let rounds = async {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match poll().await? {
                PollStatus::Complete(response) => return Ok(response),
                PollStatus::Pending => {}
            }
        }
    };
    tokio::time::timeout(ceiling, rounds)
        .await
        .map_err(|_| AwaitError::Timeout)?
}

impl AuthProtocolService {
    /// Await the decision for `auth_request_id`, polling once per second
    /// up to `ceiling`. Dropping the future cancels the wait; nothing is
    /// left running.
    ///
    /// # Errors
    ///
    /// See [`drive_poll`].
    pub async fn await_decision(
        &self,
        auth_request_id: &str,
        ceiling: Duration,
    ) -> Result<AuthResponse, AwaitError> {
        drive_poll(|| self.get_status(auth_request_id), ceiling).await
    }
}
