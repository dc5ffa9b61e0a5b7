//! Native push/poll authentication protocol

pub mod poll;
pub mod service;

pub use poll::{drive_poll, AwaitError, DEFAULT_POLL_CEILING};
pub use service::{AuthProtocolService, CallbackEvent, PollStatus};
