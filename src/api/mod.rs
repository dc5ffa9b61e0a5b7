//! Engine REST API: transport, request signing and error classification

pub mod error;
pub mod transport;

pub use error::{classify_engine_code, ApiError, ApiErrorKind};
pub use transport::{ApiTransport, HttpMethod};
