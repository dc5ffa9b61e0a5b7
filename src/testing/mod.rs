//! Testing utilities: key and certificate generation, signed SAML
//! message fixtures and scripted protocol drivers
//!
//! Compiled for unit tests and, behind the `testing` feature, for the
//! integration tests under `tests/`.

pub mod fixtures;
pub mod mock;

pub use fixtures::{ResponseOptions, SsoAuthority};
pub use mock::ScriptedAuthDriver;
