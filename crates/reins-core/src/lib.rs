//! Foundational low-level utilities shared across Reins crates.
//!
//! Provides atomic file-write helpers, time utilities, and the integration
//! domain error used by credential custody, lifecycle, and tool routing.

pub mod atomic_io;
pub mod error;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use error::{IntegrationError, IntegrationErrorKind, IntegrationResult, INTEGRATION_ERROR_CODE};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix};
