//! Shared plumbing for the NYC taxi trip pipeline
//!
//! - **Logging**: one place to initialise `tracing` for every binary
//! - **Errors**: the error type of the shared domain types
//! - **Periods**: the year-month identifiers that name monthly trip files

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod period;

pub use error::{Result, TaxiError};
pub use period::Period;
