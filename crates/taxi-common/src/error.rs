//! Error type for the shared domain types

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, TaxiError>;

#[derive(Error, Debug)]
pub enum TaxiError {
    #[error("Invalid period '{0}': expected YYYY-MM")]
    InvalidPeriod(String),
}
