//! Year-month periods and the trip file names derived from them

use crate::error::{Result, TaxiError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// File extension of monthly trip files
pub const TRIP_FILE_EXTENSION: &str = "parquet";

/// One month of trip data, e.g. `2025-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    pub year: u16,
    pub month: u8,
}

impl Period {
    pub fn new(year: u16, month: u8) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(TaxiError::InvalidPeriod(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    /// All twelve months of a year, in order.
    pub fn months_of(year: u16) -> impl Iterator<Item = Period> {
        (1..=12).map(move |month| Period { year, month })
    }

    /// `yellow` + 2025-01 -> `yellow_tripdata_2025-01.parquet`
    pub fn file_name(&self, dataset: &str) -> String {
        format!("{}_tripdata_{}.{}", dataset, self, TRIP_FILE_EXTENSION)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = TaxiError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TaxiError::InvalidPeriod(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Period::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Period {
    type Error = TaxiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}
