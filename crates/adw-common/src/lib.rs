//! ADW Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the ADW warehouse tools.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Date ranges**: resolution of lifetime / lookback / explicit windows
//!
//! # Example
//!
//! ```no_run
//! use adw_common::date_range::{DateRange, RangeSelection};
//! use chrono::NaiveDate;
//!
//! # fn main() -> adw_common::Result<()> {
//! let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
//! let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
//! let range = DateRange::resolve(&RangeSelection::Lookback(7), start, 30, today)?;
//! assert_eq!(range.days(), 7);
//! # Ok(())
//! # }
//! ```

pub mod date_range;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use date_range::{DateRange, RangeSelection};
pub use error::{CommonError, Result};
