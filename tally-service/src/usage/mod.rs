//! In-memory usage accumulators.

pub mod cache;
pub mod calculation;

pub use cache::AccountUsageCalculationCache;
pub use calculation::{AccountUsageCalculation, Totals, UsageCalculation};
