//! Metric definitions for parley.
//!
//! This crate centralizes metric names on top of the `metrics` crate facade.
//! Recording is a no-op until the host process installs a recorder (for
//! example a Prometheus exporter).
//!
//! # Usage
//!
//! ```rust,ignore
//! use parley_metrics::{counter, flows, gauge};
//!
//! counter!(flows::STARTED_TOTAL, "flow" => "signup").increment(1);
//! gauge!(flows::ACTIVE).set(3.0);
//! ```

mod definitions;

pub use definitions::*;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
