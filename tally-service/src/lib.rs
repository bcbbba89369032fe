//! Tally Service - usage tally of inventory hosts and metric events into
//! multi-granularity snapshots.

pub mod clock;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod enrichment;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod normalizer;
pub mod reconciler;
pub mod registry;
pub mod rollup;
pub mod services;
pub mod startup;
pub mod usage;
