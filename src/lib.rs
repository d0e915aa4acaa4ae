// LOAM
// Deterministic soil-moisture state estimation for irrigation-critical
// farmland: sealed ingest, recursive filtering, regression kriging,
// volatility scheduling, three-tier failover, hash-chained audit.

pub mod pipeline;

pub use pipeline::{EpochReport, Pipeline, PipelineError};
