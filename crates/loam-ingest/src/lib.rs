pub mod adapter;
pub mod dedup;
pub mod ingest;

pub use adapter::{CovariateAdapter, RawExternalSample, RawSignalKind};
pub use dedup::SequenceWindow;
pub use ingest::{Accepted, Ingest, Rejected};
