pub mod chain;
pub mod sink;

pub use chain::{AuditChain, AuditEntry, AuditEntryType, ChainBreak};
pub use sink::{JsonlAuditSink, SinkError};
