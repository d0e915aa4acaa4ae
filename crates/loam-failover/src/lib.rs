// LOAM FAILOVER
// Epoch-based ownership and three-tier failover orchestration

pub mod monitor;
pub mod orchestrator;
pub mod store;

pub use monitor::{try_activate_spare, watch_owner, MonitorExit};
pub use orchestrator::{FailoverError, FailoverOrchestrator, FailoverState};
pub use store::{
    ClaimError, FileOwnershipStore, MemoryOwnershipStore, OwnershipStore, OwnershipStoreError,
};
