// OWNERSHIP RECORD
// Durable record of which node owns pipeline execution
//
// SAFETY INVARIANTS:
// 1. At most one record is active at any instant
// 2. A new active record carries epoch strictly greater than its predecessor
// 3. Records are never deleted; history is retained for audit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical location of an owner in the three-tier failover chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerLocation {
    PrimaryEdge,
    CloudMirror,
    ColdSpare,
}

impl OwnerLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerLocation::PrimaryEdge => "PRIMARY_EDGE",
            OwnerLocation::CloudMirror => "CLOUD_MIRROR",
            OwnerLocation::ColdSpare => "COLD_SPARE",
        }
    }
}

/// The orchestrator's durable claim of pipeline ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Monotonic ownership epoch; each transition increments by exactly 1
    pub epoch: u64,

    /// Claiming node's identifier
    pub owner: String,

    /// Where the claiming node sits in the failover chain
    pub location: OwnerLocation,

    pub claimed_at: DateTime<Utc>,

    /// Deadline by which the owner must heartbeat again
    pub heartbeat_deadline: DateTime<Utc>,

    /// Whether this record is the active claim
    pub active: bool,
}
