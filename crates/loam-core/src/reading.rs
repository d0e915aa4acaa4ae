// READING
// A single sealed point measurement from a buried probe
//
// SAFETY INVARIANTS:
// 1. Readings are immutable once created at the sensor/edge boundary
// 2. Sequence numbers are unique per sensor; ingest rejects reuse
// 3. The seal covers the body's canonical bytes; any mutation is detectable

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::GeoPosition;
use crate::seal::SealedRecord;

/// Measured fields of a reading. This is the payload that gets hashed
/// and signed; the seal lives alongside it in `Reading`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingBody {
    /// Stable identifier of the physical probe
    pub sensor_id: String,

    /// Probe location
    pub position: GeoPosition,

    /// Probe depth below surface, meters
    pub depth_m: f64,

    /// Volumetric water content, fraction in [0, 1]
    pub vwc: f64,

    /// Capture timestamp at the probe
    pub captured_at: DateTime<Utc>,

    /// Monotonic per-sensor sequence number
    pub sequence: u64,
}

/// A sealed reading as it crosses the ingest boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub body: ReadingBody,
    pub seal: SealedRecord,
}

impl Reading {
    pub fn id(&self) -> ReadingId {
        ReadingId {
            sensor_id: self.body.sensor_id.clone(),
            sequence: self.body.sequence,
        }
    }
}

/// Stable identity of a reading: sensor + sequence. Used for CellState
/// provenance and for deduplication across failover re-delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingId {
    pub sensor_id: String,
    pub sequence: u64,
}

/// Why ingest refused a reading. Every rejection is logged and audited,
/// never silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Moisture outside [0, 1]
    OutOfRange,

    /// Sequence number already seen, or older than the dedup window
    DuplicateOrReplay,

    /// Seal did not verify against the body
    InvalidSignature,

    /// Capture timestamp implausibly far from node clock
    Stale,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::OutOfRange => "REJECT_OUT_OF_RANGE",
            RejectReason::DuplicateOrReplay => "REJECT_DUPLICATE_OR_REPLAY",
            RejectReason::InvalidSignature => "REJECT_INVALID_SIGNATURE",
            RejectReason::Stale => "REJECT_STALE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_str() {
        assert_eq!(RejectReason::OutOfRange.as_str(), "REJECT_OUT_OF_RANGE");
        assert_eq!(RejectReason::DuplicateOrReplay.as_str(), "REJECT_DUPLICATE_OR_REPLAY");
        assert_eq!(RejectReason::InvalidSignature.as_str(), "REJECT_INVALID_SIGNATURE");
        assert_eq!(RejectReason::Stale.as_str(), "REJECT_STALE");
    }
}
