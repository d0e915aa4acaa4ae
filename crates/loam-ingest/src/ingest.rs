// MEASUREMENT INGEST
// Validates, deduplicates, and cell-associates incoming readings
//
// SAFETY INVARIANTS:
// 1. Check order is fixed: range → sequence → signature → key binding →
//    clock skew
// 2. A sequence number is committed to the dedup window only after every
//    check passes (a forged reading cannot burn a legitimate number)
// 3. A seal is accepted only when its signer is the key provisioned for
//    the claimed sensor; a fresh keypair cannot impersonate a sensor
// 4. Every rejection is logged and audited, never silently ignored
// 5. Per-sensor windows are independent; bursty fleets contend only on
//    their own sensor's entry
// 6. The dedup windows round-trip through the durable state so replays
//    re-delivered after a restart or failover stay rejected

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{error, info, warn};
use thiserror::Error;

use loam_audit::{AuditChain, AuditEntryType};
use loam_core::{
    CellIndex, GridGeometry, IngestConfig, Reading, ReadingId, RejectReason,
};
use loam_crypto::{DeviceKeyRegistry, Sealer};

use crate::dedup::SequenceWindow;

/// A reading that passed every check, associated with its grid cell.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub reading: Reading,
    pub cell: CellIndex,
}

/// A refused reading and why.
#[derive(Debug, Clone, Error)]
#[error("reading {reading_id:?} rejected: {}", reason.as_str())]
pub struct Rejected {
    pub reading_id: ReadingId,
    pub reason: RejectReason,
}

/// Ingest gate for the whole probe fleet.
pub struct Ingest {
    geometry: GridGeometry,
    config: IngestConfig,
    registry: Arc<DeviceKeyRegistry>,
    windows: DashMap<String, SequenceWindow>,
}

impl Ingest {
    pub fn new(
        geometry: GridGeometry,
        config: IngestConfig,
        registry: Arc<DeviceKeyRegistry>,
    ) -> Ingest {
        Ingest { geometry, config, registry, windows: DashMap::new() }
    }

    /// The provisioned-key registry consulted on every accept.
    pub fn registry(&self) -> &DeviceKeyRegistry {
        &self.registry
    }

    /// Snapshot every sensor's dedup window for persistence.
    pub fn windows_snapshot(&self) -> BTreeMap<String, SequenceWindow> {
        self.windows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Restore dedup windows persisted by a previous run or synced from
    /// the node being replaced. Existing windows for the same sensors
    /// are replaced wholesale.
    pub fn restore_windows(&self, windows: BTreeMap<String, SequenceWindow>) {
        for (sensor, window) in windows {
            self.windows.insert(sensor, window);
        }
    }

    /// Run the full acceptance pipeline on one reading.
    pub fn accept(
        &self,
        reading: Reading,
        now: DateTime<Utc>,
        chain: &mut AuditChain,
    ) -> Result<Accepted, Rejected> {
        let id = reading.id();

        // 1. Value range
        if !(0.0..=1.0).contains(&reading.body.vwc) || !reading.body.vwc.is_finite() {
            return Err(self.reject(id, RejectReason::OutOfRange, &reading, chain));
        }

        // 2. Sequence freshness (check only; commit after all checks)
        let fresh = self
            .windows
            .get(&reading.body.sensor_id)
            .map_or(true, |w| w.check(reading.body.sequence));
        if !fresh {
            return Err(self.reject(id, RejectReason::DuplicateOrReplay, &reading, chain));
        }

        // 3. Signature (Sealer::verify audits the violation itself)
        if Sealer::verify(&reading.seal, &reading.body, chain).is_err() {
            return Err(self.reject(id, RejectReason::InvalidSignature, &reading, chain));
        }

        // 3b. The signer must be the key provisioned for this sensor; a
        // valid signature from a fresh keypair is an impersonation.
        if let Err(e) = self
            .registry
            .check_binding(&reading.body.sensor_id, &reading.seal.signer)
        {
            error!("integrity violation from device {}: {}", reading.seal.device_id, e);
            chain.append(AuditEntryType::IntegrityViolation, reading.seal.payload_hash.clone());
            return Err(self.reject(id, RejectReason::InvalidSignature, &reading, chain));
        }

        // 4. Clock skew
        let skew = Duration::seconds(self.config.max_clock_skew_secs);
        if reading.body.captured_at < now - skew || reading.body.captured_at > now + skew {
            return Err(self.reject(id, RejectReason::Stale, &reading, chain));
        }

        // Cell association. An out-of-extent probe is a config fault and
        // is treated as stale rather than crashing ingest.
        let cell = match self.geometry.cell_for(reading.body.position) {
            Ok(cell) => cell,
            Err(_) => return Err(self.reject(id, RejectReason::Stale, &reading, chain)),
        };

        // Commit the sequence number under the per-sensor entry lock,
        // re-checking to close the race with a concurrent duplicate.
        let committed = self
            .windows
            .entry(reading.body.sensor_id.clone())
            .or_insert_with(|| SequenceWindow::new(self.config.dedup_window))
            .commit(reading.body.sequence);
        if !committed {
            return Err(self.reject(id, RejectReason::DuplicateOrReplay, &reading, chain));
        }

        chain.append(AuditEntryType::ReadingAccepted, reading.seal.payload_hash.clone());
        info!(
            "accepted reading {}#{} → cell ({}, {})",
            reading.body.sensor_id, reading.body.sequence, cell.row, cell.col
        );
        Ok(Accepted { reading, cell })
    }

    fn reject(
        &self,
        reading_id: ReadingId,
        reason: RejectReason,
        reading: &Reading,
        chain: &mut AuditChain,
    ) -> Rejected {
        warn!(
            "{} for {}#{}",
            reason.as_str(),
            reading_id.sensor_id,
            reading_id.sequence
        );
        chain.append(AuditEntryType::ReadingRejected, reading.seal.payload_hash.clone());
        Rejected { reading_id, reason }
    }

    /// Highest accepted sequence for a sensor, for diagnostics.
    pub fn last_sequence(&self, sensor_id: &str) -> Option<u64> {
        self.windows.get(sensor_id).and_then(|w| w.max_seen())
    }
}
