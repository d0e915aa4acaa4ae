// PIPELINE
// Ingest → filter → interpolate → publish, gated by pipeline ownership
//
// SAFETY INVARIANTS:
// 1. No publication leaves this node unless the ownership store shows
//    this node holding the latest active epoch at render time
// 2. The interpolator reads an epoch-consistent snapshot taken after the
//    filter barrier, never a half-updated grid
// 3. Every publication is sealed and audited before it is retained
// 4. Readings buffered while not owning are kept; ownership loss drops
//    publications, not measurements

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::info;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use loam_audit::{AuditChain, AuditEntryType, JsonlAuditSink, SinkError};
use loam_core::{
    canonical_bytes, CellIndex, CovariateSample, EncodeError, GridPublication, NodeConfig, Reading,
    SealedRecord,
};
use loam_crypto::{DeviceKeyRegistry, SealError, Sealer};
use loam_failover::{FailoverError, FailoverOrchestrator};
use loam_filter::{CellStateStore, EpochHandle, EpochSummary, FilterEngine};
use loam_grid::{Interpolator, RenderError};
use loam_ingest::{Accepted, CovariateAdapter, Ingest, RawExternalSample, Rejected, SequenceWindow};
use loam_scheduler::SignalSnapshot;

/// Deviation between a reading and the current estimate that raises the
/// anomaly flag, VWC
const ANOMALY_RESIDUAL: f64 = 0.15;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("node does not own the pipeline; publication suppressed")]
    NotOwner,

    #[error(transparent)]
    Failover(#[from] FailoverError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Everything one recompute produced.
#[derive(Debug)]
pub struct EpochReport {
    pub summary: EpochSummary,
    pub publication: GridPublication,
    pub seal: SealedRecord,
    pub snapshot: SignalSnapshot,
}

/// One node's full estimation pipeline. The orchestrator and audit
/// chain are shared with the heartbeat monitor.
pub struct Pipeline {
    config: NodeConfig,
    ingest: Ingest,
    adapter: CovariateAdapter,
    engine: FilterEngine,
    interpolator: Interpolator,
    store: CellStateStore,
    sealer: Sealer,
    chain: Arc<Mutex<AuditChain>>,
    orchestrator: Arc<Mutex<FailoverOrchestrator>>,
    sink: Option<JsonlAuditSink>,
    persisted_entries: usize,

    /// Readings accepted since the last recompute
    pending: Vec<(CellIndex, Reading)>,

    /// Normalized covariates, pruned by age on recompute
    covariates: Vec<CovariateSample>,

    /// Recent publications, bounded by the retention config
    publications: VecDeque<GridPublication>,

    /// (time, grid mean VWC) per publication, for the trend slopes
    mean_history: VecDeque<(DateTime<Utc>, f64)>,

    next_epoch: u64,
    forecast_et_mm_day: f64,
    irrigation_active: bool,
    anomaly_flagged: bool,
}

impl Pipeline {
    pub fn new(
        config: NodeConfig,
        sealer: Sealer,
        orchestrator: Arc<Mutex<FailoverOrchestrator>>,
        chain: Arc<Mutex<AuditChain>>,
    ) -> Pipeline {
        let registry = Arc::new(DeviceKeyRegistry::new());
        let ingest = Ingest::new(config.grid.clone(), config.ingest.clone(), registry);
        let engine = FilterEngine::new(config.filter.clone(), config.prior.clone());
        let interpolator = Interpolator::new(
            config.grid.clone(),
            config.interpolator.clone(),
            config.filter.covariate_half_life_hours,
        );
        Pipeline {
            ingest,
            adapter: CovariateAdapter::default(),
            engine,
            interpolator,
            store: CellStateStore::new(),
            sealer,
            chain,
            orchestrator,
            sink: None,
            persisted_entries: 0,
            pending: Vec::new(),
            covariates: Vec::new(),
            publications: VecDeque::new(),
            mean_history: VecDeque::new(),
            next_epoch: 1,
            forecast_et_mm_day: 0.0,
            irrigation_active: false,
            anomaly_flagged: false,
            config,
        }
    }

    /// Resume from a previously persisted cell-state store.
    pub fn with_store(mut self, store: CellStateStore) -> Pipeline {
        self.store = store;
        self
    }

    /// Attach a durable audit sink; entries already in the chain are
    /// assumed persisted by whoever loaded them.
    pub fn attach_sink(&mut self, sink: JsonlAuditSink) {
        self.persisted_entries = self.chain.lock().len();
        self.sink = Some(sink);
    }

    /// Bind a sensor to its provisioned verifying key. Readings for a
    /// sensor with no binding are rejected at ingest.
    pub fn provision_device(&self, sensor_id: &str, signer_id: &str) {
        self.ingest.registry().provision(sensor_id, signer_id);
    }

    /// Gate one reading through ingest and buffer it for the next epoch.
    pub fn submit_reading(
        &mut self,
        reading: Reading,
        now: DateTime<Utc>,
    ) -> Result<Accepted, Rejected> {
        let accepted = {
            let mut chain = self.chain.lock();
            self.ingest.accept(reading, now, &mut chain)?
        };
        // A reading far from the running estimate is the out-of-turn
        // trigger the scheduler preempts on.
        if let Some(state) = self.store.latest(accepted.cell) {
            if (accepted.reading.body.vwc - state.mean_vwc()).abs() > ANOMALY_RESIDUAL {
                self.anomaly_flagged = true;
            }
        }
        self.pending
            .push((accepted.cell, accepted.reading.clone()));
        Ok(accepted)
    }

    /// Normalize and buffer raw external signals.
    pub fn submit_covariates(&mut self, raws: &[RawExternalSample]) -> usize {
        let normalized = self.adapter.normalize_batch(raws);
        let count = normalized.len();
        self.covariates.extend(normalized);
        count
    }

    pub fn set_forecast_et(&mut self, mm_day: f64) {
        self.forecast_et_mm_day = mm_day;
    }

    pub fn set_irrigation_active(&mut self, active: bool) {
        self.irrigation_active = active;
    }

    pub fn store(&self) -> &CellStateStore {
        &self.store
    }

    pub fn latest_publication(&self) -> Option<&GridPublication> {
        self.publications.back()
    }

    pub fn pending_readings(&self) -> usize {
        self.pending.len()
    }

    /// Run one full epoch: filter the buffered readings, render, seal,
    /// publish. Refused without ownership; buffered readings survive
    /// the refusal.
    pub fn recompute(&mut self, now: DateTime<Utc>) -> Result<EpochReport, PipelineError> {
        if !self.orchestrator.lock().may_publish()? {
            return Err(PipelineError::NotOwner);
        }

        let epoch = self.next_epoch;
        let readings = std::mem::take(&mut self.pending);
        let handle = EpochHandle::new();
        let summary = self.engine.run_epoch(
            epoch,
            now,
            readings,
            self.forecast_et_mm_day,
            &self.store,
            &handle,
        );

        self.prune_covariates(now);
        // Barrier: the interpolator sees only the post-epoch snapshot.
        let states = self.store.snapshot_latest();
        let publication = self
            .interpolator
            .render(epoch, now, &states, &self.covariates)?;

        let (seal, snapshot) = {
            let mut chain = self.chain.lock();
            let summary_digest = Sha256::digest(&canonical_bytes(&(
                summary.epoch,
                summary.cells_updated as u64,
                summary.readings_applied as u64,
                summary.isolated_failures as u64,
            ))?)
            .to_vec();
            chain.append(AuditEntryType::StateUpdated, summary_digest);

            let seal = self.sealer.seal(&publication, &mut chain)?;
            chain.append(AuditEntryType::GridPublished, seal.payload_hash.clone());
            let snapshot = self.signal_snapshot(now, &publication);
            (seal, snapshot)
        };

        self.publications.push_back(publication.clone());
        while self.publications.len() > self.config.publication_retention {
            self.publications.pop_front();
        }
        self.mean_history.push_back((now, mean_vwc(&publication)));
        while self.mean_history.len() > self.config.publication_retention {
            self.mean_history.pop_front();
        }
        self.next_epoch += 1;
        self.anomaly_flagged = false;
        self.flush_audit()?;

        info!(
            "epoch {}: {} cells updated, {} readings, degraded={}",
            epoch, summary.cells_updated, summary.readings_applied, publication.degraded
        );
        Ok(EpochReport { summary, publication, seal, snapshot })
    }

    fn prune_covariates(&mut self, now: DateTime<Utc>) {
        // Past four half-lives a covariate's weight is under 7%.
        let horizon = Duration::seconds(
            (self.config.filter.covariate_half_life_hours * 4.0 * 3600.0) as i64,
        );
        self.covariates.retain(|c| now - c.available_at <= horizon);
    }

    fn slope_per_hour(&self, now: DateTime<Utc>, window_hours: f64) -> f64 {
        let cutoff = now - Duration::seconds((window_hours * 3600.0) as i64);
        let earliest = self.mean_history.iter().find(|(t, _)| *t >= cutoff);
        let latest = self.mean_history.back();
        match (earliest, latest) {
            (Some((t0, v0)), Some((t1, v1))) if t1 > t0 => {
                let hours = (*t1 - *t0).num_seconds() as f64 / 3600.0;
                (v1 - v0) / hours
            }
            _ => 0.0,
        }
    }

    fn signal_snapshot(&self, now: DateTime<Utc>, publication: &GridPublication) -> SignalSnapshot {
        let mean = mean_vwc(publication);
        let spatial_variance = if publication.cells.is_empty() {
            0.0
        } else {
            publication
                .cells
                .iter()
                .map(|c| (c.vwc - mean).powi(2))
                .sum::<f64>()
                / publication.cells.len() as f64
        };
        SignalSnapshot {
            taken_at: now,
            slope_short: self.slope_per_hour(now, 1.0),
            slope_medium: self.slope_per_hour(now, 6.0),
            slope_long: self.slope_per_hour(now, 24.0),
            spatial_variance,
            irrigation_active: self.irrigation_active,
            forecast_et_mm_day: self.forecast_et_mm_day,
            anomaly_flagged: self.anomaly_flagged,
        }
    }

    /// Persist the retained publications as JSON.
    pub fn save_publications(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let publications: Vec<&GridPublication> = self.publications.iter().collect();
        let json = serde_json::to_string_pretty(&publications)?;
        std::fs::write(path, json)
    }

    /// Reload retained publications from a previous run; the epoch
    /// counter resumes past the newest one.
    pub fn load_publications(&mut self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let json = std::fs::read_to_string(path)?;
        let publications: Vec<GridPublication> = serde_json::from_str(&json)?;
        for publication in &publications {
            self.mean_history
                .push_back((publication.published_at, mean_vwc(publication)));
            self.next_epoch = self.next_epoch.max(publication.epoch + 1);
        }
        self.publications = publications.into();
        Ok(())
    }

    /// Persist the per-sensor dedup windows. Part of the durable state a
    /// mirror or spare syncs, so replays re-delivered during a handoff
    /// stay rejected on whichever node processes them.
    pub fn save_sequence_windows(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.ingest.windows_snapshot())?;
        std::fs::write(path, json)
    }

    /// Restore dedup windows persisted by a previous run or synced from
    /// the node being replaced.
    pub fn load_sequence_windows(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> std::io::Result<()> {
        let json = std::fs::read_to_string(path)?;
        let windows: BTreeMap<String, SequenceWindow> = serde_json::from_str(&json)?;
        self.ingest.restore_windows(windows);
        Ok(())
    }

    /// Persist chain entries appended since the last flush.
    pub fn flush_audit(&mut self) -> Result<(), PipelineError> {
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        let chain = self.chain.lock();
        for entry in &chain.entries()[self.persisted_entries..] {
            sink.persist(entry)?;
        }
        self.persisted_entries = chain.len();
        Ok(())
    }
}

fn mean_vwc(publication: &GridPublication) -> f64 {
    if publication.cells.is_empty() {
        return 0.0;
    }
    publication.cells.iter().map(|c| c.vwc).sum::<f64>() / publication.cells.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::{FailoverConfig, OwnerLocation};
    use loam_crypto::DeviceIdentity;
    use loam_failover::{MemoryOwnershipStore, OwnershipStore};

    fn owning_pipeline(node_id: &str) -> Pipeline {
        let config = NodeConfig::for_testing(node_id);
        let store = Arc::new(MemoryOwnershipStore::new());
        let chain = Arc::new(Mutex::new(AuditChain::new()));
        let mut orch = FailoverOrchestrator::new(
            node_id,
            OwnerLocation::PrimaryEdge,
            FailoverConfig::default(),
            store as Arc<dyn OwnershipStore>,
        );
        orch.bootstrap(Utc::now(), &mut chain.lock()).unwrap();
        let sealer = Sealer::new(DeviceIdentity::generate(node_id));
        let pipeline = Pipeline::new(config, sealer, Arc::new(Mutex::new(orch)), chain);
        pipeline.provision_device("probe-1", &probe_signer());
        pipeline
    }

    fn probe_signer() -> String {
        DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]).signer_id()
    }

    fn sealed_reading(
        identity: &DeviceIdentity,
        chain: &Arc<Mutex<AuditChain>>,
        vwc: f64,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Reading {
        let body = loam_core::ReadingBody {
            sensor_id: identity.device_id().to_string(),
            position: loam_core::GeoPosition { lat_deg: 36.0001, lon_deg: -119.9999 },
            depth_m: 0.1,
            vwc,
            captured_at: now,
            sequence,
        };
        let sealer = Sealer::new(DeviceIdentity::from_secret_bytes(
            identity.device_id(),
            &[7u8; 32],
        ));
        let seal = sealer.seal(&body, &mut chain.lock()).unwrap();
        Reading { body, seal }
    }

    #[test]
    fn test_recompute_without_ownership_keeps_readings() {
        let node_id = "edge-01";
        let config = NodeConfig::for_testing(node_id);
        let store = Arc::new(MemoryOwnershipStore::new());
        let chain = Arc::new(Mutex::new(AuditChain::new()));
        // Never bootstrapped: standby, no epoch.
        let orch = FailoverOrchestrator::new(
            node_id,
            OwnerLocation::CloudMirror,
            FailoverConfig::default(),
            store as Arc<dyn OwnershipStore>,
        );
        let sealer = Sealer::new(DeviceIdentity::generate(node_id));
        let mut pipeline = Pipeline::new(config, sealer, Arc::new(Mutex::new(orch)), chain.clone());
        pipeline.provision_device("probe-1", &probe_signer());

        let identity = DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]);
        let now = Utc::now();
        let reading = sealed_reading(&identity, &chain, 0.30, 1, now);
        pipeline.submit_reading(reading, now).unwrap();
        assert_eq!(pipeline.pending_readings(), 1);

        assert!(matches!(pipeline.recompute(now), Err(PipelineError::NotOwner)));
        assert_eq!(pipeline.pending_readings(), 1);
        assert!(pipeline.latest_publication().is_none());
    }

    #[test]
    fn test_recompute_publishes_and_audits() {
        let mut pipeline = owning_pipeline("edge-01");
        let chain = Arc::clone(&pipeline.chain);
        let identity = DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]);
        let now = Utc::now();
        for (i, vwc) in [0.30, 0.31, 0.29].iter().enumerate() {
            let reading = sealed_reading(&identity, &chain, *vwc, i as u64 + 1, now);
            pipeline.submit_reading(reading, now).unwrap();
        }

        let report = pipeline.recompute(now).unwrap();
        assert_eq!(report.summary.readings_applied, 3);
        assert_eq!(report.publication.epoch, 1);
        assert_eq!(
            report.publication.cells.len(),
            pipeline.config.grid.cell_count()
        );

        let chain = chain.lock();
        assert!(chain.verify_all().is_ok());
        let published = chain
            .entries()
            .iter()
            .filter(|e| e.entry_type == AuditEntryType::GridPublished)
            .count();
        assert_eq!(published, 1);
    }

    #[test]
    fn test_large_jump_raises_anomaly_once() {
        let mut pipeline = owning_pipeline("edge-01");
        let chain = Arc::clone(&pipeline.chain);
        let identity = DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]);
        let now = Utc::now();
        pipeline
            .submit_reading(sealed_reading(&identity, &chain, 0.20, 1, now), now)
            .unwrap();
        let report = pipeline.recompute(now).unwrap();
        assert!(!report.snapshot.anomaly_flagged);

        // 0.20 → 0.45 is far past the anomaly residual.
        pipeline
            .submit_reading(sealed_reading(&identity, &chain, 0.45, 2, now), now)
            .unwrap();
        let report = pipeline.recompute(now).unwrap();
        assert!(report.snapshot.anomaly_flagged);

        // Consumed by the recompute that reported it.
        pipeline
            .submit_reading(sealed_reading(&identity, &chain, 0.44, 3, now), now)
            .unwrap();
        let report = pipeline.recompute(now).unwrap();
        assert!(!report.snapshot.anomaly_flagged);
    }

    #[test]
    fn test_publications_survive_restart_and_epochs_continue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publications.json");

        let mut pipeline = owning_pipeline("edge-01");
        let chain = Arc::clone(&pipeline.chain);
        let identity = DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]);
        let now = Utc::now();
        pipeline
            .submit_reading(sealed_reading(&identity, &chain, 0.26, 1, now), now)
            .unwrap();
        pipeline.recompute(now).unwrap();
        pipeline.recompute(now).unwrap();
        pipeline.save_publications(&path).unwrap();

        let mut resumed = owning_pipeline("edge-01");
        resumed.load_publications(&path).unwrap();
        assert_eq!(resumed.publications.len(), 2);
        assert_eq!(resumed.next_epoch, 3);
    }

    #[test]
    fn test_replayed_readings_stay_rejected_across_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sequences.json");

        let mut primary = owning_pipeline("edge-01");
        let chain = Arc::clone(&primary.chain);
        let identity = DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]);
        let now = Utc::now();
        primary
            .submit_reading(sealed_reading(&identity, &chain, 0.29, 5, now), now)
            .unwrap();
        primary.save_sequence_windows(&path).unwrap();

        // The successor restores the synced windows before taking traffic.
        let mut mirror = owning_pipeline("mirror-01");
        mirror.load_sequence_windows(&path).unwrap();
        let mirror_chain = Arc::clone(&mirror.chain);

        let replay = sealed_reading(&identity, &mirror_chain, 0.29, 5, now);
        let rejected = mirror.submit_reading(replay, now).unwrap_err();
        assert_eq!(rejected.reason, loam_core::RejectReason::DuplicateOrReplay);
        assert_eq!(mirror.pending_readings(), 0);

        let fresh = sealed_reading(&identity, &mirror_chain, 0.30, 6, now);
        assert!(mirror.submit_reading(fresh, now).is_ok());
    }

    #[test]
    fn test_publication_retention_is_bounded() {
        let mut pipeline = owning_pipeline("edge-01");
        let chain = Arc::clone(&pipeline.chain);
        let identity = DeviceIdentity::from_secret_bytes("probe-1", &[7u8; 32]);
        let retention = pipeline.config.publication_retention;
        let now = Utc::now();
        pipeline
            .submit_reading(sealed_reading(&identity, &chain, 0.25, 1, now), now)
            .unwrap();
        for _ in 0..retention + 4 {
            pipeline.recompute(Utc::now()).unwrap();
        }
        assert_eq!(pipeline.publications.len(), retention);
    }
}
