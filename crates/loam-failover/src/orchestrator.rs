// FAILOVER ORCHESTRATOR
// Three-tier ownership state machine: primary edge, cloud mirror, cold spare
//
// SAFETY INVARIANTS:
// 1. The pipeline runs only while this node holds the latest active epoch
//    in the ownership store; may_publish() re-checks the store, not a
//    cached belief
// 2. Every successful transition appends an OWNERSHIP_TRANSITIONED audit
//    entry before the new role takes effect
// 3. A node that observes a higher epoch than its own steps down without
//    contesting it
// 4. The cold spare activates only after state synchronization from the
//    durable log is confirmed; a spare with stale state stays warming
// 5. A claim-write failure past the retry budget is fatal, never retried
//    silently forever

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use loam_audit::{AuditChain, AuditEntryType};
use loam_core::{canonical_bytes, FailoverConfig, OwnerLocation, OwnershipRecord};

use crate::store::{ClaimError, OwnershipStore, OwnershipStoreError};

/// Where this node stands in the failover chain right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// Watching a healthy owner; not running the pipeline
    Standby,

    /// This node is the primary edge owner
    PrimaryActive,

    /// This node is the cloud mirror and has assumed ownership
    MirrorActive,

    /// Cold spare replaying the durable log; not yet eligible to own
    ColdSpareWarming,

    /// Cold spare has confirmed sync and assumed ownership
    ColdSpareActive,

    /// Unrecoverable: the ownership store refused every claim attempt
    Fatal,
}

impl FailoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverState::Standby => "STANDBY",
            FailoverState::PrimaryActive => "PRIMARY_ACTIVE",
            FailoverState::MirrorActive => "MIRROR_ACTIVE",
            FailoverState::ColdSpareWarming => "COLD_SPARE_WARMING",
            FailoverState::ColdSpareActive => "COLD_SPARE_ACTIVE",
            FailoverState::Fatal => "FATAL",
        }
    }

    pub fn owns_pipeline(&self) -> bool {
        matches!(
            self,
            FailoverState::PrimaryActive
                | FailoverState::MirrorActive
                | FailoverState::ColdSpareActive
        )
    }
}

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("claim lost: epoch {current_epoch} held by {current_owner}")]
    ClaimLost {
        current_epoch: u64,
        current_owner: String,
    },

    #[error("ownership store failed {attempts} consecutive claim writes")]
    FatalStorage { attempts: u32 },

    #[error("cold spare activation refused: synchronization not confirmed")]
    SyncNotConfirmed,

    #[error("operation {operation} invalid in state {from}")]
    InvalidTransition {
        from: &'static str,
        operation: &'static str,
    },

    #[error(transparent)]
    Store(#[from] OwnershipStoreError),
}

fn record_digest(record: &OwnershipRecord) -> Vec<u8> {
    let bytes = canonical_bytes(record).expect("ownership record has no unserializable fields");
    Sha256::digest(&bytes).to_vec()
}

/// Per-node ownership state machine. One instance per node; the store is
/// the shared ground truth the instances race on.
pub struct FailoverOrchestrator {
    node_id: String,
    location: OwnerLocation,
    config: FailoverConfig,
    store: Arc<dyn OwnershipStore>,
    state: FailoverState,

    /// Epoch this node holds, if it owns the pipeline
    owned_epoch: Option<u64>,

    /// Latest epoch this node has observed in the store
    observed_epoch: Option<u64>,

    missed_heartbeats: u32,
    sync_confirmed: bool,

    /// When the mirror first noticed the primary missing, for the
    /// primary-recovery window before spare warm-up
    owner_silent_since: Option<DateTime<Utc>>,
}

impl FailoverOrchestrator {
    pub fn new(
        node_id: &str,
        location: OwnerLocation,
        config: FailoverConfig,
        store: Arc<dyn OwnershipStore>,
    ) -> FailoverOrchestrator {
        FailoverOrchestrator {
            node_id: node_id.to_string(),
            location,
            config,
            store,
            state: FailoverState::Standby,
            owned_epoch: None,
            observed_epoch: None,
            missed_heartbeats: 0,
            sync_confirmed: false,
            owner_silent_since: None,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn owned_epoch(&self) -> Option<u64> {
        self.owned_epoch
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn active_state_for_location(&self) -> FailoverState {
        match self.location {
            OwnerLocation::PrimaryEdge => FailoverState::PrimaryActive,
            OwnerLocation::CloudMirror => FailoverState::MirrorActive,
            OwnerLocation::ColdSpare => FailoverState::ColdSpareActive,
        }
    }

    fn build_record(&self, epoch: u64, now: DateTime<Utc>) -> OwnershipRecord {
        let heartbeat_window = self.config.heartbeat_interval_secs
            * self.config.missed_heartbeat_threshold as u64;
        OwnershipRecord {
            epoch,
            owner: self.node_id.clone(),
            location: self.location,
            claimed_at: now,
            heartbeat_deadline: now + Duration::seconds(heartbeat_window as i64),
            active: true,
        }
    }

    /// One CAS attempt against the latest epoch this node has observed,
    /// retried up to the configured budget on storage failures. A lost
    /// race is an outcome, not a failure to retry.
    fn claim(
        &mut self,
        now: DateTime<Utc>,
        chain: &mut AuditChain,
    ) -> Result<OwnershipRecord, FailoverError> {
        let mut attempts = 0;
        loop {
            let expected = self.observed_epoch;
            let proposed = self.build_record(expected.map_or(1, |e| e + 1), now);
            match self.store.claim(expected, proposed) {
                Ok(accepted) => {
                    self.owned_epoch = Some(accepted.epoch);
                    self.observed_epoch = Some(accepted.epoch);
                    self.missed_heartbeats = 0;
                    self.owner_silent_since = None;
                    chain.append(AuditEntryType::OwnershipTransitioned, record_digest(&accepted));
                    return Ok(accepted);
                }
                Err(ClaimError::Lost { current }) => {
                    // Someone else already holds a newer epoch. Adopt
                    // their view and step down.
                    self.observed_epoch = Some(current.epoch);
                    self.owned_epoch = None;
                    self.state = FailoverState::Standby;
                    self.missed_heartbeats = 0;
                    return Err(FailoverError::ClaimLost {
                        current_epoch: current.epoch,
                        current_owner: current.owner,
                    });
                }
                Err(ClaimError::NotSuccessor { expected, proposed }) => {
                    // Observed epoch drifted between read and write;
                    // refresh and retry within the same budget.
                    warn!(
                        "failover: claim epoch {} not successor of {:?}, refreshing",
                        proposed, expected
                    );
                    self.observed_epoch = self.store.latest()?.map(|r| r.epoch);
                }
                Err(ClaimError::Storage(e)) => {
                    attempts += 1;
                    warn!(
                        "failover: claim write {}/{} failed: {}",
                        attempts, self.config.claim_retry_budget, e
                    );
                    if attempts >= self.config.claim_retry_budget {
                        error!(
                            "failover: {} claim attempts exhausted, node {} entering FATAL",
                            attempts, self.node_id
                        );
                        self.state = FailoverState::Fatal;
                        return Err(FailoverError::FatalStorage { attempts });
                    }
                }
            }
        }
    }

    /// Bring this node up. The primary edge claims ownership immediately;
    /// mirror and cold spare come up watching.
    pub fn bootstrap(
        &mut self,
        now: DateTime<Utc>,
        chain: &mut AuditChain,
    ) -> Result<FailoverState, FailoverError> {
        self.observed_epoch = self.store.latest()?.map(|r| r.epoch);
        match self.location {
            OwnerLocation::PrimaryEdge => {
                let accepted = self.claim(now, chain)?;
                self.state = FailoverState::PrimaryActive;
                info!(
                    "failover: {} bootstrapped as primary, epoch {}",
                    self.node_id, accepted.epoch
                );
            }
            OwnerLocation::CloudMirror | OwnerLocation::ColdSpare => {
                self.state = FailoverState::Standby;
                info!("failover: {} bootstrapped on standby", self.node_id);
            }
        }
        Ok(self.state)
    }

    /// The watched owner heartbeated in time.
    pub fn record_heartbeat(&mut self, _now: DateTime<Utc>) {
        self.missed_heartbeats = 0;
        self.owner_silent_since = None;
    }

    /// A heartbeat interval elapsed with no heartbeat from the owner.
    /// Returns the new state if the miss triggered a transition.
    pub fn on_missed_heartbeat(
        &mut self,
        now: DateTime<Utc>,
        chain: &mut AuditChain,
    ) -> Result<Option<FailoverState>, FailoverError> {
        if self.state != FailoverState::Standby && self.state != FailoverState::ColdSpareWarming {
            return Ok(None);
        }
        self.missed_heartbeats += 1;
        if self.owner_silent_since.is_none() {
            self.owner_silent_since = Some(now);
        }
        if self.missed_heartbeats < self.config.missed_heartbeat_threshold {
            return Ok(None);
        }

        match self.location {
            OwnerLocation::CloudMirror => {
                warn!(
                    "failover: {} missed heartbeats reached {}, mirror {} claiming ownership",
                    self.missed_heartbeats, self.config.missed_heartbeat_threshold, self.node_id
                );
                self.observed_epoch = self.store.latest()?.map(|r| r.epoch);
                match self.claim(now, chain) {
                    Ok(_) => {
                        self.state = FailoverState::MirrorActive;
                        Ok(Some(self.state))
                    }
                    // Lost means another tier got there first; we stay
                    // on standby, which claim() already arranged.
                    Err(FailoverError::ClaimLost { .. }) => Ok(Some(FailoverState::Standby)),
                    Err(e) => Err(e),
                }
            }
            OwnerLocation::ColdSpare => {
                // The spare waits out the primary-recovery window before
                // warming; mirrors get the first shot at ownership.
                let silent_for = now
                    - self
                        .owner_silent_since
                        .expect("set when the first miss was counted");
                let window = Duration::seconds(self.config.primary_recovery_window_secs as i64);
                if self.state == FailoverState::Standby && silent_for >= window {
                    info!(
                        "failover: recovery window elapsed, cold spare {} warming",
                        self.node_id
                    );
                    self.state = FailoverState::ColdSpareWarming;
                    self.sync_confirmed = false;
                    return Ok(Some(self.state));
                }
                Ok(None)
            }
            OwnerLocation::PrimaryEdge => Ok(None),
        }
    }

    /// The warming spare finished replaying the durable state log.
    pub fn confirm_sync(&mut self) -> Result<(), FailoverError> {
        if self.state != FailoverState::ColdSpareWarming {
            return Err(FailoverError::InvalidTransition {
                from: self.state.as_str(),
                operation: "confirm_sync",
            });
        }
        self.sync_confirmed = true;
        Ok(())
    }

    /// Promote the warmed spare to owner. Refused while sync is
    /// unconfirmed, no matter how long the outage has run.
    pub fn activate_cold_spare(
        &mut self,
        now: DateTime<Utc>,
        chain: &mut AuditChain,
    ) -> Result<OwnershipRecord, FailoverError> {
        if self.state != FailoverState::ColdSpareWarming {
            return Err(FailoverError::InvalidTransition {
                from: self.state.as_str(),
                operation: "activate_cold_spare",
            });
        }
        if !self.sync_confirmed {
            return Err(FailoverError::SyncNotConfirmed);
        }
        self.observed_epoch = self.store.latest()?.map(|r| r.epoch);
        let accepted = self.claim(now, chain)?;
        self.state = FailoverState::ColdSpareActive;
        Ok(accepted)
    }

    /// A recovered node rejoins by claiming a fresh epoch rather than
    /// resuming its old one; the old epoch stays dead.
    pub fn rejoin(
        &mut self,
        now: DateTime<Utc>,
        chain: &mut AuditChain,
    ) -> Result<OwnershipRecord, FailoverError> {
        if self.state == FailoverState::Fatal {
            return Err(FailoverError::InvalidTransition {
                from: self.state.as_str(),
                operation: "rejoin",
            });
        }
        self.observed_epoch = self.store.latest()?.map(|r| r.epoch);
        let accepted = self.claim(now, chain)?;
        self.state = self.active_state_for_location();
        Ok(accepted)
    }

    /// Re-check the store before any publish. An active node that sees
    /// a higher epoch than its own steps down here.
    pub fn may_publish(&mut self) -> Result<bool, FailoverError> {
        if !self.state.owns_pipeline() {
            return Ok(false);
        }
        let owned = match self.owned_epoch {
            Some(e) => e,
            None => return Ok(false),
        };
        match self.store.latest()? {
            Some(latest) if latest.epoch == owned && latest.owner == self.node_id => Ok(true),
            Some(latest) => {
                warn!(
                    "failover: {} holds epoch {} but store shows epoch {} ({}); stepping down",
                    self.node_id, owned, latest.epoch, latest.owner
                );
                self.observed_epoch = Some(latest.epoch);
                self.owned_epoch = None;
                self.state = FailoverState::Standby;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Expose the transition record for diagnostics.
    pub fn latest_record(&self) -> Result<Option<OwnershipRecord>, FailoverError> {
        Ok(self.store.latest()?)
    }
}
