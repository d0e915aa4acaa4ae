// HEARTBEAT MONITOR
// Async loop that turns owner heartbeats into orchestrator transitions
//
// SAFETY INVARIANTS:
// 1. One heartbeat interval with no heartbeat counts as exactly one miss
// 2. A heartbeat restarts the interval; partial intervals never count
// 3. The monitor stops once this node owns the pipeline or goes fatal;
//    the pipeline loop takes over from there

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;

use loam_audit::AuditChain;
use loam_core::FailoverConfig;

use crate::orchestrator::{FailoverError, FailoverOrchestrator, FailoverState};

/// Why the monitor loop returned.
#[derive(Debug, PartialEq, Eq)]
pub enum MonitorExit {
    /// This node assumed ownership
    Promoted(FailoverState),

    /// The orchestrator went fatal
    Fatal,

    /// The heartbeat channel closed and no transition is pending
    ChannelClosed,
}

/// Watch owner heartbeats and drive the orchestrator on misses.
///
/// `heartbeats` carries one unit per heartbeat received from the active
/// owner. The orchestrator and chain are shared with the pipeline, so
/// transitions land in the same audit trail the pipeline appends to.
pub async fn watch_owner(
    orchestrator: Arc<Mutex<FailoverOrchestrator>>,
    chain: Arc<Mutex<AuditChain>>,
    config: FailoverConfig,
    mut heartbeats: mpsc::Receiver<()>,
) -> Result<MonitorExit, FailoverError> {
    let interval = Duration::from_secs(config.heartbeat_interval_secs);
    let mut ticker = time::interval(interval);
    // The first tick fires immediately; skip it so a fresh monitor does
    // not count a miss at startup.
    ticker.tick().await;
    let mut channel_open = true;

    loop {
        tokio::select! {
            received = heartbeats.recv(), if channel_open => {
                match received {
                    Some(()) => {
                        orchestrator.lock().record_heartbeat(Utc::now());
                        ticker.reset();
                    }
                    None => {
                        // Sender dropped; keep ticking so the outage is
                        // still detected, but stop polling the channel.
                        channel_open = false;
                    }
                }
            }
            _ = ticker.tick() => {
                let transition = {
                    let mut orch = orchestrator.lock();
                    let mut chain = chain.lock();
                    orch.on_missed_heartbeat(Utc::now(), &mut chain)
                };
                match transition {
                    Ok(Some(state)) if state.owns_pipeline() => {
                        return Ok(MonitorExit::Promoted(state));
                    }
                    Ok(Some(state)) => {
                        warn!("failover: monitor observed transition to {}", state.as_str());
                    }
                    Ok(None) => {}
                    Err(FailoverError::FatalStorage { .. }) => {
                        return Ok(MonitorExit::Fatal);
                    }
                    Err(e) => return Err(e),
                }
                if !channel_open {
                    let state = orchestrator.lock().state();
                    // A standby watcher keeps ticking toward promotion;
                    // any other state has nothing left to watch.
                    if state != FailoverState::Standby
                        && state != FailoverState::ColdSpareWarming
                    {
                        return Ok(MonitorExit::ChannelClosed);
                    }
                }
            }
        }
    }
}

/// One poll of the warm-up gate. The operator drops `marker` once the
/// durable-state replay on the spare has been verified; the next poll
/// confirms sync and claims ownership. A missing marker, or any state
/// other than COLD_SPARE_WARMING, is a no-op.
pub fn try_activate_spare(
    orchestrator: &Arc<Mutex<FailoverOrchestrator>>,
    chain: &Arc<Mutex<AuditChain>>,
    marker: &Path,
    now: DateTime<Utc>,
) -> Result<Option<FailoverState>, FailoverError> {
    if !marker.exists() {
        return Ok(None);
    }
    let mut orch = orchestrator.lock();
    if orch.state() != FailoverState::ColdSpareWarming {
        return Ok(None);
    }
    orch.confirm_sync()?;
    orch.activate_cold_spare(now, &mut chain.lock())?;
    Ok(Some(orch.state()))
}
