// LOAM NODE
// Daemon entry point: load config, establish ownership, run the
// scheduled estimation loop

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;

use loam_audit::{AuditChain, JsonlAuditSink};
use loam_core::{NodeConfig, OwnerLocation};
use loam_crypto::{DeviceIdentity, Sealer};
use loam_failover::{
    try_activate_spare, watch_owner, FailoverOrchestrator, FailoverState, FileOwnershipStore,
    MonitorExit, OwnershipStore,
};
use loam_root::{Pipeline, PipelineError};
use loam_scheduler::{decide, Decision, SignalSnapshot};

#[derive(Parser, Debug)]
#[command(name = "loam", about = "LOAM soil-moisture estimation node")]
struct Args {
    /// Path to the node configuration JSON
    #[arg(long)]
    config: PathBuf,

    /// Tier this node serves in the failover chain
    #[arg(long, value_parser = parse_location, default_value = "primary-edge")]
    location: OwnerLocation,

    /// Directory for the ownership ledger, audit log, and state snapshots
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

fn parse_location(s: &str) -> Result<OwnerLocation, String> {
    match s {
        "primary-edge" => Ok(OwnerLocation::PrimaryEdge),
        "cloud-mirror" => Ok(OwnerLocation::CloudMirror),
        "cold-spare" => Ok(OwnerLocation::ColdSpare),
        other => Err(format!(
            "unknown location '{}', expected primary-edge | cloud-mirror | cold-spare",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config_text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let config: NodeConfig = serde_json::from_str(&config_text).context("parsing node config")?;
    std::fs::create_dir_all(&args.data_dir).context("creating data directory")?;

    let audit_path = args.data_dir.join("audit.jsonl");
    let chain = if audit_path.exists() {
        let entries = JsonlAuditSink::load(&audit_path).context("loading audit log")?;
        AuditChain::from_entries(entries).context("audit log failed verification on load")?
    } else {
        AuditChain::new()
    };
    let chain = Arc::new(Mutex::new(chain));

    let ownership_path = args.data_dir.join("ownership.jsonl");
    let store = Arc::new(
        FileOwnershipStore::open(&ownership_path).context("opening ownership ledger")?,
    ) as Arc<dyn OwnershipStore>;

    let mut orchestrator = FailoverOrchestrator::new(
        &config.node_id,
        args.location,
        config.failover.clone(),
        store,
    );
    orchestrator.bootstrap(Utc::now(), &mut chain.lock())?;
    let orchestrator = Arc::new(Mutex::new(orchestrator));

    if args.location != OwnerLocation::PrimaryEdge {
        // TODO: feed this channel from the fleet heartbeat transport once
        // the uplink service lands; until then silence is assumed.
        let (_heartbeat_tx, heartbeat_rx) = mpsc::channel(16);
        info!("{}: watching the active owner", config.node_id);
        let mut monitor = tokio::spawn(watch_owner(
            Arc::clone(&orchestrator),
            Arc::clone(&chain),
            config.failover.clone(),
            heartbeat_rx,
        ));
        let exit = if args.location == OwnerLocation::ColdSpare {
            // A warming spare owns nothing until the operator verifies
            // the durable-state replay and drops the sync marker.
            let marker = args.data_dir.join("sync-confirmed");
            let mut poll = time::interval(time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    joined = &mut monitor => break joined??,
                    _ = poll.tick() => {
                        if let Some(state) =
                            try_activate_spare(&orchestrator, &chain, &marker, Utc::now())?
                        {
                            monitor.abort();
                            break MonitorExit::Promoted(state);
                        }
                        if orchestrator.lock().state() == FailoverState::ColdSpareWarming {
                            info!(
                                "{}: warming; touch {} once the state replay is verified",
                                config.node_id,
                                marker.display()
                            );
                        }
                    }
                }
            }
        } else {
            monitor.await??
        };
        match exit {
            MonitorExit::Promoted(state) => {
                info!("{}: promoted to {}", config.node_id, state.as_str())
            }
            MonitorExit::Fatal => anyhow::bail!("ownership store is unusable"),
            MonitorExit::ChannelClosed => anyhow::bail!("heartbeat source closed"),
        }
    }

    let sealer = Sealer::new(DeviceIdentity::generate(config.node_id.clone()));
    let node_id = config.node_id.clone();
    let mut pipeline = Pipeline::new(config.clone(), sealer, orchestrator, chain);
    pipeline.attach_sink(JsonlAuditSink::open(&audit_path).context("opening audit sink")?);
    let publications_path = args.data_dir.join("publications.json");
    if publications_path.exists() {
        pipeline
            .load_publications(&publications_path)
            .context("loading retained publications")?;
    }
    let sequences_path = args.data_dir.join("sequences.json");
    if sequences_path.exists() {
        pipeline
            .load_sequence_windows(&sequences_path)
            .context("loading sequence windows")?;
    }

    let devices_path = args.data_dir.join("devices.json");
    if devices_path.exists() {
        let text = std::fs::read_to_string(&devices_path).context("reading device registry")?;
        let devices: std::collections::BTreeMap<String, String> =
            serde_json::from_str(&text).context("parsing device registry")?;
        for (sensor, signer) in &devices {
            pipeline.provision_device(sensor, signer);
        }
        info!("{}: provisioned {} sensors", node_id, devices.len());
    } else {
        warn!(
            "{}: no device registry at {}; every reading will be rejected until sensors are provisioned",
            node_id,
            devices_path.display()
        );
    }

    info!("{}: entering estimation loop", node_id);
    let mut last_snapshot: Option<SignalSnapshot> = None;
    loop {
        let now = Utc::now();
        match pipeline.recompute(now) {
            Ok(report) => {
                pipeline
                    .store()
                    .save_latest(args.data_dir.join("cells.json"))
                    .context("persisting cell states")?;
                pipeline
                    .save_publications(&publications_path)
                    .context("persisting publications")?;
                pipeline
                    .save_sequence_windows(&sequences_path)
                    .context("persisting sequence windows")?;
                last_snapshot = Some(report.snapshot);
            }
            Err(PipelineError::NotOwner) => {
                warn!("{}: lost ownership, standing down", node_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let sleep_secs = match last_snapshot
            .as_ref()
            .map(|s| decide(s, &config.scheduler))
        {
            Some(Decision::Now { .. }) | None => 0,
            Some(Decision::At { next, .. }) => (next - Utc::now()).num_seconds().max(0) as u64,
        };
        time::sleep(time::Duration::from_secs(sleep_secs)).await;
    }
}
