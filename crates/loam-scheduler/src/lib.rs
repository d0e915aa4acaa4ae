// VOLATILITY SCHEDULER
// Decides when the filter/interpolator pipeline re-runs
//
// SAFETY INVARIANTS:
// 1. decide() is a pure function of the signal snapshot and config — no
//    hidden state, no clock reads, no randomness
// 2. The snapshot that drove a decision is recorded alongside it, so a
//    regulator can be shown exactly why a recompute did or did not happen
// 3. Any hard-threshold signal forces an immediate out-of-turn recompute

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use loam_core::SchedulerConfig;

/// Immutable snapshot of the volatility signals at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub taken_at: DateTime<Utc>,

    /// Moisture trend slope over the short window, |VWC|/hour
    pub slope_short: f64,

    /// Slope over the medium window
    pub slope_medium: f64,

    /// Slope over the long window
    pub slope_long: f64,

    /// Variance of moisture across recently updated cells
    pub spatial_variance: f64,

    /// An irrigation actuation is currently running
    pub irrigation_active: bool,

    /// Forecast reference evapotranspiration, mm/day
    pub forecast_et_mm_day: f64,

    /// A sensor raised an anomaly flag (hard threshold)
    pub anomaly_flagged: bool,
}

/// Named cadence tiers, fastest to slowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CadenceTier {
    /// Sub-minute: active irrigation or detected anomaly
    Burst,
    Active,
    Watchful,
    Routine,
    /// Many hours: dormancy
    Dormant,
}

impl CadenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CadenceTier::Burst => "BURST",
            CadenceTier::Active => "ACTIVE",
            CadenceTier::Watchful => "WATCHFUL",
            CadenceTier::Routine => "ROUTINE",
            CadenceTier::Dormant => "DORMANT",
        }
    }

    pub fn interval_secs(&self, config: &SchedulerConfig) -> u64 {
        let idx = match self {
            CadenceTier::Burst => 0,
            CadenceTier::Active => 1,
            CadenceTier::Watchful => 2,
            CadenceTier::Routine => 3,
            CadenceTier::Dormant => 4,
        };
        config.tier_intervals_secs[idx]
    }
}

/// The scheduler's verdict, carrying its own evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Recompute immediately, out of turn
    Now { snapshot: SignalSnapshot, score: f64 },

    /// Recompute at the given time under the given tier
    At {
        next: DateTime<Utc>,
        tier: CadenceTier,
        snapshot: SignalSnapshot,
        score: f64,
    },
}

impl Decision {
    pub fn tier(&self) -> Option<CadenceTier> {
        match self {
            Decision::Now { .. } => None,
            Decision::At { tier, .. } => Some(*tier),
        }
    }
}

/// Weighted volatility score over the snapshot.
pub fn score(snapshot: &SignalSnapshot, config: &SchedulerConfig) -> f64 {
    let mut s = config.weight_slope_short * snapshot.slope_short.abs()
        + config.weight_slope_medium * snapshot.slope_medium.abs()
        + config.weight_slope_long * snapshot.slope_long.abs()
        + config.weight_spatial_variance * snapshot.spatial_variance
        + config.weight_forecast_et * snapshot.forecast_et_mm_day / 10.0;
    if snapshot.irrigation_active {
        s += config.irrigation_active_boost;
    }
    s
}

/// Map a snapshot to a recompute decision.
pub fn decide(snapshot: &SignalSnapshot, config: &SchedulerConfig) -> Decision {
    // Hard threshold: a flagged anomaly preempts every tier.
    if snapshot.anomaly_flagged {
        debug!("scheduler: anomaly flag forces out-of-turn recompute");
        return Decision::Now { snapshot: *snapshot, score: f64::INFINITY };
    }

    let s = score(snapshot, config);
    let [b0, b1, b2, b3] = config.tier_boundaries;
    let tier = if s >= b0 {
        CadenceTier::Burst
    } else if s >= b1 {
        CadenceTier::Active
    } else if s >= b2 {
        CadenceTier::Watchful
    } else if s >= b3 {
        CadenceTier::Routine
    } else {
        CadenceTier::Dormant
    };
    let next = snapshot.taken_at + Duration::seconds(tier.interval_secs(config) as i64);
    debug!("scheduler: score {:.3} → {} (next {})", s, tier.as_str(), next);
    Decision::At { next, tier, snapshot: *snapshot, score: s }
}
