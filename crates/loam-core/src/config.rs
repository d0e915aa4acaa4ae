// NODE CONFIGURATION
// Serde-deserializable config with the documented operational constants
//
// SAFETY INVARIANTS:
// 1. Every constant named in operations documents lives here, not inline
// 2. Defaults are the documented production values
// 3. Config is immutable after node bootstrap

use serde::{Deserialize, Serialize};

use crate::geometry::{GeoPosition, GridGeometry};
use crate::soil::TexturePrior;

/// Measurement ingest tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Per-sensor sliding window of remembered sequence numbers.
    /// Bounded so bursty fleets (tens of thousands of probes) never
    /// trigger a full-history scan.
    pub dedup_window: usize,

    /// Maximum tolerated clock skew between probe capture time and node
    /// clock, seconds, in either direction
    pub max_clock_skew_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            dedup_window: 256,
            max_clock_skew_secs: 15 * 60,
        }
    }
}

/// Recursive filter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Observation noise variance of the probes
    pub observation_variance: f64,

    /// Process noise added per hour without observation
    pub process_noise_per_hour: f64,

    /// Positive floor for variance; numerical updates never go below it
    pub variance_floor: f64,

    /// Residual magnitude beyond which texture learning engages
    pub texture_learn_threshold: f64,

    /// Bounded per-update texture adjustment step
    pub texture_learn_step: f64,

    /// Covariate staleness half-life, hours
    pub covariate_half_life_hours: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            observation_variance: 0.0004, // probe spec: ±2% VWC, 1-sigma
            process_noise_per_hour: 0.0002,
            variance_floor: 1e-6,
            texture_learn_threshold: 0.05,
            texture_learn_step: 0.02,
            covariate_half_life_hours: 24.0,
        }
    }
}

/// Spatial interpolator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpolatorConfig {
    /// Minimum anchors for full regression kriging; below this the
    /// interpolator falls back to inverse-distance weighting and marks
    /// the publication degraded
    pub min_anchors_for_kriging: usize,

    /// Number of distance bins for the empirical variogram
    pub variogram_bins: usize,

    /// IDW power for the degraded fallback
    pub idw_power: f64,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        InterpolatorConfig {
            min_anchors_for_kriging: 3,
            variogram_bins: 12,
            idw_power: 2.0,
        }
    }
}

/// Volatility scheduler weights and tier intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Weight of the short-window trend slope
    pub weight_slope_short: f64,

    /// Weight of the medium-window trend slope
    pub weight_slope_medium: f64,

    /// Weight of the long-window trend slope
    pub weight_slope_long: f64,

    /// Weight of spatial variance across recently updated cells
    pub weight_spatial_variance: f64,

    /// Weight of forecast evapotranspiration
    pub weight_forecast_et: f64,

    /// Additive score when irrigation is actively running
    pub irrigation_active_boost: f64,

    /// Tier intervals, seconds: burst, active, watchful, routine, dormant
    pub tier_intervals_secs: [u64; 5],

    /// Score boundaries between tiers (descending cadence), length 4
    pub tier_boundaries: [f64; 4],
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            weight_slope_short: 3.0,
            weight_slope_medium: 2.0,
            weight_slope_long: 1.0,
            weight_spatial_variance: 2.0,
            weight_forecast_et: 0.5,
            irrigation_active_boost: 1.0,
            // sub-minute during irrigation/anomaly, up to 6 hours dormant
            tier_intervals_secs: [30, 300, 1800, 7200, 21600],
            tier_boundaries: [2.0, 1.0, 0.5, 0.2],
        }
    }
}

/// Failover orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Heartbeat period, seconds
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed heartbeats before the mirror claims ownership.
    /// Documented operational default: 3.
    pub missed_heartbeat_threshold: u32,

    /// Bound on one ownership-claim write, milliseconds
    pub claim_timeout_ms: u64,

    /// Retries of a failed claim write before the condition is fatal
    pub claim_retry_budget: u32,

    /// Window to recover the primary before warming the cold spare, seconds
    pub primary_recovery_window_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            heartbeat_interval_secs: 5,
            missed_heartbeat_threshold: 3,
            claim_timeout_ms: 2_000,
            claim_retry_budget: 5,
            primary_recovery_window_secs: 600,
        }
    }
}

/// Top-level node configuration, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's stable identifier
    pub node_id: String,

    pub grid: GridGeometry,

    pub prior: TexturePrior,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub interpolator: InterpolatorConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    /// How many recent publications to keep durable
    #[serde(default = "default_publication_retention")]
    pub publication_retention: usize,
}

fn default_publication_retention() -> usize {
    32
}

impl NodeConfig {
    /// A small test/demo configuration on a 20x20 grid.
    pub fn for_testing(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            grid: GridGeometry::new(
                GeoPosition { lat_deg: 36.0, lon_deg: -120.0 },
                25.0,
                20,
                20,
            )
            .expect("static test geometry is valid"),
            prior: TexturePrior::default(),
            ingest: IngestConfig::default(),
            filter: FilterConfig::default(),
            interpolator: InterpolatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            failover: FailoverConfig::default(),
            publication_retention: default_publication_retention(),
        }
    }
}
