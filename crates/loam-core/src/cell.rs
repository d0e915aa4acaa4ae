// CELL STATE
// The filter's belief about one grid cell, versioned append-only
//
// SAFETY INVARIANTS:
// 1. Versions are never overwritten; every update appends version + 1
// 2. Variance only shrinks when a genuine observation is incorporated,
//    and inflates with elapsed time otherwise
// 3. Variance is always strictly positive (clamped at a floor)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::CellIndex;
use crate::reading::ReadingId;
use crate::soil::{DepthLayer, SoilTexture, TexturePrior};

/// Moisture estimate for one depth layer of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerEstimate {
    pub layer: DepthLayer,

    /// Volumetric water content estimate
    pub vwc: f64,

    /// Estimate variance. Strictly positive.
    pub variance: f64,
}

/// One version of the filter's belief about a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub cell: CellIndex,

    /// Version counter, starts at 1 for the prior-derived state
    pub version: u64,

    /// Filter epoch that produced this version
    pub epoch: u64,

    /// Per-layer moisture estimates
    pub layers: Vec<LayerEstimate>,

    /// Learned texture parameters
    pub texture: SoilTexture,

    /// Learned saturated conductivity, mm/hour
    pub ksat_mm_hr: f64,

    /// When this version was written
    pub updated_at: DateTime<Utc>,

    /// Timestamp of the newest observation ever incorporated; None for
    /// prior-only cells. Drives time-based uncertainty inflation.
    pub last_observed_at: Option<DateTime<Utc>>,

    /// Readings that contributed to this version
    pub contributing: Vec<ReadingId>,
}

impl CellState {
    /// Initial state for a never-observed cell, from the regional prior.
    pub fn from_prior(cell: CellIndex, prior: &TexturePrior, now: DateTime<Utc>) -> CellState {
        CellState {
            cell,
            version: 1,
            epoch: 0,
            layers: DepthLayer::all()
                .into_iter()
                .map(|layer| LayerEstimate { layer, vwc: prior.vwc, variance: prior.variance })
                .collect(),
            texture: prior.texture,
            ksat_mm_hr: prior.ksat_mm_hr,
            updated_at: now,
            last_observed_at: None,
            contributing: Vec::new(),
        }
    }

    pub fn layer(&self, layer: DepthLayer) -> Option<&LayerEstimate> {
        self.layers.iter().find(|l| l.layer == layer)
    }

    pub fn layer_mut(&mut self, layer: DepthLayer) -> Option<&mut LayerEstimate> {
        self.layers.iter_mut().find(|l| l.layer == layer)
    }

    /// Depth-averaged moisture, the value the interpolator publishes.
    pub fn mean_vwc(&self) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        self.layers.iter().map(|l| l.vwc).sum::<f64>() / self.layers.len() as f64
    }

    /// Depth-averaged variance, folded into published confidence.
    pub fn mean_variance(&self) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        self.layers.iter().map(|l| l.variance).sum::<f64>() / self.layers.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_state_covers_all_layers() {
        let prior = TexturePrior::default();
        let state = CellState::from_prior(CellIndex { row: 0, col: 0 }, &prior, Utc::now());
        assert_eq!(state.layers.len(), 3);
        assert_eq!(state.version, 1);
        assert!(state.last_observed_at.is_none());
        for l in &state.layers {
            assert!(l.variance > 0.0);
        }
    }

    #[test]
    fn test_mean_vwc_averages_layers() {
        let prior = TexturePrior::default();
        let mut state = CellState::from_prior(CellIndex { row: 0, col: 0 }, &prior, Utc::now());
        state.layer_mut(DepthLayer::Shallow).unwrap().vwc = 0.10;
        state.layer_mut(DepthLayer::Root).unwrap().vwc = 0.20;
        state.layer_mut(DepthLayer::Deep).unwrap().vwc = 0.30;
        assert!((state.mean_vwc() - 0.20).abs() < 1e-12);
    }
}
