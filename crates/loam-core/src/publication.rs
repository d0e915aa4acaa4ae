// GRID PUBLICATION
// The dense, immutable output of one pipeline epoch
//
// SAFETY INVARIANTS:
// 1. A publication is immutable once produced; the next epoch appends a new one
// 2. Hard-constrained cells carry the exact filter estimate (anchor contract)
// 3. The publication hash covers the canonical bytes of the whole snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::CellIndex;

/// How a published cell value was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellProvenance {
    /// A sensor sits inside this cell; the value is the filter estimate, exact
    HardConstrained,
    /// Value produced by trend + kriged residual (or the degraded fallback)
    Interpolated,
}

impl CellProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellProvenance::HardConstrained => "HARD_CONSTRAINED",
            CellProvenance::Interpolated => "INTERPOLATED",
        }
    }
}

/// One cell of the published surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedCell {
    pub cell: CellIndex,

    /// Published volumetric moisture
    pub vwc: f64,

    /// Confidence in (0, 1]; 1.0 is a freshly observed anchor cell
    pub confidence: f64,

    pub provenance: CellProvenance,
}

/// A versioned snapshot of the dense moisture surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPublication {
    /// Pipeline epoch that produced this snapshot
    pub epoch: u64,

    pub published_at: DateTime<Utc>,

    /// Row-major published cells, one per grid cell
    pub cells: Vec<PublishedCell>,

    /// True when the interpolator fell back to weighted-distance
    /// interpolation (fewer than the minimum anchors, or an ill-posed
    /// kriging system)
    pub degraded: bool,
}

impl GridPublication {
    pub fn cell(&self, index: CellIndex) -> Option<&PublishedCell> {
        self.cells.iter().find(|c| c.cell == index)
    }

    pub fn anchor_cells(&self) -> impl Iterator<Item = &PublishedCell> {
        self.cells.iter().filter(|c| c.provenance == CellProvenance::HardConstrained)
    }
}
