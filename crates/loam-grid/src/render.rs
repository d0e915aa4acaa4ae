// GRID RENDER
// Produces one GridPublication per pipeline epoch
//
// SAFETY INVARIANTS:
// 1. Anchor contract: a cell holding an active sensor is published with
//    the exact filter estimate, overwritten post-hoc after kriging
// 2. Fewer than the configured minimum anchors (or an ill-posed kriging
//    system) degrades to inverse-distance weighting and flags the
//    publication, never fails the publish
// 3. Published confidence folds in both kriging and filter uncertainty

use chrono::{DateTime, Utc};
use log::{debug, warn};
use thiserror::Error;

use loam_core::{
    CellProvenance, CellState, CovariateSample, GridGeometry, GridPublication,
    InterpolatorConfig, PublishedCell,
};

use crate::kriging::ResidualKriging;
use crate::solver::{DenseSolver, LinearSolver};
use crate::trend::{CovariateField, TrendModel};
use crate::variogram::ExponentialVariogram;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("nothing to render: no cell state exists and no prior is available")]
    NoState,
}

struct Anchor {
    location: (f64, f64),
    vwc: f64,
    filter_variance: f64,
    cell: loam_core::CellIndex,
}

/// Renders the dense surface from the filter's sparse state.
pub struct Interpolator {
    geometry: GridGeometry,
    config: InterpolatorConfig,
    solver: Box<dyn LinearSolver>,
    covariate_half_life_hours: f64,
}

impl Interpolator {
    pub fn new(
        geometry: GridGeometry,
        config: InterpolatorConfig,
        covariate_half_life_hours: f64,
    ) -> Interpolator {
        Interpolator {
            geometry,
            config,
            solver: Box::new(DenseSolver),
            covariate_half_life_hours,
        }
    }

    /// Swap the numerical backend (CPU reference is the default).
    pub fn with_solver(mut self, solver: Box<dyn LinearSolver>) -> Interpolator {
        self.solver = solver;
        self
    }

    fn confidence(total_variance: f64) -> f64 {
        1.0 / (1.0 + total_variance.max(0.0) * 100.0)
    }

    /// Render one epoch snapshot into a publication.
    ///
    /// `states` is the epoch-consistent snapshot taken after the filter
    /// barrier. Anchors are the cells with at least one incorporated
    /// observation; prior-only cells contribute no anchor.
    pub fn render(
        &self,
        epoch: u64,
        now: DateTime<Utc>,
        states: &[CellState],
        covariates: &[CovariateSample],
    ) -> Result<GridPublication, RenderError> {
        if states.is_empty() {
            return Err(RenderError::NoState);
        }

        let anchors: Vec<Anchor> = states
            .iter()
            .filter(|s| s.last_observed_at.is_some())
            .map(|s| Anchor {
                location: self.geometry.cell_center_m(s.cell),
                vwc: s.mean_vwc(),
                filter_variance: s.mean_variance(),
                cell: s.cell,
            })
            .collect();

        let field = CovariateField::build(&self.geometry, covariates, now, self.covariate_half_life_hours);

        let (cells, degraded) = if anchors.len() < self.config.min_anchors_for_kriging {
            warn!(
                "render epoch {}: {} anchors < minimum {}, degrading to IDW",
                epoch,
                anchors.len(),
                self.config.min_anchors_for_kriging
            );
            (self.render_idw(&anchors, states), true)
        } else {
            match self.render_kriged(&anchors, &field) {
                Some(cells) => (cells, false),
                None => {
                    warn!("render epoch {}: kriging ill-posed, degrading to IDW", epoch);
                    (self.render_idw(&anchors, states), true)
                }
            }
        };

        let mut publication = GridPublication { epoch, published_at: now, cells, degraded };
        self.overwrite_anchors(&mut publication, &anchors);
        Ok(publication)
    }

    /// Full regression-kriging path. None when any solve is degenerate.
    fn render_kriged(&self, anchors: &[Anchor], field: &CovariateField) -> Option<Vec<PublishedCell>> {
        let trend_anchors: Vec<_> = anchors.iter().map(|a| (a.cell, a.vwc)).collect();
        let trend = TrendModel::fit(field, &trend_anchors, self.solver.as_ref());

        let locations: Vec<(f64, f64)> = anchors.iter().map(|a| a.location).collect();
        let residuals: Vec<f64> = anchors
            .iter()
            .map(|a| a.vwc - trend.predict(field, a.cell))
            .collect();

        let pairs = ExponentialVariogram::pairs(&locations, &residuals);
        let variogram = ExponentialVariogram::fit(&pairs, self.config.variogram_bins);
        let kriging = ResidualKriging::new(&locations, &residuals, variogram);

        let mean_filter_variance =
            anchors.iter().map(|a| a.filter_variance).sum::<f64>() / anchors.len() as f64;

        let mut cells = Vec::with_capacity(self.geometry.cell_count());
        for cell in self.geometry.iter_cells() {
            let target = self.geometry.cell_center_m(cell);
            let est = match kriging.estimate(target, self.solver.as_ref()) {
                Ok(est) => est,
                Err(e) => {
                    debug!("kriging solve failed at ({}, {}): {e}", cell.row, cell.col);
                    return None;
                }
            };
            let vwc = (trend.predict(field, cell) + est.value).clamp(0.0, 1.0);
            cells.push(PublishedCell {
                cell,
                vwc,
                confidence: Self::confidence(est.variance + mean_filter_variance),
                provenance: CellProvenance::Interpolated,
            });
        }
        Some(cells)
    }

    /// Degraded fallback: inverse-distance weighting from the anchors,
    /// or the state mean when no anchor exists at all.
    fn render_idw(&self, anchors: &[Anchor], states: &[CellState]) -> Vec<PublishedCell> {
        let fallback_vwc = if anchors.is_empty() {
            states.iter().map(|s| s.mean_vwc()).sum::<f64>() / states.len() as f64
        } else {
            0.0 // unused
        };
        let fallback_variance =
            states.iter().map(|s| s.mean_variance()).sum::<f64>() / states.len() as f64;

        let mut cells = Vec::with_capacity(self.geometry.cell_count());
        for cell in self.geometry.iter_cells() {
            let (cx, cy) = self.geometry.cell_center_m(cell);
            let (vwc, variance) = if anchors.is_empty() {
                (fallback_vwc, fallback_variance)
            } else {
                let mut num = 0.0;
                let mut den = 0.0;
                let mut exact = None;
                for a in anchors {
                    let d2 = (cx - a.location.0).powi(2) + (cy - a.location.1).powi(2);
                    if d2 < 1e-9 {
                        exact = Some(a);
                        break;
                    }
                    let w = 1.0 / d2.powf(self.config.idw_power / 2.0);
                    num += w * a.vwc;
                    den += w;
                }
                match exact {
                    Some(a) => (a.vwc, a.filter_variance),
                    // IDW carries no model variance; surface the filter's
                    // own uncertainty plus a degradation penalty.
                    None => (num / den, fallback_variance * 2.0),
                }
            };
            cells.push(PublishedCell {
                cell,
                vwc: vwc.clamp(0.0, 1.0),
                confidence: Self::confidence(variance),
                provenance: CellProvenance::Interpolated,
            });
        }
        cells
    }

    /// The anchor contract: overwrite sensor-bearing cells with the
    /// exact filter estimate, post-hoc, even if kriging smoothed past it.
    fn overwrite_anchors(&self, publication: &mut GridPublication, anchors: &[Anchor]) {
        for anchor in anchors {
            if let Some(cell) = publication.cells.iter_mut().find(|c| c.cell == anchor.cell) {
                cell.vwc = anchor.vwc;
                cell.confidence = Self::confidence(anchor.filter_variance);
                cell.provenance = CellProvenance::HardConstrained;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loam_core::{CellIndex, GeoPosition, TexturePrior};

    fn geometry() -> GridGeometry {
        GridGeometry::new(GeoPosition { lat_deg: 36.0, lon_deg: -120.0 }, 25.0, 12, 12).unwrap()
    }

    fn interpolator() -> Interpolator {
        Interpolator::new(geometry(), InterpolatorConfig::default(), 24.0)
    }

    fn observed_state(row: u32, col: u32, vwc: f64, now: DateTime<Utc>) -> CellState {
        let mut s = CellState::from_prior(CellIndex { row, col }, &TexturePrior::default(), now);
        for layer in &mut s.layers {
            layer.vwc = vwc;
            layer.variance = 0.0005;
        }
        s.version = 2;
        s.epoch = 1;
        s.last_observed_at = Some(now);
        s
    }

    fn prior_state(row: u32, col: u32, now: DateTime<Utc>) -> CellState {
        CellState::from_prior(CellIndex { row, col }, &TexturePrior::default(), now)
    }

    #[test]
    fn test_anchor_cells_carry_exact_estimates() {
        let now = Utc::now();
        let values = [0.30, 0.32, 0.28, 0.31, 0.29];
        let coords = [(1, 1), (1, 9), (9, 1), (9, 9), (5, 5)];
        let states: Vec<CellState> = coords
            .iter()
            .zip(values.iter())
            .map(|(&(r, c), &v)| observed_state(r, c, v, now))
            .collect();

        let pub_ = interpolator().render(1, now, &states, &[]).unwrap();
        assert!(!pub_.degraded);
        for (&(r, c), &v) in coords.iter().zip(values.iter()) {
            let cell = pub_.cell(CellIndex { row: r, col: c }).unwrap();
            assert_eq!(cell.provenance, CellProvenance::HardConstrained);
            assert!((cell.vwc - v).abs() < 1e-12, "anchor must be exact");
        }
        assert_eq!(pub_.anchor_cells().count(), 5);
    }

    #[test]
    fn test_interpolated_cells_stay_in_anchor_envelope() {
        let now = Utc::now();
        let states = vec![
            observed_state(1, 1, 0.30, now),
            observed_state(1, 10, 0.32, now),
            observed_state(10, 1, 0.28, now),
            observed_state(10, 10, 0.31, now),
            observed_state(5, 5, 0.29, now),
        ];
        let pub_ = interpolator().render(1, now, &states, &[]).unwrap();
        for cell in &pub_.cells {
            assert!(cell.vwc >= 0.20 && cell.vwc <= 0.40, "cell ({},{}) = {}", cell.cell.row, cell.cell.col, cell.vwc);
            assert!(cell.confidence > 0.0 && cell.confidence <= 1.0);
        }
    }

    #[test]
    fn test_too_few_anchors_degrades_not_fails() {
        let now = Utc::now();
        let states = vec![
            observed_state(2, 2, 0.35, now),
            observed_state(8, 8, 0.25, now),
        ];
        let pub_ = interpolator().render(1, now, &states, &[]).unwrap();
        assert!(pub_.degraded);
        // The anchor contract holds even in degraded mode.
        let a = pub_.cell(CellIndex { row: 2, col: 2 }).unwrap();
        assert_eq!(a.provenance, CellProvenance::HardConstrained);
        assert!((a.vwc - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_prior_only_cells_are_not_anchors() {
        let now = Utc::now();
        let states = vec![
            prior_state(0, 0, now),
            observed_state(3, 3, 0.33, now),
            observed_state(6, 6, 0.27, now),
        ];
        let pub_ = interpolator().render(1, now, &states, &[]).unwrap();
        // Only 2 observed anchors → degraded; prior cell is interpolated.
        assert!(pub_.degraded);
        assert_eq!(pub_.anchor_cells().count(), 2);
        let prior_cell = pub_.cell(CellIndex { row: 0, col: 0 }).unwrap();
        assert_eq!(prior_cell.provenance, CellProvenance::Interpolated);
    }

    #[test]
    fn test_anchor_confidence_exceeds_distant_interpolation() {
        let now = Utc::now();
        let states = vec![
            observed_state(1, 1, 0.30, now),
            observed_state(1, 3, 0.31, now),
            observed_state(3, 1, 0.29, now),
            observed_state(3, 3, 0.30, now),
        ];
        let pub_ = interpolator().render(1, now, &states, &[]).unwrap();
        let anchor = pub_.cell(CellIndex { row: 1, col: 1 }).unwrap();
        let far = pub_.cell(CellIndex { row: 11, col: 11 }).unwrap();
        assert!(anchor.confidence > far.confidence);
    }

    #[test]
    fn test_empty_state_is_an_error() {
        let now = Utc::now();
        assert!(interpolator().render(1, now, &[], &[]).is_err());
    }
}
