// TREND SURFACE
// Regression of moisture against covariate fields across the whole grid
//
// Stage 1 of regression kriging: a least-squares fit of anchor moisture
// on the covariate features, weighted by covariate staleness. Stage 2
// (kriging) works on the residuals of this fit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
use ndarray::{Array1, Array2};

use loam_core::{CellIndex, CovariateKind, CovariateSample, GridGeometry};

use crate::solver::LinearSolver;

/// Per-cell covariate features, built once per render by inverse-distance
/// weighting each kind's samples onto the grid.
pub struct CovariateField {
    kinds: Vec<CovariateKind>,
    values: HashMap<(CovariateKind, CellIndex), f64>,
}

impl CovariateField {
    pub fn build(
        geometry: &GridGeometry,
        samples: &[CovariateSample],
        now: DateTime<Utc>,
        half_life_hours: f64,
    ) -> CovariateField {
        let mut kinds: Vec<CovariateKind> = Vec::new();
        let mut located: HashMap<CovariateKind, Vec<(f64, f64, f64, f64)>> = HashMap::new();
        for s in samples {
            let Ok(cell) = geometry.cell_for(s.position) else {
                continue; // outside the region
            };
            let (x, y) = geometry.cell_center_m(cell);
            let weight = s.staleness_weight(now, half_life_hours);
            if weight <= 1e-6 {
                continue;
            }
            if !kinds.contains(&s.kind) {
                kinds.push(s.kind);
            }
            located.entry(s.kind).or_default().push((x, y, s.value, weight));
        }
        kinds.sort_by_key(|k| k.as_str());

        let mut values = HashMap::new();
        for cell in geometry.iter_cells() {
            let (cx, cy) = geometry.cell_center_m(cell);
            for kind in &kinds {
                let points = &located[kind];
                let mut num = 0.0;
                let mut den = 0.0;
                for (x, y, v, w) in points {
                    let d2 = (cx - x).powi(2) + (cy - y).powi(2);
                    let idw = w / (d2 + 1.0);
                    num += idw * v;
                    den += idw;
                }
                if den > 0.0 {
                    values.insert((*kind, cell), num / den);
                }
            }
        }
        CovariateField { kinds, values }
    }

    pub fn has_covariates(&self) -> bool {
        !self.kinds.is_empty()
    }

    /// Feature vector [1, x₁, x₂, …] for a cell.
    pub fn features(&self, cell: CellIndex) -> Vec<f64> {
        let mut f = Vec::with_capacity(self.kinds.len() + 1);
        f.push(1.0);
        for kind in &self.kinds {
            f.push(self.values.get(&(*kind, cell)).copied().unwrap_or(0.0));
        }
        f
    }
}

/// Fitted trend surface.
pub struct TrendModel {
    beta: Array1<f64>,
}

impl TrendModel {
    /// Ordinary least squares via the normal equations. With no usable
    /// covariates the model collapses to the anchor mean, which is the
    /// correct trend for a featureless field.
    pub fn fit(
        field: &CovariateField,
        anchors: &[(CellIndex, f64)],
        solver: &dyn LinearSolver,
    ) -> TrendModel {
        let n = anchors.len();
        let mean = anchors.iter().map(|(_, v)| *v).sum::<f64>() / n.max(1) as f64;
        if !field.has_covariates() || n == 0 {
            return TrendModel { beta: Array1::from(vec![mean]) };
        }

        let p = field.features(anchors[0].0).len();
        // More parameters than anchors: fall back to the mean rather
        // than fit an underdetermined system.
        if n < p {
            debug!("trend: {} anchors < {} parameters, using mean", n, p);
            return TrendModel { beta: Array1::from(vec![mean]) };
        }

        let mut xtx = Array2::<f64>::zeros((p, p));
        let mut xty = Array1::<f64>::zeros(p);
        for (cell, y) in anchors {
            let f = field.features(*cell);
            for i in 0..p {
                xty[i] += f[i] * y;
                for j in 0..p {
                    xtx[[i, j]] += f[i] * f[j];
                }
            }
        }
        match solver.solve(&xtx, &xty) {
            Ok(beta) => TrendModel { beta },
            Err(e) => {
                debug!("trend: normal equations degenerate ({e}), using mean");
                TrendModel { beta: Array1::from(vec![mean]) }
            }
        }
    }

    pub fn predict(&self, field: &CovariateField, cell: CellIndex) -> f64 {
        if self.beta.len() == 1 {
            return self.beta[0];
        }
        let f = field.features(cell);
        f.iter().zip(self.beta.iter()).map(|(a, b)| a * b).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::DenseSolver;
    use loam_core::GeoPosition;

    fn geometry() -> GridGeometry {
        GridGeometry::new(GeoPosition { lat_deg: 36.0, lon_deg: -120.0 }, 25.0, 10, 10).unwrap()
    }

    #[test]
    fn test_no_covariates_yields_mean_trend() {
        let g = geometry();
        let field = CovariateField::build(&g, &[], Utc::now(), 24.0);
        let anchors = vec![
            (CellIndex { row: 0, col: 0 }, 0.2),
            (CellIndex { row: 5, col: 5 }, 0.4),
        ];
        let model = TrendModel::fit(&field, &anchors, &DenseSolver);
        let p = model.predict(&field, CellIndex { row: 9, col: 9 });
        assert!((p - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_trend_follows_covariate() {
        let g = geometry();
        let now = Utc::now();
        // NDVI rising eastward; moisture rising with NDVI.
        let samples: Vec<CovariateSample> = (0..10)
            .map(|col| CovariateSample {
                kind: CovariateKind::Ndvi,
                position: GeoPosition {
                    lat_deg: 36.001,
                    lon_deg: -120.0 + 0.00028 * col as f64,
                },
                value: 0.1 * col as f64 / 10.0 + 0.3,
                observed_at: now,
                available_at: now,
                obscured_fraction: 0.0,
            })
            .collect();
        let field = CovariateField::build(&g, &samples, now, 24.0);
        assert!(field.has_covariates());

        let anchors: Vec<(CellIndex, f64)> = (0..5)
            .map(|i| {
                let cell = CellIndex { row: 4, col: i * 2 };
                let ndvi = field.features(cell)[1];
                (cell, 0.1 + 0.5 * ndvi)
            })
            .collect();
        let model = TrendModel::fit(&field, &anchors, &DenseSolver);

        let west = model.predict(&field, CellIndex { row: 4, col: 0 });
        let east = model.predict(&field, CellIndex { row: 4, col: 9 });
        assert!(east > west, "trend must follow the eastward NDVI rise");
    }
}
