// ORDINARY KRIGING
// Stage 2 of regression kriging: interpolate the residual field
//
// Solves the ordinary kriging system with a Lagrange multiplier so the
// weights sum to one (unbiasedness). The system matrix depends only on
// anchor geometry and the fitted variogram; each target cell assembles
// and solves the full (n+1)-system against its own right-hand side
// through the solver seam.

use ndarray::{Array1, Array2};

use crate::solver::{LinearSolver, SolveError};
use crate::variogram::ExponentialVariogram;

/// Kriged value + kriging variance at one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrigedEstimate {
    pub value: f64,
    pub variance: f64,
}

/// Kriging context for one render: anchor locations (meters), residuals,
/// and the fitted variogram.
pub struct ResidualKriging<'a> {
    locations: &'a [(f64, f64)],
    residuals: &'a [f64],
    variogram: ExponentialVariogram,
}

impl<'a> ResidualKriging<'a> {
    pub fn new(
        locations: &'a [(f64, f64)],
        residuals: &'a [f64],
        variogram: ExponentialVariogram,
    ) -> ResidualKriging<'a> {
        debug_assert_eq!(locations.len(), residuals.len());
        ResidualKriging { locations, residuals, variogram }
    }

    fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
        ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
    }

    /// Estimate the residual at a target point.
    pub fn estimate(
        &self,
        target: (f64, f64),
        solver: &dyn LinearSolver,
    ) -> Result<KrigedEstimate, SolveError> {
        let n = self.locations.len();

        // n+1 system: [Γ 1; 1ᵀ 0] [w; μ] = [γ; 1]
        let mut a = Array2::<f64>::zeros((n + 1, n + 1));
        for i in 0..n {
            for j in 0..n {
                a[[i, j]] = self
                    .variogram
                    .gamma(Self::distance(self.locations[i], self.locations[j]));
            }
            a[[i, n]] = 1.0;
            a[[n, i]] = 1.0;
        }

        let mut b = Array1::<f64>::zeros(n + 1);
        for i in 0..n {
            b[i] = self.variogram.gamma(Self::distance(self.locations[i], target));
        }
        b[n] = 1.0;

        let solution = solver.solve(&a, &b)?;

        let mut value = 0.0;
        let mut variance = solution[n]; // Lagrange multiplier
        for i in 0..n {
            value += solution[i] * self.residuals[i];
            variance += solution[i] * b[i];
        }
        // Numerical round-off can push the variance a hair negative.
        Ok(KrigedEstimate { value, variance: variance.max(0.0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::DenseSolver;

    fn variogram() -> ExponentialVariogram {
        ExponentialVariogram { nugget: 1e-6, sill: 0.01, range_m: 100.0 }
    }

    #[test]
    fn test_estimate_at_anchor_recovers_residual() {
        let locations = vec![(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)];
        let residuals = vec![0.05, -0.02, 0.01];
        let k = ResidualKriging::new(&locations, &residuals, variogram());
        let est = k.estimate((0.0, 0.0), &DenseSolver).unwrap();
        // Tiny nugget: the anchor's own residual dominates.
        assert!((est.value - 0.05).abs() < 1e-3);
        assert!(est.variance < 1e-3);
    }

    #[test]
    fn test_weights_sum_to_one_via_constant_field() {
        // A constant residual field must krige to that constant anywhere.
        let locations = vec![(0.0, 0.0), (50.0, 0.0), (0.0, 50.0), (50.0, 50.0)];
        let residuals = vec![0.03, 0.03, 0.03, 0.03];
        let k = ResidualKriging::new(&locations, &residuals, variogram());
        let est = k.estimate((25.0, 25.0), &DenseSolver).unwrap();
        assert!((est.value - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_variance_grows_with_distance() {
        let locations = vec![(0.0, 0.0), (50.0, 0.0), (0.0, 50.0)];
        let residuals = vec![0.05, -0.02, 0.01];
        let k = ResidualKriging::new(&locations, &residuals, variogram());
        let near = k.estimate((10.0, 10.0), &DenseSolver).unwrap();
        let far = k.estimate((400.0, 400.0), &DenseSolver).unwrap();
        assert!(far.variance > near.variance);
    }

    #[test]
    fn test_duplicate_anchors_surface_as_singular() {
        let locations = vec![(0.0, 0.0), (0.0, 0.0)];
        let residuals = vec![0.05, 0.05];
        let k = ResidualKriging::new(&locations, &residuals, variogram());
        assert!(k.estimate((10.0, 10.0), &DenseSolver).is_err());
    }
}
