// VARIOGRAM
// Spatial autocorrelation of the residual field, fitted per render
//
// Method-of-moments empirical semivariogram, exponential model fitted by
// a deterministic grid search over the range parameter. No RNG anywhere:
// the same residuals always produce the same variogram, which keeps
// publications reproducible for review.

use log::debug;

/// Exponential variogram model: γ(h) = nugget + sill · (1 − e^(−h/range)).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialVariogram {
    pub nugget: f64,
    pub sill: f64,
    pub range_m: f64,
}

impl ExponentialVariogram {
    pub fn gamma(&self, distance_m: f64) -> f64 {
        if distance_m <= 0.0 {
            return 0.0;
        }
        self.nugget + self.sill * (1.0 - (-distance_m / self.range_m).exp())
    }

    /// Fit from observation pairs `(distance_m, value_a, value_b)`.
    ///
    /// Falls back to a flat default when there are too few pairs or the
    /// residual field is constant; kriging then degrades to smooth
    /// averaging rather than failing the render.
    pub fn fit(points: &[(f64, f64)], bins: usize) -> ExponentialVariogram {
        // points: (distance, squared difference / 2) per pair
        if points.is_empty() {
            return ExponentialVariogram { nugget: 1e-6, sill: 1e-4, range_m: 100.0 };
        }
        let max_dist = points.iter().map(|(d, _)| *d).fold(0.0_f64, f64::max);
        if max_dist <= 0.0 {
            return ExponentialVariogram { nugget: 1e-6, sill: 1e-4, range_m: 100.0 };
        }

        // Empirical semivariance per distance bin.
        let bins = bins.max(2);
        let width = max_dist / bins as f64;
        let mut sums = vec![0.0_f64; bins];
        let mut counts = vec![0usize; bins];
        for (d, semi) in points {
            let idx = ((d / width) as usize).min(bins - 1);
            sums[idx] += semi;
            counts[idx] += 1;
        }
        let empirical: Vec<(f64, f64)> = (0..bins)
            .filter(|&i| counts[i] > 0)
            .map(|i| ((i as f64 + 0.5) * width, sums[i] / counts[i] as f64))
            .collect();
        if empirical.len() < 2 {
            return ExponentialVariogram { nugget: 1e-6, sill: 1e-4, range_m: max_dist.max(1.0) };
        }

        let nugget = (empirical[0].1 * 0.5).max(1e-9);
        let plateau = empirical.iter().map(|(_, g)| *g).fold(0.0_f64, f64::max);
        let sill = (plateau - nugget).max(1e-9);

        // Deterministic grid search over the range parameter.
        let mut best = ExponentialVariogram { nugget, sill, range_m: max_dist / 3.0 };
        let mut best_sse = f64::INFINITY;
        for step in 1..=30 {
            let candidate = ExponentialVariogram {
                nugget,
                sill,
                range_m: max_dist * step as f64 / 30.0,
            };
            let sse: f64 = empirical
                .iter()
                .map(|(h, g)| (candidate.gamma(*h) - g).powi(2))
                .sum();
            if sse < best_sse {
                best_sse = sse;
                best = candidate;
            }
        }
        debug!(
            "variogram fit: nugget {:.2e}, sill {:.2e}, range {:.1} m (sse {:.2e})",
            best.nugget, best.sill, best.range_m, best_sse
        );
        best
    }

    /// Build the pair list for `fit` from located residuals.
    pub fn pairs(locations: &[(f64, f64)], values: &[f64]) -> Vec<(f64, f64)> {
        let mut out = Vec::new();
        for i in 0..locations.len() {
            for j in (i + 1)..locations.len() {
                let dx = locations[i].0 - locations[j].0;
                let dy = locations[i].1 - locations[j].1;
                let d = (dx * dx + dy * dy).sqrt();
                let semi = 0.5 * (values[i] - values[j]).powi(2);
                out.push((d, semi));
            }
        }
        out
    }
}
