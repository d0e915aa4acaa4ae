// COVARIATE SAMPLE
// Normalized external trend signal on the grid's reference frame

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::GeoPosition;

/// Kinds of external signals the adapter knows how to normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CovariateKind {
    /// Normalized difference vegetation index, [-1, 1]
    Ndvi,
    /// Normalized difference water index, [-1, 1]
    Ndwi,
    /// Air temperature, degrees C
    AirTempC,
    /// Forecast reference evapotranspiration, mm/day
    ForecastEtMmDay,
}

impl CovariateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CovariateKind::Ndvi => "NDVI",
            CovariateKind::Ndwi => "NDWI",
            CovariateKind::AirTempC => "AIR_TEMP_C",
            CovariateKind::ForecastEtMmDay => "FORECAST_ET_MM_DAY",
        }
    }
}

/// A normalized external signal at a location and time.
///
/// `observed_at` is when the instrument saw the ground; `available_at`
/// is when the sample reached this node. Fusion weights staleness by
/// `available_at` — external data must never be treated as having been
/// available earlier than it actually was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateSample {
    pub kind: CovariateKind,

    pub position: GeoPosition,

    /// Normalized value (unit scaling already applied by the adapter)
    pub value: f64,

    /// True observation time at the instrument
    pub observed_at: DateTime<Utc>,

    /// When the sample became available to this node
    pub available_at: DateTime<Utc>,

    /// Quality flag: fraction of the footprint obscured (cloud mask for
    /// optical indices, 0 for weather variables)
    pub obscured_fraction: f64,
}

impl CovariateSample {
    /// Down-weight stale samples: exponential decay with a half-life,
    /// computed from `available_at`, never `observed_at`.
    pub fn staleness_weight(&self, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
        let age_hours = (now - self.available_at).num_seconds().max(0) as f64 / 3600.0;
        if half_life_hours <= 0.0 {
            return 1.0;
        }
        0.5_f64.powf(age_hours / half_life_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(available_at: DateTime<Utc>) -> CovariateSample {
        CovariateSample {
            kind: CovariateKind::Ndvi,
            position: GeoPosition { lat_deg: 36.0, lon_deg: -120.0 },
            value: 0.6,
            observed_at: available_at - Duration::hours(6),
            available_at,
            obscured_fraction: 0.0,
        }
    }

    #[test]
    fn test_fresh_sample_full_weight() {
        let now = Utc::now();
        let s = sample(now);
        assert!((s.staleness_weight(now, 24.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weight_halves_at_half_life() {
        let now = Utc::now();
        let s = sample(now - Duration::hours(24));
        assert!((s.staleness_weight(now, 24.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_weight_uses_available_not_observed() {
        let now = Utc::now();
        // Observed long ago but only just delivered: still full weight.
        let mut s = sample(now);
        s.observed_at = now - Duration::hours(72);
        assert!((s.staleness_weight(now, 24.0) - 1.0).abs() < 1e-9);
    }
}
