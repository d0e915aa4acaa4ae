// COVARIATE ADAPTER
// Normalizes provider-specific external signals onto the grid's frame
//
// This is the normalization boundary: nothing downstream ever sees
// provider units. "No usable sample this cycle" is None, not an error —
// the filter must tolerate missing covariates.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use loam_core::{CovariateKind, CovariateSample, GeoPosition};

/// Raw external sample as delivered by a provider feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExternalSample {
    pub kind: RawSignalKind,

    /// Value in the provider's native units/scale
    pub value: f64,

    pub position: GeoPosition,

    /// Fraction of the footprint obscured by cloud (optical products)
    pub cloud_fraction: f64,

    /// When the instrument observed the ground
    pub observed_at: DateTime<Utc>,

    /// When the sample reached this node
    pub available_at: DateTime<Utc>,
}

/// Provider-native signal kinds the adapter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawSignalKind {
    /// Satellite NDVI scaled to integers in [-10000, 10000]
    SatNdviScaled,
    /// Satellite NDWI scaled to integers in [-10000, 10000]
    SatNdwiScaled,
    /// Weather-station air temperature, Fahrenheit
    AirTempFahrenheit,
    /// Forecast reference ET, inches/day
    ForecastEtInchesDay,
}

/// Stateless normalizer. Holds only the cloud-mask threshold.
pub struct CovariateAdapter {
    /// Optical samples with more obscuration than this are discarded
    pub max_cloud_fraction: f64,
}

impl Default for CovariateAdapter {
    fn default() -> Self {
        CovariateAdapter { max_cloud_fraction: 0.40 }
    }
}

impl CovariateAdapter {
    /// Normalize one raw sample, or discard it (None) if unusable.
    pub fn normalize(&self, raw: &RawExternalSample) -> Option<CovariateSample> {
        let (kind, value, optical) = match raw.kind {
            RawSignalKind::SatNdviScaled => (CovariateKind::Ndvi, raw.value / 10_000.0, true),
            RawSignalKind::SatNdwiScaled => (CovariateKind::Ndwi, raw.value / 10_000.0, true),
            RawSignalKind::AirTempFahrenheit => {
                (CovariateKind::AirTempC, (raw.value - 32.0) * 5.0 / 9.0, false)
            }
            RawSignalKind::ForecastEtInchesDay => {
                (CovariateKind::ForecastEtMmDay, raw.value * 25.4, false)
            }
        };

        if !value.is_finite() {
            debug!("discarding non-finite covariate sample");
            return None;
        }
        if optical && raw.cloud_fraction > self.max_cloud_fraction {
            debug!(
                "discarding cloud-obscured {} sample ({:.0}% obscured)",
                kind.as_str(),
                raw.cloud_fraction * 100.0
            );
            return None;
        }
        // Index products are bounded by construction; out-of-range means
        // a corrupt feed record.
        if optical && !(-1.0..=1.0).contains(&value) {
            debug!("discarding out-of-range {} sample {}", kind.as_str(), value);
            return None;
        }

        Some(CovariateSample {
            kind,
            position: raw.position,
            value,
            observed_at: raw.observed_at,
            // Never pretend data was available earlier than it was.
            available_at: raw.available_at.max(raw.observed_at),
            obscured_fraction: if optical { raw.cloud_fraction } else { 0.0 },
        })
    }

    /// Normalize a batch, dropping unusable samples.
    pub fn normalize_batch(&self, raws: &[RawExternalSample]) -> Vec<CovariateSample> {
        raws.iter().filter_map(|r| self.normalize(r)).collect()
    }
}
