// PROCESS AND OBSERVATION MODEL
// The scalar predict/update math for one depth layer of one cell
//
// SAFETY INVARIANTS:
// 1. Variance stays strictly positive (clamped at the configured floor)
// 2. Prediction inflates variance with elapsed time; update shrinks it
//    only when a genuine observation is incorporated
// 3. Moisture stays inside [0, 1]

use loam_core::{FilterConfig, LayerEstimate, SoilTexture};

/// Advance one layer forward in time.
///
/// Drawdown has two terms: evapotranspiration (forecast ET partitioned
/// into the layer, shut off as moisture approaches wilting point) and
/// gravity drainage above field capacity, scaled by the cell's learned
/// saturated conductivity.
pub fn predict_layer(
    estimate: &LayerEstimate,
    texture: &SoilTexture,
    ksat_mm_hr: f64,
    forecast_et_mm_day: f64,
    dt_hours: f64,
    config: &FilterConfig,
) -> LayerEstimate {
    let dt_hours = dt_hours.max(0.0);
    let fc = texture.field_capacity();
    let wp = texture.wilting_point();

    // ET partition: shallow layers dry first. Thickness-based split.
    let layer_et_mm = forecast_et_mm_day / 24.0 * dt_hours;
    let stress = ((estimate.vwc - wp) / (fc - wp).max(1e-6)).clamp(0.0, 1.0);
    let et_fraction = layer_et_mm / (estimate.layer.thickness_m() * 1000.0) * stress;

    // Drainage only above field capacity.
    let excess = (estimate.vwc - fc).max(0.0);
    let drain_fraction = (ksat_mm_hr * dt_hours / (estimate.layer.thickness_m() * 1000.0))
        .min(1.0)
        * excess;

    let vwc = (estimate.vwc - et_fraction - drain_fraction).clamp(0.0, 1.0);
    let variance = (estimate.variance + config.process_noise_per_hour * dt_hours)
        .max(config.variance_floor);

    LayerEstimate { layer: estimate.layer, vwc, variance }
}

/// Fold one observation into a layer. Standard scalar gain: the higher
/// confidence source dominates.
pub fn update_layer(estimate: &LayerEstimate, observed_vwc: f64, config: &FilterConfig) -> LayerEstimate {
    let gain = estimate.variance / (estimate.variance + config.observation_variance);
    let vwc = (estimate.vwc + gain * (observed_vwc - estimate.vwc)).clamp(0.0, 1.0);
    let variance = ((1.0 - gain) * estimate.variance).max(config.variance_floor);
    LayerEstimate { layer: estimate.layer, vwc, variance }
}

/// Nudge texture toward values that would have predicted the observation
/// better. Bounded step, renormalized; texture is adjusted, never replaced.
///
/// A positive residual (soil wetter than predicted) means the soil holds
/// more water than the current texture suggests: shift toward clay and
/// slow the conductivity. Negative residual shifts toward sand.
pub fn learn_texture(
    texture: &SoilTexture,
    ksat_mm_hr: f64,
    residual: f64,
    config: &FilterConfig,
) -> (SoilTexture, f64) {
    if residual.abs() <= config.texture_learn_threshold {
        return (*texture, ksat_mm_hr);
    }
    let step = config.texture_learn_step * residual.signum();
    let adjusted = SoilTexture::normalized(
        texture.sand - step,
        texture.silt,
        texture.clay + step,
    );
    let ksat = (ksat_mm_hr * (1.0 - 0.10 * residual.signum())).clamp(0.5, 200.0);
    (adjusted, ksat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::DepthLayer;

    fn estimate(vwc: f64, variance: f64) -> LayerEstimate {
        LayerEstimate { layer: DepthLayer::Root, vwc, variance }
    }

    fn texture() -> SoilTexture {
        SoilTexture::new(0.40, 0.40, 0.20).unwrap()
    }

    #[test]
    fn test_prediction_inflates_variance() {
        let config = FilterConfig::default();
        let before = estimate(0.25, 0.001);
        let after = predict_layer(&before, &texture(), 15.0, 5.0, 6.0, &config);
        assert!(after.variance > before.variance);
    }

    #[test]
    fn test_prediction_draws_down_moisture() {
        let config = FilterConfig::default();
        let before = estimate(0.30, 0.001);
        let after = predict_layer(&before, &texture(), 15.0, 6.0, 12.0, &config);
        assert!(after.vwc < before.vwc);
        assert!(after.vwc >= 0.0);
    }

    #[test]
    fn test_no_et_draw_at_wilting_point() {
        let config = FilterConfig::default();
        let wp = texture().wilting_point();
        let before = estimate(wp, 0.001);
        let after = predict_layer(&before, &texture(), 15.0, 8.0, 24.0, &config);
        assert!((after.vwc - wp).abs() < 1e-9);
    }

    #[test]
    fn test_update_shrinks_variance_and_moves_toward_observation() {
        let config = FilterConfig::default();
        let before = estimate(0.20, 0.01);
        let after = update_layer(&before, 0.32, &config);
        assert!(after.variance < before.variance);
        assert!(after.vwc > before.vwc && after.vwc < 0.32 + 1e-12);
    }

    #[test]
    fn test_variance_floor_holds() {
        let config = FilterConfig::default();
        let mut layer = estimate(0.25, 0.01);
        for _ in 0..1000 {
            layer = update_layer(&layer, 0.25, &config);
        }
        assert!(layer.variance >= config.variance_floor);
    }

    #[test]
    fn test_confident_prior_resists_noisy_observation() {
        let config = FilterConfig::default();
        // Prior variance far below observation variance: gain is small.
        let before = estimate(0.25, config.observation_variance / 100.0);
        let after = update_layer(&before, 0.50, &config);
        assert!((after.vwc - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_texture_learning_is_bounded() {
        let config = FilterConfig::default();
        let t = texture();
        let (learned, ksat) = learn_texture(&t, 15.0, 0.10, &config);
        assert!((learned.clay - t.clay).abs() <= config.texture_learn_step + 1e-9);
        assert!((learned.sand + learned.silt + learned.clay - 1.0).abs() < 1e-9);
        assert!(ksat < 15.0);
    }

    #[test]
    fn test_small_residual_leaves_texture_alone() {
        let config = FilterConfig::default();
        let t = texture();
        let (learned, ksat) = learn_texture(&t, 15.0, 0.01, &config);
        assert_eq!(learned, t);
        assert_eq!(ksat, 15.0);
    }
}
