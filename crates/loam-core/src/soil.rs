// SOIL PARAMETERS
// Texture fractions and depth layers shared by the filter and the prior

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sensed depth layers. Probes report one of these nominal depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthLayer {
    /// 0–20 cm
    Shallow,
    /// 20–50 cm
    Root,
    /// 50–100 cm
    Deep,
}

impl DepthLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepthLayer::Shallow => "SHALLOW",
            DepthLayer::Root => "ROOT",
            DepthLayer::Deep => "DEEP",
        }
    }

    /// Layer thickness in meters, used to convert ET in mm to a
    /// volumetric fraction change.
    pub fn thickness_m(&self) -> f64 {
        match self {
            DepthLayer::Shallow => 0.20,
            DepthLayer::Root => 0.30,
            DepthLayer::Deep => 0.50,
        }
    }

    /// Classify a probe depth (meters below surface) into a layer.
    pub fn from_depth_m(depth_m: f64) -> DepthLayer {
        if depth_m < 0.20 {
            DepthLayer::Shallow
        } else if depth_m < 0.50 {
            DepthLayer::Root
        } else {
            DepthLayer::Deep
        }
    }

    pub fn all() -> [DepthLayer; 3] {
        [DepthLayer::Shallow, DepthLayer::Root, DepthLayer::Deep]
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TextureError {
    #[error("texture fractions must be non-negative and sum to ~1, got {sand} + {silt} + {clay}")]
    NotNormalized { sand: f64, silt: f64, clay: f64 },
}

/// Sand/silt/clay fractions of one cell.
///
/// Invariant: fractions are non-negative and sum to 1 (within float
/// tolerance). The filter's texture-learning step must renormalize after
/// every nudge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoilTexture {
    pub sand: f64,
    pub silt: f64,
    pub clay: f64,
}

impl SoilTexture {
    pub fn new(sand: f64, silt: f64, clay: f64) -> Result<Self, TextureError> {
        let sum = sand + silt + clay;
        if sand < 0.0 || silt < 0.0 || clay < 0.0 || (sum - 1.0).abs() > 1e-6 {
            return Err(TextureError::NotNormalized { sand, silt, clay });
        }
        Ok(SoilTexture { sand, silt, clay })
    }

    /// Renormalize fractions to sum to 1 after a bounded adjustment.
    pub fn normalized(sand: f64, silt: f64, clay: f64) -> SoilTexture {
        let sand = sand.max(0.0);
        let silt = silt.max(0.0);
        let clay = clay.max(0.0);
        let sum = sand + silt + clay;
        if sum <= 0.0 {
            // Degenerate input: fall back to an even loam
            return SoilTexture { sand: 1.0 / 3.0, silt: 1.0 / 3.0, clay: 1.0 / 3.0 };
        }
        SoilTexture { sand: sand / sum, silt: silt / sum, clay: clay / sum }
    }

    /// Volumetric field capacity estimated from texture.
    /// Clay-rich soils hold more water against drainage.
    pub fn field_capacity(&self) -> f64 {
        0.08 + 0.28 * self.clay + 0.14 * self.silt
    }

    /// Volumetric wilting point estimated from texture.
    pub fn wilting_point(&self) -> f64 {
        0.02 + 0.16 * self.clay + 0.04 * self.silt
    }
}

/// Regional prior used for cells that have never been observed.
///
/// Derived offline from a soil-survey texture map; the filter assigns
/// this prior instead of leaving unobserved cells undefined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TexturePrior {
    /// Prior texture for the region
    pub texture: SoilTexture,

    /// Prior saturated conductivity, mm/hour
    pub ksat_mm_hr: f64,

    /// Prior volumetric moisture
    pub vwc: f64,

    /// Prior variance per layer (wide: nothing has been observed)
    pub variance: f64,
}

impl Default for TexturePrior {
    fn default() -> Self {
        TexturePrior {
            texture: SoilTexture { sand: 0.40, silt: 0.40, clay: 0.20 },
            ksat_mm_hr: 15.0,
            vwc: 0.20,
            variance: 0.02,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_must_be_normalized() {
        assert!(SoilTexture::new(0.4, 0.4, 0.2).is_ok());
        assert!(SoilTexture::new(0.5, 0.5, 0.5).is_err());
        assert!(SoilTexture::new(-0.1, 0.6, 0.5).is_err());
    }

    #[test]
    fn test_normalized_sums_to_one() {
        let t = SoilTexture::normalized(0.5, 0.4, 0.3);
        assert!((t.sand + t.silt + t.clay - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_clay_raises_field_capacity() {
        let sandy = SoilTexture::new(0.8, 0.15, 0.05).unwrap();
        let clayey = SoilTexture::new(0.2, 0.3, 0.5).unwrap();
        assert!(clayey.field_capacity() > sandy.field_capacity());
        assert!(clayey.wilting_point() > sandy.wilting_point());
    }

    #[test]
    fn test_depth_classification() {
        assert_eq!(DepthLayer::from_depth_m(0.10), DepthLayer::Shallow);
        assert_eq!(DepthLayer::from_depth_m(0.30), DepthLayer::Root);
        assert_eq!(DepthLayer::from_depth_m(0.80), DepthLayer::Deep);
    }
}

#[cfg(test)]
mod texture_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalized_always_sums_to_one(
            sand in 0.01f64..10.0,
            silt in 0.01f64..10.0,
            clay in 0.01f64..10.0,
        ) {
            let t = SoilTexture::normalized(sand, silt, clay);
            prop_assert!((t.sand + t.silt + t.clay - 1.0).abs() < 1e-9);
            prop_assert!(t.sand >= 0.0 && t.silt >= 0.0 && t.clay >= 0.0);
        }

        #[test]
        fn field_capacity_always_exceeds_wilting_point(
            sand in 0.01f64..1.0,
            silt in 0.01f64..1.0,
            clay in 0.01f64..1.0,
        ) {
            let t = SoilTexture::normalized(sand, silt, clay);
            prop_assert!(t.field_capacity() > t.wilting_point());
        }
    }
}
