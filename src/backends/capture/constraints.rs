// SPDX-License-Identifier: GPL-3.0-only

//! Capture constraint computation
//!
//! Constraints are recomputed whenever the viewport orientation changes and
//! consumed only at stream-(re)acquisition time. Acquisition walks the tiers
//! in order: the preferred tier first, then a minimal baseline that requests
//! nothing beyond explicit width/height/facing.

use super::types::Orientation;
use crate::constants::resolution;

/// Which side of the lens the session wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    /// Rear / world-facing camera
    #[default]
    Environment,
    /// Front / user-facing camera
    User,
}

/// A single dimension request with an ideal value and hard bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionRange {
    pub ideal: u32,
    pub min: u32,
    pub max: u32,
}

impl DimensionRange {
    pub fn new(ideal: u32, min: u32, max: u32) -> Self {
        Self { ideal, min, max }
    }

    /// An exact request with no negotiation room
    pub fn exact(value: u32) -> Self {
        Self {
            ideal: value,
            min: value,
            max: value,
        }
    }
}

/// Constraint tier used for a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintTier {
    /// Full request: resolution ranges, framerate, continuous 3A
    Preferred,
    /// Minimal request: explicit width/height/facing only
    Baseline,
}

/// Constraints consumed by a backend when opening a stream
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub tier: ConstraintTier,
    pub width: DimensionRange,
    pub height: DimensionRange,
    /// Requested frame rate; baseline leaves it to the driver
    pub framerate: Option<u32>,
    pub facing: FacingMode,
    /// Orientation-dependent aspect ratio hint (width / height)
    pub aspect_ratio: Option<f32>,
    /// Request continuous focus/exposure/white-balance
    pub continuous_focus: bool,
}

impl CaptureConstraints {
    /// Preferred tier for the given orientation.
    ///
    /// Landscape requests the 2560x1440 tier; portrait swaps the 1920x1080
    /// tier so the long edge runs vertically. Both ask for continuous
    /// focus/exposure/white-balance and the environment-facing camera.
    pub fn preferred(orientation: Orientation) -> Self {
        let (width, height) = match orientation {
            Orientation::Landscape => (
                DimensionRange::new(
                    resolution::LANDSCAPE_IDEAL.0,
                    resolution::MIN_EDGE.0,
                    resolution::LANDSCAPE_IDEAL.0,
                ),
                DimensionRange::new(
                    resolution::LANDSCAPE_IDEAL.1,
                    resolution::MIN_EDGE.1,
                    resolution::LANDSCAPE_IDEAL.1,
                ),
            ),
            Orientation::Portrait => (
                DimensionRange::new(
                    resolution::PORTRAIT_IDEAL.0,
                    resolution::MIN_EDGE.1,
                    resolution::PORTRAIT_IDEAL.1,
                ),
                DimensionRange::new(
                    resolution::PORTRAIT_IDEAL.1,
                    resolution::MIN_EDGE.0,
                    resolution::PORTRAIT_IDEAL.1,
                ),
            ),
        };

        let aspect = width.ideal as f32 / height.ideal as f32;

        Self {
            tier: ConstraintTier::Preferred,
            width,
            height,
            framerate: Some(resolution::PREFERRED_FRAMERATE),
            facing: FacingMode::Environment,
            aspect_ratio: Some(aspect),
            continuous_focus: true,
        }
    }

    /// Minimal baseline tier: explicit width/height/facing only.
    ///
    /// Used after the preferred tier is rejected (permission quirks,
    /// unsupported constraint combinations, busy hardware).
    pub fn baseline(orientation: Orientation) -> Self {
        let (w, h) = if orientation.swaps_dimensions() {
            (resolution::BASELINE.1, resolution::BASELINE.0)
        } else {
            resolution::BASELINE
        };

        Self {
            tier: ConstraintTier::Baseline,
            width: DimensionRange::exact(w),
            height: DimensionRange::exact(h),
            framerate: None,
            facing: FacingMode::Environment,
            aspect_ratio: None,
            continuous_focus: false,
        }
    }

    /// The tiers to attempt for one acquisition, in order
    pub fn tiers(orientation: Orientation) -> [Self; 2] {
        [Self::preferred(orientation), Self::baseline(orientation)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landscape_prefers_1440p() {
        let c = CaptureConstraints::preferred(Orientation::Landscape);
        assert_eq!(c.width.ideal, 2560);
        assert_eq!(c.height.ideal, 1440);
        assert!(c.continuous_focus);
        assert_eq!(c.facing, FacingMode::Environment);
    }

    #[test]
    fn portrait_swaps_the_1080p_tier() {
        let c = CaptureConstraints::preferred(Orientation::Portrait);
        assert_eq!(c.width.ideal, 1080);
        assert_eq!(c.height.ideal, 1920);
        let aspect = c.aspect_ratio.unwrap();
        assert!(aspect < 1.0);
    }

    #[test]
    fn baseline_is_minimal() {
        let c = CaptureConstraints::baseline(Orientation::Landscape);
        assert_eq!(c.tier, ConstraintTier::Baseline);
        assert_eq!(c.width.min, c.width.max);
        assert!(c.framerate.is_none());
        assert!(c.aspect_ratio.is_none());
        assert!(!c.continuous_focus);
    }

    #[test]
    fn tier_order_is_preferred_then_baseline() {
        let tiers = CaptureConstraints::tiers(Orientation::Portrait);
        assert_eq!(tiers[0].tier, ConstraintTier::Preferred);
        assert_eq!(tiers[1].tier, ConstraintTier::Baseline);
    }
}
