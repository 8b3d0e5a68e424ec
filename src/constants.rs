// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Debounce window for repeated identical detections.
///
/// A detection whose raw text matches the last accepted one is suppressed
/// when it arrives inside this window.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(1500);

/// Settle window for a manual-focus pulse before reverting to continuous
pub const FOCUS_SETTLE: Duration = Duration::from_millis(800);

/// Total busy window of a manual-focus pulse; overlapping pulses are dropped
pub const FOCUS_PULSE_BUSY: Duration = Duration::from_millis(2000);

/// How long the session waits for the first frame before failing with a
/// ready timeout
pub const VIDEO_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Bounded retry budget for a zero-sized decode render surface
pub const SURFACE_READY_ATTEMPTS: u32 = 10;

/// Interval between render-surface readiness checks
pub const SURFACE_READY_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum dimension used for decoding.
///
/// Frames are downscaled to this budget before decoding; optical codes are
/// large enough in the frame to survive the reduction, and the saved work
/// keeps the decode cadence real-time.
pub const DECODE_MAX_DIMENSION: u32 = 640;

/// Minimum interval between decode attempts per engine
pub const DECODE_INTERVAL: Duration = Duration::from_millis(150);

/// Capacity of the frame fan-out channel
pub const FRAME_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the detection event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Row sampling stride for linear scanline passes, in surface pixels
pub const SCANLINE_ROW_STRIDE: u32 = 4;

/// Resolution tiers used by capture constraints
pub mod resolution {
    /// Landscape preferred tier (width, height)
    pub const LANDSCAPE_IDEAL: (u32, u32) = (2560, 1440);

    /// Portrait preferred tier, long edge vertical (width, height)
    pub const PORTRAIT_IDEAL: (u32, u32) = (1080, 1920);

    /// Lower bound accepted by the preferred tier (width, height)
    pub const MIN_EDGE: (u32, u32) = (640, 480);

    /// Baseline tier used after the preferred tier is rejected
    pub const BASELINE: (u32, u32) = (640, 480);

    /// Frame rate requested by the preferred tier
    pub const PREFERRED_FRAMERATE: u32 = 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_windows_nest() {
        // The settle window must finish inside the busy window
        assert!(FOCUS_SETTLE < FOCUS_PULSE_BUSY);
    }

    #[test]
    fn surface_retry_budget_is_bounded() {
        let total = SURFACE_READY_INTERVAL * SURFACE_READY_ATTEMPTS;
        assert!(total < VIDEO_READY_TIMEOUT);
    }
}
