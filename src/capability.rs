// SPDX-License-Identifier: GPL-3.0-only

//! Hardware capability control
//!
//! Wraps the active track's control port: torch on/off and the momentary
//! manual-focus pulse. The pulse is a timer-backed state, not a boolean:
//! `Idle -> Focusing -> Idle` with a fixed settle window before reverting
//! to continuous and a longer busy window that drops overlapping pulses.
//! Teardown mid-pulse aborts the timer and reverts immediately.

use crate::backends::capture::types::{FocusMode, TrackCapabilities};
use crate::backends::capture::TrackControls;
use crate::constants::{FOCUS_PULSE_BUSY, FOCUS_SETTLE};
use crate::errors::{Capability, ScanError, ScanResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observable capability flags for the embedding UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityFlags {
    pub torch_available: bool,
    pub focus_available: bool,
    pub torch_on: bool,
}

/// Timer-backed manual-focus state
enum FocusPulse {
    Idle,
    Focusing {
        busy_until: Instant,
        revert: JoinHandle<()>,
    },
}

/// Capability controller for one active stream.
///
/// Rebuilt against the new track on every pipeline restart; the old
/// instance's teardown runs first so a pulse never outlives its track.
pub struct CapabilityController {
    controls: Arc<dyn TrackControls>,
    caps: TrackCapabilities,
    torch_on: bool,
    focus: FocusPulse,
}

impl CapabilityController {
    /// Inspect the track's capabilities once and wrap its control port
    pub fn new(controls: Arc<dyn TrackControls>) -> Self {
        let caps = controls.capabilities();
        info!(
            torch = caps.torch,
            manual_focus = caps.supports_manual_focus(),
            "Track capabilities inspected"
        );
        Self {
            controls,
            caps,
            torch_on: false,
            focus: FocusPulse::Idle,
        }
    }

    pub fn flags(&self) -> CapabilityFlags {
        CapabilityFlags {
            torch_available: self.caps.torch,
            focus_available: self.caps.supports_manual_focus(),
            torch_on: self.torch_on,
        }
    }

    pub fn torch_on(&self) -> bool {
        self.torch_on
    }

    /// Turn the torch on or off.
    ///
    /// Fails with `CapabilityUnsupported` when the track advertises no
    /// torch; the session stays alive either way.
    pub fn set_torch(&mut self, on: bool) -> ScanResult<()> {
        if !self.caps.torch {
            return Err(ScanError::CapabilityUnsupported(Capability::Torch));
        }
        self.controls
            .set_torch(on)
            .map_err(|e| ScanError::Other(format!("torch control failed: {}", e)))?;
        self.torch_on = on;
        debug!(on, "Torch state applied");
        Ok(())
    }

    /// Toggle the torch, returning the new state
    pub fn toggle_torch(&mut self) -> ScanResult<bool> {
        let next = !self.torch_on;
        self.set_torch(next)?;
        Ok(next)
    }

    /// Fire a momentary manual-focus pulse.
    ///
    /// Switches focus/exposure/white-balance to manual, reverts to
    /// continuous after the settle window, and stays busy for the full
    /// pulse window. A pulse arriving while busy is dropped.
    pub fn pulse_manual_focus(&mut self) -> ScanResult<()> {
        if !self.caps.supports_manual_focus() {
            return Err(ScanError::CapabilityUnsupported(Capability::ManualFocus));
        }

        // The busy window outlasts the settle revert; a pulse inside it is
        // dropped even after focus has already snapped back to continuous
        if let FocusPulse::Focusing { busy_until, .. } = &self.focus {
            if Instant::now() < *busy_until {
                debug!("Focus pulse dropped, previous pulse still busy");
                return Ok(());
            }
        }

        self.controls
            .set_focus_mode(FocusMode::Manual)
            .map_err(|e| ScanError::Other(format!("focus control failed: {}", e)))?;
        debug!("Manual focus pulse started");

        let controls = Arc::clone(&self.controls);
        let revert = tokio::spawn(async move {
            tokio::time::sleep(FOCUS_SETTLE).await;
            if let Err(e) = controls.set_focus_mode(FocusMode::Continuous) {
                warn!(error = %e, "Failed to revert to continuous focus");
            } else {
                debug!("Manual focus pulse settled, continuous restored");
            }
        });

        self.focus = FocusPulse::Focusing {
            busy_until: Instant::now() + FOCUS_PULSE_BUSY,
            revert,
        };
        Ok(())
    }

    /// Cancel any in-flight pulse and restore continuous focus.
    ///
    /// Called before the track goes away (stop, device switch).
    pub fn teardown(&mut self) {
        if let FocusPulse::Focusing { revert, .. } =
            std::mem::replace(&mut self.focus, FocusPulse::Idle)
        {
            if !revert.is_finished() {
                revert.abort();
                if let Err(e) = self.controls.set_focus_mode(FocusMode::Continuous) {
                    debug!(error = %e, "Continuous focus restore failed during teardown");
                }
            }
        }
        if self.torch_on {
            let _ = self.controls.set_torch(false);
            self.torch_on = false;
        }
    }
}

impl Drop for CapabilityController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::capture::virtual_source::VirtualControls;

    fn controls(torch: bool, manual: bool) -> Arc<VirtualControls> {
        let mut focus_modes = vec![FocusMode::Continuous];
        if manual {
            focus_modes.push(FocusMode::Manual);
        }
        Arc::new(VirtualControls::new(TrackCapabilities {
            torch,
            focus_modes,
        }))
    }

    #[tokio::test]
    async fn torch_without_capability_is_unsupported() {
        let mut cap = CapabilityController::new(controls(false, true));
        assert!(matches!(
            cap.set_torch(true),
            Err(ScanError::CapabilityUnsupported(Capability::Torch))
        ));
        assert!(!cap.flags().torch_available);
    }

    #[tokio::test]
    async fn torch_toggle_tracks_state() {
        let port = controls(true, true);
        let mut cap = CapabilityController::new(Arc::clone(&port) as Arc<dyn TrackControls>);

        assert_eq!(cap.toggle_torch().expect("supported"), true);
        assert!(port.torch_on());
        assert!(cap.flags().torch_on);

        assert_eq!(cap.toggle_torch().expect("supported"), false);
        assert!(!port.torch_on());
    }

    #[tokio::test]
    async fn focus_pulse_without_manual_mode_is_unsupported() {
        let mut cap = CapabilityController::new(controls(true, false));
        assert!(matches!(
            cap.pulse_manual_focus(),
            Err(ScanError::CapabilityUnsupported(Capability::ManualFocus))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn focus_pulse_reverts_after_settle_window() {
        let port = controls(true, true);
        let mut cap = CapabilityController::new(Arc::clone(&port) as Arc<dyn TrackControls>);

        cap.pulse_manual_focus().expect("supported");
        assert_eq!(port.focus_mode(), FocusMode::Manual);

        // Past the settle window the revert task restores continuous
        tokio::time::sleep(FOCUS_SETTLE + std::time::Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(port.focus_mode(), FocusMode::Continuous);
    }

    #[tokio::test]
    async fn overlapping_pulse_is_dropped() {
        let port = controls(true, true);
        let mut cap = CapabilityController::new(Arc::clone(&port) as Arc<dyn TrackControls>);

        cap.pulse_manual_focus().expect("supported");
        // Second pulse inside the busy window is a quiet no-op
        cap.pulse_manual_focus().expect("dropped, not an error");
        assert_eq!(port.focus_mode(), FocusMode::Manual);
    }

    #[tokio::test]
    async fn teardown_mid_pulse_restores_continuous() {
        let port = controls(true, true);
        let mut cap = CapabilityController::new(Arc::clone(&port) as Arc<dyn TrackControls>);

        cap.set_torch(true).expect("supported");
        cap.pulse_manual_focus().expect("supported");
        assert_eq!(port.focus_mode(), FocusMode::Manual);

        cap.teardown();
        assert_eq!(port.focus_mode(), FocusMode::Continuous);
        assert!(!port.torch_on());
    }
}
