// SPDX-License-Identifier: GPL-3.0-only

//! Detection reconciliation
//!
//! Both decode engines race into a single-consumer channel; this state
//! machine is the one place that decides which event wins. It applies the
//! per-pipeline acceptance thresholds, debounces repeated identical
//! payloads, and claims at most one detection per scan pass.

use crate::engines::{DetectionEvent, EngineKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Acceptance thresholds for the matrix (2D-capable) pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatrixThresholds {
    /// Minimum geometric result points for a match
    pub min_result_points: u32,
    /// Minimum decoded text length
    pub min_text_len: usize,
}

impl Default for MatrixThresholds {
    fn default() -> Self {
        Self {
            min_result_points: 2,
            min_text_len: 3,
        }
    }
}

/// Acceptance thresholds for the linear pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearThresholds {
    /// Minimum scanline agreement count
    pub min_agreement: u32,
    /// Maximum mean per-symbol error
    pub max_mean_error: f32,
    /// Minimum decoded text length
    pub min_text_len: usize,
    /// Maximum decoded text length
    pub max_text_len: usize,
}

impl Default for LinearThresholds {
    fn default() -> Self {
        Self {
            min_agreement: 4,
            max_mean_error: 0.5,
            min_text_len: 3,
            max_text_len: 50,
        }
    }
}

/// Full acceptance policy, carried in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptancePolicy {
    pub matrix: MatrixThresholds,
    pub linear: LinearThresholds,
    /// Debounce window for repeated identical payloads, milliseconds
    pub debounce_ms: u64,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            matrix: MatrixThresholds::default(),
            linear: LinearThresholds::default(),
            debounce_ms: crate::constants::DEBOUNCE_WINDOW.as_millis() as u64,
        }
    }
}

/// Phase of one scan pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPhase {
    #[default]
    Idle,
    Scanning,
    Claimed,
}

/// Debounce bookkeeping; mutated only by the reconciler
#[derive(Debug, Clone, Default)]
struct AcceptanceState {
    last_text: Option<String>,
    last_at_ms: i64,
}

/// What happened to an offered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First accepted event of this pass; the caller should normalize it
    Claimed,
    /// Identical payload inside the debounce window
    Suppressed,
    /// Below the source pipeline's acceptance thresholds
    BelowThreshold,
    /// Machine was not in Scanning (already claimed, or idle)
    Inactive,
}

/// The reconciliation state machine
#[derive(Debug)]
pub struct Reconciler {
    phase: ScanPhase,
    acceptance: AcceptanceState,
    policy: AcceptancePolicy,
}

impl Reconciler {
    pub fn new(policy: AcceptancePolicy) -> Self {
        Self {
            phase: ScanPhase::Idle,
            acceptance: AcceptanceState::default(),
            policy,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Enter Scanning and reset the debounce state.
    ///
    /// Called on session start and on every restart (device switch, retry).
    pub fn begin_scanning(&mut self) {
        self.phase = ScanPhase::Scanning;
        self.acceptance = AcceptanceState::default();
        debug!("Reconciler scanning");
    }

    /// Offer one detection event to the machine.
    ///
    /// The first event that passes its pipeline's thresholds and the
    /// debounce check claims the pass; both pipelines race, later events
    /// are no-ops until the claim resolves.
    pub fn offer(&mut self, event: &DetectionEvent) -> Verdict {
        if self.phase != ScanPhase::Scanning {
            return Verdict::Inactive;
        }

        if !self.meets_threshold(event) {
            trace!(
                source = %event.source,
                confidence = event.confidence,
                quality = event.quality,
                "Detection below threshold"
            );
            return Verdict::BelowThreshold;
        }

        if let Some(last) = self.acceptance.last_text.as_deref()
            && last == event.raw_text
            && event.timestamp_ms - self.acceptance.last_at_ms
                < self.policy.debounce_ms as i64
        {
            trace!(text = %event.raw_text, "Detection suppressed by debounce");
            return Verdict::Suppressed;
        }

        self.acceptance.last_text = Some(event.raw_text.clone());
        self.acceptance.last_at_ms = event.timestamp_ms;
        self.phase = ScanPhase::Claimed;
        debug!(source = %event.source, text = %event.raw_text, "Detection claimed");
        Verdict::Claimed
    }

    /// Return to Scanning after a claimed payload failed normalization.
    ///
    /// The rejected text/timestamp stay recorded so identical noise is not
    /// immediately reprocessed.
    pub fn reject_claim(&mut self, text: &str, at_ms: i64) {
        debug_assert_eq!(self.phase, ScanPhase::Claimed);
        self.acceptance.last_text = Some(text.to_string());
        self.acceptance.last_at_ms = at_ms;
        self.phase = ScanPhase::Scanning;
        debug!(text = %text, "Claim rejected, back to scanning");
    }

    /// Leave the pass; the machine returns to Idle
    pub fn finish(&mut self) {
        self.phase = ScanPhase::Idle;
    }

    fn meets_threshold(&self, event: &DetectionEvent) -> bool {
        let len = event.raw_text.len();
        match event.source {
            EngineKind::Matrix => {
                event.confidence >= self.policy.matrix.min_result_points as f32
                    && len >= self.policy.matrix.min_text_len
            }
            EngineKind::Linear => {
                event.confidence >= self.policy.linear.min_agreement as f32
                    && event.quality <= self.policy.linear.max_mean_error
                    && len >= self.policy.linear.min_text_len
                    && len <= self.policy.linear.max_text_len
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: EngineKind, text: &str, confidence: f32, quality: f32, ts: i64) -> DetectionEvent {
        DetectionEvent {
            raw_text: text.to_string(),
            source,
            confidence,
            quality,
            timestamp_ms: ts,
        }
    }

    fn matrix_event(text: &str, ts: i64) -> DetectionEvent {
        event(EngineKind::Matrix, text, 4.0, 0.0, ts)
    }

    fn linear_event(text: &str, ts: i64) -> DetectionEvent {
        event(EngineKind::Linear, text, 6.0, 0.1, ts)
    }

    fn scanning() -> Reconciler {
        let mut r = Reconciler::new(AcceptancePolicy::default());
        r.begin_scanning();
        r
    }

    #[test]
    fn idle_machine_ignores_events() {
        let mut r = Reconciler::new(AcceptancePolicy::default());
        assert_eq!(r.offer(&matrix_event("12345678", 0)), Verdict::Inactive);
    }

    #[test]
    fn first_writer_wins() {
        let mut r = scanning();
        assert_eq!(r.offer(&matrix_event("12345678", 0)), Verdict::Claimed);
        // The racing pipeline's event arrives after the transition
        assert_eq!(r.offer(&linear_event("12345678", 1)), Verdict::Inactive);
        assert_eq!(r.phase(), ScanPhase::Claimed);
    }

    #[test]
    fn matrix_threshold_gates() {
        let mut r = scanning();
        // One result point is not a match
        assert_eq!(
            r.offer(&event(EngineKind::Matrix, "12345678", 1.0, 0.0, 0)),
            Verdict::BelowThreshold
        );
        // Short payloads are noise
        assert_eq!(
            r.offer(&event(EngineKind::Matrix, "12", 4.0, 0.0, 0)),
            Verdict::BelowThreshold
        );
        assert_eq!(r.phase(), ScanPhase::Scanning);
    }

    #[test]
    fn linear_threshold_gates() {
        let mut r = scanning();
        // Not enough agreeing scanlines
        assert_eq!(
            r.offer(&event(EngineKind::Linear, "12345678", 3.0, 0.1, 0)),
            Verdict::BelowThreshold
        );
        // Error rate too high
        assert_eq!(
            r.offer(&event(EngineKind::Linear, "12345678", 6.0, 0.6, 0)),
            Verdict::BelowThreshold
        );
        // Overlong payloads are rejected
        let long = "9".repeat(51);
        assert_eq!(
            r.offer(&event(EngineKind::Linear, &long, 6.0, 0.1, 0)),
            Verdict::BelowThreshold
        );
        // Boundary values pass
        assert_eq!(
            r.offer(&event(EngineKind::Linear, "12345678", 4.0, 0.5, 0)),
            Verdict::Claimed
        );
    }

    #[test]
    fn debounce_suppresses_identical_text_inside_window() {
        let mut r = scanning();
        assert_eq!(r.offer(&linear_event("12345678", 1_000)), Verdict::Claimed);
        r.reject_claim("12345678", 1_000);

        // Same text 400ms later: suppressed
        assert_eq!(
            r.offer(&linear_event("12345678", 1_400)),
            Verdict::Suppressed
        );
        // Different text inside the window: processed
        assert_eq!(r.offer(&linear_event("87654321", 1_450)), Verdict::Claimed);
    }

    #[test]
    fn debounce_window_boundary() {
        let mut r = scanning();
        assert_eq!(r.offer(&linear_event("12345678", 0)), Verdict::Claimed);
        r.reject_claim("12345678", 0);

        assert_eq!(r.offer(&linear_event("12345678", 1_499)), Verdict::Suppressed);
        // At exactly the window edge the event is reprocessed independently
        assert_eq!(r.offer(&linear_event("12345678", 1_500)), Verdict::Claimed);
    }

    #[test]
    fn restart_resets_acceptance_state() {
        let mut r = scanning();
        assert_eq!(r.offer(&linear_event("12345678", 0)), Verdict::Claimed);
        r.reject_claim("12345678", 0);

        r.begin_scanning();
        // Same text immediately after a restart: no debounce carryover
        assert_eq!(r.offer(&linear_event("12345678", 10)), Verdict::Claimed);
    }

    #[test]
    fn finish_returns_to_idle() {
        let mut r = scanning();
        assert_eq!(r.offer(&linear_event("12345678", 0)), Verdict::Claimed);
        r.finish();
        assert_eq!(r.phase(), ScanPhase::Idle);
        assert_eq!(r.offer(&linear_event("12345678", 10)), Verdict::Inactive);
    }
}
