// SPDX-License-Identifier: GPL-3.0-only

//! Capture backend abstraction
//!
//! This module provides a trait-based abstraction over camera capture so the
//! scan engine can run against real V4L2 hardware or the deterministic
//! virtual source used by tests and demos.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   ScanSession        │
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │  CaptureController   │  ← tiered acquire, release, device switch
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ CaptureBackend trait │  ← common interface
//! └──────────┬───────────┘
//!            │
//!      ┌─────┴─────┐
//!      ▼           ▼
//!  ┌───────┐  ┌─────────┐
//!  │ V4L2  │  │ Virtual │
//!  └───────┘  └─────────┘
//! ```

pub mod constraints;
pub mod controller;
pub mod types;
pub mod v4l2;
pub mod virtual_source;

pub use constraints::{CaptureConstraints, ConstraintTier, FacingMode};
pub use controller::{ActiveStream, CaptureController};
pub use types::*;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Capture backend trait
///
/// Backends enumerate devices and open streams against a constraint set.
/// They never decide fallback policy; the CaptureController walks the
/// constraint tiers and owns the resulting stream exclusively.
pub trait CaptureBackend: Send + Sync {
    /// Check if this backend is usable on the current system
    fn is_available(&self) -> bool;

    /// Enumerate available camera devices
    fn enumerate_devices(&self) -> Vec<DeviceDescriptor>;

    /// Open a stream on the given device with the given constraints.
    ///
    /// Blocking; callers run this on the blocking pool. The returned stream
    /// owns the underlying hardware tracks until `stop()` is called.
    fn open(
        &self,
        device: &DeviceDescriptor,
        constraints: &CaptureConstraints,
    ) -> BackendResult<Box<dyn CaptureStream>>;
}

/// An open capture stream owning the underlying hardware tracks
pub trait CaptureStream: Send + Sync {
    /// Watch the negotiated stream format.
    ///
    /// The format starts at zero dimensions and becomes ready once the
    /// backend finishes negotiation; some drivers only settle after the
    /// first frame.
    fn format(&self) -> watch::Receiver<StreamFormat>;

    /// Subscribe to the frame fan-out.
    ///
    /// Every subscriber gets its own receiver; slow consumers observe
    /// `Lagged` rather than blocking capture.
    fn frames(&self) -> broadcast::Receiver<Arc<VideoFrame>>;

    /// Control port for the primary video track
    fn controls(&self) -> Arc<dyn TrackControls>;

    /// Stop every track on this stream. Idempotent.
    fn stop(&mut self);

    /// Whether the stream still holds live tracks
    fn is_live(&self) -> bool;
}

/// Hardware control port for a stream's primary video track
pub trait TrackControls: Send + Sync {
    /// Capabilities the track advertises
    fn capabilities(&self) -> TrackCapabilities;

    /// Turn the torch LED on or off
    fn set_torch(&self, on: bool) -> BackendResult<()>;

    /// Switch the focus/exposure/white-balance mode
    fn set_focus_mode(&self, mode: FocusMode) -> BackendResult<()>;
}

/// Capture backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendKind {
    /// V4L2 backend (Linux camera hardware)
    #[default]
    V4l2,
    /// Deterministic virtual source (tests, demos)
    Virtual,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::V4l2 => write!(f, "v4l2"),
            BackendKind::Virtual => write!(f, "virtual"),
        }
    }
}

/// Get a concrete backend instance for the given kind
pub fn backend_for(kind: BackendKind) -> Arc<dyn CaptureBackend> {
    match kind {
        BackendKind::V4l2 => Arc::new(v4l2::V4l2Backend::new()),
        BackendKind::Virtual => Arc::new(virtual_source::VirtualBackend::new()),
    }
}
