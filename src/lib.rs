// SPDX-License-Identifier: GPL-3.0-only

//! codescan - the real-time optical code acquisition engine of an
//! inventory-tracking application
//!
//! Opens a live camera feed, runs two independent decode pipelines against
//! it, reconciles their detections under confidence/quality thresholds,
//! and normalizes whatever was decoded into a canonical 8-digit inventory
//! code.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: capture backend abstraction (V4L2 hardware, virtual)
//! - [`capability`]: torch and manual-focus control for the active track
//! - [`engines`]: the two pluggable decode pipelines
//! - [`reconcile`]: the detection reconciliation state machine
//! - [`normalize`]: canonical 8-digit code normalization
//! - [`session`]: the scan session orchestrator
//! - [`config`]: user configuration handling

pub mod backends;
pub mod capability;
pub mod config;
pub mod constants;
pub mod engines;
pub mod errors;
pub mod normalize;
pub mod reconcile;
pub mod session;

// Re-export commonly used types
pub use backends::capture::{BackendKind, DeviceDescriptor, Viewport, backend_for};
pub use capability::CapabilityFlags;
pub use config::Config;
pub use engines::{DetectionEvent, EngineKind, EngineProfile};
pub use errors::{Capability, ScanError, ScanResult};
pub use normalize::{CanonicalCode, RejectionReason, normalize};
pub use session::{
    ScanSession, SessionCallbacks, SessionCommand, SessionHandle, SessionOutcome, SessionRequest,
};
