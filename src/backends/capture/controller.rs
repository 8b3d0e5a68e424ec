// SPDX-License-Identifier: GPL-3.0-only

//! Capture lifecycle controller
//!
//! The controller owns the one exclusive hardware resource of a scan
//! session: the active camera stream. It enumerates devices once per
//! initialization, walks the constraint tiers on acquisition, releases
//! idempotently, and guarantees that no code path ever observes two live
//! streams.

use super::constraints::CaptureConstraints;
use super::types::{BackendError, DeviceDescriptor, Orientation, StreamFormat, Viewport};
use super::{CaptureBackend, CaptureStream, TrackControls};
use crate::engines::EngineSource;
use crate::errors::{ScanError, ScanResult};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The active camera stream, exclusively owned by the controller.
///
/// Dropping the guard stops every track, so error paths release the
/// hardware without special handling.
pub struct ActiveStream {
    inner: Box<dyn CaptureStream>,
    device_id: String,
}

impl ActiveStream {
    fn new(inner: Box<dyn CaptureStream>, device_id: String) -> Self {
        Self { inner, device_id }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn format(&self) -> watch::Receiver<StreamFormat> {
        self.inner.format()
    }

    pub fn controls(&self) -> Arc<dyn TrackControls> {
        self.inner.controls()
    }

    /// Fresh receivers for a decode engine
    pub fn engine_source(&self) -> EngineSource {
        EngineSource {
            format: self.inner.format(),
            frames: self.inner.frames(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.is_live()
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

/// Camera acquisition and release for one scan session
pub struct CaptureController {
    backend: Arc<dyn CaptureBackend>,
    devices: Vec<DeviceDescriptor>,
    stream: Option<ActiveStream>,
    viewport: Viewport,
    orientation: Orientation,
    constraints_stale: bool,
    tiers: [CaptureConstraints; 2],
}

impl CaptureController {
    /// Create a controller and enumerate devices once.
    ///
    /// The descriptor set is immutable for the life of the session.
    pub fn new(backend: Arc<dyn CaptureBackend>, viewport: Viewport) -> Self {
        let devices = backend.enumerate_devices();
        let orientation = viewport.orientation();
        info!(
            count = devices.len(),
            orientation = %orientation,
            "Capture devices enumerated"
        );

        Self {
            backend,
            devices,
            stream: None,
            viewport,
            orientation,
            constraints_stale: false,
            tiers: CaptureConstraints::tiers(orientation),
        }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn stream(&self) -> Option<&ActiveStream> {
        self.stream.as_ref()
    }

    /// Note a viewport change.
    ///
    /// An orientation flip schedules a constraint recomputation for the next
    /// acquisition; it never restarts the current stream.
    pub fn update_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        let orientation = viewport.orientation();
        if orientation != self.orientation {
            debug!(from = %self.orientation, to = %orientation, "Orientation changed");
            self.orientation = orientation;
            self.constraints_stale = true;
        }
    }

    /// Acquire a stream, walking the constraint tiers.
    ///
    /// Any previously held stream is released first, so at most one stream
    /// exists at any point. With no `device_id`, the first enumerated device
    /// is used.
    pub async fn acquire(&mut self, device_id: Option<&str>) -> ScanResult<()> {
        self.release();

        if self.constraints_stale {
            self.tiers = CaptureConstraints::tiers(self.orientation);
            self.constraints_stale = false;
            debug!(orientation = %self.orientation, "Constraints recomputed");
        }

        let device = self.select_device(device_id)?;

        let mut last_err: Option<BackendError> = None;
        for constraints in self.tiers.clone() {
            info!(
                device = %device.label,
                tier = ?constraints.tier,
                "Requesting capture stream"
            );

            let backend = Arc::clone(&self.backend);
            let open_device = device.clone();
            let open_constraints = constraints.clone();
            let opened = tokio::task::spawn_blocking(move || {
                backend.open(&open_device, &open_constraints)
            })
            .await
            .unwrap_or_else(|e| Err(BackendError::Other(e.to_string())));

            match opened {
                Ok(stream) => {
                    self.stream = Some(ActiveStream::new(stream, device.id.clone()));
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        device = %device.label,
                        tier = ?constraints.tier,
                        error = %e,
                        "Capture request failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(ScanError::CameraUnavailable(last_err.unwrap_or_else(|| {
            BackendError::Other("no constraint tier accepted".to_string())
        })))
    }

    /// Stop every track on the current stream. Safe to call when no stream
    /// is held.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!(device = %stream.device_id(), "Releasing capture stream");
            drop(stream);
        }
    }

    /// Release the current stream and acquire the given device.
    ///
    /// Atomic from the caller's perspective: there is no observable state
    /// holding two streams. On failure no stream is held.
    pub async fn switch_device(&mut self, device_id: &str) -> ScanResult<()> {
        info!(device = device_id, "Switching capture device");
        self.acquire(Some(device_id)).await
    }

    fn select_device(&self, device_id: Option<&str>) -> ScanResult<DeviceDescriptor> {
        let device = match device_id {
            Some(id) => self.devices.iter().find(|d| d.id == id),
            None => self.devices.first(),
        };
        device.cloned().ok_or_else(|| {
            ScanError::CameraUnavailable(BackendError::DeviceNotFound(
                device_id.unwrap_or("<default>").to_string(),
            ))
        })
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.release();
    }
}
