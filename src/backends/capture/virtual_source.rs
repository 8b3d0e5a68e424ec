// SPDX-License-Identifier: GPL-3.0-only

//! Virtual capture backend
//!
//! A deterministic frame source for tests and demos: renders a blank field,
//! an image file, or a synthetic EAN-8 test pattern at a steady cadence.
//! Failure modes (tier rejection, open failure, delayed format negotiation,
//! dead frame channels) are injectable, and every open/stop is counted so
//! the test suite can assert the acquire/release balance.

use super::constraints::{CaptureConstraints, ConstraintTier};
use super::types::{
    BackendError, BackendResult, DeviceDescriptor, FocusMode, StreamFormat, TrackCapabilities,
    VideoFrame,
};
use super::{CaptureBackend, CaptureStream, TrackControls};
use crate::engines::scanline;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Counts stream opens and stops for leak assertions
#[derive(Debug, Default)]
pub struct CaptureCounters {
    opens: AtomicUsize,
    stops: AtomicUsize,
}

impl CaptureCounters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Streams currently held: opens minus stops
    pub fn live(&self) -> isize {
        self.opens() as isize - self.stops() as isize
    }
}

/// What the virtual sensor shows
#[derive(Debug, Clone)]
pub enum TestPattern {
    /// Uniform gray field; nothing to decode
    Blank,
    /// A rendered EAN-8 barcode band carrying the given 8-digit code
    Ean8(String),
    /// An image file loaded through the `image` crate
    Image(PathBuf),
}

/// Virtual capture backend
pub struct VirtualBackend {
    devices: Vec<DeviceDescriptor>,
    pattern: TestPattern,
    counters: Arc<CaptureCounters>,
    reject_preferred: bool,
    fail_all: Option<BackendError>,
    negotiation_delay: Option<Duration>,
    dead_air: bool,
    silent: bool,
    frame_interval: Duration,
    torch: bool,
    manual_focus: bool,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceDescriptor {
                id: "virtual-0".to_string(),
                label: "Virtual Camera".to_string(),
            }],
            pattern: TestPattern::Blank,
            counters: Arc::new(CaptureCounters::default()),
            reject_preferred: false,
            fail_all: None,
            negotiation_delay: None,
            dead_air: false,
            silent: false,
            frame_interval: Duration::from_millis(33),
            torch: true,
            manual_focus: true,
        }
    }

    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_device(mut self, id: &str, label: &str) -> Self {
        self.devices.push(DeviceDescriptor {
            id: id.to_string(),
            label: label.to_string(),
        });
        self
    }

    pub fn without_devices(mut self) -> Self {
        self.devices.clear();
        self
    }

    /// Reject the preferred constraint tier, forcing the baseline fallback
    pub fn reject_preferred_tier(mut self) -> Self {
        self.reject_preferred = true;
        self
    }

    /// Fail every open attempt with the given error
    pub fn fail_with(mut self, err: BackendError) -> Self {
        self.fail_all = Some(err);
        self
    }

    /// Delay format negotiation; `None` dimensions stay zero until then
    pub fn with_negotiation_delay(mut self, delay: Duration) -> Self {
        self.negotiation_delay = Some(delay);
        self
    }

    /// Open streams whose frame channel is already closed and whose format
    /// never settles
    pub fn dead_air(mut self) -> Self {
        self.dead_air = true;
        self
    }

    /// Open streams that negotiate a format but never deliver a frame
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn without_torch(mut self) -> Self {
        self.torch = false;
        self
    }

    pub fn without_manual_focus(mut self) -> Self {
        self.manual_focus = false;
        self
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    fn sensor_dimensions(constraints: &CaptureConstraints) -> (u32, u32) {
        if constraints.width.ideal < constraints.height.ideal {
            (480, 640)
        } else {
            (640, 480)
        }
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for VirtualBackend {
    fn is_available(&self) -> bool {
        true
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        constraints: &CaptureConstraints,
    ) -> BackendResult<Box<dyn CaptureStream>> {
        if let Some(err) = &self.fail_all {
            return Err(err.clone());
        }
        if self.reject_preferred && constraints.tier == ConstraintTier::Preferred {
            return Err(BackendError::FormatNotSupported(
                "preferred tier rejected".to_string(),
            ));
        }
        if !self.devices.iter().any(|d| d.id == device.id) {
            return Err(BackendError::DeviceNotFound(device.id.clone()));
        }

        let (width, height) = Self::sensor_dimensions(constraints);
        let frame = render_pattern(&self.pattern, width, height)?;

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        info!(device = %device.label, width, height, "Virtual stream opened");

        let (format_tx, _) = watch::channel(StreamFormat::default());
        let (frames_tx, _) = broadcast::channel(crate::constants::FRAME_CHANNEL_CAPACITY);

        let mut task = None;
        if self.dead_air {
            // Leave the format at zero and close the frame channel right
            // away: subscribers observe a defunct source.
        } else {
            match self.negotiation_delay {
                Some(delay) => {
                    let format_tx = format_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = format_tx.send(StreamFormat::new(width, height, 30));
                    });
                }
                None => {
                    let _ = format_tx.send(StreamFormat::new(width, height, 30));
                }
            }

            if !self.silent {
                let frames_tx = frames_tx.clone();
                let interval = self.frame_interval;
                task = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        // Receivers come and go; a send with no subscribers is fine
                        let _ = frames_tx.send(Arc::new(VideoFrame {
                            captured_at: std::time::Instant::now(),
                            ..(*frame).clone()
                        }));
                    }
                }));
            }
        }

        let controls = Arc::new(VirtualControls::new(TrackCapabilities {
            torch: self.torch,
            focus_modes: if self.manual_focus {
                vec![FocusMode::Continuous, FocusMode::Manual]
            } else {
                vec![FocusMode::Continuous]
            },
        }));

        Ok(Box::new(VirtualStream {
            format_tx,
            frames_tx: if self.dead_air { None } else { Some(frames_tx) },
            controls,
            task,
            counters: Arc::clone(&self.counters),
            stopped: false,
        }))
    }
}

/// Pre-render the pattern frame shared by every tick
fn render_pattern(
    pattern: &TestPattern,
    width: u32,
    height: u32,
) -> BackendResult<Arc<VideoFrame>> {
    match pattern {
        TestPattern::Blank => Ok(Arc::new(VideoFrame::gray(
            width,
            height,
            vec![200u8; (width * height) as usize],
        ))),
        TestPattern::Ean8(code) => {
            let modules = scanline::encode_ean8(code).ok_or_else(|| {
                BackendError::Other(format!("not a valid EAN-8 payload: {}", code))
            })?;
            let module_px = ((width as f32 * 0.8) / modules.len() as f32).floor() as u32;
            if module_px == 0 {
                return Err(BackendError::FormatNotSupported(
                    "sensor too narrow for the test pattern".to_string(),
                ));
            }
            let band_px = modules.len() as u32 * module_px;
            let quiet_px = (width - band_px) / 2;
            let mut row = scanline::render_modules(&modules, module_px, quiet_px);
            // Rounding can leave the row one pixel short of the sensor width
            row.resize(width as usize, 255);

            let mut data = Vec::with_capacity((width * height) as usize);
            let band = (height / 3)..(height * 2 / 3);
            for y in 0..height {
                if band.contains(&y) {
                    data.extend_from_slice(&row[..width as usize]);
                } else {
                    data.extend(std::iter::repeat_n(235u8, width as usize));
                }
            }
            Ok(Arc::new(VideoFrame::gray(width, height, data)))
        }
        TestPattern::Image(path) => {
            let img = image::open(path)
                .map_err(|e| BackendError::Other(format!("cannot load {}: {}", path.display(), e)))?;
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            Ok(Arc::new(VideoFrame::rgba(w, h, rgba.into_raw())))
        }
    }
}

struct VirtualStream {
    format_tx: watch::Sender<StreamFormat>,
    frames_tx: Option<broadcast::Sender<Arc<VideoFrame>>>,
    controls: Arc<VirtualControls>,
    task: Option<tokio::task::JoinHandle<()>>,
    counters: Arc<CaptureCounters>,
    stopped: bool,
}

impl CaptureStream for VirtualStream {
    fn format(&self) -> watch::Receiver<StreamFormat> {
        self.format_tx.subscribe()
    }

    fn frames(&self) -> broadcast::Receiver<Arc<VideoFrame>> {
        match &self.frames_tx {
            Some(tx) => tx.subscribe(),
            None => {
                // Dead-air stream: hand out a receiver whose sender is gone
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    fn controls(&self) -> Arc<dyn TrackControls> {
        Arc::clone(&self.controls) as Arc<dyn TrackControls>
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.frames_tx = None;
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        debug!("Virtual stream stopped");
    }

    fn is_live(&self) -> bool {
        !self.stopped
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Control port recording the requested torch/focus state
pub struct VirtualControls {
    caps: TrackCapabilities,
    torch_on: AtomicBool,
    focus_mode: Mutex<FocusMode>,
}

impl VirtualControls {
    pub fn new(caps: TrackCapabilities) -> Self {
        Self {
            caps,
            torch_on: AtomicBool::new(false),
            focus_mode: Mutex::new(FocusMode::Continuous),
        }
    }

    pub fn torch_on(&self) -> bool {
        self.torch_on.load(Ordering::SeqCst)
    }

    pub fn focus_mode(&self) -> FocusMode {
        *self.focus_mode.lock().expect("focus mode lock")
    }
}

impl TrackControls for VirtualControls {
    fn capabilities(&self) -> TrackCapabilities {
        self.caps.clone()
    }

    fn set_torch(&self, on: bool) -> BackendResult<()> {
        if !self.caps.torch {
            return Err(BackendError::Other("track has no torch".to_string()));
        }
        self.torch_on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn set_focus_mode(&self, mode: FocusMode) -> BackendResult<()> {
        if !self.caps.focus_modes.contains(&mode) {
            warn!(?mode, "Focus mode not advertised by virtual track");
            return Err(BackendError::Other(
                "focus mode not supported".to_string(),
            ));
        }
        *self.focus_mode.lock().expect("focus mode lock") = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::capture::types::Orientation;

    fn constraints() -> CaptureConstraints {
        CaptureConstraints::baseline(Orientation::Landscape)
    }

    #[tokio::test]
    async fn open_and_stop_balance_counters() {
        let backend = VirtualBackend::new();
        let counters = backend.counters();
        let device = backend.enumerate_devices().remove(0);

        let mut stream = backend.open(&device, &constraints()).expect("opens");
        assert_eq!(counters.live(), 1);

        stream.stop();
        stream.stop(); // idempotent
        assert_eq!(counters.live(), 0);
        assert_eq!(counters.stops(), 1);
    }

    #[tokio::test]
    async fn barcode_pattern_produces_decodable_frames() {
        let backend =
            VirtualBackend::new().with_pattern(TestPattern::Ean8("12345670".to_string()));
        let device = backend.enumerate_devices().remove(0);
        let stream = backend.open(&device, &constraints()).expect("opens");

        let mut frames = stream.frames();
        let frame = frames.recv().await.expect("frame");
        let luma = crate::engines::frame_to_luma(&frame);
        let mid = luma.row(luma.height / 2);
        let hit = scanline::decode_row(mid, &[scanline::Symbology::Ean8]).expect("decodes");
        assert_eq!(hit.text, "12345670");
    }

    #[tokio::test]
    async fn preferred_tier_rejection_spares_baseline() {
        let backend = VirtualBackend::new().reject_preferred_tier();
        let device = backend.enumerate_devices().remove(0);

        let preferred = CaptureConstraints::preferred(Orientation::Landscape);
        assert!(backend.open(&device, &preferred).is_err());
        assert!(backend.open(&device, &constraints()).is_ok());
    }

    #[tokio::test]
    async fn dead_air_stream_has_closed_frames() {
        let backend = VirtualBackend::new().dead_air();
        let device = backend.enumerate_devices().remove(0);
        let stream = backend.open(&device, &constraints()).expect("opens");

        let mut frames = stream.frames();
        assert!(matches!(
            frames.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
        assert!(!stream.format().borrow().is_ready());
    }
}
