// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 capture backend
//!
//! Opens Linux camera devices through the `v4l` crate, negotiates a
//! convertible pixel format (YUYV, GREY or MJPG), and runs a dedicated
//! capture thread that converts every buffer to luma before fan-out.
//! Torch control goes through the sysfs flash LED interface; focus modes
//! map onto the V4L2 camera-class controls.

use super::constraints::{CaptureConstraints, ConstraintTier};
use super::types::{
    BackendError, BackendResult, DeviceDescriptor, FocusMode, StreamFormat, TrackCapabilities,
    VideoFrame,
};
use super::{CaptureBackend, CaptureStream, TrackControls};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

// V4L2 control ids (linux/v4l2-controls.h)
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;

// V4L2_CID_EXPOSURE_AUTO menu values
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Pixel formats the capture thread can convert to luma, in preference order
const CONVERTIBLE_FOURCCS: [&[u8; 4]; 3] = [b"YUYV", b"GREY", b"MJPG"];

/// V4L2 capture backend
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for V4l2Backend {
    fn is_available(&self) -> bool {
        !v4l::context::enum_devices().is_empty()
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<DeviceDescriptor> = v4l::context::enum_devices()
            .iter()
            .map(|node| DeviceDescriptor {
                id: node.path().to_string_lossy().to_string(),
                label: node
                    .name()
                    .unwrap_or_else(|| format!("Camera {}", node.index())),
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        constraints: &CaptureConstraints,
    ) -> BackendResult<Box<dyn CaptureStream>> {
        let dev = Device::with_path(&device.id)?;

        let format = negotiate_format(&dev, constraints)?;
        info!(
            device = %device.label,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "V4L2 format negotiated"
        );

        if let Some(fps) = constraints.framerate {
            // Frame rate is a hint; drivers that reject it keep their default
            if let Err(e) = dev.set_params(&v4l::video::capture::Parameters::with_fps(fps)) {
                debug!(error = %e, "Driver rejected frame rate hint");
            }
        }

        let controls = Arc::new(V4l2Controls::probe(&device.id)?);
        if constraints.continuous_focus {
            if let Err(e) = controls.set_focus_mode(FocusMode::Continuous) {
                debug!(error = %e, "Continuous focus request not honored");
            }
        }

        let (format_tx, _) = watch::channel(StreamFormat::default());
        let _ = format_tx.send(StreamFormat::new(
            format.width,
            format.height,
            constraints.framerate.unwrap_or(30),
        ));
        let (frames_tx, _) =
            broadcast::channel::<Arc<VideoFrame>>(crate::constants::FRAME_CHANNEL_CAPACITY);

        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_capture_thread(
            dev,
            format,
            frames_tx.clone(),
            Arc::clone(&stop),
            device.label.clone(),
        );

        Ok(Box::new(V4l2Stream {
            format_tx,
            frames_tx: Some(frames_tx),
            controls,
            thread: Some(thread),
            stop,
            stopped: false,
        }))
    }
}

/// Ask the driver for each convertible fourcc until one sticks
fn negotiate_format(dev: &Device, constraints: &CaptureConstraints) -> BackendResult<Format> {
    let mut last_err: Option<BackendError> = None;

    for fourcc in CONVERTIBLE_FOURCCS {
        let wanted = Format::new(
            constraints.width.ideal,
            constraints.height.ideal,
            FourCC::new(fourcc),
        );
        match dev.set_format(&wanted) {
            Ok(actual) => {
                if actual.fourcc != FourCC::new(fourcc) {
                    continue;
                }
                // The preferred tier carries hard lower bounds; baseline
                // accepts whatever the driver offers
                if constraints.tier == ConstraintTier::Preferred
                    && (actual.width < constraints.width.min
                        || actual.height < constraints.height.min)
                {
                    last_err = Some(BackendError::FormatNotSupported(format!(
                        "driver offered {}x{}",
                        actual.width, actual.height
                    )));
                    continue;
                }
                return Ok(actual);
            }
            Err(e) => last_err = Some(e.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        BackendError::FormatNotSupported("no convertible pixel format".to_string())
    }))
}

/// Run the capture loop on a dedicated thread.
///
/// The loop owns the device; control requests go through a second handle on
/// the same node.
fn spawn_capture_thread(
    dev: Device,
    format: Format,
    frames_tx: broadcast::Sender<Arc<VideoFrame>>,
    stop: Arc<AtomicBool>,
    label: String,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        debug!(device = %label, "Capture thread started");

        let mut stream = match MmapStream::with_buffers(&dev, Type::VideoCapture, 4) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(device = %label, error = %e, "Capture stream initialization failed");
                return;
            }
        };

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let (buf, _meta) = match stream.next() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(device = %label, error = %e, "Capture read failed");
                    break;
                }
            };

            match buffer_to_luma(&format, buf) {
                Some(luma) => {
                    // Send with no subscribers just means nobody is watching yet
                    let _ = frames_tx.send(Arc::new(VideoFrame::gray(
                        format.width,
                        format.height,
                        luma,
                    )));
                }
                None => debug!(device = %label, "Dropped unconvertible buffer"),
            }
        }

        debug!(device = %label, "Capture thread exiting");
    })
}

/// Convert a raw capture buffer to tightly-packed luma
fn buffer_to_luma(format: &Format, buf: &[u8]) -> Option<Vec<u8>> {
    let pixels = (format.width * format.height) as usize;
    match &format.fourcc.repr {
        b"YUYV" => {
            // Packed 4:2:2 — every even byte is a luma sample
            if buf.len() < pixels * 2 {
                return None;
            }
            Some(buf.iter().step_by(2).take(pixels).copied().collect())
        }
        b"GREY" => {
            if buf.len() < pixels {
                return None;
            }
            Some(buf[..pixels].to_vec())
        }
        b"MJPG" => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
            .ok()
            .map(|img| img.to_luma8().into_raw()),
        _ => None,
    }
}

struct V4l2Stream {
    format_tx: watch::Sender<StreamFormat>,
    frames_tx: Option<broadcast::Sender<Arc<VideoFrame>>>,
    controls: Arc<V4l2Controls>,
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    stopped: bool,
}

impl CaptureStream for V4l2Stream {
    fn format(&self) -> watch::Receiver<StreamFormat> {
        self.format_tx.subscribe()
    }

    fn frames(&self) -> broadcast::Receiver<Arc<VideoFrame>> {
        match &self.frames_tx {
            Some(tx) => tx.subscribe(),
            None => {
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
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
        self.frames_tx = None;
        // Leave the torch off when the track goes away
        let _ = self.controls.set_torch(false);
        debug!("V4L2 stream stopped");
    }

    fn is_live(&self) -> bool {
        !self.stopped
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Control port over a second handle on the device node
struct V4l2Controls {
    device: Mutex<Device>,
    caps: TrackCapabilities,
    flash: Vec<FlashLed>,
}

impl V4l2Controls {
    fn probe(path: &str) -> BackendResult<Self> {
        let device = Device::with_path(path)?;

        let has_focus_control = device
            .query_controls()
            .map(|controls| controls.iter().any(|c| c.id == CID_FOCUS_AUTO))
            .unwrap_or(false);

        let flash = FlashLed::discover();

        let mut focus_modes = vec![FocusMode::Continuous];
        if has_focus_control {
            focus_modes.push(FocusMode::Manual);
        }

        let caps = TrackCapabilities {
            torch: !flash.is_empty(),
            focus_modes,
        };
        debug!(
            torch = caps.torch,
            manual_focus = has_focus_control,
            "V4L2 track capabilities probed"
        );

        Ok(Self {
            device: Mutex::new(device),
            caps,
            flash,
        })
    }
}

impl TrackControls for V4l2Controls {
    fn capabilities(&self) -> TrackCapabilities {
        self.caps.clone()
    }

    fn set_torch(&self, on: bool) -> BackendResult<()> {
        if self.flash.is_empty() {
            return Err(BackendError::Other("no flash LED on this track".to_string()));
        }
        for led in &self.flash {
            led.set(on)?;
        }
        Ok(())
    }

    fn set_focus_mode(&self, mode: FocusMode) -> BackendResult<()> {
        if !self.caps.focus_modes.contains(&mode) {
            return Err(BackendError::Other(format!(
                "focus mode {:?} not supported",
                mode
            )));
        }
        let device = self.device.lock().map_err(|_| {
            BackendError::Other("control device lock poisoned".to_string())
        })?;

        let (focus_auto, exposure, awb) = match mode {
            FocusMode::Continuous => (true, EXPOSURE_APERTURE_PRIORITY, true),
            FocusMode::Manual => (false, EXPOSURE_MANUAL, false),
        };

        device.set_control(Control {
            id: CID_FOCUS_AUTO,
            value: Value::Boolean(focus_auto),
        })?;

        // Exposure and white balance follow the focus mode where the
        // hardware exposes them
        if let Err(e) = device.set_control(Control {
            id: CID_EXPOSURE_AUTO,
            value: Value::Integer(exposure),
        }) {
            debug!(error = %e, "Exposure mode not applied");
        }
        if let Err(e) = device.set_control(Control {
            id: CID_AUTO_WHITE_BALANCE,
            value: Value::Boolean(awb),
        }) {
            debug!(error = %e, "White balance mode not applied");
        }

        Ok(())
    }
}

/// A writable flash LED discovered under `/sys/class/leds/*:flash`
struct FlashLed {
    path: PathBuf,
    max_brightness: u32,
    name: String,
}

impl FlashLed {
    /// Scan sysfs for flash LEDs we can actually write to
    fn discover() -> Vec<FlashLed> {
        let leds_dir = Path::new("/sys/class/leds");
        let Ok(entries) = std::fs::read_dir(leds_dir) else {
            return Vec::new();
        };

        let mut leds = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name_str) = name.to_str() else {
                continue;
            };
            if !name_str.ends_with(":flash") {
                continue;
            }

            let led_path = entry.path();
            let max_brightness = std::fs::read_to_string(led_path.join("max_brightness"))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .filter(|&v| v > 0);
            let Some(max_brightness) = max_brightness else {
                continue;
            };

            // Writability check up front so set_torch failures mean
            // hardware trouble, not permissions
            if std::fs::OpenOptions::new()
                .write(true)
                .open(led_path.join("brightness"))
                .is_err()
            {
                warn!(led = name_str, "Flash LED found but not writable");
                continue;
            }

            info!(led = name_str, max_brightness, "Discovered flash LED");
            leds.push(FlashLed {
                path: led_path,
                max_brightness,
                name: name_str.to_string(),
            });
        }

        leds.sort_by(|a, b| a.name.cmp(&b.name));
        leds
    }

    fn set(&self, on: bool) -> io::Result<()> {
        let value = if on { self.max_brightness } else { 0 };
        std::fs::write(self.path.join("brightness"), value.to_string())
    }
}
