// SPDX-License-Identifier: GPL-3.0-only

//! Pluggable decode engines
//!
//! Both decode pipelines implement one contract: given a live frame source,
//! produce a lazy, restartable sequence of [`DetectionEvent`]s until stopped.
//! Engine-specific configuration (reader sets, worker counts, per-device
//! tuning) stays behind the trait so the reconciliation logic never sees it.

pub mod linear;
pub mod matrix;
pub mod scanline;

pub use linear::LinearEngine;
pub use matrix::MatrixEngine;

use crate::backends::capture::types::{PixelFormat, StreamFormat, VideoFrame};
use crate::errors::ScanResult;
use futures::future::BoxFuture;
use self::scanline::Symbology;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Which pipeline produced a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// General-purpose multi-symbology engine (2D-capable)
    Matrix,
    /// Specialized linear-barcode engine
    Linear,
}

impl EngineKind {
    /// Whether this engine decodes 2D matrix symbologies.
    ///
    /// Normalization treats 2D sources differently: their payloads may embed
    /// the inventory code inside longer free-form text.
    pub fn is_two_dimensional(&self) -> bool {
        matches!(self, EngineKind::Matrix)
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Matrix => write!(f, "matrix"),
            EngineKind::Linear => write!(f, "linear"),
        }
    }
}

/// A single detection produced by a decode engine.
///
/// Events are ephemeral: generated continuously while scanning, consumed by
/// the reconciliation engine, never persisted.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    /// Raw decoded text, before normalization
    pub raw_text: String,
    /// Pipeline that produced the event
    pub source: EngineKind,
    /// Engine-specific confidence (matrix: geometric result points;
    /// linear: scanline agreement count)
    pub confidence: f32,
    /// Engine-specific quality (linear: mean per-symbol error; matrix: 0.0)
    pub quality: f32,
    /// Epoch milliseconds at detection time
    pub timestamp_ms: i64,
}

impl DetectionEvent {
    pub fn new(raw_text: String, source: EngineKind, confidence: f32, quality: f32) -> Self {
        Self {
            raw_text,
            source,
            confidence,
            quality,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Device class tuning for the linear engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineProfile {
    /// Full reader set, multiple parallel decode workers
    Standard,
    /// Reduced reader set, single decode worker (low-power devices)
    Constrained,
}

impl EngineProfile {
    /// Detect the profile from the host's available parallelism
    pub fn detect() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if cores < 4 {
            EngineProfile::Constrained
        } else {
            EngineProfile::Standard
        }
    }

    /// Parallel decode workers for the linear engine
    pub fn worker_count(&self) -> usize {
        match self {
            EngineProfile::Standard => 4,
            EngineProfile::Constrained => 1,
        }
    }

    /// Reader set for the linear engine
    pub fn linear_readers(&self) -> &'static [Symbology] {
        match self {
            EngineProfile::Standard => &[
                Symbology::Ean13,
                Symbology::UpcA,
                Symbology::Ean8,
                Symbology::Code39,
            ],
            EngineProfile::Constrained => &[Symbology::Ean13, Symbology::Ean8],
        }
    }
}

impl std::fmt::Display for EngineProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineProfile::Standard => write!(f, "standard"),
            EngineProfile::Constrained => write!(f, "constrained"),
        }
    }
}

/// Frame source handed to an engine at start.
///
/// Each engine gets its own receivers; the underlying stream is shared and
/// owned elsewhere.
pub struct EngineSource {
    /// Negotiated format; zero-sized until the backend settles
    pub format: watch::Receiver<StreamFormat>,
    /// Frame fan-out subscription
    pub frames: broadcast::Receiver<Arc<VideoFrame>>,
}

/// Decode engine contract.
///
/// `start` performs engine initialization (bounded, independently fallible)
/// and spawns the decode loop feeding `events`; `stop` synchronously halts
/// the loop. Engines are restartable: `start` may be called again after
/// `stop`.
pub trait DecodeEngine: Send {
    fn kind(&self) -> EngineKind;

    fn start(
        &mut self,
        source: EngineSource,
        events: mpsc::Sender<DetectionEvent>,
    ) -> BoxFuture<'_, ScanResult<()>>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

// ===== Shared luma helpers =====

/// A tightly-packed grayscale image used by the decode paths
#[derive(Debug, Clone)]
pub struct LumaImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl LumaImage {
    /// One pixel row
    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.width) as usize;
        &self.data[start..start + self.width as usize]
    }
}

/// Convert a capture frame to tightly-packed luma, dropping stride padding
pub fn frame_to_luma(frame: &VideoFrame) -> LumaImage {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let stride = frame.stride as usize;
    let mut data = Vec::with_capacity(width * height);

    match frame.format {
        PixelFormat::Gray8 => {
            for y in 0..height {
                let row_start = y * stride;
                let row_end = row_start + width;
                if row_end <= frame.data.len() {
                    data.extend_from_slice(&frame.data[row_start..row_end]);
                }
            }
        }
        PixelFormat::Rgba => {
            for y in 0..height {
                let row_start = y * stride;
                for x in 0..width {
                    let at = row_start + x * 4;
                    if at + 2 < frame.data.len() {
                        let r = frame.data[at] as u32;
                        let g = frame.data[at + 1] as u32;
                        let b = frame.data[at + 2] as u32;
                        // Integer BT.601 luma
                        data.push(((r * 299 + g * 587 + b * 114) / 1000) as u8);
                    }
                }
            }
        }
    }

    LumaImage {
        width: frame.width,
        height: (data.len() / width.max(1)) as u32,
        data,
    }
}

/// Downscale a luma image with bilinear interpolation
pub fn downscale_luma(src: &LumaImage, dst_width: u32, dst_height: u32) -> LumaImage {
    let src_width = src.width as usize;
    let src_height = src.height as usize;
    let mut data = Vec::with_capacity((dst_width * dst_height) as usize);

    let x_ratio = src_width as f32 / dst_width as f32;
    let y_ratio = src_height as f32 / dst_height as f32;

    for y in 0..dst_height {
        for x in 0..dst_width {
            let src_x = x as f32 * x_ratio;
            let src_y = y as f32 * y_ratio;

            let x0 = src_x as usize;
            let y0 = src_y as usize;
            let x1 = (x0 + 1).min(src_width - 1);
            let y1 = (y0 + 1).min(src_height - 1);

            let x_frac = src_x - x0 as f32;
            let y_frac = src_y - y0 as f32;

            let get = |px: usize, py: usize| -> f32 {
                src.data.get(py * src_width + px).copied().unwrap_or(0) as f32
            };

            let value = get(x0, y0) * (1.0 - x_frac) * (1.0 - y_frac)
                + get(x1, y0) * x_frac * (1.0 - y_frac)
                + get(x0, y1) * (1.0 - x_frac) * y_frac
                + get(x1, y1) * x_frac * y_frac;

            data.push(value as u8);
        }
    }

    LumaImage {
        width: dst_width,
        height: dst_height,
        data,
    }
}

/// Fit dimensions into the decode budget, preserving aspect ratio
pub fn fit_to_budget(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width <= max_dimension && height <= max_dimension {
        return (width, height);
    }
    let scale = (width as f32 / max_dimension as f32).max(height as f32 / max_dimension as f32);
    (
        ((width as f32 / scale) as u32).max(1),
        ((height as f32 / scale) as u32).max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_frame_strips_stride() {
        let data: Vec<u8> = vec![
            10, 20, 0, 0, // row 0 + padding
            30, 40, 0, 0, // row 1 + padding
        ];
        let frame = VideoFrame {
            width: 2,
            height: 2,
            data: Arc::from(data.into_boxed_slice()),
            format: PixelFormat::Gray8,
            stride: 4,
            captured_at: std::time::Instant::now(),
        };

        let luma = frame_to_luma(&frame);
        assert_eq!(luma.data, vec![10, 20, 30, 40]);
    }

    #[test]
    fn rgba_frame_converts_to_luma() {
        let frame = VideoFrame::rgba(2, 1, vec![255, 255, 255, 255, 0, 0, 0, 255]);
        let luma = frame_to_luma(&frame);
        assert_eq!(luma.width, 2);
        assert!(luma.data[0] > 250);
        assert_eq!(luma.data[1], 0);
    }

    #[test]
    fn budget_fit_preserves_aspect() {
        assert_eq!(fit_to_budget(640, 480, 640), (640, 480));
        let (w, h) = fit_to_budget(1920, 1080, 640);
        assert_eq!(w, 640);
        assert_eq!(h, 360);
    }

    #[test]
    fn downscale_averages_gradient() {
        let src = LumaImage {
            width: 4,
            height: 1,
            data: vec![0, 85, 170, 255],
        };
        let dst = downscale_luma(&src, 2, 1);
        assert_eq!(dst.data.len(), 2);
        assert!(dst.data[0] < 100);
        assert!(dst.data[1] > 120);
    }

    #[test]
    fn constrained_profile_is_single_worker() {
        assert_eq!(EngineProfile::Constrained.worker_count(), 1);
        assert!(EngineProfile::Constrained.linear_readers().len() < 4);
        assert_eq!(EngineProfile::Standard.worker_count(), 4);
    }
}
