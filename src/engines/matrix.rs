// SPDX-License-Identifier: GPL-3.0-only

//! General-purpose multi-symbology decode engine
//!
//! Attaches directly to the live frame fan-out and decodes a broad
//! symbology set: QR matrix codes via `rqrr` plus linear scanline passes.
//! Frames are downscaled to the decode budget and processed on the blocking
//! pool so the async runtime stays responsive.

use super::scanline::{self, Symbology};
use super::{
    DetectionEvent, EngineKind, EngineSource, LumaImage, downscale_luma, fit_to_budget,
    frame_to_luma,
};
use crate::backends::capture::types::VideoFrame;
use crate::constants::{DECODE_INTERVAL, DECODE_MAX_DIMENSION};
use crate::errors::{ScanError, ScanResult};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Broad reader set for the linear passes of this engine
const BROAD_READERS: [Symbology; 4] = [
    Symbology::Ean13,
    Symbology::UpcA,
    Symbology::Ean8,
    Symbology::Code39,
];

/// Fractions of the frame height sampled by the linear passes
const LINEAR_ROW_FRACTIONS: [f32; 5] = [0.3, 0.4, 0.5, 0.6, 0.7];

/// General-purpose multi-symbology engine
pub struct MatrixEngine {
    stop: Option<Arc<AtomicBool>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MatrixEngine {
    pub fn new() -> Self {
        Self {
            stop: None,
            handle: None,
        }
    }
}

impl Default for MatrixEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl super::DecodeEngine for MatrixEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Matrix
    }

    fn start(
        &mut self,
        mut source: EngineSource,
        events: mpsc::Sender<DetectionEvent>,
    ) -> BoxFuture<'_, ScanResult<()>> {
        Box::pin(async move {
            if self.is_running() {
                return Err(ScanError::Other("matrix engine already running".into()));
            }

            // Attaching to a dead frame source is an initialization failure,
            // not a decode error
            if matches!(
                source.frames.try_recv(),
                Err(broadcast::error::TryRecvError::Closed)
            ) {
                return Err(ScanError::Other("frame source closed".into()));
            }

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = Arc::clone(&stop);
            let handle = tokio::spawn(async move {
                decode_loop(source, events, stop_clone).await;
            });

            debug!(engine = %EngineKind::Matrix, "Decode engine started");
            self.stop = Some(stop);
            self.handle = Some(handle);
            Ok(())
        })
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(engine = %EngineKind::Matrix, "Decode engine stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

async fn decode_loop(
    mut source: EngineSource,
    events: mpsc::Sender<DetectionEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut last_attempt = Instant::now() - DECODE_INTERVAL;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let frame = match source.frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(skipped, "Matrix engine lagged behind capture");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Frame source closed, matrix engine exiting");
                break;
            }
        };

        // Keep a real-time cadence: drop frames arriving inside the window
        if last_attempt.elapsed() < DECODE_INTERVAL {
            continue;
        }
        last_attempt = Instant::now();

        let detections = tokio::task::spawn_blocking(move || decode_frame(&frame))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Matrix decode task panicked");
                Vec::new()
            });

        for event in detections {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            // Detection noise is droppable; never block the decode cadence
            let _ = events.try_send(event);
        }
    }
}

/// Synchronous frame decode (runs on the blocking pool)
fn decode_frame(frame: &VideoFrame) -> Vec<DetectionEvent> {
    let start = Instant::now();

    let luma = frame_to_luma(frame);
    let (w, h) = fit_to_budget(luma.width, luma.height, DECODE_MAX_DIMENSION);
    let luma = if (w, h) == (luma.width, luma.height) {
        luma
    } else {
        downscale_luma(&luma, w, h)
    };

    let mut detections = Vec::new();
    decode_matrix_codes(&luma, &mut detections);
    decode_linear_rows(&luma, &mut detections);

    if !detections.is_empty() {
        debug!(
            count = detections.len(),
            total_ms = start.elapsed().as_millis(),
            "Matrix engine found codes"
        );
    }

    detections
}

/// QR detection via rqrr; confidence counts the geometric result points
fn decode_matrix_codes(luma: &LumaImage, out: &mut Vec<DetectionEvent>) {
    let Some(img) =
        image::GrayImage::from_raw(luma.width, luma.height, luma.data.clone())
    else {
        warn!("Luma buffer did not match its dimensions");
        return;
    };

    let mut prepared = rqrr::PreparedImage::prepare(img);
    for grid in prepared.detect_grids() {
        let result_points = grid.bounds.len();
        match grid.decode() {
            Ok((_meta, content)) => {
                trace!(content = %content, result_points, "Decoded matrix code");
                out.push(DetectionEvent::new(
                    content,
                    EngineKind::Matrix,
                    result_points as f32,
                    0.0,
                ));
            }
            Err(e) => {
                // Per-frame decode noise; not surfaced
                trace!(error = %e, "Matrix grid failed to decode");
            }
        }
    }
}

/// Linear passes over a handful of rows; a symbol match yields the
/// two edge points of the scanline
fn decode_linear_rows(luma: &LumaImage, out: &mut Vec<DetectionEvent>) {
    for fraction in LINEAR_ROW_FRACTIONS {
        let y = ((luma.height as f32 * fraction) as u32).min(luma.height.saturating_sub(1));
        if let Some(hit) = scanline::decode_row(luma.row(y), &BROAD_READERS) {
            trace!(text = %hit.text, symbology = %hit.symbology, row = y, "Decoded linear code");
            out.push(DetectionEvent::new(
                hit.text,
                EngineKind::Matrix,
                2.0,
                0.0,
            ));
        }
    }
}
