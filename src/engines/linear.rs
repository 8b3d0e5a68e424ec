// SPDX-License-Identifier: GPL-3.0-only

//! Specialized linear-barcode engine
//!
//! Renders the shared camera feed onto a dedicated off-screen surface and
//! runs dense scanline passes over it. The reader set and the number of
//! parallel decode workers are tuned by device class. Confidence is the
//! number of scanlines agreeing on one payload; quality is the mean
//! per-symbol pattern error across those scanlines.

use super::scanline::{self, RowHit, Symbology};
use super::{
    DetectionEvent, EngineKind, EngineProfile, EngineSource, LumaImage, downscale_luma,
    fit_to_budget, frame_to_luma,
};
use crate::constants::{
    DECODE_INTERVAL, DECODE_MAX_DIMENSION, SCANLINE_ROW_STRIDE, SURFACE_READY_ATTEMPTS,
    SURFACE_READY_INTERVAL,
};
use crate::errors::{ScanError, ScanResult};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Fixed-size render target the engine draws camera frames onto.
///
/// The surface must have non-zero dimensions before the engine can
/// initialize; its size is derived from the negotiated stream format
/// clamped to the decode budget.
#[derive(Debug, Clone, Copy)]
struct RenderSurface {
    width: u32,
    height: u32,
}

impl RenderSurface {
    fn from_format(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let (w, h) = fit_to_budget(width, height, DECODE_MAX_DIMENSION);
        Some(Self {
            width: w,
            height: h,
        })
    }

    /// Draw a frame onto the surface, rescaling when needed
    fn render(&self, luma: LumaImage) -> LumaImage {
        if luma.width == self.width && luma.height == self.height {
            luma
        } else {
            downscale_luma(&luma, self.width, self.height)
        }
    }
}

/// Specialized linear-barcode engine
pub struct LinearEngine {
    profile: EngineProfile,
    stop: Option<Arc<AtomicBool>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl LinearEngine {
    pub fn new(profile: EngineProfile) -> Self {
        Self {
            profile,
            stop: None,
            handle: None,
        }
    }
}

impl super::DecodeEngine for LinearEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Linear
    }

    fn start(
        &mut self,
        source: EngineSource,
        events: mpsc::Sender<DetectionEvent>,
    ) -> BoxFuture<'_, ScanResult<()>> {
        Box::pin(async move {
            if self.is_running() {
                return Err(ScanError::Other("linear engine already running".into()));
            }

            // The surface needs real dimensions before workers can start;
            // drivers may only settle the format after the first frame.
            let mut attempts = 0u32;
            let surface = loop {
                let format = *source.format.borrow();
                if let Some(surface) = RenderSurface::from_format(format.width, format.height) {
                    break surface;
                }
                attempts += 1;
                if attempts >= SURFACE_READY_ATTEMPTS {
                    warn!(attempts, "Render surface never became ready");
                    return Err(ScanError::ScannerSurfaceUnready { attempts });
                }
                tokio::time::sleep(SURFACE_READY_INTERVAL).await;
            };

            debug!(
                engine = %EngineKind::Linear,
                surface_width = surface.width,
                surface_height = surface.height,
                profile = %self.profile,
                "Decode engine started"
            );

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = Arc::clone(&stop);
            let profile = self.profile;
            let handle = tokio::spawn(async move {
                decode_loop(source, events, stop_clone, surface, profile).await;
            });

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
            debug!(engine = %EngineKind::Linear, "Decode engine stopped");
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
    surface: RenderSurface,
    profile: EngineProfile,
) {
    let readers = profile.linear_readers();
    let workers = profile.worker_count();
    let mut last_attempt = Instant::now() - DECODE_INTERVAL;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let frame = match source.frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(skipped, "Linear engine lagged behind capture");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Frame source closed, linear engine exiting");
                break;
            }
        };

        if last_attempt.elapsed() < DECODE_INTERVAL {
            continue;
        }
        last_attempt = Instant::now();

        let rendered = {
            let surface = surface;
            let frame = Arc::clone(&frame);
            tokio::task::spawn_blocking(move || surface.render(frame_to_luma(&frame)))
                .await
        };
        let Ok(rendered) = rendered else {
            warn!("Linear render task panicked");
            continue;
        };

        let hits = scan_surface(Arc::new(rendered), readers, workers).await;

        for event in aggregate(hits) {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let _ = events.try_send(event);
        }
    }
}

/// Run the scanline passes, fanned out over the worker budget
async fn scan_surface(
    luma: Arc<LumaImage>,
    readers: &'static [Symbology],
    workers: usize,
) -> Vec<RowHit> {
    let rows: Vec<u32> = (0..luma.height).step_by(SCANLINE_ROW_STRIDE as usize).collect();
    if rows.is_empty() {
        return Vec::new();
    }

    let chunk_len = rows.len().div_ceil(workers.max(1));
    let tasks: Vec<_> = rows
        .chunks(chunk_len)
        .map(|chunk| {
            let luma = Arc::clone(&luma);
            let chunk = chunk.to_vec();
            tokio::task::spawn_blocking(move || {
                chunk
                    .into_iter()
                    .filter_map(|y| scanline::decode_row(luma.row(y), readers))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut hits = Vec::new();
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(chunk_hits) => hits.extend(chunk_hits),
            Err(e) => warn!(error = %e, "Linear decode worker panicked"),
        }
    }
    hits
}

/// Collapse per-row hits into one event per distinct payload.
///
/// Agreement count and mean error are the confidence/quality pair the
/// reconciliation thresholds are written against.
fn aggregate(hits: Vec<RowHit>) -> Vec<DetectionEvent> {
    let mut groups: HashMap<String, (u32, f32)> = HashMap::new();
    for hit in hits {
        let entry = groups.entry(hit.text).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += hit.error;
    }

    groups
        .into_iter()
        .map(|(text, (count, err_sum))| {
            let mean_error = err_sum / count as f32;
            trace!(text = %text, agreement = count, mean_error, "Linear payload aggregated");
            DetectionEvent::new(text, EngineKind::Linear, count as f32, mean_error)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::scanline::{encode_ean8, render_modules};

    #[test]
    fn aggregate_counts_agreement() {
        let hits = vec![
            RowHit {
                text: "12345670".into(),
                symbology: Symbology::Ean8,
                error: 0.1,
            },
            RowHit {
                text: "12345670".into(),
                symbology: Symbology::Ean8,
                error: 0.3,
            },
            RowHit {
                text: "99999999".into(),
                symbology: Symbology::Ean8,
                error: 0.05,
            },
        ];

        let mut events = aggregate(hits);
        events.sort_by(|a, b| a.raw_text.cmp(&b.raw_text));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].confidence, 2.0);
        assert!((events[0].quality - 0.2).abs() < 1e-5);
        assert_eq!(events[1].confidence, 1.0);
    }

    #[test]
    fn surface_requires_nonzero_dimensions() {
        assert!(RenderSurface::from_format(0, 480).is_none());
        assert!(RenderSurface::from_format(640, 0).is_none());
        let surface = RenderSurface::from_format(1920, 1080).expect("sized");
        assert!(surface.width <= DECODE_MAX_DIMENSION);
        assert!(surface.height <= DECODE_MAX_DIMENSION);
    }

    #[tokio::test]
    async fn scan_surface_reads_barcode_band() {
        let modules = encode_ean8("12345670").expect("valid code");
        let row = render_modules(&modules, 3, 20);
        let width = row.len() as u32;
        let mut data = Vec::new();
        for _ in 0..64 {
            data.extend_from_slice(&row);
        }
        let luma = LumaImage {
            width,
            height: 64,
            data,
        };

        let readers = EngineProfile::Constrained.linear_readers();
        let hits = scan_surface(Arc::new(luma), readers, 2).await;
        // One hit per sampled row, all agreeing
        assert!(hits.len() >= 4);
        assert!(hits.iter().all(|h| h.text == "12345670"));
    }
}
