// SPDX-License-Identifier: GPL-3.0-only

//! Scan session orchestration
//!
//! Wires the capture controller, both decode engines, the reconciliation
//! state machine and the normalizer into one lifecycle. The session run
//! loop is the single consumer of the detection channel, so the claim
//! transition is serialized here and a stop command can never race a late
//! detection into `on_scan`: the command arm of the select loop is biased
//! ahead of the event arm.

use crate::backends::capture::controller::CaptureController;
use crate::backends::capture::types::{BackendError, DeviceDescriptor, Viewport};
use crate::backends::capture::CaptureBackend;
use crate::capability::{CapabilityController, CapabilityFlags};
use crate::config::Config;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::engines::{
    DecodeEngine, DetectionEvent, LinearEngine, MatrixEngine,
};
use crate::errors::{ScanError, ScanResult};
use crate::normalize::{normalize, CanonicalCode};
use crate::reconcile::{Reconciler, Verdict};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Commands accepted by a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Abandon the session; `on_close` fires, no code is produced
    Stop,
    /// Release the current stream and scan on another device
    SwitchDevice(String),
    /// Toggle the torch LED
    ToggleTorch,
    /// Fire a momentary manual-focus pulse
    PulseManualFocus,
    /// Report a viewport change; an orientation flip only affects the next
    /// stream acquisition
    UpdateViewport(Viewport),
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A canonical code was produced and delivered via `on_scan`
    Completed,
    /// The user abandoned the session; `on_close` was delivered
    Closed,
}

/// Callbacks into the embedding application
pub struct SessionCallbacks {
    on_scan: Box<dyn FnMut(CanonicalCode) + Send>,
    on_close: Box<dyn FnMut() + Send>,
}

impl SessionCallbacks {
    pub fn new(
        on_scan: impl FnMut(CanonicalCode) + Send + 'static,
        on_close: impl FnMut() + Send + 'static,
    ) -> Self {
        Self {
            on_scan: Box::new(on_scan),
            on_close: Box::new(on_close),
        }
    }
}

/// Session start parameters
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Preferred device; the first enumerated device when unset
    pub device_id: Option<String>,
    /// Embedding viewport, used for orientation-dependent constraints
    pub viewport: Viewport,
}

impl Default for SessionRequest {
    fn default() -> Self {
        Self {
            device_id: None,
            viewport: Viewport::new(1280, 720),
        }
    }
}

/// A cloneable remote for a running session.
///
/// Commands sent after the session ends are silently dropped, so handles
/// can outlive the session (ctrl-c handlers, UI callbacks).
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn command(&self, command: SessionCommand) {
        let _ = self.commands.try_send(command);
    }

    pub fn stop(&self) {
        self.command(SessionCommand::Stop);
    }
}

/// A running scan session.
///
/// Dropping the handle (or calling [`stop`](Self::stop)) abandons the
/// session; [`wait`](Self::wait) drives it to its outcome.
pub struct ScanSession {
    devices: Vec<DeviceDescriptor>,
    commands: mpsc::Sender<SessionCommand>,
    advisories: Option<mpsc::Receiver<ScanError>>,
    flags: watch::Receiver<CapabilityFlags>,
    task: tokio::task::JoinHandle<ScanResult<SessionOutcome>>,
}

impl ScanSession {
    /// Start a session against the given backend.
    ///
    /// Device enumeration happens here, once; everything else runs on a
    /// spawned task until a code is scanned, the session is stopped, or a
    /// fatal error surfaces.
    pub fn start(
        config: Config,
        backend: Arc<dyn CaptureBackend>,
        request: SessionRequest,
        callbacks: SessionCallbacks,
    ) -> Self {
        let capture = CaptureController::new(backend, request.viewport);
        let devices = capture.devices().to_vec();

        let (command_tx, command_rx) = mpsc::channel(8);
        let (advisory_tx, advisory_rx) = mpsc::channel(16);
        let (flags_tx, flags_rx) = watch::channel(CapabilityFlags::default());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let profile = config.profile();
        let reconciler = Reconciler::new(config.acceptance);
        let runtime = SessionRuntime {
            capture,
            config,
            device_id: request.device_id,
            callbacks,
            commands: command_rx,
            advisories: advisory_tx,
            flags: flags_tx,
            event_tx,
            event_rx,
            engines: vec![
                Box::new(MatrixEngine::new()),
                Box::new(LinearEngine::new(profile)),
            ],
            capability: None,
            reconciler,
        };

        let span = tracing::info_span!("scan_session", id = %Uuid::new_v4());
        let task = tokio::spawn(runtime.run().instrument(span));

        Self {
            devices,
            commands: command_tx,
            advisories: Some(advisory_rx),
            flags: flags_rx,
            task,
        }
    }

    /// Devices enumerated at initialization, for selection controls
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// A cloneable remote that can command this session from other threads
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands.clone(),
        }
    }

    /// Send a command; silently ignored once the session has ended
    pub fn command(&self, command: SessionCommand) {
        let _ = self.commands.try_send(command);
    }

    /// Abandon the session. Safe to call repeatedly.
    pub fn stop(&self) {
        self.command(SessionCommand::Stop);
    }

    /// Observable capability flags for conditional UI affordances
    pub fn capability_flags(&self) -> watch::Receiver<CapabilityFlags> {
        self.flags.clone()
    }

    /// Take the receiver of non-fatal advisories (capability and
    /// normalization rejections). Yields `None` after the first call.
    pub fn advisories(&mut self) -> Option<mpsc::Receiver<ScanError>> {
        self.advisories.take()
    }

    /// Wait for the session to end.
    ///
    /// The handle stays alive while waiting, so queued commands keep
    /// working until the outcome is decided.
    pub async fn wait(mut self) -> ScanResult<SessionOutcome> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(ScanError::Other(format!("session task failed: {}", e))),
        }
    }
}

/// Result of bringing the capture/decode stack up on a device
enum BringUp {
    Ready,
    /// A stop command arrived mid-wait
    Stopped,
}

struct SessionRuntime {
    capture: CaptureController,
    config: Config,
    device_id: Option<String>,
    callbacks: SessionCallbacks,
    commands: mpsc::Receiver<SessionCommand>,
    advisories: mpsc::Sender<ScanError>,
    flags: watch::Sender<CapabilityFlags>,
    /// Kept alive across engine restarts so the event channel never closes
    event_tx: mpsc::Sender<DetectionEvent>,
    event_rx: mpsc::Receiver<DetectionEvent>,
    engines: Vec<Box<dyn DecodeEngine>>,
    capability: Option<CapabilityController>,
    reconciler: Reconciler,
}

impl SessionRuntime {
    /// Run to an outcome; every exit path stops the pipelines and releases
    /// the camera.
    async fn run(mut self) -> ScanResult<SessionOutcome> {
        let result = self.run_inner().await;
        self.teardown();
        match &result {
            Ok(outcome) => info!(?outcome, "Session ended"),
            Err(e) => warn!(error = %e, "Session failed"),
        }
        result
    }

    async fn run_inner(&mut self) -> ScanResult<SessionOutcome> {
        let device_id = self.device_id.take();
        self.capture.acquire(device_id.as_deref()).await?;

        match self.bring_up().await? {
            BringUp::Ready => {}
            BringUp::Stopped => return self.close(),
        }
        self.reconciler.begin_scanning();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Stop) => return self.close(),
                    Some(SessionCommand::SwitchDevice(id)) => {
                        self.stop_pipelines();
                        self.capture.switch_device(&id).await?;
                        match self.bring_up().await? {
                            BringUp::Ready => {}
                            BringUp::Stopped => return self.close(),
                        }
                        // Fresh pass on the new device: stale detections and
                        // debounce state are gone
                        while self.event_rx.try_recv().is_ok() {}
                        self.reconciler.begin_scanning();
                    }
                    Some(SessionCommand::ToggleTorch) => {
                        match self.capability.as_mut() {
                            Some(capability) => match capability.toggle_torch() {
                                Ok(on) => {
                                    debug!(on, "Torch toggled");
                                    self.publish_flags();
                                }
                                Err(e) => self.advise(e),
                            },
                            None => debug!("Torch command with no active capability port"),
                        }
                    }
                    Some(SessionCommand::PulseManualFocus) => {
                        match self.capability.as_mut() {
                            Some(capability) => {
                                if let Err(e) = capability.pulse_manual_focus() {
                                    self.advise(e);
                                }
                            }
                            None => debug!("Focus command with no active capability port"),
                        }
                    }
                    Some(SessionCommand::UpdateViewport(viewport)) => {
                        self.capture.update_viewport(viewport);
                    }
                },

                event = self.event_rx.recv() => {
                    let Some(event) = event else { continue };
                    if self.reconciler.offer(&event) == Verdict::Claimed
                        && let Some(outcome) = self.resolve_claim(event)
                    {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Normalize a claimed detection. Returns the session outcome when the
    /// code is accepted; rejection puts the machine back into Scanning.
    fn resolve_claim(&mut self, event: DetectionEvent) -> Option<SessionOutcome> {
        match normalize(&event.raw_text, event.source) {
            Ok(code) => {
                info!(code = %code, source = %event.source, "Scan complete");
                // Exactly once, before teardown
                (self.callbacks.on_scan)(code);
                self.reconciler.finish();
                Some(SessionOutcome::Completed)
            }
            Err(reason) => {
                debug!(raw = %event.raw_text, reason = %reason, "Claim rejected");
                self.reconciler
                    .reject_claim(&event.raw_text, event.timestamp_ms);
                self.advise(ScanError::DecodeRejected(reason));
                None
            }
        }
    }

    /// Wait for the stream's first frame, then start both engines and build
    /// the capability port.
    async fn bring_up(&mut self) -> ScanResult<BringUp> {
        if let BringUp::Stopped = self.wait_ready().await? {
            return Ok(BringUp::Stopped);
        }

        let stream = self
            .capture
            .stream()
            .ok_or_else(|| ScanError::Other("no stream after acquire".to_string()))?;

        // Engine initialization is independent; the session is unusable
        // only when both fail
        let (matrix_source, linear_source) = (stream.engine_source(), stream.engine_source());
        let (left, right) = self.engines.split_at_mut(1);
        let (matrix_result, linear_result) = tokio::join!(
            left[0].start(matrix_source, self.event_tx.clone()),
            right[0].start(linear_source, self.event_tx.clone()),
        );

        let mut last_error = None;
        let mut started = 0usize;
        for (kind, result) in [("matrix", matrix_result), ("linear", linear_result)] {
            match result {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(engine = kind, error = %e, "Decode engine failed to start");
                    self.advise(e.clone());
                    last_error = Some(e);
                }
            }
        }
        if started == 0 {
            return Err(last_error
                .unwrap_or_else(|| ScanError::Other("no decode engine started".to_string())));
        }

        self.capability = Some(CapabilityController::new(stream.controls()));
        self.publish_flags();
        Ok(BringUp::Ready)
    }

    /// Await the first frame, bounded by the ready timeout and responsive
    /// to a stop command.
    async fn wait_ready(&mut self) -> ScanResult<BringUp> {
        let timeout = self.config.ready_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut source = self
            .capture
            .stream()
            .ok_or_else(|| ScanError::Other("no stream after acquire".to_string()))?
            .engine_source();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Stop) => return Ok(BringUp::Stopped),
                    Some(other) => debug!(?other, "Command ignored during bring-up"),
                },

                frame = source.frames.recv() => match frame {
                    Ok(_) => {
                        debug!("First frame observed, stream ready");
                        return Ok(BringUp::Ready);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(ScanError::CameraUnavailable(BackendError::Other(
                            "stream ended before the first frame".to_string(),
                        )));
                    }
                },

                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ScanError::VideoReadyTimeout { waited: timeout });
                }
            }
        }
    }

    /// User abandonment: tear down, fire `on_close`, report Closed
    fn close(&mut self) -> ScanResult<SessionOutcome> {
        self.teardown();
        (self.callbacks.on_close)();
        Ok(SessionOutcome::Closed)
    }

    /// Synchronously stop both pipelines and drop the capability port
    fn stop_pipelines(&mut self) {
        for engine in &mut self.engines {
            engine.stop();
        }
        if let Some(mut capability) = self.capability.take() {
            capability.teardown();
        }
    }

    /// Full teardown: pipelines stopped, stream released, machine Idle
    fn teardown(&mut self) {
        self.stop_pipelines();
        self.capture.release();
        self.reconciler.finish();
    }

    fn advise(&self, error: ScanError) {
        let _ = self.advisories.try_send(error);
    }

    fn publish_flags(&self) {
        let flags = self
            .capability
            .as_ref()
            .map(|c| c.flags())
            .unwrap_or_default();
        let _ = self.flags.send(flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::capture::types::StreamFormat;
    use crate::backends::capture::virtual_source::{TestPattern, VirtualBackend};
    use crate::engines::{EngineProfile, EngineSource};
    use tokio::sync::broadcast;

    /// Both engines failing to start must be fatal; a dead frame channel
    /// kills the matrix engine and a never-ready format kills the linear
    /// engine.
    #[tokio::test(start_paused = true)]
    async fn both_engine_failures_are_fatal() {
        let (format_tx, _) = watch::channel(StreamFormat::default());
        let (frames_tx, _) = broadcast::channel(4);

        let dead_source = || {
            let rx = frames_tx.subscribe();
            EngineSource {
                format: format_tx.subscribe(),
                frames: rx,
            }
        };

        let mut matrix = MatrixEngine::new();
        let mut linear = LinearEngine::new(EngineProfile::Constrained);
        let (event_tx, _event_rx) = mpsc::channel(4);

        let matrix_source = dead_source();
        let linear_source = dead_source();
        drop(frames_tx); // matrix sees a closed channel at attach time

        let matrix_result = matrix.start(matrix_source, event_tx.clone()).await;
        let linear_result = linear.start(linear_source, event_tx).await;

        assert!(matrix_result.is_err());
        assert!(matches!(
            linear_result,
            Err(ScanError::ScannerSurfaceUnready { attempts: 10 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_surfaces_distinct_error() {
        let backend = Arc::new(VirtualBackend::new().silent());
        let session = ScanSession::start(
            Config {
                backend: crate::backends::capture::BackendKind::Virtual,
                ..Config::default()
            },
            backend,
            SessionRequest::default(),
            SessionCallbacks::new(|_| {}, || {}),
        );

        let err = session.wait().await.expect_err("times out");
        assert!(matches!(err, ScanError::VideoReadyTimeout { .. }));
    }

    #[tokio::test]
    async fn scan_session_emits_canonical_code() {
        let backend = Arc::new(
            VirtualBackend::new().with_pattern(TestPattern::Ean8("12345670".to_string())),
        );
        let counters = backend.counters();

        let (code_tx, mut code_rx) = mpsc::unbounded_channel();
        let session = ScanSession::start(
            Config {
                backend: crate::backends::capture::BackendKind::Virtual,
                engine_profile: Some(EngineProfile::Standard),
                ..Config::default()
            },
            backend,
            SessionRequest::default(),
            SessionCallbacks::new(
                move |code| {
                    let _ = code_tx.send(code);
                },
                || {},
            ),
        );

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), session.wait())
            .await
            .expect("finishes")
            .expect("no fatal error");
        assert_eq!(outcome, SessionOutcome::Completed);

        let code = code_rx.try_recv().expect("one code delivered");
        assert_eq!(code.as_str(), "12345670");
        assert!(code_rx.try_recv().is_err(), "on_scan fires exactly once");

        // Teardown released the stream
        assert_eq!(counters.live(), 0);
    }
}
