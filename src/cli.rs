// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for the scan engine
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Running a scan session to completion

use codescan::backends::capture::{BackendKind, Viewport, backend_for};
use codescan::session::{
    ScanSession, SessionCallbacks, SessionCommand, SessionOutcome, SessionRequest,
};
use codescan::{Config, ScanError, ScanResult};

/// List all available cameras
pub fn list_cameras(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let backend = backend_for(config.backend);

    if !backend.is_available() {
        println!("Capture backend '{}' is not available.", config.backend);
        return Ok(());
    }

    let devices = backend.enumerate_devices();
    if devices.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras:");
    println!();
    for device in &devices {
        println!("  {}  {}", device.id, device.label);
    }

    Ok(())
}

/// Run one scan session and print the canonical code
pub fn scan(
    config: Config,
    camera: Option<String>,
    backend_kind: Option<BackendKind>,
    torch: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let kind = backend_kind.unwrap_or(config.backend);
    let backend = backend_for(kind);

    let device_id = camera.or_else(|| config.last_device_id.clone());
    let request = SessionRequest {
        device_id: device_id.clone(),
        viewport: Viewport::new(1280, 720),
    };

    let callbacks = SessionCallbacks::new(
        |code| {
            println!("{}", code);
        },
        || {},
    );

    let rt = tokio::runtime::Runtime::new()?;
    let session_config = config.clone();
    let result: ScanResult<SessionOutcome> = rt.block_on(async move {
        let mut session = ScanSession::start(session_config, backend, request, callbacks);

        if session.devices().is_empty() {
            eprintln!("No cameras found.");
        } else {
            eprintln!("Scanning... (press Ctrl+C to stop)");
        }

        // Non-fatal advisories (unsupported capabilities, rejected decodes)
        // go to stderr while scanning continues
        if let Some(mut advisories) = session.advisories() {
            tokio::spawn(async move {
                while let Some(advisory) = advisories.recv().await {
                    eprintln!("note: {}", advisory);
                }
            });
        }

        if torch {
            session.command(SessionCommand::ToggleTorch);
        }

        let handle = session.handle();
        ctrlc::set_handler(move || handle.stop())
            .map_err(|e| ScanError::Other(format!("cannot install Ctrl+C handler: {}", e)))?;

        session.wait().await
    });

    match result {
        Ok(SessionOutcome::Completed) => {
            // Remember the device that worked
            if device_id.is_some() && device_id != config.last_device_id {
                let mut updated = config;
                updated.last_device_id = device_id;
                if let Err(e) = updated.save() {
                    eprintln!("note: could not save configuration: {}", e);
                }
            }
            Ok(())
        }
        Ok(SessionOutcome::Closed) => {
            eprintln!("Scan abandoned.");
            Ok(())
        }
        Err(error) => Err(describe_fatal(&error).into()),
    }
}

/// Turn a fatal session error into user-facing text with a retry hint
fn describe_fatal(error: &ScanError) -> String {
    match error {
        ScanError::CameraUnavailable(_) | ScanError::VideoReadyTimeout { .. } => {
            format!("{}\nTry again with 'codescan scan'.", error)
        }
        other => other.to_string(),
    }
}
