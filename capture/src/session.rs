//! Capture session state machine.
//!
//! ```text
//!   Idle ──arm──▶ Armed ──start──▶ Recording ◀──resume── Paused
//!    ▲              ▲  ▲               │  └──pause──────▶ │
//!    │              │  └──stop (empty)─┤                  │
//!    │              │                  ▼                  │
//!    │              └──reset──── Stopped ◀──stop──────────┘
//!    └──────────────disarm (from anywhere)
//! ```
//!
//! Segments are collected by a background task fed from the recorder's
//! event channel. `stop_recording` resolves only after the recorder has
//! reported end-of-stream, so a payload is never built from a partial
//! segment set. A recorder that never reports it loses the take.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vault_common::payload::MediaPayload;

use crate::device::{
    DeviceConstraints, EncodingOptions, MediaBackend, Recorder, RecorderEvent, RecorderHandle,
};
use crate::error::CaptureError;

/// Default wait in `stop_recording` for the recorder's last segment.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    #[default]
    Idle,
    Armed,
    Recording,
    Paused,
    /// Armed, with a completed recording buffered.
    Stopped,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

type Segments = Arc<Mutex<Vec<Vec<u8>>>>;

pub struct CaptureSession<B: MediaBackend> {
    backend: B,
    state: CaptureState,
    stream: Option<B::Stream>,
    recorder: Option<Box<dyn Recorder>>,
    /// Resolves to whether end-of-stream was seen.
    collector: Option<JoinHandle<bool>>,
    segments: Segments,
    stop_grace: Duration,
    /// MIME type the active (or last) recorder actually encodes.
    active_mime: Option<String>,
}

impl<B: MediaBackend> CaptureSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: CaptureState::Idle,
            stream: None,
            recorder: None,
            collector: None,
            segments: Segments::default(),
            stop_grace: STOP_GRACE,
            active_mime: None,
        }
    }

    /// Override how long `stop_recording` waits for end-of-stream.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// MIME type of the current or most recent recording.
    pub fn active_mime(&self) -> Option<&str> {
        self.active_mime.as_deref()
    }

    /// Acquire an input stream. The hardware lock is held until `disarm`.
    pub fn arm(&mut self, constraints: &DeviceConstraints) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Err(CaptureError::AlreadyArmed);
        }
        let stream = self.backend.acquire(constraints)?;
        self.stream = Some(stream);
        self.state = CaptureState::Armed;
        info!("Capture armed ({:?})", constraints.devices());
        Ok(())
    }

    /// Begin buffering one segment per time slice. Falls back to the
    /// default container when the requested one is unavailable.
    pub fn start_recording(&mut self, options: &EncodingOptions) -> Result<(), CaptureError> {
        if !matches!(self.state, CaptureState::Armed | CaptureState::Stopped) {
            return Err(self.invalid("start recording"));
        }
        let Some(stream) = self.stream.as_ref() else {
            return Err(self.invalid("start recording"));
        };

        let fallback = options.fallback_mime();
        let mut chosen = options.clone();
        if !self.backend.is_type_supported(&chosen.mime_type) {
            warn!(
                "{} is not supported, falling back to {fallback}",
                chosen.mime_type
            );
            chosen.mime_type = fallback.to_string();
        }

        let handle = match self.backend.create_recorder(stream, &chosen) {
            Err(CaptureError::UnsupportedEncoding(reason)) if chosen.mime_type != fallback => {
                warn!("Recorder rejected {}: {reason}; retrying with {fallback}", chosen.mime_type);
                chosen.mime_type = fallback.to_string();
                self.backend.create_recorder(stream, &chosen)?
            }
            other => other?,
        };
        let RecorderHandle { recorder, events } = handle;

        self.clear_segments();
        self.collector = Some(tokio::spawn(collect(events, self.segments.clone())));
        self.recorder = Some(recorder);
        self.active_mime = Some(chosen.mime_type.clone());
        self.state = CaptureState::Recording;
        info!("Recording started ({})", chosen.mime_type);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Recording {
            return Err(self.invalid("pause"));
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.pause()?;
        }
        self.state = CaptureState::Paused;
        debug!("Recording paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Paused {
            return Err(self.invalid("resume"));
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.resume()?;
        }
        self.state = CaptureState::Recording;
        debug!("Recording resumed");
        Ok(())
    }

    /// Stop recording and return everything captured, or `None` when no
    /// segment was delivered. Resolves only after end-of-stream; when the
    /// recorder never reports it the partial take is dropped, the session
    /// goes back to `Armed` and an error is returned.
    pub async fn stop_recording(&mut self) -> Result<Option<MediaPayload>, CaptureError> {
        if !matches!(self.state, CaptureState::Recording | CaptureState::Paused) {
            return Err(self.invalid("stop recording"));
        }

        let mut recorder = self.recorder.take();
        if let Some(Err(e)) = recorder.as_mut().map(|r| r.stop()) {
            // Dropping the recorder closes its channel, which ends the
            // collector.
            warn!("Recorder did not stop cleanly: {e}");
            recorder = None;
        }

        let ended = match self.collector.take() {
            Some(mut collector) => match tokio::time::timeout(self.stop_grace, &mut collector).await {
                Ok(Ok(ended)) => ended,
                Ok(Err(e)) => {
                    warn!("Segment collector failed: {e}");
                    false
                }
                Err(_) => {
                    warn!(
                        "Recorder did not report end of stream within {:?}",
                        self.stop_grace
                    );
                    collector.abort();
                    false
                }
            },
            None => false,
        };
        drop(recorder);

        if !ended {
            self.clear_segments();
            self.state = CaptureState::Armed;
            return Err(CaptureError::Recorder(
                "recording ended without end of stream; take discarded".into(),
            ));
        }

        let mime = self.active_mime.clone().unwrap_or_default();
        let payload = self.get_payload(&mime);
        self.state = if payload.is_some() {
            CaptureState::Stopped
        } else {
            CaptureState::Armed
        };
        match &payload {
            Some(p) => info!("Recording stopped: {} ({})", p.name(), p.total_size()),
            None => info!("Recording stopped with no captured data"),
        }
        Ok(payload)
    }

    /// Concatenation of all segments since the last reset, or `None`.
    pub fn get_payload(&self, mime_type: &str) -> Option<MediaPayload> {
        let segments = self.segments.lock().unwrap_or_else(PoisonError::into_inner);
        if segments.is_empty() {
            return None;
        }
        let bytes = segments.concat();
        Some(MediaPayload::recording(mime_type, bytes))
    }

    /// Drop buffered segments but keep the hardware lock.
    pub fn reset(&mut self) -> Result<(), CaptureError> {
        if !matches!(self.state, CaptureState::Armed | CaptureState::Stopped) {
            return Err(self.invalid("reset"));
        }
        self.clear_segments();
        self.state = CaptureState::Armed;
        Ok(())
    }

    /// Release everything. Idempotent; release failures are logged, not
    /// returned.
    pub fn disarm(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            if let Err(e) = recorder.stop() {
                debug!("Recorder stop during disarm: {e}");
            }
        }
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        if let Some(stream) = self.stream.take() {
            match self.backend.release(stream) {
                Ok(()) => info!("Capture disarmed"),
                Err(e) => warn!("Failed to release capture stream: {e}"),
            }
        }
        self.clear_segments();
        self.state = CaptureState::Idle;
    }

    fn clear_segments(&self) {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn invalid(&self, op: &'static str) -> CaptureError {
        CaptureError::InvalidState {
            from: self.state,
            op,
        }
    }
}

impl<B: MediaBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Buffer segments until end-of-stream (`true`) or until every sender is
/// gone without one (`false`).
async fn collect(mut events: UnboundedReceiver<RecorderEvent>, segments: Segments) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            RecorderEvent::Segment(bytes) if bytes.is_empty() => {}
            RecorderEvent::Segment(bytes) => {
                debug!("Buffered segment of {} bytes", bytes.len());
                segments
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(bytes);
            }
            RecorderEvent::Error(msg) => warn!("Recorder error: {msg}"),
            RecorderEvent::End => return true,
        }
    }
    false
}
