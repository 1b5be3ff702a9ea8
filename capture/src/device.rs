//! Media backend seam: how a capture session acquires an input stream and
//! creates a recorder for it.
//!
//! A backend hands out stream handles that hold the hardware lock for
//! their devices, and recorders that emit encoded segments over a channel
//! followed by an end-of-stream marker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use vault_common::config::Config;

use crate::error::CaptureError;

/// Recorder time slice: one buffered segment per second.
pub const DEFAULT_TIMESLICE: Duration = Duration::from_secs(1);

/// Which inputs to open, plus resolution and rate hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConstraints {
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl DeviceConstraints {
    pub fn audio_only(device: impl Into<String>) -> Self {
        Self {
            audio_device: Some(device.into()),
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config, audio_only: bool) -> Self {
        Self {
            video_device: if audio_only {
                None
            } else {
                config.video_device.clone()
            },
            audio_device: config.audio_device.clone(),
            width: Some(config.video_width),
            height: Some(config.video_height),
            frame_rate: Some(config.frame_rate),
        }
    }

    pub fn wants_video(&self) -> bool {
        self.video_device.is_some()
    }

    pub fn wants_audio(&self) -> bool {
        self.audio_device.is_some()
    }

    /// Every device id these constraints name.
    pub fn devices(&self) -> Vec<String> {
        self.video_device
            .iter()
            .chain(self.audio_device.iter())
            .cloned()
            .collect()
    }
}

/// Requested container/codec and bitrates for a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingOptions {
    /// e.g. `video/webm;codecs=vp9`
    pub mime_type: String,
    pub video_bits_per_second: Option<u32>,
    pub audio_bits_per_second: Option<u32>,
    pub timeslice: Duration,
}

impl EncodingOptions {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            video_bits_per_second: None,
            audio_bits_per_second: None,
            timeslice: DEFAULT_TIMESLICE,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            video_bits_per_second: Some(config.video_bitrate),
            ..Self::new(config.mime_type.clone())
        }
    }

    /// Known-good container to use when the requested one is unavailable.
    pub fn fallback_mime(&self) -> &'static str {
        if self.mime_type.trim_start().starts_with("audio") {
            "audio/webm"
        } else {
            "video/webm"
        }
    }
}

/// What a recorder reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// One time slice of encoded media.
    Segment(Vec<u8>),
    /// Non-fatal problem; recording continues.
    Error(String),
    /// The recorder has delivered its last segment.
    End,
}

/// A running recorder. Dropping it must stop recording and close its
/// event channel.
pub trait Recorder: Send {
    /// Ask the recorder to finish. The final segment and `End` follow on
    /// the event channel.
    fn stop(&mut self) -> Result<(), CaptureError>;

    fn pause(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::Recorder("pause is not supported".into()))
    }

    fn resume(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::Recorder("resume is not supported".into()))
    }
}

/// A freshly created recorder and the receiving end of its events.
pub struct RecorderHandle {
    pub recorder: Box<dyn Recorder>,
    pub events: mpsc::UnboundedReceiver<RecorderEvent>,
}

/// Source of media streams and recorders.
pub trait MediaBackend: Send {
    /// Live input stream; holds the hardware lock until released.
    type Stream: Send;

    fn acquire(&self, constraints: &DeviceConstraints) -> Result<Self::Stream, CaptureError>;

    fn release(&self, stream: Self::Stream) -> Result<(), CaptureError>;

    fn is_type_supported(&self, mime_type: &str) -> bool;

    fn create_recorder(
        &self,
        stream: &Self::Stream,
        options: &EncodingOptions,
    ) -> Result<RecorderHandle, CaptureError>;
}

/// Set of devices currently held, so a physical device is never opened
/// twice at once.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every backend in this process.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<DeviceRegistry> = OnceLock::new();
        GLOBAL.get_or_init(DeviceRegistry::new).clone()
    }

    /// Take all of `devices`, or none of them.
    pub fn try_lock(&self, devices: &[String]) -> Result<DeviceLock, CaptureError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = devices.iter().find(|d| held.contains(*d)) {
            return Err(CaptureError::DeviceUnavailable(format!("{busy} is already in use")));
        }
        held.extend(devices.iter().cloned());
        debug!("Locked device(s) {devices:?}");
        Ok(DeviceLock {
            registry: self.clone(),
            devices: devices.to_vec(),
        })
    }

    pub fn is_held(&self, device: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }
}

/// Hardware lock on a set of devices; released on drop.
#[derive(Debug)]
pub struct DeviceLock {
    registry: DeviceRegistry,
    devices: Vec<String>,
}

impl DeviceLock {
    pub fn devices(&self) -> &[String] {
        &self.devices
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for device in &self.devices {
            held.remove(device);
        }
        debug!("Released device(s) {:?}", self.devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_all_or_nothing() {
        let registry = DeviceRegistry::new();
        let cam = "/dev/video0".to_string();
        let mic = "hw:0".to_string();

        let lock = registry.try_lock(&[cam.clone()]).unwrap();
        let err = registry.try_lock(&[mic.clone(), cam.clone()]).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        assert!(!registry.is_held(&mic));

        drop(lock);
        let both = registry.try_lock(&[mic.clone(), cam.clone()]).unwrap();
        assert_eq!(both.devices().len(), 2);
        assert!(registry.is_held(&cam));
    }

    #[test]
    fn test_fallback_mime() {
        assert_eq!(EncodingOptions::new("audio/ogg;codecs=opus").fallback_mime(), "audio/webm");
        assert_eq!(EncodingOptions::new("video/quicktime").fallback_mime(), "video/webm");
    }

    #[test]
    fn test_constraints_from_config() {
        let mut config = Config::default();
        config.video_device = Some("/dev/video0".into());
        config.audio_device = Some("default".into());

        let av = DeviceConstraints::from_config(&config, false);
        assert_eq!(av.devices(), vec!["/dev/video0".to_string(), "default".to_string()]);
        let audio = DeviceConstraints::from_config(&config, true);
        assert!(!audio.wants_video());
        assert!(audio.wants_audio());
    }
}
