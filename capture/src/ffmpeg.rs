//! ffmpeg-backed capture: spawns `ffmpeg` reading V4L2/ALSA devices and
//! writing the encoded container to stdout, which a reader thread slices
//! into one segment per time slice.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use vault_common::config::Config;
use vault_common::payload::base_mime;

use crate::device::{
    DeviceConstraints, DeviceLock, DeviceRegistry, EncodingOptions, MediaBackend, Recorder,
    RecorderEvent, RecorderHandle,
};
use crate::error::CaptureError;

const READ_BLOCK: usize = 64 * 1024;

/// Time ffmpeg gets to fail on a bad device or codec before we declare
/// the recorder started.
const STARTUP_WAIT: Duration = Duration::from_millis(300);

pub struct FfmpegBackend {
    program: String,
    video_input_format: String,
    audio_input_format: String,
    registry: DeviceRegistry,
}

/// Devices validated and locked by [`FfmpegBackend::acquire`].
#[derive(Debug)]
pub struct FfmpegStream {
    constraints: DeviceConstraints,
    _lock: DeviceLock,
}

impl FfmpegStream {
    pub fn constraints(&self) -> &DeviceConstraints {
        &self.constraints
    }
}

impl FfmpegBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            video_input_format: config.video_input_format.clone(),
            audio_input_format: config.audio_input_format.clone(),
            registry: DeviceRegistry::global(),
        }
    }

    pub fn with_registry(mut self, registry: DeviceRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn args(
        &self,
        constraints: &DeviceConstraints,
        out: &OutputSpec,
        options: &EncodingOptions,
    ) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if let Some(dev) = &constraints.video_device {
            args.extend(["-f".into(), self.video_input_format.clone()]);
            if let Some(rate) = constraints.frame_rate {
                args.extend(["-framerate".into(), rate.to_string()]);
            }
            if let (Some(w), Some(h)) = (constraints.width, constraints.height) {
                args.extend(["-video_size".into(), format!("{w}x{h}")]);
            }
            args.extend(["-i".into(), dev.clone()]);
        }
        if let Some(dev) = &constraints.audio_device {
            args.extend([
                "-f".into(),
                self.audio_input_format.clone(),
                "-i".into(),
                dev.clone(),
            ]);
        }

        match out.video_codec.filter(|_| constraints.wants_video()) {
            Some(codec) => {
                args.extend(["-c:v".into(), codec.into()]);
                if let Some(bps) = options.video_bits_per_second {
                    args.extend(["-b:v".into(), bps.to_string()]);
                }
                if codec.starts_with("libvpx") {
                    args.extend(["-deadline".into(), "realtime".into()]);
                }
            }
            None => args.push("-vn".into()),
        }
        match out.audio_codec.filter(|_| constraints.wants_audio()) {
            Some(codec) => {
                args.extend(["-c:a".into(), codec.into()]);
                if let Some(bps) = options.audio_bits_per_second {
                    args.extend(["-b:a".into(), bps.to_string()]);
                }
            }
            None => args.push("-an".into()),
        }

        args.extend(out.extra.iter().map(|s| s.to_string()));
        args.extend(["-f".into(), out.format.into(), "pipe:1".into()]);
        args
    }
}

impl MediaBackend for FfmpegBackend {
    type Stream = FfmpegStream;

    fn acquire(&self, constraints: &DeviceConstraints) -> Result<FfmpegStream, CaptureError> {
        let devices = constraints.devices();
        if devices.is_empty() {
            return Err(CaptureError::DeviceUnavailable(
                "no capture device configured".into(),
            ));
        }
        // ALSA names like `default` or `hw:0` are not filesystem nodes.
        for dev in devices.iter().filter(|d| d.starts_with('/')) {
            check_device(Path::new(dev))?;
        }
        let lock = self.registry.try_lock(&devices)?;
        Ok(FfmpegStream {
            constraints: constraints.clone(),
            _lock: lock,
        })
    }

    fn release(&self, stream: FfmpegStream) -> Result<(), CaptureError> {
        debug!("Releasing {:?}", stream.constraints.devices());
        drop(stream);
        Ok(())
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        parse_mime(mime_type).is_ok()
    }

    fn create_recorder(
        &self,
        stream: &FfmpegStream,
        options: &EncodingOptions,
    ) -> Result<RecorderHandle, CaptureError> {
        let out = parse_mime(&options.mime_type)?;
        let constraints = &stream.constraints;
        let carries_video = out.video_codec.is_some() && constraints.wants_video();
        let carries_audio = out.audio_codec.is_some() && constraints.wants_audio();
        if !carries_video && !carries_audio {
            return Err(CaptureError::UnsupportedEncoding(format!(
                "{} cannot carry any of the armed inputs",
                options.mime_type
            )));
        }

        let args = self.args(constraints, &out, options);
        info!("Spawning: {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    CaptureError::Recorder(format!("{} not found in PATH", self.program))
                }
                _ => CaptureError::Recorder(format!("Failed to spawn {}: {e}", self.program)),
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Recorder("Failed to capture ffmpeg stdout".into()))?;

        // Drain stderr so ffmpeg errors are visible and the pipe never
        // fills up.
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => warn!("[ffmpeg] {l}"),
                            Err(_) => break,
                        }
                    }
                    debug!("ffmpeg stderr stream ended");
                })
                .ok();
        }

        wait_off_runtime(STARTUP_WAIT);
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(CaptureError::Recorder(format!(
                    "ffmpeg exited immediately with {status}; check VIDEO_DEVICE/AUDIO_DEVICE \
                     in vault.conf"
                )));
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot check ffmpeg status: {e}"),
        }

        let (tx, events) = mpsc::unbounded_channel();
        let timeslice = options.timeslice;
        std::thread::Builder::new()
            .name("ffmpeg-stdout".into())
            .spawn(move || slice_output(stdout, timeslice, tx))
            .map_err(|e| CaptureError::Recorder(format!("Cannot start reader thread: {e}")))?;

        info!("ffmpeg recorder started (pid={})", child.id());
        Ok(RecorderHandle {
            recorder: Box::new(FfmpegRecorder {
                child,
                stdin,
                paused: false,
            }),
            events,
        })
    }
}

pub struct FfmpegRecorder {
    child: Child,
    stdin: Option<ChildStdin>,
    paused: bool,
}

impl FfmpegRecorder {
    #[cfg(unix)]
    fn signal(&self, sig: libc::c_int) -> Result<(), CaptureError> {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: `pid` is our own child, which is not reaped before drop.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(CaptureError::Recorder(format!(
                "Cannot signal ffmpeg (pid={pid}): {}",
                std::io::Error::last_os_error()
            )))
        }
    }
}

impl Recorder for FfmpegRecorder {
    /// Ask ffmpeg to finish the container; it flushes and closes stdout.
    fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        #[cfg(unix)]
        if self.paused {
            self.signal(libc::SIGCONT)?;
            self.paused = false;
        }
        match stdin.write_all(b"q") {
            Ok(()) => {}
            // Already exited; stdout EOF follows.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => return Err(CaptureError::Recorder(format!("Cannot stop ffmpeg: {e}"))),
        }
        drop(stdin);
        debug!("Sent quit to ffmpeg (pid={})", self.child.id());
        Ok(())
    }

    #[cfg(unix)]
    fn pause(&mut self) -> Result<(), CaptureError> {
        self.signal(libc::SIGSTOP)?;
        self.paused = true;
        Ok(())
    }

    #[cfg(unix)]
    fn resume(&mut self) -> Result<(), CaptureError> {
        self.signal(libc::SIGCONT)?;
        self.paused = false;
        Ok(())
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        self.stdin.take();
        if !matches!(self.child.try_wait(), Ok(Some(_))) {
            #[cfg(unix)]
            if self.paused {
                let _ = self.signal(libc::SIGCONT);
            }
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Block the calling thread for `dur`. On a multi-threaded runtime the
/// worker hands its other tasks off first.
fn wait_off_runtime(dur: Duration) {
    let on_worker = tokio::runtime::Handle::try_current()
        .is_ok_and(|h| h.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread);
    if on_worker {
        tokio::task::block_in_place(|| std::thread::sleep(dur));
    } else {
        std::thread::sleep(dur);
    }
}

/// Read ffmpeg's stdout and emit one segment per `timeslice`, then the
/// remainder and `End` on EOF.
fn slice_output(mut stdout: ChildStdout, timeslice: Duration, tx: UnboundedSender<RecorderEvent>) {
    let mut block = vec![0u8; READ_BLOCK];
    let mut pending = Vec::new();
    let mut slice_start = Instant::now();

    loop {
        match stdout.read(&mut block) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&block[..n]);
                if slice_start.elapsed() >= timeslice {
                    if tx.send(RecorderEvent::Segment(std::mem::take(&mut pending))).is_err() {
                        return;
                    }
                    slice_start = Instant::now();
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.send(RecorderEvent::Error(format!("ffmpeg stdout: {e}")));
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(RecorderEvent::Segment(pending));
    }
    let _ = tx.send(RecorderEvent::End);
    debug!("ffmpeg stdout stream ended");
}

/// Open a device node the way ffmpeg will.
pub fn check_device(path: &Path) -> Result<(), CaptureError> {
    match std::fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(CaptureError::DeviceUnavailable(
            format!("{} does not exist", path.display()),
        )),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(
            CaptureError::PermissionDenied(format!("{}: {e}", path.display())),
        ),
        Err(e) => Err(CaptureError::DeviceUnavailable(format!(
            "{}: {e}",
            path.display()
        ))),
    }
}

/// ffmpeg muxer and encoders for one MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub format: &'static str,
    pub video_codec: Option<&'static str>,
    pub audio_codec: Option<&'static str>,
    pub extra: &'static [&'static str],
}

/// Map a MIME type such as `video/webm;codecs="vp9,opus"` to ffmpeg
/// output settings.
pub fn parse_mime(mime_type: &str) -> Result<OutputSpec, CaptureError> {
    let unsupported = |why: &str| CaptureError::UnsupportedEncoding(format!("{mime_type}: {why}"));

    let mut out = match base_mime(mime_type).to_ascii_lowercase().as_str() {
        "video/webm" => OutputSpec {
            format: "webm",
            video_codec: Some("libvpx"),
            audio_codec: Some("libopus"),
            extra: &[],
        },
        "audio/webm" => OutputSpec {
            format: "webm",
            video_codec: None,
            audio_codec: Some("libopus"),
            extra: &[],
        },
        "video/x-matroska" => OutputSpec {
            format: "matroska",
            video_codec: Some("libvpx-vp9"),
            audio_codec: Some("libopus"),
            extra: &[],
        },
        // mp4 on a pipe must be fragmented.
        "video/mp4" => OutputSpec {
            format: "mp4",
            video_codec: Some("libx264"),
            audio_codec: Some("aac"),
            extra: &["-movflags", "frag_keyframe+empty_moov"],
        },
        "audio/ogg" => OutputSpec {
            format: "ogg",
            video_codec: None,
            audio_codec: Some("libopus"),
            extra: &[],
        },
        "audio/wav" => OutputSpec {
            format: "wav",
            video_codec: None,
            audio_codec: Some("pcm_s16le"),
            extra: &[],
        },
        _ => return Err(unsupported("unknown container")),
    };

    let Some(codecs) = codecs_param(mime_type) else {
        return Ok(out);
    };
    let (mut video, mut audio) = (None, None);
    for name in codecs.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        match codec_encoder(name) {
            Some(CodecKind::Video(enc)) => video = Some(enc),
            Some(CodecKind::Audio(enc)) => audio = Some(enc),
            None => return Err(unsupported(&format!("unknown codec '{name}'"))),
        }
    }
    if video.is_some() && out.video_codec.is_none() {
        return Err(unsupported("audio container cannot carry video"));
    }
    out.video_codec = video.or(out.video_codec);
    out.audio_codec = audio.or(out.audio_codec);

    let allowed: &[&str] = match out.format {
        "webm" => &["libvpx", "libvpx-vp9", "libopus", "libvorbis"],
        "mp4" => &["libx264", "aac"],
        "ogg" => &["libopus", "libvorbis"],
        "wav" => &["pcm_s16le"],
        _ => return Ok(out),
    };
    for enc in [out.video_codec, out.audio_codec].into_iter().flatten() {
        if !allowed.contains(&enc) {
            return Err(unsupported(&format!("{enc} cannot be muxed into {}", out.format)));
        }
    }
    Ok(out)
}

enum CodecKind {
    Video(&'static str),
    Audio(&'static str),
}

fn codec_encoder(name: &str) -> Option<CodecKind> {
    let name = name.to_ascii_lowercase();
    let kind = match name.as_str() {
        "vp8" => CodecKind::Video("libvpx"),
        "vp9" | "vp09" => CodecKind::Video("libvpx-vp9"),
        "h264" => CodecKind::Video("libx264"),
        n if n.starts_with("avc1") => CodecKind::Video("libx264"),
        "opus" => CodecKind::Audio("libopus"),
        "vorbis" => CodecKind::Audio("libvorbis"),
        "aac" => CodecKind::Audio("aac"),
        n if n.starts_with("mp4a") => CodecKind::Audio("aac"),
        "pcm" => CodecKind::Audio("pcm_s16le"),
        _ => return None,
    };
    Some(kind)
}

fn codecs_param(mime_type: &str) -> Option<&str> {
    mime_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("codecs")
            .then(|| value.trim().trim_matches('"'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> FfmpegBackend {
        FfmpegBackend::from_config(&Config::default()).with_registry(DeviceRegistry::new())
    }

    #[test]
    fn test_parse_mime_defaults() {
        let webm = parse_mime("video/webm").unwrap();
        assert_eq!(webm.format, "webm");
        assert_eq!(webm.video_codec, Some("libvpx"));
        assert_eq!(webm.audio_codec, Some("libopus"));

        let wav = parse_mime("audio/wav").unwrap();
        assert_eq!(wav.video_codec, None);
        assert_eq!(wav.audio_codec, Some("pcm_s16le"));
    }

    #[test]
    fn test_parse_mime_codecs() {
        let vp9 = parse_mime("video/webm;codecs=vp9").unwrap();
        assert_eq!(vp9.video_codec, Some("libvpx-vp9"));
        assert_eq!(vp9.audio_codec, Some("libopus"));

        let quoted = parse_mime("video/webm; codecs=\"vp8, vorbis\"").unwrap();
        assert_eq!(quoted.video_codec, Some("libvpx"));
        assert_eq!(quoted.audio_codec, Some("libvorbis"));

        let mp4 = parse_mime("video/mp4;codecs=avc1.42E01E,mp4a.40.2").unwrap();
        assert_eq!(mp4.video_codec, Some("libx264"));
        assert_eq!(mp4.extra, &["-movflags", "frag_keyframe+empty_moov"]);
    }

    #[test]
    fn test_parse_mime_rejects() {
        for mime in [
            "video/quicktime",
            "video/webm;codecs=h264",
            "audio/ogg;codecs=vp9",
            "video/webm;codecs=theora",
        ] {
            assert!(
                matches!(parse_mime(mime), Err(CaptureError::UnsupportedEncoding(_))),
                "{mime} should be unsupported"
            );
        }
        assert!(backend().is_type_supported("audio/webm;codecs=opus"));
        assert!(!backend().is_type_supported("audio/aac"));
    }

    #[test]
    fn test_args_audio_and_video() {
        let constraints = DeviceConstraints {
            video_device: Some("/dev/video0".into()),
            audio_device: Some("hw:1".into()),
            width: Some(1280),
            height: Some(720),
            frame_rate: Some(30),
        };
        let mut options = EncodingOptions::new("video/webm;codecs=vp9");
        options.video_bits_per_second = Some(2_500_000);
        let out = parse_mime(&options.mime_type).unwrap();
        let args = backend().args(&constraints, &out, &options).join(" ");

        assert!(args.contains("-f v4l2 -framerate 30 -video_size 1280x720 -i /dev/video0"));
        assert!(args.contains("-f alsa -i hw:1"));
        assert!(args.contains("-c:v libvpx-vp9 -b:v 2500000 -deadline realtime"));
        assert!(args.contains("-c:a libopus"));
        assert!(args.ends_with("-f webm pipe:1"));
    }

    #[test]
    fn test_args_audio_only() {
        let constraints = DeviceConstraints::audio_only("default");
        let options = EncodingOptions::new("audio/ogg");
        let out = parse_mime(&options.mime_type).unwrap();
        let args = backend().args(&constraints, &out, &options);

        assert!(!args.iter().any(|a| a == "v4l2"));
        assert!(args.iter().any(|a| a == "-vn"));
        assert_eq!(args[args.len() - 2], "ogg");
    }

    #[test]
    fn test_acquire_checks_device_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("video9");
        let constraints = DeviceConstraints {
            video_device: Some(missing.to_string_lossy().to_string()),
            ..DeviceConstraints::default()
        };
        assert!(matches!(
            backend().acquire(&constraints),
            Err(CaptureError::DeviceUnavailable(_))
        ));
        assert!(matches!(
            backend().acquire(&DeviceConstraints::default()),
            Err(CaptureError::DeviceUnavailable(_))
        ));

        let node = dir.path().join("video0");
        std::fs::write(&node, b"").unwrap();
        let present = DeviceConstraints {
            video_device: Some(node.to_string_lossy().to_string()),
            ..DeviceConstraints::default()
        };
        let stream = backend().acquire(&present).unwrap();
        assert_eq!(stream.constraints(), &present);
    }

    #[test]
    fn test_audio_container_needs_audio_input() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("video0");
        std::fs::write(&node, b"").unwrap();
        let b = backend();
        let stream = b
            .acquire(&DeviceConstraints {
                video_device: Some(node.to_string_lossy().to_string()),
                ..DeviceConstraints::default()
            })
            .unwrap();
        assert!(matches!(
            b.create_recorder(&stream, &EncodingOptions::new("audio/webm")),
            Err(CaptureError::UnsupportedEncoding(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_startup_wait_leaves_worker_free() {
        let waiting = tokio::spawn(async { wait_off_runtime(Duration::from_millis(600)) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // With the only worker parked in a plain sleep this would starve.
        let quick = tokio::spawn(async { 7 });
        let answer = tokio::time::timeout(Duration::from_millis(300), quick).await;
        assert_eq!(answer.unwrap().unwrap(), 7);
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_wait_on_current_thread_runtime() {
        let started = Instant::now();
        wait_off_runtime(Duration::from_millis(10));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
