//! Local and remote media handles
//!
//! A [`LocalMedia`] handle is acquired once per lobby session and shared by
//! every call attempt. Toggling the camera or microphone flips the track's
//! `enabled` flag; the tracks themselves are never replaced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{AppError, Result};

/// VP8 clock rate (RFC 7741)
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Opus clock rate
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// `{min, ideal, max}` constraint on one capture dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintRange {
    pub min: u32,
    pub ideal: u32,
    pub max: u32,
}

impl ConstraintRange {
    pub const fn new(min: u32, ideal: u32, max: u32) -> Self {
        Self { min, ideal, max }
    }

    fn is_ordered(&self) -> bool {
        self.min <= self.ideal && self.ideal <= self.max
    }
}

/// Camera constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    pub width: ConstraintRange,
    pub height: ConstraintRange,
    pub frame_rate: ConstraintRange,
    /// `user` (front) or `environment` (rear)
    pub facing_mode: String,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: ConstraintRange::new(640, 1280, 1920),
            height: ConstraintRange::new(480, 720, 1080),
            frame_rate: ConstraintRange::new(15, 30, 60),
            facing_mode: "user".to_string(),
        }
    }
}

/// Microphone constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: AUDIO_CLOCK_RATE,
        }
    }
}

/// Capture constraints passed to [`MediaSource::acquire`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

impl MediaConstraints {
    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("width", &self.video.width),
            ("height", &self.video.height),
            ("frame_rate", &self.video.frame_rate),
        ];
        for (name, range) in ranges {
            if !range.is_ordered() {
                return Err(AppError::Config(format!(
                    "video {} constraint must satisfy min <= ideal <= max, got {}/{}/{}",
                    name, range.min, range.ideal, range.max
                )));
            }
        }
        if self.audio.sample_rate == 0 {
            return Err(AppError::Config("audio sample_rate must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// One captured track
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    /// Outgoing RTP track; `None` for handles that are never sent
    rtp: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        rtp: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn rtp(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtp.clone()
    }

    /// Write one encoded frame.
    ///
    /// Returns `Ok(false)` when the frame was dropped because the track is
    /// disabled or stopped.
    pub async fn write_sample(&self, data: &[u8], duration: Duration) -> Result<bool> {
        if !self.is_enabled() || self.is_stopped() || data.is_empty() {
            return Ok(false);
        }
        let Some(rtp) = &self.rtp else {
            return Ok(false);
        };

        let sample = Sample {
            data: Bytes::copy_from_slice(data),
            duration,
            ..Default::default()
        };
        rtp.write_sample(&sample).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to write {} sample: {}", self.kind, e))
        })?;
        Ok(true)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Handle to the local camera/microphone stream
///
/// Cloning shares the same tracks.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

struct LocalMediaInner {
    stream_id: String,
    video: Option<Arc<LocalTrack>>,
    audio: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(
        stream_id: impl Into<String>,
        video: Option<LocalTrack>,
        audio: Option<LocalTrack>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                stream_id: stream_id.into(),
                video: video.map(Arc::new),
                audio: audio.map(Arc::new),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.inner.video.as_ref()
    }

    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.inner.audio.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.inner.video.iter().chain(self.inner.audio.iter())
    }

    /// Whether both handles refer to the same captured stream
    pub fn same_stream(&self, other: &LocalMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn video_enabled(&self) -> bool {
        self.video().map(|t| t.is_enabled()).unwrap_or(false)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio().map(|t| t.is_enabled()).unwrap_or(false)
    }

    /// Flip the camera flag and return the new value
    pub fn toggle_video(&self) -> bool {
        Self::toggle(self.video())
    }

    /// Flip the microphone flag and return the new value
    pub fn toggle_audio(&self) -> bool {
        Self::toggle(self.audio())
    }

    fn toggle(track: Option<&Arc<LocalTrack>>) -> bool {
        match track {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                enabled
            }
            None => false,
        }
    }

    /// Stop every track. Stopped tracks drop all further samples.
    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
        debug!("Local stream {} stopped", self.stream_id());
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks().all(|t| t.is_stopped())
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.inner.stream_id)
            .field("video", &self.inner.video)
            .field("audio", &self.inner.audio)
            .finish()
    }
}

/// A track received from the partner
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// Underlying RTP track; absent for synthetic tracks
    pub rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            rtp: None,
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Tracks received from the partner during the current call
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    /// Add a track, replacing one with the same id
    pub fn add(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Source of local capture handles
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire camera and microphone.
    ///
    /// Fails with [`AppError::MediaPermissionDenied`] when the user or the
    /// platform refuses access or no device is present.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia>;
}

/// Media source backed by local capture devices
///
/// Opening the device node is the permission check: a missing node or an
/// access error means the camera cannot be used.
pub struct DeviceMediaSource {
    video_device: PathBuf,
    audio_device: Option<PathBuf>,
}

impl DeviceMediaSource {
    pub fn new(video_device: impl Into<PathBuf>, audio_device: Option<PathBuf>) -> Self {
        Self {
            video_device: video_device.into(),
            audio_device,
        }
    }

    async fn probe(path: &Path, what: &str) -> Result<()> {
        match tokio::fs::OpenOptions::new().read(true).open(path).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let reason = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => {
                        format!("access to {} {} was refused", what, path.display())
                    }
                    std::io::ErrorKind::NotFound => {
                        format!("no {} found at {}", what, path.display())
                    }
                    _ => format!("cannot open {} {}: {}", what, path.display(), e),
                };
                warn!("Media acquisition failed: {}", reason);
                Err(AppError::MediaPermissionDenied(reason))
            }
        }
    }
}

/// RTP capability for the outgoing camera track
pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// RTP capability for the outgoing microphone track (Opus)
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: AUDIO_CLOCK_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        constraints.validate()?;

        Self::probe(&self.video_device, "camera").await?;
        if let Some(ref audio) = self.audio_device {
            Self::probe(audio, "microphone").await?;
        }

        let stream_id = format!("paircall-{}", uuid::Uuid::new_v4().simple());
        let video = LocalTrack::new(
            "video0",
            TrackKind::Video,
            Some(Arc::new(TrackLocalStaticSample::new(
                video_codec_capability(),
                "video0".to_string(),
                stream_id.clone(),
            ))),
        );
        let audio = LocalTrack::new(
            "audio0",
            TrackKind::Audio,
            Some(Arc::new(TrackLocalStaticSample::new(
                audio_codec_capability(),
                "audio0".to_string(),
                stream_id.clone(),
            ))),
        );

        info!(
            "Local media acquired from {} ({}x{}@{}fps, audio {} Hz)",
            self.video_device.display(),
            constraints.video.width.ideal,
            constraints.video.height.ideal,
            constraints.video.frame_rate.ideal,
            constraints.audio.sample_rate
        );

        Ok(LocalMedia::new(stream_id, Some(video), Some(audio)))
    }
}
