//! Media processing model: kinds, targets, probed metadata, tasks.
//!
//! The need/skip decision lives here because it is a pure rule over
//! metadata and targets; workers only execute it.

use crate::domain::MediaType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image = 0,
    Video = 1,
    Audio = 2,
    Document = 3,
    Unknown = 4,
}

impl From<MediaType> for MediaKind {
    fn from(t: MediaType) -> Self {
        match t {
            MediaType::Photo | MediaType::Sticker => MediaKind::Image,
            MediaType::Video | MediaType::Animation => MediaKind::Video,
            MediaType::Audio | MediaType::Voice => MediaKind::Audio,
            MediaType::Document => MediaKind::Document,
            MediaType::Other => MediaKind::Unknown,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handler().name)
    }
}

/// Target output for one media kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSettings {
    pub max_width: u32,
    pub max_height: u32,
    /// Bits per second; 0 = no bitrate target.
    pub max_bitrate: u64,
    pub codec: String,
    /// Encoder quality knob (CRF for video, q for images/audio).
    pub quality: u8,
}

impl MediaSettings {
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => Self {
                max_width: 2560,
                max_height: 2560,
                max_bitrate: 0,
                codec: "mjpeg".into(),
                quality: 85,
            },
            MediaKind::Video => Self {
                max_width: 1920,
                max_height: 1080,
                max_bitrate: 2_500_000,
                codec: "h264".into(),
                quality: 23,
            },
            MediaKind::Audio => Self {
                max_width: 0,
                max_height: 0,
                max_bitrate: 128_000,
                codec: "opus".into(),
                quality: 5,
            },
            MediaKind::Document | MediaKind::Unknown => Self {
                max_width: 0,
                max_height: 0,
                max_bitrate: 0,
                codec: String::new(),
                quality: 0,
            },
        }
    }
}

/// Probed properties of a source file. Every field is optional; probes are best effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub codec: Option<String>,
    pub size_bytes: Option<u64>,
}

/// Decision policy knobs. Slack margins avoid reprocessing files already close to target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingThresholds {
    pub enabled: bool,
    pub resolution_slack: f64,
    pub bitrate_slack: f64,
    /// Files below this size are never worth transcoding.
    pub min_size_bytes: u64,
    /// Images at or under this size are kept even in a foreign codec.
    pub image_max_bytes: u64,
}

impl Default for ProcessingThresholds {
    fn default() -> Self {
        Self {
            enabled: true,
            resolution_slack: 1.2,
            bitrate_slack: 1.5,
            min_size_bytes: 256 * 1024,
            image_max_bytes: 1024 * 1024,
        }
    }
}

/// Per-kind behavior, selected once from [`HANDLERS`] by discriminant.
pub struct KindHandler {
    pub kind: MediaKind,
    pub name: &'static str,
    /// Whether the transcoder is ever invoked for this kind.
    pub transformable: bool,
    needs: fn(&MediaMetadata, &MediaSettings, &ProcessingThresholds) -> bool,
}

static HANDLERS: [KindHandler; 5] = [
    KindHandler {
        kind: MediaKind::Image,
        name: "image",
        transformable: true,
        needs: image_needs_processing,
    },
    KindHandler {
        kind: MediaKind::Video,
        name: "video",
        transformable: true,
        needs: video_needs_processing,
    },
    KindHandler {
        kind: MediaKind::Audio,
        name: "audio",
        transformable: true,
        needs: audio_needs_processing,
    },
    KindHandler {
        kind: MediaKind::Document,
        name: "document",
        transformable: false,
        needs: never,
    },
    KindHandler {
        kind: MediaKind::Unknown,
        name: "unknown",
        transformable: false,
        needs: never,
    },
];

impl MediaKind {
    pub fn handler(self) -> &'static KindHandler {
        &HANDLERS[self as usize]
    }
}

/// Whether a source must be transcoded to meet `settings`.
///
/// Without metadata a transformable kind is processed: nothing proves it is
/// already within target.
pub fn needs_processing(
    kind: MediaKind,
    metadata: Option<&MediaMetadata>,
    settings: &MediaSettings,
    thresholds: &ProcessingThresholds,
) -> bool {
    let handler = kind.handler();
    if !thresholds.enabled || !handler.transformable {
        return false;
    }
    let Some(meta) = metadata else {
        return true;
    };
    if meta
        .size_bytes
        .is_some_and(|size| size < thresholds.min_size_bytes)
    {
        return false;
    }
    (handler.needs)(meta, settings, thresholds)
}

fn never(_: &MediaMetadata, _: &MediaSettings, _: &ProcessingThresholds) -> bool {
    false
}

fn image_needs_processing(
    meta: &MediaMetadata,
    settings: &MediaSettings,
    t: &ProcessingThresholds,
) -> bool {
    let small_enough = meta.size_bytes.is_some_and(|s| s <= t.image_max_bytes);
    !(within_resolution(meta, settings, t) && (small_enough || codec_matches(meta, settings)))
}

fn video_needs_processing(
    meta: &MediaMetadata,
    settings: &MediaSettings,
    t: &ProcessingThresholds,
) -> bool {
    !(codec_matches(meta, settings)
        && within_resolution(meta, settings, t)
        && within_bitrate(meta, settings, t))
}

fn audio_needs_processing(
    meta: &MediaMetadata,
    settings: &MediaSettings,
    t: &ProcessingThresholds,
) -> bool {
    let already_smaller = match (meta.bitrate, settings.max_bitrate) {
        (Some(b), target) if target > 0 => b <= target,
        _ => false,
    };
    !(already_smaller || (codec_matches(meta, settings) && within_bitrate(meta, settings, t)))
}

/// Compares long and short edges so portrait sources are judged like landscape ones.
fn within_resolution(
    meta: &MediaMetadata,
    settings: &MediaSettings,
    t: &ProcessingThresholds,
) -> bool {
    if settings.max_width == 0 || settings.max_height == 0 {
        return true;
    }
    let (Some(w), Some(h)) = (meta.width, meta.height) else {
        return false;
    };
    let (long, short) = (w.max(h) as f64, w.min(h) as f64);
    let max_long = settings.max_width.max(settings.max_height) as f64 * t.resolution_slack;
    let max_short = settings.max_width.min(settings.max_height) as f64 * t.resolution_slack;
    long <= max_long && short <= max_short
}

fn within_bitrate(meta: &MediaMetadata, settings: &MediaSettings, t: &ProcessingThresholds) -> bool {
    if settings.max_bitrate == 0 {
        return true;
    }
    meta.bitrate
        .is_some_and(|b| b as f64 <= settings.max_bitrate as f64 * t.bitrate_slack)
}

fn codec_matches(meta: &MediaMetadata, settings: &MediaSettings) -> bool {
    match meta.codec.as_deref() {
        Some(codec) => normalize_codec(codec) == normalize_codec(&settings.codec),
        None => false,
    }
}

fn normalize_codec(codec: &str) -> String {
    match codec.trim().to_ascii_lowercase().as_str() {
        "avc" | "avc1" | "x264" | "libx264" => "h264".into(),
        "hevc" | "hvc1" | "x265" | "libx265" => "h265".into(),
        "jpeg" | "jpg" => "mjpeg".into(),
        "libopus" => "opus".into(),
        other => other.to_string(),
    }
}

/// Lifecycle of one media task inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Validating,
    Skipped,
    Transforming,
    Succeeded,
    Failed,
    PermanentlyFailed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::PermanentlyFailed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Validating => "validating",
            TaskState::Skipped => "skipped",
            TaskState::Transforming => "transforming",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::PermanentlyFailed => "permanently_failed",
        };
        f.write_str(s)
    }
}

/// One transformation job. Owned by exactly one worker while it runs.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub media_kind: MediaKind,
    /// Higher is taken first by the media pool; FIFO within a priority.
    pub priority: u8,
    pub settings: MediaSettings,
    pub metadata: Option<MediaMetadata>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
}

impl ProcessingTask {
    pub fn new(input_path: PathBuf, output_path: PathBuf, media_kind: MediaKind) -> Self {
        Self {
            input_path,
            output_path,
            media_kind,
            priority: 0,
            settings: MediaSettings::for_kind(media_kind),
            metadata: None,
            attempts: 0,
            max_attempts: 3,
            created_at: Utc::now(),
            state: TaskState::Pending,
        }
    }

    pub fn with_settings(mut self, settings: MediaSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Why a task ended in a plain copy rather than a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyReason {
    NotNeeded,
    TransformFailed,
    InvalidOutput,
}

/// Final result delivered to whoever enqueued the task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Transformed { output: PathBuf, bytes: u64 },
    Copied { output: PathBuf, bytes: u64, reason: CopyReason },
    PermanentlyFailed { error: String, attempts: u32 },
    /// Pool shut down before the task ran to completion.
    Unfinished,
}

impl TaskOutcome {
    pub fn output(&self) -> Option<&PathBuf> {
        match self {
            TaskOutcome::Transformed { output, .. } | TaskOutcome::Copied { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.output().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_meta(w: u32, h: u32, bitrate: u64, codec: &str) -> MediaMetadata {
        MediaMetadata {
            duration_secs: Some(30.0),
            width: Some(w),
            height: Some(h),
            bitrate: Some(bitrate),
            codec: Some(codec.into()),
            size_bytes: Some(50 * 1024 * 1024),
        }
    }

    #[test]
    fn handler_table_is_indexed_by_discriminant() {
        for kind in [
            MediaKind::Image,
            MediaKind::Video,
            MediaKind::Audio,
            MediaKind::Document,
            MediaKind::Unknown,
        ] {
            assert_eq!(kind.handler().kind, kind);
        }
        assert_eq!(MediaKind::from(MediaType::Voice), MediaKind::Audio);
        assert_eq!(MediaKind::from(MediaType::Sticker), MediaKind::Image);
        assert_eq!(MediaKind::Video.to_string(), "video");
    }

    #[test]
    fn video_within_slack_is_skipped() {
        let settings = MediaSettings::for_kind(MediaKind::Video);
        let t = ProcessingThresholds::default();
        // 1.1x resolution and 1.4x bitrate are inside the 1.2x / 1.5x slack.
        let meta = video_meta(2100, 1180, 3_500_000, "avc1");
        assert!(!needs_processing(MediaKind::Video, Some(&meta), &settings, &t));
        // Portrait orientation of the same dimensions.
        let meta = video_meta(1180, 2100, 3_500_000, "h264");
        assert!(!needs_processing(MediaKind::Video, Some(&meta), &settings, &t));
    }

    #[test]
    fn video_over_target_or_foreign_codec_is_processed() {
        let settings = MediaSettings::for_kind(MediaKind::Video);
        let t = ProcessingThresholds::default();
        let big = video_meta(3840, 2160, 3_000_000, "h264");
        assert!(needs_processing(MediaKind::Video, Some(&big), &settings, &t));
        let fat = video_meta(1920, 1080, 8_000_000, "h264");
        assert!(needs_processing(MediaKind::Video, Some(&fat), &settings, &t));
        let vp9 = video_meta(1280, 720, 1_000_000, "vp9");
        assert!(needs_processing(MediaKind::Video, Some(&vp9), &settings, &t));
    }

    #[test]
    fn disabled_processing_and_documents_never_transform() {
        let settings = MediaSettings::for_kind(MediaKind::Video);
        let meta = video_meta(3840, 2160, 9_000_000, "vp9");
        let disabled = ProcessingThresholds {
            enabled: false,
            ..Default::default()
        };
        assert!(!needs_processing(MediaKind::Video, Some(&meta), &settings, &disabled));
        let t = ProcessingThresholds::default();
        assert!(!needs_processing(MediaKind::Document, None, &settings, &t));
        assert!(!needs_processing(MediaKind::Unknown, Some(&meta), &settings, &t));
    }

    #[test]
    fn missing_metadata_processes_and_tiny_files_skip() {
        let settings = MediaSettings::for_kind(MediaKind::Image);
        let t = ProcessingThresholds::default();
        assert!(needs_processing(MediaKind::Image, None, &settings, &t));
        let tiny = MediaMetadata {
            size_bytes: Some(10 * 1024),
            ..Default::default()
        };
        assert!(!needs_processing(MediaKind::Image, Some(&tiny), &settings, &t));
    }

    #[test]
    fn images_and_audio_use_their_own_rules() {
        let t = ProcessingThresholds::default();
        let image = MediaSettings::for_kind(MediaKind::Image);
        let small_png = MediaMetadata {
            width: Some(1200),
            height: Some(800),
            codec: Some("png".into()),
            size_bytes: Some(700 * 1024),
            ..Default::default()
        };
        assert!(!needs_processing(MediaKind::Image, Some(&small_png), &image, &t));
        let huge_png = MediaMetadata {
            width: Some(6000),
            height: Some(4000),
            ..small_png.clone()
        };
        assert!(needs_processing(MediaKind::Image, Some(&huge_png), &image, &t));

        let audio = MediaSettings::for_kind(MediaKind::Audio);
        let low_mp3 = MediaMetadata {
            bitrate: Some(96_000),
            codec: Some("mp3".into()),
            size_bytes: Some(2 * 1024 * 1024),
            ..Default::default()
        };
        assert!(!needs_processing(MediaKind::Audio, Some(&low_mp3), &audio, &t));
        let flac = MediaMetadata {
            bitrate: Some(900_000),
            codec: Some("flac".into()),
            size_bytes: Some(30 * 1024 * 1024),
            ..Default::default()
        };
        assert!(needs_processing(MediaKind::Audio, Some(&flac), &audio, &t));
    }

    #[test]
    fn outcome_reports_output_only_on_success() {
        let ok = TaskOutcome::Copied {
            output: PathBuf::from("/m/a.jpg"),
            bytes: 3,
            reason: CopyReason::NotNeeded,
        };
        assert!(ok.is_success());
        let failed = TaskOutcome::PermanentlyFailed {
            error: "x".into(),
            attempts: 3,
        };
        assert!(failed.output().is_none());
        assert!(TaskState::PermanentlyFailed.is_terminal());
        assert!(!TaskState::Failed.is_terminal());
    }
}
