//! Implements TranscoderPort with the ffmpeg/ffprobe binaries.

use crate::domain::{DomainError, MediaKind, MediaMetadata, MediaSettings};
use crate::ports::TranscoderPort;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Lines of stderr kept in a transform error.
const STDERR_TAIL_LINES: usize = 8;

pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

#[async_trait]
impl TranscoderPort for FfmpegTranscoder {
    async fn probe(&self, input: &Path) -> Result<Option<MediaMetadata>, DomainError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DomainError::Transform(format!("spawn ffprobe: {}", e)))?;
        if !output.status.success() {
            debug!(path = %input.display(), "ffprobe could not read input");
            return Ok(None);
        }
        Ok(parse_probe(&output.stdout))
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        kind: MediaKind,
        settings: &MediaSettings,
    ) -> Result<(), DomainError> {
        let args = transcode_args(kind, settings).ok_or_else(|| {
            DomainError::Transform(format!("{} media is not transcodable", kind))
        })?;
        let started = std::time::Instant::now();
        let result = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(input)
            .args(&args)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DomainError::Transform(format!("spawn ffmpeg: {}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
            return Err(DomainError::Transform(format!(
                "ffmpeg exited with {}: {}",
                result.status.code().unwrap_or(-1),
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }
        info!(
            input = %input.display(),
            output = %output.display(),
            %kind,
            secs = started.elapsed().as_secs_f64(),
            "transcoded"
        );
        Ok(())
    }
}

fn encoder_for(codec: &str) -> &str {
    match codec {
        "h264" => "libx264",
        "h265" | "hevc" => "libx265",
        "opus" => "libopus",
        "aac" => "aac",
        "mp3" => "libmp3lame",
        other => other,
    }
}

/// Scale down to fit the target box; never upscale.
fn scale_filter(settings: &MediaSettings) -> String {
    format!(
        "scale='min(iw,{w})':'min(ih,{h})':force_original_aspect_ratio=decrease:force_divisible_by=2",
        w = settings.max_width,
        h = settings.max_height
    )
}

/// ffmpeg arguments between `-i <input>` and the output path.
fn transcode_args(kind: MediaKind, settings: &MediaSettings) -> Option<Vec<String>> {
    let mut args: Vec<String> = Vec::new();
    match kind {
        MediaKind::Video => {
            if settings.max_width > 0 && settings.max_height > 0 {
                args.extend(["-vf".into(), scale_filter(settings)]);
            }
            args.extend([
                "-c:v".into(),
                encoder_for(&settings.codec).into(),
                "-crf".into(),
                settings.quality.to_string(),
                "-preset".into(),
                "medium".into(),
            ]);
            if settings.max_bitrate > 0 {
                let kbps = settings.max_bitrate / 1000;
                args.extend([
                    "-maxrate".into(),
                    format!("{}k", kbps),
                    "-bufsize".into(),
                    format!("{}k", kbps * 2),
                ]);
            }
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "128k".into(),
                "-movflags".into(),
                "+faststart".into(),
            ]);
        }
        MediaKind::Image => {
            if settings.max_width > 0 && settings.max_height > 0 {
                args.extend(["-vf".into(), scale_filter(settings)]);
            }
            // mjpeg qscale: 2 (best) .. 31 (worst)
            let q = 2 + (100u32.saturating_sub(settings.quality as u32) * 29 / 100);
            args.extend(["-q:v".into(), q.to_string(), "-frames:v".into(), "1".into()]);
        }
        MediaKind::Audio => {
            args.extend(["-vn".into(), "-c:a".into(), encoder_for(&settings.codec).into()]);
            if settings.max_bitrate > 0 {
                args.extend(["-b:a".into(), format!("{}k", settings.max_bitrate / 1000)]);
            }
        }
        MediaKind::Document | MediaKind::Unknown => return None,
    }
    Some(args)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
}

fn parse_probe(stdout: &[u8]) -> Option<MediaMetadata> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let primary = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .or_else(|| {
            probe
                .streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some("audio"))
        });
    let format = probe.format.as_ref();
    let num = |s: Option<&String>| s.and_then(|v| v.parse::<f64>().ok());
    Some(MediaMetadata {
        duration_secs: format.and_then(|f| num(f.duration.as_ref())),
        width: primary.and_then(|s| s.width),
        height: primary.and_then(|s| s.height),
        bitrate: primary
            .and_then(|s| num(s.bit_rate.as_ref()))
            .or_else(|| format.and_then(|f| num(f.bit_rate.as_ref())))
            .map(|b| b as u64),
        codec: primary.and_then(|s| s.codec_name.clone()),
        size_bytes: format.and_then(|f| num(f.size.as_ref())).map(|s| s as u64),
    })
}
