//! External tool wrappers.

pub mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;
