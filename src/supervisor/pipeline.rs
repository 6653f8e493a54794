//! Transcoding pipeline description and command construction

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use super::output::OutputLayout;
use crate::registry::StreamKey;
use crate::source::{SourceLocator, StreamConfig, DEFAULT_FRAME_RATE};

/// Encoder parameters derived from the channel's stream configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    /// Source frame rate (fps)
    pub frame_rate: f64,
    /// Group-of-pictures length in frames (one keyframe per second)
    pub gop: u32,
    /// Source resolution, if known
    pub resolution: Option<(u32, u32)>,
    /// Source codec name, if known
    pub source_codec: Option<String>,
}

impl EncodeParams {
    /// Derive parameters from an optional stream configuration
    pub fn from_stream(stream: Option<&StreamConfig>) -> Self {
        let frame_rate = stream.map_or(DEFAULT_FRAME_RATE, StreamConfig::frame_rate);

        Self {
            frame_rate,
            gop: (frame_rate as u32).max(1),
            resolution: stream.and_then(StreamConfig::resolution),
            source_codec: stream.and_then(|s| s.video_codec.clone()),
        }
    }
}

/// HLS muxer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HlsParams {
    /// Target segment duration in seconds
    pub segment_secs: u32,
    /// Number of segments kept in the manifest
    pub list_size: u32,
}

impl Default for HlsParams {
    fn default() -> Self {
        Self {
            segment_secs: 1,
            list_size: 3,
        }
    }
}

/// Everything needed to launch one transcoder
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub key: StreamKey,
    pub source: SourceLocator,
    pub output: OutputLayout,
    pub encode: EncodeParams,
    pub hls: HlsParams,
}

/// Builds the command for a pipeline
///
/// The supervisor overrides stdio on the returned command, so implementations
/// only need to set the program and its arguments.
pub trait Launcher: Send + Sync + 'static {
    fn command(&self, pipeline: &PipelineConfig) -> Command;
}

/// Launcher for an ffmpeg binary producing low-latency H.264 HLS
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: PathBuf,
    log_level: String,
}

impl FfmpegLauncher {
    /// Use `ffmpeg` from `PATH`
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            log_level: "warning".into(),
        }
    }

    /// Use a specific ffmpeg binary
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Set ffmpeg's `-loglevel`
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Argument list for a pipeline
    pub fn args(&self, pipeline: &PipelineConfig) -> Vec<OsString> {
        let gop = pipeline.encode.gop.to_string();
        let mut args: Vec<OsString> = Vec::with_capacity(64);

        let mut push = |items: &[&str]| args.extend(items.iter().map(OsString::from));

        push(&["-hide_banner", "-loglevel", self.log_level.as_str()]);

        // Input: RTSP over TCP, tuned for a fast first frame
        push(&[
            "-rtsp_transport",
            "tcp",
            "-fflags",
            "genpts",
            "-flags",
            "low_delay",
            "-analyzeduration",
            "2000000",
            "-probesize",
            "500000",
            "-i",
            pipeline.source.as_str(),
        ]);

        // Video: first stream only, baseline H.264 for broad player support
        push(&[
            "-map",
            "0:v:0",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-profile:v",
            "baseline",
            "-level",
            "3.1",
            "-pix_fmt",
            "yuv420p",
            "-g",
            gop.as_str(),
            "-keyint_min",
            gop.as_str(),
            "-sc_threshold",
            "0",
            "-bf",
            "0",
            "-refs",
            "1",
            "-coder",
            "cavlc",
            "-threads",
            "0",
        ]);

        let segment = pipeline.hls.segment_secs.to_string();
        let list_size = pipeline.hls.list_size.to_string();
        push(&[
            "-f",
            "hls",
            "-hls_time",
            segment.as_str(),
            "-hls_list_size",
            list_size.as_str(),
            "-hls_flags",
            "delete_segments+independent_segments",
        ]);

        args.push(pipeline.output.manifest.clone().into_os_string());
        args
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for FfmpegLauncher {
    fn command(&self, pipeline: &PipelineConfig) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(pipeline))
            .current_dir(&pipeline.output.dir)
            .stdin(Stdio::piped());
        command
    }
}
