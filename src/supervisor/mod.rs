//! Transcoder process supervision
//!
//! The supervisor owns everything about one external transcoder: preparing
//! its output directory, launching it, deciding when its output is playable,
//! and stopping it.
//!
//! ```text
//!   start()                      wait_ready()                 terminate()
//!     │                              │                             │
//!     ├─ purge output dir            ├─ poll manifest ─┐           ├─ "q\n" on stdin
//!     ├─ Launcher::command()         │   every 500ms   │           ├─ wait grace
//!     └─ spawn ──► ProcessHandle     │◄────────────────┘           └─ kill
//!                   ├─ exit watcher task
//!                   └─ stderr drain task
//! ```

pub mod output;
pub mod pipeline;
pub mod process;
pub mod readiness;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

pub use output::{OutputLayout, Playback};
pub use pipeline::{EncodeParams, FfmpegLauncher, HlsParams, Launcher, PipelineConfig};
pub use process::{ProcessExit, ProcessHandle};
pub use readiness::ReadinessProbe;

/// Starts, probes and stops transcoder processes
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    probe: ReadinessProbe,
    tasks: TaskTracker,
}

impl Supervisor {
    /// Create a supervisor whose monitor tasks are spawned on `tasks`
    pub fn new(launcher: Arc<dyn Launcher>, probe: ReadinessProbe, tasks: TaskTracker) -> Self {
        Self {
            launcher,
            probe,
            tasks,
        }
    }

    /// Readiness probe settings
    pub fn probe(&self) -> ReadinessProbe {
        self.probe
    }

    /// Launch the transcoder for a pipeline
    ///
    /// Stale output from an earlier session of the same stream is removed
    /// first. `token` bounds the lifetime of the diagnostics drain.
    pub async fn start(
        &self,
        pipeline: &PipelineConfig,
        token: CancellationToken,
    ) -> Result<Arc<ProcessHandle>> {
        pipeline.output.prepare().await?;

        let command = self.launcher.command(pipeline);
        let process = ProcessHandle::spawn(command, pipeline.key.clone(), &self.tasks, token)?;

        tracing::info!(
            stream = %pipeline.key,
            source = %pipeline.source,
            pid = ?process.pid(),
            gop = pipeline.encode.gop,
            resolution = ?pipeline.encode.resolution,
            source_codec = ?pipeline.encode.source_codec,
            manifest = %pipeline.output.manifest.display(),
            "Transcoder started"
        );

        Ok(Arc::new(process))
    }

    /// Wait until the pipeline's manifest lists a playable segment
    ///
    /// Fails with [`Error::ReadinessTimeout`] when the probe runs out of
    /// attempts, or [`Error::UpstreamUnreachable`] if the process exits
    /// first, which usually means ffmpeg could not open the source.
    pub async fn wait_ready(&self, pipeline: &PipelineConfig, process: &ProcessHandle) -> Result<()> {
        tokio::select! {
            exit = process.wait() => Err(Error::UpstreamUnreachable {
                key: pipeline.key.clone(),
                reason: format!("transcoder exited before first segment ({})", exit),
            }),
            ready = self.probe.wait(&pipeline.output.manifest) => {
                if ready {
                    Ok(())
                } else {
                    Err(Error::ReadinessTimeout {
                        key: pipeline.key.clone(),
                        waited: self.probe.budget(),
                    })
                }
            }
        }
    }

    /// Stop a transcoder, killing it if it outlives `grace`
    pub async fn terminate(&self, process: &ProcessHandle, grace: Duration) -> Result<ProcessExit> {
        process.terminate(grace).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tokio::process::Command;

    use super::*;
    use crate::registry::StreamKey;
    use crate::source::SourceLocator;

    /// Runs a shell script with the manifest path as `$1`
    struct ScriptLauncher(&'static str);

    impl Launcher for ScriptLauncher {
        fn command(&self, pipeline: &PipelineConfig) -> Command {
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(self.0)
                .arg("transcoder")
                .arg(&pipeline.output.manifest);
            command
        }
    }

    fn pipeline(root: &Path) -> PipelineConfig {
        let key = StreamKey::new(1, 1);
        PipelineConfig {
            output: OutputLayout::for_key(root, "/hls", "index.m3u8", &key),
            source: SourceLocator::public("rtsp://cam/1"),
            encode: EncodeParams::from_stream(None),
            hls: HlsParams::default(),
            key,
        }
    }

    fn supervisor(script: &'static str) -> Supervisor {
        Supervisor::new(
            Arc::new(ScriptLauncher(script)),
            ReadinessProbe::new(Duration::from_millis(20), 10),
            TaskTracker::new(),
        )
    }

    #[tokio::test]
    async fn test_start_and_ready() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = pipeline(root.path());
        let supervisor =
            supervisor("printf '#EXTM3U\\n#EXTINF:1.0,\\nindex0.ts\\n' > \"$1\"; read -r cmd");

        let process = supervisor
            .start(&pipeline, CancellationToken::new())
            .await
            .unwrap();
        supervisor.wait_ready(&pipeline, &process).await.unwrap();

        let exit = supervisor
            .terminate(&process, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!exit.killed);
    }

    #[tokio::test]
    async fn test_start_purges_previous_output() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = pipeline(root.path());
        std::fs::create_dir_all(&pipeline.output.dir).unwrap();
        std::fs::write(&pipeline.output.manifest, "#EXTM3U\n#EXTINF:1.0,\nold.ts\n").unwrap();

        // Never writes a manifest; the stale one must not count
        let supervisor = supervisor("read -r cmd");
        let process = supervisor
            .start(&pipeline, CancellationToken::new())
            .await
            .unwrap();

        let err = supervisor.wait_ready(&pipeline, &process).await.unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));

        supervisor
            .terminate(&process, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = pipeline(root.path());
        let supervisor = supervisor("echo 'Connection refused' >&2; exit 1");

        let process = supervisor
            .start(&pipeline, CancellationToken::new())
            .await
            .unwrap();
        let err = supervisor.wait_ready(&pipeline, &process).await.unwrap_err();

        let Error::UpstreamUnreachable { reason, .. } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(reason.contains("before first segment"));
        assert!(err.is_retryable());
    }
}
