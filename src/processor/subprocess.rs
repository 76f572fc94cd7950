//! External worker processor
//!
//! Spawns the configured program per photo, writes the raw bytes to its stdin
//! and reads the cleaned image from stdout. Exit status 0 means success; any
//! other status fails the stage with the tail of stderr attached. The child is
//! spawned with `kill_on_drop(true)`, so a timed-out call does not leave the
//! worker running.

use super::{normalize_output, ImageProcessor, ProcessOptions};
use crate::error::PhotoError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Stderr kept in error messages
const STDERR_TAIL: usize = 512;

pub struct SubprocessProcessor {
    program: PathBuf,
    args: Vec<String>,
}

impl SubprocessProcessor {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Arguments with `{max_dimension}` and `{canvas_color}` filled in
    fn render_args(&self, options: &ProcessOptions) -> Vec<String> {
        let max_dimension = options.max_dimension.to_string();
        let canvas_color = options.canvas_color.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{max_dimension}", &max_dimension)
                    .replace("{canvas_color}", &canvas_color)
            })
            .collect()
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[async_trait]
impl ImageProcessor for SubprocessProcessor {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn process(&self, input: Bytes, options: ProcessOptions) -> Result<Vec<u8>, PhotoError> {
        let args = self.render_args(&options);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PhotoError::ProcessingFailed(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PhotoError::Internal("worker stdin not captured".into()))?;

        // Feed stdin concurrently so a worker that streams output cannot deadlock
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await.map_err(|e| {
            PhotoError::ProcessingFailed(format!("waiting for {}: {}", self.program.display(), e))
        })?;

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Worker closed stdin early"),
            Err(e) => warn!(error = %e, "Worker stdin task failed"),
        }

        if !output.status.success() {
            return Err(PhotoError::ProcessingFailed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        if output.stdout.is_empty() {
            return Err(PhotoError::ProcessingFailed(format!(
                "{} produced no output",
                self.program.display()
            )));
        }

        debug!(
            program = %self.program.display(),
            output = output.stdout.len(),
            "Worker finished"
        );

        let stdout = output.stdout;
        tokio::task::spawn_blocking(move || normalize_output(stdout, &options))
            .await
            .map_err(|e| PhotoError::ProcessingFailed(format!("worker task failed: {}", e)))?
    }
}
