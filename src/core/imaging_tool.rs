//! Pipelines that put an image onto a disk.
//!
//! A tool reports progress as [`ImagingEvent`]s on the channel it is given and
//! resolves once the disk is written (and verified, when requested). It never
//! sends the terminal event; the session server owns that. Tools must stop
//! promptly once the cancellation token fires.

mod asr;
mod native;
mod simulated;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::events::ImagingEvent;
use super::models::{Disk, Image};

pub use asr::{AsrTool, parse_puppet_line};
pub use native::NativeTool;
pub use simulated::SimulatedTool;

/// Everything a pipeline needs to image one disk.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub image: Image,
    /// Verified local copy of the image.
    pub source: PathBuf,
    pub disk: Disk,
    /// Read the disk back after writing.
    pub verify: bool,
    /// Executable run after the write, as `<script> <disk> <image name>`.
    pub post_script: Option<PathBuf>,
}

pub trait ImagingTool: Send + Sync {
    fn apply(
        &self,
        req: &ApplyRequest,
        tx: mpsc::Sender<ImagingEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ImagingToolType {
    /// Stream the image onto the device and read it back.
    #[default]
    Native,
    /// Apple Software Restore.
    Asr,
    /// Scripted progress without touching any disk.
    Simulated,
}

pub fn create_tool(tool_type: ImagingToolType) -> Arc<dyn ImagingTool> {
    match tool_type {
        ImagingToolType::Native => Arc::new(NativeTool::default()),
        ImagingToolType::Asr => Arc::new(AsrTool),
        ImagingToolType::Simulated => Arc::new(SimulatedTool::default()),
    }
}

/// Run the post-imaging script, announcing the PostScript stage first.
pub(crate) async fn run_post_script(
    script: &Path,
    req: &ApplyRequest,
    tx: &mpsc::Sender<ImagingEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let _ = tx.send(ImagingEvent::post_script_started()).await;
    info!(script = %script.display(), disk = %req.disk, "Running post-imaging script");

    let child = Command::new(script)
        .arg(&req.disk.identifier)
        .arg(&req.image.name)
        .kill_on_drop(true)
        .output();

    let output = tokio::select! {
        output = child => output.map_err(|e| anyhow::anyhow!("Failed to run post script {}: {}", script.display(), e))?,
        _ = cancel.cancelled() => bail!("Cancelled during post script"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "Post script {} failed with {}: {}",
            script.display(),
            output.status,
            stderr.trim()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn request(post_script: Option<PathBuf>) -> ApplyRequest {
        ApplyRequest {
            image: Image {
                name: "base".to_string(),
                url: "https://images.example.com/base".to_string(),
                sha256: "0".repeat(64),
                sha512: "0".repeat(128),
            },
            source: PathBuf::from("/nonexistent"),
            disk: Disk::new("/dev/null"),
            verify: false,
            post_script,
        }
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("post.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_post_script_receives_disk_and_image() {
        let temp = tempdir().unwrap();
        let marker = temp.path().join("args");
        let script = write_script(temp.path(), &format!("echo \"$1 $2\" > {}", marker.display()));
        let (tx, mut rx) = mpsc::channel(4);

        run_post_script(&script, &request(None), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(ImagingEvent::post_script_started()));
        assert_eq!(std::fs::read_to_string(marker).unwrap().trim(), "/dev/null base");
    }

    #[tokio::test]
    async fn test_post_script_failure_carries_stderr() {
        let temp = tempdir().unwrap();
        let script = write_script(temp.path(), "echo 'no bless' >&2; exit 3");
        let (tx, _rx) = mpsc::channel(4);

        let err = run_post_script(&script, &request(None), &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no bless"));
    }
}
