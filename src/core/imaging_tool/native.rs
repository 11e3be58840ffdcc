use crate::core::events::{ImagingEvent, percent_of};
use crate::core::hasher::{HashAlgorithm, hasher_for};
use crate::core::imaging_tool::{ApplyRequest, ImagingTool, run_post_script};
use anyhow::{Context, Result, anyhow, bail};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

/// Buffer size for device I/O (1 MiB)
const BUFFER_SIZE: usize = 1024 * 1024;

/// Writes the image straight onto the target device node.
///
/// Phases:
/// - Imaging: stream the source onto the device, then fsync
/// - PostScript: optional hook, see [`ApplyRequest::post_script`]
/// - Verifying: read back the written range and compare its SHA-256 with
///   the image's catalog digest
pub struct NativeTool {
    pub buffer_size: usize,
}

impl Default for NativeTool {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE,
        }
    }
}

impl ImagingTool for NativeTool {
    fn apply(
        &self,
        req: &ApplyRequest,
        tx: mpsc::Sender<ImagingEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        let req = req.clone();
        let buffer_size = self.buffer_size.max(512);

        let span = info_span!(
            "native_imaging",
            image = %req.image.name,
            disk = %req.disk
        );

        Box::pin(
            async move {
                let start_time = Instant::now();
                info!("Writing image to disk");

                let written = {
                    let source = req.source.clone();
                    let device = req.disk.path().to_path_buf();
                    let (tx, cancel) = (tx.clone(), cancel.clone());
                    tokio::task::spawn_blocking(move || {
                        write_image(&source, &device, buffer_size, &tx, &cancel)
                    })
                    .await??
                };

                info!(
                    bytes = written,
                    duration_secs = start_time.elapsed().as_secs(),
                    "Write complete"
                );

                if let Some(script) = &req.post_script {
                    run_post_script(script, &req, &tx, &cancel).await?;
                }

                if req.verify {
                    info!("Verifying written image");
                    let device = req.disk.path().to_path_buf();
                    let expected = req.image.sha256.clone();
                    let (tx, cancel) = (tx.clone(), cancel.clone());
                    tokio::task::spawn_blocking(move || {
                        verify_device(&device, written, &expected, buffer_size, &tx, &cancel)
                    })
                    .await??;
                    info!("Verification complete");
                }

                Ok(())
            }
            .instrument(span),
        )
    }
}

/// Copy `source` onto `device`, returning the number of bytes written.
fn write_image(
    source: &Path,
    device: &Path,
    buffer_size: usize,
    tx: &mpsc::Sender<ImagingEvent>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut image = File::open(source)
        .with_context(|| format!("Failed to open image {}", source.display()))?;
    let total = image.metadata()?.len();

    let mut device_file = OpenOptions::new()
        .write(true)
        .open(device)
        .with_context(|| format!("Failed to open {} for writing", device.display()))?;

    let mut buffer = vec![0u8; buffer_size];
    let mut written: u64 = 0;
    let mut last_percent = None;

    let _ = tx.blocking_send(ImagingEvent::imaging(0));

    while written < total {
        if cancel.is_cancelled() {
            bail!("Cancelled while writing");
        }

        let to_read = std::cmp::min(buffer_size as u64, total - written) as usize;
        image
            .read_exact(&mut buffer[..to_read])
            .context("Failed to read image")?;
        device_file
            .write_all(&buffer[..to_read])
            .with_context(|| format!("Failed to write to {} at offset {}", device.display(), written))?;
        written += to_read as u64;

        let percent = percent_of(written, total);
        if last_percent != Some(percent) {
            let _ = tx.blocking_send(ImagingEvent::imaging(percent));
            last_percent = Some(percent);
        }
    }

    if last_percent != Some(100) {
        let _ = tx.blocking_send(ImagingEvent::imaging(100));
    }

    device_file.flush()?;
    device_file
        .sync_all()
        .with_context(|| format!("Failed to sync {}", device.display()))?;

    Ok(written)
}

/// Hash the first `len` bytes of `device` and compare with `expected`.
fn verify_device(
    device: &Path,
    len: u64,
    expected: &str,
    buffer_size: usize,
    tx: &mpsc::Sender<ImagingEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut device_file = File::open(device)
        .with_context(|| format!("Failed to open {} for verification", device.display()))?;
    let mut hasher = hasher_for(HashAlgorithm::Sha256);
    let mut buffer = vec![0u8; buffer_size];
    let mut remaining = len;
    let mut last_percent = None;

    let _ = tx.blocking_send(ImagingEvent::verifying(0));

    while remaining > 0 {
        if cancel.is_cancelled() {
            bail!("Cancelled while verifying");
        }

        let chunk = std::cmp::min(buffer_size as u64, remaining) as usize;
        device_file
            .read_exact(&mut buffer[..chunk])
            .map_err(|e| anyhow!("Failed to read back {}: {}", device.display(), e))?;
        hasher.update(&buffer[..chunk]);
        remaining -= chunk as u64;

        let percent = percent_of(len - remaining, len);
        if last_percent != Some(percent) {
            let _ = tx.blocking_send(ImagingEvent::verifying(percent));
            last_percent = Some(percent);
        }
    }

    if last_percent != Some(100) {
        let _ = tx.blocking_send(ImagingEvent::verifying(100));
    }

    let actual = hasher.finalize();
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "Verification failed: disk contents hash to {} but the image is {}",
            actual,
            expected
        );
    }

    Ok(())
}
