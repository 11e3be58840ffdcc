use crate::core::events::ImagingEvent;
use crate::core::imaging_tool::{ApplyRequest, ImagingTool};
use anyhow::{Result, anyhow, bail};
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// "PPRG\t45\trestore", also PSTT (phase start) and PSTP (phase stop)
static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(PSTT|PPRG|PSTP)\s+(\d+)\s+(\w+)").expect("progress regex is valid")
});

// "PINF\tInverting target volume..."
static INVERTING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^PINF\s.*\binvert").expect("inverting regex is valid"));

/// Translate one line of `asr --puppetstrings` output into an event.
pub fn parse_puppet_line(line: &str) -> Option<ImagingEvent> {
    let line = line.trim_end();

    if let Some(capts) = PROGRESS_LINE.captures(line) {
        let percent: u8 = capts[2].parse::<u16>().ok()?.min(100) as u8;
        return match &capts[3] {
            "restore" | "copy" => Some(ImagingEvent::imaging(percent)),
            "verify" => Some(ImagingEvent::verifying(percent)),
            _ => None,
        };
    }

    if INVERTING_LINE.is_match(line) {
        return Some(ImagingEvent::inverting_started());
    }

    None
}

/// Restores through Apple Software Restore, following its puppet strings.
///
/// `asr` does its own verification pass, so a configured post script is not
/// run by this tool.
pub struct AsrTool;

impl ImagingTool for AsrTool {
    fn apply(
        &self,
        req: &ApplyRequest,
        tx: mpsc::Sender<ImagingEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        let req = req.clone();
        Box::pin(async move {
            if let Some(script) = &req.post_script {
                warn!(script = %script.display(), "Post script is not supported with asr, skipping");
            }

            info!(image = %req.image.name, disk = %req.disk, "Starting asr restore");

            let mut command = Command::new("asr");
            command
                .arg("restore")
                .arg("--source")
                .arg(&req.source)
                .arg("--target")
                .arg(&req.disk.identifier)
                .arg("--erase")
                .arg("--noprompt")
                .arg("--puppetstrings");
            if !req.verify {
                command.arg("--noverify");
            }

            let mut child = command
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| anyhow!("Failed to spawn asr: {}", e))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("Failed to capture asr stdout"))?;
            let mut stderr = child
                .stderr
                .take()
                .ok_or_else(|| anyhow!("Failed to capture asr stderr"))?;

            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            debug!(line = %line, "asr");
                            if let Some(event) = parse_puppet_line(&line) {
                                let _ = tx.send(event).await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Failed to read asr output");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        bail!("asr cancelled");
                    }
                }
            }

            let status = tokio::select! {
                status = child.wait() => status.map_err(|e| anyhow!("Failed to wait for asr: {}", e))?,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    bail!("asr cancelled");
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();

            if status.success() {
                Ok(())
            } else {
                Err(anyhow!("asr failed with {}: {}", status, stderr.trim()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_restore_progress() {
        assert_eq!(
            parse_puppet_line("PPRG\t45\trestore"),
            Some(ImagingEvent::imaging(45))
        );
        assert_eq!(
            parse_puppet_line("PSTT\t0\trestore\n"),
            Some(ImagingEvent::imaging(0))
        );
    }

    #[test]
    fn test_parse_verify_progress() {
        assert_eq!(
            parse_puppet_line("PSTP\t100\tverify"),
            Some(ImagingEvent::verifying(100))
        );
    }

    #[test]
    fn test_parse_inverting() {
        assert_eq!(
            parse_puppet_line("PINF\tInverting target volume..."),
            Some(ImagingEvent::inverting_started())
        );
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert_eq!(parse_puppet_line("XSTA\tstart\trestore"), None);
        assert_eq!(parse_puppet_line("PINF\tValidating target...done"), None);
        assert_eq!(parse_puppet_line("PPRG\t10\tunknownphase"), None);
        assert_eq!(parse_puppet_line(""), None);
    }

    #[test]
    fn test_parse_clamps_percent() {
        assert_eq!(
            parse_puppet_line("PPRG\t400\trestore"),
            Some(ImagingEvent::imaging(100))
        );
    }
}
