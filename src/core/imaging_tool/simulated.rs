use crate::core::events::ImagingEvent;
use crate::core::imaging_tool::{ApplyRequest, ImagingTool};
use anyhow::{Result, bail};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

/// Emits a scripted sequence of events without touching any disk.
#[derive(Debug, Clone)]
pub struct SimulatedTool {
    pub step_delay: Duration,
    pub imaging_steps: Vec<u8>,
    pub invert: bool,
    pub post_script: bool,
    /// Emitted only when the request asks for verification.
    pub verifying_steps: Vec<u8>,
    /// Fail after the imaging steps with this message.
    pub fail_with: Option<String>,
}

impl Default for SimulatedTool {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            imaging_steps: vec![10, 50, 100],
            invert: true,
            post_script: false,
            verifying_steps: vec![50, 100],
            fail_with: None,
        }
    }
}

impl ImagingTool for SimulatedTool {
    fn apply(
        &self,
        req: &ApplyRequest,
        tx: mpsc::Sender<ImagingEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        let sim = self.clone();
        let verify = req.verify;

        Box::pin(async move {
            let mut script: Vec<ImagingEvent> =
                sim.imaging_steps.iter().map(|p| ImagingEvent::imaging(*p)).collect();

            if sim.fail_with.is_none() {
                if sim.invert {
                    script.push(ImagingEvent::inverting_started());
                }
                if sim.post_script {
                    script.push(ImagingEvent::post_script_started());
                }
                if verify {
                    script.extend(sim.verifying_steps.iter().map(|p| ImagingEvent::verifying(*p)));
                }
            }

            for event in script {
                tokio::select! {
                    _ = sleep(sim.step_delay) => {}
                    _ = cancel.cancelled() => bail!("Simulated imaging cancelled"),
                }
                let _ = tx.send(event).await;
            }

            if let Some(message) = sim.fail_with {
                bail!(message);
            }

            Ok(())
        })
    }
}
