//! Client side of an imaging session.
//!
//! [`SessionSnapshot`] is the pure state machine: it folds helper events into
//! stage, percentage and last error, rejecting anything that would move the
//! session backwards. [`ImagingSession`] owns one attempt against the helper
//! and publishes snapshots through a `watch` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::cache::VerifiedPath;
use super::events::{FailureKind, ImagingEvent, ImagingFailure};
use super::models::{Disk, Image, ImagingStage};
use crate::rpc::client::{ClientError, HelperClient, HelperConnection};
use crate::rpc::protocol::{ApplyImageParams, PROTOCOL_VERSION, SESSION_ALREADY_STARTED};

/// How long a cancelled session waits for the helper to acknowledge.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Imaging session has already been started")]
    AlreadyStarted,
    #[error("Imaging session has already finished")]
    Finished,
}

/// Why an event was not applied to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("session already ended in {0}")]
    Terminal(ImagingStage),
    #[error("session has not been started")]
    NotStarted,
    #[error("stage cannot move back from {from} to {to}")]
    Regression { from: ImagingStage, to: ImagingStage },
    #[error("{stage} progress cannot drop from {from}% to {to}%")]
    ProgressRegression { stage: ImagingStage, from: u8, to: u8 },
    #[error("{0} is not a stage the helper can report")]
    InvalidStage(ImagingStage),
}

/// Observable state of one imaging attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub stage: ImagingStage,
    /// Percentage within the current stage. Zero in stages that report none.
    pub percent_complete: u8,
    pub last_error: Option<ImagingFailure>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            stage: ImagingStage::NotStarted,
            percent_complete: 0,
            last_error: None,
        }
    }
}

impl SessionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        match self.stage {
            ImagingStage::NotStarted => {
                self.stage = ImagingStage::Imaging;
                self.percent_complete = 0;
                Ok(())
            }
            stage if stage.is_terminal() => Err(SessionError::Finished),
            _ => Err(SessionError::AlreadyStarted),
        }
    }

    /// Fold one helper event into the snapshot.
    ///
    /// Stages may be skipped forwards (a pipeline without inversion goes
    /// straight from imaging to verifying) but never revisited.
    pub fn apply(&mut self, event: &ImagingEvent) -> Result<(), TransitionError> {
        if self.stage.is_terminal() {
            return Err(TransitionError::Terminal(self.stage));
        }
        if self.stage == ImagingStage::NotStarted {
            return Err(TransitionError::NotStarted);
        }

        match event {
            ImagingEvent::Progress { stage, percent } => {
                if !matches!(stage, ImagingStage::Imaging | ImagingStage::Verifying) {
                    return Err(TransitionError::InvalidStage(*stage));
                }
                if *stage < self.stage {
                    return Err(TransitionError::Regression {
                        from: self.stage,
                        to: *stage,
                    });
                }
                if *stage == self.stage && *percent < self.percent_complete {
                    return Err(TransitionError::ProgressRegression {
                        stage: *stage,
                        from: self.percent_complete,
                        to: *percent,
                    });
                }
                self.stage = *stage;
                self.percent_complete = (*percent).min(100);
            }
            ImagingEvent::StageStarted { stage } => {
                if !stage.is_active() {
                    return Err(TransitionError::InvalidStage(*stage));
                }
                if *stage < self.stage {
                    return Err(TransitionError::Regression {
                        from: self.stage,
                        to: *stage,
                    });
                }
                if *stage != self.stage {
                    self.stage = *stage;
                    self.percent_complete = 0;
                }
            }
            ImagingEvent::Finished { error: None } => {
                self.stage = ImagingStage::Complete;
            }
            ImagingEvent::Finished { error: Some(failure) } => {
                self.stage = ImagingStage::Error;
                self.last_error = Some(failure.clone());
            }
        }

        Ok(())
    }

    /// Move to `Error` unless the session already ended. Returns whether it moved.
    pub fn fail(&mut self, failure: ImagingFailure) -> bool {
        if self.stage.is_terminal() {
            return false;
        }
        self.stage = ImagingStage::Error;
        self.last_error = Some(failure);
        true
    }
}

/// One attempt to write one image to one disk through the helper.
///
/// Dropping the session cancels it.
pub struct ImagingSession {
    image: Image,
    source: VerifiedPath,
    disk: Disk,
    client: HelperClient,
    state: Arc<watch::Sender<SessionSnapshot>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl ImagingSession {
    /// `source` must come from cache validation or a verified download.
    pub fn new(image: Image, source: VerifiedPath, disk: Disk, client: HelperClient) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            image,
            source,
            disk,
            client,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    /// Connect to the helper and request the apply in the background.
    ///
    /// Returns as soon as the session is in `Imaging`; everything after that
    /// arrives through [`subscribe`](Self::subscribe).
    pub fn begin(&self) -> Result<(), SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }

        let mut outcome = Ok(());
        self.state.send_if_modified(|s| {
            outcome = s.begin();
            outcome.is_ok()
        });
        outcome?;

        info!(image = %self.image.name, disk = %self.disk, "Beginning imaging session");

        let params = ApplyImageParams {
            image: self.image.clone(),
            source: self.source.clone().into_path_buf(),
            disk: self.disk.clone(),
        };
        let span = info_span!("client_session", image = %self.image.name, disk = %self.disk);
        tokio::spawn(
            run(
                self.client.clone(),
                params,
                self.state.clone(),
                self.cancel.clone(),
            )
            .instrument(span),
        );

        Ok(())
    }

    /// Abandon the attempt. The session is in `Error` when this returns and
    /// ignores anything the helper sends afterwards.
    pub fn cancel(&self) {
        let cancelled = self
            .state
            .send_if_modified(|s| s.fail(ImagingFailure::cancelled()));
        if cancelled {
            info!(image = %self.image.name, disk = %self.disk, "Imaging session cancelled");
        }
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Wait for `Complete` or `Error`.
    pub async fn wait(&self) -> SessionSnapshot {
        let mut rx = self.state.subscribe();
        match rx.wait_for(SessionSnapshot::is_terminal).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }
}

impl Drop for ImagingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn failure_from(error: ClientError) -> ImagingFailure {
    let kind = match &error {
        ClientError::Connect { .. } | ClientError::Io(_) | ClientError::Closed => {
            FailureKind::ConnectionLost
        }
        ClientError::Json(_) | ClientError::Rpc(_) => FailureKind::Protocol,
    };
    ImagingFailure::new(kind, error.to_string())
}

async fn run(
    client: HelperClient,
    params: ApplyImageParams,
    state: Arc<watch::Sender<SessionSnapshot>>,
    cancel: CancellationToken,
) {
    if let Err(failure) = converse(&client, params, &state, &cancel).await {
        state.send_if_modified(|s| s.fail(failure));
    }
}

async fn open(
    client: &HelperClient,
    params: &ApplyImageParams,
) -> Result<(HelperConnection, Uuid), ClientError> {
    let mut conn = client.connect().await?;

    match conn.version().await {
        Ok(info) if info.protocol != PROTOCOL_VERSION => warn!(
            helper_version = %info.version,
            helper_protocol = info.protocol,
            protocol = PROTOCOL_VERSION,
            "Helper speaks a different protocol version"
        ),
        Ok(info) => debug!(helper_version = %info.version, "Connected to helper"),
        Err(ClientError::Rpc(e)) => warn!(error = %e, "Helper did not report its version"),
        Err(e) => return Err(e),
    }

    let session_id = conn.apply_image(params).await?;
    Ok((conn, session_id))
}

async fn converse(
    client: &HelperClient,
    params: ApplyImageParams,
    state: &watch::Sender<SessionSnapshot>,
    cancel: &CancellationToken,
) -> Result<(), ImagingFailure> {
    let (mut conn, session_id) = tokio::select! {
        opened = open(client, &params) => opened.map_err(|e| match e {
            ClientError::Rpc(ref rpc) if rpc.code == SESSION_ALREADY_STARTED => {
                ImagingFailure::new(FailureKind::Protocol, rpc.message.clone())
            }
            e => failure_from(e),
        })?,
        _ = cancel.cancelled() => return Ok(()),
    };

    debug!(session_id = %session_id, "Helper accepted apply request");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                match tokio::time::timeout(CANCEL_GRACE, conn.cancel_imaging(session_id)).await {
                    Ok(Ok(())) => debug!(session_id = %session_id, "Helper acknowledged cancel"),
                    Ok(Err(e)) => debug!(error = %e, "Cancel request failed"),
                    Err(_) => debug!("Helper did not acknowledge cancel in time"),
                }
                return Ok(());
            }
            event = conn.next_event() => match event {
                Ok(Some(event)) => {
                    if event.session_id != session_id {
                        warn!(session_id = %event.session_id, "Event for another session, ignoring");
                        continue;
                    }
                    let terminal = event.event.is_terminal();
                    state.send_if_modified(|s| match s.apply(&event.event) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, event = ?event.event, "Rejected imaging event");
                            false
                        }
                    });
                    if terminal {
                        return Ok(());
                    }
                }
                Ok(None) => return Err(ImagingFailure::connection_lost()),
                Err(e) => return Err(failure_from(e)),
            }
        }
    }
}
