//! Privileged side of an imaging session.
//!
//! An [`ImageSessionServer`] drives one [`ImagingTool`] run and forwards its
//! events to the caller. Every session that was begun produces exactly one
//! `finished` event: on success, on pipeline failure, on cancellation and
//! when the pipeline task dies. Once cancellation is requested no further
//! progress is forwarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::events::{FailureKind, ImagingEvent, ImagingFailure, SessionEvent};
use super::hasher::{HashAlgorithm, checksum_async};
use super::imaging_tool::{ApplyRequest, ImagingTool};
use super::registry::{SessionRegistry, SessionStatus};
use super::session::SessionError;
use crate::logging::ProgressLog;

/// Capacity of the channel between a tool and its session.
const TOOL_EVENT_BUFFER: usize = 64;

enum ServerState {
    NotStarted,
    Running(CancellationToken),
    Finished,
}

/// Delivers a session's events, enforcing the single terminal event.
struct EventSink {
    session_id: Uuid,
    tx: mpsc::Sender<SessionEvent>,
    registry: SessionRegistry,
    finished: AtomicBool,
    cancel_reason: Mutex<Option<ImagingFailure>>,
    progress_log: ProgressLog,
}

impl EventSink {
    fn cancel_reason(&self) -> Option<ImagingFailure> {
        self.cancel_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record why the session is being cancelled. The first reason wins.
    fn request_cancel(&self, failure: ImagingFailure) {
        let mut reason = self
            .cancel_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reason.is_none() {
            *reason = Some(failure);
        }
    }

    fn is_closed(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.cancel_reason().is_some()
    }

    async fn emit(&self, event: ImagingEvent) {
        if event.is_terminal() {
            warn!(session_id = %self.session_id, "Imaging tool sent a terminal event, ignoring");
            return;
        }
        if self.is_closed() {
            debug!(session_id = %self.session_id, ?event, "Dropping event after cancellation");
            return;
        }

        // The caller may already be gone; nothing else to do then.
        let Ok(permit) = self.tx.reserve().await else {
            return;
        };

        {
            // Held across the send so a cancel either precedes the check or
            // follows the delivery.
            let reason = self
                .cancel_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if reason.is_some() || self.finished.load(Ordering::SeqCst) {
                debug!(session_id = %self.session_id, ?event, "Dropping event after cancellation");
                return;
            }
            permit.send(SessionEvent {
                session_id: self.session_id,
                event: event.clone(),
            });
        }

        match &event {
            ImagingEvent::StageStarted { stage } => {
                info!(session_id = %self.session_id, %stage, "Stage started");
            }
            ImagingEvent::Progress { stage, percent }
                if self.progress_log.should_log(*stage, *percent) =>
            {
                debug!(session_id = %self.session_id, %stage, percent, "Imaging progress");
            }
            _ => {}
        }

        self.registry.record(self.session_id, &event).await;
    }

    /// Send the terminal event. Returns false if one was already sent.
    async fn finish(&self, result: Result<(), ImagingFailure>) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }

        match &result {
            Ok(()) => info!(session_id = %self.session_id, "Imaging session succeeded"),
            Err(failure) => {
                warn!(session_id = %self.session_id, error = %failure, "Imaging session failed")
            }
        }

        self.registry.remove(&self.session_id).await;
        // The caller may already be gone; nothing else to do then.
        let _ = self
            .tx
            .send(SessionEvent {
                session_id: self.session_id,
                event: ImagingEvent::finished(result),
            })
            .await;
        true
    }
}

/// One imaging attempt running inside the helper.
pub struct ImageSessionServer {
    id: Uuid,
    request: ApplyRequest,
    tool: Arc<dyn ImagingTool>,
    verify_source: bool,
    sink: EventSink,
    state: Mutex<ServerState>,
}

impl ImageSessionServer {
    /// Create a session that reports to `events`.
    ///
    /// With `verify_source` the source file is re-hashed against the image's
    /// SHA-256 before anything is written.
    pub fn new(
        request: ApplyRequest,
        tool: Arc<dyn ImagingTool>,
        events: mpsc::Sender<SessionEvent>,
        registry: SessionRegistry,
        verify_source: bool,
    ) -> Arc<Self> {
        let id = Uuid::now_v7();
        Arc::new(Self {
            id,
            request,
            tool,
            verify_source,
            sink: EventSink {
                session_id: id,
                tx: events,
                registry,
                finished: AtomicBool::new(false),
                cancel_reason: Mutex::new(None),
                progress_log: ProgressLog::new(Duration::from_secs(2)),
            },
            state: Mutex::new(ServerState::NotStarted),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &ApplyRequest {
        &self.request
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.lock_state(), ServerState::Finished)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the pipeline in the background and return immediately.
    pub async fn begin_imaging(self: &Arc<Self>) -> Result<(), SessionError> {
        let token = {
            let mut state = self.lock_state();
            if !matches!(*state, ServerState::NotStarted) {
                return Err(SessionError::AlreadyStarted);
            }
            let token = CancellationToken::new();
            *state = ServerState::Running(token.clone());
            token
        };

        info!(
            session_id = %self.id,
            image = %self.request.image.name,
            disk = %self.request.disk,
            "Beginning imaging session"
        );

        self.sink
            .registry
            .insert(
                self.id,
                SessionStatus::new(&self.request.image.name, self.request.disk.clone()),
            )
            .await;

        let span = info_span!("imaging_session", session_id = %self.id);
        tokio::spawn(self.clone().supervise(token).instrument(span));
        Ok(())
    }

    /// Stop the pipeline. No progress is forwarded after this returns.
    ///
    /// A running session still reports one terminal event carrying `reason`.
    pub fn cancel_imaging(&self, reason: ImagingFailure) {
        let mut state = self.lock_state();
        match &*state {
            ServerState::Running(token) => {
                info!(session_id = %self.id, reason = %reason, "Cancelling imaging session");
                self.sink.request_cancel(reason);
                token.cancel();
                return;
            }
            ServerState::Finished => return,
            ServerState::NotStarted => {}
        }
        // Never begun, so no terminal event is owed.
        *state = ServerState::Finished;
    }

    async fn supervise(self: Arc<Self>, token: CancellationToken) {
        let worker = tokio::spawn(self.clone().run_pipeline(token));

        let result = match worker.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Imaging pipeline terminated abnormally");
                Err(ImagingFailure::new(
                    FailureKind::Internal,
                    format!("Imaging pipeline terminated abnormally: {e}"),
                ))
            }
        };

        let result = match self.sink.cancel_reason() {
            Some(reason) => Err(reason),
            None => result,
        };

        self.sink.finish(result).await;
        *self.lock_state() = ServerState::Finished;
    }

    async fn run_pipeline(self: Arc<Self>, token: CancellationToken) -> Result<(), ImagingFailure> {
        if self.verify_source {
            let check = checksum_async(self.request.source.clone(), HashAlgorithm::Sha256);
            let actual = tokio::select! {
                actual = check => actual.map_err(|e| ImagingFailure::new(
                    FailureKind::Pipeline,
                    format!("Failed to read source image {}: {}", self.request.source.display(), e),
                ))?,
                _ = token.cancelled() => return Err(ImagingFailure::cancelled()),
            };

            if !actual.eq_ignore_ascii_case(&self.request.image.sha256) {
                return Err(ImagingFailure::new(
                    FailureKind::Integrity,
                    format!(
                        "Source image {} does not match the catalog SHA-256 of {}",
                        self.request.source.display(),
                        self.request.image.name
                    ),
                ));
            }
            debug!("Source image verified");
        }

        let (tx, mut rx) = mpsc::channel(TOOL_EVENT_BUFFER);
        let mut run = self.tool.apply(&self.request, tx, token.clone());

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ImagingFailure::cancelled()),
                Some(event) = rx.recv() => self.sink.emit(event).await,
                result = &mut run => {
                    while let Ok(event) = rx.try_recv() {
                        self.sink.emit(event).await;
                    }
                    return result.map_err(|e| {
                        ImagingFailure::new(FailureKind::Pipeline, format!("{e:#}"))
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::imaging_tool::SimulatedTool;
    use crate::core::models::{Disk, Image};
    use anyhow::Result;
    use std::future::Future;
    use std::path::PathBuf;
    use std::pin::Pin;
    use tokio::time::timeout;

    fn request() -> ApplyRequest {
        ApplyRequest {
            image: Image {
                name: "base".to_string(),
                url: "https://images.example.com/base".to_string(),
                sha256: "0".repeat(64),
                sha512: "0".repeat(128),
            },
            source: PathBuf::from("/nonexistent/base"),
            disk: Disk::new("disk9"),
            verify: true,
            post_script: None,
        }
    }

    fn fast_tool() -> SimulatedTool {
        SimulatedTool {
            step_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::Receiver<SessionEvent>) -> Vec<ImagingEvent> {
        let mut events = Vec::new();
        while let Ok(Some(e)) = timeout(Duration::from_secs(5), rx.recv()).await {
            let terminal = e.event.is_terminal();
            events.push(e.event);
            if terminal {
                // Give a stray second terminal a chance to show up.
                while let Ok(Some(e)) = timeout(Duration::from_millis(100), rx.recv()).await {
                    events.push(e.event);
                }
                break;
            }
        }
        events
    }

    struct PanickingTool;

    impl ImagingTool for PanickingTool {
        fn apply(
            &self,
            _req: &ApplyRequest,
            _tx: mpsc::Sender<ImagingEvent>,
            _cancel: CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
            Box::pin(async { panic!("tool crashed") })
        }
    }

    #[tokio::test]
    async fn test_successful_session_emits_single_finish() {
        let (tx, rx) = mpsc::channel(64);
        let registry = SessionRegistry::new();
        let session =
            ImageSessionServer::new(request(), Arc::new(fast_tool()), tx, registry.clone(), false);

        session.begin_imaging().await.unwrap();
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![
                ImagingEvent::imaging(10),
                ImagingEvent::imaging(50),
                ImagingEvent::imaging(100),
                ImagingEvent::inverting_started(),
                ImagingEvent::verifying(50),
                ImagingEvent::verifying(100),
                ImagingEvent::finished(Ok(())),
            ]
        );
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_begin_twice_is_rejected() {
        let (tx, _rx) = mpsc::channel(64);
        let session = ImageSessionServer::new(
            request(),
            Arc::new(fast_tool()),
            tx,
            SessionRegistry::new(),
            false,
        );

        session.begin_imaging().await.unwrap();
        assert_eq!(
            session.begin_imaging().await,
            Err(SessionError::AlreadyStarted)
        );
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_reported() {
        let (tx, rx) = mpsc::channel(64);
        let tool = SimulatedTool {
            fail_with: Some("disk ejected".to_string()),
            ..fast_tool()
        };
        let session =
            ImageSessionServer::new(request(), Arc::new(tool), tx, SessionRegistry::new(), false);

        session.begin_imaging().await.unwrap();
        let events = collect(rx).await;

        let finishes: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(finishes.len(), 1);
        match finishes[0] {
            ImagingEvent::Finished { error: Some(f) } => {
                assert_eq!(f.kind, FailureKind::Pipeline);
                assert!(f.message.contains("disk ejected"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_progress_and_reports_reason() {
        let (tx, mut rx) = mpsc::channel(64);
        let tool = SimulatedTool {
            step_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let session =
            ImageSessionServer::new(request(), Arc::new(tool), tx, SessionRegistry::new(), false);

        session.begin_imaging().await.unwrap();
        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.event, ImagingEvent::imaging(10));

        session.cancel_imaging(ImagingFailure::cancelled());
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![ImagingEvent::finished(Err(ImagingFailure::cancelled()))]
        );
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_no_progress_queued_after_cancel_returns() {
        // Room for a single event, so the session blocks on a full channel.
        let (tx, rx) = mpsc::channel(1);
        let tool = SimulatedTool {
            step_delay: Duration::from_millis(1),
            imaging_steps: (1..=100).collect(),
            ..Default::default()
        };
        let session =
            ImageSessionServer::new(request(), Arc::new(tool), tx, SessionRegistry::new(), false);

        session.begin_imaging().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.cancel_imaging(ImagingFailure::cancelled());

        // Whatever was buffered before the cancel may still arrive, then the
        // finish and nothing else.
        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                ImagingEvent::imaging(1),
                ImagingEvent::finished(Err(ImagingFailure::cancelled())),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_tool_still_finishes() {
        let (tx, rx) = mpsc::channel(64);
        let session = ImageSessionServer::new(
            request(),
            Arc::new(PanickingTool),
            tx,
            SessionRegistry::new(),
            false,
        );

        session.begin_imaging().await.unwrap();
        let events = collect(rx).await;

        assert!(matches!(
            events.as_slice(),
            [ImagingEvent::Finished { error: Some(f) }] if f.kind == FailureKind::Internal
        ));
    }

    #[tokio::test]
    async fn test_unverifiable_source_fails_before_imaging() {
        let (tx, rx) = mpsc::channel(64);
        let session = ImageSessionServer::new(
            request(),
            Arc::new(fast_tool()),
            tx,
            SessionRegistry::new(),
            true,
        );

        session.begin_imaging().await.unwrap();
        let events = collect(rx).await;

        assert!(matches!(
            events.as_slice(),
            [ImagingEvent::Finished { error: Some(f) }] if f.kind == FailureKind::Pipeline
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_begin_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(64);
        let session = ImageSessionServer::new(
            request(),
            Arc::new(fast_tool()),
            tx,
            SessionRegistry::new(),
            false,
        );

        session.cancel_imaging(ImagingFailure::cancelled());
        assert!(session.is_finished());
        assert_eq!(
            session.begin_imaging().await,
            Err(SessionError::AlreadyStarted)
        );
        assert!(rx.try_recv().is_err());
    }
}
