//! In-memory status of the helper's live sessions.
//!
//! Updated on every event a session emits and dropped when the session
//! finishes. Nothing here is persisted; `helper.status` reads it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::events::ImagingEvent;
use super::models::{Disk, ImagingStage};

/// Latest known state of one server-side session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub image: String,
    pub disk: Disk,
    pub stage: ImagingStage,
    pub percent: u8,
    pub started_at: DateTime<Utc>,
}

impl SessionStatus {
    pub fn new(image: impl Into<String>, disk: Disk) -> Self {
        Self {
            image: image.into(),
            disk,
            stage: ImagingStage::Imaging,
            percent: 0,
            started_at: Utc::now(),
        }
    }

    fn record(&mut self, event: &ImagingEvent) {
        match event {
            ImagingEvent::Progress { stage, percent } => {
                self.stage = *stage;
                self.percent = *percent;
            }
            ImagingEvent::StageStarted { stage } => {
                self.stage = *stage;
                self.percent = 0;
            }
            ImagingEvent::Finished { error } => {
                self.stage = if error.is_some() {
                    ImagingStage::Error
                } else {
                    ImagingStage::Complete
                };
            }
        }
    }
}

/// Thread-safe store of live sessions, shared through `HelperContext`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, SessionStatus>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session_id: Uuid, status: SessionStatus) {
        self.inner.write().await.insert(session_id, status);
    }

    /// Fold an event into a session's status. Unknown sessions are ignored.
    pub async fn record(&self, session_id: Uuid, event: &ImagingEvent) {
        if let Some(status) = self.inner.write().await.get_mut(&session_id) {
            status.record(event);
        }
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<SessionStatus> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &Uuid) {
        self.inner.write().await.remove(session_id);
    }

    pub async fn get_all(&self) -> HashMap<Uuid, SessionStatus> {
        self.inner.read().await.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }
}
