//! Status events streamed from the helper to the caller during a session.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::models::ImagingStage;

/// Why a session ended in error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The imaging tool failed or exited non-zero.
    Pipeline,
    /// The source image did not match its catalog digest.
    Integrity,
    /// The caller cancelled.
    Cancelled,
    /// The connection between caller and helper went away.
    ConnectionLost,
    /// A party broke the imaging protocol.
    Protocol,
    /// The helper itself failed.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pipeline => "imaging failed",
            Self::Integrity => "integrity check failed",
            Self::Cancelled => "cancelled",
            Self::ConnectionLost => "connection lost",
            Self::Protocol => "protocol error",
            Self::Internal => "internal error",
        })
    }
}

/// Terminal error of a session, carried in the `finished` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ImagingFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ImagingFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Imaging cancelled by caller")
    }

    pub fn connection_lost() -> Self {
        Self::new(
            FailureKind::ConnectionLost,
            "Connection to the helper closed before imaging finished",
        )
    }
}

/// One status update for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImagingEvent {
    /// Percentage within a stage. Restarts at each new stage.
    Progress { stage: ImagingStage, percent: u8 },
    /// Entry into a stage that reports no percentage of its own.
    StageStarted { stage: ImagingStage },
    /// The single terminal event of a session.
    Finished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ImagingFailure>,
    },
}

impl ImagingEvent {
    pub fn imaging(percent: u8) -> Self {
        Self::Progress {
            stage: ImagingStage::Imaging,
            percent: percent.min(100),
        }
    }

    pub fn verifying(percent: u8) -> Self {
        Self::Progress {
            stage: ImagingStage::Verifying,
            percent: percent.min(100),
        }
    }

    pub fn inverting_started() -> Self {
        Self::StageStarted {
            stage: ImagingStage::Inverting,
        }
    }

    pub fn post_script_started() -> Self {
        Self::StageStarted {
            stage: ImagingStage::PostScript,
        }
    }

    pub fn finished(result: Result<(), ImagingFailure>) -> Self {
        Self::Finished { error: result.err() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// An event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub event: ImagingEvent,
}

/// Percentage of `done` out of `total`, treating an empty total as complete.
pub(crate) fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as u8
}
