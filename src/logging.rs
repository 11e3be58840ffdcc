//! Tracing setup for the CLI and the helper.
//!
//! The CLI writes human-readable lines to stderr so stdout stays free for
//! reports. The helper usually runs under a supervisor and can switch to JSON.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;
use crate::core::models::ImagingStage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// One JSON object per line, with span context.
    pub json: bool,
    /// Default to DEBUG instead of INFO.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    fn default_directive(&self) -> String {
        let level = if self.verbose { Level::DEBUG } else { Level::INFO };
        format!("restor={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `config`.
///
/// Fails if a subscriber is already installed.
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false),
            )
            .try_init()
    };

    installed.map_err(|e| anyhow!("Failed to install log subscriber: {e}"))
}

/// Decides which imaging progress updates are worth a log line.
///
/// Stage changes and completed stages always log; plain percentage updates
/// log at most once per interval.
pub struct ProgressLog {
    interval: Duration,
    last: Mutex<Option<(ImagingStage, Instant)>>,
}

impl ProgressLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn should_log(&self, stage: ImagingStage, percent: u8) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let due = match *last {
            None => true,
            Some((logged_stage, _)) if logged_stage != stage => true,
            _ if percent >= 100 => true,
            Some((_, at)) => now.duration_since(at) >= self.interval,
        };
        if due {
            *last = Some((stage, now));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_follows_verbosity() {
        assert_eq!(LogConfig::default().default_directive(), "restor=info");
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.default_directive(), "restor=debug");
    }

    #[test]
    fn log_config_reads_app_config() {
        let app = AppConfig {
            json_logs: true,
            ..AppConfig::default()
        };
        assert_eq!(
            LogConfig::from(&app),
            LogConfig {
                json: true,
                verbose: false
            }
        );
    }

    #[test]
    fn first_update_logs_and_repeat_is_throttled() {
        let progress = ProgressLog::new(Duration::from_secs(60));
        assert!(progress.should_log(ImagingStage::Imaging, 1));
        assert!(!progress.should_log(ImagingStage::Imaging, 2));
    }

    #[test]
    fn stage_change_and_completion_always_log() {
        let progress = ProgressLog::new(Duration::from_secs(60));
        assert!(progress.should_log(ImagingStage::Imaging, 1));
        assert!(progress.should_log(ImagingStage::Imaging, 100));
        assert!(progress.should_log(ImagingStage::Verifying, 0));
        assert!(!progress.should_log(ImagingStage::Verifying, 5));
    }

    #[test]
    fn zero_interval_never_throttles() {
        let progress = ProgressLog::new(Duration::ZERO);
        assert!(progress.should_log(ImagingStage::Imaging, 1));
        assert!(progress.should_log(ImagingStage::Imaging, 2));
    }
}
