use anyhow::Context;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Tracing bootstrap for processes embedding the engine.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TraceConfig {
    /// Maximum emitted level, `error` through `trace`.
    pub level: String,
    /// Write to a daily-rolling file in this directory instead of stdout.
    pub file_dir: Option<String>,
    /// File name prefix for the rolling log.
    pub file_prefix: Option<String>,
}

impl TraceConfig {
    /// Environment overrides: FLOWRT_LOG, FLOWRT_LOG_DIR, FLOWRT_LOG_PREFIX.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("FLOWRT_LOG").unwrap_or_else(|_| "info".into()),
            file_dir: std::env::var("FLOWRT_LOG_DIR").ok(),
            file_prefix: std::env::var("FLOWRT_LOG_PREFIX").ok(),
        }
    }

    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let prefix = self.file_prefix.as_deref().unwrap_or("flowrt");
        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .build(dir)
            .with_context(|| format!("failed to open rolling log in {dir}"))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();
        Ok(Some(guard))
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file_dir: None,
            file_prefix: None,
        }
    }
}

/// Collapses repeats of a warning into one line per window, counting what
/// was dropped in between.
///
/// An aggregate send-result keeps only its first error; on a hot path the
/// orphaned rest would otherwise flood the log line for line. Const
/// constructor, so gates can live in statics next to their call sites.
pub struct RepeatGate {
    window: Duration,
    last: Mutex<Option<Instant>>,
    dropped: AtomicU64,
}

impl RepeatGate {
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// `Some(n)`: emit now, `n` repeats were dropped since the previous
    /// emission. `None`: drop this one too.
    pub fn admit(&self) -> Option<u64> {
        let mut last = self.last.lock();
        match *last {
            Some(at) if at.elapsed() < self.window => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(Instant::now());
                Some(self.dropped.swap(0, Ordering::Relaxed))
            }
        }
    }
}

static ORPHAN_GATE: RepeatGate = RepeatGate::new(Duration::from_secs(1));

/// Warn about an orphaned downstream error: its aggregate send-result was
/// already failed by an earlier one. One line per second.
pub(crate) fn orphaned(error: &crate::error::FlowError) {
    if let Some(dropped) = ORPHAN_GATE.admit() {
        if dropped > 0 {
            tracing::warn!(dropped, "orphaned downstream error: {error}");
        } else {
            tracing::warn!("orphaned downstream error: {error}");
        }
    }
}
