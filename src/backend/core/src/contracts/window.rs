//! Temporal window of a contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Activation timestamp plus a fixed duration.
///
/// The start is stamped at most once. Expiry is latched: once observed it
/// never reverts.
#[derive(Debug)]
pub struct TemporalWindow {
    duration: Duration,
    start: OnceLock<(Instant, DateTime<Utc>)>,
    expired: AtomicBool,
}

impl TemporalWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            start: OnceLock::new(),
            expired: AtomicBool::new(false),
        }
    }

    /// Stamp the start time. Returns `false` if the window was already started.
    pub fn start(&self) -> bool {
        self.start.set((Instant::now(), Utc::now())).is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.start.get().is_some()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Wall-clock activation time, if started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start.get().map(|(_, at)| *at)
    }

    /// Time since activation (zero before activation).
    pub fn elapsed(&self) -> Duration {
        self.start
            .get()
            .map(|(instant, _)| instant.elapsed())
            .unwrap_or_default()
    }

    /// `max(0, duration - elapsed)`. The full duration before activation.
    pub fn time_remaining(&self) -> Duration {
        if self.expired.load(Ordering::Acquire) {
            return Duration::ZERO;
        }
        self.duration.saturating_sub(self.elapsed())
    }

    /// Whether the window has run out. Never true before activation.
    pub fn is_expired(&self) -> bool {
        if self.expired.load(Ordering::Acquire) {
            return true;
        }
        let expired = self.is_started() && self.elapsed() >= self.duration;
        if expired {
            self.expired.store(true, Ordering::Release);
        }
        expired
    }
}
