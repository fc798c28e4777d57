use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every in-flight request
///
/// Counters only ever grow. One registry is created per process in `main`
/// and handed around behind an `Arc`; tests build their own.
#[derive(Debug)]
pub struct StatsRegistry {
    images_received: AtomicU64,
    meta_received: AtomicU64,
    errors: AtomicU64,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub images_received: u64,
    pub meta_received: u64,
    pub errors: u64,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            images_received: AtomicU64::new(0),
            meta_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn record_image_success(&self) {
        self.images_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("receiver.images.received").increment(1);
    }

    pub fn record_meta_success(&self) {
        self.meta_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("receiver.meta.received").increment(1);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("receiver.errors").increment(1);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            images_received: self.images_received.load(Ordering::Relaxed),
            meta_received: self.meta_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_seconds: self.uptime().as_secs(),
            started_at: self.started_at,
        }
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Format seconds as `HH:MM:SS`; hours are not wrapped at 24
pub fn format_uptime(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
