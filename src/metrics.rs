use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    api_calls: AtomicU64,
    duplicate_requests_prevented: AtomicU64,
    comments_processed: AtomicU64,
    user_comments_found: AtomicU64,
    suppressed_comments_found: AtomicU64,
    bytes_transferred: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub elapsed_ms: u64,
    pub api_calls: u64,
    pub duplicate_requests_prevented: u64,
    pub comments_processed: u64,
    pub user_comments_found: u64,
    pub suppressed_comments_found: u64,
    pub bytes_transferred: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            api_calls: AtomicU64::new(0),
            duplicate_requests_prevented: AtomicU64::new(0),
            comments_processed: AtomicU64::new(0),
            user_comments_found: AtomicU64::new(0),
            suppressed_comments_found: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn api_call(&self, bytes: usize) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn duplicate_prevented(&self) {
        self.duplicate_requests_prevented
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn comment_processed(&self) {
        self.comments_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn user_comment_found(&self) {
        self.user_comments_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn suppressed_comment_found(&self) {
        self.suppressed_comments_found
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            api_calls: self.api_calls.load(Ordering::Relaxed),
            duplicate_requests_prevented: self.duplicate_requests_prevented.load(Ordering::Relaxed),
            comments_processed: self.comments_processed.load(Ordering::Relaxed),
            user_comments_found: self.user_comments_found.load(Ordering::Relaxed),
            suppressed_comments_found: self.suppressed_comments_found.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let snap = self.snapshot();
        let average_kb = if snap.api_calls > 0 {
            snap.bytes_transferred as f64 / snap.api_calls as f64 / 1024.0
        } else {
            0.0
        };
        info!(
            elapsed_ms = snap.elapsed_ms,
            api_calls = snap.api_calls,
            duplicates_prevented = snap.duplicate_requests_prevented,
            comments_processed = snap.comments_processed,
            user_comments = snap.user_comments_found,
            suppressed = snap.suppressed_comments_found,
            transferred_kb = format_args!("{:.2}", snap.bytes_transferred as f64 / 1024.0),
            average_kb = format_args!("{average_kb:.2}"),
            "reconciliation metrics"
        );
    }
}
