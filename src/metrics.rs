// Operational metrics module
//
// Lightweight counters for migrations, integrity healing and build dispatch

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Process-wide operational metrics
///
/// Uses atomic operations for thread-safe tracking without locks. Owned by the
/// [`KeeperContext`](crate::context::KeeperContext) and logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Migrations that reached the latest format version
    pub migrations_run: AtomicUsize,

    /// Migrations aborted and rolled back
    pub migrations_failed: AtomicUsize,

    /// Legacy build steps left unconverted
    pub conversion_issues: AtomicUsize,

    /// Journal commits recorded by successful migrations
    pub commits_recorded: AtomicU64,

    /// Verification passes that found invalid managed records
    pub checksum_heals: AtomicU64,

    /// Stored digests rewritten by reseal
    pub reseals: AtomicU64,

    /// Requests that replaced an already queued request for the same key
    pub queue_collapses: AtomicU64,

    pub builds_dispatched: AtomicUsize,

    pub builds_failed: AtomicUsize,

    /// Total build time in milliseconds
    pub total_build_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            migrations_run: AtomicUsize::new(0),
            migrations_failed: AtomicUsize::new(0),
            conversion_issues: AtomicUsize::new(0),
            commits_recorded: AtomicU64::new(0),
            checksum_heals: AtomicU64::new(0),
            reseals: AtomicU64::new(0),
            queue_collapses: AtomicU64::new(0),
            builds_dispatched: AtomicUsize::new(0),
            builds_failed: AtomicUsize::new(0),
            total_build_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished migration with its commit and issue counts
    pub fn record_migration(&self, commits: usize, issues: usize) {
        self.migrations_run.fetch_add(1, Ordering::Relaxed);
        self.commits_recorded
            .fetch_add(commits as u64, Ordering::Relaxed);
        self.conversion_issues.fetch_add(issues, Ordering::Relaxed);
    }

    pub fn record_migration_failed(&self) {
        self.migrations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_heal(&self) {
        self.checksum_heals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reseals(&self, count: usize) {
        self.reseals.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_queue_collapse(&self) {
        self.queue_collapses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched build and how long it ran
    pub fn record_build(&self, success: bool, duration: Duration) {
        self.builds_dispatched.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.builds_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_build_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average build time in milliseconds
    pub fn avg_build_time_ms(&self) -> f64 {
        let total = self.total_build_time_ms.load(Ordering::Relaxed);
        let count = self.builds_dispatched.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Migrations: {} run, {} failed, {} commits, {} unconverted items",
            self.migrations_run.load(Ordering::Relaxed),
            self.migrations_failed.load(Ordering::Relaxed),
            self.commits_recorded.load(Ordering::Relaxed),
            self.conversion_issues.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Checksums: {} heals, {} reseals",
            self.checksum_heals.load(Ordering::Relaxed),
            self.reseals.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Builds: {} dispatched, {} failed (avg: {:.2}ms), {} queue collapses",
            self.builds_dispatched.load(Ordering::Relaxed),
            self.builds_failed.load(Ordering::Relaxed),
            self.avg_build_time_ms(),
            self.queue_collapses.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.migrations_run.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.builds_dispatched.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_migrations() {
        let metrics = Metrics::new();

        metrics.record_migration(12, 0);
        metrics.record_migration(3, 2);
        metrics.record_migration_failed();

        assert_eq!(metrics.migrations_run.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.migrations_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.commits_recorded.load(Ordering::Relaxed), 15);
        assert_eq!(metrics.conversion_issues.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_record_builds() {
        let metrics = Metrics::new();

        metrics.record_build(true, Duration::from_millis(100));
        metrics.record_build(false, Duration::from_millis(200));

        assert_eq!(metrics.builds_dispatched.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.builds_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.avg_build_time_ms(), 150.0);
    }

    #[test]
    fn test_avg_build_time_without_builds() {
        assert_eq!(Metrics::new().avg_build_time_ms(), 0.0);
    }

    #[test]
    fn test_integrity_counters() {
        let metrics = Metrics::new();

        metrics.record_checksum_heal();
        metrics.record_reseals(3);
        metrics.record_queue_collapse();

        assert_eq!(metrics.checksum_heals.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.reseals.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.queue_collapses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
