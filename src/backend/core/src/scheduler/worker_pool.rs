//! Bounded worker pool for batch execution.
//!
//! A tokio [`Semaphore`] caps how many work items run at once. Every running
//! item holds a [`WorkerPermit`]; dropping the permit frees the slot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{CovenantError, ErrorCode, Result};

/// Pool sizing and acquire behaviour.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub acquire_timeout: Duration,
    /// Label used in logs.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            acquire_timeout: Duration::from_secs(30),
            name: "scheduler".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permits
// ═══════════════════════════════════════════════════════════════════════════════

/// A held worker slot. Released on drop.
///
/// Finish it with [`mark_success`](Self::mark_success) or
/// [`mark_failure`](Self::mark_failure); a permit dropped unmarked (panic,
/// abort) is counted as abandoned.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolCounters>,
    started_at: Instant,
    finished: bool,
}

impl WorkerPermit {
    /// Time the slot has been held.
    pub fn held_for(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn mark_success(mut self) {
        self.finish(true);
    }

    pub fn mark_failure(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        self.finished = true;
        let counter = if success {
            &self.stats.succeeded
        } else {
            &self.stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.stats
            .exec_time_us
            .fetch_add(self.started_at.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.stats.release();
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
            self.stats.release();
        }
    }
}

impl std::fmt::Debug for WorkerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPermit")
            .field("held_for", &self.held_for())
            .field("finished", &self.finished)
            .finish()
    }
}

#[derive(Default)]
struct PoolCounters {
    requested: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    acquire_timeouts: AtomicU64,
    wait_time_us: AtomicU64,
    exec_time_us: AtomicU64,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolCounters {
    fn acquired(&self, waited: Duration) {
        self.wait_time_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    fn release(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Semaphore-bounded pool of worker slots.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolCounters>,
    created_at: Instant,
}

impl WorkerPool {
    /// Create a pool. A `max_workers` of zero is raised to one.
    pub fn new(mut config: WorkerPoolConfig) -> Self {
        config.max_workers = config.max_workers.max(1);

        tracing::debug!(
            pool = %config.name,
            max_workers = config.max_workers,
            "Worker pool created"
        );

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            config,
            stats: Arc::new(PoolCounters::default()),
            created_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_workers(&self) -> usize {
        self.config.max_workers - self.semaphore.available_permits()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Wait for a free slot, up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<WorkerPermit> {
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool = %self.config.name,
                timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                "Worker permit acquire timed out"
            );
            CovenantError::new(
                ErrorCode::PoolAcquireTimeout,
                format!(
                    "Worker pool '{}' acquire timed out after {:?}",
                    self.config.name, self.config.acquire_timeout
                ),
            )
        })?
        .map_err(|e| {
            CovenantError::internal(format!("Worker pool '{}' closed", self.config.name))
                .with_source(e)
        })?;

        Ok(self.wrap(permit, start.elapsed()))
    }

    /// Wait for a free slot with no deadline.
    ///
    /// Used where waiting in line is expected, so queued work is never
    /// failed for the time it spent behind other work.
    pub async fn acquire_queued(&self) -> Result<WorkerPermit> {
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| {
                CovenantError::internal(format!("Worker pool '{}' closed", self.config.name))
                    .with_source(e)
            })?;

        Ok(self.wrap(permit, start.elapsed()))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit, Duration::ZERO))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit, waited: Duration) -> WorkerPermit {
        self.stats.acquired(waited);
        WorkerPermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
            started_at: Instant::now(),
            finished: false,
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let s = &self.stats;
        WorkerPoolStats {
            name: self.config.name.clone(),
            max_workers: self.config.max_workers,
            active_workers: self.active_workers(),
            requested: s.requested.load(Ordering::Relaxed),
            succeeded: s.succeeded.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            abandoned: s.abandoned.load(Ordering::Relaxed),
            acquire_timeouts: s.acquire_timeouts.load(Ordering::Relaxed),
            peak_concurrent: s.peak.load(Ordering::Relaxed),
            total_wait_time: Duration::from_micros(s.wait_time_us.load(Ordering::Relaxed)),
            total_exec_time: Duration::from_micros(s.exec_time_us.load(Ordering::Relaxed)),
            uptime: self.created_at.elapsed(),
        }
    }

    /// Healthy while under 90% load and no acquire has timed out.
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats();
        stats.utilization() < 0.9 && stats.acquire_timeouts == 0
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.config.name)
            .field("max_workers", &self.config.max_workers)
            .field("active_workers", &self.active_workers())
            .finish()
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_workers: usize,
    pub active_workers: usize,
    pub requested: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub acquire_timeouts: u64,
    pub peak_concurrent: usize,
    pub total_wait_time: Duration,
    pub total_exec_time: Duration,
    pub uptime: Duration,
}

impl WorkerPoolStats {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.abandoned
    }

    pub fn success_rate(&self) -> f64 {
        let completed = self.completed();
        if completed == 0 {
            1.0
        } else {
            self.succeeded as f64 / completed as f64
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            0.0
        } else {
            self.active_workers as f64 / self.max_workers as f64
        }
    }

    pub fn average_wait_time(&self) -> Duration {
        let acquired = self.requested.saturating_sub(self.acquire_timeouts);
        if acquired == 0 {
            Duration::ZERO
        } else {
            self.total_wait_time / acquired as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2));
        assert_eq!(pool.available_permits(), 2);

        let permit = pool.acquire().await.unwrap();
        assert_eq!(pool.active_workers(), 1);
        permit.mark_success();

        assert_eq!(pool.available_permits(), 2);
        let stats = pool.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.peak_concurrent, 1);
    }

    #[tokio::test]
    async fn test_try_acquire_at_capacity() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(1));
        let held = pool.try_acquire().unwrap();
        assert!(pool.is_at_capacity());
        assert!(pool.try_acquire().is_none());
        held.mark_failure();
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(1).with_acquire_timeout(Duration::from_millis(10)),
        );
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PoolAcquireTimeout);
        assert_eq!(pool.stats().acquire_timeouts, 1);
        assert!(!pool.is_healthy());
    }

    #[tokio::test]
    async fn test_acquire_queued_outlasts_acquire_timeout() {
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(1).with_acquire_timeout(Duration::from_millis(10)),
        ));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_queued().await.map(|p| p.mark_success()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.mark_success();

        assert!(waiter.await.unwrap().is_ok());
        let stats = pool.stats();
        assert_eq!(stats.acquire_timeouts, 0);
        assert_eq!(stats.succeeded, 2);
    }

    #[tokio::test]
    async fn test_unmarked_permit_counts_as_abandoned() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(1));
        drop(pool.acquire().await.unwrap());

        let stats = pool.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn test_zero_workers_raised_to_one() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(0));
        assert_eq!(pool.max_workers(), 1);

        let permit = tokio_test::block_on(pool.acquire()).unwrap();
        assert!(pool.is_at_capacity());
        permit.mark_success();
        assert_eq!(pool.available_permits(), 1);
    }
}
