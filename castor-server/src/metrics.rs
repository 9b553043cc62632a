//! Coordinator metrics: atomic counters and gauges surfaced as JSON on the
//! dashboard endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub workers_connected: AtomicI64,
    pub workers_unhealthy: AtomicI64,
    pub workers_draining: AtomicI64,
    pub workers_disconnected: AtomicI64,
    pub jobs_active: AtomicI64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub gpu_sessions_reserved: AtomicI64,
    pub schedule_attempts: AtomicU64,
    pub schedule_failures: AtomicU64,
    /// Microseconds spent in the most recent successful reservation.
    pub last_schedule_latency_us: AtomicU64,
    pub re_registrations: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub heartbeats_stale: AtomicU64,
    pub sample_batches_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub workers_connected: i64,
    pub workers_unhealthy: i64,
    pub workers_draining: i64,
    pub workers_disconnected: i64,
    pub jobs_active: i64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub gpu_sessions_reserved: i64,
    pub schedule_attempts: u64,
    pub schedule_failures: u64,
    pub last_schedule_latency_us: u64,
    pub re_registrations: u64,
    pub heartbeats_received: u64,
    pub heartbeats_stale: u64,
    pub sample_batches_dropped: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            workers_connected: self.workers_connected.load(Ordering::Relaxed),
            workers_unhealthy: self.workers_unhealthy.load(Ordering::Relaxed),
            workers_draining: self.workers_draining.load(Ordering::Relaxed),
            workers_disconnected: self.workers_disconnected.load(Ordering::Relaxed),
            jobs_active: self.jobs_active.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            gpu_sessions_reserved: self.gpu_sessions_reserved.load(Ordering::Relaxed),
            schedule_attempts: self.schedule_attempts.load(Ordering::Relaxed),
            schedule_failures: self.schedule_failures.load(Ordering::Relaxed),
            last_schedule_latency_us: self.last_schedule_latency_us.load(Ordering::Relaxed),
            re_registrations: self.re_registrations.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            heartbeats_stale: self.heartbeats_stale.load(Ordering::Relaxed),
            sample_batches_dropped: self.sample_batches_dropped.load(Ordering::Relaxed),
        }
    }
}
