//! Coordinator-side job table: one record per submitted job, living from
//! submission until shortly after terminal state (snapshots keep serving
//! the dashboard meanwhile). Records are mutated under the map's shard
//! locks; readers only ever see full snapshots.

use std::sync::Arc;

use castor_contracts::{HwAccelKind, JobSpec, JobState, TranscodeError, TranscodeStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub actual_encoder: Option<String>,
    pub actual_hw_accel: Option<HwAccelKind>,
    pub stats: TranscodeStats,
    pub error: Option<TranscodeError>,
    pub created_at: DateTime<Utc>,
    /// Cancelling this tears the whole session down.
    pub cancel: CancellationToken,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub channel_name: Option<String>,
    pub target_video_codec: String,
    pub target_audio_codec: String,
    pub actual_encoder: Option<String>,
    pub actual_hw_accel: Option<HwAccelKind>,
    pub stats: TranscodeStats,
    pub error: Option<TranscodeError>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Arc<DashMap<String, JobRecord>>,
}

impl JobTable {
    /// Create a pending record; returns its cancellation token.
    pub fn insert(&self, job_id: String, spec: JobSpec) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.jobs.insert(
            job_id,
            JobRecord {
                spec,
                state: JobState::Pending,
                worker_id: None,
                actual_encoder: None,
                actual_hw_accel: None,
                stats: TranscodeStats::default(),
                error: None,
                created_at: Utc::now(),
                cancel: cancel.clone(),
                cancel_reason: None,
            },
        );
        cancel
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn remove(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    pub fn update<F: FnOnce(&mut JobRecord)>(&self, job_id: &str, f: F) {
        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            f(entry.value_mut());
        }
    }

    /// Request cancellation. Returns false for unknown jobs.
    pub fn cancel(&self, job_id: &str, reason: &str) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(mut entry) => {
                let record = entry.value_mut();
                if record.cancel_reason.is_none() {
                    record.cancel_reason = Some(reason.to_string());
                }
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_reason(&self, job_id: &str) -> Option<String> {
        self.jobs.get(job_id).and_then(|e| e.cancel_reason.clone())
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.jobs.get(job_id).map(|e| e.state)
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.get(job_id).map(|e| snapshot_of(job_id, e.value()))
    }

    pub fn active_snapshots(&self) -> Vec<JobSnapshot> {
        self.jobs
            .iter()
            .filter(|e| e.value().state.is_active() || e.value().state == JobState::Pending)
            .map(|e| snapshot_of(e.key(), e.value()))
            .collect()
    }

    /// Ids of active jobs bound to a worker, for the worker-loss policy.
    pub fn active_on_worker(&self, worker_id: &str) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|e| {
                e.value().worker_id.as_deref() == Some(worker_id) && e.value().state.is_active()
            })
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.jobs.iter().filter(|e| e.value().state.is_active()).count()
    }
}

fn snapshot_of(job_id: &str, record: &JobRecord) -> JobSnapshot {
    JobSnapshot {
        job_id: job_id.to_string(),
        state: record.state,
        worker_id: record.worker_id.clone(),
        channel_name: record.spec.channel_name.clone(),
        target_video_codec: record.spec.target_video_codec.clone(),
        target_audio_codec: record.spec.target_audio_codec.clone(),
        actual_encoder: record.actual_encoder.clone(),
        actual_hw_accel: record.actual_hw_accel,
        stats: record.stats.clone(),
        error: record.error.clone(),
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_updates_are_visible_in_snapshots() {
        let table = JobTable::default();
        table.insert("j1".into(), JobSpec::default());

        table.update("j1", |record| {
            record.state = JobState::Assigned;
            record.worker_id = Some("w1".into());
        });
        let snap = table.snapshot("j1").unwrap();
        assert_eq!(snap.state, JobState::Assigned);
        assert_eq!(snap.worker_id.as_deref(), Some("w1"));
        assert_eq!(table.active_on_worker("w1"), vec!["j1".to_string()]);

        table.update("j1", |record| record.state = JobState::Completed);
        assert!(table.active_on_worker("w1").is_empty());
        assert!(table.active_snapshots().is_empty());
    }

    #[test]
    fn cancel_is_sticky_and_keeps_the_first_reason() {
        let table = JobTable::default();
        let token = table.insert("j1".into(), JobSpec::default());
        assert!(table.cancel("j1", "operator"));
        assert!(table.cancel("j1", "second"));
        assert!(token.is_cancelled());
        assert_eq!(table.cancel_reason("j1").as_deref(), Some("operator"));
        assert!(!table.cancel("missing", "x"));
    }
}
