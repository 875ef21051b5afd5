//! Job status store.
//!
//! The store is the only place a client can learn what happened to a job.
//! Writes to one job are serialized and never move a job backwards through
//! its lifecycle; writes to different jobs proceed in parallel.

use std::collections::BTreeMap;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::models::api::{StatusUpdateRequest, StatusUpdateResponse};
use crate::models::job::{JobResult, JobState, JobStatusRecord};

/// Outcome of a successful state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: JobState,
    pub current: JobState,
}

impl Transition {
    /// Whether the request actually changed the state.
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, job_id: &str) -> Result<JobStatusRecord, StatusError>;

    /// Insert a new record. Fails if `job_id` is already known.
    async fn insert(&self, job_id: &str, record: JobStatusRecord) -> Result<(), StatusError>;

    /// Move `job_id` from `expected` to `next`. Returns `Ok(false)` without
    /// writing when the current state is not `expected`.
    async fn compare_and_set(
        &self,
        job_id: &str,
        expected: JobState,
        next: JobState,
    ) -> Result<bool, StatusError>;

    /// Move `job_id` forward to `next`, attaching `result` if given.
    /// Re-applying the current state is a no-op; a regression is an error.
    async fn advance(
        &self,
        job_id: &str,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Transition, StatusError>;

    /// Remove a record whose job was never published. Only `queued` records
    /// can be discarded.
    async fn discard(&self, job_id: &str) -> Result<(), StatusError>;

    /// Number of jobs per state.
    async fn summary(&self) -> Result<BTreeMap<JobState, u64>, StatusError>;
}

/// Process-local store backed by a sharded concurrent map; each entry is
/// updated under its shard lock, so no lock spans an await point.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    jobs: DashMap<String, JobStatusRecord>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, job_id: &str) -> Result<JobStatusRecord, StatusError> {
        self.jobs
            .get(job_id)
            .map(|record| record.value().clone())
            .ok_or_else(|| StatusError::NotFound(job_id.to_string()))
    }

    async fn insert(&self, job_id: &str, record: JobStatusRecord) -> Result<(), StatusError> {
        match self.jobs.entry(job_id.to_string()) {
            Entry::Occupied(_) => Err(StatusError::AlreadyExists(job_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn compare_and_set(
        &self,
        job_id: &str,
        expected: JobState,
        next: JobState,
    ) -> Result<bool, StatusError> {
        let mut record = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StatusError::NotFound(job_id.to_string()))?;
        if record.status != expected {
            return Ok(false);
        }
        if !expected.can_advance_to(next) {
            return Err(StatusError::InvalidTransition {
                job_id: job_id.to_string(),
                from: expected,
                to: next,
            });
        }
        record.status = next;
        record.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn advance(
        &self,
        job_id: &str,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Transition, StatusError> {
        let mut record = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StatusError::NotFound(job_id.to_string()))?;
        let previous = record.status;
        if !previous.can_advance_to(next) {
            return Err(StatusError::InvalidTransition {
                job_id: job_id.to_string(),
                from: previous,
                to: next,
            });
        }
        if previous != next {
            record.status = next;
            record.updated_at = Some(Utc::now());
            if result.is_some() {
                record.result = result;
            }
        }
        Ok(Transition {
            previous,
            current: next,
        })
    }

    async fn discard(&self, job_id: &str) -> Result<(), StatusError> {
        if self
            .jobs
            .remove_if(job_id, |_, record| record.status == JobState::Queued)
            .is_some()
        {
            return Ok(());
        }
        match self.jobs.get(job_id) {
            Some(record) => Err(StatusError::NotDiscardable {
                job_id: job_id.to_string(),
                state: record.status,
            }),
            None => Err(StatusError::NotFound(job_id.to_string())),
        }
    }

    async fn summary(&self) -> Result<BTreeMap<JobState, u64>, StatusError> {
        let mut counts = BTreeMap::new();
        for record in self.jobs.iter() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Write side used by the notification sink and the dead-letter reconciler.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn record(
        &self,
        job_id: &str,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Transition, StatusError>;
}

#[async_trait]
impl<S: StatusStore + ?Sized> StatusSink for S {
    async fn record(
        &self,
        job_id: &str,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Transition, StatusError> {
        self.advance(job_id, next, result).await
    }
}

/// Forwards status changes to a gateway's `POST /jobs/update` endpoint.
pub struct StatusCallback {
    http: reqwest::Client,
    update_url: String,
}

impl StatusCallback {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            update_url: format!("{}/jobs/update", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl StatusSink for StatusCallback {
    async fn record(
        &self,
        job_id: &str,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Transition, StatusError> {
        let response = self
            .http
            .post(&self.update_url)
            .json(&StatusUpdateRequest {
                job_id: job_id.to_string(),
                status: next,
                result,
            })
            .send()
            .await
            .map_err(StatusError::Http)?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(StatusError::NotFound(job_id.to_string())),
            reqwest::StatusCode::CONFLICT => Err(StatusError::Rejected {
                job_id: job_id.to_string(),
                to: next,
            }),
            status if !status.is_success() => Err(StatusError::Remote(status.as_u16())),
            _ => {
                let body: StatusUpdateResponse = response.json().await.map_err(StatusError::Http)?;
                Ok(Transition {
                    previous: body.previous,
                    current: body.current,
                })
            }
        }
    }
}

/// Sink that only logs; used by a standalone notifier with no gateway to
/// report to.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn record(
        &self,
        job_id: &str,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Transition, StatusError> {
        tracing::info!(
            job_id,
            status = %next,
            processed_file = result.as_ref().map(|r| r.processed_file.as_str()),
            "Job status event"
        );
        Ok(Transition {
            previous: next,
            current: next,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {0} already exists")]
    AlreadyExists(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Job {job_id} is {state} and can no longer be discarded")]
    NotDiscardable { job_id: String, state: JobState },

    #[error("Status service refused to move job {job_id} to {to}")]
    Rejected { job_id: String, to: JobState },

    #[error("Status service returned HTTP {0}")]
    Remote(u16),

    #[error("Status callback failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(state: JobState) -> JobStatusRecord {
        JobStatusRecord {
            status: state,
            operations: vec!["resize".to_string()],
            timestamp: Utc::now(),
            file_name: "j_cat.jpg".to_string(),
            updated_at: None,
            result: None,
        }
    }

    fn result() -> JobResult {
        JobResult {
            processed_file: "processed_j_cat.jpg".to_string(),
            processing_time: 0.4,
            worker_id: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let store = InMemoryStatusStore::new();
        assert!(matches!(store.get("nope").await, Err(StatusError::NotFound(_))));
        assert!(matches!(
            store.advance("nope", JobState::Completed, None).await,
            Err(StatusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_is_exclusive() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        let err = store.insert("j", record(JobState::Completed)).await.unwrap_err();
        assert!(matches!(err, StatusError::AlreadyExists(_)));
        assert_eq!(store.get("j").await.unwrap().status, JobState::Queued);
    }

    #[tokio::test]
    async fn test_advance_attaches_result_and_timestamp() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        let t = store
            .advance("j", JobState::Completed, Some(result()))
            .await
            .unwrap();
        assert!(t.changed());
        let stored = store.get("j").await.unwrap();
        assert_eq!(stored.status, JobState::Completed);
        assert_eq!(stored.result, Some(result()));
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_no_regression_and_idempotent_reapply() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        store.advance("j", JobState::Completed, Some(result())).await.unwrap();

        let again = store.advance("j", JobState::Completed, None).await.unwrap();
        assert!(!again.changed());
        assert_eq!(store.get("j").await.unwrap().result, Some(result()));

        let err = store.advance("j", JobState::Queued, None).await.unwrap_err();
        assert!(matches!(
            err,
            StatusError::InvalidTransition { from: JobState::Completed, to: JobState::Queued, .. }
        ));
        let err = store.advance("j", JobState::DeadLettered, None).await.unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        assert!(!store
            .compare_and_set("j", JobState::Processing, JobState::Completed)
            .await
            .unwrap());
        assert!(store
            .compare_and_set("j", JobState::Queued, JobState::Processing)
            .await
            .unwrap());
        assert_eq!(store.get("j").await.unwrap().status, JobState::Processing);
    }

    #[tokio::test]
    async fn test_concurrent_updates_never_regress() {
        let store = Arc::new(InMemoryStatusStore::new());
        for i in 0..50 {
            store.insert(&format!("j{i}"), record(JobState::Queued)).await.unwrap();
        }
        let mut tasks = Vec::new();
        for i in 0..50 {
            for state in [JobState::Processing, JobState::Completed, JobState::Processing] {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    let _ = store.advance(&format!("j{i}"), state, None).await;
                }));
            }
        }
        futures::future::join_all(tasks).await;

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.get(&JobState::Completed), Some(&50));
        assert_eq!(summary.get(&JobState::Queued), None);
    }

    #[tokio::test]
    async fn test_store_is_a_sink() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        let sink: &dyn StatusSink = &store;
        let t = sink.record("j", JobState::DeadLettered, None).await.unwrap();
        assert_eq!(t.current, JobState::DeadLettered);
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        let t = LogSink.record("any", JobState::Completed, Some(result())).await.unwrap();
        assert!(!t.changed());
    }

    #[tokio::test]
    async fn test_discard() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        store.discard("j").await.unwrap();
        assert!(matches!(store.get("j").await, Err(StatusError::NotFound(_))));
        assert!(matches!(store.discard("j").await, Err(StatusError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_discard_keeps_records_past_queued() {
        let store = InMemoryStatusStore::new();
        store.insert("j", record(JobState::Queued)).await.unwrap();
        store.advance("j", JobState::Completed, Some(result())).await.unwrap();

        let err = store.discard("j").await.unwrap_err();
        assert!(matches!(
            err,
            StatusError::NotDiscardable { state: JobState::Completed, .. }
        ));
        assert_eq!(store.get("j").await.unwrap().status, JobState::Completed);
    }
}
