use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobResult, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

/// Event published on the notification queue when a worker finishes a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub status: Outcome,
    /// Present only when `status` is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_file: Option<String>,
    /// Wall-clock seconds spent in `handle`
    pub processing_time: f64,
    pub worker_id: String,
    #[serde(deserialize_with = "super::timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn completed(
        job_id: impl Into<String>,
        processed_file: impl Into<String>,
        processing_time: f64,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: Outcome::Completed,
            processed_file: Some(processed_file.into()),
            processing_time,
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Status the job should move to when this event is applied.
    pub fn target_state(&self) -> JobState {
        match self.status {
            Outcome::Completed => JobState::Completed,
            Outcome::Failed => JobState::Failed,
        }
    }

    pub fn result(&self) -> Option<JobResult> {
        self.processed_file.as_ref().map(|file| JobResult {
            processed_file: file.clone(),
            processing_time: self.processing_time,
            worker_id: self.worker_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_event_wire_format() {
        let event = CompletionEvent::completed("j-1", "processed_j-1_cat.jpg", 1.25, "worker-1");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["job_id"], "j-1");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["processed_file"], "processed_j-1_cat.jpg");
        assert_eq!(value["processing_time"], 1.25);
        assert_eq!(value["worker_id"], "worker-1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_failed_event_has_no_output() {
        let json = r#"{"job_id":"j-2","status":"failed","processing_time":0.5,
                       "worker_id":"2","timestamp":"2024-05-01T12:00:00Z"}"#;
        let event: CompletionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.target_state(), JobState::Failed);
        assert!(event.result().is_none());
    }

    #[test]
    fn test_event_accepts_timestamp_without_offset() {
        let json = r#"{"job_id":"j-3","status":"completed","processed_file":"processed_j-3_a.png",
                       "processing_time":1.5,"worker_id":"1","timestamp":"2024-05-01T12:00:01.5"}"#;
        let event: CompletionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.target_state(), JobState::Completed);
        assert_eq!(event.timestamp.timestamp_millis() % 1000, 500);
    }
}
