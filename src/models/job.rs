use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Operations the transform pipeline knows how to dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    IntoStaticStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Resize,
    Watermark,
    Filter,
}

impl Operation {
    pub fn names() -> Vec<&'static str> {
        Operation::iter().map(|op| op.into()).collect()
    }

    /// Parse a comma-separated operation list, dropping unknown names.
    /// Duplicates are kept: applying an operation twice is a valid request.
    pub fn parse_list(raw: &str) -> Vec<Operation> {
        raw.split(',')
            .map(str::trim)
            .filter_map(|name| name.parse::<Operation>().ok())
            .collect()
    }
}

/// Job descriptor carried on the task queue. Immutable once published.
///
/// Operations travel as plain names: a worker running an older registry
/// must still be able to decode a descriptor naming an operation it lacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobDescriptor {
    #[garde(length(min = 1))]
    pub job_id: String,
    /// Blob key of the uploaded payload inside `bucket`
    #[garde(length(min = 1))]
    pub file_name: String,
    #[garde(skip)]
    pub original_name: String,
    #[garde(length(min = 1))]
    pub operations: Vec<String>,
    #[garde(skip)]
    #[serde(deserialize_with = "super::timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
    #[garde(length(min = 1))]
    pub bucket: String,
}

impl JobDescriptor {
    /// Key under which the pipeline output is stored.
    pub fn processed_key(&self) -> String {
        format!("processed_{}", self.file_name)
    }
}

/// Externally visible state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLettered,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Processing => 1,
            JobState::Completed | JobState::Failed | JobState::DeadLettered => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` keeps the state monotonic.
    /// Staying in the same state is allowed so redelivered events are no-ops.
    pub fn can_advance_to(self, next: JobState) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

/// Output reference attached to a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub processed_file: String,
    pub processing_time: f64,
    pub worker_id: String,
}

/// Status record served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub status: JobState,
    pub operations: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl JobStatusRecord {
    pub fn queued(descriptor: &JobDescriptor) -> Self {
        Self {
            status: JobState::Queued,
            operations: descriptor.operations.clone(),
            timestamp: descriptor.timestamp,
            file_name: descriptor.file_name.clone(),
            updated_at: None,
            result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_drops_unknown() {
        let ops = Operation::parse_list("resize, sepia ,watermark,,filter");
        assert_eq!(
            ops,
            vec![Operation::Resize, Operation::Watermark, Operation::Filter]
        );
        assert!(Operation::parse_list("sepia,crop").is_empty());
    }

    #[test]
    fn test_operation_names_round_trip_through_strum() {
        for name in Operation::names() {
            let op: Operation = name.parse().unwrap();
            assert_eq!(op.as_ref(), name);
        }
    }

    #[test]
    fn test_state_machine_is_monotonic() {
        use JobState::*;
        assert!(Queued.can_advance_to(Processing));
        assert!(Queued.can_advance_to(Completed));
        assert!(Processing.can_advance_to(Completed));
        assert!(Queued.can_advance_to(DeadLettered));
        assert!(Processing.can_advance_to(DeadLettered));
        assert!(Completed.can_advance_to(Completed));

        assert!(!Completed.can_advance_to(Queued));
        assert!(!Processing.can_advance_to(Queued));
        assert!(!Completed.can_advance_to(DeadLettered));
        assert!(!DeadLettered.can_advance_to(Completed));
        assert!(!Failed.can_advance_to(Processing));
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = r#"{
            "job_id": "j-1",
            "file_name": "j-1_cat.jpg",
            "original_name": "cat.jpg",
            "operations": ["resize"],
            "timestamp": "2024-05-01T12:00:00Z",
            "bucket": "images"
        }"#;
        let descriptor: JobDescriptor = serde_json::from_str(json).unwrap();
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.processed_key(), "processed_j-1_cat.jpg");
    }

    #[test]
    fn test_descriptor_accepts_timestamp_without_offset() {
        let json = r#"{"job_id":"j-3","file_name":"j-3_cat.jpg","original_name":"cat.jpg",
                       "operations":["resize"],"timestamp":"2024-05-01T12:00:00.123456",
                       "bucket":"images"}"#;
        let descriptor: JobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.timestamp.to_rfc3339(), "2024-05-01T12:00:00.123456+00:00");
    }

    #[test]
    fn test_descriptor_validation_rejects_empty_operations() {
        let descriptor = JobDescriptor {
            job_id: "j-2".to_string(),
            file_name: "j-2_a.png".to_string(),
            original_name: "a.png".to_string(),
            operations: vec![],
            timestamp: Utc::now(),
            bucket: "images".to_string(),
        };
        assert!(descriptor.validate().is_err());
    }
}
