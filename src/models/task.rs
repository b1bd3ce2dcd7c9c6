use serde::Serialize;

/// Maximum delivery attempts the worker makes before archiving a task.
pub const DEFAULT_MAX_RETRY: i32 = 25;
/// Per-attempt processing timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: i64 = 30 * 60;

/// An opaque unit of work: a kind the worker dispatches on plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// What the backend recorded for an accepted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
    pub kind: String,
}

/// Wire form of a task as the asynq worker stores and reads it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "3")]
    pub id: String,
    #[prost(string, tag = "4")]
    pub queue: String,
    #[prost(int32, tag = "5")]
    pub retry: i32,
    #[prost(int32, tag = "6")]
    pub retried: i32,
    #[prost(string, tag = "7")]
    pub error_msg: String,
    #[prost(int64, tag = "11")]
    pub last_failed_at: i64,
    #[prost(int64, tag = "8")]
    pub timeout: i64,
    #[prost(int64, tag = "9")]
    pub deadline: i64,
    #[prost(string, tag = "10")]
    pub unique_key: String,
    #[prost(string, tag = "14")]
    pub group_key: String,
    #[prost(int64, tag = "15")]
    pub retention: i64,
    #[prost(int64, tag = "16")]
    pub completed_at: i64,
}

impl TaskMessage {
    pub fn pending(task: &Task, id: String, queue: String) -> Self {
        Self {
            r#type: task.kind.clone(),
            payload: task.payload.clone(),
            id,
            queue,
            retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TIMEOUT_SECS,
            ..Default::default()
        }
    }
}
