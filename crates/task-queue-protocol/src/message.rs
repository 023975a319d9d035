use serde::{Deserialize, Serialize};
use task_queue_core::{Metadata, TaskError, TaskRecord, TaskStatus};

/// Message types for the TCP protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Enqueue = 1,
    Dequeue = 2,
    Ack = 3,
    ListTasks = 4,
    Heartbeat = 5,
    EnqueueResponse = 11,
    DequeueResponse = 12,
    AckResponse = 13,
    ListTasksResponse = 14,
    HeartbeatResponse = 15,
    Status = 20,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Enqueue),
            2 => Some(MessageType::Dequeue),
            3 => Some(MessageType::Ack),
            4 => Some(MessageType::ListTasks),
            5 => Some(MessageType::Heartbeat),
            11 => Some(MessageType::EnqueueResponse),
            12 => Some(MessageType::DequeueResponse),
            13 => Some(MessageType::AckResponse),
            14 => Some(MessageType::ListTasksResponse),
            15 => Some(MessageType::HeartbeatResponse),
            20 => Some(MessageType::Status),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol messages.
///
/// Every request is answered by its matching response or by `Status` when
/// the call failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Enqueue(EnqueueRequest),
    Dequeue(DequeueRequest),
    Ack(AckRequest),
    ListTasks(ListTasksRequest),
    /// Keep a long-running lease alive
    Heartbeat(HeartbeatRequest),

    EnqueueResponse(EnqueueResponse),
    DequeueResponse(DequeueResponse),
    AckResponse(AckResponse),
    ListTasksResponse(ListTasksResponse),
    HeartbeatResponse(HeartbeatResponse),

    /// Failed call
    Status(RpcStatus),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Enqueue(_) => MessageType::Enqueue,
            Message::Dequeue(_) => MessageType::Dequeue,
            Message::Ack(_) => MessageType::Ack,
            Message::ListTasks(_) => MessageType::ListTasks,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::EnqueueResponse(_) => MessageType::EnqueueResponse,
            Message::DequeueResponse(_) => MessageType::DequeueResponse,
            Message::AckResponse(_) => MessageType::AckResponse,
            Message::ListTasksResponse(_) => MessageType::ListTasksResponse,
            Message::HeartbeatResponse(_) => MessageType::HeartbeatResponse,
            Message::Status(_) => MessageType::Status,
        }
    }

    /// Wire name of the call, used in logs and metrics
    pub fn method_name(&self) -> &'static str {
        match self {
            Message::Enqueue(_) | Message::EnqueueResponse(_) => "Enqueue",
            Message::Dequeue(_) | Message::DequeueResponse(_) => "Dequeue",
            Message::Ack(_) | Message::AckResponse(_) => "Ack",
            Message::ListTasks(_) | Message::ListTasksResponse(_) => "ListTasks",
            Message::Heartbeat(_) | Message::HeartbeatResponse(_) => "Heartbeat",
            Message::Status(_) => "Status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// A task as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub task_type: String,
    pub payload: String,
    pub metadata: Vec<MetadataEntry>,
    /// PENDING | IN_PROGRESS | COMPLETED | FAILED
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub result: Option<String>,
    pub worker_id: Option<String>,
    pub attempts: i32,
}

impl From<&TaskRecord> for TaskMessage {
    fn from(record: &TaskRecord) -> Self {
        TaskMessage {
            id: record.id.clone(),
            task_type: record.task_type.clone(),
            payload: record.payload.clone(),
            metadata: metadata_entries(&record.metadata),
            status: record.status.as_str().to_string(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            result: record.result.clone(),
            worker_id: record.worker_id.clone(),
            attempts: i32::try_from(record.attempts).unwrap_or(i32::MAX),
        }
    }
}

impl TryFrom<TaskMessage> for TaskRecord {
    type Error = TaskError;

    fn try_from(message: TaskMessage) -> Result<Self, Self::Error> {
        let status: TaskStatus = message.status.parse()?;
        let attempts = u32::try_from(message.attempts).map_err(|_| {
            TaskError::InvalidArgument(format!("negative attempts {}", message.attempts))
        })?;

        Ok(TaskRecord {
            id: message.id,
            task_type: message.task_type,
            payload: message.payload,
            metadata: entries_to_metadata(message.metadata),
            status,
            created_at: message.created_at,
            updated_at: message.updated_at,
            result: message.result.filter(|r| !r.is_empty()),
            worker_id: message.worker_id.filter(|w| !w.is_empty()),
            attempts,
        })
    }
}

pub fn metadata_entries(metadata: &Metadata) -> Vec<MetadataEntry> {
    metadata
        .iter()
        .map(|(key, value)| MetadataEntry {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Later duplicates of a key win
pub fn entries_to_metadata(entries: Vec<MetadataEntry>) -> Metadata {
    entries
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub task_type: String,
    pub payload: String,
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub task_id: String,
    pub success: bool,
    /// Empty means no result
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTasksRequest {
    /// Empty means every status
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub task: TaskMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueResponse {
    pub has_task: bool,
    pub task: Option<TaskMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub task: TaskMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<TaskMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub task: TaskMessage,
}

/// Status codes carried by failed calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unavailable,
    Internal,
    Unimplemented,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        RpcStatus {
            code,
            message: message.into(),
        }
    }
}

impl From<&TaskError> for RpcStatus {
    fn from(err: &TaskError) -> Self {
        let code = match err {
            TaskError::NotFound(_) => StatusCode::NotFound,
            TaskError::InvalidArgument(_) => StatusCode::InvalidArgument,
            TaskError::InvalidState { .. } => StatusCode::FailedPrecondition,
            TaskError::Unavailable(_) => StatusCode::Unavailable,
            TaskError::Corrupted(_) => StatusCode::Internal,
        };
        RpcStatus::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::Enqueue));
        assert_eq!(MessageType::from_u8(5), Some(MessageType::Heartbeat));
        assert_eq!(MessageType::from_u8(20), Some(MessageType::Status));
        assert_eq!(MessageType::from_u8(99), None);

        assert_eq!(MessageType::Enqueue.as_u8(), 1);
        assert_eq!(MessageType::ListTasksResponse.as_u8(), 14);
    }

    #[test]
    fn test_task_message_conversion() {
        let mut metadata = Metadata::new();
        metadata.insert("agent".to_string(), "orion".to_string());
        let mut record = TaskRecord::new("demo", "x", metadata).unwrap();
        record.claim("worker-1", record.created_at + 1);

        let message = TaskMessage::from(&record);
        assert_eq!(message.status, "IN_PROGRESS");
        assert_eq!(message.attempts, 1);
        assert_eq!(
            message.metadata,
            vec![MetadataEntry {
                key: "agent".to_string(),
                value: "orion".to_string()
            }]
        );

        assert_eq!(TaskRecord::try_from(message).unwrap(), record);
    }

    #[test]
    fn test_unknown_wire_status_rejected() {
        let record = TaskRecord::new("demo", "x", Metadata::new()).unwrap();
        let mut message = TaskMessage::from(&record);
        message.status = "DONE".to_string();

        assert!(matches!(
            TaskRecord::try_from(message),
            Err(TaskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_error_codes() {
        let cases = [
            (TaskError::NotFound("t".to_string()), StatusCode::NotFound),
            (TaskError::InvalidArgument("bad".to_string()), StatusCode::InvalidArgument),
            (
                TaskError::InvalidState {
                    task_id: "t".to_string(),
                    status: TaskStatus::Completed,
                },
                StatusCode::FailedPrecondition,
            ),
            (TaskError::Unavailable("down".to_string()), StatusCode::Unavailable),
            (TaskError::Corrupted("bits".to_string()), StatusCode::Internal),
        ];

        for (err, code) in cases {
            let status = RpcStatus::from(&err);
            assert_eq!(status.code, code);
            assert_eq!(status.message, err.to_string());
        }
    }
}
