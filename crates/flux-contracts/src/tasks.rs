use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote lifecycle state of a generation task.
///
/// `Pending` and `RequestModerated` keep a poll session waiting; every other
/// state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    RequestModerated,
    Ready,
    Error,
    ContentModerated,
    NotFound,
}

impl TaskState {
    /// Maps a wire `status` string. Returns `None` for statuses this client
    /// does not know about.
    pub fn from_status(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "pending" | "queued" | "processing" => Some(Self::Pending),
            "request moderated" => Some(Self::RequestModerated),
            "ready" => Some(Self::Ready),
            "error" | "failed" => Some(Self::Error),
            "content moderated" => Some(Self::ContentModerated),
            "task not found" => Some(Self::NotFound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::RequestModerated => "Request Moderated",
            Self::Ready => "Ready",
            Self::Error => "Error",
            Self::ContentModerated => "Content Moderated",
            Self::NotFound => "Task not found",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::RequestModerated)
    }
}

/// One immutable status snapshot returned by a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub state: TaskState,
    pub raw_status: String,
    pub artifact: Option<String>,
    pub failure_reason: Option<String>,
    pub progress: Option<f64>,
    pub payload: Value,
}

impl TaskSnapshot {
    /// Builds a snapshot from a `get_result` body. Unknown statuses are kept
    /// in `raw_status` and treated as `Pending`.
    pub fn from_payload(fallback_id: &str, payload: Value) -> Self {
        let id = non_empty_str(payload.get("id"))
            .unwrap_or(fallback_id)
            .to_string();
        let raw_status = non_empty_str(payload.get("status"))
            .unwrap_or_default()
            .to_string();
        let state = TaskState::from_status(&raw_status).unwrap_or(TaskState::Pending);
        let result = payload.get("result").and_then(Value::as_object);

        let artifact = if state == TaskState::Ready {
            result
                .and_then(|row| {
                    non_empty_str(row.get("sample"))
                        .or_else(|| non_empty_str(row.get("output")))
                        .or_else(|| non_empty_str(row.get("url")))
                })
                .or_else(|| non_empty_str(payload.get("sample")))
                .map(str::to_string)
        } else {
            None
        };

        let failure_reason = if matches!(state, TaskState::Error | TaskState::NotFound) {
            let detail = result
                .and_then(|row| non_empty_str(row.get("error")))
                .or_else(|| non_empty_str(payload.get("error")))
                .map(str::to_string)
                .or_else(|| describe_details(payload.get("details")));
            Some(detail.unwrap_or_else(|| state.as_str().to_string()))
        } else {
            None
        };

        let progress = payload.get("progress").and_then(Value::as_f64);

        Self {
            id,
            state,
            raw_status,
            artifact,
            failure_reason,
            progress,
            payload,
        }
    }

    pub fn is_recognized_status(&self) -> bool {
        TaskState::from_status(&self.raw_status).is_some()
    }
}

/// Response of a submission call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_url: Option<String>,
}

impl SubmittedTask {
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = non_empty_str(payload.get("id"))?.to_string();
        let polling_url = non_empty_str(payload.get("polling_url")).map(str::to_string);
        Some(Self { id, polling_url })
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn describe_details(details: Option<&Value>) -> Option<String> {
    match details? {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.trim().to_string()),
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}
