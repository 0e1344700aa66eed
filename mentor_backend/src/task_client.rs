//! Submit/poll client for task-queue style generation backends.
//!
//! A generation request is queued with one call and then polled at a fixed
//! cadence until the task reports a terminal status or the attempt budget
//! runs out. The HTTP details live behind [`TaskBackend`]; this module owns the
//! status classification, the timing budget and the error taxonomy.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::extractor::{self, ParseFailure};

const FAILURE_DETAIL_FALLBACK: &str = "Нет подробностей";

/// Timing budget for a single `run`. No defaults here: the config layer
/// decides the concrete values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskClientConfig {
    pub submit_timeout: Duration,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl TaskClientConfig {
    /// Worst-case time spent waiting between polls. Saturates at
    /// `Duration::MAX`.
    pub fn polling_budget(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Starting,
    Processing,
    Success,
    Failed,
    Unknown,
}

impl TaskStatus {
    /// Classify a backend status string after trimming and case-folding.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unknown;
        };
        match raw.trim().to_lowercase().as_str() {
            "starting" => Self::Starting,
            "processing" => Self::Processing,
            "success" => Self::Success,
            "failed" | "error" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    fn of(payload: &Value) -> Self {
        Self::parse(payload.get("status").and_then(Value::as_str))
    }
}

/// A task accepted by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("backend did not start the task (status: {})", .status.as_deref().unwrap_or("none"))]
    StartFailed {
        status: Option<String>,
        snapshot: Value,
    },

    #[error("task failed: {detail}")]
    TaskFailed { detail: String },

    #[error("could not parse task result: {0}")]
    ParseFailed(#[from] ParseFailure),

    #[error("task did not finish after {attempts} polls")]
    Timeout { attempts: u32 },

    #[error("transport error{}: {message}", .code.map(|c| format!(" {}", c)).unwrap_or_default())]
    Transport { code: Option<u16>, message: String },

    #[error("unexpected error: {detail}")]
    Unknown { detail: String },
}

impl ClientError {
    /// Whether a caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { code, .. } => code.map_or(true, |c| c >= 500 || c == 429),
            ClientError::Timeout { .. } => true,
            ClientError::StartFailed { .. }
            | ClientError::TaskFailed { .. }
            | ClientError::ParseFailed(_)
            | ClientError::Unknown { .. } => false,
        }
    }

    /// Text shown to the chat user.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::StartFailed { status, .. } => format!(
                "❌ Gen-API не смог начать задачу. Статус: {}.",
                status.as_deref().unwrap_or("нет")
            ),
            ClientError::TaskFailed { detail } => format!("❌ Gen-API ошибка: {}", detail),
            ClientError::ParseFailed(failure) => {
                format!("❌ Структура ответа Gen-API изменилась: {}.", failure.reason)
            }
            ClientError::Timeout { .. } => {
                "❌ Превышено время ожидания ответа от Gen-API. Попробуйте позже.".to_string()
            }
            ClientError::Transport {
                code: Some(code), ..
            } => format!("❌ Ошибка подключения Gen-API. Код {}!", code),
            ClientError::Transport { code: None, .. } => {
                "❌ Ошибка подключения Gen-API. Сервер недоступен.".to_string()
            }
            ClientError::Unknown { detail } => format!("❌ Ошибка: {}", detail),
        }
    }
}

/// One `{type: "text", text}` content part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// Body of the task-creation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitPayload {
    pub messages: Vec<PayloadMessage>,
}

impl SubmitPayload {
    pub fn new(system_prompt: &str, user_text: &str) -> Self {
        Self {
            messages: vec![
                PayloadMessage::text("system", system_prompt),
                PayloadMessage::text("user", user_text),
            ],
        }
    }

    /// The system prompt this payload was composed with.
    pub fn system_prompt(&self) -> Option<&str> {
        self.text_for("system")
    }

    pub fn user_text(&self) -> Option<&str> {
        self.text_for("user")
    }

    fn text_for(&self, role: &str) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == role)
            .and_then(|m| m.content.first())
            .map(|part| part.text.as_str())
    }
}

impl PayloadMessage {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            content: vec![ContentPart {
                part_type: "text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

/// Wire access to the task queue. Implementations return the decoded JSON
/// body and map HTTP-level faults to [`ClientError::Transport`].
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn submit(&self, payload: &SubmitPayload, timeout: Duration) -> Result<Value, ClientError>;

    async fn poll(&self, task_id: &str, timeout: Duration) -> Result<Value, ClientError>;
}

/// Runs one generation request end to end. Cheap to clone; concurrent `run`
/// calls share nothing but the backend handle.
#[derive(Clone)]
pub struct TaskClient {
    backend: Arc<dyn TaskBackend>,
    config: TaskClientConfig,
}

impl TaskClient {
    pub fn new(backend: Arc<dyn TaskBackend>, config: TaskClientConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &TaskClientConfig {
        &self.config
    }

    /// Submit `system_prompt` + `user_text`, wait for the task and return
    /// the extracted answer. Never retries.
    pub async fn run(&self, system_prompt: &str, user_text: &str) -> Result<String, ClientError> {
        let payload = SubmitPayload::new(system_prompt, user_text);
        let task = self.submit(&payload).await?;
        tracing::info!("Gen-API task {} accepted ({:?})", task.id, task.status);

        let result = self.wait_for_completion(&task).await;
        match &result {
            Ok(text) => tracing::info!("Gen-API task {} finished ({} chars)", task.id, text.len()),
            Err(ClientError::ParseFailed(failure)) => tracing::error!(
                "Gen-API task {} result unparsable: {}. Full response: {}",
                task.id,
                failure.reason,
                failure.snapshot
            ),
            Err(e) => tracing::error!("Gen-API task {} failed: {}", task.id, e),
        }
        result
    }

    async fn submit(&self, payload: &SubmitPayload) -> Result<Task, ClientError> {
        let body = self
            .backend
            .submit(payload, self.config.submit_timeout)
            .await?;

        let status = TaskStatus::of(&body);
        let id = task_id(&body);

        match (id, status) {
            (Some(id), TaskStatus::Starting | TaskStatus::Processing) => Ok(Task { id, status }),
            _ => {
                tracing::error!("Failed to start Gen-API request: {}", body);
                Err(ClientError::StartFailed {
                    status: body
                        .get("status")
                        .and_then(Value::as_str)
                        .map(|s| s.trim().to_string()),
                    snapshot: body,
                })
            }
        }
    }

    async fn wait_for_completion(&self, task: &Task) -> Result<String, ClientError> {
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            sleep(self.config.poll_interval).await;

            let body = self
                .backend
                .poll(&task.id, self.config.poll_timeout)
                .await?;

            match TaskStatus::of(&body) {
                TaskStatus::Success => return extractor::extract(&body).map_err(ClientError::from),
                TaskStatus::Failed => {
                    return Err(ClientError::TaskFailed {
                        detail: failure_detail(&body),
                    })
                }
                TaskStatus::Starting | TaskStatus::Processing => {
                    tracing::debug!("Processing... attempt {}/{}", attempt, max_attempts);
                }
                TaskStatus::Unknown => {
                    tracing::warn!(
                        "Unrecognized status {:?} for task {} (attempt {}/{}), still waiting",
                        body.get("status"),
                        task.id,
                        attempt,
                        max_attempts
                    );
                }
            }
        }

        tracing::warn!(
            "Timeout: task {} unfinished after {:?}",
            task.id,
            self.config.polling_budget()
        );
        Err(ClientError::Timeout {
            attempts: max_attempts,
        })
    }
}

/// `request_id` or `id`, as a non-empty string.
fn task_id(body: &Value) -> Option<String> {
    ["request_id", "id"]
        .iter()
        .filter_map(|key| body.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Error detail from a failed task: `error`, then `result`; the first element
/// when the field is a list.
fn failure_detail(body: &Value) -> String {
    let field = body
        .get("error")
        .filter(|v| !v.is_null())
        .or_else(|| body.get("result").filter(|v| !v.is_null()));

    let value = match field {
        Some(Value::Array(items)) => items.first(),
        other => other,
    };

    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) | Some(Value::Null) | None => FAILURE_DETAIL_FALLBACK.to_string(),
        Some(other) => other.to_string(),
    }
}
