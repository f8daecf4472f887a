use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);
const LOG_TRUNCATE_LEN: usize = 1000;

/// Message role enum for prompt history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(label)
    }
}

/// One prior turn of history with role and content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Fixed sampling parameters sent with every completion
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SamplingParams {
    pub stream: bool,
    pub n_predict: i32,
    pub temperature: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub grammar: String,
    pub n_probs: i32,
    pub min_keep: i32,
    pub cache_prompt: bool,
    pub slot_id: i32,
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            stream: true,
            n_predict: 400,
            temperature: 0.7,
            repeat_last_n: 256,
            repeat_penalty: 1.18,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            tfs_z: 1.0,
            typical_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            grammar: String::new(),
            n_probs: 0,
            min_keep: 0,
            cache_prompt: true,
            slot_id: -1,
            stop: vec![
                "</s>".to_string(),
                "Llama:".to_string(),
                "User:".to_string(),
            ],
        }
    }
}

/// A single completion request. Built fresh per call and never mutated
/// once handed to the queue.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_context: Option<String>,
    pub user_prompt: String,
    pub history: Vec<Message>,
    pub image_payload: Option<Vec<u8>>,
    pub sampling: SamplingParams,
    pub deadline: Duration,
}

impl CompletionRequest {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            system_context: None,
            user_prompt: user_prompt.into(),
            history: Vec::new(),
            image_payload: None,
            sampling: SamplingParams::default(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.system_context = Some(context.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image_payload = Some(image);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Full prompt text: history, then context, then the user prompt, one
    /// part per line. Absent or empty parts are omitted.
    pub fn prompt_text(&self) -> String {
        let mut parts: Vec<String> = self
            .history
            .iter()
            .map(|item| format!("{}: {}", item.role, item.content))
            .collect();

        if let Some(context) = self.system_context.as_deref() {
            if !context.is_empty() {
                parts.push(context.to_string());
            }
        }
        if !self.user_prompt.is_empty() {
            parts.push(self.user_prompt.clone());
        }

        parts.join("\n")
    }
}

/// Outcome of one completion. Delivered exactly once to the job's sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResult {
    pub text: String,
    pub ok: bool,
    pub failure_reason: Option<String>,
}

impl CompletionResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: true,
            failure_reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            ok: false,
            failure_reason: Some(reason.into()),
        }
    }

    /// A successful stream that produced no content
    pub fn is_empty_answer(&self) -> bool {
        self.ok && self.text.trim().is_empty()
    }
}

/// Lifecycle of the inference server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Snapshot of the process state and the address it is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub state: ProcessState,
    pub address: Option<String>,
    /// Incremented on every spawn; distinguishes one run from the next
    pub run_id: u64,
}

impl ServerStatus {
    pub fn stopped() -> Self {
        Self {
            state: ProcessState::Stopped,
            address: None,
            run_id: 0,
        }
    }

    /// Starting or Running
    pub fn is_active(&self) -> bool {
        matches!(self.state, ProcessState::Starting | ProcessState::Running)
    }
}

/// Truncate long model output for log lines
pub fn truncate_log(message: &str) -> String {
    if message.chars().count() > LOG_TRUNCATE_LEN {
        let head: String = message.chars().take(LOG_TRUNCATE_LEN).collect();
        format!("{}... [truncated]", head)
    } else {
        message.to_string()
    }
}
