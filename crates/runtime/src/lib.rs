mod channel;
mod completion_client;
mod dialogue;
mod process_manager;
mod queue;
mod runtime;


pub use channel::{
    failure_notice, normalize_reply, reply_text, split_message, ChannelHost, ChannelId,
    EMPTY_ANSWER_NOTICE,
};
pub use completion_client::StreamingCompletionClient;
pub use dialogue::{clean_utterance, DialoguePhase, DialogueSession, DialogueSimulator, DialogueTurn, Speaker};
pub use process_manager::{launch_command, parse_ready_event, render_command, ProcessSupervisor};
pub use queue::{
    restart_backoff, JobKind, PromptDefaults, QueuedJob, ReplySink, RequestQueue, RequestWorker,
    SharedDefaults, WorkerSettings, WorkerSupervisor, IMAGE_TAG,
};
pub use runtime::{ModelRuntime, RuntimeHandle};

use async_trait::async_trait;
use llamarelay_common::{CompletionRequest, CompletionResult, Result, ServerStatus};
use std::time::Duration;

/// Lifecycle of the inference server
#[async_trait]
pub trait InferenceServer: Send + Sync {
    /// Current state and address, without blocking
    fn state(&self) -> ServerStatus;

    /// Spawn the server; a no-op when it is already starting or running
    async fn start(&self) -> Result<ServerStatus>;

    /// Terminate the server; a no-op when it is stopped
    async fn stop(&self) -> Result<ServerStatus>;

    /// Wait until the server is running and return its base address
    async fn wait_until_ready(&self, timeout: Duration) -> Result<String>;
}

/// Turns a completion request into a result. Implementations fold every
/// failure into the result instead of returning an error.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult;
}
