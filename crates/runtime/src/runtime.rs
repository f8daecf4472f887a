use crate::channel::{ChannelHost, ChannelId};
use crate::completion_client::StreamingCompletionClient;
use crate::dialogue::{DialogueSession, DialogueSimulator, Speaker};
use crate::process_manager::ProcessSupervisor;
use crate::queue::{
    PromptDefaults, QueuedJob, ReplySink, RequestQueue, RequestWorker, SharedDefaults,
    WorkerSettings, WorkerSupervisor,
};
use llamarelay_common::{CompletionResult, Result, ServerStatus};
use llamarelay_config::{ActiveProfile, AppConfig, ContextSettings, FlagValue, ModelRegistry};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::info;

/// Handle to interact with the runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    supervisor: ProcessSupervisor,
    queue: RequestQueue,
    simulator: DialogueSimulator,
    host: Arc<dyn ChannelHost>,
    registry: ModelRegistry,
    active: RwLock<ActiveProfile>,
    defaults: SharedDefaults,
    configured_contexts: ContextSettings,
    worker: Mutex<Option<WorkerSupervisor>>,
}

impl RuntimeHandle {
    /// Process state and bound address
    pub fn state(&self) -> ServerStatus {
        self.inner.supervisor.state()
    }

    /// Start the inference server
    pub async fn start(&self) -> Result<ServerStatus> {
        self.inner.supervisor.start().await
    }

    /// Stop the inference server
    pub async fn stop(&self) -> Result<ServerStatus> {
        self.inner.supervisor.stop().await
    }

    pub fn enqueue(&self, job: QueuedJob) -> Result<()> {
        self.inner.queue.enqueue(job)
    }

    /// Queue a user prompt whose answer is posted to `channel_id`
    pub async fn submit_prompt(
        &self,
        channel_id: ChannelId,
        prompt: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<()> {
        let defaults = self.inner.defaults.read().await.clone();
        let reply = ReplySink::Channel {
            host: self.inner.host.clone(),
            channel_id,
        };
        self.enqueue(QueuedJob::prompt(&defaults, prompt, images, reply))
    }

    /// Queue a user prompt and hand back a receiver for its raw result
    pub async fn ask(
        &self,
        prompt: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<oneshot::Receiver<CompletionResult>> {
        let defaults = self.inner.defaults.read().await.clone();
        let (sender, receiver) = oneshot::channel();
        self.enqueue(QueuedJob::prompt(
            &defaults,
            prompt,
            images,
            ReplySink::Oneshot(sender),
        ))?;
        Ok(receiver)
    }

    /// Start a dialogue in a new conversation channel
    pub async fn start_dialogue(&self, speaker_a: Speaker, speaker_b: Speaker) -> Result<ChannelId> {
        self.inner.simulator.start_dialogue(speaker_a, speaker_b).await
    }

    pub async fn session(&self, channel_id: &ChannelId) -> Option<DialogueSession> {
        self.inner.simulator.session(channel_id).await
    }

    /// Switch to another registered model. Takes effect on the next start.
    pub async fn select_model(&self, name: &str) -> Result<String> {
        let mut active = self.inner.active.write().await;
        active.select(&self.inner.registry, name)?;
        info!(model = %name, "Selected model");
        self.apply_profile(&active).await;
        Ok(active.format_settings("\n"))
    }

    /// Update a context or launch setting by name
    pub async fn update_setting(&self, key: &str, value: &str) -> Result<String> {
        if ContextSettings::list_settings().iter().any(|name| *name == key) {
            self.inner
                .defaults
                .write()
                .await
                .contexts
                .update_setting(key, value)?;
            info!(%key, "Updated context setting");
            return Ok(value.to_string());
        }

        let mut active = self.inner.active.write().await;
        let parsed: FlagValue = active.update_setting(key, value)?;
        info!(%key, value = %parsed, "Updated launch setting");
        self.apply_profile(&active).await;
        Ok(parsed.to_string())
    }

    /// Drop every setting override and restore the configured contexts
    pub async fn reset_settings(&self) {
        let mut active = self.inner.active.write().await;
        active.reset();
        self.apply_profile(&active).await;
        self.inner.defaults.write().await.contexts = self.inner.configured_contexts.clone();
        info!("Settings reset to defaults");
    }

    /// Current model, launch and context settings as `key: value` lines
    pub async fn format_settings(&self, separator: &str) -> String {
        let profile = self.inner.active.read().await.format_settings(separator);
        let contexts = self.inner.defaults.read().await.contexts.format_settings(separator);
        format!("{}{}{}", profile, separator, contexts)
    }

    pub async fn current_model(&self) -> String {
        self.inner.active.read().await.name().to_string()
    }

    pub fn list_models(&self) -> Vec<String> {
        self.inner.registry.list_models()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn worker_restarts(&self) -> u64 {
        self.inner.queue.restart_count()
    }

    /// Stop the worker and the inference server
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(worker) = self.inner.worker.lock().await.take() {
            worker.shutdown().await;
        }
        self.inner.supervisor.stop().await?;
        Ok(())
    }

    async fn apply_profile(&self, active: &ActiveProfile) {
        let profile = active.effective();
        self.inner.defaults.write().await.deadline = profile.request_deadline();
        self.inner.supervisor.set_profile(profile).await;
    }
}

/// Factory for creating model runtimes
pub struct ModelRuntime;

impl ModelRuntime {
    /// Wire up the supervisor, queue worker and dialogue simulator. Must be
    /// called from within a tokio runtime.
    pub fn create(
        config: &AppConfig,
        mut registry: ModelRegistry,
        host: Arc<dyn ChannelHost>,
    ) -> Result<RuntimeHandle> {
        if let Some(dir) = &config.models.directory {
            registry.set_model_dir(dir.clone());
        }

        let model = match &config.models.default_model {
            Some(name) => name.clone(),
            None => registry.get_default_model()?.name.clone(),
        };
        let active = ActiveProfile::new(registry.profile(&model)?);
        let profile = active.effective();
        info!(model = %model, "Initial model selected");

        let defaults: SharedDefaults = Arc::new(RwLock::new(PromptDefaults {
            contexts: config.contexts.clone(),
            deadline: profile.request_deadline(),
        }));

        let supervisor = ProcessSupervisor::new(profile, config.runtime.stop_timeout());
        let client = StreamingCompletionClient::new(
            Arc::new(supervisor.clone()),
            config.runtime.ready_timeout(),
        )?;

        let queue = RequestQueue::new();
        let worker = RequestWorker::new(
            queue.clone(),
            Arc::new(supervisor.clone()),
            Arc::new(client),
            WorkerSettings {
                restart_delay: config.runtime.worker_restart_delay(),
                max_restart_delay: config.runtime.worker_restart_max_delay(),
                max_message_len: config.runtime.max_message_len,
            },
        );

        let simulator = DialogueSimulator::new(
            queue.clone(),
            host.clone(),
            defaults.clone(),
            config.runtime.dialogue_retry_delay(),
            config.runtime.max_message_len,
        );

        Ok(RuntimeHandle {
            inner: Arc::new(RuntimeInner {
                supervisor,
                queue,
                simulator,
                host,
                registry,
                active: RwLock::new(active),
                defaults,
                configured_contexts: config.contexts.clone(),
                worker: Mutex::new(Some(WorkerSupervisor::spawn(worker))),
            }),
        })
    }
}
