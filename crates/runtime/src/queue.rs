use crate::channel::{reply_text, split_message, ChannelHost, ChannelId};
use crate::dialogue::DialogueTurn;
use crate::{CompletionBackend, InferenceServer};
use async_trait::async_trait;
use futures::FutureExt;
use llamarelay_common::{CompletionRequest, CompletionResult, Error, Result};
use llamarelay_config::ContextSettings;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Marker the multimodal server expects for the attached image
pub const IMAGE_TAG: &str = "[img-10]";

/// Where a finished completion goes
pub enum ReplySink {
    /// Post the answer to a channel on the chat surface
    Channel {
        host: Arc<dyn ChannelHost>,
        channel_id: ChannelId,
    },
    /// Hand the raw result back to an awaiting caller
    Oneshot(oneshot::Sender<CompletionResult>),
}

impl ReplySink {
    /// Deliver a result. Delivery problems are logged, never propagated.
    pub async fn deliver(self, result: CompletionResult, max_len: usize) {
        match self {
            ReplySink::Channel { host, channel_id } => {
                let text = reply_text(&result);
                for chunk in split_message(&text, max_len) {
                    if let Err(e) = host.send(&channel_id, &chunk).await {
                        warn!(channel = %channel_id, "Failed to deliver reply: {}", e);
                        break;
                    }
                }
            }
            ReplySink::Oneshot(sender) => {
                if sender.send(result).is_err() {
                    debug!("Reply receiver dropped before delivery");
                }
            }
        }
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplySink::Channel { channel_id, .. } => {
                f.debug_struct("Channel").field("channel_id", channel_id).finish()
            }
            ReplySink::Oneshot(_) => f.write_str("Oneshot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PlainPrompt,
    ImagePrompt,
    DialogueTurn,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobKind::PlainPrompt => "prompt",
            JobKind::ImagePrompt => "image prompt",
            JobKind::DialogueTurn => "dialogue turn",
        };
        f.write_str(label)
    }
}

/// One unit of work for the request worker
#[derive(Debug)]
pub enum QueuedJob {
    PlainPrompt {
        request: CompletionRequest,
        reply: ReplySink,
    },
    ImagePrompt {
        request: CompletionRequest,
        reply: ReplySink,
    },
    DialogueTurn {
        request: CompletionRequest,
        turn: DialogueTurn,
    },
}

impl QueuedJob {
    /// Build a user prompt job. Only the first image is attached; an image
    /// prompt uses the multimodal context and carries the image tag.
    pub fn prompt(
        defaults: &PromptDefaults,
        prompt: &str,
        images: Vec<Vec<u8>>,
        reply: ReplySink,
    ) -> Self {
        match images.into_iter().next() {
            Some(image) => {
                let prompt = if prompt.contains(IMAGE_TAG) {
                    prompt.to_string()
                } else {
                    format!("{} {}", prompt, IMAGE_TAG).trim_start().to_string()
                };
                let request = CompletionRequest::new(prompt)
                    .with_context(defaults.contexts.multimodal_context.clone())
                    .with_image(image)
                    .with_deadline(defaults.deadline);
                QueuedJob::ImagePrompt { request, reply }
            }
            None => {
                let request = CompletionRequest::new(prompt)
                    .with_context(defaults.contexts.main_context.clone())
                    .with_deadline(defaults.deadline);
                QueuedJob::PlainPrompt { request, reply }
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            QueuedJob::PlainPrompt { .. } => JobKind::PlainPrompt,
            QueuedJob::ImagePrompt { .. } => JobKind::ImagePrompt,
            QueuedJob::DialogueTurn { .. } => JobKind::DialogueTurn,
        }
    }

    pub fn request(&self) -> &CompletionRequest {
        match self {
            QueuedJob::PlainPrompt { request, .. }
            | QueuedJob::ImagePrompt { request, .. }
            | QueuedJob::DialogueTurn { request, .. } => request,
        }
    }
}

/// Contexts and deadline new requests are built with
#[derive(Debug, Clone)]
pub struct PromptDefaults {
    pub contexts: ContextSettings,
    pub deadline: Duration,
}

pub type SharedDefaults = Arc<RwLock<PromptDefaults>>;

struct Inbox {
    sender: mpsc::UnboundedSender<QueuedJob>,
    receiver: Option<mpsc::UnboundedReceiver<QueuedJob>>,
    pending: Arc<AtomicUsize>,
}

impl Inbox {
    fn fresh() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct QueueShared {
    inbox: Mutex<Inbox>,
    closed: AtomicBool,
    restarts: AtomicU64,
    completed: AtomicU64,
}

/// Single ordered channel of completion jobs, consumed by one worker.
///
/// The channel behind the queue is owned here rather than by the worker,
/// so a crashed worker can be replaced together with everything it left
/// queued.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<QueueShared>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                inbox: Mutex::new(Inbox::fresh()),
                closed: AtomicBool::new(false),
                restarts: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.shared.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job to the tail. Never waits.
    pub fn enqueue(&self, job: QueuedJob) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::QueueClosed);
        }

        let kind = job.kind();
        let inbox = self.inbox();
        inbox.pending.fetch_add(1, Ordering::AcqRel);
        if inbox.sender.send(job).is_err() {
            inbox.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(%kind, "Request worker is restarting, job rejected");
            return Err(Error::QueueClosed);
        }

        debug!(%kind, pending = inbox.pending.load(Ordering::Acquire), "Job queued");
        Ok(())
    }

    /// Jobs waiting for the worker
    pub fn len(&self) -> usize {
        self.inbox().pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the worker has been restarted after a crash
    pub fn restart_count(&self) -> u64 {
        self.shared.restarts.load(Ordering::Acquire)
    }

    /// Jobs whose result reached its sink
    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Stop accepting jobs
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn take_receiver(&self) -> Option<(mpsc::UnboundedReceiver<QueuedJob>, Arc<AtomicUsize>)> {
        let mut inbox = self.inbox();
        let pending = inbox.pending.clone();
        inbox.receiver.take().map(|receiver| (receiver, pending))
    }

    /// Swap in a fresh empty channel. Returns how many jobs were dropped.
    fn reset(&self) -> usize {
        let mut inbox = self.inbox();
        let old = std::mem::replace(&mut *inbox, Inbox::fresh());
        drop(inbox);
        // Dropping the old inbox drops its queued jobs and their sinks
        old.pending.load(Ordering::Acquire)
    }
}

/// Restart policy and delivery limits of the request worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub max_message_len: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(30),
            max_message_len: 1950,
        }
    }
}

/// Delay before the `attempt`-th consecutive restart
pub fn restart_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// The single consumer of the request queue
#[derive(Clone)]
pub struct RequestWorker {
    queue: RequestQueue,
    server: Arc<dyn InferenceServer>,
    backend: Arc<dyn CompletionBackend>,
    settings: WorkerSettings,
}

impl RequestWorker {
    pub fn new(
        queue: RequestQueue,
        server: Arc<dyn InferenceServer>,
        backend: Arc<dyn CompletionBackend>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            server,
            backend,
            settings,
        }
    }

    async fn run(&self) -> Result<()> {
        let (mut receiver, pending) = self
            .queue
            .take_receiver()
            .ok_or_else(|| Error::WorkerCrash("queue receiver already taken".into()))?;

        info!("Request worker started");
        while let Some(job) = receiver.recv().await {
            pending.fetch_sub(1, Ordering::AcqRel);
            self.process(job).await?;
            self.queue.shared.completed.fetch_add(1, Ordering::AcqRel);
        }

        Err(Error::QueueClosed)
    }

    async fn process(&self, job: QueuedJob) -> Result<()> {
        let kind = job.kind();
        info!(%kind, remaining = self.queue.len(), "Processing job");

        match job {
            QueuedJob::PlainPrompt { request, reply } | QueuedJob::ImagePrompt { request, reply } => {
                let result = self.complete(&request).await;
                reply.deliver(result, self.settings.max_message_len).await;
            }
            QueuedJob::DialogueTurn { request, turn } => {
                let result = self.complete(&request).await;
                turn.deliver(result, &request, self).await?;
            }
        }
        Ok(())
    }

    async fn ensure_started(&self) -> Result<()> {
        if !self.server.state().is_active() {
            info!("Inference server is not running, starting it");
            self.server.start().await?;
        }
        Ok(())
    }
}

/// Completion with a lazy server start in front of it
#[async_trait]
impl CompletionBackend for RequestWorker {
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        if let Err(e) = self.ensure_started().await {
            error!("Could not start the inference server: {}", e);
            return CompletionResult::failure(e.to_string());
        }
        self.backend.complete(request).await
    }
}

/// Runs the request worker and restarts it whenever it crashes
pub struct WorkerSupervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerSupervisor {
    pub fn spawn(worker: RequestWorker) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            supervise(worker, token).await;
        });
        Self { cancel, handle }
    }

    /// Close the queue and stop the worker
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Worker supervisor ended abnormally: {}", e);
        }
    }
}

async fn supervise(worker: RequestWorker, cancel: CancellationToken) {
    let mut consecutive = 0u32;

    loop {
        let completed_before = worker.queue.completed_count();
        let run = AssertUnwindSafe(worker.run()).catch_unwind();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                worker.queue.close();
                info!("Request worker stopped");
                return;
            }
            outcome = run => outcome,
        };

        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(Error::QueueClosed)) if worker.queue.is_closed() => {
                info!("Request queue closed, worker exiting");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let dropped = worker.queue.reset();
        let restarts = worker.queue.shared.restarts.fetch_add(1, Ordering::AcqRel) + 1;
        error!(dropped, restarts, "{}", Error::WorkerCrash(reason));

        if worker.queue.completed_count() > completed_before {
            consecutive = 0;
        }
        consecutive += 1;

        let delay = restart_backoff(
            worker.settings.restart_delay,
            worker.settings.max_restart_delay,
            consecutive,
        );
        info!(?delay, "Restarting request worker");

        tokio::select! {
            _ = cancel.cancelled() => {
                worker.queue.close();
                info!("Request worker stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
