use crate::channel::{failure_notice, normalize_reply, split_message, ChannelHost, ChannelId};
use crate::queue::{QueuedJob, RequestQueue, SharedDefaults};
use crate::CompletionBackend;
use llamarelay_common::{truncate_log, CompletionRequest, CompletionResult, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One participant of a simulated conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Speaker {
    pub name: String,
    pub persona: String,
}

impl Speaker {
    pub fn new(name: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persona: persona.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialoguePhase {
    AwaitingOpening,
    AwaitingReply,
    Closed,
}

/// State of one two-party conversation. At most one turn is outstanding.
#[derive(Debug, Clone, Serialize)]
pub struct DialogueSession {
    pub channel_id: ChannelId,
    pub speaker_a: Speaker,
    pub speaker_b: Speaker,
    /// Whether `speaker_a` answers the outstanding turn
    pub a_active: bool,
    pub last_utterance: Option<String>,
    pub phase: DialoguePhase,
    pub turns: u64,
}

impl DialogueSession {
    fn new(channel_id: ChannelId, speaker_a: Speaker, speaker_b: Speaker) -> Self {
        Self {
            channel_id,
            speaker_a,
            speaker_b,
            a_active: true,
            last_utterance: None,
            phase: DialoguePhase::AwaitingOpening,
            turns: 0,
        }
    }

    pub fn active_speaker(&self) -> &Speaker {
        if self.a_active {
            &self.speaker_a
        } else {
            &self.speaker_b
        }
    }

    fn swap_speaker(&mut self) {
        self.a_active = !self.a_active;
    }
}

/// Sink of a dialogue job: feeds the result back into its session.
///
/// A turn dropped before its result is handled (worker crash, queue reset)
/// closes its session.
pub struct DialogueTurn {
    simulator: DialogueSimulator,
    session: Arc<Mutex<DialogueSession>>,
    delivered: bool,
}

impl DialogueTurn {
    pub async fn deliver(
        mut self,
        result: CompletionResult,
        request: &CompletionRequest,
        backend: &dyn CompletionBackend,
    ) -> Result<()> {
        let outcome = self
            .simulator
            .handle_turn_result(&self.session, result, request, backend)
            .await;
        self.delivered = true;
        outcome
    }
}

impl Drop for DialogueTurn {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        let simulator = self.simulator.clone();
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { simulator.abandon(&session).await });
            }
            Err(_) => debug!("No runtime left to close an abandoned dialogue turn"),
        }
    }
}

impl fmt::Debug for DialogueTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogueTurn").finish_non_exhaustive()
    }
}

/// Trim, fold line breaks and drop a leading `Name:` label of the speaker
pub fn clean_utterance(raw: &str, name: &str) -> String {
    let text = normalize_reply(raw);
    let label: String = text.chars().take(name.chars().count()).collect();

    if !name.is_empty() && label.to_lowercase() == name.to_lowercase() {
        if let Some(rest) = text[label.len()..].strip_prefix(':') {
            return rest.trim().to_string();
        }
    }
    text
}

struct SimulatorInner {
    queue: RequestQueue,
    host: Arc<dyn ChannelHost>,
    defaults: SharedDefaults,
    retry_delay: Duration,
    max_message_len: usize,
    sessions: RwLock<HashMap<ChannelId, Arc<Mutex<DialogueSession>>>>,
}

/// Sequences two-party conversations on top of the request queue
#[derive(Clone)]
pub struct DialogueSimulator {
    inner: Arc<SimulatorInner>,
}

impl DialogueSimulator {
    pub fn new(
        queue: RequestQueue,
        host: Arc<dyn ChannelHost>,
        defaults: SharedDefaults,
        retry_delay: Duration,
        max_message_len: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SimulatorInner {
                queue,
                host,
                defaults,
                retry_delay,
                max_message_len,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a conversation channel and start the dialogue in it
    pub async fn start_dialogue(&self, speaker_a: Speaker, speaker_b: Speaker) -> Result<ChannelId> {
        let name = format!("{}-{}-conversation", speaker_a.name, speaker_b.name);
        let channel_id = self.inner.host.create_channel(&name).await?;
        self.start_in_channel(channel_id.clone(), speaker_a, speaker_b).await?;
        Ok(channel_id)
    }

    /// Start a dialogue in an existing channel. A session already running
    /// there is closed first.
    pub async fn start_in_channel(
        &self,
        channel_id: ChannelId,
        speaker_a: Speaker,
        speaker_b: Speaker,
    ) -> Result<()> {
        let opening = format!(
            "{} You are {}. Start the conversation.",
            speaker_a.persona, speaker_a.name
        );
        info!(channel = %channel_id, a = %speaker_a.name, b = %speaker_b.name, "Starting dialogue");

        let session = Arc::new(Mutex::new(DialogueSession::new(
            channel_id.clone(),
            speaker_a,
            speaker_b,
        )));

        let previous = self
            .inner
            .sessions
            .write()
            .await
            .insert(channel_id.clone(), session.clone());
        if let Some(previous) = previous {
            previous.lock().await.phase = DialoguePhase::Closed;
            debug!(channel = %channel_id, "Replaced an existing dialogue");
        }

        let mut state = session.lock().await;
        state.phase = DialoguePhase::AwaitingReply;
        if let Err(e) = self.enqueue_turn(&session, opening).await {
            state.phase = DialoguePhase::Closed;
            drop(state);
            self.forget(&channel_id, &session).await;
            return Err(e);
        }
        Ok(())
    }

    async fn enqueue_turn(&self, session: &Arc<Mutex<DialogueSession>>, prompt: String) -> Result<()> {
        let defaults = self.inner.defaults.read().await.clone();
        let request = CompletionRequest::new(prompt)
            .with_context(defaults.contexts.main_context)
            .with_deadline(defaults.deadline);

        self.inner.queue.enqueue(QueuedJob::DialogueTurn {
            request,
            turn: DialogueTurn {
                simulator: self.clone(),
                session: session.clone(),
                delivered: false,
            },
        })
    }

    /// Close a session whose outstanding turn was lost
    async fn abandon(&self, session: &Arc<Mutex<DialogueSession>>) {
        let mut state = session.lock().await;
        if state.phase == DialoguePhase::Closed {
            return;
        }
        let channel_id = state.channel_id.clone();
        warn!(channel = %channel_id, turns = state.turns, "Dialogue turn was dropped, closing the session");
        state.phase = DialoguePhase::Closed;
        drop(state);
        self.forget(&channel_id, session).await;
    }

    async fn handle_turn_result(
        &self,
        session: &Arc<Mutex<DialogueSession>>,
        result: CompletionResult,
        request: &CompletionRequest,
        backend: &dyn CompletionBackend,
    ) -> Result<()> {
        let mut state = session.lock().await;
        let channel_id = state.channel_id.clone();
        if state.phase == DialoguePhase::Closed {
            debug!(channel = %channel_id, "Dropping result for a closed dialogue");
            return Ok(());
        }

        let speaker = state.active_speaker().clone();
        let mut result = result;
        if result.ok && clean_utterance(&result.text, &speaker.name).is_empty() {
            info!(channel = %channel_id, "Empty dialogue answer, retrying once");
            tokio::time::sleep(self.inner.retry_delay).await;
            result = backend.complete(request).await;
        }

        if !result.ok {
            warn!(channel = %channel_id, "Dialogue turn failed, closing the session");
            self.post(&channel_id, &failure_notice(result.failure_reason.as_deref()))
                .await;
            state.phase = DialoguePhase::Closed;
            drop(state);
            self.forget(&channel_id, session).await;
            return Ok(());
        }

        let utterance = clean_utterance(&result.text, &speaker.name);
        if utterance.is_empty() {
            warn!(channel = %channel_id, "Dialogue answer still empty after retry");
        }

        state.last_utterance = Some(utterance.clone());
        state.turns += 1;
        debug!(channel = %channel_id, turn = state.turns, "{}: {}", speaker.name, truncate_log(&utterance));
        self.post(&channel_id, &format!("{}: {}", speaker.name, utterance))
            .await;

        if !self.inner.host.channel_exists(&channel_id).await {
            info!(channel = %channel_id, turns = state.turns, "Channel removed, ending dialogue");
            state.phase = DialoguePhase::Closed;
            drop(state);
            self.forget(&channel_id, session).await;
            return Ok(());
        }

        state.swap_speaker();
        let next = format!("{} {}", state.active_speaker().persona, utterance);
        if let Err(e) = self.enqueue_turn(session, next).await {
            state.phase = DialoguePhase::Closed;
            drop(state);
            self.forget(&channel_id, session).await;
            return Err(e);
        }
        Ok(())
    }

    async fn post(&self, channel_id: &ChannelId, content: &str) {
        for chunk in split_message(content, self.inner.max_message_len) {
            if let Err(e) = self.inner.host.send(channel_id, &chunk).await {
                warn!(channel = %channel_id, "Failed to post dialogue message: {}", e);
                return;
            }
        }
    }

    /// Remove a session from the registry unless it was already replaced
    async fn forget(&self, channel_id: &ChannelId, session: &Arc<Mutex<DialogueSession>>) {
        let mut sessions = self.inner.sessions.write().await;
        if sessions
            .get(channel_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(channel_id);
        }
    }

    /// Snapshot of the live session in a channel
    pub async fn session(&self, channel_id: &ChannelId) -> Option<DialogueSession> {
        let session = self.inner.sessions.read().await.get(channel_id).cloned()?;
        let snapshot = session.lock().await.clone();
        Some(snapshot)
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_utterance() {
        assert_eq!(clean_utterance("Hi there!", "Ann"), "Hi there!");
        assert_eq!(clean_utterance("  ann: Hi\nthere! ", "Ann"), "Hi there!");
        assert_eq!(clean_utterance("ANN: Hello", "Ann"), "Hello");
        // Only an exact `Name:` label counts
        assert_eq!(clean_utterance("Ann : Hello", "Ann"), "Ann : Hello");
        // Only the answering speaker's label is stripped
        assert_eq!(clean_utterance("Bob: Hello", "Ann"), "Bob: Hello");
        assert_eq!(clean_utterance("Annabel: Hello", "Ann"), "Annabel: Hello");
        assert_eq!(clean_utterance("Zoë: ça va", "zoë"), "ça va");
    }
}
