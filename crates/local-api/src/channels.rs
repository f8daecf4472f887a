use async_trait::async_trait;
use llamarelay_common::{Error, Result};
use llamarelay_runtime::{ChannelHost, ChannelId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelMessage {
    pub content: String,
    pub posted_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub id: ChannelId,
    pub name: String,
    pub messages: Vec<ChannelMessage>,
}

#[derive(Debug)]
struct ChannelRecord {
    name: String,
    messages: Vec<ChannelMessage>,
}

/// In-memory channels standing in for a chat platform
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, ChannelRecord>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelRecord>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, name: &str) -> ChannelId {
        let id = ChannelId::new(Uuid::new_v4().to_string());
        self.channels().insert(
            id.clone(),
            ChannelRecord {
                name: name.to_string(),
                messages: Vec::new(),
            },
        );
        info!(channel = %id, %name, "Channel created");
        id
    }

    /// Remove a channel. Any dialogue running in it ends after its
    /// current turn.
    pub fn remove(&self, id: &ChannelId) -> Result<()> {
        match self.channels().remove(id) {
            Some(record) => {
                info!(channel = %id, name = %record.name, "Channel removed");
                Ok(())
            }
            None => Err(Error::ChannelNotFound(id.to_string())),
        }
    }

    pub fn exists(&self, id: &ChannelId) -> bool {
        self.channels().contains_key(id)
    }

    pub fn view(&self, id: &ChannelId) -> Result<ChannelView> {
        let channels = self.channels();
        let record = channels
            .get(id)
            .ok_or_else(|| Error::ChannelNotFound(id.to_string()))?;
        Ok(ChannelView {
            id: id.clone(),
            name: record.name.clone(),
            messages: record.messages.clone(),
        })
    }

    pub fn post(&self, id: &ChannelId, content: &str) -> Result<()> {
        let mut channels = self.channels();
        let record = channels
            .get_mut(id)
            .ok_or_else(|| Error::ChannelNotFound(id.to_string()))?;
        let posted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        record.messages.push(ChannelMessage {
            content: content.to_string(),
            posted_at,
        });
        debug!(channel = %id, "Message posted");
        Ok(())
    }
}

#[async_trait]
impl ChannelHost for ChannelRegistry {
    async fn create_channel(&self, name: &str) -> Result<ChannelId> {
        Ok(self.create(name))
    }

    async fn channel_exists(&self, id: &ChannelId) -> bool {
        self.exists(id)
    }

    async fn send(&self, id: &ChannelId, content: &str) -> Result<()> {
        self.post(id, content)
    }
}
