use async_trait::async_trait;
use llamarelay_common::{CompletionResult, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const EMPTY_ANSWER_NOTICE: &str = "Got an empty response from the model, please try again!";

/// Identifier of a channel on the hosting chat surface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The chat surface answers are delivered to
#[async_trait]
pub trait ChannelHost: Send + Sync {
    /// Create a channel for a simulated conversation
    async fn create_channel(&self, name: &str) -> Result<ChannelId>;

    /// Whether the channel still exists
    async fn channel_exists(&self, id: &ChannelId) -> bool;

    /// Post one message to a channel
    async fn send(&self, id: &ChannelId, content: &str) -> Result<()>;
}

/// Trim and fold line breaks into spaces
pub fn normalize_reply(text: &str) -> String {
    text.trim().replace(['\n', '\r'], " ")
}

/// Text a reply channel receives for a completion result
pub fn reply_text(result: &CompletionResult) -> String {
    if !result.ok {
        return failure_notice(result.failure_reason.as_deref());
    }
    if result.is_empty_answer() {
        return EMPTY_ANSWER_NOTICE.to_string();
    }
    normalize_reply(&result.text)
}

pub fn failure_notice(reason: Option<&str>) -> String {
    format!(
        "Could not get an answer from the model: {}",
        reason.unwrap_or("unknown error")
    )
}

/// Split a message into chunks of at most `limit` characters, breaking on
/// whitespace where one is available.
pub fn split_message(content: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = content.trim();

    while !rest.is_empty() {
        let hard_end = match rest.char_indices().nth(limit) {
            Some((index, _)) => index,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };

        let at_boundary = rest[hard_end..].starts_with(char::is_whitespace);
        let end = if at_boundary {
            hard_end
        } else {
            match rest[..hard_end].rfind(char::is_whitespace) {
                Some(index) if index > 0 => index,
                _ => hard_end,
            }
        };

        chunks.push(rest[..end].trim_end().to_string());
        rest = rest[end..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_short_message() {
        assert_eq!(split_message("hello world", 1950), vec!["hello world"]);
        assert!(split_message("   ", 10).is_empty());
    }

    #[test]
    fn test_split_on_whitespace() {
        let chunks = split_message("alpha beta gamma delta", 11);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 11));
    }

    #[test]
    fn test_split_exact_boundary() {
        assert_eq!(split_message("abcde fghij", 5), vec!["abcde", "fghij"]);
    }

    #[test]
    fn test_split_without_whitespace() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "xxxxx");
    }

    #[test]
    fn test_split_multibyte() {
        let text = "héllo wörld ünïcode";
        let chunks = split_message(text, 7);
        assert_eq!(chunks.join(" "), text);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 7));
    }

    #[test]
    fn test_channel_id_serializes_as_string() {
        let id = ChannelId::new("chan-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"chan-1\"");
        let parsed: ChannelId = serde_json::from_str("\"chan-1\"").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(
            reply_text(&CompletionResult::success(" line one\nline two ")),
            "line one line two"
        );
        assert_eq!(reply_text(&CompletionResult::success("")), EMPTY_ANSWER_NOTICE);
        assert_eq!(reply_text(&CompletionResult::success(" \r\n ")), EMPTY_ANSWER_NOTICE);
        assert_eq!(
            reply_text(&CompletionResult::failure("HTTP status 500")),
            "Could not get an answer from the model: HTTP status 500"
        );
    }
}
