use crate::{CompletionBackend, InferenceServer};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use llamarelay_common::{
    truncate_log, CompletionRequest, CompletionResult, Error, Result, SamplingParams,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_STREAM: &str = "text/event-stream";
const IMAGE_SLOT: u32 = 10;

/// Body of a `/completion` request
#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    #[serde(flatten)]
    sampling: &'a SamplingParams,
    image_data: Vec<ImageData>,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct ImageData {
    data: String,
    id: u32,
}

/// One streamed event from the server
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

/// Sends completion requests to the running inference server and gathers
/// the streamed answer into a single text.
pub struct StreamingCompletionClient {
    server: Arc<dyn InferenceServer>,
    client: Client,
    ready_timeout: Duration,
}

impl StreamingCompletionClient {
    pub fn new(server: Arc<dyn InferenceServer>, ready_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            server,
            client,
            ready_timeout,
        })
    }

    /// Run one completion against a server at `base_url`. Every failure is
    /// folded into the returned result.
    pub async fn complete_at(&self, request: &CompletionRequest, base_url: &str) -> CompletionResult {
        match self.stream_completion(request, base_url).await {
            Ok(text) => {
                info!("Model answer: {}", truncate_log(&text));
                CompletionResult::success(text)
            }
            Err(e) => {
                warn!("Completion failed: {}", e);
                CompletionResult::failure(e.to_string())
            }
        }
    }

    async fn stream_completion(&self, request: &CompletionRequest, base_url: &str) -> Result<String> {
        let payload = build_payload(request);
        debug!("Prompt: {}", truncate_log(&payload.prompt));

        let url = format!("{}/completion", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header(ACCEPT, EVENT_STREAM)
            .json(&payload)
            .timeout(request.deadline)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!("HTTP status {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        if !essence.eq_ignore_ascii_case(EVENT_STREAM) {
            return Err(Error::Transport(format!(
                "Expected an event stream, got content type '{}'",
                content_type
            )));
        }

        read_event_stream(response).await
    }
}

fn build_payload(request: &CompletionRequest) -> CompletionPayload<'_> {
    let image_data = request
        .image_payload
        .as_ref()
        .map(|image| ImageData {
            data: STANDARD.encode(image),
            id: IMAGE_SLOT,
        })
        .into_iter()
        .collect();

    CompletionPayload {
        sampling: &request.sampling,
        image_data,
        prompt: request.prompt_text(),
    }
}

/// Concatenate the content of every event in arrival order. Malformed
/// events are skipped; a broken stream keeps what arrived before the break.
async fn read_event_stream(response: reqwest::Response) -> Result<String> {
    let mut stream = response.bytes_stream().eventsource();
    let mut text = String::new();
    let mut received = 0usize;

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) if received == 0 => {
                return Err(Error::Transport(format!("Stream error: {}", e)));
            }
            Err(e) => {
                warn!("Stream ended early after {} events: {}", received, e);
                break;
            }
        };
        received += 1;

        if event.data.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<StreamChunk>(&event.data) {
            Ok(chunk) => {
                text.push_str(&chunk.content);
                if chunk.stop {
                    debug!("Generation complete after {} events", received);
                    break;
                }
            }
            Err(e) => {
                let error = Error::MalformedEvent(e.to_string());
                warn!("Skipping event: {} ({})", error, truncate_log(&event.data));
            }
        }
    }

    Ok(text)
}

#[async_trait]
impl CompletionBackend for StreamingCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        match self.server.wait_until_ready(self.ready_timeout).await {
            Ok(address) => self.complete_at(request, &address).await,
            Err(e) => {
                warn!("Inference server unavailable: {}", e);
                CompletionResult::failure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamarelay_common::{ProcessState, ServerStatus};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A server that is always running at a fixed address, or never ready
    struct FixedServer {
        address: Option<String>,
    }

    #[async_trait]
    impl InferenceServer for FixedServer {
        fn state(&self) -> ServerStatus {
            match &self.address {
                Some(address) => ServerStatus {
                    state: ProcessState::Running,
                    address: Some(address.clone()),
                    run_id: 1,
                },
                None => ServerStatus::stopped(),
            }
        }

        async fn start(&self) -> Result<ServerStatus> {
            Ok(self.state())
        }

        async fn stop(&self) -> Result<ServerStatus> {
            Ok(self.state())
        }

        async fn wait_until_ready(&self, _limit: Duration) -> Result<String> {
            self.address.clone().ok_or(Error::NotReady)
        }
    }

    fn client_for(address: Option<String>) -> StreamingCompletionClient {
        StreamingCompletionClient::new(
            Arc::new(FixedServer { address }),
            Duration::from_millis(100),
        )
        .unwrap()
    }

    fn sse(events: &[&str]) -> String {
        events
            .iter()
            .map(|data| format!("data: {}\n\n", data))
            .collect()
    }

    async fn mount_stream(server: &MockServer, body: String) {
        Mock::given(method("POST"))
            .and(path("/completion"))
            .and(header("accept", "text/event-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_concatenates_stream_and_skips_malformed() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            sse(&[
                r#"{"content":"Hel","stop":false}"#,
                "{not json",
                r#"{"content":"lo","stop":false}"#,
                r#"{"content":"","stop":true}"#,
            ]),
        )
        .await;

        let client = client_for(Some(server.uri()));
        let result = client.complete(&CompletionRequest::new("Say hello")).await;

        assert!(result.ok);
        assert_eq!(result.text, "Hello");
    }

    #[tokio::test]
    async fn test_error_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(Some(server.uri()));
        let result = client.complete(&CompletionRequest::new("hi")).await;

        assert!(!result.ok);
        assert!(result.failure_reason.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_stream_without_content_is_empty_success() {
        let server = MockServer::start().await;
        mount_stream(&server, sse(&[r#"{"content":"","stop":true}"#])).await;

        let client = client_for(Some(server.uri()));
        let result = client.complete(&CompletionRequest::new("hi")).await;

        assert!(result.ok);
        assert_eq!(result.text, "");
        assert!(result.is_empty_answer());
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"content": "hi"})))
            .mount(&server)
            .await;

        let client = client_for(Some(server.uri()));
        let result = client.complete(&CompletionRequest::new("hi")).await;

        assert!(!result.ok);
        assert!(result.failure_reason.unwrap().contains("content type"));
    }

    #[tokio::test]
    async fn test_request_body_carries_prompt_and_image() {
        let server = MockServer::start().await;
        mount_stream(&server, sse(&[r#"{"content":"a cat","stop":true}"#])).await;

        let client = client_for(Some(server.uri()));
        let request = CompletionRequest::new("What is this? [img-10]")
            .with_context("Describe images.")
            .with_image(vec![1, 2, 3]);
        let result = client.complete(&request).await;
        assert_eq!(result.text, "a cat");

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);

        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["prompt"], "Describe images.\nWhat is this? [img-10]");
        assert_eq!(body["stream"], true);
        assert_eq!(body["n_predict"], 400);
        assert_eq!(body["slot_id"], -1);
        assert_eq!(body["image_data"][0]["id"], 10);
        assert_eq!(body["image_data"][0]["data"], STANDARD.encode([1u8, 2, 3]));
    }

    #[tokio::test]
    async fn test_plain_request_has_no_images() {
        let server = MockServer::start().await;
        mount_stream(&server, sse(&[r#"{"content":"ok","stop":true}"#])).await;

        let client = client_for(Some(server.uri()));
        client.complete(&CompletionRequest::new("hi")).await;

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["image_data"], serde_json::json!([]));
        assert_eq!(body["prompt"], "hi");
    }

    #[tokio::test]
    async fn test_not_ready_is_failure() {
        let client = client_for(None);
        let result = client.complete(&CompletionRequest::new("hi")).await;

        assert!(!result.ok);
        assert_eq!(
            result.failure_reason.as_deref(),
            Some(Error::NotReady.to_string().as_str())
        );
    }
}
