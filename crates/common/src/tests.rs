#[cfg(test)]
mod tests {
    use crate::dto::*;
    use crate::error::{Error, ErrorResponse};

    #[test]
    fn test_prompt_text_with_all_parts() {
        let request = CompletionRequest::new("What now?")
            .with_context("Be brief.")
            .with_history(vec![
                Message::new(Role::User, "Hello"),
                Message::new(Role::Assistant, "Hi"),
            ]);

        assert_eq!(
            request.prompt_text(),
            "user: Hello\nassistant: Hi\nBe brief.\nWhat now?"
        );
    }

    #[test]
    fn test_prompt_text_omits_absent_parts() {
        let request = CompletionRequest::new("Just the prompt");
        assert_eq!(request.prompt_text(), "Just the prompt");

        let request = CompletionRequest::new("Prompt").with_context("");
        assert_eq!(request.prompt_text(), "Prompt");

        let request = CompletionRequest::new("Prompt")
            .with_history(vec![Message::new(Role::User, "earlier")]);
        assert_eq!(request.prompt_text(), "user: earlier\nPrompt");
    }

    #[test]
    fn test_sampling_defaults() {
        let params = SamplingParams::default();
        assert!(params.stream);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.top_p, 0.95);
        assert_eq!(params.repeat_penalty, 1.18);
        assert!(params.stop.contains(&"User:".to_string()));
        assert!(params.stop.contains(&"Llama:".to_string()));
    }

    #[test]
    fn test_completion_result_kinds() {
        let ok = CompletionResult::success("text");
        assert!(ok.ok);
        assert!(!ok.is_empty_answer());

        let empty = CompletionResult::success("  ");
        assert!(empty.is_empty_answer());

        let failed = CompletionResult::failure("HTTP status 500");
        assert!(!failed.ok);
        assert!(!failed.is_empty_answer());
        assert_eq!(failed.failure_reason.as_deref(), Some("HTTP status 500"));
    }

    #[test]
    fn test_server_status() {
        let status = ServerStatus::stopped();
        assert_eq!(status.state, ProcessState::Stopped);
        assert!(!status.is_active());

        let running = ServerStatus {
            state: ProcessState::Running,
            address: Some("http://127.0.0.1:8000".into()),
            run_id: 1,
        };
        assert!(running.is_active());
        assert_eq!(ProcessState::Starting.to_string(), "starting");
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
    }

    #[test]
    fn test_truncate_log() {
        assert_eq!(truncate_log("short"), "short");

        let long = "x".repeat(1500);
        let truncated = truncate_log(&long);
        assert!(truncated.ends_with("... [truncated]"));
        assert_eq!(truncated.len(), 1000 + "... [truncated]".len());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::BadRequest("test".into()).status_code(), 400);
        assert_eq!(Error::UnknownSetting("foo".into()).status_code(), 400);
        assert_eq!(Error::ModelNotFound("test".into()).status_code(), 404);
        assert_eq!(Error::NotReady.status_code(), 503);
        assert_eq!(Error::Transport("boom".into()).status_code(), 502);
        assert_eq!(Error::SpawnFailure("missing".into()).status_code(), 500);
    }

    #[test]
    fn test_error_response() {
        let err = Error::InvalidSetting {
            key: "port".into(),
            reason: "expected an integer".into(),
        };
        let response = ErrorResponse::from(&err);
        assert_eq!(response.error.code, 400);
        assert_eq!(response.error.r#type, "invalid_setting");
        assert!(response.error.message.contains("port"));
    }
}
