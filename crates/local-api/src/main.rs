use anyhow::Result;

mod channels;
mod logs;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use channels::{ChannelRegistry, ChannelView};
use llamarelay_common::{Error as CommonError, ErrorResponse, ServerStatus};
use llamarelay_config::{ConfigLoader, LoggingConfig, ModelRegistry};
use llamarelay_runtime::{ChannelId, ModelRuntime, RuntimeHandle, Speaker};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PROMPT_ACK: &str = "Prompt received and queued for processing!";

#[derive(Clone)]
struct AppState {
    runtime: RuntimeHandle,
    channels: Arc<ChannelRegistry>,
    logging: LoggingConfig,
    start_time: SystemTime,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn api_error(err: CommonError) -> ApiError {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (status, Json(ErrorResponse::from(&err)))
}

#[derive(Debug, Deserialize)]
struct CreateChannelRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    prompt: String,
    #[serde(default)]
    image_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    name1: String,
    context1: String,
    name2: String,
    context2: String,
}

#[derive(Debug, Deserialize)]
struct SettingValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct SelectModelRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    lines: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().unwrap_or_default().as_secs();

    Json(json!({
        "status": "ok",
        "server": state.runtime.state(),
        "queue_len": state.runtime.queue_len(),
        "worker_restarts": state.runtime.worker_restarts(),
        "uptime_seconds": uptime,
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "LlamaRelay Local API",
    }))
}

async fn create_channel(
    State(state): State<AppState>,
    Json(request): Json<CreateChannelRequest>,
) -> ApiResult<Value> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(api_error(CommonError::BadRequest("channel name is empty".into())));
    }
    let id = state.channels.create(name);
    Ok(Json(json!({ "id": id, "name": name })))
}

async fn remove_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state
        .channels
        .remove(&ChannelId::new(id))
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn channel_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ChannelView> {
    state.channels.view(&ChannelId::new(id)).map(Json).map_err(api_error)
}

async fn submit_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PromptRequest>,
) -> ApiResult<Value> {
    let channel_id = ChannelId::new(id);
    if !state.channels.exists(&channel_id) {
        return Err(api_error(CommonError::ChannelNotFound(channel_id.to_string())));
    }

    let images = match request.image_base64.as_deref() {
        Some(encoded) => vec![STANDARD.decode(encoded.trim()).map_err(|e| {
            api_error(CommonError::BadRequest(format!("image is not valid base64: {}", e)))
        })?],
        None => Vec::new(),
    };
    if request.prompt.trim().is_empty() && images.is_empty() {
        return Err(api_error(CommonError::BadRequest("prompt is empty".into())));
    }

    info!(channel = %channel_id, images = images.len(), "Prompt received");
    state
        .runtime
        .submit_prompt(channel_id, &request.prompt, images)
        .await
        .map_err(api_error)?;

    Ok(Json(json!({ "message": PROMPT_ACK })))
}

async fn simulate(
    State(state): State<AppState>,
    Json(request): Json<SimulateRequest>,
) -> ApiResult<Value> {
    if request.name1.trim().is_empty() || request.name2.trim().is_empty() {
        return Err(api_error(CommonError::BadRequest("both speakers need a name".into())));
    }

    let speaker_a = Speaker::new(request.name1.trim(), request.context1);
    let speaker_b = Speaker::new(request.name2.trim(), request.context2);
    let channel_id = state
        .runtime
        .start_dialogue(speaker_a, speaker_b)
        .await
        .map_err(api_error)?;

    Ok(Json(json!({ "channel_id": channel_id })))
}

async fn api_state(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.runtime.state())
}

async fn api_start(State(state): State<AppState>) -> ApiResult<ServerStatus> {
    state.runtime.start().await.map(Json).map_err(api_error)
}

async fn api_stop(State(state): State<AppState>) -> ApiResult<ServerStatus> {
    state.runtime.stop().await.map(Json).map_err(api_error)
}

async fn api_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Value> {
    if query.lines == 0 {
        return Err(api_error(CommonError::BadRequest(
            "number of log lines must be positive".into(),
        )));
    }

    let lines = logs::tail_lines(
        &state.logging.log_dir(),
        &state.logging.file_prefix,
        query.lines,
    )
    .map_err(api_error)?;
    Ok(Json(json!({ "lines": lines })))
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "model": state.runtime.current_model().await,
        "settings": state.runtime.format_settings("\n").await,
    }))
}

async fn update_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<SettingValue>,
) -> ApiResult<Value> {
    let value = state
        .runtime
        .update_setting(&key, &request.value)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "key": key, "value": value })))
}

async fn reset_settings(State(state): State<AppState>) -> Json<Value> {
    state.runtime.reset_settings().await;
    Json(json!({ "settings": state.runtime.format_settings("\n").await }))
}

async fn get_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "models": state.runtime.list_models(),
        "current": state.runtime.current_model().await,
    }))
}

async fn select_model(
    State(state): State<AppState>,
    Json(request): Json<SelectModelRequest>,
) -> ApiResult<Value> {
    let settings = state
        .runtime
        .select_model(&request.name)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "model": request.name, "settings": settings })))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/version", get(version))
        .route("/channels", post(create_channel))
        .route("/channels/{id}", delete(remove_channel))
        .route("/channels/{id}/messages", get(channel_messages))
        .route("/channels/{id}/prompt", post(submit_prompt))
        .route("/simulate", post(simulate))
        .route("/api/state", get(api_state))
        .route("/api/start", post(api_start))
        .route("/api/stop", post(api_stop))
        .route("/api/log", get(api_log))
        .route("/settings", get(get_settings))
        .route("/settings/defaults", post(reset_settings))
        .route("/settings/{key}", put(update_setting))
        .route("/models", get(get_models))
        .route("/model", put(select_model))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var_os("LLAMARELAY_CONFIG").map(PathBuf::from);
    let config = ConfigLoader::load(config_path.as_deref())?;

    // Initialize tracing, to the console and to daily log files
    let log_dir = config.logging.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, &config.logging.file_prefix);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting LlamaRelay local API server");
    info!("Writing logs to {}", log_dir.display());

    // Load model registry
    let registry = match &config.models.registry_file {
        Some(path) => ModelRegistry::load_from_file(path)?,
        None => ModelRegistry::load_defaults()?,
    };

    let channels = Arc::new(ChannelRegistry::new());
    let runtime = ModelRuntime::create(&config, registry, channels.clone())?;

    let state = AppState {
        runtime: runtime.clone(),
        channels,
        logging: config.logging.clone(),
        start_time: SystemTime::now(),
    };

    let app = build_router(state);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await?;
    info!("Server stopped");

    Ok(())
}
