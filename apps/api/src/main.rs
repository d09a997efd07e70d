use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _, UpDownCounter};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::MeterProvider as SdkMeterProvider;
use opentelemetry_sdk::Resource;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use studio::adapter::{SandboxAdapter, SandboxInfo, SandboxSettings, UploadSummary};
use studio::agent::{AiProvider, LlmAgent, LlmAgentConfig};
use studio::errors::StudioError;
use studio::local::{LocalSandbox, LocalSandboxConfig};
use studio::registry::SandboxRegistry;
use studio::remote::{RemoteSandbox, RemoteSandboxConfig};
use studio::sandbox::SandboxService;
use studio::turn::{TurnLimits, TurnRequest, TurnResponse, TurnRunner};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{dispatcher, error, info, warn};
use tracing_subscriber::prelude::*;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LOG_LINES: usize = 50;

struct AppMetrics {
    registry: Registry,
    _provider: SdkMeterProvider,
    request_counter: Counter<u64>,
    request_duration: Histogram<f64>,
    tool_counter: Counter<u64>,
    verdict_counter: Counter<u64>,
    active_turns: UpDownCounter<i64>,
}

impl AppMetrics {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("studio.api");
        let request_counter = meter
            .u64_counter("api_requests_total")
            .with_description("Total HTTP requests handled by route and status")
            .init();
        let request_duration = meter
            .f64_histogram("api_request_duration_seconds")
            .with_description("Latency of request handling in seconds")
            .init();
        let tool_counter = meter
            .u64_counter("tool_invocations_total")
            .with_description("Agent tool invocations by tool and status")
            .init();
        let verdict_counter = meter
            .u64_counter("environment_verdicts_total")
            .with_description("Environment classifications by kind")
            .init();
        let active_turns = meter
            .i64_up_down_counter("active_turns")
            .with_description("Conversation turns currently running")
            .init();
        Ok(Self {
            registry,
            _provider: provider,
            request_counter,
            request_duration,
            tool_counter,
            verdict_counter,
            active_turns,
        })
    }

    fn turn_started(&self) {
        self.active_turns.add(1, &[]);
    }

    fn turn_finished(&self) {
        self.active_turns.add(-1, &[]);
    }

    fn record_request(&self, route: &'static str, status: &'static str, duration: Duration) {
        let attributes = [
            KeyValue::new("route", route),
            KeyValue::new("status", status),
        ];
        self.request_counter.add(1, &attributes);
        self.request_duration
            .record(duration.as_secs_f64(), &attributes);
    }

    fn record_turn(&self, response: &TurnResponse) {
        self.verdict_counter
            .add(1, &[KeyValue::new("kind", response.environment.clone())]);
        for record in &response.tool_calls {
            self.tool_counter.add(
                1,
                &[
                    KeyValue::new("tool", record.tool_name.clone()),
                    KeyValue::new("status", record.status.as_str()),
                ],
            );
        }
    }

    fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct AppState {
    runner: Arc<TurnRunner>,
    sandbox: Option<SandboxAdapter>,
    metrics: Arc<AppMetrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let metrics = Arc::new(AppMetrics::new()?);
    let bind_addr = resolve_bind_address()?;
    let sandbox = build_sandbox()?;
    let runner = build_runner(sandbox.clone())?;

    if let Some(adapter) = sandbox.clone() {
        tokio::spawn(evict_idle_sandboxes(adapter));
    }

    let state = AppState {
        runner: Arc::new(runner),
        sandbox,
        metrics,
    };
    let app = build_router(state);

    info!(%bind_addr, "server starting");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/unified-chat", post(unified_chat))
        .route("/api/sandbox/create", post(create_sandbox))
        .route("/api/sandbox/upload", post(upload_to_sandbox))
        .route("/api/sandbox/:project_id/start", post(start_dev_server))
        .route("/api/sandbox/:project_id", get(sandbox_info))
        .route("/api/sandbox/:project_id/logs", get(sandbox_logs))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    let otlp_endpoint = non_empty_env("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT")
        .or_else(|| non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT"));
    match otlp_endpoint {
        Some(endpoint) => registry
            .with(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?))
            .try_init()?,
        None => registry.try_init()?,
    }
    Ok(())
}

fn service_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", "studio-api"),
        KeyValue::new("service.namespace", "studio"),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ])
}

fn otlp_tracer(endpoint: String) -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(service_resource()))
        .with_exporter(exporter)
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;
    Ok(tracer)
}

fn resolve_bind_address() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    Ok(raw.parse()?)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_env(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw}")),
        None => Ok(default),
    }
}

fn resolve_turn_limits() -> anyhow::Result<TurnLimits> {
    let defaults = TurnLimits::default();
    Ok(defaults
        .with_max_files(env_or("STUDIO_MAX_FILES", defaults.max_files)?)
        .with_max_file_bytes(env_or("STUDIO_MAX_FILE_BYTES", defaults.max_file_bytes)?)
        .with_max_message_chars(env_or(
            "STUDIO_MAX_MESSAGE_CHARS",
            defaults.max_message_chars,
        )?))
}

fn build_runner(sandbox: Option<SandboxAdapter>) -> anyhow::Result<TurnRunner> {
    let provider_name = non_empty_env("AI_PROVIDER").unwrap_or_else(|| "openai".to_string());
    let Some(provider) = AiProvider::parse(&provider_name) else {
        bail!("unsupported AI_PROVIDER {provider_name}, expected openai or gemini");
    };

    let api_key = non_empty_env(provider.api_key_var()).unwrap_or_default();
    let mut config = LlmAgentConfig::new(provider, api_key)
        .with_request_timeout(Duration::from_millis(env_or("AGENT_LLM_TIMEOUT_MS", 60_000)?))
        .with_max_steps(env_or("AGENT_MAX_STEPS", 24)?);
    if let Some(endpoint) = non_empty_env("AGENT_LLM_ENDPOINT") {
        config = config.with_endpoint(endpoint);
    }
    if let Some(model) = non_empty_env("AGENT_MODEL") {
        config = config.with_model(model);
    }

    let model = config.model.clone();
    let mut runner = match LlmAgent::new(config) {
        Ok(agent) => {
            info!(provider = %provider_name, %model, "AI provider configured");
            TurnRunner::new(Arc::new(agent))
        }
        Err(StudioError::AgentNotConfigured(reason)) => {
            warn!(%reason, "AI provider unavailable, turns will return the static fallback");
            TurnRunner::unconfigured(reason)
        }
        Err(err) => return Err(err.into()),
    };
    runner = runner
        .with_limits(resolve_turn_limits()?)
        .with_turn_timeout(Duration::from_secs(env_or("TURN_TIMEOUT_SECS", 300)?));
    if let Some(adapter) = sandbox {
        runner = runner.with_sandbox(adapter);
    }
    Ok(runner)
}

fn build_sandbox() -> anyhow::Result<Option<SandboxAdapter>> {
    let settings = SandboxSettings::default()
        .with_command_timeout(Duration::from_secs(env_or("SANDBOX_COMMAND_TIMEOUT_SECS", 30)?))
        .with_idle_ttl(Duration::from_secs(env_or("SANDBOX_IDLE_TTL_SECS", 3600)?))
        .with_dev_port(env_or("SANDBOX_DEV_PORT", 3000)?);

    let backend = non_empty_env("SANDBOX_BACKEND").unwrap_or_else(|| "local".to_string());
    let service: Arc<dyn SandboxService> = match backend.as_str() {
        "local" => {
            let config = LocalSandboxConfig::new(sandbox_root()?)?;
            let config = match non_empty_env("PATH") {
                Some(path) => config.with_path_env(path),
                None => config,
            };
            Arc::new(LocalSandbox::new(config))
        }
        "remote" => {
            let Some(base_url) = non_empty_env("SANDBOX_REMOTE_URL") else {
                bail!("SANDBOX_REMOTE_URL is required when SANDBOX_BACKEND=remote");
            };
            let mut config = RemoteSandboxConfig::new(base_url);
            if let Some(api_key) = non_empty_env("SANDBOX_API_KEY") {
                config = config.with_api_key(api_key);
            }
            Arc::new(RemoteSandbox::new(config)?)
        }
        "none" | "disabled" => {
            warn!("sandbox backend disabled, dApp sandbox tools will report errors");
            return Ok(None);
        }
        other => bail!("unsupported SANDBOX_BACKEND {other}, expected local, remote or none"),
    };

    info!(backend = service.backend(), "sandbox backend configured");
    Ok(Some(SandboxAdapter::new(
        service,
        Arc::new(SandboxRegistry::new()),
        settings,
    )))
}

fn sandbox_root() -> anyhow::Result<PathBuf> {
    let raw = non_empty_env("SANDBOX_ROOT").unwrap_or_else(|| "./data/sandboxes".to_string());
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn evict_idle_sandboxes(adapter: SandboxAdapter) {
    let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
    loop {
        ticker.tick().await;
        let evicted = adapter.evict_idle().await;
        if evicted > 0 {
            info!(evicted, "evicted idle sandboxes");
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            detail: None,
        }
    }

    fn sandbox_disabled() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "sandbox_disabled",
            "no sandbox backend is configured",
        )
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<StudioError> for ApiError {
    fn from(err: StudioError) -> Self {
        let (status, code) = match &err {
            StudioError::SandboxUnavailable(_) | StudioError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            StudioError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            StudioError::PathTraversal
            | StudioError::OutsideRoot
            | StudioError::PolicyViolation(_)
            | StudioError::InvalidOperation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            StudioError::Sandbox(_) | StudioError::Network(_) => {
                (StatusCode::BAD_GATEWAY, "sandbox_failure")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        ApiError::new(status, code, "sandbox operation failed").with_detail(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            )
                .into_response()
        }
    }
}

async fn unified_chat(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Json<TurnResponse> {
    let started = Instant::now();
    state.metrics.turn_started();
    let response = state.runner.run(request).await;
    state.metrics.turn_finished();

    state.metrics.record_turn(&response);
    let status = if response.success { "success" } else { "error" };
    state
        .metrics
        .record_request("unified_chat", status, started.elapsed());
    Json(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectBody {
    #[serde(alias = "project_id")]
    project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    #[serde(alias = "project_id")]
    project_id: String,
    files: BTreeMap<String, String>,
    #[serde(default = "default_auto_start", alias = "auto_start")]
    auto_start: bool,
}

fn default_auto_start() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

fn sandbox_of(state: &AppState) -> std::result::Result<&SandboxAdapter, ApiError> {
    state.sandbox.as_ref().ok_or_else(ApiError::sandbox_disabled)
}

fn record<T>(
    state: &AppState,
    route: &'static str,
    started: Instant,
    result: ApiResult<T>,
) -> ApiResult<T> {
    let status = if result.is_ok() { "success" } else { "error" };
    state.metrics.record_request(route, status, started.elapsed());
    result
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(body): Json<ProjectBody>,
) -> ApiResult<SandboxInfo> {
    let started = Instant::now();
    let result = ensure_project_sandbox(&state, &body.project_id).await;
    record(&state, "sandbox_create", started, result)
}

async fn ensure_project_sandbox(state: &AppState, project_id: &str) -> ApiResult<SandboxInfo> {
    let adapter = sandbox_of(state)?;
    adapter.ensure_sandbox(project_id).await?;
    adapter.sandbox_info(project_id).map(Json).ok_or_else(|| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "sandbox was not registered",
        )
    })
}

async fn upload_to_sandbox(
    State(state): State<AppState>,
    Json(body): Json<UploadBody>,
) -> ApiResult<UploadSummary> {
    let started = Instant::now();
    let result = upload_project_files(&state, &body).await;
    record(&state, "sandbox_upload", started, result)
}

async fn upload_project_files(state: &AppState, body: &UploadBody) -> ApiResult<UploadSummary> {
    let adapter = sandbox_of(state)?;
    let summary = adapter
        .upload_files(&body.project_id, &body.files, body.auto_start)
        .await?;
    Ok(Json(summary))
}

async fn start_dev_server(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Value> {
    let started = Instant::now();
    let result = start_project_dev_server(&state, &project_id).await;
    record(&state, "sandbox_start", started, result)
}

async fn start_project_dev_server(state: &AppState, project_id: &str) -> ApiResult<Value> {
    let adapter = sandbox_of(state)?;
    let url = adapter.start_dev_server(project_id).await?;
    Ok(Json(json!({ "projectId": project_id, "url": url })))
}

async fn sandbox_info(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<SandboxInfo> {
    let started = Instant::now();
    let result = sandbox_of(&state).and_then(|adapter| {
        adapter.sandbox_info(&project_id).map(Json).ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no sandbox found for project {project_id}"),
            )
        })
    });
    record(&state, "sandbox_info", started, result)
}

async fn sandbox_logs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Value> {
    let started = Instant::now();
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let result = tail_project_logs(&state, &project_id, lines).await;
    record(&state, "sandbox_logs", started, result)
}

async fn tail_project_logs(state: &AppState, project_id: &str, lines: usize) -> ApiResult<Value> {
    let adapter = sandbox_of(state)?;
    let logs = adapter.recent_logs(project_id, lines).await?;
    Ok(Json(json!({ "projectId": project_id, "logs": logs })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_without_sandbox() -> AppState {
        AppState {
            runner: Arc::new(TurnRunner::unconfigured("OPENAI_API_KEY is not set")),
            sandbox: None,
            metrics: Arc::new(AppMetrics::new().expect("metrics")),
        }
    }

    #[test]
    fn studio_errors_map_to_http_status() {
        let missing: ApiError = StudioError::SandboxUnavailable("p1".to_string()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        let slow: ApiError = StudioError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(slow.status, StatusCode::GATEWAY_TIMEOUT);
        let invalid: ApiError = StudioError::InvalidOperation("bad".to_string()).into();
        assert_eq!(invalid.code, "invalid_request");
        assert_eq!(invalid.detail.as_deref(), Some("invalid operation: bad"));
        let refused: ApiError = StudioError::PolicyViolation("no".to_string()).into();
        assert_eq!(refused.status, StatusCode::BAD_REQUEST);
        let failed: ApiError = StudioError::AgentFailed("boom".to_string()).into();
        assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn service_resource_names_the_api() {
        let resource = service_resource();
        assert_eq!(
            resource.get(opentelemetry::Key::from_static_str("service.name")),
            Some(opentelemetry::Value::from("studio-api"))
        );
        assert_eq!(
            resource.get(opentelemetry::Key::from_static_str("service.namespace")),
            Some(opentelemetry::Value::from("studio"))
        );
    }

    #[test]
    fn env_or_falls_back_to_default() {
        let value: u64 = env_or("STUDIO_API_TEST_UNSET_VARIABLE", 42).expect("default");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn unified_chat_without_provider_returns_fallback() {
        let state = state_without_sandbox();
        let request: TurnRequest = serde_json::from_value(json!({
            "message": "add a counter method",
            "projectId": "p1",
            "files": { "/blueprints/counter.py": "class Counter: pass" }
        }))
        .expect("request");

        let Json(response) = unified_chat(State(state.clone()), Json(request)).await;
        assert!(!response.success);
        assert_eq!(response.environment, "blueprint");

        let rendered = state.metrics.render().expect("metrics");
        assert!(rendered.contains("environment_verdicts_total"));
    }

    #[tokio::test]
    async fn sandbox_routes_require_a_backend() {
        let state = state_without_sandbox();
        let err = sandbox_info(State(state), Path("p1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "sandbox_disabled");
    }
}
