//! The admin HTTP surface: register/redeploy workers and the resources
//! they bind to, then dispatch fetch traffic through them. Not part of
//! the worker-facing sandbox — this is the control plane a `wrangler`-like
//! CLI would sit in front of.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use localflare_common::{BindingDescriptor, LocalflareError, Worker};
use localflare_runtime::{ExecutionContext, FetchRequest};
use localflare_storage::{Metric, QueueSettings};
use serde::{Deserialize, Serialize};

use crate::registry::AppState;

pub struct ApiError(LocalflareError);

impl From<LocalflareError> for ApiError {
    fn from(e: LocalflareError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LocalflareError::NotFound(_) => StatusCode::NOT_FOUND,
            LocalflareError::AlreadyExists(_) => StatusCode::CONFLICT,
            LocalflareError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            LocalflareError::InvalidArgument(_) | LocalflareError::InvalidBindingValue(_) | LocalflareError::BindingNotFound(_) => {
                StatusCode::BAD_REQUEST
            }
            LocalflareError::EntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            LocalflareError::Aborted | LocalflareError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.code(), "message": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub script: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub bindings: HashMap<String, BindingDescriptor>,
}

pub async fn register_worker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<RegisterWorkerRequest>,
) -> Result<Json<Worker>, ApiError> {
    let worker = state.register_worker(&name, body.script, body.routes, body.bindings)?;
    Ok(Json(worker))
}

pub async fn get_worker(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<Json<Worker>, ApiError> {
    state
        .worker(&name)
        .map(Json)
        .ok_or_else(|| LocalflareError::NotFound(format!("worker {name}")).into())
}

pub async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<Worker>> {
    Json(state.workers())
}

#[derive(Debug, Deserialize)]
pub struct CreateDoNamespaceRequest {
    pub script: String,
    pub class_name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateDoNamespaceResponse {
    pub namespace_id: String,
}

pub async fn create_do_namespace(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<CreateDoNamespaceRequest>,
) -> Result<Json<CreateDoNamespaceResponse>, ApiError> {
    let id = state.create_do_namespace(&name, body.script, &body.class_name)?;
    Ok(Json(CreateDoNamespaceResponse {
        namespace_id: id.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    #[serde(default = "default_delivery_delay")]
    pub delivery_delay_secs: i64,
    #[serde(default = "default_message_ttl")]
    pub message_ttl_secs: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    #[serde(default = "default_max_batch_timeout_ms")]
    pub max_batch_timeout_ms: i64,
    pub dead_letter_queue: Option<String>,
}

fn default_delivery_delay() -> i64 {
    0
}
fn default_message_ttl() -> i64 {
    4 * 24 * 3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_batch_size() -> u32 {
    10
}
fn default_max_batch_timeout_ms() -> i64 {
    1000
}

#[derive(Debug, Serialize)]
pub struct CreateQueueResponse {
    pub queue_id: String,
}

pub async fn create_queue(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<CreateQueueRequest>,
) -> Result<Json<CreateQueueResponse>, ApiError> {
    let dead_letter_queue = match body.dead_letter_queue {
        Some(dlq_name) => Some(state.create_queue(&dlq_name, QueueSettings {
            delivery_delay_secs: 0,
            message_ttl_secs: default_message_ttl(),
            max_retries: default_max_retries(),
            max_batch_size: default_max_batch_size(),
            max_batch_timeout_ms: default_max_batch_timeout_ms(),
            dead_letter_queue: None,
        })?),
        None => None,
    };
    let settings = QueueSettings {
        delivery_delay_secs: body.delivery_delay_secs,
        message_ttl_secs: body.message_ttl_secs,
        max_retries: body.max_retries,
        max_batch_size: body.max_batch_size,
        max_batch_timeout_ms: body.max_batch_timeout_ms,
        dead_letter_queue,
    };
    let id = state.create_queue(&name, settings)?;
    Ok(Json(CreateQueueResponse { queue_id: id.to_string() }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterQueueConsumerRequest {
    pub worker: String,
}

pub async fn register_queue_consumer(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<RegisterQueueConsumerRequest>,
) -> Result<StatusCode, ApiError> {
    state.register_queue_consumer(&name, &body.worker)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateVectorIndexRequest {
    pub dimensions: usize,
    #[serde(default)]
    pub metric: VectorMetric,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VectorMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

pub async fn create_vector_index(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<CreateVectorIndexRequest>,
) -> Result<StatusCode, ApiError> {
    let metric = match body.metric {
        VectorMetric::Cosine => Metric::Cosine,
        VectorMetric::Euclidean => Metric::Euclidean,
        VectorMetric::DotProduct => Metric::DotProduct,
    };
    state.create_vector_index(&name, body.dimensions, metric)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct PoolStatsDto {
    pub capacity: usize,
    pub idle_bare: usize,
    pub idle_loaded: usize,
    pub live: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pool: PoolStatsDto,
    pub workers: usize,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let pool = state.pool_stats();
    Json(StatsResponse {
        pool: PoolStatsDto {
            capacity: pool.capacity,
            idle_bare: pool.idle_bare,
            idle_loaded: pool.idle_loaded,
            live: pool.live,
        },
        workers: state.workers().len(),
    })
}

/// Dispatches a fetch request into worker `name`, blocking on a pooled
/// runtime exactly the way a real edge request would hit whichever isolate
/// currently owns that deployment. `path` must be one the worker's own
/// route table claims — the worker name in the URL says which isolate
/// serves the request, the route table says whether it answers for it.
pub async fn run(
    State(state): State<Arc<AppState>>,
    Path((name, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let full_path = format!("/{path}");
    let worker = state.worker(&name).ok_or_else(|| LocalflareError::NotFound(format!("worker {name}")))?;
    if !worker.routes.is_empty() && !worker.matches(&full_path) {
        return Err(LocalflareError::NotFound(format!("worker {name} has no route for {full_path}")).into());
    }

    let bindings = state.build_bindings(&worker)?;
    let script = localflare_runtime::Script::from_content(worker.script.clone());
    let runtime = state.pool.acquire(worker.id, worker.version, script, bindings).await.map_err(ApiError::from)?;

    let mut request = FetchRequest::new(method.as_str(), format!("http://localhost{full_path}"));
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    if !body.is_empty() {
        request = request.with_body(body.to_vec());
    }

    let exec_ctx = ExecutionContext::with_timeout(state.config.call_timeout());
    let response = runtime.dispatch_fetch(request, &exec_ctx).map_err(ApiError::from)?;
    drop(runtime);
    runtime_response_into_axum(response)
}

fn runtime_response_into_axum(response: localflare_runtime::FetchResponse) -> Result<Response, ApiError> {
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(axum::body::Body::from(response.body))
        .map_err(|e| LocalflareError::Internal(e.to_string()).into())
}

pub async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}
