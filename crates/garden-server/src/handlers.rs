//! HTTP request handlers for the Garden API.
//!
//! Every handler resolves its container through [`Garden::lookup`], which
//! also resets the container's grace-time clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use garden_common::types::{
    BandwidthLimits, Capacity, ContainerInfo, ContainerInfoEntry, ContainerMetricsEntry,
    ContainerSpec, CpuLimits, CreateResponse, DiskLimits, Handle, Limits, ListResponse,
    MemoryLimits, Metrics, NetInRequest, NetOutRule, PortMapping, ProcessEvent, Properties,
    PropertyValue, RunRequest, RunResponse, SignalRequest, StopRequest, TtySpec,
};
use garden_runtime::engine::Garden;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ApiResult;

/// Content type of process output streams.
pub const NDJSON: &str = "application/x-ndjson";

/// Content type of file streams.
pub const TAR: &str = "application/x-tar";

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The engine serving requests.
    pub garden: Arc<Garden>,
}

/// Query parameters naming a path inside a container.
#[derive(Debug, Deserialize)]
pub struct PathQuery {
    /// Path inside the container.
    pub path: String,
}

/// Handle GET /ping.
pub async fn ping(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.garden.ping()?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle GET /capacity.
pub async fn capacity(State(state): State<AppState>) -> ApiResult<Json<Capacity>> {
    Ok(Json(state.garden.capacity()?))
}

/// Handle GET /containers - every handle whose properties match the query.
pub async fn list_containers(
    State(state): State<AppState>,
    Query(filter): Query<Properties>,
) -> Json<ListResponse> {
    Json(ListResponse {
        handles: state.garden.containers(&filter),
    })
}

/// Handle POST /containers.
pub async fn create_container(
    State(state): State<AppState>,
    Json(spec): Json<ContainerSpec>,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    let container = state.garden.create(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            handle: container.handle().clone(),
        }),
    ))
}

/// Handle DELETE /containers/{handle}.
pub async fn destroy_container(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<StatusCode> {
    state.garden.destroy(&handle).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle POST /bulk/info.
pub async fn bulk_info(
    State(state): State<AppState>,
    Json(handles): Json<Vec<Handle>>,
) -> Json<BTreeMap<String, ContainerInfoEntry>> {
    Json(state.garden.bulk_info(&handles))
}

/// Handle POST /bulk/metrics.
pub async fn bulk_metrics(
    State(state): State<AppState>,
    Json(handles): Json<Vec<Handle>>,
) -> ApiResult<Json<BTreeMap<String, ContainerMetricsEntry>>> {
    let garden = Arc::clone(&state.garden);
    let entries = tokio::task::spawn_blocking(move || garden.bulk_metrics(&handles)).await?;
    Ok(Json(entries))
}

/// Handle GET /containers/{handle}/info.
pub async fn info(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<ContainerInfo>> {
    Ok(Json(state.garden.lookup(&handle)?.info()))
}

/// Handle GET /containers/{handle}/metrics.
pub async fn metrics(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Metrics>> {
    let container = state.garden.lookup(&handle)?;
    let metrics = tokio::task::spawn_blocking(move || container.metrics()).await?;
    Ok(Json(metrics))
}

/// Handle POST /containers/{handle}/stop.
pub async fn stop(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(request): Json<StopRequest>,
) -> ApiResult<StatusCode> {
    state.garden.lookup(&handle)?.stop(request.kill).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle GET /containers/{handle}/properties.
pub async fn properties(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Properties>> {
    Ok(Json(state.garden.lookup(&handle)?.properties()))
}

/// Handle GET /containers/{handle}/properties/{key}.
pub async fn property(
    State(state): State<AppState>,
    Path((handle, key)): Path<(String, String)>,
) -> ApiResult<Json<PropertyValue>> {
    let value = state.garden.lookup(&handle)?.property(&key)?;
    Ok(Json(PropertyValue { value }))
}

/// Handle PUT /containers/{handle}/properties/{key}.
pub async fn set_property(
    State(state): State<AppState>,
    Path((handle, key)): Path<(String, String)>,
    Json(body): Json<PropertyValue>,
) -> ApiResult<StatusCode> {
    state.garden.lookup(&handle)?.set_property(&key, &body.value)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle DELETE /containers/{handle}/properties/{key}.
pub async fn remove_property(
    State(state): State<AppState>,
    Path((handle, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.garden.lookup(&handle)?.remove_property(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle GET /containers/{handle}/limits.
pub async fn limits(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Limits>> {
    Ok(Json(state.garden.lookup(&handle)?.limits()))
}

/// Handle PUT /containers/{handle}/limits/memory.
pub async fn limit_memory(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(limits): Json<MemoryLimits>,
) -> ApiResult<Json<Limits>> {
    let container = state.garden.lookup(&handle)?;
    container.limit_memory(limits)?;
    Ok(Json(container.limits()))
}

/// Handle PUT /containers/{handle}/limits/cpu.
pub async fn limit_cpu(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(limits): Json<CpuLimits>,
) -> ApiResult<Json<Limits>> {
    let container = state.garden.lookup(&handle)?;
    container.limit_cpu(limits)?;
    Ok(Json(container.limits()))
}

/// Handle PUT /containers/{handle}/limits/disk.
pub async fn limit_disk(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(limits): Json<DiskLimits>,
) -> ApiResult<Json<Limits>> {
    let container = state.garden.lookup(&handle)?;
    container.limit_disk(limits)?;
    Ok(Json(container.limits()))
}

/// Handle PUT /containers/{handle}/limits/bandwidth.
pub async fn limit_bandwidth(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(limits): Json<BandwidthLimits>,
) -> ApiResult<Json<Limits>> {
    let container = state.garden.lookup(&handle)?;
    container.limit_bandwidth(limits)?;
    Ok(Json(container.limits()))
}

/// Handle POST /containers/{handle}/net_in.
pub async fn net_in(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(request): Json<NetInRequest>,
) -> ApiResult<Json<PortMapping>> {
    let mapping = state
        .garden
        .lookup(&handle)?
        .net_in(request.host_port, request.container_port)
        .await?;
    Ok(Json(mapping))
}

/// Handle POST /containers/{handle}/net_out.
pub async fn net_out(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(rule): Json<NetOutRule>,
) -> ApiResult<StatusCode> {
    state.garden.lookup(&handle)?.net_out(rule)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle GET /containers/{handle}/net_out.
pub async fn net_out_rules(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Vec<NetOutRule>>> {
    Ok(Json(state.garden.lookup(&handle)?.net_out_rules()))
}

/// Handle POST /containers/{handle}/processes.
pub async fn run(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(request): Json<RunRequest>,
) -> ApiResult<(StatusCode, Json<RunResponse>)> {
    let process = state
        .garden
        .lookup(&handle)?
        .run(request.spec, request.stdin)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RunResponse {
            process_id: process.id(),
        }),
    ))
}

/// Handle GET /containers/{handle}/processes/{id}/output.
///
/// Streams one JSON [`ProcessEvent`] per line: recorded output first, then
/// live output, ending with the exit status.
pub async fn attach(
    State(state): State<AppState>,
    Path((handle, process_id)): Path<(String, u32)>,
) -> ApiResult<Response> {
    let process = state.garden.lookup(&handle)?.attach(process_id)?;
    let events = ReceiverStream::new(process.attach()).map(|event| encode_line(&event));
    Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(events)).into_response())
}

fn encode_line(event: &ProcessEvent) -> Result<Bytes, std::io::Error> {
    let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Handle POST /containers/{handle}/processes/{id}/signal.
pub async fn signal(
    State(state): State<AppState>,
    Path((handle, process_id)): Path<(String, u32)>,
    Json(request): Json<SignalRequest>,
) -> ApiResult<StatusCode> {
    state
        .garden
        .lookup(&handle)?
        .attach(process_id)?
        .signal(request.signal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle PUT /containers/{handle}/processes/{id}/tty.
pub async fn set_tty(
    State(state): State<AppState>,
    Path((handle, process_id)): Path<(String, u32)>,
    Json(tty): Json<TtySpec>,
) -> ApiResult<StatusCode> {
    state
        .garden
        .lookup(&handle)?
        .attach(process_id)?
        .set_tty(tty)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle PUT /containers/{handle}/files?path= - unpack a tar archive.
pub async fn stream_in(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<PathQuery>,
    archive: Bytes,
) -> ApiResult<StatusCode> {
    state
        .garden
        .lookup(&handle)?
        .stream_in(&query.path, archive.to_vec())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle GET /containers/{handle}/files?path= - pack a tar archive.
pub async fn stream_out(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Response> {
    let archive = state.garden.lookup(&handle)?.stream_out(&query.path).await?;
    Ok(([(header::CONTENT_TYPE, TAR)], archive).into_response())
}
