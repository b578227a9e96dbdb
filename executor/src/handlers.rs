use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::commands;
use crate::error::{Error, Result};
use crate::invoke;
use crate::logstream;
use crate::models::{
    CommandRequest, CommandResponse, CreateRuntimeRequest, ExecutionRequest, ListQuery, LogsQuery,
};
use crate::orchestrator;
use crate::server::AppState;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

pub async fn route_not_found() -> Response {
    Error::route_not_found().into_response()
}

fn parse_json<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(Error::bad_json(rejection.body_text())),
    }
}

pub async fn create_runtime(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateRuntimeRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let req = parse_json(body)?;
    let response = orchestrator::create_runtime(&state, &req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_runtimes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Response> {
    let page = orchestrator::list_runtimes(&state, &query).await?;
    let mut response = Json(page.runtimes).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&page.limit.to_string()) {
        headers.insert("X-PAGINATION-LIMIT", value);
    }
    if let Some(token) = &page.continue_token {
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert("X-PAGINATION-CONTINUE", value);
        }
    }
    if let Some(remaining) = page.remaining {
        if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
            headers.insert("X-PAGINATION-REMAINING", value);
        }
    }
    Ok(response)
}

pub async fn get_runtime(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let descriptor = orchestrator::describe_runtime(&state, &id).await?;
    Ok(Json(descriptor))
}

pub async fn delete_runtime(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let outcome = orchestrator::delete_runtime(&state, &id).await?;
    let code = if outcome.found {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((code, Json(json!({"status": outcome.message}))).into_response())
}

pub async fn create_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: std::result::Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Response> {
    // A bare POST without a JSON body is a plain GET / invocation.
    let req = match body {
        Ok(Json(req)) => req,
        Err(JsonRejection::MissingJsonContentType(_)) => ExecutionRequest::default(),
        Err(rejection) => return Err(Error::bad_json(rejection.body_text())),
    };
    let result = invoke::execute(&state, &id, &req).await?;
    Ok(invoke::render_execution(result, &headers))
}

pub async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<CommandRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let req = parse_json(body)?;
    let output = commands::run_command(&state, &id, &req).await?;
    Ok(Json(CommandResponse { output }))
}

pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    logstream::stream_logs(&state, &id, query.timeout).await
}
