use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use serde_json::json;

use crate::args::ExecutorArgs;
use crate::handlers;
use crate::pod_io::PodFiles;
use crate::state::RuntimeState;

#[derive(Clone)]
pub struct AppState {
    pub args: Arc<ExecutorArgs>,
    pub kube: kube::Client,
    pub s3: aws_sdk_s3::Client,
    pub runtimes: RuntimeState,
    pub pod_files: PodFiles,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(args: ExecutorArgs, kube: kube::Client, s3: aws_sdk_s3::Client) -> Self {
        let runtimes = RuntimeState::new(kube.clone(), &args.namespace);
        let pod_files = PodFiles::new(kube.clone(), &args.namespace);
        Self {
            args: Arc::new(args),
            kube,
            s3,
            runtimes,
            pod_files,
            http: reqwest::Client::new(),
        }
    }

    pub fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.kube.clone(), &self.args.namespace)
    }

    pub fn services(&self) -> Api<Service> {
        Api::namespaced(self.kube.clone(), &self.args.namespace)
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.kube.clone(), &self.args.namespace)
    }
}

/// Every route except the health probe requires the shared executor secret.
async fn require_executor_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(state.args.executor_secret.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing executor key"})),
        )
            .into_response();
    }
    next.run(request).await
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/runtimes",
            post(handlers::create_runtime).get(handlers::list_runtimes),
        )
        .route(
            "/v1/runtimes/{id}",
            get(handlers::get_runtime).delete(handlers::delete_runtime),
        )
        .route(
            "/v1/runtimes/{id}/executions",
            post(handlers::create_execution),
        )
        // Legacy singular form kept for older callers.
        .route(
            "/v1/runtimes/{id}/execution",
            post(handlers::create_execution),
        )
        .route("/v1/runtimes/{id}/commands", post(handlers::run_command))
        .route("/v1/runtimes/{id}/logs", get(handlers::stream_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_executor_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/health", get(handlers::health))
        .merge(protected)
        .fallback(handlers::route_not_found)
        .with_state(state)
}
