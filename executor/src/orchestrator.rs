//! Runtime lifecycle: create (with an optional build Job driven to
//! completion), delete, list and describe.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use rand::RngCore;

use crate::error::{Error, Result, is_kube_not_found, kube_error_code};
use crate::manifests::{
    self, BUILD_CONTAINER, BUILD_LOG_FILE, BUILD_LOG_FILE_V2, BUILD_TIMING_FILE, BuildJobParams,
    RuntimeDeploymentParams,
};
use crate::models::{
    CreateResponse, CreateRuntimeRequest, ListQuery, OutputLine, RuntimeDescriptor, RuntimeVersion,
    clamp_limit, inject_variables,
};
use crate::server::AppState;
use crate::state::{
    self, STATUS_PENDING, annotation_key, deployment_name, fields, labels, now_ms, service_name,
};
use crate::timing;

pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Initial annotation set for a freshly constructed runtime Deployment.
fn initial_annotations(
    req: &CreateRuntimeRequest,
    secret: &str,
    hostname: &str,
    artifact_path: Option<&str>,
    created_ms: i64,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    let mut put = |field: &str, value: String| {
        annotations.insert(annotation_key(field), value);
    };
    put(fields::VERSION, req.version.as_str().to_string());
    put(fields::SECRET, secret.to_string());
    put(fields::HOSTNAME, hostname.to_string());
    put(fields::CREATED, created_ms.to_string());
    put(fields::UPDATED, created_ms.to_string());
    put(fields::STATUS, STATUS_PENDING.to_string());
    put(fields::INITIALISED, "0".to_string());
    put(fields::LISTENING, "0".to_string());
    put(fields::LAST_EXECUTION_TIME, created_ms.to_string());
    put(fields::IMAGE, req.image.clone());
    put(
        fields::ARTIFACT_PATH,
        artifact_path.unwrap_or_default().to_string(),
    );
    annotations
}

pub async fn create_runtime(
    app: &AppState,
    req: &CreateRuntimeRequest,
) -> Result<CreateResponse> {
    if req.runtime_id.is_empty() {
        return Err(Error::bad_request("Missing required parameter: runtimeId"));
    }
    if req.image.is_empty() {
        return Err(Error::bad_request("Missing required parameter: image"));
    }
    let id = req.runtime_id.as_str();

    match app.runtimes.status(id).await {
        Ok(Some(status)) if status.status == STATUS_PENDING => {
            return Err(Error::runtime_conflict(format!(
                "Runtime {id} creation already in progress"
            )));
        }
        Ok(Some(_)) => {
            return Err(Error::runtime_conflict(format!(
                "Runtime {id} already exists"
            )));
        }
        Ok(None) => {}
        Err(e) => {
            return Err(Error::runtime_failed(format!(
                "Failed to read runtime state: {e}"
            )));
        }
    }

    let start = now_ms();
    let secret = random_hex(16);
    let hostname = random_hex(16);
    let variables = inject_variables(
        &req.variables,
        req.version,
        &secret,
        &req.entrypoint,
        &app.args.hostname,
        req.cpus,
        req.memory,
        req.output_directory.as_deref(),
    );

    // Where the build uploads, and what gets recorded/reported. The two can
    // diverge when the caller names a destination; see delete cleanup and
    // the response contract.
    let mut upload_path: Option<String> = None;
    let mut output: Vec<OutputLine> = Vec::new();

    if let Some(command) = req.command.as_deref() {
        let build_id = uuid::Uuid::new_v4();
        let generated_path = format!("{id}/{build_id}.tar.gz");

        let source_b64 = match req.source.as_deref() {
            Some(key) => {
                let body = crate::s3::get_object(&app.s3, &app.args.s3.bucket, key)
                    .await
                    .map_err(|e| Error::runtime_failed(e.to_string()))?;
                Some(BASE64.encode(body))
            }
            None => None,
        };

        let job_name = format!("build-{id}-{}", random_hex(4));
        let job = manifests::build_job(&BuildJobParams {
            job_name: &job_name,
            runtime_id: id,
            image: &req.image,
            command_env: command,
            artifact_path: &generated_path,
            source_b64: source_b64.as_deref(),
            version: req.version,
            variables: &variables,
            cpus: req.cpus,
            memory: req.memory,
            output_directory: req.output_directory.as_deref(),
            s3: &app.args.s3,
        });
        app.jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| Error::runtime_failed(format!("Failed to create build job: {e}")))?;
        tracing::info!(runtime = id, job = %job_name, "build job created");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(req.timeout);
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match app.jobs().get(&job_name).await {
                Ok(job) => {
                    let status = job.status.unwrap_or_default();
                    if status.succeeded.unwrap_or(0) >= 1 {
                        output =
                            harvest_build_output(app, &job_name, req.version, start, false).await;
                        break;
                    }
                    if status.failed.unwrap_or(0) >= 1 {
                        let failure_output =
                            harvest_build_output(app, &job_name, req.version, start, true).await;
                        let detail: String = failure_output
                            .iter()
                            .map(|line| line.content.as_str())
                            .collect();
                        let message = if detail.is_empty() {
                            "Build job failed".to_string()
                        } else {
                            format!("Build job failed: {detail}")
                        };
                        return Err(Error::runtime_failed(message));
                    }
                }
                // The Job may not be visible immediately after create.
                Err(e) if is_kube_not_found(&e) => {}
                Err(e) => {
                    return Err(Error::runtime_failed(format!(
                        "Failed to read build job: {e}"
                    )));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::runtime_timeout("Build job timed out"));
            }
        }
        upload_path = Some(generated_path);
    } else if let Some(source) = &req.source {
        upload_path = Some(source.clone());
    }

    // Bind the Service first; an existing one is reused as-is.
    match app.services().get(&service_name(id)).await {
        Ok(_) => {}
        Err(e) if is_kube_not_found(&e) => {
            app.services()
                .create(
                    &PostParams::default(),
                    &manifests::runtime_service(&service_name(id), id),
                )
                .await
                .map_err(|e| Error::runtime_failed(format!("Failed to create service: {e}")))?;
        }
        Err(e) => {
            return Err(Error::runtime_failed(format!(
                "Failed to read service: {e}"
            )));
        }
    }

    let annotations = initial_annotations(req, &secret, &hostname, upload_path.as_deref(), start);
    let deployment = manifests::runtime_deployment(&RuntimeDeploymentParams {
        name: &deployment_name(id),
        runtime_id: id,
        image: &req.image,
        annotations,
        artifact_path: upload_path.as_deref(),
        version: req.version,
        variables: &variables,
        cpus: req.cpus,
        memory: req.memory,
        s3: &app.args.s3,
    });
    // The commit is an unconditional create: the API server is the arbiter
    // of uniqueness, and a concurrent creator that got here first must not
    // be overwritten.
    match app
        .runtimes
        .deployments()
        .create(&PostParams::default(), &deployment)
        .await
    {
        Ok(_) => {}
        Err(e) if kube_error_code(&e) == Some(409) => {
            return Err(Error::runtime_conflict(format!(
                "Runtime {id} already exists"
            )));
        }
        Err(e) => {
            return Err(Error::runtime_failed(format!(
                "Failed to create deployment: {e}"
            )));
        }
    }

    let duration = (now_ms() - start) as f64 / 1000.0;
    app.runtimes
        .update(
            id,
            &[
                (fields::STATUS, format!("Up {duration}s")),
                (fields::INITIALISED, "1".to_string()),
                (fields::UPDATED, now_ms().to_string()),
            ],
        )
        .await
        .map_err(|e| Error::runtime_failed(format!("Failed to finalize runtime state: {e}")))?;
    tracing::info!(runtime = id, duration, "runtime constructed");

    let mut size = None;
    let mut path = None;
    if let Some(destination) = &req.destination {
        let head_key = upload_path.as_deref().unwrap_or(destination);
        match crate::s3::head_object(&app.s3, &app.args.s3.bucket, head_key).await {
            Ok(length) => size = Some(length),
            Err(e) => tracing::warn!(runtime = id, error = %e, "artifact head failed"),
        }
        path = Some(destination.clone());
    }

    if req.remove {
        // Leave a window for log harvesting before tearing down.
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Err(e) = app
            .runtimes
            .deployments()
            .delete(&deployment_name(id), &DeleteParams::default())
            .await
        {
            tracing::warn!(runtime = id, error = %e, "post-build deployment delete failed");
        }
        if let Err(e) = app
            .services()
            .delete(&service_name(id), &DeleteParams::default())
            .await
        {
            tracing::warn!(runtime = id, error = %e, "post-build service delete failed");
        }
    }

    Ok(CreateResponse {
        output,
        start_time: start as f64 / 1000.0,
        duration: (now_ms() - start) as f64 / 1000.0,
        size,
        path,
    })
}

/// Pull build logs out of the finished (or failed) build pod. v2 wrote a
/// single plain log file; v4/v5 wrote a `script(1)` log/timing pair. On pod
/// read failure the failure branch falls back to the native pod log API.
async fn harvest_build_output(
    app: &AppState,
    job_name: &str,
    version: RuntimeVersion,
    start_ms: i64,
    fall_back: bool,
) -> Vec<OutputLine> {
    let params = ListParams {
        label_selector: Some(format!("job-name={job_name}")),
        ..Default::default()
    };
    let pods = match app.pods().list(&params).await {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(job = job_name, error = %e, "build pod list failed");
            return Vec::new();
        }
    };
    let Some(pod) = pods.items.into_iter().next() else {
        return Vec::new();
    };
    let pod_name = pod.metadata.name.unwrap_or_default();
    let start = ms_to_datetime(start_ms);

    let harvested = match version {
        RuntimeVersion::V2 => app
            .pod_files
            .read_file(&pod_name, BUILD_CONTAINER, BUILD_LOG_FILE_V2)
            .await
            .map(|content| {
                vec![OutputLine {
                    timestamp: timing::format_timestamp(start),
                    content,
                }]
            }),
        RuntimeVersion::V4 | RuntimeVersion::V5 => {
            let logs = app
                .pod_files
                .read_file(&pod_name, BUILD_CONTAINER, BUILD_LOG_FILE)
                .await;
            let timings = app
                .pod_files
                .read_file(&pod_name, BUILD_CONTAINER, BUILD_TIMING_FILE)
                .await;
            match (logs, timings) {
                (Ok(logs), Ok(timings)) => Ok(timing::decode_segments(&logs, &timings, start)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
    };

    match harvested {
        Ok(lines) => lines,
        Err(e) if fall_back => {
            tracing::warn!(pod = %pod_name, error = %e, "falling back to native pod logs");
            let params = LogParams {
                container: Some(BUILD_CONTAINER.to_string()),
                ..Default::default()
            };
            match app.pods().logs(&pod_name, &params).await {
                Ok(text) => vec![OutputLine {
                    timestamp: timing::format_timestamp(start),
                    content: text,
                }],
                Err(_) => Vec::new(),
            }
        }
        Err(e) => {
            tracing::warn!(pod = %pod_name, error = %e, "build log harvest failed");
            Vec::new()
        }
    }
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub found: bool,
    pub message: String,
}

/// Best-effort teardown. Only a Deployment delete failure that is neither
/// 404 nor an in-progress 500 is surfaced to the caller.
pub async fn delete_runtime(app: &AppState, id: &str) -> Result<DeleteOutcome> {
    match app
        .runtimes
        .deployments()
        .delete(&deployment_name(id), &DeleteParams::default())
        .await
    {
        Ok(_) => {}
        Err(e) if is_kube_not_found(&e) => {
            return Ok(DeleteOutcome {
                found: false,
                message: format!("Runtime {id} not found or already deleted"),
            });
        }
        Err(e)
            if kube_error_code(&e) == Some(500)
                && e.to_string().contains("already in progress") =>
        {
            return Ok(DeleteOutcome {
                found: true,
                message: format!("Runtime {id} deletion already in progress"),
            });
        }
        Err(e) => {
            return Err(Error::unknown(format!("Failed to delete runtime: {e}")));
        }
    }

    if let Err(e) = app
        .services()
        .delete(&service_name(id), &DeleteParams::default())
        .await
    {
        tracing::warn!(runtime = id, error = %e, "service delete failed");
    }

    let job = manifests::cleanup_job(&format!("delete-{id}-{}", random_hex(4)), id, &app.args.s3);
    if let Err(e) = app.jobs().create(&PostParams::default(), &job).await {
        tracing::warn!(runtime = id, error = %e, "cleanup job create failed");
    }

    Ok(DeleteOutcome {
        found: true,
        message: format!("Runtime {id} deleted"),
    })
}

#[derive(Debug)]
pub struct RuntimePage {
    pub runtimes: Vec<RuntimeDescriptor>,
    pub limit: u32,
    pub continue_token: Option<String>,
    pub remaining: Option<i64>,
}

pub async fn list_runtimes(app: &AppState, query: &ListQuery) -> Result<RuntimePage> {
    let limit = clamp_limit(query.limit);
    let params = ListParams {
        label_selector: Some(format!("{}={}", labels::ROLE, labels::ROLE_RUNTIME)),
        limit: Some(limit),
        continue_token: query.continue_token.clone(),
        ..Default::default()
    };
    let list = app
        .runtimes
        .deployments()
        .list(&params)
        .await
        .map_err(|e| Error::unknown(format!("Failed to list runtimes: {e}")))?;
    Ok(RuntimePage {
        runtimes: list.items.iter().map(state::project_descriptor).collect(),
        limit,
        continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
        remaining: list.metadata.remaining_item_count,
    })
}

pub async fn describe_runtime(app: &AppState, id: &str) -> Result<RuntimeDescriptor> {
    match app.runtimes.get(id).await {
        Ok(Some(dep)) => Ok(state::project_descriptor(&dep)),
        Ok(None) => Err(Error::runtime_not_found(format!("Runtime {id} not found"))),
        Err(e) => Err(Error::unknown(format!("Failed to read runtime: {e}"))),
    }
}

/// First pod backing the runtime Deployment, discovered by label at each
/// use; pods are never addressed as persistent state.
pub async fn find_runtime_pod(app: &AppState, id: &str) -> Result<Pod> {
    let params = ListParams {
        label_selector: Some(format!(
            "{}={},{}={id}",
            labels::ROLE,
            labels::ROLE_RUNTIME,
            labels::RUNTIME_ID
        )),
        ..Default::default()
    };
    let pods = app
        .pods()
        .list(&params)
        .await
        .map_err(|e| Error::unknown(format!("Failed to list runtime pods: {e}")))?;
    pods.items
        .into_iter()
        .next()
        .ok_or_else(|| Error::runtime_not_found(format!("No pod found for runtime {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_is_two_chars_per_byte() {
        let secret = random_hex(16);
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_hex(16), random_hex(16));
    }

    #[test]
    fn initial_annotations_start_pending_and_cold() {
        let req = CreateRuntimeRequest {
            runtime_id: "r1".to_string(),
            image: "img:v5".to_string(),
            ..Default::default()
        };
        let annotations = initial_annotations(&req, "sec", "host", Some("r1/b.tar.gz"), 1000);
        assert_eq!(
            annotations.get("appwrite.io/status").map(String::as_str),
            Some("pending")
        );
        assert_eq!(
            annotations.get("appwrite.io/initialised").map(String::as_str),
            Some("0")
        );
        assert_eq!(
            annotations.get("appwrite.io/listening").map(String::as_str),
            Some("0")
        );
        assert_eq!(
            annotations.get("appwrite.io/artifact-path").map(String::as_str),
            Some("r1/b.tar.gz")
        );
        assert_eq!(
            annotations.get("appwrite.io/version").map(String::as_str),
            Some("v5")
        );
    }
}
