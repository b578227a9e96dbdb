//! Invocation path: cold start the runtime if needed, proxy the call into
//! the pod, collect logs, and render the result as JSON or multipart.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use percent_encoding::percent_decode_str;
use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::manifests::{EXECUTION_LOG_DIR, RUNTIME_CONTAINER};
use crate::models::{
    CreateRuntimeRequest, ExecutionRequest, ExecutionResult, RuntimeVersion,
};
use crate::orchestrator;
use crate::server::AppState;
use crate::state::{self, fields, now_ms};

/// Execution logs surfaced to the caller are capped at 1 MiB each.
pub const LOG_TRUNCATE_BYTES: usize = 1_048_576;
const TRUNCATION_NOTICE: &str = "\n[log truncated, exceeded 1 MiB]";

/// Header boundary below which list-valued response headers collapse to
/// their last value.
const MULTI_VALUE_HEADER_FORMAT: &str = "0.11.0";

const COLD_START_WAIT: Duration = Duration::from_secs(60);

pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

/// Project proxied response headers into the surfaced map: keys lowercase,
/// internal `x-open-runtimes-*` headers dropped, repeated names promoted to
/// an ordered list (oldest first).
pub fn surface_headers(pairs: &[(String, String)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in pairs {
        let name = name.to_ascii_lowercase();
        if name.starts_with("x-open-runtimes-") {
            continue;
        }
        match map.get_mut(&name) {
            None => {
                map.insert(name, Value::String(value.clone()));
            }
            Some(Value::Array(values)) => {
                values.push(Value::String(value.clone()));
            }
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value.clone())]);
            }
        }
    }
    map
}

/// Pre-0.11.0 callers expect a flat header map; lists collapse to their
/// last value.
pub fn collapse_headers(headers: Map<String, Value>) -> Map<String, Value> {
    headers
        .into_iter()
        .map(|(name, value)| match value {
            Value::Array(mut values) => {
                let last = values.pop().unwrap_or(Value::String(String::new()));
                (name, last)
            }
            other => (name, other),
        })
        .collect()
}

/// The response-format header is compared lexicographically; an absent
/// header reads as the oldest format.
pub fn wants_collapsed_headers(response_format: Option<&str>) -> bool {
    response_format.unwrap_or("") < MULTI_VALUE_HEADER_FORMAT
}

pub fn accepts_json(accept: Option<&str>) -> bool {
    accept
        .map(|a| a.contains("application/json") || a.contains("application/*"))
        .unwrap_or(false)
}

/// Headers for the proxied request: caller headers first, then the
/// protocol-specific ones inserted on top so they overwrite any
/// caller-supplied duplicate. Unparseable caller entries are skipped.
pub fn build_proxy_headers(
    caller: &HashMap<String, String>,
    version: RuntimeVersion,
    secret: &str,
    timeout_secs: u64,
    logging: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in caller {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = HeaderValue::try_from(value.as_str()) else {
            continue;
        };
        headers.append(name, value);
    }
    match version {
        RuntimeVersion::V2 => {
            if let Ok(value) = HeaderValue::try_from(secret) {
                headers.insert("x-internal-challenge", value);
            }
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            // The in-pod server must not see a caller-supplied Host.
            headers.remove(header::HOST);
        }
        RuntimeVersion::V4 | RuntimeVersion::V5 => {
            let basic = BASE64.encode(format!("opr:{secret}"));
            if let Ok(value) = HeaderValue::try_from(format!("Basic {basic}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
            if let Ok(value) = HeaderValue::try_from(secret) {
                headers.insert("x-open-runtimes-secret", value);
            }
            if let Ok(value) = HeaderValue::try_from(timeout_secs.to_string()) {
                headers.insert("x-open-runtimes-timeout", value);
            }
            headers.insert(
                "x-open-runtimes-logging",
                HeaderValue::from_static(if logging { "enabled" } else { "disabled" }),
            );
        }
    }
    headers
}

pub fn truncate_log(content: String) -> String {
    if content.len() <= LOG_TRUNCATE_BYTES {
        return content;
    }
    let mut truncated =
        String::from_utf8_lossy(&content.as_bytes()[..LOG_TRUNCATE_BYTES]).into_owned();
    truncated.push_str(TRUNCATION_NOTICE);
    truncated
}

fn multipart_fields(result: &ExecutionResult) -> Vec<(&'static str, String)> {
    vec![
        ("statusCode", result.status_code.to_string()),
        (
            "headers",
            serde_json::to_string(&result.headers).unwrap_or_else(|_| "{}".to_string()),
        ),
        ("body", result.body.clone()),
        ("logs", result.logs.clone()),
        ("errors", result.errors.clone()),
        ("duration", result.duration.to_string()),
        ("startTime", result.start_time.to_string()),
    ]
}

/// Multipart/form-data rendering: one part per field, CRLF-joined,
/// terminated by the closing boundary.
pub fn render_multipart(result: &ExecutionResult, boundary: &str) -> String {
    let mut out = String::new();
    for (name, value) in multipart_fields(result) {
        out.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    out.push_str(&format!("--{boundary}--"));
    out
}

/// Content negotiation over the collected result.
pub fn render_execution(
    mut result: ExecutionResult,
    request_headers: &HeaderMap,
) -> Response {
    let response_format = request_headers
        .get("x-executor-response-format")
        .and_then(|v| v.to_str().ok());
    if wants_collapsed_headers(response_format) {
        result.headers = collapse_headers(result.headers);
    }

    let accept = request_headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok());
    if accepts_json(accept) {
        return Json(json!({
            "statusCode": result.status_code,
            "headers": result.headers,
            "body": result.body,
            "logs": result.logs,
            "errors": result.errors,
            "duration": result.duration,
            "startTime": result.start_time,
        }))
        .into_response();
    }

    let boundary = format!("----WebKitFormBoundary{}", to_base36(now_ms() as u64));
    let body = render_multipart(&result, &boundary);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )],
        body,
    )
        .into_response()
}

pub async fn execute(app: &AppState, id: &str, req: &ExecutionRequest) -> Result<ExecutionResult> {
    let prepare_start = now_ms();

    let mut variables = req.variables.clone();
    variables.insert(
        "INERNAL_EXECUTOR_HOSTNAME".to_string(),
        Value::String(app.args.hostname.clone()),
    );

    let exists = app
        .runtimes
        .exists(id)
        .await
        .map_err(|e| Error::unknown(format!("Failed to read runtime state: {e}")))?;
    if !exists {
        if req.image.is_empty() || req.source.is_none() {
            return Err(Error::bad_request(
                "Runtime not found. Please provide image and source to create it.",
            ));
        }
        let create = CreateRuntimeRequest {
            runtime_id: id.to_string(),
            image: req.image.clone(),
            entrypoint: req.entrypoint.clone(),
            source: req.source.clone(),
            destination: None,
            command: req.command.clone(),
            variables: variables.clone(),
            timeout: req.timeout,
            cpus: req.cpus,
            memory: req.memory,
            version: req.version,
            remove: false,
            output_directory: None,
        };
        orchestrator::create_runtime(app, &create).await?;
        app.runtimes
            .wait_ready(id, Duration::from_secs(req.timeout))
            .await?;
    }

    let remaining_ms =
        ((req.timeout as i64) * 1000 - (now_ms() - prepare_start)).max(1000) as u64;
    let remaining = Duration::from_millis(remaining_ms);

    app.runtimes
        .update_swallowed(id, &[(fields::UPDATED, now_ms().to_string())])
        .await;
    app.runtimes.wait_ready(id, remaining).await?;

    let deployment = app
        .runtimes
        .get(id)
        .await
        .map_err(|e| Error::unknown(format!("Failed to read runtime: {e}")))?
        .ok_or_else(|| Error::runtime_not_found(format!("Runtime {id} not found")))?;
    let secret = state::annotation(&deployment, fields::SECRET)
        .unwrap_or_default()
        .to_string();
    if secret.is_empty() {
        return Err(Error::runtime_not_found(
            "Runtime secret not found. Please re-create the runtime.",
        ));
    }
    let version = state::annotation(&deployment, fields::VERSION)
        .and_then(RuntimeVersion::parse)
        .unwrap_or_default();

    // Cold start: flip the replica count and wait out the three readiness
    // gates in order (cluster, TCP, application).
    let mut listening = state::annotation(&deployment, fields::LISTENING) == Some("1");
    if state::replicas(&deployment) == 0 {
        app.runtimes
            .set_replicas(id, 1)
            .await
            .map_err(|e| Error::unknown(format!("Failed to scale runtime up: {e}")))?;
        // A fresh pod starts with a closed port regardless of what the
        // previous pod reported.
        listening = false;
        app.runtimes
            .update_swallowed(id, &[(fields::LISTENING, "0".to_string())])
            .await;

        let deadline = tokio::time::Instant::now() + COLD_START_WAIT;
        loop {
            match app.runtimes.get(id).await {
                Ok(Some(dep)) if state::ready_replicas(&dep) >= 1 => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(runtime = id, error = %e, "cold start poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::runtime_timeout(format!(
                    "Runtime {id} did not become ready in time"
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    let pod = orchestrator::find_runtime_pod(app, id).await?;
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or_else(|| Error::runtime_not_found(format!("Runtime {id} pod has no address")))?;

    if !listening {
        if !app.runtimes.wait_listening(&pod_ip, remaining).await {
            return Err(Error::runtime_timeout(format!(
                "Runtime {id} did not start listening in time"
            )));
        }
        app.runtimes
            .update_swallowed(id, &[(fields::LISTENING, "1".to_string())])
            .await;
    }

    let method = Method::from_bytes(req.method.to_uppercase().as_bytes())
        .map_err(|_| Error::bad_request(format!("Invalid method: {}", req.method)))?;
    let url = format!("http://{pod_ip}:3000{}", normalize_path(&req.path));

    let proxy_headers = build_proxy_headers(
        &req.headers,
        version,
        &secret,
        (remaining_ms / 1000).max(1),
        req.logging,
    );
    let mut request = app
        .http
        .request(method.clone(), &url)
        .timeout(Duration::from_millis(remaining_ms + 5000))
        .headers(proxy_headers);
    if method != Method::GET && method != Method::HEAD {
        if let Some(body) = &req.body {
            request = request.body(body.clone());
        }
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::execution_timeout(format!("Execution aborted: {e}")))?;

    let status_code = response.status().as_u16();
    let header_pairs: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let log_id = response
        .headers()
        .get("x-open-runtimes-log-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| percent_decode_str(v).decode_utf8_lossy().into_owned());
    let body = response
        .text()
        .await
        .map_err(|e| Error::execution_timeout(format!("Execution aborted: {e}")))?;
    let headers = surface_headers(&header_pairs);

    let mut logs = String::new();
    let mut errors = String::new();
    if version == RuntimeVersion::V5 && req.logging {
        if let Some(log_id) = log_id.filter(|id| !id.is_empty()) {
            if let Ok(content) = app
                .pod_files
                .read_file(
                    &pod_name,
                    RUNTIME_CONTAINER,
                    &format!("{EXECUTION_LOG_DIR}/{log_id}_logs.log"),
                )
                .await
            {
                logs = truncate_log(content);
            }
            if let Ok(content) = app
                .pod_files
                .read_file(
                    &pod_name,
                    RUNTIME_CONTAINER,
                    &format!("{EXECUTION_LOG_DIR}/{log_id}_errors.log"),
                )
                .await
            {
                errors = truncate_log(content);
            }
        }
    }

    app.runtimes
        .update_swallowed(
            id,
            &[
                (fields::LAST_EXECUTION_TIME, now_ms().to_string()),
                (fields::UPDATED, now_ms().to_string()),
            ],
        )
        .await;

    Ok(ExecutionResult {
        status_code,
        headers,
        body,
        logs,
        errors,
        duration: (now_ms() - prepare_start) as f64 / 1000.0,
        start_time: prepare_start as f64 / 1000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_headers(headers: Map<String, Value>) -> ExecutionResult {
        ExecutionResult {
            status_code: 200,
            headers,
            body: "ok".to_string(),
            logs: String::new(),
            errors: String::new(),
            duration: 0.25,
            start_time: 1_700_000_000.0,
        }
    }

    #[test]
    fn paths_gain_a_leading_slash() {
        assert_eq!(normalize_path("foo"), "/foo");
        assert_eq!(normalize_path("/foo"), "/foo");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn base36_renders_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn internal_headers_are_dropped_and_keys_lowered() {
        let pairs = vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("X-Open-Runtimes-Log-Id".to_string(), "abc".to_string()),
            ("x-open-runtimes-secret".to_string(), "s".to_string()),
        ];
        let map = surface_headers(&pairs);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("content-type"), Some(&Value::String("text/plain".into())));
    }

    #[test]
    fn repeated_headers_promote_to_ordered_lists() {
        let pairs = vec![
            ("set-cookie".to_string(), "a=1".to_string()),
            ("set-cookie".to_string(), "b=2".to_string()),
            ("set-cookie".to_string(), "c=3".to_string()),
        ];
        let map = surface_headers(&pairs);
        assert_eq!(
            map.get("set-cookie"),
            Some(&serde_json::json!(["a=1", "b=2", "c=3"]))
        );
    }

    #[test]
    fn collapse_keeps_the_last_value() {
        let pairs = vec![
            ("set-cookie".to_string(), "a=1".to_string()),
            ("set-cookie".to_string(), "b=2".to_string()),
        ];
        let collapsed = collapse_headers(surface_headers(&pairs));
        assert_eq!(collapsed.get("set-cookie"), Some(&Value::String("b=2".into())));
    }

    #[test]
    fn response_format_boundary_is_lexicographic() {
        assert!(wants_collapsed_headers(None));
        assert!(wants_collapsed_headers(Some("0.10.9")));
        assert!(!wants_collapsed_headers(Some("0.11.0")));
        assert!(!wants_collapsed_headers(Some("0.12.0")));
    }

    #[test]
    fn accept_negotiation() {
        assert!(accepts_json(Some("application/json")));
        assert!(accepts_json(Some("application/*, text/html")));
        assert!(!accepts_json(Some("text/html")));
        assert!(!accepts_json(None));
    }

    #[test]
    fn protocol_headers_override_caller_duplicates() {
        let mut caller = HashMap::new();
        caller.insert("Authorization".to_string(), "Bearer forged".to_string());
        caller.insert("x-custom".to_string(), "kept".to_string());
        let headers = build_proxy_headers(&caller, RuntimeVersion::V5, "s3cr3t", 14, true);
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap().to_str().unwrap(),
            format!("Basic {}", BASE64.encode("opr:s3cr3t"))
        );
        assert_eq!(headers.get_all(header::AUTHORIZATION).iter().count(), 1);
        assert_eq!(headers.get("x-open-runtimes-secret").unwrap(), "s3cr3t");
        assert_eq!(headers.get("x-open-runtimes-timeout").unwrap(), "14");
        assert_eq!(headers.get("x-open-runtimes-logging").unwrap(), "enabled");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn v2_strips_host_and_forces_content_type() {
        let mut caller = HashMap::new();
        caller.insert("Host".to_string(), "spoofed.example".to_string());
        caller.insert("Content-Type".to_string(), "text/plain".to_string());
        let headers = build_proxy_headers(&caller, RuntimeVersion::V2, "s", 1, true);
        assert!(headers.get(header::HOST).is_none());
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get("x-internal-challenge").unwrap(), "s");
        assert_eq!(headers.get_all(header::CONTENT_TYPE).iter().count(), 1);
    }

    #[test]
    fn unparseable_caller_headers_are_skipped() {
        let mut caller = HashMap::new();
        caller.insert("bad header name".to_string(), "v".to_string());
        caller.insert("x-fine".to_string(), "ok".to_string());
        let headers = build_proxy_headers(&caller, RuntimeVersion::V5, "s", 1, false);
        assert!(headers.get("x-fine").is_some());
        assert_eq!(headers.get("x-open-runtimes-logging").unwrap(), "disabled");
        assert_eq!(
            headers
                .iter()
                .filter(|(name, _)| name.as_str().contains(' '))
                .count(),
            0
        );
    }

    #[test]
    fn truncation_triggers_exactly_past_one_mebibyte() {
        let exact = "a".repeat(LOG_TRUNCATE_BYTES);
        assert_eq!(truncate_log(exact.clone()).len(), LOG_TRUNCATE_BYTES);
        let over = "a".repeat(LOG_TRUNCATE_BYTES + 1);
        let truncated = truncate_log(over);
        assert!(truncated.ends_with(TRUNCATION_NOTICE));
        assert_eq!(
            truncated.len(),
            LOG_TRUNCATE_BYTES + TRUNCATION_NOTICE.len()
        );
    }

    #[test]
    fn multipart_parts_are_crlf_joined_and_terminated() {
        let mut headers = Map::new();
        headers.insert("content-type".to_string(), Value::String("text/plain".into()));
        let result = result_with_headers(headers);
        let body = render_multipart(&result, "----WebKitFormBoundaryabc");
        assert!(body.starts_with("------WebKitFormBoundaryabc\r\n"));
        assert!(body.contains("Content-Disposition: form-data; name=\"statusCode\"\r\n\r\n200\r\n"));
        assert!(body.contains("name=\"headers\"\r\n\r\n{\"content-type\":\"text/plain\"}"));
        assert!(body.ends_with("------WebKitFormBoundaryabc--"));
    }
}
