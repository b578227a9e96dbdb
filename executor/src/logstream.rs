//! Live log streaming: tail the build (or runtime) pod's timing file and
//! emit timestamped log lines as they accrue.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::ListParams;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::manifests::{BUILD_CONTAINER, BUILD_LOG_FILE, BUILD_TIMING_FILE, RUNTIME_CONTAINER};
use crate::models::RuntimeVersion;
use crate::orchestrator;
use crate::pod_io::TailEvent;
use crate::server::AppState;
use crate::state::{self, fields, labels};
use crate::timing;

const EXIST_WAIT: Duration = Duration::from_secs(5);
const STATUS_WAIT: Duration = Duration::from_secs(10);
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn event_stream_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response()
}

/// Cut the buffered tail input at the last newline; complete lines are
/// returned, the trailing partial line stays buffered.
pub fn drain_complete_lines(pending: &mut String) -> Vec<String> {
    match pending.rfind('\n') {
        Some(idx) => {
            let complete: Vec<String> = pending[..idx].lines().map(str::to_string).collect();
            *pending = pending[idx + 1..].to_string();
            complete
        }
        None => Vec::new(),
    }
}

/// Render one decoded timing entry as a stream line; embedded newlines are
/// escaped so each entry stays on one line.
pub fn render_stream_line(timestamp: &str, content: &str) -> String {
    format!("{timestamp} {}\n", content.replace('\n', "\\n"))
}

/// Pod and container the stream reads from: pods of the most recent build
/// Job win over runtime pods.
async fn locate_log_source(app: &AppState, id: &str) -> Result<(String, &'static str)> {
    let params = ListParams {
        label_selector: Some(format!(
            "{}={},{}={id}",
            labels::ROLE,
            labels::ROLE_BUILD,
            labels::RUNTIME_ID
        )),
        ..Default::default()
    };
    let jobs = app
        .jobs()
        .list(&params)
        .await
        .map_err(|e| Error::unknown(format!("Failed to list build jobs: {e}")))?;
    let latest: Option<Job> = jobs
        .items
        .into_iter()
        .max_by_key(|job| job.metadata.creation_timestamp.clone().map(|t| t.0));
    if let Some(job) = latest {
        let job_name = job.metadata.name.unwrap_or_default();
        let params = ListParams {
            label_selector: Some(format!("job-name={job_name}")),
            ..Default::default()
        };
        if let Ok(pods) = app.pods().list(&params).await {
            if let Some(pod) = pods.items.into_iter().next() {
                return Ok((pod.metadata.name.unwrap_or_default(), BUILD_CONTAINER));
            }
        }
    }

    match orchestrator::find_runtime_pod(app, id).await {
        Ok(pod) => Ok((pod.metadata.name.unwrap_or_default(), RUNTIME_CONTAINER)),
        Err(_) => Err(Error::runtime_not_found(format!(
            "No log source pod found for runtime {id}"
        ))),
    }
}

pub async fn stream_logs(app: &AppState, id: &str, timeout_secs: u64) -> Result<Response> {
    // The runtime may still be materializing; give it a moment to appear.
    let exist_deadline = tokio::time::Instant::now() + EXIST_WAIT;
    let deployment = loop {
        match app.runtimes.get(id).await {
            Ok(Some(dep)) => break dep,
            Ok(None) => {}
            Err(e) => tracing::warn!(runtime = id, error = %e, "deployment poll failed"),
        }
        if tokio::time::Instant::now() >= exist_deadline {
            return Err(Error::runtime_not_found(format!("Runtime {id} not found")));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    let version = state::annotation(&deployment, fields::VERSION)
        .and_then(RuntimeVersion::parse)
        .unwrap_or_default();
    if version == RuntimeVersion::V2 {
        // v2 has no timing side-channel and therefore no stream.
        return Ok(event_stream_response(Body::empty()));
    }

    let status_deadline = tokio::time::Instant::now() + STATUS_WAIT;
    loop {
        match app.runtimes.status(id).await {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(e) => tracing::warn!(runtime = id, error = %e, "status poll failed"),
        }
        if tokio::time::Instant::now() >= status_deadline {
            return Err(Error::runtime_timeout(format!(
                "Runtime {id} status unavailable"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let (pod_name, container) = locate_log_source(app, id).await?;

    // Wait for the log/timing pair to materialize; a vanished runtime ends
    // the stream empty rather than erroring.
    let files_deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match app.runtimes.status(id).await {
            Ok(None) => return Ok(event_stream_response(Body::empty())),
            Ok(Some(_)) | Err(_) => {}
        }
        if app
            .pod_files
            .file_exists(&pod_name, container, BUILD_LOG_FILE)
            .await
            && app
                .pod_files
                .file_exists(&pod_name, container, BUILD_TIMING_FILE)
                .await
        {
            match app
                .pod_files
                .read_file(&pod_name, container, BUILD_TIMING_FILE)
                .await
            {
                Ok(content) if !content.trim().is_empty() => break,
                _ => {}
            }
        }
        if tokio::time::Instant::now() >= files_deadline {
            return Err(Error::logs_timeout(format!(
                "Log files for runtime {id} did not appear in time"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let start_time = chrono::Utc::now();
    let mut log_text = app
        .pod_files
        .read_file(&pod_name, container, BUILD_LOG_FILE)
        .await
        .map_err(|e| Error::unknown(format!("Failed to read log file: {e}")))?;
    let intro = timing::log_offset(&log_text);

    let (tail, mut chunks) = app
        .pod_files
        .tail_file(&pod_name, container, BUILD_TIMING_FILE)
        .await
        .map_err(|e| Error::unknown(format!("Failed to tail timing file: {e}")))?;

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let pod_files = app.pod_files.clone();
    let runtimes = app.runtimes.clone();
    let id = id.to_string();

    tokio::spawn(async move {
        let mut cursor: i64 = 0;
        let mut pending = String::new();
        let mut buffer = String::new();
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        let chunk = Bytes::from(std::mem::take(&mut buffer));
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    // The stream outlives its source only as long as the
                    // runtime is still constructing.
                    match runtimes.status(&id).await {
                        Ok(None) => break,
                        Ok(Some(status)) if status.initialised == 1 => break,
                        _ => {}
                    }
                }
                event = chunks.recv() => match event {
                    Some(TailEvent::Chunk(chunk)) => {
                        pending.push_str(&String::from_utf8_lossy(&chunk));
                        let lines = drain_complete_lines(&mut pending);
                        if lines.is_empty() {
                            continue;
                        }
                        // New timing entries imply new log bytes.
                        if let Ok(fresh) = pod_files
                            .read_file(&pod_name, container, BUILD_LOG_FILE)
                            .await
                        {
                            log_text = fresh;
                        }
                        for line in lines {
                            let Some(part) = timing::parse_timing_line(&line, start_time) else {
                                continue;
                            };
                            let content = timing::slice_segment(&log_text, intro, cursor, &part);
                            buffer.push_str(&render_stream_line(
                                &timing::format_timestamp(part.timestamp),
                                &content,
                            ));
                            cursor += part.length;
                        }
                    }
                    Some(TailEvent::Error(e)) => {
                        tracing::warn!(runtime = %id, error = %e, "timing tail failed");
                        break;
                    }
                    None => break,
                }
            }
        }

        if !buffer.is_empty() {
            let _ = tx.send(Bytes::from(buffer)).await;
        }
        tail.cancel().await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok(event_stream_response(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lines_stay_buffered() {
        let mut pending = String::from("0.5 5\n1.0 3\n2.0 ");
        let lines = drain_complete_lines(&mut pending);
        assert_eq!(lines, vec!["0.5 5".to_string(), "1.0 3".to_string()]);
        assert_eq!(pending, "2.0 ");

        let more = drain_complete_lines(&mut pending);
        assert!(more.is_empty());
        assert_eq!(pending, "2.0 ");

        pending.push_str("4\n");
        assert_eq!(drain_complete_lines(&mut pending), vec!["2.0 4".to_string()]);
        assert!(pending.is_empty());
    }

    #[test]
    fn stream_lines_escape_embedded_newlines() {
        let line = render_stream_line("2024-05-01T12:00:00.000000+00:00", "a\nb");
        assert_eq!(line, "2024-05-01T12:00:00.000000+00:00 a\\nb\n");
    }
}
