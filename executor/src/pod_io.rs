//! File access inside pod containers, over streamed remote exec.
//!
//! Every call opens its own exec connection; concurrent reads and tails do
//! not share transport state.

use bytes::Bytes;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, api::AttachParams};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
#[error("exec into pod {pod} failed for {path:?}: {detail}")]
pub struct PodReadError {
    pub pod: String,
    pub path: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug)]
pub enum TailEvent {
    Chunk(Bytes),
    Error(String),
}

/// Cancels an in-flight tail. After `cancel` returns the transport is torn
/// down and no further chunks are delivered.
pub struct TailHandle {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl TailHandle {
    pub async fn cancel(self) {
        self.token.cancel();
        self.task.abort();
        let _ = self.task.await;
    }
}

#[derive(Clone)]
pub struct PodFiles {
    client: kube::Client,
    namespace: String,
}

impl PodFiles {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn err(&self, pod: &str, path: &str, detail: impl Into<String>) -> PodReadError {
        PodReadError {
            pod: pod.to_string(),
            path: path.to_string(),
            detail: detail.into(),
        }
    }

    /// Run a command in the container and collect both output streams plus
    /// the termination status.
    pub async fn exec_command(
        &self,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput, PodReadError> {
        let label = command.join(" ");
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods()
            .exec(pod, command.iter().copied(), &params)
            .await
            .map_err(|e| self.err(pod, &label, e.to_string()))?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| self.err(pod, &label, "stdout stream unavailable"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| self.err(pod, &label, "stderr stream unavailable"))?;
        let status_future = attached.take_status();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out_read, err_read) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr),
        );
        out_read.map_err(|e| self.err(pod, &label, e.to_string()))?;
        err_read.map_err(|e| self.err(pod, &label, e.to_string()))?;

        let status = match status_future {
            Some(fut) => fut.await,
            None => None,
        };

        // A missing status means the channel closed cleanly without a
        // verdict; the process did not report failure.
        let success = status
            .map(|s| s.status.as_deref() == Some("Success"))
            .unwrap_or(true);

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            success,
        })
    }

    /// `cat path`. Fails with the remote stderr on non-success termination.
    pub async fn read_file(
        &self,
        pod: &str,
        container: &str,
        path: &str,
    ) -> Result<String, PodReadError> {
        let output = self.exec_command(pod, container, &["cat", path]).await?;
        if !output.success {
            return Err(self.err(pod, path, output.stderr));
        }
        Ok(output.stdout)
    }

    /// `test -f path`. Any failure, including transport errors, reads as
    /// "absent".
    pub async fn file_exists(&self, pod: &str, container: &str, path: &str) -> bool {
        match self.exec_command(pod, container, &["test", "-f", path]).await {
            Ok(output) => output.success,
            Err(_) => false,
        }
    }

    /// `tail -F path`. Stdout chunks are delivered on the channel as they
    /// arrive; stderr output is reported once as a terminal error event.
    pub async fn tail_file(
        &self,
        pod: &str,
        container: &str,
        path: &str,
    ) -> Result<(TailHandle, mpsc::Receiver<TailEvent>), PodReadError> {
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods()
            .exec(pod, ["tail", "-F", path], &params)
            .await
            .map_err(|e| self.err(pod, path, e.to_string()))?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| self.err(pod, path, "stdout stream unavailable"))?;
        let mut stderr = attached
            .stderr()
            .ok_or_else(|| self.err(pod, path, "stderr stream unavailable"))?;

        let token = CancellationToken::new();
        let child = token.clone();
        let (tx, rx) = mpsc::channel(32);

        let task = tokio::spawn(async move {
            // Keep the attached process alive for the duration of the tail;
            // dropping it tears down the websocket.
            let _attached = attached;
            let mut out_buf = [0u8; 8192];
            let mut err_chunk = [0u8; 8192];
            let mut err_buf = Vec::new();
            let mut stderr_open = true;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    read = stdout.read(&mut out_buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&out_buf[..n]);
                            if tx.send(TailEvent::Chunk(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(TailEvent::Error(e.to_string())).await;
                            return;
                        }
                    },
                    read = stderr.read(&mut err_chunk), if stderr_open => match read {
                        Ok(0) => stderr_open = false,
                        Ok(n) => err_buf.extend_from_slice(&err_chunk[..n]),
                        Err(_) => stderr_open = false,
                    },
                }
            }
            if !err_buf.is_empty() {
                let _ = tx
                    .send(TailEvent::Error(
                        String::from_utf8_lossy(&err_buf).into_owned(),
                    ))
                    .await;
            }
        });

        Ok((TailHandle { token, task }, rx))
    }
}
