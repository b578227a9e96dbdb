use std::time::Duration;

use crate::error::{Error, Result};
use crate::manifests::RUNTIME_CONTAINER;
use crate::models::CommandRequest;
use crate::orchestrator;
use crate::server::AppState;

/// Run a shell command inside the runtime pod and return its stdout.
pub async fn run_command(app: &AppState, id: &str, req: &CommandRequest) -> Result<String> {
    if req.command.is_empty() {
        return Err(Error::bad_request("Missing required parameter: command"));
    }

    let pod = orchestrator::find_runtime_pod(app, id).await?;
    let pod_name = pod.metadata.name.unwrap_or_default();

    let cmd_args = ["sh", "-c", req.command.as_str()];
    let exec = app
        .pod_files
        .exec_command(&pod_name, RUNTIME_CONTAINER, &cmd_args);
    let output = match tokio::time::timeout(Duration::from_secs(req.timeout), exec).await {
        Err(_) => return Err(Error::command_timeout("Operation timed out")),
        Ok(Err(e)) => return Err(Error::command_failed(e.to_string())),
        Ok(Ok(output)) => output,
    };
    if !output.success {
        return Err(Error::command_failed(if output.stderr.is_empty() {
            "Command failed".to_string()
        } else {
            output.stderr
        }));
    }
    Ok(output.stdout)
}
