use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime protocol version. Governs injected environment variable names,
/// log file locations and the authentication header shape used when
/// proxying into the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeVersion {
    V2,
    V4,
    #[default]
    V5,
}

impl RuntimeVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeVersion::V2 => "v2",
            RuntimeVersion::V4 => "v4",
            RuntimeVersion::V5 => "v5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v2" => Some(RuntimeVersion::V2),
            "v4" => Some(RuntimeVersion::V4),
            "v5" => Some(RuntimeVersion::V5),
            _ => None,
        }
    }
}

fn default_build_timeout() -> u64 {
    600
}

fn default_execution_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    600
}

fn default_path() -> String {
    "/".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_logging() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuntimeRequest {
    #[serde(default)]
    pub runtime_id: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub entrypoint: String,

    /// Object-store key of a source tarball consumed by the build, or used
    /// verbatim as the artifact when no build command is given.
    pub source: Option<String>,

    /// Caller-chosen object-store key reported back as the artifact path.
    pub destination: Option<String>,

    /// Build script; its presence is what triggers a build Job.
    pub command: Option<String>,

    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Build wait deadline in seconds.
    #[serde(default = "default_build_timeout")]
    pub timeout: u64,

    pub cpus: Option<f64>,
    pub memory: Option<u64>,

    #[serde(default)]
    pub version: RuntimeVersion,

    /// Tear the runtime down again right after a successful build.
    #[serde(default)]
    pub remove: bool,

    pub output_directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub body: Option<String>,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_execution_timeout")]
    pub timeout: u64,

    #[serde(default = "default_logging")]
    pub logging: bool,

    // Creation parameters, honored when the runtime does not exist yet.
    #[serde(default)]
    pub image: String,
    pub source: Option<String>,
    #[serde(default)]
    pub entrypoint: String,
    pub command: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    #[serde(default)]
    pub version: RuntimeVersion,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            body: None,
            path: default_path(),
            method: default_method(),
            headers: HashMap::new(),
            timeout: default_execution_timeout(),
            logging: default_logging(),
            image: String::new(),
            source: None,
            entrypoint: String::new(),
            command: None,
            variables: HashMap::new(),
            cpus: None,
            memory: None,
            version: RuntimeVersion::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,

    #[serde(default = "default_command_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    #[serde(default = "default_command_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub limit: Option<u32>,

    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
}

/// Clamp a requested page size to `[1, 100]`, defaulting to 25.
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(25).clamp(1, 100)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutputLine {
    pub timestamp: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub output: Vec<OutputLine>,
    pub start_time: f64,
    pub duration: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RuntimeDescriptor {
    pub version: String,
    pub created: f64,
    pub updated: f64,
    pub name: String,
    pub hostname: String,
    pub status: String,
    pub key: String,
    pub listening: u8,
    pub image: String,
    pub initialised: u8,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub output: String,
}

/// Collected result of one proxied invocation, prior to content negotiation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status_code: u16,
    pub headers: serde_json::Map<String, Value>,
    pub body: String,
    pub logs: String,
    pub errors: String,
    pub duration: f64,
    pub start_time: f64,
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge caller variables with the protocol-specific injections for the
/// given version. Every value is stringified for the container environment.
///
/// The `INERNAL_` misspelling in the v2 hostname variable is an external
/// contract and must not be fixed.
pub fn inject_variables(
    user: &HashMap<String, Value>,
    version: RuntimeVersion,
    secret: &str,
    entrypoint: &str,
    executor_hostname: &str,
    cpus: Option<f64>,
    memory: Option<u64>,
    output_directory: Option<&str>,
) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = user
        .iter()
        .map(|(k, v)| (k.clone(), stringify(v)))
        .collect();
    vars.insert("CI".into(), "true".into());
    match version {
        RuntimeVersion::V2 => {
            vars.insert("INTERNAL_RUNTIME_KEY".into(), secret.into());
            vars.insert("INTERNAL_RUNTIME_ENTRYPOINT".into(), entrypoint.into());
            vars.insert("INERNAL_EXECUTOR_HOSTNAME".into(), executor_hostname.into());
        }
        RuntimeVersion::V4 | RuntimeVersion::V5 => {
            vars.insert("OPEN_RUNTIMES_SECRET".into(), secret.into());
            vars.insert("OPEN_RUNTIMES_ENTRYPOINT".into(), entrypoint.into());
            vars.insert("OPEN_RUNTIMES_HOSTNAME".into(), executor_hostname.into());
            vars.insert(
                "OPEN_RUNTIMES_CPUS".into(),
                cpus.unwrap_or(1.0).to_string(),
            );
            vars.insert(
                "OPEN_RUNTIMES_MEMORY".into(),
                memory.unwrap_or(512).to_string(),
            );
            if let Some(dir) = output_directory {
                vars.insert("OPEN_RUNTIMES_OUTPUT_DIRECTORY".into(), dir.into());
            }
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn limit_clamps_to_bounds() {
        assert_eq!(clamp_limit(None), 25);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(40)), 40);
        assert_eq!(clamp_limit(Some(1000)), 100);
    }

    #[test]
    fn v2_injection_keeps_the_misspelled_hostname_variable() {
        let user = HashMap::new();
        let vars = inject_variables(
            &user,
            RuntimeVersion::V2,
            "s3cr3t",
            "index.js",
            "exec-host",
            None,
            None,
            None,
        );
        assert_eq!(vars.get("CI").map(String::as_str), Some("true"));
        assert_eq!(vars.get("INTERNAL_RUNTIME_KEY").map(String::as_str), Some("s3cr3t"));
        assert_eq!(
            vars.get("INERNAL_EXECUTOR_HOSTNAME").map(String::as_str),
            Some("exec-host")
        );
        assert!(!vars.contains_key("INTERNAL_EXECUTOR_HOSTNAME"));
    }

    #[test]
    fn v5_injection_carries_resources_and_output_directory() {
        let mut user = HashMap::new();
        user.insert("MY_FLAG".to_string(), json!(7));
        let vars = inject_variables(
            &user,
            RuntimeVersion::V5,
            "s",
            "main.py",
            "h",
            Some(2.0),
            Some(1024),
            Some("dist"),
        );
        assert_eq!(vars.get("MY_FLAG").map(String::as_str), Some("7"));
        assert_eq!(vars.get("OPEN_RUNTIMES_CPUS").map(String::as_str), Some("2"));
        assert_eq!(vars.get("OPEN_RUNTIMES_MEMORY").map(String::as_str), Some("1024"));
        assert_eq!(
            vars.get("OPEN_RUNTIMES_OUTPUT_DIRECTORY").map(String::as_str),
            Some("dist")
        );
        assert_eq!(vars.get("OPEN_RUNTIMES_ENTRYPOINT").map(String::as_str), Some("main.py"));
    }

    #[test]
    fn create_request_defaults() {
        let req: CreateRuntimeRequest =
            serde_json::from_value(json!({"runtimeId": "r1", "image": "img:v5"})).unwrap();
        assert_eq!(req.timeout, 600);
        assert_eq!(req.version, RuntimeVersion::V5);
        assert!(!req.remove);
        assert!(req.command.is_none());
    }

    #[test]
    fn execution_request_defaults() {
        let req: ExecutionRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.path, "/");
        assert_eq!(req.method, "GET");
        assert_eq!(req.timeout, 15);
        assert!(req.logging);
    }
}
