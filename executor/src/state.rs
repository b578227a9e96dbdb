//! Runtime lifecycle state, stored as annotations on the runtime
//! Deployment. The cluster API server is the only store; nothing here is
//! cached across requests.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api,
    api::{Patch, PatchParams},
};
use serde_json::{Value, json};

use crate::error::{Error, is_kube_not_found};
use crate::models::RuntimeDescriptor;

/// Annotation field names. The `appwrite.io/` prefix is an external
/// contract shared with other consumers of these Deployments.
pub mod fields {
    pub const PREFIX: &str = "appwrite.io/";

    pub const VERSION: &str = "version";
    pub const SECRET: &str = "secret";
    pub const HOSTNAME: &str = "hostname";
    pub const CREATED: &str = "created";
    pub const UPDATED: &str = "updated";
    pub const STATUS: &str = "status";
    pub const INITIALISED: &str = "initialised";
    pub const LISTENING: &str = "listening";
    pub const LAST_EXECUTION_TIME: &str = "last-execution-time";
    pub const IMAGE: &str = "image";
    pub const ARTIFACT_PATH: &str = "artifact-path";
}

pub mod labels {
    pub const ROLE: &str = "role";
    pub const RUNTIME_ID: &str = "runtime-id";

    pub const ROLE_RUNTIME: &str = "runtime";
    pub const ROLE_BUILD: &str = "build";
    pub const ROLE_DELETE: &str = "delete";
}

pub const STATUS_PENDING: &str = "pending";

pub fn deployment_name(id: &str) -> String {
    format!("dep-{id}")
}

pub fn service_name(id: &str) -> String {
    format!("svc-{id}")
}

pub fn annotation_key(field: &str) -> String {
    format!("{}{field}", fields::PREFIX)
}

/// JSON-pointer form of an annotation path; `/` in the prefix escapes to
/// `~1`.
pub fn annotation_pointer(field: &str) -> String {
    format!("/metadata/annotations/appwrite.io~1{field}")
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub status: String,
    pub initialised: u8,
    pub listening: u8,
    pub created: i64,
    pub updated: i64,
}

pub fn annotation<'a>(dep: &'a Deployment, field: &str) -> Option<&'a str> {
    dep.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&annotation_key(field)))
        .map(String::as_str)
}

fn annotation_i64(dep: &Deployment, field: &str) -> i64 {
    annotation(dep, field)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn annotation_bit(dep: &Deployment, field: &str) -> u8 {
    match annotation(dep, field) {
        Some("1") => 1,
        _ => 0,
    }
}

pub fn project_status(dep: &Deployment) -> RuntimeStatus {
    RuntimeStatus {
        status: annotation(dep, fields::STATUS).unwrap_or_default().to_string(),
        initialised: annotation_bit(dep, fields::INITIALISED),
        listening: annotation_bit(dep, fields::LISTENING),
        created: annotation_i64(dep, fields::CREATED),
        updated: annotation_i64(dep, fields::UPDATED),
    }
}

/// Runtime id carried by the Deployment, falling back to stripping the
/// `dep-` name prefix.
pub fn runtime_id(dep: &Deployment) -> String {
    if let Some(id) = dep
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::RUNTIME_ID))
    {
        return id.clone();
    }
    let name = dep.metadata.name.as_deref().unwrap_or_default();
    name.strip_prefix("dep-").unwrap_or(name).to_string()
}

/// Project annotations into the external descriptor shape. Millisecond
/// timestamps surface as float seconds.
pub fn project_descriptor(dep: &Deployment) -> RuntimeDescriptor {
    RuntimeDescriptor {
        version: annotation(dep, fields::VERSION).unwrap_or_default().to_string(),
        created: annotation_i64(dep, fields::CREATED) as f64 / 1000.0,
        updated: annotation_i64(dep, fields::UPDATED) as f64 / 1000.0,
        name: runtime_id(dep),
        hostname: annotation(dep, fields::HOSTNAME).unwrap_or_default().to_string(),
        status: annotation(dep, fields::STATUS).unwrap_or_default().to_string(),
        key: annotation(dep, fields::SECRET).unwrap_or_default().to_string(),
        listening: annotation_bit(dep, fields::LISTENING),
        image: annotation(dep, fields::IMAGE).unwrap_or_default().to_string(),
        initialised: annotation_bit(dep, fields::INITIALISED),
    }
}

pub fn replicas(dep: &Deployment) -> i32 {
    dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

pub fn ready_replicas(dep: &Deployment) -> i32 {
    dep.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct RuntimeState {
    client: kube::Client,
    namespace: String,
    http: reqwest::Client,
}

impl RuntimeState {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Read the runtime Deployment; 404 reads as absence.
    pub async fn get(&self, id: &str) -> Result<Option<Deployment>, kube::Error> {
        match self.deployments().get(&deployment_name(id)).await {
            Ok(dep) => Ok(Some(dep)),
            Err(e) if is_kube_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool, kube::Error> {
        Ok(self.get(id).await?.is_some())
    }

    pub async fn status(&self, id: &str) -> Result<Option<RuntimeStatus>, kube::Error> {
        Ok(self.get(id).await?.as_ref().map(project_status))
    }

    /// Replace the given annotation fields in a single JSON-patch. Last
    /// write wins; all fields are chosen to be idempotent under races.
    pub async fn update(&self, id: &str, patch: &[(&str, String)]) -> Result<(), kube::Error> {
        let ops: Vec<Value> = patch
            .iter()
            .map(|(field, value)| {
                json!({
                    "op": "replace",
                    "path": annotation_pointer(field),
                    "value": value,
                })
            })
            .collect();
        let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops))
            .expect("replace operations form a valid JSON patch");
        self.deployments()
            .patch(
                &deployment_name(id),
                &PatchParams::default(),
                &Patch::Json::<()>(patch),
            )
            .await?;
        Ok(())
    }

    /// Annotation patches are an optimization, not state; callers that can
    /// make progress without them go through here.
    pub async fn update_swallowed(&self, id: &str, patch: &[(&str, String)]) {
        if let Err(e) = self.update(id, patch).await {
            tracing::warn!(runtime = id, error = %e, "annotation patch dropped");
        }
    }

    pub async fn set_replicas(&self, id: &str, count: i32) -> Result<(), kube::Error> {
        let patch: json_patch::Patch = serde_json::from_value(json!([
            {"op": "replace", "path": "/spec/replicas", "value": count}
        ]))
        .expect("replicas replace forms a valid JSON patch");
        self.deployments()
            .patch(
                &deployment_name(id),
                &PatchParams::default(),
                &Patch::Json::<()>(patch),
            )
            .await?;
        Ok(())
    }

    /// Poll status every 500 ms until it leaves `pending`.
    pub async fn wait_ready(&self, id: &str, timeout: Duration) -> Result<RuntimeStatus, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status(id).await {
                Ok(Some(status)) if status.status != STATUS_PENDING => return Ok(status),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(runtime = id, error = %e, "status poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::runtime_timeout(format!(
                    "Runtime {id} was not ready in time"
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Probe the in-pod server on port 3000 until any TCP-level response
    /// arrives. Application status codes do not matter; only connectivity
    /// does.
    pub async fn wait_listening(&self, pod_ip: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let url = format!("http://{pod_ip}:3000/");
        loop {
            let attempt = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if attempt.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn deployment(annotations: &[(&str, &str)]) -> Deployment {
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (annotation_key(k), v.to_string()))
            .collect();
        let mut label_map = BTreeMap::new();
        label_map.insert(labels::RUNTIME_ID.to_string(), "r1".to_string());
        Deployment {
            metadata: ObjectMeta {
                name: Some("dep-r1".to_string()),
                annotations: Some(annotations),
                labels: Some(label_map),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn names_carry_fixed_prefixes() {
        assert_eq!(deployment_name("abc"), "dep-abc");
        assert_eq!(service_name("abc"), "svc-abc");
    }

    #[test]
    fn pointer_escapes_the_annotation_prefix() {
        assert_eq!(
            annotation_pointer("last-execution-time"),
            "/metadata/annotations/appwrite.io~1last-execution-time"
        );
    }

    #[test]
    fn status_projection_reads_bits_and_timestamps() {
        let dep = deployment(&[
            ("status", "Up 3s"),
            ("initialised", "1"),
            ("listening", "0"),
            ("created", "1700000000000"),
            ("updated", "1700000001000"),
        ]);
        let status = project_status(&dep);
        assert_eq!(status.status, "Up 3s");
        assert_eq!(status.initialised, 1);
        assert_eq!(status.listening, 0);
        assert_eq!(status.created, 1_700_000_000_000);
    }

    #[test]
    fn descriptor_converts_milliseconds_to_seconds() {
        let dep = deployment(&[
            ("version", "v5"),
            ("secret", "abc"),
            ("hostname", "def"),
            ("created", "1700000000500"),
            ("updated", "1700000001500"),
            ("status", "Up 1s"),
            ("initialised", "1"),
            ("listening", "1"),
            ("image", "img:v5"),
        ]);
        let descriptor = project_descriptor(&dep);
        assert_eq!(descriptor.name, "r1");
        assert_eq!(descriptor.key, "abc");
        assert_eq!(descriptor.created, 1_700_000_000.5);
        assert_eq!(descriptor.updated, 1_700_000_001.5);
        assert_eq!(descriptor.listening, 1);
    }

    #[test]
    fn missing_annotations_degrade_to_defaults() {
        let dep = deployment(&[]);
        let status = project_status(&dep);
        assert_eq!(status.status, "");
        assert_eq!(status.initialised, 0);
        assert_eq!(replicas(&dep), 0);
        assert_eq!(ready_replicas(&dep), 0);
    }
}
