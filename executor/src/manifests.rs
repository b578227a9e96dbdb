//! Resource templates for build Jobs, runtime Deployments/Services and
//! cleanup Jobs. The orchestrator fills in the parameters; everything here
//! is a pure value builder.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::args::S3Args;
use crate::models::RuntimeVersion;
use crate::state::labels;

pub const BUILD_CONTAINER: &str = "build-container";
pub const RUNTIME_CONTAINER: &str = "runtime-container";

/// Jobs clean themselves up an hour after finishing.
const JOB_TTL_SECONDS: i32 = 3600;

pub const BUILD_LOG_DIR: &str = "/tmp/logging";
pub const BUILD_LOG_FILE: &str = "/tmp/logging/logs.txt";
pub const BUILD_TIMING_FILE: &str = "/tmp/logging/timings.txt";
pub const BUILD_LOG_FILE_V2: &str = "/var/tmp/logs.txt";
pub const EXECUTION_LOG_DIR: &str = "/mnt/logs";

fn env_vars(map: &HashMap<String, String>) -> Vec<EnvVar> {
    let sorted: BTreeMap<&String, &String> = map.iter().collect();
    sorted
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn s3_env(s3: &S3Args) -> Vec<EnvVar> {
    vec![
        env_var("AWS_ACCESS_KEY_ID", &s3.access_key_id),
        env_var("AWS_SECRET_ACCESS_KEY", &s3.secret_access_key),
        env_var("AWS_DEFAULT_REGION", &s3.region),
        env_var("S3_ENDPOINT", &s3.endpoint),
        env_var("S3_BUCKET", &s3.bucket),
    ]
}

fn resource_limits(cpus: Option<f64>, memory: Option<u64>) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(cpus) = cpus {
        limits.insert("cpu".to_string(), Quantity(cpus.to_string()));
    }
    if let Some(memory) = memory {
        limits.insert("memory".to_string(), Quantity(format!("{memory}Mi")));
    }
    if limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        limits: Some(limits.clone()),
        requests: Some(limits),
        ..Default::default()
    })
}

fn label_map(role: &str, runtime_id: &str) -> BTreeMap<String, String> {
    let mut labels_map = BTreeMap::new();
    labels_map.insert(labels::ROLE.to_string(), role.to_string());
    labels_map.insert(labels::RUNTIME_ID.to_string(), runtime_id.to_string());
    labels_map
}

/// Shell body of the build container. The user command runs under
/// `script(1)` for v4/v5 so a timing file accrues next to the log; v2
/// predates timing files and tees plain output instead.
pub fn build_script(version: RuntimeVersion, output_directory: Option<&str>) -> String {
    let archive_dir = match output_directory {
        Some(dir) if !dir.is_empty() => format!("/usr/code/{dir}"),
        _ => "/usr/code".to_string(),
    };
    let run = match version {
        RuntimeVersion::V2 => {
            format!("sh -c \"$OPR_BUILD_COMMAND\" 2>&1 | tee {BUILD_LOG_FILE_V2}")
        }
        RuntimeVersion::V4 | RuntimeVersion::V5 => format!(
            "script --log-out {BUILD_LOG_FILE} --log-timing {BUILD_TIMING_FILE} --return --quiet -c \"$OPR_BUILD_COMMAND\""
        ),
    };
    format!(
        "set -e\n\
         mkdir -p /usr/code {BUILD_LOG_DIR}\n\
         if [ -f /mnt/code/source.tar.gz ]; then tar -xzf /mnt/code/source.tar.gz -C /usr/code; fi\n\
         cd /usr/code\n\
         {run}\n\
         tar -czf /tmp/artifact.tar.gz -C {archive_dir} .\n\
         aws s3 cp /tmp/artifact.tar.gz \"s3://$S3_BUCKET/$OPR_ARTIFACT_PATH\" --endpoint-url \"$S3_ENDPOINT\"\n"
    )
}

/// Shell body of the runtime container: fetch the recorded artifact, then
/// hand over to the image's own start script.
pub fn runtime_start_script(version: RuntimeVersion) -> String {
    let (code_dir, start) = match version {
        RuntimeVersion::V2 => ("/usr/code", "exec sh /usr/local/src/start.sh"),
        RuntimeVersion::V4 | RuntimeVersion::V5 => (
            "/usr/local/server/src/function",
            "exec sh /usr/local/server/helpers/start.sh",
        ),
    };
    format!(
        "set -e\n\
         if [ -n \"$OPR_ARTIFACT_PATH\" ]; then\n\
         \x20 aws s3 cp \"s3://$S3_BUCKET/$OPR_ARTIFACT_PATH\" /tmp/code.tar.gz --endpoint-url \"$S3_ENDPOINT\"\n\
         \x20 mkdir -p {code_dir}\n\
         \x20 tar -xzf /tmp/code.tar.gz -C {code_dir}\n\
         fi\n\
         {start}\n"
    )
}

pub struct BuildJobParams<'a> {
    pub job_name: &'a str,
    pub runtime_id: &'a str,
    pub image: &'a str,
    pub command_env: &'a str,
    pub artifact_path: &'a str,
    pub source_b64: Option<&'a str>,
    pub version: RuntimeVersion,
    pub variables: &'a HashMap<String, String>,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    pub output_directory: Option<&'a str>,
    pub s3: &'a S3Args,
}

pub fn build_job(params: &BuildJobParams) -> Job {
    let mut env = env_vars(params.variables);
    env.extend(s3_env(params.s3));
    env.push(env_var("OPR_BUILD_COMMAND", params.command_env));
    env.push(env_var("OPR_ARTIFACT_PATH", params.artifact_path));

    let code_mount = VolumeMount {
        name: "code".to_string(),
        mount_path: "/mnt/code".to_string(),
        ..Default::default()
    };

    // Source bytes travel base64 in the init container environment and land
    // in the shared volume before the build container starts.
    let init_containers = params.source_b64.map(|b64| {
        vec![Container {
            name: "source-init".to_string(),
            image: Some(params.image.to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf '%s' \"$OPR_SOURCE_B64\" | base64 -d > /mnt/code/source.tar.gz".to_string(),
            ]),
            env: Some(vec![env_var("OPR_SOURCE_B64", b64)]),
            volume_mounts: Some(vec![code_mount.clone()]),
            ..Default::default()
        }]
    });

    let build_container = Container {
        name: BUILD_CONTAINER.to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            build_script(params.version, params.output_directory),
        ]),
        env: Some(env),
        resources: resource_limits(params.cpus, params.memory),
        volume_mounts: Some(vec![code_mount]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(params.job_name.to_string()),
            labels: Some(label_map(labels::ROLE_BUILD, params.runtime_id)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(label_map(labels::ROLE_BUILD, params.runtime_id)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers,
                    containers: vec![build_container],
                    volumes: Some(vec![Volume {
                        name: "code".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct RuntimeDeploymentParams<'a> {
    pub name: &'a str,
    pub runtime_id: &'a str,
    pub image: &'a str,
    pub annotations: BTreeMap<String, String>,
    pub artifact_path: Option<&'a str>,
    pub version: RuntimeVersion,
    pub variables: &'a HashMap<String, String>,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    pub s3: &'a S3Args,
}

pub fn runtime_deployment(params: &RuntimeDeploymentParams) -> Deployment {
    let mut env = env_vars(params.variables);
    env.extend(s3_env(params.s3));
    env.push(env_var(
        "OPR_ARTIFACT_PATH",
        params.artifact_path.unwrap_or_default(),
    ));

    let container = Container {
        name: RUNTIME_CONTAINER.to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            runtime_start_script(params.version),
        ]),
        env: Some(env),
        resources: resource_limits(params.cpus, params.memory),
        volume_mounts: Some(vec![VolumeMount {
            name: "execution-logs".to_string(),
            mount_path: EXECUTION_LOG_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let mut selector = BTreeMap::new();
    selector.insert(
        labels::RUNTIME_ID.to_string(),
        params.runtime_id.to_string(),
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(params.name.to_string()),
            labels: Some(label_map(labels::ROLE_RUNTIME, params.runtime_id)),
            annotations: Some(params.annotations.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(0),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(label_map(labels::ROLE_RUNTIME, params.runtime_id)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "execution-logs".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn runtime_service(name: &str, runtime_id: &str) -> Service {
    let mut selector = BTreeMap::new();
    selector.insert(labels::RUNTIME_ID.to_string(), runtime_id.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(label_map(labels::ROLE_RUNTIME, runtime_id)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: 3000,
                target_port: Some(IntOrString::Int(3000)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Best-effort bulk delete of every artifact under the runtime's prefix.
pub fn cleanup_job(job_name: &str, runtime_id: &str, s3: &S3Args) -> Job {
    let container = Container {
        name: "cleanup-container".to_string(),
        image: Some("amazon/aws-cli:2".to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "aws s3 rm --recursive \"s3://$S3_BUCKET/{runtime_id}/\" --endpoint-url \"$S3_ENDPOINT\""
            ),
        ]),
        env: Some(s3_env(s3)),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            labels: Some(label_map(labels::ROLE_DELETE, runtime_id)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(label_map(labels::ROLE_DELETE, runtime_id)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{deployment_name, service_name};

    fn s3_args() -> S3Args {
        S3Args {
            endpoint: "http://minio:9000".to_string(),
            bucket: "artifacts".to_string(),
            access_key_id: "ak".to_string(),
            secret_access_key: "sk".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn build_job_shape() {
        let variables = HashMap::new();
        let s3 = s3_args();
        let job = build_job(&BuildJobParams {
            job_name: "build-r1-deadbeef",
            runtime_id: "r1",
            image: "img:v5",
            command_env: "npm install",
            artifact_path: "r1/b1.tar.gz",
            source_b64: Some("c29tZQ=="),
            version: RuntimeVersion::V5,
            variables: &variables,
            cpus: Some(1.0),
            memory: Some(512),
            output_directory: None,
            s3: &s3,
        });
        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(JOB_TTL_SECONDS));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(pod.containers[0].name, BUILD_CONTAINER);
        let script = &pod.containers[0].command.as_ref().unwrap()[2];
        assert!(script.contains("--log-timing /tmp/logging/timings.txt"));
        assert!(script.contains("aws s3 cp"));
    }

    #[test]
    fn v2_build_runs_without_timing_files() {
        let script = build_script(RuntimeVersion::V2, None);
        assert!(script.contains("tee /var/tmp/logs.txt"));
        assert!(!script.contains("--log-timing"));
    }

    #[test]
    fn output_directory_changes_the_archive_root() {
        let script = build_script(RuntimeVersion::V5, Some("dist"));
        assert!(script.contains("-C /usr/code/dist"));
    }

    #[test]
    fn deployment_starts_cold_with_selector_labels() {
        let variables = HashMap::new();
        let s3 = s3_args();
        let dep = runtime_deployment(&RuntimeDeploymentParams {
            name: &deployment_name("r1"),
            runtime_id: "r1",
            image: "img:v5",
            annotations: BTreeMap::new(),
            artifact_path: Some("r1/b1.tar.gz"),
            version: RuntimeVersion::V5,
            variables: &variables,
            cpus: None,
            memory: None,
            s3: &s3,
        });
        let spec = dep.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(0));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get("runtime-id"),
            Some(&"r1".to_string())
        );
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].name, RUNTIME_CONTAINER);
    }

    #[test]
    fn service_selects_runtime_pods_on_port_3000() {
        let svc = runtime_service(&service_name("r1"), "r1");
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(
            spec.selector.as_ref().unwrap().get("runtime-id"),
            Some(&"r1".to_string())
        );
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 3000);
    }

    #[test]
    fn cleanup_job_targets_the_runtime_prefix() {
        let job = cleanup_job("delete-r1-deadbeef", "r1", &s3_args());
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let script = &pod.containers[0].command.as_ref().unwrap()[2];
        assert!(script.contains("s3://$S3_BUCKET/r1/"));
        assert!(script.contains("--recursive"));
    }
}
