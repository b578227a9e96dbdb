use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "opr-executor", about = "Kubernetes-backed function runtime executor")]
pub struct ExecutorArgs {
    /// Shared bearer secret required on every authenticated endpoint
    #[arg(long, env = "OPR_EXECUTOR_SECRET", required = true)]
    pub executor_secret: String,

    /// Namespace holding runtime Deployments, Services, Jobs and the lease
    #[arg(long, env = "KUBERNETES_NAMESPACE", default_value = "default")]
    pub namespace: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Seconds between reaper cycles
    #[arg(long, env = "OPR_EXECUTOR_MAINTENANCE_INTERVAL", default_value_t = 60)]
    pub maintenance_interval: u64,

    /// Idle seconds after which a warm runtime is scaled to zero
    #[arg(long, env = "OPR_EXECUTOR_INACTIVE_THRESHOLD", default_value_t = 300)]
    pub inactive_threshold: u64,

    /// Forwarded to in-pod servers as the executor hostname; also feeds the
    /// reaper's lease identity
    #[arg(long, env = "HOSTNAME", default_value = "")]
    pub hostname: String,

    #[clap(flatten)]
    pub s3: S3Args,
}

#[derive(Parser, Debug, Clone)]
pub struct S3Args {
    #[arg(long, env = "S3_ENDPOINT", required = true)]
    pub endpoint: String,

    #[arg(long, env = "S3_BUCKET", required = true)]
    pub bucket: String,

    #[arg(long, env = "S3_ACCESS_KEY_ID", required = true)]
    pub access_key_id: String,

    #[arg(long, env = "S3_SECRET_ACCESS_KEY", required = true)]
    pub secret_access_key: String,

    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub region: String,
}
