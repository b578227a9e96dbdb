//! Background maintenance loop: under a cluster-wide lease, scale idle
//! runtimes back to zero replicas.

use std::time::Duration;

use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use kube::api::ListParams;

use crate::state::{self, RuntimeState, fields, labels, now_ms};

pub const LEASE_NAME: &str = "executor-maintenance-lock";

/// Leadership is considered valid this long without renewal; a stale
/// holder's lease is stolen past it.
const LEASE_DURATION: Duration = Duration::from_secs(30);

/// A warm runtime whose last execution is older than the threshold gets
/// scaled to zero.
pub fn should_reap(
    replicas: i32,
    last_execution_ms: i64,
    now_ms: i64,
    inactive_threshold: Duration,
) -> bool {
    replicas == 1 && now_ms - last_execution_ms > inactive_threshold.as_millis() as i64
}

pub struct Reaper {
    runtimes: RuntimeState,
    namespace: String,
    interval: Duration,
    inactive_threshold: Duration,
    leadership: LeaseLock,
    token: CancellationToken,
}

impl Reaper {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        hostname: &str,
        interval: Duration,
        inactive_threshold: Duration,
        token: CancellationToken,
    ) -> Self {
        // Unique identity per replica; PID disambiguates co-located
        // processes sharing a hostname.
        let holder_id = format!("{hostname}-{}", std::process::id());
        let leadership = LeaseLock::new(
            client.clone(),
            namespace,
            LeaseLockParams {
                holder_id,
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_DURATION,
            },
        );
        Self {
            runtimes: RuntimeState::new(client, namespace),
            namespace: namespace.to_string(),
            interval,
            inactive_threshold,
            leadership,
            token,
        }
    }

    pub async fn run(self) {
        println!("{}", "⚙️ Starting runtime reaper...".green());
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let lease = match self.leadership.try_acquire_or_renew().await {
                Ok(lease) => lease,
                Err(e) => {
                    // Without a readable lease we must assume another
                    // replica holds it.
                    tracing::warn!(error = %e, "lease acquire/renew failed");
                    continue;
                }
            };
            if !matches!(lease, LeaseLockResult::Acquired(_)) {
                continue;
            }
            self.sweep().await;
        }
        eprintln!("{}", "🛑 Runtime reaper stopped".red());
    }

    /// One pass over all runtime Deployments. Per-item errors are logged
    /// and the sweep continues.
    async fn sweep(&self) {
        let now = now_ms();
        let mut continue_token: Option<String> = None;
        loop {
            let params = ListParams {
                label_selector: Some(format!("{}={}", labels::ROLE, labels::ROLE_RUNTIME)),
                limit: Some(100),
                continue_token: continue_token.take(),
                ..Default::default()
            };
            let list = match self.runtimes.deployments().list(&params).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(namespace = %self.namespace, error = %e, "runtime list failed");
                    return;
                }
            };
            for dep in &list.items {
                if self.token.is_cancelled() {
                    return;
                }
                let last_execution = state::annotation(dep, fields::LAST_EXECUTION_TIME)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if !should_reap(
                    state::replicas(dep),
                    last_execution,
                    now,
                    self.inactive_threshold,
                ) {
                    continue;
                }
                let id = state::runtime_id(dep);
                match self.runtimes.set_replicas(&id, 0).await {
                    Ok(()) => {
                        tracing::info!(runtime = %id, "scaled idle runtime to zero");
                    }
                    Err(e) => {
                        tracing::warn!(runtime = %id, error = %e, "scale to zero failed");
                    }
                }
            }
            continue_token = list.metadata.continue_.filter(|t| !t.is_empty());
            if continue_token.is_none() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(300);

    #[test]
    fn reaps_only_warm_and_idle_runtimes() {
        let now = 1_000_000_000;
        // Idle past the threshold.
        assert!(should_reap(1, now - 400_000, now, THRESHOLD));
        // Active within the threshold.
        assert!(!should_reap(1, now - 200_000, now, THRESHOLD));
        // Already cold.
        assert!(!should_reap(0, now - 400_000, now, THRESHOLD));
    }

    #[test]
    fn threshold_boundary_is_exclusive() {
        let now = 1_000_000_000;
        assert!(!should_reap(1, now - 300_000, now, THRESHOLD));
        assert!(should_reap(1, now - 300_001, now, THRESHOLD));
    }

    #[test]
    fn missing_execution_timestamp_reads_as_forever_idle() {
        let now = 1_000_000_000;
        assert!(should_reap(1, 0, now, THRESHOLD));
    }
}
