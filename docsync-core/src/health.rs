use crate::remote::RemoteApi;
use crate::state::StateStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one reachability probe, returned by the `test` CLI command and
/// the webhook server's `/health` route.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub healthy: bool,
    pub message: String,
    pub duration: Duration,
}

impl CheckResult {
    fn healthy(name: &str, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            message: message.into(),
            duration,
        }
    }

    fn unhealthy(name: &str, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            healthy: false,
            message: message.into(),
            duration,
        }
    }
}

/// Runs the three reachability checks named in §6's `test` command: the
/// state store, the cloud endpoint, and the local endpoint. Each runs
/// independently so one slow or unreachable side doesn't mask the others'
/// results.
pub struct HealthMonitor {
    store: StateStore,
    cloud: Arc<dyn RemoteApi>,
    local: Arc<dyn RemoteApi>,
}

impl HealthMonitor {
    pub fn new(store: StateStore, cloud: Arc<dyn RemoteApi>, local: Arc<dyn RemoteApi>) -> Self {
        Self { store, cloud, local }
    }

    pub async fn run_checks(&self) -> Vec<CheckResult> {
        vec![
            self.check_store().await,
            self.check_remote("cloud", self.cloud.as_ref()).await,
            self.check_remote("local", self.local.as_ref()).await,
        ]
    }

    pub async fn is_healthy(&self) -> bool {
        self.run_checks().await.iter().all(|r| r.healthy)
    }

    async fn check_store(&self) -> CheckResult {
        let start = Instant::now();
        match self.store.ping().await {
            Ok(()) => CheckResult::healthy("state_store", "reachable", start.elapsed()),
            Err(e) => CheckResult::unhealthy("state_store", e.to_string(), start.elapsed()),
        }
    }

    async fn check_remote(&self, name: &str, remote: &dyn RemoteApi) -> CheckResult {
        let start = Instant::now();
        match remote.ping().await {
            Ok(user) => CheckResult::healthy(name, format!("authenticated as {user}"), start.elapsed()),
            Err(e) => CheckResult::unhealthy(name, e.to_string(), start.elapsed()),
        }
    }
}
