pub mod config;
pub mod error;
pub mod executor;
pub mod hash;
pub mod health;
pub mod logging;
pub mod model;
pub mod policy;
pub mod remote;
pub mod resolver;
pub mod state;
pub mod webhook;
pub mod worker;

use crate::config::Config;
use crate::error::Result;
use crate::executor::Executor;
use crate::health::HealthMonitor;
use crate::remote::{RemoteApi, RemoteClient};
use crate::state::StateStore;
use crate::worker::Worker;
use std::sync::Arc;

/// Everything a running instance needs, assembled once at startup and
/// shared by the CLI commands, the webhook server, and the background
/// worker. Mirrors this codebase's convention of a single struct gluing
/// together storage, remotes, and the operation layer rather than passing
/// each piece through every function signature.
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: StateStore,
    pub cloud: Arc<dyn RemoteApi>,
    pub local: Arc<dyn RemoteApi>,
    pub executor: Arc<Executor>,
}

impl AppContext {
    /// Loads configuration, opens the state store, and constructs both
    /// remote clients. Returns a `Configuration` error (never panics) if
    /// required settings are missing, per §7.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let store = StateStore::open(&config.state_db_path).await?;

        let cloud_endpoint = config
            .cloud
            .as_ref()
            .ok_or_else(|| error::SyncError::Configuration("cloud endpoint not configured".to_string()))?;
        let local_endpoint = config
            .local
            .as_ref()
            .ok_or_else(|| error::SyncError::Configuration("local endpoint not configured".to_string()))?;

        let cloud: Arc<dyn RemoteApi> =
            Arc::new(RemoteClient::new(cloud_endpoint, config.request_timeout())?);
        let local: Arc<dyn RemoteApi> =
            Arc::new(RemoteClient::new(local_endpoint, config.request_timeout())?);

        let executor = Arc::new(Executor::new(
            cloud.clone(),
            local.clone(),
            store.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            cloud,
            local,
            executor,
        })
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.store.clone(), self.cloud.clone(), self.local.clone())
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.store.clone(), self.executor.clone(), self.config.clone())
    }

    pub fn webhook_router(&self) -> axum::Router {
        webhook::router(webhook::WebhookState {
            store: self.store.clone(),
            config: self.config.clone(),
        })
    }
}
