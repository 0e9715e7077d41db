use crate::error::{Result, SyncError};
use crate::policy::ConflictPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Endpoint credentials for one remote (cloud or local).
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub claim_batch: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            claim_batch: 10,
        }
    }
}

/// Top-level configuration, assembled from environment variables (with an
/// optional `.env` file loaded first) and/or a YAML file, per §6 of the
/// specification. Environment variables take precedence over file values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cloud: Option<EndpointConfig>,
    pub local: Option<EndpointConfig>,
    pub webhook_host: String,
    pub webhook_port: u16,
    pub webhook_secret: String,
    pub webhook_signature_header: String,
    pub doctypes: Vec<String>,
    pub excluded_fields: Vec<String>,
    pub conflict_resolution: ConflictPolicy,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub batch_size: u32,
    pub state_db_path: PathBuf,
    pub queue_retention_days: u32,
    pub log_level: String,
    pub request_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloud: None,
            local: None,
            webhook_host: "127.0.0.1".to_string(),
            webhook_port: 8080,
            webhook_secret: String::new(),
            webhook_signature_header: "X-Frappe-Webhook-Signature".to_string(),
            doctypes: Vec::new(),
            excluded_fields: Vec::new(),
            conflict_resolution: ConflictPolicy::LatestTimestamp,
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            batch_size: 50,
            state_db_path: PathBuf::from("docsync.db"),
            queue_retention_days: 30,
            log_level: "info".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Loads `.env` (if present), then an optional YAML file, then
    /// overlays environment variables, then validates required fields.
    /// Mirrors the `dotenvy`-then-`env::var` pattern used elsewhere in this
    /// codebase's remote clients, generalized to a full typed config.
    pub fn load(yaml_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match yaml_path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    SyncError::Configuration(format!("reading {}: {e}", path.display()))
                })?;
                serde_yaml::from_str(&contents).map_err(|e| {
                    SyncError::Configuration(format!("parsing {}: {e}", path.display()))
                })?
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        use std::env;

        macro_rules! overlay_endpoint {
            ($field:ident, $prefix:literal) => {
                let url = env::var(concat!($prefix, "_URL")).ok();
                let key = env::var(concat!($prefix, "_KEY")).ok();
                let secret = env::var(concat!($prefix, "_SECRET")).ok();
                if let (Some(url), Some(api_key), Some(api_secret)) = (url, key, secret) {
                    self.$field = Some(EndpointConfig {
                        url,
                        api_key,
                        api_secret,
                    });
                }
            };
        }

        overlay_endpoint!(cloud, "CLOUD");
        overlay_endpoint!(local, "LOCAL");

        if let Ok(v) = env::var("WEBHOOK_HOST") {
            self.webhook_host = v;
        }
        if let Ok(v) = env::var("WEBHOOK_PORT") {
            if let Ok(port) = v.parse() {
                self.webhook_port = port;
            }
        }
        if let Ok(v) = env::var("WEBHOOK_SECRET") {
            self.webhook_secret = v;
        }
        if let Ok(v) = env::var("WEBHOOK_SIGNATURE_HEADER") {
            self.webhook_signature_header = v;
        }
        if let Ok(v) = env::var("DOCTYPES") {
            self.doctypes = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("EXCLUDED_FIELDS") {
            self.excluded_fields = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("CONFLICT_RESOLUTION") {
            if let Ok(policy) = v.parse() {
                self.conflict_resolution = policy;
            }
        }
        if let Ok(v) = env::var("RETRY_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
        if let Ok(v) = env::var("RETRY_BACKOFF_SECONDS") {
            if let Ok(n) = v.parse() {
                self.retry.backoff_seconds = n;
            }
        }
        if let Ok(v) = env::var("WORKER_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.worker.poll_interval_ms = n;
            }
        }
        if let Ok(v) = env::var("WORKER_CLAIM_BATCH") {
            if let Ok(n) = v.parse() {
                self.worker.claim_batch = n;
            }
        }
        if let Ok(v) = env::var("BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.batch_size = n;
            }
        }
        if let Ok(v) = env::var("QUEUE_RETENTION_DAYS") {
            if let Ok(n) = v.parse() {
                self.queue_retention_days = n;
            }
        }
        if let Ok(v) = env::var("STATE_DB_PATH") {
            self.state_db_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cloud.is_none() || self.local.is_none() {
            return Err(SyncError::Configuration(
                "both cloud and local endpoint credentials must be configured".to_string(),
            ));
        }
        if self.webhook_secret.is_empty() {
            tracing::warn!(
                "webhook_secret is empty: signature verification is DISABLED (development mode only)"
            );
        }
        Ok(())
    }

    pub fn all_excluded_fields(&self) -> Vec<String> {
        let mut fields = crate::hash::default_excluded_fields();
        fields.extend(self.excluded_fields.iter().cloned());
        fields
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_endpoints() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));
    }

    #[test]
    fn validate_accepts_configured_endpoints() {
        let mut config = Config::default();
        config.cloud = Some(EndpointConfig {
            url: "https://cloud.example".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
        });
        config.local = Some(EndpointConfig {
            url: "http://localhost".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn all_excluded_fields_merges_defaults_with_extras() {
        let mut config = Config::default();
        config.excluded_fields = vec!["internal_note".to_string()];
        let fields = config.all_excluded_fields();
        assert!(fields.contains(&"modified".to_string()));
        assert!(fields.contains(&"internal_note".to_string()));
    }
}
