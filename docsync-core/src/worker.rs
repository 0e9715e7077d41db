use crate::config::Config;
use crate::executor::Executor;
use crate::resolver::DirectionHint;
use crate::state::models::WebhookQueueItem;
use crate::state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A queue item is abandoned after this many failed attempts rather than
/// retried forever, per §4.6.
const MAX_QUEUE_ATTEMPTS: u32 = 10;

/// How often the run loop sweeps processed queue rows past the retention
/// window (§3's "policy-defined window, default 30 days"), interleaved with
/// the poll loop rather than run on its own task.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Drains the webhook intake queue in the background: claim a batch, sync
/// each claimed key, mark done or failed, repeat. Mirrors the claim-lease-
/// execute loop shape used elsewhere in this codebase's dispatcher, with
/// the lease itself owned by `StateStore::claim_webhook_batch`.
pub struct Worker {
    store: StateStore,
    executor: Arc<Executor>,
    config: Arc<Config>,
}

impl Worker {
    pub fn new(store: StateStore, executor: Arc<Executor>, config: Arc<Config>) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Runs until `shutdown` is signalled. A fresh process first clears any
    /// `is_syncing` claims left behind by a crash (§5), since the
    /// in-process per-key mutex map starts empty and could never otherwise
    /// reclaim them.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.store.clear_all_syncing_claims().await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(cleared = n, "cleared stale sync claims from a prior run"),
            Err(e) => tracing::error!(error = %e, "failed to clear stale sync claims at startup"),
        }

        let poll_interval = Duration::from_millis(self.config.worker.poll_interval_ms);
        tracing::info!(
            poll_interval_ms = self.config.worker.poll_interval_ms,
            batch = self.config.worker.claim_batch,
            "webhook worker started"
        );

        let mut prune_tick = tokio::time::interval(PRUNE_INTERVAL);
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = prune_tick.tick() => self.prune().await,
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "webhook worker: batch processing failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        tracing::info!("webhook worker stopped");
    }

    /// Claims and processes one batch, returning how many items were
    /// claimed (0 means the queue was empty and the caller should sleep).
    /// Public so tests can drive a single drain pass without running the
    /// full poll loop.
    pub async fn process_batch(&self) -> crate::error::Result<usize> {
        let batch = self.store.claim_webhook_batch(self.config.worker.claim_batch).await?;
        let count = batch.len();
        for item in batch {
            self.process_item(item).await;
        }
        Ok(count)
    }

    async fn process_item(&self, item: WebhookQueueItem) {
        let hint = match item.source.as_str() {
            "cloud" => DirectionHint::Cloud,
            "local" => DirectionHint::Local,
            _ => DirectionHint::None,
        };

        let outcome = self.executor.sync_one(&item.doctype, &item.docname, hint).await;

        match outcome {
            crate::executor::Outcome::Failed(e) => {
                // Non-retryable errors (auth, validation, configuration) won't
                // succeed on a later attempt, so abandon immediately instead
                // of burning the retry ceiling.
                if !e.is_retryable() || item.attempts + 1 >= MAX_QUEUE_ATTEMPTS {
                    tracing::error!(
                        id = item.id,
                        doctype = item.doctype,
                        docname = item.docname,
                        attempts = item.attempts + 1,
                        retryable = e.is_retryable(),
                        "abandoning webhook item"
                    );
                    if let Err(e) = self.store.mark_webhook_done(item.id).await {
                        tracing::error!(error = %e, "failed to close out an abandoned webhook item");
                    }
                } else if let Err(mark_err) = self.store.mark_webhook_failed(item.id, &e.to_string()).await {
                    tracing::error!(error = %mark_err, "failed to record a failed webhook item");
                }
            }
            _ => {
                if let Err(e) = self.store.mark_webhook_done(item.id).await {
                    tracing::error!(id = item.id, error = %e, "failed to mark webhook item done");
                }
            }
        }
    }

    /// Periodic housekeeping: drop processed queue rows past the retention
    /// window. Intended to be called on its own slower interval by the
    /// caller (the CLI's long-running `webhook` command), not from the
    /// main poll loop.
    pub async fn prune(&self) {
        match self.store.prune_webhook_queue(self.config.queue_retention_days).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(pruned = n, "pruned processed webhook queue entries"),
            Err(e) => tracing::error!(error = %e, "failed to prune webhook queue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, RetryConfig, WorkerConfig};
    use crate::model::Document;
    use crate::remote::{RemoteApi, UpdateOutcome};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockRemote {
        docs: StdMutex<HashMap<(String, String), Document>>,
    }

    impl MockRemote {
        fn with_doc(doctype: &str, name: &str, fields: Value) -> Self {
            let remote = Self::default();
            remote.docs.lock().unwrap().insert(
                (doctype.to_string(), name.to_string()),
                Document::new(fields.as_object().unwrap().clone()),
            );
            remote
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemote {
        async fn get(&self, doctype: &str, name: &str) -> crate::error::Result<Option<Document>> {
            Ok(self
                .docs
                .lock()
                .unwrap()
                .get(&(doctype.to_string(), name.to_string()))
                .cloned())
        }

        async fn list(
            &self,
            _doctype: &str,
            _filters: Option<&str>,
            _limit: u32,
            _offset: u32,
        ) -> crate::error::Result<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn create(&self, doctype: &str, mut fields: Map<String, Value>) -> crate::error::Result<Document> {
            let name = fields
                .get("name")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| "generated".to_string());
            fields.insert("name".to_string(), Value::String(name.clone()));
            fields.insert("modified".to_string(), Value::String("2025-01-01T00:00:00Z".to_string()));
            let doc = Document::new(fields);
            self.docs.lock().unwrap().insert((doctype.to_string(), name), doc.clone());
            Ok(doc)
        }

        async fn update(
            &self,
            doctype: &str,
            name: &str,
            mut fields: Map<String, Value>,
        ) -> crate::error::Result<UpdateOutcome> {
            fields.insert("name".to_string(), Value::String(name.to_string()));
            fields.insert("modified".to_string(), Value::String("2025-01-02T00:00:00Z".to_string()));
            let doc = Document::new(fields);
            self.docs
                .lock()
                .unwrap()
                .insert((doctype.to_string(), name.to_string()), doc.clone());
            Ok(UpdateOutcome {
                document: doc,
                retried: false,
            })
        }

        async fn delete(&self, doctype: &str, name: &str) -> crate::error::Result<()> {
            self.docs.lock().unwrap().remove(&(doctype.to_string(), name.to_string()));
            Ok(())
        }

        async fn ping(&self) -> crate::error::Result<String> {
            Ok("mock".to_string())
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            cloud: Some(EndpointConfig {
                url: "https://cloud.example".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
            }),
            local: Some(EndpointConfig {
                url: "http://localhost".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
            }),
            retry: RetryConfig::default(),
            worker: WorkerConfig {
                poll_interval_ms: 10,
                claim_batch: 10,
            },
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn processing_a_queued_item_syncs_it_and_marks_it_done() {
        let store = StateStore::open_in_memory().await.unwrap();
        let cloud = MockRemote::with_doc(
            "Customer",
            "C1",
            json!({"name": "C1", "customer_name": "Acme", "modified": "2025-01-01T10:00:00Z"}),
        );
        let local = MockRemote::default();
        let config = test_config();
        let executor = Arc::new(Executor::new(Arc::new(cloud), Arc::new(local), store.clone(), config.clone()));
        let worker = Worker::new(store.clone(), executor, config);

        store.enqueue_webhook("cloud", "Customer", "C1", "update", None).await.unwrap();
        let processed = worker.process_batch().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(store.pending_webhook_count().await.unwrap(), 0);
    }

    #[derive(Default)]
    struct UnauthorizedRemote;

    #[async_trait]
    impl RemoteApi for UnauthorizedRemote {
        async fn get(&self, _doctype: &str, _name: &str) -> crate::error::Result<Option<Document>> {
            Err(crate::error::SyncError::Unauthorized("bad api key".into()))
        }

        async fn list(
            &self,
            _doctype: &str,
            _filters: Option<&str>,
            _limit: u32,
            _offset: u32,
        ) -> crate::error::Result<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn create(&self, _doctype: &str, _fields: Map<String, Value>) -> crate::error::Result<Document> {
            Err(crate::error::SyncError::Unauthorized("bad api key".into()))
        }

        async fn update(
            &self,
            _doctype: &str,
            _name: &str,
            _fields: Map<String, Value>,
        ) -> crate::error::Result<UpdateOutcome> {
            Err(crate::error::SyncError::Unauthorized("bad api key".into()))
        }

        async fn delete(&self, _doctype: &str, _name: &str) -> crate::error::Result<()> {
            Err(crate::error::SyncError::Unauthorized("bad api key".into()))
        }

        async fn ping(&self) -> crate::error::Result<String> {
            Err(crate::error::SyncError::Unauthorized("bad api key".into()))
        }
    }

    #[tokio::test]
    async fn a_non_retryable_failure_is_abandoned_on_the_first_attempt() {
        let store = StateStore::open_in_memory().await.unwrap();
        let config = test_config();
        let executor = Arc::new(Executor::new(
            Arc::new(UnauthorizedRemote),
            Arc::new(MockRemote::default()),
            store.clone(),
            config.clone(),
        ));
        let worker = Worker::new(store.clone(), executor, config);

        store.enqueue_webhook("cloud", "Customer", "C1", "update", None).await.unwrap();
        let processed = worker.process_batch().await.unwrap();
        assert_eq!(processed, 1);
        // Abandoned immediately rather than left for a retry, since an
        // Unauthorized error can't succeed on a later attempt.
        assert_eq!(store.pending_webhook_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn an_empty_queue_processes_nothing() {
        let store = StateStore::open_in_memory().await.unwrap();
        let config = test_config();
        let executor = Arc::new(Executor::new(
            Arc::new(MockRemote::default()),
            Arc::new(MockRemote::default()),
            store.clone(),
            config.clone(),
        ));
        let worker = Worker::new(store, executor, config);
        assert_eq!(worker.process_batch().await.unwrap(), 0);
    }
}
