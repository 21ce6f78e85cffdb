//! Per-host job supervisor.
//!
//! A [`Broker`] pulls its [`Configuration`](crate::config::Configuration) and
//! then jobs from the manager, runs each job's worker as a subprocess, merges
//! the worker's output into the document store and reports the job back as
//! finished or failed.
//!
//! # Scheduling
//!
//! One supervisor loop owns the [`PendingSet`]. Each running worker is awaited
//! by its own task, which hands a [`JobOutcome`] back to the loop; the loop is
//! the only place jobs are added or removed, so the pending set never exceeds
//! `max_concurrency`.
//!
//! # Shutdown
//!
//! When the shutdown token fires every worker's process group receives
//! SIGTERM, then SIGKILL after `kill_grace`. `run` returns only after every
//! worker has been reaped, and fails with
//! [`Supervision`](PyplnError::Supervision) if one could not be.

pub mod monitor;
pub mod pending;

pub use monitor::{Monitor, MonitoringSnapshot};
pub use pending::{PendingJob, PendingSet};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{PyplnError, Result};
use crate::protocol::{JobAssignment, JobId, NEW_JOB_TOPIC};
use crate::store::{Document, DocumentStore, FileStore, MonitoringSink};
use crate::transport::{BroadcastSource, ManagerApi, ManagerClient, Subscription};
use crate::worker::{InputKind, WorkerExecutor, WorkerRegistry, WorkerSpec};

/// Result of one job, handed from its task back to the supervisor loop.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub duration: Duration,
    pub result: Result<()>,
}

pub struct Broker<A> {
    config: BrokerConfig,
    client: ManagerClient<A>,
    registry: WorkerRegistry,
    store: Option<Arc<dyn DocumentStore>>,
    sink: Option<Arc<dyn MonitoringSink>>,
    subscription: Option<Subscription<Box<dyn BroadcastSource>>>,
    cluster_ip: Option<IpAddr>,
}

impl<A: ManagerApi + 'static> Broker<A> {
    pub fn new(config: BrokerConfig, client: ManagerClient<A>, registry: WorkerRegistry) -> Self {
        Self {
            config,
            client,
            registry,
            store: None,
            sink: None,
            subscription: None,
            cluster_ip: None,
        }
    }

    /// Use `store` instead of opening the file store named by the manager's
    /// configuration.
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: DocumentStore + MonitoringSink + 'static,
    {
        self.store = Some(store.clone() as Arc<dyn DocumentStore>);
        self.sink = Some(store as Arc<dyn MonitoringSink>);
        self
    }

    /// Poll the manager as soon as it announces a new job instead of waiting
    /// for the next tick.
    pub fn with_broadcasts(mut self, source: impl BroadcastSource + 'static) -> Self {
        let mut subscription = Subscription::new(Box::new(source) as Box<dyn BroadcastSource>);
        subscription.subscribe(NEW_JOB_TOPIC);
        self.subscription = Some(subscription);
        self
    }

    /// Address reported as `cluster ip` in monitoring snapshots.
    pub fn with_cluster_ip(mut self, ip: IpAddr) -> Self {
        self.cluster_ip = Some(ip);
        self
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Broker {
            config,
            client,
            registry,
            store,
            sink,
            mut subscription,
            cluster_ip,
        } = self;
        config.validate()?;

        let configuration = client.get_configuration().await?;
        let monitoring_interval = configuration.monitoring_interval()?;
        tracing::info!(
            max_concurrency = config.max_concurrency,
            monitoring_interval = configuration.monitoring_interval,
            workers = registry.len(),
            "Broker started"
        );

        let (store, sink) = match (store, sink) {
            (Some(store), Some(sink)) => (store, sink),
            _ => {
                let file_store = Arc::new(FileStore::open(&configuration.store).await?);
                (
                    file_store.clone() as Arc<dyn DocumentStore>,
                    file_store as Arc<dyn MonitoringSink>,
                )
            }
        };

        let supervisor = Supervisor {
            executor: WorkerExecutor::new(config.kill_grace()),
            config,
            client,
            registry,
            store,
        };

        let mut pending = PendingSet::new(supervisor.config.max_concurrency);
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let jobs_cancel = CancellationToken::new();
        let mut monitor = Monitor::new(cluster_ip);

        let mut monitor_tick = tokio::time::interval(monitoring_interval);
        monitor_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_tick = tokio::time::interval(supervisor.config.poll_interval());
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll_interval = supervisor.config.poll_interval();

        let mut failure = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            supervisor
                .fill_slots(&mut pending, &mut tasks, &jobs_cancel)
                .await;

            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(joined) = tasks.join_next() => {
                    if let Err(e) = supervisor.finish_job(&mut pending, joined).await {
                        failure = Some(e);
                        break;
                    }
                }

                _ = monitor_tick.tick() => {
                    match monitor.snapshot_blocking(pending.iter().cloned().collect()).await {
                        Ok(snapshot) => {
                            if let Err(e) = sink.insert_snapshot(&snapshot).await {
                                tracing::warn!(error = %e, "Failed to store monitoring snapshot");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to take monitoring snapshot"),
                    }
                }

                _ = poll_tick.tick() => {}

                woke = next_broadcast(subscription.as_mut(), poll_interval) => {
                    if let Err(e) = woke {
                        tracing::warn!(error = %e, "Lost broadcast channel, falling back to polling");
                        if let Some(mut subscription) = subscription.take() {
                            subscription.close().await;
                        }
                    }
                }
            }
        }

        tracing::info!(running = pending.len(), "Broker shutting down");
        jobs_cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = supervisor.finish_job(&mut pending, joined).await {
                failure.get_or_insert(e);
            }
        }

        if let Some(mut subscription) = subscription {
            subscription.close().await;
        }
        supervisor.client.close().await;

        match failure {
            Some(e) => {
                tracing::error!(error = %e, "Broker stopped with a supervision failure");
                Err(e)
            }
            None => {
                tracing::info!("Broker stopped");
                Ok(())
            }
        }
    }
}

/// Wait for a matching broadcast, or forever when there is no subscription.
async fn next_broadcast(
    subscription: Option<&mut Subscription<Box<dyn BroadcastSource>>>,
    timeout: Duration,
) -> Result<Option<String>> {
    match subscription {
        Some(subscription) => subscription.poll(timeout).await,
        None => std::future::pending().await,
    }
}

/// The parts of a broker shared by the loop and its completion handling.
struct Supervisor<A> {
    config: BrokerConfig,
    client: ManagerClient<A>,
    registry: WorkerRegistry,
    executor: WorkerExecutor,
    store: Arc<dyn DocumentStore>,
}

impl<A: ManagerApi> Supervisor<A> {
    /// Ask for jobs until the pending set is full or the manager has none.
    async fn fill_slots(
        &self,
        pending: &mut PendingSet,
        tasks: &mut JoinSet<JobOutcome>,
        cancel: &CancellationToken,
    ) {
        while pending.has_capacity() {
            match self.client.get_job().await {
                Ok(Some(assignment)) => self.start_job(assignment, pending, tasks, cancel).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to get job");
                    break;
                }
            }
        }
    }

    async fn start_job(
        &self,
        assignment: JobAssignment,
        pending: &mut PendingSet,
        tasks: &mut JoinSet<JobOutcome>,
        cancel: &CancellationToken,
    ) {
        let JobAssignment {
            job_id,
            worker,
            document,
        } = assignment;
        let started = Instant::now();

        if pending.get(&job_id).is_some() {
            tracing::debug!(job_id = %job_id, "Job already running here");
            return;
        }

        let Some(spec) = self.registry.get(&worker) else {
            tracing::warn!(job_id = %job_id, worker = %worker, "Worker not found");
            let error = PyplnError::WorkerNotFound(worker);
            self.notify(&job_id, started.elapsed(), Some(&error.to_string()))
                .await;
            return;
        };

        let running = match resolve_input(self.store.as_ref(), spec, &document).await {
            Ok(input) => self.executor.spawn(spec, &input),
            Err(e) => Err(e),
        };
        let running = match running {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!(job_id = %job_id, worker = %worker, error = %e, "Job could not start");
                self.notify(&job_id, started.elapsed(), Some(&e.to_string()))
                    .await;
                return;
            }
        };

        tracing::info!(job_id = %job_id, worker = %worker, document = %document, pid = running.pid(), "Job started");
        pending.insert(PendingJob {
            job_id: job_id.clone(),
            worker,
            document: document.clone(),
            pid: running.pid(),
            started_at: Utc::now(),
        });

        let store = self.store.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let spawned = Instant::now();
            let result = running.wait(&cancel).await;
            let duration = spawned.elapsed();
            let result = match result {
                Ok(updates) => apply_updates(store.as_ref(), &document, updates).await,
                Err(e) => Err(e),
            };
            JobOutcome {
                job_id,
                duration,
                result,
            }
        });
    }

    /// Remove a completed job from the pending set and report it. Only a
    /// supervision failure is returned.
    async fn finish_job(
        &self,
        pending: &mut PendingSet,
        joined: std::result::Result<JobOutcome, JoinError>,
    ) -> Result<()> {
        let outcome =
            joined.map_err(|e| PyplnError::Supervision(format!("job task failed: {}", e)))?;
        let job = pending.remove(&outcome.job_id);
        let worker = job.as_ref().map(|j| j.worker.as_str()).unwrap_or("?");

        match outcome.result {
            Ok(()) => {
                tracing::info!(
                    job_id = %outcome.job_id,
                    worker,
                    duration = outcome.duration.as_secs_f64(),
                    "Job finished"
                );
                self.notify(&outcome.job_id, outcome.duration, None).await;
                Ok(())
            }
            Err(PyplnError::Interrupted) => {
                tracing::info!(job_id = %outcome.job_id, worker, "Job interrupted by shutdown");
                self.notify(&outcome.job_id, outcome.duration, Some("interrupted by broker shutdown"))
                    .await;
                Ok(())
            }
            Err(PyplnError::Supervision(message)) => {
                tracing::error!(job_id = %outcome.job_id, worker, error = %message, "Worker could not be reaped");
                self.notify(&outcome.job_id, outcome.duration, Some(&message))
                    .await;
                Err(PyplnError::Supervision(message))
            }
            Err(e) => {
                tracing::warn!(job_id = %outcome.job_id, worker, error = %e, "Job failed");
                self.notify(&outcome.job_id, outcome.duration, Some(&e.to_string()))
                    .await;
                Ok(())
            }
        }
    }

    /// Send `job finished` (or `job error` when `error` is set), retrying
    /// transport failures.
    async fn notify(&self, job_id: &JobId, duration: Duration, error: Option<&str>) {
        let attempts = self.config.notify_retries + 1;
        for attempt in 1..=attempts {
            let sent = match error {
                None => self.client.job_finished(job_id, duration).await,
                Some(error) => self.client.job_error(job_id, duration, error).await,
            };
            match sent {
                Ok(_) => return,
                Err(PyplnError::Manager(message)) => {
                    tracing::warn!(job_id = %job_id, error = %message, "Manager rejected completion");
                    return;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, attempt, error = %e, "Failed to report completion");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.notify_retry_delay_ms))
                            .await;
                    }
                }
            }
        }
        tracing::error!(job_id = %job_id, "Giving up on completion report");
    }
}

/// Build the stdin payload for `spec` from the document store.
pub async fn resolve_input(
    store: &dyn DocumentStore,
    spec: &WorkerSpec,
    document_id: &str,
) -> Result<Value> {
    let fields = match spec.input {
        InputKind::None => return Ok(json!({})),
        InputKind::Document => store.find_by_id(document_id).await?,
        InputKind::Blob => {
            let blob = store.get_blob(document_id).await?;
            let mut fields = match serde_json::to_value(&blob.info)? {
                Value::Object(fields) => fields,
                _ => Document::new(),
            };
            let contents = String::from_utf8(blob.contents).map_err(|e| {
                PyplnError::Worker(format!(
                    "blob {} is not UTF-8 text (invalid byte at offset {})",
                    document_id,
                    e.utf8_error().valid_up_to()
                ))
            })?;
            fields.insert("contents".to_string(), Value::String(contents));
            fields
        }
    };

    let mut fields = select_required(spec, fields)?;
    fields.insert("_id".to_string(), Value::String(document_id.to_string()));
    Ok(Value::Object(fields))
}

fn select_required(spec: &WorkerSpec, fields: Document) -> Result<Document> {
    if spec.requires.is_empty() {
        return Ok(fields);
    }
    let missing: Vec<&str> = spec
        .requires
        .iter()
        .filter(|key| !fields.contains_key(key.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(PyplnError::Worker(format!(
            "{} requires missing fields: {}",
            spec.name,
            missing.join(", ")
        )));
    }
    Ok(spec
        .requires
        .iter()
        .filter_map(|key| fields.get(key).map(|value| (key.clone(), value.clone())))
        .collect())
}

async fn apply_updates(store: &dyn DocumentStore, document: &str, mut updates: Document) -> Result<()> {
    updates.remove("_id");
    if updates.is_empty() {
        return Ok(());
    }
    store.update_fields(document, updates).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn document_input_keeps_only_required_fields() {
        let store = MemoryStore::new();
        store
            .update_fields("d1", json!({"key-a": "spam", "key-b": "eggs", "other": 1}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let spec = WorkerSpec::shell("echo", "cat").with_requires(["key-a", "key-b"]);

        let input = resolve_input(&store, &spec, "d1").await.unwrap();
        assert_eq!(input, json!({"_id": "d1", "key-a": "spam", "key-b": "eggs"}));
    }

    #[tokio::test]
    async fn missing_required_field_fails() {
        let store = MemoryStore::new();
        store
            .update_fields("d1", json!({"key-a": "spam"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let spec = WorkerSpec::shell("echo", "cat").with_requires(["key-a", "key-b"]);

        let err = resolve_input(&store, &spec, "d1").await.unwrap_err();
        assert!(err.to_string().contains("key-b"));
    }

    #[tokio::test]
    async fn missing_document_fails() {
        let store = MemoryStore::new();
        let spec = WorkerSpec::shell("echo", "cat");
        assert!(matches!(
            resolve_input(&store, &spec, "nope").await,
            Err(PyplnError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn no_input_skips_the_lookup() {
        let store = MemoryStore::new();
        let spec = WorkerSpec::shell("dummy", "true").with_input(InputKind::None);
        assert_eq!(resolve_input(&store, &spec, "xpto").await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn binary_blob_is_rejected() {
        let store = MemoryStore::new();
        let id = store
            .put_blob(vec![b'o', b'k', 0xff, 0xfe], "latin1.txt")
            .await
            .unwrap();
        let spec = WorkerSpec::shell("clone", "cat").with_input(InputKind::Blob);

        let err = resolve_input(&store, &spec, &id).await.unwrap_err();
        assert!(matches!(err, PyplnError::Worker(ref m) if m.contains("offset 2")));
    }

    #[tokio::test]
    async fn blob_input_carries_contents_and_info() {
        let store = MemoryStore::new();
        let id = store
            .put_blob(b"Now is better than never.".to_vec(), "this.txt")
            .await
            .unwrap();
        let spec = WorkerSpec::shell("clone", "cat").with_input(InputKind::Blob);

        let input = resolve_input(&store, &spec, &id).await.unwrap();
        assert_eq!(input["_id"], id.as_str());
        assert_eq!(input["name"], "this.txt");
        assert_eq!(input["length"], 25);
        assert_eq!(input["contents"], "Now is better than never.");
        assert!(input.get("upload date").is_some());
    }

    #[tokio::test]
    async fn worker_cannot_overwrite_the_id() {
        let store = MemoryStore::new();
        let updates = json!({"_id": "other", "text": "hi"}).as_object().cloned().unwrap();
        apply_updates(&store, "d1", updates).await.unwrap();
        let doc = store.find_by_id("d1").await.unwrap();
        assert!(doc.get("_id").is_none());
        assert_eq!(doc["text"], "hi");
    }
}
