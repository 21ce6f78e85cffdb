//! The authoritative job queue and broadcast hub.
//!
//! [`Manager`] owns all queue state and runs as a single task: requests arrive
//! one at a time over an mpsc channel and each is answered before the next is
//! read, so no locking is needed. Brokers and pipelines reach it either
//! in-process through a [`ManagerHandle`] or over TCP through a
//! [`ManagerServer`].

pub mod job;
pub mod queue;
pub mod server;

pub use job::{Job, JobStatus};
pub use queue::{Completion, JobQueue};
pub use server::ManagerServer;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{DeliveryMode, ManagerConfig};
use crate::error::{PyplnError, Result};
use crate::protocol::{
    job_error_topic, job_finished_topic, Ack, JobAdded, JobId, JobReply, Request, NEW_JOB_TOPIC,
};
use crate::transport::{BroadcastSource, ManagerApi};

const BROADCAST_CAPACITY: usize = 1024;
const MESSAGE_CAPACITY: usize = 100;

/// Message types for the manager event loop
#[derive(Debug)]
pub enum ManagerMessage {
    Request {
        request: Request,
        response_tx: oneshot::Sender<Value>,
    },
}

pub struct Manager {
    config: ManagerConfig,
    queue: JobQueue,
    broadcast_tx: broadcast::Sender<String>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> (Self, ManagerHandle, mpsc::Receiver<ManagerMessage>) {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CAPACITY);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let handle = ManagerHandle {
            message_tx,
            broadcast_tx: broadcast_tx.clone(),
        };
        let manager = Self {
            queue: JobQueue::with_capacity(config.max_jobs),
            config,
            broadcast_tx,
        };

        (manager, handle, message_rx)
    }

    /// Start the manager loop on the current runtime.
    pub fn spawn(config: ManagerConfig, shutdown: CancellationToken) -> (ManagerHandle, JoinHandle<()>) {
        let (manager, handle, rx) = Self::new(config);
        let task = tokio::spawn(manager.run(rx, shutdown));
        (handle, task)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, mut message_rx: mpsc::Receiver<ManagerMessage>, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(delivery = ?self.config.delivery, "Manager started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                msg = message_rx.recv() => {
                    let Some(ManagerMessage::Request { request, response_tx }) = msg else {
                        break;
                    };
                    let reply = self.handle_request(request);
                    let _ = response_tx.send(reply);
                }

                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }

        tracing::info!(jobs = self.queue.len(), "Manager stopped");
    }

    /// Serve one request and return the reply payload.
    pub fn handle_request(&mut self, request: Request) -> Value {
        tracing::debug!(command = request.command(), "Manager request");
        match request {
            Request::GetConfiguration => to_reply(&self.config.configuration),

            Request::GetJob => match self.queue.next_job() {
                Some(job) => {
                    tracing::info!(job_id = %job.id, worker = %job.worker, document = %job.document, "Job assigned");
                    to_reply(&JobReply::from(job.assignment()))
                }
                None => to_reply(&JobReply::none()),
            },

            Request::AddJob { worker, document } => {
                let job = Job::new(worker, document);
                let job_id = job.id.clone();
                let worker = job.worker.clone();
                if !self.queue.add_job(job) {
                    tracing::warn!(worker = %worker, "Job queue at capacity, job rejected");
                    return error_reply("job queue is full");
                }
                tracing::info!(job_id = %job_id, worker = %worker, "Job queued");
                self.publish(NEW_JOB_TOPIC.to_string());
                to_reply(&JobAdded { job_id })
            }

            Request::JobFinished { job_id, duration } => {
                let outcome = self.queue.complete_job(&job_id, duration);
                self.completion_reply(&job_id, outcome, job_finished_topic(&job_id), duration, None)
            }

            Request::JobError {
                job_id,
                duration,
                error,
            } => {
                let outcome = self.queue.fail_job(&job_id, duration, error.clone());
                self.completion_reply(&job_id, outcome, job_error_topic(&job_id), duration, Some(&error))
            }
        }
    }

    fn completion_reply(
        &self,
        job_id: &JobId,
        outcome: Completion,
        topic: String,
        duration: f64,
        error: Option<&str>,
    ) -> Value {
        match outcome {
            Completion::Recorded => {
                match error {
                    Some(error) => tracing::warn!(job_id = %job_id, duration, error, "Job failed"),
                    None => tracing::info!(job_id = %job_id, duration, "Job finished"),
                }
                self.publish(topic);
                to_reply(&Ack::ok())
            }
            Completion::Duplicate => {
                tracing::debug!(job_id = %job_id, "Duplicate completion ignored");
                to_reply(&Ack::ok())
            }
            Completion::NotAssigned => {
                tracing::warn!(job_id = %job_id, "Completion for a job that was never assigned");
                error_reply(&format!("job not assigned: {}", job_id))
            }
            Completion::Unknown => {
                tracing::warn!(job_id = %job_id, "Completion for unknown job");
                error_reply(&format!("job not found: {}", job_id))
            }
        }
    }

    fn publish(&self, message: String) {
        tracing::debug!(message = %message, "Broadcast");
        // No subscribers is not an error: delivery is at-most-once.
        let _ = self.broadcast_tx.send(message);
    }

    /// Re-queue stale assignments (at-least-once delivery) and forget old
    /// completed jobs.
    pub fn sweep(&mut self) {
        if let DeliveryMode::AtLeastOnce { redeliver_after } = self.config.delivery {
            let requeued = self.queue.requeue_expired(redeliver_after);
            if !requeued.is_empty() {
                tracing::warn!(count = requeued.len(), "Re-queued unacknowledged jobs");
                self.publish(NEW_JOB_TOPIC.to_string());
            }
        }
        let removed = self
            .queue
            .cleanup_finished_jobs(self.config.finished_retention());
        if removed > 0 {
            tracing::debug!(removed, "Pruned completed jobs");
        }
    }
}

fn to_reply<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| error_reply(&e.to_string()))
}

pub(crate) fn error_reply(message: &str) -> Value {
    json!({ "error": message })
}

/// In-process connection to a running [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    message_tx: mpsc::Sender<ManagerMessage>,
    broadcast_tx: broadcast::Sender<String>,
}

impl ManagerHandle {
    /// Subscribe to the broadcast channel. Every message published after this
    /// call returns is delivered to the returned source.
    pub fn subscribe(&self) -> LocalBroadcast {
        LocalBroadcast {
            rx: Some(self.broadcast_tx.subscribe()),
        }
    }
}

#[async_trait]
impl ManagerApi for ManagerHandle {
    async fn request(&self, request: &Request) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(ManagerMessage::Request {
                request: request.clone(),
                response_tx,
            })
            .await
            .map_err(|_| PyplnError::Transport("manager is not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| PyplnError::Transport("manager dropped the request".to_string()))
    }
}

/// Broadcast subscriber for an in-process manager.
pub struct LocalBroadcast {
    rx: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl BroadcastSource for LocalBroadcast {
    async fn recv(&mut self) -> Result<Option<String>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        loop {
            match rx.recv().await {
                Ok(message) => return Ok(Some(message)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Broadcast subscriber lagged, messages lost");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use std::time::Duration;

    fn manager() -> Manager {
        Manager::new(ManagerConfig::default()).0
    }

    #[test]
    fn get_configuration_returns_configured_object() {
        let config = ManagerConfig::default().with_configuration(Configuration {
            monitoring_interval: 0.5,
            ..Configuration::default()
        });
        let (mut manager, _, _) = Manager::new(config);
        let reply = manager.handle_request(Request::GetConfiguration);
        assert_eq!(reply["monitoring interval"], 0.5);
    }

    #[test]
    fn empty_queue_replies_null_worker() {
        let mut manager = manager();
        assert_eq!(manager.handle_request(Request::GetJob), json!({"worker": null}));
    }

    #[test]
    fn add_then_get_job() {
        let mut manager = manager();
        let added = manager.handle_request(Request::AddJob {
            worker: "dummy".to_string(),
            document: "doc-1".to_string(),
        });
        let job_id = added["job id"].as_str().unwrap().to_string();

        let reply = manager.handle_request(Request::GetJob);
        assert_eq!(reply["worker"], "dummy");
        assert_eq!(reply["document"], "doc-1");
        assert_eq!(reply["job id"], job_id.as_str());
        assert_eq!(manager.handle_request(Request::GetJob)["worker"], Value::Null);
    }

    #[tokio::test]
    async fn job_finished_is_published_once() {
        let (mut manager, handle, _rx) = Manager::new(ManagerConfig::default());
        let mut sub = handle.subscribe();

        let added = manager.handle_request(Request::AddJob {
            worker: "dummy".to_string(),
            document: "doc".to_string(),
        });
        let job_id = JobId::new(added["job id"].as_str().unwrap());
        manager.handle_request(Request::GetJob);

        let finished = Request::JobFinished {
            job_id: job_id.clone(),
            duration: 0.1,
        };
        assert_eq!(manager.handle_request(finished.clone())["answer"], "good job!");
        assert_eq!(manager.handle_request(finished)["answer"], "good job!");

        assert_eq!(sub.recv().await.unwrap().as_deref(), Some("new job"));
        let expected = job_finished_topic(&job_id);
        assert_eq!(sub.recv().await.unwrap(), Some(expected));
        let next = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(next.is_err(), "second completion must not be broadcast");
    }

    #[test]
    fn completion_for_unknown_job_is_an_error() {
        let mut manager = manager();
        let reply = manager.handle_request(Request::JobFinished {
            job_id: JobId::from("ghost"),
            duration: 1.0,
        });
        assert!(reply["error"].as_str().unwrap().contains("ghost"));
    }

    #[test]
    fn full_queue_rejects_jobs() {
        let config = ManagerConfig {
            max_jobs: 1,
            ..ManagerConfig::default()
        };
        let (mut manager, _, _) = Manager::new(config);
        let add = || Request::AddJob {
            worker: "dummy".to_string(),
            document: "doc".to_string(),
        };
        assert!(manager.handle_request(add()).get("job id").is_some());
        assert!(manager.handle_request(add()).get("error").is_some());
    }

    #[test]
    fn at_least_once_sweep_requeues() {
        let config = ManagerConfig::default().with_delivery(DeliveryMode::AtLeastOnce {
            redeliver_after: Duration::ZERO,
        });
        let (mut manager, _, _) = Manager::new(config);
        manager.handle_request(Request::AddJob {
            worker: "dummy".to_string(),
            document: "doc".to_string(),
        });
        let first = manager.handle_request(Request::GetJob);
        manager.sweep();
        let second = manager.handle_request(Request::GetJob);
        assert_eq!(first["job id"], second["job id"]);
        assert_eq!(manager.queue().all_jobs()[0].deliveries, 2);
    }

    #[test]
    fn at_most_once_sweep_keeps_assignment() {
        let mut manager = manager();
        manager.handle_request(Request::AddJob {
            worker: "dummy".to_string(),
            document: "doc".to_string(),
        });
        manager.handle_request(Request::GetJob);
        manager.sweep();
        assert_eq!(manager.handle_request(Request::GetJob)["worker"], Value::Null);
    }
}
