//! Request/reply and publish/subscribe channels to the manager.
//!
//! Two transports implement the same pair of traits:
//!
//! - **In-process**: [`ManagerHandle`](crate::manager::ManagerHandle) talks to a
//!   [`Manager`](crate::manager::Manager) task over channels.
//! - **TCP**: [`tcp`] speaks newline-delimited JSON to a
//!   [`ManagerServer`](crate::manager::ManagerServer).
//!
//! [`ManagerClient`] wraps a [`ManagerApi`] with typed calls and
//! [`Subscription`] adds topic filtering on top of a [`BroadcastSource`].

pub mod tcp;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::Configuration;
use crate::error::{PyplnError, Result};
use crate::protocol::{
    topic_matches, ErrorReply, JobAdded, JobAssignment, JobId, JobReply, Request,
};

/// Request/reply side of the manager connection. At most one request is in
/// flight per connection.
#[async_trait]
pub trait ManagerApi: Send + Sync {
    async fn request(&self, request: &Request) -> Result<Value>;

    /// Release the underlying connection. Later requests fail.
    async fn close(&self) {}
}

#[async_trait]
impl<T: ManagerApi + ?Sized> ManagerApi for Arc<T> {
    async fn request(&self, request: &Request) -> Result<Value> {
        (**self).request(request).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Publish/subscribe side of the manager connection.
#[async_trait]
pub trait BroadcastSource: Send {
    /// Next published message, or `None` once the channel is closed.
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) {}
}

#[async_trait]
impl<T: BroadcastSource + ?Sized> BroadcastSource for Box<T> {
    async fn recv(&mut self) -> Result<Option<String>> {
        (**self).recv().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// Typed calls over a [`ManagerApi`].
#[derive(Debug, Clone)]
pub struct ManagerClient<A> {
    api: A,
}

impl<A: ManagerApi> ManagerClient<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let reply = self.api.request(request).await?;
        decode_reply(reply)
    }

    pub async fn get_configuration(&self) -> Result<Configuration> {
        self.call(&Request::GetConfiguration).await
    }

    /// `None` when the manager has nothing queued.
    pub async fn get_job(&self) -> Result<Option<JobAssignment>> {
        let reply: JobReply = self.call(&Request::GetJob).await?;
        Ok(reply.into_assignment())
    }

    pub async fn add_job(&self, worker: &str, document: &str) -> Result<JobId> {
        let reply: JobAdded = self
            .call(&Request::AddJob {
                worker: worker.to_string(),
                document: document.to_string(),
            })
            .await?;
        Ok(reply.job_id)
    }

    pub async fn job_finished(&self, job_id: &JobId, duration: Duration) -> Result<Value> {
        self.call(&Request::JobFinished {
            job_id: job_id.clone(),
            duration: duration.as_secs_f64(),
        })
        .await
    }

    pub async fn job_error(&self, job_id: &JobId, duration: Duration, error: &str) -> Result<Value> {
        self.call(&Request::JobError {
            job_id: job_id.clone(),
            duration: duration.as_secs_f64(),
            error: error.to_string(),
        })
        .await
    }

    pub async fn close(&self) {
        self.api.close().await;
    }
}

fn decode_reply<T: DeserializeOwned>(reply: Value) -> Result<T> {
    if let Some(obj) = reply.as_object() {
        if obj.len() == 1 && obj.contains_key("error") {
            let ErrorReply { error } = serde_json::from_value(reply)?;
            return Err(PyplnError::Manager(error));
        }
    }
    Ok(serde_json::from_value(reply)?)
}

/// Topic-filtered view of a broadcast channel.
///
/// Filtering happens when a message is consumed, so a topic subscribed before
/// the next [`poll`](Subscription::poll) sees every matching message published
/// since the source was connected.
pub struct Subscription<S> {
    source: S,
    topics: HashSet<String>,
    closed: bool,
}

impl<S: BroadcastSource> Subscription<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            topics: HashSet::new(),
            closed: false,
        }
    }

    pub fn subscribe(&mut self, topic: impl Into<String>) {
        self.topics.insert(topic.into());
    }

    /// Returns whether the topic was subscribed.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        self.topics.remove(topic)
    }

    pub fn topics(&self) -> usize {
        self.topics.len()
    }

    fn matches(&self, message: &str) -> bool {
        self.topics.iter().any(|t| topic_matches(t, message))
    }

    /// Wait up to `timeout` for a message matching one of the subscribed
    /// topics. Non-matching messages are dropped.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<String>> {
        if self.closed {
            return Err(PyplnError::Transport("subscription closed".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, self.source.recv()).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };
            match message {
                Some(message) if self.matches(&message) => return Ok(Some(message)),
                Some(message) => {
                    tracing::trace!(message = %message, "Dropping unsubscribed broadcast");
                }
                None => {
                    return Err(PyplnError::Transport(
                        "broadcast channel closed".to_string(),
                    ))
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.topics.clear();
            self.source.close().await;
        }
    }
}
