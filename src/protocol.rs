//! Messages exchanged with the manager.
//!
//! Requests are JSON objects tagged by their `"command"` key; replies are
//! plain JSON objects whose shape depends on the command. Broadcasts are bare
//! strings such as `"job finished: <job id>"`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published whenever a job is enqueued.
pub const NEW_JOB_TOPIC: &str = "new job";
const JOB_FINISHED_PREFIX: &str = "job finished: ";
const JOB_ERROR_PREFIX: &str = "job error: ";

/// Opaque job token issued by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    #[serde(rename = "get configuration")]
    GetConfiguration,

    #[serde(rename = "get job")]
    GetJob,

    #[serde(rename = "add job")]
    AddJob { worker: String, document: String },

    #[serde(rename = "job finished")]
    JobFinished {
        #[serde(rename = "job id")]
        job_id: JobId,
        duration: f64,
    },

    /// Completion of a job whose worker failed, timed out or was missing.
    #[serde(rename = "job error")]
    JobError {
        #[serde(rename = "job id")]
        job_id: JobId,
        duration: f64,
        error: String,
    },
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Request::GetConfiguration => "get configuration",
            Request::GetJob => "get job",
            Request::AddJob { .. } => "add job",
            Request::JobFinished { .. } => "job finished",
            Request::JobError { .. } => "job error",
        }
    }
}

/// A job handed to a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAssignment {
    pub job_id: JobId,
    pub worker: String,
    pub document: String,
}

/// Reply to `get job`; `worker: null` means no job is available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReply {
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(rename = "job id", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl JobReply {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn into_assignment(self) -> Option<JobAssignment> {
        match self {
            JobReply {
                worker: Some(worker),
                document: Some(document),
                job_id: Some(job_id),
            } => Some(JobAssignment {
                job_id,
                worker,
                document,
            }),
            _ => None,
        }
    }
}

impl From<JobAssignment> for JobReply {
    fn from(job: JobAssignment) -> Self {
        Self {
            worker: Some(job.worker),
            document: Some(job.document),
            job_id: Some(job.job_id),
        }
    }
}

/// Reply to `add job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAdded {
    #[serde(rename = "job id")]
    pub job_id: JobId,
}

/// Reply sent when a request cannot be served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Acknowledgement of a completion notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub answer: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            answer: "good job!".to_string(),
        }
    }
}

pub fn job_finished_topic(job_id: &JobId) -> String {
    format!("{}{}", JOB_FINISHED_PREFIX, job_id)
}

pub fn job_error_topic(job_id: &JobId) -> String {
    format!("{}{}", JOB_ERROR_PREFIX, job_id)
}

/// A decoded broadcast message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    NewJob,
    JobFinished(JobId),
    JobError(JobId),
    Other(String),
}

impl Broadcast {
    pub fn parse(message: &str) -> Self {
        if message == NEW_JOB_TOPIC {
            return Broadcast::NewJob;
        }
        if let Some(rest) = message.strip_prefix(JOB_FINISHED_PREFIX) {
            if let Some(id) = first_word(rest) {
                return Broadcast::JobFinished(JobId::from(id));
            }
        }
        if let Some(rest) = message.strip_prefix(JOB_ERROR_PREFIX) {
            if let Some(id) = first_word(rest) {
                return Broadcast::JobError(JobId::from(id));
            }
        }
        Broadcast::Other(message.to_string())
    }
}

fn first_word(s: &str) -> Option<&str> {
    s.split(' ').next().filter(|w| !w.is_empty())
}

/// Whether `message` is delivered to a subscriber of `topic`.
pub fn topic_matches(topic: &str, message: &str) -> bool {
    match message.strip_prefix(topic) {
        Some(rest) => rest.is_empty() || rest.starts_with(' '),
        None => false,
    }
}
