use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{JobAssignment, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Assigned,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_done(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work binding one worker to one document.
///
/// `id`, `worker` and `document` never change after creation; the remaining
/// fields track the job through the manager's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub worker: String,
    pub document: String,
    pub status: JobStatus,
    /// Number of times the job was handed to a broker.
    pub deliveries: u32,
    pub duration: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(worker: String, document: String) -> Self {
        Self::with_id(JobId::generate(), worker, document)
    }

    pub fn with_id(id: JobId, worker: String, document: String) -> Self {
        Self {
            id,
            worker,
            document,
            status: JobStatus::Queued,
            deliveries: 0,
            duration: None,
            error: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
        }
    }

    pub fn assignment(&self) -> JobAssignment {
        JobAssignment {
            job_id: self.id.clone(),
            worker: self.worker.clone(),
            document: self.document.clone(),
        }
    }
}
