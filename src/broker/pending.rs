use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::protocol::JobId;

/// A job whose worker process is running.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub job_id: JobId,
    pub worker: String,
    pub document: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Jobs currently running on this broker, bounded by `capacity`.
#[derive(Debug)]
pub struct PendingSet {
    capacity: usize,
    jobs: HashMap<JobId, PendingJob>,
}

impl PendingSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_capacity(&self) -> bool {
        self.jobs.len() < self.capacity
    }

    /// Returns false, leaving the set unchanged, when full or when the job is
    /// already pending.
    pub fn insert(&mut self, job: PendingJob) -> bool {
        if !self.has_capacity() || self.jobs.contains_key(&job.job_id) {
            return false;
        }
        self.jobs.insert(job.job_id.clone(), job);
        true
    }

    pub fn remove(&mut self, job_id: &JobId) -> Option<PendingJob> {
        self.jobs.remove(job_id)
    }

    pub fn get(&self, job_id: &JobId) -> Option<&PendingJob> {
        self.jobs.get(job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
