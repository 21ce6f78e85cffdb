use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;

use crate::manager::job::{Job, JobStatus};
use crate::protocol::JobId;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Outcome of reporting a job as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First report for this job; the caller should broadcast it.
    Recorded,
    /// The job was already reported done; nothing changes.
    Duplicate,
    /// The job is still waiting for its first assignment.
    NotAssigned,
    Unknown,
}

/// Manages the job queue and job state.
///
/// Queued jobs are handed out in FIFO order. Every job stays in the map until
/// [`cleanup_finished_jobs`](JobQueue::cleanup_finished_jobs) prunes it, which
/// is what makes a repeated completion report detectable.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<JobId, Job>,
    queued: VecDeque<JobId>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            queued: VecDeque::new(),
            max_jobs,
        }
    }

    /// Add a new job to the queue. Returns false if the queue is at capacity
    /// or the id is already known.
    pub fn add_job(&mut self, job: Job) -> bool {
        if self.is_full() || self.jobs.contains_key(&job.id) {
            return false;
        }
        self.queued.push_back(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        true
    }

    pub fn get_job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Hand out the oldest queued job, marking it assigned.
    pub fn next_job(&mut self) -> Option<&Job> {
        while let Some(id) = self.queued.pop_front() {
            // Skip ids whose job was completed while it sat in the queue.
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            job.status = JobStatus::Assigned;
            job.assigned_at = Some(Utc::now());
            job.deliveries += 1;
            return self.jobs.get(&id);
        }
        None
    }

    pub fn complete_job(&mut self, id: &JobId, duration: f64) -> Completion {
        self.finish(id, JobStatus::Finished, duration, None)
    }

    pub fn fail_job(&mut self, id: &JobId, duration: f64, error: String) -> Completion {
        self.finish(id, JobStatus::Failed, duration, Some(error))
    }

    fn finish(
        &mut self,
        id: &JobId,
        status: JobStatus,
        duration: f64,
        error: Option<String>,
    ) -> Completion {
        let Some(job) = self.jobs.get_mut(id) else {
            return Completion::Unknown;
        };
        if job.status.is_done() {
            return Completion::Duplicate;
        }
        // A re-queued job keeps its delivery count, so a late report from the
        // earlier delivery is still accepted.
        if job.deliveries == 0 {
            return Completion::NotAssigned;
        }
        job.status = status;
        job.duration = Some(duration);
        job.error = error;
        job.completed_at = Some(Utc::now());
        Completion::Recorded
    }

    /// Put jobs assigned for longer than `older_than` back at the front of the
    /// queue. Returns the re-queued ids.
    pub fn requeue_expired(&mut self, older_than: Duration) -> Vec<JobId> {
        let Ok(older_than) = chrono::Duration::from_std(older_than) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - older_than;

        let mut expired: Vec<&mut Job> = self
            .jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Assigned)
            .filter(|j| j.assigned_at.is_some_and(|at| at <= cutoff))
            .collect();
        // Oldest first once pushed to the front.
        expired.sort_by_key(|j| std::cmp::Reverse(j.created_at));

        let mut ids = Vec::with_capacity(expired.len());
        for job in expired {
            job.status = JobStatus::Queued;
            job.assigned_at = None;
            self.queued.push_front(job.id.clone());
            ids.push(job.id.clone());
        }
        ids.reverse();
        ids
    }

    /// Get all queued jobs in hand-out order
    pub fn queued_jobs(&self) -> Vec<&Job> {
        self.queued
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.status == JobStatus::Queued)
            .collect()
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Remove finished and failed jobs completed more than `older_than` ago.
    /// Returns the number of jobs removed.
    pub fn cleanup_finished_jobs(&mut self, older_than: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(older_than) {
            Ok(d) => Utc::now() - d,
            Err(_) => return 0,
        };
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.status.is_done() && job.completed_at.is_some_and(|at| at <= cutoff))
        });
        before - self.jobs.len()
    }

    /// Returns the current number of jobs in the queue
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns true if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
