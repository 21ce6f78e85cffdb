//! Multi-stage workflows driven by completion broadcasts.
//!
//! A [`Pipeline`] submits the root stage of its template for every input
//! document, then waits on the broadcast channel. Each `job finished`
//! broadcast releases the downstream stages of the job that produced it,
//! bound to the same document; a `job error` broadcast records the failure
//! and prunes that branch. The run ends when no job is outstanding.

pub mod stage;

pub use stage::WorkerStage;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{PyplnError, Result};
use crate::protocol::{job_error_topic, job_finished_topic, Broadcast, JobId};
use crate::transport::{BroadcastSource, ManagerApi, ManagerClient, Subscription};

/// One job submitted by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRun {
    pub job_id: JobId,
    pub worker: String,
    pub document: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub finished: Vec<StageRun>,
    pub failed: Vec<StageRun>,
    /// Stages never submitted because a stage before them failed.
    pub skipped: usize,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A stage waiting on a job, bound to the document it runs on.
struct Binding {
    stage: Arc<WorkerStage>,
    document: String,
}

pub struct Pipeline<A, S> {
    client: ManagerClient<A>,
    subscription: Subscription<S>,
    template: Arc<WorkerStage>,
    config: PipelineConfig,
}

impl<A: ManagerApi, S: BroadcastSource> Pipeline<A, S> {
    /// `source` must already be connected: completions published before it
    /// was are not seen.
    pub fn new(
        client: ManagerClient<A>,
        source: S,
        template: WorkerStage,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            subscription: Subscription::new(source),
            template: Arc::new(template),
            config,
        }
    }

    pub fn template(&self) -> &WorkerStage {
        &self.template
    }

    /// Run the template over every document and wait for all of it.
    ///
    /// When `shutdown` fires the connection to the manager is closed and
    /// [`PyplnError::Interrupted`] is returned; jobs already handed to brokers
    /// keep running.
    pub async fn run<I, D>(&mut self, documents: I, shutdown: &CancellationToken) -> Result<RunReport>
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let mut waiting = HashMap::new();
        let mut report = RunReport::default();

        match self.drive(documents, shutdown, &mut waiting, &mut report).await {
            Ok(()) => {
                tracing::info!(
                    finished = report.finished.len(),
                    failed = report.failed.len(),
                    "Pipeline run complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, outstanding = waiting.len(), "Pipeline run aborted");
                self.close().await;
                Err(e)
            }
        }
    }

    async fn drive<I, D>(
        &mut self,
        documents: I,
        shutdown: &CancellationToken,
        waiting: &mut HashMap<JobId, Binding>,
        report: &mut RunReport,
    ) -> Result<()>
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        for document in documents {
            let root = Arc::clone(&self.template);
            self.submit(root, document.into(), waiting).await?;
        }

        let poll_timeout = self.config.poll_timeout();
        while !waiting.is_empty() {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Err(PyplnError::Interrupted),
                message = self.subscription.poll(poll_timeout) => message?,
            };
            let Some(message) = message else {
                continue;
            };

            let (job_id, failed) = match Broadcast::parse(&message) {
                Broadcast::JobFinished(job_id) => (job_id, false),
                Broadcast::JobError(job_id) => (job_id, true),
                _ => continue,
            };
            self.subscription.unsubscribe(&job_finished_topic(&job_id));
            self.subscription.unsubscribe(&job_error_topic(&job_id));

            // Removed before anything downstream is submitted, so a repeated
            // broadcast finds nothing.
            let Some(Binding { stage, document }) = waiting.remove(&job_id) else {
                continue;
            };
            let run = StageRun {
                job_id,
                worker: stage.name().to_string(),
                document: document.clone(),
            };

            if failed {
                tracing::warn!(job_id = %run.job_id, worker = %run.worker, document = %document, "Stage failed");
                report.skipped += stage.stage_count() - 1;
                report.failed.push(run);
                continue;
            }

            tracing::debug!(job_id = %run.job_id, worker = %run.worker, "Stage finished");
            report.finished.push(run);
            for next in stage.downstream() {
                self.submit(Arc::clone(next), document.clone(), waiting)
                    .await?;
            }
        }
        Ok(())
    }

    async fn submit(
        &mut self,
        stage: Arc<WorkerStage>,
        document: String,
        waiting: &mut HashMap<JobId, Binding>,
    ) -> Result<()> {
        let job_id = self.client.add_job(stage.name(), &document).await?;
        self.subscription.subscribe(job_finished_topic(&job_id));
        self.subscription.subscribe(job_error_topic(&job_id));
        tracing::info!(job_id = %job_id, worker = %stage.name(), document = %document, "Stage submitted");
        waiting.insert(job_id, Binding { stage, document });
        Ok(())
    }

    /// Release the manager connection and the broadcast subscription.
    pub async fn close(&mut self) {
        self.subscription.close().await;
        self.client.close().await;
    }
}
