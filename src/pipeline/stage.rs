use std::sync::Arc;

/// A node of a pipeline template: a worker and the stages that run after it.
///
/// Templates are immutable once built and shared between every document of a
/// run; the document a stage runs on is bound per job, not stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStage {
    name: String,
    downstream: Vec<Arc<WorkerStage>>,
}

impl WorkerStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            downstream: Vec::new(),
        }
    }

    /// Run `stages` after this one, in order.
    pub fn then<I>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = WorkerStage>,
    {
        self.downstream
            .extend(stages.into_iter().map(Arc::new));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downstream(&self) -> &[Arc<WorkerStage>] {
        &self.downstream
    }

    /// Number of stages in this subtree, this one included.
    pub fn stage_count(&self) -> usize {
        1 + self
            .downstream
            .iter()
            .map(|stage| stage.stage_count())
            .sum::<usize>()
    }
}
