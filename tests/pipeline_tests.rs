
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pypln_lite::config::PipelineConfig;
use pypln_lite::error::{PyplnError, Result};
use pypln_lite::manager::LocalBroadcast;
use pypln_lite::pipeline::{Pipeline, WorkerStage};
use pypln_lite::store::DocumentStore;
use pypln_lite::transport::BroadcastSource;

use test_harness::{builtin_registry, test_broker_config, TestCluster};

/// (worker, document) in the order jobs were picked up.
type JobLog = Arc<Mutex<Vec<(String, String)>>>;

/// Stands in for a broker: completes every queued job at once, failing the
/// ones whose worker is in `failing`.
fn fake_broker(cluster: &TestCluster, failing: &[&str], stop: CancellationToken) -> (JobLog, JoinHandle<()>) {
    let client = cluster.client();
    let failing: HashSet<String> = failing.iter().map(|s| s.to_string()).collect();
    let log: JobLog = Arc::new(Mutex::new(Vec::new()));
    let task_log = log.clone();

    let task = tokio::spawn(async move {
        while !stop.is_cancelled() {
            match client.get_job().await {
                Ok(Some(job)) => {
                    task_log
                        .lock()
                        .unwrap()
                        .push((job.worker.clone(), job.document.clone()));
                    let duration = Duration::from_millis(1);
                    if failing.contains(&job.worker) {
                        let _ = client.job_error(&job.job_id, duration, "boom").await;
                    } else {
                        let _ = client.job_finished(&job.job_id, duration).await;
                    }
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(_) => break,
            }
        }
    });
    (log, task)
}

fn stage(name: &str) -> WorkerStage {
    WorkerStage::new(name)
}

fn names(runs: &[pypln_lite::pipeline::StageRun]) -> Vec<String> {
    let mut names: Vec<String> = runs.iter().map(|r| r.worker.clone()).collect();
    names.sort();
    names
}

/// Test 1: Downstream stages start only after their parent finished, on the same document
#[tokio::test]
async fn test_stages_cascade_on_completion() {
    let cluster = TestCluster::new();
    let stop = CancellationToken::new();
    let (log, broker) = fake_broker(&cluster, &[], stop.clone());
    let mut pipeline = cluster.pipeline(stage("A").then([stage("B"), stage("C")]));

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        pipeline.run(["doc-1"], &CancellationToken::new()),
    )
    .await
    .expect("pipeline should finish")
    .unwrap();
    stop.cancel();
    broker.await.unwrap();

    assert!(report.is_success());
    assert_eq!(names(&report.finished), vec!["A", "B", "C"]);
    assert_eq!(report.skipped, 0);

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].0, "A");
    assert!(log.iter().all(|(_, document)| document == "doc-1"));
}

/// Test 2: Every document runs through its own copy of the template
#[tokio::test]
async fn test_multiple_documents() {
    let cluster = TestCluster::new();
    let stop = CancellationToken::new();
    let (log, broker) = fake_broker(&cluster, &[], stop.clone());
    let mut pipeline = cluster.pipeline(stage("extractor").then([stage("tokenizer")]));

    let report = pipeline
        .run(["d1", "d2", "d3"], &CancellationToken::new())
        .await
        .unwrap();
    stop.cancel();
    broker.await.unwrap();

    assert_eq!(report.finished.len(), 6);
    let log = log.lock().unwrap().clone();
    for document in ["d1", "d2", "d3"] {
        let order: Vec<&str> = log
            .iter()
            .filter(|(_, d)| d == document)
            .map(|(w, _)| w.as_str())
            .collect();
        assert_eq!(order, vec!["extractor", "tokenizer"], "document {}", document);
    }
}

/// Test 3: A failed stage prunes everything after it
#[tokio::test]
async fn test_failure_does_not_cascade() {
    let cluster = TestCluster::new();
    let stop = CancellationToken::new();
    let (log, broker) = fake_broker(&cluster, &["A"], stop.clone());
    let mut pipeline = cluster.pipeline(stage("A").then([stage("B"), stage("C")]));

    let report = pipeline.run(["doc"], &CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.cancel();
    broker.await.unwrap();

    assert!(!report.is_success());
    assert!(report.finished.is_empty());
    assert_eq!(names(&report.failed), vec!["A"]);
    assert_eq!(report.skipped, 2);
    assert_eq!(log.lock().unwrap().len(), 1);
}

/// Test 4: A failing branch leaves its siblings running
#[tokio::test]
async fn test_failure_prunes_only_its_branch() {
    let cluster = TestCluster::new();
    let stop = CancellationToken::new();
    let (_log, broker) = fake_broker(&cluster, &["B"], stop.clone());
    let template = stage("A").then([stage("B").then([stage("D")]), stage("C")]);
    let mut pipeline = cluster.pipeline(template);

    let report = pipeline.run(["doc"], &CancellationToken::new()).await.unwrap();
    stop.cancel();
    broker.await.unwrap();

    assert_eq!(names(&report.finished), vec!["A", "C"]);
    assert_eq!(names(&report.failed), vec!["B"]);
    assert_eq!(report.skipped, 1);
}

/// Test 5: An empty document list finishes immediately
#[tokio::test]
async fn test_no_documents() {
    let cluster = TestCluster::new();
    let mut pipeline = cluster.pipeline(stage("A"));

    let report = pipeline
        .run(Vec::<String>::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.finished.is_empty());
    assert!(report.is_success());
}

/// Test 6: Interrupting a run closes the pipeline and reports the interrupt
#[tokio::test]
async fn test_interrupt() {
    let cluster = TestCluster::new();
    let mut pipeline = cluster.pipeline(stage("A").then([stage("B")]));
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = tokio::time::timeout(Duration::from_secs(2), pipeline.run(["doc"], &shutdown))
        .await
        .expect("interrupt should end the run");

    assert!(matches!(result, Err(PyplnError::Interrupted)));
    // The subscription is gone, so a second run cannot wait for anything.
    let again = pipeline.run(["doc"], &CancellationToken::new()).await;
    assert!(again.is_err());
}

/// Broadcast source that delivers every message twice.
struct Doubling {
    inner: LocalBroadcast,
    repeat: Option<String>,
}

#[async_trait]
impl BroadcastSource for Doubling {
    async fn recv(&mut self) -> Result<Option<String>> {
        if let Some(message) = self.repeat.take() {
            return Ok(Some(message));
        }
        let message = self.inner.recv().await?;
        self.repeat = message.clone();
        Ok(message)
    }
}

/// Test 7: A repeated completion broadcast does not submit downstream twice
#[tokio::test]
async fn test_repeated_broadcast_is_ignored() {
    let cluster = TestCluster::new();
    let stop = CancellationToken::new();
    let (log, broker) = fake_broker(&cluster, &[], stop.clone());
    let source = Doubling {
        inner: cluster.handle.subscribe(),
        repeat: None,
    };
    let mut pipeline = Pipeline::new(
        cluster.client(),
        source,
        stage("A").then([stage("B")]),
        PipelineConfig::default(),
    );

    let report = pipeline.run(["doc"], &CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.cancel();
    broker.await.unwrap();

    assert_eq!(names(&report.finished), vec!["A", "B"]);
    let log = log.lock().unwrap().clone();
    assert_eq!(log.iter().filter(|(w, _)| w == "B").count(), 1);
}

/// Test 8: Extraction, tokenization and frequency counting over a real broker
#[tokio::test]
async fn test_text_pipeline_end_to_end() {
    let cluster = TestCluster::new();
    let blob_id = cluster
        .store
        .put_blob(b"The cat sat on   the mat.\n\nThe cat!".to_vec(), "cat.txt")
        .await
        .unwrap();
    let broker = cluster.start_broker(builtin_registry(), test_broker_config(2));
    let template = stage("extractor").then([stage("tokenizer").then([stage("freqdist")])]);
    let mut pipeline = cluster.pipeline(template);

    let report = tokio::time::timeout(
        Duration::from_secs(20),
        pipeline.run([blob_id.clone()], &CancellationToken::new()),
    )
    .await
    .expect("pipeline should finish")
    .unwrap();
    broker.stop().await.unwrap();

    assert!(report.is_success(), "failed stages: {:?}", report.failed);
    assert_eq!(report.finished.len(), 3);

    let doc = cluster.store.find_by_id(&blob_id).await.unwrap();
    assert_eq!(doc["text"], "The cat sat on the mat.\nThe cat!");
    assert_eq!(doc["name"], "cat.txt");
    assert_eq!(doc["tokens"].as_array().unwrap().len(), 10);
    assert_eq!(doc["freqdist"][0], serde_json::json!(["the", 3]));
    assert_eq!(doc["freqdist"][1], serde_json::json!(["cat", 2]));
}
