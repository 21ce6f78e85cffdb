
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pypln_lite::error::PyplnError;
use pypln_lite::worker::executor::WorkerExecutor;
use pypln_lite::worker::WorkerSpec;

use test_harness::{assert_eventually, is_alive};

fn test_executor() -> WorkerExecutor {
    WorkerExecutor::new(Duration::from_millis(200))
}

#[tokio::test]
async fn test_json_output_becomes_updates() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("answer", r#"cat > /dev/null; echo '{"answer": 42}'"#);

    let worker = executor.spawn(&spec, &json!({"_id": "doc"})).unwrap();
    let updates = worker.wait(&CancellationToken::new()).await.unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates["answer"], 42);
}

#[tokio::test]
async fn test_input_is_written_to_stdin() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("cat", "cat");
    let input = json!({"_id": "doc", "text": "hello world", "nested": {"a": [1, 2]}});

    let worker = executor.spawn(&spec, &input).unwrap();
    let updates = worker.wait(&CancellationToken::new()).await.unwrap();

    assert_eq!(serde_json::Value::Object(updates), input);
}

#[tokio::test]
async fn test_empty_output_is_no_update() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("quiet", "true");

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let updates = worker.wait(&CancellationToken::new()).await.unwrap();

    assert!(updates.is_empty());
}

#[tokio::test]
async fn test_large_input_and_output() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("cat", "cat");
    let text = "lorem ipsum ".repeat(100_000);

    let worker = executor.spawn(&spec, &json!({"text": text})).unwrap();
    let updates = worker.wait(&CancellationToken::new()).await.unwrap();

    assert_eq!(updates["text"].as_str().unwrap().len(), text.len());
}

#[tokio::test]
async fn test_nonzero_exit_reports_stderr() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("failing", "echo 'no text field' >&2; exit 3");

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let err = worker.wait(&CancellationToken::new()).await.unwrap_err();

    match err {
        PyplnError::Worker(message) => assert_eq!(message, "no text field"),
        other => panic!("expected worker error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_nonzero_exit_without_stderr() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("silent", "exit 7");

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let err = worker.wait(&CancellationToken::new()).await.unwrap_err();

    assert!(
        err.to_string().contains("silent exited with"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_non_object_output_is_an_error() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("lister", "echo '[1, 2, 3]'");

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let err = worker.wait(&CancellationToken::new()).await.unwrap_err();

    assert!(err.to_string().contains("an array"));
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let executor = test_executor();
    let spec = WorkerSpec::new("ghost", "/nonexistent/worker/binary");

    let err = executor.spawn(&spec, &json!({})).unwrap_err();

    assert!(matches!(err, PyplnError::Worker(ref m) if m.contains("failed to spawn ghost")));
}

#[tokio::test]
async fn test_timeout_kills_worker() {
    let executor = test_executor();
    let spec =
        WorkerSpec::shell("sleepy", "exec sleep 30").with_timeout(Duration::from_millis(200));

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let pid = worker.pid();
    let start = std::time::Instant::now();
    let err = worker.wait(&CancellationToken::new()).await.unwrap_err();

    assert!(err.to_string().contains("timed out"), "unexpected error: {}", err);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_cancel_terminates_worker() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("sleepy", "exec sleep 30");
    let cancel = CancellationToken::new();

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let pid = worker.pid();
    let waiter = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.wait(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait should return after cancel")
        .unwrap();

    assert!(matches!(result, Err(PyplnError::Interrupted)));
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_cancel_escalates_to_sigkill() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("stubborn", "trap '' TERM; sleep 30");
    let cancel = CancellationToken::new();

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let pid = worker.pid();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = worker.wait(&cancel).await;

    assert!(matches!(result, Err(PyplnError::Interrupted)));
    assert!(!is_alive(pid));
}

/// Anything a worker forks dies with it, even when it outlives the worker.
#[tokio::test]
async fn test_cancel_kills_grandchildren() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let executor = test_executor();
    let spec = WorkerSpec::shell("forking", &script);
    let cancel = CancellationToken::new();

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let waiter = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.wait(&cancel).await })
    };

    let pid_file_check = pid_file.clone();
    assert_eventually(
        || {
            let path = pid_file_check.clone();
            async move {
                std::fs::read_to_string(&path)
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "worker should record its grandchild",
    )
    .await;
    let grandchild: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(is_alive(grandchild));

    cancel.cancel();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(PyplnError::Interrupted)));

    assert_eventually(
        || async move { !is_alive(grandchild) },
        Duration::from_secs(2),
        "grandchild should be killed with the worker",
    )
    .await;
}

#[tokio::test]
async fn test_background_child_does_not_hold_output_open() {
    let executor = test_executor();
    let spec = WorkerSpec::shell("leaky", r#"sleep 30 & echo '{"done": true}'"#);

    let worker = executor.spawn(&spec, &json!({})).unwrap();
    let updates = tokio::time::timeout(
        Duration::from_secs(5),
        worker.wait(&CancellationToken::new()),
    )
    .await
    .expect("worker output should not wait for its background child")
    .unwrap();

    assert_eq!(updates["done"], true);
}

#[tokio::test]
async fn test_concurrent_workers() {
    let executor = test_executor();
    let mut handles = vec![];

    for i in 0..10 {
        let executor = executor.clone();
        let spec = WorkerSpec::shell("cat", "cat");
        handles.push(tokio::spawn(async move {
            let worker = executor.spawn(&spec, &json!({"n": i})).unwrap();
            worker.wait(&CancellationToken::new()).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let updates = handle.await.unwrap().unwrap();
        assert_eq!(updates["n"], i);
    }
}
