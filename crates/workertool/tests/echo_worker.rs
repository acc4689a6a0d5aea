//! End-to-end tests against the `echo-worker` binary over real FIFOs.

#![cfg(target_os = "linux")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use workertool::bridge::pipe::FifoPipeFactory;
use workertool::{
    BusEvent, ChannelEventBus, DownwardApiExecutionContext, ExecuteError, ExecutorState,
    PostedEvent, SystemClock, WorkerToolConfig, WorkerToolExecutor,
};

fn executor(
    command: &[&str],
    fifo_dir: &Path,
) -> (WorkerToolExecutor, mpsc::UnboundedReceiver<PostedEvent>) {
    let (bus, rx) = ChannelEventBus::new();
    let context = DownwardApiExecutionContext::of(Arc::new(bus), &SystemClock);
    let config = WorkerToolConfig::new(command.iter().copied())
        .with_pipe_factory(Arc::new(FifoPipeFactory::in_dir(fifo_dir)))
        .with_shutdown_timeout(Duration::from_secs(10))
        .with_env("WORKERTOOL_LOG", "debug");
    (WorkerToolExecutor::new(config, context), rx)
}

fn fifo_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_worker_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, mut events) = executor(&[env!("CARGO_BIN_EXE_echo-worker")], dir.path());

    executor.launch_worker().await.unwrap();
    assert_eq!(fifo_count(dir.path()), 2);

    let result = executor
        .execute_command("action-1", &json!({"file": "Foo.java"}))
        .await
        .unwrap();
    assert_eq!(result.action_id, "action-1");
    assert!(result.is_success());
    assert_eq!(result.message.as_deref(), Some(r#"{"file":"Foo.java"}"#));

    let failed = executor
        .execute_command("action-2", &json!({"fail": true}))
        .await
        .unwrap();
    assert_eq!(failed.action_id, "action-2");
    assert_eq!(failed.exit_code, 1);

    executor.shutdown().await;
    assert_eq!(executor.state(), ExecutorState::Terminated);
    assert_eq!(fifo_count(dir.path()), 0);

    let mut posted = Vec::new();
    while let Ok(event) = events.try_recv() {
        posted.push(event.event);
    }
    assert_eq!(posted.len(), 6, "unexpected events: {:#?}", posted);
    for action in posted.chunks(3) {
        assert!(matches!(action[0], BusEvent::StepStarted(ref s) if s.step_type == "echo"));
        assert!(matches!(action[1], BusEvent::Console(_)));
        assert!(matches!(action[2], BusEvent::StepFinished(_)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_that_exits_early_fails_pending_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, _events) = executor(&["sh", "-c", "exit 3"], dir.path());
    let executor = Arc::new(executor);

    executor.launch_worker().await.unwrap();

    let pending = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute_command("action-1", &json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(executor.state(), ExecutorState::Executing);

    executor.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending execute must be released by shutdown")
        .unwrap();
    assert!(matches!(result, Err(ExecuteError::NoResult { .. })));
    assert_eq!(fifo_count(dir.path()), 0);
}

#[tokio::test]
async fn failed_spawn_leaves_no_fifos() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, _events) = executor(&["/nonexistent/worker-tool"], dir.path());

    assert!(executor.launch_worker().await.is_err());
    assert_eq!(executor.state(), ExecutorState::Terminated);
    assert_eq!(fifo_count(dir.path()), 0);
}
