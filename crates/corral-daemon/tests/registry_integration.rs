#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the execution registry against real `sh` processes.
//!
//! Covers the lifecycle paths a supervisor relies on:
//! - natural exit with ordered event capture
//! - concurrency rejection, kill, and cleanup rules
//! - timeouts and shutdown via `kill_all`
//! - children that fork and keep stdout open after exiting

use std::time::{Duration, Instant};

use corral_core::StreamEvent;
use corral_daemon::subprocess::{
    CommandSpec, ExecutionParams, ExecutionRecord, ExecutionRegistry, ExecutionStatus,
    RegistryChange, RegistryError,
};

const SESSION_SCRIPT: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"abc","model":"m"}'
echo 'warming up'
echo 'diagnostic noise' >&2
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
printf '%s\n' '{"type":"result","subtype":"success","result":"{\"ok\":true}"}'
"#;

fn params(script: &str) -> ExecutionParams {
    ExecutionParams::new(std::env::temp_dir(), CommandSpec::shell(script))
}

async fn wait(registry: &ExecutionRegistry, session_id: &str) -> ExecutionRecord {
    tokio::time::timeout(
        Duration::from_secs(10),
        registry.wait_for_completion(session_id),
    )
    .await
    .unwrap()
    .unwrap()
}

#[tokio::test]
async fn completed_execution_keeps_events_in_order() {
    let registry = ExecutionRegistry::with_max_concurrent(2).unwrap();
    let id = registry
        .start_execution(params(SESSION_SCRIPT).with_query("review"))
        .await
        .unwrap();

    let record = wait(&registry, &id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.process.is_none());
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert_eq!(record.query, "review");
    assert_eq!(record.reported_session_id.as_deref(), Some("abc"));

    let types: Vec<&str> = record.events.iter().map(StreamEvent::event_type).collect();
    assert_eq!(types, vec!["system", "assistant", "result"]);
    assert_eq!(record.final_result(), Some(r#"{"ok":true}"#));
}

#[tokio::test]
async fn nonzero_exit_marks_failed() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let id = registry.start_execution(params("exit 3")).await.unwrap();

    let record = wait(&registry, &id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, Some(3));
    assert!(record.error.unwrap().contains('3'));
}

#[tokio::test]
async fn line_split_across_writes_is_reassembled() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let script = r#"printf '{"type":"result",'; sleep 0.2; printf '"subtype":"success"}\n'"#;
    let id = registry.start_execution(params(script)).await.unwrap();

    let record = wait(&registry, &id).await;
    assert_eq!(record.events.len(), 1);
    assert!(record.events[0].is_terminal());
}

#[tokio::test]
async fn commands_run_in_working_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let params = ExecutionParams::new(
        dir.path(),
        CommandSpec::shell(r#"printf '{"type":"cwd","dir":"%s"}\n' "$(pwd -P)""#),
    );
    let id = registry.start_execution(params).await.unwrap();

    let record = wait(&registry, &id).await;
    let StreamEvent::Unrecognized { event_type, payload } = &record.events[0] else {
        panic!("expected an unrecognized event, got {:?}", record.events[0]);
    };
    assert_eq!(event_type, "cwd");
    assert_eq!(payload["dir"].as_str(), expected.to_str());
}

#[tokio::test]
async fn ceiling_rejects_without_creating_record() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let first = registry
        .start_execution(params("exec sleep 30"))
        .await
        .unwrap();
    assert_eq!(registry.running_count().await, 1);

    let err = registry
        .start_execution(params("exec sleep 30").with_session_id("second"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::ConcurrencyLimitExceeded { running: 1, max: 1 }
    ));
    assert!(registry.get_execution("second").await.is_none());
    assert_eq!(registry.list_executions().await.len(), 1);

    registry.kill_execution(&first).await.unwrap();
    assert_eq!(registry.running_count().await, 0);
    registry
        .start_execution(params("true").with_session_id("second"))
        .await
        .unwrap();
}

#[tokio::test]
async fn cleanup_refuses_running_and_accepts_killed() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let id = registry
        .start_execution(params("exec sleep 30"))
        .await
        .unwrap();

    let record = registry.get_execution(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert!(record.process.is_some());

    let err = registry.cleanup_execution(&id).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::InvalidLifecycleTransition {
            status: ExecutionStatus::Running,
            ..
        }
    ));

    registry.kill_execution(&id).await.unwrap();
    registry.cleanup_execution(&id).await.unwrap();
    assert!(registry.get_execution(&id).await.is_none());
}

#[tokio::test]
async fn repeated_kill_is_a_no_op() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let id = registry
        .start_execution(params("exec sleep 30"))
        .await
        .unwrap();

    registry.kill_execution(&id).await.unwrap();
    let first = registry.get_execution(&id).await.unwrap();
    registry.kill_execution(&id).await.unwrap();
    let second = registry.get_execution(&id).await.unwrap();

    assert_eq!(first.status, ExecutionStatus::Killed);
    assert_eq!(second.status, ExecutionStatus::Killed);
    assert_eq!(first.completed_at, second.completed_at);
}

#[tokio::test]
async fn kill_after_natural_exit_keeps_completed() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let id = registry.start_execution(params("true")).await.unwrap();
    wait(&registry, &id).await;

    registry.kill_execution(&id).await.unwrap();
    let record = registry.get_execution(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn timeout_kills_execution() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let id = registry
        .start_execution(params("exec sleep 30").with_timeout(Duration::from_millis(200)))
        .await
        .unwrap();

    let record = wait(&registry, &id).await;
    assert_eq!(record.status, ExecutionStatus::Killed);
    assert!(record.error.unwrap().contains("Timed out"));
    assert_eq!(registry.running_count().await, 0);
}

#[tokio::test]
async fn kill_all_stops_every_live_execution() {
    let registry = ExecutionRegistry::with_max_concurrent(3).unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            registry
                .start_execution(params("exec sleep 30"))
                .await
                .unwrap(),
        );
    }

    assert_eq!(registry.kill_all().await, 3);
    for id in &ids {
        let record = registry.get_execution(id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Killed);
    }
    assert_eq!(registry.cleanup_all_completed().await, 3);
}

#[tokio::test]
async fn event_subscribers_see_live_events() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let script = r#"sleep 0.3; printf '%s\n' '{"type":"result","subtype":"success","result":"done"}'"#;
    let id = registry.start_execution(params(script)).await.unwrap();
    let mut events = registry.subscribe_events(&id).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type(), "result");
}

#[tokio::test]
async fn timeout_fires_while_forked_child_holds_output() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let started = Instant::now();
    let id = registry
        .start_execution(
            params("sleep 5 & echo started").with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    let record = wait(&registry, &id).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(record.status, ExecutionStatus::Killed);
    assert!(record.error.unwrap().contains("Timed out"));
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(registry.running_count().await, 0);
}

#[tokio::test]
async fn kill_after_exit_stops_forked_child() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let params = ExecutionParams::new(
        dir.path(),
        CommandSpec::shell("(sleep 1; touch orphan-ran) & echo started"),
    );
    let id = registry.start_execution(params).await.unwrap();

    // Let the shell itself exit while the subshell keeps stdout open.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        registry.get_execution(&id).await.unwrap().status,
        ExecutionStatus::Running
    );

    registry.kill_execution(&id).await.unwrap();
    assert_eq!(registry.running_count().await, 0);
    let record = wait(&registry, &id).await;
    assert_eq!(record.status, ExecutionStatus::Killed);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!dir.path().join("orphan-ran").exists());
}

#[tokio::test]
async fn timeout_racing_exit_settles_once() {
    let registry = ExecutionRegistry::with_max_concurrent(1).unwrap();
    let mut changes = registry.subscribe_changes();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = registry
            .start_execution(params("sleep 0.2").with_timeout(Duration::from_millis(200)))
            .await
            .unwrap();
        let record = wait(&registry, &id).await;
        assert!(matches!(
            record.status,
            ExecutionStatus::Completed | ExecutionStatus::Killed
        ));
        ids.push(id);
    }

    // Give a losing monitor time to try a second transition.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(change);
    }

    for id in &ids {
        let terminal = seen
            .iter()
            .filter(|change| change.session_id() == id.as_str())
            .filter(|change| {
                matches!(change, RegistryChange::Transitioned { to, .. } if to.is_terminal())
            })
            .count();
        assert_eq!(terminal, 1, "session {id} settled {terminal} times");
    }
}
