// Part of the consolidated `pyra-dap` integration test harness (`tests/tests.rs`).
use std::collections::BTreeSet;

use pyra_dap::{
    DebugError, DebugEvent, ExecutionManager, LaunchRequest, RouterEvent, RunState,
    TerminationCause, Topic,
};
use pyra_process::{ExitCause, ProcessEvent, RunRequest, SupervisorError};
use serde_json::Value;

use crate::harness::{
    helper_config, next_routed, write_script, MockAdapter, MockAdapterConfig, PROGRAM,
};

async fn next_debug_event(subscription: &mut pyra_dap::Subscription) -> DebugEvent {
    loop {
        match next_routed(subscription).await {
            RouterEvent::Debug {
                event: DebugEvent::Thread { .. },
                ..
            } => continue,
            RouterEvent::Debug { event, .. } => return event,
            RouterEvent::Process { .. } => continue,
        }
    }
}

#[tokio::test]
async fn launch_runs_the_debuggee_and_routes_both_streams() {
    let mock = MockAdapter::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "app.py", &["print from debuggee", "sleep 30000"]);

    let mut config = helper_config();
    config.debug.port = Some(mock.port());
    let manager = ExecutionManager::from_config(&config);
    let mut panel = manager.subscribe(Topic::DebugPanel);
    let mut console = manager.subscribe(Topic::Console);

    let request =
        LaunchRequest::new(RunRequest::direct(&script, dir.path())).with_breakpoint(PROGRAM, 5);
    let session = manager.launch(request).await.unwrap();
    assert_eq!(manager.session().map(|s| s.id()), Some(session.id()));

    match next_debug_event(&mut panel).await {
        DebugEvent::Stopped {
            reason, thread_id, ..
        } => {
            assert_eq!(reason, "breakpoint");
            assert_eq!(thread_id, Some(1));
        }
        other => panic!("expected stopped event, got {other:?}"),
    }
    loop {
        if let RouterEvent::Process {
            event: ProcessEvent::Stdout(line),
            ..
        } = next_routed(&mut console).await
        {
            assert_eq!(line, "from debuggee");
            break;
        }
    }

    let launch = mock
        .requests()
        .into_iter()
        .find(|request| request.command == "launch")
        .unwrap();
    assert_eq!(launch.arguments["type"], "python");
    assert_eq!(launch.arguments["request"], "launch");
    assert_eq!(
        launch.arguments["program"],
        Value::String(script.to_string_lossy().into_owned())
    );
    assert_eq!(launch.arguments["justMyCode"], true);

    // One program at a time, however it was started.
    assert!(matches!(
        manager.run(RunRequest::direct(&script, dir.path())).await,
        Err(SupervisorError::AlreadyRunning { .. })
    ));

    let exit = manager.stop().await.expect("debuggee exit");
    assert_eq!(exit.cause, ExitCause::Stopped);
    assert_eq!(
        next_debug_event(&mut panel).await,
        DebugEvent::Terminated(TerminationCause::UserStopped)
    );
    assert_eq!(session.status().state, RunState::Terminated);
    assert_eq!(mock.request_count("disconnect"), 1);
    assert!(!manager.supervisor().is_running());
}

#[tokio::test]
async fn debuggee_exit_before_the_adapter_listens_reports_its_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "crash.py", &["eprint boom", "exit 3"]);
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = helper_config();
    config.debug.port = Some(port);
    let manager = ExecutionManager::from_config(&config);

    let err = manager
        .launch(LaunchRequest::new(RunRequest::direct(&script, dir.path())))
        .await
        .unwrap_err();
    match &err {
        DebugError::Connect { detail, .. } => assert!(detail.contains("boom"), "{detail}"),
        other => panic!("expected connect failure, got {other}"),
    }
    assert!(!manager.supervisor().is_running());
    assert!(manager.session().is_none());
}

#[tokio::test]
async fn failed_handshake_stops_the_debuggee() {
    let mock = MockAdapter::spawn_with_config(MockAdapterConfig {
        reject_commands: BTreeSet::from(["launch".to_owned()]),
        ..MockAdapterConfig::default()
    })
    .await
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "app.py", &["sleep 30000"]);

    let mut config = helper_config();
    config.debug.port = Some(mock.port());
    config.debug.request_timeout_ms = 300;
    let manager = ExecutionManager::from_config(&config);
    let mut console = manager.subscribe(Topic::Console);

    assert!(manager
        .launch(LaunchRequest::new(RunRequest::direct(&script, dir.path())))
        .await
        .is_err());
    assert!(!manager.supervisor().is_running());
    loop {
        if let RouterEvent::Process {
            event: ProcessEvent::Completed(exit),
            ..
        } = next_routed(&mut console).await
        {
            assert_eq!(exit.cause, ExitCause::Stopped);
            break;
        }
    }
}

#[tokio::test]
async fn missing_adapter_is_reported_before_the_debuggee_starts() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "app.py", &["print should not run"]);
    std::fs::write(dir.path().join("no-adapter"), b"").unwrap();

    let manager = ExecutionManager::from_config(&helper_config());
    let mut console = manager.subscribe(Topic::Console);

    let err = manager
        .launch(LaunchRequest::new(RunRequest::direct(&script, dir.path())))
        .await
        .unwrap_err();
    match &err {
        DebugError::AdapterUnavailable { module, detail, .. } => {
            assert_eq!(module, "debugpy");
            assert!(detail.contains("No module named debugpy"), "{detail}");
        }
        other => panic!("expected a missing adapter, got {other}"),
    }
    assert!(err.to_string().contains("pip install debugpy"), "{err}");
    assert!(!manager.supervisor().is_running());
    assert!(manager.session().is_none());
    // Nothing was started, so nothing was routed.
    assert!(console.try_recv().is_none());
}
