// Part of the consolidated `pyra-dap` integration test harness (`tests/tests.rs`).
use std::collections::BTreeSet;
use std::time::Duration;

use pyra_dap::{DebugError, DebugEvent, RunState, TerminationCause};

use crate::harness::{attach, attach_with_timeout, MockAdapter, MockAdapterConfig, PROGRAM};

#[tokio::test]
async fn breakpoint_stop_then_continue_runs_to_exit() {
    let mock = MockAdapter::spawn().await.unwrap();
    let mut attached = attach(&mock, &[5]).await;

    let generation = match attached.next_event().await {
        DebugEvent::Stopped {
            reason,
            thread_id,
            generation,
        } => {
            assert_eq!(reason, "breakpoint");
            assert_eq!(thread_id, Some(1));
            generation
        }
        other => panic!("expected stopped event, got {other:?}"),
    };
    let session = attached.session.clone();
    let status = session.status();
    assert_eq!(status.state, RunState::Paused);
    assert_eq!(status.generation, generation);
    assert_eq!(status.active_thread, Some(1));
    assert_eq!(status.stop_reason.as_deref(), Some("breakpoint"));

    let frames = session.stack_trace(1).await.unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].line, 5);
    assert_eq!(frames[0].source.as_deref(), Some(std::path::Path::new(PROGRAM)));
    assert_eq!(frames[0].frame.generation(), generation);

    session.continue_(1).await.unwrap();
    assert_eq!(
        attached.next_event().await,
        DebugEvent::Terminated(TerminationCause::Exited { exit_code: Some(0) })
    );
    let status = session.status();
    assert_eq!(status.state, RunState::Terminated);
    assert_eq!(
        status.termination,
        Some(TerminationCause::Exited { exit_code: Some(0) })
    );

    // Terminated is final: nothing else is emitted and the stream ends.
    assert!(attached.events.recv().await.is_none());
    assert!(matches!(
        session.stack_trace(1).await,
        Err(DebugError::SessionTerminated)
    ));
    session.continue_(1).await.unwrap();
}

#[tokio::test]
async fn program_exit_code_is_carried_into_termination() {
    let mock = MockAdapter::spawn_with_config(MockAdapterConfig {
        exit_code: 7,
        ..MockAdapterConfig::default()
    })
    .await
    .unwrap();
    let mut attached = attach(&mock, &[5]).await;
    assert!(matches!(
        attached.next_event().await,
        DebugEvent::Stopped { .. }
    ));

    attached.session.continue_(1).await.unwrap();
    assert_eq!(
        attached.next_event().await,
        DebugEvent::Terminated(TerminationCause::Exited { exit_code: Some(7) })
    );
}

#[tokio::test]
async fn steps_move_one_line_and_open_a_new_generation() {
    let mock = MockAdapter::spawn().await.unwrap();
    let mut attached = attach(&mock, &[5]).await;
    let DebugEvent::Stopped {
        generation: mut previous,
        ..
    } = attached.next_event().await
    else {
        panic!("expected stopped event");
    };

    let session = attached.session.clone();
    for (expected_line, step) in [(6, "next"), (7, "stepIn"), (8, "stepOut")] {
        match step {
            "next" => session.step_over(1).await.unwrap(),
            "stepIn" => session.step_into(1).await.unwrap(),
            _ => session.step_out(1).await.unwrap(),
        }
        match attached.next_event().await {
            DebugEvent::Stopped {
                reason, generation, ..
            } => {
                assert_eq!(reason, "step");
                assert!(generation > previous, "{generation} <= {previous}");
                previous = generation;
            }
            other => panic!("expected stopped event after `{step}`, got {other:?}"),
        }
        let frames = session.stack_trace(1).await.unwrap();
        assert_eq!(frames[0].line, expected_line);
        assert_eq!(mock.request_count(step), 1);
    }
}

#[tokio::test]
async fn pause_is_reported_through_a_stopped_event() {
    let mock = MockAdapter::spawn().await.unwrap();
    let mut attached = attach(&mock, &[5]).await;
    let DebugEvent::Stopped { generation, .. } = attached.next_event().await else {
        panic!("expected stopped event");
    };

    attached.session.pause(1).await.unwrap();
    match attached.next_event().await {
        DebugEvent::Stopped {
            reason,
            generation: paused,
            ..
        } => {
            assert_eq!(reason, "pause");
            assert!(paused > generation);
        }
        other => panic!("expected stopped event, got {other:?}"),
    }
    assert_eq!(attached.session.status().stop_reason.as_deref(), Some("pause"));

    let pause = mock
        .requests()
        .into_iter()
        .find(|request| request.command == "pause")
        .unwrap();
    assert_eq!(pause.arguments, serde_json::json!({"threadId": 1}));
}

#[tokio::test]
async fn resume_while_running_is_rejected_locally() {
    let mock = MockAdapter::spawn_with_config(MockAdapterConfig {
        silent_commands: BTreeSet::from(["next".to_owned()]),
        ..MockAdapterConfig::default()
    })
    .await
    .unwrap();
    let mut attached = attach(&mock, &[5]).await;
    assert!(matches!(
        attached.next_event().await,
        DebugEvent::Stopped { .. }
    ));

    let session = attached.session.clone();
    let step = tokio::spawn(async move { session.step_over(1).await });
    attached
        .session
        .wait_for_state(RunState::Running)
        .await
        .unwrap();

    assert!(matches!(
        attached.session.stack_trace(1).await,
        Err(DebugError::NotPaused)
    ));
    assert!(matches!(
        attached.session.continue_(1).await,
        Err(DebugError::NotPaused)
    ));
    assert_eq!(mock.request_count("continue"), 0);

    // The silent adapter never answers the step.
    assert!(matches!(
        step.await.unwrap(),
        Err(DebugError::Timeout { .. })
    ));
}

#[tokio::test]
async fn rejected_continue_reverts_to_paused() {
    let mock = MockAdapter::spawn_with_config(MockAdapterConfig {
        reject_commands: BTreeSet::from(["continue".to_owned()]),
        ..MockAdapterConfig::default()
    })
    .await
    .unwrap();
    let mut attached = attach(&mock, &[5]).await;
    let DebugEvent::Stopped { generation, .. } = attached.next_event().await else {
        panic!("expected stopped event");
    };

    let err = attached.session.continue_(1).await.unwrap_err();
    assert!(
        matches!(&err, DebugError::AdapterRejected { command, .. } if command == "continue"),
        "{err}"
    );
    let status = attached.session.status();
    assert_eq!(status.state, RunState::Paused);
    assert!(status.generation > generation);

    // Inspection works again at the new generation.
    let frames = attached.session.stack_trace(1).await.unwrap();
    assert_eq!(frames[0].frame.generation(), status.generation);
}

#[tokio::test]
async fn disconnect_terminates_as_user_stopped() {
    let mock = MockAdapter::spawn().await.unwrap();
    let mut attached = attach(&mock, &[5]).await;
    assert!(matches!(
        attached.next_event().await,
        DebugEvent::Stopped { .. }
    ));

    attached.session.disconnect().await.unwrap();
    assert_eq!(
        attached.next_event().await,
        DebugEvent::Terminated(TerminationCause::UserStopped)
    );
    assert_eq!(mock.request_count("disconnect"), 1);
    assert_eq!(
        mock.requests()
            .iter()
            .find(|request| request.command == "disconnect")
            .map(|request| request.arguments["terminateDebuggee"].clone()),
        Some(serde_json::Value::Bool(true))
    );

    // A second disconnect is a no-op.
    attached.session.disconnect().await.unwrap();
    assert_eq!(mock.request_count("disconnect"), 1);
}

#[tokio::test]
async fn thread_events_feed_the_thread_table() {
    let mock = MockAdapter::spawn().await.unwrap();
    let mut attached = attach(&mock, &[5]).await;
    assert!(matches!(
        attached.next_event().await,
        DebugEvent::Stopped { .. }
    ));
    assert!(attached.session.known_threads().contains_key(&1));

    let threads = attached.session.threads().await.unwrap();
    assert_eq!(threads.get(&1).map(String::as_str), Some("MainThread"));
    assert_eq!(attached.session.known_threads(), threads);
}

#[tokio::test]
async fn unanswered_continue_leaves_the_program_paused() {
    let mock = MockAdapter::spawn_with_config(MockAdapterConfig {
        silent_commands: BTreeSet::from(["continue".to_owned()]),
        ..MockAdapterConfig::default()
    })
    .await
    .unwrap();
    let mut attached = attach_with_timeout(&mock, &[5], Duration::from_millis(200)).await;
    assert!(matches!(
        attached.next_event().await,
        DebugEvent::Stopped { .. }
    ));

    for _ in 0..2 {
        match attached.session.continue_(1).await {
            Err(DebugError::Timeout { command, .. }) => assert_eq!(command, "continue"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(attached.session.status().state, RunState::Paused);
    }
    assert_eq!(mock.request_count("continue"), 2);
    assert_eq!(attached.session.stack_trace(1).await.unwrap()[0].line, 5);
}
