mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use helm_agent::{ScriptStep, ScriptedAgent, ScriptedResponse};
use helm_core::errors::AgentError;
use helm_core::events::AgentEvent;
use helm_core::ids::QueuedMessageId;
use helm_core::persistence::CompletionReason;
use helm_hub::{
    DequeueReason, HubConfig, HubError, SendOutcome, SendRequest, SessionEvent, SessionHub,
    SessionStatus, ShutdownReport,
};
use helm_telemetry::MetricsRecorder;

use common::*;

fn ask(tool_call_id: &str) -> ScriptedResponse {
    ScriptedResponse::Steps(vec![
        ScriptStep::Event(AgentEvent::ToolInputStart {
            tool_call_id: tool_call_id.into(),
            tool_name: "AskUserQuestion".into(),
        }),
        ScriptStep::Event(AgentEvent::ToolInputAvailable {
            tool_call_id: tool_call_id.into(),
            tool_name: "AskUserQuestion".into(),
            input: json!({"question": "Proceed?"}),
        }),
        ScriptStep::Hang,
    ])
}

fn is_tool_input(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::StreamEvent {
            event: AgentEvent::ToolInputAvailable { .. },
            ..
        }
    )
}

#[tokio::test]
async fn dequeue_absent_message_returns_false_silently() {
    let h = harness(vec![]).await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    let removed = h
        .hub
        .dequeue_message(&h.session_id, &QueuedMessageId::new())
        .await
        .unwrap();
    assert!(!removed);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn dequeued_message_never_runs() {
    let h = harness(vec![
        ScriptedResponse::hang_after_text("busy"),
        ScriptedResponse::text("kept"),
    ])
    .await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    h.hub
        .send(&h.session_id, SendRequest::text("first"))
        .await
        .unwrap();
    let dropped = match h
        .hub
        .send(&h.session_id, SendRequest::text("dropped"))
        .await
        .unwrap()
    {
        SendOutcome::Queued { queued_message } => queued_message.id,
        other => panic!("expected queued, got {other:?}"),
    };
    h.hub
        .send(&h.session_id, SendRequest::text("kept"))
        .await
        .unwrap();

    assert!(h
        .hub
        .dequeue_message(&h.session_id, &dropped)
        .await
        .unwrap());
    let events = recv_until(&mut sub, |e| {
        matches!(e, SessionEvent::MessageDequeued { reason: DequeueReason::Removed, .. })
    })
    .await;
    assert_matches!(
        events.last(),
        Some(SessionEvent::MessageDequeued { message_id, .. }) if *message_id == dropped
    );
    assert_eq!(h.hub.get_state(&h.session_id).await.unwrap().queue.len(), 1);

    h.hub.interrupt(&h.session_id).await.unwrap();
    wait_stopped(&mut sub, 2).await;
    assert_eq!(h.agent.prompts(), ["first", "kept"]);
}

#[tokio::test]
async fn delete_session_tears_down_a_running_turn() {
    let h = harness(vec![ScriptedResponse::hang_after_text("partial")]).await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    h.hub
        .send(&h.session_id, SendRequest::text("hello"))
        .await
        .unwrap();
    h.hub
        .send(&h.session_id, SendRequest::text("queued"))
        .await
        .unwrap();
    recv_until(&mut sub, |e| matches!(e, SessionEvent::StreamEvent { .. })).await;

    assert!(h.hub.delete_session(&h.session_id).await.unwrap());

    let rest = recv_until(&mut sub, |e| matches!(e, SessionEvent::SessionDeleted)).await;
    assert_eq!(stopped_count(&rest), 0);
    assert!(sub.recv().await.is_none());

    assert_eq!(h.agent.cancel_calls(), 1);
    assert_eq!(h.agent.call_count(), 1);
    assert_eq!(h.hub.loaded_sessions(), 0);
    assert_matches!(
        h.hub.get_state(&h.session_id).await,
        Err(HubError::SessionNotFound(_))
    );
}

#[tokio::test]
async fn delete_unknown_session_returns_false() {
    let h = harness(vec![]).await;
    assert!(!h
        .hub
        .delete_session(&helm_core::ids::SessionId::new())
        .await
        .unwrap());
}

#[tokio::test]
async fn shutdown_interrupts_every_streaming_session() {
    let agent = ScriptedAgent::new(vec![
        ScriptedResponse::hang_after_text("a"),
        ScriptedResponse::hang_after_text("b"),
    ]);
    let h = harness_with(agent, HubConfig::default()).await;
    let other = new_session(&h.hub).await;
    let idle = new_session(&h.hub).await;
    let mut sub_a = subscribe(&h.hub, &h.session_id).await;
    let mut sub_b = subscribe(&h.hub, &other).await;
    let _ = h.hub.get_state(&idle).await.unwrap();

    h.hub
        .send(&h.session_id, SendRequest::text("a"))
        .await
        .unwrap();
    h.hub
        .send(&h.session_id, SendRequest::text("a-queued"))
        .await
        .unwrap();
    h.hub.send(&other, SendRequest::text("b")).await.unwrap();
    assert_eq!(h.hub.streaming_sessions(), 2);

    let report = h.hub.shutdown().await;
    assert_eq!(
        report,
        ShutdownReport {
            interrupted: 2,
            timed_out: 0,
            failed: 0
        }
    );

    for sub in [&mut sub_a, &mut sub_b] {
        let events = recv_until(sub, is_stopped).await;
        assert_matches!(
            events.last(),
            Some(SessionEvent::SessionStopped {
                reason: CompletionReason::Interrupted,
                ..
            })
        );
    }
    // Queued work is not started once shutdown began.
    assert_eq!(h.agent.call_count(), 2);
    let state = h.hub.get_state(&h.session_id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Idle);
    assert_eq!(state.queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_after_the_timeout() {
    let config = HubConfig {
        shutdown_timeout: Duration::from_secs(1),
        ..HubConfig::default()
    };
    let agent = ScriptedAgent::new(vec![ScriptedResponse::hang_after_text("x")])
        .with_failing_cancel();
    let h = harness_with(agent, config).await;
    h.hub
        .send(&h.session_id, SendRequest::text("go"))
        .await
        .unwrap();
    h.store.delay("complete_turn", Duration::from_secs(60));

    let report = h.hub.shutdown().await;
    assert_eq!(report.interrupted, 0);
    assert_eq!(report.timed_out, 1);
}

#[tokio::test]
async fn shutdown_counts_failed_agent_cancels() {
    let agent = ScriptedAgent::new(vec![ScriptedResponse::hang_after_text("x")])
        .with_failing_cancel();
    let h = harness_with(agent, HubConfig::default()).await;
    h.hub
        .send(&h.session_id, SendRequest::text("go"))
        .await
        .unwrap();

    let report = h.hub.shutdown().await;
    assert_eq!(
        report,
        ShutdownReport {
            interrupted: 1,
            timed_out: 0,
            failed: 1
        }
    );
}

#[tokio::test]
async fn respond_resolves_a_pending_action() {
    let h = harness(vec![ask("call_1")]).await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    h.hub
        .send(&h.session_id, SendRequest::text("plan it"))
        .await
        .unwrap();
    recv_until(&mut sub, is_tool_input).await;

    let state = h.hub.get_state(&h.session_id).await.unwrap();
    assert_eq!(state.pending_actions.len(), 1);
    assert_eq!(state.pending_actions[0].tool_call_id, "call_1");
    assert_eq!(state.pending_actions[0].tool_name, "AskUserQuestion");

    let err = h
        .hub
        .respond(&h.session_id, "call_other", json!({}))
        .await
        .unwrap_err();
    assert_matches!(err, HubError::NoPendingAction { .. });

    h.hub
        .respond(&h.session_id, "call_1", json!({"answer": "yes"}))
        .await
        .unwrap();
    assert_eq!(
        h.agent.tool_responses(),
        vec![("call_1".to_string(), json!({"answer": "yes"}))]
    );
    let events = recv_until(&mut sub, |e| matches!(e, SessionEvent::ActionResolved { .. })).await;
    assert_matches!(
        events.last(),
        Some(SessionEvent::ActionResolved { tool_call_id, .. }) if tool_call_id == "call_1"
    );
    assert!(h
        .hub
        .get_state(&h.session_id)
        .await
        .unwrap()
        .pending_actions
        .is_empty());

    let again = h.hub.respond(&h.session_id, "call_1", json!({})).await;
    assert_matches!(again, Err(HubError::NoPendingAction { .. }));

    h.hub.interrupt(&h.session_id).await.unwrap();
}

#[tokio::test]
async fn respond_when_idle_has_nothing_pending() {
    let h = harness(vec![]).await;
    let err = h
        .hub
        .respond(&h.session_id, "call_1", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_PENDING_ACTION");
}

#[tokio::test]
async fn tool_output_clears_pending_action() {
    let h = harness(vec![ScriptedResponse::Steps(vec![
        ScriptStep::Event(AgentEvent::ToolInputAvailable {
            tool_call_id: "call_1".into(),
            tool_name: "ExitPlanMode".into(),
            input: json!({"plan": "p"}),
        }),
        ScriptStep::Event(AgentEvent::ToolInputAvailable {
            tool_call_id: "call_2".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "ls"}),
        }),
        ScriptStep::Event(AgentEvent::ToolOutputDenied {
            tool_call_id: "call_1".into(),
        }),
        ScriptStep::Hang,
    ])])
    .await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    h.hub
        .send(&h.session_id, SendRequest::text("go"))
        .await
        .unwrap();
    recv_until(&mut sub, |e| {
        matches!(
            e,
            SessionEvent::StreamEvent {
                event: AgentEvent::ToolOutputDenied { .. },
                ..
            }
        )
    })
    .await;
    assert!(h
        .hub
        .get_state(&h.session_id)
        .await
        .unwrap()
        .pending_actions
        .is_empty());
    h.hub.interrupt(&h.session_id).await.unwrap();
}

#[tokio::test]
async fn agent_error_event_ends_turn_with_error() {
    let h = harness(vec![ScriptedResponse::error_after_text("so far", "rate limited")]).await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    h.hub
        .send(&h.session_id, SendRequest::text("hi"))
        .await
        .unwrap();
    let events = recv_until(&mut sub, is_stopped).await;
    assert_matches!(
        events.last(),
        Some(SessionEvent::SessionStopped {
            reason: CompletionReason::Error,
            error: Some(e),
            ..
        }) if e == "rate limited"
    );
    let history = h.hub.history(&h.session_id).await.unwrap();
    assert_eq!(history[1].message.text(), "so far");
}

#[tokio::test]
async fn stream_failure_ends_turn_with_error() {
    let h = harness(vec![ScriptedResponse::Steps(vec![
        ScriptStep::Event(AgentEvent::TextStart { id: "t".into() }),
        ScriptStep::Fail(AgentError::Stream("pipe closed".into())),
    ])])
    .await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;

    h.hub
        .send(&h.session_id, SendRequest::text("hi"))
        .await
        .unwrap();
    let events = recv_until(&mut sub, is_stopped).await;
    assert_matches!(
        events.last(),
        Some(SessionEvent::SessionStopped {
            reason: CompletionReason::Error,
            error: Some(e),
            ..
        }) if e.contains("pipe closed")
    );
    assert_eq!(
        h.hub.get_state(&h.session_id).await.unwrap().status,
        SessionStatus::Idle
    );
}

#[tokio::test]
async fn failed_auto_start_returns_message_to_queue_head() {
    let h = harness(vec![ScriptedResponse::hang_after_text("busy")]).await;

    h.hub
        .send(&h.session_id, SendRequest::text("first"))
        .await
        .unwrap();
    h.hub
        .send(&h.session_id, SendRequest::text("second"))
        .await
        .unwrap();
    let mut sub = subscribe(&h.hub, &h.session_id).await;
    h.store.fail("create_turn");
    h.hub.interrupt(&h.session_id).await.unwrap();

    let events = recv_until(&mut sub, |e| matches!(e, SessionEvent::MessageQueued { .. })).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::MessageDequeued {
            reason: DequeueReason::Started,
            ..
        }
    )));
    let state = h.hub.get_state(&h.session_id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Idle);
    assert_eq!(state.queue.len(), 1);
    assert_eq!(state.queue[0].content, "second");
}

#[tokio::test]
async fn persistence_failures_after_start_do_not_block_idle() {
    let h = harness(vec![ScriptedResponse::text("hi"), ScriptedResponse::text("again")]).await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;
    h.store.fail("create_chat_messages");
    h.store.fail("upsert_cursor");
    h.store.fail("complete_turn");

    h.hub
        .send(&h.session_id, SendRequest::text("hello"))
        .await
        .unwrap();
    let events = recv_until(&mut sub, is_stopped).await;
    assert_matches!(
        events.last(),
        Some(SessionEvent::SessionStopped {
            reason: CompletionReason::Completed,
            ..
        })
    );

    let outcome = h.hub.send(&h.session_id, SendRequest::text("next")).await;
    assert_matches!(outcome, Ok(SendOutcome::Started { .. }));
    wait_stopped(&mut sub, 1).await;
}

#[tokio::test]
async fn turn_metrics_are_recorded() {
    let metrics = Arc::new(MetricsRecorder::in_memory().unwrap());
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::hang_after_text("x"),
        ScriptedResponse::text("y"),
    ]));
    let store = Arc::new(FlakyPersistence::new());
    let hub = SessionHub::with_metrics(
        agent.clone(),
        store.clone(),
        HubConfig::default(),
        Some(metrics.clone()),
    );
    let id = new_session(&hub).await;
    let mut sub = subscribe(&hub, &id).await;

    hub.send(&id, SendRequest::text("a")).await.unwrap();
    hub.send(&id, SendRequest::text("b")).await.unwrap();
    hub.interrupt(&id).await.unwrap();
    wait_stopped(&mut sub, 2).await;

    assert_eq!(metrics.counter_get("hub.turns.started", &[]), 2);
    assert_eq!(metrics.counter_get("hub.messages.queued", &[]), 1);
    assert_eq!(
        metrics.counter_get("hub.turns.completed", &[("reason", "interrupted")]),
        1
    );
    assert_eq!(
        metrics.counter_get("hub.turns.completed", &[("reason", "completed")]),
        1
    );
    assert_eq!(metrics.histogram_summary("hub.turn.duration_ms", &[]).count, 2);
    assert!(metrics.gauge_get("hub.sessions.streaming", &[]).abs() < f64::EPSILON);
}

#[tokio::test]
async fn session_being_deleted_rejects_new_work() {
    let h = harness(vec![
        ScriptedResponse::hang_after_text("partial"),
        ScriptedResponse::text("late"),
    ])
    .await;
    let mut sub = subscribe(&h.hub, &h.session_id).await;
    h.hub
        .send(&h.session_id, SendRequest::text("hello"))
        .await
        .unwrap();
    recv_until(&mut sub, |e| matches!(e, SessionEvent::StreamEvent { .. })).await;

    h.store.delay("delete_session", Duration::from_millis(200));
    let hub = h.hub.clone();
    let id = h.session_id.clone();
    let delete = tokio::spawn(async move { hub.delete_session(&id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_matches!(
        h.hub.send(&h.session_id, SendRequest::text("late")).await,
        Err(HubError::SessionNotFound(_))
    );
    assert_matches!(
        h.hub.subscribe(&h.session_id).await,
        Err(HubError::SessionNotFound(_))
    );
    assert_eq!(h.hub.loaded_sessions(), 1);

    assert!(delete.await.unwrap().unwrap());
    assert_eq!(h.agent.call_count(), 1);
    assert_eq!(h.hub.loaded_sessions(), 0);
    assert_matches!(
        h.hub.get_state(&h.session_id).await,
        Err(HubError::SessionNotFound(_))
    );
}
