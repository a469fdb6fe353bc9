use std::sync::{Arc, Mutex};

use jdbg_core::{DebugError, DebugEvent, EventKind, EventPayload, SessionState};
use jdbg_jdwp::{EventSet, MockRequestKind, StepDepth, StepSize, SuspendPolicy, TargetEvent};

use crate::harness::{app, eventually, next_event};

#[tokio::test]
async fn sequence_numbers_strictly_increase() {
    let app = app();
    let session = app.attach().await;

    let workers: Vec<_> = (0..3)
        .map(|i| app.mock.start_thread(&format!("worker-{i}")))
        .collect();

    let mut sequences = Vec::new();
    for worker in &workers {
        let event = next_event(&session, EventKind::ThreadStart).await;
        match event.payload {
            EventPayload::ThreadStart { thread_id, name } => {
                assert_eq!(thread_id, *worker);
                assert!(name.starts_with("worker-"));
            }
            other => panic!("expected a thread start, got {other:?}"),
        }
        sequences.push(event.sequence);
    }
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]), "{sequences:?}");

    // Lifecycle sets never leave the target suspended.
    eventually("thread start sets to be resumed", || app.mock.resumed_event_sets() == 3).await;
}

#[tokio::test]
async fn polling_with_a_non_matching_filter_drains_the_buffer() {
    let app = app();
    let session = app.attach().await;
    app.mock.start_thread("a");
    app.mock.start_thread("b");
    eventually("two buffered events", || session.event_buffer_info().buffered_count == 2).await;

    assert!(session.poll_events(10, &[EventKind::BreakpointHit]).is_empty());
    assert_eq!(session.event_buffer_info().buffered_count, 0);
}

#[tokio::test]
async fn waiting_for_an_absent_kind_times_out_and_empties_the_buffer() {
    let app = app();
    let session = app.attach().await;
    app.mock.start_thread("a");
    app.mock.start_thread("b");
    eventually("two buffered events", || session.event_buffer_info().buffered_count == 2).await;

    let waited = session.wait_for_event(100, &[EventKind::ExceptionThrown]).await;
    assert!(waited.is_none());
    assert_eq!(session.event_buffer_info().buffered_count, 0);
}

#[tokio::test]
async fn poll_respects_limits_and_keeps_order() {
    let app = app();
    let session = app.attach().await;
    for name in ["a", "b", "c"] {
        app.mock.start_thread(name);
    }
    eventually("three buffered events", || session.event_buffer_info().buffered_count == 3).await;

    let first = session.poll_events(2, &[]);
    assert_eq!(first.len(), 2);
    assert!(first[0].sequence < first[1].sequence);

    let rest = session.poll_events(0, &[]);
    assert_eq!(rest.len(), 1);
    assert!(rest[0].sequence > first[1].sequence);

    let info = session.event_buffer_info();
    assert_eq!(info.buffered_count, 0);
    assert_eq!(info.capacity, 1000);
    assert!(!info.dropped);
}

#[tokio::test]
async fn clear_discards_buffered_events() {
    let app = app();
    let session = app.attach().await;
    app.mock.start_thread("a");
    eventually("a buffered event", || session.event_buffer_info().buffered_count == 1).await;

    session.clear_events();
    let info = session.event_buffer_info();
    assert_eq!(info.buffered_count, 0);
    assert_eq!(info.oldest_timestamp_ms, None);
}

#[tokio::test]
async fn listeners_receive_live_events() {
    let app = app();
    let session = app.attach().await;
    let seen: Arc<Mutex<Vec<DebugEvent>>> = Arc::default();
    let sink = seen.clone();
    let id = session.add_listener(Arc::new(move |event: &DebugEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    app.mock.start_thread("listened");
    eventually("the listener to fire", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0].kind(), EventKind::ThreadStart);
    // Listeners do not consume buffered events.
    assert_eq!(session.event_buffer_info().buffered_count, 1);

    assert!(session.remove_listener(id));
    assert!(!session.remove_listener(id));
}

#[tokio::test]
async fn thread_death_is_reported_with_the_thread_name() {
    let app = app();
    let session = app.attach().await;
    let worker = app.mock.add_thread("short-lived");

    app.mock.push_event_set(EventSet {
        suspend_policy: SuspendPolicy::None,
        events: vec![TargetEvent::ThreadDeath { thread: worker }],
    });
    let event = next_event(&session, EventKind::ThreadDeath).await;
    assert_eq!(
        event.payload,
        EventPayload::ThreadDeath {
            thread_id: worker,
            name: "short-lived".to_string(),
        }
    );
}

#[tokio::test]
async fn disconnect_emits_an_event_and_ends_the_session() {
    let app = app();
    let session = app.attach().await;

    app.mock.disconnect();
    let event = next_event(&session, EventKind::VmDisconnect).await;
    assert_eq!(
        event.payload,
        EventPayload::VmDisconnect {
            reason: "VM disconnected".to_string()
        }
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.resume().await, Err(DebugError::VmDisconnected)));
}

#[tokio::test]
async fn vm_death_reports_exit_code_zero() {
    let app = app();
    let session = app.attach().await;
    app.mock.vm_death();
    let event = next_event(&session, EventKind::VmDeath).await;
    assert_eq!(event.payload, EventPayload::VmDeath { exit_code: 0 });
}

#[tokio::test]
async fn stepping_resumes_and_reports_completion() {
    let app = app();
    let session = app.stopped_at_line_11().await;
    let resumes_before = app.mock.resume_all_calls();

    session
        .step(None, StepDepth::Over, StepSize::Line)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(app.mock.resume_all_calls(), resumes_before + 1);
    let step = app
        .mock
        .requests()
        .into_iter()
        .find(|r| matches!(r.kind, MockRequestKind::Step { .. }))
        .expect("step request");
    assert_eq!(
        step.kind,
        MockRequestKind::Step {
            thread: app.main_thread,
            size: StepSize::Line,
            depth: StepDepth::Over,
        }
    );

    // The thread is running now, so it cannot be stepped again.
    assert!(matches!(
        session.step(None, StepDepth::Into, StepSize::Line).await,
        Err(DebugError::ThreadNotSuspended(thread)) if thread == app.main_thread
    ));

    assert!(app.mock.complete_step(app.main_thread, app.line_12));
    let event = next_event(&session, EventKind::StepCompleted).await;
    match event.payload {
        EventPayload::StepCompleted { location } => {
            assert_eq!(location.line, Some(12));
            assert_eq!(location.method_name, "run");
        }
        other => panic!("expected a step event, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Suspended);
    assert!(app.mock.request(step.id).is_none(), "completed step request is deleted");
}

#[tokio::test]
async fn stepping_needs_a_thread() {
    let app = app();
    let session = app.attach().await;
    assert!(matches!(
        session.step(None, StepDepth::Over, StepSize::Line).await,
        Err(DebugError::NoThreadSelected)
    ));
}

#[tokio::test]
async fn events_serialize_with_their_envelope() {
    let app = app();
    let session = app.attach().await;
    app.mock.start_thread("json");
    let event = next_event(&session, EventKind::ThreadStart).await;

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "thread_start");
    assert_eq!(json["name"], "json");
    assert_eq!(json["session_id"], session.id());
    assert_eq!(json["sequence"], event.sequence);
}
