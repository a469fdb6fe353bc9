use jdbg_core::{BreakpointKind, DebugError, EventKind, EventPayload, SessionState};
use jdbg_jdwp::MockRequestKind;

use crate::harness::{app, eventually, next_event};

#[tokio::test]
async fn line_breakpoint_installs_one_request_per_location() {
    let app = app();
    let session = app.attach().await;

    let single = session.add_line_breakpoint("com.example.App", 10).await.unwrap();
    assert!(!single.pending);
    assert!(single.enabled);
    assert_eq!(single.resolved_locations, 1);
    assert_eq!(single.id.len(), 8);
    assert_eq!(single.location_string(), "com.example.App:10");

    let double = session.add_line_breakpoint("com.example.App", 21).await.unwrap();
    assert_eq!(double.resolved_locations, 2);
    assert_eq!(app.mock.breakpoint_requests().len(), 3);
    assert_eq!(session.list_breakpoints().len(), 2);
}

#[tokio::test]
async fn lines_without_code_are_rejected() {
    let app = app();
    let session = app.attach().await;

    assert!(matches!(
        session.add_line_breakpoint("com.example.App", 99).await,
        Err(DebugError::InvalidBreakpointLocation(_))
    ));
    assert!(matches!(
        session.add_method_breakpoint("com.example.App", "missing").await,
        Err(DebugError::InvalidBreakpointLocation(_))
    ));
    assert!(session.list_breakpoints().is_empty());
    assert!(app.mock.breakpoint_requests().is_empty());
}

#[tokio::test]
async fn method_breakpoint_stops_at_the_method_entry() {
    let app = app();
    let session = app.attach().await;

    let spec = session.add_method_breakpoint("com.example.App", "compute").await.unwrap();
    assert_eq!(
        spec.kind,
        BreakpointKind::Method {
            method: "compute".to_string()
        }
    );
    let requests = app.mock.breakpoint_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, MockRequestKind::Breakpoint(app.line_20));
}

#[tokio::test]
async fn deferred_breakpoint_materializes_when_the_class_loads() {
    let app = app();
    let object = app.mock.class_id("java.lang.Object");
    let later = app.mock.define_unloaded_class("com.example.Later", object);
    let work = app.mock.add_method(later, "work", "()V", false, None);
    app.mock.add_line(&work, 7);
    app.mock.add_line(&work, 7);

    let session = app.attach().await;
    let first = session.add_line_breakpoint("com.example.Later", 7).await.unwrap();
    let second = session.add_method_breakpoint("com.example.Later", "work").await.unwrap();
    assert!(first.pending && second.pending);
    assert!(app.mock.breakpoint_requests().is_empty());

    let watches: Vec<_> = app
        .mock
        .requests()
        .into_iter()
        .filter(|r| matches!(r.kind, MockRequestKind::ClassPrepare(_)))
        .collect();
    assert_eq!(watches.len(), 1, "pending breakpoints share one class watch");

    assert!(app.mock.load_class(app.main_thread, later));
    eventually("deferred breakpoints to install", || {
        session.list_breakpoints().iter().all(|spec| !spec.pending)
    })
    .await;

    let first = session.breakpoint(&first.id).unwrap();
    assert_eq!(first.resolved_locations, 2);
    let second = session.breakpoint(&second.id).unwrap();
    assert_eq!(second.resolved_locations, 1);
    assert_eq!(app.mock.breakpoint_requests().len(), 3);
    assert!(app.mock.request(watches[0].id).is_none());
}

#[tokio::test]
async fn disabling_a_pending_breakpoint_survives_materialization() {
    let app = app();
    let object = app.mock.class_id("java.lang.Object");
    let later = app.mock.define_unloaded_class("com.example.Later", object);
    let work = app.mock.add_method(later, "work", "()V", false, None);
    let location = app.mock.add_line(&work, 3);

    let session = app.attach().await;
    let spec = session.add_line_breakpoint("com.example.Later", 3).await.unwrap();
    session.disable_breakpoint(&spec.id).await.unwrap();

    app.mock.load_class(app.main_thread, later);
    eventually("deferred breakpoint to install", || {
        !session.breakpoint(&spec.id).unwrap().pending
    })
    .await;

    let requests = app.mock.breakpoint_requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].enabled);
    assert!(!app.mock.hit_breakpoint(app.main_thread, location));

    session.enable_breakpoint(&spec.id).await.unwrap();
    assert!(app.mock.request(requests[0].id).unwrap().enabled);
}

#[tokio::test]
async fn hits_count_and_stop_the_target() {
    let app = app();
    let session = app.attach().await;
    let spec = session.add_line_breakpoint("com.example.App", 11).await.unwrap();

    assert!(app.mock.hit_breakpoint(app.main_thread, app.line_11));
    let event = next_event(&session, EventKind::BreakpointHit).await;
    match event.payload {
        EventPayload::BreakpointHit {
            breakpoint_id,
            location,
        } => {
            assert_eq!(breakpoint_id.as_deref(), Some(spec.id.as_str()));
            assert_eq!(location.thread_id, app.main_thread);
            assert_eq!(location.thread_name, "main");
            assert_eq!(location.method_name, "run");
            assert_eq!(location.line, Some(11));
        }
        other => panic!("expected a breakpoint hit, got {other:?}"),
    }

    assert_eq!(session.breakpoint(&spec.id).unwrap().hit_count, 1);
    assert_eq!(session.state(), SessionState::Suspended);
    assert_eq!(session.selected_thread(), Some(app.main_thread));
    assert!(app.mock.is_suspended(app.main_thread));
    assert_eq!(app.mock.resumed_event_sets(), 0);

    session.resume().await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert!(!app.mock.is_suspended(app.main_thread));
}

#[tokio::test]
async fn disabled_breakpoints_do_not_fire() {
    let app = app();
    let session = app.attach().await;
    let spec = session.add_line_breakpoint("com.example.App", 12).await.unwrap();

    session.disable_breakpoint(&spec.id).await.unwrap();
    assert!(!session.breakpoint(&spec.id).unwrap().enabled);
    assert!(!app.mock.hit_breakpoint(app.main_thread, app.line_12));

    session.enable_breakpoint(&spec.id).await.unwrap();
    assert!(app.mock.hit_breakpoint(app.main_thread, app.line_12));
}

#[tokio::test]
async fn removing_breakpoints_deletes_their_requests() {
    let app = app();
    let session = app.attach().await;
    let spec = session.add_line_breakpoint("com.example.App", 21).await.unwrap();
    session.add_line_breakpoint("com.example.App", 10).await.unwrap();
    assert_eq!(app.mock.breakpoint_requests().len(), 3);

    session.remove_breakpoint(&spec.id).await.unwrap();
    assert_eq!(app.mock.breakpoint_requests().len(), 1);
    assert!(matches!(
        session.remove_breakpoint(&spec.id).await,
        Err(DebugError::BreakpointNotFound(id)) if id == spec.id
    ));
    assert!(matches!(
        session.enable_breakpoint("nope").await,
        Err(DebugError::BreakpointNotFound(_))
    ));
}

#[tokio::test]
async fn clear_removes_every_kind_of_breakpoint() {
    let app = app();
    let session = app.attach().await;
    session.add_line_breakpoint("com.example.App", 10).await.unwrap();
    session.add_method_breakpoint("com.example.App", "compute").await.unwrap();
    session.add_exception_breakpoint("*", true, true).await.unwrap();

    assert_eq!(session.clear_breakpoints().await, 3);
    assert!(session.list_breakpoints().is_empty());
    assert!(session.list_exception_breakpoints().is_empty());
    assert!(app
        .mock
        .requests()
        .iter()
        .all(|r| matches!(r.kind, MockRequestKind::ThreadStart | MockRequestKind::ThreadDeath)));
}

#[tokio::test]
async fn exception_breakpoints_report_class_message_and_catch_state() {
    let app = app();
    let session = app.attach().await;
    let spec = session
        .add_exception_breakpoint("java.lang.RuntimeException", true, true)
        .await
        .unwrap();
    assert_eq!(spec.class_name, "java.lang.RuntimeException");
    let arithmetic = app.mock.class_id("java.lang.ArithmeticException").unwrap();
    let runtime = app.mock.class_id("java.lang.RuntimeException").unwrap();
    match &app.mock.requests().last().unwrap().kind {
        MockRequestKind::Exception { exception, .. } => assert_eq!(*exception, Some(runtime)),
        other => panic!("expected an exception request, got {other:?}"),
    }

    let exception = app.mock.new_exception(arithmetic, Some("/ by zero"));
    assert!(app
        .mock
        .throw_exception(app.main_thread, app.line_12, exception, Some(app.line_10)));

    let event = next_event(&session, EventKind::ExceptionThrown).await;
    match event.payload {
        EventPayload::ExceptionThrown {
            exception_class,
            message,
            caught,
            location,
        } => {
            assert_eq!(exception_class, "java.lang.ArithmeticException");
            assert_eq!(message.as_deref(), Some("/ by zero"));
            assert!(caught);
            assert_eq!(location.line, Some(12));
        }
        other => panic!("expected an exception event, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Suspended);
}

#[tokio::test]
async fn exception_breakpoints_respect_caught_and_uncaught_flags() {
    let app = app();
    let session = app.attach().await;
    let spec = session.add_exception_breakpoint("any", false, true).await.unwrap();
    assert_eq!(spec.class_name, "*");

    let arithmetic = app.mock.class_id("java.lang.ArithmeticException").unwrap();
    let exception = app.mock.new_exception(arithmetic, None);
    assert!(!app
        .mock
        .throw_exception(app.main_thread, app.line_12, exception.clone(), Some(app.line_10)));

    session.disable_breakpoint(&spec.id).await.unwrap();
    assert!(!app.mock.throw_exception(app.main_thread, app.line_12, exception.clone(), None));

    session.enable_breakpoint(&spec.id).await.unwrap();
    assert!(app.mock.throw_exception(app.main_thread, app.line_12, exception, None));
    let event = next_event(&session, EventKind::ExceptionThrown).await;
    assert!(matches!(
        event.payload,
        EventPayload::ExceptionThrown { caught: false, message: None, .. }
    ));

    session.remove_breakpoint(&spec.id).await.unwrap();
    assert!(session.list_exception_breakpoints().is_empty());
}

#[tokio::test]
async fn unloaded_exception_classes_fall_back_to_every_throwable() {
    let app = app();
    let session = app.attach().await;
    let spec = session
        .add_exception_breakpoint("com.example.NotYetLoaded", true, false)
        .await
        .unwrap();
    assert_eq!(spec.class_name, "com.example.NotYetLoaded");
    match &app.mock.requests().last().unwrap().kind {
        MockRequestKind::Exception { exception, .. } => assert_eq!(*exception, None),
        other => panic!("expected an exception request, got {other:?}"),
    }
}

#[tokio::test]
async fn conditions_are_recorded_and_reported() {
    let app = app();
    let object = app.mock.class_id("java.lang.Object");
    let later = app.mock.define_unloaded_class("com.example.Later", object);
    let work = app.mock.add_method(later, "work", "()V", false, None);
    app.mock.add_line(&work, 3);

    let session = app.attach().await;
    let installed = session
        .add_breakpoint("com.example.App", BreakpointKind::Line { line: 10 }, Some("count > 3"))
        .await
        .unwrap();
    assert_eq!(installed.condition.as_deref(), Some("count > 3"));

    let deferred = session
        .add_breakpoint(
            "com.example.Later",
            BreakpointKind::Method {
                method: "work".to_string(),
            },
            Some("ready"),
        )
        .await
        .unwrap();
    assert!(deferred.pending);
    app.mock.load_class(app.main_thread, later);
    eventually("deferred breakpoint to install", || {
        !session.breakpoint(&deferred.id).unwrap().pending
    })
    .await;
    assert_eq!(
        session.breakpoint(&deferred.id).unwrap().condition.as_deref(),
        Some("ready")
    );

    let plain = session
        .add_breakpoint("com.example.App", BreakpointKind::Line { line: 12 }, Some(""))
        .await
        .unwrap();
    assert_eq!(plain.condition, None);

    let json = serde_json::to_value(session.breakpoint(&installed.id).unwrap()).unwrap();
    assert_eq!(json["condition"], "count > 3");
    let json = serde_json::to_value(&plain).unwrap();
    assert!(json.get("condition").is_none());
}
