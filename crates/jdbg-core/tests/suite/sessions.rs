use jdbg_core::{DebugError, EventKind, OriginKind, SessionState, TargetDescriptor};
use jdbg_jdwp::{MockRequestKind, TargetKind};

use crate::harness::{app, next_event, remote_target};

#[tokio::test]
async fn attach_connects_and_activates_the_session() {
    let app = app();
    let session = app.attach().await;

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(app.registry.active_id().as_deref(), Some(session.id()));

    let infos = app.registry.list();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].active);
    assert_eq!(infos[0].origin, Some(OriginKind::AttachedRemote));
    assert_eq!(infos[0].target.as_deref(), Some("localhost:5005"));

    let kinds: Vec<MockRequestKind> = app.mock.requests().into_iter().map(|r| r.kind).collect();
    assert!(kinds.contains(&MockRequestKind::ThreadStart));
    assert!(kinds.contains(&MockRequestKind::ThreadDeath));
}

#[tokio::test]
async fn attach_reuses_a_precreated_session_once() {
    let app = app();
    let created = app.registry.create(Some("dbg")).await.unwrap();
    assert_eq!(created.state(), SessionState::Created);

    let descriptor = TargetDescriptor::new(TargetKind::Local { pid: 4242 }).with_session_id("dbg");
    let attached = app.registry.attach(descriptor.clone()).await.unwrap();
    assert_eq!(attached.id(), "dbg");
    assert_eq!(attached.info(true).origin, Some(OriginKind::AttachedLocal));
    assert_eq!(app.registry.len(), 1);

    assert!(matches!(
        app.registry.attach(descriptor).await,
        Err(DebugError::SessionAlreadyExists(id)) if id == "dbg"
    ));
}

#[tokio::test]
async fn removing_the_active_session_promotes_the_lowest_remaining_id() {
    let app = app();
    for id in ["b", "c", "a"] {
        app.registry.create(Some(id)).await.unwrap();
    }
    assert_eq!(app.registry.active_id().as_deref(), Some("b"));

    app.registry.remove("b").await.unwrap();
    assert_eq!(app.registry.active_id().as_deref(), Some("a"));

    app.registry.set_active("c").await.unwrap();
    app.registry.remove("a").await.unwrap();
    assert_eq!(app.registry.active_id().as_deref(), Some("c"));

    app.registry.remove("c").await.unwrap();
    assert_eq!(app.registry.active_id(), None);
    assert!(matches!(app.registry.get(None), Err(DebugError::NoActiveSession)));
    assert!(matches!(
        app.registry.remove("c").await,
        Err(DebugError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn removing_a_session_detaches_from_the_target() {
    let app = app();
    let session = app.attach().await;
    let id = session.id().to_string();

    app.registry.remove(&id).await.unwrap();
    assert!(app.mock.is_disposed());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.threads().await, Err(DebugError::VmDisconnected)));
}

#[tokio::test]
async fn close_all_empties_the_registry() {
    let app = app();
    app.attach().await;
    app.registry.create(None).await.unwrap();

    app.registry.close_all().await;
    assert!(app.registry.is_empty());
    assert_eq!(app.registry.active_id(), None);
}

#[tokio::test]
async fn unattached_sessions_reject_target_operations() {
    let app = app();
    let session = app.registry.create(None).await.unwrap();
    assert!(matches!(session.resume().await, Err(DebugError::ConnectionFailed(_))));
    assert!(matches!(
        session.add_line_breakpoint("com.example.App", 10).await,
        Err(DebugError::ConnectionFailed(_))
    ));
}

#[tokio::test]
async fn vm_death_terminates_the_session() {
    let app = app();
    let session = app.attach().await;

    app.mock.vm_death();
    let event = next_event(&session, EventKind::VmDeath).await;
    assert_eq!(event.session_id, session.id());
    assert_eq!(session.state(), SessionState::Terminated);

    assert!(matches!(session.threads().await, Err(DebugError::VmDisconnected)));

    // Closing afterwards keeps the final state.
    session.close().await;
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn threads_and_frames_follow_the_selection() {
    let app = app();
    let session = app.stopped_at_line_11().await;

    let threads = session.threads().await.unwrap();
    let main = threads.iter().find(|t| t.id == app.main_thread).unwrap();
    assert_eq!(main.name, "main");
    assert!(main.suspended);
    assert!(main.at_breakpoint);

    assert!(matches!(
        session.select_thread(9_999).await,
        Err(DebugError::ThreadNotFound(9_999))
    ));
    session.select_thread(app.main_thread).await.unwrap();
    assert_eq!(session.selected_thread(), Some(app.main_thread));

    let page = session.frames(None, 0, 0).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.frames[0].method_name, "run");
    assert_eq!(page.frames[0].line, Some(11));
    assert_eq!(page.frames[0].source_name.as_deref(), Some("App.java"));
    assert_eq!(page.frames[1].method_name, "main");

    let tail = session.frames(None, 1, 5).await.unwrap();
    assert_eq!(tail.frames.len(), 1);
    assert_eq!(tail.frames[0].index, 1);

    session.select_frame(1).await.unwrap();
    assert_eq!(session.selected_frame(), 1);
    assert!(matches!(
        session.select_frame(2).await,
        Err(DebugError::InvalidFrameIndex { index: 2, count: 2 })
    ));
}

#[tokio::test]
async fn status_reports_suspended_threads() {
    let app = app();
    let session = app.stopped_at_line_11().await;
    let breakpoint_id = session.list_breakpoints()[0].id.clone();

    let status = session.status().await.unwrap();
    assert_eq!(status.state, SessionState::Suspended);
    assert_eq!(status.thread_count, 1);
    let main = &status.suspended_threads[0];
    assert!(main.at_breakpoint);
    assert_eq!(main.breakpoint_id.as_deref(), Some(breakpoint_id.as_str()));
    let location = main.location.as_ref().unwrap();
    assert_eq!(location.class_name, "com.example.App");
    assert_eq!(location.line, Some(11));

    session.resume().await.unwrap();
    let status = session.status().await.unwrap();
    assert_eq!(status.state, SessionState::Running);
    assert!(status.suspended_threads.is_empty());
}

#[tokio::test]
async fn suspend_and_resume_individual_threads() {
    let app = app();
    let session = app.attach().await;

    session.suspend().await.unwrap();
    assert_eq!(session.state(), SessionState::Suspended);
    assert!(app.mock.is_suspended(app.main_thread));

    session.resume_thread(app.main_thread).await.unwrap();
    assert!(!app.mock.is_suspended(app.main_thread));
    session.suspend_thread(app.main_thread).await.unwrap();
    assert!(app.mock.is_suspended(app.main_thread));

    assert!(matches!(
        session.suspend_thread(31_337).await,
        Err(DebugError::ThreadNotFound(31_337))
    ));
}

#[tokio::test]
async fn a_second_attach_keeps_the_active_session() {
    let app = app();
    app.attach().await;
    let descriptor = TargetDescriptor::new(remote_target()).with_session_id("other");
    let other = app.registry.attach(descriptor).await.unwrap();
    assert_eq!(app.registry.len(), 2);
    assert_ne!(app.registry.active_id().as_deref(), Some(other.id()));
}

#[tokio::test]
async fn attach_applies_the_requested_name() {
    let app = app();
    let session = app
        .registry
        .attach(TargetDescriptor::new(remote_target()).with_name("orders"))
        .await
        .unwrap();
    assert_eq!(session.name().as_deref(), Some("orders"));
    assert_eq!(app.registry.list()[0].name.as_deref(), Some("orders"));

    app.registry.rename(session.id(), "billing").unwrap();
    assert_eq!(session.info(true).name.as_deref(), Some("billing"));
}
