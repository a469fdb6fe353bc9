use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jdbg_config::SessionConfig;
use jdbg_core::{DebugEvent, DebugSession, EventKind, SessionRegistry, TargetDescriptor};
use jdbg_jdwp::{
    Location, MockFrame, MockTarget, ReferenceTypeId, TargetConnection, TargetConnector,
    TargetKind, ThreadId, Value,
};
use tokio::time::Instant;

/// Hands out the same mock VM for every target descriptor.
pub struct StaticConnector {
    target: Arc<MockTarget>,
}

impl StaticConnector {
    pub fn new(target: Arc<MockTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl TargetConnector for StaticConnector {
    async fn connect(&self, _: &TargetKind) -> jdbg_jdwp::Result<Arc<dyn TargetConnection>> {
        Ok(self.target.clone())
    }
}

/// Session settings with a short poll interval so tests react quickly.
pub fn settings() -> SessionConfig {
    SessionConfig {
        event_poll_interval_ms: 10,
        default_wait_timeout_ms: 5_000,
        ..SessionConfig::default()
    }
}

pub fn remote_target() -> TargetKind {
    TargetKind::Remote {
        host: "localhost".to_string(),
        port: 5005,
    }
}

/// A mock VM running `com.example.App`.
///
/// `App.run(int factor)` has lines 10, 11 and 12; `App.compute()` starts at
/// line 20 and line 21 appears twice in its line table. The `main` thread
/// sits in `run` at line 11 above `App.main` at line 5.
pub struct App {
    pub mock: Arc<MockTarget>,
    pub registry: SessionRegistry,
    pub class: ReferenceTypeId,
    pub main_thread: ThreadId,
    pub line_10: Location,
    pub line_11: Location,
    pub line_12: Location,
    pub line_20: Location,
}

pub fn app() -> App {
    let mock = Arc::new(MockTarget::new());
    let object = mock.class_id("java.lang.Object").expect("builtin Object");
    let class = mock.define_class("com.example.App", Some(object));
    mock.add_field(class, "name", "Ljava/lang/String;", false);

    let run = mock.add_method(class, "run", "(I)V", false, None);
    let line_10 = mock.add_line(&run, 10);
    let line_11 = mock.add_line(&run, 11);
    let line_12 = mock.add_line(&run, 12);

    let compute = mock.add_method(class, "compute", "()I", false, None);
    let line_20 = mock.add_line(&compute, 20);
    mock.add_line(&compute, 21);
    mock.add_line(&compute, 21);

    let main = mock.add_method(class, "main", "([Ljava/lang/String;)V", true, None);
    let line_5 = mock.add_line(&main, 5);

    let this = mock.new_object(class);
    let name = mock.new_string("demo");
    mock.set_field_value(&this, "name", Value::Object(name));
    let label = mock.new_string("ready");
    let args = mock.new_array("java.lang.String", Vec::new());

    let main_thread = mock.add_thread("main");
    mock.add_frame(
        main_thread,
        MockFrame::new(line_11)
            .with_this(this.clone())
            .with_argument("factor", "I", Value::Int(3))
            .with_local("count", "I", Value::Int(5))
            .with_local("total", "J", Value::Long(100))
            .with_local("label", "Ljava/lang/String;", Value::Object(label)),
    );
    mock.add_frame(
        main_thread,
        MockFrame::new(line_5)
            .with_argument("args", "[Ljava/lang/String;", Value::Object(args))
            .with_local("app", "Lcom/example/App;", Value::Object(this)),
    );

    let registry = SessionRegistry::new(Arc::new(StaticConnector::new(mock.clone())), settings());
    App {
        mock,
        registry,
        class,
        main_thread,
        line_10,
        line_11,
        line_12,
        line_20,
    }
}

impl App {
    pub async fn attach(&self) -> Arc<DebugSession> {
        self.registry
            .attach(TargetDescriptor::new(remote_target()))
            .await
            .expect("attach to mock VM")
    }

    /// Attach and stop `main` at a breakpoint on line 11.
    pub async fn stopped_at_line_11(&self) -> Arc<DebugSession> {
        let session = self.attach().await;
        session
            .add_line_breakpoint("com.example.App", 11)
            .await
            .expect("install breakpoint");
        assert!(self.mock.hit_breakpoint(self.main_thread, self.line_11));
        next_event(&session, EventKind::BreakpointHit).await;
        session
    }
}

pub async fn next_event(session: &DebugSession, kind: EventKind) -> DebugEvent {
    session
        .wait_for_event(5_000, &[kind])
        .await
        .unwrap_or_else(|| panic!("timed out waiting for {kind}"))
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
