//! Background task translating target events into [`DebugEvent`]s.
//!
//! One processor runs per connected session. It pulls event sets from the
//! connection, updates the session's breakpoint and thread bookkeeping,
//! emits normalized events and decides whether the set is resumed again.

use std::sync::Arc;
use std::time::Duration;

use jdbg_jdwp::{EventSet, Location, TargetConnection, TargetEvent, ThreadId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventPayload, ThreadLocation};
use crate::format::exception_message;
use crate::session::{DebugSession, SessionState};

/// Whether an event set should be resumed after it has been handled.
///
/// Sets carrying a breakpoint, step or exception stop the target for the
/// user; everything else (thread lifecycle, class prepare, VM start) only
/// feeds bookkeeping and lets the target continue.
pub fn should_resume(set: &EventSet) -> bool {
    !set.events.iter().any(|event| {
        matches!(
            event,
            TargetEvent::Breakpoint { .. } | TargetEvent::Step { .. } | TargetEvent::Exception { .. }
        )
    })
}

/// Describe where `thread` is, falling back to empty names when the
/// target cannot say.
pub(crate) async fn thread_location(
    conn: &dyn TargetConnection,
    thread: ThreadId,
    location: &Location,
) -> ThreadLocation {
    let info = conn.location_info(location).await.unwrap_or_default();
    ThreadLocation {
        thread_id: thread,
        thread_name: thread_name(conn, thread).await,
        class_name: info.class_name,
        method_name: info.method_name,
        line: info.line,
        source_name: info.source_name,
    }
}

async fn thread_name(conn: &dyn TargetConnection, thread: ThreadId) -> String {
    match conn.thread(thread).await {
        Ok(info) => info.name,
        Err(_) => String::new(),
    }
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct EventProcessor {
    session: Arc<DebugSession>,
    conn: Arc<dyn TargetConnection>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl EventProcessor {
    pub(crate) fn new(
        session: Arc<DebugSession>,
        conn: Arc<dyn TargetConnection>,
        shutdown: CancellationToken,
    ) -> Self {
        let poll_interval = session.settings().event_poll_interval();
        Self {
            session,
            conn,
            shutdown,
            poll_interval,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::debug!(target: "jdbg.events", session_id = %self.session.id(), "event processor started");
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.conn.next_event_set(self.poll_interval) => next,
            };

            let set = match next {
                Ok(Some(set)) => set,
                Ok(None) => continue,
                Err(err) if err.is_disconnect() => {
                    self.disconnected();
                    break;
                }
                Err(err) => {
                    tracing::warn!(target: "jdbg.events", session_id = %self.session.id(), error = %err, "failed to read event set");
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if let Flow::Stop = self.handle_set(&set).await {
                break;
            }
        }
        tracing::debug!(target: "jdbg.events", session_id = %self.session.id(), "event processor stopped");
    }

    fn disconnected(&self) {
        if self.shutdown.is_cancelled() || self.session.state().is_terminal() {
            return;
        }
        tracing::info!(target: "jdbg.events", session_id = %self.session.id(), "target VM disconnected");
        self.session.set_state(SessionState::Disconnected);
        self.session.emit(EventPayload::VmDisconnect {
            reason: "VM disconnected".to_string(),
        });
    }

    async fn handle_set(&self, set: &EventSet) -> Flow {
        for event in &set.events {
            if let Flow::Stop = self.handle_event(event).await {
                return Flow::Stop;
            }
        }

        if should_resume(set) {
            if let Err(err) = self.conn.resume_event_set(set).await {
                if err.is_disconnect() {
                    self.disconnected();
                    return Flow::Stop;
                }
                tracing::warn!(target: "jdbg.events", session_id = %self.session.id(), error = %err, "failed to resume event set");
            }
        }
        Flow::Continue
    }

    async fn handle_event(&self, event: &TargetEvent) -> Flow {
        let conn = self.conn.as_ref();
        match event {
            TargetEvent::VmStart { .. } => {}
            TargetEvent::Breakpoint {
                request,
                thread,
                location,
            } => {
                let breakpoint_id = request.and_then(|request| self.session.breakpoints.record_hit(request));
                let location = thread_location(conn, *thread, location).await;
                self.session.stopped(*thread, Some(breakpoint_id.clone()));
                self.session.emit(EventPayload::BreakpointHit {
                    breakpoint_id,
                    location,
                });
            }
            TargetEvent::Step {
                request,
                thread,
                location,
            } => {
                if let Some(request) = self.session.finish_step(*thread, *request) {
                    if let Err(err) = conn.delete_request(request).await {
                        tracing::debug!(target: "jdbg.events", request, error = %err, "failed to delete step request");
                    }
                }
                let location = thread_location(conn, *thread, location).await;
                self.session.stopped(*thread, None);
                self.session.emit(EventPayload::StepCompleted { location });
            }
            TargetEvent::Exception {
                thread,
                location,
                exception,
                catch_location,
                ..
            } => {
                let message = exception_message(conn, exception).await;
                let location = thread_location(conn, *thread, location).await;
                self.session.stopped(*thread, None);
                self.session.emit(EventPayload::ExceptionThrown {
                    exception_class: exception.runtime_type.clone(),
                    message,
                    caught: catch_location.is_some(),
                    location,
                });
            }
            TargetEvent::ThreadStart { thread } => {
                let name = thread_name(conn, *thread).await;
                self.session.emit(EventPayload::ThreadStart {
                    thread_id: *thread,
                    name,
                });
            }
            TargetEvent::ThreadDeath { thread } => {
                let name = thread_name(conn, *thread).await;
                self.session.forget_thread(*thread);
                self.session.emit(EventPayload::ThreadDeath {
                    thread_id: *thread,
                    name,
                });
            }
            TargetEvent::ClassPrepare { class, .. } => {
                self.session.materialize_pending(class).await;
            }
            TargetEvent::VmDeath => {
                tracing::info!(target: "jdbg.events", session_id = %self.session.id(), "target VM exited");
                self.session.set_state(SessionState::Terminated);
                // The exit status is not part of the VM death event.
                self.session.emit(EventPayload::VmDeath { exit_code: 0 });
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use jdbg_jdwp::{Location, SuspendPolicy};

    use super::*;

    fn location() -> Location {
        Location {
            type_tag: 1,
            class_id: 1,
            method_id: 1,
            index: 0,
        }
    }

    #[test]
    fn stopping_events_keep_the_set_suspended() {
        let lifecycle = EventSet {
            suspend_policy: SuspendPolicy::None,
            events: vec![
                TargetEvent::ThreadStart { thread: 1 },
                TargetEvent::ThreadDeath { thread: 2 },
            ],
        };
        assert!(should_resume(&lifecycle));

        let mixed = EventSet {
            suspend_policy: SuspendPolicy::All,
            events: vec![
                TargetEvent::ThreadStart { thread: 1 },
                TargetEvent::Step {
                    request: Some(3),
                    thread: 1,
                    location: location(),
                },
            ],
        };
        assert!(!should_resume(&mixed));

        let breakpoint = EventSet {
            suspend_policy: SuspendPolicy::All,
            events: vec![TargetEvent::Breakpoint {
                request: None,
                thread: 1,
                location: location(),
            }],
        };
        assert!(!should_resume(&breakpoint));
    }
}
