//! Breakpoint bookkeeping shared between API calls and the event processor.
//!
//! The tables only track ids. Talking to the target (creating, toggling and
//! deleting requests) is the caller's job; every operation here is a short,
//! synchronous critical section.

use std::collections::HashMap;

use jdbg_jdwp::RequestId;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakpointKind {
    Line { line: u32 },
    Method { method: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakpointSpec {
    pub id: String,
    pub class_name: String,
    #[serde(flatten)]
    pub kind: BreakpointKind,
    /// Recorded with the breakpoint and reported back; hits are not filtered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub enabled: bool,
    pub hit_count: u64,
    pub created_at_ms: u64,
    /// Number of concrete locations with an installed request.
    pub resolved_locations: usize,
    /// No loaded class matched yet; installation waits for the class to load.
    pub pending: bool,
}

impl BreakpointSpec {
    pub fn location_string(&self) -> String {
        match &self.kind {
            BreakpointKind::Line { line } => format!("{}:{line}", self.class_name),
            BreakpointKind::Method { method } => format!("{}.{method}", self.class_name),
        }
    }
}

struct Entry {
    spec: BreakpointSpec,
    requests: Vec<RequestId>,
    order: u64,
}

struct PendingClass {
    watch: RequestId,
    specs: Vec<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    pending: HashMap<String, PendingClass>,
    by_request: HashMap<RequestId, String>,
    next_order: u64,
}

impl Inner {
    fn insert(&mut self, spec: BreakpointSpec, requests: Vec<RequestId>) {
        for request in &requests {
            self.by_request.insert(*request, spec.id.clone());
        }
        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            spec.id.clone(),
            Entry {
                spec,
                requests,
                order,
            },
        );
    }
}

/// What removing a breakpoint left behind on the target.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Removed {
    pub requests: Vec<RequestId>,
    /// Class-prepare watch that no other pending spec needs any more.
    pub watch: Option<RequestId>,
}

/// Line and method breakpoints of one session.
#[derive(Default)]
pub struct BreakpointTable {
    inner: Mutex<Inner>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn insert_installed(&self, mut spec: BreakpointSpec, requests: Vec<RequestId>) {
        spec.pending = false;
        spec.resolved_locations = requests.len();
        self.inner.lock().insert(spec, requests);
    }

    pub fn insert_pending(&self, mut spec: BreakpointSpec, watch: RequestId) {
        spec.pending = true;
        spec.resolved_locations = 0;
        let mut inner = self.inner.lock();
        inner
            .pending
            .entry(spec.class_name.clone())
            .or_insert_with(|| PendingClass {
                watch,
                specs: Vec::new(),
            })
            .specs
            .push(spec.id.clone());
        inner.insert(spec, Vec::new());
    }

    /// The class-prepare watch already registered for `class_name`, if any.
    pub fn pending_watch(&self, class_name: &str) -> Option<RequestId> {
        self.inner.lock().pending.get(class_name).map(|p| p.watch)
    }

    /// Detach every pending spec waiting on `class_name`.
    ///
    /// Returns the watch to delete and the specs to install. A second call
    /// for the same class returns `None`, so each spec materializes once.
    pub fn take_pending(&self, class_name: &str) -> Option<(RequestId, Vec<BreakpointSpec>)> {
        let mut inner = self.inner.lock();
        let pending = inner.pending.remove(class_name)?;
        let specs = pending
            .specs
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| e.spec.clone()))
            .collect();
        Some((pending.watch, specs))
    }

    /// Attach freshly installed requests to a spec taken with
    /// [`BreakpointTable::take_pending`].
    ///
    /// Returns the spec's enabled flag, or `None` if it was removed in the
    /// meantime (the caller then owns the orphaned requests).
    pub fn materialize(&self, id: &str, requests: &[RequestId]) -> Option<bool> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let entry = inner.entries.get_mut(id)?;
        entry.requests.extend_from_slice(requests);
        entry.spec.pending = false;
        entry.spec.resolved_locations = entry.requests.len();
        for request in requests {
            inner.by_request.insert(*request, id.to_string());
        }
        Some(entry.spec.enabled)
    }

    /// Count a hit for the spec owning `request`, returning its id.
    pub fn record_hit(&self, request: RequestId) -> Option<String> {
        let mut inner = self.inner.lock();
        let id = inner.by_request.get(&request)?.clone();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.spec.hit_count += 1;
        }
        Some(id)
    }

    /// Store the flag and return the requests to toggle on the target.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Option<Vec<RequestId>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        entry.spec.enabled = enabled;
        Some(entry.requests.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Removed> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(id)?;
        for request in &entry.requests {
            inner.by_request.remove(request);
        }
        let mut removed = Removed {
            requests: entry.requests,
            watch: None,
        };
        let class_name = entry.spec.class_name;
        if let Some(pending) = inner.pending.get_mut(&class_name) {
            pending.specs.retain(|spec| spec != id);
            if pending.specs.is_empty() {
                removed.watch = inner.pending.remove(&class_name).map(|p| p.watch);
            }
        }
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<BreakpointSpec> {
        self.inner.lock().entries.get(id).map(|e| e.spec.clone())
    }

    /// All specs in creation order.
    pub fn list(&self) -> Vec<BreakpointSpec> {
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.order);
        entries.into_iter().map(|e| e.spec.clone()).collect()
    }

    /// Forget every spec, returning every request and class-prepare watch
    /// to delete on the target.
    pub fn clear(&self) -> Vec<RequestId> {
        let mut inner = self.inner.lock();
        let mut requests: Vec<RequestId> = inner
            .entries
            .drain()
            .flat_map(|(_, e)| e.requests)
            .collect();
        requests.extend(inner.pending.drain().map(|(_, p)| p.watch));
        inner.by_request.clear();
        requests
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExceptionBreakpointSpec {
    pub id: String,
    /// Fully qualified exception class, or `"*"` for any throwable.
    pub class_name: String,
    pub caught: bool,
    pub uncaught: bool,
    pub enabled: bool,
    pub created_at_ms: u64,
}

struct ExceptionEntry {
    spec: ExceptionBreakpointSpec,
    request: RequestId,
    order: u64,
}

#[derive(Default)]
struct ExceptionInner {
    entries: HashMap<String, ExceptionEntry>,
    next_order: u64,
}

#[derive(Default)]
pub struct ExceptionBreakpointTable {
    inner: Mutex<ExceptionInner>,
}

impl ExceptionBreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn insert(&self, spec: ExceptionBreakpointSpec, request: RequestId) {
        let mut inner = self.inner.lock();
        let order = inner.next_order;
        inner.next_order += 1;
        inner.entries.insert(
            spec.id.clone(),
            ExceptionEntry {
                spec,
                request,
                order,
            },
        );
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Option<RequestId> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        entry.spec.enabled = enabled;
        Some(entry.request)
    }

    pub fn remove(&self, id: &str) -> Option<RequestId> {
        self.inner.lock().entries.remove(id).map(|e| e.request)
    }

    pub fn list(&self) -> Vec<ExceptionBreakpointSpec> {
        let inner = self.inner.lock();
        let mut entries: Vec<&ExceptionEntry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.order);
        entries.into_iter().map(|e| e.spec.clone()).collect()
    }

    pub fn clear(&self) -> Vec<RequestId> {
        self.inner
            .lock()
            .entries
            .drain()
            .map(|(_, e)| e.request)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, class_name: &str, line: u32) -> BreakpointSpec {
        BreakpointSpec {
            id: id.to_string(),
            class_name: class_name.to_string(),
            kind: BreakpointKind::Line { line },
            condition: None,
            enabled: true,
            hit_count: 0,
            created_at_ms: 0,
            resolved_locations: 0,
            pending: false,
        }
    }

    #[test]
    fn pending_specs_materialize_once() {
        let table = BreakpointTable::new();
        table.insert_pending(spec("a", "com.example.Main", 10), 7);
        table.insert_pending(spec("b", "com.example.Main", 12), 7);
        assert_eq!(table.pending_watch("com.example.Main"), Some(7));

        let (watch, specs) = table.take_pending("com.example.Main").unwrap();
        assert_eq!(watch, 7);
        assert_eq!(specs.len(), 2);
        assert!(table.take_pending("com.example.Main").is_none());

        assert_eq!(table.materialize("a", &[100, 101]), Some(true));
        let a = table.get("a").unwrap();
        assert!(!a.pending);
        assert_eq!(a.resolved_locations, 2);
        assert_eq!(table.record_hit(101).as_deref(), Some("a"));
        assert_eq!(table.get("a").unwrap().hit_count, 1);
    }

    #[test]
    fn disabling_a_pending_spec_sticks_until_materialized() {
        let table = BreakpointTable::new();
        table.insert_pending(spec("a", "Foo", 3), 1);
        assert_eq!(table.set_enabled("a", false), Some(Vec::new()));
        table.take_pending("Foo");
        assert_eq!(table.materialize("a", &[5]), Some(false));
    }

    #[test]
    fn removing_last_pending_spec_releases_the_watch() {
        let table = BreakpointTable::new();
        table.insert_pending(spec("a", "Foo", 3), 1);
        table.insert_pending(spec("b", "Foo", 4), 1);

        assert_eq!(table.remove("a").unwrap().watch, None);
        let removed = table.remove("b").unwrap();
        assert_eq!(removed.watch, Some(1));
        assert!(table.pending_watch("Foo").is_none());
        assert!(table.remove("b").is_none());
    }

    #[test]
    fn removed_spec_does_not_materialize() {
        let table = BreakpointTable::new();
        table.insert_pending(spec("a", "Foo", 3), 1);
        table.insert_pending(spec("b", "Foo", 4), 1);
        let (_, specs) = table.take_pending("Foo").unwrap();
        assert_eq!(specs.len(), 2);
        table.remove("a");
        assert_eq!(table.materialize("a", &[9]), None);
        assert_eq!(table.record_hit(9), None);
    }

    #[test]
    fn list_keeps_creation_order() {
        let table = BreakpointTable::new();
        for (i, id) in ["z", "m", "a"].into_iter().enumerate() {
            table.insert_installed(spec(id, "Foo", i as u32), vec![i as RequestId]);
        }
        let ids: Vec<String> = table.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["z", "m", "a"]);

        let mut cleared = table.clear();
        cleared.sort_unstable();
        assert_eq!(cleared, vec![0, 1, 2]);
        assert!(table.list().is_empty());
    }
}
