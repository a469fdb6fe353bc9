//! Process-wide table of debug sessions.

use std::collections::HashMap;
use std::sync::Arc;

use jdbg_config::{JdbgConfig, SessionConfig};
use jdbg_jdwp::{TargetConnector, TargetKind};
use parking_lot::RwLock;

use crate::error::{DebugError, DebugResult};
use crate::session::{describe_target, short_id, DebugSession, OriginKind, SessionInfo, SessionState};

/// What [`SessionRegistry::attach`] should connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDescriptor {
    /// Reuse (or name) a session; a fresh id is generated when `None`.
    pub session_id: Option<String>,
    /// Display name given to the session once attached.
    pub name: Option<String>,
    pub kind: TargetKind,
}

impl TargetDescriptor {
    pub fn new(kind: TargetKind) -> Self {
        Self {
            session_id: None,
            name: None,
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }
}

/// Owns every [`DebugSession`] and tracks which one is active.
///
/// Creation, attachment, activation and removal are serialized; lookups only
/// take the read side of the session map.
pub struct SessionRegistry {
    connector: Arc<dyn TargetConnector>,
    settings: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<DebugSession>>>,
    active: RwLock<Option<String>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn TargetConnector>, settings: SessionConfig) -> Self {
        Self {
            connector,
            settings,
            sessions: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(connector: Arc<dyn TargetConnector>, config: &JdbgConfig) -> Self {
        Self::new(connector, config.session.clone())
    }

    /// Register an unattached session. The first session becomes active.
    pub async fn create(&self, id: Option<&str>) -> DebugResult<Arc<DebugSession>> {
        let _guard = self.write_lock.lock().await;
        self.insert_new(id)
    }

    fn insert_new(&self, id: Option<&str>) -> DebugResult<Arc<DebugSession>> {
        let mut sessions = self.sessions.write();
        let id = match id {
            Some(id) if sessions.contains_key(id) => {
                return Err(DebugError::SessionAlreadyExists(id.to_string()))
            }
            Some(id) => id.to_string(),
            None => loop {
                let id = short_id();
                if !sessions.contains_key(&id) {
                    break id;
                }
            },
        };
        let session = DebugSession::new(id.clone(), self.settings.clone());
        sessions.insert(id.clone(), session.clone());
        drop(sessions);

        let mut active = self.active.write();
        if active.is_none() {
            *active = Some(id.clone());
        }
        tracing::debug!(target: "jdbg.registry", session_id = %id, "session created");
        Ok(session)
    }

    /// Connect a session to a target VM.
    ///
    /// A named session that exists and has never been attached is reused;
    /// any other existing session with that name is an error. On connection
    /// failure a freshly created session is removed again.
    pub async fn attach(&self, descriptor: TargetDescriptor) -> DebugResult<Arc<DebugSession>> {
        let _guard = self.write_lock.lock().await;

        let existing = descriptor
            .session_id
            .as_deref()
            .and_then(|id| self.sessions.read().get(id).cloned());
        let (session, created) = match existing {
            Some(session) if session.state() == SessionState::Created => (session, false),
            Some(session) => return Err(DebugError::SessionAlreadyExists(session.id().to_string())),
            None => (self.insert_new(descriptor.session_id.as_deref())?, true),
        };

        let description = describe_target(&descriptor.kind);
        tracing::info!(target: "jdbg.registry", session_id = %session.id(), target_vm = %description, "attaching");
        let conn = match self.connector.connect(&descriptor.kind).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(target: "jdbg.registry", session_id = %session.id(), error = %err, "attach failed");
                if created {
                    self.forget(session.id());
                }
                return Err(DebugError::ConnectionFailed(format!("{description}: {err}")));
            }
        };

        session
            .connect(conn, OriginKind::of(&descriptor.kind), description)
            .await?;
        if let Some(name) = descriptor.name.as_deref() {
            session.rename(name);
        }
        Ok(session)
    }

    /// Look up a session, or the active one when `id` is `None`.
    pub fn get(&self, id: Option<&str>) -> DebugResult<Arc<DebugSession>> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.active_id().ok_or(DebugError::NoActiveSession)?,
        };
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(DebugError::SessionNotFound(id))
    }

    /// Every session, ordered by creation time.
    pub fn list(&self) -> Vec<SessionInfo> {
        let active = self.active_id();
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .map(|session| session.info(active.as_deref() == Some(session.id())))
            .collect();
        infos.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub async fn set_active(&self, id: &str) -> DebugResult<()> {
        let _guard = self.write_lock.lock().await;
        // Same lock order as `forget`: sessions, then active.
        let sessions = self.sessions.read();
        if !sessions.contains_key(id) {
            return Err(DebugError::SessionNotFound(id.to_string()));
        }
        *self.active.write() = Some(id.to_string());
        tracing::debug!(target: "jdbg.registry", session_id = %id, "session activated");
        Ok(())
    }

    /// Give a session a new display name; an empty name clears it.
    pub fn rename(&self, id: &str, name: &str) -> DebugResult<()> {
        self.get(Some(id))?.rename(name);
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close and drop a session. If it was active, the remaining session
    /// with the lowest id becomes active.
    pub async fn remove(&self, id: &str) -> DebugResult<()> {
        let session = {
            let _guard = self.write_lock.lock().await;
            self.forget(id)
                .ok_or_else(|| DebugError::SessionNotFound(id.to_string()))?
        };
        session.close().await;
        tracing::info!(target: "jdbg.registry", session_id = %id, "session removed");
        Ok(())
    }

    fn forget(&self, id: &str) -> Option<Arc<DebugSession>> {
        let mut sessions = self.sessions.write();
        let session = sessions.remove(id)?;
        let mut active = self.active.write();
        if active.as_deref() == Some(id) {
            *active = sessions.keys().min().cloned();
        }
        Some(session)
    }

    /// Close every session and empty the registry.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<DebugSession>> = {
            let _guard = self.write_lock.lock().await;
            *self.active.write() = None;
            self.sessions.write().drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use jdbg_jdwp::{TargetConnection, TargetError};

    use super::*;

    struct Refusing;

    #[async_trait]
    impl TargetConnector for Refusing {
        async fn connect(&self, _: &TargetKind) -> jdbg_jdwp::Result<Arc<dyn TargetConnection>> {
            Err(TargetError::Timeout)
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(Refusing), SessionConfig::default())
    }

    #[tokio::test]
    async fn first_session_becomes_active_and_ids_are_unique() {
        let registry = registry();
        let first = registry.create(None).await.unwrap();
        registry.create(Some("named")).await.unwrap();

        assert_eq!(first.id().len(), 8);
        assert_eq!(registry.active_id().as_deref(), Some(first.id()));
        assert!(matches!(
            registry.create(Some("named")).await,
            Err(DebugError::SessionAlreadyExists(id)) if id == "named"
        ));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn lookups_without_an_active_session_fail() {
        let registry = registry();
        assert!(matches!(registry.get(None), Err(DebugError::NoActiveSession)));
        assert!(matches!(
            registry.get(Some("nope")),
            Err(DebugError::SessionNotFound(id)) if id == "nope"
        ));
        assert!(matches!(
            registry.set_active("nope").await,
            Err(DebugError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_attach_leaves_no_session_behind() {
        let registry = registry();
        let descriptor = TargetDescriptor::new(TargetKind::Remote {
            host: "localhost".to_string(),
            port: 5005,
        })
        .with_session_id("s1");

        let err = registry.attach(descriptor).await.unwrap_err();
        assert!(matches!(err, DebugError::ConnectionFailed(_)));
        assert!(registry.is_empty());
        assert_eq!(registry.active_id(), None);
    }

    #[tokio::test]
    async fn failed_attach_keeps_a_precreated_session() {
        let registry = registry();
        registry.create(Some("s1")).await.unwrap();
        let descriptor = TargetDescriptor::new(TargetKind::Local { pid: 7 }).with_session_id("s1");

        assert!(registry.attach(descriptor).await.is_err());
        assert_eq!(registry.get(Some("s1")).unwrap().state(), SessionState::Created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn activation_racing_removal_never_leaves_a_dangling_active_id() {
        let registry = Arc::new(registry());
        for round in 0..200 {
            let ids: Vec<String> = (0..3).map(|i| format!("r{round}-{i}")).collect();
            for id in &ids {
                registry.create(Some(id)).await.unwrap();
            }

            let activate = {
                let registry = registry.clone();
                let id = ids[0].clone();
                tokio::spawn(async move { registry.set_active(&id).await })
            };
            let remove = {
                let registry = registry.clone();
                let id = ids[0].clone();
                tokio::spawn(async move { registry.remove(&id).await })
            };
            let activated = activate.await.unwrap();
            remove.await.unwrap().unwrap();

            // Activation either ran first (and was undone by the removal) or
            // found the session already gone.
            if let Err(err) = activated {
                assert!(matches!(err, DebugError::SessionNotFound(_)));
            }
            let active = registry.active_id().expect("other sessions remain");
            assert_ne!(active, ids[0]);
            assert!(registry.get(None).is_ok(), "active id {active} must resolve");

            registry.close_all().await;
        }
    }

    #[tokio::test]
    async fn sessions_can_be_renamed() {
        let registry = registry();
        registry.create(Some("s1")).await.unwrap();
        assert_eq!(registry.list()[0].name, None);

        registry.rename("s1", "checkout service").unwrap();
        assert_eq!(registry.list()[0].name.as_deref(), Some("checkout service"));
        assert_eq!(registry.get(Some("s1")).unwrap().name().as_deref(), Some("checkout service"));

        registry.rename("s1", "").unwrap();
        assert_eq!(registry.list()[0].name, None);
        assert!(matches!(
            registry.rename("nope", "x"),
            Err(DebugError::SessionNotFound(_))
        ));
    }
}
