use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::{SessionSummary, TerminalSession};

/// Longest accepted client-chosen session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Máximo número de sesiones alcanzado")]
    CapacityReached,
    #[error("Servidor cerrándose, no se admiten sesiones nuevas")]
    ShuttingDown,
    #[error("La sesión ya existe: {0}")]
    AlreadyExists(String),
    #[error("Identificador de sesión inválido: {0}")]
    InvalidId(String),
}

/// Validate a client-chosen session id: 1 to 128 characters, no control characters.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("no puede estar vacío".to_string());
    }
    if id.chars().count() > MAX_SESSION_ID_LEN {
        return Err(format!("máximo {MAX_SESSION_ID_LEN} caracteres"));
    }
    if id.chars().any(char::is_control) {
        return Err("contiene caracteres de control".to_string());
    }
    Ok(())
}

struct RegistryInner {
    sessions: HashMap<String, TerminalSession>,
    max_sessions: usize,
    /// Set by `drain`; no registrations are accepted afterwards.
    closed: bool,
}

impl RegistryInner {
    fn generate_id(&self) -> String {
        let base = format!("session_{}", chrono::Utc::now().timestamp_millis());
        if !self.sessions.contains_key(&base) {
            return base;
        }
        (1u64..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.sessions.contains_key(candidate))
            .unwrap_or(base)
    }
}

/// Process-wide table of live sessions, keyed by id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
                closed: false,
            })),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.read().max_sessions
    }

    /// True if another session could be registered right now.
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.read();
        inner.sessions.len() < inner.max_sessions
    }

    /// Build and register a session in one step.
    ///
    /// `id` of `None` assigns a fresh `session_<millis>` id. The capacity
    /// check, the duplicate check and the insert all happen under one write
    /// lock, so two concurrent callers can never both take the last slot.
    /// `make` runs under that lock and must not block.
    ///
    /// The entry removes itself once the session reaches `Closed`.
    pub fn register_with(
        &self,
        id: Option<String>,
        make: impl FnOnce(String) -> TerminalSession,
    ) -> Result<TerminalSession, RegistryError> {
        let session = {
            let mut inner = self.inner.write();

            if inner.closed {
                return Err(RegistryError::ShuttingDown);
            }
            if inner.sessions.len() >= inner.max_sessions {
                return Err(RegistryError::CapacityReached);
            }

            let id = match id {
                Some(id) => {
                    validate_session_id(&id).map_err(RegistryError::InvalidId)?;
                    if inner.sessions.contains_key(&id) {
                        return Err(RegistryError::AlreadyExists(id));
                    }
                    id
                }
                None => inner.generate_id(),
            };

            let session = make(id.clone());
            inner.sessions.insert(id, session.clone());
            session
        };

        tracing::debug!(session = %session.id(), count = self.count(), "session registered");
        self.deregister_on_close(session.clone());
        Ok(session)
    }

    fn deregister_on_close(&self, session: TerminalSession) {
        let registry = self.clone();
        tokio::spawn(async move {
            session.closed().await;
            registry.deregister_session(&session);
        });
    }

    pub fn get(&self, id: &str) -> Option<TerminalSession> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Remove the entry under `id`, whatever session it holds.
    pub fn deregister(&self, id: &str) -> Option<TerminalSession> {
        let removed = self.inner.write().sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session = %id, "session deregistered");
        }
        removed
    }

    /// Remove `session` only if it is still the one registered under its id.
    ///
    /// A later session may have reused the id after this one was removed; that
    /// entry must survive the earlier session's close.
    pub fn deregister_session(&self, session: &TerminalSession) -> bool {
        let mut inner = self.inner.write();
        let matches = inner
            .sessions
            .get(session.id())
            .is_some_and(|current| current.same_as(session));
        if matches {
            inner.sessions.remove(session.id());
            tracing::debug!(session = %session.id(), "session deregistered");
        }
        matches
    }

    pub fn count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Summaries of every registered session, sorted by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<TerminalSession> = self.inner.read().sessions.values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(TerminalSession::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Remove every session at once and close the registry, returning the
    /// sessions to the caller.
    ///
    /// Nothing can be registered between the snapshot and the clear, nor at
    /// any point after it.
    pub fn drain(&self) -> Vec<TerminalSession> {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectiveSessionConfig;
    use crate::session::SessionState;
    use std::time::Duration;

    fn make(id: String) -> TerminalSession {
        TerminalSession::with_channel(id, EffectiveSessionConfig::default()).0
    }

    #[test]
    fn session_id_validation() {
        assert!(validate_session_id("s1").is_ok());
        assert!(validate_session_id(&"a".repeat(MAX_SESSION_ID_LEN)).is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
        assert!(validate_session_id("bad\nid").is_err());
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = SessionRegistry::new(4);
        let session = registry.register_with(Some("s1".into()), make).unwrap();
        assert_eq!(session.id(), "s1");
        assert_eq!(registry.count(), 1);
        assert!(registry.get("s1").unwrap().same_as(&session));
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = SessionRegistry::new(4);
        registry.register_with(Some("s1".into()), make).unwrap();
        let err = registry.register_with(Some("s1".into()), make).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyExists("s1".into()));
        assert_eq!(err.to_string(), "La sesión ya existe: s1");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let registry = SessionRegistry::new(2);
        registry.register_with(Some("a".into()), make).unwrap();
        assert!(registry.has_capacity());
        registry.register_with(Some("b".into()), make).unwrap();
        assert!(!registry.has_capacity());

        let err = registry.register_with(Some("c".into()), make).unwrap_err();
        assert_eq!(err, RegistryError::CapacityReached);
        assert_eq!(err.to_string(), "Máximo número de sesiones alcanzado");

        registry.deregister("a");
        assert!(registry.has_capacity());
        registry.register_with(Some("c".into()), make).unwrap();
    }

    #[tokio::test]
    async fn invalid_id_is_rejected() {
        let registry = SessionRegistry::new(2);
        let err = registry.register_with(Some(String::new()), make).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidId(_)));
        assert_eq!(err.to_string(), "Identificador de sesión inválido: no puede estar vacío");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        let registry = SessionRegistry::new(8);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(registry.register_with(None, make).unwrap().id().to_string());
        }
        assert!(ids.iter().all(|id| id.starts_with("session_")));
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn closed_sessions_deregister_themselves() {
        let registry = SessionRegistry::new(2);
        let session = registry.register_with(Some("s1".into()), make).unwrap();
        session.kill();
        assert_eq!(session.state(), SessionState::Closed);

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.get("s1").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed session should leave the registry");
    }

    #[tokio::test]
    async fn stale_close_keeps_newer_entry() {
        let registry = SessionRegistry::new(2);
        let old = registry.register_with(Some("s1".into()), make).unwrap();
        registry.deregister("s1");
        let new = registry.register_with(Some("s1".into()), make).unwrap();

        assert!(!registry.deregister_session(&old));
        assert!(registry.get("s1").unwrap().same_as(&new));
        assert!(registry.deregister_session(&new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn list_and_drain() {
        let registry = SessionRegistry::new(4);
        registry.register_with(Some("b".into()), make).unwrap();
        registry.register_with(Some("a".into()), make).unwrap();

        let ids: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["a", "b"]);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drained_registry_refuses_new_sessions() {
        let registry = SessionRegistry::new(4);
        registry.register_with(Some("a".into()), make).unwrap();
        assert!(!registry.is_closed());

        registry.drain();
        assert!(registry.is_closed());
        let err = registry.register_with(Some("late".into()), make).unwrap_err();
        assert_eq!(err, RegistryError::ShuttingDown);
        assert!(registry.register_with(None, make).is_err());
        assert!(registry.is_empty());
    }
}
