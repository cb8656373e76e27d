//! Per-client sessions and upstream credential resolution.

use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// Opaque session identifier handed to clients in `Mcp-Session-Id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream API credential. Zeroized when dropped, redacted in `Debug`.
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Build from an optional raw value, ignoring blanks.
    pub fn from_optional(value: Option<&str>) -> Option<Self> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    RequestHeader,
    SessionOverride,
    ServerDefault,
}

impl CredentialSource {
    /// Evaluation order, first present wins.
    pub const PRECEDENCE: [CredentialSource; 3] = [
        CredentialSource::RequestHeader,
        CredentialSource::SessionOverride,
        CredentialSource::ServerDefault,
    ];
}

struct Session {
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    credential_override: Option<Credential>,
}

/// Summary of a live session, without its credential.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub has_credential: bool,
}

/// Owns the session table. All access goes through one mutex, never held
/// across an await point.
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Session>>,
    server_default: Option<Credential>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(server_default: Option<Credential>, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            server_default,
            idle_timeout,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn has_server_default(&self) -> bool {
        self.server_default.is_some()
    }

    /// Allocate a fresh session with no credential.
    pub fn create_session(&self) -> SessionId {
        let now = Utc::now();
        let mut table = self.table();
        let id = loop {
            let candidate = SessionId::generate();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };
        table.insert(
            id.clone(),
            Session {
                created_at: now,
                last_used_at: now,
                credential_override: None,
            },
        );
        tracing::debug!(session_id = %id, "Session created");
        id
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.table().contains_key(session_id)
    }

    /// Store a credential override on an existing session.
    pub fn set_credential(&self, session_id: &SessionId, credential: Credential) -> GatewayResult<()> {
        let mut table = self.table();
        let session = table
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", session_id)))?;
        session.credential_override = Some(credential);
        Ok(())
    }

    /// Resolve the upstream credential for a request.
    ///
    /// The `initialize`-time `dealpath_key` is stored as the session override,
    /// so it takes part through [`CredentialSource::SessionOverride`].
    pub fn resolve_credential(
        &self,
        session_id: Option<&SessionId>,
        per_request_header: Option<&Credential>,
    ) -> GatewayResult<(Credential, CredentialSource)> {
        for source in CredentialSource::PRECEDENCE {
            let found = match source {
                CredentialSource::RequestHeader => per_request_header.cloned(),
                CredentialSource::SessionOverride => session_id.and_then(|id| {
                    self.table()
                        .get(id)
                        .and_then(|s| s.credential_override.clone())
                }),
                CredentialSource::ServerDefault => self.server_default.clone(),
            };
            if let Some(credential) = found {
                return Ok((credential, source));
            }
        }
        Err(GatewayError::CredentialMissing)
    }

    /// Mark a session as used. Unknown ids are ignored.
    pub fn touch(&self, session_id: &SessionId) {
        let now = Utc::now();
        if let Some(session) = self.table().get_mut(session_id) {
            if now > session.last_used_at {
                session.last_used_at = now;
            }
        }
    }

    /// Drop every session idle for longer than `idle_timeout`. Returns how many
    /// were removed; their credentials are zeroized as they drop.
    pub fn reap(&self, now: DateTime<Utc>, idle_timeout: Duration) -> usize {
        let expired: Vec<Session> = {
            let mut table = self.table();
            let stale: Vec<SessionId> = table
                .iter()
                .filter(|(_, s)| now - s.last_used_at > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale.iter().filter_map(|id| table.remove(id)).collect()
        };
        let removed = expired.len();
        drop(expired);
        if removed > 0 {
            tracing::info!(removed, "Reaped idle sessions");
        }
        removed
    }

    /// Reap using the configured idle timeout.
    pub fn reap_idle(&self) -> usize {
        self.reap(Utc::now(), self.idle_timeout)
    }

    /// Reap idle sessions every `interval` until the task is aborted.
    pub fn spawn_reaper(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reap_idle();
            }
        })
    }

    pub fn info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.table().get(session_id).map(|s| SessionInfo {
            id: session_id.clone(),
            created_at: s.created_at,
            last_used_at: s.last_used_at,
            has_credential: s.credential_override.is_some(),
        })
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(default: Option<&str>) -> SessionManager {
        SessionManager::new(default.map(Credential::new), Duration::minutes(30))
    }

    #[test]
    fn test_session_ids_are_unique() {
        let sessions = manager(None);
        let a = sessions.create_session();
        let b = sessions.create_session();
        assert_ne!(a, b);
        assert!(a.as_str().len() > 10);
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn test_precedence_header_over_session_over_default() {
        let sessions = manager(Some("server"));
        let id = sessions.create_session();

        let (cred, source) = sessions.resolve_credential(Some(&id), None).unwrap();
        assert_eq!(cred.expose(), "server");
        assert_eq!(source, CredentialSource::ServerDefault);

        sessions.set_credential(&id, Credential::new("session")).unwrap();
        let (cred, source) = sessions.resolve_credential(Some(&id), None).unwrap();
        assert_eq!(cred.expose(), "session");
        assert_eq!(source, CredentialSource::SessionOverride);

        let header = Credential::new("header");
        let (cred, source) = sessions.resolve_credential(Some(&id), Some(&header)).unwrap();
        assert_eq!(cred.expose(), "header");
        assert_eq!(source, CredentialSource::RequestHeader);
    }

    #[test]
    fn test_credentials_never_cross_sessions() {
        let sessions = manager(None);
        let a = sessions.create_session();
        let b = sessions.create_session();
        sessions.set_credential(&a, Credential::new("key-a")).unwrap();

        assert_eq!(sessions.resolve_credential(Some(&a), None).unwrap().0.expose(), "key-a");
        assert!(matches!(
            sessions.resolve_credential(Some(&b), None),
            Err(GatewayError::CredentialMissing)
        ));

        sessions.set_credential(&b, Credential::new("key-b")).unwrap();
        assert_eq!(sessions.resolve_credential(Some(&a), None).unwrap().0.expose(), "key-a");
        assert_eq!(sessions.resolve_credential(Some(&b), None).unwrap().0.expose(), "key-b");
    }

    #[test]
    fn test_missing_everywhere_is_credential_missing() {
        let sessions = manager(None);
        assert!(matches!(
            sessions.resolve_credential(None, None),
            Err(GatewayError::CredentialMissing)
        ));
        // Unknown session falls through to the default chain
        let ghost = SessionId::new("ghost");
        assert!(sessions.resolve_credential(Some(&ghost), None).is_err());
    }

    #[test]
    fn test_touch_unknown_is_noop_and_known_is_monotonic() {
        let sessions = manager(None);
        sessions.touch(&SessionId::new("nope"));

        let id = sessions.create_session();
        let before = sessions.info(&id).unwrap().last_used_at;
        sessions.touch(&id);
        let after = sessions.info(&id).unwrap().last_used_at;
        assert!(after >= before);
    }

    #[test]
    fn test_reap_removes_only_idle_sessions() {
        let sessions = manager(None);
        let old = sessions.create_session();
        sessions.set_credential(&old, Credential::new("old-key")).unwrap();

        let later = Utc::now() + Duration::minutes(45);
        let fresh = sessions.create_session();

        // Both were last used ~45 minutes before `later`
        assert_eq!(sessions.reap(later, Duration::hours(1)), 0);
        assert_eq!(sessions.reap(later, Duration::minutes(30)), 2);
        assert!(!sessions.contains(&old));
        assert!(!sessions.contains(&fresh));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_set_credential_on_unknown_session_fails() {
        let sessions = manager(None);
        assert!(matches!(
            sessions.set_credential(&SessionId::new("x"), Credential::new("k")),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("super-secret");
        assert!(!format!("{:?}", cred).contains("super-secret"));
        assert!(Credential::from_optional(Some("  ")).is_none());
        assert_eq!(Credential::from_optional(Some(" k ")).unwrap().expose(), "k");
    }
}
