//! Session storage: the persistent container of one conversation.
//!
//! A [`Session`] holds the append-only event log and an opaque key-value
//! state map for one user-agent conversation. All mutation goes through a
//! [`SessionService`], which serializes operations per session: appends and
//! state deltas are atomic, and observers of one session see a total order
//! of events.
//!
//! [`InMemorySessionService`] is the reference implementation. External
//! stores plug in behind the same trait.

use crate::error::{Error, Result};
use crate::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The persistent record of one user-agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier, unique within (app_name, user_id).
    pub id: String,

    /// Application the session belongs to.
    pub app_name: String,

    /// Owning user.
    pub user_id: String,

    /// Append-only event log. Append order is the authoritative
    /// conversation order.
    pub events: Vec<Event>,

    /// Opaque key-value state. Values must be JSON-representable.
    pub state: HashMap<String, Value>,

    /// Last time an event or state delta was applied.
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    /// Creates an empty session.
    pub fn new(
        id: impl Into<String>,
        app_name: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            app_name: app_name.into(),
            user_id: user_id.into(),
            events: Vec::new(),
            state: HashMap::new(),
            last_update_time: Utc::now(),
        }
    }

    /// Reads a state value.
    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }
}

/// Storage interface for sessions.
///
/// All operations are atomic per session. `append_event` also applies the
/// event's `state_delta` in the same critical section, so an event and its
/// state change are never observed separately.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a session. When `session_id` is `None` a fresh id is
    /// generated. Creating an id that already exists is an error.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<String>,
    ) -> Result<Session>;

    /// Returns a snapshot of a session.
    async fn get_session(&self, app_name: &str, user_id: &str, session_id: &str)
    -> Result<Session>;

    /// Appends an event to the session log and applies its state delta.
    async fn append_event(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        event: Event,
    ) -> Result<()>;

    /// Applies a bare state delta without appending an event.
    async fn apply_state_delta(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        delta: HashMap<String, Value>,
    ) -> Result<()>;

    /// Deletes a session. Deleting a missing session is an error.
    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()>;

    /// Lists session ids for a user.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<String>>;
}

type SessionKey = (String, String, String);

/// In-memory [`SessionService`] backed by a single map behind an async
/// RwLock. Write operations take the write lock, which serializes appends
/// per process; reads return cloned snapshots.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning the service behind an `Arc`.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn key(app_name: &str, user_id: &str, session_id: &str) -> SessionKey {
        (
            app_name.to_string(),
            user_id.to_string(),
            session_id.to_string(),
        )
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<String>,
    ) -> Result<Session> {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut sessions = self.sessions.write().await;
        let key = Self::key(app_name, user_id, &id);
        if sessions.contains_key(&key) {
            return Err(Error::session(format!("session '{id}' already exists")));
        }
        let session = Session::new(id, app_name, user_id);
        sessions.insert(key, session.clone());
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&Self::key(app_name, user_id, session_id))
            .cloned()
            .ok_or_else(|| Error::session(format!("session '{session_id}' not found")))
    }

    async fn append_event(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        event: Event,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&Self::key(app_name, user_id, session_id))
            .ok_or_else(|| Error::session(format!("session '{session_id}' not found")))?;
        for (key, value) in &event.actions.state_delta {
            session.state.insert(key.clone(), value.clone());
        }
        session.events.push(event);
        session.last_update_time = Utc::now();
        Ok(())
    }

    async fn apply_state_delta(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        delta: HashMap<String, Value>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&Self::key(app_name, user_id, session_id))
            .ok_or_else(|| Error::session(format!("session '{session_id}' not found")))?;
        session.state.extend(delta);
        session.last_update_time = Utc::now();
        Ok(())
    }

    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(&Self::key(app_name, user_id, session_id))
            .map(|_| ())
            .ok_or_else(|| Error::session(format!("session '{session_id}' not found")))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<String>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .keys()
            .filter(|(app, user, _)| app == app_name && user == user_id)
            .map(|(_, _, id)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventActions, EventKind};
    use serde_json::json;

    fn event_with_delta(key: &str, value: Value) -> Event {
        Event::new("inv", "agent", "agent", EventKind::ModelResponse).with_actions(EventActions {
            state_delta: HashMap::from([(key.to_string(), value)]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let service = InMemorySessionService::new();
        let session = service
            .create_session("app", "u1", Some("s1".to_string()))
            .await
            .unwrap();
        assert_eq!(session.id, "s1");

        let fetched = service.get_session("app", "u1", "s1").await.unwrap();
        assert_eq!(fetched.id, "s1");
        assert!(fetched.events.is_empty());
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let service = InMemorySessionService::new();
        let session = service.create_session("app", "u1", None).await.unwrap();
        assert!(!session.id.is_empty());
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let service = InMemorySessionService::new();
        service
            .create_session("app", "u1", Some("s1".to_string()))
            .await
            .unwrap();
        let result = service
            .create_session("app", "u1", Some("s1".to_string()))
            .await;
        assert!(matches!(result, Err(Error::Session(_))));
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_applies_delta() {
        let service = InMemorySessionService::new();
        service
            .create_session("app", "u1", Some("s1".to_string()))
            .await
            .unwrap();

        service
            .append_event("app", "u1", "s1", event_with_delta("count", json!(1)))
            .await
            .unwrap();
        service
            .append_event("app", "u1", "s1", event_with_delta("count", json!(2)))
            .await
            .unwrap();

        let session = service.get_session("app", "u1", "s1").await.unwrap();
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.state["count"], json!(2));
        assert!(session.events[0].timestamp <= session.events[1].timestamp);
    }

    #[tokio::test]
    async fn test_append_to_missing_session() {
        let service = InMemorySessionService::new();
        let event = Event::new("inv", "agent", "agent", EventKind::AgentStart);
        let result = service.append_event("app", "u1", "nope", event).await;
        assert!(matches!(result, Err(Error::Session(_))));
    }

    #[tokio::test]
    async fn test_apply_state_delta() {
        let service = InMemorySessionService::new();
        service
            .create_session("app", "u1", Some("s1".to_string()))
            .await
            .unwrap();
        service
            .apply_state_delta(
                "app",
                "u1",
                "s1",
                HashMap::from([("user_name".to_string(), json!("Ada"))]),
            )
            .await
            .unwrap();
        let session = service.get_session("app", "u1", "s1").await.unwrap();
        assert_eq!(session.state["user_name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let service = InMemorySessionService::new();
        service
            .create_session("app", "u1", Some("s1".to_string()))
            .await
            .unwrap();
        service.delete_session("app", "u1", "s1").await.unwrap();
        assert!(service.get_session("app", "u1", "s1").await.is_err());
        assert!(service.delete_session("app", "u1", "s1").await.is_err());
    }

    #[tokio::test]
    async fn test_list_sessions_scoped_to_user() {
        let service = InMemorySessionService::new();
        service
            .create_session("app", "u1", Some("a".to_string()))
            .await
            .unwrap();
        service
            .create_session("app", "u1", Some("b".to_string()))
            .await
            .unwrap();
        service
            .create_session("app", "u2", Some("c".to_string()))
            .await
            .unwrap();

        let mut ids = service.list_sessions("app", "u1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_serialize() {
        let service = Arc::new(InMemorySessionService::new());
        service
            .create_session("app", "u1", Some("s1".to_string()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service
                    .append_event("app", "u1", "s1", event_with_delta("last", json!(i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let session = service.get_session("app", "u1", "s1").await.unwrap();
        assert_eq!(session.events.len(), 16);
    }
}
