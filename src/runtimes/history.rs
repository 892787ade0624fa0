//! Conversation history storage contract.
//!
//! The scheduler never looks inside a history; components receive backends
//! through `ctx.registries.histories` and drive them directly. Durable
//! storage is a host concern: the crate ships only the in-memory backend
//! used for development and tests; hosts register factories for anything
//! else.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::component::NodeError;

/// One stored turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

impl std::fmt::Debug for dyn HistoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn HistoryBackend")
    }
}

/// Pluggable conversation history storage.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Ordered history for a session, oldest first.
    async fn get_history(&self, session_id: &str) -> Result<Vec<HistoryMessage>, NodeError>;

    /// Append one message to a session.
    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), NodeError>;

    /// Replace a session's entire history.
    async fn set_history(
        &self,
        session_id: &str,
        messages: Vec<HistoryMessage>,
    ) -> Result<(), NodeError>;

    /// Drop all messages for a session.
    async fn clear_history(&self, session_id: &str) -> Result<(), NodeError>;
}

/// In-memory history with optional turn pruning.
#[derive(Default)]
pub struct InMemoryHistoryBackend {
    storage: Mutex<FxHashMap<String, Vec<HistoryMessage>>>,
    max_turns: Option<usize>,
}

impl InMemoryHistoryBackend {
    #[must_use]
    pub fn new(max_turns: Option<usize>) -> Self {
        Self {
            storage: Mutex::new(FxHashMap::default()),
            max_turns,
        }
    }

    fn prune(&self, messages: &mut Vec<HistoryMessage>) {
        if let Some(max) = self.max_turns {
            if messages.len() > max {
                messages.drain(..messages.len() - max);
            }
        }
    }
}

#[async_trait]
impl HistoryBackend for InMemoryHistoryBackend {
    async fn get_history(&self, session_id: &str) -> Result<Vec<HistoryMessage>, NodeError> {
        Ok(self
            .storage
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), NodeError> {
        let mut storage = self.storage.lock();
        let messages = storage.entry(session_id.to_string()).or_default();
        messages.push(HistoryMessage::new(role, content));
        let mut taken = std::mem::take(messages);
        self.prune(&mut taken);
        *messages = taken;
        Ok(())
    }

    async fn set_history(
        &self,
        session_id: &str,
        mut messages: Vec<HistoryMessage>,
    ) -> Result<(), NodeError> {
        self.prune(&mut messages);
        self.storage.lock().insert(session_id.to_string(), messages);
        Ok(())
    }

    async fn clear_history(&self, session_id: &str) -> Result<(), NodeError> {
        self.storage.lock().remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_get_round_trip() {
        let backend = InMemoryHistoryBackend::new(None);
        backend.append_message("s1", "user", "hi").await.unwrap();
        backend.append_message("s1", "assistant", "hello").await.unwrap();
        let history = backend.get_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], HistoryMessage::new("user", "hi"));
        assert!(backend.get_history("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_turns_prunes_oldest() {
        let backend = InMemoryHistoryBackend::new(Some(2));
        for i in 0..4 {
            backend
                .append_message("s1", "user", &format!("m{i}"))
                .await
                .unwrap();
        }
        let history = backend.get_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "m2");
        assert_eq!(history[1].content, "m3");
    }

    #[tokio::test]
    async fn clear_removes_session() {
        let backend = InMemoryHistoryBackend::new(None);
        backend.append_message("s1", "user", "hi").await.unwrap();
        backend.clear_history("s1").await.unwrap();
        assert!(backend.get_history("s1").await.unwrap().is_empty());
    }
}
