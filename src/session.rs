// ABOUTME: Connection registry mapping live WebSocket connections to conversations
// ABOUTME: Supports multi-tab fan-out with optional sender exclusion
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Session Registry
//!
//! Each WebSocket connection registers here with its session id and the
//! conversation it is currently viewing. Several connections may share one
//! session id (multiple tabs) and several sessions may watch one
//! conversation. Broadcasts serialize the event once and fan it out to
//! every matching connection, optionally excluding the originator.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::AppResult;

/// Live state for one WebSocket connection
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client-chosen session identifier, shared across tabs
    pub session_id: String,
    /// Authenticated user, if any
    pub user_id: Option<Uuid>,
    /// Conversation this connection is currently viewing
    pub conversation_id: Option<Uuid>,
    /// Outbound channel feeding the socket writer task
    pub sender: UnboundedSender<String>,
}

/// Registry of live connections keyed by connection id
#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<Uuid, ConnectionMeta>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its id
    pub fn register(&self, meta: ConnectionMeta) -> Uuid {
        let connection_id = Uuid::new_v4();
        debug!(
            %connection_id,
            session_id = %meta.session_id,
            "connection registered"
        );
        self.connections.insert(connection_id, meta);
        connection_id
    }

    pub fn unregister(&self, connection_id: Uuid) {
        if self.connections.remove(&connection_id).is_some() {
            debug!(%connection_id, "connection unregistered");
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Retag a connection to a different conversation (or none)
    pub fn set_conversation(&self, connection_id: Uuid, conversation_id: Option<Uuid>) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.conversation_id = conversation_id;
        }
    }

    /// Tag every untagged connection of `session_id` with `conversation_id`
    ///
    /// Tabs of a session that have not chosen a conversation follow the
    /// session's binding when a turn or switch establishes one; tabs
    /// already viewing a conversation keep their tag.
    pub fn adopt_session_connections(&self, session_id: &str, conversation_id: Uuid) {
        for mut entry in self.connections.iter_mut() {
            if entry.session_id == session_id && entry.conversation_id.is_none() {
                entry.conversation_id = Some(conversation_id);
            }
        }
    }

    #[must_use]
    pub fn conversation_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connections
            .get(&connection_id)
            .and_then(|entry| entry.conversation_id)
    }

    #[must_use]
    pub fn session_of(&self, connection_id: Uuid) -> Option<String> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.session_id.clone())
    }

    /// Send an event to a single connection
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be encoded. A
    /// closed socket is logged and ignored; the reader side tears the
    /// connection down.
    pub fn send_to<T: Serialize>(&self, connection_id: Uuid, event: &T) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        if let Some(entry) = self.connections.get(&connection_id) {
            if entry.sender.send(payload).is_err() {
                warn!(%connection_id, "send to closed connection dropped");
            }
        }
        Ok(())
    }

    /// Send an event to every connection viewing `conversation_id`
    ///
    /// The event is serialized once. `exclude` skips the originating
    /// connection so it does not receive an echo of its own action.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be encoded.
    pub fn broadcast_to_conversation<T: Serialize>(
        &self,
        conversation_id: Uuid,
        event: &T,
        exclude: Option<Uuid>,
    ) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        for entry in &self.connections {
            if entry.value().conversation_id != Some(conversation_id) {
                continue;
            }
            if exclude == Some(*entry.key()) {
                continue;
            }
            if entry.value().sender.send(payload.clone()).is_err() {
                warn!(
                    connection_id = %entry.key(),
                    %conversation_id,
                    "broadcast to closed connection dropped"
                );
            }
        }
        Ok(())
    }

    /// Connection ids currently viewing a conversation
    #[must_use]
    pub fn connections_for_conversation(&self, conversation_id: Uuid) -> Vec<Uuid> {
        self.connections
            .iter()
            .filter(|entry| entry.value().conversation_id == Some(conversation_id))
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use tokio::sync::mpsc;

    #[derive(Serialize)]
    struct Ping {
        n: u32,
    }

    fn connect(registry: &SessionRegistry, session: &str, conversation: Option<Uuid>) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(ConnectionMeta {
            session_id: session.to_owned(),
            user_id: None,
            conversation_id: conversation,
            sender: tx,
        });
        (id, rx)
    }

    #[test]
    fn broadcast_excludes_originator() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::new_v4();
        let (origin, mut origin_rx) = connect(&registry, "tab-a", Some(conversation));
        let (_other, mut other_rx) = connect(&registry, "tab-b", Some(conversation));

        registry
            .broadcast_to_conversation(conversation, &Ping { n: 1 }, Some(origin))
            .unwrap();

        assert!(origin_rx.try_recv().is_err());
        assert_eq!(other_rx.try_recv().unwrap(), r#"{"n":1}"#);
    }

    #[test]
    fn broadcast_skips_other_conversations() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::new_v4();
        let (_a, mut a_rx) = connect(&registry, "tab-a", Some(conversation));
        let (_b, mut b_rx) = connect(&registry, "tab-b", Some(Uuid::new_v4()));
        let (_c, mut c_rx) = connect(&registry, "tab-c", None);

        registry
            .broadcast_to_conversation(conversation, &Ping { n: 7 }, None)
            .unwrap();

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn retag_moves_connection_between_conversations() {
        let registry = SessionRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let (id, mut rx) = connect(&registry, "tab", Some(first));

        registry.set_conversation(id, Some(second));
        assert_eq!(registry.conversation_of(id), Some(second));

        registry
            .broadcast_to_conversation(first, &Ping { n: 1 }, None)
            .unwrap();
        assert!(rx.try_recv().is_err());

        registry
            .broadcast_to_conversation(second, &Ping { n: 2 }, None)
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn untagged_tabs_adopt_the_session_binding() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::new_v4();
        let elsewhere = Uuid::new_v4();
        let (untagged, _rx_a) = connect(&registry, "sess", None);
        let (tagged, _rx_b) = connect(&registry, "sess", Some(elsewhere));
        let (other, _rx_c) = connect(&registry, "other", None);

        registry.adopt_session_connections("sess", conversation);

        assert_eq!(registry.conversation_of(untagged), Some(conversation));
        assert_eq!(registry.conversation_of(tagged), Some(elsewhere));
        assert_eq!(registry.conversation_of(other), None);
    }

    #[test]
    fn unregister_removes_connection() {
        let registry = SessionRegistry::new();
        let (id, _rx) = connect(&registry, "tab", None);
        assert_eq!(registry.connection_count(), 1);
        registry.unregister(id);
        assert_eq!(registry.connection_count(), 0);
    }
}
