// ABOUTME: WebSocket surface exposing the chat orchestrator over axum
// ABOUTME: Session validation at upgrade, then a per-connection message loop
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Chat Server
//!
//! One WebSocket route. The upgrade request carries `sessionId` and an
//! optional `conversationId`; the session is validated before the upgrade
//! completes, so an invalid session never gets a socket. Outbound frames
//! flow through an unbounded channel drained by a dedicated writer task,
//! keeping broadcasts non-blocking.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::{ChatOrchestrator, ClientMessage, ServerEvent, TurnRequest};
use crate::errors::{AppError, AppResult};
use crate::session::{ConnectionMeta, SessionRegistry};
use crate::store::ChatStore;

/// Maps a session id to an authenticated user before the upgrade
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Returns the user behind the session, `None` for anonymous sessions
    ///
    /// # Errors
    ///
    /// Returns `InvalidSession` to reject the upgrade.
    async fn validate(&self, session_id: &str) -> AppResult<Option<Uuid>>;
}

/// Accepts every non-empty session id as anonymous
pub struct AnonymousSessions;

#[async_trait]
impl SessionValidator for AnonymousSessions {
    async fn validate(&self, session_id: &str) -> AppResult<Option<Uuid>> {
        if session_id.trim().is_empty() {
            return Err(AppError::invalid_session("empty session id"));
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "conversationId")]
    conversation_id: Option<Uuid>,
}

/// WebSocket server state shared across connections
pub struct ChatServer {
    orchestrator: Arc<ChatOrchestrator>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn ChatStore>,
    validator: Arc<dyn SessionValidator>,
}

impl ChatServer {
    #[must_use]
    pub fn new(
        orchestrator: Arc<ChatOrchestrator>,
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn ChatStore>,
        validator: Arc<dyn SessionValidator>,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            store,
            validator,
        }
    }

    /// Router exposing the chat WebSocket endpoint
    #[must_use]
    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(handle_upgrade))
            .with_state(self)
    }

    /// Bind and serve until the process is stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server loop
    /// fails.
    pub async fn serve(self: Arc<Self>, port: u16) -> AppResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| AppError::config(format!("failed to bind port {port}: {e}")))?;
        info!(port, "chat server listening");
        axum::serve(listener, self.routes())
            .await
            .map_err(|e| AppError::internal(format!("server error: {e}")))?;
        Ok(())
    }

    async fn handle_connection(
        &self,
        socket: WebSocket,
        session_id: String,
        user_id: Option<Uuid>,
        query_conversation: Option<Uuid>,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if ws_tx.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
        });

        // Query parameter wins; otherwise restore the persisted binding
        let conversation_id = match query_conversation {
            Some(id) => Some(id),
            None => self
                .store
                .session_conversation(&session_id)
                .await
                .unwrap_or_default(),
        };

        let connection_id = self.sessions.register(ConnectionMeta {
            session_id: session_id.clone(),
            user_id,
            conversation_id,
            sender: tx,
        });

        if let Some(id) = conversation_id {
            if let Err(e) = self.orchestrator.catch_up(connection_id, id).await {
                warn!(%connection_id, conversation_id = %id, error = %e, "catch-up failed");
            }
        }

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.dispatch(connection_id, &session_id, user_id, &text)
                        .await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        self.sessions.unregister(connection_id);
        writer.abort();
        debug!(%connection_id, "connection closed");
    }

    async fn dispatch(
        &self,
        connection_id: Uuid,
        session_id: &str,
        user_id: Option<Uuid>,
        text: &str,
    ) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                self.send_error(connection_id, &format!("Invalid message format: {e}"));
                return;
            }
        };

        match message {
            ClientMessage::StartChat {
                prompt,
                conversation_id,
                message_id,
                provider,
                model,
                reasoning_effort,
            } => {
                let turn = TurnRequest {
                    connection_id,
                    session_id: session_id.to_owned(),
                    user_id,
                    prompt,
                    conversation_id,
                    message_id,
                    provider,
                    model,
                    reasoning_effort,
                };
                let orchestrator = Arc::clone(&self.orchestrator);
                // The turn outlives this frame so the loop stays responsive
                tokio::spawn(async move {
                    orchestrator.start_chat(turn).await;
                });
            }
            ClientMessage::SwitchConversation { conversation_id } => {
                if let Err(e) = self
                    .orchestrator
                    .switch_conversation(connection_id, session_id, conversation_id)
                    .await
                {
                    warn!(%connection_id, error = %e, "conversation switch failed");
                    self.send_error(connection_id, &e.to_string());
                }
            }
            ClientMessage::Ping => {
                if let Err(e) = self.sessions.send_to(connection_id, &ServerEvent::Pong) {
                    warn!(%connection_id, error = %e, "failed to send pong");
                }
            }
        }
    }

    fn send_error(&self, connection_id: Uuid, message: &str) {
        if let Err(e) = self.sessions.send_to(
            connection_id,
            &ServerEvent::Error {
                message: message.to_owned(),
            },
        ) {
            warn!(%connection_id, error = %e, "failed to send error event");
        }
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(server): State<Arc<ChatServer>>,
) -> Response {
    let user_id = match server.validator.validate(&params.session_id).await {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(session_id = %params.session_id, error = %e, "session rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let session_id = params.session_id;
    let conversation_id = params.conversation_id;
    ws.on_upgrade(move |socket| async move {
        server
            .handle_connection(socket, session_id, user_id, conversation_id)
            .await;
    })
}
