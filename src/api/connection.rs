//! Per-connection protocol handling.
//!
//! [`ConnectionHandler`] owns at most one session and turns inbound messages
//! into session operations. [`run_socket`] drives it from a WebSocket.

use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::process::OutputEvent;
use crate::protocol::{ChangeDirectory, ClientMessage, ExecuteCommand, ServerMessage, StartSession};
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{SessionError, SessionState, TerminalSession};

use super::AppState;

pub struct ConnectionHandler {
    registry: SessionRegistry,
    defaults: SessionConfig,
    session: Option<TerminalSession>,
    events: Option<mpsc::Receiver<OutputEvent>>,
}

impl ConnectionHandler {
    pub fn new(registry: SessionRegistry, defaults: SessionConfig) -> Self {
        Self {
            registry,
            defaults,
            session: None,
            events: None,
        }
    }

    /// The session attached to this connection, live or not.
    pub fn session(&self) -> Option<&TerminalSession> {
        self.session.as_ref()
    }

    /// Handle one inbound text frame, returning the direct reply if any.
    ///
    /// Accepted commands have no direct reply; their output arrives through
    /// [`next_event`](Self::next_event).
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        let message = match ClientMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting inbound message");
                return Some(ServerMessage::error(e.to_string()));
            }
        };

        match message {
            ClientMessage::StartSession(req) => Some(self.start_session(req)),
            ClientMessage::ExecuteCommand(req) => self.execute_command(req).await,
            ClientMessage::ChangeDirectory(req) => Some(self.change_directory(req)),
            ClientMessage::GetHistory => Some(match &self.session {
                Some(session) => ServerMessage::History {
                    history: session.history(),
                },
                None => no_session(),
            }),
            ClientMessage::KillSession => Some(self.kill_session()),
        }
    }

    fn start_session(&mut self, req: StartSession) -> ServerMessage {
        if let Some(current) = &self.session {
            if matches!(current.state(), SessionState::Starting | SessionState::Active) {
                return ServerMessage::session_error(
                    RegistryError::AlreadyExists(current.id().to_string()).to_string(),
                );
            }
        }

        let config = self.defaults.merged(req.config.as_ref());
        let mut events = None;
        let session = match self.registry.register_with(req.session_id, |id| {
            let (session, rx) = TerminalSession::with_channel(id, config);
            events = Some(rx);
            session
        }) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "session not admitted");
                return ServerMessage::session_error(e.to_string());
            }
        };

        if let Err(e) = session.start() {
            self.registry.deregister_session(&session);
            return ServerMessage::session_error(e.to_string());
        }

        self.session = Some(session.clone());
        self.events = events;
        ServerMessage::SessionStarted {
            session_id: session.id().to_string(),
            success: true,
        }
    }

    async fn execute_command(&mut self, req: ExecuteCommand) -> Option<ServerMessage> {
        let Some(session) = self.session.as_ref().filter(|s| s.is_active()) else {
            return Some(no_session());
        };
        // non-string commands validate as empty and are reported as invalid
        let raw = req.command.as_str().unwrap_or_default();
        match session.execute_command(raw).await {
            Ok(()) => None,
            // replied directly so a backed-up output stream cannot swallow it
            Err(e) => Some(ServerMessage::from_output(
                session.id(),
                OutputEvent::error(e.to_string()),
            )),
        }
    }

    fn change_directory(&mut self, req: ChangeDirectory) -> ServerMessage {
        let Some(session) = &self.session else {
            return no_session();
        };
        match session.change_directory(&req.directory) {
            Ok(dir) => ServerMessage::DirectoryChanged {
                directory: dir.display().to_string(),
            },
            Err(e) => ServerMessage::error(e.to_string()),
        }
    }

    fn kill_session(&mut self) -> ServerMessage {
        let Some(session) = &self.session else {
            return no_session();
        };
        session.kill();
        self.registry.deregister_session(session);
        tracing::info!(session = %session.id(), "session killed by client");
        ServerMessage::SessionKilled {
            session_id: session.id().to_string(),
        }
    }

    /// Next output event of the attached session. Pending while none is attached.
    pub async fn next_event(&mut self) -> Option<ServerMessage> {
        let (Some(session), Some(events)) = (&self.session, &mut self.events) else {
            return std::future::pending().await;
        };
        match events.recv().await {
            Some(event) => Some(ServerMessage::from_output(session.id(), event)),
            None => {
                self.events = None;
                None
            }
        }
    }

    /// Kill and deregister the attached session. Sessions never outlive
    /// their connection.
    pub fn cleanup(&mut self) {
        self.events = None;
        if let Some(session) = self.session.take() {
            session.kill();
            self.registry.deregister_session(&session);
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn no_session() -> ServerMessage {
    ServerMessage::error(SessionError::NotActive.to_string())
}

fn shutdown_frame() -> CloseFrame {
    CloseFrame {
        code: close_code::NORMAL,
        reason: "server shutting down".into(),
    }
}

/// Serve one terminal WebSocket until either side closes it or the server
/// shuts down.
pub(super) async fn run_socket(socket: WebSocket, state: AppState, client: SocketAddr) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::info!(%client, "websocket connection established");

    // a receiver subscribed after shutdown never sees a change
    if *shutdown_rx.borrow_and_update() {
        tracing::debug!(%client, "rejecting connection: server shutting down");
        let _ = ws_tx.send(Message::Close(Some(shutdown_frame()))).await;
        let _ = ws_tx.flush().await;
        return;
    }

    if !state.registry.has_capacity() {
        tracing::warn!(%client, "rejecting connection: session limit reached");
        let reply = ServerMessage::error(RegistryError::CapacityReached.to_string());
        let _ = ws_tx.send(Message::Text(reply.to_json().into())).await;
        let _ = ws_tx.close().await;
        return;
    }

    let mut handler = ConnectionHandler::new(state.registry.clone(), state.config.terminal.clone());

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(%client, ?e, "websocket error");
                        break;
                    }
                };
                if let Some(reply) = handler.handle_text(&text).await {
                    if ws_tx.send(Message::Text(reply.to_json().into())).await.is_err() {
                        break;
                    }
                }
            }

            Some(event) = handler.next_event() => {
                if ws_tx.send(Message::Text(event.to_json().into())).await.is_err() {
                    break;
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(%client, "websocket received shutdown signal, closing");
                    let _ = ws_tx.send(Message::Close(Some(shutdown_frame()))).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    handler.cleanup();
    tracing::info!(%client, "websocket connection closed");
}
