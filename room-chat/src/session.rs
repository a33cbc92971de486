//! One connection from upgrade to teardown.
//!
//! ```text
//! Connecting --(registered)--> Established --> Active --(eof/error/closed)--> Terminated
//!     \--(userId missing)----------------------------------------------------^
//! ```
//!
//! The read loop decodes one frame at a time and dispatches it. A frame that
//! fails to decode is logged and dropped; the session keeps reading. Any read
//! error ends the session, as does a close signal on the connection handle
//! (raised when the same user connects again, or on server shutdown).

use std::{fmt, sync::Arc};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audit::AuditSink,
    broadcast::{BroadcastReport, broadcast},
    connection::{ConnectionHandle, run_writer},
    message::{Event, Notification, decode},
    registry::Registry,
};

/// Sent as a text frame before closing a connection that failed admission.
pub const REJECTION_PAYLOAD: &str = "Invalid user or room ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Established,
    Active,
    Terminated,
}

/// Query parameters read during the upgrade request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdmissionParams {
    pub user_id: Option<String>,
}

impl AdmissionParams {
    /// Picks the first `userId` out of decoded query pairs. Repeated keys
    /// are ignored after the first.
    pub fn from_query<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let user_id = pairs
            .into_iter()
            .find_map(|(key, value)| (key == "userId").then_some(value));
        Self { user_id }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("missing or empty userId")]
    MissingUserId,
}

/// Extracts the caller's user id as given. Whitespace-only ids count as
/// missing.
pub fn admit(params: &AdmissionParams) -> Result<String, AdmissionError> {
    match &params.user_id {
        Some(user_id) if !user_id.trim().is_empty() => Ok(user_id.clone()),
        _ => Err(AdmissionError::MissingUserId),
    }
}

/// Everything a session needs from the server, cloned into each connection.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub audit: Arc<dyn AuditSink>,
    pub queue_capacity: usize,
    pub shutdown: CancellationToken,
}

/// Runs a whole connection: admission, registration, the read loop and
/// teardown. Returns once the connection's writer task has finished too.
pub async fn run_connection(
    mut socket: WebSocket,
    params: AdmissionParams,
    ctx: SessionContext,
) -> SessionState {
    let user_id = match admit(&params) {
        Ok(user_id) => user_id,
        Err(error) => {
            info!(%error, "rejecting connection");
            reject(&mut socket).await;
            return SessionState::Terminated;
        }
    };

    let (sink, stream) = socket.split();
    let (handle, outbound) = ConnectionHandle::new(&user_id, ctx.queue_capacity, &ctx.shutdown);
    let writer = tokio::spawn(run_writer(sink, outbound, Arc::clone(&ctx.audit)));

    let mut session = Session::new(ctx.registry, user_id, handle);
    session.establish().await;
    let state = session.run(stream).await;

    if let Err(error) = writer.await {
        warn!(error = ?error, "connection writer task failed");
    }
    state
}

async fn reject(socket: &mut WebSocket) {
    if let Err(error) = socket.send(Message::Text(REJECTION_PAYLOAD.to_string())).await {
        debug!(%error, "failed to send rejection payload");
    }
    let close = Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: REJECTION_PAYLOAD.into(),
    }));
    if let Err(error) = socket.send(close).await {
        debug!(%error, "failed to close rejected connection");
    }
}

pub struct Session {
    user_id: String,
    handle: ConnectionHandle,
    registry: Arc<Registry>,
    state: SessionState,
}

impl Session {
    /// An admitted connection that is not registered yet.
    pub fn new(registry: Arc<Registry>, user_id: String, handle: ConnectionHandle) -> Self {
        Self {
            user_id,
            handle,
            registry,
            state: SessionState::Connecting,
        }
    }

    /// Registers the user's connection. A connection previously registered
    /// under the same id is closed, which ends its session.
    pub async fn establish(&mut self) {
        let user_id = &self.user_id;
        if let Some(previous) = self.registry.register(user_id, self.handle.clone()).await {
            info!(%user_id, previous = previous.id(), "replacing existing connection");
            previous.close();
        }
        info!(%user_id, connection = self.handle.id(), "client connected");
        self.state = SessionState::Established;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Reads frames until the stream ends, fails or the handle is closed,
    /// then tears the session down.
    pub async fn run<S, E>(mut self, mut reader: S) -> SessionState
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        self.state = SessionState::Active;

        loop {
            select! {
                biased;
                _ = self.handle.closed() => {
                    debug!(user_id = %self.user_id, "connection closed locally");
                    break;
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(text.as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.handle_frame(&bytes).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        warn!(user_id = %self.user_id, %error, "read error, ending session");
                        break;
                    }
                },
            }
        }

        self.terminate().await;
        self.state
    }

    /// Decodes and dispatches one frame. Undecodable frames are dropped.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<BroadcastReport> {
        match decode(frame) {
            Ok(event) => self.dispatch(event).await,
            Err(error) if error.is_unknown_type() => {
                debug!(user_id = %self.user_id, %error, "ignoring frame");
                None
            }
            Err(error) => {
                warn!(user_id = %self.user_id, %error, "dropping malformed frame");
                None
            }
        }
    }

    pub async fn dispatch(&self, event: Event) -> Option<BroadcastReport> {
        match event {
            Event::Join { user_id, room_id } => {
                self.registry.ensure_room(&room_id).await;
                if self.registry.join(&room_id, &user_id).await {
                    debug!(%user_id, %room_id, "already a member");
                    return None;
                }
                info!(%user_id, %room_id, sender = %self.user_id, "joined room");
                let notification = Notification::joined(&user_id, &room_id);
                Some(broadcast(&self.registry, &room_id, notification).await)
            }
            Event::Leave { room_id, user_id } => {
                if !self.registry.leave(&room_id, &user_id).await {
                    debug!(%user_id, %room_id, "not a member");
                    return None;
                }
                info!(%user_id, %room_id, sender = %self.user_id, "left room");
                let notification = Notification::left(&user_id, &room_id);
                Some(broadcast(&self.registry, &room_id, notification).await)
            }
            Event::Chat { text, destination } => {
                Some(broadcast(&self.registry, &destination, Notification::chat(text)).await)
            }
        }
    }

    async fn terminate(&mut self) {
        let rooms = self.registry.disconnect(&self.user_id, self.handle.id()).await;
        self.handle.close();
        self.state = SessionState::Terminated;
        info!(user_id = %self.user_id, rooms = rooms.len(), "client disconnected");
    }
}
