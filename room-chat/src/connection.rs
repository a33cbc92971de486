//! Per-connection outbound queue and its dedicated writer task.
//!
//! Broadcasts never touch the transport directly. They enqueue a
//! [`Delivery`] on the member's [`ConnectionHandle`]; the connection's writer
//! task drains the queue, consults the audit sink and writes the frame. The
//! queue is bounded and enqueueing never waits: when it is full the newest
//! frame is dropped and counted.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    audit::{AuditRecord, AuditSink},
    message::Notification,
};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One frame queued for one member.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub room_id: String,
    pub notification: Arc<Notification>,
    /// Serialized once per broadcast and shared by every recipient.
    pub frame: Arc<str>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// Non-owning handle to a live connection. Cloned into the registry; the
/// session keeps the matching [`Outbound`] and the transport itself.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: Arc<str>,
    queue: mpsc::Sender<Delivery>,
    closed: CancellationToken,
    dropped: Arc<AtomicU64>,
}

/// Receiving side of a connection's queue, consumed by [`run_writer`].
pub struct Outbound {
    user_id: Arc<str>,
    queue: mpsc::Receiver<Delivery>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle whose close signal is a child of `shutdown`, so
    /// cancelling `shutdown` closes every connection created from it.
    pub fn new(user_id: &str, capacity: usize, shutdown: &CancellationToken) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = shutdown.child_token();
        let user_id: Arc<str> = Arc::from(user_id);

        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id: Arc::clone(&user_id),
            queue: tx,
            closed: closed.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let outbound = Outbound {
            user_id,
            queue: rx,
            closed,
        };
        (handle, outbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queues a delivery without waiting.
    pub fn enqueue(&self, delivery: Delivery) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        match self.queue.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Signals both the writer task and the session read loop to stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called or the server is
    /// shutting down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Frames dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Outbound {
    #[cfg(test)]
    pub(crate) async fn recv(&mut self) -> Option<Delivery> {
        self.queue.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Delivery> {
        self.queue.try_recv().ok()
    }
}

/// Drains `outbound` into `sink` until the connection is closed or a write
/// fails. A close frame is sent on the way out; errors on that final send are
/// expected when the peer already went away and are ignored.
pub async fn run_writer<S>(mut sink: S, outbound: Outbound, audit: Arc<dyn AuditSink>)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let Outbound {
        user_id,
        mut queue,
        closed,
    } = outbound;

    loop {
        select! {
            biased;
            _ = closed.cancelled() => break,
            delivery = queue.recv() => {
                let Some(delivery) = delivery else { break };
                if !deliver(&mut sink, &user_id, delivery, audit.as_ref()).await {
                    // No cleanup from here: the session's read loop owns teardown.
                    return;
                }
            }
        }
    }

    let farewell = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "connection closed".into(),
    }));
    if let Err(error) = sink.send(farewell).await {
        debug!(%user_id, %error, "close frame not delivered");
    }
}

async fn deliver<S>(sink: &mut S, user_id: &str, delivery: Delivery, audit: &dyn AuditSink) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let record = AuditRecord {
        user_id: user_id.to_string(),
        action_type: delivery.notification.kind,
        room_id: delivery.room_id,
        message: delivery.notification.content.clone(),
    };
    if let Err(error) = audit.log_action(&record).await {
        warn!(%user_id, error = ?error, "failed to write audit record");
    }

    match sink.send(Message::Text(delivery.frame.to_string())).await {
        Ok(()) => true,
        Err(error) => {
            warn!(%user_id, %error, "error writing to socket");
            false
        }
    }
}
