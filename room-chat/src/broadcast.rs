//! Room fan-out.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    connection::{Delivery, EnqueueError},
    message::Notification,
    registry::Registry,
};

/// Outcome of one broadcast, for logging and tests. Nothing acts on it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Queues `notification` for every member of `room_id` that has a live
/// connection.
///
/// Recipients are snapshotted under the registry lock; the lock is released
/// before anything is enqueued. Enqueueing never waits, so a stalled peer
/// only loses its own frames. Failures are logged and counted but never
/// remove anyone from the registry.
pub async fn broadcast(
    registry: &Registry,
    room_id: &str,
    notification: Notification,
) -> BroadcastReport {
    let recipients = registry.recipients(room_id).await;
    let mut report = BroadcastReport {
        recipients: recipients.len(),
        ..BroadcastReport::default()
    };
    if recipients.is_empty() {
        return report;
    }

    let frame: Arc<str> = match notification.encode() {
        Ok(frame) => Arc::from(frame),
        Err(error) => {
            warn!(room_id, error = ?error, "failed to encode notification");
            report.dropped = report.recipients;
            return report;
        }
    };
    let notification = Arc::new(notification);

    for (user_id, handle) in recipients {
        let delivery = Delivery {
            room_id: room_id.to_string(),
            notification: Arc::clone(&notification),
            frame: Arc::clone(&frame),
        };
        match handle.enqueue(delivery) {
            Ok(()) => report.delivered += 1,
            Err(EnqueueError::Full) => {
                report.dropped += 1;
                warn!(
                    %user_id,
                    room_id,
                    total_drops = handle.dropped_frames(),
                    "outbound queue full, dropping frame"
                );
            }
            Err(EnqueueError::Closed) => {
                report.dropped += 1;
                debug!(%user_id, room_id, "connection closed, dropping frame");
            }
        }
    }

    debug!(
        room_id,
        kind = %notification.kind,
        recipients = report.recipients,
        delivered = report.delivered,
        "broadcast"
    );
    report
}
