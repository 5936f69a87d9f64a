//! Serialized event reporting to the controller.
//!
//! Events are rare and must arrive in submission order, so they travel one
//! at a time through a FIFO: while a POST is outstanding, later events
//! queue; a transport failure retries the same message until the controller
//! answers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::monitoring::types::{EventType, MonitorId, MonitorStatus};
use crate::outbound::{reply_status, ControllerTransport};

pub const EVENT_REPORT_PATH: &str = "/event/report";

const RETRY_DELAY: Duration = Duration::from_secs(60);

/// A monitor event by value; the aggregator never holds entity references.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub monitor_id: MonitorId,
    pub timestamp: u64,
    pub event_type: EventType,
    pub monitor_status: MonitorStatus,
    /// Content or keyword hash; blocks repeated reports of identical data.
    pub hash: Option<[u8; 32]>,
    pub message: String,
}

fn event_json(record: &EventRecord) -> serde_json::Value {
    let mut message = serde_json::json!({
        "monitor_id": record.monitor_id,
        "timestamp": record.timestamp,
        "event_type": record.event_type.as_str(),
        "monitor_status": record.monitor_status.as_str(),
        "message": record.message,
    });
    if let Some(hash) = &record.hash {
        message["hash"] =
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(hash));
    }
    message
}

pub(super) async fn run_event_reporter(
    transport: Arc<dyn ControllerTransport>,
    mut events: mpsc::UnboundedReceiver<EventRecord>,
) {
    let mut queue: VecDeque<EventRecord> = VecDeque::new();

    loop {
        if queue.is_empty() {
            match events.recv().await {
                Some(record) => queue.push_back(record),
                None => break,
            }
        }
        while let Ok(record) = events.try_recv() {
            queue.push_back(record);
        }

        let Some(front) = queue.front() else {
            continue;
        };

        match transport.post_json(EVENT_REPORT_PATH, event_json(front)).await {
            Ok(reply) => {
                match reply_status(&reply) {
                    Some("OK") => info!(
                        "Sent event {} @ {} (status {}) monitor ID {}, \"{}\"",
                        front.event_type,
                        front.timestamp,
                        front.monitor_status,
                        front.monitor_id,
                        front.message
                    ),
                    Some(status) => warn!(
                        "Failed to send event {} for monitor ID {}: server reported \"{}\"",
                        front.event_type, front.monitor_id, status
                    ),
                    None => warn!(
                        "Failed to send event {} for monitor ID {}: unexpected response",
                        front.event_type, front.monitor_id
                    ),
                }
                // The controller answered; this event is done either way.
                queue.pop_front();
            }
            Err(error) => {
                warn!(
                    "Failed to send event {} for monitor ID {}: {} - retrying in {} seconds",
                    front.event_type,
                    front.monitor_id,
                    error,
                    RETRY_DELAY.as_secs()
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
