//! Fire-and-forget certificate expiration reporting.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::monitoring::types::{HostSchemeId, MonitorId};
use crate::outbound::{reply_status, ControllerTransport};

pub const CERTIFICATE_REPORT_PATH: &str = "/host_scheme/certificate";

const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Spawn a reporter for one expiration change. It POSTs the same message
/// every minute until the controller accepts it, then ends.
pub(super) fn spawn_certificate_reporter(
    transport: Arc<dyn ControllerTransport>,
    monitor_id: MonitorId,
    host_scheme_id: HostSchemeId,
    expiration_timestamp: u64,
) {
    tokio::spawn(async move {
        let message = serde_json::json!({
            "monitor_id": monitor_id,
            "host_scheme_id": host_scheme_id,
            "expiration_timestamp": expiration_timestamp,
        });

        loop {
            match transport.post_json(CERTIFICATE_REPORT_PATH, message.clone()).await {
                Ok(reply) => match reply_status(&reply) {
                    Some("OK") => {
                        info!("Sent certificate data to {}: {}", CERTIFICATE_REPORT_PATH, message);
                        break;
                    }
                    Some(status) => warn!(
                        "Failed to send certificate data: server reported \"{}\" - retrying in {} seconds",
                        status,
                        RETRY_DELAY.as_secs()
                    ),
                    None => warn!(
                        "Failed to send certificate data: unexpected response - retrying in {} seconds",
                        RETRY_DELAY.as_secs()
                    ),
                },
                Err(error) => warn!(
                    "Failed to send certificate data: {} - retrying in {} seconds",
                    error,
                    RETRY_DELAY.as_secs()
                ),
            }

            tokio::time::sleep(RETRY_DELAY).await;
        }
    });
}
