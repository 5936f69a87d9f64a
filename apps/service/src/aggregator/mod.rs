/// Telemetry aggregation module - the thread-safe sink between probes and
/// the database controller
///
/// Latency samples batch into packed binary reports; events and certificate
/// changes go out as JSON. Controller unavailability is survived by holding
/// the in-flight batch and retrying the identical bytes each minute.
mod certificate;
mod events;
pub mod wire;

pub use events::{EventRecord, EVENT_REPORT_PATH};
pub use certificate::CERTIFICATE_REPORT_PATH;
pub use wire::LatencyEntry;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::monitoring::types::{HostSchemeId, MonitorId};
use crate::outbound::{reply_status, ControllerTransport};
use crate::resources;
use crate::tracker::{ServerStatus, ServiceTracker};

pub const LATENCY_RECORD_PATH: &str = "/latency/record";

/// Longest a latency sample waits before a report goes out.
const MAXIMUM_REPORT_DELAY: Duration = Duration::from_secs(60);

/// Pending samples beyond this force an immediate report.
const MAXIMUM_PENDING_ENTRIES: usize = 1000;

const RETRY_DELAY: Duration = Duration::from_secs(60);

enum FlushCommand {
    /// Move the current batch in flight and transmit it. Forced flushes
    /// (server status changes) go out even when the batch is empty so the
    /// controller sees the new header.
    Flush { force: bool },
    /// Arm the report timer if it is not already running.
    Arm,
}

struct LatencyLists {
    current: Vec<LatencyEntry>,
    /// True while a batch is being transmitted; only one batch is ever in
    /// flight.
    in_flight: bool,
    timer_armed: bool,
}

/// Thread-safe sink for latency samples, monitor events, and certificate
/// changes. Holds no references to monitors or customers; everything
/// arrives by value.
pub struct DataAggregator {
    transport: Arc<dyn ControllerTransport>,
    identifier: Mutex<String>,
    tracker: Mutex<Weak<ServiceTracker>>,
    lists: Mutex<LatencyLists>,
    commands: mpsc::UnboundedSender<FlushCommand>,
    events: mpsc::UnboundedSender<EventRecord>,
}

impl DataAggregator {
    pub fn new(transport: Arc<dyn ControllerTransport>) -> Arc<Self> {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let aggregator = Arc::new(Self {
            transport: Arc::clone(&transport),
            identifier: Mutex::new(String::new()),
            tracker: Mutex::new(Weak::new()),
            lists: Mutex::new(LatencyLists {
                current: Vec::new(),
                in_flight: false,
                timer_armed: false,
            }),
            commands,
            events: event_sender,
        });

        tokio::spawn(run_flush_driver(Arc::clone(&aggregator), command_receiver));
        tokio::spawn(events::run_event_reporter(transport, event_receiver));

        aggregator
    }

    pub fn server_identifier(&self) -> String {
        self.identifier.lock().expect("identifier mutex poisoned").clone()
    }

    pub fn set_server_identifier(&self, identifier: &str) {
        *self.identifier.lock().expect("identifier mutex poisoned") = identifier.to_string();
    }

    pub fn set_tracker(&self, tracker: &Arc<ServiceTracker>) {
        *self.tracker.lock().expect("tracker handle mutex poisoned") = Arc::downgrade(tracker);
    }

    /// Record one latency sample. Fully thread safe.
    pub fn record_latency(&self, monitor_id: MonitorId, unix_timestamp: u64, microseconds: u32) {
        let mut lists = self.lists.lock().expect("latency list mutex poisoned");
        // The current vector is unbounded on purpose: during a controller
        // outage samples accumulate here until delivery resumes.
        lists.current.push(LatencyEntry::new(monitor_id, unix_timestamp, microseconds));

        if !lists.in_flight {
            if lists.current.len() >= MAXIMUM_PENDING_ENTRIES {
                let _ = self.commands.send(FlushCommand::Flush { force: false });
            } else if !lists.timer_armed {
                lists.timer_armed = true;
                let _ = self.commands.send(FlushCommand::Arm);
            }
        }
    }

    /// Queue a monitor event for in-order delivery. Fully thread safe.
    pub fn report_event(&self, record: EventRecord) {
        let _ = self.events.send(record);
    }

    /// Report a certificate expiration change. Fully thread safe.
    pub fn report_ssl_certificate_expiration_change(
        &self,
        monitor_id: MonitorId,
        host_scheme_id: HostSchemeId,
        expiration_timestamp: u64,
    ) {
        certificate::spawn_certificate_reporter(
            Arc::clone(&self.transport),
            monitor_id,
            host_scheme_id,
            expiration_timestamp,
        );
    }

    /// Force an immediate report so the controller sees the current header,
    /// even when no samples are pending.
    pub fn send_report(&self) {
        let _ = self.commands.send(FlushCommand::Flush { force: true });
    }

    fn build_header(&self) -> wire::ReportHeader {
        let identifier = self.server_identifier();
        let (monitors_per_second, status_code) =
            match self.tracker.lock().expect("tracker handle mutex poisoned").upgrade() {
                Some(tracker) => (tracker.monitors_per_second(), tracker.status().code()),
                None => (0.0, ServerStatus::AllUnknown.code()),
            };

        wire::ReportHeader::new(
            &identifier,
            monitors_per_second,
            resources::cpu_utilization(),
            resources::memory_utilization(),
            status_code,
        )
    }

    /// Move the current list in flight and transmit it, retrying the same
    /// payload until the controller accepts it.
    async fn flush(&self, force: bool) {
        let batch = {
            let mut lists = self.lists.lock().expect("latency list mutex poisoned");
            if lists.in_flight {
                return;
            }
            if lists.current.is_empty() && !force {
                lists.timer_armed = false;
                return;
            }
            lists.in_flight = true;
            lists.timer_armed = false;
            let capacity = lists.current.len();
            std::mem::replace(&mut lists.current, Vec::with_capacity(capacity))
        };

        let payload = wire::encode(&self.build_header(), &batch);

        loop {
            match self.transport.post_binary(LATENCY_RECORD_PATH, payload.clone()).await {
                Ok(reply) => match reply_status(&reply) {
                    Some("OK") => {
                        match (batch.first(), batch.last()) {
                            (Some(first), Some(last)) => info!(
                                "Sent {} latency entries for timestamps {}-{}",
                                batch.len(),
                                first.unix_timestamp(),
                                last.unix_timestamp()
                            ),
                            _ => info!("Sent empty latency entry report"),
                        }
                        break;
                    }
                    Some(status) => {
                        warn!(
                            "Latency report failed: database controller reported \"{}\" - retrying in {} seconds",
                            status,
                            RETRY_DELAY.as_secs()
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    None => {
                        warn!(
                            "Latency report failed: expected JSON object - retrying in {} seconds",
                            RETRY_DELAY.as_secs()
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                },
                Err(error) => {
                    warn!(
                        "Latency report failed: {} - retrying in {} seconds",
                        error,
                        RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        let mut lists = self.lists.lock().expect("latency list mutex poisoned");
        lists.in_flight = false;
        if lists.current.len() >= MAXIMUM_PENDING_ENTRIES {
            let _ = self.commands.send(FlushCommand::Flush { force: false });
        } else if !lists.current.is_empty() && !lists.timer_armed {
            lists.timer_armed = true;
            let _ = self.commands.send(FlushCommand::Arm);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_entries(&self) -> usize {
        self.lists.lock().expect("latency list mutex poisoned").current.len()
    }
}

async fn run_flush_driver(
    aggregator: Arc<DataAggregator>,
    mut commands: mpsc::UnboundedReceiver<FlushCommand>,
) {
    let mut flush_deadline: Option<Instant> = None;

    loop {
        let armed = flush_deadline.is_some();
        let sleep_deadline = flush_deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(FlushCommand::Flush { force }) => {
                    flush_deadline = None;
                    aggregator.flush(force).await;
                }
                Some(FlushCommand::Arm) => {
                    if flush_deadline.is_none() {
                        flush_deadline = Some(Instant::now() + MAXIMUM_REPORT_DELAY);
                    }
                }
            },
            _ = sleep_until(sleep_deadline), if armed => {
                flush_deadline = None;
                aggregator.flush(false).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::{EventType, MonitorStatus};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted controller: records every payload, optionally failing the
    /// first N binary posts and answering JSON posts from a status script.
    struct RecordingTransport {
        binary: Mutex<Vec<Vec<u8>>>,
        json: Mutex<Vec<(String, serde_json::Value)>>,
        binary_failures: AtomicUsize,
        json_statuses: Mutex<VecDeque<Result<String, ()>>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                binary: Mutex::new(Vec::new()),
                json: Mutex::new(Vec::new()),
                binary_failures: AtomicUsize::new(0),
                json_statuses: Mutex::new(VecDeque::new()),
            })
        }

        fn binary_posts(&self) -> Vec<Vec<u8>> {
            self.binary.lock().expect("test mutex").clone()
        }

        fn json_posts(&self) -> Vec<(String, serde_json::Value)> {
            self.json.lock().expect("test mutex").clone()
        }
    }

    #[async_trait]
    impl ControllerTransport for RecordingTransport {
        async fn post_binary(&self, _path: &str, body: Vec<u8>) -> anyhow::Result<serde_json::Value> {
            self.binary.lock().expect("test mutex").push(body);
            if self.binary_failures.load(Ordering::SeqCst) > 0 {
                self.binary_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!("connection refused"));
            }
            Ok(serde_json::json!({"status": "OK"}))
        }

        async fn post_json(
            &self,
            path: &str,
            body: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            self.json.lock().expect("test mutex").push((path.to_string(), body));
            let scripted = self.json_statuses.lock().expect("test mutex").pop_front();
            match scripted {
                Some(Ok(status)) => Ok(serde_json::json!({"status": status})),
                Some(Err(())) => Err(anyhow!("connection refused")),
                None => Ok(serde_json::json!({"status": "OK"})),
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_forces_an_immediate_flush() {
        let transport = RecordingTransport::new();
        let aggregator = DataAggregator::new(transport.clone() as Arc<dyn ControllerTransport>);
        aggregator.set_server_identifier("test-server");

        for i in 0..MAXIMUM_PENDING_ENTRIES as u32 {
            aggregator.record_latency(i + 1, wire::ZORAN_EPOCH_OFFSET + i as u64, 1_000 + i);
        }

        wait_until(|| !transport.binary_posts().is_empty()).await;

        let posts = transport.binary_posts();
        assert_eq!(posts.len(), 1);
        let (header, entries) = wire::decode(&posts[0]).expect("valid payload");
        assert_eq!(header.identifier_str(), "test-server");
        assert_eq!(entries.len(), MAXIMUM_PENDING_ENTRIES);
        assert_eq!(entries[0].monitor_id, 1);
        assert_eq!(entries.last().map(|e| e.monitor_id), Some(MAXIMUM_PENDING_ENTRIES as u32));
        assert_eq!(aggregator.pending_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flush_delivers_small_batches() {
        let transport = RecordingTransport::new();
        let aggregator = DataAggregator::new(transport.clone() as Arc<dyn ControllerTransport>);

        aggregator.record_latency(7, wire::ZORAN_EPOCH_OFFSET + 5, 2_500);
        wait_until(|| !transport.binary_posts().is_empty()).await;

        let (_, entries) = wire::decode(&transport.binary_posts()[0]).expect("valid payload");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].monitor_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_resend_identical_bytes() {
        let transport = RecordingTransport::new();
        transport.binary_failures.store(3, Ordering::SeqCst);
        let aggregator = DataAggregator::new(transport.clone() as Arc<dyn ControllerTransport>);

        aggregator.record_latency(9, wire::ZORAN_EPOCH_OFFSET + 60, 4_000);
        aggregator.send_report();

        wait_until(|| transport.binary_posts().len() >= 4).await;

        let posts = transport.binary_posts();
        assert_eq!(posts.len(), 4);
        assert!(posts.windows(2).all(|pair| pair[0] == pair[1]));

        // After acceptance the batch is dropped, not re-sent.
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(transport.binary_posts().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_report_goes_out_empty() {
        let transport = RecordingTransport::new();
        let aggregator = DataAggregator::new(transport.clone() as Arc<dyn ControllerTransport>);

        aggregator.send_report();
        wait_until(|| !transport.binary_posts().is_empty()).await;

        let (_, entries) =
            wire::decode(&transport.binary_posts()[0]).expect("valid payload");
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_delivered_in_submission_order() {
        let transport = RecordingTransport::new();
        // First post fails at the transport level: the same event must be
        // retried before anything later goes out.
        transport.json_statuses.lock().expect("test mutex").push_back(Err(()));
        let aggregator = DataAggregator::new(transport.clone() as Arc<dyn ControllerTransport>);

        for (index, event_type) in
            [EventType::Working, EventType::ContentChanged, EventType::Working].iter().enumerate()
        {
            aggregator.report_event(EventRecord {
                monitor_id: 31,
                timestamp: 1_700_000_000 + index as u64,
                event_type: *event_type,
                monitor_status: MonitorStatus::Working,
                hash: None,
                message: String::new(),
            });
        }

        wait_until(|| transport.json_posts().len() >= 4).await;

        let posts = transport.json_posts();
        let types: Vec<String> = posts
            .iter()
            .map(|(_, body)| body["event_type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(types, vec!["working", "working", "content_changed", "working"]);
        assert!(posts.iter().all(|(path, _)| path == EVENT_REPORT_PATH));
    }

    #[tokio::test(start_paused = true)]
    async fn certificate_reports_retry_until_accepted() {
        let transport = RecordingTransport::new();
        {
            let mut script = transport.json_statuses.lock().expect("test mutex");
            script.push_back(Ok("failed, busy".to_string()));
            script.push_back(Err(()));
            script.push_back(Ok("OK".to_string()));
        }
        let aggregator = DataAggregator::new(transport.clone() as Arc<dyn ControllerTransport>);

        aggregator.report_ssl_certificate_expiration_change(3, 14, 1_800_000_000);

        wait_until(|| transport.json_posts().len() >= 3).await;
        tokio::time::sleep(Duration::from_secs(180)).await;

        let posts = transport.json_posts();
        assert_eq!(posts.len(), 3);
        assert!(posts.iter().all(|(path, _)| path == CERTIFICATE_REPORT_PATH));
        assert_eq!(posts[0].1["host_scheme_id"], 14);
        assert_eq!(posts[0].1["expiration_timestamp"], 1_800_000_000u64);
    }
}
