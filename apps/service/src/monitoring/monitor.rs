use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};

use sha2::{Digest, Sha256};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::aggregator::{DataAggregator, EventRecord};
use crate::scrubber;

use super::host_scheme::HostScheme;
use super::probe::ProbeRequest;
use super::types::{
    unix_now, ContentCheckMode, EventType, Method, MonitorId, MonitorStatus, PostContentType,
};

/// User agent reported when neither the configuration nor the monitor
/// overrides it.
pub const DEFAULT_USER_AGENT: &str = "ZoranBot";

/// Samples slower than this are discarded rather than recorded.
pub const MAXIMUM_ALLOWED_LATENCY_MICROSECONDS: u64 = 60_000_000;

/// Process-wide headers attached to every probe request, set from the
/// configuration file.
static DEFAULT_HEADERS: LazyLock<RwLock<Vec<(String, String)>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

/// Customer-entered probe target attributes. All of them may be replaced when
/// the controller re-pushes the monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Path under the owning host/scheme, as entered by the customer.
    pub path: String,
    pub method: Method,
    pub content_check_mode: ContentCheckMode,
    /// Keyword bytes, scanned in order.
    pub keywords: Vec<Vec<u8>>,
    pub post_content_type: PostContentType,
    /// Per-monitor user-agent override; empty means "use the default".
    pub user_agent: String,
    pub post_content: Vec<u8>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            path: String::from("/"),
            method: Method::Get,
            content_check_mode: ContentCheckMode::NoCheck,
            keywords: Vec::new(),
            post_content_type: PostContentType::Text,
            user_agent: String::new(),
            post_content: Vec::new(),
        }
    }
}

struct ProbeState {
    status: MonitorStatus,
    last_hash: Option<[u8; 32]>,
    /// True while a request is in flight. At most one request per monitor.
    pending: bool,
    abort: Option<AbortHandle>,
}

/// A single probe target. Owned by exactly one host/scheme; drives at most
/// one in-flight HTTP exchange at a time and reports outcomes to the
/// aggregator.
pub struct Monitor {
    id: MonitorId,
    settings: Mutex<MonitorSettings>,
    state: Mutex<ProbeState>,
    host_scheme: Mutex<Weak<HostScheme>>,
}

impl Monitor {
    pub fn new(id: MonitorId, settings: MonitorSettings) -> Arc<Self> {
        Arc::new(Self {
            id,
            settings: Mutex::new(settings),
            state: Mutex::new(ProbeState {
                status: MonitorStatus::Unknown,
                last_hash: None,
                pending: false,
                abort: None,
            }),
            host_scheme: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn status(&self) -> MonitorStatus {
        self.state.lock().expect("monitor state mutex poisoned").status
    }

    pub fn host_scheme(&self) -> Option<Arc<HostScheme>> {
        self.host_scheme.lock().expect("monitor parent mutex poisoned").upgrade()
    }

    pub(crate) fn attach_host_scheme(&self, host_scheme: &Arc<HostScheme>) {
        *self.host_scheme.lock().expect("monitor parent mutex poisoned") =
            Arc::downgrade(host_scheme);
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings.lock().expect("monitor settings mutex poisoned").clone()
    }

    /// Replace the probe target attributes; the next check uses them.
    pub fn update_settings(&self, settings: MonitorSettings) {
        *self.settings.lock().expect("monitor settings mutex poisoned") = settings;
    }

    /// Replace the process-wide default probe headers.
    pub fn set_default_headers(headers: &HashMap<String, String>) {
        let mut table: Vec<(String, String)> =
            headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        table.sort();
        *DEFAULT_HEADERS.write().expect("default headers lock poisoned") = table;
    }

    pub fn default_headers() -> Vec<(String, String)> {
        DEFAULT_HEADERS.read().expect("default headers lock poisoned").clone()
    }

    /// Begin a probe exchange for this monitor.
    ///
    /// The call is a no-op when a request is already in flight, when the
    /// owning customer is paused, or when the host/scheme is unreachable —
    /// the timing wheel will revisit.
    pub fn start_check(self: &Arc<Self>) {
        let host_scheme = match self.host_scheme() {
            Some(host_scheme) => host_scheme,
            None => {
                // Orphaned monitor: drop the stored hash so a re-attach
                // starts from a fresh observation.
                self.state.lock().expect("monitor state mutex poisoned").last_hash = None;
                return;
            }
        };

        let customer = match host_scheme.customer() {
            Some(customer) => customer,
            None => return,
        };
        if customer.paused() {
            return;
        }

        let context = match host_scheme.probe_context() {
            Some(context) => context,
            None => return,
        };

        let request = self.build_request(&host_scheme);

        {
            let mut state = self.state.lock().expect("monitor state mutex poisoned");
            if state.pending {
                return;
            }
            state.pending = true;
        }

        let monitor = Arc::clone(self);
        let started_timestamp = unix_now();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let reply = context.driver.execute(request).await;
            let elapsed_nanoseconds = started.elapsed().as_nanos() as u64;
            monitor.complete_check(reply.outcome, reply.certificate_expiration, elapsed_nanoseconds, started_timestamp, &context.aggregator);
        });

        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        if state.pending {
            state.abort = Some(handle.abort_handle());
        }
    }

    /// Discard any in-flight request. No event is produced; the monitor
    /// returns to the UNKNOWN state.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        if let Some(abort) = state.abort.take() {
            abort.abort();
        }
        state.pending = false;
        state.status = MonitorStatus::Unknown;
    }

    fn build_request(&self, host_scheme: &Arc<HostScheme>) -> ProbeRequest {
        let settings = self.settings.lock().expect("monitor settings mutex poisoned");

        let mut url = host_scheme.url();
        url.set_path(&settings.path);

        let mut user_agent = DEFAULT_USER_AGENT.to_string();
        let mut headers = Vec::new();
        for (name, value) in Self::default_headers() {
            if name.eq_ignore_ascii_case("user-agent") {
                user_agent = value;
            } else {
                headers.push((name, value));
            }
        }

        if settings.method.has_body() {
            if !settings.user_agent.is_empty() {
                user_agent = settings.user_agent.clone();
            }
            ProbeRequest {
                url,
                method: settings.method,
                headers,
                user_agent,
                content_type: Some(settings.post_content_type.mime()),
                body: Some(settings.post_content.clone()),
            }
        } else {
            ProbeRequest {
                url,
                method: settings.method,
                headers,
                user_agent,
                content_type: None,
                body: None,
            }
        }
    }

    fn complete_check(
        self: &Arc<Self>,
        outcome: Result<Vec<u8>, String>,
        certificate_expiration: Option<u64>,
        elapsed_nanoseconds: u64,
        started_timestamp: u64,
        aggregator: &Arc<DataAggregator>,
    ) {
        let previous = {
            let mut state = self.state.lock().expect("monitor state mutex poisoned");
            state.pending = false;
            state.abort = None;
            state.status
        };

        match outcome {
            Ok(body) => self.process_valid_response(
                previous,
                &body,
                certificate_expiration,
                elapsed_nanoseconds,
                started_timestamp,
                aggregator,
            ),
            Err(error) => self.process_error_response(previous, error, aggregator),
        }
    }

    fn process_valid_response(
        self: &Arc<Self>,
        previous: MonitorStatus,
        body: &[u8],
        certificate_expiration: Option<u64>,
        elapsed_nanoseconds: u64,
        started_timestamp: u64,
        aggregator: &Arc<DataAggregator>,
    ) {
        let host_scheme = self.host_scheme();

        if previous != MonitorStatus::Working {
            if let Some(host_scheme) = &host_scheme {
                host_scheme.monitor_now_responsive(self);
            }
            aggregator.report_event(EventRecord {
                monitor_id: self.id,
                timestamp: unix_now(),
                event_type: EventType::Working,
                monitor_status: previous,
                hash: None,
                message: String::new(),
            });
        }
        self.state.lock().expect("monitor state mutex poisoned").status = MonitorStatus::Working;

        let mode = self.settings.lock().expect("monitor settings mutex poisoned").content_check_mode;
        match mode {
            ContentCheckMode::NoCheck => {}
            ContentCheckMode::ContentMatch => self.check_content_change(body, aggregator),
            ContentCheckMode::AnyKeywords => self.check_any_keyword_match(body, aggregator),
            ContentCheckMode::AllKeywords => self.check_all_keyword_match(body, aggregator),
            ContentCheckMode::SmartContentMatch => self.check_content_change_smart(body, aggregator),
        }

        let latency_supported = host_scheme
            .as_ref()
            .and_then(|host_scheme| host_scheme.customer())
            .map(|customer| customer.supports_latency_measurements())
            .unwrap_or(false);
        if latency_supported {
            let microseconds = (elapsed_nanoseconds + 500) / 1000;
            if microseconds <= MAXIMUM_ALLOWED_LATENCY_MICROSECONDS {
                aggregator.record_latency(self.id, started_timestamp, microseconds as u32);
            }
        }

        if let (Some(host_scheme), Some(expiration)) = (host_scheme, certificate_expiration) {
            if host_scheme.ssl_expiration_timestamp() != expiration {
                host_scheme.set_ssl_expiration_timestamp(expiration);
                aggregator.report_ssl_certificate_expiration_change(
                    self.id,
                    host_scheme.id(),
                    expiration,
                );
            }
        }
    }

    fn process_error_response(
        self: &Arc<Self>,
        previous: MonitorStatus,
        error: String,
        aggregator: &Arc<DataAggregator>,
    ) {
        if previous == MonitorStatus::Failed {
            return;
        }

        aggregator.report_event(EventRecord {
            monitor_id: self.id,
            timestamp: unix_now(),
            event_type: EventType::NoResponse,
            monitor_status: previous,
            hash: None,
            message: error,
        });

        self.state.lock().expect("monitor state mutex poisoned").status = MonitorStatus::Failed;

        if let Some(host_scheme) = self.host_scheme() {
            host_scheme.monitor_non_responsive(self);
        }
    }

    fn check_content_change(&self, body: &[u8], aggregator: &Arc<DataAggregator>) {
        let hash = content_hash(self.id, body);
        self.store_and_report_content_hash(hash, aggregator);
    }

    fn check_content_change_smart(&self, body: &[u8], aggregator: &Arc<DataAggregator>) {
        let hash = scrubber::scrub_and_hash(self.id, body);
        self.store_and_report_content_hash(hash, aggregator);
    }

    /// First observation stores the hash silently; later observations report
    /// a content change when the hash moved.
    fn store_and_report_content_hash(&self, hash: [u8; 32], aggregator: &Arc<DataAggregator>) {
        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        match state.last_hash {
            None => state.last_hash = Some(hash),
            Some(previous) if previous != hash => {
                state.last_hash = Some(hash);
                let status = state.status;
                drop(state);
                aggregator.report_event(EventRecord {
                    monitor_id: self.id,
                    timestamp: unix_now(),
                    event_type: EventType::ContentChanged,
                    monitor_status: status,
                    hash: Some(hash),
                    message: String::new(),
                });
            }
            Some(_) => {}
        }
    }

    fn check_any_keyword_match(&self, body: &[u8], aggregator: &Arc<DataAggregator>) {
        let keywords = self.settings.lock().expect("monitor settings mutex poisoned").keywords.clone();
        if keywords.is_empty() {
            return;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.id.to_le_bytes());
        hasher.update(body);

        let mut found = false;
        for keyword in &keywords {
            if contains(body, keyword) {
                hasher.update(keyword);
                found = true;
                break;
            }
        }

        let hash: [u8; 32] = hasher.finalize().into();

        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        let differs = state.last_hash != Some(hash);
        state.last_hash = Some(hash);
        let status = state.status;
        drop(state);

        if !found && differs {
            aggregator.report_event(EventRecord {
                monitor_id: self.id,
                timestamp: unix_now(),
                event_type: EventType::Keywords,
                monitor_status: status,
                hash: Some(hash),
                message: String::new(),
            });
        }
    }

    fn check_all_keyword_match(&self, body: &[u8], aggregator: &Arc<DataAggregator>) {
        let keywords = self.settings.lock().expect("monitor settings mutex poisoned").keywords.clone();
        if keywords.is_empty() {
            return;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.id.to_le_bytes());
        hasher.update(body);

        // Keywords found before the first missing one are folded into the
        // hash, so the hash tracks which prefix of the list was satisfied.
        let mut missing: Option<&[u8]> = None;
        for keyword in &keywords {
            if contains(body, keyword) {
                hasher.update(keyword);
            } else {
                missing = Some(keyword);
                break;
            }
        }

        let hash: [u8; 32] = hasher.finalize().into();

        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        let differs = state.last_hash != Some(hash);
        state.last_hash = Some(hash);
        let status = state.status;
        drop(state);

        if let Some(missing) = missing {
            if differs {
                aggregator.report_event(EventRecord {
                    monitor_id: self.id,
                    timestamp: unix_now(),
                    event_type: EventType::Keywords,
                    monitor_status: status,
                    hash: Some(hash),
                    message: format!("Missing keyword \"{}\"", String::from_utf8_lossy(missing)),
                });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> bool {
        self.state.lock().expect("monitor state mutex poisoned").pending
    }
}

/// Content hash, domain-separated by the monitor id so identical bodies on
/// different monitors never collide.
pub fn content_hash(monitor_id: MonitorId, body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(monitor_id.to_le_bytes());
    hasher.update(body);
    hasher.finalize().into()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
