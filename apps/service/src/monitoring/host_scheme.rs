use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use url::Url;

use crate::aggregator::DataAggregator;

use super::customer::Customer;
use super::monitor::Monitor;
use super::probe::ProbeDriver;
use super::types::{HostSchemeId, MonitorId};

/// Shared handles a monitor needs to issue a probe, installed by the worker
/// when the host/scheme is placed.
pub struct ProbeContext {
    pub driver: Arc<dyn ProbeDriver>,
    pub aggregator: Arc<DataAggregator>,
}

impl Clone for ProbeContext {
    fn clone(&self) -> Self {
        Self { driver: Arc::clone(&self.driver), aggregator: Arc::clone(&self.aggregator) }
    }
}

/// Monitor containers plus the round-robin cursors. The cursors store the
/// last-fired key; removal therefore needs no iterator surgery.
struct MonitorTable {
    monitors: BTreeMap<MonitorId, Arc<Monitor>>,
    suspects: BTreeMap<MonitorId, Arc<Monitor>>,
    cursor: Option<MonitorId>,
    suspect_cursor: Option<MonitorId>,
}

/// A scheme+host+port origin grouping the monitors that share it. Fires one
/// monitor per timer tick, plus one suspect when any monitor is currently
/// non-responsive.
pub struct HostScheme {
    id: HostSchemeId,
    url: Mutex<Url>,
    /// Peer certificate `not_after`, Unix seconds. Zero means unknown.
    ssl_expiration: AtomicU64,
    customer: Mutex<Weak<Customer>>,
    table: Mutex<MonitorTable>,
    probe_context: Mutex<Option<ProbeContext>>,
}

impl HostScheme {
    pub fn new(id: HostSchemeId, url: Url) -> Arc<Self> {
        Arc::new(Self {
            id,
            url: Mutex::new(url),
            ssl_expiration: AtomicU64::new(0),
            customer: Mutex::new(Weak::new()),
            table: Mutex::new(MonitorTable {
                monitors: BTreeMap::new(),
                suspects: BTreeMap::new(),
                cursor: None,
                suspect_cursor: None,
            }),
            probe_context: Mutex::new(None),
        })
    }

    pub fn id(&self) -> HostSchemeId {
        self.id
    }

    pub fn url(&self) -> Url {
        self.url.lock().expect("host scheme url mutex poisoned").clone()
    }

    pub fn host(&self) -> String {
        self.url().host_str().unwrap_or_default().to_string()
    }

    pub fn ssl_expiration_timestamp(&self) -> u64 {
        self.ssl_expiration.load(Ordering::Relaxed)
    }

    pub fn set_ssl_expiration_timestamp(&self, timestamp: u64) {
        self.ssl_expiration.store(timestamp, Ordering::Relaxed);
    }

    pub fn customer(&self) -> Option<Arc<Customer>> {
        self.customer.lock().expect("host scheme parent mutex poisoned").upgrade()
    }

    pub(crate) fn attach_customer(&self, customer: &Arc<Customer>) {
        *self.customer.lock().expect("host scheme parent mutex poisoned") =
            Arc::downgrade(customer);
    }

    pub fn probe_context(&self) -> Option<ProbeContext> {
        self.probe_context.lock().expect("probe context mutex poisoned").clone()
    }

    pub fn set_probe_context(&self, context: Option<ProbeContext>) {
        *self.probe_context.lock().expect("probe context mutex poisoned") = context;
    }

    /// Attach a monitor to this host/scheme. The monitor starts out in the
    /// suspect set: its state is unknown until the first probe answers.
    pub fn add_monitor(self: &Arc<Self>, monitor: Arc<Monitor>) {
        monitor.attach_host_scheme(self);

        {
            let mut table = self.table.lock().expect("monitor table mutex poisoned");
            table.monitors.insert(monitor.id(), Arc::clone(&monitor));
            table.suspects.insert(monitor.id(), Arc::clone(&monitor));
        }

        if let Some(customer) = self.customer() {
            customer.monitor_added(&monitor);
        }
    }

    pub fn remove_monitor(&self, monitor_id: MonitorId) -> bool {
        let removed = {
            let mut table = self.table.lock().expect("monitor table mutex poisoned");
            let removed = table.monitors.remove(&monitor_id);
            table.suspects.remove(&monitor_id);
            removed
        };

        match removed {
            Some(monitor) => {
                monitor.abort();
                if let Some(customer) = self.customer() {
                    customer.monitor_about_to_be_removed(&monitor);
                }
                true
            }
            None => false,
        }
    }

    pub fn get_monitor(&self, monitor_id: MonitorId) -> Option<Arc<Monitor>> {
        self.table.lock().expect("monitor table mutex poisoned").monitors.get(&monitor_id).cloned()
    }

    pub fn monitors(&self) -> Vec<Arc<Monitor>> {
        self.table.lock().expect("monitor table mutex poisoned").monitors.values().cloned().collect()
    }

    /// One timer tick: advance the round-robin cursor and probe that
    /// monitor; when any monitor is suspect, also probe the next suspect so
    /// unhealthy monitors are swept at up to twice the base rate.
    ///
    /// The table lock is released before calling into any monitor.
    pub fn service_next_monitor(&self) {
        let (next, suspect) = {
            let mut table = self.table.lock().expect("monitor table mutex poisoned");
            if table.monitors.is_empty() {
                return;
            }

            let MonitorTable { monitors, suspects, cursor, suspect_cursor } = &mut *table;
            let next = advance_cursor(monitors, cursor);
            let suspect =
                if suspects.is_empty() { None } else { advance_cursor(suspects, suspect_cursor) };
            (next, suspect)
        };

        if let Some(next) = &next {
            next.start_check();
        }
        if let (Some(next), Some(suspect)) = (&next, &suspect) {
            if !Arc::ptr_eq(next, suspect) {
                suspect.start_check();
            }
        }
    }

    /// Mark a monitor as non-responsive; it joins the suspect rotation.
    pub fn monitor_non_responsive(&self, monitor: &Arc<Monitor>) {
        let mut table = self.table.lock().expect("monitor table mutex poisoned");
        table.suspects.insert(monitor.id(), Arc::clone(monitor));
    }

    /// A previously suspect monitor answered. Remove it from the rotation
    /// and immediately probe one remaining suspect so the set drains fast.
    pub fn monitor_now_responsive(&self, monitor: &Arc<Monitor>) {
        let kick = {
            let mut table = self.table.lock().expect("monitor table mutex poisoned");
            table.suspects.remove(&monitor.id());
            let MonitorTable { suspects, suspect_cursor, .. } = &mut *table;
            if suspects.is_empty() {
                None
            } else {
                advance_cursor(suspects, suspect_cursor)
            }
        };

        if let Some(kick) = kick {
            kick.start_check();
        }
    }

    /// Replay every owned monitor into (or out of) the customer's flattened
    /// view, used when the subtree is attached to or detached from a worker.
    pub(crate) fn report_existing_monitors(&self, customer: &Arc<Customer>, adding: bool) {
        let monitors = self.monitors();
        for monitor in &monitors {
            if adding {
                customer.monitor_added(monitor);
            } else {
                customer.monitor_about_to_be_removed(monitor);
            }
        }
    }

    pub fn abort_all_monitors(&self) {
        for monitor in self.monitors() {
            monitor.abort();
        }
    }
}

/// Pick the first key strictly after the cursor, wrapping to the smallest
/// key, and park the cursor on the picked entry.
fn advance_cursor(
    map: &BTreeMap<MonitorId, Arc<Monitor>>,
    cursor: &mut Option<MonitorId>,
) -> Option<Arc<Monitor>> {
    let next = match *cursor {
        Some(last) => map.range((Bound::Excluded(last), Bound::Unbounded)).next(),
        None => None,
    }
    .or_else(|| map.iter().next());

    next.map(|(id, monitor)| {
        *cursor = Some(*id);
        Arc::clone(monitor)
    })
}
