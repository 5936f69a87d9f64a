use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::worker::HttpWorker;

use super::host_scheme::HostScheme;
use super::monitor::Monitor;
use super::types::{CustomerId, HostSchemeId, MonitorId};

/// Smallest polling interval the control API accepts, in seconds.
pub const MINIMUM_POLLING_INTERVAL: u32 = 20;

/// One subscriber: capability flags, polling interval, and the owned
/// host/scheme subtree. The flattened monitor map gives O(1) monitor lookup
/// across the subtree.
pub struct Customer {
    id: CustomerId,
    supports_ping_testing: bool,
    supports_ssl_expiration_checking: bool,
    supports_latency_measurements: bool,
    supports_multi_region_testing: bool,
    polling_interval: u32,
    /// Suppresses probe emission but not schedule ticking.
    paused: AtomicBool,
    worker: Mutex<Weak<HttpWorker>>,
    host_schemes: Mutex<HashMap<HostSchemeId, Arc<HostScheme>>>,
    monitors: Mutex<HashMap<MonitorId, Arc<Monitor>>>,
}

impl Customer {
    pub fn new(
        id: CustomerId,
        supports_ping_testing: bool,
        supports_ssl_expiration_checking: bool,
        supports_latency_measurements: bool,
        supports_multi_region_testing: bool,
        polling_interval: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            supports_ping_testing,
            supports_ssl_expiration_checking,
            supports_latency_measurements,
            supports_multi_region_testing,
            polling_interval,
            paused: AtomicBool::new(false),
            worker: Mutex::new(Weak::new()),
            host_schemes: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> CustomerId {
        self.id
    }

    pub fn supports_ping_testing(&self) -> bool {
        self.supports_ping_testing
    }

    pub fn supports_ssl_expiration_checking(&self) -> bool {
        self.supports_ssl_expiration_checking
    }

    pub fn supports_latency_measurements(&self) -> bool {
        self.supports_latency_measurements
    }

    pub fn supports_multi_region_testing(&self) -> bool {
        self.supports_multi_region_testing
    }

    pub fn polling_interval(&self) -> u32 {
        self.polling_interval
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub(crate) fn worker(&self) -> Option<Arc<HttpWorker>> {
        self.worker.lock().expect("customer worker mutex poisoned").upgrade()
    }

    pub(crate) fn attach_worker(&self, worker: &Arc<HttpWorker>) {
        *self.worker.lock().expect("customer worker mutex poisoned") = Arc::downgrade(worker);
    }

    pub(crate) fn detach_worker(&self) {
        *self.worker.lock().expect("customer worker mutex poisoned") = Weak::new();
    }

    /// Attach a host/scheme subtree to this customer, forwarding the
    /// structure change to the owning worker when one is attached.
    pub fn add_host_scheme(self: &Arc<Self>, host_scheme: Arc<HostScheme>) {
        host_scheme.attach_customer(self);

        self.host_schemes
            .lock()
            .expect("customer host scheme mutex poisoned")
            .insert(host_scheme.id(), Arc::clone(&host_scheme));

        if let Some(worker) = self.worker() {
            worker.host_scheme_added(self, &host_scheme);
        }

        host_scheme.report_existing_monitors(self, true);
    }

    pub fn remove_host_scheme(self: &Arc<Self>, host_scheme_id: HostSchemeId) -> bool {
        let removed = self
            .host_schemes
            .lock()
            .expect("customer host scheme mutex poisoned")
            .remove(&host_scheme_id);

        match removed {
            Some(host_scheme) => {
                host_scheme.report_existing_monitors(self, false);
                if let Some(worker) = self.worker() {
                    worker.host_scheme_about_to_be_removed(self, &host_scheme);
                }
                host_scheme.abort_all_monitors();
                true
            }
            None => false,
        }
    }

    pub fn get_host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<Arc<HostScheme>> {
        self.host_schemes
            .lock()
            .expect("customer host scheme mutex poisoned")
            .get(&host_scheme_id)
            .cloned()
    }

    pub fn host_schemes(&self) -> Vec<Arc<HostScheme>> {
        self.host_schemes
            .lock()
            .expect("customer host scheme mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_monitor(&self, monitor_id: MonitorId) -> Option<Arc<Monitor>> {
        self.monitors.lock().expect("customer monitor mutex poisoned").get(&monitor_id).cloned()
    }

    pub fn number_host_schemes(&self) -> usize {
        self.host_schemes.lock().expect("customer host scheme mutex poisoned").len()
    }

    pub fn number_monitors(&self) -> usize {
        self.monitors.lock().expect("customer monitor mutex poisoned").len()
    }

    /// Maintain the flattened monitor view; called by host/schemes as
    /// monitors come and go.
    pub(crate) fn monitor_added(&self, monitor: &Arc<Monitor>) {
        self.monitors
            .lock()
            .expect("customer monitor mutex poisoned")
            .insert(monitor.id(), Arc::clone(monitor));

        if let Some(worker) = self.worker() {
            worker.monitor_added(monitor);
        }
    }

    pub(crate) fn monitor_about_to_be_removed(&self, monitor: &Arc<Monitor>) {
        self.monitors.lock().expect("customer monitor mutex poisoned").remove(&monitor.id());

        if let Some(worker) = self.worker() {
            worker.monitor_about_to_be_removed(monitor);
        }
    }

    /// Replay the whole subtree into (or out of) a worker's indexes and
    /// timing wheels when the customer is placed or removed.
    pub(crate) fn report_existing_host_schemes_and_monitors(
        self: &Arc<Self>,
        worker: &Arc<HttpWorker>,
        adding: bool,
    ) {
        for host_scheme in self.host_schemes() {
            if adding {
                worker.host_scheme_added(self, &host_scheme);
            } else {
                worker.host_scheme_about_to_be_removed(self, &host_scheme);
            }
        }

        let monitors: Vec<Arc<Monitor>> = self
            .monitors
            .lock()
            .expect("customer monitor mutex poisoned")
            .values()
            .cloned()
            .collect();
        for monitor in &monitors {
            if adding {
                worker.monitor_added(monitor);
            } else {
                worker.monitor_about_to_be_removed(monitor);
            }
        }
    }

    pub fn abort_all_monitors(&self) {
        let monitors: Vec<Arc<Monitor>> = self
            .monitors
            .lock()
            .expect("customer monitor mutex poisoned")
            .values()
            .cloned()
            .collect();
        for monitor in monitors {
            monitor.abort();
        }
    }
}
