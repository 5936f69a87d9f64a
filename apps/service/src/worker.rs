use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::aggregator::DataAggregator;
use crate::monitoring::customer::Customer;
use crate::monitoring::host_scheme::{HostScheme, ProbeContext};
use crate::monitoring::monitor::Monitor;
use crate::monitoring::probe::ProbeDriver;
use crate::monitoring::types::{CustomerId, HostSchemeId, MonitorId};
use crate::scheduler::{HostSchemeTimer, LoadingData};

struct RegionData {
    region_index: u32,
    number_regions: u32,
}

/// One polling worker: a shared probe driver, the customers placed here,
/// and a timing wheel per signed polling interval (negative keys are
/// single-region wheels, positive keys multi-region).
///
/// A customer's whole subtree lives on the worker that received it; timing
/// wheels and probe tasks carry the work, and cross-thread requests arrive
/// as spawned messages rather than direct calls.
pub struct HttpWorker {
    driver: Arc<dyn ProbeDriver>,
    aggregator: Arc<DataAggregator>,
    customers: Mutex<HashMap<CustomerId, Arc<Customer>>>,
    timers: Mutex<BTreeMap<i64, Arc<HostSchemeTimer>>>,
    monitors: Mutex<HashMap<MonitorId, Arc<Monitor>>>,
    region: Mutex<RegionData>,
    active: AtomicBool,
    host_schemes_per_second: Mutex<f64>,
}

impl HttpWorker {
    pub fn new(driver: Arc<dyn ProbeDriver>, aggregator: Arc<DataAggregator>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            aggregator,
            customers: Mutex::new(HashMap::new()),
            timers: Mutex::new(BTreeMap::new()),
            monitors: Mutex::new(HashMap::new()),
            region: Mutex::new(RegionData { region_index: 0, number_regions: 0 }),
            active: AtomicBool::new(false),
            host_schemes_per_second: Mutex::new(0.0),
        })
    }

    /// Service metric used for least-loaded placement, in host/schemes
    /// serviced per second.
    pub fn host_schemes_per_second(&self) -> f64 {
        *self.host_schemes_per_second.lock().expect("service metric mutex poisoned")
    }

    /// Loading snapshots of every wheel, keyed by signed polling interval.
    pub fn loading_data(&self) -> Vec<(i64, LoadingData)> {
        let timers = self.timers.lock().expect("worker timer mutex poisoned");
        timers.iter().map(|(key, timer)| (*key, timer.loading_data())).collect()
    }

    /// Move a customer subtree onto this worker.
    pub fn add_customer(self: &Arc<Self>, customer: &Arc<Customer>) {
        customer.attach_worker(self);
        self.customers
            .lock()
            .expect("worker customer mutex poisoned")
            .insert(customer.id(), Arc::clone(customer));

        customer.report_existing_host_schemes_and_monitors(self, true);
    }

    /// Remove a customer if this worker owns it.
    pub fn remove_customer(self: &Arc<Self>, customer_id: CustomerId) -> bool {
        let removed =
            self.customers.lock().expect("worker customer mutex poisoned").remove(&customer_id);

        match removed {
            Some(customer) => {
                customer.report_existing_host_schemes_and_monitors(self, false);
                customer.abort_all_monitors();
                customer.detach_worker();
                true
            }
            None => false,
        }
    }

    pub fn get_customer(&self, customer_id: CustomerId) -> Option<Arc<Customer>> {
        self.customers.lock().expect("worker customer mutex poisoned").get(&customer_id).cloned()
    }

    pub fn get_host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<Arc<HostScheme>> {
        let timers: Vec<Arc<HostSchemeTimer>> = {
            let timers = self.timers.lock().expect("worker timer mutex poisoned");
            timers.values().cloned().collect()
        };

        timers.iter().find_map(|timer| timer.get_host_scheme(host_scheme_id))
    }

    pub fn get_monitor(&self, monitor_id: MonitorId) -> Option<Arc<Monitor>> {
        self.monitors.lock().expect("worker monitor mutex poisoned").get(&monitor_id).cloned()
    }

    /// Dispatch one immediate `service_next_monitor` for the host/scheme.
    /// Safe to call from any thread; the dispatch hops onto a task.
    pub fn check_now(&self, host_scheme: Weak<HostScheme>) {
        tokio::spawn(async move {
            if let Some(host_scheme) = host_scheme.upgrade() {
                host_scheme.service_next_monitor();
            }
        });
    }

    /// Apply new region membership to every wheel. The worker goes active.
    pub fn update_region_data(&self, region_index: u32, number_regions: u32) {
        {
            let mut region = self.region.lock().expect("worker region mutex poisoned");
            region.region_index = region_index;
            region.number_regions = number_regions;
        }
        self.active.store(true, Ordering::Relaxed);

        for timer in self.timers() {
            timer.update_region_data(region_index, number_regions);
        }
        self.update_service_metrics();
    }

    pub fn go_active(&self) {
        self.active.store(true, Ordering::Relaxed);
        for timer in self.timers() {
            timer.go_active();
        }
    }

    pub fn go_inactive(&self) {
        self.active.store(false, Ordering::Relaxed);
        for timer in self.timers() {
            timer.go_inactive();
        }
    }

    /// Find or create the wheel for the owning customer's interval and
    /// attach the host/scheme. Called by the customer as its subtree lands
    /// on this worker.
    pub(crate) fn host_scheme_added(
        self: &Arc<Self>,
        customer: &Arc<Customer>,
        host_scheme: &Arc<HostScheme>,
    ) {
        let polling_interval = customer.polling_interval();
        let multi_region = customer.supports_multi_region_testing();
        let signed_interval = signed_interval(multi_region, polling_interval);

        let timer = {
            let mut timers = self.timers.lock().expect("worker timer mutex poisoned");
            Arc::clone(timers.entry(signed_interval).or_insert_with(|| {
                let region = self.region.lock().expect("worker region mutex poisoned");
                HostSchemeTimer::spawn(
                    multi_region,
                    polling_interval,
                    region.region_index,
                    region.number_regions,
                    self.active.load(Ordering::Relaxed),
                )
            }))
        };

        host_scheme.set_probe_context(Some(ProbeContext {
            driver: Arc::clone(&self.driver),
            aggregator: Arc::clone(&self.aggregator),
        }));
        timer.add_host_scheme(host_scheme);

        self.update_service_metrics();
    }

    /// Detach a host/scheme from its wheel. Empty wheels are kept; idling
    /// is cheap and the customer may come straight back.
    pub(crate) fn host_scheme_about_to_be_removed(
        &self,
        customer: &Arc<Customer>,
        host_scheme: &Arc<HostScheme>,
    ) {
        let signed_interval =
            signed_interval(customer.supports_multi_region_testing(), customer.polling_interval());

        let timer = {
            let timers = self.timers.lock().expect("worker timer mutex poisoned");
            timers.get(&signed_interval).cloned()
        };
        if let Some(timer) = timer {
            timer.remove_host_scheme(host_scheme.id());
        }

        host_scheme.set_probe_context(None);
        self.update_service_metrics();
    }

    pub(crate) fn monitor_added(&self, monitor: &Arc<Monitor>) {
        self.monitors
            .lock()
            .expect("worker monitor mutex poisoned")
            .insert(monitor.id(), Arc::clone(monitor));
    }

    pub(crate) fn monitor_about_to_be_removed(&self, monitor: &Arc<Monitor>) {
        self.monitors.lock().expect("worker monitor mutex poisoned").remove(&monitor.id());
    }

    fn timers(&self) -> Vec<Arc<HostSchemeTimer>> {
        self.timers.lock().expect("worker timer mutex poisoned").values().cloned().collect()
    }

    fn update_service_metrics(&self) {
        let rate: f64 = self.timers().iter().map(|timer| timer.monitors_per_second()).sum();
        *self.host_schemes_per_second.lock().expect("service metric mutex poisoned") = rate;
    }
}

fn signed_interval(multi_region: bool, polling_interval: u32) -> i64 {
    if multi_region {
        polling_interval as i64
    } else {
        -(polling_interval as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::monitor::MonitorSettings;
    use crate::monitoring::probe::{ProbeDriver, ProbeReply, ProbeRequest};
    use crate::outbound::ControllerTransport;
    use async_trait::async_trait;
    use url::Url;

    struct NullDriver;

    #[async_trait]
    impl ProbeDriver for NullDriver {
        async fn execute(&self, _request: ProbeRequest) -> ProbeReply {
            ProbeReply { outcome: Ok(Vec::new()), certificate_expiration: None }
        }
    }

    struct NullTransport;

    #[async_trait]
    impl ControllerTransport for NullTransport {
        async fn post_binary(
            &self,
            _path: &str,
            _body: Vec<u8>,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({"status": "OK"}))
        }

        async fn post_json(
            &self,
            _path: &str,
            _body: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({"status": "OK"}))
        }
    }

    fn test_worker() -> Arc<HttpWorker> {
        let aggregator = DataAggregator::new(Arc::new(NullTransport));
        HttpWorker::new(Arc::new(NullDriver), aggregator)
    }

    fn customer_with_tree(
        customer_id: CustomerId,
        multi_region: bool,
        interval: u32,
    ) -> Arc<Customer> {
        let customer = Customer::new(customer_id, false, false, false, multi_region, interval);
        let host_scheme = HostScheme::new(
            customer_id * 100,
            Url::parse("http://example.com/").expect("static url"),
        );
        customer.add_host_scheme(Arc::clone(&host_scheme));
        host_scheme.add_monitor(Monitor::new(customer_id * 1000, MonitorSettings::default()));
        customer
    }

    #[tokio::test]
    async fn placement_builds_wheels_keyed_by_signed_interval() {
        let worker = test_worker();
        worker.update_region_data(0, 1);

        worker.add_customer(&customer_with_tree(1, false, 30));
        worker.add_customer(&customer_with_tree(2, true, 30));
        worker.add_customer(&customer_with_tree(3, false, 60));

        let keys: Vec<i64> = {
            let timers = worker.timers.lock().expect("worker timer mutex poisoned");
            timers.keys().copied().collect()
        };
        assert_eq!(keys, vec![-60, -30, 30]);

        // 1/30 + 1/60 single-region plus 1/30 multi-region.
        let rate = worker.host_schemes_per_second();
        assert!((rate - (1.0 / 30.0 + 1.0 / 60.0 + 1.0 / 30.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn removal_detaches_subtree_and_keeps_empty_wheels() {
        let worker = test_worker();
        worker.update_region_data(0, 1);
        worker.add_customer(&customer_with_tree(4, false, 20));

        assert!(worker.get_host_scheme(400).is_some());
        assert!(worker.get_monitor(4000).is_some());

        assert!(worker.remove_customer(4));
        assert!(!worker.remove_customer(4));

        assert!(worker.get_host_scheme(400).is_none());
        assert!(worker.get_monitor(4000).is_none());
        assert_eq!(
            worker.timers.lock().expect("worker timer mutex poisoned").len(),
            1,
            "empty wheels are kept"
        );
        assert!(worker.host_schemes_per_second().abs() < 1e-9);
    }

    #[tokio::test]
    async fn multi_region_wheel_rate_scales_with_region_count() {
        let worker = test_worker();
        worker.update_region_data(0, 2);
        worker.add_customer(&customer_with_tree(6, true, 30));

        // One host/scheme over a 60 s effective period.
        let rate = worker.host_schemes_per_second();
        assert!((rate - 1.0 / 60.0).abs() < 1e-9);
    }
}
