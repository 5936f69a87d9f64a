use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use tracing::info;

use crate::aggregator::DataAggregator;
use crate::monitoring::customer::Customer;
use crate::monitoring::host_scheme::HostScheme;
use crate::monitoring::monitor::Monitor;
use crate::monitoring::probe::HttpProbeDriver;
use crate::monitoring::types::{CustomerId, HostSchemeId, MonitorId};
use crate::ping::PingClient;
use crate::scheduler::LoadingData;
use crate::worker::HttpWorker;

/// Coarse server state reported in every latency header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    AllUnknown,
    Active,
    Inactive,
    Defunct,
}

impl ServerStatus {
    /// Wire code used in the latency report header.
    pub fn code(self) -> u8 {
        match self {
            ServerStatus::AllUnknown => 0,
            ServerStatus::Active => 1,
            ServerStatus::Inactive => 2,
            ServerStatus::Defunct => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::AllUnknown => "ALL_UNKNOWN",
            ServerStatus::Active => "ACTIVE",
            ServerStatus::Inactive => "INACTIVE",
            ServerStatus::Defunct => "DEFUNCT",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level supervisor: owns the HTTP workers and the ping client, places
/// customers on the least-loaded worker, and fans lifecycle commands out.
pub struct ServiceTracker {
    workers: Vec<Arc<HttpWorker>>,
    ping: Arc<PingClient>,
    aggregator: Arc<DataAggregator>,
    status: Mutex<ServerStatus>,
}

impl ServiceTracker {
    /// Build the tracker with `maximum_number_workers` HTTP workers; zero
    /// means one per logical core.
    pub fn new(aggregator: Arc<DataAggregator>, maximum_number_workers: usize) -> Result<Arc<Self>> {
        let worker_count = if maximum_number_workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            maximum_number_workers
        }
        .max(1);

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let driver = Arc::new(HttpProbeDriver::new()?);
            workers.push(HttpWorker::new(driver, Arc::clone(&aggregator)));
        }

        Ok(Arc::new(Self {
            workers,
            ping: PingClient::new(),
            aggregator,
            status: Mutex::new(ServerStatus::Inactive),
        }))
    }

    pub fn connect_to_pinger(&self, socket_path: &str) {
        self.ping.connect(socket_path);
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock().expect("server status mutex poisoned")
    }

    /// Aggregate service rate across all workers.
    pub fn monitors_per_second(&self) -> f64 {
        self.workers.iter().map(|worker| worker.host_schemes_per_second()).sum()
    }

    /// Loading snapshots of every wheel on every worker, keyed by signed
    /// polling interval.
    pub fn loading_data(&self) -> Vec<(i64, LoadingData)> {
        self.workers.iter().flat_map(|worker| worker.loading_data()).collect()
    }

    /// Place a customer on the worker with the lowest current service rate
    /// and register its hosts with the pinger when ping testing is enabled.
    pub fn add_customer(&self, customer: Arc<Customer>) {
        let mut best = &self.workers[0];
        let mut best_rate = best.host_schemes_per_second();
        for worker in &self.workers[1..] {
            let rate = worker.host_schemes_per_second();
            if rate < best_rate {
                best = worker;
                best_rate = rate;
            }
        }

        best.add_customer(&customer);

        if customer.supports_ping_testing() {
            for host_scheme in customer.host_schemes() {
                self.ping.add_host(
                    customer.id(),
                    host_scheme.id(),
                    host_scheme.host(),
                    Arc::downgrade(&host_scheme),
                    Arc::downgrade(best),
                );
            }
        }

        info!(
            "Added customer {}, ping: {}, ssl: {}, latency: {}, multi-region: {}, polling-interval: {} sec, paused: {}, hosts: {}, monitors: {}",
            customer.id(),
            customer.supports_ping_testing(),
            customer.supports_ssl_expiration_checking(),
            customer.supports_latency_measurements(),
            customer.supports_multi_region_testing(),
            customer.polling_interval(),
            customer.paused(),
            customer.number_host_schemes(),
            customer.number_monitors()
        );
    }

    /// Remove a customer; the first worker that claims the id wins.
    pub fn remove_customer(&self, customer_id: CustomerId) -> bool {
        let mut success = false;
        for worker in &self.workers {
            if worker.remove_customer(customer_id) {
                success = true;
                break;
            }
        }

        self.ping.remove_customer(customer_id);

        if success {
            info!("Removed customer {}", customer_id);
        }
        success
    }

    pub fn get_customer(&self, customer_id: CustomerId) -> Option<Arc<Customer>> {
        self.workers.iter().find_map(|worker| worker.get_customer(customer_id))
    }

    pub fn get_host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<Arc<HostScheme>> {
        self.workers.iter().find_map(|worker| worker.get_host_scheme(host_scheme_id))
    }

    pub fn get_monitor(&self, monitor_id: MonitorId) -> Option<Arc<Monitor>> {
        self.workers.iter().find_map(|worker| worker.get_monitor(monitor_id))
    }

    pub fn paused(&self, customer_id: CustomerId) -> bool {
        self.get_customer(customer_id).map(|customer| customer.paused()).unwrap_or(false)
    }

    pub fn set_paused(&self, customer_id: CustomerId, paused: bool) {
        if let Some(customer) = self.get_customer(customer_id) {
            customer.set_paused(paused);
        }
    }

    /// Apply new region membership. The server goes active and the
    /// controller sees the transition in the next report header.
    pub fn update_region_data(&self, region_index: u32, number_regions: u32) {
        for worker in &self.workers {
            worker.update_region_data(region_index, number_regions);
        }
        self.ping.go_active();

        info!("Changing region to {} / {}", region_index, number_regions);
        self.transition(ServerStatus::Active);
    }

    pub fn go_active(&self) {
        for worker in &self.workers {
            worker.go_active();
        }
        self.ping.go_active();
        self.transition(ServerStatus::Active);
    }

    pub fn go_inactive(&self) {
        for worker in &self.workers {
            worker.go_inactive();
        }
        self.ping.go_inactive();
        self.transition(ServerStatus::Inactive);
    }

    /// Record a status change and force a report so the controller sees the
    /// new status immediately.
    fn transition(&self, status: ServerStatus) {
        {
            let mut current = self.status.lock().expect("server status mutex poisoned");
            if *current != status {
                info!("Server status {} -> {}", *current, status);
            }
            *current = status;
        }

        self.aggregator.send_report();
    }

    #[cfg(test)]
    pub(crate) fn workers(&self) -> &[Arc<HttpWorker>] {
        &self.workers
    }
}
