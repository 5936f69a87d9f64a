/// Probe engine module - the customer/host-scheme/monitor ownership tree
///
/// This module is responsible for:
/// - Driving individual HTTP probe exchanges and classifying outcomes
/// - Content-integrity checks (hash and keyword policies)
/// - Grouping monitors by origin with suspect-set amplification
/// - Carrying per-customer subscription flags and the paused state
pub mod customer;
pub mod host_scheme;
pub mod monitor;
pub mod probe;
pub mod types;


pub use customer::Customer;
pub use host_scheme::HostScheme;
pub use monitor::Monitor;
pub use types::{CustomerId, HostSchemeId, MonitorId, MonitorStatus};
