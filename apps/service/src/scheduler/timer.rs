use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::info;

use crate::monitoring::host_scheme::HostScheme;
use crate::monitoring::types::HostSchemeId;

use super::bits::bit_reverse32;
use super::loading::LoadingData;

/// How often the missed-timing-mark counters roll into a loading snapshot.
const MISSED_TIMING_MARK_RESET_INTERVAL_MS: u64 = 2 * 60 * 60 * 1000;

enum WheelCommand {
    /// Reset counters and restart the timing cycle.
    Start,
    /// Stop firing; membership is kept.
    Stop,
    /// Start only when the wheel is currently idle.
    Kick,
}

struct WheelTiming {
    number_regions: u32,
    period_ms: u64,
    region_offset_ms: u64,
    /// Set when region data changed under an armed timer; the next fire
    /// restarts the cycle instead of dispatching.
    force_resync: bool,
}

struct WheelShared {
    /// Host/schemes keyed by bit-reversed id. Weak: the wheel never keeps a
    /// host/scheme alive.
    host_schemes: Mutex<BTreeMap<u32, Weak<HostScheme>>>,
    timing: Mutex<WheelTiming>,
    loading: Mutex<LoadingData>,
}

/// Per-(interval, region-mode) timing wheel.
///
/// Each member's phase within the effective period is its bit-reversed id
/// scaled to milliseconds, so controller-adjacent ids land maximally far
/// apart on the timeline. Cooperating regions at the same interval shift the
/// whole cycle by `period / number_regions`, giving uniform inter-region
/// sample spacing.
pub struct HostSchemeTimer {
    multi_region: bool,
    aggregate_period_seconds: u32,
    shared: Arc<WheelShared>,
    commands: mpsc::UnboundedSender<WheelCommand>,
}

impl HostSchemeTimer {
    pub fn spawn(
        multi_region: bool,
        period_seconds: u32,
        region_index: u32,
        number_regions: u32,
        start_active: bool,
    ) -> Arc<Self> {
        let period_ms = effective_period_ms(multi_region, period_seconds, number_regions);
        let shared = Arc::new(WheelShared {
            host_schemes: Mutex::new(BTreeMap::new()),
            timing: Mutex::new(WheelTiming {
                number_regions,
                period_ms,
                region_offset_ms: region_offset_ms(period_ms, region_index, number_regions),
                force_resync: false,
            }),
            loading: Mutex::new(LoadingData::default()),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drive_wheel(Arc::clone(&shared), receiver, start_active));

        Arc::new(Self { multi_region, aggregate_period_seconds: period_seconds, shared, commands })
    }

    /// Service rate contributed by this wheel, in host/schemes per second.
    pub fn monitors_per_second(&self) -> f64 {
        let period_ms = self.shared.timing.lock().expect("wheel timing mutex poisoned").period_ms;
        if period_ms == 0 {
            return 0.0;
        }
        let members =
            self.shared.host_schemes.lock().expect("wheel member mutex poisoned").len() as f64;
        1000.0 * members / period_ms as f64
    }

    pub fn loading_data(&self) -> LoadingData {
        *self.shared.loading.lock().expect("wheel loading mutex poisoned")
    }

    pub fn add_host_scheme(&self, host_scheme: &Arc<HostScheme>) {
        self.shared
            .host_schemes
            .lock()
            .expect("wheel member mutex poisoned")
            .insert(bit_reverse32(host_scheme.id()), Arc::downgrade(host_scheme));

        let _ = self.commands.send(WheelCommand::Kick);
    }

    pub fn remove_host_scheme(&self, host_scheme_id: HostSchemeId) -> bool {
        self.shared
            .host_schemes
            .lock()
            .expect("wheel member mutex poisoned")
            .remove(&bit_reverse32(host_scheme_id))
            .is_some()
    }

    pub fn get_host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<Arc<HostScheme>> {
        self.shared
            .host_schemes
            .lock()
            .expect("wheel member mutex poisoned")
            .get(&bit_reverse32(host_scheme_id))
            .and_then(Weak::upgrade)
    }

    /// Apply a new region membership. The effective period and offset are
    /// recomputed and an armed timer is resynchronized.
    pub fn update_region_data(&self, region_index: u32, number_regions: u32) {
        let work_available = {
            let mut timing = self.shared.timing.lock().expect("wheel timing mutex poisoned");
            timing.number_regions = number_regions;
            timing.period_ms =
                effective_period_ms(self.multi_region, self.aggregate_period_seconds, number_regions);
            timing.region_offset_ms =
                region_offset_ms(timing.period_ms, region_index, number_regions);
            timing.force_resync = true;

            info!(
                "Adjusting host/scheme timer: region {}/{}, period {} ms, offset {} ms",
                region_index, number_regions, timing.period_ms, timing.region_offset_ms
            );

            !self.shared.host_schemes.lock().expect("wheel member mutex poisoned").is_empty()
        };

        if work_available {
            let _ = self.commands.send(WheelCommand::Start);
        }
    }

    pub fn go_active(&self) {
        let _ = self.commands.send(WheelCommand::Start);
    }

    pub fn go_inactive(&self) {
        let _ = self.commands.send(WheelCommand::Stop);
    }
}

fn effective_period_ms(multi_region: bool, period_seconds: u32, number_regions: u32) -> u64 {
    if multi_region {
        1000 * period_seconds as u64 * number_regions as u64
    } else {
        1000 * period_seconds as u64
    }
}

fn region_offset_ms(period_ms: u64, region_index: u32, number_regions: u32) -> u64 {
    if number_regions == 0 {
        0
    } else {
        period_ms * region_index as u64 / number_regions as u64
    }
}

/// Phase of a member within the period: its bit-reversed key scaled from
/// `[0, 2^32)` to milliseconds.
fn phase_offset_ms(period_ms: u64, key: u32) -> u64 {
    let fraction = key as f64 / 4_294_967_296.0;
    (period_ms as f64 * fraction + 0.5) as u64
}

/// Monotonic clock pinned to the wall clock at task start, so cycle
/// boundaries stay in Unix milliseconds while sleeps remain testable under a
/// paused tokio clock.
struct WheelClock {
    base: Instant,
    base_unix_ms: u64,
}

impl WheelClock {
    fn new() -> Self {
        let base_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { base: Instant::now(), base_unix_ms }
    }

    fn now_ms(&self) -> u64 {
        self.base_unix_ms + self.base.elapsed().as_millis() as u64
    }

    fn instant_at(&self, unix_ms: u64) -> Instant {
        self.base + Duration::from_millis(unix_ms.saturating_sub(self.base_unix_ms))
    }
}

struct WheelDriver {
    shared: Arc<WheelShared>,
    clock: WheelClock,
    /// Bit-reversed key of the next member to fire; None means the cycle
    /// needs a restart.
    pending: Option<u32>,
    cycle_start_ms: u64,
    deadline: Option<Instant>,
    running: bool,
    missed_windows: u64,
    missed_total_ms: u64,
    next_counter_reset_ms: u64,
}

async fn drive_wheel(
    shared: Arc<WheelShared>,
    mut commands: mpsc::UnboundedReceiver<WheelCommand>,
    start_active: bool,
) {
    let clock = WheelClock::new();
    let next_counter_reset_ms = clock.now_ms() + MISSED_TIMING_MARK_RESET_INTERVAL_MS;
    let mut driver = WheelDriver {
        shared,
        clock,
        pending: None,
        cycle_start_ms: 0,
        deadline: None,
        running: false,
        missed_windows: 0,
        missed_total_ms: 0,
        next_counter_reset_ms,
    };

    if start_active {
        driver.start_timer();
    }

    loop {
        let armed = driver.deadline.is_some();
        let sleep_deadline = driver.deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(WheelCommand::Start) => driver.start_timer(),
                Some(WheelCommand::Kick) => {
                    if !driver.running {
                        driver.start_timer();
                    }
                }
                Some(WheelCommand::Stop) => {
                    driver.running = false;
                    driver.deadline = None;
                }
            },
            _ = sleep_until(sleep_deadline), if armed => driver.fire(),
        }
    }
}

impl WheelDriver {
    fn start_timer(&mut self) {
        let empty =
            self.shared.host_schemes.lock().expect("wheel member mutex poisoned").is_empty();
        let ready = {
            let mut timing = self.shared.timing.lock().expect("wheel timing mutex poisoned");
            let ready = timing.number_regions > 0 && !empty;
            if ready {
                // The restart below services any pending resync; consume the
                // flag so the next fire does not restart a second time.
                timing.force_resync = false;
            }
            ready
        };

        if ready {
            self.missed_windows = 0;
            self.missed_total_ms = 0;
            self.next_counter_reset_ms = self.clock.now_ms() + MISSED_TIMING_MARK_RESET_INTERVAL_MS;
            self.restart_timing_cycle();
        }
    }

    /// One timing mark: dispatch the pending member and arm the next mark,
    /// or restart the cycle when the cursor ran off the end, the membership
    /// drained, or a resync was forced.
    fn fire(&mut self) {
        self.deadline = None;

        let force_resync = {
            let mut timing = self.shared.timing.lock().expect("wheel timing mutex poisoned");
            std::mem::take(&mut timing.force_resync)
        };

        let (target, successor, members) = {
            let table = self.shared.host_schemes.lock().expect("wheel member mutex poisoned");
            let members = table.len();
            match self.pending {
                Some(key) => {
                    // The pending entry may have been removed; fall forward
                    // to the next key in cycle order.
                    match table.range((Bound::Included(key), Bound::Unbounded)).next() {
                        Some((found, weak)) => {
                            let successor = table
                                .range((Bound::Excluded(*found), Bound::Unbounded))
                                .next()
                                .map(|(next, _)| *next);
                            (Some(weak.clone()), successor, members)
                        }
                        None => (None, None, members),
                    }
                }
                None => (None, None, members),
            }
        };

        if force_resync || target.is_none() {
            if members > 0 {
                self.restart_timing_cycle();
            } else {
                self.running = false;
            }
            return;
        }

        self.pending = successor;
        if self.pending.is_some() {
            self.schedule_next_host_scheme();
        } else {
            self.restart_timing_cycle();
        }

        if let Some(host_scheme) = target.and_then(|weak| weak.upgrade()) {
            host_scheme.service_next_monitor();
        }
    }

    fn restart_timing_cycle(&mut self) {
        let first =
            self.shared.host_schemes.lock().expect("wheel member mutex poisoned").keys().next().copied();
        let (period_ms, region_offset_ms) = {
            let timing = self.shared.timing.lock().expect("wheel timing mutex poisoned");
            (timing.period_ms, timing.region_offset_ms)
        };

        let Some(first) = first else {
            self.running = false;
            return;
        };
        if period_ms == 0 {
            self.running = false;
            return;
        }

        let cycle_index = self.clock.now_ms() / period_ms;
        self.cycle_start_ms = period_ms * (cycle_index + 1) + region_offset_ms;
        self.pending = Some(first);
        self.schedule_next_host_scheme();
    }

    fn schedule_next_host_scheme(&mut self) {
        let Some(key) = self.pending else {
            return;
        };

        let period_ms = self.shared.timing.lock().expect("wheel timing mutex poisoned").period_ms;
        let next_event = self.cycle_start_ms + phase_offset_ms(period_ms, key);
        let now = self.clock.now_ms();

        if next_event > now {
            self.deadline = Some(self.clock.instant_at(next_event));
        } else {
            let missed_by = now - next_event;
            if missed_by > 1 {
                self.missed_windows += 1;
                self.missed_total_ms += missed_by;
            }
            self.deadline = Some(self.clock.instant_at(now));
        }
        self.running = true;

        if now > self.next_counter_reset_ms {
            let average_seconds = if self.missed_windows > 0 {
                self.missed_total_ms as f64 / (1000.0 * self.missed_windows as f64)
            } else {
                0.0
            };
            let members = self
                .shared
                .host_schemes
                .lock()
                .expect("wheel member mutex poisoned")
                .len() as u64;
            *self.shared.loading.lock().expect("wheel loading mutex poisoned") =
                LoadingData::new(members, self.missed_windows, average_seconds);

            self.missed_windows = 0;
            self.missed_total_ms = 0;
            self.next_counter_reset_ms += MISSED_TIMING_MARK_RESET_INTERVAL_MS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_spreading_of_adjacent_ids() {
        let period_ms = 60_000;
        let a = phase_offset_ms(period_ms, bit_reverse32(1000));
        let b = phase_offset_ms(period_ms, bit_reverse32(1001));
        let c = phase_offset_ms(period_ms, bit_reverse32(1002));

        // Adjacent ids must not cluster on the timeline.
        assert!(a.abs_diff(b) >= period_ms / 5);
        assert!(b.abs_diff(c) >= period_ms / 5);
        for offset in [a, b, c] {
            assert!(offset < period_ms);
        }
    }

    #[test]
    fn region_offsets_partition_the_period() {
        let period_ms = effective_period_ms(true, 60, 3);
        assert_eq!(period_ms, 180_000);
        assert_eq!(region_offset_ms(period_ms, 0, 3), 0);
        assert_eq!(region_offset_ms(period_ms, 1, 3), 60_000);
        assert_eq!(region_offset_ms(period_ms, 2, 3), 120_000);
        assert_eq!(region_offset_ms(period_ms, 0, 0), 0);
    }

    #[test]
    fn single_region_period_ignores_region_count() {
        assert_eq!(effective_period_ms(false, 45, 4), 45_000);
        assert_eq!(effective_period_ms(true, 45, 4), 180_000);
    }
}
