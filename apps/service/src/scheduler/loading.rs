/// Per-wheel schedule-health snapshot, refreshed every two hours and
/// reported through `/loading/get` so the controller can rebalance regions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadingData {
    /// Host/schemes on the wheel when the snapshot was taken.
    pub polled_host_schemes: u64,
    /// Timing marks missed by more than one millisecond.
    pub missed_timing_marks: u64,
    /// Mean overrun of the missed marks, in seconds.
    pub average_timing_error: f64,
}

impl LoadingData {
    pub fn new(polled_host_schemes: u64, missed_timing_marks: u64, average_timing_error: f64) -> Self {
        Self { polled_host_schemes, missed_timing_marks, average_timing_error }
    }
}
