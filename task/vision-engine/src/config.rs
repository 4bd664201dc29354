use std::time::Duration;

/// Tunables for a [`crate::Device`]. The defaults match the timings the
/// original driver hardcoded; they're broken out here so tests can shrink
/// them and a real deployment can tune them without a rebuild.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Whether a fatal link error (CRC exhaustion, a transport I/O error)
    /// triggers an automatic reboot of the device, versus leaving it
    /// wedged for the caller to explicitly reset.
    pub reset_on_failure: bool,
    /// Minimum time between two polls of the same still-pending ongoing
    /// transaction.
    pub ongoing_poll_interval: Duration,
    /// How long the worker sleeps when there is neither incoming nor due
    /// ongoing work, before checking again.
    pub idle_poll_interval: Duration,
    /// How long the reset line is held asserted.
    pub reset_assert_duration: Duration,
    /// Settle time after deasserting reset before the second pulse.
    pub reset_settle_duration: Duration,
    /// Settle time after the final reset pulse before streaming firmware.
    pub boot_settle_duration: Duration,
    /// How long to wait for slave-ready after streaming firmware, before
    /// declaring the boot a failure.
    pub boot_slave_ready_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reset_on_failure: true,
            ongoing_poll_interval: Duration::from_millis(16),
            idle_poll_interval: Duration::from_millis(4),
            reset_assert_duration: Duration::from_millis(20),
            reset_settle_duration: Duration::from_millis(20),
            boot_settle_duration: Duration::from_millis(2000),
            boot_slave_ready_timeout: Duration::from_millis(5000),
        }
    }
}
