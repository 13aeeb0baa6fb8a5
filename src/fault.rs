//! Fault sink and mesh metrics: the aggregate counters exposed to telemetry
//! and to the operator. Every recoverable error in the node ends up here as
//! a counter increment, optionally with a latched message.

/// Counters that persist across mesh-metric resets.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct FaultCounters {
    pub watchdog_resets: u32,
    pub ota_failures: u32,
    pub tamper_events: u32,
}

/// Latched fault state shipped in every frame.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct FaultStatus {
    pub fault_active: bool,
    /// Most recent fault message, if any. Messages are static so the
    /// record path never allocates.
    pub fault_msg: Option<&'static str>,
    pub counters: FaultCounters,
}

/// Mesh-layer counters. Resettable, unlike [`FaultCounters`].
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MeshMetrics {
    pub parent_changes: u32,
    pub blacklist_hits: u32,
    pub ttl_drops: u32,
    pub fragments_sent: u32,
    pub fragments_dropped: u32,
    pub retry_drops: u32,
}

impl MeshMetrics {
    pub fn reset(&mut self) {
        *self = MeshMetrics::default();
    }
}

/// Owner of the latched fault state. Mutated only through the named record
/// operations; cleared only via an explicit reset.
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct FaultMonitor {
    status: FaultStatus,
}

impl FaultMonitor {
    pub const fn new() -> Self {
        FaultMonitor {
            status: FaultStatus {
                fault_active: false,
                fault_msg: None,
                counters: FaultCounters {
                    watchdog_resets: 0,
                    ota_failures: 0,
                    tamper_events: 0,
                },
            },
        }
    }

    pub fn record_fault(&mut self, msg: &'static str) {
        self.status.fault_active = true;
        self.status.fault_msg = Some(msg);
    }

    pub fn record_watchdog_reset(&mut self) {
        self.status.counters.watchdog_resets += 1;
        self.record_fault("Watchdog reset");
    }

    pub fn record_tamper(&mut self) {
        self.status.counters.tamper_events += 1;
        self.record_fault("Tamper detected");
    }

    pub fn record_ota_failure(&mut self) {
        self.status.counters.ota_failures += 1;
        self.record_fault("OTA failure");
    }

    /// Clears the latched flag and message. Counters are preserved.
    pub fn clear(&mut self) {
        self.status.fault_active = false;
        self.status.fault_msg = None;
    }

    pub fn status(&self) -> FaultStatus {
        self.status
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn record_latches_flag_and_message() {
        let mut monitor = FaultMonitor::new();
        assert!(!monitor.status().fault_active);

        monitor.record_fault("Transport queue full");
        let status = monitor.status();
        assert!(status.fault_active);
        assert_eq!(status.fault_msg, Some("Transport queue full"));
    }

    #[test]
    fn counters_survive_clear() {
        let mut monitor = FaultMonitor::new();
        monitor.record_tamper();
        monitor.record_watchdog_reset();
        monitor.record_ota_failure();
        monitor.clear();

        let status = monitor.status();
        assert!(!status.fault_active);
        assert_eq!(status.fault_msg, None);
        assert_eq!(status.counters.tamper_events, 1);
        assert_eq!(status.counters.watchdog_resets, 1);
        assert_eq!(status.counters.ota_failures, 1);
    }

    #[test]
    fn mesh_metrics_reset_zeroes_all_counters() {
        let mut metrics = MeshMetrics {
            parent_changes: 1,
            blacklist_hits: 2,
            ttl_drops: 3,
            fragments_sent: 4,
            fragments_dropped: 5,
            retry_drops: 6,
        };
        metrics.reset();
        assert_eq!(metrics, MeshMetrics::default());
    }
}
