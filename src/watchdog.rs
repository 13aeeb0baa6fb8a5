//! Watchdog injection point.
//!
//! On MCU targets the hooks wrap the platform task watchdog; host builds run
//! with the disabled set and rely on the scheduler's budget bookkeeping,
//! which records a fault where the real device would reset.

/// External watchdog primitive as three injected functions.
#[derive(Clone, Copy)]
pub struct WatchdogHooks {
    pub init: fn(timeout_ms: u32),
    pub register_task: fn(name: &'static str, timeout_ms: u32),
    pub feed: fn(name: &'static str),
}

fn noop_init(_timeout_ms: u32) {}
fn noop_register(_name: &'static str, _timeout_ms: u32) {}
fn noop_feed(_name: &'static str) {}

impl WatchdogHooks {
    /// Hooks that do nothing; the host model still tracks budgets.
    pub const fn disabled() -> Self {
        WatchdogHooks {
            init: noop_init,
            register_task: noop_register,
            feed: noop_feed,
        }
    }
}

impl Default for WatchdogHooks {
    fn default() -> Self {
        WatchdogHooks::disabled()
    }
}
