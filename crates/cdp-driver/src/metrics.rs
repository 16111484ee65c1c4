//! Atomic command/latency counters for the driver. Kept process-global, in
//! the style of the reference adapter, so a binary can expose them through
//! a metrics endpoint without threading a handle through every call site.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverMetricsSnapshot {
    pub commands: u64,
    pub command_success: u64,
    pub command_failures: u64,
    pub command_latency_total_us: u64,
    pub click_fallback_js: u64,
    pub click_fallback_focus: u64,
    pub click_fallback_failed: u64,
}

static COMMANDS: AtomicU64 = AtomicU64::new(0);
static COMMAND_SUCCESS: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static COMMAND_LATENCY_TOTAL_US: AtomicU64 = AtomicU64::new(0);
static CLICK_FALLBACK_JS: AtomicU64 = AtomicU64::new(0);
static CLICK_FALLBACK_FOCUS: AtomicU64 = AtomicU64::new(0);
static CLICK_FALLBACK_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn record_command() {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_command_success(duration: std::time::Duration) {
    COMMAND_SUCCESS.fetch_add(1, Ordering::Relaxed);
    let micros = duration.as_micros().min(u64::MAX as u128) as u64;
    COMMAND_LATENCY_TOTAL_US.fetch_add(micros, Ordering::Relaxed);
}

pub fn record_command_failure() {
    COMMAND_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_click_fallback_js() {
    CLICK_FALLBACK_JS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_click_fallback_focus() {
    CLICK_FALLBACK_FOCUS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_click_fallback_failed() {
    CLICK_FALLBACK_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> DriverMetricsSnapshot {
    DriverMetricsSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        command_success: COMMAND_SUCCESS.load(Ordering::Relaxed),
        command_failures: COMMAND_FAILURES.load(Ordering::Relaxed),
        command_latency_total_us: COMMAND_LATENCY_TOTAL_US.load(Ordering::Relaxed),
        click_fallback_js: CLICK_FALLBACK_JS.load(Ordering::Relaxed),
        click_fallback_focus: CLICK_FALLBACK_FOCUS.load(Ordering::Relaxed),
        click_fallback_failed: CLICK_FALLBACK_FAILED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        record_command();
        record_command_success(std::time::Duration::from_micros(100));
        record_command_failure();
        let snap = snapshot();
        assert!(snap.commands >= 1);
        assert!(snap.command_success >= 1);
        assert!(snap.command_failures >= 1);
    }
}
