// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Watchdog state that decides when the device has to be reset.
//!
//! The monitor is fed by AENQ events (it is installed as the dispatch
//! observer), by the data path (missing Tx completions) and by explicit
//! requests. [`HealthMonitor::check`] reports the first trigger that applies.

use crate::aenq::{AenqEvent, AenqHandler, EventGroup};
use crate::lock;
use crate::regs::ResetReason;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Keep-alive timeout value in HW hints meaning "never time out".
pub const HW_HINTS_NO_TIMEOUT: u16 = 0xFFFF;

/// Drop counters reported by the last keep-alive event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub rx_drops: u64,
    pub tx_drops: u64,
}

#[derive(Debug)]
pub struct HealthMonitor {
    last_keep_alive: Mutex<Instant>,
    /// Zero disables the keep-alive check.
    keep_alive_timeout_us: AtomicU64,
    fatal_error: AtomicBool,
    missing_tx: AtomicU32,
    missing_tx_threshold: AtomicU32,
    requested: Mutex<Option<ResetReason>>,
    keep_alive_events: AtomicU64,
    drops: Mutex<DropCounters>,
}

impl HealthMonitor {
    pub fn new(keep_alive_timeout: Option<Duration>, missing_tx_threshold: u32) -> Self {
        Self {
            last_keep_alive: Mutex::new(Instant::now()),
            keep_alive_timeout_us: AtomicU64::new(
                keep_alive_timeout.map_or(0, |timeout| timeout.as_micros() as u64),
            ),
            fatal_error: AtomicBool::new(false),
            missing_tx: AtomicU32::new(0),
            missing_tx_threshold: AtomicU32::new(missing_tx_threshold),
            requested: Mutex::new(None),
            keep_alive_events: AtomicU64::new(0),
            drops: Mutex::new(DropCounters::default()),
        }
    }

    /// Restart the keep-alive window.
    pub fn touch_keep_alive(&self) {
        *lock(&self.last_keep_alive) = Instant::now();
    }

    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        match self.keep_alive_timeout_us.load(Ordering::Acquire) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn set_keep_alive_timeout(&self, timeout: Option<Duration>) {
        self.keep_alive_timeout_us.store(
            timeout.map_or(0, |timeout| timeout.as_micros().max(1) as u64),
            Ordering::Release,
        );
    }

    pub fn keep_alive_events(&self) -> u64 {
        self.keep_alive_events.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> DropCounters {
        *lock(&self.drops)
    }

    pub fn is_fatal_error(&self) -> bool {
        self.fatal_error.load(Ordering::Acquire)
    }

    pub fn missing_tx_threshold(&self) -> u32 {
        self.missing_tx_threshold.load(Ordering::Relaxed)
    }

    pub fn set_missing_tx_threshold(&self, threshold: u32) {
        self.missing_tx_threshold
            .store(threshold, Ordering::Relaxed);
    }

    /// Record Tx completions that did not arrive in time.
    pub fn report_missing_tx(&self, count: u32) {
        self.missing_tx.fetch_add(count, Ordering::AcqRel);
    }

    pub fn missing_tx(&self) -> u32 {
        self.missing_tx.load(Ordering::Acquire)
    }

    /// Ask for a reset on the next health check. The first request wins.
    pub fn request_reset(&self, reason: ResetReason) {
        let mut requested = lock(&self.requested);
        if requested.is_none() {
            log::warn!("Device reset requested, reason {}", reason);
            *requested = Some(reason);
        }
    }

    /// First applicable reset trigger, if any.
    ///
    /// `keep_alive_pending` is consulted only when the keep-alive window has
    /// expired, so a keep-alive queued behind other events still counts.
    pub fn check(
        &self,
        admin_running: bool,
        keep_alive_pending: impl FnOnce() -> bool,
    ) -> Option<ResetReason> {
        if let Some(reason) = *lock(&self.requested) {
            return Some(reason);
        }

        if self.is_fatal_error() {
            log::error!("Device reported a fatal error");
            return Some(ResetReason::Generic);
        }

        if let Some(timeout) = self.keep_alive_timeout() {
            let elapsed = lock(&self.last_keep_alive).elapsed();
            if elapsed > timeout {
                if keep_alive_pending() {
                    log::debug!("Keep-alive queued in AENQ, not yet processed");
                } else {
                    log::error!(
                        "Keep alive watchdog timeout ({:?} since last event)",
                        elapsed
                    );
                    return Some(ResetReason::KeepAliveTimeout);
                }
            }
        }

        if !admin_running {
            log::error!("Admin queue is not running");
            return Some(ResetReason::AdminTimeout);
        }

        let threshold = self.missing_tx_threshold();
        let missing = self.missing_tx();
        if threshold > 0 && missing > threshold {
            log::error!(
                "The number of lost tx completions ({}) is above the threshold ({})",
                missing,
                threshold
            );
            return Some(ResetReason::MissTxCompletion);
        }

        None
    }

    /// Forget every trigger after a completed reset.
    pub fn clear(&self) {
        self.fatal_error.store(false, Ordering::Release);
        self.missing_tx.store(0, Ordering::Release);
        *lock(&self.requested) = None;
        self.touch_keep_alive();
    }
}

impl AenqHandler for HealthMonitor {
    fn handle(&self, event: &AenqEvent) {
        match event.group {
            EventGroup::KeepAlive => {
                self.touch_keep_alive();
                self.keep_alive_events.fetch_add(1, Ordering::Relaxed);
                if let Some((rx_drops, tx_drops)) = event.keep_alive_drops() {
                    *lock(&self.drops) = DropCounters { rx_drops, tx_drops };
                }
            }
            EventGroup::FatalError => {
                log::error!("AENQ fatal error event, syndrome {:#x}", event.syndrome);
                self.fatal_error.store(true, Ordering::Release);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn event(group: EventGroup, data: [u32; 12]) -> AenqEvent {
        AenqEvent {
            group,
            syndrome: 0,
            timestamp: 0,
            data,
        }
    }

    #[test]
    fn test_healthy() {
        let monitor = HealthMonitor::new(Some(Duration::from_secs(60)), 10);
        assert_eq!(monitor.check(true, || false), None);
    }

    #[test]
    fn test_keep_alive_expiry_and_refresh() {
        let monitor = HealthMonitor::new(Some(Duration::from_millis(10)), 10);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            monitor.check(true, || false),
            Some(ResetReason::KeepAliveTimeout)
        );
        // A keep-alive still sitting in the ring counts as alive.
        assert_eq!(monitor.check(true, || true), None);

        let mut data = [0u32; 12];
        data[0] = 3;
        data[2] = 4;
        monitor.handle(&event(EventGroup::KeepAlive, data));
        assert_eq!(monitor.check(true, || false), None);
        assert_eq!(monitor.keep_alive_events(), 1);
        assert_eq!(
            monitor.drops(),
            DropCounters {
                rx_drops: 3,
                tx_drops: 4
            }
        );
    }

    #[test]
    fn test_keep_alive_disabled() {
        let monitor = HealthMonitor::new(None, 10);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(monitor.check(true, || false), None);
    }

    #[test]
    fn test_trigger_order() {
        let monitor = HealthMonitor::new(Some(Duration::from_secs(60)), 2);
        monitor.report_missing_tx(3);
        assert_eq!(
            monitor.check(true, || false),
            Some(ResetReason::MissTxCompletion)
        );
        assert_eq!(
            monitor.check(false, || false),
            Some(ResetReason::AdminTimeout)
        );

        monitor.handle(&event(EventGroup::FatalError, [0; 12]));
        assert_eq!(monitor.check(false, || false), Some(ResetReason::Generic));

        monitor.request_reset(ResetReason::UserTrigger);
        monitor.request_reset(ResetReason::OsTrigger);
        assert_eq!(
            monitor.check(false, || false),
            Some(ResetReason::UserTrigger)
        );

        monitor.clear();
        assert_eq!(monitor.check(true, || false), None);
        assert_eq!(monitor.missing_tx(), 0);
    }

    #[test]
    fn test_missing_tx_threshold_zero_disables() {
        let monitor = HealthMonitor::new(None, 0);
        monitor.report_missing_tx(1000);
        assert_eq!(monitor.check(true, || false), None);
    }
}
