// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Tunables for the admin queue, AENQ, readless MMIO and the watchdog.

use crate::backoff::Backoff;
use std::time::Duration;

/// Default admin queue depth (entries).
pub const ADMIN_QUEUE_DEPTH: u16 = 32;

/// Default AENQ depth (entries).
pub const AENQ_DEPTH: u16 = 16;

/// Admin completion timeout used when the device reports none.
pub const ADMIN_CMD_TIMEOUT: Duration = Duration::from_secs(3);

/// Lower clamp for the admin poll delay.
pub const MIN_ADMIN_POLL: Duration = Duration::from_micros(100);

/// Upper clamp for the admin poll delay.
pub const MAX_ADMIN_POLL: Duration = Duration::from_micros(5000);

/// Cap on the backoff exponent.
pub const MAX_BACKOFF_EXP: u32 = 16;

/// Readless register read timeout.
pub const REG_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// First delay between readless response polls.
pub const READLESS_MIN_DELAY: Duration = Duration::from_micros(1);

/// Longest delay between readless response polls.
pub const READLESS_MAX_DELAY: Duration = Duration::from_micros(10);

/// Keep-alive watchdog timeout.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(6);

/// Number of I/O queue slots (Tx and Rx share the id space).
pub const TOTAL_IO_QUEUES: u16 = 256;

/// Core configuration.
///
/// Values reported by the device (admin timeout in the CAPS register, HW
/// hints) override the corresponding defaults once they are known.
#[derive(Debug, Clone)]
pub struct ComConfig {
    /// Admin SQ/CQ depth; must be a power of two.
    pub admin_queue_depth: u16,
    /// AENQ depth; must be a power of two.
    pub aenq_depth: u16,
    /// Admin completion timeout before the device has been reset.
    pub admin_completion_timeout: Duration,
    /// Minimum delay between admin polls.
    pub min_poll_delay: Duration,
    /// Maximum delay between admin polls.
    pub max_poll_delay: Duration,
    /// Cap on the poll delay exponent.
    pub max_backoff_exp: u32,
    /// Emulate register reads through the readless DMA handshake.
    pub readless: bool,
    /// Timeout for one readless register read.
    pub reg_read_timeout: Duration,
    /// Minimum delay between readless response polls.
    pub readless_min_delay: Duration,
    /// Maximum delay between readless response polls.
    pub readless_max_delay: Duration,
    /// Start the admin queue in polling mode.
    pub admin_polling: bool,
    /// Switch to polling mode when a completion arrives without its interrupt.
    pub auto_polling: bool,
    /// Maximum AENQ scan passes per `process_pending` call.
    pub aenq_max_passes: u32,
    /// Keep-alive watchdog timeout; `None` disables the check.
    pub keep_alive_timeout: Option<Duration>,
    /// Missing Tx completions tolerated before a reset is requested.
    pub missing_tx_threshold: u32,
    /// Number of I/O queue slots.
    pub max_io_queues: u16,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            admin_queue_depth: ADMIN_QUEUE_DEPTH,
            aenq_depth: AENQ_DEPTH,
            admin_completion_timeout: ADMIN_CMD_TIMEOUT,
            min_poll_delay: MIN_ADMIN_POLL,
            max_poll_delay: MAX_ADMIN_POLL,
            max_backoff_exp: MAX_BACKOFF_EXP,
            readless: false,
            reg_read_timeout: REG_READ_TIMEOUT,
            readless_min_delay: READLESS_MIN_DELAY,
            readless_max_delay: READLESS_MAX_DELAY,
            admin_polling: false,
            auto_polling: true,
            aenq_max_passes: 4,
            keep_alive_timeout: Some(KEEP_ALIVE_TIMEOUT),
            missing_tx_threshold: 128,
            max_io_queues: TOTAL_IO_QUEUES,
        }
    }
}

impl ComConfig {
    pub fn with_admin_queue_depth(mut self, depth: u16) -> Self {
        self.admin_queue_depth = depth;
        self
    }

    pub fn with_aenq_depth(mut self, depth: u16) -> Self {
        self.aenq_depth = depth;
        self
    }

    pub fn with_admin_completion_timeout(mut self, timeout: Duration) -> Self {
        self.admin_completion_timeout = timeout;
        self
    }

    pub fn with_poll_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_delay = min;
        self.max_poll_delay = max;
        self
    }

    pub fn with_readless(mut self, readless: bool) -> Self {
        self.readless = readless;
        self
    }

    pub fn with_reg_read_timeout(mut self, timeout: Duration) -> Self {
        self.reg_read_timeout = timeout;
        self
    }

    pub fn with_readless_delays(mut self, min: Duration, max: Duration) -> Self {
        self.readless_min_delay = min;
        self.readless_max_delay = max;
        self
    }

    pub fn with_admin_polling(mut self, polling: bool) -> Self {
        self.admin_polling = polling;
        self
    }

    pub fn with_auto_polling(mut self, auto_polling: bool) -> Self {
        self.auto_polling = auto_polling;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn with_missing_tx_threshold(mut self, threshold: u32) -> Self {
        self.missing_tx_threshold = threshold;
        self
    }

    pub fn with_max_io_queues(mut self, count: u16) -> Self {
        self.max_io_queues = count;
        self
    }

    /// Poll schedule for readless register reads.
    pub fn readless_backoff(&self) -> Backoff {
        Backoff::new(
            self.readless_min_delay,
            self.readless_max_delay,
            self.max_backoff_exp,
        )
    }
}
