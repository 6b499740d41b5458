// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register map and register-access collaborators.
//!
//! Both device families expose the same BAR0 layout for the registers the
//! core touches. Offsets and field masks follow the device register layout.

use bitflags::bitflags;

/// 32-bit register access at BAR offsets.
///
/// Writes are posted: nothing is read back, so callers order data writes
/// before the doorbell write that announces them.
pub trait RegisterSpace: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Device-mapped memory BAR used by low-latency (device placement) queues.
pub trait DeviceMemory: Send + Sync {
    fn write_bytes(&self, offset: u64, data: &[u8]);
}

pub const VERSION: u32 = 0x00;
pub const CONTROLLER_VERSION: u32 = 0x04;
pub const CAPS: u32 = 0x08;
pub const CAPS_EXT: u32 = 0x0c;
pub const AQ_BASE_LO: u32 = 0x10;
pub const AQ_BASE_HI: u32 = 0x14;
pub const AQ_CAPS: u32 = 0x18;
pub const ACQ_BASE_LO: u32 = 0x20;
pub const ACQ_BASE_HI: u32 = 0x24;
pub const ACQ_CAPS: u32 = 0x28;
pub const AQ_DB: u32 = 0x2c;
pub const ACQ_TAIL: u32 = 0x30;
pub const AENQ_CAPS: u32 = 0x34;
pub const AENQ_BASE_LO: u32 = 0x38;
pub const AENQ_BASE_HI: u32 = 0x3c;
pub const AENQ_HEAD_DB: u32 = 0x40;
pub const AENQ_TAIL: u32 = 0x44;
pub const INTR_MASK: u32 = 0x4c;
pub const DEV_CTL: u32 = 0x54;
pub const DEV_STS: u32 = 0x58;
pub const MMIO_REG_READ: u32 = 0x5c;
pub const MMIO_RESP_LO: u32 = 0x60;
pub const MMIO_RESP_HI: u32 = 0x64;

/// Value returned by a register read that did not complete.
pub const MMIO_READ_TIMEOUT: u32 = 0xFFFF_FFFF;

// VERSION
pub const VERSION_MINOR_MASK: u32 = 0xff;
pub const VERSION_MAJOR_SHIFT: u32 = 8;
pub const VERSION_MAJOR_MASK: u32 = 0xff00;

// CONTROLLER_VERSION
pub const CTRL_SUBMINOR_MASK: u32 = 0xff;
pub const CTRL_MINOR_SHIFT: u32 = 8;
pub const CTRL_MINOR_MASK: u32 = 0xff00;
pub const CTRL_MAJOR_SHIFT: u32 = 16;
pub const CTRL_MAJOR_MASK: u32 = 0xff_0000;
pub const CTRL_IMPL_ID_SHIFT: u32 = 24;
pub const CTRL_IMPL_ID_MASK: u32 = 0xff00_0000;

// CAPS
pub const CAPS_CONTIGUOUS_QUEUE_REQUIRED: u32 = 0x1;
pub const CAPS_RESET_TIMEOUT_SHIFT: u32 = 1;
pub const CAPS_RESET_TIMEOUT_MASK: u32 = 0x3e;
pub const CAPS_DMA_ADDR_WIDTH_SHIFT: u32 = 8;
pub const CAPS_DMA_ADDR_WIDTH_MASK: u32 = 0xff00;
pub const CAPS_ADMIN_CMD_TO_SHIFT: u32 = 16;
pub const CAPS_ADMIN_CMD_TO_MASK: u32 = 0xf_0000;

// AQ_CAPS / ACQ_CAPS / AENQ_CAPS
pub const QUEUE_CAPS_DEPTH_MASK: u32 = 0xffff;
pub const QUEUE_CAPS_ENTRY_SIZE_SHIFT: u32 = 16;
pub const QUEUE_CAPS_ENTRY_SIZE_MASK: u32 = 0xffff_0000;

// MMIO_REG_READ
pub const MMIO_REG_READ_REQ_ID_MASK: u32 = 0xffff;
pub const MMIO_REG_READ_REG_OFF_SHIFT: u32 = 16;
pub const MMIO_REG_READ_REG_OFF_MASK: u32 = 0xffff_0000;

// DEV_CTL
pub const DEV_CTL_RESET_REASON_SHIFT: u32 = 28;
pub const DEV_CTL_RESET_REASON_MASK: u32 = 0xf000_0000;

bitflags! {
    /// DEV_STS register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DevStatus: u32 {
        const READY = 1 << 0;
        const AQ_RESTART_IN_PROGRESS = 1 << 1;
        const AQ_RESTART_FINISHED = 1 << 2;
        const RESET_IN_PROGRESS = 1 << 3;
        const RESET_FINISHED = 1 << 4;
        const FATAL_ERROR = 1 << 5;
        const QUIESCENT_STATE_IN_PROGRESS = 1 << 6;
        const QUIESCENT_STATE_ACHIEVED = 1 << 7;
    }
}

bitflags! {
    /// DEV_CTL register bits (reset reason lives in bits 31:28).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DevControl: u32 {
        const DEV_RESET = 1 << 0;
        const AQ_RESTART = 1 << 1;
        const QUIESCENT = 1 << 2;
        const IO_RESUME = 1 << 3;
    }
}

/// Reason reported to the device when the driver resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResetReason {
    Normal = 0,
    KeepAliveTimeout = 1,
    AdminTimeout = 2,
    MissTxCompletion = 3,
    InvalidRxReqId = 4,
    InvalidTxReqId = 5,
    TooManyRxDescs = 6,
    InitError = 7,
    DriverInvalidState = 8,
    OsTrigger = 9,
    OsNetdevWatchdog = 10,
    Shutdown = 11,
    UserTrigger = 12,
    Generic = 13,
    MissInterrupt = 14,
    SuspectedPollStarvation = 15,
}

impl ResetReason {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// DEV_CTL value that starts a reset for this reason.
    pub fn dev_ctl_value(self) -> u32 {
        DevControl::DEV_RESET.bits()
            | (((self.as_u8() as u32) << DEV_CTL_RESET_REASON_SHIFT) & DEV_CTL_RESET_REASON_MASK)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::KeepAliveTimeout => "KEEP_ALIVE_TO",
            Self::AdminTimeout => "ADMIN_TO",
            Self::MissTxCompletion => "MISS_TX_CMPL",
            Self::InvalidRxReqId => "INV_RX_REQ_ID",
            Self::InvalidTxReqId => "INV_TX_REQ_ID",
            Self::TooManyRxDescs => "TOO_MANY_RX_DESCS",
            Self::InitError => "INIT_ERR",
            Self::DriverInvalidState => "DRIVER_INVALID_STATE",
            Self::OsTrigger => "OS_TRIGGER",
            Self::OsNetdevWatchdog => "OS_NETDEV_WD",
            Self::Shutdown => "SHUTDOWN",
            Self::UserTrigger => "USER_TRIGGER",
            Self::Generic => "GENERIC",
            Self::MissInterrupt => "MISS_INTERRUPT",
            Self::SuspectedPollStarvation => "SUSPECTED_POLL_STARVATION",
        }
    }
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// Encode depth and entry size for AQ_CAPS / ACQ_CAPS / AENQ_CAPS.
pub fn queue_caps(depth: u16, entry_size: usize) -> u32 {
    (depth as u32 & QUEUE_CAPS_DEPTH_MASK)
        | (((entry_size as u32) << QUEUE_CAPS_ENTRY_SIZE_SHIFT) & QUEUE_CAPS_ENTRY_SIZE_MASK)
}

/// Low 32 bits of a DMA address.
#[inline]
pub fn addr_low(addr: u64) -> u32 {
    addr as u32
}

/// High 32 bits of a DMA address.
#[inline]
pub fn addr_high(addr: u64) -> u32 {
    (addr >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reason_encoding() {
        assert_eq!(ResetReason::Normal.dev_ctl_value(), 0x1);
        assert_eq!(ResetReason::AdminTimeout.dev_ctl_value(), 0x2000_0001);
        assert_eq!(
            ResetReason::SuspectedPollStarvation.dev_ctl_value(),
            0xf000_0001
        );
        assert_eq!(format!("{}", ResetReason::KeepAliveTimeout), "KEEP_ALIVE_TO (1)");
    }

    #[test]
    fn test_queue_caps() {
        assert_eq!(queue_caps(32, 64), 0x0040_0020);
        assert_eq!(queue_caps(16, 64) & QUEUE_CAPS_DEPTH_MASK, 16);
    }

    #[test]
    fn test_addr_split() {
        let addr = 0x0000_1234_5678_9abc_u64;
        assert_eq!(addr_low(addr), 0x5678_9abc);
        assert_eq!(addr_high(addr), 0x1234);
    }

    #[test]
    fn test_dev_status_bits() {
        let sts = DevStatus::from_bits_truncate(0x9);
        assert!(sts.contains(DevStatus::READY));
        assert!(sts.contains(DevStatus::RESET_IN_PROGRESS));
        assert!(!sts.contains(DevStatus::FATAL_ERROR));
    }
}
