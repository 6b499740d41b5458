// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! ENA feature bodies carried by get/set feature commands.

use crate::device::TimeoutHints;
use bytemuck::{Pod, Zeroable};

pub use crate::aenq::AenqConfig;

/// `DeviceAttributes` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceAttributes {
    pub impl_id: u32,
    pub device_version: u32,
    /// Bitmap of supported feature ids.
    pub supported_features: u32,
    pub capabilities: u32,
    pub phys_addr_width: u32,
    pub virt_addr_width: u32,
    pub mac_addr: [u8; 6],
    pub reserved: [u8; 2],
    pub max_mtu: u32,
}

/// `MaxQueuesNum` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MaxQueues {
    pub max_sq_num: u32,
    pub max_sq_depth: u32,
    pub max_cq_num: u32,
    pub max_cq_depth: u32,
    pub max_legacy_llq_num: u32,
    pub max_legacy_llq_depth: u32,
    pub max_header_size: u32,
    pub max_packet_tx_descs: u16,
    pub max_packet_rx_descs: u16,
}

/// `HwHints` feature. Timeouts are in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HwHints {
    pub mmio_read_timeout: u16,
    pub driver_watchdog_timeout: u16,
    pub missing_tx_completion_timeout: u16,
    pub missed_tx_completion_count_threshold_to_reset: u16,
    pub admin_completion_tx_timeout: u16,
    pub netdev_wd_timeout: u16,
    pub max_tx_sgl_size: u16,
    pub max_rx_sgl_size: u16,
    pub reserved: [u16; 8],
}

impl HwHints {
    /// The subset of hints the core applies.
    pub fn timeouts(&self) -> TimeoutHints {
        TimeoutHints {
            mmio_read_timeout_ms: self.mmio_read_timeout,
            admin_completion_timeout_ms: self.admin_completion_tx_timeout,
            driver_watchdog_timeout_ms: self.driver_watchdog_timeout,
            missing_tx_threshold: self.missed_tx_completion_count_threshold_to_reset,
        }
    }
}

/// `Llq` feature: low-latency queue geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LlqFeature {
    pub max_llq_num: u32,
    pub max_llq_depth: u32,
    pub header_location_ctrl_supported: u16,
    pub header_location_ctrl_enabled: u16,
    /// Bit 0: 128 B, bit 1: 192 B, bit 2: 256 B.
    pub entry_size_ctrl_supported: u16,
    pub entry_size_ctrl_enabled: u16,
    pub desc_num_before_header_supported: u16,
    pub desc_num_before_header_enabled: u16,
    pub descriptors_stride_ctrl_supported: u16,
    pub descriptors_stride_ctrl_enabled: u16,
    pub reserved: [u32; 2],
}

impl LlqFeature {
    /// Entry size selected by `entry_size_ctrl_enabled`, in bytes.
    pub fn entry_size(&self) -> usize {
        match self.entry_size_ctrl_enabled {
            2 => 192,
            4 => 256,
            _ => 128,
        }
    }
}

/// `StatelessOffload` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StatelessOffload {
    pub tx: u32,
    pub rx_supported: u32,
    pub rx_enabled: u32,
}

/// `Mtu` feature (set only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Mtu {
    pub mtu: u32,
}

const _: () = assert!(std::mem::size_of::<DeviceAttributes>() == 36);
const _: () = assert!(std::mem::size_of::<MaxQueues>() == 32);
const _: () = assert!(std::mem::size_of::<HwHints>() == 32);
const _: () = assert!(std::mem::size_of::<LlqFeature>() == 32);
