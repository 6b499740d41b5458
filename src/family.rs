// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device family parameterisation.
//!
//! ENA and EFA speak the same ring protocol but differ in opcode numbers,
//! feature ids, version minimums and command-id encoding. The admin queue
//! and device lifecycle are written once, generic over [`DeviceFamily`].

/// Per-family ABI constants.
pub trait DeviceFamily: Send + Sync + 'static {
    /// Short name used in log messages.
    const NAME: &'static str;

    /// Minimum `VERSION` register value (major << 8 | minor).
    const MIN_VERSION: u32;

    /// Minimum `CONTROLLER_VERSION` value, implementation id masked out.
    const MIN_CTRL_VERSION: u32;

    /// Whether command ids carry a generation tag above the slot index.
    ///
    /// Untagged families use the slot index as command id.
    const TAGGED_COMMAND_IDS: bool;

    /// Smallest acceptable DMA address width.
    const MIN_DMA_WIDTH: u8 = 32;

    /// Largest acceptable DMA address width.
    const MAX_DMA_WIDTH: u8;

    const GET_FEATURE_OPCODE: u8;
    const SET_FEATURE_OPCODE: u8;

    /// Feature that is always supported and reports the supported bitmap.
    const DEVICE_ATTRIBUTES_FEATURE: u8;

    const AENQ_CONFIG_FEATURE: u8;

    /// Human-readable opcode name for log messages.
    fn opcode_name(opcode: u8) -> &'static str;
}
