// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Admin SQ, admin CQ and AENQ entry layouts.
//!
//! These structures match the device's ring ABI bit for bit. All three rings
//! use 64-byte entries whose first bytes form a common header; the rest is a
//! payload selected by opcode (SQ/CQ) or event group (AENQ). Typed commands
//! and responses are `Pod` structs of exactly 64 bytes that are cast to and
//! from the raw entries.

use crate::error::{AdminStatus, ComError, ComResult};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Size of every admin SQ, admin CQ and AENQ entry.
pub const ENTRY_SIZE: usize = 64;

/// Command id bits in the SQ `command_id` / CQ `command` fields (11:0).
pub const COMMAND_ID_MASK: u16 = 0x0fff;

/// Byte offset of the CQ flags byte holding the phase bit.
pub const ACQ_PHASE_OFFSET: usize = 3;

/// Byte offset of the AENQ flags byte holding the phase bit.
pub const AENQ_PHASE_OFFSET: usize = 4;

/// Phase bit within a flags byte.
pub const PHASE_MASK: u8 = 0x1;

fn entry_size_error<T>(what: &str) -> ComError {
    let message = format!(
        "Admin {} of {} bytes does not fit a {}-byte entry",
        what,
        std::mem::size_of::<T>(),
        ENTRY_SIZE
    );
    log::error!("{}", message);
    ComError::InvalidParameter(message)
}

/// Fail with `InvalidParameter` unless `T` is exactly one entry long.
pub(crate) fn check_entry_size<T>(what: &str) -> ComResult<()> {
    if std::mem::size_of::<T>() == ENTRY_SIZE {
        Ok(())
    } else {
        Err(entry_size_error::<T>(what))
    }
}

bitflags! {
    /// Admin SQ common descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AqFlags: u8 {
        /// Ring phase at the time of submission.
        const PHASE = 1 << 0;
        /// Control buffer address is valid.
        const CTRL_DATA = 1 << 1;
        /// Control buffer address points at a list of control buffers.
        const CTRL_DATA_INDIRECT = 1 << 2;
    }
}

/// Admin SQ common descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AqCommonDesc {
    /// Bits 11:0 command id.
    pub command_id: u16,
    pub opcode: u8,
    /// See [`AqFlags`].
    pub flags: u8,
}

/// Raw 64-byte admin SQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AqEntry {
    pub common: AqCommonDesc,
    pub payload: [u32; 15],
}

impl AqEntry {
    /// Zeroed entry carrying `opcode`.
    pub fn new(opcode: u8) -> Self {
        let mut entry = Self::zeroed();
        entry.common.opcode = opcode;
        entry
    }

    /// Raw entry from a typed 64-byte command.
    ///
    /// Fails with `InvalidParameter` if `C` is not exactly one entry long.
    #[inline]
    pub fn from_command<C: Pod>(command: C) -> ComResult<Self> {
        bytemuck::try_cast(command).map_err(|_| entry_size_error::<C>("command"))
    }

    /// Typed view of the entry.
    #[inline]
    pub fn to_command<C: Pod>(&self) -> ComResult<C> {
        bytemuck::try_cast(*self).map_err(|_| entry_size_error::<C>("command"))
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.common.opcode
    }

    #[inline]
    pub fn command_id(&self) -> u16 {
        self.common.command_id & COMMAND_ID_MASK
    }

    /// Stamp the command id, preserving the reserved upper bits.
    #[inline]
    pub fn set_command_id(&mut self, id: u16) {
        self.common.command_id = (self.common.command_id & !COMMAND_ID_MASK) | (id & COMMAND_ID_MASK);
    }

    #[inline]
    pub fn flags(&self) -> AqFlags {
        AqFlags::from_bits_truncate(self.common.flags)
    }

    #[inline]
    pub fn phase(&self) -> u8 {
        self.common.flags & PHASE_MASK
    }

    /// Stamp the phase bit, preserving the other flags.
    #[inline]
    pub fn set_phase(&mut self, phase: u8) {
        self.common.flags = (self.common.flags & !PHASE_MASK) | (phase & PHASE_MASK);
    }
}

/// Admin CQ common descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AcqCommonDesc {
    /// Bits 11:0 command id of the SQ entry this completes.
    pub command: u16,
    pub status: u8,
    /// Bit 0 phase.
    pub flags: u8,
    pub extended_status: u16,
    /// SQ entry the device has consumed up to.
    pub sq_head_indx: u16,
}

/// Raw 64-byte admin CQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AcqEntry {
    pub common: AcqCommonDesc,
    pub payload: [u32; 14],
}

impl AcqEntry {
    /// Typed view of the response.
    ///
    /// Fails with `InvalidParameter` if `R` is not exactly one entry long.
    #[inline]
    pub fn to_response<R: Pod>(&self) -> ComResult<R> {
        bytemuck::try_cast(*self).map_err(|_| entry_size_error::<R>("response"))
    }

    /// Raw entry from a typed 64-byte response.
    #[inline]
    pub fn from_response<R: Pod>(response: R) -> ComResult<Self> {
        bytemuck::try_cast(response).map_err(|_| entry_size_error::<R>("response"))
    }

    #[inline]
    pub fn command_id(&self) -> u16 {
        self.common.command & COMMAND_ID_MASK
    }

    #[inline]
    pub fn status(&self) -> AdminStatus {
        AdminStatus::from(self.common.status)
    }

    #[inline]
    pub fn phase(&self) -> u8 {
        self.common.flags & PHASE_MASK
    }
}

/// AENQ common descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AenqCommonDesc {
    pub group: u16,
    pub syndrome: u16,
    /// Bit 0 phase.
    pub flags: u8,
    pub reserved1: [u8; 3],
    pub timestamp_low: u32,
    pub timestamp_high: u32,
}

/// Raw 64-byte AENQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AenqEntry {
    pub common: AenqCommonDesc,
    pub inline_data: [u32; 12],
}

impl AenqEntry {
    #[inline]
    pub fn phase(&self) -> u8 {
        self.common.flags & PHASE_MASK
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.common.timestamp_low as u64 | ((self.common.timestamp_high as u64) << 32)
    }
}

/// DMA address as carried in commands.
///
/// ENA declares the high half as 16 bits followed by 16 reserved bits; with
/// addresses limited to 48 bits both encodings are byte-identical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemAddr {
    pub low: u32,
    pub high: u32,
}

impl MemAddr {
    /// Encode `addr`, rejecting addresses wider than `dma_bits`.
    pub fn new(addr: u64, dma_bits: u8) -> ComResult<Self> {
        if dma_bits < 64 && addr >> dma_bits != 0 {
            log::error!(
                "DMA address {:#x} has more bits than the device supports ({})",
                addr,
                dma_bits
            );
            return Err(ComError::InvalidParameter(format!(
                "DMA address {:#x} exceeds {} bits",
                addr, dma_bits
            )));
        }
        Ok(Self {
            low: addr as u32,
            high: (addr >> 32) as u32,
        })
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.low as u64 | ((self.high as u64) << 32)
    }
}

/// Out-of-line control buffer descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ControlBufferInfo {
    pub length: u32,
    pub address: MemAddr,
}

/// Common header of get/set feature commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FeatureCommonDesc {
    /// Bits 1:0 select (current / supported / default).
    pub flags: u8,
    pub feature_id: u8,
    pub feature_version: u8,
    pub reserved: u8,
}

/// Get/set feature command; identical in both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FeatureCmd {
    pub common: AqCommonDesc,
    pub control_buffer: ControlBufferInfo,
    pub feat_common: FeatureCommonDesc,
    /// Feature-specific payload (set feature only).
    pub raw: [u32; 11],
}

impl FeatureCmd {
    pub fn new(opcode: u8, feature_id: u8, feature_version: u8) -> Self {
        let mut cmd = Self::zeroed();
        cmd.common.opcode = opcode;
        cmd.feat_common.feature_id = feature_id;
        cmd.feat_common.feature_version = feature_version;
        cmd
    }

    /// Attach an out-of-line control buffer.
    pub fn set_control_buffer(&mut self, address: MemAddr, length: u32) {
        self.common.flags |= AqFlags::CTRL_DATA_INDIRECT.bits();
        self.control_buffer = ControlBufferInfo { length, address };
    }
}

/// Get feature response: common descriptor plus the raw feature body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FeatureResp {
    pub common: AcqCommonDesc,
    pub raw: [u32; 14],
}

impl FeatureResp {
    /// View the feature body as a typed descriptor of at most 56 bytes.
    pub fn body<T: Pod>(&self) -> T {
        let bytes: &[u8] = bytemuck::cast_slice(&self.raw);
        let size = std::mem::size_of::<T>();
        debug_assert!(size <= bytes.len());
        bytemuck::pod_read_unaligned(&bytes[..size.min(bytes.len())])
    }

    /// Store a typed descriptor into the feature body.
    pub fn set_body<T: Pod>(&mut self, body: &T) {
        let src = bytemuck::bytes_of(body);
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut self.raw);
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
    }
}

impl FeatureCmd {
    /// View the set-feature payload as a typed descriptor of at most 44 bytes.
    pub fn body<T: Pod>(&self) -> T {
        let bytes: &[u8] = bytemuck::cast_slice(&self.raw);
        let size = std::mem::size_of::<T>();
        debug_assert!(size <= bytes.len());
        bytemuck::pod_read_unaligned(&bytes[..size.min(bytes.len())])
    }

    /// Store a typed descriptor into the set-feature payload.
    pub fn set_body<T: Pod>(&mut self, body: &T) {
        let src = bytemuck::bytes_of(body);
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut self.raw);
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
    }
}

// Compile-time size checks against the ring ABI.
const _: () = assert!(std::mem::size_of::<AqCommonDesc>() == 4);
const _: () = assert!(std::mem::size_of::<AqEntry>() == ENTRY_SIZE);
const _: () = assert!(std::mem::size_of::<AcqCommonDesc>() == 8);
const _: () = assert!(std::mem::size_of::<AcqEntry>() == ENTRY_SIZE);
const _: () = assert!(std::mem::size_of::<AenqCommonDesc>() == 16);
const _: () = assert!(std::mem::size_of::<AenqEntry>() == ENTRY_SIZE);
const _: () = assert!(std::mem::size_of::<ControlBufferInfo>() == 12);
const _: () = assert!(std::mem::size_of::<FeatureCmd>() == ENTRY_SIZE);
const _: () = assert!(std::mem::size_of::<FeatureResp>() == ENTRY_SIZE);
