// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of an ENA/EFA device.
//!
//! The model implements [`RegisterSpace`] and [`DeviceMemory`] and answers
//! the ring protocol synchronously: writing `AQ_DB` executes every new admin
//! command and posts its completion before the write returns. DMA addresses
//! are host virtual addresses, as handed out by
//! [`crate::dma::HostDmaAllocator`].
//!
//! Knobs on [`SimDevice`] inject the failure modes the core has to survive:
//! stalled or reordered completions, lost interrupts, stuck resets, muted
//! readless responses and device error statuses.

use crate::aenq::AenqConfig;
use crate::descriptor::{
    AcqEntry, AenqCommonDesc, AenqEntry, AqEntry, AqFlags, FeatureCmd, FeatureResp,
    ACQ_PHASE_OFFSET, AENQ_PHASE_OFFSET, ENTRY_SIZE, PHASE_MASK,
};
use crate::efa;
use crate::ena::{self, features as ena_features};
use crate::io_queue::TxCompletion;
use crate::lock;
use crate::mmio::ReadlessResponse;
use crate::regs::{self, DevControl, DevStatus, DeviceMemory, RegisterSpace};
use crate::ring::RingCursor;
use bytemuck::{Pod, Zeroable};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

type IrqHook = Arc<dyn Fn() + Send + Sync>;

const STATUS_RESOURCE_ALLOCATION_FAILURE: u8 = 1;
const STATUS_BAD_OPCODE: u8 = 2;
const STATUS_UNSUPPORTED_OPCODE: u8 = 3;
const STATUS_MALFORMED_REQUEST: u8 = 4;
const STATUS_ILLEGAL_PARAMETER: u8 = 5;

const IO_QUEUE_SLOTS: usize = 32;
const PD_SLOTS: usize = 16;

/// Register offsets handed out for I/O queues.
const SQ_DOORBELL_BASE: u32 = 0x2000;
const CQ_UNMASK_BASE: u32 = 0x3000;
const EFA_CQ_DOORBELL_BASE: u32 = 0x4000;
const LLQ_QUEUE_STRIDE: u32 = 0x1_0000;

const ENA_MAX_MTU: u32 = 9216;
const ENA_SUPPORTED_FEATURES: u32 = (1 << ena::FeatureId::DeviceAttributes as u32)
    | (1 << ena::FeatureId::MaxQueuesNum as u32)
    | (1 << ena::FeatureId::HwHints as u32)
    | (1 << ena::FeatureId::Llq as u32)
    | (1 << ena::FeatureId::StatelessOffload as u32)
    | (1 << ena::FeatureId::Mtu as u32)
    | (1 << ena::FeatureId::AenqConfig as u32);
const EFA_SUPPORTED_FEATURES: u32 = (1 << efa::FeatureId::DeviceAttr as u32)
    | (1 << efa::FeatureId::AenqConfig as u32)
    | (1 << efa::FeatureId::HwHints as u32);
/// Link change, fatal error, warning, notification and keep-alive.
const SUPPORTED_AENQ_GROUPS: u32 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Ena,
    Efa,
}

/// Write `bytes` into host memory at `addr`; the byte at `phase_offset` is
/// written last, after a release fence.
fn dma_write(addr: u64, bytes: &[u8], phase_offset: Option<usize>) {
    let ptr = addr as *mut u8;
    for (i, byte) in bytes.iter().enumerate() {
        if Some(i) != phase_offset {
            // SAFETY: `addr` was programmed by the driver and points at a
            // live host DMA buffer of at least `bytes.len()` bytes.
            unsafe { ptr.add(i).write_volatile(*byte) };
        }
    }
    if let Some(i) = phase_offset {
        fence(Ordering::Release);
        // SAFETY: as above.
        unsafe { ptr.add(i).write_volatile(bytes[i]) };
    }
}

fn dma_read<T: Pod>(addr: u64) -> T {
    let mut value = T::zeroed();
    let ptr = addr as *const u8;
    for (i, byte) in bytemuck::bytes_of_mut(&mut value).iter_mut().enumerate() {
        // SAFETY: `addr` was programmed by the driver and points at a live
        // host DMA buffer holding a `T`.
        *byte = unsafe { ptr.add(i).read_volatile() };
    }
    value
}

/// Typed command from an admin entry; a malformed entry is a bad request.
fn decode<C: Pod>(entry: &AqEntry) -> Result<C, u8> {
    entry.to_command().map_err(|_| STATUS_MALFORMED_REQUEST)
}

fn encode<R: Pod>(response: R) -> Result<AcqEntry, u8> {
    AcqEntry::from_response(response).map_err(|_| STATUS_MALFORMED_REQUEST)
}

/// A ring the device reads from or writes to.
#[derive(Debug)]
struct SimRing {
    base: u64,
    cursor: RingCursor,
}

#[derive(Debug)]
struct SimCq {
    ring: SimRing,
    entry_size: usize,
}

struct SimState {
    family: Family,
    regs: HashMap<u32, u32>,

    version: u32,
    controller_version: u32,
    ready: bool,
    reset_in_progress: bool,
    reset_stuck: bool,
    reset_timeout_units: u32,
    admin_timeout_units: u32,
    dma_width: u8,
    resets: usize,
    last_reset_reason: Option<u8>,

    readless_requests: usize,
    direct_reads: usize,
    readless_mute: bool,
    readless_offset_skew: u16,

    admin_sq: Option<SimRing>,
    admin_cq: Option<SimRing>,
    admin_doorbells: usize,
    admin_stall: bool,
    held: Vec<AcqEntry>,
    drop_admin_irq: bool,
    admin_irq: Option<IrqHook>,
    failures: HashMap<u8, u8>,
    admin_commands: Vec<u8>,

    supported_features: u32,
    supported_aenq_groups: u32,
    enabled_aenq_groups: u32,
    mtu: u32,

    aenq: Option<SimRing>,
    aenq_head: u16,
    aenq_head_doorbells: usize,
    aenq_backlog: VecDeque<AenqEntry>,
    aenq_irq: Option<IrqHook>,
    timestamp: u64,

    io_sqs: Vec<Option<u16>>,
    io_cqs: Vec<Option<SimCq>>,
    pds: Vec<bool>,
    llq: Vec<u8>,
}

impl SimState {
    fn new(family: Family) -> Self {
        let (version, supported_features) = match family {
            Family::Ena => (0x0203, ENA_SUPPORTED_FEATURES),
            Family::Efa => (0x0001, EFA_SUPPORTED_FEATURES),
        };
        Self {
            family,
            regs: HashMap::new(),
            version,
            controller_version: 0x0100_0102,
            ready: true,
            reset_in_progress: false,
            reset_stuck: false,
            reset_timeout_units: 2,
            admin_timeout_units: 0,
            dma_width: 48,
            resets: 0,
            last_reset_reason: None,
            readless_requests: 0,
            direct_reads: 0,
            readless_mute: false,
            readless_offset_skew: 0,
            admin_sq: None,
            admin_cq: None,
            admin_doorbells: 0,
            admin_stall: false,
            held: Vec::new(),
            drop_admin_irq: false,
            admin_irq: None,
            failures: HashMap::new(),
            admin_commands: Vec::new(),
            supported_features,
            supported_aenq_groups: SUPPORTED_AENQ_GROUPS,
            enabled_aenq_groups: 0,
            mtu: 1500,
            aenq: None,
            aenq_head: 0,
            aenq_head_doorbells: 0,
            aenq_backlog: VecDeque::new(),
            aenq_irq: None,
            timestamp: 0,
            io_sqs: vec![None; IO_QUEUE_SLOTS],
            io_cqs: (0..IO_QUEUE_SLOTS).map(|_| None).collect(),
            pds: vec![false; PD_SLOTS],
            llq: Vec::new(),
        }
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn reg_addr(&self, lo: u32, hi: u32) -> u64 {
        self.reg(lo) as u64 | ((self.reg(hi) as u64) << 32)
    }

    fn read_register(&self, offset: u32) -> u32 {
        match offset {
            regs::VERSION => self.version,
            regs::CONTROLLER_VERSION => self.controller_version,
            regs::CAPS => {
                ((self.reset_timeout_units << regs::CAPS_RESET_TIMEOUT_SHIFT)
                    & regs::CAPS_RESET_TIMEOUT_MASK)
                    | ((self.dma_width as u32) << regs::CAPS_DMA_ADDR_WIDTH_SHIFT)
                    | ((self.admin_timeout_units << regs::CAPS_ADMIN_CMD_TO_SHIFT)
                        & regs::CAPS_ADMIN_CMD_TO_MASK)
            }
            regs::DEV_STS => {
                let mut status = DevStatus::empty();
                status.set(DevStatus::READY, self.ready);
                status.set(DevStatus::RESET_IN_PROGRESS, self.reset_in_progress);
                status.bits()
            }
            regs::ACQ_TAIL => self
                .admin_cq
                .as_ref()
                .map_or(0, |ring| ring.cursor.counter() as u32),
            regs::AENQ_TAIL => self
                .aenq
                .as_ref()
                .map_or(0, |ring| ring.cursor.counter() as u32),
            _ => self.reg(offset),
        }
    }

    fn new_ring(&self, caps: u32, lo: u32, hi: u32) -> Option<SimRing> {
        let depth = (caps & regs::QUEUE_CAPS_DEPTH_MASK) as u16;
        let base = self.reg_addr(lo, hi);
        (depth.is_power_of_two() && base != 0).then(|| SimRing {
            base,
            cursor: RingCursor::new(depth),
        })
    }

    fn device_reset(&mut self, value: u32) {
        self.resets += 1;
        self.last_reset_reason = Some(
            ((value & regs::DEV_CTL_RESET_REASON_MASK) >> regs::DEV_CTL_RESET_REASON_SHIFT) as u8,
        );
        if self.reset_stuck {
            return;
        }
        self.reset_in_progress = true;
        self.admin_sq = None;
        self.admin_cq = None;
        self.held.clear();
        self.aenq = None;
        self.aenq_head = 0;
        self.aenq_backlog.clear();
        self.enabled_aenq_groups = 0;
        self.regs.remove(&regs::MMIO_RESP_LO);
        self.regs.remove(&regs::MMIO_RESP_HI);
        self.io_sqs.iter_mut().for_each(|sq| *sq = None);
        self.io_cqs.iter_mut().for_each(|cq| *cq = None);
        self.pds.iter_mut().for_each(|pd| *pd = false);
    }

    fn readless_read(&mut self, request: u32) {
        self.readless_requests += 1;
        let addr = self.reg_addr(regs::MMIO_RESP_LO, regs::MMIO_RESP_HI);
        if self.readless_mute || addr == 0 {
            return;
        }
        let offset = (request & regs::MMIO_REG_READ_REG_OFF_MASK) >> regs::MMIO_REG_READ_REG_OFF_SHIFT;
        let response = ReadlessResponse {
            req_id: (request & regs::MMIO_REG_READ_REQ_ID_MASK) as u16,
            reg_off: (offset as u16).wrapping_add(self.readless_offset_skew),
            reg_val: self.read_register(offset),
        };
        // Value first, request id last.
        let bytes = bytemuck::bytes_of(&response);
        dma_write(addr + 2, &bytes[2..], None);
        fence(Ordering::Release);
        dma_write(addr, &bytes[..2], None);
    }

    // ========================================================================
    // Admin queue
    // ========================================================================

    fn post_admin_completion(&mut self, mut entry: AcqEntry) -> bool {
        let Some(cq) = self.admin_cq.as_mut() else {
            return false;
        };
        entry.common.flags = (entry.common.flags & !PHASE_MASK) | cq.cursor.current_phase();
        let addr = cq.base + cq.cursor.index() as u64 * ENTRY_SIZE as u64;
        dma_write(addr, bytemuck::bytes_of(&entry), Some(ACQ_PHASE_OFFSET));
        cq.cursor.advance();
        true
    }

    /// Execute commands up to the new tail. Returns whether a completion was
    /// posted.
    fn process_admin(&mut self, tail: u16) -> bool {
        let mut posted = false;
        loop {
            let Some(sq) = self.admin_sq.as_mut() else {
                break;
            };
            if sq.cursor.counter() == tail {
                break;
            }
            let addr = sq.base + sq.cursor.index() as u64 * ENTRY_SIZE as u64;
            let entry: AqEntry = dma_read(addr);
            sq.cursor.advance();
            let head = sq.cursor.counter();

            let mut response = self.execute(&entry);
            response.common.command = entry.common.command_id;
            response.common.sq_head_indx = head;

            if self.admin_stall {
                self.held.push(response);
            } else {
                posted |= self.post_admin_completion(response);
            }
        }
        posted
    }

    fn execute(&mut self, entry: &AqEntry) -> AcqEntry {
        let opcode = entry.opcode();
        self.admin_commands.push(opcode);

        let result = match self.failures.get(&opcode) {
            Some(status) => Err(*status),
            None => match self.family {
                Family::Ena => self.execute_ena(entry),
                Family::Efa => self.execute_efa(entry),
            },
        };
        match result {
            Ok(response) => response,
            Err(status) => {
                let mut response = AcqEntry::zeroed();
                response.common.status = status;
                response
            }
        }
    }

    fn execute_ena(&mut self, entry: &AqEntry) -> Result<AcqEntry, u8> {
        match ena::AdminOpcode::from_u8(entry.opcode()) {
            Some(ena::AdminOpcode::GetFeature) => self.get_feature(entry),
            Some(ena::AdminOpcode::SetFeature) => self.set_feature(entry),
            Some(ena::AdminOpcode::CreateCq) => {
                let cmd: ena::CreateCqCmd = decode(entry)?;
                let entry_size = (cmd.cq_caps_2 & 0x1f) as usize * 4;
                let idx = self.create_cq(cmd.cq_ba.addr(), cmd.cq_depth, entry_size)?;
                let mut resp = ena::CreateCqResp::zeroed();
                resp.cq_idx = idx;
                resp.cq_actual_depth = cmd.cq_depth;
                resp.cq_interrupt_unmask_register_offset = CQ_UNMASK_BASE + idx as u32 * 4;
                encode(resp)
            }
            Some(ena::AdminOpcode::CreateSq) => {
                let cmd: ena::CreateSqCmd = decode(entry)?;
                let bound = self
                    .io_cqs
                    .get(cmd.cq_idx as usize)
                    .is_some_and(Option::is_some);
                if !bound || !cmd.sq_depth.is_power_of_two() {
                    return Err(STATUS_ILLEGAL_PARAMETER);
                }
                let idx = self
                    .io_sqs
                    .iter()
                    .position(Option::is_none)
                    .ok_or(STATUS_RESOURCE_ALLOCATION_FAILURE)?;
                self.io_sqs[idx] = Some(cmd.cq_idx);
                let mut resp = ena::CreateSqResp::zeroed();
                resp.sq_idx = idx as u16;
                resp.sq_doorbell_offset = SQ_DOORBELL_BASE + idx as u32 * 4;
                resp.llq_descriptors_offset = idx as u32 * LLQ_QUEUE_STRIDE;
                encode(resp)
            }
            Some(ena::AdminOpcode::DestroySq) => {
                let cmd: ena::DestroySqCmd = decode(entry)?;
                match self.io_sqs.get_mut(cmd.sq_idx as usize) {
                    Some(slot @ Some(_)) => {
                        *slot = None;
                        Ok(AcqEntry::zeroed())
                    }
                    _ => Err(STATUS_ILLEGAL_PARAMETER),
                }
            }
            Some(ena::AdminOpcode::DestroyCq) => {
                let cmd: ena::DestroyCqCmd = decode(entry)?;
                if self.io_sqs.iter().any(|sq| *sq == Some(cmd.cq_idx)) {
                    return Err(STATUS_ILLEGAL_PARAMETER);
                }
                self.destroy_cq(cmd.cq_idx)
            }
            Some(ena::AdminOpcode::GetStats) | None => Err(STATUS_UNSUPPORTED_OPCODE),
        }
    }

    fn execute_efa(&mut self, entry: &AqEntry) -> Result<AcqEntry, u8> {
        match efa::AdminOpcode::from_u8(entry.opcode()) {
            Some(efa::AdminOpcode::GetFeature) => self.get_feature(entry),
            Some(efa::AdminOpcode::SetFeature) => self.set_feature(entry),
            Some(efa::AdminOpcode::CreateCq) => {
                let cmd: efa::CreateCqCmd = decode(entry)?;
                let entry_size = (cmd.cq_caps_2 & 0x1f) as usize * 4;
                let idx = self.create_cq(cmd.cq_ba.addr(), cmd.cq_depth, entry_size)?;
                let mut resp = efa::CreateCqResp::zeroed();
                resp.cq_idx = idx;
                resp.cq_actual_depth = cmd.cq_depth;
                resp.db_offset = EFA_CQ_DOORBELL_BASE + idx as u32 * 4;
                encode(resp)
            }
            Some(efa::AdminOpcode::DestroyCq) => {
                let cmd: efa::DestroyCqCmd = decode(entry)?;
                self.destroy_cq(cmd.cq_idx)
            }
            Some(efa::AdminOpcode::AllocPd) => {
                let pdn = self
                    .pds
                    .iter()
                    .position(|used| !used)
                    .ok_or(STATUS_RESOURCE_ALLOCATION_FAILURE)?;
                self.pds[pdn] = true;
                let mut resp = efa::AllocPdResp::zeroed();
                resp.pdn = pdn as u16;
                encode(resp)
            }
            Some(efa::AdminOpcode::DeallocPd) => {
                let cmd: efa::DeallocPdCmd = decode(entry)?;
                match self.pds.get_mut(cmd.pdn as usize) {
                    Some(used) if *used => {
                        *used = false;
                        Ok(AcqEntry::zeroed())
                    }
                    _ => Err(STATUS_BAD_OPCODE),
                }
            }
            None => Err(STATUS_UNSUPPORTED_OPCODE),
        }
    }

    fn create_cq(&mut self, base: u64, depth: u16, entry_size: usize) -> Result<u16, u8> {
        if base == 0 || entry_size == 0 || !depth.is_power_of_two() {
            return Err(STATUS_MALFORMED_REQUEST);
        }
        let idx = self
            .io_cqs
            .iter()
            .position(Option::is_none)
            .ok_or(STATUS_RESOURCE_ALLOCATION_FAILURE)?;
        self.io_cqs[idx] = Some(SimCq {
            ring: SimRing {
                base,
                cursor: RingCursor::new(depth),
            },
            entry_size,
        });
        Ok(idx as u16)
    }

    fn destroy_cq(&mut self, idx: u16) -> Result<AcqEntry, u8> {
        match self.io_cqs.get_mut(idx as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(AcqEntry::zeroed())
            }
            _ => Err(STATUS_ILLEGAL_PARAMETER),
        }
    }

    // ========================================================================
    // Features
    // ========================================================================

    fn is_supported(&self, feature_id: u8) -> bool {
        feature_id == 1 || (feature_id < 32 && self.supported_features & (1 << feature_id) != 0)
    }

    fn feature_body(&self, feature_id: u8) -> Result<FeatureResp, u8> {
        let mut resp = FeatureResp::zeroed();
        let aenq = AenqConfig {
            supported_groups: self.supported_aenq_groups,
            enabled_groups: self.enabled_aenq_groups,
        };
        match (self.family, feature_id) {
            (Family::Ena, id) if id == ena::FeatureId::DeviceAttributes as u8 => {
                resp.set_body(&ena_features::DeviceAttributes {
                    device_version: self.version,
                    supported_features: self.supported_features,
                    phys_addr_width: self.dma_width as u32,
                    virt_addr_width: 48,
                    mac_addr: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
                    max_mtu: ENA_MAX_MTU,
                    ..Default::default()
                })
            }
            (Family::Ena, id) if id == ena::FeatureId::MaxQueuesNum as u8 => {
                resp.set_body(&ena_features::MaxQueues {
                    max_sq_num: IO_QUEUE_SLOTS as u32,
                    max_sq_depth: 1024,
                    max_cq_num: IO_QUEUE_SLOTS as u32,
                    max_cq_depth: 1024,
                    max_legacy_llq_num: 8,
                    max_legacy_llq_depth: 128,
                    max_header_size: 128,
                    max_packet_tx_descs: 19,
                    max_packet_rx_descs: 1,
                })
            }
            (Family::Ena, id) if id == ena::FeatureId::HwHints as u8 => {
                resp.set_body(&ena_features::HwHints {
                    mmio_read_timeout: 300,
                    driver_watchdog_timeout: 6000,
                    missing_tx_completion_timeout: 5000,
                    missed_tx_completion_count_threshold_to_reset: 128,
                    admin_completion_tx_timeout: 4000,
                    netdev_wd_timeout: 5000,
                    max_tx_sgl_size: 17,
                    max_rx_sgl_size: 1,
                    ..Default::default()
                })
            }
            (Family::Ena, id) if id == ena::FeatureId::Llq as u8 => {
                resp.set_body(&ena_features::LlqFeature {
                    max_llq_num: 8,
                    max_llq_depth: 128,
                    entry_size_ctrl_supported: 0x7,
                    entry_size_ctrl_enabled: 0x1,
                    ..Default::default()
                })
            }
            (Family::Ena, id) if id == ena::FeatureId::StatelessOffload as u8 => {
                resp.set_body(&ena_features::StatelessOffload {
                    tx: 0x3,
                    rx_supported: 0x3,
                    rx_enabled: 0,
                })
            }
            (Family::Ena, id) if id == ena::FeatureId::AenqConfig as u8 => resp.set_body(&aenq),
            (Family::Efa, id) if id == efa::FeatureId::DeviceAttr as u8 => {
                resp.set_body(&efa::DeviceAttr {
                    page_size_cap: 0x1000,
                    fw_version: 0x0100_0000,
                    admin_api_version: 1,
                    device_version: self.version,
                    supported_features: self.supported_features,
                    db_bar: 2,
                    phys_addr_width: self.dma_width,
                    virt_addr_width: 48,
                    device_caps: 0,
                    max_rdma_size: 1 << 30,
                    max_pd: PD_SLOTS as u32,
                })
            }
            (Family::Efa, id) if id == efa::FeatureId::AenqConfig as u8 => resp.set_body(&aenq),
            (Family::Efa, id) if id == efa::FeatureId::HwHints as u8 => {
                resp.set_body(&efa::HwHints {
                    mmio_read_timeout: 300,
                    driver_watchdog_timeout: 6000,
                    admin_completion_timeout: 3000,
                    poll_interval: 1,
                })
            }
            _ => return Err(STATUS_UNSUPPORTED_OPCODE),
        }
        Ok(resp)
    }

    fn get_feature(&mut self, entry: &AqEntry) -> Result<AcqEntry, u8> {
        let cmd: FeatureCmd = decode(entry)?;
        let feature_id = cmd.feat_common.feature_id;
        if !self.is_supported(feature_id) {
            return Err(STATUS_UNSUPPORTED_OPCODE);
        }
        let resp = self.feature_body(feature_id)?;

        if entry.flags().contains(AqFlags::CTRL_DATA_INDIRECT) {
            let addr = cmd.control_buffer.address.addr();
            let body = bytemuck::bytes_of(&resp.raw);
            let len = (cmd.control_buffer.length as usize).min(body.len());
            if addr != 0 {
                dma_write(addr, &body[..len], None);
            }
        }
        encode(resp)
    }

    fn set_feature(&mut self, entry: &AqEntry) -> Result<AcqEntry, u8> {
        let cmd: FeatureCmd = decode(entry)?;
        let feature_id = cmd.feat_common.feature_id;
        if !self.is_supported(feature_id) {
            return Err(STATUS_UNSUPPORTED_OPCODE);
        }
        let aenq_feature = match self.family {
            Family::Ena => ena::FeatureId::AenqConfig as u8,
            Family::Efa => efa::FeatureId::AenqConfig as u8,
        };

        if feature_id == aenq_feature {
            let config: AenqConfig = cmd.body();
            if config.enabled_groups & !self.supported_aenq_groups != 0 {
                return Err(STATUS_ILLEGAL_PARAMETER);
            }
            self.enabled_aenq_groups = config.enabled_groups;
        } else if self.family == Family::Ena && feature_id == ena::FeatureId::Mtu as u8 {
            let mtu: ena_features::Mtu = cmd.body();
            if mtu.mtu > ENA_MAX_MTU {
                return Err(STATUS_ILLEGAL_PARAMETER);
            }
            self.mtu = mtu.mtu;
        } else {
            return Err(STATUS_UNSUPPORTED_OPCODE);
        }
        Ok(AcqEntry::zeroed())
    }

    // ========================================================================
    // AENQ
    // ========================================================================

    fn try_post_aenq(&mut self, mut entry: AenqEntry) -> Result<(), AenqEntry> {
        let head = self.aenq_head;
        let Some(ring) = self.aenq.as_mut() else {
            return Err(entry);
        };
        if head.wrapping_sub(ring.cursor.counter()) == 0 {
            return Err(entry);
        }
        entry.common.flags = (entry.common.flags & !PHASE_MASK) | ring.cursor.current_phase();
        let addr = ring.base + ring.cursor.index() as u64 * ENTRY_SIZE as u64;
        dma_write(addr, bytemuck::bytes_of(&entry), Some(AENQ_PHASE_OFFSET));
        ring.cursor.advance();
        Ok(())
    }

    /// Post backlogged events into freed slots. Returns the number posted.
    fn flush_aenq_backlog(&mut self) -> usize {
        let mut posted = 0;
        while let Some(entry) = self.aenq_backlog.pop_front() {
            if let Err(entry) = self.try_post_aenq(entry) {
                self.aenq_backlog.push_front(entry);
                break;
            }
            posted += 1;
        }
        posted
    }
}

/// Software ENA/EFA device.
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    /// An ENA device with default registers and features.
    pub fn ena() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new(Family::Ena)),
        })
    }

    /// An EFA device with default registers and features.
    pub fn efa() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new(Family::Efa)),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    // ------------------------------------------------------------------------
    // Registers, reset and readless
    // ------------------------------------------------------------------------

    pub fn version(&self) -> u32 {
        self.state().version
    }

    pub fn set_version(&self, version: u32) {
        self.state().version = version;
    }

    pub fn controller_version(&self) -> u32 {
        self.state().controller_version
    }

    pub fn set_controller_version(&self, version: u32) {
        self.state().controller_version = version;
    }

    pub fn set_ready(&self, ready: bool) {
        self.state().ready = ready;
    }

    /// Ignore reset requests: RESET_IN_PROGRESS never comes up.
    pub fn set_reset_stuck(&self, stuck: bool) {
        self.state().reset_stuck = stuck;
    }

    pub fn set_dma_width(&self, width: u8) {
        self.state().dma_width = width;
    }

    /// Reset timeout field of CAPS, in 100 ms units.
    pub fn set_reset_timeout_caps(&self, units: u32) {
        self.state().reset_timeout_units = units;
    }

    /// Admin command timeout field of CAPS, in 100 ms units.
    pub fn set_admin_timeout_caps(&self, units: u32) {
        self.state().admin_timeout_units = units;
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn last_reset_reason(&self) -> Option<u8> {
        self.state().last_reset_reason
    }

    pub fn readless_requests(&self) -> usize {
        self.state().readless_requests
    }

    /// Register loads performed through [`RegisterSpace::read32`].
    pub fn direct_reads(&self) -> usize {
        self.state().direct_reads
    }

    /// Swallow readless requests without answering.
    pub fn set_readless_mute(&self, mute: bool) {
        self.state().readless_mute = mute;
    }

    /// Answer readless requests with a wrong register offset.
    pub fn set_readless_offset_skew(&self, skew: u16) {
        self.state().readless_offset_skew = skew;
    }

    /// Last value written to `offset`.
    pub fn register_value(&self, offset: u32) -> Option<u32> {
        self.state().regs.get(&offset).copied()
    }

    pub fn intr_mask(&self) -> u32 {
        self.state().reg(regs::INTR_MASK)
    }

    // ------------------------------------------------------------------------
    // Admin queue
    // ------------------------------------------------------------------------

    /// Called after admin completions are posted.
    pub fn set_admin_irq(&self, irq: impl Fn() + Send + Sync + 'static) {
        self.state().admin_irq = Some(Arc::new(irq));
    }

    /// Called after AENQ events are posted.
    pub fn set_aenq_irq(&self, irq: impl Fn() + Send + Sync + 'static) {
        self.state().aenq_irq = Some(Arc::new(irq));
    }

    /// Execute commands but hold their completions back.
    pub fn set_admin_stall(&self, stall: bool) {
        self.state().admin_stall = stall;
    }

    /// Post every held completion, in reverse submission order if asked,
    /// then raise the admin interrupt. Returns the number posted.
    pub fn release_held_completions(&self, reverse: bool) -> usize {
        let irq = {
            let mut state = self.state();
            let mut held = std::mem::take(&mut state.held);
            if reverse {
                held.reverse();
            }
            let count = held.len();
            for entry in held {
                state.post_admin_completion(entry);
            }
            if count == 0 || state.drop_admin_irq {
                return count;
            }
            (state.admin_irq.clone(), count)
        };
        if let Some(hook) = irq.0 {
            hook();
        }
        irq.1
    }

    pub fn admin_doorbells(&self) -> usize {
        self.state().admin_doorbells
    }

    /// Post completions without raising the interrupt.
    pub fn set_drop_admin_irq(&self, drop: bool) {
        self.state().drop_admin_irq = drop;
    }

    /// Post a completion for a command that was never submitted.
    pub fn inject_admin_completion(&self, cmd_id: u16, status: u8) {
        let mut entry = AcqEntry::zeroed();
        entry.common.command = cmd_id;
        entry.common.status = status;
        self.state().post_admin_completion(entry);
    }

    /// Answer every command with `opcode` with `status`.
    pub fn fail_opcode(&self, opcode: u8, status: u8) {
        self.state().failures.insert(opcode, status);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Opcodes of every executed admin command, in order.
    pub fn admin_commands(&self) -> Vec<u8> {
        self.state().admin_commands.clone()
    }

    // ------------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------------

    pub fn max_mtu(&self) -> u32 {
        ENA_MAX_MTU
    }

    pub fn mtu(&self) -> u32 {
        self.state().mtu
    }

    pub fn supported_features(&self) -> u32 {
        self.state().supported_features
    }

    pub fn set_supported_features(&self, features: u32) {
        self.state().supported_features = features;
    }

    pub fn supported_aenq_groups(&self) -> u32 {
        self.state().supported_aenq_groups
    }

    pub fn enabled_aenq_groups(&self) -> u32 {
        self.state().enabled_aenq_groups
    }

    // ------------------------------------------------------------------------
    // AENQ
    // ------------------------------------------------------------------------

    /// Post an event, or backlog it while the ring is full.
    pub fn post_aenq_event(&self, group: u16, syndrome: u16, data: [u32; 12]) {
        let irq = {
            let mut state = self.state();
            state.timestamp += 1;
            let entry = AenqEntry {
                common: AenqCommonDesc {
                    group,
                    syndrome,
                    timestamp_low: state.timestamp as u32,
                    timestamp_high: (state.timestamp >> 32) as u32,
                    ..AenqCommonDesc::default()
                },
                inline_data: data,
            };
            state.aenq_backlog.push_back(entry);
            if state.flush_aenq_backlog() == 0 {
                return;
            }
            state.aenq_irq.clone()
        };
        if let Some(hook) = irq {
            hook();
        }
    }

    pub fn aenq_backlog(&self) -> usize {
        self.state().aenq_backlog.len()
    }

    pub fn aenq_head_doorbells(&self) -> usize {
        self.state().aenq_head_doorbells
    }

    /// Last head counter the host reported.
    pub fn aenq_head(&self) -> u16 {
        self.state().aenq_head
    }

    // ------------------------------------------------------------------------
    // I/O queues
    // ------------------------------------------------------------------------

    /// Bytes of the LLQ memory BAR.
    pub fn llq_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state();
        (0..len)
            .map(|i| state.llq.get(offset as usize + i).copied().unwrap_or(0))
            .collect()
    }

    pub fn active_io_sqs(&self) -> usize {
        self.state().io_sqs.iter().filter(|sq| sq.is_some()).count()
    }

    pub fn active_io_cqs(&self) -> usize {
        self.state().io_cqs.iter().filter(|cq| cq.is_some()).count()
    }

    pub fn active_pds(&self) -> usize {
        self.state().pds.iter().filter(|used| **used).count()
    }

    /// Write a Tx completion for `req_id` into CQ `cq_idx`.
    pub fn post_io_tx_completion(&self, cq_idx: u16, req_id: u16) {
        let mut state = self.state();
        let Some(Some(cq)) = state.io_cqs.get_mut(cq_idx as usize) else {
            return;
        };
        let completion = TxCompletion {
            req_id,
            flags: cq.ring.cursor.current_phase(),
            ..TxCompletion::default()
        };
        let addr = cq.ring.base + cq.ring.cursor.index() as u64 * cq.entry_size as u64;
        dma_write(addr, bytemuck::bytes_of(&completion), Some(3));
        cq.ring.cursor.advance();
    }
}

impl RegisterSpace for SimDevice {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.state();
        state.direct_reads += 1;
        state.read_register(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut irq = None;
        {
            let mut state = self.state();
            state.regs.insert(offset, value);
            match offset {
                regs::AQ_CAPS => {
                    state.admin_sq = state.new_ring(value, regs::AQ_BASE_LO, regs::AQ_BASE_HI);
                }
                regs::ACQ_CAPS => {
                    state.admin_cq = state.new_ring(value, regs::ACQ_BASE_LO, regs::ACQ_BASE_HI);
                }
                regs::AQ_DB => {
                    state.admin_doorbells += 1;
                    if state.process_admin(value as u16) && !state.drop_admin_irq {
                        irq = state.admin_irq.clone();
                    }
                }
                regs::AENQ_CAPS => {
                    state.aenq = state.new_ring(value, regs::AENQ_BASE_LO, regs::AENQ_BASE_HI);
                }
                regs::AENQ_HEAD_DB => {
                    state.aenq_head = value as u16;
                    state.aenq_head_doorbells += 1;
                    if state.flush_aenq_backlog() > 0 {
                        irq = state.aenq_irq.clone();
                    }
                }
                regs::DEV_CTL => {
                    if value & DevControl::DEV_RESET.bits() != 0 {
                        state.device_reset(value);
                    } else if value == 0 {
                        state.reset_in_progress = false;
                    }
                }
                regs::MMIO_REG_READ => state.readless_read(value),
                _ => {}
            }
        }
        if let Some(hook) = irq {
            hook();
        }
    }
}

impl DeviceMemory for SimDevice {
    fn write_bytes(&self, offset: u64, data: &[u8]) {
        let mut state = self.state();
        let start = offset as usize;
        let end = start + data.len();
        if state.llq.len() < end {
            state.llq.resize(end, 0);
        }
        state.llq[start..end].copy_from_slice(data);
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SimDevice")
            .field("family", &state.family)
            .field("resets", &state.resets)
            .field("admin_doorbells", &state.admin_doorbells)
            .field("held", &state.held.len())
            .finish_non_exhaustive()
    }
}
