// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! ENA I/O queue creation and destruction.
//!
//! A queue pair is created CQ first, then the SQ bound to it. A failure at
//! any step destroys the device objects already created and frees the rings.
//! Destruction runs in the opposite order and frees the rings even when a
//! caller still holds the pair.

use super::{AdminOpcode, EnaDevice};
use crate::descriptor::{AcqCommonDesc, AcqEntry, AqCommonDesc, MemAddr};
use crate::device::DeviceState;
use crate::dma::DmaBuffer;
use crate::error::{ComError, ComResult};
use crate::io_queue::{
    Direction, IoCq, IoQueuePair, IoSq, LlqBouncePool, Placement, SqMemory, IO_SQ_DESC_SIZE,
};
use crate::lock;
use bytemuck::{Pod, Zeroable};
use std::sync::{Arc, Mutex};

/// `sq_identity` bits 7:5 carry the direction.
const SQ_DIRECTION_SHIFT: u8 = 5;

/// `sq_caps_3` bit 0: queue memory is physically contiguous.
const SQ_CAPS_3_CONTIGUOUS: u8 = 0x1;

/// `cq_caps_1` bit 5: completions raise an MSI-X interrupt.
const CQ_CAPS_1_INTERRUPT_MODE: u8 = 1 << 5;

/// `cq_caps_2` bits 4:0: completion entry size in 32-bit words.
const CQ_CAPS_2_ENTRY_WORDS_MASK: u8 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CreateSqCmd {
    pub common: AqCommonDesc,
    pub sq_identity: u8,
    pub reserved8: u8,
    /// Bits 3:0 placement, bits 6:4 completion policy.
    pub sq_caps_2: u8,
    pub sq_caps_3: u8,
    pub cq_idx: u16,
    pub sq_depth: u16,
    pub sq_ba: MemAddr,
    pub sq_head_writeback: MemAddr,
    pub raw: [u32; 9],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CreateSqResp {
    pub common: AcqCommonDesc,
    pub sq_idx: u16,
    pub reserved: u16,
    pub sq_doorbell_offset: u32,
    pub llq_descriptors_offset: u32,
    pub llq_headers_offset: u32,
    pub raw: [u32; 10],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CreateCqCmd {
    pub common: AqCommonDesc,
    pub cq_caps_1: u8,
    pub cq_caps_2: u8,
    pub cq_depth: u16,
    pub msix_vector: u32,
    pub cq_ba: MemAddr,
    pub raw: [u32; 11],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CreateCqResp {
    pub common: AcqCommonDesc,
    pub cq_idx: u16,
    pub cq_actual_depth: u16,
    pub numa_node_register_offset: u32,
    pub cq_head_db_register_offset: u32,
    pub cq_interrupt_unmask_register_offset: u32,
    pub raw: [u32; 10],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DestroySqCmd {
    pub common: AqCommonDesc,
    pub sq_idx: u16,
    pub sq_identity: u8,
    pub reserved: u8,
    pub raw: [u32; 14],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DestroyCqCmd {
    pub common: AqCommonDesc,
    pub cq_idx: u16,
    pub reserved: u16,
    pub raw: [u32; 14],
}

const _: () = assert!(std::mem::size_of::<CreateSqCmd>() == 64);
const _: () = assert!(std::mem::size_of::<CreateSqResp>() == 64);
const _: () = assert!(std::mem::size_of::<CreateCqCmd>() == 64);
const _: () = assert!(std::mem::size_of::<CreateCqResp>() == 64);
const _: () = assert!(std::mem::size_of::<DestroySqCmd>() == 64);
const _: () = assert!(std::mem::size_of::<DestroyCqCmd>() == 64);

/// Parameters of one queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQueueParams {
    /// Host-side slot, below `ComConfig::max_io_queues`.
    pub qid: u16,
    pub direction: Direction,
    /// Power of two, shared by SQ and CQ.
    pub depth: u16,
    pub placement: Placement,
    pub msix_vector: u32,
}

impl IoQueueParams {
    pub fn new(qid: u16, direction: Direction, depth: u16) -> Self {
        Self {
            qid,
            direction,
            depth,
            placement: Placement::Host,
            msix_vector: 0,
        }
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_msix_vector(mut self, vector: u32) -> Self {
        self.msix_vector = vector;
        self
    }
}

/// A stopped admin queue means the device is being reset and will drop the
/// queue itself.
fn tolerate_not_running(result: ComResult<()>, what: &str) -> ComResult<()> {
    match result {
        Err(ComError::NotRunning) => {
            log::debug!("Admin queue not running, skipping {}", what);
            Ok(())
        }
        other => other,
    }
}

impl EnaDevice {
    fn invalid(message: String) -> ComError {
        log::error!("{}", message);
        ComError::InvalidParameter(message)
    }

    fn create_cq(&self, params: &IoQueueParams, ring_addr: u64) -> ComResult<CreateCqResp> {
        let mut cmd = CreateCqCmd::zeroed();
        cmd.common.opcode = AdminOpcode::CreateCq as u8;
        cmd.cq_caps_1 = CQ_CAPS_1_INTERRUPT_MODE;
        cmd.cq_caps_2 =
            (params.direction.cq_entry_size() / 4) as u8 & CQ_CAPS_2_ENTRY_WORDS_MASK;
        cmd.cq_depth = params.depth;
        cmd.msix_vector = params.msix_vector;
        cmd.cq_ba = MemAddr::new(ring_addr, self.dma_width())?;

        self.execute_admin_command(cmd).inspect_err(|e| {
            log::error!("Failed to create IO CQ for queue {}: {}", params.qid, e)
        })
    }

    fn create_sq(
        &self,
        params: &IoQueueParams,
        cq_idx: u16,
        ring_addr: Option<u64>,
    ) -> ComResult<CreateSqResp> {
        let mut cmd = CreateSqCmd::zeroed();
        cmd.common.opcode = AdminOpcode::CreateSq as u8;
        cmd.sq_identity = params.direction.as_u8() << SQ_DIRECTION_SHIFT;
        cmd.sq_caps_2 = params.placement as u8;
        cmd.cq_idx = cq_idx;
        cmd.sq_depth = params.depth;
        if let Some(ring_addr) = ring_addr {
            cmd.sq_caps_3 = SQ_CAPS_3_CONTIGUOUS;
            cmd.sq_ba = MemAddr::new(ring_addr, self.dma_width())?;
        }

        self.execute_admin_command(cmd).inspect_err(|e| {
            log::error!("Failed to create IO SQ for queue {}: {}", params.qid, e)
        })
    }

    fn destroy_sq(&self, sq_idx: u16, direction: Direction) -> ComResult<()> {
        let mut cmd = DestroySqCmd::zeroed();
        cmd.common.opcode = AdminOpcode::DestroySq as u8;
        cmd.sq_idx = sq_idx;
        cmd.sq_identity = direction.as_u8() << SQ_DIRECTION_SHIFT;
        let result = self.execute_admin_command::<_, AcqEntry>(cmd).map(|_| ());
        tolerate_not_running(result, "SQ destroy")
            .inspect_err(|e| log::error!("Failed to destroy IO SQ {}: {}", sq_idx, e))
    }

    fn destroy_cq(&self, cq_idx: u16) -> ComResult<()> {
        let mut cmd = DestroyCqCmd::zeroed();
        cmd.common.opcode = AdminOpcode::DestroyCq as u8;
        cmd.cq_idx = cq_idx;
        let result = self.execute_admin_command::<_, AcqEntry>(cmd).map(|_| ());
        tolerate_not_running(result, "CQ destroy")
            .inspect_err(|e| log::error!("Failed to destroy IO CQ {}: {}", cq_idx, e))
    }

    /// Create an SQ/CQ pair and register it with the device.
    ///
    /// Queue creation is serialised by the slot table lock.
    pub fn create_io_queue(&self, params: IoQueueParams) -> ComResult<Arc<Mutex<IoQueuePair>>> {
        self.require(DeviceState::FeaturesDiscovered, "create an I/O queue")?;

        let mut slots = lock(self.io_queue_slots());
        let qid = params.qid as usize;
        if qid >= slots.len() {
            return Err(Self::invalid(format!(
                "Invalid queue number {}, max is {}",
                params.qid,
                slots.len()
            )));
        }
        if params.depth < 2 || !params.depth.is_power_of_two() {
            return Err(Self::invalid(format!(
                "I/O queue depth {} must be a power of two",
                params.depth
            )));
        }
        if slots[qid].is_some() {
            return Err(Self::invalid(format!("I/O queue {} already exists", params.qid)));
        }

        let allocator = self.allocator();
        let depth = params.depth as usize;
        let sq_memory = match params.placement {
            Placement::Host => {
                SqMemory::Host(DmaBuffer::new_with_retry(allocator, depth * IO_SQ_DESC_SIZE)?)
            }
            Placement::Device => {
                if params.direction != Direction::Tx {
                    return Err(Self::invalid(
                        "Device placement is only supported for Tx queues".to_string(),
                    ));
                }
                let llq = self.features().and_then(|features| features.llq);
                match (llq, self.device_memory()) {
                    (Some(llq), Some(memory)) => SqMemory::Device {
                        bounce: LlqBouncePool::new(llq.entry_size()),
                        memory: Arc::clone(memory),
                    },
                    _ => {
                        log::debug!("LLQ is not available for queue {}", params.qid);
                        return Err(ComError::Unsupported);
                    }
                }
            }
        };
        let sq_addr = match &sq_memory {
            SqMemory::Host(ring) => Some(ring.dma_addr()),
            SqMemory::Device { .. } => None,
        };
        let cq_ring = DmaBuffer::new_with_retry(allocator, depth * params.direction.cq_entry_size())?;
        let cq_addr = cq_ring.dma_addr();

        let regs = self.registers().clone();
        let sq = IoSq::new(params.qid, params.direction, params.depth, sq_memory, regs.clone());
        let cq = IoCq::new(params.qid, params.direction, params.depth, cq_ring, regs);

        // Guards run in reverse: SQ, then CQ, then the rings.
        let mut pair = scopeguard::guard(IoQueuePair::new(sq, cq), |mut pair| {
            log::warn!("Unwinding creation of IO queue {}", pair.qid());
            if let Err(e) = pair.unwind() {
                log::error!("Failed to unwind IO queue {}: {}", pair.qid(), e);
            }
        });

        let cq_resp = self.create_cq(&params, cq_addr)?;
        let cq_guard = scopeguard::guard(cq_resp.cq_idx, |cq_idx| {
            log::warn!("Destroying IO CQ {} after failed queue creation", cq_idx);
            if self.destroy_cq(cq_idx).is_err() {
                log::warn!("IO CQ {} may still be allocated on the device", cq_idx);
            }
        });
        let sq_resp = self.create_sq(&params, cq_resp.cq_idx, sq_addr)?;
        let sq_guard = scopeguard::guard(sq_resp.sq_idx, |sq_idx| {
            log::warn!("Destroying IO SQ {} after failed queue creation", sq_idx);
            if self.destroy_sq(sq_idx, params.direction).is_err() {
                log::warn!("IO SQ {} may still be allocated on the device", sq_idx);
            }
        });

        pair.sq.register(
            sq_resp.sq_idx,
            sq_resp.sq_doorbell_offset,
            sq_resp.llq_descriptors_offset as u64,
        );
        if let Some(features) = self.features() {
            let max_header = features.max_queues.max_header_size.min(u16::MAX as u32) as u16;
            if max_header != 0 {
                pair.sq.set_max_header_size(max_header);
            }
        }
        pair.cq.register(
            cq_resp.cq_idx,
            cq_resp.cq_interrupt_unmask_register_offset,
            cq_resp.cq_head_db_register_offset,
        );
        pair.mark_registered()?;

        // A reset may have started while the commands ran.
        self.mark_io_queues_up()?;
        pair.activate()?;

        scopeguard::ScopeGuard::into_inner(sq_guard);
        scopeguard::ScopeGuard::into_inner(cq_guard);
        let pair = Arc::new(Mutex::new(scopeguard::ScopeGuard::into_inner(pair)));
        slots[qid] = Some(Arc::clone(&pair));
        log::debug!(
            "Created IO queue {} ({:?}, {:?}): sq idx {} cq idx {}",
            params.qid,
            params.direction,
            params.placement,
            sq_resp.sq_idx,
            cq_resp.cq_idx
        );
        Ok(pair)
    }

    /// Destroy a queue pair, SQ first, then free its rings.
    ///
    /// Both commands are attempted; the first failure is returned. A stopped
    /// admin queue is not an error. Handles still held by callers see
    /// `NotRunning` from then on.
    pub fn destroy_io_queue(&self, qid: u16) -> ComResult<()> {
        let pair = lock(self.io_queue_slots())
            .get_mut(qid as usize)
            .and_then(Option::take)
            .ok_or_else(|| Self::invalid(format!("I/O queue {} does not exist", qid)))?;

        let mut pair = lock(&pair);
        pair.begin_destroy()?;
        let sq_result = self.destroy_sq(pair.sq.idx(), pair.sq.direction());
        let cq_result = self.destroy_cq(pair.cq.idx());
        pair.release()?;
        log::debug!("Destroyed IO queue {}", qid);
        sq_result.and(cq_result)
    }

    /// Handles of a live queue pair.
    pub fn get_io_queue_handles(&self, qid: u16) -> ComResult<Arc<Mutex<IoQueuePair>>> {
        lock(self.io_queue_slots())
            .get(qid as usize)
            .and_then(Option::clone)
            .ok_or_else(|| Self::invalid(format!("I/O queue {} does not exist", qid)))
    }

    pub fn io_queue_count(&self) -> usize {
        lock(self.io_queue_slots())
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}
