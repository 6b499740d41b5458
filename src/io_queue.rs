// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! I/O submission and completion rings.
//!
//! Data-path rings use the same phase-bit discipline as the admin queue but
//! have no wait-for-completion semantics. They are meant for one thread per
//! queue (or external serialisation), so the methods take `&mut self`.
//!
//! Host-placed SQs live in a DMA ring. Device-placed (LLQ) SQs build each
//! descriptor in a small host bounce buffer and stream it into the device
//! memory BAR.
//!
//! ```text
//! new ─> SqCqAllocated ─mark_registered─> DeviceRegistered ─activate─> Active
//!             │                                  │                       │
//!             └────────────unwind────────────────┴─> Unconfigured  begin_destroy
//!                                                                        v
//!                                          Freed <────release────── Destroying
//! ```
//!
//! Unwinding or releasing a pair frees its rings. Data-path operations on a
//! released ring fail with [`ComError::NotRunning`] and write nothing.

use crate::dma::DmaBuffer;
use crate::error::{ComError, ComResult};
use crate::regs::{DeviceMemory, RegisterSpace};
use crate::ring::RingCursor;
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Size of Tx and Rx submission descriptors.
pub const IO_SQ_DESC_SIZE: usize = 16;

/// Size of a Tx completion.
pub const TX_CDESC_SIZE: usize = 8;

/// Size of an Rx completion.
pub const RX_CDESC_SIZE: usize = 16;

/// Largest Tx header pushed inline.
pub const MAX_TX_HEADER_SIZE: u16 = 256;

/// Bounce buffers per device-placed queue.
pub const LLQ_BOUNCE_BUFFERS: usize = 4;

/// Interrupt unmask bit in the CQ unmask register.
pub const INTR_UNMASK: u32 = 1 << 30;

/// Queue direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    /// `sq_direction` field value used by create/destroy SQ.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Tx => 1,
            Self::Rx => 2,
        }
    }

    /// Completion entry size for this direction.
    pub fn cq_entry_size(self) -> usize {
        match self {
            Self::Tx => TX_CDESC_SIZE,
            Self::Rx => RX_CDESC_SIZE,
        }
    }
}

/// Where the SQ descriptors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Placement {
    /// Descriptor ring in host memory, fetched by the device.
    Host = 1,
    /// Low-latency queue: descriptors written into device memory.
    Device = 3,
}

/// I/O queue pair lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoQueueState {
    Unconfigured,
    SqCqAllocated,
    DeviceRegistered,
    Active,
    Destroying,
    Freed,
}

impl IoQueueState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::SqCqAllocated => "sq-cq-allocated",
            Self::DeviceRegistered => "device-registered",
            Self::Active => "active",
            Self::Destroying => "destroying",
            Self::Freed => "freed",
        }
    }
}

impl std::fmt::Display for IoQueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// A submission descriptor carrying a phase bit.
pub trait IoDescriptor: Pod {
    fn set_phase(&mut self, phase: u8);
}

/// A completion entry carrying a phase bit.
pub trait IoCompletion: Pod {
    /// Byte holding the phase bit.
    const PHASE_BYTE: usize;
    const PHASE_MASK: u8;
}

/// ENA Tx descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TxDesc {
    /// 15:0 length, 21:16 req_id_hi, 24 phase, 26 first, 27 last, 28 comp_req.
    pub len_ctrl: u32,
    /// 31:22 req_id_lo.
    pub meta_ctrl: u32,
    pub buff_addr_lo: u32,
    /// 15:0 addr_hi, 31:24 header_length.
    pub buff_addr_hi_hdr_sz: u32,
}

impl TxDesc {
    const PHASE_SHIFT: u32 = 24;
    const FIRST: u32 = 1 << 26;
    const LAST: u32 = 1 << 27;
    const COMP_REQ: u32 = 1 << 28;

    /// Single-buffer packet descriptor.
    pub fn new(req_id: u16, addr: u64, length: u16, header_length: u8) -> Self {
        Self {
            len_ctrl: length as u32
                | (((req_id as u32 >> 10) & 0x3f) << 16)
                | Self::FIRST
                | Self::LAST
                | Self::COMP_REQ,
            meta_ctrl: (req_id as u32 & 0x3ff) << 22,
            buff_addr_lo: addr as u32,
            buff_addr_hi_hdr_sz: ((addr >> 32) as u32 & 0xffff) | ((header_length as u32) << 24),
        }
    }

    pub fn req_id(&self) -> u16 {
        (((self.len_ctrl >> 16) & 0x3f) << 10) as u16 | (self.meta_ctrl >> 22) as u16
    }

    pub fn phase(&self) -> u8 {
        ((self.len_ctrl >> Self::PHASE_SHIFT) & 1) as u8
    }
}

impl IoDescriptor for TxDesc {
    fn set_phase(&mut self, phase: u8) {
        self.len_ctrl = (self.len_ctrl & !(1 << Self::PHASE_SHIFT))
            | (((phase & 1) as u32) << Self::PHASE_SHIFT);
    }
}

/// ENA Rx descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RxDesc {
    pub length: u16,
    pub reserved2: u8,
    /// 0 phase, 2 first, 3 last, 4 comp_req.
    pub ctrl: u8,
    pub req_id: u16,
    pub reserved6: u16,
    pub buff_addr_lo: u32,
    pub buff_addr_hi: u16,
    pub reserved16_w3: u16,
}

impl RxDesc {
    pub fn new(req_id: u16, addr: u64, length: u16) -> Self {
        Self {
            length,
            ctrl: (1 << 2) | (1 << 3) | (1 << 4),
            req_id,
            buff_addr_lo: addr as u32,
            buff_addr_hi: (addr >> 32) as u16,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> u8 {
        self.ctrl & 1
    }
}

impl IoDescriptor for RxDesc {
    fn set_phase(&mut self, phase: u8) {
        self.ctrl = (self.ctrl & !1) | (phase & 1);
    }
}

/// ENA Tx completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TxCompletion {
    pub req_id: u16,
    pub status: u8,
    /// Bit 0 phase.
    pub flags: u8,
    pub sub_qid: u16,
    pub sq_head_idx: u16,
}

impl IoCompletion for TxCompletion {
    const PHASE_BYTE: usize = 3;
    const PHASE_MASK: u8 = 0x1;
}

/// ENA Rx completion (base descriptor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RxCompletion {
    /// 24 phase, 26 first, 27 last.
    pub status: u32,
    pub length: u16,
    pub req_id: u16,
    pub hash: u32,
    pub sub_qid: u16,
    pub offset: u8,
    pub reserved: u8,
}

impl IoCompletion for RxCompletion {
    // Bit 24 of the little-endian status word.
    const PHASE_BYTE: usize = 3;
    const PHASE_MASK: u8 = 0x1;
}

const _: () = assert!(std::mem::size_of::<TxDesc>() == IO_SQ_DESC_SIZE);
const _: () = assert!(std::mem::size_of::<RxDesc>() == IO_SQ_DESC_SIZE);
const _: () = assert!(std::mem::size_of::<TxCompletion>() == TX_CDESC_SIZE);
const _: () = assert!(std::mem::size_of::<RxCompletion>() == RX_CDESC_SIZE);

// ============================================================================
// Submission ring
// ============================================================================

/// Host bounce buffers for device-placed queues.
#[derive(Debug)]
pub struct LlqBouncePool {
    buffers: Vec<Box<[u8]>>,
    next: usize,
}

impl LlqBouncePool {
    pub fn new(entry_size: usize) -> Self {
        Self {
            buffers: (0..LLQ_BOUNCE_BUFFERS)
                .map(|_| vec![0u8; entry_size].into_boxed_slice())
                .collect(),
            next: 0,
        }
    }

    pub fn entry_size(&self) -> usize {
        self.buffers.first().map_or(0, |buffer| buffer.len())
    }

    /// Next buffer in rotation, zeroed.
    fn take(&mut self) -> &mut [u8] {
        let index = self.next;
        self.next = (self.next + 1) % self.buffers.len();
        let buffer = &mut self.buffers[index];
        buffer.fill(0);
        buffer
    }
}

/// Descriptor memory of an SQ.
pub enum SqMemory {
    Host(DmaBuffer),
    Device {
        bounce: LlqBouncePool,
        memory: Arc<dyn DeviceMemory>,
    },
}

impl SqMemory {
    pub fn placement(&self) -> Placement {
        match self {
            Self::Host(_) => Placement::Host,
            Self::Device { .. } => Placement::Device,
        }
    }
}

impl std::fmt::Debug for SqMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(ring) => f.debug_tuple("Host").field(ring).finish(),
            Self::Device { bounce, .. } => f
                .debug_struct("Device")
                .field("entry_size", &bounce.entry_size())
                .finish_non_exhaustive(),
        }
    }
}

/// I/O submission queue.
pub struct IoSq {
    qid: u16,
    direction: Direction,
    idx: u16,
    depth: u16,
    tail: RingCursor,
    next_to_comp: u16,
    placement: Placement,
    /// `None` once the queue has been released.
    memory: Option<SqMemory>,
    regs: Arc<dyn RegisterSpace>,
    doorbell_offset: u32,
    /// Offset of the LLQ descriptor area in the device memory BAR.
    descriptors_offset: u64,
    max_header_size: u16,
}

impl IoSq {
    pub(crate) fn new(
        qid: u16,
        direction: Direction,
        depth: u16,
        memory: SqMemory,
        regs: Arc<dyn RegisterSpace>,
    ) -> Self {
        let max_header_size = match direction {
            Direction::Tx => MAX_TX_HEADER_SIZE,
            Direction::Rx => 0,
        };
        Self {
            qid,
            direction,
            idx: 0,
            depth,
            tail: RingCursor::new(depth),
            next_to_comp: 0,
            placement: memory.placement(),
            memory: Some(memory),
            regs,
            doorbell_offset: 0,
            descriptors_offset: 0,
            max_header_size,
        }
    }

    pub(crate) fn register(&mut self, idx: u16, doorbell_offset: u32, descriptors_offset: u64) {
        self.idx = idx;
        self.doorbell_offset = doorbell_offset;
        self.descriptors_offset = descriptors_offset;
    }

    pub(crate) fn memory(&self) -> Option<&SqMemory> {
        self.memory.as_ref()
    }

    /// Drop the descriptor memory. Later pushes and doorbells fail.
    pub(crate) fn release(&mut self) -> Option<SqMemory> {
        self.memory.take()
    }

    /// Whether the descriptor memory is still mapped.
    pub fn is_released(&self) -> bool {
        self.memory.is_none()
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Index assigned by the device.
    #[inline]
    pub fn idx(&self) -> u16 {
        self.idx
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    #[inline]
    pub fn tail(&self) -> u16 {
        self.tail.counter()
    }

    pub fn doorbell_offset(&self) -> u32 {
        self.doorbell_offset
    }

    /// LLQ descriptor area in the device memory BAR (device placement).
    pub fn descriptors_offset(&self) -> u64 {
        self.descriptors_offset
    }

    /// Largest header the device accepts inline (Tx only).
    pub fn max_header_size(&self) -> u16 {
        self.max_header_size
    }

    /// Apply the device limit, never exceeding [`MAX_TX_HEADER_SIZE`].
    pub(crate) fn set_max_header_size(&mut self, size: u16) {
        if self.direction == Direction::Tx {
            self.max_header_size = size.min(MAX_TX_HEADER_SIZE);
        }
    }

    /// Entries that can still be pushed.
    pub fn free_entries(&self) -> u16 {
        (self.depth - 1).saturating_sub(self.in_flight())
    }

    /// Stamp the phase bit and write one descriptor at the tail.
    ///
    /// Returns the ring index used. Fails with `QueueFull` when no entry is
    /// free and with `NotRunning` once the queue is released; nothing is
    /// written in either case.
    pub fn push<D: IoDescriptor>(&mut self, mut desc: D) -> ComResult<u16> {
        if self.memory.is_none() {
            log::debug!("Push on released I/O SQ {}", self.qid);
            return Err(ComError::NotRunning);
        }
        if self.free_entries() == 0 {
            log::debug!("I/O SQ {} is full", self.qid);
            return Err(ComError::QueueFull);
        }

        desc.set_phase(self.tail.current_phase());
        let index = self.tail.index();
        let bytes = bytemuck::bytes_of(&desc);

        match &mut self.memory {
            Some(SqMemory::Host(ring)) => ring.write(index as usize * IO_SQ_DESC_SIZE, desc),
            Some(SqMemory::Device { bounce, memory }) => {
                let entry_size = bounce.entry_size();
                let buffer = bounce.take();
                buffer[..bytes.len()].copy_from_slice(bytes);
                let offset = self.descriptors_offset + index as u64 * entry_size as u64;
                memory.write_bytes(offset, buffer);
            }
            None => return Err(ComError::NotRunning),
        }

        self.tail.advance();
        Ok(index)
    }

    /// Tell the device about everything pushed so far.
    pub fn ring_doorbell(&self) -> ComResult<()> {
        if self.memory.is_none() {
            log::debug!("Doorbell on released I/O SQ {}", self.qid);
            return Err(ComError::NotRunning);
        }
        // Descriptors must be visible before the tail.
        fence(Ordering::Release);
        self.regs
            .write32(self.doorbell_offset, self.tail.counter() as u32);
        Ok(())
    }

    /// Entries pushed but not yet retired.
    pub fn in_flight(&self) -> u16 {
        self.tail.counter().wrapping_sub(self.next_to_comp)
    }

    /// Retire up to `count` completed entries.
    pub fn complete(&mut self, count: u16) {
        let count = count.min(self.in_flight());
        self.next_to_comp = self.next_to_comp.wrapping_add(count);
    }
}

impl std::fmt::Debug for IoSq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSq")
            .field("qid", &self.qid)
            .field("idx", &self.idx)
            .field("direction", &self.direction)
            .field("placement", &self.placement())
            .field("depth", &self.depth)
            .field("tail", &self.tail.counter())
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// Completion ring
// ============================================================================

/// I/O completion queue.
pub struct IoCq {
    qid: u16,
    direction: Direction,
    idx: u16,
    depth: u16,
    entry_size: usize,
    head: RingCursor,
    /// `None` once the queue has been released.
    ring: Option<DmaBuffer>,
    regs: Arc<dyn RegisterSpace>,
    unmask_offset: Option<u32>,
    head_db_offset: Option<u32>,
}

impl IoCq {
    pub(crate) fn new(
        qid: u16,
        direction: Direction,
        depth: u16,
        ring: DmaBuffer,
        regs: Arc<dyn RegisterSpace>,
    ) -> Self {
        Self {
            qid,
            direction,
            idx: 0,
            depth,
            entry_size: direction.cq_entry_size(),
            head: RingCursor::new(depth),
            ring: Some(ring),
            regs,
            unmask_offset: None,
            head_db_offset: None,
        }
    }

    pub(crate) fn register(&mut self, idx: u16, unmask_offset: u32, head_db_offset: u32) {
        self.idx = idx;
        self.unmask_offset = (unmask_offset != 0).then_some(unmask_offset);
        self.head_db_offset = (head_db_offset != 0).then_some(head_db_offset);
    }

    pub(crate) fn ring(&self) -> Option<&DmaBuffer> {
        self.ring.as_ref()
    }

    /// Drop the completion ring. Later polls fail.
    pub(crate) fn release(&mut self) -> Option<DmaBuffer> {
        self.ring.take()
    }

    pub fn is_released(&self) -> bool {
        self.ring.is_none()
    }

    fn live_ring(&self) -> ComResult<&DmaBuffer> {
        self.ring.as_ref().ok_or_else(|| {
            log::debug!("Access to released I/O CQ {}", self.qid);
            ComError::NotRunning
        })
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Index assigned by the device.
    #[inline]
    pub fn idx(&self) -> u16 {
        self.idx
    }

    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[inline]
    pub fn head(&self) -> u16 {
        self.head.counter()
    }

    pub fn unmask_offset(&self) -> Option<u32> {
        self.unmask_offset
    }

    /// Consume the next completion if the device has written it.
    pub fn next_completion<C: IoCompletion>(&mut self) -> ComResult<Option<C>> {
        debug_assert_eq!(std::mem::size_of::<C>(), self.entry_size);
        let offset = self.head.index() as usize * self.entry_size;
        let ring = self.live_ring()?;
        let phase = ring.read_u8(offset + C::PHASE_BYTE) & C::PHASE_MASK;
        if phase != self.head.current_phase() {
            return Ok(None);
        }
        // Phase is written last by the device.
        fence(Ordering::Acquire);
        let completion = ring.read(offset);
        self.head.advance();
        Ok(Some(completion))
    }

    /// Re-arm the queue interrupt.
    pub fn unmask_interrupt(&self) -> ComResult<()> {
        self.live_ring()?;
        if let Some(offset) = self.unmask_offset {
            self.regs.write32(offset, INTR_UNMASK);
        }
        Ok(())
    }

    /// Report the consumed head, for devices that ask for it.
    pub fn update_head(&self) -> ComResult<()> {
        self.live_ring()?;
        if let Some(offset) = self.head_db_offset {
            self.regs.write32(offset, self.head.counter() as u32);
        }
        Ok(())
    }
}

impl std::fmt::Debug for IoCq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoCq")
            .field("qid", &self.qid)
            .field("idx", &self.idx)
            .field("direction", &self.direction)
            .field("depth", &self.depth)
            .field("head", &self.head.counter())
            .field("released", &self.is_released())
            .finish()
    }
}

/// An SQ and the CQ it targets.
#[derive(Debug)]
pub struct IoQueuePair {
    state: IoQueueState,
    pub sq: IoSq,
    pub cq: IoCq,
}

impl IoQueuePair {
    /// Pair whose rings are allocated but unknown to the device.
    pub(crate) fn new(sq: IoSq, cq: IoCq) -> Self {
        Self {
            state: IoQueueState::SqCqAllocated,
            sq,
            cq,
        }
    }

    fn transition(
        &mut self,
        from: &[IoQueueState],
        to: IoQueueState,
        operation: &'static str,
    ) -> ComResult<()> {
        if !from.contains(&self.state) {
            log::error!(
                "Cannot {} I/O queue {} in state {}",
                operation,
                self.qid(),
                self.state
            );
            return Err(ComError::InvalidState {
                state: self.state.name(),
                operation,
            });
        }
        log::trace!("I/O queue {} state {} -> {}", self.qid(), self.state, to);
        self.state = to;
        Ok(())
    }

    /// Both device-side objects exist.
    pub(crate) fn mark_registered(&mut self) -> ComResult<()> {
        self.transition(
            &[IoQueueState::SqCqAllocated],
            IoQueueState::DeviceRegistered,
            "register",
        )
    }

    /// The pair is published and open for the data path.
    pub(crate) fn activate(&mut self) -> ComResult<()> {
        self.transition(
            &[IoQueueState::DeviceRegistered],
            IoQueueState::Active,
            "activate",
        )
    }

    pub(crate) fn begin_destroy(&mut self) -> ComResult<()> {
        self.transition(&[IoQueueState::Active], IoQueueState::Destroying, "destroy")
    }

    /// Free both rings after the device let go of them.
    pub(crate) fn release(&mut self) -> ComResult<()> {
        self.transition(
            &[IoQueueState::Active, IoQueueState::Destroying],
            IoQueueState::Freed,
            "release",
        )?;
        self.free_rings();
        Ok(())
    }

    /// Back out of a failed creation, freeing whatever was allocated.
    pub(crate) fn unwind(&mut self) -> ComResult<()> {
        self.transition(
            &[IoQueueState::SqCqAllocated, IoQueueState::DeviceRegistered],
            IoQueueState::Unconfigured,
            "unwind",
        )?;
        self.free_rings();
        Ok(())
    }

    fn free_rings(&mut self) {
        drop(self.sq.release());
        drop(self.cq.release());
    }

    #[inline]
    pub fn state(&self) -> IoQueueState {
        self.state
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.sq.qid()
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.sq.direction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, HostDmaAllocator};
    use crate::sim::SimDevice;

    fn allocator() -> Arc<dyn DmaAllocator> {
        Arc::new(HostDmaAllocator::new())
    }

    fn host_sq(sim: &Arc<SimDevice>, depth: u16, direction: Direction) -> IoSq {
        let ring = DmaBuffer::new(&allocator(), depth as usize * IO_SQ_DESC_SIZE).unwrap();
        let mut sq = IoSq::new(7, direction, depth, SqMemory::Host(ring), sim.clone());
        sq.register(3, 0x2000, 0);
        sq
    }

    fn pair(sim: &Arc<SimDevice>, depth: u16) -> IoQueuePair {
        let sq = host_sq(sim, depth, Direction::Tx);
        let ring = DmaBuffer::new(&allocator(), depth as usize * TX_CDESC_SIZE).unwrap();
        let mut cq = IoCq::new(7, Direction::Tx, depth, ring, sim.clone());
        cq.register(2, 0x3008, 0x3108);
        IoQueuePair::new(sq, cq)
    }

    #[test]
    fn test_tx_desc_fields() {
        let mut desc = TxDesc::new(0x1234, 0x0000_7fff_dead_b000, 1500, 42);
        assert_eq!(desc.req_id(), 0x1234);
        assert_eq!(desc.len_ctrl & 0xffff, 1500);
        assert_eq!(desc.buff_addr_hi_hdr_sz >> 24, 42);
        assert_eq!(desc.buff_addr_hi_hdr_sz & 0xffff, 0x7fff);
        assert_eq!(desc.phase(), 0);
        desc.set_phase(1);
        assert_eq!(desc.phase(), 1);
        assert_eq!(desc.req_id(), 0x1234);
    }

    #[test]
    fn test_push_stamps_phase_per_lap() {
        let sim = SimDevice::ena();
        let mut sq = host_sq(&sim, 4, Direction::Rx);
        for lap in 0..3u8 {
            for i in 0..4u16 {
                // Keep the ring from filling up.
                sq.complete(1);
                let index = sq.push(RxDesc::new(i, 0x1000, 64)).unwrap();
                assert_eq!(index, i);
                let Some(SqMemory::Host(ring)) = sq.memory() else {
                    unreachable!()
                };
                let written: RxDesc = ring.read(index as usize * IO_SQ_DESC_SIZE);
                assert_eq!(written.phase(), 1 - lap % 2);
                assert_eq!(written.req_id, i);
            }
        }
    }

    #[test]
    fn test_push_full_ring() {
        let sim = SimDevice::ena();
        let mut sq = host_sq(&sim, 4, Direction::Tx);
        assert_eq!(sq.free_entries(), 3);
        for i in 0..3 {
            sq.push(TxDesc::new(i, 0x1000, 64, 0)).unwrap();
        }
        assert!(matches!(
            sq.push(TxDesc::new(3, 0x1000, 64, 0)),
            Err(ComError::QueueFull)
        ));
        assert_eq!(sq.tail(), 3);
        sq.complete(2);
        assert_eq!(sq.free_entries(), 2);
        sq.push(TxDesc::new(3, 0x1000, 64, 0)).unwrap();
    }

    #[test]
    fn test_doorbell_writes_tail() {
        let sim = SimDevice::ena();
        let mut sq = host_sq(&sim, 8, Direction::Tx);
        sq.push(TxDesc::new(0, 0x1000, 64, 0)).unwrap();
        sq.push(TxDesc::new(1, 0x2000, 64, 0)).unwrap();
        sq.ring_doorbell().unwrap();
        assert_eq!(sim.register_value(0x2000), Some(2));
    }

    #[test]
    fn test_llq_push_streams_into_device_memory() {
        let sim = SimDevice::ena();
        let entry_size = 128;
        let memory = SqMemory::Device {
            bounce: LlqBouncePool::new(entry_size),
            memory: sim.clone(),
        };
        let mut sq = IoSq::new(1, Direction::Tx, 8, memory, sim.clone());
        sq.register(1, 0x2004, 0x4000);
        assert_eq!(sq.placement(), Placement::Device);
        for i in 0..6u16 {
            sq.complete(1);
            sq.push(TxDesc::new(i, 0x1000 * i as u64, 100, 0)).unwrap();
        }
        let bytes = sim.llq_bytes(0x4000 + 5 * entry_size as u64, IO_SQ_DESC_SIZE);
        let desc: TxDesc = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(desc.req_id(), 5);
        assert_eq!(desc.phase(), 1);
        // Padding after the descriptor comes from a zeroed bounce buffer.
        let tail = sim.llq_bytes(0x4000 + 5 * entry_size as u64 + 16, entry_size - 16);
        assert!(tail.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_tx_header_size_clamped() {
        let sim = SimDevice::ena();
        let mut tx = host_sq(&sim, 4, Direction::Tx);
        tx.set_max_header_size(1024);
        assert_eq!(tx.max_header_size(), MAX_TX_HEADER_SIZE);
        tx.set_max_header_size(128);
        assert_eq!(tx.max_header_size(), 128);

        let mut rx = host_sq(&sim, 4, Direction::Rx);
        rx.set_max_header_size(128);
        assert_eq!(rx.max_header_size(), 0);
    }

    #[test]
    fn test_cq_phase_check() {
        let sim = SimDevice::ena();
        let depth = 4u16;
        let ring = DmaBuffer::new(&allocator(), depth as usize * TX_CDESC_SIZE).unwrap();
        let mut cq = IoCq::new(0, Direction::Tx, depth, ring, sim.clone());
        cq.register(0, 0x3000, 0);
        assert!(cq.next_completion::<TxCompletion>().unwrap().is_none());

        // Device writes two laps worth of completions one at a time.
        for n in 0..(2 * depth) {
            let index = (n % depth) as usize;
            let phase = if n < depth { 1 } else { 0 };
            cq.ring().unwrap().write(
                index * TX_CDESC_SIZE,
                TxCompletion {
                    req_id: n,
                    flags: phase,
                    ..TxCompletion::default()
                },
            );
            let completion: TxCompletion = cq.next_completion().unwrap().unwrap();
            assert_eq!(completion.req_id, n);
            // Stale entry from the previous lap is not picked up again.
            assert!(cq.next_completion::<TxCompletion>().unwrap().is_none());
        }

        cq.unmask_interrupt().unwrap();
        assert_eq!(sim.register_value(0x3000), Some(INTR_UNMASK));
    }

    #[test]
    fn test_pair_lifecycle() {
        let sim = SimDevice::ena();
        let mut pair = pair(&sim, 4);
        assert_eq!(pair.state(), IoQueueState::SqCqAllocated);
        assert!(matches!(
            pair.activate(),
            Err(ComError::InvalidState { state: "sq-cq-allocated", .. })
        ));

        pair.mark_registered().unwrap();
        assert_eq!(pair.state(), IoQueueState::DeviceRegistered);
        pair.activate().unwrap();
        assert_eq!(pair.state(), IoQueueState::Active);
        assert!(pair.unwind().is_err());

        pair.begin_destroy().unwrap();
        assert_eq!(pair.state(), IoQueueState::Destroying);
        pair.release().unwrap();
        assert_eq!(pair.state(), IoQueueState::Freed);
        assert!(pair.sq.is_released());
        assert!(pair.cq.is_released());
        assert!(pair.release().is_err());
    }

    #[test]
    fn test_unwind_frees_rings() {
        let sim = SimDevice::ena();
        let allocator = Arc::new(HostDmaAllocator::new());
        let dyn_allocator: Arc<dyn DmaAllocator> = allocator.clone();
        let sq_ring = DmaBuffer::new(&dyn_allocator, 4 * IO_SQ_DESC_SIZE).unwrap();
        let cq_ring = DmaBuffer::new(&dyn_allocator, 4 * RX_CDESC_SIZE).unwrap();
        let sq = IoSq::new(0, Direction::Rx, 4, SqMemory::Host(sq_ring), sim.clone());
        let cq = IoCq::new(0, Direction::Rx, 4, cq_ring, sim.clone());
        let mut pair = IoQueuePair::new(sq, cq);
        pair.mark_registered().unwrap();
        assert_eq!(allocator.live_regions(), 2);

        pair.unwind().unwrap();
        assert_eq!(pair.state(), IoQueueState::Unconfigured);
        assert_eq!(allocator.live_regions(), 0);
        assert!(pair.activate().is_err());
    }

    #[test]
    fn test_released_rings_refuse_data_path() {
        let sim = SimDevice::ena();
        let mut pair = pair(&sim, 4);
        pair.mark_registered().unwrap();
        pair.activate().unwrap();
        pair.sq.push(TxDesc::new(1, 0x1000, 64, 0)).unwrap();
        pair.begin_destroy().unwrap();
        pair.release().unwrap();

        assert!(matches!(
            pair.sq.push(TxDesc::new(2, 0x1000, 64, 0)),
            Err(ComError::NotRunning)
        ));
        assert_eq!(pair.sq.tail(), 1);
        assert!(matches!(pair.sq.ring_doorbell(), Err(ComError::NotRunning)));
        assert_eq!(sim.register_value(0x2000), None);

        assert!(matches!(
            pair.cq.next_completion::<TxCompletion>(),
            Err(ComError::NotRunning)
        ));
        assert!(matches!(pair.cq.unmask_interrupt(), Err(ComError::NotRunning)));
        assert!(matches!(pair.cq.update_head(), Err(ComError::NotRunning)));
        assert_eq!(sim.register_value(0x3008), None);
        assert_eq!(sim.register_value(0x3108), None);
    }
}
