// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Admin submission/completion queue.
//!
//! The host produces 64-byte commands into the admin SQ and rings `AQ_DB`
//! with the new tail. The device produces 64-byte completions into the admin
//! CQ, flipping the phase bit on every wrap. Each command owns one slot of
//! the [`ContextPool`] from submission until its result is collected.
//!
//! # Locking
//!
//! - The SQ tail, command-id counter and doorbell write are serialised by
//!   one mutex.
//! - The CQ scan is serialised by a second mutex. Interrupt-context drains
//!   use `try_lock` and yield if another thread is already draining.
//! - Waiters block on the per-slot condition variable of their slot.
//!
//! # Failure policy
//!
//! A timed-out wait, a completion that matches no outstanding command and
//! any submit failure other than `QueueFull` latch the queue into the
//! not-running state. From then on every submit fails fast with
//! `NotRunning` without touching the ring, until the device is reset.

use crate::backoff::{poll_until, Backoff};
use crate::config::ComConfig;
use crate::ctx::{ContextPool, SlotOutcome};
use crate::descriptor::{
    check_entry_size, AcqEntry, AqEntry, ACQ_PHASE_OFFSET, COMMAND_ID_MASK, ENTRY_SIZE, PHASE_MASK,
};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{ComError, ComResult};
use crate::family::DeviceFamily;
use crate::lock;
use crate::regs::{self, RegisterSpace};
use crate::ring::RingCursor;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

struct SqState {
    tail: RingCursor,
    /// Round-robin command-id counter.
    next_id: u16,
}

struct CqState {
    head: RingCursor,
}

/// Admin queue counters.
#[derive(Debug, Default)]
struct AdminStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    out_of_space: AtomicU64,
    no_completion: AtomicU64,
}

/// Point-in-time copy of the admin queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdminStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub aborted: u64,
    pub out_of_space: u64,
    pub no_completion: u64,
}

/// Admin SQ/CQ pair with its completion context pool.
pub struct AdminQueue<F: DeviceFamily> {
    regs: Arc<dyn RegisterSpace>,
    sq_buf: DmaBuffer,
    cq_buf: DmaBuffer,
    sq: Mutex<SqState>,
    cq: Mutex<CqState>,
    /// Device-retired SQ entries, advanced by the CQ scan.
    sq_head: AtomicU16,
    depth: u16,
    ctx: ContextPool,
    running: AtomicBool,
    polling: AtomicBool,
    auto_polling: AtomicBool,
    missing_interrupt: AtomicBool,
    timeout_us: AtomicU64,
    backoff: Backoff,
    stats: AdminStats,
    _family: PhantomData<fn() -> F>,
}

impl<F: DeviceFamily> AdminQueue<F> {
    /// Allocate both rings and program their base and caps registers.
    ///
    /// The queue starts running, in the polling mode `config` selects.
    pub fn new(
        regs: Arc<dyn RegisterSpace>,
        allocator: &Arc<dyn DmaAllocator>,
        config: &ComConfig,
    ) -> ComResult<Self> {
        let depth = config.admin_queue_depth;
        if !depth.is_power_of_two() || depth as u32 > COMMAND_ID_MASK as u32 + 1 {
            return Err(ComError::InvalidParameter(format!(
                "admin queue depth {} must be a power of two no larger than {}",
                depth,
                COMMAND_ID_MASK as u32 + 1
            )));
        }

        let size = depth as usize * ENTRY_SIZE;
        let sq_buf = DmaBuffer::new(allocator, size)?;
        let cq_buf = DmaBuffer::new(allocator, size)?;

        regs.write32(regs::AQ_BASE_LO, regs::addr_low(sq_buf.dma_addr()));
        regs.write32(regs::AQ_BASE_HI, regs::addr_high(sq_buf.dma_addr()));
        regs.write32(regs::ACQ_BASE_LO, regs::addr_low(cq_buf.dma_addr()));
        regs.write32(regs::ACQ_BASE_HI, regs::addr_high(cq_buf.dma_addr()));
        regs.write32(regs::AQ_CAPS, regs::queue_caps(depth, ENTRY_SIZE));
        regs.write32(regs::ACQ_CAPS, regs::queue_caps(depth, ENTRY_SIZE));

        log::debug!("{} admin queue created with depth {}", F::NAME, depth);

        Ok(Self {
            regs,
            sq_buf,
            cq_buf,
            sq: Mutex::new(SqState {
                tail: RingCursor::new(depth),
                next_id: 0,
            }),
            cq: Mutex::new(CqState {
                head: RingCursor::new(depth),
            }),
            sq_head: AtomicU16::new(0),
            depth,
            ctx: ContextPool::new(depth),
            running: AtomicBool::new(true),
            polling: AtomicBool::new(config.admin_polling),
            auto_polling: AtomicBool::new(config.auto_polling),
            missing_interrupt: AtomicBool::new(false),
            timeout_us: AtomicU64::new(config.admin_completion_timeout.as_micros() as u64),
            backoff: Backoff::new(
                config.min_poll_delay,
                config.max_poll_delay,
                config.max_backoff_exp,
            ),
            stats: AdminStats::default(),
            _family: PhantomData,
        })
    }

    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    #[inline]
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn set_polling(&self, polling: bool) {
        self.polling.store(polling, Ordering::Release);
    }

    pub fn set_auto_polling(&self, auto_polling: bool) {
        self.auto_polling.store(auto_polling, Ordering::Release);
    }

    /// True once a completion was found that never raised its interrupt.
    pub fn is_missing_admin_interrupt(&self) -> bool {
        self.missing_interrupt.load(Ordering::Acquire)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us.load(Ordering::Acquire))
    }

    pub fn set_completion_timeout(&self, timeout: Duration) {
        self.timeout_us
            .store(timeout.as_micros() as u64, Ordering::Release);
    }

    /// Commands whose slot has not been released.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.ctx.outstanding()
    }

    /// SQ entries the device has retired so far.
    pub fn sq_head(&self) -> u16 {
        self.sq_head.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdminStatsSnapshot {
        AdminStatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            out_of_space: self.stats.out_of_space.load(Ordering::Relaxed),
            no_completion: self.stats.no_completion.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.depth - 1
    }

    fn latch_not_running(&self) {
        self.running.store(false, Ordering::Release);
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Next command id whose slot is free, probing round-robin from the
    /// counter so an outstanding id is never reissued.
    fn allocate_id(&self, sq: &mut SqState) -> Option<(usize, u16)> {
        for probe in 0..self.depth {
            let candidate = sq.next_id.wrapping_add(probe);
            let index = (candidate & self.mask()) as usize;
            if self.ctx.is_free(index) {
                sq.next_id = candidate.wrapping_add(1);
                let cmd_id = if F::TAGGED_COMMAND_IDS {
                    candidate & COMMAND_ID_MASK
                } else {
                    index as u16
                };
                return Some((index, cmd_id));
            }
        }
        None
    }

    fn submit_raw(&self, mut entry: AqEntry) -> ComResult<(usize, u16)> {
        if !self.is_running() {
            log::debug!("{} admin queue is not running", F::NAME);
            return Err(ComError::NotRunning);
        }

        let mut sq = lock(&self.sq);
        if !self.is_running() {
            return Err(ComError::NotRunning);
        }

        if self.ctx.outstanding() >= self.depth as usize {
            log::debug!("{} admin queue is full", F::NAME);
            self.stats.out_of_space.fetch_add(1, Ordering::Relaxed);
            return Err(ComError::QueueFull);
        }

        let Some((index, cmd_id)) = self.allocate_id(&mut sq) else {
            self.stats.out_of_space.fetch_add(1, Ordering::Relaxed);
            return Err(ComError::QueueFull);
        };

        let opcode = entry.opcode();
        if let Err(e) = self.ctx.capture(index, cmd_id, opcode) {
            log::error!("Failed to capture completion context: {}", e);
            self.latch_not_running();
            return Err(e.into());
        }

        entry.set_command_id(cmd_id);
        entry.set_phase(sq.tail.current_phase());
        self.sq_buf
            .write(sq.tail.index() as usize * ENTRY_SIZE, entry);
        sq.tail.advance();

        // Descriptor must be visible before the doorbell announces it.
        fence(Ordering::Release);
        self.regs.write32(regs::AQ_DB, sq.tail.counter() as u32);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        Ok((index, cmd_id))
    }

    /// Post a command and return a handle for its completion.
    ///
    /// Never blocks: fails with `NotRunning` or `QueueFull` instead.
    pub fn submit(self: &Arc<Self>, entry: AqEntry) -> ComResult<CompletionHandle<F>> {
        let opcode = entry.opcode();
        let (index, cmd_id) = self.submit_raw(entry)?;
        Ok(CompletionHandle {
            queue: Arc::clone(self),
            index,
            cmd_id,
            opcode,
            waited: false,
        })
    }

    // ========================================================================
    // Completion
    // ========================================================================

    fn lock_cq(&self, force: bool) -> Option<MutexGuard<'_, CqState>> {
        if force {
            return Some(lock(&self.cq));
        }
        match self.cq.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Consume every new completion. Returns the number consumed.
    ///
    /// With `force == false` the call yields immediately if another thread
    /// is already draining.
    pub fn drain_completions(&self, force: bool) -> usize {
        let Some(mut cq) = self.lock_cq(force) else {
            return 0;
        };

        let mut consumed: u16 = 0;
        loop {
            let offset = cq.head.index() as usize * ENTRY_SIZE;
            let phase = self.cq_buf.read_u8(offset + ACQ_PHASE_OFFSET) & PHASE_MASK;
            if phase != cq.head.current_phase() {
                break;
            }

            // The device flips the phase bit last.
            fence(Ordering::Acquire);
            let entry: AcqEntry = self.cq_buf.read(offset);
            self.complete_one(&entry);

            cq.head.advance();
            consumed = consumed.wrapping_add(1);
        }

        if consumed > 0 {
            self.sq_head.fetch_add(consumed, Ordering::AcqRel);
            self.stats
                .completed
                .fetch_add(consumed as u64, Ordering::Relaxed);
        }
        consumed as usize
    }

    fn complete_one(&self, entry: &AcqEntry) {
        let cmd_id = entry.command_id();
        let index = (cmd_id & self.mask()) as usize;
        if let Err(e) = self.ctx.complete(index, *entry) {
            log::error!(
                "{} admin completion does not match an outstanding command ({}), stopping admin queue",
                F::NAME,
                e
            );
            self.latch_not_running();
        }
    }

    /// Opportunistic drain for the admin interrupt.
    pub fn handle_interrupt(&self) {
        self.drain_completions(false);
    }

    fn wait_polling(&self, index: usize, cmd_id: u16) -> ComResult<()> {
        let result = poll_until(&self.backoff, self.completion_timeout(), || {
            self.drain_completions(true);
            Ok(self.ctx.peek(index)?.is_settled().then_some(()))
        });
        if let Err(e) = result {
            log::error!(
                "Wait for completion (polling) timeout, command id {} ({})",
                cmd_id,
                e
            );
            self.stats.no_completion.fetch_add(1, Ordering::Relaxed);
            self.latch_not_running();
            return Err(ComError::Timeout);
        }
        Ok(())
    }

    fn wait_interrupt(&self, index: usize, cmd_id: u16) -> ComResult<()> {
        if self.ctx.wait_settled(index, self.completion_timeout())? {
            return Ok(());
        }

        // Either the device never answered or the interrupt got lost.
        self.drain_completions(true);
        self.stats.no_completion.fetch_add(1, Ordering::Relaxed);
        let settled = self.ctx.peek(index)?.is_settled();

        if settled {
            self.missing_interrupt.store(true, Ordering::Release);
            let auto_polling = self.auto_polling.load(Ordering::Acquire);
            log::error!(
                "The {} device sent a completion but the driver didn't receive an interrupt (cmd {}), autopolling mode is {}",
                F::NAME,
                cmd_id,
                if auto_polling { "ON" } else { "OFF" }
            );
            // Stays in polling mode until the queue is recreated.
            if auto_polling {
                self.set_polling(true);
            }
        } else {
            log::error!(
                "The {} device didn't send a completion for admin cmd {}",
                F::NAME,
                cmd_id
            );
        }

        if !settled || !self.is_polling() {
            self.latch_not_running();
            return Err(ComError::Timeout);
        }
        Ok(())
    }

    /// Wait for a submitted command and release its slot on every path.
    fn wait_for(&self, index: usize, cmd_id: u16) -> ComResult<AcqEntry> {
        let waited = if self.is_polling() {
            self.wait_polling(index, cmd_id)
        } else {
            self.wait_interrupt(index, cmd_id)
        };

        if let Err(e) = waited {
            self.ctx.abandon(index)?;
            return Err(e);
        }

        match self.ctx.take(index)? {
            Some(SlotOutcome::Completed(entry)) => {
                entry.status().into_result()?;
                Ok(entry)
            }
            Some(SlotOutcome::Aborted) => Err(ComError::Aborted),
            None => {
                self.ctx.abandon(index)?;
                Err(ComError::Timeout)
            }
        }
    }

    /// Submit a typed command, wait for it and return the typed response.
    ///
    /// Both types must be exactly one entry long; otherwise nothing is
    /// submitted and `InvalidParameter` is returned.
    pub fn execute<C: Pod, R: Pod>(self: &Arc<Self>, command: C) -> ComResult<R> {
        check_entry_size::<R>("response")?;
        let entry = AqEntry::from_command(command)?;
        let opcode = entry.opcode();
        let handle = self.submit(entry).inspect_err(|e| match e {
            ComError::QueueFull | ComError::NotRunning => {
                log::debug!("Failed to submit {} command {}: {}", F::NAME, F::opcode_name(opcode), e)
            }
            _ => log::error!("Failed to submit {} command {}: {}", F::NAME, F::opcode_name(opcode), e),
        })?;

        let response = handle.wait().inspect_err(|e| match e {
            ComError::Unsupported => {
                log::debug!("{} command {} not supported by the device", F::NAME, F::opcode_name(opcode))
            }
            _ => log::error!("Failed to process {} command {}: {}", F::NAME, F::opcode_name(opcode), e),
        })?;
        response.to_response()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Abort every in-flight command, waking its waiter with `Aborted`.
    pub fn abort_all(&self) -> usize {
        let aborted = self.ctx.abort_all();
        if aborted > 0 {
            log::info!("Aborted {} outstanding {} admin commands", aborted, F::NAME);
        }
        self.stats
            .aborted
            .fetch_add(aborted as u64, Ordering::Relaxed);
        aborted
    }

    /// Wait until every slot has been released, bounded by the admin timeout.
    pub fn wait_for_quiescence(&self) -> ComResult<()> {
        poll_until(&self.backoff, self.completion_timeout(), || {
            Ok((self.ctx.outstanding() == 0).then_some(()))
        })
        .inspect_err(|_| {
            log::error!(
                "{} admin queue did not quiesce, {} commands outstanding",
                F::NAME,
                self.ctx.outstanding()
            )
        })
    }
}

impl<F: DeviceFamily> std::fmt::Debug for AdminQueue<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminQueue")
            .field("family", &F::NAME)
            .field("depth", &self.depth)
            .field("running", &self.is_running())
            .field("polling", &self.is_polling())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Pending admin command.
///
/// Dropping the handle without waiting releases the slot once the device
/// completes the command or the queue is aborted.
#[must_use = "an admin command slot stays claimed until its handle is waited on or dropped"]
pub struct CompletionHandle<F: DeviceFamily> {
    queue: Arc<AdminQueue<F>>,
    index: usize,
    cmd_id: u16,
    opcode: u8,
    waited: bool,
}

impl<F: DeviceFamily> CompletionHandle<F> {
    #[inline]
    pub fn command_id(&self) -> u16 {
        self.cmd_id
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// True if the result can be collected without blocking.
    pub fn is_settled(&self) -> bool {
        self.queue
            .ctx
            .peek(self.index)
            .is_ok_and(|state| state.is_settled())
    }

    /// Block until the command completes, is aborted or times out.
    pub fn wait(mut self) -> ComResult<AcqEntry> {
        self.waited = true;
        self.queue.wait_for(self.index, self.cmd_id)
    }
}

impl<F: DeviceFamily> Drop for CompletionHandle<F> {
    fn drop(&mut self) {
        if !self.waited {
            if let Err(e) = self.queue.ctx.abandon(self.index) {
                log::warn!(
                    "Failed to abandon {} command {} (id {}): {}",
                    F::NAME,
                    F::opcode_name(self.opcode),
                    self.cmd_id,
                    e
                );
            }
        }
    }
}

impl<F: DeviceFamily> std::fmt::Debug for CompletionHandle<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("command_id", &self.cmd_id)
            .field("opcode", &F::opcode_name(self.opcode))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FeatureCmd;
    use crate::dma::HostDmaAllocator;
    use crate::efa::Efa;
    use crate::ena::features::{AenqConfig, DeviceAttributes};
    use crate::ena::{AdminOpcode, Ena, FeatureId};
    use crate::sim::SimDevice;
    use std::thread;

    fn config(depth: u16, polling: bool) -> ComConfig {
        ComConfig::default()
            .with_admin_queue_depth(depth)
            .with_admin_polling(polling)
            .with_admin_completion_timeout(Duration::from_secs(5))
            .with_poll_delays(Duration::from_micros(10), Duration::from_micros(500))
    }

    fn queue_with<F: DeviceFamily>(
        sim: &Arc<SimDevice>,
        config: &ComConfig,
        irq: bool,
    ) -> Arc<AdminQueue<F>> {
        let allocator: Arc<dyn DmaAllocator> = Arc::new(HostDmaAllocator::new());
        let queue = Arc::new(AdminQueue::<F>::new(sim.clone(), &allocator, config).unwrap());
        if irq {
            let weak = Arc::downgrade(&queue);
            sim.set_admin_irq(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.handle_interrupt();
                }
            });
        }
        queue
    }

    fn get_feature(feature: FeatureId) -> AqEntry {
        AqEntry::from_command(FeatureCmd::new(
            AdminOpcode::GetFeature as u8,
            feature as u8,
            0,
        ))
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_depth() {
        let sim = SimDevice::ena();
        let allocator: Arc<dyn DmaAllocator> = Arc::new(HostDmaAllocator::new());
        assert!(AdminQueue::<Ena>::new(sim.clone(), &allocator, &config(12, true)).is_err());
        assert!(AdminQueue::<Ena>::new(sim, &allocator, &config(8192, true)).is_err());
    }

    #[test]
    fn test_round_trip_polling() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(8, true), false);
        let entry = queue
            .submit(get_feature(FeatureId::DeviceAttributes))
            .unwrap()
            .wait()
            .unwrap();
        let attrs: DeviceAttributes = entry
            .to_response::<crate::descriptor::FeatureResp>()
            .unwrap()
            .body();
        assert_eq!(attrs.max_mtu, sim.max_mtu());
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(queue.stats().submitted, 1);
        assert_eq!(queue.stats().completed, 1);
    }

    #[test]
    fn test_round_trip_interrupt() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(8, false), true);
        let handle = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
        assert!(handle.is_settled());
        handle.wait().unwrap();
        assert!(!queue.is_polling());
        assert!(!queue.is_missing_admin_interrupt());
    }

    #[test]
    fn test_ids_never_overlap() {
        let depth = 8;
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(depth, true), false);

        // Hold one slot so the allocator has to skip it on every lap.
        sim.set_admin_stall(true);
        let held = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
        sim.set_admin_stall(false);

        let mut seen = Vec::new();
        for _ in 0..(depth + 1) * 2 {
            let handle = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
            assert_ne!(handle.command_id(), held.command_id());
            seen.push(handle.command_id());
            handle.wait().unwrap();
        }
        assert!(seen.iter().all(|id| *id < depth));
        assert_eq!(queue.outstanding(), 1);

        sim.release_held_completions(false);
        held.wait().unwrap();
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_phase_wraparound() {
        let depth = 8u16;
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(depth, true), false);
        for _ in 0..3 * depth {
            queue
                .submit(get_feature(FeatureId::DeviceAttributes))
                .unwrap()
                .wait()
                .unwrap();
        }
        assert_eq!(queue.stats().completed, 3 * depth as u64);
        assert_eq!(queue.sq_head(), 3 * depth);
        // Nothing stale is picked up after three full laps.
        assert_eq!(queue.drain_completions(true), 0);
        assert!(queue.is_running());
    }

    #[test]
    fn test_queue_full_backpressure() {
        let depth = 4u16;
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(depth, true), false);

        let mut handles: Vec<_> = (0..depth)
            .map(|_| queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap())
            .collect();
        let doorbells = sim.admin_doorbells();
        assert!(matches!(
            queue.submit(get_feature(FeatureId::DeviceAttributes)),
            Err(ComError::QueueFull)
        ));
        assert_eq!(sim.admin_doorbells(), doorbells);
        assert!(queue.is_running());
        assert_eq!(queue.stats().out_of_space, 1);

        assert_eq!(queue.drain_completions(true), depth as usize);
        handles.pop().unwrap().wait().unwrap();
        queue
            .submit(get_feature(FeatureId::DeviceAttributes))
            .unwrap()
            .wait()
            .unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_thirty_two_back_to_back() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(32, false), false);

        let handles: Vec<_> = (0..32)
            .map(|_| queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap())
            .collect();
        assert!(matches!(
            queue.submit(get_feature(FeatureId::DeviceAttributes)),
            Err(ComError::QueueFull)
        ));

        assert_eq!(queue.drain_completions(true), 32);
        let ok = handles
            .into_iter()
            .map(|handle| handle.wait())
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(ok, 32);
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_out_of_order_completion() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(8, false), true);

        sim.set_admin_stall(true);
        let attrs = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
        let aenq = queue.submit(get_feature(FeatureId::AenqConfig)).unwrap();
        sim.set_admin_stall(false);
        assert_eq!(sim.release_held_completions(true), 2);

        let (aenq_id, attrs_id) = (aenq.command_id(), attrs.command_id());
        let aenq_entry = aenq.wait().unwrap();
        let attrs_entry = attrs.wait().unwrap();
        assert_eq!(aenq_entry.command_id(), aenq_id);
        assert_eq!(attrs_entry.command_id(), attrs_id);

        let aenq_cfg: AenqConfig = aenq_entry
            .to_response::<crate::descriptor::FeatureResp>()
            .unwrap()
            .body();
        assert_eq!(aenq_cfg.supported_groups, sim.supported_aenq_groups());
        let device: DeviceAttributes = attrs_entry
            .to_response::<crate::descriptor::FeatureResp>()
            .unwrap()
            .body();
        assert_eq!(device.max_mtu, sim.max_mtu());
    }

    #[test]
    fn test_abort_wakes_all_waiters() {
        for polling in [false, true] {
            let sim = SimDevice::ena();
            let queue = queue_with::<Ena>(&sim, &config(8, polling), true);
            sim.set_admin_stall(true);

            let waiters: Vec<_> = (0..6)
                .map(|_| {
                    let handle = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
                    thread::spawn(move || handle.wait())
                })
                .collect();
            thread::sleep(Duration::from_millis(20));

            assert_eq!(queue.abort_all(), 6);
            queue.wait_for_quiescence().unwrap();
            for waiter in waiters {
                assert!(matches!(waiter.join().unwrap(), Err(ComError::Aborted)));
            }
            assert_eq!(queue.outstanding(), 0);
            assert_eq!(queue.stats().aborted, 6);
        }
    }

    #[test]
    fn test_timeout_latches_not_running() {
        let sim = SimDevice::ena();
        let config = config(8, false).with_admin_completion_timeout(Duration::from_millis(30));
        let queue = queue_with::<Ena>(&sim, &config, true);

        sim.set_admin_stall(true);
        let handle = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
        assert!(matches!(handle.wait(), Err(ComError::Timeout)));
        assert!(!queue.is_running());
        assert_eq!(queue.stats().no_completion, 1);

        let doorbells = sim.admin_doorbells();
        for _ in 0..3 {
            assert!(matches!(
                queue.submit(get_feature(FeatureId::DeviceAttributes)),
                Err(ComError::NotRunning)
            ));
        }
        assert_eq!(sim.admin_doorbells(), doorbells);

        // The timed-out slot is released by the abort during teardown.
        queue.abort_all();
        queue.wait_for_quiescence().unwrap();
    }

    #[test]
    fn test_polling_timeout_latches_not_running() {
        let sim = SimDevice::ena();
        let config = config(8, true).with_admin_completion_timeout(Duration::from_millis(20));
        let queue = queue_with::<Ena>(&sim, &config, false);
        sim.set_admin_stall(true);
        let handle = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
        assert!(matches!(handle.wait(), Err(ComError::Timeout)));
        assert!(!queue.is_running());
    }

    #[test]
    fn test_missed_interrupt_switches_to_polling() {
        let sim = SimDevice::ena();
        let config = config(8, false).with_admin_completion_timeout(Duration::from_millis(20));
        let queue = queue_with::<Ena>(&sim, &config, true);
        sim.set_drop_admin_irq(true);

        queue
            .submit(get_feature(FeatureId::DeviceAttributes))
            .unwrap()
            .wait()
            .unwrap();
        assert!(queue.is_missing_admin_interrupt());
        assert!(queue.is_polling());
        assert!(queue.is_running());

        // Later commands complete through polling.
        queue
            .submit(get_feature(FeatureId::DeviceAttributes))
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_missed_interrupt_without_auto_polling_is_fatal() {
        let sim = SimDevice::ena();
        let config = config(8, false)
            .with_admin_completion_timeout(Duration::from_millis(20))
            .with_auto_polling(false);
        let queue = queue_with::<Ena>(&sim, &config, true);
        sim.set_drop_admin_irq(true);

        let result = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap().wait();
        assert!(matches!(result, Err(ComError::Timeout)));
        assert!(queue.is_missing_admin_interrupt());
        assert!(!queue.is_running());
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_unknown_completion_is_desync() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(8, true), false);
        sim.inject_admin_completion(5, 0);
        assert_eq!(queue.drain_completions(true), 1);
        assert!(!queue.is_running());
        assert!(matches!(
            queue.submit(get_feature(FeatureId::DeviceAttributes)),
            Err(ComError::NotRunning)
        ));
    }

    #[test]
    fn test_device_status_translated() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(8, true), false);
        sim.fail_opcode(AdminOpcode::GetFeature as u8, 7);
        let result = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap().wait();
        assert!(matches!(result, Err(ComError::Busy)));
        // A device-reported error is not a protocol failure.
        assert!(queue.is_running());
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_dropped_handle_releases_slot() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(4, true), false);

        sim.set_admin_stall(true);
        drop(queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap());
        assert_eq!(queue.outstanding(), 1);

        sim.release_held_completions(false);
        assert_eq!(queue.drain_completions(true), 1);
        assert_eq!(queue.outstanding(), 0);
        assert!(queue.is_running());
    }

    #[test]
    fn test_dropped_settled_handle_releases_slot() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(2, true), false);

        let handle = queue.submit(get_feature(FeatureId::DeviceAttributes)).unwrap();
        assert_eq!(queue.drain_completions(true), 1);
        assert_eq!(queue.outstanding(), 1);
        drop(handle);
        assert_eq!(queue.outstanding(), 0);

        // The second of these reuses the dropped command's slot.
        for _ in 0..2 {
            queue
                .submit(get_feature(FeatureId::DeviceAttributes))
                .unwrap()
                .wait()
                .unwrap();
        }
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_execute_rejects_wrong_sized_types() {
        let sim = SimDevice::ena();
        let queue = queue_with::<Ena>(&sim, &config(4, true), false);
        let cmd = FeatureCmd::new(
            AdminOpcode::GetFeature as u8,
            FeatureId::DeviceAttributes as u8,
            0,
        );

        let doorbells = sim.admin_doorbells();
        assert!(matches!(
            queue.execute::<_, crate::descriptor::FeatureResp>([0u8; 32]),
            Err(ComError::InvalidParameter(_))
        ));
        assert!(matches!(
            queue.execute::<_, [u8; 32]>(cmd),
            Err(ComError::InvalidParameter(_))
        ));
        // Nothing reached the ring.
        assert_eq!(sim.admin_doorbells(), doorbells);
        assert_eq!(queue.stats().submitted, 0);
        assert!(queue.is_running());

        queue
            .execute::<_, crate::descriptor::FeatureResp>(cmd)
            .unwrap();
    }

    #[test]
    fn test_tagged_ids_detect_stale_generation() {
        let sim = SimDevice::efa();
        let queue = queue_with::<Efa>(&sim, &config(4, true), false);
        let get_attr = || {
            AqEntry::from_command(FeatureCmd::new(
                crate::efa::AdminOpcode::GetFeature as u8,
                crate::efa::FeatureId::DeviceAttr as u8,
                0,
            ))
            .unwrap()
        };

        let mut ids = Vec::new();
        for _ in 0..4 {
            let handle = queue.submit(get_attr()).unwrap();
            ids.push(handle.command_id());
            handle.wait().unwrap();
        }
        assert_eq!(ids, vec![0, 1, 2, 3]);

        sim.set_admin_stall(true);
        let handle = queue.submit(get_attr()).unwrap();
        assert_eq!(handle.command_id(), 4);

        // Same slot, previous generation.
        sim.inject_admin_completion(0, 0);
        queue.drain_completions(true);
        assert!(!queue.is_running());
        drop(handle);
    }
}
