// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Asynchronous event notification queue.
//!
//! A device-to-host ring with the same phase-bit discipline as the admin CQ.
//! Events are dispatched in ring order by their group to the registered
//! [`AenqHandler`]; groups without a handler go to the mandatory fallback.

use crate::descriptor::{AenqEntry, AENQ_PHASE_OFFSET, ENTRY_SIZE, PHASE_MASK};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{ComError, ComResult};
use crate::lock;
use crate::regs::{self, RegisterSpace};
use crate::ring::RingCursor;
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Number of groups with a dedicated handler slot.
pub const EVENT_GROUP_COUNT: usize = 7;

/// AENQ event group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventGroup {
    LinkChange,
    FatalError,
    Warning,
    Notification,
    KeepAlive,
    RefreshCapabilities,
    ConfNotifications,
    /// Group number outside the known set.
    Other(u16),
}

impl From<u16> for EventGroup {
    fn from(group: u16) -> Self {
        match group {
            0 => Self::LinkChange,
            1 => Self::FatalError,
            2 => Self::Warning,
            3 => Self::Notification,
            4 => Self::KeepAlive,
            5 => Self::RefreshCapabilities,
            6 => Self::ConfNotifications,
            _ => Self::Other(group),
        }
    }
}

impl EventGroup {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::LinkChange => 0,
            Self::FatalError => 1,
            Self::Warning => 2,
            Self::Notification => 3,
            Self::KeepAlive => 4,
            Self::RefreshCapabilities => 5,
            Self::ConfNotifications => 6,
            Self::Other(group) => group,
        }
    }

    /// Handler table slot, `None` for unknown groups.
    fn table_index(self) -> Option<usize> {
        match self {
            Self::Other(_) => None,
            known => Some(known.as_u16() as usize),
        }
    }

    /// Bit of this group in the AENQ config group masks.
    pub fn mask(self) -> u32 {
        match self.as_u16() {
            group @ 0..=31 => 1 << group,
            _ => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LinkChange => "LINK_CHANGE",
            Self::FatalError => "FATAL_ERROR",
            Self::Warning => "WARNING",
            Self::Notification => "NOTIFICATION",
            Self::KeepAlive => "KEEP_ALIVE",
            Self::RefreshCapabilities => "REFRESH_CAPABILITIES",
            Self::ConfNotifications => "CONF_NOTIFICATIONS",
            Self::Other(_) => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for EventGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u16())
    }
}

/// Body of the AENQ configuration feature, for both get and set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AenqConfig {
    /// Groups the device can report.
    pub supported_groups: u32,
    /// Groups the device will report.
    pub enabled_groups: u32,
}

/// One decoded AENQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AenqEvent {
    pub group: EventGroup,
    pub syndrome: u16,
    pub timestamp: u64,
    pub data: [u32; 12],
}

impl AenqEvent {
    /// Link state of a link-change event (bit 0 of the first data word).
    pub fn link_up(&self) -> Option<bool> {
        (self.group == EventGroup::LinkChange).then_some(self.data[0] & 0x1 != 0)
    }

    /// `(rx_drops, tx_drops)` carried by a keep-alive event.
    pub fn keep_alive_drops(&self) -> Option<(u64, u64)> {
        (self.group == EventGroup::KeepAlive).then(|| {
            let rx = self.data[0] as u64 | ((self.data[1] as u64) << 32);
            let tx = self.data[2] as u64 | ((self.data[3] as u64) << 32);
            (rx, tx)
        })
    }
}

impl From<&AenqEntry> for AenqEvent {
    fn from(entry: &AenqEntry) -> Self {
        Self {
            group: EventGroup::from(entry.common.group),
            syndrome: entry.common.syndrome,
            timestamp: entry.timestamp(),
            data: entry.inline_data,
        }
    }
}

/// Receiver of AENQ events.
pub trait AenqHandler: Send + Sync {
    fn handle(&self, event: &AenqEvent);
}

impl<T> AenqHandler for T
where
    T: Fn(&AenqEvent) + Send + Sync,
{
    fn handle(&self, event: &AenqEvent) {
        self(event)
    }
}

/// Dispatch table. The fallback is mandatory so dispatch is total.
#[derive(Clone)]
pub struct AenqHandlers {
    table: [Option<Arc<dyn AenqHandler>>; EVENT_GROUP_COUNT],
    fallback: Arc<dyn AenqHandler>,
    /// Sees every event before dispatch.
    observer: Option<Arc<dyn AenqHandler>>,
}

impl AenqHandlers {
    /// Table with only the fallback handler.
    pub fn new(fallback: impl AenqHandler + 'static) -> Self {
        Self {
            table: Default::default(),
            fallback: Arc::new(fallback),
            observer: None,
        }
    }

    /// Fallback that logs the event and drops it.
    pub fn with_logging_fallback() -> Self {
        Self::new(|event: &AenqEvent| {
            log::error!(
                "Unknown event was received or event with unimplemented handler: group {} syndrome {:#x}",
                event.group,
                event.syndrome
            );
        })
    }

    /// Register `handler` for `group`. Unknown groups always use the fallback.
    pub fn on(mut self, group: EventGroup, handler: impl AenqHandler + 'static) -> Self {
        match group.table_index() {
            Some(index) => self.table[index] = Some(Arc::new(handler)),
            None => log::warn!("Cannot register a handler for AENQ group {}", group),
        }
        self
    }

    pub(crate) fn with_observer(mut self, observer: Arc<dyn AenqHandler>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Group mask of every group with a registered handler.
    pub fn registered_groups(&self) -> u32 {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, handler)| handler.is_some())
            .fold(0, |mask, (group, _)| mask | (1 << group))
    }

    pub fn dispatch(&self, event: &AenqEvent) {
        if let Some(observer) = &self.observer {
            observer.handle(event);
        }
        let handler = event
            .group
            .table_index()
            .and_then(|index| self.table[index].as_ref())
            .unwrap_or(&self.fallback);
        handler.handle(event);
    }
}

impl std::fmt::Debug for AenqHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AenqHandlers")
            .field("registered_groups", &format_args!("{:#x}", self.registered_groups()))
            .finish()
    }
}

/// Host side of the AENQ ring.
pub struct Aenq {
    regs: Arc<dyn RegisterSpace>,
    buf: DmaBuffer,
    depth: u16,
    head: Mutex<RingCursor>,
    handlers: AenqHandlers,
    max_passes: u32,
    events: AtomicU64,
}

impl Aenq {
    /// Allocate the ring. The host head starts at `depth` so the first
    /// doorbell hands the whole ring to the device.
    pub fn new(
        regs: Arc<dyn RegisterSpace>,
        allocator: &Arc<dyn DmaAllocator>,
        depth: u16,
        handlers: AenqHandlers,
        max_passes: u32,
    ) -> ComResult<Self> {
        if !depth.is_power_of_two() {
            return Err(ComError::InvalidParameter(format!(
                "AENQ depth {} must be a power of two",
                depth
            )));
        }
        let buf = DmaBuffer::new(allocator, depth as usize * ENTRY_SIZE)?;
        Ok(Self {
            regs,
            buf,
            depth,
            head: Mutex::new(RingCursor::with_counter(depth, depth)),
            handlers,
            max_passes: max_passes.max(1),
            events: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Events dispatched so far.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn handlers(&self) -> &AenqHandlers {
        &self.handlers
    }

    /// Program the ring base and caps registers.
    pub fn program(&self) {
        let addr = self.buf.dma_addr();
        self.regs.write32(regs::AENQ_BASE_LO, regs::addr_low(addr));
        self.regs.write32(regs::AENQ_BASE_HI, regs::addr_high(addr));
        self.regs
            .write32(regs::AENQ_CAPS, regs::queue_caps(self.depth, ENTRY_SIZE));
    }

    /// Hand the free ring to the device.
    pub fn enable(&self) {
        let head = lock(&self.head);
        self.regs.write32(regs::AENQ_HEAD_DB, head.counter() as u32);
    }

    fn entry_phase(&self, cursor: &RingCursor) -> u8 {
        self.buf
            .read_u8(cursor.index() as usize * ENTRY_SIZE + AENQ_PHASE_OFFSET)
            & PHASE_MASK
    }

    /// Dispatch every pending event in order. Returns the number dispatched.
    ///
    /// After each pass that consumed events the head doorbell is written and
    /// the ring rescanned, so events the device posts into the freed slots
    /// are delivered by the same call. Handlers run with the ring lock held
    /// and must not call back into `process_pending`.
    pub fn process_pending(&self) -> usize {
        let mut head = lock(&self.head);
        let mut total = 0;

        for _ in 0..self.max_passes {
            let mut consumed = 0;
            while self.entry_phase(&head) == head.current_phase() {
                // Phase is written last; read the body after it.
                fence(Ordering::Acquire);
                let entry: AenqEntry = self.buf.read(head.index() as usize * ENTRY_SIZE);
                let event = AenqEvent::from(&entry);
                log::debug!(
                    "AENQ! Group[{}] Syndrome[{:#x}] timestamp: [{}s]",
                    event.group,
                    event.syndrome,
                    event.timestamp
                );
                self.handlers.dispatch(&event);
                head.advance();
                consumed += 1;
            }

            if consumed == 0 {
                break;
            }
            total += consumed;
            fence(Ordering::Release);
            self.regs.write32(regs::AENQ_HEAD_DB, head.counter() as u32);
        }

        self.events.fetch_add(total as u64, Ordering::Relaxed);
        total
    }

    /// Whether a keep-alive event is queued, without consuming anything.
    pub fn has_pending_keep_alive(&self) -> bool {
        let mut cursor = *lock(&self.head);
        for _ in 0..self.depth {
            if self.entry_phase(&cursor) != cursor.current_phase() {
                break;
            }
            fence(Ordering::Acquire);
            let entry: AenqEntry = self.buf.read(cursor.index() as usize * ENTRY_SIZE);
            if EventGroup::from(entry.common.group) == EventGroup::KeepAlive {
                return true;
            }
            cursor.advance();
        }
        false
    }
}

impl std::fmt::Debug for Aenq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aenq")
            .field("depth", &self.depth)
            .field("events", &self.events())
            .finish()
    }
}
