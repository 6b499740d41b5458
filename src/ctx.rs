// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Completion context pool.
//!
//! One slot per admin queue entry. Each slot is an explicit state machine:
//!
//! ```text
//! Free ──capture──> Submitted ──complete──> Completed ──take──> Free
//!                       │  └──abort──> Aborted ──take──> Free
//!                       └──abandon──> Abandoned ──complete/abort──> Free
//! ```
//!
//! `outstanding` counts every slot that is not `Free`, so it reaches zero
//! only after every captured slot has been released exactly once.

use crate::descriptor::AcqEntry;
use crate::error::ComError;
use crate::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

/// State of one completion slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Command posted, waiting for the device.
    Submitted { cmd_id: u16, opcode: u8 },
    /// Device completion stored, waiting for the submitter.
    Completed { cmd_id: u16, entry: AcqEntry },
    /// Queue torn down while the command was in flight.
    Aborted { cmd_id: u16 },
    /// Submitter gave up; the next completion or abort frees the slot.
    Abandoned { cmd_id: u16 },
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Submitted { .. } => "submitted",
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Abandoned { .. } => "abandoned",
        }
    }

    /// True once the submitter can collect a result.
    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Aborted { .. })
    }
}

/// Result collected by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Completed(AcqEntry),
    Aborted,
}

/// Pool bookkeeping errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("slot {index} out of range (depth {depth})")]
    OutOfRange { index: usize, depth: usize },

    #[error("slot {index} is already {state}")]
    AlreadyOccupied { index: usize, state: &'static str },

    #[error("completion for command id {cmd_id} does not match slot {index} ({state})")]
    UnexpectedCompletion {
        index: usize,
        cmd_id: u16,
        state: &'static str,
    },
}

impl From<ContextError> for ComError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::OutOfRange { .. } => ComError::InvalidParameter(err.to_string()),
            ContextError::AlreadyOccupied { .. } | ContextError::UnexpectedCompletion { .. } => {
                ComError::ProtocolDesync(err.to_string())
            }
        }
    }
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

/// Fixed-size arena of completion slots indexed by `command_id & (depth - 1)`.
pub struct ContextPool {
    slots: Box<[Slot]>,
    outstanding: AtomicUsize,
}

impl ContextPool {
    pub fn new(depth: u16) -> Self {
        let slots = (0..depth)
            .map(|_| Slot {
                state: Mutex::new(SlotState::Free),
                cond: Condvar::new(),
            })
            .collect();
        Self {
            slots,
            outstanding: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slots not yet released.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn slot(&self, index: usize) -> Result<&Slot, ContextError> {
        self.slots.get(index).ok_or(ContextError::OutOfRange {
            index,
            depth: self.slots.len(),
        })
    }

    fn release_locked(&self, state: &mut SlotState) {
        *state = SlotState::Free;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Claim a free slot for a new command.
    pub fn capture(&self, index: usize, cmd_id: u16, opcode: u8) -> Result<(), ContextError> {
        let slot = self.slot(index)?;
        let mut state = lock(&slot.state);
        if *state != SlotState::Free {
            return Err(ContextError::AlreadyOccupied {
                index,
                state: state.name(),
            });
        }
        *state = SlotState::Submitted { cmd_id, opcode };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Snapshot of a slot without claiming it.
    pub fn peek(&self, index: usize) -> Result<SlotState, ContextError> {
        Ok(*lock(&self.slot(index)?.state))
    }

    /// Whether a slot is free; out-of-range slots are not.
    pub fn is_free(&self, index: usize) -> bool {
        matches!(self.peek(index), Ok(SlotState::Free))
    }

    /// Store a device completion and wake the waiter.
    pub fn complete(&self, index: usize, entry: AcqEntry) -> Result<(), ContextError> {
        let slot = self.slot(index)?;
        let cmd_id = entry.command_id();
        let mut state = lock(&slot.state);
        match *state {
            SlotState::Submitted { cmd_id: expected, .. } if expected == cmd_id => {
                *state = SlotState::Completed { cmd_id, entry };
                slot.cond.notify_all();
                Ok(())
            }
            SlotState::Abandoned { cmd_id: expected } if expected == cmd_id => {
                self.release_locked(&mut state);
                Ok(())
            }
            other => Err(ContextError::UnexpectedCompletion {
                index,
                cmd_id,
                state: other.name(),
            }),
        }
    }

    /// Abort every in-flight slot and free abandoned ones.
    ///
    /// Completed slots keep their result. Returns the number of aborted slots.
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for slot in self.slots.iter() {
            let mut state = lock(&slot.state);
            match *state {
                SlotState::Submitted { cmd_id, .. } => {
                    *state = SlotState::Aborted { cmd_id };
                    slot.cond.notify_all();
                    aborted += 1;
                }
                SlotState::Abandoned { .. } => self.release_locked(&mut state),
                _ => {}
            }
        }
        aborted
    }

    /// Block until the slot settles or `timeout` elapses. Returns whether
    /// it settled.
    pub fn wait_settled(&self, index: usize, timeout: Duration) -> Result<bool, ContextError> {
        let slot = self.slot(index)?;
        let guard = lock(&slot.state);
        let (guard, _) = slot
            .cond
            .wait_timeout_while(guard, timeout, |state| {
                matches!(state, SlotState::Submitted { .. })
            })
            .unwrap_or_else(|e| e.into_inner());
        Ok(guard.is_settled())
    }

    /// Collect a settled result and release the slot.
    ///
    /// Returns `None` if the slot has not settled.
    pub fn take(&self, index: usize) -> Result<Option<SlotOutcome>, ContextError> {
        let slot = self.slot(index)?;
        let mut state = lock(&slot.state);
        let outcome = match *state {
            SlotState::Completed { entry, .. } => SlotOutcome::Completed(entry),
            SlotState::Aborted { .. } => SlotOutcome::Aborted,
            _ => return Ok(None),
        };
        self.release_locked(&mut state);
        Ok(Some(outcome))
    }

    /// Give up on a slot. A settled slot is released now, an in-flight one
    /// when its completion or an abort arrives.
    pub fn abandon(&self, index: usize) -> Result<(), ContextError> {
        let slot = self.slot(index)?;
        let mut state = lock(&slot.state);
        match *state {
            SlotState::Submitted { cmd_id, .. } => *state = SlotState::Abandoned { cmd_id },
            SlotState::Completed { .. } | SlotState::Aborted { .. } => {
                self.release_locked(&mut state)
            }
            SlotState::Free | SlotState::Abandoned { .. } => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("depth", &self.depth())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use std::sync::Arc;
    use std::time::Instant;

    fn completion(cmd_id: u16) -> AcqEntry {
        let mut entry = AcqEntry::zeroed();
        entry.common.command = cmd_id;
        entry
    }

    #[test]
    fn test_capture_complete_take() {
        let pool = ContextPool::new(4);
        pool.capture(1, 1, 8).unwrap();
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.peek(1).unwrap(), SlotState::Submitted { cmd_id: 1, opcode: 8 });
        assert_eq!(pool.take(1).unwrap(), None);

        pool.complete(1, completion(1)).unwrap();
        assert!(pool.peek(1).unwrap().is_settled());
        assert!(matches!(pool.take(1).unwrap(), Some(SlotOutcome::Completed(_))));
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.is_free(1));
    }

    #[test]
    fn test_double_capture_rejected() {
        let pool = ContextPool::new(4);
        pool.capture(2, 2, 8).unwrap();
        assert!(matches!(
            pool.capture(2, 2, 8),
            Err(ContextError::AlreadyOccupied { index: 2, .. })
        ));
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_out_of_range() {
        let pool = ContextPool::new(4);
        assert!(matches!(
            pool.capture(4, 4, 8),
            Err(ContextError::OutOfRange { index: 4, depth: 4 })
        ));
        assert!(pool.peek(9).is_err());
        assert!(!pool.is_free(9));
    }

    #[test]
    fn test_completion_for_free_slot_is_desync() {
        let pool = ContextPool::new(4);
        let err = pool.complete(0, completion(0)).unwrap_err();
        assert!(matches!(err, ContextError::UnexpectedCompletion { .. }));
        assert!(matches!(ComError::from(err), ComError::ProtocolDesync(_)));
    }

    #[test]
    fn test_completion_with_stale_tag_is_desync() {
        let pool = ContextPool::new(4);
        pool.capture(0, 4, 8).unwrap();
        assert!(pool.complete(0, completion(0)).is_err());
        assert_eq!(pool.peek(0).unwrap(), SlotState::Submitted { cmd_id: 4, opcode: 8 });
    }

    #[test]
    fn test_abort_keeps_completed_results() {
        let pool = ContextPool::new(4);
        pool.capture(0, 0, 8).unwrap();
        pool.capture(1, 1, 8).unwrap();
        pool.complete(1, completion(1)).unwrap();

        assert_eq!(pool.abort_all(), 1);
        assert_eq!(pool.take(0).unwrap(), Some(SlotOutcome::Aborted));
        assert!(matches!(pool.take(1).unwrap(), Some(SlotOutcome::Completed(_))));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_abandoned_slot_released_by_completion() {
        let pool = ContextPool::new(4);
        pool.capture(3, 3, 8).unwrap();
        pool.abandon(3).unwrap();
        assert_eq!(pool.peek(3).unwrap(), SlotState::Abandoned { cmd_id: 3 });
        assert_eq!(pool.outstanding(), 1);
        pool.complete(3, completion(3)).unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.is_free(3));
    }

    #[test]
    fn test_abandoned_slot_released_by_abort() {
        let pool = ContextPool::new(4);
        pool.capture(0, 0, 8).unwrap();
        pool.abandon(0).unwrap();
        assert_eq!(pool.abort_all(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_abandon_settled_releases() {
        let pool = ContextPool::new(4);
        pool.capture(0, 0, 8).unwrap();
        pool.complete(0, completion(0)).unwrap();
        pool.abandon(0).unwrap();
        assert_eq!(pool.outstanding(), 0);
        // Releasing twice is a no-op.
        pool.abandon(0).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_wait_settled_times_out() {
        let pool = ContextPool::new(2);
        pool.capture(0, 0, 8).unwrap();
        let start = Instant::now();
        assert!(!pool.wait_settled(0, Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_settled_woken_by_completion() {
        let pool = Arc::new(ContextPool::new(2));
        pool.capture(1, 1, 8).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.wait_settled(1, Duration::from_secs(5)).unwrap())
        };
        std::thread::sleep(Duration::from_millis(10));
        pool.complete(1, completion(1)).unwrap();
        assert!(waiter.join().unwrap());
    }
}
