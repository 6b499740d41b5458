// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register reads, direct or through the readless handshake.
//!
//! In readless mode the host never loads from BAR space. It writes the
//! target offset and a sequence number to `MMIO_REG_READ`, and the device
//! answers by DMA-writing `{req_id, reg_off, reg_val}` into a small response
//! buffer whose address was programmed into `MMIO_RESP_LO/HI`.

use crate::backoff::{poll_until, Backoff};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{ComError, ComResult};
use crate::lock;
use crate::regs::{self, RegisterSpace, MMIO_READ_TIMEOUT};
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Response record written by the device for a readless read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ReadlessResponse {
    pub req_id: u16,
    pub reg_off: u16,
    pub reg_val: u32,
}

const _: () = assert!(std::mem::size_of::<ReadlessResponse>() == 8);

/// Poison added to the sequence number before each request so a stale
/// response can never match.
const REQ_ID_POISON: u16 = 0xDEAD;

struct ReadlessState {
    seq: u16,
    resp: DmaBuffer,
}

/// 32-bit register reader.
pub struct MmioReader {
    regs: Arc<dyn RegisterSpace>,
    readless: Option<Mutex<ReadlessState>>,
    backoff: Backoff,
    timeout_us: AtomicU64,
}

impl MmioReader {
    /// Reader that loads registers directly.
    pub fn direct(regs: Arc<dyn RegisterSpace>, timeout: Duration) -> Self {
        Self {
            regs,
            readless: None,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO, 0),
            timeout_us: AtomicU64::new(timeout.as_micros() as u64),
        }
    }

    /// Reader that uses the readless handshake.
    ///
    /// Allocates the response buffer and programs its address. `backoff`
    /// spaces the polls of the response buffer.
    pub fn readless(
        regs: Arc<dyn RegisterSpace>,
        allocator: &Arc<dyn DmaAllocator>,
        timeout: Duration,
        backoff: Backoff,
    ) -> ComResult<Self> {
        let resp = DmaBuffer::new(allocator, std::mem::size_of::<ReadlessResponse>())?;
        let reader = Self {
            regs,
            readless: Some(Mutex::new(ReadlessState { seq: 0, resp })),
            backoff,
            timeout_us: AtomicU64::new(timeout.as_micros() as u64),
        };
        reader.write_response_address();
        Ok(reader)
    }

    #[inline]
    pub fn is_readless(&self) -> bool {
        self.readless.is_some()
    }

    /// Replace the per-read timeout (device hints).
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_us
            .store(timeout.as_micros() as u64, Ordering::Release);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us.load(Ordering::Acquire))
    }

    /// Poll schedule of readless reads.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Program the response buffer address. Must be repeated after a
    /// device reset, which clears it.
    pub fn write_response_address(&self) {
        if let Some(state) = &self.readless {
            let state = lock(state);
            let addr = state.resp.dma_addr();
            self.regs.write32(regs::MMIO_RESP_LO, regs::addr_low(addr));
            self.regs.write32(regs::MMIO_RESP_HI, regs::addr_high(addr));
        }
    }

    /// Read a register. Returns [`MMIO_READ_TIMEOUT`] if the device did not
    /// answer in time or answered for another offset.
    pub fn read32(&self, offset: u32) -> u32 {
        let Some(state) = &self.readless else {
            return self.regs.read32(offset);
        };

        let mut state = lock(state);
        state.seq = state.seq.wrapping_add(1);
        let seq = state.seq;
        state.resp.write::<u16>(0, seq.wrapping_add(REQ_ID_POISON));

        let request = ((offset << regs::MMIO_REG_READ_REG_OFF_SHIFT)
            & regs::MMIO_REG_READ_REG_OFF_MASK)
            | (seq as u32 & regs::MMIO_REG_READ_REQ_ID_MASK);
        fence(Ordering::SeqCst);
        self.regs.write32(regs::MMIO_REG_READ, request);

        let resp = &state.resp;
        let result = poll_until(&self.backoff, self.timeout(), || {
            let response: ReadlessResponse = resp.read(0);
            Ok((response.req_id == seq).then_some(response))
        });

        match result {
            Ok(response) => {
                fence(Ordering::Acquire);
                // Re-read after the barrier so the value is not older than req_id.
                let response: ReadlessResponse = resp.read(0);
                if response.reg_off as u32 != offset {
                    log::error!(
                        "Readless read returned offset {:#x}, expected {:#x}",
                        response.reg_off,
                        offset
                    );
                    return MMIO_READ_TIMEOUT;
                }
                response.reg_val
            }
            Err(_) => {
                let response: ReadlessResponse = resp.read(0);
                log::error!(
                    "Reading reg failed for timeout. expected: req id[{}] offset[{:#x}] actual: req id[{}] offset[{:#x}]",
                    seq,
                    offset,
                    response.req_id,
                    response.reg_off
                );
                MMIO_READ_TIMEOUT
            }
        }
    }

    /// Read a register, mapping the timeout sentinel to `ComError::Timeout`.
    pub fn try_read32(&self, offset: u32) -> ComResult<u32> {
        match self.read32(offset) {
            MMIO_READ_TIMEOUT => {
                log::error!("Reg read timeout occurred (offset {:#x})", offset);
                Err(ComError::Timeout)
            }
            value => Ok(value),
        }
    }
}
