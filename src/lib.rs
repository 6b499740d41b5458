// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # Amazon ENA/EFA command queue core
//!
//! Host side of the control plane shared by the Elastic Network Adapter and
//! the Elastic Fabric Adapter:
//!
//! - Admin submission/completion queue pair with a completion context pool,
//!   in interrupt or polling mode
//! - Asynchronous event notification queue (AENQ) with per-group handlers
//! - Device bring-up: reset, version validation, DMA width, feature discovery
//! - Readless register reads through a DMA response buffer
//! - I/O submission and completion rings, including device-placed (LLQ)
//!   submission queues
//! - Health monitoring: keep-alive, missing admin interrupts, fatal status
//!
//! The crate does not map PCI BARs itself. Callers provide a
//! [`RegisterSpace`] for the register BAR, optionally a [`DeviceMemory`] for
//! the LLQ BAR, and a [`DmaAllocator`] for coherent memory.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ena_com::{AenqHandlers, ComConfig, ComError, EnaDevice, HostDmaAllocator, RegisterSpace};
//! use std::sync::Arc;
//!
//! fn bring_up(bar: Arc<dyn RegisterSpace>) -> Result<(), ComError> {
//!     let device = EnaDevice::new(
//!         bar,
//!         None,
//!         Arc::new(HostDmaAllocator::new()),
//!         ComConfig::default(),
//!     )?;
//!     let features = device.init(AenqHandlers::with_logging_fallback())?;
//!     println!("max MTU: {}", features.device_attributes.max_mtu);
//!     Ok(())
//! }
//! ```
//!
//! ## Cargo features
//!
//! - `sim`: software device model in [`sim`], used by the tests and benches
//! - `async` / `tokio`: awaitable admin commands in `nonblocking`

use std::sync::{Mutex, MutexGuard};

// Module declarations
pub mod admin;
pub mod aenq;
pub mod backoff;
pub mod config;
pub mod ctx;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod efa;
pub mod ena;
pub mod error;
pub mod family;
pub mod health;
pub mod io_queue;
pub mod mmio;
pub mod regs;
pub mod ring;

#[cfg(feature = "tokio")]
pub mod nonblocking;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports for convenient access
pub use admin::{AdminQueue, AdminStatsSnapshot, CompletionHandle};
pub use aenq::{AenqConfig, AenqEvent, AenqHandler, AenqHandlers, EventGroup};
pub use config::ComConfig;
pub use descriptor::{AcqEntry, AenqEntry, AqEntry};
pub use device::{ComDevice, DeviceState, TimeoutHints};
pub use dma::{DmaAllocator, DmaBuffer, DmaRegion, HostDmaAllocator};
pub use efa::{Efa, EfaDevice, EfaFeatures};
pub use ena::{Ena, EnaDevice, EnaFeatures, IoQueueParams};
pub use error::{AdminStatus, ComError, ComResult};
pub use family::DeviceFamily;
pub use health::HealthMonitor;
pub use io_queue::{Direction, IoCq, IoQueuePair, IoQueueState, IoSq, Placement};
pub use regs::{DeviceMemory, RegisterSpace, ResetReason};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
