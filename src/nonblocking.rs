// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Awaitable admin commands for tokio runtimes.
//!
//! Admin waits spin and sleep on the calling thread, so they run on the
//! blocking pool instead of a runtime worker.

use crate::admin::AdminQueue;
use crate::descriptor::{AcqEntry, AqEntry};
use crate::error::{ComError, ComResult};
use crate::family::DeviceFamily;
use bytemuck::Pod;
use std::sync::Arc;

async fn run_blocking<T, Op>(op: Op) -> ComResult<T>
where
    T: Send + 'static,
    Op: FnOnce() -> ComResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op).await.map_err(|e| {
        log::error!("Blocking admin task failed: {}", e);
        ComError::NotRunning
    })?
}

/// Submit `command` and wait for its typed response.
pub async fn execute_admin_command<F, C, R>(queue: Arc<AdminQueue<F>>, command: C) -> ComResult<R>
where
    F: DeviceFamily,
    C: Pod + Send,
    R: Pod + Send,
{
    run_blocking(move || queue.execute(command)).await
}

/// Submit a raw entry and wait for its completion.
pub async fn submit_and_wait<F: DeviceFamily>(
    queue: Arc<AdminQueue<F>>,
    entry: AqEntry,
) -> ComResult<AcqEntry> {
    run_blocking(move || queue.submit(entry)?.wait()).await
}

/// Wait until every aborted command has been reaped.
pub async fn wait_for_abort_completion<F: DeviceFamily>(queue: Arc<AdminQueue<F>>) -> ComResult<()> {
    run_blocking(move || queue.wait_for_quiescence()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComConfig;
    use crate::descriptor::{FeatureCmd, FeatureResp};
    use crate::dma::{DmaAllocator, HostDmaAllocator};
    use crate::ena::{self, features::DeviceAttributes, Ena};
    use crate::sim::SimDevice;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().build().unwrap()
    }

    fn queue(sim: &Arc<SimDevice>) -> Arc<AdminQueue<Ena>> {
        let allocator: Arc<dyn DmaAllocator> = Arc::new(HostDmaAllocator::new());
        let config = ComConfig::default().with_admin_polling(true);
        Arc::new(AdminQueue::new(sim.clone(), &allocator, &config).unwrap())
    }

    #[test]
    fn test_execute_awaits_response() {
        let sim = SimDevice::ena();
        let queue = queue(&sim);
        let cmd = FeatureCmd::new(
            ena::AdminOpcode::GetFeature as u8,
            ena::FeatureId::DeviceAttributes as u8,
            0,
        );
        let resp: FeatureResp = runtime()
            .block_on(execute_admin_command(queue.clone(), cmd))
            .unwrap();
        let attrs: DeviceAttributes = resp.body();
        assert_eq!(attrs.max_mtu, sim.max_mtu());
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_device_error_propagates() {
        let sim = SimDevice::ena();
        let queue = queue(&sim);
        let entry = AqEntry::new(ena::AdminOpcode::GetStats as u8);
        let result = runtime().block_on(submit_and_wait(queue, entry));
        assert!(matches!(result, Err(ComError::Unsupported)));
    }

    #[test]
    fn test_quiescence_after_abort() {
        let sim = SimDevice::ena();
        sim.set_admin_stall(true);
        let queue = queue(&sim);
        let handle = queue.submit(AqEntry::new(ena::AdminOpcode::GetFeature as u8)).unwrap();
        assert_eq!(queue.abort_all(), 1);
        assert!(matches!(handle.wait(), Err(ComError::Aborted)));
        runtime()
            .block_on(wait_for_abort_completion(queue))
            .unwrap();
    }
}
