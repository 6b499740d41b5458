// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device lifecycle shared by both families.
//!
//! ```text
//! Reset ─validate_version─> VersionValidated ─admin_init─> AdminQueueUp
//!   ^                                                          │
//!   │                                               discover features
//!   │                                                          v
//! Resetting <──reset_device── Running <──start── IoQueuesUp <─ FeaturesDiscovered
//! ```
//!
//! [`ComDevice`] owns the register reader, the admin queue, the AENQ and the
//! health monitor. Family front-ends ([`crate::ena::EnaDevice`],
//! [`crate::efa::EfaDevice`]) add feature discovery and family commands.

use crate::admin::{AdminQueue, CompletionHandle};
use crate::aenq::{Aenq, AenqConfig, AenqHandlers};
use crate::backoff::{poll_until, Backoff};
use crate::config::ComConfig;
use crate::descriptor::{AcqEntry, AqEntry, FeatureCmd, FeatureResp, MemAddr};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{ComError, ComResult};
use crate::family::DeviceFamily;
use crate::health::{HealthMonitor, HW_HINTS_NO_TIMEOUT};
use crate::lock;
use crate::mmio::MmioReader;
use crate::regs::{self, DevStatus, RegisterSpace, ResetReason};
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Resolution of the reset and admin timeout fields in CAPS.
const CAPS_TIMEOUT_UNIT: Duration = Duration::from_millis(100);

/// INTR_MASK value that masks the admin interrupt.
const ADMIN_INTR_MASK: u32 = 0x1;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceState {
    Reset,
    VersionValidated,
    AdminQueueUp,
    FeaturesDiscovered,
    IoQueuesUp,
    Running,
    Resetting,
}

impl DeviceState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::VersionValidated => "version-validated",
            Self::AdminQueueUp => "admin-queue-up",
            Self::FeaturesDiscovered => "features-discovered",
            Self::IoQueuesUp => "io-queues-up",
            Self::Running => "running",
            Self::Resetting => "resetting",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Timeouts carried by the HW hints feature of either family.
///
/// A zero field leaves the current value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutHints {
    pub mmio_read_timeout_ms: u16,
    pub admin_completion_timeout_ms: u16,
    /// Keep-alive watchdog; [`HW_HINTS_NO_TIMEOUT`] disables it.
    pub driver_watchdog_timeout_ms: u16,
    pub missing_tx_threshold: u16,
}

/// Map an `Unsupported` answer for an optional feature to `None`.
pub(crate) fn optional<T>(result: ComResult<T>) -> ComResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ComError::Unsupported) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Family-generic device core.
pub struct ComDevice<F: DeviceFamily> {
    regs: Arc<dyn RegisterSpace>,
    allocator: Arc<dyn DmaAllocator>,
    config: ComConfig,
    mmio: MmioReader,
    state: Mutex<DeviceState>,
    admin: Mutex<Option<Arc<AdminQueue<F>>>>,
    aenq: Mutex<Option<Arc<Aenq>>>,
    health: Arc<HealthMonitor>,
    dma_width: AtomicU8,
    supported_features: AtomicU32,
    admin_timeout_us: AtomicU64,
    backoff: Backoff,
    _family: PhantomData<fn() -> F>,
}

impl<F: DeviceFamily> ComDevice<F> {
    /// Set up the register reader. Nothing is written to the device except
    /// the readless response address when readless mode is configured.
    pub fn new(
        regs: Arc<dyn RegisterSpace>,
        allocator: Arc<dyn DmaAllocator>,
        config: ComConfig,
    ) -> ComResult<Self> {
        let mmio = if config.readless {
            MmioReader::readless(
                regs.clone(),
                &allocator,
                config.reg_read_timeout,
                config.readless_backoff(),
            )?
        } else {
            MmioReader::direct(regs.clone(), config.reg_read_timeout)
        };

        Ok(Self {
            regs,
            allocator,
            mmio,
            state: Mutex::new(DeviceState::Reset),
            admin: Mutex::new(None),
            aenq: Mutex::new(None),
            health: Arc::new(HealthMonitor::new(
                config.keep_alive_timeout,
                config.missing_tx_threshold,
            )),
            dma_width: AtomicU8::new(0),
            supported_features: AtomicU32::new(0),
            admin_timeout_us: AtomicU64::new(config.admin_completion_timeout.as_micros() as u64),
            backoff: Backoff::new(
                config.min_poll_delay,
                config.max_poll_delay,
                config.max_backoff_exp,
            ),
            config,
            _family: PhantomData,
        })
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    pub fn config(&self) -> &ComConfig {
        &self.config
    }

    pub fn registers(&self) -> &Arc<dyn RegisterSpace> {
        &self.regs
    }

    pub fn allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.allocator
    }

    pub fn mmio(&self) -> &MmioReader {
        &self.mmio
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// DMA width read by [`Self::get_dma_width`], or the family maximum
    /// before that.
    pub fn dma_width(&self) -> u8 {
        match self.dma_width.load(Ordering::Acquire) {
            0 => F::MAX_DMA_WIDTH,
            width => width,
        }
    }

    /// Supported-features bitmap from the device attributes.
    pub fn supported_features(&self) -> u32 {
        self.supported_features.load(Ordering::Acquire)
    }

    pub(crate) fn set_supported_features(&self, features: u32) {
        self.supported_features.store(features, Ordering::Release);
    }

    /// Device attributes are always allowed; everything else needs its bit.
    pub fn is_feature_supported(&self, feature_id: u8) -> bool {
        feature_id == F::DEVICE_ATTRIBUTES_FEATURE
            || (feature_id < 32 && self.supported_features() & (1 << feature_id) != 0)
    }

    pub fn admin_completion_timeout(&self) -> Duration {
        Duration::from_micros(self.admin_timeout_us.load(Ordering::Acquire))
    }

    /// Used for the admin queue created next and the one already running.
    pub fn set_admin_completion_timeout(&self, timeout: Duration) {
        self.admin_timeout_us
            .store(timeout.as_micros() as u64, Ordering::Release);
        if let Some(admin) = lock(&self.admin).as_ref() {
            admin.set_completion_timeout(timeout);
        }
    }

    // ========================================================================
    // State machine
    // ========================================================================

    fn invalid_state(state: DeviceState, operation: &'static str) -> ComError {
        log::error!("Cannot {} in {} device state {}", operation, F::NAME, state);
        ComError::InvalidState {
            state: state.name(),
            operation,
        }
    }

    fn transition(
        &self,
        from: &[DeviceState],
        to: DeviceState,
        operation: &'static str,
    ) -> ComResult<()> {
        let mut state = lock(&self.state);
        if !from.contains(&state) {
            return Err(Self::invalid_state(*state, operation));
        }
        log::info!("{} device state {} -> {}", F::NAME, *state, to);
        *state = to;
        Ok(())
    }

    /// Move forward to `to` if the device is at least in `minimum`; a device
    /// already past `to` stays where it is.
    fn advance(
        &self,
        minimum: DeviceState,
        to: DeviceState,
        operation: &'static str,
    ) -> ComResult<()> {
        let mut state = lock(&self.state);
        if *state == DeviceState::Resetting || *state < minimum {
            return Err(Self::invalid_state(*state, operation));
        }
        if to > *state {
            log::info!("{} device state {} -> {}", F::NAME, *state, to);
            *state = to;
        }
        Ok(())
    }

    pub(crate) fn require(&self, minimum: DeviceState, operation: &'static str) -> ComResult<()> {
        let state = self.state();
        if state == DeviceState::Resetting || state < minimum {
            return Err(Self::invalid_state(state, operation));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: DeviceState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn mark_features_discovered(&self) -> ComResult<()> {
        self.advance(
            DeviceState::AdminQueueUp,
            DeviceState::FeaturesDiscovered,
            "record discovered features",
        )
    }

    pub(crate) fn mark_io_queues_up(&self) -> ComResult<()> {
        self.advance(
            DeviceState::FeaturesDiscovered,
            DeviceState::IoQueuesUp,
            "record I/O queue bring-up",
        )
    }

    /// Declare bring-up complete.
    pub fn start(&self) -> ComResult<()> {
        self.advance(
            DeviceState::FeaturesDiscovered,
            DeviceState::Running,
            "start the device",
        )
    }

    // ========================================================================
    // Registers
    // ========================================================================

    fn read_reg(&self, offset: u32) -> ComResult<u32> {
        self.mmio.try_read32(offset)
    }

    fn device_status(&self) -> ComResult<DevStatus> {
        Ok(DevStatus::from_bits_retain(self.read_reg(regs::DEV_STS)?))
    }

    fn wait_for_reset_state(&self, timeout: Duration, in_progress: bool) -> ComResult<()> {
        poll_until(&self.backoff, timeout, || {
            let status = self.device_status()?;
            Ok((status.contains(DevStatus::RESET_IN_PROGRESS) == in_progress).then_some(()))
        })
    }

    /// Reset the device and derive the admin timeout from CAPS.
    ///
    /// Only allowed while no admin queue exists.
    pub fn reset(&self, reason: ResetReason) -> ComResult<()> {
        let state = self.state();
        if !matches!(
            state,
            DeviceState::Reset | DeviceState::VersionValidated | DeviceState::Resetting
        ) {
            return Err(Self::invalid_state(state, "reset the device"));
        }

        if !self.device_status()?.contains(DevStatus::READY) {
            log::error!("Device isn't ready, can't reset device");
            return Err(ComError::DeviceNotReady);
        }

        let caps = self.read_reg(regs::CAPS)?;
        let units = (caps & regs::CAPS_RESET_TIMEOUT_MASK) >> regs::CAPS_RESET_TIMEOUT_SHIFT;
        if units == 0 {
            log::error!("Invalid timeout value");
            return Err(ComError::InvalidParameter(
                "device reported a zero reset timeout".to_string(),
            ));
        }
        let timeout = CAPS_TIMEOUT_UNIT * units;

        log::info!("Resetting {} device, reason {}", F::NAME, reason);
        self.regs.write32(regs::DEV_CTL, reason.dev_ctl_value());

        // The reset cleared the readless response address.
        self.mmio.write_response_address();

        self.wait_for_reset_state(timeout, true)
            .inspect_err(|_| log::error!("Reset indication didn't turn on"))?;

        self.regs.write32(regs::DEV_CTL, 0);
        self.wait_for_reset_state(timeout, false)
            .inspect_err(|_| log::error!("Reset indication didn't turn off"))?;

        let admin_units = (caps & regs::CAPS_ADMIN_CMD_TO_MASK) >> regs::CAPS_ADMIN_CMD_TO_SHIFT;
        let admin_timeout = if admin_units == 0 {
            self.config.admin_completion_timeout
        } else {
            CAPS_TIMEOUT_UNIT * admin_units
        };
        self.set_admin_completion_timeout(admin_timeout);
        log::debug!("{} admin completion timeout {:?}", F::NAME, admin_timeout);

        if state == DeviceState::VersionValidated {
            self.transition(&[DeviceState::VersionValidated], DeviceState::Reset, "reset the device")?;
        }
        Ok(())
    }

    /// Check the device and controller versions against the family minimums.
    pub fn validate_version(&self) -> ComResult<()> {
        let state = self.state();
        if state != DeviceState::Reset {
            return Err(Self::invalid_state(state, "validate the device version"));
        }

        let ver = self.read_reg(regs::VERSION)?;
        let ctrl_ver = self.read_reg(regs::CONTROLLER_VERSION)?;

        log::info!(
            "{} device version: {}.{}",
            F::NAME,
            (ver & regs::VERSION_MAJOR_MASK) >> regs::VERSION_MAJOR_SHIFT,
            ver & regs::VERSION_MINOR_MASK
        );
        log::info!(
            "{} controller version: {}.{}.{} implementation version {}",
            F::NAME,
            (ctrl_ver & regs::CTRL_MAJOR_MASK) >> regs::CTRL_MAJOR_SHIFT,
            (ctrl_ver & regs::CTRL_MINOR_MASK) >> regs::CTRL_MINOR_SHIFT,
            ctrl_ver & regs::CTRL_SUBMINOR_MASK,
            (ctrl_ver & regs::CTRL_IMPL_ID_MASK) >> regs::CTRL_IMPL_ID_SHIFT
        );

        let ver = ver & (regs::VERSION_MAJOR_MASK | regs::VERSION_MINOR_MASK);
        if ver < F::MIN_VERSION {
            log::error!("{} version is lower than the minimal version the driver supports", F::NAME);
            return Err(ComError::UnsupportedVersion {
                what: "device",
                found: ver,
                required: F::MIN_VERSION,
            });
        }

        // The implementation id is allowed to vary.
        let ctrl = ctrl_ver & !regs::CTRL_IMPL_ID_MASK;
        if ctrl < F::MIN_CTRL_VERSION {
            log::error!("{} controller version is lower than the minimal version the driver supports", F::NAME);
            return Err(ComError::UnsupportedVersion {
                what: "controller",
                found: ctrl,
                required: F::MIN_CTRL_VERSION,
            });
        }

        self.transition(
            &[DeviceState::Reset],
            DeviceState::VersionValidated,
            "validate the device version",
        )
    }

    /// Read and range-check the DMA address width.
    pub fn get_dma_width(&self) -> ComResult<u8> {
        let caps = self.read_reg(regs::CAPS)?;
        let width = ((caps & regs::CAPS_DMA_ADDR_WIDTH_MASK) >> regs::CAPS_DMA_ADDR_WIDTH_SHIFT) as u8;
        log::debug!("{} dma width: {}", F::NAME, width);

        if !(F::MIN_DMA_WIDTH..=F::MAX_DMA_WIDTH).contains(&width) {
            log::error!("DMA width illegal value: {}", width);
            return Err(ComError::InvalidParameter(format!(
                "DMA width {} outside {}..={}",
                width,
                F::MIN_DMA_WIDTH,
                F::MAX_DMA_WIDTH
            )));
        }

        self.dma_width.store(width, Ordering::Release);
        Ok(width)
    }

    // ========================================================================
    // Admin queue and AENQ
    // ========================================================================

    fn write_intr_mask(&self, polling: bool) {
        self.regs
            .write32(regs::INTR_MASK, if polling { ADMIN_INTR_MASK } else { 0 });
    }

    /// Create the admin queue and the AENQ.
    ///
    /// The health monitor is attached to `handlers` as dispatch observer.
    /// The AENQ is programmed but not handed to the device until
    /// [`Self::aenq_enable`].
    pub fn admin_init(&self, handlers: AenqHandlers) -> ComResult<()> {
        let state = self.state();
        if state != DeviceState::VersionValidated {
            return Err(Self::invalid_state(state, "initialise the admin queue"));
        }

        if !self.device_status()?.contains(DevStatus::READY) {
            log::error!("Device isn't ready, abort com init");
            return Err(ComError::DeviceNotReady);
        }

        let config = self
            .config
            .clone()
            .with_admin_completion_timeout(self.admin_completion_timeout());
        let admin = Arc::new(AdminQueue::<F>::new(
            self.regs.clone(),
            &self.allocator,
            &config,
        )?);

        let handlers = handlers.with_observer(self.health.clone());
        let aenq = Arc::new(Aenq::new(
            self.regs.clone(),
            &self.allocator,
            config.aenq_depth,
            handlers,
            config.aenq_max_passes,
        )?);
        aenq.program();
        self.write_intr_mask(config.admin_polling);

        *lock(&self.admin) = Some(admin);
        *lock(&self.aenq) = Some(aenq);

        self.transition(
            &[DeviceState::VersionValidated],
            DeviceState::AdminQueueUp,
            "initialise the admin queue",
        )
    }

    /// Hand the AENQ to the device and start the keep-alive window.
    pub fn aenq_enable(&self) -> ComResult<()> {
        self.aenq()?.enable();
        self.health.touch_keep_alive();
        Ok(())
    }

    /// The admin queue, or `NotRunning` if none exists.
    pub fn admin(&self) -> ComResult<Arc<AdminQueue<F>>> {
        lock(&self.admin).clone().ok_or_else(|| {
            log::debug!("{} admin queue does not exist", F::NAME);
            ComError::NotRunning
        })
    }

    pub fn aenq(&self) -> ComResult<Arc<Aenq>> {
        lock(&self.aenq).clone().ok_or_else(|| {
            log::debug!("{} AENQ does not exist", F::NAME);
            ComError::NotRunning
        })
    }

    pub fn is_admin_running(&self) -> bool {
        lock(&self.admin)
            .as_ref()
            .is_some_and(|admin| admin.is_running())
    }

    /// Switch between polling and interrupt completion of admin commands.
    pub fn set_admin_polling_mode(&self, polling: bool) -> ComResult<()> {
        let admin = self.admin()?;
        self.write_intr_mask(polling);
        admin.set_polling(polling);
        Ok(())
    }

    pub fn set_admin_auto_polling_mode(&self, auto_polling: bool) -> ComResult<()> {
        self.admin()?.set_auto_polling(auto_polling);
        Ok(())
    }

    /// Submit a typed command and wait for its typed response.
    pub fn execute_admin_command<C: Pod, R: Pod>(&self, command: C) -> ComResult<R> {
        self.admin()?.execute(command)
    }

    /// Submit without waiting.
    pub fn submit_admin_command(&self, entry: AqEntry) -> ComResult<CompletionHandle<F>> {
        self.admin()?.submit(entry)
    }

    /// Abort every in-flight admin command. Returns the number aborted.
    pub fn abort_all_admin_commands(&self) -> usize {
        lock(&self.admin)
            .clone()
            .map_or(0, |admin| admin.abort_all())
    }

    /// Wait until aborted waiters have released their slots.
    pub fn wait_for_abort_completion(&self) -> ComResult<()> {
        match lock(&self.admin).clone() {
            Some(admin) => admin.wait_for_quiescence(),
            None => Ok(()),
        }
    }

    /// Entry point for the admin completion interrupt.
    pub fn admin_interrupt_handler(&self) {
        let admin = lock(&self.admin).clone();
        if let Some(admin) = admin {
            admin.handle_interrupt();
        }
    }

    /// Entry point for the AENQ interrupt. Returns the events dispatched.
    pub fn aenq_interrupt_handler(&self) -> usize {
        let aenq = lock(&self.aenq).clone();
        aenq.map_or(0, |aenq| aenq.process_pending())
    }

    /// Drop the admin queue and the AENQ.
    ///
    /// Ring memory is freed once the last in-flight handle is gone.
    pub fn admin_destroy(&self) {
        let admin = lock(&self.admin).take();
        let aenq = lock(&self.aenq).take();

        if let Some(admin) = &admin {
            if admin.outstanding() > 0 {
                log::warn!(
                    "Destroying {} admin queue with {} commands outstanding",
                    F::NAME,
                    admin.outstanding()
                );
            }
        }
        if admin.is_some() || aenq.is_some() {
            log::debug!("{} admin queue and AENQ destroyed", F::NAME);
        }

        let mut state = lock(&self.state);
        if *state > DeviceState::VersionValidated && *state != DeviceState::Resetting {
            log::info!("{} device state {} -> {}", F::NAME, *state, DeviceState::VersionValidated);
            *state = DeviceState::VersionValidated;
        }
    }

    // ========================================================================
    // Features
    // ========================================================================

    /// Get a feature, optionally with an out-of-line control buffer.
    ///
    /// Features missing from the supported bitmap fail with `Unsupported`
    /// without touching the ring.
    pub fn get_feature_raw(
        &self,
        feature_id: u8,
        feature_version: u8,
        control_buffer: Option<&DmaBuffer>,
    ) -> ComResult<FeatureResp> {
        if !self.is_feature_supported(feature_id) {
            log::debug!("Feature {} isn't supported", feature_id);
            return Err(ComError::Unsupported);
        }

        let mut cmd = FeatureCmd::new(F::GET_FEATURE_OPCODE, feature_id, feature_version);
        if let Some(buffer) = control_buffer {
            let address = MemAddr::new(buffer.dma_addr(), self.dma_width())?;
            cmd.set_control_buffer(address, buffer.len() as u32);
        }

        self.execute_admin_command(cmd).inspect_err(|e| {
            if !matches!(e, ComError::Unsupported) {
                log::error!("Failed to submit get_feature command {} error: {}", feature_id, e);
            }
        })
    }

    /// Get a feature and decode its body.
    pub fn get_feature<T: Pod>(&self, feature_id: u8, feature_version: u8) -> ComResult<T> {
        Ok(self.get_feature_raw(feature_id, feature_version, None)?.body())
    }

    /// Set a feature from a typed body.
    pub fn set_feature<T: Pod>(&self, feature_id: u8, body: &T) -> ComResult<()> {
        if !self.is_feature_supported(feature_id) {
            log::debug!("Feature {} isn't supported", feature_id);
            return Err(ComError::Unsupported);
        }

        let mut cmd = FeatureCmd::new(F::SET_FEATURE_OPCODE, feature_id, 0);
        cmd.set_body(body);
        let _: AcqEntry = self.execute_admin_command(cmd).inspect_err(|e| {
            log::error!("Failed to submit set_feature command {} error: {}", feature_id, e)
        })?;
        Ok(())
    }

    /// Enable the requested AENQ groups the device supports.
    /// Returns the enabled mask.
    pub fn configure_aenq_groups(&self, groups: u32) -> ComResult<u32> {
        let current: AenqConfig = self.get_feature(F::AENQ_CONFIG_FEATURE, 0)?;
        let enabled = groups & current.supported_groups;
        if enabled != groups {
            log::warn!(
                "Trying to set unsupported aenq events. supported flag: {:#x} asked flag: {:#x}",
                current.supported_groups,
                groups
            );
        }

        self.set_feature(
            F::AENQ_CONFIG_FEATURE,
            &AenqConfig {
                supported_groups: current.supported_groups,
                enabled_groups: enabled,
            },
        )?;
        Ok(enabled)
    }

    /// Apply device-provided timeouts.
    pub fn apply_hw_hints(&self, hints: &TimeoutHints) {
        if hints.mmio_read_timeout_ms != 0 {
            self.mmio
                .set_timeout(Duration::from_millis(hints.mmio_read_timeout_ms as u64));
        }
        if hints.admin_completion_timeout_ms != 0 {
            self.set_admin_completion_timeout(Duration::from_millis(
                hints.admin_completion_timeout_ms as u64,
            ));
        }
        match hints.driver_watchdog_timeout_ms {
            0 => {}
            HW_HINTS_NO_TIMEOUT => self.health.set_keep_alive_timeout(None),
            ms => self
                .health
                .set_keep_alive_timeout(Some(Duration::from_millis(ms as u64))),
        }
        if hints.missing_tx_threshold != 0 {
            self.health
                .set_missing_tx_threshold(hints.missing_tx_threshold as u32);
        }
    }

    // ========================================================================
    // Health and reset
    // ========================================================================

    /// First reset trigger that applies, if the admin queue is up.
    pub fn check_health(&self) -> Option<ResetReason> {
        let admin = lock(&self.admin).clone()?;
        let aenq = lock(&self.aenq).clone();
        self.health.check(admin.is_running(), || {
            aenq.as_ref().is_some_and(|aenq| aenq.has_pending_keep_alive())
        })
    }

    /// Tear everything down and reset the device.
    ///
    /// The admin queue is stopped first so no new command reaches the ring,
    /// then the device is reset, waiters are aborted, and the admin queue
    /// and AENQ are destroyed. `teardown` drops family resources (I/O
    /// queues). The device ends in `Reset` even if the register reset
    /// failed; that failure is returned.
    pub fn reset_device_with(&self, reason: ResetReason, teardown: impl FnOnce()) -> ComResult<()> {
        {
            let mut state = lock(&self.state);
            log::warn!(
                "Resetting {} device from state {}, reason {}",
                F::NAME,
                *state,
                reason
            );
            *state = DeviceState::Resetting;
        }

        if let Some(admin) = lock(&self.admin).clone() {
            admin.set_running(false);
        }

        let reset = self.reset(reason);
        if let Err(e) = &reset {
            log::error!("{} device reset failed: {}", F::NAME, e);
        }

        self.abort_all_admin_commands();
        if let Err(e) = self.wait_for_abort_completion() {
            log::warn!("Admin commands still outstanding after abort: {}", e);
        }
        self.admin_destroy();
        teardown();

        self.health.clear();
        self.set_supported_features(0);
        self.transition(&[DeviceState::Resetting], DeviceState::Reset, "finish the reset")?;
        reset
    }
}

impl<F: DeviceFamily> std::fmt::Debug for ComDevice<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComDevice")
            .field("family", &F::NAME)
            .field("state", &self.state())
            .field("readless", &self.mmio.is_readless())
            .field("dma_width", &self.dma_width())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aenq::{AenqEvent, EventGroup};
    use crate::dma::HostDmaAllocator;
    use crate::ena::features::DeviceAttributes;
    use crate::ena::{Ena, FeatureId};
    use crate::sim::SimDevice;

    fn config() -> ComConfig {
        ComConfig::default()
            .with_admin_polling(true)
            .with_poll_delays(Duration::from_micros(10), Duration::from_micros(200))
    }

    fn device(sim: &Arc<SimDevice>, config: ComConfig) -> ComDevice<Ena> {
        ComDevice::new(sim.clone(), Arc::new(HostDmaAllocator::new()), config).unwrap()
    }

    fn bring_up(dev: &ComDevice<Ena>) {
        dev.reset(ResetReason::Normal).unwrap();
        dev.validate_version().unwrap();
        dev.get_dma_width().unwrap();
        dev.admin_init(AenqHandlers::with_logging_fallback()).unwrap();
    }

    #[test]
    fn test_reset_writes_reason_and_reads_timeout() {
        let sim = SimDevice::ena();
        sim.set_admin_timeout_caps(7);
        let dev = device(&sim, config());
        dev.reset(ResetReason::KeepAliveTimeout).unwrap();
        assert_eq!(sim.resets(), 1);
        assert_eq!(sim.last_reset_reason(), Some(ResetReason::KeepAliveTimeout.as_u8()));
        assert_eq!(dev.admin_completion_timeout(), Duration::from_millis(700));
        assert_eq!(dev.state(), DeviceState::Reset);
    }

    #[test]
    fn test_reset_zero_admin_timeout_falls_back() {
        let sim = SimDevice::ena();
        sim.set_admin_timeout_caps(0);
        let config = config().with_admin_completion_timeout(Duration::from_millis(1234));
        let dev = device(&sim, config);
        dev.reset(ResetReason::Normal).unwrap();
        assert_eq!(dev.admin_completion_timeout(), Duration::from_millis(1234));
    }

    #[test]
    fn test_reset_requires_ready() {
        let sim = SimDevice::ena();
        sim.set_ready(false);
        let dev = device(&sim, config());
        assert!(matches!(
            dev.reset(ResetReason::Normal),
            Err(ComError::DeviceNotReady)
        ));
        assert_eq!(sim.resets(), 0);
    }

    #[test]
    fn test_reset_stuck_times_out() {
        let sim = SimDevice::ena();
        sim.set_reset_timeout_caps(1);
        sim.set_reset_stuck(true);
        let dev = device(&sim, config());
        assert!(matches!(dev.reset(ResetReason::Normal), Err(ComError::Timeout)));
    }

    #[test]
    fn test_readless_reset_rewrites_response_address() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config().with_readless(true));
        dev.reset(ResetReason::Normal).unwrap();
        // Reads after the reset still work, so the address was reprogrammed.
        dev.validate_version().unwrap();
        assert!(sim.readless_requests() > 0);
        assert_eq!(sim.direct_reads(), 0);
    }

    #[test]
    fn test_readless_backoff_from_config() {
        let sim = SimDevice::ena();
        let config = config()
            .with_readless(true)
            .with_readless_delays(Duration::from_micros(2), Duration::from_micros(50));
        let dev = device(&sim, config.clone());
        assert_eq!(dev.mmio().backoff(), config.readless_backoff());
        assert_eq!(dev.mmio().backoff().delay(0), Duration::from_micros(2));
        dev.reset(ResetReason::Normal).unwrap();
        dev.validate_version().unwrap();
    }

    #[test]
    fn test_version_checks() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        sim.set_version(0x0105);
        assert!(matches!(
            dev.validate_version(),
            Err(ComError::UnsupportedVersion { what: "device", .. })
        ));

        sim.set_version(Ena::MIN_VERSION);
        sim.set_controller_version(0x0700_0000);
        assert!(matches!(
            dev.validate_version(),
            Err(ComError::UnsupportedVersion { what: "controller", .. })
        ));

        // Only the implementation id differs from the minimum.
        sim.set_controller_version(0xff00_0000 | Ena::MIN_CTRL_VERSION);
        dev.validate_version().unwrap();
        assert_eq!(dev.state(), DeviceState::VersionValidated);
        assert!(matches!(
            dev.validate_version(),
            Err(ComError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_dma_width_range() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        sim.set_dma_width(64);
        assert!(matches!(
            dev.get_dma_width(),
            Err(ComError::InvalidParameter(_))
        ));
        sim.set_dma_width(31);
        assert!(dev.get_dma_width().is_err());
        sim.set_dma_width(40);
        assert_eq!(dev.get_dma_width().unwrap(), 40);
        assert_eq!(dev.dma_width(), 40);
    }

    #[test]
    fn test_admin_init_requires_validated_version() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        assert!(matches!(
            dev.admin_init(AenqHandlers::with_logging_fallback()),
            Err(ComError::InvalidState { .. })
        ));
        assert!(matches!(
            dev.execute_admin_command::<_, AcqEntry>(AqEntry::new(8)),
            Err(ComError::NotRunning)
        ));
    }

    #[test]
    fn test_unsupported_feature_skips_ring() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        dev.set_supported_features(0);

        let before = sim.admin_doorbells();
        assert!(matches!(
            dev.get_feature::<crate::ena::features::HwHints>(FeatureId::HwHints as u8, 0),
            Err(ComError::Unsupported)
        ));
        assert_eq!(sim.admin_doorbells(), before);

        // Device attributes are always allowed.
        let attrs: DeviceAttributes = dev
            .get_feature(FeatureId::DeviceAttributes as u8, 0)
            .unwrap();
        assert_eq!(attrs.supported_features, sim.supported_features());
        assert_eq!(sim.admin_doorbells(), before + 1);
    }

    #[test]
    fn test_get_feature_with_control_buffer() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);

        let buffer = DmaBuffer::new(dev.allocator(), 64).unwrap();
        dev.get_feature_raw(FeatureId::DeviceAttributes as u8, 0, Some(&buffer))
            .unwrap();
        let attrs: DeviceAttributes = buffer.read(0);
        assert_eq!(attrs.max_mtu, sim.max_mtu());
    }

    #[test]
    fn test_get_feature_is_idempotent() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        let first = dev
            .get_feature_raw(FeatureId::DeviceAttributes as u8, 0, None)
            .unwrap();
        let second = dev
            .get_feature_raw(FeatureId::DeviceAttributes as u8, 0, None)
            .unwrap();
        assert_eq!(first.raw, second.raw);
        assert_eq!(first.common.status, second.common.status);
    }

    #[test]
    fn test_configure_aenq_groups_masks_unsupported() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        let attrs: DeviceAttributes = dev
            .get_feature(FeatureId::DeviceAttributes as u8, 0)
            .unwrap();
        dev.set_supported_features(attrs.supported_features);

        let requested = sim.supported_aenq_groups() | (1 << 20);
        let enabled = dev.configure_aenq_groups(requested).unwrap();
        assert_eq!(enabled, sim.supported_aenq_groups());
        assert_eq!(sim.enabled_aenq_groups(), enabled);
    }

    #[test]
    fn test_hw_hints_update_timeouts() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        dev.apply_hw_hints(&TimeoutHints {
            mmio_read_timeout_ms: 5,
            admin_completion_timeout_ms: 250,
            driver_watchdog_timeout_ms: 1500,
            missing_tx_threshold: 9,
        });
        assert_eq!(dev.mmio().timeout(), Duration::from_millis(5));
        assert_eq!(dev.admin_completion_timeout(), Duration::from_millis(250));
        assert_eq!(
            dev.health().keep_alive_timeout(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(dev.health().missing_tx_threshold(), 9);

        dev.apply_hw_hints(&TimeoutHints {
            driver_watchdog_timeout_ms: HW_HINTS_NO_TIMEOUT,
            ..TimeoutHints::default()
        });
        assert_eq!(dev.health().keep_alive_timeout(), None);
        assert_eq!(dev.admin_completion_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_polling_mode_masks_interrupt() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        assert_eq!(sim.intr_mask(), ADMIN_INTR_MASK);
        dev.set_admin_polling_mode(false).unwrap();
        assert_eq!(sim.intr_mask(), 0);
        assert!(!dev.admin().unwrap().is_polling());
    }

    #[test]
    fn test_health_sees_aenq_events() {
        let sim = SimDevice::ena();
        let config = config().with_keep_alive_timeout(Some(Duration::from_millis(20)));
        let dev = device(&sim, config);
        bring_up(&dev);
        dev.aenq_enable().unwrap();
        assert_eq!(dev.check_health(), None);

        std::thread::sleep(Duration::from_millis(40));
        sim.post_aenq_event(EventGroup::KeepAlive.as_u16(), 0, [0; 12]);
        // Queued but not yet processed still counts as alive.
        assert_eq!(dev.check_health(), None);
        assert_eq!(dev.aenq_interrupt_handler(), 1);
        assert_eq!(dev.health().keep_alive_events(), 1);
        assert_eq!(dev.check_health(), None);

        sim.post_aenq_event(EventGroup::FatalError.as_u16(), 0, [0; 12]);
        dev.aenq_interrupt_handler();
        assert_eq!(dev.check_health(), Some(ResetReason::Generic));
    }

    #[test]
    fn test_user_handlers_still_called() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        dev.reset(ResetReason::Normal).unwrap();
        dev.validate_version().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&links);
        let handlers = AenqHandlers::with_logging_fallback().on(
            EventGroup::LinkChange,
            move |event: &AenqEvent| {
                lock(&sink).push(event.link_up());
            },
        );
        dev.admin_init(handlers).unwrap();
        dev.aenq_enable().unwrap();

        let mut data = [0u32; 12];
        data[0] = 1;
        sim.post_aenq_event(EventGroup::LinkChange.as_u16(), 0, data);
        dev.aenq_interrupt_handler();
        assert_eq!(*lock(&links), vec![Some(true)]);
    }

    #[test]
    fn test_stopped_admin_queue_reported() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        dev.aenq_enable().unwrap();
        dev.admin().unwrap().set_running(false);
        assert_eq!(dev.check_health(), Some(ResetReason::AdminTimeout));
    }

    #[test]
    fn test_reset_device_recovers() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        dev.mark_features_discovered().unwrap();
        dev.start().unwrap();
        assert_eq!(dev.state(), DeviceState::Running);

        let mut torn_down = false;
        dev.reset_device_with(ResetReason::UserTrigger, || torn_down = true)
            .unwrap();
        assert!(torn_down);
        assert_eq!(dev.state(), DeviceState::Reset);
        assert!(matches!(dev.admin(), Err(ComError::NotRunning)));
        assert_eq!(sim.last_reset_reason(), Some(ResetReason::UserTrigger.as_u8()));

        bring_up(&dev);
        let attrs: DeviceAttributes = dev
            .get_feature(FeatureId::DeviceAttributes as u8, 0)
            .unwrap();
        assert_eq!(attrs.max_mtu, sim.max_mtu());
    }

    #[test]
    fn test_reset_device_aborts_waiters() {
        let sim = SimDevice::ena();
        let dev = Arc::new(device(
            &sim,
            config().with_admin_completion_timeout(Duration::from_secs(5)),
        ));
        bring_up(&dev);
        sim.set_admin_stall(true);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let dev = Arc::clone(&dev);
                std::thread::spawn(move || {
                    dev.get_feature::<DeviceAttributes>(FeatureId::DeviceAttributes as u8, 0)
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));

        dev.reset_device_with(ResetReason::AdminTimeout, || {}).unwrap();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(ComError::Aborted)));
        }
        assert_eq!(dev.state(), DeviceState::Reset);
    }

    #[test]
    fn test_reset_device_reports_failed_reset() {
        let sim = SimDevice::ena();
        let dev = device(&sim, config());
        bring_up(&dev);
        sim.set_reset_timeout_caps(1);
        sim.set_reset_stuck(true);
        assert!(dev.reset_device_with(ResetReason::Generic, || {}).is_err());
        // Torn down regardless.
        assert_eq!(dev.state(), DeviceState::Reset);
        assert!(dev.admin().is_err());
    }
}
