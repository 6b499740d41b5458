// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Elastic Network Adapter family.
//!
//! [`EnaDevice`] wraps the generic [`ComDevice`] with ENA feature discovery,
//! MTU configuration and I/O queue management.

pub mod features;
mod io;

pub use io::{
    CreateCqCmd, CreateCqResp, CreateSqCmd, CreateSqResp, DestroyCqCmd, DestroySqCmd,
    IoQueueParams,
};

use crate::aenq::{AenqHandlers, EventGroup};
use crate::config::ComConfig;
use crate::device::{optional, ComDevice, DeviceState};
use crate::dma::DmaAllocator;
use crate::error::ComResult;
use crate::family::DeviceFamily;
use crate::io_queue::IoQueuePair;
use crate::lock;
use crate::regs::{DeviceMemory, RegisterSpace, ResetReason};
use bytemuck::Pod;
use features::{
    AenqConfig, DeviceAttributes, HwHints, LlqFeature, MaxQueues, Mtu, StatelessOffload,
};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// ENA ABI constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ena;

impl DeviceFamily for Ena {
    const NAME: &'static str = "ENA";
    const MIN_VERSION: u32 = 0x0200;
    const MIN_CTRL_VERSION: u32 = 0x0000_0001;
    const TAGGED_COMMAND_IDS: bool = false;
    const MAX_DMA_WIDTH: u8 = 48;
    const GET_FEATURE_OPCODE: u8 = AdminOpcode::GetFeature as u8;
    const SET_FEATURE_OPCODE: u8 = AdminOpcode::SetFeature as u8;
    const DEVICE_ATTRIBUTES_FEATURE: u8 = FeatureId::DeviceAttributes as u8;
    const AENQ_CONFIG_FEATURE: u8 = FeatureId::AenqConfig as u8;

    fn opcode_name(opcode: u8) -> &'static str {
        AdminOpcode::from_u8(opcode).map_or("UNKNOWN", AdminOpcode::name)
    }
}

/// ENA admin opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdminOpcode {
    CreateSq = 1,
    DestroySq = 2,
    CreateCq = 3,
    DestroyCq = 4,
    GetFeature = 8,
    SetFeature = 9,
    GetStats = 11,
}

impl AdminOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::CreateSq),
            2 => Some(Self::DestroySq),
            3 => Some(Self::CreateCq),
            4 => Some(Self::DestroyCq),
            8 => Some(Self::GetFeature),
            9 => Some(Self::SetFeature),
            11 => Some(Self::GetStats),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateSq => "CREATE_SQ",
            Self::DestroySq => "DESTROY_SQ",
            Self::CreateCq => "CREATE_CQ",
            Self::DestroyCq => "DESTROY_CQ",
            Self::GetFeature => "GET_FEATURE",
            Self::SetFeature => "SET_FEATURE",
            Self::GetStats => "GET_STATS",
        }
    }
}

impl std::fmt::Display for AdminOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// ENA feature ids. Each id is also its bit in the supported-features map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    DeviceAttributes = 1,
    MaxQueuesNum = 2,
    HwHints = 3,
    Llq = 4,
    StatelessOffload = 11,
    Mtu = 14,
    AenqConfig = 26,
}

/// Everything feature discovery learned about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnaFeatures {
    pub device_attributes: DeviceAttributes,
    pub max_queues: MaxQueues,
    pub aenq: AenqConfig,
    pub offload: StatelessOffload,
    pub hw_hints: Option<HwHints>,
    pub llq: Option<LlqFeature>,
}

/// An ENA device.
pub struct EnaDevice {
    com: ComDevice<Ena>,
    memory: Option<Arc<dyn DeviceMemory>>,
    features: Mutex<Option<EnaFeatures>>,
    io_queues: Mutex<Vec<Option<Arc<Mutex<IoQueuePair>>>>>,
}

impl EnaDevice {
    /// `memory` is the LLQ memory BAR, if the platform maps one.
    pub fn new(
        regs: Arc<dyn RegisterSpace>,
        memory: Option<Arc<dyn DeviceMemory>>,
        allocator: Arc<dyn DmaAllocator>,
        config: ComConfig,
    ) -> ComResult<Self> {
        let slots = config.max_io_queues as usize;
        Ok(Self {
            com: ComDevice::new(regs, allocator, config)?,
            memory,
            features: Mutex::new(None),
            io_queues: Mutex::new(vec![None; slots]),
        })
    }

    /// Generic device core.
    pub fn com(&self) -> &ComDevice<Ena> {
        &self.com
    }

    pub(crate) fn device_memory(&self) -> Option<&Arc<dyn DeviceMemory>> {
        self.memory.as_ref()
    }

    pub(crate) fn io_queue_slots(&self) -> &Mutex<Vec<Option<Arc<Mutex<IoQueuePair>>>>> {
        &self.io_queues
    }

    /// Full bring-up: reset, version check, admin queue, feature discovery
    /// and AENQ.
    ///
    /// Keep-alive and fatal-error events are always enabled on top of the
    /// groups `handlers` registers. On failure after the admin queue exists,
    /// it is destroyed again.
    pub fn init(&self, handlers: AenqHandlers) -> ComResult<EnaFeatures> {
        self.com.reset(ResetReason::Normal)?;
        self.com.validate_version()?;
        self.com.get_dma_width()?;

        let groups = handlers.registered_groups()
            | EventGroup::KeepAlive.mask()
            | EventGroup::FatalError.mask();
        self.com.admin_init(handlers)?;

        let guard = scopeguard::guard(&self.com, |com| {
            log::warn!("ENA bring-up failed, destroying admin queue");
            com.admin_destroy();
        });

        let features = self.discover_features()?;
        let enabled = self.com.configure_aenq_groups(groups)?;
        log::debug!("ENA AENQ groups enabled: {:#x}", enabled);
        self.com.aenq_enable()?;

        scopeguard::ScopeGuard::into_inner(guard);
        Ok(features)
    }

    /// Query every feature the core needs.
    ///
    /// Device attributes, max queues, AENQ config and stateless offload are
    /// mandatory. HW hints and LLQ are skipped if the device lacks them;
    /// hints that are present are applied right away.
    pub fn discover_features(&self) -> ComResult<EnaFeatures> {
        self.com
            .require(DeviceState::AdminQueueUp, "discover features")?;

        let device_attributes: DeviceAttributes = self.get_feature(FeatureId::DeviceAttributes)?;
        self.com
            .set_supported_features(device_attributes.supported_features);
        log::info!(
            "ENA device attributes: mac {:02x?} max mtu {} supported features {:#x}",
            device_attributes.mac_addr,
            device_attributes.max_mtu,
            device_attributes.supported_features
        );

        let max_queues: MaxQueues = self.get_feature(FeatureId::MaxQueuesNum)?;
        let aenq: AenqConfig = self.get_feature(FeatureId::AenqConfig)?;
        let offload: StatelessOffload = self.get_feature(FeatureId::StatelessOffload)?;

        let hw_hints = optional(self.get_feature::<HwHints>(FeatureId::HwHints))?;
        if let Some(hints) = &hw_hints {
            self.com.apply_hw_hints(&hints.timeouts());
        }
        let llq = optional(self.get_feature::<LlqFeature>(FeatureId::Llq))?;

        let features = EnaFeatures {
            device_attributes,
            max_queues,
            aenq,
            offload,
            hw_hints,
            llq,
        };
        *lock(&self.features) = Some(features);
        self.com.mark_features_discovered()?;
        Ok(features)
    }

    /// Get one feature body.
    pub fn get_feature<T: Pod>(&self, feature: FeatureId) -> ComResult<T> {
        self.com.get_feature(feature as u8, 0)
    }

    pub fn set_mtu(&self, mtu: u32) -> ComResult<()> {
        self.com.set_feature(FeatureId::Mtu as u8, &Mtu { mtu })?;
        log::debug!("ENA MTU set to {}", mtu);
        Ok(())
    }

    /// Result of the last feature discovery.
    pub fn features(&self) -> Option<EnaFeatures> {
        *lock(&self.features)
    }

    /// Tear down and reset; I/O queues and discovered features are dropped.
    pub fn reset_device(&self, reason: ResetReason) -> ComResult<()> {
        self.com.reset_device_with(reason, || {
            let dropped: Vec<_> = lock(&self.io_queues)
                .iter_mut()
                .filter_map(Option::take)
                .collect();
            for pair in &dropped {
                let mut pair = lock(pair);
                if let Err(e) = pair.release() {
                    log::warn!("Failed to release IO queue {}: {}", pair.qid(), e);
                }
            }
            if !dropped.is_empty() {
                log::debug!("Dropped {} ENA I/O queues during reset", dropped.len());
            }
            *lock(&self.features) = None;
        })
    }
}

impl Deref for EnaDevice {
    type Target = ComDevice<Ena>;

    fn deref(&self) -> &Self::Target {
        &self.com
    }
}

impl std::fmt::Debug for EnaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnaDevice")
            .field("com", &self.com)
            .field("llq_memory", &self.memory.is_some())
            .field("io_queues", &self.io_queue_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aenq::AenqEvent;
    use crate::dma::HostDmaAllocator;
    use crate::error::ComError;
    use crate::sim::SimDevice;
    use std::time::Duration;

    fn config() -> ComConfig {
        ComConfig::default()
            .with_admin_polling(true)
            .with_poll_delays(Duration::from_micros(10), Duration::from_micros(200))
    }

    fn device(sim: &Arc<SimDevice>) -> EnaDevice {
        EnaDevice::new(
            sim.clone(),
            Some(sim.clone()),
            Arc::new(HostDmaAllocator::new()),
            config(),
        )
        .unwrap()
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Ena::opcode_name(8), "GET_FEATURE");
        assert_eq!(Ena::opcode_name(200), "UNKNOWN");
        assert_eq!(AdminOpcode::from_u8(3), Some(AdminOpcode::CreateCq));
        assert_eq!(AdminOpcode::DestroySq.to_string(), "DESTROY_SQ");
    }

    #[test]
    fn test_init_discovers_features() {
        let sim = SimDevice::ena();
        let dev = device(&sim);
        let features = dev.init(AenqHandlers::with_logging_fallback()).unwrap();

        assert_eq!(dev.state(), DeviceState::FeaturesDiscovered);
        assert_eq!(features.device_attributes.max_mtu, sim.max_mtu());
        assert_eq!(dev.supported_features(), sim.supported_features());
        assert_eq!(features.aenq.supported_groups, sim.supported_aenq_groups());
        assert!(features.max_queues.max_sq_num > 0);
        assert!(features.hw_hints.is_some());
        assert!(features.llq.is_some());
        assert_eq!(dev.features(), Some(features));

        let expected = EventGroup::KeepAlive.mask() | EventGroup::FatalError.mask();
        assert_eq!(sim.enabled_aenq_groups() & expected, expected);

        // Hints from the device were applied.
        let hints = features.hw_hints.unwrap();
        assert_eq!(
            dev.admin_completion_timeout(),
            Duration::from_millis(hints.admin_completion_tx_timeout as u64)
        );
    }

    #[test]
    fn test_optional_features_missing() {
        let sim = SimDevice::ena();
        sim.set_supported_features(
            sim.supported_features()
                & !(1 << FeatureId::HwHints as u32)
                & !(1 << FeatureId::Llq as u32),
        );
        let dev = device(&sim);
        let features = dev.init(AenqHandlers::with_logging_fallback()).unwrap();
        assert_eq!(features.hw_hints, None);
        assert_eq!(features.llq, None);
    }

    #[test]
    fn test_mandatory_feature_missing_destroys_admin_queue() {
        let sim = SimDevice::ena();
        sim.set_supported_features(sim.supported_features() & !(1 << FeatureId::MaxQueuesNum as u32));
        let dev = device(&sim);
        assert!(matches!(
            dev.init(AenqHandlers::with_logging_fallback()),
            Err(ComError::Unsupported)
        ));
        assert!(matches!(dev.admin(), Err(ComError::NotRunning)));
        assert_eq!(dev.state(), DeviceState::VersionValidated);
        assert_eq!(dev.features(), None);
    }

    #[test]
    fn test_set_mtu() {
        let sim = SimDevice::ena();
        let dev = device(&sim);
        dev.init(AenqHandlers::with_logging_fallback()).unwrap();
        dev.set_mtu(1500).unwrap();
        assert_eq!(sim.mtu(), 1500);
        assert!(matches!(
            dev.set_mtu(sim.max_mtu() + 1),
            Err(ComError::InvalidParameter(_))
        ));
        assert_eq!(sim.mtu(), 1500);
    }

    #[test]
    fn test_link_change_handler() {
        let sim = SimDevice::ena();
        let dev = device(&sim);
        let links = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&links);
        let handlers = AenqHandlers::with_logging_fallback().on(
            EventGroup::LinkChange,
            move |event: &AenqEvent| {
                lock(&sink).push(event.link_up());
            },
        );
        dev.init(handlers).unwrap();
        assert_ne!(sim.enabled_aenq_groups() & EventGroup::LinkChange.mask(), 0);

        sim.post_aenq_event(EventGroup::LinkChange.as_u16(), 0, [0; 12]);
        assert_eq!(dev.aenq_interrupt_handler(), 1);
        assert_eq!(*lock(&links), vec![Some(false)]);
    }

    #[test]
    fn test_reset_and_reinit() {
        let sim = SimDevice::ena();
        let dev = device(&sim);
        dev.init(AenqHandlers::with_logging_fallback()).unwrap();
        dev.start().unwrap();

        dev.reset_device(ResetReason::KeepAliveTimeout).unwrap();
        assert_eq!(dev.state(), DeviceState::Reset);
        assert_eq!(dev.features(), None);
        assert_eq!(dev.supported_features(), 0);

        let features = dev.init(AenqHandlers::with_logging_fallback()).unwrap();
        assert_eq!(features.device_attributes.max_mtu, sim.max_mtu());
        assert_eq!(sim.resets(), 3);
    }
}
