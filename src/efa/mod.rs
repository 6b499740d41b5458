// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Elastic Fabric Adapter family.
//!
//! EFA shares the ring protocol with ENA but tags command ids with a
//! generation counter and has its own opcode and feature numbering.

use crate::aenq::{AenqConfig, AenqHandlers, EventGroup};
use crate::config::ComConfig;
use crate::descriptor::{AcqCommonDesc, AcqEntry, AqCommonDesc, MemAddr};
use crate::device::{optional, ComDevice, DeviceState, TimeoutHints};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{ComError, ComResult};
use crate::family::DeviceFamily;
use crate::lock;
use crate::regs::{RegisterSpace, ResetReason};
use bytemuck::{Pod, Zeroable};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// EFA ABI constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Efa;

impl DeviceFamily for Efa {
    const NAME: &'static str = "EFA";
    const MIN_VERSION: u32 = 0x0001;
    const MIN_CTRL_VERSION: u32 = 0x0000_0001;
    const TAGGED_COMMAND_IDS: bool = true;
    const MAX_DMA_WIDTH: u8 = 64;
    const GET_FEATURE_OPCODE: u8 = AdminOpcode::GetFeature as u8;
    const SET_FEATURE_OPCODE: u8 = AdminOpcode::SetFeature as u8;
    const DEVICE_ATTRIBUTES_FEATURE: u8 = FeatureId::DeviceAttr as u8;
    const AENQ_CONFIG_FEATURE: u8 = FeatureId::AenqConfig as u8;

    fn opcode_name(opcode: u8) -> &'static str {
        AdminOpcode::from_u8(opcode).map_or("UNKNOWN", AdminOpcode::name)
    }
}

/// EFA admin opcodes used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdminOpcode {
    CreateCq = 9,
    DestroyCq = 10,
    GetFeature = 11,
    SetFeature = 12,
    AllocPd = 14,
    DeallocPd = 15,
}

impl AdminOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            9 => Some(Self::CreateCq),
            10 => Some(Self::DestroyCq),
            11 => Some(Self::GetFeature),
            12 => Some(Self::SetFeature),
            14 => Some(Self::AllocPd),
            15 => Some(Self::DeallocPd),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateCq => "CREATE_CQ",
            Self::DestroyCq => "DESTROY_CQ",
            Self::GetFeature => "GET_FEATURE",
            Self::SetFeature => "SET_FEATURE",
            Self::AllocPd => "ALLOC_PD",
            Self::DeallocPd => "DEALLOC_PD",
        }
    }
}

impl std::fmt::Display for AdminOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    DeviceAttr = 1,
    AenqConfig = 2,
    HwHints = 5,
}

/// `DeviceAttr` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceAttr {
    pub page_size_cap: u64,
    pub fw_version: u32,
    pub admin_api_version: u32,
    pub device_version: u32,
    pub supported_features: u32,
    pub db_bar: u16,
    pub phys_addr_width: u8,
    pub virt_addr_width: u8,
    pub device_caps: u32,
    pub max_rdma_size: u32,
    pub max_pd: u32,
}

/// `HwHints` feature. Milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HwHints {
    pub mmio_read_timeout: u16,
    pub driver_watchdog_timeout: u16,
    pub admin_completion_timeout: u16,
    pub poll_interval: u16,
}

impl HwHints {
    pub fn timeouts(&self) -> TimeoutHints {
        TimeoutHints {
            mmio_read_timeout_ms: self.mmio_read_timeout,
            admin_completion_timeout_ms: self.admin_completion_timeout,
            driver_watchdog_timeout_ms: self.driver_watchdog_timeout,
            missing_tx_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AllocPdCmd {
    pub common: AqCommonDesc,
    pub raw: [u32; 15],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AllocPdResp {
    pub common: AcqCommonDesc,
    pub pdn: u16,
    pub reserved: u16,
    pub raw: [u32; 13],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DeallocPdCmd {
    pub common: AqCommonDesc,
    pub pdn: u16,
    pub reserved: u16,
    pub raw: [u32; 14],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CreateCqCmd {
    pub common: AqCommonDesc,
    /// Bit 5: interrupt mode.
    pub cq_caps_1: u8,
    /// Bits 4:0: entry size in 32-bit words.
    pub cq_caps_2: u8,
    pub cq_depth: u16,
    pub msix_vector_idx: u32,
    pub cq_ba: MemAddr,
    pub num_sub_cqs: u16,
    pub reserved: u16,
    pub raw: [u32; 10],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CreateCqResp {
    pub common: AcqCommonDesc,
    pub cq_idx: u16,
    pub cq_actual_depth: u16,
    pub db_offset: u32,
    pub raw: [u32; 12],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DestroyCqCmd {
    pub common: AqCommonDesc,
    pub cq_idx: u16,
    pub reserved: u16,
    pub raw: [u32; 14],
}

const _: () = assert!(std::mem::size_of::<DeviceAttr>() == 40);
const _: () = assert!(std::mem::size_of::<AllocPdCmd>() == 64);
const _: () = assert!(std::mem::size_of::<AllocPdResp>() == 64);
const _: () = assert!(std::mem::size_of::<DeallocPdCmd>() == 64);
const _: () = assert!(std::mem::size_of::<CreateCqCmd>() == 64);
const _: () = assert!(std::mem::size_of::<CreateCqResp>() == 64);
const _: () = assert!(std::mem::size_of::<DestroyCqCmd>() == 64);

const CQ_CAPS_1_INTERRUPT_MODE: u8 = 1 << 5;
const CQ_CAPS_2_ENTRY_WORDS_MASK: u8 = 0x1f;

/// Feature discovery result. Only the device attributes are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EfaFeatures {
    pub device_attr: DeviceAttr,
    pub aenq: Option<AenqConfig>,
    pub hw_hints: Option<HwHints>,
}

/// A completion queue created on the device.
///
/// Destroy it with [`EfaDevice::destroy_cq`] before dropping it.
#[derive(Debug)]
pub struct EfaCq {
    pub cq_idx: u16,
    pub depth: u16,
    pub entry_size: usize,
    pub db_offset: u32,
    ring: DmaBuffer,
}

impl EfaCq {
    pub fn ring(&self) -> &DmaBuffer {
        &self.ring
    }
}

/// An EFA device.
pub struct EfaDevice {
    com: ComDevice<Efa>,
    features: Mutex<Option<EfaFeatures>>,
}

impl EfaDevice {
    pub fn new(
        regs: Arc<dyn RegisterSpace>,
        allocator: Arc<dyn DmaAllocator>,
        config: ComConfig,
    ) -> ComResult<Self> {
        Ok(Self {
            com: ComDevice::new(regs, allocator, config)?,
            features: Mutex::new(None),
        })
    }

    pub fn com(&self) -> &ComDevice<Efa> {
        &self.com
    }

    /// Reset, version check, admin queue, feature discovery and AENQ.
    pub fn init(&self, handlers: AenqHandlers) -> ComResult<EfaFeatures> {
        self.com.reset(ResetReason::Normal)?;
        self.com.validate_version()?;
        self.com.get_dma_width()?;

        let groups = handlers.registered_groups()
            | EventGroup::KeepAlive.mask()
            | EventGroup::FatalError.mask();
        self.com.admin_init(handlers)?;

        let guard = scopeguard::guard(&self.com, |com| {
            log::warn!("EFA bring-up failed, destroying admin queue");
            com.admin_destroy();
        });

        let features = self.discover_features()?;
        if features.aenq.is_some() {
            self.com.configure_aenq_groups(groups)?;
        }
        self.com.aenq_enable()?;

        scopeguard::ScopeGuard::into_inner(guard);
        Ok(features)
    }

    pub fn discover_features(&self) -> ComResult<EfaFeatures> {
        self.com
            .require(DeviceState::AdminQueueUp, "discover features")?;

        let device_attr: DeviceAttr = self.com.get_feature(FeatureId::DeviceAttr as u8, 0)?;
        self.com.set_supported_features(device_attr.supported_features);
        log::info!(
            "EFA device attributes: fw version {:#x} max pd {} supported features {:#x}",
            device_attr.fw_version,
            device_attr.max_pd,
            device_attr.supported_features
        );

        let aenq = optional(self.com.get_feature::<AenqConfig>(FeatureId::AenqConfig as u8, 0))?;
        let hw_hints = optional(self.com.get_feature::<HwHints>(FeatureId::HwHints as u8, 0))?;
        if let Some(hints) = &hw_hints {
            self.com.apply_hw_hints(&hints.timeouts());
        }

        let features = EfaFeatures {
            device_attr,
            aenq,
            hw_hints,
        };
        *lock(&self.features) = Some(features);
        self.com.mark_features_discovered()?;
        Ok(features)
    }

    pub fn features(&self) -> Option<EfaFeatures> {
        *lock(&self.features)
    }

    /// Allocate a protection domain. Returns its number.
    pub fn alloc_pd(&self) -> ComResult<u16> {
        self.com
            .require(DeviceState::FeaturesDiscovered, "allocate a PD")?;
        let mut cmd = AllocPdCmd::zeroed();
        cmd.common.opcode = AdminOpcode::AllocPd as u8;
        let resp: AllocPdResp = self
            .com
            .execute_admin_command(cmd)
            .inspect_err(|e| log::error!("Failed to allocate pd: {}", e))?;
        Ok(resp.pdn)
    }

    pub fn dealloc_pd(&self, pdn: u16) -> ComResult<()> {
        let mut cmd = DeallocPdCmd::zeroed();
        cmd.common.opcode = AdminOpcode::DeallocPd as u8;
        cmd.pdn = pdn;
        let _: AcqEntry = self
            .com
            .execute_admin_command(cmd)
            .inspect_err(|e| log::error!("Failed to deallocate pdn {}: {}", pdn, e))?;
        Ok(())
    }

    /// Create a completion queue of `depth` entries of `entry_size` bytes.
    pub fn create_cq(&self, depth: u16, entry_size: usize, msix_vector: u32) -> ComResult<EfaCq> {
        self.com
            .require(DeviceState::FeaturesDiscovered, "create a CQ")?;
        if depth == 0 || entry_size == 0 || entry_size % 4 != 0 {
            return Err(ComError::InvalidParameter(format!(
                "invalid CQ geometry: depth {} entry size {}",
                depth, entry_size
            )));
        }

        let ring = DmaBuffer::new_with_retry(self.com.allocator(), depth as usize * entry_size)?;
        let mut cmd = CreateCqCmd::zeroed();
        cmd.common.opcode = AdminOpcode::CreateCq as u8;
        cmd.cq_caps_1 = CQ_CAPS_1_INTERRUPT_MODE;
        cmd.cq_caps_2 = (entry_size / 4) as u8 & CQ_CAPS_2_ENTRY_WORDS_MASK;
        cmd.cq_depth = depth;
        cmd.msix_vector_idx = msix_vector;
        cmd.cq_ba = MemAddr::new(ring.dma_addr(), self.com.dma_width())?;
        cmd.num_sub_cqs = 1;

        let resp: CreateCqResp = self
            .com
            .execute_admin_command(cmd)
            .inspect_err(|e| log::error!("Failed to create cq: {}", e))?;
        log::debug!(
            "Created cq[{}], depth[{}]",
            resp.cq_idx,
            resp.cq_actual_depth
        );

        Ok(EfaCq {
            cq_idx: resp.cq_idx,
            depth: resp.cq_actual_depth,
            entry_size,
            db_offset: resp.db_offset,
            ring,
        })
    }

    pub fn destroy_cq(&self, cq: &EfaCq) -> ComResult<()> {
        let mut cmd = DestroyCqCmd::zeroed();
        cmd.common.opcode = AdminOpcode::DestroyCq as u8;
        cmd.cq_idx = cq.cq_idx;
        let _: AcqEntry = self
            .com
            .execute_admin_command(cmd)
            .inspect_err(|e| log::error!("Failed to destroy CQ-{}: {}", cq.cq_idx, e))?;
        log::debug!("Destroyed cq[{}]", cq.cq_idx);
        Ok(())
    }

    pub fn reset_device(&self, reason: ResetReason) -> ComResult<()> {
        self.com.reset_device_with(reason, || {
            *lock(&self.features) = None;
        })
    }
}

impl Deref for EfaDevice {
    type Target = ComDevice<Efa>;

    fn deref(&self) -> &Self::Target {
        &self.com
    }
}

impl std::fmt::Debug for EfaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EfaDevice").field("com", &self.com).finish()
    }
}
