// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Privileged calls used to hand memory over to guests of a Gunyah hypervisor.
//!
//! Only four calls are needed by the guest memory manager:
//! - `memextent_donate` moves ownership of a physical range between two memory extents.
//! - `addrspace_map` maps a range of a memory extent into a guest address space.
//! - `addrspace_unmap` removes such a mapping.
//! - `identify` reports the hypervisor API version and feature flags.
//!
//! The calls are modeled by the [Hypercall] trait so the memory manager can run against a real
//! SMCCC conduit ([SmcccHypercalls]) or a software model of the hypervisor.

#![deny(missing_docs)]

use bitflags::bitflags;

mod smccc;
pub use smccc::{
    SmcccArgs, SmcccHypercalls, SmcccRes, SmcccTransport, HYPERCALL_ADDRSPACE_MAP,
    HYPERCALL_ADDRSPACE_UNMAP, HYPERCALL_HYP_IDENTIFY, HYPERCALL_MEMEXTENT_DONATE,
    VENDOR_HYP_CALL_UID_FUNC_ID,
};

/// Capability identifier of a hypervisor object.
pub type CapId = u64;

/// Invalid capability identifier.
pub const CAPID_INVAL: CapId = std::u64::MAX;

/// Memory type used for normal guest memory mappings (normal, write-back cacheable).
pub const DEFAULT_MEMTYPE: u8 = 0xe;

/// API version implemented by this crate.
pub const API_V1: u16 = 1;

/// Error codes returned by the hypervisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HypError {
    /// The call is not implemented.
    #[error("hypercall not implemented")]
    Unimplemented,
    /// Transient failure, the call may be retried.
    #[error("hypercall should be retried")]
    Retry,
    /// Invalid argument.
    #[error("invalid argument")]
    ArgInval,
    /// Invalid size argument.
    #[error("invalid size argument")]
    ArgSize,
    /// Misaligned argument.
    #[error("misaligned argument")]
    ArgAlign,
    /// The hypervisor ran out of memory.
    #[error("hypervisor out of memory")]
    NoMem,
    /// Address overflow.
    #[error("address overflow")]
    AddrOverflow,
    /// Address underflow.
    #[error("address underflow")]
    AddrUnderflow,
    /// Invalid address.
    #[error("invalid address")]
    AddrInval,
    /// Operation denied.
    #[error("operation denied")]
    Denied,
    /// Object busy.
    #[error("object busy")]
    Busy,
    /// Object idle.
    #[error("object idle")]
    Idle,
    /// Interrupt already bound.
    #[error("interrupt already bound")]
    IrqBound,
    /// Interrupt not bound.
    #[error("interrupt not bound")]
    IrqUnbound,
    /// Null capability.
    #[error("null capability")]
    CapNull,
    /// Revoked capability.
    #[error("capability revoked")]
    CapRevoked,
    /// Capability refers to an object of a different type.
    #[error("capability has wrong object type")]
    CapWrongObjType,
    /// Capability lacks the required rights.
    #[error("insufficient capability rights")]
    CapInsufRights,
    /// Capability space is full.
    #[error("capability space full")]
    CapSpaceFull,
    /// Message queue empty.
    #[error("message queue empty")]
    MsgQueueEmpty,
    /// Message queue full.
    #[error("message queue full")]
    MsgQueueFull,
    /// Status code not known by this crate.
    #[error("unknown hypercall status {0}")]
    Unknown(i64),
}

/// Coarse classification of a hypervisor error, used to remap it into a caller's error type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad argument, never worth retrying.
    InvalidArgument,
    /// Out of memory.
    ResourceExhausted,
    /// Access to the object was refused.
    PermissionDenied,
    /// Object temporarily busy.
    Busy,
    /// The caller may retry the same call.
    Retry,
    /// Operation not supported.
    Unsupported,
    /// Anything the remap layer cannot classify.
    ProtocolFailure,
}

impl HypError {
    /// Decode the status word returned in the first response register.
    pub fn from_raw(status: u64) -> Result<()> {
        let err = match status as i64 {
            0 => return Ok(()),
            -1 => HypError::Unimplemented,
            -2 => HypError::Retry,
            1 => HypError::ArgInval,
            2 => HypError::ArgSize,
            3 => HypError::ArgAlign,
            10 => HypError::NoMem,
            20 => HypError::AddrOverflow,
            21 => HypError::AddrUnderflow,
            22 => HypError::AddrInval,
            30 => HypError::Denied,
            31 => HypError::Busy,
            32 => HypError::Idle,
            40 => HypError::IrqBound,
            41 => HypError::IrqUnbound,
            50 => HypError::CapNull,
            51 => HypError::CapRevoked,
            52 => HypError::CapWrongObjType,
            53 => HypError::CapInsufRights,
            54 => HypError::CapSpaceFull,
            60 => HypError::MsgQueueEmpty,
            61 => HypError::MsgQueueFull,
            other => HypError::Unknown(other),
        };
        Err(err)
    }

    /// Get the raw status code.
    pub fn raw(&self) -> i64 {
        match self {
            HypError::Unimplemented => -1,
            HypError::Retry => -2,
            HypError::ArgInval => 1,
            HypError::ArgSize => 2,
            HypError::ArgAlign => 3,
            HypError::NoMem => 10,
            HypError::AddrOverflow => 20,
            HypError::AddrUnderflow => 21,
            HypError::AddrInval => 22,
            HypError::Denied => 30,
            HypError::Busy => 31,
            HypError::Idle => 32,
            HypError::IrqBound => 40,
            HypError::IrqUnbound => 41,
            HypError::CapNull => 50,
            HypError::CapRevoked => 51,
            HypError::CapWrongObjType => 52,
            HypError::CapInsufRights => 53,
            HypError::CapSpaceFull => 54,
            HypError::MsgQueueEmpty => 60,
            HypError::MsgQueueFull => 61,
            HypError::Unknown(raw) => *raw,
        }
    }

    /// Classify the error.
    pub fn remap(&self) -> ErrorClass {
        match self {
            HypError::NoMem => ErrorClass::ResourceExhausted,
            HypError::Denied
            | HypError::CapNull
            | HypError::CapRevoked
            | HypError::CapWrongObjType
            | HypError::CapInsufRights => ErrorClass::PermissionDenied,
            HypError::CapSpaceFull | HypError::Busy | HypError::Idle => ErrorClass::Busy,
            HypError::Unimplemented => ErrorClass::Unsupported,
            HypError::Retry => ErrorClass::Retry,
            HypError::ArgInval
            | HypError::ArgSize
            | HypError::ArgAlign
            | HypError::AddrOverflow
            | HypError::AddrUnderflow
            | HypError::AddrInval => ErrorClass::InvalidArgument,
            HypError::IrqBound
            | HypError::IrqUnbound
            | HypError::MsgQueueEmpty
            | HypError::MsgQueueFull
            | HypError::Unknown(_) => ErrorClass::ProtocolFailure,
        }
    }
}

/// Specialized std::result::Result for hypercalls.
pub type Result<T> = std::result::Result<T, HypError>;

/// Kind of ownership transfer performed by `memextent_donate`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DonateType {
    /// Donate from a parent extent to a child extent.
    ToChild = 0,
    /// Donate from a child extent back to its parent.
    ToParent = 1,
    /// Donate between two extents derived from the same parent.
    ToSibling = 2,
    /// Donate into a protected extent, removing access from the donor.
    ToProtected = 3,
    /// Donate out of a protected extent.
    FromProtected = 4,
}

/// Options word of `memextent_donate`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DonateOptions(u32);

impl DonateOptions {
    const TYPE_MASK: u32 = 0xff;
    const NOSYNC: u32 = 1 << 31;

    /// Build options for a donation of type `ty`.
    pub const fn new(ty: DonateType) -> Self {
        DonateOptions(ty as u32 & Self::TYPE_MASK)
    }

    /// Skip the hypervisor-side synchronization at the end of the donation.
    pub const fn nosync(self) -> Self {
        DonateOptions(self.0 | Self::NOSYNC)
    }

    /// Get the donation type encoded in the options.
    pub fn donate_type(&self) -> Option<DonateType> {
        match self.0 & Self::TYPE_MASK {
            0 => Some(DonateType::ToChild),
            1 => Some(DonateType::ToParent),
            2 => Some(DonateType::ToSibling),
            3 => Some(DonateType::ToProtected),
            4 => Some(DonateType::FromProtected),
            _ => None,
        }
    }

    /// Get the raw options word.
    pub const fn bits(&self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Flags of `addrspace_map` and `addrspace_unmap`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// The range is a part of the extent rather than the whole extent.
        const PARTIAL = 1 << 0;
        /// The mapping is private to the guest.
        const PRIVATE = 1 << 1;
        /// Accesses to the mapping may trap to the host for emulation.
        const VMMIO = 1 << 2;
        /// Skip the hypervisor-side synchronization at the end of the call.
        const NOSYNC = 1 << 31;
    }
}

/// Stage-2 page table access rights.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PagetableAccess {
    /// No access.
    None = 0,
    /// Execute only.
    X = 1,
    /// Write only.
    W = 2,
    /// Read only.
    R = 4,
    /// Read and execute.
    RX = 5,
    /// Read and write.
    RW = 6,
    /// Read, write and execute.
    RWX = 7,
}

/// Attribute word of `addrspace_map`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemExtentAttrs(u32);

impl MemExtentAttrs {
    const USER_ACCESS_SHIFT: u32 = 0;
    const KERNEL_ACCESS_SHIFT: u32 = 4;
    const ACCESS_MASK: u32 = 0x7;
    const MEMTYPE_SHIFT: u32 = 16;
    const MEMTYPE_MASK: u32 = 0xff;

    /// Build mapping attributes.
    pub fn new(memtype: u8, user: PagetableAccess, kernel: PagetableAccess) -> Self {
        MemExtentAttrs(
            (user as u32 & Self::ACCESS_MASK) << Self::USER_ACCESS_SHIFT
                | (kernel as u32 & Self::ACCESS_MASK) << Self::KERNEL_ACCESS_SHIFT
                | (memtype as u32 & Self::MEMTYPE_MASK) << Self::MEMTYPE_SHIFT,
        )
    }

    /// Get the raw access bits granted to guest user mode.
    pub fn user_access(&self) -> u8 {
        ((self.0 >> Self::USER_ACCESS_SHIFT) & Self::ACCESS_MASK) as u8
    }

    /// Get the raw access bits granted to guest kernel mode.
    pub fn kernel_access(&self) -> u8 {
        ((self.0 >> Self::KERNEL_ACCESS_SHIFT) & Self::ACCESS_MASK) as u8
    }

    /// Get the memory type.
    pub fn memtype(&self) -> u8 {
        ((self.0 >> Self::MEMTYPE_SHIFT) & Self::MEMTYPE_MASK) as u8
    }

    /// Get the raw attribute word.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Optional hypervisor features reported by `identify`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Feature {
    /// Doorbells.
    Doorbell = 1,
    /// Message queues.
    MsgQueue = 2,
    /// Virtual CPUs scheduled by the host.
    Vcpu = 5,
    /// Memory extents.
    MemExtent = 6,
}

/// Response of the `identify` hypercall.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HypIdentity {
    /// API information word.
    pub api_info: u64,
    /// Feature flag words.
    pub flags: [u64; 3],
}

impl HypIdentity {
    const API_VERSION_MASK: u64 = (1 << 14) - 1;
    const BIG_ENDIAN: u64 = 1 << 14;
    const IS_64BIT: u64 = 1 << 15;
    const VARIANT_SHIFT: u32 = 56;

    /// Get the API version.
    pub fn api_version(&self) -> u16 {
        (self.api_info & Self::API_VERSION_MASK) as u16
    }

    /// Check whether the hypervisor runs big endian.
    pub fn is_big_endian(&self) -> bool {
        self.api_info & Self::BIG_ENDIAN != 0
    }

    /// Check whether the hypervisor runs in 64-bit mode.
    pub fn is_64bit(&self) -> bool {
        self.api_info & Self::IS_64BIT != 0
    }

    /// Get the hypervisor variant.
    pub fn variant(&self) -> u8 {
        (self.api_info >> Self::VARIANT_SHIFT) as u8
    }

    /// Check whether `feature` is supported.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.flags[0] & (1u64 << feature as u32) != 0
    }
}

/// The privileged calls needed to donate memory to guests.
///
/// Every call is synchronous. A call failing with [HypError::Retry] may be reissued by the
/// caller, no call is retried internally.
pub trait Hypercall: Send + Sync {
    /// Query the hypervisor API version and features.
    fn identify(&self) -> HypIdentity;

    /// Move `[offset, offset + size)` from extent `from` to extent `to`.
    fn memextent_donate(
        &self,
        options: DonateOptions,
        from: CapId,
        to: CapId,
        offset: u64,
        size: u64,
    ) -> Result<()>;

    /// Map `[offset, offset + size)` of `extent` at `vbase` in `addrspace`.
    #[allow(clippy::too_many_arguments)]
    fn addrspace_map(
        &self,
        addrspace: CapId,
        extent: CapId,
        vbase: u64,
        attrs: MemExtentAttrs,
        flags: MapFlags,
        offset: u64,
        size: u64,
    ) -> Result<()>;

    /// Unmap `[offset, offset + size)` of `extent` from `vbase` in `addrspace`.
    fn addrspace_unmap(
        &self,
        addrspace: CapId,
        extent: CapId,
        vbase: u64,
        flags: MapFlags,
        offset: u64,
        size: u64,
    ) -> Result<()>;
}
