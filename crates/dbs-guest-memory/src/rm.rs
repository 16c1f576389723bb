// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interface to the resource manager VM arbitrating memory transfers between VMs.

use crate::parcel::MemParcel;

/// Errors reported by the resource manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RmError {
    /// The resource manager is busy.
    #[error("resource manager busy")]
    Busy,
    /// The request should be reissued.
    #[error("resource manager asked to retry")]
    Retry,
    /// The resource manager refused the request.
    #[error("resource manager denied the request")]
    Denied,
    /// The resource manager ran out of memory.
    #[error("resource manager out of memory")]
    NoMemory,
    /// The memory parcel handle is unknown.
    #[error("invalid memory parcel handle")]
    InvalidHandle,
    /// Other resource manager error code.
    #[error("resource manager error {0}")]
    Other(u32),
}

impl RmError {
    /// Decode a resource manager reply status, `0` meaning success.
    pub fn from_raw(status: u32) -> std::result::Result<(), RmError> {
        match status {
            0 => Ok(()),
            1 => Err(RmError::NoMemory),
            3 => Err(RmError::Denied),
            5 => Err(RmError::Busy),
            7 => Err(RmError::InvalidHandle),
            other => Err(RmError::Other(other)),
        }
    }
}

/// Memory transfer calls of the resource manager.
///
/// The message transport is owned by the implementation, every call blocks until the reply
/// arrives.
pub trait ResourceManager: Send + Sync {
    /// Get the VM id the resource manager knows the host as.
    fn host_vmid(&self) -> u16;

    /// Lend the parcel exclusively to the VMs of its access list, returning the transfer handle.
    fn lend(&self, parcel: &MemParcel) -> std::result::Result<u32, RmError>;

    /// Share the parcel with the VMs of its access list, returning the transfer handle.
    fn share(&self, parcel: &MemParcel) -> std::result::Result<u32, RmError>;

    /// Take back the memory of a parcel previously lent or shared.
    fn reclaim(&self, parcel: &MemParcel) -> std::result::Result<(), RmError>;
}
