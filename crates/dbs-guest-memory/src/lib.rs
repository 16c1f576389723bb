// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Guest memory lifecycle for hypervisors enforcing isolation by memory donation.
//!
//! The host can't simply map its memory into a guest: every page has to be donated to a guest
//! memory extent through the hypervisor, or lent/shared through the resource manager, and has
//! to be reclaimed before the host may reuse it. This crate keeps track of who owns what:
//! - [GuestMemFd] is a lazily populated memory region, the backing store of guest memory.
//! - [Binding]s map a range of a region into the guest frame space of a [Vm].
//! - [Vm] records the frames currently donated to the guest, and drives the donate, map, unmap
//!   and reclaim sequences. Guest faults on bound frames are resolved on demand by
//!   [Vm::handle_page_fault].

mod error;
pub use error::{Error, Result};

pub mod page;
pub use page::{Folio, FrameAllocator, PageArena};

mod region;
pub use region::{CreateMemArgs, FallocateMode, GuestMemFd, GuestMemFlags};

mod binding;
pub use binding::{AccessPolicy, Binding, BindingExtent, MapMemArgs, MemFlags};

pub mod parcel;
pub use parcel::{AclEntry, AclPerms, MemEntry, MemParcel, MemType};

pub mod rm;
pub use rm::{ResourceManager, RmError};

mod vm;
pub use vm::{Donation, ExtentCapabilities, Vm, VmConfig};

mod fault;
mod handoff;
mod provision;

#[cfg(test)]
pub(crate) mod test_utils;

use vm_memory::GuestAddress;

/// Page shift of guest and host frames.
pub const PAGE_SHIFT: u32 = 12;
/// Page size of guest and host frames.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Order of huge folios.
pub const HUGE_PAGE_ORDER: u32 = 9;
/// Number of pages in a huge folio.
pub const HUGE_PAGE_PAGES: u64 = 1 << HUGE_PAGE_ORDER;
/// Size of a huge folio.
pub const HUGE_PAGE_SIZE: u64 = HUGE_PAGE_PAGES << PAGE_SHIFT;

/// Convert a guest frame number to a guest physical address.
pub fn gfn_to_gpa(gfn: u64) -> GuestAddress {
    GuestAddress(gfn << PAGE_SHIFT)
}

/// Convert a guest physical address to the guest frame number covering it.
pub fn gpa_to_gfn(gpa: GuestAddress) -> u64 {
    gpa.0 >> PAGE_SHIFT
}
