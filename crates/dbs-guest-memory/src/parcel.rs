// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory parcels, the manifests exchanged with the resource manager.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::page::Folio;
use crate::PAGE_SHIFT;

/// Handle value of a parcel unknown to the resource manager.
pub const MEM_HANDLE_INVAL: u32 = std::u32::MAX;

bitflags! {
    /// Access rights granted to a VM by a parcel.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct AclPerms: u8 {
        /// Execute.
        const X = 1 << 0;
        /// Write.
        const W = 1 << 1;
        /// Read.
        const R = 1 << 2;
    }
}

/// A physically contiguous piece of a parcel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemEntry {
    /// Physical base address.
    pub phys_addr: u64,
    /// Size in bytes.
    pub size: u64,
}

/// A VM allowed to access a parcel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AclEntry {
    /// VM id.
    pub vmid: u16,
    /// Granted access rights.
    pub perms: AclPerms,
}

/// Memory type of a parcel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemType {
    /// Normal memory.
    Normal = 0,
    /// IO memory.
    Io = 1,
}

/// Description of a set of pages handed to other VMs through the resource manager.
#[derive(Debug)]
pub struct MemParcel {
    /// Label identifying the parcel to the receiving VM.
    pub label: u32,
    /// Physically contiguous pieces, in guest frame order.
    pub mem_entries: Vec<MemEntry>,
    /// VMs given access to the parcel. The receiving VM comes first.
    pub acl_entries: Vec<AclEntry>,
    /// Memory type.
    pub mem_type: MemType,
    handle: AtomicU32,
}

impl MemParcel {
    /// Create a parcel covering `folios`, which are expected in ascending page index order.
    ///
    /// Folios adjacent both in the region and in physical memory are merged into one entry.
    pub fn new(label: u32, folios: &[Arc<Folio>], acl_entries: Vec<AclEntry>) -> Self {
        let mut mem_entries: Vec<MemEntry> = Vec::new();
        let mut next_index = None;
        for folio in folios {
            let merge = match mem_entries.last() {
                Some(last) => {
                    next_index == Some(folio.index())
                        && last.phys_addr + last.size == folio.phys_addr()
                }
                None => false,
            };
            match mem_entries.last_mut() {
                Some(last) if merge => last.size += folio.size(),
                _ => mem_entries.push(MemEntry {
                    phys_addr: folio.phys_addr(),
                    size: folio.size(),
                }),
            }
            next_index = Some(folio.next_index());
        }

        MemParcel {
            label,
            mem_entries,
            acl_entries,
            mem_type: MemType::Normal,
            handle: AtomicU32::new(MEM_HANDLE_INVAL),
        }
    }

    /// Get the transfer handle assigned by the resource manager.
    pub fn handle(&self) -> Option<u32> {
        match self.handle.load(Ordering::Acquire) {
            MEM_HANDLE_INVAL => None,
            handle => Some(handle),
        }
    }

    pub(crate) fn set_handle(&self, handle: Option<u32>) {
        self.handle
            .store(handle.unwrap_or(MEM_HANDLE_INVAL), Ordering::Release);
    }

    /// Check whether the host keeps access to the parcel.
    pub fn is_shared(&self) -> bool {
        self.acl_entries.len() > 1
    }

    /// Get the rights of the receiving VM.
    pub fn guest_perms(&self) -> AclPerms {
        self.acl_entries
            .first()
            .map(|acl| acl.perms)
            .unwrap_or_else(AclPerms::empty)
    }

    /// Get the number of pages in the parcel.
    pub fn nr_pages(&self) -> u64 {
        self.mem_entries.iter().map(|e| e.size >> PAGE_SHIFT).sum()
    }
}
