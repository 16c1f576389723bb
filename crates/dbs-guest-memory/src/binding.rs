// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bindings of guest memory regions into the guest frame space of VMs.

use std::cmp::{max, min};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use dbs_allocator::{IntervalTree, Range};
use log::debug;
use parking_lot::Mutex;
use vm_memory::GuestAddress;

use crate::region::{GuestMemFd, RegionInner};
use crate::vm::Vm;
use crate::{Error, Result, PAGE_SHIFT};

bitflags! {
    /// Access flags of a binding request.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// The guest may read the memory.
        const READ = 1 << 0;
        /// The guest may write the memory.
        const WRITE = 1 << 1;
        /// The guest may execute from the memory.
        const EXEC = 1 << 2;
        /// All guest access rights.
        const ALLOW_RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
        /// Remove the binding instead of adding it.
        const UNMAP = 1 << 3;
        /// Field holding the [AccessPolicy].
        const ACCESS_MASK = 0xff << 8;
    }
}

/// Whether bound memory is lent to the guest or shared with it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Let the platform decide, which always means lend as every VM is isolated.
    Default,
    /// The guest gets exclusive access.
    ForceLend,
    /// The host keeps access.
    ForceShare,
}

impl AccessPolicy {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(AccessPolicy::Default),
            1 => Some(AccessPolicy::ForceLend),
            2 => Some(AccessPolicy::ForceShare),
            _ => None,
        }
    }

    fn raw(self) -> u32 {
        match self {
            AccessPolicy::Default => 0,
            AccessPolicy::ForceLend => 1,
            AccessPolicy::ForceShare => 2,
        }
    }

    /// Check whether memory bound with the policy is lent.
    pub fn is_lend(&self) -> bool {
        *self != AccessPolicy::ForceShare
    }
}

impl MemFlags {
    const ACCESS_SHIFT: u32 = 8;

    /// Get the access policy, `None` if the field holds an unknown value.
    pub fn access(&self) -> Option<AccessPolicy> {
        AccessPolicy::from_raw((self.bits() & Self::ACCESS_MASK.bits()) >> Self::ACCESS_SHIFT)
    }

    /// Replace the access policy.
    pub fn with_access(self, access: AccessPolicy) -> Self {
        MemFlags::from_bits_retain(
            (self.bits() & !Self::ACCESS_MASK.bits()) | (access.raw() << Self::ACCESS_SHIFT),
        )
    }

    // Returns whether the binding lends its memory.
    fn validate(&self) -> Result<bool> {
        if self.bits() & !MemFlags::all().bits() != 0 || !self.intersects(MemFlags::ALLOW_RWX) {
            return Err(Error::InvalidArgument);
        }
        self.access()
            .map(|access| access.is_lend())
            .ok_or(Error::InvalidArgument)
    }
}

/// Binding modification request, in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MapMemArgs {
    /// Guest physical address of the binding.
    pub guest_addr: GuestAddress,
    /// Offset into the region.
    pub offset: u64,
    /// Size of the binding.
    pub size: u64,
    /// Access flags, with [MemFlags::UNMAP] to remove the binding.
    pub flags: MemFlags,
}

/// Position of a binding, in pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BindingExtent {
    /// First guest frame.
    pub gfn: u64,
    /// First region page index.
    pub index: u64,
    /// Number of pages.
    pub count: u64,
}

impl BindingExtent {
    /// Get the covered guest frames.
    pub fn gfn_range(&self) -> Range {
        Range::new(self.gfn, self.gfn + self.count - 1)
    }

    /// Get the covered region pages.
    pub fn index_range(&self) -> Range {
        Range::new(self.index, self.index + self.count - 1)
    }

    /// Check whether guest frame `gfn` is covered.
    pub fn contains_gfn(&self, gfn: u64) -> bool {
        gfn >= self.gfn && gfn - self.gfn < self.count
    }

    /// Get the region page backing guest frame `gfn`.
    pub fn gfn_to_index(&self, gfn: u64) -> u64 {
        gfn - self.gfn + self.index
    }

    /// Get the guest frame backed by region page `index`.
    pub fn index_to_gfn(&self, index: u64) -> u64 {
        index - self.index + self.gfn
    }
}

/// A range of a guest memory region bound into the guest frame space of a VM.
#[derive(Debug)]
pub struct Binding {
    vm: Weak<Vm>,
    vmid: u16,
    region: Weak<RegionInner>,
    region_id: u64,
    flags: MemFlags,
    lend: bool,
    extent: Mutex<BindingExtent>,
    // Guest frames currently handed to the guest, tagged with whether they are lent.
    donated: Mutex<IntervalTree<bool>>,
    live: AtomicBool,
}

impl Binding {
    fn new(vm: &Arc<Vm>, region: &GuestMemFd, extent: BindingExtent, flags: MemFlags) -> Self {
        let lend = flags.access().map_or(true, |access| access.is_lend());
        Binding {
            vm: Arc::downgrade(vm),
            vmid: vm.vmid(),
            region: region.downgrade(),
            region_id: region.id(),
            flags,
            lend,
            extent: Mutex::new(extent),
            donated: Mutex::new(IntervalTree::new()),
            live: AtomicBool::new(true),
        }
    }

    /// Get the current position of the binding.
    pub fn extent(&self) -> BindingExtent {
        *self.extent.lock()
    }

    /// Get the access flags.
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Check whether the bound memory is lent to the guest.
    pub fn is_lend(&self) -> bool {
        self.lend
    }

    /// Get the id of the VM.
    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    /// Get the id of the region.
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    /// Check whether the binding is still installed.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Check whether guest frame `gfn` is currently handed to the guest through the binding.
    pub fn is_donated(&self, gfn: u64) -> bool {
        self.donated.lock().get(gfn).is_some()
    }

    /// Get the number of guest frames currently handed to the guest through the binding.
    pub fn nr_donated_pages(&self) -> u64 {
        self.donated
            .lock()
            .iter()
            .map(|(range, _)| range.max - range.min + 1)
            .sum()
    }

    pub(crate) fn vm(&self) -> Option<Arc<Vm>> {
        self.vm.upgrade()
    }

    pub(crate) fn region(&self) -> Option<GuestMemFd> {
        self.region.upgrade().map(|inner| GuestMemFd { inner })
    }

    pub(crate) fn belongs_to(&self, vm: &Arc<Vm>) -> bool {
        std::ptr::eq(self.vm.as_ptr(), Arc::as_ptr(vm))
    }

    pub(crate) fn kill(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub(crate) fn set_extent(&self, extent: BindingExtent) {
        *self.extent.lock() = extent;
    }

    pub(crate) fn mark_donated(&self, range: Range, lend: bool) {
        if let Err(e) = self.donated.lock().insert(range, lend) {
            panic!("{}: guest frames marked donated twice: {}", self.vmid, e);
        }
    }

    pub(crate) fn unmark_donated(&self, range: Range) {
        self.donated.lock().erase_range(range);
    }

    pub(crate) fn any_donated(&self, range: Range) -> bool {
        !self.donated.lock().is_free(&range)
    }

    /// Check whether the binding may coexist with `other`.
    ///
    /// Bindings of one VM never overlap in guest frames. Two bindings of the same region only
    /// coexist when they belong to different VMs, neither lends its memory and they cover
    /// disjoint region pages.
    pub fn allowed_overlap(&self, other: &Binding) -> bool {
        let a = self.extent();
        let b = other.extent();
        let same_vm = Weak::ptr_eq(&self.vm, &other.vm);

        if same_vm && a.gfn_range().intersect(&b.gfn_range()) {
            return false;
        }
        if Weak::ptr_eq(&self.region, &other.region)
            && (same_vm
                || self.lend
                || other.lend
                || a.index_range().intersect(&b.index_range()))
        {
            return false;
        }

        true
    }

    // Reclaims the donated frames backed by region pages [start, end).
    pub(crate) fn reclaim_index_range(&self, vm: &Vm, start: u64, end: u64) -> Result<()> {
        let extent = self.extent();
        let lo = max(start, extent.index);
        let hi = min(end, extent.index + extent.count);
        if lo >= hi {
            return Ok(());
        }

        let range = Range::new(extent.index_to_gfn(lo), extent.index_to_gfn(hi - 1));
        vm.reclaim_donated(self, range)
    }
}

impl GuestMemFd {
    fn check_binding(&self, gfn: u64, index: u64, count: u64, flags: MemFlags) -> Result<()> {
        if flags.contains(MemFlags::UNMAP) {
            return Err(Error::InvalidArgument);
        }
        flags.validate()?;

        let mask = self.page_mask() >> PAGE_SHIFT;
        if count == 0 || gfn & mask != 0 || index & mask != 0 || count & mask != 0 {
            return Err(Error::InvalidRange);
        }
        match (index.checked_add(count), gfn.checked_add(count)) {
            (Some(end), Some(_)) if end <= self.nr_pages() => Ok(()),
            _ => Err(Error::InvalidRange),
        }
    }

    /// Bind `count` pages of the region starting at page `index` to guest frame `gfn` of `vm`.
    ///
    /// # Arguments
    /// * `vm` - VM receiving the binding
    /// * `gfn` - First guest frame
    /// * `index` - First region page
    /// * `count` - Number of pages
    /// * `flags` - Guest access rights and access policy
    pub fn bind(
        &self,
        vm: &Arc<Vm>,
        gfn: u64,
        index: u64,
        count: u64,
        flags: MemFlags,
    ) -> Result<()> {
        self.check_binding(gfn, index, count, flags)?;
        let extent = BindingExtent { gfn, index, count };
        let binding = Arc::new(Binding::new(vm, self, extent, flags));

        let mut bindings = self.inner.bindings.write();
        if bindings.iter().any(|other| !binding.allowed_overlap(other)) {
            debug!(
                "{}: binding of region {} at gfn 0x{:x} conflicts",
                vm.vmid(),
                self.id(),
                gfn
            );
            return Err(Error::Conflict);
        }
        vm.insert_binding(&binding)?;
        bindings.push(binding);

        debug!(
            "{}: bound region {} pages 0x{:x}+0x{:x} at gfn 0x{:x}",
            vm.vmid(),
            self.id(),
            index,
            count,
            gfn
        );
        Ok(())
    }

    /// Remove `count` pages starting at guest frame `gfn` from the binding holding them.
    ///
    /// The range must match a binding with identical flags, and can cover the whole binding
    /// or either end of it. Splitting a binding in two isn't supported. Frames handed to the
    /// guest in the range are reclaimed first, and the binding stays unchanged if that fails.
    pub fn unbind(
        &self,
        vm: &Arc<Vm>,
        gfn: u64,
        index: u64,
        count: u64,
        flags: MemFlags,
    ) -> Result<()> {
        self.check_binding(gfn, index, count, flags)?;

        let mut bindings = self.inner.bindings.write();
        let pos = bindings
            .iter()
            .position(|b| {
                let extent = b.extent();
                b.belongs_to(vm)
                    && b.flags() == flags
                    && extent.gfn <= gfn
                    && gfn + count <= extent.gfn + extent.count
                    && index >= extent.index
                    && index - extent.index == gfn - extent.gfn
            })
            .ok_or(Error::NotFound)?;
        let binding = bindings[pos].clone();
        let extent = binding.extent();
        let start_delta = gfn - extent.gfn;
        let end_delta = extent.gfn + extent.count - gfn - count;
        let cut = Range::new(gfn, gfn + count - 1);

        match (start_delta, end_delta) {
            (0, 0) => {
                vm.reclaim_donated(&binding, cut)?;
                vm.remove_binding(&binding);
                binding.kill();
                bindings.remove(pos);
            }
            (_, 0) => {
                vm.reclaim_donated(&binding, cut)?;
                let shrunk = BindingExtent {
                    count: start_delta,
                    ..extent
                };
                vm.resize_binding(&binding, shrunk);
            }
            (0, _) => {
                vm.reclaim_donated(&binding, cut)?;
                let shrunk = BindingExtent {
                    gfn: extent.gfn + count,
                    index: extent.index + count,
                    count: extent.count - count,
                };
                vm.resize_binding(&binding, shrunk);
            }
            _ => return Err(Error::InvalidRange),
        }

        debug!(
            "{}: unbound region {} gfn 0x{:x}+0x{:x}",
            vm.vmid(),
            self.id(),
            gfn,
            count
        );
        Ok(())
    }
}
