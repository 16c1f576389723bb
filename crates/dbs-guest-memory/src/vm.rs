// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dbs_allocator::{IntervalTree, Range};
use dbs_hypercall::{CapId, Feature, Hypercall, API_V1};
use log::{debug, error};
use parking_lot::RwLock;
use vm_memory::Address;

use crate::binding::{Binding, BindingExtent, MapMemArgs, MemFlags};
use crate::page::Folio;
use crate::parcel::MemParcel;
use crate::region::GuestMemFd;
use crate::rm::ResourceManager;
use crate::{Error, Result, PAGE_SHIFT, PAGE_SIZE};

/// Capabilities of the memory extents and address space assigned to a VM.
///
/// A missing capability makes every handoff needing it fail with [Error::NoDevice].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentCapabilities {
    /// Guest address space.
    pub addrspace: Option<CapId>,
    /// Host extent holding memory to lend.
    pub host_private: Option<CapId>,
    /// Host extent holding memory to share.
    pub host_shared: Option<CapId>,
    /// Guest extent receiving lent memory.
    pub guest_private: Option<CapId>,
    /// Guest extent receiving shared memory.
    pub guest_shared: Option<CapId>,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Extents {
    pub(crate) addrspace: CapId,
    pub(crate) host: CapId,
    pub(crate) guest: CapId,
}

impl ExtentCapabilities {
    pub(crate) fn select(&self, share: bool) -> Result<Extents> {
        let (host, guest) = if share {
            (self.host_shared, self.guest_shared)
        } else {
            (self.host_private, self.guest_private)
        };
        match (self.addrspace, host, guest) {
            (Some(addrspace), Some(host), Some(guest)) => Ok(Extents {
                addrspace,
                host,
                guest,
            }),
            _ => Err(Error::NoDevice),
        }
    }
}

/// Configuration information of a VM.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VmConfig {
    /// VM id assigned by the resource manager.
    pub vmid: u16,
    /// Memory extent capabilities.
    pub caps: ExtentCapabilities,
}

/// Memory currently owned by the guest.
#[derive(Clone, Debug)]
pub enum Donation {
    /// A folio donated and mapped through hypercalls.
    Page {
        /// The donated folio.
        folio: Arc<Folio>,
        /// Whether the host kept access.
        share: bool,
        /// Whether the guest may write.
        write: bool,
    },
    /// Folios lent or shared through the resource manager.
    Parcel {
        /// Manifest of the transfer.
        parcel: Arc<MemParcel>,
        /// The transferred folios, in guest frame order.
        folios: Vec<Arc<Folio>>,
    },
}

#[derive(Default)]
pub(crate) struct VmLayout {
    pub(crate) bindings: IntervalTree<Arc<Binding>>,
    pub(crate) donated: IntervalTree<Donation>,
}

/// Guest memory state of a virtual machine.
pub struct Vm {
    vmid: u16,
    caps: ExtentCapabilities,
    pub(crate) hyp: Arc<dyn Hypercall>,
    pub(crate) rm: Arc<dyn ResourceManager>,
    pub(crate) layout: RwLock<VmLayout>,
    next_label: AtomicU32,
}

impl Vm {
    /// Create the memory state of a VM.
    ///
    /// Fails with [Error::Unsupported] if the hypervisor lacks memory extent support.
    ///
    /// # Arguments
    /// * `config` - VM id and extent capabilities
    /// * `hyp` - Hypercall interface
    /// * `rm` - Resource manager interface
    pub fn new(
        config: VmConfig,
        hyp: Arc<dyn Hypercall>,
        rm: Arc<dyn ResourceManager>,
    ) -> Result<Arc<Self>> {
        let identity = hyp.identify();
        if identity.api_version() != API_V1 || !identity.has_feature(Feature::MemExtent) {
            error!(
                "{}: unsupported hypervisor api 0x{:x}, flags 0x{:x}",
                config.vmid, identity.api_info, identity.flags[0]
            );
            return Err(Error::Unsupported);
        }

        Ok(Arc::new(Vm {
            vmid: config.vmid,
            caps: config.caps,
            hyp,
            rm,
            layout: RwLock::new(VmLayout::default()),
            next_label: AtomicU32::new(0),
        }))
    }

    /// Get the VM id.
    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    /// Get the memory extent capabilities.
    pub fn caps(&self) -> &ExtentCapabilities {
        &self.caps
    }

    /// Add or remove a binding of `region`, as requested by `args`.
    pub fn modify_binding(self: &Arc<Self>, region: &GuestMemFd, args: &MapMemArgs) -> Result<()> {
        let flags = args.flags;
        if flags.bits() & !MemFlags::all().bits() != 0
            || !flags.intersects(MemFlags::ALLOW_RWX)
            || flags.access().is_none()
        {
            return Err(Error::InvalidArgument);
        }

        let gpa = args.guest_addr.raw_value();
        if (gpa | args.offset | args.size) & (PAGE_SIZE - 1) != 0 {
            return Err(Error::InvalidRange);
        }
        let (gfn, index, count) = (
            gpa >> PAGE_SHIFT,
            args.offset >> PAGE_SHIFT,
            args.size >> PAGE_SHIFT,
        );

        if flags.contains(MemFlags::UNMAP) {
            region.unbind(self, gfn, index, count, flags - MemFlags::UNMAP)
        } else {
            region.bind(self, gfn, index, count, flags)
        }
    }

    /// Get the binding covering guest frame `gfn`.
    pub fn binding_at(&self, gfn: u64) -> Option<Arc<Binding>> {
        self.layout
            .read()
            .bindings
            .get(gfn)
            .map(|(_, binding)| binding.clone())
    }

    /// Get the donation covering guest frame `gfn`, along with the guest frames it covers.
    pub fn donation_at(&self, gfn: u64) -> Option<(Range, Donation)> {
        self.layout
            .read()
            .donated
            .get(gfn)
            .map(|(range, donation)| (range, donation.clone()))
    }

    /// Get the number of bindings.
    pub fn nr_bindings(&self) -> usize {
        self.layout.read().bindings.len()
    }

    /// Get the number of donations.
    pub fn nr_donations(&self) -> usize {
        self.layout.read().donated.len()
    }

    pub(crate) fn next_label(&self) -> u32 {
        self.next_label.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_binding(&self, binding: &Arc<Binding>) -> Result<()> {
        let range = binding.extent().gfn_range();
        self.layout
            .write()
            .bindings
            .insert(range, binding.clone())
            .map_err(|_| Error::Conflict)
    }

    pub(crate) fn remove_binding(&self, binding: &Arc<Binding>) {
        let gfn = binding.extent().gfn;
        let mut layout = self.layout.write();
        let installed = matches!(layout.bindings.get(gfn), Some((_, b)) if Arc::ptr_eq(b, binding));
        if installed {
            layout.bindings.remove(gfn);
        }
    }

    pub(crate) fn resize_binding(&self, binding: &Arc<Binding>, extent: BindingExtent) {
        let mut layout = self.layout.write();
        let old = binding.extent();
        match layout.bindings.remove(old.gfn) {
            Some((_, b)) if Arc::ptr_eq(&b, binding) => {}
            _ => panic!(
                "{}: binding at gfn 0x{:x} missing from the layout",
                self.vmid, old.gfn
            ),
        }
        binding.set_extent(extent);
        if let Err(e) = layout.bindings.insert(extent.gfn_range(), binding.clone()) {
            panic!("{}: failed to shrink binding: {}", self.vmid, e);
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.reclaim_memory();

        let (bindings, leaked) = {
            let layout = self.layout.get_mut();
            (layout.bindings.take_all(), layout.donated.take_all())
        };
        for (_, binding) in bindings {
            binding.kill();
            if let Some(region) = binding.region() {
                region.remove_binding(&binding);
            }
        }
        // Frames the guest may still own must never be reused by the host.
        for (range, donation) in leaked {
            error!(
                "{}: leaking guest frames 0x{:x}-0x{:x} which could not be reclaimed",
                self.vmid, range.min, range.max
            );
            std::mem::forget(donation);
        }
        debug!("{}: guest memory released", self.vmid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHypervisor, MockRm, TEST_CAPS};

    #[test]
    fn test_select_extents() {
        let extents = TEST_CAPS.select(true).unwrap();
        assert_eq!(extents.host, TEST_CAPS.host_shared.unwrap());
        assert_eq!(extents.guest, TEST_CAPS.guest_shared.unwrap());
        let extents = TEST_CAPS.select(false).unwrap();
        assert_eq!(extents.host, TEST_CAPS.host_private.unwrap());
        assert_eq!(extents.guest, TEST_CAPS.guest_private.unwrap());

        let caps = ExtentCapabilities {
            guest_shared: None,
            ..TEST_CAPS
        };
        assert!(caps.select(false).is_ok());
        assert_eq!(caps.select(true).unwrap_err(), Error::NoDevice);
        let caps = ExtentCapabilities {
            addrspace: None,
            ..TEST_CAPS
        };
        assert_eq!(caps.select(false).unwrap_err(), Error::NoDevice);
    }

    #[test]
    fn test_vm_requires_memextent() {
        let hyp = MockHypervisor::new();
        let rm = MockRm::new();
        hyp.set_features(0);
        let config = VmConfig {
            vmid: 1,
            caps: TEST_CAPS,
        };
        assert_eq!(
            Vm::new(config, hyp.clone(), rm.clone()).err(),
            Some(Error::Unsupported)
        );

        hyp.set_features(1 << Feature::MemExtent as u32);
        let vm = Vm::new(config, hyp, rm).unwrap();
        assert_eq!(vm.vmid(), 1);
        assert_eq!(vm.caps(), &TEST_CAPS);
        assert_eq!(vm.nr_bindings(), 0);
        assert_eq!(vm.nr_donations(), 0);
        assert_eq!(vm.next_label(), 0);
        assert_eq!(vm.next_label(), 1);
    }
}
