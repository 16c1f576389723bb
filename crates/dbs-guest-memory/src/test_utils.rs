// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mock hypervisor and resource manager shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dbs_hypercall::{
    CapId, DonateOptions, DonateType, Feature, HypError, HypIdentity, Hypercall, MapFlags,
    MemExtentAttrs, PagetableAccess, DEFAULT_MEMTYPE,
};
use parking_lot::Mutex;

use crate::page::{Folio, FrameAllocator, PageArena};
use crate::parcel::MemParcel;
use crate::rm::{ResourceManager, RmError};
use crate::vm::{ExtentCapabilities, Vm, VmConfig};
use crate::PAGE_SHIFT;

pub(crate) const TEST_CAPS: ExtentCapabilities = ExtentCapabilities {
    addrspace: Some(1),
    host_private: Some(2),
    host_shared: Some(3),
    guest_private: Some(4),
    guest_shared: Some(5),
};

const TEST_ARENA_BASE_PFN: u64 = 0x80000;

pub(crate) fn create_page_arena(nr_pages: u64) -> Arc<PageArena> {
    Arc::new(PageArena::new(TEST_ARENA_BASE_PFN, nr_pages).unwrap())
}

pub(crate) fn create_arena(nr_pages: u64) -> Arc<dyn FrameAllocator> {
    create_page_arena(nr_pages)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum HypOp {
    Donate,
    Map,
    Unmap,
}

#[derive(Copy, Clone, Debug)]
struct Mapping {
    extent: CapId,
    attrs: MemExtentAttrs,
    flags: MapFlags,
}

struct HypState {
    features: u64,
    // Physical address to the extent holding it, absent while the host owns it.
    owners: BTreeMap<u64, CapId>,
    mappings: BTreeMap<u64, Mapping>,
    donations: Vec<DonateOptions>,
    faults: HashMap<HypOp, (u32, HypError)>,
}

/// Hypervisor tracking extent ownership and stage-2 mappings of donated memory.
pub(crate) struct MockHypervisor {
    state: Mutex<HypState>,
}

impl MockHypervisor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockHypervisor {
            state: Mutex::new(HypState {
                features: 1 << Feature::MemExtent as u32,
                owners: BTreeMap::new(),
                mappings: BTreeMap::new(),
                donations: Vec::new(),
                faults: HashMap::new(),
            }),
        })
    }

    pub(crate) fn set_features(&self, features: u64) {
        self.state.lock().features = features;
    }

    /// Fail the next `op` call with `err`.
    pub(crate) fn inject(&self, op: HypOp, err: HypError) {
        self.inject_at(op, 0, err);
    }

    /// Let `skip` calls of `op` succeed, then fail the following one with `err`.
    pub(crate) fn inject_at(&self, op: HypOp, skip: u32, err: HypError) {
        self.state.lock().faults.insert(op, (skip, err));
    }

    pub(crate) fn owner_of(&self, pa: u64) -> Option<CapId> {
        self.state.lock().owners.get(&pa).copied()
    }

    pub(crate) fn mapping_at(&self, vbase: u64) -> Option<(MemExtentAttrs, MapFlags)> {
        self.state
            .lock()
            .mappings
            .get(&vbase)
            .map(|m| (m.attrs, m.flags))
    }

    pub(crate) fn nr_donated(&self) -> usize {
        self.state.lock().owners.len()
    }

    pub(crate) fn nr_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Options of every successful donation, in call order.
    pub(crate) fn donations(&self) -> Vec<DonateOptions> {
        self.state.lock().donations.clone()
    }

    /// Install `folio` in guest extent `extent` at guest frame `gfn`, as the resource manager
    /// does when the guest accepts a parcel.
    pub(crate) fn seed_mapping(&self, folio: &Folio, gfn: u64, extent: CapId) {
        let mut state = self.state.lock();
        state.owners.insert(folio.phys_addr(), extent);
        state.mappings.insert(
            gfn << PAGE_SHIFT,
            Mapping {
                extent,
                attrs: MemExtentAttrs::new(
                    DEFAULT_MEMTYPE,
                    PagetableAccess::RWX,
                    PagetableAccess::RWX,
                ),
                flags: MapFlags::PARTIAL | MapFlags::PRIVATE,
            },
        );
    }

    fn is_host_extent(extent: CapId) -> bool {
        Some(extent) == TEST_CAPS.host_private || Some(extent) == TEST_CAPS.host_shared
    }

    fn check_fault(state: &mut HypState, op: HypOp) -> dbs_hypercall::Result<()> {
        match state.faults.get_mut(&op) {
            Some((0, err)) => {
                let err = *err;
                state.faults.remove(&op);
                Err(err)
            }
            Some((skip, _)) => {
                *skip -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_donate_type(options: DonateOptions, from: CapId, to: CapId) -> bool {
        let (from, to) = (Some(from), Some(to));
        match options.donate_type() {
            Some(DonateType::ToSibling) => {
                (from == TEST_CAPS.host_shared && to == TEST_CAPS.guest_shared)
                    || (from == TEST_CAPS.guest_shared && to == TEST_CAPS.host_shared)
            }
            Some(DonateType::ToProtected) => {
                from == TEST_CAPS.host_private && to == TEST_CAPS.guest_private
            }
            Some(DonateType::FromProtected) => {
                from == TEST_CAPS.guest_private && to == TEST_CAPS.host_private
            }
            _ => false,
        }
    }
}

impl Hypercall for MockHypervisor {
    fn identify(&self) -> HypIdentity {
        HypIdentity {
            api_info: (1 << 15) | 1,
            flags: [self.state.lock().features, 0, 0],
        }
    }

    fn memextent_donate(
        &self,
        options: DonateOptions,
        from: CapId,
        to: CapId,
        offset: u64,
        _size: u64,
    ) -> dbs_hypercall::Result<()> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, HypOp::Donate)?;
        if !Self::check_donate_type(options, from, to) {
            return Err(HypError::ArgInval);
        }

        let owner = state.owners.get(&offset).copied();
        if Self::is_host_extent(from) {
            if owner.is_some() {
                return Err(HypError::Denied);
            }
        } else if owner != Some(from) {
            return Err(HypError::Denied);
        }

        if Self::is_host_extent(to) {
            state.owners.remove(&offset);
        } else {
            state.owners.insert(offset, to);
        }
        state.donations.push(options);
        Ok(())
    }

    fn addrspace_map(
        &self,
        addrspace: CapId,
        extent: CapId,
        vbase: u64,
        attrs: MemExtentAttrs,
        flags: MapFlags,
        offset: u64,
        _size: u64,
    ) -> dbs_hypercall::Result<()> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, HypOp::Map)?;
        if Some(addrspace) != TEST_CAPS.addrspace {
            return Err(HypError::CapWrongObjType);
        }
        if state.owners.get(&offset) != Some(&extent) {
            return Err(HypError::Denied);
        }
        if state.mappings.contains_key(&vbase) {
            return Err(HypError::Busy);
        }

        state.mappings.insert(
            vbase,
            Mapping {
                extent,
                attrs,
                flags,
            },
        );
        Ok(())
    }

    fn addrspace_unmap(
        &self,
        addrspace: CapId,
        extent: CapId,
        vbase: u64,
        _flags: MapFlags,
        _offset: u64,
        _size: u64,
    ) -> dbs_hypercall::Result<()> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, HypOp::Unmap)?;
        if Some(addrspace) != TEST_CAPS.addrspace {
            return Err(HypError::CapWrongObjType);
        }
        // Unmapping a hole is a no-op.
        match state.mappings.get(&vbase) {
            Some(mapping) if mapping.extent != extent => Err(HypError::Denied),
            Some(_) => {
                state.mappings.remove(&vbase);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum RmOp {
    Lend,
    Share,
    Reclaim,
}

struct RmState {
    next_handle: u32,
    // Live transfers, keyed by handle, with the label of their parcel.
    live: BTreeMap<u32, u32>,
    faults: HashMap<RmOp, RmError>,
}

/// Resource manager handing out transfer handles.
pub(crate) struct MockRm {
    state: Mutex<RmState>,
}

impl MockRm {
    pub(crate) const HOST_VMID: u16 = 0xffff;

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockRm {
            state: Mutex::new(RmState {
                next_handle: 0x100,
                live: BTreeMap::new(),
                faults: HashMap::new(),
            }),
        })
    }

    /// Fail the next `op` request with `err`.
    pub(crate) fn inject(&self, op: RmOp, err: RmError) {
        self.state.lock().faults.insert(op, err);
    }

    pub(crate) fn is_live(&self, handle: u32) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    pub(crate) fn nr_live(&self) -> usize {
        self.state.lock().live.len()
    }

    fn transfer(&self, op: RmOp, parcel: &MemParcel) -> Result<u32, RmError> {
        let mut state = self.state.lock();
        if let Some(err) = state.faults.remove(&op) {
            return Err(err);
        }
        if parcel.mem_entries.is_empty() || parcel.acl_entries.is_empty() {
            return Err(RmError::Denied);
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.live.insert(handle, parcel.label);
        Ok(handle)
    }
}

impl ResourceManager for MockRm {
    fn host_vmid(&self) -> u16 {
        Self::HOST_VMID
    }

    fn lend(&self, parcel: &MemParcel) -> Result<u32, RmError> {
        self.transfer(RmOp::Lend, parcel)
    }

    fn share(&self, parcel: &MemParcel) -> Result<u32, RmError> {
        self.transfer(RmOp::Share, parcel)
    }

    fn reclaim(&self, parcel: &MemParcel) -> Result<(), RmError> {
        let mut state = self.state.lock();
        if let Some(err) = state.faults.remove(&RmOp::Reclaim) {
            return Err(err);
        }
        let handle = parcel.handle().ok_or(RmError::InvalidHandle)?;
        match state.live.remove(&handle) {
            Some(label) if label == parcel.label => Ok(()),
            Some(label) => {
                state.live.insert(handle, label);
                Err(RmError::InvalidHandle)
            }
            None => Err(RmError::InvalidHandle),
        }
    }
}

pub(crate) fn create_vm_with(vmid: u16, hyp: &Arc<MockHypervisor>, rm: &Arc<MockRm>) -> Arc<Vm> {
    let config = VmConfig {
        vmid,
        caps: TEST_CAPS,
    };
    Vm::new(config, hyp.clone(), rm.clone()).unwrap()
}

pub(crate) fn create_vm(vmid: u16) -> (Arc<Vm>, Arc<MockHypervisor>, Arc<MockRm>) {
    let hyp = MockHypervisor::new();
    let rm = MockRm::new();
    let vm = create_vm_with(vmid, &hyp, &rm);
    (vm, hyp, rm)
}
