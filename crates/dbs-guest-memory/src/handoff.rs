// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer of folio ownership between the host and a guest.
//!
//! Folios reach the guest either one at a time, donated to a guest memory extent and mapped
//! with hypercalls, or in batches described by a [MemParcel] and lent or shared through the
//! resource manager. Both leave a [Donation] in the donated frame map of the VM, which holds a
//! reference to every transferred folio until the transfer is reclaimed.

use std::cmp::min;
use std::sync::Arc;

use dbs_allocator::Range;
use dbs_hypercall::{
    DonateOptions, DonateType, MapFlags, MemExtentAttrs, PagetableAccess, DEFAULT_MEMTYPE,
};
use log::{debug, error, trace};
use parking_lot::MutexGuard;

use crate::binding::{Binding, MemFlags};
use crate::page::Folio;
use crate::parcel::{AclEntry, AclPerms, MemParcel};
use crate::vm::{Donation, Vm};
use crate::{gfn_to_gpa, Error, Result, PAGE_SHIFT};

fn donate_options(share: bool) -> DonateOptions {
    if share {
        DonateOptions::new(DonateType::ToSibling)
    } else {
        DonateOptions::new(DonateType::ToProtected)
    }
}

fn reclaim_options(share: bool) -> DonateOptions {
    if share {
        DonateOptions::new(DonateType::ToSibling)
    } else {
        DonateOptions::new(DonateType::FromProtected)
    }
}

fn page_access(share: bool, write: bool) -> PagetableAccess {
    match (share, write) {
        (true, true) => PagetableAccess::RW,
        (true, false) => PagetableAccess::R,
        (false, true) => PagetableAccess::RWX,
        (false, false) => PagetableAccess::RX,
    }
}

fn acl_perms(flags: MemFlags) -> AclPerms {
    let mut perms = AclPerms::empty();
    if flags.contains(MemFlags::READ) {
        perms |= AclPerms::R;
    }
    if flags.contains(MemFlags::WRITE) {
        perms |= AclPerms::W;
    }
    if flags.contains(MemFlags::EXEC) {
        perms |= AclPerms::X;
    }
    perms
}

impl Vm {
    /// Donate `folio` to the guest and map it at guest frame `gfn`.
    ///
    /// # Arguments
    /// * `folio` - Folio to hand over
    /// * `gfn` - Guest frame receiving the first page of the folio
    /// * `share` - Whether the host keeps access
    /// * `write` - Whether the guest may write
    pub fn provide_page(
        &self,
        folio: &Arc<Folio>,
        gfn: u64,
        share: bool,
        write: bool,
    ) -> Result<()> {
        let guard = folio.lock();
        self.provide_locked(folio, &guard, gfn, share, write)
    }

    pub(crate) fn provide_locked(
        &self,
        folio: &Arc<Folio>,
        _guard: &MutexGuard<'_, ()>,
        gfn: u64,
        share: bool,
        write: bool,
    ) -> Result<()> {
        let extents = self.caps().select(share)?;
        let range = Range::with_size(gfn, folio.nr_pages()).ok_or(Error::InvalidRange)?;
        let donation = Donation::Page {
            folio: folio.clone(),
            share,
            write,
        };

        // Record the donation first, so a racing reclaim of the frame finds it.
        self.layout
            .write()
            .donated
            .insert(range, donation)
            .map_err(|_| Error::Conflict)?;

        let gpa = gfn_to_gpa(gfn).0;
        let (pa, size) = (folio.phys_addr(), folio.size());
        trace!(
            "{}: donating 0x{:x}+0x{:x} to guest address 0x{:016x}",
            self.vmid(),
            pa,
            size,
            gpa
        );

        if let Err(e) =
            self.hyp
                .memextent_donate(donate_options(share), extents.host, extents.guest, pa, size)
        {
            error!(
                "{}: failed to donate memory for guest address 0x{:016x}: {}",
                self.vmid(),
                gpa,
                e
            );
            self.erase_page(range, folio);
            return Err(e.into());
        }

        let access = page_access(share, write);
        let attrs = MemExtentAttrs::new(DEFAULT_MEMTYPE, access, access);
        let flags = if share {
            MapFlags::PARTIAL | MapFlags::VMMIO
        } else {
            MapFlags::PARTIAL | MapFlags::PRIVATE
        };
        if let Err(e) =
            self.hyp
                .addrspace_map(extents.addrspace, extents.guest, gpa, attrs, flags, pa, size)
        {
            error!(
                "{}: failed to map guest address 0x{:016x}: {}",
                self.vmid(),
                gpa,
                e
            );
            if let Err(err) = self.hyp.memextent_donate(
                reclaim_options(share),
                extents.guest,
                extents.host,
                pa,
                size,
            ) {
                // The guest extent still owns the folio, keep it accounted as donated.
                error!(
                    "{}: failed to reclaim memory donation for guest address 0x{:016x}: {}",
                    self.vmid(),
                    gpa,
                    err
                );
                folio.mark_donated(!share);
            } else {
                self.erase_page(range, folio);
            }
            return Err(e.into());
        }

        folio.mark_donated(!share);
        Ok(())
    }

    fn erase_page(&self, range: Range, folio: &Arc<Folio>) {
        let removed = self.layout.write().donated.remove(range.min);
        match removed {
            Some((r, Donation::Page { folio: f, .. })) if r == range && Arc::ptr_eq(&f, folio) => {}
            _ => panic!(
                "{}: donated frame map corrupted at gfn 0x{:x}",
                self.vmid(),
                range.min
            ),
        }
    }

    // Clears the donation marks of the binding covering `range`, if any.
    fn unmark_binding(&self, range: Range) {
        let binding = self.binding_at(range.min);
        if let Some(binding) = binding {
            binding.unmark_donated(range);
        }
    }

    /// Unmap the folio donated at guest frame `gfn` and take it back from the guest.
    ///
    /// Succeeds without doing anything if no folio is donated at `gfn`, and fails with
    /// [Error::Retry] if the donation changed while waiting for the folio lock. On hypercall
    /// failure the frame stays accounted as donated.
    pub fn reclaim_page(&self, gfn: u64) -> Result<()> {
        let (range, folio, share) = match self.donation_at(gfn) {
            None => return Ok(()),
            Some((range, Donation::Page { folio, share, .. })) => (range, folio, share),
            Some((_, Donation::Parcel { .. })) => return Err(Error::InvalidArgument),
        };
        let extents = self.caps().select(share)?;

        let _guard = folio.lock();
        match self.donation_at(gfn) {
            Some((r, Donation::Page { folio: f, .. }))
                if r == range && Arc::ptr_eq(&f, &folio) => {}
            _ => return Err(Error::Retry),
        }

        let gpa = gfn_to_gpa(range.min).0;
        let (pa, size) = (folio.phys_addr(), folio.size());
        trace!(
            "{}: reclaiming 0x{:x}+0x{:x} from guest address 0x{:016x}",
            self.vmid(),
            pa,
            size,
            gpa
        );

        self.hyp
            .addrspace_unmap(
                extents.addrspace,
                extents.guest,
                gpa,
                MapFlags::PARTIAL,
                pa,
                size,
            )
            .map_err(|e| {
                error!(
                    "{}: failed to unmap guest address 0x{:016x}: {}",
                    self.vmid(),
                    gpa,
                    e
                );
                Error::from(e)
            })?;
        self.hyp
            .memextent_donate(reclaim_options(share), extents.guest, extents.host, pa, size)
            .map_err(|e| {
                error!(
                    "{}: failed to reclaim memory donation for guest address 0x{:016x}: {}",
                    self.vmid(),
                    gpa,
                    e
                );
                Error::from(e)
            })?;

        self.erase_page(range, &folio);
        folio.clear_donated(!share);
        self.unmark_binding(range);
        Ok(())
    }

    /// Lend or share the bound pages from guest frame `gfn` through the resource manager.
    ///
    /// The request is clamped to the binding covering `gfn` and widened to whole folios.
    /// Returns the parcel along with the first guest frame and the number of frames it covers.
    pub fn share_range(&self, gfn: u64, count: u64) -> Result<(Arc<MemParcel>, u64, u64)> {
        if count == 0 {
            return Err(Error::InvalidRange);
        }
        let binding = self.binding_at(gfn).ok_or(Error::NotFound)?;
        let region = binding.region().ok_or(Error::NotFound)?;
        let _bindings = region.lock_shared();
        let extent = binding.extent();
        if !binding.is_live() || !extent.contains_gfn(gfn) {
            return Err(Error::NotFound);
        }

        let end = min(
            gfn.saturating_add(count),
            extent.gfn + extent.count,
        );
        let mut folios = Vec::new();
        let mut index = extent.gfn_to_index(gfn);
        let end_index = extent.gfn_to_index(end);
        while index < end_index {
            let folio = region.acquire_page(index)?;
            index = folio.next_index();
            folios.push(folio);
        }
        let base = match folios.first() {
            Some(folio) => extent.index_to_gfn(folio.index()),
            None => return Err(Error::InvalidRange),
        };
        let count = extent.index_to_gfn(index) - base;
        let range = Range::new(base, base + count - 1);

        let guards: Vec<_> = folios.iter().map(|folio| folio.lock()).collect();
        if folios.iter().any(|folio| folio.is_donated()) {
            return Err(Error::Conflict);
        }

        let lend = binding.is_lend();
        let mut acl = vec![AclEntry {
            vmid: self.vmid(),
            perms: acl_perms(binding.flags()),
        }];
        if !lend {
            acl.push(AclEntry {
                vmid: self.rm.host_vmid(),
                perms: AclPerms::R | AclPerms::W,
            });
        }
        let parcel = Arc::new(MemParcel::new(self.next_label(), &folios, acl));

        let donation = Donation::Parcel {
            parcel: parcel.clone(),
            folios: folios.clone(),
        };
        self.layout
            .write()
            .donated
            .insert(range, donation)
            .map_err(|_| Error::Conflict)?;

        let result = if lend {
            self.rm.lend(&parcel)
        } else {
            self.rm.share(&parcel)
        };
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "{}: failed to transfer guest frames 0x{:x}-0x{:x}: {}",
                    self.vmid(),
                    range.min,
                    range.max,
                    e
                );
                self.erase_parcel(range, &parcel);
                return Err(e.into());
            }
        };
        parcel.set_handle(Some(handle));

        for folio in folios.iter() {
            folio.mark_donated(lend);
        }
        binding.mark_donated(range, lend);
        drop(guards);

        debug!(
            "{}: {} guest frames 0x{:x}-0x{:x}, handle 0x{:x}",
            self.vmid(),
            if lend { "lent" } else { "shared" },
            range.min,
            range.max,
            handle
        );
        Ok((parcel, base, count))
    }

    fn erase_parcel(&self, range: Range, parcel: &Arc<MemParcel>) -> Donation {
        let removed = self.layout.write().donated.remove(range.min);
        match removed {
            Some((r, donation)) if r == range => match &donation {
                Donation::Parcel { parcel: p, .. } if Arc::ptr_eq(p, parcel) => donation,
                _ => panic!(
                    "{}: donated frame map corrupted at gfn 0x{:x}",
                    self.vmid(),
                    range.min
                ),
            },
            _ => panic!(
                "{}: donated frame map corrupted at gfn 0x{:x}",
                self.vmid(),
                range.min
            ),
        }
    }

    fn parcel_folios(
        &self,
        parcel: &Arc<MemParcel>,
        gfn: u64,
        count: u64,
    ) -> Result<(Range, Vec<Arc<Folio>>)> {
        match self.donation_at(gfn) {
            Some((range, Donation::Parcel { parcel: p, folios })) if Arc::ptr_eq(&p, parcel) => {
                if range.min != gfn || range.len() != Some(count) {
                    return Err(Error::InvalidRange);
                }
                Ok((range, folios))
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Take back a parcel lent or shared by [Vm::share_range].
    ///
    /// A resource manager failure leaves the pages accounted as donated, since the state of
    /// their contents at the guest is unknown.
    pub fn reclaim_range(&self, parcel: &Arc<MemParcel>, gfn: u64, count: u64) -> Result<()> {
        let (range, folios) = self.parcel_folios(parcel, gfn, count)?;
        let guards: Vec<_> = folios.iter().map(|folio| folio.lock()).collect();
        if self.parcel_folios(parcel, gfn, count)?.0 != range {
            return Err(Error::Retry);
        }

        if parcel.handle().is_some() {
            if let Err(e) = self.rm.reclaim(parcel) {
                error!(
                    "{}: failed to reclaim guest frames 0x{:x}-0x{:x}, the pages are kept: {}",
                    self.vmid(),
                    range.min,
                    range.max,
                    e
                );
                return Err(e.into());
            }
        }
        parcel.set_handle(None);

        let lend = !parcel.is_shared();
        let donation = self.erase_parcel(range, parcel);
        for folio in folios.iter() {
            folio.clear_donated(lend);
        }
        self.unmark_binding(range);
        drop(guards);
        drop(donation);

        debug!(
            "{}: reclaimed guest frames 0x{:x}-0x{:x}",
            self.vmid(),
            range.min,
            range.max
        );
        Ok(())
    }

    /// Turn a parcel accepted by the guest into one page donation per folio.
    ///
    /// Each folio can then be reclaimed on its own with [Vm::reclaim_page]. The share and write
    /// attributes of the pages come from the parcel access list.
    pub fn parcel_to_paged(&self, parcel: &Arc<MemParcel>, gfn: u64, count: u64) -> Result<()> {
        let (range, folios) = self.parcel_folios(parcel, gfn, count)?;
        let guards: Vec<_> = folios.iter().map(|folio| folio.lock()).collect();

        let share = parcel.is_shared();
        let write = parcel.guest_perms().contains(AclPerms::W);
        let mut layout = self.layout.write();
        match layout.donated.get(gfn) {
            Some((r, Donation::Parcel { parcel: p, .. }))
                if r == range && Arc::ptr_eq(p, parcel) => {}
            _ => return Err(Error::Retry),
        }
        layout.donated.remove(gfn);

        let mut next = range.min;
        for folio in folios.iter() {
            let page = Range::new(next, next + folio.nr_pages() - 1);
            let donation = Donation::Page {
                folio: folio.clone(),
                share,
                write,
            };
            if let Err(e) = layout.donated.insert(page, donation) {
                panic!("{}: failed to split parcel: {}", self.vmid(), e);
            }
            next = page.max + 1;
        }
        assert_eq!(
            next,
            range.max + 1,
            "{}: parcel pages don't match its frames",
            self.vmid()
        );
        drop(layout);
        drop(guards);

        Ok(())
    }

    // Reclaims whatever `binding` handed to the guest within guest frames `range`.
    pub(crate) fn reclaim_donated(&self, binding: &Binding, range: Range) -> Result<()> {
        let entries: Vec<(Range, Donation)> = {
            let layout = self.layout.read();
            layout
                .donated
                .iter_intersecting(range)
                .filter(|(r, _)| binding.any_donated(*r))
                .map(|(r, donation)| (r, donation.clone()))
                .collect()
        };

        for (r, donation) in entries {
            match donation {
                Donation::Parcel { parcel, .. } => {
                    self.reclaim_range(&parcel, r.min, r.max - r.min + 1)?
                }
                Donation::Page { .. } => self.reclaim_page(r.min)?,
            }
        }

        Ok(())
    }

    /// Take back every folio handed to the guest, logging failures.
    pub fn reclaim_memory(&self) {
        let entries: Vec<(Range, Donation)> = self
            .layout
            .read()
            .donated
            .iter()
            .map(|(r, donation)| (r, donation.clone()))
            .collect();

        for (r, donation) in entries {
            let result = match donation {
                Donation::Parcel { parcel, .. } => {
                    self.reclaim_range(&parcel, r.min, r.max - r.min + 1)
                }
                Donation::Page { .. } => self.reclaim_page(r.min),
            };
            if let Err(e) = result {
                error!(
                    "{}: failed to reclaim guest memory at 0x{:x}: {}",
                    self.vmid(),
                    r.min << PAGE_SHIFT,
                    e
                );
            }
        }
    }
}
