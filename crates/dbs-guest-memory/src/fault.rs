// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use dbs_allocator::Range;
use log::{debug, trace};
use vm_memory::GuestAddress;

use crate::binding::MemFlags;
use crate::vm::{Donation, Vm};
use crate::{gpa_to_gfn, Error, Result};

impl Vm {
    /// Resolve a guest fault on guest physical address `gpa` by donating the backing folio.
    ///
    /// The folio of the binding covering `gpa` is populated if needed and handed to the guest,
    /// lent or shared according to the binding policy. Faults racing on the same folio resolve
    /// once, the later ones find the donation in place and succeed.
    ///
    /// # Arguments
    /// * `gpa` - Faulting guest physical address
    /// * `is_write` - Whether the guest attempted a write
    pub fn handle_page_fault(&self, gpa: GuestAddress, is_write: bool) -> Result<()> {
        let gfn = gpa_to_gfn(gpa);
        let binding = self.binding_at(gfn).ok_or(Error::NotFound)?;
        let write = binding.flags().contains(MemFlags::WRITE);
        if is_write && !write {
            debug!(
                "{}: write fault on read only guest address 0x{:016x}",
                self.vmid(),
                gpa.0
            );
            return Err(Error::PermissionDenied);
        }

        let region = binding.region().ok_or(Error::NotFound)?;
        let _bindings = region.lock_shared();
        let extent = binding.extent();
        // The binding may have been trimmed or removed before the region lock was taken.
        if !binding.is_live() || !extent.contains_gfn(gfn) {
            return Err(Error::NotFound);
        }

        let folio = region.acquire_page(extent.gfn_to_index(gfn))?;
        let guard = folio.lock();
        let base_gfn = extent.index_to_gfn(folio.index());
        if let Some((_, Donation::Page { folio: f, .. })) = self.donation_at(base_gfn) {
            if Arc::ptr_eq(&f, &folio) {
                return Ok(());
            }
        }

        let lend = binding.is_lend();
        if lend && folio.is_donated() {
            debug!(
                "{}: folio backing guest address 0x{:016x} owned elsewhere",
                self.vmid(),
                gpa.0
            );
            return Err(Error::Conflict);
        }

        trace!(
            "{}: {} fault at guest address 0x{:016x}",
            self.vmid(),
            if is_write { "write" } else { "read" },
            gpa.0
        );
        self.provide_locked(&folio, &guard, base_gfn, !lend, write)?;
        binding.mark_donated(Range::new(base_gfn, base_gfn + folio.nr_pages() - 1), lend);

        Ok(())
    }
}
