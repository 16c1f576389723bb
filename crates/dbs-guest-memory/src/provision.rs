// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Direct provisioning of guest memory which isn't backed by a guest memory region.
//!
//! Boot images and firmware blobs are copied into freshly allocated folios and donated page by
//! page. The donations hold the only reference to those folios, so reclaiming them returns the
//! frames to the allocator.

use std::sync::Arc;

use dbs_allocator::Range;
use log::{debug, error};

use crate::page::{Folio, FrameAllocator};
use crate::vm::{Donation, Vm};
use crate::{Error, Result, PAGE_SHIFT, PAGE_SIZE};

impl Vm {
    /// Copy `data` into new pages and hand them to the guest from guest frame `gfn` onwards.
    ///
    /// Returns the number of guest frames provided. On failure the pages provided so far are
    /// reclaimed again.
    ///
    /// # Arguments
    /// * `allocator` - Allocator providing the frames
    /// * `gfn` - First guest frame
    /// * `data` - Contents, the last page is zero padded
    /// * `share` - Whether the host keeps access
    /// * `write` - Whether the guest may write
    pub fn provide_blob(
        &self,
        allocator: &Arc<dyn FrameAllocator>,
        gfn: u64,
        data: &[u8],
        share: bool,
        write: bool,
    ) -> Result<u64> {
        let count = (data.len() as u64 + PAGE_SIZE - 1) >> PAGE_SHIFT;
        let range = Range::with_size(gfn, count).ok_or(Error::InvalidRange)?;
        if !self.layout.read().donated.is_free(&range) {
            return Err(Error::Conflict);
        }

        for (i, chunk) in data.chunks(PAGE_SIZE as usize).enumerate() {
            let i = i as u64;
            let result = Folio::allocate(allocator, i, 0)
                .and_then(|folio| {
                    folio.write(0, chunk)?;
                    Ok(folio)
                })
                .and_then(|folio| self.provide_page(&folio, gfn + i, share, write));
            if let Err(e) = result {
                error!(
                    "{}: failed to provide guest address 0x{:x}: {}",
                    self.vmid(),
                    (gfn + i) << PAGE_SHIFT,
                    e
                );
                self.rollback_blob(gfn, i);
                return Err(e);
            }
        }

        debug!(
            "{}: provided 0x{:x} bytes at guest address 0x{:x}",
            self.vmid(),
            data.len(),
            gfn << PAGE_SHIFT
        );
        Ok(count)
    }

    fn rollback_blob(&self, gfn: u64, count: u64) {
        for i in (0..count).rev() {
            if let Err(e) = self.reclaim_page(gfn + i) {
                error!(
                    "{}: failed to reclaim guest address 0x{:x}: {}",
                    self.vmid(),
                    (gfn + i) << PAGE_SHIFT,
                    e
                );
            }
        }
    }

    /// Take back the pages donated in guest frames `[gfn, gfn + count)`.
    ///
    /// Frames lent or shared as a parcel can't be reclaimed this way. Stops at the first page
    /// failing to be reclaimed.
    pub fn reclaim_blob(&self, gfn: u64, count: u64) -> Result<()> {
        let range = Range::with_size(gfn, count).ok_or(Error::InvalidRange)?;
        let pages: Vec<u64> = {
            let layout = self.layout.read();
            let mut pages = Vec::new();
            for (r, donation) in layout.donated.iter_intersecting(range) {
                match donation {
                    Donation::Page { .. } => pages.push(r.min),
                    Donation::Parcel { .. } => return Err(Error::InvalidArgument),
                }
            }
            pages
        };

        for page in pages {
            self.reclaim_page(page)?;
        }
        debug!(
            "{}: reclaimed guest frames 0x{:x}-0x{:x}",
            self.vmid(),
            range.min,
            range.max
        );

        Ok(())
    }
}
