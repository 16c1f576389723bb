// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::min;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::binding::Binding;
use crate::page::{Folio, FrameAllocator};
use crate::{Error, Result, HUGE_PAGE_ORDER, HUGE_PAGE_PAGES, HUGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    /// Flags of a guest memory region.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct GuestMemFlags: u64 {
        /// Close the region handle on exec.
        const CLOEXEC = 1 << 0;
        /// Back the region with huge folios where possible.
        const ALLOW_HUGEPAGE = 1 << 1;
    }
}

bitflags! {
    /// Modes of [GuestMemFd::fallocate], with the values of the Linux `FALLOC_FL_*` flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct FallocateMode: u32 {
        /// Keep the region size unchanged.
        const KEEP_SIZE = 0x01;
        /// Release the pages in the range.
        const PUNCH_HOLE = 0x02;
        /// Zero the range, which populates it.
        const ZERO_RANGE = 0x10;
    }
}

/// Request to create a guest memory region.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateMemArgs {
    /// Size of the region in bytes.
    pub size: u64,
    /// Raw [GuestMemFlags].
    pub flags: u64,
}

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct RegionInner {
    id: u64,
    size: u64,
    flags: GuestMemFlags,
    allocator: Arc<dyn FrameAllocator>,
    // Region lock, structural changes take it exclusively.
    pub(crate) bindings: RwLock<Vec<Arc<Binding>>>,
    // Resident folios keyed by their first page index.
    pages: Mutex<BTreeMap<u64, Arc<Folio>>>,
}

impl RegionInner {
    fn nr_pages(&self) -> u64 {
        self.size >> PAGE_SHIFT
    }

    fn lookup(pages: &BTreeMap<u64, Arc<Folio>>, index: u64) -> Option<Arc<Folio>> {
        pages
            .range(..=index)
            .next_back()
            .filter(|(_, folio)| folio.contains_index(index))
            .map(|(_, folio)| folio.clone())
    }

    fn find_page(&self, index: u64) -> Option<Arc<Folio>> {
        Self::lookup(&self.pages.lock(), index)
    }

    fn acquire_page(&self, index: u64) -> Result<Arc<Folio>> {
        if index >= self.nr_pages() {
            return Err(Error::InvalidRange);
        }

        let mut pages = self.pages.lock();
        if let Some(folio) = Self::lookup(&pages, index) {
            return Ok(folio);
        }
        if self.flags.contains(GuestMemFlags::ALLOW_HUGEPAGE) {
            if let Some(folio) = self.allocate_huge(&mut pages, index) {
                return Ok(folio);
            }
        }

        let folio = Folio::allocate(&self.allocator, index, 0)?;
        pages.insert(index, folio.clone());
        Ok(folio)
    }

    // Only used when no page of the aligned block is resident yet.
    fn allocate_huge(
        &self,
        pages: &mut BTreeMap<u64, Arc<Folio>>,
        index: u64,
    ) -> Option<Arc<Folio>> {
        let huge_index = index & !(HUGE_PAGE_PAGES - 1);
        let end = huge_index.checked_add(HUGE_PAGE_PAGES)?;
        if end > self.nr_pages() || pages.range(huge_index..end).next().is_some() {
            return None;
        }

        let folio = Folio::allocate(&self.allocator, huge_index, HUGE_PAGE_ORDER).ok()?;
        pages.insert(huge_index, folio.clone());
        Some(folio)
    }

    fn punch_hole(&self, start: u64, end: u64) -> Result<()> {
        // VM references are dropped only after the region lock is released, since the last
        // reference tears the VM down and that walks the region bindings again.
        let mut vms = Vec::new();
        let mut result = Ok(());

        {
            let bindings = self.bindings.write();
            for binding in bindings.iter() {
                let vm = match binding.vm() {
                    Some(vm) => vm,
                    None => continue,
                };
                if let Err(e) = binding.reclaim_index_range(&vm, start, end) {
                    error!(
                        "{}: failed to reclaim pages 0x{:x}-0x{:x} of region {}: {}",
                        vm.vmid(),
                        start,
                        end,
                        self.id,
                        e
                    );
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                vms.push(vm);
            }

            let mut pages = self.pages.lock();
            let keys: Vec<u64> = pages
                .range(start..end)
                .filter(|(_, folio)| folio.next_index() <= end)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                let donated = pages.get(&key).map_or(false, |folio| folio.is_donated());
                if donated {
                    warn!(
                        "region {}: page 0x{:x} still owned by a guest, keeping it",
                        self.id, key
                    );
                    if result.is_ok() {
                        result = Err(Error::Busy);
                    }
                    continue;
                }
                pages.remove(&key);
            }
        }

        drop(vms);
        debug!("region {}: punched pages 0x{:x}-0x{:x}", self.id, start, end);
        result
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if let Err(e) = self.punch_hole(0, self.nr_pages()) {
            error!("region {}: failed to release memory: {}", self.id, e);
        }

        let bindings = std::mem::take(self.bindings.get_mut());
        for binding in bindings {
            binding.kill();
            if let Some(vm) = binding.vm() {
                vm.remove_binding(&binding);
            }
        }
    }
}

/// A lazily populated guest memory region.
///
/// Pages are allocated and zeroed on first access and stay resident until punched out or
/// until the last handle to the region is dropped. The region may be bound into the guest
/// frame space of one or more VMs, see [GuestMemFd::bind].
#[derive(Clone)]
pub struct GuestMemFd {
    pub(crate) inner: Arc<RegionInner>,
}

impl GuestMemFd {
    /// Create a new guest memory region.
    ///
    /// # Arguments
    /// * `args` - Size and flags of the region
    /// * `allocator` - Allocator providing the backing frames
    pub fn create(args: &CreateMemArgs, allocator: Arc<dyn FrameAllocator>) -> Result<Self> {
        if args.size == 0 || args.size & (PAGE_SIZE - 1) != 0 {
            return Err(Error::InvalidRange);
        }
        let flags = GuestMemFlags::from_bits(args.flags).ok_or(Error::InvalidArgument)?;

        let inner = RegionInner {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            size: args.size,
            flags,
            allocator,
            bindings: RwLock::new(Vec::new()),
            pages: Mutex::new(BTreeMap::new()),
        };
        debug!(
            "region {}: created, size 0x{:x} flags {:?}",
            inner.id, inner.size, flags
        );

        Ok(GuestMemFd {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<RegionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn lock_shared(&self) -> RwLockReadGuard<'_, Vec<Arc<Binding>>> {
        self.inner.bindings.read()
    }

    pub(crate) fn remove_binding(&self, binding: &Arc<Binding>) {
        self.inner
            .bindings
            .write()
            .retain(|b| !Arc::ptr_eq(b, binding));
    }

    /// Get the unique id of the region.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Get the size in pages.
    pub fn nr_pages(&self) -> u64 {
        self.inner.nr_pages()
    }

    /// Get the region flags.
    pub fn flags(&self) -> GuestMemFlags {
        self.inner.flags
    }

    /// Check whether the handle should be closed on exec.
    pub fn is_cloexec(&self) -> bool {
        self.inner.flags.contains(GuestMemFlags::CLOEXEC)
    }

    /// Get the mask of the offset bits which must be clear in binding addresses and sizes.
    pub fn page_mask(&self) -> u64 {
        if self.inner.flags.contains(GuestMemFlags::ALLOW_HUGEPAGE) {
            HUGE_PAGE_SIZE - 1
        } else {
            PAGE_SIZE - 1
        }
    }

    /// Get the number of live bindings of the region.
    pub fn nr_bindings(&self) -> usize {
        self.inner.bindings.read().len()
    }

    /// Get the number of resident pages.
    pub fn nr_resident_pages(&self) -> u64 {
        self.inner
            .pages
            .lock()
            .values()
            .map(|folio| folio.nr_pages())
            .sum()
    }

    /// Get the resident folio covering page `index`, if any.
    pub fn find_page(&self, index: u64) -> Option<Arc<Folio>> {
        self.inner.find_page(index)
    }

    /// Get the folio covering page `index`, allocating a zeroed one on first access.
    ///
    /// With huge pages allowed, a huge folio is allocated when no page of the naturally aligned
    /// huge block is resident and the block lies within the region.
    pub fn acquire_page(&self, index: u64) -> Result<Arc<Folio>> {
        self.inner.acquire_page(index)
    }

    /// Release the pages fully inside `[offset, offset + len)`.
    ///
    /// Pages donated to a guest through a binding are reclaimed first. A page which can't be
    /// reclaimed stays resident and the reclaim error is returned. `len` of `u64::MAX` punches
    /// to the end of the region.
    pub fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        if offset & (PAGE_SIZE - 1) != 0 || (len != std::u64::MAX && len & (PAGE_SIZE - 1) != 0)
        {
            return Err(Error::InvalidRange);
        }

        let start = offset >> PAGE_SHIFT;
        let end = if len == std::u64::MAX {
            self.nr_pages()
        } else {
            let end = offset.checked_add(len).ok_or(Error::InvalidRange)?;
            min(end >> PAGE_SHIFT, self.nr_pages())
        };
        if start >= end {
            return Ok(());
        }

        self.inner.punch_hole(start, end)
    }

    /// Populate every page of `[offset, offset + len)`.
    ///
    /// The walk stops with [Error::Interrupted] as soon as `interrupt` is set, leaving the pages
    /// populated so far resident. Reissuing the request resumes the walk.
    pub fn preallocate(&self, offset: u64, len: u64, interrupt: &AtomicBool) -> Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.size())
            .ok_or(Error::InvalidRange)?;

        let _bindings = self.inner.bindings.read();
        let mut index = offset >> PAGE_SHIFT;
        let end = (end + PAGE_SIZE - 1) >> PAGE_SHIFT;
        while index < end {
            if interrupt.load(Ordering::Acquire) {
                debug!(
                    "region {}: preallocation interrupted at page 0x{:x}",
                    self.id(),
                    index
                );
                return Err(Error::Interrupted);
            }
            let folio = self.inner.acquire_page(index)?;
            index = folio.next_index();
        }

        Ok(())
    }

    /// Punch or populate a range, the region size never changes.
    ///
    /// # Arguments
    /// * `mode` - Raw [FallocateMode], `KEEP_SIZE` is mandatory
    /// * `offset` - Page aligned start of the range
    /// * `len` - Page aligned length of the range
    /// * `interrupt` - Flag cancelling a population walk
    pub fn fallocate(
        &self,
        mode: u32,
        offset: u64,
        len: u64,
        interrupt: &AtomicBool,
    ) -> Result<()> {
        let mode = FallocateMode::from_bits(mode).ok_or(Error::Unsupported)?;
        if !mode.contains(FallocateMode::KEEP_SIZE) {
            return Err(Error::Unsupported);
        }
        if offset & (PAGE_SIZE - 1) != 0 || len & (PAGE_SIZE - 1) != 0 {
            return Err(Error::InvalidRange);
        }

        if mode.contains(FallocateMode::PUNCH_HOLE) {
            self.punch_hole(offset, len)
        } else {
            self.preallocate(offset, len, interrupt)
        }
    }

    /// Read region contents at byte `offset` from the host.
    ///
    /// Pages never populated read as zeros. Pages lent to a guest can't be accessed.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;

        let _bindings = self.inner.bindings.read();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let chunk = min((PAGE_SIZE - (pos & (PAGE_SIZE - 1))) as usize, buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            match self.inner.find_page(pos >> PAGE_SHIFT) {
                Some(folio) => {
                    let _guard = folio.lock();
                    if folio.is_lent() {
                        return Err(Error::PermissionDenied);
                    }
                    folio.read(pos - (folio.index() << PAGE_SHIFT), dst)?;
                }
                None => dst.iter_mut().for_each(|b| *b = 0),
            }
            done += chunk;
        }

        Ok(())
    }

    /// Write region contents at byte `offset` from the host, populating pages as needed.
    ///
    /// Pages lent to a guest can't be accessed.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;

        let _bindings = self.inner.bindings.read();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let chunk = min((PAGE_SIZE - (pos & (PAGE_SIZE - 1))) as usize, buf.len() - done);
            let folio = self.inner.acquire_page(pos >> PAGE_SHIFT)?;
            let _guard = folio.lock();
            if folio.is_lent() {
                return Err(Error::PermissionDenied);
            }
            folio.write(
                pos - (folio.index() << PAGE_SHIFT),
                &buf[done..done + chunk],
            )?;
            done += chunk;
        }

        Ok(())
    }

    fn check_access(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(Error::InvalidRange),
        }
    }
}

impl fmt::Debug for GuestMemFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMemFd")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("flags", &self.inner.flags)
            .finish()
    }
}
