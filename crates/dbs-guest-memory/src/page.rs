// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Physical frames backing guest memory.
//!
//! A [Folio] is one naturally aligned block of `2^order` physical frames. Folios are the unit
//! of allocation, donation and reclaim. The frames go back to their [FrameAllocator] when the
//! last reference to the folio is dropped, so holding an `Arc<Folio>` is enough to keep the
//! memory from being reused.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dbs_allocator::{AllocPolicy, Constraint, IntervalTree};
use log::{error, trace};
use parking_lot::{Mutex, MutexGuard};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::{Error, Result, PAGE_SHIFT, PAGE_SIZE};

static ZERO_PAGE: [u8; PAGE_SIZE as usize] = [0u8; PAGE_SIZE as usize];

/// Source of physical frames and host access to their contents.
pub trait FrameAllocator: Send + Sync {
    /// Allocate `2^order` contiguous frames aligned to their size, returning the first frame
    /// number. The contents are left as the previous user wrote them.
    fn allocate(&self, order: u32) -> Option<u64>;

    /// Return frames obtained from [FrameAllocator::allocate].
    fn free(&self, pfn: u64, order: u32);

    /// Copy frame contents starting at byte `offset` of frame `pfn` into `buf`.
    fn read(&self, pfn: u64, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Copy `buf` into frame contents starting at byte `offset` of frame `pfn`.
    fn write(&self, pfn: u64, offset: u64, buf: &[u8]) -> Result<()>;
}

/// A contiguous range of host physical memory handing out naturally aligned frame blocks.
pub struct PageArena {
    base_pfn: u64,
    nr_pages: u64,
    memory: GuestMemoryMmap,
    frames: Mutex<IntervalTree<u32>>,
}

impl PageArena {
    /// Create an arena of `nr_pages` frames starting at frame `base_pfn`.
    pub fn new(base_pfn: u64, nr_pages: u64) -> Result<Self> {
        let size = nr_pages
            .checked_mul(PAGE_SIZE)
            .filter(|size| *size > 0)
            .ok_or(Error::InvalidRange)?;
        let base = base_pfn
            .checked_mul(PAGE_SIZE)
            .filter(|base| base.checked_add(size).is_some())
            .ok_or(Error::InvalidRange)?;
        let memory = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(base), size as usize)])
            .map_err(|e| {
                error!("failed to map page arena at 0x{:x}: {:?}", base, e);
                Error::ResourceExhausted
            })?;

        Ok(PageArena {
            base_pfn,
            nr_pages,
            memory,
            frames: Mutex::new(IntervalTree::new()),
        })
    }

    /// Get the first frame number of the arena.
    pub fn base_pfn(&self) -> u64 {
        self.base_pfn
    }

    /// Get the number of frames not handed out.
    pub fn nr_free_pages(&self) -> u64 {
        let used: u64 = self
            .frames
            .lock()
            .iter()
            .map(|(range, _)| range.max - range.min + 1)
            .sum();
        self.nr_pages - used
    }

    fn frame_addr(&self, pfn: u64, offset: u64, len: usize) -> Result<GuestAddress> {
        let last = self.base_pfn + self.nr_pages;
        if pfn < self.base_pfn || pfn >= last {
            return Err(Error::InvalidRange);
        }
        let addr = (pfn << PAGE_SHIFT)
            .checked_add(offset)
            .ok_or(Error::InvalidRange)?;
        match addr.checked_add(len as u64) {
            Some(end) if end <= last << PAGE_SHIFT => Ok(GuestAddress(addr)),
            _ => Err(Error::InvalidRange),
        }
    }
}

impl FrameAllocator for PageArena {
    fn allocate(&self, order: u32) -> Option<u64> {
        let nr = 1u64.checked_shl(order)?;
        if nr > self.nr_pages {
            return None;
        }
        let constraint = Constraint {
            size: nr,
            min: self.base_pfn,
            max: self.base_pfn + self.nr_pages - 1,
            align: nr,
            policy: AllocPolicy::FirstMatch,
        };

        let mut frames = self.frames.lock();
        let range = frames.find_free(&constraint)?;
        frames.insert(range, order).ok()?;
        trace!("allocated frames 0x{:x}-0x{:x}", range.min, range.max);
        Some(range.min)
    }

    fn free(&self, pfn: u64, order: u32) {
        let removed = self.frames.lock().remove(pfn);
        match removed {
            Some((range, o)) if range.min == pfn && o == order => {
                trace!("freed frames 0x{:x}-0x{:x}", range.min, range.max)
            }
            _ => panic!("PageArena: freeing frame 0x{:x} which was not allocated", pfn),
        }
    }

    fn read(&self, pfn: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        let addr = self.frame_addr(pfn, offset, buf.len())?;
        self.memory
            .read_slice(buf, addr)
            .map_err(|_| Error::InvalidRange)
    }

    fn write(&self, pfn: u64, offset: u64, buf: &[u8]) -> Result<()> {
        let addr = self.frame_addr(pfn, offset, buf.len())?;
        self.memory
            .write_slice(buf, addr)
            .map_err(|_| Error::InvalidRange)
    }
}

/// A block of `2^order` physical frames holding guest memory contents.
pub struct Folio {
    pfn: u64,
    order: u32,
    index: u64,
    allocator: Arc<dyn FrameAllocator>,
    lock: Mutex<()>,
    donations: AtomicUsize,
    lent: AtomicBool,
}

impl Folio {
    /// Allocate a zero filled folio covering page `index` onwards.
    ///
    /// # Arguments
    /// * `allocator` - Allocator to get the frames from
    /// * `index` - First page index the folio stands for, aligned to `2^order`
    /// * `order` - log2 of the number of frames
    pub fn allocate(
        allocator: &Arc<dyn FrameAllocator>,
        index: u64,
        order: u32,
    ) -> Result<Arc<Folio>> {
        let pfn = allocator.allocate(order).ok_or(Error::ResourceExhausted)?;
        let folio = Folio {
            pfn,
            order,
            index,
            allocator: allocator.clone(),
            lock: Mutex::new(()),
            donations: AtomicUsize::new(0),
            lent: AtomicBool::new(false),
        };
        // Dropping the folio on failure returns its frames.
        for i in 0..folio.nr_pages() {
            allocator
                .write(pfn + i, 0, &ZERO_PAGE)
                .map_err(|_| Error::ResourceExhausted)?;
        }

        Ok(Arc::new(folio))
    }

    /// Get the first physical frame number.
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// Get the physical address of the folio.
    pub fn phys_addr(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }

    /// Get log2 of the number of frames.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Get the number of frames.
    pub fn nr_pages(&self) -> u64 {
        1 << self.order
    }

    /// Get the size in bytes.
    pub fn size(&self) -> u64 {
        self.nr_pages() << PAGE_SHIFT
    }

    /// Get the first page index covered by the folio.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Get the page index following the folio.
    pub fn next_index(&self) -> u64 {
        self.index + self.nr_pages()
    }

    /// Check whether the folio covers page `index`.
    pub fn contains_index(&self, index: u64) -> bool {
        index >= self.index && index < self.next_index()
    }

    /// Lock the folio against concurrent donation state changes.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Check whether the folio is currently owned by a guest.
    pub fn is_donated(&self) -> bool {
        self.donations.load(Ordering::Acquire) > 0
    }

    /// Check whether the folio is currently lent, so the host can't access it.
    pub fn is_lent(&self) -> bool {
        self.lent.load(Ordering::Acquire)
    }

    pub(crate) fn mark_donated(&self, lend: bool) {
        if lend {
            self.lent.store(true, Ordering::Release);
        }
        self.donations.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn clear_donated(&self, lend: bool) {
        let prev = self
            .donations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        assert!(prev.is_ok(), "Folio: frame 0x{:x} was not donated", self.pfn);
        if lend {
            self.lent.store(false, Ordering::Release);
        }
    }

    /// Read folio contents at byte `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;
        self.allocator.read(self.pfn, offset, buf)
    }

    /// Write folio contents at byte `offset`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;
        self.allocator.write(self.pfn, offset, buf)
    }

    fn check_access(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(Error::InvalidRange),
        }
    }
}

impl fmt::Debug for Folio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Folio")
            .field("pfn", &self.pfn)
            .field("order", &self.order)
            .field("index", &self.index)
            .field("donations", &self.donations.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Folio {
    fn drop(&mut self) {
        assert!(
            !self.is_donated(),
            "Folio: releasing frame 0x{:x} still owned by a guest",
            self.pfn
        );
        self.allocator.free(self.pfn, self.order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_allocator(nr_pages: u64) -> (Arc<PageArena>, Arc<dyn FrameAllocator>) {
        let arena = Arc::new(PageArena::new(0x80000, nr_pages).unwrap());
        let allocator: Arc<dyn FrameAllocator> = arena.clone();
        (arena, allocator)
    }

    #[test]
    fn test_arena_allocate() {
        let (arena, allocator) = create_allocator(1024);
        assert_eq!(allocator.allocate(0), Some(0x80000));
        assert_eq!(allocator.allocate(0), Some(0x80001));
        // Huge blocks are naturally aligned.
        assert_eq!(allocator.allocate(9), Some(0x80200));
        assert_eq!(allocator.allocate(9), None);
        assert_eq!(arena.nr_free_pages(), 1024 - 514);

        allocator.free(0x80000, 0);
        assert_eq!(allocator.allocate(0), Some(0x80000));
        assert_eq!(allocator.allocate(11), None);
    }

    #[should_panic]
    #[test]
    fn test_arena_double_free() {
        let (_arena, allocator) = create_allocator(16);
        let pfn = allocator.allocate(0).unwrap();
        allocator.free(pfn, 0);
        allocator.free(pfn, 0);
    }

    #[test]
    fn test_arena_access() {
        let (_arena, allocator) = create_allocator(4);
        allocator.write(0x80001, 8, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        allocator.read(0x80001, 8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        assert_eq!(
            allocator.read(0x80004, 0, &mut buf),
            Err(Error::InvalidRange)
        );
        assert_eq!(
            allocator.write(0x80003, PAGE_SIZE - 1, &[0, 0]),
            Err(Error::InvalidRange)
        );
    }

    #[test]
    fn test_folio_zero_fill() {
        let (arena, allocator) = create_allocator(4);
        let pfn = allocator.allocate(0).unwrap();
        allocator.write(pfn, 0, &[0xa5; 64]).unwrap();
        allocator.free(pfn, 0);

        // The recycled frame is scrubbed before use.
        let folio = Folio::allocate(&allocator, 7, 0).unwrap();
        assert_eq!(folio.pfn(), pfn);
        let mut buf = [0xffu8; 64];
        folio.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(folio.index(), 7);
        assert!(folio.contains_index(7));
        assert!(!folio.contains_index(8));

        drop(folio);
        assert_eq!(arena.nr_free_pages(), 4);
    }

    struct ReadOnlyArena(Arc<PageArena>);

    impl FrameAllocator for ReadOnlyArena {
        fn allocate(&self, order: u32) -> Option<u64> {
            self.0.allocate(order)
        }

        fn free(&self, pfn: u64, order: u32) {
            self.0.free(pfn, order)
        }

        fn read(&self, pfn: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.0.read(pfn, offset, buf)
        }

        fn write(&self, _pfn: u64, _offset: u64, _buf: &[u8]) -> Result<()> {
            Err(Error::InvalidRange)
        }
    }

    #[test]
    fn test_folio_zero_fill_failure() {
        let (arena, _) = create_allocator(4);
        let allocator: Arc<dyn FrameAllocator> = Arc::new(ReadOnlyArena(arena.clone()));

        assert_eq!(
            Folio::allocate(&allocator, 0, 1).err(),
            Some(Error::ResourceExhausted)
        );
        assert_eq!(arena.nr_free_pages(), 4);
    }

    #[test]
    fn test_folio_donation_state() {
        let (_arena, allocator) = create_allocator(4);
        let folio = Folio::allocate(&allocator, 0, 1).unwrap();
        assert_eq!(folio.size(), 2 * PAGE_SIZE);
        assert_eq!(folio.next_index(), 2);
        assert!(!folio.is_donated());

        folio.mark_donated(true);
        assert!(folio.is_donated());
        assert!(folio.is_lent());
        folio.clear_donated(true);
        assert!(!folio.is_donated());
        assert!(!folio.is_lent());

        assert_eq!(
            folio.write(2 * PAGE_SIZE - 1, &[1, 2]),
            Err(Error::InvalidRange)
        );
    }

    #[should_panic]
    #[test]
    fn test_folio_clear_not_donated() {
        let (_arena, allocator) = create_allocator(4);
        let folio = Folio::allocate(&allocator, 0, 0).unwrap();
        folio.clear_donated(false);
    }
}
