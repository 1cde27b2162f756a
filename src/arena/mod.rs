// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fixed-size memory arenas and the allocator that carves buffers out of them.
//!
//! All sample, flag and visibility buffers of the pipeline live in a single
//! [`Arena`] that is reserved once at start-up. Buffers are handed out as
//! [`ArenaBuffer`]s, which are typed, bounds-checked handles to a range of the
//! arena; dropping a handle returns its memory to the arena's free list. No
//! raw pointer ever escapes the arena's lifetime, because every buffer keeps
//! the arena alive.
//!
//! Allocation only happens at block boundaries, so a single mutex around the
//! allocator is fine.

mod error;
#[cfg(test)]
mod tests;

pub use error::ArenaError;

use std::{
    alloc::{self, Layout},
    collections::HashMap,
    ops::{Deref, DerefMut, Range},
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytemuck::Pod;
use log::{error, trace};
use ndarray::{ArrayView, ArrayViewMut, Dimension, ShapeError, StrideShape};

use crate::{constants::BUFFER_ALIGNMENT, sparse_set::SparseSet};

/// Round `value` up to the next multiple of `alignment`, which must be a power
/// of two.
fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

/// The number of bytes that a buffer of `len` `T`s occupies in an arena,
/// including the worst-case alignment padding. Use this to budget the size of
/// an arena.
pub fn buffer_footprint<T>(len: usize) -> usize {
    let alignment = BUFFER_ALIGNMENT.max(std::mem::align_of::<T>());
    let bytes = len.saturating_mul(std::mem::size_of::<T>()).max(1);
    align_up(bytes, alignment).unwrap_or(usize::MAX)
}

/// Keeps track of the free and used ranges of addresses within a region.
///
/// The free list is a [`SparseSet`], so its ranges are always sorted and
/// disjoint. Freed ranges are coalesced with their free neighbours, which
/// keeps fragmentation bounded when blocks of identical shapes are allocated
/// and freed over and over.
#[derive(Debug)]
pub struct SparseSetAllocator {
    region: Range<usize>,
    free: SparseSet,
    /// The size of every live allocation, keyed by its address.
    sizes: HashMap<usize, usize>,
}

impl SparseSetAllocator {
    pub fn new(region: Range<usize>) -> SparseSetAllocator {
        SparseSetAllocator {
            free: SparseSet::from_range(region.clone()),
            region,
            sizes: HashMap::new(),
        }
    }

    /// Find the first free range that can hold `size` bytes aligned to
    /// `alignment`, and carve the allocation out of it.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<usize, ArenaError> {
        if !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment(alignment));
        }
        // Zero-sized allocations still need a unique address.
        let size = size.max(1);

        let found = self.free.iter().find_map(|r| {
            let begin = align_up(r.start, alignment)?;
            let end = begin.checked_add(size)?;
            (end <= r.end).then_some(begin..end)
        });
        match found {
            Some(range) => {
                let begin = range.start;
                self.free.exclude(range);
                self.sizes.insert(begin, size);
                Ok(begin)
            }

            None => Err(ArenaError::Exhausted {
                requested: size,
                alignment,
                free: self.free.count(),
                largest: self.free.iter().map(|r| r.len()).max().unwrap_or(0),
                capacity: self.region.len(),
            }),
        }
    }

    /// Return a previous allocation to the free list.
    pub fn deallocate(&mut self, address: usize) -> Result<(), ArenaError> {
        let size = self
            .sizes
            .remove(&address)
            .ok_or(ArenaError::UnknownAllocation(address))?;
        self.free.include(address..address + size);
        Ok(())
    }

    pub fn free_bytes(&self) -> usize {
        self.free.count()
    }

    pub fn free_ranges(&self) -> &[Range<usize>] {
        self.free.ranges()
    }

    pub fn num_live_allocations(&self) -> usize {
        self.sizes.len()
    }
}

/// The memory behind an arena. It is zero-initialised, so reading any `Pod`
/// type out of it is always valid.
struct Region {
    begin: NonNull<u8>,
    layout: Layout,
}

impl Region {
    fn reserve(size: usize) -> Result<Region, ArenaError> {
        if size == 0 {
            return Err(ArenaError::ZeroSized);
        }
        let layout = Layout::from_size_align(size, BUFFER_ALIGNMENT)
            .map_err(|_| ArenaError::OutOfMemory { size })?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let begin = NonNull::new(ptr).ok_or(ArenaError::OutOfMemory { size })?;
        Ok(Region { begin, layout })
    }

    fn addresses(&self) -> Range<usize> {
        let begin = self.begin.as_ptr() as usize;
        begin..begin + self.layout.size()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `begin` came from `alloc_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.begin.as_ptr(), self.layout) }
    }
}

struct ArenaInner {
    region: Region,
    allocator: Mutex<SparseSetAllocator>,
}

// SAFETY: the region is only ever accessed through `ArenaBuffer`s, whose
// address ranges are disjoint (an invariant of the allocator), and the
// allocator itself is behind a mutex.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

/// A contiguous, pre-reserved region of memory from which all hot-path buffers
/// are allocated. Cloning an `Arena` is cheap and yields another handle to the
/// same region.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.size())
            .field("free", &self.free_bytes())
            .finish()
    }
}

impl Arena {
    /// Reserve `size` bytes.
    pub fn new(size: usize) -> Result<Arena, ArenaError> {
        let region = Region::reserve(size)?;
        let allocator = Mutex::new(SparseSetAllocator::new(region.addresses()));
        trace!("Reserved a {size} byte arena");
        Ok(Arena {
            inner: Arc::new(ArenaInner { region, allocator }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.region.layout.size()
    }

    /// The address of the first byte of the arena.
    pub fn begin(&self) -> usize {
        self.inner.region.addresses().start
    }

    pub fn free_bytes(&self) -> usize {
        self.lock().free_bytes()
    }

    pub fn num_live_allocations(&self) -> usize {
        self.lock().num_live_allocations()
    }

    fn lock(&self) -> MutexGuard<'_, SparseSetAllocator> {
        // The allocator's state is updated atomically with respect to panics,
        // so a poisoned lock is still usable.
        self.inner
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a buffer of `len` `T`s. The contents are whatever the previous
    /// user of the memory left behind.
    pub fn allocate<T: Pod>(&self, len: usize) -> Result<ArenaBuffer<T>, ArenaError> {
        self.allocate_aligned(len, BUFFER_ALIGNMENT.max(std::mem::align_of::<T>()))
    }

    /// Allocate a buffer of `len` `T`s, all set to zero.
    pub fn allocate_zeroed<T: Pod>(&self, len: usize) -> Result<ArenaBuffer<T>, ArenaError> {
        let mut buffer = self.allocate(len)?;
        buffer.fill(T::zeroed());
        Ok(buffer)
    }

    /// Allocate a buffer of `len` `T`s whose first element is aligned to
    /// `alignment` bytes.
    pub fn allocate_aligned<T: Pod>(
        &self,
        len: usize,
        alignment: usize,
    ) -> Result<ArenaBuffer<T>, ArenaError> {
        let elem_size = std::mem::size_of::<T>();
        let bytes = len
            .checked_mul(elem_size)
            .ok_or(ArenaError::SizeOverflow { len, elem_size })?;
        let alignment = alignment.max(std::mem::align_of::<T>());
        let address = self.lock().allocate(bytes, alignment)?;
        trace!("Allocated {bytes} bytes at {address:#x}");

        // SAFETY: the allocator only hands out non-null addresses inside the
        // region.
        let ptr = unsafe { NonNull::new_unchecked(address as *mut T) };
        Ok(ArenaBuffer {
            arena: self.clone(),
            ptr,
            len,
        })
    }
}

/// A typed buffer inside an [`Arena`]. The buffer exclusively owns its range
/// of the arena until it is dropped.
pub struct ArenaBuffer<T: Pod> {
    arena: Arena,
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: an `ArenaBuffer` is the only handle to its memory, like a `Box<[T]>`.
unsafe impl<T: Pod + Send> Send for ArenaBuffer<T> {}
unsafe impl<T: Pod + Sync> Sync for ArenaBuffer<T> {}

impl<T: Pod> ArenaBuffer<T> {
    /// The address of the first element. Only useful for diagnostics and
    /// tests; the memory can't be accessed through it.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The number of bytes this buffer covers.
    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// A multi-dimensional view of the buffer. The shape must cover exactly
    /// the buffer's length.
    pub fn view<D, Sh>(&self, shape: Sh) -> Result<ArrayView<T, D>, ShapeError>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        ArrayView::from_shape(shape, &self[..])
    }

    pub fn view_mut<D, Sh>(&mut self, shape: Sh) -> Result<ArrayViewMut<T, D>, ShapeError>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        ArrayViewMut::from_shape(shape, &mut self[..])
    }
}

impl<T: Pod> Deref for ArenaBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `ptr..ptr+len` lies within the arena, is aligned for `T`,
        // is initialised (the region is zeroed and `T` is `Pod`) and isn't
        // aliased by any other buffer.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Pod> DerefMut for ArenaBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Pod> Drop for ArenaBuffer<T> {
    fn drop(&mut self) {
        let address = self.address();
        if let Err(e) = self.arena.lock().deallocate(address) {
            // This can only happen if the allocator's bookkeeping is broken.
            error!("Couldn't return an arena buffer: {e}");
        }
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for ArenaBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .finish()
    }
}
