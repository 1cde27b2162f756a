// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use ndarray::prelude::*;
use num_complex::Complex32;

use super::*;

/// A tiny linear congruential generator so that the churn test is
/// reproducible without pulling in a random number crate.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn test_allocator_first_fit_and_split() {
    let mut allocator = SparseSetAllocator::new(1000..2000);
    let a = allocator.allocate(100, 1).unwrap();
    assert_eq!(a, 1000);
    let b = allocator.allocate(10, 64).unwrap();
    // 1100 rounded up to a multiple of 64.
    assert_eq!(b, 1152);
    // The alignment padding remains free.
    assert_eq!(allocator.free_ranges(), &[1100..1152, 1162..2000]);
    let c = allocator.allocate(50, 1).unwrap();
    assert_eq!(c, 1100);
    assert_eq!(allocator.num_live_allocations(), 3);
}

#[test]
fn test_allocator_coalesces_on_free() {
    let mut allocator = SparseSetAllocator::new(0..300);
    let a = allocator.allocate(100, 1).unwrap();
    let b = allocator.allocate(100, 1).unwrap();
    let c = allocator.allocate(100, 1).unwrap();
    assert_eq!(allocator.free_bytes(), 0);

    allocator.deallocate(a).unwrap();
    allocator.deallocate(c).unwrap();
    assert_eq!(allocator.free_ranges(), &[0..100, 200..300]);
    // Neither hole is big enough for 150 bytes.
    assert!(matches!(
        allocator.allocate(150, 1),
        Err(ArenaError::Exhausted {
            requested: 150,
            free: 200,
            largest: 100,
            ..
        })
    ));

    allocator.deallocate(b).unwrap();
    assert_eq!(allocator.free_ranges(), &[0..300]);
    assert_eq!(allocator.allocate(300, 1).unwrap(), 0);
}

#[test]
fn test_allocator_rejects_bad_input() {
    let mut allocator = SparseSetAllocator::new(0..100);
    assert_eq!(
        allocator.allocate(10, 3),
        Err(ArenaError::InvalidAlignment(3))
    );
    assert_eq!(
        allocator.deallocate(42),
        Err(ArenaError::UnknownAllocation(42))
    );
    let a = allocator.allocate(10, 1).unwrap();
    allocator.deallocate(a).unwrap();
    // Double free.
    assert_eq!(
        allocator.deallocate(a),
        Err(ArenaError::UnknownAllocation(a))
    );
}

#[test]
fn test_allocator_churn_never_overlaps() {
    let region = 4096..4096 + 65536;
    let mut allocator = SparseSetAllocator::new(region.clone());
    let mut rng = Lcg(1234);
    let mut live: Vec<(usize, usize)> = vec![];
    let mut live_bytes = 0;

    for _ in 0..5000 {
        let do_free = !live.is_empty() && rng.next() % 3 == 0;
        if do_free {
            let i = rng.next() as usize % live.len();
            let (address, size) = live.swap_remove(i);
            allocator.deallocate(address).unwrap();
            live_bytes -= size;
            continue;
        }

        let size = 1 + rng.next() as usize % 2048;
        let alignment = 1 << (rng.next() % 7);
        match allocator.allocate(size, alignment) {
            Ok(address) => {
                assert!(region.contains(&address));
                assert!(address + size <= region.end);
                assert_eq!(address % alignment, 0);
                for &(other, other_size) in &live {
                    let disjoint = address + size <= other || other + other_size <= address;
                    assert!(disjoint, "{address}+{size} overlaps {other}+{other_size}");
                }
                live.push((address, size));
                live_bytes += size;
            }

            // Exhaustion is allowed only when the request can't possibly fit
            // into the largest hole.
            Err(ArenaError::Exhausted { largest, .. }) => {
                assert!(largest < size + alignment - 1);
            }

            Err(e) => panic!("unexpected error: {e}"),
        }

        assert_eq!(allocator.num_live_allocations(), live.len());
        assert!(allocator.free_bytes() + live_bytes <= region.len());
    }

    for (address, _) in live {
        allocator.deallocate(address).unwrap();
    }
    assert_eq!(allocator.free_ranges(), &[region]);
}

#[test]
fn test_arena_buffers_are_aligned_and_returned_on_drop() {
    let arena = Arena::new(4096).unwrap();
    assert_eq!(arena.size(), 4096);
    assert_eq!(arena.free_bytes(), 4096);

    let a = arena.allocate_zeroed::<Complex32>(10).unwrap();
    let b = arena.allocate_zeroed::<f32>(3).unwrap();
    assert_eq!(a.address() % BUFFER_ALIGNMENT, 0);
    assert_eq!(b.address() % BUFFER_ALIGNMENT, 0);
    assert!(a.address() >= arena.begin());
    assert!(b.address() + b.size_in_bytes() <= arena.begin() + arena.size());
    assert_eq!(arena.num_live_allocations(), 2);
    assert!(a.iter().all(|c| *c == Complex32::default()));

    drop(a);
    drop(b);
    assert_eq!(arena.num_live_allocations(), 0);
    assert_eq!(arena.free_bytes(), 4096);
}

#[test]
fn test_arena_exhaustion() {
    let arena = Arena::new(1024).unwrap();
    let _a = arena.allocate::<u8>(1000).unwrap();
    let result = arena.allocate::<u8>(100);
    assert!(matches!(result, Err(ArenaError::Exhausted { .. })));

    assert_eq!(Arena::new(0).unwrap_err(), ArenaError::ZeroSized);
}

#[test]
fn test_arena_buffer_views() {
    let arena = Arena::new(4096).unwrap();
    let mut buffer = arena.allocate_zeroed::<u32>(24).unwrap();
    {
        let mut view = buffer.view_mut((2, 3, 4)).unwrap();
        view[(1, 2, 3)] = 7;
        view.slice_mut(s![0, .., ..]).fill(1);
    }
    assert_eq!(buffer[23], 7);
    assert_eq!(buffer[..12].iter().sum::<u32>(), 12);

    let view = buffer.view((4, 6)).unwrap();
    assert_eq!(view[(3, 5)], 7);

    // Shapes must match the buffer exactly.
    assert!(buffer.view((5, 5)).is_err());
}

#[test]
fn test_buffer_footprint() {
    assert_eq!(buffer_footprint::<u8>(0), BUFFER_ALIGNMENT);
    assert_eq!(buffer_footprint::<u8>(1), BUFFER_ALIGNMENT);
    assert_eq!(buffer_footprint::<Complex32>(8), BUFFER_ALIGNMENT);
    assert_eq!(buffer_footprint::<Complex32>(9), 2 * BUFFER_ALIGNMENT);

    // A footprint-sized arena always fits the buffer.
    let arena = Arena::new(buffer_footprint::<Complex32>(100)).unwrap();
    assert!(arena.allocate::<Complex32>(100).is_ok());
}
