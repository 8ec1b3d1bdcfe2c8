//! The allocator's single entry point: one global mutex guarding the small-
//! and big-arena lists, and tier routing on top of `arena.rs`/`block.rs`.
//!
//! Grounded on `examples/original_source/malloc.c`, with the
//! lazy-static-plus-`Mutex` global-state pattern the teacher crate uses for
//! `CLASSES` (`src/class.rs`) and `get_default_rack` (`src/rack.rs`).

use std::ptr::NonNull;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::arena::{self, BigArena, Owner, SmallArena, Tier};
use crate::block::{self, Block, BLOCK_ALIGNMENT, MIN_PAYLOAD};
use crate::page;

/// Why a request could not be satisfied; the public entry points in
/// `lib.rs` translate this into a null pointer plus an errno value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
    InvalidAlignment,
}

struct State {
    small: Vec<Box<SmallArena>>,
    big: Vec<Box<BigArena>>,
}

lazy_static! {
    static ref STATE: Mutex<State> = Mutex::new(State {
        small: Vec::new(),
        big: Vec::new(),
    });
}

fn is_valid_alignment(align: usize) -> bool {
    align > 0 && align.is_power_of_two() && align % std::mem::size_of::<*const u8>() == 0
}

/// Allocates `size` bytes aligned to `align`.
///
/// `align` must be a power of two that is a multiple of the platform
/// pointer size (the `memalign`/`aligned_alloc` contract); anything else is
/// `InvalidAlignment`. A `size` of zero returns `Ok(None)`, matching
/// `malloc(0)`'s implementation-defined "may return NULL" option, the one
/// the original takes.
pub(crate) fn allocate(align: usize, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    if !is_valid_alignment(align) {
        return Err(AllocError::InvalidAlignment);
    }
    if size == 0 {
        return Ok(None);
    }

    // The original widens any caller alignment up to the block's own
    // natural alignment before routing to a tier.
    let align = align.max(BLOCK_ALIGNMENT);

    let mut state = STATE.lock().unwrap();
    match arena::tier_for(align, size) {
        Tier::Small => {
            let block = arena::small_allocate(page::default_pages(), &mut state.small, align, size)
                .map_err(|_| AllocError::OutOfMemory)?;
            Ok(Some(block.payload_ptr()))
        }
        Tier::Big => {
            let arena = arena::allocate_big_arena(page::default_pages(), align, size)
                .map_err(|_| AllocError::OutOfMemory)?;
            let data = arena.data();
            state.big.insert(0, arena);
            Ok(Some(data))
        }
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("arenamalloc: {message}, aborting");
    std::process::abort();
}

fn owner_of(state: &State, ptr: NonNull<u8>) -> Owner {
    arena::find_owner(&state.small, &state.big, ptr.as_ptr() as usize)
        .unwrap_or_else(|| fatal("free/realloc/usable_size called with a pointer from no known arena"))
}

/// Frees a pointer previously returned by `allocate`. A caller pointer that
/// doesn't belong to any tracked arena is corrupted caller state, which is
/// fatal rather than recoverable (matches `malloc.c`'s `exit(EXIT_FAILURE)`
/// on a failed `arena_validate_ptr`).
pub(crate) fn deallocate(ptr: NonNull<u8>) {
    let mut state = STATE.lock().unwrap();
    match owner_of(&state, ptr) {
        Owner::Small(arena) => {
            let block = Block::from_data_ptr(ptr);
            let arena_ref = unsafe { &mut *arena.as_ptr() };
            block::deallocate(&mut arena_ref.free_list, block);
        }
        Owner::Big(arena) => {
            arena::deallocate_big_arena(page::default_pages(), &mut state.big, arena);
        }
    }
}

/// Reallocates `ptr` to hold `size` bytes, preserving the lesser of the old
/// and new sizes worth of content. Never preserves a custom alignment from
/// the original allocation, matching the standard `realloc` contract and
/// the original's own `arena_small_realloc`/`arena_big_realloc`, neither of
/// which take an alignment parameter.
pub(crate) fn reallocate(ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
    let mut state = STATE.lock().unwrap();

    match owner_of(&state, ptr) {
        Owner::Big(arena) => {
            arena::big_realloc(page::default_pages(), arena, size)
                .map_err(|_| AllocError::OutOfMemory)?;
            Ok(unsafe { &*arena.as_ptr() }.data())
        }
        Owner::Small(arena) => {
            let block = Block::from_data_ptr(ptr);
            // The original clamps the small-tier request up to the
            // minimum block payload before picking a tier.
            let clamped_size = size.max(MIN_PAYLOAD);

            if arena::tier_for(BLOCK_ALIGNMENT, clamped_size) == Tier::Big {
                let fresh = arena::allocate_big_arena(page::default_pages(), BLOCK_ALIGNMENT, clamped_size)
                    .map_err(|_| AllocError::OutOfMemory)?;
                let data = fresh.data();
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.as_ptr(), data.as_ptr(), block.payload_size());
                }
                state.big.insert(0, fresh);
                let arena_ref = unsafe { &mut *arena.as_ptr() };
                block::deallocate(&mut arena_ref.free_list, block);
                return Ok(data);
            }

            let new_block = arena::small_realloc(
                page::default_pages(),
                &mut state.small,
                arena,
                block,
                clamped_size,
            )
            .map_err(|_| AllocError::OutOfMemory)?;
            Ok(new_block.payload_ptr())
        }
    }
}

/// The usable payload size of a live allocation (spec Open Question #5: the
/// small-tier tag is signed, so this always reports its absolute value).
pub(crate) fn usable_size(ptr: NonNull<u8>) -> usize {
    let state = STATE.lock().unwrap();
    match owner_of(&state, ptr) {
        Owner::Small(_) => Block::from_data_ptr(ptr).payload_size(),
        Owner::Big(arena) => unsafe { &*arena.as_ptr() }.datasize(),
    }
}

/// Sum of every free byte across every small arena; an introspection
/// helper with no direct spec operation, carried over from the original's
/// `arenas_total_free_size` (spec supplement B.4).
pub fn total_free_size() -> usize {
    let state = STATE.lock().unwrap();
    arena::total_free_size(&state.small)
}

#[cfg(test)]
mod test {
    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;

    fn fresh_ptr(size: usize) -> NonNull<u8> {
        allocate(BLOCK_ALIGNMENT, size).unwrap().unwrap()
    }

    #[test]
    fn allocate_zero_returns_none() {
        assert_eq!(allocate(BLOCK_ALIGNMENT, 0).unwrap(), None);
    }

    #[test]
    fn allocate_rejects_non_power_of_two_alignment() {
        assert_eq!(allocate(3, 16), Err(AllocError::InvalidAlignment));
    }

    #[test]
    fn round_trip_small_allocation() {
        let ptr = fresh_ptr(128);
        assert!(usable_size(ptr) >= 128);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x42, 128);
        }
        deallocate(ptr);
    }

    #[test]
    fn realloc_grow_preserves_bytes() {
        let ptr = fresh_ptr(64);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x7A, 64);
        }
        let grown = reallocate(ptr, 4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0x7A));
        deallocate(grown);
    }

    #[test]
    fn allocating_more_than_arena_max_uses_big_tier_and_is_freeable() {
        let ptr = fresh_ptr(crate::arena::ARENA_MAX * 4);
        assert!(usable_size(ptr) >= crate::arena::ARENA_MAX * 4);
        deallocate(ptr);
    }

    #[test]
    fn s4_large_alignment_request_is_satisfied_and_leaves_arena_intact() {
        let ptr = allocate(4096, 32).unwrap().unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        assert!(usable_size(ptr) >= 32);
        deallocate(ptr);

        let state = STATE.lock().unwrap();
        match arena::find_owner(&state.small, &state.big, ptr.as_ptr() as usize) {
            Some(Owner::Small(arena)) => {
                crate::check::assert_small_arena(unsafe { arena.as_ref() })
            }
            Some(Owner::Big(_)) | None => {}
        }
    }

    #[test]
    fn s5_realloc_across_tiers_preserves_bytes_both_directions() {
        let ptr = fresh_ptr(64);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 64);
        }

        let big = reallocate(ptr, crate::arena::ARENA_MAX * 2).unwrap();
        assert!(usable_size(big) >= crate::arena::ARENA_MAX * 2);
        let grown = unsafe { std::slice::from_raw_parts(big.as_ptr(), 64) };
        assert!(grown.iter().all(|&b| b == 0x5A));

        let back = reallocate(big, 64).unwrap();
        assert!(usable_size(back) >= 64);
        let shrunk = unsafe { std::slice::from_raw_parts(back.as_ptr(), 64) };
        assert!(shrunk.iter().all(|&b| b == 0x5A));

        deallocate(back);
    }

    proptest! {
        #[test]
        fn prop_alloc_respects_alignment_and_reports_usable_size(
            align_shift in 0u32..6,
            size in 1usize..8192,
        ) {
            let align = BLOCK_ALIGNMENT << align_shift;
            let ptr = allocate(align, size).unwrap().unwrap();
            prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
            prop_assert!(usable_size(ptr) >= size);
            deallocate(ptr);
        }

        #[test]
        fn prop_realloc_preserves_shared_prefix(
            old_size in 1usize..4096,
            new_size in 1usize..4096,
            fill in any::<u8>(),
        ) {
            let ptr = fresh_ptr(old_size);
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), fill, old_size); }

            let resized = reallocate(ptr, new_size).unwrap();
            let preserved = old_size.min(new_size);
            let bytes = unsafe { std::slice::from_raw_parts(resized.as_ptr(), preserved) };
            prop_assert!(bytes.iter().all(|&b| b == fill));
            deallocate(resized);
        }

        #[test]
        fn prop_random_alloc_free_sequence_keeps_small_arenas_structurally_sound(
            ops in vec((any::<bool>(), 1usize..512), 1..64)
        ) {
            let mut live: Vec<NonNull<u8>> = Vec::new();
            for (prefer_alloc, size) in ops {
                if prefer_alloc || live.is_empty() {
                    if let Ok(Some(ptr)) = allocate(BLOCK_ALIGNMENT, size) {
                        live.push(ptr);
                    }
                } else {
                    let idx = size % live.len();
                    deallocate(live.remove(idx));
                }
            }
            for ptr in live.drain(..) {
                deallocate(ptr);
            }

            let state = STATE.lock().unwrap();
            for arena in state.small.iter() {
                crate::check::assert_small_arena(arena);
            }
        }
    }
}
