//! Debug-only structural invariant checks over blocks and arenas.
//!
//! Mirrors `examples/original_source/invariants.c`: each `assert_*` walks
//! the structure it's named after and panics (via `debug_assert!`, so these
//! disappear in release builds) the moment something doesn't add up.
//! Gated the same way the teacher's `#[invariant]`/`#[ensures]` contracts
//! are: active under `check_contracts` or `test`+`check_contracts_in_tests`.

use crate::arena::{BigArena, SmallArena};
use crate::block::{Block, BLOCK_ALIGNMENT};

fn aligned(addr: usize, align: usize) -> bool {
    addr % align == 0
}

pub(crate) fn assert_allocated_block(block: Block) {
    debug_assert!(block.is_allocated());
    debug_assert!(aligned(block.payload_ptr().as_ptr() as usize, BLOCK_ALIGNMENT));
    debug_assert_eq!(block.tag(), block.footer_tag());
}

pub(crate) fn assert_free_block(block: Block) {
    debug_assert!(block.is_free());
    debug_assert!(aligned(block.payload_ptr().as_ptr() as usize, BLOCK_ALIGNMENT));
    debug_assert_eq!(block.tag(), block.footer_tag());
}

/// Walks a small arena forward then backward from its first/last block,
/// checking every block along the way and that both traversals agree on
/// where the run of blocks begins and ends.
pub(crate) fn assert_small_arena(arena: &SmallArena) {
    let first = arena.first_block();
    debug_assert!(arena.contains(first.header_addr()));

    let mut block = first;
    loop {
        if block.is_free() {
            assert_free_block(block);
        } else {
            assert_allocated_block(block);
        }
        match block.next() {
            Some(next) => block = next,
            None => break,
        }
    }
    let last = block;

    let mut block = last;
    loop {
        if block.is_free() {
            assert_free_block(block);
        } else {
            assert_allocated_block(block);
        }
        match block.prev() {
            Some(prev) => block = prev,
            None => break,
        }
    }
    debug_assert_eq!(block.header_addr(), first.header_addr());
}

/// Additionally checks that a freshly mapped small arena is exactly one
/// free block, already linked as the sole entry of its own free list.
pub(crate) fn assert_small_new_arena(arena: &SmallArena) {
    assert_small_arena(arena);

    let first = arena.first_block();
    debug_assert_eq!(arena.free_list.head().map(Block::header_addr), Some(first.header_addr()));
    debug_assert!(first.is_free());
    debug_assert!(first.next().is_none());
    debug_assert_eq!(arena.free_list.iter().count(), 1);
}

pub(crate) fn assert_big_arena(arena: &BigArena, alignment: usize, size: usize) {
    debug_assert!(aligned(arena.data().as_ptr() as usize, alignment));
    debug_assert!(arena.datasize() >= size);
    debug_assert!(arena.contains(arena.data().as_ptr() as usize));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena::allocate_small_arena;
    use crate::page::default_pages;

    #[test]
    fn fresh_small_arena_passes_new_arena_invariants() {
        let arena = allocate_small_arena(default_pages()).unwrap();
        assert_small_new_arena(&arena);
    }
}
