//! Boundary-tag blocks: the unit of allocation inside a small arena.
//!
//! A block is `[header tag][payload][footer tag]`. The tag is a signed,
//! word-sized integer: positive means free, negative means allocated, and
//! its magnitude is the payload size in bytes. Free blocks additionally
//! store `prev`/`next` free-list links in the first two words of their own
//! payload, so the free list costs nothing beyond the tags themselves.
//!
//! Grounded on `examples/original_source/block.c` and `block.h`.

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;

use static_assertions::const_assert;

pub(crate) const WORD_SIZE: usize = std::mem::size_of::<usize>();
pub const BLOCK_ALIGNMENT: usize = 2 * WORD_SIZE;
pub(crate) const TAG_SIZE: usize = WORD_SIZE;

/// Smallest payload a block can hold: large enough to carry the two
/// free-list link words.
pub(crate) const MIN_PAYLOAD: usize = BLOCK_ALIGNMENT;
pub(crate) const MIN_BLOCK_TOTAL: usize = required_size(MIN_PAYLOAD);

const_assert!(BLOCK_ALIGNMENT.is_power_of_two());
const_assert!(MIN_PAYLOAD >= 2 * WORD_SIZE);

pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Total bytes a block needs (both tags plus an aligned payload).
pub(crate) const fn required_size(payload: usize) -> usize {
    2 * TAG_SIZE + align_up(payload, BLOCK_ALIGNMENT)
}

/// A block, identified by the address of its header tag.
///
/// `Block` is a thin `Copy` handle over a raw pointer; it carries no
/// lifetime and performs no bookkeeping of its own; the arena that owns the
/// underlying memory is responsible for keeping it alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
    header: NonNull<u8>,
}

impl Block {
    /// # Safety
    /// `header` must point at a live, correctly tagged block tag.
    pub(crate) unsafe fn from_header(header: NonNull<u8>) -> Self {
        Block { header }
    }

    /// Recovers the block owning a payload pointer previously handed to a
    /// caller.
    pub(crate) fn from_data_ptr(ptr: NonNull<u8>) -> Self {
        let header = unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(TAG_SIZE)) };
        Block { header }
    }

    pub(crate) fn header_addr(self) -> usize {
        self.header.as_ptr() as usize
    }

    fn header_ptr(self) -> *mut isize {
        self.header.as_ptr() as *mut isize
    }

    pub(crate) fn tag(self) -> isize {
        unsafe { self.header_ptr().read() }
    }

    pub(crate) fn payload_size(self) -> usize {
        self.tag().unsigned_abs()
    }

    pub(crate) fn is_free(self) -> bool {
        self.tag() > 0
    }

    pub(crate) fn is_allocated(self) -> bool {
        self.tag() < 0
    }

    pub(crate) fn total_size(self) -> usize {
        required_size(self.payload_size())
    }

    pub(crate) fn payload_ptr(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.header.as_ptr().add(TAG_SIZE)) }
    }

    fn footer_ptr(self) -> *mut isize {
        unsafe { self.payload_ptr().as_ptr().add(self.payload_size()) as *mut isize }
    }

    /// The tag stored at this block's footer, read back for comparison
    /// against `tag()` by the invariant checker.
    pub(crate) fn footer_tag(self) -> isize {
        unsafe { self.footer_ptr().read() }
    }

    fn write_tag(self, value: isize) {
        unsafe {
            self.header_ptr().write(value);
            self.footer_ptr().write(value);
        }
    }

    pub(crate) fn set_free(self) {
        let size = self.payload_size() as isize;
        self.write_tag(size);
    }

    pub(crate) fn set_allocated(self) {
        let size = self.payload_size() as isize;
        self.write_tag(-size);
    }

    /// Writes a fresh free block's tags at `header`, sized to hold
    /// `payload_size` bytes.
    pub(crate) fn init_free(header: NonNull<u8>, payload_size: usize) -> Block {
        let block = Block { header };
        block.write_tag(payload_size as isize);
        block
    }

    fn prev_footer_ptr(self) -> *mut isize {
        unsafe { self.header.as_ptr().sub(TAG_SIZE) as *mut isize }
    }

    /// The preceding block in memory, or `None` if this is an arena's first
    /// block (guarded by a NUL sentinel tag).
    pub(crate) fn prev(self) -> Option<Block> {
        let footer_ptr = self.prev_footer_ptr();
        let tag = unsafe { footer_ptr.read() };

        if tag == 0 {
            return None;
        }

        let size = tag.unsigned_abs();
        let header = unsafe {
            NonNull::new_unchecked((footer_ptr as *mut u8).sub(TAG_SIZE).sub(size))
        };
        Some(Block { header })
    }

    /// The following block in memory, or `None` if this is an arena's last
    /// block.
    pub(crate) fn next(self) -> Option<Block> {
        let next_header = unsafe { self.header.as_ptr().add(self.total_size()) };
        let tag = unsafe { (next_header as *const isize).read() };

        if tag == 0 {
            return None;
        }

        Some(Block {
            header: unsafe { NonNull::new_unchecked(next_header) },
        })
    }

    fn link_prev_slot(self) -> *mut *mut u8 {
        self.payload_ptr().as_ptr() as *mut *mut u8
    }

    fn link_next_slot(self) -> *mut *mut u8 {
        unsafe { self.payload_ptr().as_ptr().add(WORD_SIZE) as *mut *mut u8 }
    }

    fn get_link_prev(self) -> Option<Block> {
        let raw = unsafe { self.link_prev_slot().read() };
        NonNull::new(raw).map(|header| Block { header })
    }

    fn set_link_prev(self, block: Option<Block>) {
        let raw = block.map_or(std::ptr::null_mut(), |b| b.header.as_ptr());
        unsafe { self.link_prev_slot().write(raw) };
    }

    fn get_link_next(self) -> Option<Block> {
        let raw = unsafe { self.link_next_slot().read() };
        NonNull::new(raw).map(|header| Block { header })
    }

    fn set_link_next(self, block: Option<Block>) {
        let raw = block.map_or(std::ptr::null_mut(), |b| b.header.as_ptr());
        unsafe { self.link_next_slot().write(raw) };
    }
}

/// Address-ordered intrusive free list: one per small arena.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<Block>,
}

pub(crate) struct FreeListIter {
    next: Option<Block>,
}

impl Iterator for FreeListIter {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let current = self.next?;
        self.next = current.get_link_next();
        Some(current)
    }
}

impl FreeList {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<Block> {
        self.head
    }

    pub(crate) fn iter(&self) -> FreeListIter {
        FreeListIter { next: self.head }
    }

    /// Inserts `block`, not currently linked, keeping the list ordered by
    /// address.
    pub(crate) fn insert_ordered(&mut self, block: Block) {
        let mut cursor = match self.head {
            None => {
                block.set_link_prev(None);
                block.set_link_next(None);
                self.head = Some(block);
                return;
            }
            Some(head) => head,
        };

        if block.header_addr() < cursor.header_addr() {
            block.set_link_prev(None);
            block.set_link_next(Some(cursor));
            cursor.set_link_prev(Some(block));
            self.head = Some(block);
            return;
        }

        loop {
            match cursor.get_link_next() {
                Some(next) if next.header_addr() < block.header_addr() => {
                    cursor = next;
                }
                Some(next) => {
                    block.set_link_prev(Some(cursor));
                    block.set_link_next(Some(next));
                    cursor.set_link_next(Some(block));
                    next.set_link_prev(Some(block));
                    return;
                }
                None => {
                    cursor.set_link_next(Some(block));
                    block.set_link_prev(Some(cursor));
                    block.set_link_next(None);
                    return;
                }
            }
        }
    }

    /// Inserts `block` directly after `after`, wherever `after` currently
    /// sits in the list. Used when splitting a block that is already
    /// linked, so the tail lands next to it without a full rescan.
    pub(crate) fn insert_after(&mut self, after: Block, block: Block) {
        let next = after.get_link_next();
        after.set_link_next(Some(block));
        block.set_link_prev(Some(after));
        block.set_link_next(next);
        if let Some(n) = next {
            n.set_link_prev(Some(block));
        }
    }

    fn insert_before(&mut self, before: Block, block: Block) {
        let prev = before.get_link_prev();
        block.set_link_prev(prev);
        block.set_link_next(Some(before));
        before.set_link_prev(Some(block));
        match prev {
            Some(p) => p.set_link_next(Some(block)),
            None => self.head = Some(block),
        }
    }

    pub(crate) fn remove(&mut self, block: Block) {
        let prev = block.get_link_prev();
        let next = block.get_link_next();

        match prev {
            Some(p) => p.set_link_next(next),
            None => self.head = next,
        }
        if let Some(n) = next {
            n.set_link_prev(prev);
        }
    }
}

/// How much room is needed from `align` before any data can start inside
/// `block`'s payload, so that a carved-out allocation's payload lands on an
/// `align`-aligned address.
pub(crate) fn required_padding(block: Block, align: usize) -> usize {
    let data_addr = block.payload_ptr().as_ptr() as usize;
    if data_addr % align == 0 {
        return 0;
    }

    let header = block.header_addr();
    let candidate = align_up(header + MIN_BLOCK_TOTAL + TAG_SIZE, align) - TAG_SIZE;
    candidate - header
}

/// Whether `block` has room for a `payload`-byte allocation aligned to
/// `align`, once any front padding is accounted for.
pub(crate) fn can_fit(block: Block, align: usize, payload: usize) -> bool {
    let total = block.total_size();
    let padding = required_padding(block, align);
    if padding > total {
        return false;
    }
    let remaining = total - padding;
    remaining >= required_size(payload)
}

/// Splits a free block in two: a head of exactly `head_total_bytes` bytes
/// (kept at `free_block`'s address) and a tail covering the remainder.
/// Does not touch any free list; callers link the tail in themselves.
pub(crate) fn split(free_block: Block, head_total_bytes: usize) -> Block {
    debug_assert!(free_block.is_free());
    debug_assert_eq!(head_total_bytes % BLOCK_ALIGNMENT, 0);
    debug_assert!(head_total_bytes > 0 && head_total_bytes < free_block.total_size());

    let total = free_block.total_size();
    let tail_header =
        unsafe { NonNull::new_unchecked(free_block.header_ptr_raw().add(head_total_bytes)) };
    let tail = Block { header: tail_header };

    let head_payload = head_total_bytes - 2 * TAG_SIZE;
    let tail_payload = (total - head_total_bytes) - 2 * TAG_SIZE;

    free_block.write_tag(head_payload as isize);
    tail.write_tag(tail_payload as isize);

    tail
}

impl Block {
    fn header_ptr_raw(self) -> *mut u8 {
        self.header.as_ptr()
    }
}

/// Finds the smallest free block in `free_list` that fits `payload` bytes
/// aligned to `align` (first fit over an address-ordered list).
pub(crate) fn find_free_first_fit(free_list: &FreeList, align: usize, payload: usize) -> Option<Block> {
    free_list.iter().find(|&block| can_fit(block, align, payload))
}

/// Carves an `align`-aligned, `payload`-byte allocation out of `block`,
/// splitting off any front padding and trailing remainder as new free
/// blocks linked into `free_list`. Returns the (still free, still linked)
/// block to allocate from; the caller marks it allocated and unlinks it.
pub(crate) fn extract(free_list: &mut FreeList, block: Block, align: usize, payload: usize) -> Block {
    debug_assert!(can_fit(block, align, payload));

    let total = block.total_size();
    let required = required_size(payload);
    let padding = required_padding(block, align);
    let remaining = total - padding;
    let trailing = remaining - required;

    let mut current = block;
    if padding > 0 {
        let tail = split(current, padding);
        free_list.insert_after(current, tail);
        current = tail;
    }
    if trailing >= MIN_BLOCK_TOTAL {
        let tail = split(current, required);
        free_list.insert_after(current, tail);
    }
    current
}

/// Merges `block` with its immediate successor in memory, preserving
/// `block`'s free/allocated sign. Panics if there is no successor.
pub(crate) fn coalesce_forward(block: Block) -> Block {
    let was_free = block.is_free();
    let next = block.next().expect("coalesce_forward requires a successor block");
    let merged_payload = (block.payload_size() + next.total_size()) as isize;
    block.write_tag(if was_free { merged_payload } else { -merged_payload });
    block
}

/// Frees an allocated block, coalescing with free neighbors and linking
/// the result into `free_list`.
#[requires(block.is_allocated())]
#[ensures(!free_list.is_empty())]
pub(crate) fn deallocate(free_list: &mut FreeList, block: Block) {
    block.set_free();

    let prev_free = block.prev().filter(|p| p.is_free());
    let next_free = block.next().filter(|n| n.is_free());

    if let Some(prev) = prev_free {
        let merged = coalesce_forward(prev);
        if let Some(next) = next_free {
            free_list.remove(next);
            coalesce_forward(merged);
        }
    } else if let Some(next) = next_free {
        free_list.insert_before(next, block);
        free_list.remove(next);
        coalesce_forward(block);
    } else {
        free_list.insert_ordered(block);
    }
}

/// Shrinks an allocated block to `new_payload` bytes, returning a new free
/// tail block if there was enough slack to split one off.
#[requires(block.is_allocated())]
#[requires(new_payload <= block.payload_size())]
pub(crate) fn shrink(block: Block, new_payload: usize) -> Option<Block> {
    let total = block.total_size();
    let required = required_size(new_payload);
    let remaining = total - required;

    if remaining < MIN_BLOCK_TOTAL {
        return None;
    }

    let tail_header = unsafe { NonNull::new_unchecked(block.header_ptr_raw().add(required)) };
    let tail = Block { header: tail_header };

    let head_payload = (required - 2 * TAG_SIZE) as isize;
    let tail_payload = (remaining - 2 * TAG_SIZE) as isize;

    block.write_tag(-head_payload);
    tail.write_tag(-tail_payload);

    Some(tail)
}

/// Attempts to grow an allocated block in place by consuming a free
/// successor. Returns `None` if there is no free successor or it is too
/// small, leaving `block` untouched.
pub(crate) fn expand(free_list: &mut FreeList, block: Block, new_payload: usize) -> Option<Block> {
    debug_assert!(block.is_allocated());

    let next = block.next()?;
    if !next.is_free() {
        return None;
    }

    let combined_total = block.total_size() + next.total_size();
    let required = required_size(new_payload);
    if combined_total < required {
        return None;
    }

    let remaining = combined_total - required;
    let diff = required - block.total_size();

    if remaining < MIN_BLOCK_TOTAL || diff < MIN_BLOCK_TOTAL {
        free_list.remove(next);
        return Some(coalesce_forward(block));
    }

    let tail = split(next, diff);
    free_list.insert_after(next, tail);
    free_list.remove(next);
    Some(coalesce_forward(block))
}
