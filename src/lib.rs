//! A two-tier, boundary-tag, mmap-backed memory allocator, exposed through
//! the standard C `malloc` family so it can be linked in place of a libc
//! allocator.
//!
//! Small requests are carved out of shared "small" arenas: one mapped
//! region holding a run of boundary-tagged blocks behind an address-ordered
//! free list. Requests too large to make sense in a small arena (or whose
//! alignment would waste too much of one) get their own "big" arena: one
//! mapping, one allocation. See `arena.rs` and `block.rs` for the two
//! layers, and `facade.rs` for the tier-routing, mutex-guarded entry point
//! both tiers are reached through.

mod arena;
mod block;
mod check;
mod facade;
mod page;

use std::ffi::c_void;
use std::ptr::NonNull;

pub use arena::ARENA_MAX;
pub use block::BLOCK_ALIGNMENT;
pub use facade::total_free_size;

macro_rules! trace {
    ($($arg:tt)*) => {
        if cfg!(feature = "debug_trace") {
            eprintln!($($arg)*);
        }
    };
}

fn set_errno(value: libc::c_int) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

fn to_raw(result: Result<Option<NonNull<u8>>, facade::AllocError>) -> *mut c_void {
    match result {
        Ok(Some(ptr)) => ptr.as_ptr() as *mut c_void,
        Ok(None) => std::ptr::null_mut(),
        Err(facade::AllocError::OutOfMemory) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
        Err(facade::AllocError::InvalidAlignment) => {
            set_errno(libc::EINVAL);
            std::ptr::null_mut()
        }
    }
}

/// Allocates at least `size` bytes, aligned to the allocator's natural
/// block alignment.
///
/// # Safety
/// Standard `malloc` contract: the returned pointer, if non-null, must
/// eventually be passed to `free` (or `realloc`) exactly once, and not used
/// after that call.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    trace!("malloc({})", size);
    to_raw(facade::allocate(BLOCK_ALIGNMENT, size))
}

/// Allocates at least `size` bytes aligned to `alignment`, which must be a
/// power of two.
///
/// # Safety
/// See `malloc`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    trace!("aligned_alloc({}, {})", alignment, size);
    to_raw(facade::allocate(alignment, size))
}

/// Alias for `aligned_alloc`, kept for callers still using the older BSD
/// name (spec supplement B.1).
///
/// # Safety
/// See `malloc`.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    aligned_alloc(alignment, size)
}

/// Allocates zeroed storage for `nmemb` elements of `size` bytes each,
/// failing with `ENOMEM` rather than wrapping on overflow.
///
/// # Safety
/// See `malloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    trace!("calloc({}, {})", nmemb, size);

    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            set_errno(libc::ENOMEM);
            return std::ptr::null_mut();
        }
    };

    let ptr = to_raw(facade::allocate(BLOCK_ALIGNMENT, total));
    if !ptr.is_null() {
        // Fresh pages from the page provider are already zero, but a block
        // may be reused from a prior allocation, so zero explicitly.
        std::ptr::write_bytes(ptr as *mut u8, 0, total);
    }
    ptr
}

/// Frees a pointer previously returned by `malloc`/`calloc`/`realloc`/
/// `aligned_alloc`. A null pointer is a no-op.
///
/// # Safety
/// `ptr` must be null or a pointer this allocator handed out that hasn't
/// already been freed.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    trace!("free({:?})", ptr);
    if let Some(ptr) = NonNull::new(ptr as *mut u8) {
        facade::deallocate(ptr);
    }
}

/// Alias for `free`, restored from the original's `__strong_alias` (spec
/// supplement B.2).
///
/// # Safety
/// See `free`.
#[no_mangle]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    free(ptr);
}

/// Resizes an existing allocation, preserving its content up to the lesser
/// of the old and new sizes. `ptr == NULL` behaves like `malloc`; `size ==
/// 0` behaves like `free` and returns `NULL`.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    trace!("realloc({:?}, {})", ptr, size);

    let ptr = match NonNull::new(ptr as *mut u8) {
        None => return malloc(size),
        Some(ptr) => ptr,
    };

    if size == 0 {
        facade::deallocate(ptr);
        return std::ptr::null_mut();
    }

    match facade::reallocate(ptr, size) {
        Ok(new_ptr) => new_ptr.as_ptr() as *mut c_void,
        Err(facade::AllocError::OutOfMemory) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
        Err(facade::AllocError::InvalidAlignment) => {
            unreachable!("realloc never requests a caller-chosen alignment")
        }
    }
}

/// Returns the usable size of a live allocation, which may be larger than
/// what was requested. A null pointer reports 0.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr as *mut u8) {
        None => 0,
        Some(ptr) => facade::usable_size(ptr),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    unsafe fn as_slice<'a>(ptr: *mut c_void, len: usize) -> &'a [u8] {
        std::slice::from_raw_parts(ptr as *const u8, len)
    }

    #[test]
    fn malloc_zero_may_return_null() {
        unsafe {
            let ptr = malloc(0);
            // Either a null or a valid pointer is acceptable; just make
            // sure it can be freed without crashing.
            free(ptr);
        }
    }

    #[test]
    fn s1_calloc_fills_with_zero_then_allows_overwrite() {
        unsafe {
            // Scaled down from the 50_000-block run in the original scenario
            // to keep the test fast; the zero-fill property doesn't depend
            // on the count.
            for &size in &[15usize, 5, 17, 6, 31, 96] {
                for _ in 0..64 {
                    let ptr = calloc(1, size);
                    assert!(!ptr.is_null());
                    assert!(as_slice(ptr, size).iter().all(|&b| b == 0));
                    std::ptr::write_bytes(ptr as *mut u8, 0xff, size);
                    free(ptr);
                }
            }
        }
    }

    #[test]
    fn s2_degenerate_calloc_does_not_crash_and_overflow_returns_null() {
        unsafe {
            free(calloc(0, 0));
            free(calloc(0, u32::MAX as usize));
            free(calloc(u32::MAX as usize, 0));
            free(calloc(0, usize::MAX));
            free(calloc(usize::MAX, 0));

            let overflowing = calloc(usize::MAX, 2);
            assert!(overflowing.is_null());
        }
    }

    #[test]
    fn s6_invalid_alignment_returns_null_and_sets_einval() {
        unsafe {
            set_errno(0);
            let ptr = aligned_alloc(6, 16);
            assert!(ptr.is_null());
            assert_eq!(*libc::__errno_location(), libc::EINVAL);
        }
    }

    #[test]
    fn memalign_and_aligned_alloc_are_interchangeable() {
        unsafe {
            let a = aligned_alloc(4096, 128);
            let b = memalign(4096, 128);
            assert!(!a.is_null() && !b.is_null());
            assert_eq!(a as usize % 4096, 0);
            assert_eq!(b as usize % 4096, 0);
            free(a);
            cfree(b);
        }
    }

    #[test]
    fn realloc_null_behaves_like_malloc_and_zero_behaves_like_free() {
        unsafe {
            let ptr = realloc(std::ptr::null_mut(), 64);
            assert!(!ptr.is_null());
            assert!(malloc_usable_size(ptr) >= 64);

            let freed = realloc(ptr, 0);
            assert!(freed.is_null());
        }
    }

    #[test]
    fn usable_size_of_null_is_zero() {
        unsafe {
            assert_eq!(malloc_usable_size(std::ptr::null_mut()), 0);
        }
    }
}
