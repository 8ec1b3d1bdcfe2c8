//! Anonymous page mapping, abstracted behind a trait so tests can swap in a
//! fake provider the way the teacher's `Mapper` trait (`mapper.rs`) does.

use std::ffi::c_void;
use std::ptr::NonNull;

use lazy_static::lazy_static;

/// A source of page-aligned anonymous memory.
///
/// All arena creation goes through this trait instead of calling `mmap`
/// directly, so tests can plug in a provider backed by a smaller page size
/// without mapping real memory.
pub trait PageProvider: Sync {
    /// The page size this provider maps in multiples of.
    fn page_size(&self) -> usize;

    /// Maps `n_bytes` (already a multiple of `page_size()`) of fresh,
    /// zero-filled, anonymous memory.
    fn map_pages(&self, n_bytes: usize) -> Result<NonNull<c_void>, i32>;

    /// Releases a region previously returned by `map_pages`.
    ///
    /// # Safety
    /// `base`/`n_bytes` must exactly match a still-live mapping from this
    /// same provider.
    unsafe fn unmap_pages(&self, base: NonNull<c_void>, n_bytes: usize) -> Result<(), i32>;
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

#[derive(Debug, Default)]
struct LibcPages;

impl PageProvider for LibcPages {
    fn page_size(&self) -> usize {
        lazy_static! {
            static ref PAGE_SIZE: usize =
                unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        }

        *PAGE_SIZE
    }

    fn map_pages(&self, n_bytes: usize) -> Result<NonNull<c_void>, i32> {
        debug_assert!(n_bytes > 0);
        debug_assert_eq!(n_bytes % self.page_size(), 0);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                n_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            Err(last_errno())
        } else {
            Ok(NonNull::new(ptr).expect("mmap returned a non-null pointer on success"))
        }
    }

    unsafe fn unmap_pages(&self, base: NonNull<c_void>, n_bytes: usize) -> Result<(), i32> {
        if libc::munmap(base.as_ptr(), n_bytes) == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }
}

lazy_static! {
    static ref DEFAULT_PAGES: LibcPages = LibcPages::default();
}

/// Returns the page provider every arena is mapped through unless a test
/// substitutes one directly.
pub(crate) fn default_pages() -> &'static dyn PageProvider {
    &*DEFAULT_PAGES
}

/// Rounds `n` up to the next multiple of `provider`'s page size.
pub(crate) fn page_align(provider: &dyn PageProvider, n: usize) -> usize {
    let page_size = provider.page_size();
    let rem = n % page_size;

    if rem == 0 {
        n
    } else {
        n + (page_size - rem)
    }
}
