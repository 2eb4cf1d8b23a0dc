//! Reserved virtual address space for the heap.
//!
//! The whole maximum heap is reserved up front without access rights; regions are
//! committed and uncommitted inside it as the heap grows and shrinks.

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;

    use crate::address::Address;
    use crate::error::{GcError, GcResult};
    use crate::globals::align_up;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        aligned: *mut u8,
    }

    impl Mmap {
        /// Reserves `size` bytes whose usable start is aligned to `alignment`.
        pub fn reserve(size: usize, alignment: usize) -> GcResult<Self> {
            let total = size + alignment;
            unsafe {
                let mem = VirtualAlloc(null_mut(), total, MEM_RESERVE, PAGE_NOACCESS);
                if mem.is_null() {
                    return Err(GcError::ReserveFailed { size: total });
                }
                let mem = mem as *mut u8;
                let aligned = align_up(mem as usize, alignment) as *mut u8;
                Ok(Self {
                    start: mem,
                    size: total,
                    aligned,
                })
            }
        }

        pub fn aligned(&self) -> Address {
            Address::from_ptr(self.aligned)
        }

        pub fn commit(&self, page: Address, size: usize) -> GcResult<()> {
            unsafe {
                let res = VirtualAlloc(page.to_mut_ptr(), size, MEM_COMMIT, PAGE_READWRITE);
                if res.is_null() {
                    return Err(GcError::CommitFailed { addr: page, size });
                }
            }
            Ok(())
        }

        pub fn uncommit(&self, page: Address, size: usize) {
            unsafe {
                VirtualFree(page.to_mut_ptr(), size, MEM_DECOMMIT);
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::address::Address;
    use crate::error::{GcError, GcResult};
    use crate::globals::align_up;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        aligned: *mut u8,
    }

    impl Mmap {
        /// Reserves `size` bytes whose usable start is aligned to `alignment`.
        pub fn reserve(size: usize, alignment: usize) -> GcResult<Self> {
            let total = size + alignment;
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    total as _,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Err(GcError::ReserveFailed { size: total });
                }
                let aligned = align_up(map as usize, alignment) as *mut u8;
                Ok(Self {
                    start: map as *mut u8,
                    size: total,
                    aligned,
                })
            }
        }

        pub fn aligned(&self) -> Address {
            Address::from_ptr(self.aligned)
        }

        /// Makes `[page, page + size)` readable and writable. Fresh pages read as zero.
        pub fn commit(&self, page: Address, size: usize) -> GcResult<()> {
            unsafe {
                if libc::mprotect(
                    page.to_mut_ptr(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                ) != 0
                {
                    return Err(GcError::CommitFailed { addr: page, size });
                }
                libc::madvise(page.to_mut_ptr(), size as _, libc::MADV_WILLNEED);
            }
            Ok(())
        }

        /// Returns the pages to the OS. The range reads as zero if committed again.
        pub fn uncommit(&self, page: Address, size: usize) {
            unsafe {
                libc::madvise(page.to_mut_ptr(), size as _, libc::MADV_DONTNEED);
                libc::mprotect(page.to_mut_ptr(), size as _, libc::PROT_NONE);
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
