//! # Backing Memory for Buffer Pools
//!
//! ## Purpose
//!
//! Buffer pools carve their packet buffers out of one anonymous mapping that is
//! created once at startup and released when the pool is dropped. This module owns
//! that mapping and decides whether it can be backed by 2MB huge pages.
//!
//! ## How it works
//!
//! `OwnedMmap::anonymous` rounds the requested size up to the page size in use and
//! calls `libc::mmap` with `MAP_HUGETLB` when huge pages were requested, or when the
//! caller left the decision open and `/proc/meminfo` reports free 2MB pages. The
//! region is pre-faulted with `MAP_POPULATE` so the forwarding loop never takes a page
//! fault on first touch. `Drop` unmaps the region.
//!
//! ## Main components
//!
//! - `OwnedMmap`: owner of a mapped region.
//! - `HugePageInfo`, `get_hugepage_info()`: huge page availability from `/proc/meminfo`.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// An owned anonymous memory mapping, unmapped on drop.
pub struct OwnedMmap {
    ptr: *mut libc::c_void,
    len: usize,
    huge: bool,
}

impl OwnedMmap {
    /// Maps `size` bytes of private anonymous memory.
    ///
    /// `huge_page` forces (`Some(true)`) or forbids (`Some(false)`) huge pages. With
    /// `None` huge pages are used only when `/proc/meminfo` reports enough free 2MB
    /// pages to hold the whole region.
    pub fn anonymous(size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }
        let huge = match huge_page {
            Some(yes) => yes,
            None => match get_hugepage_info() {
                Ok(info) => info.can_hold(size),
                Err(e) => {
                    log::debug!("huge page mapping failed, using regular pages: {e}");
                    false
                }
            },
        };
        let page_size = if huge {
            HUGE_PAGE_SIZE
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let aligned_size = size
            .checked_add(page_size - 1)
            .map(|s| s & !(page_size - 1))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "region size overflow"))?;

        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | libc::MAP_POPULATE
            | if huge {
                libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
            } else {
                0
            };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::other(format!(
                "mmap of {aligned_size} bytes (huge pages: {huge}) failed: {}",
                io::Error::last_os_error()
            )));
        }
        log::debug!("mapped {aligned_size} bytes at {ptr:p}, huge pages: {huge}");
        Ok(OwnedMmap {
            ptr,
            len: aligned_size,
            huge,
        })
    }

    /// Start of the region.
    #[inline]
    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Size of the region in bytes, after page rounding.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region is backed by huge pages.
    pub fn is_huge(&self) -> bool {
        self.huge
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        if self.ptr != libc::MAP_FAILED && !self.ptr.is_null() {
            let res = unsafe { libc::munmap(self.ptr, self.len) };
            if res < 0 {
                log::error!("Failed to unmap memory: {}", io::Error::last_os_error());
            }
        }
    }
}

/// Huge page configuration as reported by `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HugePageInfo {
    pub size_kb: Option<u64>,
    pub total: Option<u64>,
    pub free: Option<u64>,
}

impl HugePageInfo {
    /// True if free 2MB pages can back `size` bytes.
    pub fn can_hold(&self, size: usize) -> bool {
        match (self.free, self.size_kb) {
            (Some(free), Some(2048)) => free as usize * HUGE_PAGE_SIZE >= size,
            _ => false,
        }
    }

    fn parse(lines: impl Iterator<Item = io::Result<String>>) -> io::Result<Self> {
        let mut info = HugePageInfo::default();
        for line in lines {
            let line = line?;
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().trim_end_matches(" kB");
            let slot = match key.trim() {
                "Hugepagesize" => &mut info.size_kb,
                "HugePages_Total" => &mut info.total,
                "HugePages_Free" => &mut info.free,
                _ => continue,
            };
            *slot = Some(value.parse().map_err(io::Error::other)?);
        }
        Ok(info)
    }
}

/// Reads huge page availability from `/proc/meminfo`.
pub fn get_hugepage_info() -> io::Result<HugePageInfo> {
    let file = File::open("/proc/meminfo")?;
    HugePageInfo::parse(BufReader::new(file).lines())
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::{HugePageInfo, OwnedMmap};
    use std::io::BufRead as _;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16314444 kB\n\
                    HugePages_Total:      16\n\
                    HugePages_Free:        4\n\
                    Hugepagesize:       2048 kB\n";
        let info = HugePageInfo::parse(text.as_bytes().lines()).unwrap();
        assert_eq!(info.total, Some(16));
        assert_eq!(info.free, Some(4));
        assert_eq!(info.size_kb, Some(2048));
        assert!(info.can_hold(8 * 1024 * 1024));
        assert!(!info.can_hold(8 * 1024 * 1024 + 1));
    }

    #[test]
    fn test_no_huge_pages_reported() {
        let info = HugePageInfo::parse("MemFree: 100 kB\n".as_bytes().lines()).unwrap();
        assert!(!info.can_hold(1));
    }

    #[test]
    fn test_regular_mapping_is_page_rounded_and_writable() {
        let map = OwnedMmap::anonymous(10_000, Some(false)).unwrap();
        assert!(map.len() >= 10_000);
        assert!(!map.is_huge());
        unsafe {
            *map.as_u8_ptr().add(9_999) = 0xa5;
            assert_eq!(*map.as_u8_ptr().add(9_999), 0xa5);
        }
    }

    #[test]
    fn test_empty_mapping_rejected() {
        assert!(OwnedMmap::anonymous(0, Some(false)).is_err());
    }
}
