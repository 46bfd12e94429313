// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Live-migration dirty-page log: the frontend-provided bitmap plus the
//! per-queue write-combining cache in front of it.

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{fence, AtomicU8, Ordering};

use log::error;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::{Error, Result};

/// Bitmap granularity: one bit per 4 KiB guest page.
pub const LOG_PAGE_SIZE: u64 = 4096;

/// Entries in the per-queue write-combining cache.
pub const LOG_CACHE_NR: usize = 32;

/// The mmap'ed dirty bitmap.
#[derive(Debug)]
pub struct DirtyLog {
    mmap_addr: *mut libc::c_void,
    mmap_len: u64,
    /// First byte of the bitmap proper (mapping base + offset).
    base: u64,
    /// Bitmap length in bytes.
    size: u64,
}

// SAFETY: bits are only ever set, atomically, through `set_page`.
unsafe impl Send for DirtyLog {}
unsafe impl Sync for DirtyLog {}

impl DirtyLog {
    /// Map the log descriptor. The offset/size pair is checked for overflow
    /// and the mapping starts at file offset zero (hugepage descriptors
    /// refuse non-page-aligned offsets), so the offset is applied to the
    /// resulting address instead.
    pub fn map(fd: OwnedFd, size: u64, offset: u64) -> Result<DirtyLog> {
        if offset >= size.wrapping_neg() {
            error!("log offset {offset:#x} and size {size:#x} overflow");
            return Err(Error::MapOverflow { size, offset });
        }
        let len = NonZeroUsize::new((size + offset) as usize)
            .ok_or(Error::ResourceExhausted("zero-length log"))?;
        // SAFETY: mapping a caller-provided descriptor; validated below.
        let mmap_addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        }?;
        Ok(DirtyLog {
            mmap_addr,
            mmap_len: size + offset,
            base: mmap_addr as u64 + offset,
            size,
        })
    }

    /// Mark every page in `[addr, addr + len)` dirty, where `addr` is a
    /// guest-physical address. Ranges past the end of the bitmap are
    /// silently ignored, matching the frontend's expectations during
    /// resize races.
    pub fn write(&self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        if self.size <= (addr + len - 1) / LOG_PAGE_SIZE / 8 {
            return;
        }

        // Guest memory updates must be visible before the log bits.
        fence(Ordering::Release);

        let mut page = addr / LOG_PAGE_SIZE;
        while page * LOG_PAGE_SIZE < addr + len {
            self.set_page(page);
            page += 1;
        }
    }

    fn set_page(&self, page: u64) {
        self.or_byte(page / 8, 1 << (page % 8));
    }

    fn or_byte(&self, byte_offset: u64, bits: u8) {
        debug_assert!(byte_offset < self.size);
        // SAFETY: offset checked against the bitmap length; the mapping
        // lives as long as `self`.
        let byte = unsafe { AtomicU8::from_ptr((self.base + byte_offset) as *mut u8) };
        byte.fetch_or(bits, Ordering::Relaxed);
    }

    /// Read back one bitmap byte; test support.
    #[cfg(test)]
    fn byte(&self, byte_offset: u64) -> u8 {
        // SAFETY: as in `or_byte`.
        unsafe { AtomicU8::from_ptr((self.base + byte_offset) as *mut u8) }
            .load(Ordering::Relaxed)
    }
}

impl Drop for DirtyLog {
    fn drop(&mut self) {
        // SAFETY: address and length come from the successful mmap above.
        if let Err(e) = unsafe { munmap(self.mmap_addr, self.mmap_len as usize) } {
            error!("failed to unmap dirty log: {e}");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LogCacheEntry {
    /// Byte offset within the bitmap.
    offset: u64,
    val: u8,
}

/// Per-queue write-combining cache: coalesces repeated dirtying of the same
/// bitmap byte (the common case for the used ring) and defers the atomics
/// until the queue publishes `used->idx`.
#[derive(Debug, Default)]
pub struct LogCache {
    entries: Vec<LogCacheEntry>,
}

impl LogCache {
    pub fn new() -> Self {
        LogCache {
            entries: Vec::with_capacity(LOG_CACHE_NR),
        }
    }

    /// Mark pages covering `[addr, addr + len)` dirty through the cache.
    pub fn write(&mut self, log: &DirtyLog, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut page = addr / LOG_PAGE_SIZE;
        while page * LOG_PAGE_SIZE < addr + len {
            self.cache_page(log, page);
            page += 1;
        }
    }

    fn cache_page(&mut self, log: &DirtyLog, page: u64) {
        let offset = page / 8;
        let bit = 1u8 << (page % 8);
        if let Some(e) = self.entries.iter_mut().find(|e| e.offset == offset) {
            e.val |= bit;
            return;
        }
        if self.entries.len() == LOG_CACHE_NR {
            self.sync(log);
        }
        self.entries.push(LogCacheEntry { offset, val: bit });
    }

    /// Flush the cache into the shared bitmap. Must run before the queue's
    /// `used->idx` store becomes visible.
    pub fn sync(&mut self, log: &DirtyLog) {
        if self.entries.is_empty() {
            return;
        }
        fence(Ordering::Release);
        for e in self.entries.drain(..) {
            log.or_byte(e.offset, e.val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::anon_region_fd;

    fn test_log(size: u64) -> DirtyLog {
        DirtyLog::map(anon_region_fd(size), size, 0).unwrap()
    }

    #[test]
    fn bits_land_on_the_right_pages() {
        let log = test_log(0x1000);
        log.write(0, 1);
        log.write(0x1000, 0x1000);
        log.write(0x2fff, 2);
        // Pages 0..=3 dirty: 0b1111.
        assert_eq!(log.byte(0), 0x0f);
    }

    #[test]
    fn spanning_write_dirties_every_page() {
        let log = test_log(0x1000);
        log.write(0x0800, 0x2000);
        assert_eq!(log.byte(0), 0x07);
    }

    #[test]
    fn out_of_range_write_ignored() {
        let log = test_log(8);
        // Bitmap of 8 bytes covers 64 pages; write far beyond it.
        log.write(64 * LOG_PAGE_SIZE, 1);
        for i in 0..8 {
            assert_eq!(log.byte(i), 0);
        }
    }

    #[test]
    fn offset_overflow_rejected() {
        let err = DirtyLog::map(anon_region_fd(0x1000), 0x20, 0xffff_ffff_ffff_fff0).unwrap_err();
        assert!(matches!(err, Error::MapOverflow { .. }));
    }

    #[test]
    fn cache_coalesces_and_flushes() {
        let log = test_log(0x1000);
        let mut cache = LogCache::new();
        cache.write(&log, 0, 1);
        cache.write(&log, 0x1000, 1);
        // Nothing visible until the sync barrier.
        assert_eq!(log.byte(0), 0);
        cache.sync(&log);
        assert_eq!(log.byte(0), 0x03);
        // Sync drained the cache.
        cache.sync(&log);
        assert_eq!(log.byte(0), 0x03);
    }

    #[test]
    fn full_cache_self_flushes() {
        let log = test_log(0x1000);
        let mut cache = LogCache::new();
        // Touch more distinct bitmap bytes than the cache holds.
        for i in 0..(LOG_CACHE_NR as u64 + 4) {
            cache.write(&log, i * 8 * LOG_PAGE_SIZE, 1);
        }
        // The overflow forced a flush of the first batch.
        assert_eq!(log.byte(0), 1);
        cache.sync(&log);
        assert_eq!(log.byte((LOG_CACHE_NR as u64 + 3) * 8 / 8), 1);
    }
}
