// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Inflight-descriptor tracking: a shared, descriptor-backed region in which
//! the backend records every descriptor it has seen but not yet completed,
//! so a reconnecting frontend can have them resubmitted in order.

use std::ffi::CStr;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::error;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::memory::align_up;
use crate::{Error, Result};

/// Layout version stamped into a fresh region.
pub const INFLIGHT_VERSION: u16 = 1;

/// Per-queue blocks are aligned to this within the shared region.
pub const INFLIGHT_ALIGNMENT: u64 = 64;

/// Split-ring per-descriptor record.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InflightDescSplit {
    pub inflight: u8,
    pub padding: [u8; 5],
    pub next: u16,
    pub counter: u64,
}

/// Split-ring per-queue header, followed by `desc_num` descriptor records.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InflightInfoSplit {
    pub features: u64,
    pub version: u16,
    pub desc_num: u16,
    pub last_inflight_io: u16,
    pub used_idx: u16,
}

/// Packed-ring per-descriptor record.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InflightDescPacked {
    pub inflight: u8,
    pub padding: u8,
    pub next: u16,
    pub last: u16,
    pub num: u16,
    pub counter: u64,
    pub id: u16,
    pub flags: u16,
    pub len: u32,
    pub addr: u64,
}

/// Packed-ring per-queue header, with the old-copy fields used to roll the
/// shared state forward or back after a crash.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InflightInfoPacked {
    pub features: u64,
    pub version: u16,
    pub desc_num: u16,
    pub free_head: u16,
    pub old_free_head: u16,
    pub used_idx: u16,
    pub old_used_idx: u16,
    pub used_wrap_counter: u8,
    pub old_used_wrap_counter: u8,
    pub padding: [u8; 7],
}

/// Bytes one queue occupies in the region, split layout.
pub fn pervq_size_split(queue_size: u16) -> u64 {
    align_up(
        std::mem::size_of::<InflightInfoSplit>() as u64
            + std::mem::size_of::<InflightDescSplit>() as u64 * queue_size as u64,
        INFLIGHT_ALIGNMENT,
    )
}

/// Bytes one queue occupies in the region, packed layout.
pub fn pervq_size_packed(queue_size: u16) -> u64 {
    align_up(
        std::mem::size_of::<InflightInfoPacked>() as u64
            + std::mem::size_of::<InflightDescPacked>() as u64 * queue_size as u64,
        INFLIGHT_ALIGNMENT,
    )
}

/// The shared inflight mapping. Queues reference slices of it through
/// [`QueueInflight`] handles holding the `Arc`, so replacing the region on a
/// later `SET_INFLIGHT_FD` cannot invalidate a queue's view.
#[derive(Debug)]
pub struct InflightRegion {
    addr: *mut u8,
    size: u64,
    fd: OwnedFd,
}

// SAFETY: shared mapping accessed only through offset-checked volatile
// reads/writes below.
unsafe impl Send for InflightRegion {}
unsafe impl Sync for InflightRegion {}

impl InflightRegion {
    /// Allocate a fresh, zeroed region of `size` bytes backed by a memfd
    /// (falling back to an unlinked temporary file) and map it shared.
    pub fn alloc(size: u64) -> Result<InflightRegion> {
        let name = CStr::from_bytes_with_nul(b"vhost-inflight\0").unwrap();
        let raw = match memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC) {
            Ok(fd) => fd,
            Err(_) => {
                let (fd, path) = nix::unistd::mkstemp("/tmp/memfd-XXXXXX").map_err(|e| {
                    error!("failed to get inflight buffer descriptor: {e}");
                    Error::ResourceExhausted("inflight backing file")
                })?;
                let _ = nix::unistd::unlink(&path);
                fd
            }
        };
        // SAFETY: both branches above returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        nix::unistd::ftruncate(fd.as_raw_fd(), size as i64)
            .map_err(|_| Error::ResourceExhausted("inflight buffer"))?;

        Self::map_fd(fd, size, 0)
    }

    /// Map a frontend-provided region at `offset`.
    pub fn map(fd: OwnedFd, size: u64, offset: u64) -> Result<InflightRegion> {
        Self::map_fd(fd, size, offset)
    }

    fn map_fd(fd: OwnedFd, size: u64, offset: u64) -> Result<InflightRegion> {
        let len =
            NonZeroUsize::new(size as usize).ok_or(Error::ResourceExhausted("empty inflight"))?;
        // SAFETY: mapping a descriptor we either created or were handed.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_raw_fd(),
                offset as libc::off_t,
            )
        }
        .map_err(|e| {
            error!("failed to mmap inflight region: {e}");
            Error::Syscall(e)
        })? as *mut u8;

        Ok(InflightRegion { addr, size, fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn zero(&self) {
        // SAFETY: the whole range belongs to this mapping.
        unsafe { std::ptr::write_bytes(self.addr, 0, self.size as usize) };
    }

    fn check(&self, offset: u64, len: u64) {
        assert!(
            offset + len <= self.size,
            "inflight access outside the shared region"
        );
    }

    pub(crate) fn read<T: Copy>(&self, offset: u64) -> T {
        self.check(offset, std::mem::size_of::<T>() as u64);
        // SAFETY: range checked; the frontend writes this memory too, so
        // reads are volatile.
        unsafe { std::ptr::read_volatile(self.addr.add(offset as usize) as *const T) }
    }

    pub(crate) fn write<T: Copy>(&self, offset: u64, val: T) {
        self.check(offset, std::mem::size_of::<T>() as u64);
        // SAFETY: as in `read`.
        unsafe { std::ptr::write_volatile(self.addr.add(offset as usize) as *mut T, val) }
    }
}

impl Drop for InflightRegion {
    fn drop(&mut self) {
        // SAFETY: address and length come from the successful mmap above.
        if let Err(e) = unsafe { munmap(self.addr as *mut libc::c_void, self.size as usize) } {
            error!("failed to unmap inflight region: {e}");
        }
    }
}

/// One queue's window into the shared region.
#[derive(Debug, Clone)]
pub struct QueueInflight {
    region: Arc<InflightRegion>,
    base: u64,
    pub desc_num: u16,
    pub packed: bool,
}

macro_rules! hdr_field {
    ($get:ident, $set:ident, $hdr:ty, $field:ident, $ty:ty) => {
        pub fn $get(&self) -> $ty {
            self.region
                .read::<$ty>(self.base + std::mem::offset_of!($hdr, $field) as u64)
        }

        pub fn $set(&self, val: $ty) {
            self.region
                .write::<$ty>(self.base + std::mem::offset_of!($hdr, $field) as u64, val)
        }
    };
}

impl QueueInflight {
    pub fn new_split(region: Arc<InflightRegion>, base: u64, desc_num: u16) -> Self {
        region.check(base, pervq_size_split(desc_num));
        QueueInflight {
            region,
            base,
            desc_num,
            packed: false,
        }
    }

    pub fn new_packed(region: Arc<InflightRegion>, base: u64, desc_num: u16) -> Self {
        region.check(base, pervq_size_packed(desc_num));
        QueueInflight {
            region,
            base,
            desc_num,
            packed: true,
        }
    }

    hdr_field!(version, set_version, InflightInfoSplit, version, u16);
    hdr_field!(shared_desc_num, set_shared_desc_num, InflightInfoSplit, desc_num, u16);
    hdr_field!(
        last_inflight_io,
        set_last_inflight_io,
        InflightInfoSplit,
        last_inflight_io,
        u16
    );

    // The split and packed headers share the leading layout through
    // `desc_num`; the fields below are layout-specific.

    pub fn used_idx(&self) -> u16 {
        let off = if self.packed {
            std::mem::offset_of!(InflightInfoPacked, used_idx)
        } else {
            std::mem::offset_of!(InflightInfoSplit, used_idx)
        };
        self.region.read(self.base + off as u64)
    }

    pub fn set_used_idx(&self, val: u16) {
        let off = if self.packed {
            std::mem::offset_of!(InflightInfoPacked, used_idx)
        } else {
            std::mem::offset_of!(InflightInfoSplit, used_idx)
        };
        self.region.write(self.base + off as u64, val)
    }

    hdr_field!(old_used_idx, set_old_used_idx, InflightInfoPacked, old_used_idx, u16);
    hdr_field!(free_head, set_free_head, InflightInfoPacked, free_head, u16);
    hdr_field!(
        old_free_head,
        set_old_free_head,
        InflightInfoPacked,
        old_free_head,
        u16
    );
    hdr_field!(
        used_wrap_counter,
        set_used_wrap_counter,
        InflightInfoPacked,
        used_wrap_counter,
        u8
    );
    hdr_field!(
        old_used_wrap_counter,
        set_old_used_wrap_counter,
        InflightInfoPacked,
        old_used_wrap_counter,
        u8
    );

    fn desc_base(&self, i: u16) -> u64 {
        assert!(i < self.desc_num, "inflight descriptor index out of range");
        if self.packed {
            self.base
                + std::mem::size_of::<InflightInfoPacked>() as u64
                + std::mem::size_of::<InflightDescPacked>() as u64 * i as u64
        } else {
            self.base
                + std::mem::size_of::<InflightInfoSplit>() as u64
                + std::mem::size_of::<InflightDescSplit>() as u64 * i as u64
        }
    }

    pub fn desc_inflight(&self, i: u16) -> u8 {
        self.region.read(self.desc_base(i))
    }

    pub fn set_desc_inflight(&self, i: u16, val: u8) {
        self.region.write(self.desc_base(i), val)
    }

    pub fn desc_counter(&self, i: u16) -> u64 {
        let off = if self.packed {
            std::mem::offset_of!(InflightDescPacked, counter)
        } else {
            std::mem::offset_of!(InflightDescSplit, counter)
        };
        self.region.read(self.desc_base(i) + off as u64)
    }

    pub fn set_desc_counter(&self, i: u16, val: u64) {
        let off = if self.packed {
            std::mem::offset_of!(InflightDescPacked, counter)
        } else {
            std::mem::offset_of!(InflightDescSplit, counter)
        };
        self.region.write(self.desc_base(i) + off as u64, val)
    }

    pub fn set_desc_next(&self, i: u16, val: u16) {
        let off = if self.packed {
            std::mem::offset_of!(InflightDescPacked, next)
        } else {
            std::mem::offset_of!(InflightDescSplit, next)
        };
        self.region.write(self.desc_base(i) + off as u64, val)
    }
}

/// Initialize a fresh region for `num_queues` packed queues: wrap counters
/// start at 1 and the free list chains every descriptor to its successor.
pub fn init_packed_region(region: &Arc<InflightRegion>, num_queues: u16, queue_size: u16) {
    let pervq = pervq_size_packed(queue_size);
    for q in 0..num_queues {
        let view = QueueInflight::new_packed(Arc::clone(region), pervq * q as u64, queue_size);
        view.set_used_wrap_counter(1);
        view.set_old_used_wrap_counter(1);
        for j in 0..queue_size {
            view.set_desc_next(j, j + 1);
        }
    }
}

/// A descriptor to hand back to the datapath after reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubmitDesc {
    pub index: u16,
    pub counter: u64,
}

/// The ordered resubmit list for one queue, newest counter first.
#[derive(Debug, Default)]
pub struct ResubmitInfo {
    pub descs: Vec<ResubmitDesc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(std::mem::size_of::<InflightDescSplit>(), 16);
        assert_eq!(std::mem::size_of::<InflightDescPacked>(), 32);
        assert_eq!(std::mem::size_of::<InflightInfoSplit>(), 16);
        assert_eq!(std::mem::size_of::<InflightInfoPacked>(), 32);
        // Per-queue blocks stay 64-byte aligned.
        assert_eq!(pervq_size_split(256) % INFLIGHT_ALIGNMENT, 0);
        assert_eq!(pervq_size_packed(256) % INFLIGHT_ALIGNMENT, 0);
        assert_eq!(pervq_size_split(256), align_up(16 + 256 * 16, 64));
    }

    #[test]
    fn alloc_zeroed_and_addressable() {
        let region = Arc::new(InflightRegion::alloc(2 * pervq_size_split(128)).unwrap());
        region.zero();
        let q0 = QueueInflight::new_split(Arc::clone(&region), 0, 128);
        let q1 = QueueInflight::new_split(Arc::clone(&region), pervq_size_split(128), 128);

        assert_eq!(q0.version(), 0);
        q0.set_version(INFLIGHT_VERSION);
        q0.set_desc_inflight(3, 1);
        q0.set_desc_counter(3, 42);

        // The second queue's view is untouched.
        assert_eq!(q1.version(), 0);
        assert_eq!(q1.desc_inflight(3), 0);
        assert_eq!(q0.desc_counter(3), 42);
    }

    #[test]
    fn packed_init_chains_descriptors() {
        let region = Arc::new(InflightRegion::alloc(pervq_size_packed(8)).unwrap());
        region.zero();
        init_packed_region(&region, 1, 8);
        let q = QueueInflight::new_packed(Arc::clone(&region), 0, 8);
        assert_eq!(q.used_wrap_counter(), 1);
        assert_eq!(q.old_used_wrap_counter(), 1);
        // next chain is i + 1; verify via the shared counter slot staying 0.
        assert_eq!(q.desc_counter(7), 0);
    }

    #[test]
    fn map_back_the_same_descriptor() {
        let region = InflightRegion::alloc(pervq_size_split(16)).unwrap();
        region.zero();
        let q = QueueInflight::new_split(Arc::new(region), 0, 16);
        q.set_used_idx(7);

        // A second mapping of the same descriptor observes the write.
        let dup = q.region.fd.try_clone().unwrap();
        let remap = InflightRegion::map(dup, pervq_size_split(16), 0).unwrap();
        let view = QueueInflight::new_split(Arc::new(remap), 0, 16);
        assert_eq!(view.used_idx(), 7);
    }
}
