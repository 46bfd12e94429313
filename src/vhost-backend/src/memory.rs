// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Guest memory: the frontend-supplied region table, the derived guest-page
//! array and the address translation primitives built on them.
//!
//! All raw pointer arithmetic on shared mappings lives behind this module.
//! A [`MemoryRegion`] owns its mapping and unmaps on drop; translations
//! return addresses only after validating them against the owning region, so
//! callers never fabricate a pointer from an untranslated value.

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};

use log::{error, info};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;

use crate::message::{VhostUserMemory, VhostUserMemoryRegion};
use crate::{Error, Result};

/// Guest pages are tracked at this granularity.
pub const GUEST_PAGE_SIZE: u64 = 4096;

/// Once the guest-page array reaches this many entries it is kept sorted and
/// looked up by binary search.
pub const GUEST_PAGE_BSEARCH_THRESH: usize = 255;

/// One frontend memory region, mapped into this process.
#[derive(Debug)]
pub struct MemoryRegion {
    pub guest_phys_addr: u64,
    /// The region's base address in the frontend's address space. Ring and
    /// buffer addresses arrive in this space when no IOMMU is negotiated.
    pub guest_user_addr: u64,
    /// The region's base address in this process.
    pub host_user_addr: u64,
    pub size: u64,
    mmap_addr: *mut libc::c_void,
    mmap_size: u64,
    fd: OwnedFd,
}

// SAFETY: the mapping is shared memory valid for the region's lifetime; all
// access goes through offset-checked projections.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// mmap one region. `mmap_offset` is folded into the mapping length and
    /// the resulting host address, the length is aligned up to the
    /// descriptor's block size (hugetlbfs requires it), and the
    /// size/offset pair is checked for overflow first.
    fn map(wire: &VhostUserMemoryRegion, fd: OwnedFd, populate: bool) -> Result<Self> {
        if wire.mmap_offset >= wire.memory_size.wrapping_neg() {
            error!(
                "mmap_offset {:#x} and memory_size {:#x} overflow",
                wire.mmap_offset, wire.memory_size
            );
            return Err(Error::MapOverflow {
                size: wire.memory_size,
                offset: wire.mmap_offset,
            });
        }

        let blksize = fstat(fd.as_raw_fd())?.st_blksize as u64;
        let mmap_size = align_up(wire.memory_size + wire.mmap_offset, blksize);
        if mmap_size == 0 {
            return Err(Error::MapOverflow {
                size: wire.memory_size + wire.mmap_offset,
                offset: blksize,
            });
        }

        let len = NonZeroUsize::new(mmap_size as usize)
            .ok_or(Error::ResourceExhausted("zero-length region"))?;
        let mut flags = MapFlags::MAP_SHARED;
        if populate {
            flags |= MapFlags::MAP_POPULATE;
        }
        // SAFETY: mapping a caller-provided descriptor at a kernel-chosen
        // address; the result is validated below.
        let mmap_addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
                fd.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| {
            error!("region mmap failed: {e}");
            Error::Syscall(e)
        })?;

        Ok(MemoryRegion {
            guest_phys_addr: wire.guest_phys_addr,
            guest_user_addr: wire.userspace_addr,
            host_user_addr: mmap_addr as u64 + wire.mmap_offset,
            size: wire.memory_size,
            mmap_addr,
            mmap_size,
            fd,
        })
    }

    pub fn mmap_addr(&self) -> u64 {
        self.mmap_addr as u64
    }

    pub fn mmap_size(&self) -> u64 {
        self.mmap_size
    }

    fn contains_hva(&self, hva: u64, len: u64) -> bool {
        hva >= self.host_user_addr
            && len <= self.size
            && hva - self.host_user_addr <= self.size - len
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: address and length come from the successful mmap above.
        if let Err(e) = unsafe { munmap(self.mmap_addr, self.mmap_size as usize) } {
            error!("failed to unmap region at {:p}: {e}", self.mmap_addr);
        }
    }
}

/// One page-granular translation record, the unit of GPA lookup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestPage {
    pub guest_phys_addr: u64,
    /// I/O address of the backing page. Without an external IOMMU driver
    /// this is the host virtual address (VA IOVA mode).
    pub host_iova: u64,
    pub host_user_addr: u64,
    pub size: u64,
}

/// The device's view of guest memory: regions plus the page array.
#[derive(Debug, Default)]
pub struct MemoryTable {
    regions: Vec<MemoryRegion>,
    guest_pages: Vec<GuestPage>,
}

impl MemoryTable {
    /// Build the table from a `SET_MEM_TABLE` payload and its descriptors.
    ///
    /// On any region failure the regions mapped so far are unmapped and all
    /// remaining descriptors closed (their `OwnedFd`s drop).
    pub fn map(
        wire: &VhostUserMemory,
        fds: Vec<OwnedFd>,
        populate: bool,
    ) -> Result<MemoryTable> {
        let nregions = wire.nregions as usize;
        let mut table = MemoryTable {
            regions: Vec::with_capacity(nregions),
            guest_pages: Vec::with_capacity(8),
        };

        for (i, fd) in fds.into_iter().enumerate().take(nregions) {
            let region = MemoryRegion::map(&wire.regions[i], fd, populate)?;
            info!(
                "guest memory region {i}: gpa {:#x} qva {:#x} hva {:#x} size {:#x}",
                region.guest_phys_addr, region.guest_user_addr, region.host_user_addr, region.size
            );
            table.add_guest_pages(&region)?;
            table.regions.push(region);
        }

        if table.guest_pages.len() >= GUEST_PAGE_BSEARCH_THRESH {
            table
                .guest_pages
                .sort_unstable_by_key(|p| p.guest_phys_addr);
        }

        Ok(table)
    }

    /// Whether the wire description matches this table entry for entry; the
    /// identical-table reconnect path keys off this.
    pub fn matches(&self, wire: &VhostUserMemory) -> bool {
        if wire.nregions as usize != self.regions.len() {
            return false;
        }
        self.regions.iter().zip(wire.regions.iter()).all(|(r, w)| {
            r.guest_phys_addr == w.guest_phys_addr
                && r.size == w.memory_size
                && r.guest_user_addr == w.userspace_addr
        })
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn guest_pages(&self) -> &[GuestPage] {
        &self.guest_pages
    }

    /// Translate a frontend (QEMU) virtual address, clamping `len` to the
    /// remainder of the containing region.
    pub fn qva_to_vva(&self, qva: u64, len: &mut u64) -> Option<u64> {
        for r in &self.regions {
            if qva >= r.guest_user_addr && qva < r.guest_user_addr + r.size {
                let avail = r.guest_user_addr + r.size - qva;
                if *len > avail {
                    *len = avail;
                }
                return Some(qva - r.guest_user_addr + r.host_user_addr);
            }
        }
        *len = 0;
        None
    }

    /// Translate a guest-physical address covering `size` bytes.
    pub fn gpa_to_hva(&self, gpa: u64, size: u64) -> Option<u64> {
        let page = self.find_page(gpa)?;
        if gpa + size <= page.guest_phys_addr + page.size {
            Some(gpa - page.guest_phys_addr + page.host_user_addr)
        } else {
            None
        }
    }

    /// Reverse translation, needed to resolve the log address under an
    /// IOMMU.
    pub fn hva_to_gpa(&self, hva: u64, size: u64) -> Option<u64> {
        for p in &self.guest_pages {
            if hva >= p.host_user_addr && hva + size <= p.host_user_addr + p.size {
                return Some(hva - p.host_user_addr + p.guest_phys_addr);
            }
        }
        None
    }

    /// Project a host-virtual range into a raw pointer, validating that it
    /// lies entirely within one mapped region.
    pub(crate) fn hva_to_ptr(&self, hva: u64, len: u64) -> Option<*mut u8> {
        self.regions
            .iter()
            .find(|r| r.contains_hva(hva, len))
            .map(|_| hva as *mut u8)
    }

    fn find_page(&self, gpa: u64) -> Option<&GuestPage> {
        if self.guest_pages.len() >= GUEST_PAGE_BSEARCH_THRESH {
            let idx = self
                .guest_pages
                .partition_point(|p| p.guest_phys_addr <= gpa);
            let page = &self.guest_pages[idx.checked_sub(1)?];
            (gpa < page.guest_phys_addr + page.size).then_some(page)
        } else {
            self.guest_pages
                .iter()
                .find(|p| gpa >= p.guest_phys_addr && gpa < p.guest_phys_addr + p.size)
        }
    }

    /// Split `region` at page boundaries, merging runs that are contiguous
    /// in guest-physical, host-virtual and I/O space.
    fn add_guest_pages(&mut self, region: &MemoryRegion) -> Result<()> {
        let mut reg_size = region.size;
        let mut host_user_addr = region.host_user_addr;
        let mut guest_phys_addr = region.guest_phys_addr;

        // Head fragment up to the first page boundary.
        let mut size = GUEST_PAGE_SIZE - (guest_phys_addr & (GUEST_PAGE_SIZE - 1));
        size = size.min(reg_size);
        self.add_one_guest_page(guest_phys_addr, host_user_addr, size);
        host_user_addr += size;
        guest_phys_addr += size;
        reg_size -= size;

        while reg_size > 0 {
            size = GUEST_PAGE_SIZE.min(reg_size);
            self.add_one_guest_page(guest_phys_addr, host_user_addr, size);
            host_user_addr += size;
            guest_phys_addr += size;
            reg_size -= size;
        }
        Ok(())
    }

    fn add_one_guest_page(&mut self, guest_phys_addr: u64, host_user_addr: u64, size: u64) {
        let host_iova = virt_to_iova(host_user_addr);
        if let Some(last) = self.guest_pages.last_mut() {
            if host_iova == last.host_iova + last.size
                && guest_phys_addr == last.guest_phys_addr + last.size
                && host_user_addr == last.host_user_addr + last.size
            {
                last.size += size;
                return;
            }
        }
        self.guest_pages.push(GuestPage {
            guest_phys_addr,
            host_iova,
            host_user_addr,
            size,
        });
    }
}

/// I/O address of a host virtual address at mapping time. Without an IOMMU
/// driver attached the process runs in VA IOVA mode, where the two spaces
/// coincide.
fn virt_to_iova(hva: u64) -> u64 {
    hva
}

pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    v.wrapping_add(align - 1) & !(align - 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::VHOST_MEMORY_MAX_NREGIONS;
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use std::ffi::CStr;
    use std::os::fd::FromRawFd;

    pub(crate) fn anon_region_fd(size: u64) -> OwnedFd {
        let name = CStr::from_bytes_with_nul(b"guest-mem\0").unwrap();
        let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        // SAFETY: memfd_create returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        nix::unistd::ftruncate(fd.as_raw_fd(), size as i64).unwrap();
        fd
    }

    fn one_region_table(gpa: u64, size: u64, qva: u64) -> MemoryTable {
        let mut wire = VhostUserMemory {
            nregions: 1,
            ..Default::default()
        };
        wire.regions[0] = VhostUserMemoryRegion {
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: qva,
            mmap_offset: 0,
        };
        MemoryTable::map(&wire, vec![anon_region_fd(size)], false).unwrap()
    }

    #[test]
    fn map_and_translate() {
        let table = one_region_table(0x10000, 0x40000, 0x7f00_0000_0000);
        assert_eq!(table.regions().len(), 1);

        let mut len = 0x1000;
        let hva = table.qva_to_vva(0x7f00_0000_2000, &mut len).unwrap();
        assert_eq!(len, 0x1000);
        assert_eq!(hva, table.regions()[0].host_user_addr + 0x2000);

        // GPA → HVA agrees with the region-relative offset (property P4).
        let hva2 = table.gpa_to_hva(0x12000, 0x100).unwrap();
        assert_eq!(hva2, table.regions()[0].host_user_addr + 0x2000);

        // Reverse translation round-trips.
        assert_eq!(table.hva_to_gpa(hva2, 0x100), Some(0x12000));
    }

    #[test]
    fn translation_misses() {
        let table = one_region_table(0, 0x10000, 0x7f00_0000_0000);
        let mut len = 8;
        assert!(table.qva_to_vva(0x1234, &mut len).is_none());
        assert_eq!(len, 0);
        assert!(table.gpa_to_hva(0x10000, 1).is_none());
    }

    #[test]
    fn qva_len_clamped_to_region_end() {
        let table = one_region_table(0, 0x10000, 0x7f00_0000_0000);
        let mut len = 0x4000;
        let hva = table.qva_to_vva(0x7f00_0000_f000, &mut len).unwrap();
        assert_eq!(len, 0x1000);
        assert!(table.hva_to_ptr(hva, len).is_some());
        assert!(table.hva_to_ptr(hva, len + 1).is_none());
    }

    #[test]
    fn contiguous_pages_merge() {
        let table = one_region_table(0, 0x100000, 0x7f00_0000_0000);
        // One physically contiguous region collapses into a single page run.
        assert_eq!(table.guest_pages().len(), 1);
        assert_eq!(table.guest_pages()[0].size, 0x100000);
    }

    #[test]
    fn offset_overflow_rejected() {
        let mut wire = VhostUserMemory {
            nregions: 1,
            ..Default::default()
        };
        wire.regions[0] = VhostUserMemoryRegion {
            guest_phys_addr: 0,
            memory_size: 0x20,
            userspace_addr: 0x1000,
            mmap_offset: 0xffff_ffff_ffff_fff0,
        };
        let err = MemoryTable::map(&wire, vec![anon_region_fd(0x1000)], false).unwrap_err();
        assert!(matches!(err, Error::MapOverflow { .. }));
    }

    #[test]
    fn identical_table_detection() {
        let mut wire = VhostUserMemory {
            nregions: 1,
            ..Default::default()
        };
        wire.regions[0] = VhostUserMemoryRegion {
            guest_phys_addr: 0,
            memory_size: 0x10000,
            userspace_addr: 0x7f00_0000_0000,
            mmap_offset: 0,
        };
        let table = MemoryTable::map(&wire, vec![anon_region_fd(0x10000)], false).unwrap();
        assert!(table.matches(&wire));

        let mut changed = wire;
        changed.regions[0].memory_size = 0x20000;
        assert!(!table.matches(&changed));

        let mut more = wire;
        more.nregions = 2;
        assert!(!table.matches(&more));
        assert!(more.nregions as usize <= VHOST_MEMORY_MAX_NREGIONS);
    }
}
