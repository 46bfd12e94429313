// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Per-virtqueue state: ring addresses and their translated mappings, the
//! eventfd triple, enable/ready flags, shadow buffers, and the transitions
//! driven by the dispatcher (address, kick, stop).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use virtio_bindings::virtio_ring::{vring_avail, vring_desc, vring_used, vring_used_elem};

use crate::dirty_log::LogCache;
use crate::features::{has_iommu, ring_is_packed, ProtocolFeatures};
use crate::inflight::{QueueInflight, ResubmitDesc, ResubmitInfo, INFLIGHT_VERSION};
use crate::iotlb::IotlbCache;
use crate::memory::MemoryTable;
use crate::message::{VhostUserVringAddr, VHOST_ACCESS_RW, VHOST_VRING_F_LOG};
use crate::vduse::ReconnectVringHandle;

/// Per-device cap on vring indices; anything at or above is malformed.
pub const VHOST_MAX_VRING: u32 = 0x100;

/// Queue sizes above this are rejected (virtio 1.x maximum).
pub const VHOST_MAX_VRING_SIZE: u32 = 32768;

const PACKED_DESC_SIZE: u64 = 16;
const PACKED_EVENT_SIZE: u64 = 4;

/// `flags`/`idx` prefix shared by the split avail and used rings.
const RING_IDX_OFFSET: u64 = 2;

const VRING_USED_F_NO_NOTIFY: u16 = 1;
const VRING_EVENT_F_ENABLE: u16 = 0;
const VRING_EVENT_F_DISABLE: u16 = 1;

/// An eventfd slot: distinguishes "never configured" from "frontend sent
/// the no-descriptor marker", which matters for the readiness predicate.
#[derive(Debug, Default)]
pub enum VringFd {
    /// Nothing received for this slot yet; the queue cannot become ready.
    #[default]
    Uninitialized,
    /// Frontend explicitly declared the slot descriptor-less.
    Disabled,
    Fd(OwnedFd),
}

impl VringFd {
    pub fn is_initialized(&self) -> bool {
        !matches!(self, VringFd::Uninitialized)
    }

    pub fn as_raw(&self) -> Option<RawFd> {
        match self {
            VringFd::Fd(fd) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }
}

/// Translated ring mappings, host-virtual.
#[derive(Debug, Clone, Copy)]
pub enum Rings {
    Split { desc: u64, avail: u64, used: u64 },
    Packed {
        desc: u64,
        driver_event: u64,
        device_event: u64,
    },
}

/// One entry of the deferred-copy batch the datapath fills per burst.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchCopyElem {
    pub dst: u64,
    pub src: u64,
    pub len: u32,
    pub log_addr: u64,
}

/// Shadow used-ring buffer matching the negotiated layout.
#[derive(Debug, Default)]
pub enum ShadowUsed {
    #[default]
    None,
    Split(Vec<vring_used_elem>),
    Packed(Vec<UsedElemPacked>),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UsedElemPacked {
    pub id: u16,
    pub flags: u16,
    pub len: u32,
    pub count: u32,
}

/// The mutable queue record; lives behind [`Vring::state`], the queue's
/// access lock.
#[derive(Debug, Default)]
pub struct VringState {
    pub index: u32,
    pub size: u32,
    pub ring_addrs: VhostUserVringAddr,
    pub rings: Option<Rings>,
    /// Ring translation is current; cleared by invalidation and memory
    /// table replacement.
    pub access_ok: bool,
    pub last_avail_idx: u16,
    pub last_used_idx: u16,
    pub avail_wrap_counter: bool,
    pub used_wrap_counter: bool,
    pub kickfd: VringFd,
    pub callfd: VringFd,
    pub errfd: VringFd,
    pub enabled: bool,
    pub ready: bool,
    /// Deferred guest-notification intent, applied once rings translate.
    pub notif_enable: Option<bool>,
    pub log_guest_addr: u64,
    pub numa_node: Option<u32>,
    pub shadow_used: ShadowUsed,
    pub batch_copy: Vec<BatchCopyElem>,
    pub log_cache: Option<LogCache>,
    pub inflight: Option<QueueInflight>,
    pub resubmit: Option<ResubmitInfo>,
    /// Monotonic inflight counter source, restored from the resubmit scan.
    pub global_counter: u64,
    pub signalled_used_valid: bool,
    /// Packets the datapath still owns in async-copy mode; a queue with a
    /// non-zero count cannot be disabled.
    pub async_inflight_packets: u32,
    /// Keeps the mappings behind [`Self::rings`] alive.
    pub mem: Option<Arc<MemoryTable>>,
    /// VDUSE only: this queue's slot in the persistent reconnect log.
    pub reconnect: Option<ReconnectVringHandle>,
}

impl VringState {
    pub fn new(index: u32) -> Self {
        VringState {
            index,
            ..Default::default()
        }
    }

    /// Forget the translated mappings. The raw addresses in `ring_addrs`
    /// survive so a later kick can re-translate.
    pub fn invalidate(&mut self) {
        self.rings = None;
        self.access_ok = false;
        self.mem = None;
    }

    /// The per-queue readiness predicate (invariant: rings translated, both
    /// notification slots configured, queue enabled).
    pub fn is_ready(&self) -> bool {
        self.rings.is_some()
            && self.access_ok
            && self.kickfd.is_initialized()
            && self.callfd.is_initialized()
            && self.enabled
    }

    /// `GET_VRING_BASE` teardown: close the notification descriptors and
    /// drop the shadow buffers. The `ready` flag is left for the
    /// dispatcher's readiness walk, which reports the edge downstream.
    pub fn stop(&mut self) {
        self.kickfd = VringFd::Uninitialized;
        self.callfd = VringFd::Uninitialized;
        self.signalled_used_valid = false;
        self.shadow_used = ShadowUsed::None;
        self.batch_copy = Vec::new();
        self.log_cache = None;
    }

    /// The `GET_VRING_BASE` reply value: the last available index, with the
    /// wrap counter folded into bit 15 for packed rings.
    pub fn base_value(&self, packed: bool) -> u32 {
        if packed {
            (self.last_avail_idx & 0x7fff) as u32 | ((self.avail_wrap_counter as u32) << 15)
        } else {
            self.last_avail_idx as u32
        }
    }

    /// Apply `SET_VRING_BASE`. For packed rings the used index mirrors the
    /// avail one: processing was stopped when the frontend sampled it.
    pub fn set_base(&mut self, num: u32, packed: bool) {
        if packed {
            self.last_avail_idx = (num & 0x7fff) as u16;
            self.avail_wrap_counter = num & (1 << 15) != 0;
            self.last_used_idx = self.last_avail_idx;
            self.used_wrap_counter = self.avail_wrap_counter;
        } else {
            self.last_avail_idx = num as u16;
            self.last_used_idx = num as u16;
        }
    }

    fn read_u16(&self, addr: u64) -> u16 {
        // SAFETY: `addr` was validated against the memory table when the
        // rings translated and the table is pinned by `self.mem`.
        unsafe { std::ptr::read_volatile(addr as *const u16) }
    }

    fn write_u16(&self, addr: u64, val: u16) {
        // SAFETY: as in `read_u16`.
        unsafe { std::ptr::write_volatile(addr as *mut u16, val) }
    }

    pub fn used_idx(&self) -> Option<u16> {
        match self.rings {
            Some(Rings::Split { used, .. }) => Some(self.read_u16(used + RING_IDX_OFFSET)),
            _ => None,
        }
    }

    pub fn avail_idx(&self) -> Option<u16> {
        match self.rings {
            Some(Rings::Split { avail, .. }) => Some(self.read_u16(avail + RING_IDX_OFFSET)),
            _ => None,
        }
    }

    /// Control the guest's kick suppression. Takes effect immediately on a
    /// translated ring, otherwise latches until translation.
    pub fn enable_guest_notification(&mut self, enable: bool) {
        match self.rings {
            Some(Rings::Split { used, .. }) => {
                let flags = if enable { 0 } else { VRING_USED_F_NO_NOTIFY };
                self.write_u16(used, flags);
                self.notif_enable = Some(enable);
            }
            Some(Rings::Packed { device_event, .. }) => {
                let flags = if enable {
                    VRING_EVENT_F_ENABLE
                } else {
                    VRING_EVENT_F_DISABLE
                };
                self.write_u16(device_event + 2, flags);
                self.notif_enable = Some(enable);
            }
            None => self.notif_enable = Some(enable),
        }
    }
}

/// A virtqueue: the state record behind its access lock, plus the IOTLB
/// whose read side the datapath shares.
#[derive(Debug)]
pub struct Vring {
    pub index: u32,
    pub iotlb: RwLock<IotlbCache>,
    pub state: Mutex<VringState>,
}

impl Vring {
    pub fn new(index: u32) -> Arc<Self> {
        Arc::new(Vring {
            index,
            iotlb: RwLock::new(IotlbCache::new()),
            state: Mutex::new(VringState::new(index)),
        })
    }
}

/// Resolve one ring address to host-virtual space: through the IOTLB when
/// an IOMMU is negotiated (emitting a miss request on failure), otherwise
/// through the frontend-virtual mapping.
pub(crate) fn ring_addr_to_vva(
    features: u64,
    mem: &MemoryTable,
    iotlb: &RwLock<IotlbCache>,
    miss: Option<&dyn Fn(u64, u8)>,
    ra: u64,
    size: &mut u64,
) -> Option<u64> {
    if has_iommu(features) {
        let found = iotlb.read().unwrap().find(ra, size, VHOST_ACCESS_RW);
        if found.is_none() {
            let first_miss = iotlb.write().unwrap().pending_insert(ra, VHOST_ACCESS_RW);
            if first_miss {
                if let Some(miss) = miss {
                    miss(ra, VHOST_ACCESS_RW);
                }
            }
        }
        found
    } else {
        mem.qva_to_vva(ra, size)
    }
}

/// Resolve the used-ring log address to guest-physical space. Under an
/// IOMMU the wire value is an I/O virtual address and has to go through the
/// IOTLB and then back from host-virtual to guest-physical.
fn translate_log_addr(
    features: u64,
    mem: &MemoryTable,
    iotlb: &RwLock<IotlbCache>,
    miss: Option<&dyn Fn(u64, u8)>,
    log_addr: u64,
) -> Option<u64> {
    if !has_iommu(features) {
        return Some(log_addr);
    }
    let expected = std::mem::size_of::<u64>() as u64;
    let mut size = expected;
    let hva = ring_addr_to_vva(features, mem, iotlb, miss, log_addr, &mut size)?;
    if size != expected {
        return None;
    }
    mem.hva_to_gpa(hva, expected)
}

/// Translate the queue's ring addresses into host-virtual mappings,
/// following the negotiated layout. On success `access_ok` is set and the
/// table is pinned; on failure the queue is simply left untranslated (the
/// device does not become ready, and the next kick or IOTLB update retries).
pub(crate) fn translate_rings(
    ifname: &str,
    features: u64,
    mem: &Arc<MemoryTable>,
    iotlb: &RwLock<IotlbCache>,
    miss: Option<&dyn Fn(u64, u8)>,
    vq: &mut VringState,
) {
    let addr = vq.ring_addrs;

    if addr.flags & (1 << VHOST_VRING_F_LOG) != 0 {
        match translate_log_addr(features, mem, iotlb, miss, addr.log_guest_addr) {
            Some(gpa) => vq.log_guest_addr = gpa,
            None => {
                debug!("({ifname}) failed to map log_guest_addr");
                return;
            }
        }
    }

    if ring_is_packed(features) {
        let mut len = PACKED_DESC_SIZE * vq.size as u64;
        let expected = len;
        let Some(desc) = ring_addr_to_vva(features, mem, iotlb, miss, addr.desc_user_addr, &mut len)
        else {
            debug!("({ifname}) failed to map packed descriptor ring");
            return;
        };
        if len != expected {
            debug!("({ifname}) failed to map packed descriptor ring");
            return;
        }

        let mut len = PACKED_EVENT_SIZE;
        let Some(driver_event) =
            ring_addr_to_vva(features, mem, iotlb, miss, addr.avail_user_addr, &mut len)
        else {
            debug!("({ifname}) failed to find driver area address");
            return;
        };
        if len != PACKED_EVENT_SIZE {
            debug!("({ifname}) failed to find driver area address");
            return;
        }

        let mut len = PACKED_EVENT_SIZE;
        let Some(device_event) =
            ring_addr_to_vva(features, mem, iotlb, miss, addr.used_user_addr, &mut len)
        else {
            debug!("({ifname}) failed to find device area address");
            return;
        };
        if len != PACKED_EVENT_SIZE {
            debug!("({ifname}) failed to find device area address");
            return;
        }

        vq.rings = Some(Rings::Packed {
            desc,
            driver_event,
            device_event,
        });
        vq.access_ok = true;
        vq.mem = Some(Arc::clone(mem));
        vq.numa_node = numa_node_of(desc);
        apply_deferred_notification(vq);
        return;
    }

    // Already translated and still valid.
    if matches!(vq.rings, Some(Rings::Split { .. })) && vq.access_ok {
        return;
    }

    let mut len = std::mem::size_of::<vring_desc>() as u64 * vq.size as u64;
    let expected = len;
    let Some(desc) = ring_addr_to_vva(features, mem, iotlb, miss, addr.desc_user_addr, &mut len)
    else {
        debug!("({ifname}) failed to map descriptor ring");
        return;
    };
    if len != expected {
        debug!("({ifname}) failed to map descriptor ring");
        return;
    }

    let event_idx = features & (1 << virtio_bindings::virtio_ring::VIRTIO_RING_F_EVENT_IDX) != 0;

    let mut len = std::mem::size_of::<vring_avail>() as u64
        + std::mem::size_of::<u16>() as u64 * vq.size as u64
        + if event_idx { 2 } else { 0 };
    let expected = len;
    let Some(avail) = ring_addr_to_vva(features, mem, iotlb, miss, addr.avail_user_addr, &mut len)
    else {
        debug!("({ifname}) failed to map avail ring");
        return;
    };
    if len != expected {
        debug!("({ifname}) failed to map avail ring");
        return;
    }

    let mut len = std::mem::size_of::<vring_used>() as u64
        + std::mem::size_of::<vring_used_elem>() as u64 * vq.size as u64
        + if event_idx { 2 } else { 0 };
    let expected = len;
    let Some(used) = ring_addr_to_vva(features, mem, iotlb, miss, addr.used_user_addr, &mut len)
    else {
        debug!("({ifname}) failed to map used ring");
        return;
    };
    if len != expected {
        debug!("({ifname}) failed to map used ring");
        return;
    }

    vq.rings = Some(Rings::Split { desc, avail, used });
    vq.mem = Some(Arc::clone(mem));

    let used_idx = vq.used_idx().unwrap_or(0);
    if vq.last_used_idx != used_idx {
        let avail_idx = vq.avail_idx().unwrap_or(0);
        warn!(
            "({ifname}) last_used_idx ({}) and used->idx ({used_idx}) mismatch; \
             resetting both indices to avail->idx ({avail_idx})",
            vq.last_used_idx
        );
        warn!("({ifname}) some packets may be resent for Tx and dropped for Rx");
        vq.last_used_idx = avail_idx;
        vq.last_avail_idx = avail_idx;
    }

    vq.access_ok = true;
    vq.numa_node = numa_node_of(desc);
    apply_deferred_notification(vq);

    debug!("({ifname}) mapped desc ring: {desc:#x}");
    debug!("({ifname}) mapped avail ring: {avail:#x}");
    debug!("({ifname}) mapped used ring: {used:#x}");
    debug!("({ifname}) log_guest_addr: {:#x}", vq.log_guest_addr);
}

fn apply_deferred_notification(vq: &mut VringState) {
    if let Some(enable) = vq.notif_enable {
        vq.enable_guest_notification(enable);
    }
}

/// Scan the split inflight region after a kick and build the resubmit list.
///
/// If the shared `used_idx` is stale the descriptor recorded in
/// `last_inflight_io` is cleared before the index is republished. The clear
/// is unconditional, exactly as the reference behaves, even when
/// `last_inflight_io` still holds its initial zero.
pub(crate) fn check_queue_inflights_split(
    protocol_features: ProtocolFeatures,
    vq: &mut VringState,
) -> crate::Result<()> {
    if !protocol_features.contains(ProtocolFeatures::INFLIGHT_SHMFD) {
        return Ok(());
    }
    let Some(inflight) = vq.inflight.clone() else {
        // The frontend may not use the feature even after negotiating it.
        return Ok(());
    };

    if inflight.version() == 0 {
        inflight.set_version(INFLIGHT_VERSION);
        return Ok(());
    }
    if vq.resubmit.is_some() {
        return Ok(());
    }

    vq.global_counter = 0;
    let last_io = inflight.last_inflight_io();

    if let Some(used_idx) = vq.used_idx() {
        if inflight.used_idx() != used_idx {
            if last_io < inflight.desc_num {
                inflight.set_desc_inflight(last_io, 0);
            }
            fence(Ordering::SeqCst);
            inflight.set_used_idx(used_idx);
        }
    }

    collect_resubmit(vq, &inflight)
}

/// Packed variant: roll the shared state forward or back depending on
/// whether the interrupted completion finished, then collect.
pub(crate) fn check_queue_inflights_packed(
    protocol_features: ProtocolFeatures,
    vq: &mut VringState,
) -> crate::Result<()> {
    if !protocol_features.contains(ProtocolFeatures::INFLIGHT_SHMFD) {
        return Ok(());
    }
    let Some(inflight) = vq.inflight.clone() else {
        return Ok(());
    };

    if inflight.version() == 0 {
        inflight.set_version(INFLIGHT_VERSION);
        return Ok(());
    }
    if vq.resubmit.is_some() {
        return Ok(());
    }

    vq.global_counter = 0;
    let old_used_idx = inflight.old_used_idx();

    if inflight.used_idx() != old_used_idx {
        if old_used_idx < inflight.desc_num && inflight.desc_inflight(old_used_idx) == 0 {
            inflight.set_old_used_idx(inflight.used_idx());
            inflight.set_old_used_wrap_counter(inflight.used_wrap_counter());
            inflight.set_old_free_head(inflight.free_head());
        } else {
            inflight.set_used_idx(old_used_idx);
            inflight.set_used_wrap_counter(inflight.old_used_wrap_counter());
            inflight.set_free_head(inflight.old_free_head());
        }
    }

    collect_resubmit(vq, &inflight)
}

fn collect_resubmit(vq: &mut VringState, inflight: &QueueInflight) -> crate::Result<()> {
    let mut descs: Vec<ResubmitDesc> = (0..inflight.desc_num)
        .filter(|i| inflight.desc_inflight(*i) == 1)
        .map(|i| ResubmitDesc {
            index: i,
            counter: inflight.desc_counter(i),
        })
        .collect();

    if !inflight.packed {
        vq.last_avail_idx = vq.last_avail_idx.wrapping_add(descs.len() as u16);
    }

    if descs.is_empty() {
        return Ok(());
    }

    descs.sort_unstable_by(|a, b| b.counter.cmp(&a.counter));
    vq.global_counter = descs[0].counter + 1;
    info!(
        "queue {}: {} inflight descriptors to resubmit",
        vq.index,
        descs.len()
    );
    vq.resubmit = Some(ResubmitInfo { descs });
    Ok(())
}

const MPOL_F_NODE: libc::c_ulong = 1 << 0;
const MPOL_F_ADDR: libc::c_ulong = 1 << 1;

/// NUMA node backing `addr`, from the kernel's mempolicy view. The node is
/// recorded so embedders can place their polling threads; allocation
/// rehoming is the registry's swap-on-replace concern.
pub(crate) fn numa_node_of(addr: u64) -> Option<u32> {
    let mut node: libc::c_int = -1;
    // SAFETY: get_mempolicy only writes the node out-param.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut node as *mut libc::c_int,
            std::ptr::null_mut::<libc::c_ulong>(),
            0usize,
            addr as usize,
            MPOL_F_NODE | MPOL_F_ADDR,
        )
    };
    if ret == 0 && node >= 0 {
        Some(node as u32)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inflight::{pervq_size_split, InflightRegion};
    use crate::memory::tests::anon_region_fd;
    use crate::message::{VhostUserMemory, VhostUserMemoryRegion};

    pub(crate) const TEST_QVA_BASE: u64 = 0x7f80_0000_0000;

    /// One 1 MiB region at GPA 0, frontend-virtual TEST_QVA_BASE.
    pub(crate) fn test_mem() -> Arc<MemoryTable> {
        let mut wire = VhostUserMemory {
            nregions: 1,
            ..Default::default()
        };
        wire.regions[0] = VhostUserMemoryRegion {
            guest_phys_addr: 0,
            memory_size: 0x100000,
            userspace_addr: TEST_QVA_BASE,
            mmap_offset: 0,
        };
        Arc::new(MemoryTable::map(&wire, vec![anon_region_fd(0x100000)], false).unwrap())
    }

    pub(crate) fn poke_u16(mem: &MemoryTable, hva: u64, val: u16) {
        let ptr = mem.hva_to_ptr(hva, 2).unwrap();
        // SAFETY: hva_to_ptr validated the range.
        unsafe { std::ptr::write_volatile(ptr as *mut u16, val) };
    }

    fn addressed_queue(size: u32) -> VringState {
        let mut vq = VringState::new(0);
        vq.size = size;
        vq.ring_addrs = VhostUserVringAddr {
            index: 0,
            flags: 0,
            desc_user_addr: TEST_QVA_BASE + 0x1000,
            avail_user_addr: TEST_QVA_BASE + 0x3000,
            used_user_addr: TEST_QVA_BASE + 0x4000,
            log_guest_addr: 0,
        };
        vq
    }

    #[test]
    fn split_translation_success() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(256);

        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);
        assert!(vq.access_ok);
        let Some(Rings::Split { desc, avail, used }) = vq.rings else {
            panic!("rings not translated");
        };
        let base = mem.regions()[0].host_user_addr;
        assert_eq!(desc, base + 0x1000);
        assert_eq!(avail, base + 0x3000);
        assert_eq!(used, base + 0x4000);
        assert_eq!(vq.used_idx(), Some(0));
    }

    #[test]
    fn translation_fails_out_of_range() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(256);
        vq.ring_addrs.used_user_addr = TEST_QVA_BASE + 0x100000 - 0x10;

        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);
        assert!(!vq.access_ok);
        assert!(vq.rings.is_none());
    }

    #[test]
    fn index_mismatch_resets_to_avail_idx() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(256);
        vq.last_used_idx = 5;

        let base = mem.regions()[0].host_user_addr;
        // used->idx = 9, avail->idx = 7.
        poke_u16(&mem, base + 0x4000 + 2, 9);
        poke_u16(&mem, base + 0x3000 + 2, 7);

        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);
        assert!(vq.access_ok);
        assert_eq!(vq.last_used_idx, 7);
        assert_eq!(vq.last_avail_idx, 7);
    }

    #[test]
    fn iommu_translation_misses_then_resolves() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let features = 1u64 << crate::features::VIRTIO_F_IOMMU_PLATFORM;
        let mut vq = addressed_queue(4);
        vq.ring_addrs = VhostUserVringAddr {
            desc_user_addr: 0x1000,
            avail_user_addr: 0x3000,
            used_user_addr: 0x4000,
            ..Default::default()
        };

        let misses = std::sync::Mutex::new(Vec::new());
        let record = |iova: u64, perm: u8| misses.lock().unwrap().push((iova, perm));
        translate_rings("test", features, &mem, &iotlb, Some(&record), &mut vq);
        assert!(!vq.access_ok);
        assert_eq!(misses.lock().unwrap().as_slice(), &[(0x1000, VHOST_ACCESS_RW)]);

        // A duplicate attempt does not repeat the outstanding miss.
        translate_rings("test", features, &mem, &iotlb, Some(&record), &mut vq);
        assert_eq!(misses.lock().unwrap().len(), 1);

        // Frontend answers with updates covering all three rings.
        let base = mem.regions()[0].host_user_addr;
        {
            let mut cache = iotlb.write().unwrap();
            cache.insert(0x1000, base + 0x1000, 0x1000, VHOST_ACCESS_RW);
            cache.insert(0x3000, base + 0x3000, 0x1000, VHOST_ACCESS_RW);
            cache.insert(0x4000, base + 0x4000, 0x1000, VHOST_ACCESS_RW);
        }
        translate_rings("test", features, &mem, &iotlb, Some(&record), &mut vq);
        assert!(vq.access_ok);
    }

    #[test]
    fn readiness_predicate() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(256);
        assert!(!vq.is_ready());

        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);
        vq.kickfd = VringFd::Disabled;
        vq.callfd = VringFd::Disabled;
        assert!(!vq.is_ready());
        vq.enabled = true;
        assert!(vq.is_ready());

        vq.stop();
        assert!(!vq.kickfd.is_initialized());
        assert!(!vq.callfd.is_initialized());
        vq.invalidate();
        assert!(!vq.access_ok);
        assert!(vq.rings.is_none());
    }

    #[test]
    fn base_value_packs_wrap_counter() {
        let mut vq = VringState::new(0);
        vq.set_base(0x8003, true);
        assert_eq!(vq.last_avail_idx, 3);
        assert!(vq.avail_wrap_counter);
        assert_eq!(vq.last_used_idx, 3);
        assert!(vq.used_wrap_counter);
        assert_eq!(vq.base_value(true), 0x8003);

        vq.set_base(7, false);
        assert_eq!(vq.base_value(false), 7);
    }

    #[test]
    fn inflight_resubmit_scan() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(16);
        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);

        let region = Arc::new(InflightRegion::alloc(pervq_size_split(16)).unwrap());
        region.zero();
        let view = QueueInflight::new_split(Arc::clone(&region), 0, 16);
        view.set_version(INFLIGHT_VERSION);
        view.set_desc_inflight(3, 1);
        view.set_desc_counter(3, 42);
        view.set_desc_inflight(7, 1);
        view.set_desc_counter(7, 41);
        vq.inflight = Some(view);

        check_queue_inflights_split(ProtocolFeatures::INFLIGHT_SHMFD, &mut vq).unwrap();

        let resubmit = vq.resubmit.as_ref().unwrap();
        assert_eq!(
            resubmit.descs,
            vec![
                ResubmitDesc {
                    index: 3,
                    counter: 42
                },
                ResubmitDesc {
                    index: 7,
                    counter: 41
                },
            ]
        );
        assert_eq!(vq.global_counter, 43);
        assert_eq!(vq.last_avail_idx, 2);
    }

    #[test]
    fn inflight_scan_fresh_region_stamps_version() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(16);
        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);

        let region = Arc::new(InflightRegion::alloc(pervq_size_split(16)).unwrap());
        region.zero();
        let view = QueueInflight::new_split(Arc::clone(&region), 0, 16);
        vq.inflight = Some(view.clone());

        check_queue_inflights_split(ProtocolFeatures::INFLIGHT_SHMFD, &mut vq).unwrap();
        assert_eq!(view.version(), INFLIGHT_VERSION);
        assert!(vq.resubmit.is_none());
        assert_eq!(vq.last_avail_idx, 0);
    }

    #[test]
    fn inflight_scan_republishes_stale_used_idx() {
        let mem = test_mem();
        let iotlb = RwLock::new(IotlbCache::new());
        let mut vq = addressed_queue(16);
        translate_rings("test", 0, &mem, &iotlb, None, &mut vq);

        // Ring's used->idx advanced to 2, shared copy still 1.
        let base = mem.regions()[0].host_user_addr;
        poke_u16(&mem, base + 0x4000 + 2, 2);
        poke_u16(&mem, base + 0x3000 + 2, 2);
        vq.last_used_idx = 2;
        vq.last_avail_idx = 2;

        let region = Arc::new(InflightRegion::alloc(pervq_size_split(16)).unwrap());
        region.zero();
        let view = QueueInflight::new_split(Arc::clone(&region), 0, 16);
        view.set_version(INFLIGHT_VERSION);
        view.set_used_idx(1);
        view.set_last_inflight_io(5);
        view.set_desc_inflight(5, 1);
        view.set_desc_counter(5, 9);
        vq.inflight = Some(view.clone());

        check_queue_inflights_split(ProtocolFeatures::INFLIGHT_SHMFD, &mut vq).unwrap();

        // The interrupted completion was retired and the index republished.
        assert_eq!(view.used_idx(), 2);
        assert_eq!(view.desc_inflight(5), 0);
        assert!(vq.resubmit.is_none());
    }
}
