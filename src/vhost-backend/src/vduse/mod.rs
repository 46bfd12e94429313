// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! VDUSE transport: the same device state machine driven by a kernel
//! chardev instead of a frontend socket. The kernel originates requests on
//! the device descriptor; ioctls carry everything else. A persistent
//! reconnect log preserves ring indices across backend restarts.

mod bindings;

pub use bindings::*;

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, error, info};
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use virtio_bindings::virtio_net::virtio_net_config;

use crate::config::{BackendConfig, VhostEvents};
use crate::device::{Device, Transport};
use crate::features::{
    net_header_len, DeviceFlags, DeviceStatus, VIRTIO_F_IOMMU_PLATFORM,
};
use crate::fd_man::FdSet;
use crate::memory::MemoryTable;
use crate::message::{VHOST_ACCESS_RO, VHOST_ACCESS_RW, VHOST_ACCESS_WO};
use crate::registry::DeviceRegistry;
use crate::virtqueue::{translate_rings, ShadowUsed, VringFd, VHOST_MAX_VRING};
use crate::{Error, Result};

use virtio_bindings::virtio_net::{VIRTIO_NET_F_CTRL_VQ, VIRTIO_NET_F_MQ};
use virtio_bindings::virtio_ring::vring_used_elem;

const VDUSE_CTRL_PATH: &str = "/dev/vduse/control";
const VDUSE_PATH_PREFIX: &str = "/dev/vduse/";

/// Layout version of the reconnect file.
pub const VHOST_RECONNECT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct ReconnectVring {
    last_avail_idx: u16,
    avail_wrap_counter: u8,
    padding: u8,
}

#[repr(C)]
struct ReconnectLayout {
    version: u32,
    reserved: u32,
    features: u64,
    status: u8,
    padding: [u8; 7],
    nr_vrings: u32,
    config: virtio_net_config,
    vrings: [ReconnectVring; VHOST_MAX_VRING as usize],
}

/// The mmap'ed reconnect file. Writes go straight to the shared mapping so
/// a crash at any point leaves a consistent snapshot.
#[derive(Debug)]
pub struct ReconnectLog {
    addr: *mut ReconnectLayout,
}

// SAFETY: all access is volatile field reads/writes on the fixed layout.
unsafe impl Send for ReconnectLog {}
unsafe impl Sync for ReconnectLog {}

macro_rules! log_field {
    ($get:ident, $set:ident, $field:ident, $ty:ty) => {
        pub fn $get(&self) -> $ty {
            // SAFETY: the mapping covers the whole layout.
            unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.addr).$field)) }
        }

        pub fn $set(&self, val: $ty) {
            // SAFETY: as above.
            unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!((*self.addr).$field), val) }
        }
    };
}

impl ReconnectLog {
    /// Create the file for a device that does not exist in the kernel yet.
    /// An already-present file means the kernel lost the device while the
    /// log survived; that is an inconsistency the caller must surface.
    pub fn create(path: &Path) -> Result<ReconnectLog> {
        let fd = match open(
            path,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::EEXIST) => {
                error!("reconnect file {path:?} exists but not the device");
                return Err(Error::InvalidState("stale reconnect file"));
            }
            Err(e) => return Err(e.into()),
        };
        // SAFETY: open() returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        nix::unistd::ftruncate(fd.as_raw_fd(), std::mem::size_of::<ReconnectLayout>() as i64)?;
        Self::map(fd)
    }

    /// Reopen the file of a device that survived in the kernel; it must
    /// exist.
    pub fn open(path: &Path) -> Result<ReconnectLog> {
        let fd = match open(path, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) => {
                error!("missing reconnect file {path:?}");
                return Err(Error::InvalidState("missing reconnect file"));
            }
            Err(e) => return Err(e.into()),
        };
        // SAFETY: open() returned a fresh descriptor.
        Self::map(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn map(fd: OwnedFd) -> Result<ReconnectLog> {
        let len = NonZeroUsize::new(std::mem::size_of::<ReconnectLayout>())
            .expect("layout is not empty");
        // SAFETY: mapping our own file, length fixed by the layout.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        }? as *mut ReconnectLayout;
        Ok(ReconnectLog { addr })
    }

    log_field!(version, set_version, version, u32);
    log_field!(features, set_features, features, u64);
    log_field!(status, set_status, status, u8);
    log_field!(nr_vrings, set_nr_vrings, nr_vrings, u32);
    log_field!(config, set_config, config, virtio_net_config);

    fn vring_ptr(&self, index: u32) -> *mut ReconnectVring {
        assert!(index < VHOST_MAX_VRING);
        // SAFETY: index checked against the fixed array bound.
        unsafe { std::ptr::addr_of_mut!((*self.addr).vrings[index as usize]) }
    }

    /// Consistency check on reopen: the log must describe the same device
    /// the kernel reports.
    pub fn check(&self, features: u64, total_queues: u32) -> Result<()> {
        if self.version() != VHOST_RECONNECT_VERSION {
            error!(
                "version mismatch between backend ({VHOST_RECONNECT_VERSION:#x}) and reconnect file ({:#x})",
                self.version()
            );
            return Err(Error::InvalidState("reconnect version mismatch"));
        }
        if self.features() & features != self.features() {
            error!(
                "features mismatch between backend ({features:#x}) and reconnect file ({:#x})",
                self.features()
            );
            return Err(Error::InvalidState("reconnect features mismatch"));
        }
        if self.nr_vrings() != total_queues {
            error!(
                "queue count mismatch between backend ({total_queues}) and reconnect file ({})",
                self.nr_vrings()
            );
            return Err(Error::InvalidState("reconnect vring count mismatch"));
        }
        Ok(())
    }
}

impl Drop for ReconnectLog {
    fn drop(&mut self) {
        // SAFETY: the mapping was created over the full layout.
        let _ = unsafe {
            munmap(
                self.addr as *mut libc::c_void,
                std::mem::size_of::<ReconnectLayout>(),
            )
        };
    }
}

/// One queue's slot in the reconnect log, attached to the vring record.
#[derive(Debug, Clone)]
pub struct ReconnectVringHandle {
    log: Arc<ReconnectLog>,
    index: u32,
}

impl ReconnectVringHandle {
    pub fn new(log: Arc<ReconnectLog>, index: u32) -> Self {
        ReconnectVringHandle { log, index }
    }

    pub fn last_avail_idx(&self) -> u16 {
        // SAFETY: vring_ptr bounds-checks the index.
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.log.vring_ptr(self.index)).last_avail_idx)) }
    }

    pub fn set_last_avail_idx(&self, val: u16) {
        // SAFETY: as above.
        unsafe {
            std::ptr::write_volatile(
                std::ptr::addr_of_mut!((*self.log.vring_ptr(self.index)).last_avail_idx),
                val,
            )
        }
    }

    pub fn avail_wrap_counter(&self) -> bool {
        // SAFETY: as above.
        unsafe {
            std::ptr::read_volatile(std::ptr::addr_of!(
                (*self.log.vring_ptr(self.index)).avail_wrap_counter
            )) != 0
        }
    }

    pub fn set_avail_wrap_counter(&self, val: bool) {
        // SAFETY: as above.
        unsafe {
            std::ptr::write_volatile(
                std::ptr::addr_of_mut!((*self.log.vring_ptr(self.index)).avail_wrap_counter),
                val as u8,
            )
        }
    }
}

/// `$RUNTIME_DIRECTORY`, else the usual runtime locations, plus `/vduse`.
/// Computed once per process.
fn reconnect_dir() -> Result<&'static Path> {
    static DIR: OnceLock<Option<PathBuf>> = OnceLock::new();
    DIR.get_or_init(|| {
        let base = match std::env::var_os("RUNTIME_DIRECTORY") {
            Some(dir) => PathBuf::from(dir),
            None => {
                if nix::unistd::getuid().is_root() {
                    PathBuf::from("/var/run")
                } else {
                    std::env::var_os("XDG_RUNTIME_DIR")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("/tmp"))
                }
            }
        };
        let dir = base.join("vduse");
        match nix::unistd::mkdir(&dir, Mode::S_IRWXU) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {
                info!("created VDUSE reconnect directory in {dir:?}");
                Some(dir)
            }
            Err(e) => {
                error!("error creating {dir:?}: {e}");
                None
            }
        }
    })
    .as_deref()
    .ok_or(Error::ResourceExhausted("vduse reconnect directory"))
}

fn vduse_fdset() -> Result<FdSet> {
    static FDSET: Mutex<Option<FdSet>> = Mutex::new(None);
    let mut guard = FDSET.lock().unwrap();
    if let Some(set) = guard.as_ref() {
        return Ok(set.clone());
    }
    let set = FdSet::new("vduse-evt")?;
    *guard = Some(set.clone());
    Ok(set)
}

struct IotlbMapping {
    start: u64,
    last: u64,
    addr: u64,
    len: u64,
}

/// Backend operations over the chardev: translation faults resolve through
/// `VDUSE_IOTLB_GET_FD`, interrupts through `VDUSE_VQ_INJECT_IRQ`.
struct VduseTransport {
    dev_fd: Arc<OwnedFd>,
    mappings: Mutex<Vec<IotlbMapping>>,
}

impl VduseTransport {
    fn perm_to_prot(perm: u8) -> ProtFlags {
        match perm {
            VHOST_ACCESS_RO => ProtFlags::PROT_READ,
            VHOST_ACCESS_WO => ProtFlags::PROT_WRITE,
            _ => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }

    /// Drop cached translations and their mappings for an invalidated
    /// range.
    fn invalidate_range(&self, dev: &Device, start: u64, last: u64) {
        let vrings: Vec<_> = {
            let state = dev.state.lock().unwrap();
            state.vrings.iter().flatten().cloned().collect()
        };
        for vring in vrings {
            vring
                .iotlb
                .write()
                .unwrap()
                .remove(start, last - start + 1);
            let mut vq = vring.state.lock().unwrap();
            vq.invalidate();
        }

        let mut mappings = self.mappings.lock().unwrap();
        mappings.retain(|m| {
            if m.start <= last && m.last >= start {
                // SAFETY: we created this mapping in iotlb_miss.
                let _ = unsafe { munmap(m.addr as *mut libc::c_void, m.len as usize) };
                false
            } else {
                true
            }
        });
    }
}

impl Drop for VduseTransport {
    fn drop(&mut self) {
        for m in self.mappings.lock().unwrap().drain(..) {
            // SAFETY: created in iotlb_miss.
            let _ = unsafe { munmap(m.addr as *mut libc::c_void, m.len as usize) };
        }
    }
}

impl Transport for VduseTransport {
    fn iotlb_miss(&self, dev: &Device, iova: u64, perm: u8) -> Result<()> {
        let mut entry = VduseIotlbEntry {
            start: iova,
            last: iova + 1,
            ..Default::default()
        };
        // SAFETY: entry outlives the call; the kernel fills it in.
        let raw = unsafe { vduse_iotlb_get_fd(self.dev_fd.as_raw_fd(), &mut entry) }.map_err(
            |e| {
                error!("({}) failed to get IOTLB entry for {iova:#x}", dev.ifname());
                Error::Syscall(e)
            },
        )?;
        // SAFETY: the ioctl returns a fresh descriptor on success.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        debug!(
            "({}) new IOTLB entry: iova {:#x} - {:#x}, offset {:#x}, perm {:#x}",
            dev.ifname(),
            entry.start,
            entry.last,
            entry.offset,
            entry.perm
        );

        let size = entry.last - entry.start + 1;
        let len = NonZeroUsize::new((size + entry.offset) as usize)
            .ok_or(Error::ResourceExhausted("empty iotlb entry"))?;
        // SAFETY: mapping the kernel-provided descriptor read-only or
        // read-write per the reported permission.
        let addr = unsafe {
            mmap(
                None,
                len,
                Self::perm_to_prot(entry.perm),
                MapFlags::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        }? as u64;

        let uaddr = addr + entry.offset;
        let vrings: Vec<_> = {
            let state = dev.state.lock().unwrap();
            state.vrings.iter().flatten().cloned().collect()
        };
        for vring in vrings {
            vring
                .iotlb
                .write()
                .unwrap()
                .insert(entry.start, uaddr, size, entry.perm);
        }
        self.mappings.lock().unwrap().push(IotlbMapping {
            start: entry.start,
            last: entry.last,
            addr,
            len: size + entry.offset,
        });
        Ok(())
    }

    fn inject_irq(&self, _dev: &Device, vq: &crate::virtqueue::VringState) -> Result<()> {
        // SAFETY: passing the queue index by reference.
        unsafe { vduse_vq_inject_irq(self.dev_fd.as_raw_fd(), &vq.index) }?;
        Ok(())
    }
}

struct VduseDev {
    dev: Arc<Device>,
    registry: Arc<DeviceRegistry>,
    config: Arc<BackendConfig>,
    transport: Arc<VduseTransport>,
    dev_fd: Arc<OwnedFd>,
    ctrl_fd: OwnedFd,
    reconnect: Arc<ReconnectLog>,
    reconnect_path: PathBuf,
    fdset: FdSet,
    name: String,
    total_queues: u32,
    cvq_index: Option<u32>,
}

/// A created (or reattached) VDUSE device. Destroy it explicitly to remove
/// the kernel device and its reconnect file.
pub struct VduseDeviceHandle {
    inner: Arc<VduseDev>,
}

impl VduseDeviceHandle {
    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.inner.dev)
    }

    /// Stop the device, detach from the event loop, destroy the kernel
    /// device and remove the reconnect file.
    pub fn destroy(self) -> Result<()> {
        let vdev = &self.inner;
        device_stop(vdev);
        vdev.fdset.del(vdev.dev_fd.as_raw_fd());

        let mut name = [0 as libc::c_char; VDUSE_NAME_MAX];
        for (dst, src) in name.iter_mut().zip(vdev.name.bytes()) {
            *dst = src as libc::c_char;
        }
        // SAFETY: name buffer outlives the call.
        match unsafe { vduse_destroy_dev(vdev.ctrl_fd.as_raw_fd(), &name) } {
            Ok(_) => {
                // The device left the vDPA bus; the log has nothing left
                // to reconnect to.
                let _ = nix::unistd::unlink(&vdev.reconnect_path);
            }
            Err(e) => error!("({}) failed to destroy VDUSE device: {e}", vdev.name),
        }

        vdev.registry.destroy_device(vdev.dev.vid());
        Ok(())
    }
}

/// Create a VDUSE device at `path` (`/dev/vduse/<name>`), or reattach to
/// one that survived in the kernel. On reattach with DRIVER_OK persisted,
/// the device starts as soon as the event loop runs.
pub fn create_device(
    registry: &Arc<DeviceRegistry>,
    path: &str,
    config: BackendConfig,
    events: Arc<dyn VhostEvents>,
) -> Result<VduseDeviceHandle> {
    let name = path
        .strip_prefix(VDUSE_PATH_PREFIX)
        .ok_or(Error::Vduse("device path must live under /dev/vduse"))?
        .to_owned();
    let config = Arc::new(config);
    let fdset = vduse_fdset()?;

    let ctrl_raw = open(VDUSE_CTRL_PATH, OFlag::O_RDWR, Mode::empty()).map_err(|e| {
        error!("({name}) failed to open {VDUSE_CTRL_PATH}: {e}");
        Error::Syscall(e)
    })?;
    // SAFETY: open() returned a fresh descriptor.
    let ctrl_fd = unsafe { OwnedFd::from_raw_fd(ctrl_raw) };

    let api = VDUSE_API_VERSION;
    // SAFETY: passing the version by reference.
    unsafe { vduse_set_api_version(ctrl_fd.as_raw_fd(), &api) }?;

    let max_queue_pairs = config.queue_pairs.max(1);
    let mut features = config.features;
    let mut total_queues = max_queue_pairs * 2;
    if max_queue_pairs == 1 {
        features &= !((1u64 << VIRTIO_NET_F_CTRL_VQ) | (1u64 << VIRTIO_NET_F_MQ));
    } else {
        // The last queue is the control queue.
        total_queues += 1;
    }

    let mut vnet_config = virtio_net_config::default();
    vnet_config.max_virtqueue_pairs = max_queue_pairs as u16;

    let (dev_raw, reconnecting) = match open(path, OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => {
            info!("({name}) device already exists, reconnecting");
            (fd, true)
        }
        Err(nix::errno::Errno::ENOENT) => {
            let mut dev_config = VduseDevConfig {
                device_id: 1, // virtio-net
                features,
                vq_num: total_queues,
                vq_align: crate::memory::GUEST_PAGE_SIZE as u32,
                config_size: std::mem::size_of::<virtio_net_config>() as u32,
                ..Default::default()
            };
            for (dst, src) in dev_config.name.iter_mut().zip(name.bytes()) {
                *dst = src as libc::c_char;
            }
            // SAFETY: config is a plain value read by the kernel.
            unsafe {
                let cfg_bytes = std::slice::from_raw_parts(
                    &vnet_config as *const _ as *const u8,
                    std::mem::size_of::<virtio_net_config>(),
                );
                dev_config.config[..cfg_bytes.len()].copy_from_slice(cfg_bytes);
                vduse_create_dev(ctrl_fd.as_raw_fd(), &dev_config)
            }
            .map_err(|e| {
                error!("({name}) failed to create VDUSE device: {e}");
                Error::Syscall(e)
            })?;
            let fd = open(path, OFlag::O_RDWR, Mode::empty()).map_err(|e| {
                error!("({name}) failed to open newly created device: {e}");
                Error::Syscall(e)
            })?;
            (fd, false)
        }
        Err(e) => {
            error!("({name}) failed to open device {path}: {e}");
            return Err(Error::Syscall(e));
        }
    };
    // SAFETY: open() returned a fresh descriptor.
    let dev_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(dev_raw) });
    fcntl(dev_fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

    let transport = Arc::new(VduseTransport {
        dev_fd: Arc::clone(&dev_fd),
        mappings: Mutex::new(Vec::new()),
    });
    let dev = registry.new_device(path, events, Arc::clone(&transport) as Arc<dyn Transport>)?;

    let reconnect_path = reconnect_dir()?.join(&name);
    let reconnect = Arc::new(if reconnecting {
        let log = ReconnectLog::open(&reconnect_path)?;
        log.check(features, total_queues)?;
        log
    } else {
        let log = ReconnectLog::create(&reconnect_path)?;
        log.set_version(VHOST_RECONNECT_VERSION);
        log.set_nr_vrings(total_queues);
        log.set_config(vnet_config);
        log
    });

    let vrings = {
        let mut state = dev.state.lock().unwrap();
        state.async_copy = config.async_copy;
        if reconnecting {
            state.status = DeviceStatus::from_bits_truncate(reconnect.status());
        }
        (0..total_queues)
            .map(|i| state.ensure_vring(i))
            .collect::<Result<Vec<_>>>()?
    };
    for (i, vring) in vrings.iter().enumerate() {
        vring.state.lock().unwrap().reconnect = Some(ReconnectVringHandle::new(
            Arc::clone(&reconnect),
            i as u32,
        ));
    }

    if !reconnecting {
        for i in 0..total_queues {
            let vq_cfg = VduseVqConfig {
                index: i,
                max_size: config.vduse_max_queue_size,
                ..Default::default()
            };
            // SAFETY: vq_cfg outlives the call.
            unsafe { vduse_vq_setup(dev_fd.as_raw_fd(), &vq_cfg) }.map_err(|e| {
                error!("({name}) failed to set up VQ {i}: {e}");
                Error::Syscall(e)
            })?;
        }
    }

    let vdev = Arc::new(VduseDev {
        dev,
        registry: Arc::clone(registry),
        config,
        transport,
        dev_fd,
        ctrl_fd,
        reconnect,
        reconnect_path,
        fdset: fdset.clone(),
        name,
        total_queues,
        cvq_index: (max_queue_pairs > 1).then_some(max_queue_pairs * 2),
    });

    {
        let handler_dev = Arc::clone(&vdev);
        fdset.add(
            vdev.dev_fd.as_raw_fd(),
            Box::new(move |fd, _remove| events_handler(&handler_dev, fd)),
        )?;
    }

    let persisted_status = DeviceStatus::from_bits_truncate(vdev.reconnect.status());
    if reconnecting && persisted_status.contains(DeviceStatus::DRIVER_OK) {
        reconnect_start_device(Arc::clone(&vdev))?;
    }

    Ok(VduseDeviceHandle { inner: vdev })
}

/// Run `device_start` for a reconnect in the event-loop context, exactly
/// like a fresh DRIVER_OK would, by kicking a one-shot eventfd.
fn reconnect_start_device(vdev: Arc<VduseDev>) -> Result<()> {
    let efd = nix::sys::eventfd::eventfd(
        0,
        nix::sys::eventfd::EfdFlags::EFD_NONBLOCK | nix::sys::eventfd::EfdFlags::EFD_CLOEXEC,
    )?;
    // SAFETY: eventfd() returned a fresh descriptor.
    let efd = unsafe { OwnedFd::from_raw_fd(efd) };
    let raw = efd.as_raw_fd();

    vdev.fdset.clone().add(
        raw,
        Box::new(move |fd, remove| {
            let mut buf = [0u8; 8];
            let _ = nix::unistd::read(fd, &mut buf);
            device_start(&vdev, true);
            *remove = true;
            // The eventfd closes with the captured owner.
            let _ = &efd;
        }),
    )?;
    nix::unistd::write(raw, &1u64.to_ne_bytes())?;
    Ok(())
}

/// Handle one kernel request from the device descriptor.
fn events_handler(vdev: &VduseDev, fd: RawFd) {
    let dev = &vdev.dev;
    let mut buf = [0u8; std::mem::size_of::<VduseDevRequest>()];
    let n = match nix::unistd::read(fd, &mut buf) {
        Ok(n) => n,
        Err(e) => {
            error!("({}) failed to read request: {e}", vdev.name);
            return;
        }
    };
    if n < buf.len() {
        error!("({}) incomplete request read ({n})", vdev.name);
        return;
    }
    let req = VduseDevRequest::from_bytes(&buf).expect("buffer sized to the request");

    info!(
        "({}) new request: {} ({})",
        vdev.name,
        req.type_name(),
        req.request_type
    );

    let mut resp = VduseDevResponse {
        request_id: req.request_id,
        ..Default::default()
    };
    let old_status = dev.status();

    match req.request_type {
        VDUSE_GET_VQ_STATE => {
            let index = req.vq_index();
            match dev.vring(index) {
                Some(vring) => {
                    let avail = vring.state.lock().unwrap().last_avail_idx;
                    info!("({}) vq index: {index}, avail_index: {avail}", vdev.name);
                    resp.set_vq_state_split(avail);
                    resp.result = VDUSE_REQ_RESULT_OK;
                }
                None => resp.result = VDUSE_REQ_RESULT_FAILED,
            }
        }
        VDUSE_SET_STATUS => {
            let status = req.status();
            info!("({}) new status: {status:#04x}", vdev.name);
            dev.state.lock().unwrap().status = DeviceStatus::from_bits_truncate(status);
            vdev.reconnect.set_status(status);
            resp.result = VDUSE_REQ_RESULT_OK;
        }
        VDUSE_UPDATE_IOTLB => {
            let (start, last) = req.iova_range();
            info!("({}) invalidate IOVA range {start:#x} - {last:#x}", vdev.name);
            vdev.transport.invalidate_range(dev, start, last);
            resp.result = VDUSE_REQ_RESULT_OK;
        }
        _ => resp.result = VDUSE_REQ_RESULT_FAILED,
    }

    if let Err(e) = nix::unistd::write(fd, resp.as_bytes()) {
        error!("({}) failed to write response: {e}", vdev.name);
        return;
    }

    let new_status = dev.status();
    if (old_status ^ new_status).contains(DeviceStatus::DRIVER_OK) {
        if new_status.contains(DeviceStatus::DRIVER_OK) {
            // Ready flags flip asynchronously after DRIVER_OK; poll before
            // starting.
            if wait_for_virtqueues_ready(vdev).is_err() {
                error!(
                    "({}) failed to wait for virtqueues ready, aborting device start",
                    vdev.name
                );
                return;
            }
            device_start(vdev, false);
        } else {
            device_stop(vdev);
        }
    }
}

/// Poll every queue's ready flag through `probe` until all flip or the
/// retry budget runs out.
fn poll_queues_ready<F>(
    nr_vring: u32,
    retries: u32,
    interval: Duration,
    mut probe: F,
) -> Result<()>
where
    F: FnMut(u32) -> Result<bool>,
{
    for i in 0..nr_vring {
        let mut attempt = 0;
        loop {
            if attempt >= retries {
                error!("VQ {i} ready-state polling timed out after {retries} attempts");
                return Err(Error::Vduse("virtqueue ready polling timed out"));
            }
            if probe(i)? {
                debug!("VQ {i} is ready after {attempt} retries");
                break;
            }
            attempt += 1;
            std::thread::sleep(interval);
        }
    }
    Ok(())
}

fn wait_for_virtqueues_ready(vdev: &VduseDev) -> Result<()> {
    poll_queues_ready(
        vdev.total_queues,
        vdev.config.vduse_ready_poll_retries,
        vdev.config.vduse_ready_poll_interval,
        |i| {
            let mut info = VduseVqInfo {
                index: i,
                ..Default::default()
            };
            // SAFETY: info outlives the call.
            unsafe { vduse_vq_get_info(vdev.dev_fd.as_raw_fd(), &mut info) }?;
            Ok(info.ready != 0)
        },
    )
}

fn vring_setup(vdev: &VduseDev, index: u32, reconnecting: bool) {
    let dev = &vdev.dev;
    let mut info = VduseVqInfo {
        index,
        ..Default::default()
    };
    // SAFETY: info outlives the call.
    if let Err(e) = unsafe { vduse_vq_get_info(vdev.dev_fd.as_raw_fd(), &mut info) } {
        error!("({}) failed to get VQ {index} info: {e}", vdev.name);
        return;
    }

    let Some(vring) = dev.vring(index) else {
        return;
    };
    let features = dev.features() | (1 << VIRTIO_F_IOMMU_PLATFORM);
    // VDUSE ring addresses are always I/O virtual; the translation below
    // resolves them through the IOTLB, faulting entries in on demand.
    let empty_mem = Arc::new(MemoryTable::default());

    let kickfd = match nix::sys::eventfd::eventfd(
        0,
        nix::sys::eventfd::EfdFlags::EFD_NONBLOCK | nix::sys::eventfd::EfdFlags::EFD_CLOEXEC,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            error!("({}) failed to init kickfd for VQ {index}: {e}", vdev.name);
            return;
        }
    };
    // SAFETY: eventfd() returned a fresh descriptor.
    let kickfd = unsafe { OwnedFd::from_raw_fd(kickfd) };
    let kick_raw = kickfd.as_raw_fd();

    {
        let mut vq = vring.state.lock().unwrap();
        if reconnecting {
            let log = vq.reconnect.clone().expect("attached at create");
            vq.last_avail_idx = log.last_avail_idx();
            vq.last_used_idx = log.last_avail_idx();
        } else {
            vq.last_avail_idx = info.state.avail_index;
            vq.last_used_idx = info.state.avail_index;
        }
        vq.size = info.num;
        vq.ready = true;
        vq.enabled = info.ready != 0;
        vq.ring_addrs.desc_user_addr = info.desc_addr;
        vq.ring_addrs.avail_user_addr = info.driver_addr;
        vq.ring_addrs.used_user_addr = info.device_addr;
        info!(
            "({}) VQ {index} info: num {} desc {:#x} driver {:#x} device {:#x} avail_idx {} ready {}",
            vdev.name, info.num, info.desc_addr, info.driver_addr, info.device_addr,
            vq.last_avail_idx, info.ready
        );
        vq.kickfd = VringFd::Fd(kickfd);

        vq.shadow_used = ShadowUsed::Split(vec![vring_used_elem::default(); info.num as usize]);
        vq.batch_copy = vec![Default::default(); info.num as usize];

        let transport = Arc::clone(&vdev.transport);
        let dev_for_miss = Arc::clone(dev);
        let miss = move |iova: u64, perm: u8| {
            let _ = transport.iotlb_miss(&dev_for_miss, iova, perm);
        };
        translate_rings(dev.ifname(), features, &empty_mem, &vring.iotlb, Some(&miss), &mut vq);
        if !vq.access_ok {
            error!("({}) failed to translate vring {index} addresses", vdev.name);
        }
        vq.enable_guest_notification(false);
    }

    let vq_efd = VduseVqEventfd {
        index,
        fd: kick_raw,
    };
    // SAFETY: vq_efd outlives the call.
    if let Err(e) = unsafe { vduse_vq_setup_kickfd(vdev.dev_fd.as_raw_fd(), &vq_efd) } {
        error!("({}) failed to setup kickfd for VQ {index}: {e}", vdev.name);
        vring.state.lock().unwrap().kickfd = VringFd::Uninitialized;
        return;
    }

    if Some(index) == vdev.cvq_index {
        let events_dev = Arc::clone(dev);
        let vid = dev.vid();
        let add = vdev.fdset.add(
            kick_raw,
            Box::new(move |fd, _remove| {
                let mut buf = [0u8; 8];
                let _ = nix::unistd::read(fd, &mut buf);
                debug!("control queue kicked");
                events_dev.events.control_queue_kick(vid);
            }),
        );
        if let Err(e) = add {
            error!(
                "({}) failed to install ctrl queue handler for VQ {index}: {e}",
                vdev.name
            );
            let deassign = VduseVqEventfd {
                index,
                fd: VDUSE_EVENTFD_DEASSIGN,
            };
            // SAFETY: deassign outlives the call.
            let _ = unsafe { vduse_vq_setup_kickfd(vdev.dev_fd.as_raw_fd(), &deassign) };
            vring.state.lock().unwrap().kickfd = VringFd::Uninitialized;
            return;
        }
        vring.state.lock().unwrap().enable_guest_notification(true);
        info!("({}) ctrl queue event handler installed", vdev.name);
    }
}

fn vring_cleanup(vdev: &VduseDev, index: u32) {
    let Some(vring) = vdev.dev.vring(index) else {
        return;
    };

    {
        let vq = vring.state.lock().unwrap();
        if Some(index) == vdev.cvq_index {
            if let Some(fd) = vq.kickfd.as_raw() {
                vdev.fdset.del(fd);
            }
        }
    }

    let deassign = VduseVqEventfd {
        index,
        fd: VDUSE_EVENTFD_DEASSIGN,
    };
    // SAFETY: deassign outlives the call.
    if let Err(e) = unsafe { vduse_vq_setup_kickfd(vdev.dev_fd.as_raw_fd(), &deassign) } {
        error!("({}) failed to cleanup kickfd for VQ {index}: {e}", vdev.name);
    }

    let mut vq = vring.state.lock().unwrap();
    vq.kickfd = VringFd::Uninitialized;
    vq.invalidate();
    vq.shadow_used = ShadowUsed::None;
    vq.batch_copy = Vec::new();
    vq.enabled = false;
    vq.ready = false;
    vq.size = 0;
    vq.last_avail_idx = 0;
    vq.last_used_idx = 0;
    drop(vq);
    vring.iotlb.write().unwrap().flush_all();
}

fn device_start(vdev: &VduseDev, reconnecting: bool) {
    let dev = &vdev.dev;
    info!("({}) starting device", vdev.name);

    let mut features = 0u64;
    // SAFETY: features outlives the call.
    if let Err(e) = unsafe { vduse_dev_get_features(vdev.dev_fd.as_raw_fd(), &mut features) } {
        error!("({}) failed to get features: {e}", vdev.name);
        return;
    }

    if reconnecting && features != vdev.reconnect.features() {
        error!(
            "({}) mismatch between reconnect file features {:#x} and device features {features:#x}",
            vdev.name,
            vdev.reconnect.features()
        );
        return;
    }
    vdev.reconnect.set_features(features);
    info!("({}) negotiated Virtio features: {features:#x}", vdev.name);

    {
        let mut state = dev.state.lock().unwrap();
        state.features = features;
        state.vhost_hlen = net_header_len(features);
    }

    for i in 0..vdev.total_queues {
        vring_setup(vdev, i, reconnecting);
    }

    dev.state.lock().unwrap().flags.insert(DeviceFlags::READY);

    if dev.events.new_device(dev.vid()).is_ok() {
        dev.state
            .lock()
            .unwrap()
            .flags
            .insert(DeviceFlags::RUNNING);
    }

    for i in 0..vdev.total_queues {
        if Some(i) == vdev.cvq_index {
            continue;
        }
        let enabled = dev
            .vring(i)
            .map(|v| v.state.lock().unwrap().enabled)
            .unwrap_or(false);
        dev.events.vring_state_changed(dev.vid(), i, enabled);
    }
}

fn device_stop(vdev: &VduseDev) {
    let dev = &vdev.dev;
    info!("({}) stopping device", vdev.name);

    dev.notify_destroy();
    dev.state.lock().unwrap().flags.remove(DeviceFlags::READY);

    for i in 0..vdev.total_queues {
        vring_cleanup(vdev, i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net0");

        {
            let log = ReconnectLog::create(&path).unwrap();
            log.set_version(VHOST_RECONNECT_VERSION);
            log.set_features(0x1_3000_0000);
            log.set_status(0x0f);
            log.set_nr_vrings(3);
            ReconnectVringHandle::new(Arc::new(log), 2).set_last_avail_idx(77);
        }

        // Creating again over a surviving file is the inconsistency case.
        assert!(matches!(
            ReconnectLog::create(&path),
            Err(Error::InvalidState(_))
        ));

        let log = Arc::new(ReconnectLog::open(&path).unwrap());
        assert_eq!(log.version(), VHOST_RECONNECT_VERSION);
        assert_eq!(log.features(), 0x1_3000_0000);
        assert_eq!(log.status(), 0x0f);
        assert_eq!(log.nr_vrings(), 3);
        let handle = ReconnectVringHandle::new(Arc::clone(&log), 2);
        assert_eq!(handle.last_avail_idx(), 77);
        assert!(!handle.avail_wrap_counter());

        // Consistency checks against the kernel-reported shape.
        assert!(log.check(0x1_3000_0000, 3).is_ok());
        assert!(log.check(0x1_3000_0000, 5).is_err());
        assert!(log.check(0x0000_0000, 3).is_err());
        log.set_version(99);
        assert!(log.check(0x1_3000_0000, 3).is_err());
    }

    #[test]
    fn missing_reconnect_log_rejected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReconnectLog::open(&dir.path().join("gone")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn ready_polling_succeeds_within_budget() {
        let mut calls = 0u32;
        poll_queues_ready(1, 100, Duration::from_micros(10), |_| {
            calls += 1;
            Ok(calls > 3)
        })
        .unwrap();
        assert_eq!(calls, 4);
    }

    #[test]
    fn ready_polling_gives_up() {
        let mut calls = 0u32;
        let err = poll_queues_ready(2, 10, Duration::from_micros(1), |i| {
            calls += 1;
            // Queue 0 flips immediately, queue 1 never does.
            Ok(i == 0)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Vduse(_)));
        assert_eq!(calls, 1 + 10);
    }
}
