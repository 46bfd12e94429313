// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end protocol tests: a test frontend drives a real socket
//! connection against the dispatcher and observes the datapath callbacks.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vhost_backend::features::{
    ProtocolFeatures, VHOST_USER_F_PROTOCOL_FEATURES, VIRTIO_F_IOMMU_PLATFORM,
};
use vhost_backend::message::{
    Endpoint, MasterReq, Message, SlaveReq, VhostUserInflight, VhostUserIotlb, VhostUserLog,
    VhostUserMemory, VhostUserMemoryRegion, VhostUserVringAddr, VhostUserVringState,
    VHOST_ACCESS_RW, VHOST_IOTLB_MISS, VHOST_IOTLB_UPDATE, VHOST_USER_NEED_REPLY,
};
use vhost_backend::{BackendConfig, Device, DeviceRegistry, SocketEndpoint, VhostEvents};
use vmm_sys_util::eventfd::EventFd;

const QVA_BASE: u64 = 0x7f00_0000_0000;
const REGION_SIZE: u64 = 0x4000_0000;

#[derive(Default)]
struct Recorder {
    new_device: AtomicUsize,
    destroy_device: AtomicUsize,
    vring_changes: Mutex<Vec<(u32, bool)>>,
}

impl VhostEvents for Recorder {
    fn new_device(&self, _vid: usize) -> std::io::Result<()> {
        self.new_device.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_device(&self, _vid: usize) {
        self.destroy_device.fetch_add(1, Ordering::SeqCst);
    }

    fn vring_state_changed(&self, _vid: usize, vring: u32, enabled: bool) {
        self.vring_changes.lock().unwrap().push((vring, enabled));
    }
}

struct Frontend {
    ep: Endpoint,
}

impl Frontend {
    fn send(&mut self, msg: &Message, fds: &[RawFd]) {
        self.ep.send_message(msg, fds).unwrap();
    }

    fn request(&mut self, msg: &Message, fds: &[RawFd]) -> Message {
        self.send(msg, fds);
        self.ep.recv_message().unwrap()
    }

    fn send_u64(&mut self, req: MasterReq, val: u64) {
        let mut msg = Message::new(req as u32);
        msg.set_u64(val);
        self.send(&msg, &[]);
    }

    /// Send with NEED_REPLY and return the reply-ack value (0 ok, 1 error).
    fn send_u64_ack(&mut self, req: MasterReq, val: u64) -> u64 {
        let mut msg = Message::new(req as u32);
        msg.flags |= VHOST_USER_NEED_REPLY;
        msg.set_u64(val);
        self.request(&msg, &[]).u64_body()
    }

    fn vring_state(&mut self, req: MasterReq, index: u32, num: u32) {
        let mut msg = Message::new(req as u32);
        msg.set_body(&VhostUserVringState { index, num });
        self.send(&msg, &[]);
    }

    fn vring_state_ack(&mut self, req: MasterReq, index: u32, num: u32) -> u64 {
        let mut msg = Message::new(req as u32);
        msg.flags |= VHOST_USER_NEED_REPLY;
        msg.set_body(&VhostUserVringState { index, num });
        self.request(&msg, &[]).u64_body()
    }

    fn set_mem_table(&mut self, table: &VhostUserMemory, fds: &[RawFd]) {
        let mut msg = Message::new(MasterReq::SetMemTable as u32);
        msg.set_body(table);
        self.send(&msg, fds);
    }

    fn set_vring_addr(&mut self, index: u32, desc: u64, avail: u64, used: u64) {
        let mut msg = Message::new(MasterReq::SetVringAddr as u32);
        msg.set_body(&VhostUserVringAddr {
            index,
            flags: 0,
            desc_user_addr: desc,
            used_user_addr: used,
            avail_user_addr: avail,
            log_guest_addr: 0,
        });
        self.send(&msg, &[]);
    }

    /// Round-trip a replying request so every prior message is processed.
    fn fence(&mut self) -> u64 {
        let msg = Message::new(MasterReq::GetFeatures as u32);
        self.request(&msg, &[]).u64_body()
    }
}

struct Bench {
    _dir: tempfile::TempDir,
    _endpoint: SocketEndpoint,
    registry: Arc<DeviceRegistry>,
    recorder: Arc<Recorder>,
    frontend: Frontend,
    dev: Arc<Device>,
}

fn bench_with(config: BackendConfig) -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let registry = DeviceRegistry::new();
    let recorder = Arc::new(Recorder::default());

    let events: Arc<dyn VhostEvents> = Arc::clone(&recorder) as Arc<dyn VhostEvents>;
    let endpoint = SocketEndpoint::register(&registry, &path, config, events).unwrap();

    let stream = UnixStream::connect(&path).unwrap();
    let frontend = Frontend {
        ep: Endpoint::new(stream),
    };

    // The accept thread allocates the device; wait for the slot.
    let deadline = Instant::now() + Duration::from_secs(5);
    let dev = loop {
        if let Ok(dev) = registry.get(0) {
            break dev;
        }
        assert!(Instant::now() < deadline, "device was never created");
        std::thread::sleep(Duration::from_millis(5));
    };

    Bench {
        _dir: dir,
        _endpoint: endpoint,
        registry,
        recorder,
        frontend,
        dev,
    }
}

fn bench() -> Bench {
    bench_with(BackendConfig::new())
}

fn guest_memfd(size: u64) -> OwnedFd {
    let name = std::ffi::CString::new("guest-mem").unwrap();
    let fd = nix::sys::memfd::memfd_create(&name, nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC)
        .unwrap();
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    nix::unistd::ftruncate(fd.as_raw_fd(), size as i64).unwrap();
    fd
}

fn one_region_table() -> VhostUserMemory {
    let mut table = VhostUserMemory {
        nregions: 1,
        ..Default::default()
    };
    table.regions[0] = VhostUserMemoryRegion {
        guest_phys_addr: 0,
        memory_size: REGION_SIZE,
        userspace_addr: QVA_BASE,
        mmap_offset: 0,
    };
    table
}

/// Drive the canonical fresh-attach sequence up to the kick, returning the
/// eventfds so they outlive the test body.
fn attach_single_queue(bench: &mut Bench) -> (OwnedFd, EventFd, EventFd) {
    let fe = &mut bench.frontend;
    let features = fe.fence();
    assert_ne!(features, 0);

    fe.send_u64(MasterReq::SetFeatures, 0x1_3000_0000);
    let mut owner = Message::new(MasterReq::SetOwner as u32);
    owner.flags |= VHOST_USER_NEED_REPLY;
    assert_eq!(fe.request(&owner, &[]).u64_body(), 0);

    let mem_fd = guest_memfd(REGION_SIZE);
    fe.set_mem_table(&one_region_table(), &[mem_fd.as_raw_fd()]);

    fe.vring_state(MasterReq::SetVringNum, 0, 256);
    fe.set_vring_addr(0, QVA_BASE + 0x10_0000, QVA_BASE + 0x10_2000, QVA_BASE + 0x10_3000);
    fe.vring_state(MasterReq::SetVringBase, 0, 0);

    let call = EventFd::new(0).unwrap();
    let kick = EventFd::new(0).unwrap();
    let mut msg = Message::new(MasterReq::SetVringCall as u32);
    msg.set_u64(0);
    fe.send(&msg, &[call.as_raw_fd()]);
    let mut msg = Message::new(MasterReq::SetVringKick as u32);
    msg.set_u64(0);
    fe.send(&msg, &[kick.as_raw_fd()]);

    fe.fence();
    (mem_fd, call, kick)
}

#[test]
fn fresh_attach_single_queue_starts_datapath() {
    let mut bench = bench();
    let _fds = attach_single_queue(&mut bench);

    assert_eq!(bench.recorder.new_device.load(Ordering::SeqCst), 1);
    assert!(bench.dev.is_running());
    assert!(bench.dev.is_ready());

    let vring = bench.dev.vring(0).unwrap();
    let vq = vring.state.lock().unwrap();
    assert_eq!(vq.size, 256);
    assert_eq!(vq.last_avail_idx, 0);
    assert!(vq.access_ok);
    assert!(vq.enabled);
    assert!(vq.kickfd.as_raw().is_some());
    assert!(vq.callfd.as_raw().is_some());
    drop(vq);

    // The queue readiness edge was reported exactly once.
    let changes = bench.recorder.vring_changes.lock().unwrap();
    assert_eq!(changes.as_slice(), &[(0, true)]);
}

#[test]
fn identical_mem_table_is_a_noop() {
    let mut bench = bench();
    let _fds = attach_single_queue(&mut bench);
    let before = bench.dev.mem().unwrap();

    // A second descriptor for the same layout; contents are irrelevant to
    // the identity check.
    let other_fd = guest_memfd(REGION_SIZE);
    let mut msg = Message::new(MasterReq::SetMemTable as u32);
    msg.flags |= VHOST_USER_NEED_REPLY;
    msg.set_body(&one_region_table());
    let ack = bench.frontend.request(&msg, &[other_fd.as_raw_fd()]);
    assert_eq!(ack.u64_body(), 0);

    // Same mappings, no datapath restart.
    let after = bench.dev.mem().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(bench.recorder.destroy_device.load(Ordering::SeqCst), 0);
    assert_eq!(bench.recorder.new_device.load(Ordering::SeqCst), 1);
}

#[test]
fn feature_change_while_running_is_rejected() {
    let mut bench = bench();
    let _fds = attach_single_queue(&mut bench);
    let hlen = bench.dev.net_header_len();

    // Toggling mergeable RX buffers is not the logging bit.
    let ack = bench
        .frontend
        .send_u64_ack(MasterReq::SetFeatures, 0x1_3000_0000 ^ (1 << 15));
    assert_eq!(ack, 1);
    assert_eq!(bench.dev.features(), 0x1_3000_0000);
    assert_eq!(bench.dev.net_header_len(), hlen);

    // Re-acking the same features while running is fine.
    let ack = bench
        .frontend
        .send_u64_ack(MasterReq::SetFeatures, 0x1_3000_0000);
    assert_eq!(ack, 0);
}

#[test]
fn iotlb_miss_then_update_resolves_translation() {
    let mut bench = bench();
    let fe = &mut bench.frontend;

    let features =
        (1u64 << 32) | (1 << VIRTIO_F_IOMMU_PLATFORM) | (1 << VHOST_USER_F_PROTOCOL_FEATURES);
    fe.send_u64(MasterReq::SetFeatures, features);
    fe.send_u64(
        MasterReq::SetProtocolFeatures,
        (ProtocolFeatures::SLAVE_REQ | ProtocolFeatures::REPLY_ACK).bits(),
    );

    let (slave_ours, slave_theirs) = UnixStream::pair().unwrap();
    let mut msg = Message::new(MasterReq::SetSlaveReqFd as u32);
    msg.set_u64(0);
    fe.send(&msg, &[slave_theirs.as_raw_fd()]);
    drop(slave_theirs);

    let mem_fd = guest_memfd(REGION_SIZE);
    fe.set_mem_table(&one_region_table(), &[mem_fd.as_raw_fd()]);
    fe.vring_state(MasterReq::SetVringNum, 0, 4);
    fe.vring_state(MasterReq::SetVringEnable, 0, 1);
    // Ring addresses are I/O virtual now.
    fe.set_vring_addr(0, 0x1000, 0x3000, 0x5000);
    fe.fence();

    // The translation attempt must have asked for the descriptor ring.
    let mut slave = Endpoint::new(slave_ours);
    let miss = slave.recv_message().unwrap();
    assert_eq!(miss.request, SlaveReq::IotlbMsg as u32);
    let body: VhostUserIotlb = miss.body();
    assert_eq!(body.msg_type, VHOST_IOTLB_MISS);
    assert_eq!(body.iova, 0x1000);
    assert_eq!(body.perm, VHOST_ACCESS_RW);

    // Answer with one update covering all three rings.
    let mut update = Message::new(MasterReq::IotlbMsg as u32);
    update.set_body(&VhostUserIotlb {
        iova: 0x1000,
        size: 0x5000,
        uaddr: QVA_BASE + 0x1000,
        perm: VHOST_ACCESS_RW,
        msg_type: VHOST_IOTLB_UPDATE,
        ..Default::default()
    });
    fe.send(&update, &[]);

    let call = EventFd::new(0).unwrap();
    let kick = EventFd::new(0).unwrap();
    let mut msg = Message::new(MasterReq::SetVringCall as u32);
    msg.set_u64(0);
    fe.send(&msg, &[call.as_raw_fd()]);
    let mut msg = Message::new(MasterReq::SetVringKick as u32);
    msg.set_u64(0);
    fe.send(&msg, &[kick.as_raw_fd()]);
    fe.fence();

    let vring = bench.dev.vring(0).unwrap();
    assert!(vring.state.lock().unwrap().access_ok);
    assert_eq!(bench.recorder.new_device.load(Ordering::SeqCst), 1);

    // The datapath lookup now resolves without further misses.
    let hva = bench.dev.mem().unwrap().regions()[0].host_user_addr;
    let mut size = 0x40;
    assert_eq!(
        bench
            .dev
            .iova_to_vva(&vring, 0x1000, &mut size, VHOST_ACCESS_RW),
        Some(hva + 0x1000)
    );
}

#[test]
fn inflight_region_roundtrip_yields_no_resubmit() {
    let mut bench = bench();
    let fe = &mut bench.frontend;

    fe.send_u64(
        MasterReq::SetFeatures,
        (1u64 << 32) | (1 << VHOST_USER_F_PROTOCOL_FEATURES),
    );
    fe.send_u64(
        MasterReq::SetProtocolFeatures,
        (ProtocolFeatures::INFLIGHT_SHMFD | ProtocolFeatures::REPLY_ACK).bits(),
    );

    let mut get = Message::new(MasterReq::GetInflightFd as u32);
    get.set_body(&VhostUserInflight {
        num_queues: 1,
        queue_size: 4,
        ..Default::default()
    });
    let mut reply = fe.request(&get, &[]);
    let returned: VhostUserInflight = reply.body();
    assert!(returned.mmap_size > 0);
    assert_eq!(reply.fds.len(), 1);
    let region_fd = reply.take_fd().unwrap();

    let mut set = Message::new(MasterReq::SetInflightFd as u32);
    set.flags |= VHOST_USER_NEED_REPLY;
    set.set_body(&returned);
    assert_eq!(fe.request(&set, &[region_fd.as_raw_fd()]).u64_body(), 0);

    let mem_fd = guest_memfd(REGION_SIZE);
    fe.set_mem_table(&one_region_table(), &[mem_fd.as_raw_fd()]);
    fe.vring_state(MasterReq::SetVringNum, 0, 4);
    fe.vring_state(MasterReq::SetVringEnable, 0, 1);
    fe.set_vring_addr(0, QVA_BASE + 0x1000, QVA_BASE + 0x3000, QVA_BASE + 0x5000);

    let call = EventFd::new(0).unwrap();
    let kick = EventFd::new(0).unwrap();
    let mut msg = Message::new(MasterReq::SetVringCall as u32);
    msg.set_u64(0);
    fe.send(&msg, &[call.as_raw_fd()]);
    let mut msg = Message::new(MasterReq::SetVringKick as u32);
    msg.set_u64(0);
    fe.send(&msg, &[kick.as_raw_fd()]);
    fe.fence();

    let vring = bench.dev.vring(0).unwrap();
    let vq = vring.state.lock().unwrap();
    let inflight = vq.inflight.as_ref().expect("inflight attached");
    assert_eq!(inflight.desc_num, 4);
    assert!(vq.resubmit.is_none());
}

#[test]
fn vring_num_bounds() {
    let mut bench = bench();
    // Above the virtio maximum.
    assert_eq!(
        bench
            .frontend
            .vring_state_ack(MasterReq::SetVringNum, 0, 32769),
        1
    );
    // Split rings must be a power of two.
    assert_eq!(
        bench
            .frontend
            .vring_state_ack(MasterReq::SetVringNum, 0, 0x1001),
        1
    );
    assert_eq!(
        bench.frontend.vring_state_ack(MasterReq::SetVringNum, 0, 256),
        0
    );
}

#[test]
fn mem_table_region_cap() {
    let mut bench = bench();
    let mut table = one_region_table();
    table.nregions = 9;
    let mut msg = Message::new(MasterReq::SetMemTable as u32);
    msg.flags |= VHOST_USER_NEED_REPLY;
    msg.set_body(&table);
    // Nine claimed regions cannot match the eight descriptors the wire
    // permits; the backend acks failure without touching state.
    let fd = guest_memfd(0x1000);
    let ack = bench.frontend.request(&msg, &[fd.as_raw_fd()]);
    assert_eq!(ack.u64_body(), 1);
    assert!(bench.dev.mem().is_none());
}

#[test]
fn log_base_offset_overflow() {
    let mut bench = bench();
    let fd = guest_memfd(0x1000);
    let mut msg = Message::new(MasterReq::SetLogBase as u32);
    msg.flags |= VHOST_USER_NEED_REPLY;
    msg.set_body(&VhostUserLog {
        mmap_size: 0x20,
        mmap_offset: 0xffff_ffff_ffff_fff0,
    });
    let ack = bench.frontend.request(&msg, &[fd.as_raw_fd()]);
    assert_eq!(ack.u64_body(), 1);
}

#[test]
fn invalid_features_latch_failure_and_strip_features_ok() {
    let mut bench = bench();
    // Bit 63 is never advertised.
    assert_eq!(bench.frontend.send_u64_ack(MasterReq::SetFeatures, 1 << 63), 1);

    // ACKNOWLEDGE | DRIVER | FEATURES_OK.
    assert_eq!(bench.frontend.send_u64_ack(MasterReq::SetStatus, 0x0b), 0);
    let status = {
        let msg = Message::new(MasterReq::GetStatus as u32);
        bench.frontend.request(&msg, &[]).u64_body()
    };
    assert_eq!(status, 0x03, "FEATURES_OK must be stripped after the failed negotiation");

    // A clean renegotiation recovers.
    assert_eq!(bench.frontend.send_u64_ack(MasterReq::SetFeatures, 1 << 32), 0);
    assert_eq!(bench.frontend.send_u64_ack(MasterReq::SetStatus, 0x0b), 0);
    let status = {
        let msg = Message::new(MasterReq::GetStatus as u32);
        bench.frontend.request(&msg, &[]).u64_body()
    };
    assert_eq!(status, 0x0b);
}

#[test]
fn get_vring_base_stops_the_queue() {
    let mut bench = bench();
    let _fds = attach_single_queue(&mut bench);

    bench.frontend.vring_state(MasterReq::SetVringBase, 0, 5);
    bench.frontend.fence();
    // SET_VRING_BASE is rejected only above the handler level; the stored
    // index must round-trip through the stop message.
    let mut msg = Message::new(MasterReq::GetVringBase as u32);
    msg.set_body(&VhostUserVringState { index: 0, num: 0 });
    let reply = bench.frontend.request(&msg, &[]);
    let state: VhostUserVringState = reply.body();
    assert_eq!(state.num, 5);

    assert_eq!(bench.recorder.destroy_device.load(Ordering::SeqCst), 1);
    assert!(!bench.dev.is_running());

    let vring = bench.dev.vring(0).unwrap();
    let vq = vring.state.lock().unwrap();
    assert!(!vq.kickfd.is_initialized());
    assert!(!vq.callfd.is_initialized());
    assert!(!vq.access_ok);
}

#[test]
fn reply_ack_on_enable() {
    let mut bench = bench();
    bench.frontend.vring_state(MasterReq::SetVringNum, 0, 8);
    assert_eq!(
        bench
            .frontend
            .vring_state_ack(MasterReq::SetVringEnable, 0, 1),
        0
    );
    // Out-of-range vring index is refused.
    assert_eq!(
        bench
            .frontend
            .vring_state_ack(MasterReq::SetVringEnable, 0x1000, 1),
        1
    );
}

#[test]
fn postcopy_listen_ordering() {
    {
        let mut bench = bench();
        let mut msg = Message::new(MasterReq::PostcopyListen as u32);
        msg.flags |= VHOST_USER_NEED_REPLY;
        assert_eq!(bench.frontend.request(&msg, &[]).u64_body(), 0);

        let end = Message::new(MasterReq::PostcopyEnd as u32);
        let reply = bench.frontend.request(&end, &[]);
        assert_eq!(reply.u64_body(), 0);
    }

    // Listening after memory is installed is an ordering violation.
    let mut bench = bench();
    let mem_fd = guest_memfd(REGION_SIZE);
    bench
        .frontend
        .set_mem_table(&one_region_table(), &[mem_fd.as_raw_fd()]);
    let mut msg = Message::new(MasterReq::PostcopyListen as u32);
    msg.flags |= VHOST_USER_NEED_REPLY;
    assert_eq!(bench.frontend.request(&msg, &[]).u64_body(), 1);
}

#[test]
fn rarp_and_mtu() {
    let mut bench = bench();
    let mac = [0x52u8, 0x54, 0x00, 0xaa, 0xbb, 0xcc];
    let mut qword = [0u8; 8];
    qword[..6].copy_from_slice(&mac);
    assert_eq!(
        bench
            .frontend
            .send_u64_ack(MasterReq::SendRarp, u64::from_le_bytes(qword)),
        0
    );
    assert_eq!(bench.dev.mac(), mac);
    assert!(bench
        .dev
        .broadcast_rarp
        .load(std::sync::atomic::Ordering::Acquire));

    assert_eq!(bench.frontend.send_u64_ack(MasterReq::NetSetMtu, 1500), 0);
    assert_eq!(bench.dev.mtu(), 1500);
    assert_eq!(bench.frontend.send_u64_ack(MasterReq::NetSetMtu, 10), 1);
    assert_eq!(bench.dev.mtu(), 1500);
}

#[test]
fn reset_owner_resets_but_keeps_the_connection() {
    let mut bench = bench();
    let _fds = attach_single_queue(&mut bench);
    assert!(bench.dev.is_running());

    let mut msg = Message::new(MasterReq::ResetOwner as u32);
    msg.flags |= VHOST_USER_NEED_REPLY;
    assert_eq!(bench.frontend.request(&msg, &[]).u64_body(), 0);

    assert_eq!(bench.recorder.destroy_device.load(Ordering::SeqCst), 1);
    assert!(!bench.dev.is_running());
    assert_eq!(bench.dev.features(), 0);
    // The device slot and the connection both survive.
    assert!(bench.registry.get(0).is_ok());
    assert_ne!(bench.frontend.fence(), 0);
}

#[test]
fn protocol_feature_subset_enforced() {
    let mut bench = bench();
    let advertised = {
        let msg = Message::new(MasterReq::GetProtocolFeatures as u32);
        bench.frontend.request(&msg, &[]).u64_body()
    };
    assert_eq!(advertised, ProtocolFeatures::supported().bits());

    // CRYPTO_SESSION is not advertised by the net backend.
    assert_eq!(
        bench.frontend.send_u64_ack(
            MasterReq::SetProtocolFeatures,
            ProtocolFeatures::CRYPTO_SESSION.bits()
        ),
        1
    );
    assert_eq!(
        bench
            .frontend
            .send_u64_ack(MasterReq::SetProtocolFeatures, advertised),
        0
    );
    assert_eq!(bench.dev.protocol_features(), ProtocolFeatures::supported());
}

#[test]
fn disconnect_destroys_the_device() {
    let bench = bench();
    let registry = Arc::clone(&bench.registry);
    drop(bench.frontend);

    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.get(0).is_ok() {
        assert!(Instant::now() < deadline, "device slot was never released");
        std::thread::sleep(Duration::from_millis(5));
    }
}
