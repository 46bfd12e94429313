// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! The vhost-user message dispatcher: one instance per frontend connection,
//! running on that connection's control thread. Also home to the slave
//! channel, the reverse direction on which the backend itself issues
//! requests.
//!
//! Nothing read from the socket is trusted; see the module notes in
//! [`crate::message`].

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, MutexGuard};

use log::{debug, error, info, warn};
use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use virtio_bindings::virtio_net::VIRTIO_NET_F_MQ;
use virtio_bindings::virtio_ring::{vring_avail, vring_desc, vring_used, vring_used_elem};

use crate::config::{BackendConfig, MsgResult};
use crate::device::{device_is_ready_locked, Device, DeviceState, Transport};
use crate::dirty_log::{DirtyLog, LogCache};
use crate::features::{
    net_header_len, ring_is_packed, DeviceFlags, DeviceStatus, ProtocolFeatures, VHOST_F_LOG_ALL,
    VHOST_USER_F_PROTOCOL_FEATURES,
};
use crate::inflight::{
    init_packed_region, pervq_size_packed, pervq_size_split, InflightRegion, QueueInflight,
};
use crate::memory::MemoryTable;
use crate::message::{
    Endpoint, MasterReq, Message, SlaveReq, VhostUserInflight, VhostUserIotlb, VhostUserLog,
    VhostUserMemory, VhostUserVringAddr, VhostUserVringArea, VhostUserVringState,
    VHOST_IOTLB_INVALIDATE, VHOST_IOTLB_MISS, VHOST_IOTLB_UPDATE, VHOST_MEMORY_MAX_NREGIONS,
    VHOST_USER_VRING_IDX_MASK, VHOST_USER_VRING_NOFD_MASK, VHOST_VRING_F_LOG,
};
use crate::postcopy::Userfaultfd;
use crate::virtqueue::{
    check_queue_inflights_packed, check_queue_inflights_split, translate_rings, BatchCopyElem,
    ShadowUsed, Vring, VringFd, VringState, VHOST_MAX_VRING, VHOST_MAX_VRING_SIZE,
};
use crate::{Error, Result};

const VIRTIO_MIN_MTU: u64 = 68;
const VIRTIO_MAX_MTU: u64 = 65535;

/// The backend-initiated request channel installed by `SET_SLAVE_REQ_FD`.
/// The owning mutex serializes each request with the ack that may follow.
pub struct SlaveChannel {
    endpoint: Endpoint,
}

impl SlaveChannel {
    pub fn new(fd: OwnedFd) -> Self {
        SlaveChannel {
            endpoint: Endpoint::from_fd(fd),
        }
    }

    fn request(&mut self, msg: &mut Message, fds: &[RawFd]) -> Result<()> {
        let need_reply = msg.need_reply();
        self.endpoint.send_message(msg, fds)?;
        if !need_reply {
            return Ok(());
        }

        let reply = self.endpoint.recv_message()?;
        if reply.request != msg.request {
            error!(
                "received unexpected slave reply type {}, expected {}",
                reply.request, msg.request
            );
            return Err(Error::BackendChannel);
        }
        if reply.u64_body() != 0 {
            return Err(Error::BackendChannel);
        }
        Ok(())
    }
}

/// Ask the frontend for a translation of `iova`. Fire-and-forget: the
/// answer arrives later as an `IOTLB_MSG` update on the main channel.
pub(crate) fn slave_iotlb_miss(dev: &Device, iova: u64, perm: u8) -> Result<()> {
    let mut guard = dev.slave.lock().unwrap();
    let channel = guard
        .as_mut()
        .ok_or(Error::InvalidState("no slave channel"))?;

    let mut msg = Message::new(SlaveReq::IotlbMsg as u32);
    msg.set_body(&VhostUserIotlb {
        iova,
        perm,
        msg_type: VHOST_IOTLB_MISS,
        ..Default::default()
    });
    channel.request(&mut msg, &[])
}

/// Tell the frontend the device configuration changed.
pub fn slave_config_change(dev: &Device, need_reply: bool) -> Result<()> {
    let mut guard = dev.slave.lock().unwrap();
    let channel = guard
        .as_mut()
        .ok_or(Error::InvalidState("no slave channel"))?;

    let mut msg = Message::new(SlaveReq::ConfigChangeMsg as u32);
    if need_reply {
        msg.flags |= crate::message::VHOST_USER_NEED_REPLY;
    }
    channel.request(&mut msg, &[])
}

fn slave_set_vring_host_notifier(
    dev: &Device,
    index: u32,
    fd: Option<RawFd>,
    offset: u64,
    size: u64,
) -> Result<()> {
    let mut guard = dev.slave.lock().unwrap();
    let channel = guard
        .as_mut()
        .ok_or(Error::InvalidState("no slave channel"))?;

    let mut msg = Message::new(SlaveReq::VringHostNotifierMsg as u32);
    msg.flags |= crate::message::VHOST_USER_NEED_REPLY;
    let mut area = VhostUserVringArea {
        u64_: index as u64 & VHOST_USER_VRING_IDX_MASK,
        size,
        offset,
    };
    let fds: Vec<RawFd> = match fd {
        Some(fd) => vec![fd],
        None => {
            area.u64_ |= VHOST_USER_VRING_NOFD_MASK;
            Vec::new()
        }
    };
    msg.set_body(&area);
    channel.request(&mut msg, &fds)
}

/// Install (or remove) VFIO notify areas for the attached vDPA device's
/// queues through the slave channel.
pub fn host_notifier_ctrl(dev: &Device, qid: Option<u32>, enable: bool) -> Result<()> {
    let (features, protocol_features, nr_vring, vdpa) = {
        let state = dev.state.lock().unwrap();
        (
            state.features,
            state.protocol_features,
            state.nr_vring as u32,
            state.vdpa.clone(),
        )
    };
    let vdpa = vdpa.ok_or(Error::InvalidState("no vdpa device attached"))?;

    if features & (1 << VIRTIO_F_VERSION_1) == 0
        || features & (1 << VHOST_USER_F_PROTOCOL_FEATURES) == 0
        || !protocol_features.contains(
            ProtocolFeatures::SLAVE_REQ
                | ProtocolFeatures::SLAVE_SEND_FD
                | ProtocolFeatures::HOST_NOTIFIER,
        )
    {
        return Err(Error::InvalidState("host notifier not negotiated"));
    }

    let (first, last) = match qid {
        Some(q) if q >= nr_vring => return Err(Error::InvalidVringIndex(q)),
        Some(q) => (q, q),
        None => (0, nr_vring.saturating_sub(1)),
    };

    let vfio_fd = vdpa
        .get_vfio_device_fd(dev.vid())
        .ok_or(Error::InvalidState("no vfio device fd"))?;

    if enable {
        for q in first..=last {
            let Some((offset, size)) = vdpa.get_notify_area(dev.vid(), q) else {
                disable_host_notifiers(dev, first, last);
                return Err(Error::InvalidState("no notify area"));
            };
            if slave_set_vring_host_notifier(dev, q, Some(vfio_fd), offset, size).is_err() {
                disable_host_notifiers(dev, first, last);
                return Err(Error::BackendChannel);
            }
        }
        Ok(())
    } else {
        disable_host_notifiers(dev, first, last);
        Ok(())
    }
}

fn disable_host_notifiers(dev: &Device, first: u32, last: u32) {
    for q in first..=last {
        let _ = slave_set_vring_host_notifier(dev, q, None, 0, 0);
    }
}

/// The socket transport's backend operations.
pub(crate) struct VhostUserTransport;

impl Transport for VhostUserTransport {
    fn iotlb_miss(&self, dev: &Device, iova: u64, perm: u8) -> Result<()> {
        slave_iotlb_miss(dev, iova, perm)
    }

    fn inject_irq(&self, _dev: &Device, vq: &VringState) -> Result<()> {
        if let Some(fd) = vq.callfd.as_raw() {
            nix::unistd::write(fd, &1u64.to_ne_bytes())?;
        }
        Ok(())
    }
}

/// Queue-lock window for one message: either every queue's guard taken
/// up front in index order, or locks taken per access.
struct VringAccess<'a> {
    vrings: &'a [Option<Arc<Vring>>],
    guards: Option<Vec<Option<MutexGuard<'a, VringState>>>>,
}

impl<'a> VringAccess<'a> {
    fn new(vrings: &'a [Option<Arc<Vring>>], lock_all: bool) -> Self {
        let guards = lock_all.then(|| {
            vrings
                .iter()
                .map(|v| v.as_ref().map(|v| v.state.lock().unwrap()))
                .collect()
        });
        VringAccess { vrings, guards }
    }

    fn vring(&self, index: u32) -> Option<&'a Arc<Vring>> {
        self.vrings.get(index as usize)?.as_ref()
    }

    fn with<R>(&mut self, index: u32, f: impl FnOnce(&mut VringState) -> R) -> Option<R> {
        let idx = index as usize;
        match &mut self.guards {
            Some(guards) => guards.get_mut(idx)?.as_mut().map(|g| f(g)),
            None => {
                let vring = self.vrings.get(idx)?.as_ref()?;
                let mut state = vring.state.lock().unwrap();
                Some(f(&mut state))
            }
        }
    }
}

/// Requests that mutate queue state the datapath may concurrently touch;
/// the dispatcher takes every queue's access lock for these.
/// `GET_VRING_BASE` and `RESET_OWNER` are deliberately absent: they
/// synchronize with the datapath through `destroy_device` themselves.
fn requires_vring_locks(req: MasterReq) -> bool {
    matches!(
        req,
        MasterReq::SetFeatures
            | MasterReq::SetProtocolFeatures
            | MasterReq::SetOwner
            | MasterReq::SetMemTable
            | MasterReq::SetLogBase
            | MasterReq::SetLogFd
            | MasterReq::SetVringNum
            | MasterReq::SetVringAddr
            | MasterReq::SetVringBase
            | MasterReq::SetVringKick
            | MasterReq::SetVringCall
            | MasterReq::SetVringErr
            | MasterReq::SetVringEnable
            | MasterReq::SendRarp
            | MasterReq::NetSetMtu
            | MasterReq::SetSlaveReqFd
    )
}

/// One frontend connection and its dispatcher state.
pub struct Connection {
    dev: Arc<Device>,
    endpoint: Endpoint,
    config: Arc<BackendConfig>,
    /// Descriptors to attach to the pending reply; borrowed from device
    /// state, never owned here.
    reply_fds: Vec<RawFd>,
}

impl Connection {
    pub fn new(dev: Arc<Device>, sock: UnixStream, config: Arc<BackendConfig>) -> Self {
        Connection {
            dev,
            endpoint: Endpoint::new(sock),
            config,
            reply_fds: Vec::new(),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Serve messages until the peer goes away or the connection becomes
    /// unusable. The caller owns device teardown.
    pub fn run(&mut self) {
        loop {
            match self.handle_message() {
                Ok(()) => {}
                Err(Error::Disconnected) => {
                    info!("({}) vhost peer closed", self.dev.ifname());
                    return;
                }
                Err(e) => {
                    error!("({}) connection failed: {e}", self.dev.ifname());
                    return;
                }
            }
        }
    }

    fn st(&self) -> MutexGuard<'_, DeviceState> {
        self.dev.state.lock().unwrap()
    }

    /// Read and fully process one message.
    pub fn handle_message(&mut self) -> Result<()> {
        let mut msg = self.endpoint.recv_message()?;
        let request = msg.request;
        let req = MasterReq::from_raw(request);

        match req {
            Some(MasterReq::IotlbMsg) => {
                debug!("({}) read message {}", self.dev.ifname(), MasterReq::name(request))
            }
            Some(_) => {
                info!("({}) read message {}", self.dev.ifname(), MasterReq::name(request))
            }
            None => debug!("({}) external request {request}", self.dev.ifname()),
        }

        // Allocate the addressed queue record before anything can touch it.
        if let Err(e) = self.check_and_alloc_queue(req, &msg) {
            warn!("({}) {e}", self.dev.ifname());
            msg.close_fds();
            return self.finish_error(&mut msg);
        }

        let (lock_all, vrings) = {
            let state = self.st();
            let lock_all = req.map(requires_vring_locks).unwrap_or(false)
                && !state.flags.contains(DeviceFlags::VDPA_CONFIGURED);
            (lock_all, state.vrings.clone())
        };
        let mut access = VringAccess::new(&vrings, lock_all);

        self.reply_fds.clear();
        let mut handled = false;

        let mut result = self.dev.events.pre_msg_handle(self.dev.vid(), &mut msg);
        match result {
            MsgResult::Reply => {
                self.endpoint.send_reply(&mut msg, &[])?;
                handled = true;
            }
            MsgResult::Ok | MsgResult::Err => handled = true,
            MsgResult::NotHandled => {}
        }

        if !handled {
            if let Some(req) = req {
                result = self.dispatch(req, &mut msg, &mut access)?;
                match result {
                    MsgResult::Err => {
                        error!(
                            "({}) processing {} failed",
                            self.dev.ifname(),
                            MasterReq::name(request)
                        );
                        handled = true;
                    }
                    MsgResult::Ok => {
                        debug!(
                            "({}) processing {} succeeded",
                            self.dev.ifname(),
                            MasterReq::name(request)
                        );
                        handled = true;
                    }
                    MsgResult::Reply => {
                        debug!(
                            "({}) processing {} succeeded and needs reply",
                            self.dev.ifname(),
                            MasterReq::name(request)
                        );
                        let fds = std::mem::take(&mut self.reply_fds);
                        self.endpoint.send_reply(&mut msg, &fds)?;
                        handled = true;
                    }
                    MsgResult::NotHandled => {}
                }
            }
        }

        if result != MsgResult::Err {
            match self.dev.events.post_msg_handle(self.dev.vid(), &mut msg) {
                MsgResult::Reply => {
                    self.endpoint.send_reply(&mut msg, &[])?;
                    handled = true;
                }
                MsgResult::Ok | MsgResult::Err => handled = true,
                MsgResult::NotHandled => {}
            }
        }

        if !handled {
            error!(
                "({}) vhost message (req: {request}) was not handled",
                self.dev.ifname()
            );
            msg.close_fds();
            result = MsgResult::Err;
        }

        // The optional reply-ack; a handler that already replied cleared
        // NEED_REPLY on its way out.
        if msg.need_reply() {
            msg.set_u64((result == MsgResult::Err) as u64);
            msg.fds.clear();
            self.endpoint.send_reply(&mut msg, &[])?;
        }

        self.sync_queue_readiness(&mut access);
        drop(access);

        self.check_device_ready();
        Ok(())
    }

    fn finish_error(&mut self, msg: &mut Message) -> Result<()> {
        if msg.need_reply() {
            msg.set_u64(1);
            self.endpoint.send_reply(msg, &[])?;
        }
        Ok(())
    }

    fn check_and_alloc_queue(&self, req: Option<MasterReq>, msg: &Message) -> Result<()> {
        let vring_idx = match req {
            Some(MasterReq::SetVringKick)
            | Some(MasterReq::SetVringCall)
            | Some(MasterReq::SetVringErr) => {
                (msg.u64_body() & VHOST_USER_VRING_IDX_MASK) as u32
            }
            Some(MasterReq::SetVringNum)
            | Some(MasterReq::SetVringBase)
            | Some(MasterReq::GetVringBase)
            | Some(MasterReq::SetVringEnable) => msg.body::<VhostUserVringState>().index,
            Some(MasterReq::SetVringAddr) => msg.body::<VhostUserVringAddr>().index,
            Some(MasterReq::SetInflightFd) => {
                let inflight: VhostUserInflight = msg.body();
                match inflight.num_queues {
                    0 => return Ok(()),
                    n => (n - 1) as u32,
                }
            }
            _ => return Ok(()),
        };

        if vring_idx >= VHOST_MAX_VRING {
            return Err(Error::InvalidVringIndex(vring_idx));
        }
        self.st().ensure_vring(vring_idx)?;
        Ok(())
    }

    fn dispatch(
        &mut self,
        req: MasterReq,
        msg: &mut Message,
        access: &mut VringAccess,
    ) -> Result<MsgResult> {
        match req {
            MasterReq::GetFeatures => self.get_features(msg),
            MasterReq::SetFeatures => self.set_features(msg, access),
            MasterReq::SetOwner => self.set_owner(msg),
            MasterReq::ResetOwner => self.reset_owner(msg),
            MasterReq::SetMemTable => self.set_mem_table(msg, access),
            MasterReq::SetLogBase => self.set_log_base(msg, access),
            MasterReq::SetLogFd => self.set_log_fd(msg),
            MasterReq::SetVringNum => self.set_vring_num(msg, access),
            MasterReq::SetVringAddr => self.set_vring_addr(msg, access),
            MasterReq::SetVringBase => self.set_vring_base(msg, access),
            MasterReq::GetVringBase => self.get_vring_base(msg, access),
            MasterReq::SetVringKick => self.set_vring_kick(msg, access),
            MasterReq::SetVringCall => self.set_vring_call(msg, access),
            MasterReq::SetVringErr => self.set_vring_err(msg, access),
            MasterReq::GetProtocolFeatures => self.get_protocol_features(msg),
            MasterReq::SetProtocolFeatures => self.set_protocol_features(msg),
            MasterReq::GetQueueNum => self.get_queue_num(msg),
            MasterReq::SetVringEnable => self.set_vring_enable(msg, access),
            MasterReq::SendRarp => self.send_rarp(msg),
            MasterReq::NetSetMtu => self.net_set_mtu(msg),
            MasterReq::SetSlaveReqFd => self.set_slave_req_fd(msg),
            MasterReq::IotlbMsg => self.iotlb_msg(msg, access),
            MasterReq::PostcopyAdvise => self.postcopy_advise(msg),
            MasterReq::PostcopyListen => self.postcopy_listen(msg),
            MasterReq::PostcopyEnd => self.postcopy_end(msg),
            MasterReq::GetInflightFd => self.get_inflight_fd(msg),
            MasterReq::SetInflightFd => self.set_inflight_fd(msg, access),
            MasterReq::SetStatus => self.set_status(msg),
            MasterReq::GetStatus => self.get_status(msg),
        }
    }

    fn get_features(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        msg.set_u64(self.config.features);
        Ok(MsgResult::Reply)
    }

    fn get_queue_num(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        msg.set_u64(self.config.queue_pairs as u64);
        Ok(MsgResult::Reply)
    }

    fn set_features(&mut self, msg: &mut Message, _access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let features = msg.u64_body();

        if features & !self.config.features != 0 {
            error!("({}) received invalid negotiated features", self.dev.ifname());
            let mut state = self.st();
            state.flags.insert(DeviceFlags::FEATURES_FAILED);
            state.status.remove(DeviceStatus::FEATURES_OK);
            return Ok(MsgResult::Err);
        }

        let (running, current) = {
            let state = self.st();
            (state.flags.contains(DeviceFlags::RUNNING), state.features)
        };
        if running {
            if current == features {
                return Ok(MsgResult::Ok);
            }
            // Only the live-migration logging bit may flip on a running
            // device.
            if (current ^ features) & !(1 << VHOST_F_LOG_ALL) != 0 {
                error!(
                    "({}) features changed while device is running",
                    self.dev.ifname()
                );
                return Ok(MsgResult::Err);
            }
            self.dev.events.features_changed(self.dev.vid(), features);
        }

        let trimmed: Vec<Arc<Vring>> = {
            let mut state = self.st();
            state.features = features;
            state.vhost_hlen = net_header_len(features);

            let mut trimmed = Vec::new();
            if features & (1 << VIRTIO_NET_F_MQ) == 0 {
                // Without multiqueue only the first pair may stay; safe
                // because the device is not running at this point.
                while state.nr_vring > 2 {
                    state.nr_vring -= 1;
                    let idx = state.nr_vring;
                    if let Some(vq) = state.vrings[idx].take() {
                        trimmed.push(vq);
                    }
                }
                state.vrings.truncate(2);
            }
            state.flags.remove(DeviceFlags::FEATURES_FAILED);
            trimmed
        };
        drop(trimmed);

        info!(
            "({}) negotiated Virtio features: {features:#x}",
            self.dev.ifname()
        );

        let vdpa = self.st().vdpa.clone();
        if let Some(vdpa) = vdpa {
            vdpa.set_features(self.dev.vid());
        }
        Ok(MsgResult::Ok)
    }

    fn get_protocol_features(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        msg.set_u64(self.config.protocol_features.bits());
        Ok(MsgResult::Reply)
    }

    fn set_protocol_features(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let requested = msg.u64_body();
        if requested & !self.config.protocol_features.bits() != 0 {
            error!("({}) received invalid protocol features", self.dev.ifname());
            return Ok(MsgResult::Err);
        }
        let features = ProtocolFeatures::from_bits_truncate(requested);
        self.st().protocol_features = features;
        info!(
            "({}) negotiated vhost-user protocol features: {requested:#x}",
            self.dev.ifname()
        );
        Ok(MsgResult::Ok)
    }

    fn set_owner(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        Ok(MsgResult::Ok)
    }

    fn reset_owner(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        warn!(
            "({}) RESET_OWNER is deprecated, consider a fresh connection instead",
            self.dev.ifname()
        );
        self.dev.notify_destroy();
        self.dev.cleanup(false);
        self.dev.reset();
        Ok(MsgResult::Ok)
    }

    fn set_mem_table(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        let memory: VhostUserMemory = msg.body();
        if msg.expect_fds(memory.nregions as usize).is_err() {
            return Ok(MsgResult::Err);
        }
        if memory.nregions as usize > VHOST_MEMORY_MAX_NREGIONS {
            error!(
                "({}) too many memory regions ({})",
                self.dev.ifname(),
                memory.nregions
            );
            msg.close_fds();
            return Ok(MsgResult::Err);
        }

        // Hot-reconnect path: a byte-identical table keeps the mappings.
        {
            let state = self.st();
            if let Some(mem) = &state.mem {
                if mem.matches(&memory) {
                    info!("({}) memory regions not changed", self.dev.ifname());
                    msg.close_fds();
                    return Ok(MsgResult::Ok);
                }
            }
        }

        let mut async_notify = false;
        let had_mem = self.st().mem.is_some();
        if had_mem {
            let (vdpa_configured, vdpa, async_copy, nr_vring) = {
                let mut state = self.st();
                let configured = state.flags.contains(DeviceFlags::VDPA_CONFIGURED);
                state.flags.remove(DeviceFlags::VDPA_CONFIGURED);
                (
                    configured,
                    state.vdpa.clone(),
                    state.async_copy,
                    state.nr_vring as u32,
                )
            };
            if vdpa_configured {
                if let Some(vdpa) = vdpa {
                    vdpa.dev_close(self.dev.vid());
                }
            }
            // Quiesce asynchronous DMA before the mappings go away.
            if async_copy {
                for i in 0..nr_vring {
                    self.dev
                        .events
                        .vring_state_changed(self.dev.vid(), i, false);
                }
                async_notify = true;
            }
            self.st().mem = None;
        }

        // Previous host-virtual addresses are meaningless now.
        let (features, populate) = {
            let state = self.st();
            if crate::features::has_iommu(state.features) {
                Device::flush_iotlb_all(&state);
            }
            (state.features, state.async_copy)
        };

        // New allocations follow queue 0's node, when known.
        let vq0_node = access.with(0, |vq| vq.numa_node).flatten();
        self.st().numa_node = vq0_node;

        let fds: Vec<OwnedFd> = std::mem::take(&mut msg.fds);
        let table = match MemoryTable::map(&memory, fds, populate) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                error!("({}) failed to map memory table: {e}", self.dev.ifname());
                return Ok(MsgResult::Err);
            }
        };
        self.st().mem = Some(Arc::clone(&table));

        if self.postcopy_register(&memory, msg).is_err() {
            self.st().mem = None;
            return Ok(MsgResult::Err);
        }

        // Re-translate every ring that was translated against the old
        // table; queues not yet kicked stay pending.
        let nr_vring = self.st().nr_vring as u32;
        for i in 0..nr_vring {
            let Some(vring) = access.vring(i) else {
                continue;
            };
            let iotlb = &vring.iotlb;
            let dev = Arc::clone(&self.dev);
            let miss = move |iova: u64, perm: u8| {
                let _ = dev.transport.iotlb_miss(&dev, iova, perm);
            };
            let ifname = self.dev.ifname().to_owned();
            access.with(i, |vq| {
                if vq.rings.is_some() {
                    vq.invalidate();
                    translate_rings(&ifname, features, &table, iotlb, Some(&miss), vq);
                }
            });
        }

        if async_notify {
            for i in 0..nr_vring {
                self.dev.events.vring_state_changed(self.dev.vid(), i, true);
            }
        }

        Ok(MsgResult::Ok)
    }

    /// Postcopy handshake inside `SET_MEM_TABLE`: hand our mapped addresses
    /// back, wait for the frontend's ack, then register the ranges with the
    /// userfault descriptor.
    fn postcopy_register(&mut self, memory: &VhostUserMemory, msg: &mut Message) -> Result<()> {
        if !self.st().postcopy_listening {
            return Ok(());
        }

        let mut reply_mem = *memory;
        {
            let state = self.st();
            let table = state.mem.as_ref().expect("table installed by caller");
            for (i, region) in table.regions().iter().enumerate() {
                reply_mem.regions[i].userspace_addr = region.host_user_addr;
            }
        }
        msg.set_body(&reply_mem);
        self.endpoint.send_reply(msg, &[])?;

        // The frontend must ack before we are allowed to generate faults.
        let mut ack = self.endpoint.recv_message()?;
        ack.expect_fds(0)?;
        if ack.request != MasterReq::SetMemTable as u32 {
            error!(
                "({}) bad ack on postcopy set-mem-table ({})",
                self.dev.ifname(),
                ack.request
            );
            return Err(Error::InvalidState("postcopy ack mismatch"));
        }

        let state = self.st();
        let Some(ufd) = &state.postcopy_ufd else {
            return Err(Error::InvalidState("postcopy without userfaultfd"));
        };
        let table = state.mem.as_ref().expect("table installed by caller");
        for region in table.regions() {
            ufd.register(region.mmap_addr(), region.mmap_size())?;
        }
        Ok(())
    }

    fn set_log_base(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(1).is_err() {
            return Ok(MsgResult::Err);
        }
        let log: VhostUserLog = match msg.body_exact() {
            Ok(log) => log,
            Err(_) => {
                error!("({}) invalid log base message size", self.dev.ifname());
                msg.close_fds();
                return Ok(MsgResult::Err);
            }
        };
        let fd = msg.take_fd().expect("validated above");

        info!(
            "({}) log mmap size: {}, offset: {}",
            self.dev.ifname(),
            log.mmap_size,
            log.mmap_offset
        );
        let dirty = match DirtyLog::map(fd, log.mmap_size, log.mmap_offset) {
            Ok(dirty) => Arc::new(dirty),
            Err(e) => {
                error!("({}) mmap log base failed: {e}", self.dev.ifname());
                return Ok(MsgResult::Err);
            }
        };

        let nr_vring = {
            let mut state = self.st();
            state.dirty_log = Some(dirty);
            state.nr_vring as u32
        };
        for i in 0..nr_vring {
            access.with(i, |vq| vq.log_cache = Some(LogCache::new()));
        }

        // The frontend expects an empty-payload reply here.
        msg.clear_body();
        Ok(MsgResult::Reply)
    }

    fn set_log_fd(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(1).is_err() {
            return Ok(MsgResult::Err);
        }
        msg.close_fds();
        info!("({}) SET_LOG_FD not implemented", self.dev.ifname());
        Ok(MsgResult::Ok)
    }

    fn set_vring_num(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let state: VhostUserVringState = msg.body();

        if state.num > VHOST_MAX_VRING_SIZE {
            error!(
                "({}) invalid virtqueue size {}",
                self.dev.ifname(),
                state.num
            );
            return Ok(MsgResult::Err);
        }
        let packed = ring_is_packed(self.dev.features());
        if !packed && state.num & (state.num.wrapping_sub(1)) != 0 {
            error!(
                "({}) invalid virtqueue size {}",
                self.dev.ifname(),
                state.num
            );
            return Ok(MsgResult::Err);
        }

        let updated = access.with(state.index, |vq| {
            vq.size = state.num;
            vq.shadow_used = if packed {
                ShadowUsed::Packed(vec![Default::default(); state.num as usize])
            } else {
                ShadowUsed::Split(vec![vring_used_elem::default(); state.num as usize])
            };
            vq.batch_copy = vec![BatchCopyElem::default(); state.num as usize];
        });
        if updated.is_none() {
            return Ok(MsgResult::Err);
        }
        Ok(MsgResult::Ok)
    }

    fn set_vring_addr(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let addr: VhostUserVringAddr = msg.body();

        let (features, mem) = {
            let state = self.st();
            (state.features, state.mem.clone())
        };
        let Some(mem) = mem else {
            return Ok(MsgResult::Err);
        };
        let Some(vring) = access.vring(addr.index) else {
            return Ok(MsgResult::Err);
        };
        let iotlb = &vring.iotlb;

        let dev = Arc::clone(&self.dev);
        let miss = move |iova: u64, perm: u8| {
            let _ = dev.transport.iotlb_miss(&dev, iova, perm);
        };
        let ifname = self.dev.ifname().to_owned();
        let protocol_negotiated = features & (1 << VHOST_USER_F_PROTOCOL_FEATURES) != 0;

        access.with(addr.index, |vq| {
            let access_ok = vq.access_ok;
            // Ring addresses must not be interpreted before the ring is
            // started and enabled.
            vq.ring_addrs = addr;
            vq.invalidate();

            if (vq.enabled && protocol_negotiated) || access_ok {
                translate_rings(&ifname, features, &mem, iotlb, Some(&miss), vq);
            }
        });

        Ok(MsgResult::Ok)
    }

    fn set_vring_base(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let state: VhostUserVringState = msg.body();
        let packed = ring_is_packed(self.dev.features());

        access.with(state.index, |vq| {
            vq.set_base(state.num, packed);
            info!(
                "({}) vring base idx:{} last_used_idx:{} last_avail_idx:{}",
                self.dev.ifname(),
                state.index,
                vq.last_used_idx,
                vq.last_avail_idx
            );
        });
        Ok(MsgResult::Ok)
    }

    fn get_vring_base(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let state: VhostUserVringState = msg.body();
        let packed = ring_is_packed(self.dev.features());

        // The authoritative stop message: quiesce the datapath first.
        self.dev.notify_destroy();
        {
            let mut st = self.st();
            st.flags.remove(DeviceFlags::READY);
            st.flags.remove(DeviceFlags::VDPA_CONFIGURED);
        }

        let Some(vring) = access.vring(state.index) else {
            return Ok(MsgResult::Err);
        };

        let val = access
            .with(state.index, |vq| {
                let val = vq.base_value(packed);
                vq.stop();
                vq.invalidate();
                val
            })
            .expect("queue allocated by pre-dispatch");

        vring.iotlb.write().unwrap().flush_all();

        info!(
            "({}) vring base idx:{} val:{}",
            self.dev.ifname(),
            state.index,
            val
        );
        msg.set_body(&VhostUserVringState {
            index: state.index,
            num: val,
        });
        Ok(MsgResult::Reply)
    }

    fn vring_file_payload(&self, msg: &mut Message) -> Result<(u32, VringFd)> {
        let val = msg.u64_body();
        let expected = if val & VHOST_USER_VRING_NOFD_MASK != 0 {
            0
        } else {
            1
        };
        msg.expect_fds(expected)?;
        let index = (val & VHOST_USER_VRING_IDX_MASK) as u32;
        let fd = if expected == 0 {
            VringFd::Disabled
        } else {
            VringFd::Fd(msg.take_fd().expect("validated above"))
        };
        Ok((index, fd))
    }

    fn set_vring_kick(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        let Ok((index, fd)) = self.vring_file_payload(msg) else {
            return Ok(MsgResult::Err);
        };
        info!(
            "({}) vring kick idx:{index} file:{:?}",
            self.dev.ifname(),
            fd.as_raw()
        );

        let (features, protocol_features, mem) = {
            let state = self.st();
            (state.features, state.protocol_features, state.mem.clone())
        };
        let Some(vring) = access.vring(index) else {
            return Ok(MsgResult::Err);
        };
        let iotlb = &vring.iotlb;
        let dev = Arc::clone(&self.dev);
        let miss = move |iova: u64, perm: u8| {
            let _ = dev.transport.iotlb_miss(&dev, iova, perm);
        };
        let ifname = self.dev.ifname().to_owned();
        let packed = ring_is_packed(features);

        let mut went_unready = false;
        let result = access
            .with(index, |vq| {
                // Ring addresses are only interpreted once the ring starts.
                if let Some(mem) = &mem {
                    translate_rings(&ifname, features, mem, iotlb, Some(&miss), vq);
                }

                // Without protocol features the ring starts enabled.
                if features & (1 << VHOST_USER_F_PROTOCOL_FEATURES) == 0 {
                    vq.enabled = true;
                }

                if vq.ready {
                    vq.ready = false;
                    went_unready = true;
                }
                vq.kickfd = fd;

                if packed {
                    check_queue_inflights_packed(protocol_features, vq)
                } else {
                    check_queue_inflights_split(protocol_features, vq)
                }
            })
            .expect("queue allocated by pre-dispatch");

        if went_unready {
            self.notify_vring_state(index, false, access);
        }
        if result.is_err() {
            error!(
                "({}) failed to scan inflight descriptors for vq {index}",
                self.dev.ifname()
            );
            return Ok(MsgResult::Err);
        }
        Ok(MsgResult::Ok)
    }

    fn set_vring_call(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        let Ok((index, fd)) = self.vring_file_payload(msg) else {
            return Ok(MsgResult::Err);
        };
        info!(
            "({}) vring call idx:{index} file:{:?}",
            self.dev.ifname(),
            fd.as_raw()
        );

        let mut went_unready = false;
        access.with(index, |vq| {
            if vq.ready {
                vq.ready = false;
                went_unready = true;
            }
            vq.callfd = fd;
        });
        if went_unready {
            self.notify_vring_state(index, false, access);
        }
        Ok(MsgResult::Ok)
    }

    fn set_vring_err(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        let Ok((index, fd)) = self.vring_file_payload(msg) else {
            return Ok(MsgResult::Err);
        };
        access.with(index, |vq| vq.errfd = fd);
        Ok(MsgResult::Ok)
    }

    fn set_vring_enable(
        &mut self,
        msg: &mut Message,
        access: &mut VringAccess,
    ) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let state: VhostUserVringState = msg.body();
        let enable = state.num != 0;
        info!(
            "({}) set queue enable: {enable} to qp idx: {}",
            self.dev.ifname(),
            state.index
        );

        let async_copy = self.st().async_copy;
        let blocked = access
            .with(state.index, |vq| {
                if !enable && async_copy && vq.async_inflight_packets > 0 {
                    return true;
                }
                vq.enabled = enable;
                false
            })
            .unwrap_or(true);

        if blocked {
            error!(
                "({}) failed to disable vring {}: inflight packets must complete first",
                self.dev.ifname(),
                state.index
            );
            return Ok(MsgResult::Err);
        }
        Ok(MsgResult::Ok)
    }

    fn send_rarp(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let mac_qword = msg.u64_body().to_le_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&mac_qword[..6]);
        debug!(
            "({}) RARP MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.dev.ifname(),
            mac[0],
            mac[1],
            mac[2],
            mac[3],
            mac[4],
            mac[5]
        );
        self.st().mac = mac;

        // Release pairs with the datapath's acquire: the MAC is in place
        // before the flag becomes visible.
        self.dev
            .broadcast_rarp
            .store(true, std::sync::atomic::Ordering::Release);

        let vdpa = self.st().vdpa.clone();
        if let Some(vdpa) = vdpa {
            vdpa.migration_done(self.dev.vid());
        }
        Ok(MsgResult::Ok)
    }

    fn net_set_mtu(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let mtu = msg.u64_body();
        if !(VIRTIO_MIN_MTU..=VIRTIO_MAX_MTU).contains(&mtu) {
            error!("({}) invalid MTU size ({mtu})", self.dev.ifname());
            return Ok(MsgResult::Err);
        }
        self.st().mtu = mtu as u16;
        Ok(MsgResult::Ok)
    }

    fn set_slave_req_fd(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(1).is_err() {
            return Ok(MsgResult::Err);
        }
        let fd = msg.take_fd().expect("validated above");
        *self.dev.slave.lock().unwrap() = Some(SlaveChannel::new(fd));
        Ok(MsgResult::Ok)
    }

    fn iotlb_msg(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let imsg: VhostUserIotlb = msg.body();
        let (features, mem, nr_vring) = {
            let state = self.st();
            (state.features, state.mem.clone(), state.nr_vring as u32)
        };

        match imsg.msg_type {
            VHOST_IOTLB_UPDATE => {
                let Some(mem) = mem else {
                    return Ok(MsgResult::Err);
                };
                let mut len = imsg.size;
                let Some(vva) = mem.qva_to_vva(imsg.uaddr, &mut len) else {
                    return Ok(MsgResult::Err);
                };

                for i in 0..nr_vring {
                    let Some(vring) = access.vring(i) else {
                        continue;
                    };
                    vring
                        .iotlb
                        .write()
                        .unwrap()
                        .insert(imsg.iova, vva, len, imsg.perm);

                    let overlaps = access
                        .with(i, |vq| {
                            vring_overlaps_iotlb(vq, ring_is_packed(features), &imsg)
                        })
                        .unwrap_or(false);
                    if overlaps {
                        let iotlb = &vring.iotlb;
                        let dev = Arc::clone(&self.dev);
                        let miss = move |iova: u64, perm: u8| {
                            let _ = dev.transport.iotlb_miss(&dev, iova, perm);
                        };
                        let ifname = self.dev.ifname().to_owned();
                        access.with(i, |vq| {
                            translate_rings(&ifname, features, &mem, iotlb, Some(&miss), vq)
                        });
                    }
                }
            }
            VHOST_IOTLB_INVALIDATE => {
                for i in 0..nr_vring {
                    let Some(vring) = access.vring(i) else {
                        continue;
                    };
                    vring.iotlb.write().unwrap().remove(imsg.iova, imsg.size);

                    let overlaps = access
                        .with(i, |vq| {
                            if vring_overlaps_iotlb(vq, ring_is_packed(features), &imsg) {
                                vq.invalidate();
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap_or(false);
                    let _ = overlaps;
                }
            }
            other => {
                error!("({}) invalid IOTLB message type {other}", self.dev.ifname());
                return Ok(MsgResult::Err);
            }
        }
        Ok(MsgResult::Ok)
    }

    fn postcopy_advise(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let ufd = match Userfaultfd::new() {
            Ok(ufd) => ufd,
            Err(e) => {
                error!("({}) userfaultfd not available: {e}", self.dev.ifname());
                return Ok(MsgResult::Err);
            }
        };
        self.reply_fds.push(ufd.as_raw_fd());
        self.st().postcopy_ufd = Some(ufd);
        msg.clear_body();
        Ok(MsgResult::Reply)
    }

    fn postcopy_listen(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let mut state = self.st();
        if state.mem.is_some() {
            error!(
                "({}) regions already registered at postcopy-listen",
                self.dev.ifname()
            );
            return Ok(MsgResult::Err);
        }
        state.postcopy_listening = true;
        Ok(MsgResult::Ok)
    }

    fn postcopy_end(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let mut state = self.st();
        state.postcopy_listening = false;
        state.postcopy_ufd = None;
        drop(state);
        msg.set_u64(0);
        Ok(MsgResult::Reply)
    }

    fn get_inflight_fd(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let mut inflight: VhostUserInflight = match msg.body_exact() {
            Ok(inflight) => inflight,
            Err(_) => {
                error!(
                    "({}) invalid get_inflight_fd message size {}",
                    self.dev.ifname(),
                    msg.size()
                );
                return Ok(MsgResult::Err);
            }
        };

        let packed = ring_is_packed(self.dev.features());
        let pervq = if packed {
            pervq_size_packed(inflight.queue_size)
        } else {
            pervq_size_split(inflight.queue_size)
        };
        let mmap_size = inflight.num_queues as u64 * pervq;
        info!(
            "({}) get_inflight_fd num_queues: {} queue_size: {}",
            self.dev.ifname(),
            inflight.num_queues,
            inflight.queue_size
        );

        let region = match InflightRegion::alloc(mmap_size) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                error!(
                    "({}) failed to allocate inflight area: {e}",
                    self.dev.ifname()
                );
                return Ok(MsgResult::Err);
            }
        };
        region.zero();
        if packed {
            init_packed_region(&region, inflight.num_queues, inflight.queue_size);
        }

        inflight.mmap_size = mmap_size;
        inflight.mmap_offset = 0;
        msg.set_body(&inflight);
        self.reply_fds.push(region.fd());
        info!(
            "({}) sending inflight mmap_size {mmap_size} fd {}",
            self.dev.ifname(),
            region.fd()
        );
        self.st().inflight = Some(region);
        Ok(MsgResult::Reply)
    }

    fn set_inflight_fd(&mut self, msg: &mut Message, access: &mut VringAccess) -> Result<MsgResult> {
        if msg.expect_fds(1).is_err() {
            return Ok(MsgResult::Err);
        }
        let inflight: VhostUserInflight = match msg.body_exact() {
            Ok(inflight) => inflight,
            Err(_) => {
                error!(
                    "({}) invalid set_inflight_fd message size {}",
                    self.dev.ifname(),
                    msg.size()
                );
                msg.close_fds();
                return Ok(MsgResult::Err);
            }
        };
        let fd = msg.take_fd().expect("validated above");

        let packed = ring_is_packed(self.dev.features());
        let pervq = if packed {
            pervq_size_packed(inflight.queue_size)
        } else {
            pervq_size_split(inflight.queue_size)
        };
        info!(
            "({}) set_inflight_fd mmap_size: {} offset: {} num_queues: {} queue_size: {}",
            self.dev.ifname(),
            inflight.mmap_size,
            inflight.mmap_offset,
            inflight.num_queues,
            inflight.queue_size
        );

        if inflight.num_queues as u64 * pervq > inflight.mmap_size {
            error!(
                "({}) inflight region too small for its queues",
                self.dev.ifname()
            );
            return Ok(MsgResult::Err);
        }

        // An unusable inflight region makes crash recovery impossible;
        // give up on the connection rather than run without it.
        let region = Arc::new(InflightRegion::map(
            fd,
            inflight.mmap_size,
            inflight.mmap_offset,
        )?);
        self.st().inflight = Some(Arc::clone(&region));

        for i in 0..inflight.num_queues {
            let base = pervq * i as u64;
            let view = if packed {
                QueueInflight::new_packed(Arc::clone(&region), base, inflight.queue_size)
            } else {
                QueueInflight::new_split(Arc::clone(&region), base, inflight.queue_size)
            };
            view.set_shared_desc_num(inflight.queue_size);
            access.with(i as u32, |vq| vq.inflight = Some(view.clone()));
        }
        Ok(MsgResult::Ok)
    }

    fn set_status(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        let val = msg.u64_body();
        if val > u8::MAX as u64 {
            error!(
                "({}) invalid SET_STATUS payload {val:#x}",
                self.dev.ifname()
            );
            return Ok(MsgResult::Err);
        }

        let mut state = self.st();
        state.status = DeviceStatus::from_bits_truncate(val as u8);

        if state.status.contains(DeviceStatus::FEATURES_OK)
            && state.flags.contains(DeviceFlags::FEATURES_FAILED)
        {
            error!(
                "({}) FEATURES_OK set but feature negotiation failed",
                self.dev.ifname()
            );
            // Stripping the bit is how the driver learns of the failure.
            state.status.remove(DeviceStatus::FEATURES_OK);
        }
        info!(
            "({}) new device status: {:#04x}",
            self.dev.ifname(),
            state.status.bits()
        );
        Ok(MsgResult::Ok)
    }

    fn get_status(&mut self, msg: &mut Message) -> Result<MsgResult> {
        if msg.expect_fds(0).is_err() {
            return Ok(MsgResult::Err);
        }
        msg.set_u64(self.st().status.bits() as u64);
        Ok(MsgResult::Reply)
    }

    /// Step after every message: propagate per-queue readiness edges to the
    /// datapath and an attached vDPA device.
    fn sync_queue_readiness(&mut self, access: &mut VringAccess) {
        let nr_vring = self.st().nr_vring as u32;
        for i in 0..nr_vring {
            let flipped = access.with(i, |vq| {
                let cur = vq.is_ready();
                if cur != vq.ready {
                    vq.ready = cur;
                    Some(cur)
                } else {
                    None
                }
            });
            if let Some(Some(cur)) = flipped {
                self.notify_vring_state(i, cur, access);
            }
        }
    }

    fn notify_vring_state(&self, index: u32, enable: bool, access: &mut VringAccess) {
        if enable {
            access.with(index, |vq| {
                if let Some(latched) = vq.notif_enable {
                    vq.enable_guest_notification(latched);
                }
            });
        }
        let vdpa = self.st().vdpa.clone();
        if let Some(vdpa) = vdpa {
            vdpa.set_vring_state(self.dev.vid(), index, enable);
        }
        self.dev
            .events
            .vring_state_changed(self.dev.vid(), index, enable);
    }

    /// Final step: if the device-wide readiness predicate just became true,
    /// hand the device to the datapath and configure an attached vDPA
    /// device. Runs with no locks held; the callbacks may query the device.
    fn check_device_ready(&mut self) {
        let already_ready = self.st().flags.contains(DeviceFlags::READY);
        if !already_ready {
            let (snapshot, nr_vring, gate_ok) = {
                let state = self.st();
                (
                    state.vrings.clone(),
                    state.nr_vring,
                    device_is_ready_locked(&state, |_| true),
                )
            };
            if !gate_ok {
                return;
            }
            for vring in snapshot.iter().take(nr_vring) {
                let Some(vring) = vring else { return };
                if !vring.state.lock().unwrap().is_ready() {
                    return;
                }
            }
            let mut state = self.st();
            state.flags.insert(DeviceFlags::READY);
            if !state.flags.contains(DeviceFlags::RUNNING) {
                info!(
                    "({}) virtio is now ready for processing",
                    self.dev.ifname()
                );
            }
        }

        let running = self.dev.is_running();
        if !running {
            if self.dev.events.new_device(self.dev.vid()).is_ok() {
                self.st().flags.insert(DeviceFlags::RUNNING);
            }
        }

        let (vdpa, configured) = {
            let state = self.st();
            (
                state.vdpa.clone(),
                state.flags.contains(DeviceFlags::VDPA_CONFIGURED),
            )
        };
        if let Some(vdpa) = vdpa {
            if !configured {
                if vdpa.dev_conf(self.dev.vid()).is_ok() {
                    self.st().flags.insert(DeviceFlags::VDPA_CONFIGURED);
                } else {
                    error!("({}) failed to configure vDPA device", self.dev.ifname());
                }
            }
        }
    }
}

/// Whether an IOTLB range intersects the queue's configured ring areas;
/// such updates and invalidations force a (re)translation.
fn vring_overlaps_iotlb(vq: &VringState, packed: bool, imsg: &VhostUserIotlb) -> bool {
    let start = imsg.iova;
    let end = start.saturating_add(imsg.size);
    let ra = &vq.ring_addrs;

    let overlaps = |addr: u64, len: u64| addr < end && addr.saturating_add(len) > start;

    let hit = if packed {
        overlaps(ra.desc_user_addr, 16 * vq.size as u64)
            || overlaps(ra.avail_user_addr, 4)
            || overlaps(ra.used_user_addr, 4)
    } else {
        overlaps(
            ra.desc_user_addr,
            std::mem::size_of::<vring_desc>() as u64 * vq.size as u64,
        ) || overlaps(
            ra.avail_user_addr,
            std::mem::size_of::<vring_avail>() as u64 + 2 * vq.size as u64,
        ) || overlaps(
            ra.used_user_addr,
            std::mem::size_of::<vring_used>() as u64
                + std::mem::size_of::<vring_used_elem>() as u64 * vq.size as u64,
        )
    };

    if hit {
        return true;
    }
    if ra.flags & (1 << VHOST_VRING_F_LOG) != 0 {
        return overlaps(ra.log_guest_addr, 8);
    }
    false
}
