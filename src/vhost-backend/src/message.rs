// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! vhost-user wire format: message header, payload structs and the socket
//! codec with `SCM_RIGHTS` descriptor passing.
//!
//! The frontend is only one step removed from the guest, so nothing read from
//! the socket is trusted: sizes are bounded by compile-time constants, the
//! descriptor count is validated per request, and any violation closes every
//! received descriptor before the error propagates.

use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use log::error;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use vm_memory::ByteValued;

use crate::{Error, Result};

/// Protocol version carried in the header flags.
pub const VHOST_USER_VERSION: u32 = 0x1;
pub const VHOST_USER_VERSION_MASK: u32 = 0x3;
pub const VHOST_USER_REPLY: u32 = 1 << 2;
pub const VHOST_USER_NEED_REPLY: u32 = 1 << 3;

/// Maximum memory regions in one `SET_MEM_TABLE`, and thereby the maximum
/// number of ancillary descriptors a message may carry.
pub const VHOST_MEMORY_MAX_NREGIONS: usize = 8;

/// Vring index mask in `u64`-payload vring messages.
pub const VHOST_USER_VRING_IDX_MASK: u64 = 0xff;
/// "No descriptor attached" marker in `u64`-payload vring messages.
pub const VHOST_USER_VRING_NOFD_MASK: u64 = 1 << 8;

/// Hard cap on the payload of a single message. Not derived from a union
/// sizeof: the memory table is the largest payload this backend accepts.
pub const MAX_PAYLOAD_SIZE: usize = mem::size_of::<VhostUserMemory>();

pub const VHOST_USER_HDR_SIZE: usize = 12;

/// Frontend-to-backend request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MasterReq {
    GetFeatures = 1,
    SetFeatures = 2,
    SetOwner = 3,
    ResetOwner = 4,
    SetMemTable = 5,
    SetLogBase = 6,
    SetLogFd = 7,
    SetVringNum = 8,
    SetVringAddr = 9,
    SetVringBase = 10,
    GetVringBase = 11,
    SetVringKick = 12,
    SetVringCall = 13,
    SetVringErr = 14,
    GetProtocolFeatures = 15,
    SetProtocolFeatures = 16,
    GetQueueNum = 17,
    SetVringEnable = 18,
    SendRarp = 19,
    NetSetMtu = 20,
    SetSlaveReqFd = 21,
    IotlbMsg = 22,
    PostcopyAdvise = 28,
    PostcopyListen = 29,
    PostcopyEnd = 30,
    GetInflightFd = 31,
    SetInflightFd = 32,
    SetStatus = 39,
    GetStatus = 40,
}

impl MasterReq {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::GetFeatures,
            2 => Self::SetFeatures,
            3 => Self::SetOwner,
            4 => Self::ResetOwner,
            5 => Self::SetMemTable,
            6 => Self::SetLogBase,
            7 => Self::SetLogFd,
            8 => Self::SetVringNum,
            9 => Self::SetVringAddr,
            10 => Self::SetVringBase,
            11 => Self::GetVringBase,
            12 => Self::SetVringKick,
            13 => Self::SetVringCall,
            14 => Self::SetVringErr,
            15 => Self::GetProtocolFeatures,
            16 => Self::SetProtocolFeatures,
            17 => Self::GetQueueNum,
            18 => Self::SetVringEnable,
            19 => Self::SendRarp,
            20 => Self::NetSetMtu,
            21 => Self::SetSlaveReqFd,
            22 => Self::IotlbMsg,
            28 => Self::PostcopyAdvise,
            29 => Self::PostcopyListen,
            30 => Self::PostcopyEnd,
            31 => Self::GetInflightFd,
            32 => Self::SetInflightFd,
            39 => Self::SetStatus,
            40 => Self::GetStatus,
            _ => return None,
        })
    }

    pub fn name(raw: u32) -> &'static str {
        match Self::from_raw(raw) {
            Some(Self::GetFeatures) => "VHOST_USER_GET_FEATURES",
            Some(Self::SetFeatures) => "VHOST_USER_SET_FEATURES",
            Some(Self::SetOwner) => "VHOST_USER_SET_OWNER",
            Some(Self::ResetOwner) => "VHOST_USER_RESET_OWNER",
            Some(Self::SetMemTable) => "VHOST_USER_SET_MEM_TABLE",
            Some(Self::SetLogBase) => "VHOST_USER_SET_LOG_BASE",
            Some(Self::SetLogFd) => "VHOST_USER_SET_LOG_FD",
            Some(Self::SetVringNum) => "VHOST_USER_SET_VRING_NUM",
            Some(Self::SetVringAddr) => "VHOST_USER_SET_VRING_ADDR",
            Some(Self::SetVringBase) => "VHOST_USER_SET_VRING_BASE",
            Some(Self::GetVringBase) => "VHOST_USER_GET_VRING_BASE",
            Some(Self::SetVringKick) => "VHOST_USER_SET_VRING_KICK",
            Some(Self::SetVringCall) => "VHOST_USER_SET_VRING_CALL",
            Some(Self::SetVringErr) => "VHOST_USER_SET_VRING_ERR",
            Some(Self::GetProtocolFeatures) => "VHOST_USER_GET_PROTOCOL_FEATURES",
            Some(Self::SetProtocolFeatures) => "VHOST_USER_SET_PROTOCOL_FEATURES",
            Some(Self::GetQueueNum) => "VHOST_USER_GET_QUEUE_NUM",
            Some(Self::SetVringEnable) => "VHOST_USER_SET_VRING_ENABLE",
            Some(Self::SendRarp) => "VHOST_USER_SEND_RARP",
            Some(Self::NetSetMtu) => "VHOST_USER_NET_SET_MTU",
            Some(Self::SetSlaveReqFd) => "VHOST_USER_SET_SLAVE_REQ_FD",
            Some(Self::IotlbMsg) => "VHOST_USER_IOTLB_MSG",
            Some(Self::PostcopyAdvise) => "VHOST_USER_POSTCOPY_ADVISE",
            Some(Self::PostcopyListen) => "VHOST_USER_POSTCOPY_LISTEN",
            Some(Self::PostcopyEnd) => "VHOST_USER_POSTCOPY_END",
            Some(Self::GetInflightFd) => "VHOST_USER_GET_INFLIGHT_FD",
            Some(Self::SetInflightFd) => "VHOST_USER_SET_INFLIGHT_FD",
            Some(Self::SetStatus) => "VHOST_USER_SET_STATUS",
            Some(Self::GetStatus) => "VHOST_USER_GET_STATUS",
            None => "unknown",
        }
    }
}

/// Backend-to-frontend request codes, sent on the slave channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlaveReq {
    IotlbMsg = 1,
    ConfigChangeMsg = 2,
    VringHostNotifierMsg = 3,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgHeader {
    pub request: u32,
    pub flags: u32,
    pub size: u32,
}

// SAFETY: plain little-endian integers, no padding.
unsafe impl ByteValued for MsgHeader {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserVringState {
    pub index: u32,
    pub num: u32,
}

// SAFETY: plain integers, no padding.
unsafe impl ByteValued for VhostUserVringState {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserVringAddr {
    pub index: u32,
    /// Bit 0 (`VHOST_VRING_F_LOG`) requests used-ring logging.
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

// SAFETY: plain integers, explicitly padded layout.
unsafe impl ByteValued for VhostUserVringAddr {}

/// `VHOST_VRING_F_LOG` in [`VhostUserVringAddr::flags`].
pub const VHOST_VRING_F_LOG: u32 = 0;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserMemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    pub mmap_offset: u64,
}

// SAFETY: plain integers, no padding.
unsafe impl ByteValued for VhostUserMemoryRegion {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserMemory {
    pub nregions: u32,
    pub padding: u32,
    pub regions: [VhostUserMemoryRegion; VHOST_MEMORY_MAX_NREGIONS],
}

// SAFETY: plain integers, no padding.
unsafe impl ByteValued for VhostUserMemory {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserLog {
    pub mmap_size: u64,
    pub mmap_offset: u64,
}

// SAFETY: plain integers, no padding.
unsafe impl ByteValued for VhostUserLog {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserInflight {
    pub mmap_size: u64,
    pub mmap_offset: u64,
    pub num_queues: u16,
    pub queue_size: u16,
    pub padding: u32,
}

// SAFETY: plain integers, explicit trailing padding.
unsafe impl ByteValued for VhostUserInflight {}

/// IOTLB message types.
pub const VHOST_IOTLB_MISS: u8 = 1;
pub const VHOST_IOTLB_UPDATE: u8 = 2;
pub const VHOST_IOTLB_INVALIDATE: u8 = 3;

/// IOTLB access permissions.
pub const VHOST_ACCESS_RO: u8 = 1;
pub const VHOST_ACCESS_WO: u8 = 2;
pub const VHOST_ACCESS_RW: u8 = 3;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserIotlb {
    pub iova: u64,
    pub size: u64,
    pub uaddr: u64,
    pub perm: u8,
    pub msg_type: u8,
    pub padding: [u8; 6],
}

// SAFETY: plain integers, explicit trailing padding.
unsafe impl ByteValued for VhostUserIotlb {}

/// Payload of `SLAVE_VRING_HOST_NOTIFIER_MSG`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserVringArea {
    pub u64_: u64,
    pub size: u64,
    pub offset: u64,
}

// SAFETY: plain integers, no padding.
unsafe impl ByteValued for VhostUserVringArea {}

/// One decoded message: header, raw payload and the descriptors that rode in
/// with it. Received descriptors are owned; dropping the message closes any
/// that were not claimed, which is exactly the leak-avoidance rule the
/// protocol requires on validation failure.
pub struct Message {
    pub request: u32,
    pub flags: u32,
    size: u32,
    payload: [u8; MAX_PAYLOAD_SIZE],
    pub fds: Vec<OwnedFd>,
}

impl Message {
    pub fn new(request: u32) -> Self {
        Message {
            request,
            flags: VHOST_USER_VERSION,
            size: 0,
            payload: [0; MAX_PAYLOAD_SIZE],
            fds: Vec::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn need_reply(&self) -> bool {
        self.flags & VHOST_USER_NEED_REPLY != 0
    }

    pub fn is_reply(&self) -> bool {
        self.flags & VHOST_USER_REPLY != 0
    }

    /// Decode the payload as `T`, zero-extending a short payload the way the
    /// reference implementation's union copy does.
    pub fn body<T: ByteValued + Default>(&self) -> T {
        let mut val = T::default();
        let n = mem::size_of::<T>().min(self.size as usize);
        val.as_mut_slice()[..n].copy_from_slice(&self.payload[..n]);
        val
    }

    /// Decode the payload as `T`, requiring the exact wire size.
    pub fn body_exact<T: ByteValued + Default>(&self) -> Result<T> {
        if self.size as usize != mem::size_of::<T>() {
            return Err(Error::InvalidPayloadSize(self.size));
        }
        Ok(self.body())
    }

    pub fn set_body<T: ByteValued>(&mut self, val: &T) {
        let bytes = val.as_slice();
        debug_assert!(bytes.len() <= MAX_PAYLOAD_SIZE);
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len() as u32;
    }

    pub fn set_u64(&mut self, val: u64) {
        self.payload[..8].copy_from_slice(&val.to_le_bytes());
        self.size = 8;
    }

    pub fn u64_body(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = 8.min(self.size as usize);
        buf[..n].copy_from_slice(&self.payload[..n]);
        u64::from_le_bytes(buf)
    }

    pub fn clear_body(&mut self) {
        self.size = 0;
    }

    /// Close every descriptor still attached to this message.
    pub fn close_fds(&mut self) {
        self.fds.clear();
    }

    /// Take the first descriptor, if any.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        if self.fds.is_empty() {
            None
        } else {
            Some(self.fds.remove(0))
        }
    }

    /// Validate the received descriptor count, closing everything on
    /// mismatch so no descriptor leaks into the process.
    pub fn expect_fds(&mut self, expected: usize) -> Result<()> {
        if self.fds.len() == expected {
            return Ok(());
        }
        error!(
            "expected {} descriptors for request {}, received {}",
            expected,
            MasterReq::name(self.request),
            self.fds.len()
        );
        let received = self.fds.len();
        self.close_fds();
        Err(Error::DescriptorMismatch {
            request: self.request,
            expected,
            received,
        })
    }
}

/// One end of a vhost-user socket: framing plus descriptor passing.
///
/// Used for the frontend connection and, in the reverse direction, for the
/// slave channel (which reuses the identical framing).
pub struct Endpoint {
    sock: UnixStream,
}

impl Endpoint {
    pub fn new(sock: UnixStream) -> Self {
        Endpoint { sock }
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Endpoint {
            sock: UnixStream::from(fd),
        }
    }

    /// Read one message: header plus ancillary descriptors in a single
    /// `recvmsg`, then exactly `size` payload bytes.
    ///
    /// Returns [`Error::Disconnected`] on EOF.
    pub fn recv_message(&mut self) -> Result<Message> {
        let mut hdr = MsgHeader::default();
        let mut cmsg_buf = nix::cmsg_space!([RawFd; VHOST_MEMORY_MAX_NREGIONS]);
        let mut fds = Vec::new();

        let bytes = {
            let mut iov = [IoSliceMut::new(hdr.as_mut_slice())];
            let msg = recvmsg::<UnixAddr>(
                self.sock.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    for fd in received {
                        // SAFETY: the kernel installed a fresh descriptor for us.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            msg.bytes
        };

        if bytes == 0 {
            return Err(Error::Disconnected);
        }
        if bytes != VHOST_USER_HDR_SIZE {
            return Err(Error::InvalidHeader);
        }
        if hdr.flags & VHOST_USER_VERSION_MASK != VHOST_USER_VERSION {
            return Err(Error::InvalidHeader);
        }
        if fds.len() > VHOST_MEMORY_MAX_NREGIONS {
            return Err(Error::DescriptorMismatch {
                request: hdr.request,
                expected: VHOST_MEMORY_MAX_NREGIONS,
                received: fds.len(),
            });
        }

        let mut msg = Message::new(hdr.request);
        msg.flags = hdr.flags;
        msg.fds = fds;

        if hdr.size > 0 {
            if hdr.size as usize > MAX_PAYLOAD_SIZE {
                return Err(Error::InvalidPayloadSize(hdr.size));
            }
            self.read_exact(&mut msg.payload[..hdr.size as usize])
                .map_err(|_| Error::InvalidPayloadSize(hdr.size))?;
            msg.size = hdr.size;
        }

        Ok(msg)
    }

    /// Send a message, attaching `fds` as `SCM_RIGHTS`. The descriptors are
    /// borrowed: ownership stays with the caller (replies that hand out the
    /// inflight or userfault descriptor keep them open locally).
    pub fn send_message(&mut self, msg: &Message, fds: &[RawFd]) -> Result<()> {
        let hdr = MsgHeader {
            request: msg.request,
            flags: msg.flags,
            size: msg.size,
        };
        let mut buf = [0u8; VHOST_USER_HDR_SIZE + MAX_PAYLOAD_SIZE];
        buf[..VHOST_USER_HDR_SIZE].copy_from_slice(hdr.as_slice());
        buf[VHOST_USER_HDR_SIZE..VHOST_USER_HDR_SIZE + msg.size as usize]
            .copy_from_slice(&msg.payload[..msg.size as usize]);
        let len = VHOST_USER_HDR_SIZE + msg.size as usize;

        let iov = [IoSlice::new(&buf[..len])];
        let cmsgs = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        let sent = sendmsg::<UnixAddr>(
            self.sock.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )?;
        if sent != len {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Turn `msg` into its reply and send it: version forced to 1, REPLY
    /// set, NEED_REPLY cleared.
    pub fn send_reply(&mut self, msg: &mut Message, fds: &[RawFd]) -> Result<()> {
        msg.flags &= !(VHOST_USER_VERSION_MASK | VHOST_USER_NEED_REPLY);
        msg.flags |= VHOST_USER_VERSION | VHOST_USER_REPLY;
        self.send_message(msg, fds)
    }

    fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = nix::unistd::read(self.sock.as_raw_fd(), buf)?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    fn pair() -> (Endpoint, Endpoint) {
        let (a, b) = UnixStream::pair().unwrap();
        (Endpoint::new(a), Endpoint::new(b))
    }

    #[test]
    fn roundtrip_u64_payload() {
        let (mut tx, mut rx) = pair();
        let mut msg = Message::new(MasterReq::SetFeatures as u32);
        msg.set_u64(0x1_3000_0000);
        tx.send_message(&msg, &[]).unwrap();

        let got = rx.recv_message().unwrap();
        assert_eq!(got.request, MasterReq::SetFeatures as u32);
        assert_eq!(got.size(), 8);
        assert_eq!(got.u64_body(), 0x1_3000_0000);
        assert!(got.fds.is_empty());
    }

    #[test]
    fn roundtrip_vring_state() {
        let (mut tx, mut rx) = pair();
        let mut msg = Message::new(MasterReq::SetVringNum as u32);
        msg.set_body(&VhostUserVringState { index: 0, num: 256 });
        tx.send_message(&msg, &[]).unwrap();

        let got = rx.recv_message().unwrap();
        let state: VhostUserVringState = got.body();
        assert_eq!(state, VhostUserVringState { index: 0, num: 256 });
    }

    #[test]
    fn descriptor_passing() {
        let (mut tx, mut rx) = pair();
        let (extra, _keep) = UnixStream::pair().unwrap();
        let raw = extra.into_raw_fd();

        let mut msg = Message::new(MasterReq::SetVringKick as u32);
        msg.set_u64(0);
        tx.send_message(&msg, &[raw]).unwrap();
        nix::unistd::close(raw).unwrap();

        let mut got = rx.recv_message().unwrap();
        assert_eq!(got.fds.len(), 1);
        assert!(got.expect_fds(1).is_ok());
        let fd = got.take_fd().unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn fd_mismatch_closes_everything() {
        let (mut tx, mut rx) = pair();
        let (extra, _keep) = UnixStream::pair().unwrap();
        let raw = extra.into_raw_fd();

        let mut msg = Message::new(MasterReq::SetOwner as u32);
        tx.send_message(&msg, &[raw]).unwrap();
        nix::unistd::close(raw).unwrap();
        msg.close_fds();

        let mut got = rx.recv_message().unwrap();
        assert!(matches!(
            got.expect_fds(0),
            Err(Error::DescriptorMismatch { expected: 0, .. })
        ));
        assert!(got.fds.is_empty());
    }

    #[test]
    fn short_payload_zero_extends() {
        let (mut tx, mut rx) = pair();
        let mut msg = Message::new(MasterReq::IotlbMsg as u32);
        // Only the three leading u64 fields of the IOTLB payload.
        let mut short = [0u8; 24];
        short[..8].copy_from_slice(&0x1000u64.to_le_bytes());
        msg.payload[..24].copy_from_slice(&short);
        msg.size = 24;
        tx.send_message(&msg, &[]).unwrap();

        let got = rx.recv_message().unwrap();
        let iotlb: VhostUserIotlb = got.body();
        assert_eq!(iotlb.iova, 0x1000);
        assert_eq!(iotlb.msg_type, 0);
    }

    #[test]
    fn reply_flags() {
        let (mut tx, mut rx) = pair();
        let mut msg = Message::new(MasterReq::GetFeatures as u32);
        msg.flags |= VHOST_USER_NEED_REPLY;
        msg.set_u64(42);
        tx.send_reply(&mut msg, &[]).unwrap();

        let got = rx.recv_message().unwrap();
        assert!(got.is_reply());
        assert!(!got.need_reply());
        assert_eq!(got.flags & VHOST_USER_VERSION_MASK, VHOST_USER_VERSION);
    }
}
