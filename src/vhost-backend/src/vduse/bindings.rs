// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Hand-maintained bindings for the `linux/vduse.h` uapi: the ioctl
//! vocabulary of `/dev/vduse/control` and per-device chardevs, and the
//! request/response structs read from and written to the device
//! descriptor.

pub const VDUSE_API_VERSION: u64 = 0;
pub const VDUSE_NAME_MAX: usize = 256;

const VDUSE_BASE: u8 = 0x81;

/// Marker for `VduseVqEventfd::fd` to detach a kick eventfd.
pub const VDUSE_EVENTFD_DEASSIGN: i32 = -1;

#[repr(C)]
pub struct VduseDevConfig {
    pub name: [libc::c_char; VDUSE_NAME_MAX],
    pub vendor_id: u32,
    pub device_id: u32,
    pub features: u64,
    pub vq_num: u32,
    pub vq_align: u32,
    pub reserved: [u32; 13],
    pub config_size: u32,
    pub config: [u8; 256],
}

impl Default for VduseDevConfig {
    fn default() -> Self {
        VduseDevConfig {
            name: [0; VDUSE_NAME_MAX],
            vendor_id: 0,
            device_id: 0,
            features: 0,
            vq_num: 0,
            vq_align: 0,
            reserved: [0; 13],
            config_size: 0,
            config: [0; 256],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VduseIotlbEntry {
    pub offset: u64,
    pub start: u64,
    pub last: u64,
    pub perm: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VduseVqConfig {
    pub index: u32,
    pub max_size: u16,
    pub reserved: [u16; 13],
}

/// Split-ring state words of `vduse_vq_state`; the packed layout reuses
/// the same storage.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VduseVqState {
    pub avail_index: u16,
    pub packed: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VduseVqInfo {
    pub index: u32,
    pub num: u32,
    pub desc_addr: u64,
    pub driver_addr: u64,
    pub device_addr: u64,
    pub state: VduseVqState,
    pub ready: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VduseVqEventfd {
    pub index: u32,
    pub fd: i32,
}

pub const VDUSE_GET_VQ_STATE: u32 = 0;
pub const VDUSE_SET_STATUS: u32 = 1;
pub const VDUSE_UPDATE_IOTLB: u32 = 2;

pub const VDUSE_REQ_RESULT_OK: u32 = 0;
pub const VDUSE_REQ_RESULT_FAILED: u32 = 1;

pub const VDUSE_REQUEST_PAYLOAD: usize = 128;

/// A kernel-originated request read from the device descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VduseDevRequest {
    pub request_type: u32,
    pub request_id: u32,
    pub reserved: [u32; 4],
    pub payload: [u8; VDUSE_REQUEST_PAYLOAD],
}

impl Default for VduseDevRequest {
    fn default() -> Self {
        VduseDevRequest {
            request_type: 0,
            request_id: 0,
            reserved: [0; 4],
            payload: [0; VDUSE_REQUEST_PAYLOAD],
        }
    }
}

impl VduseDevRequest {
    /// `GET_VQ_STATE`: the queried queue index.
    pub fn vq_index(&self) -> u32 {
        u32::from_le_bytes(self.payload[0..4].try_into().unwrap())
    }

    /// `SET_STATUS`: the new device status byte.
    pub fn status(&self) -> u8 {
        self.payload[0]
    }

    /// `UPDATE_IOTLB`: the invalidated IOVA range, inclusive.
    pub fn iova_range(&self) -> (u64, u64) {
        let start = u64::from_le_bytes(self.payload[0..8].try_into().unwrap());
        let last = u64::from_le_bytes(self.payload[8..16].try_into().unwrap());
        (start, last)
    }

    pub fn type_name(&self) -> &'static str {
        match self.request_type {
            VDUSE_GET_VQ_STATE => "VDUSE_GET_VQ_STATE",
            VDUSE_SET_STATUS => "VDUSE_SET_STATUS",
            VDUSE_UPDATE_IOTLB => "VDUSE_UPDATE_IOTLB",
            _ => "unknown",
        }
    }
}

/// The answer written back to the device descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VduseDevResponse {
    pub request_id: u32,
    pub result: u32,
    pub reserved: [u32; 4],
    pub payload: [u8; VDUSE_REQUEST_PAYLOAD],
}

impl Default for VduseDevResponse {
    fn default() -> Self {
        VduseDevResponse {
            request_id: 0,
            result: 0,
            reserved: [0; 4],
            payload: [0; VDUSE_REQUEST_PAYLOAD],
        }
    }
}

impl VduseDevResponse {
    /// `GET_VQ_STATE` reply: the split avail index.
    pub fn set_vq_state_split(&mut self, avail_index: u16) {
        self.payload[0..2].copy_from_slice(&avail_index.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: plain #[repr(C)] integers, read as raw bytes for write().
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }
}

impl VduseDevRequest {
    pub fn from_bytes(bytes: &[u8]) -> Option<VduseDevRequest> {
        if bytes.len() < std::mem::size_of::<Self>() {
            return None;
        }
        let mut req = VduseDevRequest::default();
        // SAFETY: plain #[repr(C)] integers, any bit pattern is valid.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut req as *mut Self as *mut u8,
                std::mem::size_of::<Self>(),
            );
        }
        Some(req)
    }
}

nix::ioctl_write_ptr!(vduse_set_api_version, VDUSE_BASE, 0x01, u64);
nix::ioctl_write_ptr!(vduse_create_dev, VDUSE_BASE, 0x02, VduseDevConfig);
nix::ioctl_write_ptr!(
    vduse_destroy_dev,
    VDUSE_BASE,
    0x03,
    [libc::c_char; VDUSE_NAME_MAX]
);
nix::ioctl_readwrite!(vduse_iotlb_get_fd, VDUSE_BASE, 0x10, VduseIotlbEntry);
nix::ioctl_read!(vduse_dev_get_features, VDUSE_BASE, 0x11, u64);
nix::ioctl_write_ptr!(vduse_vq_setup, VDUSE_BASE, 0x14, VduseVqConfig);
nix::ioctl_readwrite!(vduse_vq_get_info, VDUSE_BASE, 0x15, VduseVqInfo);
nix::ioctl_write_ptr!(vduse_vq_setup_kickfd, VDUSE_BASE, 0x16, VduseVqEventfd);
nix::ioctl_write_ptr!(vduse_vq_inject_irq, VDUSE_BASE, 0x17, u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let mut req = VduseDevRequest {
            request_type: VDUSE_UPDATE_IOTLB,
            request_id: 7,
            ..Default::default()
        };
        req.payload[0..8].copy_from_slice(&0x1000u64.to_le_bytes());
        req.payload[8..16].copy_from_slice(&0x1fffu64.to_le_bytes());

        let bytes = unsafe {
            std::slice::from_raw_parts(
                &req as *const _ as *const u8,
                std::mem::size_of::<VduseDevRequest>(),
            )
        };
        let parsed = VduseDevRequest::from_bytes(bytes).unwrap();
        assert_eq!(parsed.request_type, VDUSE_UPDATE_IOTLB);
        assert_eq!(parsed.request_id, 7);
        assert_eq!(parsed.iova_range(), (0x1000, 0x1fff));
        assert_eq!(parsed.type_name(), "VDUSE_UPDATE_IOTLB");
    }

    #[test]
    fn response_layout() {
        let mut resp = VduseDevResponse {
            request_id: 3,
            result: VDUSE_REQ_RESULT_OK,
            ..Default::default()
        };
        resp.set_vq_state_split(0x1234);
        let bytes = resp.as_bytes();
        assert_eq!(bytes.len(), std::mem::size_of::<VduseDevResponse>());
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        // Payload starts after request_id, result and 4 reserved words.
        assert_eq!(&bytes[24..26], &0x1234u16.to_le_bytes());
    }
}
