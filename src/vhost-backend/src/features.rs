// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Virtio and vhost-user feature bits, device status bits and device flags.

use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use virtio_bindings::virtio_net::{
    VIRTIO_NET_F_CSUM, VIRTIO_NET_F_CTRL_RX, VIRTIO_NET_F_CTRL_VQ, VIRTIO_NET_F_GUEST_ANNOUNCE,
    VIRTIO_NET_F_GUEST_CSUM, VIRTIO_NET_F_GUEST_TSO4, VIRTIO_NET_F_GUEST_TSO6,
    VIRTIO_NET_F_HOST_TSO4, VIRTIO_NET_F_HOST_TSO6, VIRTIO_NET_F_MQ, VIRTIO_NET_F_MRG_RXBUF,
    VIRTIO_NET_F_MTU,
};
use virtio_bindings::virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC};

/// Dirty-page logging of all guest writes (live migration).
pub const VHOST_F_LOG_ALL: u32 = 26;
/// Presence of the vhost-user protocol-feature negotiation.
pub const VHOST_USER_F_PROTOCOL_FEATURES: u32 = 30;
/// Ring addresses are guest I/O virtual addresses resolved through the IOTLB.
pub const VIRTIO_F_IOMMU_PLATFORM: u32 = 33;
/// Packed virtqueue layout.
pub const VIRTIO_F_RING_PACKED: u32 = 34;

/// Virtio features advertised by the builtin network backend.
pub const fn supported_features() -> u64 {
    (1u64 << VIRTIO_NET_F_MRG_RXBUF)
        | (1u64 << VIRTIO_NET_F_CTRL_VQ)
        | (1u64 << VIRTIO_NET_F_CTRL_RX)
        | (1u64 << VIRTIO_NET_F_GUEST_ANNOUNCE)
        | (1u64 << VIRTIO_NET_F_MQ)
        | (1u64 << VIRTIO_F_VERSION_1)
        | (1u64 << VHOST_F_LOG_ALL)
        | (1u64 << VHOST_USER_F_PROTOCOL_FEATURES)
        | (1u64 << VIRTIO_NET_F_HOST_TSO4)
        | (1u64 << VIRTIO_NET_F_HOST_TSO6)
        | (1u64 << VIRTIO_NET_F_CSUM)
        | (1u64 << VIRTIO_NET_F_GUEST_CSUM)
        | (1u64 << VIRTIO_NET_F_GUEST_TSO4)
        | (1u64 << VIRTIO_NET_F_GUEST_TSO6)
        | (1u64 << VIRTIO_RING_F_INDIRECT_DESC)
        | (1u64 << VIRTIO_RING_F_EVENT_IDX)
        | (1u64 << VIRTIO_F_RING_PACKED)
        | (1u64 << VIRTIO_F_IOMMU_PLATFORM)
        | (1u64 << VIRTIO_NET_F_MTU)
}

bitflags::bitflags! {
    /// vhost-user protocol features (the second negotiation, gated behind
    /// `VHOST_USER_F_PROTOCOL_FEATURES`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtocolFeatures: u64 {
        const MQ = 1 << 0;
        const LOG_SHMFD = 1 << 1;
        const RARP = 1 << 2;
        const REPLY_ACK = 1 << 3;
        const NET_MTU = 1 << 4;
        const SLAVE_REQ = 1 << 5;
        const CRYPTO_SESSION = 1 << 7;
        const PAGEFAULT = 1 << 8;
        const SLAVE_SEND_FD = 1 << 10;
        const HOST_NOTIFIER = 1 << 11;
        const INFLIGHT_SHMFD = 1 << 12;
        const STATUS = 1 << 16;
    }
}

impl ProtocolFeatures {
    /// Protocol features advertised by default.
    pub fn supported() -> Self {
        Self::MQ
            | Self::LOG_SHMFD
            | Self::RARP
            | Self::REPLY_ACK
            | Self::NET_MTU
            | Self::SLAVE_REQ
            | Self::SLAVE_SEND_FD
            | Self::HOST_NOTIFIER
            | Self::INFLIGHT_SHMFD
            | Self::STATUS
    }
}

bitflags::bitflags! {
    /// Virtio device status register, 8 bits (virtio spec 2.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

bitflags::bitflags! {
    /// Internal device lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// The datapath has been handed the device (`new_device` succeeded).
        const RUNNING = 1 << 0;
        /// Every queue passed the readiness predicate.
        const READY = 1 << 1;
        /// `SET_FEATURES` requested a bit outside the advertisement.
        const FEATURES_FAILED = 1 << 2;
        /// An attached vDPA device has been configured.
        const VDPA_CONFIGURED = 1 << 3;
    }
}

/// Whether the negotiated feature set selects the packed ring layout.
pub fn ring_is_packed(features: u64) -> bool {
    features & (1 << VIRTIO_F_RING_PACKED) != 0
}

/// Whether ring addresses must be resolved through the IOTLB.
pub fn has_iommu(features: u64) -> bool {
    features & (1 << VIRTIO_F_IOMMU_PLATFORM) != 0
}

/// Size of the virtio-net header for the negotiated feature set.
///
/// Mergeable RX buffers, virtio 1.0 and packed rings all imply the layout
/// with the trailing `num_buffers` field.
pub fn net_header_len(features: u64) -> usize {
    if features
        & ((1 << VIRTIO_NET_F_MRG_RXBUF) | (1 << VIRTIO_F_VERSION_1) | (1 << VIRTIO_F_RING_PACKED))
        != 0
    {
        std::mem::size_of::<virtio_bindings::virtio_net::virtio_net_hdr_mrg_rxbuf>()
    } else {
        std::mem::size_of::<virtio_bindings::virtio_net::virtio_net_hdr>()
    }
}
