// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Backend (device) side of the vhost-user protocol and its kernel sibling
//! VDUSE.
//!
//! A hypervisor (or the kernel's vDPA bus) delegates the servicing of
//! virtio queues to this process. The crate implements the control plane
//! that delegation rides on: message framing with descriptor passing over a
//! UNIX socket, feature negotiation, guest-memory mapping and address
//! translation with an IOTLB, the virtqueue lifecycle, crash-recoverable
//! inflight tracking, live-migration dirty logging, and the VDUSE chardev
//! transport with its persistent reconnect log.
//!
//! The packet paths themselves are the embedder's concern: implement
//! [`VhostEvents`], register an endpoint, and drive the rings from the
//! [`Device`] handle passed to `new_device`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vhost_backend::{BackendConfig, DeviceRegistry, SocketEndpoint, VhostEvents};
//!
//! struct Datapath;
//!
//! impl VhostEvents for Datapath {
//!     fn new_device(&self, vid: usize) -> std::io::Result<()> {
//!         // Spawn polling threads against the now-ready device.
//!         Ok(())
//!     }
//!     fn destroy_device(&self, vid: usize) {
//!         // Quiesce them again.
//!     }
//! }
//!
//! let registry = DeviceRegistry::new();
//! let _endpoint = SocketEndpoint::register(
//!     &registry,
//!     "/tmp/vhost-net0.sock",
//!     BackendConfig::new(),
//!     Arc::new(Datapath),
//! )
//! .unwrap();
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod dirty_log;
mod error;
pub mod features;
pub mod fd_man;
pub mod inflight;
pub mod iotlb;
pub mod memory;
pub mod message;
pub mod postcopy;
pub mod registry;
pub mod socket;
pub mod vdpa;
pub mod vduse;
pub mod virtqueue;

pub use config::{BackendConfig, MsgResult, VhostEvents};
pub use connection::{host_notifier_ctrl, slave_config_change, Connection};
pub use device::{Device, Transport};
pub use error::{Error, Result};
pub use features::{DeviceFlags, DeviceStatus, ProtocolFeatures};
pub use memory::{GuestPage, MemoryRegion, MemoryTable};
pub use registry::{DeviceRegistry, MAX_VHOST_DEVICE};
pub use socket::SocketEndpoint;
pub use vdpa::VdpaDevice;
pub use vduse::{create_device as vduse_create_device, VduseDeviceHandle};
pub use virtqueue::{Vring, VringState};
