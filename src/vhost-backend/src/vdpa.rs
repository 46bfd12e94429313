// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Interface to an attached vDPA hardware device.
//!
//! The control plane only drives the callbacks at lifecycle transitions;
//! device classes implement them elsewhere.

use std::os::fd::RawFd;

/// Callbacks a vDPA device class registers against a vhost device.
pub trait VdpaDevice: Send + Sync {
    /// Configure the hardware datapath once the device is ready.
    fn dev_conf(&self, vid: usize) -> std::io::Result<()>;

    /// Stop the hardware datapath before memory or rings change.
    fn dev_close(&self, vid: usize);

    /// A queue's readiness flipped.
    fn set_vring_state(&self, _vid: usize, _vring: u32, _enabled: bool) {}

    /// Feature negotiation completed.
    fn set_features(&self, _vid: usize) {}

    /// Live migration finished (`SEND_RARP` observed).
    fn migration_done(&self, _vid: usize) {}

    /// Device teardown.
    fn dev_cleanup(&self, _vid: usize) {}

    /// VFIO device descriptor for host-notifier passthrough.
    fn get_vfio_device_fd(&self, _vid: usize) -> Option<RawFd> {
        None
    }

    /// `(offset, size)` of a queue's notify area within the VFIO region.
    fn get_notify_area(&self, _vid: usize, _qid: u32) -> Option<(u64, u64)> {
        None
    }
}
