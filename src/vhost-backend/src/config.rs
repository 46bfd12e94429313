// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Per-endpoint configuration and the datapath callback interface.

use std::time::Duration;

use crate::features::{supported_features, ProtocolFeatures};
use crate::message::Message;

/// Result of a message handler or of the pre/post extension hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgResult {
    /// Processed, no reply carried.
    Ok,
    /// Processed, the message now holds the reply payload.
    Reply,
    /// Processing failed.
    Err,
    /// The handler did not recognize the request.
    NotHandled,
}

/// What a backend advertises to the frontend, plus local knobs.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Advertised virtio feature bits.
    pub features: u64,
    /// Advertised vhost-user protocol feature bits.
    pub protocol_features: ProtocolFeatures,
    /// Queue pairs reported by `GET_QUEUE_NUM`.
    pub queue_pairs: u32,
    /// Datapath uses asynchronous DMA copies; changes the memory-table
    /// remap discipline and forbids disabling queues with inflight packets.
    pub async_copy: bool,
    /// VDUSE: attempts polling a virtqueue's ready flag before giving up.
    pub vduse_ready_poll_retries: u32,
    /// VDUSE: delay between ready polls.
    pub vduse_ready_poll_interval: Duration,
    /// VDUSE: maximum queue size configured at device creation.
    pub vduse_max_queue_size: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            features: supported_features(),
            protocol_features: ProtocolFeatures::supported(),
            queue_pairs: 1,
            async_copy: false,
            vduse_ready_poll_retries: 100,
            vduse_ready_poll_interval: Duration::from_millis(1),
            vduse_max_queue_size: 1024,
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Withdraw feature bits from the advertisement.
    pub fn disable_features(mut self, mask: u64) -> Self {
        self.features &= !mask;
        self
    }

    pub fn disable_protocol_features(mut self, mask: ProtocolFeatures) -> Self {
        self.protocol_features &= !mask;
        self
    }

    pub fn queue_pairs(mut self, pairs: u32) -> Self {
        self.queue_pairs = pairs;
        self
    }

    pub fn async_copy(mut self, enable: bool) -> Self {
        self.async_copy = enable;
        self
    }

    pub fn vduse_ready_poll(mut self, retries: u32, interval: Duration) -> Self {
        self.vduse_ready_poll_retries = retries;
        self.vduse_ready_poll_interval = interval;
        self
    }
}

/// Datapath-side callbacks, invoked from the control thread.
///
/// `pre_msg_handle`/`post_msg_handle` bracket the built-in dispatch and give
/// protocol dialects (crypto sessions, external device models) a chance to
/// claim a message.
pub trait VhostEvents: Send + Sync {
    /// The device is fully set up; start consuming its rings. Returning an
    /// error keeps the device out of the RUNNING state.
    fn new_device(&self, vid: usize) -> std::io::Result<()>;

    /// Stop touching the device; rings and memory may change after this
    /// returns.
    fn destroy_device(&self, vid: usize);

    fn vring_state_changed(&self, _vid: usize, _vring: u32, _enabled: bool) {}

    fn features_changed(&self, _vid: usize, _features: u64) {}

    /// VDUSE only: the control queue's kick descriptor fired.
    fn control_queue_kick(&self, _vid: usize) {}

    fn pre_msg_handle(&self, _vid: usize, _msg: &mut Message) -> MsgResult {
        MsgResult::NotHandled
    }

    fn post_msg_handle(&self, _vid: usize, _msg: &mut Message) -> MsgResult {
        MsgResult::NotHandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::VIRTIO_F_RING_PACKED;

    #[test]
    fn builder_withdraws_features() {
        let config = BackendConfig::new()
            .disable_features(1 << VIRTIO_F_RING_PACKED)
            .disable_protocol_features(ProtocolFeatures::HOST_NOTIFIER)
            .queue_pairs(4);
        assert_eq!(config.features & (1 << VIRTIO_F_RING_PACKED), 0);
        assert!(!config
            .protocol_features
            .contains(ProtocolFeatures::HOST_NOTIFIER));
        assert!(config.protocol_features.contains(ProtocolFeatures::MQ));
        assert_eq!(config.queue_pairs, 4);
    }
}
