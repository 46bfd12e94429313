// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the vhost-user/VDUSE control plane.

use std::io;

/// Errors surfaced by the control plane.
///
/// The taxonomy matters for recovery: a [`Error::MalformedMessage`] family
/// error is local to one message (received descriptors are closed, the
/// connection keeps reading), while [`Error::Disconnected`] tears the whole
/// device down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Message header could not be read or carries a bad version.
    #[error("invalid message header")]
    InvalidHeader,
    /// Payload size field exceeds the wire maximum or the read came up short.
    #[error("invalid message payload size {0}")]
    InvalidPayloadSize(u32),
    /// The number of ancillary descriptors does not match the request.
    #[error("expected {expected} descriptors for request {request}, received {received}")]
    DescriptorMismatch {
        request: u32,
        expected: usize,
        received: usize,
    },
    /// Request id outside the handled vocabulary.
    #[error("unhandled request {0}")]
    UnhandledRequest(u32),
    /// Vring index beyond the per-device maximum.
    #[error("invalid vring index {0}")]
    InvalidVringIndex(u32),
    /// Negotiated bits are not a subset of the advertised ones.
    #[error("feature negotiation failed")]
    FeatureMismatch,
    /// The message is valid but arrived in a state where it cannot apply.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// mmap/memfd/ftruncate failure or an exhausted fixed-size table.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A size + offset pair that wraps the address space.
    #[error("size {size:#x} and offset {offset:#x} overflow")]
    MapOverflow { size: u64, offset: u64 },
    /// A ring or log address that does not resolve in the current tables.
    #[error("address {0:#x} does not translate")]
    TranslationMiss(u64),
    /// The device registry has no free slot.
    #[error("device table is full")]
    DeviceTableFull,
    /// A vid that is out of bounds or names an empty slot.
    #[error("device {0} not found")]
    DeviceNotFound(usize),
    /// The peer closed the socket; the device must be torn down.
    #[error("peer closed the connection")]
    Disconnected,
    /// The backend channel peer nacked or answered out of order.
    #[error("backend channel request failed")]
    BackendChannel,
    #[error("vduse: {0}")]
    Vduse(&'static str),
    #[error("syscall failed: {0}")]
    Syscall(#[from] nix::errno::Errno),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
