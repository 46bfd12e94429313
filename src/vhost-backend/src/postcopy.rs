// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! Postcopy live migration: a userfaultfd covering guest memory, handed to
//! the frontend so it can service missing-page faults remotely.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::info;

use crate::{Error, Result};

const UFFD_API: u64 = 0xaa;
const UFFDIO: u8 = 0xaa;
pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

nix::ioctl_readwrite!(uffdio_api, UFFDIO, 0x3f, UffdioApi);
nix::ioctl_readwrite!(uffdio_register, UFFDIO, 0x00, UffdioRegister);

/// An initialized userfaultfd.
#[derive(Debug)]
pub struct Userfaultfd {
    fd: OwnedFd,
}

impl Userfaultfd {
    /// Create the descriptor and complete the API handshake.
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall, result checked below.
        let raw = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if raw < 0 {
            return Err(Error::Syscall(nix::errno::Errno::last()));
        }
        // SAFETY: the syscall returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };

        let mut api = UffdioApi {
            api: UFFD_API,
            ..Default::default()
        };
        // SAFETY: `api` outlives the call.
        unsafe { uffdio_api(fd.as_raw_fd(), &mut api) }?;

        Ok(Userfaultfd { fd })
    }

    /// Register a mapped range for missing-page events. Ranges are whole
    /// mmap areas so registration stays page aligned.
    pub fn register(&self, start: u64, len: u64) -> Result<()> {
        let mut reg = UffdioRegister {
            range: UffdioRange { start, len },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        // SAFETY: `reg` outlives the call.
        unsafe { uffdio_register(self.fd.as_raw_fd(), &mut reg) }?;
        info!(
            "userfaultfd registered for range {start:#x} - {:#x}",
            start + len - 1
        );
        Ok(())
    }
}

impl AsRawFd for Userfaultfd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
