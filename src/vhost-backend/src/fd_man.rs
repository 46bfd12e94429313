// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! A small callback-dispatching epoll loop. The VDUSE adapter hangs its
//! chardev, control-queue kick and reconnect descriptors off one of these.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;

use epoll::{ControlOptions, Event, Events};
use log::{error, warn};

use crate::Result;

/// Handler for one readable descriptor. Setting the flag to true removes
/// the descriptor from the set after the handler returns.
pub type FdHandler = Box<dyn FnMut(RawFd, &mut bool) + Send>;

struct FdSetInner {
    epfd: RawFd,
    handlers: Mutex<HashMap<RawFd, FdHandler>>,
}

/// Shared handle on the event loop; dropping all handles leaves the loop
/// thread parked on an empty set.
#[derive(Clone)]
pub struct FdSet {
    inner: Arc<FdSetInner>,
}

impl FdSet {
    /// Create the set and spawn its dispatch thread.
    pub fn new(name: &str) -> Result<FdSet> {
        let epfd = epoll::create(true)?;
        let inner = Arc::new(FdSetInner {
            epfd,
            handlers: Mutex::new(HashMap::new()),
        });

        let loop_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || event_loop(loop_inner))?;

        Ok(FdSet { inner })
    }

    /// Watch `fd` for readability.
    pub fn add(&self, fd: RawFd, handler: FdHandler) -> Result<()> {
        self.inner.handlers.lock().unwrap().insert(fd, handler);
        if let Err(e) = epoll::ctl(
            self.inner.epfd,
            ControlOptions::EPOLL_CTL_ADD,
            fd,
            Event::new(Events::EPOLLIN, fd as u64),
        ) {
            self.inner.handlers.lock().unwrap().remove(&fd);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop watching `fd`. The descriptor itself stays open.
    pub fn del(&self, fd: RawFd) {
        self.inner.handlers.lock().unwrap().remove(&fd);
        if let Err(e) = epoll::ctl(
            self.inner.epfd,
            ControlOptions::EPOLL_CTL_DEL,
            fd,
            Event::new(Events::empty(), 0),
        ) {
            warn!("failed to remove fd {fd} from event set: {e}");
        }
    }
}

fn event_loop(inner: Arc<FdSetInner>) {
    let mut buf = [Event::new(Events::empty(), 0); 32];
    loop {
        let n = match epoll::wait(inner.epfd, 1000, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    error!("epoll wait failed: {e}");
                }
                continue;
            }
        };

        for event in &buf[..n] {
            let fd = event.data as RawFd;
            // The handler runs without the map lock so it can add or
            // remove descriptors itself.
            let Some(mut handler) = inner.handlers.lock().unwrap().remove(&fd) else {
                continue;
            };
            let mut remove = false;
            handler(fd, &mut remove);
            if remove {
                let _ = epoll::ctl(
                    inner.epfd,
                    ControlOptions::EPOLL_CTL_DEL,
                    fd,
                    Event::new(Events::empty(), 0),
                );
            } else {
                inner.handlers.lock().unwrap().entry(fd).or_insert(handler);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::mpsc;
    use std::time::Duration;
    use vmm_sys_util::eventfd::EventFd;

    #[test]
    fn dispatches_readable_fd() {
        let set = FdSet::new("fdset-test").unwrap();
        let efd = EventFd::new(0).unwrap();
        let (tx, rx) = mpsc::channel();

        let reader = efd.try_clone().unwrap();
        set.add(
            efd.as_raw_fd(),
            Box::new(move |_fd, _remove| {
                let _ = reader.read();
                tx.send(()).unwrap();
            }),
        )
        .unwrap();

        efd.write(1).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        set.del(efd.as_raw_fd());
    }

    #[test]
    fn one_shot_removal() {
        let set = FdSet::new("fdset-oneshot").unwrap();
        let efd = EventFd::new(0).unwrap();
        let (tx, rx) = mpsc::channel();

        let reader = efd.try_clone().unwrap();
        set.add(
            efd.as_raw_fd(),
            Box::new(move |_fd, remove| {
                let _ = reader.read();
                tx.send(()).unwrap();
                *remove = true;
            }),
        )
        .unwrap();

        efd.write(1).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The handler removed itself; another write stays unanswered.
        efd.write(1).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
