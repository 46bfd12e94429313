// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! The vhost-user UNIX socket endpoint: accepts frontend connections and
//! gives each one a device plus a control thread running the dispatcher.

use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{error, info};

use crate::config::{BackendConfig, VhostEvents};
use crate::connection::{Connection, VhostUserTransport};
use crate::registry::DeviceRegistry;
use crate::Result;

/// A bound vhost-user server socket. Dropping the endpoint unlinks the
/// socket path; connections already accepted keep running until their
/// frontend disconnects.
pub struct SocketEndpoint {
    path: PathBuf,
}

impl SocketEndpoint {
    /// Bind `path` and start accepting frontends. A stale socket file from
    /// a previous run is removed first.
    pub fn register<P: AsRef<Path>>(
        registry: &Arc<DeviceRegistry>,
        path: P,
        config: BackendConfig,
        events: Arc<dyn VhostEvents>,
    ) -> Result<SocketEndpoint> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        info!("vhost-user server: socket created, waiting for connections on {path:?}");

        let registry = Arc::clone(registry);
        let config = Arc::new(config);
        let ifname = path.to_string_lossy().into_owned();
        thread::Builder::new()
            .name("vhost-events".to_owned())
            .spawn(move || accept_loop(listener, registry, ifname, config, events))?;

        Ok(SocketEndpoint { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn accept_loop(
    listener: UnixListener,
    registry: Arc<DeviceRegistry>,
    ifname: String,
    config: Arc<BackendConfig>,
    events: Arc<dyn VhostEvents>,
) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("({ifname}) accept failed: {e}");
                return;
            }
        };
        info!("({ifname}) new vhost user connection");

        let dev = match registry.new_device(&ifname, Arc::clone(&events), Arc::new(VhostUserTransport))
        {
            Ok(dev) => dev,
            Err(e) => {
                error!("({ifname}) failed to create device: {e}");
                continue;
            }
        };

        {
            let mut state = dev.state.lock().unwrap();
            state.async_copy = config.async_copy;
        }

        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        let result = thread::Builder::new()
            .name(format!("vhost-{}", dev.vid()))
            .spawn(move || {
                let vid = dev.vid();
                Connection::new(dev, stream, config).run();
                registry.destroy_device(vid);
            });
        if let Err(e) = result {
            error!("({ifname}) failed to spawn connection thread: {e}");
        }
    }
}
