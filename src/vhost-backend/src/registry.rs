// Copyright (C) 2024 The vhost-backend contributors.
// SPDX-License-Identifier: Apache-2.0

//! The process-wide device table: a fixed number of slots addressed by the
//! small integer id (`vid`) every public API takes.

use std::sync::{Arc, Mutex};

use log::info;

use crate::config::VhostEvents;
use crate::device::{Device, Transport};
use crate::{Error, Result};

/// Slot capacity; a `vid` is always below this.
pub const MAX_VHOST_DEVICE: usize = 1024;

/// Owning handle over the device table. Created once by the library user;
/// there is no hidden global.
pub struct DeviceRegistry {
    slots: Mutex<Vec<Option<Arc<Device>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry {
            slots: Mutex::new(vec![None; MAX_VHOST_DEVICE]),
        })
    }

    /// Allocate the lowest free slot for a new device.
    pub(crate) fn new_device(
        &self,
        ifname: &str,
        events: Arc<dyn VhostEvents>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Device>> {
        let mut slots = self.slots.lock().unwrap();
        let vid = slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::DeviceTableFull)?;
        let dev = Device::new(vid, ifname.to_owned(), events, transport);
        slots[vid] = Some(Arc::clone(&dev));
        info!("({ifname}) new device, handle is {vid}");
        Ok(dev)
    }

    /// Look a device up by vid.
    pub fn get(&self, vid: usize) -> Result<Arc<Device>> {
        self.slots
            .lock()
            .unwrap()
            .get(vid)
            .and_then(Clone::clone)
            .ok_or(Error::DeviceNotFound(vid))
    }

    pub fn find_by_ifname(&self, ifname: &str) -> Option<Arc<Device>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|d| d.ifname() == ifname)
            .cloned()
    }

    /// Stop and free a device, releasing its slot.
    pub fn destroy_device(&self, vid: usize) {
        let dev = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(vid) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        if let Some(dev) = dev {
            dev.notify_destroy();
            dev.cleanup(true);
            info!("({}) device {vid} destroyed", dev.ifname());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MsgResult;
    use crate::device::DeviceState;
    use crate::message::Message;
    use crate::virtqueue::VringState;

    struct NopEvents;

    impl VhostEvents for NopEvents {
        fn new_device(&self, _vid: usize) -> std::io::Result<()> {
            Ok(())
        }
        fn destroy_device(&self, _vid: usize) {}
        fn pre_msg_handle(&self, _vid: usize, _msg: &mut Message) -> MsgResult {
            MsgResult::NotHandled
        }
    }

    struct NopTransport;

    impl Transport for NopTransport {
        fn iotlb_miss(&self, _dev: &Device, _iova: u64, _perm: u8) -> Result<()> {
            Ok(())
        }
        fn inject_irq(&self, _dev: &Device, _vq: &VringState) -> Result<()> {
            Ok(())
        }
    }

    fn new_dev(registry: &DeviceRegistry, name: &str) -> Arc<Device> {
        registry
            .new_device(name, Arc::new(NopEvents), Arc::new(NopTransport))
            .unwrap()
    }

    #[test]
    fn vids_are_lowest_free_slot() {
        let registry = DeviceRegistry::new();
        let a = new_dev(&registry, "a");
        let b = new_dev(&registry, "b");
        assert_eq!(a.vid(), 0);
        assert_eq!(b.vid(), 1);

        registry.destroy_device(0);
        let c = new_dev(&registry, "c");
        assert_eq!(c.vid(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn lookup_validates_vid() {
        let registry = DeviceRegistry::new();
        assert!(matches!(registry.get(0), Err(Error::DeviceNotFound(0))));
        assert!(matches!(
            registry.get(MAX_VHOST_DEVICE + 5),
            Err(Error::DeviceNotFound(_))
        ));

        let dev = new_dev(&registry, "a");
        assert!(Arc::ptr_eq(&registry.get(dev.vid()).unwrap(), &dev));
        assert!(registry.find_by_ifname("a").is_some());
        assert!(registry.find_by_ifname("zzz").is_none());
    }

    #[test]
    fn destroy_releases_resources() {
        let registry = DeviceRegistry::new();
        let dev = new_dev(&registry, "a");
        dev.state.lock().unwrap().ensure_vring(0).unwrap();
        registry.destroy_device(dev.vid());
        assert!(registry.get(0).is_err());
        // The caller's Arc still works, but the device is cleaned.
        let state: &Mutex<DeviceState> = &dev.state;
        assert!(state.lock().unwrap().mem.is_none());
    }
}
