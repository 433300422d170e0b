//! Bus handle and device-set lifecycle.
//!
//! A [`Bus`] represents the local controller context.  It owns the set of
//! [`Device`] handles observed during the most recent scan and mediates
//! everything that touches the platform transport: capability
//! advertisement, enumeration, and channel setup.
//!
//! Enumeration is destructive by design.  [`Bus::refresh_devices`]
//! destroys every handle from the previous scan - closing it, firing the
//! destruction callback, releasing its platform resources - before the new
//! set is built, so a handle can never silently refer to a node that has
//! moved or vanished.  The borrow rules make this visible at compile time:
//! device handles are borrowed out of the bus and cannot be held across a
//! refresh.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::device::Device;
use crate::transport::{Candidate, SBP2_UNIT_DIR, Transport};
use crate::{Error, Result};

/// Callback fired once per device handle as it is destroyed, after the
/// device has been closed but before its resources are released.
pub type OnDestroy = Box<dyn FnMut(&Device)>;

/// Handle to the local bus.
///
/// Dropping the bus destroys all devices (with callbacks), withdraws the
/// advertisement if one was published, and releases the transport.
pub struct Bus {
    transport: Rc<RefCell<dyn Transport>>,
    devices: Vec<Device>,
    advertised: bool,
    on_destroy: Option<OnDestroy>,
    user_data: Option<Box<dyn Any>>,
}

impl Bus {
    /// Bus over the platform's native transport.
    #[cfg(target_os = "linux")]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_transport(crate::transport::linux::LinuxTransport::new())
    }

    /// Bus over an explicit transport.  This is the seam tests and
    /// additional platforms plug into.
    pub fn with_transport<T: Transport + 'static>(transport: T) -> Self {
        Self {
            transport: Rc::new(RefCell::new(transport)),
            devices: Vec::new(),
            advertised: false,
            on_destroy: None,
            user_data: None,
        }
    }

    /// Publish the SBP-2 unit directory on the local node, declaring the
    /// capability peers require before they serve DMA requests.
    ///
    /// May be called at most once per bus; a second call fails without
    /// touching the transport.  Publishing typically resets the bus, so
    /// call this immediately after creating the bus, before enumerating
    /// devices.
    pub fn enable_advertisement(&mut self) -> Result<()> {
        if self.advertised {
            return Err(Error::Other);
        }

        self.transport
            .borrow_mut()
            .publish_advertisement(&SBP2_UNIT_DIR)?;
        self.advertised = true;

        info!("capability advertisement published");
        Ok(())
    }

    /// Rescan the bus and rebuild the device set, returning how many
    /// devices were found.
    ///
    /// Every handle from the previous scan is destroyed first; the
    /// destruction callback (if registered) fires once per handle in the
    /// set's order.  The new set is in transport enumeration order, which
    /// is not stable across calls.
    ///
    /// A scan in which every candidate was unreadable for permission
    /// reasons fails with [`Error::NoPermission`]; if at least one node
    /// was usable the scan succeeds with the usable subset.
    pub fn refresh_devices(&mut self) -> Result<usize> {
        self.destroy_devices();

        let candidates = self.transport.borrow_mut().enumerate()?;

        let mut denied = 0usize;
        for candidate in candidates {
            match candidate {
                Candidate::Node(node) if node.is_local => {
                    trace!("skipping local node {:#06x}", node.node_id)
                }
                Candidate::Node(node) => {
                    self.devices.push(Device::new(self.transport.clone(), node));
                }
                Candidate::Denied => denied += 1,
            }
        }

        if self.devices.is_empty() && denied > 0 {
            // Nothing usable and at least one node was unreadable: surface
            // the permission problem rather than reporting an empty bus.
            warn!("all {denied} candidate node(s) denied");
            return Err(Error::NoPermission);
        }

        debug!(
            "enumerated {} device(s), {} candidate(s) skipped",
            self.devices.len(),
            denied
        );
        Ok(self.devices.len())
    }

    /// The current device set, in enumeration order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Mutable access to the current device set.
    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    /// Register a callback fired once per device handle as it is
    /// destroyed, whether by a refresh or by bus destruction.
    pub fn set_on_destroy(&mut self, callback: impl FnMut(&Device) + 'static) {
        self.on_destroy = Some(Box::new(callback));
    }

    /// Attach arbitrary caller state to the bus.
    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    /// Caller state previously attached with [`Self::set_user_data`].
    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_deref()
    }

    // Internal functions

    /// Destroy the whole device set: close each device, fire the
    /// destruction callback, then release the handle and its platform
    /// resources.
    fn destroy_devices(&mut self) {
        for mut device in self.devices.drain(..) {
            device.close();
            if let Some(callback) = self.on_destroy.as_mut() {
                callback(&device);
            }
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.destroy_devices();

        if self.advertised {
            self.transport.borrow_mut().unpublish();
            self.advertised = false;
        }
    }
}
