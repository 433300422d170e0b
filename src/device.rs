//! Device handles and addressed read/write transfers.
//!
//! A [`Device`] represents one foreign node observed on the bus at
//! enumeration time.  Handles are created by
//! [`crate::bus::Bus::refresh_devices`] and owned by the bus; the node id
//! and generation they carry are a snapshot of the topology at that
//! moment, so a bus reset makes every existing handle stale.  Identity
//! fields (GUID, vendor/product) are decoded from the node's
//! configuration ROM once, at construction.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::csr::{self, ROM_QUADLETS, RomInfo};
use crate::pipeline::{self, DEFAULT_REQUEST_TIMEOUT, ReadRequest, WriteRequest};
use crate::Result;
use crate::transport::{Channel, NodeInfo, Transport};

/// One foreign node attached to the bus.
///
/// Reads and writes require the device to be open; issuing them against a
/// closed device is a caller contract violation and panics.  All transfer
/// outcomes, including the transient ones ([`crate::Error::Busy`],
/// [`crate::Error::IoTimeout`]) and the staleness signal
/// ([`crate::Error::BusReset`]), are returned to the caller - nothing is
/// retried internally.
pub struct Device {
    transport: Rc<RefCell<dyn Transport>>,
    node: NodeInfo,
    info: RomInfo,
    channel: Option<Box<dyn Channel>>,
    request_timeout: Duration,
    user_data: Option<Box<dyn Any>>,
}

impl Device {
    pub(crate) fn new(transport: Rc<RefCell<dyn Transport>>, node: NodeInfo) -> Self {
        let info = csr::parse(&node.rom);

        debug!(
            "node {:#06x} gen {}: guid {:#018x} vendor {:#x} \"{}\" product {:#x} \"{}\"",
            node.node_id,
            node.generation,
            info.guid,
            info.vendor_id,
            info.vendor_name,
            info.product_id,
            info.product_name,
        );

        Self {
            transport,
            node,
            info,
            channel: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_data: None,
        }
    }

    /// Open a channel to the device.  Required before any transfer; a
    /// second open is a no-op success.
    pub fn open(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }

        let channel = self.transport.borrow_mut().open(&self.node)?;
        debug!("opened device {:#06x}", self.node.node_id);
        self.channel = Some(channel);

        Ok(())
    }

    /// Close the device's channel.  No-op when already closed.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("closed device {:#06x}", self.node.node_id);
        }
    }

    /// Whether the device is open.
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Read `buf.len()` bytes of device memory starting at `addr`.
    ///
    /// Transfers larger than [`Self::max_request_size`] are typically
    /// rejected by the device; chunking is the caller's policy.
    ///
    /// # Panics
    ///
    /// Panics if the device is not open.
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut reqs = [ReadRequest { addr, buf }];
        self.read_batch(&mut reqs)
    }

    /// Execute a batch of read requests with bounded in-flight
    /// concurrency.  On failure the whole batch is aborted and buffer
    /// contents are unspecified.
    ///
    /// # Panics
    ///
    /// Panics if the device is not open.
    pub fn read_batch(&mut self, reqs: &mut [ReadRequest<'_>]) -> Result<()> {
        let timeout = self.request_timeout;
        let generation = self.node.generation;
        let chan = self.channel_mut();
        pipeline::run_reads(chan, generation, reqs, timeout)
    }

    /// Write `data` to device memory starting at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the device is not open.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let reqs = [WriteRequest { addr, data }];
        self.write_batch(&reqs)
    }

    /// Execute a batch of write requests with bounded in-flight
    /// concurrency.
    ///
    /// # Panics
    ///
    /// Panics if the device is not open.
    pub fn write_batch(&mut self, reqs: &[WriteRequest<'_>]) -> Result<()> {
        let timeout = self.request_timeout;
        let generation = self.node.generation;
        let chan = self.channel_mut();
        pipeline::run_writes(chan, generation, reqs, timeout)
    }

    /// Topology-relative node id the handle was captured with.  Not an
    /// identity; it can be reused across topology changes.
    pub fn node_id(&self) -> u16 {
        self.node.node_id
    }

    /// Topology epoch the handle was captured in.
    pub fn generation(&self) -> u32 {
        self.node.generation
    }

    /// Stable 48-bit identity of the node.
    pub fn guid(&self) -> u64 {
        self.info.guid
    }

    /// Largest single transfer the device accepts, in bytes.
    pub fn max_request_size(&self) -> usize {
        self.info.max_request_size
    }

    /// Numeric vendor identifier, 0 if the ROM does not define one.
    pub fn vendor_id(&self) -> u32 {
        self.info.vendor_id
    }

    /// Vendor display name, empty if the ROM does not define one.
    pub fn vendor_name(&self) -> &str {
        &self.info.vendor_name
    }

    /// Numeric product identifier, 0 if the ROM does not define one.
    pub fn product_id(&self) -> u32 {
        self.info.product_id
    }

    /// Product display name, empty if the ROM does not define one.
    pub fn product_name(&self) -> &str {
        &self.info.product_name
    }

    /// The raw 1024-byte configuration ROM copied at enumeration time.
    pub fn csr(&self) -> &[u32; ROM_QUADLETS] {
        &self.node.rom
    }

    /// Replace the per-wait completion budget used by this device's
    /// transfers.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Attach arbitrary caller state to the handle.
    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    /// Caller state previously attached with [`Self::set_user_data`].
    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_deref()
    }

    fn channel_mut(&mut self) -> &mut dyn Channel {
        // Transfers against a closed device are a contract violation, not
        // a runtime condition.
        self.channel
            .as_deref_mut()
            .expect("device must be open before issuing transfers")
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("node_id", &self.node.node_id)
            .field("generation", &self.node.generation)
            .field("guid", &self.info.guid)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
