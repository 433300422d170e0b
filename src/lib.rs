//! Forensic memory access to devices attached to an IEEE 1394 (FireWire)
//! bus.
//!
//! The bus permits an attached device to issue direct memory access against
//! its peers, which makes it a useful acquisition channel for digital
//! forensics: plug a controller into a suspect machine, advertise the right
//! capability, and read its physical memory over the cable.  This crate
//! wraps that workflow in a small, portable API: enumerate the devices
//! attached to the local bus, open one, and issue addressed read/write
//! transfers against its memory space.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► Bus ───────────► Device ──► request batch
//!              │                 │             │
//!              │  enumerate      │ open        │ pipeline engine
//!              ▼                 ▼             ▼
//!            ┌─────────────────────────────────────┐
//!            │            Transport                │
//!            │  (platform: /dev/fw* + ioctl/poll)  │
//!            └─────────────────────────────────────┘
//! ```
//!
//! A [`bus::Bus`] owns the set of [`device::Device`] handles observed on
//! the local bus.  Enumeration is *destructive*: every call to
//! [`bus::Bus::refresh_devices`] destroys the previous device set before
//! scanning again, so stale handles cannot outlive a topology change.  Each
//! device carries the identity decoded from its configuration ROM by
//! [`csr::parse`] - GUID, vendor/product identity and the largest transfer
//! it will accept.
//!
//! Transfers go through the [`pipeline`] engine, which keeps as many
//! asynchronous requests in flight as the platform allows, correlates each
//! completion back to the originating request by token, and classifies
//! failures into the [`Error`] taxonomy below.
//!
//! All platform access happens behind the [`transport::Transport`] and
//! [`transport::Channel`] traits; the core never branches on platform
//! type.  A Linux implementation speaking the kernel firewire
//! character-device protocol is provided in [`transport::linux`].
//!
//! ## Modules
//!
//! - [`bus`] - bus handle, device-set lifecycle, capability advertisement
//! - [`device`] - device handles and read/write entry points
//! - [`csr`] - parser for a node's configuration ROM
//! - [`pipeline`] - bounded-concurrency request execution
//! - [`transport`] - platform contract and the Linux implementation
//!
//! ## Getting started
//!
//! ```no_run
//! use fwprobe::bus::Bus;
//!
//! # fn main() -> fwprobe::Result<()> {
//! let mut bus = Bus::new();
//!
//! // Advertise the capability first; this usually resets the bus.
//! bus.enable_advertisement()?;
//!
//! bus.refresh_devices()?;
//! let dev = &mut bus.devices_mut()[0];
//! dev.open()?;
//!
//! let mut data = [0u8; 512];
//! dev.read(50 * 1024 * 1024, &mut data)?;
//! // data now holds 512 bytes of target memory starting at 50 MiB
//! # Ok(())
//! # }
//! ```
//!
//! The caller owns retry policy: [`Error::Busy`], [`Error::IoTimeout`] and
//! [`Error::BusReset`] are all returned rather than retried internally,
//! since only the caller knows its latency and consistency trade-offs.
//! After a [`Error::BusReset`] the device set must be re-enumerated.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

pub mod bus;
pub mod csr;
pub mod device;
pub mod pipeline;
pub mod transport;

/// Classified outcome of a failed bus or device operation.
///
/// The taxonomy is flat: each variant is a terminal classification, not a
/// severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Unclassified failure.
    #[error("unclassified error")]
    Other,
    /// The bus topology changed; every device handle captured before the
    /// reset is stale and the caller must re-enumerate.
    #[error("bus reset, device handles are stale")]
    BusReset,
    /// The process may not access the device node.
    #[error("permission denied")]
    NoPermission,
    /// The device rejected the transfer as busy; transient, the caller may
    /// retry.
    #[error("device busy")]
    Busy,
    /// General transfer fault.
    #[error("transfer failed")]
    Io,
    /// The platform rejected the transfer length.
    #[error("transfer size rejected")]
    BadIoSize,
    /// No completion arrived within the wait budget.
    #[error("request timed out")]
    IoTimeout,
}

/// Type to represent the result of a bus or device operation.
pub type Result<T> = core::result::Result<T, Error>;
