//! Platform transport contract.
//!
//! This module contains the traits the core drives to reach the bus: a
//! [`Transport`] enumerates nodes, opens channels and publishes the local
//! advertisement; a [`Channel`] carries asynchronous addressed transfers
//! to one open node.  The core holds "a transport" and never branches on
//! platform type.
//!
//! # Possible implementations
//!
//! - [`linux`]: the kernel firewire character-device protocol
//!   (`/dev/fw*`, ioctl submission, `poll(2)`/`read(2)` completion)
//! - Scripted in-memory transports for tests
//!
//! # Contract notes
//!
//! Per-candidate permission failures during [`Transport::enumerate`] are
//! reported as [`Candidate::Denied`] items rather than failing the scan;
//! the lifecycle layer decides whether an all-denied scan is a permission
//! error.  Completions drained from [`Channel::wait`] are correlated by
//! token, never by arrival order: a channel may legally complete
//! submissions in any order.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

#[cfg(target_os = "linux")]
pub mod linux;

use std::time::Duration;

use crate::Result;
use crate::csr::ROM_QUADLETS;

/// Number of quadlets in the published unit directory.
pub const UNIT_DIR_QUADLETS: usize = 13;

/// A unit directory as handed to [`Transport::publish_advertisement`].
pub type UnitDirectory = [u32; UNIT_DIR_QUADLETS];

/// ROM key under which a unit directory is published (directory | unit).
pub const UNIT_DIR_KEY: u32 = (0xc0 | 0x11) << 24;

/// SBP-2 unit directory advertised on the local node.  Presenting this
/// capability set is what convinces peer OS drivers to serve our DMA
/// requests.
pub(crate) const SBP2_UNIT_DIR: UnitDirectory = [
    0x0c00_83c0, // node capabilities
    0x1200_609e, // specifier id: NCITS/T10
    0x1301_0483, // version: SBP-2
    0x2100_0001, // revision
    0x3a00_0a08, // unit characteristics
    0x3800_609e, // command set specifier id
    0x3901_04d8, // command set: SPC-2
    0x3b00_0000, // command set revision
    0x3c00_0001, // firmware revision
    0x5400_4000, // management agent offset
    0x3d00_0002, // reconnect timeout
    0x1400_0000, // logical unit number 0
    0x1700_0021, // model id
];

/// Snapshot of one bus node taken at enumeration time.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Transport-specific locator used to open the node later (a device
    /// path on Linux).
    pub locator: String,
    /// Topology-relative address.  Reused across bus resets, so not an
    /// identity; the GUID inside `rom` is.
    pub node_id: u16,
    /// Topology epoch the snapshot was taken in.
    pub generation: u32,
    /// Whether this is the local controller's own node.
    pub is_local: bool,
    /// The node's configuration ROM, host-order quadlets.
    pub rom: [u32; ROM_QUADLETS],
}

/// One candidate reported by a bus scan.
#[derive(Debug, Clone)]
pub enum Candidate {
    /// A node that was probed successfully.
    Node(NodeInfo),
    /// A node skipped because the process may not open it.
    Denied,
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Wire shape of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Single-quadlet primitive, used for 4-byte transfers.
    Quadlet,
    /// Block primitive, used for every other length.
    Block,
}

impl TransferKind {
    /// Shape for a transfer of `len` bytes.
    pub fn for_len(len: usize) -> Self {
        if len == 4 {
            TransferKind::Quadlet
        } else {
            TransferKind::Block
        }
    }
}

/// One asynchronous transfer handed to a channel.
#[derive(Debug)]
pub struct Submission<'a> {
    pub direction: Direction,
    pub kind: TransferKind,
    /// Device-relative address, already masked to 48 bits.
    pub addr: u64,
    /// Bytes to transfer.
    pub len: usize,
    /// Payload for writes; `None` for reads.  Only borrowed for the
    /// duration of [`Channel::submit`].
    pub data: Option<&'a [u8]>,
    /// Correlation token echoed back in the matching [`Completion`].
    pub token: u32,
    /// Topology epoch of the initiating device handle; the platform fails
    /// the transfer if the bus has moved on.
    pub generation: u32,
}

/// Transport-classified outcome of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The transfer completed.
    Complete,
    /// The topology epoch advanced; the initiating handle is stale.
    BusReset,
    /// The device rejected the transfer as busy.
    Busy,
    /// Any other transfer fault.
    Failed,
}

/// One completion event drained from a channel.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Token of the originating [`Submission`].
    pub token: u32,
    pub status: CompletionStatus,
    /// Response payload for reads; empty for writes.
    pub data: Vec<u8>,
}

/// An open request/response channel to one node.
///
/// A channel is owned by whichever call is currently executing against its
/// device; the contract does not support concurrent batches.
pub trait Channel {
    /// Largest number of submissions that may be outstanding at once.
    /// May be as low as one on constrained platforms.
    fn capacity(&self) -> usize;

    /// Hand one transfer to the platform.  A rejection is classified into
    /// the crate error taxonomy.
    fn submit(&mut self, sub: Submission<'_>) -> Result<()>;

    /// Block until one completion arrives, or fail with
    /// [`crate::Error::IoTimeout`] once `timeout` passes.
    fn wait(&mut self, timeout: Duration) -> Result<Completion>;

    /// Reclaim the outstanding submission correlated by `token`.  Invoked
    /// on every abort path so no asynchronous work is left attached to the
    /// device when control returns to the caller.
    fn cancel(&mut self, token: u32);
}

/// A platform's view of the local bus controller.
pub trait Transport {
    /// Scan the bus, reporting every node including the local one (flagged
    /// via [`NodeInfo::is_local`]) and a [`Candidate::Denied`] marker for
    /// each node the process may not open.
    fn enumerate(&mut self) -> Result<Vec<Candidate>>;

    /// Open a request/response channel to a previously enumerated node.
    /// Closing is dropping the returned channel.
    fn open(&mut self, node: &NodeInfo) -> Result<Box<dyn Channel>>;

    /// Publish `dir` as a unit directory in the local node's ROM.  The bus
    /// typically resets as a side effect.
    fn publish_advertisement(&mut self, dir: &UnitDirectory) -> Result<()>;

    /// Withdraw a previously published advertisement.  No-op if nothing is
    /// published.
    fn unpublish(&mut self);
}
