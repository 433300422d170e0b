//! Transport speaking the Linux kernel firewire character-device protocol.
//!
//! Every node on every card appears as `/dev/fw<n>`.  The same descriptor
//! is the whole control surface: an info ioctl yields the topology
//! snapshot and a copy of the node's configuration ROM, a send-request
//! ioctl submits an asynchronous transfer, and completions are drained by
//! reading events off the descriptor (readiness via `poll(2)`).  The
//! local node's descriptor additionally accepts unit-directory
//! descriptors, which is how the advertisement is published.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::csr::ROM_QUADLETS;
use crate::transport::{
    Candidate, Channel, Completion, CompletionStatus, Direction, NodeInfo, Submission, Transport,
    TransferKind, UNIT_DIR_KEY, UnitDirectory,
};
use crate::{Error, Result};

/// Outstanding submissions allowed on one open channel.
const PIPELINE_DEPTH: usize = 16;

/// Event read buffer; large enough for a response carrying a max-sized
/// block payload.
const EVENT_BUF_LEN: usize = 16 * 1024;

// Kernel ABI (linux/firewire-cdev.h, linux/firewire-constants.h)

const FW_CDEV_VERSION: u32 = 4;

const FW_CDEV_EVENT_BUS_RESET: u32 = 0;
const FW_CDEV_EVENT_RESPONSE: u32 = 1;

const TCODE_WRITE_QUADLET_REQUEST: u32 = 0;
const TCODE_WRITE_BLOCK_REQUEST: u32 = 1;
const TCODE_READ_QUADLET_REQUEST: u32 = 4;
const TCODE_READ_BLOCK_REQUEST: u32 = 5;

const RCODE_COMPLETE: u32 = 0;
const RCODE_BUSY: u32 = 0x12;
const RCODE_GENERATION: u32 = 0x13;

// The ABI structs mirror the kernel's layout; several fields exist only
// for the kernel's benefit and are never read on this side.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FwCdevGetInfo {
    version: u32,
    rom_length: u32,
    rom: u64,
    bus_reset: u64,
    bus_reset_closure: u64,
    card: u32,
}

/// Also the layout the info ioctl fills in for its topology snapshot.
#[repr(C)]
#[derive(Default, Clone, Copy)]
#[allow(dead_code)]
struct FwCdevEventBusReset {
    closure: u64,
    event_type: u32,
    node_id: u32,
    local_node_id: u32,
    bm_node_id: u32,
    irm_node_id: u32,
    root_node_id: u32,
    generation: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct FwCdevSendRequest {
    tcode: u32,
    length: u32,
    offset: u64,
    closure: u64,
    data: u64,
    generation: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct FwCdevAddDescriptor {
    immediate: u32,
    key: u32,
    data: u64,
    length: u32,
    handle: u32,
}

// struct fw_cdev_event_response is { closure: u64, type, rcode, length }
// followed by the payload.  The payload sits at byte 20, inside what Rust
// would count as the struct's tail padding, so the offsets are spelled out
// rather than derived from a type.
const EVENT_TYPE_OFFSET: usize = 8;
const EVENT_RESPONSE_RCODE: usize = 12;
const EVENT_RESPONSE_LENGTH: usize = 16;
const EVENT_RESPONSE_DATA: usize = 20;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

/// ioctl request number; '#' is the firewire character-device magic.
const fn ioc(dir: u64, nr: u64, size: usize) -> libc::c_ulong {
    (dir << 30 | (size as u64) << 16 | (b'#' as u64) << 8 | nr) as libc::c_ulong
}

const FW_CDEV_IOC_GET_INFO: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 0x00, mem::size_of::<FwCdevGetInfo>());
const FW_CDEV_IOC_SEND_REQUEST: libc::c_ulong =
    ioc(IOC_WRITE, 0x01, mem::size_of::<FwCdevSendRequest>());
const FW_CDEV_IOC_ADD_DESCRIPTOR: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 0x06, mem::size_of::<FwCdevAddDescriptor>());
const FW_CDEV_IOC_REMOVE_DESCRIPTOR: libc::c_ulong = ioc(IOC_WRITE, 0x07, mem::size_of::<u32>());

/// Transport over the kernel firewire character-device stack.
pub struct LinuxTransport {
    adv: Option<Advertisement>,
}

/// A live advertisement: the descriptor handle, and the open local-node
/// fd whose lifetime bounds it.
struct Advertisement {
    fd: RawFd,
    handle: u32,
}

impl LinuxTransport {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { adv: None }
    }
}

impl Transport for LinuxTransport {
    fn enumerate(&mut self) -> Result<Vec<Candidate>> {
        let mut found = Vec::new();

        for path in node_paths()? {
            let fd = match open_node(&path) {
                Ok(fd) => fd,
                Err(err) if is_permission(&err) => {
                    warn!("no permission for {path}");
                    found.push(Candidate::Denied);
                    continue;
                }
                Err(err) => {
                    // Nodes can vanish between the directory scan and the
                    // open.
                    debug!("skipping {path}: {err}");
                    continue;
                }
            };

            let mut rom = [0u32; ROM_QUADLETS];
            match get_info(fd, Some(&mut rom)) {
                Ok(reset) => found.push(Candidate::Node(NodeInfo {
                    locator: path,
                    node_id: reset.node_id as u16,
                    generation: reset.generation,
                    is_local: reset.node_id == reset.local_node_id,
                    rom,
                })),
                Err(err) => warn!("probing {path} failed: {err}"),
            }

            unsafe { libc::close(fd) };
        }

        Ok(found)
    }

    fn open(&mut self, node: &NodeInfo) -> Result<Box<dyn Channel>> {
        let fd = open_node(&node.locator).map_err(|err| {
            warn!("opening {} failed: {err}", node.locator);
            classify_errno(&err)
        })?;

        debug!("opened {} (node {:#06x})", node.locator, node.node_id);
        Ok(Box::new(CdevChannel {
            fd,
            next_seq: 0,
            pending: Vec::new(),
        }))
    }

    fn publish_advertisement(&mut self, dir: &UnitDirectory) -> Result<()> {
        // Only the local node accepts descriptors; find it.
        for path in node_paths()? {
            let Ok(fd) = open_node(&path) else { continue };

            let reset = match get_info(fd, None) {
                Ok(reset) => reset,
                Err(_) => {
                    unsafe { libc::close(fd) };
                    continue;
                }
            };
            if reset.node_id != reset.local_node_id {
                unsafe { libc::close(fd) };
                continue;
            }

            let mut add = FwCdevAddDescriptor {
                immediate: 0,
                key: UNIT_DIR_KEY,
                data: dir.as_ptr() as u64,
                length: dir.len() as u32,
                handle: 0,
            };
            if unsafe { libc::ioctl(fd, FW_CDEV_IOC_ADD_DESCRIPTOR, &mut add as *mut _) } < 0 {
                let err = io::Error::last_os_error();
                error!("descriptor ioctl on {path} failed: {err}");
                unsafe { libc::close(fd) };
                return Err(Error::Io);
            }

            // The descriptor stays published for as long as the fd stays
            // open.
            debug!("unit directory published via {path}, handle {}", add.handle);
            self.adv = Some(Advertisement {
                fd,
                handle: add.handle,
            });
            return Ok(());
        }

        error!("no accessible local node to publish through");
        Err(Error::Other)
    }

    fn unpublish(&mut self) {
        if let Some(adv) = self.adv.take() {
            unsafe {
                libc::ioctl(adv.fd, FW_CDEV_IOC_REMOVE_DESCRIPTOR, &adv.handle as *const u32);
                libc::close(adv.fd);
            }
            debug!("unit directory withdrawn");
        }
    }
}

impl Drop for LinuxTransport {
    fn drop(&mut self) {
        self.unpublish();
    }
}

/// Channel over one open `/dev/fw*` descriptor.
struct CdevChannel {
    fd: RawFd,
    /// Kernel-side closure for the next submission.  Closures are unique
    /// per channel so a late response to a canceled submission can never
    /// be confused with a live one.
    next_seq: u64,
    /// (closure, engine token) for every outstanding submission.
    pending: Vec<(u64, u32)>,
}

impl Channel for CdevChannel {
    fn capacity(&self) -> usize {
        PIPELINE_DEPTH
    }

    fn submit(&mut self, sub: Submission<'_>) -> Result<()> {
        let tcode = match (sub.direction, sub.kind) {
            (Direction::Read, TransferKind::Quadlet) => TCODE_READ_QUADLET_REQUEST,
            (Direction::Read, TransferKind::Block) => TCODE_READ_BLOCK_REQUEST,
            (Direction::Write, TransferKind::Quadlet) => TCODE_WRITE_QUADLET_REQUEST,
            (Direction::Write, TransferKind::Block) => TCODE_WRITE_BLOCK_REQUEST,
        };

        let seq = self.next_seq;
        let request = FwCdevSendRequest {
            tcode,
            length: sub.len as u32,
            offset: sub.addr,
            closure: seq,
            // The kernel copies write payloads during the ioctl, so the
            // borrow does not need to outlive this call.
            data: sub.data.map_or(0, |d| d.as_ptr() as u64),
            generation: sub.generation,
        };

        if unsafe { libc::ioctl(self.fd, FW_CDEV_IOC_SEND_REQUEST, &request as *const _) } < 0 {
            let err = io::Error::last_os_error();
            debug!("submitting request {} failed: {err}", sub.token);
            return Err(classify_errno(&err));
        }

        self.next_seq += 1;
        self.pending.push((seq, sub.token));
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Completion> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::IoTimeout);
            }

            let mut pollfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
            let ready = unsafe { libc::poll(&mut pollfd as *mut _, 1, millis) };
            if ready == 0 {
                return Err(Error::IoTimeout);
            }
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed: {err}");
                return Err(Error::Io);
            }

            let mut buf = [0u8; EVENT_BUF_LEN];
            let got = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if got < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("event read failed: {err}");
                return Err(Error::Io);
            }
            let event = &buf[..got as usize];

            if event.len() < EVENT_RESPONSE_RCODE {
                continue;
            }
            match read_u32(event, EVENT_TYPE_OFFSET) {
                FW_CDEV_EVENT_RESPONSE => {
                    if let Some(completion) = self.decode_response(event) {
                        return Ok(completion);
                    }
                    // Response for a closure we no longer track, i.e. a
                    // canceled submission; keep waiting.
                }
                FW_CDEV_EVENT_BUS_RESET => {
                    // Topology changed under us; the affected submissions
                    // settle with a generation rcode on their own.
                    trace!("bus reset event while waiting");
                }
                other => trace!("ignoring event type {other}"),
            }
        }
    }

    fn cancel(&mut self, token: u32) {
        // The kernel protocol has no per-request cancel; outstanding
        // transfers die with the descriptor.  Dropping the closure mapping
        // is what reclamation means here: the eventual response can no
        // longer be routed anywhere.
        self.pending.retain(|&(_, t)| t != token);
    }
}

impl CdevChannel {
    /// Decode a response event into a completion, or `None` when it
    /// belongs to a submission that was canceled.
    fn decode_response(&mut self, event: &[u8]) -> Option<Completion> {
        if event.len() < EVENT_RESPONSE_DATA {
            return None;
        }

        let closure = read_u64(event, 0);
        let rcode = read_u32(event, EVENT_RESPONSE_RCODE);
        let length = read_u32(event, EVENT_RESPONSE_LENGTH) as usize;

        let pos = self.pending.iter().position(|&(seq, _)| seq == closure)?;
        let (_, token) = self.pending.swap_remove(pos);

        let status = match rcode {
            RCODE_COMPLETE => CompletionStatus::Complete,
            RCODE_BUSY => CompletionStatus::Busy,
            RCODE_GENERATION => CompletionStatus::BusReset,
            other => {
                debug!("request {token} failed with rcode {other:#x}");
                CompletionStatus::Failed
            }
        };

        let available = event.len() - EVENT_RESPONSE_DATA;
        let data = event[EVENT_RESPONSE_DATA..EVENT_RESPONSE_DATA + length.min(available)].to_vec();

        Some(Completion {
            token,
            status,
            data,
        })
    }
}

impl Drop for CdevChannel {
    fn drop(&mut self) {
        // Closing the descriptor reclaims anything still outstanding.
        unsafe { libc::close(self.fd) };
    }
}

// Internal functions

/// Device files for every node on every card: `/dev/fw0`, `/dev/fw1`, ...
fn node_paths() -> Result<Vec<String>> {
    let entries = fs::read_dir("/dev").map_err(|err| {
        error!("reading /dev failed: {err}");
        Error::Other
    })?;

    let mut paths: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_fw_name(name))
        .map(|name| format!("/dev/{name}"))
        .collect();
    paths.sort();

    Ok(paths)
}

fn is_fw_name(name: &str) -> bool {
    name.strip_prefix("fw")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn open_node(path: &str) -> io::Result<RawFd> {
    let cpath =
        CString::new(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Info ioctl against an open node: the current topology snapshot and,
/// when `rom` is given, a copy of the node's configuration ROM.
fn get_info(fd: RawFd, rom: Option<&mut [u32; ROM_QUADLETS]>) -> Result<FwCdevEventBusReset> {
    let mut reset = FwCdevEventBusReset::default();
    let mut request = FwCdevGetInfo {
        version: FW_CDEV_VERSION,
        bus_reset: &mut reset as *mut FwCdevEventBusReset as u64,
        ..Default::default()
    };
    if let Some(rom) = rom {
        request.rom = rom.as_mut_ptr() as u64;
        request.rom_length = (ROM_QUADLETS * mem::size_of::<u32>()) as u32;
    }

    if unsafe { libc::ioctl(fd, FW_CDEV_IOC_GET_INFO, &mut request as *mut _) } < 0 {
        let err = io::Error::last_os_error();
        debug!("info ioctl failed: {err}");
        return Err(Error::Io);
    }

    Ok(reset)
}

fn is_permission(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EACCES) | Some(libc::EPERM)
    )
}

/// Map an errno from the character device to the crate taxonomy: a stale
/// generation is a bus reset, a rejected length is a size problem, a
/// vanished node is also a topology change.
fn classify_errno(err: &io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Error::BusReset,
        Some(libc::EINVAL) => Error::BadIoSize,
        Some(libc::EACCES) | Some(libc::EPERM) => Error::NoPermission,
        Some(libc::ENODEV) | Some(libc::ENOENT) => Error::BusReset,
        _ => Error::Io,
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
}
