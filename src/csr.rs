//! Parser for a node's Configuration Status ROM (CSR).
//!
//! Every node on the bus exposes a fixed 1024-byte block of 256 quadlets
//! (32-bit words) describing itself: a bus information block followed by a
//! root directory of key/value entries, some of which point at further
//! directories or leaves by relative quadlet offset.
//!
//! The block is copied straight off the wire from hardware the caller does
//! not control, so every offset and length in it is treated as hostile.
//! Any arithmetic that would land outside the 256-quadlet block
//! short-circuits to "not found" and the affected field keeps its default;
//! a malformed ROM must never abort an otherwise successful enumeration.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Number of quadlets in a configuration ROM block.
pub const ROM_QUADLETS: usize = 256;

/// Base of the serial-bus register space in a node's 48-bit address space.
pub const CSR_REGISTER_BASE: u64 = 0xffff_f000_0000;

/// Offset of the configuration ROM within the register space.
pub const CSR_CONFIG_ROM: u64 = 0x400;

/// Quadlet 1 of the bus information block when the node speaks 1394
/// ("1394" in ASCII).  Any other value makes the rest of the block
/// bus-specific and not safely interpretable.
const BUS_MAGIC_1394: u32 = 0x3133_3934;

const KEY_VENDOR: u8 = 0x03;
const KEY_MODEL: u8 = 0x17;
const KEY_DESC_LEAF: u8 = 0x81;

/// Longest vendor/product name retained from a descriptor leaf, in bytes.
const NAME_MAX: usize = 64;

/// Identity and capability fields decoded from a configuration ROM.
///
/// Fields a ROM does not (safely) define keep their defaults: a 512-byte
/// maximum request size, zero identifiers and empty names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomInfo {
    /// Largest single transfer the device accepts, in bytes.
    pub max_request_size: usize,
    /// Stable 48-bit identity, held high-quadlet-first in a 64-bit field.
    pub guid: u64,
    /// Numeric vendor identifier.
    pub vendor_id: u32,
    /// Vendor display name.
    pub vendor_name: String,
    /// Numeric product identifier.
    pub product_id: u32,
    /// Product display name.
    pub product_name: String,
}

impl Default for RomInfo {
    fn default() -> Self {
        Self {
            max_request_size: 512,
            guid: 0,
            vendor_id: 0,
            vendor_name: String::new(),
            product_id: 0,
            product_name: String::new(),
        }
    }
}

/// Decode the interesting fields of a configuration ROM.
///
/// Never reads outside `rom` regardless of what the block claims about its
/// own layout; undecodable fields are left at their defaults.
pub fn parse(rom: &[u32; ROM_QUADLETS]) -> RomInfo {
    let mut info = RomInfo::default();

    // Bus information block; fewer than five quadlets and there is nothing
    // worth decoding.
    let buslen = dir_length(rom, 0);
    if buslen < 5 {
        trace!("short bus information block ({buslen} quadlets), using defaults");
        return info;
    }

    // The maximum request size is a 4-bit field in quadlet 2 holding the
    // base-2 logarithm of the size, offset by one (so 8 means 2^9 bytes).
    // It is only meaningful when the block identifies the 1394 bus.
    if rom[1] == BUS_MAGIC_1394 {
        let lgsz = rom[2] >> 12 & 0xf;
        info.max_request_size = 2usize << lgsz;
    }

    // The GUID is split across quadlets 3 and 4, high half first.
    info.guid = (rom[3] as u64) << 32 | rom[4] as u64;

    // Vendor and model entries live in the root directory, which starts
    // directly after the bus information block.
    (info.vendor_id, info.vendor_name) = parse_key(rom, buslen, KEY_VENDOR);
    (info.product_id, info.product_name) = parse_key(rom, buslen, KEY_MODEL);

    info
}

/// Inclusive length in quadlets of the directory starting at `diroff`, or
/// 0 if any part of it would fall outside the ROM.
fn dir_length(rom: &[u32; ROM_QUADLETS], diroff: usize) -> usize {
    if diroff > ROM_QUADLETS - 1 {
        return 0;
    }

    // The count field excludes the header quadlet itself.
    let nquad = (rom[diroff] >> 16 & 0xff) as usize;

    if diroff + nquad > ROM_QUADLETS - 1 {
        return 0;
    }

    nquad + 1
}

/// Search the directory at `diroff` for `key` and return its 24-bit value,
/// along with the decoded text of a descriptor leaf if one immediately
/// follows the matching entry.
fn parse_key(rom: &[u32; ROM_QUADLETS], diroff: usize, key: u8) -> (u32, String) {
    let mut value = 0;
    let mut name = String::new();

    let nq = dir_length(rom, diroff);

    let mut i = 1;
    while i < nq {
        let entry = rom[diroff + i];

        if entry_key(entry) == key {
            value = entry_value(entry);
            break;
        }

        i += 1;
    }

    // A descriptor leaf directly after the match carries the display name;
    // its value is a quadlet offset relative to the entry's own position.
    i += 1;
    if i < nq && entry_key(rom[diroff + i]) == KEY_DESC_LEAF {
        let leafoff = diroff + i + entry_value(rom[diroff + i]) as usize;
        name = parse_text_leaf(rom, leafoff);
    }

    (value, name)
}

/// Decode a minimal ASCII descriptor leaf at `offset` into an owned
/// string, or an empty string if the leaf is out of range, too short to
/// carry text, or not of the minimal ASCII flavour.
fn parse_text_leaf(rom: &[u32; ROM_QUADLETS], offset: usize) -> String {
    let numq = dir_length(rom, offset);
    if numq == 0 {
        return String::new();
    }

    // The first two quadlets of the leaf body are zero for a minimal ASCII
    // leaf; any other specifier/language combination is not decoded.
    if numq < 3 || rom[offset + 1] != 0 || rom[offset + 2] != 0 {
        return String::new();
    }

    let numb = ((numq - 3) * 4).min(NAME_MAX - 1);

    let mut bytes = Vec::with_capacity(numb);
    for i in 0..numb {
        // Characters are packed one per byte, most significant first.
        let shift = [24, 16, 8, 0][i % 4];
        bytes.push((rom[offset + 3 + i / 4] >> shift) as u8);
    }

    // The final quadlet is NUL padded; keep everything before the padding.
    if let Some(nul) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(nul);
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

fn entry_key(entry: u32) -> u8 {
    (entry >> 24) as u8
}

fn entry_value(entry: u32) -> u32 {
    entry & 0x00ff_ffff
}
