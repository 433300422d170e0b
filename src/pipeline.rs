//! Bounded-concurrency execution of a transfer batch against one channel.
//!
//! The platform allows only a limited number of asynchronous transfers to
//! be outstanding on a channel at once - as low as one.  The engine keeps
//! the pipeline as full as the platform allows without over-submitting,
//! waits on the channel's single completion source, and routes each
//! completion back to its originating request by correlation token.
//! Completions may arrive in any order relative to submission; arrival
//! order is never used for routing.
//!
//! Every abort path - timeout, bus reset, busy device, transfer fault -
//! cancels the submissions still in flight before returning, so control
//! never goes back to the caller with asynchronous work still attached to
//! the device.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::time::Duration;

use crate::transport::{Channel, Completion, CompletionStatus, Direction, Submission, TransferKind};
use crate::{Error, Result};

/// Per-wait completion budget applied while a batch is in flight.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

/// Addresses are 48-bit on the wire; callers may pass 64-bit values.
const ADDR_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// One read transfer within a batch.  The buffer is caller-owned and is
/// filled with exactly `buf.len()` response bytes on success.
pub struct ReadRequest<'a> {
    /// Device-relative address; the top 16 bits of a 64-bit value are
    /// discarded.
    pub addr: u64,
    /// Destination for the response payload.
    pub buf: &'a mut [u8],
}

/// One write transfer within a batch.
pub struct WriteRequest<'a> {
    /// Device-relative address; the top 16 bits of a 64-bit value are
    /// discarded.
    pub addr: u64,
    /// Payload to write.
    pub data: &'a [u8],
}

/// Execute a batch of read requests against an open channel.
///
/// Requests are submitted in order; each completion's payload lands in the
/// buffer of the request its token names, and must match the requested
/// length exactly.
pub(crate) fn run_reads(
    chan: &mut dyn Channel,
    generation: u32,
    reqs: &mut [ReadRequest<'_>],
    timeout: Duration,
) -> Result<()> {
    let total = reqs.len();
    let depth = chan.capacity().max(1);

    let mut submitted = 0usize;
    let mut in_flight: Vec<u32> = Vec::with_capacity(depth);

    while submitted < total || !in_flight.is_empty() {
        while in_flight.len() < depth && submitted < total {
            let token = submitted as u32;
            let req = &reqs[submitted];
            let sub = Submission {
                direction: Direction::Read,
                kind: TransferKind::for_len(req.buf.len()),
                addr: req.addr & ADDR_MASK,
                len: req.buf.len(),
                data: None,
                token,
                generation,
            };

            if let Err(e) = chan.submit(sub) {
                abort(chan, &in_flight);
                return Err(e);
            }

            in_flight.push(token);
            submitted += 1;
            trace!("read {token} submitted, {} in flight", in_flight.len());
        }

        let completion = wait_one(chan, timeout, &mut in_flight)?;

        let req = &mut reqs[completion.token as usize];
        if completion.data.len() != req.buf.len() {
            warn!(
                "read {} returned {} bytes, wanted {}",
                completion.token,
                completion.data.len(),
                req.buf.len()
            );
            abort(chan, &in_flight);
            return Err(Error::Io);
        }
        req.buf.copy_from_slice(&completion.data);
    }

    Ok(())
}

/// Execute a batch of write requests against an open channel.
pub(crate) fn run_writes(
    chan: &mut dyn Channel,
    generation: u32,
    reqs: &[WriteRequest<'_>],
    timeout: Duration,
) -> Result<()> {
    let total = reqs.len();
    let depth = chan.capacity().max(1);

    let mut submitted = 0usize;
    let mut in_flight: Vec<u32> = Vec::with_capacity(depth);

    while submitted < total || !in_flight.is_empty() {
        while in_flight.len() < depth && submitted < total {
            let token = submitted as u32;
            let req = &reqs[submitted];
            let sub = Submission {
                direction: Direction::Write,
                kind: TransferKind::for_len(req.data.len()),
                addr: req.addr & ADDR_MASK,
                len: req.data.len(),
                data: Some(req.data),
                token,
                generation,
            };

            if let Err(e) = chan.submit(sub) {
                abort(chan, &in_flight);
                return Err(e);
            }

            in_flight.push(token);
            submitted += 1;
            trace!("write {token} submitted, {} in flight", in_flight.len());
        }

        wait_one(chan, timeout, &mut in_flight)?;
    }

    Ok(())
}

// Internal functions

/// Wait for one completion, settle its bookkeeping and classify its
/// status.  Anything other than a clean completion of a known token
/// cancels whatever is still in flight before the error goes up.
fn wait_one(
    chan: &mut dyn Channel,
    timeout: Duration,
    in_flight: &mut Vec<u32>,
) -> Result<Completion> {
    let completion = match chan.wait(timeout) {
        Ok(c) => c,
        Err(e) => {
            debug!("wait failed with {e}, aborting batch");
            abort(chan, in_flight);
            return Err(e);
        }
    };

    match in_flight.iter().position(|&t| t == completion.token) {
        Some(pos) => {
            in_flight.swap_remove(pos);
        }
        None => {
            // A token we never issued (or settled twice) means correlation
            // is broken; nothing further can be trusted.
            warn!("completion for unknown token {}", completion.token);
            abort(chan, in_flight);
            return Err(Error::Io);
        }
    }

    let err = match completion.status {
        CompletionStatus::Complete => return Ok(completion),
        CompletionStatus::BusReset => Error::BusReset,
        CompletionStatus::Busy => Error::Busy,
        CompletionStatus::Failed => Error::Io,
    };

    debug!("request {} failed with {err}, aborting batch", completion.token);
    abort(chan, in_flight);
    Err(err)
}

/// Reclaim every submission still outstanding.
fn abort(chan: &mut dyn Channel, in_flight: &[u32]) {
    for &token in in_flight {
        chan.cancel(token);
    }
}
