//! Scripted transport shared by the integration tests.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use fwprobe::csr::ROM_QUADLETS;
use fwprobe::transport::{
    Candidate, Channel, Completion, CompletionStatus, NodeInfo, Submission, Transport,
    UnitDirectory,
};
use fwprobe::{Error, Result};

/// Observable state of a [`MockTransport`], shared with the test body.
#[derive(Default)]
pub struct MockState {
    /// What the next enumeration reports.
    pub candidates: Vec<Candidate>,
    /// Every unit directory published so far.
    pub published: Vec<UnitDirectory>,
    pub unpublishes: usize,
    /// Channels handed out so far.
    pub opens: usize,
    /// Forced failure for the next open, if set.
    pub open_error: Option<Error>,
}

pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl Transport for MockTransport {
    fn enumerate(&mut self) -> Result<Vec<Candidate>> {
        Ok(self.state.borrow().candidates.clone())
    }

    fn open(&mut self, _node: &NodeInfo) -> Result<Box<dyn Channel>> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.open_error {
            return Err(err);
        }
        state.opens += 1;
        Ok(Box::new(EchoChannel::default()))
    }

    fn publish_advertisement(&mut self, dir: &UnitDirectory) -> Result<()> {
        self.state.borrow_mut().published.push(*dir);
        Ok(())
    }

    fn unpublish(&mut self) {
        self.state.borrow_mut().unpublishes += 1;
    }
}

/// Channel completing every submission in order; a read's payload is the
/// low byte of its address repeated.
#[derive(Default)]
pub struct EchoChannel {
    queue: VecDeque<Completion>,
}

impl Channel for EchoChannel {
    fn capacity(&self) -> usize {
        4
    }

    fn submit(&mut self, sub: Submission<'_>) -> Result<()> {
        let data = match sub.data {
            None => vec![sub.addr as u8; sub.len],
            Some(_) => Vec::new(),
        };
        self.queue.push_back(Completion {
            token: sub.token,
            status: CompletionStatus::Complete,
            data,
        });
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Completion> {
        self.queue.pop_front().ok_or(Error::IoTimeout)
    }

    fn cancel(&mut self, _token: u32) {}
}

/// A node whose ROM is all zeroes, parsing to default identity fields.
pub fn blank_node(locator: &str, node_id: u16, generation: u32, is_local: bool) -> NodeInfo {
    NodeInfo {
        locator: locator.to_owned(),
        node_id,
        generation,
        is_local,
        rom: [0u32; ROM_QUADLETS],
    }
}

/// A foreign node whose ROM advertises `guid` and a 1024-byte maximum
/// request size.
pub fn guid_node(locator: &str, node_id: u16, guid: u64) -> NodeInfo {
    let mut node = blank_node(locator, node_id, 1, false);
    node.rom[0] = 0x0404_0000;
    node.rom[1] = 0x3133_3934;
    node.rom[2] = 0x8 << 12;
    node.rom[3] = (guid >> 32) as u32;
    node.rom[4] = guid as u32;
    node
}
