//! Bus and device-set lifecycle against a scripted transport.

// Copyright (C) 2026 The fwprobe developers
//
// MIT License

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{MockTransport, blank_node, guid_node};
use fwprobe::Error;
use fwprobe::bus::Bus;
use fwprobe::transport::Candidate;

#[test]
fn refresh_skips_local_and_denied_nodes() {
    let (transport, state) = MockTransport::new();
    state.borrow_mut().candidates = vec![
        Candidate::Node(blank_node("/dev/fw0", 0xffc0, 7, true)),
        Candidate::Node(guid_node("/dev/fw1", 0xffc1, 0x0001_0203_0405_0607)),
        Candidate::Denied,
        Candidate::Node(guid_node("/dev/fw2", 0xffc2, 0x1122_3344_5566_7788)),
    ];

    let mut bus = Bus::with_transport(transport);
    assert_eq!(bus.refresh_devices().unwrap(), 2);

    let devices = bus.devices();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].guid(), 0x0001_0203_0405_0607);
    assert_eq!(devices[0].max_request_size(), 1024);
    assert_eq!(devices[0].node_id(), 0xffc1);
    assert_eq!(devices[1].guid(), 0x1122_3344_5566_7788);
    assert_eq!(devices[1].node_id(), 0xffc2);
}

#[test]
fn all_denied_is_a_permission_error() {
    let (transport, state) = MockTransport::new();
    state.borrow_mut().candidates = vec![Candidate::Denied, Candidate::Denied];

    let mut bus = Bus::with_transport(transport);
    assert_eq!(bus.refresh_devices().unwrap_err(), Error::NoPermission);
    assert!(bus.devices().is_empty());
}

#[test]
fn an_empty_bus_enumerates_successfully() {
    let (transport, _state) = MockTransport::new();
    let mut bus = Bus::with_transport(transport);
    assert_eq!(bus.refresh_devices().unwrap(), 0);
}

#[test]
fn refresh_destroys_previous_handles_in_order() {
    let (transport, state) = MockTransport::new();
    state.borrow_mut().candidates = vec![
        Candidate::Node(guid_node("/dev/fw1", 0xffc1, 0xaaaa)),
        Candidate::Node(guid_node("/dev/fw2", 0xffc2, 0xbbbb)),
    ];

    let mut bus = Bus::with_transport(transport);
    let destroyed: Rc<RefCell<Vec<(u64, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&destroyed);
    bus.set_on_destroy(move |dev| log.borrow_mut().push((dev.guid(), dev.is_open())));

    bus.refresh_devices().unwrap();
    bus.devices_mut()[0].open().unwrap();

    // Second refresh invalidates both handles from the first.
    bus.refresh_devices().unwrap();

    // One callback per handle, in the set's order, and the open device
    // was closed before its callback ran.
    assert_eq!(*destroyed.borrow(), vec![(0xaaaa, false), (0xbbbb, false)]);

    // The new set destructs when the bus goes away.
    drop(bus);
    assert_eq!(destroyed.borrow().len(), 4);
}

#[test]
fn advertisement_is_published_at_most_once() {
    let (transport, state) = MockTransport::new();
    let mut bus = Bus::with_transport(transport);

    bus.enable_advertisement().unwrap();
    assert_eq!(state.borrow().published.len(), 1);

    // Second attempt fails without re-publishing.
    assert_eq!(bus.enable_advertisement().unwrap_err(), Error::Other);
    assert_eq!(state.borrow().published.len(), 1);

    drop(bus);
    assert_eq!(state.borrow().unpublishes, 1);
}

#[test]
fn unadvertised_bus_never_unpublishes() {
    let (transport, state) = MockTransport::new();
    drop(Bus::with_transport(transport));
    assert_eq!(state.borrow().unpublishes, 0);
}

#[test]
fn open_is_idempotent() {
    let (transport, state) = MockTransport::new();
    state.borrow_mut().candidates = vec![Candidate::Node(guid_node("/dev/fw1", 0xffc1, 1))];

    let mut bus = Bus::with_transport(transport);
    bus.refresh_devices().unwrap();
    let dev = &mut bus.devices_mut()[0];

    assert!(!dev.is_open());
    dev.open().unwrap();
    dev.open().unwrap();
    assert!(dev.is_open());
    assert_eq!(state.borrow().opens, 1);

    dev.close();
    dev.close();
    assert!(!dev.is_open());

    dev.open().unwrap();
    assert_eq!(state.borrow().opens, 2);
}

#[test]
fn open_failure_leaves_the_device_closed() {
    let (transport, state) = MockTransport::new();
    state.borrow_mut().candidates = vec![Candidate::Node(guid_node("/dev/fw1", 0xffc1, 1))];
    state.borrow_mut().open_error = Some(Error::NoPermission);

    let mut bus = Bus::with_transport(transport);
    bus.refresh_devices().unwrap();
    let dev = &mut bus.devices_mut()[0];

    assert_eq!(dev.open().unwrap_err(), Error::NoPermission);
    assert!(!dev.is_open());
}

#[test]
fn user_data_slots_round_trip() {
    let (transport, state) = MockTransport::new();
    state.borrow_mut().candidates = vec![Candidate::Node(guid_node("/dev/fw1", 0xffc1, 1))];

    let mut bus = Bus::with_transport(transport);
    bus.set_user_data(Box::new("case-42".to_owned()));
    assert_eq!(
        bus.user_data().and_then(|d| d.downcast_ref::<String>()),
        Some(&"case-42".to_owned())
    );

    bus.refresh_devices().unwrap();
    let dev = &mut bus.devices_mut()[0];
    assert!(dev.user_data().is_none());
    dev.set_user_data(Box::new(1234u32));
    assert_eq!(
        dev.user_data().and_then(|d| d.downcast_ref::<u32>()),
        Some(&1234)
    );
}

#[test]
fn result_codes_have_display_strings() {
    assert_eq!(Error::Other.to_string(), "unclassified error");
    assert_eq!(Error::BusReset.to_string(), "bus reset, device handles are stale");
    assert_eq!(Error::NoPermission.to_string(), "permission denied");
    assert_eq!(Error::Busy.to_string(), "device busy");
    assert_eq!(Error::Io.to_string(), "transfer failed");
    assert_eq!(Error::BadIoSize.to_string(), "transfer size rejected");
    assert_eq!(Error::IoTimeout.to_string(), "request timed out");
}
