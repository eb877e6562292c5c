use test_env_log::test;

use crate::busline::auth::ServerGuid;
use crate::busline::common::ErrorKind;
use crate::busline::connection::Connection;
use crate::busline::transport::{
    accept_debug_pipe, listen_debug_pipe, open, unlisten_debug_pipe,
};
use crate::tests::common::{pipe_name, pump_handshake, Pair};

/// The opener walks its factory chain in order: socket, platform,
/// autolaunch all pass on a debug-pipe entry, and the debug-pipe factory
/// connects it. The transport keeps the entry's canonical form as its
/// address.
#[test]
#[serial_test::serial]
fn test_opener_falls_through_to_debug_pipe() {
    let name = pipe_name("opener");
    listen_debug_pipe(&name, ServerGuid::new()).unwrap();

    let address = format!("debug-pipe:name={};tcp:host=127.0.0.1,port=0", name);
    let transport = open(&address).unwrap();

    assert_eq!(
        transport.address(),
        Some(format!("debug-pipe:name={}", name).as_str())
    );
    assert!(accept_debug_pipe(&name).is_some());
    unlisten_debug_pipe(&name);
}

/// No factory recognizes the method: a bad-address error naming the valid
/// method types.
#[test]
#[serial_test::serial]
fn test_unknown_method_is_bad_address() {
    let err = open("bogus:foo=1").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::BadAddress(_)));
    assert!(err.to_string().contains("tcp"));
    assert!(err.to_string().contains("unix"));
}

/// A recognized method with an unreachable peer reports DidNotConnect.
#[test]
#[serial_test::serial]
fn test_unreachable_unix_socket_did_not_connect() {
    let err = open("unix:path=/nonexistent/busline-test-socket").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DidNotConnect(_)));
}

/// A recognized method with malformed parameters reports BadAddress.
#[test]
#[serial_test::serial]
fn test_malformed_entries_are_bad_addresses() {
    let err = open("unix:guid=abc").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::BadAddress(_)));

    let err = open("tcp:host=localhost").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::BadAddress(_)));

    let err = open("").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::BadAddress(_)));
}

/// When the first entry cannot connect, the next entry is tried.
#[test]
#[serial_test::serial]
fn test_second_entry_wins_when_first_fails() {
    let name = pipe_name("fallback");
    listen_debug_pipe(&name, ServerGuid::new()).unwrap();

    let address = format!("debug-pipe:name=never-listening;debug-pipe:name={}", name);
    let transport = open(&address).unwrap();
    assert_eq!(
        transport.address(),
        Some(format!("debug-pipe:name={}", name).as_str())
    );
    assert!(accept_debug_pipe(&name).is_some());
    unlisten_debug_pipe(&name);
}

/// The guid parameter is captured before the handshake ever runs, and a
/// matching server passes verification.
#[test]
#[serial_test::serial]
fn test_guid_parameter_is_captured() {
    let guid = ServerGuid::new();
    let name = pipe_name("guid-capture");
    listen_debug_pipe(&name, guid.clone()).unwrap();

    let address = format!("debug-pipe:name={},guid={}", name, guid);
    let client_transport = open(&address).unwrap();
    assert_eq!(
        client_transport.expected_guid().as_deref(),
        Some(guid.as_str())
    );

    let server_transport = accept_debug_pipe(&name).unwrap();
    unlisten_debug_pipe(&name);

    let pair = Pair {
        client: Connection::new(client_transport).unwrap(),
        server: Connection::new(server_transport).unwrap(),
    };
    assert!(pump_handshake(&pair));
}

/// Without a listener the debug-pipe factory is reachable but the pipe is
/// not.
#[test]
#[serial_test::serial]
fn test_missing_debug_pipe_did_not_connect() {
    let err = open("debug-pipe:name=never-listening").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DidNotConnect(_)));
}
