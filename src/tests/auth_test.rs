use test_env_log::test;

use crate::busline::auth::{Credentials, ServerGuid};
use crate::tests::common::{message_of_size, pipe_pair, pump_handshake, pump_until};

/// Client connects over a debug pipe with the server's guid in the
/// address, authenticates, and receives one 256-byte message.
#[test]
#[serial_test::serial]
fn test_client_connects_and_receives_message() {
    let guid = ServerGuid::new();
    let pair = pipe_pair("handshake", &guid, &format!(",guid={}", guid)).unwrap();

    assert!(pump_handshake(&pair), "handshake did not complete");
    assert!(pair.client.transport().is_authenticated());
    assert!(pair.server.transport().is_authenticated());
    // the client learned (and kept) the server identity it expected
    assert_eq!(
        pair.client.transport().expected_guid().as_deref(),
        Some(guid.as_str())
    );

    pair.server.send(message_of_size(1, 256)).unwrap();
    assert!(
        pump_until(&pair, || pair.client.n_incoming() == 1),
        "message was not delivered"
    );

    assert_eq!(pair.client.transport().live_bytes(), 256);
    let msg = pair.client.pop_message().unwrap();
    assert_eq!(msg.len(), 256);
    assert_eq!(msg.serial(), 1);
    drop(msg);
    assert_eq!(pair.client.transport().live_bytes(), 0);
}

/// The server reports a different guid than the address promised; the
/// client must disconnect without exposing any messages.
#[test]
#[serial_test::serial]
fn test_guid_mismatch_disconnects() {
    let actual = ServerGuid::new();
    let expected = ServerGuid::new();
    assert_ne!(actual, expected);

    let pair = pipe_pair("guid-mismatch", &actual, &format!(",guid={}", expected)).unwrap();

    pump_until(&pair, || !pair.client.transport().is_connected());

    assert!(!pair.client.transport().is_authenticated());
    assert!(!pair.client.transport().is_connected());
    assert_eq!(pair.client.n_incoming(), 0);
    assert_eq!(pair.client.transport().live_bytes(), 0);
}

/// Without an expected guid in the address, the client adopts whatever
/// the server reports.
#[test]
#[serial_test::serial]
fn test_client_adopts_server_guid() {
    let guid = ServerGuid::new();
    let pair = pipe_pair("guid-adopt", &guid, "").unwrap();

    assert!(pump_handshake(&pair));
    assert_eq!(
        pair.client.transport().expected_guid().as_deref(),
        Some(guid.as_str())
    );
}

/// The peer's authenticated identity is visible on the server side once,
/// and only once, the handshake completes.
#[test]
#[serial_test::serial]
fn test_unix_user_visible_after_handshake() {
    let guid = ServerGuid::new();
    let pair = pipe_pair("identity", &guid, "").unwrap();

    assert_eq!(pair.server.transport().get_unix_user(), None);
    assert!(pump_handshake(&pair));

    let ours = Credentials::from_current_process();
    assert_eq!(pair.server.transport().get_unix_user(), ours.uid);
    assert_eq!(pair.server.transport().get_unix_process_id(), ours.pid);
}

/// A server-side predicate can reject a uid, which disconnects the
/// transport during the handshake.
#[test]
#[serial_test::serial]
fn test_unix_user_function_rejects() {
    let guid = ServerGuid::new();
    let pair = pipe_pair("predicate-reject", &guid, "").unwrap();

    let old = pair
        .server
        .transport()
        .set_unix_user_function(Some(Box::new(|_uid| false)));
    assert!(old.is_none());

    pump_until(&pair, || !pair.server.transport().is_connected());
    assert!(!pair.server.transport().is_connected());
    assert!(!pair.server.transport().is_authenticated());
}

/// A permissive predicate admits a peer the default same-user policy
/// would also admit, and replacing it returns the old predicate.
#[test]
#[serial_test::serial]
fn test_unix_user_function_allows() {
    let guid = ServerGuid::new();
    let pair = pipe_pair("predicate-allow", &guid, "").unwrap();

    pair.server
        .transport()
        .set_unix_user_function(Some(Box::new(|uid| uid.is_some())));

    assert!(pump_handshake(&pair));
    assert!(pair.server.transport().is_authenticated());

    let old = pair.server.transport().set_unix_user_function(None);
    assert!(old.is_some());
}

/// Restricting the server to a mechanism the client also supports still
/// converges; the client cycles to it after a rejection.
#[test]
#[serial_test::serial]
fn test_mechanism_negotiation_fallback() {
    let guid = ServerGuid::new();
    let pair = pipe_pair("mechanisms", &guid, "").unwrap();

    pair.server
        .transport()
        .set_auth_mechanisms(&["ANONYMOUS"])
        .unwrap();
    // anonymous identities fail the default same-user check, so accept
    // them explicitly
    pair.server
        .transport()
        .set_unix_user_function(Some(Box::new(|_uid| true)));

    assert!(pump_handshake(&pair));
    assert_eq!(pair.server.transport().get_unix_user(), None);
}
