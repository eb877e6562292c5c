use tracing::debug;

use crate::busline::address::{parse_address, AddressEntry};
use crate::busline::common::fault;
use crate::busline::common::{Error, Result, Shared};
use crate::busline::transport::socket::SocketBackend;
use crate::busline::transport::{autolaunch, Backend, Transport};

/// Outcome of one opener factory for one address entry.
pub enum OpenResult {
    Connected(Shared<Transport>),
    /// This factory does not handle the entry's method; try the next one.
    NotHandled,
    /// The entry is malformed for a method this factory does handle.
    BadAddress(Error),
    /// The entry was understood but the peer is unreachable.
    DidNotConnect(Error),
}

fn open_socket(entry: &AddressEntry) -> OpenResult {
    match entry.method() {
        "unix" => {
            let path = match entry.get("path") {
                Some(path) => path,
                None => {
                    return OpenResult::BadAddress(Error::bad_address(
                        "unix address requires a path parameter",
                    ))
                }
            };
            match SocketBackend::connect_unix(path) {
                Ok(backend) => new_client(Backend::Socket(backend), entry),
                Err(e) => OpenResult::DidNotConnect(e),
            }
        }
        "tcp" => {
            let host = entry.get("host").unwrap_or("localhost");
            let port = match entry.get("port").map(|p| p.parse::<u16>()) {
                Some(Ok(port)) if port != 0 => port,
                _ => {
                    return OpenResult::BadAddress(Error::bad_address(
                        "tcp address requires a nonzero port parameter",
                    ))
                }
            };
            match SocketBackend::connect_tcp(host, port) {
                Ok(backend) => new_client(Backend::Socket(backend), entry),
                Err(e) => OpenResult::DidNotConnect(e),
            }
        }
        _ => OpenResult::NotHandled,
    }
}

fn new_client(backend: Backend, entry: &AddressEntry) -> OpenResult {
    match Transport::new(backend, None, Some(entry.to_string())) {
        Ok(transport) => OpenResult::Connected(transport),
        Err(e) => OpenResult::DidNotConnect(e),
    }
}

fn open_platform_specific(_entry: &AddressEntry) -> OpenResult {
    // launchd on macOS would go here; this platform has nothing to offer
    OpenResult::NotHandled
}

fn open_autolaunch(entry: &AddressEntry) -> OpenResult {
    if entry.method() != "autolaunch" {
        return OpenResult::NotHandled;
    }

    let address = match autolaunch::autolaunch_address() {
        Ok(address) => address,
        Err(e) => return OpenResult::DidNotConnect(e),
    };
    let entries = match parse_address(&address) {
        Ok(entries) => entries,
        Err(e) => return OpenResult::DidNotConnect(e),
    };

    let mut last_err = Error::did_not_connect("autolaunch address had no usable entries");
    for entry in &entries {
        match open_entry(entry) {
            Ok(transport) => return OpenResult::Connected(transport),
            Err(e) => last_err = e,
        }
    }
    OpenResult::DidNotConnect(last_err)
}

/// Try to open a transport for one address entry, running the factory
/// chain in its fixed order. A factory that recognizes the method decides
/// the outcome; if none does, this is a bad address. The entry's guid
/// parameter becomes the transport's expected server identity.
pub fn open_entry(entry: &AddressEntry) -> Result<Shared<Transport>> {
    let expected_guid = entry.get("guid");
    if let Some(guid) = expected_guid {
        if !fault::try_alloc(guid.len()) {
            return Err(Error::out_of_memory());
        }
    }

    let mut open_funcs: Vec<fn(&AddressEntry) -> OpenResult> =
        vec![open_socket, open_platform_specific, open_autolaunch];
    #[cfg(any(test, feature = "debug-pipe"))]
    open_funcs.push(super::debug_pipe::connect);

    for open_func in open_funcs {
        match open_func(entry) {
            OpenResult::Connected(transport) => {
                transport.set_expected_guid(expected_guid.map(str::to_string));
                return Ok(transport);
            }
            OpenResult::NotHandled => continue,
            OpenResult::BadAddress(e) | OpenResult::DidNotConnect(e) => return Err(e),
        }
    }

    Err(Error::bad_address(
        "unknown address type (examples of valid types are \"tcp\" and on UNIX \"unix\")",
    ))
}

/// Open a transport for the first reachable entry of a bus address.
pub fn open(address: &str) -> Result<Shared<Transport>> {
    let entries = parse_address(address)?;

    let mut last_err = None;
    for entry in &entries {
        match open_entry(entry) {
            Ok(transport) => return Ok(transport),
            Err(e) => {
                debug!(entry = %entry, err = %e, "address entry failed, trying next");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("parse_address returned no entries"))
}
