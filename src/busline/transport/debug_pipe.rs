//! In-process debug pipe: a named rendezvous that hands the client a
//! socketpair end and queues the matching server-side transport for the
//! test to pick up. Test builds only.

use std::collections::VecDeque;
use std::io;
use std::sync::{Mutex, OnceLock};

use fnv::FnvHashMap;
use tracing::debug;

use crate::busline::address::AddressEntry;
use crate::busline::auth::ServerGuid;
use crate::busline::common::{Error, Result, Shared};
use crate::busline::transport::open::OpenResult;
use crate::busline::transport::{Backend, SocketBackend, Transport};

struct DebugPipeServer {
    guid: ServerGuid,
    pending: VecDeque<Shared<Transport>>,
}

fn registry() -> &'static Mutex<FnvHashMap<String, DebugPipeServer>> {
    static REGISTRY: OnceLock<Mutex<FnvHashMap<String, DebugPipeServer>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FnvHashMap::default()))
}

/// Register a named debug-pipe server with the given identity.
pub fn listen_debug_pipe(name: &str, guid: ServerGuid) -> Result<()> {
    let mut registry = registry().lock().unwrap();
    if registry.contains_key(name) {
        return Err(Error::new(format!("debug pipe '{}' is already listening", name)));
    }
    debug!(name, %guid, "debug pipe listening");
    registry.insert(
        name.to_string(),
        DebugPipeServer {
            guid,
            pending: VecDeque::new(),
        },
    );
    Ok(())
}

/// Remove a named debug-pipe server, dropping any unaccepted transports.
pub fn unlisten_debug_pipe(name: &str) {
    registry().lock().unwrap().remove(name);
}

/// Take the server-side transport created by the most recent client
/// connect to this pipe, if any.
pub fn accept_debug_pipe(name: &str) -> Option<Shared<Transport>> {
    registry()
        .lock()
        .unwrap()
        .get_mut(name)
        .and_then(|server| server.pending.pop_front())
}

/// The opener factory for method "debug-pipe".
pub(crate) fn connect(entry: &AddressEntry) -> OpenResult {
    if entry.method() != "debug-pipe" {
        return OpenResult::NotHandled;
    }
    let name = match entry.get("name") {
        Some(name) => name,
        None => {
            return OpenResult::BadAddress(Error::bad_address(
                "debug-pipe address requires a name parameter",
            ))
        }
    };

    let mut registry = registry().lock().unwrap();
    let server = match registry.get_mut(name) {
        Some(server) => server,
        None => {
            return OpenResult::DidNotConnect(Error::did_not_connect(format!(
                "no debug pipe server is listening on '{}'",
                name
            )))
        }
    };

    let (server_fd, client_fd) = match socketpair() {
        Ok(fds) => fds,
        Err(e) => return OpenResult::DidNotConnect(e),
    };

    let server_transport = SocketBackend::from_raw_fd(server_fd, true)
        .and_then(|backend| {
            Transport::new(Backend::DebugPipe(backend), Some(server.guid.clone()), None)
        });
    let server_transport = match server_transport {
        Ok(transport) => transport,
        Err(e) => {
            unsafe {
                libc::close(client_fd);
            }
            return OpenResult::DidNotConnect(e);
        }
    };

    let client_transport = SocketBackend::from_raw_fd(client_fd, true).and_then(|backend| {
        Transport::new(
            Backend::DebugPipe(backend),
            None,
            Some(entry.to_string()),
        )
    });
    let client_transport = match client_transport {
        Ok(transport) => transport,
        Err(e) => return OpenResult::DidNotConnect(e),
    };

    debug!(name, "debug pipe connected");
    server.pending.push_back(server_transport);
    OpenResult::Connected(client_transport)
}

fn socketpair() -> Result<(i32, i32)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}
