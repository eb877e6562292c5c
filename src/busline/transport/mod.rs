mod autolaunch;
#[cfg(any(test, feature = "debug-pipe"))]
mod debug_pipe;
mod live_bytes;
mod open;
mod socket;
mod watch;

#[cfg(any(test, feature = "debug-pipe"))]
pub use debug_pipe::{accept_debug_pipe, listen_debug_pipe, unlisten_debug_pipe};
pub use live_bytes::{CounterGuard, CounterNotifyFn, LiveBytesCounter, LiveMessage};
pub use open::{open, open_entry, OpenResult};
pub use socket::SocketBackend;
pub use watch::{Timeout, Watch, WatchFlags};

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use std::sync::{Arc, Mutex};

use strum::Display;
use tracing::{debug, trace, warn};

use crate::busline::auth::{AuthEngine, AuthState, Credentials, ServerGuid};
use crate::busline::common::fault;
use crate::busline::common::{Counted, Error, LifeCount, Result, Shared};
use crate::busline::config::conf;
use crate::busline::connection::Connection;
use crate::busline::protocol::MessageLoader;

/// do_iteration flag: read from the socket if data is available.
pub const DO_READING: u32 = 1;
/// do_iteration flag: write pending data to the socket.
pub const DO_WRITING: u32 = 2;

/// Readiness of the transport to yield messages to the connection.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The loader holds at least one complete message.
    DataRemains,
    /// Nothing further can be produced right now.
    Complete,
    /// An allocation was refused; retry when memory frees up.
    NeedMemory,
}

/// The predicate a server application installs to authorize peer uids.
/// Called without any transport lock held; it must tolerate reentry.
pub type UnixUserFn = Box<dyn Fn(Option<u32>) -> bool + Send + Sync>;

/// The concrete backend of a transport. A debug pipe is a socketpair
/// conjured in-process, so it shares the socket backend's machinery and
/// differs only in how it is opened.
pub enum Backend {
    Socket(SocketBackend),
    DebugPipe(SocketBackend),
}

impl Backend {
    fn socket(&self) -> &SocketBackend {
        match self {
            Backend::Socket(s) | Backend::DebugPipe(s) => s,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Socket(_) => "socket",
            Backend::DebugPipe(_) => "debug-pipe",
        }
    }
}

#[cfg(test)]
pub(crate) static ACTIVE_TRANSPORTS: AtomicUsize = AtomicUsize::new(0);

/// The stateful pipeline between one endpoint and its peer: it owns the
/// message loader, the auth engine, and the live-bytes counter, drives the
/// connect/auth/streaming state machine, and delegates OS I/O to its
/// backend. The owning Connection holds the strong reference; all entry
/// points are driven from the thread that drives that connection.
pub struct Transport {
    life: LifeCount,
    backend: Backend,
    loader: Mutex<MessageLoader>,
    auth: Mutex<AuthEngine>,
    live_messages_size: Arc<LiveBytesCounter>,
    max_live_messages_size: AtomicUsize,
    /// Non-owning back-pointer to the owning Connection. Valid only while
    /// that connection is alive; it clears this in its finalizer.
    connection: AtomicPtr<Connection>,
    authenticated: AtomicBool,
    disconnected: AtomicBool,
    is_server: bool,
    send_credentials_pending: AtomicBool,
    receive_credentials_pending: AtomicBool,
    /// Client side: the canonical form of the address we connected to.
    address: Option<String>,
    /// Client side: the server identity we must observe post-handshake.
    expected_guid: Mutex<Option<String>>,
    unix_user_function: Mutex<Option<UnixUserFn>>,
    /// Peer credentials read from socket ancillary data by the backend.
    peer_credentials: Mutex<Credentials>,
    unused_bytes_recovered: AtomicBool,
}

impl Counted for Transport {
    fn life(&self) -> &LifeCount {
        &self.life
    }
}

impl Transport {
    /// Construct a transport over backend. Exactly one of server_guid
    /// (server side) and address (client side) is present. Fails only when
    /// the allocation gate refuses a sub-construction; nothing is left
    /// half-built in that case.
    pub(crate) fn new(
        backend: Backend,
        server_guid: Option<ServerGuid>,
        address: Option<String>,
    ) -> Result<Shared<Transport>> {
        debug_assert!(server_guid.is_some() != address.is_some());
        let is_server = server_guid.is_some();

        if !fault::try_alloc(conf().recv_buffer_size) {
            return Err(Error::out_of_memory());
        }
        let loader = MessageLoader::new();

        if !fault::try_alloc(std::mem::size_of::<AuthEngine>()) {
            return Err(Error::out_of_memory());
        }
        let mut auth = match server_guid {
            Some(guid) => AuthEngine::server_new(guid),
            None => AuthEngine::client_new(),
        };
        if !conf().auth_mechanisms.is_empty() {
            let names: Vec<&str> = conf().auth_mechanisms.iter().map(String::as_str).collect();
            auth.set_mechanisms(&names)?;
        }

        if !fault::try_alloc(std::mem::size_of::<LiveBytesCounter>()) {
            return Err(Error::out_of_memory());
        }
        let counter = Arc::new(LiveBytesCounter::new());

        if !fault::try_alloc(address.as_ref().map(|a| a.len()).unwrap_or(0)) {
            return Err(Error::out_of_memory());
        }

        let transport = Shared::new(Transport {
            life: LifeCount::new(),
            backend,
            loader: Mutex::new(loader),
            auth: Mutex::new(auth),
            live_messages_size: counter,
            max_live_messages_size: AtomicUsize::new(conf().max_live_messages_size),
            connection: AtomicPtr::new(std::ptr::null_mut()),
            authenticated: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            is_server,
            send_credentials_pending: AtomicBool::new(!is_server),
            receive_credentials_pending: AtomicBool::new(is_server),
            address,
            expected_guid: Mutex::new(None),
            unix_user_function: Mutex::new(None),
            peer_credentials: Mutex::new(Credentials::unset()),
            unused_bytes_recovered: AtomicBool::new(false),
        });
        transport.arm_counter_notify();

        #[cfg(test)]
        ACTIVE_TRANSPORTS.fetch_add(1, Relaxed);

        if let Some(address) = &transport.address {
            trace!(%address, "initialized transport");
        }
        Ok(transport)
    }

    /// Wrap a socket this process accepted in a server-side transport
    /// carrying the listener's identity.
    pub fn for_accepted_socket(
        fd: RawFd,
        is_unix: bool,
        guid: ServerGuid,
    ) -> Result<Shared<Transport>> {
        let backend = SocketBackend::from_raw_fd(fd, is_unix)?;
        Transport::new(Backend::Socket(backend), Some(guid), None)
    }

    /// Pin this transport for the duration of an entry point. Every path
    /// that can run user callbacks or re-enter holds one of these, so the
    /// transport survives even if the callback releases the last outside
    /// handle mid-call.
    fn guard(&self) -> Shared<Transport> {
        Shared::retain(self)
    }

    // Self is pinned inside a Shared handle for its whole life, so its
    // address is stable and can be smuggled into the notify closure.
    fn arm_counter_notify(&self) {
        let addr = self as *const Transport as usize;
        let threshold = self.max_live_messages_size.load(Relaxed);
        self.live_messages_size.set_notify(
            threshold,
            Some(Box::new(move |value| {
                // Safety: the finalizer clears this notify before the
                // transport can be freed, and all counter adjustments
                // happen on the thread driving this connection.
                let transport = unsafe { &*(addr as *const Transport) };
                transport.live_messages_changed(value);
            })),
        );
    }

    fn live_messages_changed(&self, value: usize) {
        // paranoia ref, mirrors the hook dispatch convention
        let _self_ref = self.guard();
        trace!(value, "live message bytes changed");
        if self.disconnected.load(Relaxed) {
            return;
        }
        self.backend.socket().live_messages_changed(self);
    }

    // --- lifecycle ---

    /// Closes our end of the connection to the peer. Further attempts to
    /// use this transport short-circuit. Only the first call has an effect.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Release) {
            return;
        }
        debug!(backend = self.backend.name(), "disconnecting transport");
        self.backend.socket().disconnect(self);
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Relaxed)
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The address this transport was opened with; None on the server side.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn expected_guid(&self) -> Option<String> {
        self.expected_guid.lock().unwrap().clone()
    }

    pub(crate) fn set_expected_guid(&self, guid: Option<String>) {
        *self.expected_guid.lock().unwrap() = guid;
    }

    /// Attach the owning connection. One-shot: the transport keeps a
    /// non-owning pointer and the backend registers its initial watches.
    pub(crate) fn set_connection(&self, connection: &Shared<Connection>) -> Result<()> {
        assert!(
            self.connection.load(Relaxed).is_null(),
            "set_connection called twice"
        );
        self.connection
            .store(connection.as_ptr() as *mut Connection, Release);

        let _self_ref = self.guard();
        if let Err(e) = self.backend.socket().connection_set(self) {
            self.connection.store(std::ptr::null_mut(), Release);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn clear_connection(&self) {
        self.connection.store(std::ptr::null_mut(), Release);
    }

    pub(crate) fn connection(&self) -> Option<&Connection> {
        let p = self.connection.load(Acquire);
        if p.is_null() {
            None
        } else {
            // Safety: the owning Connection clears this pointer in its
            // finalizer before it is freed, and only the thread driving
            // that connection calls in here.
            Some(unsafe { &*p })
        }
    }

    // --- authentication ---

    /// Whether the handshake has completed and identity checks passed.
    /// This drives the auth engine, so it may disconnect the transport on
    /// a GUID or identity mismatch, and it may invoke the application's
    /// unix-user predicate (without any lock held).
    pub fn is_authenticated(&self) -> bool {
        if self.authenticated.load(Acquire) {
            return true;
        }
        if self.disconnected.load(Relaxed) {
            return false;
        }

        // paranoia ref since we call user callbacks sometimes
        let _connection_ref = self.connection().map(Shared::retain);

        let mut maybe_authenticated = !(self.send_credentials_pending.load(Relaxed)
            || self.receive_credentials_pending.load(Relaxed));

        if maybe_authenticated {
            let mut auth = self.auth.lock().unwrap();
            if auth.do_work() != AuthState::Authenticated {
                maybe_authenticated = false;
            }
        }

        if maybe_authenticated && !self.is_server {
            let server_guid = {
                let auth = self.auth.lock().unwrap();
                auth.guid_from_server()
                    .expect("authenticated client engine must know the server guid")
                    .to_string()
            };

            let mismatch = {
                let mut expected = self.expected_guid.lock().unwrap();
                match &*expected {
                    Some(expected_guid) if *expected_guid != server_guid => {
                        warn!(
                            expected = %expected_guid,
                            got = %server_guid,
                            "server guid mismatch, disconnecting"
                        );
                        true
                    }
                    Some(_) => false,
                    None => {
                        if !fault::try_alloc(server_guid.len()) {
                            trace!("no memory to record server guid");
                            return false;
                        }
                        *expected = Some(server_guid);
                        false
                    }
                }
            };
            if mismatch {
                self.disconnect();
                return false;
            }
        }

        // If we've authenticated as some identity, check that the auth
        // identity matches our own, unless the application installed its
        // own policy predicate.
        if maybe_authenticated && self.is_server {
            let auth_identity = self.auth.lock().unwrap().identity();

            let user_function = if cfg!(unix) {
                self.unix_user_function.lock().unwrap().take()
            } else {
                None
            };

            if let Some(user_function) = user_function {
                // The predicate runs without any lock held; it must
                // tolerate reentry
                let allow = (user_function)(auth_identity.uid);

                let mut slot = self.unix_user_function.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(user_function);
                }
                drop(slot);

                if allow {
                    trace!(uid = ?auth_identity.uid, "client uid authorized by predicate");
                } else {
                    warn!(uid = ?auth_identity.uid, "client uid rejected, disconnecting");
                    self.disconnect();
                    return false;
                }
            } else {
                let our_identity = Credentials::from_current_process();
                if !our_identity.same_user(&auth_identity) {
                    warn!(
                        client = %auth_identity,
                        ours = %our_identity,
                        "client authorized as a different user, disconnecting"
                    );
                    self.disconnect();
                    return false;
                }
            }
        }

        if maybe_authenticated {
            self.authenticated.store(true, Release);
        }
        maybe_authenticated
    }

    /// The authenticated flag without driving the handshake.
    pub(crate) fn is_authenticated_peek(&self) -> bool {
        self.authenticated.load(Relaxed)
    }

    /// See is_authenticated; uid of the identity the peer authenticated as.
    pub fn get_unix_user(&self) -> Option<u32> {
        if !self.authenticated.load(Acquire) {
            return None;
        }
        self.auth.lock().unwrap().identity().uid
    }

    pub fn get_unix_process_id(&self) -> Option<u32> {
        if !self.authenticated.load(Acquire) {
            return None;
        }
        self.auth.lock().unwrap().identity().pid
    }

    /// Install the server-side uid authorization predicate, returning the
    /// previous one so the caller can release whatever it owns.
    pub fn set_unix_user_function(&self, function: Option<UnixUserFn>) -> Option<UnixUserFn> {
        let mut slot = self.unix_user_function.lock().unwrap();
        std::mem::replace(&mut *slot, function)
    }

    /// Restrict the SASL mechanisms this transport offers/accepts.
    pub fn set_auth_mechanisms(&self, mechanisms: &[&str]) -> Result<()> {
        self.auth.lock().unwrap().set_mechanisms(mechanisms)
    }

    pub(crate) fn set_peer_credentials(&self, credentials: Credentials) {
        *self.peer_credentials.lock().unwrap() = credentials;
        self.auth.lock().unwrap().set_peer_credentials(credentials);
    }

    pub fn peer_credentials(&self) -> Credentials {
        *self.peer_credentials.lock().unwrap()
    }

    pub(crate) fn auth(&self) -> &Mutex<AuthEngine> {
        &self.auth
    }

    pub(crate) fn loader(&self) -> &Mutex<MessageLoader> {
        &self.loader
    }

    pub(crate) fn credentials_pending(&self) -> (bool, bool) {
        (
            self.send_credentials_pending.load(Relaxed),
            self.receive_credentials_pending.load(Relaxed),
        )
    }

    pub(crate) fn clear_send_credentials_pending(&self) {
        self.send_credentials_pending.store(false, Relaxed);
    }

    pub(crate) fn clear_receive_credentials_pending(&self) {
        self.receive_credentials_pending.store(false, Relaxed);
    }

    // --- I/O entry points ---

    /// Handle readiness on one of our watches: read, write, or disconnect
    /// as the condition demands. Fails only when out of memory.
    pub fn handle_watch(&self, watch: &Arc<Watch>, condition: WatchFlags) -> Result<()> {
        if self.disconnected.load(Relaxed) {
            return Ok(());
        }
        if watch.fd() < 0 {
            warn!("tried to handle an invalidated watch; it should have been removed");
            return Ok(());
        }

        let condition = watch.sanitize(condition);

        let _self_ref = self.guard();
        let _watch_ref = watch.clone();
        self.backend.socket().handle_watch(self, watch, condition)
    }

    /// Handle an expired timeout registered by this transport.
    pub fn handle_timeout(&self, timeout: &Arc<Timeout>) {
        if self.disconnected.load(Relaxed) {
            return;
        }
        let _self_ref = self.guard();
        self.backend.socket().handle_timeout(self, timeout);
    }

    /// Perform a single poll()/select() and then read/write as permitted by
    /// flags, queueing incoming messages and sending outgoing messages.
    /// timeout_milliseconds of -1 blocks until readiness, 0 polls.
    pub fn do_iteration(&self, flags: u32, timeout_milliseconds: i32) {
        trace!(
            flags,
            timeout_milliseconds,
            connected = self.is_connected(),
            "transport iteration"
        );
        if flags & (DO_READING | DO_WRITING) == 0 {
            return;
        }
        if self.disconnected.load(Relaxed) {
            return;
        }

        let _self_ref = self.guard();
        self.backend
            .socket()
            .do_iteration(self, flags, timeout_milliseconds);
    }

    /// The socket file descriptor, if the backend has one and we are still
    /// connected.
    pub fn get_socket_fd(&self) -> Option<RawFd> {
        if self.disconnected.load(Relaxed) {
            return None;
        }
        let _self_ref = self.guard();
        self.backend.socket().get_socket_fd()
    }

    /// The connection has messages queued for the peer; make sure the
    /// backend is watching for writability.
    pub(crate) fn messages_pending(&self, n_pending: usize) {
        if self.disconnected.load(Relaxed) {
            return;
        }
        trace!(n_pending, "messages pending");
        self.backend.socket().messages_pending(self);
    }

    // --- dispatch ---

    /// Current readiness to yield messages, stepping authentication and
    /// the unused-bytes recovery as needed.
    pub fn get_dispatch_status(&self) -> DispatchStatus {
        if self.live_messages_size.get_value() >= self.max_live_messages_size.load(Relaxed) {
            return DispatchStatus::Complete; // complete for now
        }

        if !self.is_authenticated() {
            if self.auth.lock().unwrap().do_work() == AuthState::WaitingForMemory {
                return DispatchStatus::NeedMemory;
            }
            if !self.is_authenticated() {
                return DispatchStatus::Complete;
            }
        }

        if !self.unused_bytes_recovered.load(Relaxed) {
            if self.recover_unused_bytes().is_err() {
                return DispatchStatus::NeedMemory;
            }
            self.unused_bytes_recovered.store(true, Relaxed);
        }

        let mut loader = self.loader.lock().unwrap();
        if loader.queue_messages().is_err() {
            return DispatchStatus::NeedMemory;
        }
        if loader.peek_message().is_some() {
            DispatchStatus::DataRemains
        } else {
            DispatchStatus::Complete
        }
    }

    /// Move the auth conversation's trailing bytes into the loader buffer.
    /// All partial work rolls back on an allocation failure so the caller
    /// can retry.
    fn recover_unused_bytes(&self) -> Result<()> {
        let mut auth = self.auth.lock().unwrap();
        let mut loader = self.loader.lock().unwrap();

        if auth.needs_decoding() {
            if !fault::try_alloc(auth.unused_bytes().len()) {
                trace!("not enough memory for the plaintext recovery buffer");
                return Err(Error::out_of_memory());
            }
            let mut plaintext = crate::busline::protocol::acquire_buffer(auth.unused_bytes().len());
            auth.decode_data(auth.unused_bytes(), &mut plaintext)?;
            loader.append_bytes(&plaintext)?;
            auth.delete_unused_bytes();
            crate::busline::protocol::release_buffer(plaintext);
        } else {
            loader.append_bytes(auth.unused_bytes())?;
            auth.delete_unused_bytes();
        }

        trace!(
            buffered = loader.buffer_mut().len(),
            "unused handshake bytes moved to the message loader"
        );
        Ok(())
    }

    /// Drain the loader into the connection's inbound queue while messages
    /// remain, tagging each with the live-bytes counter. Disconnects the
    /// transport if the loader declared the stream corrupt. Fails only when
    /// out of memory.
    pub fn queue_messages(&self) -> Result<()> {
        let mut status = self.get_dispatch_status();
        while status == DispatchStatus::DataRemains {
            let msg = self
                .loader
                .lock()
                .unwrap()
                .pop_message()
                .expect("dispatch status promised a message");

            match CounterGuard::attach(&self.live_messages_size, msg.len()) {
                Err(_) => {
                    self.loader.lock().unwrap().putback_message(msg);
                    status = DispatchStatus::NeedMemory;
                    break;
                }
                Ok(guard) => {
                    // pass ownership to the connection
                    if let Some(connection) = self.connection() {
                        connection.queue_received_message(LiveMessage::new(msg, guard));
                    }
                }
            }

            status = self.get_dispatch_status();
        }

        if self.loader.lock().unwrap().is_corrupted() {
            debug!("corrupted message stream, disconnecting");
            self.disconnect();
        }

        if status == DispatchStatus::NeedMemory {
            Err(Error::out_of_memory())
        } else {
            Ok(())
        }
    }

    // --- limits ---

    pub fn set_max_message_size(&self, size: usize) {
        self.loader.lock().unwrap().set_max_message_size(size);
    }

    pub fn get_max_message_size(&self) -> usize {
        self.loader.lock().unwrap().max_message_size()
    }

    /// Cap the total bytes of received-but-unconsumed messages. Re-arms the
    /// counter callback and re-evaluates the backend's read watch.
    pub fn set_max_received_size(&self, size: usize) {
        self.max_live_messages_size.store(size, Relaxed);
        self.arm_counter_notify();
        self.live_messages_changed(self.live_messages_size.get_value());
    }

    pub fn get_max_received_size(&self) -> usize {
        self.max_live_messages_size.load(Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_messages_size.get_value()
    }

    pub(crate) fn max_live_bytes(&self) -> usize {
        self.max_live_messages_size.load(Relaxed)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.disconnected.load(Relaxed) {
            self.disconnect();
        }
        // Guards owned by still-live messages may outlive us; the counter
        // must not call back into freed memory.
        self.live_messages_size.set_notify(0, None);

        #[cfg(test)]
        ACTIVE_TRANSPORTS.fetch_sub(1, Relaxed);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Transport{{backend={} server={} connected={} authenticated={}}}",
            self.backend.name(),
            self.is_server,
            self.is_connected(),
            self.authenticated.load(Relaxed)
        )
    }
}
