use std::io;
use std::net::TcpStream;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use bytes::{BufMut, BytesMut};

use crate::busline::auth::{AuthState, Credentials};
use crate::busline::common::fault;
use crate::busline::common::{Error, Result};
use crate::busline::config::conf;
use crate::busline::protocol::Message;
use crate::busline::transport::watch::{Timeout, Watch, WatchFlags};
use crate::busline::transport::{Transport, DO_READING, DO_WRITING};

struct InFlight {
    msg: Message,
    written: usize,
}

/// Stream-socket backend: performs all OS reads and writes for a transport
/// over a unix or tcp socket (or a socketpair conjured by the debug-pipe
/// opener). Owns the descriptor, the two watches, and the server-side
/// authentication deadline.
pub struct SocketBackend {
    fd: AtomicI32,
    is_unix: bool,
    read_watch: Mutex<Option<Arc<Watch>>>,
    write_watch: Mutex<Option<Arc<Watch>>>,
    auth_timeout: Mutex<Option<Arc<Timeout>>>,
    in_flight: Mutex<Option<InFlight>>,
}

impl SocketBackend {
    /// Take ownership of a connected socket descriptor. The descriptor is
    /// switched to nonblocking; the host loop supplies readiness.
    pub fn from_raw_fd(fd: RawFd, is_unix: bool) -> Result<SocketBackend> {
        set_nonblocking(fd)?;
        Ok(SocketBackend {
            fd: AtomicI32::new(fd),
            is_unix,
            read_watch: Mutex::new(None),
            write_watch: Mutex::new(None),
            auth_timeout: Mutex::new(None),
            in_flight: Mutex::new(None),
        })
    }

    pub(crate) fn connect_unix(path: &str) -> Result<SocketBackend> {
        let stream = UnixStream::connect(path)?;
        debug!(path, "connected unix socket");
        Self::from_raw_fd(stream.into_raw_fd(), true)
    }

    pub(crate) fn connect_tcp(host: &str, port: u16) -> Result<SocketBackend> {
        let stream = TcpStream::connect((host, port))?;
        debug!(host, port, "connected tcp socket");
        Self::from_raw_fd(stream.into_raw_fd(), false)
    }

    fn fd(&self) -> RawFd {
        self.fd.load(Relaxed)
    }

    pub(crate) fn get_socket_fd(&self) -> Option<RawFd> {
        let fd = self.fd();
        if fd >= 0 {
            Some(fd)
        } else {
            None
        }
    }

    // --- vtable operations ---

    /// Register the initial watches (and the server auth deadline) with the
    /// newly attached connection. Rolls back on OOM.
    pub(crate) fn connection_set(&self, transport: &Transport) -> Result<()> {
        let connection = transport
            .connection()
            .expect("connection_set invoked without a connection");

        let read_watch = Arc::new(Watch::new(self.fd(), WatchFlags::READABLE, true));
        connection.add_watch(read_watch.clone())?;

        let write_watch = Arc::new(Watch::new(self.fd(), WatchFlags::WRITABLE, false));
        if let Err(e) = connection.add_watch(write_watch.clone()) {
            connection.remove_watch(&read_watch);
            return Err(e);
        }

        if transport.is_server() && conf().auth_timeout_milliseconds > 0 {
            let timeout = Arc::new(Timeout::new(conf().auth_timeout_milliseconds, true));
            if let Err(e) = connection.add_timeout(timeout.clone()) {
                connection.remove_watch(&read_watch);
                connection.remove_watch(&write_watch);
                return Err(e);
            }
            *self.auth_timeout.lock().unwrap() = Some(timeout);
        }

        *self.read_watch.lock().unwrap() = Some(read_watch);
        *self.write_watch.lock().unwrap() = Some(write_watch);
        Ok(())
    }

    /// Remove our watches and deadline from the connection and close the
    /// descriptor. Runs once, from Transport::disconnect.
    pub(crate) fn disconnect(&self, transport: &Transport) {
        let read_watch = self.read_watch.lock().unwrap().take();
        let write_watch = self.write_watch.lock().unwrap().take();
        let auth_timeout = self.auth_timeout.lock().unwrap().take();

        if let Some(connection) = transport.connection() {
            if let Some(watch) = &read_watch {
                connection.remove_watch(watch);
            }
            if let Some(watch) = &write_watch {
                connection.remove_watch(watch);
            }
            if let Some(timeout) = &auth_timeout {
                connection.remove_timeout(timeout);
            }
        } else {
            if let Some(watch) = &read_watch {
                watch.invalidate();
            }
            if let Some(watch) = &write_watch {
                watch.invalidate();
            }
        }

        let fd = self.fd.swap(-1, Relaxed);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }

    pub(crate) fn handle_watch(
        &self,
        transport: &Transport,
        watch: &Arc<Watch>,
        condition: WatchFlags,
    ) -> Result<()> {
        let is_read = self
            .read_watch
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| Arc::ptr_eq(w, watch))
            .unwrap_or(false);
        let is_write = self
            .write_watch
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| Arc::ptr_eq(w, watch))
            .unwrap_or(false);

        if !is_read && !is_write {
            warn!(watch = ?watch, "dispatched a watch this transport does not own");
            return Ok(());
        }

        if condition.contains(WatchFlags::HANGUP | WatchFlags::ERROR)
            && !condition.contains(WatchFlags::READABLE)
        {
            debug!(condition = ?condition, "socket hangup/error, disconnecting");
            transport.disconnect();
            return Ok(());
        }

        if is_read && condition.contains(WatchFlags::READABLE) {
            if !transport.is_authenticated_peek() {
                self.do_authentication(transport, true, false)?;
            }
            if transport.is_authenticated() {
                self.do_reading(transport)?;
            }
        }

        if is_write && condition.contains(WatchFlags::WRITABLE) {
            if !transport.is_authenticated_peek() {
                self.do_authentication(transport, false, true)?;
            }
            if transport.is_authenticated() {
                self.do_writing(transport)?;
            }
            self.update_write_watch(transport);
        }

        Ok(())
    }

    pub(crate) fn handle_timeout(&self, transport: &Transport, timeout: &Arc<Timeout>) {
        let is_auth_timeout = self
            .auth_timeout
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| Arc::ptr_eq(t, timeout))
            .unwrap_or(false);
        if !is_auth_timeout {
            return;
        }
        if !transport.is_authenticated_peek() {
            warn!(
                interval_ms = timeout.interval_ms(),
                "peer did not authenticate in time, disconnecting"
            );
            transport.disconnect();
        }
    }

    /// Poll once and then read/write per flags. timeout of -1 blocks until
    /// readiness, 0 just polls.
    pub(crate) fn do_iteration(&self, transport: &Transport, flags: u32, timeout_ms: i32) {
        let fd = self.fd();
        if fd < 0 {
            return;
        }

        let mut events: libc::c_short = 0;
        if flags & DO_READING != 0 && self.read_enabled() {
            events |= libc::POLLIN;
        }
        if flags & DO_WRITING != 0 && self.wants_write(transport) {
            events |= libc::POLLOUT;
        }
        if events == 0 {
            return;
        }

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret <= 0 {
            return; // timeout, or EINTR and the host will call again
        }

        let mut condition = WatchFlags::NONE;
        if pfd.revents & libc::POLLIN != 0 {
            condition = condition | WatchFlags::READABLE;
        }
        if pfd.revents & libc::POLLOUT != 0 {
            condition = condition | WatchFlags::WRITABLE;
        }
        if pfd.revents & libc::POLLERR != 0 {
            condition = condition | WatchFlags::ERROR;
        }
        if pfd.revents & libc::POLLHUP != 0 {
            condition = condition | WatchFlags::HANGUP;
        }

        let read_watch = self.read_watch.lock().unwrap().clone();
        let write_watch = self.write_watch.lock().unwrap().clone();
        if flags & DO_READING != 0
            && condition.contains(WatchFlags::READABLE | WatchFlags::ERROR | WatchFlags::HANGUP)
        {
            if let Some(watch) = &read_watch {
                let _ = transport.handle_watch(watch, condition);
            }
        }
        if flags & DO_WRITING != 0 && condition.contains(WatchFlags::WRITABLE) {
            if let Some(watch) = &write_watch {
                let _ = transport.handle_watch(watch, condition);
            }
        }
    }

    /// Counter notify: disable reads while the live-bytes total is at or
    /// over the cap, re-enable once the application drains below it.
    pub(crate) fn live_messages_changed(&self, transport: &Transport) {
        let enable = transport.live_bytes() < transport.max_live_bytes();
        if let (Some(connection), Some(watch)) = (
            transport.connection(),
            self.read_watch.lock().unwrap().as_ref(),
        ) {
            trace!(enable, "toggling read watch for live-bytes backpressure");
            connection.toggle_watch(watch, enable);
        }
    }

    /// The connection queued outgoing messages; watch for writability.
    pub(crate) fn messages_pending(&self, transport: &Transport) {
        if let (Some(connection), Some(watch)) = (
            transport.connection(),
            self.write_watch.lock().unwrap().as_ref(),
        ) {
            connection.toggle_watch(watch, true);
        }
    }

    // --- I/O internals ---

    fn read_enabled(&self) -> bool {
        self.read_watch
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| w.is_enabled())
            .unwrap_or(true)
    }

    fn wants_write(&self, transport: &Transport) -> bool {
        if !transport.is_authenticated_peek() {
            let (send_pending, _) = transport.credentials_pending();
            return send_pending
                || !transport.auth().lock().unwrap().get_bytes_to_send().is_empty()
                || !transport.is_server();
        }
        self.in_flight.lock().unwrap().is_some()
            || transport
                .connection()
                .map(|c| c.has_messages_to_send())
                .unwrap_or(false)
    }

    fn update_write_watch(&self, transport: &Transport) {
        let enable = self.wants_write(transport);
        if let (Some(connection), Some(watch)) = (
            transport.connection(),
            self.write_watch.lock().unwrap().as_ref(),
        ) {
            connection.toggle_watch(watch, enable);
        }
    }

    /// Read a chunk of the message stream into the loader and queue any
    /// complete messages. Respects the live-bytes cap. Fails only on OOM.
    fn do_reading(&self, transport: &Transport) -> Result<()> {
        if transport.live_bytes() >= transport.max_live_bytes() {
            // refuse to create more live messages until the application
            // drains some
            self.live_messages_changed(transport);
            return Ok(());
        }
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }

        let chunk = conf().recv_buffer_size;
        let mut saw_eof = false;
        {
            let mut loader = transport.loader().lock().unwrap();
            loader.reserve_read_space(chunk)?;
            match read_append(fd, loader.buffer_mut(), chunk) {
                n if n > 0 => {}
                0 => saw_eof = true,
                _ => {
                    if !would_block() {
                        debug!(err = %io::Error::last_os_error(), "read error, disconnecting");
                        saw_eof = true;
                    }
                }
            }
        }

        if saw_eof {
            debug!("peer closed the message stream");
            transport.disconnect();
            return Ok(());
        }

        transport.queue_messages()
    }

    /// Write queued outgoing messages, possibly partially; a message stays
    /// in flight across calls until fully written.
    fn do_writing(&self, transport: &Transport) -> Result<()> {
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        let connection = match transport.connection() {
            Some(connection) => connection,
            None => return Ok(()),
        };

        let mut in_flight = self.in_flight.lock().unwrap();
        loop {
            if in_flight.is_none() {
                match connection.get_message_to_send() {
                    Some(msg) => {
                        *in_flight = Some(InFlight { msg, written: 0 })
                    }
                    None => break,
                }
            }

            let fl = in_flight.as_mut().unwrap();
            let data = &fl.msg.as_bytes()[fl.written..];
            let n =
                unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
            if n < 0 {
                if would_block() {
                    break;
                }
                debug!(err = %io::Error::last_os_error(), "write error, disconnecting");
                drop(in_flight);
                transport.disconnect();
                return Ok(());
            }
            fl.written += n as usize;
            if fl.written == fl.msg.len() {
                trace!(msg = ?&fl.msg, "message fully written");
                *in_flight = None;
            }
        }

        Ok(())
    }

    /// Drive the handshake: exchange the credentials byte, then shuttle
    /// auth conversation bytes and step the engine. May disconnect on
    /// rejection. Fails only on OOM.
    fn do_authentication(
        &self,
        transport: &Transport,
        do_reading: bool,
        do_writing: bool,
    ) -> Result<()> {
        self.exchange_credentials(transport, do_reading, do_writing)?;
        let (send_pending, recv_pending) = transport.credentials_pending();
        if send_pending || recv_pending {
            return Ok(());
        }

        // step the engine so it has something to say (the client's first
        // AUTH line in particular), and run the identity checks
        transport.is_authenticated();
        if !transport.is_connected() {
            return Ok(());
        }

        if do_writing {
            self.flush_auth_output(transport);
        }
        if do_reading {
            self.read_into_auth(transport)?;
            transport.is_authenticated();
            // responses generated by the bytes we just fed
            self.flush_auth_output(transport);
        }

        if transport.auth().lock().unwrap().state() == AuthState::Rejected {
            debug!("authentication rejected, disconnecting");
            transport.disconnect();
            return Ok(());
        }

        if transport.is_authenticated_peek() {
            // the deadline no longer applies
            let auth_timeout = self.auth_timeout.lock().unwrap().take();
            if let (Some(connection), Some(timeout)) = (transport.connection(), auth_timeout) {
                connection.remove_timeout(&timeout);
            }
        }

        self.update_write_watch(transport);
        Ok(())
    }

    /// The first byte on the wire: a single NUL from client to server. On
    /// the server side it carries the peer credentials as ancillary data
    /// (SO_PEERCRED on unix sockets).
    fn exchange_credentials(
        &self,
        transport: &Transport,
        do_reading: bool,
        do_writing: bool,
    ) -> Result<()> {
        let (send_pending, recv_pending) = transport.credentials_pending();
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }

        if send_pending && do_writing {
            let nul = [0u8; 1];
            let n = unsafe { libc::write(fd, nul.as_ptr() as *const libc::c_void, 1) };
            if n == 1 {
                trace!("credentials byte sent");
                transport.clear_send_credentials_pending();
            } else if n < 0 && !would_block() {
                debug!(err = %io::Error::last_os_error(), "sending credentials failed, disconnecting");
                transport.disconnect();
            }
        }

        if recv_pending && do_reading {
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            if n == 1 {
                if byte[0] != 0 {
                    warn!("peer did not lead with the credentials byte, disconnecting");
                    transport.disconnect();
                    return Ok(());
                }
                let credentials = if self.is_unix {
                    read_peer_credentials(fd)
                } else {
                    Credentials::unset()
                };
                trace!(%credentials, "credentials byte received");
                transport.set_peer_credentials(credentials);
                transport.clear_receive_credentials_pending();
            } else if n == 0 {
                debug!("peer closed before the handshake");
                transport.disconnect();
            } else if !would_block() {
                debug!(err = %io::Error::last_os_error(), "reading credentials failed, disconnecting");
                transport.disconnect();
            }
        }

        Ok(())
    }

    fn read_into_auth(&self, transport: &Transport) -> Result<()> {
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        let chunk = conf().recv_buffer_size;

        let mut saw_eof = false;
        {
            let mut auth = transport.auth().lock().unwrap();
            if !fault::try_alloc(chunk) {
                return Err(Error::out_of_memory());
            }
            let buf = auth.buffer_mut();
            buf.reserve(chunk);
            match read_append(fd, buf, chunk) {
                n if n > 0 => {}
                0 => saw_eof = true,
                _ => {
                    if !would_block() {
                        saw_eof = true;
                    }
                }
            }
        }

        if saw_eof {
            debug!("peer closed during the handshake");
            transport.disconnect();
        }
        Ok(())
    }

    fn flush_auth_output(&self, transport: &Transport) {
        let fd = self.fd();
        if fd < 0 {
            return;
        }
        loop {
            let mut auth = transport.auth().lock().unwrap();
            let pending = auth.get_bytes_to_send();
            if pending.is_empty() {
                break;
            }
            let n =
                unsafe { libc::write(fd, pending.as_ptr() as *const libc::c_void, pending.len()) };
            if n > 0 {
                auth.bytes_sent(n as usize);
            } else {
                if n < 0 && !would_block() {
                    drop(auth);
                    debug!(err = %io::Error::last_os_error(), "auth write error, disconnecting");
                    transport.disconnect();
                }
                break;
            }
        }
    }
}

impl Drop for SocketBackend {
    fn drop(&mut self) {
        // Normally disconnect already closed and cleared the descriptor;
        // this covers backends dropped before their transport ever opened.
        let fd = self.fd.swap(-1, Relaxed);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// read(2) from fd straight into buf's spare capacity, without
/// zero-initializing it first. Returns what read() returned; buf's length
/// advances only on a positive return.
fn read_append(fd: RawFd, buf: &mut BytesMut, max: usize) -> isize {
    let spare = buf.chunk_mut();
    let want = spare.len().min(max);
    let dst = spare.as_mut_ptr();
    // Safety: the kernel writes at most `want` bytes starting at `dst`,
    // which all lie inside buf's reserved capacity, and the length is
    // advanced by exactly the count the kernel reported writing
    unsafe {
        let n = libc::read(fd, dst as *mut libc::c_void, want);
        if n > 0 {
            buf.advance_mut(n as usize);
        }
        n
    }
}

fn would_block() -> bool {
    matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR)
    )
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn read_peer_credentials(fd: RawFd) -> Credentials {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        warn!(err = %io::Error::last_os_error(), "SO_PEERCRED failed");
        return Credentials::unset();
    }
    Credentials {
        pid: Some(ucred.pid as u32),
        uid: Some(ucred.uid as u32),
        gid: Some(ucred.gid as u32),
    }
}

#[cfg(not(target_os = "linux"))]
fn read_peer_credentials(_fd: RawFd) -> Credentials {
    // No portable peer-credential call here; EXTERNAL falls back to
    // whatever the auth conversation can prove, which is nothing.
    Credentials::unset()
}
