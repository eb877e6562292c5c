mod credentials;
mod guid;
mod mechanism;

pub use credentials::Credentials;
pub use guid::{ServerGuid, GUID_LENGTH_HEX};
pub use mechanism::{Mechanism, Verdict};

use std::mem;

use bytes::{Buf, BytesMut};
use strum::Display;
use tracing::{debug, trace, warn};

use crate::busline::common::fault;
use crate::busline::common::{Error, Result};

// An auth conversation line that grows past this without a terminator means
// the peer is hostile or broken.
const MAX_COMMAND_LINE: usize = 16 * 1024;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Choosing or cycling mechanisms; no mechanism has succeeded yet.
    NegotiatingMechanism,
    /// A mechanism is in flight and we are waiting for the peer's next line.
    Continuing,
    /// An allocation was refused mid-conversation; do_work will retry.
    WaitingForMemory,
    Authenticated,
    Rejected,
}

enum Side {
    Client {
        /// The GUID the server reported in its OK line.
        server_guid: Option<String>,
        tried: Vec<Mechanism>,
    },
    Server {
        guid: ServerGuid,
        /// Set once we sent OK and are waiting for BEGIN.
        ok_sent: bool,
    },
}

/// The SASL-like handshake engine. Pull/push byte interface: the backend
/// appends raw socket bytes to buffer_mut(), drains get_bytes_to_send()
/// into the socket, and steps the conversation with do_work(). Any bytes
/// that arrive after the handshake completes belong to the message stream
/// and are held in the unused-bytes region until the transport reclaims
/// them for the loader.
pub struct AuthEngine {
    side: Side,
    state: AuthState,
    /// Mechanism names the owner allows, in preference order. None = all built-in.
    allowed: Option<Vec<String>>,
    incoming: BytesMut,
    outgoing: BytesMut,
    unused: BytesMut,
    /// Identity the conversation authenticated (server side: the peer's).
    identity: Credentials,
    /// Credentials read from socket ancillary data, input to EXTERNAL.
    peer_credentials: Credentials,
    oom_waiting: bool,
}

impl AuthEngine {
    pub fn client_new() -> Self {
        Self::new(Side::Client {
            server_guid: None,
            tried: Vec::new(),
        })
    }

    pub fn server_new(guid: ServerGuid) -> Self {
        Self::new(Side::Server {
            guid,
            ok_sent: false,
        })
    }

    fn new(side: Side) -> Self {
        AuthEngine {
            side,
            state: AuthState::NegotiatingMechanism,
            allowed: None,
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            unused: BytesMut::new(),
            identity: Credentials::unset(),
            peer_credentials: Credentials::unset(),
            oom_waiting: false,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.side, Side::Server { .. })
    }

    /// Restrict the mechanisms offered/accepted. The list is copied.
    pub fn set_mechanisms(&mut self, mechanisms: &[&str]) -> Result<()> {
        if !fault::try_alloc(mechanisms.iter().map(|m| m.len()).sum()) {
            return Err(Error::out_of_memory());
        }
        self.allowed = Some(mechanisms.iter().map(|m| m.to_string()).collect());
        Ok(())
    }

    /// Install the peer credentials read from the socket by the backend.
    pub fn set_peer_credentials(&mut self, credentials: Credentials) {
        self.peer_credentials = credentials;
    }

    /// The identity this conversation authenticated as. Unset until then.
    pub fn identity(&self) -> Credentials {
        self.identity
    }

    /// Client side only: the GUID the server sent in its OK line.
    pub fn guid_from_server(&self) -> Option<&str> {
        match &self.side {
            Side::Client { server_guid, .. } => server_guid.as_deref(),
            Side::Server { .. } => None,
        }
    }

    /// Raw bytes from the socket are appended here by the backend.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.incoming
    }

    /// Append handshake bytes. Fails only when the allocation gate refuses.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if !fault::try_alloc(bytes.len()) {
            self.oom_waiting = true;
            return Err(Error::out_of_memory());
        }
        self.incoming.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes waiting to be written to the socket.
    pub fn get_bytes_to_send(&self) -> &[u8] {
        &self.outgoing
    }

    /// Discard n bytes of outgoing data after the backend wrote them.
    pub fn bytes_sent(&mut self, n: usize) {
        self.outgoing.advance(n);
    }

    pub fn state(&self) -> AuthState {
        if self.oom_waiting {
            AuthState::WaitingForMemory
        } else {
            self.state
        }
    }

    /// Trailing bytes that arrived after the handshake completed. They are
    /// message-stream bytes and must be handed to the loader exactly once.
    pub fn unused_bytes(&self) -> &[u8] {
        &self.unused
    }

    pub fn delete_unused_bytes(&mut self) {
        self.unused.clear();
    }

    /// True if a post-auth integrity/confidentiality layer was negotiated
    /// and incoming data must pass through decode_data. The built-in
    /// mechanisms never negotiate one.
    pub fn needs_decoding(&self) -> bool {
        false
    }

    /// Decode data received under the negotiated post-auth layer into out.
    /// With no layer active this is a plain copy.
    pub fn decode_data(&self, encoded: &[u8], out: &mut BytesMut) -> Result<()> {
        if !fault::try_alloc(encoded.len()) {
            return Err(Error::out_of_memory());
        }
        out.extend_from_slice(encoded);
        Ok(())
    }

    /// Step the conversation: consume complete lines from the incoming
    /// buffer, update state, and queue response lines. Returns the state
    /// after this step.
    pub fn do_work(&mut self) -> AuthState {
        if matches!(self.state, AuthState::Authenticated | AuthState::Rejected) {
            if self.state == AuthState::Authenticated {
                self.collect_trailing_bytes();
            }
            return self.state;
        }
        self.oom_waiting = false;

        // The client speaks first
        let start_conversation = self.state == AuthState::NegotiatingMechanism
            && matches!(&self.side, Side::Client { tried, .. } if tried.is_empty());
        if start_conversation {
            self.client_try_next_mechanism();
        }

        while !matches!(self.state, AuthState::Authenticated | AuthState::Rejected) {
            let end = match memchr::memmem::find(&self.incoming, b"\r\n") {
                Some(end) => end,
                None => {
                    if self.incoming.len() > MAX_COMMAND_LINE {
                        warn!("auth line exceeded {} bytes, rejecting", MAX_COMMAND_LINE);
                        self.state = AuthState::Rejected;
                    }
                    break;
                }
            };

            if !fault::try_alloc(end + 2) {
                // leave the line in the buffer; the next do_work retries
                self.oom_waiting = true;
                break;
            }

            let line = self.incoming.split_to(end + 2);
            let line = match std::str::from_utf8(&line[..end]) {
                Ok(line) => line.to_string(),
                Err(_) => {
                    warn!("auth line is not valid utf-8, rejecting");
                    self.state = AuthState::Rejected;
                    break;
                }
            };
            trace!(%line, server = self.is_server(), "handling auth line");
            self.handle_line(&line);
        }

        if self.state == AuthState::Authenticated {
            self.collect_trailing_bytes();
        }

        self.state()
    }

    // Everything received after the final handshake line belongs to the
    // message stream.
    fn collect_trailing_bytes(&mut self) {
        if self.incoming.is_empty() {
            return;
        }
        let trailing = mem::take(&mut self.incoming);
        if self.unused.is_empty() {
            self.unused = trailing;
        } else {
            self.unused.extend_from_slice(&trailing);
        }
    }

    fn handle_line(&mut self, line: &str) {
        let mut words = line.split_ascii_whitespace();
        let command = words.next().unwrap_or("");
        let args: Vec<&str> = words.collect();

        if self.is_server() {
            self.server_handle_line(command, &args);
        } else {
            self.client_handle_line(command, &args);
        }
    }

    // The mechanisms this engine will offer/accept, in order.
    fn allowed_mechanisms(&self) -> Vec<Mechanism> {
        match &self.allowed {
            None => Mechanism::all().to_vec(),
            Some(names) => names
                .iter()
                .filter_map(|name| Mechanism::from_name(name))
                .collect(),
        }
    }

    fn rejected_line(&self) -> String {
        let names: Vec<String> = self
            .allowed_mechanisms()
            .iter()
            .map(|m| m.to_string())
            .collect();
        format!("REJECTED {}\r\n", names.join(" "))
    }

    fn send_line(&mut self, line: String) {
        self.outgoing.extend_from_slice(line.as_bytes());
    }

    // --- client side ---

    fn client_try_next_mechanism(&mut self) {
        let allowed = self.allowed_mechanisms();
        let ours = Credentials::from_current_process();

        let next = match &self.side {
            Side::Client { tried, .. } => allowed.iter().find(|m| !tried.contains(*m)).copied(),
            Side::Server { .. } => unreachable!(),
        };

        match next {
            Some(mech) => {
                let response = mech.client_initial_response(&ours);
                if response.is_empty() {
                    self.send_line(format!("AUTH {}\r\n", mech));
                } else {
                    self.send_line(format!("AUTH {} {}\r\n", mech, response));
                }
                if let Side::Client { tried, .. } = &mut self.side {
                    tried.push(mech);
                }
                debug!(mechanism = %mech, "trying auth mechanism");
                self.state = AuthState::Continuing;
            }
            None => {
                debug!("no auth mechanisms left to try");
                self.state = AuthState::Rejected;
            }
        }
    }

    fn client_handle_line(&mut self, command: &str, args: &[&str]) {
        match command {
            "OK" => {
                let guid = match args.first().map(|g| ServerGuid::from_hex(g)) {
                    Some(Ok(guid)) => guid,
                    _ => {
                        warn!("server sent OK without a valid guid, rejecting");
                        self.state = AuthState::Rejected;
                        return;
                    }
                };
                if let Side::Client { server_guid, .. } = &mut self.side {
                    *server_guid = Some(guid.as_str().to_string());
                }
                self.identity = Credentials::from_current_process();
                self.send_line("BEGIN\r\n".to_string());
                self.state = AuthState::Authenticated;
            }
            "REJECTED" => {
                self.state = AuthState::NegotiatingMechanism;
                self.client_try_next_mechanism();
            }
            "ERROR" => {
                // The server couldn't parse something we sent; give up on
                // this mechanism and try the next one
                self.state = AuthState::NegotiatingMechanism;
                self.client_try_next_mechanism();
            }
            _ => {
                self.send_line("ERROR\r\n".to_string());
            }
        }
    }

    // --- server side ---

    fn server_handle_line(&mut self, command: &str, args: &[&str]) {
        match command {
            "AUTH" => {
                let mech = args.first().and_then(|name| Mechanism::from_name(name));
                let allowed = match mech {
                    Some(mech) if self.allowed_mechanisms().contains(&mech) => Some(mech),
                    _ => None,
                };
                let mech = match allowed {
                    Some(mech) => mech,
                    None => {
                        let line = self.rejected_line();
                        self.send_line(line);
                        self.state = AuthState::NegotiatingMechanism;
                        return;
                    }
                };

                let initial_response = args.get(1).copied().unwrap_or("");
                match mech.verify_initial_response(initial_response, &self.peer_credentials) {
                    Verdict::Authorized(identity) => {
                        debug!(mechanism = %mech, %identity, "peer authorized");
                        self.identity = identity;
                        let guid = match &self.side {
                            Side::Server { guid, .. } => guid.as_str().to_string(),
                            Side::Client { .. } => unreachable!(),
                        };
                        self.send_line(format!("OK {}\r\n", guid));
                        if let Side::Server { ok_sent, .. } = &mut self.side {
                            *ok_sent = true;
                        }
                        self.state = AuthState::Continuing;
                    }
                    Verdict::Rejected => {
                        debug!(mechanism = %mech, "initial response rejected");
                        let line = self.rejected_line();
                        self.send_line(line);
                        self.state = AuthState::NegotiatingMechanism;
                    }
                }
            }
            "BEGIN" => match &self.side {
                Side::Server { ok_sent: true, .. } => {
                    self.state = AuthState::Authenticated;
                }
                _ => {
                    warn!("BEGIN before OK, rejecting peer");
                    self.state = AuthState::Rejected;
                }
            },
            "CANCEL" | "ERROR" => {
                if let Side::Server { ok_sent, .. } = &mut self.side {
                    *ok_sent = false;
                }
                self.identity = Credentials::unset();
                let line = self.rejected_line();
                self.send_line(line);
                self.state = AuthState::NegotiatingMechanism;
            }
            _ => {
                self.send_line("ERROR\r\n".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Shuttle pending bytes both ways until neither side makes progress.
    fn pump(client: &mut AuthEngine, server: &mut AuthEngine) {
        for _ in 0..32 {
            client.do_work();
            server.do_work();
            let mut moved = false;
            let to_server = client.get_bytes_to_send().to_vec();
            if !to_server.is_empty() {
                server.feed(&to_server).unwrap();
                client.bytes_sent(to_server.len());
                moved = true;
            }
            let to_client = server.get_bytes_to_send().to_vec();
            if !to_client.is_empty() {
                client.feed(&to_client).unwrap();
                server.bytes_sent(to_client.len());
                moved = true;
            }
            if !moved {
                break;
            }
        }
        client.do_work();
        server.do_work();
    }

    fn server() -> (AuthEngine, ServerGuid) {
        let guid = ServerGuid::new();
        let mut engine = AuthEngine::server_new(guid.clone());
        engine.set_peer_credentials(Credentials::from_current_process());
        (engine, guid)
    }

    #[test]
    #[serial_test::serial]
    fn test_external_handshake() {
        let mut client = AuthEngine::client_new();
        let (mut server, guid) = server();

        pump(&mut client, &mut server);

        assert_eq!(client.state(), AuthState::Authenticated);
        assert_eq!(server.state(), AuthState::Authenticated);
        assert_eq!(client.guid_from_server(), Some(guid.as_str()));
        assert_eq!(
            server.identity().uid,
            Credentials::from_current_process().uid
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_client_falls_back_to_second_mechanism() {
        let mut client = AuthEngine::client_new();
        let (mut server, _) = server();
        server.set_mechanisms(&["ANONYMOUS"]).unwrap();

        pump(&mut client, &mut server);

        assert_eq!(client.state(), AuthState::Authenticated);
        assert_eq!(server.state(), AuthState::Authenticated);
        assert_eq!(server.identity().uid, None);
    }

    #[test]
    #[serial_test::serial]
    fn test_no_common_mechanism_rejects() {
        let mut client = AuthEngine::client_new();
        client.set_mechanisms(&["EXTERNAL"]).unwrap();
        let (mut server, _) = server();
        server.set_mechanisms(&["ANONYMOUS"]).unwrap();

        pump(&mut client, &mut server);

        assert_eq!(client.state(), AuthState::Rejected);
    }

    #[test]
    #[serial_test::serial]
    fn test_external_rejected_without_socket_credentials() {
        let mut client = AuthEngine::client_new();
        client.set_mechanisms(&["EXTERNAL"]).unwrap();
        let guid = ServerGuid::new();
        let mut server = AuthEngine::server_new(guid);
        // no peer credentials installed, as over tcp

        pump(&mut client, &mut server);

        assert_eq!(client.state(), AuthState::Rejected);
        assert_ne!(server.state(), AuthState::Authenticated);
    }

    #[test]
    #[serial_test::serial]
    fn test_trailing_bytes_become_unused() {
        let mut client = AuthEngine::client_new();
        let (mut server, _) = server();

        client.do_work();
        let auth_line = client.get_bytes_to_send().to_vec();
        client.bytes_sent(auth_line.len());
        server.feed(&auth_line).unwrap();
        server.do_work();
        let ok_line = server.get_bytes_to_send().to_vec();
        server.bytes_sent(ok_line.len());
        client.feed(&ok_line).unwrap();
        client.do_work();

        // BEGIN plus the first bytes of the message stream in one read
        let mut begin = client.get_bytes_to_send().to_vec();
        client.bytes_sent(begin.len());
        begin.extend_from_slice(b"\x01\x02\x03\x04");
        server.feed(&begin).unwrap();
        server.do_work();

        assert_eq!(server.state(), AuthState::Authenticated);
        assert_eq!(server.unused_bytes(), b"\x01\x02\x03\x04");
        server.delete_unused_bytes();
        assert!(server.unused_bytes().is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_waiting_for_memory_retries() {
        let mut client = AuthEngine::client_new();
        let (mut server, _) = server();

        client.do_work();
        let auth_line = client.get_bytes_to_send().to_vec();
        client.bytes_sent(auth_line.len());
        server.feed(&auth_line).unwrap();

        fault::set_fail_alloc_counter(0);
        assert_eq!(server.do_work(), AuthState::WaitingForMemory);
        fault::clear_fail_alloc();

        // the unprocessed line was kept; retrying succeeds
        assert_eq!(server.do_work(), AuthState::Continuing);
        assert!(server.get_bytes_to_send().starts_with(b"OK "));
    }
}
