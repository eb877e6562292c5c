use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;

use crate::busline::auth::ServerGuid;
use crate::busline::common::{Result, Shared};
use crate::busline::connection::Connection;
use crate::busline::protocol::{Message, MessageBuilder, Tag, HEADER_LEN};
use crate::busline::transport::{
    accept_debug_pipe, listen_debug_pipe, open, unlisten_debug_pipe, DO_READING, DO_WRITING,
};

static PIPE_SERIAL: AtomicU32 = AtomicU32::new(0);

/// A connected client/server pair over an in-process debug pipe, plus the
/// pipe name it used.
pub struct Pair {
    pub client: Shared<Connection>,
    pub server: Shared<Connection>,
}

/// A fresh pipe name, so concurrently running tests never collide.
pub fn pipe_name(prefix: &str) -> String {
    format!("{}-{}", prefix, PIPE_SERIAL.fetch_add(1, Relaxed))
}

/// Open a debug-pipe pair and attach a connection to each end. The extra
/// address params (e.g. ",guid=<hex>") are appended verbatim.
pub fn pipe_pair(prefix: &str, guid: &ServerGuid, extra_params: &str) -> Result<Pair> {
    let name = pipe_name(prefix);
    listen_debug_pipe(&name, guid.clone())?;

    let result = open(&format!("debug-pipe:name={}{}", name, extra_params));
    let client_transport = match result {
        Ok(transport) => transport,
        Err(e) => {
            unlisten_debug_pipe(&name);
            return Err(e);
        }
    };
    let server_transport = accept_debug_pipe(&name).expect("client connected, server must exist");
    unlisten_debug_pipe(&name);

    let client = Connection::new(client_transport)?;
    let server = Connection::new(server_transport)?;
    Ok(Pair { client, server })
}

/// Drive both ends until pred holds or we give up. Returns whether pred
/// held.
pub fn pump_until<F: Fn() -> bool>(pair: &Pair, pred: F) -> bool {
    for _ in 0..64 {
        if pred() {
            return true;
        }
        pair.client
            .transport()
            .do_iteration(DO_READING | DO_WRITING, 0);
        pair.server
            .transport()
            .do_iteration(DO_READING | DO_WRITING, 0);
    }
    pred()
}

/// Drive both ends through the full handshake.
pub fn pump_handshake(pair: &Pair) -> bool {
    pump_until(pair, || {
        pair.client.transport().is_authenticated() && pair.server.transport().is_authenticated()
    })
}

/// A message whose total frame size is exactly total_len bytes.
pub fn message_of_size(serial: u32, total_len: usize) -> Message {
    assert!(total_len >= HEADER_LEN);
    let mut mb = MessageBuilder::new(Tag::MethodCall, serial);
    mb.write_bytes(&vec![0x5a; total_len - HEADER_LEN]);
    mb.finish()
}
