use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::busline::common::{Counted, Error, LifeCount, Result, Shared};
use crate::busline::protocol::Message;
use crate::busline::transport::{LiveMessage, Timeout, Transport, Watch};

pub type AddWatchFn = Box<dyn Fn(&Arc<Watch>) -> bool + Send + Sync>;
pub type RemoveWatchFn = Box<dyn Fn(&Arc<Watch>) + Send + Sync>;
pub type ToggleWatchFn = Box<dyn Fn(&Arc<Watch>, bool) + Send + Sync>;

pub type AddTimeoutFn = Box<dyn Fn(&Arc<Timeout>) -> bool + Send + Sync>;
pub type RemoveTimeoutFn = Box<dyn Fn(&Arc<Timeout>) + Send + Sync>;

struct WatchHooks {
    add: AddWatchFn,
    remove: RemoveWatchFn,
    toggle: ToggleWatchFn,
}

struct TimeoutHooks {
    add: AddTimeoutFn,
    remove: RemoveTimeoutFn,
}

/// The owning side of a transport: it holds the strong reference, the
/// inbound queue the transport fills, the outbound queue the backend
/// drains, and the watch/timeout registrations it relays to the host
/// event loop. Message routing and handler dispatch live above this type.
pub struct Connection {
    life: LifeCount,
    transport: Shared<Transport>,
    incoming: Mutex<VecDeque<LiveMessage>>,
    outgoing: Mutex<VecDeque<Message>>,
    watches: Mutex<Vec<Arc<Watch>>>,
    timeouts: Mutex<Vec<Arc<Timeout>>>,
    watch_hooks: Mutex<Option<WatchHooks>>,
    timeout_hooks: Mutex<Option<TimeoutHooks>>,
}

impl Counted for Connection {
    fn life(&self) -> &LifeCount {
        &self.life
    }
}

impl Connection {
    /// Attach a connection to an open transport. The transport's
    /// connection_set hook registers its initial watches here.
    pub fn new(transport: Shared<Transport>) -> Result<Shared<Connection>> {
        let conn = Shared::new(Connection {
            life: LifeCount::new(),
            transport,
            incoming: Mutex::new(VecDeque::new()),
            outgoing: Mutex::new(VecDeque::new()),
            watches: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            watch_hooks: Mutex::new(None),
            timeout_hooks: Mutex::new(None),
        });
        conn.transport.set_connection(&conn)?;
        Ok(conn)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    // --- host event loop surface ---

    /// Register callbacks invoked whenever the transport creates, removes,
    /// or toggles a watch. The add callback is replayed for watches that
    /// already exist; it returns false only on OOM, which rolls back the
    /// replayed adds.
    pub fn set_watch_functions(
        &self,
        add: AddWatchFn,
        remove: RemoveWatchFn,
        toggle: ToggleWatchFn,
    ) -> Result<()> {
        let watches = self.watches.lock().unwrap().clone();
        let mut added = Vec::new();
        for watch in &watches {
            if !(add)(watch) {
                for watch in &added {
                    (remove)(watch);
                }
                return Err(Error::out_of_memory());
            }
            added.push(watch.clone());
        }
        *self.watch_hooks.lock().unwrap() = Some(WatchHooks {
            add,
            remove,
            toggle,
        });
        Ok(())
    }

    pub fn set_timeout_functions(
        &self,
        add: AddTimeoutFn,
        remove: RemoveTimeoutFn,
    ) -> Result<()> {
        let timeouts = self.timeouts.lock().unwrap().clone();
        let mut added = Vec::new();
        for timeout in &timeouts {
            if !(add)(timeout) {
                for timeout in &added {
                    (remove)(timeout);
                }
                return Err(Error::out_of_memory());
            }
            added.push(timeout.clone());
        }
        *self.timeout_hooks.lock().unwrap() = Some(TimeoutHooks { add, remove });
        Ok(())
    }

    /// The watches currently registered, for hosts that poll rather than
    /// install hooks.
    pub fn watches(&self) -> Vec<Arc<Watch>> {
        self.watches.lock().unwrap().clone()
    }

    pub fn timeouts(&self) -> Vec<Arc<Timeout>> {
        self.timeouts.lock().unwrap().clone()
    }

    // --- application surface ---

    /// Queue a message to send to the peer. The backend writes it out on
    /// the next writable readiness or do_iteration with the write flag.
    pub fn send(&self, msg: Message) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::closed());
        }
        let pending = {
            let mut outgoing = self.outgoing.lock().unwrap();
            outgoing.push_back(msg);
            outgoing.len()
        };
        self.transport.messages_pending(pending);
        Ok(())
    }

    /// Pop the next received message, in peer-send order. Dropping the
    /// returned message releases its live-bytes reservation.
    pub fn pop_message(&self) -> Option<LiveMessage> {
        self.incoming.lock().unwrap().pop_front()
    }

    pub fn n_incoming(&self) -> usize {
        self.incoming.lock().unwrap().len()
    }

    pub fn has_messages_to_send(&self) -> bool {
        !self.outgoing.lock().unwrap().is_empty()
    }

    // --- transport-facing surface ---
    // These are the unlocked-style operations: they take only their own
    // fine-grained locks and are safe to call from inside transport
    // operations.

    pub(crate) fn queue_received_message(&self, msg: LiveMessage) {
        debug!(msg = ?msg.message(), "queueing received message");
        self.incoming.lock().unwrap().push_back(msg);
    }

    pub(crate) fn get_message_to_send(&self) -> Option<Message> {
        self.outgoing.lock().unwrap().pop_front()
    }

    pub(crate) fn add_watch(&self, watch: Arc<Watch>) -> Result<()> {
        self.watches.lock().unwrap().push(watch.clone());
        let hooks_guard = self.watch_hooks.lock().unwrap();
        if let Some(hooks) = &*hooks_guard {
            if !(hooks.add)(&watch) {
                drop(hooks_guard);
                self.watches.lock().unwrap().retain(|w| !Arc::ptr_eq(w, &watch));
                return Err(Error::out_of_memory());
            }
        }
        Ok(())
    }

    pub(crate) fn remove_watch(&self, watch: &Arc<Watch>) {
        self.watches.lock().unwrap().retain(|w| !Arc::ptr_eq(w, watch));
        // the host sees the fd one last time, then the watch goes stale
        if let Some(hooks) = &*self.watch_hooks.lock().unwrap() {
            (hooks.remove)(watch);
        }
        watch.invalidate();
    }

    pub(crate) fn toggle_watch(&self, watch: &Arc<Watch>, enabled: bool) {
        if watch.is_enabled() == enabled {
            return;
        }
        watch.set_enabled(enabled);
        if let Some(hooks) = &*self.watch_hooks.lock().unwrap() {
            (hooks.toggle)(watch, enabled);
        }
    }

    pub(crate) fn add_timeout(&self, timeout: Arc<Timeout>) -> Result<()> {
        self.timeouts.lock().unwrap().push(timeout.clone());
        let hooks_guard = self.timeout_hooks.lock().unwrap();
        if let Some(hooks) = &*hooks_guard {
            if !(hooks.add)(&timeout) {
                drop(hooks_guard);
                self.timeouts
                    .lock()
                    .unwrap()
                    .retain(|t| !Arc::ptr_eq(t, &timeout));
                return Err(Error::out_of_memory());
            }
        }
        Ok(())
    }

    pub(crate) fn remove_timeout(&self, timeout: &Arc<Timeout>) {
        self.timeouts
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, timeout));
        timeout.set_enabled(false);
        if let Some(hooks) = &*self.timeout_hooks.lock().unwrap() {
            (hooks.remove)(timeout);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Disconnect while the connection is still valid so the backend can
        // remove its watches through us, then sever the back-pointer before
        // the transport reference drops.
        self.transport.disconnect();
        self.transport.clear_connection();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Connection{{incoming={} authenticated={}}}",
            self.incoming.lock().unwrap().len(),
            self.transport.is_authenticated_peek()
        )
    }
}
