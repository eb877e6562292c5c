use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use crate::busline::common::fault;
use crate::busline::common::{Error, Result};
use crate::busline::protocol::Message;

pub type CounterNotifyFn = Box<dyn Fn(usize) + Send + Sync>;

struct CounterNotify {
    threshold: usize,
    callback: CounterNotifyFn,
}

/// Tracks the total bytes of messages queued on the connection but not yet
/// consumed by the application. Crossing the threshold in either direction
/// fires the notify callback exactly once per crossing; the transport uses
/// it to toggle the backend's read watch.
pub struct LiveBytesCounter {
    value: AtomicUsize,
    // adjust() serializes on this mutex so crossings are seen in order.
    // The callback runs with it held and must not re-arm the notify.
    notify: Mutex<Option<CounterNotify>>,
}

impl LiveBytesCounter {
    pub fn new() -> Self {
        LiveBytesCounter {
            value: AtomicUsize::new(0),
            notify: Mutex::new(None),
        }
    }

    pub fn get_value(&self) -> usize {
        self.value.load(Relaxed)
    }

    /// Install or replace the threshold callback. Re-arming does not
    /// synthesize a crossing event; callers that change the threshold
    /// re-evaluate explicitly.
    pub fn set_notify(&self, threshold: usize, callback: Option<CounterNotifyFn>) {
        *self.notify.lock().unwrap() =
            callback.map(|callback| CounterNotify { threshold, callback });
    }

    /// Add delta (possibly negative) to the counter.
    pub fn adjust(&self, delta: isize) {
        let guard = self.notify.lock().unwrap();
        let old = self.value.load(Relaxed);
        let new = if delta >= 0 {
            old.saturating_add(delta as usize)
        } else {
            old.saturating_sub(delta.unsigned_abs())
        };
        self.value.store(new, Relaxed);

        if let Some(notify) = &*guard {
            let was_over = old >= notify.threshold;
            let is_over = new >= notify.threshold;
            if was_over != is_over {
                (notify.callback)(new);
            }
        }
    }
}

/// Holds a size reservation against a counter for as long as it lives.
pub struct CounterGuard {
    counter: Arc<LiveBytesCounter>,
    size: usize,
}

impl CounterGuard {
    /// Reserve size bytes against the counter. Fails only when the
    /// allocation gate refuses, leaving the counter untouched.
    pub fn attach(counter: &Arc<LiveBytesCounter>, size: usize) -> Result<CounterGuard> {
        if !fault::try_alloc(size) {
            return Err(Error::out_of_memory());
        }
        counter.adjust(size as isize);
        Ok(CounterGuard {
            counter: counter.clone(),
            size,
        })
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.adjust(-(self.size as isize));
    }
}

/// A message queued on the connection, tagged with its live-bytes
/// reservation. Dropping it (the application consuming the message)
/// releases the reservation.
pub struct LiveMessage {
    message: Message,
    _counter: CounterGuard,
}

impl LiveMessage {
    pub fn new(message: Message, counter: CounterGuard) -> Self {
        LiveMessage {
            message,
            _counter: counter,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl std::ops::Deref for LiveMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn test_adjust_tracks_value() {
        let counter = LiveBytesCounter::new();
        counter.adjust(100);
        counter.adjust(50);
        counter.adjust(-30);
        assert_eq!(counter.get_value(), 120);
    }

    #[test]
    fn test_notify_fires_on_each_crossing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = LiveBytesCounter::new();
        let fired2 = fired.clone();
        counter.set_notify(
            100,
            Some(Box::new(move |_| {
                fired2.fetch_add(1, SeqCst);
            })),
        );

        counter.adjust(99); // below
        assert_eq!(fired.load(SeqCst), 0);
        counter.adjust(1); // crosses up
        assert_eq!(fired.load(SeqCst), 1);
        counter.adjust(500); // stays over
        assert_eq!(fired.load(SeqCst), 1);
        counter.adjust(-501); // crosses down
        assert_eq!(fired.load(SeqCst), 2);
    }

    #[test]
    #[serial_test::serial]
    fn test_guard_releases_on_drop() {
        let counter = Arc::new(LiveBytesCounter::new());
        let guard = CounterGuard::attach(&counter, 256).unwrap();
        assert_eq!(counter.get_value(), 256);
        drop(guard);
        assert_eq!(counter.get_value(), 0);
    }
}
