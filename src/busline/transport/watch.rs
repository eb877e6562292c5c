use std::fmt;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32};

/// Readiness conditions a watch can be interested in or a descriptor can
/// report. ERROR and HANGUP are always reportable regardless of interest.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WatchFlags(u8);

impl WatchFlags {
    pub const NONE: WatchFlags = WatchFlags(0);
    pub const READABLE: WatchFlags = WatchFlags(1);
    pub const WRITABLE: WatchFlags = WatchFlags(2);
    pub const ERROR: WatchFlags = WatchFlags(4);
    pub const HANGUP: WatchFlags = WatchFlags(8);

    pub fn contains(&self, other: WatchFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for WatchFlags {
    type Output = WatchFlags;

    fn bitor(self, rhs: WatchFlags) -> WatchFlags {
        WatchFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for WatchFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(WatchFlags::READABLE) {
            names.push("READABLE");
        }
        if self.contains(WatchFlags::WRITABLE) {
            names.push("WRITABLE");
        }
        if self.contains(WatchFlags::ERROR) {
            names.push("ERROR");
        }
        if self.contains(WatchFlags::HANGUP) {
            names.push("HANGUP");
        }
        if names.is_empty() {
            names.push("NONE");
        }
        f.write_str(&names.join("|"))
    }
}

/// A registration of interest in a file descriptor's readiness, owned by
/// the transport and consumed by the host event loop. The fd becomes -1
/// when the watch is invalidated at disconnect; a host that dispatches a
/// stale watch after that is ignored.
pub struct Watch {
    fd: AtomicI32,
    interest: WatchFlags,
    enabled: AtomicBool,
}

impl Watch {
    pub fn new(fd: RawFd, interest: WatchFlags, enabled: bool) -> Self {
        Watch {
            fd: AtomicI32::new(fd),
            interest,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// The watched descriptor, or -1 if this watch has been invalidated.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Relaxed)
    }

    pub fn interest(&self) -> WatchFlags {
        self.interest
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Relaxed);
    }

    pub(crate) fn invalidate(&self) {
        self.fd.store(-1, Relaxed);
    }

    /// Drop condition bits we never asked for. ERROR and HANGUP pass
    /// through; READABLE/WRITABLE only if they are in this watch's
    /// interest set.
    pub fn sanitize(&self, condition: WatchFlags) -> WatchFlags {
        let mut out = WatchFlags::NONE;
        if condition.contains(WatchFlags::READABLE) && self.interest.contains(WatchFlags::READABLE)
        {
            out = out | WatchFlags::READABLE;
        }
        if condition.contains(WatchFlags::WRITABLE) && self.interest.contains(WatchFlags::WRITABLE)
        {
            out = out | WatchFlags::WRITABLE;
        }
        if condition.contains(WatchFlags::ERROR) {
            out = out | WatchFlags::ERROR;
        }
        if condition.contains(WatchFlags::HANGUP) {
            out = out | WatchFlags::HANGUP;
        }
        out
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Watch{{fd={} interest={:?} enabled={}}}",
            self.fd(),
            self.interest,
            self.is_enabled()
        )
    }
}

/// A timer registration consumed by the host event loop. The transport arms
/// one for the server-side authentication deadline.
pub struct Timeout {
    interval_ms: AtomicU32,
    enabled: AtomicBool,
}

impl Timeout {
    pub fn new(interval_ms: u32, enabled: bool) -> Self {
        Timeout {
            interval_ms: AtomicU32::new(interval_ms),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms.load(Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Relaxed);
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Timeout{{interval_ms={} enabled={}}}",
            self.interval_ms(),
            self.is_enabled()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_respects_interest() {
        let watch = Watch::new(3, WatchFlags::READABLE, true);
        let condition =
            WatchFlags::READABLE | WatchFlags::WRITABLE | WatchFlags::HANGUP;
        let sane = watch.sanitize(condition);
        assert!(sane.contains(WatchFlags::READABLE));
        assert!(!sane.contains(WatchFlags::WRITABLE));
        assert!(sane.contains(WatchFlags::HANGUP));
    }

    #[test]
    fn test_invalidate() {
        let watch = Watch::new(3, WatchFlags::READABLE, true);
        assert_eq!(watch.fd(), 3);
        watch.invalidate();
        assert_eq!(watch.fd(), -1);
    }
}
