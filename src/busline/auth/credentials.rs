use std::fmt;

/// Process credentials: pid, uid, gid. A None field is unset, which the wire
/// and the OS report with -1 sentinels. Peer credentials come from socket
/// ancillary data on unix sockets and stay unset over tcp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Credentials {
    pub const fn unset() -> Self {
        Credentials {
            pid: None,
            uid: None,
            gid: None,
        }
    }

    /// The credentials of this process.
    pub fn from_current_process() -> Self {
        // Safety: getpid/getuid/getgid cannot fail
        unsafe {
            Credentials {
                pid: Some(libc::getpid() as u32),
                uid: Some(libc::getuid() as u32),
                gid: Some(libc::getgid() as u32),
            }
        }
    }

    /// True if other authenticated as the same user we are running as.
    /// An unset uid on either side never matches.
    pub fn same_user(&self, other: &Credentials) -> bool {
        match (self.uid, other.uid) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn field(v: Option<u32>) -> i64 {
            v.map(|v| v as i64).unwrap_or(-1)
        }
        write!(
            f,
            "pid={} uid={} gid={}",
            field(self.pid),
            field(self.uid),
            field(self.gid)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_has_ids() {
        let creds = Credentials::from_current_process();
        assert!(creds.pid.is_some());
        assert!(creds.uid.is_some());
        assert!(creds.gid.is_some());
    }

    #[test]
    fn test_same_user() {
        let ours = Credentials::from_current_process();
        assert!(ours.same_user(&ours));
        assert!(!ours.same_user(&Credentials::unset()));
        assert!(!Credentials::unset().same_user(&ours));
    }
}
