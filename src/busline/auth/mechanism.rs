use strum::Display;

use crate::busline::auth::Credentials;

/// The SASL mechanisms this implementation knows. EXTERNAL proves identity
/// with out-of-band socket credentials; ANONYMOUS authenticates with no
/// identity at all (the transport's identity check decides what that's
/// worth).
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    #[strum(serialize = "EXTERNAL")]
    External,
    #[strum(serialize = "ANONYMOUS")]
    Anonymous,
}

/// Server-side outcome of checking a mechanism's initial response.
pub enum Verdict {
    /// Authentication succeeded with this identity.
    Authorized(Credentials),
    Rejected,
}

impl Mechanism {
    /// All mechanisms, in the order a client tries them.
    pub fn all() -> &'static [Mechanism] {
        &[Mechanism::External, Mechanism::Anonymous]
    }

    pub fn from_name(name: &str) -> Option<Mechanism> {
        match name {
            "EXTERNAL" => Some(Mechanism::External),
            "ANONYMOUS" => Some(Mechanism::Anonymous),
            _ => None,
        }
    }

    /// The initial response a client sends with its AUTH command, already
    /// hex-encoded per the auth line grammar.
    pub fn client_initial_response(&self, ours: &Credentials) -> String {
        match self {
            Mechanism::External => {
                // Claim our own uid, as a decimal string
                let uid = ours.uid.map(|uid| uid.to_string()).unwrap_or_default();
                hex::encode(uid.as_bytes())
            }
            Mechanism::Anonymous => String::new(),
        }
    }

    /// Check a client's initial response against the peer credentials read
    /// from the socket, and produce the identity this peer authenticated as.
    pub fn verify_initial_response(&self, hex_response: &str, peer: &Credentials) -> Verdict {
        match self {
            Mechanism::External => {
                let claimed_uid = match decode_claimed_uid(hex_response) {
                    Ok(uid) => uid,
                    Err(()) => return Verdict::Rejected,
                };
                // An empty claim means "whoever the socket says I am"
                let claimed_uid = claimed_uid.or(peer.uid);
                match (claimed_uid, peer.uid) {
                    (Some(claimed), Some(actual)) if claimed == actual => {
                        Verdict::Authorized(Credentials {
                            uid: Some(claimed),
                            pid: peer.pid,
                            gid: peer.gid,
                        })
                    }
                    _ => Verdict::Rejected,
                }
            }
            Mechanism::Anonymous => Verdict::Authorized(Credentials::unset()),
        }
    }
}

fn decode_claimed_uid(hex_response: &str) -> std::result::Result<Option<u32>, ()> {
    if hex_response.is_empty() {
        return Ok(None);
    }
    let raw = hex::decode(hex_response).map_err(|_| ())?;
    let s = std::str::from_utf8(&raw).map_err(|_| ())?;
    s.parse::<u32>().map(Some).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_roundtrip() {
        let ours = Credentials {
            pid: Some(100),
            uid: Some(1000),
            gid: Some(1000),
        };
        let response = Mechanism::External.client_initial_response(&ours);
        assert_eq!(response, hex::encode(b"1000"));

        match Mechanism::External.verify_initial_response(&response, &ours) {
            Verdict::Authorized(identity) => {
                assert_eq!(identity.uid, Some(1000));
                assert_eq!(identity.pid, Some(100));
            }
            Verdict::Rejected => panic!("expected authorization"),
        }
    }

    #[test]
    fn test_external_uid_mismatch() {
        let peer = Credentials {
            pid: Some(100),
            uid: Some(1000),
            gid: Some(1000),
        };
        let claim = hex::encode(b"0"); // claims root
        assert!(matches!(
            Mechanism::External.verify_initial_response(&claim, &peer),
            Verdict::Rejected
        ));
    }

    #[test]
    fn test_external_empty_claim_uses_socket_credentials() {
        let peer = Credentials {
            pid: Some(100),
            uid: Some(1000),
            gid: Some(1000),
        };
        assert!(matches!(
            Mechanism::External.verify_initial_response("", &peer),
            Verdict::Authorized(identity) if identity.uid == Some(1000)
        ));
    }

    #[test]
    fn test_external_no_socket_credentials() {
        // Over tcp there are no peer credentials, so EXTERNAL cannot succeed
        assert!(matches!(
            Mechanism::External.verify_initial_response("", &Credentials::unset()),
            Verdict::Rejected
        ));
    }

    #[test]
    fn test_anonymous() {
        assert!(matches!(
            Mechanism::Anonymous.verify_initial_response("", &Credentials::unset()),
            Verdict::Authorized(identity) if identity.uid.is_none()
        ));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Mechanism::from_name("EXTERNAL"), Some(Mechanism::External));
        assert_eq!(Mechanism::from_name("KERBEROS_V4"), None);
    }
}
