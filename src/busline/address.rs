use std::fmt;
use std::fmt::Write;

use crate::busline::common::{Error, Result};

/// One parsed entry of a bus address: a connect method plus its key/value
/// parameters, in the order they appeared. Addresses are a ;-separated list
/// of entries, each `method:key=value,key=value`. Values use %XX escaping
/// for bytes outside the optionally-escaped set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    method: String,
    params: Vec<(String, String)>,
}

impl AddressEntry {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Look up a parameter value by key. Keys are unique per entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for AddressEntry {
    /// Renders the canonical form of this entry, escaping values as needed.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.method)?;
        f.write_char(':')?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            f.write_str(k)?;
            f.write_char('=')?;
            f.write_str(&escape_value(v))?;
        }
        Ok(())
    }
}

// The set of bytes that may appear unescaped in a parameter value.
fn is_optionally_escaped(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'\\' | b'.' | b'*')
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if is_optionally_escaped(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

fn unescape_value(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::bad_address("truncated %XX escape in address"))?;
            let decoded = hex::decode(escaped)
                .map_err(|_| Error::bad_address("invalid %XX escape in address"))?;
            out.push(decoded[0]);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::bad_address("address value is not valid utf-8"))
}

/// Parse a bus address into its ordered list of entries.
pub fn parse_address(address: &str) -> Result<Vec<AddressEntry>> {
    if address.is_empty() {
        return Err(Error::bad_address("address is empty"));
    }

    let mut entries = Vec::new();
    for part in address.split(';') {
        if part.is_empty() {
            continue; // trailing ; is allowed
        }
        entries.push(parse_entry(part)?);
    }

    if entries.is_empty() {
        return Err(Error::bad_address("address contains no entries"));
    }
    Ok(entries)
}

fn parse_entry(part: &str) -> Result<AddressEntry> {
    let (method, rest) = part
        .split_once(':')
        .ok_or_else(|| Error::bad_address(format!("entry '{}' has no method", part)))?;
    if method.is_empty() {
        return Err(Error::bad_address(format!("entry '{}' has an empty method", part)));
    }

    let mut params: Vec<(String, String)> = Vec::new();
    for pair in rest.split(',') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::bad_address(format!("parameter '{}' is missing '='", pair))
        })?;
        if key.is_empty() || value.is_empty() {
            return Err(Error::bad_address(format!(
                "parameter '{}' has an empty key or value",
                pair
            )));
        }
        if params.iter().any(|(k, _)| k == key) {
            return Err(Error::bad_address(format!("duplicate parameter '{}'", key)));
        }
        params.push((key.to_string(), unescape_value(value)?));
    }

    Ok(AddressEntry {
        method: method.to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_entry() {
        let entries = parse_address("unix:path=/tmp/bus-socket").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method(), "unix");
        assert_eq!(entries[0].get("path"), Some("/tmp/bus-socket"));
        assert_eq!(entries[0].get("missing"), None);
    }

    #[test]
    fn test_parse_multiple_entries() {
        let entries =
            parse_address("debug-pipe:name=foo;tcp:host=127.0.0.1,port=0").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].method(), "debug-pipe");
        assert_eq!(entries[1].method(), "tcp");
        assert_eq!(entries[1].get("host"), Some("127.0.0.1"));
        assert_eq!(entries[1].get("port"), Some("0"));
    }

    #[test]
    fn test_escaping_roundtrip() {
        let entries = parse_address("unix:path=/tmp/with%20space").unwrap();
        assert_eq!(entries[0].get("path"), Some("/tmp/with space"));
        assert_eq!(entries[0].to_string(), "unix:path=/tmp/with%20space");
    }

    #[test]
    fn test_bad_addresses() {
        assert!(parse_address("").is_err());
        assert!(parse_address("no-colon-here").is_err());
        assert!(parse_address("unix:path").is_err());
        assert!(parse_address("unix:path=/a,path=/b").is_err());
        assert!(parse_address("unix:path=/tmp/%zz").is_err());
    }

    #[test]
    fn test_guid_parameter() {
        let entries = parse_address("tcp:host=localhost,port=1234,guid=deadbeef").unwrap();
        assert_eq!(entries[0].get("guid"), Some("deadbeef"));
    }
}
