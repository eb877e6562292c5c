//! Autolaunch address discovery: find (or start) the session bus and
//! return its address. The opener then connects to it like any other
//! address.

use std::env;
use std::process::Command;

use tracing::{debug, info};

use crate::busline::common::{Error, Result};
use crate::busline::config::conf;

pub const SESSION_ADDRESS_ENV: &str = "BUSLINE_SESSION_ADDRESS";

/// The address of the session bus: the environment variable if set,
/// otherwise the first stdout line of the configured launcher command.
pub(crate) fn autolaunch_address() -> Result<String> {
    if let Ok(address) = env::var(SESSION_ADDRESS_ENV) {
        if !address.is_empty() {
            debug!(%address, "autolaunch address from environment");
            return Ok(address);
        }
    }

    let command = &conf().autolaunch_command;
    if command.is_empty() {
        return Err(Error::did_not_connect(format!(
            "{} is not set and no autolaunch_command is configured",
            SESSION_ADDRESS_ENV
        )));
    }

    info!(%command, "spawning session bus launcher");
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| Error::did_not_connect(format!("could not run launcher: {}", e)))?;
    if !output.status.success() {
        return Err(Error::did_not_connect(format!(
            "launcher exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let address = stdout.lines().next().unwrap_or("").trim().to_string();
    if address.is_empty() {
        return Err(Error::did_not_connect("launcher printed no address"));
    }
    debug!(%address, "autolaunch address from launcher");
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_env_address_wins() {
        env::set_var(SESSION_ADDRESS_ENV, "unix:path=/tmp/test-bus");
        assert_eq!(autolaunch_address().unwrap(), "unix:path=/tmp/test-bus");
        env::remove_var(SESSION_ADDRESS_ENV);
    }

    #[test]
    #[serial_test::serial]
    fn test_no_source_is_did_not_connect() {
        env::remove_var(SESSION_ADDRESS_ENV);
        // default settings carry no launcher command
        let err = autolaunch_address().unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::busline::common::ErrorKind::DidNotConnect(_)
        ));
    }
}
