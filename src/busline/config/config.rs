use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;
use tracing::{debug, info, info_span};

use crate::busline::common::{Error, Result};

pub const ONE_MEGABYTE: usize = 1024 * 1024;

#[derive(Deserialize)]
pub struct Settings {
    /// recv_buffer_size is the size reserved in the loader buffer ahead of each read from the socket
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// max_message_size is the largest single message frame the loader will accept before declaring the stream corrupt
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// max_live_messages_size bounds the total bytes of messages queued on a connection but not yet consumed.
    /// Crossing it disables the transport's read watch until the application drains messages.
    #[serde(default = "default_max_live_messages_size")]
    pub max_live_messages_size: usize,
    /// auth_timeout_milliseconds disconnects server transports that have not completed the handshake in time. 0 is disabled.
    #[serde(default = "default_auth_timeout_milliseconds")]
    pub auth_timeout_milliseconds: u32,
    /// auth_mechanisms restricts the SASL mechanisms offered/accepted. Empty means all built-in mechanisms.
    #[serde(default)]
    pub auth_mechanisms: Vec<String>,
    /// autolaunch_command is spawned by the autolaunch opener when BUSLINE_SESSION_ADDRESS is not set.
    /// Its first line of stdout must be a bus address.
    #[serde(default)]
    pub autolaunch_command: String,
}

fn default_recv_buffer_size() -> usize {
    4096
}
fn default_max_message_size() -> usize {
    32 * ONE_MEGABYTE
}
fn default_max_live_messages_size() -> usize {
    63 * ONE_MEGABYTE
}
const fn default_auth_timeout_milliseconds() -> u32 {
    30000
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            recv_buffer_size: default_recv_buffer_size(),
            max_message_size: default_max_message_size(),
            max_live_messages_size: default_max_live_messages_size(),
            auth_timeout_milliseconds: default_auth_timeout_milliseconds(),
            auth_mechanisms: Vec::new(),
            autolaunch_command: String::new(),
        }
    }
}

impl Settings {
    fn validate(mut self) -> Result<Self> {
        if self.recv_buffer_size < 256 {
            self.recv_buffer_size = default_recv_buffer_size();
        }
        if self.max_message_size > 128 * ONE_MEGABYTE {
            return Err(Error::new("max_message_size cannot be > 128MB"));
        }
        Ok(self)
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Returns the process-wide settings. If load_config was never called
/// (as in most tests) this is the built-in defaults.
pub fn conf() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

/// Load configuration settings from busline.yaml, searching the current
/// directory and its parents. May be called at most once, before the first
/// use of conf().
pub fn load_config(config_name: &str) -> Result<&'static Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy().into_owned(), "found config file");
    let raw_yaml = std::fs::read_to_string(&config_path)?;

    let settings: Settings = serde_yaml::from_str(&raw_yaml)?;
    let settings = settings.validate()?;
    if SETTINGS.set(settings).is_err() {
        return Err(Error::new("config already loaded"));
    }
    Ok(conf())
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    // Check the current directory or any of its parents for config_name
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            if let Some(parent) = dir.parent() {
                dir = parent;
            } else {
                break;
            }
        }
    }

    Err(Error::new(format!("could not find {}", config_name)))
}
