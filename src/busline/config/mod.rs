mod config;

pub use config::{conf, load_config, Settings};
