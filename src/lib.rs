pub mod busline;
#[cfg(test)]
mod tests;

pub use crate::busline::*;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install a stdout tracing subscriber for hosts that don't bring their own.
pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");
}
