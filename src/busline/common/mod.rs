mod errors;
pub mod fault;
mod shared;

pub use self::errors::{Error, ErrorKind, Result};
pub use self::shared::{Counted, LifeCount, Shared};
