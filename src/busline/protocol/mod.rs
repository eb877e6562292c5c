mod loader;
mod message;

pub use loader::{acquire_buffer, release_buffer, MessageLoader};
pub use message::{Message, MessageBuilder, Tag, HEADER_LEN};
