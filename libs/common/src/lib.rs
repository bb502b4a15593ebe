pub mod event;
pub mod id;

pub use event::{Event, EventType, Message, RelayMessage};
pub use id::PrefixedId;
