//! Shared foundations of the Meridian messaging core: raw byte-buffer
//! helpers, object pooling, the pluggable value-tree encoder, the message
//! log facade, and clock injection.

pub mod buf;
pub mod encode;
pub mod log;
pub mod pool;
pub mod time;

// Re-export commonly used types
pub use encode::{Encodable, EncodeError, Encoder, ValueFormat};
pub use pool::{Pool, Reset};
pub use time::{Clock, ManualClock, SystemClock};
