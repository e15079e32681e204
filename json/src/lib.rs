//! Streaming JSON for the Meridian messaging core.
//!
//! The parser consumes a byte buffer and produces a pooled tree of tagged
//! values without copying string data. It recognises incomplete input and
//! reports exactly how many bytes one root value consumed, so transport
//! layers can accumulate bytes and simply call again.

pub mod parser;
pub mod value;

pub use parser::{reason, JsonParser, ParseResult};
pub use value::{NodeId, ValueArena, ValueKind, ValueRef};
