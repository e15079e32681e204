//! Concrete TCP plumbing for the session.

mod channel;

pub use channel::{run, TcpChannel};
