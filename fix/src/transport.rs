//! Byte-stream channel contract required by the session.
//!
//! The session is edge-triggered: whatever drives the transport calls the
//! session's `transport_*` entry points, and the session drains `read`
//! until it returns zero. `connect` only initiates; readiness arrives
//! through the driver as `transport_connected` / `transport_handshake_complete`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Transport {
    /// Initiates a connection. Completion is reported by the driver.
    fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    fn close(&mut self);

    /// Moves available bytes into `dst`; `Ok(0)` when nothing is pending.
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, TransportError>;

    /// Queues or writes `src`, returning the bytes accepted.
    fn write(&mut self, src: &[u8]) -> Result<usize, TransportError>;

    fn is_connected(&self) -> bool;

    fn is_handshake_complete(&self) -> bool;
}
