//! Buffered TCP adapter and single-threaded driver.
//!
//! [`TcpChannel`] implements [`Transport`] over two byte queues; the
//! [`run`] driver owns the actual `tokio::net::TcpStream`, completes
//! pending connects, pumps readable bytes into the channel, flushes queued
//! writes, and fires the session's timers at their deadlines. The session
//! itself stays synchronous and deterministic.

use bytes::{Buf, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::session::Session;
use crate::transport::{Transport, TransportError};
use meridian_common::time::Clock;

/// [`Transport`] implementation backed by driver-managed queues.
#[derive(Debug, Default)]
pub struct TcpChannel {
    inbound: BytesMut,
    outbound: BytesMut,
    pending_connect: Option<String>,
    close_requested: bool,
    connected: bool,
}

impl TcpChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_pending_connect(&mut self) -> Option<String> {
        self.pending_connect.take()
    }

    fn take_close_request(&mut self) -> bool {
        std::mem::take(&mut self.close_requested)
    }

    fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }
}

impl Transport for TcpChannel {
    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.pending_connect = Some(address.to_string());
        self.close_requested = false;
        Ok(())
    }

    fn close(&mut self) {
        self.close_requested = true;
        self.connected = false;
        self.inbound.clear();
        self.outbound.clear();
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.inbound.len().min(dst.len());
        dst[..n].copy_from_slice(&self.inbound[..n]);
        self.inbound.advance(n);
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.outbound.extend_from_slice(src);
        Ok(src.len())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_handshake_complete(&self) -> bool {
        // Plain TCP: the connection is the handshake.
        self.connected
    }
}

/// Drives one session until it goes idle with nothing scheduled.
///
/// Runs on a single task: connect completion, readable events and timer
/// deadlines are serialized, so every session callback sees a consistent
/// world.
pub async fn run<C: Clock>(session: &mut Session<TcpChannel, C>) -> std::io::Result<()> {
    let mut stream: Option<TcpStream> = None;

    loop {
        // Complete a requested connect.
        if let Some(address) = session.transport_mut().take_pending_connect() {
            debug!(%address, "opening TCP connection");
            match TcpStream::connect(&address).await {
                Ok(s) => {
                    s.set_nodelay(true)?;
                    stream = Some(s);
                    session.transport_mut().connected = true;
                    session.transport_connected();
                    session.transport_handshake_complete();
                }
                Err(e) => {
                    warn!(%address, error = %e, "TCP connect failed");
                    session.transport_failed(&format!("connect failed: {e}"));
                }
            }
        }

        // Honour a close from inside the session.
        if session.transport_mut().take_close_request() {
            stream = None;
        }

        // Flush queued outbound bytes.
        let mut drop_stream = false;
        if let Some(s) = &mut stream {
            while !session.transport().outbound.is_empty() {
                let chunk: Vec<u8> = session.transport().outbound.to_vec();
                match s.write_all(&chunk).await {
                    Ok(()) => {
                        let n = chunk.len();
                        session.transport_mut().outbound.advance(n);
                    }
                    Err(e) => {
                        session.transport_failed(&format!("write failed: {e}"));
                        drop_stream = true;
                        break;
                    }
                }
            }
        }
        if session.transport_mut().take_close_request() || drop_stream {
            stream = None;
        }
        if session.transport().pending_connect.is_some() {
            continue;
        }

        // Sleep until the next timer unless the socket wakes us first.
        let deadline = session.next_deadline();
        let delay = deadline.map(|d| {
            Duration::from_nanos(d.saturating_sub(session.clock().mono_nanos()))
        });

        let mut drop_stream = false;
        match (&mut stream, delay) {
            (None, None) => return Ok(()),
            (None, Some(delay)) => {
                sleep(delay).await;
                session.poll();
            }
            (Some(s), delay) => {
                let readable = s.readable();
                let woke_readable = match delay {
                    Some(delay) => tokio::select! {
                        r = readable => { r?; true }
                        () = sleep(delay) => false,
                    },
                    None => {
                        readable.await?;
                        true
                    }
                };
                if woke_readable {
                    let mut scratch = [0u8; 4096];
                    match s.try_read(&mut scratch) {
                        Ok(0) => {
                            session.transport_failed("connection closed by peer");
                            drop_stream = true;
                        }
                        Ok(n) => {
                            session.transport_mut().push_inbound(&scratch[..n]);
                            session.transport_readable();
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            session.transport_failed(&format!("read failed: {e}"));
                            drop_stream = true;
                        }
                    }
                } else {
                    session.poll();
                }
            }
        }
        if drop_stream {
            stream = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FixConfig, FixVersion};
    use crate::tags;
    use crate::testing::{field_value, split_frames};
    use crate::writer::FixWriter;
    use meridian_common::time::SystemClock;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config() -> FixConfig {
        FixConfig {
            sender_comp_id: "US".into(),
            target_comp_id: "EXCH".into(),
            heartbeat_interval_seconds: 1,
            ..FixConfig::default()
        }
    }

    async fn read_one_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut scratch = [0u8; 1024];
        loop {
            let n = stream.read(&mut scratch).await.unwrap();
            assert!(n > 0, "peer closed while waiting for a frame");
            buf.extend_from_slice(&scratch[..n]);
            let frames = split_frames(&buf);
            if !frames.is_empty() {
                return frames[0].clone();
            }
        }
    }

    #[tokio::test]
    async fn logon_handshake_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        // Counterparty: accept, expect Logon, ack it, then logout.
        let server = tokio::spawn(async move {
            let (mut stream, _peer) = listener.accept().await.unwrap();
            let logon = read_one_frame(&mut stream).await;
            assert_eq!(field_value(&logon, tags::MSG_TYPE).unwrap(), b"A");

            let mut writer = FixWriter::new(FixVersion::Fix42, "EXCH", "US");
            writer.start(b"A", 1, 0);
            writer.put_enum(tags::ENCRYPT_METHOD, b"0");
            writer.put_integer(tags::HEART_BT_INT, 1);
            let ack = writer.send(<[u8]>::to_vec);
            stream.write_all(&ack).await.unwrap();

            let mut writer = FixWriter::new(FixVersion::Fix42, "EXCH", "US");
            writer.start(b"5", 2, 0);
            let logout = writer.send(<[u8]>::to_vec);
            stream.write_all(&logout).await.unwrap();
        });

        let mut session = Session::new(config(), TcpChannel::new(), SystemClock).unwrap();
        session.connect(&address).unwrap();
        // Logout tears the session down; with reconnect disabled the
        // driver then runs out of work and returns.
        tokio::time::timeout(Duration::from_secs(10), run(&mut session))
            .await
            .expect("driver should finish")
            .unwrap();

        assert!(!session.is_logged_on());
        server.await.unwrap();
    }
}
