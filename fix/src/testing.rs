//! Deterministic test doubles for session-level tests.

use std::collections::VecDeque;

use crate::config::FixVersion;
use crate::lexer::{self, FieldHandler};
use crate::transport::{Transport, TransportError};
use crate::writer::FixWriter;
use meridian_common::buf::Span;

/// In-memory [`Transport`] fed by the test and recording every write.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    inbound: VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    pub connect_calls: u32,
    pub close_calls: u32,
    pub last_address: String,
    pub fail_writes: bool,
    connected: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes the session will see on its next read.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.push_back(bytes.to_vec());
    }

    /// Frames written so far, split on checksum trailers.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        split_frames(&self.written)
    }

    /// Drops everything recorded so far.
    pub fn clear_written(&mut self) {
        self.written.clear();
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.connect_calls += 1;
        self.last_address = address.to_string();
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.close_calls += 1;
        self.connected = false;
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize, TransportError> {
        match self.inbound.pop_front() {
            None => Ok(0),
            Some(mut chunk) => {
                let n = chunk.len().min(dst.len());
                dst[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    chunk.drain(..n);
                    self.inbound.push_front(chunk);
                }
                Ok(n)
            }
        }
    }

    fn write(&mut self, src: &[u8]) -> Result<usize, TransportError> {
        if self.fail_writes {
            return Err(TransportError::Closed);
        }
        self.written.extend_from_slice(src);
        Ok(src.len())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_handshake_complete(&self) -> bool {
        self.connected
    }
}

/// Splits a byte stream into whole FIX frames.
pub fn split_frames(mut bytes: &[u8]) -> Vec<Vec<u8>> {
    struct Sink;
    impl FieldHandler for Sink {
        fn on_field(&mut self, _src: &[u8], _tag: u32, _value: Span) -> bool {
            true
        }
        fn on_end(&mut self, _next_offset: usize) -> bool {
            true
        }
    }

    let mut frames = Vec::new();
    while !bytes.is_empty() {
        match lexer::lex(bytes, &mut Sink) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                frames.push(bytes[..n].to_vec());
                bytes = &bytes[n..];
            }
        }
    }
    frames
}

/// Renders a frame with SOH shown as `|`.
pub fn pretty(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|&b| if b == 1 { '|' } else { b as char })
        .collect()
}

/// Builds a frame as the counterparty would send it: its sender is our
/// target and vice versa.
pub fn counterparty_frame(
    version: FixVersion,
    our_sender: &str,
    our_target: &str,
    msg_type: &[u8],
    seq: u64,
    fields: impl FnOnce(&mut FixWriter),
) -> Vec<u8> {
    let mut writer = FixWriter::new(version, our_target, our_sender);
    writer.start(msg_type, seq, 0);
    fields(&mut writer);
    writer.send(<[u8]>::to_vec)
}

/// Finds the value of `tag` in a raw frame, if present.
pub fn field_value(frame: &[u8], tag: u32) -> Option<Vec<u8>> {
    struct Finder {
        tag: u32,
        found: Option<Vec<u8>>,
    }
    impl FieldHandler for Finder {
        fn on_field(&mut self, src: &[u8], tag: u32, value: Span) -> bool {
            if tag == self.tag && self.found.is_none() {
                self.found = Some(value.slice(src).to_vec());
            }
            true
        }
        fn on_end(&mut self, _next_offset: usize) -> bool {
            true
        }
    }
    let mut finder = Finder { tag, found: None };
    let _ = lexer::lex(frame, &mut finder);
    finder.found
}
