//! Tokeniser for `tag=value\x01` records.
//!
//! One forward pass fires [`FieldHandler::on_field`] per field and
//! [`FieldHandler::on_end`] when the Checksum (10) field closes the frame.
//! `Ok(0)` means the buffer holds no complete frame yet; the caller keeps
//! the bytes and tries again after the next read.

use meridian_common::buf::Span;
use thiserror::Error;

use crate::tags;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("empty tag at offset {0}")]
    EmptyTag(usize),

    #[error("non-digit byte in tag at offset {0}")]
    BadTagByte(usize),

    #[error("frame rejected by handler")]
    Rejected,
}

/// Receives lexed fields. Returning `false` from either callback abandons
/// the frame.
pub trait FieldHandler {
    fn on_field(&mut self, src: &[u8], tag: u32, value: Span) -> bool;

    /// `next_offset` is the first byte past the frame.
    fn on_end(&mut self, next_offset: usize) -> bool;
}

/// Lexes at most one frame from the front of `src`.
///
/// Returns the consumed byte count, `Ok(0)` when the frame is incomplete,
/// or an error for a malformed tag / handler rejection.
pub fn lex(src: &[u8], handler: &mut impl FieldHandler) -> Result<usize, LexError> {
    let mut i = 0;

    loop {
        // Tag: digits up to '='.
        let tag_start = i;
        let mut tag: u32 = 0;
        loop {
            match src.get(i) {
                None => return Ok(0),
                Some(&b'=') => {
                    if i == tag_start {
                        return Err(LexError::EmptyTag(i));
                    }
                    i += 1;
                    break;
                }
                Some(&b) if b.is_ascii_digit() => {
                    tag = tag * 10 + u32::from(b - b'0');
                    i += 1;
                }
                Some(_) => return Err(LexError::BadTagByte(i)),
            }
        }

        // Value: bytes up to SOH.
        let value_start = i;
        loop {
            match src.get(i) {
                None => return Ok(0),
                Some(&tags::SOH) => break,
                Some(_) => i += 1,
            }
        }
        let value = Span::new(value_start, i - value_start);
        i += 1;

        if !handler.on_field(src, tag, value) {
            return Err(LexError::Rejected);
        }
        if tag == tags::CHECKSUM {
            if !handler.on_end(i) {
                return Err(LexError::Rejected);
            }
            return Ok(i);
        }
    }
}
