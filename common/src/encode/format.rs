//! Output formats for the value-tree encoder.
//!
//! One method per lexical decision; each reports the bytes it wrote. The
//! encoder owns all structural bookkeeping, so a format only ever looks at
//! the current depth.

use bytes::{BufMut, BytesMut};

use super::EncodeError;
use crate::buf;

pub trait ValueFormat {
    fn open_map(&mut self, out: &mut BytesMut, depth: usize) -> Result<usize, EncodeError>;
    fn close_map(&mut self, out: &mut BytesMut, depth: usize) -> Result<usize, EncodeError>;
    fn open_list(&mut self, out: &mut BytesMut, depth: usize) -> Result<usize, EncodeError>;
    fn close_list(&mut self, out: &mut BytesMut, depth: usize) -> Result<usize, EncodeError>;

    /// Written before the first element of a container.
    fn first_element(&mut self, out: &mut BytesMut, depth: usize) -> usize;
    /// Written between elements.
    fn element_separator(&mut self, out: &mut BytesMut, depth: usize) -> usize;
    /// Written between a map key and its value.
    fn key_value_separator(&mut self, out: &mut BytesMut) -> usize;

    fn pre_string(&mut self, out: &mut BytesMut, is_key: bool) -> usize;
    fn post_string(&mut self, out: &mut BytesMut, is_key: bool) -> usize;

    /// String payloads are emitted verbatim; whatever escapes the caller
    /// carries survive a round trip untouched.
    fn put_str(&mut self, out: &mut BytesMut, s: &[u8]) -> usize {
        out.put_slice(s);
        s.len()
    }

    fn put_long(&mut self, out: &mut BytesMut, v: i64) -> usize {
        let mut tmp = [0u8; 24];
        let n = buf::put_long_ascii(&mut tmp, v);
        out.put_slice(&tmp[..n]);
        n
    }

    fn put_double(&mut self, out: &mut BytesMut, v: f64, min_frac: u32, max_frac: u32) -> usize {
        let mut tmp = [0u8; 48];
        let n = buf::put_decimal_ascii(&mut tmp, v, min_frac, max_frac);
        out.put_slice(&tmp[..n]);
        n
    }

    fn put_bool(&mut self, out: &mut BytesMut, v: bool) -> usize {
        let s: &[u8] = if v { b"true" } else { b"false" };
        out.put_slice(s);
        s.len()
    }

    fn put_null(&mut self, out: &mut BytesMut) -> usize {
        out.put_slice(b"null");
        4
    }

    /// Whether the output parses back mechanically (JSON/CSV/query string)
    /// as opposed to being for human eyes (debug/text).
    fn is_machine_readable(&self) -> bool;
}

fn put(out: &mut BytesMut, s: &[u8]) -> usize {
    out.put_slice(s);
    s.len()
}

/// RFC 8259 rendering; strings always quoted.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormat;

impl ValueFormat for JsonFormat {
    fn open_map(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"{"))
    }

    fn close_map(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"}"))
    }

    fn open_list(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"["))
    }

    fn close_list(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"]"))
    }

    fn first_element(&mut self, _out: &mut BytesMut, _depth: usize) -> usize {
        0
    }

    fn element_separator(&mut self, out: &mut BytesMut, _depth: usize) -> usize {
        put(out, b",")
    }

    fn key_value_separator(&mut self, out: &mut BytesMut) -> usize {
        put(out, b":")
    }

    fn pre_string(&mut self, out: &mut BytesMut, _is_key: bool) -> usize {
        put(out, b"\"")
    }

    fn post_string(&mut self, out: &mut BytesMut, _is_key: bool) -> usize {
        put(out, b"\"")
    }

    fn is_machine_readable(&self) -> bool {
        true
    }
}

/// A single outer list, comma-joined, newline-terminated. Any nested
/// container is unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvFormat;

impl ValueFormat for CsvFormat {
    fn open_map(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Err(EncodeError::UnsupportedNesting("CSV"))
    }

    fn close_map(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Err(EncodeError::UnsupportedNesting("CSV"))
    }

    fn open_list(&mut self, _out: &mut BytesMut, depth: usize) -> Result<usize, EncodeError> {
        if depth > 0 {
            return Err(EncodeError::UnsupportedNesting("CSV"));
        }
        Ok(0)
    }

    fn close_list(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"\n"))
    }

    fn first_element(&mut self, _out: &mut BytesMut, _depth: usize) -> usize {
        0
    }

    fn element_separator(&mut self, out: &mut BytesMut, _depth: usize) -> usize {
        put(out, b",")
    }

    fn key_value_separator(&mut self, out: &mut BytesMut) -> usize {
        put(out, b",")
    }

    fn pre_string(&mut self, _out: &mut BytesMut, _is_key: bool) -> usize {
        0
    }

    fn post_string(&mut self, _out: &mut BytesMut, _is_key: bool) -> usize {
        0
    }

    fn is_machine_readable(&self) -> bool {
        true
    }
}

/// A single outer list whose elements join with `&`.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryStringFormat;

impl ValueFormat for QueryStringFormat {
    fn open_map(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Err(EncodeError::UnsupportedNesting("query string"))
    }

    fn close_map(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Err(EncodeError::UnsupportedNesting("query string"))
    }

    fn open_list(&mut self, _out: &mut BytesMut, depth: usize) -> Result<usize, EncodeError> {
        if depth > 0 {
            return Err(EncodeError::UnsupportedNesting("query string"));
        }
        Ok(0)
    }

    fn close_list(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(0)
    }

    fn first_element(&mut self, _out: &mut BytesMut, _depth: usize) -> usize {
        0
    }

    fn element_separator(&mut self, out: &mut BytesMut, _depth: usize) -> usize {
        put(out, b"&")
    }

    fn key_value_separator(&mut self, out: &mut BytesMut) -> usize {
        put(out, b"=")
    }

    fn pre_string(&mut self, _out: &mut BytesMut, _is_key: bool) -> usize {
        0
    }

    fn post_string(&mut self, _out: &mut BytesMut, _is_key: bool) -> usize {
        0
    }

    fn is_machine_readable(&self) -> bool {
        true
    }
}

/// `{k=v, …}` maps and `[v, …]` lists with `'quoted'` string values.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugFormat;

impl ValueFormat for DebugFormat {
    fn open_map(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"{"))
    }

    fn close_map(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"}"))
    }

    fn open_list(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"["))
    }

    fn close_list(&mut self, out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(put(out, b"]"))
    }

    fn first_element(&mut self, _out: &mut BytesMut, _depth: usize) -> usize {
        0
    }

    fn element_separator(&mut self, out: &mut BytesMut, _depth: usize) -> usize {
        put(out, b", ")
    }

    fn key_value_separator(&mut self, out: &mut BytesMut) -> usize {
        put(out, b"=")
    }

    fn pre_string(&mut self, out: &mut BytesMut, is_key: bool) -> usize {
        if is_key {
            0
        } else {
            put(out, b"'")
        }
    }

    fn post_string(&mut self, out: &mut BytesMut, is_key: bool) -> usize {
        if is_key {
            0
        } else {
            put(out, b"'")
        }
    }

    fn is_machine_readable(&self) -> bool {
        false
    }
}

/// Indented, newline-separated rendering for humans.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormat;

impl TextFormat {
    fn newline_indent(out: &mut BytesMut, depth: usize) -> usize {
        out.put_slice(b"\n");
        for _ in 0..depth.saturating_sub(1) {
            out.put_slice(b"  ");
        }
        1 + 2 * depth.saturating_sub(1)
    }
}

impl ValueFormat for TextFormat {
    fn open_map(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(0)
    }

    fn close_map(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(0)
    }

    fn open_list(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(0)
    }

    fn close_list(&mut self, _out: &mut BytesMut, _depth: usize) -> Result<usize, EncodeError> {
        Ok(0)
    }

    fn first_element(&mut self, out: &mut BytesMut, depth: usize) -> usize {
        if depth <= 1 && out.is_empty() {
            return 0;
        }
        Self::newline_indent(out, depth)
    }

    fn element_separator(&mut self, out: &mut BytesMut, depth: usize) -> usize {
        Self::newline_indent(out, depth)
    }

    fn key_value_separator(&mut self, out: &mut BytesMut) -> usize {
        put(out, b": ")
    }

    fn pre_string(&mut self, _out: &mut BytesMut, _is_key: bool) -> usize {
        0
    }

    fn post_string(&mut self, _out: &mut BytesMut, _is_key: bool) -> usize {
        0
    }

    fn is_machine_readable(&self) -> bool {
        false
    }
}
