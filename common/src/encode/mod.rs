//! Single-pass value-tree encoding into a byte buffer.
//!
//! One [`Encoder`] drives a pluggable [`ValueFormat`] to emit maps, lists
//! and scalars. The encoder owns all structural rules: key-before-value in
//! maps, nesting depth, and separator placement. Misuse is a recoverable
//! [`EncodeError`], never a panic, and never leaves the encoder unusable.

mod format;

pub use format::{CsvFormat, DebugFormat, JsonFormat, QueryStringFormat, TextFormat, ValueFormat};

use bytes::BytesMut;
use thiserror::Error;

/// Hard cap on container nesting.
pub const MAX_DEPTH: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("expected a string key")]
    ExpectedKey,

    #[error("nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("no open container")]
    NoOpenContainer,

    #[error("close does not match the open container")]
    MismatchedClose,

    #[error("map entry has a key but no value")]
    DanglingKey,

    #[error("document still has open containers")]
    UnfinishedDocument,

    #[error("{0} does not support nested containers")]
    UnsupportedNesting(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ContainerKind {
    #[default]
    List,
    Map,
}

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    kind: ContainerKind,
    expecting_key: bool,
    count: usize,
}

/// Fires after a value at its level completes; receives total bytes written.
pub type FinishLevelFn = Box<dyn FnMut(usize)>;

/// Writes one value tree into the tail of `out`.
pub struct Encoder<'a, F: ValueFormat> {
    out: &'a mut BytesMut,
    format: F,
    start: usize,
    levels: [Level; MAX_DEPTH],
    depth: usize,
    finish_listeners: Vec<Option<FinishLevelFn>>,
}

impl<'a, F: ValueFormat + std::fmt::Debug> std::fmt::Debug for Encoder<'a, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("out", &self.out)
            .field("format", &self.format)
            .field("start", &self.start)
            .field("levels", &self.levels)
            .field("depth", &self.depth)
            .finish()
    }
}

impl<'a, F: ValueFormat> Encoder<'a, F> {
    /// Starts encoding at the current end of `out`.
    pub fn new(out: &'a mut BytesMut, format: F) -> Self {
        let start = out.len();
        let mut finish_listeners = Vec::with_capacity(MAX_DEPTH);
        finish_listeners.resize_with(MAX_DEPTH, || None);
        Self {
            out,
            format,
            start,
            levels: [Level::default(); MAX_DEPTH],
            depth: 0,
            finish_listeners,
        }
    }

    pub fn is_machine_readable(&self) -> bool {
        self.format.is_machine_readable()
    }

    /// Registers a callback fired after each value at `level` completes.
    pub fn set_finish_level_listener(
        &mut self,
        level: usize,
        listener: FinishLevelFn,
    ) -> Result<(), EncodeError> {
        if level >= MAX_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        self.finish_listeners[level] = Some(listener);
        Ok(())
    }

    pub fn open_map(&mut self) -> Result<&mut Self, EncodeError> {
        self.open(ContainerKind::Map)
    }

    pub fn open_list(&mut self) -> Result<&mut Self, EncodeError> {
        self.open(ContainerKind::List)
    }

    fn open(&mut self, kind: ContainerKind) -> Result<&mut Self, EncodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        let mark = self.out.len();
        self.begin_value()?;
        let opened = match kind {
            ContainerKind::Map => self.format.open_map(self.out, self.depth),
            ContainerKind::List => self.format.open_list(self.out, self.depth),
        };
        if let Err(e) = opened {
            // Roll back any separator written ahead of the rejected open.
            self.out.truncate(mark);
            return Err(e);
        }
        self.levels[self.depth] = Level {
            kind,
            expecting_key: kind == ContainerKind::Map,
            count: 0,
        };
        self.depth += 1;
        Ok(self)
    }

    pub fn close_map(&mut self) -> Result<&mut Self, EncodeError> {
        self.close(ContainerKind::Map)
    }

    pub fn close_list(&mut self) -> Result<&mut Self, EncodeError> {
        self.close(ContainerKind::List)
    }

    fn close(&mut self, kind: ContainerKind) -> Result<&mut Self, EncodeError> {
        if self.depth == 0 {
            return Err(EncodeError::NoOpenContainer);
        }
        let level = self.levels[self.depth - 1];
        if level.kind != kind {
            return Err(EncodeError::MismatchedClose);
        }
        if level.kind == ContainerKind::Map && !level.expecting_key {
            return Err(EncodeError::DanglingKey);
        }
        match kind {
            ContainerKind::Map => self.format.close_map(self.out, self.depth - 1)?,
            ContainerKind::List => self.format.close_list(self.out, self.depth - 1)?,
        };
        self.depth -= 1;
        self.end_value();
        Ok(self)
    }

    /// Writes a string — a map key when one is expected, a value otherwise.
    pub fn string(&mut self, s: impl AsRef<[u8]>) -> Result<&mut Self, EncodeError> {
        let s = s.as_ref();
        if self.at_key_position() {
            let count = self.levels[self.depth - 1].count;
            if count > 0 {
                self.format.element_separator(self.out, self.depth);
            } else {
                self.format.first_element(self.out, self.depth);
            }
            self.format.pre_string(self.out, true);
            self.format.put_str(self.out, s);
            self.format.post_string(self.out, true);
            self.levels[self.depth - 1].expecting_key = false;
            return Ok(self);
        }
        self.begin_value()?;
        self.format.pre_string(self.out, false);
        self.format.put_str(self.out, s);
        self.format.post_string(self.out, false);
        self.end_value();
        Ok(self)
    }

    pub fn long(&mut self, v: i64) -> Result<&mut Self, EncodeError> {
        self.begin_value()?;
        self.format.put_long(self.out, v);
        self.end_value();
        Ok(self)
    }

    pub fn double(&mut self, v: f64) -> Result<&mut Self, EncodeError> {
        self.double_with(v, 0, 9)
    }

    pub fn double_with(
        &mut self,
        v: f64,
        min_frac: u32,
        max_frac: u32,
    ) -> Result<&mut Self, EncodeError> {
        self.begin_value()?;
        self.format.put_double(self.out, v, min_frac, max_frac);
        self.end_value();
        Ok(self)
    }

    pub fn boolean(&mut self, v: bool) -> Result<&mut Self, EncodeError> {
        self.begin_value()?;
        self.format.put_bool(self.out, v);
        self.end_value();
        Ok(self)
    }

    pub fn null(&mut self) -> Result<&mut Self, EncodeError> {
        self.begin_value()?;
        self.format.put_null(self.out);
        self.end_value();
        Ok(self)
    }

    /// Encodes anything implementing [`Encodable`].
    pub fn object<T: Encodable + ?Sized>(&mut self, value: &T) -> Result<&mut Self, EncodeError> {
        value.encode(self)?;
        Ok(self)
    }

    /// Fallback for types with no structural rendering: their `Display`
    /// output is written as a string.
    pub fn display<T: std::fmt::Display>(&mut self, value: &T) -> Result<&mut Self, EncodeError> {
        let rendered = value.to_string();
        self.string(rendered.as_bytes())
    }

    /// Ends the document and returns the number of bytes written.
    pub fn finish(&mut self) -> Result<usize, EncodeError> {
        if self.depth != 0 {
            return Err(EncodeError::UnfinishedDocument);
        }
        Ok(self.out.len() - self.start)
    }

    /// Discards everything written since construction.
    pub fn rewind(&mut self) {
        self.out.truncate(self.start);
        self.depth = 0;
        self.levels = [Level::default(); MAX_DEPTH];
    }

    fn at_key_position(&self) -> bool {
        self.depth > 0 && {
            let level = &self.levels[self.depth - 1];
            level.kind == ContainerKind::Map && level.expecting_key
        }
    }

    fn begin_value(&mut self) -> Result<(), EncodeError> {
        if self.depth == 0 {
            return Ok(());
        }
        let level = self.levels[self.depth - 1];
        match level.kind {
            ContainerKind::List => {
                if level.count > 0 {
                    self.format.element_separator(self.out, self.depth);
                } else {
                    self.format.first_element(self.out, self.depth);
                }
                Ok(())
            }
            ContainerKind::Map if !level.expecting_key => {
                self.format.key_value_separator(self.out);
                Ok(())
            }
            ContainerKind::Map => Err(EncodeError::ExpectedKey),
        }
    }

    fn end_value(&mut self) {
        if self.depth > 0 {
            let level = &mut self.levels[self.depth - 1];
            level.count += 1;
            if level.kind == ContainerKind::Map {
                level.expecting_key = true;
            }
        }
        let written = self.out.len() - self.start;
        if let Some(listener) = &mut self.finish_listeners[self.depth] {
            listener(written);
        }
    }
}

/// A value that knows how to render itself through any [`ValueFormat`].
pub trait Encodable {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError>;
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        (**self).encode(enc)
    }
}

impl Encodable for i64 {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.long(*self).map(|_| ())
    }
}

impl Encodable for i32 {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.long(i64::from(*self)).map(|_| ())
    }
}

impl Encodable for u32 {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.long(i64::from(*self)).map(|_| ())
    }
}

impl Encodable for f64 {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.double(*self).map(|_| ())
    }
}

impl Encodable for bool {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.boolean(*self).map(|_| ())
    }
}

impl Encodable for str {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.string(self).map(|_| ())
    }
}

impl Encodable for String {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.string(self).map(|_| ())
    }
}

impl<T: Encodable> Encodable for [T] {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        enc.open_list()?;
        for item in self {
            enc.object(item)?;
        }
        enc.close_list().map(|_| ())
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        self.as_slice().encode(enc)
    }
}

impl<T: Encodable> Encodable for Option<T> {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        match self {
            Some(v) => v.encode(enc),
            None => enc.null().map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn encode_with<F: ValueFormat>(
        format: F,
        build: impl FnOnce(&mut Encoder<'_, F>) -> Result<(), EncodeError>,
    ) -> String {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, format);
        build(&mut enc).unwrap();
        let n = enc.finish().unwrap();
        assert_eq!(n, out.len());
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn json_mixed_map() {
        let text = encode_with(JsonFormat, |enc| {
            enc.open_map()?
                .string("a")?
                .long(123)?
                .string("b")?
                .string("abc")?
                .string("c")?
                .boolean(true)?
                .string("d")?
                .null()?
                .string("f")?
                .double(456.789)?
                .close_map()?;
            Ok(())
        });
        assert_eq!(text, r#"{"a":123,"b":"abc","c":true,"d":null,"f":456.789}"#);
    }

    #[test]
    fn json_nested_containers() {
        let text = encode_with(JsonFormat, |enc| {
            enc.open_map()?
                .string("xs")?
                .open_list()?
                .long(1)?
                .long(2)?
                .close_list()?
                .string("m")?
                .open_map()?
                .string("k")?
                .string("v")?
                .close_map()?
                .close_map()?;
            Ok(())
        });
        assert_eq!(text, r#"{"xs":[1,2],"m":{"k":"v"}}"#);
    }

    #[test]
    fn csv_outer_list() {
        let text = encode_with(CsvFormat, |enc| {
            enc.open_list()?
                .string("a")?
                .long(1)?
                .boolean(true)?
                .close_list()?;
            Ok(())
        });
        assert_eq!(text, "a,1,true\n");
    }

    #[test]
    fn csv_rejects_nesting_and_recovers() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, CsvFormat);
        enc.open_list().unwrap().string("a").unwrap();
        assert_eq!(
            enc.open_list().unwrap_err(),
            EncodeError::UnsupportedNesting("CSV")
        );
        // Still usable after the error.
        enc.long(2).unwrap();
        enc.close_list().unwrap();
        assert_eq!(&out[..], b"a,2\n");
    }

    #[test]
    fn query_string_join() {
        let text = encode_with(QueryStringFormat, |enc| {
            enc.open_list()?
                .string("symbol=MSFT")?
                .string("depth=5")?
                .close_list()?;
            Ok(())
        });
        assert_eq!(text, "symbol=MSFT&depth=5");
    }

    #[test]
    fn debug_rendering() {
        let text = encode_with(DebugFormat, |enc| {
            enc.open_map()?
                .string("a")?
                .long(1)?
                .string("b")?
                .string("x")?
                .string("c")?
                .open_list()?
                .long(1)?
                .long(2)?
                .close_list()?
                .close_map()?;
            Ok(())
        });
        assert_eq!(text, "{a=1, b='x', c=[1, 2]}");
    }

    #[test]
    fn text_rendering() {
        let text = encode_with(TextFormat, |enc| {
            enc.open_map()?
                .string("a")?
                .long(1)?
                .string("b")?
                .open_list()?
                .string("x")?
                .string("y")?
                .close_list()?
                .close_map()?;
            Ok(())
        });
        assert_eq!(text, "a: 1\nb: \n  x\n  y");
    }

    #[test]
    fn non_string_key_is_an_error() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, JsonFormat);
        enc.open_map().unwrap();
        assert_eq!(enc.long(1).unwrap_err(), EncodeError::ExpectedKey);
        assert_eq!(enc.boolean(true).unwrap_err(), EncodeError::ExpectedKey);
        assert_eq!(enc.open_list().unwrap_err(), EncodeError::ExpectedKey);
        // Recoverable: a proper key still works.
        enc.string("k").unwrap().long(1).unwrap();
        enc.close_map().unwrap();
        assert_eq!(&out[..], br#"{"k":1}"#);
    }

    #[test]
    fn depth_is_capped() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, JsonFormat);
        for _ in 0..MAX_DEPTH {
            enc.open_list().unwrap();
        }
        assert_eq!(enc.open_list().unwrap_err(), EncodeError::TooDeep);
    }

    #[test]
    fn finish_requires_closed_containers() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, JsonFormat);
        enc.open_list().unwrap();
        assert_eq!(enc.finish().unwrap_err(), EncodeError::UnfinishedDocument);
        enc.close_list().unwrap();
        assert_eq!(enc.finish().unwrap(), 2);
    }

    #[test]
    fn mismatched_close_detected() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, JsonFormat);
        enc.open_list().unwrap();
        assert_eq!(enc.close_map().unwrap_err(), EncodeError::MismatchedClose);
        let mut enc = Encoder::new(&mut out, JsonFormat);
        assert_eq!(enc.close_list().unwrap_err(), EncodeError::NoOpenContainer);
    }

    #[test]
    fn dangling_key_detected() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, JsonFormat);
        enc.open_map().unwrap().string("k").unwrap();
        assert_eq!(enc.close_map().unwrap_err(), EncodeError::DanglingKey);
    }

    #[test]
    fn rewind_discards_output() {
        let mut out = BytesMut::from(&b"prefix"[..]);
        let mut enc = Encoder::new(&mut out, JsonFormat);
        enc.open_list().unwrap().long(1).unwrap();
        enc.rewind();
        assert_eq!(enc.finish().unwrap(), 0);
        assert_eq!(&out[..], b"prefix");
    }

    #[test]
    fn finish_level_listener_fires_per_value() {
        let mut out = BytesMut::new();
        let mut enc = Encoder::new(&mut out, JsonFormat);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);
        enc.set_finish_level_listener(1, Box::new(move |n| sink.borrow_mut().push(n)))
            .unwrap();
        enc.open_list()
            .unwrap()
            .long(1)
            .unwrap()
            .long(22)
            .unwrap()
            .close_list()
            .unwrap();
        // "[1" then "[1,22"
        assert_eq!(*fired.borrow(), vec![2, 5]);
    }

    #[test]
    fn encodes_objects() {
        let text = encode_with(JsonFormat, |enc| {
            enc.object(&vec![1i64, 2, 3]).map(|_| ())
        });
        assert_eq!(text, "[1,2,3]");

        let text = encode_with(JsonFormat, |enc| {
            enc.open_list()?
                .object("s")?
                .object(&Some(5i64))?
                .object(&None::<i64>)?
                .close_list()?;
            Ok(())
        });
        assert_eq!(text, r#"["s",5,null]"#);
    }

    #[test]
    fn display_fallback() {
        let addr: std::net::Ipv4Addr = "10.1.2.3".parse().unwrap();
        let text = encode_with(JsonFormat, |enc| enc.display(&addr).map(|_| ()));
        assert_eq!(text, r#""10.1.2.3""#);
    }
}
