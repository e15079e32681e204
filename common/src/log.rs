//! Append-style message logging.
//!
//! This is the wire/audit log used by the FIX session (one line per frame),
//! not the diagnostics layer — diagnostics go through `tracing` like the rest
//! of the platform. A [`LogSink`] hands out a writable line on `start` and
//! seals it on `commit`; the [`LogFactory`] buffers lines in memory until a
//! real sink is installed, then replays them in order.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Upper bound on a single log line, header excluded.
pub const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Line-oriented sink. `start` begins a line and exposes the writable
/// region; `commit` seals the first `len` bytes of it as one line.
pub trait LogSink {
    fn start(&mut self, level: LogLevel, log_id: u32, timestamp_ns: i64) -> &mut [u8];
    fn commit(&mut self, len: usize);
}

/// Accumulates committed lines in memory until the real sink exists.
#[derive(Debug, Default)]
pub struct BufferSink {
    scratch: Vec<u8>,
    pending: Option<(LogLevel, u32, i64)>,
    lines: Vec<(LogLevel, u32, i64, Vec<u8>)>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self {
            scratch: vec![0; MAX_LINE],
            pending: None,
            lines: Vec::new(),
        }
    }

    fn drain(&mut self) -> Vec<(LogLevel, u32, i64, Vec<u8>)> {
        std::mem::take(&mut self.lines)
    }
}

impl LogSink for BufferSink {
    fn start(&mut self, level: LogLevel, log_id: u32, timestamp_ns: i64) -> &mut [u8] {
        self.pending = Some((level, log_id, timestamp_ns));
        &mut self.scratch
    }

    fn commit(&mut self, len: usize) {
        if let Some((level, id, ts)) = self.pending.take() {
            let len = len.min(self.scratch.len());
            self.lines.push((level, id, ts, self.scratch[..len].to_vec()));
        }
    }
}

/// Sink writing one formatted line per commit to any `io::Write`.
pub struct WriteSink<W: std::io::Write> {
    out: W,
    scratch: Vec<u8>,
    pending: Option<(LogLevel, u32, i64)>,
}

impl<W: std::io::Write> WriteSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            scratch: vec![0; MAX_LINE],
            pending: None,
        }
    }
}

impl<W: std::io::Write> LogSink for WriteSink<W> {
    fn start(&mut self, level: LogLevel, log_id: u32, timestamp_ns: i64) -> &mut [u8] {
        self.pending = Some((level, log_id, timestamp_ns));
        &mut self.scratch
    }

    fn commit(&mut self, len: usize) {
        if let Some((level, id, ts)) = self.pending.take() {
            let len = len.min(self.scratch.len());
            let _ = writeln!(
                self.out,
                "{ts} {} [{id}] {}",
                level.label(),
                String::from_utf8_lossy(&self.scratch[..len])
            );
        }
    }
}

enum Slot {
    Buffering(BufferSink),
    Installed(Box<dyn LogSink>),
}

impl Slot {
    fn sink(&mut self) -> &mut dyn LogSink {
        match self {
            Slot::Buffering(s) => s,
            Slot::Installed(s) => s.as_mut(),
        }
    }
}

/// Hands out [`Logger`]s sharing one sink. Lines logged before
/// [`LogFactory::install_sink`] are buffered and replayed in order.
pub struct LogFactory {
    slot: Rc<RefCell<Slot>>,
    next_id: std::cell::Cell<u32>,
}

impl LogFactory {
    pub fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot::Buffering(BufferSink::new()))),
            next_id: std::cell::Cell::new(1),
        }
    }

    pub fn logger(&self) -> Logger {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Logger {
            id,
            slot: Rc::clone(&self.slot),
            line: RefCell::new(Vec::with_capacity(256)),
        }
    }

    /// Swaps in the real sink and replays everything buffered so far.
    pub fn install_sink(&self, mut sink: Box<dyn LogSink>) {
        let mut slot = self.slot.borrow_mut();
        if let Slot::Buffering(buffer) = &mut *slot {
            let lines = buffer.drain();
            tracing::debug!(replayed = lines.len(), "log sink installed");
            for (level, id, ts, line) in lines {
                let dst = sink.start(level, id, ts);
                let n = line.len().min(dst.len());
                dst[..n].copy_from_slice(&line[..n]);
                sink.commit(n);
            }
        }
        *slot = Slot::Installed(sink);
    }
}

impl Default for LogFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// A named log producing one line per statement.
pub struct Logger {
    id: u32,
    slot: Rc<RefCell<Slot>>,
    line: RefCell<Vec<u8>>,
}

impl Logger {
    pub fn debug(&self, timestamp_ns: i64) -> Statement<'_> {
        self.statement(LogLevel::Debug, timestamp_ns)
    }

    pub fn info(&self, timestamp_ns: i64) -> Statement<'_> {
        self.statement(LogLevel::Info, timestamp_ns)
    }

    pub fn warn(&self, timestamp_ns: i64) -> Statement<'_> {
        self.statement(LogLevel::Warn, timestamp_ns)
    }

    pub fn error(&self, timestamp_ns: i64) -> Statement<'_> {
        self.statement(LogLevel::Error, timestamp_ns)
    }

    fn statement(&self, level: LogLevel, timestamp_ns: i64) -> Statement<'_> {
        self.line.borrow_mut().clear();
        Statement {
            logger: self,
            level,
            timestamp_ns,
        }
    }
}

/// One in-flight log line. Dropping without `commit` discards the line.
pub struct Statement<'a> {
    logger: &'a Logger,
    level: LogLevel,
    timestamp_ns: i64,
}

impl Statement<'_> {
    pub fn str(self, s: &str) -> Self {
        self.append(s.as_bytes())
    }

    pub fn bytes(self, b: &[u8]) -> Self {
        self.append(b)
    }

    pub fn long(self, v: i64) -> Self {
        let mut buf = [0u8; 24];
        let n = crate::buf::put_long_ascii(&mut buf, v);
        self.append(&buf[..n])
    }

    pub fn decimal(self, v: f64) -> Self {
        let mut buf = [0u8; 48];
        let n = crate::buf::put_decimal_ascii(&mut buf, v, 0, 9);
        self.append(&buf[..n])
    }

    fn append(self, bytes: &[u8]) -> Self {
        {
            let mut line = self.logger.line.borrow_mut();
            let room = MAX_LINE.saturating_sub(line.len());
            line.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
        self
    }

    /// Seals the line and delivers it to the sink.
    pub fn commit(self) {
        let line = self.logger.line.borrow();
        let mut slot = self.logger.slot.borrow_mut();
        let sink = slot.sink();
        let dst = sink.start(self.level, self.logger.id, self.timestamp_ns);
        let n = line.len().min(dst.len());
        dst[..n].copy_from_slice(&line[..n]);
        sink.commit(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        scratch: Vec<u8>,
        pending: Option<(LogLevel, u32, i64)>,
        lines: Rc<RefCell<Vec<String>>>,
    }

    impl RecordingSink {
        fn new(lines: Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                scratch: vec![0; MAX_LINE],
                pending: None,
                lines,
            }
        }
    }

    impl LogSink for RecordingSink {
        fn start(&mut self, level: LogLevel, log_id: u32, timestamp_ns: i64) -> &mut [u8] {
            self.pending = Some((level, log_id, timestamp_ns));
            &mut self.scratch
        }

        fn commit(&mut self, len: usize) {
            let (level, id, ts) = self.pending.take().unwrap();
            self.lines.borrow_mut().push(format!(
                "{ts} {} [{id}] {}",
                level.label(),
                String::from_utf8_lossy(&self.scratch[..len])
            ));
        }
    }

    #[test]
    fn statement_produces_one_line() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let factory = LogFactory::new();
        factory.install_sink(Box::new(RecordingSink::new(Rc::clone(&lines))));

        let log = factory.logger();
        log.info(7).str("seq=").long(42).str(" px=").decimal(1.25).commit();

        assert_eq!(lines.borrow().as_slice(), ["7 INFO [1] seq=42 px=1.25"]);
    }

    #[test]
    fn lines_before_install_replay_in_order() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let factory = LogFactory::new();
        let log = factory.logger();

        log.info(1).str("first").commit();
        log.warn(2).str("second").commit();
        assert!(lines.borrow().is_empty());

        factory.install_sink(Box::new(RecordingSink::new(Rc::clone(&lines))));
        log.info(3).str("third").commit();

        assert_eq!(
            lines.borrow().as_slice(),
            [
                "1 INFO [1] first",
                "2 WARN [1] second",
                "3 INFO [1] third"
            ]
        );
    }

    #[test]
    fn loggers_get_distinct_ids() {
        let factory = LogFactory::new();
        let a = factory.logger();
        let b = factory.logger();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }
}
