//! Frame parsing and the non-owning message view.
//!
//! [`FixMessageParser`] drives the lexer, enforces header ordering and
//! session identity, and keeps the tag/value arrays that back a
//! [`FixMessage`] view. The arrays grow geometrically and are reused across
//! frames; a view borrows the read buffer and dies before the buffer is
//! compacted.

use meridian_common::buf::{self, Span};
use thiserror::Error;
use tracing::warn;

use crate::config::FixVersion;
use crate::lexer::{self, FieldHandler, LexError};
use crate::tags;
use crate::timestamp::TimestampParser;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty tag at offset {0}")]
    EmptyTag(usize),

    #[error("non-digit byte in tag at offset {0}")]
    BadTagByte(usize),

    #[error("header position {position} must be tag {expected}")]
    HeaderOrder { position: usize, expected: u32 },

    #[error("BeginString does not match the session version")]
    BeginStringMismatch,

    #[error("CompID mismatch on tag {0}")]
    CompIdMismatch(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("nested repeating groups are not supported (tag {0} repeats)")]
    Nested(u32),
}

/// Parses inbound frames for one session.
#[derive(Debug)]
pub struct FixMessageParser {
    begin_string: &'static [u8],
    sender_comp_id: Vec<u8>,
    target_comp_id: Vec<u8>,
    field_tags: Vec<u32>,
    field_values: Vec<Span>,
    frame_end: usize,
    violation: Option<FrameError>,
    timestamps: TimestampParser,
}

impl FixMessageParser {
    /// `sender_comp_id` / `target_comp_id` are this session's own identity;
    /// inbound frames must carry them mirrored (their 49 is our target).
    pub fn new(version: FixVersion, sender_comp_id: &str, target_comp_id: &str) -> Self {
        Self {
            begin_string: version.begin_string(),
            sender_comp_id: sender_comp_id.as_bytes().to_vec(),
            target_comp_id: target_comp_id.as_bytes().to_vec(),
            field_tags: Vec::new(),
            field_values: Vec::new(),
            frame_end: 0,
            violation: None,
            timestamps: TimestampParser::new(),
        }
    }

    /// Parses at most one frame from the front of `src`. `Ok(0)` means no
    /// complete frame is buffered yet; any error must disconnect.
    pub fn parse(&mut self, src: &[u8]) -> Result<usize, FrameError> {
        self.field_tags.clear();
        self.field_values.clear();
        self.frame_end = 0;
        self.violation = None;

        match lexer::lex(src, self) {
            Ok(consumed) => Ok(consumed),
            Err(LexError::EmptyTag(at)) => Err(FrameError::EmptyTag(at)),
            Err(LexError::BadTagByte(at)) => Err(FrameError::BadTagByte(at)),
            Err(LexError::Rejected) => {
                let violation = self
                    .violation
                    .take()
                    .unwrap_or(FrameError::HeaderOrder { position: 0, expected: tags::BEGIN_STRING });
                Err(violation)
            }
        }
    }

    /// The view over the frame most recently parsed from `src`.
    pub fn message<'a>(&'a self, src: &'a [u8]) -> FixMessage<'a> {
        FixMessage {
            frame: &src[..self.frame_end],
            field_tags: &self.field_tags,
            field_values: &self.field_values,
            src,
            timestamps: &self.timestamps,
        }
    }

    fn reject(&mut self, violation: FrameError) -> bool {
        warn!(%violation, "rejecting inbound frame");
        self.violation = Some(violation);
        false
    }
}

impl FieldHandler for FixMessageParser {
    fn on_field(&mut self, src: &[u8], tag: u32, value: Span) -> bool {
        match self.field_tags.len() {
            0 => {
                if tag != tags::BEGIN_STRING {
                    return self.reject(FrameError::HeaderOrder {
                        position: 0,
                        expected: tags::BEGIN_STRING,
                    });
                }
                if value.slice(src) != self.begin_string {
                    return self.reject(FrameError::BeginStringMismatch);
                }
            }
            1 => {
                if tag != tags::BODY_LENGTH {
                    return self.reject(FrameError::HeaderOrder {
                        position: 1,
                        expected: tags::BODY_LENGTH,
                    });
                }
            }
            2 => {
                if tag != tags::MSG_TYPE {
                    return self.reject(FrameError::HeaderOrder {
                        position: 2,
                        expected: tags::MSG_TYPE,
                    });
                }
            }
            _ => {
                // The counterparty's sender is our target and vice versa.
                if tag == tags::SENDER_COMP_ID && value.slice(src) != self.target_comp_id {
                    return self.reject(FrameError::CompIdMismatch(tags::SENDER_COMP_ID));
                }
                if tag == tags::TARGET_COMP_ID && value.slice(src) != self.sender_comp_id {
                    return self.reject(FrameError::CompIdMismatch(tags::TARGET_COMP_ID));
                }
            }
        }
        self.field_tags.push(tag);
        self.field_values.push(value);
        true
    }

    fn on_end(&mut self, next_offset: usize) -> bool {
        self.frame_end = next_offset;
        true
    }
}

/// Non-owning view of one parsed frame.
#[derive(Clone, Copy, Debug)]
pub struct FixMessage<'a> {
    src: &'a [u8],
    frame: &'a [u8],
    field_tags: &'a [u32],
    field_values: &'a [Span],
    timestamps: &'a TimestampParser,
}

impl<'a> FixMessage<'a> {
    pub fn size(&self) -> usize {
        self.field_tags.len()
    }

    pub fn frame(&self) -> &'a [u8] {
        self.frame
    }

    pub fn tag_at(&self, index: usize) -> u32 {
        self.field_tags[index]
    }

    pub fn value_at(&self, index: usize) -> &'a [u8] {
        self.field_values[index].slice(self.src)
    }

    /// First value carrying `tag`. Linear scan; messages are small.
    pub fn find(&self, tag: u32) -> Option<&'a [u8]> {
        self.index_of(tag).map(|i| self.value_at(i))
    }

    fn index_of(&self, tag: u32) -> Option<usize> {
        self.field_tags.iter().position(|&t| t == tag)
    }

    pub fn msg_type(&self) -> &'a [u8] {
        self.field_values
            .get(2)
            .map(|span| span.slice(self.src))
            .unwrap_or(b"")
    }

    pub fn seq_num(&self) -> i64 {
        self.as_integer(tags::MSG_SEQ_NUM)
    }

    pub fn as_integer(&self, tag: u32) -> i64 {
        match self.find(tag) {
            Some(value) => buf::parse_as_long(value, -1),
            None => -1,
        }
    }

    pub fn as_double(&self, tag: u32) -> f64 {
        match self.find(tag) {
            Some(value) => buf::parse_as_double(value, f64::NAN),
            None => f64::NAN,
        }
    }

    pub fn as_timestamp(&self, tag: u32) -> i64 {
        match self.find(tag) {
            Some(value) => self.timestamps.parse_timestamp(value),
            None => -1,
        }
    }

    pub fn as_date(&self, tag: u32) -> i64 {
        match self.find(tag) {
            Some(value) => self.timestamps.parse_date(value),
            None => -1,
        }
    }

    pub fn as_time(&self, tag: u32) -> i64 {
        match self.find(tag) {
            Some(value) => self.timestamps.parse_time(value),
            None => -1,
        }
    }

    /// Maps the field's bytes through `mapping`; `None` when the tag is
    /// absent or the value matches no entry.
    pub fn as_enum<T: Copy>(&self, tag: u32, mapping: &[(&[u8], T)]) -> Option<T> {
        let value = self.find(tag)?;
        mapping
            .iter()
            .find(|(wire, _)| *wire == value)
            .map(|(_, mapped)| *mapped)
    }

    /// Sub-views of the repeating group counted by `count_tag`, each
    /// starting at `first_tag`. At most the counted number of groups is
    /// yielded and the scan stops at the end of the message. Nested groups
    /// are not supported and raise [`GroupError::Nested`].
    pub fn repeating_groups(
        &self,
        count_tag: u32,
        first_tag: u32,
    ) -> Result<GroupIter<'a>, GroupError> {
        let count_index = match self.index_of(count_tag) {
            Some(i) => i,
            None => return Ok(GroupIter::empty(*self)),
        };
        let declared = buf::parse_as_long(self.value_at(count_index), 0).max(0) as usize;

        // Group fields run from after the count up to the trailer.
        let scan_end = self.size().saturating_sub(1);
        for i in count_index + 1..scan_end {
            if self.field_tags[i] == count_tag {
                return Err(GroupError::Nested(count_tag));
            }
        }

        Ok(GroupIter {
            msg: *self,
            first_tag,
            next: count_index + 1,
            scan_end,
            remaining: declared,
        })
    }
}

/// Iterator over repeating-group sub-views.
#[derive(Debug)]
pub struct GroupIter<'a> {
    msg: FixMessage<'a>,
    first_tag: u32,
    next: usize,
    scan_end: usize,
    remaining: usize,
}

impl<'a> GroupIter<'a> {
    fn empty(msg: FixMessage<'a>) -> Self {
        Self {
            msg,
            first_tag: 0,
            next: 0,
            scan_end: 0,
            remaining: 0,
        }
    }
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = FixGroup<'a>;

    fn next(&mut self) -> Option<FixGroup<'a>> {
        if self.remaining == 0 {
            return None;
        }
        // Find the next instance start.
        while self.next < self.scan_end && self.msg.field_tags[self.next] != self.first_tag {
            self.next += 1;
        }
        if self.next >= self.scan_end {
            return None;
        }
        let start = self.next;
        let mut end = start + 1;
        while end < self.scan_end && self.msg.field_tags[end] != self.first_tag {
            end += 1;
        }
        self.next = end;
        self.remaining -= 1;
        Some(FixGroup {
            msg: self.msg,
            start,
            end,
        })
    }
}

/// One repeating-group instance: a window of the parent message's fields.
#[derive(Clone, Copy)]
pub struct FixGroup<'a> {
    msg: FixMessage<'a>,
    start: usize,
    end: usize,
}

impl<'a> FixGroup<'a> {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn tag_at(&self, index: usize) -> u32 {
        self.msg.tag_at(self.start + index)
    }

    pub fn value_at(&self, index: usize) -> &'a [u8] {
        self.msg.value_at(self.start + index)
    }

    pub fn find(&self, tag: u32) -> Option<&'a [u8]> {
        (self.start..self.end)
            .find(|&i| self.msg.field_tags[i] == tag)
            .map(|i| self.msg.value_at(i))
    }

    pub fn as_integer(&self, tag: u32) -> i64 {
        match self.find(tag) {
            Some(value) => buf::parse_as_long(value, -1),
            None => -1,
        }
    }

    pub fn as_double(&self, tag: u32) -> f64 {
        match self.find(tag) {
            Some(value) => buf::parse_as_double(value, f64::NAN),
            None => f64::NAN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pipe_delimited: &str) -> Vec<u8> {
        pipe_delimited
            .bytes()
            .map(|b| if b == b'|' { 1 } else { b })
            .collect()
    }

    fn parser() -> FixMessageParser {
        // We are SENDER; the counterparty is FOO.
        FixMessageParser::new(FixVersion::Fix42, "SENDER", "FOO")
    }

    #[test]
    fn parses_a_frame_into_a_view() {
        let src = frame("8=FIX.4.2|9=100|35=A|49=FOO|56=SENDER|58=HI|10=123|");
        let mut parser = parser();
        assert_eq!(parser.parse(&src), Ok(src.len()));

        let msg = parser.message(&src);
        assert_eq!(msg.size(), 7);
        assert_eq!(msg.frame(), &src[..]);
        assert_eq!(msg.tag_at(0), 8);
        assert_eq!(msg.value_at(0), b"FIX.4.2");
        assert_eq!(msg.msg_type(), b"A");
        assert_eq!(msg.find(58), Some(&b"HI"[..]));
        assert_eq!(msg.find(999), None);
    }

    #[test]
    fn incomplete_frame_reports_zero() {
        let src = frame("8=FIX.4.2|9=100|35=A|49=FOO|56=SENDER|58=H");
        assert_eq!(parser().parse(&src), Ok(0));
    }

    #[test]
    fn wrong_sender_comp_id_rejected() {
        let src = frame("8=FIX.4.2|9=100|35=A|49=OTHER|56=SENDER|10=123|");
        assert_eq!(
            parser().parse(&src),
            Err(FrameError::CompIdMismatch(tags::SENDER_COMP_ID))
        );
    }

    #[test]
    fn wrong_target_comp_id_rejected() {
        let src = frame("8=FIX.4.2|9=100|35=A|49=FOO|56=OTHER|10=123|");
        assert_eq!(
            parser().parse(&src),
            Err(FrameError::CompIdMismatch(tags::TARGET_COMP_ID))
        );
    }

    #[test]
    fn header_order_enforced() {
        let mut p = parser();
        assert_eq!(
            p.parse(&frame("9=100|8=FIX.4.2|35=A|10=123|")),
            Err(FrameError::HeaderOrder {
                position: 0,
                expected: 8
            })
        );
        assert_eq!(
            p.parse(&frame("8=FIX.4.2|35=A|9=100|10=123|")),
            Err(FrameError::HeaderOrder {
                position: 1,
                expected: 9
            })
        );
        assert_eq!(
            p.parse(&frame("8=FIX.4.2|9=100|49=FOO|35=A|10=123|")),
            Err(FrameError::HeaderOrder {
                position: 2,
                expected: 35
            })
        );
        assert_eq!(
            p.parse(&frame("8=FIX.4.4|9=100|35=A|10=123|")),
            Err(FrameError::BeginStringMismatch)
        );
    }

    #[test]
    fn typed_accessors() {
        let src = frame(
            "8=FIX.4.2|9=100|35=8|49=FOO|56=SENDER|34=12|52=20210526-09:30:05.123|44=1.25|38=100|64=20210528|273=09:31:00|10=123|",
        );
        let mut parser = parser();
        parser.parse(&src).unwrap();
        let msg = parser.message(&src);

        assert_eq!(msg.seq_num(), 12);
        assert_eq!(msg.as_integer(38), 100);
        assert_eq!(msg.as_double(44), 1.25);
        assert!(msg.as_double(999).is_nan());
        assert_eq!(msg.as_integer(999), -1);

        let ts = msg.as_timestamp(52);
        assert!(ts > 0);
        assert_eq!(ts % 1_000_000_000, 123_000_000);
        assert!(msg.as_date(64) > 0);
        assert_eq!(
            msg.as_time(273),
            (9 * 3600 + 31 * 60) * 1_000_000_000_i64
        );
        assert_eq!(msg.as_timestamp(44), -1);

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum Side {
            Buy,
            Sell,
        }
        let sides: [(&[u8], Side); 2] = [(b"1", Side::Buy), (b"2", Side::Sell)];
        assert_eq!(msg.as_enum(38, &sides), None);
        assert_eq!(msg.as_enum(999, &sides), None);
    }

    #[test]
    fn repeating_groups_yield_sub_views() {
        // 268=2 with two 269-led instances.
        let src = frame(
            "8=FIX.4.2|9=100|35=W|49=FOO|56=SENDER|34=2|268=2|269=0|270=1.25|271=500|269=1|270=1.26|271=700|10=123|",
        );
        let mut parser = parser();
        parser.parse(&src).unwrap();
        let msg = parser.message(&src);

        let groups: Vec<_> = msg.repeating_groups(268, 269).unwrap().collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].find(269), Some(&b"0"[..]));
        assert_eq!(groups[0].as_double(270), 1.25);
        assert_eq!(groups[0].as_integer(271), 500);
        assert_eq!(groups[1].as_double(270), 1.26);
        assert_eq!(groups[1].size(), 3);
    }

    #[test]
    fn repeating_groups_stop_at_declared_count() {
        let src = frame(
            "8=FIX.4.2|9=100|35=W|49=FOO|56=SENDER|34=2|268=1|269=0|270=1.25|269=1|270=1.26|10=123|",
        );
        let mut parser = parser();
        parser.parse(&src).unwrap();
        let groups: Vec<_> = parser
            .message(&src)
            .repeating_groups(268, 269)
            .unwrap()
            .collect();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn missing_count_tag_yields_no_groups() {
        let src = frame("8=FIX.4.2|9=100|35=W|49=FOO|56=SENDER|34=2|10=123|");
        let mut parser = parser();
        parser.parse(&src).unwrap();
        assert_eq!(
            parser.message(&src).repeating_groups(268, 269).unwrap().count(),
            0
        );
    }

    #[test]
    fn nested_groups_raise() {
        let src = frame(
            "8=FIX.4.2|9=100|35=W|49=FOO|56=SENDER|34=2|268=1|269=0|268=1|269=1|10=123|",
        );
        let mut parser = parser();
        parser.parse(&src).unwrap();
        assert_eq!(
            parser.message(&src).repeating_groups(268, 269).unwrap_err(),
            GroupError::Nested(268)
        );
    }

    #[test]
    fn arrays_reused_across_frames() {
        let mut parser = parser();
        let a = frame("8=FIX.4.2|9=5|35=0|49=FOO|56=SENDER|10=123|");
        let b = frame("8=FIX.4.2|9=5|35=1|49=FOO|56=SENDER|112=req|10=123|");
        parser.parse(&a).unwrap();
        assert_eq!(parser.message(&a).size(), 6);
        parser.parse(&b).unwrap();
        let msg = parser.message(&b);
        assert_eq!(msg.size(), 7);
        assert_eq!(msg.find(112), Some(&b"req"[..]));
    }
}
