//! Outbound FIX frame composition.
//!
//! A writer owns its buffer and a running checksum. `start` lays down the
//! header with a four-space BodyLength placeholder; typed setters append
//! `tag=value\x01` fields; `send` patches the body length, seals the
//! checksum trailer and hands the frame to a commit callback. Tags below
//! 118 use cached `tag=` prefixes with precomputed checksum contributions.

use meridian_common::buf;

use crate::config::FixVersion;
use crate::tags;
use crate::timestamp;

/// Tags below this bound get a cached prefix.
const CACHED_TAG_LIMIT: u32 = 118;

#[derive(Debug, Clone, Copy, Default)]
struct TagPrefix {
    bytes: [u8; 4],
    len: u8,
    sum: u16,
}

#[derive(Debug)]
pub struct FixWriter {
    out: Vec<u8>,
    begin_string: &'static [u8],
    sender_comp_id: Vec<u8>,
    target_comp_id: Vec<u8>,
    checksum: u32,
    body_length_offset: usize,
    msg_type_offset: usize,
    prefixes: Vec<TagPrefix>,
}

impl FixWriter {
    pub fn new(version: FixVersion, sender_comp_id: &str, target_comp_id: &str) -> Self {
        let mut prefixes = vec![TagPrefix::default(); CACHED_TAG_LIMIT as usize];
        for (tag, prefix) in prefixes.iter_mut().enumerate().skip(1) {
            let mut bytes = [0u8; 4];
            let digits = buf::put_long_ascii(&mut bytes, tag as i64);
            bytes[digits] = b'=';
            let len = digits + 1;
            let sum: u16 = bytes[..len].iter().map(|&b| u16::from(b)).sum();
            *prefix = TagPrefix {
                bytes,
                len: len as u8,
                sum,
            };
        }
        Self {
            out: Vec::with_capacity(512),
            begin_string: version.begin_string(),
            sender_comp_id: sender_comp_id.as_bytes().to_vec(),
            target_comp_id: target_comp_id.as_bytes().to_vec(),
            checksum: 0,
            body_length_offset: 0,
            msg_type_offset: 0,
            prefixes,
        }
    }

    /// Begins a frame: `8|9(placeholder)|35|49|56|34|52`.
    pub fn start(&mut self, msg_type: &[u8], out_seq: u64, sending_time_ns: i64) {
        self.out.clear();
        self.checksum = 0;

        self.put_tag(tags::BEGIN_STRING);
        let begin_string = self.begin_string;
        self.push(begin_string);
        self.push_soh();

        self.put_tag(tags::BODY_LENGTH);
        // Four spaces reserve the digits; their checksum contribution is
        // added when `send` patches them.
        self.body_length_offset = self.out.len();
        self.out.extend_from_slice(b"    ");
        self.push_soh();

        self.msg_type_offset = self.out.len();
        self.put_tag(tags::MSG_TYPE);
        self.push(msg_type);
        self.push_soh();

        self.put_tag(tags::SENDER_COMP_ID);
        let sender = std::mem::take(&mut self.sender_comp_id);
        self.push(&sender);
        self.sender_comp_id = sender;
        self.push_soh();

        self.put_tag(tags::TARGET_COMP_ID);
        let target = std::mem::take(&mut self.target_comp_id);
        self.push(&target);
        self.target_comp_id = target;
        self.push_soh();

        self.put_integer(tags::MSG_SEQ_NUM, out_seq as i64);
        self.put_timestamp(tags::SENDING_TIME, sending_time_ns);
    }

    pub fn put_integer(&mut self, tag: u32, value: i64) {
        self.put_tag(tag);
        let mut tmp = [0u8; 24];
        let n = buf::put_long_ascii(&mut tmp, value);
        self.push(&tmp[..n]);
        self.push_soh();
    }

    pub fn put_decimal(&mut self, tag: u32, value: f64) {
        self.put_tag(tag);
        let mut tmp = [0u8; 48];
        let n = buf::put_decimal_ascii(&mut tmp, value, 0, 9);
        self.push(&tmp[..n]);
        self.push_soh();
    }

    pub fn put_buffer(&mut self, tag: u32, value: &[u8]) {
        self.put_tag(tag);
        self.push(value);
        self.push_soh();
    }

    pub fn put_ascii_string(&mut self, tag: u32, value: &str) {
        self.put_buffer(tag, value.as_bytes());
    }

    pub fn put_ascii_character(&mut self, tag: u32, value: u8) {
        self.put_tag(tag);
        self.push(&[value]);
        self.push_soh();
    }

    /// Enum wire values are preformatted byte strings.
    pub fn put_enum(&mut self, tag: u32, wire: &[u8]) {
        self.put_buffer(tag, wire);
    }

    /// Always millisecond precision.
    pub fn put_timestamp(&mut self, tag: u32, epoch_ns: i64) {
        self.put_tag(tag);
        let mark = self.out.len();
        timestamp::put_timestamp_millis(&mut self.out, epoch_ns);
        self.add_to_checksum(mark);
        self.push_soh();
    }

    /// Bytes staged so far, header included.
    pub fn position(&self) -> usize {
        self.out.len()
    }

    /// Patches BodyLength, seals the checksum trailer, and delivers the
    /// frame to `commit`.
    pub fn send<R>(&mut self, commit: impl FnOnce(&[u8]) -> R) -> R {
        let body_length = self.out.len() - self.msg_type_offset;
        debug_assert!(body_length < 10_000, "frame exceeds 4-digit BodyLength");
        let mut remaining = body_length;
        for i in (0..4).rev() {
            let digit = b'0' + (remaining % 10) as u8;
            remaining /= 10;
            self.out[self.body_length_offset + i] = digit;
            self.checksum += u32::from(digit);
        }

        let trailer_checksum = self.checksum % 256;
        self.out.extend_from_slice(b"10=");
        self.out.push(b'0' + (trailer_checksum / 100) as u8);
        self.out.push(b'0' + (trailer_checksum / 10 % 10) as u8);
        self.out.push(b'0' + (trailer_checksum % 10) as u8);
        self.out.push(tags::SOH);

        commit(&self.out)
    }

    fn put_tag(&mut self, tag: u32) {
        if tag < CACHED_TAG_LIMIT {
            let prefix = self.prefixes[tag as usize];
            self.out.extend_from_slice(&prefix.bytes[..prefix.len as usize]);
            self.checksum += u32::from(prefix.sum);
        } else {
            let mut tmp = [0u8; 12];
            let n = buf::put_long_ascii(&mut tmp, i64::from(tag));
            self.push(&tmp[..n]);
            self.push(b"=");
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.checksum += u32::from(b);
        }
        self.out.extend_from_slice(bytes);
    }

    fn push_soh(&mut self) {
        self.checksum += u32::from(tags::SOH);
        self.out.push(tags::SOH);
    }

    /// Adds bytes appended directly to `out` since `mark` to the checksum.
    fn add_to_checksum(&mut self, mark: usize) {
        let mut sum = 0u32;
        for &b in &self.out[mark..] {
            sum += u32::from(b);
        }
        self.checksum += sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{lex, FieldHandler};
    use chrono::TimeZone;
    use meridian_common::buf::Span;

    fn sending_time() -> i64 {
        chrono::Utc
            .with_ymd_and_hms(2021, 5, 26, 9, 30, 5)
            .single()
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
            + 123_000_000
    }

    fn pipes(frame: &[u8]) -> String {
        frame
            .iter()
            .map(|&b| if b == 1 { '|' } else { b as char })
            .collect()
    }

    #[test]
    fn composes_the_reference_frame() {
        let mut writer = FixWriter::new(FixVersion::Fix42, "SENDER", "TARGET");
        writer.start(b"AB", 1, sending_time());
        writer.put_integer(38, 1);
        writer.put_decimal(44, 1.23);
        writer.put_ascii_string(58, "HI");
        let frame = writer.send(<[u8]>::to_vec);

        let body = "35=AB|49=SENDER|56=TARGET|34=1|52=20210526-09:30:05.123|38=1|44=1.23|58=HI|";
        let head = format!("8=FIX.4.2|9={:04}|", body.len());
        let payload: Vec<u8> = format!("{head}{body}")
            .bytes()
            .map(|b| if b == b'|' { 1 } else { b })
            .collect();
        let checksum: u32 = payload.iter().map(|&b| u32::from(b)).sum();
        let expected = format!("{head}{body}10={:03}|", checksum % 256);

        assert_eq!(pipes(&frame), expected);
    }

    #[derive(Default)]
    struct Trailer {
        checksum_value: Vec<u8>,
        checksum_offset: usize,
        body_start: usize,
        body_length: i64,
        fields: usize,
    }

    impl FieldHandler for Trailer {
        fn on_field(&mut self, src: &[u8], tag: u32, value: Span) -> bool {
            self.fields += 1;
            match tag {
                9 => {
                    self.body_length = meridian_common::buf::parse_as_long(value.slice(src), -1);
                    // The body starts right after this field's SOH.
                    self.body_start = value.offset as usize + value.len() + 1;
                }
                10 => {
                    self.checksum_value = value.slice(src).to_vec();
                    self.checksum_offset = value.offset as usize - 3;
                }
                _ => {}
            }
            true
        }

        fn on_end(&mut self, _next_offset: usize) -> bool {
            true
        }
    }

    fn checksum_and_length_hold(frame: &[u8]) {
        let mut trailer = Trailer::default();
        assert_eq!(lex(frame, &mut trailer), Ok(frame.len()));

        // Checksum covers every byte before the "10=" token.
        let sum: u32 = frame[..trailer.checksum_offset]
            .iter()
            .map(|&b| u32::from(b))
            .sum();
        let expected = format!("{:03}", sum % 256);
        assert_eq!(trailer.checksum_value, expected.as_bytes());

        // BodyLength counts from "35=" up to the "10=" token.
        assert_eq!(
            trailer.body_length as usize,
            trailer.checksum_offset - trailer.body_start
        );
    }

    #[test]
    fn checksum_and_body_length_properties() {
        let mut writer = FixWriter::new(FixVersion::Fix44, "LEFT", "RIGHT");

        writer.start(b"D", 42, sending_time());
        writer.put_ascii_string(11, "order-1");
        writer.put_ascii_character(54, b'1');
        writer.put_enum(40, b"2");
        writer.put_decimal(44, 250.5);
        writer.put_integer(38, 1000);
        writer.put_buffer(1, b"ACCT");
        // A tag past the prefix cache.
        writer.put_ascii_string(553, "user");
        let frame = writer.send(<[u8]>::to_vec);
        checksum_and_length_hold(&frame);

        // Writer is reusable; the second frame stands alone.
        writer.start(b"0", 43, sending_time());
        let frame = writer.send(<[u8]>::to_vec);
        checksum_and_length_hold(&frame);
        assert!(frame.starts_with(b"8=FIX.4.4\x01"));
    }

    #[test]
    fn header_field_order() {
        let mut writer = FixWriter::new(FixVersion::Fix42, "S", "T");
        writer.start(b"0", 7, sending_time());
        let frame = writer.send(<[u8]>::to_vec);

        let mut collect = Vec::new();
        struct Tags<'a>(&'a mut Vec<u32>);
        impl FieldHandler for Tags<'_> {
            fn on_field(&mut self, _src: &[u8], tag: u32, _value: Span) -> bool {
                self.0.push(tag);
                true
            }
            fn on_end(&mut self, _next_offset: usize) -> bool {
                true
            }
        }
        lex(&frame, &mut Tags(&mut collect)).unwrap();
        assert_eq!(collect, [8, 9, 35, 49, 56, 34, 52, 10]);
    }

    #[test]
    fn seconds_precision_is_millis() {
        let mut writer = FixWriter::new(FixVersion::Fix42, "S", "T");
        writer.start(b"0", 1, sending_time() + 999); // sub-millis truncated
        let frame = writer.send(<[u8]>::to_vec);
        let text = pipes(&frame);
        assert!(text.contains("52=20210526-09:30:05.123|"), "{text}");
    }
}
