//! Restartable streaming JSON parser.
//!
//! One forward pass over the caller's bytes produces a pooled value tree.
//! The parser keeps no lexical state between calls: when the input ends in
//! the middle of a value the call reports zero bytes consumed and the caller
//! re-feeds the same bytes with more appended. Malformed input reports a
//! stable reason string and the exact offending offset.

use meridian_common::buf::Span;

use crate::value::{NodeId, ValueArena, ValueRef};

/// Stable parse-error reason strings.
pub mod reason {
    pub const INVALID_ESCAPE: &str = "invalid escaped character";
    pub const ILLEGAL_CHAR_IN_NUMBER: &str = "illegal character in number";
    pub const TWO_DECIMAL_POINTS: &str = "two decimal points in number";
    pub const CANNOT_PARSE_NUMBER: &str = "cannot parse number";
    pub const INVALID_VALUE: &str = "invalid value";
    pub const ILLEGAL_CHAR_IN_MAP: &str = "illegal character in map";
    pub const ILLEGAL_CHAR_IN_LIST: &str = "illegal character in list";
    pub const ILLEGAL_CHAR: &str = "illegal character";
    pub const NON_STRING_KEY: &str = "non-string key";
    pub const DUPLICATE_KEY: &str = "duplicate key";
    pub const ILLEGAL_COMMA_IN_MAP: &str = "illegal comma in map";
    pub const ILLEGAL_COMMA_IN_LIST: &str = "illegal comma in list";
    pub const ILLEGAL_COLON_IN_MAP: &str = "illegal colon in map";
    pub const COLON_NOT_IN_MAP: &str = "colon character not in map";
    pub const ILLEGAL_CLOSING: &str = "illegal closing of list/map";
    pub const CANNOT_ADD_CHILD: &str = "can only add child element to a map or list";
}

const PACKED_TRUE: u64 = pack(b"true");
const PACKED_FALSE: u64 = pack(b"false");
const PACKED_NULL: u64 = pack(b"null");

const fn pack(word: &[u8]) -> u64 {
    let mut packed = 0u64;
    let mut i = 0;
    while i < word.len() {
        packed = (packed << 8) | word[i] as u64;
        i += 1;
    }
    packed
}

/// Outcome of one [`JsonParser::parse`] call. Owned by the parser and
/// rewritten in place; the previous tree returns to the pools first.
#[derive(Debug, Default)]
pub struct ParseResult {
    arena: ValueArena,
    root: Option<NodeId>,
    error_reason: Option<&'static str>,
    error_index: i32,
    length_parsed: i32,
}

impl ParseResult {
    /// Positive: bytes consumed by one complete root value. Zero: valid but
    /// incomplete input, nothing consumed. -1: malformed input.
    pub fn length_parsed(&self) -> i32 {
        self.length_parsed
    }

    pub fn error_reason(&self) -> Option<&'static str> {
        self.error_reason
    }

    /// Offset of the error in the parsed slice, or -1.
    pub fn error_index(&self) -> i32 {
        self.error_index
    }

    /// The parsed tree, resolved against the buffer it was parsed from.
    pub fn root<'a>(&'a self, src: &'a [u8]) -> Option<ValueRef<'a>> {
        self.root.map(|id| ValueRef::new(&self.arena, src, id))
    }

    pub fn arena(&self) -> &ValueArena {
        &self.arena
    }

    fn clear(&mut self) {
        if let Some(root) = self.root.take() {
            self.arena.recycle(root);
        }
        self.error_reason = None;
        self.error_index = -1;
        self.length_parsed = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelPos {
    ListStart,
    ListNeedValue,
    ListNeedComma,
    MapStart,
    MapNeedKey,
    MapNeedColon,
    MapNeedValue,
    MapNeedComma,
}

#[derive(Debug, Clone, Copy)]
struct LevelState {
    node: NodeId,
    pos: LevelPos,
    key: Span,
}

impl LevelState {
    fn is_map(&self) -> bool {
        !matches!(
            self.pos,
            LevelPos::ListStart | LevelPos::ListNeedValue | LevelPos::ListNeedComma
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Outside,
    Str { start: usize, escaped: bool },
    Number,
    Keyword { start: usize, packed: u64, count: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
struct NumberLex {
    start: usize,
    negative: bool,
    mantissa: u64,
    digits: u32,
    frac_digits: u32,
    seen_point: bool,
    in_exponent: bool,
    exponent: i32,
    exponent_negative: bool,
    exponent_digits: u32,
}

enum Step {
    Continue,
    Done(usize),
    Fail(&'static str, usize),
}

/// Streaming parser; owns its [`ParseResult`] and the value pools.
#[derive(Debug, Default)]
pub struct JsonParser {
    result: ParseResult,
    levels: Vec<LevelState>,
}

impl JsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self) -> &ParseResult {
        &self.result
    }

    /// Parses at most one root value from `src`. See
    /// [`ParseResult::length_parsed`] for the three outcomes.
    pub fn parse(&mut self, src: &[u8]) -> &ParseResult {
        self.result.clear();
        self.levels.clear();

        match self.run(src) {
            Step::Done(len) => {
                self.result.length_parsed = len as i32;
            }
            Step::Continue => {
                // Incomplete: hand everything back to the pools and wait
                // for more bytes.
                self.recycle_partial();
                self.result.length_parsed = 0;
            }
            Step::Fail(reason, index) => {
                self.recycle_partial();
                self.result.length_parsed = -1;
                self.result.error_reason = Some(reason);
                self.result.error_index = index as i32;
            }
        }
        self.levels.clear();
        &self.result
    }

    fn recycle_partial(&mut self) {
        if let Some(root) = self.result.root.take() {
            self.result.arena.recycle(root);
        } else if let Some(first) = self.levels.first() {
            self.result.arena.recycle(first.node);
        }
    }

    fn run(&mut self, src: &[u8]) -> Step {
        let mut mode = Mode::Outside;
        let mut num = NumberLex::default();
        let mut i = 0;

        while i < src.len() {
            let byte = src[i];
            match mode {
                Mode::Outside => {
                    match byte {
                        b' ' | b'\t' | b'\n' | b'\r' => {}
                        b'"' => {
                            if let Err(step) = self.check_value_start(true, i) {
                                return step;
                            }
                            mode = Mode::Str {
                                start: i + 1,
                                escaped: false,
                            };
                        }
                        b'-' | b'.' | b'0'..=b'9' => {
                            if let Err(step) = self.check_value_start(false, i) {
                                return step;
                            }
                            num = NumberLex {
                                start: i,
                                ..NumberLex::default()
                            };
                            match byte {
                                b'-' => num.negative = true,
                                b'.' => num.seen_point = true,
                                digit => {
                                    num.mantissa = u64::from(digit - b'0');
                                    num.digits = 1;
                                }
                            }
                            mode = Mode::Number;
                        }
                        b't' | b'f' | b'n' => {
                            if let Err(step) = self.check_value_start(false, i) {
                                return step;
                            }
                            mode = Mode::Keyword {
                                start: i,
                                packed: u64::from(byte),
                                count: 1,
                            };
                        }
                        b'{' => match self.open_container(true, i, src) {
                            Ok(()) => {}
                            Err(step) => return step,
                        },
                        b'[' => match self.open_container(false, i, src) {
                            Ok(()) => {}
                            Err(step) => return step,
                        },
                        b'}' => match self.close_container(true, i) {
                            Ok(None) => {}
                            Ok(Some(len)) => return Step::Done(len),
                            Err(step) => return step,
                        },
                        b']' => match self.close_container(false, i) {
                            Ok(None) => {}
                            Ok(Some(len)) => return Step::Done(len),
                            Err(step) => return step,
                        },
                        b',' => {
                            if let Err(step) = self.on_comma(i) {
                                return step;
                            }
                        }
                        b':' => {
                            if let Err(step) = self.on_colon(i) {
                                return step;
                            }
                        }
                        _ => return Step::Fail(self.illegal_char_reason(), i),
                    }
                    i += 1;
                }

                Mode::Str { start, escaped } => {
                    if escaped {
                        match byte {
                            b'"' | b'\\' | b'/' | b'b' | b'n' | b'r' | b't' | b'u' => {
                                mode = Mode::Str {
                                    start,
                                    escaped: false,
                                };
                            }
                            _ => return Step::Fail(reason::INVALID_ESCAPE, i),
                        }
                    } else if byte == b'\\' {
                        mode = Mode::Str {
                            start,
                            escaped: true,
                        };
                    } else if byte == b'"' {
                        let span = Span::new(start, i - start);
                        match self.finish_string(span, i, src) {
                            Ok(None) => mode = Mode::Outside,
                            Ok(Some(len)) => return Step::Done(len),
                            Err(step) => return step,
                        }
                    }
                    i += 1;
                }

                Mode::Number => match byte {
                    b'0'..=b'9' => {
                        if num.in_exponent {
                            num.exponent = num.exponent.saturating_mul(10)
                                + i32::from(byte - b'0');
                            num.exponent_digits += 1;
                        } else {
                            num.digits += 1;
                            if num.digits <= 18 {
                                num.mantissa = num.mantissa * 10 + u64::from(byte - b'0');
                            }
                            if num.seen_point {
                                num.frac_digits += 1;
                            }
                        }
                        i += 1;
                    }
                    b'.' => {
                        if num.seen_point {
                            return Step::Fail(reason::TWO_DECIMAL_POINTS, i);
                        }
                        if num.in_exponent {
                            return Step::Fail(reason::ILLEGAL_CHAR_IN_NUMBER, i);
                        }
                        num.seen_point = true;
                        i += 1;
                    }
                    b'e' | b'E' => {
                        if num.in_exponent || num.digits == 0 {
                            return Step::Fail(reason::ILLEGAL_CHAR_IN_NUMBER, i);
                        }
                        num.in_exponent = true;
                        if let Some(&b'-') = src.get(i + 1) {
                            num.exponent_negative = true;
                            i += 1;
                        }
                        i += 1;
                    }
                    b' ' | b'\t' | b'\n' | b'\r' | b',' | b']' | b'}' | b':' => {
                        // Delimiter: evaluate, then reprocess the byte.
                        match self.finish_number(&num, i, src) {
                            Ok(None) => mode = Mode::Outside,
                            Ok(Some(len)) => return Step::Done(len),
                            Err(step) => return step,
                        }
                    }
                    _ => return Step::Fail(reason::ILLEGAL_CHAR_IN_NUMBER, i),
                },

                Mode::Keyword {
                    start,
                    packed,
                    count,
                } => {
                    if !byte.is_ascii_lowercase() || count >= 5 {
                        return Step::Fail(reason::INVALID_VALUE, start);
                    }
                    let packed = (packed << 8) | u64::from(byte);
                    let count = count + 1;
                    let keyword = match (packed, count) {
                        (PACKED_TRUE, 4) => Some(Keyword::Bool(true)),
                        (PACKED_NULL, 4) => Some(Keyword::Null),
                        (PACKED_FALSE, 5) => Some(Keyword::Bool(false)),
                        _ => None,
                    };
                    match keyword {
                        Some(value) => match self.finish_keyword(value, i, src) {
                            Ok(None) => mode = Mode::Outside,
                            Ok(Some(len)) => return Step::Done(len),
                            Err(step) => return step,
                        },
                        None => {
                            mode = Mode::Keyword {
                                start,
                                packed,
                                count,
                            };
                        }
                    }
                    i += 1;
                }
            }
        }

        // Ran out of bytes mid-value (or before any value): incomplete.
        Step::Continue
    }

    fn illegal_char_reason(&self) -> &'static str {
        match self.levels.last() {
            Some(level) if level.is_map() => reason::ILLEGAL_CHAR_IN_MAP,
            Some(_) => reason::ILLEGAL_CHAR_IN_LIST,
            None => reason::ILLEGAL_CHAR,
        }
    }

    /// Validates that a value (or, for strings, possibly a key) may start
    /// at the current position.
    fn check_value_start(&self, is_string: bool, i: usize) -> Result<(), Step> {
        match self.levels.last().map(|level| level.pos) {
            None => Ok(()),
            Some(LevelPos::ListStart | LevelPos::ListNeedValue) => Ok(()),
            Some(LevelPos::ListNeedComma) => {
                Err(Step::Fail(reason::ILLEGAL_CHAR_IN_LIST, i))
            }
            Some(LevelPos::MapStart | LevelPos::MapNeedKey) => {
                if is_string {
                    Ok(())
                } else {
                    Err(Step::Fail(reason::NON_STRING_KEY, i))
                }
            }
            Some(LevelPos::MapNeedValue) => Ok(()),
            Some(LevelPos::MapNeedColon | LevelPos::MapNeedComma) => {
                Err(Step::Fail(reason::ILLEGAL_CHAR_IN_MAP, i))
            }
        }
    }

    fn on_comma(&mut self, i: usize) -> Result<(), Step> {
        match self.levels.last_mut() {
            None => Err(Step::Fail(reason::ILLEGAL_CHAR, i)),
            Some(level) => match level.pos {
                LevelPos::ListNeedComma => {
                    level.pos = LevelPos::ListNeedValue;
                    Ok(())
                }
                LevelPos::ListStart | LevelPos::ListNeedValue => {
                    Err(Step::Fail(reason::ILLEGAL_COMMA_IN_LIST, i))
                }
                LevelPos::MapNeedComma => {
                    level.pos = LevelPos::MapNeedKey;
                    Ok(())
                }
                _ => Err(Step::Fail(reason::ILLEGAL_COMMA_IN_MAP, i)),
            },
        }
    }

    fn on_colon(&mut self, i: usize) -> Result<(), Step> {
        match self.levels.last_mut() {
            None => Err(Step::Fail(reason::COLON_NOT_IN_MAP, i)),
            Some(level) => match level.pos {
                LevelPos::MapNeedColon => {
                    level.pos = LevelPos::MapNeedValue;
                    Ok(())
                }
                LevelPos::ListStart | LevelPos::ListNeedValue | LevelPos::ListNeedComma => {
                    Err(Step::Fail(reason::COLON_NOT_IN_MAP, i))
                }
                _ => Err(Step::Fail(reason::ILLEGAL_COLON_IN_MAP, i)),
            },
        }
    }

    fn open_container(&mut self, is_map: bool, i: usize, src: &[u8]) -> Result<(), Step> {
        if let Err(step) = self.check_value_start(false, i) {
            return Err(step);
        }
        let node = if is_map {
            self.result.arena.alloc_map()
        } else {
            self.result.arena.alloc_list()
        };
        self.attach(node, i, src)?;
        self.levels.push(LevelState {
            node,
            pos: if is_map {
                LevelPos::MapStart
            } else {
                LevelPos::ListStart
            },
            key: Span::default(),
        });
        Ok(())
    }

    fn close_container(&mut self, is_map: bool, i: usize) -> Result<Option<usize>, Step> {
        let level = match self.levels.last() {
            Some(level) => *level,
            None => return Err(Step::Fail(reason::ILLEGAL_CLOSING, i)),
        };
        let ok = if is_map {
            level.is_map()
                && matches!(level.pos, LevelPos::MapStart | LevelPos::MapNeedComma)
        } else {
            !level.is_map()
                && matches!(level.pos, LevelPos::ListStart | LevelPos::ListNeedComma)
        };
        if !ok {
            return Err(Step::Fail(reason::ILLEGAL_CLOSING, i));
        }
        self.levels.pop();
        if self.levels.is_empty() {
            // Root closed: terminate one byte past the closing character.
            return Ok(Some(i + 1));
        }
        Ok(None)
    }

    fn finish_string(
        &mut self,
        span: Span,
        close_quote: usize,
        src: &[u8],
    ) -> Result<Option<usize>, Step> {
        if let Some(level) = self.levels.last_mut() {
            if matches!(level.pos, LevelPos::MapStart | LevelPos::MapNeedKey) {
                if span.is_empty() {
                    return Err(Step::Fail(reason::NON_STRING_KEY, close_quote));
                }
                level.key = span;
                level.pos = LevelPos::MapNeedColon;
                return Ok(None);
            }
        }
        let node = self.result.arena.alloc_str(span);
        self.attach(node, close_quote, src)?;
        Ok(self.root_scalar_length(close_quote + 1))
    }

    fn finish_keyword(
        &mut self,
        keyword: Keyword,
        last_byte: usize,
        src: &[u8],
    ) -> Result<Option<usize>, Step> {
        let node = match keyword {
            Keyword::Null => self.result.arena.alloc_null(),
            Keyword::Bool(v) => self.result.arena.alloc_bool(v),
        };
        self.attach(node, last_byte, src)?;
        Ok(self.root_scalar_length(last_byte + 1))
    }

    fn finish_number(
        &mut self,
        num: &NumberLex,
        delimiter: usize,
        src: &[u8],
    ) -> Result<Option<usize>, Step> {
        if num.digits == 0 || (num.in_exponent && num.exponent_digits == 0) {
            return Err(Step::Fail(reason::CANNOT_PARSE_NUMBER, num.start));
        }

        let node = if num.digits > 18 {
            // Too many significant digits to reconstruct exactly; the
            // standard library parser takes over.
            let lexeme = &src[num.start..delimiter];
            let parsed = std::str::from_utf8(lexeme)
                .ok()
                .and_then(|s| s.parse::<f64>().ok());
            match parsed {
                Some(v) => self.result.arena.alloc_double(v),
                None => return Err(Step::Fail(reason::CANNOT_PARSE_NUMBER, num.start)),
            }
        } else if !num.seen_point && !num.in_exponent {
            let mut v = num.mantissa as i64;
            if num.negative {
                v = -v;
            }
            self.result.arena.alloc_long(v)
        } else {
            let exponent = if num.exponent_negative {
                -num.exponent
            } else {
                num.exponent
            };
            let scale = exponent - num.frac_digits as i32;
            let m = num.mantissa as f64;
            let mut v = if scale >= 0 {
                m * pow10(scale)
            } else {
                m / pow10(-scale)
            };
            if num.negative {
                v = -v;
            }
            self.result.arena.alloc_double(v)
        };

        self.attach(node, delimiter, src)?;
        // The delimiter is not part of the value and is reprocessed.
        Ok(self.root_scalar_length(delimiter))
    }

    /// Hooks a completed value into the current container, or makes it the
    /// root when no container is open.
    fn attach(&mut self, node: NodeId, i: usize, src: &[u8]) -> Result<(), Step> {
        match self.levels.last_mut() {
            None => {
                self.result.root = Some(node);
                Ok(())
            }
            Some(level) => match level.pos {
                LevelPos::ListStart | LevelPos::ListNeedValue => {
                    let list = level.node;
                    level.pos = LevelPos::ListNeedComma;
                    self.result.arena.push_to_list(list, node);
                    Ok(())
                }
                LevelPos::MapNeedValue => {
                    let map = level.node;
                    let key = level.key;
                    level.pos = LevelPos::MapNeedComma;
                    if !self.result.arena.insert_into_map(map, key, node, src) {
                        self.result.arena.recycle(node);
                        return Err(Step::Fail(reason::DUPLICATE_KEY, i));
                    }
                    Ok(())
                }
                _ => {
                    // Guarded by check_value_start; kept as the terminal
                    // state-machine arm.
                    self.result.arena.recycle(node);
                    Err(Step::Fail(reason::CANNOT_ADD_CHILD, i))
                }
            },
        }
    }

    /// When the finished value was the root, the parse terminates with the
    /// given consumed length.
    fn root_scalar_length(&self, len: usize) -> Option<usize> {
        if self.levels.is_empty() {
            Some(len)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Keyword {
    Null,
    Bool(bool),
}

const POW10: [f64; 19] = [
    1e0, 1e1, 1e2, 1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9, 1e10, 1e11, 1e12, 1e13, 1e14, 1e15, 1e16,
    1e17, 1e18,
];

fn pow10(exp: i32) -> f64 {
    if (0..=18).contains(&exp) {
        POW10[exp as usize]
    } else {
        10f64.powi(exp)
    }
}
