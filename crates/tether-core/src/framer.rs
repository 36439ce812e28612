//! Delimiter framing ("gather").
//!
//! A [`Framer`] turns an unbounded byte stream into discrete messages. Bytes
//! are appended to a carry-over buffer; every segment terminated by the
//! delimiter is emitted and the trailing, not yet terminated, segment is kept
//! for the next push. The framer works on bytes so that a multi-byte UTF-8
//! character split across two reads is reassembled before it is decoded.
//!
//! # Example
//!
//! ```
//! use tether_core::{Delimiter, Framer};
//!
//! let mut framer = Framer::new(&Delimiter::text("\r\n"), false).unwrap();
//! let mut out = Vec::new();
//! for chunk in ["DEV", "I", "CE get version\r\n"] {
//!     framer.push(chunk.as_bytes(), &mut out).unwrap();
//! }
//! assert_eq!(out, vec!["DEVICE get version".to_string()]);
//! ```

use regex::bytes::Regex;
use regex_syntax::ParserBuilder;
use regex_syntax::hir::literal::Extractor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upper bound for the carry-over buffer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// How messages are separated on the wire.
///
/// In TOML this is an inline table, e.g. `delimiter = { text = "\r\n" }` or
/// `delimiter = { pattern = "\\r?\\n" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    /// A single character.
    Char(char),
    /// A literal string.
    Text(String),
    /// Any of several literal strings; the earliest match in the buffer wins.
    AnyOf(Vec<String>),
    /// A regular expression.
    Pattern(String),
}

impl Delimiter {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn pattern(s: impl Into<String>) -> Self {
        Self::Pattern(s.into())
    }

    /// What a sender appends to end one message: the character or text, the
    /// first `AnyOf` alternative, or `"\n"` for a pattern.
    pub fn terminator(&self) -> String {
        match self {
            Self::Char(c) => c.to_string(),
            Self::Text(s) => s.clone(),
            Self::AnyOf(list) => list.first().cloned().unwrap_or_else(|| "\n".to_string()),
            Self::Pattern(_) => "\n".to_string(),
        }
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::Char('\n')
    }
}

/// Framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramerError {
    /// The delimiter is empty and would match everywhere.
    #[error("delimiter must not be empty")]
    EmptyDelimiter,

    /// The regular expression did not compile.
    #[error("invalid delimiter pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// No delimiter arrived before the carry-over buffer reached its bound.
    /// The partial message was discarded.
    #[error("discarded {len} undelimited bytes (limit {max})")]
    Overflow { len: usize, max: usize },
}


/// A delimited message as found on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message text without the delimiter.
    pub body: String,
    /// The delimiter text that ended it.
    pub delimiter: String,
}

impl Frame {
    pub fn into_message(self, include_delimiter: bool) -> String {
        if include_delimiter {
            self.body + &self.delimiter
        } else {
            self.body
        }
    }
}

/// Compiled form of a [`Delimiter`].
#[derive(Debug, Clone)]
enum Matcher {
    Literals(Vec<Vec<u8>>),
    Pattern { regex: Regex, lookahead: Lookahead },
}

/// What a pattern match at the end of the buffer could still turn into.
#[derive(Debug, Clone)]
enum Lookahead {
    /// The pattern matches exactly this finite set of strings.
    Literals(Vec<Vec<u8>>),
    /// Matches are at most this long.
    Within(usize),
    Unbounded,
}

impl Matcher {
    fn compile(delimiter: &Delimiter) -> Result<Self, FramerError> {
        let literals = match delimiter {
            Delimiter::Char(c) => vec![c.to_string().into_bytes()],
            Delimiter::Text(s) => vec![s.as_bytes().to_vec()],
            Delimiter::AnyOf(list) => list.iter().map(|s| s.as_bytes().to_vec()).collect(),
            Delimiter::Pattern(p) => return Self::compile_pattern(p),
        };
        if literals.is_empty() || literals.iter().any(|l| l.is_empty()) {
            return Err(FramerError::EmptyDelimiter);
        }
        Ok(Self::Literals(literals))
    }

    fn compile_pattern(pattern: &str) -> Result<Self, FramerError> {
        let invalid = |reason: String| FramerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };
        let regex = Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
        if regex.is_match(b"") {
            return Err(FramerError::EmptyDelimiter);
        }

        let hir = ParserBuilder::new()
            .utf8(false)
            .build()
            .parse(pattern)
            .map_err(|e| invalid(e.to_string()))?;
        let seq = Extractor::new().extract(&hir);
        let lookahead = match seq.literals() {
            Some(literals) if seq.is_exact() => {
                Lookahead::Literals(literals.iter().map(|l| l.as_bytes().to_vec()).collect())
            }
            _ => match hir.properties().maximum_len() {
                Some(max) => Lookahead::Within(max),
                None => Lookahead::Unbounded,
            },
        };
        Ok(Self::Pattern { regex, lookahead })
    }

    /// Earliest delimiter occurrence in `haystack` as `(start, end)`.
    fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        match self {
            Self::Literals(literals) => literals
                .iter()
                .filter_map(|lit| find_bytes(haystack, lit).map(|at| (at, at + lit.len())))
                // Earliest start; on a tie the longer delimiter wins so that
                // "\r\n" beats "\r".
                .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1))),
            Self::Pattern { regex, .. } => regex.find(haystack).map(|m| (m.start(), m.end())),
        }
    }

    /// Whether a match found at `start..end` stays the same however the
    /// stream continues. Otherwise it is held until more bytes arrive.
    fn settled(&self, haystack: &[u8], start: usize, end: usize) -> bool {
        match self {
            Self::Literals(literals)
            | Self::Pattern {
                lookahead: Lookahead::Literals(literals),
                ..
            } => !literals.iter().any(|lit| open_prefix(lit, haystack, start)),
            Self::Pattern {
                lookahead: Lookahead::Within(max),
                ..
            } => haystack.len() - start >= *max,
            Self::Pattern {
                lookahead: Lookahead::Unbounded,
                ..
            } => end < haystack.len(),
        }
    }
}

/// Whether `literal` could still match at or before `start` once more bytes
/// arrive, i.e. some tail `haystack[p..]` with `p <= start` is a proper
/// prefix of it.
fn open_prefix(literal: &[u8], haystack: &[u8], start: usize) -> bool {
    let from = haystack.len().saturating_sub(literal.len().saturating_sub(1));
    (from..=start).any(|p| literal.starts_with(&haystack[p..]))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Splits a byte stream into delimited messages.
#[derive(Debug, Clone)]
pub struct Framer {
    matcher: Matcher,
    include_delimiter: bool,
    max_len: usize,
    buffer: Vec<u8>,
}

impl Framer {
    /// Build a framer. Fails if the delimiter is empty or an invalid pattern.
    pub fn new(delimiter: &Delimiter, include_delimiter: bool) -> Result<Self, FramerError> {
        Ok(Self {
            matcher: Matcher::compile(delimiter)?,
            include_delimiter,
            max_len: DEFAULT_MAX_FRAME_LEN,
            buffer: Vec::new(),
        })
    }

    /// Bound the carry-over buffer.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    pub fn include_delimiter(&self) -> bool {
        self.include_delimiter
    }

    /// Append `data` and move every complete message into `out`, in order.
    ///
    /// Adjacent delimiters produce empty messages. If the remaining partial
    /// message is longer than the configured bound it is dropped and
    /// [`FramerError::Overflow`] is returned; messages completed by this push
    /// are still in `out`.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<String>) -> Result<(), FramerError> {
        let include = self.include_delimiter;
        self.scan(data, |frame| out.push(frame.into_message(include)))
    }

    /// Like [`Framer::push`], but keeps body and delimiter apart.
    pub fn push_frames(&mut self, data: &[u8], out: &mut Vec<Frame>) -> Result<(), FramerError> {
        self.scan(data, |frame| out.push(frame))
    }

    fn scan(&mut self, data: &[u8], mut emit: impl FnMut(Frame)) -> Result<(), FramerError> {
        self.buffer.extend_from_slice(data);

        let mut consumed = 0;
        while let Some((start, end)) = self.matcher.find(&self.buffer[consumed..]) {
            let rest = &self.buffer[consumed..];
            if !self.matcher.settled(rest, start, end) {
                break;
            }
            emit(Frame {
                body: String::from_utf8_lossy(&rest[..start]).into_owned(),
                delimiter: String::from_utf8_lossy(&rest[start..end]).into_owned(),
            });
            consumed += end;
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_len {
            let len = self.buffer.len();
            self.buffer.clear();
            return Err(FramerError::Overflow {
                len,
                max: self.max_len,
            });
        }
        Ok(())
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop any partial message, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
