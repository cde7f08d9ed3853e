// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Quote and escape aware line splitting.
//!
//! Raw chunks from a sender are appended to a [`LineBuffer`] which scans them incrementally and
//! cuts complete messages at line terminators (`\n` or `\r\n`). A terminator only counts as a
//! boundary when it is outside any quoted span and not escaped by a backslash, so a quoted field
//! may carry raw line breaks. Emitted text is never altered: quotes and escape markers stay in
//! the output exactly as received.
//!
//! The scanner itself is the pure [`transition`] function over [`ScanState`]; the buffer only
//! records where quotes opened and where boundaries fell.
//!
//! ```text
//!  chunk ──> buf: [ emitted | emitted |  pending tail  ]
//!                            ^start    ^scanned      ^len
//! ```

use std::borrow::Cow;
use std::ops::Range;

use tracing::warn;

use crate::errors::TokenizeError;

/// Quote context of the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuoteState {
    #[default]
    None,
    InSingleQuote,
    InDoubleQuote,
}

/// Scanner state carried from one byte (and one chunk) to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanState {
    pub quote: QuoteState,
    /// The previous byte was an unconsumed backslash.
    pub escape_pending: bool,
    // The previous byte was a bare, unquoted `\r`, so a `\n` now closes a `\r\n` terminator.
    after_cr: bool,
}

/// What a single byte did to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Content,
    QuoteOpened,
    QuoteClosed,
    /// A message boundary. `crlf` is set when the preceding `\r` belongs to the terminator.
    Boundary { crlf: bool },
}

/// Advances the scanner over one byte.
///
/// All delimiters are ASCII so scanning UTF-8 text byte-wise is safe: none of them can occur
/// inside a multi-byte sequence.
#[must_use]
pub fn transition(state: ScanState, byte: u8) -> (ScanState, Transition) {
    let escaped = state.escape_pending;
    let mut next = ScanState {
        quote: state.quote,
        escape_pending: false,
        after_cr: false,
    };

    let outcome = match byte {
        b'\\' => {
            next.escape_pending = !escaped;
            Transition::Content
        }
        _ if escaped => Transition::Content,
        b'"' | b'\'' => match (state.quote, byte) {
            (QuoteState::None, b'"') => {
                next.quote = QuoteState::InDoubleQuote;
                Transition::QuoteOpened
            }
            (QuoteState::None, _) => {
                next.quote = QuoteState::InSingleQuote;
                Transition::QuoteOpened
            }
            (QuoteState::InDoubleQuote, b'"') | (QuoteState::InSingleQuote, b'\'') => {
                next.quote = QuoteState::None;
                Transition::QuoteClosed
            }
            // the other quote kind inside a quote is plain content
            _ => Transition::Content,
        },
        b'\r' if state.quote == QuoteState::None => {
            next.after_cr = true;
            Transition::Content
        }
        b'\n' if state.quote == QuoteState::None => Transition::Boundary {
            crlf: state.after_cr,
        },
        _ => Transition::Content,
    };

    (next, outcome)
}

/// Per-sender reassembly buffer.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    // first byte of the message currently being accumulated
    start: usize,
    // first byte not yet fed through `transition`
    scanned: usize,
    state: ScanState,
    // position of the opening quote while `state.quote` is not `None`
    quote_opened_at: Option<usize>,
    // trailing bytes of an incomplete UTF-8 sequence, completed by the next chunk
    utf8_tail: usize,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending (not yet emitted) bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Appends a chunk and returns every message it completed, in order.
    ///
    /// When the pending tail grows beyond `max_size` bytes it is cut at that size (backed off to
    /// a character boundary and never between a CRLF pair), any open quote is abandoned and the
    /// rest is scanned again.
    ///
    /// A chunk that is not valid UTF-8 is rejected whole and the buffer is left exactly as it
    /// was. A multi-byte character may still be split across chunks.
    pub fn push(&mut self, chunk: &[u8], max_size: usize) -> Result<Vec<String>, TokenizeError> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }

        let appended_at = self.buf.len();
        let check_from = appended_at - self.utf8_tail;
        self.buf.extend_from_slice(chunk);

        match std::str::from_utf8(&self.buf[check_from..]) {
            Ok(_) => self.utf8_tail = 0,
            // only the end of the chunk is cut short
            Err(e) if e.error_len().is_none() => {
                self.utf8_tail = self.buf.len() - check_from - e.valid_up_to();
            }
            Err(e) => {
                self.buf.truncate(appended_at);
                return Err(TokenizeError::InvalidUtf8 {
                    offset: (check_from + e.valid_up_to()).saturating_sub(appended_at),
                });
            }
        }

        let mut cuts = Vec::new();
        self.scan(&mut cuts);
        self.enforce_size(max_size.max(1), &mut cuts);

        let messages = cuts.into_iter().map(|range| self.decode(range)).collect();
        self.compact();
        Ok(messages)
    }

    /// Emits everything still pending, whether or not it is terminated.
    ///
    /// A quote that never closed is treated as a literal character, so terminators that only
    /// looked quoted still split the remainder. Whatever follows the last boundary is emitted
    /// as one final message. The buffer is empty afterwards.
    pub fn flush(&mut self) -> Vec<String> {
        let mut cuts = Vec::new();
        self.scan(&mut cuts);

        while let Some(opened_at) = self.quote_opened_at.take() {
            self.state = ScanState::default();
            self.scanned = opened_at + 1;
            self.scan(&mut cuts);
        }

        if self.start < self.buf.len() {
            cuts.push(self.start..self.buf.len());
        }

        let messages = cuts.into_iter().map(|range| self.decode(range)).collect();
        self.clear();
        messages
    }

    /// Drops all pending data and resets the scanner.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        self.state = ScanState::default();
        self.quote_opened_at = None;
        self.utf8_tail = 0;
    }

    fn scan(&mut self, cuts: &mut Vec<Range<usize>>) {
        let mut state = self.state;
        for i in self.scanned..self.buf.len() {
            let (next, outcome) = transition(state, self.buf[i]);
            state = next;
            match outcome {
                Transition::Content => {}
                Transition::QuoteOpened => self.quote_opened_at = Some(i),
                Transition::QuoteClosed => self.quote_opened_at = None,
                Transition::Boundary { crlf } => {
                    let end = if crlf { i - 1 } else { i };
                    cuts.push(self.start..end);
                    self.start = i + 1;
                }
            }
        }
        self.state = state;
        self.scanned = self.buf.len();
    }

    fn enforce_size(&mut self, max_size: usize, cuts: &mut Vec<Range<usize>>) {
        while self.len() > max_size {
            let Some(cut) = self.segment_end(self.start + max_size) else {
                // a single character wider than the limit, still incomplete
                break;
            };
            cuts.push(self.start..cut);
            self.start = cut;
            self.state = ScanState::default();
            self.quote_opened_at = None;
            self.scanned = cut;
            self.scan(cuts);
        }
    }

    // End of a forced segment at or before `limit`. Never splits a character or a `\r\n`;
    // a character wider than the limit is kept whole instead.
    fn segment_end(&self, limit: usize) -> Option<usize> {
        let mut cut = limit;
        while cut > self.start && is_continuation(self.buf[cut]) {
            cut -= 1;
        }
        if cut == self.start {
            cut = limit;
            while cut < self.buf.len() && is_continuation(self.buf[cut]) {
                cut += 1;
            }
            if cut == self.buf.len() {
                return None;
            }
        }

        if self.buf[cut] == b'\n' && self.buf[cut - 1] == b'\r' {
            if cut - 1 > self.start {
                cut -= 1;
            } else {
                cut += 1;
            }
        }
        (cut < self.buf.len()).then_some(cut)
    }

    fn decode(&self, range: Range<usize>) -> String {
        match String::from_utf8_lossy(&self.buf[range]) {
            Cow::Borrowed(text) => text.to_owned(),
            Cow::Owned(text) => {
                warn!("Replaced incomplete UTF-8 in flushed message");
                text
            }
        }
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.drain(..self.start);
        self.scanned -= self.start;
        if let Some(opened_at) = self.quote_opened_at.as_mut() {
            *opened_at -= self.start;
        }
        self.start = 0;
    }
}

fn is_continuation(byte: u8) -> bool {
    (byte & 0xC0) == 0x80
}
