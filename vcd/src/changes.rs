//! The value change section: a byte at a time state machine that turns
//! `#<time>`, `<state><id>` and `b<digits> <id>` lines into time markers and
//! signal changes.
//!
//! The parser keeps all its state between calls to `feed()` so input can be
//! given to it in arbitrary pieces: a whole file, a byte range of one, or
//! whatever a simulator has appended since the last look.

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use log::debug;
use typed_index_collections::TiVec;

use crate::{
    options::{CancelToken, Outcome, ParseOptions},
    signal::{CodeMap, Signal, SignalId},
    times::{TimeAxis, TimeIndex},
    valvec::{encode_logic, Value},
};

/// Where parsed time markers and changes go.
pub trait ChangeSink {
    /// Number of time markers so far. New changes belong to the last one.
    fn time_count(&self) -> usize;

    fn push_time(&mut self, time: u64) -> Result<()>;

    fn push_change(&mut self, signal: SignalId, index: TimeIndex, value: Value);
}

/// Writes straight into a dump's time axis and signals.
pub(crate) struct StoreSink<'a> {
    pub times: &'a mut TimeAxis,
    pub signals: &'a mut TiVec<SignalId, Signal>,
}

impl ChangeSink for StoreSink<'_> {
    fn time_count(&self) -> usize {
        self.times.len()
    }

    fn push_time(&mut self, time: u64) -> Result<()> {
        self.times.push(time).map(|_| ())
    }

    fn push_change(&mut self, signal: SignalId, index: TimeIndex, value: Value) {
        self.signals[signal].changes.push(index, value);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Record {
    Scalar,
    VectorDigits,
    VectorId,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    ReadingTime,
    ReadingSignal(Record),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Feed {
    Continue,
    Cancelled,
}

#[derive(Debug)]
pub struct ChangeParser {
    state: State,
    prev: u8,

    time: u64,
    time_has_digits: bool,
    /// Changes are ignored until there is a time to attach them to.
    time_seen: bool,

    scalar: u8,
    digits: Vec<u8>,
    code: Vec<u8>,

    consumed: u64,
    committed: u64,
    unknown_codes: u64,
}

impl ChangeParser {
    /// `time_seen` should be true when continuing a dump that already has time
    /// markers, so that changes before the next marker are kept.
    pub fn new(time_seen: bool) -> Self {
        Self {
            state: State::Idle,
            // Input always starts at the start of a line.
            prev: b'\n',
            time: 0,
            time_has_digits: false,
            time_seen,
            scalar: 0,
            digits: Vec::new(),
            code: Vec::new(),
            consumed: 0,
            committed: 0,
            unknown_codes: 0,
        }
    }

    /// Bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes up to and including the last newline. Everything before this has
    /// been fully handled; anything after it may be a partial record.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Number of changes dropped because their id code wasn't declared.
    pub fn unknown_codes(&self) -> u64 {
        self.unknown_codes
    }

    /// Records are only handed to `sink` when their `\n` arrives, so
    /// everything the sink has seen is covered by `committed()`. A `\r`
    /// before the `\n` is skipped like other blanks.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        codes: &CodeMap,
        sink: &mut impl ChangeSink,
        cancel: &CancelToken,
    ) -> Result<Feed> {
        for &c in bytes {
            if cancel.is_cancelled() {
                return Ok(Feed::Cancelled);
            }

            self.consumed += 1;

            match self.state {
                State::Idle => {
                    if self.prev == b'\n' {
                        self.start_record(c);
                    }
                }
                State::ReadingTime => match c {
                    b'0'..=b'9' => {
                        self.time = self
                            .time
                            .checked_mul(10)
                            .and_then(|t| t.checked_add((c - b'0') as u64))
                            .context("Time marker doesn't fit in 64 bits")?;
                        self.time_has_digits = true;
                    }
                    b'\n' => {
                        if self.time_has_digits {
                            sink.push_time(self.time)?;
                            self.time_seen = true;
                        }
                        self.state = State::Idle;
                    }
                    b' ' | b'\t' | b'\r' => {}
                    _ => {
                        bail!(
                            "Invalid character {:?} in time marker #{} (byte {} of the value section)",
                            c as char,
                            self.time,
                            self.consumed - 1
                        );
                    }
                },
                State::ReadingSignal(Record::Scalar) => match c {
                    b'\n' => {
                        self.commit(Value::Scalar(self.scalar), codes, sink);
                        self.state = State::Idle;
                    }
                    b' ' | b'\t' | b'\r' => {}
                    _ => self.code.push(c),
                },
                State::ReadingSignal(Record::VectorDigits) => match c {
                    b' ' | b'\t' => self.state = State::ReadingSignal(Record::VectorId),
                    // No id; nothing to do with it.
                    b'\n' => self.state = State::Idle,
                    b'\r' => {}
                    _ => self.digits.push(encode_logic(c)),
                },
                State::ReadingSignal(Record::VectorId) => match c {
                    b'\n' => {
                        let value = Value::from_vector_digits(&self.digits);
                        self.commit(value, codes, sink);
                        self.state = State::Idle;
                    }
                    b' ' | b'\t' | b'\r' => {}
                    _ => self.code.push(c),
                },
            }

            if c == b'\n' {
                self.committed = self.consumed;
            }
            self.prev = c;
        }
        Ok(Feed::Continue)
    }

    fn start_record(&mut self, c: u8) {
        match c {
            b'#' => {
                self.time = 0;
                self.time_has_digits = false;
                self.state = State::ReadingTime;
            }
            b'0' | b'1' | b'x' | b'X' | b'z' | b'Z' | b'U' | b'W' | b'L' | b'H' | b'-'
                if self.time_seen =>
            {
                self.scalar = encode_logic(c);
                self.code.clear();
                self.state = State::ReadingSignal(Record::Scalar);
            }
            b'b' | b'B' if self.time_seen => {
                self.digits.clear();
                self.code.clear();
                self.state = State::ReadingSignal(Record::VectorDigits);
            }
            _ => {}
        }
    }

    fn commit(&mut self, value: Value, codes: &CodeMap, sink: &mut impl ChangeSink) {
        match (codes.get(self.code.as_slice()), sink.time_count().checked_sub(1)) {
            (Some(&signal), Some(index)) => sink.push_change(signal, TimeIndex(index), value),
            (None, _) => self.unknown_codes += 1,
            (Some(_), None) => {}
        }
        self.code.clear();
    }
}

/// Reports percentages about every 1% of the expected input.
struct ProgressMeter {
    total: u64,
    step: u64,
    next: u64,
}

impl ProgressMeter {
    fn new(total: u64) -> Self {
        let step = (total / 100).max(1);
        Self {
            total,
            step,
            next: step,
        }
    }

    fn update(&mut self, done: u64) -> Option<u8> {
        if self.total == 0 || done < self.next {
            return None;
        }
        self.next = done + self.step;
        Some((done.saturating_mul(100) / self.total).min(99) as u8)
    }
}

/// Run the parser over a reader until it is exhausted or cancelled.
/// `expected_len`, if known, is used for progress reports.
pub(crate) fn read_changes<R: BufRead, S: ChangeSink>(
    reader: &mut R,
    parser: &mut ChangeParser,
    codes: &CodeMap,
    sink: &mut S,
    options: &ParseOptions,
    partition: usize,
    expected_len: Option<u64>,
) -> Result<Outcome> {
    let start = parser.consumed();
    let mut meter = expected_len.map(ProgressMeter::new);

    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let n = buf.len();
        let feed = parser.feed(buf, codes, sink, &options.cancel)?;
        reader.consume(n);

        if feed == Feed::Cancelled {
            debug!(
                "Partition {partition} cancelled after {} bytes",
                parser.consumed() - start
            );
            return Ok(Outcome::Cancelled);
        }

        if let Some(percent) = meter
            .as_mut()
            .and_then(|m| m.update(parser.consumed() - start))
        {
            options.report(partition, percent);
        }
    }

    if parser.unknown_codes() > 0 {
        debug!(
            "Partition {partition}: skipped {} changes to undeclared signals",
            parser.unknown_codes()
        );
    }

    options.report(partition, 100);
    Ok(Outcome::Completed)
}
