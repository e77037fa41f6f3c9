//! Following a dump that a simulator is still writing.
//!
//! `Tail::poll()` reads whatever has been appended since the last call and
//! hands back the complete lines as a `ChangeBatch`; a record that is only
//! half written stays inside the parser until the rest of it arrives.
//! `Tail::spawn()` runs the polling on a thread and delivers batches over a
//! channel.

use std::{
    fs::File,
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, info};

use crate::{
    changes::{ChangeParser, ChangeSink, Feed},
    options::CancelToken,
    signal::{CodeMap, SignalId},
    times::TimeIndex,
    valvec::Value,
    vcd::Vcd,
};

/// How far from the end `find_last_time()` looks for a time marker.
pub const DEFAULT_BACK_OFFSET: u64 = 1000;

/// Everything committed by one `Tail::poll()`. Time indices are global, so
/// the batch can be applied directly with `Vcd::apply()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Index that `times[0]` gets once applied.
    pub first_index: TimeIndex,
    pub times: Vec<u64>,
    pub changes: Vec<(SignalId, TimeIndex, Value)>,
    /// Offset just past the last line in this batch.
    pub committed_end: u64,
}

struct BatchSink<'a> {
    base: usize,
    last_time: Option<u64>,
    batch: &'a mut ChangeBatch,
}

impl ChangeSink for BatchSink<'_> {
    fn time_count(&self) -> usize {
        self.base + self.batch.times.len()
    }

    fn push_time(&mut self, time: u64) -> Result<()> {
        if let Some(last) = self.batch.times.last().copied().or(self.last_time) {
            if time < last {
                bail!("Time went backwards from #{last} to #{time}");
            }
        }
        self.batch.times.push(time);
        Ok(())
    }

    fn push_change(&mut self, signal: SignalId, index: TimeIndex, value: Value) {
        self.batch.changes.push((signal, index, value));
    }
}

pub struct Tail {
    path: PathBuf,
    file: File,
    codes: CodeMap,
    parser: ChangeParser,
    /// File offset of the parser's first byte.
    start: u64,
    time_count: usize,
    last_time: Option<u64>,
    committed_end: u64,
    cancel: CancelToken,
}

impl Tail {
    /// Follow `path` from where `vcd` stopped reading it.
    pub fn new(path: &Path, vcd: &Vcd) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        Ok(Self {
            path: path.to_owned(),
            file,
            codes: vcd.signals.codes().clone(),
            parser: ChangeParser::new(!vcd.times.is_empty()),
            start: vcd.committed_end,
            time_count: vcd.times.len(),
            last_time: vcd.times.last(),
            committed_end: vcd.committed_end,
            cancel: CancelToken::new(),
        })
    }

    pub fn committed_end(&self) -> u64 {
        self.committed_end
    }

    /// Read everything appended since the last poll. Returns `None` if no
    /// new line was completed.
    pub fn poll(&mut self) -> Result<Option<ChangeBatch>> {
        let len = self.file.metadata()?.len();
        let offset = self.start + self.parser.consumed();
        if len < offset {
            bail!(
                "{} shrank to {len} bytes while being followed (read up to {offset})",
                self.path.display()
            );
        }
        if len == offset {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new((&self.file).take(len - offset));

        let mut batch = ChangeBatch {
            first_index: TimeIndex(self.time_count),
            times: Vec::new(),
            changes: Vec::new(),
            committed_end: self.committed_end,
        };
        let mut sink = BatchSink {
            base: self.time_count,
            last_time: self.last_time,
            batch: &mut batch,
        };

        loop {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let n = buf.len();
            let feed = self.parser.feed(buf, &self.codes, &mut sink, &self.cancel)?;
            reader.consume(n);
            if feed == Feed::Cancelled {
                break;
            }
        }

        let committed_end = self.start + self.parser.committed();
        if committed_end == self.committed_end {
            return Ok(None);
        }

        batch.committed_end = committed_end;
        self.committed_end = committed_end;
        self.time_count += batch.times.len();
        self.last_time = batch.times.last().copied().or(self.last_time);

        debug!(
            "{}: {} new times and {} changes up to byte {committed_end}",
            self.path.display(),
            batch.times.len(),
            batch.changes.len()
        );
        Ok(Some(batch))
    }

    /// Poll on a new thread, sleeping `poll_interval` whenever there is
    /// nothing new. Stops on the first error (which is sent), when `cancel`
    /// fires, or when a batch can't be sent because the receiver is gone.
    pub fn spawn(mut self, poll_interval: Duration, cancel: CancelToken) -> Receiver<Result<ChangeBatch>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.cancel = cancel.clone();

        thread::spawn(move || {
            info!("Following {}", self.path.display());
            while !cancel.is_cancelled() {
                match self.poll() {
                    Ok(Some(batch)) => {
                        if tx.send(Ok(batch)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => thread::sleep(poll_interval),
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
            info!("Stopped following {}", self.path.display());
        });

        rx
    }
}

/// The last `#<time>` within `back_offset` bytes of the end, without parsing
/// anything else. Only complete lines count.
pub fn last_time(reader: &mut (impl Read + Seek), back_offset: u64) -> Result<Option<u64>> {
    let len = reader.seek(SeekFrom::End(0))?;
    let from = len.saturating_sub(back_offset);
    reader.seek(SeekFrom::Start(from))?;

    let mut window = Vec::new();
    reader.take(len - from).read_to_end(&mut window)?;

    let complete = match window.iter().rposition(|&c| c == b'\n') {
        Some(i) => &window[..i],
        None => return Ok(None),
    };

    Ok(String::from_utf8_lossy(complete)
        .lines()
        .rev()
        .filter_map(|line| line.strip_prefix('#'))
        .find_map(|time| time.trim().parse().ok()))
}

pub fn find_last_time(path: &Path) -> Result<Option<u64>> {
    let mut f = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    last_time(&mut f, DEFAULT_BACK_OFFSET)
}
