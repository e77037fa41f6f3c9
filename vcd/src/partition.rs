//! Reading the value change section with several threads.
//!
//! The section is cut into contiguous byte ranges, moved forward to line
//! starts so each record is in exactly one range. Each range is parsed on its
//! own thread into a private time list and private change lists, and the
//! results are then appended to the dump in file order.
//!
//! A range that doesn't start the section begins part way through some time
//! step, so its changes before its first `#` marker belong to the previous
//! range's last time. Those ranges start with a "carry" slot: local time
//! index 0 means "whatever time was current before this range", and the real
//! markers start at local index 1.

use std::{
    fs::File,
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    ops::Range,
    path::Path,
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use typed_index_collections::TiVec;

use crate::{
    changes::{read_changes, ChangeParser, ChangeSink},
    options::{Outcome, ParseOptions},
    signal::{CodeMap, SignalId, SignalRegistry},
    times::{TimeAxis, TimeIndex},
    valvec::{ChangeList, Value},
};

struct PartitionSink {
    carry: bool,
    times: Vec<u64>,
    changes: TiVec<SignalId, ChangeList>,
}

impl ChangeSink for PartitionSink {
    fn time_count(&self) -> usize {
        self.times.len() + self.carry as usize
    }

    fn push_time(&mut self, time: u64) -> Result<()> {
        if let Some(&last) = self.times.last() {
            if time < last {
                bail!("Time went backwards from #{last} to #{time}");
            }
        }
        self.times.push(time);
        Ok(())
    }

    fn push_change(&mut self, signal: SignalId, index: TimeIndex, value: Value) {
        self.changes[signal].push(index, value);
    }
}

struct PartitionResult {
    range: Range<u64>,
    sink: PartitionSink,
    outcome: Outcome,
    /// Relative to `range.start`.
    committed: u64,
}

/// The offset of the first line that starts at or after `pos`. `pos` must be
/// greater than 0. Returns `end` if there is no newline before it.
fn next_line_start(file: &mut File, pos: u64, end: u64) -> Result<u64> {
    let from = pos - 1;
    file.seek(SeekFrom::Start(from))?;
    let mut reader = BufReader::new(file.by_ref().take(end - from));
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    Ok(if line.last() == Some(&b'\n') {
        from + n as u64
    } else {
        end
    })
}

/// Split `start..end` into up to `threads` non-empty ranges that each begin
/// at a line start.
fn partition_ranges(file: &mut File, start: u64, end: u64, threads: usize) -> Result<Vec<Range<u64>>> {
    let part_length = ((end - start) / threads as u64).max(1);

    let mut bounds = vec![start];
    let mut prev = start;
    for i in 1..threads as u64 {
        let guess = start + part_length * i;
        if guess >= end {
            break;
        }
        let bound = next_line_start(file, guess, end)?.max(prev);
        bounds.push(bound);
        prev = bound;
    }
    bounds.push(end);

    Ok(bounds
        .windows(2)
        .map(|w| w[0]..w[1])
        .filter(|r| !r.is_empty())
        .collect())
}

fn read_partition(
    path: &Path,
    index: usize,
    range: Range<u64>,
    carry: bool,
    codes: &CodeMap,
    changes: TiVec<SignalId, ChangeList>,
    options: &ParseOptions,
) -> Result<PartitionResult> {
    let mut file =
        File::open(path).with_context(|| format!("Opening {} for partition {index}", path.display()))?;
    file.seek(SeekFrom::Start(range.start))?;

    let length = range.end - range.start;
    let mut reader = BufReader::new(file.take(length));

    let mut parser = ChangeParser::new(carry);
    let mut sink = PartitionSink {
        carry,
        times: Vec::new(),
        changes,
    };

    let outcome = read_changes(
        &mut reader,
        &mut parser,
        codes,
        &mut sink,
        options,
        index,
        Some(length),
    )
    .with_context(|| format!("Partition {index} (bytes {}..{})", range.start, range.end))?;

    debug!(
        "Partition {index}: bytes {}..{}, {} time markers, {:?}",
        range.start,
        range.end,
        sink.times.len(),
        outcome
    );

    Ok(PartitionResult {
        range,
        sink,
        outcome,
        committed: parser.committed(),
    })
}

/// Append one partition's results, rebasing its local time indices onto the
/// end of `times`.
fn merge(times: &mut TimeAxis, signals: &mut SignalRegistry, part: &PartitionSink) -> Result<()> {
    let base = times.len();
    times.extend_from_slice(&part.times)?;

    for (id, changes) in part.changes.iter_enumerated() {
        let target = &mut signals.signals[id].changes;
        for (local, value) in changes.iter() {
            let global = match (part.carry, local.0) {
                // Belongs to the time before this partition, if there is one.
                (true, 0) => match base.checked_sub(1) {
                    Some(g) => g,
                    None => continue,
                },
                (true, j) => base + j - 1,
                (false, j) => base + j,
            };
            target.push(TimeIndex(global), value);
        }
    }
    Ok(())
}

/// Read the value changes from `start` to the end of the file at `path` using
/// `options.threads` threads, appending them to `times` and `signals`.
///
/// Returns the outcome and the offset just past the last newline that was
/// fully handled. If cancelled, the results are merged up to and including
/// the first partition that didn't finish, so the dump is always a gap free
/// prefix of the file.
pub(crate) fn read_partitioned(
    path: &Path,
    start: u64,
    times: &mut TimeAxis,
    signals: &mut SignalRegistry,
    options: &ParseOptions,
) -> Result<(Outcome, u64)> {
    let mut file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    let end = file.metadata()?.len();
    if end <= start {
        return Ok((Outcome::Completed, start));
    }

    let ranges = partition_ranges(&mut file, start, end, options.threads.max(1))?;
    info!(
        "Reading {} bytes of value changes in {} partitions",
        end - start,
        ranges.len()
    );

    // Continuing a dump that already has times; the start carries too.
    let resuming = !times.is_empty();

    let registry: &SignalRegistry = signals;
    let results: Vec<Result<PartitionResult>> = thread::scope(|s| {
        let handles: Vec<_> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let carry = range.start != start || resuming;
                let codes = registry.codes();
                let changes = registry.empty_changes();
                s.spawn(move || read_partition(path, index, range, carry, codes, changes, options))
            })
            .collect();

        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("Partition thread panicked")))
            })
            .collect()
    });

    let mut committed_end = start;
    for result in results {
        let part = result?;
        merge(times, signals, &part.sink)?;
        committed_end = part.range.start + part.committed;
        if part.outcome == Outcome::Cancelled {
            return Ok((Outcome::Cancelled, committed_end));
        }
    }

    Ok((Outcome::Completed, committed_end))
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeSet, io::Write};

    use super::*;
    use crate::{
        options::{CancelToken, Progress},
        vcd::Vcd,
    };

    fn logging_setup() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
    }

    /// A dump with a few thousand time steps and a mix of record types,
    /// including steps with no changes and repeated times.
    fn generated_dump() -> String {
        let mut text = String::from(
            "$timescale 1 ps $end
$scope module tb $end
$var reg 1 ! clk $end
$var integer 32 \" count $end
$scope module dut $end
$var wire 4 #a bus $end
$var reg 1 $$ flag $end
$upscope $end
$upscope $end
$enddefinitions $end
$dumpvars
0!
b0 \"
$end
",
        );
        for t in 0..3000u64 {
            text.push_str(&format!("#{}\n", t / 2 * 5));
            if t % 13 == 0 {
                continue;
            }
            if t % 7 != 0 {
                text.push_str(&format!("{}!\n", t % 2));
            }
            text.push_str(&format!("b{:b} \"\n", t));
            if t % 3 == 0 {
                text.push_str(&format!("b{:04b} #a\n", t % 16));
            }
            if t % 11 == 0 {
                text.push_str("x$$\n");
            } else if t % 5 == 0 {
                text.push_str("b1x0z #a\n");
            }
        }
        text
    }

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn load(path: &Path, threads: usize) -> Vcd {
        let options = ParseOptions {
            threads,
            ..Default::default()
        };
        Vcd::load(path, &options).unwrap()
    }

    #[test]
    fn test_partitioned_matches_single_threaded() {
        logging_setup();

        let file = write_temp(&generated_dump());
        let single = load(file.path(), 1);
        single.validate().unwrap();
        assert_eq!(single.times.len(), 3000);

        for threads in [2, 3, 4, 7, 16] {
            let multi = load(file.path(), threads);
            multi.validate().unwrap();

            assert_eq!(multi.times, single.times, "{threads} threads");
            assert_eq!(multi.committed_end, single.committed_end);
            for (id, signal) in single.signals.iter() {
                let expected: Vec<_> = signal.timed_changes(&single.times).collect();
                let actual: Vec<_> = multi.signals[id].timed_changes(&multi.times).collect();
                assert_eq!(actual, expected, "signal {} with {threads} threads", signal.name);
            }
        }
    }

    #[test]
    fn test_boundaries_are_line_starts() {
        let text = "#0\n1!\n#10\nb101 \"\n#20\n0!\n";
        let file = write_temp(text);
        let mut f = File::open(file.path()).unwrap();
        let len = text.len() as u64;

        let ranges = partition_ranges(&mut f, 0, len, 4).unwrap();
        assert_eq!(ranges.first().unwrap().start, 0);
        assert_eq!(ranges.last().unwrap().end, len);
        for r in &ranges {
            assert!(r.start == 0 || text.as_bytes()[r.start as usize - 1] == b'\n');
        }
        for w in ranges.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }

        // Exactly on a line start stays put.
        assert_eq!(next_line_start(&mut f, 3, len).unwrap(), 3);
        assert_eq!(next_line_start(&mut f, 4, len).unwrap(), 6);
        // No newline before the end.
        assert_eq!(next_line_start(&mut f, 1, 2).unwrap(), 2);
    }

    #[test]
    fn test_more_threads_than_lines() {
        let text = "$var reg 1 ! clk $end $enddefinitions $end\n#0\n1!\n#1\n0!\n";
        let file = write_temp(text);
        let vcd = load(file.path(), 64);
        vcd.validate().unwrap();
        assert_eq!(vcd.times.as_slice(), &[0, 1]);
        let clk = vcd.signals.by_code("!").unwrap();
        assert_eq!(
            clk.timed_changes(&vcd.times).collect::<Vec<_>>(),
            vec![(0, Value::Scalar(1)), (1, Value::Scalar(0))]
        );
    }

    #[test]
    fn test_carry_into_empty_axis_is_dropped() {
        // The first partition has no time marker, so changes in the second
        // partition before its first marker have nothing to attach to.
        let mut times = TimeAxis::new();
        let part = PartitionSink {
            carry: true,
            times: vec![7],
            changes: vec![{
                let mut c = ChangeList::new(crate::valvec::Storage::Scalar);
                c.push(TimeIndex(0), Value::Scalar(1));
                c.push(TimeIndex(1), Value::Scalar(0));
                c
            }]
            .into(),
        };
        let mut signals = SignalRegistry::new();
        signals
            .insert(crate::signal::Signal::new(
                "!".into(),
                "clk".to_owned(),
                crate::signal::SignalKind::Reg,
                1,
                crate::hierarchy::ScopeId(0),
            ))
            .unwrap();

        merge(&mut times, &mut signals, &part).unwrap();
        assert_eq!(times.as_slice(), &[7]);
        assert_eq!(
            signals[SignalId(0)].changes.iter().collect::<Vec<_>>(),
            vec![(TimeIndex(0), Value::Scalar(0))]
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let file = write_temp(&generated_dump());
        let options = ParseOptions {
            threads: 4,
            cancel: CancelToken::new(),
            ..Default::default()
        };
        let mut vcd = Vcd::load_definitions(file.path(), &options).unwrap();
        options.cancel.cancel();
        let outcome = vcd.read_changes_from_path(file.path(), &options).unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(vcd.times.is_empty());
        assert_eq!(vcd.committed_end, vcd.definition_end);
        vcd.validate().unwrap();
    }

    #[test]
    fn test_cancelled_while_reading() {
        logging_setup();

        let text = generated_dump();
        let file = write_temp(&text);
        let single = load(file.path(), 1);

        // Every progress report waits for the receiver, so the first
        // partition can't get more than a buffer further once it has
        // reported.
        let (progress_tx, progress_rx) = crossbeam_channel::bounded(0);
        let options = ParseOptions {
            threads: 2,
            progress: Some(progress_tx),
            ..Default::default()
        };
        let cancel = options.cancel.clone();
        let watcher = thread::spawn(move || {
            for progress in progress_rx {
                if progress.partition == 0 && progress.percent < 100 {
                    cancel.cancel();
                }
            }
        });

        let mut vcd = Vcd::load_definitions(file.path(), &options).unwrap();
        let outcome = vcd.read_changes_from_path(file.path(), &options).unwrap();
        drop(options);
        watcher.join().unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(vcd.outcome, Outcome::Cancelled);
        vcd.validate().unwrap();

        // Whole lines only, and less than the whole file.
        assert!(vcd.committed_end > vcd.definition_end);
        assert!(vcd.committed_end < text.len() as u64);
        assert_eq!(text.as_bytes()[vcd.committed_end as usize - 1], b'\n');

        let n = vcd.times.len();
        assert!(n > 0 && n < single.times.len());
        assert_eq!(vcd.times.as_slice(), &single.times.as_slice()[..n]);

        // The last time step may have been cut short; everything before it
        // matches.
        for (id, signal) in single.signals.iter() {
            let expected: Vec<_> = signal.changes.iter().filter(|(i, _)| i.0 + 1 < n).collect();
            let actual: Vec<_> = vcd.signals[id]
                .changes
                .iter()
                .filter(|(i, _)| i.0 + 1 < n)
                .collect();
            assert_eq!(actual, expected, "signal {}", signal.name);
        }
    }

    #[test]
    fn test_progress_is_reported_per_partition() {
        let text = generated_dump();
        let file = write_temp(&text);

        let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
        let options = ParseOptions {
            threads: 4,
            progress: Some(progress_tx),
            ..Default::default()
        };
        let vcd = Vcd::load(file.path(), &options).unwrap();
        drop(options);
        assert_eq!(vcd.outcome, Outcome::Completed);

        let mut f = File::open(file.path()).unwrap();
        let ranges = partition_ranges(&mut f, vcd.definition_end, text.len() as u64, 4).unwrap();
        assert_eq!(ranges.len(), 4);

        let reports: Vec<Progress> = progress_rx.iter().collect();
        assert!(reports.iter().all(|p| p.partition < 4 && p.percent <= 100));
        let finished: BTreeSet<usize> = reports
            .iter()
            .filter(|p| p.percent == 100)
            .map(|p| p.partition)
            .collect();
        assert_eq!(finished, (0..4).collect());
    }
}
