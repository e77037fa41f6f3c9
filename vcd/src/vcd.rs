use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use log::info;

use crate::{
    changes::{read_changes, ChangeParser, StoreSink},
    header::{read_definitions, timescale_fs, Definitions},
    hierarchy::Hierarchy,
    options::{Outcome, ParseOptions},
    partition::read_partitioned,
    signal::{SignalId, SignalRegistry},
    tail::ChangeBatch,
    times::{TimeAxis, TimeIndex},
};

/// A parsed dump: the scope tree, the signals with their changes, and the
/// shared time axis they index into.
#[derive(Debug, Clone)]
pub struct Vcd {
    /// File path that this was loaded from, if it came from a file.
    pub filename: Option<PathBuf>,

    pub timescale: Option<String>,

    pub hierarchy: Hierarchy,

    pub signals: SignalRegistry,

    pub times: TimeAxis,

    /// Offset of the byte just after `$enddefinitions $end`.
    pub definition_end: u64,

    /// Offset just past the last value change line that has been fully read.
    /// Reading more of a growing file starts here.
    pub committed_end: u64,

    /// How the last read of the value changes ended.
    pub outcome: Outcome,
}

impl From<Definitions> for Vcd {
    fn from(defs: Definitions) -> Self {
        Self {
            filename: None,
            timescale: defs.timescale,
            hierarchy: defs.hierarchy,
            signals: defs.signals,
            times: TimeAxis::new(),
            definition_end: defs.end_offset,
            committed_end: defs.end_offset,
            outcome: Outcome::Completed,
        }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |e| e.eq_ignore_ascii_case("gz"))
}

impl Vcd {
    /// Parse a whole dump from a stream, single threaded.
    pub fn parse<R: BufRead>(reader: R, options: &ParseOptions) -> Result<Self> {
        let (defs, mut reader) = read_definitions(reader, options)?;
        let mut vcd = Self::from(defs);
        vcd.read_changes(&mut reader, options, None)?;
        Ok(vcd)
    }

    /// Load a dump from a file. `.gz` files are decompressed on the fly and
    /// always read on one thread; anything else is read with
    /// `options.threads` threads.
    pub fn load(path: &Path, options: &ParseOptions) -> Result<Self> {
        info!("Loading {}", path.display());

        if is_gzip(path) {
            let f = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
            let mut vcd = Self::parse(BufReader::new(GzDecoder::new(f)), options)
                .with_context(|| format!("Reading {}", path.display()))?;
            vcd.filename = Some(path.to_owned());
            return Ok(vcd);
        }

        let mut vcd = Self::load_definitions(path, options)?;
        vcd.read_changes_from_path(path, options)?;
        Ok(vcd)
    }

    /// Read only the header of a file. The time axis is left empty and
    /// `committed_end` points at the start of the value changes.
    pub fn load_definitions(path: &Path, options: &ParseOptions) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        let (defs, _) = read_definitions(BufReader::new(f), options)
            .with_context(|| format!("Reading the header of {}", path.display()))?;
        let mut vcd = Self::from(defs);
        vcd.filename = Some(path.to_owned());
        Ok(vcd)
    }

    /// Read value changes from a stream positioned at `committed_end`,
    /// appending them. `expected_len` is only used for progress reports.
    pub fn read_changes<R: BufRead>(
        &mut self,
        reader: &mut R,
        options: &ParseOptions,
        expected_len: Option<u64>,
    ) -> Result<Outcome> {
        let mut parser = ChangeParser::new(!self.times.is_empty());
        let mut sink = StoreSink {
            times: &mut self.times,
            signals: &mut self.signals.signals,
        };

        let result = read_changes(
            reader,
            &mut parser,
            &self.signals.codes,
            &mut sink,
            options,
            0,
            expected_len,
        );

        // Whatever was committed before an error is still in the store.
        self.committed_end += parser.committed();
        let outcome = result?;
        self.outcome = outcome;

        info!(
            "Read {} time markers up to byte {} ({:?})",
            self.times.len(),
            self.committed_end,
            outcome
        );
        Ok(outcome)
    }

    /// Read value changes from `committed_end` to the end of the file,
    /// with `options.threads` threads.
    pub fn read_changes_from_path(&mut self, path: &Path, options: &ParseOptions) -> Result<Outcome> {
        if options.threads > 1 {
            let (outcome, committed_end) = read_partitioned(
                path,
                self.committed_end,
                &mut self.times,
                &mut self.signals,
                options,
            )
            .with_context(|| format!("Reading {}", path.display()))?;
            self.committed_end = committed_end;
            self.outcome = outcome;
            info!(
                "Read {} time markers up to byte {} ({:?})",
                self.times.len(),
                self.committed_end,
                outcome
            );
            return Ok(outcome);
        }

        let mut f = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        let len = f.metadata()?.len();
        f.seek(SeekFrom::Start(self.committed_end))?;
        let mut reader = BufReader::new(f);
        self.read_changes(
            &mut reader,
            options,
            Some(len.saturating_sub(self.committed_end)),
        )
        .with_context(|| format!("Reading {}", path.display()))
    }

    /// Read whatever has been appended to the file since the last read.
    pub fn resume(&mut self, options: &ParseOptions) -> Result<Outcome> {
        let path = self
            .filename
            .clone()
            .context("This dump was not loaded from a file")?;
        if is_gzip(&path) {
            bail!("Can't resume a compressed file");
        }
        self.read_changes_from_path(&path, options)
    }

    /// Append a batch from a `Tail`. Batches must be applied in the order
    /// they were produced.
    pub fn apply(&mut self, batch: &ChangeBatch) -> Result<()> {
        if batch.first_index.0 != self.times.len() {
            bail!(
                "Batch starts at time index {} but there are {} times",
                batch.first_index.0,
                self.times.len()
            );
        }
        if batch.committed_end < self.committed_end {
            bail!(
                "Batch ends at byte {} which was already read (up to {})",
                batch.committed_end,
                self.committed_end
            );
        }

        // Nothing is changed unless the whole batch is valid.
        let time_count = self.times.len() + batch.times.len();
        let mut last_indices: HashMap<SignalId, TimeIndex> = HashMap::new();
        for (signal, index, _) in &batch.changes {
            if index.0 >= time_count {
                bail!("Change to {signal:?} at time index {} which doesn't exist", index.0);
            }
            let changes = &self
                .signals
                .get(*signal)
                .with_context(|| format!("Change to unknown signal {signal:?}"))?
                .changes;
            let last = last_indices
                .get(signal)
                .copied()
                .or_else(|| changes.last_index());
            if last.map_or(false, |last| *index < last) {
                bail!("Change to {signal:?} at time index {} is out of order", index.0);
            }
            last_indices.insert(*signal, *index);
        }
        self.times.extend_from_slice(&batch.times)?;

        for (signal, index, value) in &batch.changes {
            self.signals.signals[*signal].changes.push(*index, value.clone());
        }

        self.committed_end = batch.committed_end;
        Ok(())
    }

    /// The `$timescale` in femtoseconds, if it is in the usual `<n> <unit>` form.
    pub fn timescale_fs(&self) -> Option<u64> {
        timescale_fs(self.timescale.as_deref()?)
    }

    /// Check that the time axis never goes backwards, that every change list
    /// is strictly increasing and in range, and that the scope tree and the
    /// signal registry agree with each other.
    pub fn validate(&self) -> Result<()> {
        if let Some(w) = self.times.as_slice().windows(2).find(|w| w[1] < w[0]) {
            bail!("Time axis goes backwards from #{} to #{}", w[0], w[1]);
        }

        for (id, signal) in self.signals.iter() {
            let changes = &signal.changes;
            if changes.indices().len() != changes.values().len() {
                bail!(
                    "Signal {:?} has {} time indices but {} values",
                    signal.name,
                    changes.indices().len(),
                    changes.values().len()
                );
            }
            if let Some(w) = changes.indices().windows(2).find(|w| w[1] <= w[0]) {
                bail!(
                    "Signal {:?} changes at time index {} then {}",
                    signal.name,
                    w[0].0,
                    w[1].0
                );
            }
            if let Some(last) = changes.last_index() {
                if last.0 >= self.times.len() {
                    bail!(
                        "Signal {:?} changes at time index {} but there are only {} times",
                        signal.name,
                        last.0,
                        self.times.len()
                    );
                }
            }
            if self.signals.id_of(signal.code.as_bytes()) != Some(id) {
                bail!("Signal {:?} is not registered under {}", signal.name, signal.code);
            }
            if self.hierarchy.get(signal.scope).is_none() {
                bail!("Signal {:?} is in a scope that doesn't exist", signal.name);
            }
        }

        for (id, scope) in self.hierarchy.iter() {
            if let Some(&missing) = scope.signals.iter().find(|&&s| self.signals.get(s).is_none()) {
                bail!("Scope {:?} lists unknown signal {:?}", scope.name, missing);
            }
            for &child in &scope.children {
                if self.hierarchy.parent(child) != Some(id) {
                    bail!("Scope {:?} is not the parent of its child {:?}", scope.name, child);
                }
            }
        }

        if self.committed_end < self.definition_end {
            bail!(
                "Read up to byte {} which is before the end of the header at {}",
                self.committed_end,
                self.definition_end
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::{
        options::{CancelToken, VarRecords},
        signal::SignalId,
        times::TimeIndex,
        valvec::{Storage, Value},
    };

    fn logging_setup() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Info)
            .try_init();
    }

    fn sample(name: &str) -> PathBuf {
        Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../samples")).join(name)
    }

    const COUNTER: &str = "$timescale 1 ns $end
$scope module tb $end
$var reg 1 ! clk $end
$var integer 4 \" cnt $end
$upscope $end
$enddefinitions $end
#0
0!
b0000 \"
#5
1!
b0101 \"
";

    #[test]
    fn test_counter() {
        let vcd = Vcd::parse(COUNTER.as_bytes(), &ParseOptions::default()).unwrap();
        vcd.validate().unwrap();

        assert_eq!(vcd.times.as_slice(), &[0, 5]);
        assert_eq!(vcd.timescale_fs(), Some(1_000_000));

        let clk = vcd.signals.by_code("!").unwrap();
        assert_eq!(clk.changes.values().storage(), Storage::Scalar);
        assert_eq!(
            clk.changes.iter().collect::<Vec<_>>(),
            vec![
                (TimeIndex(0), Value::Scalar(0)),
                (TimeIndex(1), Value::Scalar(1))
            ]
        );

        let cnt = vcd.signals.by_code("\"").unwrap();
        assert_eq!(cnt.changes.values().storage(), Storage::Vector);
        assert_eq!(
            cnt.changes.iter().collect::<Vec<_>>(),
            vec![
                (TimeIndex(0), Value::Vector(0)),
                (TimeIndex(1), Value::Vector(5))
            ]
        );

        assert_eq!(cnt.value_at(&vcd.times, 3), Some(Value::Vector(0)));
        assert_eq!(cnt.value_at(&vcd.times, 100), Some(Value::Vector(5)));
        assert_eq!(vcd.committed_end, COUNTER.len() as u64);
    }

    #[test]
    fn test_sample_files() {
        logging_setup();

        let counter = Vcd::load(&sample("counter.vcd"), &ParseOptions::default()).unwrap();
        counter.validate().unwrap();
        assert_eq!(counter.times.as_slice(), &[0, 5]);
        assert_eq!(counter.filename, Some(sample("counter.vcd")));

        let alu = Vcd::load(&sample("alu.vcd"), &ParseOptions::default()).unwrap();
        alu.validate().unwrap();
        let threaded = Vcd::load(
            &sample("alu.vcd"),
            &ParseOptions {
                threads: 3,
                ..Default::default()
            },
        )
        .unwrap();
        threaded.validate().unwrap();
        assert_eq!(threaded.times, alu.times);
        for (id, signal) in alu.signals.iter() {
            assert_eq!(
                threaded.signals[id].timed_changes(&threaded.times).collect::<Vec<_>>(),
                signal.timed_changes(&alu.times).collect::<Vec<_>>(),
                "{}",
                signal.name
            );
        }

        // `op` has a bit range after its name, so it only exists when lenient.
        assert!(alu.signals.by_code("#").is_none());
        let clk = alu.signals.by_code("!").unwrap();
        assert_eq!(clk.changes.len(), 60);
        let result = alu.signals.by_code("%a").unwrap();
        assert_eq!(
            result.changes.get(0).unwrap().1.to_string(),
            "bzzzzzzzzzzzzzzzz"
        );
        // `bx` on a 16 bit reg.
        let a = alu.signals.by_code("$").unwrap();
        assert_eq!(a.changes.get(0).unwrap().1.to_string(), format!("b{}", "x".repeat(16)));
        assert_eq!(alu.timescale_fs(), Some(10_000));
        let dut = alu.hierarchy.children(alu.hierarchy.root()).next().unwrap().0;
        let dut = alu.hierarchy.children(dut).next().unwrap().0;
        assert_eq!(alu.hierarchy.path(dut), "alu_tb.dut");
        // `clk` is declared again in `dut` with the same code.
        assert!(alu.hierarchy[dut].signals.contains(&alu.signals.id_of(b"!").unwrap()));
    }

    #[test]
    fn test_malformed_var_is_not_an_error() {
        let text = "$scope module tb $end
$var reg 1 ! $end
$var reg 1 \" ok $end
$upscope $end
$enddefinitions $end
#0
1!
0\"
";
        let vcd = Vcd::parse(text.as_bytes(), &ParseOptions::default()).unwrap();
        vcd.validate().unwrap();
        assert_eq!(vcd.signals.len(), 1);
        assert_eq!(vcd.signals[SignalId(0)].changes.len(), 1);

        let lenient = ParseOptions {
            var_records: VarRecords::Lenient,
            ..Default::default()
        };
        let text = "$var wire 4 # data [3:0] $end $enddefinitions $end\n#0\nb1x01 #\n";
        let vcd = Vcd::parse(text.as_bytes(), &lenient).unwrap();
        let data = vcd.signals.by_code("#").unwrap();
        assert_eq!(data.name, "data [3:0]");
        assert_eq!(data.changes.get(0).unwrap().1.to_string(), "b1x01");
    }

    #[test]
    fn test_time_going_backwards_is_an_error() {
        let text = "$var reg 1 ! a $end $enddefinitions $end\n#10\n1!\n#5\n0!\n";
        assert!(Vcd::parse(text.as_bytes(), &ParseOptions::default()).is_err());
    }

    #[test]
    fn test_cancel_keeps_partial_results() {
        let options = ParseOptions::default();
        let (defs, _) = read_definitions(COUNTER.as_bytes(), &options).unwrap();
        let mut vcd = Vcd::from(defs);

        // Hand over the value section one line at a time and cancel half way.
        let body = &COUNTER[vcd.definition_end as usize..];
        let split = body.find("#5").unwrap();
        vcd.read_changes(&mut body[..split].as_bytes(), &options, None)
            .unwrap();
        options.cancel.cancel();
        let outcome = vcd
            .read_changes(&mut body[split..].as_bytes(), &options, None)
            .unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(vcd.outcome, Outcome::Cancelled);
        vcd.validate().unwrap();
        assert_eq!(vcd.times.as_slice(), &[0]);
        assert_eq!(vcd.signals.by_code("\"").unwrap().changes.len(), 1);
        assert_eq!(vcd.committed_end, vcd.definition_end + split as u64);
    }

    #[test]
    fn test_resume_after_append() {
        logging_setup();

        let split = COUNTER.find("#5").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(COUNTER[..split].as_bytes()).unwrap();
        // Half a line; not committed until the newline arrives.
        file.write_all(b"#").unwrap();
        file.flush().unwrap();

        let mut vcd = Vcd::load(file.path(), &ParseOptions::default()).unwrap();
        assert_eq!(vcd.times.as_slice(), &[0]);
        assert_eq!(vcd.committed_end, split as u64);

        file.write_all(COUNTER[split + 1..].as_bytes()).unwrap();
        file.flush().unwrap();

        let options = ParseOptions {
            threads: 2,
            ..Default::default()
        };
        assert_eq!(vcd.resume(&options).unwrap(), Outcome::Completed);
        vcd.validate().unwrap();

        let whole = Vcd::parse(COUNTER.as_bytes(), &ParseOptions::default()).unwrap();
        assert_eq!(vcd.times, whole.times);
        assert_eq!(vcd.committed_end, whole.committed_end);
        for (id, signal) in whole.signals.iter() {
            assert_eq!(vcd.signals[id].changes, signal.changes);
        }
    }

    #[test]
    fn test_changes_after_resume_attach_to_last_time() {
        let text = "$var reg 1 ! a $end $var reg 1 \" b $end $enddefinitions $end\n#3\n1!\n";
        let mut vcd = Vcd::parse(text.as_bytes(), &ParseOptions::default()).unwrap();
        vcd.read_changes(&mut "1\"\n#4\n0!\n".as_bytes(), &ParseOptions::default(), None)
            .unwrap();
        vcd.validate().unwrap();
        assert_eq!(vcd.times.as_slice(), &[3, 4]);
        assert_eq!(
            vcd.signals.by_code("\"").unwrap().changes.iter().collect::<Vec<_>>(),
            vec![(TimeIndex(0), Value::Scalar(1))]
        );
    }

    #[test]
    fn test_gzip() {
        use flate2::{write::GzEncoder, Compression};

        let mut file = tempfile::Builder::new().suffix(".vcd.gz").tempfile().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(COUNTER.as_bytes()).unwrap();
        file.write_all(&encoder.finish().unwrap()).unwrap();
        file.flush().unwrap();

        let vcd = Vcd::load(file.path(), &ParseOptions::default()).unwrap();
        vcd.validate().unwrap();
        assert_eq!(vcd.times.as_slice(), &[0, 5]);
        assert_eq!(vcd.signals.len(), 2);
    }

    #[test]
    fn test_apply_checks_sequence() {
        let mut vcd = Vcd::parse(COUNTER.as_bytes(), &ParseOptions::default()).unwrap();
        let end = vcd.committed_end;

        let batch = ChangeBatch {
            first_index: TimeIndex(2),
            times: vec![10],
            changes: vec![(SignalId(0), TimeIndex(2), Value::Scalar(0))],
            committed_end: end + 7,
        };
        let mut stale = batch.clone();
        stale.first_index = TimeIndex(1);
        assert!(vcd.apply(&stale).is_err());

        vcd.apply(&batch).unwrap();
        vcd.validate().unwrap();
        assert_eq!(vcd.times.as_slice(), &[0, 5, 10]);
        assert_eq!(vcd.committed_end, end + 7);
        assert_eq!(
            vcd.signals[SignalId(0)].value_at(&vcd.times, 10),
            Some(Value::Scalar(0))
        );
    }

    #[test]
    fn test_failed_apply_changes_nothing() {
        let mut vcd = Vcd::parse(COUNTER.as_bytes(), &ParseOptions::default()).unwrap();
        let end = vcd.committed_end;
        let before: Vec<_> = vcd.signals.iter().map(|(_, s)| s.changes.clone()).collect();

        // The second change names a signal that doesn't exist.
        let batch = ChangeBatch {
            first_index: TimeIndex(2),
            times: vec![5],
            changes: vec![
                (SignalId(0), TimeIndex(2), Value::Scalar(1)),
                (SignalId(9), TimeIndex(2), Value::Scalar(1)),
            ],
            committed_end: end + 6,
        };
        assert!(vcd.apply(&batch).is_err());

        // Out of order within the batch.
        let batch = ChangeBatch {
            first_index: TimeIndex(2),
            times: vec![10, 20],
            changes: vec![
                (SignalId(1), TimeIndex(3), Value::Vector(1)),
                (SignalId(1), TimeIndex(2), Value::Vector(2)),
            ],
            committed_end: end + 14,
        };
        assert!(vcd.apply(&batch).is_err());

        vcd.validate().unwrap();
        assert_eq!(vcd.times.as_slice(), &[0, 5]);
        assert_eq!(vcd.committed_end, end);
        let after: Vec<_> = vcd.signals.iter().map(|(_, s)| s.changes.clone()).collect();
        assert_eq!(after, before);
    }

    #[test]
    fn test_resume_crlf_split() {
        let text = COUNTER.replace('\n', "\r\n");
        let split = text.find("#5").unwrap() + "#5\r".len();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text[..split].as_bytes()).unwrap();
        file.flush().unwrap();

        let mut vcd = Vcd::load(file.path(), &ParseOptions::default()).unwrap();
        assert_eq!(vcd.times.as_slice(), &[0]);
        assert_eq!(vcd.committed_end, (split - "#5\r".len()) as u64);

        file.write_all(text[split..].as_bytes()).unwrap();
        file.flush().unwrap();
        assert_eq!(
            vcd.resume(&ParseOptions::default()).unwrap(),
            Outcome::Completed
        );
        vcd.validate().unwrap();

        let whole = Vcd::parse(text.as_bytes(), &ParseOptions::default()).unwrap();
        assert_eq!(vcd.times.as_slice(), &[0, 5]);
        assert_eq!(vcd.times, whole.times);
        assert_eq!(vcd.committed_end, whole.committed_end);
        for (id, signal) in whole.signals.iter() {
            assert_eq!(vcd.signals[id].changes, signal.changes);
        }
    }

    #[test]
    fn test_header_budget() {
        let options = ParseOptions {
            max_header_bytes: 64,
            cancel: CancelToken::new(),
            ..Default::default()
        };
        let text = format!("$comment {} $end $enddefinitions $end\n", "x".repeat(200));
        assert!(Vcd::parse(text.as_bytes(), &options).is_err());
    }
}
