use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{select, Receiver};
use log::{info, warn};
use vcd::{
    find_last_time, options::DEFAULT_MAX_HEADER_BYTES, CancelToken, ChangeBatch, ParseOptions,
    Progress, Tail, TimeIndex, VarRecords, Vcd,
};

use hierarchy::{print_hierarchy, print_summary};

mod hierarchy;

/// Summarise a VCD waveform dump.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// The dump to read. `.gz` files are decompressed.
    file: PathBuf,

    /// Number of threads to read the value changes with.
    #[arg(short, long, default_value_t = 1)]
    threads: usize,

    /// Accept `$var` records with extra words (e.g. a bit range) instead of
    /// dropping them.
    #[arg(long)]
    lenient_vars: bool,

    /// Give up if there is no `$enddefinitions` within this many bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_HEADER_BYTES)]
    max_header_bytes: u64,

    /// Only print the last time marker, found by scanning back from the end.
    #[arg(long)]
    last_time: bool,

    /// Keep reading the file as it grows and print new changes.
    #[arg(short, long)]
    follow: bool,

    /// How often to check a followed file for new data.
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,

    /// Print every change of every signal.
    #[arg(short, long)]
    changes: bool,
}

struct Loader {
    // The loaded file (or the error) arrives here once.
    result: Receiver<Result<Vcd>>,

    progress: Receiver<Progress>,

    threads: usize,
}

impl Loader {
    fn new(filename: &Path, options: ParseOptions) -> Self {
        let (result_tx, result) = crossbeam_channel::bounded(1);
        let (progress_tx, progress) = crossbeam_channel::unbounded();
        let threads = options.threads.max(1);

        let filename = filename.to_owned();
        let options = ParseOptions {
            progress: Some(progress_tx),
            ..options
        };

        thread::spawn(move || {
            let vcd = Vcd::load(&filename, &options);
            // Disconnect the progress channel first so `wait()` stops
            // selecting on it.
            drop(options);
            let _ = result_tx.send(vcd);
        });

        Self {
            result,
            progress,
            threads,
        }
    }

    /// Log progress until the file is loaded.
    fn wait(self) -> Result<Vcd> {
        let mut partitions: HashMap<usize, u8> = HashMap::new();
        let mut last_logged = 0;

        loop {
            select! {
                recv(self.progress) -> progress => match progress {
                    Ok(Progress { partition, percent }) => {
                        partitions.insert(partition, percent);
                        let total = partitions.values().map(|&p| p as usize).sum::<usize>() / self.threads;
                        if total >= last_logged + 10 {
                            last_logged = total / 10 * 10;
                            info!("Loading: {total}%");
                        }
                    }
                    Err(_) => break,
                },
                recv(self.result) -> vcd => return vcd.context("Loader thread exited")?,
            }
        }

        self.result.recv().context("Loader thread exited")?
    }
}

fn print_batch(vcd: &Vcd, batch: &ChangeBatch) {
    let mut changes = batch.changes.iter().peekable();

    // Changes to the time that was already current before this batch.
    while let Some((signal, _, value)) = changes.next_if(|(_, index, _)| *index < batch.first_index) {
        println!("  {} = {value}", vcd.signals[*signal].name);
    }

    for (offset, time) in batch.times.iter().enumerate() {
        let index = TimeIndex(batch.first_index.0 + offset);
        println!("#{time}");
        while let Some((signal, _, value)) = changes.next_if(|(_, i, _)| *i == index) {
            println!("  {} = {value}", vcd.signals[*signal].name);
        }
    }
}

fn follow(path: &Path, mut vcd: Vcd, poll_interval: Duration) -> Result<()> {
    let cancel = CancelToken::new();
    let batches = Tail::new(path, &vcd)?.spawn(poll_interval, cancel.clone());

    for batch in batches {
        let batch = match batch {
            Ok(b) => b,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        vcd.apply(&batch)?;
        print_batch(&vcd, &batch);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.last_time {
        match find_last_time(&args.file)? {
            Some(time) => println!("{time}"),
            None => println!("No time marker near the end of {}", args.file.display()),
        }
        return Ok(());
    }

    let options = ParseOptions {
        max_header_bytes: args.max_header_bytes,
        var_records: if args.lenient_vars {
            VarRecords::Lenient
        } else {
            VarRecords::Strict
        },
        threads: args.threads,
        ..Default::default()
    };

    let vcd = Loader::new(&args.file, options)
        .wait()
        .with_context(|| format!("Loading {}", args.file.display()))?;

    if let Err(e) = vcd.validate() {
        warn!("{e:#}");
    }

    print_summary(&vcd);
    print_hierarchy(&vcd, args.changes);

    if args.follow {
        follow(&args.file, vcd, Duration::from_millis(args.poll_ms))?;
    }
    Ok(())
}
