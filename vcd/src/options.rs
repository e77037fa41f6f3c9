use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::Sender;

/// How strictly `$var` records are checked while reading the header.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum VarRecords {
    /// A record must be exactly `<kind> <width> <id> <name>`. Anything else is
    /// dropped without creating a signal.
    #[default]
    Strict,
    /// Accept 4 or more words. The extra words (usually a bit range like
    /// `[7:0]`) are appended to the name.
    Lenient,
}

/// Progress of one parse job. `partition` is always 0 for single threaded
/// parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Progress {
    pub partition: usize,
    pub percent: u8,
}

/// Whether a parse ran to the end of its input or was stopped early.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

/// Shared flag used to stop a parse. Cloning gives another handle to the
/// same flag.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// The header is read as words until `$enddefinitions`. Reading more than
    /// this many bytes without finding it is an error.
    pub max_header_bytes: u64,
    pub var_records: VarRecords,
    /// Number of partitions to read the value section with. 1 means the whole
    /// thing is read on the calling thread.
    pub threads: usize,
    /// Optional progress reports (0-100 per partition).
    pub progress: Option<Sender<Progress>>,
    pub cancel: CancelToken,
}

pub const DEFAULT_MAX_HEADER_BYTES: u64 = 16 * 1024 * 1024;

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            var_records: VarRecords::default(),
            threads: 1,
            progress: None,
            cancel: CancelToken::default(),
        }
    }
}

impl ParseOptions {
    pub(crate) fn report(&self, partition: usize, percent: u8) {
        if let Some(progress) = &self.progress {
            // Nobody listening any more is fine.
            let _ = progress.send(Progress { partition, percent });
        }
    }
}
