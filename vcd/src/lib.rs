//! Value Change Dump (VCD) reader.
//!
//! A dump is read in two phases. The header (`$scope`, `$var`, ... up to
//! `$enddefinitions`) becomes a `Hierarchy` of scopes and a `SignalRegistry`.
//! The value section then fills a shared `TimeAxis` with every `#<time>`
//! marker and gives each signal a `ChangeList` of `(time index, value)`
//! pairs. The value section can be read on one thread, split across several,
//! or followed while a simulator is still writing it.
//!
//! ```no_run
//! use std::path::Path;
//! use vcd::{ParseOptions, Vcd};
//!
//! let vcd = Vcd::load(Path::new("dump.vcd"), &ParseOptions::default())?;
//! for (_, signal) in vcd.signals.iter() {
//!     println!("{}: {} changes", signal.name, signal.changes.len());
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod changes;
pub mod header;
pub mod hierarchy;
pub mod options;
mod partition;
pub mod signal;
pub mod tail;
pub mod times;
pub mod valvec;
pub mod vcd;
mod words;

pub use crate::{
    hierarchy::{Hierarchy, Scope, ScopeId},
    options::{CancelToken, Outcome, ParseOptions, Progress, VarRecords},
    signal::{IdCode, Signal, SignalId, SignalKind, SignalRegistry},
    tail::{find_last_time, last_time, ChangeBatch, Tail},
    times::{TimeAxis, TimeIndex},
    valvec::{ChangeList, Logic, Value},
    vcd::Vcd,
};
