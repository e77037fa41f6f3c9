//! Reads the header (everything up to `$enddefinitions $end`) into the scope
//! tree and the signal registry.

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    hierarchy::{Hierarchy, ScopeId},
    options::{ParseOptions, VarRecords},
    signal::{IdCode, Signal, SignalKind, SignalRegistry},
    words::WordReader,
};

#[derive(Debug, Clone)]
pub struct Definitions {
    /// The `$timescale` words joined with spaces, e.g. `1 ns`.
    pub timescale: Option<String>,
    pub hierarchy: Hierarchy,
    pub signals: SignalRegistry,
    /// Offset of the byte just after the `$end` of `$enddefinitions`.
    pub end_offset: u64,
}

/// Read the header from the start of a dump. The reader is returned
/// positioned at `end_offset` so the value section can be read from it.
pub fn read_definitions<R: BufRead>(reader: R, options: &ParseOptions) -> Result<(Definitions, R)> {
    let mut words_reader = WordReader::new(reader, options.max_header_bytes);

    let mut hierarchy = Hierarchy::new();
    let mut signals = SignalRegistry::new();
    let mut timescale = None;

    let mut current = hierarchy.root();
    let mut keyword: Option<String> = None;
    let mut words: Vec<String> = Vec::new();
    let mut end_offset = None;

    while let Some(word) = words_reader.next_word()? {
        if !is_directive(&word, keyword.as_deref()) {
            words.push(word);
            continue;
        }

        if word == "$end" {
            match keyword.as_deref() {
                Some("$timescale") => {
                    timescale = Some(words.join(" "));
                }
                Some("$var") => {
                    declare_var(
                        &words,
                        current,
                        &mut hierarchy,
                        &mut signals,
                        options.var_records,
                    );
                }
                Some("$scope") => {
                    current = hierarchy.push_child(current, words.join(" "));
                }
                Some("$upscope") => {
                    current = hierarchy
                        .parent(current)
                        .context("$upscope without a matching $scope")?;
                }
                Some("$enddefinitions") => {
                    end_offset = Some(words_reader.offset());
                    break;
                }
                _ => {}
            }
            keyword = None;
        } else {
            keyword = Some(word);
        }
        words.clear();
    }

    let end_offset = match end_offset {
        Some(e) => e,
        None => {
            bail!("End of file before $enddefinitions");
        }
    };

    info!(
        "Read {} scopes and {} signals; value changes start at byte {}",
        hierarchy.len(),
        signals.len(),
        end_offset
    );

    Ok((
        Definitions {
            timescale,
            hierarchy,
            signals,
            end_offset,
        },
        words_reader.into_inner(),
    ))
}

/// Inside a directive only `$end` is special, so id codes (and comment text)
/// may start with `$`. Between directives every `$` word opens one.
fn is_directive(word: &str, keyword: Option<&str>) -> bool {
    word == "$end" || (keyword.is_none() && word.starts_with('$'))
}

/// Handle `$var <kind> <width> <id> <name> $end`. Malformed records are
/// dropped, they are not an error.
fn declare_var(
    words: &[String],
    scope: ScopeId,
    hierarchy: &mut Hierarchy,
    signals: &mut SignalRegistry,
    var_records: VarRecords,
) {
    let name = match (var_records, words.len()) {
        (_, 4) => words[3].clone(),
        (VarRecords::Lenient, n) if n > 4 => words[3..].join(" "),
        _ => {
            warn!("Dropping $var record with {} words: {:?}", words.len(), words);
            return;
        }
    };

    let width = match words[1].parse::<u32>() {
        Ok(w) => w,
        Err(_) => {
            warn!("Dropping $var {name:?} with invalid width {:?}", words[1]);
            return;
        }
    };

    let signal = Signal::new(
        IdCode::from(words[2].as_str()),
        name,
        SignalKind::parse(&words[0]),
        width,
        scope,
    );

    let id = match signals.insert(signal) {
        Ok(id) => id,
        Err(existing) => {
            debug!("{:?} is an alias of signal {:?}", words[3], existing);
            existing
        }
    };
    hierarchy.add_signal(scope, id);
}

static TIMESCALE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s*(fs|ps|ns|us|ms|s)\s*$").expect("timescale regex")
});

/// Decode a `$timescale` such as `10 ns` into femtoseconds.
pub fn timescale_fs(timescale: &str) -> Option<u64> {
    let captures = TIMESCALE.captures(timescale)?;
    let magnitude: u64 = captures[1].parse().ok()?;
    let unit: u64 = match &captures[2] {
        "fs" => 1,
        "ps" => 1_000,
        "ns" => 1_000_000,
        "us" => 1_000_000_000,
        "ms" => 1_000_000_000_000,
        _ => 1_000_000_000_000_000,
    };
    magnitude.checked_mul(unit)
}
