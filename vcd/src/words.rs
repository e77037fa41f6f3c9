use std::io::BufRead;

use anyhow::{bail, Result};

/// Splits a stream into whitespace separated words. Stops with an error once
/// more than `budget` bytes have been consumed, so a file without a proper
/// header can't make us read the whole thing.
pub struct WordReader<R> {
    reader: R,
    offset: u64,
    budget: u64,
}

impl<R: BufRead> WordReader<R> {
    pub fn new(reader: R, budget: u64) -> Self {
        Self {
            reader,
            offset: 0,
            budget,
        }
    }

    /// Bytes consumed so far. After `next_word()` returns a word this is the
    /// position just after its last byte; the whitespace that ended it has
    /// not been consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// The next word, or `None` at the end of the stream.
    pub fn next_word(&mut self) -> Result<Option<String>> {
        let mut word = Vec::new();

        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }

            let mut used = 0;
            let mut done = false;
            for &c in buf {
                if c.is_ascii_whitespace() {
                    if !word.is_empty() {
                        done = true;
                        break;
                    }
                } else {
                    word.push(c);
                }
                used += 1;
            }

            self.reader.consume(used);
            self.offset += used as u64;

            if self.offset > self.budget {
                bail!(
                    "No $enddefinitions in the first {} bytes; this doesn't look like a VCD header",
                    self.budget
                );
            }

            if done {
                break;
            }
        }

        Ok(if word.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&word).into_owned())
        })
    }
}
