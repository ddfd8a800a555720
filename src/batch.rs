//! Batch files and bulk grouping.
//!
//! A batch is an immutable file listing pending filesystem-change records.
//! Its name is the wire format:
//!
//! ```text
//! staging root:      <sortable-id>_<origin-node>_<disambiguator>.<type>.batch
//! push|pull/<node>:  <...>_<type>.batch   or   <...>.<type>.batch
//! ```
//!
//! The record lines are opaque. They are only read when several batches are
//! shipped in one transfer and have to be merged into a single stdin stream.
//!
//! # Grouping
//!
//! ```text
//! directory listing ──▶ BulkBuilder::add ──┬──▶ split on: unknown mtime
//!                                          │              too fresh
//!                                          │              cap reached
//!                                          │              type change
//!                                          ▼
//!                                   Vec<Bulk> (same type, ≤ cap)
//! ```

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Suffix shared by every batch file.
pub const BATCH_SUFFIX: &str = ".batch";

/// Batch type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchType {
    /// Recursive (full directory) changes.
    Rec,
    /// Non-recursive (incremental) changes.
    Norec,
}

impl BatchType {
    /// Parse a type tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "rec" => Some(Self::Rec),
            "norec" => Some(Self::Norec),
            _ => None,
        }
    }

    /// The tag as it appears in filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rec => "rec",
            Self::Norec => "norec",
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the type tag of a batch filename.
///
/// The tag is the token right before `.batch`, separated by `_` or `.`.
/// Returns `None` for anything else, including unknown tags.
pub fn batch_type(name: &str) -> Option<BatchType> {
    let stem = name.strip_suffix(BATCH_SUFFIX)?;
    let start = stem.rfind(['_', '.'])?;
    BatchType::from_tag(&stem[start + 1..])
}

/// Extract the origin node of a staging-root batch filename.
///
/// Matches `<digits>_<origin>_<anything>.batch`; the origin may not contain `_`.
pub fn origin_node(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(BATCH_SUFFIX)?;
    let (id, rest) = stem.split_once('_')?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (origin, _) = rest.split_once('_')?;
    if origin.is_empty() {
        return None;
    }
    Some(origin)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bulks
// ═══════════════════════════════════════════════════════════════════════════════

/// Age of a batch relative to the settle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAge {
    /// Old enough to join the current bulk.
    Settled,
    /// Younger than the settle age.
    Fresh,
    /// Modification time could not be read.
    Unknown,
}

impl BatchAge {
    /// Classify a modification time, with whole-second resolution.
    ///
    /// A modification time in the future counts as fresh.
    pub fn classify(mtime: SystemTime, now: SystemTime, settle: Duration) -> Self {
        let age = unix_secs(now) - unix_secs(mtime);
        if age < settle.as_secs() as i64 {
            Self::Fresh
        } else {
            Self::Settled
        }
    }
}

fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// An ordered group of same-type batches shipped as one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bulk {
    /// Type shared by every batch in the bulk.
    pub batch_type: BatchType,
    /// Batch filenames, in listing order.
    pub batches: Vec<String>,
}

impl Bulk {
    /// Number of batches in the bulk.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Check if the bulk is empty.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Groups a directory listing into bulks.
///
/// A new bulk starts, flushing the current one, when the batch age is unknown,
/// the batch is too fresh, the current bulk reached the cap, or the type tag
/// changes.
#[derive(Debug)]
pub struct BulkBuilder {
    max_batches: usize,
    current: Vec<String>,
    current_type: Option<BatchType>,
    bulks: Vec<Bulk>,
}

impl BulkBuilder {
    /// Create a builder with the given per-bulk cap.
    pub fn new(max_batches: usize) -> Self {
        Self {
            max_batches: max_batches.max(1),
            current: Vec::new(),
            current_type: None,
            bulks: Vec::new(),
        }
    }

    /// Add the next listed batch.
    pub fn add(&mut self, name: String, batch_type: BatchType, age: BatchAge) {
        if self.should_split(batch_type, age) {
            self.flush();
        }
        self.current.push(name);
        self.current_type = Some(batch_type);
    }

    fn should_split(&self, batch_type: BatchType, age: BatchAge) -> bool {
        age != BatchAge::Settled
            || self.current.len() >= self.max_batches
            || self.current_type.is_some_and(|t| t != batch_type)
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        if let Some(batch_type) = self.current_type {
            self.bulks.push(Bulk {
                batch_type,
                batches: std::mem::take(&mut self.current),
            });
        }
    }

    /// Flush the bulk in progress and return every bulk in order.
    pub fn finish(mut self) -> Vec<Bulk> {
        self.flush();
        self.bulks
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Merging
// ═══════════════════════════════════════════════════════════════════════════════

/// Merge the contents of several batch files into one stdin payload.
///
/// Each file is trimmed and split into lines; duplicate lines are dropped,
/// keeping the first occurrence. The result is newline-joined with a trailing
/// newline. Bytes are passed through untouched.
pub fn merge_batches<T: AsRef<[u8]>>(contents: &[T]) -> Vec<u8> {
    let mut seen: HashSet<&[u8]> = HashSet::new();
    let mut out = Vec::new();
    for content in contents {
        let trimmed = trim_ascii(content.as_ref());
        if trimmed.is_empty() {
            continue;
        }
        for line in trimmed.split(|b| *b == b'\n') {
            if seen.insert(line) {
                out.extend_from_slice(line);
                out.push(b'\n');
            }
        }
    }
    out
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let is_ws = |b: &u8| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\0' | 0x0B);
    let start = bytes.iter().position(|b| !is_ws(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_ws(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}
