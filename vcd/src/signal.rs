use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
};

use derive_more::{From, Into};
use typed_index_collections::TiVec;

use crate::{
    hierarchy::ScopeId,
    times::TimeAxis,
    valvec::{ChangeList, Storage, Value},
};

#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignalId(pub usize);

/// The short identifier code a dump uses to refer to a signal in the value
/// section. Usually one printable character, but bigger designs use more.
#[derive(Clone, Default)]
pub struct IdCode(tinyvec::TinyVec<[u8; 8]>);

impl IdCode {
    pub fn new(code: &[u8]) -> Self {
        Self(code.iter().copied().collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Hash and compare as the raw bytes so the map can be queried with `&[u8]`.
impl PartialEq for IdCode {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for IdCode {}

impl Hash for IdCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Borrow<[u8]> for IdCode {
    fn borrow(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<&str> for IdCode {
    fn from(code: &str) -> Self {
        Self::new(code.as_bytes())
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdCode({:?})", self.to_string())
    }
}

/// The declared `$var` kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Reg,
    Wire,
    Integer,
    Other(String),
}

impl SignalKind {
    pub fn parse(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "reg" => SignalKind::Reg,
            "wire" => SignalKind::Wire,
            "integer" => SignalKind::Integer,
            _ => SignalKind::Other(kind.to_owned()),
        }
    }

    /// Which value column a signal of this kind and width starts with.
    pub fn storage(&self, width: u32) -> Storage {
        match self {
            SignalKind::Other(_) => Storage::Generic,
            SignalKind::Integer => Storage::Vector,
            SignalKind::Reg | SignalKind::Wire if width == 1 => Storage::Scalar,
            SignalKind::Reg | SignalKind::Wire => Storage::Vector,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Reg => f.write_str("reg"),
            SignalKind::Wire => f.write_str("wire"),
            SignalKind::Integer => f.write_str("integer"),
            SignalKind::Other(kind) => f.write_str(kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub code: IdCode,
    pub name: String,
    pub kind: SignalKind,
    pub width: u32,
    /// The scope it was first declared in. Aliases may list it in others too.
    pub scope: ScopeId,
    pub changes: ChangeList,
}

impl Signal {
    pub fn new(code: IdCode, name: String, kind: SignalKind, width: u32, scope: ScopeId) -> Self {
        let changes = ChangeList::with_width(kind.storage(width), width);
        Self {
            code,
            name,
            kind,
            width,
            scope,
            changes,
        }
    }

    /// The value in effect at simulation time `time`.
    pub fn value_at(&self, times: &TimeAxis, time: u64) -> Option<Value> {
        self.changes.value_at_index(times.index_at_or_before(time)?)
    }

    /// Changes as `(time, value)` rather than `(time index, value)`.
    pub fn timed_changes<'a>(
        &'a self,
        times: &'a TimeAxis,
    ) -> impl Iterator<Item = (u64, Value)> + 'a {
        self.changes
            .iter()
            .filter_map(move |(index, value)| Some((times.get(index)?, value)))
    }
}

pub type CodeMap = HashMap<IdCode, SignalId>;

/// All the signals of a dump. Filled in while reading the header and never
/// changed structurally after that; only the change lists grow.
#[derive(Debug, Default, Clone)]
pub struct SignalRegistry {
    pub(crate) signals: TiVec<SignalId, Signal>,
    pub(crate) codes: CodeMap,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Register a signal. If the code is already known nothing is added and
    /// the existing id is returned as `Err`.
    pub fn insert(&mut self, signal: Signal) -> Result<SignalId, SignalId> {
        if let Some(&existing) = self.codes.get(&signal.code) {
            return Err(existing);
        }
        let code = signal.code.clone();
        let id = self.signals.push_and_get_key(signal);
        self.codes.insert(code, id);
        Ok(id)
    }

    pub fn get(&self, id: SignalId) -> Option<&Signal> {
        self.signals.get(id)
    }

    pub fn id_of(&self, code: &[u8]) -> Option<SignalId> {
        self.codes.get(code).copied()
    }

    pub fn by_code(&self, code: &str) -> Option<&Signal> {
        self.get(self.id_of(code.as_bytes())?)
    }

    pub fn codes(&self) -> &CodeMap {
        &self.codes
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalId, &Signal)> {
        self.signals.iter_enumerated()
    }

    /// A fresh change list per signal, with the same storage. Used for
    /// results that are built separately and merged in later.
    pub(crate) fn empty_changes(&self) -> TiVec<SignalId, ChangeList> {
        self.signals
            .iter()
            .map(|signal| signal.changes.empty_like())
            .collect()
    }
}

impl std::ops::Index<SignalId> for SignalRegistry {
    type Output = Signal;

    fn index(&self, id: SignalId) -> &Signal {
        &self.signals[id]
    }
}
