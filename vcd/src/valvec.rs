use std::fmt::{self, Write};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::times::TimeIndex;

/// A single logic level, 2 bits each. The discriminants are the encoding
/// used everywhere values are stored.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Logic {
    Zero = 0,
    One = 1,
    Z = 2,
    X = 3,
}

/// Stored for scalar changes whose state isn't 0, 1, X or Z (e.g. the VHDL
/// states U, W, L, H and -).
pub const LOGIC_UNKNOWN: u8 = 0xFF;

impl Logic {
    pub fn as_char(self) -> char {
        match self {
            Logic::Zero => '0',
            Logic::One => '1',
            Logic::Z => 'z',
            Logic::X => 'x',
        }
    }
}

/// Encode a value character from the dump. Anything that isn't 0, 1, X or Z
/// becomes `LOGIC_UNKNOWN`.
pub fn encode_logic(c: u8) -> u8 {
    match c {
        b'0' => Logic::Zero as u8,
        b'1' => Logic::One as u8,
        b'z' | b'Z' => Logic::Z as u8,
        b'x' | b'X' => Logic::X as u8,
        _ => LOGIC_UNKNOWN,
    }
}

fn logic_char(code: u8) -> char {
    Logic::from_u8(code).map(Logic::as_char).unwrap_or('?')
}

/// Vector values that don't fit in a `u128` or contain X/Z. Digits are packed
/// 4 per byte, digit 0 (the least significant) in the low bits of byte 0.
///
/// With 16 bytes inline this holds 64 digits without allocating.
#[derive(Eq, PartialEq, Clone, Debug, Default)]
pub struct LogicVec {
    len: u32,
    packed: tinyvec::TinyVec<[u8; 16]>,
}

impl LogicVec {
    /// Build from digit codes in the order they are written in the dump,
    /// i.e. most significant first. Unknown codes are stored as X.
    pub fn from_msb_first(digits: &[u8]) -> Self {
        let mut packed = tinyvec::TinyVec::<[u8; 16]>::with_capacity((digits.len() + 3) / 4);
        packed.resize((digits.len() + 3) / 4, 0);

        for (i, &d) in digits.iter().rev().enumerate() {
            let d = if d > Logic::X as u8 { Logic::X as u8 } else { d };
            packed[i / 4] |= d << ((i % 4) * 2);
        }

        Self {
            len: digits.len() as u32,
            packed,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Digit `i`, counting from the least significant.
    pub fn digit(&self, i: usize) -> Option<Logic> {
        if i >= self.len() {
            return None;
        }
        Logic::from_u8((self.packed[i / 4] >> ((i % 4) * 2)) & 0b11)
    }

    /// Left-extend to `width` digits: a leading X or Z is repeated, anything
    /// else is extended with 0. Already wide enough is returned as is.
    pub fn extended_to(&self, width: usize) -> LogicVec {
        if width <= self.len() {
            return self.clone();
        }
        let fill = match self.len().checked_sub(1).and_then(|msb| self.digit(msb)) {
            Some(Logic::X) => Logic::X,
            Some(Logic::Z) => Logic::Z,
            _ => Logic::Zero,
        };
        let digits: Vec<u8> = std::iter::repeat(fill as u8)
            .take(width - self.len())
            .chain((0..self.len()).rev().filter_map(|i| self.digit(i)).map(|d| d as u8))
            .collect();
        LogicVec::from_msb_first(&digits)
    }
}

impl fmt::Display for LogicVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in (0..self.len()).rev() {
            f.write_char(self.digit(i).map(Logic::as_char).unwrap_or('?'))?;
        }
        Ok(())
    }
}

/// One value change.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Value {
    /// A `Logic` code, or `LOGIC_UNKNOWN`.
    Scalar(u8),
    /// A vector made only of 0s and 1s, at most 128 bits.
    Vector(u128),
    /// Anything else written with `b`.
    Bits(LogicVec),
}

impl Value {
    /// Convert the digits of a `b...` record (most significant first).
    pub fn from_vector_digits(digits: &[u8]) -> Self {
        let binary = digits.iter().all(|&d| d <= Logic::One as u8);
        if binary && digits.len() <= 128 {
            Value::Vector(digits.iter().fold(0, |acc, &d| (acc << 1) | d as u128))
        } else {
            Value::Bits(LogicVec::from_msb_first(digits))
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(code) => f.write_char(logic_char(*code)),
            Value::Vector(v) => write!(f, "{v}"),
            Value::Bits(bits) => write!(f, "b{bits}"),
        }
    }
}

/// The storage picked for a signal when it is declared.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum Storage {
    Scalar,
    Vector,
    Generic,
}

/// Column of values for one signal. The typed columns are used while every
/// value fits them. The first value that doesn't turns the column into a
/// `Generic` one.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum ValVec {
    Scalar(Vec<u8>),
    Vector(Vec<u128>),
    Generic(Vec<Value>),
}

impl ValVec {
    pub fn new(storage: Storage) -> Self {
        match storage {
            Storage::Scalar => ValVec::Scalar(Vec::new()),
            Storage::Vector => ValVec::Vector(Vec::new()),
            Storage::Generic => ValVec::Generic(Vec::new()),
        }
    }

    pub fn storage(&self) -> Storage {
        match self {
            ValVec::Scalar(_) => Storage::Scalar,
            ValVec::Vector(_) => Storage::Vector,
            ValVec::Generic(_) => Storage::Generic,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ValVec::Scalar(v) => v.len(),
            ValVec::Vector(v) => v.len(),
            ValVec::Generic(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        match self {
            ValVec::Scalar(v) => v.get(i).map(|&b| Value::Scalar(b)),
            ValVec::Vector(v) => v.get(i).map(|&x| Value::Vector(x)),
            ValVec::Generic(v) => v.get(i).cloned(),
        }
    }

    pub fn push(&mut self, value: Value) {
        if let Err(value) = self.try_push(value) {
            self.promote();
            if let ValVec::Generic(values) = self {
                values.push(value);
            }
        }
    }

    fn try_push(&mut self, value: Value) -> Result<(), Value> {
        match (self, value) {
            (ValVec::Scalar(v), Value::Scalar(b)) => v.push(b),
            // `b1 !` on a 1-bit signal.
            (ValVec::Scalar(v), Value::Vector(x)) if x <= 1 => v.push(x as u8),
            (ValVec::Vector(v), Value::Vector(x)) => v.push(x),
            (ValVec::Vector(v), Value::Scalar(b)) if b <= Logic::One as u8 => v.push(b as u128),
            (ValVec::Generic(v), value) => v.push(value),
            (_, value) => return Err(value),
        }
        Ok(())
    }

    fn pop(&mut self) {
        match self {
            ValVec::Scalar(v) => {
                v.pop();
            }
            ValVec::Vector(v) => {
                v.pop();
            }
            ValVec::Generic(v) => {
                v.pop();
            }
        }
    }

    fn promote(&mut self) {
        let values = match std::mem::replace(self, ValVec::Generic(Vec::new())) {
            ValVec::Scalar(v) => v.into_iter().map(Value::Scalar).collect(),
            ValVec::Vector(v) => v.into_iter().map(Value::Vector).collect(),
            ValVec::Generic(v) => v,
        };
        *self = ValVec::Generic(values);
    }
}

/// Wider declarations keep `Bits` values as written.
pub const MAX_EXTENDED_WIDTH: u32 = 1 << 16;

/// The changes of one signal: time indices into the shared `TimeAxis` and the
/// value at each, stored as two columns.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ChangeList {
    indices: Vec<TimeIndex>,
    values: ValVec,
    // Declared width that `Bits` values are extended to, or 0.
    width: u32,
}

impl ChangeList {
    pub fn new(storage: Storage) -> Self {
        Self::with_width(storage, 0)
    }

    /// A list for a signal declared `width` bits wide. Short `Bits` values
    /// pushed to it are left-extended to that width.
    pub fn with_width(storage: Storage, width: u32) -> Self {
        Self {
            indices: Vec::new(),
            values: ValVec::new(storage),
            width,
        }
    }

    /// An empty list using the storage and width this one was declared with.
    pub fn empty_like(&self) -> Self {
        Self::with_width(self.values.storage(), self.width)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[TimeIndex] {
        &self.indices
    }

    pub fn values(&self) -> &ValVec {
        &self.values
    }

    pub fn last_index(&self) -> Option<TimeIndex> {
        self.indices.last().copied()
    }

    /// Append a change. A second change at the same time index replaces the
    /// first one. Indices must not go backwards.
    pub fn push(&mut self, index: TimeIndex, value: Value) {
        let value = match value {
            Value::Bits(bits) if bits.len() < self.width as usize && self.width <= MAX_EXTENDED_WIDTH => {
                Value::Bits(bits.extended_to(self.width as usize))
            }
            value => value,
        };
        match self.last_index() {
            Some(last) if last == index => {
                self.values.pop();
                self.values.push(value);
            }
            last => {
                debug_assert!(last.map_or(true, |last| last < index));
                self.indices.push(index);
                self.values.push(value);
            }
        }
    }

    pub fn get(&self, i: usize) -> Option<(TimeIndex, Value)> {
        Some((*self.indices.get(i)?, self.values.get(i)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (TimeIndex, Value)> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// The value in effect at `index`, i.e. the last change at or before it.
    pub fn value_at_index(&self, index: TimeIndex) -> Option<Value> {
        let i = self.indices.partition_point(|&i| i <= index);
        self.values.get(i.checked_sub(1)?)
    }
}
