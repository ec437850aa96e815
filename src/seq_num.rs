use std::fmt::{Display, Formatter};

/// A TxSeq / ReqSeq value. Sequence numbers live in a [SequenceSpace] and wrap around at its
///  modulus, so they are deliberately *not* `Ord`: any comparison must go through the space's
///  modular distance.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }
}


/// The modulus a channel's sequence numbers wrap around at: 64 for the 16-bit control fields,
///  16384 for the extended 32-bit control field.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SequenceSpace {
    modulus: u16,
}

impl SequenceSpace {
    pub const STANDARD: SequenceSpace = SequenceSpace { modulus: 64 };
    pub const EXTENDED: SequenceSpace = SequenceSpace { modulus: 16384 };

    pub fn new(modulus: u16) -> SequenceSpace {
        assert!(modulus.is_power_of_two(), "sequence modulus must be a power of two");
        SequenceSpace { modulus }
    }

    pub fn modulus(&self) -> u16 {
        self.modulus
    }

    /// maps an arbitrary raw value (e.g. a decoded bit field) into the space
    pub fn seq(&self, raw: u16) -> SeqNum {
        SeqNum(raw & (self.modulus - 1))
    }

    pub fn next(&self, seq: SeqNum) -> SeqNum {
        self.add(seq, 1)
    }

    pub fn add(&self, seq: SeqNum, n: u16) -> SeqNum {
        SeqNum(((seq.0 as u32 + n as u32) % self.modulus as u32) as u16)
    }

    /// The number of increments it takes to get from `from` to `to`, i.e. `(to - from) mod M`.
    ///  This is the only way sequence numbers are compared.
    pub fn offset(&self, from: SeqNum, to: SeqNum) -> u16 {
        ((to.0 as u32 + self.modulus as u32 - from.0 as u32) % self.modulus as u32) as u16
    }

    /// true iff `seq` lies in the half-open range `[lower, upper)` with wrap-around semantics
    pub fn in_range(&self, lower: SeqNum, upper: SeqNum, seq: SeqNum) -> bool {
        self.offset(lower, seq) < self.offset(lower, upper)
    }

    /// true iff `seq` lies in the closed range `[lower, upper]` with wrap-around semantics
    pub fn in_range_inclusive(&self, lower: SeqNum, upper: SeqNum, seq: SeqNum) -> bool {
        self.offset(lower, seq) <= self.offset(lower, upper)
    }

    /// iterates `from, from+1, ...` up to (excluding) `to`
    pub fn iter(&self, from: SeqNum, to: SeqNum) -> impl Iterator<Item = SeqNum> {
        let space = *self;
        (0..self.offset(from, to)).map(move |n| space.add(from, n))
    }
}
