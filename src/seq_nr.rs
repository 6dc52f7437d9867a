use std::ops::Deref;

// Two sequence numbers further apart than this (as signed 16-bit values) are assumed to
// have wrapped around.
const WRAP_THRESHOLD: i32 = (i16::MAX / 2) as i32;

#[derive(PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNr(pub u16);

impl Deref for SeqNr {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u16> for SeqNr {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SeqNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for SeqNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::ops::Add<u16> for SeqNr {
    type Output = SeqNr;

    fn add(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u16> for SeqNr {
    type Output = SeqNr;

    fn sub(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl std::ops::AddAssign<u16> for SeqNr {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl SeqNr {
    /// Wrap-aware "self was sent after other".
    ///
    /// Both values are looked at as signed 16-bit numbers. If they are far apart, the
    /// numerically larger one is the older one as the counter must have wrapped in between.
    /// This is not a total order: it's only meaningful for values within a fraction of the
    /// sequence space of each other, which the in-flight limit guarantees.
    pub fn is_after(self, other: SeqNr) -> bool {
        let lhs = self.0 as i16 as i32;
        let rhs = other.0 as i16 as i32;
        if (lhs - rhs).abs() > WRAP_THRESHOLD {
            return lhs < rhs;
        }
        lhs > rhs
    }

    /// How many sequence numbers lie between older and self, counting forward.
    pub fn distance_from(self, older: SeqNr) -> u16 {
        self.0.wrapping_sub(older.0)
    }
}
