use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

/// Sequence number of a fragment within a writer / flow pair. Every fragment a writer transmits
///  for the first time gets the next stage; the first fragment has stage 1, `ZERO` stands for
///  'nothing yet'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Stage(u64);

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Stage {
    pub const ZERO: Stage = Stage(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn next(&self) -> Stage {
        Stage(self.0.saturating_add(1))
    }

    /// number of stages from `lower` to `self`, 0 if `lower` is not actually lower
    pub fn distance_from(&self, lower: Stage) -> u64 {
        self.0.saturating_sub(lower.0)
    }

    pub fn checked_minus(&self, other: u64) -> Option<Stage> {
        self.0.checked_sub(other).map(Stage)
    }

    pub fn checked_add(&self, other: u64) -> Option<Stage> {
        self.0.checked_add(other).map(Stage)
    }
}

impl Add<u64> for Stage {
    type Output = Stage;

    fn add(self, rhs: u64) -> Stage {
        Stage(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for Stage {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs);
    }
}
