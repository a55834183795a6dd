//! Monotonic sequence numbers that refuse to wrap.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// An unsigned integer limited to 53 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct U53(u64);

impl U53 {
    pub const MAX: U53 = U53((1 << 53) - 1);
    pub const ZERO: U53 = U53(0);

    pub fn new(value: u64) -> Option<Self> {
        (value <= Self::MAX.0).then_some(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for U53 {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self> {
        U53::new(value).ok_or(ProtocolError::OutOfRange { kind: "u53", value })
    }
}

impl From<U53> for u64 {
    fn from(value: U53) -> Self {
        value.0
    }
}

impl fmt::Display for U53 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Value type backing a [`SequenceNumber`].
pub trait SequenceValue: Copy + Ord + fmt::Debug {
    const MAX: Self;
    const KIND: &'static str;

    /// `self + 1`. Only called below [`SequenceValue::MAX`].
    fn increment(self) -> Self;
}

impl SequenceValue for u32 {
    const MAX: Self = u32::MAX;
    const KIND: &'static str = "u32";

    fn increment(self) -> Self {
        self + 1
    }
}

impl SequenceValue for u64 {
    const MAX: Self = u64::MAX;
    const KIND: &'static str = "u64";

    fn increment(self) -> Self {
        self + 1
    }
}

impl SequenceValue for U53 {
    const MAX: Self = U53::MAX;
    const KIND: &'static str = "u53";

    fn increment(self) -> Self {
        U53(self.0 + 1)
    }
}

/// A counter whose [`next`](SequenceNumber::next) value is always the
/// current value plus one. Reaching the maximum is an error, never a wrap.
#[derive(Debug, Clone)]
pub struct SequenceNumber<T: SequenceValue> {
    value: T,
    max: T,
}

pub type SequenceNumberU32 = SequenceNumber<u32>;
pub type SequenceNumberU53 = SequenceNumber<U53>;
pub type SequenceNumberU64 = SequenceNumber<u64>;

impl<T: SequenceValue> SequenceNumber<T> {
    pub fn new(initial: T) -> Self {
        Self::with_max(initial, T::MAX)
    }

    /// Counter with a lower maximum than the value type allows.
    pub fn with_max(initial: T, max: T) -> Self {
        Self {
            value: initial.min(max),
            max,
        }
    }

    pub fn current(&self) -> T {
        self.value
    }

    pub fn next(&mut self) -> Result<T> {
        if self.value >= self.max {
            return Err(ProtocolError::SequenceNumberExhausted(T::KIND));
        }
        self.value = self.value.increment();
        Ok(self.value)
    }
}
