use crate::error::{Result, RouteError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// An account balance in whole units.
///
/// Updates are additive deltas; overflow is rejected instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(pub i64);

impl Balance {
    pub const ZERO: Self = Self(0);

    pub fn new(amount: i64) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Applies a signed delta, failing on arithmetic overflow.
    pub fn apply(self, delta: i64) -> Result<Self> {
        self.0.checked_add(delta).map(Self).ok_or_else(|| {
            RouteError::ValidationError(format!("balance overflow applying delta {}", delta))
        })
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row of the logical `account(name, balance)` table.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Account {
    /// Unique key.
    pub name: String,
    pub balance: Balance,
}

impl Account {
    pub fn new(name: impl Into<String>, balance: i64) -> Self {
        Self {
            name: name.into(),
            balance: Balance::new(balance),
        }
    }
}
