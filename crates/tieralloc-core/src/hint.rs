//! Allocation hints and the process-wide default hint.
//!
//! Hints are a closed set validated once at the boundary. The default hint
//! lives in a single atomic cell; [`HintScope`] overrides it for a lexical
//! scope and puts back whatever value it displaced, so nested scopes unwind
//! correctly no matter what the outer value was.

use crate::error::TierError;
use crate::tier::TierId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Placement hint. Discriminants match the C `ta_hint_t` values; `0` is
/// reserved for "no hint".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Hint {
    Hot = 1,
    Warm = 2,
    Cold = 3,
    PinFast = 4,
    PreferFast = 5,
}

impl Hint {
    pub const ALL: [Hint; 5] = [
        Self::Hot,
        Self::Warm,
        Self::Cold,
        Self::PinFast,
        Self::PreferFast,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::PinFast => "pin_fast",
            Self::PreferFast => "prefer_fast",
        }
    }

    /// Tier this hint asks for before any fallback.
    #[must_use]
    pub const fn preferred_tier(self) -> TierId {
        match self {
            Self::PinFast | Self::PreferFast => TierId::PinFast,
            Self::Hot | Self::Warm => TierId::Hot,
            Self::Cold => TierId::Cold,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Decode a C hint value. `Ok(None)` for `0` (no hint).
    pub fn from_raw(raw: i64) -> Result<Option<Self>, TierError> {
        match raw {
            0 => Ok(None),
            1 => Ok(Some(Self::Hot)),
            2 => Ok(Some(Self::Warm)),
            3 => Ok(Some(Self::Cold)),
            4 => Ok(Some(Self::PinFast)),
            5 => Ok(Some(Self::PreferFast)),
            other => Err(TierError::invalid_hint(other.to_string())),
        }
    }

    const fn from_cell(raw: u8) -> Self {
        match raw {
            1 => Self::Hot,
            3 => Self::Cold,
            4 => Self::PinFast,
            5 => Self::PreferFast,
            _ => Self::Warm,
        }
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hint {
    type Err = TierError;

    /// Case-insensitive; `-` and `_` are interchangeable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            "pin_fast" => Ok(Self::PinFast),
            "prefer_fast" => Ok(Self::PreferFast),
            _ => Err(TierError::invalid_hint(s)),
        }
    }
}

/// Atomic cell holding one [`Hint`].
///
/// Release on store, acquire on load: a reader sees either the old or the new
/// hint, never a torn value.
#[derive(Debug)]
pub struct HintCell {
    raw: AtomicU8,
}

impl HintCell {
    #[must_use]
    pub const fn new(initial: Hint) -> Self {
        Self {
            raw: AtomicU8::new(initial.as_raw()),
        }
    }

    #[must_use]
    pub fn get(&self) -> Hint {
        Hint::from_cell(self.raw.load(Ordering::Acquire))
    }

    pub fn set(&self, hint: Hint) {
        self.raw.store(hint.as_raw(), Ordering::Release);
    }

    /// Store `hint` and return the value it displaced.
    pub fn replace(&self, hint: Hint) -> Hint {
        Hint::from_cell(self.raw.swap(hint.as_raw(), Ordering::AcqRel))
    }
}

impl Default for HintCell {
    fn default() -> Self {
        Self::new(Hint::Warm)
    }
}

/// Overrides a [`HintCell`] until dropped, then restores the displaced value.
#[must_use = "the previous hint is restored as soon as the scope is dropped"]
#[derive(Debug)]
pub struct HintScope<'a> {
    cell: &'a HintCell,
    previous: Hint,
}

impl<'a> HintScope<'a> {
    pub fn enter(cell: &'a HintCell, hint: Hint) -> Self {
        let previous = cell.replace(hint);
        Self { cell, previous }
    }

    /// Value that will be restored on drop.
    #[must_use]
    pub fn previous(&self) -> Hint {
        self.previous
    }
}

impl Drop for HintScope<'_> {
    fn drop(&mut self) {
        self.cell.set(self.previous);
    }
}
