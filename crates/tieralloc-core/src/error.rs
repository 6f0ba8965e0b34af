//! Error taxonomy for tier operations.

use crate::tier::TierId;

/// POSIX errno values the ABI reports for each [`TierError`].
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierError {
    #[error("tier `{tier}` is not registered")]
    UnknownTier { tier: String },

    #[error("invalid hint `{hint}`")]
    InvalidHint { hint: String },

    #[error("out of memory: {requested} bytes, tried tiers {tried:?}")]
    OutOfMemory { requested: usize, tried: Vec<TierId> },

    #[error("no live allocation for handle {handle:#x}")]
    InvalidHandle { handle: usize },

    #[error("{live} allocations are still live")]
    AllocationsStillLive { live: usize },

    #[error("allocation size overflows: {count} x {size}")]
    SizeOverflow { count: usize, size: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TierError {
    /// errno equivalent, used at the C boundary.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::UnknownTier { .. } => errno::ENOENT,
            Self::InvalidHint { .. } => errno::EINVAL,
            Self::OutOfMemory { .. } => errno::ENOMEM,
            Self::InvalidHandle { .. } => errno::EINVAL,
            Self::AllocationsStillLive { .. } => errno::EBUSY,
            Self::SizeOverflow { .. } => errno::ENOMEM,
            Self::Config(_) => errno::EINVAL,
        }
    }

    pub(crate) fn invalid_hint(hint: impl Into<String>) -> Self {
        Self::InvalidHint { hint: hint.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(
            TierError::UnknownTier {
                tier: "x".into()
            }
            .errno(),
            errno::ENOENT
        );
        assert_eq!(TierError::invalid_hint("lukewarm").errno(), errno::EINVAL);
        assert_eq!(
            TierError::OutOfMemory {
                requested: 1,
                tried: vec![TierId::Hot]
            }
            .errno(),
            errno::ENOMEM
        );
        assert_eq!(TierError::InvalidHandle { handle: 0 }.errno(), errno::EINVAL);
        assert_eq!(
            TierError::AllocationsStillLive { live: 3 }.errno(),
            errno::EBUSY
        );
        assert_eq!(
            TierError::SizeOverflow {
                count: usize::MAX,
                size: 2
            }
            .errno(),
            errno::ENOMEM
        );
        assert_eq!(TierError::Config("bad".into()).errno(), errno::EINVAL);
    }

    #[test]
    fn messages_carry_context() {
        let err = TierError::InvalidHandle { handle: 0x1000 };
        assert_eq!(err.to_string(), "no live allocation for handle 0x1000");
        let err = TierError::OutOfMemory {
            requested: 64,
            tried: vec![TierId::PinFast, TierId::Hot],
        };
        assert!(err.to_string().contains("PinFast"));
    }
}
