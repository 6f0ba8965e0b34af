//! Hint resolution: call-scoped hint, then the global default, then the
//! system default.

use crate::error::TierError;
use crate::hint::Hint;
use crate::tier::TierId;
use crate::tier::registry::TierRegistry;
use serde::Serialize;

/// Hint used when neither the call nor the global default resolves.
pub const SYSTEM_DEFAULT_HINT: Hint = Hint::Warm;

/// Where the winning hint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSource {
    Call,
    Global,
    System,
}

impl HintSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Global => "global",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub tier: TierId,
    pub hint: Hint,
    pub source: HintSource,
}

/// Resolves hints against one registry.
#[derive(Debug, Clone, Copy)]
pub struct HintResolver<'r> {
    registry: &'r TierRegistry,
}

impl<'r> HintResolver<'r> {
    #[must_use]
    pub fn new(registry: &'r TierRegistry) -> Self {
        Self { registry }
    }

    /// First candidate whose preferred tier is registered wins.
    pub fn resolve_hint(
        &self,
        call_scoped: Option<Hint>,
        global_default: Option<Hint>,
    ) -> Result<Resolution, TierError> {
        let candidates = [
            (call_scoped, HintSource::Call),
            (global_default, HintSource::Global),
            (Some(SYSTEM_DEFAULT_HINT), HintSource::System),
        ];
        candidates
            .into_iter()
            .find_map(|(hint, source)| {
                let hint = hint?;
                let tier = hint.preferred_tier();
                self.registry.contains(tier).then_some(Resolution { tier, hint, source })
            })
            .ok_or_else(|| TierError::invalid_hint(SYSTEM_DEFAULT_HINT.as_str()))
    }
}
