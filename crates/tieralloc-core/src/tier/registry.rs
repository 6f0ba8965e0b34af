//! Tier registry.
//!
//! Built once from an ordered tier list and immutable afterwards: lookups are
//! plain reads of a fixed table indexed by [`TierId`].

use super::{Tier, TierId, TierSpec};
use crate::error::TierError;
use tieralloc_membrane::RuntimeConfig;

/// Immutable set of registered tiers.
#[derive(Debug)]
pub struct TierRegistry {
    slots: [Option<Tier>; TierId::COUNT],
    order: Vec<TierId>,
}

/// Collects tier specs and validates the fallback graph.
#[derive(Debug, Default, Clone)]
pub struct TierRegistryBuilder {
    specs: Vec<TierSpec>,
}

impl TierRegistryBuilder {
    #[must_use]
    pub fn tier(mut self, spec: TierSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Rejects an empty tier list, duplicate tiers, fallback edges to tiers
    /// that are not registered and fallback cycles.
    pub fn build(self) -> Result<TierRegistry, TierError> {
        if self.specs.is_empty() {
            return Err(TierError::Config("no tiers registered".to_string()));
        }

        let mut slots: [Option<Tier>; TierId::COUNT] = [None, None, None];
        let mut order = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let slot = &mut slots[spec.id.index()];
            if slot.is_some() {
                return Err(TierError::Config(format!(
                    "tier `{}` registered twice",
                    spec.id
                )));
            }
            *slot = Some(Tier::new(*spec));
            order.push(spec.id);
        }

        for spec in &self.specs {
            let Some(target) = spec.fallback else {
                continue;
            };
            if slots[target.index()].is_none() {
                return Err(TierError::Config(format!(
                    "tier `{}` falls back to unregistered tier `{target}`",
                    spec.id
                )));
            }
        }

        for spec in &self.specs {
            let mut cursor = spec.fallback;
            let mut steps = 0;
            while let Some(next) = cursor {
                steps += 1;
                if next == spec.id || steps > TierId::COUNT {
                    return Err(TierError::Config(format!(
                        "fallback cycle through tier `{}`",
                        spec.id
                    )));
                }
                cursor = slots[next.index()].as_ref().and_then(Tier::fallback);
            }
        }

        Ok(TierRegistry { slots, order })
    }
}

impl TierRegistry {
    #[must_use]
    pub fn builder() -> TierRegistryBuilder {
        TierRegistryBuilder::default()
    }

    /// All three built-in tiers with their default fallback edges.
    #[must_use]
    pub fn standard() -> Self {
        let slots = TierId::ALL.map(|id| Some(Tier::new(TierSpec::new(id))));
        Self {
            slots,
            order: TierId::ALL.to_vec(),
        }
    }

    /// All three tiers with capacities and costs taken from `config`.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, TierError> {
        TierId::ALL
            .iter()
            .fold(Self::builder(), |builder, &id| {
                builder.tier(TierSpec::from_config(id, &config.tiers[id.index()]))
            })
            .build()
    }

    /// Look up a registered tier.
    pub fn resolve(&self, id: TierId) -> Result<&Tier, TierError> {
        self.slots[id.index()]
            .as_ref()
            .ok_or_else(|| TierError::UnknownTier {
                tier: id.as_str().to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, id: TierId) -> bool {
        self.slots[id.index()].is_some()
    }

    /// Registered tiers in registration order.
    pub fn tiers(&self) -> impl Iterator<Item = &Tier> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.slots[id.index()].as_ref())
    }

    /// `start` followed by every tier reachable through fallback edges.
    ///
    /// Empty when `start` is not registered.
    #[must_use]
    pub fn fallback_chain(&self, start: TierId) -> FallbackChain<'_> {
        FallbackChain {
            registry: self,
            next: self.contains(start).then_some(start),
        }
    }
}

/// Iterator over a fallback chain. Finite because the builder rejects cycles.
#[derive(Debug, Clone)]
pub struct FallbackChain<'r> {
    registry: &'r TierRegistry,
    next: Option<TierId>,
}

impl Iterator for FallbackChain<'_> {
    type Item = TierId;

    fn next(&mut self) -> Option<TierId> {
        let current = self.next?;
        self.next = self.registry.slots[current.index()]
            .as_ref()
            .and_then(Tier::fallback);
        Some(current)
    }
}
