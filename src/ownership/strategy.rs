//! Pluggable owner-selection strategies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::access::MemberName;

/// Tie-break policy for choosing an entity owner among viable candidates.
///
/// `loads` maps each member to the number of entities it currently owns; strategies are
/// free to ignore it.
pub trait OwnerSelectionStrategy: Send + Sync + 'static {
    /// Pick the new owner, or `None` when no candidate is viable.
    fn select(
        &self,
        current_owner: Option<&MemberName>,
        viable_candidates: &[MemberName],
        loads: &HashMap<MemberName, usize>,
    ) -> Option<MemberName>;

    /// How long to wait before (re)selecting, letting candidates settle.
    fn selection_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Strategy name for logging and configuration.
    fn name(&self) -> &'static str;
}

/// Picks the first registered viable candidate, preferring the current owner when it is
/// still viable.
#[derive(Debug, Default)]
pub struct FirstCandidateSelectionStrategy;

impl OwnerSelectionStrategy for FirstCandidateSelectionStrategy {
    fn select(
        &self,
        current_owner: Option<&MemberName>,
        viable_candidates: &[MemberName],
        _loads: &HashMap<MemberName, usize>,
    ) -> Option<MemberName> {
        if let Some(current) = current_owner {
            if viable_candidates.contains(current) {
                return Some(current.clone());
            }
        }
        viable_candidates.first().cloned()
    }

    fn name(&self) -> &'static str {
        "first-candidate"
    }
}

/// Picks the viable candidate owning the fewest entities, keeping the current owner on
/// ties. Selection is delayed so that simultaneous registrations settle first.
#[derive(Debug)]
pub struct LeastLoadedCandidateSelectionStrategy {
    delay: Duration,
}

impl LeastLoadedCandidateSelectionStrategy {
    /// Create the strategy with the given settle delay.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl OwnerSelectionStrategy for LeastLoadedCandidateSelectionStrategy {
    fn select(
        &self,
        current_owner: Option<&MemberName>,
        viable_candidates: &[MemberName],
        loads: &HashMap<MemberName, usize>,
    ) -> Option<MemberName> {
        let mut best: Option<(&MemberName, usize)> = None;
        for candidate in viable_candidates {
            let load = loads.get(candidate).copied().unwrap_or(0);
            let better = match best {
                None => true,
                Some((_, best_load)) => {
                    load < best_load
                        || (load == best_load && Some(candidate) == current_owner)
                }
            };
            if better {
                best = Some((candidate, load));
            }
        }
        best.map(|(candidate, _)| candidate.clone())
    }

    fn selection_delay(&self) -> Duration {
        self.delay
    }

    fn name(&self) -> &'static str {
        "least-loaded"
    }
}

/// Per-entity-type strategy configuration.
///
/// Parsed from `<strategy>[,<delay-ms>]` values keyed by entity type, e.g.
/// `least-loaded,500`. Unconfigured types fall back to first-candidate with no delay.
#[derive(Clone, Default)]
pub struct SelectionStrategyConfig {
    strategies: HashMap<String, Arc<dyn OwnerSelectionStrategy>>,
}

impl SelectionStrategyConfig {
    /// Empty configuration: every type uses first-candidate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a strategy to an entity type.
    pub fn with_strategy(
        mut self,
        entity_type: impl Into<String>,
        strategy: Arc<dyn OwnerSelectionStrategy>,
    ) -> Self {
        self.strategies.insert(entity_type.into(), strategy);
        self
    }

    /// Parse one `<strategy>[,<delay-ms>]` value for an entity type.
    pub fn parse_entry(self, entity_type: impl Into<String>, value: &str) -> Result<Self, String> {
        let (name, delay) = match value.split_once(',') {
            Some((name, delay_ms)) => {
                let ms: u64 = delay_ms
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid selection delay: {delay_ms}"))?;
                (name.trim(), Duration::from_millis(ms))
            }
            None => (value.trim(), Duration::ZERO),
        };
        let strategy: Arc<dyn OwnerSelectionStrategy> = match name {
            "first-candidate" => Arc::new(FirstCandidateSelectionStrategy),
            "least-loaded" => Arc::new(LeastLoadedCandidateSelectionStrategy::new(delay)),
            other => return Err(format!("unknown selection strategy: {other}")),
        };
        Ok(self.with_strategy(entity_type, strategy))
    }

    /// Parse `entity.type.<type>=<strategy>[,<delay-ms>]` property lines; lines not
    /// matching the prefix are ignored.
    pub fn parse_properties<'a>(
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, String> {
        let mut config = Self::new();
        for line in lines {
            let line = line.trim();
            let Some(rest) = line.strip_prefix("entity.type.") else {
                continue;
            };
            let (entity_type, value) = rest
                .split_once('=')
                .ok_or_else(|| format!("missing '=' in strategy entry: {line}"))?;
            config = config.parse_entry(entity_type.trim(), value)?;
        }
        Ok(config)
    }

    /// The strategy for `entity_type`.
    pub fn strategy_for(&self, entity_type: &str) -> Arc<dyn OwnerSelectionStrategy> {
        self.strategies
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(FirstCandidateSelectionStrategy))
    }
}

impl std::fmt::Debug for SelectionStrategyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (entity_type, strategy) in &self.strategies {
            map.entry(entity_type, &strategy.name());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> Vec<MemberName> {
        names.iter().map(|n| MemberName::new(n)).collect()
    }

    #[test]
    fn test_first_candidate_prefers_current_owner() {
        let strategy = FirstCandidateSelectionStrategy;
        let candidates = members(&["n1", "n2", "n3"]);
        let current = MemberName::new("n2");

        let owner = strategy.select(Some(&current), &candidates, &HashMap::new());
        assert_eq!(owner, Some(current));
    }

    #[test]
    fn test_first_candidate_falls_back_to_first() {
        let strategy = FirstCandidateSelectionStrategy;
        let candidates = members(&["n1", "n2"]);
        let gone = MemberName::new("n9");

        let owner = strategy.select(Some(&gone), &candidates, &HashMap::new());
        assert_eq!(owner, Some(MemberName::new("n1")));
        assert_eq!(strategy.select(None, &[], &HashMap::new()), None);
    }

    #[test]
    fn test_least_loaded_picks_lowest() {
        let strategy = LeastLoadedCandidateSelectionStrategy::new(Duration::ZERO);
        let candidates = members(&["n1", "n2", "n3"]);
        let mut loads = HashMap::new();
        loads.insert(MemberName::new("n1"), 5);
        loads.insert(MemberName::new("n2"), 1);
        loads.insert(MemberName::new("n3"), 3);

        let owner = strategy.select(None, &candidates, &loads);
        assert_eq!(owner, Some(MemberName::new("n2")));
    }

    #[test]
    fn test_least_loaded_keeps_current_owner_on_tie() {
        let strategy = LeastLoadedCandidateSelectionStrategy::new(Duration::ZERO);
        let candidates = members(&["n1", "n2"]);
        let loads = HashMap::new();
        let current = MemberName::new("n2");

        let owner = strategy.select(Some(&current), &candidates, &loads);
        assert_eq!(owner, Some(current));
    }

    #[test]
    fn test_unknown_member_counts_as_unloaded() {
        let strategy = LeastLoadedCandidateSelectionStrategy::new(Duration::ZERO);
        let candidates = members(&["n1", "n2"]);
        let mut loads = HashMap::new();
        loads.insert(MemberName::new("n1"), 2);

        let owner = strategy.select(None, &candidates, &loads);
        assert_eq!(owner, Some(MemberName::new("n2")));
    }

    #[test]
    fn test_config_parsing() {
        let config = SelectionStrategyConfig::new()
            .parse_entry("topology", "least-loaded,250")
            .unwrap()
            .parse_entry("inventory", "first-candidate")
            .unwrap();

        assert_eq!(config.strategy_for("topology").name(), "least-loaded");
        assert_eq!(
            config.strategy_for("topology").selection_delay(),
            Duration::from_millis(250)
        );
        assert_eq!(config.strategy_for("inventory").name(), "first-candidate");
        assert_eq!(config.strategy_for("other").name(), "first-candidate");
    }

    #[test]
    fn test_config_from_properties() {
        let config = SelectionStrategyConfig::parse_properties([
            "entity.type.topology=least-loaded,500",
            "entity.type.openflow=first-candidate",
            "some.unrelated.key=value",
        ])
        .unwrap();

        assert_eq!(config.strategy_for("topology").name(), "least-loaded");
        assert_eq!(config.strategy_for("openflow").name(), "first-candidate");

        assert!(SelectionStrategyConfig::parse_properties(["entity.type.x"]).is_err());
    }

    #[test]
    fn test_config_rejects_unknown_strategy() {
        assert!(SelectionStrategyConfig::new()
            .parse_entry("topology", "round-robin")
            .is_err());
        assert!(SelectionStrategyConfig::new()
            .parse_entry("topology", "least-loaded,abc")
            .is_err());
    }
}
