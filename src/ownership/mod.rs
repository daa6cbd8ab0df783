//! Entity ownership: electing a single owner per named entity among registered
//! candidates.
//!
//! The registry tracks candidates per entity and picks owners with the configured
//! per-entity-type strategy. Candidates are viable when their member is up and voting;
//! non-voting replicas never own entities. Re-selection after candidate or membership
//! churn is delayed by the strategy's settle time, and a newer event cancels a pending
//! selection.

mod strategy;

pub use strategy::{
    FirstCandidateSelectionStrategy, LeastLoadedCandidateSelectionStrategy,
    OwnerSelectionStrategy, SelectionStrategyConfig,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::access::MemberName;

/// A named entity within an entity type, e.g. `("topology", "flow:1")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    entity_type: SmolStr,
    name: SmolStr,
}

impl EntityId {
    /// Create an entity id.
    pub fn new(entity_type: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            entity_type: SmolStr::new(entity_type.as_ref()),
            name: SmolStr::new(name.as_ref()),
        }
    }

    /// The entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The entity name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.name)
    }
}

#[derive(Default)]
struct RegistryState {
    /// Candidates per entity, in registration order.
    candidates: HashMap<EntityId, Vec<MemberName>>,

    /// Current owner per entity; absent means no owner.
    owners: HashMap<EntityId, MemberName>,

    /// Members currently unreachable.
    down: HashSet<MemberName>,

    /// Members currently non-voting.
    non_voting: HashSet<MemberName>,

    /// Pending delayed selections, cancelled when superseded.
    scheduled: HashMap<EntityId, JoinHandle<()>>,
}

/// Tracks entity ownership candidates and elects owners.
pub struct OwnershipRegistry {
    config: SelectionStrategyConfig,
    state: Mutex<RegistryState>,
}

impl OwnershipRegistry {
    /// Create a registry with the given strategy configuration.
    pub fn new(config: SelectionStrategyConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Register `member` as a candidate for `entity`, scheduling owner selection.
    pub fn register_candidate(self: &Arc<Self>, entity: EntityId, member: MemberName) {
        {
            let mut state = self.state.lock();
            let candidates = state.candidates.entry(entity.clone()).or_default();
            if candidates.contains(&member) {
                return;
            }
            debug!(%entity, %member, "candidate registered");
            candidates.push(member);
        }
        self.schedule_selection(entity);
    }

    /// Withdraw `member`'s candidacy for `entity`.
    pub fn unregister_candidate(self: &Arc<Self>, entity: EntityId, member: &MemberName) {
        let owner_lost = {
            let mut state = self.state.lock();
            if let Some(candidates) = state.candidates.get_mut(&entity) {
                candidates.retain(|c| c != member);
            }
            state.owners.get(&entity) == Some(member)
        };
        if owner_lost {
            debug!(%entity, %member, "owner withdrew candidacy");
            self.schedule_selection(entity);
        }
    }

    /// Mark a member unreachable, re-selecting every entity it owns.
    pub fn member_down(self: &Arc<Self>, member: &MemberName) {
        let affected = {
            let mut state = self.state.lock();
            state.down.insert(member.clone());
            owned_by(&state, member)
        };
        info!(%member, entities = affected.len(), "member down, re-selecting owners");
        for entity in affected {
            self.schedule_selection(entity);
        }
    }

    /// Mark a member reachable again, re-selecting entities without an owner.
    pub fn member_up(self: &Arc<Self>, member: &MemberName) {
        let ownerless = {
            let mut state = self.state.lock();
            state.down.remove(member);
            state
                .candidates
                .keys()
                .filter(|entity| !state.owners.contains_key(entity))
                .cloned()
                .collect::<Vec<_>>()
        };
        for entity in ownerless {
            self.schedule_selection(entity);
        }
    }

    /// Record a member's voting flag; non-voting members are not viable owners.
    pub fn set_member_voting(self: &Arc<Self>, member: &MemberName, voting: bool) {
        let affected = {
            let mut state = self.state.lock();
            let changed = if voting {
                state.non_voting.remove(member)
            } else {
                state.non_voting.insert(member.clone())
            };
            if changed && !voting {
                owned_by(&state, member)
            } else {
                Vec::new()
            }
        };
        for entity in affected {
            self.schedule_selection(entity);
        }
    }

    /// The current owner of `entity`.
    pub fn owner_of(&self, entity: &EntityId) -> Option<MemberName> {
        self.state.lock().owners.get(entity).cloned()
    }

    /// Candidates for `entity` that are up and voting, in registration order.
    pub fn viable_candidates(&self, entity: &EntityId) -> Vec<MemberName> {
        let state = self.state.lock();
        viable(&state, entity)
    }

    /// Run owner selection for `entity` immediately.
    pub fn select_owner_now(&self, entity: &EntityId) -> Option<MemberName> {
        let strategy = self.config.strategy_for(entity.entity_type());
        let mut state = self.state.lock();

        let viable_candidates = viable(&state, entity);
        let loads = owned_counts(&state);
        let current = state.owners.get(entity).cloned();
        let new_owner = strategy.select(current.as_ref(), &viable_candidates, &loads);

        match &new_owner {
            Some(owner) => {
                if Some(owner) != current.as_ref() {
                    info!(%entity, %owner, strategy = strategy.name(), "owner selected");
                }
                state.owners.insert(entity.clone(), owner.clone());
            }
            None => {
                if current.is_some() {
                    info!(%entity, "no viable candidate, clearing owner");
                }
                state.owners.remove(entity);
            }
        }
        new_owner
    }

    /// Schedule selection after the strategy's settle delay, superseding any pending
    /// selection for the same entity.
    fn schedule_selection(self: &Arc<Self>, entity: EntityId) {
        let strategy = self.config.strategy_for(entity.entity_type());
        let delay = strategy.selection_delay();
        if delay.is_zero() {
            self.select_owner_now(&entity);
            return;
        }

        let registry = Arc::clone(self);
        let task_entity = entity.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.select_owner_now(&task_entity);
            registry.state.lock().scheduled.remove(&task_entity);
        });

        debug!(%entity, ?delay, "owner selection scheduled");
        if let Some(stale) = self.state.lock().scheduled.insert(entity, handle) {
            stale.abort();
        }
    }
}

fn viable(state: &RegistryState, entity: &EntityId) -> Vec<MemberName> {
    state
        .candidates
        .get(entity)
        .map(|candidates| {
            candidates
                .iter()
                .filter(|c| !state.down.contains(c) && !state.non_voting.contains(c))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn owned_by(state: &RegistryState, member: &MemberName) -> Vec<EntityId> {
    state
        .owners
        .iter()
        .filter(|(_, owner)| *owner == member)
        .map(|(entity, _)| entity.clone())
        .collect()
}

fn owned_counts(state: &RegistryState) -> HashMap<MemberName, usize> {
    let mut counts = HashMap::new();
    for owner in state.owners.values() {
        *counts.entry(owner.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn first_config() -> SelectionStrategyConfig {
        SelectionStrategyConfig::new()
    }

    #[tokio::test]
    async fn test_first_candidate_becomes_owner() {
        let registry = OwnershipRegistry::new(first_config());
        let entity = EntityId::new("topology", "flow:1");

        registry.register_candidate(entity.clone(), MemberName::new("n1"));
        registry.register_candidate(entity.clone(), MemberName::new("n2"));

        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n1")));
    }

    #[tokio::test]
    async fn test_owner_survives_new_candidates() {
        let registry = OwnershipRegistry::new(first_config());
        let entity = EntityId::new("topology", "flow:1");

        registry.register_candidate(entity.clone(), MemberName::new("n2"));
        registry.register_candidate(entity.clone(), MemberName::new("n1"));

        // n2 registered first and stays owner even though n1 sorts earlier.
        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n2")));
    }

    #[tokio::test]
    async fn test_down_member_loses_ownership() {
        let registry = OwnershipRegistry::new(first_config());
        let entity = EntityId::new("topology", "flow:1");
        let n1 = MemberName::new("n1");

        registry.register_candidate(entity.clone(), n1.clone());
        registry.register_candidate(entity.clone(), MemberName::new("n2"));
        assert_eq!(registry.owner_of(&entity), Some(n1.clone()));

        registry.member_down(&n1);
        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n2")));

        // Recovery does not steal ownership back.
        registry.member_up(&n1);
        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n2")));
    }

    #[tokio::test]
    async fn test_non_voting_member_not_viable() {
        let registry = OwnershipRegistry::new(first_config());
        let entity = EntityId::new("topology", "flow:1");
        let n1 = MemberName::new("n1");

        registry.set_member_voting(&n1, false);
        registry.register_candidate(entity.clone(), n1.clone());
        registry.register_candidate(entity.clone(), MemberName::new("n2"));

        assert_eq!(registry.viable_candidates(&entity), vec![MemberName::new("n2")]);
        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n2")));
    }

    #[tokio::test]
    async fn test_no_viable_candidates_clears_owner() {
        let registry = OwnershipRegistry::new(first_config());
        let entity = EntityId::new("topology", "flow:1");
        let n1 = MemberName::new("n1");

        registry.register_candidate(entity.clone(), n1.clone());
        assert_eq!(registry.owner_of(&entity), Some(n1.clone()));

        registry.member_down(&n1);
        assert_eq!(registry.owner_of(&entity), None);
    }

    #[tokio::test]
    async fn test_unregister_owner_reselects() {
        let registry = OwnershipRegistry::new(first_config());
        let entity = EntityId::new("topology", "flow:1");

        registry.register_candidate(entity.clone(), MemberName::new("n1"));
        registry.register_candidate(entity.clone(), MemberName::new("n2"));
        registry.unregister_candidate(entity.clone(), &MemberName::new("n1"));

        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n2")));
    }

    #[tokio::test]
    async fn test_delayed_selection_settles() {
        let config = SelectionStrategyConfig::new()
            .parse_entry("topology", "least-loaded,50")
            .unwrap();
        let registry = OwnershipRegistry::new(config);
        let entity = EntityId::new("topology", "flow:1");

        registry.register_candidate(entity.clone(), MemberName::new("n1"));
        // Selection is pending, not immediate.
        assert_eq!(registry.owner_of(&entity), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.owner_of(&entity), Some(MemberName::new("n1")));
    }

    #[tokio::test]
    async fn test_least_loaded_distributes() {
        let config = SelectionStrategyConfig::new()
            .parse_entry("topology", "least-loaded,0")
            .unwrap();
        let registry = OwnershipRegistry::new(config);
        let n1 = MemberName::new("n1");
        let n2 = MemberName::new("n2");

        for i in 0..4 {
            let entity = EntityId::new("topology", format!("flow:{i}"));
            registry.register_candidate(entity.clone(), n1.clone());
            registry.register_candidate(entity, n2.clone());
        }

        let owners: Vec<_> = (0..4)
            .map(|i| {
                registry
                    .owner_of(&EntityId::new("topology", format!("flow:{i}")))
                    .unwrap()
            })
            .collect();
        assert!(owners.contains(&n1));
        assert!(owners.contains(&n2));
    }
}
