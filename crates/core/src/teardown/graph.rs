use std::collections::{BTreeMap, BTreeSet};

use crate::model::Unit;

/// For each live unit, the live units that depend on it.
///
/// Rebuilt from scratch every teardown round; it never outlives the unit
/// snapshot it was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseDependencyMap {
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ReverseDependencyMap {
    /// Builds the map from one snapshot of live units.
    ///
    /// Every live unit is a key. Dependencies on units that are no longer live
    /// and a unit's dependency on itself are not recorded.
    pub fn build(live: &[Unit]) -> Self {
        let mut dependents: BTreeMap<String, BTreeSet<String>> = live
            .iter()
            .map(|u| (u.name.clone(), BTreeSet::new()))
            .collect();

        for unit in live {
            for required in &unit.requires {
                if required == &unit.name {
                    continue;
                }
                if let Some(set) = dependents.get_mut(required) {
                    set.insert(unit.name.clone());
                }
            }
        }

        Self { dependents }
    }

    /// Live dependents of `name`, or `None` if `name` is not live.
    pub fn dependents(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(name)
    }

    /// True if `name` is live and nothing live still requires it.
    pub fn is_eligible(&self, name: &str) -> bool {
        self.dependents.get(name).is_some_and(BTreeSet::is_empty)
    }

    /// Units from `live` that can be torn down this round, in `live` order.
    pub fn eligible<'a>(&self, live: &'a [Unit]) -> Vec<&'a Unit> {
        live.iter().filter(|u| self.is_eligible(&u.name)).collect()
    }

    /// Number of live units.
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    /// True if there are no live units.
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }
}
