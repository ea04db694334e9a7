/// Component lifecycle bookkeeping.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ComponentId(pub u32);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ComponentState {
    Candidate,
    Accepted,
    MergedAway,
    Rejected,
}

impl ComponentState {
    pub fn is_live(self) -> bool {
        matches!(self, ComponentState::Candidate | ComponentState::Accepted)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentRecord {
    pub id: ComponentId,
    pub state: ComponentState,
    /// Frame count at the time the component was created.
    pub born_frame: usize,
    /// Set when the component was absorbed by a merge.
    pub merged_into: Option<ComponentId>,
}

/// Every component ever created, keyed by id. Terminal records stay as history.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Registry {
    records: BTreeMap<ComponentId, ComponentRecord>,
    next_id: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, state: ComponentState, born_frame: usize) -> ComponentId {
        let id = ComponentId(self.next_id);
        self.next_id += 1;
        self.records.insert(
            id,
            ComponentRecord {
                id,
                state,
                born_frame,
                merged_into: None,
            },
        );
        id
    }

    pub fn accept(&mut self, id: ComponentId) {
        self.set_state(id, ComponentState::Accepted);
    }

    pub fn reject(&mut self, id: ComponentId) {
        self.set_state(id, ComponentState::Rejected);
    }

    pub fn merge_away(&mut self, id: ComponentId, into: ComponentId) {
        if let Some(rec) = self.records.get_mut(&id) {
            rec.state = ComponentState::MergedAway;
            rec.merged_into = Some(into);
        }
    }

    fn set_state(&mut self, id: ComponentId, state: ComponentState) {
        if let Some(rec) = self.records.get_mut(&id) {
            rec.state = state;
        }
    }

    pub fn get(&self, id: ComponentId) -> Option<&ComponentRecord> {
        self.records.get(&id)
    }

    pub fn state(&self, id: ComponentId) -> Option<ComponentState> {
        self.records.get(&id).map(|r| r.state)
    }

    pub fn live(&self) -> impl Iterator<Item = &ComponentRecord> {
        self.records.values().filter(|r| r.state.is_live())
    }

    pub fn records(&self) -> impl Iterator<Item = &ComponentRecord> {
        self.records.values()
    }

    pub fn count(&self, state: ComponentState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut reg = Registry::new();
        let a = reg.register(ComponentState::Candidate, 0);
        let b = reg.register(ComponentState::Accepted, 0);
        reg.accept(a);
        let c = reg.register(ComponentState::Accepted, 10);
        reg.merge_away(a, c);
        reg.merge_away(b, c);

        assert_eq!(reg.state(a), Some(ComponentState::MergedAway));
        assert_eq!(reg.get(b).and_then(|r| r.merged_into), Some(c));
        let live: Vec<ComponentId> = reg.live().map(|r| r.id).collect();
        assert_eq!(live, vec![c]);
        assert_eq!(reg.count(ComponentState::MergedAway), 2);
    }
}
