//! Directory contract.
//!
//! The directory assigns characters and spaces to shards. A shard reports what it
//! holds with a [`ShardRegistration`] and receives [`DirectoryUpdate`]s whose id lists,
//! when present, replace the previous assignment. [`ReconcilePlan::compute`] turns an
//! update into the loads and unloads that bring the shard in line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::engine::errors::EngineError;
use crate::engine::types::{CharacterId, SpaceId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRegistration {
    pub shard: String,
    pub characters: Vec<CharacterId>,
    pub spaces: Vec<SpaceId>,
}

/// Text the directory forwards to a character held by this shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMessage {
    pub to: CharacterId,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUpdate {
    #[serde(default)]
    pub characters: Option<Vec<CharacterId>>,
    #[serde(default)]
    pub spaces: Option<Vec<SpaceId>>,
    #[serde(default)]
    pub messages: Option<Vec<DirectoryMessage>>,
}

impl DirectoryUpdate {
    pub fn from_json_str(contents: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Work needed to apply one update. Spaces load before characters and unload after
/// them so a character always has its space available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub load_spaces: Vec<SpaceId>,
    pub load_characters: Vec<CharacterId>,
    pub unload_characters: Vec<CharacterId>,
    pub unload_spaces: Vec<SpaceId>,
}

impl ReconcilePlan {
    pub fn compute(
        held_characters: &BTreeSet<CharacterId>,
        held_spaces: &BTreeSet<SpaceId>,
        update: &DirectoryUpdate,
    ) -> Self {
        let mut plan = ReconcilePlan::default();
        if let Some(assigned) = &update.spaces {
            let assigned: BTreeSet<&SpaceId> = assigned.iter().collect();
            plan.load_spaces = assigned
                .iter()
                .filter(|id| !held_spaces.contains(**id))
                .map(|id| (*id).clone())
                .collect();
            plan.unload_spaces = held_spaces
                .iter()
                .filter(|id| !assigned.contains(id))
                .cloned()
                .collect();
        }
        if let Some(assigned) = &update.characters {
            let assigned: BTreeSet<&CharacterId> = assigned.iter().collect();
            plan.load_characters = assigned
                .iter()
                .filter(|id| !held_characters.contains(**id))
                .map(|id| (*id).clone())
                .collect();
            plan.unload_characters = held_characters
                .iter()
                .filter(|id| !assigned.contains(id))
                .cloned()
                .collect();
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.load_spaces.is_empty()
            && self.load_characters.is_empty()
            && self.unload_characters.is_empty()
            && self.unload_spaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set<T: Ord + Clone>(items: &[T]) -> BTreeSet<T> {
        items.iter().cloned().collect()
    }

    #[test]
    fn absent_lists_leave_that_kind_alone() {
        let held_characters = set(&[CharacterId::new("a")]);
        let held_spaces = set(&[SpaceId::new("s1")]);
        let update = DirectoryUpdate {
            spaces: Some(vec!["s1".into(), "s2".into()]),
            ..Default::default()
        };
        let plan = ReconcilePlan::compute(&held_characters, &held_spaces, &update);
        assert_eq!(plan.load_spaces, vec![SpaceId::new("s2")]);
        assert!(plan.unload_spaces.is_empty());
        assert!(plan.load_characters.is_empty());
        assert!(plan.unload_characters.is_empty());
    }

    #[test]
    fn missing_ids_are_unloaded() {
        let held_characters = set(&[CharacterId::new("a"), CharacterId::new("b")]);
        let held_spaces = set(&[SpaceId::new("s1"), SpaceId::new("s2")]);
        let update = DirectoryUpdate {
            characters: Some(vec!["b".into(), "c".into()]),
            spaces: Some(vec!["s2".into()]),
            messages: None,
        };
        let plan = ReconcilePlan::compute(&held_characters, &held_spaces, &update);
        assert_eq!(plan.unload_characters, vec![CharacterId::new("a")]);
        assert_eq!(plan.load_characters, vec![CharacterId::new("c")]);
        assert_eq!(plan.unload_spaces, vec![SpaceId::new("s1")]);
        assert!(plan.load_spaces.is_empty());

        let again = ReconcilePlan::compute(
            &set(&[CharacterId::new("b"), CharacterId::new("c")]),
            &set(&[SpaceId::new("s2")]),
            &update,
        );
        assert!(again.is_empty());
    }

    #[test]
    fn update_reads_partial_json() {
        let update = DirectoryUpdate::from_json_str(r#"{"characters": ["a"], "messages": [{"to": "a", "text": "hi"}]}"#)
            .unwrap();
        assert_eq!(update.characters, Some(vec![CharacterId::new("a")]));
        assert!(update.spaces.is_none());
        assert_eq!(update.messages.unwrap()[0].text, "hi");
    }
}
