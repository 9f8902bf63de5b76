//! Immutable global state of one space.
//!
//! A [`GlobalState`] bundles every present character's appearance with the shared space
//! state. Mutating operations return a new value; characters that did not change keep
//! sharing their `Arc`, so producing a new snapshot costs one map clone plus the states
//! that actually changed. Old snapshots stay valid for diffing until dropped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::engine::assets::{AssetCatalog, ModuleKind};
use crate::engine::types::{
    CharacterId, CharacterState, Item, ItemId, ItemModuleState, SpaceId, SpaceState,
};

/// First referential-integrity violation found in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("character {0} is present in the space but has no state")]
    MissingCharacterState(CharacterId),
    #[error("character {0} has state but is not present in the space")]
    CharacterNotPresent(CharacterId),
    #[error("character {character} belongs to space {found}, expected {expected}")]
    WrongSpace {
        character: CharacterId,
        expected: SpaceId,
        found: SpaceId,
    },
    #[error("character {character} is outside the room bounds")]
    OutOfBounds { character: CharacterId },
    #[error("item {item} references unknown asset {asset}")]
    UnknownAsset { item: ItemId, asset: String },
    #[error("item {item} is not wearable but is worn by {character}")]
    NotWearable { item: ItemId, character: CharacterId },
    #[error("duplicate item id {item} in {owner}")]
    DuplicateItem { owner: String, item: ItemId },
    #[error("item {item} is missing declared module {module}")]
    MissingModule { item: ItemId, module: String },
    #[error("item {item} has undeclared module {module}")]
    UndeclaredModule { item: ItemId, module: String },
    #[error("module {module} of item {item} does not match its declared kind")]
    ModuleKindMismatch { item: ItemId, module: String },
    #[error("module {module} of item {item} holds {count} items (capacity {capacity})")]
    OverCapacity {
        item: ItemId,
        module: String,
        count: usize,
        capacity: usize,
    },
    #[error("item {lock} in lock slot {module} of {item} is not a lock")]
    NotALock {
        item: ItemId,
        module: String,
        lock: ItemId,
    },
    #[error("lock slot {module} of item {item} is locked without a lock")]
    LockedWithoutLock { item: ItemId, module: String },
    #[error("module {module} of item {item} selects unknown variant {variant}")]
    UnknownVariant {
        item: ItemId,
        module: String,
        variant: String,
    },
}

/// Which parts of a snapshot differ from an older one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotChanges {
    pub characters: BTreeSet<CharacterId>,
    pub space: bool,
}

impl SnapshotChanges {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && !self.space
    }
}

/// Minimal data needed to rebuild a newer snapshot from an older one.
/// `None` character entries mean the character was removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaBundle {
    #[serde(default)]
    pub characters: BTreeMap<CharacterId, Option<CharacterState>>,
    #[serde(default)]
    pub space: Option<SpaceState>,
}

impl DeltaBundle {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.space.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBundle {
    pub characters: Vec<CharacterState>,
    pub space: SpaceState,
}

#[derive(Debug, Clone)]
pub struct GlobalState {
    assets: Arc<AssetCatalog>,
    characters: BTreeMap<CharacterId, Arc<CharacterState>>,
    space: Arc<SpaceState>,
}

impl PartialEq for GlobalState {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.assets, &other.assets) || self.assets == other.assets)
            && self.characters == other.characters
            && self.space == other.space
    }
}

impl Eq for GlobalState {}

impl GlobalState {
    pub fn new(assets: Arc<AssetCatalog>, space: SpaceState) -> Self {
        Self {
            assets,
            characters: BTreeMap::new(),
            space: Arc::new(space),
        }
    }

    pub fn assets(&self) -> &AssetCatalog {
        &self.assets
    }

    pub fn assets_handle(&self) -> Arc<AssetCatalog> {
        Arc::clone(&self.assets)
    }

    pub fn space(&self) -> &SpaceState {
        &self.space
    }

    pub fn space_id(&self) -> &SpaceId {
        &self.space.id
    }

    pub fn character(&self, id: &CharacterId) -> Option<&CharacterState> {
        self.characters.get(id).map(|state| state.as_ref())
    }

    pub fn characters(&self) -> impl Iterator<Item = &CharacterState> {
        self.characters.values().map(|state| state.as_ref())
    }

    pub fn character_ids(&self) -> impl Iterator<Item = &CharacterId> {
        self.characters.keys()
    }

    /// Replace (`Some`) or remove (`None`) one character's state.
    pub fn with_character(&self, id: &CharacterId, state: Option<CharacterState>) -> Self {
        let mut next = self.clone();
        match state {
            Some(state) => {
                next.characters.insert(id.clone(), Arc::new(state));
            }
            None => {
                next.characters.remove(id);
            }
        }
        next
    }

    pub fn with_space(&self, space: SpaceState) -> Self {
        let mut next = self.clone();
        next.space = Arc::new(space);
        next
    }

    /// Add a character state and mark it present in the space.
    pub fn join(&self, mut state: CharacterState) -> Self {
        state.space = self.space.id.clone();
        let id = state.id.clone();
        let mut space = self.space.as_ref().clone();
        space.characters.insert(id.clone());
        self.with_space(space).with_character(&id, Some(state))
    }

    /// Remove a character state and its presence entry.
    pub fn leave(&self, id: &CharacterId) -> Self {
        let mut space = self.space.as_ref().clone();
        space.characters.remove(id);
        self.with_space(space).with_character(id, None)
    }

    /// Copy-on-write update of one character; `None` when the character is absent.
    pub fn update_character(
        &self,
        id: &CharacterId,
        update: impl FnOnce(&mut CharacterState),
    ) -> Option<Self> {
        let mut state = self.character(id)?.clone();
        update(&mut state);
        Some(self.with_character(id, Some(state)))
    }

    pub fn update_space(&self, update: impl FnOnce(&mut SpaceState)) -> Self {
        let mut space = self.space.as_ref().clone();
        update(&mut space);
        self.with_space(space)
    }

    pub fn list_changes(&self, previous: &GlobalState) -> SnapshotChanges {
        let mut changes = SnapshotChanges {
            characters: BTreeSet::new(),
            space: !(Arc::ptr_eq(&self.space, &previous.space) || self.space == previous.space),
        };
        for (id, state) in &self.characters {
            let unchanged = previous
                .characters
                .get(id)
                .map(|old| Arc::ptr_eq(old, state) || old == state)
                .unwrap_or(false);
            if !unchanged {
                changes.characters.insert(id.clone());
            }
        }
        for id in previous.characters.keys() {
            if !self.characters.contains_key(id) {
                changes.characters.insert(id.clone());
            }
        }
        changes
    }

    pub fn export_delta(&self, previous: &GlobalState) -> DeltaBundle {
        let changes = self.list_changes(previous);
        DeltaBundle {
            characters: changes
                .characters
                .into_iter()
                .map(|id| {
                    let state = self.character(&id).cloned();
                    (id, state)
                })
                .collect(),
            space: changes.space.then(|| self.space.as_ref().clone()),
        }
    }

    /// Rebuild the newer snapshot a delta was exported from.
    pub fn apply_delta(&self, delta: &DeltaBundle) -> GlobalState {
        let mut next = self.clone();
        for (id, state) in &delta.characters {
            match state {
                Some(state) => {
                    next.characters.insert(id.clone(), Arc::new(state.clone()));
                }
                None => {
                    next.characters.remove(id);
                }
            }
        }
        if let Some(space) = &delta.space {
            next.space = Arc::new(space.clone());
        }
        next
    }

    pub fn export_full(&self) -> FullBundle {
        FullBundle {
            characters: self.characters().cloned().collect(),
            space: self.space.as_ref().clone(),
        }
    }

    pub fn load_full(assets: Arc<AssetCatalog>, bundle: FullBundle) -> Result<Self, SnapshotError> {
        let mut state = GlobalState::new(assets, bundle.space);
        for character in bundle.characters {
            state
                .characters
                .insert(character.id.clone(), Arc::new(character));
        }
        state.validate()?;
        Ok(state)
    }

    /// Check referential integrity. Pure: never mutates and never panics.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for id in &self.space.characters {
            if !self.characters.contains_key(id) {
                return Err(SnapshotError::MissingCharacterState(id.clone()));
            }
        }
        for (id, state) in &self.characters {
            if !self.space.characters.contains(id) {
                return Err(SnapshotError::CharacterNotPresent(id.clone()));
            }
            if state.space != self.space.id {
                return Err(SnapshotError::WrongSpace {
                    character: id.clone(),
                    expected: self.space.id.clone(),
                    found: state.space.clone(),
                });
            }
            if !self.space.config.size.contains(state.position) {
                return Err(SnapshotError::OutOfBounds {
                    character: id.clone(),
                });
            }
            for item in &state.items {
                let wearable = self
                    .assets
                    .get(&item.asset)
                    .map(|definition| definition.wearable)
                    .unwrap_or(true);
                if !wearable {
                    return Err(SnapshotError::NotWearable {
                        item: item.id.clone(),
                        character: id.clone(),
                    });
                }
            }
            self.validate_inventory(&format!("character {}", id), &state.items)?;
        }
        self.validate_inventory(&format!("space {}", self.space.id), &self.space.items)
    }

    fn validate_inventory(&self, owner: &str, items: &[Item]) -> Result<(), SnapshotError> {
        let mut seen = HashSet::new();
        for item in items {
            self.validate_item(owner, item, &mut seen)?;
        }
        Ok(())
    }

    fn validate_item<'a>(
        &self,
        owner: &str,
        item: &'a Item,
        seen: &mut HashSet<&'a ItemId>,
    ) -> Result<(), SnapshotError> {
        if !seen.insert(&item.id) {
            return Err(SnapshotError::DuplicateItem {
                owner: owner.to_string(),
                item: item.id.clone(),
            });
        }
        let Some(definition) = self.assets.get(&item.asset) else {
            return Err(SnapshotError::UnknownAsset {
                item: item.id.clone(),
                asset: item.asset.to_string(),
            });
        };
        for name in item.modules.keys() {
            if !definition.modules.contains_key(name) {
                return Err(SnapshotError::UndeclaredModule {
                    item: item.id.clone(),
                    module: name.clone(),
                });
            }
        }
        for (name, kind) in &definition.modules {
            let Some(state) = item.modules.get(name) else {
                return Err(SnapshotError::MissingModule {
                    item: item.id.clone(),
                    module: name.clone(),
                });
            };
            if !kind.matches(state) {
                return Err(SnapshotError::ModuleKindMismatch {
                    item: item.id.clone(),
                    module: name.clone(),
                });
            }
            match (kind, state) {
                (ModuleKind::Typed { variants, .. }, ItemModuleState::Typed { variant }) => {
                    if !variants.contains(variant) {
                        return Err(SnapshotError::UnknownVariant {
                            item: item.id.clone(),
                            module: name.clone(),
                            variant: variant.clone(),
                        });
                    }
                }
                (ModuleKind::LockSlot, ItemModuleState::LockSlot { contents, locked }) => {
                    if *locked && contents.is_empty() {
                        return Err(SnapshotError::LockedWithoutLock {
                            item: item.id.clone(),
                            module: name.clone(),
                        });
                    }
                    for lock in contents {
                        let is_lock = self
                            .assets
                            .get(&lock.asset)
                            .map(|definition| definition.is_lock)
                            .unwrap_or(false);
                        if !is_lock {
                            return Err(SnapshotError::NotALock {
                                item: item.id.clone(),
                                module: name.clone(),
                                lock: lock.id.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
            if let Some(contents) = state.contents() {
                if contents.len() > kind.capacity() {
                    return Err(SnapshotError::OverCapacity {
                        item: item.id.clone(),
                        module: name.clone(),
                        count: contents.len(),
                        capacity: kind.capacity(),
                    });
                }
                for nested in contents {
                    self.validate_item(owner, nested, seen)?;
                }
            }
        }
        Ok(())
    }
}
