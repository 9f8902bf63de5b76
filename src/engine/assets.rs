//! Asset catalogue consumed by the engine.
//!
//! Asset content (art, descriptions) is owned elsewhere; the engine only needs the
//! identifiers plus enough layout to validate items: which modules an asset declares,
//! whether it can be worn, whether it is a lock, and which effects it contributes.
//! Operators supply the catalogue as a JSON file so layouts can change without recompiling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::engine::effects::EffectContribution;
use crate::engine::errors::EngineError;
use crate::engine::types::{AssetId, Item, ItemId, ItemModuleState};

/// Declared module layout of an asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleKind {
    Storage { max_items: usize },
    LockSlot,
    Typed { variants: Vec<String>, default: String },
}

impl ModuleKind {
    /// Default runtime state for a freshly created item.
    pub fn initial_state(&self) -> ItemModuleState {
        match self {
            ModuleKind::Storage { .. } => ItemModuleState::Storage {
                contents: Vec::new(),
            },
            ModuleKind::LockSlot => ItemModuleState::LockSlot {
                contents: Vec::new(),
                locked: false,
            },
            ModuleKind::Typed { default, .. } => ItemModuleState::Typed {
                variant: default.clone(),
            },
        }
    }

    /// True when `state` is the runtime shape this declaration expects.
    pub fn matches(&self, state: &ItemModuleState) -> bool {
        matches!(
            (self, state),
            (ModuleKind::Storage { .. }, ItemModuleState::Storage { .. })
                | (ModuleKind::LockSlot, ItemModuleState::LockSlot { .. })
                | (ModuleKind::Typed { .. }, ItemModuleState::Typed { .. })
        )
    }

    pub fn capacity(&self) -> usize {
        match self {
            ModuleKind::Storage { max_items } => *max_items,
            ModuleKind::LockSlot => 1,
            ModuleKind::Typed { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetDefinition {
    pub id: AssetId,
    pub name: String,
    #[serde(default)]
    pub wearable: bool,
    #[serde(default)]
    pub is_lock: bool,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleKind>,
    #[serde(default)]
    pub effects: EffectContribution,
}

impl AssetDefinition {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: AssetId::new(id),
            name: name.to_string(),
            wearable: false,
            is_lock: false,
            modules: BTreeMap::new(),
            effects: EffectContribution::default(),
        }
    }

    pub fn wearable(mut self) -> Self {
        self.wearable = true;
        self
    }

    pub fn lock(mut self) -> Self {
        self.is_lock = true;
        self
    }

    pub fn with_module(mut self, name: &str, kind: ModuleKind) -> Self {
        self.modules.insert(name.to_string(), kind);
        self
    }

    pub fn with_effects(mut self, effects: EffectContribution) -> Self {
        self.effects = effects;
        self
    }

    pub fn has_lock_slot(&self) -> bool {
        self.modules
            .values()
            .any(|kind| matches!(kind, ModuleKind::LockSlot))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetCatalog {
    assets: BTreeMap<AssetId, AssetDefinition>,
}

impl AssetCatalog {
    pub fn new(definitions: impl IntoIterator<Item = AssetDefinition>) -> Self {
        Self {
            assets: definitions
                .into_iter()
                .map(|definition| (definition.id.clone(), definition))
                .collect(),
        }
    }

    pub fn get(&self, id: &AssetId) -> Option<&AssetDefinition> {
        self.assets.get(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Create a new item of `asset` with every declared module in its initial state.
    pub fn instantiate(&self, asset: &AssetId, id: ItemId) -> Option<Item> {
        let definition = self.get(asset)?;
        let mut item = Item::new(id, asset.clone());
        for (name, kind) in &definition.modules {
            item.modules.insert(name.clone(), kind.initial_state());
        }
        Some(item)
    }

    /// True when the item or anything nested in it declares a lock slot.
    pub fn item_has_lock_slot(&self, item: &Item) -> bool {
        let mut found = false;
        item.walk(&mut |nested| {
            if self
                .get(&nested.asset)
                .map(AssetDefinition::has_lock_slot)
                .unwrap_or(false)
            {
                found = true;
            }
        });
        found
    }

    pub fn from_json_str(contents: &str) -> Result<Self, EngineError> {
        let definitions: Vec<AssetDefinition> = serde_json::from_str(contents)?;
        Ok(Self::new(definitions))
    }

    /// Load the catalogue from a JSON array of asset definitions.
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse {}: {}", path.display(), e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"id": "a/cuffs", "name": "Cuffs", "wearable": true,
         "modules": {"lock": {"kind": "lock_slot"}},
         "effects": {"block_hands": true}},
        {"id": "a/padlock", "name": "Padlock", "is_lock": true},
        {"id": "a/crate", "name": "Crate",
         "modules": {"storage": {"kind": "storage", "max_items": 4}}}
    ]"#;

    #[test]
    fn parses_catalogue_json() {
        let catalog = AssetCatalog::from_json_str(SAMPLE).expect("parse");
        assert_eq!(catalog.len(), 3);
        let cuffs = catalog.get(&"a/cuffs".into()).expect("cuffs");
        assert!(cuffs.wearable);
        assert!(cuffs.has_lock_slot());
        assert!(cuffs.effects.block_hands);
        assert!(catalog.get(&"a/padlock".into()).expect("lock").is_lock);
    }

    #[test]
    fn instantiate_creates_declared_modules() {
        let catalog = AssetCatalog::from_json_str(SAMPLE).expect("parse");
        let item = catalog
            .instantiate(&"a/crate".into(), "box1".into())
            .expect("known asset");
        assert_eq!(
            item.modules.get("storage"),
            Some(&ItemModuleState::Storage {
                contents: Vec::new()
            })
        );
        assert!(catalog.instantiate(&"a/missing".into(), "x".into()).is_none());
    }

    #[test]
    fn load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("assets.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = AssetCatalog::load_from_json(&path).expect_err("should fail");
        assert!(err.to_string().contains("assets.json"));
    }
}
