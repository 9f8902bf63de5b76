use sled::IVec;
use std::path::{Path, PathBuf};

use crate::engine::character::CharacterBundle;
use crate::engine::errors::EngineError;
use crate::engine::space::SpaceBundle;
use crate::engine::types::{CharacterId, SpaceId, CHARACTER_SCHEMA_VERSION, SPACE_SCHEMA_VERSION};

const TREE_CHARACTERS: &str = "characters";
const TREE_SPACES: &str = "spaces";

/// Helper builder so tests can easily create throwaway stores with custom paths.
pub struct ShardStoreBuilder {
    path: PathBuf,
    flush_on_write: bool,
}

impl ShardStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_on_write: true,
        }
    }

    /// Leave flushing to sled's background thread (faster, used by bulk imports).
    pub fn without_flush_on_write(mut self) -> Self {
        self.flush_on_write = false;
        self
    }

    pub fn open(self) -> Result<ShardStore, EngineError> {
        ShardStore::open_with_options(self.path, self.flush_on_write)
    }
}

/// Counts reported by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub characters: usize,
    pub spaces: usize,
    pub size_on_disk: u64,
}

/// Sled-backed persistence for character and space bundles.
#[derive(Clone)]
pub struct ShardStore {
    db: sled::Db,
    characters: sled::Tree,
    spaces: sled::Tree,
    flush_on_write: bool,
}

impl ShardStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        Self::open_with_options(path, true)
    }

    fn open_with_options<P: AsRef<Path>>(path: P, flush_on_write: bool) -> Result<Self, EngineError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let characters = db.open_tree(TREE_CHARACTERS)?;
        let spaces = db.open_tree(TREE_SPACES)?;
        Ok(Self {
            db,
            characters,
            spaces,
            flush_on_write,
        })
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: IVec) -> Result<T, EngineError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    fn write(&self, tree: &sled::Tree, key: &str, bytes: Vec<u8>) -> Result<(), EngineError> {
        tree.insert(key.as_bytes(), bytes)?;
        if self.flush_on_write {
            tree.flush()?;
        }
        Ok(())
    }

    fn list_ids(tree: &sled::Tree) -> Result<Vec<String>, EngineError> {
        let mut ids = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    /// Insert or update a character bundle.
    pub fn put_character(&self, mut bundle: CharacterBundle) -> Result<(), EngineError> {
        bundle.schema_version = CHARACTER_SCHEMA_VERSION;
        let bytes = Self::serialize(&bundle)?;
        self.write(&self.characters, bundle.id.as_str(), bytes)
    }

    pub fn get_character(&self, id: &CharacterId) -> Result<CharacterBundle, EngineError> {
        let Some(bytes) = self.characters.get(id.as_str())? else {
            return Err(EngineError::NotFound(format!("character: {}", id)));
        };
        let bundle: CharacterBundle = Self::deserialize(bytes)?;
        if bundle.schema_version != CHARACTER_SCHEMA_VERSION {
            return Err(EngineError::SchemaMismatch {
                entity: "character",
                expected: CHARACTER_SCHEMA_VERSION,
                found: bundle.schema_version,
            });
        }
        Ok(bundle)
    }

    /// Returns true when a record was removed.
    pub fn delete_character(&self, id: &CharacterId) -> Result<bool, EngineError> {
        let removed = self.characters.remove(id.as_str())?.is_some();
        if self.flush_on_write {
            self.characters.flush()?;
        }
        Ok(removed)
    }

    pub fn list_character_ids(&self) -> Result<Vec<CharacterId>, EngineError> {
        Ok(Self::list_ids(&self.characters)?
            .into_iter()
            .map(CharacterId::new)
            .collect())
    }

    /// Insert or update a space bundle.
    pub fn put_space(&self, mut bundle: SpaceBundle) -> Result<(), EngineError> {
        bundle.schema_version = SPACE_SCHEMA_VERSION;
        let bytes = Self::serialize(&bundle)?;
        self.write(&self.spaces, bundle.id.as_str(), bytes)
    }

    pub fn get_space(&self, id: &SpaceId) -> Result<SpaceBundle, EngineError> {
        let Some(bytes) = self.spaces.get(id.as_str())? else {
            return Err(EngineError::NotFound(format!("space: {}", id)));
        };
        let bundle: SpaceBundle = Self::deserialize(bytes)?;
        if bundle.schema_version != SPACE_SCHEMA_VERSION {
            return Err(EngineError::SchemaMismatch {
                entity: "space",
                expected: SPACE_SCHEMA_VERSION,
                found: bundle.schema_version,
            });
        }
        Ok(bundle)
    }

    pub fn delete_space(&self, id: &SpaceId) -> Result<bool, EngineError> {
        let removed = self.spaces.remove(id.as_str())?.is_some();
        if self.flush_on_write {
            self.spaces.flush()?;
        }
        Ok(removed)
    }

    pub fn list_space_ids(&self) -> Result<Vec<SpaceId>, EngineError> {
        Ok(Self::list_ids(&self.spaces)?
            .into_iter()
            .map(SpaceId::new)
            .collect())
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        Ok(StoreStats {
            characters: self.characters.len(),
            spaces: self.spaces.len(),
            size_on_disk: self.db.size_on_disk()?,
        })
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.db.flush()?;
        Ok(())
    }
}
