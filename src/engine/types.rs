use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

pub const CHARACTER_SCHEMA_VERSION: u8 = 1;
pub const SPACE_SCHEMA_VERSION: u8 = 1;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Stable character identifier (`c123` style ids are issued by the directory).
    CharacterId
);
string_id!(
    /// Account owning one or more characters.
    AccountId
);
string_id!(
    /// Identifier of a shared space (room).
    SpaceId
);
string_id!(
    /// Item identifier, unique within the inventory that holds the item.
    ItemId
);
string_id!(
    /// Asset definition identifier; asset content lives outside the engine.
    AssetId
);
string_id!(
    /// Identifier of a modifier instance inside one character's chain.
    ModifierId
);

impl ItemId {
    pub fn generate() -> Self {
        Self(format!("i/{}", Uuid::new_v4()))
    }
}

impl ModifierId {
    pub fn generate() -> Self {
        Self(format!("m/{}", Uuid::new_v4()))
    }
}

// ============================================================================
// Items
// ============================================================================

/// Runtime state of one item module. The declared layout lives in the asset definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemModuleState {
    /// Container holding nested items
    Storage { contents: Vec<Item> },
    /// Slot holding at most one lock item
    LockSlot { contents: Vec<Item>, locked: bool },
    /// Selectable variant (e.g. tightness, style)
    Typed { variant: String },
}

impl ItemModuleState {
    pub fn contents(&self) -> Option<&Vec<Item>> {
        match self {
            ItemModuleState::Storage { contents } => Some(contents),
            ItemModuleState::LockSlot { contents, .. } => Some(contents),
            ItemModuleState::Typed { .. } => None,
        }
    }

    pub fn contents_mut(&mut self) -> Option<&mut Vec<Item>> {
        match self {
            ItemModuleState::Storage { contents } => Some(contents),
            ItemModuleState::LockSlot { contents, .. } => Some(contents),
            ItemModuleState::Typed { .. } => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, ItemModuleState::LockSlot { locked: true, .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub asset: AssetId,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub modules: BTreeMap<String, ItemModuleState>,
}

impl Item {
    pub fn new(id: ItemId, asset: AssetId) -> Self {
        Self {
            id,
            asset,
            color: None,
            modules: BTreeMap::new(),
        }
    }

    pub fn with_module(mut self, name: &str, state: ItemModuleState) -> Self {
        self.modules.insert(name.to_string(), state);
        self
    }

    /// True when any lock slot on this item currently holds a locked lock.
    pub fn is_locked(&self) -> bool {
        self.modules.values().any(ItemModuleState::is_locked)
    }

    /// Visit this item and every nested item (depth first).
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Item)) {
        visit(self);
        for module in self.modules.values() {
            if let Some(contents) = module.contents() {
                for nested in contents {
                    nested.walk(visit);
                }
            }
        }
    }
}

/// One hop into a container: the item holding the container and its module name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerStep {
    pub item: ItemId,
    pub module: String,
}

/// Address of an item inside an inventory (character worn items or the room inventory).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemPath {
    #[serde(default)]
    pub container: Vec<ContainerStep>,
    pub item: ItemId,
}

impl ItemPath {
    pub fn top(item: ItemId) -> Self {
        Self {
            container: Vec::new(),
            item,
        }
    }

    pub fn nested(container: Vec<ContainerStep>, item: ItemId) -> Self {
        Self { container, item }
    }
}

/// Resolve the item list a container path points at.
pub fn container_items<'a>(root: &'a [Item], path: &[ContainerStep]) -> Option<&'a Vec<Item>> {
    let (first, rest) = path.split_first()?;
    let holder = root.iter().find(|item| item.id == first.item)?;
    let contents = holder.modules.get(&first.module)?.contents()?;
    if rest.is_empty() {
        Some(contents)
    } else {
        container_items(contents, rest)
    }
}

/// Mutable variant of [`container_items`]; an empty path yields the root list itself.
pub fn container_items_mut<'a>(
    root: &'a mut Vec<Item>,
    path: &[ContainerStep],
) -> Option<&'a mut Vec<Item>> {
    let Some((first, rest)) = path.split_first() else {
        return Some(root);
    };
    let holder = root.iter_mut().find(|item| item.id == first.item)?;
    let contents = holder.modules.get_mut(&first.module)?.contents_mut()?;
    container_items_mut(contents, rest)
}

pub fn find_item<'a>(root: &'a [Item], path: &ItemPath) -> Option<&'a Item> {
    let list: &[Item] = if path.container.is_empty() {
        root
    } else {
        container_items(root, &path.container)?
    };
    list.iter().find(|item| item.id == path.item)
}

// ============================================================================
// Characters
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    #[default]
    Standing,
    Kneeling,
    Sitting,
    Lying,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArmPose {
    #[default]
    Free,
    Front,
    Behind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Pose {
    pub stance: Stance,
    pub arms: ArmPose,
}

/// Partial pose update; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PoseChange {
    #[serde(default)]
    pub stance: Option<Stance>,
    #[serde(default)]
    pub arms: Option<ArmPose>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoomPosition {
    pub x: u32,
    pub y: u32,
}

/// Appearance and placement of one character inside a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharacterState {
    pub id: CharacterId,
    pub space: SpaceId,
    /// Worn items, ordered back to front
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub pose: Pose,
    #[serde(default)]
    pub position: RoomPosition,
}

impl CharacterState {
    pub fn new(id: CharacterId, space: SpaceId) -> Self {
        Self {
            id,
            space,
            items: Vec::new(),
            pose: Pose::default(),
            position: RoomPosition::default(),
        }
    }

    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    pub fn wears_asset(&self, asset: &AssetId) -> bool {
        let mut found = false;
        for item in &self.items {
            item.walk(&mut |nested| {
                if &nested.asset == asset {
                    found = true;
                }
            });
        }
        found
    }
}

// ============================================================================
// Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSize {
    pub width: u32,
    pub height: u32,
}

impl Default for RoomSize {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 1000,
        }
    }
}

impl RoomSize {
    pub fn contains(&self, position: RoomPosition) -> bool {
        position.x < self.width && position.y < self.height
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpaceRole {
    Everyone,
    Admin,
    Owner,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub size: RoomSize,
    #[serde(default)]
    pub owners: BTreeSet<AccountId>,
    #[serde(default)]
    pub admins: BTreeSet<AccountId>,
}

impl SpaceConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            background: String::new(),
            size: RoomSize::default(),
            owners: BTreeSet::new(),
            admins: BTreeSet::new(),
        }
    }

    pub fn with_owner(mut self, account: AccountId) -> Self {
        self.owners.insert(account);
        self
    }

    pub fn with_admin(mut self, account: AccountId) -> Self {
        self.admins.insert(account);
        self
    }

    /// Highest role the account holds; owners are implicitly admins.
    pub fn role_of(&self, account: &AccountId) -> SpaceRole {
        if self.owners.contains(account) {
            SpaceRole::Owner
        } else if self.admins.contains(account) {
            SpaceRole::Admin
        } else {
            SpaceRole::Everyone
        }
    }
}

/// Partial space configuration update used by the configure action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SpaceConfigPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub size: Option<RoomSize>,
}

impl SpaceConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.background.is_none()
            && self.size.is_none()
    }

    pub fn apply_to(&self, config: &mut SpaceConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(description) = &self.description {
            config.description = description.clone();
        }
        if let Some(background) = &self.background {
            config.background = background.clone();
        }
        if let Some(size) = self.size {
            config.size = size;
        }
    }
}

/// Shared state of a space: configuration, room inventory and who is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceState {
    pub id: SpaceId,
    pub config: SpaceConfig,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub characters: BTreeSet<CharacterId>,
}

impl SpaceState {
    pub fn new(id: SpaceId, config: SpaceConfig) -> Self {
        Self {
            id,
            config,
            items: Vec::new(),
            characters: BTreeSet::new(),
        }
    }

    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }
}
