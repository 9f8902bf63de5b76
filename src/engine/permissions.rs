//! Per-character permission table gating what other characters may do to its owner.
//!
//! Every entry is addressed by a [`PermissionKey`] (group plus id). Built-in defaults come
//! from a static setup table; only deviations from those defaults are stored, so a
//! registry that was reset to defaults exports nothing.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::engine::modifiers::catalog::ModifierType;
use crate::engine::types::CharacterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Yes,
    No,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionGroup {
    Interaction,
    CharacterModifierType,
}

impl PermissionGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionGroup::Interaction => "interaction",
            PermissionGroup::CharacterModifierType => "characterModifierType",
        }
    }
}

/// `group/id` address of a permission, serialized as that string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PermissionKey {
    pub group: PermissionGroup,
    pub id: String,
}

impl PermissionKey {
    pub fn new(group: PermissionGroup, id: &str) -> Self {
        Self {
            group,
            id: id.to_string(),
        }
    }

    pub fn interaction(id: &str) -> Self {
        Self::new(PermissionGroup::Interaction, id)
    }

    pub fn interact() -> Self {
        Self::interaction(INTERACT)
    }

    pub fn modify_appearance() -> Self {
        Self::interaction(MODIFY_APPEARANCE)
    }

    pub fn use_lock_slot_module() -> Self {
        Self::interaction(USE_LOCK_SLOT_MODULE)
    }

    pub fn change_pose() -> Self {
        Self::interaction(CHANGE_POSE)
    }

    pub fn modifier_type(kind: ModifierType) -> Self {
        Self::new(PermissionGroup::CharacterModifierType, kind.as_str())
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group.as_str(), self.id)
    }
}

impl FromStr for PermissionKey {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, id) = s
            .split_once('/')
            .ok_or_else(|| PermissionError::MalformedKey(s.to_string()))?;
        let group = match group {
            "interaction" => PermissionGroup::Interaction,
            "characterModifierType" => PermissionGroup::CharacterModifierType,
            _ => return Err(PermissionError::MalformedKey(s.to_string())),
        };
        Ok(Self::new(group, id))
    }
}

impl From<PermissionKey> for String {
    fn from(key: PermissionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PermissionKey {
    type Error = PermissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

pub const INTERACT: &str = "interact";
pub const MODIFY_APPEARANCE: &str = "modifyAppearance";
pub const USE_LOCK_SLOT_MODULE: &str = "useLockSlotModule";
pub const CHANGE_POSE: &str = "changePose";

/// Built-in definition of one permission.
///
/// Interaction permissions default to `Yes` except lock slots, which ask the
/// owner first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionSetup {
    pub label: &'static str,
    pub default_policy: Policy,
    /// The default may never be opened up to `Yes` for everyone.
    pub forbid_default_allow_others: bool,
}

const INTERACTION_SETUP: &[(&str, PermissionSetup)] = &[
    (
        INTERACT,
        PermissionSetup {
            label: "Interact with this character",
            default_policy: Policy::Yes,
            forbid_default_allow_others: false,
        },
    ),
    (
        MODIFY_APPEARANCE,
        PermissionSetup {
            label: "Change items worn by this character",
            default_policy: Policy::Yes,
            forbid_default_allow_others: false,
        },
    ),
    (
        USE_LOCK_SLOT_MODULE,
        PermissionSetup {
            label: "Add, remove or operate locks on this character",
            default_policy: Policy::Prompt,
            forbid_default_allow_others: false,
        },
    ),
    (
        CHANGE_POSE,
        PermissionSetup {
            label: "Change the pose of this character",
            default_policy: Policy::Yes,
            forbid_default_allow_others: false,
        },
    ),
];

impl PermissionSetup {
    pub fn lookup(key: &PermissionKey) -> Option<PermissionSetup> {
        match key.group {
            PermissionGroup::Interaction => INTERACTION_SETUP
                .iter()
                .find(|(id, _)| *id == key.id)
                .map(|(_, setup)| *setup),
            PermissionGroup::CharacterModifierType => {
                ModifierType::parse(&key.id).map(|kind| kind.info().permission)
            }
        }
    }
}

/// Stored deviation from the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// `None` means the built-in default applies.
    #[serde(default)]
    pub allow_others: Option<Policy>,
    #[serde(default)]
    pub overrides: BTreeMap<CharacterId, Policy>,
}

impl PermissionConfig {
    pub fn is_unset(&self) -> bool {
        self.allow_others.is_none() && self.overrides.is_empty()
    }
}

/// Target of a policy write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum PolicyChange {
    /// Change (or with `None`, reset) the policy for everyone without an override.
    Default { policy: Option<Policy> },
    /// Set (or with `None`, remove) the override for one acting character.
    Actor {
        character: CharacterId,
        policy: Option<Policy>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("unknown permission {0}")]
    UnknownPermission(String),
    #[error("malformed permission key {0}")]
    MalformedKey(String),
    #[error("permission {0} may not default to allowing everyone")]
    ForbiddenDefault(String),
    #[error("permission {key} already has {limit} overrides")]
    TooManyOverrides { key: String, limit: usize },
    #[error("a character cannot override its own permission")]
    SelfOverride,
}

/// Effective view of a permission, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionView {
    pub key: PermissionKey,
    pub label: String,
    pub default_policy: Policy,
    pub forbid_default_allow_others: bool,
    pub config: PermissionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRegistry {
    owner: CharacterId,
    entries: BTreeMap<PermissionKey, PermissionConfig>,
    max_overrides: usize,
}

impl PermissionRegistry {
    pub fn new(owner: CharacterId, max_overrides: usize) -> Self {
        Self {
            owner,
            entries: BTreeMap::new(),
            max_overrides,
        }
    }

    /// Rebuild a registry from persisted entries. Unknown keys are dropped and entries
    /// that match the built-in default collapse away.
    pub fn load(
        owner: CharacterId,
        max_overrides: usize,
        stored: impl IntoIterator<Item = (PermissionKey, PermissionConfig)>,
    ) -> Self {
        let mut registry = Self::new(owner, max_overrides);
        for (key, mut config) in stored {
            let Some(setup) = PermissionSetup::lookup(&key) else {
                debug!("dropping unknown stored permission {}", key);
                continue;
            };
            if config.allow_others == Some(setup.default_policy)
                || (setup.forbid_default_allow_others && config.allow_others == Some(Policy::Yes))
            {
                config.allow_others = None;
            }
            config.overrides.remove(&registry.owner);
            if !config.is_unset() {
                registry.entries.insert(key, config);
            }
        }
        registry
    }

    pub fn owner(&self) -> &CharacterId {
        &self.owner
    }

    /// Resolve the policy for `actor`: the owner always passes, then the actor's
    /// override, then the default. Unknown permissions resolve to `No`.
    pub fn check(&self, key: &PermissionKey, actor: &CharacterId) -> Policy {
        if actor == &self.owner {
            return Policy::Yes;
        }
        let Some(setup) = PermissionSetup::lookup(key) else {
            return Policy::No;
        };
        match self.entries.get(key) {
            Some(config) => config
                .overrides
                .get(actor)
                .copied()
                .or(config.allow_others)
                .unwrap_or(setup.default_policy),
            None => setup.default_policy,
        }
    }

    pub fn get(&self, key: &PermissionKey) -> Result<PermissionView, PermissionError> {
        let setup = PermissionSetup::lookup(key)
            .ok_or_else(|| PermissionError::UnknownPermission(key.to_string()))?;
        Ok(PermissionView {
            key: key.clone(),
            label: setup.label.to_string(),
            default_policy: setup.default_policy,
            forbid_default_allow_others: setup.forbid_default_allow_others,
            config: self.entries.get(key).cloned().unwrap_or_default(),
        })
    }

    /// Apply a policy change. Returns whether the stored configuration changed.
    pub fn set_policy(
        &mut self,
        key: &PermissionKey,
        change: PolicyChange,
    ) -> Result<bool, PermissionError> {
        let setup = PermissionSetup::lookup(key)
            .ok_or_else(|| PermissionError::UnknownPermission(key.to_string()))?;
        let before = self.entries.get(key).cloned().unwrap_or_default();
        let mut config = before.clone();

        match change {
            PolicyChange::Default { policy } => {
                if setup.forbid_default_allow_others && policy == Some(Policy::Yes) {
                    return Err(PermissionError::ForbiddenDefault(key.to_string()));
                }
                config.allow_others = policy.filter(|policy| *policy != setup.default_policy);
            }
            PolicyChange::Actor { character, policy } => {
                if character == self.owner {
                    return Err(PermissionError::SelfOverride);
                }
                match policy {
                    Some(policy) => {
                        if !config.overrides.contains_key(&character)
                            && config.overrides.len() >= self.max_overrides
                        {
                            return Err(PermissionError::TooManyOverrides {
                                key: key.to_string(),
                                limit: self.max_overrides,
                            });
                        }
                        config.overrides.insert(character, policy);
                    }
                    None => {
                        config.overrides.remove(&character);
                    }
                }
            }
        }

        if config == before {
            return Ok(false);
        }
        if config.is_unset() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.clone(), config);
        }
        Ok(true)
    }

    /// Store `Yes` overrides for `actor` after the owner accepted a prompt.
    /// Either every key is granted or the registry is left untouched.
    pub fn grant(
        &mut self,
        actor: &CharacterId,
        keys: &[PermissionKey],
    ) -> Result<bool, PermissionError> {
        let before = self.entries.clone();
        let mut changed = false;
        for key in keys {
            let granted = self.set_policy(
                key,
                PolicyChange::Actor {
                    character: actor.clone(),
                    policy: Some(Policy::Yes),
                },
            );
            match granted {
                Ok(stored) => changed |= stored,
                Err(err) => {
                    self.entries = before;
                    return Err(err);
                }
            }
        }
        Ok(changed)
    }

    /// Stored (non-default) entries, in key order.
    pub fn export(&self) -> BTreeMap<PermissionKey, PermissionConfig> {
        self.entries.clone()
    }

    pub fn export_group(&self, group: PermissionGroup) -> BTreeMap<PermissionKey, PermissionConfig> {
        self.entries
            .iter()
            .filter(|(key, _)| key.group == group)
            .map(|(key, config)| (key.clone(), config.clone()))
            .collect()
    }
}
