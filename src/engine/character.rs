use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::modifiers::{ModifierChain, ModifierInstance};
use crate::engine::permissions::{PermissionConfig, PermissionGroup, PermissionKey, PermissionRegistry};
use crate::engine::protocol::ServerMessage;
use crate::engine::types::{AccountId, CharacterId, CharacterState, CHARACTER_SCHEMA_VERSION};

/// Limits applied when building characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterLimits {
    pub max_modifiers: usize,
    pub max_permission_overrides: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSettings {
    #[serde(default = "default_label_color")]
    pub label_color: String,
    /// Hide the character's name in emotes seen by others
    #[serde(default)]
    pub hide_name: bool,
}

fn default_label_color() -> String {
    "#ffffff".to_string()
}

impl Default for CharacterSettings {
    fn default() -> Self {
        Self {
            label_color: default_label_color(),
            hide_name: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierSystemData {
    pub modifiers: Vec<ModifierInstance>,
    /// Stored `characterModifierType` permission entries
    pub type_config: BTreeMap<PermissionKey, PermissionConfig>,
}

/// Persisted form of a character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterBundle {
    pub schema_version: u8,
    pub id: CharacterId,
    pub account_id: AccountId,
    pub name: String,
    pub settings: CharacterSettings,
    pub appearance: CharacterState,
    /// Stored `interaction` permission entries
    pub interaction_config: BTreeMap<PermissionKey, PermissionConfig>,
    pub modifier_system_data: ModifierSystemData,
}

impl CharacterBundle {
    /// Fresh bundle for a newly created character placed in `appearance.space`.
    pub fn new(id: CharacterId, account_id: AccountId, name: &str, appearance: CharacterState) -> Self {
        Self {
            schema_version: CHARACTER_SCHEMA_VERSION,
            id,
            account_id,
            name: name.to_string(),
            settings: CharacterSettings::default(),
            appearance,
            interaction_config: BTreeMap::new(),
            modifier_system_data: ModifierSystemData::default(),
        }
    }
}

/// Live character owned by exactly one space worker.
#[derive(Debug)]
pub struct Character {
    pub id: CharacterId,
    pub account: AccountId,
    pub name: String,
    pub settings: CharacterSettings,
    pub permissions: PermissionRegistry,
    pub modifiers: ModifierChain,
    connection: Option<UnboundedSender<ServerMessage>>,
    disconnected_at: Option<i64>,
}

impl Character {
    pub fn new(id: CharacterId, account: AccountId, name: &str, limits: CharacterLimits) -> Self {
        Self {
            permissions: PermissionRegistry::new(id.clone(), limits.max_permission_overrides),
            modifiers: ModifierChain::new(id.clone(), account.clone(), limits.max_modifiers),
            id,
            account,
            name: name.to_string(),
            settings: CharacterSettings::default(),
            connection: None,
            disconnected_at: None,
        }
    }

    /// Split a bundle into the live character and its appearance. A loaded character
    /// starts offline at `now` until a client connects.
    pub fn from_bundle(bundle: CharacterBundle, limits: CharacterLimits, now: i64) -> (Self, CharacterState) {
        let stored = bundle
            .interaction_config
            .into_iter()
            .chain(bundle.modifier_system_data.type_config);
        let permissions = PermissionRegistry::load(bundle.id.clone(), limits.max_permission_overrides, stored);
        let modifiers = ModifierChain::load(
            bundle.id.clone(),
            bundle.account_id.clone(),
            limits.max_modifiers,
            bundle.modifier_system_data.modifiers,
        );
        let character = Self {
            id: bundle.id,
            account: bundle.account_id,
            name: bundle.name,
            settings: bundle.settings,
            permissions,
            modifiers,
            connection: None,
            disconnected_at: Some(now),
        };
        (character, bundle.appearance)
    }

    pub fn to_bundle(&self, appearance: CharacterState) -> CharacterBundle {
        CharacterBundle {
            schema_version: CHARACTER_SCHEMA_VERSION,
            id: self.id.clone(),
            account_id: self.account.clone(),
            name: self.name.clone(),
            settings: self.settings.clone(),
            appearance,
            interaction_config: self.permissions.export_group(PermissionGroup::Interaction),
            modifier_system_data: ModifierSystemData {
                modifiers: self.modifiers.export(),
                type_config: self.permissions.export_group(PermissionGroup::CharacterModifierType),
            },
        }
    }

    pub fn connect(&mut self, sender: UnboundedSender<ServerMessage>) {
        self.connection = Some(sender);
        self.disconnected_at = None;
    }

    pub fn disconnect(&mut self, now: i64) {
        self.connection = None;
        self.disconnected_at.get_or_insert(now);
    }

    pub fn is_online(&self) -> bool {
        self.connection
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    pub fn disconnected_at(&self) -> Option<i64> {
        self.disconnected_at
    }

    /// Queue a message on the live connection. A closed connection marks the character
    /// offline and returns false.
    pub fn send(&mut self, message: ServerMessage, now: i64) -> bool {
        let delivered = match &self.connection {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        };
        if !delivered && self.connection.is_some() {
            self.disconnect(now);
        }
        delivered
    }
}

/// Characters currently held by one space worker.
#[derive(Debug, Default)]
pub struct CharacterRegistry {
    characters: BTreeMap<CharacterId, Character>,
}

impl CharacterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, character: Character) -> Option<Character> {
        self.characters.insert(character.id.clone(), character)
    }

    pub fn remove(&mut self, id: &CharacterId) -> Option<Character> {
        self.characters.remove(id)
    }

    pub fn get(&self, id: &CharacterId) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn get_mut(&mut self, id: &CharacterId) -> Option<&mut Character> {
        self.characters.get_mut(id)
    }

    pub fn contains(&self, id: &CharacterId) -> bool {
        self.characters.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &CharacterId> {
        self.characters.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Character> {
        self.characters.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Character> {
        self.characters.values_mut()
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::modifiers::{ModifierType, NewModifier};
    use crate::engine::permissions::{Policy, PolicyChange};
    use tokio::sync::mpsc;

    const LIMITS: CharacterLimits = CharacterLimits {
        max_modifiers: 8,
        max_permission_overrides: 8,
    };

    #[test]
    fn bundle_round_trip_keeps_permissions_and_modifiers() {
        let mut character = Character::new("c1".into(), "acct".into(), "Alice", LIMITS);
        character
            .permissions
            .set_policy(
                &PermissionKey::change_pose(),
                PolicyChange::Default {
                    policy: Some(Policy::No),
                },
            )
            .unwrap();
        character
            .permissions
            .set_policy(
                &PermissionKey::modifier_type(ModifierType::SlowActions),
                PolicyChange::Default {
                    policy: Some(Policy::No),
                },
            )
            .unwrap();
        character
            .modifiers
            .add(NewModifier::new(ModifierType::EffectDeaf))
            .unwrap();
        let appearance = CharacterState::new("c1".into(), "s1".into());
        let bundle = character.to_bundle(appearance.clone());
        assert_eq!(bundle.interaction_config.len(), 1);
        assert_eq!(bundle.modifier_system_data.type_config.len(), 1);

        let bytes = bincode::serialize(&bundle).unwrap();
        let decoded: CharacterBundle = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, bundle);

        let (loaded, loaded_appearance) = Character::from_bundle(decoded, LIMITS, 0);
        assert_eq!(loaded_appearance, appearance);
        assert_eq!(loaded.permissions, character.permissions);
        assert_eq!(loaded.modifiers, character.modifiers);
        assert!(!loaded.is_online());
    }

    #[test]
    fn send_marks_closed_connections_offline() {
        let mut character = Character::new("c1".into(), "acct".into(), "Alice", LIMITS);
        let (tx, rx) = mpsc::unbounded_channel();
        character.connect(tx);
        assert!(character.is_online());
        drop(rx);
        assert!(!character.send(ServerMessage::PermissionsChanged { character: "c1".into() }, 42));
        assert_eq!(character.disconnected_at(), Some(42));
    }
}
