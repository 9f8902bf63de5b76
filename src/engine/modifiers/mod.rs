//! Character modifier chain.
//!
//! A character carries an ordered list of modifier instances. Enabled modifiers whose
//! condition chain holds are *active*: they contribute effects, veto or slow the
//! owner's actions, and filter chat. Order matters for text transforms and for which
//! block is reported first; owners reorder the list freely unless an instance is locked.

pub mod catalog;
pub mod conditions;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::action::Action;
use crate::engine::chat::ChatKind;
use crate::engine::effects::{EffectAccumulator, EffectBundle};
use crate::engine::snapshot::GlobalState;
use crate::engine::types::{AccountId, CharacterId, ModifierId};

pub use catalog::{ActionResponse, ChainRole, ModifierConfig, ModifierType};
pub use conditions::{ConditionLink, ConditionLogic, ModifierCondition, MAX_CONDITIONS};

use conditions::{evaluate_chain, ConditionContext};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModifierError {
    #[error("modifier {0} not found")]
    NotFound(ModifierId),
    #[error("at most {limit} modifiers allowed")]
    TooManyModifiers { limit: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("modifier is locked by {by}")]
    Locked { by: CharacterId },
    #[error("modifier is already locked")]
    AlreadyLocked,
    #[error("modifier is not locked")]
    NotLocked,
    #[error("cannot shift modifier by {0}")]
    InvalidShift(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierLock {
    pub locked_by: CharacterId,
    pub locked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierInstance {
    pub id: ModifierId,
    #[serde(rename = "type")]
    pub kind: ModifierType,
    pub name: String,
    pub enabled: bool,
    pub config: ModifierConfig,
    #[serde(default)]
    pub conditions: Vec<ConditionLink>,
    #[serde(default)]
    pub lock: Option<ModifierLock>,
}

/// Client template for a new modifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewModifier {
    #[serde(rename = "type")]
    pub kind: ModifierType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Option<ModifierConfig>,
    #[serde(default)]
    pub conditions: Vec<ConditionLink>,
}

fn enabled_by_default() -> bool {
    true
}

impl NewModifier {
    pub fn new(kind: ModifierType) -> Self {
        Self {
            kind,
            name: None,
            enabled: true,
            config: None,
            conditions: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ModifierConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<ConditionLink>) -> Self {
        self.conditions = conditions;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub config: Option<ModifierConfig>,
    #[serde(default)]
    pub conditions: Option<Vec<ConditionLink>>,
}

/// Verdict of a chain over one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Allow,
    Block { modifier: String, reason: String },
    Slow { delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatBlock {
    pub modifier: String,
    pub reason: String,
}

fn validate_conditions(conditions: &[ConditionLink]) -> Result<(), ModifierError> {
    if conditions.len() > MAX_CONDITIONS {
        return Err(ModifierError::InvalidConfiguration(format!(
            "at most {} conditions allowed",
            MAX_CONDITIONS
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierChain {
    owner: CharacterId,
    account: AccountId,
    modifiers: Vec<ModifierInstance>,
    max_modifiers: usize,
}

impl ModifierChain {
    pub fn new(owner: CharacterId, account: AccountId, max_modifiers: usize) -> Self {
        Self {
            owner,
            account,
            modifiers: Vec::new(),
            max_modifiers,
        }
    }

    /// Rebuild a chain from persisted instances, dropping any that no longer validate.
    pub fn load(
        owner: CharacterId,
        account: AccountId,
        max_modifiers: usize,
        instances: Vec<ModifierInstance>,
    ) -> Self {
        let mut chain = Self::new(owner, account, max_modifiers);
        for instance in instances {
            let valid = instance.kind.validate_config(&instance.config).is_ok()
                && validate_conditions(&instance.conditions).is_ok()
                && !chain.modifiers.iter().any(|m| m.id == instance.id);
            if valid && chain.modifiers.len() < max_modifiers {
                chain.modifiers.push(instance);
            } else {
                debug!("dropping stored modifier {} of {}", instance.id, chain.owner);
            }
        }
        chain
    }

    pub fn owner(&self) -> &CharacterId {
        &self.owner
    }

    pub fn modifiers(&self) -> &[ModifierInstance] {
        &self.modifiers
    }

    pub fn get(&self, id: &ModifierId) -> Option<&ModifierInstance> {
        self.modifiers.iter().find(|m| &m.id == id)
    }

    pub fn export(&self) -> Vec<ModifierInstance> {
        self.modifiers.clone()
    }

    fn position(&self, id: &ModifierId) -> Result<usize, ModifierError> {
        self.modifiers
            .iter()
            .position(|m| &m.id == id)
            .ok_or_else(|| ModifierError::NotFound(id.clone()))
    }

    /// Index of a modifier `actor` may change: unlocked, or locked by the actor.
    fn editable(&self, actor: &CharacterId, id: &ModifierId) -> Result<usize, ModifierError> {
        let index = self.position(id)?;
        match &self.modifiers[index].lock {
            Some(lock) if &lock.locked_by != actor => Err(ModifierError::Locked {
                by: lock.locked_by.clone(),
            }),
            _ => Ok(index),
        }
    }

    pub fn add(&mut self, template: NewModifier) -> Result<ModifierId, ModifierError> {
        if self.modifiers.len() >= self.max_modifiers {
            return Err(ModifierError::TooManyModifiers {
                limit: self.max_modifiers,
            });
        }
        let config = template
            .config
            .unwrap_or_else(|| template.kind.default_config());
        template.kind.validate_config(&config)?;
        validate_conditions(&template.conditions)?;
        let id = ModifierId::generate();
        self.modifiers.push(ModifierInstance {
            id: id.clone(),
            kind: template.kind,
            name: template
                .name
                .unwrap_or_else(|| template.kind.info().name.to_string()),
            enabled: template.enabled,
            config,
            conditions: template.conditions,
            lock: None,
        });
        Ok(id)
    }

    /// Move a modifier by `shift` positions. Returns false for a zero shift.
    pub fn reorder(&mut self, actor: &CharacterId, id: &ModifierId, shift: i32) -> Result<bool, ModifierError> {
        let index = self.editable(actor, id)?;
        if shift == 0 {
            return Ok(false);
        }
        let destination = index as i64 + shift as i64;
        if destination < 0 || destination >= self.modifiers.len() as i64 {
            return Err(ModifierError::InvalidShift(shift));
        }
        let instance = self.modifiers.remove(index);
        self.modifiers.insert(destination as usize, instance);
        Ok(true)
    }

    pub fn delete(&mut self, actor: &CharacterId, id: &ModifierId) -> Result<ModifierInstance, ModifierError> {
        let index = self.editable(actor, id)?;
        Ok(self.modifiers.remove(index))
    }

    pub fn configure(
        &mut self,
        actor: &CharacterId,
        id: &ModifierId,
        patch: ModifierPatch,
    ) -> Result<bool, ModifierError> {
        let index = self.editable(actor, id)?;
        let current = &self.modifiers[index];
        if let Some(config) = &patch.config {
            current.kind.validate_config(config)?;
        }
        if let Some(conditions) = &patch.conditions {
            validate_conditions(conditions)?;
        }
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(ModifierError::InvalidConfiguration(
                    "name must not be empty".to_string(),
                ));
            }
        }

        let mut next = current.clone();
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(config) = patch.config {
            next.config = config;
        }
        if let Some(conditions) = patch.conditions {
            next.conditions = conditions;
        }
        let changed = next != self.modifiers[index];
        self.modifiers[index] = next;
        Ok(changed)
    }

    pub fn lock(&mut self, actor: &CharacterId, id: &ModifierId, now: i64) -> Result<(), ModifierError> {
        let index = self.position(id)?;
        let instance = &mut self.modifiers[index];
        if instance.lock.is_some() {
            return Err(ModifierError::AlreadyLocked);
        }
        instance.lock = Some(ModifierLock {
            locked_by: actor.clone(),
            locked_at: now,
        });
        Ok(())
    }

    pub fn unlock(&mut self, actor: &CharacterId, id: &ModifierId) -> Result<(), ModifierError> {
        let index = self.position(id)?;
        let instance = &mut self.modifiers[index];
        match &instance.lock {
            None => Err(ModifierError::NotLocked),
            Some(lock) if &lock.locked_by != actor => Err(ModifierError::Locked {
                by: lock.locked_by.clone(),
            }),
            Some(_) => {
                instance.lock = None;
                Ok(())
            }
        }
    }

    fn active<'a>(&'a self, snapshot: &'a GlobalState) -> impl Iterator<Item = &'a ModifierInstance> + 'a {
        let ctx = ConditionContext {
            snapshot,
            owner: &self.owner,
            account: &self.account,
        };
        self.modifiers
            .iter()
            .filter(move |m| m.enabled && evaluate_chain(&m.conditions, &ctx))
    }

    /// Effects on the owner from active modifiers plus worn items.
    pub fn active_effects(&self, snapshot: &GlobalState) -> EffectBundle {
        let mut acc = EffectAccumulator::new();
        for modifier in self.active(snapshot) {
            catalog::contribute_effects(modifier.kind, &modifier.config, &mut acc);
        }
        if let Some(state) = snapshot.character(&self.owner) {
            for item in &state.items {
                if let Some(definition) = snapshot.assets().get(&item.asset) {
                    acc.add_contribution(&definition.effects);
                }
            }
        }
        acc.finish()
    }

    /// First block wins; otherwise the longest requested delay.
    pub fn check_character_action(&self, snapshot: &GlobalState, action: &Action, role: ChainRole) -> ChainVerdict {
        let mut delay = 0;
        for modifier in self.active(snapshot) {
            match catalog::check_action(modifier.kind, &modifier.config, &self.owner, action, role) {
                ActionResponse::Allow => {}
                ActionResponse::Block { reason } => {
                    return ChainVerdict::Block {
                        modifier: modifier.name.clone(),
                        reason,
                    }
                }
                ActionResponse::Slow { delay_ms } => delay = delay.max(delay_ms),
            }
        }
        if delay > 0 {
            ChainVerdict::Slow { delay_ms: delay }
        } else {
            ChainVerdict::Allow
        }
    }

    pub fn check_chat_message(&self, snapshot: &GlobalState, kind: ChatKind, text: &str) -> Result<(), ChatBlock> {
        for modifier in self.active(snapshot) {
            if let Some(reason) = catalog::check_chat(modifier.kind, &modifier.config, kind, text) {
                return Err(ChatBlock {
                    modifier: modifier.name.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    pub fn process_chat_message_before_muffle(&self, snapshot: &GlobalState, kind: ChatKind, text: &str) -> String {
        self.active(snapshot).fold(text.to_string(), |text, modifier| {
            catalog::transform_outgoing(modifier.kind, &modifier.config, kind, &text)
        })
    }

    pub fn process_received_chat_message_before_filters(
        &self,
        snapshot: &GlobalState,
        kind: ChatKind,
        text: &str,
    ) -> String {
        self.active(snapshot).fold(text.to_string(), |text, modifier| {
            catalog::transform_incoming(modifier.kind, &modifier.config, kind, &text)
        })
    }
}
