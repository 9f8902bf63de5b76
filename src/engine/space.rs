//! Per-space synchronizer.
//!
//! Owns the committed [`GlobalState`] of one space together with the characters present
//! in it. Every accepted change goes through [`SpaceSynchronizer::commit`], which bumps
//! the revision, broadcasts the delta plus changed effects, and records what needs
//! saving. Clients that fall behind ask for a resync and get the full snapshot.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::action::ActionProblem;
use crate::engine::assets::AssetCatalog;
use crate::engine::character::{Character, CharacterBundle, CharacterLimits, CharacterRegistry};
use crate::engine::chat::{muffle_hearing, muffle_speech, ChatEvent, ChatHistory, ChatKind, OutgoingChat, BLIND_HIDES_NAMES_AT};
use crate::engine::effects::EffectBundle;
use crate::engine::errors::EngineError;
use crate::engine::modifiers::{ModifierError, ModifierPatch, NewModifier};
use crate::engine::permissions::{PermissionKey, Policy, PolicyChange};
use crate::engine::pipeline::{ActionPipeline, ActionRequest, Outcome};
use crate::engine::protocol::{
    ChatResponse, ClientRequest, GameLogicResponse, ModifierResponse, PermissionResponse, ResyncResponse,
    ServerMessage, ServerResponse,
};
use crate::engine::save_queue::SaveKey;
use crate::engine::snapshot::{DeltaBundle, GlobalState};
use crate::engine::types::{CharacterId, CharacterState, Item, ModifierId, SpaceConfig, SpaceId, SpaceState, SPACE_SCHEMA_VERSION};
use crate::logutil::escape_log;
use crate::metrics;

/// Persisted form of a space. Presence is not stored; characters rejoin on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceBundle {
    pub schema_version: u8,
    pub id: SpaceId,
    pub config: SpaceConfig,
    pub inventory: Vec<Item>,
}

impl SpaceBundle {
    pub fn new(id: SpaceId, config: SpaceConfig) -> Self {
        Self {
            schema_version: SPACE_SCHEMA_VERSION,
            id,
            config,
            inventory: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceSettings {
    pub limits: CharacterLimits,
    pub max_chat_length: usize,
    pub chat_history_messages: usize,
    pub chat_history_max_age_ms: i64,
    /// Chat events replayed to a character when it connects
    pub chat_replay: usize,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            limits: CharacterLimits {
                max_modifiers: 32,
                max_permission_overrides: 64,
            },
            max_chat_length: 1000,
            chat_history_messages: 200,
            chat_history_max_age_ms: 60 * 60 * 1000,
            chat_replay: 50,
        }
    }
}

/// A join that could not be applied; hands the character back to the caller.
#[derive(Debug)]
pub struct JoinRejected {
    pub error: EngineError,
    pub character: Box<Character>,
    pub appearance: CharacterState,
}

/// Modifier edit requested by a client.
#[derive(Debug, Clone)]
pub enum ModifierOp {
    Add(NewModifier),
    Reorder { id: ModifierId, shift: i32 },
    Delete { id: ModifierId },
    Configure { id: ModifierId, patch: ModifierPatch },
    Lock { id: ModifierId, locked: bool },
    Get,
}

fn chat_seed(event: u64, receiver: &CharacterId) -> u64 {
    receiver
        .as_str()
        .bytes()
        .fold(event, |acc, b| acc.rotate_left(5) ^ b as u64)
}

pub struct SpaceSynchronizer {
    state: GlobalState,
    characters: CharacterRegistry,
    pipeline: ActionPipeline,
    revision: u64,
    /// Last non-neutral effects broadcast per character
    sent_effects: BTreeMap<CharacterId, EffectBundle>,
    history: ChatHistory,
    next_chat_id: u64,
    dirty: BTreeSet<SaveKey>,
    settings: SpaceSettings,
}

impl SpaceSynchronizer {
    pub fn new(assets: Arc<AssetCatalog>, space: SpaceState, settings: SpaceSettings) -> Self {
        Self {
            state: GlobalState::new(assets, space),
            characters: CharacterRegistry::new(),
            pipeline: ActionPipeline::new(),
            revision: 0,
            sent_effects: BTreeMap::new(),
            history: ChatHistory::new(settings.chat_history_messages, settings.chat_history_max_age_ms),
            next_chat_id: 1,
            dirty: BTreeSet::new(),
            settings,
        }
    }

    /// Rebuild an empty space from its stored bundle.
    pub fn from_bundle(
        assets: Arc<AssetCatalog>,
        bundle: SpaceBundle,
        settings: SpaceSettings,
    ) -> Result<Self, EngineError> {
        let mut space = SpaceState::new(bundle.id, bundle.config);
        space.items = bundle.inventory;
        let sync = Self::new(assets, space, settings);
        sync.state.validate()?;
        Ok(sync)
    }

    pub fn to_bundle(&self) -> SpaceBundle {
        let space = self.state.space();
        SpaceBundle {
            schema_version: SPACE_SCHEMA_VERSION,
            id: space.id.clone(),
            config: space.config.clone(),
            inventory: space.items.clone(),
        }
    }

    pub fn id(&self) -> &SpaceId {
        self.state.space_id()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn characters(&self) -> &CharacterRegistry {
        &self.characters
    }

    pub fn character(&self, id: &CharacterId) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn pipeline(&self) -> &ActionPipeline {
        &self.pipeline
    }

    pub fn chat_history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn character_bundle(&self, id: &CharacterId) -> Option<CharacterBundle> {
        let character = self.characters.get(id)?;
        let appearance = self.state.character(id)?.clone();
        Some(character.to_bundle(appearance))
    }

    /// Keys changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<SaveKey> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    pub fn join(&mut self, character: Character, appearance: CharacterState, now: i64) -> Result<(), JoinRejected> {
        if self.characters.contains(&character.id) || self.state.character(&character.id).is_some() {
            let error = EngineError::Conflict(format!("character {} is already in space {}", character.id, self.id()));
            return Err(JoinRejected {
                error,
                character: Box::new(character),
                appearance,
            });
        }
        let next = self.state.join(appearance.clone());
        if let Err(err) = next.validate() {
            return Err(JoinRejected {
                error: err.into(),
                character: Box::new(character),
                appearance,
            });
        }

        let id = character.id.clone();
        let name = character.name.clone();
        self.characters.insert(character);
        let presence = self.presence_event(&id, &name, true, now);
        self.commit(next, vec![presence], now);
        // The stored appearance now points at this space.
        self.dirty.insert(SaveKey::Character(id.clone()));
        let load = self.load_message();
        if let Some(joined) = self.characters.get_mut(&id) {
            if joined.is_online() {
                joined.send(load, now);
            }
        }
        metrics::record_space_join(self.id().as_str());
        info!("{} joined space {}", id, self.id());
        Ok(())
    }

    /// Remove a character, dropping its pending attempt. The live value keeps its
    /// connection so it can join another space unchanged.
    pub fn take_character(&mut self, id: &CharacterId, now: i64) -> Option<(Character, CharacterState)> {
        let appearance = self.state.character(id)?.clone();
        let character = self.characters.remove(id)?;
        self.pipeline.cancel(id);
        self.dirty.remove(&SaveKey::Character(id.clone()));
        let next = self.state.leave(id);
        let presence = self.presence_event(id, &character.name, false, now);
        self.commit(next, vec![presence], now);
        metrics::record_space_leave(self.id().as_str());
        info!("{} left space {}", id, self.id());
        Some((character, appearance))
    }

    /// Remove a character and return its bundle for saving.
    pub fn leave(&mut self, id: &CharacterId, now: i64) -> Option<CharacterBundle> {
        self.take_character(id, now)
            .map(|(character, appearance)| character.to_bundle(appearance))
    }

    pub fn connect(&mut self, id: &CharacterId, sender: UnboundedSender<ServerMessage>, now: i64) -> bool {
        let Some(receiver) = self.characters.get(id) else {
            return false;
        };
        let load = self.load_message();
        // Replayed lines go through the same hearing and sight filters as live delivery.
        let replay: Vec<ChatEvent> = self
            .history
            .replay_for(id, self.settings.chat_replay)
            .iter()
            .map(|logged| self.render_for(receiver, &logged.event, logged.hide_name))
            .collect();
        let Some(character) = self.characters.get_mut(id) else {
            return false;
        };
        character.connect(sender);
        character.send(load, now);
        if !replay.is_empty() {
            character.send(ServerMessage::Chat { messages: replay }, now);
        }
        debug!("{} connected", id);
        true
    }

    /// Forward a directory notice to one character.
    pub fn notify(&mut self, id: &CharacterId, text: &str, now: i64) {
        self.send_to(id, ServerMessage::Notice { text: text.to_string() }, now);
    }

    pub fn disconnect(&mut self, id: &CharacterId, now: i64) {
        if let Some(character) = self.characters.get_mut(id) {
            character.disconnect(now);
            debug!("{} disconnected", id);
        }
    }

    /// Unload characters offline for at least `timeout_ms`. Returns their bundles.
    pub fn prune_offline(&mut self, now: i64, timeout_ms: i64) -> Vec<CharacterBundle> {
        let mut expired = Vec::new();
        for character in self.characters.iter_mut() {
            if character.is_online() {
                continue;
            }
            // Start the clock for connections that dropped without a disconnect.
            character.disconnect(now);
            if character
                .disconnected_at()
                .map(|since| now - since >= timeout_ms)
                .unwrap_or(false)
            {
                expired.push(character.id.clone());
            }
        }
        expired
            .iter()
            .filter_map(|id| {
                debug!("pruning offline character {}", id);
                self.leave(id, now)
            })
            .collect()
    }

    pub fn gc_chat(&mut self, now: i64) -> usize {
        self.history.gc(now)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn handle_request(&mut self, actor: &CharacterId, request: ClientRequest, now: i64) -> ServerResponse {
        if !self.characters.contains(actor) {
            return ServerResponse::UnknownCharacter;
        }
        match request {
            ClientRequest::GameLogicAction { request } => ServerResponse::GameLogic(self.apply_action(actor, request, now)),
            ClientRequest::RequestPermission { target, permissions } => {
                ServerResponse::GameLogic(self.request_permission(actor, &target, permissions, now))
            }
            ClientRequest::PermissionCheck { target, key } => ServerResponse::Permission(
                match self.characters.get(&target) {
                    Some(owner) => PermissionResponse::Policy {
                        policy: owner.permissions.check(&key, actor),
                    },
                    None => PermissionResponse::CharacterNotFound,
                },
            ),
            ClientRequest::PermissionGet { key } => ServerResponse::Permission(self.permission_get(actor, &key)),
            ClientRequest::PermissionSet { key, change } => {
                ServerResponse::Permission(self.permission_set(actor, &key, change, now))
            }
            ClientRequest::PermissionPromptAnswer {
                requester,
                permissions,
                accept,
            } => ServerResponse::Permission(self.answer_prompt(actor, &requester, &permissions, accept, now)),
            ClientRequest::CharacterModifierAdd { target, modifier } => {
                ServerResponse::Modifier(self.modify(actor, &target, ModifierOp::Add(modifier), now))
            }
            ClientRequest::CharacterModifierReorder { target, modifier, shift } => ServerResponse::Modifier(
                self.modify(actor, &target, ModifierOp::Reorder { id: modifier, shift }, now),
            ),
            ClientRequest::CharacterModifierDelete { target, modifier } => {
                ServerResponse::Modifier(self.modify(actor, &target, ModifierOp::Delete { id: modifier }, now))
            }
            ClientRequest::CharacterModifierConfigure { target, modifier, patch } => ServerResponse::Modifier(
                self.modify(actor, &target, ModifierOp::Configure { id: modifier, patch }, now),
            ),
            ClientRequest::CharacterModifierLock { target, modifier, locked } => ServerResponse::Modifier(
                self.modify(actor, &target, ModifierOp::Lock { id: modifier, locked }, now),
            ),
            ClientRequest::CharacterModifierGet { target } => {
                ServerResponse::Modifier(self.modify(actor, &target, ModifierOp::Get, now))
            }
            ClientRequest::Chat { messages } => ServerResponse::Chat(self.chat(actor, messages, now)),
            ClientRequest::Resync { revision } => ServerResponse::Resync(self.resync(actor, revision, now)),
        }
    }

    pub fn apply_action(&mut self, actor: &CharacterId, request: ActionRequest, now: i64) -> GameLogicResponse {
        let outcome = self
            .pipeline
            .process(actor, request, &self.characters, &self.state, now);
        match outcome {
            Outcome::Applied {
                snapshot,
                chat,
                interrupted,
            } => {
                let events = chat
                    .into_iter()
                    .map(|action| {
                        let id = self.next_event_id();
                        ChatEvent::Action { id, time: now, action }
                    })
                    .collect();
                self.commit(snapshot, events, now);
                if let Some(target) = interrupted {
                    self.send_to(&target, ServerMessage::AttemptInterrupted { by: actor.clone() }, now);
                }
                metrics::inc_actions_applied();
                GameLogicResponse::Success {
                    revision: self.revision,
                }
            }
            Outcome::AttemptStarted { attempt } => {
                metrics::inc_attempts_started();
                debug!("{} started an attempt, earliest completion {}", actor, attempt.earliest_completion);
                GameLogicResponse::AttemptStarted { attempt }
            }
            Outcome::Aborted => GameLogicResponse::Aborted,
            Outcome::Blocked { problems } => {
                metrics::inc_actions_blocked();
                debug!("action by {} blocked: {:?}", actor, problems);
                GameLogicResponse::Failure { problems }
            }
            Outcome::PromptRequired { target, permissions } => self.send_prompt(actor, &target, permissions, now),
        }
    }

    fn send_prompt(
        &mut self,
        requester: &CharacterId,
        target: &CharacterId,
        permissions: Vec<PermissionKey>,
        now: i64,
    ) -> GameLogicResponse {
        let requester_name = self
            .characters
            .get(requester)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| requester.to_string());
        let Some(owner) = self.characters.get_mut(target) else {
            return GameLogicResponse::Failure {
                problems: vec![ActionProblem::CharacterNotFound {
                    character: target.clone(),
                }],
            };
        };
        if !owner.is_online() {
            return GameLogicResponse::PromptFailedCharacterOffline;
        }
        let prompt = ServerMessage::PermissionPrompt {
            requester: requester.clone(),
            requester_name,
            permissions,
        };
        if owner.send(prompt, now) {
            metrics::inc_prompts_sent();
            debug!(target: "security", "prompt from {} sent to {}", requester, target);
            GameLogicResponse::PromptSent
        } else {
            GameLogicResponse::PromptFailedCharacterOffline
        }
    }

    /// Ask `target` for permissions ahead of an action. Only keys currently on
    /// `Prompt` are asked for.
    pub fn request_permission(
        &mut self,
        requester: &CharacterId,
        target: &CharacterId,
        permissions: Vec<PermissionKey>,
        now: i64,
    ) -> GameLogicResponse {
        let Some(owner) = self.characters.get(target) else {
            return GameLogicResponse::Failure {
                problems: vec![ActionProblem::CharacterNotFound {
                    character: target.clone(),
                }],
            };
        };
        let mut denied = Vec::new();
        let mut ask = Vec::new();
        for key in permissions {
            match owner.permissions.check(&key, requester) {
                Policy::Yes => {}
                Policy::No => denied.push(ActionProblem::PermissionDenied {
                    character: target.clone(),
                    permission: key,
                }),
                Policy::Prompt => ask.push(key),
            }
        }
        if !denied.is_empty() {
            return GameLogicResponse::Failure { problems: denied };
        }
        if ask.is_empty() {
            return GameLogicResponse::Failure {
                problems: vec![ActionProblem::NothingToChange],
            };
        }
        self.send_prompt(requester, target, ask, now)
    }

    pub fn answer_prompt(
        &mut self,
        answerer: &CharacterId,
        requester: &CharacterId,
        permissions: &[PermissionKey],
        accept: bool,
        now: i64,
    ) -> PermissionResponse {
        if !accept {
            debug!(target: "security", "{} declined prompt from {}", answerer, requester);
            self.send_to(
                requester,
                ServerMessage::PermissionPromptDeclined {
                    target: answerer.clone(),
                    permissions: permissions.to_vec(),
                },
                now,
            );
            return PermissionResponse::Updated { changed: false };
        }
        let Some(owner) = self.characters.get_mut(answerer) else {
            return PermissionResponse::CharacterNotFound;
        };
        match owner.permissions.grant(requester, permissions) {
            Ok(changed) => {
                info!(target: "security", "{} granted {:?} to {}", answerer, permissions, requester);
                if changed {
                    self.permissions_changed(answerer, now);
                }
                PermissionResponse::Updated { changed }
            }
            Err(err) => PermissionResponse::Failure {
                reason: err.to_string(),
            },
        }
    }

    fn permission_get(&self, actor: &CharacterId, key: &PermissionKey) -> PermissionResponse {
        let Some(owner) = self.characters.get(actor) else {
            return PermissionResponse::CharacterNotFound;
        };
        match owner.permissions.get(key) {
            Ok(view) => PermissionResponse::View { view },
            Err(err) => PermissionResponse::Failure {
                reason: err.to_string(),
            },
        }
    }

    pub fn permission_set(
        &mut self,
        actor: &CharacterId,
        key: &PermissionKey,
        change: PolicyChange,
        now: i64,
    ) -> PermissionResponse {
        let Some(owner) = self.characters.get_mut(actor) else {
            return PermissionResponse::CharacterNotFound;
        };
        match owner.permissions.set_policy(key, change) {
            Ok(changed) => {
                if changed {
                    self.permissions_changed(actor, now);
                }
                PermissionResponse::Updated { changed }
            }
            Err(err) => {
                debug!(target: "security", "{} failed to set {}: {}", actor, key, err);
                PermissionResponse::Failure {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn permissions_changed(&mut self, owner: &CharacterId, now: i64) {
        self.dirty.insert(SaveKey::Character(owner.clone()));
        let notice = ServerMessage::PermissionsChanged {
            character: owner.clone(),
        };
        for character in self.characters.iter_mut() {
            if character.is_online() {
                character.send(notice.clone(), now);
            }
        }
    }

    /// Editing another character's modifiers needs that character's permission for
    /// the modifier type; reading them needs `interact`.
    fn modifier_access(&self, actor: &CharacterId, target: &CharacterId, key: PermissionKey) -> Result<(), ModifierResponse> {
        if actor == target {
            return Ok(());
        }
        let Some(owner) = self.characters.get(target) else {
            return Err(ModifierResponse::CharacterNotFound);
        };
        let policy = owner.permissions.check(&key, actor);
        if policy == Policy::Yes {
            return Ok(());
        }
        debug!(target: "security", "{} denied {} on {}", actor, key, target);
        Err(ModifierResponse::Failure {
            problems: vec![ActionProblem::PermissionDenied {
                character: target.clone(),
                permission: key,
            }],
            can_prompt: policy == Policy::Prompt,
        })
    }

    pub fn modify(&mut self, actor: &CharacterId, target: &CharacterId, op: ModifierOp, now: i64) -> ModifierResponse {
        let Some(owner) = self.characters.get(target) else {
            return ModifierResponse::CharacterNotFound;
        };
        let key = match &op {
            ModifierOp::Get => PermissionKey::interact(),
            ModifierOp::Add(template) => PermissionKey::modifier_type(template.kind),
            ModifierOp::Reorder { id, .. }
            | ModifierOp::Delete { id }
            | ModifierOp::Configure { id, .. }
            | ModifierOp::Lock { id, .. } => match owner.modifiers.get(id) {
                Some(instance) => PermissionKey::modifier_type(instance.kind),
                None => {
                    return ModifierResponse::Rejected {
                        reason: ModifierError::NotFound(id.clone()).to_string(),
                    }
                }
            },
        };
        if let Err(response) = self.modifier_access(actor, target, key) {
            return response;
        }

        let Some(owner) = self.characters.get_mut(target) else {
            return ModifierResponse::CharacterNotFound;
        };
        let chain = &mut owner.modifiers;
        let result = match op {
            ModifierOp::Get => {
                return ModifierResponse::Modifiers {
                    modifiers: chain.export(),
                }
            }
            ModifierOp::Add(template) => chain.add(template).map(|id| ModifierResponse::Created { id }),
            ModifierOp::Reorder { id, shift } => chain.reorder(actor, &id, shift).map(|_| ModifierResponse::Ok),
            ModifierOp::Delete { id } => chain.delete(actor, &id).map(|_| ModifierResponse::Ok),
            ModifierOp::Configure { id, patch } => chain.configure(actor, &id, patch).map(|_| ModifierResponse::Ok),
            ModifierOp::Lock { id, locked: true } => chain.lock(actor, &id, now).map(|_| ModifierResponse::Ok),
            ModifierOp::Lock { id, locked: false } => chain.unlock(actor, &id).map(|_| ModifierResponse::Ok),
        };
        match result {
            Ok(response) => {
                self.dirty.insert(SaveKey::Character(target.clone()));
                // Modifier changes can change effects without touching the snapshot.
                self.broadcast_update(DeltaBundle::default(), now);
                response
            }
            Err(ModifierError::TooManyModifiers { limit }) => ModifierResponse::TooManyModifiers { limit },
            Err(ModifierError::InvalidConfiguration(reason)) => ModifierResponse::InvalidConfiguration { reason },
            Err(err) => ModifierResponse::Rejected {
                reason: err.to_string(),
            },
        }
    }

    pub fn resync(&mut self, actor: &CharacterId, revision: u64, now: i64) -> ResyncResponse {
        if revision == self.revision {
            return ResyncResponse::UpToDate {
                revision: self.revision,
            };
        }
        debug!("{} is stale at {} (current {}), resending", actor, revision, self.revision);
        let load = self.load_message();
        self.send_to(actor, load, now);
        ResyncResponse::Reloaded {
            revision: self.revision,
        }
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    pub fn chat(&mut self, actor: &CharacterId, messages: Vec<OutgoingChat>, now: i64) -> ChatResponse {
        let Some(sender) = self.characters.get(actor) else {
            return ChatResponse::Empty;
        };
        let messages: Vec<OutgoingChat> = messages
            .into_iter()
            .filter(|message| !message.text.trim().is_empty())
            .collect();
        if messages.is_empty() {
            return ChatResponse::Empty;
        }
        for message in &messages {
            if message.text.chars().count() > self.settings.max_chat_length {
                return ChatResponse::TooLong {
                    max: self.settings.max_chat_length,
                };
            }
            if let Err(block) = sender
                .modifiers
                .check_chat_message(&self.state, message.kind, &message.text)
            {
                debug!("chat from {} blocked by {}", actor, block.modifier);
                return ChatResponse::Blocked {
                    modifier: block.modifier,
                    reason: block.reason,
                };
            }
            if let Some(to) = &message.to {
                if !self.characters.contains(to) {
                    return ChatResponse::Blocked {
                        modifier: String::new(),
                        reason: format!("{} is not here", to),
                    };
                }
            }
        }

        let muffle = sender.modifiers.active_effects(&self.state).speech_muffle;
        let from_name = sender.name.clone();
        let hide_name = sender.settings.hide_name;
        let mut events = Vec::with_capacity(messages.len());
        for message in messages {
            let id = self.next_event_id();
            let Some(sender) = self.characters.get(actor) else {
                break;
            };
            let mut text = message.text;
            if message.kind.is_speech() {
                text = sender
                    .modifiers
                    .process_chat_message_before_muffle(&self.state, message.kind, &text);
                text = muffle_speech(&text, muffle, id);
            }
            debug!("{} {:?}: {}", actor, message.kind, escape_log(&text));
            events.push(ChatEvent::Message {
                id,
                time: now,
                from: actor.clone(),
                from_name: from_name.clone(),
                kind: message.kind,
                text,
                to: message.to,
            });
        }

        let count = events.len();
        for event in events {
            metrics::inc_chat_messages();
            self.history.push_from(event.clone(), hide_name);
            let outbox = self.render_for_receivers(&event, hide_name);
            for (receiver, rendered) in outbox {
                self.send_to(&receiver, ServerMessage::Chat { messages: vec![rendered] }, now);
            }
        }
        ChatResponse::Sent { count }
    }

    /// Per-receiver copies of an event for everyone online who may see it.
    fn render_for_receivers(&self, event: &ChatEvent, hide_name: bool) -> Vec<(CharacterId, ChatEvent)> {
        self.characters
            .iter()
            .filter(|receiver| receiver.is_online() && event.is_visible_to(&receiver.id))
            .map(|receiver| (receiver.id.clone(), self.render_for(receiver, event, hide_name)))
            .collect()
    }

    /// Copy of an event as `receiver` perceives it after hearing transforms, deafness and blindness.
    fn render_for(&self, receiver: &Character, event: &ChatEvent, hide_name: bool) -> ChatEvent {
        let ChatEvent::Message { id, from, kind, text, .. } = event else {
            return event.clone();
        };
        if from == &receiver.id {
            return event.clone();
        }
        let effects = receiver.modifiers.active_effects(&self.state);
        let mut rendered = event.clone();
        if kind.is_speech() {
            let heard = receiver
                .modifiers
                .process_received_chat_message_before_filters(&self.state, *kind, text);
            let heard = muffle_hearing(&heard, effects.deaf, chat_seed(*id, &receiver.id));
            if let ChatEvent::Message { text, .. } = &mut rendered {
                *text = heard;
            }
        }
        let blind = if hide_name && *kind == ChatKind::Emote {
            effects.blind.max(BLIND_HIDES_NAMES_AT)
        } else {
            effects.blind
        };
        rendered.as_seen_with_blindness(blind)
    }

    // ------------------------------------------------------------------
    // Commit and broadcast
    // ------------------------------------------------------------------

    fn next_event_id(&mut self) -> u64 {
        let id = self.next_chat_id;
        self.next_chat_id += 1;
        id
    }

    fn presence_event(&mut self, character: &CharacterId, name: &str, joined: bool, now: i64) -> ChatEvent {
        ChatEvent::Presence {
            id: self.next_event_id(),
            time: now,
            character: character.clone(),
            name: name.to_string(),
            joined,
        }
    }

    fn load_message(&self) -> ServerMessage {
        ServerMessage::Load {
            revision: self.revision,
            full: self.state.export_full(),
            effects: self.sent_effects.clone(),
        }
    }

    fn send_to(&mut self, id: &CharacterId, message: ServerMessage, now: i64) {
        if let Some(character) = self.characters.get_mut(id) {
            if !character.send(message, now) {
                debug!("{} is offline, message dropped", id);
            }
        }
    }

    /// Publish a validated candidate snapshot.
    fn commit(&mut self, next: GlobalState, events: Vec<ChatEvent>, now: i64) {
        let changes = next.list_changes(&self.state);
        for id in &changes.characters {
            if self.characters.contains(id) {
                self.dirty.insert(SaveKey::Character(id.clone()));
            }
        }
        let (before, after) = (self.state.space(), next.space());
        if before.config != after.config || before.items != after.items {
            self.dirty.insert(SaveKey::Space(after.id.clone()));
        }

        let delta = next.export_delta(&self.state);
        self.state = next;
        self.broadcast_update(delta, now);

        for event in events {
            self.history.push(event.clone());
            let message = ServerMessage::Chat { messages: vec![event] };
            for character in self.characters.iter_mut() {
                if character.is_online() {
                    character.send(message.clone(), now);
                }
            }
        }
    }

    /// Recompute effects, diff them against what clients last saw, and broadcast the
    /// delta if anything changed.
    fn broadcast_update(&mut self, delta: DeltaBundle, now: i64) {
        let current: BTreeMap<CharacterId, EffectBundle> = self
            .characters
            .iter()
            .map(|character| (character.id.clone(), character.modifiers.active_effects(&self.state)))
            .filter(|(_, effects)| !effects.is_neutral())
            .collect();
        let mut effects = BTreeMap::new();
        for (id, bundle) in &current {
            if self.sent_effects.get(id) != Some(bundle) {
                effects.insert(id.clone(), Some(*bundle));
            }
        }
        for id in self.sent_effects.keys() {
            if !current.contains_key(id) {
                effects.insert(id.clone(), None);
            }
        }
        self.sent_effects = current;

        if delta.is_empty() && effects.is_empty() {
            return;
        }
        self.revision += 1;
        let message = ServerMessage::Update {
            revision: self.revision,
            delta,
            effects,
        };
        for character in self.characters.iter_mut() {
            if character.is_online() {
                character.send(message.clone(), now);
            }
        }
    }

    /// Check that the committed state and the worker's bookkeeping still agree.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        self.state
            .validate()
            .map_err(|err| EngineError::FatalInvariant(format!("space {}: {}", self.id(), err)))?;
        let orphaned = self.pipeline.orphaned_attempts(&self.characters);
        if !orphaned.is_empty() {
            return Err(EngineError::FatalInvariant(format!(
                "space {}: attempts without owner: {:?}",
                self.id(),
                orphaned
            )));
        }
        let held: BTreeSet<&CharacterId> = self.characters.ids().collect();
        let present: BTreeSet<&CharacterId> = self.state.character_ids().collect();
        if held != present {
            warn!("space {} registry and snapshot disagree", self.id());
            return Err(EngineError::FatalInvariant(format!(
                "space {}: registry and snapshot characters differ",
                self.id()
            )));
        }
        Ok(())
    }
}
