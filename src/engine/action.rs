//! Action payloads and their structural application.
//!
//! [`apply_action`] applies an action to a candidate snapshot and validates the result.
//! It does not look at permissions, modifiers or attempts; the pipeline layers those
//! on top. [`required_permissions`] reports which permissions an action touches on
//! characters other than the actor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::engine::permissions::PermissionKey;
use crate::engine::snapshot::GlobalState;
use crate::engine::types::{
    container_items, container_items_mut, find_item, AccountId, AssetId, CharacterId,
    ContainerStep, Item, ItemId, ItemModuleState, ItemPath, PoseChange, RoomPosition,
    SpaceConfigPatch, SpaceRole,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionTarget {
    Character { id: CharacterId },
    Room,
}

impl ActionTarget {
    pub fn character(&self) -> Option<&CharacterId> {
        match self {
            ActionTarget::Character { id } => Some(id),
            ActionTarget::Room => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModuleAction {
    SetVariant { variant: String },
    Lock,
    Unlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Spawn a new item of `asset` into an inventory (worn items when `container` is empty).
    Create {
        target: ActionTarget,
        #[serde(default)]
        container: Vec<ContainerStep>,
        asset: AssetId,
        #[serde(default)]
        item_id: Option<ItemId>,
        #[serde(default)]
        color: Option<String>,
    },
    Delete {
        target: ActionTarget,
        item: ItemPath,
    },
    Transfer {
        source: ActionTarget,
        item: ItemPath,
        destination: ActionTarget,
        #[serde(default)]
        container: Vec<ContainerStep>,
    },
    /// Reorder an item within its list.
    Move {
        target: ActionTarget,
        item: ItemPath,
        shift: i32,
    },
    Module {
        target: ActionTarget,
        item: ItemPath,
        module: String,
        action: ModuleAction,
    },
    Pose {
        target: CharacterId,
        change: PoseChange,
    },
    MoveCharacter {
        target: CharacterId,
        position: RoomPosition,
    },
    ConfigureSpace {
        patch: SpaceConfigPatch,
    },
    InterruptAttempt {
        target: CharacterId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Delete,
    Transfer,
    Move,
    Module,
    Pose,
    MoveCharacter,
    ConfigureSpace,
    InterruptAttempt,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create { .. } => ActionKind::Create,
            Action::Delete { .. } => ActionKind::Delete,
            Action::Transfer { .. } => ActionKind::Transfer,
            Action::Move { .. } => ActionKind::Move,
            Action::Module { .. } => ActionKind::Module,
            Action::Pose { .. } => ActionKind::Pose,
            Action::MoveCharacter { .. } => ActionKind::MoveCharacter,
            Action::ConfigureSpace { .. } => ActionKind::ConfigureSpace,
            Action::InterruptAttempt { .. } => ActionKind::InterruptAttempt,
        }
    }

    /// Item manipulation needs free hands.
    pub fn uses_hands(&self) -> bool {
        matches!(
            self,
            Action::Create { .. }
                | Action::Delete { .. }
                | Action::Transfer { .. }
                | Action::Move { .. }
                | Action::Module { .. }
        )
    }

    /// Characters whose state the action reads or changes.
    pub fn characters(&self) -> Vec<&CharacterId> {
        let mut out = Vec::new();
        match self {
            Action::Create { target, .. }
            | Action::Delete { target, .. }
            | Action::Move { target, .. }
            | Action::Module { target, .. } => out.extend(target.character()),
            Action::Transfer {
                source,
                destination,
                ..
            } => {
                out.extend(source.character());
                out.extend(destination.character());
            }
            Action::Pose { target, .. }
            | Action::MoveCharacter { target, .. }
            | Action::InterruptAttempt { target } => out.push(target),
            Action::ConfigureSpace { .. } => {}
        }
        out.dedup();
        out
    }
}

/// Structured reason an action was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ActionProblem {
    #[error("character {character} is not in this space")]
    CharacterNotFound { character: CharacterId },
    #[error("item {item} not found")]
    ItemNotFound { item: ItemId },
    #[error("container not found")]
    ContainerNotFound,
    #[error("unknown asset {asset}")]
    UnknownAsset { asset: AssetId },
    #[error("item {item} has no module {module}")]
    ModuleNotFound { item: ItemId, module: String },
    #[error("module {module} of item {item} does not support that action")]
    InvalidModuleAction { item: ItemId, module: String },
    #[error("item {item} is locked")]
    ItemLocked { item: ItemId },
    #[error("cannot shift item by {shift}")]
    InvalidShift { shift: i32 },
    #[error("position is outside the room")]
    InvalidPosition,
    #[error("nothing to change")]
    NothingToChange,
    #[error("only space admins may do that")]
    NotSpaceAdmin,
    #[error("resulting state is invalid: {reason}")]
    InvalidState { reason: String },
    #[error("character {character} has no pending attempt")]
    NoAttemptToInterrupt { character: CharacterId },
    #[error("hands are blocked")]
    HandsBlocked,
    #[error("room movement is blocked")]
    MovementBlocked,
    #[error("character {character} denies {permission}")]
    PermissionDenied {
        character: CharacterId,
        permission: PermissionKey,
    },
    #[error("blocked by modifier {modifier} of {character}: {reason}")]
    ModifierBlocked {
        character: CharacterId,
        modifier: String,
        reason: String,
    },
    #[error("attempt cannot complete for another {remaining_ms} ms")]
    TooSoon { remaining_ms: i64 },
    #[error("action takes {delay_ms} ms and must be started as an attempt")]
    AttemptRequired { delay_ms: u64 },
    #[error("no pending attempt")]
    NoAttempt,
}

/// Chat-visible description of an applied action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub kind: ActionKind,
    pub actor: CharacterId,
    #[serde(default)]
    pub target: Option<CharacterId>,
    #[serde(default)]
    pub asset: Option<AssetId>,
}

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub snapshot: GlobalState,
    pub messages: Vec<ActionMessage>,
}

/// Who is acting.
#[derive(Debug, Clone, Copy)]
pub struct ActorRef<'a> {
    pub character: &'a CharacterId,
    pub account: &'a AccountId,
}

fn inventory<'a>(snapshot: &'a GlobalState, target: &ActionTarget) -> Result<&'a [Item], ActionProblem> {
    match target {
        ActionTarget::Character { id } => snapshot
            .character(id)
            .map(|state| state.items.as_slice())
            .ok_or_else(|| ActionProblem::CharacterNotFound { character: id.clone() }),
        ActionTarget::Room => Ok(snapshot.space().items.as_slice()),
    }
}

fn with_inventory(
    snapshot: &GlobalState,
    target: &ActionTarget,
    edit: impl FnOnce(&mut Vec<Item>) -> Result<(), ActionProblem>,
) -> Result<GlobalState, ActionProblem> {
    let mut items = inventory(snapshot, target)?.to_vec();
    edit(&mut items)?;
    Ok(match target {
        ActionTarget::Character { id } => snapshot
            .update_character(id, |state| state.items = items)
            .ok_or_else(|| ActionProblem::CharacterNotFound { character: id.clone() })?,
        ActionTarget::Room => snapshot.update_space(|space| space.items = items),
    })
}

/// Reject paths that pass through a locked lock slot.
fn ensure_path_unlocked(root: &[Item], path: &[ContainerStep]) -> Result<(), ActionProblem> {
    let mut list = root;
    for step in path {
        let holder = list
            .iter()
            .find(|item| item.id == step.item)
            .ok_or(ActionProblem::ContainerNotFound)?;
        let module = holder
            .modules
            .get(&step.module)
            .ok_or(ActionProblem::ContainerNotFound)?;
        if module.is_locked() {
            return Err(ActionProblem::ItemLocked {
                item: holder.id.clone(),
            });
        }
        list = module.contents().ok_or(ActionProblem::ContainerNotFound)?;
    }
    Ok(())
}

fn take_item(root: &mut Vec<Item>, path: &ItemPath) -> Result<Item, ActionProblem> {
    ensure_path_unlocked(root, &path.container)?;
    let list = container_items_mut(root, &path.container).ok_or(ActionProblem::ContainerNotFound)?;
    let index = list
        .iter()
        .position(|item| item.id == path.item)
        .ok_or_else(|| ActionProblem::ItemNotFound {
            item: path.item.clone(),
        })?;
    if list[index].is_locked() {
        return Err(ActionProblem::ItemLocked {
            item: path.item.clone(),
        });
    }
    Ok(list.remove(index))
}

fn put_item(root: &mut Vec<Item>, container: &[ContainerStep], item: Item) -> Result<(), ActionProblem> {
    ensure_path_unlocked(root, container)?;
    let list = container_items_mut(root, container).ok_or(ActionProblem::ContainerNotFound)?;
    list.push(item);
    Ok(())
}

fn message(kind: ActionKind, actor: &CharacterId, target: Option<&CharacterId>, asset: Option<AssetId>) -> ActionMessage {
    ActionMessage {
        kind,
        actor: actor.clone(),
        target: target.cloned(),
        asset,
    }
}

/// Apply `action` to a candidate snapshot and validate the result.
pub fn apply_action(
    snapshot: &GlobalState,
    actor: ActorRef<'_>,
    action: &Action,
) -> Result<ActionResult, ActionProblem> {
    if snapshot.character(actor.character).is_none() {
        return Err(ActionProblem::CharacterNotFound {
            character: actor.character.clone(),
        });
    }
    let kind = action.kind();
    let mut messages = Vec::new();

    let next = match action {
        Action::Create {
            target,
            container,
            asset,
            item_id,
            color,
        } => {
            let id = item_id.clone().unwrap_or_else(ItemId::generate);
            let mut item = snapshot
                .assets()
                .instantiate(asset, id)
                .ok_or_else(|| ActionProblem::UnknownAsset {
                    asset: asset.clone(),
                })?;
            item.color = color.clone();
            messages.push(message(kind, actor.character, target.character(), Some(asset.clone())));
            with_inventory(snapshot, target, |items| put_item(items, container, item))?
        }
        Action::Delete { target, item } => {
            let mut removed = None;
            let next = with_inventory(snapshot, target, |items| {
                removed = Some(take_item(items, item)?);
                Ok(())
            })?;
            let asset = removed.map(|item| item.asset);
            messages.push(message(kind, actor.character, target.character(), asset));
            next
        }
        Action::Transfer {
            source,
            item,
            destination,
            container,
        } => {
            let mut moved = None;
            let intermediate = with_inventory(snapshot, source, |items| {
                moved = Some(take_item(items, item)?);
                Ok(())
            })?;
            let moved = moved.ok_or_else(|| ActionProblem::ItemNotFound {
                item: item.item.clone(),
            })?;
            let asset = moved.asset.clone();
            let next = with_inventory(&intermediate, destination, |items| {
                put_item(items, container, moved)
            })?;
            let target = destination.character().or_else(|| source.character());
            messages.push(message(kind, actor.character, target, Some(asset)));
            next
        }
        Action::Move {
            target,
            item,
            shift,
        } => {
            let shift = *shift;
            let next = with_inventory(snapshot, target, |items| {
                ensure_path_unlocked(items, &item.container)?;
                let list = container_items_mut(items, &item.container)
                    .ok_or(ActionProblem::ContainerNotFound)?;
                let index = list
                    .iter()
                    .position(|candidate| candidate.id == item.item)
                    .ok_or_else(|| ActionProblem::ItemNotFound {
                        item: item.item.clone(),
                    })?;
                let destination = index as i64 + shift as i64;
                if shift == 0 || destination < 0 || destination >= list.len() as i64 {
                    return Err(ActionProblem::InvalidShift { shift });
                }
                let moving = list.remove(index);
                list.insert(destination as usize, moving);
                Ok(())
            })?;
            messages.push(message(kind, actor.character, target.character(), None));
            next
        }
        Action::Module {
            target,
            item,
            module,
            action: module_action,
        } => {
            let mut asset = None;
            let next = with_inventory(snapshot, target, |items| {
                let list = container_items_mut(items, &item.container)
                    .ok_or(ActionProblem::ContainerNotFound)?;
                let found = list
                    .iter_mut()
                    .find(|candidate| candidate.id == item.item)
                    .ok_or_else(|| ActionProblem::ItemNotFound {
                        item: item.item.clone(),
                    })?;
                asset = Some(found.asset.clone());
                let locked = found.is_locked();
                let invalid = || ActionProblem::InvalidModuleAction {
                    item: item.item.clone(),
                    module: module.clone(),
                };
                let state = found
                    .modules
                    .get_mut(module)
                    .ok_or_else(|| ActionProblem::ModuleNotFound {
                        item: item.item.clone(),
                        module: module.clone(),
                    })?;
                match (module_action, state) {
                    (ModuleAction::SetVariant { variant }, ItemModuleState::Typed { variant: current }) => {
                        if locked {
                            return Err(ActionProblem::ItemLocked {
                                item: item.item.clone(),
                            });
                        }
                        if current == variant {
                            return Err(ActionProblem::NothingToChange);
                        }
                        *current = variant.clone();
                    }
                    (ModuleAction::Lock, ItemModuleState::LockSlot { contents, locked }) => {
                        if *locked || contents.is_empty() {
                            return Err(invalid());
                        }
                        *locked = true;
                    }
                    (ModuleAction::Unlock, ItemModuleState::LockSlot { locked, .. }) => {
                        if !*locked {
                            return Err(invalid());
                        }
                        *locked = false;
                    }
                    _ => return Err(invalid()),
                }
                Ok(())
            })?;
            messages.push(message(kind, actor.character, target.character(), asset));
            next
        }
        Action::Pose { target, change } => {
            if change.stance.is_none() && change.arms.is_none() {
                return Err(ActionProblem::NothingToChange);
            }
            let next = snapshot
                .update_character(target, |state| {
                    if let Some(stance) = change.stance {
                        state.pose.stance = stance;
                    }
                    if let Some(arms) = change.arms {
                        state.pose.arms = arms;
                    }
                })
                .ok_or_else(|| ActionProblem::CharacterNotFound {
                    character: target.clone(),
                })?;
            messages.push(message(kind, actor.character, Some(target), None));
            next
        }
        Action::MoveCharacter { target, position } => {
            if !snapshot.space().config.size.contains(*position) {
                return Err(ActionProblem::InvalidPosition);
            }
            snapshot
                .update_character(target, |state| state.position = *position)
                .ok_or_else(|| ActionProblem::CharacterNotFound {
                    character: target.clone(),
                })?
        }
        Action::ConfigureSpace { patch } => {
            if snapshot.space().config.role_of(actor.account) < SpaceRole::Admin {
                return Err(ActionProblem::NotSpaceAdmin);
            }
            if patch.is_empty() {
                return Err(ActionProblem::NothingToChange);
            }
            messages.push(message(kind, actor.character, None, None));
            snapshot.update_space(|space| patch.apply_to(&mut space.config))
        }
        Action::InterruptAttempt { target } => {
            if snapshot.character(target).is_none() {
                return Err(ActionProblem::CharacterNotFound {
                    character: target.clone(),
                });
            }
            messages.push(message(kind, actor.character, Some(target), None));
            snapshot.clone()
        }
    };

    next.validate().map_err(|e| ActionProblem::InvalidState {
        reason: e.to_string(),
    })?;
    Ok(ActionResult {
        snapshot: next,
        messages,
    })
}

/// True when the last step of `container` is a lock slot module.
fn container_is_lock_slot(root: &[Item], container: &[ContainerStep]) -> bool {
    let Some((last, parents)) = container.split_last() else {
        return false;
    };
    let list: &[Item] = if parents.is_empty() {
        root
    } else {
        match container_items(root, parents) {
            Some(list) => list,
            None => return false,
        }
    };
    list.iter()
        .find(|item| item.id == last.item)
        .and_then(|item| item.modules.get(&last.module))
        .map(|module| matches!(module, ItemModuleState::LockSlot { .. }))
        .unwrap_or(false)
}

/// Permissions `action` needs from every affected character other than the actor.
pub fn required_permissions(
    snapshot: &GlobalState,
    actor: &CharacterId,
    action: &Action,
) -> BTreeMap<CharacterId, BTreeSet<PermissionKey>> {
    let mut required: BTreeMap<CharacterId, BTreeSet<PermissionKey>> = BTreeMap::new();
    let assets = snapshot.assets();

    let mut need = |target: Option<&CharacterId>, keys: &[PermissionKey]| {
        let Some(target) = target else { return };
        if target == actor {
            return;
        }
        let entry = required.entry(target.clone()).or_default();
        entry.insert(PermissionKey::interact());
        entry.extend(keys.iter().cloned());
    };

    let removal_keys = |target: &ActionTarget, path: &ItemPath| -> Vec<PermissionKey> {
        let mut keys = vec![PermissionKey::modify_appearance()];
        let Ok(root) = inventory(snapshot, target) else {
            return keys;
        };
        let lock_slot = container_is_lock_slot(root, &path.container)
            || find_item(root, path)
                .map(|item| assets.item_has_lock_slot(item))
                .unwrap_or(false);
        if lock_slot {
            keys.push(PermissionKey::use_lock_slot_module());
        }
        keys
    };

    let insertion_keys = |target: &ActionTarget, container: &[ContainerStep], lock_slot_item: bool| {
        let mut keys = vec![PermissionKey::modify_appearance()];
        let into_lock_slot = inventory(snapshot, target)
            .map(|root| container_is_lock_slot(root, container))
            .unwrap_or(false);
        if lock_slot_item || into_lock_slot {
            keys.push(PermissionKey::use_lock_slot_module());
        }
        keys
    };

    match action {
        Action::Create {
            target,
            container,
            asset,
            ..
        } => {
            let lock_slot_item = assets
                .get(asset)
                .map(|definition| definition.has_lock_slot())
                .unwrap_or(false);
            need(target.character(), &insertion_keys(target, container, lock_slot_item));
        }
        Action::Delete { target, item } => {
            need(target.character(), &removal_keys(target, item));
        }
        Action::Transfer {
            source,
            item,
            destination,
            container,
        } => {
            let lock_slot_item = inventory(snapshot, source)
                .ok()
                .and_then(|root| find_item(root, item))
                .map(|found| assets.item_has_lock_slot(found))
                .unwrap_or(false);
            need(source.character(), &removal_keys(source, item));
            need(
                destination.character(),
                &insertion_keys(destination, container, lock_slot_item),
            );
        }
        Action::Move { target, .. } => {
            need(target.character(), &[PermissionKey::modify_appearance()]);
        }
        Action::Module {
            target,
            item,
            module,
            action: module_action,
        } => {
            let key = match module_action {
                ModuleAction::SetVariant { .. } => PermissionKey::modify_appearance(),
                ModuleAction::Lock | ModuleAction::Unlock => PermissionKey::use_lock_slot_module(),
            };
            let mut keys = vec![key];
            let is_lock_slot = inventory(snapshot, target)
                .ok()
                .and_then(|root| find_item(root, item))
                .and_then(|found| found.modules.get(module))
                .map(|state| matches!(state, ItemModuleState::LockSlot { .. }))
                .unwrap_or(false);
            if is_lock_slot {
                keys.push(PermissionKey::use_lock_slot_module());
            }
            need(target.character(), &keys);
        }
        Action::Pose { target, .. } => need(Some(target), &[PermissionKey::change_pose()]),
        Action::MoveCharacter { target, .. } | Action::InterruptAttempt { target } => {
            need(Some(target), &[])
        }
        Action::ConfigureSpace { .. } => {}
    }
    required
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::assets::{AssetCatalog, AssetDefinition, ModuleKind};
    use crate::engine::types::{CharacterState, SpaceConfig, SpaceState, Stance};
    use std::sync::Arc;

    fn snapshot() -> GlobalState {
        let assets = Arc::new(AssetCatalog::new(vec![
            AssetDefinition::new("a/shirt", "Shirt").wearable(),
            AssetDefinition::new("a/hat", "Hat").wearable(),
            AssetDefinition::new("a/cuffs", "Cuffs")
                .wearable()
                .with_module("lock", ModuleKind::LockSlot),
            AssetDefinition::new("a/padlock", "Padlock").lock(),
            AssetDefinition::new("a/chest", "Chest")
                .with_module("storage", ModuleKind::Storage { max_items: 5 }),
        ]));
        let space = SpaceState::new(
            "s1".into(),
            SpaceConfig::named("Lounge").with_admin("acct-a".into()),
        );
        GlobalState::new(assets, space)
            .join(CharacterState::new("a".into(), "s1".into()))
            .join(CharacterState::new("b".into(), "s1".into()))
    }

    fn actor() -> (CharacterId, AccountId) {
        ("a".into(), "acct-a".into())
    }

    fn apply(state: &GlobalState, action: &Action) -> Result<ActionResult, ActionProblem> {
        let (character, account) = actor();
        apply_action(
            state,
            ActorRef {
                character: &character,
                account: &account,
            },
            action,
        )
    }

    fn create(target: ActionTarget, asset: &str, id: &str) -> Action {
        Action::Create {
            target,
            container: Vec::new(),
            asset: asset.into(),
            item_id: Some(id.into()),
            color: None,
        }
    }

    fn on_b() -> ActionTarget {
        ActionTarget::Character { id: "b".into() }
    }

    #[test]
    fn create_and_delete_worn_item() {
        let state = snapshot();
        let created = apply(&state, &create(on_b(), "a/shirt", "shirt")).unwrap();
        assert_eq!(created.snapshot.character(&"b".into()).unwrap().items.len(), 1);
        assert_eq!(created.messages[0].asset, Some("a/shirt".into()));

        let deleted = apply(
            &created.snapshot,
            &Action::Delete {
                target: on_b(),
                item: ItemPath::top("shirt".into()),
            },
        )
        .unwrap();
        assert!(deleted.snapshot.character(&"b".into()).unwrap().items.is_empty());
    }

    #[test]
    fn non_wearable_item_cannot_be_worn() {
        let err = apply(&snapshot(), &create(on_b(), "a/chest", "chest")).unwrap_err();
        assert!(matches!(err, ActionProblem::InvalidState { .. }));
        assert!(apply(&snapshot(), &create(ActionTarget::Room, "a/chest", "chest")).is_ok());
    }

    #[test]
    fn locked_item_cannot_be_removed() {
        let state = apply(&snapshot(), &create(on_b(), "a/cuffs", "cuffs")).unwrap().snapshot;
        let state = apply(
            &state,
            &Action::Create {
                target: on_b(),
                container: vec![ContainerStep {
                    item: "cuffs".into(),
                    module: "lock".into(),
                }],
                asset: "a/padlock".into(),
                item_id: Some("lock".into()),
                color: None,
            },
        )
        .unwrap()
        .snapshot;
        let lock_action = Action::Module {
            target: on_b(),
            item: ItemPath::top("cuffs".into()),
            module: "lock".into(),
            action: ModuleAction::Lock,
        };
        let state = apply(&state, &lock_action).unwrap().snapshot;
        assert_eq!(
            apply(&state, &lock_action).unwrap_err(),
            ActionProblem::InvalidModuleAction {
                item: "cuffs".into(),
                module: "lock".into()
            }
        );
        let err = apply(
            &state,
            &Action::Delete {
                target: on_b(),
                item: ItemPath::top("cuffs".into()),
            },
        )
        .unwrap_err();
        assert_eq!(err, ActionProblem::ItemLocked { item: "cuffs".into() });
    }

    #[test]
    fn transfer_moves_between_inventories() {
        let state = apply(&snapshot(), &create(ActionTarget::Room, "a/hat", "hat"))
            .unwrap()
            .snapshot;
        let moved = apply(
            &state,
            &Action::Transfer {
                source: ActionTarget::Room,
                item: ItemPath::top("hat".into()),
                destination: on_b(),
                container: Vec::new(),
            },
        )
        .unwrap()
        .snapshot;
        assert!(moved.space().items.is_empty());
        assert_eq!(moved.character(&"b".into()).unwrap().items[0].id, ItemId::new("hat"));
    }

    #[test]
    fn move_reorders_and_rejects_out_of_range() {
        let mut state = snapshot();
        for (asset, id) in [("a/shirt", "shirt"), ("a/hat", "hat")] {
            state = apply(&state, &create(on_b(), asset, id)).unwrap().snapshot;
        }
        let reordered = apply(
            &state,
            &Action::Move {
                target: on_b(),
                item: ItemPath::top("hat".into()),
                shift: -1,
            },
        )
        .unwrap()
        .snapshot;
        let ids: Vec<_> = reordered.character(&"b".into()).unwrap().items.iter().map(|i| i.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["hat", "shirt"]);
        let err = apply(
            &state,
            &Action::Move {
                target: on_b(),
                item: ItemPath::top("hat".into()),
                shift: 1,
            },
        )
        .unwrap_err();
        assert_eq!(err, ActionProblem::InvalidShift { shift: 1 });
    }

    #[test]
    fn configure_space_requires_admin() {
        let patch = SpaceConfigPatch {
            name: Some("Den".into()),
            ..Default::default()
        };
        let result = apply(&snapshot(), &Action::ConfigureSpace { patch: patch.clone() }).unwrap();
        assert_eq!(result.snapshot.space().config.name, "Den");

        let outsider: CharacterId = "b".into();
        let account: AccountId = "acct-b".into();
        let err = apply_action(
            &snapshot(),
            ActorRef {
                character: &outsider,
                account: &account,
            },
            &Action::ConfigureSpace { patch },
        )
        .unwrap_err();
        assert_eq!(err, ActionProblem::NotSpaceAdmin);
    }

    #[test]
    fn pose_and_position_changes() {
        let posed = apply(
            &snapshot(),
            &Action::Pose {
                target: "b".into(),
                change: PoseChange {
                    stance: Some(Stance::Kneeling),
                    arms: None,
                },
            },
        )
        .unwrap()
        .snapshot;
        assert_eq!(posed.character(&"b".into()).unwrap().pose.stance, Stance::Kneeling);
        let err = apply(
            &snapshot(),
            &Action::MoveCharacter {
                target: "a".into(),
                position: RoomPosition { x: 5000, y: 1 },
            },
        )
        .unwrap_err();
        assert_eq!(err, ActionProblem::InvalidPosition);
    }

    #[test]
    fn permissions_cover_lock_slots_and_skip_self() {
        let state = snapshot();
        let required = required_permissions(&state, &"a".into(), &create(on_b(), "a/cuffs", "c"));
        let keys = &required[&CharacterId::new("b")];
        assert!(keys.contains(&PermissionKey::interact()));
        assert!(keys.contains(&PermissionKey::modify_appearance()));
        assert!(keys.contains(&PermissionKey::use_lock_slot_module()));

        let own = required_permissions(
            &state,
            &"a".into(),
            &create(ActionTarget::Character { id: "a".into() }, "a/cuffs", "c"),
        );
        assert!(own.is_empty());

        let pose = required_permissions(
            &state,
            &"a".into(),
            &Action::Pose {
                target: "b".into(),
                change: PoseChange::default(),
            },
        );
        assert!(pose[&CharacterId::new("b")].contains(&PermissionKey::change_pose()));
    }
}
