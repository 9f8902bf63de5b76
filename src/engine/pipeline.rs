//! Action pipeline: structural validation, permission resolution, modifier checks and
//! the single-attempt state machine for slow actions.
//!
//! Each character holds at most one pending [`ActionAttempt`]. Starting or immediately
//! applying any other action supersedes it; completing is only accepted once the
//! earliest completion time has passed, and an early completion leaves the attempt in
//! place. The pipeline never commits anything itself: an `Applied` outcome carries the
//! candidate snapshot for the synchronizer to publish.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::action::{apply_action, required_permissions, Action, ActionMessage, ActionProblem, ActionResult, ActorRef};
use crate::engine::character::{Character, CharacterRegistry};
use crate::engine::modifiers::{ChainRole, ChainVerdict};
use crate::engine::permissions::{PermissionKey, Policy};
use crate::engine::snapshot::GlobalState;
use crate::engine::types::CharacterId;

/// Client request: the operation plus, for new actions, the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    DoImmediately(Action),
    Start(Action),
    Complete,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAttempt {
    pub action: Action,
    pub started_at: i64,
    pub earliest_completion: i64,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Applied {
        snapshot: GlobalState,
        chat: Vec<ActionMessage>,
        /// Character whose pending attempt this action interrupted
        interrupted: Option<CharacterId>,
    },
    AttemptStarted {
        attempt: ActionAttempt,
    },
    Aborted,
    Blocked {
        problems: Vec<ActionProblem>,
    },
    PromptRequired {
        target: CharacterId,
        permissions: Vec<PermissionKey>,
    },
}

impl Outcome {
    fn blocked(problem: ActionProblem) -> Self {
        Outcome::Blocked {
            problems: vec![problem],
        }
    }
}

struct Evaluation {
    result: ActionResult,
    delay_ms: u64,
}

#[derive(Debug, Default)]
pub struct ActionPipeline {
    attempts: BTreeMap<CharacterId, ActionAttempt>,
}

impl ActionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, character: &CharacterId) -> Option<&ActionAttempt> {
        self.attempts.get(character)
    }

    /// Drop a pending attempt without touching any snapshot.
    pub fn cancel(&mut self, character: &CharacterId) -> Option<ActionAttempt> {
        self.attempts.remove(character)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Attempts whose owner is not held by `characters`.
    pub fn orphaned_attempts(&self, characters: &CharacterRegistry) -> Vec<CharacterId> {
        self.attempts
            .keys()
            .filter(|owner| !characters.contains(owner))
            .cloned()
            .collect()
    }

    /// Run one request through structure, permission and modifier checks. A `Start`
    /// whose combined delay is zero applies like `DoImmediately`.
    pub fn process(
        &mut self,
        actor: &CharacterId,
        request: ActionRequest,
        characters: &CharacterRegistry,
        snapshot: &GlobalState,
        now: i64,
    ) -> Outcome {
        let Some(character) = characters.get(actor) else {
            return Outcome::blocked(ActionProblem::CharacterNotFound {
                character: actor.clone(),
            });
        };

        match request {
            ActionRequest::Abort => match self.attempts.remove(actor) {
                Some(_) => {
                    debug!("{} aborted their attempt", actor);
                    Outcome::Aborted
                }
                None => Outcome::blocked(ActionProblem::NoAttempt),
            },
            ActionRequest::Complete => {
                let Some(attempt) = self.attempts.get(actor).cloned() else {
                    return Outcome::blocked(ActionProblem::NoAttempt);
                };
                if now < attempt.earliest_completion {
                    return Outcome::blocked(ActionProblem::TooSoon {
                        remaining_ms: attempt.earliest_completion - now,
                    });
                }
                match self.evaluate(character, &attempt.action, characters, snapshot) {
                    Ok(evaluation) => {
                        self.attempts.remove(actor);
                        self.finish(&attempt.action, evaluation)
                    }
                    Err(outcome) => outcome,
                }
            }
            ActionRequest::DoImmediately(action) => {
                match self.evaluate(character, &action, characters, snapshot) {
                    Ok(evaluation) if evaluation.delay_ms > 0 => {
                        Outcome::blocked(ActionProblem::AttemptRequired {
                            delay_ms: evaluation.delay_ms,
                        })
                    }
                    Ok(evaluation) => {
                        if self.attempts.remove(actor).is_some() {
                            debug!("{} superseded their pending attempt", actor);
                        }
                        self.finish(&action, evaluation)
                    }
                    Err(outcome) => outcome,
                }
            }
            ActionRequest::Start(action) => match self.evaluate(character, &action, characters, snapshot) {
                // Nothing to wait for: apply now instead of parking an attempt.
                Ok(evaluation) if evaluation.delay_ms == 0 => {
                    if self.attempts.remove(actor).is_some() {
                        debug!("{} superseded their pending attempt", actor);
                    }
                    self.finish(&action, evaluation)
                }
                Ok(evaluation) => {
                    let attempt = ActionAttempt {
                        action,
                        started_at: now,
                        earliest_completion: now + evaluation.delay_ms as i64,
                    };
                    if self.attempts.insert(actor.clone(), attempt.clone()).is_some() {
                        debug!("{} superseded their pending attempt", actor);
                    }
                    Outcome::AttemptStarted { attempt }
                }
                Err(outcome) => outcome,
            },
        }
    }

    fn finish(&mut self, action: &Action, evaluation: Evaluation) -> Outcome {
        let interrupted = match action {
            Action::InterruptAttempt { target } => self.attempts.remove(target).map(|_| target.clone()),
            _ => None,
        };
        Outcome::Applied {
            snapshot: evaluation.result.snapshot,
            chat: evaluation.result.messages,
            interrupted,
        }
    }

    fn evaluate(
        &self,
        actor: &Character,
        action: &Action,
        characters: &CharacterRegistry,
        snapshot: &GlobalState,
    ) -> Result<Evaluation, Outcome> {
        if let Action::InterruptAttempt { target } = action {
            if target == &actor.id || !self.attempts.contains_key(target) {
                return Err(Outcome::blocked(ActionProblem::NoAttemptToInterrupt {
                    character: target.clone(),
                }));
            }
        }

        // (1) structure
        let result = apply_action(
            snapshot,
            ActorRef {
                character: &actor.id,
                account: &actor.account,
            },
            action,
        )
        .map_err(Outcome::blocked)?;

        // (2) permissions
        let mut denied = Vec::new();
        let mut prompts: Vec<(CharacterId, Vec<PermissionKey>)> = Vec::new();
        for (target, keys) in required_permissions(snapshot, &actor.id, action) {
            let Some(owner) = characters.get(&target) else {
                return Err(Outcome::blocked(ActionProblem::CharacterNotFound { character: target }));
            };
            let mut promptable = Vec::new();
            for key in keys {
                match owner.permissions.check(&key, &actor.id) {
                    Policy::Yes => {}
                    Policy::No => denied.push(ActionProblem::PermissionDenied {
                        character: target.clone(),
                        permission: key,
                    }),
                    Policy::Prompt => promptable.push(key),
                }
            }
            if !promptable.is_empty() {
                prompts.push((target, promptable));
            }
        }
        if !denied.is_empty() {
            debug!(target: "security", "{} denied: {:?}", actor.id, denied);
            return Err(Outcome::Blocked { problems: denied });
        }
        // The most restrictive target is the one asking for the most consent.
        if let Some((target, permissions)) = prompts
            .into_iter()
            .max_by(|(a_id, a), (b_id, b)| a.len().cmp(&b.len()).then_with(|| b_id.cmp(a_id)))
        {
            debug!(target: "security", "{} needs consent from {} for {:?}", actor.id, target, permissions);
            return Err(Outcome::PromptRequired { target, permissions });
        }

        // (3) modifiers: the actor's chain first, then every other affected character
        let mut delay_ms = 0;
        let mut chains: Vec<(&Character, ChainRole)> = vec![(actor, ChainRole::Actor)];
        for target in action.characters() {
            if target != &actor.id {
                if let Some(other) = characters.get(target) {
                    chains.push((other, ChainRole::Target));
                }
            }
        }
        for (owner, role) in chains {
            match owner.modifiers.check_character_action(snapshot, action, role) {
                ChainVerdict::Allow => {}
                ChainVerdict::Block { modifier, reason } => {
                    return Err(Outcome::blocked(ActionProblem::ModifierBlocked {
                        character: owner.id.clone(),
                        modifier,
                        reason,
                    }))
                }
                ChainVerdict::Slow { delay_ms: requested } => delay_ms = delay_ms.max(requested),
            }
        }

        // Effects from worn items apply even without a modifier.
        let effects = actor.modifiers.active_effects(snapshot);
        if effects.block_hands && action.uses_hands() {
            return Err(Outcome::blocked(ActionProblem::HandsBlocked));
        }
        if let Action::MoveCharacter { target, .. } = action {
            let rooted = characters
                .get(target)
                .map(|moved| moved.modifiers.active_effects(snapshot).block_room_movement)
                .unwrap_or(false);
            if rooted {
                return Err(Outcome::blocked(ActionProblem::MovementBlocked));
            }
        }

        Ok(Evaluation { result, delay_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::action::ActionTarget;
    use crate::engine::assets::{AssetCatalog, AssetDefinition, ModuleKind};
    use crate::engine::character::CharacterLimits;
    use crate::engine::effects::EffectContribution;
    use crate::engine::modifiers::{ModifierConfig, ModifierType, NewModifier};
    use crate::engine::permissions::PolicyChange;
    use crate::engine::types::{CharacterState, Item, PoseChange, RoomPosition, SpaceConfig, SpaceState, Stance};
    use std::sync::Arc;

    const LIMITS: CharacterLimits = CharacterLimits {
        max_modifiers: 8,
        max_permission_overrides: 8,
    };

    struct Fixture {
        pipeline: ActionPipeline,
        characters: CharacterRegistry,
        snapshot: GlobalState,
    }

    fn fixture() -> Fixture {
        let assets = Arc::new(AssetCatalog::new(vec![
            AssetDefinition::new("a/shirt", "Shirt").wearable(),
            AssetDefinition::new("a/cuffs", "Cuffs")
                .wearable()
                .with_module("lock", ModuleKind::LockSlot),
            AssetDefinition::new("a/mittens", "Mittens")
                .wearable()
                .with_effects(EffectContribution {
                    block_hands: true,
                    ..Default::default()
                }),
        ]));
        let snapshot = GlobalState::new(assets, SpaceState::new("s1".into(), SpaceConfig::named("Lounge")))
            .join(CharacterState::new("a".into(), "s1".into()))
            .join(CharacterState::new("b".into(), "s1".into()));
        let mut characters = CharacterRegistry::new();
        characters.insert(Character::new("a".into(), "acct-a".into(), "Alice", LIMITS));
        characters.insert(Character::new("b".into(), "acct-b".into(), "Bob", LIMITS));
        Fixture {
            pipeline: ActionPipeline::new(),
            characters,
            snapshot,
        }
    }

    impl Fixture {
        fn run(&mut self, actor: &str, request: ActionRequest, now: i64) -> Outcome {
            self.pipeline
                .process(&actor.into(), request, &self.characters, &self.snapshot, now)
        }

        fn character(&mut self, id: &str) -> &mut Character {
            self.characters.get_mut(&id.into()).expect("character")
        }
    }

    fn kneel(target: &str) -> Action {
        Action::Pose {
            target: target.into(),
            change: PoseChange {
                stance: Some(Stance::Kneeling),
                arms: None,
            },
        }
    }

    fn slow(fx: &mut Fixture, delay_ms: u64) {
        fx.character("a")
            .modifiers
            .add(NewModifier::new(ModifierType::SlowActions).with_config(ModifierConfig::Delay { delay_ms }))
            .unwrap();
    }

    #[test]
    fn immediate_action_applies() {
        let mut fx = fixture();
        match fx.run("a", ActionRequest::DoImmediately(kneel("b")), 0) {
            Outcome::Applied { snapshot, chat, .. } => {
                assert_eq!(snapshot.character(&"b".into()).unwrap().pose.stance, Stance::Kneeling);
                assert_eq!(chat.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn denied_permission_blocks() {
        let mut fx = fixture();
        fx.character("b")
            .permissions
            .set_policy(
                &PermissionKey::change_pose(),
                PolicyChange::Default {
                    policy: Some(Policy::No),
                },
            )
            .unwrap();
        match fx.run("a", ActionRequest::DoImmediately(kneel("b")), 0) {
            Outcome::Blocked { problems } => assert!(matches!(
                problems[0],
                ActionProblem::PermissionDenied { .. }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn slow_action_needs_an_attempt() {
        let mut fx = fixture();
        slow(&mut fx, 1_000);
        match fx.run("a", ActionRequest::DoImmediately(kneel("a")), 0) {
            Outcome::Blocked { problems } => {
                assert_eq!(problems, vec![ActionProblem::AttemptRequired { delay_ms: 1_000 }])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn attempt_completes_only_after_the_delay() {
        let mut fx = fixture();
        slow(&mut fx, 1_000);
        let started = fx.run("a", ActionRequest::Start(kneel("a")), 10_000);
        let Outcome::AttemptStarted { attempt } = started else {
            panic!("expected attempt");
        };
        assert_eq!(attempt.earliest_completion, 11_000);

        match fx.run("a", ActionRequest::Complete, 10_900) {
            Outcome::Blocked { problems } => {
                assert_eq!(problems, vec![ActionProblem::TooSoon { remaining_ms: 100 }])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(fx.pipeline.pending(&"a".into()).is_some());

        assert!(matches!(
            fx.run("a", ActionRequest::Complete, 11_001),
            Outcome::Applied { .. }
        ));
        assert!(fx.pipeline.pending(&"a".into()).is_none());
    }

    #[test]
    fn start_without_delay_applies_at_once() {
        let mut fx = fixture();
        match fx.run("a", ActionRequest::Start(kneel("a")), 0) {
            Outcome::Applied { snapshot, .. } => {
                assert_eq!(snapshot.character(&"a".into()).unwrap().pose.stance, Stance::Kneeling)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.pipeline.attempt_count(), 0);
    }

    #[test]
    fn abort_discards_and_new_start_supersedes() {
        let mut fx = fixture();
        slow(&mut fx, 500);
        fx.run("a", ActionRequest::Start(kneel("a")), 0);
        fx.run("a", ActionRequest::Start(kneel("b")), 10);
        assert_eq!(fx.pipeline.attempt_count(), 1);
        assert_eq!(fx.pipeline.pending(&"a".into()).unwrap().action, kneel("b"));
        assert!(matches!(fx.run("a", ActionRequest::Abort, 20), Outcome::Aborted));
        assert!(matches!(
            fx.run("a", ActionRequest::Abort, 30),
            Outcome::Blocked { .. }
        ));
    }

    #[test]
    fn interrupt_cancels_another_characters_attempt() {
        let mut fx = fixture();
        slow(&mut fx, 500);
        fx.run("a", ActionRequest::Start(kneel("a")), 0);
        match fx.run(
            "b",
            ActionRequest::DoImmediately(Action::InterruptAttempt { target: "a".into() }),
            10,
        ) {
            Outcome::Applied { interrupted, .. } => assert_eq!(interrupted, Some("a".into())),
            other => panic!("unexpected {:?}", other),
        }
        assert!(fx.pipeline.pending(&"a".into()).is_none());
        assert!(matches!(
            fx.run(
                "b",
                ActionRequest::DoImmediately(Action::InterruptAttempt { target: "a".into() }),
                20,
            ),
            Outcome::Blocked { .. }
        ));
    }

    #[test]
    fn prompt_names_the_target() {
        let mut fx = fixture();
        fx.character("b")
            .permissions
            .set_policy(
                &PermissionKey::use_lock_slot_module(),
                PolicyChange::Default {
                    policy: Some(Policy::Prompt),
                },
            )
            .unwrap();
        let action = Action::Create {
            target: ActionTarget::Character { id: "b".into() },
            container: Vec::new(),
            asset: "a/cuffs".into(),
            item_id: Some("cuffs".into()),
            color: None,
        };
        match fx.run("a", ActionRequest::DoImmediately(action.clone()), 0) {
            Outcome::PromptRequired { target, permissions } => {
                assert_eq!(target, CharacterId::new("b"));
                assert_eq!(permissions, vec![PermissionKey::use_lock_slot_module()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        fx.character("b")
            .permissions
            .grant(&"a".into(), &[PermissionKey::use_lock_slot_module()])
            .unwrap();
        assert!(matches!(
            fx.run("a", ActionRequest::DoImmediately(action), 0),
            Outcome::Applied { .. }
        ));
    }

    #[test]
    fn worn_item_effects_block_hands() {
        let mut fx = fixture();
        fx.snapshot = fx
            .snapshot
            .update_character(&"a".into(), |state| {
                state.items.push(Item::new("m".into(), "a/mittens".into()))
            })
            .unwrap();
        let action = Action::Create {
            target: ActionTarget::Character { id: "a".into() },
            container: Vec::new(),
            asset: "a/shirt".into(),
            item_id: None,
            color: None,
        };
        match fx.run("a", ActionRequest::DoImmediately(action), 0) {
            Outcome::Blocked { problems } => assert_eq!(problems, vec![ActionProblem::HandsBlocked]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rooted_character_cannot_be_moved() {
        let mut fx = fixture();
        fx.character("a")
            .modifiers
            .add(NewModifier::new(ModifierType::BlockRoomMovement))
            .unwrap();
        let step = Action::MoveCharacter {
            target: "a".into(),
            position: RoomPosition { x: 10, y: 10 },
        };
        match fx.run("a", ActionRequest::DoImmediately(step.clone()), 0) {
            Outcome::Blocked { problems } => assert!(matches!(
                problems[0],
                ActionProblem::ModifierBlocked { .. }
            )),
            other => panic!("unexpected {:?}", other),
        }
        match fx.run("b", ActionRequest::DoImmediately(step), 0) {
            Outcome::Blocked { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
