mod common;

use roomshard::engine::modifiers::{ChainRole, ChainVerdict, ModifierConfig, ModifierType};
use roomshard::engine::permissions::{PermissionGroup, PermissionSetup};
use roomshard::engine::protocol::GameLogicResponse;
use roomshard::engine::{
    Action, ActionKind, ActionProblem, ActionRequest, ActionTarget, ClientRequest, NewModifier, PermissionKey,
    Policy, PoseChange, ServerMessage, ServerResponse, Stance,
};
use std::collections::BTreeSet;

fn cuffs_on(target: &str) -> Action {
    Action::Create {
        target: ActionTarget::Character { id: target.into() },
        container: Vec::new(),
        asset: "a/cuffs".into(),
        item_id: Some("cuffs".into()),
        color: None,
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

fn act(request: ActionRequest) -> ClientRequest {
    ClientRequest::GameLogicAction { request }
}

#[test]
fn lock_slot_prompt_then_grant() {
    let mut sync = common::space("s1");
    let mut alice = common::join(&mut sync, "a", "Alice");
    let mut bob = common::join(&mut sync, "b", "Bob");
    let key = PermissionKey::use_lock_slot_module();
    assert_eq!(key.group, PermissionGroup::Interaction);
    // Lock slots ask first without any configuration
    assert_eq!(PermissionSetup::lookup(&key).unwrap().default_policy, Policy::Prompt);
    common::drain(&mut alice);
    common::drain(&mut bob);

    let response = sync.handle_request(&"a".into(), act(ActionRequest::DoImmediately(cuffs_on("b"))), 1);
    assert_eq!(response, ServerResponse::GameLogic(GameLogicResponse::PromptSent));
    let prompts = common::drain(&mut bob);
    assert!(prompts.iter().any(|m| matches!(
        m,
        ServerMessage::PermissionPrompt { requester, permissions, .. }
            if requester.as_str() == "a" && permissions == &vec![key.clone()]
    )));
    assert!(sync.state().character(&"b".into()).unwrap().items.is_empty());

    sync.handle_request(
        &"b".into(),
        ClientRequest::PermissionPromptAnswer {
            requester: "a".into(),
            permissions: vec![key.clone()],
            accept: true,
        },
        2,
    );
    let response = sync.handle_request(&"a".into(), act(ActionRequest::DoImmediately(cuffs_on("b"))), 3);
    assert!(matches!(
        response,
        ServerResponse::GameLogic(GameLogicResponse::Success { .. })
    ));
    assert_eq!(sync.state().character(&"b".into()).unwrap().items.len(), 1);
}

#[test]
fn completing_early_is_too_soon_and_late_succeeds() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    sync.handle_request(
        &"a".into(),
        ClientRequest::CharacterModifierAdd {
            target: "a".into(),
            modifier: NewModifier::new(ModifierType::SlowActions)
                .with_config(ModifierConfig::Delay { delay_ms: 1_000 }),
        },
        0,
    );

    let started = sync.handle_request(&"a".into(), act(ActionRequest::Start(kneel("a"))), 10_000);
    let ServerResponse::GameLogic(GameLogicResponse::AttemptStarted { attempt }) = started else {
        panic!("expected an attempt, got {:?}", started);
    };
    assert_eq!(attempt.earliest_completion, 11_000);

    let early = sync.handle_request(&"a".into(), act(ActionRequest::Complete), 10_900);
    assert_eq!(
        early,
        ServerResponse::GameLogic(GameLogicResponse::Failure {
            problems: vec![ActionProblem::TooSoon { remaining_ms: 100 }],
        })
    );
    assert!(sync.pipeline().pending(&"a".into()).is_some());

    let done = sync.handle_request(&"a".into(), act(ActionRequest::Complete), 11_001);
    assert!(matches!(done, ServerResponse::GameLogic(GameLogicResponse::Success { .. })));
    assert!(sync.pipeline().pending(&"a".into()).is_none());
    assert_eq!(
        sync.state().character(&"a".into()).unwrap().pose.stance,
        Stance::Kneeling
    );
}

#[test]
fn second_start_replaces_the_first_attempt() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    let _bob = common::join(&mut sync, "b", "Bob");
    sync.handle_request(
        &"a".into(),
        ClientRequest::CharacterModifierAdd {
            target: "a".into(),
            modifier: NewModifier::new(ModifierType::SlowActions)
                .with_config(ModifierConfig::Delay { delay_ms: 500 }),
        },
        0,
    );
    sync.handle_request(&"a".into(), act(ActionRequest::Start(kneel("a"))), 0);
    sync.handle_request(&"a".into(), act(ActionRequest::Start(kneel("b"))), 100);
    assert_eq!(sync.pipeline().attempt_count(), 1);
    let pending = sync.pipeline().pending(&"a".into()).unwrap();
    assert_eq!(pending.action, kneel("b"));
    assert_eq!(pending.earliest_completion, 600);

    assert_eq!(
        sync.handle_request(&"a".into(), act(ActionRequest::Abort), 200),
        ServerResponse::GameLogic(GameLogicResponse::Aborted)
    );
    assert_eq!(sync.pipeline().attempt_count(), 0);
    assert_eq!(
        sync.handle_request(&"a".into(), act(ActionRequest::Abort), 300),
        ServerResponse::GameLogic(GameLogicResponse::Failure {
            problems: vec![ActionProblem::NoAttempt],
        })
    );
}

#[test]
fn block_wins_regardless_of_order() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    let mut mittens = NewModifier::new(ModifierType::BlockHands);
    mittens.name = Some("mittens".into());
    let mut no_create = NewModifier::new(ModifierType::PreventActionTypes).with_config(ModifierConfig::ActionKinds {
        kinds: BTreeSet::from([ActionKind::Create]),
    });
    no_create.name = Some("no create".into());

    let snapshot = sync.state().clone();
    let mut chain = sync.character(&"a".into()).unwrap().modifiers.clone();
    chain.add(mittens).unwrap();
    let second = chain.add(no_create).unwrap();
    let action = cuffs_on("a");

    let first_verdict = chain.check_character_action(&snapshot, &action, ChainRole::Actor);
    assert!(matches!(&first_verdict, ChainVerdict::Block { modifier, .. } if modifier == "mittens"));

    assert!(chain.reorder(&"a".into(), &second, -1).unwrap());
    let reordered = chain.check_character_action(&snapshot, &action, ChainRole::Actor);
    assert!(matches!(&reordered, ChainVerdict::Block { modifier, .. } if modifier == "no create"));
}

#[test]
fn non_conflicting_modifiers_commute() {
    let sync = common::space("s1");
    let snapshot = sync.state().clone();
    let mut chain = roomshard::engine::ModifierChain::new("a".into(), "acct-a".into(), 8);
    chain
        .add(NewModifier::new(ModifierType::SlowActions).with_config(ModifierConfig::Delay { delay_ms: 300 }))
        .unwrap();
    let censor = chain
        .add(NewModifier::new(ModifierType::HearingCensorWords).with_config(ModifierConfig::Words {
            words: vec!["secret".into()],
        }))
        .unwrap();
    let action = kneel("a");
    let before = chain.check_character_action(&snapshot, &action, ChainRole::Actor);
    chain.reorder(&"a".into(), &censor, -1).unwrap();
    let after = chain.check_character_action(&snapshot, &action, ChainRole::Actor);
    assert_eq!(before, ChainVerdict::Slow { delay_ms: 300 });
    assert_eq!(before, after);
}
