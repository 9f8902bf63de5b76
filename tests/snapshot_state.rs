mod common;

use roomshard::engine::character::CharacterBundle;
use roomshard::engine::modifiers::{ModifierConfig, ModifierType};
use roomshard::engine::{
    Action, ActionRequest, ActionTarget, Character, CharacterId, CharacterState, GlobalState, Item, ItemPath, NewModifier,
    Outcome, PermissionKey, PermissionRegistry, Policy, PolicyChange, SpaceConfig, SpaceSettings, SpaceState,
};
use roomshard::engine::{ActionPipeline, CharacterRegistry};

fn lounge() -> GlobalState {
    GlobalState::new(common::assets(), SpaceState::new("s1".into(), SpaceConfig::named("Lounge")))
        .join(CharacterState::new("a".into(), "s1".into()))
        .join(CharacterState::new("b".into(), "s1".into()).with_item(Item::new("shirt".into(), "a/shirt".into())))
}

#[test]
fn delta_rebuilds_every_step_of_a_session() {
    let limits = SpaceSettings::default().limits;
    let mut characters = CharacterRegistry::new();
    characters.insert(Character::new("a".into(), "acct-a".into(), "Alice", limits));
    characters.insert(Character::new("b".into(), "acct-b".into(), "Bob", limits));
    let mut pipeline = ActionPipeline::new();

    let steps = vec![
        Action::Create {
            target: ActionTarget::Room,
            container: Vec::new(),
            asset: "a/cup".into(),
            item_id: Some("cup".into()),
            color: None,
        },
        Action::Transfer {
            source: ActionTarget::Character { id: "b".into() },
            item: ItemPath::top("shirt".into()),
            destination: ActionTarget::Character { id: "a".into() },
            container: Vec::new(),
        },
        Action::Delete {
            target: ActionTarget::Room,
            item: ItemPath::top("cup".into()),
        },
    ];

    let mut current = lounge();
    for action in steps {
        let Outcome::Applied { snapshot: next, .. } =
            pipeline.process(&"a".into(), ActionRequest::DoImmediately(action), &characters, &current, 0)
        else {
            panic!("step was not applied");
        };
        let delta = next.export_delta(&current);
        assert!(!delta.is_empty());
        assert_eq!(current.apply_delta(&delta), next);
        // Deltas travel as JSON
        let wire: roomshard::engine::DeltaBundle =
            serde_json::from_str(&serde_json::to_string(&delta).unwrap()).unwrap();
        assert_eq!(current.apply_delta(&wire), next);
        next.validate().unwrap();
        current = next;
    }
    assert_eq!(current.character(&"a".into()).unwrap().items.len(), 1);
    assert!(current.space().items.is_empty());

    let without_b = current.leave(&"b".into());
    let delta = without_b.export_delta(&current);
    assert_eq!(delta.characters.get(&CharacterId::new("b")), Some(&None));
    assert_eq!(current.apply_delta(&delta), without_b);
}

#[test]
fn validation_catches_dangling_references() {
    let state = lounge();
    state.validate().unwrap();

    let mut space = state.space().clone();
    space.characters.insert("ghost".into());
    assert!(state.with_space(space).validate().is_err());

    let unknown = state
        .update_character(&"a".into(), |c| {
            c.items.push(Item::new("x".into(), "a/missing".into()));
        })
        .unwrap();
    assert!(unknown.validate().is_err());
}

#[test]
fn full_bundle_round_trips_through_load() {
    let state = lounge();
    let restored = GlobalState::load_full(common::assets(), state.export_full()).unwrap();
    assert_eq!(restored, state);
}

#[test]
fn resetting_a_permission_restores_the_builtin_default() {
    let mut registry = PermissionRegistry::new("b".into(), 8);
    let key = PermissionKey::change_pose();
    let builtin = registry.check(&key, &"a".into());
    assert_eq!(builtin, Policy::Yes);

    registry
        .set_policy(&key, PolicyChange::Default { policy: Some(Policy::No) })
        .unwrap();
    assert_eq!(registry.check(&key, &"a".into()), Policy::No);
    assert!(registry
        .set_policy(&key, PolicyChange::Default { policy: None })
        .unwrap());
    assert_eq!(registry.check(&key, &"a".into()), builtin);
    assert!(registry.export().is_empty());

    // Second reset changes nothing
    assert!(!registry
        .set_policy(&key, PolicyChange::Default { policy: None })
        .unwrap());
    assert!(registry.get(&key).unwrap().config.is_unset());
    assert_eq!(registry.check(&key, &"b".into()), Policy::Yes);
}

#[test]
fn stacked_effects_respect_the_configured_maximum() {
    let state = lounge();
    let mut chain = roomshard::engine::ModifierChain::new("a".into(), "acct-a".into(), 8);
    for _ in 0..5 {
        chain
            .add(NewModifier::new(ModifierType::EffectBlind).with_config(ModifierConfig::Intensity {
                intensity: 10,
                max_intensity: 6,
            }))
            .unwrap();
    }
    assert_eq!(chain.active_effects(&state).blind, 6);
}

#[test]
fn character_bundles_keep_modifiers_and_permissions() {
    let limits = SpaceSettings::default().limits;
    let mut character = Character::new("a".into(), "acct-a".into(), "Alice", limits);
    character
        .modifiers
        .add(NewModifier::new(ModifierType::EffectDeaf))
        .unwrap();
    character
        .permissions
        .set_policy(
            &PermissionKey::interact(),
            PolicyChange::Actor {
                character: "b".into(),
                policy: Some(Policy::No),
            },
        )
        .unwrap();
    let appearance = CharacterState::new("a".into(), "s1".into());
    let bundle = character.to_bundle(appearance.clone());

    let stored: CharacterBundle = bincode::deserialize(&bincode::serialize(&bundle).unwrap()).unwrap();
    let (restored, restored_appearance) = Character::from_bundle(stored, limits, 0);
    assert_eq!(restored_appearance, appearance);
    assert_eq!(restored.modifiers.modifiers(), character.modifiers.modifiers());
    assert_eq!(restored.permissions.check(&PermissionKey::interact(), &"b".into()), Policy::No);
    assert_eq!(restored.to_bundle(appearance), bundle);
}
