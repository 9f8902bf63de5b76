//! Shared fixtures for the integration tests.

use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use roomshard::engine::{
    AssetCatalog, AssetDefinition, Character, CharacterState, EffectContribution, ModuleKind, ServerMessage,
    SpaceConfig, SpaceSettings, SpaceState, SpaceSynchronizer,
};

/// Small catalogue: a plain shirt, lockable cuffs, a padlock and hand-blocking mittens.
pub fn assets() -> Arc<AssetCatalog> {
    Arc::new(AssetCatalog::new(vec![
        AssetDefinition::new("a/shirt", "Shirt").wearable(),
        AssetDefinition::new("a/cuffs", "Cuffs")
            .wearable()
            .with_module("lock", ModuleKind::LockSlot),
        AssetDefinition::new("a/padlock", "Padlock").lock(),
        AssetDefinition::new("a/mittens", "Mittens")
            .wearable()
            .with_effects(EffectContribution {
                block_hands: true,
                ..Default::default()
            }),
        AssetDefinition::new("a/cup", "Cup"),
    ]))
}

#[allow(dead_code)]
pub fn space(id: &str) -> SpaceSynchronizer {
    SpaceSynchronizer::new(
        assets(),
        SpaceState::new(id.into(), SpaceConfig::named("Lounge")),
        SpaceSettings::default(),
    )
}

/// Join `id` into the space and attach a live connection.
#[allow(dead_code)]
pub fn join(sync: &mut SpaceSynchronizer, id: &str, name: &str) -> UnboundedReceiver<ServerMessage> {
    let character = Character::new(
        id.into(),
        format!("acct-{}", id).as_str().into(),
        name,
        SpaceSettings::default().limits,
    );
    let space = sync.id().clone();
    sync.join(character, CharacterState::new(id.into(), space), 0)
        .expect("join");
    let (tx, rx) = mpsc::unbounded_channel();
    assert!(sync.connect(&id.into(), tx, 0));
    rx
}

#[allow(dead_code)]
pub fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}
