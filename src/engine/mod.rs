//! Authoritative state engine for roleplay spaces.
//! Characters, items and spaces live in an immutable [`GlobalState`] snapshot that
//! only the action pipeline advances; each space runs as one synchronizer task
//! inside a [`Shard`], which persists dirty entities to sled.

pub mod action;
pub mod assets;
pub mod character;
pub mod chat;
pub mod directory;
pub mod effects;
pub mod errors;
pub mod modifiers;
pub mod permissions;
pub mod pipeline;
pub mod protocol;
pub mod save_queue;
pub mod shard;
pub mod snapshot;
pub mod space;
pub mod storage;
pub mod types;

pub use action::{apply_action, Action, ActionKind, ActionMessage, ActionProblem, ActionTarget, ModuleAction};
pub use assets::{AssetCatalog, AssetDefinition, ModuleKind};
pub use character::{Character, CharacterBundle, CharacterLimits, CharacterRegistry};
pub use chat::{ChatEvent, ChatKind, OutgoingChat};
pub use directory::{DirectoryUpdate, ReconcilePlan, ShardRegistration};
pub use effects::{EffectBundle, EffectContribution, IntensityEffect};
pub use errors::EngineError;
pub use modifiers::{ModifierChain, ModifierInstance, ModifierPatch, NewModifier};
pub use permissions::{PermissionKey, PermissionRegistry, Policy, PolicyChange};
pub use pipeline::{ActionAttempt, ActionPipeline, ActionRequest, Outcome};
pub use protocol::{ClientRequest, ServerMessage, ServerResponse};
pub use save_queue::{SaveKey, SaveScheduler};
pub use shard::{now_ms, Shard, ShardSettings};
pub use snapshot::{DeltaBundle, FullBundle, GlobalState};
pub use space::{SpaceBundle, SpaceSettings, SpaceSynchronizer};
pub use storage::{ShardStore, ShardStoreBuilder};
pub use types::*;
