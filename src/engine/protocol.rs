//! Client/server message types.
//!
//! Requests and pushed messages use an internal `type` tag; responses are wrapped per
//! request family so a client can match on the outer variant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::action::ActionProblem;
use crate::engine::chat::{ChatEvent, OutgoingChat};
use crate::engine::effects::EffectBundle;
use crate::engine::modifiers::{ModifierInstance, ModifierPatch, NewModifier};
use crate::engine::permissions::{PermissionKey, PermissionView, Policy, PolicyChange};
use crate::engine::pipeline::{ActionAttempt, ActionRequest};
use crate::engine::snapshot::{DeltaBundle, FullBundle};
use crate::engine::types::{CharacterId, ModifierId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    GameLogicAction {
        request: ActionRequest,
    },
    /// Ask `target` up front for permissions an upcoming action needs.
    RequestPermission {
        target: CharacterId,
        permissions: Vec<PermissionKey>,
    },
    /// Resolve what `target` allows the requester for `key`.
    PermissionCheck {
        target: CharacterId,
        key: PermissionKey,
    },
    PermissionGet {
        key: PermissionKey,
    },
    PermissionSet {
        key: PermissionKey,
        change: PolicyChange,
    },
    PermissionPromptAnswer {
        requester: CharacterId,
        permissions: Vec<PermissionKey>,
        accept: bool,
    },
    CharacterModifierAdd {
        target: CharacterId,
        modifier: NewModifier,
    },
    CharacterModifierReorder {
        target: CharacterId,
        modifier: ModifierId,
        shift: i32,
    },
    CharacterModifierDelete {
        target: CharacterId,
        modifier: ModifierId,
    },
    CharacterModifierConfigure {
        target: CharacterId,
        modifier: ModifierId,
        patch: ModifierPatch,
    },
    CharacterModifierLock {
        target: CharacterId,
        modifier: ModifierId,
        locked: bool,
    },
    CharacterModifierGet {
        target: CharacterId,
    },
    Chat {
        messages: Vec<OutgoingChat>,
    },
    /// Client reports the last revision it applied.
    Resync {
        revision: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GameLogicResponse {
    Success { revision: u64 },
    Failure { problems: Vec<ActionProblem> },
    AttemptStarted { attempt: ActionAttempt },
    Aborted,
    PromptSent,
    PromptFailedCharacterOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PermissionResponse {
    Policy { policy: Policy },
    View { view: PermissionView },
    Updated { changed: bool },
    CharacterNotFound,
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ModifierResponse {
    Ok,
    Created { id: ModifierId },
    Modifiers { modifiers: Vec<ModifierInstance> },
    CharacterNotFound,
    /// Permission problems; `can_prompt` is set when asking the target could help
    Failure {
        problems: Vec<ActionProblem>,
        can_prompt: bool,
    },
    InvalidConfiguration { reason: String },
    TooManyModifiers { limit: usize },
    /// Locks, unknown ids and bad shifts
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChatResponse {
    Sent { count: usize },
    Blocked { modifier: String, reason: String },
    TooLong { max: usize },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResyncResponse {
    UpToDate { revision: u64 },
    /// A full `Load` message was queued on the connection
    Reloaded { revision: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerResponse {
    GameLogic(GameLogicResponse),
    Permission(PermissionResponse),
    Modifier(ModifierResponse),
    Chat(ChatResponse),
    Resync(ResyncResponse),
    /// The character is not held by this shard.
    UnknownCharacter,
}

/// Messages pushed to a connected character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Load {
        revision: u64,
        full: FullBundle,
        effects: BTreeMap<CharacterId, EffectBundle>,
    },
    Update {
        revision: u64,
        delta: DeltaBundle,
        /// Changed effects only; `None` means back to neutral
        effects: BTreeMap<CharacterId, Option<EffectBundle>>,
    },
    Chat {
        messages: Vec<ChatEvent>,
    },
    PermissionPrompt {
        requester: CharacterId,
        requester_name: String,
        permissions: Vec<PermissionKey>,
    },
    PermissionPromptDeclined {
        target: CharacterId,
        permissions: Vec<PermissionKey>,
    },
    PermissionsChanged {
        character: CharacterId,
    },
    AttemptInterrupted {
        by: CharacterId,
    },
    /// Text forwarded by the directory
    Notice {
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::action::Action;
    use crate::engine::types::{PoseChange, Stance};

    #[test]
    fn game_logic_request_reads_json() {
        let raw = r#"{
            "type": "game_logic_action",
            "request": {
                "operation": "start",
                "action": {"type": "pose", "target": "c1", "change": {"stance": "kneeling"}}
            }
        }"#;
        let parsed: ClientRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            ClientRequest::GameLogicAction {
                request: ActionRequest::Start(Action::Pose {
                    target: "c1".into(),
                    change: PoseChange {
                        stance: Some(Stance::Kneeling),
                        arms: None,
                    },
                }),
            }
        );

        let complete: ClientRequest =
            serde_json::from_str(r#"{"type":"game_logic_action","request":{"operation":"complete"}}"#).unwrap();
        assert_eq!(
            complete,
            ClientRequest::GameLogicAction {
                request: ActionRequest::Complete
            }
        );
    }

    #[test]
    fn responses_carry_structured_problems() {
        let response = ServerResponse::GameLogic(GameLogicResponse::Failure {
            problems: vec![ActionProblem::TooSoon { remaining_ms: 100 }],
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["game_logic"]["result"], "failure");
        assert_eq!(json["game_logic"]["problems"][0]["problem"], "too_soon");
        assert_eq!(json["game_logic"]["problems"][0]["remaining_ms"], 100);
    }

    #[test]
    fn permission_keys_travel_as_strings() {
        let msg = ServerMessage::PermissionPrompt {
            requester: "a".into(),
            requester_name: "Alice".into(),
            permissions: vec![PermissionKey::use_lock_slot_module()],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "permission_prompt");
        assert_eq!(json["permissions"][0], "interaction/useLockSlotModule");
    }
}
