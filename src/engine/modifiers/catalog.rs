//! Closed catalogue of character modifier types.
//!
//! Each type has a static table entry (display name, permission setup) and its
//! behaviour is an exhaustive `match` over [`ModifierType`] in the hook functions
//! below, so adding a type fails to compile until every hook handles it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::engine::action::{Action, ActionKind};
use crate::engine::chat::ChatKind;
use crate::engine::effects::{EffectAccumulator, IntensityEffect, EFFECT_INTENSITY_CAP};
use crate::engine::modifiers::ModifierError;
use crate::engine::permissions::{PermissionSetup, Policy};
use crate::engine::types::CharacterId;

/// Longest delay a `slow_actions` modifier may impose.
pub const MAX_SLOW_DELAY_MS: u64 = 120_000;
const MAX_WORDS: usize = 50;
const MAX_WORD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierType {
    EffectBlind,
    EffectDeaf,
    EffectSpeechMuffle,
    BlockHands,
    BlockRoomMovement,
    SpeechBanWords,
    SpeechSpecificSound,
    HearingCensorWords,
    SlowActions,
    PreventActionTypes,
}

#[derive(Debug, Clone, Copy)]
pub struct ModifierTypeInfo {
    pub kind: ModifierType,
    pub id: &'static str,
    pub name: &'static str,
    pub permission: PermissionSetup,
}

const fn setup(label: &'static str, forbid_default_allow_others: bool) -> PermissionSetup {
    PermissionSetup {
        label,
        default_policy: Policy::Prompt,
        forbid_default_allow_others,
    }
}

/// Indexed by `ModifierType as usize`.
pub static MODIFIER_TYPES: [ModifierTypeInfo; 10] = [
    ModifierTypeInfo {
        kind: ModifierType::EffectBlind,
        id: "effect_blind",
        name: "Blindness",
        permission: setup("Add or change blindness modifiers", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::EffectDeaf,
        id: "effect_deaf",
        name: "Deafness",
        permission: setup("Add or change deafness modifiers", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::EffectSpeechMuffle,
        id: "effect_speech_muffle",
        name: "Muffled speech",
        permission: setup("Add or change speech muffling modifiers", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::BlockHands,
        id: "block_hands",
        name: "Blocked hands",
        permission: setup("Add or change hand blocking modifiers", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::BlockRoomMovement,
        id: "block_room_movement",
        name: "Rooted in place",
        permission: setup("Add or change room movement blocking modifiers", true),
    },
    ModifierTypeInfo {
        kind: ModifierType::SpeechBanWords,
        id: "speech_ban_words",
        name: "Forbidden words",
        permission: setup("Add or change forbidden word lists", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::SpeechSpecificSound,
        id: "speech_specific_sound",
        name: "Only one sound",
        permission: setup("Add or change speech sound replacement", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::HearingCensorWords,
        id: "hearing_censor_words",
        name: "Censored hearing",
        permission: setup("Add or change hearing censorship", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::SlowActions,
        id: "slow_actions",
        name: "Slowed actions",
        permission: setup("Add or change action slowdowns", false),
    },
    ModifierTypeInfo {
        kind: ModifierType::PreventActionTypes,
        id: "prevent_action_types",
        name: "Prevented actions",
        permission: setup("Add or change prevented action lists", false),
    },
];

impl ModifierType {
    pub fn info(self) -> &'static ModifierTypeInfo {
        &MODIFIER_TYPES[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.info().id
    }

    pub fn parse(id: &str) -> Option<ModifierType> {
        MODIFIER_TYPES
            .iter()
            .find(|info| info.id == id)
            .map(|info| info.kind)
    }

    pub fn all() -> impl Iterator<Item = ModifierType> {
        MODIFIER_TYPES.iter().map(|info| info.kind)
    }

    pub fn default_config(self) -> ModifierConfig {
        match self {
            ModifierType::EffectBlind
            | ModifierType::EffectDeaf
            | ModifierType::EffectSpeechMuffle => ModifierConfig::Intensity {
                intensity: 5,
                max_intensity: EFFECT_INTENSITY_CAP,
            },
            ModifierType::BlockHands | ModifierType::BlockRoomMovement => ModifierConfig::Flag,
            ModifierType::SpeechBanWords | ModifierType::HearingCensorWords => {
                ModifierConfig::Words { words: Vec::new() }
            }
            ModifierType::SpeechSpecificSound => ModifierConfig::Sound {
                sound: "mmph".to_string(),
            },
            ModifierType::SlowActions => ModifierConfig::Delay { delay_ms: 5_000 },
            ModifierType::PreventActionTypes => ModifierConfig::ActionKinds {
                kinds: BTreeSet::new(),
            },
        }
    }

    fn intensity_effect(self) -> Option<IntensityEffect> {
        match self {
            ModifierType::EffectBlind => Some(IntensityEffect::Blind),
            ModifierType::EffectDeaf => Some(IntensityEffect::Deaf),
            ModifierType::EffectSpeechMuffle => Some(IntensityEffect::SpeechMuffle),
            _ => None,
        }
    }

    /// Reject configs of the wrong shape or outside their bounds.
    pub fn validate_config(self, config: &ModifierConfig) -> Result<(), ModifierError> {
        let invalid = |reason: String| Err(ModifierError::InvalidConfiguration(reason));
        match (self, config) {
            (
                ModifierType::EffectBlind | ModifierType::EffectDeaf | ModifierType::EffectSpeechMuffle,
                ModifierConfig::Intensity {
                    intensity,
                    max_intensity,
                },
            ) => {
                if *intensity > EFFECT_INTENSITY_CAP || *max_intensity > EFFECT_INTENSITY_CAP {
                    return invalid(format!("intensity must be at most {}", EFFECT_INTENSITY_CAP));
                }
                Ok(())
            }
            (ModifierType::BlockHands | ModifierType::BlockRoomMovement, ModifierConfig::Flag) => Ok(()),
            (
                ModifierType::SpeechBanWords | ModifierType::HearingCensorWords,
                ModifierConfig::Words { words },
            ) => {
                if words.len() > MAX_WORDS {
                    return invalid(format!("at most {} words allowed", MAX_WORDS));
                }
                for word in words {
                    if word.is_empty()
                        || word.chars().count() > MAX_WORD_LEN
                        || word.chars().any(|c| !is_word_char(c))
                    {
                        return invalid(format!("'{}' is not a single word", word));
                    }
                }
                Ok(())
            }
            (ModifierType::SpeechSpecificSound, ModifierConfig::Sound { sound }) => {
                if sound.is_empty()
                    || sound.chars().count() > MAX_WORD_LEN
                    || sound.chars().any(|c| !is_word_char(c))
                {
                    return invalid("sound must be a single word".to_string());
                }
                Ok(())
            }
            (ModifierType::SlowActions, ModifierConfig::Delay { delay_ms }) => {
                if *delay_ms > MAX_SLOW_DELAY_MS {
                    return invalid(format!("delay must be at most {} ms", MAX_SLOW_DELAY_MS));
                }
                Ok(())
            }
            (ModifierType::PreventActionTypes, ModifierConfig::ActionKinds { .. }) => Ok(()),
            (kind, _) => invalid(format!("wrong configuration shape for {}", kind.as_str())),
        }
    }
}

/// Per-type configuration. Shapes are checked against the type by
/// [`ModifierType::validate_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierConfig {
    Intensity { intensity: u8, max_intensity: u8 },
    Flag,
    Words { words: Vec<String> },
    Sound { sound: String },
    Delay { delay_ms: u64 },
    ActionKinds { kinds: BTreeSet<ActionKind> },
}

/// Which side of an action the chain owner is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
    Actor,
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResponse {
    Allow,
    Block { reason: String },
    Slow { delay_ms: u64 },
}

pub(crate) fn contribute_effects(kind: ModifierType, config: &ModifierConfig, acc: &mut EffectAccumulator) {
    match kind {
        ModifierType::EffectBlind | ModifierType::EffectDeaf | ModifierType::EffectSpeechMuffle => {
            if let (
                Some(effect),
                ModifierConfig::Intensity {
                    intensity,
                    max_intensity,
                },
            ) = (kind.intensity_effect(), config)
            {
                acc.add_intensity(effect, *intensity);
                acc.limit(effect, *max_intensity);
            }
        }
        ModifierType::BlockHands => acc.block_hands(),
        ModifierType::BlockRoomMovement => acc.block_room_movement(),
        ModifierType::SpeechBanWords
        | ModifierType::SpeechSpecificSound
        | ModifierType::HearingCensorWords
        | ModifierType::SlowActions
        | ModifierType::PreventActionTypes => {}
    }
}

pub(crate) fn check_action(
    kind: ModifierType,
    config: &ModifierConfig,
    owner: &CharacterId,
    action: &Action,
    role: ChainRole,
) -> ActionResponse {
    match kind {
        ModifierType::BlockHands => {
            if role == ChainRole::Actor && action.uses_hands() {
                return ActionResponse::Block {
                    reason: "hands are blocked".to_string(),
                };
            }
            ActionResponse::Allow
        }
        ModifierType::BlockRoomMovement => match action {
            Action::MoveCharacter { target, .. } if target == owner => ActionResponse::Block {
                reason: "cannot move around the room".to_string(),
            },
            _ => ActionResponse::Allow,
        },
        ModifierType::SlowActions => match config {
            ModifierConfig::Delay { delay_ms }
                if role == ChainRole::Actor
                    && *delay_ms > 0
                    && action.kind() != ActionKind::InterruptAttempt =>
            {
                ActionResponse::Slow {
                    delay_ms: *delay_ms,
                }
            }
            _ => ActionResponse::Allow,
        },
        ModifierType::PreventActionTypes => match config {
            ModifierConfig::ActionKinds { kinds }
                if role == ChainRole::Actor && kinds.contains(&action.kind()) =>
            {
                ActionResponse::Block {
                    reason: "this kind of action is prevented".to_string(),
                }
            }
            _ => ActionResponse::Allow,
        },
        ModifierType::EffectBlind
        | ModifierType::EffectDeaf
        | ModifierType::EffectSpeechMuffle
        | ModifierType::SpeechBanWords
        | ModifierType::SpeechSpecificSound
        | ModifierType::HearingCensorWords => ActionResponse::Allow,
    }
}

/// Returns the block reason when the message may not be sent.
pub(crate) fn check_chat(kind: ModifierType, config: &ModifierConfig, chat: ChatKind, text: &str) -> Option<String> {
    match kind {
        ModifierType::SpeechBanWords => {
            let ModifierConfig::Words { words } = config else {
                return None;
            };
            if !chat.is_speech() {
                return None;
            }
            word_spans(text)
                .map(|(start, end)| &text[start..end])
                .find(|word| {
                    let word = word.to_lowercase();
                    words.iter().any(|banned| banned.to_lowercase() == word)
                })
                .map(|word| format!("the word '{}' is forbidden", word))
        }
        ModifierType::EffectBlind
        | ModifierType::EffectDeaf
        | ModifierType::EffectSpeechMuffle
        | ModifierType::BlockHands
        | ModifierType::BlockRoomMovement
        | ModifierType::SpeechSpecificSound
        | ModifierType::HearingCensorWords
        | ModifierType::SlowActions
        | ModifierType::PreventActionTypes => None,
    }
}

/// Rewrite outgoing speech before muffling is applied.
pub(crate) fn transform_outgoing(kind: ModifierType, config: &ModifierConfig, chat: ChatKind, text: &str) -> String {
    match kind {
        ModifierType::SpeechSpecificSound => match config {
            ModifierConfig::Sound { sound } if chat.is_speech() => replace_words(text, |word| {
                let capitalized = word.chars().next().map(char::is_uppercase).unwrap_or(false);
                if capitalized {
                    let mut chars = sound.chars();
                    chars
                        .next()
                        .map(|first| first.to_uppercase().chain(chars).collect::<String>())
                        .unwrap_or_default()
                } else {
                    sound.to_lowercase()
                }
            }),
            _ => text.to_string(),
        },
        ModifierType::EffectBlind
        | ModifierType::EffectDeaf
        | ModifierType::EffectSpeechMuffle
        | ModifierType::BlockHands
        | ModifierType::BlockRoomMovement
        | ModifierType::SpeechBanWords
        | ModifierType::HearingCensorWords
        | ModifierType::SlowActions
        | ModifierType::PreventActionTypes => text.to_string(),
    }
}

/// Rewrite incoming speech before hearing filters are applied.
pub(crate) fn transform_incoming(kind: ModifierType, config: &ModifierConfig, chat: ChatKind, text: &str) -> String {
    match kind {
        ModifierType::HearingCensorWords => match config {
            ModifierConfig::Words { words } if chat.is_speech() => replace_words(text, |word| {
                if words.iter().any(|censored| censored.to_lowercase() == word.to_lowercase()) {
                    "*".repeat(word.chars().count())
                } else {
                    word.to_string()
                }
            }),
            _ => text.to_string(),
        },
        ModifierType::EffectBlind
        | ModifierType::EffectDeaf
        | ModifierType::EffectSpeechMuffle
        | ModifierType::BlockHands
        | ModifierType::BlockRoomMovement
        | ModifierType::SpeechBanWords
        | ModifierType::SpeechSpecificSound
        | ModifierType::SlowActions
        | ModifierType::PreventActionTypes => text.to_string(),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\''
}

/// Byte ranges of the words in `text`.
fn word_spans(text: &str) -> impl Iterator<Item = (usize, usize)> + '_ {
    let mut chars = text.char_indices().peekable();
    std::iter::from_fn(move || {
        while let Some(&(_, c)) = chars.peek() {
            if is_word_char(c) {
                break;
            }
            chars.next();
        }
        let (start, _) = *chars.peek()?;
        let mut end = start;
        while let Some(&(index, c)) = chars.peek() {
            if !is_word_char(c) {
                break;
            }
            end = index + c.len_utf8();
            chars.next();
        }
        Some((start, end))
    })
}

fn replace_words(text: &str, mut replace: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end) in word_spans(text) {
        out.push_str(&text[last..start]);
        out.push_str(&replace(&text[start..end]));
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ban(words: &[&str]) -> ModifierConfig {
        ModifierConfig::Words {
            words: words.iter().map(|w| w.to_string()).collect(),
        }
    }

    #[test]
    fn table_is_indexed_by_discriminant() {
        for (index, info) in MODIFIER_TYPES.iter().enumerate() {
            assert_eq!(info.kind as usize, index);
            assert_eq!(ModifierType::parse(info.id), Some(info.kind));
        }
        assert_eq!(ModifierType::all().count(), 10);
    }

    #[test]
    fn only_room_movement_is_extreme() {
        let extreme: Vec<_> = ModifierType::all()
            .filter(|kind| kind.info().permission.forbid_default_allow_others)
            .collect();
        assert_eq!(extreme, vec![ModifierType::BlockRoomMovement]);
    }

    #[test]
    fn ban_words_match_whole_words_case_insensitively() {
        let config = ban(&["no"]);
        assert!(check_chat(ModifierType::SpeechBanWords, &config, ChatKind::Say, "NO!").is_some());
        assert!(check_chat(ModifierType::SpeechBanWords, &config, ChatKind::Say, "well, no way").is_some());
        assert!(check_chat(ModifierType::SpeechBanWords, &config, ChatKind::Say, "nonetheless").is_none());
        assert!(check_chat(ModifierType::SpeechBanWords, &config, ChatKind::Ooc, "no").is_none());
    }

    #[test]
    fn specific_sound_replaces_every_word() {
        let config = ModifierConfig::Sound {
            sound: "meow".into(),
        };
        let out = transform_outgoing(ModifierType::SpeechSpecificSound, &config, ChatKind::Say, "Hello there, friend!");
        assert_eq!(out, "Meow meow, meow!");
    }

    #[test]
    fn censor_masks_words_on_receipt() {
        let out = transform_incoming(ModifierType::HearingCensorWords, &ban(&["secret"]), ChatKind::Say, "the Secret plan");
        assert_eq!(out, "the ****** plan");
    }

    #[test]
    fn config_validation_checks_shape_and_bounds() {
        assert!(ModifierType::EffectBlind
            .validate_config(&ModifierConfig::Intensity {
                intensity: 11,
                max_intensity: 10
            })
            .is_err());
        assert!(ModifierType::SlowActions.validate_config(&ModifierConfig::Flag).is_err());
        assert!(ModifierType::SpeechBanWords.validate_config(&ban(&["two words"])).is_err());
        for kind in ModifierType::all() {
            assert!(kind.validate_config(&kind.default_config()).is_ok(), "{:?}", kind);
        }
    }

    #[test]
    fn slow_and_prevent_apply_to_the_actor_only() {
        let owner: CharacterId = "a".into();
        let action = Action::InterruptAttempt { target: "b".into() };
        let pose = Action::Pose {
            target: "b".into(),
            change: Default::default(),
        };
        let slow = ModifierConfig::Delay { delay_ms: 500 };
        assert_eq!(
            check_action(ModifierType::SlowActions, &slow, &owner, &pose, ChainRole::Actor),
            ActionResponse::Slow { delay_ms: 500 }
        );
        assert_eq!(
            check_action(ModifierType::SlowActions, &slow, &owner, &pose, ChainRole::Target),
            ActionResponse::Allow
        );
        assert_eq!(
            check_action(ModifierType::SlowActions, &slow, &owner, &action, ChainRole::Actor),
            ActionResponse::Allow
        );
        let prevent = ModifierConfig::ActionKinds {
            kinds: [ActionKind::Pose].into_iter().collect(),
        };
        assert!(matches!(
            check_action(ModifierType::PreventActionTypes, &prevent, &owner, &pose, ChainRole::Actor),
            ActionResponse::Block { .. }
        ));
    }
}
