//! Chat events, speech/hearing muffling and per-space history.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::engine::action::ActionMessage;
use crate::engine::effects::EFFECT_INTENSITY_CAP;
use crate::engine::types::CharacterId;

/// Blindness at or above this intensity hides who did something.
pub const BLIND_HIDES_NAMES_AT: u8 = 5;
const HIDDEN_NAME: &str = "Someone";
const MUFFLE_SOUNDS: [char; 4] = ['m', 'h', 'n', 'f'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Say,
    Emote,
    Ooc,
    Whisper,
}

impl ChatKind {
    /// Spoken messages go through speech modifiers and muffling; OOC and emotes do not.
    pub fn is_speech(self) -> bool {
        matches!(self, ChatKind::Say | ChatKind::Whisper)
    }
}

/// Message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingChat {
    pub kind: ChatKind,
    pub text: String,
    /// Whisper recipient
    #[serde(default)]
    pub to: Option<CharacterId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message {
        id: u64,
        time: i64,
        from: CharacterId,
        from_name: String,
        kind: ChatKind,
        text: String,
        #[serde(default)]
        to: Option<CharacterId>,
    },
    Action {
        id: u64,
        time: i64,
        action: ActionMessage,
    },
    Presence {
        id: u64,
        time: i64,
        character: CharacterId,
        name: String,
        joined: bool,
    },
}

impl ChatEvent {
    pub fn id(&self) -> u64 {
        match self {
            ChatEvent::Message { id, .. } | ChatEvent::Action { id, .. } | ChatEvent::Presence { id, .. } => *id,
        }
    }

    pub fn time(&self) -> i64 {
        match self {
            ChatEvent::Message { time, .. }
            | ChatEvent::Action { time, .. }
            | ChatEvent::Presence { time, .. } => *time,
        }
    }

    /// Whether `character` should receive this event at all.
    pub fn is_visible_to(&self, character: &CharacterId) -> bool {
        match self {
            ChatEvent::Message {
                from,
                to: Some(to),
                ..
            } => from == character || to == character,
            _ => true,
        }
    }

    /// Copy of the event as seen by a receiver with the given blindness.
    pub fn as_seen_with_blindness(&self, blind: u8) -> ChatEvent {
        if blind < BLIND_HIDES_NAMES_AT {
            return self.clone();
        }
        match self {
            ChatEvent::Message {
                kind: ChatKind::Emote,
                ..
            } => {
                let mut hidden = self.clone();
                if let ChatEvent::Message { from_name, .. } = &mut hidden {
                    *from_name = HIDDEN_NAME.to_string();
                }
                hidden
            }
            _ => self.clone(),
        }
    }
}

fn replace_letters(text: &str, intensity: u8, seed: u64, mut replace: impl FnMut(&mut StdRng, char) -> char) -> String {
    let intensity = intensity.min(EFFECT_INTENSITY_CAP);
    if intensity == 0 {
        return text.to_string();
    }
    let probability = intensity as f64 / EFFECT_INTENSITY_CAP as f64;
    let mut rng = StdRng::seed_from_u64(seed);
    text.chars()
        .map(|c| {
            if c.is_alphabetic() && rng.gen_bool(probability) {
                replace(&mut rng, c)
            } else {
                c
            }
        })
        .collect()
}

/// Garble speech from a gagged speaker. Deterministic for a given seed.
pub fn muffle_speech(text: &str, intensity: u8, seed: u64) -> String {
    replace_letters(text, intensity, seed, |rng, c| {
        let sound = MUFFLE_SOUNDS[rng.gen_range(0..MUFFLE_SOUNDS.len())];
        if c.is_uppercase() {
            sound.to_ascii_uppercase()
        } else {
            sound
        }
    })
}

/// Drop letters a deafened listener fails to hear.
pub fn muffle_hearing(text: &str, intensity: u8, seed: u64) -> String {
    replace_letters(text, intensity, seed, |_, _| '.')
}

/// Bounded chat log of one space.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    entries: VecDeque<LoggedEvent>,
    max_messages: usize,
    max_age_ms: i64,
}

/// A logged event plus the sender settings needed to render it again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub event: ChatEvent,
    pub hide_name: bool,
}

impl ChatHistory {
    pub fn new(max_messages: usize, max_age_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            max_messages,
            max_age_ms,
        }
    }

    pub fn push(&mut self, event: ChatEvent) {
        self.push_from(event, false);
    }

    /// Log an event whose sender asked for their name to be hidden from blind viewers.
    pub fn push_from(&mut self, event: ChatEvent, hide_name: bool) {
        self.entries.push_back(LoggedEvent { event, hide_name });
        while self.entries.len() > self.max_messages {
            self.entries.pop_front();
        }
    }

    /// Drop entries older than the configured age. Returns how many were removed.
    pub fn gc(&mut self, now: i64) -> usize {
        let cutoff = now - self.max_age_ms;
        let before = self.entries.len();
        while self
            .entries
            .front()
            .map(|logged| logged.event.time() < cutoff)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    /// Most recent entries visible to `character`, oldest first.
    pub fn replay_for(&self, character: &CharacterId, limit: usize) -> Vec<LoggedEvent> {
        let mut out: Vec<LoggedEvent> = self
            .entries
            .iter()
            .rev()
            .filter(|logged| logged.event.is_visible_to(character))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Most recent events visible to `character`, oldest first, as originally sent.
    pub fn recent_for(&self, character: &CharacterId, limit: usize) -> Vec<ChatEvent> {
        self.replay_for(character, limit)
            .into_iter()
            .map(|logged| logged.event)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
