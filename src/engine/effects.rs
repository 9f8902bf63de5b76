//! Character effect bundles and their clamped-additive combination.
//!
//! Every contributing source (an enabled modifier or an equipped item) adds at most
//! [`EFFECT_INTENSITY_CAP`] to an intensity effect. The summed value is then clamped by
//! the lowest *maximum intensity* any active modifier configured for that effect, so
//! stacking sources can never push an effect past a configured ceiling.

use serde::{Deserialize, Serialize};

/// Highest intensity any single source may contribute, and the global ceiling.
pub const EFFECT_INTENSITY_CAP: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityEffect {
    Blind,
    Deaf,
    SpeechMuffle,
}

impl IntensityEffect {
    fn index(self) -> usize {
        match self {
            IntensityEffect::Blind => 0,
            IntensityEffect::Deaf => 1,
            IntensityEffect::SpeechMuffle => 2,
        }
    }
}

/// Effect block declared by an asset definition for worn items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectContribution {
    #[serde(default)]
    pub blind: u8,
    #[serde(default)]
    pub deaf: u8,
    #[serde(default)]
    pub speech_muffle: u8,
    #[serde(default)]
    pub block_hands: bool,
    #[serde(default)]
    pub block_room_movement: bool,
}

/// Aggregated effects currently applying to one character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectBundle {
    pub blind: u8,
    pub deaf: u8,
    pub speech_muffle: u8,
    pub block_hands: bool,
    pub block_room_movement: bool,
}

impl EffectBundle {
    pub fn intensity(&self, effect: IntensityEffect) -> u8 {
        match effect {
            IntensityEffect::Blind => self.blind,
            IntensityEffect::Deaf => self.deaf,
            IntensityEffect::SpeechMuffle => self.speech_muffle,
        }
    }

    pub fn is_neutral(&self) -> bool {
        *self == EffectBundle::default()
    }
}

/// Fold state used while collecting contributions.
#[derive(Debug, Clone)]
pub struct EffectAccumulator {
    sums: [u16; 3],
    maxima: [u8; 3],
    block_hands: bool,
    block_room_movement: bool,
}

impl Default for EffectAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectAccumulator {
    pub fn new() -> Self {
        Self {
            sums: [0; 3],
            maxima: [EFFECT_INTENSITY_CAP; 3],
            block_hands: false,
            block_room_movement: false,
        }
    }

    /// Add one source's intensity, clamped to the per-source cap.
    pub fn add_intensity(&mut self, effect: IntensityEffect, intensity: u8) {
        let slot = &mut self.sums[effect.index()];
        *slot = slot.saturating_add(intensity.min(EFFECT_INTENSITY_CAP) as u16);
    }

    /// Lower the ceiling for an effect. The lowest configured maximum wins.
    pub fn limit(&mut self, effect: IntensityEffect, maximum: u8) {
        let slot = &mut self.maxima[effect.index()];
        *slot = (*slot).min(maximum);
    }

    pub fn block_hands(&mut self) {
        self.block_hands = true;
    }

    pub fn block_room_movement(&mut self) {
        self.block_room_movement = true;
    }

    pub fn add_contribution(&mut self, contribution: &EffectContribution) {
        self.add_intensity(IntensityEffect::Blind, contribution.blind);
        self.add_intensity(IntensityEffect::Deaf, contribution.deaf);
        self.add_intensity(IntensityEffect::SpeechMuffle, contribution.speech_muffle);
        self.block_hands |= contribution.block_hands;
        self.block_room_movement |= contribution.block_room_movement;
    }

    pub fn finish(self) -> EffectBundle {
        let clamp = |effect: IntensityEffect| -> u8 {
            let i = effect.index();
            self.sums[i].min(self.maxima[i] as u16) as u8
        };
        EffectBundle {
            blind: clamp(IntensityEffect::Blind),
            deaf: clamp(IntensityEffect::Deaf),
            speech_muffle: clamp(IntensityEffect::SpeechMuffle),
            block_hands: self.block_hands,
            block_room_movement: self.block_room_movement,
        }
    }
}
