//! Activation conditions for character modifiers
//!
//! A modifier is active only while its condition chain holds. The chain is a flat list
//! of links, each joined to the previous one with AND or OR; AND binds tighter than OR,
//! so `a OR b AND c` reads as `a OR (b AND c)`. The logic of the first link is ignored.

use serde::{Deserialize, Serialize};

use crate::engine::snapshot::GlobalState;
use crate::engine::types::{AccountId, AssetId, CharacterId, SpaceId, SpaceRole};

/// Maximum number of links in one chain
pub const MAX_CONDITIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierCondition {
    /// Owner is in the given space
    InSpace { space: SpaceId },
    /// Owner wears (possibly nested) an item of the asset
    HasItemOfAsset { asset: AssetId },
    /// Another character is present in the owner's space
    CharacterPresent { character: CharacterId },
    /// Owner's account holds at least this role in the current space
    HasSpaceRole { role: SpaceRole },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionLink {
    #[serde(default)]
    pub logic: ConditionLogic,
    #[serde(default)]
    pub invert: bool,
    pub condition: ModifierCondition,
}

impl ConditionLink {
    pub fn new(logic: ConditionLogic, condition: ModifierCondition) -> Self {
        Self {
            logic,
            invert: false,
            condition,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

/// Evaluation input: the snapshot and the chain owner.
pub struct ConditionContext<'a> {
    pub snapshot: &'a GlobalState,
    pub owner: &'a CharacterId,
    pub account: &'a AccountId,
}

impl<'a> ConditionContext<'a> {
    fn evaluate(&self, condition: &ModifierCondition) -> bool {
        match condition {
            ModifierCondition::InSpace { space } => self.snapshot.space_id() == space,
            ModifierCondition::HasItemOfAsset { asset } => self
                .snapshot
                .character(self.owner)
                .map(|state| state.wears_asset(asset))
                .unwrap_or(false),
            ModifierCondition::CharacterPresent { character } => {
                character != self.owner && self.snapshot.space().characters.contains(character)
            }
            ModifierCondition::HasSpaceRole { role } => {
                self.snapshot.space().config.role_of(self.account) >= *role
            }
        }
    }

    fn evaluate_link(&self, link: &ConditionLink) -> bool {
        self.evaluate(&link.condition) != link.invert
    }
}

/// Evaluate a condition chain. An empty chain always holds.
pub fn evaluate_chain(links: &[ConditionLink], ctx: &ConditionContext<'_>) -> bool {
    if links.is_empty() {
        return true;
    }
    let mut any_group = false;
    let mut group = true;
    for (index, link) in links.iter().enumerate() {
        if index > 0 && link.logic == ConditionLogic::Or {
            any_group |= group;
            group = true;
        }
        // Short-circuit inside an AND group once it is false
        if group {
            group = ctx.evaluate_link(link);
        }
    }
    any_group || group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::assets::{AssetCatalog, AssetDefinition};
    use crate::engine::types::{CharacterState, Item, SpaceConfig, SpaceState};
    use std::sync::Arc;

    fn snapshot() -> GlobalState {
        let assets = Arc::new(AssetCatalog::new(vec![
            AssetDefinition::new("a/collar", "Collar").wearable()
        ]));
        let config = SpaceConfig::named("Lounge").with_admin("acct".into());
        GlobalState::new(assets, SpaceState::new("s1".into(), config))
            .join(
                CharacterState::new("me".into(), "s1".into())
                    .with_item(Item::new("collar".into(), "a/collar".into())),
            )
            .join(CharacterState::new("friend".into(), "s1".into()))
    }

    fn yes() -> ModifierCondition {
        ModifierCondition::InSpace { space: "s1".into() }
    }

    fn no() -> ModifierCondition {
        ModifierCondition::InSpace { space: "elsewhere".into() }
    }

    fn check(links: &[ConditionLink]) -> bool {
        let snapshot = snapshot();
        let owner = CharacterId::new("me");
        let account = AccountId::new("acct");
        evaluate_chain(
            links,
            &ConditionContext {
                snapshot: &snapshot,
                owner: &owner,
                account: &account,
            },
        )
    }

    #[test]
    fn empty_chain_holds() {
        assert!(check(&[]));
    }

    #[test]
    fn conditions_read_the_snapshot() {
        let and = ConditionLogic::And;
        assert!(check(&[ConditionLink::new(and, ModifierCondition::HasItemOfAsset {
            asset: "a/collar".into()
        })]));
        assert!(check(&[ConditionLink::new(and, ModifierCondition::CharacterPresent {
            character: "friend".into()
        })]));
        assert!(!check(&[ConditionLink::new(and, ModifierCondition::CharacterPresent {
            character: "me".into()
        })]));
        assert!(check(&[ConditionLink::new(and, ModifierCondition::HasSpaceRole {
            role: SpaceRole::Admin
        })]));
        assert!(!check(&[ConditionLink::new(and, ModifierCondition::HasSpaceRole {
            role: SpaceRole::Owner
        })]));
    }

    #[test]
    fn invert_flips_a_link() {
        assert!(check(&[ConditionLink::new(ConditionLogic::And, no()).inverted()]));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        use ConditionLogic::{And, Or};
        // yes OR (no AND no) => true
        assert!(check(&[
            ConditionLink::new(And, yes()),
            ConditionLink::new(Or, no()),
            ConditionLink::new(And, no()),
        ]));
        // yes OR (yes AND no) => true, left-to-right would give false
        assert!(check(&[
            ConditionLink::new(And, yes()),
            ConditionLink::new(Or, yes()),
            ConditionLink::new(And, no()),
        ]));
        assert!(!check(&[
            ConditionLink::new(And, no()),
            ConditionLink::new(Or, yes()),
            ConditionLink::new(And, no()),
        ]));
        // (yes AND no) OR yes => true
        assert!(check(&[
            ConditionLink::new(And, yes()),
            ConditionLink::new(And, no()),
            ConditionLink::new(Or, yes()),
        ]));
    }
}
