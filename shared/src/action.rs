//! Participant-submitted actions

use crate::state::{CardId, TargetRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerAction {
    CastSpell { card: CardId, ability: Option<u32> },
    SelectCard { card: CardId },
    ActivateAbility { card: CardId, ability: u32 },
    PassPriority,
    Target { source: CardId, target: TargetRef },
    PayCost { card: CardId },
    Concede,
}

/// Discriminant used to key validation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    CastSpell,
    SelectCard,
    ActivateAbility,
    PassPriority,
    Target,
    PayCost,
    Concede,
}

impl PlayerAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            PlayerAction::CastSpell { .. } => ActionKind::CastSpell,
            PlayerAction::SelectCard { .. } => ActionKind::SelectCard,
            PlayerAction::ActivateAbility { .. } => ActionKind::ActivateAbility,
            PlayerAction::PassPriority => ActionKind::PassPriority,
            PlayerAction::Target { .. } => ActionKind::Target,
            PlayerAction::PayCost { .. } => ActionKind::PayCost,
            PlayerAction::Concede => ActionKind::Concede,
        }
    }

    /// Cards this action mentions, in the order they appear.
    pub fn referenced_cards(&self) -> Vec<CardId> {
        match self {
            PlayerAction::CastSpell { card, .. }
            | PlayerAction::SelectCard { card }
            | PlayerAction::ActivateAbility { card, .. }
            | PlayerAction::PayCost { card } => vec![*card],
            PlayerAction::Target { source, target } => match target {
                TargetRef::Card(target) => vec![*source, *target],
                TargetRef::Player(_) => vec![*source],
            },
            PlayerAction::PassPriority | PlayerAction::Concede => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind() {
        assert_eq!(
            PlayerAction::CastSpell { card: 1, ability: None }.kind(),
            ActionKind::CastSpell
        );
        assert_eq!(PlayerAction::PassPriority.kind(), ActionKind::PassPriority);
    }

    #[test]
    fn test_referenced_cards_for_targets() {
        let card_target = PlayerAction::Target {
            source: 3,
            target: TargetRef::Card(7),
        };
        assert_eq!(card_target.referenced_cards(), vec![3, 7]);

        let player_target = PlayerAction::Target {
            source: 3,
            target: TargetRef::Player(1),
        };
        assert_eq!(player_target.referenced_cards(), vec![3]);
        assert!(PlayerAction::Concede.referenced_cards().is_empty());
    }
}
