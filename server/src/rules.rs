//! Boundary to the rules engine
//!
//! The rules engine applies already-authorized actions to the state. The
//! [`BasicRules`] engine implements a small slice of priority and stack
//! handling: enough to drive the server binary and the tests.

use log::{debug, info};
use shared::state::{AbilityKind, CardId, GameState, PlayerIndex, TargetRef, ZoneType};
use shared::{ActionKind, PlayerAction};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    #[error("card {0} does not exist")]
    UnknownCard(CardId),
    #[error("player {0} does not exist")]
    UnknownPlayer(PlayerIndex),
    #[error("card {0} is not on the stack")]
    NotOnStack(CardId),
    #[error("action {0:?} is not supported")]
    Unsupported(ActionKind),
}

pub trait RulesEngine: Send + Sync {
    fn apply(
        &self,
        state: &mut GameState,
        actor: PlayerIndex,
        action: &PlayerAction,
    ) -> Result<(), RulesError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRules;

impl BasicRules {
    /// Resolves the top of the stack once priority has gone around to its
    /// controller without anyone responding.
    fn resolve_if_uncontested(state: &mut GameState) {
        let Some(top) = state.stack.last() else {
            return;
        };
        if state.priority_player() != Some(top.controller) {
            return;
        }

        let Some(entry) = state.stack.pop() else {
            return;
        };
        let on_stack = state
            .card(entry.source)
            .map(|card| card.zone == ZoneType::Stack)
            .unwrap_or(false);
        if on_stack {
            state.move_card(entry.source, ZoneType::Battlefield);
        }
        debug!("Resolved stack entry {} from card {}", entry.id, entry.source);
    }
}

impl RulesEngine for BasicRules {
    fn apply(
        &self,
        state: &mut GameState,
        actor: PlayerIndex,
        action: &PlayerAction,
    ) -> Result<(), RulesError> {
        match action {
            PlayerAction::CastSpell { card, ability } => {
                if !state.move_card(*card, ZoneType::Stack) {
                    return Err(RulesError::UnknownCard(*card));
                }
                state.push_stack(*card, actor, *ability, Vec::new());
            }

            PlayerAction::ActivateAbility { card, ability } => {
                let kind = state
                    .card(*card)
                    .ok_or(RulesError::UnknownCard(*card))?
                    .ability(*ability)
                    .map(|found| found.kind);
                if let Some(card) = state.cards.get_mut(card) {
                    card.tapped = true;
                }
                if kind == Some(AbilityKind::Mana) {
                    let player = state
                        .players
                        .get_mut(actor)
                        .ok_or(RulesError::UnknownPlayer(actor))?;
                    player.mana_pool.colorless += 1;
                } else {
                    state.push_stack(*card, actor, Some(*ability), Vec::new());
                }
            }

            PlayerAction::PassPriority => {
                state.pass_priority();
                Self::resolve_if_uncontested(state);
            }

            PlayerAction::Target { source, target } => {
                let entry = state
                    .stack
                    .iter_mut()
                    .rev()
                    .find(|entry| entry.source == *source)
                    .ok_or(RulesError::NotOnStack(*source))?;
                entry.targets.push(*target);
                if let TargetRef::Card(target) = target {
                    debug!("Card {} now targets card {}", source, target);
                }
            }

            PlayerAction::PayCost { card } => {
                state
                    .cards
                    .get_mut(card)
                    .ok_or(RulesError::UnknownCard(*card))?
                    .tapped = true;
            }

            PlayerAction::SelectCard { .. } => {}

            PlayerAction::Concede => {
                state
                    .players
                    .get_mut(actor)
                    .ok_or(RulesError::UnknownPlayer(actor))?
                    .lost = true;
                info!("Player {} conceded", actor);

                let remaining = state.players().iter().filter(|p| !p.lost).count();
                if remaining <= 1 {
                    state.game_over = true;
                    info!("Game over");
                } else if state.priority_player() == Some(actor) {
                    state.pass_priority();
                }
            }
        }
        Ok(())
    }
}
