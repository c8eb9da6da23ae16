//! Authorization of participant actions
//!
//! Validation decides whether an actor is *entitled* to submit an action: they
//! are a live participant, hold priority when the action needs it, control the
//! cards they use, and can actually see every card they reference. Whether the
//! move is legal under the game rules is left to the rules engine.
//!
//! Rejections are ordinary values. They are logged on the `security` target so
//! they can be routed to an audit log.

use crate::visibility::SecurityFilter;
use log::{debug, info};
use shared::state::{AbilityKind, Card, CardId, GameState, PlayerIndex, TargetRef, ZoneType};
use shared::{ActionKind, PlayerAction, Viewer};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("viewer is not a participant")]
    NotParticipant,
    #[error("player {0} is not in this game")]
    UnknownActor(PlayerIndex),
    #[error("player {0} has already lost")]
    ActorLost(PlayerIndex),
    #[error("the game is over")]
    GameOver,
    #[error("player {0} does not hold priority")]
    NoPriority(PlayerIndex),
    #[error("card {0} is not visible to the actor")]
    CardNotVisible(CardId),
    #[error("card {0} is not controlled by the actor")]
    NotControlled(CardId),
    #[error("card {card} cannot be used from {zone:?}")]
    WrongZone { card: CardId, zone: ZoneType },
    #[error("card {0} has no spell ability")]
    NoSpellAbility(CardId),
    #[error("card {card} has no usable ability {ability}")]
    UnknownAbility { card: CardId, ability: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Authorized,
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_authorized(&self) -> bool {
        *self == ValidationOutcome::Authorized
    }
}

/// What a rule can look at while judging one action
pub struct RuleContext<'a> {
    pub state: &'a GameState,
    pub actor: PlayerIndex,
    pub filter: &'a SecurityFilter,
}

impl<'a> RuleContext<'a> {
    fn require_priority(&self) -> Result<(), RejectReason> {
        if self.state.priority_player() == Some(self.actor) {
            Ok(())
        } else {
            Err(RejectReason::NoPriority(self.actor))
        }
    }

    /// Looks a card up, treating cards the actor cannot see as absent.
    fn visible_card(&self, id: CardId) -> Result<&'a Card, RejectReason> {
        if !self
            .filter
            .can_see_card(self.state, Viewer::Player(self.actor), id)
        {
            return Err(RejectReason::CardNotVisible(id));
        }
        self.state.card(id).ok_or(RejectReason::CardNotVisible(id))
    }

    fn controlled_card(&self, id: CardId) -> Result<&'a Card, RejectReason> {
        let card = self.visible_card(id)?;
        if card.controller == self.actor {
            Ok(card)
        } else {
            Err(RejectReason::NotControlled(id))
        }
    }
}

pub trait ActionRule: Send + Sync {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason>;
}

/// Applied to kinds without a registered rule: priority plus visibility of
/// everything referenced.
pub struct DefaultRule;

impl ActionRule for DefaultRule {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason> {
        ctx.require_priority()?;
        for card in action.referenced_cards() {
            ctx.visible_card(card)?;
        }
        Ok(())
    }
}

struct CastSpellRule;

impl ActionRule for CastSpellRule {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason> {
        let PlayerAction::CastSpell { card, ability } = action else {
            return DefaultRule.check(ctx, action);
        };
        let source = ctx.controlled_card(*card)?;
        if source.zone != ZoneType::Hand {
            return Err(RejectReason::WrongZone {
                card: *card,
                zone: source.zone,
            });
        }
        ctx.require_priority()?;

        match ability {
            Some(id) => match source.ability(*id) {
                Some(found) if found.kind == AbilityKind::Spell => Ok(()),
                _ => Err(RejectReason::UnknownAbility {
                    card: *card,
                    ability: *id,
                }),
            },
            None if source.spell_abilities().next().is_some() => Ok(()),
            None => Err(RejectReason::NoSpellAbility(*card)),
        }
    }
}

struct SelectCardRule;

impl ActionRule for SelectCardRule {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason> {
        let PlayerAction::SelectCard { card } = action else {
            return DefaultRule.check(ctx, action);
        };
        ctx.visible_card(*card).map(|_| ())
    }
}

struct ActivateAbilityRule;

impl ActionRule for ActivateAbilityRule {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason> {
        let PlayerAction::ActivateAbility { card, ability } = action else {
            return DefaultRule.check(ctx, action);
        };
        let source = ctx.controlled_card(*card)?;
        if source.zone != ZoneType::Battlefield {
            return Err(RejectReason::WrongZone {
                card: *card,
                zone: source.zone,
            });
        }

        match source.ability(*ability).map(|found| found.kind) {
            // Mana abilities do not use the stack and need no priority.
            Some(AbilityKind::Mana) => Ok(()),
            Some(AbilityKind::Activated) => ctx.require_priority(),
            _ => Err(RejectReason::UnknownAbility {
                card: *card,
                ability: *ability,
            }),
        }
    }
}

struct PassPriorityRule;

impl ActionRule for PassPriorityRule {
    fn check(&self, ctx: &RuleContext<'_>, _action: &PlayerAction) -> Result<(), RejectReason> {
        ctx.require_priority()
    }
}

struct TargetRule;

impl ActionRule for TargetRule {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason> {
        let PlayerAction::Target { source, target } = action else {
            return DefaultRule.check(ctx, action);
        };
        ctx.controlled_card(*source)?;
        match target {
            TargetRef::Card(card) => ctx.visible_card(*card).map(|_| ()),
            TargetRef::Player(_) => Ok(()),
        }
    }
}

struct PayCostRule;

impl ActionRule for PayCostRule {
    fn check(&self, ctx: &RuleContext<'_>, action: &PlayerAction) -> Result<(), RejectReason> {
        let PlayerAction::PayCost { card } = action else {
            return DefaultRule.check(ctx, action);
        };
        let source = ctx.controlled_card(*card)?;
        if source.zone != ZoneType::Battlefield {
            return Err(RejectReason::WrongZone {
                card: *card,
                zone: source.zone,
            });
        }
        Ok(())
    }
}

struct ConcedeRule;

impl ActionRule for ConcedeRule {
    fn check(&self, _ctx: &RuleContext<'_>, _action: &PlayerAction) -> Result<(), RejectReason> {
        Ok(())
    }
}

pub struct ActionValidator {
    filter: Arc<SecurityFilter>,
    rules: HashMap<ActionKind, Box<dyn ActionRule>>,
    default_rule: Box<dyn ActionRule>,
}

impl ActionValidator {
    /// A validator with the standard rule for every action kind.
    pub fn new(filter: Arc<SecurityFilter>) -> Self {
        let mut validator = Self::empty(filter);
        validator.register(ActionKind::CastSpell, CastSpellRule);
        validator.register(ActionKind::SelectCard, SelectCardRule);
        validator.register(ActionKind::ActivateAbility, ActivateAbilityRule);
        validator.register(ActionKind::PassPriority, PassPriorityRule);
        validator.register(ActionKind::Target, TargetRule);
        validator.register(ActionKind::PayCost, PayCostRule);
        validator.register(ActionKind::Concede, ConcedeRule);
        validator
    }

    /// A validator where every kind falls through to [`DefaultRule`].
    pub fn empty(filter: Arc<SecurityFilter>) -> Self {
        Self {
            filter,
            rules: HashMap::new(),
            default_rule: Box::new(DefaultRule),
        }
    }

    pub fn register(&mut self, kind: ActionKind, rule: impl ActionRule + 'static) {
        self.rules.insert(kind, Box::new(rule));
    }

    pub fn filter(&self) -> &SecurityFilter {
        &self.filter
    }

    pub fn validate(
        &self,
        state: &GameState,
        viewer: Viewer,
        action: &PlayerAction,
    ) -> ValidationOutcome {
        let outcome = match self.check(state, viewer, action) {
            Ok(()) => ValidationOutcome::Authorized,
            Err(reason) => {
                info!(
                    target: "security",
                    "Rejected {:?} from {:?}: {}",
                    action.kind(),
                    viewer,
                    reason
                );
                ValidationOutcome::Rejected(reason)
            }
        };
        debug!("Validated {:?} from {:?}: {:?}", action, viewer, outcome);
        outcome
    }

    fn check(
        &self,
        state: &GameState,
        viewer: Viewer,
        action: &PlayerAction,
    ) -> Result<(), RejectReason> {
        let actor = viewer.player_index().ok_or(RejectReason::NotParticipant)?;
        let player = state.player(actor).ok_or(RejectReason::UnknownActor(actor))?;
        if player.lost {
            return Err(RejectReason::ActorLost(actor));
        }
        if state.is_game_over() {
            return Err(RejectReason::GameOver);
        }

        let ctx = RuleContext {
            state,
            actor,
            filter: &self.filter,
        };
        self.rules
            .get(&action.kind())
            .unwrap_or(&self.default_rule)
            .check(&ctx, action)
    }
}
