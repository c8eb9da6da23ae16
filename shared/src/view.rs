//! Viewer identities, perspectives and the filtered views sent to them

use crate::state::{Card, CardId, ManaPool, PhaseState, PlayerIndex, TargetRef, ZoneType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who is asking to see or act on the game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Viewer {
    Player(PlayerIndex),
    Spectator(u32),
    Admin,
}

impl Viewer {
    /// Perspective this viewer has over a zone held by `holder`.
    pub fn perspective_for(&self, holder: PlayerIndex) -> Perspective {
        match self {
            Viewer::Player(index) if *index == holder => Perspective::Owner,
            Viewer::Player(_) => Perspective::Opponent,
            Viewer::Spectator(_) => Perspective::Spectator,
            Viewer::Admin => Perspective::Admin,
        }
    }

    pub fn player_index(&self) -> Option<PlayerIndex> {
        match self {
            Viewer::Player(index) => Some(*index),
            _ => None,
        }
    }

    pub fn can_participate(&self) -> bool {
        matches!(self, Viewer::Player(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Perspective {
    Owner,
    Opponent,
    Spectator,
    Admin,
}

impl Perspective {
    pub fn can_see_owner_information(&self) -> bool {
        matches!(self, Perspective::Owner | Perspective::Admin)
    }
}

/// Disclosure policy for a zone type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HiddenZoneClass {
    FullyHidden,
    CountOnly,
    Public,
}

impl HiddenZoneClass {
    pub fn is_public(&self) -> bool {
        *self == HiddenZoneClass::Public
    }

    pub fn is_hidden(&self) -> bool {
        !self.is_public()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardView {
    pub id: CardId,
    /// None when the card's face is not visible to this viewer
    pub name: Option<String>,
    pub owner: PlayerIndex,
    pub controller: PlayerIndex,
    pub face_down: bool,
    pub tapped: bool,
    pub attached_to: Option<CardId>,
    pub counters: BTreeMap<String, i32>,
}

impl CardView {
    pub fn revealed(card: &Card) -> Self {
        Self {
            id: card.id,
            name: Some(card.name.clone()),
            owner: card.owner,
            controller: card.controller,
            face_down: card.face_down,
            tapped: card.tapped,
            attached_to: card.attached_to,
            counters: card.counters.clone(),
        }
    }

    /// Identity and table position only, for face-down cards seen by others.
    pub fn concealed(card: &Card) -> Self {
        Self {
            id: card.id,
            name: None,
            owner: card.owner,
            controller: card.controller,
            face_down: true,
            tapped: card.tapped,
            attached_to: card.attached_to,
            counters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneView {
    pub zone: ZoneType,
    pub cards: Vec<CardView>,
    /// Disclosed size; None when even the count is withheld
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub index: PlayerIndex,
    pub name: String,
    pub life: i32,
    pub counters: BTreeMap<String, i32>,
    pub mana_pool: ManaPool,
    pub lost: bool,
    pub zones: BTreeMap<ZoneType, ZoneView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntryView {
    pub id: u32,
    pub source: CardView,
    pub controller: PlayerIndex,
    pub targets: Vec<TargetRef>,
}

/// A versioned projection of the game for one viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredView {
    pub viewer: Viewer,
    pub version: u64,
    pub players: Vec<PlayerView>,
    pub stack: Vec<StackEntryView>,
    pub pending_triggers: usize,
    pub phase: Option<PhaseState>,
    pub game_over: bool,
}

impl FilteredView {
    pub fn player(&self, index: PlayerIndex) -> Option<&PlayerView> {
        self.players.get(index)
    }

    pub fn zone(&self, holder: PlayerIndex, zone: ZoneType) -> Option<&ZoneView> {
        self.player(holder).and_then(|p| p.zones.get(&zone))
    }

    pub fn hand_size(&self, holder: PlayerIndex) -> Option<usize> {
        self.zone(holder, ZoneType::Hand).and_then(|z| z.count)
    }

    /// Every card this view reveals by name, across all zones and the stack.
    pub fn revealed_cards(&self) -> impl Iterator<Item = &CardView> {
        self.players
            .iter()
            .flat_map(|p| p.zones.values())
            .flat_map(|z| z.cards.iter())
            .chain(self.stack.iter().map(|entry| &entry.source))
            .filter(|card| card.name.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perspective_mapping() {
        assert_eq!(Viewer::Player(0).perspective_for(0), Perspective::Owner);
        assert_eq!(Viewer::Player(0).perspective_for(1), Perspective::Opponent);
        assert_eq!(Viewer::Spectator(9).perspective_for(0), Perspective::Spectator);
        assert_eq!(Viewer::Admin.perspective_for(1), Perspective::Admin);
    }

    #[test]
    fn test_owner_information_rights() {
        assert!(Perspective::Owner.can_see_owner_information());
        assert!(Perspective::Admin.can_see_owner_information());
        assert!(!Perspective::Opponent.can_see_owner_information());
        assert!(!Perspective::Spectator.can_see_owner_information());
    }

    #[test]
    fn test_spectators_cannot_participate() {
        assert!(Viewer::Player(1).can_participate());
        assert!(!Viewer::Spectator(1).can_participate());
        assert!(!Viewer::Admin.can_participate());
    }

    #[test]
    fn test_zone_class_flags() {
        assert!(HiddenZoneClass::Public.is_public());
        assert!(HiddenZoneClass::CountOnly.is_hidden());
        assert!(HiddenZoneClass::FullyHidden.is_hidden());
    }
}
