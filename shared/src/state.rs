//! Authoritative game state as exposed by the rules engine
//!
//! This is the data surface the synchronization layer consumes: players, cards
//! and the zones they live in, the stack, pending triggers and the phase
//! handler. The rules engine owns the mutation logic; the helpers here only
//! keep zone membership and card metadata consistent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type CardId = u32;
pub type PlayerIndex = usize;

pub const DEFAULT_STARTING_LIFE: i32 = 20;

/// Every zone a card can occupy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ZoneType {
    Hand,
    Library,
    Sideboard,
    Battlefield,
    Graveyard,
    Exile,
    Command,
    Stack,
    Ante,
}

impl ZoneType {
    pub const ALL: [ZoneType; 9] = [
        ZoneType::Hand,
        ZoneType::Library,
        ZoneType::Sideboard,
        ZoneType::Battlefield,
        ZoneType::Graveyard,
        ZoneType::Exile,
        ZoneType::Command,
        ZoneType::Stack,
        ZoneType::Ante,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbilityKind {
    Spell,
    Activated,
    Mana,
    Triggered,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ability {
    pub id: u32,
    pub kind: AbilityKind,
    pub description: String,
}

impl Ability {
    pub fn new(id: u32, kind: AbilityKind, description: &str) -> Self {
        Self {
            id,
            kind,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub name: String,
    pub owner: PlayerIndex,
    pub controller: PlayerIndex,
    pub zone: ZoneType,
    pub face_down: bool,
    pub tapped: bool,
    pub attached_to: Option<CardId>,
    /// Zone-entry timestamp, refreshed whenever the card changes zones
    pub timestamp: u64,
    pub counters: BTreeMap<String, i32>,
    pub abilities: Vec<Ability>,
}

impl Card {
    pub fn spell_abilities(&self) -> impl Iterator<Item = &Ability> {
        self.abilities
            .iter()
            .filter(|ability| ability.kind == AbilityKind::Spell)
    }

    pub fn ability(&self, id: u32) -> Option<&Ability> {
        self.abilities.iter().find(|ability| ability.id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManaPool {
    pub white: u32,
    pub blue: u32,
    pub black: u32,
    pub red: u32,
    pub green: u32,
    pub colorless: u32,
}

impl ManaPool {
    pub fn total(&self) -> u32 {
        self.white + self.blue + self.black + self.red + self.green + self.colorless
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub index: PlayerIndex,
    pub name: String,
    pub life: i32,
    pub counters: BTreeMap<String, i32>,
    pub mana_pool: ManaPool,
    pub lost: bool,
    /// Ordered card lists per zone this player holds
    pub zones: BTreeMap<ZoneType, Vec<CardId>>,
}

impl Player {
    pub fn new(index: PlayerIndex, name: &str, life: i32) -> Self {
        Self {
            index,
            name: name.to_string(),
            life,
            counters: BTreeMap::new(),
            mana_pool: ManaPool::default(),
            lost: false,
            zones: ZoneType::ALL.iter().map(|zone| (*zone, Vec::new())).collect(),
        }
    }

    pub fn zone(&self, zone: ZoneType) -> &[CardId] {
        self.zones.get(&zone).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Untap,
    Upkeep,
    Draw,
    MainOne,
    BeginCombat,
    DeclareAttackers,
    DeclareBlockers,
    CombatDamage,
    EndCombat,
    MainTwo,
    EndOfTurn,
    Cleanup,
}

/// The phase handler: whose turn it is and who may act
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: Phase,
    pub turn: u32,
    pub active_player: PlayerIndex,
    pub priority_player: Option<PlayerIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetRef {
    Card(CardId),
    Player(PlayerIndex),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    pub id: u32,
    pub source: CardId,
    pub controller: PlayerIndex,
    pub ability: Option<u32>,
    pub targets: Vec<TargetRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTrigger {
    pub source: CardId,
    pub controller: PlayerIndex,
    pub ability: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub players: Vec<Player>,
    pub cards: BTreeMap<CardId, Card>,
    pub stack: Vec<StackEntry>,
    pub pending_triggers: Vec<PendingTrigger>,
    pub phase: Option<PhaseState>,
    pub game_over: bool,
    pub next_card_id: CardId,
    pub next_stack_id: u32,
    pub next_timestamp: u64,
}

impl GameState {
    pub fn new(player_names: &[&str]) -> Self {
        let players = player_names
            .iter()
            .enumerate()
            .map(|(index, name)| Player::new(index, name, DEFAULT_STARTING_LIFE))
            .collect();

        Self {
            players,
            cards: BTreeMap::new(),
            stack: Vec::new(),
            pending_triggers: Vec::new(),
            phase: Some(PhaseState {
                phase: Phase::MainOne,
                turn: 1,
                active_player: 0,
                priority_player: Some(0),
            }),
            game_over: false,
            next_card_id: 1,
            next_stack_id: 1,
            next_timestamp: 1,
        }
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, index: PlayerIndex) -> Option<&Player> {
        self.players.get(index)
    }

    pub fn is_game_over(&self) -> bool {
        self.game_over
    }

    pub fn priority_player(&self) -> Option<PlayerIndex> {
        self.phase.as_ref().and_then(|phase| phase.priority_player)
    }

    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.cards.get(&id)
    }

    pub fn zone_cards(&self, holder: PlayerIndex, zone: ZoneType) -> &[CardId] {
        self.player(holder).map(|p| p.zone(zone)).unwrap_or(&[])
    }

    /// The player whose zone list a card in `zone` belongs to.
    ///
    /// Battlefield permanents sit with their controller, everything else with
    /// the owner.
    pub fn holder_of(card: &Card) -> PlayerIndex {
        if card.zone == ZoneType::Battlefield {
            card.controller
        } else {
            card.owner
        }
    }

    fn stamp(&mut self) -> u64 {
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;
        timestamp
    }

    /// Creates a card owned and controlled by `owner` and places it in `zone`.
    ///
    /// Returns None if the owner does not exist.
    pub fn create_card(
        &mut self,
        owner: PlayerIndex,
        name: &str,
        zone: ZoneType,
        abilities: Vec<Ability>,
    ) -> Option<CardId> {
        if owner >= self.players.len() {
            return None;
        }

        let id = self.next_card_id;
        self.next_card_id += 1;
        let timestamp = self.stamp();

        let card = Card {
            id,
            name: name.to_string(),
            owner,
            controller: owner,
            zone,
            face_down: false,
            tapped: false,
            attached_to: None,
            timestamp,
            counters: BTreeMap::new(),
            abilities,
        };

        self.players[owner].zones.entry(zone).or_default().push(id);
        self.cards.insert(id, card);
        Some(id)
    }

    /// Moves a card to a new zone, keeping holder lists in sync.
    pub fn move_card(&mut self, id: CardId, to: ZoneType) -> bool {
        let Some(card) = self.cards.get(&id) else {
            return false;
        };
        let from_holder = Self::holder_of(card);
        let from_zone = card.zone;

        if let Some(list) = self
            .players
            .get_mut(from_holder)
            .and_then(|p| p.zones.get_mut(&from_zone))
        {
            list.retain(|card_id| *card_id != id);
        }

        let timestamp = self.stamp();
        let Some(card) = self.cards.get_mut(&id) else {
            return false;
        };
        card.zone = to;
        card.timestamp = timestamp;
        if to != ZoneType::Battlefield {
            card.attached_to = None;
            card.tapped = false;
            card.controller = card.owner;
        }
        let to_holder = Self::holder_of(card);

        match self.players.get_mut(to_holder) {
            Some(player) => {
                player.zones.entry(to).or_default().push(id);
                true
            }
            None => false,
        }
    }

    /// Pushes a spell or ability onto the stack.
    pub fn push_stack(
        &mut self,
        source: CardId,
        controller: PlayerIndex,
        ability: Option<u32>,
        targets: Vec<TargetRef>,
    ) -> u32 {
        let id = self.next_stack_id;
        self.next_stack_id += 1;
        self.stack.push(StackEntry {
            id,
            source,
            controller,
            ability,
            targets,
        });
        id
    }

    /// Hands priority to the next player still in the game.
    pub fn pass_priority(&mut self) {
        let player_count = self.players.len();
        let lost: Vec<bool> = self.players.iter().map(|p| p.lost).collect();
        if let Some(phase) = self.phase.as_mut() {
            let current = phase.priority_player.unwrap_or(phase.active_player);
            phase.priority_player = (1..=player_count)
                .map(|offset| (current + offset) % player_count)
                .find(|index| !lost[*index]);
        }
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }
}
