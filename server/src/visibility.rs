//! Per-viewer projection of the authoritative state
//!
//! Hidden zones (hand, library, sideboard by default) are only shown in full to
//! their holder and to admins. Everyone else sees an empty zone, plus its size
//! when the zone is configured as count-revealing. Face-down cards in public
//! zones keep their position on the table but lose their identity for anyone
//! who neither owns nor controls them.

use shared::state::{Card, CardId, GameState, Player, PlayerIndex, ZoneType};
use shared::view::{
    CardView, FilteredView, HiddenZoneClass, PlayerView, StackEntryView, Viewer, ZoneView,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct VisibilityConfig {
    pub zone_classes: BTreeMap<ZoneType, HiddenZoneClass>,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        let zone_classes = ZoneType::ALL
            .iter()
            .map(|zone| {
                let class = match zone {
                    ZoneType::Hand | ZoneType::Library | ZoneType::Sideboard => {
                        HiddenZoneClass::CountOnly
                    }
                    _ => HiddenZoneClass::Public,
                };
                (*zone, class)
            })
            .collect();
        Self { zone_classes }
    }
}

impl VisibilityConfig {
    pub fn with_class(mut self, zone: ZoneType, class: HiddenZoneClass) -> Self {
        self.zone_classes.insert(zone, class);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityFilter {
    config: VisibilityConfig,
}

impl SecurityFilter {
    pub fn new(config: VisibilityConfig) -> Self {
        Self { config }
    }

    /// Zones missing from the configuration are treated as fully hidden.
    pub fn zone_class(&self, zone: ZoneType) -> HiddenZoneClass {
        self.config
            .zone_classes
            .get(&zone)
            .copied()
            .unwrap_or(HiddenZoneClass::FullyHidden)
    }

    /// Whether `viewer` may see the contents of `holder`'s `zone`.
    pub fn can_see_zone(&self, viewer: Viewer, holder: PlayerIndex, zone: ZoneType) -> bool {
        self.zone_class(zone).is_public()
            || viewer.perspective_for(holder).can_see_owner_information()
    }

    fn can_see_face(viewer: Viewer, card: &Card) -> bool {
        match viewer {
            Viewer::Admin => true,
            Viewer::Player(index) => index == card.owner || index == card.controller,
            Viewer::Spectator(_) => false,
        }
    }

    /// Whether the card shows up at all in `viewer`'s view, face-down or not.
    pub fn can_see_card(&self, state: &GameState, viewer: Viewer, id: CardId) -> bool {
        match state.card(id) {
            Some(card) => self.can_see_zone(viewer, GameState::holder_of(card), card.zone),
            None => false,
        }
    }

    fn card_view(viewer: Viewer, card: &Card) -> CardView {
        if card.face_down && !Self::can_see_face(viewer, card) {
            CardView::concealed(card)
        } else {
            CardView::revealed(card)
        }
    }

    fn filter_zone(
        &self,
        state: &GameState,
        viewer: Viewer,
        player: &Player,
        zone: ZoneType,
    ) -> ZoneView {
        let ids = player.zone(zone);
        let class = self.zone_class(zone);

        if self.can_see_zone(viewer, player.index, zone) {
            ZoneView {
                zone,
                cards: ids
                    .iter()
                    .filter_map(|id| state.card(*id))
                    .map(|card| Self::card_view(viewer, card))
                    .collect(),
                count: Some(ids.len()),
            }
        } else {
            ZoneView {
                zone,
                cards: Vec::new(),
                count: (class == HiddenZoneClass::CountOnly).then_some(ids.len()),
            }
        }
    }

    fn filter_player(&self, state: &GameState, viewer: Viewer, player: &Player) -> PlayerView {
        let zones = ZoneType::ALL
            .iter()
            .map(|zone| (*zone, self.filter_zone(state, viewer, player, *zone)))
            .collect();

        PlayerView {
            index: player.index,
            name: player.name.clone(),
            life: player.life,
            counters: player.counters.clone(),
            mana_pool: player.mana_pool.clone(),
            lost: player.lost,
            zones,
        }
    }

    /// Projects the whole game for one viewer.
    pub fn filter_view(&self, state: &GameState, viewer: Viewer, version: u64) -> FilteredView {
        let players = state
            .players()
            .iter()
            .map(|player| self.filter_player(state, viewer, player))
            .collect();

        let stack = state
            .stack
            .iter()
            .filter_map(|entry| {
                let source = state.card(entry.source)?;
                Some(StackEntryView {
                    id: entry.id,
                    source: Self::card_view(viewer, source),
                    controller: entry.controller,
                    targets: entry.targets.clone(),
                })
            })
            .collect();

        FilteredView {
            viewer,
            version,
            players,
            stack,
            pending_triggers: state.pending_triggers.len(),
            phase: state.phase.clone(),
            game_over: state.is_game_over(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_with_hands() -> (GameState, CardId, CardId) {
        let mut state = GameState::new(&["alice", "bob"]);
        let alice_card = state
            .create_card(0, "Lightning Bolt", ZoneType::Hand, Vec::new())
            .unwrap();
        let bob_card = state
            .create_card(1, "Counterspell", ZoneType::Hand, Vec::new())
            .unwrap();
        state.create_card(1, "Island", ZoneType::Hand, Vec::new());
        state.create_card(1, "Island", ZoneType::Library, Vec::new());
        (state, alice_card, bob_card)
    }

    #[test]
    fn test_owner_sees_own_hand() {
        let (state, alice_card, _) = game_with_hands();
        let view = SecurityFilter::default().filter_view(&state, Viewer::Player(0), 1);

        let hand = view.zone(0, ZoneType::Hand).unwrap();
        assert_eq!(hand.cards.len(), 1);
        assert_eq!(hand.cards[0].id, alice_card);
        assert_eq!(hand.cards[0].name.as_deref(), Some("Lightning Bolt"));
    }

    #[test]
    fn test_opponent_hand_shows_count_only() {
        let (state, _, bob_card) = game_with_hands();
        let view = SecurityFilter::default().filter_view(&state, Viewer::Player(0), 1);

        let bob_hand = view.zone(1, ZoneType::Hand).unwrap();
        assert!(bob_hand.cards.is_empty());
        assert_eq!(bob_hand.count, Some(2));
        assert!(view.revealed_cards().all(|card| card.id != bob_card));
    }

    #[test]
    fn test_fully_hidden_zone_withholds_count() {
        let (state, _, _) = game_with_hands();
        let filter = SecurityFilter::new(
            VisibilityConfig::default().with_class(ZoneType::Library, HiddenZoneClass::FullyHidden),
        );
        let view = filter.filter_view(&state, Viewer::Spectator(3), 1);

        let library = view.zone(1, ZoneType::Library).unwrap();
        assert!(library.cards.is_empty());
        assert_eq!(library.count, None);
    }

    #[test]
    fn test_admin_sees_everything() {
        let (state, _, _) = game_with_hands();
        let view = SecurityFilter::default().filter_view(&state, Viewer::Admin, 1);
        assert_eq!(view.revealed_cards().count(), state.card_count());
    }

    #[test]
    fn test_face_down_permanent_redacted_for_others() {
        let mut state = GameState::new(&["alice", "bob"]);
        let morph = state
            .create_card(0, "Exalted Angel", ZoneType::Battlefield, Vec::new())
            .unwrap();
        if let Some(card) = state.cards.get_mut(&morph) {
            card.face_down = true;
        }
        let filter = SecurityFilter::default();

        let opponent = filter.filter_view(&state, Viewer::Player(1), 1);
        let seen = &opponent.zone(0, ZoneType::Battlefield).unwrap().cards[0];
        assert_eq!(seen.id, morph);
        assert_eq!(seen.name, None);

        let owner = filter.filter_view(&state, Viewer::Player(0), 1);
        let seen = &owner.zone(0, ZoneType::Battlefield).unwrap().cards[0];
        assert_eq!(seen.name.as_deref(), Some("Exalted Angel"));
    }

    #[test]
    fn test_no_hidden_card_leaks_to_any_non_owner() {
        let (state, _, _) = game_with_hands();
        let filter = SecurityFilter::default();

        for viewer in [Viewer::Player(0), Viewer::Player(1), Viewer::Spectator(1)] {
            let view = filter.filter_view(&state, viewer, 1);
            for card in view.revealed_cards() {
                let actual = state.card(card.id).unwrap();
                let holder = GameState::holder_of(actual);
                assert!(
                    filter.zone_class(actual.zone).is_public()
                        || viewer.perspective_for(holder).can_see_owner_information(),
                    "{:?} saw hidden card {}",
                    viewer,
                    card.id
                );
            }
        }
    }

    #[test]
    fn test_can_see_card() {
        let (state, alice_card, bob_card) = game_with_hands();
        let filter = SecurityFilter::default();

        assert!(filter.can_see_card(&state, Viewer::Player(0), alice_card));
        assert!(!filter.can_see_card(&state, Viewer::Player(0), bob_card));
        assert!(!filter.can_see_card(&state, Viewer::Player(0), 999));
    }
}
