//! Types and services shared by the card game server and client
//!
//! The server owns the authoritative [`GameState`]; clients only ever see a
//! [`FilteredView`] projected for their [`Viewer`]. Everything that crosses the
//! network is a [`Packet`] encoded by a [`WireProtocol`].

pub mod action;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod recovery;
pub mod state;
pub mod view;

pub use action::{ActionKind, PlayerAction};
pub use error::{
    classify, ClassificationHint, ErrorCategory, ErrorKind, RecoveryStrategyKind, Severity,
    TypedError,
};
pub use notify::{Listeners, SubscriptionId};
pub use protocol::{ProtocolConfig, ProtocolRegistry, SerializationError, WireProtocol};
pub use recovery::{
    RecoveryConfig, RecoveryContext, RecoveryCoordinator, RecoveryEvent, RecoveryResult,
    RecoveryStrategy,
};
pub use state::{CardId, GameState, PlayerIndex, TargetRef, ZoneType};
pub use view::{FilteredView, Perspective, Viewer};

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest datagram either side will read.
pub const MAX_PACKET_SIZE: usize = 65_507;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        protocol_version: String,
        game_id: String,
        /// None joins as a spectator
        seat: Option<PlayerIndex>,
    },
    Action {
        sequence: u32,
        action: PlayerAction,
    },
    RequestResync {
        known_version: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    Disconnect,

    Connected {
        client_id: u32,
        viewer: Viewer,
    },
    ActionResult {
        sequence: u32,
        accepted: bool,
        reason: Option<String>,
    },
    View {
        view: FilteredView,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    Disconnected {
        reason: String,
    },
}

/// Milliseconds since the Unix epoch, saturating at zero if the clock is off.
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Ability, AbilityKind};
    use crate::view::{CardView, PlayerView, ZoneView};
    use std::collections::BTreeMap;

    fn sample_view(cards: usize) -> FilteredView {
        let game = GameState::new(&["alice", "bob"]);
        let card = state::Card {
            id: 1,
            name: "Llanowar Elves".to_string(),
            owner: 0,
            controller: 0,
            zone: ZoneType::Battlefield,
            face_down: false,
            tapped: false,
            attached_to: None,
            timestamp: 1,
            counters: BTreeMap::new(),
            abilities: vec![Ability::new(1, AbilityKind::Mana, "Add one green mana")],
        };

        let mut zones = BTreeMap::new();
        zones.insert(
            ZoneType::Battlefield,
            ZoneView {
                zone: ZoneType::Battlefield,
                cards: (0..cards).map(|_| CardView::revealed(&card)).collect(),
                count: Some(cards),
            },
        );

        FilteredView {
            viewer: Viewer::Player(0),
            version: 7,
            players: vec![PlayerView {
                index: 0,
                name: "alice".to_string(),
                life: 20,
                counters: BTreeMap::new(),
                mana_pool: Default::default(),
                lost: false,
                zones,
            }],
            stack: Vec::new(),
            pending_triggers: 0,
            phase: game.phase.clone(),
            game_over: false,
        }
    }

    #[test]
    fn test_connect_packet_over_both_codecs() {
        let packet = Packet::Connect {
            protocol_version: "1.0".to_string(),
            game_id: "table-1".to_string(),
            seat: Some(1),
        };

        for protocol in [WireProtocol::json(), WireProtocol::bincode()] {
            let bytes = protocol.serialize(&packet).unwrap();
            let decoded: Packet = protocol.deserialize(&bytes).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_small_view_packet_is_not_compressed() {
        let protocol = WireProtocol::bincode();
        let packet = Packet::View {
            view: sample_view(1),
        };

        let bytes = protocol.serialize(&packet).unwrap();
        assert!(!protocol.is_compressed(&bytes));
        let decoded: Packet = protocol.deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_large_view_packet_is_compressed() {
        let protocol = WireProtocol::json();
        let packet = Packet::View {
            view: sample_view(60),
        };

        let bytes = protocol.serialize(&packet).unwrap();
        assert!(protocol.is_compressed(&bytes));

        match protocol.deserialize::<Packet>(&bytes).unwrap() {
            Packet::View { view } => {
                assert_eq!(view.version, 7);
                assert_eq!(view.revealed_cards().count(), 60);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_action_packet_keeps_target() {
        let packet = Packet::Action {
            sequence: 12,
            action: PlayerAction::Target {
                source: 4,
                target: TargetRef::Player(1),
            },
        };

        let protocol = WireProtocol::bincode();
        let decoded: Packet = protocol
            .deserialize(&protocol.serialize(&packet).unwrap())
            .unwrap();
        match decoded {
            Packet::Action { sequence, action } => {
                assert_eq!(sequence, 12);
                assert_eq!(action.kind(), ActionKind::Target);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_timestamp_is_monotone_enough() {
        let first = timestamp_millis();
        let second = timestamp_millis();
        assert!(second >= first);
        assert!(first > 0);
    }
}
