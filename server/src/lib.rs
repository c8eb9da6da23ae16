//! # Card Game Server Library
//!
//! This library provides the authoritative server for the turn-based card game.
//! It owns the canonical game state, decides which actions are legal, and sends
//! every participant a view of the state that contains only what they are
//! allowed to see.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! Each hosted game keeps one [`GameState`](shared::GameState) behind a
//! reader/writer lock together with a monotonically increasing version. Clients
//! never send state. They send actions, and the server applies the ones it accepts.
//!
//! ### Information Security
//! Hidden zones (hands, libraries, face-down cards) are filtered per viewer before
//! anything leaves the server. Opponents learn the size of a hidden zone but not
//! its contents. Spectators are treated as a non-owner of every seat: they
//! see public zones and the counts of hidden ones, never hidden contents.
//!
//! ### Action Validation
//! Every submitted action runs through a rule registered for its kind. Actions
//! that reference cards the actor cannot see are rejected the same way as actions
//! that reference cards which do not exist, so probing reveals nothing.
//!
//! ### Recovery
//! Games are snapshotted periodically. When an integrity check finds a broken
//! state the recovery coordinator restores the newest valid snapshot and all
//! clients receive fresh views on the next tick.
//!
//! ## Module Organization
//!
//! ### Authority Module (`authority`)
//! Versioned, lock-protected game state.
//!
//! ### Visibility Module (`visibility`)
//! Zone classification and the per-viewer security filter.
//!
//! ### Validation Module (`validation`)
//! Per-action-kind rules and the validator that dispatches to them.
//!
//! ### Rules Module (`rules`)
//! The rules engine seam that applies authorized actions to the state.
//!
//! ### View Cache Module (`view_cache`)
//! Memoized filtered views, recomputed only when the version moves.
//!
//! ### Snapshot Module (`snapshot`)
//! Bounded, expiring snapshot storage with validated restore.
//!
//! ### Registry Module (`registry`)
//! Hosted games, action submission and administrative termination.
//!
//! ### Resync Module (`resync`)
//! The recovery strategy that restores a game from its latest snapshot.
//!
//! ### Client Manager Module (`client_manager`)
//! Connection tracking, seats, action sequence numbers and sent view versions.
//!
//! ### Network Module (`network`)
//! UDP socket handling and the main session loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig {
//!         bind_addr: "127.0.0.1:8080".to_string(),
//!         players: vec!["alice".to_string(), "bob".to_string()],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     // Runs until a shutdown message arrives:
//!     // - Accepts connections and seats players
//!     // - Validates and applies actions
//!     // - Pushes filtered views whenever the state version moves
//!     // - Checks integrity and recovers from snapshots
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! The server uses an event-driven architecture with internal async tasks that handle:
//! - **Network Receiver**: Continuously listens for incoming packets
//! - **Network Sender**: Processes the outgoing packet queue
//! - **Timeout Checker**: Removes clients that stopped sending heartbeats
//! - **Sweepers**: Expire idle cached views and stale snapshots

pub mod authority;
pub mod client_manager;
pub mod network;
pub mod registry;
pub mod resync;
pub mod rules;
pub mod snapshot;
pub mod validation;
pub mod view_cache;
pub mod visibility;
