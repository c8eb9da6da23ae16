//! Snapshot capture and restore for in-memory session recovery
//!
//! Snapshots are deep copies of the authoritative state, kept per game in a
//! bounded pool. Restoring is all-or-nothing: the snapshot is validated before
//! it replaces the live state and the result is validated again afterwards. If
//! the second check fails the previous state is put back.

use crate::authority::AuthoritativeState;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::state::{GameState, TargetRef};
use shared::timestamp_millis;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Pool capacity across all games. Default: 10.
    pub max_snapshots: usize,
    /// Age after which a snapshot is swept. Default: 5 minutes.
    pub ttl: Duration,
    /// Default: 30 s.
    pub capture_interval: Duration,
    /// Default: 60 s.
    pub sweep_interval: Duration,
    /// Capture or restore taking longer than this is logged as a warning. Default: 5 s.
    pub slow_operation: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            ttl: Duration::from_secs(5 * 60),
            capture_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            slow_operation: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Structural consistency check of a game state.
pub fn validate_state(state: &GameState) -> ValidationReport {
    let mut errors = Vec::new();

    if state.players().is_empty() {
        errors.push("state has no players".to_string());
    }
    if state.phase.is_none() {
        errors.push("phase state is missing".to_string());
    }

    for player in state.players() {
        if player.life < 0 {
            errors.push(format!("player {} has negative life", player.index));
        }
        for (zone, ids) in &player.zones {
            for id in ids {
                match state.card(*id) {
                    None => errors.push(format!(
                        "player {} lists unknown card {} in {:?}",
                        player.index, id, zone
                    )),
                    Some(card) if card.zone != *zone => errors.push(format!(
                        "card {} is listed in {:?} but claims {:?}",
                        id, zone, card.zone
                    )),
                    Some(card) if GameState::holder_of(card) != player.index => errors.push(
                        format!("card {} is listed under player {}", id, player.index),
                    ),
                    Some(_) => {}
                }
            }
        }
    }

    for card in state.cards.values() {
        if state.player(card.owner).is_none() {
            errors.push(format!("card {} has unknown owner {}", card.id, card.owner));
            continue;
        }
        let listed = state
            .players()
            .iter()
            .flat_map(|player| player.zones.values())
            .flatten()
            .filter(|id| **id == card.id)
            .count();
        if listed != 1 {
            errors.push(format!("card {} is listed {} times", card.id, listed));
        }
        if let Some(host) = card.attached_to {
            if state.card(host).is_none() {
                errors.push(format!("card {} is attached to unknown card {}", card.id, host));
            }
        }
    }

    for entry in &state.stack {
        if state.card(entry.source).is_none() {
            errors.push(format!("stack entry {} has unknown source", entry.id));
        }
        for target in &entry.targets {
            let resolves = match target {
                TargetRef::Card(id) => state.card(*id).is_some(),
                TargetRef::Player(index) => state.player(*index).is_some(),
            };
            if !resolves {
                errors.push(format!("stack entry {} has dangling target {:?}", entry.id, target));
            }
        }
    }

    ValidationReport { errors }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub game_id: String,
    pub state: GameState,
    /// Version of the live state when captured
    pub version: u64,
    pub captured_at: Instant,
    pub captured_at_millis: u64,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("no snapshot for game {0}")]
    NotFound(String),
    #[error("snapshot for game {game_id} is invalid: {}", errors.join("; "))]
    Invalid { game_id: String, errors: Vec<String> },
    #[error("restore of game {game_id} rolled back: {}", errors.join("; "))]
    RolledBack { game_id: String, errors: Vec<String> },
}

pub struct SnapshotManager {
    config: SnapshotConfig,
    snapshots: Mutex<HashMap<String, Arc<Snapshot>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            snapshots: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }

    pub fn latest(&self, game_id: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.lock().get(game_id).cloned()
    }

    pub fn remove(&self, game_id: &str) -> bool {
        self.snapshots.lock().remove(game_id).is_some()
    }

    fn log_duration(&self, operation: &str, game_id: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_operation {
            warn!(
                "Snapshot {} for game {} took {:?} (budget {:?})",
                operation, game_id, elapsed, self.config.slow_operation
            );
        } else {
            info!("Snapshot {} for game {} took {:?}", operation, game_id, elapsed);
        }
    }

    /// Copies the live state into the pool, replacing this game's previous snapshot.
    pub async fn capture(
        &self,
        game_id: &str,
        authority: &AuthoritativeState,
    ) -> Result<Arc<Snapshot>, SnapshotError> {
        let started = Instant::now();
        let (state, version) = authority.clone_state().await;

        let report = validate_state(&state);
        if !report.is_valid() {
            self.log_duration("capture", game_id, started);
            return Err(SnapshotError::Invalid {
                game_id: game_id.to_string(),
                errors: report.errors,
            });
        }

        let snapshot = Arc::new(Snapshot {
            game_id: game_id.to_string(),
            state,
            version,
            captured_at: Instant::now(),
            captured_at_millis: timestamp_millis(),
            report,
        });

        {
            let mut snapshots = self.snapshots.lock();
            snapshots.insert(game_id.to_string(), Arc::clone(&snapshot));
            while snapshots.len() > self.config.max_snapshots {
                let oldest = snapshots
                    .iter()
                    .min_by_key(|(_, snapshot)| snapshot.captured_at)
                    .map(|(id, _)| id.clone());
                match oldest {
                    Some(id) => {
                        debug!("Evicting snapshot for game {}", id);
                        snapshots.remove(&id);
                    }
                    None => break,
                }
            }
        }

        self.log_duration("capture", game_id, started);
        Ok(snapshot)
    }

    /// Replaces the live state with the game's snapshot and returns the new version.
    pub async fn restore(
        &self,
        game_id: &str,
        authority: &AuthoritativeState,
    ) -> Result<u64, SnapshotError> {
        let started = Instant::now();
        let snapshot = self
            .latest(game_id)
            .ok_or_else(|| SnapshotError::NotFound(game_id.to_string()))?;

        let report = validate_state(&snapshot.state);
        if !report.is_valid() {
            self.log_duration("restore", game_id, started);
            return Err(SnapshotError::Invalid {
                game_id: game_id.to_string(),
                errors: report.errors,
            });
        }

        let mut state = authority.write().await;
        let previous = std::mem::replace(&mut *state, snapshot.state.clone());

        let after = validate_state(&state);
        if !after.is_valid() {
            *state = previous;
            drop(state);
            warn!("Restore of game {} rolled back", game_id);
            self.log_duration("restore", game_id, started);
            return Err(SnapshotError::RolledBack {
                game_id: game_id.to_string(),
                errors: after.errors,
            });
        }

        let version = authority.bump_version();
        drop(state);

        info!(
            "Restored game {} from snapshot of version {} (now version {})",
            game_id, snapshot.version, version
        );
        self.log_duration("restore", game_id, started);
        Ok(version)
    }

    /// Drops snapshots older than the TTL and returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|_, snapshot| snapshot.captured_at.elapsed() < ttl);
        let removed = before - snapshots.len();
        if removed > 0 {
            debug!("Swept {} expired snapshots", removed);
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_expired();
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Captures `game_id` every capture interval until the game is over.
    pub fn spawn_periodic_capture(
        self: &Arc<Self>,
        game_id: String,
        authority: Arc<AuthoritativeState>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.capture_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if authority.read().await.is_game_over() {
                    info!("Game {} is over, stopping periodic snapshots", game_id);
                    break;
                }
                if let Err(e) = manager.capture(&game_id, &authority).await {
                    warn!("Periodic snapshot failed: {}", e);
                }
            }
        })
    }

    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.snapshots.lock().clear();
        info!("Snapshot manager shut down");
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::state::{Phase, PhaseState};
    use shared::{PlayerIndex, ZoneType};
    use tokio_test::{assert_err, assert_ok};

    fn authority_with_cards() -> AuthoritativeState {
        let mut state = GameState::new(&["alice", "bob"]);
        state.create_card(0, "Forest", ZoneType::Battlefield, Vec::new());
        state.create_card(1, "Island", ZoneType::Hand, Vec::new());
        AuthoritativeState::new(state)
    }

    #[test]
    fn test_fresh_game_is_valid() {
        let state = GameState::new(&["alice", "bob"]);
        assert!(validate_state(&state).is_valid());
    }

    #[test]
    fn test_validation_catches_inconsistencies() {
        let mut state = GameState::new(&["alice", "bob"]);
        let card = state
            .create_card(0, "Forest", ZoneType::Hand, Vec::new())
            .unwrap();
        state.cards.get_mut(&card).unwrap().zone = ZoneType::Graveyard;
        state.players[1].life = -3;
        state.phase = None;

        let report = validate_state(&state);
        assert_eq!(report.errors.len(), 3);
    }

    #[tokio::test]
    async fn test_capture_then_restore_roundtrip() {
        let authority = authority_with_cards();
        let manager = SnapshotManager::new(SnapshotConfig::default());
        let before = authority.read().await.clone();

        let snapshot = assert_ok!(manager.capture("g1", &authority).await);
        assert_eq!(snapshot.version, 1);

        authority
            .mutate(|state| {
                state.create_card(0, "Mountain", ZoneType::Hand, Vec::new());
                state.players[0].life = 4;
            })
            .await;

        let version = assert_ok!(manager.restore("g1", &authority).await);
        assert_eq!(version, 3);
        assert_eq!(*authority.read().await, before);
    }

    fn zone_sizes(state: &GameState) -> Vec<(PlayerIndex, ZoneType, usize)> {
        state
            .players()
            .iter()
            .flat_map(|player| {
                player
                    .zones
                    .iter()
                    .map(move |(zone, ids)| (player.index, *zone, ids.len()))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_restore_into_fresh_session() {
        let mut state = GameState::new(&["alice", "bob"]);
        state.create_card(0, "Forest", ZoneType::Battlefield, Vec::new());
        state.create_card(0, "Giant Growth", ZoneType::Hand, Vec::new());
        state.create_card(1, "Island", ZoneType::Library, Vec::new());
        state.create_card(1, "Shock", ZoneType::Graveyard, Vec::new());
        state.players[0].life = 13;
        state.players[1].life = 7;
        state.phase = Some(PhaseState {
            phase: Phase::DeclareBlockers,
            turn: 4,
            active_player: 1,
            priority_player: Some(0),
        });
        let source = AuthoritativeState::new(state.clone());
        let manager = SnapshotManager::new(SnapshotConfig::default());
        assert_ok!(manager.capture("g1", &source).await);

        let fresh = AuthoritativeState::new(GameState::new(&["carol", "dave", "erin"]));
        let version = assert_ok!(manager.restore("g1", &fresh).await);
        assert_eq!(version, 2);

        let restored = fresh.read().await;
        let lives: Vec<i32> = restored.players().iter().map(|p| p.life).collect();
        assert_eq!(lives, vec![13, 7]);
        assert_eq!(zone_sizes(&restored), zone_sizes(&state));
        assert_eq!(restored.phase, state.phase);
        assert_eq!(*restored, state);
    }

    #[tokio::test]
    async fn test_restore_without_snapshot() {
        let authority = authority_with_cards();
        let manager = SnapshotManager::new(SnapshotConfig::default());
        assert_eq!(
            manager.restore("missing", &authority).await,
            Err(SnapshotError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_capture_refuses_corrupt_state() {
        let authority = authority_with_cards();
        authority.mutate(|state| state.players[0].life = -1).await;
        let manager = SnapshotManager::new(SnapshotConfig::default());

        let error = assert_err!(manager.capture("g1", &authority).await);
        assert!(matches!(error, SnapshotError::Invalid { .. }));
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_evicts_oldest() {
        let authority = authority_with_cards();
        let manager = SnapshotManager::new(SnapshotConfig {
            max_snapshots: 2,
            ..Default::default()
        });

        for game in ["a", "b", "c"] {
            manager.capture(game, &authority).await.unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(manager.len(), 2);
        assert!(manager.latest("a").is_none());
        assert!(manager.latest("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let authority = authority_with_cards();
        let manager = SnapshotManager::new(SnapshotConfig {
            ttl: Duration::from_secs(60),
            ..Default::default()
        });
        manager.capture("old", &authority).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        manager.capture("new", &authority).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(manager.sweep_expired(), 1);
        assert!(manager.latest("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_capture_stops_when_game_over() {
        let authority = Arc::new(authority_with_cards());
        let manager = Arc::new(SnapshotManager::new(SnapshotConfig {
            capture_interval: Duration::from_secs(30),
            ..Default::default()
        }));

        let handle = manager.spawn_periodic_capture("g1".to_string(), Arc::clone(&authority));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(manager.latest("g1").is_some());

        authority.mutate(|state| state.game_over = true).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_shutdown_clears_pool() {
        let authority = authority_with_cards();
        let manager = Arc::new(SnapshotManager::new(SnapshotConfig::default()));
        manager.spawn_sweeper();
        manager.capture("g1", &authority).await.unwrap();

        manager.shutdown();
        assert!(manager.is_empty());
    }
}
