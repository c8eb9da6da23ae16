//! Hosted games and the administrative operations on them

use crate::authority::AuthoritativeState;
use crate::rules::{RulesEngine, RulesError};
use crate::snapshot::{validate_state, SnapshotConfig, SnapshotManager};
use crate::validation::{ActionValidator, RejectReason, ValidationOutcome};
use crate::view_cache::{ViewCache, ViewCacheConfig};
use crate::visibility::{SecurityFilter, VisibilityConfig};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use shared::{ErrorKind, FilteredView, GameState, PlayerAction, TypedError, Viewer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub visibility: VisibilityConfig,
    pub view_cache: ViewCacheConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("game {0} already exists")]
    AlreadyExists(String),
    #[error("game {0} not found")]
    NotFound(String),
    #[error("game {0} has been terminated")]
    Terminated(String),
    #[error("rules engine refused the action: {0}")]
    Rules(#[from] RulesError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied { version: u64 },
    Rejected(RejectReason),
}

/// One hosted game
pub struct GameSession {
    game_id: String,
    authority: Arc<AuthoritativeState>,
    view_cache: Arc<ViewCache>,
    validator: ActionValidator,
    rules: Arc<dyn RulesEngine>,
    snapshots: Arc<SnapshotManager>,
    periodic_capture: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl GameSession {
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn authority(&self) -> &Arc<AuthoritativeState> {
        &self.authority
    }

    pub fn view_cache(&self) -> &Arc<ViewCache> {
        &self.view_cache
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn view_for(&self, viewer: Viewer) -> Arc<FilteredView> {
        self.view_cache.get_view(viewer).await
    }

    pub async fn player_count(&self) -> usize {
        self.authority.read().await.players().len()
    }

    /// Validates and applies one action under the write lock.
    pub async fn submit_action(
        &self,
        viewer: Viewer,
        action: &PlayerAction,
    ) -> Result<SubmitOutcome, RegistryError> {
        if self.is_terminated() {
            return Err(RegistryError::Terminated(self.game_id.clone()));
        }

        let mut state = self.authority.write().await;
        if let ValidationOutcome::Rejected(reason) = self.validator.validate(&state, viewer, action)
        {
            return Ok(SubmitOutcome::Rejected(reason));
        }

        let Some(actor) = viewer.player_index() else {
            return Ok(SubmitOutcome::Rejected(RejectReason::NotParticipant));
        };
        self.rules.apply(&mut state, actor, action)?;
        let version = self.authority.bump_version();
        drop(state);

        Ok(SubmitOutcome::Applied { version })
    }

    /// Checks the live state and reports corruption as a typed error.
    pub async fn check_integrity(&self) -> Result<(), TypedError> {
        let report = validate_state(&*self.authority.read().await);
        if report.is_valid() {
            Ok(())
        } else {
            Err(TypedError::new(
                ErrorKind::StateCorruption,
                format!("game {} failed integrity check: {}", self.game_id, report.errors.join("; ")),
            ))
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if let Some(capture) = self.periodic_capture.lock().take() {
            capture.abort();
        }
        self.view_cache.shutdown();
        self.snapshots.remove(&self.game_id);
    }
}

pub struct GameRegistry {
    config: RegistryConfig,
    games: DashMap<String, Arc<GameSession>>,
    filter: Arc<SecurityFilter>,
    snapshots: Arc<SnapshotManager>,
    rules: Arc<dyn RulesEngine>,
}

impl GameRegistry {
    pub fn new(config: RegistryConfig, rules: Arc<dyn RulesEngine>) -> Self {
        let filter = Arc::new(SecurityFilter::new(config.visibility.clone()));
        let snapshots = Arc::new(SnapshotManager::new(config.snapshot.clone()));
        Self {
            config,
            games: DashMap::new(),
            filter,
            snapshots,
            rules,
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Starts the snapshot sweeper. Needs a running tokio runtime.
    pub fn start(&self) {
        self.snapshots.spawn_sweeper();
    }

    /// Hosts a new game. Must be called from within a tokio runtime, as the
    /// session starts its own cache sweeper and periodic snapshot task.
    pub fn create_game(
        &self,
        game_id: &str,
        state: GameState,
    ) -> Result<Arc<GameSession>, RegistryError> {
        if self.games.contains_key(game_id) {
            return Err(RegistryError::AlreadyExists(game_id.to_string()));
        }

        let authority = Arc::new(AuthoritativeState::new(state));
        let view_cache = Arc::new(ViewCache::new(
            Arc::clone(&authority),
            Arc::clone(&self.filter),
            self.config.view_cache.clone(),
        ));
        view_cache.spawn_sweeper();
        let periodic = self
            .snapshots
            .spawn_periodic_capture(game_id.to_string(), Arc::clone(&authority));

        let session = Arc::new(GameSession {
            game_id: game_id.to_string(),
            authority,
            view_cache,
            validator: ActionValidator::new(Arc::clone(&self.filter)),
            rules: Arc::clone(&self.rules),
            snapshots: Arc::clone(&self.snapshots),
            periodic_capture: Mutex::new(Some(periodic)),
            terminated: AtomicBool::new(false),
        });

        match self.games.entry(game_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                session.terminate();
                Err(RegistryError::AlreadyExists(game_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                info!("Created game {}", game_id);
                Ok(session)
            }
        }
    }

    pub fn get(&self, game_id: &str) -> Option<Arc<GameSession>> {
        self.games.get(game_id).map(|session| Arc::clone(session.value()))
    }

    pub fn game_ids(&self) -> Vec<String> {
        self.games.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub async fn submit_action(
        &self,
        game_id: &str,
        viewer: Viewer,
        action: &PlayerAction,
    ) -> Result<SubmitOutcome, RegistryError> {
        let session = self
            .get(game_id)
            .ok_or_else(|| RegistryError::NotFound(game_id.to_string()))?;
        session.submit_action(viewer, action).await
    }

    /// Removes a game and stops everything it owns.
    pub fn force_terminate(&self, game_id: &str) -> Result<(), RegistryError> {
        let (_, session) = self
            .games
            .remove(game_id)
            .ok_or_else(|| RegistryError::NotFound(game_id.to_string()))?;
        session.terminate();
        warn!("Game {} was forcibly terminated", game_id);
        Ok(())
    }

    pub fn shutdown(&self) {
        let ids = self.game_ids();
        for id in ids {
            if let Some((_, session)) = self.games.remove(&id) {
                session.terminate();
            }
        }
        self.snapshots.shutdown();
        info!("Game registry shut down");
    }
}
