//! Recovery of a disrupted game from its latest snapshot

use crate::registry::GameRegistry;
use crate::snapshot::SnapshotError;
use log::info;
use shared::recovery::{RecoveryContext, RecoveryFuture, RecoveryResult, RecoveryStrategy};
use shared::{ErrorKind, RecoveryStrategyKind, TypedError};
use std::sync::Arc;
use std::time::Instant;

/// Context key naming the game to restore
pub const GAME_ID_KEY: &str = "game_id";

pub struct ResyncStrategy {
    registry: Arc<GameRegistry>,
    priority: i32,
}

impl ResyncStrategy {
    pub fn new(registry: Arc<GameRegistry>) -> Self {
        Self {
            registry,
            priority: 80,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl RecoveryStrategy for ResyncStrategy {
    fn name(&self) -> &str {
        "snapshot-resync"
    }

    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Resync
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_recover(&self, error: &TypedError) -> bool {
        error.strategy == RecoveryStrategyKind::Resync
    }

    fn attempt_recovery(&self, _error: &TypedError, context: &RecoveryContext) -> RecoveryFuture {
        let registry = Arc::clone(&self.registry);
        let game_id = context.get(GAME_ID_KEY).cloned();

        Box::pin(async move {
            let started = Instant::now();
            let Some(game_id) = game_id else {
                return RecoveryResult::not_applicable("no game id in recovery context");
            };
            let Some(session) = registry.get(&game_id) else {
                return RecoveryResult::not_applicable(format!("game {} is not hosted", game_id));
            };

            match session.snapshots().restore(&game_id, session.authority()).await {
                Ok(version) => {
                    info!("Game {} resynchronized at version {}", game_id, version);
                    RecoveryResult::success(
                        format!("restored game {} at version {}", game_id, version),
                        started.elapsed().as_millis() as u64,
                    )
                }
                Err(SnapshotError::NotFound(_)) => RecoveryResult::failure(
                    format!("no snapshot available for game {}", game_id),
                    started.elapsed().as_millis() as u64,
                ),
                Err(e) => RecoveryResult::Failure {
                    message: e.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cause: Some(TypedError::new(ErrorKind::StateCorruption, e.to_string())),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::rules::BasicRules;
    use shared::recovery::{RecoveryConfig, RecoveryCoordinator};
    use shared::{GameState, ZoneType};

    fn context(game_id: &str) -> RecoveryContext {
        RecoveryContext::from([(GAME_ID_KEY.to_string(), game_id.to_string())])
    }

    #[tokio::test]
    async fn test_resync_restores_snapshot_through_coordinator() {
        let registry = Arc::new(GameRegistry::new(
            RegistryConfig::default(),
            Arc::new(BasicRules),
        ));
        let session = registry
            .create_game("g1", GameState::new(&["alice", "bob"]))
            .unwrap();
        registry
            .snapshots()
            .capture("g1", session.authority())
            .await
            .unwrap();

        session
            .authority()
            .mutate(|state| {
                let card = state.create_card(0, "Forest", ZoneType::Hand, Vec::new());
                if let Some(card) = card.and_then(|id| state.cards.get_mut(&id)) {
                    card.zone = ZoneType::Exile;
                }
            })
            .await;
        let error = session.check_integrity().await.unwrap_err();

        let coordinator = RecoveryCoordinator::new(RecoveryConfig::default());
        coordinator.register_strategy(Arc::new(ResyncStrategy::new(Arc::clone(&registry))));
        let outcome = coordinator.recover(error, context("g1")).await;

        assert!(outcome.result.is_success(), "{:?}", outcome.result);
        assert!(session.check_integrity().await.is_ok());
        assert_eq!(session.authority().read().await.card_count(), 0);
    }

    #[tokio::test]
    async fn test_resync_without_snapshot_fails() {
        let registry = Arc::new(GameRegistry::new(
            RegistryConfig::default(),
            Arc::new(BasicRules),
        ));
        registry
            .create_game("g1", GameState::new(&["alice", "bob"]))
            .unwrap();
        let strategy = ResyncStrategy::new(registry);

        let error = TypedError::new(ErrorKind::StateDesync, "client out of sync");
        assert!(strategy.can_recover(&error));
        let result = strategy.attempt_recovery(&error, &context("g1")).await;
        assert!(matches!(result, RecoveryResult::Failure { cause: None, .. }));
    }

    #[tokio::test]
    async fn test_resync_needs_game_id() {
        let registry = Arc::new(GameRegistry::new(
            RegistryConfig::default(),
            Arc::new(BasicRules),
        ));
        let strategy = ResyncStrategy::new(registry);
        let error = TypedError::new(ErrorKind::StateDesync, "client out of sync");

        let result = strategy
            .attempt_recovery(&error, &RecoveryContext::new())
            .await;
        assert!(matches!(result, RecoveryResult::NotApplicable { .. }));
    }
}
