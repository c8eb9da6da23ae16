//! The server-owned game state and its version counter

use shared::GameState;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Authoritative game state behind an async read/write lock
///
/// Views and snapshot captures take the read side; actions and restores take
/// the write side. Every observable mutation bumps the version while the write
/// lock is still held, so a reader that loads the version under the read lock
/// always sees the version that matches the state it is looking at.
#[derive(Debug)]
pub struct AuthoritativeState {
    state: RwLock<GameState>,
    version: AtomicU64,
}

impl AuthoritativeState {
    pub fn new(state: GameState) -> Self {
        Self {
            state: RwLock::new(state),
            version: AtomicU64::new(1),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Marks the state as changed and returns the new version.
    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, GameState> {
        self.state.read().await
    }

    /// Write access without a version bump. Callers that change the state
    /// must call [`bump_version`](Self::bump_version) before dropping the guard.
    pub async fn write(&self) -> RwLockWriteGuard<'_, GameState> {
        self.state.write().await
    }

    /// Applies `change` under the write lock and bumps the version.
    pub async fn mutate<R>(&self, change: impl FnOnce(&mut GameState) -> R) -> (R, u64) {
        let mut state = self.state.write().await;
        let result = change(&mut state);
        let version = self.bump_version();
        (result, version)
    }

    pub async fn clone_state(&self) -> (GameState, u64) {
        let state = self.state.read().await;
        (state.clone(), self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ZoneType;

    #[tokio::test]
    async fn test_mutate_bumps_version() {
        let authority = AuthoritativeState::new(GameState::new(&["alice", "bob"]));
        assert_eq!(authority.version(), 1);

        let (card, version) = authority
            .mutate(|state| state.create_card(0, "Forest", ZoneType::Hand, Vec::new()))
            .await;

        assert!(card.is_some());
        assert_eq!(version, 2);
        assert_eq!(authority.read().await.card_count(), 1);
    }

    #[tokio::test]
    async fn test_clone_state_pairs_state_with_version() {
        let authority = AuthoritativeState::new(GameState::new(&["alice"]));
        authority.bump_version();

        let (state, version) = authority.clone_state().await;
        assert_eq!(version, 2);
        assert_eq!(state.players().len(), 1);
    }
}
