//! Memoized filtered views, one entry per viewer

use crate::authority::AuthoritativeState;
use crate::visibility::SecurityFilter;
use dashmap::DashMap;
use log::debug;
use shared::{FilteredView, Viewer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ViewCacheConfig {
    /// Entries unused for this long are swept. Default: 5 minutes.
    pub idle_expiry: Duration,
    /// Default: 60 s.
    pub sweep_interval: Duration,
}

impl Default for ViewCacheConfig {
    fn default() -> Self {
        Self {
            idle_expiry: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct CachedView {
    view: Arc<FilteredView>,
    version: u64,
}

struct ViewEntry {
    slot: Mutex<Option<CachedView>>,
    last_access: parking_lot::Mutex<Instant>,
}

impl ViewEntry {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            last_access: parking_lot::Mutex::new(Instant::now()),
        }
    }
}

/// Per-viewer cache of [`FilteredView`]s keyed on the state version
///
/// Each viewer's entry has its own lock, so computing one participant's view
/// never waits on another's. A view is recomputed only when the authoritative
/// version has moved since it was cached; otherwise the same `Arc` is handed
/// out again.
pub struct ViewCache {
    authority: Arc<AuthoritativeState>,
    filter: Arc<SecurityFilter>,
    config: ViewCacheConfig,
    entries: DashMap<Viewer, Arc<ViewEntry>>,
    recomputes: AtomicU64,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ViewCache {
    pub fn new(
        authority: Arc<AuthoritativeState>,
        filter: Arc<SecurityFilter>,
        config: ViewCacheConfig,
    ) -> Self {
        Self {
            authority,
            filter,
            config,
            entries: DashMap::new(),
            recomputes: AtomicU64::new(0),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    pub async fn get_view(&self, viewer: Viewer) -> Arc<FilteredView> {
        let entry = Arc::clone(
            self.entries
                .entry(viewer)
                .or_insert_with(|| Arc::new(ViewEntry::new()))
                .value(),
        );
        *entry.last_access.lock() = Instant::now();

        let mut slot = entry.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.version == self.authority.version() {
                return Arc::clone(&cached.view);
            }
        }

        let state = self.authority.read().await;
        let version = self.authority.version();
        let view = Arc::new(self.filter.filter_view(&state, viewer, version));
        drop(state);

        self.recomputes.fetch_add(1, Ordering::Relaxed);
        debug!("Recomputed view for {:?} at version {}", viewer, version);

        *slot = Some(CachedView {
            view: Arc::clone(&view),
            version,
        });
        view
    }

    /// Forces every viewer to recompute on their next request.
    pub fn invalidate_all(&self) {
        self.authority.bump_version();
        self.entries.clear();
    }

    pub fn invalidate(&self, viewer: Viewer) -> bool {
        self.entries.remove(&viewer).is_some()
    }

    /// Drops entries idle longer than the expiry and returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let expiry = self.config.idle_expiry;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_access.lock().elapsed() < expiry);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} idle view cache entries", removed);
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep_idle();
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.entries.clear();
    }
}

impl Drop for ViewCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
