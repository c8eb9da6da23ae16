//! Performance benchmarks for the hot paths of state sync

use server::authority::AuthoritativeState;
use server::snapshot::{SnapshotConfig, SnapshotManager};
use server::view_cache::{ViewCache, ViewCacheConfig};
use server::visibility::{SecurityFilter, VisibilityConfig};
use shared::state::{Ability, AbilityKind};
use shared::{FilteredView, GameState, Packet, Viewer, WireProtocol, ZoneType};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Four players with a few hundred cards spread over every zone
fn large_state() -> GameState {
    let mut state = GameState::new(&["alice", "bob", "carol", "dave"]);
    for owner in 0..4 {
        for n in 0..60 {
            let name = format!("Deck {}-{}", owner, n);
            state.create_card(owner, &name, ZoneType::Library, Vec::new());
        }
        for n in 0..7 {
            let abilities = vec![Ability::new(1, AbilityKind::Spell, "deal 3 damage")];
            state.create_card(owner, &format!("Hand {}-{}", owner, n), ZoneType::Hand, abilities);
        }
        for n in 0..20 {
            let abilities = vec![Ability::new(1, AbilityKind::Activated, "tap: add mana")];
            state.create_card(
                owner,
                &format!("Permanent {}-{}", owner, n),
                ZoneType::Battlefield,
                abilities,
            );
        }
        for n in 0..15 {
            let name = format!("Grave {}-{}", owner, n);
            state.create_card(owner, &name, ZoneType::Graveyard, Vec::new());
        }
    }
    state
}

/// Benchmarks building a filtered view from scratch
#[test]
fn benchmark_filter_view() {
    let state = large_state();
    let filter = SecurityFilter::new(VisibilityConfig::default());

    let iterations = 1_000;
    let start = Instant::now();

    for i in 0..iterations {
        let viewer = Viewer::Player(i % 4);
        let view = filter.filter_view(&state, viewer, i as u64);
        assert_eq!(view.players.len(), 4);
    }

    let duration = start.elapsed();
    println!(
        "Filter view: {} iterations over {} cards in {:?} ({:.2} μs/iter)",
        iterations,
        state.card_count(),
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks repeated reads of an unchanged view
#[tokio::test]
async fn benchmark_view_cache_hits() {
    let authority = Arc::new(AuthoritativeState::new(large_state()));
    let filter = Arc::new(SecurityFilter::new(VisibilityConfig::default()));
    let cache = ViewCache::new(authority, filter, ViewCacheConfig::default());

    // Warm one entry per seat
    for seat in 0..4 {
        cache.get_view(Viewer::Player(seat)).await;
    }

    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let _ = cache.get_view(Viewer::Player(i % 4)).await;
    }

    let duration = start.elapsed();
    println!(
        "View cache hits: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(cache.recompute_count(), 4);
    // Should complete in under 500ms
    assert!(duration.as_millis() < 500);
}

/// Benchmarks encoding a full view packet with both codecs
#[test]
fn benchmark_view_serialization() {
    let state = large_state();
    let filter = SecurityFilter::new(VisibilityConfig::default());
    let view: FilteredView = filter.filter_view(&state, Viewer::Admin, 1);
    let packet = Packet::View { view };

    for protocol in [WireProtocol::bincode(), WireProtocol::json()] {
        let iterations = 100;
        let start = Instant::now();
        let mut encoded = Vec::new();

        for _ in 0..iterations {
            encoded = protocol.serialize(&packet).unwrap();
        }

        let encode_time = start.elapsed();
        let start = Instant::now();

        for _ in 0..iterations {
            let decoded: Packet = protocol.deserialize(&encoded).unwrap();
            assert!(matches!(decoded, Packet::View { .. }));
        }

        let decode_time = start.elapsed();
        println!(
            "{} view packet: {} bytes (compressed: {}), encode {:?}, decode {:?} for {} iterations",
            protocol.protocol_name(),
            encoded.len(),
            protocol.is_compressed(&encoded),
            encode_time,
            decode_time,
            iterations
        );

        // Admin views of this size go over the compression threshold
        assert!(protocol.is_compressed(&encoded));
        assert!(encode_time.as_millis() < 3000);
        assert!(decode_time.as_millis() < 3000);
    }
}

/// Benchmarks capturing and restoring a large game
#[tokio::test]
async fn benchmark_snapshot_capture_restore() {
    let authority = AuthoritativeState::new(large_state());
    let snapshots = SnapshotManager::new(SnapshotConfig::default());

    let iterations: u32 = 100;
    let start = Instant::now();

    for _ in 0..iterations {
        snapshots.capture("bench", &authority).await.unwrap();
        snapshots.restore("bench", &authority).await.unwrap();
    }

    let duration = start.elapsed();
    let per_cycle = duration / iterations;
    println!(
        "Snapshot capture+restore: {} cycles in {:?} ({:?}/cycle)",
        iterations, duration, per_cycle
    );

    // Every restore bumps the version once
    assert_eq!(authority.version(), 1 + iterations as u64);
    // Each cycle must stay well inside the slow operation budget
    assert!(per_cycle < Duration::from_secs(5));
    assert!(duration.as_secs() < 10);
}
