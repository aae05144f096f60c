//! Integration tests for the concurrent tile cache.
//!
//! These tests verify the cache under real thread contention:
//! - Creation uniqueness when many threads race for one key
//! - Write-lock exclusivity and blocking reader wakeup
//! - The resident-byte budget under sustained churn
//! - Checkpoint pinning while eviction pressure runs
//! - Owner invalidation with guards still outstanding
//! - Region assembly driven by a worker pool

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use rasterkiln::raster::PixelFormat;
use rasterkiln::{
    CacheConfig, ImageToken, OwnerId, Rect, RegionRequest, TileCache, TileKey, TileLookup,
    TileSpec,
};

// =============================================================================
// Test Helpers
// =============================================================================

const TILE: usize = 16;
const TILE_BYTES: usize = TILE * TILE * 4;

fn cache_with_budget(tiles: usize) -> Arc<TileCache> {
    TileCache::new(
        CacheConfig::default()
            .with_tile_size(TILE, TILE)
            .with_max_bytes(tiles * TILE_BYTES)
            .with_buckets(4, 16, 1024),
    )
    .unwrap()
}

fn key_of(owner: OwnerId, x: i32, y: i32) -> TileKey {
    TileKey::new(ImageToken::new(owner), x, y)
}

fn spec() -> TileSpec {
    TileSpec::new(PixelFormat::Float32)
}

/// Create-or-skip: fills the tile when this thread wins the creation
/// race, accepts a hit otherwise.
fn cook(cache: &Arc<TileCache>, key: TileKey, value: f32) {
    match cache.get_or_create(key, spec(), true, true).unwrap() {
        TileLookup::Created(mut guard) => guard.fill(value),
        TileLookup::Hit(_) => {}
        other => panic!("unexpected lookup outcome: {:?}", other),
    }
}

// =============================================================================
// Integration Tests
// =============================================================================

#[test]
fn racing_creates_produce_one_tile() {
    let cache = cache_with_budget(64);
    let key = key_of(OwnerId::next(), 0, 0);
    let created = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let created = created.clone();
        handles.push(thread::spawn(move || {
            match cache.get_or_create(key, spec(), true, true).unwrap() {
                TileLookup::Created(mut guard) => {
                    created.fetch_add(1, Ordering::SeqCst);
                    guard.fill(0.7);
                }
                TileLookup::Hit(guard) => {
                    // Losers block until the winner publishes, so the
                    // payload is always cooked by the time they read.
                    assert_eq!(guard.get(3, 3), 0.7);
                }
                other => panic!("unexpected lookup outcome: {:?}", other),
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(cache.statistics().created, 1);
}

#[test]
fn nonblocking_lookup_sees_busy_while_writer_holds() {
    let cache = cache_with_budget(8);
    let key = key_of(OwnerId::next(), 0, 0);

    let lookup = cache.get_or_create(key, spec(), true, true).unwrap();
    let TileLookup::Created(mut guard) = lookup else {
        panic!("fresh key should create");
    };
    guard.fill(0.5);

    let probe = {
        let cache = cache.clone();
        thread::spawn(move || cache.fetch(key, spec(), false).unwrap().is_busy())
    };
    assert!(probe.join().unwrap(), "probe should see the write lock");

    drop(guard);
    assert!(cache.fetch(key, spec(), false).unwrap().is_hit());
}

#[test]
fn blocking_reader_wakes_on_publish() {
    let cache = cache_with_budget(8);
    let key = key_of(OwnerId::next(), 2, 1);
    let (tx, rx) = mpsc::channel();

    let producer = {
        let cache = cache.clone();
        thread::spawn(move || {
            let TileLookup::Created(mut guard) =
                cache.get_or_create(key, spec(), true, true).unwrap()
            else {
                panic!("fresh key should create");
            };
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
            guard.fill(0.9);
        })
    };

    // The producer holds the write lock when this fetch starts.
    rx.recv().unwrap();
    match cache.fetch(key, spec(), true).unwrap() {
        TileLookup::Hit(guard) => assert_eq!(guard.get(0, 0), 0.9),
        other => panic!("unexpected lookup outcome: {:?}", other),
    }
    producer.join().unwrap();
}

#[test]
fn budget_holds_under_churn() {
    let cache = cache_with_budget(16);

    let mut handles = Vec::new();
    for t in 0..4 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let owner = OwnerId::next();
            for i in 0..32 {
                cook(&cache, key_of(owner, i, t), i as f32 / 32.0);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let stats = cache.statistics();
    assert!(
        stats.resident_bytes <= stats.max_bytes,
        "resident {} exceeds budget {}",
        stats.resident_bytes,
        stats.max_bytes
    );
    assert!(stats.evictions > 0, "128 cooks into 16 slots must evict");
}

#[test]
fn checkpoint_survives_eviction_pressure() {
    let cache = cache_with_budget(16);
    let token = ImageToken::new(OwnerId::next());

    for ty in 0..4 {
        for tx in 0..4 {
            cook(&cache, TileKey::new(token, tx, ty), 1.0);
        }
    }
    let rect = Rect::of_size((4 * TILE) as i32, (4 * TILE) as i32);
    let cp = cache.checkpoint(token, rect);
    assert!(cache.contains_rect(token, rect));

    // Four threads cook eviction fodder well past the budget.
    let mut handles = Vec::new();
    for t in 0..4 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let owner = OwnerId::next();
            for i in 0..32 {
                cook(&cache, key_of(owner, i, t), 0.25);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(
        cache.contains_rect(token, rect),
        "checkpointed tiles were evicted"
    );

    cache.uncheckpoint(cp);
    cache.clear();
    assert!(!cache.contains_rect(token, rect));
}

#[test]
fn invalidation_respects_outstanding_readers() {
    let cache = cache_with_budget(8);
    let owner = OwnerId::next();
    let other = OwnerId::next();
    let held_key = key_of(owner, 0, 0);
    let idle_key = key_of(owner, 1, 0);
    let other_key = key_of(other, 0, 0);
    cook(&cache, held_key, 0.3);
    cook(&cache, idle_key, 0.4);
    cook(&cache, other_key, 0.5);

    let guard = cache
        .fetch(held_key, spec(), true)
        .unwrap()
        .into_read()
        .unwrap();

    // The held tile survives until release; the idle one goes now.
    assert_eq!(cache.invalidate_owner(owner), 1);
    assert_eq!(guard.get(0, 0), 0.3);
    drop(guard);

    assert!(cache.fetch(held_key, spec(), false).unwrap().is_absent());
    assert!(cache.fetch(idle_key, spec(), false).unwrap().is_absent());
    assert!(cache.fetch(other_key, spec(), false).unwrap().is_hit());
}

#[test]
fn region_worker_pool_assembles() {
    fn tile_value(tx: i32, ty: i32, c: u16) -> f32 {
        tx as f32 * 0.1 + ty as f32 * 0.01 + c as f32 * 0.5
    }

    let cache = cache_with_budget(64);
    let bounds = Rect::of_size(48, 48);
    let request = RegionRequest::new(
        ImageToken::new(OwnerId::next()),
        bounds,
        bounds,
        2,
        PixelFormat::Float32,
    );
    let region = cache.acquire_region(request).unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let cache = cache.clone();
        let region = region.clone();
        handles.push(thread::spawn(move || {
            while let Some(needed) = region.next_needed_tile() {
                for c in 0..2u16 {
                    let key = region.tile_key(&needed, c);
                    match cache
                        .get_or_create(key, region.tile_spec(), true, true)
                        .unwrap()
                    {
                        TileLookup::Created(mut guard) => {
                            guard.fill(tile_value(needed.tile_x, needed.tile_y, c));
                        }
                        other => panic!("tile cooked twice: {:?}", other),
                    }
                }
                region.finished_tile(&needed);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(region.is_filled());
    let raster = region.gather(&cache).unwrap();
    for (x, y) in [(0usize, 0usize), (17, 5), (40, 40), (47, 47)] {
        for c in 0..2usize {
            let expected = tile_value((x / TILE) as i32, (y / TILE) as i32, c as u16);
            assert_eq!(raster.get(x, y, c), expected, "pixel ({x}, {y}) plane {c}");
        }
    }
    cache.retire_region(region);
}
