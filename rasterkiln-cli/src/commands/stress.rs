//! Cache stress command.
//!
//! Hammers a [`TileCache`] from worker threads with a mixed workload:
//! cooking tiles over a key space wider than the budget, re-fetching
//! recently cooked keys, and cycling checkpoints. Threads share owners
//! and coordinates, so creation races and blocking waits happen
//! constantly. Prints the cache statistics snapshot when done.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Args;
use tracing::info;

use rasterkiln::raster::PixelFormat;
use rasterkiln::{
    CacheConfig, CheckpointToken, ImageToken, OwnerId, Rect, TileCache, TileKey, TileLookup,
    TileSpec, TrimDaemon,
};

use crate::error::CliError;

#[derive(Args)]
pub struct StressArgs {
    /// Worker threads
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Tiles cooked per thread
    #[arg(long, default_value_t = 4096)]
    pub tiles_per_thread: usize,

    /// Tile edge length in pixels
    #[arg(long, default_value_t = 64)]
    pub tile_size: usize,

    /// Cache budget in mebibytes
    #[arg(long, default_value_t = 64)]
    pub budget_mib: usize,

    /// Distinct owners cycled by the workload
    #[arg(long, default_value_t = 4)]
    pub owners: usize,

    /// Checkpoint every N cooks per thread (0 disables)
    #[arg(long, default_value_t = 512)]
    pub checkpoint_every: usize,

    /// Print statistics as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the stress command.
pub fn run(args: StressArgs) -> Result<(), CliError> {
    if args.threads == 0 || args.threads > 256 {
        return Err(CliError::InvalidArgs(format!(
            "thread count {} is outside 1..=256",
            args.threads
        )));
    }
    if args.tile_size == 0 || args.owners == 0 {
        return Err(CliError::InvalidArgs(
            "tile_size and owners must be nonzero".to_string(),
        ));
    }
    let tile_bytes = args.tile_size * args.tile_size * 4;
    let budget = args.budget_mib * 1024 * 1024;
    if budget < tile_bytes * 4 {
        return Err(CliError::InvalidArgs(format!(
            "budget {} MiB holds fewer than four {}px tiles",
            args.budget_mib, args.tile_size
        )));
    }

    let cache = TileCache::new(
        CacheConfig::default()
            .with_tile_size(args.tile_size, args.tile_size)
            .with_max_bytes(budget),
    )?;
    let mut daemon = TrimDaemon::start(cache.clone(), Duration::from_millis(50));

    let tokens: Arc<Vec<ImageToken>> = Arc::new(
        (0..args.owners)
            .map(|_| ImageToken::new(OwnerId::next()))
            .collect(),
    );
    let spec = TileSpec::new(PixelFormat::Float32);

    println!(
        "Stressing {} MiB cache with {} threads x {} cooks ({}px tiles, {} owners)",
        args.budget_mib, args.threads, args.tiles_per_thread, args.tile_size, args.owners
    );
    info!(
        threads = args.threads,
        tiles_per_thread = args.tiles_per_thread,
        budget_bytes = budget,
        "starting cache stress run"
    );

    // Key space per owner: span columns by four rows, revisited as the
    // cook counter wraps. Threads run identical sequences, so the same
    // key is often wanted by several threads at once.
    let span = (args.tiles_per_thread / 16).max(1);
    let rows = 4usize;
    let tile_edge = args.tile_size as i32;
    let checkpoint_every = args.checkpoint_every;
    let per_thread = args.tiles_per_thread;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..args.threads {
        let cache = cache.clone();
        let tokens = tokens.clone();
        handles.push(thread::spawn(move || -> Result<(), CliError> {
            let key_at = |i: usize| {
                let token = tokens[i % tokens.len()];
                TileKey::new(token, (i % span) as i32, ((i / span) % rows) as i32)
            };
            let mut active: Option<CheckpointToken> = None;
            for i in 0..per_thread {
                let key = key_at(i);
                match cache.get_or_create(key, spec, true, true)? {
                    TileLookup::Created(mut guard) => {
                        guard.set_priority((i % 64) as u32);
                        guard.fill((i % 251) as f32 / 251.0);
                    }
                    TileLookup::Hit(guard) => {
                        let _ = guard.get(0, 0);
                    }
                    _ => {}
                }

                // Read traffic trailing one span behind the cook head.
                if i >= span {
                    let _ = cache.fetch(key_at(i - span), spec, false)?;
                }

                if checkpoint_every > 0 && i % checkpoint_every == 0 {
                    if let Some(token) = active.take() {
                        cache.uncheckpoint(token);
                    }
                    let rect = Rect::of_size(4 * tile_edge, tile_edge);
                    active = Some(cache.checkpoint(key_at(i).token, rect));
                }
            }
            if let Some(token) = active.take() {
                cache.uncheckpoint(token);
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| CliError::Worker("stress worker panicked".to_string()))??;
    }
    let elapsed = start.elapsed();

    // One owner's images go away at the end, like a teardown would.
    let dropped = cache.invalidate_owner(tokens[0].owner);

    daemon.shutdown();
    daemon.join();

    let total = (args.threads * args.tiles_per_thread) as f64;
    println!(
        "Finished in {:.2}s ({:.0} cooks/s), invalidated {} tiles of owner 0",
        elapsed.as_secs_f64(),
        total / elapsed.as_secs_f64().max(1e-9),
        dropped
    );
    println!();

    let stats = cache.statistics();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{}", stats.format());
    }
    Ok(())
}
