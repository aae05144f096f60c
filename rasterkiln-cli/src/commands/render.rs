//! Adaptive render command.
//!
//! Drives an [`AdaptiveImage`] over a procedural test scene with a
//! worker pool until every pixel converges, then writes the beauty
//! plane as a PNG. The scene is a smooth gradient with a heavily noisy
//! disk in the middle, so the effort heatmap shows the sampler
//! concentrating where the variance is.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Args;
use tracing::info;

use rasterkiln::{AdaptiveConfig, AdaptiveImage, AdaptivePlane, PixelFilter};

use crate::error::CliError;

/// Pyramid memory grows with the padded square, so keep the canvas
/// within reason.
const MAX_EDGE: usize = 4096;

#[derive(Args)]
pub struct RenderArgs {
    /// Output PNG path
    #[arg(long, default_value = "render.png")]
    pub output: PathBuf,

    /// Image width in pixels
    #[arg(long, default_value_t = 512)]
    pub width: usize,

    /// Image height in pixels
    #[arg(long, default_value_t = 512)]
    pub height: usize,

    /// Minimum samples per pixel
    #[arg(long, default_value_t = 4)]
    pub min_samples: u32,

    /// Maximum samples per pixel
    #[arg(long, default_value_t = 64)]
    pub max_samples: u32,

    /// Relative noise level below which a pixel stops sampling
    #[arg(long, default_value_t = 0.02)]
    pub noise_threshold: f64,

    /// Worker threads
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Base seed for the sample stream
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Also write the sample-count heatmap next to the output
    #[arg(long)]
    pub debug_views: bool,
}

/// Run the render command.
pub fn run(args: RenderArgs) -> Result<(), CliError> {
    if args.width == 0 || args.width > MAX_EDGE || args.height == 0 || args.height > MAX_EDGE {
        return Err(CliError::InvalidArgs(format!(
            "image size {}x{} is outside 1..={}",
            args.width, args.height, MAX_EDGE
        )));
    }
    if args.threads == 0 || args.threads > 256 {
        return Err(CliError::InvalidArgs(format!(
            "thread count {} is outside 1..=256",
            args.threads
        )));
    }

    let config = AdaptiveConfig::new(args.width, args.height)
        .with_samples(args.min_samples, args.max_samples)
        .with_noise_threshold(args.noise_threshold);
    let planes = vec![
        AdaptivePlane::new("beauty", 3, PixelFilter::Mean).with_variance_tracking(true),
        AdaptivePlane::new("counts", 1, PixelFilter::SampleCount),
    ];
    let image = Arc::new(AdaptiveImage::new(config, planes)?);

    println!(
        "Rendering {}x{} with {} workers ({}..={} samples per pixel)",
        args.width, args.height, args.threads, args.min_samples, args.max_samples
    );
    info!(
        width = args.width,
        height = args.height,
        threads = args.threads,
        "starting adaptive render"
    );

    let start = Instant::now();
    let seeds = Arc::new(AtomicU64::new(args.seed));
    let scene_seed = args.seed;
    let (width, height) = (args.width, args.height);

    let mut handles = Vec::new();
    for _ in 0..args.threads {
        let image = image.clone();
        let seeds = seeds.clone();
        handles.push(thread::spawn(move || -> Result<(), CliError> {
            loop {
                let seed = seeds.fetch_add(1, Ordering::Relaxed);
                match image.sample(seed) {
                    Some(s) => {
                        let rgb = scene_value(s.x, s.y, width, height, s.sample_index, scene_seed);
                        let values = [rgb[0], rgb[1], rgb[2], 0.0];
                        image.insert(s.x, s.y, s.sample_index, &values)?;
                    }
                    None => {
                        // Inserts still in flight elsewhere can re-arm
                        // pixels; only a drained image is finished.
                        if image.pending_samples() == 0 {
                            return Ok(());
                        }
                        thread::yield_now();
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| CliError::Worker("render worker panicked".to_string()))??;
    }
    let elapsed = start.elapsed();

    let committed = image.total_committed();
    let pixels = (args.width * args.height) as f64;
    println!(
        "Converged in {:.2}s: {} samples ({:.2} avg per pixel, {:.0}/s)",
        elapsed.as_secs_f64(),
        committed,
        committed as f64 / pixels,
        committed as f64 / elapsed.as_secs_f64().max(1e-9),
    );

    write_beauty(&image, &args.output)?;
    println!("✓ Wrote {}", args.output.display());

    if args.debug_views {
        let counts_path = args.output.with_extension("counts.png");
        write_counts(&image, args.max_samples, &counts_path)?;
        println!("✓ Wrote {}", counts_path.display());
    }
    Ok(())
}

/// Smooth color gradient plus a noisy center disk.
fn scene_value(
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    slot: u32,
    seed: u64,
) -> [f32; 3] {
    let u = (x as f32 + 0.5) / width as f32;
    let v = (y as f32 + 0.5) / height as f32;
    let mut rgb = [u, v, 1.0 - 0.5 * (u + v)];

    let dx = u - 0.5;
    let dy = v - 0.5;
    if dx * dx + dy * dy < 0.09 {
        for (c, value) in rgb.iter_mut().enumerate() {
            let key = ((x as u64) << 40) | ((y as u64) << 20) | ((slot as u64) << 2) | c as u64;
            let n = hash01(key, seed);
            *value = (*value + (n - 0.5) * 0.7).clamp(0.0, 1.0);
        }
    }
    rgb
}

/// Deterministic hash to [0, 1).
fn hash01(key: u64, seed: u64) -> f32 {
    let mut h = key ^ seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    (h % 1_000_003) as f32 / 1_000_003.0
}

fn write_beauty(image: &AdaptiveImage, path: &Path) -> Result<(), CliError> {
    let mean = image.filter_plane(0)?;
    let mut out = image::RgbImage::new(image.width() as u32, image.height() as u32);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let r = to_u8(mean.get(x as usize, y as usize, 0));
        let g = to_u8(mean.get(x as usize, y as usize, 1));
        let b = to_u8(mean.get(x as usize, y as usize, 2));
        *px = image::Rgb([r, g, b]);
    }
    out.save(path)?;
    Ok(())
}

fn write_counts(image: &AdaptiveImage, max_samples: u32, path: &Path) -> Result<(), CliError> {
    let counts = image.filter_plane(1)?;
    let scale = 255.0 / max_samples.max(1) as f32;
    let mut out = image::GrayImage::new(image.width() as u32, image.height() as u32);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let n = counts.get(x as usize, y as usize, 0);
        *px = image::Luma([(n * scale).round().clamp(0.0, 255.0) as u8]);
    }
    out.save(path)?;
    Ok(())
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}
