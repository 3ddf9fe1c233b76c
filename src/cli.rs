use std::env;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context as _, bail};
use indicatif::ProgressBar;
use pointbvh::{
    BvhSettings, MemoryArena, PointBvh, SplitMethod, TraversalStack,
    geometry::{Ray, WorldPoint, WorldVector},
};
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};
use rand_distr::{Distribution as _, Normal, UnitSphere};
use tracing_subscriber::EnvFilter;

struct Options {
    point_count: usize,
    cluster_count: usize,
    ray_count: usize,
    max_leaves: usize,
    radius: f32,
    seed: u64,
    settings: BvhSettings,
    gpu_out: Option<PathBuf>,
    dump_tree: bool,
    verbose: bool,
}

const USAGE: &str = "Usage: pointbvh-cli [options]

Builds a BVH over a random clustered point cloud and casts random rays into it.

Options:
  --points N          number of points (default 100000)
  --clusters N        number of point clusters (default 32)
  --rays N            number of rays to cast (default 10000)
  --max-leaves N      leaves visited per ray, 0 for all (default 0)
  --radius R          point search radius around rays (default 0.5)
  --seed N            random seed (default 0)
  --method M          split method: sah, middle, equal (default middle)
  --voxel-length L    leaf box padding (default 0.5)
  --min-bound L       leaf size threshold (default 1.0)
  --arena-mib N       arena block size in MiB (default 128)
  --gpu-out PATH      write the GPU node buffer to PATH
  --dump-tree         print every node
  -v, --verbose       debug logging";

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut options = Options {
        point_count: 100_000,
        cluster_count: 32,
        ray_count: 10_000,
        max_leaves: 0,
        radius: 0.5,
        seed: 0,
        settings: BvhSettings::default(),
        gpu_out: None,
        dump_tree: false,
        verbose: false,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .with_context(|| format!("Missing value for {arg}"))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-v" | "--verbose" => options.verbose = true,
            "--dump-tree" => options.dump_tree = true,
            "--points" => options.point_count = value()?.parse()?,
            "--clusters" => options.cluster_count = value()?.parse()?,
            "--rays" => options.ray_count = value()?.parse()?,
            "--max-leaves" => options.max_leaves = value()?.parse()?,
            "--radius" => options.radius = value()?.parse()?,
            "--seed" => options.seed = value()?.parse()?,
            "--voxel-length" => options.settings.voxel_length = value()?.parse()?,
            "--min-bound" => options.settings.min_bound_length = value()?.parse()?,
            "--arena-mib" => options.settings.arena_block_size_mib = value()?.parse()?,
            "--gpu-out" => options.gpu_out = Some(value()?.into()),
            "--method" => {
                options.settings.split_method = match value()?.as_str() {
                    "sah" => SplitMethod::Sah,
                    "middle" => SplitMethod::Middle,
                    "equal" => SplitMethod::EqualCounts,
                    other => bail!("Unknown split method {other:?}"),
                }
            }
            other => bail!("Unknown argument {other:?}\n\n{USAGE}"),
        }
    }

    if options.cluster_count == 0 {
        bail!("At least one cluster is needed");
    }

    Ok(Some(options))
}

/// Points scattered normally around uniformly placed cluster centers.
fn clustered_cloud(
    rng: &mut SmallRng,
    point_count: usize,
    cluster_count: usize,
) -> anyhow::Result<Vec<WorldPoint>> {
    let centers: Vec<WorldPoint> = (0..cluster_count)
        .map(|_| {
            WorldPoint::new(
                rng.random_range(-100.0..100.0),
                rng.random_range(-100.0..100.0),
                rng.random_range(-100.0..100.0),
            )
        })
        .collect();
    let spread = Normal::new(0.0f32, 3.0)?;

    Ok((0..point_count)
        .map(|i| {
            let center = centers[i % cluster_count];
            center + WorldVector::from_fn(|_, _| spread.sample(rng))
        })
        .collect())
}

fn main() -> anyhow::Result<()> {
    let Some(options) = parse_args()? else {
        println!("{USAGE}");
        return Ok(());
    };

    let default_level = if options.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut rng = SmallRng::seed_from_u64(options.seed);
    let points = clustered_cloud(&mut rng, options.point_count, options.cluster_count)?;

    let mut arena = MemoryArena::with_block_size_mib(options.settings.arena_block_size_mib);
    let start = Instant::now();
    let bvh = PointBvh::build_in(&points, &options.settings, &mut arena)?;
    println!("Built in {:.3} s", start.elapsed().as_secs_f32());
    println!("{}", bvh.statistics());

    if options.dump_tree {
        bvh.write_tree(&mut std::io::stdout().lock())?;
    }

    let mut stack = TraversalStack::new();
    let mut leaves_hit = 0;
    let mut points_found = 0;
    let bar = ProgressBar::new(options.ray_count as u64);
    let start = Instant::now();
    for _ in 0..options.ray_count {
        let origin = WorldPoint::new(
            rng.random_range(-150.0..150.0),
            rng.random_range(-150.0..150.0),
            rng.random_range(-150.0..150.0),
        );
        let direction: [f32; 3] = UnitSphere.sample(&mut rng);
        let ray = Ray::new(origin, direction.into());

        leaves_hit += bvh
            .intersect_leaves(&ray, options.max_leaves, &mut stack)?
            .len();
        points_found += bvh
            .search_points(&points, &ray, options.max_leaves, options.radius, &mut stack)?
            .len();
        bar.inc(1);
    }
    bar.finish_and_clear();

    let elapsed = start.elapsed().as_secs_f32();
    println!(
        "{} rays in {:.3} s ({:.0} rays/s), {:.2} leaves and {:.2} points per ray",
        options.ray_count,
        elapsed,
        options.ray_count as f32 / elapsed,
        leaves_hit as f32 / options.ray_count.max(1) as f32,
        points_found as f32 / options.ray_count.max(1) as f32,
    );

    if let Some(path) = &options.gpu_out {
        let bytes = bvh.gpu_bytes()?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("Writing GPU nodes to {}", path.display()))?;
        println!("Wrote {} bytes to {}", bytes.len(), path.display());
    }

    Ok(())
}
