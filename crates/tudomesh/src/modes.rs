//! One-shot CLI operations: `--parse-only`, `--calibrate`,
//! `--compare-rotation`, `--detect-rotation`, `--render`. Each works from
//! whatever per-robot snapshots already exist under `--data-dir` and exits
//! without starting the long-running MQTT/HTTP service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use tudomesh_core::features;
use tudomesh_core::icp::{self, IcpConfig};
use tudomesh_core::map::OccupancyMap;
use tudomesh_render::{Color, MapLayer, RenderOptions};

use crate::align;
use crate::cli::{Cli, OutputFormatArg, VectorFormatArg};
use crate::context::AppContext;
use crate::snapshot;

fn load_latest(context: &Arc<AppContext>, vacuum_id: &str) -> Option<OccupancyMap> {
    let path = snapshot::latest_snapshot_path(&context.data_dir, vacuum_id)?;
    snapshot::load_snapshot(&path).ok()
}

pub fn run_parse_only(context: &Arc<AppContext>) -> anyhow::Result<()> {
    for vacuum in &context.config.vacuums {
        match load_latest(context, &vacuum.id) {
            Some(map) => println!(
                "{}: {} layers, {} entities, {} total pixels",
                vacuum.id,
                map.layers.len(),
                map.entities.len(),
                map.total_layer_area(),
            ),
            None => println!("{}: no snapshot found", vacuum.id),
        }
    }
    Ok(())
}

pub fn run_detect_rotation(context: &Arc<AppContext>) -> anyhow::Result<()> {
    for vacuum in &context.config.vacuums {
        let Some(map) = load_latest(context, &vacuum.id) else {
            println!("{}: no snapshot found", vacuum.id);
            continue;
        };
        let extracted = features::extract(&map);
        match extracted.dominant_angles(1).first() {
            Some(angle) => println!("{}: dominant wall angle ~{:.1} deg", vacuum.id, angle),
            None => println!("{}: no wall features to derive a rotation from", vacuum.id),
        }
    }
    Ok(())
}

pub fn run_compare_rotation(context: &Arc<AppContext>, target_id: &str) -> anyhow::Result<()> {
    let reference_id = context.reference_id();
    let reference_map = load_latest(context, &reference_id)
        .ok_or_else(|| anyhow::anyhow!("no snapshot for reference robot {reference_id}"))?;
    let target_map = load_latest(context, target_id)
        .ok_or_else(|| anyhow::anyhow!("no snapshot for {target_id}"))?;

    let source_features = features::extract(&target_map);
    let target_features = features::extract(&reference_map);
    let result = icp::solve(&source_features, &target_features, &IcpConfig::default())?;
    println!(
        "{target_id} vs {reference_id}: rotation {:.2} deg, score {:.3}, converged={}",
        result.transform.rotation_angle_rad().to_degrees(),
        result.score,
        result.converged,
    );
    Ok(())
}

pub fn run_calibrate(
    context: &Arc<AppContext>,
    force_rotation: &HashMap<String, f64>,
) -> anyhow::Result<()> {
    let reference_id = context.reference_id();
    for vacuum in &context.config.vacuums {
        let Some(map) = load_latest(context, &vacuum.id) else {
            println!("{}: no snapshot, skipped", vacuum.id);
            continue;
        };
        context.set_map(&vacuum.id, map.clone());
        if vacuum.id == reference_id {
            println!("{}: is the reference robot, identity stored", vacuum.id);
            continue;
        }

        let mut icp_config = IcpConfig::default();
        if let Some(hint) = force_rotation.get(&vacuum.id).or(vacuum.rotation.as_ref()) {
            icp_config.initial_rotation_hint_deg = Some(*hint);
        }

        match align::recalibrate(context, &vacuum.id, &map, &icp_config) {
            Ok(()) => println!("{}: calibrated", vacuum.id),
            Err(e) => println!("{}: calibration failed: {e}", vacuum.id),
        }
    }
    Ok(())
}

pub fn run_render(context: &Arc<AppContext>, cli: &Cli) -> anyhow::Result<()> {
    for vacuum in &context.config.vacuums {
        if let Some(map) = load_latest(context, &vacuum.id) {
            context.set_map(&vacuum.id, map);
        }
    }

    let reference_id = context.reference_id();
    let mut entries: Vec<(String, OccupancyMap, tudomesh_core::geometry::AffineMatrix)> =
        Vec::new();
    for id in std::iter::once(reference_id.clone()).chain(
        context
            .config
            .vacuums
            .iter()
            .map(|v| v.id.clone())
            .filter(|id| id != &reference_id),
    ) {
        if let Some(map) = context.map_snapshot(&id) {
            let (transform, _) = context.get_transform(&id);
            entries.push((id, map, transform));
        }
    }

    if entries.is_empty() {
        anyhow::bail!("no snapshots available to render");
    }

    let layers: Vec<MapLayer> = entries
        .iter()
        .map(|(id, map, transform)| {
            let color = context
                .config
                .vacuums
                .iter()
                .find(|v| &v.id == id)
                .and_then(|v| v.color.as_deref())
                .and_then(Color::from_hex)
                .unwrap_or(Color::DEFAULT_WALL);
            MapLayer {
                vacuum_id: id,
                map,
                transform: *transform,
                color,
            }
        })
        .collect();

    let opts = RenderOptions {
        grid_spacing_mm: cli.grid_spacing.or(context.config.grid_spacing),
        ..Default::default()
    };

    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("tudomesh-render"));

    match cli.format {
        OutputFormatArg::Raster => write_raster(&layers, &opts, &with_ext(&output_path, "png"))?,
        OutputFormatArg::Vector => {
            write_vector(&layers, &opts, &with_ext(&output_path, "svg"), cli.vector_format)?
        }
        OutputFormatArg::Both => {
            write_raster(&layers, &opts, &with_ext(&output_path, "png"))?;
            write_vector(&layers, &opts, &with_ext(&output_path, "svg"), cli.vector_format)?;
        }
    }

    Ok(())
}

fn with_ext(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext)
}

fn write_raster(layers: &[MapLayer], opts: &RenderOptions, path: &Path) -> anyhow::Result<()> {
    let image = tudomesh_render::render_composite(layers, opts)?;
    std::fs::write(path, image.encode_png()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn write_vector(
    layers: &[MapLayer],
    opts: &RenderOptions,
    path: &Path,
    format: VectorFormatArg,
) -> anyhow::Result<()> {
    match format {
        VectorFormatArg::Svg => {
            let doc = tudomesh_render::render_composite_vector(layers, opts)?;
            std::fs::write(path, doc.into_string())
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        VectorFormatArg::Png => write_raster(layers, opts, path)?,
    }
    Ok(())
}
