//! Command-line surface, `clap`-derived.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormatArg {
    Raster,
    Vector,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VectorFormatArg {
    Svg,
    Png,
}

#[derive(Debug, Parser)]
#[command(name = "tudomesh", about = "Fuses per-robot occupancy maps into one world frame")]
pub struct Cli {
    /// Render a composite or live visualisation and exit.
    #[arg(long)]
    pub render: bool,

    /// Run alignment for every configured robot and persist the result.
    #[arg(long)]
    pub calibrate: bool,

    /// Decode each configured robot's latest snapshot and print a summary.
    #[arg(long = "parse-only")]
    pub parse_only: bool,

    /// Detect and print the rotation hint between the reference and `<id>`.
    #[arg(long = "compare-rotation", value_name = "ID")]
    pub compare_rotation: Option<String>,

    /// Print each configured robot's dominant wall angle.
    #[arg(long = "detect-rotation")]
    pub detect_rotation: bool,

    /// Run the MQTT ingress worker.
    #[arg(long)]
    pub mqtt: bool,

    /// Run the HTTP server.
    #[arg(long)]
    pub http: bool,

    #[arg(long = "http-port", default_value_t = 8080)]
    pub http_port: u16,

    /// `<id>=<deg>[,...]` seed rotation overrides for `--calibrate`.
    #[arg(long = "force-rotation", value_delimiter = ',')]
    pub force_rotation: Vec<String>,

    #[arg(long)]
    pub reference: Option<String>,

    /// Apply this rotation (degrees) to every configured robot's hint.
    #[arg(long = "rotate-all")]
    pub rotate_all: Option<f64>,

    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long = "calibration-cache")]
    pub calibration_cache: Option<PathBuf>,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormatArg::Raster)]
    pub format: OutputFormatArg,

    #[arg(long = "vector-format", value_enum, default_value_t = VectorFormatArg::Svg)]
    pub vector_format: VectorFormatArg,

    #[arg(long = "grid-spacing")]
    pub grid_spacing: Option<f64>,
}

impl Cli {
    pub fn is_one_shot_mode(&self) -> bool {
        self.render
            || self.calibrate
            || self.parse_only
            || self.compare_rotation.is_some()
            || self.detect_rotation
    }

    pub fn is_service_mode(&self) -> bool {
        self.mqtt || self.http
    }
}

/// Parses `<id>=<deg>[,...]` entries into a per-robot rotation override map.
/// An entry that doesn't split on exactly one `=` is ignored — malformed
/// `--force-rotation` entries are a usage mistake, not a fatal one.
pub fn parse_force_rotation(entries: &[String]) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for entry in entries {
        if let Some((id, deg)) = entry.split_once('=') {
            if let Ok(deg) = deg.trim().parse::<f64>() {
                out.insert(id.trim().to_string(), deg);
            }
        }
    }
    out
}
