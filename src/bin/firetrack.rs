use anyhow::{bail, Context, Result};
use clap::Parser;
use firetrack::{
    open_store, parse_timestamp, run, BoundingBox, DetectionMethod, DetectionParams, GdalRasterDecoder, RunConfig,
    WmsConfig, WmsImageSource,
};
use std::path::PathBuf;

/// Detect and track wildfires over a region from WMS fire-temperature imagery
#[derive(Debug, Parser)]
#[command(name = "firetrack", version, about)]
struct Args {
    /// Region as lon_min,lat_min,lon_max,lat_max
    #[arg(long, value_delimiter = ',', num_args = 4, allow_hyphen_values = true, required = true)]
    bbox: Vec<f64>,

    /// Start instant (ISO-8601, UTC when no offset is given)
    #[arg(long)]
    start: String,

    /// End instant (inclusive)
    #[arg(long)]
    end: String,

    /// Fire store path (.geojson, .shp or .gpkg)
    #[arg(short, long)]
    output: PathBuf,

    #[arg(long, default_value_t = 10)]
    step_minutes: u32,

    /// Target ground sample distance in metres
    #[arg(long, default_value_t = 500.0)]
    pixel_size_m: f64,

    /// Target sub-tile size in pixels
    #[arg(long, default_value_t = 500)]
    base_px: usize,

    /// JSON file with detection parameters; flags below override it
    #[arg(long)]
    params: Option<PathBuf>,

    #[arg(long)]
    method: Option<DetectionMethod>,

    #[arg(long)]
    upscale_factor: Option<usize>,

    #[arg(long)]
    blur_sigma: Option<f32>,

    #[arg(long)]
    threshold_value: Option<f32>,

    #[arg(long)]
    tol: Option<u8>,

    #[arg(long)]
    min_area_ha: Option<f64>,

    /// Sub-tile worker threads
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    wms_url: Option<String>,

    #[arg(long)]
    layer: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn detection_params(&self) -> Result<DetectionParams> {
        let mut params = match &self.params {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read parameter file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Invalid parameter file {}", path.display()))?
            }
            None => DetectionParams::default(),
        };
        if let Some(v) = self.method {
            params.method = v;
        }
        if let Some(v) = self.upscale_factor {
            params.upscale_factor = v;
        }
        if let Some(v) = self.blur_sigma {
            params.blur_sigma = v;
        }
        if let Some(v) = self.threshold_value {
            params.threshold_value = v;
        }
        if let Some(v) = self.tol {
            params.tol = v;
        }
        if let Some(v) = self.min_area_ha {
            params.min_area_ha = v;
        }
        params.validate()?;
        Ok(params)
    }

    fn wms_config(&self) -> WmsConfig {
        let mut config = WmsConfig::default();
        if let Some(url) = &self.wms_url {
            config.url = url.clone();
        }
        if let Some(layer) = &self.layer {
            config.layer = layer.clone();
        }
        config
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.bbox.len() != 4 {
        bail!("--bbox expects exactly four values");
    }
    let region = BoundingBox::new(args.bbox[0], args.bbox[1], args.bbox[2], args.bbox[3])?;
    let start = parse_timestamp(&args.start)?;
    let end = parse_timestamp(&args.end)?;
    if start > end {
        bail!("start {} is after end {}", args.start, args.end);
    }

    let config = RunConfig {
        step_minutes: args.step_minutes,
        pixel_size_m: args.pixel_size_m,
        base_px: args.base_px,
        workers: args.workers,
        detection: args.detection_params()?,
        ..Default::default()
    };

    let source = WmsImageSource::new(args.wms_config())?;
    let decoder = GdalRasterDecoder::new();
    let store = open_store(&args.output)?;

    let summary = run(&source, &decoder, &region, start, end, store, config)
        .with_context(|| format!("Fire tracking failed for {}", args.output.display()))?;

    println!(
        "Processed {}/{} timestamps: {} detections, {} records appended, {} sub-tile failures{}",
        summary.timestamps_processed,
        summary.timestamps_total,
        summary.detections,
        summary.records_appended,
        summary.subtile_failures,
        if summary.early_stop { " (stopped early)" } else { "" }
    );
    Ok(())
}
