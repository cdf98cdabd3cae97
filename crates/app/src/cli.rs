use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use video_ingest::Resolution;
use vision::{
    DetectionClient, DetectionService, HttpDetectionService, OverlayRenderer, TelemetryOptions,
    pipeline::telemetry, sampler,
};

use crate::{
    config::{ServiceArgs, VisionCliArgs, VisionConfig},
    live,
};

#[derive(Debug, Parser)]
#[command(name = "skipq-live", version, about = "Live shelf detection with an annotated preview")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Open the camera, run the detection loop and serve the preview.
    Run(VisionCliArgs),
    /// Send a single image to the detection service and print the detections.
    Detect(DetectArgs),
    /// Query the detection service health endpoint.
    Health(ServiceArgs),
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    /// Image to analyse (any format the `image` crate decodes).
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
    #[command(flatten)]
    pub service: ServiceArgs,
    /// Write the image with detections drawn on top to this path.
    #[arg(long = "overlay", value_name = "PATH")]
    pub overlay: Option<PathBuf>,
    /// JPEG quality used when uploading the image (1-100).
    #[arg(long = "jpeg-quality", default_value_t = 90)]
    pub jpeg_quality: u8,
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => {
            let config = VisionConfig::try_from(args)?;
            let _guard = telemetry::init_tracing(&config.telemetry)?;
            live::run(config)
        }
        Commands::Detect(args) => {
            let _guard = telemetry::init_tracing(&quiet_telemetry())?;
            detect(args)
        }
        Commands::Health(args) => {
            let _guard = telemetry::init_tracing(&quiet_telemetry())?;
            health(args)
        }
    }
}

/// One-shot commands print results on stdout and keep logging to warnings.
fn quiet_telemetry() -> TelemetryOptions {
    TelemetryOptions {
        chrome_trace_path: None,
        default_filter: Some("warn".to_string()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn detect(args: DetectArgs) -> Result<()> {
    if !(1..=100).contains(&args.jpeg_quality) {
        anyhow::bail!("--jpeg-quality must be an integer between 1 and 100");
    }
    let (url, timeout) = args.service.validate()?;
    let mut rgb = image::open(&args.image)
        .with_context(|| format!("failed to decode {}", args.image.display()))?
        .to_rgb8();
    let jpeg = sampler::encode_jpeg(&rgb, args.jpeg_quality)?;

    let service = HttpDetectionService::new(url, timeout)?;
    let detections = runtime()?.block_on(service.detect(jpeg.into()))?;
    println!("{}", serde_json::to_string_pretty(&detections)?);

    if let Some(path) = args.overlay {
        let mut renderer = OverlayRenderer::new(Resolution::new(rgb.width(), rgb.height()));
        renderer.render(&detections);
        renderer.composite_onto(&mut rgb)?;
        rgb.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        eprintln!("annotated image written to {}", path.display());
    }
    Ok(())
}

fn health(args: ServiceArgs) -> Result<()> {
    let (url, timeout) = args.validate()?;
    let client = DetectionClient::new(std::sync::Arc::new(HttpDetectionService::new(
        url, timeout,
    )?));
    let status = runtime()?.block_on(client.health());
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
