mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use likeness_core::decoder::{self, ImageSource};
use likeness_core::{
    ArtifactStore, ClassificationService, LabelMap, Rect, WaveletConfig, WaveletFamily,
    WaveletFeatureExtractor,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "likeness", about = "Face identity classification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every face in an image and print the results as JSON
    Classify {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Show the face boxes that pass the eye check
    Detect {
        /// Image file
        path: PathBuf,
    },
    /// Write the wavelet detail image of a picture
    Wavelet {
        input: PathBuf,
        output: PathBuf,
        /// Wavelet family (haar, db1..db4)
        #[arg(long, default_value = "haar")]
        family: WaveletFamily,
        /// Decomposition depth
        #[arg(long, default_value_t = 1)]
        level: usize,
    },
    /// List the known classes in id order
    Labels,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct InputArgs {
    /// Image file
    #[arg(long)]
    file: Option<PathBuf>,
    /// Base64 image, optionally prefixed with a `data:...;base64,` header
    #[arg(long)]
    payload: Option<String>,
    /// File containing a base64 payload
    #[arg(long)]
    payload_file: Option<PathBuf>,
}

impl InputArgs {
    fn into_source(self) -> Result<ImageSource> {
        if let Some(path) = self.file {
            return Ok(ImageSource::Path(path));
        }
        if let Some(payload) = self.payload {
            return Ok(ImageSource::Encoded(payload));
        }
        let path = self
            .payload_file
            .context("one of --file, --payload or --payload-file is required")?;
        let payload = std::fs::read_to_string(&path)
            .with_context(|| format!("reading payload file {}", path.display()))?;
        Ok(ImageSource::Encoded(payload))
    }
}

#[derive(Serialize)]
struct FaceReport {
    bbox: Rect,
    eyes: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Classify { input } => {
            let source = input.into_source()?;
            let service = build_service(&config)?;
            service.initialize().context("loading artifacts")?;

            let results = service.classify(&source)?;
            tracing::info!(faces = results.len(), "classification finished");
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Detect { path } => {
            let service = build_service(&config)?;
            let regions = service.detect_faces(&ImageSource::Path(path))?;
            let report: Vec<FaceReport> = regions
                .into_iter()
                .map(|r| FaceReport {
                    bbox: r.bbox,
                    eyes: r.eyes.len(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Wavelet {
            input,
            output,
            family,
            level,
        } => {
            let image = decoder::decode(&ImageSource::Path(input))?;
            let extractor = WaveletFeatureExtractor::new(&WaveletConfig { family, level })
                .with_channel_order(config.pipeline.channel_order);
            let detail: image::GrayImage = extractor.extract(&image);
            detail
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "wrote {}x{} {family} level {} detail image to {}",
                detail.width(),
                detail.height(),
                extractor.level(),
                output.display()
            );
        }
        Commands::Labels => {
            let path = config.artifact_paths().label_map;
            let labels = LabelMap::load(&path)
                .with_context(|| format!("loading label map {}", path.display()))?;
            for (id, name) in labels.iter() {
                println!("{id}\t{name}");
            }
        }
    }

    Ok(())
}

fn build_service(config: &Config) -> Result<ClassificationService> {
    let store = Arc::new(ArtifactStore::new(config.artifact_paths()));
    let cascades = config.cascade_paths();
    ClassificationService::new(&config.pipeline, &cascades, store).with_context(|| {
        format!(
            "loading cascades {} and {}",
            cascades.face.display(),
            cascades.eyes.display()
        )
    })
}
