//! medocr - text extraction from photographed or scanned medical documents.
//!
//! # Usage
//!
//! ```bash
//! medocr extract scan1.png scan2.jpg --output results/ocr_results.csv
//! medocr serve --bind 0.0.0.0:7860
//! ```

use clap::{Parser, Subcommand};
use medocr_extractor::config::PipelineConfig;
use medocr_extractor::extractor::ExtractionPipeline;
use medocr_extractor::normalizer::ImageNormalizer;
use medocr_extractor::ocr::sidecar::SidecarEngine;
use medocr_extractor::{cli, server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "medocr")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Extract text and confidence scores from medical document images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract text from one or more image files
    Extract {
        /// Image files to process, in order
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Where to write the records CSV (defaults to <output_dir>/ocr_results.csv)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Start the upload server
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "medocr=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load()?;
    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.bind = bind.clone();
    }

    let pipeline = build_pipeline(&config);
    info!(
        "Pipeline ready: engine {} via {:?}",
        pipeline.engine_name(),
        pipeline.conventions()
    );

    match cli.command {
        Commands::Extract { images, output } => {
            let output = output.unwrap_or_else(|| config.output_dir.join("ocr_results.csv"));
            let run = cli::run_extract(&pipeline, &images, &output, config.preview_lines).await?;
            info!(
                images = run.entries.len(),
                records = %run.records_path.display(),
                batch = ?run.batch_path,
                "Extraction run finished"
            );
        }
        Commands::Serve { .. } => {
            let state = server::AppState::new(Arc::new(pipeline), Arc::new(config));
            server::run(state).await?;
        }
    }

    Ok(())
}

fn build_pipeline(config: &PipelineConfig) -> ExtractionPipeline {
    let engine = SidecarEngine::new(reqwest::Client::new(), config.engine_url.clone());
    info!("Recognition sidecar at {}", engine.url());
    let normalizer = ImageNormalizer::new(config.work_dir.clone(), config.limits());
    ExtractionPipeline::new(Arc::new(engine), normalizer)
        .with_conventions(config.conventions.clone())
        .with_engine_timeout(config.engine_timeout())
}
