//! CLI mode: extract text from image files on disk.

use crate::export;
use crate::extractor::ExtractionPipeline;
use crate::normalizer::{RequestSlot, SourceImage};
use crate::report::{self, BatchEntry, Report};
use crate::schema::ExtractionRecord;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BATCH_FILE_NAME: &str = "batch_summary.csv";

/// Files written by one CLI run.
#[derive(Debug)]
pub struct ExtractRun {
    pub records_path: PathBuf,
    pub batch_path: Option<PathBuf>,
    pub entries: Vec<BatchEntry>,
}

/// Process each image in turn, print its summary, then write the combined
/// records to `output`. Rejected images are reported and skipped.
pub async fn run_extract(
    pipeline: &ExtractionPipeline,
    images: &[PathBuf],
    output: &Path,
    preview_lines: usize,
) -> anyhow::Result<ExtractRun> {
    let mut records: Vec<ExtractionRecord> = Vec::new();
    let mut entries = Vec::with_capacity(images.len());

    for (i, path) in images.iter().enumerate() {
        let name = display_name(path);
        let slot = RequestSlot::new(&format!("cli-{}", i + 1));
        info!("Processing {} ({}/{})", name, i + 1, images.len());

        match pipeline.extract(SourceImage::Path(path.clone()), &slot).await {
            Ok(outcome) => {
                let report = Report::from_outcome(&outcome, &name);
                println!("{}", report.render(preview_lines));
                entries.push(BatchEntry::from_report(&report));
                records.extend(report.records);
            }
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                println!("{}", report::render_failure(&name, &e));
                entries.push(BatchEntry::rejected(&name));
            }
        }
    }

    let records_path = export::write_records(&records, output)
        .with_context(|| format!("Failed to export results for {} images", images.len()))?;
    println!("Results saved to {}", records_path.display());

    let batch_path = if images.len() > 1 {
        let target = output.with_file_name(BATCH_FILE_NAME);
        let written = export::write_batch(&entries, &target).context("Failed to export batch summary")?;
        println!("{}", report::render_batch(&entries));
        println!("Batch summary saved to {}", written.display());
        Some(written)
    } else {
        None
    };

    Ok(ExtractRun {
        records_path,
        batch_path,
        entries,
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
