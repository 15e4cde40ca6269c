//! Turns extracted lines into tabular records and a human-readable report.
//!
//! Nothing here performs I/O; see [`crate::export`] for persistence.

use crate::extractor::{ExtractError, ExtractionOutcome};
use crate::normalizer::NormalizeError;
use crate::schema::{
    round_confidence, ConfidenceTier, ExtractedLine, ExtractionRecord, ImageDiagnostics, Summary,
    TierCounts,
};
use serde::Serialize;
use std::fmt::Write as _;

pub const DEFAULT_PREVIEW_LINES: usize = 10;

const SUGGESTIONS: [&str; 5] = [
    "Make sure the document is evenly lit, without glare or shadows.",
    "Increase contrast between the text and the background.",
    "Photograph the page straight on so lines are not skewed or rotated.",
    "Use a plain background and crop away surrounding clutter.",
    "Use a higher resolution image where the text is clearly legible.",
];

/// Enumerate lines into records and aggregate their statistics.
pub fn build(lines: &[ExtractedLine], source_name: &str) -> (Vec<ExtractionRecord>, Summary) {
    let records: Vec<ExtractionRecord> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| ExtractionRecord {
            file_name: source_name.to_string(),
            line_number: i + 1,
            extracted_text: line.text.clone(),
            confidence: round_confidence(line.confidence),
        })
        .collect();

    let mut tiers = TierCounts::default();
    let mut sum = 0.0;
    for record in &records {
        tiers.add(ConfidenceTier::classify(record.confidence));
        sum += record.confidence;
    }

    let total_lines = records.len();
    let average_confidence = if total_lines == 0 {
        0.0
    } else {
        sum / total_lines as f64
    };

    let summary = Summary {
        total_lines,
        average_confidence,
        tiers,
    };
    (records, summary)
}

/// Records and summary for one image.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub source_name: String,
    pub records: Vec<ExtractionRecord>,
    pub summary: Summary,
    /// Present when no text was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ImageDiagnostics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempt_notes: Vec<String>,
}

impl Report {
    pub fn from_outcome(outcome: &ExtractionOutcome, source_name: &str) -> Self {
        let (records, summary) = build(&outcome.lines, source_name);
        let empty = outcome.is_empty();
        Self {
            source_name: source_name.to_string(),
            records,
            summary,
            diagnostics: empty.then(|| outcome.diagnostics.clone()),
            attempt_notes: if empty {
                outcome.failures.iter().map(|f| f.describe()).collect()
            } else {
                Vec::new()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render the multi-paragraph plain-text report.
    pub fn render(&self, preview_lines: usize) -> String {
        if self.is_empty() {
            return self.render_empty();
        }

        let summary = &self.summary;
        let mut out = String::new();
        let _ = writeln!(out, "Extraction report for {}", self.source_name);
        let _ = writeln!(out, "Recognized lines: {}", summary.total_lines);
        let _ = writeln!(
            out,
            "Average confidence: {:.3} ({})",
            summary.average_confidence,
            summary.quality().label()
        );
        out.push('\n');

        let _ = writeln!(out, "Confidence breakdown:");
        for (tier, rule) in [
            (ConfidenceTier::High, "> 0.8"),
            (ConfidenceTier::Medium, "0.6 - 0.8"),
            (ConfidenceTier::Low, "< 0.6"),
        ] {
            let count = summary.tiers.get(tier);
            let _ = writeln!(
                out,
                "  {:<6} ({:>9}): {:>4} ({:.1}%)",
                tier.label(),
                rule,
                count,
                percentage(count, summary.tiers.total())
            );
        }
        out.push('\n');

        let _ = writeln!(out, "Preview:");
        for record in self.records.iter().take(preview_lines) {
            let _ = writeln!(
                out,
                "  {:>3}. {} (confidence {:.3})",
                record.line_number, record.extracted_text, record.confidence
            );
        }
        if self.records.len() > preview_lines {
            let _ = writeln!(out, "  ... and {} more lines", self.records.len() - preview_lines);
        }

        out
    }

    fn render_empty(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "No text was found in {}.", self.source_name);
        out.push('\n');

        if let Some(d) = &self.diagnostics {
            let _ = writeln!(out, "Image details:");
            let _ = writeln!(out, "  Size: {}x{} ({} pixels)", d.width, d.height, d.pixel_count);
            let _ = writeln!(out, "  Format: {}, mode: {}", d.format, d.color_mode);
            out.push('\n');
        }

        if !self.attempt_notes.is_empty() {
            let _ = writeln!(out, "Recognition attempts:");
            for note in &self.attempt_notes {
                let _ = writeln!(out, "  - {}", note);
            }
            out.push('\n');
        }

        let _ = writeln!(out, "Suggestions:");
        for suggestion in SUGGESTIONS {
            let _ = writeln!(out, "  - {}", suggestion);
        }
        out
    }
}

/// Plain-language message for a request that could not be processed.
pub fn render_failure(source_name: &str, error: &ExtractError) -> String {
    let reason = match error {
        ExtractError::Normalize(NormalizeError::ImageTooSmall {
            width,
            height,
            min_width,
            min_height,
        }) => format!(
            "The image is too small to read ({}x{} pixels). Please upload an image at least {}x{} pixels.",
            width, height, min_width, min_height
        ),
        ExtractError::Normalize(NormalizeError::UnsupportedInputType(detail)) => format!(
            "This file is not a supported image ({}). Please upload a PNG or JPEG photo or scan.",
            detail
        ),
        ExtractError::Normalize(NormalizeError::UnsupportedChannelLayout { channels }) => format!(
            "The image has {} color channels; only RGB or RGBA images are supported.",
            channels
        ),
        ExtractError::Normalize(NormalizeError::Unreadable(detail)) => {
            format!("The image could not be read ({}). It may be damaged.", detail)
        }
        other => format!("The image could not be processed: {}", other),
    };
    format!("Could not process {}.\n\n{}\n", source_name, reason)
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

// ============================================================================
// Batch summaries
// ============================================================================

/// One row of the batch summary table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEntry {
    pub file_name: String,
    pub total_lines: usize,
    pub average_confidence: f64,
    pub high_confidence_ratio: f64,
    pub status: String,
}

pub const BATCH_COLUMNS: [&str; 5] = [
    "file_name",
    "total_lines",
    "average_confidence",
    "high_confidence_ratio",
    "status",
];

impl BatchEntry {
    pub fn from_report(report: &Report) -> Self {
        Self {
            file_name: report.source_name.clone(),
            total_lines: report.summary.total_lines,
            average_confidence: round_confidence(report.summary.average_confidence),
            high_confidence_ratio: round_confidence(report.summary.high_confidence_ratio()),
            status: if report.is_empty() { "empty" } else { "ok" }.to_string(),
        }
    }

    pub fn rejected(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            total_lines: 0,
            average_confidence: 0.0,
            high_confidence_ratio: 0.0,
            status: "rejected".to_string(),
        }
    }
}

/// Overview paragraph for a batch. Averages only cover images with text.
pub fn render_batch(entries: &[BatchEntry]) -> String {
    let with_text: Vec<&BatchEntry> = entries.iter().filter(|e| e.total_lines > 0).collect();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Batch: {} images, {} with text, {} lines in total",
        entries.len(),
        with_text.len(),
        entries.iter().map(|e| e.total_lines).sum::<usize>()
    );
    if !with_text.is_empty() {
        let n = with_text.len() as f64;
        let average = with_text.iter().map(|e| e.average_confidence).sum::<f64>() / n;
        let high = with_text.iter().map(|e| e.high_confidence_ratio).sum::<f64>() / n;
        let _ = writeln!(out, "Overall average confidence: {:.3}", average);
        let _ = writeln!(out, "High-confidence share: {:.1}%", high * 100.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{AttemptFailure, FailedAttempt};
    use crate::ocr::{CallingConvention, EngineError};
    use std::time::Duration;

    fn lines(pairs: &[(&str, f64)]) -> Vec<ExtractedLine> {
        pairs
            .iter()
            .filter_map(|(t, c)| ExtractedLine::new(t, *c))
            .collect()
    }

    fn diagnostics() -> ImageDiagnostics {
        ImageDiagnostics {
            width: 400,
            height: 200,
            pixel_count: 80_000,
            format: "PNG".to_string(),
            color_mode: "RGB".to_string(),
            sha256: "0".repeat(64),
        }
    }

    #[test]
    fn test_build_mixed_script_scenario() {
        let (records, summary) = build(&lines(&[("Hypertension", 0.92), ("高血压", 0.88)]), "scan.png");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line_number, 1);
        assert_eq!(records[1].line_number, 2);
        assert_eq!(records[1].extracted_text, "高血压");
        assert_eq!(records[1].file_name, "scan.png");
        assert!((summary.average_confidence - 0.90).abs() < 1e-9);
        assert_eq!(summary.tiers, TierCounts { high: 2, medium: 0, low: 0 });
    }

    #[test]
    fn test_build_empty_never_divides_by_zero() {
        let (records, summary) = build(&[], "blank.png");
        assert!(records.is_empty());
        assert_eq!(summary.total_lines, 0);
        assert_eq!(summary.average_confidence, 0.0);
        assert_eq!(summary.tiers.total(), 0);
    }

    #[test]
    fn test_records_round_confidence_and_keep_order() {
        let (records, summary) = build(
            &lines(&[("Z last", 0.123456), ("A first", 0.8), ("M", 0.6)]),
            "x.png",
        );
        assert_eq!(records[0].extracted_text, "Z last");
        assert_eq!(records[0].confidence, 0.1235);
        assert_eq!(summary.tiers, TierCounts { high: 0, medium: 2, low: 1 });
    }

    #[test]
    fn test_render_contains_breakdown_and_preview() {
        let outcome = ExtractionOutcome {
            lines: lines(&[("Patient: Zhang San", 0.95), ("Diagnosis", 0.7), ("??", 0.3)]),
            convention: Some(CallingConvention::Predict),
            shapes: Vec::new(),
            failures: Vec::new(),
            diagnostics: diagnostics(),
            elapsed: Duration::ZERO,
        };
        let report = Report::from_outcome(&outcome, "doc.png");
        assert!(report.diagnostics.is_none());

        let text = report.render(2);
        assert!(text.contains("Recognized lines: 3"));
        assert!(text.contains("Average confidence: 0.650 (good)"));
        assert!(text.contains("high"));
        assert!(text.contains("Patient: Zhang San"));
        assert!(!text.contains("??"));
        assert!(text.contains("... and 1 more lines"));
    }

    #[test]
    fn test_render_empty_has_diagnostics_and_suggestions() {
        let outcome = ExtractionOutcome {
            lines: Vec::new(),
            convention: None,
            shapes: Vec::new(),
            failures: vec![FailedAttempt {
                convention: CallingConvention::Ocr,
                failure: AttemptFailure::Engine(EngineError::Invocation("boom".to_string())),
            }],
            diagnostics: diagnostics(),
            elapsed: Duration::ZERO,
        };
        let report = Report::from_outcome(&outcome, "dark.jpg");
        let text = report.render(DEFAULT_PREVIEW_LINES);

        assert!(text.starts_with("No text was found in dark.jpg."));
        assert!(text.contains("400x200 (80000 pixels)"));
        assert!(text.contains("ocr: engine invocation failed: boom"));
        assert!(text.contains("contrast"));
        assert!(text.contains("skewed"));
    }

    #[test]
    fn test_render_failure_mentions_dimensions() {
        let err = ExtractError::Normalize(NormalizeError::ImageTooSmall {
            width: 99,
            height: 50,
            min_width: 100,
            min_height: 50,
        });
        let text = render_failure("tiny.png", &err);
        assert!(text.contains("99x50"));
        assert!(text.contains("100x50"));
    }

    #[test]
    fn test_batch_entries_and_overview() {
        let outcome = ExtractionOutcome {
            lines: lines(&[("a", 0.9), ("b", 0.7)]),
            convention: Some(CallingConvention::Predict),
            shapes: Vec::new(),
            failures: Vec::new(),
            diagnostics: diagnostics(),
            elapsed: Duration::ZERO,
        };
        let report = Report::from_outcome(&outcome, "a.png");
        let entries = vec![BatchEntry::from_report(&report), BatchEntry::rejected("b.png")];

        assert_eq!(entries[0].status, "ok");
        assert_eq!(entries[0].high_confidence_ratio, 0.5);
        assert_eq!(entries[1].status, "rejected");

        let text = render_batch(&entries);
        assert!(text.contains("2 images, 1 with text, 2 lines"));
        assert!(text.contains("Overall average confidence: 0.800"));
    }
}
