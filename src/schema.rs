//! Extraction data model: recognized lines, tabular records and report aggregates.

use serde::{Deserialize, Serialize};

/// Column order of the tabular export.
pub const RECORD_COLUMNS: [&str; 4] = ["file_name", "line_number", "extracted_text", "confidence"];

/// A single line recognized by the engine, already trimmed and non-blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLine {
    pub text: String,
    pub confidence: f64,
}

impl ExtractedLine {
    /// Build a line from raw engine values.
    ///
    /// Returns `None` when the trimmed text is empty. Confidence is clamped
    /// into `[0, 1]`.
    pub fn new(text: &str, confidence: f64) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

/// One row of the tabular export. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub file_name: String,
    /// 1-based, dense, in engine order.
    pub line_number: usize,
    pub extracted_text: String,
    /// Rounded to 4 decimal places.
    pub confidence: f64,
}

/// Round a confidence to the 4 decimals used in records.
pub fn round_confidence(confidence: f64) -> f64 {
    (confidence * 10_000.0).round() / 10_000.0
}

/// Coarse confidence bucket used for reporting and triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub const HIGH_ABOVE: f64 = 0.8;
    pub const LOW_BELOW: f64 = 0.6;

    /// High is strictly above 0.8, low strictly below 0.6, medium is the
    /// closed interval in between.
    pub fn classify(confidence: f64) -> Self {
        if confidence > Self::HIGH_ABOVE {
            Self::High
        } else if confidence < Self::LOW_BELOW {
            Self::Low
        } else {
            Self::Medium
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl TierCounts {
    pub fn add(&mut self, tier: ConfidenceTier) {
        match tier {
            ConfidenceTier::High => self.high += 1,
            ConfidenceTier::Medium => self.medium += 1,
            ConfidenceTier::Low => self.low += 1,
        }
    }

    pub fn get(&self, tier: ConfidenceTier) -> usize {
        match tier {
            ConfidenceTier::High => self.high,
            ConfidenceTier::Medium => self.medium,
            ConfidenceTier::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Aggregate statistics over the records of one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_lines: usize,
    /// 0 when there are no lines.
    pub average_confidence: f64,
    pub tiers: TierCounts,
}

impl Summary {
    pub fn quality(&self) -> QualityLabel {
        QualityLabel::from_average(self.average_confidence)
    }

    /// Share of lines in the high tier, 0 when empty.
    pub fn high_confidence_ratio(&self) -> f64 {
        if self.total_lines == 0 {
            0.0
        } else {
            self.tiers.high as f64 / self.total_lines as f64
        }
    }
}

/// Overall verdict on the average confidence of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Excellent,
    Good,
    Fair,
}

impl QualityLabel {
    pub fn from_average(average: f64) -> Self {
        if average > 0.8 {
            Self::Excellent
        } else if average > 0.6 {
            Self::Good
        } else {
            Self::Fair
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
        }
    }
}

/// Facts about the canonical image, shown to the user when nothing was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDiagnostics {
    pub width: u32,
    pub height: u32,
    pub pixel_count: u64,
    pub format: String,
    pub color_mode: String,
    pub sha256: String,
}
