//! Recognition engine boundary.
//!
//! Defines the [`RecognitionEngine`] trait, the calling conventions an engine
//! may support, and the opaque [`EngineOutput`] value it hands back. The
//! shape of that value is not stable across engine versions; see
//! [`crate::adapter`] for how it is normalized.

pub mod sidecar;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// One way of invoking the engine's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    /// Batch `predict` call, newest engines.
    Predict,
    /// Legacy `ocr` call.
    Ocr,
    /// Invoke the engine directly with the image payload.
    Direct,
}

impl CallingConvention {
    /// Fallback order used when nothing is configured.
    pub const DEFAULT_ORDER: [CallingConvention; 3] = [Self::Predict, Self::Ocr, Self::Direct];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Predict => "predict",
            Self::Ocr => "ocr",
            Self::Direct => "direct",
        }
    }

    /// Parse a config string into a convention.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "predict" => Some(Self::Predict),
            "ocr" => Some(Self::Ocr),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A page result exposing parallel recognized texts and scores as accessors.
pub trait RecognizedPage: fmt::Debug + Send + Sync {
    fn rec_texts(&self) -> Option<&[String]>;
    fn rec_scores(&self) -> Option<&[f64]>;
}

/// Whatever the engine returned, before normalization.
#[derive(Debug)]
pub enum EngineOutput {
    /// A JSON-like value (mappings, sequences, legacy nested lists).
    Json(serde_json::Value),
    /// A typed page object with attribute access.
    Page(Box<dyn RecognizedPage>),
    /// Several results, usually one per page.
    Pages(Vec<EngineOutput>),
}

impl From<serde_json::Value> for EngineOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine '{engine}' does not support the {convention} convention")]
    Unsupported {
        engine: String,
        convention: CallingConvention,
    },

    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine invocation failed: {0}")]
    Invocation(String),
}

/// The external recognition engine. Constructed once at start-up and shared
/// by every request; the pipeline issues one call at a time.
#[async_trait::async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the installed engine version offers `convention` at all.
    fn supports(&self, _convention: CallingConvention) -> bool {
        true
    }

    /// Run recognition on the canonical image at `image`.
    async fn invoke(
        &self,
        convention: CallingConvention,
        image: &Path,
    ) -> Result<EngineOutput, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convention_names() {
        for convention in CallingConvention::DEFAULT_ORDER {
            assert_eq!(CallingConvention::from_name(convention.as_str()), Some(convention));
        }
        assert_eq!(CallingConvention::from_name(" OCR "), Some(CallingConvention::Ocr));
        assert_eq!(CallingConvention::from_name("batch"), None);
    }

    #[test]
    fn test_convention_serde() {
        let parsed: Vec<CallingConvention> =
            serde_json::from_str(r#"["ocr", "predict"]"#).unwrap();
        assert_eq!(parsed, vec![CallingConvention::Ocr, CallingConvention::Predict]);
    }
}
