//! Extraction pipeline: normalize the image, then call the recognition
//! engine through each configured calling convention until one of them
//! yields lines.

use crate::adapter::{self, ResultShape, ShapeDiagnostic};
use crate::normalizer::{ImageNormalizer, NormalizeError, RequestSlot, SourceImage};
use crate::ocr::{CallingConvention, EngineError, RecognitionEngine};
use crate::schema::{ExtractedLine, ImageDiagnostics};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The image was rejected before any engine call.
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("image normalization task failed: {0}")]
    Task(String),
}

impl ExtractError {
    /// Whether the input itself was at fault (as opposed to local storage).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Normalize(
                NormalizeError::UnsupportedInputType(_)
                    | NormalizeError::UnsupportedChannelLayout { .. }
                    | NormalizeError::ImageTooSmall { .. }
                    | NormalizeError::Unreadable(_)
            )
        )
    }
}

/// Why one calling convention did not produce lines.
#[derive(Debug)]
pub enum AttemptFailure {
    Engine(EngineError),
    /// The call succeeded but nothing usable came back.
    NoLines { diagnostic: Option<ShapeDiagnostic> },
}

#[derive(Debug)]
pub struct FailedAttempt {
    pub convention: CallingConvention,
    pub failure: AttemptFailure,
}

impl FailedAttempt {
    pub fn describe(&self) -> String {
        match &self.failure {
            AttemptFailure::Engine(e) => format!("{}: {}", self.convention, e),
            AttemptFailure::NoLines { diagnostic: Some(d) } => {
                format!("{}: unrecognized result ({})", self.convention, d)
            }
            AttemptFailure::NoLines { diagnostic: None } => {
                format!("{}: no text lines", self.convention)
            }
        }
    }
}

/// Terminal state of one extraction request that was not rejected.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub lines: Vec<ExtractedLine>,
    /// The convention that produced `lines`; `None` for an empty result.
    pub convention: Option<CallingConvention>,
    pub shapes: Vec<ResultShape>,
    pub failures: Vec<FailedAttempt>,
    pub diagnostics: ImageDiagnostics,
    pub elapsed: Duration,
}

impl ExtractionOutcome {
    /// No text found. A valid result, not an error.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Orchestrates normalization and engine calls for every request.
pub struct ExtractionPipeline {
    engine: Arc<dyn RecognitionEngine>,
    normalizer: ImageNormalizer,
    conventions: Vec<CallingConvention>,
    engine_timeout: Duration,
    in_flight: Mutex<()>,
}

impl ExtractionPipeline {
    pub fn new(engine: Arc<dyn RecognitionEngine>, normalizer: ImageNormalizer) -> Self {
        Self {
            engine,
            normalizer,
            conventions: CallingConvention::DEFAULT_ORDER.to_vec(),
            engine_timeout: DEFAULT_ENGINE_TIMEOUT,
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_conventions(mut self, conventions: Vec<CallingConvention>) -> Self {
        self.conventions = conventions;
        self
    }

    pub fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn conventions(&self) -> &[CallingConvention] {
        &self.conventions
    }

    /// Run one extraction. Requests are processed one at a time.
    pub async fn extract(
        &self,
        source: SourceImage,
        slot: &RequestSlot,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let _guard = self.in_flight.lock().await;
        let start = Instant::now();

        let normalizer = self.normalizer.clone();
        let task_slot = slot.clone();
        let canonical = tokio::task::spawn_blocking(move || normalizer.normalize(source, &task_slot))
            .await
            .map_err(|e| ExtractError::Task(e.to_string()))?
            .map_err(|e| {
                warn!(slot = slot.as_str(), "Image rejected: {}", e);
                e
            })?;

        let mut result = self
            .attempt_all(&canonical.path, canonical.diagnostics())
            .await;
        canonical.discard();
        result.elapsed = start.elapsed();

        match result.convention {
            Some(convention) => info!(
                slot = slot.as_str(),
                lines = result.lines.len(),
                convention = %convention,
                shapes = ?result.shapes.iter().map(|s| s.label()).collect::<Vec<_>>(),
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Extraction complete"
            ),
            None => warn!(
                slot = slot.as_str(),
                attempts = result.failures.len(),
                pixels = result.diagnostics.pixel_count,
                "No text found"
            ),
        }

        Ok(result)
    }

    /// Try each convention in order and stop at the first non-empty result.
    async fn attempt_all(&self, image: &Path, diagnostics: ImageDiagnostics) -> ExtractionOutcome {
        let mut failures = Vec::new();

        for &convention in &self.conventions {
            if !self.engine.supports(convention) {
                debug!("Engine {} does not offer {}, skipping", self.engine.name(), convention);
                failures.push(FailedAttempt {
                    convention,
                    failure: AttemptFailure::Engine(EngineError::Unsupported {
                        engine: self.engine.name().to_string(),
                        convention,
                    }),
                });
                continue;
            }

            debug!("Attempting {} convention", convention);
            let call = self.engine.invoke(convention, image);
            let raw = match tokio::time::timeout(self.engine_timeout, call).await {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    warn!(convention = %convention, "Engine attempt failed: {}", e);
                    failures.push(FailedAttempt {
                        convention,
                        failure: AttemptFailure::Engine(e),
                    });
                    continue;
                }
                Err(_) => {
                    warn!(convention = %convention, "Engine attempt timed out after {:?}", self.engine_timeout);
                    failures.push(FailedAttempt {
                        convention,
                        failure: AttemptFailure::Engine(EngineError::Timeout(self.engine_timeout)),
                    });
                    continue;
                }
            };

            let adapted = adapter::adapt(&raw);
            if !adapted.lines.is_empty() {
                return ExtractionOutcome {
                    lines: adapted.lines,
                    convention: Some(convention),
                    shapes: adapted.shapes,
                    failures,
                    diagnostics,
                    elapsed: Duration::ZERO,
                };
            }

            debug!("{} convention returned no lines", convention);
            failures.push(FailedAttempt {
                convention,
                failure: AttemptFailure::NoLines {
                    diagnostic: adapted.diagnostic,
                },
            });
        }

        ExtractionOutcome {
            lines: Vec::new(),
            convention: None,
            shapes: Vec::new(),
            failures,
            diagnostics,
            elapsed: Duration::ZERO,
        }
    }
}
