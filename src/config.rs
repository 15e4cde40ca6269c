//! Pipeline configuration.
//!
//! Loaded from an optional JSON file (`MEDOCR_CONFIG`, or
//! `configs/pipeline.json` when present), with every field defaulted, then
//! overridden from the environment.

use crate::extractor::DEFAULT_ENGINE_TIMEOUT;
use crate::normalizer::{ImageLimits, DEFAULT_MAX_SIDE, DEFAULT_MIN_HEIGHT, DEFAULT_MIN_WIDTH};
use crate::ocr::sidecar::DEFAULT_ENGINE_URL;
use crate::ocr::CallingConvention;
use crate::report::DEFAULT_PREVIEW_LINES;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "configs/pipeline.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Base URL of the recognition sidecar.
    pub engine_url: String,
    /// Calling conventions in fallback order.
    pub conventions: Vec<CallingConvention>,
    pub engine_timeout_secs: u64,
    pub max_side: u32,
    pub min_width: u32,
    pub min_height: u32,
    /// Where canonical images are written while a request runs.
    pub work_dir: PathBuf,
    /// Where exported CSV files go.
    pub output_dir: PathBuf,
    pub bind: String,
    pub preview_lines: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            conventions: CallingConvention::DEFAULT_ORDER.to_vec(),
            engine_timeout_secs: DEFAULT_ENGINE_TIMEOUT.as_secs(),
            max_side: DEFAULT_MAX_SIDE,
            min_width: DEFAULT_MIN_WIDTH,
            min_height: DEFAULT_MIN_HEIGHT,
            work_dir: std::env::temp_dir().join("medocr"),
            output_dir: PathBuf::from("results"),
            bind: "0.0.0.0:7860".to_string(),
            preview_lines: DEFAULT_PREVIEW_LINES,
        }
    }
}

impl PipelineConfig {
    /// Load from file (if any) and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("MEDOCR_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!("Loaded pipeline config from {:?}", path);
        Ok(config)
    }

    /// Apply environment-style overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OCR_ENGINE_URL") {
            self.engine_url = url;
        }
        if let Some(dir) = lookup("MEDOCR_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MEDOCR_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup("MEDOCR_BIND") {
            self.bind = bind;
        }
        if let Some(secs) = lookup("MEDOCR_ENGINE_TIMEOUT_SECS") {
            self.engine_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("MEDOCR_ENGINE_TIMEOUT_SECS is not a number: {}", secs))?;
        }
        if let Some(list) = lookup("MEDOCR_CONVENTIONS") {
            self.conventions = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    CallingConvention::from_name(s)
                        .with_context(|| format!("Unknown calling convention: {}", s.trim()))
                })
                .collect::<Result<_>>()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.conventions.is_empty() {
            anyhow::bail!("At least one calling convention must be configured");
        }
        if self.engine_timeout_secs == 0 {
            anyhow::bail!("engine_timeout_secs must be positive");
        }
        if self.min_width == 0 || self.min_height == 0 {
            anyhow::bail!("Minimum image dimensions must be positive");
        }
        if self.max_side < self.min_width.max(self.min_height) {
            anyhow::bail!(
                "max_side ({}) is smaller than the minimum dimensions ({}x{})",
                self.max_side,
                self.min_width,
                self.min_height
            );
        }
        Ok(())
    }

    pub fn limits(&self) -> ImageLimits {
        ImageLimits {
            max_side: self.max_side,
            min_width: self.min_width,
            min_height: self.min_height,
        }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.limits(), ImageLimits::default());
        assert_eq!(config.conventions, CallingConvention::DEFAULT_ORDER.to_vec());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"max_side": 1024, "conventions": ["ocr"]}"#).unwrap();

        let config = PipelineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.max_side, 1024);
        assert_eq!(config.conventions, vec![CallingConvention::Ocr]);
        assert_eq!(config.min_width, DEFAULT_MIN_WIDTH);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"max_sidee": 1024}"#).unwrap();
        assert!(PipelineConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(lookup(&[
                ("OCR_ENGINE_URL", "http://ocr:9000"),
                ("MEDOCR_ENGINE_TIMEOUT_SECS", "30"),
                ("MEDOCR_CONVENTIONS", "direct, predict"),
            ]))
            .unwrap();
        assert_eq!(config.engine_url, "http://ocr:9000");
        assert_eq!(config.engine_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.conventions,
            vec![CallingConvention::Direct, CallingConvention::Predict]
        );
    }

    #[test]
    fn test_bad_overrides_fail() {
        let mut config = PipelineConfig::default();
        assert!(config
            .apply_overrides(lookup(&[("MEDOCR_CONVENTIONS", "predict,batch")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup(&[("MEDOCR_ENGINE_TIMEOUT_SECS", "soon")]))
            .is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = PipelineConfig::default();
        config.conventions.clear();
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            max_side: 80,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            engine_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
