//! HTTP sidecar recognition engine.
//!
//! The sidecar wraps the recognition library in a small web service and
//! exposes one endpoint per calling convention.

use super::{CallingConvention, EngineError, EngineOutput, RecognitionEngine, RecognizedPage};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_ENGINE_URL: &str = "http://localhost:8866";

const PAGES_KEY: &str = "pages";

/// Typed `predict` response: one entry per page.
#[derive(Debug, Deserialize)]
struct PredictResponse {
    pages: Vec<PredictPage>,
}

#[derive(Debug, Deserialize)]
struct PredictPage {
    #[serde(default)]
    rec_texts: Option<Vec<String>>,
    #[serde(default)]
    rec_scores: Option<Vec<f64>>,
}

impl RecognizedPage for PredictPage {
    fn rec_texts(&self) -> Option<&[String]> {
        self.rec_texts.as_deref()
    }

    fn rec_scores(&self) -> Option<&[f64]> {
        self.rec_scores.as_deref()
    }
}

#[derive(Serialize)]
struct DirectRequest<'a> {
    image: String,
    file_name: &'a str,
}

pub struct SidecarEngine {
    url: String,
    client: reqwest::Client,
}

impl SidecarEngine {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        Self { url, client }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn endpoint(&self, convention: CallingConvention) -> String {
        match convention {
            CallingConvention::Predict => format!("{}/predict", self.url),
            CallingConvention::Ocr => format!("{}/ocr", self.url),
            CallingConvention::Direct => format!("{}/", self.url),
        }
    }
}

#[async_trait::async_trait]
impl RecognitionEngine for SidecarEngine {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn invoke(
        &self,
        convention: CallingConvention,
        image: &Path,
    ) -> Result<EngineOutput, EngineError> {
        use reqwest::multipart::{Form, Part};

        let data = tokio::fs::read(image)
            .await
            .map_err(|e| EngineError::Invocation(format!("cannot read {}: {}", image.display(), e)))?;
        let file_name = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.png")
            .to_string();
        let endpoint = self.endpoint(convention);

        info!(
            convention = %convention,
            bytes = data.len(),
            "SidecarEngine: calling {}",
            endpoint
        );

        let request = match convention {
            CallingConvention::Predict | CallingConvention::Ocr => {
                let part = Part::bytes(data)
                    .file_name(file_name)
                    .mime_str(mime_for(image))
                    .map_err(|e| EngineError::Invocation(e.to_string()))?;
                self.client.post(&endpoint).multipart(Form::new().part("file", part))
            }
            CallingConvention::Direct => self.client.post(&endpoint).json(&DirectRequest {
                image: BASE64.encode(&data),
                file_name: &file_name,
            }),
        };

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Invocation(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Invocation(format!(
                "sidecar error ({}): {}",
                status,
                text.chars().take(500).collect::<String>()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Invocation(e.to_string()))?;
        debug!(
            "SidecarEngine: raw response ({} bytes): {}",
            body.len(),
            body.chars().take(500).collect::<String>()
        );

        decode_body(convention, &body)
    }
}

/// Turn a sidecar response body into an engine output.
///
/// `predict` responses are read as typed pages when they fit. Otherwise the
/// body is kept as raw JSON for the shape adapter, with a `pages` wrapper
/// split into one raw value per page.
fn decode_body(convention: CallingConvention, body: &str) -> Result<EngineOutput, EngineError> {
    if convention == CallingConvention::Predict {
        if let Ok(typed) = serde_json::from_str::<PredictResponse>(body) {
            return Ok(EngineOutput::Pages(
                typed
                    .pages
                    .into_iter()
                    .map(|p| EngineOutput::Page(Box::new(p)))
                    .collect(),
            ));
        }
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| EngineError::Invocation(format!("response is not JSON: {}", e)))?;
    Ok(unwrap_pages(value))
}

fn unwrap_pages(value: serde_json::Value) -> EngineOutput {
    match value {
        serde_json::Value::Object(mut map) if map.len() == 1 && map.contains_key(PAGES_KEY) => {
            match map.remove(PAGES_KEY) {
                Some(serde_json::Value::Array(pages)) => {
                    EngineOutput::Pages(pages.into_iter().map(EngineOutput::Json).collect())
                }
                Some(other) => {
                    map.insert(PAGES_KEY.to_string(), other);
                    EngineOutput::Json(serde_json::Value::Object(map))
                }
                None => EngineOutput::Json(serde_json::Value::Object(map)),
            }
        }
        other => EngineOutput::Json(other),
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}
