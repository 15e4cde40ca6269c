//! Interactive upload surface: a small HTTP server with an upload form.

use crate::config::PipelineConfig;
use crate::export;
use crate::extractor::{ExtractError, ExtractionPipeline};
use crate::normalizer::{NormalizeError, RequestSlot, SourceImage};
use crate::report::{self, Report};
use crate::schema::ExtractionRecord;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Medical document OCR</title></head>
<body>
<h1>Medical document OCR</h1>
<form id="upload">
  <input type="file" name="file" accept="image/*" required>
  <button type="submit">Extract text</button>
</form>
<pre id="summary"></pre>
<p id="download"></p>
<script>
document.getElementById('upload').addEventListener('submit', async (event) => {
  event.preventDefault();
  const summary = document.getElementById('summary');
  const download = document.getElementById('download');
  summary.textContent = 'Processing...';
  download.innerHTML = '';
  const response = await fetch('/extract', { method: 'POST', body: new FormData(event.target) });
  if (!response.ok) {
    summary.textContent = await response.text();
    return;
  }
  const body = await response.json();
  summary.textContent = body.summary;
  if (body.download_url) {
    download.innerHTML = '<a href="' + body.download_url + '">Download results (CSV)</a>';
  }
});
</script>
</body>
</html>
"#;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<ExtractionPipeline>,
    config: Arc<PipelineConfig>,
}

impl AppState {
    pub fn new(pipeline: Arc<ExtractionPipeline>, config: Arc<PipelineConfig>) -> Self {
        Self { pipeline, config }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum UploadStatus {
    Success,
    Empty,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: UploadStatus,
    summary: String,
    download_url: Option<String>,
    records: Vec<ExtractionRecord>,
}

pub fn router(state: AppState) -> Router {
    let downloads = ServeDir::new(&state.config.output_dir);
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/extract", post(extract_upload))
        .nest_service("/downloads", downloads)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let bind = state.config.bind.clone();
    std::fs::create_dir_all(&state.config.output_dir)?;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Server listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> &'static str {
    "ok"
}

/// Upload an image and extract its text.
async fn extract_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    let mut file_name = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            file_name = field
                .file_name()
                .and_then(|n| Path::new(n).file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            file_data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Please upload an image file.".to_string()));
    }

    let slot = RequestSlot::random();
    info!(
        slot = slot.as_str(),
        "Received upload: {} ({} bytes)",
        file_name,
        file_data.len()
    );

    let outcome = state
        .pipeline
        .extract(SourceImage::Encoded(file_data), &slot)
        .await
        .map_err(|e| {
            error!(slot = slot.as_str(), "Extraction failed: {}", e);
            (status_for(&e), report::render_failure(&file_name, &e))
        })?;

    let report = Report::from_outcome(&outcome, &file_name);
    let summary = report.render(state.config.preview_lines);

    if report.is_empty() {
        return Ok(Json(UploadResponse {
            status: UploadStatus::Empty,
            summary,
            download_url: None,
            records: Vec::new(),
        }));
    }

    let csv_name = format!("{}_ocr_results.csv", slot.as_str());
    let target = state.config.output_dir.join(&csv_name);
    let written = export::write_records(&report.records, &target).map_err(|e| {
        error!(slot = slot.as_str(), "Export failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "The text was extracted but the results file could not be saved.".to_string(),
        )
    })?;

    // Fallback locations are outside the download directory.
    let download_url = (written == target).then(|| format!("/downloads/{}", csv_name));

    Ok(Json(UploadResponse {
        status: UploadStatus::Success,
        summary,
        download_url,
        records: report.records,
    }))
}

fn status_for(error: &ExtractError) -> StatusCode {
    match error {
        ExtractError::Normalize(NormalizeError::UnsupportedInputType(_)) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        e if e.is_rejection() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
