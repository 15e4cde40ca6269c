//! Text and confidence extraction from photographed or scanned medical
//! documents.
//!
//! [`extractor::ExtractionPipeline`] is the entry point: it normalizes a
//! [`normalizer::SourceImage`] (file path, encoded bytes, pixel array,
//! decoded image or any [`normalizer::SaveToPath`] object), calls a
//! [`ocr::RecognitionEngine`] through each configured calling convention,
//! and adapts whatever comes back into [`schema::ExtractedLine`]s. The
//! [`report`] and [`export`] modules turn those into summaries and CSV files;
//! [`server`] and [`cli`] are the two front ends of the `medocr` binary.

pub mod adapter;
pub mod cli;
pub mod config;
pub mod export;
pub mod extractor;
pub mod normalizer;
pub mod ocr;
pub mod report;
pub mod schema;
pub mod server;
