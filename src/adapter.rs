//! Normalizes whatever the recognition engine returned into extracted lines.
//!
//! Engine versions disagree on the shape of their results. Each known shape
//! has a pure matcher; the matchers are tried in priority order on every
//! page-result unit and the first one that fully matches wins. A shape that
//! only partially matches (missing or null sequences, unequal lengths,
//! non-string texts) is treated as no match. Adapting never fails: an
//! unrecognized value yields no lines and a [`ShapeDiagnostic`].

use crate::ocr::{EngineOutput, RecognizedPage};
use crate::schema::ExtractedLine;
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

const NESTED_RESULT_KEY: &str = "res";
const TEXTS_KEY: &str = "rec_texts";
const SCORES_KEY: &str = "rec_scores";
const LINE_TEXT_KEY: &str = "text";
const LINE_CONFIDENCE_KEY: &str = "confidence";
const SAMPLE_CHARS: usize = 200;

/// Known result conventions, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Object with `rec_texts` / `rec_scores` accessors.
    PageObject,
    /// `{"res": {"rec_texts": [...], "rec_scores": [...]}}`
    NestedMapping,
    /// `{"rec_texts": [...], "rec_scores": [...]}`
    FlatMapping,
    /// `[{"text": ..., "confidence": ...}, ...]`
    LineRecords,
    /// `[[box, [text, confidence]], ...]`
    LegacyPairs,
}

impl ResultShape {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PageObject => "page object",
            Self::NestedMapping => "nested mapping",
            Self::FlatMapping => "flat mapping",
            Self::LineRecords => "line records",
            Self::LegacyPairs => "legacy pairs",
        }
    }
}

/// A page-result unit handed to the matchers.
#[derive(Clone, Copy)]
enum PageUnit<'a> {
    Object(&'a dyn RecognizedPage),
    Json(&'a Value),
}

type Matcher = fn(PageUnit<'_>) -> Option<Vec<ExtractedLine>>;

const MATCHERS: [(ResultShape, Matcher); 5] = [
    (ResultShape::PageObject, match_page_object),
    (ResultShape::NestedMapping, match_nested_mapping),
    (ResultShape::FlatMapping, match_flat_mapping),
    (ResultShape::LineRecords, match_line_records),
    (ResultShape::LegacyPairs, match_legacy_pairs),
];

/// Outcome of adapting one engine output.
#[derive(Debug, Clone, Default)]
pub struct Adapted {
    pub lines: Vec<ExtractedLine>,
    /// Shape matched for each recognized page unit, in order.
    pub shapes: Vec<ResultShape>,
    /// Set when nothing in the output matched a known shape.
    pub diagnostic: Option<ShapeDiagnostic>,
}

impl Adapted {
    pub fn is_recognized(&self) -> bool {
        !self.shapes.is_empty()
    }
}

/// What an unrecognized engine output looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDiagnostic {
    pub kind: String,
    pub len: Option<usize>,
    pub first_element: Option<String>,
}

impl ShapeDiagnostic {
    pub fn describe(output: &EngineOutput) -> Self {
        match output {
            EngineOutput::Json(value) => describe_value(value),
            EngineOutput::Page(page) => Self {
                kind: "page object".to_string(),
                len: page.rec_texts().map(|t| t.len()),
                first_element: page
                    .rec_texts()
                    .and_then(|t| t.first())
                    .map(|t| truncate(t)),
            },
            EngineOutput::Pages(pages) => Self {
                kind: "page list".to_string(),
                len: Some(pages.len()),
                first_element: pages
                    .first()
                    .map(|p| truncate(&Self::describe(p).to_string())),
            },
        }
    }
}

impl fmt::Display for ShapeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={}", self.kind)?;
        if let Some(len) = self.len {
            write!(f, " len={}", len)?;
        }
        if let Some(first) = &self.first_element {
            write!(f, " first={}", first)?;
        }
        Ok(())
    }
}

/// Extract lines from an engine output. Never fails.
pub fn adapt(output: &EngineOutput) -> Adapted {
    let mut adapted = Adapted::default();
    collect(output, &mut adapted);

    if !adapted.is_recognized() {
        let diagnostic = ShapeDiagnostic::describe(output);
        warn!("Unrecognized engine result shape: {}", diagnostic);
        adapted.diagnostic = Some(diagnostic);
    } else {
        debug!(
            "Adapted {} lines from shapes {:?}",
            adapted.lines.len(),
            adapted.shapes
        );
    }

    adapted
}

/// Match `output` as one page unit, or else each of its elements as a page.
fn collect(output: &EngineOutput, adapted: &mut Adapted) -> bool {
    match output {
        EngineOutput::Page(page) => push_unit(PageUnit::Object(page.as_ref()), adapted),
        EngineOutput::Pages(pages) => {
            let mut any = false;
            for page in pages {
                any |= collect(page, adapted);
            }
            any
        }
        EngineOutput::Json(value) => {
            if push_unit(PageUnit::Json(value), adapted) {
                return true;
            }
            let Value::Array(items) = value else {
                return false;
            };
            let mut any = false;
            for item in items.iter().filter(|i| !i.is_null()) {
                any |= push_unit(PageUnit::Json(item), adapted);
            }
            any
        }
    }
}

fn push_unit(unit: PageUnit<'_>, adapted: &mut Adapted) -> bool {
    for (shape, matcher) in MATCHERS {
        if let Some(lines) = matcher(unit) {
            adapted.shapes.push(shape);
            adapted.lines.extend(lines);
            return true;
        }
    }
    false
}

// ============================================================================
// Matchers
// ============================================================================

fn match_page_object(unit: PageUnit<'_>) -> Option<Vec<ExtractedLine>> {
    let PageUnit::Object(page) = unit else {
        return None;
    };
    let texts = page.rec_texts()?;
    let scores = page.rec_scores()?;
    if texts.len() != scores.len() {
        return None;
    }

    let mut lines = Vec::with_capacity(texts.len());
    for (text, score) in texts.iter().zip(scores) {
        let confidence = finite(*score)?;
        lines.extend(ExtractedLine::new(text, confidence));
    }
    Some(lines)
}

fn match_nested_mapping(unit: PageUnit<'_>) -> Option<Vec<ExtractedLine>> {
    let PageUnit::Json(value) = unit else {
        return None;
    };
    let nested = value.as_object()?.get(NESTED_RESULT_KEY)?.as_object()?;
    parallel_sequences(nested)
}

fn match_flat_mapping(unit: PageUnit<'_>) -> Option<Vec<ExtractedLine>> {
    let PageUnit::Json(value) = unit else {
        return None;
    };
    parallel_sequences(value.as_object()?)
}

fn match_line_records(unit: PageUnit<'_>) -> Option<Vec<ExtractedLine>> {
    let PageUnit::Json(value) = unit else {
        return None;
    };
    each_line(value, |item| {
        let record = item.as_object()?;
        let text = record.get(LINE_TEXT_KEY)?.as_str()?;
        let confidence = coerce_confidence(record.get(LINE_CONFIDENCE_KEY)?)?;
        Some((text, confidence))
    })
}

fn match_legacy_pairs(unit: PageUnit<'_>) -> Option<Vec<ExtractedLine>> {
    let PageUnit::Json(value) = unit else {
        return None;
    };
    each_line(value, |item| {
        let entry = item.as_array()?;
        if entry.len() < 2 {
            return None;
        }
        let pair = entry[1].as_array()?;
        if pair.len() != 2 {
            return None;
        }
        let text = pair[0].as_str()?;
        let confidence = coerce_confidence(&pair[1])?;
        Some((text, confidence))
    })
}

/// Zip parallel `rec_texts` / `rec_scores` sequences of a mapping.
fn parallel_sequences(map: &Map<String, Value>) -> Option<Vec<ExtractedLine>> {
    let texts = map.get(TEXTS_KEY)?.as_array()?;
    let scores = map.get(SCORES_KEY)?.as_array()?;
    if texts.len() != scores.len() {
        return None;
    }

    let mut lines = Vec::with_capacity(texts.len());
    for (text, score) in texts.iter().zip(scores) {
        let text = text.as_str()?;
        let confidence = coerce_confidence(score)?;
        lines.extend(ExtractedLine::new(text, confidence));
    }
    Some(lines)
}

/// Apply a per-line extractor to a non-empty sequence. Null entries are
/// skipped; any other entry that does not fit rejects the whole shape.
fn each_line<'a, F>(value: &'a Value, extract: F) -> Option<Vec<ExtractedLine>>
where
    F: Fn(&'a Value) -> Option<(&'a str, f64)>,
{
    let items = value.as_array()?;
    let mut matched = 0usize;
    let mut lines = Vec::with_capacity(items.len());

    for item in items.iter().filter(|i| !i.is_null()) {
        let (text, confidence) = extract(item)?;
        matched += 1;
        lines.extend(ExtractedLine::new(text, confidence));
    }

    (matched > 0).then_some(lines)
}

fn coerce_confidence(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    finite(raw)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn describe_value(value: &Value) -> ShapeDiagnostic {
    let (kind, len, first_element) = match value {
        Value::Null => ("null", None, None),
        Value::Bool(b) => ("bool", None, Some(b.to_string())),
        Value::Number(n) => ("number", None, Some(n.to_string())),
        Value::String(s) => ("string", Some(s.chars().count()), Some(truncate(s))),
        Value::Array(items) => (
            "array",
            Some(items.len()),
            items.first().map(|i| truncate(&i.to_string())),
        ),
        Value::Object(map) => (
            "object",
            Some(map.len()),
            Some(truncate(&format!(
                "keys: [{}]",
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        ),
    };
    ShapeDiagnostic {
        kind: kind.to_string(),
        len,
        first_element,
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= SAMPLE_CHARS {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(SAMPLE_CHARS).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct TestPage {
        texts: Option<Vec<String>>,
        scores: Option<Vec<f64>>,
    }

    impl RecognizedPage for TestPage {
        fn rec_texts(&self) -> Option<&[String]> {
            self.texts.as_deref()
        }
        fn rec_scores(&self) -> Option<&[f64]> {
            self.scores.as_deref()
        }
    }

    fn sample_pairs() -> Vec<(&'static str, f64)> {
        vec![("Hypertension", 0.92), ("高血压", 0.88)]
    }

    fn expected_lines() -> Vec<ExtractedLine> {
        sample_pairs()
            .into_iter()
            .map(|(t, c)| ExtractedLine::new(t, c).unwrap())
            .collect()
    }

    fn page_object() -> EngineOutput {
        let (texts, scores): (Vec<_>, Vec<_>) = sample_pairs()
            .into_iter()
            .map(|(t, c)| (t.to_string(), c))
            .unzip();
        EngineOutput::Pages(vec![EngineOutput::Page(Box::new(TestPage {
            texts: Some(texts),
            scores: Some(scores),
        }))])
    }

    fn all_shapes() -> Vec<(ResultShape, EngineOutput)> {
        vec![
            (ResultShape::PageObject, page_object()),
            (
                ResultShape::NestedMapping,
                json!([{"res": {"rec_texts": ["Hypertension", "高血压"], "rec_scores": [0.92, 0.88]}}]).into(),
            ),
            (
                ResultShape::FlatMapping,
                json!([{"rec_texts": ["Hypertension", "高血压"], "rec_scores": [0.92, 0.88]}]).into(),
            ),
            (
                ResultShape::LineRecords,
                json!([{"text": "Hypertension", "confidence": 0.92}, {"text": "高血压", "confidence": 0.88}]).into(),
            ),
            (
                ResultShape::LegacyPairs,
                json!([[
                    [[[0, 0], [10, 0], [10, 5], [0, 5]], ["Hypertension", 0.92]],
                    [[[0, 6], [10, 6], [10, 11], [0, 11]], ["高血压", 0.88]]
                ]]).into(),
            ),
        ]
    }

    #[test]
    fn test_every_shape_yields_identical_lines() {
        for (shape, output) in all_shapes() {
            let adapted = adapt(&output);
            assert_eq!(adapted.lines, expected_lines(), "shape {:?}", shape);
            assert_eq!(adapted.shapes, vec![shape]);
            assert!(adapted.diagnostic.is_none());
        }
    }

    #[test]
    fn test_blank_text_is_dropped_despite_high_confidence() {
        let adapted = adapt(&json!([{"text": "  ", "confidence": 0.95}]).into());
        assert!(adapted.lines.is_empty());
        assert_eq!(adapted.shapes, vec![ResultShape::LineRecords]);
    }

    #[test]
    fn test_texts_are_trimmed_and_scores_coerced() {
        let adapted = adapt(&json!({"rec_texts": ["  BP 140/90 "], "rec_scores": ["0.75"]}).into());
        assert_eq!(adapted.lines, vec![ExtractedLine::new("BP 140/90", 0.75).unwrap()]);
    }

    #[test]
    fn test_nested_mapping_preferred_over_flat() {
        let output = json!({
            "res": {"rec_texts": ["nested"], "rec_scores": [0.9]},
            "rec_texts": ["flat"],
            "rec_scores": [0.9]
        });
        let adapted = adapt(&output.into());
        assert_eq!(adapted.shapes, vec![ResultShape::NestedMapping]);
        assert_eq!(adapted.lines[0].text, "nested");
    }

    #[test]
    fn test_partial_nested_falls_through_to_flat() {
        let output = json!({
            "res": {"rec_texts": ["nested"], "rec_scores": null},
            "rec_texts": ["flat"],
            "rec_scores": [0.7]
        });
        let adapted = adapt(&output.into());
        assert_eq!(adapted.shapes, vec![ResultShape::FlatMapping]);
        assert_eq!(adapted.lines[0].text, "flat");
    }

    #[test]
    fn test_unequal_lengths_are_no_match() {
        let adapted = adapt(&json!({"rec_texts": ["a", "b"], "rec_scores": [0.9]}).into());
        assert!(adapted.lines.is_empty());
        assert!(!adapted.is_recognized());
        assert_eq!(adapted.diagnostic.unwrap().kind, "object");
    }

    #[test]
    fn test_page_object_with_missing_scores_is_no_match() {
        let output = EngineOutput::Page(Box::new(TestPage {
            texts: Some(vec!["a".to_string()]),
            scores: None,
        }));
        let adapted = adapt(&output);
        assert!(adapted.lines.is_empty());
        assert_eq!(adapted.diagnostic.unwrap().kind, "page object");
    }

    #[test]
    fn test_pages_are_concatenated_in_order() {
        let output = json!([
            {"rec_texts": ["page one"], "rec_scores": [0.9]},
            null,
            {"res": {"rec_texts": ["page two"], "rec_scores": [0.7]}}
        ]);
        let adapted = adapt(&output.into());
        let texts: Vec<_> = adapted.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["page one", "page two"]);
        assert_eq!(
            adapted.shapes,
            vec![ResultShape::FlatMapping, ResultShape::NestedMapping]
        );
    }

    #[test]
    fn test_legacy_lines_without_pair_reject_shape() {
        let output = json!([[[[0, 0]], ["ok", 0.9]], [[[0, 0]], "broken"]]);
        let adapted = adapt(&output.into());
        assert!(adapted.lines.is_empty());
        assert!(adapted.diagnostic.is_some());
    }

    #[test]
    fn test_never_panics_on_odd_inputs() {
        let inputs = vec![
            Value::Null,
            json!([]),
            json!({}),
            json!([null]),
            json!([[]]),
            json!("text"),
            json!(42),
            json!({"res": null}),
            json!({"res": {"rec_texts": null, "rec_scores": null}}),
            json!([{"text": 5, "confidence": 0.9}]),
            json!([{"text": "a"}]),
            json!([[1, [2, 3]]]),
            json!({"rec_texts": ["a"], "rec_scores": ["high"]}),
        ];
        for input in inputs {
            let adapted = adapt(&input.clone().into());
            assert!(adapted.lines.is_empty(), "input {}", input);
            assert!(adapted.diagnostic.is_some(), "input {}", input);
        }
        let adapted = adapt(&EngineOutput::Pages(Vec::new()));
        assert_eq!(adapted.diagnostic.unwrap().kind, "page list");
    }

    #[test]
    fn test_diagnostic_samples_first_element() {
        let long = "x".repeat(500);
        let diagnostic = ShapeDiagnostic::describe(&json!([long, 1]).into());
        assert_eq!(diagnostic.kind, "array");
        assert_eq!(diagnostic.len, Some(2));
        assert!(diagnostic.first_element.unwrap().chars().count() <= SAMPLE_CHARS + 1);
    }
}
