//! Chapter review: independent dimensions scored 0-10, combined into a verdict.
//!
//! | Dimension    | Source                         | Hard gate            |
//! |--------------|--------------------------------|----------------------|
//! | `length`     | measured against the range     | yes (`length_gate`)  |
//! | `style`      | punctuation / repetition rules | no                   |
//! | judged (cfg) | reviewer model, JSON answer    | no                   |
//!
//! The aggregate is the unweighted mean. A failing hard gate caps the
//! aggregate at that dimension's score and fails the verdict outright.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::ChapterState;
use super::text::{LengthUnit, measure};
use crate::errors::StageError;
use crate::generation::{GenerationRequest, Generator, Role, strip_code_fence, with_timeout};
use crate::quill_config::ReviewConfig;
use crate::work::{LengthRange, WorkItem};

pub const LENGTH: &str = "length";
pub const STYLE: &str = "style";

static REPEATED_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[!?！？]{3,}|[，,]{2,}|。{2,}").unwrap());

/// Score of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub name: String,
    pub score: f32,
    pub passed: bool,
    pub hard_gate: bool,
    pub feedback: Option<String>,
}

impl DimensionScore {
    fn judged(name: &str, score: f32, threshold: f32, feedback: Option<String>) -> Self {
        let score = score.clamp(0.0, 10.0);
        Self {
            name: name.to_string(),
            score,
            passed: score >= threshold,
            hard_gate: false,
            feedback,
        }
    }
}

/// Outcome of one review. Ephemeral: only its summary is logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub scores: BTreeMap<String, f32>,
    pub aggregate: f32,
    pub pass: bool,
    /// Actionable feedback for each failing dimension
    pub feedback: BTreeMap<String, String>,
    /// Hard-gate dimension that forced the failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gated_by: Option<String>,
}

impl ReviewVerdict {
    pub fn from_dimensions(dimensions: Vec<DimensionScore>, threshold: f32) -> Self {
        let mean = if dimensions.is_empty() {
            0.0
        } else {
            dimensions.iter().map(|d| d.score).sum::<f32>() / dimensions.len() as f32
        };

        let gate = dimensions
            .iter()
            .filter(|d| d.hard_gate && !d.passed)
            .min_by(|a, b| a.score.total_cmp(&b.score));
        let aggregate = match gate {
            Some(g) => mean.min(g.score),
            None => mean,
        };
        let gated_by = gate.map(|g| g.name.clone());

        let mut scores = BTreeMap::new();
        let mut feedback = BTreeMap::new();
        for d in dimensions {
            if !d.passed {
                let text = d.feedback.unwrap_or_else(|| {
                    format!(
                        "The {} dimension scored {:.1}; revise with it specifically in mind.",
                        d.name, d.score
                    )
                });
                feedback.insert(d.name.clone(), text);
            }
            scores.insert(d.name, d.score);
        }

        Self {
            scores,
            aggregate,
            pass: gated_by.is_none() && aggregate >= threshold,
            feedback,
            gated_by,
        }
    }

    /// Feedback lines in the form the editor receives them.
    pub fn feedback_lines(&self) -> Vec<String> {
        self.feedback
            .iter()
            .map(|(dimension, text)| format!("- [{dimension}] {text}"))
            .collect()
    }

    pub fn failing_dimensions(&self) -> Vec<&str> {
        self.feedback.keys().map(String::as_str).collect()
    }
}

/// What a draft is judged against.
#[derive(Debug, Clone)]
pub struct Constraints {
    pub length: LengthRange,
    pub unit: LengthUnit,
    pub pass_threshold: f32,
    pub length_gate: bool,
    pub style_markers: Vec<String>,
}

impl Constraints {
    pub fn for_item(item: &WorkItem, unit: LengthUnit, config: &ReviewConfig) -> Self {
        Self {
            length: item.length,
            unit,
            pass_threshold: config.pass_threshold,
            length_gate: config.length_gate,
            style_markers: config.style_markers.clone(),
        }
    }
}

pub fn score_length(text: &str, constraints: &Constraints) -> DimensionScore {
    let length = measure(text, constraints.unit);
    let range = constraints.length;
    let (score, feedback) = if range.contains(length) {
        (10.0, None)
    } else if length < range.min {
        let missing = range.min - length;
        let deviation = missing as f32 / range.min.max(1) as f32;
        (
            out_of_range_score(deviation),
            Some(format!(
                "The chapter is {length} characters; the target is {range}. Expand by roughly \
                 {missing} characters with scene detail, dialogue or interiority rather than padding."
            )),
        )
    } else {
        let excess = length - range.max;
        let deviation = excess as f32 / range.max.max(1) as f32;
        (
            out_of_range_score(deviation),
            Some(format!(
                "The chapter is {length} characters; the target is {range}. Cut roughly {excess} \
                 characters, tightening description before dialogue."
            )),
        )
    };

    DimensionScore {
        name: LENGTH.to_string(),
        score,
        passed: feedback.is_none(),
        hard_gate: constraints.length_gate,
        feedback,
    }
}

/// Out-of-range lengths never score above 6.
fn out_of_range_score(deviation: f32) -> f32 {
    (6.0 * (1.0 - 2.0 * deviation)).clamp(0.0, 6.0)
}

pub fn score_style(text: &str, constraints: &Constraints) -> DimensionScore {
    let mut score: f32 = 10.0;
    let mut issues: Vec<String> = Vec::new();

    let open_curly = text.matches('“').count();
    let close_curly = text.matches('”').count();
    let straight = text.matches('"').count();
    if open_curly != close_curly || straight % 2 != 0 {
        score -= 1.5;
        issues.push(format!(
            "Quotation marks are unbalanced ({open_curly} opening, {close_curly} closing, {straight} straight)."
        ));
    }

    let repeated = REPEATED_PUNCTUATION.find_iter(text).count();
    if repeated > 0 {
        score -= (repeated as f32 * 0.5).min(2.0);
        issues.push(format!("Repeated punctuation appears {repeated} times."));
    }

    let ellipses = text.matches("……").count() + text.matches("...").count();
    if ellipses > 10 {
        score -= 1.0;
        issues.push(format!("Ellipses are overused ({ellipses}); let sentences end."));
    }

    let paragraphs: Vec<&str> = text
        .split('\n')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let long_limit = match constraints.unit {
        LengthUnit::Cjk => 200,
        LengthUnit::Chars => 800,
    };
    let long = paragraphs
        .iter()
        .filter(|p| p.chars().count() > long_limit)
        .count();
    if long > 3 {
        score -= 1.0;
        issues.push(format!(
            "{long} paragraphs exceed {long_limit} characters; break them up."
        ));
    }

    if let Some(opening) = repetitive_opening(&paragraphs) {
        score -= 1.0;
        issues.push(format!(
            "Three or more consecutive paragraphs open with \"{opening}\"; vary the openings."
        ));
    }

    let lowered = text.to_lowercase();
    let found: Vec<(&str, usize)> = constraints
        .style_markers
        .iter()
        .map(|m| (m.as_str(), lowered.matches(&m.to_lowercase()).count()))
        .filter(|(_, n)| *n > 0)
        .collect();
    let marker_total: usize = found.iter().map(|(_, n)| n).sum();
    if marker_total >= 2 {
        score -= (marker_total as f32 * 0.5).min(3.0);
        let listed: Vec<String> = found.iter().map(|(m, n)| format!("\"{m}\" x{n}")).collect();
        issues.push(format!("Stock phrases: {}.", listed.join(", ")));
    }

    DimensionScore::judged(
        STYLE,
        score,
        constraints.pass_threshold,
        (!issues.is_empty()).then(|| issues.join(" ")),
    )
}

/// First word (or CJK character) shared by three consecutive paragraphs.
fn repetitive_opening(paragraphs: &[&str]) -> Option<String> {
    let openings: Vec<String> = paragraphs.iter().map(|p| opening_of(p)).collect();
    openings
        .windows(3)
        .find(|w| !w[0].is_empty() && w[0] == w[1] && w[1] == w[2])
        .map(|w| w[0].clone())
}

fn opening_of(paragraph: &str) -> String {
    let first = paragraph.chars().next().unwrap_or_default();
    if super::text::is_cjk(first) {
        return first.to_string();
    }
    paragraph
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[derive(Debug, Deserialize)]
struct JudgedReview {
    #[serde(default)]
    scores: HashMap<String, f32>,
    #[serde(default)]
    feedback: HashMap<String, String>,
}

/// Scores a draft. Length and style are always computed locally; the
/// configured judged dimensions come from the reviewer model when one is
/// available, and are skipped if its answer cannot be parsed.
pub struct ReviewStage {
    generator: Option<Arc<dyn Generator>>,
    config: ReviewConfig,
    unit: LengthUnit,
    timeout: Duration,
}

impl ReviewStage {
    pub fn new(
        generator: Option<Arc<dyn Generator>>,
        config: ReviewConfig,
        unit: LengthUnit,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            config,
            unit,
            timeout,
        }
    }

    #[instrument(skip_all, fields(chapter = state.item.sequence, revision = state.revision))]
    pub async fn run(&self, state: &ChapterState) -> Result<ChapterState, StageError> {
        let draft = state.require_draft("review")?;
        let constraints = Constraints::for_item(&state.item, self.unit, &self.config);
        let verdict = self.review(&draft.text, &state.item, &constraints).await?;
        debug!(
            aggregate = verdict.aggregate,
            pass = verdict.pass,
            failing = ?verdict.failing_dimensions(),
            "Review complete"
        );

        let mut next = state.clone();
        next.verdict = Some(verdict);
        Ok(next)
    }

    pub async fn review(
        &self,
        text: &str,
        item: &WorkItem,
        constraints: &Constraints,
    ) -> Result<ReviewVerdict, StageError> {
        let mut dimensions = vec![score_length(text, constraints), score_style(text, constraints)];

        if let Some(generator) = &self.generator
            && !self.config.judged_dimensions.is_empty()
        {
            let request = GenerationRequest::new(
                Role::Reviewer,
                "You are a demanding fiction editor. Score strictly and answer with JSON only.",
                self.judge_instruction(item),
            )
            .with_context(text);
            let output = with_timeout(self.timeout, generator.generate(&request)).await?;
            match parse_judged(&output, &self.config.judged_dimensions, constraints.pass_threshold)
            {
                Ok(judged) => dimensions.extend(judged),
                Err(message) => {
                    warn!(%message, "Reviewer answer unusable, scoring deterministic dimensions only");
                }
            }
        }

        Ok(ReviewVerdict::from_dimensions(
            dimensions,
            constraints.pass_threshold,
        ))
    }

    fn judge_instruction(&self, item: &WorkItem) -> String {
        format!(
            "Review the chapter above against its outline: {}\n\
             Score each of these dimensions from 0 to 10: {}.\n\
             For every dimension below {}, give one concrete, actionable fix.\n\
             Answer as {{\"scores\": {{\"<dimension>\": <score>}}, \"feedback\": {{\"<dimension>\": \"<fix>\"}}}}",
            item.outline,
            self.config.judged_dimensions.join(", "),
            self.config.pass_threshold
        )
    }
}

fn parse_judged(
    output: &str,
    dimensions: &[String],
    threshold: f32,
) -> Result<Vec<DimensionScore>, String> {
    let review: JudgedReview =
        serde_json::from_str(strip_code_fence(output)).map_err(|e| e.to_string())?;

    let mut scored = Vec::new();
    for name in dimensions {
        match review.scores.get(name) {
            Some(score) if score.is_finite() => scored.push(DimensionScore::judged(
                name,
                *score,
                threshold,
                review.feedback.get(name).cloned(),
            )),
            _ => warn!(dimension = %name, "Reviewer omitted a dimension"),
        }
    }
    if scored.is_empty() {
        return Err("no configured dimension was scored".to_string());
    }
    Ok(scored)
}
