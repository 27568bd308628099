use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use super::text::{LengthUnit, measure, section, sections, trim_to_sentence};
use super::{ChapterState, Draft};
use crate::errors::StageError;
use crate::generation::{GenerationRequest, Generator, Role, with_timeout};
use crate::work::ItemStatus;

/// Edited text shorter than this fraction of the minimum length is treated
/// as a collapsed answer, not a revision.
const COLLAPSE_RATIO: usize = 4;

/// Revises the draft toward the length range and house style, and on a
/// re-edit works through the reviewer's feedback.
pub struct EditorStage {
    generator: Arc<dyn Generator>,
    timeout: Duration,
    unit: LengthUnit,
}

impl EditorStage {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration, unit: LengthUnit) -> Self {
        Self {
            generator,
            timeout,
            unit,
        }
    }

    #[instrument(skip_all, fields(chapter = state.item.sequence, revision = state.revision))]
    pub async fn run(&self, state: &ChapterState) -> Result<ChapterState, StageError> {
        let draft = state.require_draft("editor")?;
        let request = GenerationRequest::new(
            Role::Editor,
            system_prompt(&state.brief.style_guide),
            self.instruction(state, draft),
        )
        .with_context(draft.text.clone());

        let output = with_timeout(self.timeout, self.generator.generate(&request)).await?;
        let (notes, edited) = parse_edit(&output)?;

        let min = state.item.length.min;
        let edited_length = measure(&edited, self.unit);
        if edited_length < min / COLLAPSE_RATIO {
            return Err(StageError::MalformedOutput {
                stage: "editor",
                message: format!("edited text collapsed to {edited_length} characters"),
            });
        }

        let text = trim_to_sentence(&edited, state.item.length.max, self.unit);
        debug!(
            before = measure(&draft.text, self.unit),
            after = measure(&text, self.unit),
            notes = notes.as_deref().unwrap_or(""),
            "Draft edited"
        );

        let mut next = state.clone();
        next.draft = Some(Draft {
            title: draft.title.clone(),
            text,
            revision: state.revision,
        });
        next.status = ItemStatus::Reviewing;
        Ok(next)
    }

    fn instruction(&self, state: &ChapterState, draft: &Draft) -> String {
        let range = state.item.length;
        let current = measure(&draft.text, self.unit);
        let mut lines = vec![
            format!(
                "Edit the chapter above. Target length: {range} characters; it is currently {current}."
            ),
        ];

        if current < range.min {
            lines.push(format!(
                "Expand by about {} characters: deepen scenes, dialogue and interiority that the \
                 outline already implies. Do not add new plot events.",
                range.min - current
            ));
        } else if current > range.max {
            lines.push(format!(
                "Tighten by about {} characters without losing plot beats.",
                current - range.max
            ));
        }

        if let Some(verdict) = state.verdict.as_ref().filter(|v| !v.pass) {
            lines.push("The reviewer rejected the previous version. Address every point:".to_string());
            lines.extend(verdict.feedback_lines());
        }

        lines.push(
            "Reply with [NOTES] listing what you changed, then [TEXT] and the full revised chapter."
                .to_string(),
        );
        lines.join("\n")
    }
}

fn system_prompt(style_guide: &str) -> String {
    let mut prompt = "You are a line editor for serialized fiction. Keep the author's voice, \
                      fix pacing and repetition, and never summarize."
        .to_string();
    if !style_guide.is_empty() {
        prompt.push_str(&format!("\nHouse style: {style_guide}"));
    }
    prompt
}

fn parse_edit(output: &str) -> Result<(Option<String>, String), StageError> {
    let parsed = sections(output);
    let notes = section(&parsed, "NOTES")
        .map(str::to_string)
        .filter(|n| !n.is_empty());
    let text = match section(&parsed, "TEXT") {
        Some(text) => text.to_string(),
        None if notes.is_none() => output.trim().to_string(),
        None => String::new(),
    };
    if text.is_empty() {
        return Err(StageError::MalformedOutput {
            stage: "editor",
            message: "response contained no revised text".to_string(),
        });
    }
    Ok((notes, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::review::{DimensionScore, ReviewVerdict};
    use crate::stages::{ChapterState, WorkBrief};
    use crate::work::{LengthRange, WorkId, WorkItem};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        reply: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<String, crate::errors::GenerationError> {
            self.seen.lock().unwrap().push(request.instruction.clone());
            Ok(self.reply.clone())
        }
    }

    fn state_with_draft(text: &str) -> ChapterState {
        let item = WorkItem::new(1, "Anna arrives", LengthRange::new(100, 120));
        let mut state = ChapterState::new(WorkId::new("w"), Arc::new(WorkBrief::default()), item);
        state.status = ItemStatus::Editing;
        state.draft = Some(Draft {
            title: "Arrival".into(),
            text: text.into(),
            revision: 0,
        });
        state
    }

    fn editor(reply: &str) -> (EditorStage, Arc<Scripted>) {
        let generator = Arc::new(Scripted {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        (
            EditorStage::new(generator.clone(), Duration::from_secs(5), LengthUnit::Chars),
            generator,
        )
    }

    #[test]
    fn test_parse_edit_markers() {
        let (notes, text) = parse_edit("[NOTES]\nTrimmed.\n[TEXT]\nBody here.").unwrap();
        assert_eq!(notes.as_deref(), Some("Trimmed."));
        assert_eq!(text, "Body here.");
    }

    #[test]
    fn test_parse_edit_notes_only_is_malformed() {
        let err = parse_edit("[NOTES]\nI could not edit this.").unwrap_err();
        assert!(matches!(err, StageError::MalformedOutput { stage: "editor", .. }));
    }

    #[tokio::test]
    async fn test_edit_trims_overlong_text_to_sentence() {
        let sentence = "The ferry crossed the black water slowly. ";
        let (stage, _) = editor(&format!("[TEXT]\n{}", sentence.repeat(5)));
        let next = stage.run(&state_with_draft("short")).await.unwrap();
        let text = &next.draft.unwrap().text;
        assert!(measure(text, LengthUnit::Chars) <= 120);
        assert!(text.ends_with('.'));
        assert_eq!(next.status, ItemStatus::Reviewing);
    }

    #[tokio::test]
    async fn test_collapsed_output_is_malformed() {
        let (stage, _) = editor("[TEXT]\nOk.");
        let err = stage.run(&state_with_draft("x".repeat(110).as_str())).await.unwrap_err();
        assert!(err.counts_against_ceiling());
    }

    #[tokio::test]
    async fn test_failed_verdict_feedback_reaches_editor_verbatim() {
        let (stage, generator) = editor(&format!("[TEXT]\n{}", "y".repeat(110)));
        let mut state = state_with_draft(&"x".repeat(90));
        state.verdict = Some(ReviewVerdict::from_dimensions(
            vec![DimensionScore {
                name: "prose".into(),
                score: 4.0,
                passed: false,
                hard_gate: false,
                feedback: Some("Replace the weather opening.".into()),
            }],
            7.0,
        ));
        state.revision = 1;

        let next = stage.run(&state).await.unwrap();
        assert_eq!(next.draft.unwrap().revision, 1);
        let seen = generator.seen.lock().unwrap();
        assert!(seen[0].contains("- [prose] Replace the weather opening."));
        assert!(seen[0].contains("Expand by about 10"));
    }
}
