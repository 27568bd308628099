use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use super::text::{LengthUnit, measure, section, sections};
use super::{ChapterState, Draft};
use crate::errors::StageError;
use crate::generation::{GenerationRequest, Generator, Role, with_timeout};
use crate::memory::ContextRetriever;
use crate::work::{ItemStatus, WorkItem};

/// Writes the first draft of a chapter from its outline entry and the
/// context retrieved from memory.
pub struct ProducerStage {
    generator: Arc<dyn Generator>,
    retriever: Arc<ContextRetriever>,
    timeout: Duration,
    unit: LengthUnit,
}

impl ProducerStage {
    pub fn new(
        generator: Arc<dyn Generator>,
        retriever: Arc<ContextRetriever>,
        timeout: Duration,
        unit: LengthUnit,
    ) -> Self {
        Self {
            generator,
            retriever,
            timeout,
            unit,
        }
    }

    #[instrument(skip_all, fields(chapter = state.item.sequence))]
    pub async fn run(&self, state: &ChapterState) -> Result<ChapterState, StageError> {
        let context = self.retriever.retrieve(&state.work_id, &state.item).await?;

        let mut context_block = context.text.clone();
        if let Some(ending) = &state.previous_ending {
            if !context_block.is_empty() {
                context_block.push_str("\n\n");
            }
            context_block.push_str("## How the previous chapter ended\n");
            context_block.push_str(ending);
        }

        let request = GenerationRequest::new(
            Role::Producer,
            system_prompt(state),
            instruction(&state.item, self.unit),
        )
        .with_context(context_block);

        let output = with_timeout(self.timeout, self.generator.generate(&request)).await?;
        let draft = parse_draft(&output, &state.item)?;
        debug!(
            length = measure(&draft.text, self.unit),
            title = %draft.title,
            "Draft produced"
        );

        let mut next = state.clone();
        next.context = Some(context);
        next.draft = Some(draft);
        next.status = ItemStatus::Editing;
        Ok(next)
    }
}

fn system_prompt(state: &ChapterState) -> String {
    let brief = &state.brief;
    let mut prompt = format!(
        "You are the author of the serialized {} \"{}\".",
        if brief.genre.is_empty() { "novel" } else { brief.genre.as_str() },
        brief.title
    );
    if !brief.synopsis.is_empty() {
        prompt.push_str(&format!("\nPremise: {}", brief.synopsis));
    }
    if !brief.style_guide.is_empty() {
        prompt.push_str(&format!("\nHouse style: {}", brief.style_guide));
    }
    prompt.push_str(
        "\nStay consistent with the established facts you are given. \
         Never contradict a character's current state.",
    );
    prompt
}

fn instruction(item: &WorkItem, unit: LengthUnit) -> String {
    let mut lines = vec![format!("Write chapter {}.", item.sequence)];
    if let Some(title) = &item.title {
        lines.push(format!("Working title: {title}"));
    }
    lines.push(format!("Outline: {}", item.outline));
    if !item.characters.is_empty() {
        lines.push(format!("Characters appearing: {}", item.characters.join(", ")));
    }
    if let Some(tone) = &item.tone {
        lines.push(format!("Emotional tone: {tone}"));
    }
    if let Some(hook) = &item.hook {
        lines.push(format!("End the chapter on: {hook}"));
    }
    lines.push(format!(
        "Length: between {} and {} {} characters.",
        item.length.min,
        item.length.max,
        match unit {
            LengthUnit::Chars => "non-whitespace",
            LengthUnit::Cjk => "Chinese",
        }
    ));
    lines.push("Reply with a [TITLE] line followed by [TEXT] and the chapter body.".to_string());
    lines.join("\n")
}

fn parse_draft(output: &str, item: &WorkItem) -> Result<Draft, StageError> {
    let parsed = sections(output);
    let text = match section(&parsed, "TEXT") {
        Some(text) => text.to_string(),
        None if section(&parsed, "TITLE").is_none() => output.trim().to_string(),
        None => String::new(),
    };
    if text.trim().is_empty() {
        return Err(StageError::MalformedOutput {
            stage: "producer",
            message: "response contained no chapter text".to_string(),
        });
    }

    let title = section(&parsed, "TITLE")
        .map(|t| t.lines().next().unwrap_or_default().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| item.display_title());

    Ok(Draft {
        title,
        text,
        revision: 0,
    })
}
