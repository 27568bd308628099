use crate::ui::icons::{AUDIT, CHECK, CROSS, DRAFT, EDIT, MEMORY, RETRY, REVIEW, SPARKLE, WARN};
use crate::workflow::WorkflowEvent;
use console::{Emoji, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for `quill write`, rendered via `indicatif`.
///
/// Two bars are stacked:
/// - Chapter bar: chapters finished out of those selected for the run
/// - Stage bar: spinner naming the stage currently running
///
/// Everything is driven by [`WorkflowEvent`]s through [`ProductionUI::handle`].
pub struct ProductionUI {
    multi: MultiProgress,
    chapter_bar: ProgressBar,
    stage_bar: ProgressBar,
    verbose: bool,
}

impl ProductionUI {
    pub fn new(total_chapters: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let chapter_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░");
        let chapter_bar = multi.add(ProgressBar::new(total_chapters));
        chapter_bar.set_style(chapter_style);
        chapter_bar.set_prefix("Chapters");

        let stage_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let stage_bar = multi.add(ProgressBar::new_spinner());
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix("   Stage");

        Self {
            multi,
            chapter_bar,
            stage_bar,
            verbose,
        }
    }

    /// A UI that draws nothing, for `--yes` runs piped to files.
    pub fn hidden(total_chapters: u64) -> Self {
        let ui = Self::new(total_chapters, false);
        ui.multi
            .set_draw_target(indicatif::ProgressDrawTarget::hidden());
        ui
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::ChapterStarted {
                sequence, title, ..
            } => {
                self.chapter_bar.set_message(format!(
                    "{} {}",
                    style(format!("#{sequence}")).yellow(),
                    title
                ));
                self.stage_bar
                    .enable_steady_tick(Duration::from_millis(100));
            }
            WorkflowEvent::StageStarted {
                stage, revision, ..
            } => {
                let revision = if *revision > 0 {
                    style(format!("(revision {revision})")).dim().to_string()
                } else {
                    String::new()
                };
                self.stage_bar
                    .set_message(format!("{}{} {}", stage_icon(stage), stage, revision));
            }
            WorkflowEvent::StageFailed {
                stage,
                attempt,
                message,
                will_retry,
                ..
            } => {
                let icon = if *will_retry { RETRY } else { WARN };
                self.print_line(format!(
                    "    {}{} attempt {} failed: {}",
                    icon,
                    stage,
                    attempt,
                    style(message).red()
                ));
            }
            WorkflowEvent::Reviewed { .. } => {
                if self.verbose
                    && let Some(line) = describe(event)
                {
                    self.print_line(format!("    {}", style(line).dim()));
                }
            }
            WorkflowEvent::ChapterAccepted { .. } => {
                self.chapter_bar.inc(1);
                if let Some(line) = describe(event) {
                    self.print_line(format!("{}{}", CHECK, line));
                }
            }
            WorkflowEvent::ChapterFailed { .. } => {
                self.stage_bar.disable_steady_tick();
                if let Some(line) = describe(event) {
                    self.print_line(format!("{}{}", CROSS, style(line).red()));
                }
            }
            WorkflowEvent::AuditCompleted { .. } => {
                if let Some(line) = describe(event) {
                    self.print_line(format!("{}{}", AUDIT, line));
                }
            }
        }
    }

    pub fn finish(&self, accepted: usize, failed: usize) {
        self.stage_bar.finish_and_clear();
        self.chapter_bar.finish_with_message(if failed == 0 {
            format!("{SPARKLE}{accepted} accepted")
        } else {
            format!("{accepted} accepted, {failed} failed")
        });
    }
}

fn stage_icon(stage: &str) -> Emoji<'static, 'static> {
    match stage {
        "producer" => DRAFT,
        "editor" => EDIT,
        "review" => REVIEW,
        _ => MEMORY,
    }
}

/// One-line summary of an event for the log above the bars.
pub fn describe(event: &WorkflowEvent) -> Option<String> {
    match event {
        WorkflowEvent::Reviewed {
            sequence,
            revision,
            aggregate,
            pass,
            failing,
            ..
        } => {
            let verdict = if *pass { "pass" } else { "fail" };
            let mut line = format!(
                "Chapter {sequence} review {}: {aggregate:.1} ({verdict})",
                revision + 1
            );
            if !failing.is_empty() {
                line.push_str(&format!(", weak: {}", failing.join(", ")));
            }
            Some(line)
        }
        WorkflowEvent::ChapterAccepted {
            sequence,
            revisions,
            records,
            ..
        } => Some(format!(
            "Chapter {sequence} accepted after {revisions} revision(s), {records} memory record(s)"
        )),
        WorkflowEvent::ChapterFailed {
            sequence, reason, ..
        } => Some(format!("Chapter {sequence} failed: {reason}")),
        WorkflowEvent::AuditCompleted {
            through_chapter,
            inconsistencies,
            stale_threads,
            ..
        } => Some(format!(
            "Audit through chapter {through_chapter}: {inconsistencies} inconsistencies, {stale_threads} stale threads"
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkId;

    #[test]
    fn test_describe_failing_review() {
        let event = WorkflowEvent::Reviewed {
            work_id: WorkId::new("w"),
            sequence: 3,
            revision: 1,
            aggregate: 6.4,
            pass: false,
            failing: vec!["length".into(), "prose".into()],
        };
        assert_eq!(
            describe(&event).unwrap(),
            "Chapter 3 review 2: 6.4 (fail), weak: length, prose"
        );
    }

    #[test]
    fn test_stage_events_have_no_summary() {
        let event = WorkflowEvent::StageStarted {
            work_id: WorkId::new("w"),
            sequence: 1,
            stage: "producer".into(),
            revision: 0,
        };
        assert!(describe(&event).is_none());
    }

    #[test]
    fn test_hidden_ui_handles_every_event() {
        let ui = ProductionUI::hidden(1);
        let work_id = WorkId::new("w");
        ui.handle(&WorkflowEvent::ChapterStarted {
            work_id: work_id.clone(),
            sequence: 1,
            title: "Chapter 1".into(),
        });
        ui.handle(&WorkflowEvent::ChapterAccepted {
            work_id,
            sequence: 1,
            revisions: 0,
            attempts: 0,
            records: 2,
        });
        ui.finish(1, 0);
    }
}
