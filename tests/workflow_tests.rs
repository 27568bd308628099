//! Workflow tests for quill
//!
//! These drive the real engine, stages and memory store end to end with a
//! scripted generator standing in for the model backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use quill::consistency::{Comparator, ConsistencyAuditor, Judgement, Severity};
use quill::errors::{GenerationError, WorkflowError};
use quill::generation::{GenerationRequest, Generator, HashingEmbedder, RetryPolicy, Role};
use quill::memory::{ContextRetriever, Cosine, MemoryRecord, MemoryStore, RecordKind};
use quill::quill_config::{AuditConfig, MemoryConfig, ReviewConfig};
use quill::stages::text::LengthUnit;
use quill::stages::{EditorStage, MemoryUpdateStage, ProducerStage, ReviewStage, Stages};
use quill::work::{ChapterArchive, ItemStatus, LengthRange, Work, WorkId, WorkItem, WorkStore};
use quill::workflow::{
    ChapterOutcome, EngineOptions, EventSink, FailureCause, RangeAborted, WorkScheduler,
    WorkflowEngine, WorkflowEvent,
};

// =============================================================================
// Scripted collaborators
// =============================================================================

/// Answers each role the way a well-behaved model would, with knobs for the
/// behaviours under test.
struct Scripted {
    /// Score given to every judged dimension
    review_score: f32,
    /// Non-whitespace characters in each first draft; 0 yields an empty body
    draft_chars: usize,
    /// Character state reported by the memory extractor, per chapter
    anna: HashMap<u32, String>,
    /// Producer calls for a work whose title contains this never return
    stall_on: Option<String>,
    /// Memory extraction calls never return while set
    stall_memory: AtomicBool,
    /// Returned by the next producer calls, one per call, before any draft
    producer_errors: Mutex<VecDeque<GenerationError>>,
    /// Memory extraction for this chapter is rejected outright
    memory_rejected_on: Option<u32>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl Scripted {
    fn passing() -> Self {
        Self {
            review_score: 9.0,
            draft_chars: 200,
            anna: HashMap::new(),
            stall_on: None,
            stall_memory: AtomicBool::new(false),
            producer_errors: Mutex::new(VecDeque::new()),
            memory_rejected_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self, role: Role) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.role == role)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Generator for Scripted {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push(request.clone());

        match request.role {
            Role::Producer => {
                if let Some(err) = self.producer_errors.lock().unwrap().pop_front() {
                    return Err(err);
                }
                if let Some(title) = &self.stall_on
                    && request.system.contains(title.as_str())
                {
                    std::future::pending::<()>().await;
                }
                let chapter = leading_number(&request.instruction, "Write chapter ");
                if self.draft_chars == 0 {
                    return Ok("[TITLE]\nUntitled\n[TEXT]\n".to_string());
                }
                Ok(format!(
                    "[TITLE]\nHarbor {chapter}\n[TEXT]\n{}",
                    prose(chapter, self.draft_chars)
                ))
            }
            Role::Editor => Ok(format!("[NOTES]\nTightened.\n[TEXT]\n{}", request.context)),
            Role::Reviewer => {
                let s = self.review_score;
                Ok(format!(
                    r#"{{"scores": {{"outline": {s}, "prose": {s}, "continuity": {s}}},
                        "feedback": {{"prose": "Cut the weather and show Anna acting."}}}}"#
                ))
            }
            Role::Memory => {
                if self.stall_memory.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                let chapter = leading_number(&request.context, "Part ");
                if self.memory_rejected_on == Some(chapter) {
                    return Err(GenerationError::Api {
                        status: 401,
                        message: "invalid api key".to_string(),
                    });
                }
                let mut reply = format!(
                    "[SUMMARY]\nSummary of chapter {chapter}: the harbor keeps its secrets.\n"
                );
                if let Some(state) = self.anna.get(&chapter) {
                    reply.push_str(&format!("[CHARACTERS]\nAnna: {state}\n"));
                }
                reply.push_str("[TONE]\nquiet");
                Ok(reply)
            }
            Role::Auditor => Ok("CONSISTENT".to_string()),
        }
    }
}

fn leading_number(text: &str, prefix: &str) -> u32 {
    text.strip_prefix(prefix)
        .unwrap_or_default()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

/// One paragraph of at least `target` non-whitespace characters that passes
/// every style rule.
fn prose(chapter: u32, target: usize) -> String {
    const WORDS: [&str; 8] = ["Rain", "fell", "on", "the", "quiet", "harbor", "at", "dusk."];
    let mut text = format!("Part {chapter}.");
    let mut count = text.chars().filter(|c| !c.is_whitespace()).count();
    for word in WORDS.iter().cycle() {
        if count >= target {
            break;
        }
        text.push(' ');
        text.push_str(word);
        count += word.chars().count();
    }
    text
}

/// Flags a character state that comes back from the dead.
struct Resurrection;

#[async_trait]
impl Comparator for Resurrection {
    async fn compare(
        &self,
        earlier: &MemoryRecord,
        later: &MemoryRecord,
    ) -> Result<Judgement, GenerationError> {
        if earlier.text().contains("dead") && later.text().contains("alive") {
            return Ok(Judgement {
                contradictory: true,
                severity: Severity::Critical,
                explanation: "dead character reappears".to_string(),
            });
        }
        Ok(Judgement::consistent())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    _dir: TempDir,
    works: Arc<WorkStore>,
    memory: Arc<MemoryStore>,
    generator: Arc<Scripted>,
}

impl Harness {
    fn new(generator: Scripted) -> Self {
        let dir = TempDir::new().unwrap();
        let works = Arc::new(WorkStore::new(dir.path().join("works")));
        let memory = Arc::new(MemoryStore::in_memory(
            Arc::new(HashingEmbedder::default()),
            Arc::new(Cosine),
        ));
        Self {
            _dir: dir,
            works,
            memory,
            generator: Arc::new(generator),
        }
    }

    fn add(&self, work: &Work) {
        self.works.create(work).unwrap();
    }

    fn engine(&self, options: EngineOptions) -> WorkflowEngine {
        let generator: Arc<dyn Generator> = self.generator.clone();
        let timeout = Duration::from_secs(30);
        let retriever = Arc::new(ContextRetriever::new(
            self.memory.clone(),
            MemoryConfig::default(),
        ));
        let stages = Stages::new(
            ProducerStage::new(generator.clone(), retriever, timeout, LengthUnit::Chars),
            EditorStage::new(generator.clone(), timeout, LengthUnit::Chars),
            ReviewStage::new(
                Some(generator.clone()),
                ReviewConfig::default(),
                LengthUnit::Chars,
                timeout,
            ),
            MemoryUpdateStage::new(generator, self.memory.clone(), timeout, 0.75),
        );
        let auditor = Arc::new(ConsistencyAuditor::new(
            self.memory.clone(),
            Arc::new(Resurrection),
            Arc::new(Cosine),
            AuditConfig::default(),
        ));
        WorkflowEngine::new(stages, self.works.clone(), auditor, options)
    }

    fn status(&self, work: &WorkId, sequence: u32) -> (ItemStatus, u32) {
        let loaded = self.works.load(work).unwrap();
        let item = loaded.item(sequence).unwrap();
        (item.status, item.revisions)
    }
}

fn options(max_revisions: u32, audit_interval: u32) -> EngineOptions {
    EngineOptions {
        max_revisions,
        audit_interval,
        ending_chars: 500,
        retry: RetryPolicy::new(3, Duration::from_secs(30), Duration::from_millis(1)),
    }
}

fn work(id: &str, chapters: u32, length: LengthRange) -> Work {
    Work {
        id: WorkId::new(id),
        title: format!("The {id} Chronicle"),
        genre: "mystery".to_string(),
        synopsis: String::new(),
        style_guide: String::new(),
        created_at: Utc::now(),
        items: (1..=chapters)
            .map(|n| WorkItem::new(n, &format!("Chapter {n} of the harbor mystery"), length))
            .collect(),
    }
}

fn short() -> LengthRange {
    LengthRange::new(100, 400)
}

fn drain(rx: &mut mpsc::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Revision budget
// =============================================================================

mod revision_budget {
    use super::*;

    #[tokio::test]
    async fn test_always_failing_review_exhausts_budget() {
        let h = Harness::new(Scripted {
            review_score: 3.0,
            ..Scripted::passing()
        });
        let w = work("budget", 1, short());
        h.add(&w);
        let (tx, mut rx) = mpsc::channel(256);
        let engine = h.engine(options(3, 0)).with_events(EventSink::new(tx));

        let report = engine
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        let (sequence, failure) = report.failed().unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(failure.revisions, 3);
        assert_eq!(failure.cause, FailureCause::QualityGate);
        let verdict = failure.last_verdict.as_ref().unwrap();
        assert!(!verdict.pass);
        assert!(verdict.failing_dimensions().contains(&"prose"));

        // one draft, the first edit plus one re-edit per revision
        assert_eq!(h.generator.calls(Role::Producer).len(), 1);
        assert_eq!(h.generator.calls(Role::Editor).len(), 4);
        assert_eq!(h.generator.calls(Role::Reviewer).len(), 4);
        assert!(h.generator.calls(Role::Memory).is_empty());

        let reviewed: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::Reviewed { revision, pass, .. } => {
                    assert!(!pass);
                    Some(revision)
                }
                _ => None,
            })
            .collect();
        assert_eq!(reviewed, vec![0, 1, 2, 3]);
        assert_eq!(h.status(&w.id, 1), (ItemStatus::Failed, 3));
    }

    #[tokio::test]
    async fn test_failed_review_feedback_reaches_editor() {
        let h = Harness::new(Scripted {
            review_score: 3.0,
            ..Scripted::passing()
        });
        let w = work("feedback", 1, short());
        h.add(&w);
        h.engine(options(1, 0))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        let edits = h.generator.calls(Role::Editor);
        assert_eq!(edits.len(), 2);
        assert!(!edits[0].instruction.contains("rejected"));
        assert!(edits[1].instruction.contains("Cut the weather"));
    }

    #[tokio::test]
    async fn test_short_draft_fails_length_gate() {
        let h = Harness::new(Scripted {
            draft_chars: 1800,
            ..Scripted::passing()
        });
        let w = work("length", 1, LengthRange::new(2050, 2300));
        h.add(&w);

        let report = h
            .engine(options(1, 0))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        let (_, failure) = report.failed().unwrap();
        let verdict = failure.last_verdict.as_ref().unwrap();
        assert_eq!(verdict.failing_dimensions(), vec!["length"]);
        assert_eq!(verdict.gated_by.as_deref(), Some("length"));
        assert!(verdict.aggregate <= 6.0);
        assert!(verdict.feedback["length"].contains("Expand"));
        assert_eq!(h.generator.calls(Role::Reviewer).len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_drafts_stop_at_attempt_ceiling() {
        let h = Harness::new(Scripted {
            draft_chars: 0,
            ..Scripted::passing()
        });
        let w = work("empty", 1, short());
        h.add(&w);
        let (tx, mut rx) = mpsc::channel(256);
        let engine = h.engine(options(3, 0)).with_events(EventSink::new(tx));

        let report = engine
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        let (_, failure) = report.failed().unwrap();
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.cause, FailureCause::MalformedOutput { .. }));
        assert_eq!(h.generator.calls(Role::Producer).len(), 3);

        let retries: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StageFailed { will_retry, .. } => Some(will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_generation_timeout_is_retried() {
        let h = Harness::new(Scripted {
            producer_errors: Mutex::new(VecDeque::from([GenerationError::Timeout {
                after: Duration::from_secs(30),
            }])),
            ..Scripted::passing()
        });
        let w = work("timeout", 1, short());
        h.add(&w);

        let report = h
            .engine(options(3, 0))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        match &report.outcomes[0].1 {
            ChapterOutcome::Accepted { attempts, .. } => assert_eq!(*attempts, 1),
            other => panic!("expected accepted chapter, got {other:?}"),
        }
        assert_eq!(h.generator.calls(Role::Producer).len(), 2);
        assert_eq!(h.status(&w.id, 1).0, ItemStatus::Accepted);
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_without_retry() {
        let h = Harness::new(Scripted {
            producer_errors: Mutex::new(VecDeque::from([GenerationError::Api {
                status: 401,
                message: "invalid api key".to_string(),
            }])),
            ..Scripted::passing()
        });
        let w = work("denied", 1, short());
        h.add(&w);

        let report = h
            .engine(options(3, 0))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        let (_, failure) = report.failed().unwrap();
        assert!(matches!(failure.cause, FailureCause::Fatal { .. }));
        assert!(failure.last_verdict.is_none());
        assert_eq!(h.generator.calls(Role::Producer).len(), 1);
        assert_eq!(h.status(&w.id, 1).0, ItemStatus::Failed);
    }
}

// =============================================================================
// Memory across chapters
// =============================================================================

mod memory_flow {
    use super::*;

    #[tokio::test]
    async fn test_accepted_chapter_feeds_next_producer() {
        let h = Harness::new(Scripted::passing());
        let w = work("memory", 2, short());
        h.add(&w);

        let report = h
            .engine(options(3, 0))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.accepted(), 2);

        let drafts = h.generator.calls(Role::Producer);
        assert_eq!(drafts.len(), 2);
        assert!(!drafts[0].context.contains("Summary of chapter"));
        assert!(drafts[1].context.contains("Summary of chapter 1"));
        assert!(drafts[1].context.contains("How the previous chapter ended"));

        match &report.outcomes[0].1 {
            ChapterOutcome::Accepted { record_ids, .. } => assert!(!record_ids.is_empty()),
            other => panic!("expected accepted chapter, got {other:?}"),
        }
        assert_eq!(h.memory.count(&w.id).await.unwrap(), 2);
        assert_eq!(h.status(&w.id, 2), (ItemStatus::Accepted, 0));
    }

    #[tokio::test]
    async fn test_rerun_skips_accepted_chapters() {
        let h = Harness::new(Scripted::passing());
        let w = work("rerun", 2, short());
        h.add(&w);
        let engine = h.engine(options(3, 0));
        engine
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        let reloaded = h.works.load(&w.id).unwrap();
        let report = engine
            .produce_chapter_range(&reloaded, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, vec![1, 2]);
        assert!(report.outcomes.is_empty());
        assert_eq!(h.generator.calls(Role::Producer).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_selection_is_rejected() {
        let h = Harness::new(Scripted::passing());
        let w = work("unknown", 2, short());
        h.add(&w);

        let err = h
            .engine(options(3, 0))
            .produce_chapter_range(&w, Some(&[7][..]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, WorkflowError::UnknownItem { sequence: 7, .. }));
        assert!(err.report.outcomes.is_empty());
        assert!(h.generator.calls(Role::Producer).is_empty());
    }

    #[tokio::test]
    async fn test_character_named_twice_keeps_one_current_state() {
        let mut anna = HashMap::new();
        anna.insert(1, "at the dock\nAnna: holding the letter".to_string());
        anna.insert(2, "on the ferry\nAnna: asleep in the cabin".to_string());
        let h = Harness::new(Scripted {
            anna,
            ..Scripted::passing()
        });
        let w = work("twice", 2, short());
        h.add(&w);

        let report = h
            .engine(options(3, 0))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.accepted(), 2);

        let current: Vec<MemoryRecord> = h
            .memory
            .records(&w.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.kind() == RecordKind::CharacterState && r.is_current())
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].chapter, 2);
        assert!(current[0].text().contains("asleep in the cabin"));
    }
}

// =============================================================================
// Consistency audits
// =============================================================================

mod audits {
    use super::*;

    #[tokio::test]
    async fn test_audits_run_on_interval() {
        let h = Harness::new(Scripted::passing());
        let w = work("serial", 12, short());
        h.add(&w);
        let (tx, mut rx) = mpsc::channel(1024);
        let engine = h.engine(options(3, 5)).with_events(EventSink::new(tx));

        let report = engine
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.accepted(), 12);
        let through: Vec<u32> = report.audits.iter().map(|a| a.through_chapter).collect();
        assert_eq!(through, vec![5, 10]);

        let events = drain(&mut rx);
        let audit_positions: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, WorkflowEvent::AuditCompleted { .. }))
            .map(|(i, _)| i)
            .collect();
        let twelfth = events
            .iter()
            .position(|e| matches!(e, WorkflowEvent::ChapterStarted { sequence: 12, .. }))
            .unwrap();
        assert_eq!(audit_positions.len(), 2);
        assert!(audit_positions.iter().all(|p| *p < twelfth));
    }

    #[tokio::test]
    async fn test_contradictory_character_states_are_reported() {
        let mut anna = HashMap::new();
        anna.insert(2, "dead, killed at the ferry".to_string());
        anna.insert(4, "alive and well in Harrow".to_string());
        let h = Harness::new(Scripted {
            anna,
            ..Scripted::passing()
        });
        let w = work("continuity", 5, short());
        h.add(&w);

        let report = h
            .engine(options(3, 5))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.audits.len(), 1);
        let audit = &report.audits[0];
        assert_eq!(audit.inconsistencies.len(), 1);
        let found = &audit.inconsistencies[0];
        assert_eq!(found.chapters, vec![2, 4]);
        assert_eq!(found.subject.as_deref(), Some("Anna"));
        assert_eq!(found.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_aborted_range_keeps_finished_audits() {
        let h = Harness::new(Scripted {
            memory_rejected_on: Some(3),
            ..Scripted::passing()
        });
        let w = work("aborted", 4, short());
        h.add(&w);

        let aborted = h
            .engine(options(3, 1))
            .produce_chapter_range(&w, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            aborted.source,
            WorkflowError::MemoryUpdate { sequence: 3, .. }
        ));
        assert_eq!(aborted.report.accepted(), 2);
        let through: Vec<u32> = aborted
            .report
            .audits
            .iter()
            .map(|a| a.through_chapter)
            .collect();
        assert_eq!(through, vec![1, 2]);
        assert!(h.works.chapter(&w.id, 3).unwrap().is_none());
        assert_ne!(h.status(&w.id, 3).0, ItemStatus::Accepted);
    }
}

// =============================================================================
// Scheduling and cancellation
// =============================================================================

mod scheduling {
    use super::*;

    #[tokio::test]
    async fn test_cancelling_one_work_leaves_others_running() {
        let h = Harness::new(Scripted {
            stall_on: Some("The stalled Chronicle".to_string()),
            ..Scripted::passing()
        });
        let stalled = work("stalled", 2, short());
        let flowing = work("flowing", 2, short());
        h.add(&stalled);
        h.add(&flowing);

        let engine = Arc::new(h.engine(options(3, 0)));
        let mut scheduler = WorkScheduler::new(engine);
        scheduler.spawn(stalled.clone(), None).unwrap();
        scheduler.spawn(flowing.clone(), None).unwrap();
        assert!(scheduler.spawn(flowing.clone(), None).is_err());

        // wait until the stalled work is inside its producer call
        for _ in 0..400 {
            let waiting = h
                .generator
                .calls(Role::Producer)
                .iter()
                .any(|r| r.system.contains("The stalled Chronicle"));
            if waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.cancel(&stalled.id));
        assert!(!scheduler.cancel(&WorkId::new("missing")));

        let runs = scheduler.join_all().await;
        assert_eq!(runs.len(), 2);
        for run in runs {
            if run.work_id == stalled.id {
                assert!(matches!(
                    run.result,
                    Err(RangeAborted {
                        source: WorkflowError::Cancelled { sequence: 1 },
                        ..
                    })
                ));
            } else {
                assert_eq!(run.result.unwrap().accepted(), 2);
            }
        }

        // drafts are never persisted, so the item restarts from pending
        assert_eq!(h.status(&stalled.id, 1), (ItemStatus::Pending, 0));
        assert_eq!(h.status(&flowing.id, 2), (ItemStatus::Accepted, 0));
    }

    #[tokio::test]
    async fn test_cancel_during_memory_update_leaves_chapter_pending() {
        let h = Harness::new(Scripted {
            stall_memory: AtomicBool::new(true),
            ..Scripted::passing()
        });
        let w = work("remember", 1, short());
        h.add(&w);
        let engine = Arc::new(h.engine(options(3, 0)));
        let token = CancellationToken::new();

        let run = {
            let engine = engine.clone();
            let w = w.clone();
            let token = token.clone();
            tokio::spawn(async move { engine.produce_chapter_range(&w, None, &token).await })
        };
        for _ in 0..400 {
            if !h.generator.calls(Role::Memory).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();

        let aborted = run.await.unwrap().unwrap_err();
        assert!(matches!(
            aborted.source,
            WorkflowError::Cancelled { sequence: 1 }
        ));
        // the review passed but nothing was saved, so the chapter starts over
        assert_eq!(h.status(&w.id, 1), (ItemStatus::Pending, 0));
        assert!(h.works.chapter(&w.id, 1).unwrap().is_none());
        assert_eq!(h.memory.count(&w.id).await.unwrap(), 0);

        h.generator.stall_memory.store(false, Ordering::SeqCst);
        let reloaded = h.works.load(&w.id).unwrap();
        let report = engine
            .produce_chapter_range(&reloaded, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.accepted(), 1);
        assert!(h.works.chapter(&w.id, 1).unwrap().is_some());
        assert_eq!(h.status(&w.id, 1).0, ItemStatus::Accepted);
    }

    #[tokio::test]
    async fn test_cancel_all_stops_every_work() {
        let h = Harness::new(Scripted {
            stall_on: Some("Chronicle".to_string()),
            ..Scripted::passing()
        });
        let first = work("first", 1, short());
        let second = work("second", 1, short());
        h.add(&first);
        h.add(&second);

        let token = CancellationToken::new();
        let mut scheduler = WorkScheduler::with_token(Arc::new(h.engine(options(3, 0))), token);
        scheduler.spawn(first, None).unwrap();
        scheduler.spawn(second, None).unwrap();
        scheduler.cancel_all();

        let runs = scheduler.join_all().await;
        assert_eq!(runs.len(), 2);
        assert!(
            runs.iter()
                .all(|r| matches!(&r.result, Err(e) if matches!(e.source, WorkflowError::Cancelled { .. })))
        );
    }
}
