//! Tests for the exam runtime over a fault-injecting SQLite store.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tryout::config::RuntimeConfig;
use tryout::runtime::{ExamRuntime, LoadState, Phase, RuntimeError, SlotState, TickOutcome};
use tryout::session::SessionService;
use tryout::storage::sqlite::SqliteStore;
use tryout::storage::{Question, SessionStatus, SessionStore};

use crate::support::{self, FlakyStore, TRYOUT, USER};

struct Harness {
    sqlite: Arc<SqliteStore>,
    flaky: Arc<FlakyStore>,
    sessions: SessionService,
    session_id: String,
    questions: Vec<Question>,
}

impl Harness {
    async fn new(minutes: u32) -> Self {
        let sqlite = support::sqlite().await;
        let questions =
            support::seed_tryout(&sqlite, &support::tryout(TRYOUT, true, minutes), 4).await;
        let session = sqlite
            .create_or_resume_session(&support::new_session(TRYOUT, USER, 1, minutes * 60))
            .await
            .expect("create session");
        let flaky = FlakyStore::new(sqlite.clone());
        let (audit, _writer) = support::audit(sqlite.clone());
        let sessions = support::sessions(flaky.clone(), audit);
        Self {
            sqlite,
            flaky,
            sessions,
            session_id: session.session_id,
            questions,
        }
    }

    fn runtime(&self) -> ExamRuntime {
        let config = RuntimeConfig {
            persist_interval_secs: 30,
            ..RuntimeConfig::default()
        };
        ExamRuntime::new(self.session_id.clone(), self.sessions.clone(), &config)
    }

    async fn loaded(&self) -> ExamRuntime {
        let runtime = self.runtime();
        runtime.load().await.expect("load");
        runtime
    }

    async fn set_remaining(&self, seconds: u32) {
        self.sqlite
            .update_time_remaining(&self.session_id, seconds)
            .await
            .expect("set remaining");
    }

    async fn stored_remaining(&self) -> u32 {
        self.sqlite
            .fetch_session(&self.session_id)
            .await
            .expect("read")
            .expect("exists")
            .time_remaining_seconds
    }

    fn qid(&self, index: usize) -> i64 {
        self.questions[index].question_id
    }
}

fn tick_n(runtime: &ExamRuntime, n: u32) -> Vec<TickOutcome> {
    (0..n).map(|_| runtime.tick()).collect()
}

#[tokio::test]
async fn reload_resumes_from_last_persisted_value() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    assert_eq!(runtime.time_remaining(), 3600);
    assert_eq!(runtime.tryout_id(), Some(TRYOUT));
    assert_eq!(runtime.questions().len(), 4);

    let outcomes = tick_n(&runtime, 30);
    assert_eq!(outcomes.last(), Some(&TickOutcome::Persist(3570)));
    runtime.settle().await;

    assert_eq!(runtime.last_persisted(), Some(3570));
    assert_eq!(*h.flaky.timer_writes.lock().expect("lock"), vec![3570]);
    assert_eq!(h.stored_remaining().await, 3570);

    // Simulated refresh: a fresh runtime over the same session.
    let reloaded = h.loaded().await;
    assert_eq!(reloaded.time_remaining(), 3570);
}

#[tokio::test]
async fn failed_timer_write_keeps_counting() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    h.flaky.fail_timer.store(true, Ordering::SeqCst);

    tick_n(&runtime, 30);
    runtime.settle().await;

    assert_eq!(runtime.time_remaining(), 3570);
    assert_eq!(runtime.phase(), Phase::Active);
    assert_eq!(runtime.last_persisted(), Some(3600));
    assert_eq!(h.stored_remaining().await, 3600);
}

#[tokio::test]
async fn saved_answer_survives_reload() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;

    runtime.save_answer(h.qid(0), "B").expect("save");
    assert_eq!(runtime.answer(h.qid(0)).as_deref(), Some("B"));
    runtime.settle().await;

    let slot = runtime.answer_slot(h.qid(0)).expect("slot");
    assert_eq!(slot.state(), SlotState::Committed);
    assert_eq!(slot.last_committed(), Some("B"));

    let reloaded = h.loaded().await;
    assert_eq!(reloaded.answer(h.qid(0)).as_deref(), Some("B"));
}

#[tokio::test]
async fn failed_save_affects_only_its_question() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    h.flaky.fail_answer(h.qid(1), true);

    runtime.save_answer(h.qid(0), "A").expect("save");
    runtime.save_answer(h.qid(1), "C").expect("save");
    runtime.save_answer(h.qid(2), "D").expect("save");
    runtime.settle().await;

    let failed = runtime.answer_slot(h.qid(1)).expect("slot");
    assert_eq!(failed.state(), SlotState::Failed);
    assert_eq!(failed.visible(), None);

    for (index, answer) in [(0, "A"), (2, "D")] {
        let slot = runtime.answer_slot(h.qid(index)).expect("slot");
        assert_eq!(slot.state(), SlotState::Committed);
        assert_eq!(slot.visible(), Some(answer));
    }
    assert_eq!(runtime.answers().len(), 2);
}

#[tokio::test]
async fn failed_save_reverts_to_last_committed() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;

    runtime.save_answer(h.qid(0), "B").expect("save");
    runtime.settle().await;

    h.flaky.fail_answer(h.qid(0), true);
    runtime.save_answer(h.qid(0), "D").expect("save");
    runtime.settle().await;

    let slot = runtime.answer_slot(h.qid(0)).expect("slot");
    assert_eq!(slot.state(), SlotState::Failed);
    assert_eq!(slot.visible(), Some("B"));
    assert_eq!(runtime.answer(h.qid(0)).as_deref(), Some("B"));

    // A later successful save clears the failure.
    h.flaky.fail_answer(h.qid(0), false);
    runtime.save_answer(h.qid(0), "C").expect("save");
    runtime.settle().await;
    let slot = runtime.answer_slot(h.qid(0)).expect("slot");
    assert_eq!(slot.state(), SlotState::Committed);
    assert_eq!(slot.visible(), Some("C"));
}

#[tokio::test]
async fn rapid_saves_land_on_latest_answer() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;

    for answer in ["A", "B", "C", "D"] {
        runtime.save_answer(h.qid(3), answer).expect("save");
    }
    runtime.settle().await;

    assert_eq!(runtime.answer(h.qid(3)).as_deref(), Some("D"));
    let workspace = h.sqlite.fetch_workspace(&h.session_id).await.expect("workspace");
    assert_eq!(workspace.answers.get(&h.qid(3)).map(String::as_str), Some("D"));
}

#[tokio::test]
async fn unknown_question_is_rejected() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    assert!(matches!(
        runtime.save_answer(9_999, "A"),
        Err(RuntimeError::UnknownQuestion(9_999))
    ));
}

#[tokio::test]
async fn bookmarks_are_keyed_by_question_id() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;

    assert!(runtime.toggle_bookmark(0).expect("toggle"));
    runtime.settle().await;
    assert_eq!(runtime.committed_bookmarks(), BTreeSet::from([h.qid(0)]));

    runtime.save_bookmarks(&[1, 3]).expect("save");
    runtime.settle().await;
    let expected = BTreeSet::from([h.qid(1), h.qid(3)]);
    assert_eq!(runtime.bookmarks(), expected);
    assert_eq!(runtime.bookmark_state(), SlotState::Committed);

    let reloaded = h.loaded().await;
    assert_eq!(reloaded.bookmarks(), expected);

    assert!(!runtime.toggle_bookmark(1).expect("toggle"));
    assert!(matches!(
        runtime.toggle_bookmark(10),
        Err(RuntimeError::IndexOutOfRange { index: 10, len: 4 })
    ));
}

#[tokio::test]
async fn failed_bookmark_write_keeps_local_set() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    runtime.save_bookmarks(&[2]).expect("save");
    runtime.settle().await;

    h.flaky.fail_bookmarks.store(true, Ordering::SeqCst);
    runtime.toggle_bookmark(0).expect("toggle");
    runtime.settle().await;

    assert_eq!(runtime.bookmark_state(), SlotState::Failed);
    assert_eq!(runtime.bookmarks(), BTreeSet::from([h.qid(0), h.qid(2)]));
    assert_eq!(runtime.committed_bookmarks(), BTreeSet::from([h.qid(2)]));
}

#[tokio::test]
async fn expiry_auto_submits_exactly_once() {
    let h = Harness::new(60).await;
    h.set_remaining(2).await;
    let runtime = h.loaded().await;
    runtime.save_answer(h.qid(0), "A").expect("save");

    assert_eq!(runtime.tick(), TickOutcome::Counted(1));
    assert_eq!(runtime.tick(), TickOutcome::Expired);
    assert_eq!(runtime.tick(), TickOutcome::Idle);
    runtime.settle().await;
    assert_eq!(runtime.tick(), TickOutcome::Idle);

    assert_eq!(runtime.phase(), Phase::Submitted);
    assert_eq!(h.flaky.submits(), 1);
    let result = runtime.result().expect("result");

    // A manual submit after expiry returns the stored result.
    let again = runtime.submit_exam().await.expect("repeat");
    assert_eq!(again, result);
    assert_eq!(h.flaky.submits(), 1);

    let claims = support::signer()
        .verify_submission_for_tryout(&result.submission_token, TRYOUT)
        .expect("token verifies");
    assert_eq!(claims.answers.get(&h.qid(0)).map(String::as_str), Some("A"));
    assert_eq!(claims.time_spent_seconds, 3600);
}

#[tokio::test]
async fn session_loaded_at_zero_submits_on_load() {
    let h = Harness::new(60).await;
    h.set_remaining(0).await;
    let runtime = h.loaded().await;
    runtime.settle().await;

    assert_eq!(runtime.phase(), Phase::Submitted);
    assert_eq!(h.flaky.submits(), 1);
}

#[tokio::test]
async fn failed_auto_submit_can_be_retried() {
    let h = Harness::new(60).await;
    h.set_remaining(1).await;
    let runtime = h.loaded().await;
    h.flaky.fail_submit.store(true, Ordering::SeqCst);

    assert_eq!(runtime.tick(), TickOutcome::Expired);
    runtime.settle().await;
    assert_eq!(runtime.phase(), Phase::AutoSubmitFailed);
    assert!(runtime.last_error().is_some());
    assert!(runtime.result().is_none());
    assert_eq!(runtime.tick(), TickOutcome::Idle);
    assert!(matches!(
        runtime.save_answer(h.qid(0), "A"),
        Err(RuntimeError::InvalidPhase(Phase::AutoSubmitFailed))
    ));

    h.flaky.fail_submit.store(false, Ordering::SeqCst);
    let result = runtime.retry_submit().await.expect("retry");
    assert_eq!(runtime.phase(), Phase::Submitted);
    assert_eq!(runtime.result(), Some(result));
    assert_eq!(h.flaky.submits(), 2);
    assert!(runtime.last_error().is_none());
}

#[tokio::test]
async fn expiry_stores_zero_before_auto_submit() {
    let h = Harness::new(60).await;
    h.set_remaining(45).await;
    let runtime = h.loaded().await;
    h.flaky.fail_submit.store(true, Ordering::SeqCst);

    let outcomes = tick_n(&runtime, 45);
    assert_eq!(outcomes.last(), Some(&TickOutcome::Expired));
    runtime.settle().await;
    assert_eq!(runtime.phase(), Phase::AutoSubmitFailed);
    assert_eq!(h.flaky.timer_writes.lock().expect("lock").last(), Some(&0));
    assert_eq!(h.stored_remaining().await, 0);
    assert_eq!(runtime.last_persisted(), Some(0));

    // A reload after the failed auto-submit does not reopen the attempt.
    let reloaded = h.loaded().await;
    reloaded.settle().await;
    assert_eq!(reloaded.time_remaining(), 0);
    assert_eq!(reloaded.phase(), Phase::AutoSubmitFailed);
    assert_eq!(h.flaky.submits(), 2);
}

#[tokio::test]
async fn retry_is_only_for_failed_auto_submit() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    assert!(matches!(
        runtime.retry_submit().await,
        Err(RuntimeError::InvalidPhase(Phase::Active))
    ));
}

#[tokio::test]
async fn failed_manual_submit_leaves_attempt_open() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    h.flaky.fail_submit.store(true, Ordering::SeqCst);

    assert!(runtime.submit_exam().await.is_err());
    assert_eq!(runtime.phase(), Phase::Active);
    assert!(!runtime.is_saving());
    runtime.save_answer(h.qid(1), "B").expect("still editable");
    runtime.settle().await;

    h.flaky.fail_submit.store(false, Ordering::SeqCst);
    let result = runtime.submit_exam().await.expect("submit");
    assert_eq!(result.session_id, h.session_id);
    assert_eq!(result.tryout_id, TRYOUT);
    assert_eq!(runtime.phase(), Phase::Submitted);
    assert!(matches!(
        runtime.save_answer(h.qid(1), "C"),
        Err(RuntimeError::InvalidPhase(Phase::Submitted))
    ));

    let stored = h
        .sqlite
        .fetch_session(&h.session_id)
        .await
        .expect("read")
        .expect("exists");
    assert_eq!(stored.status, SessionStatus::Completed);
}

#[tokio::test]
async fn save_failing_during_failed_submit_reverts_afterwards() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;
    h.flaky.fail_answer(h.qid(0), true);
    h.flaky.fail_submit.store(true, Ordering::SeqCst);
    let answers_held = h.flaky.answer_gate.write().await;
    let submits_held = h.flaky.submit_gate.write().await;

    runtime.save_answer(h.qid(0), "A").expect("save");
    let submit = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.submit_exam().await }
    });
    while runtime.phase() != Phase::Submitting {
        tokio::task::yield_now().await;
    }

    // The answer write fails while the submission is still in flight.
    drop(answers_held);
    runtime.settle().await;
    let slot = runtime.answer_slot(h.qid(0)).expect("slot");
    assert_eq!(slot.state(), SlotState::Failed);
    assert_eq!(slot.visible(), Some("A"));

    drop(submits_held);
    assert!(submit.await.expect("join").is_err());
    assert_eq!(runtime.phase(), Phase::Active);

    let slot = runtime.answer_slot(h.qid(0)).expect("slot");
    assert_eq!(slot.state(), SlotState::Failed);
    assert_eq!(slot.visible(), None);
    assert_eq!(runtime.answer(h.qid(0)), None);
    assert!(!runtime.is_saving());
}

#[tokio::test]
async fn completed_session_loads_as_submitted() {
    let h = Harness::new(60).await;
    h.loaded().await.submit_exam().await.expect("submit");

    let runtime = h.loaded().await;
    assert_eq!(runtime.phase(), Phase::Submitted);
    assert_eq!(runtime.tick(), TickOutcome::Idle);
}

#[tokio::test]
async fn failed_load_can_be_retried() {
    let h = Harness::new(60).await;
    let runtime = h.runtime();
    h.flaky.fail_fetch.store(true, Ordering::SeqCst);

    assert!(runtime.load().await.is_err());
    assert!(matches!(runtime.load_state(), LoadState::Failed(_)));
    assert_eq!(runtime.tick(), TickOutcome::Idle);
    assert!(matches!(
        runtime.save_answer(h.qid(0), "A"),
        Err(RuntimeError::NotLoaded)
    ));

    h.flaky.fail_fetch.store(false, Ordering::SeqCst);
    runtime.load().await.expect("retry load");
    assert_eq!(runtime.load_state(), LoadState::Ready);
    assert_eq!(runtime.time_remaining(), 3600);
}

#[tokio::test]
async fn navigation_stays_in_bounds() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;

    assert_eq!(runtime.current_index(), 0);
    assert!(!runtime.previous());
    runtime.go_to(3).expect("go to last");
    assert_eq!(
        runtime.current_question().map(|q| q.question_id),
        Some(h.qid(3))
    );
    assert!(!runtime.next());
    assert!(runtime.previous());
    assert_eq!(runtime.current_index(), 2);
    assert!(matches!(
        runtime.go_to(4),
        Err(RuntimeError::IndexOutOfRange { index: 4, len: 4 })
    ));
}

#[tokio::test]
async fn leaving_persists_remaining_time() {
    let h = Harness::new(60).await;
    let runtime = h.loaded().await;

    tick_n(&runtime, 5);
    runtime.leave().await;

    assert_eq!(runtime.phase(), Phase::Left);
    assert_eq!(runtime.tick(), TickOutcome::Idle);
    assert_eq!(h.stored_remaining().await, 3595);
    assert_eq!(runtime.last_persisted(), Some(3595));
}
