//! Live exam runtime for one attempt.
//!
//! [`ExamRuntime`] owns the question set, answers, bookmarks and the
//! countdown of a single session. Mutations are applied locally first and
//! persisted by spawned tasks, so [`ExamRuntime::tick`] and the save calls
//! never wait on storage. Persistence goes through a [`SingleFlight`] lane per
//! [`WriteKey`]; a late response can only affect local state if it belongs to
//! the latest write for its key.
//!
//! Every answer and the bookmark set carry a [`SlotState`]: `Pending` while a
//! write is in flight, `Committed` once stored, `Failed` when the latest write
//! was rejected. A failed answer reverts to its last committed value.

pub mod countdown;
pub mod driver;
pub mod flight;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::session::{SessionError, SessionService, SubmitTrigger};
use crate::storage::{Question, SessionStatus, SessionStore, StoreError};

pub use self::countdown::{Countdown, TickOutcome};
pub use self::driver::{run_countdown, CountdownExit};
pub use self::flight::{FlightOutcome, SingleFlight, Ticket};

/// Keys of independently serialized writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKey {
    /// `time_remaining` persistence.
    Timer,
    /// The whole bookmark set.
    Bookmarks,
    /// One answer, by question id.
    Answer(i64),
}

/// Progress of [`ExamRuntime::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Not loaded yet, or a load is running.
    Loading,
    /// Session and questions are available.
    Ready,
    /// The last load failed; call [`ExamRuntime::load`] again to retry.
    Failed(String),
}

/// Where the attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Countdown running, answers editable.
    Active,
    /// Countdown hit zero; auto-submit is queued.
    Expiring,
    /// A submission is in flight.
    Submitting,
    /// Submitted. Terminal.
    Submitted,
    /// Auto-submit failed; [`ExamRuntime::retry_submit`] is available.
    AutoSubmitFailed,
    /// The user navigated away.
    Left,
}

/// Persistence state of an optimistic local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Written locally, store write outstanding.
    Pending,
    /// Matches the store.
    Committed,
    /// The latest store write failed.
    Failed,
}

/// One question's answer with its persistence state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSlot {
    committed: Option<String>,
    pending: Option<String>,
    state: SlotState,
    generation: u64,
}

impl AnswerSlot {
    fn committed(answer: String) -> Self {
        Self {
            committed: Some(answer),
            pending: None,
            state: SlotState::Committed,
            generation: 0,
        }
    }

    /// The answer to display: the pending value if any, else the committed one.
    pub fn visible(&self) -> Option<&str> {
        self.pending.as_deref().or(self.committed.as_deref())
    }

    /// Last value known to be stored.
    pub fn last_committed(&self) -> Option<&str> {
        self.committed.as_deref()
    }

    /// Persistence state.
    pub fn state(&self) -> SlotState {
        self.state
    }
}

#[derive(Debug, Clone)]
struct BookmarkSlot {
    ids: BTreeSet<i64>,
    committed: BTreeSet<i64>,
    state: SlotState,
    generation: u64,
}

impl BookmarkSlot {
    fn committed(ids: BTreeSet<i64>) -> Self {
        Self {
            committed: ids.clone(),
            ids,
            state: SlotState::Committed,
            generation: 0,
        }
    }
}

/// Navigation target after a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultStage {
    /// Submitted session.
    pub session_id: String,
    /// Tryout whose result route to enter.
    pub tryout_id: i64,
    /// Token carrying the answers to the result stage.
    pub submission_token: String,
}

/// Errors from runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime has not loaded its session.
    #[error("session not loaded")]
    NotLoaded,

    /// The operation is not allowed in the current phase.
    #[error("not allowed while {0:?}")]
    InvalidPhase(Phase),

    /// The question does not belong to this session.
    #[error("unknown question {0}")]
    UnknownQuestion(i64),

    /// A position outside the loaded question list.
    #[error("question index {index} out of range ({len} questions)")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of loaded questions.
        len: usize,
    },

    /// Session service failure (lookup or submission).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
struct ExamState {
    load: LoadState,
    phase: Phase,
    tryout_id: i64,
    duration_seconds: u32,
    questions: Vec<Question>,
    current_index: usize,
    answers: BTreeMap<i64, AnswerSlot>,
    bookmarks: BookmarkSlot,
    countdown: Countdown,
    last_persisted: Option<u32>,
    result: Option<ResultStage>,
    last_error: Option<String>,
}

impl ExamState {
    fn new(persist_every: u32) -> Self {
        Self {
            load: LoadState::Loading,
            phase: Phase::Active,
            tryout_id: 0,
            duration_seconds: 0,
            questions: Vec::new(),
            current_index: 0,
            answers: BTreeMap::new(),
            bookmarks: BookmarkSlot::committed(BTreeSet::new()),
            countdown: Countdown::new(0, persist_every),
            last_persisted: None,
            result: None,
            last_error: None,
        }
    }

    fn ensure_editable(&self) -> Result<(), RuntimeError> {
        if self.load != LoadState::Ready {
            return Err(RuntimeError::NotLoaded);
        }
        match self.phase {
            Phase::Active => Ok(()),
            other => Err(RuntimeError::InvalidPhase(other)),
        }
    }

    fn visible_answers(&self) -> BTreeMap<i64, String> {
        self.answers
            .iter()
            .filter_map(|(id, slot)| slot.visible().map(|a| (*id, a.to_owned())))
            .collect()
    }

    fn time_spent(&self) -> u32 {
        self.duration_seconds
            .saturating_sub(self.countdown.remaining())
    }

    /// Revert slots whose write failed while a submission was in flight.
    fn roll_back_failed_answers(&mut self) {
        for slot in self.answers.values_mut() {
            if slot.state == SlotState::Failed {
                slot.pending = None;
            }
        }
    }

    fn accepts_late_results(&self) -> bool {
        !matches!(self.phase, Phase::Submitting | Phase::Submitted)
    }
}

struct Inner {
    session_id: String,
    sessions: SessionService,
    store: Arc<dyn SessionStore>,
    persist_every: u32,
    flights: SingleFlight<WriteKey>,
    state: Mutex<ExamState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one attempt's live state. Clones share the same attempt.
#[derive(Clone)]
pub struct ExamRuntime {
    inner: Arc<Inner>,
}

impl fmt::Debug for ExamRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExamRuntime")
            .field("session_id", &self.inner.session_id)
            .field("phase", &self.phase())
            .field("time_remaining", &self.time_remaining())
            .finish_non_exhaustive()
    }
}

/// How a submission may start from the current phase.
enum SubmitStart {
    AlreadyDone(ResultStage),
    Begin {
        answers: BTreeMap<i64, String>,
        time_spent: u32,
        previous: Phase,
    },
}

impl ExamRuntime {
    /// Create an unloaded runtime for `session_id`.
    pub fn new(
        session_id: impl Into<String>,
        sessions: SessionService,
        config: &RuntimeConfig,
    ) -> Self {
        let persist_every = config.persist_interval_secs;
        Self {
            inner: Arc::new(Inner {
                session_id: session_id.into(),
                store: sessions.store(),
                sessions,
                persist_every,
                flights: SingleFlight::new(),
                state: Mutex::new(ExamState::new(persist_every)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ExamState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // -- Loading --

    /// Fetch session metadata, then questions, saved answers and bookmarks.
    ///
    /// A failure leaves the runtime in [`LoadState::Failed`]; calling `load`
    /// again retries. A session already completed loads as
    /// [`Phase::Submitted`]. A session with no time left is auto-submitted.
    ///
    /// # Errors
    ///
    /// Returns the fetch error that caused the failed state.
    pub async fn load(&self) -> Result<(), RuntimeError> {
        {
            let mut state = self.state();
            if state.phase == Phase::Submitting {
                return Err(RuntimeError::InvalidPhase(Phase::Submitting));
            }
            state.load = LoadState::Loading;
        }

        let session_id = self.inner.session_id.as_str();
        let fetched = async {
            let session = self.inner.sessions.resume(session_id).await?;
            let workspace = self.inner.store.fetch_workspace(session_id).await?;
            Ok::<_, RuntimeError>((session, workspace))
        }
        .await;

        let (session, workspace) = match fetched {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(session_id, error = %e, "session load failed");
                self.state().load = LoadState::Failed(e.to_string());
                return Err(e);
            }
        };

        let expired_on_load = {
            let mut state = self.state();
            state.tryout_id = session.tryout_id;
            state.duration_seconds = session.duration_seconds;
            state.questions = workspace.questions;
            state.current_index = 0;
            state.answers = workspace
                .answers
                .into_iter()
                .map(|(id, answer)| (id, AnswerSlot::committed(answer)))
                .collect();
            state.bookmarks = BookmarkSlot::committed(workspace.bookmarks);
            state.countdown =
                Countdown::new(session.time_remaining_seconds, self.inner.persist_every);
            state.last_persisted = Some(session.time_remaining_seconds);
            state.last_error = None;
            state.load = LoadState::Ready;

            let expired = match session.status {
                SessionStatus::Completed => {
                    state.phase = Phase::Submitted;
                    false
                }
                SessionStatus::NotStarted | SessionStatus::InProgress => {
                    if state.countdown.remaining() == 0 && state.countdown.expire() {
                        state.phase = Phase::Expiring;
                        true
                    } else {
                        state.phase = Phase::Active;
                        false
                    }
                }
            };
            info!(
                session_id,
                questions = state.questions.len(),
                answers = state.answers.len(),
                time_remaining = state.countdown.remaining(),
                phase = ?state.phase,
                "session loaded"
            );
            expired
        };

        if expired_on_load {
            let this = self.clone();
            self.spawn(async move { this.auto_submit().await });
        }
        Ok(())
    }

    // -- Countdown --

    /// Advance the countdown by one second.
    ///
    /// Persistence and auto-submit are spawned, not awaited. Must be called
    /// from within a Tokio runtime.
    pub fn tick(&self) -> TickOutcome {
        let mut state = self.state();
        if state.load != LoadState::Ready || state.phase != Phase::Active {
            return TickOutcome::Idle;
        }

        let outcome = state.countdown.tick();
        match outcome {
            TickOutcome::Persist(seconds) => {
                let ticket = self.inner.flights.issue(WriteKey::Timer);
                drop(state);
                let this = self.clone();
                self.spawn(async move { this.persist_timer(ticket, seconds).await });
            }
            TickOutcome::Expired => {
                state.phase = Phase::Expiring;
                let ticket = self.inner.flights.issue(WriteKey::Timer);
                drop(state);
                info!(session_id = %self.inner.session_id, "time expired, auto-submitting");
                let this = self.clone();
                // Zero is stored first so a reload after a failed auto-submit
                // cannot resume from the last interval.
                self.spawn(async move {
                    this.persist_timer(ticket, 0).await;
                    this.auto_submit().await;
                });
            }
            TickOutcome::Counted(_) | TickOutcome::Idle => {}
        }
        outcome
    }

    async fn persist_timer(&self, ticket: Ticket, seconds: u32) {
        let store = Arc::clone(&self.inner.store);
        let session_id = self.inner.session_id.clone();
        let outcome = ticket
            .run(|| async move { store.update_time_remaining(&session_id, seconds).await })
            .await;

        let session_id = self.inner.session_id.as_str();
        match outcome {
            FlightOutcome::Superseded => trace!(session_id, seconds, "timer write superseded"),
            FlightOutcome::Completed(Ok(applied)) => {
                if applied {
                    self.state().last_persisted = Some(seconds);
                }
                debug!(session_id, seconds, applied, "timer persisted");
            }
            FlightOutcome::Completed(Err(e)) => {
                warn!(session_id, seconds, error = %e, "timer persistence failed");
            }
        }
    }

    // -- Answers --

    /// Set an answer locally and persist it in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime is not loaded, not active, or the
    /// question is not part of this session.
    pub fn save_answer(
        &self,
        question_id: i64,
        answer: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let answer = answer.into();
        let ticket = {
            let mut state = self.state();
            state.ensure_editable()?;
            if !state.questions.iter().any(|q| q.question_id == question_id) {
                return Err(RuntimeError::UnknownQuestion(question_id));
            }
            let ticket = self.inner.flights.issue(WriteKey::Answer(question_id));
            let slot = state.answers.entry(question_id).or_insert(AnswerSlot {
                committed: None,
                pending: None,
                state: SlotState::Committed,
                generation: 0,
            });
            slot.pending = Some(answer.clone());
            slot.state = SlotState::Pending;
            slot.generation = ticket.generation();
            ticket
        };

        let this = self.clone();
        self.spawn(async move { this.persist_answer(ticket, question_id, answer).await });
        Ok(())
    }

    async fn persist_answer(&self, ticket: Ticket, question_id: i64, answer: String) {
        let generation = ticket.generation();
        let store = Arc::clone(&self.inner.store);
        let session_id = self.inner.session_id.clone();
        let outcome = ticket
            .run(|| async move {
                store
                    .upsert_answer(&session_id, question_id, &answer)
                    .await
                    .map(|()| answer)
            })
            .await;

        let session_id = self.inner.session_id.as_str();
        let FlightOutcome::Completed(result) = outcome else {
            trace!(session_id, question_id, "answer write superseded");
            return;
        };

        let mut state = self.state();
        let late_ok = state.accepts_late_results();
        let Some(slot) = state.answers.get_mut(&question_id) else {
            return;
        };
        let current = slot.generation == generation;
        match result {
            Ok(answer) => {
                slot.committed = Some(answer);
                if current {
                    slot.pending = None;
                    slot.state = SlotState::Committed;
                }
                trace!(session_id, question_id, current, "answer committed");
            }
            Err(e) => {
                warn!(session_id, question_id, error = %e, "answer save failed");
                if current {
                    slot.state = SlotState::Failed;
                    // An in-flight submission holds the visible value until it
                    // resolves.
                    if late_ok {
                        slot.pending = None;
                    }
                }
            }
        }
    }

    // -- Bookmarks --

    /// Replace the bookmark set with the questions at `indices`.
    ///
    /// # Errors
    ///
    /// Returns an error if not editable or an index is out of range.
    pub fn save_bookmarks(&self, indices: &[usize]) -> Result<(), RuntimeError> {
        let ticket_and_ids = {
            let mut state = self.state();
            state.ensure_editable()?;
            let len = state.questions.len();
            let ids = indices
                .iter()
                .map(|&index| {
                    state
                        .questions
                        .get(index)
                        .map(|q| q.question_id)
                        .ok_or(RuntimeError::IndexOutOfRange { index, len })
                })
                .collect::<Result<BTreeSet<i64>, _>>()?;
            self.stage_bookmarks(&mut state, ids)
        };
        self.spawn_bookmark_write(ticket_and_ids);
        Ok(())
    }

    /// Flip the bookmark on the question at `index`. Returns whether it is
    /// now bookmarked.
    ///
    /// # Errors
    ///
    /// Returns an error if not editable or the index is out of range.
    pub fn toggle_bookmark(&self, index: usize) -> Result<bool, RuntimeError> {
        let (staged, marked) = {
            let mut state = self.state();
            state.ensure_editable()?;
            let len = state.questions.len();
            let question_id = state
                .questions
                .get(index)
                .map(|q| q.question_id)
                .ok_or(RuntimeError::IndexOutOfRange { index, len })?;
            let mut ids = state.bookmarks.ids.clone();
            let marked = if ids.remove(&question_id) {
                false
            } else {
                ids.insert(question_id)
            };
            (self.stage_bookmarks(&mut state, ids), marked)
        };
        self.spawn_bookmark_write(staged);
        Ok(marked)
    }

    fn stage_bookmarks(
        &self,
        state: &mut ExamState,
        ids: BTreeSet<i64>,
    ) -> (Ticket, BTreeSet<i64>) {
        let ticket = self.inner.flights.issue(WriteKey::Bookmarks);
        state.bookmarks.ids = ids.clone();
        state.bookmarks.state = SlotState::Pending;
        state.bookmarks.generation = ticket.generation();
        (ticket, ids)
    }

    fn spawn_bookmark_write(&self, (ticket, ids): (Ticket, BTreeSet<i64>)) {
        let this = self.clone();
        self.spawn(async move { this.persist_bookmarks(ticket, ids).await });
    }

    async fn persist_bookmarks(&self, ticket: Ticket, ids: BTreeSet<i64>) {
        let generation = ticket.generation();
        let store = Arc::clone(&self.inner.store);
        let session_id = self.inner.session_id.clone();
        let outcome = ticket
            .run(|| async move {
                store
                    .replace_bookmarks(&session_id, &ids)
                    .await
                    .map(|()| ids)
            })
            .await;

        let session_id = self.inner.session_id.as_str();
        let FlightOutcome::Completed(result) = outcome else {
            trace!(session_id, "bookmark write superseded");
            return;
        };

        let mut state = self.state();
        let current = state.bookmarks.generation == generation;
        match result {
            Ok(ids) => {
                state.bookmarks.committed = ids;
                if current {
                    state.bookmarks.state = SlotState::Committed;
                }
            }
            Err(e) => {
                warn!(session_id, error = %e, "bookmark save failed");
                // The local set is kept; the failed state marks the divergence.
                if current {
                    state.bookmarks.state = SlotState::Failed;
                }
            }
        }
    }

    // -- Submission --

    /// Submit the attempt and return the result-stage navigation.
    ///
    /// Repeated calls after success return the same [`ResultStage`].
    ///
    /// # Errors
    ///
    /// Propagates the submission failure; the attempt stays open so the
    /// caller can retry.
    pub async fn submit_exam(&self) -> Result<ResultStage, RuntimeError> {
        let start = self.begin_submit(|phase| {
            matches!(
                phase,
                Phase::Active | Phase::Expiring | Phase::AutoSubmitFailed
            )
        })?;
        self.finish_submit(start, SubmitTrigger::Manual).await
    }

    /// Submit because time ran out. Runs at most once per expiry; failures are
    /// logged and park the attempt in [`Phase::AutoSubmitFailed`].
    pub async fn auto_submit(&self) {
        let session_id = self.inner.session_id.as_str();
        let start = match self.begin_submit(|phase| phase == Phase::Expiring) {
            Ok(start) => start,
            Err(e) => {
                debug!(session_id, reason = %e, "auto-submit skipped");
                return;
            }
        };
        match self.finish_submit(start, SubmitTrigger::Expiry).await {
            Ok(_) => info!(session_id, "auto-submit completed"),
            Err(e) => {
                error!(session_id, error = %e, "auto-submit failed");
                self.state().phase = Phase::AutoSubmitFailed;
            }
        }
    }

    /// Retry a failed auto-submit.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidPhase`] unless auto-submit failed, or
    /// the submission error.
    pub async fn retry_submit(&self) -> Result<ResultStage, RuntimeError> {
        let start = self.begin_submit(|phase| phase == Phase::AutoSubmitFailed)?;
        self.finish_submit(start, SubmitTrigger::Expiry).await
    }

    fn begin_submit(&self, allowed: impl Fn(Phase) -> bool) -> Result<SubmitStart, RuntimeError> {
        let mut state = self.state();
        if state.load != LoadState::Ready {
            return Err(RuntimeError::NotLoaded);
        }
        if let Some(result) = &state.result {
            return Ok(SubmitStart::AlreadyDone(result.clone()));
        }
        if !allowed(state.phase) {
            return Err(RuntimeError::InvalidPhase(state.phase));
        }
        let previous = state.phase;
        state.phase = Phase::Submitting;
        Ok(SubmitStart::Begin {
            answers: state.visible_answers(),
            time_spent: state.time_spent(),
            previous,
        })
    }

    async fn finish_submit(
        &self,
        start: SubmitStart,
        trigger: SubmitTrigger,
    ) -> Result<ResultStage, RuntimeError> {
        let (answers, time_spent, previous) = match start {
            SubmitStart::AlreadyDone(stage) => return Ok(stage),
            SubmitStart::Begin {
                answers,
                time_spent,
                previous,
            } => (answers, time_spent, previous),
        };

        let submitted = self
            .inner
            .sessions
            .submit(&self.inner.session_id, answers, time_spent, trigger)
            .await;

        let mut state = self.state();
        match submitted {
            Ok(receipt) => {
                let stage = ResultStage {
                    session_id: self.inner.session_id.clone(),
                    tryout_id: receipt.tryout_id,
                    submission_token: receipt.submission_token,
                };
                state.phase = Phase::Submitted;
                state.result = Some(stage.clone());
                state.last_error = None;
                Ok(stage)
            }
            Err(e) => {
                state.phase = previous;
                state.roll_back_failed_answers();
                state.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    // -- Navigation --

    /// Jump to the question at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::IndexOutOfRange`] for a bad index.
    pub fn go_to(&self, index: usize) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.load != LoadState::Ready {
            return Err(RuntimeError::NotLoaded);
        }
        let len = state.questions.len();
        if index >= len {
            return Err(RuntimeError::IndexOutOfRange { index, len });
        }
        state.current_index = index;
        Ok(())
    }

    /// Move to the next question. Returns `false` at the end.
    pub fn next(&self) -> bool {
        let mut state = self.state();
        let next = state.current_index.saturating_add(1);
        if next < state.questions.len() {
            state.current_index = next;
            true
        } else {
            false
        }
    }

    /// Move to the previous question. Returns `false` at the start.
    pub fn previous(&self) -> bool {
        let mut state = self.state();
        match state.current_index.checked_sub(1) {
            Some(prev) => {
                state.current_index = prev;
                true
            }
            None => false,
        }
    }

    // -- Leaving --

    /// Stop the countdown, persist the current value, and wait for every
    /// in-flight write to finish.
    pub async fn leave(&self) {
        let final_write = {
            let mut state = self.state();
            if state.phase == Phase::Active {
                state.phase = Phase::Left;
                (state.load == LoadState::Ready).then(|| {
                    let ticket = self.inner.flights.issue(WriteKey::Timer);
                    (ticket, state.countdown.remaining())
                })
            } else {
                None
            }
        };
        if let Some((ticket, seconds)) = final_write {
            let this = self.clone();
            self.spawn(async move { this.persist_timer(ticket, seconds).await });
        }
        self.settle().await;
        debug!(session_id = %self.inner.session_id, "runtime left");
    }

    /// Wait for all spawned persistence and submit tasks.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut tasks = self
                    .inner
                    .tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    error!(error = %e, "runtime task panicked");
                }
            }
        }
    }

    // -- Accessors --

    /// Session this runtime drives.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Tryout of the loaded session, once loaded.
    pub fn tryout_id(&self) -> Option<i64> {
        let state = self.state();
        (state.load == LoadState::Ready).then_some(state.tryout_id)
    }

    /// Load progress.
    pub fn load_state(&self) -> LoadState {
        self.state().load.clone()
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Local countdown value.
    pub fn time_remaining(&self) -> u32 {
        self.state().countdown.remaining()
    }

    /// Last `time_remaining` known to be stored.
    pub fn last_persisted(&self) -> Option<u32> {
        self.state().last_persisted
    }

    /// Loaded questions in display order.
    pub fn questions(&self) -> Vec<Question> {
        self.state().questions.clone()
    }

    /// Position of the current question.
    pub fn current_index(&self) -> usize {
        self.state().current_index
    }

    /// The current question, if any are loaded.
    pub fn current_question(&self) -> Option<Question> {
        let state = self.state();
        state.questions.get(state.current_index).cloned()
    }

    /// Visible answer for a question.
    pub fn answer(&self, question_id: i64) -> Option<String> {
        self.state()
            .answers
            .get(&question_id)
            .and_then(|slot| slot.visible().map(str::to_owned))
    }

    /// Full slot for a question, including persistence state.
    pub fn answer_slot(&self, question_id: i64) -> Option<AnswerSlot> {
        self.state().answers.get(&question_id).cloned()
    }

    /// All visible answers.
    pub fn answers(&self) -> BTreeMap<i64, String> {
        self.state().visible_answers()
    }

    /// Bookmarked question ids as shown locally.
    pub fn bookmarks(&self) -> BTreeSet<i64> {
        self.state().bookmarks.ids.clone()
    }

    /// Bookmarked question ids last known to be stored.
    pub fn committed_bookmarks(&self) -> BTreeSet<i64> {
        self.state().bookmarks.committed.clone()
    }

    /// Persistence state of the bookmark set.
    pub fn bookmark_state(&self) -> SlotState {
        self.state().bookmarks.state
    }

    /// Any write or submission outstanding.
    pub fn is_saving(&self) -> bool {
        let state = self.state();
        state.phase == Phase::Submitting
            || state.bookmarks.state == SlotState::Pending
            || state
                .answers
                .values()
                .any(|slot| slot.state == SlotState::Pending)
    }

    /// Result navigation once submitted.
    pub fn result(&self) -> Option<ResultStage> {
        self.state().result.clone()
    }

    /// Message of the last failed submission.
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }
}
