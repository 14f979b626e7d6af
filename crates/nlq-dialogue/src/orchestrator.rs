//! The per-session stage machine.
//!
//! A turn runs on a draft copy of the session. The draft is committed after
//! every completed stage, so a turn that is dropped mid-stage leaves the
//! session at the last completed stage. Turns on one session are serialized
//! by that session's async lock; sessions never share state.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use nlq_context::RemoteMessage;
use nlq_core::types::{QueryResult, Timestamp};
use nlq_recovery::{
    build_feedback, clarification_question, AttemptOutcome, GiveUpReason, RetryAttempt,
    RetryDecision, SqlErrorKind,
};
use nlq_semantic::{AggregationResult, ModuleKind, Priority};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::CapabilityError;
use crate::context::OrchestratorContext;
use crate::error::DialogueError;
use crate::state_machine::{awaits_user, validate_transition};
use crate::types::{
    Intent, PendingClarification, Session, SessionSnapshot, Stage, StartRequest, TurnError,
    TurnErrorKind, TurnResult,
};

const MAX_INTENT_HISTORY: usize = 50;

/// Registry entry: the session behind its turn lock, plus the last committed
/// snapshot so status reads never wait on a running turn.
struct SessionHandle {
    state: Arc<AsyncMutex<Session>>,
    snapshot: Mutex<SessionSnapshot>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self {
            snapshot: Mutex::new(session.snapshot()),
            state: Arc::new(AsyncMutex::new(session)),
        }
    }

    fn publish(&self, session: &Session) {
        match self.snapshot.lock() {
            Ok(mut snap) => *snap = session.snapshot(),
            Err(e) => warn!(session_id = %session.session_id, error = %e, "snapshot lock poisoned"),
        }
    }

    fn read(&self) -> Result<SessionSnapshot, DialogueError> {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .map_err(|e| DialogueError::Storage(format!("snapshot lock poisoned: {}", e)))
    }
}

/// What a stage asks the driver to do next.
enum StageOutcome {
    Next(Stage),
    /// Wait for the user.
    Suspend,
}

/// A stage failure, converted into a `TurnError` by the driver.
struct StageFailure {
    kind: TurnErrorKind,
    sql_error: Option<SqlErrorKind>,
    message: String,
    retryable: bool,
}

impl StageFailure {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: TurnErrorKind::Internal,
            sql_error: None,
            message: message.into(),
            retryable: false,
        }
    }

    fn capability(what: &str, message: &str) -> Self {
        Self {
            kind: TurnErrorKind::CapabilityFailed,
            sql_error: None,
            message: format!("{} failed: {}", what, message),
            retryable: true,
        }
    }

    fn timeout(what: &str, ms: u64) -> Self {
        Self {
            kind: TurnErrorKind::Timeout,
            sql_error: None,
            message: format!("{} timed out after {} ms", what, ms),
            retryable: true,
        }
    }
}

/// Scratch state of one turn.
#[derive(Default)]
struct TurnState {
    /// User reply, consumed by the clarification stage.
    input: Option<String>,
    result: Option<QueryResult>,
    analysis: Option<String>,
    clarification_question: Option<String>,
    attempted_sql: Option<String>,
    error: Option<TurnError>,
    retry_available: bool,
    steps: usize,
}

type Stepped = Result<StageOutcome, StageFailure>;

/// Drives sessions through the stage machine.
pub struct DialogueOrchestrator {
    ctx: OrchestratorContext,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl DialogueOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Create or reset a session and run a turn for `question`.
    ///
    /// A missing `session_id` gets a fresh UUID.
    pub async fn start(
        &self,
        session_id: Option<&str>,
        question: &str,
        data_source_id: Option<&str>,
    ) -> TurnResult {
        let session_id = match session_id {
            Some(id) => id.trim().to_string(),
            None => Uuid::new_v4().to_string(),
        };
        if session_id.is_empty() {
            return self.reject(&session_id, TurnErrorKind::InvalidInput, "session id must not be empty");
        }
        if let Err(message) = self.validate_text(question, "question") {
            return self.reject(&session_id, TurnErrorKind::InvalidInput, message);
        }
        let question = question.trim();

        let (handle, mut guard) = match self
            .lock_or_create(&session_id, question, data_source_id)
            .await
        {
            Ok(locked) => locked,
            Err(e) => return self.reject(&session_id, TurnErrorKind::Internal, e.to_string()),
        };

        let mut draft = guard.clone();
        if let Err(e) = self.restart(&mut draft, question) {
            drop(guard);
            return self.reject(&session_id, TurnErrorKind::Internal, e.to_string());
        }
        if let Some(ds) = data_source_id {
            draft.data_source_id = Some(ds.to_string());
        }
        info!(session_id = %session_id, "turn started");
        self.record_user(&session_id, question);
        self.drive(&handle, &mut guard, draft, TurnState::default())
            .await
    }

    /// Feed a user reply to the session's current stage.
    ///
    /// A pending clarification receives the reply as its answer. A completed
    /// or failed session treats it as a new question, which may be a
    /// follow-up on the previous result.
    pub async fn continue_turn(&self, session_id: &str, user_reply: &str) -> TurnResult {
        if let Err(message) = self.validate_text(user_reply, "reply") {
            return self.reject(session_id, TurnErrorKind::InvalidInput, message);
        }
        let reply = user_reply.trim();

        let (handle, mut guard) = match self.lock_existing(session_id).await {
            Ok(locked) => locked,
            Err(e) => return self.reject(session_id, error_kind(&e), e.to_string()),
        };

        let mut draft = guard.clone();
        let mut turn = TurnState::default();
        match draft.stage {
            Stage::IntentClarification => turn.input = Some(reply.to_string()),
            Stage::ErrorHandling | Stage::Completed => {
                if let Err(e) = self.restart(&mut draft, reply) {
                    drop(guard);
                    return self.reject(session_id, TurnErrorKind::Internal, e.to_string());
                }
            }
            Stage::IntentRecognition => draft.question = reply.to_string(),
            // Interrupted mid-turn: the reply refines the active question.
            _ => draft.question = format!("{} {}", draft.question, reply),
        }
        info!(session_id, stage = %draft.stage, "turn continued");
        self.record_user(session_id, reply);
        self.drive(&handle, &mut guard, draft, turn).await
    }

    /// Re-enter a session parked in error handling with a fresh retry budget,
    /// or resume a stage that was interrupted.
    pub async fn retry_current_stage(&self, session_id: &str) -> TurnResult {
        let (handle, mut guard) = match self.lock_existing(session_id).await {
            Ok(locked) => locked,
            Err(e) => return self.reject(session_id, error_kind(&e), e.to_string()),
        };

        let mut draft = guard.clone();
        match draft.stage {
            Stage::ErrorHandling => {
                let failed = draft.last_error.as_ref().map(|e| e.stage);
                let retryable = matches!(
                    failed,
                    Some(
                        Stage::SqlGeneration
                            | Stage::SqlExecution
                            | Stage::DataAnalysis
                            | Stage::ResultPresentation
                    )
                );
                if !retryable {
                    drop(guard);
                    return self.reject(
                        session_id,
                        TurnErrorKind::InvalidState,
                        "the failure happened before SQL generation; ask the question again",
                    );
                }
                draft.retry_count = 0;
                draft.backoff_attempts = 0;
                draft.capability_backoffs = 0;
                draft.last_error = None;
                if let Err(e) = self.transition(&mut draft, Stage::SqlGeneration) {
                    drop(guard);
                    return self.reject(session_id, TurnErrorKind::Internal, e.to_string());
                }
            }
            stage if awaits_user(stage) => {
                drop(guard);
                let message = match stage {
                    Stage::IntentClarification => "the session is waiting for a clarification reply",
                    _ => "the turn is already completed; ask a new question",
                };
                return self.reject(session_id, TurnErrorKind::InvalidState, message);
            }
            _ => {}
        }
        info!(session_id, stage = %draft.stage, "retrying current stage");
        self.drive(&handle, &mut guard, draft, TurnState::default())
            .await
    }

    /// Last committed state of a session.
    pub fn status(&self, session_id: &str) -> Result<SessionSnapshot, DialogueError> {
        self.handle(session_id)?
            .ok_or_else(|| DialogueError::SessionNotFound(session_id.to_string()))?
            .read()
    }

    /// Remove a session and its transcripts. Waits for an in-flight turn.
    /// Returns whether the session existed.
    pub async fn cleanup(&self, session_id: &str) -> bool {
        let handle = match self.handle(session_id) {
            Ok(Some(handle)) => handle,
            _ => return false,
        };
        let _guard = Arc::clone(&handle.state).lock_owned().await;
        let removed = self.remove_if_current(session_id, &handle);
        if removed {
            self.ctx.context_store.remove(session_id);
            self.ctx.ledger.clear(session_id);
            info!(session_id, "session cleaned up");
        }
        removed
    }

    /// Snapshots of every active session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<Arc<SessionHandle>> = match self.registry() {
            Ok(map) => map.values().cloned().collect(),
            Err(e) => {
                warn!(error = %e, "cannot list sessions");
                return vec![];
            }
        };
        let mut snapshots: Vec<SessionSnapshot> =
            handles.iter().filter_map(|h| h.read().ok()).collect();
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        snapshots
    }

    /// Start independent sessions concurrently. Results are in request order.
    pub async fn bulk_start(self: &Arc<Self>, requests: Vec<StartRequest>) -> Vec<TurnResult> {
        let mut tasks = JoinSet::new();
        for (index, request) in requests.iter().cloned().enumerate() {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this
                    .start(
                        request.session_id.as_deref(),
                        &request.question,
                        request.data_source_id.as_deref(),
                    )
                    .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<TurnResult>> = vec![None; requests.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "bulk start task aborted"),
            }
        }

        results
            .into_iter()
            .zip(requests)
            .map(|(result, request)| {
                result.unwrap_or_else(|| {
                    let id = request.session_id.unwrap_or_default();
                    TurnResult::rejected(
                        &id,
                        Stage::IntentRecognition,
                        Intent::Unknown,
                        TurnError {
                            kind: TurnErrorKind::Internal,
                            sql_error: None,
                            message: "start task aborted".to_string(),
                            sql: None,
                            stage: Stage::IntentRecognition,
                        },
                    )
                })
            })
            .collect()
    }

    /// Every execution attempt recorded for a session.
    pub fn get_retry_history(&self, session_id: &str) -> Result<Vec<RetryAttempt>, DialogueError> {
        if self.handle(session_id)?.is_none() {
            return Err(DialogueError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.ctx.ledger.history(session_id)?)
    }

    /// Remove sessions idle for at least the configured timeout. Sessions
    /// with a turn in flight are never evicted. Returns the evicted ids.
    pub fn evict_idle(&self) -> Vec<String> {
        let max_idle = i64::from(self.ctx.config.dialogue.session_idle_timeout_minutes) * 60;
        let entries: Vec<(String, Arc<SessionHandle>)> = match self.registry() {
            Ok(map) => map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect(),
            Err(e) => {
                warn!(error = %e, "cannot scan sessions for eviction");
                return vec![];
            }
        };

        let mut evicted = Vec::new();
        for (id, handle) in entries {
            let idle = handle
                .read()
                .map(|s| s.updated_at.age_secs() >= max_idle)
                .unwrap_or(false);
            if !idle {
                continue;
            }
            let Ok(_busy) = handle.state.try_lock() else {
                continue;
            };
            if self.remove_if_current(&id, &handle) {
                self.ctx.context_store.remove(&id);
                self.ctx.ledger.clear(&id);
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "idle sessions evicted");
        }
        evicted
    }

    // =========================================================================
    // Turn driver
    // =========================================================================

    async fn drive(
        &self,
        handle: &SessionHandle,
        guard: &mut OwnedMutexGuard<Session>,
        mut draft: Session,
        mut turn: TurnState,
    ) -> TurnResult {
        let max_steps = self.ctx.config.dialogue.max_stage_steps.max(1);
        self.commit(handle, guard, &draft);

        loop {
            if draft.stage == Stage::Completed {
                break;
            }
            let stage = draft.stage;
            if turn.steps >= max_steps {
                let failure = StageFailure {
                    kind: TurnErrorKind::StepLimit,
                    sql_error: None,
                    message: format!("turn exceeded {} stage steps", max_steps),
                    retryable: false,
                };
                self.fail(&mut draft, &mut turn, stage, failure);
                break;
            }
            turn.steps += 1;

            let outcome = match stage {
                Stage::IntentRecognition => self.recognize_intent(&mut draft).await,
                Stage::TableSelection => self.select_tables(&mut draft).await,
                Stage::IntentClarification => self.clarify(&mut draft, &mut turn),
                Stage::SqlGeneration => self.generate_sql(&mut draft).await,
                Stage::SqlExecution => self.execute_sql(&mut draft, &mut turn).await,
                Stage::DataAnalysis => self.analyze(&mut draft, &mut turn).await,
                Stage::ResultPresentation => self.present(&mut draft, &mut turn),
                Stage::ErrorHandling | Stage::Completed => Ok(StageOutcome::Suspend),
            };

            match outcome {
                Ok(StageOutcome::Next(to)) => {
                    if let Err(e) = self.transition(&mut draft, to) {
                        self.fail(&mut draft, &mut turn, stage, StageFailure::internal(e.to_string()));
                        break;
                    }
                    self.commit(handle, guard, &draft);
                }
                Ok(StageOutcome::Suspend) => break,
                Err(failure) => {
                    self.fail(&mut draft, &mut turn, stage, failure);
                    break;
                }
            }
        }

        self.commit(handle, guard, &draft);
        let result = turn_result(&draft, turn);
        info!(
            session_id = %result.session_id,
            stage = %result.stage,
            success = result.success,
            needs_clarification = result.needs_clarification,
            "turn finished"
        );
        result
    }

    /// Move a session back to intent recognition for a new question.
    fn restart(&self, session: &mut Session, question: &str) -> Result<(), DialogueError> {
        for &to in restart_path(session.stage) {
            self.transition(session, to)?;
        }
        session.reset_for_question(question);
        Ok(())
    }

    fn transition(&self, session: &mut Session, to: Stage) -> Result<(), DialogueError> {
        validate_transition(session.stage, to)?;
        debug!(session_id = %session.session_id, from = %session.stage, to = %to, "stage transition");
        session.stage = to;
        session.updated_at = Timestamp::now();
        Ok(())
    }

    fn commit(&self, handle: &SessionHandle, guard: &mut OwnedMutexGuard<Session>, draft: &Session) {
        **guard = draft.clone();
        handle.publish(draft);
    }

    /// Park the session in error handling and record the failure.
    fn fail(&self, session: &mut Session, turn: &mut TurnState, stage: Stage, failure: StageFailure) {
        // Execution failures are counted per attempt by the stage itself.
        if stage != Stage::SqlExecution {
            session.error_count += 1;
        }
        let retry_available = failure.retryable
            && self.ctx.policy.can_retry(session.retry_count)
            && matches!(
                stage,
                Stage::SqlGeneration
                    | Stage::SqlExecution
                    | Stage::DataAnalysis
                    | Stage::ResultPresentation
            );
        let error = TurnError {
            kind: failure.kind,
            sql_error: failure.sql_error,
            message: failure.message,
            sql: turn.attempted_sql.clone(),
            stage,
        };
        if let Err(e) = self.transition(session, Stage::ErrorHandling) {
            warn!(session_id = %session.session_id, error = %e, "cannot enter error handling");
        }
        warn!(
            session_id = %session.session_id,
            stage = %stage,
            kind = %error.kind,
            retry_available,
            "turn failed: {}",
            error.message
        );
        session.last_error = Some(error.clone());
        turn.error = Some(error);
        turn.retry_available = retry_available;
    }

    /// Call a capability with the configured timeout. Timeouts are retried
    /// with exponential backoff; other failures are returned at once.
    async fn call<T, F, Fut>(
        &self,
        backoffs: &mut u32,
        what: &str,
        mut op: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        let limit = self.ctx.capability_timeout();
        loop {
            let timed_out_ms = match tokio::time::timeout(limit, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(CapabilityError::Failed(message))) => {
                    return Err(StageFailure::capability(what, &message))
                }
                Ok(Err(CapabilityError::Timeout(ms))) => ms,
                Err(_) => limit.as_millis() as u64,
            };
            if *backoffs >= self.ctx.policy.max_backoff_attempts {
                return Err(StageFailure::timeout(what, timed_out_ms));
            }
            let delay = self.ctx.policy.backoff_delay(*backoffs);
            *backoffs += 1;
            warn!(
                what,
                attempt = *backoffs,
                delay_ms = delay.as_millis() as u64,
                "capability timed out, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn recognize_intent(&self, s: &mut Session) -> Stepped {
        let question = s.question.clone();
        let keep = self.ctx.config.dialogue.recent_intents;
        let skip = s.intent_history.len().saturating_sub(keep);
        let recent: Vec<Intent> = s.intent_history[skip..].to_vec();

        let classifier = self.ctx.intent_classifier.as_ref();
        let decision = {
            let (q, r) = (question.as_str(), recent.as_slice());
            self.call(&mut s.capability_backoffs, "intent classification", move || {
                classifier.classify(q, r)
            })
            .await?
        };

        let mut intent = decision.intent;
        if decision.confidence < self.ctx.config.dialogue.intent_min_confidence {
            intent = Intent::Unknown;
        }
        // Nothing is pending once a turn reaches intent recognition.
        if intent == Intent::Clarification {
            intent = Intent::Unknown;
        }
        if intent == Intent::DataFollowup && s.previous_result.is_none() {
            intent = Intent::SmartQuery;
        }
        debug!(
            session_id = %s.session_id,
            intent = %intent,
            confidence = decision.confidence,
            reason = %decision.reason,
            "intent recognized"
        );
        s.intent = intent;
        push_intent(s, intent);

        match intent {
            Intent::SmartQuery | Intent::ReportGeneration => Ok(StageOutcome::Next(Stage::TableSelection)),
            Intent::DataFollowup => Ok(StageOutcome::Next(Stage::DataAnalysis)),
            Intent::Clarification | Intent::Unknown => {
                s.pending_clarification = Some(PendingClarification::Intent {
                    question: format!(
                        "I'm not sure what you want to know from \"{}\". Could you rephrase it and name the metric or entity you are interested in?",
                        s.question
                    ),
                });
                Ok(StageOutcome::Next(Stage::IntentClarification))
            }
        }
    }

    async fn select_tables(&self, s: &mut Session) -> Stepped {
        let question = s.question.clone();
        let data_source = s.data_source_id.clone();
        let selector = self.ctx.table_selector.as_ref();
        let candidates = {
            let (q, ds) = (question.as_str(), data_source.as_deref());
            self.call(&mut s.capability_backoffs, "table selection", move || selector.select(q, ds))
                .await?
        };

        let min = self.ctx.config.dialogue.table_min_relevance;
        let chosen: Vec<_> = candidates.iter().filter(|c| c.relevance >= min).collect();
        if chosen.is_empty() {
            let mut prompt = format!(
                "I couldn't tell which tables answer \"{}\". Which tables or business area should I look at?",
                question
            );
            let near: Vec<&str> = candidates.iter().take(3).map(|c| c.name.as_str()).collect();
            if !near.is_empty() {
                prompt.push_str(&format!(" Possible matches: {}.", near.join(", ")));
            }
            s.pending_clarification = Some(PendingClarification::Tables { question: prompt });
            return Ok(StageOutcome::Next(Stage::IntentClarification));
        }

        for candidate in chosen {
            if !s.selected_tables.contains(&candidate.name) {
                s.selected_tables.push(candidate.name.clone());
            }
            for hint in &candidate.join_hints {
                if !s.join_hints.contains(hint) {
                    s.join_hints.push(hint.clone());
                }
            }
        }
        debug!(session_id = %s.session_id, tables = ?s.selected_tables, "tables selected");
        Ok(StageOutcome::Next(Stage::SqlGeneration))
    }

    fn clarify(&self, s: &mut Session, turn: &mut TurnState) -> Stepped {
        let Some(reply) = turn.input.take() else {
            let Some(pending) = s.pending_clarification.as_ref() else {
                return Err(StageFailure::internal(
                    "clarification stage reached without a pending question",
                ));
            };
            let question = pending.question().to_string();
            if let Err(e) = self.ctx.context_store.add_clarification(&s.session_id, &question) {
                warn!(session_id = %s.session_id, error = %e, "clarification not recorded");
            }
            turn.clarification_question = Some(question);
            return Ok(StageOutcome::Suspend);
        };

        let Some(pending) = s.pending_clarification.take() else {
            return Err(StageFailure::internal("no clarification is pending"));
        };
        push_intent(s, Intent::Clarification);
        match pending {
            PendingClarification::Intent { .. } => {
                s.question = format!("{} {}", s.question, reply);
                Ok(StageOutcome::Next(Stage::IntentRecognition))
            }
            PendingClarification::Tables { .. } => {
                s.question = format!("{} {}", s.question, reply);
                Ok(StageOutcome::Next(Stage::TableSelection))
            }
            PendingClarification::SqlError { feedback, .. } => {
                s.pending_feedback = Some(format!("{}\nUser clarification: {}", feedback, reply));
                Ok(StageOutcome::Next(Stage::SqlGeneration))
            }
        }
    }

    async fn generate_sql(&self, s: &mut Session) -> Stepped {
        let profile = self.ctx.profile();
        match self
            .ctx
            .context_store
            .maybe_summarize(&s.session_id, &profile, self.ctx.summarizer.as_ref())
            .await
        {
            Ok(Some(outcome)) => debug!(
                session_id = %s.session_id,
                tokens_before = outcome.tokens_before,
                tokens_after = outcome.tokens_after,
                "transcript summarized before generation"
            ),
            Ok(None) => {}
            Err(e) => warn!(session_id = %s.session_id, error = %e, "summarization skipped"),
        }

        let scope = if s.selected_tables.is_empty() {
            None
        } else {
            Some(s.selected_tables.as_slice())
        };
        let aggregation = self
            .ctx
            .aggregator
            .aggregate(&s.question, scope, &self.ctx.budget, &priority_overrides(s.intent))
            .await;
        let transcript = self
            .ctx
            .context_store
            .remote_view(&s.session_id)
            .unwrap_or_default();
        let context_text = generation_context(
            &aggregation,
            &transcript,
            &s.join_hints,
            s.pending_feedback.as_deref(),
        );

        let question = s.question.clone();
        let dialect = self.ctx.dialect();
        let generator = self.ctx.sql_generator.as_ref();
        let generated = {
            let (q, c) = (question.as_str(), context_text.as_str());
            self.call(&mut s.capability_backoffs, "sql generation", move || {
                generator.generate(q, c, dialect)
            })
            .await?
        };

        let sql = generated.sql.trim().to_string();
        if sql.is_empty() {
            return Err(StageFailure {
                kind: TurnErrorKind::CapabilityFailed,
                sql_error: None,
                message: "sql generation returned no SQL".to_string(),
                retryable: true,
            });
        }
        debug!(
            session_id = %s.session_id,
            confidence = generated.confidence,
            context_tokens = aggregation.total_tokens_used,
            "sql generated"
        );
        s.generated_sql = Some(sql);
        s.pending_feedback = None;
        Ok(StageOutcome::Next(Stage::SqlExecution))
    }

    async fn execute_sql(&self, s: &mut Session, turn: &mut TurnState) -> Stepped {
        let Some(sql) = s.generated_sql.clone() else {
            return Err(StageFailure::internal("no SQL to execute"));
        };
        turn.attempted_sql = Some(sql.clone());
        let data_source = s.data_source_id.clone();
        let limit = self.ctx.capability_timeout();

        loop {
            let outcome = match tokio::time::timeout(
                limit,
                self.ctx.sql_executor.execute(&sql, data_source.as_deref()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(CapabilityError::Timeout(limit.as_millis() as u64)),
            };

            let message = match outcome {
                Ok(result) => {
                    self.record_attempt(
                        s,
                        &sql,
                        AttemptOutcome::Succeeded {
                            row_count: result.row_count,
                            execution_time_ms: result.execution_time_ms,
                        },
                    );
                    s.retry_count = 0;
                    s.backoff_attempts = 0;
                    if let Err(e) = self
                        .ctx
                        .context_store
                        .add_sql_response(&s.session_id, &sql, &result)
                    {
                        warn!(session_id = %s.session_id, error = %e, "sql response not recorded");
                    }
                    info!(session_id = %s.session_id, rows = result.row_count, "sql executed");
                    s.previous_result = Some(result.clone());
                    turn.result = Some(result);
                    return Ok(StageOutcome::Next(Stage::DataAnalysis));
                }
                Err(CapabilityError::Timeout(ms)) => format!("query timed out after {} ms", ms),
                Err(CapabilityError::Failed(message)) => message,
            };

            let classified = self.ctx.classifier.classify(&message, &sql, self.ctx.dialect());
            s.error_count += 1;
            self.record_attempt(
                s,
                &sql,
                AttemptOutcome::Failed {
                    error_type: classified.error_type,
                    retry_strategy: classified.retry_strategy,
                    message: message.clone(),
                },
            );

            match self
                .ctx
                .policy
                .decide(&classified, s.retry_count, s.backoff_attempts)
            {
                RetryDecision::Backoff { delay } => {
                    s.backoff_attempts += 1;
                    warn!(
                        session_id = %s.session_id,
                        attempt = s.backoff_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "connection failure, retrying same SQL"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Regenerate => {
                    s.retry_count += 1;
                    s.pending_feedback = Some(build_feedback(&s.question, &sql, &classified));
                    warn!(
                        session_id = %s.session_id,
                        error_type = %classified.error_type,
                        retry_count = s.retry_count,
                        "execution failed, regenerating SQL"
                    );
                    return Ok(StageOutcome::Next(Stage::SqlGeneration));
                }
                RetryDecision::Clarify => {
                    s.retry_count += 1;
                    s.pending_clarification = Some(PendingClarification::SqlError {
                        question: clarification_question(&classified),
                        feedback: build_feedback(&s.question, &sql, &classified),
                    });
                    return Ok(StageOutcome::Next(Stage::IntentClarification));
                }
                RetryDecision::GiveUp { reason } => {
                    let why = match reason {
                        GiveUpReason::Fatal => "not retryable",
                        GiveUpReason::RetriesExhausted => "retry limit reached",
                        GiveUpReason::BackoffExhausted => "connection retries exhausted",
                    };
                    return Err(StageFailure {
                        kind: TurnErrorKind::SqlError,
                        sql_error: Some(classified.error_type),
                        message: format!("{}: {}", why, message),
                        retryable: false,
                    });
                }
            }
        }
    }

    async fn analyze(&self, s: &mut Session, turn: &mut TurnState) -> Stepped {
        let result = match s.intent {
            Intent::DataFollowup => s.previous_result.clone(),
            _ => turn.result.clone().or_else(|| s.previous_result.clone()),
        };
        let Some(result) = result else {
            return Err(StageFailure::internal("no result to analyze"));
        };
        let transcript = self
            .ctx
            .context_store
            .local_view(&s.session_id)
            .unwrap_or_default();

        let question = s.question.clone();
        let intent = s.intent;
        let analyzer = self.ctx.analyzer.as_ref();
        let analysis = {
            let (q, r, t) = (question.as_str(), &result, transcript.as_slice());
            self.call(&mut s.capability_backoffs, "analysis", move || {
                analyzer.analyze(q, intent, r, t)
            })
            .await?
        };

        if let Err(e) = self.ctx.context_store.add_analysis_response(
            &s.session_id,
            &analysis.text,
            analysis.data.clone(),
        ) {
            warn!(session_id = %s.session_id, error = %e, "analysis not recorded");
        }
        turn.analysis = Some(analysis.text);
        turn.result = Some(result);
        Ok(StageOutcome::Next(Stage::ResultPresentation))
    }

    fn present(&self, s: &mut Session, turn: &mut TurnState) -> Stepped {
        if turn.result.is_none() {
            turn.result = s.previous_result.clone();
        }
        s.pending_feedback = None;
        Ok(StageOutcome::Next(Stage::Completed))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn validate_text(&self, text: &str, what: &str) -> Result<(), String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(format!("{} must not be empty", what));
        }
        let max = self.ctx.config.dialogue.max_question_length;
        if trimmed.chars().count() > max {
            return Err(format!("{} exceeds {} characters", what, max));
        }
        Ok(())
    }

    fn record_user(&self, session_id: &str, text: &str) {
        if let Err(e) = self.ctx.context_store.add_user_message(session_id, text) {
            warn!(session_id, error = %e, "user message not recorded");
        }
    }

    fn record_attempt(&self, s: &Session, sql: &str, outcome: AttemptOutcome) {
        if let Err(e) =
            self.ctx
                .ledger
                .record(&s.session_id, sql, outcome, s.retry_count, s.backoff_attempts)
        {
            warn!(session_id = %s.session_id, error = %e, "execution attempt not recorded");
        }
    }

    /// Failure result that leaves every session untouched.
    fn reject(&self, session_id: &str, kind: TurnErrorKind, message: impl Into<String>) -> TurnResult {
        let (stage, intent) = match self.status(session_id) {
            Ok(snap) => (snap.stage, snap.intent),
            Err(_) => (Stage::IntentRecognition, Intent::Unknown),
        };
        TurnResult::rejected(
            session_id,
            stage,
            intent,
            TurnError {
                kind,
                sql_error: None,
                message: message.into(),
                sql: None,
                stage,
            },
        )
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<SessionHandle>>>, DialogueError> {
        self.sessions
            .lock()
            .map_err(|e| DialogueError::Storage(format!("session registry lock poisoned: {}", e)))
    }

    fn handle(&self, session_id: &str) -> Result<Option<Arc<SessionHandle>>, DialogueError> {
        Ok(self.registry()?.get(session_id).cloned())
    }

    fn handle_or_insert(
        &self,
        session_id: &str,
        question: &str,
        data_source_id: Option<&str>,
    ) -> Result<Arc<SessionHandle>, DialogueError> {
        let mut map = self.registry()?;
        let handle = map.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(SessionHandle::new(Session::new(
                session_id,
                question,
                data_source_id,
            )))
        });
        Ok(Arc::clone(handle))
    }

    fn is_current(&self, session_id: &str, handle: &Arc<SessionHandle>) -> Result<bool, DialogueError> {
        Ok(self
            .registry()?
            .get(session_id)
            .is_some_and(|h| Arc::ptr_eq(h, handle)))
    }

    fn remove_if_current(&self, session_id: &str, handle: &Arc<SessionHandle>) -> bool {
        match self.registry() {
            Ok(mut map) => {
                let current = map.get(session_id).is_some_and(|h| Arc::ptr_eq(h, handle));
                if current {
                    map.remove(session_id);
                }
                current
            }
            Err(_) => false,
        }
    }

    async fn lock_or_create(
        &self,
        session_id: &str,
        question: &str,
        data_source_id: Option<&str>,
    ) -> Result<(Arc<SessionHandle>, OwnedMutexGuard<Session>), DialogueError> {
        loop {
            let handle = self.handle_or_insert(session_id, question, data_source_id)?;
            let guard = Arc::clone(&handle.state).lock_owned().await;
            if self.is_current(session_id, &handle)? {
                return Ok((handle, guard));
            }
            // Removed while we waited for the lock; register afresh.
        }
    }

    async fn lock_existing(
        &self,
        session_id: &str,
    ) -> Result<(Arc<SessionHandle>, OwnedMutexGuard<Session>), DialogueError> {
        let handle = self
            .handle(session_id)?
            .ok_or_else(|| DialogueError::SessionNotFound(session_id.to_string()))?;
        let guard = Arc::clone(&handle.state).lock_owned().await;
        if !self.is_current(session_id, &handle)? {
            return Err(DialogueError::SessionNotFound(session_id.to_string()));
        }
        Ok((handle, guard))
    }
}

/// Legal route from `from` back to intent recognition. An unfinished turn
/// is abandoned through error handling.
fn restart_path(from: Stage) -> &'static [Stage] {
    match from {
        Stage::IntentRecognition => &[],
        Stage::IntentClarification | Stage::Completed => &[Stage::IntentRecognition],
        Stage::ErrorHandling => &[Stage::Completed, Stage::IntentRecognition],
        Stage::TableSelection
        | Stage::SqlGeneration
        | Stage::SqlExecution
        | Stage::DataAnalysis
        | Stage::ResultPresentation => &[
            Stage::ErrorHandling,
            Stage::Completed,
            Stage::IntentRecognition,
        ],
    }
}

fn error_kind(err: &DialogueError) -> TurnErrorKind {
    match err {
        DialogueError::SessionNotFound(_) => TurnErrorKind::SessionNotFound,
        DialogueError::InvalidInput(_) => TurnErrorKind::InvalidInput,
        _ => TurnErrorKind::Internal,
    }
}

fn push_intent(s: &mut Session, intent: Intent) {
    s.intent_history.push(intent);
    if s.intent_history.len() > MAX_INTENT_HISTORY {
        let excess = s.intent_history.len() - MAX_INTENT_HISTORY;
        s.intent_history.drain(..excess);
    }
}

/// Reports lean on business knowledge more than ad-hoc queries do.
fn priority_overrides(intent: Intent) -> BTreeMap<ModuleKind, Priority> {
    let mut overrides = BTreeMap::new();
    if intent == Intent::ReportGeneration {
        overrides.insert(ModuleKind::Knowledge, Priority::High);
    }
    overrides
}

/// Prompt context for SQL generation: packed semantic modules, join hints,
/// the remote-safe transcript, and any corrective feedback.
fn generation_context(
    aggregation: &AggregationResult,
    transcript: &[RemoteMessage],
    join_hints: &[String],
    feedback: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !aggregation.enhanced_context.is_empty() {
        parts.push(aggregation.enhanced_context.clone());
    }
    if !join_hints.is_empty() {
        parts.push(format!("[join_hints]\n{}", join_hints.join("\n")));
    }
    if !transcript.is_empty() {
        let lines: Vec<String> = transcript
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        parts.push(format!("[conversation]\n{}", lines.join("\n")));
    }
    if let Some(feedback) = feedback {
        parts.push(format!("[feedback]\n{}", feedback));
    }
    parts.join("\n\n")
}

fn turn_result(s: &Session, turn: TurnState) -> TurnResult {
    let needs_clarification = s.stage == Stage::IntentClarification;
    let clarification_question = turn.clarification_question.or_else(|| {
        s.pending_clarification
            .as_ref()
            .filter(|_| needs_clarification)
            .map(|p| p.question().to_string())
    });
    TurnResult {
        session_id: s.session_id.clone(),
        success: turn.error.is_none(),
        stage: s.stage,
        intent: s.intent,
        tables: s.selected_tables.clone(),
        sql: s.generated_sql.clone(),
        result: turn.result,
        analysis: turn.analysis,
        needs_clarification,
        clarification_question,
        retry_available: turn.retry_available,
        error: turn.error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_core::types::Role;
    use std::collections::BTreeSet;

    fn aggregation(text: &str) -> AggregationResult {
        AggregationResult {
            enhanced_context: text.to_string(),
            modules_used: BTreeSet::new(),
            total_tokens_used: 0,
            token_budget_remaining: 0,
            relevance_scores: BTreeMap::new(),
            truncated: BTreeSet::new(),
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_generation_context_sections() {
        let transcript = vec![RemoteMessage {
            role: Role::User,
            content: "revenue by region".into(),
            timestamp: Timestamp::now(),
            kind: nlq_context::TurnKind::User,
        }];
        let text = generation_context(
            &aggregation("[table_structure]\norders(id)"),
            &transcript,
            &["orders.region_id = regions.id".to_string()],
            Some("Do not reference these columns: foo"),
        );
        let order: Vec<usize> = ["[table_structure]", "[join_hints]", "[conversation]", "[feedback]"]
            .iter()
            .map(|label| text.find(label).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("user: revenue by region"));
    }

    #[test]
    fn test_restart_path_uses_legal_transitions() {
        for from in Stage::ALL {
            let mut at = from;
            for &to in restart_path(from) {
                assert!(
                    validate_transition(at, to).is_ok(),
                    "{from}: {at} -> {to}"
                );
                at = to;
            }
            assert_eq!(at, Stage::IntentRecognition, "{from}");
        }
        assert_eq!(
            restart_path(Stage::ErrorHandling),
            &[Stage::Completed, Stage::IntentRecognition]
        );
    }

    #[test]
    fn test_generation_context_empty_parts_omitted() {
        let text = generation_context(&aggregation(""), &[], &[], None);
        assert!(text.is_empty());
    }

    #[test]
    fn test_report_boosts_knowledge() {
        let overrides = priority_overrides(Intent::ReportGeneration);
        assert_eq!(overrides.get(&ModuleKind::Knowledge), Some(&Priority::High));
        assert!(priority_overrides(Intent::SmartQuery).is_empty());
    }

    #[test]
    fn test_intent_history_bounded() {
        let mut s = Session::new("s1", "q", None);
        for _ in 0..(MAX_INTENT_HISTORY + 10) {
            push_intent(&mut s, Intent::SmartQuery);
        }
        assert_eq!(s.intent_history.len(), MAX_INTENT_HISTORY);
    }

    #[test]
    fn test_turn_result_reports_clarification() {
        let mut s = Session::new("s1", "q", None);
        s.stage = Stage::IntentClarification;
        s.pending_clarification = Some(PendingClarification::Tables {
            question: "Which tables?".into(),
        });
        let result = turn_result(&s, TurnState::default());
        assert!(result.success);
        assert!(result.needs_clarification);
        assert_eq!(result.clarification_question.as_deref(), Some("Which tables?"));
    }
}
