//! Concurrent batch dispatch with a serialized commit path
//!
//! Up to `max_concurrent` batch futures are polled from one task. Claiming
//! segments, committing results, merging glossary terms and writing the
//! checkpoint all happen under a single mutex; the provider call itself runs
//! outside it. Final order never depends on completion order because every
//! translation lands in its segment's slot in the store.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::core::client::TranslationClient;
use crate::core::config::TranslatorConfig;
use crate::core::errors::{ProviderError, Result, TranslationError};
use crate::core::models::{
    BatchId, ProviderReply, SegmentId, SegmentStatus, SourceItem, TranslationRequest,
};
use crate::core::prompt::PromptBuilder;
use crate::core::token_tracker::TokenTracker;
use crate::pipeline::context::ContextBuilder;
use crate::pipeline::partitioner::{BatchLimits, Partitioner};
use crate::pipeline::report::{RunReport, StopReason};
use crate::pipeline::retry::{BackoffPolicy, BatchState, RetryLedger};
use crate::pipeline::session::Session;
use crate::pipeline::store::{CommitOutcome, SegmentStore, StoreStats};
use crate::pipeline::validator::{ResponseValidator, ValidatedResponse};

/// Called with fresh totals after every checkpoint
pub type ProgressCallback = Box<dyn Fn(StoreStats) + Send + Sync>;

/// Upper bound of the translated sample sent for glossary extraction
const GLOSSARY_SAMPLE_CHARS: usize = 8000;

/// Pause before re-planning when pending segments could not be claimed
const IDLE_RETRY: Duration = Duration::from_millis(10);

/// Everything guarded by the mutation lock
struct PipelineState {
    session: Session,
    ledger: RetryLedger,
    report: RunReport,
    /// Batches that have not reached a terminal state yet
    batches: HashMap<BatchId, BatchState>,
}

impl PipelineState {
    /// Move a batch along its lifecycle; terminal states are counted and forgotten
    fn advance(&mut self, batch_id: BatchId, next: BatchState) -> Result<()> {
        let current = self
            .batches
            .get(&batch_id)
            .copied()
            .unwrap_or(BatchState::Created);
        if !current.can_transition_to(next) {
            return Err(TranslationError::InternalError(format!(
                "batch {} cannot move from {} to {}",
                batch_id, current, next
            )));
        }

        debug!("Batch {} {} -> {}", batch_id, current, next);
        if next.is_terminal() {
            self.batches.remove(&batch_id);
            self.report.record_batch(next);
        } else {
            self.batches.insert(batch_id, next);
        }
        Ok(())
    }
}

/// Why a batch attempt failed as a whole
enum AttemptFailure {
    Malformed(String),
    Provider(ProviderError),
}

/// What the dispatch loop does when no batch is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Idle {
    Finish,
    /// Wait for the earliest backoff deadline
    Sleep(Instant),
    /// Segments are pending but nothing was claimable; plan again shortly
    Retry,
}

fn idle_action(stop: Option<StopReason>, wakeup: Option<Instant>, has_pending: bool) -> Idle {
    match (stop, wakeup) {
        (Some(_), _) => Idle::Finish,
        (None, Some(at)) => Idle::Sleep(at),
        (None, None) if has_pending => Idle::Retry,
        (None, None) => Idle::Finish,
    }
}

/// How one dispatch phase ended
#[derive(Debug, Default)]
struct PhaseOutcome {
    stop: Option<StopReason>,
    fatal: Option<TranslationError>,
}

impl PhaseOutcome {
    /// Neither stopped nor failed; the next phase may run
    fn proceeds(&self) -> bool {
        self.stop.is_none() && self.fatal.is_none()
    }
}

/// "Original / Translated" pairs of the translated segments among the first `limit`
fn glossary_sample(store: &SegmentStore, limit: usize) -> String {
    let sample: String = store
        .segments()
        .iter()
        .take(limit)
        .filter_map(|s| {
            s.translation
                .as_deref()
                .filter(|_| s.status == SegmentStatus::Translated)
                .map(|t| format!("Original: {}\nTranslated: {}\n---\n", s.source_text, t))
        })
        .collect();
    sample.chars().take(GLOSSARY_SAMPLE_CHARS).collect()
}

/// Drives a session to completion through a translation client
pub struct Scheduler<C> {
    client: C,
    max_concurrent: usize,
    max_retries: u32,
    json_repair_retries: usize,
    /// Leading segments translated before glossary extraction
    preamble: Option<usize>,
    request_timeout: Duration,
    source_lang: Option<String>,
    target_lang: String,
    partitioner: Partitioner,
    validator: ResponseValidator,
    backoff: BackoffPolicy,
    context: ContextBuilder,
    prompt: PromptBuilder,
    tokens: TokenTracker,
    state: Mutex<PipelineState>,
    next_batch_id: AtomicU64,
    progress: Option<ProgressCallback>,
}

impl<C: TranslationClient> Scheduler<C> {
    pub fn new(client: C, config: &TranslatorConfig, session: Session) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(TranslationError::config("max_concurrent must be at least 1"));
        }

        let persona = session.persona().clone();
        let prompt = PromptBuilder::new(session.persona_id(), persona.clone());

        Ok(Self {
            client,
            max_concurrent: config.max_concurrent,
            max_retries: config.max_retries,
            json_repair_retries: config.json_repair_retries,
            preamble: config.glossary_preamble_count(session.store().len()),
            request_timeout: config.request_timeout(),
            source_lang: session
                .metadata()
                .source_lang
                .clone()
                .or_else(|| config.source_lang.clone()),
            target_lang: session.metadata().target_lang.clone(),
            partitioner: Partitioner::new(BatchLimits::from_config(config, &persona)),
            validator: ResponseValidator::new(config.max_repair_attempts),
            backoff: BackoffPolicy::from_config(config),
            context: ContextBuilder::for_persona(&persona),
            prompt,
            tokens: TokenTracker::new(config.token_budget),
            state: Mutex::new(PipelineState {
                session,
                ledger: RetryLedger::new(Duration::from_secs(config.retry_budget_secs)),
                report: RunReport::default(),
                batches: HashMap::new(),
            }),
            next_batch_id: AtomicU64::new(1),
            progress: None,
        })
    }

    /// Report progress after every committed batch
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn token_tracker(&self) -> &TokenTracker {
        &self.tokens
    }

    /// Give the session back (for rendering)
    pub fn into_session(self) -> Session {
        self.state.into_inner().session
    }

    /// Run until every segment is TRANSLATED or FAILED
    pub async fn run(&self) -> Result<RunReport> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until done or until `shutdown` resolves.
    ///
    /// With a glossary preamble configured, the leading segments are
    /// translated and a glossary extracted from them before the rest of
    /// the document is dispatched. On shutdown in-flight batches are
    /// abandoned, their claims released and a final checkpoint written.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut outcome = PhaseOutcome::default();
        if let Some(limit) = self.pending_preamble().await {
            info!("Pre-translating the first {} segments to build a glossary", limit);
            outcome = self.dispatch(limit, shutdown.as_mut()).await;
            if outcome.proceeds() {
                if let Err(e) = self.extract_glossary(limit).await {
                    outcome.fatal = Some(e);
                }
            }
        }

        if outcome.proceeds() {
            outcome = self.dispatch(usize::MAX, shutdown.as_mut()).await;
        }

        let report = self.finish(outcome.stop.unwrap_or_default()).await?;
        match outcome.fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Preamble size, unless this document's glossary was already extracted
    async fn pending_preamble(&self) -> Option<usize> {
        let extracted = self.state.lock().await.session.metadata.glossary_extracted;
        self.preamble.filter(|_| !extracted)
    }

    /// Dispatch batches among the first `limit` segments until none is open
    async fn dispatch<F>(&self, limit: usize, mut shutdown: Pin<&mut F>) -> PhaseOutcome
    where
        F: Future<Output = ()>,
    {
        let mut in_flight = FuturesUnordered::new();
        let mut outcome = PhaseOutcome::default();

        loop {
            // One clock reading for claiming and for the wakeup decision
            let now = Instant::now();

            if outcome.stop.is_none() {
                if !self.tokens.can_dispatch().await {
                    info!("Token budget exhausted, no new batches will be dispatched");
                    outcome.stop = Some(StopReason::TokenBudget);
                } else if in_flight.len() < self.max_concurrent {
                    match self
                        .claim_batches(self.max_concurrent - in_flight.len(), limit, now)
                        .await
                    {
                        Ok(requests) => {
                            for request in requests {
                                in_flight.push(self.run_batch(request));
                            }
                        }
                        Err(e) => {
                            outcome.fatal = Some(e);
                            break;
                        }
                    }
                }
            }

            let wakeup = self.next_wakeup(now).await;

            if in_flight.is_empty() {
                let has_pending = self.has_pending(limit).await;
                match idle_action(outcome.stop, wakeup, has_pending) {
                    Idle::Finish => break,
                    Idle::Sleep(at) => {
                        debug!("All pending segments backing off, sleeping");
                        tokio::select! {
                            _ = sleep_until(at) => continue,
                            _ = &mut shutdown => {
                                outcome.stop = Some(StopReason::Cancelled);
                                break;
                            }
                        }
                    }
                    Idle::Retry => {
                        debug!("Pending segments not claimable yet, planning again");
                        tokio::select! {
                            _ = sleep(IDLE_RETRY) => continue,
                            _ = &mut shutdown => {
                                outcome.stop = Some(StopReason::Cancelled);
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                Some(result) = in_flight.next() => {
                    if let Err(e) = result {
                        outcome.fatal = Some(e);
                        break;
                    }
                }
                _ = sleep_until(wakeup.unwrap_or(now)), if wakeup.is_some() && outcome.stop.is_none() => {}
                _ = &mut shutdown => {
                    outcome.stop = Some(StopReason::Cancelled);
                    break;
                }
            }
        }

        // Abandon whatever is still running
        let abandoned = in_flight.len();
        drop(in_flight);
        if abandoned > 0 {
            warn!("Abandoning {} in-flight batches", abandoned);
        }
        outcome
    }

    fn next_batch_id(&self) -> BatchId {
        self.next_batch_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.state.lock().await.ledger.next_wakeup(now)
    }

    async fn has_pending(&self, limit: usize) -> bool {
        self.state.lock().await.session.store.has_pending_within(limit)
    }

    /// Partition ready PENDING segments among the first `limit` and claim
    /// them, under the lock
    async fn claim_batches(
        &self,
        max_batches: usize,
        limit: usize,
        now: Instant,
    ) -> Result<Vec<TranslationRequest>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let session = &mut state.session;

        let plans = {
            let (store, ledger) = (&session.store, &state.ledger);
            let in_scope = |id: SegmentId| store.position(id).map_or(false, |p| p < limit);
            self.partitioner
                .plan(store, |s| in_scope(s.id) && ledger.is_ready(s.id, now), max_batches)
        };

        let mut requests = Vec::with_capacity(plans.len());
        for plan in plans {
            session.store.mark_in_flight(&plan.member_ids)?;

            let items: Vec<SourceItem> = plan
                .member_ids
                .iter()
                .filter_map(|&id| session.store.get(id))
                .map(|s| SourceItem {
                    id: s.id,
                    text: s.source_text.clone(),
                })
                .collect();

            let batch_text = items
                .iter()
                .map(|item| item.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");

            let context = plan
                .first()
                .map(|first| self.context.build(&session.store, first))
                .unwrap_or_default();

            let request = TranslationRequest::new(self.next_batch_id(), items, &self.target_lang)
                .with_source_lang(self.source_lang.clone())
                .with_context(context)
                .with_glossary(session.glossary.relevant_to(&batch_text))
                .with_persona(
                    self.prompt.persona_id(),
                    self.prompt.persona_instructions(),
                    self.prompt.persona().extract_terms,
                );

            debug!(
                "Batch {} claims ids {:?} ({} chars)",
                request.batch_id, plan.member_ids, plan.total_chars
            );
            requests.push(request);
        }

        for request in &requests {
            state.advance(request.batch_id, BatchState::Dispatched)?;
        }
        state.report.batches_dispatched += requests.len();
        Ok(requests)
    }

    /// Provider call bounded by the request timeout
    async fn send(&self, request: &TranslationRequest) -> std::result::Result<ProviderReply, ProviderError> {
        match timeout(self.request_timeout, self.client.translate(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    /// One batch: a provider round trip, plus model repair round trips
    /// while the reply fails validation and attempts remain
    async fn run_batch(&self, request: TranslationRequest) -> Result<()> {
        let members = request.member_ids();
        let batch_id = request.batch_id;
        let mut repair: Option<TranslationRequest> = None;
        let mut repairs = 0;

        loop {
            let reply = self.send(repair.as_ref().unwrap_or(&request)).await;

            match reply {
                Ok(reply) => {
                    self.tokens.record(reply.tokens_used).await;
                    match self.validator.validate(&reply.raw_text, &members) {
                        Ok(validated) => {
                            return self.commit_response(batch_id, &members, validated).await
                        }
                        Err(e) => {
                            warn!("Batch {} malformed response: {}", batch_id, e);
                            if repairs < self.json_repair_retries
                                && self.charge_repair(batch_id, &members, &e).await?
                            {
                                repairs += 1;
                                repair = Some(request.repair(reply.raw_text, e.to_string()));
                                continue;
                            }
                            return self
                                .fail_attempt(batch_id, &members, AttemptFailure::Malformed(e.to_string()))
                                .await;
                        }
                    }
                }
                Err(err) if !err.is_transient() => {
                    error!("Batch {} rejected by provider: {}", batch_id, err);
                    self.abort_batch(batch_id, &members).await?;
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(
                        "Batch {} transport failure ({}) via {}: {}",
                        batch_id,
                        err.kind(),
                        self.client.name(),
                        err
                    );
                    return self
                        .fail_attempt(batch_id, &members, AttemptFailure::Provider(err))
                        .await;
                }
            }
        }
    }

    /// Count the malformed reply as an attempt and keep the claim for a
    /// model repair round trip. `false` when the budget does not allow it.
    async fn charge_repair(
        &self,
        batch_id: BatchId,
        members: &[SegmentId],
        error: &TranslationError,
    ) -> Result<bool> {
        if !self.tokens.can_dispatch().await {
            return Ok(false);
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let reason = format!("malformed response, model asked to repair: {}", error);
        if !state
            .session
            .store
            .charge_attempt(members, &reason, self.max_retries)?
        {
            return Ok(false);
        }

        state.report.malformed_responses += 1;
        state.report.model_repairs += 1;
        info!("Batch {} asking the model to repair its JSON", batch_id);
        self.persist(state).await?;
        Ok(true)
    }

    /// Pre-translated pairs -> glossary, merged and persisted.
    ///
    /// Only a fatal provider error aborts the run; anything else leaves the
    /// glossary as it was and the pass is attempted again on the next run.
    async fn extract_glossary(&self, limit: usize) -> Result<()> {
        let request = {
            let guard = self.state.lock().await;
            let sample = glossary_sample(&guard.session.store, limit);
            if sample.is_empty() {
                warn!("No translated segments in the first {}, skipping glossary extraction", limit);
                return Ok(());
            }
            TranslationRequest::glossary_extraction(self.next_batch_id(), sample, &self.target_lang)
                .with_source_lang(self.source_lang.clone())
        };

        let reply = match self.send(&request).await {
            Ok(reply) => reply,
            Err(err) if !err.is_transient() => {
                error!("Glossary extraction rejected by provider: {}", err);
                return Err(err.into());
            }
            Err(err) => {
                warn!("Glossary extraction failed ({}): {}", err.kind(), err);
                return Ok(());
            }
        };
        self.tokens.record(reply.tokens_used).await;

        let terms = match self.validator.parse_terms(&reply.raw_text) {
            Ok(terms) => terms,
            Err(e) => {
                warn!("Glossary extraction reply unusable: {}", e);
                return Ok(());
            }
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let summary = state.session.glossary.merge(terms);
        state.report.terms_added += summary.added;
        state.report.glossary_conflicts += summary.conflicts;
        state.session.metadata.glossary_extracted = true;
        info!(
            "Glossary extracted: {} terms added, {} conflicts",
            summary.added, summary.conflicts
        );
        self.persist(state).await
    }

    async fn commit_response(
        &self,
        batch_id: BatchId,
        members: &[SegmentId],
        validated: ValidatedResponse,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let outcome = validated.outcome();

        for (id, text) in &validated.translations {
            match state.session.store.commit_translation(*id, text) {
                Ok(CommitOutcome::Committed) => state.ledger.clear(*id),
                Ok(CommitOutcome::AlreadyCommitted) => {}
                Err(TranslationError::StaleWriteError { id }) => {
                    warn!("Batch {} stale write for segment {} ignored", batch_id, id);
                    state.report.stale_writes += 1;
                }
                Err(e) => warn!("Batch {} could not commit segment {}: {}", batch_id, id, e),
            }
        }

        if !validated.terms.is_empty() {
            let summary = state.session.glossary.merge(validated.terms);
            state.report.terms_added += summary.added;
            state.report.glossary_conflicts += summary.conflicts;
        }
        if validated.repaired {
            state.report.repaired_responses += 1;
        }

        if !validated.missing.is_empty() {
            warn!(
                "Batch {} {}: ids {:?} missing from response",
                batch_id, outcome, validated.missing
            );
            self.count_failures(state, &validated.missing, "missing from response", None)?;
        }

        debug!(
            "Batch {} committed {}/{}",
            batch_id,
            validated.translations.len(),
            members.len()
        );
        state.advance(batch_id, outcome)?;
        self.persist(state).await
    }

    /// The whole batch failed: count an attempt for every member
    async fn fail_attempt(
        &self,
        batch_id: BatchId,
        members: &[SegmentId],
        failure: AttemptFailure,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let (reason, retry_after) = match failure {
            AttemptFailure::Malformed(message) => {
                state.report.malformed_responses += 1;
                (format!("malformed response: {}", message), None)
            }
            AttemptFailure::Provider(err) => {
                let retry_after = match &err {
                    ProviderError::RateLimited { retry_after } => {
                        state.report.rate_limited += 1;
                        *retry_after
                    }
                    ProviderError::Timeout => {
                        state.report.timeouts += 1;
                        None
                    }
                    _ => None,
                };
                (err.to_string(), retry_after)
            }
        };

        debug!("Batch {} attempt failed: {}", batch_id, reason);
        self.count_failures(state, members, &reason, retry_after)?;
        state.advance(batch_id, BatchState::Failed)?;
        self.persist(state).await
    }

    /// Fatal provider error: release claims without counting an attempt
    async fn abort_batch(&self, batch_id: BatchId, members: &[SegmentId]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.session.store.release(members)?;
        state.advance(batch_id, BatchState::Failed)?;
        debug!("Batch {} claims released", batch_id);
        self.persist(state).await
    }

    /// Failed attempt for each id: back to PENDING with backoff, or FAILED
    fn count_failures(
        &self,
        state: &mut PipelineState,
        ids: &[SegmentId],
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<()> {
        let now = Instant::now();

        for &id in ids {
            let attempt = state
                .session
                .store
                .get(id)
                .map(|s| s.retry_count + 1)
                .unwrap_or(1);
            let delay = self.backoff.delay(attempt, retry_after);

            if !state.ledger.record_failure(id, delay, now) {
                state
                    .session
                    .store
                    .mark_failed(id, &format!("retry time budget exhausted: {}", reason))?;
                state.ledger.clear(id);
                continue;
            }

            let status = state
                .session
                .store
                .record_attempt_failure(id, reason, self.max_retries)?;
            if status == SegmentStatus::Failed {
                state.ledger.clear(id);
            } else {
                debug!("Segment {} retry {} in {:?}", id, attempt, delay);
            }
        }
        Ok(())
    }

    /// Checkpoint under the lock, then report progress
    async fn persist(&self, state: &mut PipelineState) -> Result<()> {
        let session = &mut state.session;
        session.metadata.touch();
        let checkpoint = session.store.snapshot(&session.metadata, &session.glossary);
        session.writer.save_async(checkpoint).await?;

        if let Some(progress) = &self.progress {
            progress(session.store.stats());
        }
        Ok(())
    }

    /// Release abandoned claims, write the final checkpoint, build the report
    async fn finish(&self, stop: StopReason) -> Result<RunReport> {
        let tokens_used = self.tokens.get_stats().await.used;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let abandoned = state.session.store.in_flight_ids();
        if !abandoned.is_empty() {
            state.session.store.release(&abandoned)?;
            info!("Released {} claimed segments back to PENDING", abandoned.len());
        }
        if !state.batches.is_empty() {
            debug!("{} batches abandoned before completion", state.batches.len());
            state.batches.clear();
        }

        state.report.tokens_used = tokens_used;
        state.report.finish(&state.session.store, stop);
        self.persist(state).await?;

        let report = state.report.clone();
        info!(
            "Run finished ({:?}): {}/{} translated, {} failed",
            report.stop_reason, report.stats.translated, report.stats.total, report.stats.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{NewSegment, ProviderReply, SourceDocument};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Answers every request by upper-casing its items
    struct EchoClient {
        calls: StdMutex<Vec<Vec<SegmentId>>>,
    }

    impl TranslationClient for EchoClient {
        fn name(&self) -> &str {
            "echo"
        }

        async fn translate(
            &self,
            request: &TranslationRequest,
        ) -> std::result::Result<ProviderReply, ProviderError> {
            self.calls.lock().unwrap().push(request.member_ids());
            let items: Vec<_> = request
                .items
                .iter()
                .map(|i| serde_json::json!({"id": i.id, "translation": i.text.to_uppercase()}))
                .collect();
            Ok(ProviderReply {
                raw_text: serde_json::Value::Array(items).to_string(),
                tokens_used: 10,
                model_used: "echo".to_string(),
                request_id: None,
            })
        }
    }

    fn session(config: &TranslatorConfig, n: usize) -> Session {
        let document = SourceDocument {
            name: "doc.md".to_string(),
            hash: "hash".to_string(),
            segments: (1..=n)
                .map(|i| NewSegment {
                    source_text: format!("segment {}", i),
                    page_or_location: format!("line {}", i),
                })
                .collect(),
        };
        Session::open(config, document).unwrap()
    }

    fn config(dir: &TempDir) -> TranslatorConfig {
        TranslatorConfig {
            api_key: "test_key".to_string(),
            work_dir: dir.path().to_path_buf(),
            max_concurrent: 2,
            max_batch_segments: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let session = session(&cfg, 2);

        let mut zero = cfg.clone();
        zero.max_concurrent = 0;
        let client = EchoClient {
            calls: StdMutex::new(Vec::new()),
        };
        assert!(matches!(
            Scheduler::new(client, &zero, session),
            Err(TranslationError::ConfigError { .. })
        ));
    }

    #[tokio::test]
    async fn test_translates_everything_in_batches() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let session = session(&cfg, 5);
        let client = EchoClient {
            calls: StdMutex::new(Vec::new()),
        };

        let scheduler = Scheduler::new(client, &cfg, session).unwrap();
        let report = scheduler.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.batches_dispatched, 3);
        assert_eq!(report.batches_succeeded, 3);
        assert_eq!(report.tokens_used, 30);

        let session = scheduler.into_session();
        assert_eq!(
            session.store().get(5).unwrap().translation.as_deref(),
            Some("SEGMENT 5")
        );
        assert!(session.checkpoint_path().exists());
    }

    #[test]
    fn test_idle_decision() {
        let later = Instant::now() + Duration::from_secs(1);

        assert_eq!(idle_action(None, None, false), Idle::Finish);
        assert_eq!(idle_action(None, Some(later), true), Idle::Sleep(later));
        assert_eq!(idle_action(Some(StopReason::TokenBudget), Some(later), true), Idle::Finish);
        // Pending work but no deadline left: never report completion
        assert_eq!(idle_action(None, None, true), Idle::Retry);
    }

    #[test]
    fn test_batch_lifecycle_is_enforced() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let mut state = PipelineState {
            session: session(&cfg, 1),
            ledger: RetryLedger::new(Duration::from_secs(1)),
            report: RunReport::default(),
            batches: HashMap::new(),
        };

        // Not dispatched yet
        assert!(matches!(
            state.advance(1, BatchState::Succeeded),
            Err(TranslationError::InternalError(_))
        ));

        state.advance(1, BatchState::Dispatched).unwrap();
        state.advance(1, BatchState::Partial).unwrap();
        assert!(state.batches.is_empty());
        assert_eq!(state.report.batches_partial, 1);

        // A finished batch cannot finish again
        assert!(state.advance(1, BatchState::Failed).is_err());
        assert_eq!(state.report.batches_failed, 0);
    }

    #[test]
    fn test_glossary_sample_uses_translated_prefix() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let mut session = session(&cfg, 3);
        session.store.mark_in_flight(&[1, 3]).unwrap();
        session.store.commit_translation(1, "片段 1").unwrap();
        session.store.commit_translation(3, "片段 3").unwrap();

        let sample = glossary_sample(&session.store, 2);
        assert_eq!(sample, "Original: segment 1\nTranslated: 片段 1\n---\n");
        assert!(glossary_sample(&session.store, 0).is_empty());
    }

    #[tokio::test]
    async fn test_token_budget_stops_dispatch() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.max_concurrent = 1;
        cfg.token_budget = Some(10);
        let session = session(&cfg, 4);
        let client = EchoClient {
            calls: StdMutex::new(Vec::new()),
        };

        let scheduler = Scheduler::new(client, &cfg, session).unwrap();
        let report = scheduler.run().await.unwrap();

        assert_eq!(report.stop_reason, StopReason::TokenBudget);
        assert_eq!(report.stats.translated, 2);
        assert_eq!(report.stats.pending, 2);
        assert_eq!(report.stats.in_flight, 0);
    }
}
