//! Workflow orchestration.
//!
//! One analysis request runs as a sequential pipeline on its own tokio task:
//!
//! ```text
//! Fetching → Analyzing → Indexing → Synthesizing → Completed
//!     └──────────┴───────────┴────────────┴──────→ Failed
//! ```
//!
//! `Fetching` and `Analyzing` failures are fatal. `Indexing` failures are
//! recorded as degradations and the run continues, because a walkthrough
//! can be produced from the analysis alone. `Synthesizing` never fails: the
//! model selector falls back to a deterministic skeleton.
//!
//! The [`Orchestrator`] keeps a registry of active runs keyed by request id.
//! Holding an entry is the lease for that id: a second submission with the
//! same id attaches to the existing run instead of starting another, and
//! the entry is released when the run finishes.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use codequest_core::models::RepositoryRef;

use crate::analyze::{AnalysisSummary, Analyzer};
use crate::error::{Degradation, DegradationKind, WorkflowError};
use crate::fetch::RepoFetcher;
use crate::ingest::{IndexError, IndexReport, Indexer};
use crate::progress::{ProgressEvent, ProgressSink, RunEvent};
use crate::walkthrough::{UserLevel, Walkthrough, WalkthroughGenerator};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Fetching,
    Analyzing,
    Indexing,
    Synthesizing,
    Completed,
    Failed,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Fetching => "fetching",
            Step::Analyzing => "analyzing",
            Step::Indexing => "indexing",
            Step::Synthesizing => "synthesizing",
            Step::Completed => "completed",
            Step::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Completed | Step::Failed)
    }

    /// Forward edges plus `Failed` from any non-terminal step.
    pub fn can_transition_to(self, next: Step) -> bool {
        match (self, next) {
            (from, Step::Failed) => !from.is_terminal(),
            (Step::Fetching, Step::Analyzing)
            | (Step::Analyzing, Step::Indexing)
            | (Step::Indexing, Step::Synthesizing)
            | (Step::Synthesizing, Step::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid workflow transition from {from} to {to}")]
pub struct TransitionError {
    pub from: Step,
    pub to: Step,
}

/// What a run has produced so far.
#[derive(Debug, Clone, Default)]
pub struct PartialResults {
    pub repo: Option<RepositoryRef>,
    pub files: usize,
    pub analysis: Option<AnalysisSummary>,
    pub index: Option<IndexReport>,
    pub walkthrough: Option<Walkthrough>,
    pub degradations: Vec<Degradation>,
}

/// State of one run, owned by the task executing it.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: String,
    pub url: String,
    pub user_level: UserLevel,
    pub current_step: Step,
    pub progress_log: Vec<ProgressEvent>,
    pub partial: PartialResults,
}

impl WorkflowRun {
    pub fn new(id: &str, url: &str, user_level: UserLevel) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            user_level,
            current_step: Step::Fetching,
            progress_log: Vec::new(),
            partial: PartialResults::default(),
        }
    }

    /// Log a progress event for the current step.
    pub fn record(&mut self, message: impl Into<String>) -> ProgressEvent {
        let event = ProgressEvent::new(&self.id, self.current_step, message);
        self.progress_log.push(event.clone());
        event
    }

    /// Move to `next` and log the transition.
    pub fn transition(
        &mut self,
        next: Step,
        message: impl Into<String>,
    ) -> Result<ProgressEvent, TransitionError> {
        if !self.current_step.can_transition_to(next) {
            return Err(TransitionError {
                from: self.current_step,
                to: next,
            });
        }
        self.current_step = next;
        Ok(self.record(message))
    }
}

/// Input for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub url: String,
    /// Caller-chosen idempotency key. Generated when absent.
    pub request_id: Option<String>,
    pub user_level: UserLevel,
}

impl AnalyzeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_id: None,
            user_level: UserLevel::default(),
        }
    }
}

/// Final result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutput {
    pub run_id: String,
    pub repo: RepositoryRef,
    pub files: usize,
    pub analysis: AnalysisSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexReport>,
    pub walkthrough: Walkthrough,
    pub warnings: Vec<Degradation>,
    pub progress_log: Vec<ProgressEvent>,
}

pub type RunOutcome = Result<WorkflowOutput, WorkflowError>;

struct HandleState {
    history: Vec<RunEvent>,
    current: Step,
}

/// Shared view of one run: event history, live events, outcome, cancel.
pub struct RunHandle {
    id: String,
    url: String,
    state: Mutex<HandleState>,
    events: broadcast::Sender<RunEvent>,
    outcome: watch::Sender<Option<RunOutcome>>,
    cancel: CancellationToken,
}

impl RunHandle {
    fn new(id: &str, url: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (outcome, _) = watch::channel(None);
        Self {
            id: id.to_string(),
            url: url.to_string(),
            state: Mutex::new(HandleState {
                history: Vec::new(),
                current: Step::Fetching,
            }),
            events,
            outcome,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_step(&self) -> Step {
        self.state().current
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn publish(&self, event: RunEvent) {
        let mut state = self.state();
        if let RunEvent::Progress(p) = &event {
            state.current = p.step;
        }
        state.history.push(event.clone());
        // No receivers is fine; history covers late subscribers.
        let _ = self.events.send(event);
    }

    /// Events so far plus a receiver for the rest. Taken under one lock so
    /// nothing is missed or duplicated between the two.
    pub fn subscribe(&self) -> (Vec<RunEvent>, broadcast::Receiver<RunEvent>) {
        let state = self.state();
        (state.history.clone(), self.events.subscribe())
    }

    /// Replayed and live events as one stream, ending after the terminal
    /// event.
    pub fn event_stream(&self) -> impl Stream<Item = RunEvent> + Send + 'static {
        let (history, rx) = self.subscribe();
        stream::unfold(
            (history.into_iter(), rx, false),
            |(mut replay, mut rx, done)| async move {
                if done {
                    return None;
                }
                let event = match replay.next() {
                    Some(event) => event,
                    None => loop {
                        match rx.recv().await {
                            Ok(event) => break event,
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "progress subscriber lagged");
                            }
                            Err(RecvError::Closed) => return None,
                        }
                    },
                };
                let done = event.is_terminal();
                Some((event, (replay, rx, done)))
            },
        )
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> RunOutcome {
        let mut rx = self.outcome.subscribe();
        let result = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| Err(WorkflowError::Aborted("run ended without outcome".into()))),
            Err(_) => Err(WorkflowError::Aborted("run handle dropped".into())),
        };
        result
    }
}

/// Result of [`Orchestrator::submit`].
pub enum Submission {
    Started(Arc<RunHandle>),
    /// A run with this id was already active.
    Attached(Arc<RunHandle>),
}

impl Submission {
    pub fn handle(&self) -> &Arc<RunHandle> {
        match self {
            Submission::Started(h) | Submission::Attached(h) => h,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, Submission::Attached(_))
    }
}

struct OrchestratorInner {
    fetcher: Arc<dyn RepoFetcher>,
    analyzer: Arc<dyn Analyzer>,
    indexer: Arc<Indexer>,
    walkthroughs: WalkthroughGenerator,
    sink: Arc<dyn ProgressSink>,
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
}

/// Runs analysis workflows, at most one per request id.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn RepoFetcher>,
        analyzer: Arc<dyn Analyzer>,
        indexer: Arc<Indexer>,
        walkthroughs: WalkthroughGenerator,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                fetcher,
                analyzer,
                indexer,
                walkthroughs,
                sink,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a run, or attach to the active run with the same request id.
    pub fn submit(&self, request: AnalyzeRequest) -> Submission {
        let id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let handle = {
            let mut runs = self.inner.runs();
            if let Some(existing) = runs.get(&id) {
                tracing::debug!(run = %id, "attaching to active run");
                return Submission::Attached(existing.clone());
            }
            let handle = Arc::new(RunHandle::new(&id, &request.url));
            runs.insert(id.clone(), handle.clone());
            handle
        };

        let inner = self.inner.clone();
        let task_handle = handle.clone();
        let span = tracing::info_span!("run", id = %id, url = %request.url);
        tokio::spawn(
            async move {
                let work = tokio::spawn(
                    execute(inner.clone(), task_handle.clone(), request).in_current_span(),
                );
                let outcome = match work.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(WorkflowError::Aborted(e.to_string())),
                };
                inner.finish(&task_handle, outcome);
            }
            .instrument(span),
        );

        Submission::Started(handle)
    }

    /// Submit and wait for the outcome.
    pub async fn run(&self, request: AnalyzeRequest) -> RunOutcome {
        let submission = self.submit(request);
        submission.handle().wait().await
    }

    /// The active run with this id, if any.
    pub fn get(&self, id: &str) -> Option<Arc<RunHandle>> {
        self.inner.runs().get(id).cloned()
    }

    /// Request cancellation. Returns false when no such run is active.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.runs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every active run.
    pub fn cancel_all(&self) {
        for handle in self.inner.runs().values() {
            handle.cancel();
        }
    }
}

impl OrchestratorInner {
    fn runs(&self) -> MutexGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, handle: &RunHandle, event: ProgressEvent) {
        tracing::debug!(step = %event.step, "{}", event.message);
        let event = RunEvent::Progress(event);
        self.sink.emit(&event);
        handle.publish(event);
    }

    fn finish(&self, handle: &Arc<RunHandle>, outcome: RunOutcome) {
        let event = match &outcome {
            Ok(output) => RunEvent::Completed {
                run_id: handle.id.clone(),
                output: Box::new(output.clone()),
            },
            Err(e) => {
                tracing::warn!(error = %e, "run failed");
                RunEvent::Failed {
                    run_id: handle.id.clone(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                }
            }
        };
        self.sink.emit(&event);
        handle.publish(event);
        handle.outcome.send_replace(Some(outcome));

        let mut runs = self.runs();
        if runs
            .get(&handle.id)
            .is_some_and(|active| Arc::ptr_eq(active, handle))
        {
            runs.remove(&handle.id);
        }
    }

    fn fail(&self, handle: &RunHandle, run: &mut WorkflowRun, error: WorkflowError) -> RunOutcome {
        if let Ok(event) = run.transition(Step::Failed, error.to_string()) {
            self.report(handle, event);
        }
        Err(error)
    }

    fn advance(&self, handle: &RunHandle, run: &mut WorkflowRun, next: Step, message: String) -> Result<(), WorkflowError> {
        if handle.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled(run.id.clone()));
        }
        let event = run
            .transition(next, message)
            .map_err(|e| WorkflowError::Aborted(e.to_string()))?;
        self.report(handle, event);
        Ok(())
    }
}

async fn execute(inner: Arc<OrchestratorInner>, handle: Arc<RunHandle>, request: AnalyzeRequest) -> RunOutcome {
    let mut run = WorkflowRun::new(&handle.id, &request.url, request.user_level);
    match drive(&inner, &handle, &mut run).await {
        Ok(output) => Ok(output),
        Err(e) => inner.fail(&handle, &mut run, e),
    }
}

async fn drive(inner: &OrchestratorInner, handle: &RunHandle, run: &mut WorkflowRun) -> RunOutcome {
    if handle.cancel.is_cancelled() {
        return Err(WorkflowError::Cancelled(run.id.clone()));
    }
    let event = run.record(format!("fetching {}", run.url));
    inner.report(handle, event);

    let fetched = inner
        .fetcher
        .fetch(&run.url)
        .await
        .map_err(|e| WorkflowError::FetchFailed(format!("{e:#}")))?;
    if fetched.is_fatal() {
        return Err(WorkflowError::FetchFailed(format!(
            "no readable files ({} errors, first: {})",
            fetched.errors.len(),
            fetched.errors[0]
        )));
    }
    if !fetched.errors.is_empty() {
        run.partial.degradations.push(Degradation::new(
            DegradationKind::IndexingDegraded,
            format!("{} file(s) skipped while reading the repository", fetched.errors.len()),
        ));
    }
    let repo = fetched.repo;
    let files = fetched.files;
    run.partial.repo = Some(repo.clone());
    run.partial.files = files.len();

    inner.advance(handle, run, Step::Analyzing, format!("analyzing {} files", files.len()))?;
    let analysis = inner
        .analyzer
        .analyze(&repo, &files)
        .map_err(|e| WorkflowError::AnalysisFailed(format!("{e:#}")))?;
    run.partial.analysis = Some(analysis.clone());

    inner.advance(handle, run, Step::Indexing, format!("indexing {} files", files.len()))?;
    match inner
        .indexer
        .index_repository(&repo, &files, &handle.cancel)
        .await
    {
        Ok(report) => {
            run.partial.degradations.extend(report.degradations.iter().cloned());
            run.partial.index = Some(report);
        }
        Err(IndexError::Cancelled) => return Err(WorkflowError::Cancelled(run.id.clone())),
        Err(IndexError::Store(e)) => {
            tracing::warn!(error = %e, "index store unreachable, continuing without an index");
            run.partial.degradations.push(Degradation::new(
                DegradationKind::IndexingDegraded,
                format!("indexing skipped: {e}"),
            ));
            run.partial
                .degradations
                .push(Degradation::new(DegradationKind::StoreUnavailable, e.to_string()));
        }
    }

    let indexed = run
        .partial
        .index
        .as_ref()
        .map(|r| r.summary())
        .unwrap_or_else(|| "index unavailable".to_string());
    inner.advance(handle, run, Step::Synthesizing, format!("generating walkthrough ({indexed})"))?;
    let (walkthrough, warnings) = inner
        .walkthroughs
        .generate(&repo, &analysis, &files, run.user_level)
        .await;
    run.partial.degradations.extend(warnings);
    run.partial.walkthrough = Some(walkthrough.clone());

    let message = if walkthrough.skeleton {
        "walkthrough ready (skeleton)".to_string()
    } else {
        format!("walkthrough ready ({})", walkthrough.backend)
    };
    inner.advance(handle, run, Step::Completed, message)?;

    Ok(WorkflowOutput {
        run_id: run.id.clone(),
        repo,
        files: files.len(),
        analysis,
        index: run.partial.index.clone(),
        walkthrough,
        warnings: run.partial.degradations.clone(),
        progress_log: run.progress_log.clone(),
    })
}
