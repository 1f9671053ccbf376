//! Pipeline engine
//!
//! A [`PipelineEngine`] owns one pipeline identity. It creates runs on
//! trigger, executes their stages strictly in order on a single worker task,
//! stops at the first stage that does not pass, and notifies exactly once
//! when a run ends.
//!
//! ## Concurrency
//!
//! At most one run per engine is active. With [`ConcurrencyPolicy::Reject`]
//! a trigger arriving while a run is active is refused; with
//! [`ConcurrencyPolicy::Queue`] it waits as a pending run and runs in FIFO
//! order. A poll trigger joins a poll run that is already queued instead of
//! adding another one. Separate engines share nothing but the credential
//! resolver and run fully in parallel.
//!
//! ## Failure isolation
//!
//! Each run executes on its own task. A panicking adapter fails the stage in
//! flight, the remaining stages are skipped, and the run is still notified.

pub mod trigger;

pub use trigger::{PollTrigger, PushSender, PushTrigger, TriggerSource, parse_push_event};

use crate::executor::{RunContext, StageExecutor};
use crate::infrastructure::MetricsCollector;
use crate::infrastructure::adapter::{NotifierTool, NotifyRequest, ToolAdapters};
use crate::pipeline::Validate;
use crate::pipeline::errors::PipelineError;
use crate::pipeline::options::{ConcurrencyPolicy, TriggerCause};
use crate::pipeline::pipeline_def::Pipeline;
use crate::pipeline::run::{Run, RunId, StageResult};
use crate::pipeline::types::{RunStatus, StageStatus};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

/// Default deadline for the notifier call
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of finished runs kept for status queries
pub const DEFAULT_RUN_HISTORY: usize = 100;

/// Reason recorded on stages skipped because of an abort
const ABORTED_REASON: &str = "not run: run aborted";

struct RunEntry {
    run: Run,
    abort: Arc<AtomicBool>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    runs: AHashMap<RunId, RunEntry>,
    /// Runs that have not ended, in execution order
    live: VecDeque<RunId>,
    /// Notified runs, oldest first
    history: VecDeque<RunId>,
}

impl Registry {
    fn active(&self) -> Option<RunId> {
        self.live.front().copied()
    }

    /// A pending run started by a poll
    fn queued_poll(&self) -> Option<RunId> {
        self.live
            .iter()
            .find(|id| {
                self.runs.get(id).is_some_and(|e| {
                    e.run.status() == RunStatus::Pending
                        && matches!(e.run.cause(), TriggerCause::Poll { .. })
                })
            })
            .copied()
    }

    fn settle(&mut self, id: RunId) {
        self.live.retain(|live| *live != id);
    }

    /// Records a notified run and drops the oldest beyond `limit`
    fn retire(&mut self, id: RunId, limit: usize) {
        self.history.push_back(id);
        while self.history.len() > limit {
            if let Some(old) = self.history.pop_front() {
                self.runs.remove(&old);
            }
        }
    }
}

struct EngineInner {
    pipeline: Pipeline,
    executor: StageExecutor,
    notifier: NotifierTool,
    notify_timeout: Duration,
    default_repo: String,
    metrics: MetricsCollector,
    history: usize,
    registry: RwLock<Registry>,
    next_number: AtomicU64,
}

/// Builder for [`PipelineEngine`]
pub struct EngineBuilder {
    pipeline: Pipeline,
    tools: ToolAdapters,
    default_timeout: Option<Duration>,
    notify_timeout: Duration,
    default_repo: String,
    metrics: MetricsCollector,
    history: usize,
}

impl EngineBuilder {
    /// Deadline for stages that do not configure one
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Deadline for the notifier call
    #[must_use]
    pub fn notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Repository built by poll and manual runs
    #[must_use]
    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.default_repo = repo.into();
        self
    }

    /// Collector receiving every finished run
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Number of finished runs kept for status queries (at least 1)
    #[must_use]
    pub fn history(mut self, runs: usize) -> Self {
        self.history = runs.max(1);
        self
    }

    /// Validates the pipeline and starts the engine's worker
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Validation`] for an invalid pipeline.
    pub fn build(self) -> Result<PipelineEngine, PipelineError> {
        self.pipeline.validate()?;
        let pipeline = self.pipeline.normalize();

        let mut executor = StageExecutor::new(self.tools.clone(), pipeline.policies.clone());
        if let Some(timeout) = self.default_timeout {
            executor = executor.with_default_timeout(timeout);
        }

        let inner = Arc::new(EngineInner {
            pipeline,
            executor,
            notifier: self.tools.notifier,
            notify_timeout: self.notify_timeout,
            default_repo: self.default_repo,
            metrics: self.metrics,
            history: self.history,
            registry: RwLock::new(Registry::default()),
            next_number: AtomicU64::new(0),
        });

        let (queue, mut pending) = mpsc::unbounded_channel::<RunId>();
        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(id) = pending.recv().await {
                Arc::clone(&worker).drive(id).await;
            }
            tracing::debug!(pipeline = %worker.pipeline.name, "Engine worker stopped");
        });

        tracing::info!(
            pipeline = %inner.pipeline.name,
            stages = inner.pipeline.stage_count(),
            concurrency = ?inner.pipeline.concurrency,
            "Pipeline engine started"
        );
        Ok(PipelineEngine { inner, queue })
    }
}

/// Runs one pipeline
///
/// Cloning is cheap; clones share the same runs and worker. The worker stops
/// once every clone is dropped and the queued runs are done.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
    queue: mpsc::UnboundedSender<RunId>,
}

impl PipelineEngine {
    /// Creates a builder
    pub fn builder(pipeline: Pipeline, tools: ToolAdapters) -> EngineBuilder {
        EngineBuilder {
            pipeline,
            tools,
            default_timeout: None,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            default_repo: "local".to_string(),
            metrics: MetricsCollector::new(),
            history: DEFAULT_RUN_HISTORY,
        }
    }

    /// Creates an engine with default settings
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Validation`] for an invalid pipeline.
    pub fn new(pipeline: Pipeline, tools: ToolAdapters) -> Result<Self, PipelineError> {
        Self::builder(pipeline, tools).build()
    }

    /// The pipeline this engine runs
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// The metrics collector
    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// Starts a run for a trigger cause
    ///
    /// The run is created `pending` and executed by the worker. With
    /// [`ConcurrencyPolicy::Queue`] a poll cause returns the poll run that is
    /// already queued, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunRejected`] when a run is active and the
    /// pipeline rejects overlapping runs.
    pub fn start_run(&self, cause: TriggerCause) -> Result<RunId, PipelineError> {
        self.enqueue(cause).map(|(id, _)| id)
    }

    /// Returns the run for `cause` and whether it was newly created
    fn enqueue(&self, cause: TriggerCause) -> Result<(RunId, bool), PipelineError> {
        let pipeline = &self.inner.pipeline;
        let mut registry = self.inner.registry.write();

        match pipeline.concurrency {
            ConcurrencyPolicy::Reject => {
                if let Some(active) = registry.active() {
                    tracing::warn!(pipeline = %pipeline.name, active = %active, cause = %cause, "Run rejected");
                    return Err(PipelineError::RunRejected {
                        pipeline: pipeline.name.clone(),
                        active: active.to_string(),
                    });
                }
            }
            ConcurrencyPolicy::Queue => {
                if matches!(cause, TriggerCause::Poll { .. })
                    && let Some(queued) = registry.queued_poll()
                {
                    tracing::debug!(pipeline = %pipeline.name, run = %queued, "Poll joined the queued run");
                    return Ok((queued, false));
                }
            }
        }

        let number = self.inner.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        let run = Run::new(number, pipeline.name.clone(), cause);
        let id = run.id();
        tracing::info!(pipeline = %pipeline.name, run = %id, number, cause = %run.cause(), "Run created");

        let (done, _) = watch::channel(false);
        registry.runs.insert(
            id,
            RunEntry {
                run,
                abort: Arc::new(AtomicBool::new(false)),
                done,
            },
        );
        registry.live.push_back(id);
        drop(registry);

        self.queue
            .send(id)
            .map_err(|_| PipelineError::Config("engine worker stopped".to_string()))?;
        Ok((id, true))
    }

    /// Snapshot of a run
    ///
    /// Only the most recent finished runs are kept (see
    /// [`EngineBuilder::history`]).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunNotFound`] for an unknown identifier.
    pub fn run_status(&self, id: RunId) -> Result<Run, PipelineError> {
        self.inner.snapshot(id)
    }

    /// Requests an abort
    ///
    /// A pending run is aborted immediately. A running run stops at the next
    /// stage boundary; the stage in flight is allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunNotFound`] for an unknown identifier and
    /// [`PipelineError::RunTerminal`] when the run already ended.
    pub fn abort_run(&self, id: RunId) -> Result<Run, PipelineError> {
        let mut registry = self.inner.registry.write();
        let entry = registry
            .runs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::RunNotFound(id.to_string()))?;
        if entry.run.status().is_terminal() {
            return Err(PipelineError::RunTerminal(id.to_string()));
        }

        entry.abort.store(true, Ordering::SeqCst);
        let pending = entry.run.status() == RunStatus::Pending;
        if pending {
            for stage in self.inner.pipeline.execution_order() {
                entry
                    .run
                    .append(StageResult::skipped(stage.name.clone(), ABORTED_REASON))?;
            }
            entry.run.transition(RunStatus::Aborted)?;
        }
        tracing::warn!(run = %id, status = %entry.run.status(), "Abort requested");
        let snapshot = entry.run.clone();
        if pending {
            registry.settle(id);
        }
        Ok(snapshot)
    }

    /// Waits until a run has ended and its notification was sent
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunNotFound`] for an unknown identifier.
    pub async fn wait_for(&self, id: RunId) -> Result<Run, PipelineError> {
        let mut done = {
            let registry = self.inner.registry.read();
            registry
                .runs
                .get(&id)
                .ok_or_else(|| PipelineError::RunNotFound(id.to_string()))?
                .done
                .subscribe()
        };
        if done.wait_for(|finished| *finished).await.is_err() {
            tracing::warn!(run = %id, "Engine stopped before the run finished");
        }
        self.inner.snapshot(id)
    }

    /// Starts a run and waits for it to end
    ///
    /// # Errors
    ///
    /// Returns the errors of [`PipelineEngine::start_run`].
    pub async fn run_to_completion(&self, cause: TriggerCause) -> Result<Run, PipelineError> {
        let id = self.start_run(cause)?;
        self.wait_for(id).await
    }

    /// Snapshots of every kept run, oldest first
    pub fn runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .inner
            .registry
            .read()
            .runs
            .values()
            .map(|e| e.run.clone())
            .collect();
        runs.sort_by_key(Run::number);
        runs
    }

    /// The active run, if any
    pub fn active_run(&self) -> Option<RunId> {
        self.inner.registry.read().active()
    }

    /// Starts a run for every cause a trigger source yields
    ///
    /// Rejected triggers are logged and dropped. Returns the number of runs
    /// created once the source is exhausted; a poll that joined a queued run
    /// is not counted.
    pub async fn listen<T: TriggerSource>(&self, mut source: T) -> usize {
        let mut started = 0;
        while let Some(cause) = source.next_cause().await {
            match self.enqueue(cause) {
                Ok((_, created)) => started += usize::from(created),
                Err(PipelineError::RunRejected { .. }) => {}
                Err(e) => tracing::error!(pipeline = %self.inner.pipeline.name, error = %e, "Trigger failed"),
            }
        }
        started
    }
}

impl EngineInner {
    fn snapshot(&self, id: RunId) -> Result<Run, PipelineError> {
        self.registry
            .read()
            .runs
            .get(&id)
            .map(|e| e.run.clone())
            .ok_or_else(|| PipelineError::RunNotFound(id.to_string()))
    }

    fn update(&self, id: RunId, change: impl FnOnce(&mut Run) -> Result<(), PipelineError>) {
        let mut registry = self.registry.write();
        let result = registry
            .runs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::RunNotFound(id.to_string()))
            .and_then(|entry| change(&mut entry.run));
        if let Err(e) = result {
            tracing::error!(run = %id, error = %e, "Run update refused");
        }
    }

    /// Moves a pending run to running
    ///
    /// Returns `None` when the run is gone or already ended, e.g. aborted
    /// while it was queued.
    fn begin(&self, id: RunId) -> Option<(Run, Arc<AtomicBool>)> {
        let mut registry = self.registry.write();
        let entry = registry.runs.get_mut(&id)?;
        if entry.run.status().is_terminal() {
            return None;
        }
        if let Err(e) = entry.run.transition(RunStatus::Running) {
            tracing::error!(run = %id, error = %e, "Run could not start");
            return None;
        }
        Some((entry.run.clone(), Arc::clone(&entry.abort)))
    }

    /// Moves a run to its final status and releases its slot
    fn complete(&self, id: RunId, status: RunStatus) {
        let mut registry = self.registry.write();
        if let Some(entry) = registry.runs.get_mut(&id)
            && let Err(e) = entry.run.transition(status)
        {
            tracing::error!(run = %id, error = %e, "Run update refused");
        }
        registry.settle(id);
    }

    async fn drive(self: Arc<Self>, id: RunId) {
        if let Some((run, abort)) = self.begin(id) {
            let task = Arc::clone(&self);
            let stages = tokio::spawn(async move { task.execute(run, abort).await });
            if let Err(error) = stages.await {
                self.recover(id, &panic_message(error));
            }
        }
        self.finalize(id).await;
    }

    async fn execute(&self, run: Run, abort: Arc<AtomicBool>) {
        let id = run.id();
        tracing::info!(pipeline = %self.pipeline.name, run = %id, number = run.number(), "Run started");

        let mut ctx = RunContext::for_run(&run, &self.default_repo);
        let mut stopped: Option<String> = None;
        let mut aborted = false;

        for (index, stage) in self.pipeline.execution_order().into_iter().enumerate() {
            if stopped.is_none() && abort.load(Ordering::SeqCst) {
                tracing::warn!(run = %id, stage = %stage.name, "Run aborted at stage boundary");
                stopped = Some(ABORTED_REASON.to_string());
                aborted = true;
            }
            if let Some(reason) = &stopped {
                let skipped = StageResult::skipped(stage.name.clone(), reason.clone());
                self.update(id, |run| run.append(skipped));
                continue;
            }

            self.update(id, |run| run.enter_stage(index));
            let result = self.executor.execute(stage, &mut ctx).await;
            let status = result.status;
            self.update(id, |run| run.append(result));

            if status != StageStatus::Passed {
                stopped = Some(format!(
                    "not run: stage '{}' {}",
                    stage.name,
                    status.to_string().to_lowercase()
                ));
            }
        }

        let final_status = match (aborted, stopped.is_some()) {
            (true, _) => RunStatus::Aborted,
            (false, true) => RunStatus::Failed,
            (false, false) => RunStatus::Succeeded,
        };
        self.complete(id, final_status);
    }

    /// Fails a run whose stage task panicked
    ///
    /// The stage in flight is recorded as failed and every later stage as
    /// skipped.
    fn recover(&self, id: RunId, message: &str) {
        tracing::error!(run = %id, error = %message, "Run task panicked");
        {
            let mut registry = self.registry.write();
            if let Some(entry) = registry.runs.get_mut(&id)
                && !entry.run.status().is_terminal()
            {
                let recorded = entry.run.stages().len();
                let mut stopped: Option<String> = None;
                for stage in self.pipeline.execution_order().into_iter().skip(recorded) {
                    let result = match &stopped {
                        Some(reason) => StageResult::skipped(stage.name.clone(), reason.clone()),
                        None => {
                            stopped = Some(format!("not run: stage '{}' failed", stage.name));
                            StageResult::failed(stage.name.clone(), format!("adapter panicked: {message}"))
                        }
                    };
                    if let Err(e) = entry.run.append(result) {
                        tracing::error!(run = %id, error = %e, "Run update refused");
                    }
                }
            }
        }
        self.complete(id, RunStatus::Failed);
    }

    async fn finalize(&self, id: RunId) {
        let Ok(run) = self.snapshot(id) else {
            return;
        };
        self.metrics.record(&run);

        let summary = run.summary();
        if run.status() == RunStatus::Succeeded {
            tracing::info!(run = %id, duration_ms = summary.duration_ms, "{summary}");
        } else {
            tracing::warn!(run = %id, duration_ms = summary.duration_ms, "{summary}");
        }

        let request = NotifyRequest { summary, run };
        let notifier = Arc::clone(&self.notifier);
        let mut call = tokio::spawn(async move { notifier.invoke(&request).await });
        match tokio::time::timeout(self.notify_timeout, &mut call).await {
            Ok(Ok(Ok(()))) => tracing::debug!(run = %id, "Notification sent"),
            Ok(Ok(Err(e))) => tracing::warn!(run = %id, error = %e, "Notification failed"),
            Ok(Err(e)) => {
                let message = panic_message(e);
                tracing::warn!(run = %id, error = %message, "Notification failed: notifier panicked");
            }
            Err(_) => {
                call.abort();
                tracing::warn!(run = %id, "Notification failed: deadline exceeded");
            }
        }

        let mut registry = self.registry.write();
        if let Some(entry) = registry.runs.get(&id) {
            entry.done.send_replace(true);
            registry.retire(id, self.history);
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
