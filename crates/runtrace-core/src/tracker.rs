//! Run tracker: the per-trace arena of run records and the per-run emitter.
//!
//! Every run of a trace is a [`RunRecord`] in a concurrent map keyed by
//! run id. Records reference their parent by id only. All state transitions
//! that emit something go through the trace's emitter lock, so a check such
//! as "is this run still open" and the emission that depends on it are atomic
//! with respect to every other run of the trace.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::chunk::{ChunkAccumulator, Combine};
use crate::config::{FailurePolicy, OutputPolicy, TracerConfig};
use crate::context::{ResolvedContext, RunConfig};
use crate::errors::{EnvelopeError, FailureReason, RunFailure, TraceError};
use crate::event::{EventData, RunKind, StreamEvent};

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run id allocated and context resolved; start event not yet delivered.
    Pending,
    Started,
    Streaming,
    Ended,
    Failed,
}

impl RunState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Started | Self::Streaming)
    }
}

/// Snapshot of one run in the trace arena.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    /// Run that started this one; `None` for the root.
    pub parent_run_id: Option<Uuid>,
    /// Child runs in start order.
    pub children: Vec<Uuid>,
    pub name: String,
    pub kind: RunKind,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
    pub state: RunState,
    pub chunk_count: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    #[serde(skip)]
    failure_reported: bool,
}

impl RunRecord {
    fn needs_close(&self) -> bool {
        self.state.is_open() || (self.state == RunState::Failed && !self.failure_reported)
    }
}

/// Item travelling from the producing runs to the consumer.
#[derive(Debug)]
pub(crate) enum Emission {
    Event(StreamEvent),
    Failure(RunFailure),
    /// The root run and every run under it reached a terminal state.
    Closed,
}

struct Emitter {
    tx: Option<mpsc::Sender<Emission>>,
    emit_timeout: Option<Duration>,
    delivered: u64,
}

impl Emitter {
    /// Hands one item to the consumer. Once the consumer is gone or stalled
    /// past the timeout, the sender is dropped and later items are discarded.
    async fn deliver(&mut self, trace_id: Uuid, emission: Emission) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let sent = match self.emit_timeout {
            Some(limit) => match tokio::time::timeout(limit, tx.send(emission)).await {
                Ok(result) => result.is_ok(),
                Err(_) => {
                    warn!(trace_id = %trace_id, timeout_ms = limit.as_millis() as u64, "event consumer stalled; detaching");
                    false
                }
            },
            None => tx.send(emission).await.is_ok(),
        };
        if sent {
            self.delivered += 1;
        } else {
            self.tx = None;
            warn!(trace_id = %trace_id, delivered = self.delivered, "event consumer detached; discarding further events");
        }
    }
}

/// Shared state of one trace: the run arena plus the consumer channel.
pub(crate) struct TraceState {
    trace_id: Uuid,
    runs: DashMap<Uuid, RunRecord>,
    emitter: Mutex<Emitter>,
    failure_policy: FailurePolicy,
    output_policy: OutputPolicy,
    abort_rx: watch::Receiver<bool>,
}

impl TraceState {
    pub(crate) fn new(
        tx: mpsc::Sender<Emission>,
        config: &TracerConfig,
        abort_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            runs: DashMap::new(),
            emitter: Mutex::new(Emitter {
                tx: Some(tx),
                emit_timeout: config.emit_timeout,
                delivered: 0,
            }),
            failure_policy: config.failure_policy,
            output_policy: config.output_policy,
            abort_rx,
        }
    }

    pub(crate) fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.abort_rx.borrow()
    }

    pub(crate) fn record(&self, run_id: Uuid) -> Option<RunRecord> {
        self.runs.get(&run_id).map(|r| r.value().clone())
    }

    /// All runs, depth first from the root(s), children in start order.
    pub(crate) fn snapshot(&self) -> Vec<RunRecord> {
        let mut roots: Vec<(DateTime<Utc>, Uuid)> = self
            .runs
            .iter()
            .filter(|r| r.parent_run_id.is_none())
            .map(|r| (r.started_at, r.run_id))
            .collect();
        roots.sort();
        let mut stack: Vec<Uuid> = roots.into_iter().rev().map(|(_, id)| id).collect();
        let mut out = Vec::with_capacity(self.runs.len());
        while let Some(run_id) = stack.pop() {
            if let Some(record) = self.record(run_id) {
                stack.extend(record.children.iter().rev().copied());
                out.push(record);
            }
        }
        out
    }

    fn is_open(&self, run_id: Uuid) -> bool {
        self.runs.get(&run_id).is_some_and(|r| r.state.is_open())
    }

    fn orphan_reason(&self) -> FailureReason {
        if self.is_cancelled() {
            FailureReason::Cancelled
        } else {
            FailureReason::Abandoned
        }
    }

    fn insert_pending(
        &self,
        parent_run_id: Option<Uuid>,
        name: &str,
        kind: &RunKind,
        context: &ResolvedContext,
    ) -> Uuid {
        let run_id = loop {
            let candidate = Uuid::new_v4();
            match self.runs.entry(candidate) {
                Entry::Vacant(slot) => {
                    slot.insert(RunRecord {
                        run_id: candidate,
                        parent_run_id,
                        children: Vec::new(),
                        name: name.to_string(),
                        kind: kind.clone(),
                        tags: context.tags().to_vec(),
                        metadata: context.metadata().clone(),
                        state: RunState::Pending,
                        chunk_count: 0,
                        started_at: Utc::now(),
                        ended_at: None,
                        failure: None,
                        failure_reported: false,
                    });
                    break candidate;
                }
                Entry::Occupied(_) => {
                    warn!(trace_id = %self.trace_id, run_id = %candidate, "run id collision; drawing a new one");
                }
            }
        };
        if let Some(parent) = parent_run_id
            && let Some(mut record) = self.runs.get_mut(&parent)
        {
            record.children.push(run_id);
        }
        run_id
    }

    fn set_state(&self, run_id: Uuid, state: RunState) {
        if let Some(mut record) = self.runs.get_mut(&run_id) {
            record.state = state;
            if !state.is_open() {
                record.ended_at = Some(Utc::now());
            }
        }
    }

    fn record_chunk(&self, run_id: Uuid) {
        if let Some(mut record) = self.runs.get_mut(&run_id) {
            record.state = RunState::Streaming;
            record.chunk_count += 1;
        }
    }

    /// Marks a run whose handle was dropped while open. Runs from `Drop`, so it
    /// cannot emit; the failure is reported when the parent or the trace closes.
    fn mark_dropped(&self, run_id: Uuid) {
        let reason = self.orphan_reason();
        if let Some(mut record) = self.runs.get_mut(&run_id)
            && record.state.is_open()
        {
            warn!(trace_id = %self.trace_id, run_id = %run_id, name = %record.name, "run handle dropped before a terminal event");
            record.state = RunState::Failed;
            record.failure = Some(reason);
            record.ended_at = Some(Utc::now());
        }
    }

    /// Runs under `run_id` that still need a terminal outcome, deepest first.
    fn unclosed_descendants(&self, run_id: Uuid) -> Vec<Uuid> {
        let mut preorder = Vec::new();
        let mut stack = self
            .runs
            .get(&run_id)
            .map(|r| r.children.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(record) = self.runs.get(&id) {
                stack.extend(record.children.iter().copied());
                if record.needs_close() {
                    preorder.push(id);
                }
            }
        }
        preorder.reverse();
        preorder
    }

    /// Forgets a run whose start event was never delivered, so nothing about
    /// it reaches the consumer.
    fn discard_pending(&self, run_id: Uuid) {
        let Some((_, record)) = self
            .runs
            .remove_if(&run_id, |_, r| r.state == RunState::Pending)
        else {
            return;
        };
        if let Some(parent) = record.parent_run_id
            && let Some(mut parent) = self.runs.get_mut(&parent)
        {
            parent.children.retain(|id| *id != run_id);
        }
        debug!(trace_id = %self.trace_id, run_id = %run_id, name = %record.name, "discarded run whose start was never delivered");
    }

    /// Replaces the reason of failed, unreported runs that were only known to
    /// be abandoned.
    pub(crate) fn relabel_abandoned(&self, reason: &FailureReason) {
        for mut record in self.runs.iter_mut() {
            if record.state == RunState::Failed
                && !record.failure_reported
                && record.failure == Some(FailureReason::Abandoned)
            {
                record.failure = Some(reason.clone());
            }
        }
    }

    /// Moves a run to `Failed` (keeping an earlier failure reason) and reports
    /// it according to the failure policy. Returns `None` for unknown runs and
    /// for runs whose start was never delivered, which are discarded.
    async fn close_run(
        &self,
        emitter: &mut Emitter,
        run_id: Uuid,
        reason: FailureReason,
    ) -> Option<RunFailure> {
        let pending = self.runs.get(&run_id)?.state == RunState::Pending;
        if pending {
            self.discard_pending(run_id);
            return None;
        }
        let (failure, report) = {
            let mut record = self.runs.get_mut(&run_id)?;
            let report = record.needs_close();
            if report {
                let reason = record.failure.clone().unwrap_or(reason);
                record.state = RunState::Failed;
                record.failure = Some(reason);
                record.ended_at.get_or_insert_with(Utc::now);
                record.failure_reported = true;
            }
            let failure = RunFailure {
                run_id,
                name: record.name.clone(),
                kind: record.kind.clone(),
                reason: record
                    .failure
                    .clone()
                    .unwrap_or(FailureReason::Abandoned),
            };
            (failure, report)
        };
        if report {
            warn!(trace_id = %self.trace_id, run_id = %run_id, name = %failure.name, reason = %failure.reason, "run failed");
            if self.failure_policy == FailurePolicy::Signal {
                emitter
                    .deliver(self.trace_id, Emission::Failure(failure.clone()))
                    .await;
            }
        }
        Some(failure)
    }

    async fn close_descendants(&self, emitter: &mut Emitter, run_id: Uuid, reason: FailureReason) {
        for id in self.unclosed_descendants(run_id) {
            self.close_run(emitter, id, reason.clone()).await;
        }
    }

    /// Closes every run that is still open or unreported, children before
    /// parents, then ends the consumer stream.
    pub(crate) async fn seal(&self) {
        let reason = self.orphan_reason();
        let mut emitter = self.emitter.lock().await;
        let roots: Vec<Uuid> = self
            .runs
            .iter()
            .filter(|r| r.parent_run_id.is_none())
            .map(|r| r.run_id)
            .collect();
        for root in roots {
            self.close_descendants(&mut emitter, root, reason.clone())
                .await;
            self.close_run(&mut emitter, root, reason.clone()).await;
        }
        emitter.deliver(self.trace_id, Emission::Closed).await;
        emitter.tx = None;
        debug!(trace_id = %self.trace_id, delivered = emitter.delivered, "trace sealed");
    }
}

/// Scope in which new runs are started.
///
/// The root context starts the root run; [`RunHandle::context`] returns the
/// context for that run's children. Contexts are cheap to clone and can be
/// moved into spawned tasks to run children concurrently.
#[derive(Clone)]
pub struct RunContext {
    pub(crate) trace: Arc<TraceState>,
    parent: Option<ParentScope>,
}

#[derive(Clone)]
struct ParentScope {
    run_id: Uuid,
    context: Arc<ResolvedContext>,
}

impl RunContext {
    pub(crate) fn root(trace: Arc<TraceState>) -> Self {
        Self {
            trace,
            parent: None,
        }
    }

    /// Run that children started from this context are attached to.
    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.parent.as_ref().map(|p| p.run_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.trace.is_cancelled()
    }

    /// Resolves once the trace is aborted. Never resolves if it is not.
    pub async fn cancelled(&self) {
        let mut rx = self.trace.abort_rx.clone();
        if *rx.borrow_and_update() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow_and_update() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// Snapshot of every run of the trace so far.
    pub fn run_tree(&self) -> Vec<RunRecord> {
        self.trace.snapshot()
    }

    /// Starts a run: resolves its context from the parent's, allocates a run
    /// id and emits the start event. `own.run_name` replaces `name` when set.
    ///
    /// `input` is the input as known now; pass `None` when it only becomes
    /// known later and supply it to [`RunHandle::end_with_input`].
    pub async fn start_run<O>(
        &self,
        kind: RunKind,
        name: impl Into<String>,
        own: &RunConfig,
        input: Option<Value>,
    ) -> Result<RunHandle<O>, TraceError> {
        if self.is_cancelled() {
            return Err(TraceError::Cancelled);
        }
        let name = own.run_name.clone().unwrap_or_else(|| name.into());
        let context = Arc::new(match &self.parent {
            Some(parent) => parent.context.inherit(own),
            None => ResolvedContext::root(own),
        });
        let parent_run_id = self.parent_run_id();

        let mut emitter = self.trace.emitter.lock().await;
        if let Some(parent) = parent_run_id
            && !self.trace.is_open(parent)
        {
            return Err(TraceError::RunClosed { run_id: parent });
        }
        let run_id = self
            .trace
            .insert_pending(parent_run_id, &name, &kind, &context);
        let input_emitted = input.is_some();
        let event = StreamEvent::new(
            kind.clone(),
            name.clone(),
            run_id,
            context.tags().to_vec(),
            context.metadata().clone(),
            EventData::start(input),
        );
        debug!(trace_id = %self.trace.trace_id, run_id = %run_id, parent_run_id = ?parent_run_id, event = %event.event(), name = %name, "run started");
        emitter
            .deliver(self.trace.trace_id, Emission::Event(event))
            .await;
        self.trace.set_state(run_id, RunState::Started);
        drop(emitter);

        Ok(RunHandle {
            trace: self.trace.clone(),
            run_id,
            name,
            kind,
            context,
            chunks: ChunkAccumulator::default(),
            input_emitted,
            closed: false,
        })
    }
}

/// Emitter for one run.
///
/// Owned by the code executing the unit; `stream` takes `&mut self` and the
/// terminal operations consume the handle, so events of one run are strictly
/// sequential and nothing can follow the end event. Dropping an open handle
/// fails the run as abandoned (or cancelled, if the trace was aborted).
pub struct RunHandle<O> {
    trace: Arc<TraceState>,
    run_id: Uuid,
    name: String,
    kind: RunKind,
    context: Arc<ResolvedContext>,
    chunks: ChunkAccumulator<O>,
    input_emitted: bool,
    closed: bool,
}

impl<O> RunHandle<O> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RunKind {
        &self.kind
    }

    pub fn tags(&self) -> &[String] {
        self.context.tags()
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        self.context.metadata()
    }

    /// Context for starting child runs of this run.
    pub fn context(&self) -> RunContext {
        RunContext {
            trace: self.trace.clone(),
            parent: Some(ParentScope {
                run_id: self.run_id,
                context: self.context.clone(),
            }),
        }
    }

    fn envelope(&self, data: EventData) -> StreamEvent {
        StreamEvent::new(
            self.kind.clone(),
            self.name.clone(),
            self.run_id,
            self.context.tags().to_vec(),
            self.context.metadata().clone(),
            data,
        )
    }
}

impl<O> RunHandle<O>
where
    O: Combine + Serialize + PartialEq,
{
    /// Combination of every chunk streamed so far.
    pub fn accumulated(&self) -> Option<&O> {
        self.chunks.value()
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len()
    }

    /// Folds `chunk` into the accumulator and emits a stream event carrying it.
    ///
    /// A chunk that cannot be combined with the previous ones is rejected
    /// before anything is emitted.
    pub async fn stream(&mut self, chunk: O) -> Result<(), TraceError> {
        let payload = serde_json::to_value(&chunk)?;
        let mut emitter = self.trace.emitter.lock().await;
        if !self.trace.is_open(self.run_id) {
            return Err(TraceError::RunClosed {
                run_id: self.run_id,
            });
        }
        self.chunks.push(chunk)?;
        self.trace.record_chunk(self.run_id);
        let event = self.envelope(EventData::stream(payload));
        debug!(trace_id = %self.trace.trace_id, run_id = %self.run_id, seq = self.chunks.len(), "run chunk");
        emitter
            .deliver(self.trace.trace_id, Emission::Event(event))
            .await;
        Ok(())
    }

    /// Emits the end event.
    ///
    /// `output` is the unit's explicit result; `None` means "the combination of
    /// the streamed chunks". When both exist they must be equal, otherwise the
    /// run fails with [`FailureReason::ChunkMismatch`]. Returns the final
    /// output, `None` if the run produced neither chunks nor an output.
    pub async fn end(self, output: Option<O>) -> Result<Option<O>, TraceError> {
        self.finish(None, output).await
    }

    /// Emits the end event for a run whose input was not known at start.
    pub async fn end_with_input(
        self,
        input: Value,
        output: Option<O>,
    ) -> Result<Option<O>, TraceError> {
        self.finish(Some(input), output).await
    }

    /// Fails the run. No end event is emitted for it.
    pub async fn fail(mut self, reason: FailureReason) -> RunFailure {
        self.fail_with(reason).await
    }

    async fn finish(mut self, input: Option<Value>, output: Option<O>) -> Result<Option<O>, TraceError> {
        if input.is_some() && self.input_emitted {
            let err = EnvelopeError::InputAlreadyEmitted {
                run_id: self.run_id,
            };
            self.fail_with(FailureReason::Contract {
                message: err.to_string(),
            })
            .await;
            return Err(err.into());
        }

        let streamed = !self.chunks.is_empty();
        let output = match (output, self.chunks.take()) {
            (Some(explicit), Some(accumulated)) if explicit != accumulated => {
                let explicit = serde_json::to_value(&explicit).unwrap_or_default();
                let accumulated = serde_json::to_value(&accumulated).unwrap_or_default();
                error!(trace_id = %self.trace.trace_id, run_id = %self.run_id, name = %self.name, %accumulated, %explicit, "accumulated chunks do not match the explicit output");
                self.fail_with(FailureReason::ChunkMismatch).await;
                return Err(TraceError::ChunkMismatch {
                    run_id: self.run_id,
                    accumulated,
                    explicit,
                });
            }
            (Some(explicit), _) => Some(explicit),
            (None, accumulated) => accumulated,
        };

        let payload = match (&output, self.trace.output_policy) {
            (Some(_), OutputPolicy::OmitDerivable) if streamed => None,
            (Some(value), _) => match serde_json::to_value(value) {
                Ok(payload) => Some(payload),
                Err(err) => {
                    self.fail_with(FailureReason::Contract {
                        message: format!("output is not serializable: {err}"),
                    })
                    .await;
                    return Err(err.into());
                }
            },
            (None, _) => None,
        };

        let mut emitter = self.trace.emitter.lock().await;
        if !self.trace.is_open(self.run_id) {
            self.closed = true;
            return Err(TraceError::RunClosed {
                run_id: self.run_id,
            });
        }
        self.trace
            .close_descendants(&mut emitter, self.run_id, FailureReason::Abandoned)
            .await;
        let event = self.envelope(EventData::end(input, payload));
        self.trace.set_state(self.run_id, RunState::Ended);
        debug!(trace_id = %self.trace.trace_id, run_id = %self.run_id, event = %event.event(), chunks = self.chunks.len(), "run ended");
        emitter
            .deliver(self.trace.trace_id, Emission::Event(event))
            .await;
        self.closed = true;
        Ok(output)
    }

    async fn fail_with(&mut self, reason: FailureReason) -> RunFailure {
        let orphan_reason = self.trace.orphan_reason();
        let mut emitter = self.trace.emitter.lock().await;
        self.trace
            .close_descendants(&mut emitter, self.run_id, orphan_reason)
            .await;
        let failure = self
            .trace
            .close_run(&mut emitter, self.run_id, reason.clone())
            .await;
        self.closed = true;
        failure.unwrap_or(RunFailure {
            run_id: self.run_id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            reason,
        })
    }
}

impl<O> Drop for RunHandle<O> {
    fn drop(&mut self) {
        if !self.closed {
            self.trace.mark_dropped(self.run_id);
        }
    }
}
