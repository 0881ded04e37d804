use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::errors::{RunFailure, TraceError};
use crate::event::StreamEvent;
use crate::tracker::{Emission, RunRecord, TraceState};

/// Handle used to abort a trace.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub(crate) fn new(tx: watch::Sender<bool>) -> Self {
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation.
    ///
    /// No new runs start afterwards; the root run and every open run under it
    /// fail with [`FailureReason::Cancelled`](crate::FailureReason::Cancelled).
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Consumer side of a trace: a lazy, single-pass sequence of envelopes.
///
/// Items are `Ok(event)` for envelopes and, with
/// [`FailurePolicy::Signal`](crate::FailurePolicy::Signal), `Err(failure)` in
/// place of the end event of a run that failed. The sequence ends once the
/// root run and all runs under it are terminal.
///
/// Dropping the stream detaches the consumer: the computation keeps running
/// and further events are discarded.
pub struct EventStream<O> {
    trace: Arc<TraceState>,
    rx: mpsc::Receiver<Emission>,
    final_rx: oneshot::Receiver<Result<Option<O>, TraceError>>,
    abort_handle: AbortHandle,
    done: bool,
}

impl<O> EventStream<O> {
    pub(crate) fn new(
        trace: Arc<TraceState>,
        rx: mpsc::Receiver<Emission>,
        final_rx: oneshot::Receiver<Result<Option<O>, TraceError>>,
        abort_handle: AbortHandle,
    ) -> Self {
        Self {
            trace,
            rx,
            final_rx,
            abort_handle,
            done: false,
        }
    }

    /// Identifier of this trace, used in log records.
    pub fn trace_id(&self) -> Uuid {
        self.trace.trace_id()
    }

    /// Returns a handle that can cancel the trace.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Snapshot of every run of the trace so far, depth first.
    pub fn run_tree(&self) -> Vec<RunRecord> {
        self.trace.snapshot()
    }

    pub fn run(&self, run_id: Uuid) -> Option<RunRecord> {
        self.trace.record(run_id)
    }

    /// Waits for the next item. Returns `None` once the trace is complete.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, RunFailure>> {
        if self.done {
            return None;
        }
        let item = self.rx.recv().await;
        self.map_emission(item)
    }

    /// Drains the stream and returns every envelope, skipping failure items.
    pub async fn collect_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(item) = self.next_event().await {
            if let Ok(event) = item {
                events.push(event);
            }
        }
        events
    }

    /// Drains the stream (if needed) and returns the root run's result.
    pub async fn finish(mut self) -> Result<Option<O>, TraceError> {
        while self.next_event().await.is_some() {}
        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(TraceError::Protocol(
                "trace task ended without a final result".into(),
            )),
        }
    }

    fn map_emission(&mut self, item: Option<Emission>) -> Option<Result<StreamEvent, RunFailure>> {
        match item {
            Some(Emission::Event(event)) => Some(Ok(event)),
            Some(Emission::Failure(failure)) => Some(Err(failure)),
            Some(Emission::Closed) | None => {
                self.done = true;
                None
            }
        }
    }
}

impl<O> Stream for EventStream<O> {
    type Item = Result<StreamEvent, RunFailure>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(item) => Poll::Ready(this.map_emission(item)),
            Poll::Pending => Poll::Pending,
        }
    }
}
