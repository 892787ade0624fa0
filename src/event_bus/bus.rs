//! The single ordered event queue.
//!
//! Producers clone [`RunEmitter`]s and send into an unbounded flume channel;
//! one background listener task assigns per-run sequence numbers, applies
//! masking, and fans the event out to every registered sink. That single
//! consumer is the only sequencing point, so sinks observe strictly
//! increasing sequences in stream order. Sink failures are logged and
//! skipped; telemetry never interrupts a run.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::{sync::oneshot, task};

use super::emitter::RunEmitter;
use super::event::{Event, EventKind};
use super::sink::{EventSink, StdOutSink};
use crate::policy::masking::MaskingEngine;

pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    masking: Arc<MaskingEngine>,
    channel: (flume::Sender<Event>, flume::Receiver<Event>),
    listener: Mutex<Option<ListenerState>>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    /// A bus with no sinks and no masking rules. Useful as a base for
    /// builder-style configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        Self::with_sinks(vec![Box::new(sink)])
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            masking: Arc::new(MaskingEngine::disabled()),
            channel: flume::unbounded(),
            listener: Mutex::new(None),
        }
    }

    /// Install the masking engine events pass through before fan-out.
    #[must_use]
    pub fn with_masking(mut self, masking: MaskingEngine) -> Self {
        self.masking = Arc::new(masking);
        self
    }

    /// Dynamically add a sink (e.g. a per-request stream).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.sinks.lock().push(Box::new(sink));
    }

    /// A producer handle bound to one run id.
    #[must_use]
    pub fn emitter(&self, run_id: impl Into<String>) -> RunEmitter {
        RunEmitter::new(run_id, self.channel.0.clone())
    }

    /// Spawn the background listener. Idempotent.
    pub fn listen(&self) {
        let mut guard = self.listener.lock();
        if guard.is_some() {
            return;
        }

        let receiver = self.channel.1.clone();
        let sinks = Arc::clone(&self.sinks);
        let masking = Arc::clone(&self.masking);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            let mut sequences: FxHashMap<String, u64> = FxHashMap::default();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        // Drain whatever is already queued so callers that
                        // stop the bus observe a complete stream.
                        while let Ok(event) = receiver.try_recv() {
                            dispatch(event, &mut sequences, &masking, &sinks);
                        }
                        break;
                    }
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => dispatch(event, &mut sequences, &masking, &sinks),
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Drain the queue and stop the listener.
    pub async fn stop(&self) {
        let state = self.listener.lock().take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

fn dispatch(
    mut event: Event,
    sequences: &mut FxHashMap<String, u64>,
    masking: &MaskingEngine,
    sinks: &Mutex<Vec<Box<dyn EventSink>>>,
) {
    let sequence = sequences.entry(event.run_id.clone()).or_insert(0);
    event.sequence = *sequence;
    *sequence += 1;

    let run_id = event.run_id.clone();
    masking.mask_payload(&run_id, &mut event.payload);

    let finished_run = (event.kind == EventKind::GraphFinish).then_some(run_id);

    let mut sinks = sinks.lock();
    for sink in sinks.iter_mut() {
        if let Err(err) = sink.handle(&event) {
            tracing::warn!(error = %err, event = %event.kind, "event sink failed; continuing");
        }
    }
    drop(sinks);

    // Run-scoped bookkeeping dies with the run.
    if let Some(run_id) = finished_run {
        sequences.remove(&run_id);
        masking.forget_run(&run_id);
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(state) = self.listener.lock().take() {
            let _ = state.shutdown_tx.send(());
            state.handle.abort();
        }
    }
}
