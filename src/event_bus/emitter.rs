//! Run-scoped event producer handed to executors and components.

use crate::event_bus::event::{Event, EventKind};
use crate::utils::collections::JsonMap;

/// Cheap clonable handle that stamps the run id and wall-clock timestamp on
/// every event before queueing it on the bus.
///
/// Emission never fails the run: if the bus is gone the event is dropped and
/// logged at debug level.
#[derive(Clone, Debug)]
pub struct RunEmitter {
    run_id: String,
    sender: flume::Sender<Event>,
}

impl RunEmitter {
    #[must_use]
    pub fn new(run_id: impl Into<String>, sender: flume::Sender<Event>) -> Self {
        Self {
            run_id: run_id.into(),
            sender,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Queue one event on the bus.
    pub fn emit(&self, kind: EventKind, payload: JsonMap) {
        let event = Event::new(kind, self.run_id.clone(), payload);
        if self.sender.send(event).is_err() {
            tracing::debug!(run_id = %self.run_id, event = %kind, "event bus disconnected; dropping event");
        }
    }
}
