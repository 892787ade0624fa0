pub mod bus;
pub mod emitter;
pub mod event;
pub mod sink;

pub use bus::EventBus;
pub use emitter::RunEmitter;
pub use event::{now_ts, Event, EventKind};
pub use sink::{ChannelSink, EventSink, JsonlSink, MemorySink, StdOutSink};
