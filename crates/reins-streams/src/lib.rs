//! Stream subscription book and throttled progress fan-out.
//!
//! Long-running background work publishes through these two pieces: the
//! stream registry maps `"<conversation_id>:<assistant_message_id>"` keys to
//! subscribed connections with serialize-once fan-out, and the progress
//! emitter throttles intermediate updates while always delivering lifecycle
//! edges.

pub mod progress;
pub mod registry;

pub use progress::{
    ProgressEmitter, ProgressEvent, ProgressStage, DEFAULT_PROGRESS_MIN_INTERVAL_MS,
};
pub use registry::{stream_key, PublishSummary, StreamRegistry};
