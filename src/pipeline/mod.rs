// src/pipeline/mod.rs

pub mod queue;
pub mod sinks;

pub use queue::{FrameQueue, FrameReceiver, Poll, QueuePolicy};
pub use sinks::{FrameSink, PreviewSink, RecordSink, SinkWorker};
