//! Pipeline stages and the coordination primitives they are built from.
//!
//! Provides the producer/consumer contracts, keyed multiplexing, the
//! rate-limited job scheduler and the pausable hand-off queue.

mod consumer;
mod handoff;
mod job_scheduler;
mod multiplex;

pub use consumer::{
    ChannelConsumer, Consumer, ConsumerEvent, FinishOnceConsumer, MapConsumer, Producer,
};
pub use handoff::{HandoffProducer, HandoffQueue, HandoffTicket};
pub use job_scheduler::{JobInput, JobScheduler, JobStatus};
pub use multiplex::{BitmapCacheKeyStrategy, EncodedCacheKeyStrategy, KeyStrategy, Multiplexer};
