//! Schedulers sit between the runtime pool and storage: they decide *when*
//! and *on which runtime* an event handler runs, then translate whatever it
//! reports back into storage-layer effects (deleting an alarm, acking a
//! queue message, moving one to the dead-letter queue).

mod metrics;

pub mod durable_object;
pub mod queue;

pub use durable_object::{AlarmPoller, DurableObjectScheduler};
pub use queue::{QueueConsumer, QueueScheduler};
