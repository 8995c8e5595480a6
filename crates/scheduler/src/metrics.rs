//! Grounded in `localflare-pool::metrics` — gauges/counters tracking
//! scheduler activity rather than pool occupancy.

pub(crate) static METRIC_DO_ACTORS_LIVE: &str = "scheduler_do_actors_live";
pub(crate) static METRIC_DO_ALARM_DISPATCHED_TOTAL: &str = "scheduler_do_alarm_dispatched_total";
pub(crate) static METRIC_DO_ALARM_FAILED_TOTAL: &str = "scheduler_do_alarm_failed_total";
pub(crate) static METRIC_QUEUE_BATCH_DISPATCHED_TOTAL: &str = "scheduler_queue_batch_dispatched_total";
pub(crate) static METRIC_QUEUE_MESSAGE_DEAD_LETTERED_TOTAL: &str = "scheduler_queue_message_dead_lettered_total";
