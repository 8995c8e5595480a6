//! Grounded in `hyperlight-js::sandbox::metrics` — gauges tracking how many
//! runtimes are idle vs. checked out, counters for cache hits/misses.

pub(crate) static METRIC_POOL_CAPACITY: &str = "pool_capacity";
pub(crate) static METRIC_POOL_IN_USE: &str = "pool_runtimes_in_use";
pub(crate) static METRIC_POOL_ACQUIRE_TOTAL: &str = "pool_acquire_total";
pub(crate) static METRIC_POOL_CACHE_HIT_TOTAL: &str = "pool_cache_hit_total";
pub(crate) static METRIC_POOL_CACHE_MISS_TOTAL: &str = "pool_cache_miss_total";
