//! Process configuration, parsed once at startup from CLI flags (with env
//! var fallbacks via `clap`'s `env` attribute) — the same `clap::Parser`
//! shape `hyperlight-js-runtime`'s CLI uses, scaled up from two positional
//! args to the knobs a long-running server needs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "localflare", version, about)]
pub struct Config {
    /// Directory holding localflare.db and per-backend data (R2 objects, D1
    /// database files). Created on first run if it doesn't exist.
    #[arg(long, env = "LOCALFLARE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Address the admin HTTP surface listens on.
    #[arg(long, env = "LOCALFLARE_BIND_ADDR", default_value = "127.0.0.1:8787")]
    pub bind_addr: SocketAddr,

    /// Number of pre-warmed bare JsRuntimes kept in the pool.
    #[arg(long, env = "LOCALFLARE_POOL_SIZE", default_value_t = 8)]
    pub pool_size: usize,

    /// Base URL of the local model server an `Ai` binding without its own
    /// override talks to.
    #[arg(long, env = "LOCALFLARE_AI_BASE_URL", default_value = "http://127.0.0.1:11434")]
    pub ai_base_url: String,

    /// Wall-clock budget for a single fetch/alarm/queue-batch dispatch.
    #[arg(long, env = "LOCALFLARE_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    pub call_timeout_ms: u64,

    /// How long a durable object instance's actor task waits for a new
    /// command before it exits and goes cold.
    #[arg(long, env = "LOCALFLARE_DO_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub do_idle_timeout_secs: u64,

    /// How often the alarm poller checks storage for due alarms.
    #[arg(long, env = "LOCALFLARE_ALARM_POLL_INTERVAL_MS", default_value_t = 500)]
    pub alarm_poll_interval_ms: u64,

    /// Base backoff applied to an alarm whose handler threw.
    #[arg(long, env = "LOCALFLARE_ALARM_BACKOFF_MS", default_value_t = 5_000)]
    pub alarm_backoff_ms: i64,

    /// Number of retries before a failing alarm is abandoned.
    #[arg(long, env = "LOCALFLARE_ALARM_MAX_RETRIES", default_value_t = 5)]
    pub alarm_max_retries: u32,

    /// Fallback poll interval for a queue's consumer task when nothing
    /// wakes it early.
    #[arg(long, env = "LOCALFLARE_QUEUE_POLL_INTERVAL_MS", default_value_t = 250)]
    pub queue_poll_interval_ms: u64,

    /// Visibility timeout applied to messages pulled off a queue.
    #[arg(long, env = "LOCALFLARE_QUEUE_VISIBILITY_TIMEOUT_SECS", default_value_t = 30)]
    pub queue_visibility_timeout_secs: i64,
}

impl Config {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn do_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.do_idle_timeout_secs)
    }

    pub fn alarm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.alarm_poll_interval_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }
}
