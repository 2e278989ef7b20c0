//! System-wide tunables. Values come straight from the design: the worker's
//! concurrency cap and poll interval, the cron tick, platform message
//! limits, and the runner wall-clock timeout are all specified rather than
//! guessed, so they live here instead of scattered through call sites.

/// Maximum number of tasks the worker runs at once, across all repos.
pub const MAX_CONCURRENT_TASKS: usize = 5;

/// How often the worker checks for newly dequeueable work when idle.
pub const WORKER_POLL_INTERVAL_MS: u64 = 2_000;

/// How often the cron evaluator checks schedules against the current minute.
pub const CRON_TICK_INTERVAL_SECS: u64 = 10;

/// Bound on the cron fired-set so memory doesn't grow unboundedly.
pub const CRON_FIRED_SET_CAP: usize = 5;

/// Default interval for the repo registry's external-sync refresh loop.
pub const DEFAULT_REGISTRY_SYNC_INTERVAL_SECS: u64 = 30 * 60;

/// Hard wall-clock timeout for a single runner invocation.
pub const RUNNER_TIMEOUT_SECS: u64 = 30 * 60;

/// `maxTurns` floor for cron-triggered tasks, which must proceed unattended.
pub const CRON_MIN_MAX_TURNS: u32 = 100;

/// `maxTurns` used for `discuss` tasks, which should stay short.
pub const DISCUSS_MAX_TURNS: u32 = 5;

/// How long a pending-reply join entry survives after its task completes.
pub const PENDING_REPLY_TTL_SECS: u64 = 5 * 60;

/// Conversation turns carried into the repo-resolver's LLM prompt.
pub const RESOLVER_CONTEXT_TURNS: usize = 6;

/// Webhook request body size cap, in bytes.
pub const WEBHOOK_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default trace listing page size.
pub const DEFAULT_TRACE_LIMIT: i64 = 200;

/// Per-platform hard message-length limits used by the reply pipeline.
pub mod platform_limits {
    pub const SLACK: usize = 3_900;
    pub const DISCORD: usize = 2_000;
    pub const TELEGRAM: usize = 4_096;
    pub const WHATSAPP: usize = 60_000;
    pub const CLI: usize = usize::MAX;
    pub const UNKNOWN: usize = 3_900;
}

/// Trailing-edge debounce window for status updates.
pub const STATUS_DEBOUNCE_MS: u64 = 3_000;

/// Default bind host for the webhook HTTP server. Localhost-only by
/// default; operators opt into a wider bind explicitly via `API_HOST`.
pub const DEFAULT_API_HOST: &str = "127.0.0.1";

/// Default bind port for the webhook HTTP server.
pub const DEFAULT_API_PORT: u16 = 8080;
