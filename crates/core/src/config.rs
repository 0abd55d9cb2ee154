use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Key lookup used by the profiled readers; `env::var` in production.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn opt(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key).filter(|s| !s.trim().is_empty())
}

/// Read a profiled key: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_opt(lookup: Lookup<'_>, profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = opt(lookup, &prefixed) {
            return Some(v);
        }
    }
    opt(lookup, key)
}

fn profiled_or(lookup: Lookup<'_>, profile: &str, key: &str, default: &str) -> String {
    profiled_opt(lookup, profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_parse<T: std::str::FromStr>(lookup: Lookup<'_>, profile: &str, key: &str, default: T) -> T {
    match profiled_opt(lookup, profile, key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key = key, value = %raw, "unparseable config value, using default");
                default
            }
        },
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub node: NodeConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `JOBMESH_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_lookup("JOBMESH_PROFILE").unwrap_or_default();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        Self::from_lookup(profile, &env_lookup)
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(profile: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let p = profile.trim().to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            node: NodeConfig::from_lookup(lookup, p),
            scheduler: SchedulerConfig::from_lookup(lookup, p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  node:       name={}, filter={}, attributes={}",
            self.node.name,
            self.node.filter.as_deref().unwrap_or("(all nodes)"),
            self.node.attributes.len()
        );
        tracing::info!(
            "  scheduler:  name={}, max_threads={}, max_batch_size={}, idle_wait={}ms",
            self.scheduler.name,
            self.scheduler.max_threads,
            self.scheduler.max_batch_size,
            self.scheduler.idle_wait_time_ms
        );
    }
}

// ── Node ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of the local node, as known to cluster membership.
    pub name: String,
    /// Node-filter expression selecting nodes eligible for partitioned jobs.
    /// `None` means all nodes.
    pub filter: Option<String>,
    /// Attributes advertised by the local node (`JOBMESH_NODE_ATTRIBUTES=k=v,k=v`).
    pub attributes: BTreeMap<String, String>,
}

impl NodeConfig {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Self {
        Self {
            name: profiled_or(lookup, p, "JOBMESH_NODE_NAME", "node-0"),
            filter: profiled_opt(lookup, p, "JOBMESH_NODE_FILTER"),
            attributes: profiled_opt(lookup, p, "JOBMESH_NODE_ATTRIBUTES")
                .map(|raw| parse_attributes(&raw))
                .unwrap_or_default(),
        }
    }
}

/// Parse `k=v,k=v` pairs. Entries without `=` are ignored.
pub fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

// ── Scheduler ─────────────────────────────────────────────────

/// Execution tuning for one scheduler instance, typically parsed from env
/// or a YAML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Logical scheduler name, used for thread names and trigger bookkeeping.
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of worker threads.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Worker thread priority hint, 1 (lowest) to 10 (highest).
    #[serde(default = "default_thread_priority")]
    pub thread_priority: u8,
    /// Idle workers retire after this many seconds.
    #[serde(default = "default_thread_keep_alive")]
    pub thread_keep_alive_secs: u64,
    /// Maximum triggers dequeued per polling cycle.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Window for batching near-simultaneous triggers, in milliseconds.
    #[serde(default)]
    pub batch_time_window_ms: u64,
    /// Wait between store polls when nothing is due, in milliseconds.
    #[serde(default = "default_idle_wait_time")]
    pub idle_wait_time_ms: u64,
    /// Retry interval while the job store is unreachable, in milliseconds.
    #[serde(default = "default_db_failure_retry_interval")]
    pub db_failure_retry_interval_ms: u64,
    /// Lateness after which a firing counts as a misfire, in milliseconds.
    #[serde(default = "default_misfire_threshold")]
    pub misfire_threshold_ms: u64,
}

fn default_name() -> String { "jobmesh".to_string() }
fn default_max_threads() -> usize { 3 }
fn default_thread_priority() -> u8 { 5 }
fn default_thread_keep_alive() -> u64 { 3600 }
fn default_max_batch_size() -> usize { 1 }
fn default_idle_wait_time() -> u64 { 30_000 }
fn default_db_failure_retry_interval() -> u64 { 15_000 }
fn default_misfire_threshold() -> u64 { 10_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_threads: default_max_threads(),
            thread_priority: default_thread_priority(),
            thread_keep_alive_secs: default_thread_keep_alive(),
            max_batch_size: default_max_batch_size(),
            batch_time_window_ms: 0,
            idle_wait_time_ms: default_idle_wait_time(),
            db_failure_retry_interval_ms: default_db_failure_retry_interval(),
            misfire_threshold_ms: default_misfire_threshold(),
        }
    }
}

impl SchedulerConfig {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Self {
        let d = Self::default();
        Self {
            name: profiled_or(lookup, p, "JOBMESH_SCHEDULER_NAME", &d.name),
            max_threads: profiled_parse(lookup, p, "JOBMESH_MAX_THREADS", d.max_threads),
            thread_priority: profiled_parse(lookup, p, "JOBMESH_THREAD_PRIORITY", d.thread_priority),
            thread_keep_alive_secs: profiled_parse(lookup, p, "JOBMESH_THREAD_KEEP_ALIVE_SECS", d.thread_keep_alive_secs),
            max_batch_size: profiled_parse(lookup, p, "JOBMESH_MAX_BATCH_SIZE", d.max_batch_size),
            batch_time_window_ms: profiled_parse(lookup, p, "JOBMESH_BATCH_TIME_WINDOW_MS", d.batch_time_window_ms),
            idle_wait_time_ms: profiled_parse(lookup, p, "JOBMESH_IDLE_WAIT_TIME_MS", d.idle_wait_time_ms),
            db_failure_retry_interval_ms: profiled_parse(
                lookup,
                p,
                "JOBMESH_DB_FAILURE_RETRY_INTERVAL_MS",
                d.db_failure_retry_interval_ms,
            ),
            misfire_threshold_ms: profiled_parse(lookup, p, "JOBMESH_MISFIRE_THRESHOLD_MS", d.misfire_threshold_ms),
        }
    }

    pub fn thread_keep_alive(&self) -> Duration {
        Duration::from_secs(self.thread_keep_alive_secs)
    }

    pub fn batch_time_window(&self) -> Duration {
        Duration::from_millis(self.batch_time_window_ms)
    }

    pub fn idle_wait_time(&self) -> Duration {
        Duration::from_millis(self.idle_wait_time_ms)
    }

    pub fn db_failure_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_failure_retry_interval_ms)
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }
}
