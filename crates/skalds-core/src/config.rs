//! Controller configuration: run mode, endpoints, intervals, thresholds,
//! and dispatch policy. Everything is optional with defaults; values come
//! from `SKALDS_*` environment variables.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::dispatch::policy::DispatchPolicy;

/// Which component set this process runs.
///
/// Modes compose additively: `Controller` is the state stores plus the HTTP
/// surface; `Monitor` adds the monitors and the reconciler; `Dispatcher`
/// adds the dispatcher on top of that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunMode {
    Controller,
    Monitor,
    Dispatcher,
}

impl RunMode {
    /// Whether this mode runs the monitors and the reconciler.
    pub fn monitors_enabled(self) -> bool {
        matches!(self, Self::Monitor | Self::Dispatcher)
    }

    /// Whether this mode runs the dispatcher.
    pub fn dispatcher_enabled(self) -> bool {
        matches!(self, Self::Dispatcher)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Controller => "controller",
            Self::Monitor => "monitor",
            Self::Dispatcher => "dispatcher",
        };
        f.write_str(s)
    }
}

impl FromStr for RunMode {
    type Err = RunModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            "monitor" => Ok(Self::Monitor),
            "dispatcher" => Ok(Self::Dispatcher),
            other => Err(RunModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunMode`] string.
#[derive(Debug, Clone)]
pub struct RunModeParseError(pub String);

impl fmt::Display for RunModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run mode: {:?}", self.0)
    }
}

impl std::error::Error for RunModeParseError {}

// ---------------------------------------------------------------------------

/// Cache (Redis) endpoint configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub url: String,
    /// Per-operation deadline.
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            op_timeout: Duration::from_secs(1),
        }
    }
}

/// Event log (Kafka) endpoint configuration.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub brokers: String,
    /// Per-publish deadline.
    pub publish_timeout: Duration,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_owned(),
            publish_timeout: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------

/// Full controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub run_mode: RunMode,
    pub bind_host: String,
    pub bind_port: u16,

    pub cache: CacheConfig,
    pub events: EventConfig,

    /// Skald monitor cycle period.
    pub skald_sync_interval: Duration,
    /// Task monitor cycle period.
    pub task_sync_interval: Duration,
    /// Dispatcher tick period.
    pub dispatch_interval: Duration,
    /// SSE keep-alive comment period.
    pub sse_keepalive_interval: Duration,

    /// A skald whose last-active is older than this is OFFLINE.
    pub skald_stale_threshold: Duration,
    /// A skald absent from the registry for longer than this is evicted.
    pub skald_evict_threshold: Duration,
    /// Consecutive identical heartbeat samples that force OFFLINE (skalds)
    /// or FAILED (tasks).
    pub stuck_window: usize,
    /// How long a task may sit in `Assigning` without a heartbeat before
    /// it is demoted back to `Created`.
    pub assignment_timeout: Duration,
    /// Minimum spacing of repeated orphan-cancel events per (skald, task).
    pub orphan_cancel_interval: Duration,

    pub dispatch_policy: DispatchPolicy,

    /// Upper bound for the `pageSize` query parameter.
    pub page_size_max: i64,
    /// SSE buffered-event high-water mark; a slower consumer is dropped.
    pub sse_backpressure_high: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Controller,
            bind_host: "0.0.0.0".to_owned(),
            bind_port: 8000,
            cache: CacheConfig::default(),
            events: EventConfig::default(),
            skald_sync_interval: Duration::from_secs(4),
            task_sync_interval: Duration::from_secs(3),
            dispatch_interval: Duration::from_secs(5),
            sse_keepalive_interval: Duration::from_secs(15),
            skald_stale_threshold: Duration::from_secs(15),
            skald_evict_threshold: Duration::from_secs(30),
            stuck_window: 5,
            assignment_timeout: Duration::from_secs(30),
            orphan_cancel_interval: Duration::from_secs(3),
            dispatch_policy: DispatchPolicy::LeastTasks,
            page_size_max: 100,
            sse_backpressure_high: 256,
        }
    }
}

impl ControllerConfig {
    /// Build a config from `SKALDS_*` environment variables, falling back to
    /// defaults for anything unset. Malformed values are errors, not silent
    /// fallbacks.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(mode) = read_env("SKALDS_RUN_MODE")? {
            cfg.run_mode = mode
                .parse()
                .with_context(|| format!("SKALDS_RUN_MODE={mode}"))?;
        }
        if let Some(host) = read_env("SKALDS_BIND_HOST")? {
            cfg.bind_host = host;
        }
        if let Some(port) = read_env("SKALDS_BIND_PORT")? {
            cfg.bind_port = port
                .parse()
                .with_context(|| format!("SKALDS_BIND_PORT={port}"))?;
        }

        if let Some(url) = read_env("SKALDS_REDIS_URL")? {
            cfg.cache.url = url;
        }
        if let Some(brokers) = read_env("SKALDS_KAFKA_BROKERS")? {
            cfg.events.brokers = brokers;
        }

        cfg.skald_sync_interval =
            duration_env("SKALDS_SKALD_SYNC_INTERVAL_MS", cfg.skald_sync_interval)?;
        cfg.task_sync_interval =
            duration_env("SKALDS_TASK_SYNC_INTERVAL_MS", cfg.task_sync_interval)?;
        cfg.dispatch_interval =
            duration_env("SKALDS_DISPATCH_INTERVAL_MS", cfg.dispatch_interval)?;
        cfg.sse_keepalive_interval =
            duration_env("SKALDS_SSE_KEEPALIVE_INTERVAL_MS", cfg.sse_keepalive_interval)?;
        cfg.skald_stale_threshold =
            duration_env("SKALDS_SKALD_STALE_THRESHOLD_MS", cfg.skald_stale_threshold)?;
        cfg.skald_evict_threshold =
            duration_env("SKALDS_SKALD_EVICT_THRESHOLD_MS", cfg.skald_evict_threshold)?;
        cfg.assignment_timeout =
            duration_env("SKALDS_ASSIGNMENT_TIMEOUT_MS", cfg.assignment_timeout)?;
        cfg.orphan_cancel_interval =
            duration_env("SKALDS_ORPHAN_CANCEL_INTERVAL_MS", cfg.orphan_cancel_interval)?;

        if let Some(window) = read_env("SKALDS_STUCK_WINDOW")? {
            let parsed: usize = window
                .parse()
                .with_context(|| format!("SKALDS_STUCK_WINDOW={window}"))?;
            anyhow::ensure!(parsed >= 2, "SKALDS_STUCK_WINDOW must be at least 2");
            cfg.stuck_window = parsed;
        }
        if let Some(policy) = read_env("SKALDS_DISPATCH_POLICY")? {
            cfg.dispatch_policy = policy
                .parse()
                .with_context(|| format!("SKALDS_DISPATCH_POLICY={policy}"))?;
        }
        if let Some(max) = read_env("SKALDS_PAGE_SIZE_MAX")? {
            let parsed: i64 = max
                .parse()
                .with_context(|| format!("SKALDS_PAGE_SIZE_MAX={max}"))?;
            anyhow::ensure!(parsed > 0, "SKALDS_PAGE_SIZE_MAX must be positive");
            cfg.page_size_max = parsed;
        }
        if let Some(high) = read_env("SKALDS_SSE_BACKPRESSURE_HIGH")? {
            let parsed: usize = high
                .parse()
                .with_context(|| format!("SKALDS_SSE_BACKPRESSURE_HIGH={high}"))?;
            anyhow::ensure!(parsed > 0, "SKALDS_SSE_BACKPRESSURE_HIGH must be positive");
            cfg.sse_backpressure_high = parsed;
        }

        Ok(cfg)
    }
}

/// Read an env var, treating empty as unset.
fn read_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(name.to_owned())),
    }
}

/// Read a positive millisecond duration from an env var.
fn duration_env(name: &str, default: Duration) -> Result<Duration> {
    match read_env(name)? {
        None => Ok(default),
        Some(v) => {
            let ms: u64 = v.parse().with_context(|| format!("{name}={v}"))?;
            anyhow::ensure!(ms > 0, "{name} must be a positive duration");
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_roundtrip() {
        for mode in [RunMode::Controller, RunMode::Monitor, RunMode::Dispatcher] {
            let parsed: RunMode = mode.to_string().parse().expect("should parse");
            assert_eq!(parsed, mode);
        }
    }

    #[test]
    fn run_mode_parse_is_case_insensitive() {
        assert_eq!("DISPATCHER".parse::<RunMode>().ok(), Some(RunMode::Dispatcher));
        assert!("scheduler".parse::<RunMode>().is_err());
    }

    #[test]
    fn modes_compose_additively() {
        assert!(!RunMode::Controller.monitors_enabled());
        assert!(!RunMode::Controller.dispatcher_enabled());
        assert!(RunMode::Monitor.monitors_enabled());
        assert!(!RunMode::Monitor.dispatcher_enabled());
        assert!(RunMode::Dispatcher.monitors_enabled());
        assert!(RunMode::Dispatcher.dispatcher_enabled());
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.task_sync_interval, Duration::from_secs(3));
        assert_eq!(cfg.dispatch_interval, Duration::from_secs(5));
        assert_eq!(cfg.stuck_window, 5);
        assert_eq!(cfg.assignment_timeout, Duration::from_secs(30));
        assert_eq!(cfg.page_size_max, 100);
        assert!(cfg.skald_evict_threshold >= cfg.skald_stale_threshold * 2);
    }
}
