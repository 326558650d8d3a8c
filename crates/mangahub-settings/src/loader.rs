//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MangahubSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `MANGAHUB_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::cell::RefCell;
use std::fmt;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::MangahubSettings;

/// Load settings from `path` with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If the
/// file contains invalid JSON or the result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<MangahubSettings> {
    load_settings_with_report(path).map(|(settings, _)| settings)
}

/// Like [`load_settings_from_path`], also returning the env overrides that
/// were ignored, so callers can report them once logging is up.
pub fn load_settings_with_report(
    path: &Path,
) -> Result<(MangahubSettings, Vec<RejectedOverride>)> {
    let defaults = serde_json::to_value(MangahubSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MangahubSettings = serde_json::from_value(merged)?;
    let rejected = apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok((settings, rejected))
}

/// An environment override that failed to parse or was out of range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedOverride {
    /// Variable name.
    pub key: String,
    /// Raw value as found.
    pub value: String,
    /// Expected type.
    pub kind: &'static str,
}

impl fmt::Display for RejectedOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?} is not a valid {}", self.key, self.value, self.kind)
    }
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `MANGAHUB_*` environment variable overrides. Returns the ones
/// that were ignored.
pub fn apply_env_overrides(settings: &mut MangahubSettings) -> Vec<RejectedOverride> {
    apply_overrides_with(settings, |name| std::env::var(name).ok())
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning and returned.
pub fn apply_overrides_with<F>(settings: &mut MangahubSettings, lookup: F) -> Vec<RejectedOverride>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader {
        lookup,
        rejected: RefCell::new(Vec::new()),
    };

    // ── Bridge ──────────────────────────────────────────────────────
    if let Some(v) = env.usize("MANGAHUB_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.bridge.queue_capacity = v;
    }

    // ── Liveness ────────────────────────────────────────────────────
    if let Some(v) = env.u64("MANGAHUB_HEALTH_CHECK_INTERVAL_MS", 10, 3_600_000) {
        settings.health.check_interval_ms = v;
    }
    if let Some(v) = env.u64("MANGAHUB_HEALTH_TIMEOUT_MS", 10, 3_600_000) {
        settings.health.timeout_ms = v;
    }
    if let Some(v) = env.u64("MANGAHUB_HEARTBEAT_INTERVAL_MS", 10, 3_600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = env.u64("MANGAHUB_HEARTBEAT_TIMEOUT_MS", 10, 3_600_000) {
        settings.heartbeat.timeout_ms = v;
    }

    // ── Circuit breaker ─────────────────────────────────────────────
    if let Some(v) = env
        .u64("MANGAHUB_CIRCUIT_THRESHOLD", 1, 1_000)
        .and_then(|v| u32::try_from(v).ok())
    {
        settings.circuit_breaker.threshold = v;
    }
    if let Some(v) = env.u64("MANGAHUB_CIRCUIT_TIMEOUT_MS", 10, 3_600_000) {
        settings.circuit_breaker.timeout_ms = v;
    }

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = env.string("MANGAHUB_HOST") {
        settings.gateway.host = v;
    }
    if let Some(v) = env.u16("MANGAHUB_TCP_PORT", 1, 65535) {
        settings.gateway.tcp_port = v;
    }
    if let Some(v) = env.u16("MANGAHUB_UDP_PORT", 1, 65535) {
        settings.gateway.udp_port = v;
    }
    if let Some(v) = env.u16("MANGAHUB_NOTIFY_PORT", 1, 65535) {
        settings.gateway.notify_port = v;
    }
    if let Some(v) = env.u16("MANGAHUB_HTTP_PORT", 1, 65535) {
        settings.gateway.http_port = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("MANGAHUB_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("MANGAHUB_LOG_JSON") {
        settings.logging.json = v;
    }

    env.rejected.into_inner()
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
    rejected: RefCell<Vec<RejectedOverride>>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "boolean", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }

    fn parsed<T>(
        &self,
        name: &str,
        kind: &'static str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
            self.rejected.borrow_mut().push(RejectedOverride {
                key: name.to_owned(),
                value: val,
                kind,
            });
        }
        result
    }
}
