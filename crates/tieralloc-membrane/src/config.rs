//! Runtime configuration.
//!
//! Configuration is read from the process environment once and cached for the
//! process lifetime:
//! - `TA_INTERPOSE=1`: route the interposed `malloc` family through tieralloc.
//! - `TA_DISABLE=1`: escape hatch, interposition stays passthrough.
//! - `TA_DEFAULT_HINT`: initial global default hint (`warm` when unset).
//! - `TA_MIN_ROUTE`: smallest interposed request routed to a tier (default 64k).
//! - `TA_DISABLE_POLICY`: `reject` (default) or `drain`.
//! - `TA_CAP_{FAST,NORMAL,SLOW}`: tier capacity in bytes (`k/m/g` suffixes,
//!   `0` or `unbounded` for no cap).
//! - `TA_BW_{FAST,NORMAL,SLOW}`: tier bandwidth in bytes per second.
//! - `TA_LAT_{FAST,NORMAL,SLOW}`: tier base latency in nanoseconds.
//! - `TA_PIN_FAST=0`: skip `mlock` for the pinned tier.
//! - `TA_LOG_LEVEL`: minimum lifecycle log level (`info` by default).
//!
//! Malformed values never abort startup. The offending key keeps its default
//! and a [`ConfigError`] is recorded in [`RuntimeConfig::issues`] so the
//! allocator can report it loudly at init.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Number of tiers the substrate knows about (FAST, NORMAL, SLOW).
pub const TIER_COUNT: usize = 3;

/// Environment suffix per tier slot, indexed like the C `ta_tier_t` values.
pub const TIER_ENV_SUFFIX: [&str; TIER_COUNT] = ["FAST", "NORMAL", "SLOW"];

/// Smallest interposed request routed to a tier by default.
pub const DEFAULT_MIN_ROUTE: usize = 64 * 1024;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Lifecycle log severity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// What `disable` does with allocations that are still live.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisablePolicy {
    /// Refuse to disable while any allocation is live.
    #[default]
    Reject,
    /// Detach every live allocation from its tier and hand it to the native heap.
    Drain,
}

impl DisablePolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" | "strict" => Some(Self::Reject),
            "drain" | "migrate" => Some(Self::Drain),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Drain => "drain",
        }
    }
}

/// Per-tier knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierConfig {
    /// Capacity in bytes, `None` for unbounded.
    pub capacity_bytes: Option<u64>,
    /// Modelled bandwidth in bytes per second.
    pub bandwidth_bps: f64,
    /// Fixed latency charged per transfer.
    pub base_latency_ns: u64,
}

/// Default tier table: FAST is a bounded pinned pool, NORMAL and SLOW are unbounded.
pub const DEFAULT_TIERS: [TierConfig; TIER_COUNT] = [
    TierConfig {
        capacity_bytes: Some(256 * 1024 * 1024),
        bandwidth_bps: 50.0 * GIB,
        base_latency_ns: 2_000,
    },
    TierConfig {
        capacity_bytes: None,
        bandwidth_bps: 20.0 * GIB,
        base_latency_ns: 8_000,
    },
    TierConfig {
        capacity_bytes: None,
        bandwidth_bps: 5.0 * GIB,
        base_latency_ns: 40_000,
    },
];

/// A configuration value that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: expected a byte size, got `{value}`")]
    InvalidSize { key: String, value: String },
    #[error("{key}: expected a number, got `{value}`")]
    InvalidNumber { key: String, value: String },
    #[error("{key}: unrecognized value `{value}`")]
    InvalidChoice { key: String, value: String },
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub interpose: bool,
    pub disabled: bool,
    /// Raw default hint; validated by the allocator when it is built.
    pub default_hint: Option<String>,
    pub min_route: usize,
    pub disable_policy: DisablePolicy,
    pub tiers: [TierConfig; TIER_COUNT],
    pub pin_fast: bool,
    pub log_level: LogLevel,
    /// Values that were rejected while parsing.
    pub issues: Vec<ConfigError>,
}

impl RuntimeConfig {
    /// Built-in defaults, usable in `const` context.
    #[must_use]
    pub const fn bootstrap() -> Self {
        Self {
            interpose: false,
            disabled: false,
            default_hint: None,
            min_route: DEFAULT_MIN_ROUTE,
            disable_policy: DisablePolicy::Reject,
            tiers: DEFAULT_TIERS,
            pin_fast: true,
            log_level: LogLevel::Info,
            issues: Vec::new(),
        }
    }

    /// Resolve configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::bootstrap();

        if let Some(v) = lookup("TA_INTERPOSE") {
            cfg.interpose = parse_flag(&mut cfg.issues, "TA_INTERPOSE", &v, cfg.interpose);
        }
        if let Some(v) = lookup("TA_DISABLE") {
            cfg.disabled = parse_flag(&mut cfg.issues, "TA_DISABLE", &v, cfg.disabled);
        }
        if let Some(v) = lookup("TA_PIN_FAST") {
            cfg.pin_fast = parse_flag(&mut cfg.issues, "TA_PIN_FAST", &v, cfg.pin_fast);
        }
        if let Some(v) = lookup("TA_DEFAULT_HINT") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                cfg.default_hint = Some(trimmed.to_ascii_lowercase());
            }
        }
        if let Some(v) = lookup("TA_MIN_ROUTE") {
            match parse_byte_size(&v).and_then(|n| usize::try_from(n).ok()) {
                Some(n) => cfg.min_route = n,
                None => cfg.issues.push(ConfigError::InvalidSize {
                    key: "TA_MIN_ROUTE".to_string(),
                    value: v,
                }),
            }
        }
        if let Some(v) = lookup("TA_DISABLE_POLICY") {
            match DisablePolicy::from_str_loose(&v) {
                Some(p) => cfg.disable_policy = p,
                None => cfg.issues.push(ConfigError::InvalidChoice {
                    key: "TA_DISABLE_POLICY".to_string(),
                    value: v,
                }),
            }
        }
        if let Some(v) = lookup("TA_LOG_LEVEL") {
            match LogLevel::from_str_loose(&v) {
                Some(level) => cfg.log_level = level,
                None => cfg.issues.push(ConfigError::InvalidChoice {
                    key: "TA_LOG_LEVEL".to_string(),
                    value: v,
                }),
            }
        }

        for (idx, suffix) in TIER_ENV_SUFFIX.iter().enumerate() {
            let key = format!("TA_CAP_{suffix}");
            if let Some(v) = lookup(&key) {
                match parse_capacity(&v) {
                    Some(cap) => cfg.tiers[idx].capacity_bytes = cap,
                    None => cfg.issues.push(ConfigError::InvalidSize { key, value: v }),
                }
            }

            let key = format!("TA_BW_{suffix}");
            if let Some(v) = lookup(&key) {
                match parse_byte_size(&v) {
                    Some(bw) if bw > 0 => cfg.tiers[idx].bandwidth_bps = bw as f64,
                    _ => cfg.issues.push(ConfigError::InvalidNumber { key, value: v }),
                }
            }

            let key = format!("TA_LAT_{suffix}");
            if let Some(v) = lookup(&key) {
                match v.trim().parse::<u64>() {
                    Ok(ns) => cfg.tiers[idx].base_latency_ns = ns,
                    Err(_) => cfg.issues.push(ConfigError::InvalidNumber { key, value: v }),
                }
            }
        }

        cfg
    }

    /// Resolve configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Whether interposed calls should be routed to tieralloc at all.
    #[must_use]
    pub const fn interposition_active(&self) -> bool {
        self.interpose && !self.disabled
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::bootstrap()
    }
}

fn parse_flag(issues: &mut Vec<ConfigError>, key: &str, raw: &str, current: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            issues.push(ConfigError::InvalidChoice {
                key: key.to_string(),
                value: raw.to_string(),
            });
            current
        }
    }
}

/// Parse a byte count with an optional binary suffix (`k`, `m`, `g`, `t`).
#[must_use]
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix("ib").or_else(|| s.strip_suffix('b')).unwrap_or(&s);
    let (digits, shift) = match s.chars().last()? {
        'k' => (&s[..s.len() - 1], 10),
        'm' => (&s[..s.len() - 1], 20),
        'g' => (&s[..s.len() - 1], 30),
        't' => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let base: u64 = digits.trim().parse().ok()?;
    base.checked_mul(1u64 << shift)
}

/// Parse a capacity: `None` inside the result means unbounded.
#[must_use]
pub fn parse_capacity(raw: &str) -> Option<Option<u64>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "unbounded" | "none" | "inf" | "0" => Some(None),
        other => parse_byte_size(other).map(Some),
    }
}

// Atomic cache: 0=unresolved, 1=resolving, 2=ready.
// Same non-blocking scheme as a OnceLock-free lazy init: a reentrant call
// (e.g. an interposed malloc issued by std::env::var) observes RESOLVING and
// gets the bootstrap defaults instead of parking on a futex.
const CONFIG_UNRESOLVED: u8 = 0;
const CONFIG_RESOLVING: u8 = 1;
const CONFIG_READY: u8 = 2;

static CONFIG_STATE: AtomicU8 = AtomicU8::new(CONFIG_UNRESOLVED);
static CONFIG_PTR: AtomicPtr<RuntimeConfig> = AtomicPtr::new(std::ptr::null_mut());
static BOOTSTRAP_CONFIG: RuntimeConfig = RuntimeConfig::bootstrap();

/// Get the process configuration (reads the environment on first call).
///
/// Returns the bootstrap defaults while another call is still resolving.
#[must_use]
pub fn runtime_config() -> &'static RuntimeConfig {
    let state = CONFIG_STATE.load(Ordering::Acquire);
    if state == CONFIG_READY {
        return ready_config();
    }
    if state == CONFIG_RESOLVING {
        return &BOOTSTRAP_CONFIG;
    }

    if CONFIG_STATE
        .compare_exchange(
            CONFIG_UNRESOLVED,
            CONFIG_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return if CONFIG_STATE.load(Ordering::Acquire) == CONFIG_READY {
            ready_config()
        } else {
            &BOOTSTRAP_CONFIG
        };
    }

    // Leaked on purpose: the config lives for the whole process.
    let ptr = Box::into_raw(Box::new(RuntimeConfig::from_env()));
    CONFIG_PTR.store(ptr, Ordering::Release);
    CONFIG_STATE.store(CONFIG_READY, Ordering::Release);
    ready_config()
}

#[allow(unsafe_code)]
fn ready_config() -> &'static RuntimeConfig {
    let ptr = CONFIG_PTR.load(Ordering::Acquire);
    if ptr.is_null() {
        return &BOOTSTRAP_CONFIG;
    }
    // SAFETY: once READY, CONFIG_PTR points to a leaked Box that is never freed
    // or replaced.
    unsafe { &*ptr }
}
