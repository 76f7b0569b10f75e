//! Context configuration.

use aggrepo_core::{Error, Result};
use std::time::Duration;

/// Idle time after which a NEW or UNLOADED aggregate is evicted.
pub const DEFAULT_NEW_AGE: Duration = Duration::from_secs(3600);
/// Idle time after which a LOADED aggregate is unloaded.
pub const DEFAULT_LOADED_AGE: Duration = Duration::from_secs(600);
/// Idle time after which a DIRTY aggregate is committed or cancelled.
pub const DEFAULT_DIRTY_AGE: Duration = Duration::from_secs(600);
/// Default pause between reconciliation sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(180);
/// Sweep intervals read from the environment must exceed this.
pub const MIN_GC_INTERVAL: Duration = Duration::from_secs(60);
/// Idle time after which a thread's memoized query results are dropped.
pub const DEFAULT_THREAD_SESSION_LIFETIME: Duration = Duration::from_secs(18);
/// Upper bound on rows fetched by `find_all`.
pub const DEFAULT_SELECT_ALL_LIMIT: u64 = 100;
/// Page size used to turn `/proc/self/statm` page counts into bytes.
pub const DEFAULT_MEMORY_PAGE_SIZE: u64 = 4096;

/// Configuration for a persistence context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Name used in log events
    pub namespace: String,
    pub new_age: Duration,
    pub loaded_age: Duration,
    pub dirty_age: Duration,
    pub gc_interval: Duration,
    /// Resident-memory threshold in bytes gating the container sweep.
    /// `None` sweeps containers unconditionally.
    pub memory_threshold: Option<u64>,
    /// Kernel page size in bytes. Set it to 16384 or 65536 on kernels with
    /// larger pages, or resident memory reads low.
    pub memory_page_size: u64,
    pub thread_session_lifetime: Duration,
    pub select_all_limit: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            new_age: DEFAULT_NEW_AGE,
            loaded_age: DEFAULT_LOADED_AGE,
            dirty_age: DEFAULT_DIRTY_AGE,
            gc_interval: DEFAULT_GC_INTERVAL,
            memory_threshold: None,
            memory_page_size: DEFAULT_MEMORY_PAGE_SIZE,
            thread_session_lifetime: DEFAULT_THREAD_SESSION_LIFETIME,
            select_all_limit: DEFAULT_SELECT_ALL_LIMIT,
        }
    }
}

/// The ages a sweep applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPolicy {
    pub new_age: Duration,
    pub loaded_age: Duration,
    pub dirty_age: Duration,
    pub thread_session_lifetime: Duration,
}

impl Default for GcPolicy {
    fn default() -> Self {
        ContextConfig::default().gc_policy()
    }
}

impl ContextConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn namespace(mut self, name: impl Into<String>) -> Self {
        self.namespace = name.into();
        self
    }

    #[must_use]
    pub fn new_age(mut self, age: Duration) -> Self {
        self.new_age = age;
        self
    }

    #[must_use]
    pub fn loaded_age(mut self, age: Duration) -> Self {
        self.loaded_age = age;
        self
    }

    #[must_use]
    pub fn dirty_age(mut self, age: Duration) -> Self {
        self.dirty_age = age;
        self
    }

    #[must_use]
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    #[must_use]
    pub fn memory_threshold(mut self, bytes: Option<u64>) -> Self {
        self.memory_threshold = bytes;
        self
    }

    #[must_use]
    pub fn memory_page_size(mut self, bytes: u64) -> Self {
        self.memory_page_size = bytes;
        self
    }

    #[must_use]
    pub fn thread_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.thread_session_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn select_all_limit(mut self, limit: u64) -> Self {
        self.select_all_limit = limit;
        self
    }

    pub fn gc_policy(&self) -> GcPolicy {
        GcPolicy {
            new_age: self.new_age,
            loaded_age: self.loaded_age,
            dirty_age: self.dirty_age,
            thread_session_lifetime: self.thread_session_lifetime,
        }
    }

    /// Reject values no context can run with.
    pub fn validate(&self) -> Result<()> {
        let ages = [
            ("new_age", self.new_age),
            ("loaded_age", self.loaded_age),
            ("dirty_age", self.dirty_age),
            ("gc_interval", self.gc_interval),
            ("thread_session_lifetime", self.thread_session_lifetime),
        ];
        if let Some((name, _)) = ages.iter().find(|(_, age)| age.is_zero()) {
            return Err(Error::config(format!("{} must be greater than zero", name)));
        }
        if self.select_all_limit == 0 {
            return Err(Error::config("select_all_limit must be greater than zero"));
        }
        if self.memory_page_size == 0 {
            return Err(Error::config("memory_page_size must be greater than zero"));
        }
        Ok(())
    }

    /// Defaults overridden by `AGGREPO_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `AGGREPO_NAMESPACE` | namespace |
    /// | `AGGREPO_NEW_AGE` | seconds |
    /// | `AGGREPO_LOADED_AGE` | seconds |
    /// | `AGGREPO_DIRTY_AGE` | seconds |
    /// | `AGGREPO_GC_INTERVAL` | seconds, must exceed 60 |
    /// | `AGGREPO_MEMORY_THRESHOLD` | bytes |
    /// | `AGGREPO_MEMORY_PAGE_SIZE` | bytes per statm page |
    /// | `AGGREPO_SESSION_LIFETIME` | seconds |
    /// | `AGGREPO_SELECT_ALL_LIMIT` | rows |
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ContextConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(namespace) = lookup("AGGREPO_NAMESPACE").filter(|s| !s.trim().is_empty()) {
            config.namespace = namespace.trim().to_string();
        }
        if let Some(age) = positive_seconds(&lookup, "AGGREPO_NEW_AGE") {
            config.new_age = age;
        }
        if let Some(age) = positive_seconds(&lookup, "AGGREPO_LOADED_AGE") {
            config.loaded_age = age;
        }
        if let Some(age) = positive_seconds(&lookup, "AGGREPO_DIRTY_AGE") {
            config.dirty_age = age;
        }
        if let Some(interval) = positive_seconds(&lookup, "AGGREPO_GC_INTERVAL") {
            if interval > MIN_GC_INTERVAL {
                config.gc_interval = interval;
            } else {
                tracing::warn!(
                    requested_secs = interval.as_secs(),
                    minimum_secs = MIN_GC_INTERVAL.as_secs(),
                    "gc interval too short, using default"
                );
            }
        }
        if let Some(bytes) = positive_number(&lookup, "AGGREPO_MEMORY_THRESHOLD") {
            config.memory_threshold = Some(bytes);
        }
        if let Some(bytes) = positive_number(&lookup, "AGGREPO_MEMORY_PAGE_SIZE") {
            config.memory_page_size = bytes;
        }
        if let Some(lifetime) = positive_seconds(&lookup, "AGGREPO_SESSION_LIFETIME") {
            config.thread_session_lifetime = lifetime;
        }
        if let Some(limit) = positive_number(&lookup, "AGGREPO_SELECT_ALL_LIMIT") {
            config.select_all_limit = limit;
        }
        config
    }
}

fn positive_number(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(variable = name, value = %raw, "ignoring invalid setting");
            None
        }
    }
}

fn positive_seconds(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    positive_number(lookup, name).map(Duration::from_secs)
}
