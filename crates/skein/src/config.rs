//! Runtime configuration

use crate::{Error, Result};
use std::time::Duration;

/// Smallest native stack accepted for a stackful execution context
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default native stack size of a stackful execution context
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Options for [`Runtime::init_with`](crate::Runtime::init_with)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Native stack size of each stackful execution context
    pub stack_size: usize,

    /// Released execution contexts kept around for reuse by later spawns
    pub context_cache: usize,

    /// Sleep applied by an idle scheduler once spinning is exhausted
    pub idle_sleep: Duration,

    /// Dispatches between two event-hook checks in the built-in schedulers
    pub event_freq: u32,

    /// Prefix for the names of native threads created by the runtime
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            context_cache: 64,
            idle_sleep: Duration::from_micros(100),
            event_freq: 50,
            thread_name_prefix: "skein".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `SKEIN_*` environment variables
    ///
    /// Recognized: `SKEIN_STACK_SIZE` (bytes), `SKEIN_CONTEXT_CACHE`,
    /// `SKEIN_IDLE_SLEEP_US`, `SKEIN_EVENT_FREQ`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("SKEIN_STACK_SIZE") {
            config.stack_size = parse_var("SKEIN_STACK_SIZE", &value)?;
        }
        if let Some(value) = lookup("SKEIN_CONTEXT_CACHE") {
            config.context_cache = parse_var("SKEIN_CONTEXT_CACHE", &value)?;
        }
        if let Some(value) = lookup("SKEIN_IDLE_SLEEP_US") {
            config.idle_sleep = Duration::from_micros(parse_var("SKEIN_IDLE_SLEEP_US", &value)?);
        }
        if let Some(value) = lookup("SKEIN_EVENT_FREQ") {
            config.event_freq = parse_var("SKEIN_EVENT_FREQ", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every field is usable
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "stack size {} is below the minimum of {} bytes",
                self.stack_size, MIN_STACK_SIZE
            )));
        }
        if self.event_freq == 0 {
            return Err(Error::InvalidArgument("event_freq must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("{}={:?} is not a valid number", name, value)))
}
