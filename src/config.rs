//! Configuration for runloops and outbound connection retries.
//!
//! Everything here is plain data: it can be built in code through the builders or
//! deserialized with serde from whatever configuration source the host uses.
//!
//! ```rust
//! use ferry::config::{BackendKind, RetryPolicy, RunloopConfig};
//!
//! let config = RunloopConfig::builder()
//!     .name("io-0")
//!     .backend("mio".parse::<BackendKind>().unwrap())
//!     .events_capacity(256)
//!     .build();
//! assert_eq!(config.backend, BackendKind::Mio);
//!
//! let retry: RetryPolicy =
//!     serde_json::from_str(r#"{"enable":true,"max_retries":3,"interval_ms":10}"#).unwrap();
//! assert_eq!(retry, RetryPolicy::new(3, 10));
//! ```

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// The mechanism a runloop uses to wait for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OS readiness polling through `mio`; required by socket transports.
    #[default]
    Mio,
    /// Condvar parking; tasks, timers, signals and in-process transports only.
    Park,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Mio => "mio",
            BackendKind::Park => "park",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mio" => Ok(BackendKind::Mio),
            "park" => Ok(BackendKind::Park),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

/// Configuration for a single runloop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunloopConfig {
    /// Name used for the runloop thread and in log records
    pub name: String,
    /// Backend selection
    pub backend: BackendKind,
    /// Maximum readiness events collected per poll (mio backend only)
    pub events_capacity: usize,
}

impl RunloopConfig {
    pub fn builder() -> RunloopConfigBuilder {
        RunloopConfigBuilder::new()
    }
}

impl Default for RunloopConfig {
    fn default() -> Self {
        Self {
            name: "runloop".to_string(),
            backend: BackendKind::default(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

/// Builder for [`RunloopConfig`]; unset fields fall back to the defaults.
#[derive(Debug, Default)]
pub struct RunloopConfigBuilder {
    name: Option<String>,
    backend: Option<BackendKind>,
    events_capacity: Option<usize>,
}

impl RunloopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> RunloopConfig {
        let default = RunloopConfig::default();
        RunloopConfig {
            name: self.name.unwrap_or(default.name),
            backend: self.backend.unwrap_or(default.backend),
            events_capacity: self
                .events_capacity
                .filter(|capacity| *capacity > 0)
                .unwrap_or(default.events_capacity),
        }
    }
}

/// Bounded, timer-driven reattempts for outbound connects. Disabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetryPolicy {
    pub enable: bool,
    pub max_retries: u32,
    pub interval_ms: u32,
}

impl RetryPolicy {
    /// An enabled policy.
    pub fn new(max_retries: u32, interval_ms: u32) -> Self {
        Self {
            enable: true,
            max_retries,
            interval_ms,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.interval_ms))
    }

    /// Number of reattempts allowed after the first failure.
    pub fn budget(&self) -> u32 {
        if self.enable {
            self.max_retries
        } else {
            0
        }
    }
}
