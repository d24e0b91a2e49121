//! Environment settings and targets files.

use std::path::{Path, PathBuf};

use conveyor_core::{IntervalError, IntervalSpec};
use conveyor_runtime::{ComposerConfig, FailurePolicy, QueueCapacity};
use serde::{Deserialize, Serialize};

use crate::stages::ScheduledTask;

/// Environment variable holding the intermediate and input queue capacity
pub const ENV_QUEUE_CAPACITY: &str = "CONVEYOR_QUEUE_CAPACITY";
/// Environment variable holding the processor count
pub const ENV_PROCESSORS: &str = "CONVEYOR_PROCESSORS";
/// Environment variable holding the output handler count
pub const ENV_HANDLERS: &str = "CONVEYOR_HANDLERS";
/// Environment variable holding the runner failure policy
pub const ENV_FAILURE_POLICY: &str = "CONVEYOR_FAILURE_POLICY";
/// Environment variable naming a targets file when none is given on the
/// command line
pub const ENV_TARGETS_FILE: &str = "CONVEYOR_TARGETS_FILE";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or empty
    #[error("{name} env variable is required")]
    MissingVariable {
        /// Variable name
        name: String,
    },

    /// A variable is set to something unusable
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidVariable {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// The targets file could not be read
    #[error("Cannot read targets file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A `.json` targets file does not describe a [`TargetsFile`]
    #[error("Cannot parse targets file {path}: {source}")]
    ParseJson {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// A YAML targets file does not describe a [`TargetsFile`]
    #[error("Cannot parse targets file {path}: {source}")]
    ParseYaml {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },

    /// The targets file lists no sites
    #[error("Targets file lists no sites")]
    NoTargets,

    /// One target is unusable
    #[error("Target #{index}: {reason}")]
    InvalidTarget {
        /// Position in the `sites` list
        index: usize,
        /// Why it was rejected
        reason: String,
    },
}

/// Read `name` through `lookup`
///
/// With no default the variable is required: unset and empty values are both
/// reported as [`ConfigError::MissingVariable`].
///
/// # Errors
///
/// Returns [`ConfigError::MissingVariable`] for a missing required variable
pub fn getenv<L>(lookup: &L, name: &str, default: Option<&str>) -> Result<String, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    match (lookup(name), default) {
        (Some(value), None) if value.is_empty() => Err(ConfigError::MissingVariable {
            name: name.to_string(),
        }),
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default.to_string()),
        (None, None) => Err(ConfigError::MissingVariable {
            name: name.to_string(),
        }),
    }
}

/// Runtime settings read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Capacity for the input and intermediate queues
    pub queue_capacity: QueueCapacity,
    /// Number of processor runners
    pub processors: usize,
    /// Number of output handler runners
    pub handlers: usize,
    /// Failure policy for every runner
    pub failure_policy: FailurePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_capacity: QueueCapacity::Unbounded,
            processors: 1,
            handlers: 1,
            failure_policy: FailurePolicy::Isolate,
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary lookup
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let capacity = getenv(&lookup, ENV_QUEUE_CAPACITY, Some("unbounded"))?;
        let queue_capacity = parse_capacity(&capacity).ok_or_else(|| ConfigError::InvalidVariable {
            name: ENV_QUEUE_CAPACITY.to_string(),
            value: capacity.clone(),
            reason: "expected 'unbounded' or a positive integer".to_string(),
        })?;

        let processors = parse_count(&lookup, ENV_PROCESSORS)?;
        let handlers = parse_count(&lookup, ENV_HANDLERS)?;

        let policy = getenv(&lookup, ENV_FAILURE_POLICY, Some("isolate"))?;
        let failure_policy = policy.parse().map_err(|err: conveyor_core::CoreError| ConfigError::InvalidVariable {
            name: ENV_FAILURE_POLICY.to_string(),
            value: policy.clone(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            queue_capacity,
            processors,
            handlers,
            failure_policy,
        })
    }

    /// Composer configuration derived from these settings
    #[must_use]
    pub fn composer_config(&self) -> ComposerConfig {
        ComposerConfig::default()
            .with_queue_capacity(self.queue_capacity)
            .with_failure_policy(self.failure_policy)
    }
}

fn parse_capacity(raw: &str) -> Option<QueueCapacity> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("unbounded") {
        return Some(QueueCapacity::Unbounded);
    }
    match raw.parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(limit) => Some(QueueCapacity::bounded(limit)),
    }
}

fn parse_count<L>(lookup: &L, name: &str) -> Result<usize, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    let raw = getenv(lookup, name, Some("1"))?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidVariable {
            name: name.to_string(),
            value: raw,
            reason: "expected a positive integer".to_string(),
        }),
    }
}

fn default_interval() -> IntervalSpec {
    IntervalSpec::every_seconds(60)
}

/// One scheduled payload
///
/// Deserializes from either an explicit `payload` or bare fields, which are
/// gathered into an object payload:
///
/// ```yaml
/// - payload: nightly report
///   interval: {days: 1}
/// - url: https://example.com
///   pattern: Example
///   request_kwargs: {timeout: 5}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTarget")]
pub struct Target {
    /// Arbitrary JSON handed to the processors
    pub payload: serde_json::Value,
    /// Regex searched for in the payload text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Repeat interval
    #[serde(default = "default_interval")]
    pub interval: IntervalSpec,
}

#[derive(Deserialize)]
struct RawTarget {
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default = "default_interval")]
    interval: IntervalSpec,
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<RawTarget> for Target {
    type Error = String;

    fn try_from(raw: RawTarget) -> Result<Self, Self::Error> {
        let payload = match (raw.payload, raw.fields.is_empty()) {
            (Some(payload), true) => payload,
            (Some(_), false) => {
                let keys: Vec<_> = raw.fields.keys().map(String::as_str).collect();
                return Err(format!("unexpected fields beside payload: {}", keys.join(", ")));
            }
            (None, false) => serde_json::Value::Object(raw.fields),
            (None, true) => return Err("target needs a payload or fields such as url".to_string()),
        };
        Ok(Self::new(payload, raw.pattern, raw.interval))
    }
}

impl Target {
    /// Target repeating every `interval`
    #[must_use]
    pub fn new(payload: serde_json::Value, pattern: Option<String>, interval: IntervalSpec) -> Self {
        Self {
            payload,
            pattern,
            interval,
        }
    }

    /// Task enqueued on every fire
    #[must_use]
    pub fn task(&self) -> ScheduledTask {
        ScheduledTask {
            payload: self.payload.clone(),
            pattern: self.pattern.clone(),
        }
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTarget { index, reason };

        self.interval
            .validate()
            .map_err(|err: IntervalError| invalid(err.to_string()))?;
        if self.payload.is_null() {
            return Err(invalid("payload is null".to_string()));
        }
        if let Some(pattern) = &self.pattern {
            regex::Regex::new(pattern).map_err(|err| invalid(format!("bad pattern: {}", err)))?;
        }
        Ok(())
    }
}

/// Targets file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsFile {
    /// Scheduled payloads
    pub sites: Vec<Target>,
}

impl TargetsFile {
    /// Read and validate a targets file
    ///
    /// Files ending in `.json` are read as JSON, anything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, malformed, or has
    /// an invalid target
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let file: Self = if is_json {
            serde_json::from_str(&raw).map_err(|source| ConfigError::ParseJson {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source,
            })?
        };
        file.validate()?;
        Ok(file)
    }

    /// Check every target
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sites.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        for (index, target) in self.sites.iter().enumerate() {
            target.validate(index)?;
        }
        Ok(())
    }
}
