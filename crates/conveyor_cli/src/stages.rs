//! Stages run by the `conveyor` binary.
//!
//! Processors stamp each scheduled payload with processing metadata and an
//! optional pattern match; output handlers write the stamped records as JSON
//! lines.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_runtime::{StageError, WorkStage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Task enqueued by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Arbitrary JSON from the target definition
    pub payload: serde_json::Value,
    /// Regex searched for in the payload text
    pub pattern: Option<String>,
}

/// Processor output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedRecord {
    /// Payload as scheduled
    pub payload: serde_json::Value,
    /// Processor that handled the task
    pub processor: String,
    /// When processing happened
    pub processed_at: DateTime<Utc>,
    /// Pattern that was searched for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Whether the pattern matched; absent without a usable pattern
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
}

/// Processor stamping payloads with metadata
///
/// Each distinct pattern is compiled on first use and cached, invalid ones
/// included.
pub struct StampStage {
    name: String,
    patterns: Mutex<HashMap<String, Result<Regex, regex::Error>>>,
}

impl StampStage {
    /// Create the processor numbered `index`
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            name: format!("stamp-{}", index),
            patterns: Mutex::default(),
        }
    }

    fn compiled(&self, pattern: &str) -> Result<Regex, regex::Error> {
        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        patterns
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern))
            .clone()
    }
}

/// Text a pattern is searched in: strings as-is, anything else as JSON
fn payload_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl WorkStage<ScheduledTask> for StampStage {
    type Output = StampedRecord;

    async fn process(&self, task: ScheduledTask) -> Result<Option<StampedRecord>, StageError> {
        if task.payload.is_null() {
            return Err(StageError::InvalidTask("payload is null".to_string()));
        }

        let matched = task.pattern.as_deref().and_then(|pattern| match self.compiled(pattern) {
            Ok(re) => Some(re.is_match(&payload_text(&task.payload))),
            Err(err) => {
                error!(stage = %self.name, pattern, error = %err, "error matching payload with pattern");
                None
            }
        });

        let record = StampedRecord {
            payload: task.payload,
            processor: self.name.clone(),
            processed_at: Utc::now(),
            pattern: task.pattern,
            matched,
        };
        debug!(stage = %self.name, matched = ?record.matched, "payload stamped");
        Ok(Some(record))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Output handler writing one JSON document per line
///
/// Sinks made with [`JsonLinesSink::named`] share the writer, so lines from
/// competing handlers never interleave.
pub struct JsonLinesSink<W> {
    name: String,
    out: Arc<Mutex<W>>,
}

impl JsonLinesSink<std::io::Stdout> {
    /// Sink writing to standard output
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Sink writing to `out`
    pub fn new(out: W) -> Self {
        Self {
            name: "json-lines".to_string(),
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Copy of this sink named `name`
    #[must_use]
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            out: Arc::clone(&self.out),
        }
    }

    /// Shared handle to the writer
    #[cfg(test)]
    pub fn writer(&self) -> Arc<Mutex<W>> {
        Arc::clone(&self.out)
    }
}

#[async_trait]
impl<W: Write + Send + 'static> WorkStage<StampedRecord> for JsonLinesSink<W> {
    type Output = ();

    async fn process(&self, task: StampedRecord) -> Result<Option<()>, StageError> {
        let mut line = serde_json::to_vec(&task).map_err(|err| StageError::failed(err.to_string()))?;
        line.push(b'\n');

        let mut out = self
            .out
            .lock()
            .map_err(|_| StageError::failed("output writer lock poisoned"))?;
        out.write_all(&line)
            .and_then(|()| out.flush())
            .map_err(|err| StageError::failed(err.to_string()))?;
        Ok(None)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
