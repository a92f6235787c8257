//! Event broadcast for the presentation layer.

use crate::bench::aggregate::PatternResult;
use crate::bench::controller::RunState;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

const MIN_BUFFER: usize = 16;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Stopped,
    Failed { reason: String },
}

/// Everything the engine tells its observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BenchmarkEvent {
    /// A job started or reported a status sample.
    Progress {
        job_index: usize,
        total_jobs: usize,
        label: String,
        #[serde(serialize_with = "secs")]
        elapsed: Duration,
        #[serde(serialize_with = "secs")]
        remaining: Duration,
    },
    /// Waiting between jobs.
    Interval {
        #[serde(serialize_with = "secs")]
        elapsed: Duration,
        #[serde(serialize_with = "secs")]
        total: Duration,
    },
    JobFailed {
        job_index: usize,
        label: String,
        reason: String,
    },
    ResultUpdated {
        result: PatternResult,
    },
    StateChanged {
        state: RunState,
    },
    Finished {
        outcome: RunOutcome,
    },
}

impl BenchmarkEvent {
    /// Envelope `{"event", "data", "timestamp"}` as one JSON line.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        serde_json::to_string(&value)
    }
}

fn secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

/// Broadcast channel for benchmark events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BenchmarkEvent>,
}

impl EventBus {
    /// Create a bus holding up to `buffer` unread events per subscriber.
    ///
    /// Slow subscribers lag and lose the oldest events; the engine never
    /// blocks on them.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(MIN_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BenchmarkEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: BenchmarkEvent) {
        trace!(?event, "Emitting event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
