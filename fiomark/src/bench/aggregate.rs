//! Folding per-job samples into the result matrix.

use crate::bench::parser::{DirectionSample, LatencySummary, Percentile, RawSample};
use crate::bench::profile::TestJob;
use fiomark_common::{BlockSize, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub pattern: Pattern,
    pub block_size: BlockSize,
    pub queue_depth: u32,
    pub threads: u32,
}

impl From<&TestJob> for ResultKey {
    fn from(job: &TestJob) -> Self {
        Self {
            pattern: job.pattern,
            block_size: job.block_size,
            queue_depth: job.queue_depth,
            threads: job.threads,
        }
    }
}

impl fmt::Display for ResultKey {
    /// Compact row name, e.g. `SEQ1M Q8T1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} Q{}T{}",
            self.pattern.access_tag(),
            self.block_size.short(),
            self.queue_depth,
            self.threads
        )
    }
}

/// Averaged figures for one direction. Raw SI units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionResult {
    pub bandwidth_bytes_per_sec: f64,
    pub iops: f64,
    pub latency: LatencySummary,
}

/// Aggregated outcome for one [`ResultKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternResult {
    pub pattern: Pattern,
    pub block_size: BlockSize,
    pub queue_depth: u32,
    pub threads: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<DirectionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write: Option<DirectionResult>,
    /// Jobs folded into this row.
    pub repeats: u32,
}

impl PatternResult {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            pattern: self.pattern,
            block_size: self.block_size,
            queue_depth: self.queue_depth,
            threads: self.threads,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DirectionAccumulator {
    bandwidth_sum: f64,
    iops_sum: f64,
    latency_mean_sum: f64,
    count: u32,
    last_percentiles: Vec<Percentile>,
}

impl DirectionAccumulator {
    fn add(&mut self, sample: &DirectionSample) {
        self.bandwidth_sum += sample.bandwidth_bytes_per_sec;
        self.iops_sum += sample.iops;
        self.latency_mean_sum += sample.latency.mean_ns;
        self.count += 1;
        self.last_percentiles = sample.latency.percentiles.clone();
    }

    fn result(&self) -> Option<DirectionResult> {
        if self.count == 0 {
            return None;
        }
        let n = f64::from(self.count);
        Some(DirectionResult {
            bandwidth_bytes_per_sec: self.bandwidth_sum / n,
            iops: self.iops_sum / n,
            latency: LatencySummary {
                mean_ns: self.latency_mean_sum / n,
                percentiles: self.last_percentiles.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Group {
    read: DirectionAccumulator,
    write: DirectionAccumulator,
    repeats: u32,
}

/// Result matrix for one run.
///
/// A job's data point is its last sample, since fio reports cumulative
/// figures. Repeats of the same key are averaged; percentiles come from the
/// most recently recorded job.
#[derive(Debug, Default)]
pub struct Aggregator {
    groups: BTreeMap<ResultKey, Group>,
    /// Keys in first-recorded order.
    order: Vec<ResultKey>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one finished job. Returns the updated row, or `None` when the
    /// job produced no samples.
    pub fn record(&mut self, job: &TestJob, samples: &[RawSample]) -> Option<PatternResult> {
        let last = samples.last()?;
        let key = ResultKey::from(job);

        if !self.groups.contains_key(&key) {
            self.order.push(key);
        }
        let group = self.groups.entry(key).or_default();
        if job.pattern.reads() {
            group.read.add(&last.read);
        }
        if job.pattern.writes() {
            group.write.add(&last.write);
        }
        group.repeats += 1;

        self.get(&key)
    }

    pub fn get(&self, key: &ResultKey) -> Option<PatternResult> {
        let group = self.groups.get(key)?;
        Some(PatternResult {
            pattern: key.pattern,
            block_size: key.block_size,
            queue_depth: key.queue_depth,
            threads: key.threads,
            read: group.read.result(),
            write: group.write.result(),
            repeats: group.repeats,
        })
    }

    /// Every row, in the order keys were first recorded.
    pub fn snapshot(&self) -> Vec<PatternResult> {
        self.order.iter().filter_map(|key| self.get(key)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.order.clear();
    }
}
