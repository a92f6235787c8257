//! Benchmark profiles and their expansion into an ordered job queue.

use fiomark_common::{BlockSize, FillPolicy, GIB, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// File name every test file must carry. Anything else is refused so a
/// mistyped target never overwrites user data.
pub const TEST_FILE_NAME: &str = ".fiomark.tmp";

/// Default share of reads in mix patterns, in percent.
pub const DEFAULT_MIX_READ_PERCENTAGE: u8 = 70;

/// Reasons a profile is rejected before any job runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("no patterns selected")]
    EmptyPatterns,
    #[error("no block sizes selected")]
    EmptyBlockSizes,
    #[error("block size must be greater than zero")]
    ZeroBlockSize,
    #[error("block size {0} listed more than once")]
    DuplicateBlockSize(BlockSize),
    #[error("job duration must be greater than zero")]
    ZeroDuration,
    #[error("repeat count must be at least 1")]
    ZeroRepeat,
    #[error("queue depth must be at least 1")]
    ZeroQueueDepth,
    #[error("thread count must be at least 1")]
    ZeroThreads,
    #[error("test file size must be greater than zero")]
    ZeroFileSize,
    #[error("mix read percentage {0} is above 100")]
    MixPercentageOutOfRange(u8),
    #[error("test file must be named {TEST_FILE_NAME}, got {0}")]
    InvalidTestFileName(PathBuf),
}

/// Everything needed to run one battery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkProfile {
    pub block_sizes: Vec<BlockSize>,
    pub queue_depth: u32,
    pub threads: u32,
    pub patterns: Vec<Pattern>,
    pub duration: Duration,
    /// Pause between jobs. Zero means no pause.
    pub interval: Duration,
    /// Test file path; must end in [`TEST_FILE_NAME`].
    pub target: PathBuf,
    pub fill: FillPolicy,
    pub repeat_count: u32,
    pub file_size: u64,
    /// Share of reads in mix patterns (`--rwmixread`).
    pub random_read_percentage: u8,
}

impl BenchmarkProfile {
    /// Profile using the default preset with its test file inside `dir`.
    pub fn for_directory(dir: impl AsRef<Path>) -> Self {
        Preset::Default.profile(dir, false, TestMode::ReadWrite)
    }

    #[must_use]
    pub fn with_block_sizes(mut self, block_sizes: Vec<BlockSize>) -> Self {
        self.block_sizes = block_sizes;
        self
    }

    #[must_use]
    pub fn with_patterns(mut self, patterns: Vec<Pattern>) -> Self {
        self.patterns = patterns;
        self
    }

    #[must_use]
    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_repeat_count(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    #[must_use]
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    #[must_use]
    pub fn with_fill(mut self, fill: FillPolicy) -> Self {
        self.fill = fill;
        self
    }

    #[must_use]
    pub fn with_random_read_percentage(mut self, percentage: u8) -> Self {
        self.random_read_percentage = percentage;
        self
    }

    /// Check every invariant the runner relies on.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.patterns.is_empty() {
            return Err(ProfileError::EmptyPatterns);
        }
        if self.block_sizes.is_empty() {
            return Err(ProfileError::EmptyBlockSizes);
        }
        let mut seen = HashSet::new();
        for bs in &self.block_sizes {
            if bs.bytes() == 0 {
                return Err(ProfileError::ZeroBlockSize);
            }
            if !seen.insert(*bs) {
                return Err(ProfileError::DuplicateBlockSize(*bs));
            }
        }
        if self.duration.is_zero() {
            return Err(ProfileError::ZeroDuration);
        }
        if self.repeat_count == 0 {
            return Err(ProfileError::ZeroRepeat);
        }
        if self.queue_depth == 0 {
            return Err(ProfileError::ZeroQueueDepth);
        }
        if self.threads == 0 {
            return Err(ProfileError::ZeroThreads);
        }
        if self.file_size == 0 {
            return Err(ProfileError::ZeroFileSize);
        }
        if self.random_read_percentage > 100 {
            return Err(ProfileError::MixPercentageOutOfRange(
                self.random_read_percentage,
            ));
        }
        if self.target.file_name().and_then(|n| n.to_str()) != Some(TEST_FILE_NAME) {
            return Err(ProfileError::InvalidTestFileName(self.target.clone()));
        }
        Ok(())
    }

    /// Number of jobs [`expand`] will produce.
    pub fn job_count(&self) -> usize {
        self.patterns
            .len()
            .saturating_mul(self.block_sizes.len())
            .saturating_mul(self.repeat_count as usize)
    }

    /// Rough wall-clock estimate, ignoring preparation. Saturates at
    /// `Duration::MAX`.
    pub fn estimated_duration(&self) -> Duration {
        let jobs = u32::try_from(self.job_count()).unwrap_or(u32::MAX);
        let running = self.duration.checked_mul(jobs).unwrap_or(Duration::MAX);
        let pauses = self
            .interval
            .checked_mul(jobs.saturating_sub(1))
            .unwrap_or(Duration::MAX);
        running.saturating_add(pauses)
    }
}

/// One fio invocation in the battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestJob {
    pub pattern: Pattern,
    pub block_size: BlockSize,
    pub queue_depth: u32,
    pub threads: u32,
    pub duration: Duration,
    pub repeat_index: u32,
    /// Position in the queue, zero-based.
    pub index: usize,
    pub total: usize,
}

impl TestJob {
    /// Progress label, e.g. `Sequential Read 3/12`.
    pub fn label(&self) -> String {
        format!("{} {}/{}", self.pattern.label(), self.index + 1, self.total)
    }
}

/// Expand a profile into its job queue.
///
/// Patterns in declared order, then block sizes, then repeats. Pure and
/// deterministic; validation is the caller's job.
pub fn expand(profile: &BenchmarkProfile) -> Vec<TestJob> {
    let total = profile.job_count();
    let mut jobs = Vec::with_capacity(total);

    for &pattern in &profile.patterns {
        for &block_size in &profile.block_sizes {
            for repeat_index in 0..profile.repeat_count {
                jobs.push(TestJob {
                    pattern,
                    block_size,
                    queue_depth: profile.queue_depth,
                    threads: profile.threads,
                    duration: profile.duration,
                    repeat_index,
                    index: jobs.len(),
                    total,
                });
            }
        }
    }

    jobs
}

/// Which directions a preset keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    #[default]
    ReadWrite,
    Read,
    Write,
}

impl TestMode {
    fn keeps(self, pattern: Pattern) -> bool {
        match self {
            Self::ReadWrite => true,
            Self::Read => pattern.reads() && !pattern.writes(),
            Self::Write => pattern.writes() && !pattern.reads(),
        }
    }
}

impl FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-write" | "readwrite" | "rw" | "all" => Ok(Self::ReadWrite),
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(format!("unknown test mode '{other}'")),
        }
    }
}

/// Built-in profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    #[default]
    Default,
    PeakPerformance,
    RealWorld,
    Demo,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Default,
        Preset::PeakPerformance,
        Preset::RealWorld,
        Preset::Demo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::PeakPerformance => "peak",
            Self::RealWorld => "real-world",
            Self::Demo => "demo",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Default => "Balanced battery, Q8T1, five repeats",
            Self::PeakPerformance => "Deep queues and many threads, Q32T16",
            Self::RealWorld => "Desktop-like load, Q1T1",
            Self::Demo => "Single sequential pass, no pause between jobs",
        }
    }

    /// Build the preset's profile with its test file inside `dir`.
    ///
    /// `mix` appends the mix patterns; `mode` then drops the directions it
    /// excludes. Mix patterns survive only in [`TestMode::ReadWrite`].
    pub fn profile(self, dir: impl AsRef<Path>, mix: bool, mode: TestMode) -> BenchmarkProfile {
        let (block_sizes, queue_depth, threads) = match self {
            Self::Default => (vec![BlockSize::from_mib(1), BlockSize::from_kib(4)], 8, 1),
            Self::PeakPerformance => (vec![BlockSize::from_mib(1), BlockSize::from_kib(4)], 32, 16),
            Self::RealWorld => (vec![BlockSize::from_mib(1), BlockSize::from_kib(4)], 1, 1),
            Self::Demo => (vec![BlockSize::from_mib(1)], 8, 1),
        };
        let (repeat_count, interval) = match self {
            Self::Demo => (1, Duration::ZERO),
            _ => (5, Duration::from_secs(5)),
        };

        let mut patterns = match self {
            Self::Demo => vec![Pattern::SequentialRead, Pattern::SequentialWrite],
            _ => vec![
                Pattern::SequentialRead,
                Pattern::RandomRead,
                Pattern::SequentialWrite,
                Pattern::RandomWrite,
            ],
        };
        if mix {
            patterns.extend([Pattern::SequentialMix, Pattern::RandomMix]);
        }
        patterns.retain(|p| mode.keeps(*p));

        BenchmarkProfile {
            block_sizes,
            queue_depth,
            threads,
            patterns,
            duration: Duration::from_secs(5),
            interval,
            target: dir.as_ref().join(TEST_FILE_NAME),
            fill: FillPolicy::Random,
            repeat_count,
            file_size: GIB,
            random_read_percentage: DEFAULT_MIX_READ_PERCENTAGE,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "default" => Ok(Self::Default),
            "peak" | "peak-performance" => Ok(Self::PeakPerformance),
            "real-world" | "realworld" | "real" => Ok(Self::RealWorld),
            "demo" => Ok(Self::Demo),
            other => Err(format!("unknown preset '{other}'")),
        }
    }
}
