//! The benchmark engine.
//!
//! A [`BenchmarkProfile`] expands into an ordered queue of [`TestJob`]s.
//! The [`BenchmarkController`] runs them one at a time through fio, decodes
//! the streamed JSON with a [`ResultParser`], and folds each finished job
//! into an [`Aggregator`]. Observers follow along through [`BenchmarkEvent`]s.

pub mod aggregate;
pub mod controller;
pub mod error;
pub mod events;
pub mod parser;
pub mod profile;
pub mod runner;

pub use aggregate::{Aggregator, DirectionResult, PatternResult, ResultKey};
pub use controller::{BenchmarkController, RunState, RunSummary};
pub use error::BenchmarkError;
pub use events::{BenchmarkEvent, EventBus, RunOutcome};
pub use parser::{
    DirectionSample, LatencySummary, ParseAnomaly, Percentile, RawSample, ResultParser,
};
pub use profile::{
    BenchmarkProfile, Preset, ProfileError, TEST_FILE_NAME, TestJob, TestMode, expand,
};
pub use runner::{FioRunner, JobHandle, JobOutput, locate_tool};
