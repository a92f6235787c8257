//! fiomark: storage benchmarks driven through fio.

pub mod bench;
pub mod report;

pub use bench::{
    BenchmarkController, BenchmarkError, BenchmarkEvent, BenchmarkProfile, PatternResult, Preset,
    RunState, RunSummary, TestMode,
};
pub use fiomark_common::{FiomarkConfig, LogConfig, init_logging};
