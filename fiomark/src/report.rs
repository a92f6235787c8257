//! Rendering run results for people and for other programs.

use crate::bench::{BenchmarkProfile, DirectionResult, LatencySummary, PatternResult, RunSummary};
use chrono::{DateTime, Utc};
use fiomark_common::units::{format_bytes, format_iops, format_latency, format_throughput};
use serde::Serialize;
use std::fmt::Write as _;

/// Read and write figures of a mix pattern added together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinedFigures {
    pub bandwidth_bytes_per_sec: f64,
    pub iops: f64,
}

/// Combined throughput for mix patterns; `None` for single-direction rows.
pub fn combined(result: &PatternResult) -> Option<CombinedFigures> {
    if !result.pattern.is_mix() {
        return None;
    }
    let read = result.read.as_ref()?;
    let write = result.write.as_ref()?;
    Some(CombinedFigures {
        bandwidth_bytes_per_sec: read.bandwidth_bytes_per_sec + write.bandwidth_bytes_per_sec,
        iops: read.iops + write.iops,
    })
}

/// Latency at `quantile` percent, if fio reported it.
pub fn percentile_ns(latency: &LatencySummary, quantile: f64) -> Option<u64> {
    latency
        .percentiles
        .iter()
        .find(|p| (p.quantile - quantile).abs() < 1e-6)
        .map(|p| p.value_ns)
}

/// Machine-readable report document.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fio_version: Option<&'a str>,
    pub profile: &'a BenchmarkProfile,
    pub summary: &'a RunSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub combined: Vec<CombinedRow>,
}

#[derive(Debug, Serialize)]
pub struct CombinedRow {
    pub name: String,
    #[serde(flatten)]
    pub figures: CombinedFigures,
}

impl<'a> Report<'a> {
    pub fn new(
        profile: &'a BenchmarkProfile,
        summary: &'a RunSummary,
        fio_version: Option<&'a str>,
    ) -> Self {
        let combined = summary
            .results
            .iter()
            .filter_map(|r| {
                combined(r).map(|figures| CombinedRow {
                    name: r.key().to_string(),
                    figures,
                })
            })
            .collect();
        Self {
            generated_at: Utc::now(),
            fio_version,
            profile,
            summary,
            combined,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_text(&self) -> String {
        render_text(self.profile, self.summary, self.fio_version)
    }
}

/// Plain-text table of every result row.
pub fn render_text(
    profile: &BenchmarkProfile,
    summary: &RunSummary,
    fio_version: Option<&str>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "fiomark report, {}",
        summary.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(version) = fio_version {
        let _ = writeln!(out, "fio: {version}");
    }
    let _ = writeln!(
        out,
        "Target: {} ({}, {} per job, {} repeat{}, {:?} fill)",
        profile.target.display(),
        format_bytes(profile.file_size),
        humantime::format_duration(profile.duration),
        profile.repeat_count,
        if profile.repeat_count == 1 { "" } else { "s" },
        profile.fill,
    );
    out.push('\n');

    let _ = writeln!(
        out,
        "{:<14} {:<6} {:>14} {:>12} {:>12} {:>12}",
        "Test", "Dir", "Throughput", "IOPS", "Latency", "p99"
    );
    for result in &summary.results {
        let name = result.key().to_string();
        let rows = [("Read", result.read.as_ref()), ("Write", result.write.as_ref())];
        for (dir, figures) in rows {
            if let Some(figures) = figures {
                push_row(&mut out, &name, dir, figures);
            }
        }
        if let Some(mix) = combined(result) {
            let _ = writeln!(
                out,
                "{:<14} {:<6} {:>14} {:>12}",
                name,
                "Mix",
                format_throughput(mix.bandwidth_bytes_per_sec),
                format_iops(mix.iops),
            );
        }
    }
    if summary.results.is_empty() {
        out.push_str("(no results)\n");
    }

    out.push('\n');
    let _ = write!(
        out,
        "Jobs: {} of {} completed, {} failed",
        summary.completed_jobs, summary.total_jobs, summary.failed_jobs
    );
    if summary.cancelled {
        out.push_str(", cancelled");
    }
    out.push('\n');
    out
}

fn push_row(out: &mut String, name: &str, dir: &str, figures: &DirectionResult) {
    let p99 = percentile_ns(&figures.latency, 99.0)
        .map(|ns| format_latency(ns as f64))
        .unwrap_or_else(|| "-".to_string());
    let _ = writeln!(
        out,
        "{:<14} {:<6} {:>14} {:>12} {:>12} {:>12}",
        name,
        dir,
        format_throughput(figures.bandwidth_bytes_per_sec),
        format_iops(figures.iops),
        format_latency(figures.latency.mean_ns),
        p99,
    );
}
