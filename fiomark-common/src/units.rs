//! Unit conversions for presenting raw SI results.
//!
//! The engine stores bytes/s, ops/s and nanoseconds. Everything here is
//! display-side only.

use crate::types::{GIB, KIB, MIB};

const MB: f64 = 1_000_000.0;
const GB: f64 = 1_000_000_000.0;

/// Bytes per second to decimal megabytes per second.
pub fn megabytes_per_sec(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / MB
}

/// Bytes per second to decimal gigabytes per second.
pub fn gigabytes_per_sec(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / GB
}

/// Nanoseconds to microseconds.
pub fn micros(nanos: f64) -> f64 {
    nanos / 1_000.0
}

/// Throughput with an automatically chosen unit: `812.35 MB/s`, `3.21 GB/s`.
pub fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", gigabytes_per_sec(bytes_per_sec))
    } else {
        format!("{:.2} MB/s", megabytes_per_sec(bytes_per_sec))
    }
}

/// IOPS with two decimals below 1000, integral above.
pub fn format_iops(iops: f64) -> String {
    if iops >= 1000.0 {
        format!("{:.0} IOPS", iops)
    } else {
        format!("{:.2} IOPS", iops)
    }
}

/// Latency in microseconds, falling back to milliseconds past 10 ms.
pub fn format_latency(nanos: f64) -> String {
    let us = micros(nanos);
    if us >= 10_000.0 {
        format!("{:.2} ms", us / 1_000.0)
    } else {
        format!("{:.2} μs", us)
    }
}

/// Binary byte size: `512 B`, `4 KiB`, `1.50 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format_scaled(bytes, GIB, "GiB")
    } else if bytes >= MIB {
        format_scaled(bytes, MIB, "MiB")
    } else if bytes >= KIB {
        format_scaled(bytes, KIB, "KiB")
    } else {
        format!("{} B", bytes)
    }
}

fn format_scaled(bytes: u64, unit: u64, suffix: &str) -> String {
    if bytes % unit == 0 {
        format!("{} {}", bytes / unit, suffix)
    } else {
        format!("{:.2} {}", bytes as f64 / unit as f64, suffix)
    }
}
