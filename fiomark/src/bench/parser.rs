//! Incremental decoder for fio's JSON output.
//!
//! With `--status-interval` fio writes one multi-line JSON document per
//! interval and a final one at exit, all concatenated on stdout. Chunks from
//! the pipe split those documents at arbitrary byte offsets, so the decoder
//! keeps its scanner state between calls and only hands complete top-level
//! objects to `serde_json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

/// One latency percentile, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    /// Quantile in percent, e.g. `99.9`.
    pub quantile: f64,
    pub value_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean_ns: f64,
    /// Sorted by quantile. Empty when fio reported none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub percentiles: Vec<Percentile>,
}

/// Cumulative figures for one direction at the time of the sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionSample {
    pub io_bytes: u64,
    pub bandwidth_bytes_per_sec: f64,
    pub iops: f64,
    pub latency: LatencySummary,
}

impl DirectionSample {
    pub fn is_idle(&self) -> bool {
        self.io_bytes == 0 && self.iops == 0.0
    }
}

/// One decoded status or result document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSample {
    pub elapsed: Duration,
    pub read: DirectionSample,
    pub write: DirectionSample,
}

/// Input the decoder skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseAnomaly {
    /// Bytes outside any JSON object, such as fio warnings.
    Noise,
    /// A balanced object that `serde_json` rejected.
    Malformed(String),
    /// A document without a non-empty `jobs` array.
    MissingJobs,
    /// The stream ended inside an object.
    Truncated,
}

/// Streaming decoder for concatenated fio JSON documents.
#[derive(Debug, Default)]
pub struct ResultParser {
    buffer: Vec<u8>,
    /// Next byte of `buffer` to scan.
    cursor: usize,
    /// Offset of the `{` opening the current top-level object.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escape: bool,
    in_noise: bool,
    /// The previous byte was something other than a newline.
    mid_line: bool,
    anomalies: usize,
    last: Option<RawSample>,
}

impl ResultParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every sample completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawSample> {
        self.buffer.extend_from_slice(bytes);
        let mut samples = Vec::new();

        while self.cursor < self.buffer.len() {
            let byte = self.buffer[self.cursor];
            let pos = self.cursor;
            self.cursor += 1;
            let line_start = !self.mid_line;
            self.mid_line = byte != b'\n';

            // fio opens every document in column 0 and indents everything
            // nested, so a `{` there abandons whatever object is still open.
            if byte == b'{'
                && line_start
                && let Some(abandoned) = self.start
            {
                self.start = Some(pos);
                self.record_anomaly(ParseAnomaly::Malformed(format!(
                    "unterminated object of {} bytes",
                    pos - abandoned
                )));
                self.depth = 1;
                self.in_string = false;
                self.escape = false;
                continue;
            }

            if self.start.is_none() {
                match byte {
                    b'{' => {
                        self.start = Some(pos);
                        self.depth = 1;
                        self.in_noise = false;
                    }
                    b if b.is_ascii_whitespace() => {}
                    _ => {
                        if !self.in_noise {
                            self.in_noise = true;
                            self.record_anomaly(ParseAnomaly::Noise);
                        }
                    }
                }
                continue;
            }

            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0
                        && let Some(start) = self.start.take()
                    {
                        match decode_document(&self.buffer[start..=pos]) {
                            Ok(sample) => {
                                trace!(elapsed = ?sample.elapsed, "Decoded fio sample");
                                self.last = Some(sample.clone());
                                samples.push(sample);
                            }
                            Err(anomaly) => self.record_anomaly(anomaly),
                        }
                    }
                }
                _ => {}
            }
        }

        self.compact();
        samples
    }

    /// Close the stream. A dangling partial object counts as truncated.
    ///
    /// Returns the last sample decoded over the stream's lifetime, which for
    /// a job that ran to completion is fio's final result document.
    pub fn finish(&mut self) -> Option<RawSample> {
        if self.start.is_some() {
            self.record_anomaly(ParseAnomaly::Truncated);
        }
        self.buffer.clear();
        self.cursor = 0;
        self.start = None;
        self.depth = 0;
        self.in_string = false;
        self.escape = false;
        self.in_noise = false;
        self.mid_line = false;
        self.last.clone()
    }

    /// Number of skipped inputs so far.
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }

    /// Bytes held back waiting for the rest of an object.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    fn record_anomaly(&mut self, anomaly: ParseAnomaly) {
        self.anomalies += 1;
        debug!(?anomaly, total = self.anomalies, "Skipped fio output");
    }

    /// Drop bytes that can no longer belong to an object.
    fn compact(&mut self) {
        let keep_from = self.start.unwrap_or(self.cursor);
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.cursor -= keep_from;
        if let Some(start) = self.start.as_mut() {
            *start -= keep_from;
        }
    }
}

/// Decode `bytes` appended to `pending`, returning the samples and the
/// undecoded tail to pass back in on the next call.
pub fn decode(pending: &[u8], bytes: &[u8]) -> (Vec<RawSample>, Vec<u8>) {
    let mut parser = ResultParser::new();
    let mut samples = parser.feed(pending);
    samples.extend(parser.feed(bytes));
    (samples, parser.buffer)
}

fn decode_document(raw: &[u8]) -> Result<RawSample, ParseAnomaly> {
    let doc: Value =
        serde_json::from_slice(raw).map_err(|e| ParseAnomaly::Malformed(e.to_string()))?;
    let jobs = doc
        .get("jobs")
        .and_then(Value::as_array)
        .filter(|jobs| !jobs.is_empty())
        .ok_or(ParseAnomaly::MissingJobs)?;

    let mut elapsed = Duration::ZERO;
    let mut reads = Vec::with_capacity(jobs.len());
    let mut writes = Vec::with_capacity(jobs.len());

    for job in jobs {
        let read = job.get("read").map(direction).unwrap_or_default();
        let write = job.get("write").map(direction).unwrap_or_default();
        elapsed = elapsed.max(job_elapsed(job));
        reads.push(read);
        writes.push(write);
    }

    Ok(RawSample {
        elapsed,
        read: sum_directions(reads),
        write: sum_directions(writes),
    })
}

fn job_elapsed(job: &Value) -> Duration {
    if let Some(secs) = job.get("elapsed").and_then(Value::as_u64)
        && secs > 0
    {
        return Duration::from_secs(secs);
    }
    let runtime_ms = ["read", "write"]
        .iter()
        .filter_map(|dir| job.get(dir)?.get("runtime")?.as_u64())
        .max()
        .unwrap_or(0);
    Duration::from_millis(runtime_ms)
}

fn direction(value: &Value) -> DirectionSample {
    let io_bytes = u64_field(value, "io_bytes")
        .or_else(|| u64_field(value, "io_kbytes").map(|kb| kb * 1024))
        .unwrap_or(0);
    let bandwidth_bytes_per_sec = f64_field(value, "bw_bytes")
        .or_else(|| f64_field(value, "bw").map(|kib| kib * 1024.0))
        .unwrap_or(0.0);
    let iops = f64_field(value, "iops").unwrap_or(0.0);

    let lat = value.get("lat_ns");
    let clat = value.get("clat_ns");
    let mean_ns = lat
        .and_then(|l| f64_field(l, "mean"))
        .or_else(|| clat.and_then(|c| f64_field(c, "mean")))
        .unwrap_or(0.0);
    let percentiles = lat
        .and_then(percentiles)
        .or_else(|| clat.and_then(percentiles))
        .unwrap_or_default();

    DirectionSample {
        io_bytes,
        bandwidth_bytes_per_sec,
        iops,
        latency: LatencySummary {
            mean_ns,
            percentiles,
        },
    }
}

fn percentiles(stats: &Value) -> Option<Vec<Percentile>> {
    let table = stats.get("percentile")?.as_object()?;
    let mut out: Vec<Percentile> = table
        .iter()
        .filter_map(|(key, value)| {
            Some(Percentile {
                quantile: key.parse().ok()?,
                value_ns: value.as_u64()?,
            })
        })
        .collect();
    if out.is_empty() {
        return None;
    }
    out.sort_by(|a, b| a.quantile.total_cmp(&b.quantile));
    Some(out)
}

/// Sum per-job figures; latency is IOPS-weighted.
fn sum_directions(parts: Vec<DirectionSample>) -> DirectionSample {
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap_or_default();
    }

    let total_iops: f64 = parts.iter().map(|p| p.iops).sum();
    let weight = |p: &DirectionSample| {
        if total_iops > 0.0 {
            p.iops / total_iops
        } else {
            1.0 / parts.len() as f64
        }
    };

    let mean_ns = parts.iter().map(|p| p.latency.mean_ns * weight(p)).sum();

    let mut percentiles = parts
        .iter()
        .find(|p| !p.latency.percentiles.is_empty())
        .map(|p| p.latency.percentiles.clone())
        .unwrap_or_default();
    let same_quantiles = parts.iter().all(|p| {
        p.latency.percentiles.len() == percentiles.len()
            && p.latency
                .percentiles
                .iter()
                .zip(&percentiles)
                .all(|(a, b)| a.quantile == b.quantile)
    });
    if same_quantiles {
        for (i, pct) in percentiles.iter_mut().enumerate() {
            let weighted: f64 = parts
                .iter()
                .map(|p| p.latency.percentiles[i].value_ns as f64 * weight(p))
                .sum();
            pct.value_ns = weighted.round() as u64;
        }
    }

    DirectionSample {
        io_bytes: parts.iter().map(|p| p.io_bytes).sum(),
        bandwidth_bytes_per_sec: parts.iter().map(|p| p.bandwidth_bytes_per_sec).sum(),
        iops: total_iops,
        latency: LatencySummary {
            mean_ns,
            percentiles,
        },
    }
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    let field = value.get(key)?;
    field
        .as_u64()
        .or_else(|| field.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn f64_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key)?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_doc(elapsed: u64, read_bw: u64, read_iops: f64) -> String {
        format!(
            r#"{{
  "fio version" : "fio-3.36",
  "timestamp" : 1700000000,
  "jobs" : [
    {{
      "jobname" : "read",
      "elapsed" : {elapsed},
      "read" : {{
        "io_bytes" : {io},
        "bw_bytes" : {read_bw},
        "iops" : {read_iops},
        "runtime" : {runtime},
        "clat_ns" : {{
          "mean" : 812.5,
          "percentile" : {{ "50.000000" : 700, "99.000000" : 2048, "99.900000" : 4096 }}
        }},
        "lat_ns" : {{ "mean" : 850.25 }}
      }},
      "write" : {{ "io_bytes" : 0, "bw_bytes" : 0, "iops" : 0.0, "runtime" : 0 }}
    }}
  ]
}}
"#,
            io = read_bw * elapsed,
            runtime = elapsed * 1000,
        )
    }

    #[test]
    fn test_decodes_single_document() {
        let mut parser = ResultParser::new();
        let samples = parser.feed(status_doc(3, 1_000_000, 244.5).as_bytes());
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.elapsed, Duration::from_secs(3));
        assert_eq!(s.read.io_bytes, 3_000_000);
        assert_eq!(s.read.bandwidth_bytes_per_sec, 1_000_000.0);
        assert_eq!(s.read.iops, 244.5);
        assert_eq!(s.read.latency.mean_ns, 850.25);
        assert_eq!(s.read.latency.percentiles.len(), 3);
        assert_eq!(s.read.latency.percentiles[2].quantile, 99.9);
        assert_eq!(s.read.latency.percentiles[2].value_ns, 4096);
        assert!(s.write.is_idle());
        assert_eq!(parser.anomalies(), 0);
    }

    #[test]
    fn test_concatenated_documents_and_noise() {
        let stream = format!(
            "fio: this platform does not support direct io\n{}{}",
            status_doc(1, 500, 1.0),
            status_doc(2, 600, 2.0)
        );
        let mut parser = ResultParser::new();
        let samples = parser.feed(stream.as_bytes());
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].elapsed, Duration::from_secs(2));
        assert_eq!(parser.anomalies(), 1);
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_scanner() {
        let doc = r#"{"jobs":[{"jobname":"we}ird\"{","elapsed":1,"read":{"io_bytes":1,"bw_bytes":1,"iops":1}}]}"#;
        let mut parser = ResultParser::new();
        assert_eq!(parser.feed(doc.as_bytes()).len(), 1);
        assert_eq!(parser.anomalies(), 0);
    }

    #[test]
    fn test_document_without_jobs_is_anomaly() {
        let mut parser = ResultParser::new();
        let samples = parser.feed(br#"{"fio version":"fio-3.36"} {"jobs":[]}"#);
        assert!(samples.is_empty());
        assert_eq!(parser.anomalies(), 2);
    }

    #[test]
    fn test_malformed_document_is_skipped() {
        let mut parser = ResultParser::new();
        let stream = format!("{{\"jobs\": [1, ,]}}\n{}", status_doc(1, 10, 1.0));
        let samples = parser.feed(stream.as_bytes());
        assert_eq!(samples.len(), 1);
        assert_eq!(parser.anomalies(), 1);
    }

    #[test]
    fn test_finish_reports_truncation_and_returns_last() {
        let mut parser = ResultParser::new();
        parser.feed(status_doc(4, 10, 1.0).as_bytes());
        parser.feed(br#"{"jobs":[{"elapsed":5,"#);
        let last = parser.finish().unwrap();
        assert_eq!(last.elapsed, Duration::from_secs(4));
        assert_eq!(parser.anomalies(), 1);
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_lat_falls_back_to_clat_and_bw_to_kib() {
        let doc = r#"{"jobs":[{"read":{"io_kbytes":4,"bw":2,"iops":3,"runtime":1500,
            "clat_ns":{"mean":100.0}}}]}"#;
        let mut parser = ResultParser::new();
        let s = parser.feed(doc.as_bytes()).remove(0);
        assert_eq!(s.read.io_bytes, 4096);
        assert_eq!(s.read.bandwidth_bytes_per_sec, 2048.0);
        assert_eq!(s.read.latency.mean_ns, 100.0);
        assert!(s.read.latency.percentiles.is_empty());
        assert_eq!(s.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn test_multiple_jobs_are_summed_with_weighted_latency() {
        let doc = r#"{"jobs":[
            {"elapsed":2,"write":{"io_bytes":100,"bw_bytes":1000,"iops":10,"lat_ns":{"mean":100.0}}},
            {"elapsed":3,"write":{"io_bytes":300,"bw_bytes":3000,"iops":30,"lat_ns":{"mean":200.0}}}
        ]}"#;
        let mut parser = ResultParser::new();
        let s = parser.feed(doc.as_bytes()).remove(0);
        assert_eq!(s.elapsed, Duration::from_secs(3));
        assert_eq!(s.write.io_bytes, 400);
        assert_eq!(s.write.bandwidth_bytes_per_sec, 4000.0);
        assert_eq!(s.write.iops, 40.0);
        assert_eq!(s.write.latency.mean_ns, 175.0);
    }

    #[test]
    fn test_decode_returns_remaining_tail() {
        let doc = status_doc(1, 10, 1.0);
        let (head, tail) = doc.as_bytes().split_at(40);
        let (samples, remaining) = decode(&[], head);
        assert!(samples.is_empty());
        assert_eq!(remaining.as_slice(), head);
        let (samples, remaining) = decode(&remaining, tail);
        assert_eq!(samples.len(), 1);
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_stray_brace_in_noise_does_not_swallow_documents() {
        let stream = format!(
            "fio: warning {{unterminated\n{}{}",
            status_doc(1, 500, 1.0),
            status_doc(2, 600, 2.0)
        );
        let mut parser = ResultParser::new();
        let samples = parser.feed(stream.as_bytes());
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].elapsed, Duration::from_secs(2));
        // the warning text, then the object its brace opened
        assert_eq!(parser.anomalies(), 2);
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_stray_brace_split_across_feeds_still_resyncs() {
        let mut parser = ResultParser::new();
        assert!(parser.feed(b"fio: {oops\n").is_empty());
        let doc = status_doc(3, 700, 3.0);
        let (head, tail) = doc.as_bytes().split_at(1);
        assert!(parser.feed(head).is_empty());
        let samples = parser.feed(tail);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].elapsed, Duration::from_secs(3));
        assert_eq!(parser.anomalies(), 2);
    }

    fn stream() -> String {
        format!(
            "warn: {{noisy\n{}garbage{}\n{{\"no\":\"jobs\"}}{}",
            status_doc(1, 100, 1.5),
            status_doc(2, 200, 2.5),
            status_doc(3, 300, 3.5)
        )
    }

    proptest! {
        #[test]
        fn prop_split_chunks_match_whole_stream(cuts in proptest::collection::vec(0usize..2000, 0..12)) {
            let stream = stream();
            let bytes = stream.as_bytes();

            let mut whole = ResultParser::new();
            let expected = whole.feed(bytes);

            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            points.sort_unstable();
            let mut chunked = ResultParser::new();
            let mut got = Vec::new();
            let mut prev = 0;
            for p in points.into_iter().chain(std::iter::once(bytes.len())) {
                got.extend(chunked.feed(&bytes[prev..p]));
                prev = p;
            }

            prop_assert_eq!(got, expected);
            prop_assert_eq!(chunked.anomalies(), whole.anomalies());
        }
    }
}
