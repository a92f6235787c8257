//! Common types used across fiomark components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One access mode under test.
///
/// The set is closed: every per-pattern decision (fio arguments, labels,
/// which directions get recorded) is an exhaustive match on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    SequentialRead,
    SequentialWrite,
    SequentialMix,
    RandomRead,
    RandomWrite,
    RandomMix,
}

impl Pattern {
    /// Every pattern, in canonical battery order.
    pub const ALL: [Pattern; 6] = [
        Pattern::SequentialRead,
        Pattern::SequentialWrite,
        Pattern::SequentialMix,
        Pattern::RandomRead,
        Pattern::RandomWrite,
        Pattern::RandomMix,
    ];

    /// Value passed to fio as `--rw`.
    pub fn fio_rw(self) -> &'static str {
        match self {
            Self::SequentialRead => "read",
            Self::SequentialWrite => "write",
            Self::SequentialMix => "rw",
            Self::RandomRead => "randread",
            Self::RandomWrite => "randwrite",
            Self::RandomMix => "randrw",
        }
    }

    /// Human-readable label used in progress messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::SequentialRead => "Sequential Read",
            Self::SequentialWrite => "Sequential Write",
            Self::SequentialMix => "Sequential Mix",
            Self::RandomRead => "Random Read",
            Self::RandomWrite => "Random Write",
            Self::RandomMix => "Random Mix",
        }
    }

    /// Short access tag (`SEQ` / `RND`) used in compact row names like `SEQ1M`.
    pub fn access_tag(self) -> &'static str {
        match self {
            Self::SequentialRead | Self::SequentialWrite | Self::SequentialMix => "SEQ",
            Self::RandomRead | Self::RandomWrite | Self::RandomMix => "RND",
        }
    }

    /// Whether the pattern issues reads.
    pub fn reads(self) -> bool {
        match self {
            Self::SequentialRead | Self::SequentialMix | Self::RandomRead | Self::RandomMix => true,
            Self::SequentialWrite | Self::RandomWrite => false,
        }
    }

    /// Whether the pattern issues writes.
    pub fn writes(self) -> bool {
        match self {
            Self::SequentialWrite | Self::SequentialMix | Self::RandomWrite | Self::RandomMix => {
                true
            }
            Self::SequentialRead | Self::RandomRead => false,
        }
    }

    pub fn is_mix(self) -> bool {
        self.reads() && self.writes()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error returned when a pattern name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pattern '{0}' (expected one of: seq-read, seq-write, seq-mix, rnd-read, rnd-write, rnd-mix)")]
pub struct ParsePatternError(pub String);

impl FromStr for Pattern {
    type Err = ParsePatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "seq-read" | "sequential-read" | "read" => Ok(Self::SequentialRead),
            "seq-write" | "sequential-write" | "write" => Ok(Self::SequentialWrite),
            "seq-mix" | "sequential-mix" | "rw" => Ok(Self::SequentialMix),
            "rnd-read" | "random-read" | "randread" => Ok(Self::RandomRead),
            "rnd-write" | "random-write" | "randwrite" => Ok(Self::RandomWrite),
            "rnd-mix" | "random-mix" | "randrw" => Ok(Self::RandomMix),
            _ => Err(ParsePatternError(s.to_string())),
        }
    }
}

/// I/O block size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockSize(pub u64);

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

impl BlockSize {
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * KIB)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Compact suffix used in row names: `1M`, `4K`, `512`.
    pub fn short(self) -> String {
        if self.0 >= MIB && self.0 % MIB == 0 {
            format!("{}M", self.0 / MIB)
        } else if self.0 >= KIB && self.0 % KIB == 0 {
            format!("{}K", self.0 / KIB)
        } else {
            self.0.to_string()
        }
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{}MiB", self.0 / MIB)
        } else if self.0 >= KIB && self.0 % KIB == 0 {
            write!(f, "{}KiB", self.0 / KIB)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

/// Errors from parsing a byte size such as `4k` or `1MiB`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseBlockSizeError {
    #[error("empty size")]
    Empty,
    #[error("invalid size '{0}'")]
    Invalid(String),
    #[error("size '{0}' overflows")]
    Overflow(String),
}

/// Parse a binary byte size: plain bytes, or a `k`/`m`/`g` suffix with an
/// optional `iB`/`B` tail. Suffixes are powers of 1024.
pub fn parse_byte_size(s: &str) -> Result<u64, ParseBlockSizeError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ParseBlockSizeError::Empty);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(ParseBlockSizeError::Invalid(s.to_string()));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ParseBlockSizeError::Overflow(s.to_string()))?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        _ => return Err(ParseBlockSizeError::Invalid(s.to_string())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| ParseBlockSizeError::Overflow(s.to_string()))
}

impl FromStr for BlockSize {
    type Err = ParseBlockSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_size(s).map(BlockSize)
    }
}

/// How the test file's buffers are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Random data; defeats compression and deduplication.
    #[default]
    Random,
    /// Zero-filled buffers.
    Zeros,
}

impl FillPolicy {
    /// Value passed to fio as `--zero_buffers`.
    pub fn zero_buffers_flag(self) -> u8 {
        match self {
            Self::Random => 0,
            Self::Zeros => 1,
        }
    }
}
