//! Wire-level enums and identifiers shared by the coordinator, the worker
//! protocol, and the state store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a submitted job.
pub type JobId = Uuid;
/// Identifier of a batch (atomic unit of dispatch).
pub type BatchId = Uuid;
/// Identifier of a registered worker.
pub type WorkerId = Uuid;

/// Job priority. Variants are declared in ascending order so the derived
/// `Ord` matches dispatch order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default tier.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Dispatched before everything else.
    Critical,
}

impl Priority {
    /// All tiers, highest first.
    pub const DESCENDING: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

/// Renderer a batch must be executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    /// Foundry Nuke.
    Nuke,
    /// Blackmagic Fusion.
    Fusion,
    /// Boris FX Silhouette.
    Silhouette,
}

impl RendererKind {
    /// Every supported renderer.
    pub const ALL: [Self; 3] = [Self::Nuke, Self::Fusion, Self::Silhouette];

    /// Lowercase name used on the wire and in config keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nuke => "nuke",
            Self::Fusion => "fusion",
            Self::Silhouette => "silhouette",
        }
    }
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RendererKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nuke" => Ok(Self::Nuke),
            "fusion" => Ok(Self::Fusion),
            "silhouette" => Ok(Self::Silhouette),
            other => Err(format!("unsupported renderer `{other}`")),
        }
    }
}

/// Inclusive range of frame numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    /// First frame (inclusive).
    pub start: i64,
    /// Last frame (inclusive).
    pub end: i64,
}

impl FrameRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self, String> {
        if start > end {
            return Err(format!("frame range start {start} is after end {end}"));
        }
        Ok(Self { start, end })
    }

    /// Number of frames in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.abs_diff(self.start).saturating_add(1)
    }

    /// A well-formed range always holds at least one frame.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Split into contiguous sub-ranges of at most `size` frames.
    #[must_use]
    pub fn split(&self, size: u64) -> Vec<Self> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        loop {
            let end = start.saturating_add(i64::try_from(size - 1).unwrap_or(i64::MAX)).min(self.end);
            out.push(Self { start, end });
            if end >= self.end {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for FrameRange {
    type Err = String;

    /// Accepts `"N"` or `"A-B"`; negative frame numbers are allowed for the
    /// single form only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|e| format!("invalid frame `{v}`: {e}"))
        };
        match s.split_once('-') {
            Some((a, b)) if !a.trim().is_empty() => Self::new(parse(a)?, parse(b)?),
            _ => {
                let frame = parse(s)?;
                Self::new(frame, frame)
            }
        }
    }
}
