//! Core types for FlatGeobuf sources.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SourceError};

/// An axis-aligned bounding box in source coordinates (WGS84 degrees for
/// every dataset this crate is used with).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Create a new envelope from corner coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// An envelope that contains nothing. Expanding it by any envelope yields
    /// that envelope.
    pub fn empty() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY)
    }

    /// Whole-world envelope.
    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    /// True if no point has been added to this envelope.
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// Check if this envelope intersects another. Touching edges count as
    /// intersecting, matching the packed R-tree search semantics.
    pub fn intersects(&self, other: &Envelope) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    /// Grow this envelope to include another.
    pub fn expand(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Grow this envelope to include a point.
    pub fn expand_point(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    /// Width in coordinate units.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height in coordinate units.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Center point of the envelope.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Split an envelope that extends past longitude ±180 into envelopes
    /// within [-180, 180].
    ///
    /// Geometry normalized across the antimeridian has longitudes such as
    /// 177..183, and the part past 180 is stored at -180..-177.
    pub fn split_antimeridian(&self) -> Vec<Envelope> {
        if self.is_empty() {
            return Vec::new();
        }
        if self.width() >= 360.0 {
            return vec![Self::new(-180.0, self.min_y, 180.0, self.max_y)];
        }
        if self.min_x < -180.0 {
            return vec![
                Self::new(self.min_x + 360.0, self.min_y, 180.0, self.max_y),
                Self::new(-180.0, self.min_y, self.max_x, self.max_y),
            ];
        }
        if self.max_x > 180.0 {
            return vec![
                Self::new(self.min_x, self.min_y, 180.0, self.max_y),
                Self::new(-180.0, self.min_y, self.max_x - 360.0, self.max_y),
            ];
        }
        vec![*self]
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::world()
    }
}

impl From<geo_types::Rect<f64>> for Envelope {
    fn from(rect: geo_types::Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

/// A byte range within a remote file.
///
/// `end` is inclusive, as in an HTTP `Range` header. `None` means "to the
/// end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range covering `[start, end]` inclusive.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range from `start` to the end of the file.
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes requested, if bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}", self)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// Parse a human readable byte size such as `"64mb"`, `"5MB"`, `"1.5GB"`,
/// `"512kb"` or a plain number of bytes. Units are binary (1kb = 1024 bytes).
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SourceError::config("empty byte size"));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| SourceError::config(format!("invalid byte size: {}", input)))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        "tb" | "t" => 1024 * 1024 * 1024 * 1024,
        other => {
            return Err(SourceError::config(format!(
                "unknown byte size unit '{}' in {}",
                other, input
            )))
        }
    };

    Ok((value * multiplier as f64).round() as u64)
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}
