//! Sweep parser: capture-utility stdout to [`Detection`]s.
//!
//! Each output line has the shape
//!
//! ```text
//! date, time, hz_low, hz_high, hz_bin_width, num_samples, dB, dB, ...
//! ```
//!
//! The peak bin of a line becomes the representative detection. Malformed
//! lines are counted and discarded; they never escalate on their own.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::error::ParseError;
use crate::types::Detection;

const HEADER_FIELDS: usize = 6;

/// Longest partial line kept while waiting for a newline.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Accumulates raw stdout chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    overflowed: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the
    /// trailing `\n` / `\r\n`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.pending.last() == Some(&b'\r') {
                    self.pending.pop();
                }
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                self.pending.clear();
            } else {
                self.pending.push(byte);
            }
        }
        if self.pending.len() > MAX_PENDING_BYTES {
            self.overflowed += 1;
            self.pending.clear();
        }
        lines
    }

    /// Whatever is left once the stream closes.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Partial lines dropped for exceeding [`MAX_PENDING_BYTES`].
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }
}

/// Running parse counters for one capture process.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ParseStats {
    pub lines: u64,
    pub detections: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Stateful parser bound to one target frequency.
#[derive(Debug, Clone, Default)]
pub struct SweepParser {
    target_hz: Option<f64>,
    stats: ParseStats,
}

impl SweepParser {
    pub fn new(target_hz: Option<f64>) -> Self {
        Self {
            target_hz,
            stats: ParseStats::default(),
        }
    }

    pub fn target_hz(&self) -> Option<f64> {
        self.target_hz
    }

    /// Parse one complete line. Blank lines yield `Ok(None)` and are not
    /// counted as errors.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<Detection>, ParseError> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        self.stats.lines += 1;
        match parse_sweep_line(line, self.target_hz) {
            Ok(detection) => {
                self.stats.detections += 1;
                Ok(Some(detection))
            }
            Err(err) => {
                self.stats.errors += 1;
                self.stats.last_error = Some(err.to_string());
                tracing::debug!("discarding malformed sweep line: {err}");
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }
}

/// Parse a single sweep line into its peak-bin detection.
pub fn parse_sweep_line(line: &str, target_hz: Option<f64>) -> Result<Detection, ParseError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < HEADER_FIELDS {
        return Err(ParseError::TooFewFields {
            found: fields.len(),
            expected: HEADER_FIELDS + 1,
        });
    }

    let timestamp = parse_timestamp(fields[0], fields[1])?;
    let hz_low = number("hz_low", fields[2])?;
    let _hz_high = number("hz_high", fields[3])?;
    let bin_width = number("hz_bin_width", fields[4])?;

    let bins = &fields[HEADER_FIELDS..];
    if bins.is_empty() {
        return Err(ParseError::NoBins);
    }

    let mut peak: Option<(usize, f64)> = None;
    for (idx, raw) in bins.iter().enumerate() {
        let power = number("db", raw)?;
        match peak {
            Some((_, best)) if best >= power => {}
            _ => peak = Some((idx, power)),
        }
    }
    let Some((peak_idx, peak_power)) = peak else {
        return Err(ParseError::NoBins);
    };

    let frequency_hz = hz_low + (peak_idx as f64 + 0.5) * bin_width;
    let mut detection = Detection::new(frequency_hz, peak_power, timestamp);
    detection.bin_width_hz = bin_width;
    if let Some(target) = target_hz {
        detection = detection.with_target(target);
    }
    Ok(detection)
}

fn number(field: &'static str, raw: &str) -> Result<f64, ParseError> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::BadNumber {
            field,
            value: raw.to_string(),
        })
}

/// The utility prints local wall-clock time with microseconds.
fn parse_timestamp(date: &str, time: &str) -> Result<DateTime<Utc>, ParseError> {
    let joined = format!("{date} {time}");
    let naive = NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|_| ParseError::BadTimestamp(joined.clone()))?;
    Ok(Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc()))
}
