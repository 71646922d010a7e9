//! Time-windowed detection buffer.
//!
//! A window opens on the first detection after a flush. The buffer is due
//! once the profile window has elapsed or it holds `cap` detections.

use spectra_core::Detection;

/// Detections drained from the buffer in one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub detections: Vec<Detection>,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl Batch {
    pub fn window_ms(&self) -> i64 {
        (self.window_end_ms - self.window_start_ms).max(1)
    }
}

/// Returned by [`DetectionBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Accepted,
    /// The cap was reached; flush before the window ends.
    FlushNow,
}

#[derive(Debug)]
pub struct DetectionBuffer {
    items: Vec<Detection>,
    window_start_ms: Option<i64>,
    cap: usize,
}

impl DetectionBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            window_start_ms: None,
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, detection: Detection, now_ms: i64) -> Backpressure {
        self.window_start_ms.get_or_insert(now_ms);
        self.items.push(detection);
        if self.items.len() >= self.cap {
            Backpressure::FlushNow
        } else {
            Backpressure::Accepted
        }
    }

    pub fn is_due(&self, now_ms: i64, window_ms: u64) -> bool {
        match self.window_start_ms {
            Some(start) => {
                self.items.len() >= self.cap || now_ms - start >= window_ms as i64
            }
            None => false,
        }
    }

    /// Drain the buffer. `None` when nothing is buffered.
    pub fn take(&mut self, now_ms: i64) -> Option<Batch> {
        let start = self.window_start_ms.take()?;
        if self.items.is_empty() {
            return None;
        }
        Some(Batch {
            detections: std::mem::take(&mut self.items),
            window_start_ms: start,
            window_end_ms: now_ms.max(start),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn detection() -> Detection {
        Detection::new(100e6, -60.0, Utc::now())
    }

    #[test]
    fn window_opens_on_first_push() {
        let mut buf = DetectionBuffer::new(100);
        assert!(!buf.is_due(10_000, 1_000));
        buf.push(detection(), 10_000);
        assert!(!buf.is_due(10_500, 1_000));
        assert!(buf.is_due(11_000, 1_000));
    }

    #[test]
    fn cap_signals_backpressure() {
        let mut buf = DetectionBuffer::new(2);
        assert_eq!(buf.push(detection(), 0), Backpressure::Accepted);
        assert_eq!(buf.push(detection(), 0), Backpressure::FlushNow);
        assert!(buf.is_due(0, 60_000));
    }

    #[test]
    fn take_resets_window_and_empty_take_is_none() {
        let mut buf = DetectionBuffer::new(10);
        assert!(buf.take(5).is_none());
        buf.push(detection(), 100);
        let batch = buf.take(400).expect("batch");
        assert_eq!(batch.detections.len(), 1);
        assert_eq!(batch.window_ms(), 300);
        assert!(buf.is_empty());
        assert!(buf.take(500).is_none());
        assert!(!buf.is_due(100_000, 1));
    }
}
