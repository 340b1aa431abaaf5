//! Frames waiting for a live connection.

use std::collections::VecDeque;

/// Bounded FIFO of ready-to-send text frames.
///
/// Frames are encrypted before they enter, so nothing here needs the key.
/// Over capacity the oldest frame is dropped.
#[derive(Debug)]
pub struct Outbox {
    frames: VecDeque<String>,
    cap: usize,
}

impl Outbox {
    /// Empty outbox holding at most `cap` frames (at least one).
    #[must_use]
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            frames: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    /// Append a frame; returns the frame evicted to make room, if any.
    pub fn push(&mut self, frame: String) -> Option<String> {
        let evicted = if self.frames.len() >= self.cap {
            self.frames.pop_front()
        } else {
            None
        };
        if evicted.is_some() {
            tracing::warn!(cap = self.cap, "outbound queue full, dropping oldest message");
        }
        self.frames.push_back(frame);
        evicted
    }

    /// Put back a frame whose write failed so it goes out first next time.
    pub fn requeue(&mut self, frame: String) {
        self.frames.push_front(frame);
        if self.frames.len() > self.cap {
            self.frames.pop_back();
            tracing::warn!(cap = self.cap, "outbound queue full, dropping newest message");
        }
    }

    /// Next frame to send.
    pub fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    /// Number of waiting frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
