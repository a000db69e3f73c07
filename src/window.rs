use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Fixed-capacity FIFO of samples with a running arithmetic mean.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SlidingWindow {
    /// An empty window. The mean covers only the samples pushed so far.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// A window pre-filled with `capacity` zeros, so early means are
    /// diluted until real samples have evicted all of the padding.
    pub fn zero_filled(capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        window.samples.resize(window.capacity, 0.0);
        window
    }

    /// Append a sample, evicting the oldest one if the window overflows.
    pub fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        if self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn mean(&self) -> Result<f64> {
        if self.is_empty() {
            return Err(Error::EmptyWindow);
        }
        Ok(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
