use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fixed-capacity sample of a stream of counts.
///
/// Values are appended until the capacity is reached, after that each new
/// value replaces a randomly chosen slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservoirSample {
    pub data: Vec<u64>,
    pub cap: usize,
}

impl ReservoirSample {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Add a value and return the resulting sample size
    pub fn add(&mut self, value: u64) -> usize {
        if self.cap == 0 {
            return 0;
        }
        if self.data.len() < self.cap {
            self.data.push(value);
        } else {
            let idx = rand::rng().random_range(0..self.data.len());
            self.data[idx] = value;
        }
        self.data.len()
    }

    /// Change capacity, a shrinking sample keeps its oldest values
    pub fn resize(&mut self, cap: usize) {
        if cap < self.data.len() {
            self.data.truncate(cap);
        }
        self.cap = cap;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        let sum: u64 = self.data.iter().sum();
        Some(sum as f64 / self.data.len() as f64)
    }
}
