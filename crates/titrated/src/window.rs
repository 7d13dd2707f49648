//! Fixed-capacity ring of queue occupancy samples.
//!
//! Only the sampler touches the window, so it carries no synchronization.

/// Circular buffer of raw occupancy samples in bits.
///
/// Once full, each push overwrites the oldest sample.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: Vec<u64>,
    head: usize,
    filled: usize,
}

impl SampleWindow {
    /// Allocates a window holding `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity.max(1)],
            head: 0,
            filled: 0,
        }
    }

    /// Maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Inserts a sample at the head and advances it.
    pub fn push(&mut self, bits: u64) {
        self.samples[self.head] = bits;
        self.head = (self.head + 1) % self.samples.len();
        if self.filled < self.samples.len() {
            self.filled += 1;
        }
    }

    /// Iterates over held samples, most recent first.
    pub fn recent(&self) -> impl Iterator<Item = u64> + '_ {
        let capacity = self.samples.len();
        (0..self.filled).map(move |i| self.samples[(self.head + capacity - i - 1) % capacity])
    }

    /// Unweighted mean of the held samples, truncated. Zero when empty.
    pub fn simple_average(&self) -> u64 {
        if self.filled == 0 {
            return 0;
        }
        let sum: u128 = self.recent().map(u128::from).sum();
        (sum / self.filled as u128) as u64
    }

    /// Mean of the samples strictly below twice `simple_average`.
    ///
    /// When no sample qualifies the divisor is forced to one, which yields
    /// zero rather than the simple average.
    pub fn filtered_average(&self, simple_average: u64) -> u64 {
        let cutoff = simple_average.saturating_mul(2);
        let (sum, count) = self
            .recent()
            .filter(|&bits| bits < cutoff)
            .fold((0u128, 0u128), |(sum, count), bits| {
                (sum + u128::from(bits), count + 1)
            });
        (sum / count.max(1)) as u64
    }
}
