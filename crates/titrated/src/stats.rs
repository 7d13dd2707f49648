//! Shared Stats Cell.
//!
//! The only state shared between the sampler and the reporter. The sampler
//! swaps in a complete [`Averages`] snapshot each tick; readers load
//! whichever snapshot is current, so a simple/filtered pair always comes
//! from one completed tick.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Averages computed over the sample window in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Averages {
    /// Unweighted mean, bits.
    pub simple: u64,
    /// Outlier-filtered mean, bits. Adaptive policy only.
    pub filtered: Option<u64>,
}

impl Averages {
    /// Value written back to the datapath: filtered when present, else simple.
    pub fn feedback(&self) -> u64 {
        self.filtered.unwrap_or(self.simple)
    }
}

/// Lock-free holder of the latest [`Averages`].
#[derive(Debug)]
pub struct SharedStats {
    current: ArcSwap<Averages>,
}

impl SharedStats {
    /// Creates a cell holding zeroed averages.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Averages::default()),
        }
    }

    /// Replaces the current snapshot. Called by the sampler only.
    pub fn publish(&self, averages: Averages) {
        self.current.store(Arc::new(averages));
    }

    /// Copy of the latest published snapshot.
    #[inline]
    pub fn snapshot(&self) -> Averages {
        **self.current.load()
    }
}

impl Default for SharedStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_starts_zeroed() {
        let stats = SharedStats::new();
        assert_eq!(stats.snapshot(), Averages::default());
    }

    #[test]
    fn test_feedback_prefers_filtered() {
        let adaptive = Averages {
            simple: 300,
            filtered: Some(120),
        };
        assert_eq!(adaptive.feedback(), 120);

        let simple_only = Averages {
            simple: 300,
            filtered: None,
        };
        assert_eq!(simple_only.feedback(), 300);
    }

    #[test]
    fn test_publish_then_snapshot() {
        let stats = SharedStats::new();
        let averages = Averages {
            simple: 42,
            filtered: Some(40),
        };
        stats.publish(averages);
        assert_eq!(stats.snapshot(), averages);
    }

    #[test]
    fn test_concurrent_pairs_are_consistent() {
        const WRITES: u64 = 10_000;

        let stats = Arc::new(SharedStats::new());
        stats.publish(Averages {
            simple: 0,
            filtered: Some(0),
        });
        let writer_stats = Arc::clone(&stats);

        // Tick n publishes (n, n * 3); a torn read would break the relation.
        let writer = thread::spawn(move || {
            for n in 1..=WRITES {
                writer_stats.publish(Averages {
                    simple: n,
                    filtered: Some(n * 3),
                });
            }
        });

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..WRITES {
                        let snapshot = stats.snapshot();
                        assert_eq!(snapshot.filtered, Some(snapshot.simple * 3));
                        assert!(snapshot.simple >= last_seen, "snapshots went backwards");
                        last_seen = snapshot.simple;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(stats.snapshot().simple, WRITES);
    }
}
