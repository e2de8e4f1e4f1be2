//! Byte counters shared between an I/O thread and its readers

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative byte count with an extract-and-reset read
#[derive(Debug, Default)]
pub struct ByteCounter {
    bytes: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Current value without resetting
    pub fn peek(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Bytes counted since the previous extraction
    pub fn extract_and_reset(&self) -> u64 {
        self.bytes.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_extract_resets() {
        let counter = ByteCounter::new();
        counter.add(52);
        counter.add(10);
        assert_eq!(counter.peek(), 62);
        assert_eq!(counter.extract_and_reset(), 62);
        assert_eq!(counter.extract_and_reset(), 0);
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let counter = Arc::new(ByteCounter::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.add(3);
                    }
                })
            })
            .collect();

        let mut extracted = 0;
        for worker in workers {
            extracted += counter.extract_and_reset();
            worker.join().unwrap();
        }
        extracted += counter.extract_and_reset();
        assert_eq!(extracted, 12_000);
    }
}
