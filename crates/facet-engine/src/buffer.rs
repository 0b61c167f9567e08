//! Bounded in-memory ingestion buffer.
//!
//! The buffer is the only structure shared between arbitrary-time collects
//! and the periodic drain; every append and drain holds the same mutex, so
//! a drain removes its whole batch atomically and a concurrent collect can
//! never observe a half-drained queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use facet_core::RawRecord;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::warn;

/// Capacity bound for the ingestion buffer.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BufferConfig {
    /// Maximum records held; the oldest record is dropped on overflow.
    #[serde(default = "BufferConfig::default_capacity")]
    pub capacity: usize,
}

impl BufferConfig {
    const fn default_capacity() -> usize {
        10_000
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

/// FIFO queue of raw records awaiting the cleaning step.
pub struct IngestionBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<RawRecord>>,
    dropped: AtomicU64,
}

impl IngestionBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append one record. On overflow the oldest record is dropped so the
    /// freshest data survives; returns false when that happened.
    pub fn push(&self, record: RawRecord) -> bool {
        let displaced = {
            let mut queue = self.queue.lock();
            let displaced = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(record);
            displaced
        };
        if let Some(old) = displaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                source = %old.source,
                capacity = self.capacity,
                "ingestion buffer full, dropped oldest record"
            );
            return false;
        }
        true
    }

    /// Atomically remove up to `batch_size` oldest records.
    pub fn drain(&self, batch_size: usize) -> Vec<RawRecord> {
        let mut queue = self.queue.lock();
        let take = batch_size.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Total records dropped to the overflow policy since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for IngestionBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facet_core::{FieldMap, SourceId};
    use std::sync::Arc;

    fn record(n: i64) -> RawRecord {
        let mut fields = FieldMap::new();
        fields.insert("n".into(), serde_json::json!(n));
        RawRecord::new(SourceId::new("s1"), n, fields)
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let buffer = IngestionBuffer::default();
        for n in 0..5 {
            assert!(buffer.push(record(n)));
        }
        let batch = buffer.drain(3);
        let seen: Vec<i64> = batch.iter().map(|r| r.ingested_at_ms).collect();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn drain_beyond_len_takes_everything() {
        let buffer = IngestionBuffer::default();
        buffer.push(record(1));
        assert_eq!(buffer.drain(100).len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let buffer = IngestionBuffer::new(BufferConfig { capacity: 2 });
        assert!(buffer.push(record(0)));
        assert!(buffer.push(record(1)));
        assert!(!buffer.push(record(2)));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped_total(), 1);
        let remaining: Vec<i64> = buffer.drain(10).iter().map(|r| r.ingested_at_ms).collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[test]
    fn concurrent_collect_and_drain_conserve_records() {
        let buffer = Arc::new(IngestionBuffer::new(BufferConfig { capacity: 100_000 }));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for n in 0..500 {
                        buffer.push(record(w * 1_000 + n));
                    }
                })
            })
            .collect();

        let drainer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let mut drained = 0usize;
                for _ in 0..200 {
                    drained += buffer.drain(17).len();
                    std::thread::yield_now();
                }
                drained
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        let drained = drainer.join().unwrap();
        assert_eq!(drained + buffer.len(), 2_000);
        assert_eq!(buffer.dropped_total(), 0);
    }
}
