//! Round-robin pool of inference endpoints.

use crate::models::{ConfigError, Endpoint};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed, ordered set of endpoints with a shared round-robin cursor.
///
/// The cursor is the only mutable state. It is advanced with a single
/// atomic read-modify-write, so concurrent callers never observe the same
/// slot within one lap of the pool.
#[derive(Debug)]
pub struct BackendPool {
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl BackendPool {
    /// Create a pool. Fails if `endpoints` is empty.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::EmptyEndpointPool);
        }
        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Claim the next slot and return its index.
    pub fn next_index(&self) -> usize {
        let len = self.endpoints.len();
        // The closure never returns None, so both arms carry the previous value.
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Select the next endpoint in round-robin order.
    pub fn next(&self) -> &Endpoint {
        &self.endpoints[self.next_index()]
    }

    /// Look up an endpoint by name.
    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false: construction rejects an empty list.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn pool(size: usize) -> BackendPool {
        let endpoints = (0..size)
            .map(|i| Endpoint::new(format!("ep-{i}"), format!("http://localhost:{}/v1", 8000 + i)))
            .collect();
        BackendPool::new(endpoints).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let err = BackendPool::new(Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyEndpointPool));
    }

    #[test]
    fn test_round_robin_order() {
        let pool = pool(3);
        let names: Vec<&str> = (0..7).map(|_| pool.next().name.as_str()).collect();
        assert_eq!(names, ["ep-0", "ep-1", "ep-2", "ep-0", "ep-1", "ep-2", "ep-0"]);
    }

    #[test]
    fn test_round_robin_fairness() {
        for size in 1..=6 {
            for calls in size..(size * 5 + 3) {
                let pool = pool(size);
                let mut counts: HashMap<String, usize> = HashMap::new();
                for _ in 0..calls {
                    *counts.entry(pool.next().name.clone()).or_default() += 1;
                }

                let min = pool
                    .endpoints()
                    .iter()
                    .map(|e| counts.get(&e.name).copied().unwrap_or(0))
                    .min()
                    .unwrap();
                let max = counts.values().copied().max().unwrap();

                assert!(min >= calls / size, "size={size} calls={calls}");
                if calls % size == 0 {
                    assert_eq!(min, max, "size={size} calls={calls}");
                } else {
                    assert!(max - min <= 1, "size={size} calls={calls}");
                }
            }
        }
    }

    #[test]
    fn test_concurrent_selection_is_race_free() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;
        let pool = Arc::new(pool(4));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..PER_THREAD).map(|_| pool.next_index()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = [0usize; 4];
        for handle in handles {
            for idx in handle.join().unwrap() {
                counts[idx] += 1;
            }
        }

        // A lost or duplicated cursor update would skew these counts.
        assert_eq!(counts, [THREADS * PER_THREAD / 4; 4]);
    }

    #[test]
    fn test_lookup() {
        let pool = pool(2);
        assert_eq!(pool.len(), 2);
        assert!(!pool.is_empty());
        assert_eq!(pool.get("ep-1").map(|e| e.base_url.as_str()), Some("http://localhost:8001/v1"));
        assert!(pool.get("missing").is_none());
    }
}
