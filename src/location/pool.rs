use crate::location::{OrderedDistanceLocationIterator, WindowLocationIterator};

const POOL_LIMIT: usize = 8;

/// Per-node free list of reusable position iterators, keyed by shape.
/// `reevaluate` acquires one, seeds it with the children's occurrence
/// streams and either hands it to the caller or releases it back once the
/// position check is done.
#[derive(Default)]
pub struct LocationIteratorPool {
    ordered: Vec<OrderedDistanceLocationIterator>,
    windows: Vec<WindowLocationIterator>,
}

impl LocationIteratorPool {
    pub fn new() -> LocationIteratorPool {
        LocationIteratorPool::default()
    }

    pub fn acquire_ordered(&mut self) -> OrderedDistanceLocationIterator {
        self.ordered.pop().unwrap_or_default()
    }

    pub fn release_ordered(&mut self, mut iterator: OrderedDistanceLocationIterator) {
        if self.ordered.len() < POOL_LIMIT {
            iterator.clear();
            self.ordered.push(iterator);
        }
    }

    pub fn acquire_window(&mut self) -> WindowLocationIterator {
        self.windows.pop().unwrap_or_default()
    }

    pub fn release_window(&mut self, mut iterator: WindowLocationIterator) {
        if self.windows.len() < POOL_LIMIT {
            iterator.clear();
            self.windows.push(iterator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_up_to_its_limit() {
        let mut pool = LocationIteratorPool::new();
        let iterators: Vec<_> = (0..POOL_LIMIT + 2).map(|_| pool.acquire_ordered()).collect();
        for it in iterators {
            pool.release_ordered(it);
        }
        assert_eq!(pool.ordered.len(), POOL_LIMIT);
    }
}
