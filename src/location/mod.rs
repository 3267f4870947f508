use crate::{Position, TermFrequency};

mod ordered_distance;
mod pool;
mod window;

pub use self::ordered_distance::OrderedDistanceLocationIterator;
pub use self::pool::LocationIteratorPool;
pub use self::window::WindowLocationIterator;

/// A lazy, restartable walk over the `(position, length)` occurrences of one
/// term (or phrase) inside one document. Positions are 1-based.
pub trait LocationIterator: Send {
    fn is_end(&self) -> bool;

    /// Move to the next occurrence. Calling it at the end is a no-op.
    fn next(&mut self);

    /// Start position of the current occurrence. Unspecified at the end.
    fn location(&self) -> Position;

    /// Character length of the current occurrence.
    fn length(&self) -> Position;

    /// One past the last position covered by the current occurrence.
    fn end_location(&self) -> Position {
        self.location() + self.length()
    }

    /// Number of occurrences, when cheap to know. 0 means "unknown,
    /// iterate to count".
    fn frequency(&self) -> TermFrequency {
        0
    }

    fn reset(&mut self);
}

/// Occurrences backed by a plain position vector, all sharing one length.
pub struct VecLocationIterator {
    positions: Vec<Position>,
    length: Position,
    index: usize,
}

impl VecLocationIterator {
    pub fn new(positions: Vec<Position>, length: Position) -> VecLocationIterator {
        VecLocationIterator { positions, length, index: 0 }
    }
}

impl LocationIterator for VecLocationIterator {
    fn is_end(&self) -> bool {
        self.index >= self.positions.len()
    }

    fn next(&mut self) {
        if self.index < self.positions.len() {
            self.index += 1;
        }
    }

    fn location(&self) -> Position {
        self.positions.get(self.index).copied().unwrap_or(0)
    }

    fn length(&self) -> Position {
        self.length
    }

    fn frequency(&self) -> TermFrequency {
        self.positions.len() as TermFrequency
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

/// Occurrences carrying an individual length each, used by regex matches
/// and filtered word-mode matches.
pub struct SpanLocationIterator {
    spans: Vec<(Position, Position)>,
    index: usize,
}

impl SpanLocationIterator {
    pub fn new(spans: Vec<(Position, Position)>) -> SpanLocationIterator {
        SpanLocationIterator { spans, index: 0 }
    }
}

impl LocationIterator for SpanLocationIterator {
    fn is_end(&self) -> bool {
        self.index >= self.spans.len()
    }

    fn next(&mut self) {
        if self.index < self.spans.len() {
            self.index += 1;
        }
    }

    fn location(&self) -> Position {
        self.spans.get(self.index).map(|&(p, _)| p).unwrap_or(0)
    }

    fn length(&self) -> Position {
        self.spans.get(self.index).map(|&(_, l)| l).unwrap_or(0)
    }

    fn frequency(&self) -> TermFrequency {
        self.spans.len() as TermFrequency
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

/// K-way merge of child occurrence streams by ascending position, emitting
/// each position once. Backs the union side of disjunctive nodes.
pub struct OrLocationIterator {
    children: Vec<Box<dyn LocationIterator>>,
    current: Option<(Position, Position)>,
}

impl OrLocationIterator {
    pub fn new(children: Vec<Box<dyn LocationIterator>>) -> OrLocationIterator {
        let mut iterator = OrLocationIterator { children, current: None };
        iterator.align();
        iterator
    }

    fn align(&mut self) {
        let mut best: Option<(Position, Position)> = None;
        for child in &self.children {
            if child.is_end() {
                continue;
            }
            let candidate = (child.location(), child.length());
            match best {
                Some((loc, _)) if candidate.0 >= loc => (),
                _ => best = Some(candidate),
            }
        }
        self.current = best;
    }
}

impl LocationIterator for OrLocationIterator {
    fn is_end(&self) -> bool {
        self.current.is_none()
    }

    fn next(&mut self) {
        if let Some((loc, _)) = self.current {
            for child in &mut self.children {
                while !child.is_end() && child.location() <= loc {
                    child.next();
                }
            }
            self.align();
        }
    }

    fn location(&self) -> Position {
        self.current.map(|(p, _)| p).unwrap_or(0)
    }

    fn length(&self) -> Position {
        self.current.map(|(_, l)| l).unwrap_or(0)
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.align();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut it: impl LocationIterator) -> Vec<(Position, Position)> {
        let mut out = Vec::new();
        while !it.is_end() {
            out.push((it.location(), it.length()));
            it.next();
        }
        out
    }

    #[test]
    fn vec_iterator_walks_and_resets() {
        let mut it = VecLocationIterator::new(vec![3, 8, 21], 2);
        assert_eq!(it.frequency(), 3);
        assert_eq!((it.location(), it.end_location()), (3, 5));
        it.next();
        it.next();
        assert_eq!(it.location(), 21);
        it.next();
        assert!(it.is_end());
        it.reset();
        assert_eq!(it.location(), 3);
    }

    #[test]
    fn or_iterator_merges_and_dedups() {
        let a = Box::new(VecLocationIterator::new(vec![1, 5, 9], 1));
        let b = Box::new(VecLocationIterator::new(vec![5, 7], 1));
        let merged = OrLocationIterator::new(vec![a, b]);
        let positions: Vec<_> = drain(merged).into_iter().map(|(p, _)| p).collect();
        assert_eq!(positions, vec![1, 5, 7, 9]);
    }
}
