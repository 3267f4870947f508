use crate::location::LocationIterator;
use crate::Position;

/// Proximity matches between the members of a window node.
///
/// A match binds one occurrence of each child; the constrained span is
/// either the distance between the first and last start positions
/// (operator windows) or from the first start to the last end inclusive
/// (simple windows, whose bounds were rebased by `min + length - 1` at
/// conversion time). The span must fall within `[min, max]`; ordered
/// windows additionally require the children to occur in child order.
///
/// Matches are materialised up front: the member lists are term-frequency
/// sized, and a window never feeds another position-joining node in a
/// validated tree.
#[derive(Default)]
pub struct WindowLocationIterator {
    min: Position,
    max: Position,
    ordered: bool,
    end_span: bool,
    matches: Vec<(Position, Position)>,
    index: usize,
}

impl WindowLocationIterator {
    pub fn new() -> WindowLocationIterator {
        WindowLocationIterator::default()
    }

    pub fn clear(&mut self) {
        self.matches.clear();
        self.index = 0;
    }

    /// Configure the constraint and compute the matches of one document.
    pub fn build(
        &mut self,
        min: Position,
        max: Position,
        ordered: bool,
        end_span: bool,
        children: Vec<Box<dyn LocationIterator>>,
    ) {
        self.min = min;
        self.max = max;
        self.ordered = ordered;
        self.end_span = end_span;
        self.matches.clear();
        self.index = 0;

        let lists: Vec<Vec<(Position, Position)>> =
            children.into_iter().map(collect_occurrences).collect();
        if lists.iter().any(|l| l.is_empty()) {
            return;
        }

        if self.ordered {
            self.build_ordered(&lists);
        } else if lists.len() == 2 {
            self.build_unordered_pair(&lists[0], &lists[1]);
        } else {
            self.build_unordered_sweep(&lists);
        }
        self.matches.sort_unstable();
        self.matches.dedup();
    }

    fn span(&self, first: (Position, Position), last: (Position, Position)) -> Position {
        if self.end_span {
            // first start to last end, inclusive; a simple window over
            // terms of length L rebased an operator bound d to d + L - 1
            last.0 + last.1 - 1 - first.0
        } else {
            last.0 - first.0
        }
    }

    fn build_ordered(&mut self, lists: &[Vec<(Position, Position)>]) {
        // anchor on the first child, chain the others greedily
        let mut cursors = vec![0usize; lists.len()];
        'anchor: for &first in &lists[0] {
            let mut prev = first.0;
            for i in 1..lists.len() {
                let list = &lists[i];
                while cursors[i] < list.len() && list[cursors[i]].0 <= prev {
                    cursors[i] += 1;
                }
                if cursors[i] >= list.len() {
                    break 'anchor;
                }
                if i + 1 < lists.len() {
                    prev = list[cursors[i]].0;
                } else {
                    // trailing child also has to honour the lower bound
                    let mut j = cursors[i];
                    while j < list.len()
                        && (list[j].0 <= prev || self.span(first, list[j]) < self.min)
                    {
                        j += 1;
                    }
                    cursors[i] = j;
                    if j >= list.len() {
                        break 'anchor;
                    }
                    let last = list[j];
                    let span = self.span(first, last);
                    if span <= self.max {
                        self.matches.push((first.0, last.0 + last.1 - first.0));
                    }
                }
            }
        }
    }

    fn build_unordered_pair(
        &mut self,
        left: &[(Position, Position)],
        right: &[(Position, Position)],
    ) {
        for &a in left {
            for &b in right {
                if a.0 == b.0 {
                    continue;
                }
                let (first, last) = if a.0 < b.0 { (a, b) } else { (b, a) };
                let span = self.span(first, last);
                if span >= self.min && span <= self.max {
                    self.matches.push((first.0, last.0 + last.1 - first.0));
                }
            }
        }
    }

    /// Plane sweep over successive minimal windows; each candidate binds
    /// the currently smallest occurrence of every child.
    fn build_unordered_sweep(&mut self, lists: &[Vec<(Position, Position)>]) {
        let mut cursors = vec![0usize; lists.len()];
        loop {
            let mut first = (Position::MAX, 0);
            let mut last = (0, 0);
            let mut smallest = 0usize;
            for (i, list) in lists.iter().enumerate() {
                let occ = list[cursors[i]];
                if occ.0 < first.0 {
                    first = occ;
                    smallest = i;
                }
                if occ.0 > last.0 {
                    last = occ;
                }
            }
            let span = self.span(first, last);
            if span >= self.min && span <= self.max {
                self.matches.push((first.0, last.0 + last.1 - first.0));
            }
            cursors[smallest] += 1;
            if cursors[smallest] >= lists[smallest].len() {
                return;
            }
        }
    }
}

fn collect_occurrences(mut iterator: Box<dyn LocationIterator>) -> Vec<(Position, Position)> {
    let mut out = Vec::new();
    while !iterator.is_end() {
        out.push((iterator.location(), iterator.length()));
        iterator.next();
    }
    out
}

impl LocationIterator for WindowLocationIterator {
    fn is_end(&self) -> bool {
        self.index >= self.matches.len()
    }

    fn next(&mut self) {
        if self.index < self.matches.len() {
            self.index += 1;
        }
    }

    fn location(&self) -> Position {
        self.matches.get(self.index).map(|&(p, _)| p).unwrap_or(0)
    }

    fn length(&self) -> Position {
        self.matches.get(self.index).map(|&(_, l)| l).unwrap_or(0)
    }

    fn frequency(&self) -> crate::TermFrequency {
        self.matches.len() as crate::TermFrequency
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::VecLocationIterator;

    fn boxed(positions: Vec<Position>) -> Box<dyn LocationIterator> {
        Box::new(VecLocationIterator::new(positions, 1))
    }

    #[test]
    fn unordered_pair_within_bounds() {
        // A at 5, B at 7, start distance 2 within [1, 3]
        let mut it = WindowLocationIterator::new();
        it.build(1, 3, false, false, vec![boxed(vec![5]), boxed(vec![7])]);
        assert!(!it.is_end());
        assert_eq!(it.location(), 5);
        it.next();
        assert!(it.is_end());

        // B at 9 is 4 apart, out of bounds
        it.build(1, 3, false, false, vec![boxed(vec![5]), boxed(vec![9])]);
        assert!(it.is_end());
    }

    #[test]
    fn unordered_pair_ignores_order() {
        let mut it = WindowLocationIterator::new();
        it.build(1, 3, false, false, vec![boxed(vec![7]), boxed(vec![5])]);
        assert!(!it.is_end());
    }

    #[test]
    fn ordered_rejects_reversed() {
        let mut it = WindowLocationIterator::new();
        it.build(1, 3, true, false, vec![boxed(vec![7]), boxed(vec![5])]);
        assert!(it.is_end());
        it.build(1, 3, true, false, vec![boxed(vec![5]), boxed(vec![7])]);
        assert!(!it.is_end());
    }

    #[test]
    fn lower_bound_skips_too_close() {
        let mut it = WindowLocationIterator::new();
        it.build(3, 10, true, false, vec![boxed(vec![5]), boxed(vec![6, 9])]);
        // 6 is only 1 away; 9 satisfies the lower bound
        assert!(!it.is_end());
        assert_eq!(it.location(), 5);
        assert_eq!(it.length(), 5);
        it.next();
        assert!(it.is_end());
    }

    #[test]
    fn end_span_counts_inclusive_width() {
        // tokens of length 2: occurrences at 5 and 8 span chars 5..=9,
        // a start distance of 3 rebased by the token length minus one
        let a = Box::new(VecLocationIterator::new(vec![5], 2));
        let b = Box::new(VecLocationIterator::new(vec![8], 2));
        let mut it = WindowLocationIterator::new();
        it.build(4, 4, false, true, vec![a, b]);
        assert!(!it.is_end());
        assert_eq!((it.location(), it.length()), (5, 5));

        let a = Box::new(VecLocationIterator::new(vec![5], 2));
        let b = Box::new(VecLocationIterator::new(vec![8], 2));
        let mut it = WindowLocationIterator::new();
        it.build(5, 5, false, true, vec![a, b]);
        assert!(it.is_end());
    }

    #[test]
    fn three_way_sweep_finds_tight_window() {
        let mut it = WindowLocationIterator::new();
        it.build(
            1,
            4,
            false,
            false,
            vec![boxed(vec![1, 10]), boxed(vec![12]), boxed(vec![3, 14])],
        );
        assert!(!it.is_end());
        assert_eq!(it.location(), 10);
    }
}
