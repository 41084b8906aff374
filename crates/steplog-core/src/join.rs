//! Merge-join of step-ordered sequences.

use core::iter::Peekable;

/// Iterator over the steps at which every source has a value.
///
/// Each source must yield `(step, value)` pairs with strictly ascending
/// steps. The join yields `(step, [v1, .., vK])` for each step present in
/// all K sources and stops as soon as any source is exhausted. With no
/// sources it yields nothing.
pub struct MergeJoin<I: Iterator> {
    sources: Vec<Peekable<I>>,
}

impl<I, V> MergeJoin<I>
where
    I: Iterator<Item = (u64, V)>,
{
    /// Join the given sources.
    pub fn new(sources: impl IntoIterator<Item = I>) -> Self {
        Self {
            sources: sources.into_iter().map(Iterator::peekable).collect(),
        }
    }
}

impl<I, V> Iterator for MergeJoin<I>
where
    I: Iterator<Item = (u64, V)>,
{
    type Item = (u64, Vec<V>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.sources.is_empty() {
            return None;
        }
        loop {
            let mut target = 0_u64;
            for source in &mut self.sources {
                let (step, _) = source.peek()?;
                target = target.max(*step);
            }
            let mut aligned = true;
            for source in &mut self.sources {
                while source.peek()?.0 < target {
                    source.next();
                }
                if source.peek()?.0 != target {
                    aligned = false;
                }
            }
            if aligned {
                let values = self
                    .sources
                    .iter_mut()
                    .map(|s| s.next().map(|(_, v)| v))
                    .collect::<Option<Vec<V>>>()?;
                return Some((target, values));
            }
        }
    }
}

/// Join `sources` by step. See [`MergeJoin`].
pub fn merge_join<I, V>(sources: impl IntoIterator<Item = I>) -> MergeJoin<I::IntoIter>
where
    I: IntoIterator<Item = (u64, V)>,
{
    MergeJoin::new(sources.into_iter().map(IntoIterator::into_iter))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn yields_only_common_steps() {
        let a = vec![(0, 'a'), (1, 'b'), (2, 'c'), (4, 'd'), (5, 'e')];
        let b = vec![(0, 'A'), (2, 'C'), (4, 'D'), (6, 'F')];
        let c = vec![(2, 'x'), (3, 'y'), (4, 'z')];
        let joined: Vec<_> = merge_join([a, b, c]).collect();
        assert_eq!(joined, vec![(2, vec!['c', 'C', 'x']), (4, vec!['d', 'D', 'z'])]);
    }

    #[test]
    fn empty_inputs() {
        let none: Vec<Vec<(u64, f64)>> = Vec::new();
        assert_eq!(merge_join(none).count(), 0);
        let one_empty = vec![vec![(0_u64, 1.0)], Vec::new()];
        assert_eq!(merge_join(one_empty).count(), 0);
    }

    #[test]
    fn single_source_passes_through() {
        let joined: Vec<_> = merge_join([vec![(3_u64, 1), (7, 2)]]).collect();
        assert_eq!(joined, vec![(3, vec![1]), (7, vec![2])]);
    }

    #[test]
    fn output_is_ascending_with_full_rows() {
        let a: Vec<(u64, u64)> = (0..50).step_by(3).map(|s| (s, s)).collect();
        let b: Vec<(u64, u64)> = (0..50).step_by(2).map(|s| (s, s)).collect();
        let joined: Vec<_> = merge_join([a, b]).collect();
        assert!(joined.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(joined.iter().all(|(step, values)| values.len() == 2 && step % 6 == 0));
        assert_eq!(joined.len(), 9);
    }
}
