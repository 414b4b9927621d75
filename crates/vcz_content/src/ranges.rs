//! A sorted set of non-overlapping, half-open intervals.
//!
//! Used wherever partial byte spans must be unioned, subtracted or measured,
//! for example which bytes of a chunk were already received from peers.
use std::{
    fmt::Debug,
    iter,
    ops::{Add, Sub},
};

/// Sorted, non-overlapping and non-touching `[first, second)` intervals.
///
/// For any two stored intervals `a` before `b`: `a.1 < b.0`, and every
/// interval has `first < second`. Intervals that touch are always merged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ranges<K> {
    inner: Vec<(K, K)>,
}

impl<K> Default for Ranges<K> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<K: Copy + Ord + Debug> Ranges<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[first, second)` to the set, merging with every interval it
    /// overlaps or touches.
    ///
    /// # Panics
    /// If `first >= second`.
    pub fn insert(&mut self, first: K, second: K) {
        assert!(
            first < second,
            "tried to insert the empty interval {first:?}..{second:?}"
        );

        // leftmost interval that reaches `first`, a touch counts.
        let left = self.inner.partition_point(|r| r.1 < first);
        // one past the rightmost interval that reaches `second`.
        let right = self.inner.partition_point(|r| r.0 <= second);

        if left == right {
            self.inner.insert(left, (first, second));
            return;
        }

        // everything in left..right is subsumed by the new interval, only
        // the outer endpoints can stick out of it.
        let merged = (
            first.min(self.inner[left].0),
            second.max(self.inner[right - 1].1),
        );

        self.inner.splice(left..right, iter::once(merged));
    }

    /// Remove `[first, second)` from the set. Intervals partially covered are
    /// truncated, and an interval strictly containing the erased span is
    /// split in two.
    ///
    /// # Panics
    /// If `first >= second`.
    pub fn erase(&mut self, first: K, second: K) {
        assert!(
            first < second,
            "tried to erase the empty interval {first:?}..{second:?}"
        );

        let left = self.inner.partition_point(|r| r.1 <= first);
        let right = self.inner.partition_point(|r| r.0 < second);

        if left >= right {
            return;
        }

        let head = self.inner[left];
        let tail = self.inner[right - 1];

        let mut survivors = Vec::with_capacity(2);

        if head.0 < first {
            survivors.push((head.0, first));
        }
        if tail.1 > second {
            survivors.push((second, tail.1));
        }

        self.inner.splice(left..right, survivors);
    }

    /// The first interval whose end lies after `key`.
    pub fn find(&self, key: K) -> Option<(K, K)> {
        let i = self.inner.partition_point(|r| r.1 <= key);
        self.inner.get(i).copied()
    }

    pub fn has(&self, key: K) -> bool {
        self.find(key).is_some_and(|r| key >= r.0)
    }

    /// If a single interval contains all of `[first, second)`.
    pub fn covers(&self, first: K, second: K) -> bool {
        self.find(first).is_some_and(|r| r.0 <= first && second <= r.1)
    }

    /// Remove from `self` every key that is present in `other`.
    ///
    /// Only `self` is mutated.
    pub fn intersect(&mut self, other: &Ranges<K>) {
        for &(first, second) in other.iter() {
            self.erase(first, second);
        }
    }

    /// Add to `self` every key that is present in `other`.
    pub fn union(&mut self, other: &Ranges<K>) {
        for &(first, second) in other.iter() {
            self.insert(first, second);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (K, K)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<K> Ranges<K>
where
    K: Copy + Ord + Debug + Default + Add<Output = K> + Sub<Output = K>,
{
    /// How many keys the set holds.
    pub fn covered(&self) -> K {
        self.inner.iter().fold(K::default(), |acc, r| acc + (r.1 - r.0))
    }
}

impl<'a, K> IntoIterator for &'a Ranges<K> {
    type Item = &'a (K, K);
    type IntoIter = std::slice::Iter<'a, (K, K)>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn assert_normalized(ranges: &Ranges<u32>) {
        for r in ranges.iter() {
            assert!(r.0 < r.1, "empty interval {r:?} in {ranges:?}");
        }
        for pair in ranges.inner.windows(2) {
            assert!(
                pair[0].1 < pair[1].0,
                "{:?} and {:?} touch or overlap",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn insert_erase_walkthrough() {
        let mut r = Ranges::<u32>::new();

        r.insert(10, 20);
        r.insert(30, 40);
        assert!(r.has(10));
        assert!(!r.has(20));
        assert!(r.has(30));
        assert!(!r.has(40));

        r.insert(0, 5);
        assert!(r.has(2));
        assert!(!r.has(5));
        assert!(r.has(10));

        r.insert(45, 60);
        r.erase(15, 55);
        assert_normalized(&r);
        assert_eq!(r.len(), 3);
        assert!(r.has(14));
        assert!(!r.has(15));
        assert!(!r.has(54));
        assert!(r.has(55));

        r.insert(5, 60);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(0, 60)]);
    }

    #[test]
    fn touching_intervals_merge() {
        let mut r = Ranges::<u32>::new();
        r.insert(0, 10);
        r.insert(10, 20);
        assert_eq!(r.len(), 1);
        assert_eq!(r.find(0), Some((0, 20)));

        // touching on the left side of an existing interval.
        r.insert(30, 40);
        r.insert(25, 30);
        assert_eq!(r.len(), 2);
        assert_eq!(r.find(21), Some((25, 40)));

        // bridging two intervals by touching both.
        r.insert(20, 25);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(0, 40)]);
    }

    #[test]
    fn disjoint_intervals_stay_apart() {
        let mut r = Ranges::<u32>::new();
        r.insert(0, 10);
        r.insert(11, 20);
        assert_eq!(r.len(), 2);
        assert!(!r.has(10));
        assert_normalized(&r);
    }

    #[test]
    fn overlapping_insert_covers_both() {
        let mut r = Ranges::<u32>::new();
        r.insert(10, 30);
        r.insert(5, 15);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(5, 30)]);

        r.insert(25, 50);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(5, 50)]);

        // already contained, nothing changes.
        r.insert(6, 49);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(5, 50)]);
    }

    #[test]
    fn insert_spanning_many() {
        let mut r = Ranges::<u32>::new();
        for i in 0..10 {
            r.insert(i * 10, i * 10 + 5);
        }
        assert_eq!(r.len(), 10);

        r.insert(12, 77);
        assert_normalized(&r);
        assert_eq!(
            r.iter().copied().collect::<Vec<_>>(),
            vec![(0, 5), (10, 77), (80, 85), (90, 95)]
        );
    }

    #[test]
    fn erase_splits_and_truncates() {
        let mut r = Ranges::<u32>::new();
        r.insert(0, 100);

        r.erase(40, 60);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![
            (0, 40),
            (60, 100)
        ]);

        // exact touches on both sides leave the survivors alone.
        r.erase(40, 60);
        assert_eq!(r.len(), 2);

        r.erase(30, 70);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![
            (0, 30),
            (70, 100)
        ]);

        r.erase(0, 30);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(70, 100)]);

        r.erase(0, 200);
        assert!(r.is_empty());

        // erasing from an empty set is fine.
        r.erase(1, 2);
        assert!(r.is_empty());
    }

    #[test]
    fn erase_then_insert_restores() {
        let mut r = Ranges::<u32>::new();
        r.insert(0, 10);
        r.insert(20, 30);
        let before = r.clone();

        r.erase(5, 25);
        r.insert(5, 25);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![(0, 30)]);

        // keys outside of the erased span keep their previous state.
        for k in 0..40 {
            if !(5..25).contains(&k) {
                assert_eq!(r.has(k), before.has(k), "key {k}");
            }
        }
    }

    #[test]
    fn find_and_covers() {
        let mut r = Ranges::<u32>::new();
        r.insert(10, 20);
        r.insert(30, 40);

        assert_eq!(r.find(0), Some((10, 20)));
        assert_eq!(r.find(20), Some((30, 40)));
        assert_eq!(r.find(40), None);

        assert!(r.covers(10, 20));
        assert!(r.covers(12, 15));
        assert!(!r.covers(15, 35));
        assert!(!r.covers(0, 5));
    }

    #[test]
    fn intersect_subtracts_other() {
        let mut a = Ranges::<u32>::new();
        a.insert(0, 100);

        let mut b = Ranges::<u32>::new();
        b.insert(10, 20);
        b.insert(50, 150);

        a.intersect(&b);
        assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![
            (0, 10),
            (20, 50)
        ]);
        // the argument is untouched.
        assert_eq!(b.len(), 2);

        a.union(&b);
        assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![(0, 150)]);
        assert_eq!(a.covered(), 150);
    }

    #[test]
    #[should_panic]
    fn inverted_insert_panics() {
        Ranges::<u32>::new().insert(5, 5);
    }

    #[test]
    #[should_panic]
    fn inverted_erase_panics() {
        Ranges::<u32>::new().erase(6, 5);
    }

    // random operations checked against a plain array of keys.
    #[test]
    fn matches_model() {
        const KEYS: u32 = 64;
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let mut r = Ranges::<u32>::new();
            let mut model = [false; KEYS as usize];

            for _ in 0..100 {
                let first = rng.gen_range(0..KEYS - 1);
                let second = rng.gen_range(first + 1..=KEYS);

                if rng.gen_bool(0.6) {
                    r.insert(first, second);
                    model[first as usize..second as usize].fill(true);
                } else {
                    r.erase(first, second);
                    model[first as usize..second as usize].fill(false);
                }

                assert_normalized(&r);

                for k in 0..KEYS {
                    assert_eq!(r.has(k), model[k as usize], "key {k}");
                }
                assert_eq!(
                    r.covered(),
                    model.iter().filter(|v| **v).count() as u32
                );
            }
        }
    }
}
