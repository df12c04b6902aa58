//! Double ended priority queue with O(1) access to both the minimum and the maximum.
//!
//! Elements live in an implicit binary tree stored in a `Vec`. Nodes at even
//! depth (the root included) are smaller than or equal to every element below
//! them, nodes at odd depth are greater than or equal to every element below them.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

pub struct MinMaxHeap<T> {
    items: Vec<T>,
    compare: Comparator<T>,
}

impl<T> MinMaxHeap<T> {
    /// Create an empty heap ordered by `compare`.
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self {
            items: Vec::new(),
            compare: Box::new(compare),
        }
    }

    /// Create a heap ordered by `compare` holding `items`.
    pub fn with_items<F, I>(compare: F, items: I) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        let mut heap = Self::new(compare);
        heap.add_many(items);
        heap
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek_min(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn peek_max(&self) -> Option<&T> {
        self.max_index().map(|i| &self.items[i])
    }

    /// Iterates the elements in no particular order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    // === Public Methods ===

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.bubble_up(self.items.len() - 1);
    }

    /// Adds all `items` and rebuilds the heap in linear time.
    pub fn add_many<I: IntoIterator<Item = T>>(&mut self, items: I) {
        self.items.extend(items);
        self.rebuild();
    }

    pub fn pop_min(&mut self) -> Option<T> {
        self.remove_at(0)
    }

    pub fn pop_max(&mut self) -> Option<T> {
        let index = self.max_index()?;
        self.remove_at(index)
    }

    /// Replaces the ordering and rebuilds the heap.
    pub fn set_comparator<F>(&mut self, compare: F)
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.compare = Box::new(compare);
        self.rebuild();
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drains the heap from the minimum up.
    pub fn into_sorted_vec(mut self) -> Vec<T> {
        let mut sorted = Vec::with_capacity(self.items.len());
        while let Some(item) = self.pop_min() {
            sorted.push(item);
        }
        sorted
    }

    // === Private Methods ===

    fn less(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.items[a], &self.items[b]) == Ordering::Less
    }

    fn greater(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.items[a], &self.items[b]) == Ordering::Greater
    }

    fn max_index(&self) -> Option<usize> {
        match self.items.len() {
            0 => None,
            1 => Some(0),
            2 => Some(1),
            _ => {
                if self.less(1, 2) {
                    Some(2)
                } else {
                    Some(1)
                }
            }
        }
    }

    fn rebuild(&mut self) {
        for i in (0..self.items.len() / 2).rev() {
            self.trickle_down(i);
        }
    }

    fn remove_at(&mut self, index: usize) -> Option<T> {
        if index >= self.items.len() {
            return None;
        }

        let removed = self.items.swap_remove(index);
        if index < self.items.len() {
            // Whatever ends up at `index` after the bubble up is consistent with
            // its ancestors, only its own subtree may still be out of order.
            self.bubble_up(index);
            self.trickle_down(index);
        }

        Some(removed)
    }

    fn bubble_up(&mut self, i: usize) {
        if i == 0 {
            return;
        }

        let parent = (i - 1) / 2;

        if is_min_level(i) {
            if self.greater(i, parent) {
                self.items.swap(i, parent);
                self.bubble_up_by(parent, Ordering::Greater);
            } else {
                self.bubble_up_by(i, Ordering::Less);
            }
        } else if self.less(i, parent) {
            self.items.swap(i, parent);
            self.bubble_up_by(parent, Ordering::Less);
        } else {
            self.bubble_up_by(i, Ordering::Greater);
        }
    }

    /// Moves `i` up through its grandparents while it compares as `order` to them.
    fn bubble_up_by(&mut self, mut i: usize, order: Ordering) {
        while i > 2 {
            let grandparent = ((i - 1) / 2 - 1) / 2;

            if (self.compare)(&self.items[i], &self.items[grandparent]) == order {
                self.items.swap(i, grandparent);
                i = grandparent;
            } else {
                break;
            }
        }
    }

    fn trickle_down(&mut self, i: usize) {
        if is_min_level(i) {
            self.trickle_down_by(i, Ordering::Less);
        } else {
            self.trickle_down_by(i, Ordering::Greater);
        }
    }

    /// On a min level `order` is [Ordering::Less], on a max level [Ordering::Greater].
    fn trickle_down_by(&mut self, mut i: usize, order: Ordering) {
        loop {
            let Some(m) = self.extreme_descendant(i, order) else {
                return;
            };

            if (self.compare)(&self.items[m], &self.items[i]) != order {
                return;
            }

            self.items.swap(m, i);

            if m <= 2 * i + 2 {
                // child, a level of the opposite kind, nothing below it can be out of place
                return;
            }

            let parent = (m - 1) / 2;
            if (self.compare)(&self.items[parent], &self.items[m]) == order {
                self.items.swap(m, parent);
            }

            i = m;
        }
    }

    /// Index of the smallest (or greatest) of the children and grandchildren of `i`.
    fn extreme_descendant(&self, i: usize, order: Ordering) -> Option<usize> {
        let first_child = 2 * i + 1;
        let first_grandchild = 4 * i + 3;

        let candidates = (first_child..(first_child + 2).min(self.items.len())).chain(
            first_grandchild..(first_grandchild + 4).min(self.items.len()),
        );

        candidates.reduce(|best, candidate| {
            if (self.compare)(&self.items[candidate], &self.items[best]) == order {
                candidate
            } else {
                best
            }
        })
    }
}

impl<T: PartialEq> MinMaxHeap<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.find(item, 0).is_some()
    }

    /// Removes one element equal to `item`, returns `true` if one was found.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.find(item, 0) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Searches the subtree at `i`, skipping subtrees whose bound excludes `item`.
    fn find(&self, item: &T, i: usize) -> Option<usize> {
        let node = self.items.get(i)?;

        if node == item {
            return Some(i);
        }

        let order = (self.compare)(item, node);
        let pruned = if is_min_level(i) {
            order == Ordering::Less
        } else {
            order == Ordering::Greater
        };

        if pruned {
            return None;
        }

        self.find(item, 2 * i + 1).or_else(|| self.find(item, 2 * i + 2))
    }
}

impl<T: Debug> Debug for MinMaxHeap<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinMaxHeap")
            .field("items", &self.items)
            .finish()
    }
}

fn is_min_level(i: usize) -> bool {
    let depth = usize::BITS - (i + 1).leading_zeros() - 1;
    depth % 2 == 0
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::*;

    fn heap_of(values: &[u32]) -> MinMaxHeap<u32> {
        MinMaxHeap::with_items(|a: &u32, b: &u32| a.cmp(b), values.iter().copied())
    }

    fn random_values(n: usize) -> Vec<u32> {
        let mut rng = rand::thread_rng();
        (0..n).map(|_| rng.gen_range(0..1000)).collect()
    }

    #[test]
    fn levels() {
        assert!(is_min_level(0));
        assert!(!is_min_level(1));
        assert!(!is_min_level(2));
        assert!(is_min_level(3));
        assert!(is_min_level(6));
        assert!(!is_min_level(7));
    }

    #[test]
    fn pop_min_is_non_decreasing() {
        for n in [0, 1, 2, 3, 7, 100, 513] {
            let values = random_values(n);

            let mut heap = MinMaxHeap::new(|a: &u32, b: &u32| a.cmp(b));
            for v in &values {
                heap.push(*v);
            }

            let mut drained = Vec::new();
            while let Some(v) = heap.pop_min() {
                drained.push(v);
            }

            let mut sorted = values.clone();
            sorted.sort();
            assert_eq!(drained, sorted);
        }
    }

    #[test]
    fn pop_max_is_non_increasing() {
        let values = random_values(300);
        let mut heap = heap_of(&values);

        let mut drained = Vec::new();
        while let Some(v) = heap.pop_max() {
            drained.push(v);
        }

        let mut sorted = values.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(drained, sorted);
    }

    #[test]
    fn mixed_draining_counts_each_element_once() {
        let values = random_values(257);
        let mut heap = heap_of(&values);

        let mut low = Vec::new();
        let mut high = Vec::new();
        let mut take_min = true;

        while !heap.is_empty() {
            if take_min {
                low.push(heap.pop_min().unwrap());
            } else {
                high.push(heap.pop_max().unwrap());
            }
            take_min = !take_min;
        }

        assert_eq!(heap.len(), 0);
        assert_eq!(low.len() + high.len(), values.len());
        assert!(low.windows(2).all(|w| w[0] <= w[1]));
        assert!(high.windows(2).all(|w| w[0] >= w[1]));

        let mut all: Vec<u32> = low.into_iter().chain(high).collect();
        all.sort();
        let mut sorted = values;
        sorted.sort();
        assert_eq!(all, sorted);
    }

    #[test]
    fn peek_both_ends() {
        let heap = heap_of(&[5, 1, 9, 3, 7]);

        assert_eq!(heap.peek_min(), Some(&1));
        assert_eq!(heap.peek_max(), Some(&9));

        let empty = heap_of(&[]);
        assert_eq!(empty.peek_min(), None);
        assert_eq!(empty.peek_max(), None);
    }

    #[test]
    fn remove_arbitrary() {
        let values = random_values(200);
        let mut heap = heap_of(&values);

        for (i, v) in values.iter().enumerate().filter(|(i, _)| i % 3 == 0) {
            assert!(heap.contains(v), "missing {v} at {i}");
            assert!(heap.remove(v));
        }

        assert!(!heap.remove(&5000));

        let mut expected: Vec<u32> = values
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(_, v)| *v)
            .collect();
        expected.sort();

        assert_eq!(heap.into_sorted_vec(), expected);
    }

    #[test]
    fn comparator_change_rebuilds() {
        let mut heap = heap_of(&[4, 8, 15, 16, 23, 42]);
        heap.set_comparator(|a: &u32, b: &u32| b.cmp(a));

        assert_eq!(heap.peek_min(), Some(&42));
        assert_eq!(heap.peek_max(), Some(&4));
        assert_eq!(heap.into_sorted_vec(), vec![42, 23, 16, 15, 8, 4]);
    }

    #[test]
    fn add_many_after_push() {
        let mut heap = heap_of(&[10, 20]);
        heap.push(5);
        heap.add_many([30, 1, 25]);

        assert_eq!(heap.len(), 6);
        assert_eq!(heap.into_sorted_vec(), vec![1, 5, 10, 20, 25, 30]);
    }
}
