//! Fixed-capacity set with random eviction
//!
//! Backs the public node list: when full, inserting a new entry evicts a
//! random existing one, so a flood of addresses from one source cannot pin
//! the list.

use parking_lot::Mutex;
use rand::seq::index;
use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;

/// Default capacity of the public node list
pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug)]
struct Inner<T> {
    items: Vec<T>,
    positions: HashMap<T, usize>,
}

impl<T: Eq + Hash + Clone> Inner<T> {
    fn remove_at(&mut self, pos: usize) -> T {
        let removed = self.items.swap_remove(pos);
        self.positions.remove(&removed);
        if let Some(moved) = self.items.get(pos) {
            self.positions.insert(moved.clone(), pos);
        }
        removed
    }
}

/// Thread-safe bounded set with random eviction and random sampling
#[derive(Debug)]
pub struct LimitedRandomSet<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> LimitedRandomSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::with_capacity(capacity.min(4096)),
                positions: HashMap::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &T) -> bool {
        self.inner.lock().positions.contains_key(item)
    }

    /// Insert an item, evicting a random entry when full
    ///
    /// Returns `false` if the item was already present.
    pub fn insert(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.positions.contains_key(&item) {
            return false;
        }

        if inner.items.len() >= self.capacity {
            let victim = rand::thread_rng().gen_range(0..inner.items.len());
            inner.remove_at(victim);
        }

        let pos = inner.items.len();
        inner.positions.insert(item.clone(), pos);
        inner.items.push(item);
        true
    }

    /// Insert every item not rejected by `reject`, returning the ones newly added
    pub fn add_all<I, F>(&self, items: I, reject: F) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
        F: Fn(&T) -> bool,
    {
        items
            .into_iter()
            .filter(|item| !reject(item))
            .filter(|item| self.insert(item.clone()))
            .collect()
    }

    pub fn remove(&self, item: &T) -> bool {
        let mut inner = self.inner.lock();
        match inner.positions.get(item).copied() {
            Some(pos) => {
                inner.remove_at(pos);
                true
            }
            None => false,
        }
    }

    /// Pick up to `n` distinct items at random
    pub fn pick(&self, n: usize) -> Vec<T> {
        let inner = self.inner.lock();
        let amount = n.min(inner.items.len());
        index::sample(&mut rand::thread_rng(), inner.items.len(), amount)
            .into_iter()
            .map(|i| inner.items[i].clone())
            .collect()
    }

    /// Copy of every item
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.lock().items.clone()
    }
}

impl<T: Eq + Hash + Clone> Default for LimitedRandomSet<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_insert_and_duplicates() {
        let set = LimitedRandomSet::new(4);
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&1));
    }

    #[test]
    fn test_capacity_evicts_randomly() {
        let set = LimitedRandomSet::new(3);
        for i in 0..10 {
            set.insert(i);
        }

        assert_eq!(set.len(), 3);
        // The newest item always survives its own insertion
        assert!(set.contains(&9));

        let items: HashSet<_> = set.to_vec().into_iter().collect();
        assert_eq!(items.len(), 3);
        for item in items {
            assert!(set.contains(&item));
        }
    }

    #[test]
    fn test_pick_distinct() {
        let set = LimitedRandomSet::new(10);
        for i in 0..10 {
            set.insert(i);
        }

        let picked = set.pick(4);
        assert_eq!(picked.len(), 4);
        let unique: HashSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), 4);

        assert_eq!(set.pick(50).len(), 10);
        assert!(LimitedRandomSet::<u8>::new(2).pick(3).is_empty());
    }

    #[test]
    fn test_add_all_filters() {
        let set = LimitedRandomSet::new(10);
        set.insert(2);

        let added = set.add_all(vec![1, 2, 3, 4], |x| *x == 4);
        assert_eq!(added, vec![1, 3]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_remove_keeps_positions_consistent() {
        let set = LimitedRandomSet::new(5);
        for i in 0..5 {
            set.insert(i);
        }
        assert!(set.remove(&0));
        assert!(!set.remove(&0));
        assert!(set.remove(&4));
        assert!(set.contains(&1) && set.contains(&2) && set.contains(&3));
        assert_eq!(set.len(), 3);
    }
}
