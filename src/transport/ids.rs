//! Id-keyed tables with cyclic allocation.

use std::collections::BTreeMap;

/// Map from small integer ids to values.
///
/// Allocation walks forward from the last id handed out and wraps around,
/// skipping ids that are still present, so a just-released id is not handed
/// out again while other ids are free.
#[derive(Debug)]
pub(crate) struct IdMap<T> {
    entries: BTreeMap<u32, T>,
    min: u32,
    max: u32,
    next: u32,
}

impl<T> IdMap<T> {
    /// Table whose allocatable ids lie in `[min, max)`.
    pub(crate) fn new(min: u32, max: u32) -> Self {
        debug_assert!(min < max);
        Self {
            entries: BTreeMap::new(),
            min,
            max,
            next: min,
        }
    }

    /// Insert `value` under the next free id.
    pub(crate) fn alloc_cyclic(&mut self, value: T) -> Result<u32, T> {
        let span = self.max - self.min;
        let start = self.next;
        for step in 0..span {
            let id = self.min + (start - self.min + step) % span;
            if !self.entries.contains_key(&id) {
                self.entries.insert(id, value);
                self.next = if id + 1 >= self.max { self.min } else { id + 1 };
                return Ok(id);
            }
        }
        Err(value)
    }

    /// Insert `value` under a caller-chosen id. Fails if the id is taken.
    pub(crate) fn insert_at(&mut self, id: u32, value: T) -> Result<(), T> {
        if self.entries.contains_key(&id) {
            return Err(value);
        }
        self.entries.insert(id, value);
        Ok(())
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Remove `id` only if `pred` accepts the stored value.
    pub(crate) fn remove_if(&mut self, id: u32, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        if self.entries.get(&id).is_some_and(pred) {
            self.entries.remove(&id)
        } else {
            None
        }
    }

    /// First value, in id order, accepted by `pred`.
    pub(crate) fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.entries.values().find(|value| pred(value))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries.iter().map(|(id, value)| (*id, value))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.entries.iter_mut().map(|(id, value)| (*id, value))
    }

    /// Empty the table, returning everything it held.
    pub(crate) fn drain(&mut self) -> Vec<(u32, T)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_cyclic_and_skips_live_ids() {
        let mut map = IdMap::new(1, 5);
        assert_eq!(map.alloc_cyclic('a'), Ok(1));
        assert_eq!(map.alloc_cyclic('b'), Ok(2));
        assert_eq!(map.remove(1), Some('a'));
        // 1 is free again but allocation keeps moving forward.
        assert_eq!(map.alloc_cyclic('c'), Ok(3));
        assert_eq!(map.alloc_cyclic('d'), Ok(4));
        assert_eq!(map.alloc_cyclic('e'), Ok(1));
        assert_eq!(map.alloc_cyclic('f'), Err('f'));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn insert_at_rejects_taken_ids() {
        let mut map = IdMap::new(0, u32::MAX);
        map.insert_at(7, "x").unwrap();
        assert_eq!(map.insert_at(7, "y"), Err("y"));
        assert_eq!(map.get(7), Some(&"x"));
    }

    #[test]
    fn remove_if_checks_identity() {
        let mut map = IdMap::new(1, 10);
        let id = map.alloc_cyclic(String::from("ping")).unwrap();
        assert!(map.remove_if(id, |name| name == "pong").is_none());
        assert_eq!(map.remove_if(id, |name| name == "ping").as_deref(), Some("ping"));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn drain_empties_the_table() {
        let mut map = IdMap::new(1, 10);
        map.alloc_cyclic(1).unwrap();
        map.alloc_cyclic(2).unwrap();
        let drained = map.drain();
        assert_eq!(drained, vec![(1, 1), (2, 2)]);
        assert_eq!(map.len(), 0);
        assert!(map.find(|_| true).is_none());
    }
}
