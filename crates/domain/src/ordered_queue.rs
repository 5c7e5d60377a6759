//! Insertion-ordered associative container with positional splicing.
//!
//! Every positional structure of the scheduler is an [`OrderedQueue`]:
//! per-device free slots (`start → end`), per-device lock queues
//! (`action_id → ActionInfo`), the wait queue and the serialization order
//! (`routine_id → info`). A plain hash map cannot express "insert right after
//! this key" or "who comes next", which the lease logic relies on.

use std::fmt::Display;
use std::hash::Hash;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::ScheduleError;

/// Map preserving insertion order, with neighbour lookups and splicing.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct OrderedQueue<K, V> {
    inner: IndexMap<K, V>,
}

impl<K, V> Default for OrderedQueue<K, V> {
    fn default() -> Self {
        Self {
            inner: IndexMap::new(),
        }
    }
}

impl<K: Hash + Eq, V: PartialEq> PartialEq for OrderedQueue<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.len() == other.inner.len()
            && self.inner.iter().zip(other.inner.iter()).all(|(a, b)| a == b)
    }
}

impl<K, V> OrderedQueue<K, V>
where
    K: Hash + Eq + Clone + Display,
{
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Append `key`, or replace its value in place when already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Remove `key`, shifting later entries one position forward.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.shift_remove(key)
    }

    /// Position of `key` in the queue.
    #[must_use]
    pub fn index(&self, key: &K) -> Option<usize> {
        self.inner.get_index_of(key)
    }

    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<(&K, &V)> {
        self.inner.get_index(index)
    }

    /// The entry immediately after `key`.
    #[must_use]
    pub fn next(&self, key: &K) -> Option<(&K, &V)> {
        let index = self.index(key)?;
        self.inner.get_index(index + 1)
    }

    /// The entry immediately before `key`.
    #[must_use]
    pub fn prev(&self, key: &K) -> Option<(&K, &V)> {
        let index = self.index(key)?;
        index.checked_sub(1).and_then(|i| self.inner.get_index(i))
    }

    /// Insert `key` right before `anchor`.
    ///
    /// An existing `key` is moved to the new position.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::MissingAnchor`] if `anchor` is not queued.
    pub fn insert_before(&mut self, anchor: &K, key: K, value: V) -> Result<(), ScheduleError> {
        self.splice(anchor, key, value, 0)
    }

    /// Insert `key` right after `anchor`.
    ///
    /// An existing `key` is moved to the new position.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::MissingAnchor`] if `anchor` is not queued.
    pub fn insert_after(&mut self, anchor: &K, key: K, value: V) -> Result<(), ScheduleError> {
        self.splice(anchor, key, value, 1)
    }

    fn splice(&mut self, anchor: &K, key: K, value: V, offset: usize) -> Result<(), ScheduleError> {
        if !self.inner.contains_key(anchor) {
            return Err(ScheduleError::MissingAnchor(anchor.to_string()));
        }
        if &key != anchor {
            self.inner.shift_remove(&key);
        }
        let position = self
            .inner
            .get_index_of(anchor)
            .ok_or_else(|| ScheduleError::MissingAnchor(anchor.to_string()))?;
        if &key == anchor {
            self.inner.insert(key, value);
            return Ok(());
        }
        self.inner.shift_insert(position + offset, key, value);
        Ok(())
    }

    /// First entry.
    #[must_use]
    pub fn top(&self) -> Option<(&K, &V)> {
        self.inner.first()
    }

    /// Last entry.
    #[must_use]
    pub fn end(&self) -> Option<(&K, &V)> {
        self.inner.last()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, K, V> {
        self.inner.iter()
    }

    pub fn keys(&self) -> indexmap::map::Keys<'_, K, V> {
        self.inner.keys()
    }

    pub fn values(&self) -> indexmap::map::Values<'_, K, V> {
        self.inner.values()
    }

    pub fn values_mut(&mut self) -> indexmap::map::ValuesMut<'_, K, V> {
        self.inner.values_mut()
    }

    /// Keep only the entries for which `keep` returns `true`, preserving order.
    pub fn retain(&mut self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.inner.retain(keep);
    }
}

impl<'a, K, V> IntoIterator for &'a OrderedQueue<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = indexmap::map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K: Hash + Eq, V> FromIterator<(K, V)> for OrderedQueue<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> OrderedQueue<String, u32> {
        ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, k)| ((*k).to_string(), u32::try_from(i).unwrap()))
            .collect()
    }

    fn keys(q: &OrderedQueue<String, u32>) -> Vec<&str> {
        q.keys().map(String::as_str).collect()
    }

    #[test]
    fn should_preserve_insertion_order() {
        let q = queue();
        assert_eq!(keys(&q), vec!["a", "b", "c"]);
        assert_eq!(q.top(), Some((&"a".to_string(), &0)));
        assert_eq!(q.end(), Some((&"c".to_string(), &2)));
    }

    #[test]
    fn should_keep_position_when_updating_existing_key() {
        let mut q = queue();
        q.insert("a".to_string(), 10);
        assert_eq!(keys(&q), vec!["a", "b", "c"]);
        assert_eq!(q.get(&"a".to_string()), Some(&10));
    }

    #[test]
    fn should_return_neighbours() {
        let q = queue();
        assert_eq!(q.next(&"a".to_string()).map(|(k, _)| k.as_str()), Some("b"));
        assert_eq!(q.prev(&"b".to_string()).map(|(k, _)| k.as_str()), Some("a"));
        assert!(q.prev(&"a".to_string()).is_none());
        assert!(q.next(&"c".to_string()).is_none());
        assert!(q.next(&"zz".to_string()).is_none());
    }

    #[test]
    fn should_splice_before_and_after_anchor() {
        let mut q = queue();
        q.insert_before(&"b".to_string(), "x".to_string(), 9).unwrap();
        q.insert_after(&"c".to_string(), "y".to_string(), 8).unwrap();
        assert_eq!(keys(&q), vec!["a", "x", "b", "c", "y"]);
        assert_eq!(q.index(&"x".to_string()), Some(1));
    }

    #[test]
    fn should_move_existing_key_when_splicing() {
        let mut q = queue();
        q.insert_after(&"c".to_string(), "a".to_string(), 5).unwrap();
        assert_eq!(keys(&q), vec!["b", "c", "a"]);
        assert_eq!(q.get(&"a".to_string()), Some(&5));
    }

    #[test]
    fn should_fail_when_anchor_is_missing() {
        let mut q = queue();
        let err = q.insert_after(&"nope".to_string(), "x".to_string(), 1);
        assert_eq!(err, Err(ScheduleError::MissingAnchor("nope".to_string())));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn should_shift_entries_when_removing() {
        let mut q = queue();
        assert_eq!(q.remove(&"a".to_string()), Some(0));
        assert_eq!(q.index(&"b".to_string()), Some(0));
        assert!(q.remove(&"a".to_string()).is_none());
    }
}
