//! Version vectors keyed by short device ids

use serde::{Deserialize, Serialize};

use crate::device_id::ShortId;

/// One device's counter within a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: ShortId,
    pub value: u64,
}

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Equal,
    Greater,
    Lesser,
    Concurrent,
}

/// A version vector: a sparse map from short device id to a monotonic
/// counter, kept sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vector {
    counters: Vec<Counter>,
}

impl Vector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw counters (test fixtures, decoding). Sorts by id.
    #[must_use]
    pub fn from_counters(mut counters: Vec<Counter>) -> Self {
        counters.sort_by_key(|c| c.id);
        Self { counters }
    }

    #[must_use]
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Bump the counter for `id`, inserting it at 1 if absent. Returns the
    /// new counter value.
    pub fn update(&mut self, id: ShortId) -> u64 {
        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => {
                self.counters[i].value += 1;
                self.counters[i].value
            }
            Err(i) => {
                self.counters.insert(i, Counter { id, value: 1 });
                1
            }
        }
    }

    /// The counter value recorded for `id`, or zero.
    #[must_use]
    pub fn counter(&self, id: ShortId) -> u64 {
        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => self.counters[i].value,
            Err(_) => 0,
        }
    }

    /// Pairwise max of both vectors.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for c in &other.counters {
            match merged.counters.binary_search_by_key(&c.id, |m| m.id) {
                Ok(i) => merged.counters[i].value = merged.counters[i].value.max(c.value),
                Err(i) => merged.counters.insert(i, *c),
            }
        }
        merged
    }

    /// Three-way comparison under the partial order of version vectors.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        let mut self_bigger = false;
        let mut other_bigger = false;

        let mut a = self.counters.iter().peekable();
        let mut b = other.counters.iter().peekable();

        loop {
            match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    self_bigger = true;
                    break;
                }
                (None, Some(_)) => {
                    other_bigger = true;
                    break;
                }
                (Some(ca), Some(cb)) => {
                    if ca.id == cb.id {
                        match ca.value.cmp(&cb.value) {
                            std::cmp::Ordering::Greater => self_bigger = true,
                            std::cmp::Ordering::Less => other_bigger = true,
                            std::cmp::Ordering::Equal => {}
                        }
                        a.next();
                        b.next();
                    } else if ca.id < cb.id {
                        // Counter present on our side only.
                        self_bigger = true;
                        a.next();
                    } else {
                        other_bigger = true;
                        b.next();
                    }
                }
            }
            if self_bigger && other_bigger {
                return Ordering::Concurrent;
            }
        }

        match (self_bigger, other_bigger) {
            (false, false) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Lesser,
            (true, true) => Ordering::Concurrent,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(pairs: &[(u64, u64)]) -> Vector {
        Vector::from_counters(
            pairs
                .iter()
                .map(|&(id, value)| Counter {
                    id: ShortId(id),
                    value,
                })
                .collect(),
        )
    }

    #[test]
    fn test_compare_equal_reflexive() {
        let a = v(&[(1, 2), (2, 3)]);
        assert_eq!(a.compare(&a), Ordering::Equal);
        assert_eq!(Vector::new().compare(&Vector::new()), Ordering::Equal);
    }

    #[test]
    fn test_update_dominates() {
        let a = v(&[(1, 1)]);
        let mut b = a.clone();
        b.update(ShortId(1));
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(a.compare(&b), Ordering::Lesser);

        let mut c = a.clone();
        c.update(ShortId(7));
        assert_eq!(c.compare(&a), Ordering::Greater);
    }

    #[test]
    fn test_concurrent() {
        let a = v(&[(1, 2), (2, 1)]);
        let b = v(&[(1, 1), (2, 2)]);
        assert_eq!(a.compare(&b), Ordering::Concurrent);
        assert_eq!(b.compare(&a), Ordering::Concurrent);
    }

    #[test]
    fn test_disjoint_ids_concurrent() {
        let a = v(&[(1, 1)]);
        let b = v(&[(2, 1)]);
        assert_eq!(a.compare(&b), Ordering::Concurrent);
    }

    #[test]
    fn test_merge_pairwise_max() {
        let a = v(&[(1, 2), (2, 1)]);
        let b = v(&[(1, 1), (2, 3), (3, 1)]);
        let m = a.merge(&b);
        assert_eq!(m, v(&[(1, 2), (2, 3), (3, 1)]));
        assert!(matches!(m.compare(&a), Ordering::Greater | Ordering::Equal));
        assert!(matches!(m.compare(&b), Ordering::Greater | Ordering::Equal));
    }

    #[test]
    fn test_empty_lesser_than_any() {
        let a = v(&[(1, 1)]);
        assert_eq!(Vector::new().compare(&a), Ordering::Lesser);
        assert_eq!(a.compare(&Vector::new()), Ordering::Greater);
    }

    #[test]
    fn test_update_returns_new_value() {
        let mut a = Vector::new();
        assert_eq!(a.update(ShortId(5)), 1);
        assert_eq!(a.update(ShortId(5)), 2);
        assert_eq!(a.counter(ShortId(5)), 2);
        assert_eq!(a.counter(ShortId(6)), 0);
    }
}
