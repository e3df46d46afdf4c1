//! Weighted round-robin multi-class queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

struct WrrClass<T> {
    queue: Mutex<VecDeque<T>>,
    weight: u32,
}

struct Cursor {
    class: usize,
    credit: u32,
}

/// A multi-producer queue with one sub-queue per class and weighted
/// round-robin consumption.
///
/// A class with weight `w` yields up to `w` consecutive items before the
/// cursor moves on; empty classes are skipped, so no non-empty class can be
/// starved regardless of the weight distribution.
pub struct WrrQueue<T> {
    classes: Vec<WrrClass<T>>,
    cursor: Mutex<Cursor>,
}

impl<T> WrrQueue<T> {
    /// Create a queue with one class per weight entry.
    ///
    /// # Panics
    ///
    /// Panics if `weights` is empty or contains a zero (a zero weight would
    /// starve its class).
    pub fn new(weights: &[u32]) -> Self {
        assert!(!weights.is_empty(), "at least one class required");
        assert!(weights.iter().all(|&w| w > 0), "weights must be positive");

        let classes = weights
            .iter()
            .map(|&weight| WrrClass {
                queue: Mutex::new(VecDeque::new()),
                weight,
            })
            .collect::<Vec<_>>();
        let credit = classes[0].weight;
        Self {
            classes,
            cursor: Mutex::new(Cursor { class: 0, credit }),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Append an item to its class queue.
    ///
    /// # Panics
    ///
    /// Panics if `class` is out of range.
    pub fn enqueue(&self, item: T, class: usize) {
        self.classes[class].queue.lock().push_back(item);
    }

    /// Pop the next item under the weighted round-robin policy.
    pub fn dequeue(&self) -> Option<T> {
        let mut cursor = self.cursor.lock();

        // One lap over the classes is enough: every class is either tried
        // at its cursor position or skipped because it is empty.
        for _ in 0..self.classes.len() {
            if cursor.credit == 0 {
                self.advance(&mut cursor);
            }

            if let Some(item) = self.classes[cursor.class].queue.lock().pop_front() {
                cursor.credit -= 1;
                return Some(item);
            }

            self.advance(&mut cursor);
        }

        None
    }

    fn advance(&self, cursor: &mut Cursor) {
        cursor.class = (cursor.class + 1) % self.classes.len();
        cursor.credit = self.classes[cursor.class].weight;
    }

    /// Items across all classes.
    pub fn len(&self) -> usize {
        self.classes.iter().map(|c| c.queue.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|c| c.queue.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_shape_the_drain_order() {
        let q = WrrQueue::new(&[2, 1]);
        for i in 0..4 {
            q.enqueue(('a', i), 0);
        }
        for i in 0..4 {
            q.enqueue(('b', i), 1);
        }

        let mut order = Vec::new();
        while let Some((class, _)) = q.dequeue() {
            order.push(class);
        }

        // Two from class 0, one from class 1, repeating; then the leftovers.
        assert_eq!(order, vec!['a', 'a', 'b', 'a', 'a', 'b', 'b', 'b']);
    }

    #[test]
    fn empty_classes_are_skipped() {
        let q = WrrQueue::new(&[5, 1, 1]);
        q.enqueue(42u32, 2);
        assert_eq!(q.dequeue(), Some(42));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn no_class_is_starved() {
        let q = WrrQueue::new(&[10, 1]);
        for i in 0..100 {
            q.enqueue((0usize, i), 0);
        }
        q.enqueue((1usize, 0), 1);

        // The single class-1 item must surface within one full cycle
        // (weight 10 of class 0 plus its own slot).
        let mut seen_at = None;
        for n in 0..12 {
            let (class, _) = q.dequeue().unwrap();
            if class == 1 {
                seen_at = Some(n);
                break;
            }
        }
        assert!(seen_at.is_some(), "low-weight class was starved");
    }

    #[test]
    #[should_panic(expected = "positive")]
    fn zero_weight_is_rejected() {
        let _ = WrrQueue::<u32>::new(&[1, 0]);
    }
}
