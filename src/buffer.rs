//! Bounded ring buffer that overwrites its oldest element when full.
//!
//! Backs the per-filter waveform history (template re-estimation) and the
//! detection buffer of unexplained waveforms. Capacity is fixed at creation.

use alloc::vec::Vec;

/// Fixed-capacity ring buffer, oldest element overwritten on overflow.
///
/// # Example
///
/// ```
/// use botm::RingBuffer;
///
/// let mut buf = RingBuffer::new(2);
/// buf.push(1);
/// buf.push(2);
/// buf.push(3); // overwrites 1
/// assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buffer: Vec<T>,
    capacity: usize,
    head: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` elements.
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    /// Appends a value, returning the evicted oldest value if the buffer
    /// was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.buffer.len() < self.capacity {
            self.buffer.push(value);
            return None;
        }
        let evicted = core::mem::replace(&mut self.buffer[self.head], value);
        self.head = (self.head + 1) % self.capacity;
        Some(evicted)
    }

    /// Appends every value from `values`.
    pub fn extend<I: IntoIterator<Item = T>>(&mut self, values: I) {
        for v in values {
            self.push(v);
        }
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let (newer, older) = self.buffer.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    /// Removes and returns every element, oldest first.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut items = core::mem::take(&mut self.buffer);
        items.rotate_left(self.head);
        self.head = 0;
        items
    }

    /// Removes every element.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.head = 0;
    }

    /// Number of stored elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns true if the buffer holds `capacity` elements.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Maximum number of elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl RingBuffer<alloc::vec::Vec<f32>> {
    /// Element-wise mean of the stored vectors, or `None` if empty.
    ///
    /// All stored vectors are expected to share the length of the first.
    pub fn mean(&self) -> Option<Vec<f32>> {
        let first = self.buffer.first()?;
        let mut acc: Vec<f64> = alloc::vec![0.0; first.len()];
        for v in &self.buffer {
            for (a, &x) in acc.iter_mut().zip(v) {
                *a += x as f64;
            }
        }
        let n = self.buffer.len() as f64;
        Some(acc.into_iter().map(|a| (a / n) as f32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_push_until_full() {
        let mut buf = RingBuffer::new(3);
        assert!(buf.is_empty());
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.push(3), None);
        assert!(buf.is_full());
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_iteration_order_after_wrap() {
        let mut buf = RingBuffer::new(3);
        buf.extend(1..=5);
        let items: Vec<i32> = buf.iter().copied().collect();
        assert_eq!(items, vec![3, 4, 5]);
    }

    #[test]
    fn test_drain_all_resets() {
        let mut buf = RingBuffer::new(2);
        buf.extend([1, 2, 3]);
        assert_eq!(buf.drain_all(), vec![2, 3]);
        assert!(buf.is_empty());
        buf.push(7);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_mean_of_vectors() {
        let mut buf = RingBuffer::new(4);
        buf.push(vec![1.0f32, 2.0]);
        buf.push(vec![3.0f32, 6.0]);
        assert_eq!(buf.mean(), Some(vec![2.0, 4.0]));
        buf.clear();
        assert_eq!(buf.mean(), None);
    }
}
