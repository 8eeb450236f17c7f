//! Capacity-bounded ordered array placed over caller-supplied storage.
//!
//! The index never allocates: the heap puts it at the start of its own
//! region. Every operation is O(n), which is fine because the number of
//! simultaneously free blocks is bounded by the reserved storage.

use core::mem::MaybeUninit;

use crate::memory::error::MemoryError;

/// Ordered collection over `&'a mut [MaybeUninit<T>]`.
///
/// `less(a, b)` decides whether `a` sorts strictly before `b`; items comparing
/// equal keep insertion order.
pub struct SortedIndex<'a, T, F = fn(&T, &T) -> bool> {
    slots: &'a mut [MaybeUninit<T>],
    len: usize,
    less: F,
}

impl<'a, T: Copy, F: Fn(&T, &T) -> bool> SortedIndex<'a, T, F> {
    /// Places an empty index over `buffer`; capacity is the buffer length.
    pub fn place(buffer: &'a mut [MaybeUninit<T>], less: F) -> Self {
        SortedIndex {
            slots: buffer,
            len: 0,
            less,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Inserts `item` after every element that sorts before or equal to it.
    pub fn insert(&mut self, item: T) -> Result<usize, MemoryError> {
        if self.is_full() {
            return Err(MemoryError::IndexFull);
        }

        let mut position = 0;
        while position < self.len && !(self.less)(&item, self.get(position)) {
            position += 1;
        }

        let mut i = self.len;
        while i > position {
            self.slots[i] = self.slots[i - 1];
            i -= 1;
        }
        self.slots[position] = MaybeUninit::new(item);
        self.len += 1;
        Ok(position)
    }

    /// Returns the `i`-th smallest element.
    pub fn lookup(&self, i: usize) -> Option<T> {
        (i < self.len).then(|| *self.get(i))
    }

    /// Removes the `i`-th smallest element, shifting the rest down.
    pub fn remove(&mut self, i: usize) -> Option<T> {
        if i >= self.len {
            return None;
        }
        let item = *self.get(i);
        for j in i..self.len - 1 {
            self.slots[j] = self.slots[j + 1];
        }
        self.len -= 1;
        Some(item)
    }

    /// Position of the first element matching `pred`.
    pub fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        (0..self.len).find(|&i| pred(self.get(i)))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| *self.get(i))
    }

    fn get(&self, i: usize) -> &T {
        debug_assert!(i < self.len);
        // SAFETY: slots below `len` have all been written by `insert`.
        unsafe { self.slots[i].assume_init_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage<const N: usize>() -> [MaybeUninit<u32>; N] {
        [MaybeUninit::uninit(); N]
    }

    #[test]
    fn keeps_ascending_order() {
        let mut buffer = storage::<8>();
        let mut index = SortedIndex::place(&mut buffer, |a: &u32, b: &u32| a < b);
        for value in [5, 1, 4, 2, 3] {
            index.insert(value).unwrap();
        }
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(index.lookup(0), Some(1));
        assert_eq!(index.lookup(4), Some(5));
        assert_eq!(index.lookup(5), None);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut buffer = [MaybeUninit::<(u32, char)>::uninit(); 4];
        let mut index = SortedIndex::place(&mut buffer, |a: &(u32, char), b: &(u32, char)| a.0 < b.0);
        index.insert((2, 'a')).unwrap();
        index.insert((1, 'b')).unwrap();
        index.insert((2, 'c')).unwrap();
        let order: Vec<char> = index.iter().map(|(_, tag)| tag).collect();
        assert_eq!(order, vec!['b', 'a', 'c']);
    }

    #[test]
    fn insert_fails_at_capacity() {
        let mut buffer = storage::<2>();
        let mut index = SortedIndex::place(&mut buffer, |a: &u32, b: &u32| a < b);
        index.insert(7).unwrap();
        index.insert(3).unwrap();
        assert!(index.is_full());
        assert_eq!(index.insert(1), Err(MemoryError::IndexFull));
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![3, 7]);
    }

    #[test]
    fn remove_shifts_down() {
        let mut buffer = storage::<4>();
        let mut index = SortedIndex::place(&mut buffer, |a: &u32, b: &u32| a < b);
        for value in [10, 30, 20, 40] {
            index.insert(value).unwrap();
        }
        assert_eq!(index.remove(1), Some(20));
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![10, 30, 40]);
        assert_eq!(index.remove(2), Some(40));
        assert_eq!(index.remove(2), None);
        assert_eq!(index.len(), 2);
        index.insert(25).unwrap();
        assert_eq!(index.position(|&v| v == 25), Some(1));
    }

    #[test]
    fn zero_capacity_index() {
        let mut buffer = storage::<0>();
        let mut index = SortedIndex::place(&mut buffer, |a: &u32, b: &u32| a < b);
        assert!(index.is_empty());
        assert_eq!(index.insert(1), Err(MemoryError::IndexFull));
        assert_eq!(index.remove(0), None);
    }
}
