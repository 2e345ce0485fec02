use std::ops::{Deref, DerefMut};

/// Growable array with insertion-order stable indexing.
///
/// The FAT, the directory entry table and the mapping table all grow
/// while references into them are logically outstanding, so callers
/// hold indices and re-resolve them after any operation that may
/// grow the array.
#[derive(Debug)]
pub struct Array<T> {
    items: Vec<T>,
}

/// Appending reserves this many extra items to amortize reallocation.
const GROW_HEADROOM: usize = 32;

impl<T: Default + Clone> Array<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Append one zero-initialized item and return its index.
    pub fn next_index(&mut self) -> usize {
        let index = self.items.len();
        if self.items.capacity() == index {
            self.items.reserve(GROW_HEADROOM);
        }
        self.items.push(T::default());
        index
    }

    /// Append one zero-initialized item and return it.
    pub fn next(&mut self) -> &mut T {
        let index = self.next_index();
        &mut self.items[index]
    }

    /// Grow (zero-filling) so that `index` is valid. Existing items
    /// are untouched.
    pub fn ensure_allocated(&mut self, index: usize) {
        if index >= self.items.len() {
            self.items.resize(index + 1, T::default());
        }
    }

    /// Insert `count` zero-initialized items at `index`, shifting the
    /// tail right.
    #[allow(dead_code)]
    pub fn insert(&mut self, index: usize, count: usize) {
        assert!(index <= self.items.len());
        self.items
            .splice(index..index, std::iter::repeat(T::default()).take(count));
    }

    /// Move the `count` items starting at `from` so that they start at
    /// `to`, preserving the relative order of everything in between.
    #[allow(dead_code)]
    pub fn roll(&mut self, to: usize, from: usize, count: usize) {
        assert!(from + count <= self.items.len());
        assert!(to + count <= self.items.len());
        if to == from {
            return;
        }
        if to < from {
            self.items[to..from + count].rotate_right(count);
        } else {
            self.items[from..to + count].rotate_left(count);
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.items
    }
}

impl<T> Deref for Array<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> DerefMut for Array<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.items
    }
}

#[test]
fn append_and_ensure() {
    let mut array: Array<u32> = Array::new();
    *array.next() = 7;
    assert_eq!(array.len(), 1);

    array.ensure_allocated(4);
    assert_eq!(array.len(), 5);
    assert_eq!(array.as_slice(), &[7, 0, 0, 0, 0]);

    // ensure below the current length is a no-op
    array.ensure_allocated(0);
    assert_eq!(array.len(), 5);
}

#[test]
fn insert_shifts_tail() {
    let mut array: Array<u8> = Array::new();
    for value in 1..=4 {
        *array.next() = value;
    }
    array.insert(1, 2);
    assert_eq!(array.as_slice(), &[1, 0, 0, 2, 3, 4]);
}

#[test]
fn roll_preserves_order() {
    let mut array: Array<u8> = Array::new();
    for value in 0..6 {
        *array.next() = value;
    }

    array.roll(0, 4, 2);
    assert_eq!(array.as_slice(), &[4, 5, 0, 1, 2, 3]);

    array.roll(4, 0, 2);
    assert_eq!(array.as_slice(), &[0, 1, 2, 3, 4, 5]);

    array.roll(3, 3, 2);
    assert_eq!(array.as_slice(), &[0, 1, 2, 3, 4, 5]);
}
