//! Fixed-capacity columnar buffers — the unit of tape allocation.
//!
//! A chunk holds one or two parallel typed columns of equal length. Columns
//! are allocated once at a fixed capacity and never reallocated, so slices
//! into them stay valid for the chunk's lifetime and the reverse sweep can
//! walk each column with unit stride.

/// Storage interface shared by all chunk shapes.
///
/// `used() <= capacity()` always holds, and every column of a chunk has
/// exactly `used()` valid entries.
pub trait ChunkData {
    /// One record: the values pushed into all columns at the same offset.
    type Item;

    /// Allocate an empty chunk able to hold `capacity` records.
    fn with_capacity(capacity: usize) -> Self;

    /// Number of records this chunk can hold.
    fn capacity(&self) -> usize;

    /// Number of records currently stored.
    fn used(&self) -> usize;

    /// Free record slots remaining.
    #[inline]
    fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Append one record. Panics if the chunk is full — callers must have
    /// reserved space through the owning log first.
    fn push(&mut self, item: Self::Item);

    /// Drop every record at offset `used` and beyond.
    fn truncate(&mut self, used: usize);
}

/// Single-column chunk.
pub struct Chunk1<A> {
    data: Vec<A>,
    capacity: usize,
}

impl<A> Chunk1<A> {
    /// The valid records of the column.
    #[inline]
    pub fn data(&self) -> &[A] {
        &self.data
    }
}

impl<A> ChunkData for Chunk1<A> {
    type Item = A;

    fn with_capacity(capacity: usize) -> Self {
        Chunk1 {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn used(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn push(&mut self, item: A) {
        assert!(self.data.len() < self.capacity, "chunk overflow: push without reservation");
        self.data.push(item);
    }

    fn truncate(&mut self, used: usize) {
        self.data.truncate(used);
    }
}

/// Two-column chunk; both columns always have the same length.
pub struct Chunk2<A, B> {
    a: Vec<A>,
    b: Vec<B>,
    capacity: usize,
}

impl<A, B> Chunk2<A, B> {
    /// Both columns as parallel slices.
    #[inline]
    pub fn columns(&self) -> (&[A], &[B]) {
        (&self.a, &self.b)
    }

    /// One record, with the first column borrowed mutably. Used by the
    /// external-function walk, which must call the stored closures.
    #[inline]
    pub fn entry_mut(&mut self, offset: usize) -> (&mut A, &B) {
        (&mut self.a[offset], &self.b[offset])
    }
}

impl<A, B> ChunkData for Chunk2<A, B> {
    type Item = (A, B);

    fn with_capacity(capacity: usize) -> Self {
        Chunk2 {
            a: Vec::with_capacity(capacity),
            b: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn used(&self) -> usize {
        self.a.len()
    }

    #[inline]
    fn push(&mut self, (a, b): (A, B)) {
        assert!(self.a.len() < self.capacity, "chunk overflow: push without reservation");
        self.a.push(a);
        self.b.push(b);
    }

    fn truncate(&mut self, used: usize) {
        self.a.truncate(used);
        self.b.truncate(used);
    }
}
