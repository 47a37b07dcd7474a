//! Chunked append-only log with O(1) snapshots and rewind.
//!
//! A [`ChunkVector`] strings [`chunks`](crate::chunk) into an ordered
//! sequence and remembers, for every chunk, the position of its *inner* log
//! at the instant that chunk became current. The tape nests three of these
//! logs (external functions → statements → jacobian data); the cached inner
//! positions are what lets the reverse sweep replay any prefix of an inner
//! log that corresponds to a prefix of an outer one without rescanning.
//!
//! Appends are amortized O(1): a full chunk is sealed at its actual fill
//! level and a pooled or fresh chunk becomes current. Sealed chunks are
//! never resized, so column slices handed to the reverse sweep stay stable.

use crate::chunk::ChunkData;

/// Snapshot of a log head: chunk index, intra-chunk offset, and the inner
/// log's position at the same instant.
///
/// Positions order lexicographically, outermost field first, which matches
/// the recording order: a later record always has a strictly greater
/// position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkPosition<P> {
    /// Index of the current chunk.
    pub chunk: usize,
    /// Records used in the current chunk.
    pub data: usize,
    /// Position of the inner log.
    pub inner: P,
}

/// An ordered sequence of fixed-capacity chunks plus the per-chunk inner
/// position snapshots.
///
/// Chunks past the current one form a retained pool: they are created by
/// [`resize`](Self::resize) pre-allocation or left behind by
/// [`reset`](Self::reset), and are reused before any new allocation.
pub struct ChunkVector<C, P> {
    chunks: Vec<C>,
    inner_starts: Vec<P>,
    cur_chunk: usize,
    chunk_size: usize,
}

impl<C: ChunkData, P: Copy + Default> ChunkVector<C, P> {
    /// Create a log with one empty chunk of `chunk_size` records.
    pub fn new(chunk_size: usize) -> Self {
        ChunkVector {
            chunks: vec![C::with_capacity(chunk_size)],
            inner_starts: vec![P::default()],
            cur_chunk: 0,
            chunk_size,
        }
    }

    /// Set the capacity used for chunks allocated from now on. Existing
    /// chunks keep their capacity.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }

    /// Pre-allocate enough chunks to hold `total_size` records without
    /// further allocation during recording.
    pub fn resize(&mut self, total_size: usize) {
        let needed = total_size.div_ceil(self.chunk_size).max(1);
        while self.chunks.len() < needed {
            self.chunks.push(C::with_capacity(self.chunk_size));
            self.inner_starts.push(P::default());
        }
    }

    /// Ensure the current chunk has room for `items` more records.
    ///
    /// If it does not, the current chunk is sealed at its fill level and the
    /// next chunk becomes current, with `inner_pos` recorded as the inner
    /// log's position at that boundary.
    pub fn reserve_items(&mut self, items: usize, inner_pos: P) {
        if self.chunks[self.cur_chunk].remaining() < items {
            assert!(
                items <= self.chunk_size,
                "reservation of {items} records exceeds the chunk size {}",
                self.chunk_size
            );
            self.cur_chunk += 1;
            if self.cur_chunk == self.chunks.len() {
                self.chunks.push(C::with_capacity(self.chunk_size));
                self.inner_starts.push(inner_pos);
            } else {
                self.chunks[self.cur_chunk].truncate(0);
                self.inner_starts[self.cur_chunk] = inner_pos;
            }
        }
    }

    /// Append one record to the current chunk. Space must have been
    /// reserved beforehand.
    #[inline]
    pub fn push(&mut self, item: C::Item) {
        self.chunks[self.cur_chunk].push(item);
    }

    /// Offset of the head within the current chunk.
    #[inline]
    pub fn chunk_position(&self) -> usize {
        self.chunks[self.cur_chunk].used()
    }

    /// Snapshot the head, embedding the inner log's position.
    #[inline]
    pub fn position(&self, inner: P) -> ChunkPosition<P> {
        ChunkPosition {
            chunk: self.cur_chunk,
            data: self.chunks[self.cur_chunk].used(),
            inner,
        }
    }

    /// Rewind the head to `pos`, dropping every record recorded after it.
    /// Chunks past `pos.chunk` are emptied but kept as a reuse pool.
    pub fn reset(&mut self, pos: &ChunkPosition<P>) {
        assert!(
            pos.chunk <= self.cur_chunk,
            "reset position lies beyond the current head"
        );
        for chunk in &mut self.chunks[pos.chunk + 1..=self.cur_chunk] {
            chunk.truncate(0);
        }
        self.cur_chunk = pos.chunk;
        self.chunks[self.cur_chunk].truncate(pos.data);
    }

    /// Read access to chunk `idx` for the reverse walk.
    #[inline]
    pub fn chunk(&self, idx: usize) -> &C {
        &self.chunks[idx]
    }

    /// Mutable access to chunk `idx`; needed to invoke stored callbacks.
    #[inline]
    pub fn chunk_mut(&mut self, idx: usize) -> &mut C {
        &mut self.chunks[idx]
    }

    /// Number of valid records in chunk `idx`.
    #[inline]
    pub fn chunk_used(&self, idx: usize) -> usize {
        self.chunks[idx].used()
    }

    /// The inner log's position at the instant chunk `idx` became current.
    #[inline]
    pub fn inner_start(&self, idx: usize) -> P {
        self.inner_starts[idx]
    }

    /// Index of the current chunk.
    #[inline]
    pub fn cur_chunk(&self) -> usize {
        self.cur_chunk
    }

    /// Total records stored across all used chunks.
    pub fn len(&self) -> usize {
        self.chunks[..=self.cur_chunk].iter().map(C::used).sum()
    }

    /// Whether no record has been stored.
    pub fn is_empty(&self) -> bool {
        self.cur_chunk == 0 && self.chunks[0].used() == 0
    }
}
