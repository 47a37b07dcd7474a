//! The chunked log on its own: sealing, positions, rewind, and the
//! retained chunk pool.

use numbat::chunk::{Chunk1, Chunk2, ChunkData};
use numbat::{ChunkPosition, ChunkVector};

type Log = ChunkVector<Chunk2<f64, u32>, u32>;

#[test]
fn appends_land_in_the_current_chunk() {
    let mut log = Log::new(4);
    log.reserve_items(2, 0);
    log.push((1.0, 1));
    log.push((2.0, 2));

    assert_eq!(log.cur_chunk(), 0);
    assert_eq!(log.chunk_position(), 2);
    assert_eq!(log.len(), 2);

    let (values, indices) = log.chunk(0).columns();
    assert_eq!(values, &[1.0, 2.0]);
    assert_eq!(indices, &[1, 2]);
}

/// A reservation that does not fit seals the current chunk at its actual
/// fill level and records the inner position at the boundary.
#[test]
fn sealing_keeps_fill_level_and_inner_snapshot() {
    let mut log = Log::new(4);
    log.reserve_items(3, 10);
    log.push((1.0, 1));
    log.push((2.0, 2));
    log.push((3.0, 3));

    // 1 slot left, 3 wanted: seal
    log.reserve_items(3, 42);
    assert_eq!(log.cur_chunk(), 1);
    assert_eq!(log.chunk_used(0), 3);
    assert_eq!(log.inner_start(1), 42);

    log.push((4.0, 4));
    assert_eq!(log.chunk_used(1), 1);
    assert_eq!(log.len(), 4);
}

/// A reservation that still fits does not seal.
#[test]
fn exact_fit_does_not_seal() {
    let mut log = Log::new(2);
    log.reserve_items(2, 0);
    log.push((1.0, 1));
    log.push((2.0, 2));
    assert_eq!(log.cur_chunk(), 0);

    log.reserve_items(0, 99);
    assert_eq!(log.cur_chunk(), 0);
}

#[test]
fn positions_order_lexicographically() {
    let a = ChunkPosition { chunk: 0, data: 5, inner: 100u32 };
    let b = ChunkPosition { chunk: 1, data: 0, inner: 0u32 };
    let c = ChunkPosition { chunk: 1, data: 2, inner: 0u32 };
    let d = ChunkPosition { chunk: 1, data: 2, inner: 7u32 };
    assert!(a < b);
    assert!(b < c);
    assert!(c < d);
}

#[test]
fn positions_grow_during_recording() {
    let mut log = Log::new(2);
    let mut last = log.position(0);
    for i in 0..10 {
        log.reserve_items(1, i);
        log.push((i as f64, i));
        let pos = log.position(i);
        assert!(pos > last);
        last = pos;
    }
}

#[test]
fn reset_truncates_and_pools_chunks() {
    let mut log = Log::new(2);
    for i in 0..7u32 {
        log.reserve_items(1, i);
        log.push((i as f64, i));
    }
    assert_eq!(log.cur_chunk(), 3);

    let pos = ChunkPosition { chunk: 1, data: 1, inner: 3u32 };
    log.reset(&pos);
    assert_eq!(log.cur_chunk(), 1);
    assert_eq!(log.len(), 3);

    // pooled chunks are reused without fresh allocation and get a new
    // inner snapshot on entry
    log.reserve_items(2, 77);
    assert_eq!(log.cur_chunk(), 2);
    assert_eq!(log.chunk_used(2), 0);
    assert_eq!(log.inner_start(2), 77);
}

#[test]
fn reset_is_idempotent() {
    let mut log = Log::new(2);
    for i in 0..5u32 {
        log.reserve_items(1, i);
        log.push((i as f64, i));
    }
    let pos = ChunkPosition { chunk: 0, data: 2, inner: 2u32 };
    log.reset(&pos);
    let first = (log.cur_chunk(), log.len());
    log.reset(&pos);
    assert_eq!((log.cur_chunk(), log.len()), first);
}

#[test]
fn resize_preallocates_pool_chunks() {
    let mut log = Log::new(2);
    log.resize(10);
    // five chunks exist up front; none beyond the first is in use
    for chunk in 1..5 {
        assert_eq!(log.chunk_used(chunk), 0);
    }
    assert_eq!(log.cur_chunk(), 0);
    assert_eq!(log.len(), 0);
}

#[test]
#[should_panic]
fn oversized_reservation_panics() {
    let mut log = Log::new(2);
    log.reserve_items(1, 0);
    log.push((1.0, 1));
    log.push((2.0, 2));
    log.reserve_items(3, 0);
}

#[test]
#[should_panic]
fn push_beyond_capacity_panics() {
    let mut chunk = Chunk1::<u8>::with_capacity(1);
    chunk.push(1);
    chunk.push(2);
}

#[test]
fn chunk1_roundtrip() {
    let mut chunk = Chunk1::<u8>::with_capacity(4);
    chunk.push(3);
    chunk.push(7);
    assert_eq!(chunk.used(), 2);
    assert_eq!(chunk.remaining(), 2);
    assert_eq!(chunk.data(), &[3, 7]);

    chunk.truncate(1);
    assert_eq!(chunk.data(), &[3]);
}
