//! Segment pool for message-queue payloads.
//!
//! Payload bytes never travel as one allocation: a send splits them into
//! fixed-size cells which are linked into the queue's chain in order. The
//! pool bounds how many cells exist at once across all queues; the cells
//! themselves are owned by the chains holding them.

use alloc::vec::Vec;

use spin::Mutex;

use crate::util::{IpcError, IpcResult};

/// Bytes of payload one segment can carry.
pub const MSGSSZ: usize = 512;

/// Total number of segments available to all queues.
pub const MSGSEG: usize = 1024;

/// One payload cell; owned by exactly one queue chain once linked.
pub struct Segment {
    used: usize,
    text: [u8; MSGSSZ],
}

impl Segment {
    fn from_chunk(chunk: &[u8]) -> Self {
        debug_assert!(chunk.len() <= MSGSSZ);
        let mut text = [0u8; MSGSSZ];
        text[..chunk.len()].copy_from_slice(chunk);
        Self { used: chunk.len(), text }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.text[..self.used]
    }
}

/// Global segment budget.
pub struct SegmentPool {
    capacity: usize,
    free: Mutex<usize>,
}

impl SegmentPool {
    pub const fn new(capacity: usize) -> Self {
        Self { capacity, free: Mutex::new(capacity) }
    }

    /// Segments needed for a payload of `len` bytes.
    pub fn segs_for(len: usize) -> usize {
        len.div_ceil(MSGSSZ)
    }

    /// Materialize the full chain for a payload, all-or-nothing.
    ///
    /// The budget for every cell is reserved up front; on exhaustion
    /// nothing is reserved and the caller's queue is untouched. A
    /// zero-length payload yields an empty chain.
    pub fn build_chain(&self, payload: &[u8]) -> IpcResult<Vec<Segment>> {
        let need = Self::segs_for(payload.len());
        {
            let mut free = self.free.lock();
            if *free < need {
                return Err(IpcError::OutOfMemory);
            }
            *free -= need;
        }
        let mut chain = Vec::with_capacity(need);
        for chunk in payload.chunks(MSGSSZ) {
            chain.push(Segment::from_chunk(chunk));
        }
        Ok(chain)
    }

    /// Return drained cells to the budget.
    pub fn release(&self, count: usize) {
        let mut free = self.free.lock();
        *free += count;
        assert!(*free <= self.capacity, "seg: pool budget over-released");
    }

    /// Cells currently available.
    pub fn available(&self) -> usize {
        *self.free.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segs_for_rounds_up() {
        assert_eq!(SegmentPool::segs_for(0), 0);
        assert_eq!(SegmentPool::segs_for(1), 1);
        assert_eq!(SegmentPool::segs_for(MSGSSZ), 1);
        assert_eq!(SegmentPool::segs_for(MSGSSZ + 1), 2);
        assert_eq!(SegmentPool::segs_for(3 * MSGSSZ), 3);
    }

    #[test]
    fn build_chain_splits_payload_in_order() {
        let pool = SegmentPool::new(8);
        let payload: Vec<u8> = (0..(MSGSSZ + 100)).map(|i| i as u8).collect();
        let chain = pool.build_chain(&payload).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].len(), MSGSSZ);
        assert_eq!(chain[1].len(), 100);
        assert_eq!(chain[0].bytes(), &payload[..MSGSSZ]);
        assert_eq!(chain[1].bytes(), &payload[MSGSSZ..]);
        assert_eq!(pool.available(), 6);
    }

    #[test]
    fn zero_length_payload_builds_empty_chain() {
        let pool = SegmentPool::new(4);
        let chain = pool.build_chain(&[]).unwrap();
        assert!(chain.is_empty());
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn exhaustion_reserves_nothing() {
        let pool = SegmentPool::new(2);
        let payload = [0u8; 3 * MSGSSZ];
        assert!(matches!(pool.build_chain(&payload), Err(IpcError::OutOfMemory)));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn release_restores_budget() {
        let pool = SegmentPool::new(4);
        let chain = pool.build_chain(&[7u8; 2 * MSGSSZ]).unwrap();
        assert_eq!(pool.available(), 2);
        pool.release(chain.len());
        assert_eq!(pool.available(), 4);
    }
}
