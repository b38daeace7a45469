//! # Video Ring
//!
//! Fixed-capacity circular buffer of decoded frames shared by the decode
//! thread (producer) and the render thread (consumer).
//!
//! ```text
//!   delete                insert
//!     │                     │
//!   ┌─▼──┬────┬────┬────┬──▼─┬────┐
//!   │ F0 │ F1 │ F2 │ F3 │back│    │
//!   └────┴────┴────┴────┴────┴────┘
//!    front ──────────────►  push()
//! ```
//!
//! Slots are allocated once and reused in place. The index lock only covers
//! bookkeeping; the producer fills `back()` and the consumer reads `front()`
//! without holding it. The producer must never `push()` into a full ring:
//! the decode engine evicts with `pop()` first, keeping at most
//! `capacity - 1` frames so the slot a consumer is reading is never the one
//! being written.

use parking_lot::{Mutex, MutexGuard};

use crate::error::{MediaError, Result};
use crate::frame::VideoFrame;

#[derive(Debug, Default, Clone, Copy)]
struct RingIndex {
    size: usize,
    insert: usize,
    delete: usize,
}

pub struct VideoRing {
    slots: Vec<Mutex<VideoFrame>>,
    index: Mutex<RingIndex>,
}

impl VideoRing {
    /// Allocate `capacity` reusable slots. Capacity must be at least 2.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity <= 1 {
            return Err(MediaError::Allocation(format!(
                "video ring capacity must be > 1, got {}",
                capacity
            )));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| MediaError::Allocation(format!("video ring slots: {}", e)))?;
        slots.extend((0..capacity).map(|_| Mutex::new(VideoFrame::new())));

        Ok(Self {
            slots,
            index: Mutex::new(RingIndex::default()),
        })
    }

    /// The slot the producer is filling. Same slot until `push()`.
    ///
    /// Drop the guard before calling `push()`.
    pub fn back(&self) -> MutexGuard<'_, VideoFrame> {
        let insert = self.index.lock().insert;
        self.slots[insert].lock()
    }

    /// Commit the back slot.
    pub fn push(&self) {
        let mut index = self.index.lock();
        debug_assert!(index.size < self.slots.len(), "push into a full video ring");
        index.insert = (index.insert + 1) % self.slots.len();
        index.size += 1;
    }

    /// The oldest committed frame, if any.
    pub fn front(&self) -> Option<MutexGuard<'_, VideoFrame>> {
        let index = *self.index.lock();
        if index.size == 0 {
            return None;
        }
        Some(self.slots[index.delete].lock())
    }

    /// Release the oldest frame and advance. No-op when empty.
    pub fn pop(&self) {
        let delete = {
            let index = self.index.lock();
            if index.size == 0 {
                return;
            }
            index.delete
        };

        self.slots[delete].lock().unref();

        let mut index = self.index.lock();
        index.delete = (index.delete + 1) % self.slots.len();
        index.size -= 1;
    }

    pub fn size(&self) -> usize {
        self.index.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free every slot's pixel buffers and reset to empty. Slots stay allocated.
    pub fn clear(&self) {
        let mut index = self.index.lock();
        for slot in &self.slots {
            slot.lock().release();
        }
        *index = RingIndex::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn fill(ring: &VideoRing, pts: i64) {
        {
            let mut slot = ring.back();
            slot.alloc(8, 8, PixelFormat::Yuv420p);
            slot.pts = Some(pts);
        }
        ring.push();
    }

    #[test]
    fn test_capacity_must_exceed_one() {
        assert!(matches!(VideoRing::with_capacity(0), Err(MediaError::Allocation(_))));
        assert!(matches!(VideoRing::with_capacity(1), Err(MediaError::Allocation(_))));
        assert_eq!(VideoRing::with_capacity(2).unwrap().capacity(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let ring = VideoRing::with_capacity(4).unwrap();
        for pts in 0..3 {
            fill(&ring, pts);
        }
        assert_eq!(ring.size(), 3);

        for expected in 0..3 {
            assert_eq!(ring.front().unwrap().pts, Some(expected));
            ring.pop();
        }
        assert!(ring.front().is_none());
    }

    #[test]
    fn test_back_is_stable_until_push() {
        let ring = VideoRing::with_capacity(3).unwrap();
        ring.back().pts = Some(7);
        assert_eq!(ring.back().pts, Some(7));
        assert_eq!(ring.size(), 0);
        ring.push();
        assert_eq!(ring.front().unwrap().pts, Some(7));
    }

    #[test]
    fn test_evict_then_push_never_exceeds_max() {
        let capacity = 5;
        let ring = VideoRing::with_capacity(capacity).unwrap();
        let max = capacity - 1;

        for pts in 0..50 {
            if ring.size() == max {
                ring.pop();
            }
            fill(&ring, pts);
            assert!(ring.size() <= max);
        }
        // Oldest surviving frame is the one pushed max frames ago
        assert_eq!(ring.front().unwrap().pts, Some(50 - max as i64));
    }

    #[test]
    fn test_pop_on_empty_is_noop() {
        let ring = VideoRing::with_capacity(2).unwrap();
        ring.pop();
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn test_clear_releases_buffers() {
        let ring = VideoRing::with_capacity(3).unwrap();
        fill(&ring, 0);
        fill(&ring, 1);
        ring.clear();

        assert!(ring.is_empty());
        assert_eq!(ring.back().allocated_bytes(), 0);
        fill(&ring, 9);
        assert_eq!(ring.front().unwrap().pts, Some(9));
    }

    #[test]
    fn test_producer_consumer_threads() {
        use std::sync::Arc;

        let ring = Arc::new(VideoRing::with_capacity(4).unwrap());
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut pts = 0;
                while pts < 200 {
                    if ring.size() < ring.capacity() - 1 {
                        fill(&ring, pts);
                        pts += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < 200 {
            let next = ring.front().map(|f| f.pts);
            match next {
                Some(pts) => {
                    assert_eq!(pts, Some(expected));
                    ring.pop();
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
