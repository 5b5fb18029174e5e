//! # Stream Tag Pool
//!
//! Fixed-size bitmap of stream tags with a rotating cursor. Tags are numbered
//! `1..=capacity`; 0 never names a slot.
//!
//! Allocation scans forward from the cursor and wraps, so a tag that was just
//! released is the last one to be handed out again.

use core::fmt;

/// Maximum pool capacity
pub const MAX_TAGS: u16 = 16;

/// A stream tag as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u16);

impl Tag {
    /// The fixed stream used by single-stream devices
    pub const UNTAGGED: Tag = Tag(1);

    /// Wrap a raw tag, rejecting the invalid value 0
    pub const fn new(raw: u16) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw tag value
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round-robin tag allocator
#[derive(Debug, Clone)]
pub struct TagPool {
    /// Bit `n` set means tag `n` is held
    bitmap: u32,
    capacity: u16,
    available: u16,
    /// Next tag to probe
    cursor: u16,
}

impl TagPool {
    /// Create a pool with `capacity` tags, clamped to [`MAX_TAGS`]
    pub fn new(capacity: u16) -> Self {
        let mut pool = Self {
            bitmap: 0,
            capacity: 0,
            available: 0,
            cursor: 1,
        };
        pool.reset(capacity);
        pool
    }

    /// Empty pool, every acquire fails
    pub const fn empty() -> Self {
        Self {
            bitmap: 0,
            capacity: 0,
            available: 0,
            cursor: 1,
        }
    }

    /// Re-initialise with a new capacity, dropping every held tag
    pub fn reset(&mut self, capacity: u16) {
        self.capacity = capacity.min(MAX_TAGS);
        self.available = self.capacity;
        self.bitmap = 0;
        self.cursor = 1;
    }

    /// Take the next free tag
    pub fn acquire(&mut self) -> Option<Tag> {
        if self.available == 0 {
            return None;
        }
        self.available -= 1;

        let mut probe = self.cursor;
        for _ in 0..self.capacity {
            if probe == 0 || probe > self.capacity {
                probe = 1;
            }
            let bit = 1u32 << probe;
            if self.bitmap & bit == 0 {
                self.bitmap |= bit;
                self.cursor = if probe >= self.capacity { 1 } else { probe + 1 };
                return Some(Tag(probe));
            }
            probe += 1;
        }

        // Counter said there was room but the bitmap disagrees
        log::warn!("[uas] tag pool: no free slot with {} reported available", self.available + 1);
        self.available += 1;
        None
    }

    /// Return a tag to the pool
    ///
    /// Out-of-range and currently-free tags are ignored.
    pub fn release(&mut self, tag: Tag) {
        let slot = tag.get();
        if slot == 0 || slot > self.capacity {
            return;
        }
        let bit = 1u32 << slot;
        if self.bitmap & bit == 0 {
            log::debug!("[uas] tag pool: release of free tag {}", slot);
            return;
        }
        self.bitmap &= !bit;
        self.available += 1;
    }

    /// Number of free tags
    pub fn available(&self) -> u16 {
        self.available
    }

    /// Total number of tags
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Allocation
    // =========================================================================

    #[test]
    fn test_acquire_in_order() {
        let mut pool = TagPool::new(4);
        let tags: Vec<u16> = (0..4).map(|_| pool.acquire().unwrap().get()).collect();
        assert_eq!(tags, vec![1, 2, 3, 4]);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_released_tag_not_reused_immediately() {
        let mut pool = TagPool::new(3);
        let first = pool.acquire().unwrap();
        pool.release(first);

        let next = pool.acquire().unwrap();
        assert_ne!(next, first);
        assert_eq!(next.get(), 2);
    }

    #[test]
    fn test_cursor_wraps() {
        let mut pool = TagPool::new(3);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        let _c = pool.acquire().unwrap();
        pool.release(a);

        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn test_capacity_clamped() {
        let pool = TagPool::new(40);
        assert_eq!(pool.capacity(), MAX_TAGS);
        assert_eq!(pool.available(), MAX_TAGS);
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = TagPool::empty();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);
    }

    // =========================================================================
    // Counter invariant
    // =========================================================================

    #[test]
    fn test_available_matches_bitmap() {
        let mut pool = TagPool::new(MAX_TAGS);
        let mut held = Vec::new();
        for round in 0..50u16 {
            if round % 3 == 2 {
                if let Some(tag) = held.pop() {
                    pool.release(tag);
                }
            } else if let Some(tag) = pool.acquire() {
                assert!(!held.contains(&tag));
                held.push(tag);
            }
            let in_use = pool.bitmap.count_ones() as u16;
            assert_eq!(pool.available(), pool.capacity() - in_use);
            assert_eq!(in_use as usize, held.len());
        }
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut pool = TagPool::new(2);
        let tag = pool.acquire().unwrap();
        pool.release(tag);
        pool.release(tag);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_release_out_of_range() {
        let mut pool = TagPool::new(2);
        pool.release(Tag::new(9).unwrap());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_invalid_tag() {
        assert!(Tag::new(0).is_none());
        assert_eq!(Tag::UNTAGGED.get(), 1);
    }

    #[test]
    fn test_reset_drops_held() {
        let mut pool = TagPool::new(4);
        let tag = pool.acquire().unwrap();
        pool.reset(2);
        assert_eq!(pool.bitmap & (1u32 << tag.get()), 0);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.acquire().unwrap().get(), 1);
    }
}
