//! Sliding-window packet identity deduplication
//!
//! Two bitsets of `W` bits each cover `[head - W, head)` ("old") and
//! `[head, head + W)` ("current"). An identity between `head + W` and
//! `head + 2W` slides both forward by one full window. Anything further out
//! in either direction is rejected without touching state.

/// Default window width in packet identities
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// Smallest accepted window width; one bitset word
pub const MIN_DEDUP_WINDOW: usize = 64;

#[derive(Debug, Clone)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits / 64],
        }
    }

    /// Set `bit`, returning whether it was clear before
    fn test_and_set(&mut self, bit: usize) -> bool {
        let (word, mask) = (bit / 64, 1u64 << (bit % 64));
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

/// Duplicate filter over a monotonically increasing `u64` identity space
///
/// Not internally synchronized; callers serialize access.
#[derive(Debug, Clone)]
pub struct PacketIdentityWindow {
    width: u64,
    head: u64,
    old: BitSet,
    current: BitSet,
}

impl PacketIdentityWindow {
    /// `width` must be a power of two no smaller than 64; other values are
    /// rounded up to the next one that is.
    pub fn new(width: usize) -> Self {
        let width = width.max(MIN_DEDUP_WINDOW).next_power_of_two();
        Self {
            width: width as u64,
            head: 0,
            old: BitSet::new(width),
            current: BitSet::new(width),
        }
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    /// Lowest identity in the current half
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Accept `id` if it is in range and has not been seen before
    pub fn test(&mut self, id: u64) -> bool {
        let w = self.width;
        loop {
            if id < self.head.saturating_sub(w) || id >= self.head.saturating_add(2 * w) {
                return false;
            }

            if id < self.head {
                let bit = (id - (self.head - w)) as usize;
                return self.old.test_and_set(bit);
            }
            if id < self.head + w {
                let bit = (id - self.head) as usize;
                return self.current.test_and_set(bit);
            }

            // A full window ahead: the current half becomes old and the
            // stale old bitset is reused, cleared, as the new current half.
            std::mem::swap(&mut self.old, &mut self.current);
            self.current.clear();
            self.head += w;
        }
    }
}

impl Default for PacketIdentityWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
