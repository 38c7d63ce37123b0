//! Shareable buffer memory.
//!
//! - [`DmaBuf`]: one zero-copy buffer with a descriptor identity and a lazy
//!   CPU mapping
//! - [`DmaBufAllocator`]: where buffers come from ([`DmaHeapAllocator`] for
//!   hardware, [`MemfdAllocator`] for CPU-only use and tests)
//! - [`round_up_size`]: the size classes used when a source buffer must grow

mod alloc;
mod dmabuf;

pub use alloc::{DMA_HEAP_CANDIDATES, DmaBufAllocator, DmaHeapAllocator, MemfdAllocator};
pub use dmabuf::DmaBuf;

/// Smallest size class handed out when a buffer grows.
pub const MIN_ROUNDED_SIZE: usize = 256;

/// Round `x` up to the next size class.
///
/// Classes are 256 and then `3 << n` / `4 << n`, so growth steps alternate
/// between x1.5 and x1.33 and repeated small overruns do not thrash the
/// allocator.
pub fn round_up_size(x: usize) -> usize {
    if x <= MIN_ROUNDED_SIZE {
        return MIN_ROUNDED_SIZE;
    }
    // Smallest class strictly above m = x - 1, with 2^k <= m < 2^(k+1).
    let m = x - 1;
    let k = usize::BITS - 1 - m.leading_zeros();
    let three = 3usize << (k - 1);
    if m < three { three } else { 4usize << (k - 1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_size_examples() {
        assert_eq!(round_up_size(0), 256);
        assert_eq!(round_up_size(100), 256);
        assert_eq!(round_up_size(256), 256);
        assert_eq!(round_up_size(257), 384);
        assert_eq!(round_up_size(384), 384);
        assert_eq!(round_up_size(385), 512);
        assert_eq!(round_up_size(768), 768);
        assert_eq!(round_up_size(769), 1024);
        assert_eq!(round_up_size(1_000_000), 1 << 20);
    }

    #[test]
    fn test_round_up_size_is_smallest_class() {
        let mut classes = vec![256usize];
        for n in 7..30 {
            classes.push(3 << n);
            classes.push(4 << n);
        }
        classes.sort_unstable();
        classes.dedup();

        for s in (0..70_000).step_by(7) {
            let b = round_up_size(s);
            let expected = *classes.iter().find(|&&c| c >= s).unwrap();
            assert_eq!(b, expected, "size {}", s);
        }
    }
}
