// # Fenceposts
//
// When enabled, every allocation is padded by 8 bytes on each side, each
// side carrying the pattern 0xdeadbeef twice. Frees and truncations check
// the posts before touching the memory; truncation rewrites the trailing
// post at the new end.
//
// Pools that use backend-side debugging skip MM fenceposts entirely; the
// two schemes are mutually exclusive per pool.

use std::ptr::NonNull;

use crate::error::{MmError, Result};
use crate::pool::Pool;

pub const FENCEPOST_VALUE: u32 = 0xdead_beef;

/// Bytes of fencepost on each side of an allocation.
pub const FENCEPOST_SIZE: usize = 8;

/// Fencepost bookkeeping for the front-end. `enabled` is fixed at
/// manager creation.
pub(crate) struct Fenceposts {
    enabled: bool,
}

impl Fenceposts {
    pub fn new(enabled: bool) -> Fenceposts {
        Fenceposts { enabled }
    }

    pub fn enabled_for(&self, pool: &Pool) -> bool {
        self.enabled && !pool.is_debug()
    }

    /// The backend size for a client size.
    pub fn adjust(&self, pool: &Pool, size: usize) -> usize {
        if self.enabled_for(pool) {
            size + 2 * FENCEPOST_SIZE
        } else {
            size
        }
    }

    /// Client pointer -> backend base pointer.
    pub fn below(&self, pool: &Pool, ptr: NonNull<u8>) -> NonNull<u8> {
        if self.enabled_for(pool) {
            unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(FENCEPOST_SIZE)) }
        } else {
            ptr
        }
    }

    /// Write both posts around a fresh backend block of `adjusted` bytes
    /// and return the client pointer.
    pub fn set(&self, pool: &Pool, base: NonNull<u8>, adjusted: usize) -> NonNull<u8> {
        if !self.enabled_for(pool) {
            return base;
        }
        unsafe {
            write_post(base.as_ptr());
            write_post(base.as_ptr().add(adjusted - FENCEPOST_SIZE));
            NonNull::new_unchecked(base.as_ptr().add(FENCEPOST_SIZE))
        }
    }

    /// Rewrite the trailing post after a truncation to `adjusted` bytes.
    pub fn truncate(&self, pool: &Pool, base: NonNull<u8>, adjusted: usize) {
        if !self.enabled_for(pool) {
            return;
        }
        unsafe {
            write_post(base.as_ptr().add(adjusted - FENCEPOST_SIZE));
        }
    }

    /// Check both posts of a live allocation (client pointer and size).
    pub fn check(&self, pool: &Pool, ptr: NonNull<u8>, size: usize) -> Result<()> {
        if !self.enabled_for(pool) {
            return Ok(());
        }
        unsafe {
            let lead = ptr.as_ptr().sub(FENCEPOST_SIZE);
            if !post_intact(lead) {
                return Err(MmError::FencepostCorrupted {
                    address: lead as usize,
                    which: "leading",
                });
            }
            let trail = ptr.as_ptr().add(size);
            if !post_intact(trail) {
                return Err(MmError::FencepostCorrupted {
                    address: trail as usize,
                    which: "trailing",
                });
            }
        }
        Ok(())
    }

}

unsafe fn write_post(p: *mut u8) {
    (p as *mut u32).write_unaligned(FENCEPOST_VALUE);
    (p.add(4) as *mut u32).write_unaligned(FENCEPOST_VALUE);
}

unsafe fn post_intact(p: *const u8) -> bool {
    (p as *const u32).read_unaligned() == FENCEPOST_VALUE
        && (p.add(4) as *const u32).read_unaligned() == FENCEPOST_VALUE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posts_roundtrip() {
        let mut buf = vec![0u8; 64];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe {
            write_post(base.as_ptr());
            assert!(post_intact(base.as_ptr()));
            buf[3] ^= 0x40;
            assert!(!post_intact(buf.as_ptr()));
        }
    }
}
