// Saturating 32-bit reference counter.
//
// Once the count crosses the saturation threshold it is pinned there and the
// object leaks rather than risking a use-after-free on overflow.

use std::sync::atomic::{AtomicU32, Ordering};

const SATURATED: u32 = 0x8000_0000;

pub struct Uref(AtomicU32);

impl Default for Uref {
    fn default() -> Self {
        Self::new()
    }
}

impl Uref {
    /// A fresh counter holding one reference.
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub const fn zero() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn read(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, val: u32) {
        self.0.store(val, Ordering::SeqCst);
    }

    /// Take a reference. The counter must not be zero.
    #[inline]
    pub fn get(&self) {
        let prev = self.0.fetch_add(1, Ordering::Relaxed);
        assert!(prev != 0, "uref_get on a dead object");
        if prev >= SATURATED {
            // Pinned; undo so the counter cannot wrap.
            self.0.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Take a reference unless the counter is already zero. Returns whether
    /// a reference was taken.
    pub fn get_unless_zero(&self) -> bool {
        let mut val = self.0.load(Ordering::SeqCst);
        loop {
            if val == 0 {
                return false;
            }
            if val >= SATURATED {
                return true;
            }
            match self
                .0
                .compare_exchange_weak(val, val + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(v) => val = v,
            }
        }
    }

    /// Drop a reference; returns `true` when this was the last one and the
    /// caller must release the object.
    #[inline]
    #[must_use]
    pub fn put(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "uref_put on a dead object");
        if prev >= SATURATED {
            self.0.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        prev == 1
    }
}
