// Packet buffers.
//
// A control block over a shared data block. The block is refcounted so
// clones share bytes zero-copy; head/data/tail/end are offsets satisfying
// head <= data <= tail <= end. A buffer counts as cloned while its data
// block has more than one reference, and structural surgery (expanding the
// head) is refused in that state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Result, RtError};

struct PbData {
    buf: std::cell::UnsafeCell<Box<[u8]>>,
}

// Safety: byte mutation is gated on being the sole owner of the block
// (or on owning a disjoint [data, tail) region the writers respect).
unsafe impl Send for PbData {}
unsafe impl Sync for PbData {}

impl PbData {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: std::cell::UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    fn len(&self) -> usize {
        unsafe { (&*self.buf.get()).len() }
    }

    fn slice(&self, from: usize, to: usize) -> &[u8] {
        unsafe { &(&*self.buf.get())[from..to] }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, from: usize, to: usize) -> &mut [u8] {
        &mut (&mut *self.buf.get())[from..to]
    }
}

pub struct PBuff {
    data_block: Arc<PbData>,
    data: usize,
    tail: usize,
    cloned: std::sync::atomic::AtomicBool,
}

impl PBuff {
    /// A fresh buffer with `size` bytes of room; data and tail start at the
    /// head.
    pub fn with_capacity(size: usize) -> Self {
        log::debug!("alloc pbuff of {} bytes", size);
        Self {
            data_block: PbData::new(size),
            data: 0,
            tail: 0,
            cloned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Bytes of payload, `tail - data`.
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }

    /// Room in front of `data`.
    pub fn headroom(&self) -> usize {
        self.data
    }

    /// Room behind `tail`.
    pub fn tailroom(&self) -> usize {
        self.data_block.len() - self.tail
    }

    pub fn capacity(&self) -> usize {
        self.data_block.len()
    }

    /// Shares its data block with another buffer.
    pub fn is_cloned(&self) -> bool {
        self.cloned.load(Ordering::SeqCst) && Arc::strong_count(&self.data_block) > 1
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        self.data_block.slice(self.data, self.tail)
    }

    fn assert_sole_owner(&self, what: &str) {
        assert!(
            Arc::strong_count(&self.data_block) == 1,
            "{} on a cloned pbuff",
            what
        );
    }

    /// Set aside headroom; only legal on an empty buffer.
    pub fn reserve(&mut self, len: usize) {
        assert!(self.is_empty(), "reserve on a non-empty pbuff");
        assert!(self.tailroom() >= len, "reserve past the end");
        self.data += len;
        self.tail += len;
    }

    /// Extend the tail by `len` and return the fresh region for filling.
    pub fn put(&mut self, len: usize) -> &mut [u8] {
        self.assert_sole_owner("put");
        assert!(self.tailroom() >= len, "put past the end");
        let start = self.tail;
        self.tail += len;
        // Safety: sole owner checked above; the region is exclusive.
        unsafe { self.data_block.slice_mut(start, self.tail) }
    }

    /// Grow the payload toward the head by `len`, returning the prepended
    /// region.
    pub fn push(&mut self, len: usize) -> &mut [u8] {
        self.assert_sole_owner("push");
        assert!(self.headroom() >= len, "push past the head");
        self.data -= len;
        let end = self.data + len;
        // Safety: sole owner checked above.
        unsafe { self.data_block.slice_mut(self.data, end) }
    }

    /// Consume `len` bytes from the front of the payload.
    pub fn pull(&mut self, len: usize) -> &[u8] {
        assert!(self.len() >= len, "pull past the tail");
        let start = self.data;
        self.data += len;
        self.data_block.slice(start, self.data)
    }

    /// Cut the payload down to `len` bytes.
    pub fn trim(&mut self, len: usize) {
        assert!(len <= self.len(), "trim growing the payload");
        self.tail = self.data + len;
    }

    /// A second view of the same bytes; both buffers count as cloned until
    /// the other side goes away.
    pub fn clone_shared(&self) -> Self {
        self.cloned.store(true, Ordering::SeqCst);
        Self {
            data_block: self.data_block.clone(),
            data: self.data,
            tail: self.tail,
            cloned: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// A deep copy with its own block; headroom and payload preserved.
    pub fn copy_private(&self) -> Self {
        let mut fresh = Self::with_capacity(self.capacity());
        fresh.reserve(self.headroom());
        let len = self.len();
        if len > 0 {
            let src = self.payload().to_vec();
            fresh.put(len).copy_from_slice(&src);
        }
        fresh
    }

    /// Regrow the buffer with `nhead` extra bytes of headroom and `ntail`
    /// of tailroom. Refused while the block is shared.
    pub fn expand_head(&mut self, nhead: usize, ntail: usize) -> Result<()> {
        if Arc::strong_count(&self.data_block) > 1 {
            return Err(RtError::WrongState("expand of a shared pbuff"));
        }
        let fresh = PbData::new(nhead + self.capacity() + ntail);
        let old = self.data_block.slice(0, self.data_block.len());
        // Safety: the fresh block is unshared by construction.
        unsafe {
            fresh.slice_mut(nhead, nhead + old.len()).copy_from_slice(old);
        }
        self.data += nhead;
        self.tail += nhead;
        self.data_block = fresh;
        self.cloned.store(false, Ordering::SeqCst);
        log::debug!("expanded pbuff to {} bytes", self.capacity());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_hold_their_ordering() {
        let mut pb = PBuff::with_capacity(128);
        pb.reserve(32);
        assert_eq!(pb.headroom(), 32);
        pb.put(16).copy_from_slice(&[7u8; 16]);
        assert_eq!(pb.len(), 16);
        pb.push(4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(pb.len(), 20);
        assert_eq!(&pb.payload()[..4], &[1, 2, 3, 4]);
        assert_eq!(pb.pull(4), &[1, 2, 3, 4]);
        assert_eq!(pb.len(), 16);
        pb.trim(8);
        assert_eq!(pb.len(), 8);
        assert_eq!(pb.headroom() + pb.len() + pb.tailroom(), pb.capacity());
    }

    #[test]
    fn clone_then_drop_leaves_original_intact() {
        let mut pb = PBuff::with_capacity(64);
        pb.put(8).copy_from_slice(b"payload!");
        let snapshot = pb.payload().to_vec();

        let clone = pb.clone_shared();
        assert!(pb.is_cloned());
        assert_eq!(clone.payload(), &snapshot[..]);
        drop(clone);

        assert_eq!(pb.payload(), &snapshot[..]);
        assert!(!pb.is_cloned());
    }

    #[test]
    fn copy_matches_original_payload() {
        let mut pb = PBuff::with_capacity(96);
        pb.reserve(16);
        pb.put(24).copy_from_slice(&[0xabu8; 24]);
        let copy = pb.copy_private();
        assert_eq!(copy.headroom(), pb.headroom());
        assert_eq!(copy.payload(), pb.payload());
    }

    #[test]
    fn expand_refused_while_shared() {
        let mut pb = PBuff::with_capacity(32);
        pb.put(4).copy_from_slice(&[9u8; 4]);
        let clone = pb.clone_shared();
        assert!(matches!(
            pb.expand_head(16, 16),
            Err(RtError::WrongState(_))
        ));
        drop(clone);
        pb.expand_head(16, 16).unwrap();
        assert_eq!(pb.headroom(), 16);
        assert_eq!(pb.payload(), &[9u8; 4]);
        assert_eq!(pb.capacity(), 64);
    }
}
