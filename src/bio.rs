//! The buffer cache: in-memory copies of disk blocks, and the
//! synchronization point for processes that touch the same block.
//!
//! Buffers are indexed by a hash table of NBUCKET chains, each chain
//! under its own lock, so lookups of different blocks don't contend.
//! A miss takes the single eviction lock, re-checks its bucket (the
//! block may have been brought in while we waited), then picks the
//! unreferenced buffer with the oldest release tick across all
//! buckets and re-keys it. During that sweep at most the current
//! bucket's lock plus the current winner's are held, acquired in
//! ascending bucket order; only the eviction-lock holder ever holds
//! two, so no cycle can form with the single-bucket hit path.
//!
//! At most one buffer ever holds a given (device, blockno): a hit
//! pins the buffer via its bucket chain, and a victim is unlinked
//! from its old chain before it takes a new identity.

use array_macro::array;

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut, Index, IndexMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    param::MAXOPBLOCKS,
    sleeplock::{SleepLock, SleepLockGuard},
    spinlock::{SpinLock, SpinLockGuard},
    trap,
    virtio::DISK,
};

pub const NBUF: usize = MAXOPBLOCKS * 3; // size of disk block cache
pub const BSIZE: usize = 4096; // size of disk block
const NBUCKET: usize = 13;

pub static BCACHE: BCache = BCache::new();

#[inline]
fn bucket_of(dev: u32, blockno: u32) -> usize {
    (((dev as usize) << 27) | blockno as usize) % NBUCKET
}

pub struct BCache {
    buckets: [SpinLock<Bucket>; NBUCKET],
    // serializes misses, so two processes can't both evict a buffer
    // for the same block.
    evict_lock: SpinLock<()>,
    meta: MetaTable,
    bufs: [Buf; NBUF],
}

impl BCache {
    const fn new() -> Self {
        Self {
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache_bucket"); NBUCKET],
            evict_lock: SpinLock::new((), "bcache_evict"),
            meta: MetaTable::new(),
            bufs: array![_ => Buf::new(); NBUF],
        }
    }

    /// Chain every buffer into bucket 0; they spread out as they are
    /// re-keyed on demand.
    pub fn init(&self) {
        let mut bucket = self.buckets[0].lock();
        for i in 0..NBUF {
            let meta = unsafe { self.meta.get(i) };
            meta.next = bucket.head.replace(i);
        }
        drop(bucket);
    }

    /// Return a locked buffer holding the contents of the block.
    pub fn bread(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let mut buf = self.bget(dev, blockno);

        if !self.bufs[buf.index].valid.load(Ordering::Relaxed) {
            DISK.read(&mut buf);
            self.bufs[buf.index].valid.store(true, Ordering::Relaxed);
        }
        buf
    }

    /// Look up a buffer for the block, evicting if necessary, and
    /// take its sleep-lock.
    fn bget(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let key = bucket_of(dev, blockno);

        {
            let bucket = self.buckets[key].lock();
            if let Some(i) = Self::scan(&bucket, &self.meta, dev, blockno) {
                unsafe { self.meta.get(i) }.refcnt += 1;
                drop(bucket);
                return self.take_locked(i, dev, blockno);
            }
        }

        // miss. serialize with other misses, then re-check: the
        // block may have appeared while the bucket lock was dropped.
        let evict = self.evict_lock.lock();

        {
            let bucket = self.buckets[key].lock();
            if let Some(i) = Self::scan(&bucket, &self.meta, dev, blockno) {
                unsafe { self.meta.get(i) }.refcnt += 1;
                drop(bucket);
                drop(evict);
                return self.take_locked(i, dev, blockno);
            }
        }

        // sweep all buckets for the least-recently-released free
        // buffer, keeping the lock of the bucket holding the best
        // candidate so it cannot be taken from under us.
        let mut winner: Option<(usize, usize)> = None; // (bucket, buffer)
        let mut held: Option<SpinLockGuard<'_, Bucket>> = None;

        for bi in 0..NBUCKET {
            let bucket = self.buckets[bi].lock();

            let mut improved = false;
            let mut link = bucket.head;
            while let Some(i) = link {
                let meta = unsafe { self.meta.get(i) };
                if meta.refcnt == 0 {
                    let better = match winner {
                        None => true,
                        Some((_, w)) => meta.last_use < unsafe { self.meta.get(w) }.last_use,
                    };
                    if better {
                        winner = Some((bi, i));
                        improved = true;
                    }
                }
                link = meta.next;
            }

            if improved {
                // keep this bucket's lock; release the previous
                // winner's (assignment drops the old guard).
                held = Some(bucket);
            }
        }

        let index = match winner {
            Some((_, index)) => index,
            None => panic!("bcache: no buffers"),
        };
        let mut winner_guard = held.unwrap();

        // unlink the victim; once out of its chain no lookup can see
        // it, and the eviction lock keeps other misses away.
        Self::unlink(&mut winner_guard, &self.meta, index);
        drop(winner_guard);

        let meta = unsafe { self.meta.get(index) };
        meta.dev = dev;
        meta.blockno = blockno;
        meta.refcnt = 1;
        self.bufs[index].valid.store(false, Ordering::Relaxed);

        // hang it into the target bucket.
        let mut bucket = self.buckets[key].lock();
        meta.next = bucket.head.replace(index);
        drop(bucket);

        drop(evict);
        self.take_locked(index, dev, blockno)
    }

    fn take_locked(&self, index: usize, dev: u32, blockno: u32) -> BufGuard<'_> {
        BufGuard {
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    fn scan(bucket: &Bucket, meta: &MetaTable, dev: u32, blockno: u32) -> Option<usize> {
        let mut link = bucket.head;
        while let Some(i) = link {
            let m = unsafe { meta.get(i) };
            if m.dev == dev && m.blockno == blockno {
                return Some(i);
            }
            link = m.next;
        }
        None
    }

    fn unlink(bucket: &mut Bucket, meta: &MetaTable, index: usize) {
        let mut link = bucket.head;
        if link == Some(index) {
            bucket.head = unsafe { meta.get(index) }.next.take();
            return;
        }
        while let Some(i) = link {
            let m = unsafe { meta.get(i) };
            if m.next == Some(index) {
                m.next = unsafe { meta.get(index) }.next.take();
                return;
            }
            link = m.next;
        }
        panic!("bcache: buffer not in its bucket");
    }

    /// Drop one reference; stamp the release tick when the last one
    /// goes, for the eviction sweep.
    fn brelse(&self, index: usize, dev: u32, blockno: u32) {
        let bucket = self.buckets[bucket_of(dev, blockno)].lock();
        let meta = unsafe { self.meta.get(index) };
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            meta.last_use = trap::ticks_now();
        }
        drop(bucket);
    }

    fn pin(&self, index: usize, dev: u32, blockno: u32) {
        let bucket = self.buckets[bucket_of(dev, blockno)].lock();
        unsafe { self.meta.get(index) }.refcnt += 1;
        drop(bucket);
    }

    fn unpin(&self, index: usize, dev: u32, blockno: u32) {
        let bucket = self.buckets[bucket_of(dev, blockno)].lock();
        let meta = unsafe { self.meta.get(index) };
        if meta.refcnt < 1 {
            panic!("bcache: unpin");
        }
        meta.refcnt -= 1;
        drop(bucket);
    }
}

struct Bucket {
    head: Option<usize>,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: None }
    }
}

/// Per-buffer bookkeeping: identity, reference count, release tick
/// and the bucket chain link. Each entry is protected by the lock of
/// the bucket currently holding it (the eviction lock covers the
/// window while a victim migrates between chains).
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    last_use: usize,
    next: Option<usize>,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            last_use: 0,
            next: None,
        }
    }
}

struct MetaTable(UnsafeCell<[BufMeta; NBUF]>);

// https://doc.rust-lang.org/nomicon/send-and-sync.html
unsafe impl Sync for MetaTable {}

impl MetaTable {
    const fn new() -> Self {
        Self(UnsafeCell::new(array![_ => BufMeta::new(); NBUF]))
    }

    /// Caller must hold the lock of the bucket the entry belongs to.
    #[allow(clippy::mut_from_ref)]
    unsafe fn get(&self, i: usize) -> &mut BufMeta {
        &mut (*self.0.get())[i]
    }
}

pub struct BufGuard<'a> {
    index: usize,
    pub dev: u32,
    pub blockno: u32,
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> BufGuard<'a> {
    pub fn data_ptr(&self) -> *const BufData {
        let guard = self.data.as_ref().unwrap();
        guard.deref()
    }

    pub fn data_ptr_mut(&mut self) -> *mut BufData {
        let guard = self.data.as_mut().unwrap();
        guard.deref_mut()
    }

    /// Write the buffer's contents to disk.
    pub fn bwrite(&mut self) {
        DISK.write(self);
    }

    /// Keep the buffer in the cache after this guard drops; the log
    /// pins dirty buffers until their transaction commits.
    pub fn pin(&self) {
        BCACHE.pin(self.index, self.dev, self.blockno);
    }

    pub fn unpin(&self) {
        BCACHE.unpin(self.index, self.dev, self.blockno);
    }
}

impl<'a> Drop for BufGuard<'a> {
    fn drop(&mut self) {
        // release the sleep-lock before giving up the reference.
        drop(self.data.take());
        BCACHE.brelse(self.index, self.dev, self.blockno);
    }
}

struct Buf {
    // has data been read from disk?
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl Buf {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "bcache_data"),
        }
    }
}

#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Index<usize> for BufData {
    type Output = u8;
    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<usize> for BufData {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn cache_hit_returns_same_buffer() {
        let b = BCACHE.bread(1, 1);
        let first = b.data_ptr() as usize;
        let index = b.index;
        drop(b);

        let b = BCACHE.bread(1, 1);
        assert_eq!(first, b.data_ptr() as usize);
        assert_eq!(index, b.index);
        drop(b);
    }

    #[test_case]
    fn no_duplicate_for_same_block() {
        // two handles for distinct blocks never share a buffer; a
        // re-read of either maps back to its own buffer.
        let b1 = BCACHE.bread(1, 2);
        let b2 = BCACHE.bread(1, 3);
        assert!(b1.index != b2.index);
        let i1 = b1.index;
        drop(b1);
        drop(b2);

        let b1 = BCACHE.bread(1, 2);
        assert_eq!(i1, b1.index);
        drop(b1);
    }

    #[test_case]
    fn eviction_recycles_buffers() {
        let b = BCACHE.bread(1, 100);
        let old_index = b.index;
        drop(b);

        // touch more distinct blocks than there are buffers so the
        // oldest release gets recycled.
        for blockno in 200..(200 + NBUF as u32 + 2) {
            let b = BCACHE.bread(1, blockno);
            drop(b);
        }

        // block 100 went out, and reading it again still works.
        let b = BCACHE.bread(1, 100);
        assert_eq!(100, b.blockno);
        drop(b);
        let _ = old_index;
    }

    #[test_case]
    fn pin_survives_release() {
        let b = BCACHE.bread(1, 150);
        let index = b.index;
        b.pin();
        drop(b);

        // pinned: even after NBUF distinct reads it must still be
        // resident with the same identity.
        for blockno in 300..(300 + NBUF as u32) {
            let b = BCACHE.bread(1, blockno);
            drop(b);
        }

        let b = BCACHE.bread(1, 150);
        assert_eq!(index, b.index);
        b.unpin();
        drop(b);
    }
}
