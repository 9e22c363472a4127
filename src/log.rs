//! The write-ahead log makes each file-system operation's block
//! writes atomic across crashes.
//!
//! An operation brackets its writes with begin_op/end_op; the blocks
//! it dirties go to the log region first, and only once the header
//! block records them (the commit point) are they copied home.
//! Several operations may share one commit: the last one out runs it.
//! Recovery at boot re-installs whatever the header names, which is
//! idempotent, and discards anything that never reached the header.

use core::{ops::DerefMut, ptr};

use crate::{
    bio::{BufGuard, BCACHE},
    cpu::CPU_TABLE,
    param::MAXOPBLOCKS,
    proc::Event,
    process::PROCESS_TABLE,
    spinlock::SpinLock,
    superblock::SuperBlock,
};

pub const LOGSIZE: usize = MAXOPBLOCKS * 3; // max data blocks in on-disk log

pub static LOG: SpinLock<Log> = SpinLock::new(Log::new(), "log");

/// In-memory copy of the log header block: the number of pending
/// blocks and their home block numbers.
struct LogHeader {
    n: u32,
    blocknos: [u32; LOGSIZE],
}

impl LogHeader {
    const fn new() -> Self {
        Self {
            n: 0,
            blocknos: [0; LOGSIZE],
        }
    }

    /// decode from the on-disk header block (little-endian u32s,
    /// count first).
    unsafe fn decode(&mut self, data: *const u8) {
        self.n = read_le32(data, 0);
        for (i, bno) in self.blocknos.iter_mut().enumerate() {
            *bno = read_le32(data, 4 + 4 * i);
        }
    }

    unsafe fn encode(&self, data: *mut u8) {
        write_le32(data, 0, self.n);
        for (i, bno) in self.blocknos.iter().enumerate() {
            write_le32(data, 4 + 4 * i, *bno);
        }
    }
}

#[inline]
unsafe fn read_le32(data: *const u8, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    ptr::copy_nonoverlapping(data.add(offset), bytes.as_mut_ptr(), 4);
    u32::from_le_bytes(bytes)
}

#[inline]
unsafe fn write_le32(data: *mut u8, offset: usize, v: u32) {
    let bytes = v.to_le_bytes();
    ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(offset), 4);
}

pub struct Log {
    start: u32,
    size: u32,
    outstanding: usize, // how many FS sys calls are executing.
    committing: bool,   // in commit(), please wait.
    dev: u32,
    header: LogHeader,
}

impl SpinLock<Log> {
    /// Recover the log at mount. Must be called from process context
    /// without locks held, since it reads the disk.
    pub unsafe fn init(&self, dev: u32, sb: &SuperBlock) {
        let log = self.lock().deref_mut() as *mut Log;
        log.as_mut().unwrap().init(dev, sb);
    }

    /// Called at the start of each FS system call. Waits until this
    /// operation's worst-case block usage is guaranteed to fit.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing {
                guard = unsafe { CPU_TABLE.my_proc() }.sleep(Event::Log, guard);
                continue;
            }

            if guard.header.n as usize + (guard.outstanding + 1) * MAXOPBLOCKS > LOGSIZE {
                // this op might exhaust log space; wait for commit.
                guard = unsafe { CPU_TABLE.my_proc() }.sleep(Event::Log, guard);
                continue;
            }

            guard.outstanding += 1;
            drop(guard);
            break;
        }
    }

    /// Record that the caller modified the buffer, replacing bwrite:
    /// the block is named in the header (once, however often it is
    /// written: absorption) and pinned in the cache until commit.
    pub fn write(&self, buf: &mut BufGuard<'_>) {
        // pin first: the log lock is a leaf and must not reach for a
        // cache bucket lock. An absorbed write gives the pin back.
        buf.pin();

        let mut guard = self.lock();

        if guard.header.n as usize >= LOGSIZE || guard.header.n >= guard.size - 1 {
            panic!("log_write: too big a transaction");
        }
        if guard.outstanding < 1 {
            panic!("log_write: outside of transaction");
        }

        let mut i = 0usize;
        while i < guard.header.n as usize {
            if guard.header.blocknos[i] == buf.blockno {
                // absorption: already scheduled for this commit.
                break;
            }
            i += 1;
        }

        guard.header.blocknos[i] = buf.blockno;

        let absorbed = i < guard.header.n as usize;
        if !absorbed {
            guard.header.n += 1;
        }
        drop(guard);

        if absorbed {
            buf.unpin();
        }
    }

    /// Called at the end of each FS system call; commits if this was
    /// the last outstanding operation.
    pub fn end_op(&self) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        if guard.committing {
            panic!("log end_op: committing");
        }
        let do_commit = guard.outstanding == 0;
        if do_commit {
            guard.committing = true;
        } else {
            // begin_op may be waiting for log space; the decrement of
            // outstanding may have opened some.
            unsafe { PROCESS_TABLE.wakeup(Event::Log) };
        }
        drop(guard);

        if do_commit {
            // call commit without the lock held, since the disk
            // writes sleep. `committing` keeps everyone else out.
            let log = self.lock().deref_mut() as *mut Log;
            unsafe {
                log.as_mut().unwrap().commit();
            }

            let mut guard = self.lock();
            guard.committing = false;
            unsafe { PROCESS_TABLE.wakeup(Event::Log) };
            drop(guard);
        }
    }
}

impl Log {
    const fn new() -> Self {
        Self {
            start: 0,
            size: 0,
            outstanding: 0,
            committing: false,
            dev: 0,
            header: LogHeader::new(),
        }
    }

    fn init(&mut self, dev: u32, sb: &SuperBlock) {
        self.start = sb.logstart;
        self.size = sb.nlog;
        self.dev = dev;
        self.recover();
    }

    /// Re-install a committed but not yet truncated transaction.
    /// Replaying one any number of times writes the same bytes, and
    /// an empty header makes this a no-op.
    fn recover(&mut self) {
        self.read_head();
        self.install_trans(true);
        self.header.n = 0;
        self.write_head();
    }

    fn read_head(&mut self) {
        let buf = BCACHE.bread(self.dev, self.start);
        unsafe { self.header.decode(buf.data_ptr() as *const u8) };
        drop(buf);
    }

    /// Write the in-memory header to disk. This is the moment a
    /// transaction commits.
    fn write_head(&mut self) {
        let mut buf = BCACHE.bread(self.dev, self.start);
        unsafe { self.header.encode(buf.data_ptr_mut() as *mut u8) };
        buf.bwrite();
        drop(buf);
    }

    /// Copy committed blocks from the log region to their home
    /// locations.
    fn install_trans(&mut self, recovering: bool) {
        for tail in 0..self.header.n {
            let log_buf = BCACHE.bread(self.dev, self.start + tail + 1);
            let mut disk_buf = BCACHE.bread(self.dev, self.header.blocknos[tail as usize]);
            unsafe {
                ptr::copy_nonoverlapping(log_buf.data_ptr(), disk_buf.data_ptr_mut(), 1);
            }
            disk_buf.bwrite();
            if !recovering {
                disk_buf.unpin();
            }
            drop(log_buf);
            drop(disk_buf);
        }
    }

    /// Copy modified blocks from the cache to the log region.
    fn write_log(&mut self) {
        for tail in 0..self.header.n {
            let from = BCACHE.bread(self.dev, self.header.blocknos[tail as usize]);
            let mut to = BCACHE.bread(self.dev, self.start + tail + 1);
            unsafe {
                ptr::copy_nonoverlapping(from.data_ptr(), to.data_ptr_mut(), 1);
            }
            to.bwrite();
            drop(from);
            drop(to);
        }
    }

    fn commit(&mut self) {
        if self.header.n > 0 {
            self.write_log(); // fill the log region from the cache
            self.write_head(); // the commit point
            self.install_trans(false); // copy to the home locations
            self.header.n = 0;
            self.write_head(); // erase the transaction from the log
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // a data block far past anything mkfs or the other tests touch.
    const SCRATCH_BLOCK: u32 = 2000;

    #[test_case]
    fn absorption_and_commit() {
        LOG.begin_op();

        let n_before = LOG.lock().header.n;

        let mut buf = BCACHE.bread(1, SCRATCH_BLOCK);
        unsafe { (&mut (*buf.data_ptr_mut()))[0] = 0xaa };
        LOG.write(&mut buf);
        LOG.write(&mut buf); // absorbed: still one header entry
        drop(buf);

        assert_eq!(n_before + 1, LOG.lock().header.n);

        LOG.end_op();

        // the last op out commits and truncates the header.
        assert_eq!(0, LOG.lock().header.n);
    }

    #[test_case]
    fn group_commit_waits_for_last_op() {
        LOG.begin_op();
        LOG.begin_op();

        let mut buf = BCACHE.bread(1, SCRATCH_BLOCK);
        unsafe { (&mut (*buf.data_ptr_mut()))[1] = 0xbb };
        LOG.write(&mut buf);
        drop(buf);

        LOG.end_op();
        // one op still outstanding: nothing committed yet.
        assert!(LOG.lock().header.n > 0);

        LOG.end_op();
        assert_eq!(0, LOG.lock().header.n);
    }

    #[test_case]
    fn recovery_is_idempotent() {
        // with an empty header, recovery must not disturb the disk.
        let before = {
            let buf = BCACHE.bread(1, SCRATCH_BLOCK);
            let b0 = unsafe { (&(*buf.data_ptr()))[0] };
            drop(buf);
            b0
        };

        unsafe {
            let log = LOG.lock().deref_mut() as *mut Log;
            log.as_mut().unwrap().recover();
            log.as_mut().unwrap().recover();
        }

        let buf = BCACHE.bread(1, SCRATCH_BLOCK);
        assert_eq!(before, unsafe { (&(*buf.data_ptr()))[0] });
        drop(buf);
    }
}
