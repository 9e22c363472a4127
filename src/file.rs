//! The file-descriptor layer: most resources are files, whether
//! backed by an inode, a device or a pipe, and this layer gives them
//! one read/write/stat surface.

use core::cell::UnsafeCell;

use alloc::sync::Arc;

use crate::{
    bio::BSIZE,
    console,
    cpu::CPU_TABLE,
    error::{KernelError, Result},
    fs::{FileStat, Inode, InodeType, INODE_TABLE},
    log::LOG,
    param::MAXOPBLOCKS,
    proc::Event,
    process::PROCESS_TABLE,
    spinlock::SpinLock,
};

pub const O_RDONLY: i32 = 0x000;
pub const O_WRONLY: i32 = 0x001;
pub const O_RDWR: i32 = 0x002;
pub const O_CREATE: i32 = 0x200;
pub const O_TRUNC: i32 = 0x400;

/// One open file. Each open() makes a new File, so two processes
/// opening the same inode have independent offsets; fork and dup
/// share a File through the Arc and with it the offset.
pub struct File {
    pub readable: bool,
    pub writable: bool,
    inner: FileInner,
}

impl File {
    pub fn open(path: &[u8], o_mode: i32) -> Result<Arc<Self>> {
        LOG.begin_op();

        let result = Self::open_inner(path, o_mode);

        LOG.end_op();
        result
    }

    fn open_inner(path: &[u8], o_mode: i32) -> Result<Arc<Self>> {
        let inode = if o_mode & O_CREATE > 0 {
            INODE_TABLE.create(path, InodeType::File, 0, 0)?
        } else {
            INODE_TABLE.namei(path).ok_or(KernelError::NotFound)?
        };

        let readable = o_mode & O_WRONLY == 0;
        let writable = (o_mode & O_WRONLY > 0) || (o_mode & O_RDWR > 0);

        let mut idata = inode.ilock();
        let inner = match idata.get_type() {
            InodeType::Empty => panic!("open: empty inode"),
            InodeType::Directory => {
                if o_mode != O_RDONLY {
                    drop(idata);
                    drop(inode);
                    return Err(KernelError::IsDirectory);
                }
                drop(idata);
                FileInner::Inode(FileInode {
                    inode: Some(inode),
                    offset: UnsafeCell::new(0),
                })
            }
            InodeType::File | InodeType::Symlink => {
                if o_mode & O_TRUNC > 0 {
                    idata.itrunc();
                }
                drop(idata);
                FileInner::Inode(FileInode {
                    inode: Some(inode),
                    offset: UnsafeCell::new(0),
                })
            }
            InodeType::Device => {
                let major = idata.get_major();
                drop(idata);
                FileInner::Device(FileDevice {
                    inode: Some(inode),
                    major,
                })
            }
        };

        Ok(Arc::new(Self {
            readable,
            writable,
            inner,
        }))
    }

    /// A connected pair of pipe files: the read end and the write
    /// end, sharing one buffer.
    pub fn alloc_pipe() -> (Arc<File>, Arc<File>) {
        let p = Arc::new(SpinLock::new(FilePipe::new(), "pipe"));
        let rf = Arc::new(Self {
            readable: true,
            writable: false,
            inner: FileInner::Pipe(p.clone()),
        });
        let wf = Arc::new(Self {
            readable: false,
            writable: true,
            inner: FileInner::Pipe(p),
        });
        (rf, wf)
    }

    pub fn read(&self, addr: usize, n: usize) -> Result<usize> {
        if !self.readable {
            return Err(KernelError::BadDescriptor);
        }

        match &self.inner {
            FileInner::Device(f) => {
                if f.major != console::CONSOLE_MAJOR {
                    return Err(KernelError::DeviceIo);
                }
                console::read(true, addr as *mut u8, n)
            }
            FileInner::Inode(f) => {
                let mut idata = f.inode.as_ref().unwrap().ilock();
                let offset = unsafe { &mut *f.offset.get() };
                let read_n = idata.readi(true, addr as *mut u8, *offset, n)?;
                *offset += read_n;
                drop(idata);
                Ok(read_n)
            }
            FileInner::Pipe(f) => Self::pipe_read(f, addr, n),
        }
    }

    pub fn write(&self, addr: usize, n: usize) -> Result<usize> {
        if !self.writable {
            return Err(KernelError::BadDescriptor);
        }

        match &self.inner {
            FileInner::Device(f) => {
                if f.major != console::CONSOLE_MAJOR {
                    return Err(KernelError::DeviceIo);
                }
                console::write(true, addr as *const u8, n)
            }
            FileInner::Inode(f) => {
                // split big writes so a single transaction stays
                // within the log's MAXOPBLOCKS limit: a block of
                // data may dirty the bitmap, an indirect block and
                // the inode besides itself.
                let max = ((MAXOPBLOCKS - 4) / 2) * BSIZE;
                let mut written = 0;
                while written < n {
                    let chunk = core::cmp::min(n - written, max);

                    LOG.begin_op();
                    let mut idata = f.inode.as_ref().unwrap().ilock();
                    let offset = unsafe { &mut *f.offset.get() };
                    let r = idata.writei(true, (addr + written) as *const u8, *offset, chunk);
                    if let Ok(w) = r {
                        *offset += w;
                    }
                    drop(idata);
                    LOG.end_op();

                    let w = r?;
                    written += w;
                }
                Ok(written)
            }
            FileInner::Pipe(f) => Self::pipe_write(f, addr, n),
        }
    }

    fn pipe_read(pipe: &Arc<SpinLock<FilePipe>>, addr: usize, n: usize) -> Result<usize> {
        let read_event = Event::PipeRead {
            id: Arc::as_ptr(pipe) as usize,
        };
        let write_event = Event::PipeWrite {
            id: Arc::as_ptr(pipe) as usize,
        };

        let p = unsafe { CPU_TABLE.my_proc() };
        let mut guard = pipe.lock();

        while guard.n_read == guard.n_write && guard.write_open {
            // empty, and a writer may still show up.
            if p.is_killed() {
                drop(guard);
                return Err(KernelError::Interrupted);
            }
            guard = p.sleep(read_event, guard);
        }

        let mut count = 0;
        while count < n {
            if guard.n_read == guard.n_write {
                break;
            }
            let c = guard.data[guard.n_read % PIPE_SIZE];
            guard.n_read += 1;
            if p
                .data
                .get_mut()
                .copy_out(addr + count, &c as *const u8, 1)
                .is_err()
            {
                break;
            }
            count += 1;
        }

        // a writer may be blocked on a full buffer.
        unsafe { PROCESS_TABLE.wakeup(write_event) };
        drop(guard);
        Ok(count)
    }

    fn pipe_write(pipe: &Arc<SpinLock<FilePipe>>, addr: usize, n: usize) -> Result<usize> {
        let read_event = Event::PipeRead {
            id: Arc::as_ptr(pipe) as usize,
        };
        let write_event = Event::PipeWrite {
            id: Arc::as_ptr(pipe) as usize,
        };

        let p = unsafe { CPU_TABLE.my_proc() };
        let mut guard = pipe.lock();

        let mut count = 0;
        while count < n {
            if !guard.read_open {
                drop(guard);
                return Err(KernelError::BrokenPipe);
            }
            if p.is_killed() {
                drop(guard);
                return Err(KernelError::Interrupted);
            }

            if guard.n_write == guard.n_read + PIPE_SIZE {
                // full: hand the data so far to the readers.
                unsafe { PROCESS_TABLE.wakeup(read_event) };
                guard = p.sleep(write_event, guard);
            } else {
                let mut c = 0u8;
                if p
                    .data
                    .get_mut()
                    .copy_in(&mut c as *mut u8, addr + count, 1)
                    .is_err()
                {
                    break;
                }
                let slot = guard.n_write % PIPE_SIZE;
                guard.data[slot] = c;
                guard.n_write += 1;
                count += 1;
            }
        }

        unsafe { PROCESS_TABLE.wakeup(read_event) };
        drop(guard);
        Ok(count)
    }

    /// Metadata of the backing inode; pipes have none.
    pub fn stat(&self, st: &mut FileStat) -> Result<()> {
        let inode = match &self.inner {
            FileInner::Inode(f) => f.inode.as_ref(),
            FileInner::Device(f) => f.inode.as_ref(),
            FileInner::Pipe(_) => return Err(KernelError::BadDescriptor),
        };

        let idata = inode.unwrap().ilock();
        idata.stati(st);
        drop(idata);
        Ok(())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        match self.inner {
            FileInner::Inode(ref mut f) => {
                // the final iput may free the inode on disk.
                LOG.begin_op();
                drop(f.inode.take());
                LOG.end_op();
            }
            FileInner::Device(ref mut f) => {
                LOG.begin_op();
                drop(f.inode.take());
                LOG.end_op();
            }
            FileInner::Pipe(ref f) => {
                let read_event = Event::PipeRead {
                    id: Arc::as_ptr(f) as usize,
                };
                let write_event = Event::PipeWrite {
                    id: Arc::as_ptr(f) as usize,
                };
                let mut guard = f.lock();
                if self.writable {
                    guard.write_open = false;
                    unsafe { PROCESS_TABLE.wakeup(read_event) };
                } else {
                    guard.read_open = false;
                    unsafe { PROCESS_TABLE.wakeup(write_event) };
                }
                drop(guard);
            }
        }
    }
}

enum FileInner {
    Inode(FileInode),
    Device(FileDevice),
    Pipe(Arc<SpinLock<FilePipe>>),
}

struct FileInode {
    inode: Option<Inode>,
    // shared by fork/dup clones; the inode sleep-lock serializes the
    // read-modify-write of the offset.
    offset: UnsafeCell<usize>,
}

struct FileDevice {
    inode: Option<Inode>,
    major: u16,
}

unsafe impl Send for FileInode {}
unsafe impl Sync for FileInode {}

const PIPE_SIZE: usize = 512;

struct FilePipe {
    data: [u8; PIPE_SIZE],
    read_open: bool,
    write_open: bool,
    n_read: usize,  // total bytes read
    n_write: usize, // total bytes written
}

impl FilePipe {
    fn new() -> Self {
        Self {
            data: [0; PIPE_SIZE],
            read_open: true,
            write_open: true,
            n_read: 0,
            n_write: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn pipe_ends_share_buffer() {
        let (r, w) = File::alloc_pipe();
        assert!(r.readable && !r.writable);
        assert!(!w.readable && w.writable);

        if let FileInner::Pipe(ref f) = r.inner {
            // both ends point at the same pipe.
            assert_eq!(2, Arc::strong_count(f));
        } else {
            panic!("read end is not a pipe");
        }
    }

    #[test_case]
    fn pipe_transfers_bytes() {
        let p = unsafe { CPU_TABLE.my_proc() };
        let pdata = p.data.get_mut();
        let base = pdata.sz;
        let new_sz = pdata
            .page_table
            .as_mut()
            .unwrap()
            .uvm_alloc(base, base + crate::param::PAGESIZE)
            .expect("uvm_alloc");
        pdata.sz = new_sz;

        let (r, w) = File::alloc_pipe();

        // "ping" out, "ping" back; short reads drain what's there.
        pdata.copy_out(base, b"ping".as_ptr(), 4).expect("copy_out");
        assert_eq!(4, w.write(base, 4).expect("write"));
        assert_eq!(4, r.read(base + 64, 64).expect("read"));

        let mut got = [0u8; 4];
        pdata
            .copy_in(got.as_mut_ptr(), base + 64, 4)
            .expect("copy_in");
        assert_eq!(b"ping", &got);

        // closing the read end breaks the writer.
        drop(r);
        assert!(matches!(w.write(base, 4), Err(KernelError::BrokenPipe)));
        drop(w);

        let pdata = p.data.get_mut();
        pdata.sz = pdata.page_table.as_mut().unwrap().uvm_dealloc(new_sz, base);
    }

    #[test_case]
    fn open_missing_file_fails() {
        let r = File::open(b"does-not-exist\0", O_RDONLY);
        assert!(matches!(r, Err(KernelError::NotFound)));
    }

    #[test_case]
    fn open_write_close_reopen_read() {
        let path = b"roundtrip\0";

        // write through a user-space address: map a scratch page at
        // the current top of this process's memory.
        let p = unsafe { CPU_TABLE.my_proc() };
        let pdata = p.data.get_mut();
        let base = pdata.sz;
        let new_sz = pdata
            .page_table
            .as_mut()
            .unwrap()
            .uvm_alloc(base, base + crate::param::PAGESIZE)
            .expect("uvm_alloc");
        pdata.sz = new_sz;

        let msg = b"hello!";
        pdata.copy_out(base, msg.as_ptr(), msg.len()).expect("copy_out");

        let f = File::open(path, O_CREATE | O_WRONLY).expect("create");
        assert_eq!(msg.len(), f.write(base, msg.len()).expect("write"));
        drop(f);

        let f = File::open(path, O_RDONLY).expect("reopen");
        let read_back = base + 64;
        assert_eq!(msg.len(), f.read(read_back, 64).expect("read"));

        let mut st = FileStat::uninit();
        f.stat(&mut st).expect("stat");
        assert_eq!(msg.len() as u64, st.size);
        drop(f);

        let mut got = [0u8; 6];
        pdata
            .copy_in(got.as_mut_ptr(), read_back, got.len())
            .expect("copy_in");
        assert_eq!(msg, &got);

        // writing through the read-only descriptor must fail.
        let f = File::open(path, O_RDONLY).expect("reopen");
        assert!(matches!(
            f.write(base, 1),
            Err(KernelError::BadDescriptor)
        ));
        drop(f);

        LOG.begin_op();
        INODE_TABLE.unlink(path).expect("unlink");
        LOG.end_op();

        // release the scratch page.
        let pdata = p.data.get_mut();
        pdata.sz = pdata.page_table.as_mut().unwrap().uvm_dealloc(new_sz, base);
    }

    #[test_case]
    fn truncate_discards_content() {
        let path = b"truncme\0";

        let p = unsafe { CPU_TABLE.my_proc() };
        let pdata = p.data.get_mut();
        let base = pdata.sz;
        let new_sz = pdata
            .page_table
            .as_mut()
            .unwrap()
            .uvm_alloc(base, base + crate::param::PAGESIZE)
            .expect("uvm_alloc");
        pdata.sz = new_sz;
        pdata.copy_out(base, b"data".as_ptr(), 4).expect("copy_out");

        let f = File::open(path, O_CREATE | O_WRONLY).expect("create");
        f.write(base, 4).expect("write");
        drop(f);

        let f = File::open(path, O_WRONLY | O_TRUNC).expect("truncate");
        drop(f);

        let f = File::open(path, O_RDONLY).expect("reopen");
        let mut st = FileStat::uninit();
        f.stat(&mut st).expect("stat");
        assert_eq!(0, st.size);
        assert_eq!(0, f.read(base, 4).expect("read"));
        drop(f);

        LOG.begin_op();
        INODE_TABLE.unlink(path).expect("unlink");
        LOG.end_op();

        let pdata = p.data.get_mut();
        pdata.sz = pdata.page_table.as_mut().unwrap().uvm_dealloc(new_sz, base);
    }
}
