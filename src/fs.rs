//! Inodes, directories and path names.
//!
//! An inode describes a single unnamed file: type, link count, size,
//! and the list of blocks holding the content. On-disk inodes are
//! packed in the inode region; the kernel caches in-use ones in
//! INODE_TABLE so processes touching the same inode synchronize on
//! one sleep-lock.
//!
//! A table entry's identity (device, inum, refcnt) lives under the
//! table spinlock; the copy of the disk inode lives under the entry's
//! sleep-lock and is only meaningful while `valid` is set. The usual
//! sequence is:
//!
//!     let inode = INODE_TABLE.iget(dev, inum);
//!     let mut idata = inode.ilock();
//!     // examine and modify ...
//!     drop(idata);          // iunlock
//!     drop(inode);          // iput
//!
//! iget is separate from ilock so that long-lived references (open
//! files, cwds) don't hold the lock, which also breaks the deadlocks
//! a lookup of "." would otherwise cause.
//!
//! Every call chain that may drop the last reference to an unlinked
//! inode (any path that can reach iput) must run inside a log
//! transaction, since freeing writes the disk.

use core::{cmp::min, mem, ptr};

use array_macro::array;
use static_assertions::const_assert_eq;

use crate::{
    bio::{BCACHE, BSIZE},
    bmap,
    cpu::CPU_TABLE,
    error::{KernelError, Result},
    log::LOG,
    param::ROOTDEV,
    proc::{either_copy_in, either_copy_out},
    sleeplock::{SleepLock, SleepLockGuard},
    spinlock::SpinLock,
    superblock::{read_super_block, SB},
};

pub unsafe fn init(dev: u32) {
    read_super_block(dev);
    LOG.init(dev, &SB);
}

const NINODE: usize = 50; // max active in-memory inodes
pub const IPB: usize = BSIZE / mem::size_of::<DiskInode>(); // inodes per block
pub const DIRSIZ: usize = 30;
pub const ROOTINO: u32 = 1;

pub const NDIRECT: usize = 11;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
const NDINDIRECT: usize = NINDIRECT * NINDIRECT;
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NDINDIRECT;

#[inline]
fn inode_block(inum: u32) -> u32 {
    inum / u32::try_from(IPB).unwrap() + unsafe { SB.inodestart }
}

#[inline]
fn inode_offset(inum: u32) -> isize {
    (inum as usize % IPB) as isize
}

pub static INODE_TABLE: InodeTable = InodeTable::new();

pub struct InodeTable {
    meta: SpinLock<[InodeMeta; NINODE]>,
    data: [SleepLock<InodeData>; NINODE],
}

impl InodeTable {
    pub const fn new() -> Self {
        Self {
            meta: SpinLock::new(array![_ => InodeMeta::new(); NINODE], "inode_meta"),
            data: array![_ => SleepLock::new(InodeData::new(), "inode_data"); NINODE],
        }
    }

    /// Find the inode numbered inum on device dev and return an
    /// in-memory reference to it. Does not lock it or read it in.
    pub fn iget(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.meta.lock();

        let mut empty: Option<usize> = None;
        for (i, ip) in guard.iter_mut().enumerate() {
            if ip.dev == dev && ip.inum == inum && ip.refcnt > 0 {
                ip.refcnt += 1;
                drop(guard);
                return Inode {
                    index: i,
                    dev,
                    inum,
                };
            }
            if empty.is_none() && ip.refcnt == 0 {
                empty = Some(i);
            }
        }

        let index = match empty {
            Some(index) => index,
            None => panic!("iget: no free in-memory inodes"),
        };
        guard[index].dev = dev;
        guard[index].inum = inum;
        guard[index].refcnt = 1;
        drop(guard);

        let mut idata = self.data[index].lock();
        drop(idata.valid.take());
        drop(idata);

        Inode { index, dev, inum }
    }

    /// Drop a reference to an in-memory inode. The last reference to
    /// an inode with no links also frees it on disk, which is why any
    /// caller that can reach here must be inside a transaction.
    fn iput(&self, index: usize) {
        let mut guard = self.meta.lock();

        if guard[index].refcnt == 1 {
            // refcnt == 1 means no one else holds the inode, so this
            // sleep-lock acquisition cannot block.
            let mut idata = self.data[index].lock();
            if idata.valid.is_some() && idata.dinode.nlink == 0 {
                // no links and no other references: truncate and free.
                drop(guard);

                idata.itrunc();
                idata.dinode.typ = InodeType::Empty;
                idata.iupdate();
                drop(idata.valid.take());
                drop(idata);

                guard = self.meta.lock();
            } else {
                drop(idata);
            }
        }

        guard[index].refcnt -= 1;
        drop(guard);
    }

    pub fn idup(&self, ip: &Inode) -> Inode {
        let mut guard = self.meta.lock();
        let i = ip.index;
        guard[i].refcnt += 1;
        Inode {
            dev: guard[i].dev,
            inum: guard[i].inum,
            index: i,
        }
    }

    /// Allocate a fresh inode with the given type on device dev.
    /// Returns an unlocked, referenced inode.
    fn ialloc(&self, dev: u32, typ: InodeType) -> Result<Inode> {
        for inum in 1..unsafe { SB.ninodes } {
            let mut buf = BCACHE.bread(dev, inode_block(inum));
            let dinode_ptr =
                unsafe { (buf.data_ptr_mut() as *mut DiskInode).offset(inode_offset(inum)) };
            let dinode = unsafe { dinode_ptr.as_mut().unwrap() };
            if dinode.typ == InodeType::Empty {
                // free: claim it.
                unsafe { ptr::write_bytes(dinode_ptr, 0, 1) };
                dinode.typ = typ;
                LOG.write(&mut buf);
                drop(buf);
                return Ok(self.iget(dev, inum));
            }
            drop(buf);
        }
        Err(KernelError::OutOfInodes)
    }

    /// Create a new name for a fresh inode. For an O_CREATE of an
    /// existing regular file, return the inode that's already there.
    /// A new directory starts with "." and ".." entries.
    pub fn create(&self, path: &[u8], typ: InodeType, major: u16, minor: u16) -> Result<Inode> {
        let mut name = [0u8; DIRSIZ];
        let parent = self
            .nameiparent(path, &mut name)
            .ok_or(KernelError::NotFound)?;
        let mut parent_data = parent.ilock();

        if let Some((inode, _)) = parent_data.dirlookup(&name) {
            drop(parent_data);
            drop(parent);

            let existing_typ = {
                let idata = inode.ilock();
                idata.dinode.typ
            };
            if typ == InodeType::File
                && (existing_typ == InodeType::File || existing_typ == InodeType::Device)
            {
                return Ok(inode);
            }
            drop(inode);
            return Err(KernelError::Exists);
        }

        let inode = self.ialloc(parent.dev, typ)?;
        let mut idata = inode.ilock();
        idata.dinode.major = major;
        idata.dinode.minor = minor;
        idata.dinode.nlink = 1;
        idata.iupdate();

        let result = (|| {
            if typ == InodeType::Directory {
                // "." and ".."; no nlink++ for "." to avoid a cyclic
                // count on the directory itself.
                let mut dot = [0u8; DIRSIZ];
                dot[0] = b'.';
                idata.dirlink(&dot, inode.inum)?;
                dot[1] = b'.';
                idata.dirlink(&dot, parent.inum)?;
            }

            parent_data.dirlink(&name, inode.inum)?;

            if typ == InodeType::Directory {
                parent_data.dinode.nlink += 1; // for ".."
                parent_data.iupdate();
            }
            Ok(())
        })();

        if let Err(err) = result {
            // roll back: zero the link count and let iput free the
            // half-made inode within this same transaction.
            idata.dinode.nlink = 0;
            idata.iupdate();
            drop(idata);
            drop(inode);
            drop(parent_data);
            drop(parent);
            return Err(err);
        }

        drop(idata);
        drop(parent_data);
        drop(parent);

        Ok(inode)
    }

    /// Add the name new for the inode old already names.
    /// Must be called inside a transaction.
    pub fn link(&self, old: &[u8], new: &[u8]) -> Result<()> {
        let inode = self.namei(old).ok_or(KernelError::NotFound)?;

        let mut idata = inode.ilock();
        if idata.dinode.typ == InodeType::Directory {
            drop(idata);
            drop(inode);
            return Err(KernelError::IsDirectory);
        }
        idata.dinode.nlink += 1;
        idata.iupdate();
        drop(idata);

        let mut name = [0u8; DIRSIZ];
        let err = match self.nameiparent(new, &mut name) {
            None => Some(KernelError::NotFound),
            Some(dir) => {
                if dir.dev != inode.dev {
                    // links don't cross devices.
                    Some(KernelError::BadArgument)
                } else {
                    let mut dir_data = dir.ilock();
                    let r = dir_data.dirlink(&name, inode.inum);
                    drop(dir_data);
                    drop(dir);
                    r.err()
                }
            }
        };

        if let Some(err) = err {
            let mut idata = inode.ilock();
            idata.dinode.nlink -= 1;
            idata.iupdate();
            drop(idata);
            drop(inode);
            return Err(err);
        }

        drop(inode);
        Ok(())
    }

    /// Remove a name. The inode itself is freed by the last iput once
    /// nobody holds it open. Must be called inside a transaction.
    pub fn unlink(&self, path: &[u8]) -> Result<()> {
        let mut name = [0u8; DIRSIZ];
        let dir = self
            .nameiparent(path, &mut name)
            .ok_or(KernelError::NotFound)?;

        // cannot unlink "." or "..".
        let mut dot = [0u8; DIRSIZ];
        dot[0] = b'.';
        if name == dot {
            return Err(KernelError::BadArgument);
        }
        dot[1] = b'.';
        if name == dot {
            return Err(KernelError::BadArgument);
        }

        let mut dir_data = dir.ilock();
        let (inode, offset) = match dir_data.dirlookup(&name) {
            Some(found) => found,
            None => {
                drop(dir_data);
                drop(dir);
                return Err(KernelError::NotFound);
            }
        };
        let mut idata = inode.ilock();

        if idata.dinode.nlink < 1 {
            panic!("unlink: nlink < 1");
        }
        if idata.dinode.typ == InodeType::Directory && !idata.is_dir_empty() {
            drop(idata);
            drop(inode);
            drop(dir_data);
            drop(dir);
            return Err(KernelError::NotEmpty);
        }

        // clear the directory entry.
        let de = DirEnt::empty();
        dir_data
            .writei(
                false,
                &de as *const _ as *const u8,
                offset,
                mem::size_of::<DirEnt>(),
            )
            .expect("unlink: clear dirent");

        if idata.dinode.typ == InodeType::Directory {
            dir_data.dinode.nlink -= 1; // the victim's ".."
            dir_data.iupdate();
        }
        drop(dir_data);
        drop(dir);

        idata.dinode.nlink -= 1;
        idata.iupdate();
        drop(idata);
        drop(inode);

        Ok(())
    }

    /// Resolve a path to an inode, or with `parent` to the inode of
    /// the next-to-last element plus the final name.
    ///
    /// Only one directory is locked at a time, so lookups in
    /// different directories proceed in parallel, and looking up "."
    /// can't deadlock against the inode we already hold. The
    /// directory entry's inode is iget'd (reference taken) before the
    /// directory lock is released, so a concurrent unlink cannot free
    /// it out from under the walk.
    fn namex(&self, path: &[u8], name: &mut [u8; DIRSIZ], parent: bool) -> Option<Inode> {
        let mut inode = if path[0] == b'/' {
            self.iget(ROOTDEV, ROOTINO)
        } else {
            let cwd = unsafe { CPU_TABLE.my_proc().data.get_mut().cwd.as_ref().unwrap() };
            self.idup(cwd)
        };

        let mut path_pos = 0;
        loop {
            path_pos = skip_elem(path, path_pos, name);
            if path_pos == 0 {
                break;
            }

            // the type isn't known until the inode is read in.
            let mut idata = inode.ilock();

            if idata.dinode.typ != InodeType::Directory {
                drop(idata);
                return None;
            }

            if parent && path[path_pos] == 0 {
                // stop one level early.
                drop(idata);
                return Some(inode);
            }

            match idata.dirlookup(name) {
                Some((next, _)) => {
                    drop(idata);
                    inode = next;
                }
                None => {
                    drop(idata);
                    return None;
                }
            }
        }

        if parent {
            // the path had no final component to split off.
            return None;
        }

        Some(inode)
    }

    /// Look up a path. Must be called inside a transaction, since the
    /// returned inode's drop may reach iput.
    pub fn namei(&self, path: &[u8]) -> Option<Inode> {
        let mut name: [u8; DIRSIZ] = [0; DIRSIZ];
        self.namex(path, &mut name, false)
    }

    pub fn nameiparent(&self, path: &[u8], name: &mut [u8; DIRSIZ]) -> Option<Inode> {
        self.namex(path, name, true)
    }
}

/// Copy the next path element into name and return the offset past
/// it.
/// Examples:
///     skip_elem("a/bb/c", name) = 2, setting name = "a"
///     skip_elem("///a//bb", name) = 6, setting name = "a"
///     skip_elem("a", name) = 1, setting name = "a"
///     skip_elem("", name) = skip_elem("////", name) = 0
fn skip_elem(path: &[u8], mut cur: usize, name: &mut [u8; DIRSIZ]) -> usize {
    while path[cur] == b'/' {
        cur += 1;
    }
    if path[cur] == 0 {
        return 0;
    }

    let start = cur;

    while path[cur] != b'/' && path[cur] != 0 {
        cur += 1;
    }

    let mut len = cur - start;
    if len >= name.len() {
        len = name.len() - 1;
    }
    name[..len].copy_from_slice(&path[start..start + len]);
    name[len..].fill(0);

    while path[cur] == b'/' {
        cur += 1;
    }

    cur
}

pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    index: usize,
}

impl Inode {
    /// Lock the inode, reading it from disk on first touch.
    pub fn ilock(&self) -> SleepLockGuard<'_, InodeData> {
        let mut guard = INODE_TABLE.data[self.index].lock();

        if guard.valid.is_some() {
            return guard;
        }

        let buf = BCACHE.bread(self.dev, inode_block(self.inum));
        let dinode =
            unsafe { (buf.data_ptr() as *const DiskInode).offset(inode_offset(self.inum)) };
        guard.dinode = unsafe { *dinode };
        drop(buf);

        if guard.dinode.typ == InodeType::Empty {
            panic!("ilock: inode freed under a live reference");
        }

        guard.valid = Some((self.dev, self.inum));
        guard
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        INODE_TABLE.iput(self.index);
    }
}

struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refcnt: 0,
        }
    }
}

/// The guarded half of a cached inode; always accessed through the
/// entry's sleep-lock.
pub struct InodeData {
    valid: Option<(u32, u32)>, // (dev, inum)
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: None,
            dinode: DiskInode::new(),
        }
    }

    #[inline]
    pub fn get_type(&self) -> InodeType {
        self.dinode.typ
    }

    #[inline]
    pub fn get_major(&self) -> u16 {
        self.dinode.major
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.dinode.size as usize
    }

    /// Map a file block number to a disk block number, allocating
    /// data and indirect blocks on demand: NDIRECT direct slots, then
    /// NINDIRECT through the single-indirect block, then NDINDIRECT
    /// through two levels.
    fn bmap(&mut self, mut bn: usize) -> Result<u32> {
        let (dev, _) = self.valid.unwrap();

        if bn < NDIRECT {
            if self.dinode.addrs[bn] != 0 {
                return Ok(self.dinode.addrs[bn]);
            }
            let data_bn = bmap::alloc(dev)?;
            self.dinode.addrs[bn] = data_bn;
            return Ok(data_bn);
        }

        bn -= NDIRECT;

        if bn < NINDIRECT {
            // load the indirect block, allocating if necessary.
            let indirect_bn = match self.dinode.addrs[NDIRECT] {
                0 => {
                    let fresh = bmap::alloc(dev)?;
                    self.dinode.addrs[NDIRECT] = fresh;
                    fresh
                }
                bn => bn,
            };
            return indirect_lookup(dev, indirect_bn, bn);
        }

        bn -= NINDIRECT;

        if bn < NDINDIRECT {
            let d_indirect_bn = match self.dinode.addrs[NDIRECT + 1] {
                0 => {
                    let fresh = bmap::alloc(dev)?;
                    self.dinode.addrs[NDIRECT + 1] = fresh;
                    fresh
                }
                bn => bn,
            };
            // first level: which indirect block; second: which slot.
            let indirect_bn = indirect_lookup(dev, d_indirect_bn, bn / NINDIRECT)?;
            return indirect_lookup(dev, indirect_bn, bn % NINDIRECT);
        }

        panic!("bmap: block number out of range");
    }

    /// Read up to n bytes starting at offset into dst, which is a
    /// user address if is_user. Returns the number of bytes read.
    pub fn readi(
        &mut self,
        is_user: bool,
        mut dst: *mut u8,
        mut offset: usize,
        n: usize,
    ) -> Result<usize> {
        let (dev, _) = self.valid.unwrap();
        let size = self.dinode.size as usize;

        if offset > size {
            return Ok(0);
        }
        let total = min(n, size - offset);

        let mut left = total;
        while left > 0 {
            let read_n = min(BSIZE - offset % BSIZE, left);
            let buf = BCACHE.bread(dev, self.bmap(offset / BSIZE)?);
            let src_ptr = unsafe { (buf.data_ptr() as *const u8).add(offset % BSIZE) };
            either_copy_out(is_user, dst, src_ptr, read_n)?;
            drop(buf);
            offset += read_n;
            left -= read_n;
            dst = unsafe { dst.add(read_n) };
        }

        Ok(total)
    }

    /// Write n bytes from src at offset, extending the file (up to
    /// MAXFILE blocks) when the write runs past the end.
    pub fn writei(
        &mut self,
        is_user: bool,
        mut src: *const u8,
        mut offset: usize,
        n: usize,
    ) -> Result<usize> {
        let (dev, _) = self.valid.unwrap();

        if offset > self.dinode.size as usize {
            return Err(KernelError::BadArgument);
        }
        if offset + n > MAXFILE * BSIZE {
            return Err(KernelError::TooLarge);
        }

        let mut left = n;
        while left > 0 {
            let write_n = min(BSIZE - offset % BSIZE, left);
            let mut buf = BCACHE.bread(dev, self.bmap(offset / BSIZE)?);
            let dst_ptr = unsafe { (buf.data_ptr_mut() as *mut u8).add(offset % BSIZE) };
            either_copy_in(is_user, dst_ptr, src, write_n)?;
            LOG.write(&mut buf);
            drop(buf);
            offset += write_n;
            left -= write_n;
            src = unsafe { src.add(write_n) };
        }

        if offset > self.dinode.size as usize {
            self.dinode.size = offset.try_into().unwrap();
        }

        // write the inode back even if the size is unchanged: bmap
        // may have filled in address slots.
        self.iupdate();

        Ok(n)
    }

    pub fn stati(&self, dst: &mut FileStat) {
        let (dev, inum) = self.valid.unwrap();
        dst.dev = dev as i32;
        dst.inum = inum;
        dst.typ = self.dinode.typ;
        dst.nlink = self.dinode.nlink;
        dst.size = self.dinode.size as u64;
    }

    /// Look for a directory entry; returns the entry's inode and its
    /// byte offset in the directory.
    fn dirlookup(&mut self, name: &[u8; DIRSIZ]) -> Option<(Inode, usize)> {
        let (dev, _) = self.valid.unwrap();
        if self.dinode.typ != InodeType::Directory {
            panic!("dirlookup: not a directory");
        }

        let de_size = mem::size_of::<DirEnt>();
        let mut de = DirEnt::empty();
        let de_ptr = &mut de as *mut DirEnt as *mut u8;
        for offset in (0..self.dinode.size as usize).step_by(de_size) {
            self.readi(false, de_ptr, offset, de_size)
                .expect("dirlookup: read");

            if de.inum == 0 {
                continue;
            }

            if &de.name == name {
                return Some((INODE_TABLE.iget(dev, de.inum as u32), offset));
            }
        }

        None
    }

    /// Write a new directory entry (name, inum) into this directory,
    /// reusing a freed slot if one exists.
    fn dirlink(&mut self, name: &[u8; DIRSIZ], inum: u32) -> Result<()> {
        if self.dinode.typ != InodeType::Directory {
            panic!("dirlink: not a directory");
        }

        if let Some((inode, _)) = self.dirlookup(name) {
            drop(inode);
            return Err(KernelError::Exists);
        }

        let mut de = DirEnt::empty();
        let offset = self.free_dirent_offset(&mut de)?;

        de.name.copy_from_slice(name);
        de.inum = inum.try_into().unwrap();

        self.writei(
            false,
            &de as *const _ as *const u8,
            offset,
            mem::size_of::<DirEnt>(),
        )?;

        Ok(())
    }

    /// Offset of the first free entry, or of the end of the
    /// directory.
    fn free_dirent_offset(&mut self, de: &mut DirEnt) -> Result<usize> {
        let de_size = mem::size_of::<DirEnt>();

        for offset in (0..self.dinode.size as usize).step_by(de_size) {
            self.readi(false, de as *mut _ as *mut u8, offset, de_size)?;
            if de.inum == 0 {
                return Ok(offset);
            }
        }

        Ok(self.dinode.size as usize)
    }

    /// Is the directory empty except for "." and ".." ?
    fn is_dir_empty(&mut self) -> bool {
        let mut de = DirEnt::empty();
        let de_size = mem::size_of::<DirEnt>();
        for offset in (2 * de_size..self.dinode.size as usize).step_by(de_size) {
            self.readi(false, &mut de as *mut _ as *mut u8, offset, de_size)
                .expect("is_dir_empty: read");
            if de.inum != 0 {
                return false;
            }
        }

        true
    }

    /// Discard the inode's contents: all direct, indirect and
    /// doubly-indirect blocks, then the size.
    pub fn itrunc(&mut self) {
        let (dev, _) = self.valid.unwrap();

        for i in 0..NDIRECT {
            if self.dinode.addrs[i] > 0 {
                bmap::free(dev, self.dinode.addrs[i]);
                self.dinode.addrs[i] = 0;
            }
        }

        if self.dinode.addrs[NDIRECT] > 0 {
            free_indirect(dev, self.dinode.addrs[NDIRECT]);
            self.dinode.addrs[NDIRECT] = 0;
        }

        if self.dinode.addrs[NDIRECT + 1] > 0 {
            let d_bn = self.dinode.addrs[NDIRECT + 1];
            let buf = BCACHE.bread(dev, d_bn);
            let bn_ptr = buf.data_ptr() as *const u32;
            for i in 0..NINDIRECT as isize {
                let indirect_bn = unsafe { ptr::read(bn_ptr.offset(i)) };
                if indirect_bn != 0 {
                    free_indirect(dev, indirect_bn);
                }
            }
            drop(buf);
            bmap::free(dev, d_bn);
            self.dinode.addrs[NDIRECT + 1] = 0;
        }

        self.dinode.size = 0;
        self.iupdate();
    }

    /// Copy the in-memory inode back to its disk slot. Must be called
    /// after every change to dinode that should persist.
    fn iupdate(&mut self) {
        let (dev, inum) = self.valid.unwrap();
        let mut buf = BCACHE.bread(dev, inode_block(inum));
        let dinode = unsafe { (buf.data_ptr_mut() as *mut DiskInode).offset(inode_offset(inum)) };
        unsafe { ptr::write(dinode, self.dinode) };
        LOG.write(&mut buf);
        drop(buf);
    }
}

/// Read slot `slot` of the indirect block, allocating the target on
/// demand.
fn indirect_lookup(dev: u32, indirect_bn: u32, slot: usize) -> Result<u32> {
    let mut buf = BCACHE.bread(dev, indirect_bn);
    let slot_ptr = unsafe { (buf.data_ptr_mut() as *mut u32).add(slot) };
    let mut bn = unsafe { ptr::read(slot_ptr) };
    if bn == 0 {
        bn = bmap::alloc(dev)?;
        unsafe { ptr::write(slot_ptr, bn) };
        LOG.write(&mut buf);
    }
    drop(buf);
    Ok(bn)
}

/// Free every block an indirect block points at, then the indirect
/// block itself.
fn free_indirect(dev: u32, indirect_bn: u32) {
    let buf = BCACHE.bread(dev, indirect_bn);
    let bn_ptr = buf.data_ptr() as *const u32;
    for i in 0..NINDIRECT as isize {
        let bn = unsafe { ptr::read(bn_ptr.offset(i)) };
        if bn != 0 {
            bmap::free(dev, bn);
        }
    }
    drop(buf);
    bmap::free(dev, indirect_bn);
}

/// On-disk inode record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    typ: InodeType,            // file type; Empty means free
    major: u16,                // major device number (Device only)
    minor: u16,                // minor device number (Device only)
    nlink: u16,                // number of directory entries pointing here
    size: u32,                 // size of file (bytes)
    addrs: [u32; NDIRECT + 2], // direct, indirect, double-indirect
}

const_assert_eq!(64, mem::size_of::<DiskInode>());
const_assert_eq!(0, BSIZE % mem::size_of::<DiskInode>());

impl DiskInode {
    const fn new() -> Self {
        Self {
            typ: InodeType::Empty,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 2],
        }
    }
}

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
    // present on disk for compatibility; no kernel surface yet.
    Symlink = 4,
}

#[repr(C)]
pub struct DirEnt {
    inum: u16,
    name: [u8; DIRSIZ],
}

const_assert_eq!(32, mem::size_of::<DirEnt>());

impl DirEnt {
    pub const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }
}

#[repr(C)]
pub struct FileStat {
    dev: i32,
    inum: u32,
    typ: InodeType,
    nlink: u16,
    pub size: u64,
}

impl FileStat {
    pub fn uninit() -> Self {
        Self {
            dev: 0,
            inum: 0,
            typ: InodeType::Empty,
            nlink: 0,
            size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use core::ops::Deref;

    use super::*;

    fn name_of(s: &[u8]) -> [u8; DIRSIZ] {
        let mut name = [0u8; DIRSIZ];
        name[..s.len()].copy_from_slice(s);
        name
    }

    #[test_case]
    fn skip_elem_splits_components() {
        let mut name = [0u8; DIRSIZ];
        let cur = skip_elem(b"a/bb/c\0", 0, &mut name);
        assert_eq!(2, cur);
        assert_eq!(name_of(b"a"), name);

        let cur = skip_elem(b"///a//bb\0", 0, &mut name);
        assert_eq!(6, cur);
        assert_eq!(name_of(b"a"), name);

        let cur = skip_elem(b"\0", 0, &mut name);
        assert_eq!(0, cur);
        let cur = skip_elem(b"////\0", 0, &mut name);
        assert_eq!(0, cur);
    }

    #[test_case]
    fn iget_refcounts() {
        let i1 = INODE_TABLE.iget(ROOTDEV, ROOTINO);
        let index = i1.index;
        assert_eq!(ROOTDEV, i1.dev);
        assert_eq!(ROOTINO, i1.inum);

        let refcnt_of = |i: usize| {
            let guard = INODE_TABLE.meta.lock();
            let r = guard.deref()[i].refcnt;
            drop(guard);
            r
        };
        let base = refcnt_of(index);

        let i2 = INODE_TABLE.iget(ROOTDEV, ROOTINO);
        assert_eq!(index, i2.index);
        assert_eq!(base + 1, refcnt_of(index));

        let i3 = INODE_TABLE.idup(&i1);
        assert_eq!(index, i3.index);
        assert_eq!(base + 2, refcnt_of(index));

        drop(i3);
        drop(i2);
        assert_eq!(base, refcnt_of(index));
        drop(i1);
    }

    #[test_case]
    fn lookup_missing_name() {
        let inode = INODE_TABLE.iget(ROOTDEV, ROOTINO);
        let mut idata = inode.ilock();
        assert!(idata.dirlookup(&name_of(b"no-such-file")).is_none());
        drop(idata);
        drop(inode);
    }

    #[test_case]
    fn root_has_dot_entries() {
        let inode = INODE_TABLE.iget(ROOTDEV, ROOTINO);
        let mut idata = inode.ilock();

        let (dot, _) = idata.dirlookup(&name_of(b".")).expect("'.' missing");
        assert_eq!(ROOTINO, dot.inum);
        drop(dot);

        let (dotdot, _) = idata.dirlookup(&name_of(b"..")).expect("'..' missing");
        // the root is its own parent.
        assert_eq!(ROOTINO, dotdot.inum);
        drop(dotdot);

        drop(idata);
        drop(inode);
    }

    #[test_case]
    fn create_write_read_unlink() {
        let path = b"testfile\0";

        LOG.begin_op();
        let inode = INODE_TABLE
            .create(path, InodeType::File, 0, 0)
            .expect("create");
        let mut idata = inode.ilock();
        let content = b"hello!";
        let n = idata
            .writei(false, content.as_ptr(), 0, content.len())
            .expect("writei");
        assert_eq!(content.len(), n);
        drop(idata);
        drop(inode);
        LOG.end_op();

        LOG.begin_op();
        let inode = INODE_TABLE.namei(path).expect("namei after create");
        let mut idata = inode.ilock();
        assert_eq!(content.len(), idata.size());
        let mut back = [0u8; 6];
        let n = idata
            .readi(false, back.as_mut_ptr(), 0, back.len())
            .expect("readi");
        assert_eq!(content.len(), n);
        assert_eq!(content, &back);

        // reads past the end return zero bytes.
        let n = idata
            .readi(false, back.as_mut_ptr(), 100, back.len())
            .expect("readi past eof");
        assert_eq!(0, n);
        drop(idata);
        drop(inode);
        LOG.end_op();

        LOG.begin_op();
        INODE_TABLE.unlink(path).expect("unlink");
        LOG.end_op();

        LOG.begin_op();
        assert!(INODE_TABLE.namei(path).is_none());
        LOG.end_op();
    }

    #[test_case]
    fn create_on_existing_file_returns_it() {
        let path = b"samefile\0";

        LOG.begin_op();
        let a = INODE_TABLE
            .create(path, InodeType::File, 0, 0)
            .expect("create");
        let a_inum = a.inum;
        drop(a);
        LOG.end_op();

        LOG.begin_op();
        let b = INODE_TABLE
            .create(path, InodeType::File, 0, 0)
            .expect("re-create");
        assert_eq!(a_inum, b.inum);
        drop(b);

        // but a directory over an existing file must fail.
        let clash = INODE_TABLE.create(path, InodeType::Directory, 0, 0);
        assert!(matches!(clash, Err(KernelError::Exists)));
        drop(clash);

        INODE_TABLE.unlink(path).expect("unlink");
        LOG.end_op();
    }

    #[test_case]
    fn link_shares_inode() {
        let old = b"linkold\0";
        let new = b"linknew\0";

        LOG.begin_op();
        let inode = INODE_TABLE
            .create(old, InodeType::File, 0, 0)
            .expect("create");
        let inum = inode.inum;
        drop(inode);
        LOG.end_op();

        LOG.begin_op();
        INODE_TABLE.link(old, new).expect("link");
        LOG.end_op();

        LOG.begin_op();
        let linked = INODE_TABLE.namei(new).expect("namei of new name");
        assert_eq!(inum, linked.inum);
        let idata = linked.ilock();
        assert_eq!(2, idata.dinode.nlink);
        drop(idata);
        drop(linked);
        LOG.end_op();

        LOG.begin_op();
        INODE_TABLE.unlink(old).expect("unlink old");
        LOG.end_op();

        LOG.begin_op();
        let left = INODE_TABLE.namei(new).expect("new name survives");
        let idata = left.ilock();
        assert_eq!(1, idata.dinode.nlink);
        drop(idata);
        drop(left);
        INODE_TABLE.unlink(new).expect("unlink new");
        LOG.end_op();
    }

    #[test_case]
    fn mkdir_dot_entries_and_rmdir() {
        let path = b"subdir\0";

        LOG.begin_op();
        let dir = INODE_TABLE
            .create(path, InodeType::Directory, 0, 0)
            .expect("create dir");
        let dir_inum = dir.inum;
        let mut ddata = dir.ilock();
        assert_eq!(InodeType::Directory, ddata.dinode.typ);
        assert_eq!(1, ddata.dinode.nlink);

        let (this, _) = ddata.dirlookup(&name_of(b".")).expect("'.'");
        assert_eq!(dir_inum, this.inum);
        drop(this);
        let (up, _) = ddata.dirlookup(&name_of(b"..")).expect("'..'");
        assert_eq!(ROOTINO, up.inum);
        drop(up);
        assert!(ddata.is_dir_empty());
        drop(ddata);
        drop(dir);
        LOG.end_op();

        // the parent gained a link for "..".
        LOG.begin_op();
        let root = INODE_TABLE.iget(ROOTDEV, ROOTINO);
        let rdata = root.ilock();
        assert!(rdata.dinode.nlink >= 2);
        drop(rdata);
        drop(root);

        INODE_TABLE.unlink(path).expect("rmdir");
        assert!(INODE_TABLE.namei(path).is_none());
        LOG.end_op();
    }

    #[test_case]
    fn unlink_refuses_non_empty_dir() {
        LOG.begin_op();
        let dir = INODE_TABLE
            .create(b"fulldir\0", InodeType::Directory, 0, 0)
            .expect("create dir");
        drop(dir);
        let file = INODE_TABLE
            .create(b"fulldir/inner\0", InodeType::File, 0, 0)
            .expect("create inner");
        drop(file);
        LOG.end_op();

        LOG.begin_op();
        assert_eq!(
            Err(KernelError::NotEmpty),
            INODE_TABLE.unlink(b"fulldir\0")
        );
        INODE_TABLE.unlink(b"fulldir/inner\0").expect("unlink inner");
        INODE_TABLE.unlink(b"fulldir\0").expect("unlink emptied dir");
        LOG.end_op();
    }

    #[test_case]
    fn many_files_unlink_evens() {
        // create f0..f99 each holding its index in ASCII, unlink the
        // even ones, and check exactly the 50 odd ones remain.
        let mut path = [0u8; 8];
        let mut set_path = |i: usize, path: &mut [u8; 8]| {
            path.fill(0);
            path[0] = b'f';
            let mut n = 0;
            if i >= 10 {
                path[1] = b'0' + (i / 10) as u8;
                n = 1;
            }
            path[1 + n] = b'0' + (i % 10) as u8;
        };

        for i in 0..100 {
            set_path(i, &mut path);
            LOG.begin_op();
            let inode = INODE_TABLE
                .create(&path, InodeType::File, 0, 0)
                .expect("create");
            let mut idata = inode.ilock();
            idata
                .writei(false, path[1..].as_ptr(), 0, if i >= 10 { 2 } else { 1 })
                .expect("writei");
            drop(idata);
            drop(inode);
            LOG.end_op();
        }

        for i in (0..100).step_by(2) {
            set_path(i, &mut path);
            LOG.begin_op();
            INODE_TABLE.unlink(&path).expect("unlink even");
            LOG.end_op();
        }

        // list the root directory.
        let root = INODE_TABLE.iget(ROOTDEV, ROOTINO);
        let mut rdata = root.ilock();
        let de_size = mem::size_of::<DirEnt>();
        let mut de = DirEnt::empty();
        let mut remaining = 0;
        for offset in (0..rdata.size()).step_by(de_size) {
            rdata
                .readi(false, &mut de as *mut _ as *mut u8, offset, de_size)
                .expect("readi");
            if de.inum != 0 && de.name[0] == b'f' && de.name[1].is_ascii_digit() {
                let i = if de.name[2] == 0 {
                    (de.name[1] - b'0') as usize
                } else {
                    (de.name[1] - b'0') as usize * 10 + (de.name[2] - b'0') as usize
                };
                assert_eq!(1, i % 2, "even-indexed file survived unlink");
                remaining += 1;
            }
        }
        assert_eq!(50, remaining);
        drop(rdata);
        drop(root);

        for i in (1..100).step_by(2) {
            set_path(i, &mut path);
            LOG.begin_op();
            INODE_TABLE.unlink(&path).expect("unlink odd");
            LOG.end_op();
        }
    }

    #[test_case]
    fn file_grows_into_indirect_blocks() {
        let path = b"bigfile\0";

        LOG.begin_op();
        let inode = INODE_TABLE
            .create(path, InodeType::File, 0, 0)
            .expect("create");
        LOG.end_op();

        // write one block at a time, each in its own transaction, up
        // to two blocks past the direct area.
        let block = [0x5au8; BSIZE];
        for i in 0..(NDIRECT + 2) {
            LOG.begin_op();
            let mut idata = inode.ilock();
            idata
                .writei(false, block.as_ptr(), i * BSIZE, BSIZE)
                .expect("writei");
            drop(idata);
            LOG.end_op();
        }

        let mut idata = inode.ilock();
        assert_eq!((NDIRECT + 2) * BSIZE, idata.size());
        // the single-indirect slot is in use now.
        assert!(idata.dinode.addrs[NDIRECT] != 0);

        let mut back = [0u8; 16];
        idata
            .readi(false, back.as_mut_ptr(), (NDIRECT + 1) * BSIZE + 100, 16)
            .expect("readi");
        assert_eq!([0x5au8; 16], back);
        drop(idata);

        LOG.begin_op();
        drop(inode);
        INODE_TABLE.unlink(path).expect("unlink");
        LOG.end_op();
    }
}
