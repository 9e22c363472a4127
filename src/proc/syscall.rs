use core::mem;

use alloc::boxed::Box;
use array_macro::array;

use crate::{
    error::{KernelError, Result},
    file::File,
    fs::{FileStat, InodeType, INODE_TABLE},
    log::LOG,
    param::MAXPATH,
    process::PROCESS_TABLE,
    trap,
};

use super::{elf, Proc, MAXARG, MAXARGLEN};

type SysResult = Result<usize>;

/// The system call surface, one method per slot in the dispatch
/// table. Numbers in comments are the a7 values user code passes.
pub trait Syscall {
    /// int fork()
    /// Create a process, return the child's pid.
    fn sys_fork(&mut self) -> SysResult; // 1

    /// int exit(int status)
    /// Terminate the current process; status reported to wait().
    fn sys_exit(&mut self) -> SysResult; // 2

    /// int wait(int *status)
    /// Wait for a child to exit; its status lands in *status.
    fn sys_wait(&mut self) -> SysResult; // 3

    /// int pipe(int p[])
    /// Create a pipe; read/write descriptors in p[0] and p[1].
    fn sys_pipe(&mut self) -> SysResult; // 4

    /// int read(int fd, char *buf, int n)
    /// Read n bytes into buf; returns the count, 0 at end of file.
    fn sys_read(&mut self) -> SysResult; // 5

    /// int kill(int pid)
    /// Flag process pid to terminate at its next trap boundary.
    fn sys_kill(&mut self) -> SysResult; // 6

    /// int exec(char *file, char *argv[])
    /// Replace the address space with the named program.
    fn sys_exec(&mut self) -> SysResult; // 7

    /// int fstat(int fd, struct stat *st)
    /// Metadata of an open file into *st.
    fn sys_fstat(&mut self) -> SysResult; // 8

    /// int chdir(char *dir)
    /// Change the working directory.
    fn sys_chdir(&mut self) -> SysResult; // 9

    /// int dup(int fd)
    /// A new descriptor for the same open file.
    fn sys_dup(&mut self) -> SysResult; // 10

    /// int getpid()
    fn sys_getpid(&mut self) -> SysResult; // 11

    /// char *sbrk(int n)
    /// Grow (or shrink) the heap; returns the old break.
    fn sys_sbrk(&mut self) -> SysResult; // 12

    /// int sleep(int n)
    /// Pause for n clock ticks.
    fn sys_sleep(&mut self) -> SysResult; // 13

    /// int uptime()
    /// Clock ticks since boot.
    fn sys_uptime(&mut self) -> SysResult; // 14

    /// int open(char *file, int flags)
    fn sys_open(&mut self) -> SysResult; // 15

    /// int write(int fd, char *buf, int n)
    fn sys_write(&mut self) -> SysResult; // 16

    /// int mknod(char *file, int major, int minor)
    /// Create a device file.
    fn sys_mknod(&mut self) -> SysResult; // 17

    /// int unlink(char *file)
    fn sys_unlink(&mut self) -> SysResult; // 18

    /// int link(char *old, char *new)
    /// Another name for an existing file.
    fn sys_link(&mut self) -> SysResult; // 19

    /// int mkdir(char *dir)
    fn sys_mkdir(&mut self) -> SysResult; // 20

    /// int close(int fd)
    fn sys_close(&mut self) -> SysResult; // 21
}

impl Syscall for Proc {
    fn sys_fork(&mut self) -> SysResult {
        self.fork()
    }

    fn sys_exit(&mut self) -> SysResult {
        let status = self.arg_i32(0)?;
        unsafe { PROCESS_TABLE.exit(self, status) }
    }

    fn sys_wait(&mut self) -> SysResult {
        let addr = self.arg_raw(0)?;
        unsafe { PROCESS_TABLE.wait(self, addr) }
    }

    fn sys_pipe(&mut self) -> SysResult {
        // user pointer to an array of two ints.
        let addr = self.arg_raw(0)?;

        let (rf, wf) = File::alloc_pipe();

        let rfd = self.alloc_fd()?;
        self.data.get_mut().o_files[rfd].replace(rf);

        let wfd = match self.alloc_fd() {
            Ok(fd) => fd,
            Err(err) => {
                drop(self.data.get_mut().o_files[rfd].take());
                return Err(err);
            }
        };
        self.data.get_mut().o_files[wfd].replace(wf);

        let fds = [rfd as i32, wfd as i32];
        if let Err(err) =
            self.data
                .get_mut()
                .copy_out(addr, fds.as_ptr() as *const u8, mem::size_of_val(&fds))
        {
            drop(self.data.get_mut().o_files[rfd].take());
            drop(self.data.get_mut().o_files[wfd].take());
            return Err(err);
        }

        Ok(0)
    }

    fn sys_read(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let addr = self.arg_raw(1)?;
        let n = self.arg_i32(2)?;
        if n < 0 {
            return Err(KernelError::BadArgument);
        }

        let f = self.data.get_mut().o_files[fd].clone().unwrap();
        f.read(addr, n as usize)
    }

    fn sys_kill(&mut self) -> SysResult {
        let pid = self.arg_i32(0)?;
        if pid < 0 {
            return Err(KernelError::BadArgument);
        }
        unsafe { PROCESS_TABLE.kill(pid as usize)? };
        Ok(0)
    }

    fn sys_exec(&mut self) -> SysResult {
        let mut path = [0u8; MAXPATH];
        let null_pos = self.arg_str(0, &mut path)?;

        // argv: user array of string pointers, terminated by 0.
        let arg_base_addr = self.arg_raw(1)?;
        let mut argv: [Option<Box<[u8; MAXARGLEN]>>; MAXARG] = array![_ => None; MAXARG];
        for i in 0..MAXARG {
            let uarg = self.fetch_addr(arg_base_addr + i * mem::size_of::<usize>())?;
            if uarg == 0 {
                break;
            }

            let mut buf = Box::<[u8; MAXARGLEN]>::try_new_zeroed()
                .map(|b| unsafe { b.assume_init() })
                .or(Err(KernelError::OutOfMemory))?;

            self.fetch_str(uarg, buf.as_mut())?;
            argv[i] = Some(buf);
        }

        elf::load(self.data.get_mut(), &path[..=null_pos], &argv)
    }

    fn sys_fstat(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        // user pointer to a struct stat.
        let addr = self.arg_raw(1)?;

        let f = self.data.get_mut().o_files[fd].clone().unwrap();
        let mut st = FileStat::uninit();
        f.stat(&mut st)?;

        self.data.get_mut().copy_out(
            addr,
            &st as *const FileStat as *const u8,
            mem::size_of::<FileStat>(),
        )?;

        Ok(0)
    }

    fn sys_chdir(&mut self) -> SysResult {
        let mut path = [0u8; MAXPATH];
        let null_pos = self.arg_str(0, &mut path)?;

        LOG.begin_op();

        let result = (|| {
            let inode = INODE_TABLE
                .namei(&path[..=null_pos])
                .ok_or(KernelError::NotFound)?;

            let idata = inode.ilock();
            if idata.get_type() != InodeType::Directory {
                drop(idata);
                drop(inode);
                return Err(KernelError::NotDirectory);
            }
            drop(idata);

            let old = self.data.get_mut().cwd.replace(inode);
            drop(old);
            Ok(0)
        })();

        LOG.end_op();
        result
    }

    fn sys_dup(&mut self) -> SysResult {
        let old_fd = self.arg_fd(0)?;
        let new_fd = self.alloc_fd()?;

        let f = self.data.get_mut().o_files[old_fd].clone().unwrap();
        self.data.get_mut().o_files[new_fd].replace(f);

        Ok(new_fd)
    }

    fn sys_getpid(&mut self) -> SysResult {
        let guard = self.inner.lock();
        let pid = guard.pid;
        drop(guard);
        Ok(pid)
    }

    fn sys_sbrk(&mut self) -> SysResult {
        let n = self.arg_i32(0)?;
        let pdata = self.data.get_mut();
        let old_sz = pdata.sz;
        if n > 0 {
            pdata.sz = pdata
                .page_table
                .as_mut()
                .unwrap()
                .uvm_alloc(old_sz, old_sz + n as usize)?;
        } else if n < 0 {
            let shrink = (-n) as usize;
            if shrink > old_sz {
                return Err(KernelError::BadArgument);
            }
            pdata.sz = pdata
                .page_table
                .as_mut()
                .unwrap()
                .uvm_dealloc(old_sz, old_sz - shrink);
        }
        Ok(old_sz)
    }

    fn sys_sleep(&mut self) -> SysResult {
        let n = self.arg_i32(0)?;
        if n < 0 {
            return Err(KernelError::BadArgument);
        }
        trap::sleep_ticks(n as usize)?;
        Ok(0)
    }

    fn sys_uptime(&mut self) -> SysResult {
        Ok(trap::ticks_now())
    }

    fn sys_open(&mut self) -> SysResult {
        let mut path = [0u8; MAXPATH];
        let null_pos = self.arg_str(0, &mut path)?;
        let o_mode = self.arg_i32(1)?;

        let f = File::open(&path[..=null_pos], o_mode)?;
        let fd = self.alloc_fd()?;
        self.data.get_mut().o_files[fd].replace(f);

        Ok(fd)
    }

    fn sys_write(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let addr = self.arg_raw(1)?;
        let n = self.arg_i32(2)?;
        if n < 0 {
            return Err(KernelError::BadArgument);
        }

        let f = self.data.get_mut().o_files[fd].clone().unwrap();
        f.write(addr, n as usize)
    }

    fn sys_mknod(&mut self) -> SysResult {
        let mut path = [0u8; MAXPATH];
        let null_pos = self.arg_str(0, &mut path)?;
        let major = self.arg_i32(1)?;
        let minor = self.arg_i32(2)?;
        if major < 0 || minor < 0 {
            return Err(KernelError::BadArgument);
        }

        LOG.begin_op();
        let result = INODE_TABLE
            .create(
                &path[..=null_pos],
                InodeType::Device,
                major as u16,
                minor as u16,
            )
            .map(|inode| {
                drop(inode);
                0
            });
        LOG.end_op();

        result
    }

    fn sys_unlink(&mut self) -> SysResult {
        let mut path = [0u8; MAXPATH];
        let null_pos = self.arg_str(0, &mut path)?;

        LOG.begin_op();
        let result = INODE_TABLE.unlink(&path[..=null_pos]).map(|_| 0);
        LOG.end_op();

        result
    }

    fn sys_link(&mut self) -> SysResult {
        let mut old = [0u8; MAXPATH];
        let old_null = self.arg_str(0, &mut old)?;
        let mut new = [0u8; MAXPATH];
        let new_null = self.arg_str(1, &mut new)?;

        LOG.begin_op();
        let result = INODE_TABLE
            .link(&old[..=old_null], &new[..=new_null])
            .map(|_| 0);
        LOG.end_op();

        result
    }

    fn sys_mkdir(&mut self) -> SysResult {
        let mut path = [0u8; MAXPATH];
        let null_pos = self.arg_str(0, &mut path)?;

        LOG.begin_op();
        let result = INODE_TABLE
            .create(&path[..=null_pos], InodeType::Directory, 0, 0)
            .map(|inode| {
                drop(inode);
                0
            });
        LOG.end_op();

        result
    }

    fn sys_close(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        drop(self.data.get_mut().o_files[fd].take());
        Ok(0)
    }
}
