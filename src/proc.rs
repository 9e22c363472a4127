use core::{cell::UnsafeCell, mem, ptr, sync::atomic::AtomicBool, sync::atomic::Ordering};

use alloc::{boxed::Box, sync::Arc};
use array_macro::array;

use crate::{
    cpu::{CpuTable, CPU_TABLE},
    error::{KernelError, Result},
    file::File,
    fs::{self, Inode, INODE_TABLE},
    page_table::{Page, PageTable, SinglePage},
    param::{KSTACK_SIZE, NOFILE, PAGESIZE, ROOTDEV},
    println,
    process::PROCESS_TABLE,
    register::satp,
    spinlock::{SpinLock, SpinLockGuard},
    trap::{user_trap_ret, usertrap},
};

mod elf;
mod syscall;

use self::syscall::Syscall;

pub const MAXARG: usize = 16;
pub const MAXARGLEN: usize = 64;

/// What a sleeping process is waiting for. Typed per subsystem so a
/// wakeup in one cannot accidentally rouse sleepers of another;
/// wakeup still wakes every process waiting on an equal event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    /// a held sleep-lock, keyed by its flag's address.
    SleepLock { addr: usize },
    /// completion of the virtio request at this descriptor.
    DiskIo { desc: usize },
    /// free descriptors in the virtio queue.
    DiskDescriptors,
    /// log space or an ongoing commit.
    Log,
    /// a line of console input.
    ConsoleInput,
    /// room in the uart transmit ring.
    UartTx,
    /// the next clock tick.
    Ticks,
    /// bytes available in a pipe.
    PipeRead { id: usize },
    /// room available in a pipe.
    PipeWrite { id: usize },
    /// exit of a child of the process with this table index.
    Child { parent: usize },
}

/// Saved kernel registers for a context switch; swtch.S reads and
/// writes this layout.
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee saved
    s0: usize,
    s1: usize,
    s2: usize,
    s3: usize,
    s4: usize,
    s5: usize,
    s6: usize,
    s7: usize,
    s8: usize,
    s9: usize,
    s10: usize,
    s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Per-process trap save area, shared with trampoline.S: the offsets
/// are part of the assembly contract.
#[repr(C)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize,
    /*   8 */ pub kernel_sp: usize,
    /*  16 */ pub kernel_trap: usize,
    /*  24 */ pub epc: usize,
    /*  32 */ pub kernel_hartid: usize,
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Allocated,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// The half of a process the scheduler and other processes touch;
/// guarded by the process spinlock.
pub struct ProcInner {
    pub state: ProcState,
    pub chan: Option<Event>,
    pub pid: usize,
    pub killed: bool,
    pub exit_status: i32,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            chan: None,
            pid: 0,
            killed: false,
            exit_status: 0,
        }
    }
}

/// The private half: only the process itself (or the code tearing it
/// down while it cannot run) touches this, so it sits outside the
/// lock.
pub struct ProcData {
    pub name: [u8; 16],
    kstack: usize,
    pub sz: usize,
    pub page_table: Option<Box<PageTable>>,
    pub trapframe: *mut TrapFrame,
    context: Context,
    pub cwd: Option<Inode>,
    pub o_files: [Option<Arc<File>>; NOFILE],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            name: [0; 16],
            kstack: 0,
            sz: 0,
            page_table: None,
            trapframe: ptr::null_mut(),
            context: Context::new(),
            cwd: None,
            o_files: array![_ => None; NOFILE],
        }
    }

    pub fn set_kstack(&mut self, va: usize) {
        self.kstack = va;
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(self.name.len() - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n..].fill(0);
    }

    /// Allocate the trapframe page and a user page table that maps
    /// it and the trampoline.
    pub fn init_page_table(&mut self) -> Result<()> {
        self.trapframe = unsafe { SinglePage::alloc_into_raw() }
            .or(Err(KernelError::OutOfMemory))? as *mut TrapFrame;

        match PageTable::alloc_user_page_table(self.trapframe as usize) {
            Ok(pgt) => {
                self.page_table = Some(pgt);
                Ok(())
            }
            Err(err) => {
                unsafe { SinglePage::free_from_raw(self.trapframe as *mut SinglePage) };
                self.trapframe = ptr::null_mut();
                Err(err)
            }
        }
    }

    /// Point the new process at forkret, on its own kernel stack.
    pub fn init_context(&mut self) {
        self.context.clear();
        self.context.ra = forkret as usize;
        self.context.sp = self.kstack + KSTACK_SIZE;
    }

    /// Set up the very first user process: one page holding initcode.
    pub fn user_init(&mut self) -> Result<()> {
        self.page_table.as_mut().unwrap().uvm_init(&INITCODE)?;
        self.sz = PAGESIZE;

        // the very first "return" to user space.
        let trapframe = unsafe { self.trapframe.as_mut().unwrap() };
        trapframe.epc = 0; // user program counter
        trapframe.sp = PAGESIZE; // user stack pointer

        // namei of the root path touches no disk blocks, so this is
        // safe at boot, before the first process runs.
        self.cwd = Some(
            INODE_TABLE
                .namei(&[b'/', 0])
                .expect("user_init: no root inode"),
        );
        self.set_name(b"initcode");
        Ok(())
    }

    pub fn get_context(&mut self) -> *mut Context {
        &mut self.context as *mut _
    }

    #[inline]
    pub unsafe fn get_epc(&self) -> usize {
        self.trapframe.as_ref().unwrap().epc
    }

    /// Fill the trapframe fields the trampoline needs and return the
    /// satp value of this process's page table.
    pub unsafe fn setup_user_ret(&mut self) -> usize {
        let trapframe = self.trapframe.as_mut().unwrap();
        trapframe.kernel_satp = satp::read();
        trapframe.kernel_sp = self.kstack + KSTACK_SIZE;
        trapframe.kernel_trap = usertrap as usize;
        trapframe.kernel_hartid = CpuTable::cpu_id();

        self.page_table.as_ref().unwrap().as_satp()
    }

    #[inline]
    pub fn copy_in(&self, dst: *mut u8, srcva: usize, count: usize) -> Result<()> {
        self.page_table.as_ref().unwrap().copy_in(dst, srcva, count)
    }

    #[inline]
    pub fn copy_out(&self, dstva: usize, src: *const u8, count: usize) -> Result<()> {
        self.page_table
            .as_ref()
            .unwrap()
            .copy_out(dstva, src, count)
    }
}

pub struct Proc {
    pub index: usize,
    pub inner: SpinLock<ProcInner>,
    pub data: UnsafeCell<ProcData>,
}

impl Proc {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn is_killed(&self) -> bool {
        let guard = self.inner.lock();
        let killed = guard.killed;
        drop(guard);
        killed
    }

    pub fn set_killed(&self) {
        let mut guard = self.inner.lock();
        guard.killed = true;
        drop(guard);
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_process(&self) {
        let mut guard = self.inner.lock();
        if guard.state == ProcState::Running {
            guard.state = ProcState::Runnable;
            let ctx = unsafe { (*self.data.get()).get_context() };
            guard = unsafe { CPU_TABLE.sched(guard, ctx) };
        }
        drop(guard);
    }

    /// Atomically release the condition lock and sleep on event;
    /// re-acquires the condition lock on return.
    ///
    /// The process lock is taken before the condition lock is
    /// released, so a wakeup between the two cannot be lost: the
    /// waker needs the process lock to inspect our state. `lk` must
    /// not be this process's own lock.
    pub fn sleep<'a, T>(&self, event: Event, lk: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let mut guard = self.inner.lock();

        guard.chan = Some(event);
        guard.state = ProcState::Sleeping;

        let weaked = lk.weak();

        unsafe {
            guard = CPU_TABLE.sched(guard, (*self.data.get()).get_context());
        }

        // woke up.
        guard.chan = None;
        drop(guard);

        weaked.lock()
    }

    /// Create a copy of this process: same memory contents, same open
    /// files, same cwd. Returns the child's pid in the parent; the
    /// child itself resumes in user space returning 0.
    pub fn fork(&mut self) -> Result<usize> {
        let child = unsafe { PROCESS_TABLE.alloc_proc() }.ok_or(KernelError::OutOfMemory)?;

        let mut cguard = child.inner.lock();

        // copy user memory from parent to child.
        let pdata = self.data.get_mut();
        let cdata = child.data.get_mut();
        let cpgt = cdata.page_table.as_mut().unwrap();
        let sz = pdata.sz;
        if let Err(err) = pdata.page_table.as_mut().unwrap().uvm_copy(cpgt, sz) {
            Proc::free(cdata, &mut cguard);
            return Err(err);
        }
        cdata.sz = sz;

        // copy the saved user registers; a0 makes fork return 0 in
        // the child.
        unsafe { ptr::copy_nonoverlapping(pdata.trapframe, cdata.trapframe, 1) };
        unsafe { cdata.trapframe.as_mut() }.unwrap().a0 = 0;

        // share open files and the working directory.
        for i in 0..pdata.o_files.len() {
            if let Some(f) = &pdata.o_files[i] {
                cdata.o_files[i].replace(f.clone());
            }
        }
        cdata.cwd = Some(INODE_TABLE.idup(pdata.cwd.as_ref().unwrap()));
        cdata.name = pdata.name;

        let pid = cguard.pid;
        drop(cguard);

        let mut parents = unsafe { PROCESS_TABLE.parents.lock() };
        parents[child.index] = Some(self.index);
        drop(parents);

        // publish the child only now that it is fully built.
        let mut cguard = child.inner.lock();
        cguard.state = ProcState::Runnable;
        drop(cguard);

        Ok(pid)
    }

    /// Return a process slot to the unused pool, releasing its
    /// address space.
    pub fn free(pdata: &mut ProcData, inner: &mut ProcInner) {
        if !pdata.trapframe.is_null() {
            unsafe { SinglePage::free_from_raw(pdata.trapframe as *mut _) };
            pdata.trapframe = ptr::null_mut();
        }
        if let Some(mut pgt) = pdata.page_table.take() {
            pgt.unmap_user_page_table(pdata.sz);
            drop(pgt);
        }
        pdata.sz = 0;
        pdata.name.fill(0);
        inner.state = ProcState::Unused;
        inner.chan = None;
        inner.pid = 0;
        inner.killed = false;
        inner.exit_status = 0;
    }

    /// Decode and dispatch the system call held in the trapframe,
    /// leaving the return value in a0. Errors become -1.
    pub fn syscall(&mut self) {
        let trapframe = unsafe { self.data.get_mut().trapframe.as_mut() }.unwrap();

        let num = trapframe.a7;
        let ret = match num {
            1 => self.sys_fork(),
            2 => self.sys_exit(),
            3 => self.sys_wait(),
            4 => self.sys_pipe(),
            5 => self.sys_read(),
            6 => self.sys_kill(),
            7 => self.sys_exec(),
            8 => self.sys_fstat(),
            9 => self.sys_chdir(),
            10 => self.sys_dup(),
            11 => self.sys_getpid(),
            12 => self.sys_sbrk(),
            13 => self.sys_sleep(),
            14 => self.sys_uptime(),
            15 => self.sys_open(),
            16 => self.sys_write(),
            17 => self.sys_mknod(),
            18 => self.sys_unlink(),
            19 => self.sys_link(),
            20 => self.sys_mkdir(),
            21 => self.sys_close(),
            _ => {
                let pid = self.inner.lock().pid;
                println!("pid {}: unknown syscall {}", pid, num);
                Err(KernelError::BadArgument)
            }
        };

        trapframe.a0 = match ret {
            Ok(ret) => ret,
            Err(err) => {
                println!("syscall {} failed: {}", num, err);
                -1isize as usize
            }
        };
    }

    #[inline]
    fn arg_raw(&mut self, n: usize) -> Result<usize> {
        let tf = unsafe { self.data.get_mut().trapframe.as_ref().unwrap() };
        match n {
            0 => Ok(tf.a0),
            1 => Ok(tf.a1),
            2 => Ok(tf.a2),
            3 => Ok(tf.a3),
            4 => Ok(tf.a4),
            5 => Ok(tf.a5),
            _ => Err(KernelError::BadArgument),
        }
    }

    #[inline]
    fn arg_i32(&mut self, n: usize) -> Result<i32> {
        let raw = self.arg_raw(n)?;
        Ok(raw as i32)
    }

    /// A file-descriptor argument: in range and open.
    #[inline]
    fn arg_fd(&mut self, n: usize) -> Result<usize> {
        let fd = self.arg_i32(n)?;
        if fd < 0 || fd as usize >= NOFILE {
            return Err(KernelError::BadDescriptor);
        }
        let fd = fd as usize;
        if self.data.get_mut().o_files[fd].is_none() {
            return Err(KernelError::BadDescriptor);
        }
        Ok(fd)
    }

    /// A string argument: user pointer to a NUL-terminated string.
    #[inline]
    fn arg_str(&mut self, n: usize, dst: &mut [u8]) -> Result<usize> {
        let addr = self.arg_raw(n)?;
        self.fetch_str(addr, dst)
    }

    #[inline]
    fn fetch_str(&mut self, addr: usize, dst: &mut [u8]) -> Result<usize> {
        self.data
            .get_mut()
            .page_table
            .as_ref()
            .unwrap()
            .copy_in_str(dst, addr)
    }

    /// Read a usize from user memory.
    #[inline]
    fn fetch_addr(&mut self, addr: usize) -> Result<usize> {
        let sz = self.data.get_mut().sz;
        if addr >= sz || addr + mem::size_of::<usize>() > sz {
            return Err(KernelError::BadAddress);
        }
        let mut dst: usize = 0;
        self.data.get_mut().copy_in(
            &mut dst as *mut usize as *mut u8,
            addr,
            mem::size_of::<usize>(),
        )?;
        Ok(dst)
    }

    #[inline]
    fn alloc_fd(&mut self) -> Result<usize> {
        for (i, f) in self.data.get_mut().o_files.iter().enumerate() {
            if f.is_none() {
                return Ok(i);
            }
        }
        Err(KernelError::BadDescriptor)
    }
}

/// Copy to dst, which is a user virtual address iff is_user.
pub fn either_copy_out(is_user: bool, dst: *mut u8, src: *const u8, count: usize) -> Result<()> {
    if is_user {
        let p = unsafe { CPU_TABLE.my_proc() };
        p.data.get_mut().copy_out(dst as usize, src, count)
    } else {
        unsafe { ptr::copy(src, dst, count) };
        Ok(())
    }
}

/// Copy from src, which is a user virtual address iff is_user.
pub fn either_copy_in(is_user: bool, dst: *mut u8, src: *const u8, count: usize) -> Result<()> {
    if is_user {
        let p = unsafe { CPU_TABLE.my_proc() };
        p.data.get_mut().copy_in(dst, src as usize, count)
    } else {
        unsafe { ptr::copy(src, dst, count) };
        Ok(())
    }
}

static FIRST: AtomicBool = AtomicBool::new(true);

/// A newly scheduled process starts here, still holding the process
/// lock the scheduler acquired.
unsafe fn forkret() {
    CPU_TABLE.my_proc().inner.unlock();

    if FIRST.swap(false, Ordering::AcqRel) {
        // the file system must be mounted from process context: it
        // sleeps on disk I/O.
        fs::init(ROOTDEV);

        // entry point for `cargo test`
        #[cfg(test)]
        crate::test_main();
    }

    user_trap_ret();
}

/// Machine code of the first user program: exec("/init", {"/init", 0}).
static INITCODE: [u8; 51] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x05, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x05, 0x02,
    0x9d, 0x48, 0x73, 0x00, 0x00, 0x00, 0x89, 0x48, 0x73, 0x00, 0x00, 0x00, 0xef, 0xf0, 0xbf, 0xff,
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00,
];

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::param::PAGESIZE;

    #[test_case]
    fn first_process_layout() {
        let pdata = unsafe { CPU_TABLE.my_proc() }.data.get_mut();
        assert_eq!(PAGESIZE, pdata.sz);
        let tf = unsafe { pdata.trapframe.as_ref() }.unwrap();
        assert_eq!(PAGESIZE, tf.sp);
        assert!(pdata.cwd.is_some());
    }

    // immediately exit with status 42:
    //   li a0, 42
    //   li a7, SYS_exit
    //   ecall
    static EXIT_42_CODE: [u8; 12] = [
        0x13, 0x05, 0xa0, 0x02, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    ];

    #[test_case]
    fn fork_exit_wait_delivers_status() {
        let p = unsafe { CPU_TABLE.my_proc() };
        let pdata = p.data.get_mut();

        // grow a scratch page for the reported status.
        let status_va = pdata.sz;
        pdata.sz = pdata
            .page_table
            .as_mut()
            .unwrap()
            .uvm_alloc(status_va, status_va + PAGESIZE)
            .expect("uvm_alloc");

        // swap page 0 for code that exits with status 42; the child
        // inherits the copy and runs it.
        let pgt = pdata.page_table.as_mut().unwrap();
        pgt.unmap_pages(0, 1, true);
        pgt.uvm_init(&EXIT_42_CODE).expect("map exit code");

        let child_pid = p.fork().expect("fork");

        let waited = unsafe { PROCESS_TABLE.wait(p, status_va) }.expect("wait");
        assert_eq!(child_pid, waited);

        let mut status: i32 = 0;
        let pdata = p.data.get_mut();
        pdata
            .copy_in(&mut status as *mut i32 as *mut u8, status_va, 4)
            .expect("copy_in");
        assert_eq!(42, status);

        // restore the initcode page and drop the scratch page.
        let pgt = pdata.page_table.as_mut().unwrap();
        pgt.unmap_pages(0, 1, true);
        pgt.uvm_init(&INITCODE).expect("restore initcode");
        pdata.sz = pdata
            .page_table
            .as_mut()
            .unwrap()
            .uvm_dealloc(pdata.sz, status_va);
    }

    #[test_case]
    fn wait_without_children_fails() {
        let p = unsafe { CPU_TABLE.my_proc() };
        assert!(unsafe { PROCESS_TABLE.wait(p, 0) }.is_err());
    }

    #[test_case]
    fn kill_missing_pid_fails() {
        assert!(unsafe { PROCESS_TABLE.kill(9999) }.is_err());
    }

    #[test_case]
    fn fork_chain_waits_in_order() {
        // parent forks a child that exits with 42 (the inherited page
        // 0 code); do it twice in a row and check each wait pairs
        // with its child.
        let p = unsafe { CPU_TABLE.my_proc() };
        let pdata = p.data.get_mut();
        let pgt = pdata.page_table.as_mut().unwrap();
        pgt.unmap_pages(0, 1, true);
        pgt.uvm_init(&EXIT_42_CODE).expect("map exit code");

        let first = p.fork().expect("fork");
        let second = p.fork().expect("fork");
        assert!(second > first);

        let w1 = unsafe { PROCESS_TABLE.wait(p, 0) }.expect("wait");
        let w2 = unsafe { PROCESS_TABLE.wait(p, 0) }.expect("wait");
        let mut reaped = [w1, w2];
        reaped.sort_unstable();
        assert_eq!([first, second], reaped);

        let pdata = p.data.get_mut();
        let pgt = pdata.page_table.as_mut().unwrap();
        pgt.unmap_pages(0, 1, true);
        pgt.uvm_init(&INITCODE).expect("restore initcode");
    }
}
