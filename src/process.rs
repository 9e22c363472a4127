use core::{mem, ptr};

use array_macro::array;

use crate::{
    cpu::CPU_TABLE,
    error::{KernelError, Result},
    kvm::kvm_map,
    log::LOG,
    page_table::{Page, PteFlag, SinglePage},
    param::{KSTACK_SIZE, PAGESIZE, TRAMPOLINE},
    proc::{Event, Proc, ProcState},
    spinlock::SpinLock,
};

pub const NPROC: usize = 64;

pub static mut PROCESS_TABLE: ProcessTable = ProcessTable::new();

pub struct ProcessTable {
    tables: [Proc; NPROC],
    next_pid: SpinLock<usize>,
    // parent links live outside the per-process locks; wait and exit
    // serialize on this table instead.
    pub parents: SpinLock<[Option<usize>; NPROC]>,
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            tables: array![i => Proc::new(i); NPROC],
            next_pid: SpinLock::new(1, "next_pid"),
            parents: SpinLock::new([None; NPROC], "parents"),
        }
    }

    /// Allocate a kernel stack for each process slot, mapped high
    /// under the trampoline with an unmapped guard page below each.
    pub fn init(&mut self) {
        for (i, p) in self.tables.iter_mut().enumerate() {
            let va = kstack_va(i);
            let pa = unsafe { SinglePage::alloc_into_raw() }
                .expect("process_table: out of memory for kernel stacks");
            unsafe { kvm_map(va, pa as usize, KSTACK_SIZE, PteFlag::READ | PteFlag::WRITE) };
            p.data.get_mut().set_kstack(va);
        }
    }

    #[inline]
    fn alloc_pid(&mut self) -> usize {
        let mut pid = self.next_pid.lock();
        let ret = *pid;
        *pid += 1;
        drop(pid);
        ret
    }

    /// Find an unused slot and prepare it: trapframe, page table,
    /// starting context. Returns it in Allocated state.
    pub fn alloc_proc(&mut self) -> Option<&mut Proc> {
        let pid = self.alloc_pid();
        for p in self.tables.iter_mut() {
            let mut guard = p.inner.lock();
            if guard.state == ProcState::Unused {
                let pdata = p.data.get_mut();
                if pdata.init_page_table().is_err() {
                    drop(guard);
                    return None;
                }
                pdata.init_context();

                guard.pid = pid;
                guard.state = ProcState::Allocated;

                drop(guard);
                return Some(p);
            }
            drop(guard);
        }
        None
    }

    /// Create the first user process.
    pub fn user_init(&mut self) {
        let p = self.alloc_proc().expect("user_init: no process slot");

        p.data
            .get_mut()
            .user_init()
            .expect("user_init: first process setup failed");

        p.inner.lock().state = ProcState::Runnable;
    }

    /// Hand the scheduler a runnable process, marked Allocated so no
    /// other hart grabs it meanwhile.
    pub fn find_runnable(&mut self) -> Option<&mut Proc> {
        for p in self.tables.iter_mut() {
            let mut guard = p.inner.lock();
            if guard.state == ProcState::Runnable {
                guard.state = ProcState::Allocated;
                drop(guard);
                return Some(p);
            }
            drop(guard);
        }
        None
    }

    /// Wake every process sleeping on an equal event.
    pub unsafe fn wakeup(&self, event: Event) {
        let myself = CPU_TABLE.my_proc_raw();
        for p in self.tables.iter() {
            if ptr::eq(p, myself) {
                continue;
            }
            let mut guard = p.inner.lock();
            if guard.state == ProcState::Sleeping && guard.chan == Some(event) {
                guard.state = ProcState::Runnable;
            }
            drop(guard);
        }
    }

    /// Wait for a child of p to exit; copies its exit status to the
    /// user address addr unless addr is 0, and returns its pid.
    pub fn wait(&mut self, p: &mut Proc, addr: usize) -> Result<usize> {
        let mut parents = self.parents.lock();

        loop {
            let mut have_kids = false;
            for i in 0..NPROC {
                if parents[i] != Some(p.index) {
                    continue;
                }

                let child = &mut self.tables[i];
                let mut cguard = child.inner.lock();

                have_kids = true;

                if cguard.state != ProcState::Zombie {
                    drop(cguard);
                    continue;
                }

                if addr != 0 {
                    if let Err(err) = p.data.get_mut().copy_out(
                        addr,
                        &cguard.exit_status as *const i32 as *const u8,
                        mem::size_of::<i32>(),
                    ) {
                        drop(cguard);
                        drop(parents);
                        return Err(err);
                    }
                }

                let child_pid = cguard.pid;

                let cdata = child.data.get_mut();
                Proc::free(cdata, &mut cguard);
                drop(cguard);
                parents[child.index].take();

                return Ok(child_pid);
            }

            if !have_kids {
                drop(parents);
                return Err(KernelError::NotFound);
            }
            if p.is_killed() {
                drop(parents);
                return Err(KernelError::Interrupted);
            }

            // sleep until some child's exit wakes us.
            parents = p.sleep(Event::Child { parent: p.index }, parents);
        }
    }

    /// Terminate the process: close its files, give its children to
    /// init, wake its parent, become a zombie and schedule away.
    pub fn exit(&mut self, p: &mut Proc, status: i32) -> ! {
        if p.index == 0 {
            panic!("init exiting");
        }

        // close open files.
        let pdata = p.data.get_mut();
        for f in pdata.o_files.iter_mut() {
            drop(f.take());
        }

        LOG.begin_op();
        drop(pdata.cwd.take());
        LOG.end_op();

        let mut parents = self.parents.lock();

        // pass abandoned children to init.
        for i in 1..NPROC {
            if parents[i] == Some(p.index) {
                parents[i] = Some(0);
                unsafe { self.wakeup(Event::Child { parent: 0 }) };
            }
        }

        // every process but init was made by fork and has a parent.
        let parent = parents[p.index].expect("exit: no parent");
        unsafe { self.wakeup(Event::Child { parent }) };

        let mut guard = p.inner.lock();
        guard.exit_status = status;
        guard.state = ProcState::Zombie;

        drop(parents);

        // into the scheduler, never to return.
        unsafe {
            CPU_TABLE.sched(guard, pdata.get_context());
        }
        unreachable!("zombie resumed");
    }

    /// Flag the process with this pid; it exits at its next trap
    /// boundary. A sleeping target is woken so it can notice.
    pub fn kill(&self, pid: usize) -> Result<()> {
        for p in self.tables.iter() {
            let mut guard = p.inner.lock();
            if guard.pid == pid && guard.state != ProcState::Unused {
                guard.killed = true;
                if guard.state == ProcState::Sleeping {
                    guard.state = ProcState::Runnable;
                }
                drop(guard);
                return Ok(());
            }
            drop(guard);
        }
        Err(KernelError::NotFound)
    }
}

#[inline]
fn kstack_va(i: usize) -> usize {
    TRAMPOLINE - ((i + 1) * (KSTACK_SIZE + PAGESIZE))
}
