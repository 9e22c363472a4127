//! ELF program loading for exec.
//!
//! Builds the new address space in a scratch page table and commits
//! only at the very end, so a failed exec leaves the caller's image
//! untouched.

use core::{cmp, mem};

use alloc::boxed::Box;

use crate::{
    error::{KernelError, Result},
    fs::{InodeData, INODE_TABLE},
    log::LOG,
    page_table::{align_up, PageTable},
    param::PAGESIZE,
    proc::ProcData,
    sleeplock::SleepLockGuard,
};

use super::{MAXARG, MAXARGLEN};

const ELF_MAGIC: u32 = 0x464C457F; // "\x7fELF" in little endian
const ELF_PROG_LOAD: u32 = 1;

pub fn load(
    p: &mut ProcData,
    path: &[u8],
    argv: &[Option<Box<[u8; MAXARGLEN]>>; MAXARG],
) -> Result<usize> {
    LOG.begin_op();
    let result = load_inner(p, path, argv);
    LOG.end_op();
    result
}

fn load_inner(
    p: &mut ProcData,
    path: &[u8],
    argv: &[Option<Box<[u8; MAXARGLEN]>>; MAXARG],
) -> Result<usize> {
    let inode = INODE_TABLE.namei(path).ok_or(KernelError::NotFound)?;
    let mut idata = inode.ilock();

    // the ELF header, then one program header per segment.
    let mut elfhdr = mem::MaybeUninit::<ElfHeader>::uninit();
    let read = idata.readi(
        false,
        elfhdr.as_mut_ptr() as *mut u8,
        0,
        mem::size_of::<ElfHeader>(),
    )?;
    if read != mem::size_of::<ElfHeader>() {
        return Err(KernelError::BadArgument);
    }
    let elfhdr = unsafe { elfhdr.assume_init() };

    if elfhdr.magic != ELF_MAGIC {
        return Err(KernelError::BadArgument);
    }

    let mut pgt = PageTable::alloc_user_page_table(p.trapframe as usize)?;

    // on any failure from here on, the half-built page table and its
    // frames must be torn down.
    let mut size = 0usize;
    let loaded = (|| {
        let ph_size = mem::size_of::<ProgHeader>();
        let off_start = elfhdr.phoff as usize;
        let off_end = off_start + elfhdr.phnum as usize * ph_size;
        for off in (off_start..off_end).step_by(ph_size) {
            let mut ph = mem::MaybeUninit::<ProgHeader>::uninit();
            let read = idata.readi(false, ph.as_mut_ptr() as *mut u8, off, ph_size)?;
            if read != ph_size {
                return Err(KernelError::BadArgument);
            }
            let ph = unsafe { ph.assume_init() };

            if ph.typed != ELF_PROG_LOAD {
                continue;
            }
            if ph.memsz < ph.filesz || ph.vaddr.checked_add(ph.memsz).is_none() {
                return Err(KernelError::BadArgument);
            }
            if ph.vaddr as usize % PAGESIZE != 0 {
                return Err(KernelError::BadArgument);
            }

            size = pgt.uvm_alloc(size, (ph.vaddr + ph.memsz) as usize)?;
            load_segment(
                &mut pgt,
                &mut idata,
                ph.vaddr as usize,
                ph.off as usize,
                ph.filesz as usize,
            )?;
        }
        Ok(())
    })();

    if let Err(err) = loaded {
        pgt.unmap_user_page_table(size);
        return Err(err);
    }

    drop(idata);
    drop(inode);

    let committed = (|| {
        size = align_up(size, PAGESIZE);

        // two fresh pages: the lower one is the stack guard, made
        // inaccessible; the upper one is the user stack.
        size = pgt.uvm_alloc(size, size + 2 * PAGESIZE)?;
        pgt.uvm_clear(size - 2 * PAGESIZE);
        let mut sp = size;
        let stackbase = sp - PAGESIZE;

        // push the argument strings.
        let mut ustack = [0usize; MAXARG + 1];
        let mut argc = 0;
        for (i, arg) in argv.iter().enumerate() {
            let arg = match arg {
                None => break,
                Some(arg) => arg,
            };
            argc = i + 1;

            let count = arg.iter().position(|v| *v == 0).unwrap_or(arg.len() - 1) + 1;
            sp -= count;
            sp -= sp % 16; // the riscv sp must be 16-byte aligned
            if sp < stackbase {
                return Err(KernelError::BadArgument);
            }
            pgt.copy_out(sp, arg.as_ptr(), count)?;
            ustack[i] = sp;
        }

        // then the argv[] array itself, NULL-terminated.
        sp -= (argc + 1) * mem::size_of::<usize>();
        sp -= sp % 16;
        if sp < stackbase {
            return Err(KernelError::BadArgument);
        }
        pgt.copy_out(
            sp,
            ustack.as_ptr() as *const u8,
            (argc + 1) * mem::size_of::<usize>(),
        )?;

        Ok((sp, argc))
    })();

    let (sp, argc) = match committed {
        Ok(v) => v,
        Err(err) => {
            pgt.unmap_user_page_table(size);
            return Err(err);
        }
    };

    // commit to the new image.
    let tf = unsafe { p.trapframe.as_mut().unwrap() };
    tf.a1 = sp; // argv for main(argc, argv)
    tf.epc = elfhdr.entry as usize;
    tf.sp = sp;

    p.set_name(basename(path));

    let mut old_pgt = p.page_table.replace(pgt).unwrap();
    let old_sz = p.sz;
    p.sz = size;
    old_pgt.unmap_user_page_table(old_sz);
    drop(old_pgt);

    Ok(argc)
}

/// Copy one segment's file contents into the freshly mapped pages.
fn load_segment(
    pgt: &mut PageTable,
    idata: &mut SleepLockGuard<'_, InodeData>,
    va: usize,
    offset: usize,
    sz: usize,
) -> Result<()> {
    for i in (0..sz).step_by(PAGESIZE) {
        let pa = pgt.walk_addr(va + i)?;
        let n = cmp::min(sz - i, PAGESIZE);
        let read = idata.readi(false, pa as *mut u8, offset + i, n)?;
        if read != n {
            return Err(KernelError::BadArgument);
        }
    }

    Ok(())
}

/// The final path component, for the process name.
fn basename(path: &[u8]) -> &[u8] {
    let end = path.iter().position(|c| *c == 0).unwrap_or(path.len());
    let path = &path[..end];
    match path.iter().rposition(|c| *c == b'/') {
        Some(slash) => &path[slash + 1..],
        None => path,
    }
}

/// ELF file header (64-bit).
#[repr(C)]
struct ElfHeader {
    magic: u32,
    elf: [u8; 12],
    typed: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF program segment header.
#[repr(C)]
struct ProgHeader {
    typed: u32,
    flags: u32,
    off: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn basename_strips_directories() {
        assert_eq!(b"init", basename(b"/init\0"));
        assert_eq!(b"ls", basename(b"/bin/ls\0"));
        assert_eq!(b"sh", basename(b"sh\0"));
    }

    #[test_case]
    fn exec_of_missing_path_fails() {
        let p = unsafe { crate::cpu::CPU_TABLE.my_proc() };
        let argv = array_macro::array![_ => None; MAXARG];
        let r = load(p.data.get_mut(), b"/no-such-binary\0", &argv);
        assert!(matches!(r, Err(KernelError::NotFound)));
    }
}
