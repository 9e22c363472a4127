//! Driver for qemu's virtio disk device, using the legacy mmio
//! interface.
//!
//! One queue of NUM descriptors; each block request takes a chain of
//! three (header, data, status). The submitting process sleeps until
//! the interrupt handler sees the request on the used ring.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use array_macro::array;

use crate::{
    bio::{BufGuard, BSIZE},
    cpu::CPU_TABLE,
    param::{PAGESIZE, VIRTIO0},
    proc::Event,
    process::PROCESS_TABLE,
    spinlock::SpinLock,
};

const NUM: usize = 8; // this many virtio descriptors. must be a power of two.

pub static DISK: SpinLock<Disk> = SpinLock::new(Disk::new(), "virtio_disk");

#[repr(C)]
struct Desc {
    addr: usize,
    len: u32,
    flags: u16,
    next: u16,
}

impl Desc {
    const fn new() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        }
    }
}

#[repr(C)]
struct Avail {
    flags: u16,
    idx: u16,
    ring: [u16; NUM],
    unused: u16,
}

impl Avail {
    const fn new() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [0; NUM],
            unused: 0,
        }
    }
}

#[repr(C)]
struct Used {
    flags: u16,
    idx: u16,
    ring: [UsedElem; NUM],
}

impl Used {
    const fn new() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: array![_ => UsedElem::new(); NUM],
        }
    }
}

#[repr(C)]
struct UsedElem {
    id: u32,
    len: u32,
}

impl UsedElem {
    const fn new() -> Self {
        Self { id: 0, len: 0 }
    }
}

/// driver-side state of one in-flight request.
struct Info {
    done: bool,
    status: u8, // written by the device
}

impl Info {
    const fn new() -> Self {
        Self {
            done: false,
            status: 0,
        }
    }
}

#[repr(C)]
struct BlkReq {
    typed: u32,
    reserved: u32,
    sector: u64,
}

impl BlkReq {
    const fn new() -> Self {
        Self {
            typed: 0,
            reserved: 0,
            sector: 0,
        }
    }
}

#[repr(C, align(4096))]
struct PageBoundary {}

/// The queue memory the device sees: descriptors, then avail, then
/// used on the next page boundary, the way the legacy layout wants
/// them. Driver bookkeeping follows.
#[repr(C, align(4096))]
pub struct Disk {
    desc: [Desc; NUM],
    avail: Avail,
    pad1: PageBoundary,
    used: Used,
    pad2: PageBoundary,

    free: [bool; NUM], // is a descriptor free?
    used_idx: u16,     // how far we've consumed the used ring
    info: [Info; NUM],
    ops: [BlkReq; NUM],
}

impl Disk {
    const fn new() -> Self {
        Self {
            desc: array![_ => Desc::new(); NUM],
            avail: Avail::new(),
            pad1: PageBoundary {},
            used: Used::new(),
            pad2: PageBoundary {},
            free: [false; NUM],
            used_idx: 0,
            info: array![_ => Info::new(); NUM],
            ops: array![_ => BlkReq::new(); NUM],
        }
    }

    pub unsafe fn init(&mut self) {
        if read(VIRTIO_MMIO_MAGIC_VALUE) != 0x74726976
            || read(VIRTIO_MMIO_VERSION) != 1
            || read(VIRTIO_MMIO_DEVICE_ID) != 2
            || read(VIRTIO_MMIO_VENDOR_ID) != 0x554d4551
        {
            panic!("could not find virtio disk");
        }

        let mut status: u32 = 0;
        status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
        write(VIRTIO_MMIO_STATUS, status);
        status |= VIRTIO_CONFIG_S_DRIVER;
        write(VIRTIO_MMIO_STATUS, status);

        // negotiate features
        let mut features: u32 = read(VIRTIO_MMIO_DEVICE_FEATURES);
        features &= !(1u32 << VIRTIO_BLK_F_RO);
        features &= !(1u32 << VIRTIO_BLK_F_SCSI);
        features &= !(1u32 << VIRTIO_BLK_F_CONFIG_WCE);
        features &= !(1u32 << VIRTIO_BLK_F_MQ);
        features &= !(1u32 << VIRTIO_F_ANY_LAYOUT);
        features &= !(1u32 << VIRTIO_RING_F_EVENT_IDX);
        features &= !(1u32 << VIRTIO_RING_F_INDIRECT_DESC);
        write(VIRTIO_MMIO_DRIVER_FEATURES, features);

        // tell device that feature negotiation is complete.
        status |= VIRTIO_CONFIG_S_FEATURES_OK;
        write(VIRTIO_MMIO_STATUS, status);

        // tell device we're completely ready.
        status |= VIRTIO_CONFIG_S_DRIVER_OK;
        write(VIRTIO_MMIO_STATUS, status);

        write(VIRTIO_MMIO_GUEST_PAGE_SIZE, PAGESIZE as u32);

        // initialize queue 0.
        write(VIRTIO_MMIO_QUEUE_SEL, 0);
        let max: u32 = read(VIRTIO_MMIO_QUEUE_NUM_MAX);
        if max == 0 {
            panic!("virtio disk has no queue 0");
        } else if max < NUM as u32 {
            panic!("virtio disk max queue too short");
        }
        write(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

        let pfn: usize = (self as *const Disk as usize) >> 12;
        write(VIRTIO_MMIO_QUEUE_PFN, u32::try_from(pfn).unwrap());

        // all NUM descriptors start out unused.
        self.free.iter_mut().for_each(|v| *v = true);
    }

    fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let mut idx = [0; 3];
        for n in 0..3 {
            match self.free.iter().position(|v| *v) {
                Some(i) => {
                    self.free[i] = false;
                    idx[n] = i;
                }
                None => {
                    for taken in idx.iter().take(n) {
                        self.free[*taken] = true;
                    }
                    return None;
                }
            }
        }
        Some(idx)
    }

    fn free_chain(&mut self, mut i: usize) {
        loop {
            if self.free[i] {
                panic!("virtio_disk: freeing free descriptor");
            }
            let next = self.desc[i].next as usize;
            let chained = self.desc[i].flags & VRING_DESC_F_NEXT != 0;
            self.desc[i].addr = 0;
            self.desc[i].len = 0;
            self.desc[i].flags = 0;
            self.desc[i].next = 0;
            self.free[i] = true;
            if !chained {
                break;
            }
            i = next;
        }
    }
}

impl SpinLock<Disk> {
    pub fn read(&self, b: &mut BufGuard<'_>) {
        self.rw(b, false)
    }

    pub fn write(&self, b: &mut BufGuard<'_>) {
        self.rw(b, true)
    }

    fn rw(&self, b: &mut BufGuard<'_>, writing: bool) {
        let sector = b.blockno as u64 * (BSIZE / 512) as u64;

        let mut disk = self.lock();

        // the three descriptors a block request takes; sleep until
        // the interrupt handler frees some.
        let idx = loop {
            match disk.alloc3_desc() {
                Some(idx) => break idx,
                None => {
                    let p = unsafe { CPU_TABLE.my_proc() };
                    disk = p.sleep(Event::DiskDescriptors, disk);
                }
            }
        };

        disk.ops[idx[0]] = BlkReq {
            typed: if writing {
                VIRTIO_BLK_T_OUT
            } else {
                VIRTIO_BLK_T_IN
            },
            reserved: 0,
            sector,
        };

        let req_addr = &disk.ops[idx[0]] as *const BlkReq as usize;
        disk.desc[idx[0]] = Desc {
            addr: req_addr,
            len: core::mem::size_of::<BlkReq>() as u32,
            flags: VRING_DESC_F_NEXT,
            next: idx[1] as u16,
        };

        // the device reads the buffer for a write, fills it for a read.
        let dir = if writing { 0 } else { VRING_DESC_F_WRITE };
        disk.desc[idx[1]] = Desc {
            addr: b.data_ptr_mut() as usize,
            len: BSIZE as u32,
            flags: dir | VRING_DESC_F_NEXT,
            next: idx[2] as u16,
        };

        disk.info[idx[0]].status = 0xff; // device overwrites on success
        let status_addr = &disk.info[idx[0]].status as *const u8 as usize;
        disk.desc[idx[2]] = Desc {
            addr: status_addr,
            len: 1,
            flags: VRING_DESC_F_WRITE,
            next: 0,
        };

        disk.info[idx[0]].done = false;

        // tell the device about this request.
        let slot = disk.avail.idx as usize % NUM;
        disk.avail.ring[slot] = idx[0] as u16;
        fence(Ordering::SeqCst);
        disk.avail.idx = disk.avail.idx.wrapping_add(1);
        fence(Ordering::SeqCst);
        unsafe { write(VIRTIO_MMIO_QUEUE_NOTIFY, 0) };

        // wait for intr() to report completion.
        while !disk.info[idx[0]].done {
            let p = unsafe { CPU_TABLE.my_proc() };
            disk = p.sleep(Event::DiskIo { desc: idx[0] }, disk);
        }

        let status = unsafe { ptr::read_volatile(&disk.info[idx[0]].status) };
        if status != 0 {
            panic!("virtio_disk: request failed, status={}", status);
        }

        disk.free_chain(idx[0]);
        unsafe { PROCESS_TABLE.wakeup(Event::DiskDescriptors) };
        drop(disk);
    }

    /// The disk interrupt handler, called from the trap core.
    pub fn intr(&self) {
        let mut disk = self.lock();

        unsafe {
            write(
                VIRTIO_MMIO_INTERRUPT_ACK,
                read(VIRTIO_MMIO_INTERRUPT_STATUS) & 0x3,
            );
        }
        fence(Ordering::SeqCst);

        // the device adds an entry to the used ring for each finished
        // request.
        while disk.used_idx != unsafe { ptr::read_volatile(&disk.used.idx) } {
            fence(Ordering::SeqCst);
            let id = disk.used.ring[disk.used_idx as usize % NUM].id as usize;

            disk.info[id].done = true;
            unsafe { PROCESS_TABLE.wakeup(Event::DiskIo { desc: id }) };

            disk.used_idx = disk.used_idx.wrapping_add(1);
        }

        drop(disk);
    }
}

#[inline]
unsafe fn read(offset: usize) -> u32 {
    let src = (VIRTIO0 + offset) as *const u32;
    ptr::read_volatile(src)
}

#[inline]
unsafe fn write(offset: usize, v: u32) {
    let dst = (VIRTIO0 + offset) as *mut u32;
    ptr::write_volatile(dst, v);
}

const VIRTIO_MMIO_MAGIC_VALUE: usize = 0x000;
const VIRTIO_MMIO_VERSION: usize = 0x004;
const VIRTIO_MMIO_DEVICE_ID: usize = 0x008; // device type; 1 is net, 2 is disk
const VIRTIO_MMIO_VENDOR_ID: usize = 0x00c;
const VIRTIO_MMIO_DEVICE_FEATURES: usize = 0x010;
const VIRTIO_MMIO_DRIVER_FEATURES: usize = 0x020;
const VIRTIO_MMIO_GUEST_PAGE_SIZE: usize = 0x028; // page size for PFN, write-only
const VIRTIO_MMIO_QUEUE_SEL: usize = 0x030;
const VIRTIO_MMIO_QUEUE_NUM_MAX: usize = 0x034;
const VIRTIO_MMIO_QUEUE_NUM: usize = 0x038;
const VIRTIO_MMIO_QUEUE_PFN: usize = 0x040;
const VIRTIO_MMIO_QUEUE_NOTIFY: usize = 0x050;
const VIRTIO_MMIO_INTERRUPT_STATUS: usize = 0x060;
const VIRTIO_MMIO_INTERRUPT_ACK: usize = 0x064;
const VIRTIO_MMIO_STATUS: usize = 0x070; // read/write

const VIRTIO_CONFIG_S_ACKNOWLEDGE: u32 = 1;
const VIRTIO_CONFIG_S_DRIVER: u32 = 2;
const VIRTIO_CONFIG_S_DRIVER_OK: u32 = 4;
const VIRTIO_CONFIG_S_FEATURES_OK: u32 = 8;

const VIRTIO_BLK_F_RO: u8 = 5;
const VIRTIO_BLK_F_SCSI: u8 = 7;
const VIRTIO_BLK_F_CONFIG_WCE: u8 = 11;
const VIRTIO_BLK_F_MQ: u8 = 12;
const VIRTIO_F_ANY_LAYOUT: u8 = 27;
const VIRTIO_RING_F_INDIRECT_DESC: u8 = 28;
const VIRTIO_RING_F_EVENT_IDX: u8 = 29;

const VRING_DESC_F_NEXT: u16 = 1; // chained with another descriptor
const VRING_DESC_F_WRITE: u16 = 2; // device writes (vs read)

const VIRTIO_BLK_T_IN: u32 = 0; // read the disk
const VIRTIO_BLK_T_OUT: u32 = 1; // write the disk

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn queue_memory_layout() {
        let disk = DISK.lock();
        assert_eq!(0, &disk.desc as *const _ as usize % PAGESIZE);
        assert_eq!(0, &disk.used as *const _ as usize % PAGESIZE);
        assert_eq!(
            PAGESIZE,
            &disk.used as *const _ as usize - &disk.desc as *const _ as usize
        );
        drop(disk);
    }
}
