//! The disk block allocator.
//!
//! Free blocks are tracked by an on-disk bitmap, one bit per block,
//! zero meaning free. mkfs pre-sets the bits for the boot block,
//! superblock, log, inode and bitmap blocks themselves. Both alloc
//! and free run inside the caller's log transaction.

use core::ptr;

use crate::{
    bio::{BCACHE, BSIZE},
    error::{KernelError, Result},
    log::LOG,
    superblock::SB,
};

pub const BPB: usize = BSIZE * 8; // bits per bitmap block

/// Allocate a zeroed disk block: find a zero bit, set it under the
/// log, zero the block's contents.
pub fn alloc(dev: u32) -> Result<u32> {
    let size = unsafe { SB.size } as usize;
    for base in (0..size).step_by(BPB) {
        let mut buf = BCACHE.bread(dev, bmap_block(base as u32));
        let buf_data = unsafe { buf.data_ptr_mut().as_mut().unwrap() };

        for offset in 0..BPB {
            if base + offset >= size {
                break;
            }

            let index = offset / 8; // byte within the bitmap block
            let bit = offset % 8;

            if buf_data[index] & (1 << bit) != 0 {
                // block already in use
                continue;
            }

            buf_data[index] |= 1 << bit;

            let blockno: u32 = (base + offset).try_into().unwrap();

            LOG.write(&mut buf);
            drop(buf);
            bzero(dev, blockno);

            return Ok(blockno);
        }
        drop(buf);
    }

    Err(KernelError::OutOfBlocks)
}

/// Free a block by clearing its bitmap bit.
pub fn free(dev: u32, blockno: u32) {
    let mut buf = BCACHE.bread(dev, bmap_block(blockno));
    let bi = blockno as usize % BPB;
    let index = bi / 8;
    let bit = bi % 8;
    let buf_data = unsafe { buf.data_ptr_mut().as_mut().unwrap() };
    if buf_data[index] & (1 << bit) == 0 {
        panic!("bmap: freeing free block");
    }
    buf_data[index] &= !(1 << bit);
    LOG.write(&mut buf);
    drop(buf);
}

// zero a block, through the log like any other write.
#[inline]
fn bzero(dev: u32, blockno: u32) {
    let mut buf = BCACHE.bread(dev, blockno);
    unsafe { ptr::write_bytes(buf.data_ptr_mut(), 0, 1) };
    LOG.write(&mut buf);
    drop(buf);
}

fn bmap_block(blockno: u32) -> u32 {
    blockno / BPB as u32 + unsafe { SB.bmapstart }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_sets_bit_and_zeroes() {
        LOG.begin_op();
        let bn = alloc(1).expect("out of blocks");
        LOG.end_op();

        // the bitmap bit is set...
        let buf = BCACHE.bread(1, bmap_block(bn));
        let byte = unsafe { (&(*buf.data_ptr()))[bn as usize % BPB / 8] };
        assert!(byte & (1 << (bn as usize % 8)) != 0);
        drop(buf);

        // ...and the block content is zeroed.
        let buf = BCACHE.bread(1, bn);
        for i in (0..BSIZE).step_by(512) {
            assert_eq!(0, unsafe { (&(*buf.data_ptr()))[i] });
        }
        drop(buf);

        LOG.begin_op();
        free(1, bn);
        LOG.end_op();

        let buf = BCACHE.bread(1, bmap_block(bn));
        let byte = unsafe { (&(*buf.data_ptr()))[bn as usize % BPB / 8] };
        assert_eq!(0, byte & (1 << (bn as usize % 8)));
        drop(buf);
    }

    #[test_case]
    fn alloc_free_alloc_reuses() {
        LOG.begin_op();
        let b1 = alloc(1).expect("out of blocks");
        free(1, b1);
        let b2 = alloc(1).expect("out of blocks");
        free(1, b2);
        LOG.end_op();

        // the scan is first-fit, so the freed block comes right back.
        assert_eq!(b1, b2);
    }
}
