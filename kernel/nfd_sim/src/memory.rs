use alloc::{boxed::Box, collections::BTreeMap};
use nfd_hw::Memory;
use spin::Mutex;

const PAGE_SIZE: u64 = 4096;

/// A sparse byte-addressable memory. Bytes never written read as zero.
#[derive(Default)]
pub struct SparseMemory {
    pages: Mutex<BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>>,
}

impl SparseMemory {
    pub fn new() -> SparseMemory {
        SparseMemory::default()
    }
}

impl Memory for SparseMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let pages = self.pages.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            let a = addr + i as u64;
            *byte = pages
                .get(&(a / PAGE_SIZE))
                .map_or(0, |page| page[(a % PAGE_SIZE) as usize]);
        }
    }

    fn write(&self, addr: u64, data: &[u8]) {
        let mut pages = self.pages.lock();
        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u64;
            let page = pages
                .entry(a / PAGE_SIZE)
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            page[(a % PAGE_SIZE) as usize] = *byte;
        }
    }
}
