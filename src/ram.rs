//! Endpoint packet buffer RAM.
//!
//! First-fit allocator over the controller SRAM left after the endpoint
//! command/status list. Every allocation is rounded to the 64 byte buffer
//! granularity of the `AddrOff` field and remembered, so a free has to hand
//! back exactly the region it got.

use alloc::vec::Vec;

use log::trace;

use crate::{
    consts::{BUFFER_ALIGN, NBYTES_MAX, align_up},
    err::*,
};

/// A byte range of endpoint SRAM, offsets relative to the SRAM base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub size: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

pub struct EndpointRam {
    start: usize,
    size: usize,
    free: Vec<Region>,
    used: Vec<Region>,
}

impl EndpointRam {
    /// Largest single buffer the `NBytes` field can describe.
    pub const MAX_ALLOCATION: usize = NBYTES_MAX;

    pub fn new(start: usize, size: usize) -> Self {
        let aligned = align_up(start, BUFFER_ALIGN);
        let size = size.saturating_sub(aligned - start) & !(BUFFER_ALIGN - 1);
        let mut ram = Self {
            start: aligned,
            size,
            free: Vec::new(),
            used: Vec::new(),
        };
        ram.reset();
        ram
    }

    pub fn reset(&mut self) {
        self.used.clear();
        self.free.clear();
        if self.size > 0 {
            self.free.push(Region {
                offset: self.start,
                size: self.size,
            });
        }
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|r| r.size).sum()
    }

    pub fn allocate(&mut self, size: usize) -> Result<Region> {
        if size == 0 || size > Self::MAX_ALLOCATION {
            return Err(UsbdError::RamMallocSize);
        }
        let size = align_up(size, BUFFER_ALIGN);

        let index = self
            .free
            .iter()
            .position(|r| r.size >= size)
            .ok_or(UsbdError::RamMalloc)?;

        let hole = &mut self.free[index];
        let region = Region {
            offset: hole.offset,
            size,
        };
        hole.offset += size;
        hole.size -= size;
        if hole.size == 0 {
            self.free.remove(index);
        }

        let at = self.used.partition_point(|r| r.offset < region.offset);
        self.used.insert(at, region);
        trace!("ram: alloc {:#x}+{}", region.offset, region.size);
        Ok(region)
    }

    pub fn free(&mut self, region: Region) -> Result {
        let index = self
            .used
            .binary_search_by_key(&region.offset, |r| r.offset)
            .map_err(|_| UsbdError::RamFreeAddress)?;
        if self.used[index].size != region.size {
            return Err(UsbdError::RamFreeSize);
        }
        self.used.remove(index);

        let at = self.free.partition_point(|r| r.offset < region.offset);
        self.free.insert(at, region);
        // merge with the following hole, then with the preceding one
        if at + 1 < self.free.len() && self.free[at].end() == self.free[at + 1].offset {
            self.free[at].size += self.free[at + 1].size;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].end() == self.free[at].offset {
            self.free[at - 1].size += self.free[at].size;
            self.free.remove(at);
        }
        trace!("ram: free {:#x}+{}", region.offset, region.size);
        Ok(())
    }
}
