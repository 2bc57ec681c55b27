use crate::error::Error;
use crate::node::{NodeMut, NodeRef, BLOCK_BYTES};
use memmap2::MmapMut;

// Default arena reservation. This is address space, not memory: anonymous
// pages materialize only when a block is first written.
const DEFAULT_RESERVATION: usize = 16 * 1024 * 1024 * 1024;

/// Hands out and reclaims the 4096-byte page-aligned blocks every tree
/// node lives in. Blocks are carved from one anonymous mapping and
/// addressed by number; released blocks are recycled before the high-water
/// mark advances.
pub(crate) struct PageStore {
    mem: MmapMut,
    capacity: usize,   // total blocks the arena can hand out
    high_water: usize, // blocks ever carved from the arena
    free: Vec<u64>,    // released block numbers, reused LIFO
}

impl PageStore {
    pub(crate) fn new() -> Result<PageStore, Error> {
        // Ensure the reservation is a multiple of the memory page size,
        // which is required by mmap.
        let mut bytes = DEFAULT_RESERVATION;
        bytes -= bytes % page_size::get();
        PageStore::with_blocks(bytes / BLOCK_BYTES)
    }

    /// An arena capped at `blocks` blocks. The mapping length is rounded
    /// up to the system page size; blocks themselves stay 4096-byte
    /// aligned for any power-of-two page size.
    pub(crate) fn with_blocks(blocks: usize) -> Result<PageStore, Error> {
        let page = page_size::get();
        let len = (blocks * BLOCK_BYTES).max(page);
        let len = len + (page - len % page) % page;
        let mem = MmapMut::map_anon(len)?;
        Ok(PageStore {
            mem,
            capacity: blocks,
            high_water: 0,
            free: Vec::new(),
        })
    }

    /// Claim a block, recycling released ones first. Fails with
    /// `OutOfMemory` once the arena is spent; the block's content is
    /// whatever its previous owner left there.
    pub(crate) fn allocate(&mut self) -> Result<u64, Error> {
        if let Some(block) = self.free.pop() {
            return Ok(block);
        }
        if self.high_water == self.capacity {
            return Err(Error::OutOfMemory);
        }
        let block = self.high_water as u64;
        self.high_water += 1;
        Ok(block)
    }

    pub(crate) fn release(&mut self, block: u64) {
        debug_assert!((block as usize) < self.high_water);
        self.free.push(block);
    }

    /// Number of blocks currently owned by tree nodes.
    pub(crate) fn in_use(&self) -> usize {
        self.high_water - self.free.len()
    }

    pub(crate) fn node(&self, block: u64) -> NodeRef<'_> {
        let start = block as usize * BLOCK_BYTES;
        NodeRef::new(&self.mem[start..(start + BLOCK_BYTES)])
    }

    pub(crate) fn node_mut(&mut self, block: u64) -> NodeMut<'_> {
        let start = block as usize * BLOCK_BYTES;
        NodeMut::new(&mut self.mem[start..(start + BLOCK_BYTES)])
    }
}
