use std::io::Read;
use std::sync::Arc;

use crate::Error;
use crate::MemoryMap;
use crate::SubSystem;

/// Fixed ring of revolution blocks in DMA visible memory.
///
/// `load_index` counts the blocks loaded since the last [`reset`], block
/// `from_origin + load_index` of the source is the next one to load and goes
/// to slot `load_index % capacity`. The hardware plays the slots in the same
/// order, so with the hardware at revolution `r` the slots of revolutions
/// `r..load_index` still wait to be played and must not be touched.
///
/// [`reset`]: CircularMapBuffer::reset
#[derive(Debug)]
pub struct CircularMapBuffer {
    subsystem: SubSystem,
    mem: Arc<MemoryMap>,
    offset: usize,
    capacity: usize,
    block_byte_size: usize,
    load_index: u64,
    from_origin: u64,
}

impl CircularMapBuffer {
    pub fn new(
        subsystem: SubSystem,
        mem: Arc<MemoryMap>,
        offset: usize,
        capacity: usize,
        block_byte_size: usize,
    ) -> Result<CircularMapBuffer, Error> {
        assert!(capacity > 0);
        // make sure the whole ring lies inside the map
        mem.ptr_at(offset, capacity * block_byte_size)?;
        log::info!(
            "{}_MEM_PTR={:#010x}/{}",
            subsystem.tag(),
            mem.physical_of(offset)?,
            capacity * block_byte_size / crate::WORD_SIZE
        );
        Ok(CircularMapBuffer {
            subsystem,
            mem,
            offset,
            capacity,
            block_byte_size,
            load_index: 0,
            from_origin: 0,
        })
    }

    pub fn subsystem(&self) -> SubSystem {
        self.subsystem
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_byte_size(&self) -> usize {
        self.block_byte_size
    }

    /// Total size of all slots in bytes.
    pub fn byte_size(&self) -> usize {
        self.capacity * self.block_byte_size
    }

    pub fn physical_base(&self) -> Result<usize, Error> {
        self.mem.physical_of(self.offset)
    }

    pub fn load_index(&self) -> u64 {
        self.load_index
    }

    pub fn from_origin(&self) -> u64 {
        self.from_origin
    }

    /// Absolute source block that is loaded next.
    pub fn next_block(&self) -> u64 {
        self.from_origin + self.load_index
    }

    /// Revolution the hardware is playing, derived from its ACP counter.
    pub fn current_revision(hw_acp_idx: u32, acp_count: u32) -> u64 {
        if acp_count == 0 {
            return 0;
        }
        u64::from(hw_acp_idx / acp_count)
    }

    /// Loaded blocks the hardware has not played yet.
    pub fn queue_size(&self, current_revision: u64) -> u64 {
        self.load_index.saturating_sub(current_revision)
    }

    pub fn has_room(&self, current_revision: u64) -> bool {
        self.queue_size(current_revision) < self.capacity as u64
    }

    pub fn slot_of(&self, index: u64) -> usize {
        (index % self.capacity as u64) as usize
    }

    fn slot_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.capacity);
        self.offset + slot * self.block_byte_size
    }

    pub fn slot_physical(&self, slot: usize) -> Result<usize, Error> {
        self.mem.physical_of(self.slot_offset(slot))
    }

    /// Restarts loading at source block `from_origin`.
    pub fn reset(&mut self, from_origin: u64) {
        self.from_origin = from_origin;
        self.load_index = 0;
    }

    pub(crate) fn advance(&mut self) {
        self.load_index += 1;
    }

    /// Fills `slot` from `input`. Returns the bytes copied, at most one block.
    pub fn load_slot<R: Read>(&self, slot: usize, len: usize, input: &mut R) -> Result<usize, Error> {
        let len = len.min(self.block_byte_size);
        self.mem.load_from(self.slot_offset(slot), len, input)
    }

    pub fn write_slot(&self, slot: usize, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.block_byte_size {
            return Err(Error::OutOfBounds {
                offset: self.slot_offset(slot),
                len: data.len(),
                size: self.block_byte_size,
            });
        }
        self.mem.write_bytes(self.slot_offset(slot), data)
    }

    pub fn read_slot(&self, slot: usize, data: &mut [u8]) -> Result<(), Error> {
        let len = data.len().min(self.block_byte_size);
        self.mem.read_bytes(self.slot_offset(slot), &mut data[..len])
    }

    /// Zeroes `slot` starting at byte `from`.
    pub fn zero_slot(&self, slot: usize, from: usize) -> Result<(), Error> {
        if from >= self.block_byte_size {
            return Ok(());
        }
        self.mem
            .fill(self.slot_offset(slot) + from, self.block_byte_size - from, 0)
    }

    /// Zeroes every slot.
    pub fn clear(&self) -> Result<(), Error> {
        self.mem.fill(self.offset, self.byte_size(), 0)?;
        log::info!("CLR_{}", self.subsystem.tag());
        Ok(())
    }

    /// Sets every word of the trigger bits `trig_bits` in the ACPs
    /// `acps` of each slot. Used to check the signal path without map files.
    pub fn write_test_pattern(
        &self,
        acps: std::ops::Range<usize>,
        trig_bits: std::ops::Range<usize>,
    ) -> Result<(), Error> {
        let acp_bytes = crate::TRIG_WORD_CNT * crate::WORD_SIZE;
        let first_word = trig_bits.start / crate::WORD_BITS;
        let last_word = (trig_bits.end + crate::WORD_BITS - 1) / crate::WORD_BITS;
        let pattern = vec![0xffu8; (last_word - first_word) * crate::WORD_SIZE];
        for slot in 0..self.capacity {
            for acp in acps.clone() {
                let at = acp * acp_bytes + first_word * crate::WORD_SIZE;
                if at + pattern.len() > self.block_byte_size {
                    break;
                }
                self.mem.write_bytes(self.slot_offset(slot) + at, &pattern)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize, block: usize) -> CircularMapBuffer {
        let mem = Arc::new(MemoryMap::anonymous("scratch", 0x1900_0000, 0x1_0000));
        CircularMapBuffer::new(SubSystem::MovingTarget, mem, 0x100, capacity, block).unwrap()
    }

    #[test]
    fn revision_from_acp_index() {
        assert_eq!(CircularMapBuffer::current_revision(0, 4096), 0);
        assert_eq!(CircularMapBuffer::current_revision(4095, 4096), 0);
        assert_eq!(CircularMapBuffer::current_revision(8192, 4096), 2);
        assert_eq!(CircularMapBuffer::current_revision(100, 0), 0);
    }

    #[test]
    fn queue_gate() {
        let mut b = buffer(4, 0x100);
        for _ in 0..4 {
            assert!(b.has_room(0));
            b.advance();
        }
        assert!(!b.has_room(0));
        assert_eq!(b.queue_size(1), 3);
        assert!(b.has_room(1));
        // hardware ahead of software clamps to an empty queue
        assert_eq!(b.queue_size(10), 0);
    }

    #[test]
    fn reset_restarts_at_origin() {
        let mut b = buffer(4, 0x100);
        b.advance();
        b.advance();
        b.reset(5);
        assert_eq!(b.load_index(), 0);
        assert_eq!(b.next_block(), 5);
        assert_eq!(b.slot_physical(b.slot_of(6)).unwrap(), 0x1900_0300);
    }

    #[test]
    fn ring_must_fit_the_map() {
        let mem = Arc::new(MemoryMap::anonymous("scratch", 0, 0x1000));
        assert!(CircularMapBuffer::new(SubSystem::Clutter, mem, 0x800, 2, 0x400).is_err());
    }

    #[test]
    fn test_pattern_sets_trigger_words() {
        let acp_bytes = crate::TRIG_WORD_CNT * crate::WORD_SIZE;
        let b = buffer(1, 4 * acp_bytes);
        b.write_test_pattern(1..2, 3 * crate::MAX_TRIG_BITS / 4..crate::MAX_TRIG_BITS)
            .unwrap();
        let mut block = vec![0u8; 4 * acp_bytes];
        b.read_slot(0, &mut block).unwrap();
        assert!(block[..acp_bytes + 72 * 4].iter().all(|&x| x == 0));
        assert!(block[acp_bytes + 72 * 4..2 * acp_bytes].iter().all(|&x| x == 0xff));
        assert!(block[2 * acp_bytes..].iter().all(|&x| x == 0));
    }
}
