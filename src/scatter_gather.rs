use std::ptr;

const NXTDESC: usize = 0x0 / 4;
const NXTDESC_MSB: usize = 0x4 / 4;
const BUFFER_ADDRESS: usize = 0x8 / 4;
const BUFFER_ADDRESS_MSB: usize = 0xC / 4;
const CONTROL: usize = 0x18 / 4;
const STATUS: usize = 0x1C / 4;
// first word of the software area that follows the five APP words
const SW_ID: usize = 0x34 / 4;

const LENGTH_MASK: u32 = 0x3ff_ffff;
const CONTROL_EOF: u32 = 1 << 26;
const CONTROL_SOF: u32 = 1 << 27;
const STATUS_COMPLETED: u32 = 1 << 31;

// Descriptors are aligned to 16 words, even though only 8 or 8+5 words are used
pub const SG_DESCRIPTOR_LEN: usize = 16 * 4;
const SG_DESCRIPTOR_WORDS: usize = SG_DESCRIPTOR_LEN / 4;

/// One MM2S buffer descriptor living in DMA visible memory.
#[derive(Debug)]
pub struct SgDescriptor {
    base: *mut u32,
    phys: usize,
}

// Write access to the SgDescriptor requires a mutable reference, so it can even
// be Sync.
unsafe impl Send for SgDescriptor {}
unsafe impl Sync for SgDescriptor {}

impl SgDescriptor {
    /// # Safety
    ///
    /// `base` must point to `SG_DESCRIPTOR_LEN` writable bytes that stay
    /// mapped for the lifetime of the descriptor, and `phys_addr` must be the
    /// address the DMA engine sees for the same bytes.
    pub unsafe fn from_base_ptr(base: *mut u32, phys_addr: usize) -> SgDescriptor {
        SgDescriptor {
            base,
            phys: phys_addr,
        }
    }

    pub fn phys_addr(&self) -> usize {
        self.phys
    }

    // The DMA only writes STATUS. All other words are read back with plain
    // reads, STATUS always volatile so a completion is never optimized away.

    fn word(&self, idx: usize) -> u32 {
        unsafe { ptr::read(self.base.add(idx)) }
    }

    fn set_word(&mut self, idx: usize, value: u32) {
        unsafe { ptr::write(self.base.add(idx), value) }
    }

    fn address(&self, lsb: usize, msb: usize) -> usize {
        let lsbs = self.word(lsb) as usize;
        if cfg!(target_pointer_width = "64") {
            ((self.word(msb) as u64) << 32) as usize | lsbs
        } else {
            lsbs
        }
    }

    fn set_address(&mut self, lsb: usize, msb: usize, addr: usize) {
        self.set_word(lsb, (addr as u64 & 0xffff_ffff) as u32);
        self.set_word(msb, (addr as u64 >> 32) as u32);
    }

    fn set_control_bit(&mut self, bit: u32, on: bool) {
        let ctrl = self.word(CONTROL);
        self.set_word(CONTROL, if on { ctrl | bit } else { ctrl & !bit });
    }

    /// Zeroes all 16 words, including the software area.
    pub fn clear(&mut self) {
        for i in 0..SG_DESCRIPTOR_WORDS {
            self.set_word(i, 0);
        }
    }

    /// Copies the user visible words of `template` into this descriptor.
    pub fn copy_from(&mut self, template: &SgDescriptor) {
        for i in 0..SG_DESCRIPTOR_WORDS {
            let w = template.word(i);
            self.set_word(i, w);
        }
    }

    pub fn next_descriptor(&self) -> usize {
        self.address(NXTDESC, NXTDESC_MSB)
    }

    pub fn set_next_descriptor(&mut self, addr: usize) {
        assert_eq!(addr & 0x3f, 0); // descriptors must be 16-word aligned
        self.set_address(NXTDESC, NXTDESC_MSB, addr);
    }

    pub fn buffer_address(&self) -> usize {
        self.address(BUFFER_ADDRESS, BUFFER_ADDRESS_MSB)
    }

    pub fn set_buffer_address(&mut self, addr: usize) {
        self.set_address(BUFFER_ADDRESS, BUFFER_ADDRESS_MSB, addr);
    }

    pub fn buffer_length(&self) -> u32 {
        self.word(CONTROL) & LENGTH_MASK
    }

    /// Sets the transfer length. Returns `false` if it does not fit the
    /// 26 bit length field.
    pub fn set_buffer_length(&mut self, length: u32) -> bool {
        if length == 0 || length > LENGTH_MASK {
            return false;
        }
        let ctrl = self.word(CONTROL);
        self.set_word(CONTROL, (ctrl & !LENGTH_MASK) | length);
        true
    }

    pub fn eof(&self) -> bool {
        self.word(CONTROL) & CONTROL_EOF != 0
    }

    pub fn set_eof(&mut self, eof: bool) {
        self.set_control_bit(CONTROL_EOF, eof);
    }

    pub fn sof(&self) -> bool {
        self.word(CONTROL) & CONTROL_SOF != 0
    }

    pub fn set_sof(&mut self, sof: bool) {
        self.set_control_bit(CONTROL_SOF, sof);
    }

    pub fn id(&self) -> u32 {
        self.word(SW_ID)
    }

    pub fn set_id(&mut self, id: u32) {
        self.set_word(SW_ID, id);
    }

    pub fn status(&self) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(STATUS)) }
    }

    pub fn transferred_bytes(&self) -> u32 {
        self.status() & LENGTH_MASK
    }

    pub fn completed(&self) -> bool {
        self.status() & STATUS_COMPLETED != 0
    }

    pub fn clear_status(&mut self) {
        self.set_word(STATUS, 0);
    }

    pub fn dump(&self) {
        let ctrl = self.word(CONTROL);
        let status = self.status();
        log::trace!(
            "BD {:#010x}: next={:#010x} buf={:#010x} len={:#x}{}{} id={} status={:#010x}{}",
            self.phys,
            self.next_descriptor(),
            self.buffer_address(),
            ctrl & LENGTH_MASK,
            if self.sof() { " TXSOF" } else { "" },
            if self.eof() { " TXEOF" } else { "" },
            self.id(),
            status,
            if status & STATUS_COMPLETED != 0 { " Cmplt" } else { "" },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(words: &mut [u32; SG_DESCRIPTOR_WORDS]) -> SgDescriptor {
        unsafe { SgDescriptor::from_base_ptr(words.as_mut_ptr(), 0x1900_0040) }
    }

    #[test]
    fn control_bits_keep_length() {
        let mut words = [0u32; SG_DESCRIPTOR_WORDS];
        let mut bd = descriptor(&mut words);
        assert!(bd.set_buffer_length(1_572_864));
        bd.set_sof(true);
        bd.set_eof(true);
        assert_eq!(bd.buffer_length(), 1_572_864);
        bd.set_sof(false);
        assert!(!bd.sof());
        assert!(bd.eof());
        assert_eq!(bd.buffer_length(), 1_572_864);
        assert_eq!(words[CONTROL], CONTROL_EOF | 1_572_864);
    }

    #[test]
    fn rejects_oversized_length() {
        let mut words = [0u32; SG_DESCRIPTOR_WORDS];
        let mut bd = descriptor(&mut words);
        assert!(!bd.set_buffer_length(0x400_0000));
        assert!(!bd.set_buffer_length(0));
        assert_eq!(bd.buffer_length(), 0);
    }

    #[test]
    fn addresses_and_id() {
        let mut words = [0xffff_ffffu32; SG_DESCRIPTOR_WORDS];
        let mut bd = descriptor(&mut words);
        bd.clear();
        bd.set_next_descriptor(0x1900_0080);
        bd.set_buffer_address(0x1910_0000);
        bd.set_id(3);
        assert_eq!(bd.next_descriptor(), 0x1900_0080);
        assert_eq!(bd.buffer_address(), 0x1910_0000);
        assert_eq!(bd.id(), 3);
        assert!(!bd.completed());
        assert_eq!(words[NXTDESC_MSB], 0);
    }
}
