use std::sync::Arc;

use crate::Error;
use crate::MemoryMap;
use crate::SgDescriptor;
use crate::SubSystem;
use crate::SG_DESCRIPTOR_LEN;

/// A run of descriptors handed out by [`BdRing::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHandle {
    first: usize,
    count: usize,
    first_phys: usize,
}

impl RingHandle {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Physical address of the first descriptor.
    pub fn first_phys(&self) -> usize {
        self.first_phys
    }
}

/// Descriptor space of one DMA channel.
///
/// The space is carved into `SG_DESCRIPTOR_LEN` slots that are linked into a
/// circle when the ring is created. Descriptors move from the free pool to
/// software (`alloc`), to hardware (`to_hw`), back from hardware (`from_hw`)
/// and into the free pool again (`free`), always in ring order.
#[derive(Debug)]
pub struct BdRing {
    subsystem: SubSystem,
    mem: Arc<MemoryMap>,
    offset: usize,
    phys_base: usize,
    len: usize,
    // index of the oldest descriptor not in the free pool
    head: usize,
    free_cnt: usize,
    pre_cnt: usize,
    hw_cnt: usize,
    started: bool,
}

/// Number of descriptors of `alignment` bytes that fit into `size` bytes.
pub fn descriptor_count(alignment: usize, size: usize) -> usize {
    let stride = (SG_DESCRIPTOR_LEN + alignment - 1) / alignment * alignment;
    size / stride
}

impl BdRing {
    /// Creates the ring in `mem[offset..offset + size]` and links all
    /// descriptors circularly.
    pub fn create(
        subsystem: SubSystem,
        mem: Arc<MemoryMap>,
        offset: usize,
        size: usize,
    ) -> Result<BdRing, Error> {
        let fail = |reason: String| Error::ScatterGatherInitFailed { subsystem, reason };

        let phys_base = mem.physical_of(offset).map_err(|e| fail(e.to_string()))?;
        if phys_base % SG_DESCRIPTOR_LEN != 0 {
            return Err(fail(format!(
                "descriptor space {:#010x} not {}-byte aligned",
                phys_base, SG_DESCRIPTOR_LEN
            )));
        }
        let len = descriptor_count(SG_DESCRIPTOR_LEN, size);
        if len < 2 {
            return Err(fail(format!("descriptor space of {} bytes too small", size)));
        }
        mem.ptr_at(offset, len * SG_DESCRIPTOR_LEN)
            .map_err(|e| fail(e.to_string()))?;

        let ring = BdRing {
            subsystem,
            mem,
            offset,
            phys_base,
            len,
            head: 0,
            free_cnt: len,
            pre_cnt: 0,
            hw_cnt: 0,
            started: false,
        };
        for i in 0..len {
            let mut bd = ring.slot(i);
            bd.clear();
            bd.set_next_descriptor(ring.slot_phys(i + 1));
        }
        log::debug!(
            "{}_BD_RING_CREATE={:#010x}/{}",
            subsystem.tag(),
            phys_base,
            len
        );
        Ok(ring)
    }

    fn slot_phys(&self, idx: usize) -> usize {
        self.phys_base + (idx % self.len) * SG_DESCRIPTOR_LEN
    }

    fn slot(&self, idx: usize) -> SgDescriptor {
        let idx = idx % self.len;
        let offset = self.offset + idx * SG_DESCRIPTOR_LEN;
        // checked against the map in create()
        unsafe {
            let base = self.mem.as_ptr().add(offset);
            SgDescriptor::from_base_ptr(base as *mut u32, self.slot_phys(idx))
        }
    }

    pub fn subsystem(&self) -> SubSystem {
        self.subsystem
    }

    /// Total number of descriptors in the space.
    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn free_count(&self) -> usize {
        self.free_cnt
    }

    pub fn hw_count(&self) -> usize {
        self.hw_cnt
    }

    /// Copies `template` into every descriptor while keeping the ring links.
    pub fn clone_template(&mut self, template: &SgDescriptor) -> Result<(), Error> {
        if self.free_cnt != self.len {
            return Err(Error::ScatterGatherInitFailed {
                subsystem: self.subsystem,
                reason: "cannot clone template into a ring in use".to_string(),
            });
        }
        for i in 0..self.len {
            let mut bd = self.slot(i);
            bd.copy_from(template);
            bd.set_next_descriptor(self.slot_phys(i + 1));
        }
        Ok(())
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    /// Takes `count` descriptors from the free pool.
    pub fn alloc(&mut self, count: usize) -> Result<RingHandle, Error> {
        if count == 0 || count > self.free_cnt {
            return Err(Error::DmaInitFailed {
                subsystem: self.subsystem,
                reason: format!(
                    "unable to allocate {} BDs, {} of {} free",
                    count, self.free_cnt, self.len
                ),
            });
        }
        let first = (self.head + self.len - self.free_cnt) % self.len;
        self.free_cnt -= count;
        self.pre_cnt += count;
        Ok(RingHandle {
            first,
            count,
            first_phys: self.slot_phys(first),
        })
    }

    /// The `idx`-th descriptor of `handle`.
    pub fn descriptor(&self, handle: &RingHandle, idx: usize) -> SgDescriptor {
        debug_assert!(idx < handle.count);
        self.slot(handle.first + idx)
    }

    /// Physical address of the slot right after the last descriptor of
    /// `handle`. Not part of the run as long as the run leaves a slot free.
    pub fn phys_after(&self, handle: &RingHandle) -> usize {
        self.slot_phys(handle.first + handle.count)
    }

    /// Marks the descriptors of `handle` as owned by hardware.
    pub fn to_hw(&mut self, handle: &RingHandle) -> Result<(), Error> {
        if !self.started || handle.count > self.pre_cnt {
            return Err(Error::DmaInitFailed {
                subsystem: self.subsystem,
                reason: format!(
                    "unable for HW to process {} BDs at {:#010x}",
                    handle.count, handle.first_phys
                ),
            });
        }
        self.pre_cnt -= handle.count;
        self.hw_cnt += handle.count;
        Ok(())
    }

    /// Takes the descriptors of `handle` back from hardware. Returns how many
    /// were reclaimed.
    pub fn from_hw(&mut self, handle: &RingHandle) -> usize {
        let count = handle.count.min(self.hw_cnt);
        self.hw_cnt -= count;
        self.pre_cnt += count;
        count
    }

    /// Returns the descriptors of `handle` to the free pool and restores the
    /// link of its last descriptor that closed the cycle.
    pub fn free(&mut self, handle: &RingHandle) -> Result<(), Error> {
        if handle.first != self.head || handle.count > self.pre_cnt {
            return Err(Error::DmaInitFailed {
                subsystem: self.subsystem,
                reason: format!(
                    "unable to free {} BDs at {:#010x}",
                    handle.count, handle.first_phys
                ),
            });
        }
        for i in 0..handle.count {
            let mut bd = self.slot(handle.first + i);
            bd.clear();
            bd.set_next_descriptor(self.slot_phys(handle.first + i + 1));
        }
        self.pre_cnt -= handle.count;
        self.free_cnt += handle.count;
        self.head = (self.head + handle.count) % self.len;
        Ok(())
    }

    /// Takes the descriptors of `handle` back from wherever they are and
    /// returns them to the free pool.
    pub fn release(&mut self, handle: &RingHandle) -> Result<(), Error> {
        self.from_hw(handle);
        self.free(handle)
    }

    /// Forgets every allocation, e.g. after the engine was reset.
    pub fn reset(&mut self) {
        self.head = 0;
        self.free_cnt = self.len;
        self.pre_cnt = 0;
        self.hw_cnt = 0;
        self.started = false;
        for i in 0..self.len {
            let mut bd = self.slot(i);
            bd.clear();
            bd.set_next_descriptor(self.slot_phys(i + 1));
        }
    }

    pub fn dump(&self, handle: &RingHandle) {
        if log::log_enabled!(log::Level::Trace) {
            for i in 0..handle.count {
                self.descriptor(handle, i).dump();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(size: usize) -> BdRing {
        let mem = Arc::new(MemoryMap::anonymous("bd", 0x1900_0000, 0x2000));
        BdRing::create(SubSystem::MovingTarget, mem, 0x1000, size).unwrap()
    }

    #[test]
    fn count_at_minimum_alignment() {
        assert_eq!(descriptor_count(64, 0x1000), 64);
        assert_eq!(descriptor_count(64, 127), 1);
        assert_eq!(descriptor_count(128, 0x1000), 32);
    }

    #[test]
    fn create_links_circle() {
        let r = ring(4 * SG_DESCRIPTOR_LEN);
        assert_eq!(r.capacity(), 4);
        let h = RingHandle {
            first: 0,
            count: 4,
            first_phys: 0x1900_1000,
        };
        assert_eq!(r.descriptor(&h, 0).next_descriptor(), 0x1900_1040);
        assert_eq!(r.descriptor(&h, 3).next_descriptor(), 0x1900_1000);
    }

    #[test]
    fn rejects_tiny_space() {
        let mem = Arc::new(MemoryMap::anonymous("bd", 0x1900_0000, 0x1000));
        let err = BdRing::create(SubSystem::Clutter, mem, 0, SG_DESCRIPTOR_LEN).unwrap_err();
        assert!(matches!(
            err,
            Error::ScatterGatherInitFailed {
                subsystem: SubSystem::Clutter,
                ..
            }
        ));
    }

    #[test]
    fn alloc_free_cycle() {
        let mut r = ring(8 * SG_DESCRIPTOR_LEN);
        r.start();
        let a = r.alloc(4).unwrap();
        assert_eq!(a.first_phys(), 0x1900_1000);
        assert_eq!(r.free_count(), 4);
        r.to_hw(&a).unwrap();
        assert_eq!(r.hw_count(), 4);
        assert!(r.alloc(5).is_err());

        assert_eq!(r.from_hw(&a), 4);
        r.free(&a).unwrap();
        assert_eq!(r.free_count(), 8);

        // next allocation continues after the freed run and wraps around
        let b = r.alloc(6).unwrap();
        assert_eq!(b.first_phys(), 0x1900_1100);
        assert_eq!(r.descriptor(&b, 5).phys_addr(), 0x1900_1040);
    }

    #[test]
    fn release_returns_run_in_any_state() {
        let mut r = ring(8 * SG_DESCRIPTOR_LEN);
        r.start();
        let a = r.alloc(3).unwrap();
        r.release(&a).unwrap();
        assert_eq!(r.free_count(), 8);

        let b = r.alloc(3).unwrap();
        r.to_hw(&b).unwrap();
        r.release(&b).unwrap();
        assert_eq!(r.free_count(), 8);
        assert_eq!(r.hw_count(), 0);

        // head moved past both runs
        assert_eq!(r.alloc(2).unwrap().first_phys(), 0x1900_1180);
    }

    #[test]
    fn to_hw_requires_started_ring() {
        let mut r = ring(4 * SG_DESCRIPTOR_LEN);
        let a = r.alloc(2).unwrap();
        assert!(r.to_hw(&a).is_err());
    }
}
