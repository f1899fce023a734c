use std::sync::Arc;

use crate::AxiDma;
use crate::BdRing;
use crate::DevMem;
use crate::Error;
use crate::MemoryMap;
use crate::RingHandle;
use crate::SgDescriptor;
use crate::SubSystem;
use crate::SG_DESCRIPTOR_LEN;

/// Static description of an AXI DMA instance in the programmable logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    pub device_id: u32,
    pub base_addr: usize,
    pub reg_size: usize,
    pub has_sg: bool,
    /// Width of the buffer length register in bits.
    pub length_width: u32,
}

impl DmaConfig {
    pub fn max_transfer_len(&self) -> usize {
        (1 << self.length_width) - 1
    }
}

/// DMA instances of the simulator design, clutter first.
pub const DMA_CONFIGS: [DmaConfig; 2] = [
    DmaConfig {
        device_id: 0,
        base_addr: 0x4040_0000,
        reg_size: 0x1_0000,
        has_sg: true,
        length_width: 23,
    },
    DmaConfig {
        device_id: 1,
        base_addr: 0x4041_0000,
        reg_size: 0x1_0000,
        has_sg: true,
        length_width: 23,
    },
];

pub fn lookup_config(device_id: u32) -> Result<&'static DmaConfig, Error> {
    DMA_CONFIGS
        .iter()
        .find(|c| c.device_id == device_id)
        .ok_or(Error::ConfigNotFound(device_id))
}

/// What the simulator needs from a DMA channel: play a set of equally sized
/// blocks over and over, and stop doing so.
pub trait CyclicChannel: Send {
    fn subsystem(&self) -> SubSystem;

    fn is_initialized(&self) -> bool;

    /// Starts cyclic playback of `block_count` blocks of `block_byte_size`
    /// bytes that lie back to back at `phys_base`. A ring that is still live
    /// is recycled first.
    fn start(
        &mut self,
        phys_base: usize,
        block_byte_size: usize,
        block_count: usize,
    ) -> Result<(), Error>;

    /// Resets the engine. The channel is uninitialized afterwards.
    fn stop(&mut self) -> Result<(), Error>;

    /// Brings a stopped channel back to the initialized state.
    fn reinitialize(&mut self) -> Result<(), Error>;
}

#[derive(Debug)]
struct BdSpace {
    mem: Arc<MemoryMap>,
    offset: usize,
    size: usize,
}

/// One cyclic scatter-gather MM2S channel feeding a data class into the
/// simulator core.
#[derive(Debug)]
pub struct DmaChannel {
    subsystem: SubSystem,
    config: DmaConfig,
    dma: AxiDma,
    bd_space: Option<BdSpace>,
    ring: Option<BdRing>,
    live: Option<RingHandle>,
    initialized: bool,
}

impl DmaChannel {
    /// Looks up the device, maps its registers through `dev_mem`, resets it
    /// and selects cyclic scatter-gather operation.
    pub fn initialize(
        subsystem: SubSystem,
        device_id: u32,
        dev_mem: &DevMem,
    ) -> Result<DmaChannel, Error> {
        let config = *lookup_config(device_id)?;
        let regs = dev_mem.map(
            &format!("axi-dma{}", device_id),
            config.base_addr,
            config.reg_size,
        )?;
        let mut dma = AxiDma::new(subsystem, regs);
        dma.reset()?;
        DmaChannel::with_engine(subsystem, config, dma)
    }

    /// Same as [`DmaChannel::initialize`] for an already mapped engine,
    /// without the reset.
    pub fn with_engine(
        subsystem: SubSystem,
        config: DmaConfig,
        dma: AxiDma,
    ) -> Result<DmaChannel, Error> {
        let mut channel = DmaChannel {
            subsystem,
            config,
            dma,
            bd_space: None,
            ring: None,
            live: None,
            initialized: false,
        };
        channel.init_engine()?;
        Ok(channel)
    }

    fn fail(&self, reason: String) -> Error {
        Error::DmaInitFailed {
            subsystem: self.subsystem,
            reason,
        }
    }

    fn init_engine(&mut self) -> Result<(), Error> {
        if !self.config.has_sg || !self.dma.has_sg() {
            return Err(Error::NonScatterGatherDevice(self.config.device_id));
        }
        self.dma.select_cyclic_mode(true).map_err(|e| {
            self.fail(format!(
                "failed to set cyclic mode for {}: {}",
                self.config.device_id, e
            ))
        })?;
        log::debug!(
            "{}_DMA_INIT={}/{:#010x}",
            self.subsystem.tag(),
            self.config.device_id,
            self.config.base_addr
        );
        Ok(())
    }

    /// Sets up the descriptor space in `mem[offset..offset + size]` and
    /// starts the ring. Interrupts are off and coalescing is minimal, nobody
    /// waits on this channel.
    pub fn build_descriptor_space(
        &mut self,
        mem: Arc<MemoryMap>,
        offset: usize,
        size: usize,
    ) -> Result<(), Error> {
        let subsystem = self.subsystem;
        let sg_fail = |reason: String| Error::ScatterGatherInitFailed { subsystem, reason };

        self.dma.disable_irqs();
        self.dma
            .set_coalesce(1, 0)
            .map_err(|e| sg_fail(e.to_string()))?;

        let mut ring = BdRing::create(subsystem, mem.clone(), offset, size)?;

        let mut template_words = [0u32; SG_DESCRIPTOR_LEN / 4];
        let template =
            unsafe { SgDescriptor::from_base_ptr(template_words.as_mut_ptr(), 0) };
        ring.clone_template(&template)?;
        ring.start();

        log::info!(
            "{}_BD_SPACE={:#010x}/{}",
            subsystem.tag(),
            mem.physical_of(offset)?,
            ring.capacity()
        );
        self.ring = Some(ring);
        self.live = None;
        self.bd_space = Some(BdSpace { mem, offset, size });
        self.initialized = true;
        Ok(())
    }

    pub fn ring(&self) -> Option<&BdRing> {
        self.ring.as_ref()
    }

    pub fn live_ring(&self) -> Option<RingHandle> {
        self.live
    }

    /// Builds a closed chain of `max(2, block_count)` descriptors over the
    /// blocks at `phys_base` and hands it to the engine.
    ///
    /// `previous` is drained and returned to the free pool first.
    pub fn start_cyclic_transfer(
        &mut self,
        phys_base: usize,
        block_byte_size: usize,
        block_count: usize,
        previous: Option<RingHandle>,
    ) -> Result<RingHandle, Error> {
        let subsystem = self.subsystem;
        let max_len = self.config.max_transfer_len();
        let fail = |reason: String| Error::DmaInitFailed { subsystem, reason };

        let ring = match self.ring.as_mut() {
            Some(ring) if self.initialized => ring,
            _ => return Err(Error::DmaNotInitialized(subsystem)),
        };

        if let Some(old) = previous {
            log::info!("{}_DMA_INIT_CLEAN_OLD", subsystem.tag());
            let cnt = ring.from_hw(&old);
            log::debug!("{}_DMA_INIT_CLEAN_OLD_CNT={}", subsystem.tag(), cnt);
            ring.free(&old)
                .map_err(|e| fail(format!("unable to clean old BD ring: {}", e)))?;
        }

        if block_count == 0 {
            return Err(fail("no blocks to transfer".to_string()));
        }
        if block_byte_size == 0 || block_byte_size > max_len {
            return Err(fail(format!(
                "block size {} outside of 1..={}",
                block_byte_size, max_len
            )));
        }

        // cyclic mode needs at least two descriptors
        let bd_count = block_count.max(2);
        if bd_count >= ring.capacity() {
            return Err(fail(format!(
                "{} BDs do not fit a ring of {}",
                bd_count,
                ring.capacity()
            )));
        }
        log::info!(
            "{}_DMA_INIT_BLOCK_SIZE={} BD_COUNT={}",
            subsystem.tag(),
            block_byte_size,
            bd_count
        );

        let handle = ring.alloc(bd_count)?;
        let armed = arm_ring(
            ring,
            &mut self.dma,
            &handle,
            phys_base,
            block_byte_size,
            block_count,
        );
        if let Err(e) = armed {
            // the run goes back to the free pool
            if let Err(free_err) = ring.release(&handle) {
                log::error!("{}_DMA_RELEASE_FAILED {}", subsystem.tag(), free_err);
            }
            return Err(e);
        }
        log::info!(
            "{}_DMA_STARTED first_bd={:#010x}",
            subsystem.tag(),
            handle.first_phys()
        );
        self.live = Some(handle);
        Ok(handle)
    }

    /// Resets the engine and forgets the live ring.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.initialized = false;
        self.live = None;
        if let Some(ring) = self.ring.as_mut() {
            ring.reset();
        }
        self.dma.reset()?;
        self.dma.log_status();
        Ok(())
    }
}

/// Fills the descriptors of `handle` with the blocks at `phys_base`, closes
/// the cycle and kicks off the engine.
fn arm_ring(
    ring: &mut BdRing,
    dma: &mut AxiDma,
    handle: &RingHandle,
    phys_base: usize,
    block_byte_size: usize,
    block_count: usize,
) -> Result<(), Error> {
    let subsystem = ring.subsystem();
    let fail = |reason: String| Error::DmaInitFailed { subsystem, reason };
    let length = block_byte_size as u32;
    let bd_count = handle.count();

    for i in 0..bd_count {
        let mut bd = ring.descriptor(handle, i);
        let addr = phys_base + (i % block_count) * block_byte_size;
        if addr % 4 != 0 {
            return Err(fail(format!(
                "set buffer addr {:#010x} on BD {:#010x} failed: unaligned",
                addr,
                bd.phys_addr()
            )));
        }
        bd.clear_status();
        bd.set_sof(i == 0);
        bd.set_eof(false);
        bd.set_buffer_address(addr);
        if !bd.set_buffer_length(length) {
            return Err(fail(format!(
                "set length {} on BD {:#010x} failed",
                length,
                bd.phys_addr()
            )));
        }
        bd.set_id(i as u32);
    }

    // close the cycle
    let mut last = ring.descriptor(handle, bd_count - 1);
    last.set_next_descriptor(handle.first_phys());
    last.set_eof(true);
    ring.dump(handle);

    ring.to_hw(handle)?;
    log::debug!(
        "{}_BD_RING_HW={}/{}",
        subsystem.tag(),
        ring.hw_count(),
        ring.capacity()
    );
    dma.start_sg(handle.first_phys(), ring.phys_after(handle))
}

impl CyclicChannel for DmaChannel {
    fn subsystem(&self) -> SubSystem {
        self.subsystem
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn start(
        &mut self,
        phys_base: usize,
        block_byte_size: usize,
        block_count: usize,
    ) -> Result<(), Error> {
        let previous = self.live.take();
        self.start_cyclic_transfer(phys_base, block_byte_size, block_count, previous)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        DmaChannel::stop(self)
    }

    fn reinitialize(&mut self) -> Result<(), Error> {
        let (mem, offset, size) = match &self.bd_space {
            Some(space) => (space.mem.clone(), space.offset, space.size),
            None => return Err(Error::DmaNotInitialized(self.subsystem)),
        };
        self.init_engine()?;
        self.build_descriptor_space(mem, offset, size)
    }
}
