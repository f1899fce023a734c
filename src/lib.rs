//! Userspace driver for a Zynq based radar-echo simulator.
//!
//! The FPGA core replays clutter and moving-target returns synchronized to the
//! antenna (ARP/ACP/TRIG). Software keeps the data for the next revolutions in
//! DRAM that the core reads through two cyclic scatter-gather AXI DMA rings,
//! one per data class.

mod axi_dma;
mod bd_ring;
mod calibration;
mod circular_buffer;
mod config;
mod dma_channel;
mod map_file;
mod mem;
mod refresh;
mod registers;
mod scatter_gather;
mod service;
mod simulator;

pub use axi_dma::AxiDma;
pub use bd_ring::BdRing;
pub use bd_ring::RingHandle;
pub use calibration::try_calibrate;
pub use calibration::CalibrationParameters;
pub use circular_buffer::CircularMapBuffer;
pub use config::ExhaustedSlotPolicy;
pub use config::MemoryLayout;
pub use config::SimulatorConfig;
pub use dma_channel::lookup_config;
pub use dma_channel::CyclicChannel;
pub use dma_channel::DmaChannel;
pub use dma_channel::DmaConfig;
pub use map_file::MapHeader;
pub use map_file::MapLoader;
pub use map_file::RefillReport;
pub use map_file::MAP_HEADER_LEN;
pub use mem::DevMem;
pub use mem::MemoryMap;
pub use refresh::RefreshScheduler;
pub use refresh::RefreshSource;
pub use registers::ControlRegisters;
pub use registers::CONTROL_REGISTERS_LEN;
pub use scatter_gather::SgDescriptor;
pub use scatter_gather::SG_DESCRIPTOR_LEN;
pub use service::SimulatorService;
pub use simulator::SimState;
pub use simulator::Simulator;
pub use simulator::SimulatorHardware;
pub use simulator::SimulatorState;

use std::fmt;

/// Bytes per data word written to the FPGA.
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();
/// Bits per data word.
pub const WORD_BITS: usize = 8 * WORD_SIZE;
/// Maximum number of trigger bits emitted per ACP.
pub const MAX_TRIG_BITS: usize = 3072;
/// Words needed to hold the trigger bits of one ACP.
pub const TRIG_WORD_CNT: usize = MAX_TRIG_BITS / WORD_BITS;

/// Number of revolutions kept in memory for the clutter map.
pub const CL_BLK_CNT: usize = 1;
/// Number of revolutions kept in memory for the moving-target map.
pub const MT_BLK_CNT: usize = 4;

/// The two data classes, each with its own DMA channel and ring of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubSystem {
    Clutter,
    MovingTarget,
}

impl SubSystem {
    /// Short tag used as prefix in log lines (`CL`/`MT`).
    pub fn tag(&self) -> &'static str {
        match self {
            SubSystem::Clutter => "CL",
            SubSystem::MovingTarget => "MT",
        }
    }

    /// Number of blocks in the ring of this class.
    pub fn block_count(&self) -> usize {
        match self {
            SubSystem::Clutter => CL_BLK_CNT,
            SubSystem::MovingTarget => MT_BLK_CNT,
        }
    }
}

impl fmt::Display for SubSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubSystem::Clutter => write!(f, "clutter"),
            SubSystem::MovingTarget => write!(f, "moving target"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to open device handle to /dev/mem: {0}")]
    NoDeviceAccess(std::io::Error),
    #[error("mapping memory into virtual address space failed")]
    Mmap,
    #[error("no DMA config found for device {0}")]
    ConfigNotFound(u32),
    #[error("DMA init failed for {subsystem}: {reason}")]
    DmaInitFailed { subsystem: SubSystem, reason: String },
    #[error("DMA device {0} configured as simple mode")]
    NonScatterGatherDevice(u32),
    #[error("scatter gather init failed for {subsystem}: {reason}")]
    ScatterGatherInitFailed { subsystem: SubSystem, reason: String },
    #[error("simulator not calibrated")]
    NotCalibrated,
    #[error("radar signal not calibrated")]
    RadarSignalNotCalibrated,
    #[error("{0} DMA not initialized")]
    DmaNotInitialized(SubSystem),
    #[error("incompatible {subsystem} file: {reason}")]
    IncompatibleFile { subsystem: SubSystem, reason: String },
    #[error("access {offset:#x}+{len:#x} outside of memory region of size {size:#x}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("physical address {0:#x} outside of memory region")]
    AddressOutOfRange(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(radar_sim_has_dmb)]
mod dmb;
#[cfg(radar_sim_has_dmb)]
pub use dmb::dmb;

#[cfg(not(radar_sim_has_dmb))]
#[inline(always)]
pub fn dmb() {
    // DMB is ARM-only, so we only keep the compiler from reordering elsewhere
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}
