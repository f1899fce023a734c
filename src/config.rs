use std::path::PathBuf;
use std::time::Duration;

use crate::SubSystem;
use crate::CONTROL_REGISTERS_LEN;

/// Placement of descriptors and map blocks in the reserved DRAM region.
///
/// ```text
/// Offset      Content
/// 0x000000    clutter BD space
/// 0x001000    moving-target BD space
/// 0x100000    clutter blocks, followed by moving-target blocks
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub scratch_phys: usize,
    pub scratch_size: usize,
    pub clutter_bd_offset: usize,
    pub target_bd_offset: usize,
    pub bd_space_size: usize,
    pub data_offset: usize,
}

impl Default for MemoryLayout {
    fn default() -> MemoryLayout {
        MemoryLayout {
            scratch_phys: 0x1900_0000,
            scratch_size: 0x0584_8000,
            clutter_bd_offset: 0x0000,
            target_bd_offset: 0x1000,
            bd_space_size: 0x1000,
            data_offset: 0x10_0000,
        }
    }
}

impl MemoryLayout {
    pub fn bd_offset(&self, subsystem: SubSystem) -> usize {
        match subsystem {
            SubSystem::Clutter => self.clutter_bd_offset,
            SubSystem::MovingTarget => self.target_bd_offset,
        }
    }
}

/// What to do with ring slots once a map file has no more blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedSlotPolicy {
    /// Keep whatever was last loaded; output repeats stale revolutions.
    #[default]
    LeaveStale,
    /// Zero free slots; output fades to nothing.
    Zero,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub layout: MemoryLayout,
    pub control_phys: usize,
    pub control_size: usize,
    pub clutter_dma_id: u32,
    pub target_dma_id: u32,
    pub clutter_path: PathBuf,
    pub target_path: PathBuf,
    pub refresh_interval: Duration,
    pub calibration_interval: Duration,
    pub exhausted_slots: ExhaustedSlotPolicy,
}

impl Default for SimulatorConfig {
    fn default() -> SimulatorConfig {
        SimulatorConfig {
            layout: MemoryLayout::default(),
            control_phys: 0x43C0_0000,
            control_size: 0x1000,
            clutter_dma_id: 0,
            target_dma_id: 1,
            clutter_path: PathBuf::from("/var/clutter.bin"),
            target_path: PathBuf::from("/var/targets.bin"),
            refresh_interval: Duration::from_secs(1),
            calibration_interval: Duration::from_secs(1),
            exhausted_slots: ExhaustedSlotPolicy::default(),
        }
    }
}

impl SimulatorConfig {
    pub fn source_path(&self, subsystem: SubSystem) -> &PathBuf {
        match subsystem {
            SubSystem::Clutter => &self.clutter_path,
            SubSystem::MovingTarget => &self.target_path,
        }
    }

    pub fn dma_id(&self, subsystem: SubSystem) -> u32 {
        match subsystem {
            SubSystem::Clutter => self.clutter_dma_id,
            SubSystem::MovingTarget => self.target_dma_id,
        }
    }

    pub fn control_size(&self) -> usize {
        self.control_size.max(CONTROL_REGISTERS_LEN)
    }
}
