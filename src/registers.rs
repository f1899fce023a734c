use std::sync::Arc;

use crate::MemoryMap;

const ENABLED: usize = 0x00;
const MTI_ENABLED: usize = 0x04;
const NORM_ENABLED: usize = 0x08;
const CALIBRATED: usize = 0x0C;
const ARP_US: usize = 0x10;
const ACP_CNT: usize = 0x14;
const TRIG_US: usize = 0x18;
const SIM_ACP_IDX: usize = 0x1C;
const CURR_ACP_IDX: usize = 0x20;
const LOADED_CLUTTER_ACP: usize = 0x24;
const LOADED_TARGET_ACP: usize = 0x28;

/// Size of the register block in bytes.
pub const CONTROL_REGISTERS_LEN: usize = 0x2C;

/// AXI-Lite control and statistics registers of the simulator core.
///
/// Eleven consecutive 32-bit fields without padding. The foreground
/// controller is the only writer, the refresh thread only reads.
#[derive(Debug, Clone)]
pub struct ControlRegisters {
    mem: Arc<MemoryMap>,
}

impl ControlRegisters {
    pub fn new(mem: Arc<MemoryMap>) -> ControlRegisters {
        assert!(mem.size() >= CONTROL_REGISTERS_LEN);
        ControlRegisters { mem }
    }

    fn flag(&self, offset: usize) -> bool {
        self.mem.read_u32(offset) != 0
    }

    fn set_flag(&self, offset: usize, on: bool) {
        self.mem.write_u32(offset, u32::from(on));
    }

    pub fn enabled(&self) -> bool {
        self.flag(ENABLED)
    }

    pub fn set_enabled(&self, on: bool) {
        self.set_flag(ENABLED, on);
    }

    pub fn mti_enabled(&self) -> bool {
        self.flag(MTI_ENABLED)
    }

    pub fn set_mti_enabled(&self, on: bool) {
        self.set_flag(MTI_ENABLED, on);
    }

    pub fn norm_enabled(&self) -> bool {
        self.flag(NORM_ENABLED)
    }

    pub fn set_norm_enabled(&self, on: bool) {
        self.set_flag(NORM_ENABLED, on);
    }

    pub fn calibrated(&self) -> bool {
        self.flag(CALIBRATED)
    }

    pub fn set_calibrated(&self, on: bool) {
        self.set_flag(CALIBRATED, on);
    }

    pub fn arp_us(&self) -> u32 {
        self.mem.read_u32(ARP_US)
    }

    pub fn acp_cnt(&self) -> u32 {
        self.mem.read_u32(ACP_CNT)
    }

    pub fn trig_us(&self) -> u32 {
        self.mem.read_u32(TRIG_US)
    }

    /// ACP index the simulator has played out since it was enabled.
    pub fn sim_acp_idx(&self) -> u32 {
        self.mem.read_u32(SIM_ACP_IDX)
    }

    /// ACP index of the antenna.
    pub fn curr_acp_idx(&self) -> u32 {
        self.mem.read_u32(CURR_ACP_IDX)
    }

    pub fn loaded_clutter_acp(&self) -> u32 {
        self.mem.read_u32(LOADED_CLUTTER_ACP)
    }

    pub fn loaded_target_acp(&self) -> u32 {
        self.mem.read_u32(LOADED_TARGET_ACP)
    }

    /// Raw register write, used by tests and bring-up tools to emulate the
    /// core.
    pub fn poke(&self, index: usize, value: u32) {
        self.mem.write_u32(index * 4, value);
    }

    pub fn dump(&self) {
        log::debug!(
            "CTRL en={} mti={} norm={} cal={} arp_us={} acp_cnt={} trig_us={} sim_acp={} curr_acp={} cl_acp={} mt_acp={}",
            self.enabled(),
            self.mti_enabled(),
            self.norm_enabled(),
            self.calibrated(),
            self.arp_us(),
            self.acp_cnt(),
            self.trig_us(),
            self.sim_acp_idx(),
            self.curr_acp_idx(),
            self.loaded_clutter_acp(),
            self.loaded_target_acp(),
        );
    }
}
