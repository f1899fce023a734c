use crate::ControlRegisters;
use crate::CL_BLK_CNT;
use crate::MT_BLK_CNT;
use crate::TRIG_WORD_CNT;
use crate::WORD_SIZE;

/// Antenna timing measured by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationParameters {
    pub arp_us: u32,
    pub acp_count: u32,
    pub trig_us: u32,
}

impl CalibrationParameters {
    /// Words needed for one revolution of trigger data.
    pub fn block_word_count(&self) -> usize {
        self.acp_count as usize * TRIG_WORD_CNT
    }

    /// Bytes needed for one revolution of trigger data.
    pub fn block_byte_size(&self) -> usize {
        self.block_word_count() * WORD_SIZE
    }

    pub fn clutter_map_word_size(&self) -> usize {
        CL_BLK_CNT * self.block_word_count()
    }

    pub fn target_map_word_size(&self) -> usize {
        MT_BLK_CNT * self.block_word_count()
    }
}

/// Reads the calibration once, without waiting.
///
/// Returns `None` while the core has not locked onto the antenna signals or
/// reports a zero period or ACP count.
pub fn try_calibrate(regs: &ControlRegisters) -> Option<CalibrationParameters> {
    if !regs.calibrated() {
        log::debug!(
            "CAL_SIM_ARP_US={} CAL_SIM_ACP_CNT={} CAL_SIM_TRIG_US={}",
            regs.arp_us(),
            regs.acp_cnt(),
            regs.trig_us()
        );
        return None;
    }

    let params = CalibrationParameters {
        arp_us: regs.arp_us(),
        acp_count: regs.acp_cnt(),
        trig_us: regs.trig_us(),
    };
    if params.arp_us == 0 || params.acp_count == 0 || params.trig_us == 0 {
        log::warn!("CAL_INVALID {:?}", params);
        return None;
    }

    log::info!("CAL_BLOCK_BYTE_SIZE={}", params.block_byte_size());
    Some(params)
}
