use std::fmt;

use crate::dmb;
use crate::Error;
use crate::MemoryMap;
use crate::SubSystem;

const MM2S_DMACR: usize = 0x0;
const MM2S_DMASR: usize = 0x4;
const MM2S_CURRDESC: usize = 0x8;
const MM2S_CURRDESC_MSB: usize = 0xC;
const MM2S_TAILDESC: usize = 0x10;
const MM2S_TAILDESC_MSB: usize = 0x14;

const DMACR_RS: u32 = 1;
const DMACR_RESET: u32 = 1 << 2;
const DMACR_CYCLIC: u32 = 1 << 4;
const DMACR_IRQ_ALL: u32 = 0x7 << 12;
const DMACR_COALESCE_SHIFT: u32 = 16;
const DMACR_DELAY_SHIFT: u32 = 24;

const DMASR_HALTED: u32 = 1;
const DMASR_IDLE: u32 = 1 << 1;
const DMASR_SG_INCLD: u32 = 1 << 3;
const DMASR_IRQ_ALL: u32 = 0x7 << 12;

// register reads are instantaneous, a reset finishes within a few AXI cycles
const RESET_POLL_LIMIT: usize = 100_000;

/// MM2S half of a Xilinx AXI DMA engine in scatter-gather mode.
pub struct AxiDma {
    subsystem: SubSystem,
    regs: MemoryMap,
}

impl fmt::Debug for AxiDma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AxiDma ({})", &self.subsystem)?;
        write!(f, "  regs: {:?}", &self.regs)
    }
}

impl AxiDma {
    pub fn new(subsystem: SubSystem, regs: MemoryMap) -> AxiDma {
        AxiDma { subsystem, regs }
    }

    fn fail(&self, reason: String) -> Error {
        Error::DmaInitFailed {
            subsystem: self.subsystem,
            reason,
        }
    }

    fn control(&self) -> u32 {
        self.regs.read_u32(MM2S_DMACR)
    }

    fn set_control(&self, value: u32) {
        self.regs.write_u32(MM2S_DMACR, value);
    }

    pub fn status(&self) -> u32 {
        self.regs.read_u32(MM2S_DMASR)
    }

    /// Whether the engine was synthesized with the scatter-gather engine.
    pub fn has_sg(&self) -> bool {
        self.status() & DMASR_SG_INCLD != 0
    }

    pub fn is_halted(&self) -> bool {
        self.status() & DMASR_HALTED != 0
    }

    /// Soft-resets the engine. All register settings are lost afterwards.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.set_control(DMACR_RESET);
        for _ in 0..RESET_POLL_LIMIT {
            if self.control() & DMACR_RESET == 0 {
                // clear irqs
                self.regs.write_u32(MM2S_DMASR, DMASR_IRQ_ALL);
                return Ok(());
            }
            std::hint::spin_loop();
        }
        Err(self.fail(format!(
            "reset did not complete: DMACR {:#010x}",
            self.control()
        )))
    }

    pub fn select_cyclic_mode(&mut self, cyclic: bool) -> Result<(), Error> {
        if !self.is_halted() && self.control() & DMACR_RS != 0 {
            return Err(self.fail("cannot change cyclic mode while running".to_string()));
        }
        let ctrl = self.control();
        let ctrl = if cyclic {
            ctrl | DMACR_CYCLIC
        } else {
            ctrl & !DMACR_CYCLIC
        };
        self.set_control(ctrl);
        if (self.control() & DMACR_CYCLIC != 0) != cyclic {
            return Err(self.fail(format!(
                "failed to set cyclic mode: DMACR {:#010x}",
                self.control()
            )));
        }
        Ok(())
    }

    pub fn disable_irqs(&mut self) {
        let ctrl = self.control();
        self.set_control(ctrl & !DMACR_IRQ_ALL);
    }

    /// Sets the interrupt coalescing threshold and the delay timer.
    pub fn set_coalesce(&mut self, count: u32, delay: u32) -> Result<(), Error> {
        if count == 0 || count > 0xff || delay > 0xff {
            return Err(self.fail(format!(
                "invalid coalesce settings count={} delay={}",
                count, delay
            )));
        }
        let ctrl = self.control() & 0x0000_ffff;
        self.set_control(
            ctrl | (count << DMACR_COALESCE_SHIFT) | (delay << DMACR_DELAY_SHIFT),
        );
        Ok(())
    }

    /// Starts the engine on the descriptor chain at `first`.
    ///
    /// In cyclic mode the engine never idles, `tail` only has to be an
    /// address that is not part of the chain.
    pub fn start_sg(&mut self, first: usize, tail: usize) -> Result<(), Error> {
        // Ensure that the descriptors and buffers have been written to
        dmb();

        let status = self.status();
        if status & DMASR_SG_INCLD == 0 {
            return Err(self.fail("scatter gather is disabled".to_string()));
        }
        self.check_errors(status)?;

        // CURRDESC can only be written with the DMA stopped.
        if status & DMASR_HALTED != 0 || self.control() & DMACR_RS == 0 {
            self.regs
                .write_u32(MM2S_CURRDESC, (first as u64 & 0xffff_ffff) as u32);
            self.regs
                .write_u32(MM2S_CURRDESC_MSB, (first as u64 >> 32) as u32);
        }
        let ctrl = self.control();
        self.set_control(ctrl | DMACR_RS);

        // The MSB is written first, writing the LSB kicks off the fetch.
        self.regs
            .write_u32(MM2S_TAILDESC_MSB, (tail as u64 >> 32) as u32);
        self.regs
            .write_u32(MM2S_TAILDESC, (tail as u64 & 0xffff_ffff) as u32);

        self.check_errors(self.status())
    }

    /// Descriptor the engine is currently working on.
    pub fn current_descriptor(&self) -> usize {
        let lsbs = self.regs.read_u32(MM2S_CURRDESC) as u64;
        let msbs = self.regs.read_u32(MM2S_CURRDESC_MSB) as u64;
        ((msbs << 32) | lsbs) as usize
    }

    fn check_errors(&self, status: u32) -> Result<(), Error> {
        const ERRORS: [(u32, &str); 6] = [
            (1 << 4, "DMA internal error"),
            (1 << 5, "DMA slave error"),
            (1 << 6, "DMA decode error"),
            (1 << 8, "SG internal error"),
            (1 << 9, "SG slave error"),
            (1 << 10, "SG decode error"),
        ];
        for (mask, name) in ERRORS {
            if status & mask != 0 {
                return Err(self.fail(format!("{}: DMASR {:#010x}", name, status)));
            }
        }
        Ok(())
    }

    pub fn log_status(&self) {
        let c = self.control();
        let s = self.status();
        let mut flags = Vec::new();
        flags.push(if c & DMACR_RS != 0 { "running" } else { "stopped" });
        if c & DMACR_RESET != 0 {
            flags.push("resetting");
        }
        if c & DMACR_CYCLIC != 0 {
            flags.push("cyclic");
        }
        flags.push(if s & DMASR_HALTED != 0 { "halted" } else { "active" });
        flags.push(if s & DMASR_IDLE != 0 { "idle" } else { "busy" });
        flags.push(if s & DMASR_SG_INCLD != 0 {
            "scatter gather"
        } else {
            "register mode"
        });
        if let Err(e) = self.check_errors(s) {
            log::debug!("{}_DMA_ERR {}", self.subsystem.tag(), e);
        }
        log::debug!(
            "{}_DMA_STATUS DMACR={:#010x} DMASR={:#010x} CURRDESC={:#010x} {}",
            self.subsystem.tag(),
            c,
            s,
            self.current_descriptor(),
            flags.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dma(status: u32) -> AxiDma {
        let regs = MemoryMap::anonymous("dma", 0x4040_0000, 0x1_0000);
        regs.write_u32(MM2S_DMASR, status);
        AxiDma::new(SubSystem::Clutter, regs)
    }

    #[test]
    fn capability_and_cyclic_mode() {
        let mut dma = dma(DMASR_HALTED | DMASR_SG_INCLD);
        assert!(dma.has_sg());
        dma.select_cyclic_mode(true).unwrap();
        assert_eq!(dma.control() & DMACR_CYCLIC, DMACR_CYCLIC);
        dma.set_coalesce(1, 0).unwrap();
        dma.disable_irqs();
        assert_eq!(dma.control(), DMACR_CYCLIC | (1 << DMACR_COALESCE_SHIFT));
        assert!(dma.set_coalesce(0, 0).is_err());
    }

    #[test]
    fn start_programs_descriptors() {
        let mut dma = dma(DMASR_HALTED | DMASR_SG_INCLD);
        dma.start_sg(0x1900_0000, 0x1900_0080).unwrap();
        assert_eq!(dma.current_descriptor(), 0x1900_0000);
        assert_eq!(dma.regs.read_u32(MM2S_TAILDESC), 0x1900_0080);
        assert_eq!(dma.control() & DMACR_RS, DMACR_RS);
    }

    #[test]
    fn start_reports_errors() {
        let mut dma = dma(DMASR_HALTED | DMASR_SG_INCLD | (1 << 9));
        let err = dma.start_sg(0x1900_0000, 0x1900_0080).unwrap_err();
        assert!(err.to_string().contains("SG slave error"));

        let mut simple = self::dma(DMASR_HALTED);
        assert!(!simple.has_sg());
        assert!(simple.start_sg(0x1900_0000, 0x1900_0080).is_err());
    }

    #[test]
    fn reset_times_out_on_stuck_engine() {
        // plain memory never clears the reset bit
        let mut dma = dma(DMASR_HALTED | DMASR_SG_INCLD);
        assert!(matches!(
            dma.reset(),
            Err(Error::DmaInitFailed {
                subsystem: SubSystem::Clutter,
                ..
            })
        ));
    }
}
