use crate::CyclicChannel;
use crate::Error;
use crate::SimState;
use crate::Simulator;

/// Remote control surface of the simulator.
///
/// Transports (RPC servers, the CLI) program against this trait rather than
/// against [`Simulator`] directly.
pub trait SimulatorService {
    /// Non-blocking, `true` once the simulator is calibrated.
    fn calibrate(&mut self) -> Result<bool, Error>;
    fn enable(&mut self) -> Result<(), Error>;
    fn disable(&mut self) -> Result<(), Error>;
    fn enable_mti(&mut self);
    fn enable_norm(&mut self);
    fn disable_mti(&mut self);
    fn disable_norm(&mut self);
    /// Restarts both maps at revolution `arp_position`.
    fn load_map(&mut self, arp_position: u32) -> Result<(), Error>;
    fn get_state(&self) -> SimState;
    fn reset(&mut self) -> Result<(), Error>;
}

impl<C: CyclicChannel> SimulatorService for Simulator<C> {
    fn calibrate(&mut self) -> Result<bool, Error> {
        Ok(self.try_calibrate()?.is_some())
    }

    fn enable(&mut self) -> Result<(), Error> {
        Simulator::enable(self)
    }

    fn disable(&mut self) -> Result<(), Error> {
        Simulator::disable(self)
    }

    fn enable_mti(&mut self) {
        Simulator::enable_mti(self)
    }

    fn enable_norm(&mut self) {
        Simulator::enable_norm(self)
    }

    fn disable_mti(&mut self) {
        Simulator::disable_mti(self)
    }

    fn disable_norm(&mut self) {
        Simulator::disable_norm(self)
    }

    fn load_map(&mut self, arp_position: u32) -> Result<(), Error> {
        Simulator::load_map(self, arp_position)?;
        Ok(())
    }

    fn get_state(&self) -> SimState {
        self.state_snapshot()
    }

    fn reset(&mut self) -> Result<(), Error> {
        Simulator::reset(self)
    }
}
