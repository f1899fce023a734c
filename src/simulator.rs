use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::calibration;
use crate::CalibrationParameters;
use crate::CircularMapBuffer;
use crate::ControlRegisters;
use crate::CyclicChannel;
use crate::DevMem;
use crate::DmaChannel;
use crate::Error;
use crate::MemoryMap;
use crate::RefillReport;
use crate::RefreshScheduler;
use crate::RefreshSource;
use crate::SimulatorConfig;
use crate::SubSystem;
use crate::MAX_TRIG_BITS;

/// Lifecycle of a [`Simulator`].
///
/// A freshly constructed simulator is `Calibrating`. `reset` returns to
/// `Ready` once calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Calibrating,
    Ready,
    Enabled,
    Disabled,
}

/// Snapshot of the hardware registers and the software load position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimState {
    pub enabled: bool,
    pub mti_enabled: bool,
    pub norm_enabled: bool,
    pub calibrated: bool,
    pub arp_us: u32,
    pub acp_count: u32,
    pub trig_us: u32,
    pub sim_acp_idx: u32,
    pub curr_acp_idx: u32,
    pub loaded_clutter_acp: u32,
    pub loaded_target_acp: u32,
    pub current_revision: u64,
    pub clutter_load_index: u64,
    pub target_load_index: u64,
    pub from_origin: u64,
    /// Milliseconds since the Unix epoch.
    pub time_ms: u64,
}

/// Everything the simulator drives: the control block, the reserved DRAM
/// and one DMA channel per data class.
#[derive(Debug)]
pub struct SimulatorHardware<C> {
    pub registers: ControlRegisters,
    pub scratch: Arc<MemoryMap>,
    pub clutter_dma: C,
    pub target_dma: C,
}

impl SimulatorHardware<DmaChannel> {
    /// Maps the control registers and the scratch region through `/dev/mem`
    /// and brings up both DMA channels.
    pub fn open(config: &SimulatorConfig) -> Result<SimulatorHardware<DmaChannel>, Error> {
        let dev_mem = DevMem::open()?;
        let layout = &config.layout;

        let ctrl = dev_mem.map("rsim-ctrl", config.control_phys, config.control_size())?;
        let scratch = Arc::new(dev_mem.map(
            "rsim-scratch",
            layout.scratch_phys,
            layout.scratch_size,
        )?);

        let channel = |subsystem: SubSystem| -> Result<DmaChannel, Error> {
            let mut ch = DmaChannel::initialize(subsystem, config.dma_id(subsystem), &dev_mem)?;
            ch.build_descriptor_space(
                scratch.clone(),
                layout.bd_offset(subsystem),
                layout.bd_space_size,
            )?;
            Ok(ch)
        };
        let clutter_dma = channel(SubSystem::Clutter)?;
        let target_dma = channel(SubSystem::MovingTarget)?;

        Ok(SimulatorHardware {
            registers: ControlRegisters::new(Arc::new(ctrl)),
            scratch,
            clutter_dma,
            target_dma,
        })
    }
}

/// The simulator controller.
///
/// Owns both DMA channels and, once calibrated, the two block rings. While
/// enabled a [`RefreshScheduler`] tops up the rings in the background; every
/// transition that touches the channels or the rings stops it first.
pub struct Simulator<C: CyclicChannel> {
    config: SimulatorConfig,
    registers: ControlRegisters,
    scratch: Arc<MemoryMap>,
    clutter_dma: C,
    target_dma: C,
    calibration: Option<CalibrationParameters>,
    clutter: Option<RefreshSource>,
    target: Option<RefreshSource>,
    scheduler: Option<RefreshScheduler>,
    state: SimulatorState,
}

impl<C: CyclicChannel> Simulator<C> {
    pub fn new(config: SimulatorConfig, hw: SimulatorHardware<C>) -> Result<Simulator<C>, Error> {
        let sim = Simulator {
            config,
            registers: hw.registers,
            scratch: hw.scratch,
            clutter_dma: hw.clutter_dma,
            target_dma: hw.target_dma,
            calibration: None,
            clutter: None,
            target: None,
            scheduler: None,
            state: SimulatorState::Calibrating,
        };
        sim.clear_all()?;
        log::info!("STARTED_SIM");
        Ok(sim)
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn registers(&self) -> &ControlRegisters {
        &self.registers
    }

    pub fn state(&self) -> SimulatorState {
        self.state
    }

    pub fn calibration(&self) -> Option<CalibrationParameters> {
        self.calibration
    }

    pub fn channel(&self, subsystem: SubSystem) -> &C {
        match subsystem {
            SubSystem::Clutter => &self.clutter_dma,
            SubSystem::MovingTarget => &self.target_dma,
        }
    }

    fn channel_mut(&mut self, subsystem: SubSystem) -> &mut C {
        match subsystem {
            SubSystem::Clutter => &mut self.clutter_dma,
            SubSystem::MovingTarget => &mut self.target_dma,
        }
    }

    pub fn source(&self, subsystem: SubSystem) -> Option<&RefreshSource> {
        match subsystem {
            SubSystem::Clutter => self.clutter.as_ref(),
            SubSystem::MovingTarget => self.target.as_ref(),
        }
    }

    fn sources(&self) -> Result<(RefreshSource, RefreshSource), Error> {
        match (&self.clutter, &self.target) {
            (Some(cl), Some(mt)) => Ok((cl.clone(), mt.clone())),
            _ => Err(Error::NotCalibrated),
        }
    }

    /// Checks once whether the core has calibrated, without waiting.
    ///
    /// The first successful call lays out the block rings and moves the
    /// simulator to [`SimulatorState::Ready`].
    pub fn try_calibrate(&mut self) -> Result<Option<CalibrationParameters>, Error> {
        if let Some(params) = self.calibration {
            return Ok(Some(params));
        }
        match calibration::try_calibrate(&self.registers) {
            Some(params) => {
                self.prepare(params)?;
                Ok(Some(params))
            }
            None => Ok(None),
        }
    }

    /// Polls [`try_calibrate`](Simulator::try_calibrate) at the configured
    /// interval until it succeeds.
    pub fn wait_calibrated(&mut self) -> Result<CalibrationParameters, Error> {
        loop {
            if let Some(params) = self.try_calibrate()? {
                return Ok(params);
            }
            std::thread::sleep(self.config.calibration_interval);
        }
    }

    fn prepare(&mut self, params: CalibrationParameters) -> Result<(), Error> {
        let block = params.block_byte_size();
        let layout = &self.config.layout;
        log::info!(
            "CAL_SIM_ARP_US={} CAL_SIM_ACP_CNT={} CAL_SIM_TRIG_US={}",
            params.arp_us,
            params.acp_count,
            params.trig_us
        );

        let mut offset = layout.data_offset;
        let mut source = |subsystem: SubSystem| -> Result<RefreshSource, Error> {
            let count = subsystem.block_count();
            let buffer =
                CircularMapBuffer::new(subsystem, self.scratch.clone(), offset, count, block)?;
            offset += count * block;
            Ok(RefreshSource {
                subsystem,
                buffer: Arc::new(Mutex::new(buffer)),
                path: self.config.source_path(subsystem).clone(),
                policy: self.config.exhausted_slots,
            })
        };
        let clutter = source(SubSystem::Clutter)?;
        let target = source(SubSystem::MovingTarget)?;

        for subsystem in [SubSystem::Clutter, SubSystem::MovingTarget] {
            let dma = self.channel_mut(subsystem);
            if !dma.is_initialized() {
                log::info!("{}_DMA_REINIT", subsystem.tag());
                dma.reinitialize()?;
            }
        }

        clutter.lock().clear()?;
        target.lock().clear()?;
        self.clutter = Some(clutter);
        self.target = Some(target);
        self.calibration = Some(params);
        self.state = SimulatorState::Ready;
        log::info!("SIM_READY");
        Ok(())
    }

    /// Forgets the calibration so that a fresh one has to be observed.
    pub fn recalibrate(&mut self) -> Result<(), Error> {
        self.disable()?;
        self.registers.set_calibrated(false);
        self.calibration = None;
        self.clutter = None;
        self.target = None;
        self.state = SimulatorState::Calibrating;
        log::info!("RECALIBRATE");
        Ok(())
    }

    /// Starts both rings and the background refresh. An enabled simulator is
    /// disabled first.
    pub fn enable(&mut self) -> Result<(), Error> {
        if self.state == SimulatorState::Enabled {
            self.disable()?;
        }

        let params = self.calibration.ok_or(Error::NotCalibrated)?;
        if !self.registers.calibrated() {
            return Err(Error::RadarSignalNotCalibrated);
        }
        for subsystem in [SubSystem::Clutter, SubSystem::MovingTarget] {
            if !self.channel(subsystem).is_initialized() {
                log::error!("ERR_{}_DMA_NOT_INITIALIZED", subsystem.tag());
                return Err(Error::DmaNotInitialized(subsystem));
            }
        }

        let (clutter, target) = self.sources()?;
        let mut started = Vec::new();
        for source in [&clutter, &target] {
            if let Err(e) = self.start_channel(source) {
                log::error!("ERR_START_{}_DMA {}", source.subsystem.tag(), e);
                self.halt_channels(&started);
                return Err(e);
            }
            started.push(source.subsystem);
        }

        self.registers.set_enabled(true);
        let scheduler = RefreshScheduler::start(
            self.registers.clone(),
            params.acp_count,
            vec![clutter, target],
            self.config.refresh_interval,
        );
        match scheduler {
            Ok(scheduler) => self.scheduler = Some(scheduler),
            Err(e) => {
                self.registers.set_enabled(false);
                self.halt_channels(&started);
                return Err(e);
            }
        }
        self.state = SimulatorState::Enabled;
        log::info!("ENABLED_SIM");
        Ok(())
    }

    fn start_channel(&mut self, source: &RefreshSource) -> Result<(), Error> {
        let (phys, block, count) = {
            let buffer = source.lock();
            (
                buffer.physical_base()?,
                buffer.block_byte_size(),
                buffer.capacity(),
            )
        };
        self.channel_mut(source.subsystem).start(phys, block, count)
    }

    /// Stops an initialized channel and brings it straight back to the
    /// initialized state.
    fn halt_channel(&mut self, subsystem: SubSystem) -> Result<(), Error> {
        let dma = self.channel_mut(subsystem);
        if !dma.is_initialized() {
            return Ok(());
        }
        dma.stop()?;
        log::info!("STOP_{}_DMA", subsystem.tag());
        dma.reinitialize()
    }

    fn halt_channels(&mut self, subsystems: &[SubSystem]) {
        for &subsystem in subsystems {
            if let Err(e) = self.halt_channel(subsystem) {
                log::error!("ERR_STOP_{}_DMA {}", subsystem.tag(), e);
            }
        }
    }

    /// Waits for the refresh thread to exit, clears the enabled flag and
    /// stops both channels.
    ///
    /// Stopped channels are brought back to the initialized state right away
    /// so that the simulator can be enabled again.
    pub fn disable(&mut self) -> Result<(), Error> {
        // no refill may be in flight while the rings are torn down
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        self.registers.set_enabled(false);
        log::info!("DISABLE_SIM");

        let mut result = Ok(());
        for subsystem in [SubSystem::Clutter, SubSystem::MovingTarget] {
            if let Err(e) = self.halt_channel(subsystem) {
                log::error!("ERR_STOP_{}_DMA {}", subsystem.tag(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        self.state = if self.calibration.is_some() {
            SimulatorState::Disabled
        } else {
            SimulatorState::Calibrating
        };
        log::info!("DISABLED");
        result
    }

    pub fn enable_mti(&mut self) {
        self.registers.set_mti_enabled(true);
        log::info!("MTI_STATUS={}", self.registers.mti_enabled());
    }

    pub fn disable_mti(&mut self) {
        self.registers.set_mti_enabled(false);
        log::info!("MTI_STATUS={}", self.registers.mti_enabled());
    }

    pub fn enable_norm(&mut self) {
        self.registers.set_norm_enabled(true);
        log::info!("NORM_STATUS={}", self.registers.norm_enabled());
    }

    pub fn disable_norm(&mut self) {
        self.registers.set_norm_enabled(false);
        log::info!("NORM_STATUS={}", self.registers.norm_enabled());
    }

    fn current_revision(&self) -> u64 {
        let acp_count = self.calibration.map_or(0, |p| p.acp_count);
        CircularMapBuffer::current_revision(self.registers.sim_acp_idx(), acp_count)
    }

    /// Resets the simulator and loads both map files starting at revolution
    /// `origin`. Returns what was loaded for clutter and moving targets.
    ///
    /// Both files are opened before anything is touched.
    pub fn load_map(&mut self, origin: u32) -> Result<(RefillReport, RefillReport), Error> {
        let (clutter, target) = self.sources()?;
        let mut clutter_file = clutter.open()?;
        let mut target_file = target.open()?;

        self.reset()?;

        let origin = u64::from(origin);
        clutter.lock().reset(origin);
        target.lock().reset(origin);
        log::info!("LOADING_MAPS_FROM_ARP={}", origin);

        let current = self.current_revision();
        let target_report = target.refill_with(&mut target_file, current)?;
        let clutter_report = clutter.refill_with(&mut clutter_file, current)?;
        Ok((clutter_report, target_report))
    }

    /// Loads a single class from its file starting at revolution `origin`,
    /// leaving the other class alone. The simulator must not be enabled.
    pub fn load_source(&mut self, subsystem: SubSystem, origin: u32) -> Result<RefillReport, Error> {
        if self.state == SimulatorState::Enabled {
            self.disable()?;
        }
        let source = self.source(subsystem).cloned().ok_or(Error::NotCalibrated)?;
        let mut file = source.open()?;
        source.lock().reset(u64::from(origin));
        let report = source.refill_with(&mut file, self.current_revision())?;
        log::info!("INIT_{}_FILE", subsystem.tag());
        Ok(report)
    }

    pub fn state_snapshot(&self) -> SimState {
        let params = self.calibration.unwrap_or(CalibrationParameters {
            arp_us: 0,
            acp_count: 0,
            trig_us: 0,
        });
        let load_index = |s: &Option<RefreshSource>| s.as_ref().map_or(0, |s| s.lock().load_index());
        let from_origin = self
            .clutter
            .as_ref()
            .map_or(0, |s| s.lock().from_origin());
        let time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        SimState {
            enabled: self.registers.enabled(),
            mti_enabled: self.registers.mti_enabled(),
            norm_enabled: self.registers.norm_enabled(),
            calibrated: self.registers.calibrated(),
            arp_us: params.arp_us,
            acp_count: params.acp_count,
            trig_us: params.trig_us,
            sim_acp_idx: self.registers.sim_acp_idx(),
            curr_acp_idx: self.registers.curr_acp_idx(),
            loaded_clutter_acp: self.registers.loaded_clutter_acp(),
            loaded_target_acp: self.registers.loaded_target_acp(),
            current_revision: self.current_revision(),
            clutter_load_index: load_index(&self.clutter),
            target_load_index: load_index(&self.target),
            from_origin,
            time_ms,
        }
    }

    /// Disables the simulator and clears both maps.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.disable()?;
        for source in [&self.clutter, &self.target].into_iter().flatten() {
            source.lock().reset(0);
        }
        self.clear_clutter_map()?;
        self.clear_target_map()?;
        if self.calibration.is_some() {
            self.state = SimulatorState::Ready;
        }
        Ok(())
    }

    /// Zeroes the whole data region behind the descriptor spaces.
    pub fn clear_all(&self) -> Result<(), Error> {
        let offset = self.config.layout.data_offset;
        let len = self.scratch.size().saturating_sub(offset);
        self.scratch.fill(offset, len, 0)?;
        log::info!("CLR_ALL");
        Ok(())
    }

    pub fn clear_clutter_map(&self) -> Result<(), Error> {
        match &self.clutter {
            Some(source) => source.lock().clear(),
            None => Ok(()),
        }
    }

    pub fn clear_target_map(&self) -> Result<(), Error> {
        match &self.target {
            Some(source) => source.lock().clear(),
            None => Ok(()),
        }
    }

    /// Fills every block with a fixed pattern: clutter in the first quarter
    /// of the revolution, moving targets in the third, both at the far end of
    /// the trigger window.
    pub fn load_test_signal(&mut self) -> Result<(), Error> {
        if self.state == SimulatorState::Enabled {
            self.disable()?;
        }
        let params = self.calibration.ok_or(Error::NotCalibrated)?;
        let (clutter, target) = self.sources()?;
        let acps = params.acp_count as usize;
        let trig_bits = 3 * MAX_TRIG_BITS / 4..MAX_TRIG_BITS;

        clutter.lock().clear()?;
        clutter
            .lock()
            .write_test_pattern(0..acps / 4, trig_bits.clone())?;
        target.lock().clear()?;
        target
            .lock()
            .write_test_pattern(acps / 2..3 * acps / 4, trig_bits)?;
        log::info!("TEST_SIGNAL_LOADED");
        Ok(())
    }
}

impl<C: CyclicChannel> Drop for Simulator<C> {
    fn drop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
            self.registers.set_enabled(false);
        }
    }
}
