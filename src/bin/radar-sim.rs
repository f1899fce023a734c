use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;

use radar_sim::DmaChannel;
use radar_sim::ExhaustedSlotPolicy;
use radar_sim::SimState;
use radar_sim::Simulator;
use radar_sim::SimulatorConfig;
use radar_sim::SimulatorHardware;
use radar_sim::SimulatorService;
use radar_sim::SubSystem;

#[derive(Parser, Debug)]
#[command(name = "radar-sim")]
#[command(about = "Feeds clutter and moving-target maps into the radar-echo simulator")]
struct Cli {
    /// Clear the moving-target map
    #[arg(long)]
    clear_target: bool,

    /// Clear the clutter map
    #[arg(long)]
    clear_clutter: bool,

    /// Moving-target map file to load
    #[arg(long, value_name = "FILE")]
    load_target_file: Option<PathBuf>,

    /// Clutter map file to load
    #[arg(long, value_name = "FILE")]
    load_clutter_file: Option<PathBuf>,

    /// Revolution of the map files to start from
    #[arg(long, default_value = "0")]
    from_arp: u32,

    /// Start the simulation
    #[arg(short = 'r', long)]
    run: bool,

    /// Discard the current calibration and wait for a fresh one
    #[arg(long)]
    calibrate: bool,

    /// Load the built-in test pattern instead of map files
    #[arg(long)]
    test_signal: bool,

    /// Zero ring slots once a map file is exhausted
    #[arg(long)]
    zero_exhausted: bool,

    /// Seconds between map refreshes
    #[arg(long, default_value = "1")]
    refresh_secs: u64,

    /// Seconds between full status reports
    #[arg(long, default_value = "5")]
    stat_secs: u64,
}

impl Cli {
    fn config(&self) -> SimulatorConfig {
        let mut config = SimulatorConfig::default();
        if let Some(ref path) = self.load_clutter_file {
            config.clutter_path = path.clone();
        }
        if let Some(ref path) = self.load_target_file {
            config.target_path = path.clone();
        }
        if self.zero_exhausted {
            config.exhausted_slots = ExhaustedSlotPolicy::Zero;
        }
        config.refresh_interval = Duration::from_secs(self.refresh_secs.max(1));
        config
    }
}

fn print_full_status(state: &SimState) {
    println!("SIM_EN={}", state.enabled);
    println!("SIM_CAL={}", state.calibrated);
    println!("SIM_MTI={}", state.mti_enabled);
    println!("SIM_NORM={}", state.norm_enabled);
    println!("SIM_ARP_US={}", state.arp_us);
    println!("SIM_ACP_CNT={}", state.acp_count);
    println!("SIM_TRIG_US={}", state.trig_us);
    println!("SIM_CL_LOAD_IDX={}", state.clutter_load_index);
    println!("SIM_MT_LOAD_IDX={}", state.target_load_index);
}

fn print_status(state: &SimState) {
    println!("SIM_ACP_IDX={}/{}", state.sim_acp_idx, state.time_ms);
    println!("SIM_CURR_ACP={}/{}", state.curr_acp_idx, state.time_ms);
}

/// Waits for calibration. Returns `false` if interrupted.
fn calibrate(sim: &mut Simulator<DmaChannel>, signal: &Receiver<()>) -> Result<bool> {
    loop {
        if sim.try_calibrate()?.is_some() {
            return Ok(true);
        }
        match signal.recv_timeout(sim.config().calibration_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return Ok(false),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (signal_tx, signal_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .context("failed to install signal handler")?;

    let config = cli.config();
    let hw = SimulatorHardware::open(&config).context("failed to open simulator hardware")?;
    let mut sim = Simulator::new(config, hw)?;

    // ensure simulator is not running
    sim.disable()?;

    if cli.calibrate {
        sim.recalibrate()?;
    }
    if !calibrate(&mut sim, &signal_rx)? {
        log::info!("interrupted while calibrating");
        sim.reset()?;
        return Ok(());
    }

    if cli.clear_target {
        sim.clear_target_map()?;
    }
    if cli.clear_clutter {
        sim.clear_clutter_map()?;
    }
    if cli.test_signal {
        sim.load_test_signal()?;
    }
    if cli.load_target_file.is_some() {
        sim.load_source(SubSystem::MovingTarget, cli.from_arp)
            .context("failed to load target file")?;
    }
    if cli.load_clutter_file.is_some() {
        sim.load_source(SubSystem::Clutter, cli.from_arp)
            .context("failed to load clutter file")?;
    }
    if cli.run {
        SimulatorService::enable(&mut sim)?;
        println!("EN_SIM");
    }

    let stat_interval = Duration::from_secs(cli.stat_secs);
    let mut last_stat: Option<Instant> = None;
    loop {
        let state = sim.get_state();
        if last_stat.map_or(true, |t| t.elapsed() >= stat_interval) {
            last_stat = Some(Instant::now());
            print_full_status(&state);
        }
        print_status(&state);

        match signal_rx.recv_timeout(Duration::from_secs(1)) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    log::info!("shutting down");
    sim.reset()?;
    Ok(())
}
