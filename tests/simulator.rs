use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use radar_sim::lookup_config;
use radar_sim::AxiDma;
use radar_sim::CircularMapBuffer;
use radar_sim::ControlRegisters;
use radar_sim::CyclicChannel;
use radar_sim::DmaChannel;
use radar_sim::Error;
use radar_sim::MapHeader;
use radar_sim::MemoryLayout;
use radar_sim::MemoryMap;
use radar_sim::Simulator;
use radar_sim::SimulatorConfig;
use radar_sim::SimulatorHardware;
use radar_sim::SimulatorService;
use radar_sim::SubSystem;
use radar_sim::TRIG_WORD_CNT;
use radar_sim::WORD_SIZE;

const ACPS: u32 = 32;
const BLOCK: usize = ACPS as usize * TRIG_WORD_CNT * WORD_SIZE;

#[derive(Debug)]
struct Channel {
    subsystem: SubSystem,
    initialized: bool,
    running: bool,
}

impl Channel {
    fn new(subsystem: SubSystem) -> Channel {
        Channel {
            subsystem,
            initialized: true,
            running: false,
        }
    }
}

impl CyclicChannel for Channel {
    fn subsystem(&self) -> SubSystem {
        self.subsystem
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn start(&mut self, _phys: usize, _block: usize, _count: usize) -> Result<(), Error> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.running = false;
        self.initialized = false;
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<(), Error> {
        self.initialized = true;
        Ok(())
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "radar-sim-it-{}-{}-{}.bin",
        name,
        std::process::id(),
        fastrand::u32(..)
    ))
}

fn write_map(path: &PathBuf, blocks: &[Vec<u8>]) {
    let mut f = std::fs::File::create(path).unwrap();
    MapHeader {
        arp_us: 100_000,
        acp_count: ACPS,
        trig_us: 50,
        trig_word_size: TRIG_WORD_CNT as u32,
        block_count: blocks.len() as u32,
    }
    .write_to(&mut f)
    .unwrap();
    for b in blocks {
        f.write_all(b).unwrap();
    }
}

fn filler() -> Vec<u8> {
    (0..BLOCK).map(|_| fastrand::u8(..)).collect()
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(5));
    }
}

struct Rig {
    sim: Simulator<Channel>,
    clutter: Vec<Vec<u8>>,
    targets: Vec<Vec<u8>>,
}

impl Rig {
    fn new(blocks: usize) -> Rig {
        let config = SimulatorConfig {
            layout: MemoryLayout {
                scratch_size: 0x10_0000 + 5 * BLOCK,
                ..MemoryLayout::default()
            },
            clutter_path: temp_path("clutter"),
            target_path: temp_path("targets"),
            refresh_interval: Duration::from_millis(5),
            ..SimulatorConfig::default()
        };
        let clutter: Vec<_> = (0..blocks).map(|_| filler()).collect();
        let targets: Vec<_> = (0..blocks).map(|_| filler()).collect();
        write_map(&config.clutter_path, &clutter);
        write_map(&config.target_path, &targets);

        let regs = ControlRegisters::new(Arc::new(MemoryMap::anonymous(
            "ctrl",
            config.control_phys,
            0x100,
        )));
        regs.poke(4, 100_000);
        regs.poke(5, ACPS);
        regs.poke(6, 50);
        regs.set_calibrated(true);

        let hw = SimulatorHardware {
            registers: regs,
            scratch: Arc::new(MemoryMap::anonymous(
                "scratch",
                config.layout.scratch_phys,
                config.layout.scratch_size,
            )),
            clutter_dma: Channel::new(SubSystem::Clutter),
            target_dma: Channel::new(SubSystem::MovingTarget),
        };
        Rig {
            sim: Simulator::new(config, hw).unwrap(),
            clutter,
            targets,
        }
    }

    fn slot(&self, subsystem: SubSystem, slot: usize) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK];
        self.sim
            .source(subsystem)
            .unwrap()
            .lock()
            .read_slot(slot, &mut data)
            .unwrap();
        data
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sim.config().clutter_path);
        let _ = std::fs::remove_file(&self.sim.config().target_path);
    }
}

#[test]
fn service_session() {
    let mut rig = Rig::new(12);
    let service: &mut dyn SimulatorService = &mut rig.sim;

    assert!(service.calibrate().unwrap());
    service.load_map(5).unwrap();
    service.enable().unwrap();
    service.enable_mti();

    let state = service.get_state();
    assert!(state.enabled);
    assert!(state.mti_enabled);
    assert_eq!(state.from_origin, 5);
    assert_eq!(state.target_load_index, 4);

    // the core plays two revolutions
    rig.sim.registers().poke(7, 2 * ACPS);
    wait_for(|| {
        let state = rig.sim.state_snapshot();
        state.target_load_index == 6 && state.clutter_load_index == 3
    });
    assert_eq!(rig.slot(SubSystem::MovingTarget, 0), rig.targets[9]);
    assert_eq!(rig.slot(SubSystem::MovingTarget, 1), rig.targets[10]);
    assert_eq!(rig.slot(SubSystem::MovingTarget, 2), rig.targets[7]);
    assert_eq!(rig.slot(SubSystem::Clutter, 0), rig.clutter[7]);

    let service: &mut dyn SimulatorService = &mut rig.sim;
    service.disable().unwrap();
    assert!(!service.get_state().enabled);
    assert!(rig.sim.channel(SubSystem::Clutter).is_initialized());
    assert!(!rig.sim.channel(SubSystem::Clutter).running);

    let service: &mut dyn SimulatorService = &mut rig.sim;
    service.reset().unwrap();
    let state = service.get_state();
    assert_eq!(state.from_origin, 0);
    assert_eq!(state.target_load_index, 0);
    assert!(rig.slot(SubSystem::MovingTarget, 0).iter().all(|&b| b == 0));
}

#[test]
fn hardware_stall_keeps_queue_full() {
    let mut rig = Rig::new(12);
    rig.sim.try_calibrate().unwrap();
    rig.sim.load_map(0).unwrap();
    rig.sim.enable().unwrap();

    // without the core advancing nothing may be overwritten
    std::thread::sleep(Duration::from_millis(50));
    let state = rig.sim.state_snapshot();
    assert_eq!(state.target_load_index, 4);
    assert_eq!(state.clutter_load_index, 1);
    for slot in 0..4 {
        assert_eq!(rig.slot(SubSystem::MovingTarget, slot), rig.targets[slot]);
    }
    rig.sim.disable().unwrap();
}

#[test]
fn descriptor_ring_covers_map_slots() {
    let layout = MemoryLayout::default();
    let scratch = Arc::new(MemoryMap::anonymous(
        "scratch",
        layout.scratch_phys,
        layout.data_offset + 4 * BLOCK,
    ));
    let buffer = CircularMapBuffer::new(
        SubSystem::MovingTarget,
        scratch.clone(),
        layout.data_offset,
        4,
        BLOCK,
    )
    .unwrap();

    let regs = MemoryMap::anonymous("axi-dma1", 0x4041_0000, 0x100);
    // halted, scatter-gather included
    regs.write_u32(0x4, 0x9);
    let config = *lookup_config(1).unwrap();
    let mut channel =
        DmaChannel::with_engine(SubSystem::MovingTarget, config, AxiDma::new(SubSystem::MovingTarget, regs))
            .unwrap();
    channel
        .build_descriptor_space(
            scratch.clone(),
            layout.bd_offset(SubSystem::MovingTarget),
            layout.bd_space_size,
        )
        .unwrap();
    assert!(channel.is_initialized());

    channel
        .start(buffer.physical_base().unwrap(), BLOCK, buffer.capacity())
        .unwrap();
    let handle = channel.live_ring().unwrap();
    let ring = channel.ring().unwrap();
    assert_eq!(handle.count(), 4);
    for slot in 0..4 {
        let bd = ring.descriptor(&handle, slot);
        assert_eq!(bd.buffer_address(), buffer.slot_physical(slot).unwrap());
        let bd_offset = scratch.offset_of(bd.phys_addr()).unwrap();
        assert!(bd_offset >= layout.target_bd_offset);
        assert!(bd_offset < layout.target_bd_offset + layout.bd_space_size);
    }
    assert_eq!(
        ring.descriptor(&handle, 3).next_descriptor(),
        handle.first_phys()
    );

    // restarting recycles the live ring
    let free = ring.free_count();
    channel
        .start(buffer.physical_base().unwrap(), BLOCK, buffer.capacity())
        .unwrap();
    assert_eq!(channel.ring().unwrap().free_count(), free);
}
