use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;

use crate::CircularMapBuffer;
use crate::ControlRegisters;
use crate::Error;
use crate::ExhaustedSlotPolicy;
use crate::MapLoader;
use crate::RefillReport;
use crate::SubSystem;

/// A data class's ring together with the file it is fed from.
#[derive(Debug, Clone)]
pub struct RefreshSource {
    pub subsystem: SubSystem,
    pub buffer: Arc<Mutex<CircularMapBuffer>>,
    pub path: PathBuf,
    pub policy: ExhaustedSlotPolicy,
}

impl RefreshSource {
    pub fn lock(&self) -> MutexGuard<'_, CircularMapBuffer> {
        // a panicking refill leaves the indexes consistent, keep going
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self) -> Result<MapLoader<File>, Error> {
        let file = File::open(&self.path).map_err(|e| Error::IncompatibleFile {
            subsystem: self.subsystem,
            reason: format!("unable to open {}: {}", self.path.display(), e),
        })?;
        Ok(MapLoader::new(self.subsystem, file, self.policy))
    }

    pub fn refill_with(
        &self,
        loader: &mut MapLoader<File>,
        current_revision: u64,
    ) -> Result<RefillReport, Error> {
        loader.refill(&mut self.lock(), current_revision)
    }

    /// Opens the file anew and tops up the ring.
    pub fn refill(&self, current_revision: u64) -> Result<RefillReport, Error> {
        let mut loader = self.open()?;
        self.refill_with(&mut loader, current_revision)
    }
}

/// Background thread that keeps the rings topped up while the simulator
/// is enabled.
///
/// The thread ends when [`stop`](RefreshScheduler::stop) is called or when it
/// sees the hardware enabled flag cleared.
#[derive(Debug)]
pub struct RefreshScheduler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn start(
        registers: ControlRegisters,
        acp_count: u32,
        sources: Vec<RefreshSource>,
        interval: Duration,
    ) -> Result<RefreshScheduler, Error> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("radar-sim-refresh".to_string())
            .spawn(move || {
                log::debug!("REFRESH_THREAD_STARTED");
                loop {
                    if !registers.enabled() {
                        log::info!("STOP_REFRESH_SIM_DISABLED");
                        break;
                    }
                    refresh_tick(&registers, acp_count, &sources);
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("REFRESH_THREAD_EXITED");
            })?;
        Ok(RefreshScheduler {
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Signals the thread and waits for the running tick to finish.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::info!("STOPPING_REFRESH_THREAD");
            // the thread may already be gone
            let _ = self.stop_tx.try_send(());
            if handle.join().is_err() {
                log::error!("refresh thread panicked");
            }
            log::info!("STOP_REFRESH_THREAD");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn refresh_tick(registers: &ControlRegisters, acp_count: u32, sources: &[RefreshSource]) {
    for source in sources {
        let current = CircularMapBuffer::current_revision(registers.sim_acp_idx(), acp_count);
        if let Err(e) = source.refill(current) {
            log::warn!("REFRESH_{}_FAILED {}", source.subsystem.tag(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MapHeader;
    use crate::MemoryMap;
    use crate::TRIG_WORD_CNT;
    use crate::WORD_SIZE;
    use std::io::Write;
    use std::time::Instant;

    const RECORD: usize = TRIG_WORD_CNT * WORD_SIZE;

    fn temp_map(name: &str, blocks: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "radar-sim-refresh-{}-{}-{}.bin",
            name,
            std::process::id(),
            fastrand::u32(..)
        ));
        let mut f = File::create(&path).unwrap();
        MapHeader {
            arp_us: 1000,
            acp_count: 1,
            trig_us: 50,
            trig_word_size: TRIG_WORD_CNT as u32,
            block_count: blocks,
        }
        .write_to(&mut f)
        .unwrap();
        for i in 0..blocks {
            f.write_all(&vec![i as u8 + 1; RECORD]).unwrap();
        }
        path
    }

    fn source(path: PathBuf, mem: &Arc<MemoryMap>) -> RefreshSource {
        let buffer =
            CircularMapBuffer::new(SubSystem::MovingTarget, mem.clone(), 0, 4, RECORD).unwrap();
        RefreshSource {
            subsystem: SubSystem::MovingTarget,
            buffer: Arc::new(Mutex::new(buffer)),
            path,
            policy: ExhaustedSlotPolicy::LeaveStale,
        }
    }

    fn registers() -> ControlRegisters {
        ControlRegisters::new(Arc::new(MemoryMap::anonymous("ctrl", 0x43c0_0000, 0x100)))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn missing_file_is_incompatible() {
        let mem = Arc::new(MemoryMap::anonymous("scratch", 0, 4 * RECORD));
        let src = source(PathBuf::from("/nonexistent/targets.bin"), &mem);
        assert!(matches!(
            src.refill(0),
            Err(Error::IncompatibleFile {
                subsystem: SubSystem::MovingTarget,
                ..
            })
        ));
    }

    #[test]
    fn follows_hardware_until_stopped() {
        let path = temp_map("follow", 8);
        let mem = Arc::new(MemoryMap::anonymous("scratch", 0, 4 * RECORD));
        let src = source(path.clone(), &mem);
        let regs = registers();
        regs.poke(5, 16);
        regs.set_enabled(true);

        let mut sched = RefreshScheduler::start(
            regs.clone(),
            16,
            vec![src.clone()],
            Duration::from_millis(5),
        )
        .unwrap();
        wait_for(|| src.lock().load_index() == 4);

        // hardware enters revision 2
        regs.poke(7, 2 * 16);
        wait_for(|| src.lock().load_index() == 6);
        assert!(sched.is_running());
        sched.stop();
        assert!(!sched.is_running());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn exits_when_disabled() {
        let path = temp_map("disabled", 8);
        let mem = Arc::new(MemoryMap::anonymous("scratch", 0, 4 * RECORD));
        let src = source(path.clone(), &mem);
        let regs = registers();
        regs.set_enabled(true);

        let sched = RefreshScheduler::start(
            regs.clone(),
            16,
            vec![src.clone()],
            Duration::from_millis(5),
        )
        .unwrap();
        wait_for(|| src.lock().load_index() == 4);
        regs.set_enabled(false);
        wait_for(|| !sched.is_running());
        drop(sched);
        std::fs::remove_file(path).unwrap();
    }
}
