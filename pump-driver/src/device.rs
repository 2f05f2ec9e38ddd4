//! One pump device: configuration plus the operation orchestrator.
//!
//! A transfer runs build -> start -> wait -> release under a per-device
//! lock, so at most one operation owns the pinned pages, the opcode chain
//! and the engine at a time. Whatever happens after the pin succeeds, the
//! chain and the mapping are released before the call returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use pump_core::error::{PumpError, Result};
use pump_core::{CoherentAllocator, OpcodeChain, PumpEngine, RegisterIo, Status};

use crate::mapper::{self, BusMemory, Direction, MemoryRegion};
use crate::stats::{TimingSnapshot, TransferTimers};

/// Default and ceiling for the completion wait.
pub const TIMEOUT_DEFAULT: Duration = Duration::from_secs(10 * 60);
pub const TIMEOUT_MAX: Duration = Duration::from_secs(10 * 60);

/// Default transferable-length limit.
pub const LIMIT_DEFAULT: u64 = u32::MAX as u64;

// AXI access mode bits carried in the opcode mode field.
pub const AXI_CACHE: u16 = 0x3;
pub const AXI_USER: u16 = 1 << 4;
pub const AXI_SPECULATIVE: u16 = 1 << 9;
pub const AXI_SAFE: u16 = 1 << 10;

const XFER_AXI_MODE: u16 = AXI_USER | AXI_CACHE;
const LINK_AXI_MODE: u16 = AXI_USER | AXI_CACHE;

struct Config {
    limit_size: u64,
    timeout: Duration,
}

/// Completion gate the engine's done callback wakes.
struct DoneGate {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl DoneGate {
    fn new() -> Self {
        DoneGate {
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cvar.notify_all();
    }

    /// Block until the engine accumulates any status or the deadline passes.
    /// Returns the accumulated status; empty means timeout.
    fn wait_status(&self, engine: &PumpEngine, timeout: Duration) -> Status {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            let status = engine.status();
            if !status.is_empty() {
                return status;
            }
            if self.cvar.wait_until(&mut guard, deadline).timed_out() {
                return engine.status();
            }
        }
    }
}

/// One pump device instance.
pub struct PumpDevice {
    dir: Direction,
    mem: Arc<dyn BusMemory>,
    alloc: Arc<dyn CoherentAllocator>,
    engine: PumpEngine,
    gate: Arc<DoneGate>,
    op_lock: Mutex<()>,
    config: Mutex<Config>,
    timers: TransferTimers,
}

impl PumpDevice {
    pub fn new(
        dir: Direction,
        regs: Arc<dyn RegisterIo>,
        mem: Arc<dyn BusMemory>,
        alloc: Arc<dyn CoherentAllocator>,
    ) -> Self {
        let engine = PumpEngine::new(regs, LINK_AXI_MODE);
        let gate = Arc::new(DoneGate::new());
        {
            let gate = Arc::clone(&gate);
            engine.set_done_callback(Box::new(move || gate.notify()));
        }
        PumpDevice {
            dir,
            mem,
            alloc,
            engine,
            gate,
            op_lock: Mutex::new(()),
            config: Mutex::new(Config {
                limit_size: LIMIT_DEFAULT,
                timeout: TIMEOUT_DEFAULT,
            }),
            timers: TransferTimers::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn limit_size(&self) -> u64 {
        self.config.lock().limit_size
    }

    /// The limit is at most `u32::MAX`, which the parameter type enforces.
    pub fn set_limit_size(&self, limit: u32) {
        self.config.lock().limit_size = u64::from(limit);
    }

    pub fn timeout(&self) -> Duration {
        self.config.lock().timeout
    }

    /// Values above [`TIMEOUT_MAX`] are clamped to the ceiling.
    pub fn set_timeout(&self, timeout: Duration) {
        self.config.lock().timeout = timeout.min(TIMEOUT_MAX);
    }

    pub fn counters(&self) -> TimingSnapshot {
        self.timers.snapshot()
    }

    pub fn reset_counters(&self) {
        self.timers.reset();
    }

    /// Interrupt-line entry point; forwarded to the engine.
    pub fn on_interrupt(&self) -> bool {
        self.engine.on_interrupt()
    }

    pub fn engine(&self) -> &PumpEngine {
        &self.engine
    }

    /// Transfer from the device into `region`, advancing `pos`.
    ///
    /// A position at or beyond the size limit reads as end of stream: zero
    /// bytes, no pages touched.
    pub fn read(&self, region: MemoryRegion, pos: &mut u64) -> Result<usize> {
        if self.dir != Direction::FromDevice {
            return Err(PumpError::WrongDirection);
        }
        let _op = self.op_lock.lock();
        let limit = self.config.lock().limit_size;
        if *pos >= limit {
            return Ok(0);
        }
        self.transfer_locked(region, pos, limit)
    }

    /// Transfer `region` to the device, advancing `pos`.
    ///
    /// A position at or beyond the size limit reports success without
    /// transferring anything, matching the device's append-past-limit
    /// contract.
    pub fn write(&self, region: MemoryRegion, pos: &mut u64) -> Result<usize> {
        if self.dir != Direction::ToDevice {
            return Err(PumpError::WrongDirection);
        }
        let _op = self.op_lock.lock();
        let limit = self.config.lock().limit_size;
        if *pos >= limit {
            *pos += region.len as u64;
            return Ok(region.len);
        }
        self.transfer_locked(region, pos, limit)
    }

    fn transfer_locked(&self, region: MemoryRegion, pos: &mut u64, limit: u64) -> Result<usize> {
        let timeout = self.config.lock().timeout;
        let first = *pos == 0;
        let (len, last) = if *pos + region.len as u64 >= limit {
            ((limit - *pos) as usize, true)
        } else {
            (region.len, false)
        };
        debug!("transfer: pos {} len {} first {} last {}", pos, len, first, last);

        let setup_started = Instant::now();
        let buffer = mapper::pin_and_map(
            &*self.mem,
            MemoryRegion {
                base: region.base,
                len,
            },
            self.dir,
        )?;
        let chain = match OpcodeChain::build(
            &*self.alloc,
            buffer.segments(),
            first,
            last,
            XFER_AXI_MODE,
            LINK_AXI_MODE,
        ) {
            Ok(chain) => chain,
            Err(err) => {
                let release_started = Instant::now();
                buffer.release(&*self.mem);
                self.timers.add_release(release_started.elapsed());
                return Err(err);
            }
        };
        self.timers.add_setup(setup_started.elapsed());
        chain.debug_dump();

        // Nothing to transfer (zero-length region) never touches hardware.
        let result = if chain.is_empty() {
            Ok(0)
        } else {
            self.run(&chain, timeout, len)
        };

        let release_started = Instant::now();
        chain.release(&*self.alloc);
        buffer.release(&*self.mem);
        self.timers.add_release(release_started.elapsed());

        let transferred = result?;
        *pos += transferred as u64;
        Ok(transferred)
    }

    fn run(&self, chain: &OpcodeChain, timeout: Duration, len: usize) -> Result<usize> {
        let run_started = Instant::now();
        self.engine.start(chain)?;
        let status = self.gate.wait_status(&self.engine, timeout);
        if status.is_empty() {
            warn!("transfer timed out after {:?}", timeout);
            self.engine.stop();
            return Err(PumpError::Timeout);
        }
        self.timers.add_run(run_started.elapsed());
        if status.is_fault() {
            warn!("processor fault: {:?}", status);
            return Err(PumpError::HardwareFault(status));
        }
        Ok(len)
    }
}
