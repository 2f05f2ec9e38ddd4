//! The opcode processor engine.
//!
//! Owns the register block and the interrupt-side state machine:
//! `Idle -> Running -> (Completed | Stopped | Error) -> Idle`. Interrupt
//! status accumulates by OR under the irq lock until the next start clears
//! it. Completion is delivered through a notifier thread so the registered
//! done callback never runs in interrupt context: the interrupt handler only
//! accumulates status and raises a token on a single-slot queue, and the
//! notifier consumes tokens and invokes the callback. Bursts of interrupts
//! collapse into one token, so the callback fires at most once per
//! accumulated batch.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::error::{PumpError, Result};
use crate::regs::{ProcRegisters, RegisterIo, Status};
use crate::table::OpcodeChain;

/// Callback invoked by the notifier thread after interrupt status arrives.
pub type DoneCallback = Box<dyn Fn() + Send + Sync>;

struct IrqState {
    status: Status,
    running: bool,
}

/// Single-slot handoff between the interrupt handler and the notifier.
struct NotifySlot {
    token: ArrayQueue<()>,
    shutdown: Mutex<bool>,
    cvar: Condvar,
}

impl NotifySlot {
    fn new() -> Self {
        NotifySlot {
            token: ArrayQueue::new(1),
            shutdown: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Raise a notification; a token already pending absorbs this one.
    fn raise(&self) {
        let _ = self.token.push(());
        let _guard = self.shutdown.lock();
        self.cvar.notify_one();
    }

    fn stop(&self) {
        *self.shutdown.lock() = true;
        self.cvar.notify_one();
    }

    /// Block until a token arrives; `false` means shut down. A pending token
    /// is still delivered after shutdown so no completed batch is dropped.
    fn wait(&self) -> bool {
        let mut guard = self.shutdown.lock();
        loop {
            if self.token.pop().is_some() {
                return true;
            }
            if *guard {
                return false;
            }
            self.cvar.wait(&mut guard);
        }
    }
}

/// Driver for one pump opcode processor.
pub struct PumpEngine {
    regs: Arc<dyn RegisterIo>,
    link_mode: u16,
    irq: Mutex<IrqState>,
    slot: Arc<NotifySlot>,
    callback: Arc<Mutex<Option<DoneCallback>>>,
    notifier: Option<JoinHandle<()>>,
}

impl PumpEngine {
    pub fn new(regs: Arc<dyn RegisterIo>, link_mode: u16) -> Self {
        let slot = Arc::new(NotifySlot::new());
        let callback: Arc<Mutex<Option<DoneCallback>>> = Arc::new(Mutex::new(None));
        let notifier = {
            let slot = Arc::clone(&slot);
            let callback = Arc::clone(&callback);
            thread::Builder::new()
                .name("pump-notify".into())
                .spawn(move || {
                    while slot.wait() {
                        trace!("notifier: delivering completion");
                        if let Some(done) = callback.lock().as_ref() {
                            done();
                        }
                    }
                })
                .expect("failed to spawn pump notifier thread")
        };
        PumpEngine {
            regs,
            link_mode,
            irq: Mutex::new(IrqState {
                status: Status::empty(),
                running: false,
            }),
            slot,
            callback,
            notifier: Some(notifier),
        }
    }

    /// Register the completion callback the notifier invokes; typically it
    /// wakes whoever is blocked on the operation.
    pub fn set_done_callback(&self, done: DoneCallback) {
        *self.callback.lock() = Some(done);
    }

    /// Start executing `chain`. Clears accumulated status, points the
    /// program counter at the head table and writes the start word.
    pub fn start(&self, chain: &OpcodeChain) -> Result<()> {
        let head = chain.head_addr().ok_or(PumpError::EmptyChain)?;
        let mut irq = self.irq.lock();
        irq.status = Status::empty();
        irq.running = true;
        let regs = ProcRegisters::new(&*self.regs);
        regs.set_head(head);
        regs.kick(self.link_mode);
        // Read back to post the control write before releasing the lock.
        let _ = regs.ctrl_stat();
        debug!("engine started, head table at {:#x}", head);
        Ok(())
    }

    /// Abort the running operation; idempotent and harmless when idle.
    pub fn stop(&self) {
        let mut irq = self.irq.lock();
        let regs = ProcRegisters::new(&*self.regs);
        regs.halt();
        let _ = regs.ctrl_stat();
        irq.running = false;
        debug!("engine stopped");
    }

    /// Interrupt entry point. Reads the status bits, accumulates them,
    /// acknowledges them in hardware and schedules the notifier. Returns
    /// whether the interrupt belonged to this engine.
    pub fn on_interrupt(&self) -> bool {
        let pending = {
            let mut irq = self.irq.lock();
            let regs = ProcRegisters::new(&*self.regs);
            let word = regs.ctrl_stat();
            let pending = ProcRegisters::status_of(word);
            if pending.is_empty() {
                return false;
            }
            irq.status |= pending;
            if pending.contains(Status::DONE) || pending.is_fault() {
                irq.running = false;
            }
            regs.acknowledge(word);
            pending
        };
        trace!("irq: status {:?}", pending);
        // Wake the notifier outside the irq lock.
        self.slot.raise();
        true
    }

    /// Status accumulated since the last start.
    pub fn status(&self) -> Status {
        self.irq.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.irq.lock().running
    }
}

impl Drop for PumpEngine {
    fn drop(&mut self) {
        self.slot.stop();
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAllocator, MockRegs};
    use crate::regs::{CTRL_START, CTRL_STOP, REG_CTRL_STAT, STAT_SHIFT};
    use crate::table::{OpcodeChain, Segment};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn chain_of_one(alloc: &MockAllocator) -> OpcodeChain {
        let seg = Segment {
            addr: 0x2000,
            len: 0x1000,
        };
        OpcodeChain::build(alloc, &[seg], true, true, 0, 0).unwrap()
    }

    #[test]
    fn start_rejects_empty_chain() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(regs, 0);
        let alloc = MockAllocator::new();
        let chain = OpcodeChain::build(&alloc, &[], false, false, 0, 0).unwrap();
        assert_eq!(engine.start(&chain), Err(PumpError::EmptyChain));
        assert!(!engine.is_running());
        chain.release(&alloc);
    }

    #[test]
    fn start_writes_head_and_start_word() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(Arc::clone(&regs) as Arc<dyn RegisterIo>, 0x013);
        let alloc = MockAllocator::new();
        let chain = chain_of_one(&alloc);
        engine.start(&chain).unwrap();
        assert!(engine.is_running());
        assert_eq!(regs.reg(crate::regs::REG_ADDR_LO) as u64, chain.head_addr().unwrap());
        assert!(regs.reg(REG_CTRL_STAT) & CTRL_START != 0);
        chain.release(&alloc);
    }

    #[test]
    fn stop_is_idempotent() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(Arc::clone(&regs) as Arc<dyn RegisterIo>, 0);
        engine.stop();
        assert!(!engine.is_running());
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(regs.reg(REG_CTRL_STAT), CTRL_STOP);
    }

    #[test]
    fn interrupts_accumulate_status_by_or() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(Arc::clone(&regs) as Arc<dyn RegisterIo>, 0);

        regs.set_reg(REG_CTRL_STAT, Status::FETCH.bits() << STAT_SHIFT);
        assert!(engine.on_interrupt());
        regs.set_reg(REG_CTRL_STAT, Status::DONE.bits() << STAT_SHIFT);
        assert!(engine.on_interrupt());

        assert_eq!(engine.status(), Status::DONE | Status::FETCH);
        // The handler acknowledged the bits in hardware both times.
        assert_eq!(regs.reg(REG_CTRL_STAT) & crate::regs::STAT_MASK, 0);
    }

    #[test]
    fn interrupt_without_status_is_not_ours() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(regs, 0);
        assert!(!engine.on_interrupt());
        assert_eq!(engine.status(), Status::empty());
    }

    #[test]
    fn start_clears_accumulated_status() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(Arc::clone(&regs) as Arc<dyn RegisterIo>, 0);
        regs.set_reg(REG_CTRL_STAT, Status::DONE.bits() << STAT_SHIFT);
        engine.on_interrupt();
        assert_eq!(engine.status(), Status::DONE);

        let alloc = MockAllocator::new();
        let chain = chain_of_one(&alloc);
        engine.start(&chain).unwrap();
        assert_eq!(engine.status(), Status::empty());
        chain.release(&alloc);
    }

    #[test]
    fn notifier_invokes_callback_after_interrupt() {
        let regs = Arc::new(MockRegs::new());
        let engine = PumpEngine::new(Arc::clone(&regs) as Arc<dyn RegisterIo>, 0);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            engine.set_done_callback(Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        regs.set_reg(REG_CTRL_STAT, Status::DONE.bits() << STAT_SHIFT);
        engine.on_interrupt();

        let mut waited = Duration::ZERO;
        while calls.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
