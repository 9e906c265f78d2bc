//! Deferred interrupt processing.
//!
//! The hard interrupt handler only records which engine fired ([`IrqWork::raise`]); the status
//! buffer is drained later by whoever runs [`IrqWork::run_pending`], usually the worker thread
//! started with [`IrqWork::spawn_worker`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::MAX_ENGINES;
use crate::gpu::Gpu;
use crate::hw::EngineHw;

#[derive(Debug, Default)]
struct IrqState {
    /// Bit `n` set: engine `n` raised an interrupt that has not been processed yet.
    pending: u64,
    shutdown: bool,
}

#[derive(Debug, Default)]
pub struct IrqWork {
    state: Mutex<IrqState>,
    cv: Condvar,
}

impl IrqWork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IrqState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Marks `engine` as needing service and wakes the worker.
    pub fn raise(&self, engine: usize) {
        if engine >= MAX_ENGINES {
            tracing::warn!(engine, "interrupt from unknown engine ignored");
            return;
        }
        self.lock().pending |= 1 << engine;
        self.cv.notify_one();
    }

    pub fn pending(&self) -> u64 {
        self.lock().pending
    }

    fn take_pending(&self) -> u64 {
        std::mem::take(&mut self.lock().pending)
    }

    /// Runs the bottom half for every engine with a pending interrupt. Returns how many engines
    /// were serviced.
    pub fn run_pending<H: EngineHw>(&self, gpu: &Gpu<H>) -> usize {
        let mut pending = self.take_pending();
        let mut serviced = 0;
        while pending != 0 {
            let engine = pending.trailing_zeros() as usize;
            pending &= pending - 1;
            match gpu.on_interrupt(engine) {
                Ok(report) => {
                    if !report.unexpected.is_empty() {
                        tracing::warn!(
                            engine,
                            unexpected = report.unexpected.len(),
                            "unexpected status entries"
                        );
                    }
                }
                Err(err) => tracing::warn!(engine, %err, "interrupt processing failed"),
            }
            serviced += 1;
        }
        serviced
    }

    /// Services interrupts on a dedicated thread until [`IrqWork::shutdown`].
    pub fn spawn_worker<H>(self: &Arc<Self>, gpu: Arc<Gpu<H>>) -> std::io::Result<JoinHandle<()>>
    where
        H: EngineHw + Send + 'static,
    {
        let work = Arc::clone(self);
        std::thread::Builder::new()
            .name("execlist-irq".into())
            .spawn(move || loop {
                {
                    let guard = work.lock();
                    let guard = match work
                        .cv
                        .wait_while(guard, |s| s.pending == 0 && !s.shutdown)
                    {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if guard.shutdown && guard.pending == 0 {
                        break;
                    }
                }
                work.run_pending(&gpu);
            })
    }

    /// Stops the worker once everything pending has been serviced.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cv.notify_all();
    }
}
