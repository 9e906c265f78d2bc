//! A device: the set of engines sharing one wedged state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::config::{ExeclistConfig, GpuConfig};
use crate::error::{ExeclistError, Result};
use crate::execlists::{CsbReport, Execlists};
use crate::hw::EngineHw;
use crate::request::{ContextId, RequestRef, RequestState};

/// Owns one [`Execlists`] per engine, each behind its own lock.
///
/// The interrupt path and submitters take the same engine lock, so the dequeue and status
/// buffer logic never runs concurrently on one engine.
#[derive(Debug)]
pub struct Gpu<H> {
    engines: Vec<Mutex<Execlists<H>>>,
    wedged: AtomicBool,
}

impl<H: EngineHw> Gpu<H> {
    /// Builds a device; `make_hw` provides the hardware for each engine.
    pub fn new(
        cfg: GpuConfig,
        mut make_hw: impl FnMut(usize, &ExeclistConfig) -> H,
    ) -> Result<Self> {
        cfg.validate()?;
        let engines = cfg
            .engines
            .into_iter()
            .enumerate()
            .map(|(id, engine_cfg)| {
                let hw = make_hw(id, &engine_cfg);
                Execlists::new(id, engine_cfg, hw).map(Mutex::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            engines,
            wedged: AtomicBool::new(false),
        })
    }

    pub fn num_engines(&self) -> usize {
        self.engines.len()
    }

    /// Locks engine `id`.
    pub fn engine(&self, id: usize) -> Result<MutexGuard<'_, Execlists<H>>> {
        let engine = self
            .engines
            .get(id)
            .ok_or(ExeclistError::UnknownEngine(id))?;
        Ok(match engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    pub fn create_request(
        &self,
        engine: usize,
        context_id: ContextId,
        priority: i32,
        commands: &[u32],
    ) -> Result<RequestRef> {
        if self.is_wedged() {
            return Err(ExeclistError::DeviceWedged);
        }
        self.engine(engine)?
            .create_request(context_id, priority, commands)
    }

    pub fn submit(&self, engine: usize, rq: RequestRef) -> Result<()> {
        if self.is_wedged() {
            rq.set_state(RequestState::Failed);
            return Err(ExeclistError::DeviceWedged);
        }
        self.engine(engine)?.submit(rq)
    }

    pub fn reprioritize(&self, rq: &RequestRef, priority: i32) -> Result<bool> {
        self.engine(rq.engine())?.reprioritize(rq, priority)
    }

    /// Runs the interrupt bottom half for `engine`.
    pub fn on_interrupt(&self, engine: usize) -> Result<CsbReport> {
        self.engine(engine)?.on_interrupt()
    }

    /// Advances every engine's clock. A hardware fault on any engine wedges the whole device.
    pub fn tick(&self, now_ns: u64) -> Result<()> {
        for id in 0..self.engines.len() {
            let res = self.engine(id)?.tick(now_ns);
            if let Err(err) = res {
                if err.is_fatal() {
                    self.set_wedged();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Declares the device wedged and cancels every request on every engine.
    ///
    /// Returns the number of requests cancelled.
    pub fn set_wedged(&self) -> usize {
        if !self.wedged.swap(true, Ordering::AcqRel) {
            tracing::warn!("device wedged");
        }
        let mut cancelled = 0;
        for id in 0..self.engines.len() {
            if let Ok(mut engine) = self.engine(id) {
                cancelled += engine.cancel_all_requests();
            }
        }
        cancelled
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    /// Resets every engine and clears the wedged state.
    pub fn reset(&self) {
        for id in 0..self.engines.len() {
            if let Ok(mut engine) = self.engine(id) {
                engine.reset();
            }
        }
        self.wedged.store(false, Ordering::Release);
    }

    /// Whether every engine is idle (for power management).
    pub fn is_idle(&self) -> bool {
        (0..self.engines.len()).all(|id| self.engine(id).map_or(true, |e| e.is_idle()))
    }
}
