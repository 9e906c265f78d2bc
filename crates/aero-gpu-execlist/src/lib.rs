//! `aero-gpu-execlist` is a GPU command submission scheduler built on execution lists.
//!
//! An engine executes at most [`port::EXECLIST_MAX_PORTS`] contexts at a time, handed over
//! through submit ports. This crate provides:
//! - A per-context circular command ring allocator (see [`Ring`]).
//! - Priority-ordered queueing of requests with preemption decisions (see [`PriorityQueue`]).
//! - The submit port state machine and context status buffer interpretation that together track
//!   what the hardware is running (see [`Execlists`]).
//! - Breadcrumb waiters woken from the hardware completion counter (see [`Breadcrumbs`]).
//! - Device-wide wedging and deferred interrupt processing (see [`Gpu`] and [`IrqWork`]).
//!
//! Register access sits behind [`EngineHw`]; [`sim::SimulatedEngine`] is a software model used
//! by the tests.

#![forbid(unsafe_code)]

mod error;

pub mod breadcrumbs;
pub mod config;
pub mod csb;
pub mod execlists;
pub mod gpu;
pub mod hw;
pub mod irq;
pub mod port;
pub mod priolist;
pub mod request;
pub mod ring;
pub mod sim;
pub mod stats;

pub use breadcrumbs::{Breadcrumbs, Waiter};
pub use config::{ExeclistConfig, GpuConfig, PREEMPT_CONTEXT_ID};
pub use error::{ConfigError, ExeclistError, Result, RingError};
pub use execlists::{ActiveFlags, CsbReport, Execlists};
pub use gpu::Gpu;
pub use hw::{ElspElement, EngineHw};
pub use irq::IrqWork;
pub use priolist::PriorityQueue;
pub use request::{Request, RequestRef, RequestState, Seqno};
pub use ring::Ring;
pub use stats::{EngineStats, EngineStatsSnapshot};
