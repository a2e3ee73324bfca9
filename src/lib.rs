//! A preemptive priority task switcher for single-core microcontrollers.
//!
//! Tasks carry a fixed base priority and an effective priority that may be
//! raised by priority inheritance while they own contended resources. The
//! scheduler is driven by three interrupt sources (tick, preemptive slice,
//! forced switch) that all funnel into one switch core; kernel state is
//! protected by the nestable [`pause_switching`]/[`resume_switching`] gate.
//!
//! All hardware access is behind the [`Port`] trait. A platform port wires
//! its scheduler interrupts to [`scheduler::switch_entry`] and implements
//! context save/restore; everything else is target independent.

#![no_std]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate std;

pub mod error;
pub mod port;
pub mod scheduler;
pub mod synch;
pub mod time;

pub use crate::error::{Error, Result};
pub use crate::port::Port;
pub use crate::scheduler::task::{
	HIGH_PRIO, HIGHEST_PRIO, IDLE_PRIO, LOW_PRIO, LOWEST_PRIO, NORMAL_PRIO, Priority, TaskId,
	Timeout,
};
pub use crate::scheduler::{
	exit, init, is_known_task, join, pause_switching, resume_switching, sleep, spawn, yield_now,
};
pub use crate::synch::event::Event;
pub use crate::synch::mutex::Mutex;
pub use crate::time::get_tick_count;
