//! Interface the kernel requires from a platform port.
//!
//! A port owns every piece of hardware the switcher touches: the global
//! interrupt flag, the three scheduler interrupt sources (tick, preemptive
//! slice, forced switch), the context save/restore code, and the low-power
//! idle instruction. The kernel itself never executes a privileged
//! instruction.
//!
//! # Port obligations
//!
//! * The three scheduler ISRs save the outgoing context, call
//!   [`switch_entry`] with the matching [`SwitchSource`] and the address of
//!   the last saved byte, and restore the context named by the returned
//!   stack pointer. If the returned pointer equals the passed one, the
//!   outgoing and incoming task are identical and the call-saved registers
//!   do not have to be restored (partial-switch fast path).
//! * [`Port::switch`] performs the same save/call/restore sequence from task
//!   context for the `Yielded` and `TerminatingTask` sources. These entries
//!   must work while the scheduler IRQs are masked; the pause gate only
//!   suppresses interrupt-driven switches.
//! * The switch core runs on a dedicated switcher stack. A terminating
//!   task's stack is released while the core runs, so the core must not
//!   execute on the outgoing task's stack.
//! * The kernel serializes its internal state with a spin lock. That lock
//!   is only ever taken with scheduler IRQs masked or the global interrupt
//!   flag cleared, so a port must not call back into the kernel from an ISR
//!   other than through [`switch_entry`] (and only for an unmasked scheduler
//!   IRQ) or [`Port::trigger_forced_switch`].
//!
//! [`switch_entry`]: crate::scheduler::switch_entry
//! [`SwitchSource`]: crate::scheduler::SwitchSource

use crate::scheduler::SwitchSource;

/// Hardware abstraction a target provides to the kernel.
pub trait Port: Sync {
	/// Clears the global interrupt flag and returns an opaque token holding
	/// the previous state (e.g. the saved status register).
	fn disable_interrupts(&self) -> usize;

	/// Restores the interrupt state captured by [`Port::disable_interrupts`].
	fn restore_interrupts(&self, token: usize);

	/// Masks the three scheduler interrupt sources. Application interrupts
	/// stay enabled.
	fn disable_switching_irqs(&self);

	/// Unmasks the three scheduler interrupt sources.
	fn enable_switching_irqs(&self);

	/// Restarts the preemptive-slice timer so the incoming task gets a full
	/// slice, clearing a pending slice interrupt if one is set.
	fn reset_preemption_timer(&self);

	/// Whether the tick interrupt is pending.
	fn is_tick_pending(&self) -> bool;

	/// Clears a pending tick interrupt flag.
	fn clear_tick_pending(&self);

	/// Whether the preemptive-slice interrupt is pending.
	fn is_preemption_pending(&self) -> bool;

	/// Clears a pending preemptive-slice interrupt flag.
	fn clear_preemption_pending(&self);

	/// Whether the forced-switch interrupt is pending.
	fn is_forced_switch_pending(&self) -> bool;

	/// Clears a pending forced-switch interrupt flag.
	fn clear_forced_switch_pending(&self);

	/// Raises the software forced-switch interrupt. The only kernel entry
	/// that may be requested from an application ISR.
	fn trigger_forced_switch(&self);

	/// Smallest stack able to hold one full saved context plus the startup
	/// frame written by [`Port::create_initial_context`].
	fn min_stack_size(&self) -> usize;

	/// Seeds `stack` with an artificial saved context such that the first
	/// context restore runs `func(arg)` and terminates the task when it
	/// returns (see [`crate::scheduler::task_entry`]). Returns the address
	/// of the last byte of the seeded context, i.e. the value to store as
	/// the task's stack pointer.
	///
	/// # Safety
	///
	/// The stack must stay valid and unaliased until the task terminates.
	unsafe fn create_initial_context(
		&self,
		stack: &mut [u8],
		func: extern "C" fn(usize),
		arg: usize,
	) -> usize;

	/// Direct, non-interrupt switch entry: saves the current context, calls
	/// [`crate::scheduler::switch_entry`] with `source`, and resumes the
	/// returned context. Only used with [`SwitchSource::Yielded`] and
	/// [`SwitchSource::TerminatingTask`]. Called with interrupts disabled;
	/// the port re-enables them while the switch core runs, the way an ISR
	/// entry would.
	fn switch(&self, source: SwitchSource);

	/// Atomically re-enables interrupts and puts the CPU into its low-power
	/// sleep state, honouring the "enable interrupts, then one instruction,
	/// then sleep" guarantee so wakeups cannot be lost. Called with
	/// interrupts disabled; returns with interrupts enabled.
	fn idle_sleep(&self);
}

/// Runs `f` with the global interrupt flag cleared.
#[inline]
pub(crate) fn without_interrupts<R>(port: &dyn Port, f: impl FnOnce() -> R) -> R {
	let token = port.disable_interrupts();
	let ret = f();
	port.restore_interrupts(token);
	ret
}
