//! The scheduler core: the task ring, next-task selection, the tick engine,
//! and the pause/resume gate.
//!
//! Three interrupt sources (tick, preemptive slice, forced switch) and two
//! direct calls (yield, terminate) enter through one common path,
//! [`switch_entry`]. The path saves the outgoing context, selects the next
//! runnable task with the strictly highest effective priority, coalesces
//! any scheduler interrupt that became pending meanwhile, and resumes the
//! chosen context.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crossbeam_utils::Backoff;
use hermit_sync::{OnceCell, SpinMutex};

use crate::error::{Error, Result};
use crate::port::{Port, without_interrupts};
use crate::scheduler::task::{IDLE_PRIO, NORMAL_PRIO, Priority, Task, TaskId, TaskStack, Timeout};
use crate::synch::object::{SyncId, SyncObject};
use crate::time::TickCount;

pub mod task;

/// Capacity of the task ring, idle task not counted.
pub(crate) const MAX_NUMBER_OF_TASKS: u8 = u8::MAX;

pub(crate) static KERNEL: SpinMutex<Kernel> = SpinMutex::new(Kernel::new());
static PORT: OnceCell<&'static dyn Port> = OnceCell::new();

pub(crate) fn try_port() -> Option<&'static dyn Port> {
	PORT.get().copied()
}

/// What caused an entry into the switch core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchSource {
	/// The current task gave up the CPU voluntarily.
	Yielded,
	/// The preemptive-slice timer expired.
	PreemptiveSwitch,
	/// Software requested a best-effort reschedule.
	ForcedSwitch,
	/// The monotone switcher tick fired.
	SwitcherTick,
	/// The current task terminates and must not be resumed.
	TerminatingTask,
}

/// Every piece of state the switch core, the tick engine, and the
/// synchronization substrate operate on.
///
/// Mutating any of it requires switching to be paused (or the switch path
/// itself, which runs with scheduler IRQs masked). The sleep counters and
/// the active-task counter are additionally written from the tick interrupt
/// and are only touched with interrupts fully disabled.
pub(crate) struct Kernel {
	/// All existing tasks by id; membership matches the task ring
	pub tasks: BTreeMap<TaskId, Task>,
	/// All registered sync objects
	pub syncs: BTreeMap<SyncId, SyncObject>,
	/// The task currently executing
	pub current: Option<TaskId>,
	/// The permanent lowest-priority fallback task
	pub idle: Option<TaskId>,
	/// Number of user tasks in the ring
	pub task_count: u8,
	/// User tasks whose sleep count is zero
	pub active_tasks: u8,
	pub tick_count: TickCount,
	pub next_sync_id: u32,
	next_task_id: u32,
}

impl Kernel {
	pub const fn new() -> Self {
		Self {
			tasks: BTreeMap::new(),
			syncs: BTreeMap::new(),
			current: None,
			idle: None,
			task_count: 0,
			active_tasks: 0,
			tick_count: TickCount::new(),
			next_sync_id: 0,
			next_task_id: 0,
		}
	}

	fn alloc_task_id(&mut self) -> TaskId {
		loop {
			let id = TaskId::from(self.next_task_id);
			self.next_task_id = self.next_task_id.wrapping_add(1);
			if !self.tasks.contains_key(&id) {
				return id;
			}
		}
	}

	/// Installs the calling context as the running main task.
	pub(crate) fn install_main_task(&mut self) -> TaskId {
		debug_assert!(self.current.is_none(), "main task installed twice");

		let id = self.alloc_task_id();
		let join_object = self.create_sync_object(SyncObject::new_notification());
		let task = Task {
			id,
			last_stack_pointer: 0,
			sleep_count: 0,
			pause_count: 0,
			ring_next: id,
			waiting_for: None,
			acquired: Vec::new(),
			join_object,
			base_prio: NORMAL_PRIO,
			prio: NORMAL_PRIO,
			stack: None,
		};
		self.tasks.insert(id, task);
		self.current = Some(id);
		self.task_count = 1;
		self.active_tasks = 1;
		id
	}

	/// Creates a task and links it into the ring right after the current
	/// task. Returns its id and whether it outranks the current task.
	pub(crate) fn add_task(
		&mut self,
		port: &dyn Port,
		func: extern "C" fn(usize),
		arg: usize,
		prio: Priority,
		stack_size: usize,
	) -> Result<(TaskId, bool)> {
		let Some(current) = self.current else {
			return Err(Error::NotInitialized);
		};
		let is_idle = prio == IDLE_PRIO;
		if !is_idle && self.task_count == MAX_NUMBER_OF_TASKS {
			return Err(Error::TooManyTasks);
		}

		let id = self.alloc_task_id();
		let mut stack = TaskStack::new(stack_size);
		let last_stack_pointer =
			unsafe { port.create_initial_context(stack.as_mut_slice(), func, arg) };
		let join_object = self.create_sync_object(SyncObject::new_notification());
		let task = Task {
			id,
			last_stack_pointer,
			sleep_count: 0,
			pause_count: 0,
			ring_next: self.tasks[&current].ring_next,
			waiting_for: None,
			acquired: Vec::new(),
			join_object,
			base_prio: prio,
			prio,
			stack: Some(stack),
		};
		self.tasks.insert(id, task);
		self.tasks
			.get_mut(&current)
			.expect("current task exists")
			.ring_next = id;
		if !is_idle {
			self.task_count += 1;
			let token = port.disable_interrupts();
			self.active_tasks += 1;
			port.restore_interrupts(token);
		}

		debug!("Created task {id} with priority {prio}");

		Ok((id, prio > self.tasks[&current].prio))
	}

	/// One pass of the switch core. Selects the task to resume and returns
	/// its stored stack pointer; returns `stack_pointer` unchanged when the
	/// current task stays (partial-switch fast path).
	pub(crate) fn switch_core(
		&mut self,
		port: &dyn Port,
		mut source: SwitchSource,
		stack_pointer: usize,
	) -> usize {
		let current = self.current.expect("switching before initialization");
		let mut next = current;

		if source != SwitchSource::SwitcherTick {
			port.reset_preemption_timer();
		}

		loop {
			if source == SwitchSource::SwitcherTick {
				let candidate = self.tick_pass(port, current);
				if self.tasks[&next].prio < self.tasks[&candidate].prio {
					next = candidate;
				}
			} else {
				// the current task's own sleep counter only changes from its
				// own yield/sleep/terminate path, never mid-switch
				let current_runnable = self.tasks[&current].sleep_count == 0;
				let mut entry = self.tasks[&current].ring_next;
				while entry != current {
					let token = port.disable_interrupts();
					let runnable = self.tasks[&entry].sleep_count == 0;
					port.restore_interrupts(token);
					if runnable {
						// a runnable current task is only dethroned by equal
						// or higher priority; equal keeps the round robin
						// rotating, ties among others go to the first
						// encountered
						let better = if next == current {
							!current_runnable
								|| self.tasks[&entry].prio >= self.tasks[&current].prio
						} else {
							self.tasks[&next].prio < self.tasks[&entry].prio
						};
						if better {
							next = entry;
						}
					}
					entry = self.tasks[&entry].ring_next;
				}
			}

			if source == SwitchSource::TerminatingTask {
				debug_assert_ne!(next, current, "terminating task has no successor");
				self.unlink_from_ring(current);
				self.task_count -= 1;
				let dead = self.tasks.remove(&current).expect("terminating task exists");
				debug_assert!(
					dead.acquired.is_empty(),
					"terminating task still owns sync objects"
				);
				debug_assert!(dead.waiting_for.is_none());
				self.syncs.remove(&dead.join_object);
				debug!("Removed task {} from the ring", dead.id);
				break;
			}

			// adopt a pending scheduler IRQ here instead of exiting and
			// immediately re-entering the switch path
			if port.is_tick_pending() {
				port.clear_tick_pending();
				source = SwitchSource::SwitcherTick;
			} else if port.is_preemption_pending() {
				port.clear_preemption_pending();
				source = SwitchSource::PreemptiveSwitch;
			} else if port.is_forced_switch_pending() {
				port.clear_forced_switch_pending();
				source = SwitchSource::ForcedSwitch;
			} else {
				break;
			}
		}

		let new_stack_pointer = if next != current {
			if let Some(prev) = self.tasks.get_mut(&current) {
				prev.last_stack_pointer = stack_pointer;
				#[cfg(feature = "stack-check")]
				if let Some(stack) = &prev.stack {
					debug_assert!(stack.canary_intact(), "stack overflow in task {}", prev.id);
				}
			}
			debug!("Switching from task {current} to task {next}");
			let token = port.disable_interrupts();
			self.current = Some(next);
			port.restore_interrupts(token);
			self.tasks[&next].last_stack_pointer
		} else {
			stack_pointer
		};

		// the incoming task may have switching paused; keep the IRQ mask in
		// step with its pause counter
		let resumed = self.current.expect("current task exists");
		if self.tasks[&resumed].pause_count == 0 {
			port.enable_switching_irqs();
		} else {
			port.disable_switching_irqs();
		}

		new_stack_pointer
	}

	/// Advances the tick count and the per-task sleep countdowns. Returns
	/// the highest-priority task that just became runnable, or `current`.
	fn tick_pass(&mut self, port: &dyn Port, current: TaskId) -> TaskId {
		self.tick_count.increment();

		let mut next = current;
		let mut entry = self.tasks[&current].ring_next;
		while entry != current {
			let token = port.disable_interrupts();
			let woke = {
				let task = self.tasks.get_mut(&entry).expect("ring is consistent");
				if task.sleep_count > 0 && task.sleep_count < Timeout::INFINITE.into() {
					task.sleep_count -= 1;
					task.sleep_count == 0
				} else {
					false
				}
			};
			if woke {
				debug_assert!(Some(entry) != self.idle, "idle task was sleeping");
				self.active_tasks += 1;
				if self.tasks[&entry].prio > self.tasks[&next].prio {
					next = entry;
				}
			}
			port.restore_interrupts(token);
			entry = self.tasks[&entry].ring_next;
		}

		next
	}

	fn unlink_from_ring(&mut self, id: TaskId) {
		let mut entry = self.tasks[&id].ring_next;
		while self.tasks[&entry].ring_next != id {
			entry = self.tasks[&entry].ring_next;
		}
		let next = self.tasks[&id].ring_next;
		self.tasks
			.get_mut(&entry)
			.expect("ring is consistent")
			.ring_next = next;
	}

	pub(crate) fn ring_contains(&self, id: TaskId) -> bool {
		let Some(current) = self.current else {
			return false;
		};
		let mut entry = current;
		loop {
			if entry == id {
				return true;
			}
			entry = self.tasks[&entry].ring_next;
			if entry == current {
				return false;
			}
		}
	}

	/// Makes `id` runnable again if it is sleeping. The sleep counter and
	/// the active-task counter race the tick interrupt, hence the full
	/// interrupt disable. When the woken task outranks the current one, a
	/// forced switch is requested so the wakeup is honoured as soon as
	/// switching resumes.
	pub(crate) fn wake_task(&mut self, port: &dyn Port, id: TaskId) {
		let token = port.disable_interrupts();
		let task = self.tasks.get_mut(&id).expect("waking a known task");
		let woke = if task.sleep_count > 0 {
			task.sleep_count = 0;
			true
		} else {
			false
		};
		if woke {
			debug_assert!(Some(id) != self.idle, "idle task was sleeping");
			self.active_tasks += 1;
			debug!("Waking up task {id}");
			let current = self.current.expect("current task exists");
			if self.tasks[&id].prio > self.tasks[&current].prio {
				port.trigger_forced_switch();
			}
		}
		port.restore_interrupts(token);
	}

	pub(crate) fn pause(&mut self, port: &dyn Port) {
		let Some(current) = self.current else {
			debug_assert!(false, "pausing before initialization");
			return;
		};
		let task = self.tasks.get_mut(&current).expect("current task exists");
		debug_assert!(task.pause_count < u8::MAX, "pause nesting overflow");
		task.pause_count = task.pause_count.wrapping_add(1);
		if task.pause_count == 1 {
			port.disable_switching_irqs();
		}
	}

	pub(crate) fn resume(&mut self, port: &dyn Port) {
		let Some(current) = self.current else {
			debug_assert!(false, "resuming before initialization");
			return;
		};
		let task = self.tasks.get_mut(&current).expect("current task exists");
		debug_assert!(task.pause_count > 0, "resume without matching pause");
		task.pause_count = task.pause_count.wrapping_sub(1);
		if task.pause_count == 0 {
			port.enable_switching_irqs();
		}
	}
}

/// Initializes task switching: the calling context becomes the main task at
/// [`NORMAL_PRIO`] and the idle task is started.
///
/// Returns [`Error::InvalidParameter`] if the kernel is already initialized.
pub fn init(port: &'static dyn Port) -> Result<()> {
	if PORT.set(port).is_err() {
		return Err(Error::InvalidParameter);
	}

	let token = port.disable_interrupts();
	let main_id = KERNEL.lock().install_main_task();
	port.restore_interrupts(token);

	// the idle task is the fallback whenever every other task sleeps, so it
	// has to exist before switching can happen
	pause_switching();
	let result = {
		let mut kernel = KERNEL.lock();
		kernel
			.add_task(port, idle_task, 0, IDLE_PRIO, 2 * port.min_stack_size())
			.map(|(id, _)| {
				kernel.idle = Some(id);
			})
	};
	resume_switching();

	debug!("Initialized task switching with main task {main_id}");

	result
}

/// Adds a task with its own stack and base priority `prio`, linking it into
/// the ring right after the current task. Yields if the new task outranks
/// the current one.
///
/// Like every function in this module, this must not be called from an ISR;
/// an ISR may only request a reschedule through
/// [`Port::trigger_forced_switch`].
pub fn spawn(
	func: extern "C" fn(usize),
	arg: usize,
	prio: Priority,
	stack_size: usize,
) -> Result<TaskId> {
	let Some(port) = try_port() else {
		return Err(Error::NotInitialized);
	};
	if prio == IDLE_PRIO {
		return Err(Error::InvalidParameter);
	}
	if stack_size < port.min_stack_size() {
		return Err(Error::InvalidParameter);
	}

	pause_switching();
	let result = KERNEL.lock().add_task(port, func, arg, prio, stack_size);
	resume_switching();

	let (id, outranks_current) = result?;
	if outranks_current {
		yield_now();
	}
	Ok(id)
}

/// Gives up the CPU. The calling task is parked until the next switcher
/// tick; equal-priority peers run in ring order.
pub fn yield_now() {
	let Some(port) = try_port() else {
		return;
	};

	let token = port.disable_interrupts();
	{
		let mut kernel = KERNEL.lock();
		if let Some(current) = kernel.current {
			if Some(current) != kernel.idle {
				debug_assert!(kernel.active_tasks > 0);
				kernel.active_tasks -= 1;
				let task = kernel.tasks.get_mut(&current).expect("current task exists");
				if task.sleep_count < Timeout::MAX.into() {
					task.sleep_count += 1;
				}
			}
		}
	}
	port.switch(SwitchSource::Yielded);
	port.restore_interrupts(token);
}

/// Sleeps for at least `timeout` ticks, or until explicitly woken for
/// [`Timeout::INFINITE`]. [`Timeout::NONE`] is equivalent to [`yield_now`].
pub fn sleep(timeout: Timeout) {
	if timeout.is_none() {
		yield_now();
		return;
	}
	let Some(port) = try_port() else {
		return;
	};

	let token = port.disable_interrupts();
	{
		let mut kernel = KERNEL.lock();
		if let Some(current) = kernel.current {
			debug_assert!(Some(current) != kernel.idle, "idle task cannot sleep");
			kernel
				.tasks
				.get_mut(&current)
				.expect("current task exists")
				.sleep_count = timeout.into();
		}
	}
	yield_now();
	port.restore_interrupts(token);
}

/// Terminates the current task, waking every joiner, and switches to the
/// next runnable task. Never returns.
///
/// # Panics
///
/// Panics if called before [`init`].
pub fn exit() -> ! {
	let port = try_port().expect("task switching is initialized");

	let token = port.disable_interrupts();
	{
		let mut kernel = KERNEL.lock();
		let current = kernel.current.expect("current task exists");
		debug_assert!(Some(current) != kernel.idle, "terminating the idle task");
		debug!("Terminating task {current}");
		kernel.active_tasks -= 1;
		kernel
			.tasks
			.get_mut(&current)
			.expect("current task exists")
			.sleep_count = Timeout::INFINITE.into();
	}
	pause_switching();
	port.restore_interrupts(token);

	{
		let mut kernel = KERNEL.lock();
		let current = kernel.current.expect("current task exists");
		let join_object = kernel.tasks[&current].join_object;
		kernel.notify_all_sync(port, join_object);
	}

	port.switch(SwitchSource::TerminatingTask);
	unreachable!()
}

/// Waits for `task` to terminate. Returns `Ok` right away if the task is
/// not (or no longer) known, `Err(Timeout)` if it outlives the wait budget,
/// and `Err(InvalidParameter)` for a self-join.
pub fn join(task: TaskId, timeout: Timeout) -> Result<()> {
	if try_port().is_none() {
		return Err(Error::NotInitialized);
	}

	enum JoinState {
		SelfJoin,
		Gone,
		Queued,
	}

	pause_switching();

	let state = {
		let mut kernel = KERNEL.lock();
		let current = kernel.current.expect("current task exists");
		if task == current {
			JoinState::SelfJoin
		} else if !kernel.ring_contains(task) {
			JoinState::Gone
		} else {
			let join_object = kernel.tasks[&task].join_object;
			kernel.queue_for_sync(join_object, current);
			JoinState::Queued
		}
	};

	let result = match state {
		JoinState::SelfJoin => Err(Error::InvalidParameter),
		JoinState::Gone => Ok(()),
		JoinState::Queued => {
			sleep(timeout);
			let mut kernel = KERNEL.lock();
			let current = kernel.current.expect("current task exists");
			// still queued on the join object means the target is alive and
			// the wait budget ran out
			if let Some(object) = kernel.tasks[&current].waiting_for {
				kernel.unqueue_from_sync(object, current);
				Err(Error::Timeout)
			} else {
				Ok(())
			}
		}
	};

	resume_switching();
	result
}

/// Whether `task` currently exists in the task ring.
pub fn is_known_task(task: TaskId) -> bool {
	if try_port().is_none() {
		return false;
	}
	pause_switching();
	let known = KERNEL.lock().ring_contains(task);
	resume_switching();
	known
}

/// Suppresses preemptive task switching for the current task. Nestable;
/// every call must be balanced by [`resume_switching`]. Application
/// interrupts stay enabled, but cannot cause a task switch while switching
/// is paused.
pub fn pause_switching() {
	let Some(port) = try_port() else {
		return;
	};
	let token = port.disable_interrupts();
	KERNEL.lock().pause(port);
	port.restore_interrupts(token);
}

/// Drops one level of pause nesting, re-enabling preemptive switching when
/// the outermost pause is released.
pub fn resume_switching() {
	let Some(port) = try_port() else {
		return;
	};
	let token = port.disable_interrupts();
	KERNEL.lock().resume(port);
	port.restore_interrupts(token);
}

/// Switch-path entry point for platform ports.
///
/// The port's three scheduler ISRs and its [`Port::switch`] implementation
/// call this after saving the outgoing context and moving execution to the
/// dedicated switcher stack. `stack_pointer` is the address of the last
/// saved byte. The returned value names the context to resume; if it equals
/// `stack_pointer`, the task is unchanged and the call-saved registers need
/// not be restored.
pub fn switch_entry(source: SwitchSource, stack_pointer: usize) -> usize {
	let Some(port) = try_port() else {
		debug_assert!(false, "switch before initialization");
		return stack_pointer;
	};
	KERNEL.lock().switch_core(port, source, stack_pointer)
}

/// First-run landing pad for spawned tasks: runs the task function and
/// terminates the task when it returns. Ports arrange the initial context
/// so that the first restore continues here.
pub extern "C" fn task_entry(func: extern "C" fn(usize), arg: usize) -> ! {
	func(arg);
	exit()
}

pub(crate) fn tick_count_snapshot() -> u64 {
	match try_port() {
		Some(port) => without_interrupts(port, || KERNEL.lock().tick_count.as_u64()),
		None => KERNEL.lock().tick_count.as_u64(),
	}
}

/// Runs whenever no user task is active and drives the CPU into low power
/// until an interrupt arrives.
extern "C" fn idle_task(_arg: usize) {
	let port = try_port().expect("task switching is initialized");
	let backoff = Backoff::new();

	loop {
		let token = port.disable_interrupts();
		if KERNEL.lock().active_tasks != 0 {
			port.restore_interrupts(token);
			yield_now();
			backoff.reset();
		} else if backoff.is_completed() {
			// idle_sleep re-enables interrupts atomically with the sleep
			// instruction; a wakeup between the counter check and the sleep
			// cannot be lost
			port.idle_sleep();
			backoff.reset();
		} else {
			port.restore_interrupts(token);
			backoff.snooze();
		}
	}
}
