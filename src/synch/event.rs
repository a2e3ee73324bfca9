//! A latching event.

use hermit_sync::OnceCell;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::scheduler::task::{TaskId, Timeout};
use crate::scheduler::{KERNEL, Kernel, pause_switching, resume_switching, sleep, try_port};
use crate::synch::object::{SyncId, SyncObject, SyncState};

/// Outcome of the pre-block half of a wait.
enum WaitPhase {
	/// A latched notification was consumed.
	Consumed,
	/// Nothing is latched and the caller does not want to wait.
	Expired,
	/// The caller is queued and has to sleep.
	Queued,
}

/// A notification source tasks can block on.
///
/// A notification wakes the highest-priority waiter (or all of them). When
/// nobody waits, the notification latches instead: the next wait consumes
/// it without blocking. The latch is a single bit, so repeated
/// notifications without a waiter coalesce.
///
/// `Event::new` is const, so an event can live in a static.
pub struct Event {
	sync: OnceCell<SyncId>,
}

impl Event {
	pub const fn new() -> Self {
		Self {
			sync: OnceCell::new(),
		}
	}

	/// The backing sync object, registered on first use. Registration runs
	/// under the kernel lock, so it cannot race.
	fn sync_id(&self, kernel: &mut Kernel) -> SyncId {
		if let Some(&sync) = self.sync.get() {
			return sync;
		}
		let sync = kernel.create_sync_object(SyncObject::new_notification());
		self.sync.set(sync).unwrap();
		sync
	}

	/// Waits up to `timeout` ticks for a notification, consuming a latched
	/// one immediately.
	pub fn wait(&self, timeout: Timeout) -> Result<()> {
		if try_port().is_none() {
			return Err(Error::NotInitialized);
		}

		pause_switching();

		let (sync, phase) = {
			let mut kernel = KERNEL.lock();
			let current = kernel.current.expect("current task exists");
			let sync = self.sync_id(&mut kernel);
			(sync, wait_phase(&mut kernel, sync, current, timeout))
		};

		let result = match phase {
			WaitPhase::Consumed => Ok(()),
			WaitPhase::Expired => Err(Error::Timeout),
			WaitPhase::Queued => {
				sleep(timeout);
				let mut kernel = KERNEL.lock();
				let current = kernel.current.expect("current task exists");
				finish_wait(&mut kernel, sync, current)
			}
		};

		resume_switching();
		result
	}

	/// Wakes the highest-priority waiter, or latches the notification when
	/// nobody waits.
	pub fn notify_one(&self) -> Result<()> {
		self.notify(false)
	}

	/// Wakes every waiter, or latches the notification when nobody waits.
	pub fn notify_all(&self) -> Result<()> {
		self.notify(true)
	}

	fn notify(&self, all: bool) -> Result<()> {
		let Some(port) = try_port() else {
			return Err(Error::NotInitialized);
		};

		pause_switching();
		{
			let mut kernel = KERNEL.lock();
			let sync = self.sync_id(&mut kernel);
			notify_phase(&mut kernel, port, sync, all);
		}
		resume_switching();
		Ok(())
	}
}

impl Drop for Event {
	fn drop(&mut self) {
		if let Some(&sync) = self.sync.get() {
			KERNEL.lock().remove_sync_object(sync);
		}
	}
}

fn wait_phase(kernel: &mut Kernel, sync: SyncId, task: TaskId, timeout: Timeout) -> WaitPhase {
	match &mut kernel
		.syncs
		.get_mut(&sync)
		.expect("sync object exists")
		.state
	{
		SyncState::Notification { pending } => {
			if *pending {
				*pending = false;
				return WaitPhase::Consumed;
			}
		}
		SyncState::Ownership { .. } => unreachable!("wait on an ownership object"),
	}

	if timeout.is_none() {
		return WaitPhase::Expired;
	}

	kernel.queue_for_sync(sync, task);
	WaitPhase::Queued
}

/// Post-wake half of a wait: still being queued means no notification
/// arrived in time.
fn finish_wait(kernel: &mut Kernel, sync: SyncId, task: TaskId) -> Result<()> {
	if kernel.tasks[&task].waiting_for == Some(sync) {
		kernel.unqueue_from_sync(sync, task);
		return Err(Error::Timeout);
	}
	Ok(())
}

fn notify_phase(kernel: &mut Kernel, port: &dyn Port, sync: SyncId, all: bool) {
	if kernel.syncs[&sync].waiters.is_empty() {
		match &mut kernel
			.syncs
			.get_mut(&sync)
			.expect("sync object exists")
			.state
		{
			SyncState::Notification { pending } => *pending = true,
			SyncState::Ownership { .. } => unreachable!("notify of an ownership object"),
		}
	} else if all {
		kernel.notify_all_sync(port, sync);
	} else {
		kernel.notify_one_sync(port, sync);
	}
}
