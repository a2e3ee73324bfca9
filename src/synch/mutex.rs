//! A recursive mutex with priority inheritance.

use hermit_sync::OnceCell;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::scheduler::task::{TaskId, Timeout};
use crate::scheduler::{KERNEL, Kernel, pause_switching, resume_switching, sleep, try_port};
use crate::synch::object::{SyncId, SyncObject};

/// Outcome of the pre-block half of a lock attempt.
enum LockPhase {
	/// The calling task owns the mutex.
	Acquired,
	/// Somebody else owns it and the caller does not want to wait.
	Expired,
	/// The caller is queued and has to sleep.
	Queued,
}

/// A recursive mutex.
///
/// The owner may lock again without blocking; every lock needs a matching
/// [`Mutex::unlock`]. Contended locks queue by effective priority and the
/// owner inherits the priority of its highest waiter, transitively across
/// the objects it blocks on itself.
///
/// `Mutex::new` is const, so a mutex can live in a static:
///
/// ```rust,ignore
/// static LOCK: Mutex = Mutex::new();
/// ```
///
/// Must not be used from ISRs.
pub struct Mutex {
	sync: OnceCell<SyncId>,
}

impl Mutex {
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
		let sync = kernel.create_sync_object(SyncObject::new_ownership());
		self.sync.set(sync).unwrap();
		sync
	}

	/// Locks the mutex, waiting up to `timeout` ticks for the owner to
	/// release it.
	pub fn lock(&self, timeout: Timeout) -> Result<()> {
		if try_port().is_none() {
			return Err(Error::NotInitialized);
		}

		pause_switching();

		let (sync, phase) = {
			let mut kernel = KERNEL.lock();
			let current = kernel.current.expect("current task exists");
			let sync = self.sync_id(&mut kernel);
			(sync, lock_phase(&mut kernel, sync, current, timeout))
		};

		let result = match phase {
			LockPhase::Acquired => Ok(()),
			LockPhase::Expired => Err(Error::Timeout),
			LockPhase::Queued => {
				// parked until the owner designates us as successor or the
				// countdown runs out; the queue cannot change underneath us
				// before the sleep because switching is still paused
				sleep(timeout);
				let mut kernel = KERNEL.lock();
				let current = kernel.current.expect("current task exists");
				finish_lock(&mut kernel, sync, current)
			}
		};

		resume_switching();
		result
	}

	/// Unlocks the mutex, releasing ownership once the outermost lock is
	/// dropped.
	pub fn unlock(&self) -> Result<()> {
		let Some(port) = try_port() else {
			return Err(Error::NotInitialized);
		};
		let Some(&sync) = self.sync.get() else {
			// never locked by anybody
			return Err(Error::ResourceNotOwned);
		};

		pause_switching();
		let result = {
			let mut kernel = KERNEL.lock();
			let current = kernel.current.expect("current task exists");
			unlock_phase(&mut kernel, port, sync, current)
		};
		resume_switching();
		result
	}
}

impl Drop for Mutex {
	fn drop(&mut self) {
		if let Some(&sync) = self.sync.get() {
			let mut kernel = KERNEL.lock();
			debug_assert!(kernel.syncs[&sync].is_free(), "dropping a locked mutex");
			kernel.remove_sync_object(sync);
		}
	}
}

fn lock_phase(kernel: &mut Kernel, sync: SyncId, task: TaskId, timeout: Timeout) -> LockPhase {
	if kernel.syncs[&sync].is_free() {
		kernel.acquire_sync(sync, task);
		*kernel
			.syncs
			.get_mut(&sync)
			.expect("sync object exists")
			.lock_count_mut() = 1;
		return LockPhase::Acquired;
	}

	if kernel.syncs[&sync].is_current_owner(task) {
		let count = kernel
			.syncs
			.get_mut(&sync)
			.expect("sync object exists")
			.lock_count_mut();
		debug_assert!(*count < u16::MAX, "lock nesting overflow");
		*count = count.wrapping_add(1);
		return LockPhase::Acquired;
	}

	if timeout.is_none() {
		return LockPhase::Expired;
	}

	kernel.queue_for_sync(sync, task);
	LockPhase::Queued
}

/// Post-wake half of a contended lock: either the caller is the designated
/// successor and finalizes the handoff, or the wait timed out and it leaves
/// the queue.
fn finish_lock(kernel: &mut Kernel, sync: SyncId, task: TaskId) -> Result<()> {
	if !kernel.syncs[&sync].is_next_owner(task) {
		kernel.unqueue_from_sync(sync, task);
		return Err(Error::Timeout);
	}

	kernel.unqueue_from_sync(sync, task);
	kernel.acquire_sync(sync, task);
	*kernel
		.syncs
		.get_mut(&sync)
		.expect("sync object exists")
		.lock_count_mut() = 1;
	Ok(())
}

fn unlock_phase(kernel: &mut Kernel, port: &dyn Port, sync: SyncId, task: TaskId) -> Result<()> {
	if !kernel.syncs[&sync].is_current_owner(task) {
		return Err(Error::ResourceNotOwned);
	}

	let count = kernel
		.syncs
		.get_mut(&sync)
		.expect("sync object exists")
		.lock_count_mut();
	debug_assert!(*count > 0);
	*count -= 1;
	if *count == 0 {
		kernel.release_sync(port, sync, task);
	}
	Ok(())
}
