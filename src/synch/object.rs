//! The substrate shared by every blocking primitive: a priority-sorted
//! waiter queue plus either ownership or notification bookkeeping.
//!
//! Ownership-flavour objects move through three states. *Free* has no owner
//! and no waiters. *Owned* has an owner and possibly waiters. *Pending new
//! owner* is the handoff window: the releasing task has designated the
//! waiter-queue head as successor and woken it, but the successor has not
//! run yet to finalize the transfer. During that window nobody may steal
//! the object, however high their priority; late arrivals queue behind the
//! designated successor.
//!
//! Queueing propagates priority transitively: raising an owner that is
//! itself blocked re-sorts it in the queue it waits on and continues with
//! that object's owner. The walk follows is-waiting-for edges, and a task
//! waits on at most one object, so it is a simple chain.

use alloc::collections::VecDeque;
use core::fmt;

use crate::port::Port;
use crate::scheduler::Kernel;
use crate::scheduler::task::{Priority, TaskId};

/// Unique identifier for a registered sync object.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub(crate) struct SyncId(u32);

impl fmt::Display for SyncId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Flavour-specific tail of a sync object.
pub(crate) enum SyncState {
	/// Mutex-like: at most one owner at a time, priority inheritance.
	Ownership {
		/// Current owner, or the designated successor while
		/// `pending_new_owner` is set
		owner: Option<TaskId>,
		/// Whether `owner` names a successor that has not yet finalized
		/// the transfer
		pending_new_owner: bool,
		/// Recursive lock depth of the owning mutex
		lock_count: u16,
	},
	/// Event-like: wakes waiters, latches when nobody waits.
	Notification {
		/// A notification arrived while the waiter queue was empty; the
		/// next wait consumes it without blocking
		pending: bool,
	},
}

pub(crate) struct SyncObject {
	/// Waiting tasks, effective priority descending, FIFO within a
	/// priority
	pub waiters: VecDeque<TaskId>,
	pub state: SyncState,
}

impl SyncObject {
	pub const fn new_ownership() -> Self {
		Self {
			waiters: VecDeque::new(),
			state: SyncState::Ownership {
				owner: None,
				pending_new_owner: false,
				lock_count: 0,
			},
		}
	}

	pub const fn new_notification() -> Self {
		Self {
			waiters: VecDeque::new(),
			state: SyncState::Notification { pending: false },
		}
	}

	/// Free: no owner, nobody queued, no transfer in flight.
	pub fn is_free(&self) -> bool {
		match self.state {
			SyncState::Ownership {
				owner,
				pending_new_owner,
				..
			} => {
				if owner.is_none() {
					debug_assert!(!pending_new_owner);
					debug_assert!(self.waiters.is_empty());
					true
				} else {
					false
				}
			}
			SyncState::Notification { .. } => false,
		}
	}

	/// Whether `task` owns the object right now (a designated successor
	/// does not).
	pub fn is_current_owner(&self, task: TaskId) -> bool {
		matches!(
			self.state,
			SyncState::Ownership {
				owner: Some(owner),
				pending_new_owner: false,
				..
			} if owner == task
		)
	}

	/// Whether `task` is the designated successor of an in-flight handoff.
	pub fn is_next_owner(&self, task: TaskId) -> bool {
		matches!(
			self.state,
			SyncState::Ownership {
				owner: Some(owner),
				pending_new_owner: true,
				..
			} if owner == task
		)
	}

	/// Recursive lock depth; ownership flavour only.
	pub fn lock_count_mut(&mut self) -> &mut u16 {
		match &mut self.state {
			SyncState::Ownership { lock_count, .. } => lock_count,
			SyncState::Notification { .. } => unreachable!("lock count of a notification object"),
		}
	}

	/// Owner while the object is owned, ignoring an in-flight handoff.
	fn settled_owner(&self) -> Option<TaskId> {
		match self.state {
			SyncState::Ownership {
				owner: Some(owner),
				pending_new_owner: false,
				..
			} => Some(owner),
			_ => None,
		}
	}
}

impl Kernel {
	pub(crate) fn create_sync_object(&mut self, object: SyncObject) -> SyncId {
		loop {
			let id = SyncId(self.next_sync_id);
			self.next_sync_id = self.next_sync_id.wrapping_add(1);
			if !self.syncs.contains_key(&id) {
				self.syncs.insert(id, object);
				return id;
			}
		}
	}

	pub(crate) fn remove_sync_object(&mut self, sync: SyncId) {
		if let Some(object) = self.syncs.remove(&sync) {
			debug_assert!(object.waiters.is_empty(), "removed sync object has waiters");
		}
	}

	/// Inserts `task` into the waiter queue, sorted by effective priority
	/// descending, behind every waiter of the same priority.
	fn insert_waiter(&mut self, sync: SyncId, task: TaskId) {
		debug_assert!(self.tasks[&task].waiting_for.is_none());

		let prio = self.tasks[&task].prio;
		let object = &self.syncs[&sync];
		let position = object
			.waiters
			.iter()
			.position(|waiter| self.tasks[waiter].prio < prio)
			.unwrap_or(object.waiters.len());
		self.syncs
			.get_mut(&sync)
			.expect("sync object exists")
			.waiters
			.insert(position, task);
		self.tasks
			.get_mut(&task)
			.expect("waiting task exists")
			.waiting_for = Some(sync);
	}

	fn remove_waiter(&mut self, sync: SyncId, task: TaskId) {
		debug_assert_eq!(self.tasks[&task].waiting_for, Some(sync));

		let object = self.syncs.get_mut(&sync).expect("sync object exists");
		let position = object
			.waiters
			.iter()
			.position(|waiter| *waiter == task)
			.expect("task is queued on the object");
		object.waiters.remove(position);
		self.tasks
			.get_mut(&task)
			.expect("waiting task exists")
			.waiting_for = None;
	}

	/// Takes ownership of a free object, or finalizes an in-flight handoff
	/// for the designated successor.
	///
	/// The successor inherits from the head of the waiter queue if someone
	/// of higher priority queued up between the previous owner's release
	/// and this call.
	pub(crate) fn acquire_sync(&mut self, sync: SyncId, task: TaskId) {
		debug_assert!(
			self.syncs[&sync].is_free() || self.syncs[&sync].is_next_owner(task),
			"acquire of an object that is neither free nor designated"
		);

		match &mut self.syncs.get_mut(&sync).expect("sync object exists").state {
			SyncState::Ownership {
				owner,
				pending_new_owner,
				..
			} => {
				*owner = Some(task);
				*pending_new_owner = false;
			}
			SyncState::Notification { .. } => unreachable!("acquire of a notification object"),
		}
		self.tasks
			.get_mut(&task)
			.expect("acquiring task exists")
			.acquired
			.insert(0, sync);

		if let Some(&head) = self.syncs[&sync].waiters.front() {
			let head_prio = self.tasks[&head].prio;
			if head_prio > self.tasks[&task].prio {
				self.tasks
					.get_mut(&task)
					.expect("acquiring task exists")
					.prio = head_prio;
				trace!("Task {task} inherits priority {head_prio} on acquire");
				debug_assert!(head_prio > self.tasks[&task].base_prio);
			}
		}
	}

	/// Gives up ownership. With waiters, the queue head becomes the
	/// designated successor and is woken; it finalizes the transfer in
	/// [`Kernel::acquire_sync`] when it runs. Without waiters the object
	/// becomes free. Finally the releaser sheds any priority it no longer
	/// inherits.
	pub(crate) fn release_sync(&mut self, port: &dyn Port, sync: SyncId, task: TaskId) {
		debug_assert!(self.syncs[&sync].is_current_owner(task));

		let owner_task = self.tasks.get_mut(&task).expect("owning task exists");
		let position = owner_task
			.acquired
			.iter()
			.position(|s| *s == sync)
			.expect("owner holds the object");
		owner_task.acquired.remove(position);

		let successor = self.syncs[&sync].waiters.front().copied();
		match &mut self.syncs.get_mut(&sync).expect("sync object exists").state {
			SyncState::Ownership {
				owner,
				pending_new_owner,
				..
			} => match successor {
				Some(head) => {
					*owner = Some(head);
					*pending_new_owner = true;
				}
				None => *owner = None,
			},
			SyncState::Notification { .. } => unreachable!("release of a notification object"),
		}

		// shed inherited priority the releaser no longer deserves before the
		// successor is woken; the wakeup compares against the releaser's real
		// priority when it decides whether to request a forced switch
		let releaser = &self.tasks[&task];
		if releaser.prio > releaser.base_prio {
			debug_assert!(releaser.waiting_for.is_none());
			let new_prio = self.highest_inherited_priority(task);
			self.tasks.get_mut(&task).expect("owning task exists").prio = new_prio;
			trace!("Task {task} drops to priority {new_prio} on release");
		}

		if let Some(head) = successor {
			debug!("Task {head} is designated next owner of sync object {sync}");
			self.wake_task(port, head);
		}
	}

	/// Base priority of `task` raised by the head of the waiter queue of
	/// every ownership-flavour object it still owns.
	fn highest_inherited_priority(&self, task: TaskId) -> Priority {
		let owner = &self.tasks[&task];
		let mut new_prio = owner.base_prio;
		for sync in &owner.acquired {
			let object = &self.syncs[sync];
			debug_assert!(matches!(object.state, SyncState::Ownership { .. }));
			if let Some(head) = object.waiters.front() {
				let head_prio = self.tasks[head].prio;
				if head_prio > new_prio {
					new_prio = head_prio;
				}
			}
		}
		new_prio
	}

	/// Queues `task` on the object, then walks the ownership chain raising
	/// every owner whose effective priority is below the queueing task's.
	///
	/// Each hop follows one is-waiting-for edge, so the walk terminates; a
	/// cycle in that graph would be a deadlock the kernel does not detect.
	pub(crate) fn queue_for_sync(&mut self, sync: SyncId, task: TaskId) {
		debug_assert!(
			!self.syncs[&sync].is_free(),
			"queueing on a free ownership object"
		);
		debug_assert!(!self.syncs[&sync].is_current_owner(task));

		self.insert_waiter(sync, task);

		let prio = self.tasks[&task].prio;
		let mut sync = sync;
		while let Some(owner) = self.syncs[&sync].settled_owner() {
			if self.tasks[&owner].prio >= prio {
				break;
			}
			self.tasks.get_mut(&owner).expect("owner exists").prio = prio;
			trace!("Task {owner} inherits priority {prio}");

			match self.tasks[&owner].waiting_for {
				Some(blocked_on) => {
					// the owner's position in that queue is stale now
					self.remove_waiter(blocked_on, owner);
					self.insert_waiter(blocked_on, owner);
					sync = blocked_on;
				}
				None => break,
			}
		}
	}

	/// Removes `task` from the object's waiter queue, then walks the
	/// ownership chain dropping priority the owners were inheriting from
	/// the departing task.
	pub(crate) fn unqueue_from_sync(&mut self, sync: SyncId, task: TaskId) {
		debug_assert!(!self.syncs[&sync].is_current_owner(task));

		self.remove_waiter(sync, task);

		let departed_prio = self.tasks[&task].prio;
		let mut sync = sync;
		while let Some(owner) = self.syncs[&sync].settled_owner() {
			let owner_task = &self.tasks[&owner];
			// the owner can only have been inheriting from the departing
			// task if their effective priorities match
			if owner_task.prio <= owner_task.base_prio || owner_task.prio != departed_prio {
				break;
			}

			let new_prio = self.highest_inherited_priority(owner);
			debug_assert!(new_prio <= departed_prio);
			debug_assert!(new_prio >= self.tasks[&owner].base_prio);

			if new_prio != self.tasks[&owner].prio {
				self.tasks.get_mut(&owner).expect("owner exists").prio = new_prio;
				trace!("Task {owner} drops to priority {new_prio}");
				if let Some(blocked_on) = self.tasks[&owner].waiting_for {
					self.remove_waiter(blocked_on, owner);
					self.insert_waiter(blocked_on, owner);
					sync = blocked_on;
					continue;
				}
			}
			break;
		}
	}

	/// Wakes the highest-priority waiter of a notification object.
	pub(crate) fn notify_one_sync(&mut self, port: &dyn Port, sync: SyncId) {
		debug_assert!(matches!(
			self.syncs[&sync].state,
			SyncState::Notification { .. }
		));

		if let Some(&head) = self.syncs[&sync].waiters.front() {
			self.remove_waiter(sync, head);
			self.wake_task(port, head);
		}
	}

	/// Wakes every waiter of a notification object.
	pub(crate) fn notify_all_sync(&mut self, port: &dyn Port, sync: SyncId) {
		while self.syncs[&sync].waiters.front().is_some() {
			self.notify_one_sync(port, sync);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::scheduler::task::{Priority, Timeout};
	use crate::scheduler::test_util::{add, boot};

	#[test]
	fn waiters_are_sorted_by_priority_and_fifo_within_a_priority() {
		let (mut kernel, port) = boot();
		let x = kernel.create_sync_object(SyncObject::new_notification());
		let a = add(&mut kernel, &port, 50);
		let b = add(&mut kernel, &port, 100);
		let c = add(&mut kernel, &port, 50);
		let d = add(&mut kernel, &port, 200);

		for task in [a, b, c, d] {
			kernel.queue_for_sync(x, task);
		}

		let order: alloc::vec::Vec<_> = kernel.syncs[&x].waiters.iter().copied().collect();
		assert_eq!(order, [d, b, a, c]);
		for task in [a, b, c, d] {
			assert_eq!(kernel.tasks[&task].waiting_for, Some(x));
		}
	}

	#[test]
	fn classic_priority_inversion_is_bridged() {
		let (mut kernel, port) = boot();
		let l = add(&mut kernel, &port, 10);
		let m = add(&mut kernel, &port, 50);
		let h = add(&mut kernel, &port, 100);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		kernel.acquire_sync(x, l);

		kernel.queue_for_sync(x, h);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(100));
		assert_eq!(kernel.tasks[&l].base_prio, Priority::from(10));
		assert_eq!(kernel.tasks[&m].prio, Priority::from(50));

		crate::scheduler::test_util::park(&mut kernel, h, Timeout::INFINITE.into());
		kernel.release_sync(&port, x, l);

		// the releaser drops back, the waiter head is designated and woken
		assert_eq!(kernel.tasks[&l].prio, Priority::from(10));
		assert!(kernel.syncs[&x].is_next_owner(h));
		assert_eq!(kernel.tasks[&h].sleep_count, 0);

		// the successor finalizes the handoff when it runs
		kernel.unqueue_from_sync(x, h);
		kernel.acquire_sync(x, h);
		assert!(kernel.syncs[&x].is_current_owner(h));
		assert_eq!(kernel.tasks[&h].prio, Priority::from(100));
	}

	#[test]
	fn inheritance_propagates_transitively() {
		let (mut kernel, port) = boot();
		let l = add(&mut kernel, &port, 10);
		let m = add(&mut kernel, &port, 50);
		let h = add(&mut kernel, &port, 100);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		let y = kernel.create_sync_object(SyncObject::new_ownership());
		kernel.acquire_sync(x, l);
		kernel.acquire_sync(y, m);

		// M blocks on X (owned by L), H blocks on Y (owned by M)
		kernel.queue_for_sync(x, m);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(50));

		kernel.queue_for_sync(y, h);
		assert_eq!(kernel.tasks[&m].prio, Priority::from(100));
		// and through M's blocked-on edge down to L
		assert_eq!(kernel.tasks[&l].prio, Priority::from(100));

		// L releases X: M is designated, L drops all the way back
		kernel.release_sync(&port, x, l);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(10));
		assert!(kernel.syncs[&x].is_next_owner(m));

		kernel.unqueue_from_sync(x, m);
		kernel.acquire_sync(x, m);
		// M still inherits from H via Y
		assert_eq!(kernel.tasks[&m].prio, Priority::from(100));

		kernel.release_sync(&port, y, m);
		assert_eq!(kernel.tasks[&m].prio, Priority::from(50));
		assert!(kernel.syncs[&y].is_next_owner(h));
	}

	#[test]
	fn a_transitive_raise_resorts_the_owner_in_its_queue() {
		let (mut kernel, port) = boot();
		let a = add(&mut kernel, &port, 40);
		let b = add(&mut kernel, &port, 60);
		let h = add(&mut kernel, &port, 200);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		let y = kernel.create_sync_object(SyncObject::new_ownership());

		// A owns X and waits on Y behind B
		let owner_y = add(&mut kernel, &port, 80);
		kernel.acquire_sync(y, owner_y);
		kernel.acquire_sync(x, a);
		kernel.queue_for_sync(y, b);
		kernel.queue_for_sync(y, a);
		assert_eq!(
			kernel.syncs[&y].waiters.iter().copied().collect::<alloc::vec::Vec<_>>(),
			[b, a]
		);

		// H queues on X; A inherits 200 and must move ahead of B in Y's queue
		kernel.queue_for_sync(x, h);
		assert_eq!(kernel.tasks[&a].prio, Priority::from(200));
		assert_eq!(
			kernel.syncs[&y].waiters.iter().copied().collect::<alloc::vec::Vec<_>>(),
			[a, b]
		);
		// and Y's owner inherits through the chain
		assert_eq!(kernel.tasks[&owner_y].prio, Priority::from(200));
	}

	#[test]
	fn timing_out_drops_the_inherited_priority() {
		let (mut kernel, port) = boot();
		let l = add(&mut kernel, &port, 10);
		let h = add(&mut kernel, &port, 100);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		kernel.acquire_sync(x, l);
		kernel.queue_for_sync(x, h);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(100));

		// H gives up waiting
		kernel.unqueue_from_sync(x, h);

		assert_eq!(kernel.tasks[&l].prio, Priority::from(10));
		assert!(kernel.syncs[&x].waiters.is_empty());
		assert_eq!(kernel.tasks[&h].waiting_for, None);
		assert!(kernel.syncs[&x].is_current_owner(l));
	}

	#[test]
	fn unqueue_keeps_priority_inherited_from_a_remaining_waiter() {
		let (mut kernel, port) = boot();
		let l = add(&mut kernel, &port, 10);
		let m = add(&mut kernel, &port, 100);
		let h = add(&mut kernel, &port, 100);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		kernel.acquire_sync(x, l);
		kernel.queue_for_sync(x, m);
		kernel.queue_for_sync(x, h);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(100));

		// one equal-priority waiter leaves; the other still holds L up
		kernel.unqueue_from_sync(x, h);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(100));

		kernel.unqueue_from_sync(x, m);
		assert_eq!(kernel.tasks[&l].prio, Priority::from(10));
	}

	#[test]
	fn acquire_inherits_from_a_late_arrival() {
		let (mut kernel, port) = boot();
		let l = add(&mut kernel, &port, 10);
		let m = add(&mut kernel, &port, 50);
		let h = add(&mut kernel, &port, 100);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		kernel.acquire_sync(x, l);
		kernel.queue_for_sync(x, m);
		kernel.release_sync(&port, x, l);
		assert!(kernel.syncs[&x].is_next_owner(m));

		// H arrives inside the handoff window: it queues, it cannot steal
		kernel.queue_for_sync(x, h);
		assert!(kernel.syncs[&x].is_next_owner(m));
		assert_eq!(kernel.syncs[&x].waiters.front(), Some(&h));

		// M finalizes and immediately inherits from H
		kernel.unqueue_from_sync(x, m);
		kernel.acquire_sync(x, m);
		assert!(kernel.syncs[&x].is_current_owner(m));
		assert_eq!(kernel.tasks[&m].prio, Priority::from(100));
	}

	#[test]
	fn queueing_behind_a_pending_owner_does_not_raise_anyone() {
		let (mut kernel, port) = boot();
		let l = add(&mut kernel, &port, 10);
		let m = add(&mut kernel, &port, 50);
		let h = add(&mut kernel, &port, 100);

		let x = kernel.create_sync_object(SyncObject::new_ownership());
		kernel.acquire_sync(x, l);
		kernel.queue_for_sync(x, m);
		kernel.release_sync(&port, x, l);

		// the designated successor is not an owner yet; its priority is
		// fixed up when it finalizes, not now
		kernel.queue_for_sync(x, h);
		assert_eq!(kernel.tasks[&m].prio, Priority::from(50));
	}

	#[test]
	fn notify_wakes_in_priority_order() {
		let (mut kernel, port) = boot();
		let a = add(&mut kernel, &port, 50);
		let b = add(&mut kernel, &port, 100);

		let e = kernel.create_sync_object(SyncObject::new_notification());
		kernel.queue_for_sync(e, a);
		kernel.queue_for_sync(e, b);
		crate::scheduler::test_util::park(&mut kernel, a, Timeout::INFINITE.into());
		crate::scheduler::test_util::park(&mut kernel, b, Timeout::INFINITE.into());

		kernel.notify_one_sync(&port, e);
		assert_eq!(kernel.tasks[&b].sleep_count, 0);
		assert_eq!(kernel.tasks[&b].waiting_for, None);
		assert_ne!(kernel.tasks[&a].sleep_count, 0);

		kernel.notify_all_sync(&port, e);
		assert_eq!(kernel.tasks[&a].sleep_count, 0);
		assert!(kernel.syncs[&e].waiters.is_empty());
	}
}
