use thiserror::Error;

/// Errors returned by the public kernel API.
///
/// `Timeout` is an expected outcome of every timed wait, not a failure;
/// callers distinguish success from expiry by this code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// The kernel has not been initialized on this core.
	#[error("task switching is not initialized")]
	NotInitialized,
	/// An argument was out of range or otherwise unusable.
	#[error("invalid parameter")]
	InvalidParameter,
	/// The operation did not complete within the requested tick budget.
	#[error("operation timed out")]
	Timeout,
	/// The task ring is at its capacity of 255 user tasks.
	#[error("too many tasks")]
	TooManyTasks,
	/// The calling task is not the owner of the resource.
	#[error("resource is not owned by the calling task")]
	ResourceNotOwned,
}

pub type Result<T> = core::result::Result<T, Error>;
