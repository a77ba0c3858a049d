//! Foreign descriptor monitors.
//!
//! A socket may own descriptors the engine did not create (a child
//! process pipe, a library's wakeup fd) and still want them serviced by
//! the same poll call. A monitor contributes descriptors to each
//! iteration's set and gets its readiness routed back.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::poll::Readiness;

pub trait FdMonitor {
	/// Appends (fd, interest) pairs for this iteration. Interest is a mask
	/// of [`WANT_READ`](crate::WANT_READ) / [`WANT_WRITE`](crate::WANT_WRITE).
	fn fds(&mut self, out: &mut Vec<(RawFd, u8)>);

	/// Called for each of this monitor's descriptors that reported
	/// readiness. Return `false` to detach the monitor; its owner removes
	/// it before the next iteration.
	fn ready(&mut self, fd: RawFd, readiness: Readiness) -> bool;

	/// Upper bound this monitor wants on the poll timeout.
	fn max_wait(&self) -> Option<Duration> {
		None
	}
}
