//! The readiness primitive.
//!
//! Every engine iteration rebuilds one `PollSet` from the union of socket,
//! resolver and monitor descriptors, blocks in exactly one OS call, and
//! walks the results. The default backend is poll(2); the `select-backend`
//! cargo feature swaps in select(2) with identical observable behavior
//! (select caps descriptors at FD_SETSIZE, poll does not).

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::errno;

/// Wants read-readiness.
pub const WANT_READ: u8 = 0x1;
/// Wants write-readiness.
pub const WANT_WRITE: u8 = 0x2;

/// Readiness bits reported for one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Readiness(i16);

impl Readiness {
	pub fn readable(&self) -> bool {
		// POLLHUP counts as readable: read() must run to observe EOF
		self.0 & (libc::POLLIN | libc::POLLHUP) != 0
	}

	pub fn writable(&self) -> bool {
		self.0 & libc::POLLOUT != 0
	}

	pub fn error(&self) -> bool {
		self.0 & (libc::POLLERR | libc::POLLNVAL) != 0
	}
}

/// One iteration's descriptor set, tagged so results route back to their
/// owners (socket slot, resolver, monitor).
pub(crate) struct PollSet<T> {
	fds: Vec<libc::pollfd>,
	tags: Vec<T>,
}

impl<T: Copy> PollSet<T> {
	pub fn new() -> Self {
		Self {
			fds: Vec::new(),
			tags: Vec::new(),
		}
	}

	pub fn clear(&mut self) {
		self.fds.clear();
		self.tags.clear();
	}

	pub fn push(&mut self, fd: RawFd, interest: u8, tag: T) {
		let mut events: i16 = 0;
		if interest & WANT_READ != 0 {
			events |= libc::POLLIN;
		}
		if interest & WANT_WRITE != 0 {
			events |= libc::POLLOUT;
		}
		if events == 0 {
			return;
		}
		self.fds.push(libc::pollfd {
			fd,
			events,
			revents: 0,
		});
		self.tags.push(tag);
	}

	/// Iterates descriptors that came back with any readiness bits set.
	pub fn ready(&self) -> impl Iterator<Item = (T, Readiness)> + '_ {
		self.fds
			.iter()
			.zip(self.tags.iter())
			.filter(|(pfd, _)| pfd.revents != 0)
			.map(|(pfd, tag)| (*tag, Readiness(pfd.revents)))
	}

	/// Blocks until a descriptor is ready or the timeout elapses.
	///
	/// Returns the number of ready descriptors; 0 means timeout. EINTR is
	/// surfaced as `Interrupted` — callers treat it as "try again".
	#[cfg(not(feature = "select-backend"))]
	pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
		let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
		let rc = unsafe {
			libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
		};
		if rc == -1 {
			return Err(io::Error::from_raw_os_error(errno()));
		}
		Ok(rc as usize)
	}

	/// select(2) variant of [`PollSet::wait`].
	#[cfg(feature = "select-backend")]
	pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
		let mut rset: libc::fd_set = unsafe { std::mem::zeroed() };
		let mut wset: libc::fd_set = unsafe { std::mem::zeroed() };
		let mut eset: libc::fd_set = unsafe { std::mem::zeroed() };
		let mut maxfd: RawFd = -1;

		for pfd in &self.fds {
			if pfd.fd as usize >= libc::FD_SETSIZE as usize {
				return Err(io::Error::from_raw_os_error(libc::EINVAL));
			}
			unsafe {
				if pfd.events & libc::POLLIN != 0 {
					libc::FD_SET(pfd.fd, &mut rset);
				}
				if pfd.events & libc::POLLOUT != 0 {
					libc::FD_SET(pfd.fd, &mut wset);
				}
				libc::FD_SET(pfd.fd, &mut eset);
			}
			maxfd = maxfd.max(pfd.fd);
		}

		let mut tv = libc::timeval {
			tv_sec: timeout.as_secs().min(i64::MAX as u64) as libc::time_t,
			tv_usec: timeout.subsec_micros() as libc::suseconds_t,
		};
		let rc = unsafe {
			libc::select(maxfd + 1, &mut rset, &mut wset, &mut eset, &mut tv)
		};
		if rc == -1 {
			return Err(io::Error::from_raw_os_error(errno()));
		}

		// project the fd_set results back onto revents so ready() is shared
		let mut nready = 0usize;
		for pfd in &mut self.fds {
			pfd.revents = 0;
			unsafe {
				if libc::FD_ISSET(pfd.fd, &rset) {
					pfd.revents |= libc::POLLIN;
				}
				if libc::FD_ISSET(pfd.fd, &wset) {
					pfd.revents |= libc::POLLOUT;
				}
				if libc::FD_ISSET(pfd.fd, &eset) {
					pfd.revents |= libc::POLLERR;
				}
			}
			if pfd.revents != 0 {
				nready += 1;
			}
		}
		Ok(nready)
	}
}
