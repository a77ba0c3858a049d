//! Descriptor-level I/O: socket creation and options, the bounded read
//! path, the rate-shaped flush path, and the TLS record pump.

use std::io::{Read as _, Write as _};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::addr::SockAddr;
use crate::error::{IoError, SocketError, errno};
use crate::tls::FdIo;

use super::cfg::TcpCfg;
use super::conn::{Conn, ConnCtx};
use super::{ConnHandler, ConnState, DropReason, TMO_READ, TMO_WRITE};

/// Upper bound on one read dispatch; keeps a firehose peer from
/// monopolizing the iteration.
const BLOCKSIZE: usize = 4096;

// ============================================================================
// Socket creation and options
// ============================================================================

/// Creates a non-blocking stream socket for the given domain.
pub(crate) fn new_stream_socket(domain: libc::c_int) -> Result<OwnedFd, SocketError> {
	let fd = unsafe {
		libc::socket(
			domain,
			libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
			0,
		)
	};
	if fd == -1 {
		return Err(SocketError::Create { errno: errno() });
	}
	Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn setsockopt_int(
	fd: RawFd,
	level: libc::c_int,
	opt: libc::c_int,
	name: &'static str,
	val: libc::c_int,
) -> Result<(), SocketError> {
	let rc = unsafe {
		libc::setsockopt(
			fd,
			level,
			opt,
			&val as *const _ as *const libc::c_void,
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		)
	};
	if rc == -1 {
		Err(SocketError::SetOption {
			errno: errno(),
			option: name,
		})
	} else {
		Ok(())
	}
}

pub(crate) fn set_reuse_addr(fd: RawFd, enable: bool) -> Result<(), SocketError> {
	setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, "SO_REUSEADDR", enable as libc::c_int)
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, enable: bool) -> Result<(), SocketError> {
	setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, "TCP_NODELAY", enable as libc::c_int)
}

pub(crate) fn set_linger(fd: RawFd, seconds: Option<u32>) -> Result<(), SocketError> {
	let val = libc::linger {
		l_onoff: seconds.is_some() as libc::c_int,
		l_linger: seconds.unwrap_or(0) as libc::c_int,
	};
	let rc = unsafe {
		libc::setsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_LINGER,
			&val as *const _ as *const libc::c_void,
			std::mem::size_of::<libc::linger>() as libc::socklen_t,
		)
	};
	if rc == -1 {
		Err(SocketError::SetOption {
			errno: errno(),
			option: "SO_LINGER",
		})
	} else {
		Ok(())
	}
}

/// Applies the TCP options a config carries. Option failures are logged,
/// not fatal: a connection without TCP_NODELAY still works.
pub(crate) fn apply_tcp(fd: RawFd, tcp: &TcpCfg, name: &str) {
	if tcp.nodelay {
		if let Err(e) = set_tcp_nodelay(fd, true) {
			log::warn!("[{}] {}", name, e);
		}
	}
	if let Some(ka) = tcp.keepalive {
		let r = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, "SO_KEEPALIVE", 1)
			.and_then(|_| {
				setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, "TCP_KEEPIDLE", ka.idle_secs as libc::c_int)
			})
			.and_then(|_| {
				setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, "TCP_KEEPINTVL", ka.interval_secs as libc::c_int)
			})
			.and_then(|_| {
				setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, "TCP_KEEPCNT", ka.count as libc::c_int)
			});
		if let Err(e) = r {
			log::warn!("[{}] {}", name, e);
		}
	}
	if let Some(linger) = tcp.linger {
		if let Err(e) = set_linger(fd, linger) {
			log::warn!("[{}] {}", name, e);
		}
	}
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<(), SocketError> {
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
	if flags == -1 {
		return Err(SocketError::GetOption {
			errno: errno(),
			option: "F_GETFL",
		});
	}
	let new_flags = if nonblocking {
		flags | libc::O_NONBLOCK
	} else {
		flags & !libc::O_NONBLOCK
	};
	let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
	if rc == -1 {
		return Err(SocketError::SetOption {
			errno: errno(),
			option: "O_NONBLOCK",
		});
	}
	Ok(())
}

pub(crate) fn bind_fd(fd: RawFd, addr: &SockAddr) -> Result<(), SocketError> {
	let rc = addr.with_raw(|ptr, len| unsafe { libc::bind(fd, ptr, len) });
	if rc == -1 {
		Err(SocketError::Bind {
			errno: errno(),
			addr: addr.to_string(),
		})
	} else {
		Ok(())
	}
}

/// Issues a non-blocking connect. `Err(errno)` includes EINPROGRESS;
/// the caller decides which codes are in-flight versus fatal.
pub(crate) fn connect_fd(fd: RawFd, addr: &SockAddr) -> Result<(), i32> {
	let rc = addr.with_raw(|ptr, len| unsafe { libc::connect(fd, ptr, len) });
	if rc == -1 { Err(errno()) } else { Ok(()) }
}

/// Reads and clears the deferred connect error. Reading clears it — call
/// once per writability signal.
pub(crate) fn take_so_error(fd: RawFd) -> Result<i32, SocketError> {
	let mut error: libc::c_int = 0;
	let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
	let rc = unsafe {
		libc::getsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_ERROR,
			&mut error as *mut _ as *mut libc::c_void,
			&mut len,
		)
	};
	if rc == -1 {
		Err(SocketError::GetOption {
			errno: errno(),
			option: "SO_ERROR",
		})
	} else {
		Ok(error)
	}
}

/// Outcome of one accept probe.
pub(crate) enum AcceptOut {
	Conn(OwnedFd, SockAddr),
	WouldBlock,
	Retry,
	Err(i32),
}

/// Accepts one pending connection without blocking.
pub(crate) fn accept_one(fd: RawFd) -> AcceptOut {
	let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
	let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
	let new_fd = unsafe {
		libc::accept4(
			fd,
			&mut storage as *mut _ as *mut libc::sockaddr,
			&mut len,
			libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
		)
	};
	if new_fd == -1 {
		return match errno() {
			libc::EAGAIN => AcceptOut::WouldBlock,
			// aborted-before-accept peers are not listener failures
			libc::EINTR | libc::ECONNABORTED => AcceptOut::Retry,
			// descriptor pressure: stop accepting this iteration, the
			// listener itself is fine
			libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => AcceptOut::WouldBlock,
			e => AcceptOut::Err(e),
		};
	}
	let owned = unsafe { OwnedFd::from_raw_fd(new_fd) };
	match unsafe { SockAddr::from_storage(&storage, len) } {
		Some(addr) => AcceptOut::Conn(owned, addr),
		None => AcceptOut::Retry,
	}
}

// ============================================================================
// Dispatch paths
// ============================================================================

/// Fires the overflow event when the unterminated tail crosses the
/// threshold; re-arms only once the tail has shrunk back under it, so
/// repeated checks without new input fire at most once.
pub(crate) fn check_overflow(ctx: &mut ConnCtx, handler: &mut dyn ConnHandler) {
	if ctx.max_buffer == 0 {
		return;
	}
	if ctx.line.tail_len() > ctx.max_buffer {
		if !ctx.overflow_fired {
			ctx.overflow_fired = true;
			handler.on_reached_max_buffer(ctx);
		}
	} else {
		ctx.overflow_fired = false;
	}
}

impl Conn {
	/// Hands freshly-read bytes to the handler: lines first (when line
	/// mode is on and reads are not paused), then the raw chunk, then
	/// the backpressure check.
	pub(crate) fn deliver(&mut self, now_ms: u64, data: &[u8]) {
		let Conn { ctx, handler, .. } = self;
		ctx.bytes_read += data.len() as u64;
		ctx.touch(TMO_READ, now_ms);
		if ctx.line_mode {
			ctx.line.push(data);
			if !ctx.read_paused {
				while let Some(line) = ctx.line.next_line() {
					handler.on_read_line(ctx, &line);
				}
				ctx.line.mark_scanned();
			}
		}
		handler.on_read_data(ctx, data);
		check_overflow(ctx, handler.as_mut());
	}

	/// One bounded read dispatch. `Some(reason)` dooms the socket.
	pub(crate) fn handle_readable(&mut self, now_ms: u64) -> Option<DropReason> {
		if self.ctx.tls.is_some() {
			return self.pump_tls(now_ms, true);
		}
		let Some(fd) = self.ctx.read_fd() else {
			return Some(DropReason::Eof);
		};
		let mut buf = [0u8; BLOCKSIZE];
		let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
		match n {
			0 => Some(DropReason::Eof),
			-1 => match errno() {
				libc::EAGAIN | libc::EINTR => None,
				libc::ECONNREFUSED => Some(DropReason::Refused),
				libc::ETIMEDOUT => Some(DropReason::TimedOut),
				e => {
					log::debug!("[{}] {}", self.ctx.name, IoError::Read { errno: e });
					Some(DropReason::SockErr(e))
				}
			},
			n => {
				self.deliver(now_ms, &buf[..n as usize]);
				None
			}
		}
	}

	/// One flush dispatch on writability. `Some(reason)` dooms the socket.
	pub(crate) fn flush_writable(&mut self, now_ms: u64) -> Option<DropReason> {
		match self.ctx.state {
			ConnState::ConnectTls => return self.pump_tls(now_ms, false),
			ConnState::Established => {}
			_ => return None,
		}
		if self.ctx.tls.is_some() {
			self.stage_tls_plaintext(now_ms);
			return self.pump_tls(now_ms, false);
		}

		if self.ctx.out.is_empty() {
			return None;
		}
		let Some(fd) = self.ctx.write_fd() else {
			return Some(DropReason::Eof);
		};
		let allow = self.ctx.rate.take(now_ms, self.ctx.out.len());
		if allow == 0 {
			return None;
		}
		let n = unsafe {
			libc::write(fd, self.ctx.out.as_ptr() as *const libc::c_void, allow)
		};
		match n {
			-1 => match errno() {
				libc::EAGAIN | libc::EINTR => None,
				libc::ECONNREFUSED => Some(DropReason::Refused),
				e => {
					log::debug!("[{}] {}", self.ctx.name, IoError::Write { errno: e });
					Some(DropReason::SockErr(e))
				}
			},
			n => {
				self.ctx.out.drain(..n as usize);
				self.ctx.bytes_written += n as u64;
				self.ctx.touch(TMO_WRITE, now_ms);
				None
			}
		}
	}

	/// Moves rate-shaped plaintext from the pending buffer into the TLS
	/// session. Only runs once established: handshake traffic is the
	/// session's own and is never shaped.
	fn stage_tls_plaintext(&mut self, now_ms: u64) {
		if self.ctx.out.is_empty() {
			return;
		}
		let allow = self.ctx.rate.take(now_ms, self.ctx.out.len());
		if allow == 0 {
			return;
		}
		let ts = self.ctx.tls.as_mut().expect("caller checked tls");
		match ts.session.writer().write(&self.ctx.out[..allow]) {
			Ok(n) if n > 0 => {
				self.ctx.out.drain(..n);
				self.ctx.bytes_written += n as u64;
				self.ctx.touch(TMO_WRITE, now_ms);
			}
			_ => {}
		}
	}

	/// Drives the TLS record layer: read ciphertext (when signalled),
	/// surface plaintext, flush whatever the session wants written, and
	/// detect handshake completion.
	pub(crate) fn pump_tls(&mut self, now_ms: u64, readable: bool) -> Option<DropReason> {
		let Some(fd) = self.ctx.read_fd() else {
			return Some(DropReason::Eof);
		};
		let mut plaintext: Vec<u8> = Vec::new();
		let mut result: Option<DropReason> = None;
		let mut peer_closed = false;

		{
			let ts = self.ctx.tls.as_mut().expect("pump_tls without session");
			let mut io = FdIo { fd };

			if readable {
				loop {
					match ts.session.read_tls(&mut io) {
						Ok(0) => {
							peer_closed = true;
							break;
						}
						Ok(_) => match ts.session.process_new_packets() {
							Ok(state) => {
								let n = state.plaintext_bytes_to_read();
								if n > 0 {
									let start = plaintext.len();
									plaintext.resize(start + n, 0);
									let mut got = 0;
									while got < n {
										match ts.session.reader().read(&mut plaintext[start + got..]) {
											Ok(0) => break,
											Ok(m) => got += m,
											Err(_) => break,
										}
									}
									plaintext.truncate(start + got);
								}
								if state.peer_has_closed() {
									peer_closed = true;
									break;
								}
							}
							Err(e) => {
								log::warn!("[{}] tls record error: {}", self.ctx.name, e);
								result = Some(DropReason::SockErr(libc::EPROTO));
								break;
							}
						},
						Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
						Err(e) if e.kind() == std::io::ErrorKind::Interrupted => break,
						Err(e) => {
							result = Some(match e.raw_os_error() {
								Some(libc::ECONNREFUSED) => DropReason::Refused,
								Some(code) => DropReason::SockErr(code),
								None => DropReason::SockErr(libc::EIO),
							});
							break;
						}
					}
				}
			}

			if result.is_none() {
				while ts.session.wants_write() {
					match ts.session.write_tls(&mut io) {
						Ok(_) => {}
						Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
						Err(e) if e.kind() == std::io::ErrorKind::Interrupted => break,
						Err(e) => {
							result = Some(match e.raw_os_error() {
								Some(libc::ECONNREFUSED) => DropReason::Refused,
								Some(code) => DropReason::SockErr(code),
								None => DropReason::SockErr(libc::EIO),
							});
							break;
						}
					}
				}
			}
		}

		if !plaintext.is_empty() {
			self.deliver(now_ms, &plaintext);
		}

		if result.is_none() && self.ctx.state == ConnState::ConnectTls {
			let ts = self.ctx.tls.as_mut().expect("pump_tls without session");
			if !ts.session.is_handshaking() {
				ts.established = true;
				self.enter_established(now_ms);
			}
		}

		if result.is_none() && peer_closed {
			result = Some(DropReason::Eof);
		}
		result
	}

	/// Best-effort close_notify for an owner-initiated teardown, so the
	/// peer sees a clean TLS close instead of a truncation.
	pub(crate) fn shutdown_tls(&mut self) {
		let Some(fd) = self.ctx.read_fd() else {
			return;
		};
		if let Some(ts) = self.ctx.tls.as_mut() {
			if !ts.established {
				return;
			}
			ts.session.send_close_notify();
			let mut io = FdIo { fd };
			while ts.session.wants_write() {
				if ts.session.write_tls(&mut io).is_err() {
					break;
				}
			}
		}
	}

	/// True when nothing is waiting to go out: the close-after-flush
	/// gate. TLS counts its pending ciphertext.
	pub(crate) fn out_drained(&self) -> bool {
		if !self.ctx.out.is_empty() {
			return false;
		}
		match &self.ctx.tls {
			Some(ts) => !ts.session.wants_write(),
			None => true,
		}
	}
}
