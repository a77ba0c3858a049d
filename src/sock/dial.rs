//! Outbound establishment: one state-machine step per engine iteration.
//!
//! DNS states never block — the resolver answers Retry and the socket
//! stays put until a later iteration. The connect itself is issued the
//! moment the destination resolves (inside the DNS step), so the
//! `Connect` state only completes or fails what is already in flight.

use std::os::fd::AsRawFd;

use crate::addr::{Family, SockAddr};
use crate::error::ResolveError;
use crate::resolve::{Resolve, Resolver};
use crate::tls::{TlsSession, build_client_config};

use super::conn::{Conn, TlsState};
use super::io;
use super::{ConnState, DropReason, Role};

/// Outcome of one establishment step.
pub(crate) enum Step {
	/// Still progressing (or waiting); keep the socket.
	Keep,
	/// Terminal failure; fire the matching callback and remove.
	Fail(DropReason),
}

/// Bind attempts before the connection fails permanently.
const MAX_BIND_ATTEMPTS: u8 = 3;

impl Conn {
	/// Advances a pre-connect outbound socket one step.
	pub(crate) fn advance(&mut self, resolver: &mut dyn Resolver, now_ms: u64) -> Step {
		if self.ctx.role != Role::Outbound {
			return Step::Keep;
		}
		match self.ctx.state {
			ConnState::Start => self.step_start(resolver),
			ConnState::BindVhost => self.step_bind(),
			ConnState::DestDns => self.step_dns(resolver, now_ms),
			// Connect and ConnectTls are driven by readiness events
			_ => Step::Keep,
		}
	}

	/// Start: resolve the vhost, or skip straight to destination DNS.
	fn step_start(&mut self, resolver: &mut dyn Resolver) -> Step {
		if self.ctx.bind_host.is_empty() {
			self.ctx.set_state(ConnState::DestDns);
			return Step::Keep;
		}
		let bind_host = self.ctx.bind_host.clone();
		match resolver.resolve(&bind_host, self.ctx.family) {
			Resolve::Ready(ip) => {
				self.ctx.bind_addr = Some(SockAddr::new(ip, 0));
				self.ctx.set_state(ConnState::BindVhost);
				Step::Keep
			}
			Resolve::Retry => Step::Keep,
			Resolve::Failed(code) => {
				log::warn!(
					"[{}] {}",
					self.ctx.name,
					ResolveError::Failed {
						host: bind_host,
						code
					}
				);
				Step::Fail(DropReason::SockErr(libc::EADDRNOTAVAIL))
			}
		}
	}

	/// BindVhost: create the socket and bind the vhost, with capped retry.
	fn step_bind(&mut self) -> Step {
		let bind_addr = match self.ctx.bind_addr {
			Some(a) => a,
			None => return Step::Fail(DropReason::SockErr(libc::EINVAL)),
		};
		let fd = match io::new_stream_socket(bind_addr.domain()) {
			Ok(fd) => fd,
			Err(e) => {
				log::warn!("[{}] {}", self.ctx.name, e);
				return Step::Fail(DropReason::SockErr(e.os_errno()));
			}
		};
		io::apply_tcp(fd.as_raw_fd(), &self.ctx.tcp, &self.ctx.name);
		match io::bind_fd(fd.as_raw_fd(), &bind_addr) {
			Ok(()) => {
				self.ctx.rfd = Some(fd);
				// the bound socket pins the family for destination DNS
				self.ctx.family = if bind_addr.is_ipv6() {
					Family::V6Only
				} else {
					Family::V4Only
				};
				self.ctx.set_state(ConnState::DestDns);
				Step::Keep
			}
			Err(e) => {
				self.ctx.bind_attempts += 1;
				log::warn!(
					"[{}] bind attempt {}/{}: {}",
					self.ctx.name,
					self.ctx.bind_attempts,
					MAX_BIND_ATTEMPTS,
					e
				);
				if self.ctx.bind_attempts >= MAX_BIND_ATTEMPTS {
					Step::Fail(DropReason::SockErr(e.os_errno()))
				} else {
					Step::Keep
				}
			}
		}
	}

	/// DestDns: resolve the destination, then start the connect right
	/// away — the generic Connect state only finishes it.
	fn step_dns(&mut self, resolver: &mut dyn Resolver, now_ms: u64) -> Step {
		let family = if self.ctx.v4_fallback_done {
			Family::V4Only
		} else {
			self.ctx.family
		};
		let host = self.ctx.host.clone();
		let ip = match resolver.resolve(&host, family) {
			Resolve::Ready(ip) => ip,
			Resolve::Retry => return Step::Keep,
			Resolve::Failed(code) => {
				log::warn!(
					"[{}] {}",
					self.ctx.name,
					ResolveError::Failed { host, code }
				);
				return Step::Fail(DropReason::SockErr(libc::EADDRNOTAVAIL));
			}
		};

		let addr = SockAddr::new(ip, self.ctx.port);
		self.ctx.resolved = Some(addr);

		// a vhost bind already produced the socket; create one otherwise
		if self.ctx.rfd.is_none() {
			match io::new_stream_socket(addr.domain()) {
				Ok(fd) => {
					io::apply_tcp(fd.as_raw_fd(), &self.ctx.tcp, &self.ctx.name);
					self.ctx.rfd = Some(fd);
				}
				Err(e) => {
					log::warn!("[{}] {}", self.ctx.name, e);
					return Step::Fail(DropReason::SockErr(e.os_errno()));
				}
			}
		}

		let fd = self.ctx.read_fd().expect("socket just created");
		match io::connect_fd(fd, &addr) {
			Ok(()) => {
				// immediate completion; loopback does this
				self.ctx.remote = Some(addr);
				self.finish_into_session(now_ms)
			}
			Err(libc::EINPROGRESS) => {
				self.ctx.set_state(ConnState::Connect);
				Step::Keep
			}
			Err(libc::ENETUNREACH) if self.can_fall_back() => {
				self.ctx.reset_for_v4_fallback();
				Step::Keep
			}
			Err(libc::ECONNREFUSED) => Step::Fail(DropReason::Refused),
			Err(e) => Step::Fail(DropReason::SockErr(e)),
		}
	}

	/// Completes a connect the readiness loop reported writable.
	pub(crate) fn finish_connect(&mut self, now_ms: u64) -> Option<DropReason> {
		let Some(fd) = self.ctx.read_fd() else {
			return Some(DropReason::SockErr(libc::EBADF));
		};
		match io::take_so_error(fd) {
			Err(e) => Some(DropReason::SockErr(e.os_errno())),
			Ok(0) => {
				self.ctx.remote = self.ctx.resolved;
				match self.finish_into_session(now_ms) {
					Step::Keep => None,
					Step::Fail(reason) => Some(reason),
				}
			}
			Ok(libc::ECONNREFUSED) => Some(DropReason::Refused),
			Ok(libc::ENETUNREACH) if self.can_fall_back() => {
				self.ctx.reset_for_v4_fallback();
				None
			}
			Ok(code) => Some(DropReason::SockErr(code)),
		}
	}

	/// The TCP leg is up: either hand over to the TLS handshake or go
	/// straight to Established.
	fn finish_into_session(&mut self, now_ms: u64) -> Step {
		if self.ctx.tls_connect.is_none() {
			self.enter_established(now_ms);
			return Step::Keep;
		}
		let cfg = self.ctx.tls_connect.clone().expect("checked above");
		let session = build_client_config(&cfg)
			.and_then(|config| TlsSession::client(config, &self.ctx.host, &cfg));
		match session {
			Ok(session) => {
				self.ctx.tls = Some(TlsState {
					session,
					established: false,
				});
				self.ctx.set_state(ConnState::ConnectTls);
				Step::Keep
			}
			Err(e) => {
				log::warn!("[{}] {}", self.ctx.name, e);
				Step::Fail(DropReason::SockErr(libc::EPROTO))
			}
		}
	}

	/// The documented fallback: only when the preference was `Any`, the
	/// answer was IPv6, and no fallback has run for this attempt yet.
	fn can_fall_back(&self) -> bool {
		!self.ctx.v4_fallback_done
			&& self.ctx.family == Family::Any
			&& self.ctx.resolved.is_some_and(|a| a.is_ipv6())
	}
}
