//! The socket multiplexer: owns every connection, polls once per
//! iteration, and routes readiness back through each socket's state
//! machine and callbacks.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::addr::SockAddr;
use crate::clock;
use crate::cron::MuxCron;
use crate::error::{ResolveError, SocketError, errno};
use crate::poll::{PollSet, WANT_READ, WANT_WRITE};
use crate::resolve::{BlockingResolver, Resolve, Resolver, ThreadedResolver};
use crate::sock::io::{self, AcceptOut};
use crate::sock::{
	CloseIntent, Conn, ConnCtx, ConnHandler, ConnState, ConnectCfg, DropReason, ListenCfg,
	NullHandler, Role, Step, TMO_ACCEPT, TlsState,
};
use crate::tls::{TlsSession, build_server_config};

/// Where a readiness result routes.
#[derive(Debug, Clone, Copy)]
enum Tag {
	Conn(usize),
	Resolver,
	Monitor { conn: usize, mon: usize, fd: RawFd },
}

/// The engine. Single-threaded and cooperative: the owner drives it by
/// calling [`Mux::loop_once`] (or the dynamic variant) from its own run
/// loop; exactly one OS call blocks per iteration.
pub struct Mux {
	conns: Vec<Conn>,
	crons: Vec<MuxCron>,
	resolver: Box<dyn Resolver>,
	select_wait: Duration,
	last_sweep_ms: u64,
	pollset: PollSet<Tag>,
}

impl Default for Mux {
	fn default() -> Self {
		Self::new()
	}
}

impl Mux {
	/// An engine with the threaded resolver (falling back to blocking
	/// lookups if the worker cannot be spawned).
	pub fn new() -> Self {
		let resolver: Box<dyn Resolver> = match ThreadedResolver::new() {
			Ok(r) => Box::new(r),
			Err(e) => {
				log::warn!("threaded resolver unavailable ({}), lookups will block", e);
				Box::new(BlockingResolver::new())
			}
		};
		Self::with_resolver(resolver)
	}

	/// An engine with a caller-provided resolution strategy.
	pub fn with_resolver(resolver: Box<dyn Resolver>) -> Self {
		Self {
			conns: Vec::new(),
			crons: Vec::new(),
			resolver,
			select_wait: Duration::from_millis(100),
			last_sweep_ms: clock::now_ms(),
			pollset: PollSet::new(),
		}
	}

	/// Poll timeout for the fixed-interval loop. Default: 100 ms.
	pub fn set_select_wait(&mut self, wait: Duration) {
		self.select_wait = wait;
	}

	// ------------------------------------------------------------------
	// Connection surface
	// ------------------------------------------------------------------

	/// Enqueues an outbound connection. Nothing blocks here; progress
	/// and failure both surface through the handler's callbacks.
	pub fn connect(&mut self, cfg: ConnectCfg, handler: Box<dyn ConnHandler>) {
		log::debug!("connect {} -> {}:{}", cfg.name, cfg.host, cfg.port);
		self.conns.push(Conn::outbound(cfg, handler));
	}

	/// Binds and starts a listener immediately, returning the bound
	/// port — meaningful when port 0 requested an ephemeral one.
	///
	/// Bind-host resolution may block briefly; listeners are set up at
	/// configuration time where that is tolerated.
	pub fn listen(
		&mut self,
		cfg: ListenCfg,
		handler: Box<dyn ConnHandler>,
	) -> std::io::Result<u16> {
		let server_config = match &cfg.tls {
			Some(tls) => Some(build_server_config(tls)?),
			None => None,
		};

		let addr = if cfg.bind_host.is_empty() {
			SockAddr::wildcard(cfg.family, cfg.port)
		} else {
			let mut blocking = BlockingResolver::new();
			match blocking.resolve(&cfg.bind_host, cfg.family) {
				Resolve::Ready(ip) => SockAddr::new(ip, cfg.port),
				Resolve::Retry | Resolve::Failed(_) => {
					return Err(ResolveError::Failed {
						host: cfg.bind_host.clone(),
						code: libc::EAI_NONAME,
					}
					.into());
				}
			}
		};

		let fd = io::new_stream_socket(addr.domain())?;
		if cfg.reuse_addr {
			io::set_reuse_addr(fd.as_raw_fd(), true)?;
		}
		io::bind_fd(fd.as_raw_fd(), &addr)?;
		let rc = unsafe { libc::listen(fd.as_raw_fd(), cfg.max_conns) };
		if rc == -1 {
			return Err(SocketError::Listen {
				errno: errno(),
				backlog: cfg.max_conns,
			}
			.into());
		}

		let conn = Conn::listener(&cfg, fd, server_config, handler);
		let port = conn.ctx().local_port().unwrap_or(cfg.port);
		log::debug!("[{}] listening on {} (port {})", conn.ctx().name(), addr, port);
		self.conns.push(conn);
		Ok(port)
	}

	/// Adopts a pre-built socket, e.g. one wrapping subprocess pipes
	/// ([`Conn::from_fds`]) or the replacement half of a swap.
	pub fn add_conn(&mut self, conn: Conn) {
		self.conns.push(conn);
	}

	pub fn len(&self) -> usize {
		self.conns.len()
	}

	pub fn is_empty(&self) -> bool {
		self.conns.is_empty()
	}

	pub fn has_conn(&self, name: &str) -> bool {
		self.conns.iter().any(|c| c.ctx().name() == name)
	}

	/// Mutable access to the first socket with this name.
	pub fn ctx_by_name(&mut self, name: &str) -> Option<&mut ConnCtx> {
		self.conns
			.iter_mut()
			.find(|c| c.ctx().name() == name)
			.map(|c| c.ctx_mut())
	}

	/// Replaces a socket in place. `build` receives the old context —
	/// typically to [`ConnCtx::take_fd`] the descriptor into the
	/// replacement — and the old socket is detached: no callbacks fire
	/// for it and it cannot close a descriptor it no longer owns.
	pub fn swap<F>(&mut self, name: &str, build: F) -> bool
	where
		F: FnOnce(&mut ConnCtx) -> Conn,
	{
		let Some(idx) = self.conns.iter().position(|c| c.ctx().name() == name) else {
			return false;
		};
		let mut replacement = build(self.conns[idx].ctx_mut());
		std::mem::swap(&mut self.conns[idx], &mut replacement);
		let mut old = replacement;
		old.ctx_mut().close(CloseIntent::Detach);
		// detached teardown: silent by definition
		drop(old);
		true
	}

	// ------------------------------------------------------------------
	// Cron surface
	// ------------------------------------------------------------------

	/// Attaches a multiplexer-level job.
	pub fn add_cron(&mut self, cron: MuxCron) {
		self.crons.push(cron);
	}

	/// Stops and removes multiplexer-level jobs by name.
	pub fn del_cron(&mut self, name: &str) {
		self.crons.retain_mut(|c| {
			if c.timer.name() == name {
				c.timer.stop();
				false
			} else {
				true
			}
		});
	}

	// ------------------------------------------------------------------
	// The loop
	// ------------------------------------------------------------------

	/// Advances the engine exactly one iteration with the fixed poll
	/// timeout.
	pub fn loop_once(&mut self) {
		self.run_iteration(self.select_wait);
	}

	/// One iteration whose poll timeout is computed from the earliest
	/// known future event (next cron, next timeout sweep, rate-limit
	/// window), clamped into `[lower, upper]`.
	pub fn dynamic_loop_once(&mut self, lower: Duration, upper: Duration) {
		let timeout = self.dynamic_timeout(lower, upper);
		self.run_iteration(timeout);
	}

	fn dynamic_timeout(&self, lower: Duration, upper: Duration) -> Duration {
		let now = clock::now_ms();
		let mut earliest: Option<u64> = None;
		let mut fold = |t: u64, earliest: &mut Option<u64>| {
			*earliest = Some(earliest.map_or(t, |e| e.min(t)));
		};
		fold(self.last_sweep_ms + 1000, &mut earliest);
		for cron in &self.crons {
			if let Some(t) = cron.timer.next_due_ms() {
				fold(t, &mut earliest);
			}
		}
		for conn in &self.conns {
			if let Some(t) = conn.next_due_ms() {
				fold(t, &mut earliest);
			}
		}
		let wait = earliest.map_or(upper, |t| Duration::from_millis(t.saturating_sub(now)));
		wait.clamp(lower, upper)
	}

	fn run_iteration(&mut self, max_wait: Duration) {
		let now = clock::now_ms();

		// 1. consume close intents, reap sockets doomed last iteration
		self.reap();

		// 2. advance establishment state machines
		for idx in 0..self.conns.len() {
			if self.conns[idx].dead {
				continue;
			}
			if let Step::Fail(reason) = self.conns[idx].advance(self.resolver.as_mut(), now) {
				self.doom(idx, reason);
			}
		}

		// resumed readers re-deliver lines buffered while paused
		for conn in &mut self.conns {
			if !conn.dead && conn.ctx().rescan_pending {
				conn.drain_pending_lines();
			}
		}

		// 3. build the descriptor set: sockets, monitors, resolver
		let mut max_wait = max_wait;
		self.pollset.clear();
		for idx in 0..self.conns.len() {
			let conn = &mut self.conns[idx];
			if conn.dead {
				continue;
			}
			let interest = conn.ctx().interest();
			if interest != 0 {
				if let Some(rfd) = conn.ctx().read_fd() {
					let wfd = conn.ctx().write_fd().unwrap_or(rfd);
					if wfd != rfd {
						// pipe-backed pair: split interest across both
						if interest & WANT_READ != 0 {
							self.pollset.push(rfd, WANT_READ, Tag::Conn(idx));
						}
						if interest & WANT_WRITE != 0 {
							self.pollset.push(wfd, WANT_WRITE, Tag::Conn(idx));
						}
					} else {
						self.pollset.push(rfd, interest, Tag::Conn(idx));
					}
				}
			}
			let mut mon_fds: Vec<(RawFd, u8)> = Vec::new();
			for midx in 0..conn.ctx_mut().monitors.len() {
				mon_fds.clear();
				let mon = &mut conn.ctx_mut().monitors[midx];
				mon.fds(&mut mon_fds);
				if let Some(w) = mon.max_wait() {
					max_wait = max_wait.min(w);
				}
				for &(fd, want) in &mon_fds {
					self.pollset.push(
						fd,
						want,
						Tag::Monitor {
							conn: idx,
							mon: midx,
							fd,
						},
					);
				}
			}
		}
		let mut resolver_fds: Vec<(RawFd, u8)> = Vec::new();
		self.resolver.fill(&mut resolver_fds);
		for (fd, want) in resolver_fds {
			self.pollset.push(fd, want, Tag::Resolver);
		}
		if let Some(w) = self.resolver.max_wait() {
			max_wait = max_wait.min(w);
		}

		// 4. the one blocking call
		match self.pollset.wait(max_wait) {
			Ok(_) => {}
			Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
			Err(e) => log::warn!("poll failed: {}", e),
		}

		// 5. dispatch in collection order
		let events: Vec<_> = self.pollset.ready().collect();
		let mut dead_monitors: Vec<(usize, usize)> = Vec::new();
		for (tag, readiness) in events {
			match tag {
				Tag::Resolver => self.resolver.on_ready(),
				Tag::Monitor { conn, mon, fd } => {
					if self.conns[conn].dead {
						continue;
					}
					let keep = self.conns[conn].ctx_mut().monitors[mon].ready(fd, readiness);
					if !keep && !dead_monitors.contains(&(conn, mon)) {
						dead_monitors.push((conn, mon));
					}
				}
				Tag::Conn(idx) => self.dispatch_conn(idx, readiness, now),
			}
		}
		dead_monitors.sort_by(|a, b| b.cmp(a));
		for (conn, mon) in dead_monitors {
			self.conns[conn].ctx_mut().monitors.remove(mon);
		}

		// 6. once per second, sweep inactivity timeouts
		if now.saturating_sub(self.last_sweep_ms) >= 1000 {
			self.last_sweep_ms = now;
			self.sweep_timeouts(now);
		}

		// 7. tick jobs: multiplexer level, then per socket
		let mut crons = std::mem::take(&mut self.crons);
		for cron in &mut crons {
			cron.tick(now);
		}
		crons.retain(|c| c.timer.is_active());
		crons.append(&mut self.crons);
		self.crons = crons;

		for conn in &mut self.conns {
			if !conn.dead {
				conn.tick_crons(now);
			}
		}
	}

	fn dispatch_conn(&mut self, idx: usize, readiness: crate::poll::Readiness, now: u64) {
		if self.conns[idx].dead {
			return;
		}

		// a connect in flight resolves on writability or error
		if self.conns[idx].ctx().state() == ConnState::Connect {
			if readiness.writable() || readiness.error() {
				if let Some(reason) = self.conns[idx].finish_connect(now) {
					self.doom(idx, reason);
				}
			}
			return;
		}

		// errors with no data direction still need a read to surface errno
		let readable = readiness.readable() || readiness.error();

		if self.conns[idx].ctx().role() == Role::Listener {
			if readable {
				self.accept_ready(idx, now);
			}
			return;
		}

		if readiness.writable() {
			if let Some(reason) = self.conns[idx].flush_writable(now) {
				self.doom(idx, reason);
				return;
			}
		}
		if readable && !self.conns[idx].dead {
			if let Some(reason) = self.conns[idx].handle_readable(now) {
				self.doom(idx, reason);
			}
		}
	}

	/// Drains the accept queue of a readable listener.
	fn accept_ready(&mut self, idx: usize, now: u64) {
		loop {
			let Some(lfd) = self.conns[idx].ctx().read_fd() else {
				return;
			};
			match io::accept_one(lfd) {
				AcceptOut::WouldBlock => return,
				AcceptOut::Retry => continue,
				AcceptOut::Err(e) => {
					log::warn!(
						"[{}] {}",
						self.conns[idx].ctx().name(),
						SocketError::Accept { errno: e }
					);
					self.doom(idx, DropReason::SockErr(e));
					return;
				}
				AcceptOut::Conn(fd, peer) => {
					let listener = &mut self.conns[idx];
					listener.ctx_mut().touch(TMO_ACCEPT, now);
					let host = peer.ip().to_string();
					if !listener.handler.on_connection_from(&host, peer.port()) {
						log::debug!(
							"[{}] rejected connection from {}",
							listener.ctx().name(),
							peer
						);
						continue;
					}
					let handler = listener
						.handler
						.on_accept(&host, peer.port())
						.unwrap_or_else(|| Box::new(NullHandler));
					let name = format!("{}/{}", listener.ctx().name(), peer);
					io::apply_tcp(fd.as_raw_fd(), &listener.ctx().tcp, &name);
					let mut conn = Conn::inbound(&name, fd, peer, listener.ctx(), handler);
					if let Some(config) = listener.ctx().tls_server_config.clone() {
						match TlsSession::server(config) {
							Ok(session) => {
								conn.ctx_mut().tls = Some(TlsState {
									session,
									established: false,
								});
							}
							Err(e) => {
								log::warn!("[{}] {}", name, e);
								continue;
							}
						}
					}
					log::debug!("[{}] accepted {}", self.conns[idx].ctx().name(), peer);
					let plain = conn.ctx().state() == ConnState::Established;
					if plain {
						conn.enter_established(now);
					}
					self.conns.push(conn);
				}
			}
		}
	}

	fn sweep_timeouts(&mut self, now: u64) {
		for idx in 0..self.conns.len() {
			if self.conns[idx].dead {
				continue;
			}
			if self.conns[idx].ctx().is_read_paused() {
				let conn = &mut self.conns[idx];
				let Conn { ctx, handler, .. } = conn;
				handler.on_read_paused(ctx);
			}
			if self.conns[idx].ctx_mut().timed_out(now) {
				let ctx = self.conns[idx].ctx();
				if ctx.state() < ConnState::Connect {
					log::warn!(
						"[{}] {}",
						ctx.name(),
						ResolveError::TimedOut {
							host: ctx.target().0.to_string()
						}
					);
				}
				self.doom(idx, DropReason::TimedOut);
			}
		}
	}

	/// Fires the terminal callbacks exactly once and marks the socket
	/// for removal at the top of the next iteration.
	fn doom(&mut self, idx: usize, reason: DropReason) {
		let conn = &mut self.conns[idx];
		if conn.dead {
			return;
		}
		conn.dead = true;
		let was_connected = conn.ctx().is_established();
		let Conn { ctx, handler, .. } = conn;
		log::debug!("[{}] teardown: {:?}", ctx.name(), reason);
		match reason {
			DropReason::SockErr(code) => handler.on_sock_error(ctx, code),
			DropReason::Refused => handler.on_connection_refused(ctx),
			DropReason::TimedOut => handler.on_timeout(ctx),
			// a peer that vanishes before establishment completes still
			// owes the owner exactly one callback
			DropReason::Eof if !was_connected => {
				handler.on_sock_error(ctx, libc::ECONNRESET)
			}
			DropReason::Eof | DropReason::Closed => {}
			DropReason::Detached => return,
		}
		// the disconnect notification runs for every socket that made it
		// to Established, whatever the terminal reason was
		if was_connected {
			handler.on_disconnected(ctx);
		}
	}

	/// Consumes close intents and removes dead sockets. Runs at the top
	/// of each iteration so an intent set during dispatch takes effect
	/// before the next poll.
	fn reap(&mut self) {
		let mut i = 0;
		while i < self.conns.len() {
			if self.conns[i].dead {
				self.conns.remove(i);
				continue;
			}
			match self.conns[i].ctx().close_intent() {
				CloseIntent::None => i += 1,
				CloseIntent::Now => {
					self.conns[i].shutdown_tls();
					self.doom(i, DropReason::Closed);
					self.conns.remove(i);
				}
				CloseIntent::AfterFlush => {
					if self.conns[i].out_drained() {
						self.conns[i].shutdown_tls();
						self.doom(i, DropReason::Closed);
						self.conns.remove(i);
					} else {
						i += 1;
					}
				}
				CloseIntent::Detach => {
					self.doom(i, DropReason::Detached);
					self.conns.remove(i);
				}
			}
		}
	}
}

impl std::fmt::Debug for Mux {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Mux")
			.field("conns", &self.conns.len())
			.field("crons", &self.crons.len())
			.finish()
	}
}
