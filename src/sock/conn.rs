use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::addr::{Family, SockAddr};
use crate::clock;
use crate::cron::CronTimer;
use crate::monitor::FdMonitor;
use crate::tls::{TlsConnectCfg, TlsSession};

use super::buffer::LineBuffer;
use super::cfg::{ConnectCfg, ListenCfg, TcpCfg};
use super::rate::RateShaper;
use super::{CloseIntent, ConnHandler, ConnState, Role};

/// A socket-level timed job. The callback gets the owning socket's
/// context, so a cron can write, reschedule or close its socket.
pub struct ConnCron {
	pub(crate) timer: CronTimer,
	job: Box<dyn FnMut(&mut CronTimer, &mut ConnCtx)>,
}

impl ConnCron {
	/// Runs forever every `interval`.
	pub fn new<F>(name: &str, interval: Duration, job: F) -> Self
	where
		F: FnMut(&mut CronTimer, &mut ConnCtx) + 'static,
	{
		Self::with_max_cycles(name, interval, 0, job)
	}

	/// Runs `max_cycles` times (0 = forever), then deactivates.
	pub fn with_max_cycles<F>(name: &str, interval: Duration, max_cycles: u32, job: F) -> Self
	where
		F: FnMut(&mut CronTimer, &mut ConnCtx) + 'static,
	{
		Self {
			timer: CronTimer::new(name, clock::now_ms(), interval, max_cycles),
			job: Box::new(job),
		}
	}

	pub fn timer(&self) -> &CronTimer {
		&self.timer
	}

	pub(crate) fn tick(&mut self, now_ms: u64, ctx: &mut ConnCtx) {
		if self.timer.should_run(now_ms) {
			(self.job)(&mut self.timer, ctx);
			self.timer.ran(now_ms);
		}
	}
}

/// TLS sub-state: the session plus the handshake-reported flag.
/// Pending ciphertext lives inside the session's record layer, which
/// retries a partial flush from the identical bytes.
pub(crate) struct TlsState {
	pub session: TlsSession,
	pub established: bool,
}

/// Everything about one socket except its handler: descriptors, state
/// machine position, buffers, rate limit, timeout bookkeeping, attached
/// jobs and monitors. Handlers receive `&mut ConnCtx` and steer the
/// socket through it.
pub struct ConnCtx {
	pub(crate) name: String,
	pub(crate) role: Role,
	pub(crate) state: ConnState,
	pub(crate) close: CloseIntent,

	// endpoint
	pub(crate) host: String,
	pub(crate) port: u16,
	pub(crate) bind_host: String,
	pub(crate) family: Family,
	pub(crate) resolved: Option<SockAddr>,
	pub(crate) bind_addr: Option<SockAddr>,
	pub(crate) remote: Option<SockAddr>,

	// descriptors; wfd only differs for pipe-backed endpoints
	pub(crate) rfd: Option<OwnedFd>,
	pub(crate) wfd: Option<OwnedFd>,

	// connect machinery
	pub(crate) bind_attempts: u8,
	pub(crate) v4_fallback_done: bool,
	pub(crate) tcp: TcpCfg,

	// buffers
	pub(crate) line: LineBuffer,
	pub(crate) out: Vec<u8>,
	pub(crate) max_buffer: usize,
	pub(crate) overflow_fired: bool,
	pub(crate) line_mode: bool,
	pub(crate) read_paused: bool,
	pub(crate) rescan_pending: bool,

	pub(crate) rate: RateShaper,

	// timeout bookkeeping
	pub(crate) timeout: Duration,
	pub(crate) timeout_scope: u8,
	pub(crate) last_activity_ms: u64,
	pub(crate) half_timeouts: u8,

	// tls
	pub(crate) tls: Option<TlsState>,
	pub(crate) tls_connect: Option<TlsConnectCfg>,
	pub(crate) tls_server_config: Option<Arc<rustls::ServerConfig>>,

	// listener: settings accepted sockets inherit
	pub(crate) inherit_line_mode: bool,
	pub(crate) inherit_max_buffer: usize,
	pub(crate) inherit_timeout: Duration,
	pub(crate) inherit_timeout_scope: u8,

	// attached, exclusively owned
	pub(crate) crons: Vec<ConnCron>,
	pub(crate) monitors: Vec<Box<dyn FdMonitor>>,

	// stats
	pub(crate) bytes_read: u64,
	pub(crate) bytes_written: u64,
	pub(crate) start_ms: u64,
}

impl ConnCtx {
	fn blank(name: &str, role: Role, state: ConnState) -> Self {
		Self {
			name: name.to_string(),
			role,
			state,
			close: CloseIntent::None,
			host: String::new(),
			port: 0,
			bind_host: String::new(),
			family: Family::Any,
			resolved: None,
			bind_addr: None,
			remote: None,
			rfd: None,
			wfd: None,
			bind_attempts: 0,
			v4_fallback_done: false,
			tcp: TcpCfg::default(),
			line: LineBuffer::new(),
			out: Vec::new(),
			max_buffer: 0,
			overflow_fired: false,
			line_mode: false,
			read_paused: false,
			rescan_pending: false,
			rate: RateShaper::off(),
			timeout: Duration::ZERO,
			timeout_scope: super::TMO_ALL,
			last_activity_ms: clock::now_ms(),
			half_timeouts: 0,
			tls: None,
			tls_connect: None,
			tls_server_config: None,
			inherit_line_mode: false,
			inherit_max_buffer: 0,
			inherit_timeout: Duration::ZERO,
			inherit_timeout_scope: super::TMO_ALL,
			crons: Vec::new(),
			monitors: Vec::new(),
			bytes_read: 0,
			bytes_written: 0,
			start_ms: clock::now_ms(),
		}
	}

	// ------------------------------------------------------------------
	// identity and state
	// ------------------------------------------------------------------

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn role(&self) -> Role {
		self.role
	}

	pub fn state(&self) -> ConnState {
		self.state
	}

	pub fn is_established(&self) -> bool {
		self.state == ConnState::Established
	}

	/// The (host, port) this socket was asked to reach.
	pub fn target(&self) -> (&str, u16) {
		(&self.host, self.port)
	}

	/// Peer address, once known.
	pub fn remote_addr(&self) -> Option<SockAddr> {
		self.remote
	}

	pub(crate) fn set_state(&mut self, next: ConnState) {
		debug_assert!(next >= self.state, "state may not move backwards");
		if next != self.state {
			log::debug!("[{}] {:?} -> {:?}", self.name, self.state, next);
			self.state = next;
		}
	}

	/// The one sanctioned backwards transition: an unreachable IPv6
	/// connect retries resolution constrained to IPv4, exactly once.
	pub(crate) fn reset_for_v4_fallback(&mut self) {
		log::debug!("[{}] v6 unreachable, falling back to v4", self.name);
		self.v4_fallback_done = true;
		self.resolved = None;
		self.rfd = None;
		self.state = ConnState::DestDns;
	}

	// ------------------------------------------------------------------
	// descriptors
	// ------------------------------------------------------------------

	pub fn read_fd(&self) -> Option<RawFd> {
		self.rfd.as_ref().map(|fd| fd.as_raw_fd())
	}

	pub fn write_fd(&self) -> Option<RawFd> {
		self.wfd
			.as_ref()
			.or(self.rfd.as_ref())
			.map(|fd| fd.as_raw_fd())
	}

	/// Moves the descriptor out, e.g. into a replacement socket during a
	/// swap. Whoever holds the `OwnedFd` is the only one who will ever
	/// close it; this socket is left detachable.
	pub fn take_fd(&mut self) -> Option<OwnedFd> {
		self.rfd.take()
	}

	/// Local port of the bound/connected descriptor.
	pub fn local_port(&self) -> Option<u16> {
		let fd = self.read_fd()?;
		let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
		let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
		let rc = unsafe {
			libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
		};
		if rc == -1 {
			return None;
		}
		unsafe { SockAddr::from_storage(&storage, len) }.map(|a| a.port())
	}

	// ------------------------------------------------------------------
	// I/O control
	// ------------------------------------------------------------------

	/// Queues bytes for the next flush opportunity. Data is accepted
	/// even while the connection is still being established and drains
	/// once it is.
	pub fn write(&mut self, data: &[u8]) {
		self.out.extend_from_slice(data);
	}

	pub fn write_str(&mut self, s: &str) {
		self.write(s.as_bytes());
	}

	pub fn pending_out(&self) -> usize {
		self.out.len()
	}

	/// Sets the close intent, consumed at the top of the next iteration.
	pub fn close(&mut self, intent: CloseIntent) {
		self.close = intent;
	}

	pub fn close_intent(&self) -> CloseIntent {
		self.close
	}

	/// Stops read interest and line scanning until resumed.
	pub fn pause_read(&mut self) {
		self.read_paused = true;
	}

	/// Resumes reads; buffered bytes are rescanned from the start.
	pub fn resume_read(&mut self) {
		if self.read_paused {
			self.read_paused = false;
			self.line.rescan();
			self.rescan_pending = true;
		}
	}

	pub fn is_read_paused(&self) -> bool {
		self.read_paused
	}

	/// Deliver `on_read_line` events from now on.
	pub fn enable_read_line(&mut self) {
		self.line_mode = true;
	}

	/// (max_bytes, window) outbound budget; zero on either disables.
	pub fn set_rate(&mut self, max_bytes: u32, window: Duration) {
		self.rate.set(max_bytes, window.as_millis() as u64);
	}

	/// Unterminated-inbound threshold; zero disables.
	pub fn set_max_buffer(&mut self, bytes: usize) {
		self.max_buffer = bytes;
	}

	/// Inactivity timeout and the activity kinds that reset it.
	pub fn set_timeout(&mut self, timeout: Duration, scope: u8) {
		self.timeout = timeout;
		self.timeout_scope = scope;
		self.half_timeouts = 0;
		self.last_activity_ms = clock::now_ms();
	}

	/// Resets the inactivity timer if `kind` is in the timeout scope.
	pub(crate) fn touch(&mut self, kind: u8, now_ms: u64) {
		if self.timeout_scope & kind != 0 {
			self.last_activity_ms = now_ms;
			self.half_timeouts = 0;
		}
	}

	/// One timeout-sweep step. Fires only after two consecutive sweeps
	/// have seen at least half the period elapsed, so a single clock
	/// adjustment cannot trip it.
	pub(crate) fn timed_out(&mut self, now_ms: u64) -> bool {
		if self.timeout.is_zero() {
			return false;
		}
		let eligible = match (self.role, self.state) {
			(Role::Listener, _) => self.timeout_scope & super::TMO_ACCEPT != 0,
			(_, ConnState::Established) => self.timeout_scope != 0,
			// still connecting: the timeout bounds establishment
			_ => true,
		};
		if !eligible {
			return false;
		}
		let timeout_ms = self.timeout.as_millis() as u64;
		let elapsed = now_ms.saturating_sub(self.last_activity_ms);
		if elapsed >= timeout_ms && self.half_timeouts > 0 {
			return true;
		}
		if elapsed >= timeout_ms / 2 {
			self.half_timeouts = self.half_timeouts.saturating_add(1);
		}
		false
	}

	// ------------------------------------------------------------------
	// attachments
	// ------------------------------------------------------------------

	/// Attaches a timed job. The socket owns it and drops it on teardown.
	pub fn add_cron(&mut self, cron: ConnCron) {
		self.crons.push(cron);
	}

	/// Stops and removes jobs by name.
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

	/// Attaches a foreign-descriptor monitor, owned by this socket.
	pub fn add_monitor(&mut self, monitor: Box<dyn FdMonitor>) {
		self.monitors.push(monitor);
	}

	// ------------------------------------------------------------------
	// stats
	// ------------------------------------------------------------------

	pub fn bytes_read(&self) -> u64 {
		self.bytes_read
	}

	pub fn bytes_written(&self) -> u64 {
		self.bytes_written
	}

	/// Milliseconds this socket has existed.
	pub fn age_ms(&self) -> u64 {
		clock::now_ms().saturating_sub(self.start_ms)
	}

	/// Readiness interest for this iteration.
	pub(crate) fn interest(&self) -> u8 {
		use crate::poll::{WANT_READ, WANT_WRITE};
		match self.state {
			ConnState::Established if self.role == Role::Listener => WANT_READ,
			ConnState::Established => {
				let mut want = 0;
				if !self.read_paused {
					want |= WANT_READ;
				}
				let tls_wants_write =
					self.tls.as_ref().is_some_and(|t| t.session.wants_write());
				if !self.out.is_empty() || tls_wants_write {
					want |= WANT_WRITE;
				}
				want
			}
			ConnState::Connect => WANT_WRITE,
			ConnState::ConnectTls => match &self.tls {
				Some(t) => {
					let mut want = 0;
					if t.session.wants_read() {
						want |= WANT_READ;
					}
					if t.session.wants_write() {
						want |= WANT_WRITE;
					}
					if want == 0 { WANT_READ } else { want }
				}
				None => WANT_READ,
			},
			// DNS/bind states have no descriptor interest of their own
			_ => 0,
		}
	}
}

/// A socket plus its handler. The split lets callback invocations borrow
/// the context and the handler disjointly.
pub struct Conn {
	pub(crate) ctx: ConnCtx,
	pub(crate) handler: Box<dyn ConnHandler>,
	/// A terminal callback has fired; the multiplexer reaps the socket.
	pub(crate) dead: bool,
}

impl Conn {
	/// An outbound connection, entering the state machine at `Start`.
	pub fn outbound(cfg: ConnectCfg, handler: Box<dyn ConnHandler>) -> Self {
		let mut ctx = ConnCtx::blank(&cfg.name, Role::Outbound, ConnState::Start);
		ctx.host = cfg.host;
		ctx.port = cfg.port;
		ctx.bind_host = cfg.bind_host;
		ctx.family = cfg.family;
		ctx.timeout = cfg.timeout;
		ctx.timeout_scope = cfg.timeout_scope;
		ctx.tls_connect = cfg.tls;
		ctx.max_buffer = cfg.max_buffer;
		ctx.line_mode = cfg.line_mode;
		ctx.tcp = cfg.tcp;
		if let Some((bytes, window_ms)) = cfg.rate {
			ctx.rate.set(bytes, window_ms);
		}
		Self {
			ctx,
			handler,
			dead: false,
		}
	}

	/// A listening socket wrapping an already bound+listening fd.
	pub(crate) fn listener(
		cfg: &ListenCfg,
		fd: OwnedFd,
		server_config: Option<Arc<rustls::ServerConfig>>,
		handler: Box<dyn ConnHandler>,
	) -> Self {
		let mut ctx = ConnCtx::blank(&cfg.name, Role::Listener, ConnState::Established);
		ctx.rfd = Some(fd);
		ctx.port = cfg.port;
		ctx.family = cfg.family;
		ctx.timeout = cfg.timeout;
		ctx.timeout_scope = cfg.timeout_scope;
		ctx.tls_server_config = server_config;
		ctx.tcp = cfg.tcp;
		ctx.inherit_line_mode = cfg.line_mode;
		ctx.inherit_max_buffer = cfg.max_buffer;
		ctx.inherit_timeout = cfg.timeout;
		ctx.inherit_timeout_scope = cfg.timeout_scope;
		Self {
			ctx,
			handler,
			dead: false,
		}
	}

	/// An accepted connection handed over by a listener.
	pub(crate) fn inbound(
		name: &str,
		fd: OwnedFd,
		remote: SockAddr,
		listener: &ConnCtx,
		handler: Box<dyn ConnHandler>,
	) -> Self {
		let state = if listener.tls_server_config.is_some() {
			ConnState::ConnectTls
		} else {
			ConnState::Established
		};
		let mut ctx = ConnCtx::blank(name, Role::Inbound, ConnState::Start);
		ctx.state = state;
		ctx.rfd = Some(fd);
		ctx.remote = Some(remote);
		ctx.host = remote.ip().to_string();
		ctx.port = remote.port();
		ctx.line_mode = listener.inherit_line_mode;
		ctx.max_buffer = listener.inherit_max_buffer;
		ctx.timeout = listener.inherit_timeout;
		ctx.timeout_scope = listener.inherit_timeout_scope;
		Self {
			ctx,
			handler,
			dead: false,
		}
	}

	/// Wraps a descriptor pair the engine did not create, e.g. the stdio
	/// pipes of a spawned subprocess. Enters directly at `Established`;
	/// no connect machinery runs. The descriptors are switched to
	/// non-blocking mode.
	pub fn from_fds(name: &str, rfd: OwnedFd, wfd: Option<OwnedFd>, handler: Box<dyn ConnHandler>) -> Self {
		let mut ctx = ConnCtx::blank(name, Role::Inbound, ConnState::Start);
		ctx.state = ConnState::Established;
		if let Err(e) = super::io::set_nonblocking(rfd.as_raw_fd(), true) {
			log::warn!("[{}] {}", name, e);
		}
		if let Some(w) = &wfd {
			if let Err(e) = super::io::set_nonblocking(w.as_raw_fd(), true) {
				log::warn!("[{}] {}", name, e);
			}
		}
		ctx.rfd = Some(rfd);
		ctx.wfd = wfd;
		Self {
			ctx,
			handler,
			dead: false,
		}
	}

	pub fn ctx(&self) -> &ConnCtx {
		&self.ctx
	}

	pub fn ctx_mut(&mut self) -> &mut ConnCtx {
		&mut self.ctx
	}

	/// Enters `Established` and fires `on_connected`.
	pub(crate) fn enter_established(&mut self, now_ms: u64) {
		self.ctx.set_state(ConnState::Established);
		self.ctx.last_activity_ms = now_ms;
		self.ctx.half_timeouts = 0;
		let Conn { ctx, handler, .. } = self;
		log::debug!("[{}] connected", ctx.name);
		handler.on_connected(ctx);
	}

	/// Ticks and reaps this socket's cron jobs.
	pub(crate) fn tick_crons(&mut self, now_ms: u64) {
		if self.ctx.crons.is_empty() {
			return;
		}
		let mut crons = std::mem::take(&mut self.ctx.crons);
		for cron in &mut crons {
			cron.tick(now_ms, &mut self.ctx);
		}
		crons.retain(|c| c.timer.is_active());
		// jobs added from inside a job landed in ctx.crons meanwhile
		crons.append(&mut self.ctx.crons);
		self.ctx.crons = crons;
	}

	/// Re-runs line delivery after a read resume.
	pub(crate) fn drain_pending_lines(&mut self) {
		self.ctx.rescan_pending = false;
		let Conn { ctx, handler, .. } = self;
		if !ctx.line_mode || ctx.read_paused {
			return;
		}
		while let Some(line) = ctx.line.next_line() {
			handler.on_read_line(ctx, &line);
		}
		ctx.line.mark_scanned();
		super::io::check_overflow(ctx, handler.as_mut());
	}

	/// Earliest future instant this socket's attachments want the loop
	/// to wake for, used by the dynamic loop.
	pub(crate) fn next_due_ms(&self) -> Option<u64> {
		let mut due: Option<u64> = None;
		for cron in &self.ctx.crons {
			if let Some(t) = cron.timer.next_due_ms() {
				due = Some(due.map_or(t, |d: u64| d.min(t)));
			}
		}
		if let Some(t) = self.ctx.rate.next_window_ms() {
			if !self.ctx.out.is_empty() {
				due = Some(due.map_or(t, |d: u64| d.min(t)));
			}
		}
		due
	}
}

impl std::fmt::Debug for Conn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Conn")
			.field("name", &self.ctx.name)
			.field("role", &self.ctx.role)
			.field("state", &self.ctx.state)
			.field("fd", &self.ctx.read_fd())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sock::{NullHandler, TMO_READ};

	fn outbound_ctx() -> ConnCtx {
		let conn = Conn::outbound(
			ConnectCfg::new("irc.example.net", 6667).timeout(Duration::from_secs(10)),
			Box::new(NullHandler),
		);
		conn.ctx
	}

	#[test]
	fn timeout_needs_two_half_period_sweeps() {
		let mut ctx = outbound_ctx();
		ctx.last_activity_ms = 0;
		// half the period elapsed: arm, don't fire
		assert!(!ctx.timed_out(5_000));
		// full period elapsed and armed: fire
		assert!(ctx.timed_out(10_000));
	}

	#[test]
	fn single_giant_clock_jump_does_not_fire() {
		let mut ctx = outbound_ctx();
		ctx.last_activity_ms = 0;
		// one sweep sees a huge jump: arm only
		assert!(!ctx.timed_out(1_000_000));
		assert!(ctx.timed_out(1_000_001));
	}

	#[test]
	fn activity_resets_the_half_counter() {
		let mut ctx = outbound_ctx();
		ctx.last_activity_ms = 0;
		assert!(!ctx.timed_out(9_000));
		ctx.touch(TMO_READ, 9_500);
		assert!(!ctx.timed_out(14_000));
		assert!(!ctx.timed_out(14_500));
		// armed at 14.5s wait; full period from 9.5s is 19.5s
		assert!(ctx.timed_out(19_500));
	}

	#[test]
	fn zero_timeout_never_fires() {
		let mut ctx = outbound_ctx();
		ctx.timeout = Duration::ZERO;
		assert!(!ctx.timed_out(u64::MAX));
	}

	#[test]
	fn state_is_monotonic() {
		let mut ctx = outbound_ctx();
		ctx.set_state(ConnState::DestDns);
		ctx.set_state(ConnState::Connect);
		ctx.set_state(ConnState::Established);
		assert_eq!(ctx.state(), ConnState::Established);
	}

	#[test]
	fn v4_fallback_resets_to_dns() {
		let mut ctx = outbound_ctx();
		ctx.set_state(ConnState::DestDns);
		ctx.set_state(ConnState::Connect);
		ctx.reset_for_v4_fallback();
		assert_eq!(ctx.state(), ConnState::DestDns);
		assert!(ctx.v4_fallback_done);
	}
}
