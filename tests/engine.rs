//! End-to-end engine scenarios over loopback: two engine instances, one
//! listening and one dialing, pumped alternately from the test thread.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use wireloop::{
	CloseIntent, Conn, ConnCron, ConnCtx, ConnHandler, ConnectCfg, Family, FdMonitor,
	ListenCfg, Mux, MuxCron, Readiness, Resolve, Resolver, WANT_READ, clock,
};

/// Everything a test wants to observe about one socket.
#[derive(Default)]
struct Shared {
	connected: u32,
	disconnected: u32,
	refused: u32,
	timeouts: u32,
	errors: Vec<i32>,
	lines: Vec<Vec<u8>>,
	data: Vec<u8>,
	max_buffer_hits: u32,
	read_paused_calls: u32,
}

type Ev = Rc<RefCell<Shared>>;

fn ev() -> Ev {
	Rc::new(RefCell::new(Shared::default()))
}

/// Records every callback; optionally echoes lines, greets on connect,
/// or pauses its own reads immediately.
struct Probe {
	ev: Ev,
	echo: bool,
	greet: Option<&'static str>,
	pause_on_connect: bool,
}

impl Probe {
	fn new(ev: &Ev) -> Self {
		Self {
			ev: ev.clone(),
			echo: false,
			greet: None,
			pause_on_connect: false,
		}
	}
}

impl ConnHandler for Probe {
	fn on_connected(&mut self, ctx: &mut ConnCtx) {
		self.ev.borrow_mut().connected += 1;
		if let Some(greet) = self.greet {
			ctx.write_str(greet);
		}
		if self.pause_on_connect {
			ctx.pause_read();
		}
	}

	fn on_disconnected(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().disconnected += 1;
	}

	fn on_timeout(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().timeouts += 1;
	}

	fn on_connection_refused(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().refused += 1;
	}

	fn on_sock_error(&mut self, _ctx: &mut ConnCtx, errno: i32) {
		self.ev.borrow_mut().errors.push(errno);
	}

	fn on_read_line(&mut self, ctx: &mut ConnCtx, line: &[u8]) {
		self.ev.borrow_mut().lines.push(line.to_vec());
		if self.echo {
			ctx.write(line);
		}
	}

	fn on_read_data(&mut self, _ctx: &mut ConnCtx, data: &[u8]) {
		self.ev.borrow_mut().data.extend_from_slice(data);
	}

	// deliberately does not close: lets tests observe the one-shot
	// behavior of the overflow event
	fn on_reached_max_buffer(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().max_buffer_hits += 1;
	}

	fn on_read_paused(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().read_paused_calls += 1;
	}
}

/// Listener handler: gates connections and builds `Probe`s for them.
struct Acceptor {
	accept: bool,
	inbound_ev: Ev,
	echo: bool,
	greet: Option<&'static str>,
}

impl Acceptor {
	fn new(inbound_ev: &Ev) -> Self {
		Self {
			accept: true,
			inbound_ev: inbound_ev.clone(),
			echo: false,
			greet: None,
		}
	}
}

impl ConnHandler for Acceptor {
	fn on_connection_from(&mut self, _host: &str, _port: u16) -> bool {
		self.accept
	}

	fn on_accept(&mut self, _host: &str, _port: u16) -> Option<Box<dyn ConnHandler>> {
		let mut probe = Probe::new(&self.inbound_ev);
		probe.echo = self.echo;
		probe.greet = self.greet;
		Some(Box::new(probe))
	}
}

fn fast(mux: &mut Mux) {
	mux.set_select_wait(Duration::from_millis(10));
}

fn pump2(a: &mut Mux, b: &mut Mux, iters: usize) {
	for _ in 0..iters {
		a.loop_once();
		b.loop_once();
	}
}

fn pump2_until(a: &mut Mux, b: &mut Mux, max_iters: usize, cond: impl Fn() -> bool) -> bool {
	for _ in 0..max_iters {
		a.loop_once();
		b.loop_once();
		if cond() {
			return true;
		}
	}
	false
}

fn init_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn ephemeral_listen_and_loopback_connect() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let mut acceptor = Acceptor::new(&inbound);
	acceptor.echo = true;
	let port = server
		.listen(
			ListenCfg::new(0)
				.bind_host("127.0.0.1")
				.name("lst")
				.read_line(true),
			Box::new(acceptor),
		)
		.unwrap();
	assert!(port > 0, "ephemeral port must be reported");

	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli").read_line(true),
		Box::new(Probe::new(&cli)),
	);

	assert!(
		pump2_until(&mut client, &mut server, 200, || {
			cli.borrow().connected == 1 && inbound.borrow().connected == 1
		}),
		"both ends must report connected"
	);

	client
		.ctx_by_name("cli")
		.unwrap()
		.write(b"PING :token\n");
	assert!(
		pump2_until(&mut client, &mut server, 200, || !cli.borrow().lines.is_empty()),
		"echo must come back"
	);
	assert_eq!(inbound.borrow().lines, vec![b"PING :token\n".to_vec()]);
	assert_eq!(cli.borrow().lines, vec![b"PING :token\n".to_vec()]);
}

#[test]
fn refused_connection_fires_exactly_one_callback() {
	init_logging();
	// grab a loopback port and release it again: nothing listens there
	let dead_port = {
		let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		sock.local_addr().unwrap().port()
	};

	let mut client = Mux::new();
	fast(&mut client);
	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", dead_port).name("cli"),
		Box::new(Probe::new(&cli)),
	);

	for _ in 0..100 {
		client.loop_once();
		if cli.borrow().refused == 1 {
			break;
		}
	}
	// a few extra iterations must not re-fire anything
	for _ in 0..10 {
		client.loop_once();
	}
	let seen = cli.borrow();
	assert_eq!(seen.refused, 1);
	assert_eq!(seen.connected, 0);
	assert_eq!(seen.disconnected, 0);
	assert!(client.is_empty(), "failed socket must leave the mux");
}

#[test]
fn max_buffer_fires_once_without_new_input() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let port = server
		.listen(
			ListenCfg::new(0)
				.bind_host("127.0.0.1")
				.name("lst")
				.read_line(true)
				.max_buffer(10),
			Box::new(Acceptor::new(&inbound)),
		)
		.unwrap();

	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli"),
		Box::new(Probe::new(&cli)),
	);
	assert!(pump2_until(&mut client, &mut server, 200, || {
		inbound.borrow().connected == 1
	}));

	// 11 bytes, no terminator: one past the threshold
	client.ctx_by_name("cli").unwrap().write(b"ABCDEFGHIJK");
	assert!(pump2_until(&mut client, &mut server, 200, || {
		inbound.borrow().max_buffer_hits >= 1
	}));
	pump2(&mut client, &mut server, 20);
	assert_eq!(inbound.borrow().max_buffer_hits, 1, "overflow event is one-shot");
	assert!(inbound.borrow().lines.is_empty());
}

#[test]
fn close_after_flush_drains_everything_first() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let port = server
		.listen(
			ListenCfg::new(0).bind_host("127.0.0.1").name("lst").max_buffer(0),
			Box::new(Acceptor::new(&inbound)),
		)
		.unwrap();

	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli"),
		Box::new(Probe::new(&cli)),
	);
	assert!(pump2_until(&mut client, &mut server, 200, || {
		cli.borrow().connected == 1
	}));

	let payload = vec![0x42u8; 100_000];
	{
		let ctx = client.ctx_by_name("cli").unwrap();
		ctx.write(&payload);
		ctx.close(CloseIntent::AfterFlush);
	}

	assert!(
		pump2_until(&mut client, &mut server, 500, || {
			inbound.borrow().data.len() == payload.len()
		}),
		"receiver must see the whole payload before the close lands"
	);
	let mut client_emptied = false;
	for _ in 0..100 {
		client.loop_once();
		server.loop_once();
		if client.is_empty() {
			client_emptied = true;
			break;
		}
	}
	assert!(client_emptied);
	assert_eq!(cli.borrow().disconnected, 1);
}

#[test]
fn mux_cron_respects_cycle_budget() {
	init_logging();
	let mut mux = Mux::new();
	fast(&mut mux);

	let count = Rc::new(RefCell::new(0u32));
	let c = count.clone();
	mux.add_cron(MuxCron::with_max_cycles(
		"burst",
		clock::now_ms(),
		Duration::from_millis(30),
		3,
		move |_| *c.borrow_mut() += 1,
	));

	// dynamic pacing: the loop should wake for the cron on its own
	for _ in 0..120 {
		mux.dynamic_loop_once(Duration::from_millis(1), Duration::from_millis(50));
		if *count.borrow() >= 3 {
			break;
		}
	}
	for _ in 0..30 {
		mux.loop_once();
	}
	assert_eq!(*count.borrow(), 3, "a 3-cycle cron fires exactly 3 times");
}

/// Answers Retry a fixed number of times before resolving to loopback.
struct FlakyResolver {
	retries_left: u32,
	calls: Rc<RefCell<u32>>,
}

impl Resolver for FlakyResolver {
	fn resolve(&mut self, _host: &str, _family: Family) -> Resolve {
		*self.calls.borrow_mut() += 1;
		if self.retries_left > 0 {
			self.retries_left -= 1;
			return Resolve::Retry;
		}
		Resolve::Ready("127.0.0.1".parse().unwrap())
	}
}

#[test]
fn dns_retries_advance_the_state_machine_once() {
	init_logging();
	let mut server = Mux::new();
	fast(&mut server);
	let inbound = ev();
	let port = server
		.listen(
			ListenCfg::new(0).bind_host("127.0.0.1").name("lst"),
			Box::new(Acceptor::new(&inbound)),
		)
		.unwrap();

	let calls = Rc::new(RefCell::new(0u32));
	let mut client = Mux::with_resolver(Box::new(FlakyResolver {
		retries_left: 5,
		calls: calls.clone(),
	}));
	fast(&mut client);

	let cli = ev();
	client.connect(
		ConnectCfg::new("irc.flaky.test", port).name("cli"),
		Box::new(Probe::new(&cli)),
	);

	assert!(pump2_until(&mut client, &mut server, 200, || {
		cli.borrow().connected == 1
	}));
	assert!(*calls.borrow() >= 6, "resolver must have been re-polled");
	assert_eq!(cli.borrow().connected, 1, "one connect despite N retries");
}

#[test]
fn rejected_connections_never_reach_a_handler() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let mut acceptor = Acceptor::new(&inbound);
	acceptor.accept = false;
	let port = server
		.listen(
			ListenCfg::new(0).bind_host("127.0.0.1").name("lst"),
			Box::new(acceptor),
		)
		.unwrap();

	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli"),
		Box::new(Probe::new(&cli)),
	);

	// the TCP handshake completes before the gate drops the socket, so
	// the client may briefly see connected — but must then see EOF
	assert!(pump2_until(&mut client, &mut server, 300, || {
		cli.borrow().disconnected == 1
	}));
	assert_eq!(inbound.borrow().connected, 0);
	assert_eq!(server.len(), 1, "only the listener remains");
}

#[test]
fn paused_reads_deliver_after_resume() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let mut acceptor = Acceptor::new(&inbound);
	acceptor.greet = Some("hello\nworld\n");
	let port = server
		.listen(
			ListenCfg::new(0).bind_host("127.0.0.1").name("lst"),
			Box::new(acceptor),
		)
		.unwrap();

	let cli = ev();
	let mut probe = Probe::new(&cli);
	probe.pause_on_connect = true;
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli").read_line(true),
		Box::new(probe),
	);

	assert!(pump2_until(&mut client, &mut server, 200, || {
		cli.borrow().connected == 1
	}));
	// paused: the greeting must not be delivered, and the sweep should
	// report the paused state at least once
	assert!(pump2_until(&mut client, &mut server, 250, || {
		cli.borrow().read_paused_calls >= 1
	}));
	assert!(cli.borrow().lines.is_empty(), "no lines while paused");

	client.ctx_by_name("cli").unwrap().resume_read();
	assert!(pump2_until(&mut client, &mut server, 200, || {
		cli.borrow().lines.len() == 2
	}));
	assert_eq!(
		cli.borrow().lines,
		vec![b"hello\n".to_vec(), b"world\n".to_vec()]
	);
}

#[test]
fn idle_connection_times_out_once() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let port = server
		.listen(
			ListenCfg::new(0).bind_host("127.0.0.1").name("lst"),
			Box::new(Acceptor::new(&inbound)),
		)
		.unwrap();

	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port)
			.name("cli")
			.timeout(Duration::from_secs(1)),
		Box::new(Probe::new(&cli)),
	);

	assert!(pump2_until(&mut client, &mut server, 500, || {
		cli.borrow().timeouts == 1
	}));
	pump2(&mut client, &mut server, 20);
	let seen = cli.borrow();
	assert_eq!(seen.timeouts, 1, "timeout fires exactly once");
	assert!(client.is_empty());
}

/// Drains a pipe's read end and counts wakeups; detaches itself after a
/// configured number of hits.
struct PipeMonitor {
	r: OwnedFd,
	hits: Rc<RefCell<u32>>,
	detach_after: u32,
}

impl FdMonitor for PipeMonitor {
	fn fds(&mut self, out: &mut Vec<(RawFd, u8)>) {
		out.push((self.r.as_raw_fd(), WANT_READ));
	}

	fn ready(&mut self, fd: RawFd, _readiness: Readiness) -> bool {
		let mut buf = [0u8; 16];
		unsafe {
			libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
		}
		*self.hits.borrow_mut() += 1;
		*self.hits.borrow() < self.detach_after
	}

	fn max_wait(&self) -> Option<Duration> {
		Some(Duration::from_millis(20))
	}
}

#[test]
fn monitors_join_the_poll_set_and_detach() {
	init_logging();
	let mut fds = [0 as RawFd; 2];
	let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
	assert_eq!(rc, 0);
	let pipe_r = unsafe { OwnedFd::from_raw_fd(fds[0]) };
	let pipe_w = unsafe { OwnedFd::from_raw_fd(fds[1]) };

	let mut mux = Mux::new();
	fast(&mut mux);
	// attach the monitor to a listener; any socket can own monitors
	let inbound = ev();
	mux.listen(
		ListenCfg::new(0).bind_host("127.0.0.1").name("lst"),
		Box::new(Acceptor::new(&inbound)),
	)
	.unwrap();

	let hits = Rc::new(RefCell::new(0u32));
	mux.ctx_by_name("lst").unwrap().add_monitor(Box::new(PipeMonitor {
		r: pipe_r,
		hits: hits.clone(),
		detach_after: 2,
	}));

	let poke = |w: &OwnedFd| {
		let b = [1u8];
		unsafe {
			libc::write(w.as_raw_fd(), b.as_ptr() as *const libc::c_void, 1);
		}
	};

	poke(&pipe_w);
	for _ in 0..50 {
		mux.loop_once();
		if *hits.borrow() == 1 {
			break;
		}
	}
	assert_eq!(*hits.borrow(), 1);

	// second hit asks for detach; later pokes must go unnoticed
	poke(&pipe_w);
	for _ in 0..50 {
		mux.loop_once();
		if *hits.borrow() == 2 {
			break;
		}
	}
	assert_eq!(*hits.borrow(), 2);
	poke(&pipe_w);
	for _ in 0..10 {
		mux.loop_once();
	}
	assert_eq!(*hits.borrow(), 2, "detached monitor no longer fires");
}

#[test]
fn socket_cron_writes_through_its_context() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let port = server
		.listen(
			ListenCfg::new(0)
				.bind_host("127.0.0.1")
				.name("lst")
				.read_line(true),
			Box::new(Acceptor::new(&inbound)),
		)
		.unwrap();

	let cli = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli"),
		Box::new(Probe::new(&cli)),
	);
	assert!(pump2_until(&mut client, &mut server, 200, || {
		cli.borrow().connected == 1
	}));

	client.ctx_by_name("cli").unwrap().add_cron(ConnCron::with_max_cycles(
		"keepalive",
		Duration::from_millis(40),
		2,
		|_, ctx| ctx.write(b"PING :cron\n"),
	));

	assert!(pump2_until(&mut client, &mut server, 300, || {
		inbound.borrow().lines.len() == 2
	}));
	// the cycle budget is spent; no third ping
	pump2(&mut client, &mut server, 30);
	assert_eq!(inbound.borrow().lines.len(), 2);
	assert_eq!(inbound.borrow().lines[0], b"PING :cron\n".to_vec());
}

#[test]
fn swap_detaches_without_callbacks() {
	init_logging();
	let mut server = Mux::new();
	let mut client = Mux::new();
	fast(&mut server);
	fast(&mut client);

	let inbound = ev();
	let mut acceptor = Acceptor::new(&inbound);
	acceptor.echo = true;
	let port = server
		.listen(
			ListenCfg::new(0)
				.bind_host("127.0.0.1")
				.name("lst")
				.read_line(true),
			Box::new(acceptor),
		)
		.unwrap();

	let old_ev = ev();
	client.connect(
		ConnectCfg::new("127.0.0.1", port).name("cli"),
		Box::new(Probe::new(&old_ev)),
	);
	assert!(pump2_until(&mut client, &mut server, 200, || {
		old_ev.borrow().connected == 1
	}));

	// promote the socket: same descriptor, fresh handler, new name
	let new_ev = ev();
	let new_probe = Probe::new(&new_ev);
	let swapped = client.swap("cli", move |old| {
		let fd = old.take_fd().expect("established socket has a descriptor");
		Conn::from_fds("cli2", fd, None, Box::new(new_probe))
	});
	assert!(swapped);
	{
		let ctx = client.ctx_by_name("cli2").unwrap();
		ctx.enable_read_line();
		ctx.write(b"SWAP :check\n");
	}

	assert!(pump2_until(&mut client, &mut server, 200, || {
		!new_ev.borrow().lines.is_empty()
	}));
	assert_eq!(new_ev.borrow().lines, vec![b"SWAP :check\n".to_vec()]);
	// the detached original saw no teardown callbacks
	assert_eq!(old_ev.borrow().disconnected, 0);
	assert!(old_ev.borrow().errors.is_empty());
	assert!(!client.has_conn("cli"));
}
