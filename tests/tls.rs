//! TLS loopback: a self-signed listener and an insecure-verify client,
//! handshake driven entirely by the engine loop.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use wireloop::{
	ConnCtx, ConnHandler, ConnectCfg, ListenCfg, Mux, TlsConnectCfg, TlsListenCfg,
};

#[derive(Default)]
struct Shared {
	connected: u32,
	disconnected: u32,
	lines: Vec<Vec<u8>>,
}

type Ev = Rc<RefCell<Shared>>;

struct Probe {
	ev: Ev,
	echo: bool,
}

impl ConnHandler for Probe {
	fn on_connected(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().connected += 1;
	}

	fn on_disconnected(&mut self, _ctx: &mut ConnCtx) {
		self.ev.borrow_mut().disconnected += 1;
	}

	fn on_read_line(&mut self, ctx: &mut ConnCtx, line: &[u8]) {
		self.ev.borrow_mut().lines.push(line.to_vec());
		if self.echo {
			ctx.write(line);
		}
	}
}

struct Acceptor {
	inbound_ev: Ev,
}

impl ConnHandler for Acceptor {
	fn on_accept(&mut self, _host: &str, _port: u16) -> Option<Box<dyn ConnHandler>> {
		Some(Box::new(Probe {
			ev: self.inbound_ev.clone(),
			echo: true,
		}))
	}
}

/// Writes a fresh self-signed certificate and key under a per-process
/// temp directory, returning their paths.
fn self_signed_material() -> (PathBuf, PathBuf) {
	let dir = std::env::temp_dir().join(format!("wireloop-tls-{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
	let cert_path = dir.join("cert.pem");
	let key_path = dir.join("key.pem");
	std::fs::write(&cert_path, cert.cert.pem()).unwrap();
	std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
	(cert_path, key_path)
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

#[test]
fn tls_loopback_handshake_and_echo() {
	let _ = env_logger::builder().is_test(true).try_init();
	let (cert_path, key_path) = self_signed_material();

	let mut server = Mux::new();
	let mut client = Mux::new();
	server.set_select_wait(Duration::from_millis(10));
	client.set_select_wait(Duration::from_millis(10));

	let inbound = Rc::new(RefCell::new(Shared::default()));
	let port = server
		.listen(
			ListenCfg::new(0)
				.bind_host("127.0.0.1")
				.name("lst-tls")
				.read_line(true)
				.tls(TlsListenCfg::new(&cert_path, &key_path)),
			Box::new(Acceptor {
				inbound_ev: inbound.clone(),
			}),
		)
		.unwrap();
	assert!(port > 0);

	let cli = Rc::new(RefCell::new(Shared::default()));
	client.connect(
		ConnectCfg::new("127.0.0.1", port)
			.name("cli-tls")
			.read_line(true)
			// self-signed on the other side: skip verification
			.tls(TlsConnectCfg::default()),
		Box::new(Probe {
			ev: cli.clone(),
			echo: false,
		}),
	);

	// connected only fires after the handshake on both roles
	assert!(
		pump2_until(&mut client, &mut server, 400, || {
			cli.borrow().connected == 1 && inbound.borrow().connected == 1
		}),
		"tls handshake must complete on both ends"
	);

	client
		.ctx_by_name("cli-tls")
		.unwrap()
		.write(b"PRIVMSG #wire :sealed\n");
	assert!(
		pump2_until(&mut client, &mut server, 400, || {
			!cli.borrow().lines.is_empty()
		}),
		"echo must round-trip through both sessions"
	);
	assert_eq!(
		inbound.borrow().lines,
		vec![b"PRIVMSG #wire :sealed\n".to_vec()]
	);
	assert_eq!(cli.borrow().lines, vec![b"PRIVMSG #wire :sealed\n".to_vec()]);

	// closing the client tears the pair down cleanly
	client
		.ctx_by_name("cli-tls")
		.unwrap()
		.close(wireloop::CloseIntent::Now);
	assert!(pump2_until(&mut client, &mut server, 200, || {
		inbound.borrow().disconnected == 1
	}));
	assert!(client.is_empty());
}
