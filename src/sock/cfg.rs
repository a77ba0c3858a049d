use std::time::Duration;

use crate::addr::Family;
use crate::tls::{TlsConnectCfg, TlsListenCfg};

use super::TMO_ALL;

// ============================================================================
// Shared Configuration Structs
// ============================================================================

/// Keep-alive timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveCfg {
	pub idle_secs: u32,
	pub interval_secs: u32,
	pub count: u32,
}

impl Default for KeepaliveCfg {
	fn default() -> Self {
		Self {
			idle_secs: 60,
			interval_secs: 10,
			count: 5,
		}
	}
}

/// TCP-level options applied when the descriptor is created.
#[derive(Debug, Clone, Copy)]
pub struct TcpCfg {
	pub nodelay: bool,
	pub keepalive: Option<KeepaliveCfg>,
	pub linger: Option<Option<u32>>,
}

impl Default for TcpCfg {
	fn default() -> Self {
		Self {
			nodelay: true,  // IRC traffic is small lines; latency wins
			keepalive: None,
			linger: None,
		}
	}
}

// ============================================================================
// Outbound Configuration
// ============================================================================

/// Everything an outbound connection needs before its first state step.
///
/// # Example
/// ```ignore
/// use wireloop::{ConnectCfg, Family};
///
/// let cfg = ConnectCfg::new("irc.example.net", 6697)
///     .name("net/example")
///     .timeout(Duration::from_secs(120))
///     .tls(Default::default())
///     .bind_host("203.0.113.7")
///     .read_line(true);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectCfg {
	pub(crate) host: String,
	pub(crate) port: u16,
	pub(crate) name: String,
	pub(crate) timeout: Duration,
	pub(crate) timeout_scope: u8,
	pub(crate) tls: Option<TlsConnectCfg>,
	pub(crate) bind_host: String,
	pub(crate) family: Family,
	pub(crate) rate: Option<(u32, u64)>,
	pub(crate) max_buffer: usize,
	pub(crate) line_mode: bool,
	pub(crate) tcp: TcpCfg,
}

impl ConnectCfg {
	pub fn new(host: &str, port: u16) -> Self {
		Self {
			host: host.to_string(),
			port,
			name: format!("{}:{}", host, port),
			timeout: Duration::from_secs(60),
			timeout_scope: TMO_ALL,
			tls: None,
			bind_host: String::new(),
			family: Family::Any,
			rate: None,
			max_buffer: 1024,
			line_mode: false,
			tcp: TcpCfg::default(),
		}
	}

	/// Names the socket for lookup and logging. Should be unique.
	pub fn name(mut self, name: &str) -> Self {
		self.name = name.to_string();
		self
	}

	/// Inactivity timeout; zero disables. Default: 60 seconds.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Which activity resets the timeout timer. Default: all.
	pub fn timeout_scope(mut self, scope: u8) -> Self {
		self.timeout_scope = scope;
		self
	}

	/// Wrap the connection in TLS once connected.
	pub fn tls(mut self, tls: TlsConnectCfg) -> Self {
		self.tls = Some(tls);
		self
	}

	/// Local address (vhost) to bind before connecting out.
	pub fn bind_host(mut self, host: &str) -> Self {
		self.bind_host = host.to_string();
		self
	}

	/// Address-family preference. Default: any, preferring IPv6.
	pub fn family(mut self, family: Family) -> Self {
		self.family = family;
		self
	}

	/// Outbound shaping: at most `max_bytes` per `window`.
	pub fn rate(mut self, max_bytes: u32, window: Duration) -> Self {
		self.rate = Some((max_bytes, window.as_millis() as u64));
		self
	}

	/// Unterminated-inbound threshold; zero disables. Default: 1024.
	pub fn max_buffer(mut self, bytes: usize) -> Self {
		self.max_buffer = bytes;
		self
	}

	/// Deliver `on_read_line` events. Default: raw data only.
	pub fn read_line(mut self, enable: bool) -> Self {
		self.line_mode = enable;
		self
	}

	/// TCP options for the descriptor.
	pub fn tcp(mut self, tcp: TcpCfg) -> Self {
		self.tcp = tcp;
		self
	}
}

// ============================================================================
// Listener Configuration
// ============================================================================

/// Everything a listening socket needs. Accepted sockets inherit the
/// timeout, max-buffer and line-mode settings.
///
/// # Example
/// ```ignore
/// use wireloop::{ListenCfg, Family};
///
/// let cfg = ListenCfg::new(6667)
///     .name("listener/plain")
///     .family(Family::V4Only)
///     .read_line(true)
///     .max_conns(64);
/// ```
#[derive(Debug, Clone)]
pub struct ListenCfg {
	pub(crate) port: u16,
	pub(crate) name: String,
	pub(crate) bind_host: String,
	pub(crate) family: Family,
	pub(crate) tls: Option<TlsListenCfg>,
	pub(crate) max_conns: i32,
	pub(crate) timeout: Duration,
	pub(crate) timeout_scope: u8,
	pub(crate) reuse_addr: bool,
	pub(crate) max_buffer: usize,
	pub(crate) line_mode: bool,
	pub(crate) tcp: TcpCfg,
}

impl ListenCfg {
	/// Listen on `port`; 0 asks the kernel for an ephemeral port, which
	/// [`Mux::listen`](crate::Mux::listen) reports back.
	pub fn new(port: u16) -> Self {
		Self {
			port,
			name: format!("listener:{}", port),
			bind_host: String::new(),
			family: Family::Any,
			tls: None,
			max_conns: libc::SOMAXCONN,
			timeout: Duration::ZERO,
			timeout_scope: TMO_ALL,
			reuse_addr: true,  // servers restart; TIME_WAIT must not block them
			max_buffer: 1024,
			line_mode: false,
			tcp: TcpCfg::default(),
		}
	}

	pub fn name(mut self, name: &str) -> Self {
		self.name = name.to_string();
		self
	}

	/// Local address to bind; empty binds the wildcard.
	pub fn bind_host(mut self, host: &str) -> Self {
		self.bind_host = host.to_string();
		self
	}

	pub fn family(mut self, family: Family) -> Self {
		self.family = family;
		self
	}

	/// Accepted sockets run the TLS server handshake before they are
	/// considered connected.
	pub fn tls(mut self, tls: TlsListenCfg) -> Self {
		self.tls = Some(tls);
		self
	}

	/// Pending-connection queue depth. Default: SOMAXCONN.
	pub fn max_conns(mut self, max: i32) -> Self {
		self.max_conns = max;
		self
	}

	/// Inactivity timeout inherited by accepted sockets; zero disables.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn timeout_scope(mut self, scope: u8) -> Self {
		self.timeout_scope = scope;
		self
	}

	pub fn reuse_addr(mut self, enable: bool) -> Self {
		self.reuse_addr = enable;
		self
	}

	pub fn max_buffer(mut self, bytes: usize) -> Self {
		self.max_buffer = bytes;
		self
	}

	pub fn read_line(mut self, enable: bool) -> Self {
		self.line_mode = enable;
		self
	}

	pub fn tcp(mut self, tcp: TcpCfg) -> Self {
		self.tcp = tcp;
		self
	}
}
