//! One connection endpoint: its descriptors, connection state machine,
//! buffers, TLS sub-state, rate limit and attached jobs/monitors.

mod buffer;
mod cfg;
mod conn;
mod dial;
pub(crate) mod io;
mod rate;

pub use self::buffer::LineBuffer;
pub use self::cfg::{ConnectCfg, KeepaliveCfg, ListenCfg, TcpCfg};
pub use self::conn::{Conn, ConnCron, ConnCtx};
pub use self::rate::RateShaper;

pub(crate) use self::conn::TlsState;
pub(crate) use self::dial::Step;

/// Which side of the engine a socket sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// We dialed out.
	Outbound,
	/// Accepting connections.
	Listener,
	/// Handed to us by a listener's accept.
	Inbound,
}

/// Connection establishment progress.
///
/// Only ever moves forward, with one exception: the single IPv6→IPv4
/// fallback retry resets `Connect` back to `DestDns`. `Established` is
/// terminal and the only state in which application I/O is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
	/// Resolve the bind host, if one is configured.
	Start,
	/// Create the socket and bind it to the resolved vhost.
	BindVhost,
	/// Resolve the destination hostname.
	DestDns,
	/// Non-blocking connect in flight.
	Connect,
	/// TLS handshake in flight.
	ConnectTls,
	/// Application I/O.
	Established,
}

/// What the owner wants done with a socket. Consumed by the multiplexer
/// at the top of the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseIntent {
	None,
	/// Tear down before the next poll.
	Now,
	/// Tear down once the outbound buffer has drained.
	AfterFlush,
	/// Remove bookkeeping without firing disconnect callbacks; the
	/// descriptor has been transferred to a replacement socket.
	Detach,
}

/// Timeout scope bits: which activity resets the inactivity timer.
pub const TMO_READ: u8 = 0x1;
pub const TMO_WRITE: u8 = 0x2;
pub const TMO_ACCEPT: u8 = 0x4;
pub const TMO_ALL: u8 = TMO_READ | TMO_WRITE | TMO_ACCEPT;

/// Why a socket is being torn down; selects the terminal callback.
/// Exactly one terminal callback fires per socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DropReason {
	/// Peer closed; fires `on_disconnected`.
	Eof,
	/// OS error; fires `on_sock_error`.
	SockErr(i32),
	/// Fires `on_connection_refused`.
	Refused,
	/// Inactivity; fires `on_timeout`.
	TimedOut,
	/// Owner asked; fires `on_disconnected` if the socket was up.
	Closed,
	/// Logically replaced; no callbacks at all.
	Detached,
}

/// The callback surface a higher layer implements per socket.
///
/// Every method has a no-op default, so handlers implement only what
/// they care about. Terminal callbacks (`on_disconnected`, `on_timeout`,
/// `on_connection_refused`, `on_sock_error`) are invoked at most once,
/// after which the socket is removed from its multiplexer.
pub trait ConnHandler {
	/// The socket reached `Established` (TLS handshake included).
	fn on_connected(&mut self, _ctx: &mut ConnCtx) {}

	/// The peer closed, or the owner closed an established socket.
	fn on_disconnected(&mut self, _ctx: &mut ConnCtx) {}

	/// The inactivity timeout expired.
	fn on_timeout(&mut self, _ctx: &mut ConnCtx) {}

	/// The remote end refused the connection.
	fn on_connection_refused(&mut self, _ctx: &mut ConnCtx) {}

	/// A non-recoverable OS error; `errno` is the raw code.
	fn on_sock_error(&mut self, _ctx: &mut ConnCtx, _errno: i32) {}

	/// Raw bytes as they arrive, before line scanning.
	fn on_read_data(&mut self, _ctx: &mut ConnCtx, _data: &[u8]) {}

	/// One complete line, terminator included. Only fires when line mode
	/// is enabled on the socket.
	fn on_read_line(&mut self, _ctx: &mut ConnCtx, _line: &[u8]) {}

	/// The unterminated inbound tail crossed the configured threshold.
	/// Default policy: drop the connection — this is the backpressure
	/// boundary against a peer that never sends a terminator.
	fn on_reached_max_buffer(&mut self, ctx: &mut ConnCtx) {
		log::warn!("[{}] max buffer reached, closing", ctx.name());
		ctx.close(CloseIntent::Now);
	}

	/// Fired during the timeout sweep while reads are paused.
	fn on_read_paused(&mut self, _ctx: &mut ConnCtx) {}

	/// Listener gate: accept or reject an incoming connection.
	fn on_connection_from(&mut self, _host: &str, _port: u16) -> bool {
		true
	}

	/// Listener factory: build the handler for an accepted socket.
	/// `None` installs a no-op handler.
	fn on_accept(&mut self, _host: &str, _port: u16) -> Option<Box<dyn ConnHandler>> {
		None
	}
}

/// The handler installed when a listener's factory declines to build one.
pub struct NullHandler;

impl ConnHandler for NullHandler {}
