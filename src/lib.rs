//! wireloop — a single-threaded, non-blocking, multiplexed socket engine.
//!
//! Built as the connection core of a persistent IRC bouncer: one engine
//! keeps an authenticated link to each remote network while multiplexing
//! any number of local client connections, across disconnects and
//! reconnects. Every endpoint — outbound, listener or accepted — is a
//! state machine walked through DNS, bind, connect and TLS by one
//! readiness poll per iteration; nothing blocks except that poll.

pub mod addr;
pub mod clock;
pub mod cron;
pub mod error;
pub mod monitor;
pub mod poll;
pub mod resolve;
pub mod sock;
pub mod tls;

mod mux;

pub use self::addr::{Family, SockAddr};
pub use self::cron::{CronTimer, MuxCron};
pub use self::error::{IoError, ResolveError, SocketError, TlsError, errno};
pub use self::monitor::FdMonitor;
pub use self::mux::Mux;
pub use self::poll::{Readiness, WANT_READ, WANT_WRITE};
pub use self::resolve::{BlockingResolver, Resolve, Resolver, ThreadedResolver};
pub use self::sock::{CloseIntent, Conn, ConnCron, ConnCtx, ConnHandler, ConnState,
					 ConnectCfg, KeepaliveCfg, LineBuffer, ListenCfg, NullHandler,
					 RateShaper, Role, TcpCfg,
					 TMO_ACCEPT, TMO_ALL, TMO_READ, TMO_WRITE};
pub use self::tls::{ClientAuth, TlsConnectCfg, TlsListenCfg, Verify};
