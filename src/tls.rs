//! TLS sub-state for sockets.
//!
//! One rustls connection per socket, client or server role behind a single
//! enum. The record layer owns its pending ciphertext internally, so a
//! partially-flushed write is always retried from the identical bytes; the
//! engine only sees wants_read/wants_write and drives the descriptor.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
	ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig,
	ServerConnection, SignatureScheme,
};

use crate::error::{TlsError, errno};

static TLS_INIT: Once = Once::new();

/// Installs the process-wide crypto provider.
///
/// Safe to call any number of times; only the first has any effect. The
/// engine calls it before building any TLS config, so explicit calls are
/// only needed when an application builds rustls configs of its own first.
pub fn init() {
	TLS_INIT.call_once(|| {
		let _ = rustls::crypto::ring::default_provider().install_default();
	});
}

/// Server-certificate checking policy for outbound TLS.
#[derive(Debug, Clone)]
pub enum Verify {
	/// Verify against CA roots loaded from a PEM file.
	Roots(PathBuf),
	/// Accept any certificate. IRC networks routinely run self-signed,
	/// so this is a first-class policy rather than a debug hack.
	Insecure,
}

/// Client-certificate policy for TLS listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
	/// Never ask for a client certificate.
	None,
	/// Request one, accept the connection without it.
	Request,
	/// Require a certificate chaining to the configured roots.
	Require,
}

/// Outbound TLS configuration.
#[derive(Debug, Clone)]
pub struct TlsConnectCfg {
	pub verify: Verify,
	/// SNI override; defaults to the hostname being connected to.
	pub server_name: Option<String>,
}

impl Default for TlsConnectCfg {
	fn default() -> Self {
		Self {
			verify: Verify::Insecure,
			server_name: None,
		}
	}
}

/// Listener TLS configuration: certificate chain, key, client-cert policy.
#[derive(Debug, Clone)]
pub struct TlsListenCfg {
	pub cert_chain: PathBuf,
	pub key: PathBuf,
	pub client_auth: ClientAuth,
	/// CA roots for verifying client certificates; required when
	/// `client_auth` is `Request` or `Require`.
	pub roots: Option<PathBuf>,
}

impl TlsListenCfg {
	pub fn new(cert_chain: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
		Self {
			cert_chain: cert_chain.into(),
			key: key.into(),
			client_auth: ClientAuth::None,
			roots: None,
		}
	}
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let file = File::open(path).map_err(|e| TlsError::Config {
		reason: format!("open {}: {}", path.display(), e),
	})?;
	let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
		.collect::<Result<_, _>>()
		.map_err(|_| TlsError::Pem {
			path: path.display().to_string(),
		})?;
	if certs.is_empty() {
		return Err(TlsError::Pem {
			path: path.display().to_string(),
		});
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
	let file = File::open(path).map_err(|e| TlsError::Config {
		reason: format!("open {}: {}", path.display(), e),
	})?;
	rustls_pemfile::private_key(&mut BufReader::new(file))
		.map_err(|_| TlsError::Pem {
			path: path.display().to_string(),
		})?
		.ok_or_else(|| TlsError::Pem {
			path: path.display().to_string(),
		})
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
	let mut roots = RootCertStore::empty();
	for cert in load_certs(path)? {
		roots.add(cert).map_err(TlsError::Session)?;
	}
	Ok(roots)
}

/// Accepts any server certificate; only the TLS transport itself is wanted.
#[derive(Debug)]
struct AcceptAnyCert {
	schemes: Vec<SignatureScheme>,
}

impl AcceptAnyCert {
	fn new() -> Self {
		let provider = rustls::crypto::ring::default_provider();
		Self {
			schemes: provider.signature_verification_algorithms.supported_schemes(),
		}
	}
}

impl ServerCertVerifier for AcceptAnyCert {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.schemes.clone()
	}
}

pub(crate) fn build_client_config(cfg: &TlsConnectCfg) -> Result<Arc<ClientConfig>, TlsError> {
	init();
	let config = match &cfg.verify {
		Verify::Roots(path) => {
			let roots = load_roots(path)?;
			ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		Verify::Insecure => ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
			.with_no_client_auth(),
	};
	Ok(Arc::new(config))
}

pub(crate) fn build_server_config(cfg: &TlsListenCfg) -> Result<Arc<ServerConfig>, TlsError> {
	init();
	let chain = load_certs(&cfg.cert_chain)?;
	let key = load_key(&cfg.key)?;

	let builder = match cfg.client_auth {
		ClientAuth::None => ServerConfig::builder().with_no_client_auth(),
		ClientAuth::Request | ClientAuth::Require => {
			let roots = match &cfg.roots {
				Some(path) => Arc::new(load_roots(path)?),
				None => {
					return Err(TlsError::Config {
						reason: "client_auth requires a roots file".into(),
					});
				}
			};
			let mut verifier = WebPkiClientVerifier::builder(roots);
			if cfg.client_auth == ClientAuth::Request {
				verifier = verifier.allow_unauthenticated();
			}
			let verifier = verifier.build().map_err(|e| TlsError::Config {
				reason: format!("client verifier: {}", e),
			})?;
			ServerConfig::builder().with_client_cert_verifier(verifier)
		}
	};

	let config = builder
		.with_single_cert(chain, key)
		.map_err(TlsError::Session)?;
	Ok(Arc::new(config))
}

/// Borrowed Read/Write view of a raw descriptor, for feeding rustls.
///
/// errno is translated through `from_raw_os_error` so EAGAIN surfaces as
/// ErrorKind::WouldBlock, which the record pump relies on.
pub(crate) struct FdIo {
	pub fd: RawFd,
}

impl Read for FdIo {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
		if n == -1 {
			Err(io::Error::from_raw_os_error(errno()))
		} else {
			Ok(n as usize)
		}
	}
}

impl Write for FdIo {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
		if n == -1 {
			Err(io::Error::from_raw_os_error(errno()))
		} else {
			Ok(n as usize)
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// One socket's TLS session, client or server role.
pub(crate) enum TlsSession {
	Client(Box<ClientConnection>),
	Server(Box<ServerConnection>),
}

impl TlsSession {
	pub fn client(
		config: Arc<ClientConfig>,
		host: &str,
		cfg: &TlsConnectCfg,
	) -> Result<Self, TlsError> {
		let name = cfg.server_name.as_deref().unwrap_or(host);
		let server_name = ServerName::try_from(name.to_string()).map_err(|_| TlsError::Config {
			reason: format!("invalid server name {:?}", name),
		})?;
		let conn = ClientConnection::new(config, server_name).map_err(TlsError::Session)?;
		Ok(Self::Client(Box::new(conn)))
	}

	pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
		let conn = ServerConnection::new(config).map_err(TlsError::Session)?;
		Ok(Self::Server(Box::new(conn)))
	}

	pub fn read_tls(&mut self, io: &mut FdIo) -> io::Result<usize> {
		match self {
			Self::Client(c) => c.read_tls(io),
			Self::Server(c) => c.read_tls(io),
		}
	}

	pub fn write_tls(&mut self, io: &mut FdIo) -> io::Result<usize> {
		match self {
			Self::Client(c) => c.write_tls(io),
			Self::Server(c) => c.write_tls(io),
		}
	}

	pub fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
		match self {
			Self::Client(c) => c.process_new_packets(),
			Self::Server(c) => c.process_new_packets(),
		}
	}

	pub fn reader(&mut self) -> rustls::Reader<'_> {
		match self {
			Self::Client(c) => c.reader(),
			Self::Server(c) => c.reader(),
		}
	}

	pub fn writer(&mut self) -> rustls::Writer<'_> {
		match self {
			Self::Client(c) => c.writer(),
			Self::Server(c) => c.writer(),
		}
	}

	pub fn wants_read(&self) -> bool {
		match self {
			Self::Client(c) => c.wants_read(),
			Self::Server(c) => c.wants_read(),
		}
	}

	pub fn wants_write(&self) -> bool {
		match self {
			Self::Client(c) => c.wants_write(),
			Self::Server(c) => c.wants_write(),
		}
	}

	pub fn is_handshaking(&self) -> bool {
		match self {
			Self::Client(c) => c.is_handshaking(),
			Self::Server(c) => c.is_handshaking(),
		}
	}

	pub fn send_close_notify(&mut self) {
		match self {
			Self::Client(c) => c.send_close_notify(),
			Self::Server(c) => c.send_close_notify(),
		}
	}
}
