//! Hostname resolution strategies.
//!
//! The engine never blocks mid-loop, so a resolver answers with a
//! tri-state [`Resolve`]: the caller keeps its socket parked in a DNS
//! state and asks again next iteration on `Retry`. Two strategies ship:
//!
//! * [`BlockingResolver`] — getaddrinfo inline. Violates the
//!   non-blocking contract; tolerated for bind-host (vhost) lookups and
//!   for tests.
//! * [`ThreadedResolver`] — getaddrinfo on a worker thread, completion
//!   signalled through a self-pipe that joins the engine's poll set, so
//!   a pending lookup wakes the loop the moment it lands.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc;
use std::time::Duration;

use crate::addr::{Family, SockAddr};
use crate::poll::WANT_READ;

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Lookup finished; connect to this address.
    Ready(IpAddr),
    /// Not done yet, ask again next iteration.
    Retry,
    /// Lookup failed with a getaddrinfo error code.
    Failed(i32),
}

/// A pluggable hostname resolver.
pub trait Resolver {
    /// Attempts to resolve `host` under the given family preference.
    ///
    /// Must not block (the [`BlockingResolver`] is the documented
    /// exception). Called once per engine iteration per waiting socket;
    /// implementations dedupe in-flight lookups by (host, family).
    fn resolve(&mut self, host: &str, family: Family) -> Resolve;

    /// Appends resolver-owned descriptors to the engine's poll set.
    fn fill(&mut self, _out: &mut Vec<(RawFd, u8)>) {}

    /// Called when one of the descriptors from [`Resolver::fill`]
    /// reported readiness.
    fn on_ready(&mut self) {}

    /// Upper bound the resolver wants on the poll timeout.
    fn max_wait(&self) -> Option<Duration> {
        None
    }
}

/// Literal addresses ("127.0.0.1", "::1") short-circuit every strategy.
fn parse_literal(host: &str, family: Family) -> Option<Resolve> {
    let ip: IpAddr = host.parse().ok()?;
    let ok = match family {
        Family::Any => true,
        Family::V4Only => ip.is_ipv4(),
        Family::V6Only => ip.is_ipv6(),
    };
    if ok {
        Some(Resolve::Ready(ip))
    } else {
        Some(Resolve::Failed(libc::EAI_FAMILY))
    }
}

/// Prefer AAAA under `Any`; otherwise the first record of the family.
fn pick(addrs: &[IpAddr], family: Family) -> Option<IpAddr> {
    match family {
        Family::Any => addrs
            .iter()
            .find(|a| a.is_ipv6())
            .or_else(|| addrs.first())
            .copied(),
        Family::V4Only => addrs.iter().find(|a| a.is_ipv4()).copied(),
        Family::V6Only => addrs.iter().find(|a| a.is_ipv6()).copied(),
    }
}

/// One getaddrinfo call, returning every stream address it produced.
fn lookup_host(host: &str, family: Family) -> Result<Vec<IpAddr>, i32> {
    let c_host = CString::new(host).map_err(|_| libc::EAI_NONAME)?;
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = family.ai_family();
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(c_host.as_ptr(), std::ptr::null(), &hints, &mut res)
    };
    if rc != 0 {
        return Err(rc);
    }

    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if !ai.ai_addr.is_null() {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = (ai.ai_addrlen as usize)
                .min(std::mem::size_of::<libc::sockaddr_storage>());
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ai.ai_addr as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    len,
                );
            }
            if let Some(sa) = unsafe { SockAddr::from_storage(&storage, len as libc::socklen_t) } {
                out.push(sa.ip());
            }
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };

    if out.is_empty() {
        Err(libc::EAI_NONAME)
    } else {
        Ok(out)
    }
}

/// Inline getaddrinfo. Blocks the calling thread for the duration of the
/// lookup — never acceptable inside the engine loop for destination
/// hostnames, tolerable for bind hosts where a brief stall at connect
/// setup is accepted.
#[derive(Default)]
pub struct BlockingResolver;

impl BlockingResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolver for BlockingResolver {
    fn resolve(&mut self, host: &str, family: Family) -> Resolve {
        if let Some(r) = parse_literal(host, family) {
            return r;
        }
        match lookup_host(host, family) {
            Ok(addrs) => match pick(&addrs, family) {
                Some(ip) => Resolve::Ready(ip),
                None => Resolve::Failed(libc::EAI_FAMILY),
            },
            Err(code) => Resolve::Failed(code),
        }
    }
}

type Key = (String, Family);

struct Request {
    key: Key,
}

struct Response {
    key: Key,
    result: Result<Vec<IpAddr>, i32>,
}

/// getaddrinfo on a worker thread.
///
/// `resolve` returns `Retry` until the worker posts its answer; the
/// worker pokes a self-pipe after each answer and the pipe's read end
/// joins the engine's poll set, so the loop wakes without spinning.
pub struct ThreadedResolver {
    tx: mpsc::Sender<Request>,
    rx: mpsc::Receiver<Response>,
    pipe_r: OwnedFd,
    pending: HashSet<Key>,
    done: HashMap<Key, Result<Vec<IpAddr>, i32>>,
}

impl ThreadedResolver {
    pub fn new() -> std::io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc == -1 {
            return Err(std::io::Error::from_raw_os_error(crate::error::errno()));
        }
        let pipe_r = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let pipe_w = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (resp_tx, resp_rx) = mpsc::channel::<Response>();

        let _worker = std::thread::Builder::new()
            .name("wireloop-dns".into())
            .spawn(move || {
                // exits when the engine side drops its sender
                while let Ok(req) = req_rx.recv() {
                    let result = lookup_host(&req.key.0, req.key.1);
                    let key = req.key;
                    if resp_tx.send(Response { key, result }).is_err() {
                        break;
                    }
                    let byte = [1u8];
                    unsafe {
                        // best effort: a full pipe still leaves the
                        // response in the channel for the next drain
                        libc::write(pipe_w.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1);
                    }
                }
            })?;

        Ok(Self {
            tx: req_tx,
            rx: resp_rx,
            pipe_r,
            pending: HashSet::new(),
            done: HashMap::new(),
        })
    }

    fn drain_responses(&mut self) {
        while let Ok(resp) = self.rx.try_recv() {
            self.pending.remove(&resp.key);
            self.done.insert(resp.key, resp.result);
        }
    }

    fn drain_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.pipe_r.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Resolver for ThreadedResolver {
    fn resolve(&mut self, host: &str, family: Family) -> Resolve {
        if let Some(r) = parse_literal(host, family) {
            return r;
        }
        self.drain_responses();

        let key = (host.to_string(), family);
        if let Some(result) = self.done.remove(&key) {
            return match result {
                Ok(addrs) => match pick(&addrs, family) {
                    Some(ip) => Resolve::Ready(ip),
                    None => Resolve::Failed(libc::EAI_FAMILY),
                },
                Err(code) => Resolve::Failed(code),
            };
        }
        if self.pending.contains(&key) {
            return Resolve::Retry;
        }

        log::trace!("dns: queueing lookup of {} ({:?})", host, family);
        self.pending.insert(key.clone());
        if self.tx.send(Request { key }).is_err() {
            // worker died; treat as a hard failure rather than retry forever
            return Resolve::Failed(libc::EAI_FAIL);
        }
        Resolve::Retry
    }

    fn fill(&mut self, out: &mut Vec<(RawFd, u8)>) {
        out.push((self.pipe_r.as_raw_fd(), WANT_READ));
    }

    fn on_ready(&mut self) {
        self.drain_pipe();
        self.drain_responses();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_v4_is_immediate() {
        let mut r = BlockingResolver::new();
        assert_eq!(
            r.resolve("127.0.0.1", Family::Any),
            Resolve::Ready("127.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn literal_with_wrong_family_fails() {
        let mut r = BlockingResolver::new();
        assert_eq!(
            r.resolve("::1", Family::V4Only),
            Resolve::Failed(libc::EAI_FAMILY)
        );
    }

    #[test]
    fn localhost_resolves_blocking() {
        let mut r = BlockingResolver::new();
        match r.resolve("localhost", Family::Any) {
            Resolve::Ready(ip) => assert!(ip.is_loopback()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn threaded_retries_then_resolves() {
        let mut r = ThreadedResolver::new().unwrap();
        let mut answer = r.resolve("localhost", Family::Any);
        // first call queues the lookup; poll the strategy like the
        // engine loop would until the worker answers
        let mut spins = 0;
        while answer == Resolve::Retry {
            std::thread::sleep(Duration::from_millis(5));
            spins += 1;
            assert!(spins < 1000, "lookup never completed");
            answer = r.resolve("localhost", Family::Any);
        }
        match answer {
            Resolve::Ready(ip) => assert!(ip.is_loopback()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn pick_prefers_v6_under_any() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(pick(&[v4, v6], Family::Any), Some(v6));
        assert_eq!(pick(&[v4, v6], Family::V4Only), Some(v4));
        assert_eq!(pick(&[v4], Family::V6Only), None);
    }
}
