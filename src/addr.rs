//! Runtime socket addresses.
//!
//! The engine only learns the address family after DNS has answered, so
//! unlike a typestate socket layer the family here is a runtime value: a
//! `SockAddr` wraps whichever raw sockaddr the lookup produced and hands it
//! to syscalls through the closure-based `with_raw` pattern (the
//! stack-allocated struct must stay alive across the call).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address-family preference for outbound connections and listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
	/// Use whatever the resolver prefers (IPv6 first, IPv4 fallback).
	Any,
	/// Restrict to IPv4.
	V4Only,
	/// Restrict to IPv6.
	V6Only,
}

impl Family {
	/// The getaddrinfo hint family for this preference.
	pub(crate) fn ai_family(self) -> libc::c_int {
		match self {
			Family::Any => libc::AF_UNSPEC,
			Family::V4Only => libc::AF_INET,
			Family::V6Only => libc::AF_INET6,
		}
	}
}

/// A resolved (IP, port) endpoint, convertible to raw sockaddr forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
	ip: IpAddr,
	port: u16,
}

impl SockAddr {
	pub fn new(ip: IpAddr, port: u16) -> Self {
		Self { ip, port }
	}

	pub fn ip(&self) -> IpAddr {
		self.ip
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn is_ipv6(&self) -> bool {
		self.ip.is_ipv6()
	}

	/// The socket() domain matching this address.
	pub(crate) fn domain(&self) -> libc::c_int {
		if self.ip.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET }
	}

	fn to_raw_v4(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
		libc::sockaddr_in {
			sin_family: libc::AF_INET as libc::sa_family_t,
			sin_port: port.to_be(),
			sin_addr: libc::in_addr {
				s_addr: u32::from_be_bytes(ip.octets()).to_be(),
			},
			sin_zero: [0; 8],
		}
	}

	fn to_raw_v6(ip: Ipv6Addr, port: u16) -> libc::sockaddr_in6 {
		let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
		raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
		raw.sin6_port = port.to_be();
		raw.sin6_addr.s6_addr = ip.octets();
		raw
	}

	/// Calls `f` with a pointer to the raw sockaddr and its size.
	pub(crate) fn with_raw<F, R>(&self, f: F) -> R
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		match self.ip {
			IpAddr::V4(ip) => {
				let raw = Self::to_raw_v4(ip, self.port);
				let ptr = &raw as *const _ as *const libc::sockaddr;
				let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
				f(ptr, len)
			}
			IpAddr::V6(ip) => {
				let raw = Self::to_raw_v6(ip, self.port);
				let ptr = &raw as *const _ as *const libc::sockaddr;
				let len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
				f(ptr, len)
			}
		}
	}

	/// Reads an address back out of a sockaddr_storage filled in by the
	/// kernel (accept, getsockname, getpeername).
	///
	/// # Safety
	/// `storage` must hold a sockaddr of at least `len` valid bytes.
	pub(crate) unsafe fn from_storage(
		storage: *const libc::sockaddr_storage,
		len: libc::socklen_t,
	) -> Option<Self> {
		if len < std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t {
			return None;
		}
		let family = unsafe { (*storage).ss_family } as libc::c_int;
		match family {
			libc::AF_INET => {
				if len < std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
					return None;
				}
				let raw = unsafe { &*(storage as *const libc::sockaddr_in) };
				let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
				Some(Self::new(IpAddr::V4(ip), u16::from_be(raw.sin_port)))
			}
			libc::AF_INET6 => {
				if len < std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t {
					return None;
				}
				let raw = unsafe { &*(storage as *const libc::sockaddr_in6) };
				let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);
				Some(Self::new(IpAddr::V6(ip), u16::from_be(raw.sin6_port)))
			}
			_ => None,
		}
	}

	/// The wildcard bind address for a family preference.
	///
	/// `Any` binds the IPv6 wildcard, which on Linux accepts v4-mapped
	/// connections as well unless IPV6_V6ONLY was set.
	pub(crate) fn wildcard(family: Family, port: u16) -> Self {
		match family {
			Family::V4Only => Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
			Family::Any | Family::V6Only => Self::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
		}
	}
}

impl std::fmt::Display for SockAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.ip {
			IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
			IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn v4_round_trips_through_raw() {
		let addr = SockAddr::new("192.168.1.7".parse().unwrap(), 6667);
		let back = addr.with_raw(|ptr, len| {
			let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
			unsafe {
				std::ptr::copy_nonoverlapping(
					ptr as *const u8,
					&mut storage as *mut _ as *mut u8,
					len as usize,
				);
				SockAddr::from_storage(&storage, len)
			}
		});
		assert_eq!(back, Some(addr));
	}

	#[test]
	fn v6_round_trips_through_raw() {
		let addr = SockAddr::new("::1".parse().unwrap(), 443);
		let back = addr.with_raw(|ptr, len| {
			let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
			unsafe {
				std::ptr::copy_nonoverlapping(
					ptr as *const u8,
					&mut storage as *mut _ as *mut u8,
					len as usize,
				);
				SockAddr::from_storage(&storage, len)
			}
		});
		assert_eq!(back, Some(addr));
	}

	#[test]
	fn short_storage_is_rejected() {
		let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
		assert_eq!(unsafe { SockAddr::from_storage(&storage, 1) }, None);
	}
}
