//! Monotonic millisecond timestamps.
//!
//! Rate shaping, timeouts and cron scheduling all do arithmetic on these.
//! CLOCK_MONOTONIC so a wall-clock step (NTP, DST) cannot fire timers early.

/// Returns milliseconds from an arbitrary fixed origin.
///
/// Only differences between two calls are meaningful.
pub fn now_ms() -> u64 {
	let mut ts = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0,
	};
	let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
	if rc == -1 {
		// clock_gettime on a valid clockid cannot fail on Linux
		return 0;
	}
	(ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

#[cfg(test)]
mod tests {
	use super::now_ms;

	#[test]
	fn monotonic_between_calls() {
		let a = now_ms();
		let b = now_ms();
		assert!(b >= a);
	}
}
