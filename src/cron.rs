//! Cooperative timed jobs.
//!
//! A cron is ticked once per engine iteration by its owner (the multiplexer
//! or a single socket). There is no timer thread: resolution is bounded by
//! how often the owner's loop runs.

use std::time::Duration;

/// Scheduling state shared by multiplexer-level and socket-level jobs.
///
/// The job callback receives `&mut CronTimer` so it can stop, pause or
/// reschedule itself from inside a run.
#[derive(Debug)]
pub struct CronTimer {
    name: String,
    next_run_ms: u64,
    interval: Duration,
    max_cycles: u32,
    cycles: u32,
    active: bool,
    paused: bool,
    run_now: bool,
}

impl CronTimer {
    pub(crate) fn new(name: &str, start_ms: u64, interval: Duration, max_cycles: u32) -> Self {
        Self {
            name: name.to_string(),
            next_run_ms: start_ms + interval.as_millis() as u64,
            interval,
            max_cycles,
            cycles: 0,
            active: true,
            paused: false,
            run_now: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the job; the owner removes it on the next pass.
    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Suspends runs without losing the schedule.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }

    /// Forces the job to run on the next tick regardless of its timer.
    pub fn run_now(&mut self) {
        self.run_now = true;
    }

    /// Reschedules with a new interval, keeping the cycle budget.
    pub fn set_interval(&mut self, now_ms: u64, interval: Duration) {
        self.interval = interval;
        self.next_run_ms = now_ms + interval.as_millis() as u64;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn cycles_left(&self) -> u32 {
        if self.max_cycles > self.cycles {
            self.max_cycles - self.cycles
        } else {
            0
        }
    }

    pub(crate) fn should_run(&self, now_ms: u64) -> bool {
        !self.paused && self.active && (self.run_now || now_ms >= self.next_run_ms)
    }

    /// Post-run bookkeeping: burn a cycle or schedule the next run.
    pub(crate) fn ran(&mut self, now_ms: u64) {
        self.run_now = false;
        if self.max_cycles > 0 {
            self.cycles += 1;
            if self.cycles >= self.max_cycles {
                self.active = false;
                return;
            }
        }
        self.next_run_ms = now_ms + self.interval.as_millis() as u64;
    }

    /// When this timer next wants to run, for dynamic loop timeouts.
    pub(crate) fn next_due_ms(&self) -> Option<u64> {
        if !self.active || self.paused {
            return None;
        }
        if self.run_now {
            return Some(0);
        }
        Some(self.next_run_ms)
    }
}

/// A multiplexer-level job.
pub struct MuxCron {
    pub(crate) timer: CronTimer,
    job: Box<dyn FnMut(&mut CronTimer)>,
}

impl MuxCron {
    /// Runs forever every `interval`.
    pub fn new<F>(name: &str, start_ms: u64, interval: Duration, job: F) -> Self
    where
        F: FnMut(&mut CronTimer) + 'static,
    {
        Self::with_max_cycles(name, start_ms, interval, 0, job)
    }

    /// Runs `max_cycles` times (0 = forever), then deactivates.
    pub fn with_max_cycles<F>(
        name: &str,
        start_ms: u64,
        interval: Duration,
        max_cycles: u32,
        job: F,
    ) -> Self
    where
        F: FnMut(&mut CronTimer) + 'static,
    {
        Self {
            timer: CronTimer::new(name, start_ms, interval, max_cycles),
            job: Box::new(job),
        }
    }

    pub fn timer(&self) -> &CronTimer {
        &self.timer
    }

    pub(crate) fn tick(&mut self, now_ms: u64) {
        if self.timer.should_run(now_ms) {
            (self.job)(&mut self.timer);
            self.timer.ran(now_ms);
        }
    }
}
