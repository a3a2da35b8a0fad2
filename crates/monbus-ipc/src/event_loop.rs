//! Poll-based event loop
//!
//! The loop does not own its sources. Each iteration the caller lists the
//! descriptors it is interested in, `wait()` blocks in `poll(2)` until one
//! is ready or the armed timer runs out, and the caller dispatches on the
//! returned readiness. A one-shot timer bounds the wait; it is disarmed by
//! the caller as soon as the wait is over.

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use monbus_util::Timeout;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::IpcResult;

/// Readiness a source wants to be woken for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    fn poll_flags(&self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// A descriptor registered for one wait
#[derive(Debug, Clone, Copy)]
pub struct Source<'fd> {
    pub fd: BorrowedFd<'fd>,
    pub interest: Interest,
}

impl<'fd> Source<'fd> {
    pub fn new(fd: BorrowedFd<'fd>, interest: Interest) -> Self {
        Self { fd, interest }
    }
}

/// What a wait reported for one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_revents(revents: PollFlags) -> Self {
        // Hangups and errors surface through the next read
        let readable = revents.intersects(
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
        );
        Self {
            readable,
            writable: revents.contains(PollFlags::POLLOUT),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Single-threaded event loop with one timer
#[derive(Debug, Default)]
pub struct EventLoop {
    deadline: Option<Instant>,
    waits: u64,
    blocking_waits: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer. `Forever` leaves it disarmed.
    pub fn arm_timer(&mut self, timeout: Timeout) {
        self.deadline = timeout.deadline_from(Instant::now());
    }

    pub fn disarm_timer(&mut self) {
        self.deadline = None;
    }

    pub fn is_timer_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn timer_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Total number of waits
    pub fn waits(&self) -> u64 {
        self.waits
    }

    /// Number of waits that were allowed to block
    pub fn blocking_waits(&self) -> u64 {
        self.blocking_waits
    }

    /// Wait for readiness of `sources`, bounded by the timer.
    ///
    /// Returns one `Readiness` per source, in order. An interrupted wait
    /// reports nothing ready.
    pub fn wait(&mut self, sources: &[Source<'_>]) -> IpcResult<Vec<Readiness>> {
        let remaining = self.remaining();

        self.waits += 1;
        if remaining.is_none_or(|r| !r.is_zero()) {
            self.blocking_waits += 1;
        }

        let mut fds: Vec<PollFd<'_>> = sources
            .iter()
            .map(|source| PollFd::new(source.fd, source.interest.poll_flags()))
            .collect();

        match poll(&mut fds, poll_timeout(remaining)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(vec![Readiness::default(); sources.len()]),
            Err(e) => return Err(std::io::Error::from(e).into()),
        }

        Ok(fds
            .iter()
            .map(|fd| Readiness::from_revents(fd.revents().unwrap_or(PollFlags::empty())))
            .collect())
    }

    /// Time left on the timer, `None` when disarmed
    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

fn poll_timeout(remaining: Option<Duration>) -> PollTimeout {
    let Some(remaining) = remaining else {
        return PollTimeout::NONE;
    };

    if remaining.is_zero() {
        return PollTimeout::ZERO;
    }

    // Round up so the timer never fires early
    let millis = remaining.as_micros().div_ceil(1000);
    let millis = i32::try_from(millis).unwrap_or(i32::MAX);
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::NONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn immediate_wait_does_not_block() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut event_loop = EventLoop::new();

        event_loop.arm_timer(Timeout::Immediate);
        let ready = event_loop
            .wait(&[Source::new(a.as_fd(), Interest::READ)])
            .unwrap();
        event_loop.disarm_timer();

        assert!(ready[0].is_empty());
        assert_eq!(event_loop.waits(), 1);
        assert_eq!(event_loop.blocking_waits(), 0);
        assert!(!event_loop.is_timer_armed());
    }

    #[test]
    fn timer_bounds_the_wait() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut event_loop = EventLoop::new();
        let timeout = Duration::from_millis(50);

        let start = Instant::now();
        event_loop.arm_timer(Timeout::After(timeout));
        while !event_loop.timer_expired() {
            event_loop
                .wait(&[Source::new(a.as_fd(), Interest::READ)])
                .unwrap();
        }
        event_loop.disarm_timer();

        assert!(start.elapsed() >= timeout);
        assert!(event_loop.blocking_waits() >= 1);
    }

    #[test]
    fn reports_readable_and_writable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();

        let mut event_loop = EventLoop::new();
        event_loop.arm_timer(Timeout::from_secs(1));
        let ready = event_loop
            .wait(&[Source::new(a.as_fd(), Interest::READ_WRITE)])
            .unwrap();

        assert!(ready[0].readable);
        assert!(ready[0].writable);
    }

    #[test]
    fn hangup_is_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);

        let mut event_loop = EventLoop::new();
        event_loop.arm_timer(Timeout::from_secs(1));
        let ready = event_loop
            .wait(&[Source::new(a.as_fd(), Interest::READ)])
            .unwrap();

        assert!(ready[0].readable);
    }

    #[test]
    fn forever_leaves_timer_disarmed() {
        let mut event_loop = EventLoop::new();
        event_loop.arm_timer(Timeout::Forever);
        assert!(!event_loop.is_timer_armed());
        assert!(!event_loop.timer_expired());
    }
}
