//! Completion fences
//!
//! An out-fence returned by an atomic commit is a sync file: it polls readable
//! once the hardware has latched the new configuration and released the
//! buffers of the previous one.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::error::FenceError;

/// Shared, reference-counted sync file handle
#[derive(Debug, Clone)]
pub struct CompletionFence {
    fd: Arc<OwnedFd>,
}

impl CompletionFence {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Arc::new(fd) }
    }

    /// Block until the fence signals or `timeout` elapses.
    ///
    /// Retries on EINTR with the remaining time budget.
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout_ms = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

            let mut fds = [PollFd::new(&*self.fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout_ms) {
                Ok(0) => return Err(FenceError::Timeout(timeout.as_millis() as u64)),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                        return Err(FenceError::Io(io::Error::from_raw_os_error(libc::EINVAL)));
                    }
                    return Ok(());
                }
                // Retry with what is left of the budget
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(FenceError::Io(e.into())),
            }
        }
    }

    /// Whether two handles refer to the same underlying fence
    pub fn same_as(&self, other: &CompletionFence) -> bool {
        Arc::ptr_eq(&self.fd, &other.fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for CompletionFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<OwnedFd> for CompletionFence {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}
